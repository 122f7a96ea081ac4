use anyhow::Result;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::{SpanExporter, WithExportConfig};
use opentelemetry_sdk::{
    trace::{SdkTracerProvider, TracerProviderBuilder},
    Resource,
};
use tracing::error;
use tracing_subscriber::{filter::LevelFilter, layer::SubscriberExt, EnvFilter, Layer};

use crate::config::ServerConfig;

const SERVICE_NAME: &str = "blob-server";

/// Crates of this workspace. Their events are kept at `info` even when
/// dependencies are quieted.
const WORKSPACE_CRATES: [&str; 4] = ["blob_server", "blob_store", "blob_index", "data_model"];

/// Filter from `RUST_LOG`, or `warn` for dependencies and `info` for the
/// workspace crates when it is unset or invalid.
pub fn get_env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| default_env_filter())
}

fn default_env_filter() -> EnvFilter {
    WORKSPACE_CRATES.iter().fold(
        EnvFilter::default().add_directive(LevelFilter::WARN.into()),
        |filter, krate| match format!("{}=info", krate).parse() {
            Ok(directive) => filter.add_directive(directive),
            Err(_) => filter,
        },
    )
}

pub fn get_log_layer<S>(config: &ServerConfig) -> Box<dyn Layer<S> + Send + Sync>
where
    S: for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    S: tracing::Subscriber,
{
    if config.structured_logging() {
        return Box::new(
            tracing_subscriber::fmt::layer()
                .json()
                .flatten_event(true)
                .with_current_span(true)
                .with_span_list(false),
        );
    }

    Box::new(tracing_subscriber::fmt::layer().compact())
}

/// Attributes attached to every exported span.
fn trace_resource(config: &ServerConfig) -> Resource {
    Resource::builder()
        .with_attribute(KeyValue::new("service.name", SERVICE_NAME))
        .with_attribute(KeyValue::new("service.version", env!("CARGO_PKG_VERSION")))
        .with_attribute(KeyValue::new("deployment.environment", config.env.clone()))
        .with_attribute(KeyValue::new("blob.region", config.region.clone()))
        .with_attribute(KeyValue::new("service.instance.id", config.instance_id()))
        .build()
}

pub fn setup_tracing(config: &ServerConfig) -> Result<Option<SdkTracerProvider>> {
    let env_filter_layer = get_env_filter();
    let log_layer = get_log_layer(config);
    let subscriber =
        tracing_subscriber::Registry::default().with(log_layer.with_filter(env_filter_layer));

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        error!("logger was already initiated, continuing: {:?}", e);
    }

    if !config.telemetry.enable_tracing {
        return Ok(None);
    }

    let mut span_exporter = SpanExporter::builder().with_tonic();
    if let Some(endpoint) = &config.telemetry.endpoint {
        span_exporter = span_exporter.with_endpoint(endpoint.clone());
    }
    let span_exporter = span_exporter.build()?;

    let tracer_provider = TracerProviderBuilder::default()
        .with_resource(trace_resource(config))
        .with_simple_exporter(span_exporter)
        .build();
    global::set_tracer_provider(tracer_provider.clone());

    Ok(Some(tracer_provider))
}

#[cfg(test)]
mod tests {
    use opentelemetry::Key;

    use super::*;

    #[test]
    fn test_default_filter_covers_workspace_crates() {
        let rendered = default_env_filter().to_string();
        assert!(rendered.contains("warn"));
        for krate in WORKSPACE_CRATES {
            assert!(rendered.contains(&format!("{}=info", krate)), "{}", rendered);
        }
    }

    #[test]
    fn test_trace_resource_names_the_service() {
        let mut config = ServerConfig::default();
        config.region = "eu-west".to_string();
        let resource = trace_resource(&config);

        assert_eq!(
            resource.get(&Key::new("service.name")).map(|v| v.to_string()),
            Some(SERVICE_NAME.to_string())
        );
        assert_eq!(
            resource.get(&Key::new("blob.region")).map(|v| v.to_string()),
            Some("eu-west".to_string())
        );
    }
}
