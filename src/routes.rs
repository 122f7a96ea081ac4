use std::sync::Arc;

use axum::{
    body::{Body, Bytes},
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{header, HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json,
    Router,
};
use blob_store::{
    http::{RedirectUri, HEALTH_LIVE_PATH, ON_DEMAND_REPLICATION_HEADER, SKIP_PEERS_HEADER},
    BlobMetadata,
};
use data_model::{BlobId, LastAccessTracking, NamespaceId};
use futures::{StreamExt, TryStreamExt};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use url::Url;

use crate::{
    blob_service::{BlobService, ExistsOptions, ReadOptions},
    http_objects::{
        BlobApiError,
        ExistsParams,
        GetBlobParams,
        ListParams,
        ListResponse,
        PutBlobResponse,
    },
};

#[derive(Clone)]
pub struct RouteState {
    pub blob_service: Arc<BlobService>,
}

pub fn create_routes(route_state: RouteState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::HEAD, Method::PUT, Method::DELETE])
        .allow_origin(Any)
        .allow_headers(Any);

    Router::new()
        .route(HEALTH_LIVE_PATH, get(health))
        .route(
            "/api/v1/blobs/{namespace}",
            get(list_blobs).delete(delete_namespace),
        )
        .route(
            "/api/v1/blobs/{namespace}/{blob}",
            get(get_blob)
                .head(head_blob)
                .put(put_blob)
                .delete(delete_blob),
        )
        .route(
            "/api/v1/blobs/{namespace}/{blob}/metadata",
            get(blob_metadata),
        )
        .route(
            "/api/v1/blobs/{namespace}/{blob}/redirect",
            get(read_redirect).put(write_redirect),
        )
        .layer(DefaultBodyLimit::disable())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(route_state)
}

async fn health() -> &'static str {
    "ok"
}

fn parse_blob_path(namespace: &str, blob: &str) -> Result<(NamespaceId, BlobId), BlobApiError> {
    Ok((namespace.parse()?, blob.parse()?))
}

fn header_flag(headers: &HeaderMap, name: &str) -> Option<bool> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.eq_ignore_ascii_case("true"))
}

fn on_demand_replication(headers: &HeaderMap) -> bool {
    header_flag(headers, ON_DEMAND_REPLICATION_HEADER).unwrap_or(true)
}

fn skip_peers(headers: &HeaderMap) -> bool {
    header_flag(headers, SKIP_PEERS_HEADER).unwrap_or(false)
}

async fn get_blob(
    Path((namespace, blob)): Path<(String, String)>,
    Query(params): Query<GetBlobParams>,
    headers: HeaderMap,
    State(state): State<RouteState>,
) -> Result<Response, BlobApiError> {
    let (ns, blob) = parse_blob_path(&namespace, &blob)?;
    let options = ReadOptions {
        supports_redirect: params.allow_redirect,
        on_demand_replication: on_demand_replication(&headers),
        skip_peers: skip_peers(&headers),
        tracking: LastAccessTracking::Track,
    };
    let contents = state.blob_service.get(&ns, &blob, options).await?;
    if let Some(uri) = contents.redirect_uri() {
        return Ok((StatusCode::FOUND, [(header::LOCATION, uri.to_string())]).into_response());
    }

    let length = contents.length;
    let body = Body::from_stream(contents.into_stream()?);
    Ok((
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (header::CONTENT_LENGTH, length.to_string()),
        ],
        body,
    )
        .into_response())
}

async fn head_blob(
    Path((namespace, blob)): Path<(String, String)>,
    Query(params): Query<ExistsParams>,
    headers: HeaderMap,
    State(state): State<RouteState>,
) -> Result<StatusCode, BlobApiError> {
    let (ns, blob) = parse_blob_path(&namespace, &blob)?;
    let options = ExistsOptions {
        force_check: params.force_check,
        on_demand_replication: on_demand_replication(&headers),
        skip_peers: skip_peers(&headers),
    };
    if state.blob_service.exists(&ns, &blob, options).await? {
        Ok(StatusCode::OK)
    } else {
        Ok(StatusCode::NOT_FOUND)
    }
}

async fn put_blob(
    Path((namespace, blob)): Path<(String, String)>,
    State(state): State<RouteState>,
    body: Bytes,
) -> Result<Json<PutBlobResponse>, BlobApiError> {
    let (ns, blob) = parse_blob_path(&namespace, &blob)?;
    let stored = state.blob_service.put(&ns, &blob, body).await?;
    Ok(Json(PutBlobResponse {
        identifier: stored.to_hex(),
    }))
}

async fn delete_blob(
    Path((namespace, blob)): Path<(String, String)>,
    State(state): State<RouteState>,
) -> Result<StatusCode, BlobApiError> {
    let (ns, blob) = parse_blob_path(&namespace, &blob)?;
    state.blob_service.delete(&ns, &blob).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn blob_metadata(
    Path((namespace, blob)): Path<(String, String)>,
    State(state): State<RouteState>,
) -> Result<Json<BlobMetadata>, BlobApiError> {
    let (ns, blob) = parse_blob_path(&namespace, &blob)?;
    Ok(Json(state.blob_service.metadata(&ns, &blob).await?))
}

fn redirect_response(uri: Option<Url>) -> Response {
    match uri {
        Some(uri) => Json(RedirectUri { uri }).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

async fn read_redirect(
    Path((namespace, blob)): Path<(String, String)>,
    State(state): State<RouteState>,
) -> Result<Response, BlobApiError> {
    let (ns, blob) = parse_blob_path(&namespace, &blob)?;
    let uri = state.blob_service.read_redirect(&ns, &blob).await?;
    Ok(redirect_response(uri))
}

async fn write_redirect(
    Path((namespace, blob)): Path<(String, String)>,
    State(state): State<RouteState>,
) -> Result<Response, BlobApiError> {
    let (ns, blob) = parse_blob_path(&namespace, &blob)?;
    let uri = state.blob_service.write_redirect(&ns, &blob).await?;
    Ok(redirect_response(uri))
}

async fn list_blobs(
    Path(namespace): Path<String>,
    Query(params): Query<ListParams>,
    State(state): State<RouteState>,
) -> Result<Json<ListResponse>, BlobApiError> {
    let ns: NamespaceId = namespace.parse()?;
    let start_after = params
        .start_after
        .as_deref()
        .map(str::parse::<BlobId>)
        .transpose()?;
    let mut blobs: Vec<_> = state
        .blob_service
        .list(&ns, start_after)?
        .take(params.limit.saturating_add(1))
        .try_collect()
        .await?;
    let truncated = blobs.len() > params.limit;
    blobs.truncate(params.limit);
    let next_cursor = if truncated {
        blobs.last().map(|listed| listed.blob)
    } else {
        None
    };
    Ok(Json(ListResponse {
        blobs,
        truncated,
        next_cursor,
    }))
}

async fn delete_namespace(
    Path(namespace): Path<String>,
    State(state): State<RouteState>,
) -> Result<StatusCode, BlobApiError> {
    let ns: NamespaceId = namespace.parse()?;
    state.blob_service.delete_namespace(&ns).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use data_model::NamespacePolicy;
    use reqwest::Client;

    use super::*;
    use crate::testing::TestHarness;

    async fn spawn() -> (TestHarness, Url) {
        let harness = TestHarness::builder()
            .tiers(2)
            .namespace(
                "redirecting",
                NamespacePolicy {
                    allow_redirect_uris: true,
                    ..Default::default()
                },
            )
            .build();
        let url = harness.serve().await;
        (harness, url)
    }

    fn blob_url(base: &Url, ns: &str, blob: &BlobId) -> Url {
        base.join(&format!("api/v1/blobs/{}/{}", ns, blob)).unwrap()
    }

    #[tokio::test]
    async fn test_blob_lifecycle() {
        let (_harness, base) = spawn().await;
        let client = Client::new();
        let content = Bytes::from_static(b"over the wire");
        let blob = BlobId::from_content(&content);
        let url = blob_url(&base, "test", &blob);

        let response = client.put(url.clone()).body(content.clone()).send().await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let stored: PutBlobResponse = response.json().await.unwrap();
        assert_eq!(stored.identifier, blob.to_hex());

        let response = client.get(url.clone()).send().await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.content_length(), Some(content.len() as u64));
        assert_eq!(response.bytes().await.unwrap(), content);

        let response = client.head(url.clone()).send().await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let metadata: BlobMetadata = client
            .get(format!("{}/metadata", url))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(metadata.size_bytes, content.len() as u64);

        let listed: ListResponse = client
            .get(base.join("api/v1/blobs/test").unwrap())
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(listed.blobs.len(), 1);
        assert!(!listed.truncated);

        let response = client.delete(url.clone()).send().await.unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        let response = client.get(url.clone()).send().await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let response = client.head(url.clone()).send().await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let response = client.delete(url).send().await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_client_errors() {
        let (_harness, base) = spawn().await;
        let client = Client::new();
        let blob = BlobId::from_content(b"declared");

        let response = client
            .put(blob_url(&base, "test", &blob))
            .body("something else")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = client
            .get(base.join("api/v1/blobs/test/not-hex").unwrap())
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = client
            .get(blob_url(&base, "unknown", &blob))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_list_limit_and_redirects() {
        let (harness, base) = spawn().await;
        let client = Client::new();
        for i in 0..3u8 {
            let content = Bytes::from(vec![i; 4]);
            let blob = BlobId::from_content(&content);
            harness
                .service
                .put(&NamespaceId::new("test").unwrap(), &blob, content)
                .await
                .unwrap();
        }

        let listed: ListResponse = client
            .get(base.join("api/v1/blobs/test?limit=2").unwrap())
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(listed.blobs.len(), 2);
        assert!(listed.truncated);
        assert_eq!(listed.next_cursor, Some(listed.blobs[1].blob));

        // Memory stores cannot presign.
        let blob = BlobId::from_content(b"anything");
        let response = client
            .get(format!("{}/redirect", blob_url(&base, "redirecting", &blob)))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = client
            .delete(base.join("api/v1/blobs/test").unwrap())
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert!(harness.stores.iter().all(|store| store.is_empty()));
    }

    #[tokio::test]
    async fn test_list_pages_with_cursor() {
        let (harness, base) = spawn().await;
        let client = Client::new();
        let mut ids = Vec::new();
        for i in 0..7u8 {
            let content = Bytes::from(vec![i; 4]);
            let blob = BlobId::from_content(&content);
            harness
                .service
                .put(&NamespaceId::new("test").unwrap(), &blob, content)
                .await
                .unwrap();
            ids.push(blob);
        }
        ids.sort();

        let mut seen = Vec::new();
        let mut pages = 0;
        let mut url = base.join("api/v1/blobs/test?limit=3").unwrap();
        loop {
            let listed: ListResponse = client
                .get(url.clone())
                .send()
                .await
                .unwrap()
                .json()
                .await
                .unwrap();
            pages += 1;
            seen.extend(listed.blobs.iter().map(|listed| listed.blob));
            match listed.next_cursor {
                Some(cursor) => {
                    url = base
                        .join(&format!("api/v1/blobs/test?limit=3&start_after={}", cursor))
                        .unwrap();
                }
                None => break,
            }
        }
        assert_eq!(pages, 3);
        assert_eq!(seen, ids);

        let response = client
            .get(base.join("api/v1/blobs/test?start_after=not-hex").unwrap())
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_health() {
        let (_harness, base) = spawn().await;
        let response = reqwest::get(base.join("health/live").unwrap()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
