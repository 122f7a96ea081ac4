//! S3 backend: object_store for data I/O, aws-sdk-s3 for bucket provisioning
//! and presigning.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::{
    config::Region,
    presigning::PresigningConfig,
    types::{BucketLocationConstraint, CreateBucketConfiguration, PublicAccessBlockConfiguration},
    Client as S3Client,
};
use data_model::{BlobError, BlobResult};
use object_store::{aws::AmazonS3Builder, path::Path as ObjectPath};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use url::Url;

use super::object::{BucketHandle, BucketNaming, BucketProvider, ObjectBackend};
use crate::{BackendKind, NamespacePolicyResolver};

fn default_presign_expiry_secs() -> u64 {
    15 * 60
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct S3Config {
    #[serde(flatten)]
    pub naming: BucketNaming,

    #[serde(default)]
    pub region: Option<String>,

    /// Custom endpoint for S3-compatible services.
    #[serde(default)]
    pub endpoint: Option<String>,

    #[serde(default)]
    pub force_path_style: bool,

    #[serde(default)]
    pub create_bucket_if_missing: bool,

    #[serde(default = "default_presign_expiry_secs")]
    pub presign_expiry_secs: u64,
}

pub struct S3Provider {
    config: S3Config,
    client: S3Client,
}

impl S3Provider {
    pub async fn new(config: S3Config) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = &config.region {
            loader = loader.region(Region::new(region.clone()));
        }
        let sdk_config = loader.load().await;

        let mut builder = aws_sdk_s3::config::Builder::from(&sdk_config);
        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }
        builder = builder.force_path_style(config.force_path_style);
        let client = S3Client::from_conf(builder.build());

        Self { config, client }
    }
}

#[async_trait]
impl BucketProvider for S3Provider {
    fn kind(&self) -> BackendKind {
        BackendKind::S3
    }

    async fn connect(&self, bucket: &str) -> BlobResult<BucketHandle> {
        let mut builder = AmazonS3Builder::from_env().with_bucket_name(bucket);
        if let Some(region) = &self.config.region {
            builder = builder.with_region(region);
        }
        if let Some(endpoint) = &self.config.endpoint {
            builder = builder
                .with_endpoint(endpoint)
                .with_allow_http(endpoint.starts_with("http://"));
        }
        builder = builder.with_virtual_hosted_style_request(!self.config.force_path_style);
        let store = builder.build().map_err(BlobError::network)?;
        debug!(bucket = %bucket, "created S3 client");
        Ok(BucketHandle::new(bucket, Arc::new(store)))
    }

    async fn provision(&self, bucket: &str) -> BlobResult<()> {
        let mut request = self.client.create_bucket().bucket(bucket);
        if let Some(region) = self.config.region.as_deref().filter(|r| *r != "us-east-1") {
            request = request.create_bucket_configuration(
                CreateBucketConfiguration::builder()
                    .location_constraint(BucketLocationConstraint::from(region))
                    .build(),
            );
        }
        match request.send().await {
            Ok(_) => info!(bucket = %bucket, "created bucket"),
            Err(e) => {
                let err = e.into_service_error();
                if !(err.is_bucket_already_owned_by_you() || err.is_bucket_already_exists()) {
                    return Err(BlobError::network(err));
                }
            }
        }

        self.client
            .put_public_access_block()
            .bucket(bucket)
            .public_access_block_configuration(
                PublicAccessBlockConfiguration::builder()
                    .block_public_acls(true)
                    .ignore_public_acls(true)
                    .block_public_policy(true)
                    .restrict_public_buckets(true)
                    .build(),
            )
            .send()
            .await
            .map_err(|e| BlobError::network(e.into_service_error()))?;
        Ok(())
    }

    async fn presign(
        &self,
        handle: &BucketHandle,
        path: &ObjectPath,
        method: Method,
        expires_in: Duration,
    ) -> BlobResult<Option<Url>> {
        let presigning_config = PresigningConfig::expires_in(expires_in).map_err(|e| {
            BlobError::invalid_input(format!("invalid presign expiry {:?}: {}", expires_in, e))
        })?;
        let presigned = if method == Method::PUT {
            self.client
                .put_object()
                .bucket(&handle.name)
                .key(path.as_ref())
                .presigned(presigning_config)
                .await
                .map_err(|e| BlobError::network(e.into_service_error()))?
        } else {
            self.client
                .get_object()
                .bucket(&handle.name)
                .key(path.as_ref())
                .presigned(presigning_config)
                .await
                .map_err(|e| BlobError::network(e.into_service_error()))?
        };

        let uri = presigned
            .uri()
            .parse()
            .map_err(|e| BlobError::network(anyhow::anyhow!("invalid presigned uri: {}", e)))?;
        Ok(Some(uri))
    }
}

pub type S3Store = ObjectBackend<S3Provider>;

impl ObjectBackend<S3Provider> {
    pub async fn from_config(config: S3Config, policies: Arc<dyn NamespacePolicyResolver>) -> Self {
        let naming = config.naming.clone();
        let create = config.create_bucket_if_missing;
        let expiry = Duration::from_secs(config.presign_expiry_secs);
        ObjectBackend::new(S3Provider::new(config).await, naming, policies)
            .with_create_bucket_if_missing(create)
            .with_presign_expiry(expiry)
    }
}
