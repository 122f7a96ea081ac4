//! Azure Blob Storage backend: object_store for data I/O and SAS signing,
//! azure_storage_blobs for container provisioning.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use azure_storage::StorageCredentials;
use azure_storage_blobs::prelude::*;
use data_model::{BlobError, BlobResult};
use object_store::azure::MicrosoftAzureBuilder;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::object::{BucketHandle, BucketNaming, BucketProvider, ObjectBackend};
use crate::{BackendKind, NamespacePolicyResolver};

fn default_presign_expiry_secs() -> u64 {
    15 * 60
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AzureConfig {
    #[serde(flatten)]
    pub naming: BucketNaming,

    pub account: String,

    /// Shared key. Without one, credentials come from the environment.
    #[serde(default)]
    pub access_key: Option<String>,

    #[serde(default)]
    pub create_container_if_missing: bool,

    #[serde(default = "default_presign_expiry_secs")]
    pub presign_expiry_secs: u64,
}

pub struct AzureProvider {
    config: AzureConfig,
    service_client: BlobServiceClient,
}

impl AzureProvider {
    pub fn new(config: AzureConfig) -> Self {
        let credentials = match &config.access_key {
            Some(key) => StorageCredentials::access_key(config.account.clone(), key.clone()),
            None => StorageCredentials::anonymous(),
        };
        let service_client = BlobServiceClient::new(&config.account, credentials);
        Self {
            config,
            service_client,
        }
    }
}

#[async_trait]
impl BucketProvider for AzureProvider {
    fn kind(&self) -> BackendKind {
        BackendKind::Azure
    }

    async fn connect(&self, container: &str) -> BlobResult<BucketHandle> {
        let mut builder = MicrosoftAzureBuilder::from_env()
            .with_account(&self.config.account)
            .with_container_name(container);
        if let Some(key) = &self.config.access_key {
            builder = builder.with_access_key(key);
        }
        let store = Arc::new(builder.build().map_err(BlobError::network)?);
        debug!(container = %container, "created Azure client");
        Ok(BucketHandle::new(container, store.clone()).with_signer(store))
    }

    async fn provision(&self, container: &str) -> BlobResult<()> {
        match self.service_client.container_client(container).create().await {
            Ok(_) => {
                info!(container = %container, "created container");
                Ok(())
            }
            Err(e) if e.to_string().contains("ContainerAlreadyExists") => Ok(()),
            Err(e) => Err(BlobError::network(e)),
        }
    }
}

pub type AzureStore = ObjectBackend<AzureProvider>;

impl ObjectBackend<AzureProvider> {
    pub fn from_config(config: AzureConfig, policies: Arc<dyn NamespacePolicyResolver>) -> Self {
        let naming = config.naming.clone();
        let create = config.create_container_if_missing;
        let expiry = Duration::from_secs(config.presign_expiry_secs);
        ObjectBackend::new(AzureProvider::new(config), naming, policies)
            .with_create_bucket_if_missing(create)
            .with_presign_expiry(expiry)
    }
}
