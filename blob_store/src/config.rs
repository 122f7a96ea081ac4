//! Backend configuration and assembly of the ordered store list.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

#[cfg(feature = "azure")]
use crate::backends::azure::{AzureConfig, AzureStore};
#[cfg(feature = "aws")]
use crate::backends::s3::{S3Config, S3Store};
use crate::{
    backends::{
        filesystem::{FileSystemConfig, FileSystemStore},
        memory::MemoryStore,
        peer::{PeerConfig, PeerStore},
        relay::{RelayConfig, RelayStore},
    },
    BlobResult,
    BlobStore,
    NamespacePolicyResolver,
    PeerDiscovery,
    ServiceCredentials,
};

/// One tier of the store hierarchy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendConfig {
    Memory,
    #[serde(rename = "filesystem")]
    FileSystem(FileSystemConfig),
    #[cfg(feature = "aws")]
    S3(S3Config),
    #[cfg(feature = "azure")]
    Azure(AzureConfig),
    Relay(RelayConfig),
    Peer(PeerConfig),
}

/// Collaborators the backends need.
#[derive(Clone)]
pub struct BackendDeps {
    pub policies: Arc<dyn NamespacePolicyResolver>,
    pub credentials: Arc<dyn ServiceCredentials>,
    pub discovery: Arc<dyn PeerDiscovery>,
}

/// The assembled stores, in configuration order. Filesystem stores are also
/// listed separately for the cleanup loop.
#[derive(Clone, Default)]
pub struct Backends {
    pub stores: Vec<Arc<dyn BlobStore>>,
    pub filesystems: Vec<Arc<FileSystemStore>>,
}

pub async fn build_backends(configs: &[BackendConfig], deps: &BackendDeps) -> BlobResult<Backends> {
    let mut backends = Backends::default();
    for config in configs {
        let store: Arc<dyn BlobStore> = match config {
            BackendConfig::Memory => Arc::new(MemoryStore::new()),
            BackendConfig::FileSystem(config) => {
                let store = Arc::new(FileSystemStore::new(config.clone()).await?);
                backends.filesystems.push(store.clone());
                store
            }
            #[cfg(feature = "aws")]
            BackendConfig::S3(config) => {
                Arc::new(S3Store::from_config(config.clone(), deps.policies.clone()).await)
            }
            #[cfg(feature = "azure")]
            BackendConfig::Azure(config) => {
                Arc::new(AzureStore::from_config(config.clone(), deps.policies.clone()))
            }
            BackendConfig::Relay(config) => {
                Arc::new(RelayStore::new(config.clone(), deps.credentials.clone())?)
            }
            BackendConfig::Peer(config) => Arc::new(PeerStore::new(
                config.clone(),
                deps.discovery.clone(),
                deps.credentials.clone(),
            )),
        };
        info!(kind = %store.info().kind, tier = backends.stores.len(), "configured blob store");
        backends.stores.push(store);
    }
    Ok(backends)
}
