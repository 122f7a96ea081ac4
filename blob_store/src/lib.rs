//! Physical blob stores behind one uniform contract.
//!
//! Every backend implements [`BlobStore`]: put/get/exists/delete/list for a
//! `(namespace, blob)` pair, plus optional presigned redirect URIs. Backends:
//!
//! - [`MemoryStore`]: process-local map, used by tests
//! - [`FileSystemStore`]: hash fan-out directories with access-recency
//!   eviction ([`FileSystemStore::cleanup`])
//! - [`ObjectBackend`]: object storage (S3 with the `aws` feature, Azure with
//!   the `azure` feature), one bucket/container per storage pool
//! - [`RelayStore`]: forwards to an upstream instance over HTTP
//! - [`PeerStore`]: read-only race across sibling instances
//!
//! Backends are assembled from configuration with [`build_backends`].

mod backends;
mod config;
mod contents;
mod credentials;
mod discovery;
pub mod http;
mod metrics;
mod policy;
#[cfg(test)]
mod testing;
mod traits;

#[cfg(feature = "azure")]
pub use backends::azure::{AzureConfig, AzureProvider, AzureStore};
#[cfg(feature = "aws")]
pub use backends::s3::{S3Config, S3Provider, S3Store};
pub use backends::{
    filesystem::{FileSystemConfig, FileSystemStore, GcReport},
    memory::MemoryStore,
    object::{BucketHandle, BucketNaming, BucketProvider, ObjectBackend},
    peer::{PeerConfig, PeerStore},
    relay::{RelayConfig, RelayStore},
};
pub use config::{build_backends, BackendConfig, BackendDeps, Backends};
pub use contents::{BlobBody, BlobContents, BlobMetadata, ByteStream, ListedBlob};
pub use credentials::{authorize, ServiceCredentials, StaticCredentials};
pub use data_model::{BlobError, BlobResult};
pub use discovery::{DnsPeerDiscovery, PeerDiscovery, StaticPeerDiscovery};
pub use metrics::{BlobMetrics, Timer};
pub use policy::{NamespacePolicyResolver, StaticPolicyResolver};
pub use traits::{BackendInfo, BackendKind, BlobStore};
