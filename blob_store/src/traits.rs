//! Core blob store trait.

use async_trait::async_trait;
use bytes::Bytes;
use data_model::{BlobId, BlobResult, LastAccessTracking, NamespaceId};
use futures::stream::BoxStream;
use url::Url;

use crate::{BlobContents, BlobMetadata, ListedBlob};

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum BackendKind {
    Memory,
    FileSystem,
    S3,
    Azure,
    Relay,
    Peer,
}

/// Capabilities of a backend. Callers branch on these flags rather than on
/// the concrete backend type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendInfo {
    pub kind: BackendKind,
    /// Can serve as the last, authoritative tier.
    pub root_capable: bool,
    /// Can be enumerated and re-hashed by the content consistency check.
    pub supports_consistency_scan: bool,
    /// Holds data private to this process/host, so maintenance needs no
    /// leader election.
    pub local: bool,
}

/// One physical store.
///
/// Writes are idempotent: storing the same identifier twice keeps the
/// existing content. Reads of a missing blob fail with
/// `BlobError::BlobNotFound`, reads in a namespace whose physical container
/// is missing fail with `BlobError::NamespaceNotFound`.
#[async_trait]
pub trait BlobStore: Send + Sync {
    fn info(&self) -> BackendInfo;

    async fn put(&self, ns: &NamespaceId, blob: &BlobId, content: Bytes) -> BlobResult<BlobId>;

    /// Read a blob. When `supports_redirect` is set and the backend can
    /// presign URIs, a redirect is returned instead of bytes.
    async fn get(
        &self,
        ns: &NamespaceId,
        blob: &BlobId,
        tracking: LastAccessTracking,
        supports_redirect: bool,
    ) -> BlobResult<BlobContents>;

    /// Existence without content. `false` is the normal "not here" outcome.
    /// `force_check` asks backends that front another service to bypass any
    /// index-based shortcut on the far side.
    async fn exists(&self, ns: &NamespaceId, blob: &BlobId, force_check: bool) -> BlobResult<bool>;

    async fn metadata(&self, ns: &NamespaceId, blob: &BlobId) -> BlobResult<BlobMetadata>;

    /// Remove a blob. Returns whether anything was removed; an absent blob
    /// is not an error.
    async fn delete(&self, ns: &NamespaceId, blob: &BlobId) -> BlobResult<bool>;

    async fn delete_namespace(&self, ns: &NamespaceId) -> BlobResult<()>;

    /// Name of the physical container that holds `ns` in this store.
    /// Namespaces resolving to the same container see each other's blobs.
    fn container(&self, ns: &NamespaceId) -> BlobResult<String> {
        Ok(ns.as_str().to_string())
    }

    /// Lazily enumerate everything physically present in a namespace, in
    /// ascending identifier order. With `start_after`, enumeration resumes
    /// after that identifier, so a listing can be paged.
    fn list(
        &self,
        ns: &NamespaceId,
        start_after: Option<BlobId>,
    ) -> BoxStream<'static, BlobResult<ListedBlob>>;

    /// Presigned read URI, `None` when unsupported.
    async fn read_redirect(&self, _ns: &NamespaceId, _blob: &BlobId) -> BlobResult<Option<Url>> {
        Ok(None)
    }

    /// Presigned write URI, `None` when unsupported.
    async fn write_redirect(&self, _ns: &NamespaceId, _blob: &BlobId) -> BlobResult<Option<Url>> {
        Ok(None)
    }
}
