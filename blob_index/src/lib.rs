//! Per-region existence and reference tracking for blobs.
//!
//! The index records, for each `(namespace, blob)`, the regions holding the
//! blob and the references pointing at it. It never stores blob bytes. A blob
//! with no regions and no references is orphaned and eligible for GC.

mod memory;
mod migrations;
mod rocks;
mod serializer;

use async_trait::async_trait;
use data_model::{BlobId, BlobReference, BlobResult, BucketId, NamespaceId, RefId};
use futures::stream::BoxStream;

pub use crate::{memory::MemoryBlobIndex, rocks::RocksDbBlobIndex};

pub type BlobReferenceStream = BoxStream<'static, BlobResult<BlobReference>>;

pub type IndexedBlobStream = BoxStream<'static, BlobResult<(NamespaceId, BlobId)>>;

/// Region and reference bookkeeping. Region arguments default to the
/// region this index was opened for.
#[async_trait]
pub trait BlobIndex: Send + Sync {
    fn current_region(&self) -> &str;

    /// Upsert the entry and add the region.
    async fn add_blob_to_index(
        &self,
        ns: &NamespaceId,
        blob: &BlobId,
        region: Option<&str>,
    ) -> BlobResult<()>;

    /// Drop the region from the entry. The entry itself stays, possibly with
    /// no regions left.
    async fn remove_blob_from_region(
        &self,
        ns: &NamespaceId,
        blob: &BlobId,
        region: Option<&str>,
    ) -> BlobResult<()>;

    async fn blob_exists_in_region(
        &self,
        ns: &NamespaceId,
        blob: &BlobId,
        region: Option<&str>,
    ) -> BlobResult<bool>;

    /// Fails with `BlobError::BlobNotFound` when there is no entry at all.
    async fn get_blob_regions(&self, ns: &NamespaceId, blob: &BlobId) -> BlobResult<Vec<String>>;

    /// Record that the named ref `bucket/key` points at each of `blobs`.
    async fn add_ref_to_blobs(
        &self,
        ns: &NamespaceId,
        bucket: &BucketId,
        key: &RefId,
        blobs: &[BlobId],
    ) -> BlobResult<()>;

    /// Record that `source` depends on `target`.
    async fn add_blob_references(
        &self,
        ns: &NamespaceId,
        source: &BlobId,
        target: &BlobId,
    ) -> BlobResult<()>;

    /// Remove the given references, or every reference when `refs` is
    /// `None`.
    async fn remove_references(
        &self,
        ns: &NamespaceId,
        blob: &BlobId,
        refs: Option<&[BlobReference]>,
    ) -> BlobResult<()>;

    fn get_blob_references(&self, ns: &NamespaceId, blob: &BlobId) -> BlobReferenceStream;

    /// Every entry in the index, in no particular order.
    fn get_all_blobs(&self) -> IndexedBlobStream;
}

pub(crate) fn validate_region(region: &str) -> BlobResult<()> {
    if region.is_empty() || region.contains('/') {
        return Err(data_model::BlobError::invalid_input(format!(
            "invalid region name {:?}",
            region
        )));
    }
    Ok(())
}
