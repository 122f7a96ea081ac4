//! Interface to the named-reference store the blob index tracks.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use data_model::{BlobError, BlobId, BlobResult, BucketId, NamespaceId, RefId};
use futures::{stream::BoxStream, StreamExt};

/// A named reference `bucket/key` in a namespace, pointing at blobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefRecord {
    pub namespace: NamespaceId,
    pub bucket: BucketId,
    pub key: RefId,
    pub blobs: Vec<BlobId>,
    pub last_access: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait ReferenceStore: Send + Sync {
    /// Every record, in no particular order.
    fn records(&self) -> BoxStream<'static, BlobResult<RefRecord>>;

    async fn update_last_access(
        &self,
        ns: &NamespaceId,
        bucket: &BucketId,
        key: &RefId,
        at: DateTime<Utc>,
    ) -> BlobResult<()>;
}

type RefKey = (NamespaceId, BucketId, RefId);

#[derive(Default)]
pub struct MemoryReferenceStore {
    records: DashMap<RefKey, RefRecord>,
}

impl MemoryReferenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: RefRecord) {
        let key = (
            record.namespace.clone(),
            record.bucket.clone(),
            record.key.clone(),
        );
        self.records.insert(key, record);
    }

    pub fn get(&self, ns: &NamespaceId, bucket: &BucketId, key: &RefId) -> Option<RefRecord> {
        self.records
            .get(&(ns.clone(), bucket.clone(), key.clone()))
            .map(|record| record.clone())
    }
}

#[async_trait]
impl ReferenceStore for MemoryReferenceStore {
    fn records(&self) -> BoxStream<'static, BlobResult<RefRecord>> {
        let records: Vec<BlobResult<RefRecord>> =
            self.records.iter().map(|entry| Ok(entry.value().clone())).collect();
        futures::stream::iter(records).boxed()
    }

    async fn update_last_access(
        &self,
        ns: &NamespaceId,
        bucket: &BucketId,
        key: &RefId,
        at: DateTime<Utc>,
    ) -> BlobResult<()> {
        match self.records.get_mut(&(ns.clone(), bucket.clone(), key.clone())) {
            Some(mut record) => {
                record.last_access = Some(at);
                Ok(())
            }
            None => Err(BlobError::invalid_input(format!(
                "no reference {}/{} in namespace {}",
                bucket, key, ns
            ))),
        }
    }
}
