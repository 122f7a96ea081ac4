//! In-memory blob store backend, used by tests.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use data_model::{BlobError, BlobId, BlobResult, LastAccessTracking, NamespaceId};
use futures::{stream::BoxStream, StreamExt};

use crate::{BackendInfo, BackendKind, BlobContents, BlobMetadata, BlobStore, ListedBlob};

struct StoredBlob {
    content: Bytes,
    created_at: DateTime<Utc>,
}

/// Process-local map keyed by `<namespace>/<blob>`.
///
/// In strict mode, writing an existing identifier with different content
/// fails, which surfaces hashing bugs in callers.
#[derive(Default)]
pub struct MemoryStore {
    blobs: DashMap<String, StoredBlob>,
    strict: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn strict() -> Self {
        Self {
            blobs: DashMap::new(),
            strict: true,
        }
    }

    fn key(ns: &NamespaceId, blob: &BlobId) -> String {
        format!("{}/{}", ns, blob)
    }

    /// Store bytes under an identifier without any checks. Lets tests plant
    /// corrupt content.
    pub fn insert_raw(&self, ns: &NamespaceId, blob: &BlobId, content: Bytes) {
        self.blobs.insert(
            Self::key(ns, blob),
            StoredBlob {
                content,
                created_at: Utc::now(),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }
}

#[async_trait]
impl BlobStore for MemoryStore {
    fn info(&self) -> BackendInfo {
        BackendInfo {
            kind: BackendKind::Memory,
            root_capable: true,
            supports_consistency_scan: true,
            local: true,
        }
    }

    async fn put(&self, ns: &NamespaceId, blob: &BlobId, content: Bytes) -> BlobResult<BlobId> {
        let key = Self::key(ns, blob);
        if let Some(existing) = self.blobs.get(&key) {
            if self.strict && existing.content != content {
                return Err(BlobError::Other {
                    source: anyhow::anyhow!(
                        "blob {} in namespace {} overwritten with different content",
                        blob,
                        ns
                    ),
                });
            }
            return Ok(*blob);
        }
        self.blobs.entry(key).or_insert_with(|| StoredBlob {
            content,
            created_at: Utc::now(),
        });
        Ok(*blob)
    }

    async fn get(
        &self,
        ns: &NamespaceId,
        blob: &BlobId,
        _tracking: LastAccessTracking,
        _supports_redirect: bool,
    ) -> BlobResult<BlobContents> {
        self.blobs
            .get(&Self::key(ns, blob))
            .map(|stored| BlobContents::from_bytes(stored.content.clone()))
            .ok_or_else(|| BlobError::blob_not_found(ns, blob))
    }

    async fn exists(&self, ns: &NamespaceId, blob: &BlobId, _force_check: bool) -> BlobResult<bool> {
        Ok(self.blobs.contains_key(&Self::key(ns, blob)))
    }

    async fn metadata(&self, ns: &NamespaceId, blob: &BlobId) -> BlobResult<BlobMetadata> {
        self.blobs
            .get(&Self::key(ns, blob))
            .map(|stored| BlobMetadata {
                size_bytes: stored.content.len() as u64,
                created_at: stored.created_at,
            })
            .ok_or_else(|| BlobError::blob_not_found(ns, blob))
    }

    async fn delete(&self, ns: &NamespaceId, blob: &BlobId) -> BlobResult<bool> {
        Ok(self.blobs.remove(&Self::key(ns, blob)).is_some())
    }

    async fn delete_namespace(&self, ns: &NamespaceId) -> BlobResult<()> {
        let prefix = format!("{}/", ns);
        self.blobs.retain(|key, _| !key.starts_with(&prefix));
        Ok(())
    }

    fn list(
        &self,
        ns: &NamespaceId,
        start_after: Option<BlobId>,
    ) -> BoxStream<'static, BlobResult<ListedBlob>> {
        let prefix = format!("{}/", ns);
        let mut listed: Vec<ListedBlob> = self
            .blobs
            .iter()
            .filter_map(|entry| {
                let blob: BlobId = entry.key().strip_prefix(&prefix)?.parse().ok()?;
                if matches!(start_after, Some(after) if blob <= after) {
                    return None;
                }
                Some(ListedBlob {
                    blob,
                    last_modified: entry.value().created_at,
                })
            })
            .collect();
        listed.sort_by_key(|listed| listed.blob);
        futures::stream::iter(listed.into_iter().map(Ok)).boxed()
    }
}

#[cfg(test)]
mod tests {
    use futures::TryStreamExt;

    use super::*;

    fn ns() -> NamespaceId {
        NamespaceId::new("test-ns").unwrap()
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = MemoryStore::new();
        let content = Bytes::from_static(b"hello world");
        let id = BlobId::from_content(&content);

        store.put(&ns(), &id, content.clone()).await.unwrap();
        assert!(store.exists(&ns(), &id, false).await.unwrap());

        let fetched = store
            .get(&ns(), &id, LastAccessTracking::Track, false)
            .await
            .unwrap()
            .into_bytes()
            .await
            .unwrap();
        assert_eq!(fetched, content);

        assert!(store.delete(&ns(), &id).await.unwrap());
        assert!(!store.delete(&ns(), &id).await.unwrap());
        let err = store
            .get(&ns(), &id, LastAccessTracking::Track, false)
            .await
            .unwrap_err();
        assert!(matches!(err, BlobError::BlobNotFound { .. }));
    }

    #[tokio::test]
    async fn test_existing_content_wins() {
        let store = MemoryStore::new();
        let id = BlobId::from_content(b"first");

        store.put(&ns(), &id, Bytes::from_static(b"first")).await.unwrap();
        store.put(&ns(), &id, Bytes::from_static(b"second")).await.unwrap();

        let fetched = store
            .get(&ns(), &id, LastAccessTracking::Skip, false)
            .await
            .unwrap()
            .into_bytes()
            .await
            .unwrap();
        assert_eq!(fetched, Bytes::from_static(b"first"));
    }

    #[tokio::test]
    async fn test_strict_mode_rejects_different_content() {
        let store = MemoryStore::strict();
        let id = BlobId::from_content(b"first");

        store.put(&ns(), &id, Bytes::from_static(b"first")).await.unwrap();
        store.put(&ns(), &id, Bytes::from_static(b"first")).await.unwrap();
        assert!(store.put(&ns(), &id, Bytes::from_static(b"other")).await.is_err());
    }

    #[tokio::test]
    async fn test_list_is_scoped_to_namespace() {
        let store = MemoryStore::new();
        let other = NamespaceId::new("other").unwrap();
        let a = BlobId::from_content(b"a");
        let b = BlobId::from_content(b"b");
        store.put(&ns(), &a, Bytes::from_static(b"a")).await.unwrap();
        store.put(&other, &b, Bytes::from_static(b"b")).await.unwrap();

        let listed: Vec<ListedBlob> = store.list(&ns(), None).try_collect().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].blob, a);

        store.delete_namespace(&ns()).await.unwrap();
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_list_is_ordered_and_resumable() {
        let store = MemoryStore::new();
        let mut ids = Vec::new();
        for i in 0..5u8 {
            let content = Bytes::from(vec![i; 3]);
            let id = BlobId::from_content(&content);
            store.put(&ns(), &id, content).await.unwrap();
            ids.push(id);
        }
        ids.sort();

        let listed: Vec<BlobId> = store
            .list(&ns(), None)
            .map_ok(|b| b.blob)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(listed, ids);

        let rest: Vec<BlobId> = store
            .list(&ns(), Some(ids[2]))
            .map_ok(|b| b.blob)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(rest, ids[3..].to_vec());
    }
}
