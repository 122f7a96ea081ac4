use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use dashmap::DashMap;
use data_model::{BlobError, BlobId, BlobReference, BlobResult, BucketId, NamespaceId, RefId};
use futures::StreamExt;

use crate::{validate_region, BlobIndex, BlobReferenceStream, IndexedBlobStream};

#[derive(Default)]
struct IndexEntry {
    regions: BTreeSet<String>,
    references: BTreeMap<String, BlobReference>,
}

/// Process-local index, used by tests and single-node deployments.
pub struct MemoryBlobIndex {
    current_region: String,
    entries: DashMap<(NamespaceId, BlobId), IndexEntry>,
}

impl MemoryBlobIndex {
    pub fn new(current_region: impl Into<String>) -> Self {
        Self {
            current_region: current_region.into(),
            entries: DashMap::new(),
        }
    }

    fn region<'a>(&'a self, region: Option<&'a str>) -> BlobResult<&'a str> {
        let region = region.unwrap_or(&self.current_region);
        validate_region(region)?;
        Ok(region)
    }

    fn add_reference(&self, ns: &NamespaceId, blob: &BlobId, reference: BlobReference) {
        self.entries
            .entry((ns.clone(), *blob))
            .or_default()
            .references
            .insert(reference.key(), reference);
    }
}

#[async_trait]
impl BlobIndex for MemoryBlobIndex {
    fn current_region(&self) -> &str {
        &self.current_region
    }

    async fn add_blob_to_index(
        &self,
        ns: &NamespaceId,
        blob: &BlobId,
        region: Option<&str>,
    ) -> BlobResult<()> {
        let region = self.region(region)?;
        self.entries
            .entry((ns.clone(), *blob))
            .or_default()
            .regions
            .insert(region.to_string());
        Ok(())
    }

    async fn remove_blob_from_region(
        &self,
        ns: &NamespaceId,
        blob: &BlobId,
        region: Option<&str>,
    ) -> BlobResult<()> {
        let region = self.region(region)?;
        if let Some(mut entry) = self.entries.get_mut(&(ns.clone(), *blob)) {
            entry.regions.remove(region);
        }
        Ok(())
    }

    async fn blob_exists_in_region(
        &self,
        ns: &NamespaceId,
        blob: &BlobId,
        region: Option<&str>,
    ) -> BlobResult<bool> {
        let region = self.region(region)?;
        Ok(self
            .entries
            .get(&(ns.clone(), *blob))
            .is_some_and(|entry| entry.regions.contains(region)))
    }

    async fn get_blob_regions(&self, ns: &NamespaceId, blob: &BlobId) -> BlobResult<Vec<String>> {
        self.entries
            .get(&(ns.clone(), *blob))
            .map(|entry| entry.regions.iter().cloned().collect())
            .ok_or_else(|| BlobError::blob_not_found(ns, blob))
    }

    async fn add_ref_to_blobs(
        &self,
        ns: &NamespaceId,
        bucket: &BucketId,
        key: &RefId,
        blobs: &[BlobId],
    ) -> BlobResult<()> {
        for blob in blobs {
            self.add_reference(
                ns,
                blob,
                BlobReference::Ref {
                    bucket: bucket.clone(),
                    key: key.clone(),
                },
            );
        }
        Ok(())
    }

    async fn add_blob_references(
        &self,
        ns: &NamespaceId,
        source: &BlobId,
        target: &BlobId,
    ) -> BlobResult<()> {
        self.add_reference(ns, target, BlobReference::Blob { blob: *source });
        Ok(())
    }

    async fn remove_references(
        &self,
        ns: &NamespaceId,
        blob: &BlobId,
        refs: Option<&[BlobReference]>,
    ) -> BlobResult<()> {
        if let Some(mut entry) = self.entries.get_mut(&(ns.clone(), *blob)) {
            match refs {
                Some(refs) => {
                    for reference in refs {
                        entry.references.remove(&reference.key());
                    }
                }
                None => entry.references.clear(),
            }
        }
        Ok(())
    }

    fn get_blob_references(&self, ns: &NamespaceId, blob: &BlobId) -> BlobReferenceStream {
        let references: Vec<BlobResult<BlobReference>> = self
            .entries
            .get(&(ns.clone(), *blob))
            .map(|entry| entry.references.values().cloned().map(Ok).collect())
            .unwrap_or_default();
        futures::stream::iter(references).boxed()
    }

    fn get_all_blobs(&self) -> IndexedBlobStream {
        let keys: Vec<BlobResult<(NamespaceId, BlobId)>> =
            self.entries.iter().map(|entry| Ok(entry.key().clone())).collect();
        futures::stream::iter(keys).boxed()
    }
}
