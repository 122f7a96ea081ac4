//! Hierarchical blob service over an ordered list of stores.
//!
//! Tiers are ordered fastest first; the last one is the root store and holds
//! the superset of every blob this instance serves. Reads walk the tiers top
//! down and back-fill the tiers that missed. Writes go to every tier and are
//! recorded in the blob index for the current region.

use std::{collections::HashSet, sync::Arc};

use blob_index::BlobIndex;
use blob_store::{
    BackendKind,
    BlobContents,
    BlobMetadata,
    BlobMetrics,
    BlobStore,
    ListedBlob,
    NamespacePolicyResolver,
    Timer,
};
use bytes::Bytes;
use data_model::{BlobError, BlobId, BlobResult, LastAccessTracking, NamespaceId, NamespacePolicy};
use futures::stream::BoxStream;
use opentelemetry::KeyValue;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::replication::Replicator;

/// Per-request read options, mostly taken from request headers.
#[derive(Debug, Clone, Copy)]
pub struct ReadOptions {
    pub supports_redirect: bool,
    /// Cleared when the caller is itself replicating, so chains cannot form.
    pub on_demand_replication: bool,
    /// Set when the caller is a peer, so reads do not fan out again.
    pub skip_peers: bool,
    pub tracking: LastAccessTracking,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            supports_redirect: false,
            on_demand_replication: true,
            skip_peers: false,
            tracking: LastAccessTracking::Track,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ExistsOptions {
    pub force_check: bool,
    pub on_demand_replication: bool,
    pub skip_peers: bool,
}

pub struct BlobService {
    stores: Vec<Arc<dyn BlobStore>>,
    index: Arc<dyn BlobIndex>,
    policies: Arc<dyn NamespacePolicyResolver>,
    replicator: Arc<Replicator>,
    metrics: BlobMetrics,
}

impl BlobService {
    pub fn new(
        stores: Vec<Arc<dyn BlobStore>>,
        index: Arc<dyn BlobIndex>,
        policies: Arc<dyn NamespacePolicyResolver>,
        replicator: Arc<Replicator>,
    ) -> Self {
        let meter = opentelemetry::global::meter("blob-server");
        Self {
            stores,
            index,
            policies,
            replicator,
            metrics: BlobMetrics::new(&meter),
        }
    }

    pub fn index(&self) -> &Arc<dyn BlobIndex> {
        &self.index
    }

    pub fn stores(&self) -> &[Arc<dyn BlobStore>] {
        &self.stores
    }

    /// The last tier, authoritative for "does this exist anywhere here".
    pub fn root(&self) -> Option<&Arc<dyn BlobStore>> {
        self.stores.last()
    }

    fn tiers(&self, skip_peers: bool) -> impl Iterator<Item = &Arc<dyn BlobStore>> {
        self.stores
            .iter()
            .filter(move |store| !(skip_peers && store.info().kind == BackendKind::Peer))
    }

    fn timer(&self, op: &'static str, store: &dyn BlobStore) -> Timer {
        Timer::start_with_labels(
            &self.metrics.operations,
            &[
                KeyValue::new("op", op),
                KeyValue::new("backend", store.info().kind.to_string()),
            ],
        )
    }

    #[instrument(skip(self, content), fields(namespace = %ns, blob = %blob, size = content.len()))]
    pub async fn put(&self, ns: &NamespaceId, blob: &BlobId, content: Bytes) -> BlobResult<BlobId> {
        let policy = self.policies.get_policies_for_ns(ns)?;
        if policy.use_content_addressed_storage {
            let actual = BlobId::from_content(&content);
            if actual != *blob {
                return Err(BlobError::HashMismatch {
                    namespace: ns.clone(),
                    declared: *blob,
                    actual,
                });
            }
        }
        self.put_in_namespace(ns, blob, content.clone()).await?;

        // Follow the fallback chain while each namespace asks for upload-time
        // population. Configuration rejects cycles; the set guards anyway.
        let mut visited = HashSet::from([ns.clone()]);
        let mut policy = policy;
        while policy.populate_fallback_namespace_on_upload {
            let Some(fallback) = policy.fallback_namespace.clone() else {
                break;
            };
            if !visited.insert(fallback.clone()) {
                break;
            }
            debug!(fallback = %fallback, "populating fallback namespace on upload");
            self.put_in_namespace(&fallback, blob, content.clone()).await?;
            policy = self.policies.get_policies_for_ns(&fallback)?;
        }
        Ok(*blob)
    }

    /// Write to every tier, then record the current region in the index.
    /// Tier failures do not roll back the others; the write fails only when
    /// no tier accepted it.
    async fn put_in_namespace(&self, ns: &NamespaceId, blob: &BlobId, content: Bytes) -> BlobResult<()> {
        let mut stored = false;
        let mut last_error = None;
        for store in &self.stores {
            let _timer = self.timer("put", store.as_ref());
            match store.put(ns, blob, content.clone()).await {
                Ok(_) => stored = true,
                Err(e) => {
                    self.metrics.record_error("put", store.info().kind.as_ref());
                    warn!(
                        namespace = %ns,
                        blob = %blob,
                        backend = %store.info().kind,
                        "failed to write blob to tier: {}",
                        e
                    );
                    last_error = Some(e);
                }
            }
        }
        if !stored {
            return Err(last_error.unwrap_or_else(|| {
                BlobError::invalid_input("no storage backends are configured")
            }));
        }
        self.index.add_blob_to_index(ns, blob, None).await
    }

    #[instrument(skip(self, options), fields(namespace = %ns, blob = %blob))]
    pub async fn get(
        &self,
        ns: &NamespaceId,
        blob: &BlobId,
        options: ReadOptions,
    ) -> BlobResult<BlobContents> {
        let policy = self.policies.get_policies_for_ns(ns)?;
        let supports_redirect = options.supports_redirect && policy.allow_redirect_uris;
        let err = match self.get_from_tiers(ns, blob, &options, supports_redirect).await {
            Ok(contents) => return Ok(contents),
            Err(e) => e,
        };
        if !err.is_blob_not_found() {
            return Err(err);
        }

        let fallback = policy.fallback_namespace.as_ref();
        if let Some(fallback) = fallback {
            match self.copy_from_fallback(ns, fallback, blob, &options).await {
                Ok(()) => return self.get_from_tiers(ns, blob, &options, supports_redirect).await,
                Err(e) if e.is_blob_not_found() => {}
                Err(e) => return Err(e),
            }
        }

        if options.on_demand_replication && policy.on_demand_replication {
            match self.replicate(ns, blob).await {
                Ok(()) => return self.get_from_tiers(ns, blob, &options, supports_redirect).await,
                Err(e) if e.is_blob_not_found() => {}
                Err(e) => return Err(e),
            }
        }

        if let Some(fallback) = fallback {
            let fallback_policy = self.policies.get_policies_for_ns(fallback)?;
            if options.on_demand_replication && fallback_policy.on_demand_replication {
                self.replicate(fallback, blob).await?;
                let supports_redirect =
                    options.supports_redirect && fallback_policy.allow_redirect_uris;
                return self
                    .get_from_tiers(fallback, blob, &options, supports_redirect)
                    .await;
            }
        }

        Err(BlobError::blob_not_found(ns, blob))
    }

    /// Read from the first tier that has the blob and back-fill the tiers
    /// above it. A miss everywhere is `BlobNotFound`.
    async fn get_from_tiers(
        &self,
        ns: &NamespaceId,
        blob: &BlobId,
        options: &ReadOptions,
        supports_redirect: bool,
    ) -> BlobResult<BlobContents> {
        let mut missed: Vec<&Arc<dyn BlobStore>> = Vec::new();
        for store in self.tiers(options.skip_peers) {
            let result = {
                let _timer = self.timer("get", store.as_ref());
                store.get(ns, blob, options.tracking, supports_redirect).await
            };
            let contents = match result {
                Ok(contents) => contents,
                Err(e) if e.is_not_found() => {
                    missed.push(store);
                    continue;
                }
                Err(e) => {
                    self.metrics.record_error("get", store.info().kind.as_ref());
                    return Err(e);
                }
            };

            let targets: Vec<_> = missed
                .iter()
                .filter(|store| store.info().kind != BackendKind::Peer)
                .collect();
            if contents.is_redirect() || targets.is_empty() {
                return Ok(contents);
            }
            let bytes = contents.into_bytes().await?;
            for target in targets {
                match target.put(ns, blob, bytes.clone()).await {
                    Ok(_) => self.metrics.populated.add(
                        1,
                        &[KeyValue::new("backend", target.info().kind.to_string())],
                    ),
                    Err(e) => warn!(
                        namespace = %ns,
                        blob = %blob,
                        backend = %target.info().kind,
                        "failed to populate tier: {}",
                        e
                    ),
                }
            }
            return Ok(BlobContents::from_bytes(bytes));
        }
        Err(BlobError::blob_not_found(ns, blob))
    }

    async fn copy_from_fallback(
        &self,
        ns: &NamespaceId,
        fallback: &NamespaceId,
        blob: &BlobId,
        options: &ReadOptions,
    ) -> BlobResult<()> {
        let contents = self.get_from_tiers(fallback, blob, options, false).await?;
        let bytes = contents.into_bytes().await?;
        info!(namespace = %ns, fallback = %fallback, blob = %blob, "populating blob from fallback namespace");
        self.put_in_namespace(ns, blob, bytes).await
    }

    /// Fetch the blob from another region and store it in every local tier,
    /// regardless of the namespace's replication policy.
    #[instrument(skip(self), fields(namespace = %ns, blob = %blob))]
    pub async fn replicate(&self, ns: &NamespaceId, blob: &BlobId) -> BlobResult<()> {
        let policy = self.policies.get_policies_for_ns(ns)?;
        let bytes = self.replicator.fetch(ns, blob).await?;
        if policy.use_content_addressed_storage {
            let actual = BlobId::from_content(&bytes);
            if actual != *blob {
                return Err(BlobError::replication_failed(
                    ns,
                    blob,
                    &format!("replicated content hashes to {}", actual),
                ));
            }
        }
        self.put_in_namespace(ns, blob, bytes).await
    }

    #[instrument(skip(self, options), fields(namespace = %ns, blob = %blob))]
    pub async fn exists(
        &self,
        ns: &NamespaceId,
        blob: &BlobId,
        options: ExistsOptions,
    ) -> BlobResult<bool> {
        let policy = self.policies.get_policies_for_ns(ns)?;
        if self.exists_in_namespace(ns, &policy, blob, &options).await? {
            return Ok(true);
        }
        if let Some(fallback) = &policy.fallback_namespace {
            let fallback_policy = self.policies.get_policies_for_ns(fallback)?;
            if self
                .exists_in_namespace(fallback, &fallback_policy, blob, &options)
                .await?
            {
                return Ok(true);
            }
        }
        if options.on_demand_replication && policy.on_demand_replication {
            return self.exists_in_remote(ns, blob).await;
        }
        Ok(false)
    }

    async fn exists_in_namespace(
        &self,
        ns: &NamespaceId,
        policy: &NamespacePolicy,
        blob: &BlobId,
        options: &ExistsOptions,
    ) -> BlobResult<bool> {
        if policy.use_blob_index_for_exists && !options.force_check {
            return self.index.blob_exists_in_region(ns, blob, None).await;
        }
        for store in self.tiers(options.skip_peers) {
            let _timer = self.timer("exists", store.as_ref());
            match store.exists(ns, blob, options.force_check).await {
                Ok(true) => return Ok(true),
                Ok(false) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    self.metrics.record_error("exists", store.info().kind.as_ref());
                    return Err(e);
                }
            }
        }
        Ok(false)
    }

    /// Trusts the index: any region other than this one counts as a remote
    /// copy, without contacting it.
    async fn exists_in_remote(&self, ns: &NamespaceId, blob: &BlobId) -> BlobResult<bool> {
        let regions = match self.index.get_blob_regions(ns, blob).await {
            Ok(regions) => regions,
            Err(e) if e.is_blob_not_found() => return Ok(false),
            Err(e) => return Err(e),
        };
        let current = self.index.current_region();
        Ok(regions.len() > 1 || regions.iter().any(|region| region != current))
    }

    /// Remove the blob from the index, then from every tier. The index goes
    /// first so an interrupted physical delete leaves an orphan for GC rather
    /// than an index entry pointing at nothing.
    #[instrument(skip(self), fields(namespace = %ns, blob = %blob))]
    pub async fn delete(&self, ns: &NamespaceId, blob: &BlobId) -> BlobResult<()> {
        self.policies.get_policies_for_ns(ns)?;
        self.index.remove_blob_from_region(ns, blob, None).await?;
        self.index.remove_references(ns, blob, None).await?;

        let mut deleted = false;
        let mut namespace_found = false;
        let mut failure = None;
        for store in self.tiers(true) {
            let _timer = self.timer("delete", store.as_ref());
            match store.delete(ns, blob).await {
                Ok(true) => {
                    deleted = true;
                    namespace_found = true;
                }
                Ok(false) => namespace_found = true,
                Err(BlobError::NamespaceNotFound { .. }) => {}
                Err(e) => {
                    self.metrics.record_error("delete", store.info().kind.as_ref());
                    warn!(backend = %store.info().kind, "failed to delete blob from tier: {}", e);
                    failure = Some(e);
                }
            }
        }
        if deleted {
            return Ok(());
        }
        if let Some(e) = failure {
            return Err(e);
        }
        if namespace_found {
            Err(BlobError::blob_not_found(ns, blob))
        } else {
            Err(BlobError::namespace_not_found(ns))
        }
    }

    #[instrument(skip(self), fields(namespace = %ns))]
    pub async fn delete_namespace(&self, ns: &NamespaceId) -> BlobResult<()> {
        self.policies.get_policies_for_ns(ns)?;
        for store in self.tiers(true) {
            store.delete_namespace(ns).await?;
        }
        info!(namespace = %ns, "deleted namespace from every tier");
        Ok(())
    }

    #[instrument(skip(self), fields(namespace = %ns, blob = %blob))]
    pub async fn metadata(&self, ns: &NamespaceId, blob: &BlobId) -> BlobResult<BlobMetadata> {
        self.policies.get_policies_for_ns(ns)?;
        for store in &self.stores {
            match store.metadata(ns, blob).await {
                Ok(metadata) => return Ok(metadata),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        Err(BlobError::blob_not_found(ns, blob))
    }

    /// Served from the root store only, which holds the superset. Ordered by
    /// identifier and resumable after `start_after`.
    pub fn list(
        &self,
        ns: &NamespaceId,
        start_after: Option<BlobId>,
    ) -> BlobResult<BoxStream<'static, BlobResult<ListedBlob>>> {
        self.policies.get_policies_for_ns(ns)?;
        let root = self
            .root()
            .ok_or_else(|| BlobError::invalid_input("no storage backends are configured"))?;
        Ok(root.list(ns, start_after))
    }

    pub async fn read_redirect(&self, ns: &NamespaceId, blob: &BlobId) -> BlobResult<Option<Url>> {
        let policy = self.policies.get_policies_for_ns(ns)?;
        match self.root() {
            Some(root) if policy.allow_redirect_uris => root.read_redirect(ns, blob).await,
            _ => Ok(None),
        }
    }

    pub async fn write_redirect(&self, ns: &NamespaceId, blob: &BlobId) -> BlobResult<Option<Url>> {
        let policy = self.policies.get_policies_for_ns(ns)?;
        match self.root() {
            Some(root) if policy.allow_redirect_uris => root.write_redirect(ns, blob).await,
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use blob_store::{
        BackendInfo,
        MemoryStore,
        PeerConfig,
        PeerDiscovery,
        PeerStore,
        StaticCredentials,
    };
    use data_model::NamespacePolicy;
    use futures::TryStreamExt;

    use super::*;
    use crate::{config::PeerRegion, testing::TestHarness};

    struct FailingDiscovery;

    #[async_trait]
    impl PeerDiscovery for FailingDiscovery {
        async fn find_other_instances(&self) -> BlobResult<Vec<Url>> {
            Err(BlobError::network(anyhow::anyhow!("dns lookup failed")))
        }
    }

    /// Root tier that answers redirect-capable reads with a presigned URI.
    struct SigningStore {
        inner: MemoryStore,
    }

    #[async_trait]
    impl BlobStore for SigningStore {
        fn info(&self) -> BackendInfo {
            BackendInfo {
                kind: BackendKind::S3,
                root_capable: true,
                supports_consistency_scan: true,
                local: false,
            }
        }

        async fn put(&self, ns: &NamespaceId, blob: &BlobId, content: Bytes) -> BlobResult<BlobId> {
            self.inner.put(ns, blob, content).await
        }

        async fn get(
            &self,
            ns: &NamespaceId,
            blob: &BlobId,
            tracking: LastAccessTracking,
            supports_redirect: bool,
        ) -> BlobResult<BlobContents> {
            if !supports_redirect {
                return self.inner.get(ns, blob, tracking, false).await;
            }
            let metadata = self.inner.metadata(ns, blob).await?;
            let uri = format!("https://signed.example.com/{}/{}", ns, blob);
            Ok(BlobContents::redirect(uri.parse().unwrap(), metadata.size_bytes))
        }

        async fn exists(&self, ns: &NamespaceId, blob: &BlobId, force_check: bool) -> BlobResult<bool> {
            self.inner.exists(ns, blob, force_check).await
        }

        async fn metadata(&self, ns: &NamespaceId, blob: &BlobId) -> BlobResult<BlobMetadata> {
            self.inner.metadata(ns, blob).await
        }

        async fn delete(&self, ns: &NamespaceId, blob: &BlobId) -> BlobResult<bool> {
            self.inner.delete(ns, blob).await
        }

        async fn delete_namespace(&self, ns: &NamespaceId) -> BlobResult<()> {
            self.inner.delete_namespace(ns).await
        }

        fn list(
            &self,
            ns: &NamespaceId,
            start_after: Option<BlobId>,
        ) -> BoxStream<'static, BlobResult<ListedBlob>> {
            self.inner.list(ns, start_after)
        }
    }

    fn ns(name: &str) -> NamespaceId {
        NamespaceId::new(name).unwrap()
    }

    async fn read(service: &BlobService, ns: &NamespaceId, blob: &BlobId) -> BlobResult<Bytes> {
        service
            .get(ns, blob, ReadOptions::default())
            .await?
            .into_bytes()
            .await
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let harness = TestHarness::builder().tiers(2).build();
        let content = Bytes::from_static(b"hello world");
        let blob = BlobId::from_content(&content);

        harness.service.put(&ns("test"), &blob, content.clone()).await.unwrap();
        assert_eq!(read(&harness.service, &ns("test"), &blob).await.unwrap(), content);
        for store in &harness.stores {
            assert!(store.exists(&ns("test"), &blob, false).await.unwrap());
        }
        assert_eq!(
            harness.index.get_blob_regions(&ns("test"), &blob).await.unwrap(),
            vec!["r1"]
        );
    }

    #[tokio::test]
    async fn test_hash_mismatch_stores_nothing() {
        let harness = TestHarness::builder().build();
        let declared = BlobId::from_content(b"something else");

        let err = harness
            .service
            .put(&ns("test"), &declared, Bytes::from_static(b"payload"))
            .await
            .unwrap_err();
        assert!(matches!(err, BlobError::HashMismatch { .. }));
        assert!(harness.stores[0].is_empty());
        assert!(harness.index.get_blob_regions(&ns("test"), &declared).await.is_err());
    }

    #[tokio::test]
    async fn test_non_content_addressed_namespace_trusts_identifier() {
        let harness = TestHarness::builder()
            .namespace(
                "raw",
                NamespacePolicy {
                    use_content_addressed_storage: false,
                    ..Default::default()
                },
            )
            .build();
        let declared = BlobId::from_content(b"key");
        harness
            .service
            .put(&ns("raw"), &declared, Bytes::from_static(b"value"))
            .await
            .unwrap();
        assert_eq!(
            read(&harness.service, &ns("raw"), &declared).await.unwrap(),
            Bytes::from_static(b"value")
        );
    }

    #[tokio::test]
    async fn test_idempotent_put() {
        let harness = TestHarness::builder().tiers(2).build();
        let content = Bytes::from_static(b"twice");
        let blob = BlobId::from_content(&content);
        let service = harness.service.clone();

        let (a, b) = tokio::join!(
            service.put(&ns("test"), &blob, content.clone()),
            service.put(&ns("test"), &blob, content.clone())
        );
        a.unwrap();
        b.unwrap();
        harness.service.put(&ns("test"), &blob, content.clone()).await.unwrap();
        assert_eq!(harness.stores[0].len(), 1);
        assert_eq!(read(&harness.service, &ns("test"), &blob).await.unwrap(), content);
    }

    #[tokio::test]
    async fn test_get_populates_upper_tiers() {
        let harness = TestHarness::builder().tiers(2).build();
        let content = Bytes::from_static(b"lower tier");
        let blob = BlobId::from_content(&content);
        harness.stores[1].insert_raw(&ns("test"), &blob, content.clone());

        assert_eq!(read(&harness.service, &ns("test"), &blob).await.unwrap(), content);
        assert!(harness.stores[0].exists(&ns("test"), &blob, false).await.unwrap());
        assert_eq!(harness.stores[1].len(), 1);
    }

    #[tokio::test]
    async fn test_not_found_everywhere() {
        let harness = TestHarness::builder().tiers(3).build();
        let blob = BlobId::from_content(b"missing");
        let err = read(&harness.service, &ns("test"), &blob).await.unwrap_err();
        assert!(matches!(err, BlobError::BlobNotFound { .. }));
        assert!(!harness
            .service
            .exists(&ns("test"), &blob, ExistsOptions::default())
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_unknown_namespace() {
        let harness = TestHarness::builder().build();
        let blob = BlobId::from_content(b"x");
        let err = read(&harness.service, &ns("nope"), &blob).await.unwrap_err();
        assert!(matches!(err, BlobError::NamespaceNotFound { .. }));
    }

    #[tokio::test]
    async fn test_fallback_namespace_populates_primary() {
        let harness = TestHarness::builder()
            .namespace("base", NamespacePolicy::default())
            .namespace(
                "primary",
                NamespacePolicy {
                    fallback_namespace: Some(ns("base")),
                    ..Default::default()
                },
            )
            .build();
        let content = Bytes::from_static(b"shared asset");
        let blob = BlobId::from_content(&content);
        harness.service.put(&ns("base"), &blob, content.clone()).await.unwrap();

        assert_eq!(read(&harness.service, &ns("primary"), &blob).await.unwrap(), content);
        assert!(harness.stores[0].exists(&ns("primary"), &blob, false).await.unwrap());

        harness.service.delete(&ns("base"), &blob).await.unwrap();
        assert_eq!(read(&harness.service, &ns("primary"), &blob).await.unwrap(), content);
    }

    #[tokio::test]
    async fn test_exists_checks_fallback() {
        let harness = TestHarness::builder()
            .namespace("base", NamespacePolicy::default())
            .namespace(
                "primary",
                NamespacePolicy {
                    fallback_namespace: Some(ns("base")),
                    ..Default::default()
                },
            )
            .build();
        let content = Bytes::from_static(b"only in base");
        let blob = BlobId::from_content(&content);
        harness.service.put(&ns("base"), &blob, content).await.unwrap();

        assert!(harness
            .service
            .exists(&ns("primary"), &blob, ExistsOptions::default())
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_populate_fallback_on_upload() {
        let harness = TestHarness::builder()
            .namespace("base", NamespacePolicy::default())
            .namespace(
                "primary",
                NamespacePolicy {
                    fallback_namespace: Some(ns("base")),
                    populate_fallback_namespace_on_upload: true,
                    ..Default::default()
                },
            )
            .build();
        let content = Bytes::from_static(b"uploaded");
        let blob = BlobId::from_content(&content);
        harness.service.put(&ns("primary"), &blob, content).await.unwrap();

        assert!(harness.stores[0].exists(&ns("base"), &blob, false).await.unwrap());
        assert_eq!(
            harness.index.get_blob_regions(&ns("base"), &blob).await.unwrap(),
            vec!["r1"]
        );
    }

    #[tokio::test]
    async fn test_exists_via_index_and_remote_regions() {
        let harness = TestHarness::builder()
            .namespace(
                "indexed",
                NamespacePolicy {
                    use_blob_index_for_exists: true,
                    on_demand_replication: true,
                    ..Default::default()
                },
            )
            .build();
        let blob = BlobId::from_content(b"elsewhere");
        let options = ExistsOptions {
            on_demand_replication: true,
            ..Default::default()
        };

        assert!(!harness.service.exists(&ns("indexed"), &blob, options).await.unwrap());

        harness
            .index
            .add_blob_to_index(&ns("indexed"), &blob, Some("r2"))
            .await
            .unwrap();
        assert!(harness.service.exists(&ns("indexed"), &blob, options).await.unwrap());

        let local_only = ExistsOptions {
            on_demand_replication: false,
            ..Default::default()
        };
        assert!(!harness.service.exists(&ns("indexed"), &blob, local_only).await.unwrap());

        harness
            .index
            .add_blob_to_index(&ns("indexed"), &blob, None)
            .await
            .unwrap();
        assert!(harness.service.exists(&ns("indexed"), &blob, local_only).await.unwrap());
        // Forced checks look at the stores, which are empty.
        let forced = ExistsOptions {
            force_check: true,
            ..Default::default()
        };
        assert!(!harness.service.exists(&ns("indexed"), &blob, forced).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete() {
        let harness = TestHarness::builder().tiers(2).build();
        let content = Bytes::from_static(b"doomed");
        let blob = BlobId::from_content(&content);
        harness.service.put(&ns("test"), &blob, content).await.unwrap();

        harness.service.delete(&ns("test"), &blob).await.unwrap();
        assert!(harness.stores.iter().all(|s| s.is_empty()));
        assert!(harness.index.get_blob_regions(&ns("test"), &blob).await.unwrap().is_empty());

        let err = harness.service.delete(&ns("test"), &blob).await.unwrap_err();
        assert!(matches!(err, BlobError::BlobNotFound { .. }));
    }

    #[tokio::test]
    async fn test_metadata_and_list() {
        let harness = TestHarness::builder().tiers(2).build();
        let content = Bytes::from_static(b"listed");
        let blob = BlobId::from_content(&content);
        harness.stores[1].insert_raw(&ns("test"), &blob, content.clone());
        let upper_only = BlobId::from_content(b"upper");
        harness.stores[0].insert_raw(&ns("test"), &upper_only, Bytes::from_static(b"upper"));

        let metadata = harness.service.metadata(&ns("test"), &blob).await.unwrap();
        assert_eq!(metadata.size_bytes, content.len() as u64);

        let listed: Vec<ListedBlob> = harness
            .service
            .list(&ns("test"), None)
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].blob, blob);
    }

    #[tokio::test]
    async fn test_on_demand_replication_from_other_region() {
        let content = Bytes::from_static(b"replicate me");
        let blob = BlobId::from_content(&content);
        let policy = NamespacePolicy {
            on_demand_replication: true,
            ..Default::default()
        };

        let remote = TestHarness::builder()
            .region("r2")
            .namespace("game", policy.clone())
            .build();
        remote.service.put(&ns("game"), &blob, content.clone()).await.unwrap();
        let remote_url = remote.serve().await;

        let local = TestHarness::builder()
            .region("r1")
            .namespace("game", policy)
            .peer_region(PeerRegion {
                name: "r2".to_string(),
                url: remote_url,
            })
            .build();
        local.index.add_blob_to_index(&ns("game"), &blob, Some("r2")).await.unwrap();

        assert_eq!(read(&local.service, &ns("game"), &blob).await.unwrap(), content);
        assert!(local.stores[0].exists(&ns("game"), &blob, false).await.unwrap());
        let mut regions = local.index.get_blob_regions(&ns("game"), &blob).await.unwrap();
        regions.sort();
        assert_eq!(regions, vec!["r1", "r2"]);

        // Replication disabled by the caller.
        let other = BlobId::from_content(b"other");
        local.index.add_blob_to_index(&ns("game"), &other, Some("r2")).await.unwrap();
        let options = ReadOptions {
            on_demand_replication: false,
            ..Default::default()
        };
        let err = local.service.get(&ns("game"), &other, options).await.unwrap_err();
        assert!(matches!(err, BlobError::BlobNotFound { .. }));
    }

    #[tokio::test]
    async fn test_replication_without_holders_fails() {
        let harness = TestHarness::builder()
            .namespace(
                "game",
                NamespacePolicy {
                    on_demand_replication: true,
                    ..Default::default()
                },
            )
            .build();
        let blob = BlobId::from_content(b"unknown");
        let err = harness.service.replicate(&ns("game"), &blob).await.unwrap_err();
        assert!(matches!(err, BlobError::ReplicationFailed { .. }));
        // Reads still report plain not-found.
        let err = read(&harness.service, &ns("game"), &blob).await.unwrap_err();
        assert!(err.is_blob_not_found());
    }

    #[tokio::test]
    async fn test_failing_tier_does_not_block_put() {
        let strict = Arc::new(MemoryStore::strict());
        let content = Bytes::from_static(b"real");
        let blob = BlobId::from_content(&content);
        strict.insert_raw(&ns("raw"), &blob, Bytes::from_static(b"conflicting"));
        let healthy = Arc::new(MemoryStore::new());

        let harness = TestHarness::builder()
            .namespace(
                "raw",
                NamespacePolicy {
                    use_content_addressed_storage: false,
                    ..Default::default()
                },
            )
            .with_stores(vec![strict.clone(), healthy.clone()])
            .build();
        harness.service.put(&ns("raw"), &blob, content.clone()).await.unwrap();
        assert!(healthy.exists(&ns("raw"), &blob, false).await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_peer_discovery_falls_through_to_root() {
        let peers = PeerStore::new(
            PeerConfig::default(),
            Arc::new(FailingDiscovery),
            Arc::new(StaticCredentials::anonymous()),
        );
        let harness = TestHarness::builder()
            .upper_tier(Arc::new(peers))
            .build();
        let content = Bytes::from_static(b"behind a broken peer tier");
        let blob = BlobId::from_content(&content);

        harness.service.put(&ns("test"), &blob, content.clone()).await.unwrap();
        assert_eq!(read(&harness.service, &ns("test"), &blob).await.unwrap(), content);
        assert!(harness
            .service
            .exists(&ns("test"), &blob, ExistsOptions::default())
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_redirect_hit_skips_back_fill() {
        let signing = Arc::new(SigningStore {
            inner: MemoryStore::new(),
        });
        let harness = TestHarness::builder()
            .namespace(
                "redirecting",
                NamespacePolicy {
                    allow_redirect_uris: true,
                    ..Default::default()
                },
            )
            .root_tier(signing.clone())
            .build();
        let content = Bytes::from_static(b"served by redirect");
        let blob = BlobId::from_content(&content);
        signing
            .inner
            .insert_raw(&ns("redirecting"), &blob, content.clone());

        let contents = harness
            .service
            .get(
                &ns("redirecting"),
                &blob,
                ReadOptions {
                    supports_redirect: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(contents.length, content.len() as u64);
        assert!(contents.redirect_uri().is_some());
        assert!(harness.stores[0].is_empty());

        // A byte read does back-fill the upper tier.
        assert_eq!(
            read(&harness.service, &ns("redirecting"), &blob).await.unwrap(),
            content
        );
        assert!(harness.stores[0]
            .exists(&ns("redirecting"), &blob, false)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_zero_length_blob_round_trips() {
        let harness = TestHarness::builder().tiers(2).build();
        let blob = BlobId::from_content(b"");

        harness.service.put(&ns("test"), &blob, Bytes::new()).await.unwrap();
        assert!(read(&harness.service, &ns("test"), &blob).await.unwrap().is_empty());
        for store in &harness.stores {
            assert!(store.exists(&ns("test"), &blob, false).await.unwrap());
        }
    }
}
