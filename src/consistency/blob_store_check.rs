use std::{collections::BTreeMap, sync::Arc};

use anyhow::Result;
use async_trait::async_trait;
use blob_index::BlobIndex;
use blob_store::{BlobStore, NamespacePolicyResolver};
use data_model::{BlobId, BlobResult, LastAccessTracking, NamespaceId};
use futures::StreamExt;
use tracing::{debug, info, instrument, warn, Span};

use super::{ConsistencyCheck, ScanCounters, ScanReport};
use crate::{config::CheckConfig, leader::LeaderElection};

/// Re-hashes every blob in every content-addressed namespace and deletes
/// those whose bytes do not match their identifier.
///
/// Namespaces are scanned per physical container, so a container shared by
/// several namespaces is read once. Containers that also hold a namespace
/// without content addressing are skipped. Local stores are checked on every
/// instance. Shared stores are only checked by the leader.
pub struct BlobStoreCheck {
    stores: Vec<Arc<dyn BlobStore>>,
    index: Arc<dyn BlobIndex>,
    policies: Arc<dyn NamespacePolicyResolver>,
    leader: Arc<dyn LeaderElection>,
    config: CheckConfig,
}

impl BlobStoreCheck {
    pub fn new(
        stores: Vec<Arc<dyn BlobStore>>,
        index: Arc<dyn BlobIndex>,
        policies: Arc<dyn NamespacePolicyResolver>,
        leader: Arc<dyn LeaderElection>,
        config: CheckConfig,
    ) -> Self {
        Self {
            stores,
            index,
            policies,
            leader,
            config,
        }
    }

    /// Content-addressed namespaces of `store` grouped by container.
    fn scan_groups(&self, store: &dyn BlobStore) -> BlobResult<Vec<Vec<NamespaceId>>> {
        let mut containers: BTreeMap<String, (Vec<NamespaceId>, bool)> = BTreeMap::new();
        for ns in self.policies.namespaces() {
            let policy = self.policies.get_policies_for_ns(&ns)?;
            let (members, all_content_addressed) = containers
                .entry(store.container(&ns)?)
                .or_insert_with(|| (Vec::new(), true));
            if policy.use_content_addressed_storage {
                members.push(ns);
            } else {
                *all_content_addressed = false;
            }
        }

        let mut groups = Vec::new();
        for (container, (members, all_content_addressed)) in containers {
            if members.is_empty() {
                continue;
            }
            if !all_content_addressed {
                warn!(
                    container,
                    backend = %store.info().kind,
                    "container also holds namespaces without content addressing, skipping"
                );
                continue;
            }
            groups.push(members);
        }
        Ok(groups)
    }

    async fn check_container(
        &self,
        store: &dyn BlobStore,
        is_root: bool,
        members: &[NamespaceId],
        counters: &ScanCounters,
    ) {
        let Some(ns) = members.first() else {
            return;
        };
        store
            .list(ns, None)
            .for_each_concurrent(self.config.max_parallelism, |listed| async move {
                match listed {
                    Ok(listed) => {
                        counters.scanned(self.name());
                        self.check_record(store, is_root, members, &listed.blob, counters)
                            .await
                    }
                    Err(e) if e.is_not_found() => {
                        debug!(namespace = %ns, "namespace not present in store");
                    }
                    Err(e) => warn!(namespace = %ns, "failed to list store: {}", e),
                }
            })
            .await;
    }

    #[instrument(level = "debug", skip(self, store, members, counters), fields(backend = %store.info().kind, namespace = %members[0], error = tracing::field::Empty))]
    async fn check_record(
        &self,
        store: &dyn BlobStore,
        is_root: bool,
        members: &[NamespaceId],
        blob: &BlobId,
        counters: &ScanCounters,
    ) {
        let ns = &members[0];
        if let Err(e) = self.check_blob(store, is_root, members, blob, counters).await {
            Span::current().record("error", tracing::field::display(&e));
            warn!(namespace = %ns, blob = %blob, "content consistency check failed: {}", e);
        }
    }

    async fn check_blob(
        &self,
        store: &dyn BlobStore,
        is_root: bool,
        members: &[NamespaceId],
        blob: &BlobId,
        counters: &ScanCounters,
    ) -> BlobResult<()> {
        let ns = &members[0];
        let content = store
            .get(ns, blob, LastAccessTracking::Skip, false)
            .await?
            .into_bytes()
            .await?;
        let actual = BlobId::from_content(&content);
        if actual == *blob {
            return Ok(());
        }

        if !self.config.allow_deletes {
            warn!(namespace = %ns, blob = %blob, %actual, "stored content does not match its identifier");
            return Ok(());
        }
        store.delete(ns, blob).await?;
        if is_root {
            for member in members {
                self.index.remove_blob_from_region(member, blob, None).await?;
            }
        }
        counters.deleted();
        info!(
            namespace = %ns,
            blob = %blob,
            %actual,
            backend = %store.info().kind,
            "deleted blob whose content does not match its identifier"
        );
        Ok(())
    }
}

#[async_trait]
impl ConsistencyCheck for BlobStoreCheck {
    fn name(&self) -> &'static str {
        "blob_store"
    }

    fn requires_leader(&self) -> bool {
        false
    }

    #[instrument(skip(self), fields(check = "blob_store"))]
    async fn run_pass(&self) -> Result<ScanReport> {
        let counters = ScanCounters::default();
        let is_leader = self.leader.is_this_instance_leader().await;
        let root_position = self.stores.len().saturating_sub(1);

        for (position, store) in self.stores.iter().enumerate() {
            let info = store.info();
            if !info.supports_consistency_scan {
                continue;
            }
            if !info.local && !is_leader {
                debug!(backend = %info.kind, "not the leader, skipping shared store");
                continue;
            }
            let is_root = position == root_position && info.root_capable;
            for members in self.scan_groups(store.as_ref())? {
                self.check_container(store.as_ref(), is_root, &members, &counters)
                    .await;
            }
        }
        Ok(counters.report())
    }
}
