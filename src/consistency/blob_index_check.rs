use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use blob_store::NamespacePolicyResolver;
use data_model::{BlobError, BlobId, BlobResult, NamespaceId};
use futures::StreamExt;
use tracing::{info, instrument, warn, Span};

use super::{ConsistencyCheck, ScanCounters, ScanReport};
use crate::{blob_service::BlobService, config::CheckConfig};

/// Verifies that every blob the index places in this region is present in
/// the root store. Missing blobs are replicated back from another region
/// when one holds them; otherwise the region is dropped from the index if
/// deletes are allowed.
pub struct BlobIndexCheck {
    service: Arc<BlobService>,
    policies: Arc<dyn NamespacePolicyResolver>,
    config: CheckConfig,
}

impl BlobIndexCheck {
    pub fn new(
        service: Arc<BlobService>,
        policies: Arc<dyn NamespacePolicyResolver>,
        config: CheckConfig,
    ) -> Self {
        Self {
            service,
            policies,
            config,
        }
    }

    #[instrument(level = "debug", skip(self, counters), fields(namespace = %ns, blob = %blob, error = tracing::field::Empty))]
    async fn check_record(&self, ns: &NamespaceId, blob: &BlobId, counters: &ScanCounters) {
        if let Err(e) = self.check_blob(ns, blob, counters).await {
            Span::current().record("error", tracing::field::display(&e));
            warn!(namespace = %ns, blob = %blob, "index consistency check failed: {}", e);
        }
    }

    async fn check_blob(
        &self,
        ns: &NamespaceId,
        blob: &BlobId,
        counters: &ScanCounters,
    ) -> BlobResult<()> {
        let index = self.service.index();
        if !index.blob_exists_in_region(ns, blob, None).await? {
            return Ok(());
        }

        match self.policies.get_policies_for_ns(ns) {
            Ok(_) => {}
            Err(BlobError::NamespaceNotFound { .. }) => {
                if self.config.allow_deletes {
                    index.remove_blob_from_region(ns, blob, None).await?;
                    counters.deleted();
                    info!(namespace = %ns, blob = %blob, "removed index entry for unknown namespace");
                } else {
                    warn!(namespace = %ns, blob = %blob, "index entry for unknown namespace");
                }
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        let Some(root) = self.service.root() else {
            return Ok(());
        };
        match root.exists(ns, blob, true).await {
            Ok(true) => return Ok(()),
            Ok(false) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        let current = index.current_region();
        let regions = index.get_blob_regions(ns, blob).await?;
        if regions.iter().any(|region| region != current) {
            match self.service.replicate(ns, blob).await {
                Ok(()) => {
                    counters.repaired();
                    info!(namespace = %ns, blob = %blob, "restored blob missing from root store");
                    return Ok(());
                }
                Err(e) => {
                    warn!(namespace = %ns, blob = %blob, "failed to restore blob from another region: {}", e);
                }
            }
        }

        if self.config.allow_deletes {
            index.remove_blob_from_region(ns, blob, None).await?;
            counters.deleted();
            info!(namespace = %ns, blob = %blob, region = current, "removed region for blob missing from root store");
        } else {
            warn!(namespace = %ns, blob = %blob, region = current, "blob indexed in region is missing from root store");
        }
        Ok(())
    }
}

#[async_trait]
impl ConsistencyCheck for BlobIndexCheck {
    fn name(&self) -> &'static str {
        "blob_index"
    }

    #[instrument(skip(self), fields(check = "blob_index"))]
    async fn run_pass(&self) -> Result<ScanReport> {
        if self.service.root().is_none() {
            return Err(anyhow!("no root store configured"));
        }
        let counters = ScanCounters::default();
        self.service
            .index()
            .get_all_blobs()
            .for_each_concurrent(self.config.max_parallelism, |entry| {
                let counters = &counters;
                async move {
                    counters.scanned(self.name());
                    match entry {
                        Ok((ns, blob)) => self.check_record(&ns, &blob, counters).await,
                        Err(e) => warn!("failed to read index entry: {}", e),
                    }
                }
            })
            .await;
        Ok(counters.report())
    }
}
