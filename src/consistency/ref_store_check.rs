use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use tracing::{instrument, warn};

use super::{ConsistencyCheck, ScanCounters, ScanReport};
use crate::{config::CheckConfig, ref_store::ReferenceStore};

/// Stamps a last-access time on every reference that has none, so age-based
/// collection never sees a record without one.
pub struct RefStoreCheck {
    refs: Arc<dyn ReferenceStore>,
    config: CheckConfig,
}

impl RefStoreCheck {
    pub fn new(refs: Arc<dyn ReferenceStore>, config: CheckConfig) -> Self {
        Self { refs, config }
    }
}

#[async_trait]
impl ConsistencyCheck for RefStoreCheck {
    fn name(&self) -> &'static str {
        "ref_store"
    }

    #[instrument(skip(self), fields(check = "ref_store"))]
    async fn run_pass(&self) -> Result<ScanReport> {
        let counters = ScanCounters::default();
        let now = Utc::now();
        self.refs
            .records()
            .for_each_concurrent(self.config.max_parallelism, |record| {
                let counters = &counters;
                async move {
                    counters.scanned(self.name());
                    let record = match record {
                        Ok(record) => record,
                        Err(e) => {
                            warn!("failed to read reference record: {}", e);
                            return;
                        }
                    };
                    if record.last_access.is_some() {
                        return;
                    }
                    match self
                        .refs
                        .update_last_access(&record.namespace, &record.bucket, &record.key, now)
                        .await
                    {
                        Ok(()) => counters.repaired(),
                        Err(e) => warn!(
                            namespace = %record.namespace,
                            bucket = %record.bucket,
                            key = %record.key,
                            "failed to stamp last access time: {}",
                            e
                        ),
                    }
                }
            })
            .await;
        Ok(counters.report())
    }
}
