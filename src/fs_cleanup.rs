use std::{sync::Arc, time::Duration};

use blob_store::{FileSystemStore, GcReport};
use tokio::sync::watch;
use tracing::{error, info};

/// Periodic disk-usage eviction over every filesystem tier. Each instance
/// owns its disk, so no leader election is involved.
pub struct FileSystemCleanup {
    stores: Vec<Arc<FileSystemStore>>,
    interval: Duration,
}

impl FileSystemCleanup {
    pub fn new(stores: Vec<Arc<FileSystemStore>>, interval: Duration) -> Self {
        Self { stores, interval }
    }

    pub async fn run(&self) -> Vec<GcReport> {
        let mut reports = Vec::with_capacity(self.stores.len());
        for store in &self.stores {
            match store.cleanup().await {
                Ok(report) => reports.push(report),
                Err(err) => error!(
                    root = %store.config().root.display(),
                    "filesystem cleanup failed: {:?}",
                    err
                ),
            }
        }
        reports
    }

    pub async fn start(&self, mut shutdown_rx: watch::Receiver<()>) {
        if self.stores.is_empty() {
            return;
        }
        info!(stores = self.stores.len(), "starting filesystem cleanup");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    self.run().await;
                },
                _ = shutdown_rx.changed() => {
                    info!("filesystem cleanup shutting down");
                    break;
                }
            }
        }
    }
}
