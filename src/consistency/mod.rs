//! Background checks that reconcile the blob index, the physical stores and
//! the reference store.
//!
//! Each check runs as a polling loop for the life of the process. Checks that
//! touch shared state only run on the elected leader. A failure on a single
//! record is logged and recorded on its span; it never aborts the pass.

mod blob_index_check;
mod blob_store_check;
mod ref_store_check;

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::Result;
use async_trait::async_trait;
use opentelemetry::{metrics::Counter, KeyValue};
use tokio::sync::watch;
use tracing::{debug, error, info};

pub use self::{
    blob_index_check::BlobIndexCheck,
    blob_store_check::BlobStoreCheck,
    ref_store_check::RefStoreCheck,
};
use crate::leader::LeaderElection;

/// Records between two progress log lines.
const PROGRESS_INTERVAL: u64 = 1000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub scanned: u64,
    pub repaired: u64,
    pub deleted: u64,
}

/// Counters shared by the concurrent record checks of one pass.
#[derive(Default)]
pub(crate) struct ScanCounters {
    scanned: AtomicU64,
    repaired: AtomicU64,
    deleted: AtomicU64,
}

impl ScanCounters {
    pub(crate) fn scanned(&self, check: &str) {
        let scanned = self.scanned.fetch_add(1, Ordering::Relaxed) + 1;
        if scanned % PROGRESS_INTERVAL == 0 {
            info!(check, scanned, "consistency check progress");
        }
    }

    pub(crate) fn repaired(&self) {
        self.repaired.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn deleted(&self) {
        self.deleted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn report(&self) -> ScanReport {
        ScanReport {
            scanned: self.scanned.load(Ordering::Relaxed),
            repaired: self.repaired.load(Ordering::Relaxed),
            deleted: self.deleted.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
pub trait ConsistencyCheck: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether the whole pass only runs on the leader. Checks that mix local
    /// and shared resources decide per resource instead.
    fn requires_leader(&self) -> bool {
        true
    }

    async fn run_pass(&self) -> Result<ScanReport>;
}

#[derive(Clone)]
struct ConsistencyMetrics {
    scanned: Counter<u64>,
    repaired: Counter<u64>,
    deleted: Counter<u64>,
}

impl ConsistencyMetrics {
    fn new() -> Self {
        let meter = opentelemetry::global::meter("blob-server");
        Self {
            scanned: meter
                .u64_counter("consistency_records_scanned_total")
                .with_description("Records visited by consistency checks")
                .build(),
            repaired: meter
                .u64_counter("consistency_records_repaired_total")
                .with_description("Records repaired by consistency checks")
                .build(),
            deleted: meter
                .u64_counter("consistency_records_deleted_total")
                .with_description("Records deleted by consistency checks")
                .build(),
        }
    }

    fn record(&self, check: &'static str, report: &ScanReport) {
        let labels = [KeyValue::new("check", check)];
        self.scanned.add(report.scanned, &labels);
        self.repaired.add(report.repaired, &labels);
        self.deleted.add(report.deleted, &labels);
    }
}

/// Polling loop around one check.
pub struct ConsistencyWorker {
    check: Arc<dyn ConsistencyCheck>,
    leader: Arc<dyn LeaderElection>,
    poll_interval: Duration,
    metrics: ConsistencyMetrics,
}

impl ConsistencyWorker {
    pub fn new(
        check: Arc<dyn ConsistencyCheck>,
        leader: Arc<dyn LeaderElection>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            check,
            leader,
            poll_interval,
            metrics: ConsistencyMetrics::new(),
        }
    }

    /// Run one pass if this instance may. Returns `None` when skipped.
    pub async fn tick(&self) -> Option<ScanReport> {
        let name = self.check.name();
        if self.check.requires_leader() && !self.leader.is_this_instance_leader().await {
            debug!(check = name, "not the leader, skipping consistency pass");
            return None;
        }
        match self.check.run_pass().await {
            Ok(report) => {
                info!(
                    check = name,
                    scanned = report.scanned,
                    repaired = report.repaired,
                    deleted = report.deleted,
                    "consistency pass finished"
                );
                self.metrics.record(name, &report);
                Some(report)
            }
            Err(err) => {
                error!(check = name, "consistency pass failed: {:?}", err);
                None
            }
        }
    }

    pub async fn start(&self, mut shutdown_rx: watch::Receiver<()>) {
        info!(check = self.check.name(), "starting consistency check");
        loop {
            self.tick().await;
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {},
                _ = shutdown_rx.changed() => {
                    info!(check = self.check.name(), "consistency check shutting down");
                    break;
                }
            }
        }
    }
}
