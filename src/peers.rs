//! Latency-ranked view of the other regions.

use std::{
    cmp::Ordering,
    time::{Duration, Instant},
};

use blob_store::http::HEALTH_LIVE_PATH;
use dashmap::DashMap;
use futures::future::join_all;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::PeerRegion;

pub struct PeerRegistry {
    regions: Vec<PeerRegion>,
    // Last measured round trip per region, `None` when the probe failed.
    latencies: DashMap<String, Option<Duration>>,
    client: reqwest::Client,
    probe_timeout: Duration,
}

impl PeerRegistry {
    pub fn new(regions: Vec<PeerRegion>, probe_timeout: Duration) -> Self {
        Self {
            regions,
            latencies: DashMap::new(),
            client: reqwest::Client::new(),
            probe_timeout,
        }
    }

    pub fn regions(&self) -> &[PeerRegion] {
        &self.regions
    }

    pub fn latency(&self, region: &str) -> Option<Duration> {
        self.latencies.get(region).and_then(|latency| *latency)
    }

    async fn probe(&self, region: &PeerRegion) -> Option<Duration> {
        let url = region.url.join(HEALTH_LIVE_PATH).ok()?;
        let started = Instant::now();
        match self
            .client
            .get(url)
            .timeout(self.probe_timeout)
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => Some(started.elapsed()),
            Ok(response) => {
                debug!(region = %region.name, status = %response.status(), "latency probe failed");
                None
            }
            Err(e) => {
                debug!(region = %region.name, error = %e, "latency probe failed");
                None
            }
        }
    }

    /// Measure every region concurrently.
    pub async fn refresh(&self) {
        let measured = join_all(self.regions.iter().map(|region| async move {
            (region.name.clone(), self.probe(region).await)
        }))
        .await;
        for (name, latency) in measured {
            if latency.is_none() {
                warn!(region = %name, "region unreachable");
            }
            self.latencies.insert(name, latency);
        }
    }

    /// Configured regions among `holders`, excluding `current`, fastest
    /// first. Unreachable or unmeasured regions go last in configuration
    /// order.
    pub fn rank(&self, holders: &[String], current: &str) -> Vec<PeerRegion> {
        let mut candidates: Vec<(PeerRegion, Option<Duration>)> = self
            .regions
            .iter()
            .filter(|region| region.name != current && holders.contains(&region.name))
            .map(|region| (region.clone(), self.latency(&region.name)))
            .collect();
        candidates.sort_by(|(_, a), (_, b)| match (a, b) {
            (Some(a), Some(b)) => a.cmp(b),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        });
        candidates.into_iter().map(|(region, _)| region).collect()
    }

    pub async fn start(&self, interval: Duration, mut shutdown_rx: watch::Receiver<()>) {
        if self.regions.is_empty() {
            return;
        }
        info!(regions = self.regions.len(), "starting region latency probes");
        loop {
            self.refresh().await;
            tokio::select! {
                _ = tokio::time::sleep(interval) => {},
                _ = shutdown_rx.changed() => {
                    info!("region latency probes shutting down");
                    break;
                }
            }
        }
    }
}
