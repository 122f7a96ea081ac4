//! Discovery of sibling instances in the same region.

use std::{
    net::IpAddr,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use data_model::{BlobError, BlobResult};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use url::Url;

#[async_trait]
pub trait PeerDiscovery: Send + Sync {
    /// Base URLs of every other instance, excluding this one.
    async fn find_other_instances(&self) -> BlobResult<Vec<Url>>;
}

/// A fixed list of peers from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticPeerDiscovery {
    peers: Vec<Url>,
}

impl StaticPeerDiscovery {
    pub fn new(peers: Vec<Url>) -> Self {
        Self { peers }
    }
}

#[async_trait]
impl PeerDiscovery for StaticPeerDiscovery {
    async fn find_other_instances(&self) -> BlobResult<Vec<Url>> {
        Ok(self.peers.clone())
    }
}

/// Resolves a headless service name to every instance behind it. Results
/// are cached for `ttl` since the lookup sits on the read path.
pub struct DnsPeerDiscovery {
    host: String,
    port: u16,
    scheme: String,
    own_addresses: Vec<IpAddr>,
    ttl: Duration,
    cache: Mutex<Option<(Instant, Vec<Url>)>>,
}

impl DnsPeerDiscovery {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        scheme: impl Into<String>,
        own_addresses: Vec<IpAddr>,
        ttl: Duration,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            scheme: scheme.into(),
            own_addresses,
            ttl,
            cache: Mutex::new(None),
        }
    }

    async fn resolve(&self) -> BlobResult<Vec<Url>> {
        let addrs = tokio::net::lookup_host((self.host.as_str(), self.port))
            .await
            .map_err(|e| {
                BlobError::network(anyhow::anyhow!("failed to resolve {}: {}", self.host, e))
            })?;
        let mut peers: Vec<Url> = Vec::new();
        for addr in addrs {
            if self.own_addresses.contains(&addr.ip()) {
                continue;
            }
            let url = format!("{}://{}", self.scheme, addr);
            match url.parse() {
                Ok(url) => peers.push(url),
                Err(e) => warn!(url = %url, "skipping unparsable peer address: {}", e),
            }
        }
        peers.sort();
        peers.dedup();
        Ok(peers)
    }
}

#[async_trait]
impl PeerDiscovery for DnsPeerDiscovery {
    async fn find_other_instances(&self) -> BlobResult<Vec<Url>> {
        let mut cache = self.cache.lock().await;
        if let Some((resolved_at, peers)) = cache.as_ref() {
            if resolved_at.elapsed() < self.ttl {
                return Ok(peers.clone());
            }
        }
        let peers = self.resolve().await?;
        debug!(host = %self.host, count = peers.len(), "resolved peer instances");
        *cache = Some((Instant::now(), peers.clone()));
        Ok(peers)
    }
}
