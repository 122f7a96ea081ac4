//! Peer backend: read-only fan-out to sibling instances in the same region.
//!
//! Reads are sent to every discovered peer at once and the first success
//! wins. Each call carries a short timeout so a slow or partitioned peer
//! cannot stall the request. Writes, deletes and listings are no-ops.

use std::{future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use data_model::{BlobError, BlobId, BlobResult, LastAccessTracking, NamespaceId};
use futures::{
    stream::{BoxStream, FuturesUnordered},
    StreamExt,
};
use reqwest::{Method, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use crate::{
    authorize,
    http::{blob_sub_url, blob_url, ON_DEMAND_REPLICATION_HEADER, SKIP_PEERS_HEADER},
    BackendInfo,
    BackendKind,
    BlobContents,
    BlobMetadata,
    BlobStore,
    ListedBlob,
    PeerDiscovery,
    ServiceCredentials,
};

fn default_timeout_ms() -> u64 {
    1_000
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerConfig {
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
        }
    }
}

pub struct PeerStore {
    client: reqwest::Client,
    discovery: Arc<dyn PeerDiscovery>,
    credentials: Arc<dyn ServiceCredentials>,
    timeout: Duration,
}

impl PeerStore {
    pub fn new(
        config: PeerConfig,
        discovery: Arc<dyn PeerDiscovery>,
        credentials: Arc<dyn ServiceCredentials>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            discovery,
            credentials,
            timeout: Duration::from_millis(config.timeout_ms),
        }
    }

    async fn send(&self, method: Method, url: Url) -> BlobResult<Response> {
        let request = self
            .client
            .request(method, url)
            .header(SKIP_PEERS_HEADER, "true")
            .header(ON_DEMAND_REPLICATION_HEADER, "false")
            .timeout(self.timeout);
        authorize(request, self.credentials.as_ref())
            .await?
            .send()
            .await
            .map_err(BlobError::network)
    }

    /// Run `request` against every peer concurrently and return the first
    /// `Some`. Peers answering `None` or failing are skipped, and a failed
    /// discovery counts as no peers.
    async fn race<T, F, Fut>(&self, request: F) -> BlobResult<Option<T>>
    where
        F: Fn(Url) -> Fut,
        Fut: Future<Output = BlobResult<Option<T>>>,
    {
        let peers = match self.discovery.find_other_instances().await {
            Ok(peers) => peers,
            Err(e) => {
                warn!(error = %e, "peer discovery failed");
                return Ok(None);
            }
        };
        let mut pending: FuturesUnordered<_> = peers
            .into_iter()
            .map(|peer| {
                let call = request(peer.clone());
                async move { (peer, call.await) }
            })
            .collect();
        while let Some((peer, result)) = pending.next().await {
            match result {
                Ok(Some(value)) => return Ok(Some(value)),
                Ok(None) => {}
                Err(e) => debug!(peer = %peer, error = %e, "peer request failed"),
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl BlobStore for PeerStore {
    fn info(&self) -> BackendInfo {
        BackendInfo {
            kind: BackendKind::Peer,
            root_capable: false,
            supports_consistency_scan: false,
            local: false,
        }
    }

    async fn put(&self, _ns: &NamespaceId, blob: &BlobId, _content: Bytes) -> BlobResult<BlobId> {
        Ok(*blob)
    }

    async fn get(
        &self,
        ns: &NamespaceId,
        blob: &BlobId,
        _tracking: LastAccessTracking,
        _supports_redirect: bool,
    ) -> BlobResult<BlobContents> {
        let found = self
            .race(|peer| async move {
                let response = self.send(Method::GET, blob_url(&peer, ns, blob)?).await?;
                if response.status() != StatusCode::OK {
                    return Ok(None);
                }
                let bytes: Bytes = response.bytes().await.map_err(BlobError::network)?;
                Ok(Some(bytes))
            })
            .await?;
        found
            .map(BlobContents::from_bytes)
            .ok_or_else(|| BlobError::blob_not_found(ns, blob))
    }

    async fn exists(&self, ns: &NamespaceId, blob: &BlobId, _force_check: bool) -> BlobResult<bool> {
        let found = self
            .race(|peer| async move {
                let response = self.send(Method::HEAD, blob_url(&peer, ns, blob)?).await?;
                Ok((response.status() == StatusCode::OK).then_some(()))
            })
            .await?;
        Ok(found.is_some())
    }

    async fn metadata(&self, ns: &NamespaceId, blob: &BlobId) -> BlobResult<BlobMetadata> {
        let found = self
            .race(|peer| async move {
                let url = blob_sub_url(&peer, ns, blob, "metadata")?;
                let response = self.send(Method::GET, url).await?;
                if response.status() != StatusCode::OK {
                    return Ok(None);
                }
                let metadata: BlobMetadata =
                    response.json().await.map_err(BlobError::network)?;
                Ok(Some(metadata))
            })
            .await?;
        found.ok_or_else(|| BlobError::blob_not_found(ns, blob))
    }

    async fn delete(&self, _ns: &NamespaceId, _blob: &BlobId) -> BlobResult<bool> {
        Ok(false)
    }

    async fn delete_namespace(&self, _ns: &NamespaceId) -> BlobResult<()> {
        Ok(())
    }

    fn list(
        &self,
        _ns: &NamespaceId,
        _start_after: Option<BlobId>,
    ) -> BoxStream<'static, BlobResult<ListedBlob>> {
        futures::stream::empty().boxed()
    }
}
