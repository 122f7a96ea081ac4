//! On-demand replication: fetch a blob missing locally from the closest
//! region the index says holds it.

use std::{sync::Arc, time::Duration};

use blob_index::BlobIndex;
use blob_store::{
    authorize,
    http::{blob_url, ON_DEMAND_REPLICATION_HEADER},
    ServiceCredentials,
};
use bytes::Bytes;
use data_model::{BlobError, BlobId, BlobResult, NamespaceId};
use reqwest::StatusCode;
use tracing::{debug, info, warn};

use crate::peers::PeerRegistry;

pub struct Replicator {
    client: reqwest::Client,
    index: Arc<dyn BlobIndex>,
    peers: Arc<PeerRegistry>,
    credentials: Arc<dyn ServiceCredentials>,
    timeout: Duration,
}

impl Replicator {
    pub fn new(
        index: Arc<dyn BlobIndex>,
        peers: Arc<PeerRegistry>,
        credentials: Arc<dyn ServiceCredentials>,
        timeout: Duration,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            index,
            peers,
            credentials,
            timeout,
        }
    }

    /// Download the blob from another region. Candidates are tried in
    /// ascending latency order and the first `200` wins. The request tells
    /// the remote not to replicate in turn.
    pub async fn fetch(&self, ns: &NamespaceId, blob: &BlobId) -> BlobResult<Bytes> {
        let regions = match self.index.get_blob_regions(ns, blob).await {
            Ok(regions) => regions,
            Err(e) if e.is_blob_not_found() => {
                return Err(BlobError::replication_failed(
                    ns,
                    blob,
                    "blob is not indexed in any region",
                ))
            }
            Err(e) => return Err(e),
        };

        let candidates = self.peers.rank(&regions, self.index.current_region());
        if candidates.is_empty() {
            return Err(BlobError::replication_failed(
                ns,
                blob,
                &format!("no configured region among {:?} holds the blob", regions),
            ));
        }

        for region in candidates {
            let url = blob_url(&region.url, ns, blob)?;
            let request = self
                .client
                .get(url)
                .header(ON_DEMAND_REPLICATION_HEADER, "false")
                .timeout(self.timeout);
            let response = match authorize(request, self.credentials.as_ref()).await?.send().await {
                Ok(response) => response,
                Err(e) => {
                    warn!(region = %region.name, namespace = %ns, blob = %blob, error = %e, "replication request failed");
                    continue;
                }
            };
            match response.status() {
                StatusCode::OK => match response.bytes().await {
                    Ok(bytes) => {
                        info!(
                            region = %region.name,
                            namespace = %ns,
                            blob = %blob,
                            size = bytes.len(),
                            "replicated blob from region"
                        );
                        return Ok(bytes);
                    }
                    Err(e) => {
                        warn!(region = %region.name, error = %e, "replication body read failed")
                    }
                },
                status => debug!(region = %region.name, %status, "region did not serve blob"),
            }
        }

        Err(BlobError::replication_failed(
            ns,
            blob,
            "no region returned the blob",
        ))
    }
}
