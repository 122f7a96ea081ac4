//! Relay backend: forwards every operation to an upstream instance's blob
//! API, typically a regional hub in a hierarchical deployment.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use data_model::{BlobError, BlobId, BlobResult, LastAccessTracking, NamespaceId};
use futures::{stream::BoxStream, StreamExt, TryStreamExt};
use reqwest::{redirect::Policy, Method, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::{
    authorize,
    http::{blob_sub_url, blob_url, error_from_status, namespace_url, RedirectUri},
    BackendInfo,
    BackendKind,
    BlobContents,
    BlobMetadata,
    BlobStore,
    ListedBlob,
    ServiceCredentials,
};

fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RelayConfig {
    /// Base URL of the upstream instance.
    pub url: Url,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

pub struct RelayStore {
    client: reqwest::Client,
    base: Url,
    credentials: Arc<dyn ServiceCredentials>,
}

impl RelayStore {
    pub fn new(config: RelayConfig, credentials: Arc<dyn ServiceCredentials>) -> BlobResult<Self> {
        let client = reqwest::Client::builder()
            .redirect(Policy::none())
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(BlobError::network)?;
        Ok(Self {
            client,
            base: config.url,
            credentials,
        })
    }

    async fn send(&self, request: RequestBuilder) -> BlobResult<Response> {
        authorize(request, self.credentials.as_ref())
            .await?
            .send()
            .await
            .map_err(BlobError::network)
    }

    async fn failure(response: Response, ns: &NamespaceId, blob: Option<&BlobId>) -> BlobError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        error_from_status(status, body, ns, blob)
    }
}

#[async_trait]
impl BlobStore for RelayStore {
    fn info(&self) -> BackendInfo {
        BackendInfo {
            kind: BackendKind::Relay,
            root_capable: true,
            supports_consistency_scan: false,
            local: false,
        }
    }

    async fn put(&self, ns: &NamespaceId, blob: &BlobId, content: Bytes) -> BlobResult<BlobId> {
        let url = blob_url(&self.base, ns, blob)?;
        let response = self.send(self.client.put(url).body(content)).await?;
        if !response.status().is_success() {
            return Err(Self::failure(response, ns, Some(blob)).await);
        }
        Ok(*blob)
    }

    async fn get(
        &self,
        ns: &NamespaceId,
        blob: &BlobId,
        _tracking: LastAccessTracking,
        supports_redirect: bool,
    ) -> BlobResult<BlobContents> {
        let mut url = blob_url(&self.base, ns, blob)?;
        if supports_redirect {
            url.query_pairs_mut().append_pair("allow_redirect", "true");
        }
        let response = self.send(self.client.get(url)).await?;
        let status = response.status();

        if status.is_redirection() {
            let location = response
                .headers()
                .get(reqwest::header::LOCATION)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.parse::<Url>().ok())
                .ok_or_else(|| {
                    BlobError::network(anyhow::anyhow!("upstream redirect without a location"))
                })?;
            let metadata = self.metadata(ns, blob).await?;
            return Ok(BlobContents::redirect(location, metadata.size_bytes));
        }
        if !status.is_success() {
            return Err(Self::failure(response, ns, Some(blob)).await);
        }

        match response.content_length() {
            Some(length) => {
                let stream = response.bytes_stream().map_err(BlobError::network).boxed();
                Ok(BlobContents::from_stream(stream, length))
            }
            None => {
                let bytes = response.bytes().await.map_err(BlobError::network)?;
                Ok(BlobContents::from_bytes(bytes))
            }
        }
    }

    async fn exists(&self, ns: &NamespaceId, blob: &BlobId, force_check: bool) -> BlobResult<bool> {
        let mut url = blob_url(&self.base, ns, blob)?;
        if force_check {
            url.query_pairs_mut().append_pair("force_check", "true");
        }
        let response = self.send(self.client.head(url)).await?;
        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => Err(Self::failure(response, ns, Some(blob)).await),
        }
    }

    async fn metadata(&self, ns: &NamespaceId, blob: &BlobId) -> BlobResult<BlobMetadata> {
        let url = blob_sub_url(&self.base, ns, blob, "metadata")?;
        let response = self.send(self.client.get(url)).await?;
        if !response.status().is_success() {
            return Err(Self::failure(response, ns, Some(blob)).await);
        }
        response.json().await.map_err(BlobError::network)
    }

    async fn delete(&self, ns: &NamespaceId, blob: &BlobId) -> BlobResult<bool> {
        let url = blob_url(&self.base, ns, blob)?;
        let response = self.send(self.client.delete(url)).await?;
        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => Err(Self::failure(response, ns, Some(blob)).await),
        }
    }

    async fn delete_namespace(&self, ns: &NamespaceId) -> BlobResult<()> {
        let url = namespace_url(&self.base, ns)?;
        let response = self.send(self.client.delete(url)).await?;
        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Ok(()),
            _ => Err(Self::failure(response, ns, None).await),
        }
    }

    fn list(
        &self,
        _ns: &NamespaceId,
        _start_after: Option<BlobId>,
    ) -> BoxStream<'static, BlobResult<ListedBlob>> {
        futures::stream::once(async {
            Err(BlobError::Unsupported {
                operation: "list",
                backend: "relay",
            })
        })
        .boxed()
    }

    async fn read_redirect(&self, ns: &NamespaceId, blob: &BlobId) -> BlobResult<Option<Url>> {
        self.redirect(Method::GET, ns, blob).await
    }

    async fn write_redirect(&self, ns: &NamespaceId, blob: &BlobId) -> BlobResult<Option<Url>> {
        self.redirect(Method::PUT, ns, blob).await
    }
}

impl RelayStore {
    async fn redirect(
        &self,
        method: Method,
        ns: &NamespaceId,
        blob: &BlobId,
    ) -> BlobResult<Option<Url>> {
        let url = blob_sub_url(&self.base, ns, blob, "redirect")?;
        let response = self.send(self.client.request(method, url)).await?;
        match response.status() {
            StatusCode::NO_CONTENT => Ok(None),
            status if status.is_success() => {
                let redirect: RedirectUri = response.json().await.map_err(BlobError::network)?;
                debug!(namespace = %ns, blob = %blob, "upstream issued redirect");
                Ok(Some(redirect.uri))
            }
            _ => Err(Self::failure(response, ns, Some(blob)).await),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{testing::MockServer, StaticCredentials};

    fn ns() -> NamespaceId {
        NamespaceId::new("test-ns").unwrap()
    }

    async fn relay(server: &MockServer) -> RelayStore {
        let url = server.spawn().await;
        RelayStore::new(
            RelayConfig {
                url,
                timeout_secs: 5,
            },
            Arc::new(StaticCredentials::anonymous()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_relay_forwards_operations() {
        let server = MockServer::new();
        let store = relay(&server).await;
        let content = Bytes::from_static(b"relayed content");
        let id = BlobId::from_content(&content);

        assert!(!store.exists(&ns(), &id, false).await.unwrap());
        store.put(&ns(), &id, content.clone()).await.unwrap();
        assert_eq!(server.store.len(), 1);
        assert!(store.exists(&ns(), &id, true).await.unwrap());

        let fetched = store
            .get(&ns(), &id, LastAccessTracking::Track, false)
            .await
            .unwrap()
            .into_bytes()
            .await
            .unwrap();
        assert_eq!(fetched, content);

        let metadata = store.metadata(&ns(), &id).await.unwrap();
        assert_eq!(metadata.size_bytes, content.len() as u64);

        assert!(store.delete(&ns(), &id).await.unwrap());
        assert!(!store.delete(&ns(), &id).await.unwrap());
    }

    #[tokio::test]
    async fn test_relay_maps_missing_blob() {
        let server = MockServer::new();
        let store = relay(&server).await;
        let id = BlobId::from_content(b"missing");

        let err = store
            .get(&ns(), &id, LastAccessTracking::Track, false)
            .await
            .unwrap_err();
        assert!(matches!(err, BlobError::BlobNotFound { .. }));
    }

    #[tokio::test]
    async fn test_relay_list_is_unsupported() {
        let server = MockServer::new();
        let store = relay(&server).await;
        let result: BlobResult<Vec<ListedBlob>> = store.list(&ns(), None).try_collect().await;
        assert!(matches!(result, Err(BlobError::Unsupported { .. })));
    }
}
