//! Object storage backend shared by S3 and Azure.
//!
//! A namespace resolves to a storage pool through its policy, and the pool to
//! a bucket (container) name through [`BucketNaming`]. Blobs are stored under
//! `<hash[0:4]>/<hash>` inside that bucket. Connections are cached per bucket
//! name and built at most once, and buckets are provisioned at most once per
//! process, on first write.

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_stream::try_stream;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use data_model::{BlobError, BlobId, BlobResult, LastAccessTracking, NamespaceId};
use futures::{stream::BoxStream, StreamExt, TryStreamExt};
use object_store::{path::Path as ObjectPath, signer::Signer, ObjectStore, PutPayload};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::{debug, info};
use url::Url;

use crate::{
    BackendInfo,
    BackendKind,
    BlobContents,
    BlobMetadata,
    BlobStore,
    ListedBlob,
    NamespacePolicyResolver,
};

fn default_pool() -> String {
    "default".to_string()
}

/// Maps storage pools to bucket names.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BucketNaming {
    pub bucket_prefix: String,

    /// The pool stored directly in `bucket_prefix`.
    #[serde(default = "default_pool")]
    pub default_pool: String,

    /// Explicit bucket names for specific pools.
    #[serde(default)]
    pub pool_overrides: HashMap<String, String>,
}

impl BucketNaming {
    pub fn new(bucket_prefix: impl Into<String>) -> Self {
        Self {
            bucket_prefix: bucket_prefix.into(),
            default_pool: default_pool(),
            pool_overrides: HashMap::new(),
        }
    }

    pub fn resolve(&self, pool: &str) -> String {
        if let Some(bucket) = self.pool_overrides.get(pool) {
            return bucket.clone();
        }
        if pool.is_empty() || pool == self.default_pool {
            return self.bucket_prefix.clone();
        }
        format!("{}-{}", self.bucket_prefix, pool)
    }
}

/// A connection to one bucket.
pub struct BucketHandle {
    pub name: String,
    pub store: Arc<dyn ObjectStore>,
    pub signer: Option<Arc<dyn Signer>>,
    provisioned: OnceCell<()>,
}

impl BucketHandle {
    pub fn new(name: impl Into<String>, store: Arc<dyn ObjectStore>) -> Self {
        Self {
            name: name.into(),
            store,
            signer: None,
            provisioned: OnceCell::new(),
        }
    }

    pub fn with_signer(mut self, signer: Arc<dyn Signer>) -> Self {
        self.signer = Some(signer);
        self
    }
}

/// Vendor-specific parts of an object storage backend.
#[async_trait]
pub trait BucketProvider: Send + Sync + 'static {
    fn kind(&self) -> BackendKind;

    async fn connect(&self, bucket: &str) -> BlobResult<BucketHandle>;

    /// Create the bucket if it is missing and deny public access to it.
    async fn provision(&self, bucket: &str) -> BlobResult<()>;

    /// Presigned URI for `method` on `path`, `None` when the bucket cannot
    /// sign.
    async fn presign(
        &self,
        handle: &BucketHandle,
        path: &ObjectPath,
        method: Method,
        expires_in: Duration,
    ) -> BlobResult<Option<Url>> {
        match &handle.signer {
            Some(signer) => signer
                .signed_url(method, path, expires_in)
                .await
                .map(Some)
                .map_err(BlobError::network),
            None => Ok(None),
        }
    }
}

struct Inner<P> {
    provider: P,
    naming: BucketNaming,
    policies: Arc<dyn NamespacePolicyResolver>,
    handles: DashMap<String, Arc<OnceCell<Arc<BucketHandle>>>>,
}

impl<P: BucketProvider> Inner<P> {
    fn bucket_name(&self, ns: &NamespaceId) -> BlobResult<String> {
        let policy = self.policies.get_policies_for_ns(ns)?;
        Ok(self.naming.resolve(&policy.storage_pool))
    }

    async fn bucket(&self, ns: &NamespaceId) -> BlobResult<Arc<BucketHandle>> {
        let name = self.bucket_name(ns)?;
        let cell = self.handles.entry(name.clone()).or_default().clone();
        let handle = cell
            .get_or_try_init(|| async {
                debug!(bucket = %name, kind = %self.provider.kind(), "connecting to bucket");
                self.provider.connect(&name).await.map(Arc::new)
            })
            .await?;
        Ok(handle.clone())
    }
}

/// Blob store over an object storage service, generic over the vendor.
pub struct ObjectBackend<P> {
    inner: Arc<Inner<P>>,
    create_bucket_if_missing: bool,
    presign_expiry: Duration,
}

impl<P: BucketProvider> ObjectBackend<P> {
    pub fn new(provider: P, naming: BucketNaming, policies: Arc<dyn NamespacePolicyResolver>) -> Self {
        Self {
            inner: Arc::new(Inner {
                provider,
                naming,
                policies,
                handles: DashMap::new(),
            }),
            create_bucket_if_missing: false,
            presign_expiry: Duration::from_secs(15 * 60),
        }
    }

    pub fn with_create_bucket_if_missing(mut self, create: bool) -> Self {
        self.create_bucket_if_missing = create;
        self
    }

    pub fn with_presign_expiry(mut self, expiry: Duration) -> Self {
        self.presign_expiry = expiry;
        self
    }

    pub fn provider(&self) -> &P {
        &self.inner.provider
    }

    pub fn object_path(blob: &BlobId) -> ObjectPath {
        let hex = blob.to_hex();
        ObjectPath::from(format!("{}/{}", &hex[0..4], hex))
    }

    async fn provisioned_bucket(&self, ns: &NamespaceId) -> BlobResult<Arc<BucketHandle>> {
        let handle = self.inner.bucket(ns).await?;
        if self.create_bucket_if_missing {
            handle
                .provisioned
                .get_or_try_init(|| async {
                    info!(bucket = %handle.name, "provisioning bucket");
                    self.inner.provider.provision(&handle.name).await
                })
                .await?;
        }
        Ok(handle)
    }
}

/// Map an object store failure onto the error taxonomy.
fn map_error(err: object_store::Error, ns: &NamespaceId, blob: Option<&BlobId>) -> BlobError {
    let message = err.to_string();
    if message.contains("NoSuchBucket") || message.contains("ContainerNotFound") {
        return BlobError::namespace_not_found(ns);
    }
    match err {
        object_store::Error::NotFound { .. } => match blob {
            Some(blob) => BlobError::blob_not_found(ns, blob),
            None => BlobError::namespace_not_found(ns),
        },
        _ if message.contains("429") ||
            message.contains("SlowDown") ||
            message.contains("TooManyRequests") =>
        {
            BlobError::TooManyRequests { source: err.into() }
        }
        _ => BlobError::network(err),
    }
}

#[async_trait]
impl<P: BucketProvider> BlobStore for ObjectBackend<P> {
    fn info(&self) -> BackendInfo {
        BackendInfo {
            kind: self.inner.provider.kind(),
            root_capable: true,
            supports_consistency_scan: true,
            local: false,
        }
    }

    async fn put(&self, ns: &NamespaceId, blob: &BlobId, content: Bytes) -> BlobResult<BlobId> {
        let handle = self.provisioned_bucket(ns).await?;
        let path = Self::object_path(blob);
        match handle.store.put(&path, PutPayload::from(content)).await {
            Ok(_) => {}
            Err(object_store::Error::AlreadyExists { .. }) |
            Err(object_store::Error::Precondition { .. }) => {
                debug!(namespace = %ns, blob = %blob, "blob already present in bucket");
            }
            Err(e) => return Err(map_error(e, ns, Some(blob))),
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
        let handle = self.inner.bucket(ns).await?;
        let path = Self::object_path(blob);

        if supports_redirect {
            let uri = self
                .inner
                .provider
                .presign(&handle, &path, Method::GET, self.presign_expiry)
                .await?;
            if let Some(uri) = uri {
                let meta = handle
                    .store
                    .head(&path)
                    .await
                    .map_err(|e| map_error(e, ns, Some(blob)))?;
                return Ok(BlobContents::redirect(uri, meta.size));
            }
        }

        let result = handle
            .store
            .get(&path)
            .await
            .map_err(|e| map_error(e, ns, Some(blob)))?;
        let length = result.meta.size;
        let stream = result.into_stream().map_err(BlobError::network).boxed();
        Ok(BlobContents::from_stream(stream, length))
    }

    async fn exists(&self, ns: &NamespaceId, blob: &BlobId, _force_check: bool) -> BlobResult<bool> {
        let handle = self.inner.bucket(ns).await?;
        match handle.store.head(&Self::object_path(blob)).await {
            Ok(_) => Ok(true),
            Err(e) => match map_error(e, ns, Some(blob)) {
                err if err.is_not_found() => Ok(false),
                err => Err(err),
            },
        }
    }

    async fn metadata(&self, ns: &NamespaceId, blob: &BlobId) -> BlobResult<BlobMetadata> {
        let handle = self.inner.bucket(ns).await?;
        let meta = handle
            .store
            .head(&Self::object_path(blob))
            .await
            .map_err(|e| map_error(e, ns, Some(blob)))?;
        Ok(BlobMetadata {
            size_bytes: meta.size,
            created_at: meta.last_modified,
        })
    }

    async fn delete(&self, ns: &NamespaceId, blob: &BlobId) -> BlobResult<bool> {
        if !self.exists(ns, blob, true).await? {
            return Ok(false);
        }
        let handle = self.inner.bucket(ns).await?;
        match handle.store.delete(&Self::object_path(blob)).await {
            Ok(()) => Ok(true),
            Err(e) => match map_error(e, ns, Some(blob)) {
                err if err.is_not_found() => Ok(false),
                err => Err(err),
            },
        }
    }

    /// Removes every object in the namespace's bucket. Refused while another
    /// known namespace resolves to the same bucket.
    async fn delete_namespace(&self, ns: &NamespaceId) -> BlobResult<()> {
        let bucket = self.inner.bucket_name(ns)?;
        let shared_with = self
            .inner
            .policies
            .namespaces()
            .into_iter()
            .find(|other| {
                other != ns &&
                    self.inner
                        .bucket_name(other)
                        .is_ok_and(|name| name == bucket)
            });
        if let Some(other) = shared_with {
            return Err(BlobError::invalid_input(format!(
                "bucket {} of namespace {} is shared with namespace {}",
                bucket, ns, other
            )));
        }

        let handle = self.inner.bucket(ns).await?;
        let mut objects = handle.store.list(None);
        while let Some(meta) = objects.next().await {
            let meta = match meta {
                Ok(meta) => meta,
                Err(e) => match map_error(e, ns, None) {
                    err if err.is_not_found() => return Ok(()),
                    err => return Err(err),
                },
            };
            match handle.store.delete(&meta.location).await {
                Ok(()) | Err(object_store::Error::NotFound { .. }) => {}
                Err(e) => return Err(map_error(e, ns, None)),
            }
        }
        Ok(())
    }

    fn container(&self, ns: &NamespaceId) -> BlobResult<String> {
        self.inner.bucket_name(ns)
    }

    /// Keys sort like identifiers, and object services list keys in
    /// lexicographic order.
    fn list(
        &self,
        ns: &NamespaceId,
        start_after: Option<BlobId>,
    ) -> BoxStream<'static, BlobResult<ListedBlob>> {
        let inner = self.inner.clone();
        let ns = ns.clone();
        let offset = start_after.map(|after| Self::object_path(&after));
        let stream = try_stream! {
            let handle = inner.bucket(&ns).await?;
            let mut objects = match &offset {
                Some(offset) => handle.store.list_with_offset(None, offset),
                None => handle.store.list(None),
            };
            while let Some(meta) = objects.next().await {
                let meta = meta.map_err(|e| map_error(e, &ns, None))?;
                let parsed = meta
                    .location
                    .filename()
                    .and_then(|name| name.parse::<BlobId>().ok());
                if let Some(blob) = parsed {
                    yield ListedBlob {
                        blob,
                        last_modified: meta.last_modified,
                    };
                }
            }
        };
        stream.boxed()
    }

    async fn read_redirect(&self, ns: &NamespaceId, blob: &BlobId) -> BlobResult<Option<Url>> {
        let handle = self.inner.bucket(ns).await?;
        self.inner
            .provider
            .presign(
                &handle,
                &Self::object_path(blob),
                Method::GET,
                self.presign_expiry,
            )
            .await
    }

    async fn write_redirect(&self, ns: &NamespaceId, blob: &BlobId) -> BlobResult<Option<Url>> {
        let handle = self.provisioned_bucket(ns).await?;
        self.inner
            .provider
            .presign(
                &handle,
                &Self::object_path(blob),
                Method::PUT,
                self.presign_expiry,
            )
            .await
    }
}
