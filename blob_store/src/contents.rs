//! Blob payloads and metadata returned by stores.

use std::fmt;

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use data_model::{BlobError, BlobId, BlobResult};
use futures::{stream::BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use url::Url;

pub type ByteStream = BoxStream<'static, BlobResult<Bytes>>;

/// Either the bytes of a blob or a URI the client can fetch them from.
pub enum BlobBody {
    Stream(ByteStream),
    Redirect(Url),
}

/// A blob handed out by a store. The receiver owns the underlying stream.
pub struct BlobContents {
    pub length: u64,
    pub body: BlobBody,
}

impl BlobContents {
    pub fn from_bytes(bytes: Bytes) -> Self {
        let length = bytes.len() as u64;
        Self {
            length,
            body: BlobBody::Stream(futures::stream::once(async move { Ok(bytes) }).boxed()),
        }
    }

    pub fn from_stream(stream: ByteStream, length: u64) -> Self {
        Self {
            length,
            body: BlobBody::Stream(stream),
        }
    }

    pub fn redirect(uri: Url, length: u64) -> Self {
        Self {
            length,
            body: BlobBody::Redirect(uri),
        }
    }

    pub fn redirect_uri(&self) -> Option<&Url> {
        match &self.body {
            BlobBody::Redirect(uri) => Some(uri),
            BlobBody::Stream(_) => None,
        }
    }

    pub fn is_redirect(&self) -> bool {
        self.redirect_uri().is_some()
    }

    pub fn into_stream(self) -> BlobResult<ByteStream> {
        match self.body {
            BlobBody::Stream(stream) => Ok(stream),
            BlobBody::Redirect(uri) => Err(BlobError::invalid_input(format!(
                "blob contents is a redirect to {}, not a byte stream",
                uri
            ))),
        }
    }

    /// Drain the stream into memory.
    pub async fn into_bytes(self) -> BlobResult<Bytes> {
        let mut stream = self.into_stream()?;
        let mut buf = BytesMut::new();
        while let Some(chunk) = stream.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf.freeze())
    }
}

impl fmt::Debug for BlobContents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let body = match &self.body {
            BlobBody::Stream(_) => "stream".to_string(),
            BlobBody::Redirect(uri) => format!("redirect({})", uri),
        };
        f.debug_struct("BlobContents")
            .field("length", &self.length)
            .field("body", &body)
            .finish()
    }
}

/// Metadata about a stored blob.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlobMetadata {
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

/// One entry of a namespace listing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ListedBlob {
    pub blob: BlobId,
    pub last_modified: DateTime<Utc>,
}
