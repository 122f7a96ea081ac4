//! Error taxonomy shared by stores, the blob index and the blob service.

use std::fmt;

use crate::{BlobId, NamespaceId};

/// Result type for blob storage operations.
pub type BlobResult<T> = Result<T, BlobError>;

/// Errors that can occur during blob storage operations.
#[derive(Debug)]
pub enum BlobError {
    /// Blob is absent in the queried scope (one backend, one region, one
    /// index entry).
    BlobNotFound {
        namespace: NamespaceId,
        blob: BlobId,
    },

    /// The physical container for a namespace does not exist.
    NamespaceNotFound { namespace: NamespaceId },

    /// Fetching the blob from other regions failed. A specialization of
    /// `BlobNotFound`.
    ReplicationFailed {
        namespace: NamespaceId,
        blob: BlobId,
        reason: String,
    },

    /// Declared identifier does not match the content hash.
    HashMismatch {
        namespace: NamespaceId,
        declared: BlobId,
        actual: BlobId,
    },

    /// Backend rate-limited the call.
    TooManyRequests { source: anyhow::Error },

    /// Malformed identifier or request.
    InvalidInput { reason: String },

    /// Operation not supported by this backend.
    Unsupported {
        operation: &'static str,
        backend: &'static str,
    },

    /// I/O error during blob operation.
    IoError { source: std::io::Error },

    /// Network error (object stores, relays, peers).
    NetworkError { source: anyhow::Error },

    /// Generic error.
    Other { source: anyhow::Error },
}

impl BlobError {
    pub fn blob_not_found(namespace: &NamespaceId, blob: &BlobId) -> Self {
        BlobError::BlobNotFound {
            namespace: namespace.clone(),
            blob: *blob,
        }
    }

    pub fn namespace_not_found(namespace: &NamespaceId) -> Self {
        BlobError::NamespaceNotFound {
            namespace: namespace.clone(),
        }
    }

    pub fn replication_failed(namespace: &NamespaceId, blob: &BlobId, reason: &str) -> Self {
        BlobError::ReplicationFailed {
            namespace: namespace.clone(),
            blob: *blob,
            reason: reason.to_string(),
        }
    }

    pub fn invalid_input(reason: impl Into<String>) -> Self {
        BlobError::InvalidInput {
            reason: reason.into(),
        }
    }

    pub fn network(source: impl Into<anyhow::Error>) -> Self {
        BlobError::NetworkError {
            source: source.into(),
        }
    }

    /// True for every "this is not here" kind, including a missing namespace
    /// container. Tier fallthrough uses this.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            BlobError::BlobNotFound { .. } |
                BlobError::NamespaceNotFound { .. } |
                BlobError::ReplicationFailed { .. }
        )
    }

    /// True for `BlobNotFound` and its replication specialization. Fallback
    /// steps in the blob service only catch these.
    pub fn is_blob_not_found(&self) -> bool {
        matches!(
            self,
            BlobError::BlobNotFound { .. } | BlobError::ReplicationFailed { .. }
        )
    }
}

impl fmt::Display for BlobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlobError::BlobNotFound { namespace, blob } => {
                write!(f, "Blob {} not found in namespace {}", blob, namespace)
            }
            BlobError::NamespaceNotFound { namespace } => {
                write!(f, "Namespace {} not found", namespace)
            }
            BlobError::ReplicationFailed {
                namespace,
                blob,
                reason,
            } => write!(
                f,
                "Failed to replicate blob {} in namespace {}: {}",
                blob, namespace, reason
            ),
            BlobError::HashMismatch {
                namespace,
                declared,
                actual,
            } => write!(
                f,
                "Hash mismatch in namespace {}: declared {} but content hashes to {}",
                namespace, declared, actual
            ),
            BlobError::TooManyRequests { source } => write!(f, "Too many requests: {}", source),
            BlobError::InvalidInput { reason } => write!(f, "Invalid input: {}", reason),
            BlobError::Unsupported { operation, backend } => {
                write!(f, "Operation {} is not supported by {}", operation, backend)
            }
            BlobError::IoError { source } => write!(f, "I/O error: {}", source),
            BlobError::NetworkError { source } => write!(f, "Network error: {}", source),
            BlobError::Other { source } => write!(f, "Blob store error: {}", source),
        }
    }
}

impl std::error::Error for BlobError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BlobError::IoError { source } => Some(source),
            BlobError::NetworkError { source } |
            BlobError::TooManyRequests { source } |
            BlobError::Other { source } => Some(source.as_ref()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for BlobError {
    fn from(err: std::io::Error) -> Self {
        BlobError::IoError { source: err }
    }
}

impl From<anyhow::Error> for BlobError {
    fn from(err: anyhow::Error) -> Self {
        BlobError::Other { source: err }
    }
}
