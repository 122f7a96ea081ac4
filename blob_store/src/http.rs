//! HTTP conventions shared by the blob API routes and the backends that
//! talk to other instances (relay, peer, on-demand replication).

use data_model::{BlobError, BlobId, NamespaceId};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use url::Url;

/// Set to `false` on a GET to stop the receiving instance from replicating
/// the blob from other regions.
pub const ON_DEMAND_REPLICATION_HEADER: &str = "x-blob-on-demand-replication";

/// Set to `true` so the receiving instance does not fan the request out to
/// its own peers.
pub const SKIP_PEERS_HEADER: &str = "x-blob-skip-peers";

pub const HEALTH_LIVE_PATH: &str = "/health/live";

/// Body of the `.../redirect` endpoints. They answer `204 No Content` when
/// the serving store cannot presign.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RedirectUri {
    pub uri: Url,
}

pub fn namespace_url(base: &Url, ns: &NamespaceId) -> Result<Url, BlobError> {
    base.join(&format!("api/v1/blobs/{}", ns))
        .map_err(|e| BlobError::invalid_input(format!("invalid base url {}: {}", base, e)))
}

pub fn blob_url(base: &Url, ns: &NamespaceId, blob: &BlobId) -> Result<Url, BlobError> {
    base.join(&format!("api/v1/blobs/{}/{}", ns, blob))
        .map_err(|e| BlobError::invalid_input(format!("invalid base url {}: {}", base, e)))
}

pub fn blob_sub_url(
    base: &Url,
    ns: &NamespaceId,
    blob: &BlobId,
    suffix: &str,
) -> Result<Url, BlobError> {
    base.join(&format!("api/v1/blobs/{}/{}/{}", ns, blob, suffix))
        .map_err(|e| BlobError::invalid_input(format!("invalid base url {}: {}", base, e)))
}

/// Map a non-success status from another instance onto the error taxonomy.
pub fn error_from_status(
    status: StatusCode,
    body: String,
    ns: &NamespaceId,
    blob: Option<&BlobId>,
) -> BlobError {
    match status {
        StatusCode::NOT_FOUND => match blob {
            Some(blob) => BlobError::blob_not_found(ns, blob),
            None => BlobError::namespace_not_found(ns),
        },
        StatusCode::TOO_MANY_REQUESTS => BlobError::TooManyRequests {
            source: anyhow::anyhow!("upstream returned {}: {}", status, body),
        },
        StatusCode::BAD_REQUEST => BlobError::invalid_input(body),
        _ => BlobError::network(anyhow::anyhow!("upstream returned {}: {}", status, body)),
    }
}
