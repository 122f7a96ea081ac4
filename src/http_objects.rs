use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use blob_store::ListedBlob;
use data_model::{BlobError, BlobId};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

#[derive(Debug, Serialize, Deserialize)]
pub struct BlobApiError {
    #[serde(skip)]
    status_code: StatusCode,
    message: String,
}

impl BlobApiError {
    pub fn new(status_code: StatusCode, message: &str) -> Self {
        Self {
            status_code,
            message: message.to_string(),
        }
    }

    pub fn bad_request(message: &str) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn status_code(&self) -> StatusCode {
        self.status_code
    }
}

impl IntoResponse for BlobApiError {
    fn into_response(self) -> Response {
        if self.status_code.is_server_error() {
            error!("API Error: {} - {}", self.status_code, self.message);
        } else {
            warn!("API Error: {} - {}", self.status_code, self.message);
        }
        (self.status_code, self.message).into_response()
    }
}

impl From<BlobError> for BlobApiError {
    fn from(e: BlobError) -> Self {
        let status_code = match &e {
            BlobError::BlobNotFound { .. } | BlobError::NamespaceNotFound { .. } => {
                StatusCode::NOT_FOUND
            }
            BlobError::HashMismatch { .. } | BlobError::InvalidInput { .. } => {
                StatusCode::BAD_REQUEST
            }
            BlobError::TooManyRequests { .. } => StatusCode::TOO_MANY_REQUESTS,
            BlobError::ReplicationFailed { .. } => StatusCode::SERVICE_UNAVAILABLE,
            BlobError::Unsupported { .. } => StatusCode::NOT_IMPLEMENTED,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status_code, &e.to_string())
    }
}

fn default_list_limit() -> usize {
    1000
}

#[derive(Debug, Default, Deserialize)]
pub struct GetBlobParams {
    #[serde(default)]
    pub allow_redirect: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct ExistsParams {
    #[serde(default)]
    pub force_check: bool,
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    #[serde(default = "default_list_limit")]
    pub limit: usize,
    /// Resume after this identifier, usually a previous `next_cursor`.
    #[serde(default)]
    pub start_after: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListResponse {
    pub blobs: Vec<ListedBlob>,
    /// Set when the listing stopped at `limit`.
    pub truncated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<BlobId>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PutBlobResponse {
    pub identifier: String,
}
