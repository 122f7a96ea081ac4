//! In-process blob API servers for relay and peer tests.

use std::{net::SocketAddr, sync::Arc};

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get},
    Json,
    Router,
};
use data_model::{BlobId, LastAccessTracking, NamespaceId};
use tokio::net::TcpListener;
use url::Url;

use crate::{BlobStore, MemoryStore};

#[derive(Clone)]
pub(crate) struct MockServer {
    pub store: Arc<MemoryStore>,
}

impl MockServer {
    pub fn new() -> Self {
        Self {
            store: Arc::new(MemoryStore::new()),
        }
    }

    /// Serve the blob API on an ephemeral port and return its base URL.
    pub async fn spawn(&self) -> Url {
        let app = Router::new()
            .route(
                "/api/v1/blobs/{ns}/{id}",
                get(get_blob).head(head_blob).put(put_blob).delete(delete_blob),
            )
            .route("/api/v1/blobs/{ns}/{id}/metadata", get(get_metadata))
            .route("/api/v1/blobs/{ns}", delete(delete_namespace))
            .with_state(self.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        base_url(addr)
    }
}

/// A listener that accepts connections but never answers.
pub(crate) async fn spawn_unresponsive() -> (TcpListener, Url) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = base_url(listener.local_addr().unwrap());
    (listener, url)
}

fn base_url(addr: SocketAddr) -> Url {
    format!("http://{}/", addr).parse().unwrap()
}

fn parse(ns: &str, id: &str) -> Option<(NamespaceId, BlobId)> {
    Some((ns.parse().ok()?, id.parse().ok()?))
}

async fn get_blob(
    State(server): State<MockServer>,
    Path((ns, id)): Path<(String, String)>,
) -> Response {
    let Some((ns, id)) = parse(&ns, &id) else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    match server.store.get(&ns, &id, LastAccessTracking::Track, false).await {
        Ok(contents) => contents.into_bytes().await.unwrap().into_response(),
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn head_blob(
    State(server): State<MockServer>,
    Path((ns, id)): Path<(String, String)>,
) -> StatusCode {
    let Some((ns, id)) = parse(&ns, &id) else {
        return StatusCode::BAD_REQUEST;
    };
    if server.store.exists(&ns, &id, false).await.unwrap() {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn put_blob(
    State(server): State<MockServer>,
    Path((ns, id)): Path<(String, String)>,
    body: Bytes,
) -> StatusCode {
    let Some((ns, id)) = parse(&ns, &id) else {
        return StatusCode::BAD_REQUEST;
    };
    server.store.put(&ns, &id, body).await.unwrap();
    StatusCode::OK
}

async fn delete_blob(
    State(server): State<MockServer>,
    Path((ns, id)): Path<(String, String)>,
) -> StatusCode {
    let Some((ns, id)) = parse(&ns, &id) else {
        return StatusCode::BAD_REQUEST;
    };
    if server.store.delete(&ns, &id).await.unwrap() {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn get_metadata(
    State(server): State<MockServer>,
    Path((ns, id)): Path<(String, String)>,
) -> Response {
    let Some((ns, id)) = parse(&ns, &id) else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    match server.store.metadata(&ns, &id).await {
        Ok(metadata) => Json(metadata).into_response(),
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn delete_namespace(State(server): State<MockServer>, Path(ns): Path<String>) -> StatusCode {
    let Ok(ns) = ns.parse::<NamespaceId>() else {
        return StatusCode::BAD_REQUEST;
    };
    server.store.delete_namespace(&ns).await.unwrap();
    StatusCode::NO_CONTENT
}
