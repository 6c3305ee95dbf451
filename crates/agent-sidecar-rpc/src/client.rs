//! Framed JSON-RPC client for the photo service.

use std::{
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use thiserror::Error;
use tokio_util::codec::Framed;

use crate::{
    frame::{FrameCodec, FrameError},
    jsonrpc::{Outcome, Request, Response},
    socket::{SocketError, UnixSockets},
};

/// Default per-call limit.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Largest page `get_photos` will ask for.
pub const MAX_PAGE: usize = 500;

/// Client-side failure.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Socket(#[from] SocketError),
    #[error("Connection timeout after {0:?}")]
    Timeout(Duration),
    #[error("Server closed connection without response")]
    Closed,
    #[error("Framing error: {0}")]
    Frame(#[from] FrameError),
    #[error("Invalid JSON response from server: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Response id {got} does not match request id {expected}")]
    UnexpectedId { expected: u64, got: Value },
    #[error("RPC error (code {code}): {message}")]
    Rpc {
        code: i64,
        message: String,
        data: Option<Value>,
    },
}

/// JSON-RPC client. Each call uses its own connection.
#[derive(Debug)]
pub struct RpcClient {
    sockets: UnixSockets,
    socket_path: PathBuf,
    timeout: Duration,
    next_id: AtomicU64,
}

impl RpcClient {
    /// Create a client for `socket_path`.
    ///
    /// # Errors
    /// Returns error if the socket file does not exist.
    pub fn new(sockets: UnixSockets, socket_path: impl Into<PathBuf>) -> Result<Self, ClientError> {
        let socket_path = socket_path.into();
        if std::fs::symlink_metadata(&socket_path).is_err() {
            return Err(SocketError::NotFound(socket_path).into());
        }
        Ok(Self {
            sockets,
            socket_path,
            timeout: DEFAULT_CALL_TIMEOUT,
            next_id: AtomicU64::new(1),
        })
    }

    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Call `method` and return its result.
    ///
    /// # Errors
    /// Returns error on connection, framing, or timeout failures, and
    /// [`ClientError::Rpc`] when the server answers with an error object.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, ClientError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = Request::new(method, Some(params), json!(id));
        let payload = Bytes::from(serde_json::to_vec(&request)?);
        tracing::debug!(%method, id, "rpc request");

        let response = tokio::time::timeout(self.timeout, self.exchange(payload))
            .await
            .map_err(|_| ClientError::Timeout(self.timeout))??;

        if response.id != json!(id) {
            return Err(ClientError::UnexpectedId {
                expected: id,
                got: response.id,
            });
        }
        match response.outcome {
            Outcome::Result(result) => Ok(result),
            Outcome::Error(err) => Err(ClientError::Rpc {
                code: err.code,
                message: err.message,
                data: err.data,
            }),
        }
    }

    async fn exchange(&self, payload: Bytes) -> Result<Response, ClientError> {
        let stream = self.sockets.connect(&self.socket_path).await?;
        // Responses are not bounded by the request limit.
        let mut framed = Framed::new(stream, FrameCodec::with_max_len(usize::MAX));
        framed.send(payload).await?;
        let frame = framed.next().await.ok_or(ClientError::Closed)??;
        Ok(serde_json::from_slice(&frame)?)
    }

    /// Health check.
    ///
    /// # Errors
    /// See [`RpcClient::call`].
    pub async fn ping(&self) -> Result<Value, ClientError> {
        self.call("ping", json!({})).await
    }

    /// All albums.
    ///
    /// # Errors
    /// See [`RpcClient::call`].
    pub async fn list_albums(&self) -> Result<Vec<Value>, ClientError> {
        let result = self.call("list_albums", json!({})).await?;
        Ok(match result.get("albums") {
            Some(Value::Array(albums)) => albums.clone(),
            _ => Vec::new(),
        })
    }

    /// One page of an album. `limit` is clamped to `1..=500`.
    ///
    /// # Errors
    /// See [`RpcClient::call`].
    pub async fn get_photos(
        &self,
        album_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Value, ClientError> {
        let limit = limit.clamp(1, MAX_PAGE);
        self.call(
            "get_photos",
            json!({"album_id": album_id, "limit": limit, "offset": offset}),
        )
        .await
    }

    /// Ask the server to export a photo into a whitelisted directory.
    ///
    /// # Errors
    /// See [`RpcClient::call`].
    pub async fn export_photo(&self, photo_id: &str, export_path: &str) -> Result<Value, ClientError> {
        self.call(
            "export_photo",
            json!({"photo_id": photo_id, "export_path": export_path}),
        )
        .await
    }
}
