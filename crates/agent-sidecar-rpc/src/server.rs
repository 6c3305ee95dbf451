//! Framed JSON-RPC server over a hardened Unix socket.

use std::{
    future::Future,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::codec::Framed;

use crate::{
    dispatcher::Dispatcher,
    frame::{FrameCodec, MAX_FRAME_LEN},
    socket::{SocketError, UnixSockets, socket_path_from_env},
};

/// Idle limit for waiting on the next request of a connection.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub socket_path: PathBuf,
    pub idle_timeout: Duration,
    pub max_frame_len: usize,
}

impl ServerConfig {
    #[must_use]
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            idle_timeout: IDLE_TIMEOUT,
            max_frame_len: MAX_FRAME_LEN,
        }
    }

    /// Socket path from `OSXPHOTOS_SOCKET_PATH` or the per-user default.
    #[must_use]
    pub fn from_env() -> Self {
        Self::new(socket_path_from_env())
    }

    #[must_use]
    pub const fn with_idle_timeout(mut self, idle: Duration) -> Self {
        self.idle_timeout = idle;
        self
    }
}

/// A bound server, ready to accept connections.
#[derive(Debug)]
pub struct RpcServer {
    listener: UnixListener,
    dispatcher: Arc<Dispatcher>,
    config: ServerConfig,
}

impl RpcServer {
    /// Bind the socket described by `config`.
    ///
    /// # Errors
    /// Returns error if the socket directory is unsafe or binding fails.
    pub fn bind(
        sockets: &UnixSockets,
        dispatcher: Dispatcher,
        config: ServerConfig,
    ) -> Result<Self, SocketError> {
        let listener = sockets.bind(&config.socket_path)?;
        tracing::info!(socket = %config.socket_path.display(), "server listening");
        Ok(Self {
            listener,
            dispatcher: Arc::new(dispatcher),
            config,
        })
    }

    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.config.socket_path
    }

    /// Accept connections until `shutdown` resolves.
    ///
    /// Connections already open keep running until their client leaves or
    /// goes idle. The socket file is removed on return.
    pub async fn serve_with_shutdown<F>(self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut next_conn: u64 = 0;

        loop {
            tokio::select! {
                () = &mut shutdown => {
                    tracing::info!("server shutting down");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        next_conn += 1;
                        let conn = next_conn;
                        let dispatcher = Arc::clone(&self.dispatcher);
                        let idle = self.config.idle_timeout;
                        let codec = FrameCodec::with_max_len(self.config.max_frame_len);
                        tokio::spawn(async move {
                            tracing::debug!(conn, "client connected");
                            handle_connection(stream, codec, &dispatcher, idle, conn).await;
                            tracing::debug!(conn, "client disconnected");
                        });
                    }
                    Err(e) => tracing::warn!(error = %e, "accept failed"),
                },
            }
        }

        if let Err(e) = std::fs::remove_file(&self.config.socket_path) {
            tracing::debug!(error = %e, "socket file not removed");
        }
    }

    /// Accept connections forever.
    pub async fn serve(self) {
        self.serve_with_shutdown(std::future::pending()).await;
    }
}

async fn handle_connection(
    stream: UnixStream,
    codec: FrameCodec,
    dispatcher: &Dispatcher,
    idle: Duration,
    conn: u64,
) {
    let mut framed = Framed::new(stream, codec);
    loop {
        let frame = match tokio::time::timeout(idle, framed.next()).await {
            Err(_) => {
                tracing::debug!(conn, "idle timeout");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                tracing::warn!(conn, error = %e, "protocol violation, closing connection");
                break;
            }
            Ok(Some(Ok(frame))) => frame,
        };

        let reply = dispatcher.handle(&frame).await;
        if reply.is_empty() {
            continue;
        }
        if let Err(e) = framed.send(Bytes::from(reply)).await {
            tracing::warn!(conn, error = %e, "failed to write response");
            break;
        }
    }
}
