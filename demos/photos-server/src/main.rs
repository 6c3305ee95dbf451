//! Sandboxed photo service over a private Unix socket.
//!
//! Run with: PHOTOS_LIBRARY_DIR=~/Pictures cargo run -p photos-server
//!
//! The socket path comes from `OSXPHOTOS_SOCKET_PATH`, falling back to
//! `/tmp/trae-osxphotos-<uid>/server.sock`.

use std::path::PathBuf;

use agent_sidecar_rpc::{
    DirectoryLibrary, Dispatcher, ExportWhitelist, PhotosService, RpcServer, ServerConfig,
    UnixSockets,
};
use anyhow::Context;
use tokio::signal::unix::{SignalKind, signal};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const ENV_LIBRARY_DIR: &str = "PHOTOS_LIBRARY_DIR";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let home = dirs::home_dir().context("cannot determine home directory")?;
    let library_dir = std::env::var_os(ENV_LIBRARY_DIR)
        .map_or_else(|| home.join("Pictures"), PathBuf::from);
    tracing::info!(library = %library_dir.display(), "serving photo library");

    let mut dispatcher = Dispatcher::new();
    PhotosService::new(
        DirectoryLibrary::new(library_dir),
        ExportWhitelist::for_home(&home),
    )
    .register(&mut dispatcher);

    let server = RpcServer::bind(&UnixSockets::new(), dispatcher, ServerConfig::from_env())
        .context("failed to start photo server")?;

    let mut terminate = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    let mut interrupt = signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;
    server
        .serve_with_shutdown(async move {
            tokio::select! {
                _ = terminate.recv() => tracing::info!("received SIGTERM"),
                _ = interrupt.recv() => tracing::info!("received SIGINT"),
            }
        })
        .await;

    Ok(())
}
