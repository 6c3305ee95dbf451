//! Unix domain sockets for the sandboxed service.
//!
//! [`UnixSockets`] is the only way this crate creates sockets, and it can
//! only produce Unix domain listeners and streams.

use std::{
    fs,
    io,
    os::unix::fs::{DirBuilderExt, MetadataExt, PermissionsExt},
    path::{Path, PathBuf},
};

use nix::unistd::Uid;
use thiserror::Error;
use tokio::net::{UnixListener, UnixStream};

/// Environment variable overriding the socket path.
pub const ENV_SOCKET_PATH: &str = "OSXPHOTOS_SOCKET_PATH";

const DIR_MODE: u32 = 0o700;
const SOCKET_MODE: u32 = 0o600;

/// Socket setup error.
#[derive(Debug, Error)]
pub enum SocketError {
    #[error("Socket path {} has no parent directory", .0.display())]
    NoParent(PathBuf),
    #[error("Socket directory {} is a symlink; remove it and retry", .0.display())]
    SymlinkDir(PathBuf),
    #[error("Socket directory {} is not a directory", .0.display())]
    NotDirectory(PathBuf),
    #[error("Socket directory {} is owned by uid {owner}, expected {expected}", .path.display())]
    WrongOwner { path: PathBuf, owner: u32, expected: u32 },
    #[error("Socket {} does not exist; is the server running?", .0.display())]
    NotFound(PathBuf),
    #[error("{context} {}: {source}", .path.display())]
    Io {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl SocketError {
    fn io(context: &'static str, path: &Path, source: io::Error) -> Self {
        Self::Io {
            context,
            path: path.to_path_buf(),
            source,
        }
    }
}

/// `/tmp/trae-osxphotos-<uid>/server.sock`.
#[must_use]
pub fn default_socket_path() -> PathBuf {
    PathBuf::from(format!("/tmp/trae-osxphotos-{}/server.sock", Uid::current()))
}

/// Socket path from the environment, falling back to the default.
#[must_use]
pub fn socket_path_from_env() -> PathBuf {
    std::env::var_os(ENV_SOCKET_PATH)
        .filter(|v| !v.is_empty())
        .map_or_else(default_socket_path, PathBuf::from)
}

/// Create or verify the directory that will hold a socket.
///
/// A missing directory is created owner-only. An existing one must not be
/// a symlink and must belong to the current user; loose permissions are
/// tightened in place.
///
/// # Errors
/// Returns error if the directory is unsafe or cannot be prepared.
pub fn prepare_socket_dir(dir: &Path) -> Result<(), SocketError> {
    let meta = match fs::symlink_metadata(dir) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            fs::DirBuilder::new()
                .recursive(true)
                .mode(DIR_MODE)
                .create(dir)
                .map_err(|e| SocketError::io("failed to create socket directory", dir, e))?;
            tracing::info!(dir = %dir.display(), "created private socket directory");
            return Ok(());
        }
        Err(e) => return Err(SocketError::io("failed to inspect socket directory", dir, e)),
    };

    if meta.file_type().is_symlink() {
        return Err(SocketError::SymlinkDir(dir.to_path_buf()));
    }
    if !meta.is_dir() {
        return Err(SocketError::NotDirectory(dir.to_path_buf()));
    }

    let expected = Uid::current().as_raw();
    if meta.uid() != expected {
        return Err(SocketError::WrongOwner {
            path: dir.to_path_buf(),
            owner: meta.uid(),
            expected,
        });
    }

    if meta.mode() & 0o777 != DIR_MODE {
        tracing::warn!(
            dir = %dir.display(),
            mode = %format!("{:o}", meta.mode() & 0o777),
            "tightening socket directory permissions"
        );
        fs::set_permissions(dir, fs::Permissions::from_mode(DIR_MODE))
            .map_err(|e| SocketError::io("failed to chmod socket directory", dir, e))?;
    }
    Ok(())
}

/// Capability for creating Unix domain sockets.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnixSockets {
    _private: (),
}

impl UnixSockets {
    #[must_use]
    pub const fn new() -> Self {
        Self { _private: () }
    }

    /// Bind a hardened listener at `path`.
    ///
    /// Prepares the parent directory, removes a stale socket, binds, and
    /// restricts the socket file to its owner.
    ///
    /// # Errors
    /// Returns error if the directory is unsafe or binding fails.
    pub fn bind(&self, path: &Path) -> Result<UnixListener, SocketError> {
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .ok_or_else(|| SocketError::NoParent(path.to_path_buf()))?;
        prepare_socket_dir(dir)?;

        // Also catches dangling symlinks, which `exists()` would miss.
        if fs::symlink_metadata(path).is_ok() {
            match fs::remove_file(path) {
                Ok(()) => tracing::info!(socket = %path.display(), "removed stale socket"),
                Err(e) => tracing::error!(socket = %path.display(), error = %e, "failed to remove stale socket"),
            }
        }

        let listener =
            UnixListener::bind(path).map_err(|e| SocketError::io("failed to bind", path, e))?;
        fs::set_permissions(path, fs::Permissions::from_mode(SOCKET_MODE))
            .map_err(|e| SocketError::io("failed to chmod socket", path, e))?;
        Ok(listener)
    }

    /// Connect to a listening socket.
    ///
    /// # Errors
    /// Returns error if the socket file is missing or the connection fails.
    pub async fn connect(&self, path: &Path) -> Result<UnixStream, SocketError> {
        if fs::symlink_metadata(path).is_err() {
            return Err(SocketError::NotFound(path.to_path_buf()));
        }
        UnixStream::connect(path)
            .await
            .map_err(|e| SocketError::io("failed to connect to", path, e))
    }
}
