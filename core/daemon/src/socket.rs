//! Unix socket binding shared by the status and query endpoints.

use std::io::ErrorKind;
use std::os::unix::fs::FileTypeExt;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};

use tokio::net::UnixListener;
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    #[error("Socket path is empty")]
    EmptySocketPath,

    #[error("Another process is already listening on {0}")]
    AlreadyListening(String),

    #[error("Path exists and is not a socket: {0}")]
    NotASocket(String),

    #[error("Socket I/O failed for {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// A bound listener that owns its socket file and unlinks it on drop.
pub struct BoundSocket {
    path: PathBuf,
    listener: UnixListener,
}

impl BoundSocket {
    /// Must be called from inside a tokio runtime.
    pub fn bind(path: PathBuf) -> Result<Self, EndpointError> {
        if path.as_os_str().is_empty() {
            return Err(EndpointError::EmptySocketPath);
        }

        if let Some(parent) = path.parent() {
            fs_err::create_dir_all(parent).map_err(|source| io_error(parent, source))?;
        }
        cleanup_stale_socket(&path)?;

        let listener = UnixListener::bind(&path).map_err(|source| io_error(&path, source))?;
        Ok(Self { path, listener })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn listener(&self) -> &UnixListener {
        &self.listener
    }
}

impl Drop for BoundSocket {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Removed socket file"),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => {
                debug!(error = %err, path = %self.path.display(), "Failed to remove socket file");
            }
        }
    }
}

/// Removes a leftover socket file when nothing answers on it. A live
/// listener or a non-socket file at the path is an error.
fn cleanup_stale_socket(path: &Path) -> Result<(), EndpointError> {
    let metadata = match std::fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
        Err(source) => return Err(io_error(path, source)),
    };

    if !metadata.file_type().is_socket() {
        return Err(EndpointError::NotASocket(path.display().to_string()));
    }

    match StdUnixStream::connect(path) {
        Ok(_stream) => Err(EndpointError::AlreadyListening(path.display().to_string())),
        Err(err) if matches!(err.kind(), ErrorKind::ConnectionRefused | ErrorKind::NotFound) => {
            fs_err::remove_file(path).map_err(|source| io_error(path, source))?;
            info!(path = %path.display(), "Removed stale socket before bind");
            Ok(())
        }
        Err(source) => Err(io_error(path, source)),
    }
}

fn io_error(path: &Path, source: std::io::Error) -> EndpointError {
    EndpointError::Io {
        path: path.display().to_string(),
        source,
    }
}
