//! Unix socket lifecycle: private parent directory, stale-socket cleanup,
//! bind, and mode tightening.
//!
//! The bind sequence ends with the same [`assert_safe_socket_path`] check
//! clients run, so a daemon can never end up listening on an endpoint its
//! own clients would refuse.

use std::fs;
use std::io;
use std::os::unix::fs::{DirBuilderExt, FileTypeExt};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::net::UnixListener;
use tracing::{debug, info};

use corral_core::channel::{assert_safe_socket_path, tighten_socket_mode, ChannelError};

/// Errors raised while preparing the listening socket.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SocketError {
    /// The endpoint fails the trust-boundary check even after binding.
    #[error(transparent)]
    Unsafe(#[from] ChannelError),

    /// Something that is not a socket already occupies the path.
    #[error("refusing to remove non-socket file at {path}")]
    Occupied {
        /// The occupied path.
        path: PathBuf,
    },

    /// Filesystem or bind failure.
    #[error("socket I/O error at {path}: {source}")]
    Io {
        /// The path being prepared.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: io::Error,
    },
}

/// Removes the socket file when the daemon exits.
#[derive(Debug)]
pub struct SocketGuard {
    path: PathBuf,
}

impl SocketGuard {
    /// The endpoint this guard owns.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SocketGuard {
    fn drop(&mut self) {
        // Best effort; a dead path is indistinguishable from success.
        let _ = fs::remove_file(&self.path);
    }
}

/// Binds the daemon socket at `path` with a private parent and mode `0600`.
///
/// Creates the parent directory with mode `0700` when missing. A stale
/// socket file from a previous run is removed; any other file type at the
/// path is an error, never deleted.
///
/// # Errors
///
/// Returns [`SocketError`] if the path cannot be prepared, bound, or does
/// not pass the trust-boundary check afterwards.
pub fn bind(path: &Path) -> Result<(UnixListener, SocketGuard), SocketError> {
    if !path.is_absolute() {
        return Err(ChannelError::NotAbsolute {
            path: path.display().to_string(),
        }
        .into());
    }
    let parent = path.parent().ok_or_else(|| ChannelError::MissingParent {
        path: path.display().to_string(),
    })?;

    match fs::symlink_metadata(parent) {
        Ok(meta) if meta.file_type().is_dir() => {}
        Ok(_) => {
            return Err(ChannelError::ParentNotDirectory {
                path: parent.display().to_string(),
            }
            .into());
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            fs::DirBuilder::new()
                .recursive(true)
                .mode(0o700)
                .create(parent)
                .map_err(|source| SocketError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
            debug!(path = %parent.display(), "created socket directory");
        }
        Err(source) => {
            return Err(SocketError::Io {
                path: parent.to_path_buf(),
                source,
            });
        }
    }

    match fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_socket() => {
            fs::remove_file(path).map_err(|source| SocketError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            debug!(path = %path.display(), "removed stale socket");
        }
        Ok(_) => {
            return Err(SocketError::Occupied {
                path: path.to_path_buf(),
            });
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(source) => {
            return Err(SocketError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    }

    let listener = UnixListener::bind(path).map_err(|source| SocketError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let guard = SocketGuard {
        path: path.to_path_buf(),
    };

    tighten_socket_mode(path);
    assert_safe_socket_path(path)?;

    info!(path = %path.display(), "listening on unix socket");
    Ok((listener, guard))
}

/// The default socket path: `$XDG_RUNTIME_DIR/corral/corral.sock`, falling
/// back to `/tmp/corral/corral.sock`.
#[must_use]
pub fn default_socket_path() -> PathBuf {
    let base = std::env::var_os("XDG_RUNTIME_DIR")
        .map_or_else(|| PathBuf::from("/tmp"), PathBuf::from);
    base.join("corral").join("corral.sock")
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use tempfile::TempDir;

    use super::*;

    #[tokio::test]
    async fn bind_creates_private_endpoint() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run").join("corral.sock");

        let (_listener, guard) = bind(&path).unwrap();
        assert_safe_socket_path(&path).unwrap();

        let parent_mode = fs::symlink_metadata(path.parent().unwrap())
            .unwrap()
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(parent_mode, 0o700);

        drop(guard);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn bind_replaces_stale_socket() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("corral.sock");

        let (listener, guard) = bind(&path).unwrap();
        // Simulate a crash: the file outlives the listener.
        std::mem::forget(guard);
        drop(listener);
        assert!(path.exists());

        let (_listener, _guard) = bind(&path).unwrap();
        assert_safe_socket_path(&path).unwrap();
    }

    #[tokio::test]
    async fn bind_refuses_non_socket_occupant() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("corral.sock");
        fs::write(&path, b"important data").unwrap();

        let err = bind(&path).unwrap_err();
        assert!(matches!(err, SocketError::Occupied { .. }));
        // The occupant was not touched.
        assert_eq!(fs::read(&path).unwrap(), b"important data");
    }

    #[tokio::test]
    async fn bind_refuses_relative_path() {
        let err = bind(Path::new("corral.sock")).unwrap_err();
        assert!(matches!(
            err,
            SocketError::Unsafe(ChannelError::NotAbsolute { .. })
        ));
    }
}
