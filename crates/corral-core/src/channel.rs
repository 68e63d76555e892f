//! Filesystem checks that make a Unix socket usable as a trust boundary.
//!
//! The daemon's authorization model is "whoever can open the socket": there
//! is no in-band authentication, so the socket's permission bits *are* the
//! access policy. [`assert_safe_socket_path`] verifies, without following
//! symlinks, that the endpoint is a real socket with mode exactly `0600`
//! and that its parent directory is not writable by group or other (a
//! writable parent lets an attacker swap the socket for their own).
//!
//! Clients run the same check before every connect, so a daemon started
//! with sloppy permissions is refused rather than trusted.

use std::fs;
use std::io;
use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::path::Path;

use thiserror::Error;
use tracing::warn;

/// The only acceptable mode for the socket endpoint.
pub const SOCKET_MODE: u32 = 0o600;

/// Group/other write bits; any of these on the parent directory is fatal.
const PARENT_FORBIDDEN_BITS: u32 = 0o022;

/// Reasons a socket path fails the trust-boundary check.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ChannelError {
    /// The path is not absolute; relative paths are ambiguous under
    /// concurrent chdir.
    #[error("socket path must be absolute: {path}")]
    NotAbsolute {
        /// The offending path.
        path: String,
    },

    /// The parent directory does not exist.
    #[error("socket parent directory missing: {path}")]
    MissingParent {
        /// The offending path.
        path: String,
    },

    /// The parent path exists but is not a directory (or is a symlink).
    #[error("socket parent is not a directory: {path}")]
    ParentNotDirectory {
        /// The offending path.
        path: String,
    },

    /// The parent directory is writable by group or other.
    #[error("socket parent directory {path} is writable by group/other (mode {mode:o})")]
    ParentWritable {
        /// The offending path.
        path: String,
        /// Its full permission bits.
        mode: u32,
    },

    /// The endpoint exists but is not a socket (or is a symlink).
    #[error("path exists but is not a socket: {path}")]
    NotASocket {
        /// The offending path.
        path: String,
    },

    /// The endpoint's mode is anything other than [`SOCKET_MODE`].
    #[error("socket {path} has mode {mode:o}, require exactly {SOCKET_MODE:o}")]
    ModeTooBroad {
        /// The offending path.
        path: String,
        /// Its full permission bits.
        mode: u32,
    },

    /// Metadata could not be read.
    #[error("failed to inspect {path}: {source}")]
    Io {
        /// The path being inspected.
        path: String,
        /// The underlying error.
        #[source]
        source: io::Error,
    },
}

fn inspect(path: &Path) -> Result<fs::Metadata, ChannelError> {
    // symlink_metadata: a symlink standing in for the socket or its parent
    // is exactly the substitution attack this check exists to catch.
    fs::symlink_metadata(path).map_err(|source| ChannelError::Io {
        path: path.display().to_string(),
        source,
    })
}

/// Verifies that `path` is safe to trust as a private socket endpoint.
///
/// Checks, in order: the path is absolute; the parent exists and is a real
/// directory with no group/other write bits; the endpoint exists, is a real
/// socket, and has mode exactly `0600`.
///
/// # Errors
///
/// Returns the first failed check as a [`ChannelError`].
pub fn assert_safe_socket_path(path: &Path) -> Result<(), ChannelError> {
    if !path.is_absolute() {
        return Err(ChannelError::NotAbsolute {
            path: path.display().to_string(),
        });
    }

    let parent = path.parent().ok_or_else(|| ChannelError::MissingParent {
        path: path.display().to_string(),
    })?;
    let parent_meta = match fs::symlink_metadata(parent) {
        Ok(meta) => meta,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Err(ChannelError::MissingParent {
                path: parent.display().to_string(),
            });
        }
        Err(source) => {
            return Err(ChannelError::Io {
                path: parent.display().to_string(),
                source,
            });
        }
    };
    if !parent_meta.file_type().is_dir() {
        return Err(ChannelError::ParentNotDirectory {
            path: parent.display().to_string(),
        });
    }
    let parent_mode = parent_meta.permissions().mode() & 0o777;
    if parent_mode & PARENT_FORBIDDEN_BITS != 0 {
        return Err(ChannelError::ParentWritable {
            path: parent.display().to_string(),
            mode: parent_mode,
        });
    }

    let meta = inspect(path)?;
    if !meta.file_type().is_socket() {
        return Err(ChannelError::NotASocket {
            path: path.display().to_string(),
        });
    }
    let mode = meta.permissions().mode() & 0o777;
    if mode != SOCKET_MODE {
        return Err(ChannelError::ModeTooBroad {
            path: path.display().to_string(),
            mode,
        });
    }
    Ok(())
}

/// Best-effort tightening of an existing socket to [`SOCKET_MODE`].
///
/// Failure is logged, not returned: the authoritative decision is the
/// subsequent [`assert_safe_socket_path`], which will refuse a socket this
/// function could not fix.
pub fn tighten_socket_mode(path: &Path) {
    if let Err(err) = fs::set_permissions(path, fs::Permissions::from_mode(SOCKET_MODE)) {
        warn!(path = %path.display(), error = %err, "failed to tighten socket mode");
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::net::UnixListener;

    use tempfile::TempDir;

    use super::*;

    fn private_dir() -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::set_permissions(dir.path(), fs::Permissions::from_mode(0o700)).unwrap();
        dir
    }

    fn bind_socket(dir: &TempDir, mode: u32) -> (std::path::PathBuf, UnixListener) {
        let path = dir.path().join("corral.sock");
        let listener = UnixListener::bind(&path).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(mode)).unwrap();
        (path, listener)
    }

    #[test]
    fn accepts_private_socket() {
        let dir = private_dir();
        let (path, _listener) = bind_socket(&dir, 0o600);
        assert_safe_socket_path(&path).unwrap();
    }

    #[test]
    fn rejects_relative_path() {
        let err = assert_safe_socket_path(Path::new("corral.sock")).unwrap_err();
        assert!(matches!(err, ChannelError::NotAbsolute { .. }));
    }

    #[test]
    fn rejects_missing_parent() {
        let dir = private_dir();
        let path = dir.path().join("nope").join("corral.sock");
        let err = assert_safe_socket_path(&path).unwrap_err();
        assert!(matches!(err, ChannelError::MissingParent { .. }));
    }

    #[test]
    fn rejects_group_writable_parent() {
        let dir = private_dir();
        let (path, _listener) = bind_socket(&dir, 0o600);
        fs::set_permissions(dir.path(), fs::Permissions::from_mode(0o770)).unwrap();
        let err = assert_safe_socket_path(&path).unwrap_err();
        assert!(matches!(
            err,
            ChannelError::ParentWritable { mode: 0o770, .. }
        ));
    }

    #[test]
    fn rejects_world_writable_parent() {
        let dir = private_dir();
        let (path, _listener) = bind_socket(&dir, 0o600);
        fs::set_permissions(dir.path(), fs::Permissions::from_mode(0o703)).unwrap();
        let err = assert_safe_socket_path(&path).unwrap_err();
        assert!(matches!(err, ChannelError::ParentWritable { .. }));
    }

    #[test]
    fn rejects_regular_file_endpoint() {
        let dir = private_dir();
        let path = dir.path().join("corral.sock");
        fs::write(&path, b"not a socket").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600)).unwrap();
        let err = assert_safe_socket_path(&path).unwrap_err();
        assert!(matches!(err, ChannelError::NotASocket { .. }));
    }

    #[test]
    fn rejects_symlink_endpoint() {
        let dir = private_dir();
        let (real, _listener) = bind_socket(&dir, 0o600);
        let link = dir.path().join("link.sock");
        std::os::unix::fs::symlink(&real, &link).unwrap();
        let err = assert_safe_socket_path(&link).unwrap_err();
        assert!(matches!(err, ChannelError::NotASocket { .. }));
    }

    #[test]
    fn rejects_broad_socket_modes() {
        for mode in [0o660, 0o666, 0o644, 0o700] {
            let dir = private_dir();
            let (path, _listener) = bind_socket(&dir, mode);
            let err = assert_safe_socket_path(&path).unwrap_err();
            assert!(
                matches!(err, ChannelError::ModeTooBroad { mode: m, .. } if m == mode),
                "mode {mode:o} should be rejected"
            );
        }
    }

    #[test]
    fn rejects_missing_endpoint() {
        let dir = private_dir();
        let err = assert_safe_socket_path(&dir.path().join("corral.sock")).unwrap_err();
        assert!(matches!(err, ChannelError::Io { .. }));
    }

    #[test]
    fn tighten_fixes_broad_mode() {
        let dir = private_dir();
        let (path, _listener) = bind_socket(&dir, 0o666);
        tighten_socket_mode(&path);
        assert_safe_socket_path(&path).unwrap();
    }
}
