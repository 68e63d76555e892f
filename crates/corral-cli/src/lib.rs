//! corral — operator CLI for the corral daemon.
//!
//! Thin shell over [`client::QueueClient`]: every subcommand is one RPC
//! against the daemon socket plus rendering.

pub mod client;
pub mod commands;

use std::path::PathBuf;

/// The default socket path, mirroring the daemon's:
/// `$XDG_RUNTIME_DIR/corral/corral.sock`, falling back to
/// `/tmp/corral/corral.sock`.
#[must_use]
pub fn default_socket_path() -> PathBuf {
    let base = std::env::var_os("XDG_RUNTIME_DIR")
        .map_or_else(|| PathBuf::from("/tmp"), PathBuf::from);
    base.join("corral").join("corral.sock")
}
