//! corral-daemon — the queue-owning process.
//!
//! Owns the `SQLite` store exclusively and exposes the queue over a
//! private Unix socket speaking HTTP/1.1 with JSON bodies. Everything
//! else in the fleet goes through this socket; nothing else touches the
//! database file.

pub mod housekeeping;
pub mod server;
pub mod socket;
