//! `SQLite`-backed storage engine with forward-only schema migrations.
//!
//! The store owns a single connection behind a mutex; all queue mutations
//! are expressed as transactions against it, so correctness rests on
//! `SQLite`'s isolation rather than in-process locking. WAL mode keeps
//! readers cheap while a writer is active.
//!
//! The schema version lives in `PRAGMA user_version` and only moves
//! forward. [`migrate`] is idempotent and resumable: re-running it on an
//! up-to-date store is a no-op, and a store stuck at an intermediate
//! version continues from there. A version outside the known range is a
//! fatal configuration error; the engine refuses to operate against an
//! unknown shape.

// Mutex poisoning indicates a panic in another thread, which is
// unrecoverable for an embedded store.
#![allow(clippy::missing_panics_doc)]

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::{Connection, OpenFlags};
use thiserror::Error;
use tracing::{debug, info};

/// Schema version this build of the engine understands.
pub const SCHEMA_VERSION: i64 = 3;

const MIGRATE_V1: &str = include_str!("migrations/0001_jobs.sql");
const MIGRATE_V2: &str = include_str!("migrations/0002_bootstrap_tokens.sql");
const MIGRATE_V3: &str = include_str!("migrations/0003_lease_index.sql");

/// Errors raised by the storage engine.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StorageError {
    /// Database error from `SQLite`.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// I/O error during database operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The store reports a schema version this build does not understand.
    #[error(
        "unknown schema version {found} (this build supports up to {SCHEMA_VERSION}); \
         refusing to operate against an unknown shape"
    )]
    UnknownSchemaVersion {
        /// The version recorded in the store.
        found: i64,
    },
}

/// Handle to the embedded database shared by all in-process callers.
///
/// Cloning is cheap; clones share the same connection. Cross-process
/// sharing is out of scope: one queue-owning process holds the store, and
/// RPC is the multiplexing mechanism for everyone else.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl Store {
    /// Opens (or creates) the database at `path` and migrates it.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened, or if its schema
    /// version is not one this build recognizes.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Self::initialize(&conn)?;
        migrate(&conn)?;

        info!(path = %path.display(), "opened queue store");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path.to_path_buf()),
        })
    }

    /// Creates an in-memory store, migrated and ready for use.
    ///
    /// Intended for tests; every call returns an isolated database.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be initialized.
    pub fn in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        Self::initialize(&conn)?;
        migrate(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
        })
    }

    fn initialize(conn: &Connection) -> Result<(), StorageError> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;",
        )?;
        Ok(())
    }

    /// Locks the underlying connection for a sequence of statements.
    ///
    /// Callers hold the guard for the duration of one logical operation;
    /// multi-step mutations must open an explicit transaction on it.
    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap()
    }

    /// Path of the backing file, if any.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Current schema version of the store.
    ///
    /// # Errors
    ///
    /// Returns an error if the version pragma cannot be read.
    pub fn schema_version(&self) -> Result<i64, StorageError> {
        Ok(schema_version(&self.conn())?)
    }
}

fn schema_version(conn: &Connection) -> rusqlite::Result<i64> {
    conn.query_row("PRAGMA user_version", [], |row| row.get(0))
}

/// Advances the schema to [`SCHEMA_VERSION`], one step per version.
///
/// Each step runs in its own transaction and bumps `user_version` as its
/// final statement, so an interrupted migration resumes cleanly.
///
/// # Errors
///
/// Returns [`StorageError::UnknownSchemaVersion`] for a store whose version
/// is outside `0..=SCHEMA_VERSION`, and a database error if a step fails.
pub fn migrate(conn: &Connection) -> Result<(), StorageError> {
    loop {
        let version = schema_version(conn)?;
        let step = match version {
            0 => MIGRATE_V1,
            1 => MIGRATE_V2,
            2 => MIGRATE_V3,
            SCHEMA_VERSION => return Ok(()),
            found => return Err(StorageError::UnknownSchemaVersion { found }),
        };
        conn.execute_batch(step)?;
        debug!(from = version, to = version + 1, "applied schema migration");
    }
}
