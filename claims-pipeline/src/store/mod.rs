//! Durable stores, all backed by one sqlite database.
//!
//! Every operation takes its own short-lived lock/transaction acquired
//! and released around that operation — never held across a network call
//! or a sleep. Handles are cheap clones sharing the connection.

use crate::error::{PipelineError, Result};
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

mod checkpoint;
mod claims_log;
mod documents;
mod identity;
mod records;

pub use checkpoint::Checkpoint;
pub use claims_log::ClaimsLog;
pub use documents::DocumentStore;
pub use identity::IdentityStore;
pub use records::RecordsStore;

const SCHEMA: &str = "BEGIN;
CREATE TABLE IF NOT EXISTS claims(
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    identity_id TEXT NOT NULL,
    document_id TEXT NOT NULL DEFAULT '',
    status TEXT NOT NULL,
    provenance TEXT NOT NULL DEFAULT '',
    created TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_claims_identity ON claims(identity_id);
CREATE TABLE IF NOT EXISTS storage(
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS authors(
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    identity_id TEXT UNIQUE NOT NULL,
    display_name TEXT NOT NULL DEFAULT '',
    name_variants TEXT NOT NULL DEFAULT '{}',
    account_status TEXT NOT NULL DEFAULT 'unknown',
    linked_account_id INTEGER,
    created TEXT NOT NULL,
    updated TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS documents(
    document_id TEXT PRIMARY KEY,
    authors TEXT NOT NULL,
    author_norm TEXT
);
CREATE TABLE IF NOT EXISTS records(
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    document_id TEXT UNIQUE NOT NULL,
    claims TEXT NOT NULL,
    created TEXT NOT NULL,
    updated TEXT NOT NULL,
    processed TEXT
);
COMMIT;";

/// Shared sqlite handle. `Connection` is `Send` but not `Sync`; the
/// `Mutex` wrapper makes the handle both, so stores can live behind
/// `Arc`s across stage threads.
#[derive(Clone)]
pub struct Db {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Db(<sqlite>)")
    }
}

impl Db {
    pub fn open(path: &Path) -> Result<Db> {
        Self::from_connection(Connection::open(path)?)
    }

    /// Private in-memory database, used by tests.
    pub fn open_in_memory() -> Result<Db> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Db> {
        conn.execute_batch(SCHEMA)?;
        Ok(Db {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| PipelineError::Store("connection lock poisoned".to_string()))
    }
}

pub(crate) fn parse_timestamp(raw: &str, path: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| PipelineError::malformed(path, format!("bad timestamp {:?}: {}", raw, e)))
}

pub(crate) fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}
