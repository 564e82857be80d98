//! Durable store for traces, events, the result cache, session state and
//! rate counters.
//!
//! Backed by a single SQLite file in WAL mode. Writes are serialized through
//! one connection behind a mutex; every operation is a short transaction, so
//! holding the lock across a call is cheap. The runtime owns exactly one
//! `Store`, shared behind `Arc`.

mod cache;
mod rate;
mod session;
mod trace;

pub use session::MessageRecord;
pub use trace::{EventRecord, TraceDetail, TraceSummary};

use std::path::Path;

use parking_lot::Mutex;
use rusqlite::Connection;

use crate::error::StoreError;

const DDL: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS traces(
       id TEXT PRIMARY KEY,
       thread_id TEXT,
       created_at INTEGER DEFAULT (strftime('%s','now'))
     );",
    "CREATE TABLE IF NOT EXISTS trace_events(
       id TEXT PRIMARY KEY,
       trace_id TEXT,
       phase TEXT,
       role TEXT,
       payload TEXT,
       created_at INTEGER DEFAULT (strftime('%s','now')),
       FOREIGN KEY(trace_id) REFERENCES traces(id)
     );",
    "CREATE INDEX IF NOT EXISTS idx_trace_events_trace ON trace_events(trace_id);",
    "CREATE TABLE IF NOT EXISTS tool_cache(
       cache_key TEXT PRIMARY KEY,
       tool TEXT NOT NULL,
       args_hash TEXT NOT NULL,
       value TEXT,
       version INTEGER DEFAULT 1,
       ttl_s INTEGER DEFAULT 0,
       created_at INTEGER DEFAULT (strftime('%s','now'))
     );",
    "CREATE TABLE IF NOT EXISTS session_kv(
       id TEXT PRIMARY KEY,
       thread_id TEXT,
       key TEXT,
       value TEXT,
       created_at INTEGER DEFAULT (strftime('%s','now'))
     );",
    "CREATE TABLE IF NOT EXISTS session_messages(
       id TEXT PRIMARY KEY,
       thread_id TEXT,
       sender TEXT,
       recipient TEXT,
       content TEXT,
       created_at INTEGER DEFAULT (strftime('%s','now'))
     );",
    "CREATE TABLE IF NOT EXISTS rate_counters(
       key TEXT PRIMARY KEY,
       count INTEGER DEFAULT 0,
       window_start INTEGER DEFAULT 0
     );",
];

/// Process-wide durable store.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the database at `path` and apply the schema.
    pub fn open(path: &str) -> Result<Self, StoreError> {
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// Open a private in-memory database. Used by tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        for ddl in DDL {
            conn.execute_batch(ddl)?;
        }
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run `f` with the (exclusive) connection.
    pub(crate) fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, rusqlite::Error>,
    ) -> Result<T, StoreError> {
        let conn = self.conn.lock();
        Ok(f(&conn)?)
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish()
    }
}

/// Current unix time in whole seconds.
pub(crate) fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}
