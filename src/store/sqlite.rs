//! SQLite plumbing shared by the audit and tally clients: pool creation,
//! schema initialization, and the RAII transaction guard.

use std::path::{Path, PathBuf};

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use snafu::{ResultExt, Snafu};

/// Errors from the audit & tally store.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StoreError {
    #[snafu(display("failed to open tally database at {}: {source}", path.display()))]
    OpenDatabase {
        path: PathBuf,
        source: r2d2::Error,
    },

    #[snafu(display("failed to prepare tally schema: {source}"))]
    Schema { source: rusqlite::Error },

    #[snafu(display("tally connection pool error: {source}"))]
    PoolCheckout { source: r2d2::Error },

    #[snafu(display("failed to execute statement: {source}"))]
    Execute { source: rusqlite::Error },

    #[snafu(display("failed to query store: {source}"))]
    Query { source: rusqlite::Error },

    /// An accepted audit row already exists for this (fingerprint, scope).
    /// Surfaced distinctly so the worker can re-classify the submission as
    /// a duplicate instead of failing.
    #[snafu(display("accepted audit already recorded for {fingerprint} in scope {scope}"))]
    DuplicateAccepted { fingerprint: String, scope: String },

    #[snafu(display("store task was cancelled: {source}"))]
    TaskJoin { source: tokio::task::JoinError },
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS vote_audit (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    fingerprint TEXT NOT NULL,
    scope TEXT NOT NULL,
    choice_payload TEXT,
    status TEXT NOT NULL,
    attempt_count INTEGER,
    error TEXT,
    received_at TEXT NOT NULL,
    processed_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_vote_audit_fingerprint
    ON vote_audit(fingerprint);
CREATE UNIQUE INDEX IF NOT EXISTS idx_vote_audit_accepted
    ON vote_audit(fingerprint, scope) WHERE status = 'accepted';
CREATE TABLE IF NOT EXISTS law_tally (
    ballot_id TEXT PRIMARY KEY,
    yes_count INTEGER NOT NULL DEFAULT 0,
    no_count INTEGER NOT NULL DEFAULT 0,
    updated_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS election_tally (
    election_id INTEGER NOT NULL,
    region_id INTEGER NOT NULL,
    candidate_id INTEGER NOT NULL,
    vote_count INTEGER NOT NULL DEFAULT 0,
    percentage REAL NOT NULL DEFAULT 0,
    updated_at TEXT NOT NULL,
    UNIQUE (election_id, region_id, candidate_id)
);
CREATE TABLE IF NOT EXISTS elections (
    id INTEGER PRIMARY KEY,
    name TEXT,
    method TEXT NOT NULL,
    start_at TEXT NOT NULL,
    end_at TEXT NOT NULL,
    CHECK (end_at > start_at)
);
";

/// Open the store database and make sure the schema exists.
pub fn open_pool(path: &Path) -> Result<Pool<SqliteConnectionManager>, StoreError> {
    let manager = SqliteConnectionManager::file(path).with_init(|conn| {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 10000;",
        )
    });
    let pool = Pool::builder()
        .max_size(8)
        .build(manager)
        .context(OpenDatabaseSnafu { path })?;
    let conn = pool.get().context(PoolCheckoutSnafu)?;
    conn.execute_batch(SCHEMA).context(SchemaSnafu)?;
    Ok(pool)
}

/// RAII transaction guard: rolls back on drop unless committed.
pub(crate) struct TransactionGuard<'a> {
    conn: &'a Connection,
    committed: bool,
}

impl<'a> TransactionGuard<'a> {
    pub(crate) fn begin(conn: &'a Connection) -> Result<Self, StoreError> {
        conn.execute_batch("BEGIN IMMEDIATE").context(ExecuteSnafu)?;
        Ok(Self {
            conn,
            committed: false,
        })
    }

    pub(crate) fn commit(mut self) -> Result<(), StoreError> {
        self.conn.execute_batch("COMMIT").context(ExecuteSnafu)?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for TransactionGuard<'_> {
    fn drop(&mut self) {
        if !self.committed {
            let _ = self.conn.execute_batch("ROLLBACK");
        }
    }
}
