//! Audit log client. One row per processed envelope, written by validation
//! workers before they acknowledge the message.

use chrono::{DateTime, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, types::Type};
use snafu::ResultExt;

use crate::domain::{Fingerprint, VoteStatus};

use super::sqlite::{PoolCheckoutSnafu, QuerySnafu, StoreError, TaskJoinSnafu};

/// A finished audit entry ready for insertion.
#[derive(Debug, Clone)]
pub struct AuditRecord {
    pub fingerprint: String,
    pub scope: String,
    pub choice_payload: serde_json::Value,
    pub status: VoteStatus,
    pub attempt_count: Option<u64>,
    pub error: Option<String>,
    pub received_at: DateTime<Utc>,
    pub processed_at: DateTime<Utc>,
}

/// An audit entry as read back from the store.
#[derive(Debug, Clone)]
pub struct AuditRow {
    pub id: i64,
    pub fingerprint: String,
    pub scope: String,
    pub choice_payload: serde_json::Value,
    pub status: String,
    pub attempt_count: Option<u64>,
    pub error: Option<String>,
    pub received_at: DateTime<Utc>,
    pub processed_at: DateTime<Utc>,
}

fn parse_ts(idx: usize, text: String) -> Result<DateTime<Utc>, rusqlite::Error> {
    DateTime::parse_from_rfc3339(&text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// Client for the `vote_audit` table.
#[derive(Clone)]
pub struct AuditStore {
    pool: Pool<SqliteConnectionManager>,
}

impl std::fmt::Debug for AuditStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditStore").finish()
    }
}

impl AuditStore {
    pub fn new(pool: Pool<SqliteConnectionManager>) -> Self {
        Self { pool }
    }

    /// Insert one audit row. A unique-index conflict on the accepted path
    /// is reported as `StoreError::DuplicateAccepted`; the caller decides
    /// whether that is a re-classification or a fatal inconsistency.
    pub async fn insert(&self, record: AuditRecord) -> Result<i64, StoreError> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get().context(PoolCheckoutSnafu)?;
            let payload = record.choice_payload.to_string();
            let result = conn.execute(
                "INSERT INTO vote_audit
                     (fingerprint, scope, choice_payload, status, attempt_count, error,
                      received_at, processed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    record.fingerprint,
                    record.scope,
                    payload,
                    record.status.as_str(),
                    record.attempt_count,
                    record.error,
                    record.received_at.to_rfc3339(),
                    record.processed_at.to_rfc3339(),
                ],
            );
            match result {
                Ok(_) => Ok(conn.last_insert_rowid()),
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    Err(StoreError::DuplicateAccepted {
                        fingerprint: record.fingerprint,
                        scope: record.scope,
                    })
                }
                Err(source) => Err(StoreError::Execute { source }),
            }
        })
        .await
        .context(TaskJoinSnafu)?
    }

    /// Fingerprints of all accepted ballots, for rebuilding the cast set at
    /// worker startup. Rows with malformed fingerprints are skipped.
    pub async fn accepted_fingerprints(&self) -> Result<Vec<Fingerprint>, StoreError> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get().context(PoolCheckoutSnafu)?;
            let mut stmt = conn
                .prepare("SELECT fingerprint FROM vote_audit WHERE status = 'accepted'")
                .context(QuerySnafu)?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .context(QuerySnafu)?;
            let mut fingerprints = Vec::new();
            for row in rows {
                let text = row.context(QuerySnafu)?;
                if let Ok(fingerprint) = Fingerprint::parse(&text) {
                    fingerprints.push(fingerprint);
                }
            }
            Ok(fingerprints)
        })
        .await
        .context(TaskJoinSnafu)?
    }

    /// All audit entries for one fingerprint, oldest first.
    pub async fn records_for(&self, fingerprint: &str) -> Result<Vec<AuditRow>, StoreError> {
        let pool = self.pool.clone();
        let fingerprint = fingerprint.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get().context(PoolCheckoutSnafu)?;
            let mut stmt = conn
                .prepare(
                    "SELECT id, fingerprint, scope, choice_payload, status, attempt_count,
                            error, received_at, processed_at
                     FROM vote_audit WHERE fingerprint = ?1 ORDER BY id",
                )
                .context(QuerySnafu)?;
            let rows = stmt
                .query_map(params![fingerprint], |row| {
                    let payload: Option<String> = row.get(3)?;
                    Ok(AuditRow {
                        id: row.get(0)?,
                        fingerprint: row.get(1)?,
                        scope: row.get(2)?,
                        choice_payload: payload
                            .and_then(|p| serde_json::from_str(&p).ok())
                            .unwrap_or(serde_json::Value::Null),
                        status: row.get(4)?,
                        attempt_count: row.get(5)?,
                        error: row.get(6)?,
                        received_at: parse_ts(7, row.get::<_, String>(7)?)?,
                        processed_at: parse_ts(8, row.get::<_, String>(8)?)?,
                    })
                })
                .context(QuerySnafu)?;
            rows.collect::<Result<_, _>>().context(QuerySnafu)
        })
        .await
        .context(TaskJoinSnafu)?
    }

    /// Accepted audit entries for one ballot scope, oldest first. Feeds
    /// the reconciliation re-emission path.
    pub async fn accepted_for_scope(&self, scope: &str) -> Result<Vec<AuditRow>, StoreError> {
        let pool = self.pool.clone();
        let scope = scope.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get().context(PoolCheckoutSnafu)?;
            let mut stmt = conn
                .prepare(
                    "SELECT id, fingerprint, scope, choice_payload, status, attempt_count,
                            error, received_at, processed_at
                     FROM vote_audit
                     WHERE scope = ?1 AND status = 'accepted'
                     ORDER BY id",
                )
                .context(QuerySnafu)?;
            let rows = stmt
                .query_map(params![scope], |row| {
                    let payload: Option<String> = row.get(3)?;
                    Ok(AuditRow {
                        id: row.get(0)?,
                        fingerprint: row.get(1)?,
                        scope: row.get(2)?,
                        choice_payload: payload
                            .and_then(|p| serde_json::from_str(&p).ok())
                            .unwrap_or(serde_json::Value::Null),
                        status: row.get(4)?,
                        attempt_count: row.get(5)?,
                        error: row.get(6)?,
                        received_at: parse_ts(7, row.get::<_, String>(7)?)?,
                        processed_at: parse_ts(8, row.get::<_, String>(8)?)?,
                    })
                })
                .context(QuerySnafu)?;
            rows.collect::<Result<_, _>>().context(QuerySnafu)
        })
        .await
        .context(TaskJoinSnafu)?
    }

    /// Count audit rows by status, optionally limited to one scope.
    pub async fn count_by_status(
        &self,
        status: VoteStatus,
        scope: Option<&str>,
    ) -> Result<u64, StoreError> {
        let pool = self.pool.clone();
        let scope = scope.map(str::to_string);
        tokio::task::spawn_blocking(move || {
            let conn = pool.get().context(PoolCheckoutSnafu)?;
            match scope {
                Some(scope) => conn
                    .query_row(
                        "SELECT COUNT(*) FROM vote_audit WHERE status = ?1 AND scope = ?2",
                        params![status.as_str(), scope],
                        |row| row.get(0),
                    )
                    .context(QuerySnafu),
                None => conn
                    .query_row(
                        "SELECT COUNT(*) FROM vote_audit WHERE status = ?1",
                        params![status.as_str()],
                        |row| row.get(0),
                    )
                    .context(QuerySnafu),
            }
        })
        .await
        .context(TaskJoinSnafu)?
    }

    /// Connectivity probe.
    pub async fn ping(&self) -> Result<(), StoreError> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get().context(PoolCheckoutSnafu)?;
            conn.query_row("SELECT 1", [], |_| Ok(())).context(QuerySnafu)
        })
        .await
        .context(TaskJoinSnafu)?
    }
}
