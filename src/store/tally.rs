//! Tally client: additive upserts applied in batches by the aggregator,
//! read projections for the results endpoints, the election registry, and
//! the audit-vs-tally reconciliation query.

use chrono::{DateTime, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, types::Type, OptionalExtension};
use snafu::ResultExt;

use super::sqlite::{ExecuteSnafu, PoolCheckoutSnafu, QuerySnafu, StoreError, TaskJoinSnafu, TransactionGuard};

/// Additive law-tally update for one ballot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LawDelta {
    pub ballot_id: String,
    pub yes: i64,
    pub no: i64,
}

/// Additive election-tally update for one candidate row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElectionDelta {
    pub election_id: i64,
    pub region_id: i64,
    pub candidate_id: i64,
    pub votes: i64,
}

/// One row of `law_tally`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct LawTallyRow {
    pub ballot_id: String,
    pub yes_count: i64,
    pub no_count: i64,
    pub total_votes: i64,
    pub updated_at: DateTime<Utc>,
}

/// One row of `election_tally`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ElectionTallyRow {
    pub election_id: i64,
    pub region_id: i64,
    pub candidate_id: i64,
    pub vote_count: i64,
    pub percentage: f64,
}

/// One registered election with its voting window.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Election {
    pub id: i64,
    pub name: Option<String>,
    pub method: String,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
}

/// Where audit counts and tallies disagree: positive deltas are accepted
/// ballots the tallies have not absorbed yet.
#[derive(Debug, Clone, Default)]
pub struct ReconciliationReport {
    pub law: Vec<LawDelta>,
    pub election: Vec<ElectionDelta>,
}

impl ReconciliationReport {
    pub fn is_clean(&self) -> bool {
        self.law.is_empty() && self.election.is_empty()
    }
}

fn parse_ts(idx: usize, text: String) -> Result<DateTime<Utc>, rusqlite::Error> {
    DateTime::parse_from_rfc3339(&text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// Client for the tally tables and the election registry.
#[derive(Clone)]
pub struct TallyStore {
    pool: Pool<SqliteConnectionManager>,
}

impl std::fmt::Debug for TallyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TallyStore").finish()
    }
}

impl TallyStore {
    pub fn new(pool: Pool<SqliteConnectionManager>) -> Self {
        Self { pool }
    }

    /// Apply one aggregation batch in a single transaction. Upserts are
    /// commutative-additive, so any interleaving of batches converges to
    /// the same counts. Percentages are recomputed for every
    /// (election, region) the batch touched.
    pub async fn apply_batch(
        &self,
        law: Vec<LawDelta>,
        election: Vec<ElectionDelta>,
    ) -> Result<(), StoreError> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get().context(PoolCheckoutSnafu)?;
            let now = Utc::now().to_rfc3339();
            let tx = TransactionGuard::begin(&conn)?;

            for delta in &law {
                conn.execute(
                    "INSERT INTO law_tally (ballot_id, yes_count, no_count, updated_at)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT (ballot_id) DO UPDATE SET
                         yes_count = law_tally.yes_count + excluded.yes_count,
                         no_count = law_tally.no_count + excluded.no_count,
                         updated_at = excluded.updated_at",
                    params![delta.ballot_id, delta.yes, delta.no, now],
                )
                .context(ExecuteSnafu)?;
            }

            let mut touched_regions = std::collections::BTreeSet::new();
            for delta in &election {
                conn.execute(
                    "INSERT INTO election_tally
                         (election_id, region_id, candidate_id, vote_count, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT (election_id, region_id, candidate_id) DO UPDATE SET
                         vote_count = election_tally.vote_count + excluded.vote_count,
                         updated_at = excluded.updated_at",
                    params![
                        delta.election_id,
                        delta.region_id,
                        delta.candidate_id,
                        delta.votes,
                        now
                    ],
                )
                .context(ExecuteSnafu)?;
                touched_regions.insert((delta.election_id, delta.region_id));
            }

            for (election_id, region_id) in touched_regions {
                conn.execute(
                    "UPDATE election_tally
                     SET percentage = ROUND(vote_count * 100.0 /
                         (SELECT SUM(vote_count) FROM election_tally t
                          WHERE t.election_id = election_tally.election_id
                            AND t.region_id = election_tally.region_id), 2)
                     WHERE election_id = ?1 AND region_id = ?2",
                    params![election_id, region_id],
                )
                .context(ExecuteSnafu)?;
            }

            tx.commit()
        })
        .await
        .context(TaskJoinSnafu)?
    }

    /// Current counts for one referendum.
    pub async fn law_results(&self, ballot_id: &str) -> Result<Option<LawTallyRow>, StoreError> {
        let pool = self.pool.clone();
        let ballot_id = ballot_id.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get().context(PoolCheckoutSnafu)?;
            conn.query_row(
                "SELECT ballot_id, yes_count, no_count, updated_at
                 FROM law_tally WHERE ballot_id = ?1",
                params![ballot_id],
                |row| {
                    let yes: i64 = row.get(1)?;
                    let no: i64 = row.get(2)?;
                    Ok(LawTallyRow {
                        ballot_id: row.get(0)?,
                        yes_count: yes,
                        no_count: no,
                        total_votes: yes + no,
                        updated_at: parse_ts(3, row.get::<_, String>(3)?)?,
                    })
                },
            )
            .optional()
            .context(QuerySnafu)
        })
        .await
        .context(TaskJoinSnafu)?
    }

    /// Counts for every referendum seen so far.
    pub async fn all_law_results(&self) -> Result<Vec<LawTallyRow>, StoreError> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get().context(PoolCheckoutSnafu)?;
            let mut stmt = conn
                .prepare(
                    "SELECT ballot_id, yes_count, no_count, updated_at
                     FROM law_tally ORDER BY ballot_id",
                )
                .context(QuerySnafu)?;
            let rows = stmt
                .query_map([], |row| {
                    let yes: i64 = row.get(1)?;
                    let no: i64 = row.get(2)?;
                    Ok(LawTallyRow {
                        ballot_id: row.get(0)?,
                        yes_count: yes,
                        no_count: no,
                        total_votes: yes + no,
                        updated_at: parse_ts(3, row.get::<_, String>(3)?)?,
                    })
                })
                .context(QuerySnafu)?;
            rows.collect::<Result<_, _>>().context(QuerySnafu)
        })
        .await
        .context(TaskJoinSnafu)?
    }

    /// Candidate rows for one (election, region), highest count first.
    pub async fn election_results(
        &self,
        election_id: i64,
        region_id: i64,
    ) -> Result<Vec<ElectionTallyRow>, StoreError> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get().context(PoolCheckoutSnafu)?;
            let mut stmt = conn
                .prepare(
                    "SELECT election_id, region_id, candidate_id, vote_count, percentage
                     FROM election_tally
                     WHERE election_id = ?1 AND region_id = ?2
                     ORDER BY vote_count DESC, candidate_id",
                )
                .context(QuerySnafu)?;
            let rows = stmt
                .query_map(params![election_id, region_id], |row| {
                    Ok(ElectionTallyRow {
                        election_id: row.get(0)?,
                        region_id: row.get(1)?,
                        candidate_id: row.get(2)?,
                        vote_count: row.get(3)?,
                        percentage: row.get(4)?,
                    })
                })
                .context(QuerySnafu)?;
            rows.collect::<Result<_, _>>().context(QuerySnafu)
        })
        .await
        .context(TaskJoinSnafu)?
    }

    /// Register or update an election and its voting window.
    pub async fn upsert_election(&self, election: Election) -> Result<(), StoreError> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get().context(PoolCheckoutSnafu)?;
            conn.execute(
                "INSERT INTO elections (id, name, method, start_at, end_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT (id) DO UPDATE SET
                     name = excluded.name,
                     method = excluded.method,
                     start_at = excluded.start_at,
                     end_at = excluded.end_at",
                params![
                    election.id,
                    election.name,
                    election.method,
                    election.start_at.to_rfc3339(),
                    election.end_at.to_rfc3339(),
                ],
            )
            .context(ExecuteSnafu)?;
            Ok(())
        })
        .await
        .context(TaskJoinSnafu)?
    }

    /// All registered elections.
    pub async fn elections(&self) -> Result<Vec<Election>, StoreError> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get().context(PoolCheckoutSnafu)?;
            let mut stmt = conn
                .prepare("SELECT id, name, method, start_at, end_at FROM elections ORDER BY id")
                .context(QuerySnafu)?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(Election {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        method: row.get(2)?,
                        start_at: parse_ts(3, row.get::<_, String>(3)?)?,
                        end_at: parse_ts(4, row.get::<_, String>(4)?)?,
                    })
                })
                .context(QuerySnafu)?;
            rows.collect::<Result<_, _>>().context(QuerySnafu)
        })
        .await
        .context(TaskJoinSnafu)?
    }

    /// Voting window of one election, if registered.
    pub async fn election_window(
        &self,
        election_id: i64,
    ) -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>, StoreError> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get().context(PoolCheckoutSnafu)?;
            conn.query_row(
                "SELECT start_at, end_at FROM elections WHERE id = ?1",
                params![election_id],
                |row| {
                    Ok((
                        parse_ts(0, row.get::<_, String>(0)?)?,
                        parse_ts(1, row.get::<_, String>(1)?)?,
                    ))
                },
            )
            .optional()
            .context(QuerySnafu)
        })
        .await
        .context(TaskJoinSnafu)?
    }

    /// Compare accepted audit counts with tallies. The report lists the
    /// counts the tallies are short by; at quiescence a clean report means
    /// conservation holds for every scope.
    pub async fn reconciliation_report(&self) -> Result<ReconciliationReport, StoreError> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get().context(PoolCheckoutSnafu)?;
            let mut report = ReconciliationReport::default();

            let mut stmt = conn
                .prepare(
                    "SELECT a.scope,
                            SUM(CASE WHEN json_extract(a.choice_payload, '$.choice') = 'yes'
                                     THEN 1 ELSE 0 END),
                            SUM(CASE WHEN json_extract(a.choice_payload, '$.choice') = 'no'
                                     THEN 1 ELSE 0 END),
                            COALESCE(t.yes_count, 0),
                            COALESCE(t.no_count, 0)
                     FROM vote_audit a
                     LEFT JOIN law_tally t ON t.ballot_id = a.scope
                     WHERE a.status = 'accepted' AND a.scope NOT LIKE 'election:%'
                     GROUP BY a.scope",
                )
                .context(QuerySnafu)?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, i64>(4)?,
                    ))
                })
                .context(QuerySnafu)?;
            for row in rows {
                let (ballot_id, yes_audits, no_audits, yes_tally, no_tally) =
                    row.context(QuerySnafu)?;
                let yes = (yes_audits - yes_tally).max(0);
                let no = (no_audits - no_tally).max(0);
                if yes > 0 || no > 0 {
                    report.law.push(LawDelta { ballot_id, yes, no });
                }
            }

            let mut stmt = conn
                .prepare(
                    "SELECT CAST(substr(a.scope, 10) AS INTEGER),
                            CAST(json_extract(a.choice_payload, '$.region_id') AS INTEGER),
                            CAST(COALESCE(json_extract(a.choice_payload, '$.single_choice'),
                                          json_extract(a.choice_payload, '$.ranked_choices[0]'))
                                 AS INTEGER),
                            COUNT(*)
                     FROM vote_audit a
                     WHERE a.status = 'accepted' AND a.scope LIKE 'election:%'
                     GROUP BY 1, 2, 3",
                )
                .context(QuerySnafu)?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                })
                .context(QuerySnafu)?;
            let audited: Vec<(i64, i64, i64, i64)> =
                rows.collect::<Result<_, _>>().context(QuerySnafu)?;

            for (election_id, region_id, candidate_id, audits) in audited {
                let tallied: i64 = conn
                    .query_row(
                        "SELECT vote_count FROM election_tally
                         WHERE election_id = ?1 AND region_id = ?2 AND candidate_id = ?3",
                        params![election_id, region_id, candidate_id],
                        |row| row.get(0),
                    )
                    .optional()
                    .context(QuerySnafu)?
                    .unwrap_or(0);
                let votes = (audits - tallied).max(0);
                if votes > 0 {
                    report.election.push(ElectionDelta {
                        election_id,
                        region_id,
                        candidate_id,
                        votes,
                    });
                }
            }

            Ok(report)
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
