//! SQLite-backed durable queues with at-least-once delivery.
//!
//! The broker contract mirrors what the pipeline needs from a message bus:
//! durable publish (the insert commit is the publisher confirmation),
//! consumer-side receipt handles, manual ack/nack, visibility-timeout
//! redelivery, bounded delivery attempts with dead-lettering, and a
//! per-queue maximum length so the broker pushes back instead of growing
//! without bound.

use std::path::{Path, PathBuf};
use std::time::Duration;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension};
use snafu::{ResultExt, Snafu};
use uuid::Uuid;

/// Errors surfaced by the bus. Everything except `QueueFull` and
/// `UnknownReceipt` is infrastructure trouble and treated as transient by
/// callers.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum BusError {
    #[snafu(display("failed to open bus database at {}: {source}", path.display()))]
    OpenDatabase {
        path: PathBuf,
        source: r2d2::Error,
    },

    #[snafu(display("failed to prepare bus schema: {source}"))]
    Schema { source: rusqlite::Error },

    #[snafu(display("bus connection pool error: {source}"))]
    PoolCheckout { source: r2d2::Error },

    #[snafu(display("failed to execute bus statement: {source}"))]
    Execute { source: rusqlite::Error },

    #[snafu(display("failed to query bus: {source}"))]
    Query { source: rusqlite::Error },

    #[snafu(display("queue {queue} is at capacity ({max_length} messages)"))]
    QueueFull { queue: String, max_length: u64 },

    #[snafu(display("receipt handle {receipt} matches no in-flight message"))]
    UnknownReceipt { receipt: String },

    #[snafu(display("bus task was cancelled: {source}"))]
    TaskJoin { source: tokio::task::JoinError },
}

impl BusError {
    /// Whether the caller should surface back-pressure (HTTP 503) rather
    /// than retry internally.
    pub fn is_back_pressure(&self) -> bool {
        matches!(self, BusError::QueueFull { .. })
    }
}

/// Why a message was dead-lettered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadReason {
    /// Delivery attempts exhausted while the message kept timing out or
    /// being requeued.
    MaxDeliveryAttemptsExceeded,
    /// Consumer rejected the message without requeue.
    ExplicitlyRejected,
}

impl DeadReason {
    fn as_str(&self) -> &'static str {
        match self {
            DeadReason::MaxDeliveryAttemptsExceeded => "max_delivery_attempts_exceeded",
            DeadReason::ExplicitlyRejected => "explicitly_rejected",
        }
    }
}

/// One dequeued message. The receipt handle is the sole token for
/// ack/nack; it is invalidated when the visibility deadline passes.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message_id: u64,
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub receipt: String,
    pub delivery_attempts: u32,
}

/// Broker tuning knobs, one set per bus instance.
#[derive(Debug, Clone)]
pub struct BusOptions {
    /// Maximum ready+in-flight messages per queue; publishes beyond this
    /// are rejected.
    pub max_length: u64,
    /// How long a dequeued message stays invisible before it is considered
    /// abandoned and redelivered.
    pub visibility_timeout: Duration,
    /// Delivery attempts before a message is dead-lettered.
    pub max_delivery_attempts: u32,
}

impl Default for BusOptions {
    fn default() -> Self {
        Self {
            max_length: 100_000,
            visibility_timeout: Duration::from_secs(30),
            max_delivery_attempts: 3,
        }
    }
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS bus_message (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    queue TEXT NOT NULL,
    routing_key TEXT NOT NULL,
    payload BLOB NOT NULL,
    state TEXT NOT NULL DEFAULT 'ready',
    receipt TEXT,
    consumer TEXT,
    delivery_attempts INTEGER NOT NULL DEFAULT 0,
    enqueued_at_ms INTEGER NOT NULL,
    visibility_deadline_ms INTEGER
);
CREATE INDEX IF NOT EXISTS idx_bus_message_queue_state
    ON bus_message(queue, state, id);
CREATE UNIQUE INDEX IF NOT EXISTS idx_bus_message_receipt
    ON bus_message(receipt) WHERE receipt IS NOT NULL;
CREATE TABLE IF NOT EXISTS bus_dead_message (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    queue TEXT NOT NULL,
    routing_key TEXT NOT NULL,
    payload BLOB NOT NULL,
    delivery_attempts INTEGER NOT NULL,
    reason TEXT NOT NULL,
    error TEXT,
    enqueued_at_ms INTEGER NOT NULL,
    dead_at_ms INTEGER NOT NULL
);
";

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// RAII transaction guard: rolls back on drop unless committed.
struct TransactionGuard<'a> {
    conn: &'a Connection,
    committed: bool,
}

impl<'a> TransactionGuard<'a> {
    fn begin(conn: &'a Connection) -> Result<Self, BusError> {
        conn.execute_batch("BEGIN IMMEDIATE").context(ExecuteSnafu)?;
        Ok(Self {
            conn,
            committed: false,
        })
    }

    fn commit(mut self) -> Result<(), BusError> {
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

/// Handle to the durable bus. Cloning shares the underlying pool, so every
/// service process opens the bus once and hands clones to its tasks.
#[derive(Clone)]
pub struct MessageBus {
    pool: Pool<SqliteConnectionManager>,
    options: BusOptions,
}

impl std::fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBus")
            .field("options", &self.options)
            .finish()
    }
}

impl MessageBus {
    /// Open (or create) the bus database and prepare its schema.
    pub fn open(path: &Path, options: BusOptions) -> Result<Self, BusError> {
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
        drop(conn);
        Ok(Self { pool, options })
    }

    /// Durably publish one message. Returns only after the insert has
    /// committed, which is the broker confirmation: a caller that sees
    /// `Ok` may promise delivery to its own client.
    pub async fn publish(
        &self,
        queue: &str,
        routing_key: &str,
        payload: Vec<u8>,
    ) -> Result<u64, BusError> {
        let this = self.clone();
        let queue = queue.to_string();
        let routing_key = routing_key.to_string();
        tokio::task::spawn_blocking(move || this.publish_blocking(&queue, &routing_key, &payload))
            .await
            .context(TaskJoinSnafu)?
    }

    /// Dequeue up to `max` messages for `consumer`. Dequeued messages stay
    /// invisible to other consumers until acked, nacked, or the visibility
    /// timeout lapses.
    pub async fn dequeue(
        &self,
        queue: &str,
        consumer: &str,
        max: u32,
    ) -> Result<Vec<Delivery>, BusError> {
        let this = self.clone();
        let queue = queue.to_string();
        let consumer = consumer.to_string();
        tokio::task::spawn_blocking(move || this.dequeue_blocking(&queue, &consumer, max))
            .await
            .context(TaskJoinSnafu)?
    }

    /// Acknowledge a delivery; the message is gone for good.
    pub async fn ack(&self, receipt: &str) -> Result<(), BusError> {
        let this = self.clone();
        let receipt = receipt.to_string();
        tokio::task::spawn_blocking(move || this.ack_blocking(&receipt))
            .await
            .context(TaskJoinSnafu)?
    }

    /// Negative-acknowledge a delivery. With `requeue` the message becomes
    /// visible again (until its delivery attempts run out); without it the
    /// message is dead-lettered immediately.
    pub async fn nack(
        &self,
        receipt: &str,
        requeue: bool,
        error: Option<String>,
    ) -> Result<(), BusError> {
        let this = self.clone();
        let receipt = receipt.to_string();
        tokio::task::spawn_blocking(move || this.nack_blocking(&receipt, requeue, error))
            .await
            .context(TaskJoinSnafu)?
    }

    /// Ready + in-flight depth of a queue.
    pub async fn depth(&self, queue: &str) -> Result<u64, BusError> {
        let this = self.clone();
        let queue = queue.to_string();
        tokio::task::spawn_blocking(move || this.depth_blocking(&queue))
            .await
            .context(TaskJoinSnafu)?
    }

    /// Number of dead-lettered messages for a queue.
    pub async fn dead_count(&self, queue: &str) -> Result<u64, BusError> {
        let this = self.clone();
        let queue = queue.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = this.pool.get().context(PoolCheckoutSnafu)?;
            conn.query_row(
                "SELECT COUNT(*) FROM bus_dead_message WHERE queue = ?1",
                params![queue],
                |row| row.get::<_, u64>(0),
            )
            .context(QuerySnafu)
        })
        .await
        .context(TaskJoinSnafu)?
    }

    /// Cheap connectivity probe for health endpoints.
    pub async fn ping(&self) -> Result<(), BusError> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || {
            let conn = this.pool.get().context(PoolCheckoutSnafu)?;
            conn.query_row("SELECT 1", [], |_| Ok(())).context(QuerySnafu)
        })
        .await
        .context(TaskJoinSnafu)?
    }

    fn publish_blocking(
        &self,
        queue: &str,
        routing_key: &str,
        payload: &[u8],
    ) -> Result<u64, BusError> {
        let conn = self.pool.get().context(PoolCheckoutSnafu)?;
        let tx = TransactionGuard::begin(&conn)?;
        let depth: u64 = conn
            .query_row(
                "SELECT COUNT(*) FROM bus_message WHERE queue = ?1",
                params![queue],
                |row| row.get(0),
            )
            .context(QuerySnafu)?;
        if depth >= self.options.max_length {
            return Err(BusError::QueueFull {
                queue: queue.to_string(),
                max_length: self.options.max_length,
            });
        }
        conn.execute(
            "INSERT INTO bus_message (queue, routing_key, payload, enqueued_at_ms)
             VALUES (?1, ?2, ?3, ?4)",
            params![queue, routing_key, payload, now_ms()],
        )
        .context(ExecuteSnafu)?;
        let id = conn.last_insert_rowid() as u64;
        tx.commit()?;
        Ok(id)
    }

    fn dequeue_blocking(
        &self,
        queue: &str,
        consumer: &str,
        max: u32,
    ) -> Result<Vec<Delivery>, BusError> {
        let conn = self.pool.get().context(PoolCheckoutSnafu)?;
        let now = now_ms();
        let tx = TransactionGuard::begin(&conn)?;

        self.reclaim_expired(&conn, queue, now)?;

        let mut deliveries = Vec::new();
        {
            let mut stmt = conn
                .prepare(
                    "SELECT id, routing_key, payload, delivery_attempts
                     FROM bus_message
                     WHERE queue = ?1 AND state = 'ready'
                     ORDER BY id
                     LIMIT ?2",
                )
                .context(QuerySnafu)?;
            let rows = stmt
                .query_map(params![queue, max], |row| {
                    Ok((
                        row.get::<_, u64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Vec<u8>>(2)?,
                        row.get::<_, u32>(3)?,
                    ))
                })
                .context(QuerySnafu)?;
            for row in rows {
                let (id, routing_key, payload, attempts) = row.context(QuerySnafu)?;
                deliveries.push(Delivery {
                    message_id: id,
                    routing_key,
                    payload,
                    receipt: Uuid::new_v4().to_string(),
                    delivery_attempts: attempts + 1,
                });
            }
        }

        let deadline = now + self.options.visibility_timeout.as_millis() as i64;
        for delivery in &deliveries {
            conn.execute(
                "UPDATE bus_message
                 SET state = 'pending', receipt = ?1, consumer = ?2,
                     delivery_attempts = ?3, visibility_deadline_ms = ?4
                 WHERE id = ?5",
                params![
                    delivery.receipt,
                    consumer,
                    delivery.delivery_attempts,
                    deadline,
                    delivery.message_id
                ],
            )
            .context(ExecuteSnafu)?;
        }

        tx.commit()?;
        Ok(deliveries)
    }

    /// Return timed-out in-flight messages to the ready state, or
    /// dead-letter them once their attempts are spent. Runs inside the
    /// caller's transaction.
    fn reclaim_expired(&self, conn: &Connection, queue: &str, now: i64) -> Result<(), BusError> {
        let expired: Vec<(u64, u32)> = {
            let mut stmt = conn
                .prepare(
                    "SELECT id, delivery_attempts FROM bus_message
                     WHERE queue = ?1 AND state = 'pending' AND visibility_deadline_ms <= ?2",
                )
                .context(QuerySnafu)?;
            let rows = stmt
                .query_map(params![queue, now], |row| Ok((row.get(0)?, row.get(1)?)))
                .context(QuerySnafu)?;
            rows.collect::<Result<_, _>>().context(QuerySnafu)?
        };

        for (id, attempts) in expired {
            if attempts >= self.options.max_delivery_attempts {
                self.move_to_dead(
                    conn,
                    id,
                    DeadReason::MaxDeliveryAttemptsExceeded,
                    Some("visibility timeout".to_string()),
                    now,
                )?;
            } else {
                conn.execute(
                    "UPDATE bus_message
                     SET state = 'ready', receipt = NULL, consumer = NULL,
                         visibility_deadline_ms = NULL
                     WHERE id = ?1",
                    params![id],
                )
                .context(ExecuteSnafu)?;
            }
        }
        Ok(())
    }

    fn move_to_dead(
        &self,
        conn: &Connection,
        id: u64,
        reason: DeadReason,
        error: Option<String>,
        now: i64,
    ) -> Result<(), BusError> {
        conn.execute(
            "INSERT INTO bus_dead_message
                 (queue, routing_key, payload, delivery_attempts, reason, error,
                  enqueued_at_ms, dead_at_ms)
             SELECT queue, routing_key, payload, delivery_attempts, ?2, ?3,
                    enqueued_at_ms, ?4
             FROM bus_message WHERE id = ?1",
            params![id, reason.as_str(), error, now],
        )
        .context(ExecuteSnafu)?;
        conn.execute("DELETE FROM bus_message WHERE id = ?1", params![id])
            .context(ExecuteSnafu)?;
        Ok(())
    }

    fn ack_blocking(&self, receipt: &str) -> Result<(), BusError> {
        let conn = self.pool.get().context(PoolCheckoutSnafu)?;
        let deleted = conn
            .execute(
                "DELETE FROM bus_message WHERE receipt = ?1 AND state = 'pending'",
                params![receipt],
            )
            .context(ExecuteSnafu)?;
        if deleted == 0 {
            return Err(BusError::UnknownReceipt {
                receipt: receipt.to_string(),
            });
        }
        Ok(())
    }

    fn nack_blocking(
        &self,
        receipt: &str,
        requeue: bool,
        error: Option<String>,
    ) -> Result<(), BusError> {
        let conn = self.pool.get().context(PoolCheckoutSnafu)?;
        let now = now_ms();
        let tx = TransactionGuard::begin(&conn)?;
        let row: Option<(u64, u32)> = conn
            .query_row(
                "SELECT id, delivery_attempts FROM bus_message
                 WHERE receipt = ?1 AND state = 'pending'",
                params![receipt],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .context(QuerySnafu)?;
        let Some((id, attempts)) = row else {
            return Err(BusError::UnknownReceipt {
                receipt: receipt.to_string(),
            });
        };

        if !requeue {
            self.move_to_dead(&conn, id, DeadReason::ExplicitlyRejected, error, now)?;
        } else if attempts >= self.options.max_delivery_attempts {
            self.move_to_dead(&conn, id, DeadReason::MaxDeliveryAttemptsExceeded, error, now)?;
        } else {
            conn.execute(
                "UPDATE bus_message
                 SET state = 'ready', receipt = NULL, consumer = NULL,
                     visibility_deadline_ms = NULL
                 WHERE id = ?1",
                params![id],
            )
            .context(ExecuteSnafu)?;
        }
        tx.commit()?;
        Ok(())
    }

    fn depth_blocking(&self, queue: &str) -> Result<u64, BusError> {
        let conn = self.pool.get().context(PoolCheckoutSnafu)?;
        conn.query_row(
            "SELECT COUNT(*) FROM bus_message WHERE queue = ?1",
            params![queue],
            |row| row.get(0),
        )
        .context(QuerySnafu)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_bus(options: BusOptions) -> (tempfile::TempDir, MessageBus) {
        let dir = tempfile::tempdir().unwrap();
        let bus = MessageBus::open(&dir.path().join("bus.db"), options).unwrap();
        (dir, bus)
    }

    #[tokio::test]
    async fn publish_dequeue_ack_lifecycle() {
        let (_dir, bus) = open_bus(BusOptions::default());
        bus.publish("validation", "vote.validation.law", b"one".to_vec())
            .await
            .unwrap();
        bus.publish("validation", "vote.validation.law", b"two".to_vec())
            .await
            .unwrap();
        assert_eq!(bus.depth("validation").await.unwrap(), 2);

        let deliveries = bus.dequeue("validation", "worker-0", 10).await.unwrap();
        assert_eq!(deliveries.len(), 2);
        assert_eq!(deliveries[0].payload, b"one");
        assert_eq!(deliveries[0].delivery_attempts, 1);

        // In-flight messages are invisible to other consumers.
        assert!(bus.dequeue("validation", "worker-1", 10).await.unwrap().is_empty());

        for delivery in &deliveries {
            bus.ack(&delivery.receipt).await.unwrap();
        }
        assert_eq!(bus.depth("validation").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn ack_with_stale_receipt_fails() {
        let (_dir, bus) = open_bus(BusOptions::default());
        bus.publish("validation", "rk", b"x".to_vec()).await.unwrap();
        let delivery = bus.dequeue("validation", "w", 1).await.unwrap().remove(0);
        bus.ack(&delivery.receipt).await.unwrap();
        let err = bus.ack(&delivery.receipt).await.unwrap_err();
        assert!(matches!(err, BusError::UnknownReceipt { .. }));
    }

    #[tokio::test]
    async fn visibility_timeout_redelivers() {
        let (_dir, bus) = open_bus(BusOptions {
            visibility_timeout: Duration::from_millis(20),
            ..BusOptions::default()
        });
        bus.publish("validation", "rk", b"x".to_vec()).await.unwrap();
        let first = bus.dequeue("validation", "w0", 1).await.unwrap().remove(0);
        tokio::time::sleep(Duration::from_millis(40)).await;

        let second = bus.dequeue("validation", "w1", 1).await.unwrap().remove(0);
        assert_eq!(second.delivery_attempts, 2);
        assert_ne!(first.receipt, second.receipt);

        // The original receipt is no longer honored.
        assert!(bus.ack(&first.receipt).await.is_err());
        bus.ack(&second.receipt).await.unwrap();
    }

    #[tokio::test]
    async fn nack_requeue_then_dead_letter() {
        let (_dir, bus) = open_bus(BusOptions {
            max_delivery_attempts: 2,
            ..BusOptions::default()
        });
        bus.publish("validation", "rk", b"x".to_vec()).await.unwrap();

        let d1 = bus.dequeue("validation", "w", 1).await.unwrap().remove(0);
        bus.nack(&d1.receipt, true, Some("transient".to_string()))
            .await
            .unwrap();

        let d2 = bus.dequeue("validation", "w", 1).await.unwrap().remove(0);
        assert_eq!(d2.delivery_attempts, 2);
        bus.nack(&d2.receipt, true, Some("transient".to_string()))
            .await
            .unwrap();

        // Attempts exhausted: message is gone from the queue, present in
        // the dead letters.
        assert!(bus.dequeue("validation", "w", 1).await.unwrap().is_empty());
        assert_eq!(bus.depth("validation").await.unwrap(), 0);
        assert_eq!(bus.dead_count("validation").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn nack_without_requeue_dead_letters_immediately() {
        let (_dir, bus) = open_bus(BusOptions::default());
        bus.publish("validation", "rk", b"garbage".to_vec())
            .await
            .unwrap();
        let delivery = bus.dequeue("validation", "w", 1).await.unwrap().remove(0);
        bus.nack(&delivery.receipt, false, Some("unparseable".to_string()))
            .await
            .unwrap();
        assert_eq!(bus.depth("validation").await.unwrap(), 0);
        assert_eq!(bus.dead_count("validation").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn max_length_rejects_publish() {
        let (_dir, bus) = open_bus(BusOptions {
            max_length: 2,
            ..BusOptions::default()
        });
        bus.publish("validation", "rk", b"1".to_vec()).await.unwrap();
        bus.publish("validation", "rk", b"2".to_vec()).await.unwrap();
        let err = bus.publish("validation", "rk", b"3".to_vec()).await.unwrap_err();
        assert!(err.is_back_pressure());

        // Other queues are unaffected.
        bus.publish("review", "rk", b"ok".to_vec()).await.unwrap();
    }

    #[tokio::test]
    async fn queues_are_isolated() {
        let (_dir, bus) = open_bus(BusOptions::default());
        bus.publish("validation", "rk", b"v".to_vec()).await.unwrap();
        bus.publish("aggregation", "rk", b"a".to_vec()).await.unwrap();

        let deliveries = bus.dequeue("aggregation", "agg", 10).await.unwrap();
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].payload, b"a");
        assert_eq!(bus.depth("validation").await.unwrap(), 1);
    }
}
