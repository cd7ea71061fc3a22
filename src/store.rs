//! Durable per-agent FIFO backlog over embedded `SQLite`.
//!
//! Every message an agent accepts from the bus lands here before anything
//! else happens to it. The store gives each agent an independent queue keyed
//! by `(message id, agent)`, guarantees at most one row per agent is in
//! `processing` at any instant, and keeps completed rows around as tombstones
//! for deduplication until the retention sweep removes them.
//!
//! Writers go through single `UPDATE … WHERE id IN (SELECT … LIMIT 1)`
//! statements so that a claim can never hand the same pending row to two
//! callers, even if two processors are mistakenly running.

use crate::database::DatabaseConnection;
use crate::domain_types::{AgentName, MessageId};
use chrono::Utc;
use sqlx::Row;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Tombstones older than this are eligible for the retention sweep.
pub const RETENTION_PERIOD: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Maximum rows removed per sweep pass, so the sweep never starves ingress.
pub const SWEEP_BATCH_LIMIT: i64 = 1000;

/// Rows stuck in `processing` longer than this are requeued on recovery.
pub const DEFAULT_STALE_CLAIM_AGE: Duration = Duration::from_secs(5 * 60);

const INSERT_MESSAGE: &str = r"
INSERT INTO messages (id, agent, sender, content, arrived_at, state)
VALUES (?1, ?2, ?3, ?4, ?5, 'pending')
ON CONFLICT (id, agent) DO NOTHING;
";

const PEEK_NEXT: &str = r"
SELECT id, agent, sender, content, arrived_at, state, started_at, completed_at, retry_count, failed
FROM messages
WHERE agent = ?1 AND state = 'pending'
ORDER BY arrived_at ASC, id ASC
LIMIT 1;
";

// The inner SELECT picks the head of the queue; the outer guards re-check
// state so a concurrent claimer updates zero rows instead of double-claiming,
// and the NOT EXISTS keeps at most one row per agent in processing.
const CLAIM_NEXT: &str = r"
UPDATE messages
SET state = 'processing', started_at = ?2
WHERE agent = ?1
  AND state = 'pending'
  AND NOT EXISTS (
      SELECT 1 FROM messages WHERE agent = ?1 AND state = 'processing'
  )
  AND id = (
      SELECT id FROM messages
      WHERE agent = ?1 AND state = 'pending'
      ORDER BY arrived_at ASC, id ASC
      LIMIT 1
  )
RETURNING id, agent, sender, content, arrived_at, state, started_at, completed_at, retry_count, failed;
";

const DRAIN_BATCH: &str = r"
SELECT id, agent, sender, content, arrived_at, state, started_at, completed_at, retry_count, failed
FROM messages
WHERE agent = ?1 AND state = 'pending'
ORDER BY arrived_at ASC, id ASC
LIMIT ?2;
";

const COMPLETE_MESSAGE: &str = r"
UPDATE messages
SET state = 'completed', completed_at = ?3
WHERE id = ?1 AND agent = ?2 AND state != 'completed';
";

const REQUEUE_MESSAGE: &str = r"
UPDATE messages
SET state = 'pending', started_at = NULL, retry_count = retry_count + 1
WHERE id = ?1 AND agent = ?2 AND state = 'processing';
";

const FAIL_MESSAGE: &str = r"
UPDATE messages
SET state = 'completed', completed_at = ?3, failed = 1
WHERE id = ?1 AND agent = ?2 AND state != 'completed';
";

const PURGE_PENDING: &str = r"
DELETE FROM messages WHERE agent = ?1 AND state = 'pending';
";

const RECOVER_STALE: &str = r"
UPDATE messages
SET state = 'pending', started_at = NULL
WHERE state = 'processing' AND started_at <= ?1;
";

const RECOVER_STALE_FOR_AGENT: &str = r"
UPDATE messages
SET state = 'pending', started_at = NULL
WHERE agent = ?1 AND state = 'processing' AND started_at <= ?2;
";

const SWEEP_COMPLETED: &str = r"
DELETE FROM messages
WHERE rowid IN (
    SELECT rowid FROM messages
    WHERE state = 'completed' AND completed_at <= ?1
    LIMIT ?2
);
";

const SELECT_HISTORY: &str = r"
SELECT id, agent, sender, content, arrived_at, state, started_at, completed_at, retry_count, failed
FROM messages
WHERE agent = ?1 AND state = 'completed' AND failed = 0
ORDER BY arrived_at DESC, id DESC
LIMIT ?2;
";

const SELECT_STATS: &str = r"
SELECT
    COUNT(*) FILTER (WHERE state = 'pending')    AS pending,
    COUNT(*) FILTER (WHERE state = 'processing') AS processing,
    COUNT(*) FILTER (WHERE state = 'completed' AND completed_at >= ?2)
                                                 AS completed_last_24h,
    AVG(completed_at - started_at) FILTER (
        WHERE state = 'completed' AND started_at IS NOT NULL AND completed_at >= ?2
    )                                            AS avg_process_ms
FROM messages
WHERE agent = ?1;
";

const COUNT_PROCESSING: &str = r"
SELECT COUNT(*) FROM messages WHERE agent = ?1 AND state = 'processing';
";

/// Errors raised by backlog operations.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The database is momentarily locked; the caller should retry.
    #[error("backlog busy, retry later")]
    Busy,

    /// The database file is damaged. Fatal; the operator must intervene.
    #[error("backlog corrupt: {message}")]
    Corrupt {
        /// Diagnostic from `SQLite`.
        message: String,
    },

    /// The disk is full. Fatal for writes.
    #[error("backlog disk full")]
    DiskFull,

    /// Any other database failure.
    #[error("backlog query failed: {0}")]
    Query(#[source] sqlx::Error),

    /// A stored row no longer satisfies domain validation.
    #[error("backlog row invalid: {reason}")]
    InvalidRow {
        /// Why the row was rejected.
        reason: String,
    },
}

impl StoreError {
    /// Whether a retry with backoff is worthwhile.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Busy)
    }

    fn classify(e: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &e {
            let code = db.code().map(|c| c.into_owned()).unwrap_or_default();
            // SQLite primary result codes, possibly extended (low byte).
            match code.parse::<u32>().map(|c| c & 0xff) {
                Ok(5 | 6) => return Self::Busy,
                Ok(11 | 26) => {
                    return Self::Corrupt {
                        message: db.message().to_string(),
                    };
                }
                Ok(13) => return Self::DiskFull,
                _ => {}
            }
        }
        Self::Query(e)
    }
}

/// Lifecycle state of a backlog row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageState {
    /// Waiting to be claimed.
    Pending,
    /// Claimed by a processor; at most one per agent.
    Processing,
    /// Finished; kept as a tombstone for deduplication.
    Completed,
}

impl MessageState {
    fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            other => Err(StoreError::InvalidRow {
                reason: format!("unknown message state '{other}'"),
            }),
        }
    }
}

/// A backlog row.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    /// Bus-assigned message id.
    pub id: MessageId,
    /// Recipient agent this row belongs to.
    pub agent: AgentName,
    /// Agent or human that produced the message.
    pub sender: String,
    /// Message text, possibly carrying `@mention` and `#command` tokens.
    pub content: String,
    /// Kernel-assigned arrival time, epoch milliseconds. FIFO key.
    pub arrived_at: i64,
    /// Current lifecycle state.
    pub state: MessageState,
    /// When processing started, epoch milliseconds.
    pub started_at: Option<i64>,
    /// When processing completed, epoch milliseconds.
    pub completed_at: Option<i64>,
    /// How many times this row has been requeued after a failure.
    pub retry_count: i64,
    /// Whether the row was completed with a failure marker.
    pub failed: bool,
}

impl StoredMessage {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, StoreError> {
        let id: String = row.get("id");
        let agent: String = row.get("agent");
        let state: String = row.get("state");
        Ok(Self {
            id: MessageId::try_new(id).map_err(|e| StoreError::InvalidRow {
                reason: format!("message id: {e}"),
            })?,
            agent: AgentName::try_new(agent).map_err(|e| StoreError::InvalidRow {
                reason: format!("agent name: {e}"),
            })?,
            sender: row.get("sender"),
            content: row.get("content"),
            arrived_at: row.get("arrived_at"),
            state: MessageState::parse(&state)?,
            started_at: row.get("started_at"),
            completed_at: row.get("completed_at"),
            retry_count: row.get("retry_count"),
            failed: row.get::<i64, _>("failed") != 0,
        })
    }
}

/// Outcome of an enqueue attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// A new pending row was created.
    Accepted,
    /// A row with this `(id, agent)` already exists; nothing changed.
    Duplicate,
}

/// Per-agent queue depth and throughput figures.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct BacklogStats {
    /// Rows waiting to be claimed.
    pub pending: i64,
    /// Rows currently claimed (0 or 1 under normal operation).
    pub processing: i64,
    /// Rows completed in the last 24 hours.
    pub completed_last_24h: i64,
    /// Mean processing duration over the last 24 hours, milliseconds.
    pub avg_process_ms: Option<f64>,
}

/// Handle to the backlog. Cheap to clone; clones share the pool.
#[derive(Clone)]
pub struct MessageStore {
    conn: DatabaseConnection,
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

impl MessageStore {
    /// Wraps an open database connection.
    #[must_use]
    pub fn new(conn: DatabaseConnection) -> Self {
        Self { conn }
    }

    /// Inserts a message as pending, assigning its arrival timestamp.
    ///
    /// Idempotent on `(id, agent)`: re-enqueueing an existing row, whatever
    /// its state, is a no-op reported as [`EnqueueOutcome::Duplicate`].
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the insert fails.
    #[instrument(skip(self, sender, content), fields(agent = %agent, message_id = %id))]
    pub async fn enqueue(
        &self,
        id: &MessageId,
        agent: &AgentName,
        sender: &str,
        content: &str,
    ) -> Result<EnqueueOutcome, StoreError> {
        let result = sqlx::query(INSERT_MESSAGE)
            .bind(id.as_str())
            .bind(agent.as_str())
            .bind(sender)
            .bind(content)
            .bind(now_millis())
            .execute(self.conn.pool())
            .await
            .map_err(StoreError::classify)?;

        if result.rows_affected() == 1 {
            debug!("message accepted into backlog");
            Ok(EnqueueOutcome::Accepted)
        } else {
            debug!("duplicate message ignored");
            Ok(EnqueueOutcome::Duplicate)
        }
    }

    /// Returns the oldest pending row for the agent without mutating state.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the query fails.
    pub async fn peek_next(&self, agent: &AgentName) -> Result<Option<StoredMessage>, StoreError> {
        let row = sqlx::query(PEEK_NEXT)
            .bind(agent.as_str())
            .fetch_optional(self.conn.pool())
            .await
            .map_err(StoreError::classify)?;
        row.as_ref().map(StoredMessage::from_row).transpose()
    }

    /// Atomically claims the oldest pending row for the agent.
    ///
    /// The claimed row transitions to `processing` with `started_at = now`.
    /// Two concurrent claimers can never receive the same row: the update
    /// re-checks `state = 'pending'`, so the loser matches zero rows.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the update fails.
    #[instrument(skip(self), fields(agent = %agent))]
    pub async fn claim(&self, agent: &AgentName) -> Result<Option<StoredMessage>, StoreError> {
        let row = sqlx::query(CLAIM_NEXT)
            .bind(agent.as_str())
            .bind(now_millis())
            .fetch_optional(self.conn.pool())
            .await
            .map_err(StoreError::classify)?;
        row.as_ref().map(StoredMessage::from_row).transpose()
    }

    /// Reads up to `limit` pending rows in FIFO order without claiming them.
    ///
    /// Used to drain batch context after a claim; the rows stay pending and
    /// are completed wholesale once the batch response is published.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the query fails.
    pub async fn drain_batch(
        &self,
        agent: &AgentName,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(DRAIN_BATCH)
            .bind(agent.as_str())
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(self.conn.pool())
            .await
            .map_err(StoreError::classify)?;
        rows.iter().map(StoredMessage::from_row).collect()
    }

    /// Marks a row completed. Applies to the claimed trigger and to pending
    /// rows subsumed by a batch response alike; completing an already
    /// completed row is a no-op.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the update fails.
    #[instrument(skip(self), fields(agent = %agent, message_id = %id))]
    pub async fn complete(&self, id: &MessageId, agent: &AgentName) -> Result<(), StoreError> {
        sqlx::query(COMPLETE_MESSAGE)
            .bind(id.as_str())
            .bind(agent.as_str())
            .bind(now_millis())
            .execute(self.conn.pool())
            .await
            .map_err(StoreError::classify)?;
        Ok(())
    }

    /// Fails a claimed row.
    ///
    /// With `requeue`, the row returns to pending with its original arrival
    /// time (head of the queue) and an incremented retry count. Without, it
    /// is completed with a failure marker so it is never silently dropped.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the update fails.
    #[instrument(skip(self), fields(agent = %agent, message_id = %id, requeue))]
    pub async fn fail(
        &self,
        id: &MessageId,
        agent: &AgentName,
        requeue: bool,
    ) -> Result<(), StoreError> {
        let query = if requeue {
            sqlx::query(REQUEUE_MESSAGE)
                .bind(id.as_str())
                .bind(agent.as_str())
        } else {
            sqlx::query(FAIL_MESSAGE)
                .bind(id.as_str())
                .bind(agent.as_str())
                .bind(now_millis())
        };
        let result = query
            .execute(self.conn.pool())
            .await
            .map_err(StoreError::classify)?;
        if result.rows_affected() == 0 {
            warn!("fail() matched no row; message may have been recovered elsewhere");
        }
        Ok(())
    }

    /// Deletes all pending rows for the agent. Tombstones are untouched.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the delete fails.
    #[instrument(skip(self), fields(agent = %agent))]
    pub async fn purge(&self, agent: &AgentName) -> Result<u64, StoreError> {
        let result = sqlx::query(PURGE_PENDING)
            .bind(agent.as_str())
            .execute(self.conn.pool())
            .await
            .map_err(StoreError::classify)?;
        let purged = result.rows_affected();
        if purged > 0 {
            info!(purged, "purged pending backlog");
        }
        Ok(purged)
    }

    /// Requeues rows stuck in `processing` for longer than `max_age`,
    /// across all agents. Run once at process start.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the update fails.
    pub async fn recover_stale(&self, max_age: Duration) -> Result<u64, StoreError> {
        let cutoff = now_millis() - i64::try_from(max_age.as_millis()).unwrap_or(i64::MAX);
        let result = sqlx::query(RECOVER_STALE)
            .bind(cutoff)
            .execute(self.conn.pool())
            .await
            .map_err(StoreError::classify)?;
        let recovered = result.rows_affected();
        if recovered > 0 {
            warn!(recovered, "requeued stale in-flight messages");
        }
        Ok(recovered)
    }

    /// Requeues one agent's stale `processing` rows. Run when that agent's
    /// runtime starts, so a row claimed by a killed runtime is not lost.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the update fails.
    pub async fn recover_stale_for(
        &self,
        agent: &AgentName,
        max_age: Duration,
    ) -> Result<u64, StoreError> {
        let cutoff = now_millis() - i64::try_from(max_age.as_millis()).unwrap_or(i64::MAX);
        let result = sqlx::query(RECOVER_STALE_FOR_AGENT)
            .bind(agent.as_str())
            .bind(cutoff)
            .execute(self.conn.pool())
            .await
            .map_err(StoreError::classify)?;
        Ok(result.rows_affected())
    }

    /// Deletes completed tombstones older than [`RETENTION_PERIOD`], at most
    /// [`SWEEP_BATCH_LIMIT`] rows per call. Returns how many were removed;
    /// callers loop while the return value equals the limit.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the delete fails.
    pub async fn sweep_completed(&self) -> Result<u64, StoreError> {
        let cutoff = now_millis() - i64::try_from(RETENTION_PERIOD.as_millis()).unwrap_or(i64::MAX);
        let result = sqlx::query(SWEEP_COMPLETED)
            .bind(cutoff)
            .bind(SWEEP_BATCH_LIMIT)
            .execute(self.conn.pool())
            .await
            .map_err(StoreError::classify)?;
        let swept = result.rows_affected();
        if swept > 0 {
            debug!(swept, "retention sweep removed tombstones");
        }
        Ok(swept)
    }

    /// Last `limit` successfully completed messages for the agent, oldest
    /// first. This is the conversation history handed to handlers; it is
    /// re-fetched on every cycle rather than cached, so it survives crashes.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the query fails.
    pub async fn history(
        &self,
        agent: &AgentName,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(SELECT_HISTORY)
            .bind(agent.as_str())
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(self.conn.pool())
            .await
            .map_err(StoreError::classify)?;
        let mut messages: Vec<StoredMessage> = rows
            .iter()
            .map(StoredMessage::from_row)
            .collect::<Result<_, _>>()?;
        messages.reverse();
        Ok(messages)
    }

    /// Queue depth and throughput figures for the agent.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the query fails.
    pub async fn stats(&self, agent: &AgentName) -> Result<BacklogStats, StoreError> {
        let day_ago = now_millis() - 24 * 60 * 60 * 1000;
        let row = sqlx::query(SELECT_STATS)
            .bind(agent.as_str())
            .bind(day_ago)
            .fetch_one(self.conn.pool())
            .await
            .map_err(StoreError::classify)?;
        Ok(BacklogStats {
            pending: row.get("pending"),
            processing: row.get("processing"),
            completed_last_24h: row.get("completed_last_24h"),
            avg_process_ms: row.get("avg_process_ms"),
        })
    }

    /// Number of rows currently in `processing` for the agent. Anything
    /// above one is an invariant violation the runtime must treat as fatal.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the query fails.
    pub async fn processing_count(&self, agent: &AgentName) -> Result<i64, StoreError> {
        sqlx::query_scalar(COUNT_PROCESSING)
            .bind(agent.as_str())
            .fetch_one(self.conn.pool())
            .await
            .map_err(StoreError::classify)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_store() -> MessageStore {
        let conn = DatabaseConnection::open_in_memory().await.unwrap();
        MessageStore::new(conn)
    }

    fn agent(name: &str) -> AgentName {
        AgentName::try_new(name.to_string()).unwrap()
    }

    fn mid(id: &str) -> MessageId {
        MessageId::try_new(id.to_string()).unwrap()
    }

    #[tokio::test]
    async fn enqueue_is_idempotent_per_agent() {
        let store = test_store().await;
        let alpha = agent("alpha");
        let id = mid("m1");

        assert_eq!(
            store.enqueue(&id, &alpha, "bob", "hi").await.unwrap(),
            EnqueueOutcome::Accepted
        );
        for _ in 0..3 {
            assert_eq!(
                store.enqueue(&id, &alpha, "bob", "hi").await.unwrap(),
                EnqueueOutcome::Duplicate
            );
        }

        // Same id for a different recipient is an independent row.
        assert_eq!(
            store.enqueue(&id, &agent("beta"), "bob", "hi").await.unwrap(),
            EnqueueOutcome::Accepted
        );
    }

    #[tokio::test]
    async fn claim_follows_arrival_order_with_id_tiebreak() {
        let store = test_store().await;
        let alpha = agent("alpha");
        for id in ["m3", "m1", "m2"] {
            store.enqueue(&mid(id), &alpha, "bob", id).await.unwrap();
        }
        // Force identical arrival stamps so the id tiebreak decides.
        sqlx::query("UPDATE messages SET arrived_at = 1000")
            .execute(store.conn.pool())
            .await
            .unwrap();

        let mut order = Vec::new();
        while let Some(m) = store.claim(&alpha).await.unwrap() {
            order.push(m.id.to_string());
            store.complete(&m.id, &alpha).await.unwrap();
        }
        assert_eq!(order, ["m1", "m2", "m3"]);
    }

    #[tokio::test]
    async fn at_most_one_processing_row_per_agent() {
        let store = test_store().await;
        let alpha = agent("alpha");
        store.enqueue(&mid("m1"), &alpha, "bob", "a").await.unwrap();
        store.enqueue(&mid("m2"), &alpha, "bob", "b").await.unwrap();

        let first = store.claim(&alpha).await.unwrap().unwrap();
        assert_eq!(first.state, MessageState::Processing);
        assert!(first.started_at.is_some());

        // While a claim is in flight, further claims are refused outright,
        // so a second mistakenly-running processor gets nothing.
        assert!(store.claim(&alpha).await.unwrap().is_none());
        assert_eq!(store.processing_count(&alpha).await.unwrap(), 1);

        store.complete(&first.id, &alpha).await.unwrap();
        let second = store.claim(&alpha).await.unwrap().unwrap();
        assert_ne!(first.id, second.id);
    }

    #[tokio::test]
    async fn drain_batch_is_peek_only() {
        let store = test_store().await;
        let alpha = agent("alpha");
        for id in ["m1", "m2", "m3"] {
            store.enqueue(&mid(id), &alpha, "bob", id).await.unwrap();
        }
        let trigger = store.claim(&alpha).await.unwrap().unwrap();
        let batch = store.drain_batch(&alpha, 9).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert!(batch.iter().all(|m| m.state == MessageState::Pending));

        // Subsumed rows complete straight from pending.
        store.complete(&trigger.id, &alpha).await.unwrap();
        for m in &batch {
            store.complete(&m.id, &alpha).await.unwrap();
        }
        let stats = store.stats(&alpha).await.unwrap();
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.processing, 0);
        assert_eq!(stats.completed_last_24h, 3);
    }

    #[tokio::test]
    async fn requeue_keeps_arrival_time_and_counts_retries() {
        let store = test_store().await;
        let alpha = agent("alpha");
        store.enqueue(&mid("m1"), &alpha, "bob", "a").await.unwrap();
        store.enqueue(&mid("m2"), &alpha, "bob", "b").await.unwrap();

        let first = store.claim(&alpha).await.unwrap().unwrap();
        assert_eq!(first.id.as_str(), "m1");
        store.fail(&first.id, &alpha, true).await.unwrap();

        // Requeued row goes back to the head of the queue.
        let again = store.claim(&alpha).await.unwrap().unwrap();
        assert_eq!(again.id.as_str(), "m1");
        assert_eq!(again.retry_count, 1);
        assert_eq!(again.arrived_at, first.arrived_at);
    }

    #[tokio::test]
    async fn fail_without_requeue_leaves_failure_tombstone() {
        let store = test_store().await;
        let alpha = agent("alpha");
        store.enqueue(&mid("m1"), &alpha, "bob", "a").await.unwrap();
        let m = store.claim(&alpha).await.unwrap().unwrap();
        store.fail(&m.id, &alpha, false).await.unwrap();

        assert!(store.claim(&alpha).await.unwrap().is_none());
        // Failure tombstones are excluded from handler history.
        assert!(store.history(&alpha, 10).await.unwrap().is_empty());
        // But they still dedup re-deliveries.
        assert_eq!(
            store.enqueue(&mid("m1"), &alpha, "bob", "a").await.unwrap(),
            EnqueueOutcome::Duplicate
        );
    }

    #[tokio::test]
    async fn recover_stale_requeues_old_claims_only() {
        let store = test_store().await;
        let alpha = agent("alpha");
        store.enqueue(&mid("m1"), &alpha, "bob", "a").await.unwrap();
        let m = store.claim(&alpha).await.unwrap().unwrap();

        // Fresh claim is untouched.
        assert_eq!(store.recover_stale(Duration::from_secs(300)).await.unwrap(), 0);

        // Age the claim past the cutoff.
        sqlx::query("UPDATE messages SET started_at = started_at - 600000")
            .execute(store.conn.pool())
            .await
            .unwrap();
        assert_eq!(store.recover_stale(Duration::from_secs(300)).await.unwrap(), 1);

        let recovered = store.claim(&alpha).await.unwrap().unwrap();
        assert_eq!(recovered.id, m.id);
    }

    #[tokio::test]
    async fn purge_deletes_pending_but_not_tombstones() {
        let store = test_store().await;
        let alpha = agent("alpha");
        store.enqueue(&mid("m1"), &alpha, "bob", "a").await.unwrap();
        let m = store.claim(&alpha).await.unwrap().unwrap();
        store.complete(&m.id, &alpha).await.unwrap();
        for id in ["m2", "m3"] {
            store.enqueue(&mid(id), &alpha, "bob", id).await.unwrap();
        }

        assert_eq!(store.purge(&alpha).await.unwrap(), 2);
        let stats = store.stats(&alpha).await.unwrap();
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.completed_last_24h, 1);
    }

    #[tokio::test]
    async fn sweep_removes_only_expired_tombstones() {
        let store = test_store().await;
        let alpha = agent("alpha");
        store.enqueue(&mid("old"), &alpha, "bob", "a").await.unwrap();
        store.enqueue(&mid("new"), &alpha, "bob", "b").await.unwrap();
        for id in ["old", "new"] {
            let m = store.claim(&alpha).await.unwrap().unwrap();
            assert_eq!(m.id.as_str(), id);
            store.complete(&m.id, &alpha).await.unwrap();
        }
        // Age one tombstone past the retention period.
        sqlx::query("UPDATE messages SET completed_at = completed_at - 8 * 24 * 3600 * 1000 WHERE id = 'old'")
            .execute(store.conn.pool())
            .await
            .unwrap();

        assert_eq!(store.sweep_completed().await.unwrap(), 1);
        assert_eq!(store.sweep_completed().await.unwrap(), 0);
        // The expired tombstone is gone, so the id can be accepted again.
        assert_eq!(
            store.enqueue(&mid("old"), &alpha, "bob", "a").await.unwrap(),
            EnqueueOutcome::Accepted
        );
    }

    #[tokio::test]
    async fn history_is_chronological_and_bounded() {
        let store = test_store().await;
        let alpha = agent("alpha");
        for i in 0..5 {
            let id = mid(&format!("m{i}"));
            store.enqueue(&id, &alpha, "bob", &format!("msg {i}")).await.unwrap();
            let m = store.claim(&alpha).await.unwrap().unwrap();
            store.complete(&m.id, &alpha).await.unwrap();
        }
        let history = store.history(&alpha, 3).await.unwrap();
        let ids: Vec<_> = history.iter().map(|m| m.id.to_string()).collect();
        assert_eq!(ids, ["m2", "m3", "m4"]);
    }
}
