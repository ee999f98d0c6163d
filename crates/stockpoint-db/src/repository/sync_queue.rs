//! # Sync Queue Repository
//!
//! Durable outbox of local operations waiting for the remote ledger.
//!
//! ## State Machine
//! ```text
//!                 mark_in_flight
//!   ┌─────────┐ ───────────────► ┌───────────┐  mark_confirmed  ┌───────────┐
//!   │ pending │                  │ in_flight │ ───────────────► │ confirmed │
//!   └─────────┘ ◄─────────────── └───────────┘                  └───────────┘
//!                release /              │ mark_rejected          ┌──────────┐
//!                reset_in_flight        └──────────────────────► │ rejected │
//!                                                                └──────────┘
//! ```
//! Entries are drained strictly by `position` (the operation's log
//! version), so a device's operations leave in append order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqliteConnection, SqlitePool};
use tracing::{debug, warn};

use stockpoint_core::types::{Operation, SyncQueueEntry, SyncState};

use super::{format_timestamp, from_db_int, parse_timestamp, to_db_int};
use crate::error::DbResult;

const TABLE: &str = "sync_queue";

#[derive(Debug, FromRow)]
struct QueueRow {
    operation_id: String,
    sku: String,
    causality_token: i64,
    state: SyncState,
    attempts: i64,
    last_error: Option<String>,
    enqueued_at: String,
    attempted_at: Option<String>,
}

impl QueueRow {
    fn into_entry(self) -> DbResult<SyncQueueEntry> {
        Ok(SyncQueueEntry {
            causality_token: from_db_int(TABLE, self.causality_token)?,
            attempts: u32::try_from(self.attempts).unwrap_or(u32::MAX),
            enqueued_at: parse_timestamp(TABLE, &self.enqueued_at)?,
            attempted_at: self
                .attempted_at
                .as_deref()
                .map(|value| parse_timestamp(TABLE, value))
                .transpose()?,
            operation_id: self.operation_id,
            sku: self.sku,
            state: self.state,
            last_error: self.last_error,
        })
    }
}

/// Entry counts per state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub pending: u64,
    pub in_flight: u64,
    pub confirmed: u64,
    pub rejected: u64,
}

impl QueueCounts {
    /// Entries the remote ledger has not acknowledged yet.
    pub fn outstanding(&self) -> u64 {
        self.pending + self.in_flight
    }
}

const SELECT_ENTRY: &str = "SELECT operation_id, sku, causality_token, state, attempts, \
                            last_error, enqueued_at, attempted_at FROM sync_queue";

/// Repository for the sync queue.
#[derive(Debug, Clone)]
pub struct SyncQueueRepository {
    pool: SqlitePool,
}

impl SyncQueueRepository {
    pub fn new(pool: SqlitePool) -> Self {
        SyncQueueRepository { pool }
    }

    /// Queues a local operation at `position` (its log version).
    pub async fn enqueue(
        conn: &mut SqliteConnection,
        op: &Operation,
        position: u64,
        now: DateTime<Utc>,
    ) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_queue (
                operation_id, position, sku, causality_token, state, attempts, enqueued_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6)
            "#,
        )
        .bind(&op.id)
        .bind(to_db_int(position)?)
        .bind(&op.sku)
        .bind(to_db_int(op.causality_token)?)
        .bind(SyncState::Pending)
        .bind(format_timestamp(&now))
        .execute(&mut *conn)
        .await?;

        debug!(id = %op.id, position, "Operation queued for sync");
        Ok(())
    }

    /// Marks acknowledged operations confirmed.
    pub async fn mark_confirmed(conn: &mut SqliteConnection, ids: &[String]) -> DbResult<u64> {
        let mut updated = 0;
        for id in ids {
            updated += sqlx::query(
                "UPDATE sync_queue SET state = ?2, last_error = NULL WHERE operation_id = ?1",
            )
            .bind(id)
            .bind(SyncState::Confirmed)
            .execute(&mut *conn)
            .await?
            .rows_affected();
        }
        Ok(updated)
    }

    /// Marks an operation the remote ledger refused.
    pub async fn mark_rejected(conn: &mut SqliteConnection, id: &str, reason: Option<&str>) -> DbResult<()> {
        sqlx::query("UPDATE sync_queue SET state = ?2, last_error = ?3 WHERE operation_id = ?1")
            .bind(id)
            .bind(SyncState::Rejected)
            .bind(reason)
            .execute(&mut *conn)
            .await?;

        warn!(id = %id, reason = ?reason, "Operation rejected by remote ledger");
        Ok(())
    }

    /// Pool-side [`Self::mark_confirmed`] for acknowledgements outside a
    /// ledger transaction.
    pub async fn confirm(&self, ids: &[String]) -> DbResult<u64> {
        let mut conn = self.pool.acquire().await?;
        Self::mark_confirmed(&mut conn, ids).await
    }

    /// Pool-side [`Self::mark_rejected`].
    pub async fn reject(&self, id: &str, reason: Option<&str>) -> DbResult<()> {
        let mut conn = self.pool.acquire().await?;
        Self::mark_rejected(&mut conn, id, reason).await
    }

    /// Oldest pending entries first.
    pub async fn next_pending(&self, limit: u32) -> DbResult<Vec<SyncQueueEntry>> {
        let rows: Vec<QueueRow> = sqlx::query_as(&format!(
            "{} WHERE state = ?1 ORDER BY position ASC LIMIT ?2",
            SELECT_ENTRY
        ))
        .bind(SyncState::Pending)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(QueueRow::into_entry).collect()
    }

    /// Moves entries to `in_flight` and counts the attempt.
    pub async fn mark_in_flight(&self, ids: &[String], now: DateTime<Utc>) -> DbResult<()> {
        let mut tx = self.pool.begin().await?;
        for id in ids {
            sqlx::query(
                r#"
                UPDATE sync_queue
                SET state = ?2, attempts = attempts + 1, attempted_at = ?3
                WHERE operation_id = ?1 AND state = ?4
                "#,
            )
            .bind(id)
            .bind(SyncState::InFlight)
            .bind(format_timestamp(&now))
            .bind(SyncState::Pending)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Returns in-flight entries to `pending`, recording why.
    pub async fn release(&self, ids: &[String], error: Option<&str>) -> DbResult<()> {
        let mut tx = self.pool.begin().await?;
        for id in ids {
            sqlx::query(
                r#"
                UPDATE sync_queue SET state = ?2, last_error = COALESCE(?3, last_error)
                WHERE operation_id = ?1 AND state = ?4
                "#,
            )
            .bind(id)
            .bind(SyncState::Pending)
            .bind(error)
            .bind(SyncState::InFlight)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Startup recovery: nothing can be in flight after a restart.
    pub async fn reset_in_flight(&self) -> DbResult<u64> {
        let reset = sqlx::query("UPDATE sync_queue SET state = ?1 WHERE state = ?2")
            .bind(SyncState::Pending)
            .bind(SyncState::InFlight)
            .execute(&self.pool)
            .await?
            .rows_affected();

        if reset > 0 {
            warn!(count = reset, "Returned interrupted sync entries to pending");
        }
        Ok(reset)
    }

    /// Every entry in `state`, in drain order.
    pub async fn by_state(&self, state: SyncState) -> DbResult<Vec<SyncQueueEntry>> {
        let rows: Vec<QueueRow> = sqlx::query_as(&format!(
            "{} WHERE state = ?1 ORDER BY position ASC",
            SELECT_ENTRY
        ))
        .bind(state)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(QueueRow::into_entry).collect()
    }

    pub async fn get(&self, id: &str) -> DbResult<Option<SyncQueueEntry>> {
        let row: Option<QueueRow> =
            sqlx::query_as(&format!("{} WHERE operation_id = ?1", SELECT_ENTRY))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        row.map(QueueRow::into_entry).transpose()
    }

    /// Ids of operations not yet acknowledged (pending or in flight).
    pub async fn outstanding_ids(&self) -> DbResult<Vec<String>> {
        let ids = sqlx::query_scalar(
            "SELECT operation_id FROM sync_queue WHERE state IN (?1, ?2) ORDER BY position ASC",
        )
        .bind(SyncState::Pending)
        .bind(SyncState::InFlight)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    pub async fn counts(&self) -> DbResult<QueueCounts> {
        let rows: Vec<(SyncState, i64)> =
            sqlx::query_as("SELECT state, COUNT(*) FROM sync_queue GROUP BY state")
                .fetch_all(&self.pool)
                .await?;

        let mut counts = QueueCounts::default();
        for (state, count) in rows {
            let count = from_db_int(TABLE, count)?;
            match state {
                SyncState::Pending => counts.pending = count,
                SyncState::InFlight => counts.in_flight = count,
                SyncState::Confirmed => counts.confirmed = count,
                SyncState::Rejected => counts.rejected = count,
            }
        }
        Ok(counts)
    }

    /// Deletes settled entries: confirmed ones, and rejected ones whose
    /// compensating void is in the log. The operations themselves stay.
    pub async fn prune_settled(&self) -> DbResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM sync_queue
            WHERE state = ?1
               OR (state = ?2
                   AND operation_id IN (SELECT voids FROM operations WHERE voids IS NOT NULL))
            "#,
        )
        .bind(SyncState::Confirmed)
        .bind(SyncState::Rejected)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Drops every entry ahead of a resync.
    pub async fn clear(conn: &mut SqliteConnection) -> DbResult<u64> {
        let removed = sqlx::query("DELETE FROM sync_queue")
            .execute(&mut *conn)
            .await?
            .rows_affected();
        Ok(removed)
    }
}
