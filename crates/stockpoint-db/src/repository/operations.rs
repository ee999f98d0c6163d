//! # Operation Repository
//!
//! Persistent Operation Log. Rows are only ever inserted; triggers in the
//! schema abort any UPDATE or DELETE.
//!
//! ## Row Layout
//! ```text
//! version │ id │ sku │ kind │ delta │ timestamp │ ... │ origin │ prev_hash │ record_hash
//! ────────┼────┼─────┼──────┼───────┼───────────┼─────┼────────┼───────────┼────────────
//!    1    │ .. │ ..  │refill│  +8   │ ...Z      │     │ local  │ genesis   │ 3fa1..
//!    2    │ .. │ ..  │s_out │  -2   │ ...Z      │     │ local  │ 3fa1..    │ 91c0..
//! ```
//! `version` is the log position; `prev_hash` of row N is `record_hash` of
//! row N-1.

use sqlx::{FromRow, SqliteConnection, SqlitePool};
use tracing::debug;

use stockpoint_core::chain::ChainedOperation;
use stockpoint_core::types::{Operation, OperationKind, OperationOrigin};

use super::{format_timestamp, from_db_int, parse_timestamp, to_db_int};
use crate::error::{DbError, DbResult};

const TABLE: &str = "operations";

const COLUMNS: &str = "version, id, sku, kind, delta, timestamp, actor, device_id, \
                       causality_token, voids, reason, origin, prev_hash, record_hash";

#[derive(Debug, FromRow)]
struct OperationRow {
    version: i64,
    id: String,
    sku: String,
    kind: OperationKind,
    delta: i64,
    timestamp: String,
    actor: String,
    device_id: String,
    causality_token: i64,
    voids: Option<String>,
    reason: Option<String>,
    origin: OperationOrigin,
    prev_hash: String,
    record_hash: String,
}

/// A persisted operation with its chain position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredOperation {
    pub version: u64,
    pub origin: OperationOrigin,
    pub record: ChainedOperation,
}

impl OperationRow {
    fn into_stored(self) -> DbResult<StoredOperation> {
        let operation = Operation {
            timestamp: parse_timestamp(TABLE, &self.timestamp)?,
            causality_token: from_db_int(TABLE, self.causality_token)?,
            id: self.id,
            sku: self.sku,
            kind: self.kind,
            delta: self.delta,
            actor: self.actor,
            device_id: self.device_id,
            voids: self.voids,
            reason: self.reason,
        };
        Ok(StoredOperation {
            version: from_db_int(TABLE, self.version)?,
            origin: self.origin,
            record: ChainedOperation {
                operation,
                prev_hash: self.prev_hash,
                record_hash: self.record_hash,
            },
        })
    }
}

/// Repository for the persisted Operation Log.
#[derive(Debug, Clone)]
pub struct OperationRepository {
    pool: SqlitePool,
}

impl OperationRepository {
    pub fn new(pool: SqlitePool) -> Self {
        OperationRepository { pool }
    }

    /// Appends a chained record and returns its log version.
    ///
    /// The version is assigned inside the statement so concurrent appends
    /// on one connection cannot leave gaps.
    pub async fn append(
        conn: &mut SqliteConnection,
        record: &ChainedOperation,
        origin: OperationOrigin,
    ) -> DbResult<u64> {
        let op = &record.operation;
        debug!(id = %op.id, sku = %op.sku, kind = %op.kind, origin = origin.as_str(), "Appending operation");

        let version: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO operations (
                version, id, sku, kind, delta, timestamp, actor, device_id,
                causality_token, voids, reason, origin, prev_hash, record_hash
            ) VALUES (
                (SELECT COALESCE(MAX(version), 0) + 1 FROM operations),
                ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13
            )
            RETURNING version
            "#,
        )
        .bind(&op.id)
        .bind(&op.sku)
        .bind(op.kind)
        .bind(op.delta)
        .bind(format_timestamp(&op.timestamp))
        .bind(&op.actor)
        .bind(&op.device_id)
        .bind(to_db_int(op.causality_token)?)
        .bind(&op.voids)
        .bind(&op.reason)
        .bind(origin)
        .bind(&record.prev_hash)
        .bind(&record.record_hash)
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| match DbError::from(e) {
            DbError::UniqueViolation { field, .. } => DbError::duplicate(field, op.id.clone()),
            other => other,
        })?;

        from_db_int(TABLE, version)
    }

    /// Empties the log ahead of a resync from the remote ledger.
    ///
    /// The delete guard is lifted for this statement only and recreated
    /// on the same connection, so it is back in place when the enclosing
    /// transaction commits.
    pub async fn truncate_for_resync(conn: &mut SqliteConnection) -> DbResult<u64> {
        sqlx::query("DROP TRIGGER IF EXISTS operations_no_delete")
            .execute(&mut *conn)
            .await?;
        let removed = sqlx::query("DELETE FROM operations")
            .execute(&mut *conn)
            .await?
            .rows_affected();
        sqlx::query(
            r#"
            CREATE TRIGGER operations_no_delete
            BEFORE DELETE ON operations
            BEGIN
                SELECT RAISE(ABORT, 'operations are append-only');
            END
            "#,
        )
        .execute(&mut *conn)
        .await?;

        debug!(removed, "Operation log truncated for resync");
        Ok(removed)
    }

    /// Every record in append order.
    pub async fn load_all(&self) -> DbResult<Vec<StoredOperation>> {
        let rows: Vec<OperationRow> =
            sqlx::query_as(&format!("SELECT {} FROM operations ORDER BY version ASC", COLUMNS))
                .fetch_all(&self.pool)
                .await?;

        debug!(count = rows.len(), "Loaded operation log");
        rows.into_iter().map(OperationRow::into_stored).collect()
    }

    /// Records appended after `version`.
    pub async fn since(&self, version: u64) -> DbResult<Vec<StoredOperation>> {
        let rows: Vec<OperationRow> = sqlx::query_as(&format!(
            "SELECT {} FROM operations WHERE version > ?1 ORDER BY version ASC",
            COLUMNS
        ))
        .bind(to_db_int(version)?)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(OperationRow::into_stored).collect()
    }

    pub async fn get(&self, id: &str) -> DbResult<Option<StoredOperation>> {
        let row: Option<OperationRow> =
            sqlx::query_as(&format!("SELECT {} FROM operations WHERE id = ?1", COLUMNS))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        row.map(OperationRow::into_stored).transpose()
    }

    pub async fn by_sku(&self, sku: &str) -> DbResult<Vec<StoredOperation>> {
        let rows: Vec<OperationRow> = sqlx::query_as(&format!(
            "SELECT {} FROM operations WHERE sku = ?1 ORDER BY version ASC",
            COLUMNS
        ))
        .bind(sku)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(OperationRow::into_stored).collect()
    }

    /// Current log version (number of stored operations).
    pub async fn version(&self) -> DbResult<u64> {
        let version: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(version), 0) FROM operations")
            .fetch_one(&self.pool)
            .await?;
        from_db_int(TABLE, version)
    }
}
