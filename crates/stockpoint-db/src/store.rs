//! # Ledger Store
//!
//! Groups repository writes into the transactions a ledger needs.
//!
//! ## Write Protocol
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  ledger.prepare(draft)  ──►  store.append_local(record)  ──►  commit   │
//! │                              ┌───────────── tx ─────────────┐          │
//! │                              │ INSERT operations            │          │
//! │                              │ INSERT sync_queue (pending)  │          │
//! │                              └──────────────────────────────┘          │
//! │                                                                         │
//! │  ledger.plan_reconcile  ──►  store.apply_reconcile(plan)  ──►  apply   │
//! │                              ┌───────────── tx ─────────────┐          │
//! │                              │ INSERT operations (remote,   │          │
//! │                              │        compensations)        │          │
//! │                              │ sync_queue confirmed/rejected│          │
//! │                              │ UPSERT conflicts             │          │
//! │                              │ ledger_meta sync point/token │          │
//! │                              └──────────────────────────────┘          │
//! │                                                                         │
//! │  replay corruption  ──►  store.reset_from_remote(plan)                 │
//! │                          one tx: clear everything, write the plan      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//! The database is written first. If the transaction fails, in-memory state
//! is untouched and the caller gets the error.

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use stockpoint_core::chain::ChainedOperation;
use stockpoint_core::ledger::{ReconcilePlan, ResolutionPlan, RestoredLedger};
use stockpoint_core::types::{OperationOrigin, ProjectionEntry};

use crate::error::{DbError, DbResult};
use crate::pool::Database;
use crate::repository::conflicts::ConflictRepository;
use crate::repository::meta::MetaRepository;
use crate::repository::operations::OperationRepository;
use crate::repository::projection::ProjectionRepository;
use crate::repository::sync_queue::SyncQueueRepository;

/// Transactional persistence for one device's ledger.
#[derive(Debug, Clone)]
pub struct LedgerStore {
    db: Database,
}

impl LedgerStore {
    pub fn new(db: Database) -> Self {
        LedgerStore { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Loads everything a ledger is restored from.
    ///
    /// Claims the database for `store_id` / `device_id` and returns any
    /// interrupted in-flight queue entries to pending.
    #[instrument(skip(self))]
    pub async fn open(&self, store_id: &str, device_id: &str) -> DbResult<RestoredLedger> {
        self.db.meta().claim_identity(store_id, device_id).await?;
        self.db.sync_queue().reset_in_flight().await?;

        let records = self
            .db
            .operations()
            .load_all()
            .await?
            .into_iter()
            .map(|stored| stored.record)
            .collect::<Vec<_>>();

        let meta = self.db.meta();
        let restored = RestoredLedger {
            cached_projection: self.db.projection().load().await?,
            sync_point: meta.sync_point().await?,
            sync_token: meta.sync_token().await?,
            conflicts: self.db.conflicts().load_all().await?,
            unconfirmed: self.db.sync_queue().outstanding_ids().await?,
            records,
        };

        info!(
            operations = restored.records.len(),
            conflicts = restored.conflicts.len(),
            unconfirmed = restored.unconfirmed.len(),
            sync_point = restored.sync_point,
            "Ledger state loaded"
        );
        Ok(restored)
    }

    /// Persists a prepared local operation and queues it for sync.
    pub async fn append_local(&self, record: &ChainedOperation, now: DateTime<Utc>) -> DbResult<u64> {
        let mut tx = self.begin().await?;

        let version = OperationRepository::append(&mut tx, record, OperationOrigin::Local).await?;
        SyncQueueRepository::enqueue(&mut tx, &record.operation, version, now).await?;

        Self::commit(tx).await?;
        Ok(version)
    }

    /// Persists a reconciliation plan in one transaction.
    #[instrument(skip_all, fields(records = plan.records.len(), conflicts = plan.conflicts.len()))]
    pub async fn apply_reconcile(&self, plan: &ReconcilePlan, now: DateTime<Utc>) -> DbResult<()> {
        let mut tx = self.begin().await?;
        Self::write_plan(&mut tx, plan, now).await?;
        Self::commit(tx).await?;
        debug!(sync_point = plan.sync_point, "Reconciliation persisted");
        Ok(())
    }

    /// Replaces the whole ledger with a plan built from the remote ledger.
    ///
    /// Log, queue, conflicts, projection cache and sync state are cleared
    /// and rewritten in one transaction; on failure the old contents stay.
    /// The store and device identity are kept.
    #[instrument(skip(self, plan), fields(records = plan.records.len()))]
    pub async fn reset_from_remote(
        &self,
        store_id: &str,
        device_id: &str,
        plan: &ReconcilePlan,
        now: DateTime<Utc>,
    ) -> DbResult<()> {
        self.db.meta().claim_identity(store_id, device_id).await?;

        let mut tx = self.begin().await?;
        SyncQueueRepository::clear(&mut tx).await?;
        ConflictRepository::clear(&mut tx).await?;
        ProjectionRepository::replace(&mut tx, &[], 0).await?;
        MetaRepository::clear_sync_state(&mut tx).await?;
        let discarded = OperationRepository::truncate_for_resync(&mut tx).await?;

        Self::write_plan(&mut tx, plan, now).await?;
        Self::commit(tx).await?;

        warn!(
            discarded,
            rebuilt = plan.records.len(),
            sync_point = plan.sync_point,
            "Ledger replaced from remote ledger"
        );
        Ok(())
    }

    async fn write_plan(
        conn: &mut sqlx::SqliteConnection,
        plan: &ReconcilePlan,
        now: DateTime<Utc>,
    ) -> DbResult<()> {
        for planned in &plan.records {
            let version = OperationRepository::append(conn, &planned.record, planned.origin).await?;
            if planned.enqueue {
                SyncQueueRepository::enqueue(conn, &planned.record.operation, version, now).await?;
            }
        }

        SyncQueueRepository::mark_confirmed(conn, &plan.confirmed).await?;
        for rejected in &plan.rejected {
            SyncQueueRepository::mark_rejected(conn, &rejected.id, rejected.reason.as_deref()).await?;
        }

        for conflict in &plan.conflicts {
            ConflictRepository::upsert(conn, conflict).await?;
        }

        MetaRepository::set_sync_state(conn, plan.sync_point, plan.sync_token.as_ref()).await
    }

    /// Persists an operator's resolution and its optional correction.
    pub async fn apply_resolution(&self, plan: &ResolutionPlan, now: DateTime<Utc>) -> DbResult<()> {
        let mut tx = self.begin().await?;

        if let Some(record) = &plan.correction {
            let version = OperationRepository::append(&mut tx, record, OperationOrigin::Local).await?;
            SyncQueueRepository::enqueue(&mut tx, &record.operation, version, now).await?;
        }
        ConflictRepository::upsert(&mut tx, &plan.conflict).await?;

        Self::commit(tx).await
    }

    /// Writes changed projection entries; the cache becomes valid for
    /// `version`.
    pub async fn save_projection(&self, entries: &[ProjectionEntry], version: u64) -> DbResult<()> {
        let mut tx = self.begin().await?;
        ProjectionRepository::save(&mut tx, entries, version).await?;
        Self::commit(tx).await
    }

    /// Replaces the cache wholesale after a replay.
    pub async fn replace_projection(&self, entries: &[ProjectionEntry], version: u64) -> DbResult<()> {
        let mut tx = self.begin().await?;
        ProjectionRepository::replace(&mut tx, entries, version).await?;
        Self::commit(tx).await
    }

    async fn begin(&self) -> DbResult<sqlx::Transaction<'static, sqlx::Sqlite>> {
        self.db
            .pool()
            .begin()
            .await
            .map_err(|e| DbError::TransactionFailed(e.to_string()))
    }

    async fn commit(tx: sqlx::Transaction<'static, sqlx::Sqlite>) -> DbResult<()> {
        tx.commit()
            .await
            .map_err(|e| DbError::TransactionFailed(e.to_string()))
    }
}
