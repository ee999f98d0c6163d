//! # Ledger Runtime
//!
//! One task owns a store's [`Ledger`] and is the only writer of it. Every
//! caller talks to it through a cloneable [`LedgerHandle`].
//!
//! ## Mailbox
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  UI / scanner ──┐                                                       │
//! │  SyncAgent ─────┼──► mpsc::Sender<LedgerCommand> ──► LedgerTask         │
//! │  audit viewer ──┘         (LedgerHandle)              │                 │
//! │                                                       │ owns            │
//! │                                                       ▼                 │
//! │                                   Ledger (log, projection, bus, clock)  │
//! │                                                       │                 │
//! │                                                       ▼                 │
//! │                                   LedgerStore (one transaction / write) │
//! │                                                                         │
//! │  Each command carries a oneshot reply. Writes hit the database first,  │
//! │  then memory, then the projection cache.                               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Event subscribers run on the ledger task, in publish order.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use stockpoint_core::audit::AuditTrail;
use stockpoint_core::events::{EventSubscriber, LedgerEvent, SubscriptionId};
use stockpoint_core::ledger::{Ledger, ProjectionSource, ReconcileSummary, RejectedOperation, SyncRound};
use stockpoint_core::scan::{DecodedScan, ScanDirection};
use stockpoint_core::types::{
    ConflictRecord, ConflictResolution, Operation, OperationDraft, ProjectionEntry, SyncState,
    SyncToken,
};
use stockpoint_core::CoreError;
use stockpoint_db::LedgerStore;

use crate::error::{SyncError, SyncResult};
use crate::remote::RemoteLedger;

/// Commands queued before callers wait on a full mailbox.
const MAILBOX_CAPACITY: usize = 64;

// =============================================================================
// Commands
// =============================================================================

type Reply<T> = oneshot::Sender<T>;

enum LedgerCommand {
    Append {
        draft: OperationDraft,
        timestamp: DateTime<Utc>,
        reply: Reply<SyncResult<Operation>>,
    },
    Reconcile {
        round: SyncRound,
        reply: Reply<SyncResult<ReconcileSummary>>,
    },
    Resolve {
        conflict_id: String,
        correction: Option<i64>,
        actor: String,
        note: Option<String>,
        reply: Reply<SyncResult<ConflictRecord>>,
    },
    Projection {
        reply: Reply<Vec<ProjectionEntry>>,
    },
    Entry {
        sku: String,
        reply: Reply<Option<ProjectionEntry>>,
    },
    TrustedQuantity {
        sku: String,
        reply: Reply<SyncResult<i64>>,
    },
    Audit {
        reply: Reply<AuditTrail>,
    },
    Conflicts {
        open_only: bool,
        reply: Reply<Vec<ConflictRecord>>,
    },
    Cursor {
        reply: Reply<SyncCursor>,
    },
    Subscribe {
        subscriber: Arc<dyn EventSubscriber>,
        reply: Reply<SubscriptionId>,
    },
    Unsubscribe {
        id: SubscriptionId,
        reply: Reply<bool>,
    },
    Rebuild {
        reply: Reply<SyncResult<u64>>,
    },
    Shutdown {
        reply: Reply<()>,
    },
}

/// Where the ledger stands relative to the remote ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncCursor {
    /// Token to fetch with next.
    pub token: Option<SyncToken>,
    /// Log version at the last reconciliation.
    pub sync_point: u64,
    /// Current log version.
    pub version: u64,
}

// =============================================================================
// Ledger Handle
// =============================================================================

/// Cloneable handle to a running ledger task.
#[derive(Debug, Clone)]
pub struct LedgerHandle {
    tx: mpsc::Sender<LedgerCommand>,
    store_id: Arc<str>,
    device_id: Arc<str>,
}

impl std::fmt::Debug for LedgerCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LedgerCommand::Append { .. } => "Append",
            LedgerCommand::Reconcile { .. } => "Reconcile",
            LedgerCommand::Resolve { .. } => "Resolve",
            LedgerCommand::Projection { .. } => "Projection",
            LedgerCommand::Entry { .. } => "Entry",
            LedgerCommand::TrustedQuantity { .. } => "TrustedQuantity",
            LedgerCommand::Audit { .. } => "Audit",
            LedgerCommand::Conflicts { .. } => "Conflicts",
            LedgerCommand::Cursor { .. } => "Cursor",
            LedgerCommand::Subscribe { .. } => "Subscribe",
            LedgerCommand::Unsubscribe { .. } => "Unsubscribe",
            LedgerCommand::Rebuild { .. } => "Rebuild",
            LedgerCommand::Shutdown { .. } => "Shutdown",
        };
        f.write_str(name)
    }
}

impl LedgerHandle {
    /// Restores the ledger from `store` and starts its task.
    ///
    /// A projection that had to be replayed is written back to the cache.
    pub async fn spawn(
        store: LedgerStore,
        store_id: impl Into<String>,
        device_id: impl Into<String>,
    ) -> SyncResult<Self> {
        let store_id = store_id.into();
        let device_id = device_id.into();

        let restored = store.open(&store_id, &device_id).await?;
        let (ledger, source) = Ledger::restore(store_id.clone(), device_id.clone(), restored)?;

        if source == ProjectionSource::Replayed {
            info!(version = ledger.log().version(), "Projection replayed from the log");
            Self::write_back_projection(&store, &ledger).await;
        }

        Ok(Self::start(ledger, store, store_id, device_id))
    }

    /// Rebuilds the ledger from the remote ledger and starts its task.
    ///
    /// Used when the local log fails its replay checks. Everything the
    /// remote ledger holds since the beginning is fetched and reconciled
    /// into an empty ledger; the store is then replaced in one transaction.
    /// Local operations the remote ledger never acknowledged are lost.
    pub async fn resync_from_remote(
        store: LedgerStore,
        store_id: impl Into<String>,
        device_id: impl Into<String>,
        remote: &dyn RemoteLedger,
    ) -> SyncResult<Self> {
        let store_id = store_id.into();
        let device_id = device_id.into();

        let batch = remote.fetch_since(None).await?;
        let fetched = batch.operations.len();

        let mut ledger = Ledger::new(store_id.clone(), device_id.clone());
        let now = Utc::now();
        let plan = ledger.plan_reconcile(
            SyncRound {
                remote: batch.operations,
                token: batch.new_token,
                ..SyncRound::default()
            },
            now,
        )?;
        store.reset_from_remote(&store_id, &device_id, &plan, now).await?;
        let summary = ledger.apply_reconcile(plan)?;
        Self::write_back_projection(&store, &ledger).await;

        warn!(
            fetched,
            applied = summary.remote_applied,
            quarantined = summary.quarantined,
            version = ledger.log().version(),
            "Ledger resynced from remote ledger"
        );
        Ok(Self::start(ledger, store, store_id, device_id))
    }

    fn start(ledger: Ledger, store: LedgerStore, store_id: String, device_id: String) -> Self {
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        let task = LedgerTask { ledger, store, rx };
        tokio::spawn(task.run());

        info!(store_id = %store_id, device_id = %device_id, "Ledger started");
        LedgerHandle {
            tx,
            store_id: store_id.into(),
            device_id: device_id.into(),
        }
    }

    async fn write_back_projection(store: &LedgerStore, ledger: &Ledger) {
        if let Err(e) = store
            .replace_projection(&ledger.projection().snapshot(), ledger.log().version())
            .await
        {
            warn!(error = %e, "Could not refresh projection cache");
        }
    }

    pub fn store_id(&self) -> &str {
        &self.store_id
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    async fn request<T>(&self, command: impl FnOnce(Reply<T>) -> LedgerCommand) -> SyncResult<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(command(reply))
            .await
            .map_err(|_| SyncError::ShuttingDown)?;
        rx.await
            .map_err(|_| SyncError::ChannelError("ledger task dropped the reply".into()))
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Validates, persists and applies a local operation stamped now.
    pub async fn append(&self, draft: OperationDraft) -> SyncResult<Operation> {
        self.append_at(draft, Utc::now()).await
    }

    /// Same as [`Self::append`] with an explicit device timestamp.
    pub async fn append_at(&self, draft: OperationDraft, timestamp: DateTime<Utc>) -> SyncResult<Operation> {
        self.request(|reply| LedgerCommand::Append {
            draft,
            timestamp,
            reply,
        })
        .await?
    }

    /// Records a decoded barcode scan at the time it was scanned.
    pub async fn record_scan(
        &self,
        scan: DecodedScan,
        direction: ScanDirection,
        quantity: i64,
        actor: impl Into<String>,
    ) -> SyncResult<Operation> {
        let timestamp = scan.timestamp;
        self.append_at(scan.into_draft(direction, quantity, actor), timestamp)
            .await
    }

    /// Applies a sync round.
    ///
    /// Acknowledgements and refusals already persisted by an earlier drain
    /// but not yet reconciled are folded into the round.
    pub async fn reconcile(&self, round: SyncRound) -> SyncResult<ReconcileSummary> {
        self.request(|reply| LedgerCommand::Reconcile { round, reply })
            .await?
    }

    /// Settles a manual review, optionally appending a correcting adjustment.
    pub async fn resolve_conflict(
        &self,
        conflict_id: impl Into<String>,
        correction: Option<i64>,
        actor: impl Into<String>,
        note: Option<String>,
    ) -> SyncResult<ConflictRecord> {
        let conflict_id = conflict_id.into();
        let actor = actor.into();
        self.request(|reply| LedgerCommand::Resolve {
            conflict_id,
            correction,
            actor,
            note,
            reply,
        })
        .await?
    }

    /// Discards the projection, replays the log and rewrites the cache.
    pub async fn rebuild_projection(&self) -> SyncResult<u64> {
        self.request(|reply| LedgerCommand::Rebuild { reply }).await?
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub async fn projection(&self) -> SyncResult<Vec<ProjectionEntry>> {
        self.request(|reply| LedgerCommand::Projection { reply }).await
    }

    pub async fn entry(&self, sku: impl Into<String>) -> SyncResult<Option<ProjectionEntry>> {
        let sku = sku.into();
        self.request(|reply| LedgerCommand::Entry { sku, reply }).await
    }

    /// Projected quantity, or 0 for an unknown SKU.
    pub async fn quantity(&self, sku: impl Into<String>) -> SyncResult<i64> {
        Ok(self.entry(sku).await?.map_or(0, |entry| entry.quantity))
    }

    /// Quantity the operator may rely on; fails while the SKU is in review.
    pub async fn trusted_quantity(&self, sku: impl Into<String>) -> SyncResult<i64> {
        let sku = sku.into();
        self.request(|reply| LedgerCommand::TrustedQuantity { sku, reply })
            .await?
    }

    /// Snapshot of the audit trail; query it off the ledger task.
    pub async fn audit(&self) -> SyncResult<AuditTrail> {
        self.request(|reply| LedgerCommand::Audit { reply }).await
    }

    pub async fn conflicts(&self) -> SyncResult<Vec<ConflictRecord>> {
        self.request(|reply| LedgerCommand::Conflicts {
            open_only: false,
            reply,
        })
        .await
    }

    pub async fn open_conflicts(&self) -> SyncResult<Vec<ConflictRecord>> {
        self.request(|reply| LedgerCommand::Conflicts {
            open_only: true,
            reply,
        })
        .await
    }

    pub async fn cursor(&self) -> SyncResult<SyncCursor> {
        self.request(|reply| LedgerCommand::Cursor { reply }).await
    }

    // =========================================================================
    // Events
    // =========================================================================

    pub async fn subscribe(&self, subscriber: Arc<dyn EventSubscriber>) -> SyncResult<SubscriptionId> {
        self.request(|reply| LedgerCommand::Subscribe { subscriber, reply })
            .await
    }

    /// Subscribes a channel instead of a callback, for consumers that live on
    /// other tasks. Dropping the receiver does not unsubscribe; events are
    /// discarded until [`Self::unsubscribe`] is called.
    pub async fn subscribe_channel(
        &self,
    ) -> SyncResult<(SubscriptionId, mpsc::UnboundedReceiver<LedgerEvent>)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self
            .subscribe(Arc::new(move |event: &LedgerEvent| {
                let _ = tx.send(event.clone());
            }))
            .await?;
        Ok((id, rx))
    }

    pub async fn unsubscribe(&self, id: SubscriptionId) -> SyncResult<bool> {
        self.request(|reply| LedgerCommand::Unsubscribe { id, reply })
            .await
    }

    /// Stops the task after the commands already queued.
    pub async fn shutdown(&self) -> SyncResult<()> {
        self.request(|reply| LedgerCommand::Shutdown { reply }).await
    }
}

// =============================================================================
// Ledger Task
// =============================================================================

struct LedgerTask {
    ledger: Ledger,
    store: LedgerStore,
    rx: mpsc::Receiver<LedgerCommand>,
}

impl LedgerTask {
    async fn run(mut self) {
        debug!(store_id = %self.ledger.store_id(), "Ledger task running");

        while let Some(command) = self.rx.recv().await {
            match command {
                LedgerCommand::Append {
                    draft,
                    timestamp,
                    reply,
                } => {
                    let _ = reply.send(self.append(draft, timestamp).await);
                }
                LedgerCommand::Reconcile { round, reply } => {
                    let _ = reply.send(self.reconcile(round).await);
                }
                LedgerCommand::Resolve {
                    conflict_id,
                    correction,
                    actor,
                    note,
                    reply,
                } => {
                    let _ = reply.send(self.resolve(&conflict_id, correction, &actor, note).await);
                }
                LedgerCommand::Projection { reply } => {
                    let _ = reply.send(self.ledger.projection().snapshot());
                }
                LedgerCommand::Entry { sku, reply } => {
                    let _ = reply.send(self.ledger.projection().get(&sku).cloned());
                }
                LedgerCommand::TrustedQuantity { sku, reply } => {
                    let _ = reply.send(self.ledger.trusted_quantity(&sku).map_err(SyncError::from));
                }
                LedgerCommand::Audit { reply } => {
                    let _ = reply.send(self.ledger.audit());
                }
                LedgerCommand::Conflicts { open_only, reply } => {
                    let conflicts = if open_only {
                        self.ledger.open_conflicts().cloned().collect()
                    } else {
                        self.ledger.conflicts().to_vec()
                    };
                    let _ = reply.send(conflicts);
                }
                LedgerCommand::Cursor { reply } => {
                    let _ = reply.send(SyncCursor {
                        token: self.ledger.sync_token().cloned(),
                        sync_point: self.ledger.sync_point(),
                        version: self.ledger.log().version(),
                    });
                }
                LedgerCommand::Subscribe { subscriber, reply } => {
                    let _ = reply.send(self.ledger.subscribe(subscriber));
                }
                LedgerCommand::Unsubscribe { id, reply } => {
                    let _ = reply.send(self.ledger.unsubscribe(id));
                }
                LedgerCommand::Rebuild { reply } => {
                    let _ = reply.send(self.rebuild().await);
                }
                LedgerCommand::Shutdown { reply } => {
                    let _ = reply.send(());
                    break;
                }
            }
        }

        info!(store_id = %self.ledger.store_id(), "Ledger task stopped");
    }

    async fn append(&mut self, draft: OperationDraft, timestamp: DateTime<Utc>) -> SyncResult<Operation> {
        let record = self.ledger.prepare(draft, timestamp)?;
        let version = self.store.append_local(&record, Utc::now()).await?;

        let operation = record.operation.clone();
        self.ledger.commit(record).map_err(|e| self.diverged(e))?;
        self.save_projection(BTreeSet::from([operation.sku.clone()])).await;

        debug!(
            operation_id = %operation.id,
            sku = %operation.sku,
            kind = %operation.kind,
            delta = operation.delta,
            version,
            "Operation appended"
        );
        Ok(operation)
    }

    async fn reconcile(&mut self, mut round: SyncRound) -> SyncResult<ReconcileSummary> {
        self.recover_settlements(&mut round).await?;

        let now = Utc::now();
        let plan = self.ledger.plan_reconcile(round, now)?;
        let touched: BTreeSet<String> = plan
            .records
            .iter()
            .map(|planned| planned.record.operation.sku.clone())
            .chain(plan.attention.iter().cloned())
            .collect();

        self.store.apply_reconcile(&plan, now).await?;
        let summary = self.ledger.apply_reconcile(plan).map_err(|e| self.diverged(e))?;
        self.save_projection(touched).await;

        for conflict in &summary.conflicts {
            if conflict.resolution == ConflictResolution::ManualReview {
                warn!(
                    conflict_id = %conflict.id,
                    sku = %conflict.sku,
                    base = conflict.base_quantity,
                    merged = conflict.merged_quantity,
                    "Conflict needs manual review"
                );
            }
        }
        info!(
            sync_point = summary.sync_point,
            remote_applied = summary.remote_applied,
            compensations = summary.compensations,
            quarantined = summary.quarantined,
            duplicates = summary.duplicates_dropped,
            conflicts = summary.conflicts.len(),
            "Reconciled"
        );
        Ok(summary)
    }

    /// Folds acknowledgements the queue recorded but the ledger has not
    /// reconciled yet into `round`, e.g. after a fetch failed or a restart.
    async fn recover_settlements(&self, round: &mut SyncRound) -> SyncResult<()> {
        let queue = self.store.database().sync_queue();

        for entry in queue.by_state(SyncState::Confirmed).await? {
            if self.ledger.is_unconfirmed(&entry.operation_id)
                && !round.accepted.contains(&entry.operation_id)
            {
                round.accepted.push(entry.operation_id);
            }
        }

        for entry in queue.by_state(SyncState::Rejected).await? {
            let compensated = self.ledger.log().voided_by(&entry.operation_id).is_some();
            let reported = round.rejected.iter().any(|r| r.id == entry.operation_id);
            if !compensated && !reported {
                debug!(operation_id = %entry.operation_id, "Recovering unreconciled rejection");
                round.rejected.push(RejectedOperation {
                    id: entry.operation_id,
                    reason: entry.last_error,
                });
            }
        }
        Ok(())
    }

    async fn resolve(
        &mut self,
        conflict_id: &str,
        correction: Option<i64>,
        actor: &str,
        note: Option<String>,
    ) -> SyncResult<ConflictRecord> {
        let now = Utc::now();
        let plan = self
            .ledger
            .prepare_resolution(conflict_id, correction, actor, note, now)?;
        self.store.apply_resolution(&plan, now).await?;

        let sku = plan.conflict.sku.clone();
        let record = self.ledger.apply_resolution(plan).map_err(|e| self.diverged(e))?;
        self.save_projection(BTreeSet::from([sku.clone()])).await;

        info!(conflict_id = %conflict_id, sku = %sku, actor = %actor, ?correction, "Conflict resolved");
        Ok(record)
    }

    async fn rebuild(&mut self) -> SyncResult<u64> {
        self.ledger.rebuild_projection()?;
        let version = self.ledger.log().version();
        self.store
            .replace_projection(&self.ledger.projection().snapshot(), version)
            .await?;
        info!(version, "Projection rebuilt");
        Ok(version)
    }

    /// Writes the entries for `skus` and stamps the cache with the log
    /// version. A failure only costs a replay on the next start.
    async fn save_projection(&self, skus: BTreeSet<String>) {
        let projection = self.ledger.projection();
        let entries: Vec<ProjectionEntry> = skus
            .iter()
            .filter_map(|sku| projection.get(sku).cloned())
            .collect();

        if let Err(e) = self
            .store
            .save_projection(&entries, self.ledger.log().version())
            .await
        {
            warn!(error = %e, "Projection cache not saved; it will be replayed on restart");
        }
    }

    /// The store accepted a write the in-memory ledger then refused.
    fn diverged(&self, err: CoreError) -> SyncError {
        error!(
            store_id = %self.ledger.store_id(),
            error = %err,
            "In-memory ledger diverged from its store; restart to replay"
        );
        SyncError::Core(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::SubsecRound;
    use std::sync::Mutex;
    use stockpoint_core::ValidationError;
    use stockpoint_db::{Database, DbConfig};

    async fn store() -> LedgerStore {
        LedgerStore::new(Database::new(DbConfig::in_memory()).await.unwrap())
    }

    #[tokio::test]
    async fn test_appends_survive_restart() {
        let store = store().await;
        let ledger = LedgerHandle::spawn(store.clone(), "store-1", "device-a").await.unwrap();

        ledger
            .append(OperationDraft::refill("COKE-330", 8, "promoter-1"))
            .await
            .unwrap();
        let out = ledger
            .append(OperationDraft::scan_out("COKE-330", 2, "promoter-1"))
            .await
            .unwrap();
        assert_eq!(out.causality_token, 2);
        assert_eq!(ledger.quantity("COKE-330").await.unwrap(), 6);
        ledger.shutdown().await.unwrap();

        let reopened = LedgerHandle::spawn(store, "store-1", "device-a").await.unwrap();
        assert_eq!(reopened.quantity("COKE-330").await.unwrap(), 6);
        assert_eq!(reopened.cursor().await.unwrap().version, 2);

        let next = reopened
            .append(OperationDraft::scan_in("COKE-330", 1, "promoter-1"))
            .await
            .unwrap();
        assert_eq!(next.causality_token, 3);
    }

    #[tokio::test]
    async fn test_refused_append_is_not_persisted() {
        let store = store().await;
        let ledger = LedgerHandle::spawn(store.clone(), "store-1", "device-a").await.unwrap();
        ledger
            .append(OperationDraft::refill("COKE-330", 3, "promoter-1"))
            .await
            .unwrap();

        let err = ledger
            .append(OperationDraft::scan_out("COKE-330", 5, "promoter-1"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SyncError::Core(CoreError::Validation(ValidationError::WouldGoNegative { available: 3, .. }))
        ));

        assert_eq!(store.database().operations().version().await.unwrap(), 1);
        assert_eq!(store.database().sync_queue().counts().await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn test_subscribers_see_events() {
        let store = store().await;
        let ledger = LedgerHandle::spawn(store, "store-1", "device-a").await.unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let id = ledger
            .subscribe(Arc::new(move |event: &LedgerEvent| {
                sink.lock().unwrap().push(event.name());
            }))
            .await
            .unwrap();

        ledger
            .append(OperationDraft::refill("COKE-330", 8, "promoter-1"))
            .await
            .unwrap();
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["operation_appended", "projection_changed"]
        );

        assert!(ledger.unsubscribe(id).await.unwrap());
        ledger
            .append(OperationDraft::refill("COKE-330", 1, "promoter-1"))
            .await
            .unwrap();
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_channel_subscription() {
        let store = store().await;
        let ledger = LedgerHandle::spawn(store, "store-1", "device-a").await.unwrap();
        let (id, mut events) = ledger.subscribe_channel().await.unwrap();

        ledger
            .append(OperationDraft::refill("COKE-330", 8, "promoter-1"))
            .await
            .unwrap();

        match events.recv().await.unwrap() {
            LedgerEvent::OperationAppended { operation, version } => {
                assert_eq!(operation.delta, 8);
                assert_eq!(version, 1);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        match events.recv().await.unwrap() {
            LedgerEvent::ProjectionChanged { entry } => assert_eq!(entry.quantity, 8),
            other => panic!("unexpected event: {:?}", other),
        }

        ledger.unsubscribe(id).await.unwrap();
        ledger.rebuild_projection().await.unwrap();
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_scan_uses_scan_time() {
        let store = store().await;
        let ledger = LedgerHandle::spawn(store, "store-1", "device-a").await.unwrap();
        ledger
            .append(OperationDraft::refill("COKE-330", 4, "promoter-1"))
            .await
            .unwrap();

        let scanned_at = Utc::now() - chrono::Duration::minutes(5);
        let op = ledger
            .record_scan(
                DecodedScan::new("COKE-330\n", scanned_at),
                ScanDirection::Out,
                1,
                "promoter-1",
            )
            .await
            .unwrap();

        assert_eq!(op.delta, -1);
        assert_eq!(op.timestamp, scanned_at.trunc_subsecs(6));
        assert_eq!(ledger.quantity("COKE-330").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_reconcile_recovers_persisted_rejection() {
        let store = store().await;
        let ledger = LedgerHandle::spawn(store.clone(), "store-1", "device-a").await.unwrap();
        let refill = ledger
            .append(OperationDraft::refill("COKE-330", 8, "promoter-1"))
            .await
            .unwrap();

        // A drain recorded the refusal, then the fetch never happened.
        store
            .database()
            .sync_queue()
            .reject(&refill.id, Some("shelf closed"))
            .await
            .unwrap();

        let summary = ledger.reconcile(SyncRound::default()).await.unwrap();
        assert_eq!(summary.conflicts.len(), 1);
        assert_eq!(summary.conflicts[0].resolution, ConflictResolution::Compensated);
        assert_eq!(ledger.quantity("COKE-330").await.unwrap(), 0);

        // Once compensated it is not picked up again.
        let again = ledger.reconcile(SyncRound::default()).await.unwrap();
        assert!(again.conflicts.is_empty());
    }

    #[tokio::test]
    async fn test_corrupted_log_is_resynced_from_remote() {
        use crate::remote::MemoryRemoteLedger;

        let store = store().await;
        let remote = MemoryRemoteLedger::new();
        let ledger = LedgerHandle::spawn(store.clone(), "store-1", "device-a").await.unwrap();
        let refill = ledger
            .append(OperationDraft::refill("COKE-330", 8, "promoter-1"))
            .await
            .unwrap();
        let out = ledger
            .append(OperationDraft::scan_out("COKE-330", 2, "promoter-1"))
            .await
            .unwrap();
        remote.push(&[refill, out], None).await.unwrap();
        ledger
            .append(OperationDraft::scan_out("COKE-330", 1, "promoter-1"))
            .await
            .unwrap();
        ledger.shutdown().await.unwrap();

        // Rewrite a delta behind the hash chain's back.
        let pool = store.database().pool();
        sqlx::query("DROP TRIGGER operations_no_update")
            .execute(pool)
            .await
            .unwrap();
        sqlx::query("UPDATE operations SET delta = -7 WHERE version = 2")
            .execute(pool)
            .await
            .unwrap();

        let err = LedgerHandle::spawn(store.clone(), "store-1", "device-a")
            .await
            .unwrap_err();
        assert!(err.is_replay_corruption());

        let ledger = LedgerHandle::resync_from_remote(store.clone(), "store-1", "device-a", &remote)
            .await
            .unwrap();
        assert_eq!(ledger.quantity("COKE-330").await.unwrap(), 6);
        let cursor = ledger.cursor().await.unwrap();
        assert_eq!(cursor.version, 2);
        assert_eq!(cursor.sync_point, 2);
        assert!(cursor.token.is_some());
        // The unacknowledged scan went with the corrupted log.
        let counts = store.database().sync_queue().counts().await.unwrap();
        assert_eq!(counts.outstanding(), 0);

        let next = ledger
            .append(OperationDraft::scan_in("COKE-330", 1, "promoter-1"))
            .await
            .unwrap();
        assert_eq!(next.causality_token, 3);
        ledger.shutdown().await.unwrap();

        let reopened = LedgerHandle::spawn(store, "store-1", "device-a").await.unwrap();
        assert_eq!(reopened.quantity("COKE-330").await.unwrap(), 7);
        assert_eq!(reopened.cursor().await.unwrap().version, 3);
    }
}
