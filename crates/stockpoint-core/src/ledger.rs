//! # Ledger
//!
//! One store location's inventory ledger: the Operation Log, the Local
//! Projection, the Event Bus, the causality clock and the sync bookkeeping.
//!
//! ## Write Paths
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  append(draft)                                                          │
//! │     ├── prepare(draft)   validate, pessimistic stock check, stamp id,   │
//! │     │                    token and chain link (log untouched)           │
//! │     └── commit(record)   log + projection + events                     │
//! │                                                                         │
//! │  reconcile(round)                                                       │
//! │     ├── plan_reconcile   rejections → compensations, merge remote,      │
//! │     │                    every record pre-checked on a scratch log      │
//! │     └── apply_reconcile  log + projection + conflicts + events          │
//! │                                                                         │
//! │  resolve_conflict(id)                                                   │
//! │     ├── prepare_resolution   optional correcting adjustment             │
//! │     └── apply_resolution     clear attention, publish                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The split lets a caller persist a prepared record or plan before the
//! in-memory state moves. Used alone, `append` / `reconcile` /
//! `resolve_conflict` do both steps.
//!
//! There is no global ledger: create one per store and pass it around.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::audit::AuditTrail;
use crate::chain::{chain_hash, verify_link, ChainedOperation};
use crate::clock::CausalityClock;
use crate::error::{CoreError, CoreResult, ValidationError};
use crate::events::{EventBus, EventSubscriber, LedgerEvent, SubscriptionId};
use crate::oplog::OperationLog;
use crate::projection::LocalProjection;
use crate::reconcile::{MergeContext, Reconciler};
use crate::types::{
    ConflictRecord, Operation, OperationDraft, OperationId, OperationKind, OperationOrigin,
    SyncToken,
};
use crate::validation::{validate_actor, validate_draft, validate_reason};

// =============================================================================
// Sync Round Types
// =============================================================================

/// A local operation the remote ledger refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedOperation {
    pub id: OperationId,
    pub reason: Option<String>,
}

/// Everything one sync cycle learned from the remote ledger.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRound {
    /// Local operations acknowledged by the remote ledger.
    pub accepted: Vec<OperationId>,
    pub rejected: Vec<RejectedOperation>,
    /// Operations fetched since the last sync token.
    pub remote: Vec<Operation>,
    /// Token returned by the fetch.
    pub token: Option<SyncToken>,
}

/// A record to append as part of a reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedRecord {
    pub record: ChainedOperation,
    pub origin: OperationOrigin,
    /// Whether the record goes to the sync queue.
    pub enqueue: bool,
}

/// Reconciliation computed against the current log, not yet applied.
#[derive(Debug, Clone)]
pub struct ReconcilePlan {
    pub records: Vec<PlannedRecord>,
    pub conflicts: Vec<ConflictRecord>,
    pub attention: BTreeSet<String>,
    /// Local operations the remote ledger acknowledged.
    pub confirmed: Vec<OperationId>,
    /// Local operations the remote ledger refused (already compensated).
    pub rejected: Vec<RejectedOperation>,
    /// Log version once the plan is applied.
    pub sync_point: u64,
    pub sync_token: Option<SyncToken>,
    pub remote_applied: usize,
    pub compensations: usize,
    /// Remote operations the log refused; each has a manual review record.
    pub quarantined: usize,
    pub duplicates_dropped: usize,
}

/// Outcome of a reconciliation, for callers and logs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileSummary {
    pub sync_point: u64,
    pub remote_applied: usize,
    pub compensations: usize,
    pub quarantined: usize,
    pub duplicates_dropped: usize,
    pub conflicts: Vec<ConflictRecord>,
    pub attention: Vec<String>,
    pub sync_token: Option<SyncToken>,
}

/// Manual resolution computed but not yet applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolutionPlan {
    pub conflict: ConflictRecord,
    pub correction: Option<ChainedOperation>,
}

// =============================================================================
// Restore Types
// =============================================================================

/// Persisted state a ledger is restored from.
#[derive(Debug, Clone, Default)]
pub struct RestoredLedger {
    /// Operation records in append order.
    pub records: Vec<ChainedOperation>,
    /// Cached projection entries and the log version they reflect.
    pub cached_projection: Option<(Vec<crate::types::ProjectionEntry>, u64)>,
    pub sync_point: u64,
    pub sync_token: Option<SyncToken>,
    /// Conflict records in detection order.
    pub conflicts: Vec<ConflictRecord>,
    /// Local operations not yet acknowledged by the remote ledger.
    pub unconfirmed: Vec<OperationId>,
}

/// How the projection was obtained on restore.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectionSource {
    Cache,
    Replayed,
}

// =============================================================================
// Ledger
// =============================================================================

/// Inventory ledger for one store location.
#[derive(Debug)]
pub struct Ledger {
    store_id: String,
    log: OperationLog,
    projection: LocalProjection,
    bus: EventBus,
    clock: CausalityClock,
    sync_point: u64,
    sync_token: Option<SyncToken>,
    conflicts: Vec<ConflictRecord>,
    unconfirmed: HashSet<OperationId>,
}

impl Ledger {
    /// Creates an empty ledger.
    pub fn new(store_id: impl Into<String>, device_id: impl Into<String>) -> Self {
        Ledger {
            store_id: store_id.into(),
            log: OperationLog::new(),
            projection: LocalProjection::new(),
            bus: EventBus::new(),
            clock: CausalityClock::new(device_id),
            sync_point: 0,
            sync_token: None,
            conflicts: Vec::new(),
            unconfirmed: HashSet::new(),
        }
    }

    /// Restores a ledger from persisted state.
    ///
    /// The chain is verified first. The cached projection is used only when
    /// its version matches the log; otherwise it is rebuilt by replay.
    pub fn restore(
        store_id: impl Into<String>,
        device_id: impl Into<String>,
        state: RestoredLedger,
    ) -> CoreResult<(Self, ProjectionSource)> {
        let device_id = device_id.into();
        let log = OperationLog::from_records(state.records)?;
        let clock = CausalityClock::resume(device_id.clone(), log.last_token(&device_id));

        let (projection, source) = match state.cached_projection {
            Some((entries, version)) if version == log.version() => {
                (LocalProjection::from_cache(entries, version), ProjectionSource::Cache)
            }
            _ => {
                let mut projection = LocalProjection::new();
                projection.rebuild(&log)?;
                (projection, ProjectionSource::Replayed)
            }
        };

        let mut ledger = Ledger {
            store_id: store_id.into(),
            sync_point: state.sync_point.min(log.version()),
            log,
            projection,
            bus: EventBus::new(),
            clock,
            sync_token: state.sync_token,
            conflicts: state.conflicts,
            unconfirmed: state.unconfirmed.into_iter().collect(),
        };

        let open: BTreeSet<String> = ledger
            .conflicts
            .iter()
            .filter(|conflict| conflict.is_open())
            .map(|conflict| conflict.sku.clone())
            .collect();
        for sku in open {
            ledger.projection.set_attention(&sku, true);
        }

        Ok((ledger, source))
    }

    // =========================================================================
    // Read Access
    // =========================================================================

    pub fn store_id(&self) -> &str {
        &self.store_id
    }

    pub fn device_id(&self) -> &str {
        self.clock.device_id()
    }

    pub fn log(&self) -> &OperationLog {
        &self.log
    }

    pub fn projection(&self) -> &LocalProjection {
        &self.projection
    }

    /// Log version at the end of the last reconciliation.
    pub fn sync_point(&self) -> u64 {
        self.sync_point
    }

    pub fn sync_token(&self) -> Option<&SyncToken> {
        self.sync_token.as_ref()
    }

    pub fn conflicts(&self) -> &[ConflictRecord] {
        &self.conflicts
    }

    pub fn open_conflicts(&self) -> impl Iterator<Item = &ConflictRecord> {
        self.conflicts.iter().filter(|conflict| conflict.is_open())
    }

    /// Quantity for `sku`, refused while the SKU needs attention.
    pub fn trusted_quantity(&self, sku: &str) -> CoreResult<i64> {
        self.projection.trusted_quantity(sku)
    }

    pub fn is_unconfirmed(&self, id: &str) -> bool {
        self.unconfirmed.contains(id)
    }

    /// Audit snapshot of the current log.
    pub fn audit(&self) -> AuditTrail {
        AuditTrail::from_log(&self.log, self.unconfirmed.iter().cloned(), &self.conflicts)
    }

    // =========================================================================
    // Events
    // =========================================================================

    pub fn subscribe(&mut self, subscriber: Arc<dyn EventSubscriber>) -> SubscriptionId {
        self.bus.subscribe(subscriber)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.bus.unsubscribe(id)
    }

    // =========================================================================
    // Append
    // =========================================================================

    /// Validates, appends and publishes a local operation.
    pub fn append(&mut self, draft: OperationDraft, timestamp: DateTime<Utc>) -> CoreResult<OperationId> {
        let record = self.prepare(draft, timestamp)?;
        self.commit(record)
    }

    /// Builds the record for a local operation without appending it.
    ///
    /// ## Pessimistic Check
    /// ```text
    /// scan_out                     → projection + delta must stay ≥ 0
    /// adjustment                   → same, unless allow_negative_correction
    /// scan_in / refill / void      → not checked
    /// ```
    pub fn prepare(&mut self, draft: OperationDraft, timestamp: DateTime<Utc>) -> CoreResult<ChainedOperation> {
        validate_draft(&draft)?;

        let (sku, delta) = match (draft.kind, draft.voids.as_deref()) {
            (OperationKind::Void, Some(target_id)) => {
                let target = self
                    .log
                    .get(target_id)
                    .ok_or_else(|| ValidationError::UnknownTarget(target_id.to_string()))?;
                (target.sku.clone(), -target.delta)
            }
            _ => (draft.sku.clone(), draft.delta),
        };

        let checked = match draft.kind {
            OperationKind::ScanOut => true,
            OperationKind::Adjustment => !draft.allow_negative_correction,
            _ => false,
        };
        if checked {
            let available = self.projection.quantity(&sku);
            if available + delta < 0 {
                return Err(ValidationError::WouldGoNegative {
                    sku,
                    available,
                    delta,
                }
                .into());
            }
        }

        let operation = Operation {
            id: Uuid::new_v4().to_string(),
            sku,
            kind: draft.kind,
            delta,
            timestamp: timestamp.trunc_subsecs(6),
            actor: draft.actor,
            device_id: self.clock.device_id().to_string(),
            causality_token: self.clock.current() + 1,
            voids: draft.voids,
            reason: draft.reason,
        };
        self.log.check(&operation, OperationOrigin::Local)?;
        self.clock.tick();

        let prev_hash = self.log.head_hash().to_string();
        let record_hash = chain_hash(&prev_hash, &operation);
        Ok(ChainedOperation {
            operation,
            prev_hash,
            record_hash,
        })
    }

    /// Appends a prepared local record.
    pub fn commit(&mut self, record: ChainedOperation) -> CoreResult<OperationId> {
        verify_link(self.log.head_hash(), &record)?;
        let id = record.operation.id.clone();
        self.insert(record.operation, OperationOrigin::Local)?;
        self.unconfirmed.insert(id.clone());
        Ok(id)
    }

    fn insert(&mut self, operation: Operation, origin: OperationOrigin) -> CoreResult<()> {
        let link = self.log.insert(operation.clone(), origin)?;
        self.clock
            .observe(&operation.device_id, operation.causality_token);
        let entry = self.projection.apply(&operation).clone();

        self.bus.publish(&LedgerEvent::OperationAppended {
            operation,
            version: link.version,
        });
        self.bus.publish(&LedgerEvent::ProjectionChanged { entry });
        Ok(())
    }

    // =========================================================================
    // Reconcile
    // =========================================================================

    /// Applies one sync round: rejections, then the merge.
    pub fn reconcile(&mut self, round: SyncRound, now: DateTime<Utc>) -> CoreResult<ReconcileSummary> {
        let plan = self.plan_reconcile(round, now)?;
        self.apply_reconcile(plan)
    }

    /// Computes a reconciliation without touching the ledger.
    ///
    /// Every record is appended to a scratch copy of the log, so a plan that
    /// comes back `Ok` applies cleanly.
    pub fn plan_reconcile(&self, round: SyncRound, now: DateTime<Utc>) -> CoreResult<ReconcilePlan> {
        let now = now.trunc_subsecs(6);
        let mut scratch = self.log.clone();
        let mut clock = self.clock.clone();
        let mut records = Vec::new();
        let mut conflicts = Vec::new();

        for rejected in &round.rejected {
            let op = scratch
                .get(&rejected.id)
                .cloned()
                .ok_or_else(|| CoreError::OperationNotFound(rejected.id.clone()))?;
            let current = scratch
                .quantities_at(scratch.version())
                .get(&op.sku)
                .copied()
                .unwrap_or(0);
            let rejection = Reconciler::compensate_rejected(
                &op,
                current,
                scratch.voided_by(&op.id).is_some(),
                rejected.reason.clone(),
                now,
                &mut clock,
            );
            if let Some(void) = rejection.void {
                records.push(Self::plan_insert(&mut scratch, void, OperationOrigin::Local, false)?);
            }
            conflicts.push(rejection.record);
        }

        let screening = Reconciler::screen(&scratch, round.remote);

        // A refused operation and its void cancel out; neither takes part in
        // the merge.
        let outcome = {
            let refused: HashSet<&str> = round.rejected.iter().map(|r| r.id.as_str()).collect();
            let ctx = MergeContext::new(&scratch, self.sync_point, now);
            let local_pending: Vec<Operation> = ctx
                .local_pending()
                .iter()
                .filter(|op| {
                    !refused.contains(op.id.as_str())
                        && !op.voids.as_deref().is_some_and(|target| refused.contains(target))
                })
                .cloned()
                .collect();
            Reconciler::merge(&ctx, &local_pending, screening.admitted, &mut clock)
        };

        let remote_applied = outcome.remote.len();
        let compensations = outcome.compensations.len();
        for op in outcome.remote {
            records.push(Self::plan_insert(&mut scratch, op, OperationOrigin::Remote, false)?);
        }
        for op in outcome.compensations {
            records.push(Self::plan_insert(&mut scratch, op, OperationOrigin::Local, true)?);
        }
        conflicts.extend(outcome.conflicts);

        let mut attention = outcome.attention;
        let quarantined = screening.quarantined.len();
        if quarantined > 0 {
            let quantities = scratch.quantities_at(scratch.version());
            for held in &screening.quarantined {
                let sku = &held.operation.sku;
                let current = quantities.get(sku).copied().unwrap_or(0);
                let record = Reconciler::quarantine_record(held, current, now);
                // Refetching the same batch must not reopen a settled record.
                if self.conflicts.iter().any(|known| known.id == record.id) {
                    continue;
                }
                attention.insert(sku.clone());
                conflicts.push(record);
            }
        }

        Ok(ReconcilePlan {
            records,
            conflicts,
            attention,
            confirmed: round.accepted,
            rejected: round.rejected,
            sync_point: scratch.version(),
            sync_token: round.token.or_else(|| self.sync_token.clone()),
            remote_applied,
            compensations,
            quarantined,
            duplicates_dropped: outcome.duplicates_dropped,
        })
    }

    fn plan_insert(
        scratch: &mut OperationLog,
        operation: Operation,
        origin: OperationOrigin,
        enqueue: bool,
    ) -> CoreResult<PlannedRecord> {
        let link = scratch.insert(operation.clone(), origin)?;
        Ok(PlannedRecord {
            record: ChainedOperation {
                operation,
                prev_hash: link.prev_hash,
                record_hash: link.record_hash,
            },
            origin,
            enqueue,
        })
    }

    /// Applies a plan produced by [`Ledger::plan_reconcile`] on this ledger.
    pub fn apply_reconcile(&mut self, plan: ReconcilePlan) -> CoreResult<ReconcileSummary> {
        for planned in plan.records {
            verify_link(self.log.head_hash(), &planned.record)?;
            let id = planned.record.operation.id.clone();
            self.insert(planned.record.operation, planned.origin)?;
            if planned.enqueue {
                self.unconfirmed.insert(id);
            }
        }

        for id in &plan.confirmed {
            self.unconfirmed.remove(id);
        }
        for rejected in &plan.rejected {
            self.unconfirmed.remove(&rejected.id);
        }

        for conflict in &plan.conflicts {
            self.upsert_conflict(conflict.clone());
            self.bus.publish(&LedgerEvent::ConflictDetected {
                conflict: conflict.clone(),
            });
        }

        for sku in &plan.attention {
            self.projection.set_attention(sku, true);
            if let Some(entry) = self.projection.get(sku) {
                self.bus.publish(&LedgerEvent::ProjectionChanged {
                    entry: entry.clone(),
                });
            }
        }

        self.sync_point = self.log.version();
        self.sync_token = plan.sync_token.clone();

        self.bus.publish(&LedgerEvent::Reconciled {
            sync_point: self.sync_point,
            remote_applied: plan.remote_applied as u32,
            compensations: plan.compensations as u32,
            conflicts: plan.conflicts.len() as u32,
            token: self.sync_token.clone(),
        });

        Ok(ReconcileSummary {
            sync_point: self.sync_point,
            remote_applied: plan.remote_applied,
            compensations: plan.compensations,
            quarantined: plan.quarantined,
            duplicates_dropped: plan.duplicates_dropped,
            conflicts: plan.conflicts,
            attention: plan.attention.into_iter().collect(),
            sync_token: self.sync_token.clone(),
        })
    }

    fn upsert_conflict(&mut self, conflict: ConflictRecord) {
        match self.conflicts.iter_mut().find(|existing| existing.id == conflict.id) {
            Some(existing) => *existing = conflict,
            None => self.conflicts.push(conflict),
        }
    }

    // =========================================================================
    // Manual Resolution
    // =========================================================================

    /// Settles a manual review, optionally appending a correcting
    /// adjustment.
    pub fn resolve_conflict(
        &mut self,
        conflict_id: &str,
        correction: Option<i64>,
        actor: &str,
        note: Option<String>,
        now: DateTime<Utc>,
    ) -> CoreResult<ConflictRecord> {
        let plan = self.prepare_resolution(conflict_id, correction, actor, note, now)?;
        self.apply_resolution(plan)
    }

    /// Builds the resolution; the clock advances if a correction is needed.
    pub fn prepare_resolution(
        &mut self,
        conflict_id: &str,
        correction: Option<i64>,
        actor: &str,
        note: Option<String>,
        now: DateTime<Utc>,
    ) -> CoreResult<ResolutionPlan> {
        let mut conflict = self
            .conflicts
            .iter()
            .find(|conflict| conflict.id == conflict_id)
            .cloned()
            .ok_or_else(|| CoreError::ConflictNotFound(conflict_id.to_string()))?;

        if !conflict.is_open() {
            return Err(ValidationError::InvalidFormat {
                field: "conflict".to_string(),
                reason: format!("{} is not awaiting manual review", conflict_id),
            }
            .into());
        }
        validate_actor(actor)?;
        validate_reason(note.as_deref())?;

        let correction = match correction {
            Some(delta) => {
                let reason = note
                    .clone()
                    .unwrap_or_else(|| format!("resolves conflict {}", conflict_id));
                let draft = OperationDraft::adjustment(conflict.sku.clone(), delta, actor)
                    .allow_negative()
                    .with_reason(reason);
                Some(self.prepare(draft, now)?)
            }
            None => None,
        };

        let now = now.trunc_subsecs(6);
        conflict.resolved_at = Some(now);
        conflict.resolved_by = Some(actor.to_string());
        conflict.note = note.or(conflict.note);
        if let Some(record) = &correction {
            conflict.compensations.push(record.operation.id.clone());
        }

        Ok(ResolutionPlan {
            conflict,
            correction,
        })
    }

    pub fn apply_resolution(&mut self, plan: ResolutionPlan) -> CoreResult<ConflictRecord> {
        if let Some(record) = plan.correction {
            self.commit(record)?;
        }

        let sku = plan.conflict.sku.clone();
        self.upsert_conflict(plan.conflict.clone());

        if !self.open_conflicts().any(|conflict| conflict.sku == sku) {
            self.projection.set_attention(&sku, false);
            if let Some(entry) = self.projection.get(&sku) {
                self.bus.publish(&LedgerEvent::ProjectionChanged {
                    entry: entry.clone(),
                });
            }
        }

        self.bus.publish(&LedgerEvent::ConflictResolved {
            conflict: plan.conflict.clone(),
        });
        Ok(plan.conflict)
    }

    // =========================================================================
    // Recovery
    // =========================================================================

    /// Discards the projection and replays the whole log.
    pub fn rebuild_projection(&mut self) -> CoreResult<()> {
        self.projection.rebuild(&self.log)?;
        self.bus.publish(&LedgerEvent::ProjectionRebuilt {
            version: self.projection.version(),
        });
        Ok(())
    }

    /// Per-SKU quantities at an earlier log version.
    pub fn quantities_at(&self, version: u64) -> std::collections::BTreeMap<String, i64> {
        self.log.quantities_at(version)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ConflictResolution, ProjectionEntry};
    use chrono::{Duration, TimeZone};
    use std::sync::Mutex;

    fn at(minute: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap() + Duration::minutes(minute)
    }

    fn remote_op(device: &str, token: u64, kind: OperationKind, delta: i64, minute: i64) -> Operation {
        Operation {
            id: Uuid::new_v4().to_string(),
            sku: "COKE-330".into(),
            kind,
            delta,
            timestamp: at(minute),
            actor: format!("promoter-{}", device),
            device_id: device.into(),
            causality_token: token,
            voids: None,
            reason: None,
        }
    }

    /// Ledger with 8 units synced as the opening stock.
    fn synced_ledger() -> Ledger {
        let mut ledger = Ledger::new("store-1", "device-a");
        let id = ledger
            .append(OperationDraft::refill("COKE-330", 8, "promoter-a"), at(0))
            .unwrap();
        ledger
            .reconcile(
                SyncRound {
                    accepted: vec![id],
                    token: Some(SyncToken::new("1")),
                    ..SyncRound::default()
                },
                at(1),
            )
            .unwrap();
        ledger
    }

    #[test]
    fn test_append_updates_projection_and_publishes() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let mut ledger = Ledger::new("store-1", "device-a");
        let sink = Arc::clone(&events);
        ledger.subscribe(Arc::new(move |event: &LedgerEvent| {
            sink.lock().unwrap().push(event.name());
        }));

        let id = ledger
            .append(OperationDraft::refill("COKE-330", 8, "promoter-a"), at(0))
            .unwrap();

        assert_eq!(ledger.projection().quantity("COKE-330"), 8);
        assert_eq!(ledger.log().get(&id).unwrap().causality_token, 1);
        assert!(ledger.is_unconfirmed(&id));
        assert_eq!(
            *events.lock().unwrap(),
            vec!["operation_appended", "projection_changed"]
        );
    }

    #[test]
    fn test_pessimistic_check() {
        let mut ledger = synced_ledger();

        let err = ledger
            .append(OperationDraft::scan_out("COKE-330", 10, "promoter-a"), at(2))
            .unwrap_err();
        assert_eq!(
            err,
            CoreError::Validation(ValidationError::WouldGoNegative {
                sku: "COKE-330".into(),
                available: 8,
                delta: -10,
            })
        );

        assert!(ledger
            .append(OperationDraft::adjustment("COKE-330", -9, "promoter-a"), at(2))
            .is_err());
        assert!(ledger
            .append(
                OperationDraft::adjustment("COKE-330", -9, "promoter-a").allow_negative(),
                at(2)
            )
            .is_ok());
        assert_eq!(ledger.projection().quantity("COKE-330"), -1);
        assert!(ledger.projection().get("COKE-330").unwrap().needs_attention);

        // Rejected drafts do not consume causality tokens.
        assert_eq!(ledger.log().last_token("device-a"), 2);
    }

    #[test]
    fn test_void_is_exempt_and_filled_from_target() {
        let mut ledger = synced_ledger();
        let out = ledger
            .append(OperationDraft::scan_out("COKE-330", 8, "promoter-a"), at(2))
            .unwrap();
        let refill = ledger.log().operations()[0].id.clone();

        // Voiding the opening refill leaves -8; voids are not stock-checked.
        let void = ledger
            .append(OperationDraft::void(refill.clone(), "promoter-a"), at(3))
            .unwrap();
        let void_op = ledger.log().get(&void).unwrap();
        assert_eq!(void_op.delta, -8);
        assert_eq!(void_op.sku, "COKE-330");
        assert_eq!(ledger.projection().quantity("COKE-330"), -8);

        let again = ledger.append(OperationDraft::void(refill, "promoter-a"), at(4));
        assert!(matches!(
            again,
            Err(CoreError::Validation(ValidationError::AlreadyVoided { .. }))
        ));
        assert!(ledger.log().contains(&out));
    }

    #[test]
    fn test_end_to_end_offline_merge() {
        let mut ledger = synced_ledger();
        assert_eq!(ledger.sync_point(), 1);

        ledger
            .append(OperationDraft::scan_out("COKE-330", 2, "promoter-a"), at(10))
            .unwrap();
        assert_eq!(ledger.projection().quantity("COKE-330"), 6);
        ledger
            .append(OperationDraft::refill("COKE-330", 10, "promoter-a"), at(20))
            .unwrap();
        assert_eq!(ledger.projection().quantity("COKE-330"), 16);

        let remote = remote_op("device-b", 1, OperationKind::Refill, 5, 15);
        let summary = ledger
            .reconcile(
                SyncRound {
                    remote: vec![remote.clone()],
                    token: Some(SyncToken::new("4")),
                    ..SyncRound::default()
                },
                at(30),
            )
            .unwrap();

        assert_eq!(ledger.projection().quantity("COKE-330"), 21);
        assert_eq!(summary.remote_applied, 1);
        assert_eq!(summary.conflicts.len(), 1);
        assert_eq!(summary.conflicts[0].resolution, ConflictResolution::Merged);
        assert_eq!(ledger.sync_point(), 4);
        assert_eq!(ledger.sync_token(), Some(&SyncToken::new("4")));

        // Re-delivering the same remote operation changes nothing.
        let again = ledger
            .reconcile(
                SyncRound {
                    remote: vec![remote],
                    ..SyncRound::default()
                },
                at(31),
            )
            .unwrap();
        assert_eq!(again.duplicates_dropped, 1);
        assert_eq!(again.remote_applied, 0);
        assert_eq!(ledger.projection().quantity("COKE-330"), 21);
        assert_eq!(ledger.sync_token(), Some(&SyncToken::new("4")));
    }

    #[test]
    fn test_manual_review_and_resolution() {
        let mut ledger = synced_ledger();
        ledger
            .append(OperationDraft::scan_out("COKE-330", 6, "promoter-a"), at(10))
            .unwrap();

        let remote = remote_op("device-b", 1, OperationKind::ScanOut, -3, 11);
        let summary = ledger
            .reconcile(
                SyncRound {
                    remote: vec![remote],
                    ..SyncRound::default()
                },
                at(20),
            )
            .unwrap();

        assert_eq!(summary.attention, vec!["COKE-330".to_string()]);
        assert_eq!(ledger.projection().quantity("COKE-330"), -1);
        assert!(matches!(
            ledger.trusted_quantity("COKE-330"),
            Err(CoreError::ConflictUnresolved { .. })
        ));
        let conflict_id = ledger.open_conflicts().next().unwrap().id.clone();

        let resolved = ledger
            .resolve_conflict(
                &conflict_id,
                Some(1),
                "supervisor-1",
                Some("recounted shelf".into()),
                at(30),
            )
            .unwrap();
        assert_eq!(resolved.resolved_by.as_deref(), Some("supervisor-1"));
        assert_eq!(resolved.compensations.len(), 1);
        assert_eq!(ledger.trusted_quantity("COKE-330").unwrap(), 0);
        assert_eq!(ledger.open_conflicts().count(), 0);

        assert!(ledger
            .resolve_conflict(&conflict_id, None, "supervisor-1", None, at(31))
            .is_err());
        assert!(matches!(
            ledger.resolve_conflict("missing", None, "supervisor-1", None, at(31)),
            Err(CoreError::ConflictNotFound(_))
        ));
    }

    #[test]
    fn test_rejection_is_compensated_not_retried() {
        let mut ledger = synced_ledger();
        let out = ledger
            .append(OperationDraft::scan_out("COKE-330", 3, "promoter-a"), at(10))
            .unwrap();

        let summary = ledger
            .reconcile(
                SyncRound {
                    rejected: vec![RejectedOperation {
                        id: out.clone(),
                        reason: Some("shelf closed".into()),
                    }],
                    ..SyncRound::default()
                },
                at(20),
            )
            .unwrap();

        assert_eq!(ledger.projection().quantity("COKE-330"), 8);
        assert_eq!(summary.conflicts[0].resolution, ConflictResolution::Compensated);
        assert!(!ledger.is_unconfirmed(&out));
        let void_id = ledger.log().voided_by(&out).unwrap().clone();
        // The compensation stays local.
        assert!(!ledger.is_unconfirmed(&void_id));
    }

    #[test]
    fn test_refused_pair_does_not_trigger_review() {
        let mut ledger = Ledger::new("store-1", "device-a");
        let refill = ledger
            .append(OperationDraft::refill("DISCONTINUED-1", 4, "promoter-a"), at(0))
            .unwrap();
        let out = ledger
            .append(OperationDraft::scan_out("DISCONTINUED-1", 1, "promoter-a"), at(1))
            .unwrap();

        let refused = |id: &OperationId| RejectedOperation {
            id: id.clone(),
            reason: None,
        };
        let summary = ledger
            .reconcile(
                SyncRound {
                    rejected: vec![refused(&refill), refused(&out)],
                    ..SyncRound::default()
                },
                at(5),
            )
            .unwrap();

        assert_eq!(summary.conflicts.len(), 2);
        assert!(summary
            .conflicts
            .iter()
            .all(|c| c.resolution == ConflictResolution::Compensated));
        assert!(summary.attention.is_empty());
        assert_eq!(ledger.trusted_quantity("DISCONTINUED-1").unwrap(), 0);
    }

    #[test]
    fn test_token_regression_is_held_for_review() {
        let mut ledger = synced_ledger();
        ledger
            .reconcile(
                SyncRound {
                    remote: vec![remote_op("device-b", 5, OperationKind::Refill, 2, 5)],
                    token: Some(SyncToken::new("2")),
                    ..SyncRound::default()
                },
                at(6),
            )
            .unwrap();

        let regressed = remote_op("device-b", 1, OperationKind::ScanOut, -1, 7);
        let refill = Operation {
            sku: "PEPSI-500".into(),
            ..remote_op("device-c", 1, OperationKind::Refill, 4, 8)
        };
        let round = SyncRound {
            remote: vec![regressed.clone(), refill],
            token: Some(SyncToken::new("4")),
            ..SyncRound::default()
        };

        let summary = ledger.reconcile(round.clone(), at(10)).unwrap();
        assert_eq!(summary.remote_applied, 1);
        assert_eq!(summary.quarantined, 1);
        assert_eq!(summary.sync_token, Some(SyncToken::new("4")));
        assert_eq!(ledger.projection().quantity("PEPSI-500"), 4);
        assert_eq!(ledger.projection().quantity("COKE-330"), 10);
        assert!(!ledger.log().contains(&regressed.id));

        let held = summary.conflicts[0].clone();
        assert_eq!(held.resolution, ConflictResolution::ManualReview);
        assert_eq!(held.remote_operations, vec![regressed.id.clone()]);
        assert_eq!(held.merged_quantity, 10);
        assert!(ledger.trusted_quantity("COKE-330").is_err());

        ledger
            .resolve_conflict(&held.id, None, "supervisor-1", None, at(11))
            .unwrap();

        // Refetching the batch does not reopen the settled record.
        let again = ledger.reconcile(round, at(12)).unwrap();
        assert_eq!(again.quarantined, 1);
        assert!(again.conflicts.is_empty());
        assert_eq!(ledger.trusted_quantity("COKE-330").unwrap(), 10);
        assert_eq!(ledger.conflicts().len(), 1);
    }

    #[test]
    fn test_restore_uses_cache_or_replays() {
        let mut ledger = Ledger::new("store-1", "device-a");
        let mut records = Vec::new();
        for quantity in [8, 4] {
            let record = ledger
                .prepare(OperationDraft::refill("COKE-330", quantity, "promoter-a"), at(0))
                .unwrap();
            records.push(record.clone());
            ledger.commit(record).unwrap();
        }

        let cached = ledger.projection().snapshot();
        let (restored, source) = Ledger::restore(
            "store-1",
            "device-a",
            RestoredLedger {
                records: records.clone(),
                cached_projection: Some((cached, 2)),
                ..RestoredLedger::default()
            },
        )
        .unwrap();
        assert_eq!(source, ProjectionSource::Cache);
        assert_eq!(restored.projection().quantity("COKE-330"), 12);

        let mut stale = ProjectionEntry::empty("COKE-330");
        stale.quantity = 8;
        stale.version = 1;
        let (mut restored, source) = Ledger::restore(
            "store-1",
            "device-a",
            RestoredLedger {
                records,
                cached_projection: Some((vec![stale], 1)),
                ..RestoredLedger::default()
            },
        )
        .unwrap();
        assert_eq!(source, ProjectionSource::Replayed);
        assert_eq!(restored.projection().quantity("COKE-330"), 12);

        // Tokens continue after the restored log.
        let id = restored
            .append(OperationDraft::refill("COKE-330", 1, "promoter-a"), at(5))
            .unwrap();
        assert_eq!(restored.log().get(&id).unwrap().causality_token, 3);
    }

    #[test]
    fn test_audit_hides_unconfirmed() {
        let mut ledger = synced_ledger();
        ledger
            .append(OperationDraft::scan_out("COKE-330", 1, "promoter-a"), at(5))
            .unwrap();

        let audit = ledger.audit();
        assert_eq!(audit.query(&crate::audit::AuditQuery::all()).count(), 1);
        assert_eq!(
            audit
                .query(&crate::audit::AuditQuery::all().with_provisional())
                .count(),
            2
        );
    }
}
