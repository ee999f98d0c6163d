//! # Reconciler
//!
//! Deterministic merge of this device's pending operations with the
//! operations other devices pushed to the remote ledger since the last sync
//! point.
//!
//! ## Algorithm
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  remote since token ──► drop ids already known (idempotent resync)      │
//! │                               │                                          │
//! │                               ▼                                          │
//! │             partition local + remote by SKU (BTreeMap)                  │
//! │                               │                                          │
//! │                               ▼  per SKU, from base = qty at sync point │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │ 1. duplicate voids: first in causal order wins                  │   │
//! │  │      superseded local  → compensating void   (compensated)      │   │
//! │  │      superseded remote → cannot fix locally  (manual_review)    │   │
//! │  │ 2. all scan_in / refill     → sum, no record                    │   │
//! │  │ 3. local→remote, remote→local or causal order dips below zero   │   │
//! │  │                             → keep all, needs_attention         │   │
//! │  │                               (manual_review)                   │   │
//! │  │ 4. otherwise causal order   → (merged)                          │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                               │                                          │
//! │                               ▼                                          │
//! │        MergeOutcome { remote in append order, compensations,            │
//! │                       conflicts, quantities, attention }                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Before the merge, [`Reconciler::screen`] holds back remote operations the
//! log would refuse; each becomes a `manual_review` record instead of
//! blocking the round.
//!
//! Causal order is `(timestamp, device_id, causality_token, id)`. Conflict
//! and compensation ids are UUID v5 values derived from operation ids, so
//! any device fed the same inputs derives the same outcome. Nothing here
//! performs I/O and nothing is ever dropped from the log.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::clock::CausalityClock;
use crate::oplog::OperationLog;
use crate::types::{
    ConflictRecord, ConflictResolution, Operation, OperationId, OperationKind, OperationOrigin,
};

const STOCKPOINT_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_2a4e_93b7_4d58_a0e2_5c7d_1b9f_3e64);

/// Id of the void compensating `superseded`.
pub fn compensation_id(superseded: &str) -> OperationId {
    Uuid::new_v5(&STOCKPOINT_NAMESPACE, format!("void:{}", superseded).as_bytes()).to_string()
}

/// Conflict id derived from the participating operation ids.
pub fn conflict_id<'a>(operation_ids: impl IntoIterator<Item = &'a str>) -> String {
    let mut ids: Vec<&str> = operation_ids.into_iter().collect();
    ids.sort_unstable();
    ids.dedup();
    Uuid::new_v5(&STOCKPOINT_NAMESPACE, ids.join(",").as_bytes()).to_string()
}

/// Total order shared by merge and audit.
pub fn by_causal_key(a: &Operation, b: &Operation) -> Ordering {
    a.causal_key().cmp(&b.causal_key())
}

// =============================================================================
// Inputs & Outputs
// =============================================================================

/// What the Reconciler knows about the local log.
#[derive(Debug, Clone, Copy)]
pub struct MergeContext<'a> {
    pub log: &'a OperationLog,
    /// Log version at the end of the last reconciliation.
    pub sync_point: u64,
    /// Timestamp stamped on compensations and records.
    pub reconciled_at: DateTime<Utc>,
}

impl<'a> MergeContext<'a> {
    pub fn new(log: &'a OperationLog, sync_point: u64, reconciled_at: DateTime<Utc>) -> Self {
        MergeContext {
            log,
            sync_point,
            reconciled_at,
        }
    }

    /// Operations appended locally since the sync point.
    pub fn local_pending(&self) -> &'a [Operation] {
        self.log.since(self.sync_point)
    }
}

/// Result of a merge. Applying it appends `remote` then `compensations`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    /// New remote operations, ordered so every append passes log checks.
    pub remote: Vec<Operation>,
    /// Local voids cancelling superseded local voids.
    pub compensations: Vec<Operation>,
    pub conflicts: Vec<ConflictRecord>,
    /// Quantity per touched SKU after the merge.
    pub quantities: BTreeMap<String, i64>,
    /// Merged order per touched SKU (compensations follow their target).
    pub merged_log: BTreeMap<String, Vec<OperationId>>,
    /// SKUs that now need attention.
    pub attention: BTreeSet<String>,
    /// Remote operations dropped because their id was already known.
    pub duplicates_dropped: usize,
}

impl MergeOutcome {
    pub fn has_manual_review(&self) -> bool {
        self.conflicts
            .iter()
            .any(|record| record.resolution == ConflictResolution::ManualReview)
    }
}

/// A fetched remote operation the log refused to take.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Quarantined {
    pub operation: Operation,
    pub reason: String,
}

/// Remote operations split into those the log accepts and those it refuses.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Screening {
    /// Operations for the merge, including ids already known.
    pub admitted: Vec<Operation>,
    pub quarantined: Vec<Quarantined>,
}

/// Answer to a remote rejection of a local operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    /// Absent when the operation was already cancelled.
    pub void: Option<Operation>,
    pub record: ConflictRecord,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Local,
    Remote,
}

#[derive(Debug, Default)]
struct SkuPartition<'a> {
    local: Vec<&'a Operation>,
    remote: Vec<&'a Operation>,
}

struct Settlement {
    record: Option<ConflictRecord>,
    compensations: Vec<Operation>,
    quantity: i64,
    merged: Vec<OperationId>,
    attention: bool,
}

// =============================================================================
// Reconciler
// =============================================================================

/// Stateless merge policy.
pub struct Reconciler;

impl Reconciler {
    /// Merges `local_pending` with operations fetched from the remote
    /// ledger.
    ///
    /// `clock` issues causality tokens for compensations.
    pub fn merge(
        ctx: &MergeContext<'_>,
        local_pending: &[Operation],
        remote: Vec<Operation>,
        clock: &mut CausalityClock,
    ) -> MergeOutcome {
        let local_ids: HashSet<&str> = local_pending.iter().map(|op| op.id.as_str()).collect();

        let received = remote.len();
        let mut seen = HashSet::new();
        let mut fresh: Vec<Operation> = remote
            .into_iter()
            .filter(|op| {
                !ctx.log.contains(&op.id)
                    && !local_ids.contains(op.id.as_str())
                    && seen.insert(op.id.clone())
            })
            .collect();
        fresh.sort_by(by_causal_key);

        let mut outcome = MergeOutcome {
            duplicates_dropped: received - fresh.len(),
            ..MergeOutcome::default()
        };

        let mut partitions: BTreeMap<&str, SkuPartition<'_>> = BTreeMap::new();
        for op in local_pending {
            partitions.entry(op.sku.as_str()).or_default().local.push(op);
        }
        for op in &fresh {
            partitions.entry(op.sku.as_str()).or_default().remote.push(op);
        }

        let base = ctx.log.quantities_at(ctx.sync_point);
        for (sku, mut partition) in partitions {
            partition.local.sort_by(|a, b| by_causal_key(a, b));
            let base_quantity = base.get(sku).copied().unwrap_or(0);
            let settlement = Self::settle(ctx, sku, base_quantity, &partition, clock);

            if settlement.attention {
                outcome.attention.insert(sku.to_string());
            }
            outcome.quantities.insert(sku.to_string(), settlement.quantity);
            outcome.merged_log.insert(sku.to_string(), settlement.merged);
            outcome.compensations.extend(settlement.compensations);
            outcome.conflicts.extend(settlement.record);
        }

        outcome.remote = append_order(ctx.log, fresh);
        outcome
    }

    fn settle(
        ctx: &MergeContext<'_>,
        sku: &str,
        base: i64,
        partition: &SkuPartition<'_>,
        clock: &mut CausalityClock,
    ) -> Settlement {
        let (superseded_local, superseded_remote) = Self::superseded_voids(ctx, partition);

        let compensations: Vec<Operation> = superseded_local
            .iter()
            .filter(|void| {
                ctx.log.voided_by(&void.id).is_none()
                    && !partition
                        .remote
                        .iter()
                        .any(|op| op.voids.as_deref() == Some(void.id.as_str()))
            })
            .map(|void| Operation {
                id: compensation_id(&void.id),
                sku: void.sku.clone(),
                kind: OperationKind::Void,
                delta: -void.delta,
                timestamp: ctx.reconciled_at,
                actor: void.actor.clone(),
                device_id: clock.device_id().to_string(),
                causality_token: clock.tick(),
                voids: Some(void.id.clone()),
                reason: Some(format!(
                    "duplicate void of {}",
                    void.voids.as_deref().unwrap_or_default()
                )),
            })
            .collect();

        let mut causal: Vec<&Operation> = partition
            .local
            .iter()
            .chain(partition.remote.iter())
            .copied()
            .collect();
        causal.sort_by(|a, b| by_causal_key(a, b));
        let merged = with_compensations(&causal, &compensations);

        // A compensated void and its compensation cancel out; neither takes
        // part in the ordering checks.
        let compensated: HashSet<&str> = compensations
            .iter()
            .filter_map(|comp| comp.voids.as_deref())
            .collect();

        let two_sided = !partition.local.is_empty() && !partition.remote.is_empty();
        let mut lowest = lowest_running(base, &without(causal.iter().copied(), &compensated));
        if two_sided {
            let local_then_remote = without(
                partition.local.iter().chain(partition.remote.iter()).copied(),
                &compensated,
            );
            let remote_then_local = without(
                partition.remote.iter().chain(partition.local.iter()).copied(),
                &compensated,
            );
            lowest = lowest
                .min(lowest_running(base, &local_then_remote))
                .min(lowest_running(base, &remote_then_local));
        }

        let quantity = base + merged.iter().map(|op| op.delta).sum::<i64>();
        let goes_negative = lowest < 0 && lowest < base;
        let all_additive = causal.iter().all(|op| op.kind.is_additive());

        let (resolution, note) = if !superseded_remote.is_empty() {
            let ids: Vec<&str> = superseded_remote.iter().map(|op| op.id.as_str()).collect();
            (
                Some(ConflictResolution::ManualReview),
                Some(format!("duplicate remote void(s) {}", ids.join(", "))),
            )
        } else if goes_negative {
            (
                Some(ConflictResolution::ManualReview),
                Some(format!(
                    "quantity reaches {} from base {} under concurrent orderings",
                    lowest, base
                )),
            )
        } else if !compensations.is_empty() {
            (Some(ConflictResolution::Compensated), None)
        } else if two_sided && !all_additive {
            (Some(ConflictResolution::Merged), None)
        } else {
            (None, None)
        };

        let record = resolution.map(|resolution| ConflictRecord {
            id: conflict_id(causal.iter().map(|op| op.id.as_str())),
            sku: sku.to_string(),
            local_operations: partition.local.iter().map(|op| op.id.clone()).collect(),
            remote_operations: partition.remote.iter().map(|op| op.id.clone()).collect(),
            resolution,
            base_quantity: base,
            merged_quantity: quantity,
            compensations: compensations.iter().map(|op| op.id.clone()).collect(),
            detected_at: ctx.reconciled_at,
            resolved_at: None,
            resolved_by: None,
            note,
        });

        Settlement {
            attention: resolution == Some(ConflictResolution::ManualReview),
            record,
            quantity,
            merged: merged.iter().map(|op| op.id.clone()).collect(),
            compensations,
        }
    }

    /// Splits duplicate voids into superseded local and remote ones.
    ///
    /// A target voided before the sync point supersedes every new void of
    /// it; otherwise the first void in causal order wins.
    fn superseded_voids<'a>(
        ctx: &MergeContext<'_>,
        partition: &SkuPartition<'a>,
    ) -> (Vec<&'a Operation>, Vec<&'a Operation>) {
        let mut by_target: BTreeMap<&str, Vec<(&'a Operation, Side)>> = BTreeMap::new();
        let sides = partition
            .local
            .iter()
            .map(|op| (*op, Side::Local))
            .chain(partition.remote.iter().map(|op| (*op, Side::Remote)));
        for (op, side) in sides {
            if let Some(target) = op.voids.as_deref() {
                by_target.entry(target).or_default().push((op, side));
            }
        }

        let mut superseded_local = Vec::new();
        let mut superseded_remote = Vec::new();
        for (target, mut voids) in by_target {
            voids.sort_by(|a, b| by_causal_key(a.0, b.0));

            let settled_before = ctx
                .log
                .voided_by(target)
                .map_or(false, |voider| partition.local.iter().all(|op| &op.id != voider));
            let winners = if settled_before { 0 } else { 1 };

            for (op, side) in voids.into_iter().skip(winners) {
                match side {
                    Side::Local => superseded_local.push(op),
                    Side::Remote => superseded_remote.push(op),
                }
            }
        }

        (superseded_local, superseded_remote)
    }

    /// Trial-appends new remote operations to a copy of `log`.
    ///
    /// An operation the log refuses (a token regression from a reinstalled
    /// device, a void of an unknown target, a malformed record) is held back
    /// so the rest of the round still applies. Voids of a held-back
    /// operation are held back with it.
    pub fn screen(log: &OperationLog, remote: Vec<Operation>) -> Screening {
        let mut seen = HashSet::new();
        let (known, fresh): (Vec<Operation>, Vec<Operation>) = remote
            .into_iter()
            .partition(|op| log.contains(&op.id) || !seen.insert(op.id.clone()));

        let mut trial = log.clone();
        let mut screening = Screening::default();
        for op in append_order(log, fresh) {
            match trial.insert(op.clone(), OperationOrigin::Remote) {
                Ok(_) => screening.admitted.push(op),
                Err(err) => screening.quarantined.push(Quarantined {
                    reason: err.to_string(),
                    operation: op,
                }),
            }
        }
        screening.admitted.extend(known);
        screening
    }

    /// Manual review record for a quarantined remote operation.
    pub fn quarantine_record(
        held: &Quarantined,
        current_quantity: i64,
        detected_at: DateTime<Utc>,
    ) -> ConflictRecord {
        let op = &held.operation;
        ConflictRecord {
            id: conflict_id([format!("quarantined:{}", op.id).as_str()]),
            sku: op.sku.clone(),
            local_operations: Vec::new(),
            remote_operations: vec![op.id.clone()],
            resolution: ConflictResolution::ManualReview,
            base_quantity: current_quantity,
            merged_quantity: current_quantity,
            compensations: Vec::new(),
            detected_at,
            resolved_at: None,
            resolved_by: None,
            note: Some(format!(
                "remote operation from {} not applied: {}",
                op.device_id, held.reason
            )),
        }
    }

    /// Compensates a local operation the remote ledger refused.
    pub fn compensate_rejected(
        op: &Operation,
        current_quantity: i64,
        already_voided: bool,
        note: Option<String>,
        rejected_at: DateTime<Utc>,
        clock: &mut CausalityClock,
    ) -> Rejection {
        let void = (!already_voided).then(|| Operation {
            id: compensation_id(&op.id),
            sku: op.sku.clone(),
            kind: OperationKind::Void,
            delta: -op.delta,
            timestamp: rejected_at,
            actor: op.actor.clone(),
            device_id: clock.device_id().to_string(),
            causality_token: clock.tick(),
            voids: Some(op.id.clone()),
            reason: Some("rejected by remote ledger".to_string()),
        });

        let merged_quantity = current_quantity + void.as_ref().map_or(0, |void| void.delta);
        let record = ConflictRecord {
            id: conflict_id([format!("rejected:{}", op.id).as_str()]),
            sku: op.sku.clone(),
            local_operations: vec![op.id.clone()],
            remote_operations: Vec::new(),
            resolution: ConflictResolution::Compensated,
            base_quantity: current_quantity,
            merged_quantity,
            compensations: void.iter().map(|void| void.id.clone()).collect(),
            detected_at: rejected_at,
            resolved_at: Some(rejected_at),
            resolved_by: None,
            note,
        };

        Rejection { void, record }
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Inserts each compensation right after the void it cancels.
fn with_compensations<'a>(ops: &[&'a Operation], compensations: &'a [Operation]) -> Vec<&'a Operation> {
    let mut out = Vec::with_capacity(ops.len() + compensations.len());
    for op in ops {
        out.push(*op);
        out.extend(
            compensations
                .iter()
                .filter(|comp| comp.voids.as_deref() == Some(op.id.as_str())),
        );
    }
    out
}

fn without<'a>(ops: impl Iterator<Item = &'a Operation>, skip: &HashSet<&str>) -> Vec<&'a Operation> {
    ops.filter(|op| !skip.contains(op.id.as_str())).collect()
}

fn lowest_running(base: i64, ops: &[&Operation]) -> i64 {
    let mut quantity = base;
    let mut lowest = base;
    for op in ops {
        quantity += op.delta;
        lowest = lowest.min(quantity);
    }
    lowest
}

/// Orders new remote operations for append.
///
/// Causal order, except that each device's operations go in token order
/// and a void waits for its target. Anything that can never be placed is
/// left at the end, where [`Reconciler::screen`] refuses it.
fn append_order(log: &OperationLog, mut ops: Vec<Operation>) -> Vec<Operation> {
    ops.sort_by(by_causal_key);

    let mut ordered = Vec::with_capacity(ops.len());
    let mut placed: HashSet<OperationId> = HashSet::new();
    let mut pending = ops;

    while !pending.is_empty() {
        let mut next_token: HashMap<String, u64> = HashMap::new();
        for op in &pending {
            let token = next_token.entry(op.device_id.clone()).or_insert(op.causality_token);
            *token = (*token).min(op.causality_token);
        }

        let (ready, blocked): (Vec<Operation>, Vec<Operation>) =
            pending.into_iter().partition(|op| {
                next_token.get(&op.device_id) == Some(&op.causality_token)
                    && op
                        .voids
                        .as_ref()
                        .map_or(true, |target| log.contains(target) || placed.contains(target))
            });

        if ready.is_empty() {
            ordered.extend(blocked);
            break;
        }

        for op in ready {
            placed.insert(op.id.clone());
            ordered.push(op);
        }
        pending = blocked;
    }

    ordered
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn at(minute: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap() + Duration::minutes(minute)
    }

    fn op(device: &str, token: u64, kind: OperationKind, delta: i64, minute: i64) -> Operation {
        Operation {
            id: uuid::Uuid::new_v4().to_string(),
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

    fn void_of(target: &Operation, device: &str, token: u64, minute: i64) -> Operation {
        Operation {
            voids: Some(target.id.clone()),
            ..op(device, token, OperationKind::Void, -target.delta, minute)
        }
    }

    /// Log holding an opening refill from the server, synced.
    fn opening(quantity: i64) -> (OperationLog, Operation) {
        let mut log = OperationLog::new();
        let refill = op("hq", 1, OperationKind::Refill, quantity, 0);
        log.insert(refill.clone(), OperationOrigin::Remote).unwrap();
        (log, refill)
    }

    fn append_local(log: &mut OperationLog, ops: &[Operation]) {
        for op in ops {
            log.insert(op.clone(), OperationOrigin::Local).unwrap();
        }
    }

    #[test]
    fn test_offline_scan_out_and_refill_merge_to_21() {
        let (mut log, _) = opening(8);
        let sync_point = log.version();
        append_local(
            &mut log,
            &[
                op("a", 1, OperationKind::ScanOut, -2, 10),
                op("a", 2, OperationKind::Refill, 10, 20),
            ],
        );
        let remote = vec![op("b", 1, OperationKind::Refill, 5, 15)];

        let ctx = MergeContext::new(&log, sync_point, at(60));
        let mut clock = CausalityClock::resume("a", 2);
        let outcome = Reconciler::merge(&ctx, ctx.local_pending(), remote, &mut clock);

        assert_eq!(outcome.quantities["COKE-330"], 21);
        assert_eq!(outcome.conflicts.len(), 1);
        let record = &outcome.conflicts[0];
        assert_eq!(record.resolution, ConflictResolution::Merged);
        assert_eq!(record.base_quantity, 8);
        assert_eq!(record.merged_quantity, 21);
        assert_eq!(record.local_operations.len(), 2);
        assert_eq!(record.remote_operations.len(), 1);
        assert!(outcome.attention.is_empty());
        assert!(outcome.compensations.is_empty());
        assert_eq!(outcome.remote.len(), 1);
        assert_eq!(outcome.merged_log["COKE-330"].len(), 3);
    }

    #[test]
    fn test_concurrent_scan_outs_need_manual_review() {
        let (mut log, _) = opening(8);
        let sync_point = log.version();
        let local = op("a", 1, OperationKind::ScanOut, -10, 5);
        append_local(&mut log, &[local.clone()]);
        let remote = op("b", 1, OperationKind::ScanOut, -3, 6);

        let ctx = MergeContext::new(&log, sync_point, at(60));
        let mut clock = CausalityClock::resume("a", 1);
        let outcome = Reconciler::merge(&ctx, ctx.local_pending(), vec![remote.clone()], &mut clock);

        assert!(outcome.has_manual_review());
        let record = &outcome.conflicts[0];
        assert_eq!(record.resolution, ConflictResolution::ManualReview);
        assert_eq!(record.local_operations, vec![local.id]);
        assert_eq!(record.remote_operations, vec![remote.id.clone()]);
        assert!(record.is_open());
        assert!(outcome.attention.contains("COKE-330"));
        // Both movements are kept.
        assert_eq!(outcome.remote, vec![remote]);
        assert_eq!(outcome.quantities["COKE-330"], -5);
    }

    #[test]
    fn test_additive_operations_commute_without_record() {
        let mut log = OperationLog::new();
        append_local(&mut log, &[op("a", 1, OperationKind::Refill, 5, 1)]);
        let sync_point = 0;
        let remote = vec![op("b", 1, OperationKind::ScanIn, 3, 2)];

        let ctx = MergeContext::new(&log, sync_point, at(60));
        let mut clock = CausalityClock::resume("a", 1);
        let outcome = Reconciler::merge(&ctx, ctx.local_pending(), remote, &mut clock);

        assert_eq!(outcome.quantities["COKE-330"], 8);
        assert!(outcome.conflicts.is_empty());
    }

    #[test]
    fn test_known_remote_ids_are_dropped() {
        let (mut log, _) = opening(8);
        let sync_point = log.version();
        let local = op("a", 1, OperationKind::ScanOut, -2, 1);
        append_local(&mut log, &[local.clone()]);
        let already_synced = log.operations()[0].clone();

        let ctx = MergeContext::new(&log, sync_point, at(60));
        let mut clock = CausalityClock::resume("a", 1);
        let outcome = Reconciler::merge(
            &ctx,
            ctx.local_pending(),
            vec![already_synced, local.clone(), local],
            &mut clock,
        );

        assert_eq!(outcome.duplicates_dropped, 3);
        assert!(outcome.remote.is_empty());
        assert!(outcome.conflicts.is_empty());
        assert_eq!(outcome.quantities["COKE-330"], 6);
    }

    #[test]
    fn test_local_duplicate_void_is_compensated() {
        let (mut log, refill) = opening(8);
        let sync_point = log.version();
        let local_void = void_of(&refill, "a", 1, 20);
        append_local(&mut log, &[local_void.clone()]);
        let remote_void = void_of(&refill, "b", 1, 10);

        let ctx = MergeContext::new(&log, sync_point, at(60));
        let mut clock = CausalityClock::resume("a", 1);
        let outcome = Reconciler::merge(&ctx, ctx.local_pending(), vec![remote_void], &mut clock);

        assert_eq!(outcome.compensations.len(), 1);
        let compensation = &outcome.compensations[0];
        assert_eq!(compensation.id, compensation_id(&local_void.id));
        assert_eq!(compensation.voids.as_deref(), Some(local_void.id.as_str()));
        assert_eq!(compensation.delta, 8);
        assert_eq!(compensation.causality_token, 2);

        let record = &outcome.conflicts[0];
        assert_eq!(record.resolution, ConflictResolution::Compensated);
        assert_eq!(record.compensations, vec![compensation.id.clone()]);
        assert_eq!(outcome.quantities["COKE-330"], 0);
        assert!(outcome.attention.is_empty());
    }

    #[test]
    fn test_remote_duplicate_void_needs_review() {
        let (mut log, refill) = opening(8);
        let sync_point = log.version();
        append_local(&mut log, &[void_of(&refill, "a", 1, 10)]);
        let later_remote_void = void_of(&refill, "b", 1, 20);

        let ctx = MergeContext::new(&log, sync_point, at(60));
        let mut clock = CausalityClock::resume("a", 1);
        let outcome =
            Reconciler::merge(&ctx, ctx.local_pending(), vec![later_remote_void], &mut clock);

        assert!(outcome.compensations.is_empty());
        assert_eq!(outcome.conflicts[0].resolution, ConflictResolution::ManualReview);
        assert!(outcome.attention.contains("COKE-330"));
    }

    #[test]
    fn test_merge_is_independent_of_input_order() {
        let (mut log, _) = opening(20);
        let sync_point = log.version();
        append_local(
            &mut log,
            &[
                op("a", 1, OperationKind::ScanOut, -4, 3),
                op("a", 2, OperationKind::Adjustment, -1, 9),
            ],
        );
        let remote = vec![
            op("b", 1, OperationKind::ScanOut, -2, 4),
            op("c", 1, OperationKind::Refill, 6, 4),
            op("b", 2, OperationKind::Refill, 3, 8),
        ];
        let mut reversed = remote.clone();
        reversed.reverse();

        let ctx = MergeContext::new(&log, sync_point, at(60));
        let first = Reconciler::merge(
            &ctx,
            ctx.local_pending(),
            remote,
            &mut CausalityClock::resume("a", 2),
        );
        let second = Reconciler::merge(
            &ctx,
            ctx.local_pending(),
            reversed,
            &mut CausalityClock::resume("a", 2),
        );

        assert_eq!(first, second);
        assert_eq!(first.quantities["COKE-330"], 22);
    }

    #[test]
    fn test_append_order_respects_device_tokens_and_void_targets() {
        let log = OperationLog::new();
        let target = op("b", 2, OperationKind::Refill, 4, 30);
        // The void is stamped earlier than its target by a skewed clock.
        let void = void_of(&target, "c", 1, 5);
        let first = op("b", 1, OperationKind::Refill, 1, 40);

        let ordered = append_order(&log, vec![void.clone(), target.clone(), first.clone()]);
        let ids: Vec<&str> = ordered.iter().map(|op| op.id.as_str()).collect();
        assert_eq!(ids, vec![first.id.as_str(), target.id.as_str(), void.id.as_str()]);

        let mut replay = OperationLog::new();
        for op in ordered {
            replay.insert(op, OperationOrigin::Remote).unwrap();
        }
        assert_eq!(replay.version(), 3);
    }

    #[test]
    fn test_compensate_rejected() {
        let local = op("a", 3, OperationKind::ScanOut, -2, 10);
        let mut clock = CausalityClock::resume("a", 3);

        let rejection = Reconciler::compensate_rejected(
            &local,
            6,
            false,
            Some("sku unknown to store".into()),
            at(60),
            &mut clock,
        );
        let void = rejection.void.unwrap();
        assert_eq!(void.delta, 2);
        assert_eq!(void.causality_token, 4);
        assert_eq!(rejection.record.resolution, ConflictResolution::Compensated);
        assert_eq!(rejection.record.merged_quantity, 8);
        assert!(!rejection.record.is_open());

        let again = Reconciler::compensate_rejected(&local, 8, true, None, at(61), &mut clock);
        assert!(again.void.is_none());
        assert_eq!(again.record.id, rejection.record.id);
    }

    #[test]
    fn test_conflict_id_ignores_order() {
        assert_eq!(conflict_id(["b", "a", "c"]), conflict_id(["c", "b", "a", "a"]));
        assert_ne!(conflict_id(["a"]), conflict_id(["b"]));
    }

    #[test]
    fn test_screen_holds_back_token_regression_and_its_void() {
        let (mut log, _) = opening(8);
        log.insert(op("b", 5, OperationKind::Refill, 2, 1), OperationOrigin::Remote)
            .unwrap();

        let regressed = op("b", 1, OperationKind::ScanOut, -1, 2);
        let void = void_of(&regressed, "d", 1, 3);
        let valid = op("c", 1, OperationKind::Refill, 4, 4);
        let known = log.operations()[0].clone();

        let screening = Reconciler::screen(
            &log,
            vec![regressed.clone(), void.clone(), valid.clone(), known.clone()],
        );

        let held: Vec<&str> = screening
            .quarantined
            .iter()
            .map(|q| q.operation.id.as_str())
            .collect();
        assert_eq!(held, vec![regressed.id.as_str(), void.id.as_str()]);
        assert!(screening.quarantined[0].reason.contains("is not after 5"));
        assert!(screening.quarantined[1].reason.contains("not found"));
        assert_eq!(screening.admitted, vec![valid, known]);

        let record = Reconciler::quarantine_record(&screening.quarantined[0], 10, at(60));
        assert_eq!(record.resolution, ConflictResolution::ManualReview);
        assert_eq!(record.remote_operations, vec![regressed.id.clone()]);
        assert!(record.is_open());
        assert_eq!(
            record.id,
            Reconciler::quarantine_record(&screening.quarantined[0], 3, at(90)).id
        );
    }
}
