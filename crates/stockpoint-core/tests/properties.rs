use chrono::{DateTime, Duration, TimeZone, Utc};
use proptest::prelude::*;
use uuid::Uuid;

use stockpoint_core::audit::AuditQuery;
use stockpoint_core::clock::CausalityClock;
use stockpoint_core::ledger::{Ledger, SyncRound};
use stockpoint_core::oplog::OperationLog;
use stockpoint_core::reconcile::{MergeContext, Reconciler};
use stockpoint_core::types::{Operation, OperationDraft, OperationKind, OperationOrigin};

#[derive(Debug, Clone)]
enum Action {
    Refill { sku: u8, quantity: u8 },
    ScanOut { sku: u8, quantity: u8 },
    Correction { sku: u8, delta: i8 },
    Void { target: u8 },
}

fn action_strategy() -> impl Strategy<Value = Action> {
    prop_oneof![
        (0u8..3, 1u8..20).prop_map(|(sku, quantity)| Action::Refill { sku, quantity }),
        (0u8..3, 1u8..20).prop_map(|(sku, quantity)| Action::ScanOut { sku, quantity }),
        (0u8..3, any::<i8>())
            .prop_filter("non-zero", |(_, delta)| *delta != 0)
            .prop_map(|(sku, delta)| Action::Correction { sku, delta }),
        (0u8..64).prop_map(|target| Action::Void { target }),
    ]
}

fn sku_name(sku: u8) -> String {
    format!("SKU-{sku}")
}

fn at(minute: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap() + Duration::minutes(minute)
}

fn apply(ledger: &mut Ledger, action: Action, minute: i64) {
    let draft = match action {
        Action::Refill { sku, quantity } => OperationDraft::refill(sku_name(sku), i64::from(quantity), "promoter"),
        Action::ScanOut { sku, quantity } => OperationDraft::scan_out(sku_name(sku), i64::from(quantity), "promoter"),
        Action::Correction { sku, delta } => {
            OperationDraft::adjustment(sku_name(sku), i64::from(delta), "supervisor").allow_negative()
        }
        Action::Void { target } => {
            let ops = ledger.log().operations();
            if ops.is_empty() {
                return;
            }
            let id = ops[usize::from(target) % ops.len()].id.clone();
            OperationDraft::void(id, "promoter")
        }
    };
    // Refused drafts (stock checks, double voids) must leave no trace.
    let version = ledger.log().version();
    if ledger.append(draft, at(minute)).is_err() {
        assert_eq!(ledger.log().version(), version);
    }
}

#[derive(Debug, Clone)]
struct Move {
    delta: i8,
    minute: u16,
}

fn move_strategy() -> impl Strategy<Value = Move> {
    (any::<i8>(), 1u16..600)
        .prop_filter("non-zero", |(delta, _)| *delta != 0)
        .prop_map(|(delta, minute)| Move { delta, minute })
}

fn moves_to_ops(device: &str, seed: u128, moves: &[Move]) -> Vec<Operation> {
    moves
        .iter()
        .enumerate()
        .map(|(index, step)| {
            let delta = i64::from(step.delta);
            Operation {
                id: Uuid::from_u128(seed + index as u128).to_string(),
                sku: "COKE-330".into(),
                kind: if delta > 0 {
                    OperationKind::Refill
                } else {
                    OperationKind::ScanOut
                },
                delta,
                timestamp: at(i64::from(step.minute)),
                actor: format!("promoter-{device}"),
                device_id: device.into(),
                causality_token: index as u64 + 1,
                voids: None,
                reason: None,
            }
        })
        .collect()
}

/// Opening refill, then `local` appended on device a.
fn local_log(opening: i64, local: &[Operation]) -> OperationLog {
    let mut log = OperationLog::new();
    let open = Operation {
        id: Uuid::from_u128(1).to_string(),
        sku: "COKE-330".into(),
        kind: OperationKind::Refill,
        delta: opening,
        timestamp: at(0),
        actor: "promoter-z".into(),
        device_id: "device-z".into(),
        causality_token: 1,
        voids: None,
        reason: None,
    };
    log.insert(open, OperationOrigin::Remote).unwrap();
    for op in local {
        log.insert(op.clone(), OperationOrigin::Local).unwrap();
    }
    log
}

proptest! {
    #[test]
    fn projection_always_matches_replay(actions in prop::collection::vec(action_strategy(), 1..120)) {
        let mut ledger = Ledger::new("store-1", "device-a");
        for (minute, action) in actions.into_iter().enumerate() {
            apply(&mut ledger, action, minute as i64);
        }

        let replayed = ledger.log().quantities_at(ledger.log().version());
        for entry in ledger.projection().snapshot() {
            prop_assert_eq!(replayed.get(&entry.sku).copied().unwrap_or(0), entry.quantity);
            prop_assert_eq!(entry.needs_attention, entry.quantity < 0);
        }
        prop_assert_eq!(ledger.projection().version(), ledger.log().version());

        let before = ledger.projection().snapshot();
        ledger.rebuild_projection().unwrap();
        prop_assert_eq!(ledger.projection().snapshot(), before);
    }

    #[test]
    fn every_operation_is_audited_once(actions in prop::collection::vec(action_strategy(), 1..80)) {
        let mut ledger = Ledger::new("store-1", "device-a");
        for (minute, action) in actions.into_iter().enumerate() {
            apply(&mut ledger, action, minute as i64);
        }

        let audit = ledger.audit();
        let query = AuditQuery::all().with_provisional();
        let entries: Vec<_> = audit.query(&query).collect();
        prop_assert_eq!(entries.len(), ledger.log().len());
        // Nothing was acknowledged, so nothing is visible by default.
        prop_assert_eq!(audit.query(&AuditQuery::all()).count(), 0);

        let accepted = ledger.log().operations().iter().map(|op| op.id.clone()).collect();
        ledger.reconcile(SyncRound { accepted, ..SyncRound::default() }, at(10_000)).unwrap();
        prop_assert_eq!(ledger.audit().query(&AuditQuery::all()).count(), ledger.log().len());
    }

    #[test]
    fn merge_ignores_delivery_order(
        opening in 1i64..60,
        local in prop::collection::vec(move_strategy(), 0..12),
        remote in prop::collection::vec(move_strategy(), 1..12),
        rotate in 0usize..12,
    ) {
        let local_ops = moves_to_ops("device-a", 1_000, &local);
        let remote_ops = moves_to_ops("device-b", 2_000, &remote);
        let log = local_log(opening, &local_ops);
        let ctx = MergeContext::new(&log, 1, at(1_000));

        let mut shuffled = remote_ops.clone();
        shuffled.reverse();
        let len = shuffled.len();
        shuffled.rotate_left(rotate % len);

        let mut clock_a = CausalityClock::resume("device-a", local_ops.len() as u64);
        let mut clock_b = clock_a.clone();
        let first = Reconciler::merge(&ctx, ctx.local_pending(), remote_ops.clone(), &mut clock_a);
        let second = Reconciler::merge(&ctx, ctx.local_pending(), shuffled, &mut clock_b);

        prop_assert_eq!(&first.quantities, &second.quantities);
        prop_assert_eq!(&first.conflicts, &second.conflicts);
        prop_assert_eq!(&first.remote, &second.remote);
        prop_assert_eq!(&first.attention, &second.attention);

        let total: i64 = opening
            + local_ops.iter().map(|op| op.delta).sum::<i64>()
            + remote_ops.iter().map(|op| op.delta).sum::<i64>();
        prop_assert_eq!(first.quantities.get("COKE-330").copied(), Some(total));

        // Applying the merge appends cleanly in the order given.
        let mut applied = log.clone();
        for op in first.remote {
            applied.insert(op, OperationOrigin::Remote).unwrap();
        }
        prop_assert_eq!(
            applied.quantities_at(applied.version()).get("COKE-330").copied(),
            Some(total)
        );
    }

    #[test]
    fn devices_agree_after_swapping_roles(
        opening in 1i64..60,
        a_moves in prop::collection::vec(move_strategy(), 0..12),
        b_moves in prop::collection::vec(move_strategy(), 0..12),
    ) {
        let a_ops = moves_to_ops("device-a", 1_000, &a_moves);
        let b_ops = moves_to_ops("device-b", 2_000, &b_moves);
        let a_log = local_log(opening, &a_ops);
        let b_log = local_log(opening, &b_ops);
        let a_ctx = MergeContext::new(&a_log, 1, at(1_000));
        let b_ctx = MergeContext::new(&b_log, 1, at(1_000));

        let mut a_clock = CausalityClock::resume("device-a", a_ops.len() as u64);
        let mut b_clock = CausalityClock::resume("device-b", b_ops.len() as u64);
        let on_a = Reconciler::merge(&a_ctx, a_ctx.local_pending(), b_ops.clone(), &mut a_clock);
        let on_b = Reconciler::merge(&b_ctx, b_ctx.local_pending(), a_ops.clone(), &mut b_clock);

        prop_assert_eq!(&on_a.quantities, &on_b.quantities);
        prop_assert_eq!(&on_a.attention, &on_b.attention);
        prop_assert_eq!(&on_a.merged_log, &on_b.merged_log);

        // Same records, seen from the other side.
        let mirrored: Vec<_> = on_b
            .conflicts
            .iter()
            .cloned()
            .map(|mut record| {
                std::mem::swap(&mut record.local_operations, &mut record.remote_operations);
                record
            })
            .collect();
        prop_assert_eq!(&on_a.conflicts, &mirrored);
    }
}
