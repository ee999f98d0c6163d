//! # Operation Log
//!
//! The append-only record of every stock movement on this device, local
//! and merged-in remote alike.
//!
//! ## Structure
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         OperationLog                                    │
//! │                                                                         │
//! │  version:   1        2        3        4        5                      │
//! │           ┌──────┐ ┌──────┐ ┌──────┐ ┌──────┐ ┌──────┐                 │
//! │  ops:     │refill│ │s_out │ │refill│ │refill│ │ void │──┐              │
//! │           │ +8   │ │ -2   │ │ +10  │ │ +5   │ │ -10  │  │ voids op 3   │
//! │           │dev-a │ │dev-a │ │dev-a │ │dev-b │ │dev-a │  │              │
//! │           └──────┘ └──────┘ └──▲───┘ └──────┘ └──────┘  │              │
//! │                                └────────────────────────┘              │
//! │                                                                         │
//! │  index:        id → position                                           │
//! │  device_tokens: device → last causality token (strictly increasing)    │
//! │  voided_by:    target id → first void id                               │
//! │  head_hash:    chain head for the next persisted record                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Rules
//! - Nothing is ever mutated or removed.
//! - Version = number of operations appended.
//! - `replay` is a pure fold over a suffix of the log.

use std::collections::{BTreeMap, HashMap};

use crate::chain::{chain_hash, verify_link, ChainedOperation, GENESIS_HASH};
use crate::error::{CoreError, CoreResult, ValidationError};
use crate::projection::{ProjectionDelta, SkuChange};
use crate::types::{Operation, OperationId, OperationOrigin};
use crate::validation::{validate_operation, validate_void};

/// Chain position assigned to an appended operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainLink {
    /// Log version after the append.
    pub version: u64,
    pub prev_hash: String,
    pub record_hash: String,
}

/// Append-only operation log.
#[derive(Debug, Clone)]
pub struct OperationLog {
    operations: Vec<Operation>,
    index: HashMap<OperationId, usize>,
    device_tokens: HashMap<String, u64>,
    voided_by: HashMap<OperationId, OperationId>,
    head_hash: String,
}

impl Default for OperationLog {
    fn default() -> Self {
        Self::new()
    }
}

impl OperationLog {
    pub fn new() -> Self {
        OperationLog {
            operations: Vec::new(),
            index: HashMap::new(),
            device_tokens: HashMap::new(),
            voided_by: HashMap::new(),
            head_hash: GENESIS_HASH.to_string(),
        }
    }

    /// Rebuilds a log from persisted records in append order.
    ///
    /// Every chain link and every structural rule is re-checked. Any
    /// violation means the persisted log cannot be trusted and is reported
    /// as [`CoreError::ReplayCorruption`] naming the failing operation.
    pub fn from_records(records: impl IntoIterator<Item = ChainedOperation>) -> CoreResult<Self> {
        let mut log = OperationLog::new();

        for record in records {
            verify_link(&log.head_hash, &record)?;
            let id = record.operation.id.clone();
            log.insert_checked(record.operation, OperationOrigin::Remote)
                .map_err(|err| CoreError::corruption(id, err.to_string()))?;
        }

        Ok(log)
    }

    // =========================================================================
    // Read Access
    // =========================================================================

    /// Number of operations appended.
    #[inline]
    pub fn version(&self) -> u64 {
        self.operations.len() as u64
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    /// Operations appended after `version`.
    pub fn since(&self, version: u64) -> &[Operation] {
        let start = (version as usize).min(self.operations.len());
        &self.operations[start..]
    }

    pub fn get(&self, id: &str) -> Option<&Operation> {
        self.index.get(id).map(|&pos| &self.operations[pos])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Log version at which `id` was appended.
    pub fn version_of(&self, id: &str) -> Option<u64> {
        self.index.get(id).map(|&pos| pos as u64 + 1)
    }

    /// First void that cancelled `id`, if any.
    pub fn voided_by(&self, id: &str) -> Option<&OperationId> {
        self.voided_by.get(id)
    }

    /// Last causality token seen for `device_id` (0 when none).
    pub fn last_token(&self, device_id: &str) -> u64 {
        self.device_tokens.get(device_id).copied().unwrap_or(0)
    }

    /// Hash the next appended record will chain from.
    pub fn head_hash(&self) -> &str {
        &self.head_hash
    }

    // =========================================================================
    // Append
    // =========================================================================

    /// Checks whether `op` could be appended, without appending it.
    pub fn check(&self, op: &Operation, origin: OperationOrigin) -> CoreResult<()> {
        validate_operation(op)?;

        if self.contains(&op.id) {
            return Err(ValidationError::DuplicateOperation(op.id.clone()).into());
        }

        let last = self.last_token(&op.device_id);
        if op.causality_token <= last {
            return Err(ValidationError::CausalityRegression {
                device_id: op.device_id.clone(),
                token: op.causality_token,
                last,
            }
            .into());
        }

        if let Some(target_id) = &op.voids {
            let target = self
                .get(target_id)
                .ok_or_else(|| ValidationError::UnknownTarget(target_id.clone()))?;
            validate_void(op, target)?;

            // A remote duplicate void is already recorded elsewhere; it is
            // kept and left to the Reconciler.
            if origin == OperationOrigin::Local {
                if let Some(existing) = self.voided_by(target_id) {
                    return Err(ValidationError::AlreadyVoided {
                        target: target_id.clone(),
                        voided_by: existing.clone(),
                    }
                    .into());
                }
            }
        }

        Ok(())
    }

    /// Appends an operation after structural checks.
    pub fn insert(&mut self, op: Operation, origin: OperationOrigin) -> CoreResult<ChainLink> {
        self.insert_checked(op, origin)
    }

    fn insert_checked(&mut self, op: Operation, origin: OperationOrigin) -> CoreResult<ChainLink> {
        self.check(&op, origin)?;

        let prev_hash = std::mem::take(&mut self.head_hash);
        let record_hash = chain_hash(&prev_hash, &op);
        self.head_hash = record_hash.clone();

        self.device_tokens
            .insert(op.device_id.clone(), op.causality_token);
        if let Some(target) = &op.voids {
            self.voided_by
                .entry(target.clone())
                .or_insert_with(|| op.id.clone());
        }
        self.index.insert(op.id.clone(), self.operations.len());
        self.operations.push(op);

        Ok(ChainLink {
            version: self.version(),
            prev_hash,
            record_hash,
        })
    }

    // =========================================================================
    // Replay
    // =========================================================================

    /// Folds `operations[from_version..]` into a per-SKU delta.
    ///
    /// Pure and deterministic: the same ordered sequence always yields the
    /// same delta.
    pub fn replay(&self, from_version: u64) -> ProjectionDelta {
        let from_version = from_version.min(self.version());
        let mut changes: BTreeMap<String, SkuChange> = BTreeMap::new();

        for (offset, op) in self.since(from_version).iter().enumerate() {
            let version = from_version + offset as u64 + 1;
            let change = changes.entry(op.sku.clone()).or_insert_with(|| SkuChange {
                delta: 0,
                last_operation_id: op.id.clone(),
                last_version: version,
            });
            change.delta += op.delta;
            change.last_operation_id = op.id.clone();
            change.last_version = version;
        }

        ProjectionDelta {
            from_version,
            to_version: self.version(),
            changes,
        }
    }

    /// Per-SKU quantities after the first `version` operations.
    pub fn quantities_at(&self, version: u64) -> BTreeMap<String, i64> {
        let end = (version as usize).min(self.operations.len());
        let mut quantities = BTreeMap::new();
        for op in &self.operations[..end] {
            *quantities.entry(op.sku.clone()).or_insert(0) += op.delta;
        }
        quantities
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OperationKind;
    use chrono::{Duration, TimeZone, Utc};

    fn op(device: &str, token: u64, kind: OperationKind, delta: i64) -> Operation {
        Operation {
            id: uuid::Uuid::new_v4().to_string(),
            sku: "COKE-330".into(),
            kind,
            delta,
            timestamp: Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
                + Duration::seconds(token as i64),
            actor: "promoter-1".into(),
            device_id: device.into(),
            causality_token: token,
            voids: None,
            reason: None,
        }
    }

    fn void_of(target: &Operation, device: &str, token: u64) -> Operation {
        Operation {
            voids: Some(target.id.clone()),
            ..op(device, token, OperationKind::Void, -target.delta)
        }
    }

    #[test]
    fn test_insert_and_versions() {
        let mut log = OperationLog::new();
        let first = log
            .insert(op("a", 1, OperationKind::Refill, 8), OperationOrigin::Local)
            .unwrap();
        assert_eq!(first.version, 1);
        assert_eq!(first.prev_hash, GENESIS_HASH);

        let second = log
            .insert(op("a", 2, OperationKind::ScanOut, -2), OperationOrigin::Local)
            .unwrap();
        assert_eq!(second.version, 2);
        assert_eq!(second.prev_hash, first.record_hash);
        assert_eq!(log.head_hash(), second.record_hash);
        assert_eq!(log.last_token("a"), 2);
    }

    #[test]
    fn test_rejects_duplicate_id() {
        let mut log = OperationLog::new();
        let refill = op("a", 1, OperationKind::Refill, 8);
        log.insert(refill.clone(), OperationOrigin::Local).unwrap();

        let mut again = refill;
        again.causality_token = 2;
        let err = log.insert(again, OperationOrigin::Remote).unwrap_err();
        assert!(matches!(
            err,
            CoreError::Validation(ValidationError::DuplicateOperation(_))
        ));
        assert_eq!(log.version(), 1);
    }

    #[test]
    fn test_rejects_causality_regression() {
        let mut log = OperationLog::new();
        log.insert(op("a", 5, OperationKind::Refill, 8), OperationOrigin::Local)
            .unwrap();

        let err = log
            .insert(op("a", 5, OperationKind::Refill, 1), OperationOrigin::Local)
            .unwrap_err();
        assert!(matches!(
            err,
            CoreError::Validation(ValidationError::CausalityRegression { last: 5, .. })
        ));

        // Other devices keep their own counters.
        assert!(log
            .insert(op("b", 1, OperationKind::Refill, 1), OperationOrigin::Remote)
            .is_ok());
    }

    #[test]
    fn test_void_rules() {
        let mut log = OperationLog::new();
        let refill = op("a", 1, OperationKind::Refill, 10);
        log.insert(refill.clone(), OperationOrigin::Local).unwrap();

        let mut wrong = void_of(&refill, "a", 2);
        wrong.delta = -3;
        assert!(log.insert(wrong, OperationOrigin::Local).is_err());

        let unknown = Operation {
            voids: Some(uuid::Uuid::new_v4().to_string()),
            ..op("a", 2, OperationKind::Void, -1)
        };
        assert!(matches!(
            log.insert(unknown, OperationOrigin::Local).unwrap_err(),
            CoreError::Validation(ValidationError::UnknownTarget(_))
        ));

        let void = void_of(&refill, "a", 2);
        log.insert(void.clone(), OperationOrigin::Local).unwrap();
        assert_eq!(log.voided_by(&refill.id), Some(&void.id));

        let local_dup = void_of(&refill, "a", 3);
        assert!(matches!(
            log.insert(local_dup, OperationOrigin::Local).unwrap_err(),
            CoreError::Validation(ValidationError::AlreadyVoided { .. })
        ));

        // Remote duplicate is recorded; the first void stays authoritative.
        let remote_dup = void_of(&refill, "b", 1);
        log.insert(remote_dup, OperationOrigin::Remote).unwrap();
        assert_eq!(log.voided_by(&refill.id), Some(&void.id));
    }

    #[test]
    fn test_replay_is_pure_fold() {
        let mut log = OperationLog::new();
        log.insert(op("a", 1, OperationKind::Refill, 8), OperationOrigin::Local)
            .unwrap();
        log.insert(op("a", 2, OperationKind::ScanOut, -2), OperationOrigin::Local)
            .unwrap();
        let mut other = op("a", 3, OperationKind::Refill, 4);
        other.sku = "PEPSI-500".into();
        log.insert(other, OperationOrigin::Local).unwrap();

        let full = log.replay(0);
        assert_eq!(full, log.replay(0));
        assert_eq!(full.to_version, 3);
        assert_eq!(full.changes["COKE-330"].delta, 6);
        assert_eq!(full.changes["COKE-330"].last_version, 2);
        assert_eq!(full.changes["PEPSI-500"].delta, 4);

        let tail = log.replay(2);
        assert_eq!(tail.from_version, 2);
        assert!(!tail.changes.contains_key("COKE-330"));

        assert_eq!(log.quantities_at(1)["COKE-330"], 8);
        assert_eq!(log.quantities_at(3)["COKE-330"], 6);
        assert!(log.replay(10).changes.is_empty());
    }

    #[test]
    fn test_from_records_round_trip() {
        let mut log = OperationLog::new();
        let mut records = Vec::new();
        for (token, delta) in [(1, 8), (2, 3)] {
            let operation = op("a", token, OperationKind::Refill, delta);
            let link = log.insert(operation.clone(), OperationOrigin::Local).unwrap();
            records.push(ChainedOperation {
                operation,
                prev_hash: link.prev_hash,
                record_hash: link.record_hash,
            });
        }

        let restored = OperationLog::from_records(records.clone()).unwrap();
        assert_eq!(restored.version(), 2);
        assert_eq!(restored.head_hash(), log.head_hash());

        records.swap(0, 1);
        assert!(matches!(
            OperationLog::from_records(records).unwrap_err(),
            CoreError::ReplayCorruption { .. }
        ));
    }

    #[test]
    fn test_from_records_rejects_order_violation_with_valid_hashes() {
        // Hashes are consistent but the device's tokens go backwards.
        let first = op("a", 2, OperationKind::Refill, 8);
        let second = op("a", 1, OperationKind::Refill, 3);
        let h1 = chain_hash(GENESIS_HASH, &first);
        let h2 = chain_hash(&h1, &second);
        let records = vec![
            ChainedOperation {
                operation: first,
                prev_hash: GENESIS_HASH.into(),
                record_hash: h1.clone(),
            },
            ChainedOperation {
                operation: second.clone(),
                prev_hash: h1,
                record_hash: h2,
            },
        ];

        match OperationLog::from_records(records) {
            Err(CoreError::ReplayCorruption { operation_id, .. }) => {
                assert_eq!(operation_id, second.id)
            }
            other => panic!("expected corruption, got {:?}", other),
        }
    }
}
