//! # Local Projection
//!
//! Current-state view of the store's inventory, folded from the log.
//!
//! ```text
//!   OperationLog ──append──► apply(op)        O(1) per operation
//!        │
//!        └──replay(v)──► ProjectionDelta ──► apply_delta(delta)
//!        │
//!        └──full replay──► rebuild(log)       recovery
//! ```
//!
//! The projection is a cache. It is never authoritative and is rebuilt by
//! replay whenever its version disagrees with the log's.
//!
//! ## Attention
//! A SKU needs attention while it is flagged by an open manual review or
//! while its quantity is negative. Negative quantities are never clamped.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::oplog::OperationLog;
use crate::types::{Operation, OperationId, ProjectionEntry};

/// Net change for one SKU across a replayed range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkuChange {
    pub delta: i64,
    pub last_operation_id: OperationId,
    /// Log version of the last operation touching the SKU in the range.
    pub last_version: u64,
}

/// Result of replaying a log range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectionDelta {
    pub from_version: u64,
    pub to_version: u64,
    pub changes: BTreeMap<String, SkuChange>,
}

impl ProjectionDelta {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

/// In-memory projection of per-SKU quantities.
#[derive(Debug, Clone, Default)]
pub struct LocalProjection {
    entries: HashMap<String, ProjectionEntry>,
    flagged: HashSet<String>,
    version: u64,
}

impl LocalProjection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restores a projection from its persisted cache.
    pub fn from_cache(entries: Vec<ProjectionEntry>, version: u64) -> Self {
        let mut projection = LocalProjection {
            version,
            ..Self::default()
        };
        for entry in entries {
            if entry.needs_attention && entry.quantity >= 0 {
                projection.flagged.insert(entry.sku.clone());
            }
            projection.entries.insert(entry.sku.clone(), entry);
        }
        projection
    }

    /// Log version this projection reflects.
    #[inline]
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn get(&self, sku: &str) -> Option<&ProjectionEntry> {
        self.entries.get(sku)
    }

    /// Quantity for `sku`, zero when the SKU has never moved.
    pub fn quantity(&self, sku: &str) -> i64 {
        self.entries.get(sku).map_or(0, |entry| entry.quantity)
    }

    /// Quantity that may be shown as authoritative.
    ///
    /// ```text
    /// needs_attention = false → Ok(quantity)
    /// needs_attention = true  → Err(ConflictUnresolved)
    /// ```
    pub fn trusted_quantity(&self, sku: &str) -> CoreResult<i64> {
        match self.entries.get(sku) {
            Some(entry) if entry.needs_attention => Err(CoreError::ConflictUnresolved {
                sku: sku.to_string(),
            }),
            Some(entry) => Ok(entry.quantity),
            None if self.flagged.contains(sku) => Err(CoreError::ConflictUnresolved {
                sku: sku.to_string(),
            }),
            None => Ok(0),
        }
    }

    /// Entries sorted by SKU.
    pub fn snapshot(&self) -> Vec<ProjectionEntry> {
        let mut entries: Vec<_> = self.entries.values().cloned().collect();
        entries.sort_by(|a, b| a.sku.cmp(&b.sku));
        entries
    }

    /// SKUs currently needing attention, sorted.
    pub fn attention(&self) -> Vec<String> {
        let mut skus: Vec<_> = self
            .entries
            .values()
            .filter(|entry| entry.needs_attention)
            .map(|entry| entry.sku.clone())
            .collect();
        skus.sort();
        skus
    }

    /// Incremental update for one appended operation.
    pub fn apply(&mut self, op: &Operation) -> &ProjectionEntry {
        self.version += 1;
        let version = self.version;
        let flagged = self.flagged.contains(&op.sku);

        let entry = self
            .entries
            .entry(op.sku.clone())
            .or_insert_with(|| ProjectionEntry::empty(op.sku.clone()));
        entry.quantity += op.delta;
        entry.last_operation_id = Some(op.id.clone());
        entry.version = version;
        entry.needs_attention = flagged || entry.quantity < 0;
        entry
    }

    /// Folds a replay result starting at this projection's version.
    pub fn apply_delta(&mut self, delta: &ProjectionDelta) -> CoreResult<()> {
        if delta.from_version != self.version {
            let operation_id = delta
                .changes
                .values()
                .max_by_key(|change| change.last_version)
                .map(|change| change.last_operation_id.clone())
                .unwrap_or_default();
            return Err(CoreError::corruption(
                operation_id,
                format!(
                    "replay starts at version {} but projection is at {}",
                    delta.from_version, self.version
                ),
            ));
        }

        for (sku, change) in &delta.changes {
            let flagged = self.flagged.contains(sku);
            let entry = self
                .entries
                .entry(sku.clone())
                .or_insert_with(|| ProjectionEntry::empty(sku.clone()));
            entry.quantity += change.delta;
            entry.last_operation_id = Some(change.last_operation_id.clone());
            entry.version = change.last_version;
            entry.needs_attention = flagged || entry.quantity < 0;
        }
        self.version = delta.to_version;
        Ok(())
    }

    /// Discards all quantities and replays the whole log.
    ///
    /// Attention flags survive: they come from conflict records, not from
    /// the log.
    pub fn rebuild(&mut self, log: &OperationLog) -> CoreResult<()> {
        self.entries.clear();
        self.version = 0;
        self.apply_delta(&log.replay(0))?;
        for sku in self.flagged.clone() {
            self.refresh_attention(&sku);
        }
        Ok(())
    }

    /// Flags or clears a SKU as untrustworthy.
    ///
    /// Clearing does not hide a negative quantity; that stays flagged.
    pub fn set_attention(&mut self, sku: &str, needs_attention: bool) {
        if needs_attention {
            self.flagged.insert(sku.to_string());
        } else {
            self.flagged.remove(sku);
        }
        self.refresh_attention(sku);
    }

    fn refresh_attention(&mut self, sku: &str) {
        let flagged = self.flagged.contains(sku);
        if let Some(entry) = self.entries.get_mut(sku) {
            entry.needs_attention = flagged || entry.quantity < 0;
        } else if flagged {
            let mut entry = ProjectionEntry::empty(sku);
            entry.needs_attention = true;
            self.entries.insert(sku.to_string(), entry);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{OperationKind, OperationOrigin};
    use chrono::Utc;

    fn op(token: u64, sku: &str, kind: OperationKind, delta: i64) -> Operation {
        Operation {
            id: uuid::Uuid::new_v4().to_string(),
            sku: sku.into(),
            kind,
            delta,
            timestamp: Utc::now(),
            actor: "promoter-1".into(),
            device_id: "device-a".into(),
            causality_token: token,
            voids: None,
            reason: None,
        }
    }

    fn log_of(ops: Vec<Operation>) -> OperationLog {
        let mut log = OperationLog::new();
        for op in ops {
            log.insert(op, OperationOrigin::Local).unwrap();
        }
        log
    }

    #[test]
    fn test_apply_tracks_versions() {
        let mut projection = LocalProjection::new();
        projection.apply(&op(1, "COKE-330", OperationKind::Refill, 8));
        projection.apply(&op(2, "PEPSI-500", OperationKind::Refill, 4));
        let entry = projection
            .apply(&op(3, "COKE-330", OperationKind::ScanOut, -2))
            .clone();

        assert_eq!(projection.version(), 3);
        assert_eq!(entry.quantity, 6);
        assert_eq!(entry.version, 3);
        assert_eq!(projection.get("PEPSI-500").unwrap().version, 2);
        assert!(projection.get("FANTA-330").is_none());
        assert_eq!(projection.quantity("FANTA-330"), 0);
    }

    #[test]
    fn test_rebuild_matches_incremental() {
        let ops = vec![
            op(1, "COKE-330", OperationKind::Refill, 8),
            op(2, "COKE-330", OperationKind::ScanOut, -2),
            op(3, "PEPSI-500", OperationKind::ScanIn, 12),
            op(4, "COKE-330", OperationKind::Refill, 10),
        ];
        let log = log_of(ops.clone());

        let mut incremental = LocalProjection::new();
        for op in &ops {
            incremental.apply(op);
        }

        let mut rebuilt = LocalProjection::new();
        rebuilt.rebuild(&log).unwrap();

        assert_eq!(rebuilt.snapshot(), incremental.snapshot());
        assert_eq!(rebuilt.version(), incremental.version());
    }

    #[test]
    fn test_apply_delta_requires_matching_version() {
        let log = log_of(vec![
            op(1, "COKE-330", OperationKind::Refill, 8),
            op(2, "COKE-330", OperationKind::ScanOut, -2),
        ]);

        let mut projection = LocalProjection::new();
        assert!(projection.apply_delta(&log.replay(1)).is_err());

        projection.apply_delta(&log.replay(0)).unwrap();
        assert_eq!(projection.quantity("COKE-330"), 6);
        assert_eq!(projection.version(), 2);
    }

    #[test]
    fn test_negative_quantity_needs_attention() {
        let mut projection = LocalProjection::new();
        projection.apply(&op(1, "COKE-330", OperationKind::Adjustment, -3));

        assert_eq!(projection.quantity("COKE-330"), -3);
        assert!(projection.get("COKE-330").unwrap().needs_attention);
        assert!(projection.trusted_quantity("COKE-330").is_err());

        projection.set_attention("COKE-330", false);
        assert!(projection.get("COKE-330").unwrap().needs_attention);

        projection.apply(&op(2, "COKE-330", OperationKind::Refill, 5));
        assert!(!projection.get("COKE-330").unwrap().needs_attention);
        assert_eq!(projection.trusted_quantity("COKE-330").unwrap(), 2);
    }

    #[test]
    fn test_flag_survives_rebuild() {
        let log = log_of(vec![op(1, "COKE-330", OperationKind::Refill, 8)]);
        let mut projection = LocalProjection::new();
        projection.rebuild(&log).unwrap();

        projection.set_attention("COKE-330", true);
        projection.rebuild(&log).unwrap();
        assert!(matches!(
            projection.trusted_quantity("COKE-330"),
            Err(CoreError::ConflictUnresolved { .. })
        ));
        assert_eq!(projection.attention(), vec!["COKE-330".to_string()]);

        projection.set_attention("COKE-330", false);
        assert_eq!(projection.trusted_quantity("COKE-330").unwrap(), 8);
    }

    #[test]
    fn test_from_cache() {
        let mut entry = ProjectionEntry::empty("COKE-330");
        entry.quantity = 5;
        entry.version = 7;
        entry.needs_attention = true;

        let projection = LocalProjection::from_cache(vec![entry], 9);
        assert_eq!(projection.version(), 9);
        assert!(projection.trusted_quantity("COKE-330").is_err());
    }
}
