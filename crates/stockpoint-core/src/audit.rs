//! # Audit Trail
//!
//! Read-only, queryable history of every quantity change: who, what, when
//! and why, plus how reconciliation settled it.
//!
//! ```text
//!   OperationLog ─┐
//!   conflicts ────┼──► AuditTrail (Arc snapshot, causal order)
//!   unconfirmed ──┘          │
//!                            └── query(&AuditQuery) ──► AuditIter (lazy)
//!                                                         │ Clone = restart
//!                                                         │ cursor() / resume
//! ```
//!
//! A trail is a snapshot: later appends are not visible through it.
//! Unconfirmed local operations are `provisional` and hidden unless the
//! query asks for them.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::oplog::OperationLog;
use crate::reconcile::by_causal_key;
use crate::types::{
    AuditEntry, AuditStatus, ConflictRecord, ConflictResolution, Operation, OperationId,
};

/// Filter for [`AuditTrail::query`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditQuery {
    pub sku: Option<String>,
    pub actor: Option<String>,
    /// Half-open range `[start, end)` on the operation timestamp.
    pub time_range: Option<(DateTime<Utc>, DateTime<Utc>)>,
    #[serde(default)]
    pub include_provisional: bool,
}

impl AuditQuery {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn sku(mut self, sku: impl Into<String>) -> Self {
        self.sku = Some(sku.into());
        self
    }

    pub fn actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    pub fn between(mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        self.time_range = Some((start, end));
        self
    }

    pub fn with_provisional(mut self) -> Self {
        self.include_provisional = true;
        self
    }

    fn matches(&self, op: &Operation) -> bool {
        self.sku.as_deref().map_or(true, |sku| op.sku == sku)
            && self.actor.as_deref().map_or(true, |actor| op.actor == actor)
            && self
                .time_range
                .map_or(true, |(start, end)| op.timestamp >= start && op.timestamp < end)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Settled {
    conflict_id: String,
    resolution: ConflictResolution,
    resolved: bool,
}

/// Immutable audit snapshot.
#[derive(Debug, Clone)]
pub struct AuditTrail {
    operations: Arc<Vec<Operation>>,
    voided_by: Arc<HashMap<OperationId, OperationId>>,
    unconfirmed: Arc<HashSet<OperationId>>,
    settled: Arc<HashMap<OperationId, Settled>>,
}

impl AuditTrail {
    /// Builds a snapshot of `log`.
    ///
    /// `unconfirmed` names local operations the remote ledger has not yet
    /// acknowledged. `conflicts` must be in detection order; a later record
    /// about the same operation takes precedence.
    pub fn from_log<'a>(
        log: &OperationLog,
        unconfirmed: impl IntoIterator<Item = OperationId>,
        conflicts: impl IntoIterator<Item = &'a ConflictRecord>,
    ) -> Self {
        let mut operations = log.operations().to_vec();
        operations.sort_by(by_causal_key);

        let voided_by = operations
            .iter()
            .filter_map(|op| {
                log.voided_by(&op.id)
                    .map(|void| (op.id.clone(), void.clone()))
            })
            .collect();

        let mut settled = HashMap::new();
        for record in conflicts {
            let resolved = match record.resolution {
                ConflictResolution::Merged => false,
                ConflictResolution::Compensated => true,
                ConflictResolution::ManualReview => record.resolved_at.is_some(),
            };
            for id in record.operation_ids() {
                settled.insert(
                    id.clone(),
                    Settled {
                        conflict_id: record.id.clone(),
                        resolution: record.resolution,
                        resolved,
                    },
                );
            }
        }

        AuditTrail {
            operations: Arc::new(operations),
            voided_by: Arc::new(voided_by),
            unconfirmed: Arc::new(unconfirmed.into_iter().collect()),
            settled: Arc::new(settled),
        }
    }

    /// Number of operations in the snapshot (provisional included).
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Lazy sequence of matching entries in causal order.
    pub fn query(&self, query: &AuditQuery) -> AuditIter {
        self.resume(query, 0)
    }

    /// Continues a query from a cursor returned by [`AuditIter::cursor`].
    pub fn resume(&self, query: &AuditQuery, cursor: usize) -> AuditIter {
        AuditIter {
            trail: self.clone(),
            query: query.clone(),
            position: cursor.min(self.operations.len()),
        }
    }

    fn entry_at(&self, index: usize) -> AuditEntry {
        let operation = self.operations[index].clone();
        let settled = self.settled.get(&operation.id);

        let status = if self.unconfirmed.contains(&operation.id) {
            AuditStatus::Provisional
        } else if settled.map_or(false, |s| s.resolved) {
            AuditStatus::Resolved
        } else {
            AuditStatus::Confirmed
        };

        AuditEntry {
            sequence: index as u64 + 1,
            voided_by: self.voided_by.get(&operation.id).cloned(),
            conflict_id: settled.map(|s| s.conflict_id.clone()),
            resolution: settled.map(|s| s.resolution),
            status,
            operation,
        }
    }
}

/// Lazy, restartable audit cursor.
#[derive(Debug, Clone)]
pub struct AuditIter {
    trail: AuditTrail,
    query: AuditQuery,
    position: usize,
}

impl AuditIter {
    /// Position to pass to [`AuditTrail::resume`] to continue later.
    pub fn cursor(&self) -> usize {
        self.position
    }
}

impl Iterator for AuditIter {
    type Item = AuditEntry;

    fn next(&mut self) -> Option<AuditEntry> {
        while self.position < self.trail.operations.len() {
            let index = self.position;
            self.position += 1;

            let op = &self.trail.operations[index];
            if !self.query.matches(op) {
                continue;
            }
            if !self.query.include_provisional && self.trail.unconfirmed.contains(&op.id) {
                continue;
            }
            return Some(self.trail.entry_at(index));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{OperationKind, OperationOrigin};
    use chrono::{Duration, TimeZone};

    fn at(minute: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap() + Duration::minutes(minute)
    }

    fn op(device: &str, token: u64, sku: &str, delta: i64, minute: i64) -> Operation {
        Operation {
            id: uuid::Uuid::new_v4().to_string(),
            sku: sku.into(),
            kind: if delta > 0 {
                OperationKind::Refill
            } else {
                OperationKind::ScanOut
            },
            delta,
            timestamp: at(minute),
            actor: format!("promoter-{}", device),
            device_id: device.into(),
            causality_token: token,
            voids: None,
            reason: Some("shelf count".into()),
        }
    }

    fn sample() -> (OperationLog, Vec<Operation>) {
        let ops = vec![
            op("a", 1, "COKE-330", 8, 0),
            op("a", 2, "COKE-330", -2, 30),
            op("b", 1, "COKE-330", 5, 15),
            op("a", 3, "PEPSI-500", 4, 40),
        ];
        let mut log = OperationLog::new();
        for op in &ops {
            log.insert(op.clone(), OperationOrigin::Local).unwrap();
        }
        (log, ops)
    }

    #[test]
    fn test_entries_follow_causal_order() {
        let (log, ops) = sample();
        let trail = AuditTrail::from_log(&log, Vec::new(), &[]);

        let ids: Vec<_> = trail
            .query(&AuditQuery::all())
            .map(|entry| entry.operation.id)
            .collect();
        assert_eq!(
            ids,
            vec![ops[0].id.clone(), ops[2].id.clone(), ops[1].id.clone(), ops[3].id.clone()]
        );

        let sequences: Vec<_> = trail.query(&AuditQuery::all()).map(|e| e.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_filters() {
        let (log, _) = sample();
        let trail = AuditTrail::from_log(&log, Vec::new(), &[]);

        assert_eq!(trail.query(&AuditQuery::all().sku("COKE-330")).count(), 3);
        assert_eq!(trail.query(&AuditQuery::all().actor("promoter-b")).count(), 1);
        assert_eq!(trail.query(&AuditQuery::all().between(at(10), at(31))).count(), 2);
        assert_eq!(
            trail
                .query(&AuditQuery::all().sku("COKE-330").actor("promoter-a"))
                .count(),
            2
        );
    }

    #[test]
    fn test_provisional_hidden_by_default() {
        let (log, ops) = sample();
        let trail = AuditTrail::from_log(&log, vec![ops[1].id.clone()], &[]);

        assert_eq!(trail.query(&AuditQuery::all()).count(), 3);

        let with = AuditQuery::all().with_provisional();
        let provisional: Vec<_> = trail
            .query(&with)
            .filter(|entry| entry.status == AuditStatus::Provisional)
            .collect();
        assert_eq!(provisional.len(), 1);
        assert_eq!(provisional[0].operation.id, ops[1].id);
    }

    #[test]
    fn test_restart_and_resume() {
        let (log, _) = sample();
        let trail = AuditTrail::from_log(&log, Vec::new(), &[]);
        let query = AuditQuery::all();

        let mut iter = trail.query(&query);
        let first = iter.next().unwrap();
        let restart = iter.clone();
        let cursor = iter.cursor();

        let rest: Vec<_> = iter.collect();
        assert_eq!(rest.len(), 3);
        assert_eq!(restart.count(), 3);
        assert_eq!(trail.resume(&query, cursor).count(), 3);
        assert_eq!(trail.resume(&query, 0).next().unwrap(), first);
        assert_eq!(trail.resume(&query, 99).count(), 0);
    }

    #[test]
    fn test_resolution_metadata() {
        let (mut log, ops) = sample();
        let void = Operation {
            id: uuid::Uuid::new_v4().to_string(),
            kind: OperationKind::Void,
            delta: 2,
            voids: Some(ops[1].id.clone()),
            ..op("a", 4, "COKE-330", 2, 50)
        };
        log.insert(void.clone(), OperationOrigin::Local).unwrap();

        let record = ConflictRecord {
            id: "conflict-1".into(),
            sku: "COKE-330".into(),
            local_operations: vec![ops[1].id.clone()],
            remote_operations: vec![],
            resolution: ConflictResolution::Compensated,
            base_quantity: 13,
            merged_quantity: 13,
            compensations: vec![void.id.clone()],
            detected_at: at(50),
            resolved_at: Some(at(50)),
            resolved_by: None,
            note: None,
        };
        let trail = AuditTrail::from_log(&log, Vec::new(), &[record]);

        let scan_out = trail
            .query(&AuditQuery::all())
            .find(|entry| entry.operation.id == ops[1].id)
            .unwrap();
        assert_eq!(scan_out.voided_by, Some(void.id.clone()));
        assert_eq!(scan_out.status, AuditStatus::Resolved);
        assert_eq!(scan_out.conflict_id.as_deref(), Some("conflict-1"));
        assert_eq!(scan_out.resolution, Some(ConflictResolution::Compensated));
        assert_eq!(scan_out.operation.reason.as_deref(), Some("shelf count"));

        let refill = trail.query(&AuditQuery::all()).next().unwrap();
        assert_eq!(refill.status, AuditStatus::Confirmed);
        assert!(refill.conflict_id.is_none());
    }
}
