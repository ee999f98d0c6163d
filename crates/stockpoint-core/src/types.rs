//! # Domain Types
//!
//! Core domain types used throughout Stockpoint.
//!
//! ## Type Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Domain Types                                    │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │   Operation     │   │ ProjectionEntry │   │ SyncQueueEntry  │       │
//! │  │  ─────────────  │   │  ─────────────  │   │  ─────────────  │       │
//! │  │  id (UUID)      │   │  sku            │   │  operation_id   │       │
//! │  │  sku, kind      │   │  quantity       │   │  state          │       │
//! │  │  delta (i64)    │   │  version        │   │  attempts       │       │
//! │  │  device_id      │   │  needs_attention│   │  last_error     │       │
//! │  │  causality_token│   └─────────────────┘   └─────────────────┘       │
//! │  └─────────────────┘                                                    │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │ OperationKind   │   │ ConflictRecord  │   │   AuditEntry    │       │
//! │  │  ─────────────  │   │  ─────────────  │   │  ─────────────  │       │
//! │  │  ScanIn  (+)    │   │  sku            │   │  sequence       │       │
//! │  │  ScanOut (-)    │   │  local / remote │   │  operation      │       │
//! │  │  Refill  (+)    │   │  resolution     │   │  status         │       │
//! │  │  Adjustment(±)  │   │  compensations  │   │  voided_by      │       │
//! │  │  Void (-target) │   └─────────────────┘   └─────────────────┘       │
//! │  └─────────────────┘                                                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Identity
//! - Operation `id`: UUID v4 generated on the device, globally unique
//!   without coordination so it survives merge.
//! - `(device_id, causality_token)`: per-device causal position.
//! - Compensations and conflict records use UUID v5 so every device derives
//!   the same id from the same inputs.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::error::ValidationError;

/// Operation identifier (UUID string).
pub type OperationId = String;

// =============================================================================
// Operation Kind
// =============================================================================

/// The kind of stock movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Goods received onto the shelf (positive).
    ScanIn,
    /// Goods removed from the shelf (negative).
    ScanOut,
    /// Replenishment by the promoter (positive).
    Refill,
    /// Stock count correction (either sign, never zero).
    Adjustment,
    /// Compensation cancelling a prior operation.
    Void,
}

impl OperationKind {
    /// Returns the wire/database name.
    pub const fn as_str(&self) -> &'static str {
        match self {
            OperationKind::ScanIn => "scan_in",
            OperationKind::ScanOut => "scan_out",
            OperationKind::Refill => "refill",
            OperationKind::Adjustment => "adjustment",
            OperationKind::Void => "void",
        }
    }

    /// Purely additive kinds commute with each other.
    #[inline]
    pub const fn is_additive(&self) -> bool {
        matches!(self, OperationKind::ScanIn | OperationKind::Refill)
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scan_in" => Ok(OperationKind::ScanIn),
            "scan_out" => Ok(OperationKind::ScanOut),
            "refill" => Ok(OperationKind::Refill),
            "adjustment" => Ok(OperationKind::Adjustment),
            "void" => Ok(OperationKind::Void),
            other => Err(ValidationError::InvalidFormat {
                field: "kind".to_string(),
                reason: format!("unknown operation kind '{}'", other),
            }),
        }
    }
}

// =============================================================================
// Operation
// =============================================================================

/// An immutable stock movement.
///
/// Once appended an operation is never mutated or removed. Its effect can
/// only be cancelled by a `void` operation referencing its `id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Operation {
    /// Unique identifier (UUID v4, or v5 for compensations).
    pub id: OperationId,

    /// Stock Keeping Unit the movement applies to.
    pub sku: String,

    /// What kind of movement this is.
    pub kind: OperationKind,

    /// Signed quantity change.
    pub delta: i64,

    /// Device clock at the time of the action.
    #[ts(as = "String")]
    pub timestamp: DateTime<Utc>,

    /// Promoter who performed the action.
    pub actor: String,

    /// Device that authored the operation.
    pub device_id: String,

    /// Per-device monotonic counter.
    #[ts(type = "number")]
    pub causality_token: u64,

    /// Operation cancelled by this one (voids only).
    pub voids: Option<OperationId>,

    /// Free-text reason shown in the audit trail.
    pub reason: Option<String>,
}

impl Operation {
    /// Returns true for compensating operations.
    #[inline]
    pub fn is_void(&self) -> bool {
        self.kind == OperationKind::Void
    }

    /// Deterministic total order key used for merge and audit.
    ///
    /// ```text
    /// timestamp → device_id → causality_token → id
    /// ```
    pub fn causal_key(&self) -> (DateTime<Utc>, &str, u64, &str) {
        (
            self.timestamp,
            self.device_id.as_str(),
            self.causality_token,
            self.id.as_str(),
        )
    }

    /// Canonical timestamp text used for hashing and persistence.
    pub fn timestamp_text(&self) -> String {
        self.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true)
    }
}

/// Where an operation entered this device's log from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
pub enum OperationOrigin {
    /// Authored on this device.
    Local,
    /// Received from the remote ledger.
    Remote,
}

impl OperationOrigin {
    pub const fn as_str(&self) -> &'static str {
        match self {
            OperationOrigin::Local => "local",
            OperationOrigin::Remote => "remote",
        }
    }
}

// =============================================================================
// Operation Draft
// =============================================================================

/// Caller input for a new operation, before the ledger stamps identity.
///
/// For a void, `sku` and `delta` are filled from the target by the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct OperationDraft {
    pub sku: String,
    pub kind: OperationKind,
    pub delta: i64,
    pub actor: String,
    pub voids: Option<OperationId>,
    pub reason: Option<String>,
    /// Adjustments only: allow the result to go below zero.
    #[serde(default)]
    pub allow_negative_correction: bool,
}

impl OperationDraft {
    fn new(sku: impl Into<String>, kind: OperationKind, delta: i64, actor: impl Into<String>) -> Self {
        OperationDraft {
            sku: sku.into(),
            kind,
            delta,
            actor: actor.into(),
            voids: None,
            reason: None,
            allow_negative_correction: false,
        }
    }

    /// Goods received: `quantity` units in.
    pub fn scan_in(sku: impl Into<String>, quantity: i64, actor: impl Into<String>) -> Self {
        Self::new(sku, OperationKind::ScanIn, quantity, actor)
    }

    /// Goods removed: `quantity` units out (stored as a negative delta).
    pub fn scan_out(sku: impl Into<String>, quantity: i64, actor: impl Into<String>) -> Self {
        Self::new(sku, OperationKind::ScanOut, -quantity, actor)
    }

    /// Shelf replenishment.
    pub fn refill(sku: impl Into<String>, quantity: i64, actor: impl Into<String>) -> Self {
        Self::new(sku, OperationKind::Refill, quantity, actor)
    }

    /// Count correction with an explicit signed delta.
    pub fn adjustment(sku: impl Into<String>, delta: i64, actor: impl Into<String>) -> Self {
        Self::new(sku, OperationKind::Adjustment, delta, actor)
    }

    /// Cancels `target`.
    pub fn void(target: impl Into<OperationId>, actor: impl Into<String>) -> Self {
        OperationDraft {
            voids: Some(target.into()),
            ..Self::new(String::new(), OperationKind::Void, 0, actor)
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Opts an adjustment into the negative-correction path.
    pub fn allow_negative(mut self) -> Self {
        self.allow_negative_correction = true;
        self
    }
}

// =============================================================================
// Projection Entry
// =============================================================================

/// Current-state view of one SKU, derived from the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct ProjectionEntry {
    pub sku: String,
    /// Sum of all non-voided deltas. Never clamped.
    pub quantity: i64,
    pub last_operation_id: Option<OperationId>,
    /// Projection version at which this entry last changed.
    #[ts(type = "number")]
    pub version: u64,
    /// Set while the SKU has an open manual review or a negative quantity.
    pub needs_attention: bool,
}

impl ProjectionEntry {
    pub fn empty(sku: impl Into<String>) -> Self {
        ProjectionEntry {
            sku: sku.into(),
            quantity: 0,
            last_operation_id: None,
            version: 0,
            needs_attention: false,
        }
    }
}

// =============================================================================
// Sync Queue
// =============================================================================

/// Lifecycle of a queued operation.
///
/// ```text
/// pending ──► in_flight ──► confirmed
///    ▲            │
///    └────────────┤ (transient failure / cancellation)
///                 └──► rejected ──► Reconciler
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Pending,
    InFlight,
    Confirmed,
    Rejected,
}

impl Default for SyncState {
    fn default() -> Self {
        SyncState::Pending
    }
}

/// An entry in the per-device sync queue (outbox).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct SyncQueueEntry {
    pub operation_id: OperationId,
    pub sku: String,
    #[ts(type = "number")]
    pub causality_token: u64,
    pub state: SyncState,
    pub attempts: u32,
    pub last_error: Option<String>,
    #[ts(as = "String")]
    pub enqueued_at: DateTime<Utc>,
    #[ts(as = "Option<String>")]
    pub attempted_at: Option<DateTime<Utc>>,
}

// =============================================================================
// Conflicts
// =============================================================================

/// How the Reconciler settled concurrent edits to a SKU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    /// Ordered by causal key, quantity stayed non-negative.
    Merged,
    /// A superseded operation was cancelled with a void.
    Compensated,
    /// Needs a human: quantity cannot be trusted until resolved.
    ManualReview,
}

impl ConflictResolution {
    pub const fn as_str(&self) -> &'static str {
        match self {
            ConflictResolution::Merged => "merged",
            ConflictResolution::Compensated => "compensated",
            ConflictResolution::ManualReview => "manual_review",
        }
    }
}

impl fmt::Display for ConflictResolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Record of a reconciliation decision. Never silently discarded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct ConflictRecord {
    /// Deterministic id derived from the participating operation ids.
    pub id: String,
    pub sku: String,
    pub local_operations: Vec<OperationId>,
    pub remote_operations: Vec<OperationId>,
    pub resolution: ConflictResolution,
    /// Quantity at the last sync point.
    pub base_quantity: i64,
    /// Quantity after the merged order (compensations included).
    pub merged_quantity: i64,
    /// Operations appended to settle this conflict: compensating voids or an
    /// operator correction.
    pub compensations: Vec<OperationId>,
    #[ts(as = "String")]
    pub detected_at: DateTime<Utc>,
    #[ts(as = "Option<String>")]
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<String>,
    pub note: Option<String>,
}

impl ConflictRecord {
    /// Open means an operator still has to act on it.
    pub fn is_open(&self) -> bool {
        self.resolution == ConflictResolution::ManualReview && self.resolved_at.is_none()
    }

    /// Every operation id taking part in this conflict.
    pub fn operation_ids(&self) -> impl Iterator<Item = &OperationId> {
        self.local_operations
            .iter()
            .chain(self.remote_operations.iter())
            .chain(self.compensations.iter())
    }
}

// =============================================================================
// Audit
// =============================================================================

/// Authority of an audit entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum AuditStatus {
    /// Acknowledged by (or received from) the remote ledger.
    Confirmed,
    /// Settled by reconciliation (compensation or operator resolution).
    Resolved,
    /// Local and not yet synced. Not authoritative.
    Provisional,
}

/// One row of the audit trail: who / what / when / why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct AuditEntry {
    /// Position in causal order.
    #[ts(type = "number")]
    pub sequence: u64,
    pub operation: Operation,
    pub status: AuditStatus,
    pub voided_by: Option<OperationId>,
    pub conflict_id: Option<String>,
    pub resolution: Option<ConflictResolution>,
}

// =============================================================================
// Sync Token
// =============================================================================

/// Opaque cross-device ordering token issued by the remote ledger.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(transparent)]
pub struct SyncToken(pub String);

impl SyncToken {
    pub fn new(token: impl Into<String>) -> Self {
        SyncToken(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SyncToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
