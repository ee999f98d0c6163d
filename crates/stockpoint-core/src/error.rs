//! # Error Types
//!
//! Domain-specific error types for stockpoint-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  stockpoint-core errors (this file)                                    │
//! │  ├── CoreError        - Ledger-level failures                          │
//! │  └── ValidationError  - Operation rejected before append               │
//! │                                                                         │
//! │  stockpoint-db errors (separate crate)                                 │
//! │  └── DbError          - Database operation failures                    │
//! │                                                                         │
//! │  stockpoint-sync errors (separate crate)                               │
//! │  └── SyncError        - Transport, queue and runtime failures          │
//! │                                                                         │
//! │  Flow: ValidationError → CoreError → SyncError → operator / UI         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Handling Rules
//! 1. `ValidationError` is local: the operation never reaches the log.
//! 2. `ConflictUnresolved` and `ReplayCorruption` go to the operator with
//!    enough context (SKU, conflict id, failing operation id) to act.
//! 3. Nothing is ever resolved by discarding a recorded operation.

use thiserror::Error;

use crate::types::OperationId;

// =============================================================================
// Core Error
// =============================================================================

/// Ledger-level errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Malformed or policy-violating operation.
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// The SKU is in `manual_review` and its quantity cannot be trusted.
    ///
    /// ## When This Occurs
    /// ```text
    /// Local scan_out(-10) ─┐
    ///                      ├──► merge from base 8 goes negative
    /// Remote scan_out(-3) ─┘          │
    ///                                 ▼
    ///            ConflictRecord { resolution: manual_review }
    ///                                 │
    ///                                 ▼
    ///            trusted_quantity("SKU") → ConflictUnresolved
    /// ```
    #[error("Inventory for {sku} needs attention until its conflicts are resolved")]
    ConflictUnresolved { sku: String },

    /// Checksum or causal-order violation detected while replaying a log.
    ///
    /// Fatal for that device's log: the remote ledger must be used as the
    /// source of truth to resync.
    #[error("Replay corruption at operation {operation_id}: {reason}")]
    ReplayCorruption {
        operation_id: OperationId,
        reason: String,
    },

    /// Operation id is not present in the log.
    #[error("Operation not found: {0}")]
    OperationNotFound(OperationId),

    /// Conflict id is not known to the ledger.
    #[error("Conflict not found: {0}")]
    ConflictNotFound(String),
}

impl CoreError {
    /// Creates a ReplayCorruption error.
    pub fn corruption(operation_id: impl Into<OperationId>, reason: impl Into<String>) -> Self {
        CoreError::ReplayCorruption {
            operation_id: operation_id.into(),
            reason: reason.into(),
        }
    }

    /// Returns true if the error has to be surfaced to an operator.
    pub fn requires_operator(&self) -> bool {
        matches!(
            self,
            CoreError::ConflictUnresolved { .. } | CoreError::ReplayCorruption { .. }
        )
    }
}

// =============================================================================
// Validation Error
// =============================================================================

/// Reasons an operation is rejected before append.
///
/// Validation never corrects input silently; the caller gets the reason.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("{field} is required")]
    Required { field: String },

    /// Field value is too long.
    #[error("{field} must be at most {max} characters")]
    TooLong { field: String, max: usize },

    /// Invalid format (e.g. SKU with spaces).
    #[error("{field} has invalid format: {reason}")]
    InvalidFormat { field: String, reason: String },

    /// Numeric value is out of range.
    #[error("{field} must be between {min} and {max}")]
    OutOfRange { field: String, min: i64, max: i64 },

    /// Delta sign does not match the operation kind.
    #[error("Invalid delta {delta} for {kind}: {reason}")]
    InvalidDelta {
        kind: String,
        delta: i64,
        reason: String,
    },

    /// Pessimistic pre-sync evaluation would drive stock negative.
    ///
    /// ## User Workflow
    /// ```text
    /// Scan out 5 × COKE-330
    ///      │
    ///      ▼
    /// Local projection: quantity = 3
    ///      │
    ///      ▼
    /// WouldGoNegative { sku: "COKE-330", available: 3, delta: -5 }
    ///      │
    ///      ▼
    /// UI shows: "Only 3 COKE-330 on the shelf"
    /// ```
    #[error("Stock for {sku} would go negative: available {available}, delta {delta}")]
    WouldGoNegative {
        sku: String,
        available: i64,
        delta: i64,
    },

    /// Target of a void has already been voided.
    #[error("Operation {target} is already voided by {voided_by}")]
    AlreadyVoided {
        target: OperationId,
        voided_by: OperationId,
    },

    /// Void references an operation the log does not contain.
    #[error("Void target not found: {0}")]
    UnknownTarget(OperationId),

    /// Operation id already exists in the log.
    #[error("Duplicate operation id: {0}")]
    DuplicateOperation(OperationId),

    /// Causality token did not increase for its device.
    #[error("Causality token {token} for device {device_id} is not after {last}")]
    CausalityRegression {
        device_id: String,
        token: u64,
        last: u64,
    },
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;

// =============================================================================
// Unit Tests
// =============================================================================
