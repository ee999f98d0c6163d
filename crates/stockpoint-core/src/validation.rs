//! # Validation Module
//!
//! Input validation for operations before they reach the log.
//!
//! ## Validation Strategy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Validation Layers                                  │
//! │                                                                         │
//! │  Layer 1: Draft fields (THIS MODULE)                                   │
//! │  ├── sku / actor / reason format                                       │
//! │  └── delta sign and bounds per kind                                    │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 2: Ledger policy (ledger.rs)                                    │
//! │  └── pessimistic non-negative check against the projection             │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 3: Log structure (oplog.rs)                                     │
//! │  ├── unique id, per-device causality order                             │
//! │  └── void target exists, negated delta, not already voided             │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 4: Database (SQLite)                                            │
//! │  └── UNIQUE (id), UNIQUE (device_id, causality_token)                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//! ```rust
//! use stockpoint_core::types::OperationKind;
//! use stockpoint_core::validation::{validate_delta, validate_sku};
//!
//! validate_sku("COKE-330").unwrap();
//! validate_delta(OperationKind::ScanOut, -2).unwrap();
//! assert!(validate_delta(OperationKind::ScanOut, 2).is_err());
//! ```

use crate::error::ValidationError;
use crate::types::{Operation, OperationDraft, OperationKind};
use crate::{MAX_ACTOR_LENGTH, MAX_OPERATION_DELTA, MAX_REASON_LENGTH, MAX_SKU_LENGTH};

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

// =============================================================================
// String Validators
// =============================================================================

/// Validates a SKU (Stock Keeping Unit).
///
/// ## Rules
/// - Must not be empty
/// - At most 50 characters
/// - Only alphanumeric characters, hyphens, underscores
///
/// ## Example
/// ```rust
/// use stockpoint_core::validation::validate_sku;
///
/// assert!(validate_sku("COKE-330").is_ok());
/// assert!(validate_sku("").is_err());
/// assert!(validate_sku("A".repeat(100).as_str()).is_err());
/// ```
pub fn validate_sku(sku: &str) -> ValidationResult<()> {
    if sku.trim().is_empty() {
        return Err(ValidationError::Required {
            field: "sku".to_string(),
        });
    }

    if sku.len() > MAX_SKU_LENGTH {
        return Err(ValidationError::TooLong {
            field: "sku".to_string(),
            max: MAX_SKU_LENGTH,
        });
    }

    if !sku
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
    {
        return Err(ValidationError::InvalidFormat {
            field: "sku".to_string(),
            reason: "must contain only letters, numbers, hyphens, and underscores".to_string(),
        });
    }

    Ok(())
}

/// Validates the promoter id recorded as actor.
pub fn validate_actor(actor: &str) -> ValidationResult<()> {
    if actor.trim().is_empty() {
        return Err(ValidationError::Required {
            field: "actor".to_string(),
        });
    }

    if actor.len() > MAX_ACTOR_LENGTH {
        return Err(ValidationError::TooLong {
            field: "actor".to_string(),
            max: MAX_ACTOR_LENGTH,
        });
    }

    Ok(())
}

/// Validates the optional free-text reason.
pub fn validate_reason(reason: Option<&str>) -> ValidationResult<()> {
    match reason {
        Some(reason) if reason.len() > MAX_REASON_LENGTH => Err(ValidationError::TooLong {
            field: "reason".to_string(),
            max: MAX_REASON_LENGTH,
        }),
        _ => Ok(()),
    }
}

/// Validates an operation id (UUID text).
///
/// ```rust
/// use stockpoint_core::validation::validate_operation_id;
///
/// assert!(validate_operation_id("550e8400-e29b-41d4-a716-446655440000").is_ok());
/// assert!(validate_operation_id("not-a-uuid").is_err());
/// ```
pub fn validate_operation_id(id: &str) -> ValidationResult<()> {
    if id.trim().is_empty() {
        return Err(ValidationError::Required {
            field: "id".to_string(),
        });
    }

    uuid::Uuid::parse_str(id).map_err(|_| ValidationError::InvalidFormat {
        field: "id".to_string(),
        reason: "must be a valid UUID".to_string(),
    })?;

    Ok(())
}

// =============================================================================
// Delta Validators
// =============================================================================

/// Validates the sign and magnitude of a delta for its kind.
///
/// ## Rules
/// ```text
/// scan_in, refill  →  delta > 0
/// scan_out         →  delta < 0
/// adjustment       →  delta ≠ 0
/// void             →  checked against its target (validate_void)
/// |delta| ≤ MAX_OPERATION_DELTA
/// ```
pub fn validate_delta(kind: OperationKind, delta: i64) -> ValidationResult<()> {
    if delta.unsigned_abs() > MAX_OPERATION_DELTA as u64 {
        return Err(ValidationError::OutOfRange {
            field: "delta".to_string(),
            min: -MAX_OPERATION_DELTA,
            max: MAX_OPERATION_DELTA,
        });
    }

    let reason = match kind {
        OperationKind::ScanIn | OperationKind::Refill if delta <= 0 => "must be positive",
        OperationKind::ScanOut if delta >= 0 => "must be negative",
        OperationKind::Adjustment if delta == 0 => "must not be zero",
        _ => return Ok(()),
    };

    Err(ValidationError::InvalidDelta {
        kind: kind.to_string(),
        delta,
        reason: reason.to_string(),
    })
}

/// Validates a void against the operation it cancels.
pub fn validate_void(void: &Operation, target: &Operation) -> ValidationResult<()> {
    if void.sku != target.sku {
        return Err(ValidationError::InvalidFormat {
            field: "sku".to_string(),
            reason: format!("void targets {} but names {}", target.sku, void.sku),
        });
    }

    if void.delta != -target.delta {
        return Err(ValidationError::InvalidDelta {
            kind: OperationKind::Void.to_string(),
            delta: void.delta,
            reason: format!("must negate target delta {}", target.delta),
        });
    }

    Ok(())
}

/// Field-level validation of a draft. Voids are checked later, once the
/// ledger has resolved the target.
pub fn validate_draft(draft: &OperationDraft) -> ValidationResult<()> {
    validate_actor(&draft.actor)?;
    validate_reason(draft.reason.as_deref())?;

    match (draft.kind, &draft.voids) {
        (OperationKind::Void, None) => Err(ValidationError::Required {
            field: "voids".to_string(),
        }),
        (OperationKind::Void, Some(target)) => validate_operation_id(target),
        (kind, Some(_)) => Err(ValidationError::InvalidFormat {
            field: "voids".to_string(),
            reason: format!("only void operations may reference a target, not {}", kind),
        }),
        (kind, None) => {
            validate_sku(&draft.sku)?;
            validate_delta(kind, draft.delta)
        }
    }
}

/// Structural validation of a complete operation (local or remote).
pub fn validate_operation(op: &Operation) -> ValidationResult<()> {
    validate_operation_id(&op.id)?;
    validate_sku(&op.sku)?;
    validate_actor(&op.actor)?;
    validate_reason(op.reason.as_deref())?;

    if op.device_id.trim().is_empty() {
        return Err(ValidationError::Required {
            field: "device_id".to_string(),
        });
    }

    match (op.kind, &op.voids) {
        (OperationKind::Void, None) => Err(ValidationError::Required {
            field: "voids".to_string(),
        }),
        (OperationKind::Void, Some(_)) => {
            if op.delta == 0 {
                Err(ValidationError::InvalidDelta {
                    kind: op.kind.to_string(),
                    delta: 0,
                    reason: "must not be zero".to_string(),
                })
            } else {
                Ok(())
            }
        }
        (kind, Some(_)) => Err(ValidationError::InvalidFormat {
            field: "voids".to_string(),
            reason: format!("only void operations may reference a target, not {}", kind),
        }),
        (kind, None) => validate_delta(kind, op.delta),
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
