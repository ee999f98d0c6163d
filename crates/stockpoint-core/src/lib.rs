//! # stockpoint-core: Pure Ledger Logic for Stockpoint
//!
//! This crate is the **heart** of Stockpoint. It contains the inventory
//! ledger as pure, deterministic logic with zero I/O dependencies.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Stockpoint Architecture                          │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │              UI / analytics collaborators                       │   │
//! │  │    scan screen ──► refill screen ──► audit screen              │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │ LedgerHandle + Event Bus               │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │             stockpoint-sync (runtime, queue, agent)             │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │            ★ stockpoint-core (THIS CRATE) ★                     │   │
//! │  │                                                                 │   │
//! │  │   ┌──────────┐ ┌────────────┐ ┌───────────┐ ┌──────────────┐  │   │
//! │  │   │  oplog   │ │ projection │ │ reconcile │ │    audit     │  │   │
//! │  │   │ append   │ │ get/apply  │ │  merge    │ │   query      │  │   │
//! │  │   │ replay   │ │ rebuild    │ │ compensate│ │   (lazy)     │  │   │
//! │  │   └──────────┘ └────────────┘ └───────────┘ └──────────────┘  │   │
//! │  │   ┌──────────┐ ┌────────────┐ ┌───────────┐ ┌──────────────┐  │   │
//! │  │   │  events  │ │   clock    │ │   chain   │ │    ledger    │  │   │
//! │  │   └──────────┘ └────────────┘ └───────────┘ └──────────────┘  │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO DATABASE • NO NETWORK • DETERMINISTIC            │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                 stockpoint-db (Database Layer)                  │   │
//! │  │        operations, projection cache, sync queue, conflicts      │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Domain types (Operation, ProjectionEntry, ConflictRecord, ...)
//! - [`error`] - Domain error types
//! - [`validation`] - Field and delta rules
//! - [`clock`] - Per-device causality tokens
//! - [`chain`] - Hash chain over persisted operations
//! - [`oplog`] - Append-only Operation Log and replay
//! - [`projection`] - Local Projection
//! - [`reconcile`] - Deterministic merge with remote operations
//! - [`audit`] - Audit Trail queries
//! - [`events`] - In-process Event Bus
//! - [`scan`] - Decoded barcode input
//! - [`ledger`] - Per-store ledger tying the pieces together
//!
//! ## Design Principles
//!
//! 1. **Append-only**: operations are never mutated or removed, only voided
//! 2. **Deterministic**: every device derives the same merge from the same inputs
//! 3. **No I/O**: timestamps are passed in, never read from the wall clock
//! 4. **Explicit Errors**: all errors are typed, never strings or panics
//!
//! ## Example Usage
//!
//! ```rust
//! use chrono::Utc;
//! use stockpoint_core::ledger::Ledger;
//! use stockpoint_core::types::OperationDraft;
//!
//! let mut ledger = Ledger::new("store-1", "device-a");
//! ledger.append(OperationDraft::refill("COKE-330", 8, "promoter-1"), Utc::now()).unwrap();
//! ledger.append(OperationDraft::scan_out("COKE-330", 2, "promoter-1"), Utc::now()).unwrap();
//!
//! assert_eq!(ledger.projection().quantity("COKE-330"), 6);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod audit;
pub mod chain;
pub mod clock;
pub mod error;
pub mod events;
pub mod ledger;
pub mod oplog;
pub mod projection;
pub mod reconcile;
pub mod scan;
pub mod types;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use error::{CoreError, CoreResult, ValidationError};
pub use ledger::Ledger;
pub use types::*;

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Largest absolute quantity change a single operation may carry.
///
/// Catches mistyped counts (99999 instead of 9) at the door.
pub const MAX_OPERATION_DELTA: i64 = 99_999;

/// Maximum SKU length.
pub const MAX_SKU_LENGTH: usize = 50;

/// Maximum promoter id length.
pub const MAX_ACTOR_LENGTH: usize = 100;

/// Maximum free-text reason length.
pub const MAX_REASON_LENGTH: usize = 500;
