//! # stockpoint-sync: Ledger Runtime and Sync Engine for Stockpoint
//!
//! Runs one store's ledger on a device and keeps it in step with the remote
//! inventory record. Devices work offline; operations queue locally and are
//! reconciled once connectivity returns.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Sync Layer Architecture                          │
//! │                                                                         │
//! │   scanner / UI                                                          │
//! │        │ append, record_scan, resolve_conflict, audit                   │
//! │        ▼                                                                │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                 LedgerHandle (single writer task)                │  │
//! │  │   Ledger (stockpoint-core)  ──persist──►  LedgerStore (SQLite)   │  │
//! │  └────────────────────────────▲─────────────────────────────────────┘  │
//! │                               │ reconcile(SyncRound)                    │
//! │  ┌────────────────────────────┴─────────────────────────────────────┐  │
//! │  │                           SyncAgent                              │  │
//! │  │                                                                  │  │
//! │  │   ┌────────────────┐  ┌────────────────┐  ┌─────────────────┐   │  │
//! │  │   │   SyncQueue    │  │  RemoteLedger  │  │  Connectivity   │   │  │
//! │  │   │                │  │                │  │                 │   │  │
//! │  │   │ drain in log   │─►│ push (by id,   │  │ watch channel;  │   │  │
//! │  │   │ order, backoff,│  │ idempotent)    │  │ offline cancels │   │  │
//! │  │   │ SyncStalled    │  │ fetch_since    │  │ a drain         │   │  │
//! │  │   └────────────────┘  └────────────────┘  └─────────────────┘   │  │
//! │  └──────────────────────────────────────────────────────────────────┘  │
//! │                                                                         │
//! │  STATUS (to a UI via SyncEventEmitter):                                │
//! │  • status   - online, pending, open conflicts, stalled operation       │
//! │  • progress - pending vs. confirmed in the last cycle                  │
//! │  • error    - cycle failures, with whether a retry may help            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`agent`] - `SyncAgent` cycle orchestrator and background loop
//! - [`config`] - Sync configuration (mode, device, store, database path)
//! - [`connectivity`] - Online/offline signal
//! - [`error`] - Sync error types
//! - [`ledger`] - `LedgerHandle`, the single-writer ledger runtime
//! - [`queue`] - `SyncQueue` drain with backoff and stall detection
//! - [`remote`] - `RemoteLedger` seam and an in-memory implementation
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use stockpoint_sync::{ConnectivityMonitor, MemoryRemoteLedger, SyncAgent, SyncConfig};
//! use stockpoint_core::types::OperationDraft;
//!
//! let config = SyncConfig::load_or_default(None);
//! let monitor = ConnectivityMonitor::new(true);
//! let remote = Arc::new(MemoryRemoteLedger::new());
//!
//! let (ledger, mut agent) = SyncAgent::open(config, remote, monitor.signal()).await?;
//! agent.start().await?;
//!
//! ledger.append(OperationDraft::scan_out("COKE-330", 2, "promoter-1")).await?;
//! let status = agent.status().await;
//! println!("Pending: {}", status.pending);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod agent;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod ledger;
pub mod queue;
pub mod remote;

// =============================================================================
// Re-exports
// =============================================================================

pub use agent::{
    CycleReport, NoOpEmitter, SyncAgent, SyncAgentBuilder, SyncAgentHandle, SyncEventEmitter,
    SyncStatus,
};
pub use config::{SyncConfig, SyncMode};
pub use connectivity::{ConnectivityMonitor, ConnectivitySignal};
pub use error::{SyncError, SyncResult};
pub use ledger::{LedgerHandle, SyncCursor};
pub use queue::{DrainReport, DrainSettings, SyncQueue};
pub use remote::{MemoryRemoteLedger, PushAck, RemoteBatch, RemoteLedger};
