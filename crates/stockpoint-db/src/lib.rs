//! # stockpoint-db: Database Layer for Stockpoint
//!
//! Persists one device's inventory ledger in SQLite via sqlx.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Stockpoint Data Flow                             │
//! │                                                                         │
//! │  LedgerHandle (stockpoint-sync)                                        │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                  stockpoint-db (THIS CRATE)                     │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐    ┌────────────────┐   ┌──────────────┐  │   │
//! │  │   │   Database    │    │  Repositories  │   │  Migrations  │  │   │
//! │  │   │   (pool.rs)   │    │                │   │  (embedded)  │  │   │
//! │  │   │               │    │ operations     │   │              │  │   │
//! │  │   │ SqlitePool    │◄───│ projection     │   │001_ledger.sql│  │   │
//! │  │   │               │    │ sync_queue     │   │              │  │   │
//! │  │   └───────▲───────┘    │ conflicts/meta │   └──────────────┘  │   │
//! │  │           │            └────────────────┘                     │   │
//! │  │   ┌───────┴────────┐                                          │   │
//! │  │   │  LedgerStore   │  transactions around ledger writes       │   │
//! │  │   └────────────────┘                                          │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  SQLite database file (one per device)                                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use stockpoint_db::{Database, DbConfig, LedgerStore};
//!
//! let db = Database::new(DbConfig::new("ledger.db")).await?;
//! let store = LedgerStore::new(db);
//! let restored = store.open("store-1", "device-a").await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod migrations;
pub mod pool;
pub mod repository;
pub mod store;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{DbError, DbResult};
pub use pool::{Database, DbConfig};
pub use store::LedgerStore;

pub use repository::conflicts::ConflictRepository;
pub use repository::meta::MetaRepository;
pub use repository::operations::{OperationRepository, StoredOperation};
pub use repository::projection::ProjectionRepository;
pub use repository::sync_queue::{QueueCounts, SyncQueueRepository};
