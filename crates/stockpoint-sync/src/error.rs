//! # Sync Error Types
//!
//! Error types for the ledger runtime and sync operations.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │   Transient     │  │     Remote              │ │
//! │  │                 │  │  (retried with  │  │                         │ │
//! │  │  InvalidConfig  │  │   backoff)      │  │  Rejected               │ │
//! │  │  MissingDeviceId│  │  ConnectionFail │  │  InvalidToken           │ │
//! │  │  ConfigLoad/Save│  │  Timeout        │  │                         │ │
//! │  │                 │  │  Offline        │  │                         │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │     Drain       │  │     Ledger      │  │      Internal           │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  SyncStalled    │  │  Core (conflict,│  │  ShuttingDown           │ │
//! │  │  DrainInProgress│  │   corruption)   │  │  ChannelError           │ │
//! │  │  Cancelled      │  │  Database       │  │                         │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Transient errors are handled inside the drain. Conflicts, corruption and
//! stalls are surfaced to the operator.

use thiserror::Error;

use stockpoint_core::types::OperationId;
use stockpoint_core::CoreError;
use stockpoint_db::DbError;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Sync error type covering ledger runtime and sync failures.
#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid sync configuration.
    #[error("Invalid sync configuration: {0}")]
    InvalidConfig(String),

    /// Missing device ID (required for causality tokens).
    #[error("Device ID not configured. Run initial setup first.")]
    MissingDeviceId,

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// Failed to save config file.
    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Transient Errors
    // =========================================================================
    /// The remote ledger could not be reached.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The remote ledger did not answer in time.
    #[error("Remote ledger timeout after {0} seconds")]
    Timeout(u64),

    /// The device has no network.
    #[error("Device is offline")]
    Offline,

    // =========================================================================
    // Remote Errors
    // =========================================================================
    /// The remote ledger refused an operation. Never retried blindly.
    #[error("Operation {id} rejected by remote ledger: {reason}")]
    Rejected { id: OperationId, reason: String },

    /// The remote ledger did not recognise a sync token.
    #[error("Invalid sync token: {0}")]
    InvalidToken(String),

    // =========================================================================
    // Drain Errors
    // =========================================================================
    /// Consecutive transient failures reached the stall threshold.
    ///
    /// ## When This Occurs
    /// ```text
    /// push ✗ ──backoff──► push ✗ ──backoff──► ... ──► push ✗ (n-th)
    ///                                                   │
    ///                                                   ▼
    ///                                     SyncStalled { failures: n }
    /// ```
    /// Entries stay `pending`; nothing is lost.
    #[error("Sync stalled after {failures} consecutive failures on {operation_id}: {last_error}")]
    SyncStalled {
        operation_id: OperationId,
        failures: u32,
        last_error: String,
    },

    /// Another drain of the same queue is running.
    #[error("A sync queue drain is already in progress")]
    DrainInProgress,

    /// The drain was cancelled by connectivity loss.
    #[error("Sync cancelled: connectivity lost")]
    Cancelled,

    // =========================================================================
    // Ledger Errors
    // =========================================================================
    /// Validation, conflict or corruption error from the ledger.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Persistence failure.
    #[error("Database error: {0}")]
    Database(#[from] DbError),

    /// Failed to serialize a payload.
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Internal sync agent error.
    #[error("Internal error: {0}")]
    Internal(String),

    /// The ledger task or agent is shutting down.
    #[error("Ledger runtime is shutting down")]
    ShuttingDown,

    /// Channel send/receive failed.
    #[error("Channel error: {0}")]
    ChannelError(String),
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::SerializationFailed(err.to_string())
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::ConfigSaveFailed(err.to_string())
    }
}

impl From<stockpoint_core::ValidationError> for SyncError {
    fn from(err: stockpoint_core::ValidationError) -> Self {
        SyncError::Core(CoreError::Validation(err))
    }
}

// =============================================================================
// Error Categorization (for retry logic)
// =============================================================================

impl SyncError {
    /// Returns true if the drain should back off and retry.
    ///
    /// ## Transient Errors
    /// - Connection failures (network issues)
    /// - Timeouts
    /// - Offline device
    ///
    /// ## Everything Else
    /// - Rejections go to the Reconciler
    /// - Configuration, corruption and conflicts need a human
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SyncError::ConnectionFailed(_) | SyncError::Timeout(_) | SyncError::Offline
        )
    }

    /// Returns true if the local log failed its replay checks and has to be
    /// rebuilt from the remote ledger.
    pub fn is_replay_corruption(&self) -> bool {
        matches!(
            self,
            SyncError::Core(CoreError::ReplayCorruption { .. })
                | SyncError::Database(DbError::Ledger(CoreError::ReplayCorruption { .. }))
        )
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidConfig(_)
                | SyncError::MissingDeviceId
                | SyncError::ConfigLoadFailed(_)
                | SyncError::ConfigSaveFailed(_)
        )
    }

    /// Returns true if an operator has to see this error.
    pub fn requires_operator(&self) -> bool {
        match self {
            SyncError::Core(err) => err.requires_operator(),
            SyncError::Database(DbError::Ledger(err)) => err.requires_operator(),
            SyncError::SyncStalled { .. } => true,
            _ => false,
        }
    }
}
