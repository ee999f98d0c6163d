//! # Remote Ledger
//!
//! The shared inventory record every device of a store syncs with. Only
//! the seam lives here; storage behind it belongs to another service.
//!
//! ## Protocol
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Device                                   Remote ledger                 │
//! │                                                                         │
//! │  push([op], since = token)   ───────────►  append unless id is known    │
//! │                              ◄───────────  PushAck { accepted,          │
//! │                                                      rejected,          │
//! │                                                      new_token }        │
//! │                                                                         │
//! │  fetch_since(token)          ───────────►  everything after token       │
//! │                              ◄───────────  RemoteBatch { operations,    │
//! │                                                          new_token }    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Push is idempotent by operation id: re-sending an acknowledged id is
//! acknowledged again without a second append, and a refused id is refused
//! again. That is what makes a cancelled drain safe to retry.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use stockpoint_core::ledger::RejectedOperation;
use stockpoint_core::types::{Operation, OperationId, SyncToken};

use crate::error::{SyncError, SyncResult};

// =============================================================================
// Wire Types
// =============================================================================

/// Acknowledgement of a push.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushAck {
    pub accepted: Vec<OperationId>,
    pub rejected: Vec<RejectedOperation>,
    /// Head of the remote log after the push, when the pusher was current.
    /// Informational: the device still fetches with its own token.
    pub new_token: Option<SyncToken>,
}

/// Operations fetched since a token.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteBatch {
    pub operations: Vec<Operation>,
    pub new_token: Option<SyncToken>,
}

// =============================================================================
// Remote Ledger Trait
// =============================================================================

/// Remote inventory record.
#[async_trait]
pub trait RemoteLedger: Send + Sync {
    /// Submits local operations. Must be idempotent by operation id.
    async fn push(&self, operations: &[Operation], since: Option<&SyncToken>) -> SyncResult<PushAck>;

    /// Returns operations recorded after `token` (all of them for `None`).
    async fn fetch_since(&self, token: Option<&SyncToken>) -> SyncResult<RemoteBatch>;
}

// =============================================================================
// In-Memory Remote Ledger
// =============================================================================

#[derive(Debug, Default)]
struct MemoryState {
    operations: Vec<Operation>,
    accepted: HashSet<OperationId>,
    refused: HashMap<OperationId, String>,
    rejected_skus: HashMap<String, String>,
    offline: bool,
    failures_to_inject: u32,
    push_calls: u32,
}

impl MemoryState {
    fn token(&self) -> SyncToken {
        SyncToken::new(format!("r{}", self.operations.len()))
    }

    fn position(&self, token: Option<&SyncToken>) -> SyncResult<usize> {
        let Some(token) = token else {
            return Ok(0);
        };
        token
            .as_str()
            .strip_prefix('r')
            .and_then(|n| n.parse::<usize>().ok())
            .filter(|n| *n <= self.operations.len())
            .ok_or_else(|| SyncError::InvalidToken(token.to_string()))
    }

    fn check_reachable(&mut self) -> SyncResult<()> {
        if self.offline {
            return Err(SyncError::ConnectionFailed("remote ledger unreachable".into()));
        }
        if self.failures_to_inject > 0 {
            self.failures_to_inject -= 1;
            return Err(SyncError::ConnectionFailed("injected failure".into()));
        }
        Ok(())
    }
}

/// In-process remote ledger.
///
/// Clones share one record, so several devices of a store can sync through
/// it. Rejection rules and failure injection exist for tests and demos.
#[derive(Debug, Clone, Default)]
pub struct MemoryRemoteLedger {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryRemoteLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuses every future operation on `sku`.
    pub async fn reject_sku(&self, sku: impl Into<String>, reason: impl Into<String>) {
        self.state
            .lock()
            .await
            .rejected_skus
            .insert(sku.into(), reason.into());
    }

    /// Makes every call fail with a connection error until switched back.
    pub async fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().await.offline = unreachable;
    }

    /// Makes the next `count` calls fail with a connection error.
    pub async fn inject_failures(&self, count: u32) {
        self.state.lock().await.failures_to_inject = count;
    }

    /// Accepted operations in remote order.
    pub async fn operations(&self) -> Vec<Operation> {
        self.state.lock().await.operations.clone()
    }

    /// Number of push requests received, failed ones included.
    pub async fn push_calls(&self) -> u32 {
        self.state.lock().await.push_calls
    }
}

#[async_trait]
impl RemoteLedger for MemoryRemoteLedger {
    async fn push(&self, operations: &[Operation], since: Option<&SyncToken>) -> SyncResult<PushAck> {
        let mut state = self.state.lock().await;
        state.push_calls += 1;
        state.check_reachable()?;

        let current = since.map_or(true, |token| *token == state.token())
            && (since.is_some() || state.operations.is_empty());
        let mut ack = PushAck::default();

        for op in operations {
            if state.accepted.contains(&op.id) {
                debug!(id = %op.id, "Re-acknowledging known operation");
                ack.accepted.push(op.id.clone());
                continue;
            }
            if let Some(reason) = state.refused.get(&op.id) {
                ack.rejected.push(RejectedOperation {
                    id: op.id.clone(),
                    reason: Some(reason.clone()),
                });
                continue;
            }
            if let Some(reason) = state.rejected_skus.get(&op.sku).cloned() {
                warn!(id = %op.id, sku = %op.sku, reason = %reason, "Refusing operation");
                state.refused.insert(op.id.clone(), reason.clone());
                ack.rejected.push(RejectedOperation {
                    id: op.id.clone(),
                    reason: Some(reason),
                });
                continue;
            }

            state.accepted.insert(op.id.clone());
            state.operations.push(op.clone());
            ack.accepted.push(op.id.clone());
        }

        if current {
            ack.new_token = Some(state.token());
        }
        Ok(ack)
    }

    async fn fetch_since(&self, token: Option<&SyncToken>) -> SyncResult<RemoteBatch> {
        let mut state = self.state.lock().await;
        state.check_reachable()?;

        let from = state.position(token)?;
        Ok(RemoteBatch {
            operations: state.operations[from..].to_vec(),
            new_token: Some(state.token()),
        })
    }
}
