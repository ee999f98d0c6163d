//! # Sync Queue
//!
//! Drains the durable outbox of local operations to the remote ledger.
//!
//! ## Drain Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          SyncQueue::drain                               │
//! │                                                                         │
//! │  gate.try_lock() ──busy──► DrainInProgress                              │
//! │        │                                                                │
//! │        ▼                                                                │
//! │  next_pending(batch_size)   (log order)                                 │
//! │        │                                                                │
//! │        ▼  one entry at a time                                           │
//! │  ┌───────────┐  push   ┌──────────────┐                                 │
//! │  │ in_flight │────────►│ RemoteLedger │                                 │
//! │  └───────────┘         └──────┬───────┘                                 │
//! │        ▲                      │                                         │
//! │        │        ┌─────────────┼───────────────┬──────────────────┐      │
//! │        │        ▼             ▼               ▼                  ▼      │
//! │        │   accepted       rejected        transient         offline    │
//! │        │   confirmed      rejected        pending +         pending +  │
//! │        │                  (reported)      backoff           Cancelled  │
//! │        │                                     │                          │
//! │        └─────────────────────────────────────┘                          │
//! │                    n consecutive failures ──► SyncStalled               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Rejected entries are never retried; the Reconciler compensates them.
//! Push is idempotent by operation id, so an entry cancelled mid-flight is
//! simply pushed again next time.

use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use stockpoint_core::ledger::RejectedOperation;
use stockpoint_core::types::{Operation, OperationId, SyncToken};
use stockpoint_db::{Database, DbError, QueueCounts};

use crate::config::SyncConfig;
use crate::connectivity::ConnectivitySignal;
use crate::error::{SyncError, SyncResult};
use crate::remote::RemoteLedger;

// =============================================================================
// Drain Settings
// =============================================================================

/// Limits applied to one drain.
#[derive(Debug, Clone)]
pub struct DrainSettings {
    /// Entries considered per drain.
    pub batch_size: u32,
    pub push_timeout: Duration,
    /// Consecutive transient failures before giving up with `SyncStalled`.
    pub stall_after_failures: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for DrainSettings {
    fn default() -> Self {
        DrainSettings {
            batch_size: 100,
            push_timeout: Duration::from_secs(10),
            stall_after_failures: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(60),
        }
    }
}

impl DrainSettings {
    pub fn from_config(config: &SyncConfig) -> Self {
        DrainSettings {
            batch_size: config.sync.batch_size,
            push_timeout: config.push_timeout(),
            stall_after_failures: config.sync.stall_after_failures,
            initial_backoff: Duration::from_millis(config.sync.initial_backoff_ms),
            max_backoff: Duration::from_secs(config.sync.max_backoff_secs),
        }
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.initial_backoff,
            max_interval: self.max_backoff,
            multiplier: 2.0,
            max_elapsed_time: None, // stalls are counted, not timed
            ..Default::default()
        }
    }
}

// =============================================================================
// Drain Report
// =============================================================================

/// What one drain achieved.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainReport {
    /// Acknowledged by the remote ledger, in push order.
    pub confirmed: Vec<OperationId>,
    /// Refused by the remote ledger; the Reconciler compensates these.
    pub rejected: Vec<RejectedOperation>,
    /// Push requests sent, retries included.
    pub pushes: u32,
    /// Entries still pending or in flight afterwards.
    pub remaining: u64,
    /// Last head token handed out with an acknowledgement.
    pub token: Option<SyncToken>,
}

impl DrainReport {
    /// Number of entries settled by this drain.
    pub fn settled(&self) -> usize {
        self.confirmed.len() + self.rejected.len()
    }
}

enum PushOutcome {
    Confirmed(Option<SyncToken>),
    Rejected(RejectedOperation),
    Failed(SyncError),
}

// =============================================================================
// Sync Queue
// =============================================================================

/// Drain side of the per-device sync queue.
///
/// Enqueueing happens in the same transaction as the operation append
/// (see `LedgerStore::append_local`); this type only moves entries out.
#[derive(Debug, Clone)]
pub struct SyncQueue {
    db: Database,
    settings: DrainSettings,
    gate: Arc<Mutex<()>>,
}

impl SyncQueue {
    pub fn new(db: Database, settings: DrainSettings) -> Self {
        SyncQueue {
            db,
            settings,
            gate: Arc::new(Mutex::new(())),
        }
    }

    pub fn settings(&self) -> &DrainSettings {
        &self.settings
    }

    pub async fn counts(&self) -> SyncResult<QueueCounts> {
        Ok(self.db.sync_queue().counts().await?)
    }

    /// Returns entries left `in_flight` by a crash to `pending`.
    ///
    /// Waits for a running drain, whose in-flight entries are live.
    pub async fn recover(&self) -> SyncResult<u64> {
        let _gate = self.gate.lock().await;
        Ok(self.db.sync_queue().reset_in_flight().await?)
    }

    /// Deletes confirmed entries and compensated rejections. The operations
    /// stay in the log.
    pub async fn prune_settled(&self) -> SyncResult<u64> {
        Ok(self.db.sync_queue().prune_settled().await?)
    }

    /// Pushes pending entries in log order, one at a time.
    ///
    /// ## Errors
    /// - `DrainInProgress` if another drain holds the gate
    /// - `Offline` if the device is offline when the drain starts
    /// - `Cancelled` if connectivity drops mid-drain
    /// - `SyncStalled` after `stall_after_failures` consecutive failures
    pub async fn drain(
        &self,
        remote: &dyn RemoteLedger,
        since: Option<&SyncToken>,
        connectivity: &mut ConnectivitySignal,
    ) -> SyncResult<DrainReport> {
        let _gate = self.gate.try_lock().map_err(|_| SyncError::DrainInProgress)?;

        if !connectivity.is_online() {
            return Err(SyncError::Offline);
        }

        let entries = self.db.sync_queue().next_pending(self.settings.batch_size).await?;
        let mut report = DrainReport::default();
        if entries.is_empty() {
            debug!("Sync queue empty, nothing to drain");
            return Ok(report);
        }

        info!(count = entries.len(), "Draining sync queue");

        let mut backoff = self.settings.backoff();
        let mut failures = 0u32;

        for entry in entries {
            let operation = self
                .db
                .operations()
                .get(&entry.operation_id)
                .await?
                .ok_or_else(|| DbError::not_found("operation", entry.operation_id.clone()))?
                .record
                .operation;

            loop {
                report.pushes += 1;
                match self.push_one(remote, &operation, since, connectivity).await? {
                    PushOutcome::Confirmed(token) => {
                        debug!(operation_id = %operation.id, sku = %operation.sku, "Operation confirmed");
                        report.confirmed.push(operation.id.clone());
                        if token.is_some() {
                            report.token = token;
                        }
                        break;
                    }
                    PushOutcome::Rejected(rejected) => {
                        report.rejected.push(rejected);
                        break;
                    }
                    PushOutcome::Failed(err) => {
                        failures += 1;
                        if failures >= self.settings.stall_after_failures {
                            warn!(
                                operation_id = %operation.id,
                                failures,
                                error = %err,
                                "Sync stalled"
                            );
                            return Err(SyncError::SyncStalled {
                                operation_id: operation.id.clone(),
                                failures,
                                last_error: err.to_string(),
                            });
                        }

                        let delay = backoff.next_backoff().unwrap_or(self.settings.max_backoff);
                        warn!(
                            operation_id = %operation.id,
                            attempt = failures,
                            ?delay,
                            error = %err,
                            "Push failed, backing off"
                        );
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = connectivity.offline() => {
                                info!("Connectivity lost during backoff, cancelling drain");
                                return Err(SyncError::Cancelled);
                            }
                        }
                    }
                }
            }

            // Any acknowledgement, even a refusal, ends a failure streak.
            failures = 0;
            backoff.reset();
        }

        report.remaining = self.counts().await?.outstanding();
        info!(
            confirmed = report.confirmed.len(),
            rejected = report.rejected.len(),
            remaining = report.remaining,
            "Drain complete"
        );
        Ok(report)
    }

    async fn push_one(
        &self,
        remote: &dyn RemoteLedger,
        operation: &Operation,
        since: Option<&SyncToken>,
        connectivity: &mut ConnectivitySignal,
    ) -> SyncResult<PushOutcome> {
        let queue = self.db.sync_queue();
        let ids = [operation.id.clone()];
        queue.mark_in_flight(&ids, Utc::now()).await?;

        let pushed = tokio::select! {
            pushed = tokio::time::timeout(
                self.settings.push_timeout,
                remote.push(std::slice::from_ref(operation), since),
            ) => pushed,
            _ = connectivity.offline() => {
                queue.release(&ids, Some("connectivity lost")).await?;
                info!(operation_id = %operation.id, "Connectivity lost mid-push, cancelling drain");
                return Err(SyncError::Cancelled);
            }
        };
        let result = pushed.unwrap_or(Err(SyncError::Timeout(self.settings.push_timeout.as_secs())));

        match result {
            Ok(ack) => {
                if ack.accepted.contains(&operation.id) {
                    queue.confirm(&ids).await?;
                    return Ok(PushOutcome::Confirmed(ack.new_token));
                }
                if let Some(rejected) = ack.rejected.into_iter().find(|r| r.id == operation.id) {
                    queue.reject(&operation.id, rejected.reason.as_deref()).await?;
                    return Ok(PushOutcome::Rejected(rejected));
                }
                let err = SyncError::ConnectionFailed("push was not acknowledged".into());
                queue.release(&ids, Some(&err.to_string())).await?;
                Ok(PushOutcome::Failed(err))
            }
            Err(SyncError::Rejected { id, reason }) if id == operation.id => {
                queue.reject(&id, Some(&reason)).await?;
                Ok(PushOutcome::Rejected(RejectedOperation {
                    id,
                    reason: Some(reason),
                }))
            }
            Err(err) if err.is_transient() => {
                queue.release(&ids, Some(&err.to_string())).await?;
                Ok(PushOutcome::Failed(err))
            }
            Err(err) => {
                queue.release(&ids, Some(&err.to_string())).await?;
                Err(err)
            }
        }
    }
}
