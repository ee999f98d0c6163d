//! # Sync Agent
//!
//! Runs sync cycles against the remote ledger and reports their status.
//!
//! ## Sync Cycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          SyncAgent::run_cycle                           │
//! │                                                                         │
//! │  1. drain      SyncQueue ──push one at a time──► RemoteLedger           │
//! │                  └─► DrainReport { confirmed, rejected }                │
//! │                                                                         │
//! │  2. fetch      RemoteLedger::fetch_since(ledger token)                  │
//! │                  └─► RemoteBatch { operations, new_token }              │
//! │                                                                         │
//! │  3. reconcile  LedgerHandle::reconcile(SyncRound {                      │
//! │                    accepted, rejected, remote, token })                 │
//! │                  └─► merged / compensated / manual_review               │
//! │                                                                         │
//! │  4. prune      confirmed queue entries are dropped                      │
//! │                                                                         │
//! │  5. report     SyncStatus ──► SyncEventEmitter (UI)                     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Triggers
//! ```text
//! AUTO     poll interval tick, connectivity regained, sync_now
//! MANUAL   sync_now
//! OFFLINE  nothing; the agent does not start
//! ```
//!
//! Cycles never overlap: a second one fails fast with `DrainInProgress`.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use stockpoint_core::ledger::{ReconcileSummary, SyncRound};
use stockpoint_core::types::{OperationId, SyncToken};
use stockpoint_db::{Database, LedgerStore};

use crate::config::{SyncConfig, SyncMode};
use crate::connectivity::{ConnectivityMonitor, ConnectivitySignal};
use crate::error::{SyncError, SyncResult};
use crate::ledger::LedgerHandle;
use crate::queue::{DrainReport, DrainSettings, SyncQueue};
use crate::remote::{RemoteBatch, RemoteLedger};

// =============================================================================
// Sync Status
// =============================================================================

/// Current sync status for external queries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncStatus {
    /// Whether the device currently has connectivity.
    pub online: bool,

    /// Sync mode.
    pub mode: SyncMode,

    /// Queue entries waiting to be pushed.
    pub pending: u64,

    /// Queue entries pushed but not acknowledged.
    pub in_flight: u64,

    /// Conflicts waiting for an operator.
    pub open_conflicts: usize,

    /// Last completed cycle.
    pub last_sync: Option<DateTime<Utc>>,

    /// Last error message (if any).
    pub last_error: Option<String>,

    /// Operation the queue is stuck on, after a stall.
    pub stalled: Option<OperationId>,

    /// Log version at the last reconciliation.
    pub sync_point: u64,
}

// =============================================================================
// Event Emitter Trait
// =============================================================================

/// Trait for surfacing sync state to a UI.
pub trait SyncEventEmitter: Send + Sync {
    /// Emits a sync status change event.
    fn emit_status(&self, status: &SyncStatus);

    /// Emits a sync progress event.
    fn emit_progress(&self, pending: u64, synced: u64);

    /// Emits a sync error event.
    fn emit_error(&self, message: &str, retryable: bool);
}

/// No-op event emitter for testing.
pub struct NoOpEmitter;

impl SyncEventEmitter for NoOpEmitter {
    fn emit_status(&self, _status: &SyncStatus) {}
    fn emit_progress(&self, _pending: u64, _synced: u64) {}
    fn emit_error(&self, _message: &str, _retryable: bool) {}
}

/// Outcome of one completed cycle.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub drain: DrainReport,
    pub fetched: usize,
    pub summary: ReconcileSummary,
}

// =============================================================================
// Cycle
// =============================================================================

/// Everything one cycle touches. Shared between the agent and its loop.
#[derive(Clone)]
struct Cycle {
    ledger: LedgerHandle,
    queue: SyncQueue,
    remote: Arc<dyn RemoteLedger>,
    connectivity: ConnectivitySignal,
    status: Arc<RwLock<SyncStatus>>,
    emitter: Arc<dyn SyncEventEmitter>,
    gate: Arc<Mutex<()>>,
    fetch_timeout: Duration,
}

impl Cycle {
    async fn run(&self) -> SyncResult<CycleReport> {
        let _gate = self.gate.try_lock().map_err(|_| SyncError::DrainInProgress)?;

        match self.sync().await {
            Ok(report) => {
                self.record_success(&report).await;
                Ok(report)
            }
            Err(err) => {
                self.record_failure(&err).await;
                Err(err)
            }
        }
    }

    async fn sync(&self) -> SyncResult<CycleReport> {
        let mut signal = self.connectivity.clone();
        let cursor = self.ledger.cursor().await?;

        let drain = self
            .queue
            .drain(self.remote.as_ref(), cursor.token.as_ref(), &mut signal)
            .await?;

        let batch = match self.fetch(cursor.token.as_ref(), &mut signal).await {
            Err(SyncError::InvalidToken(token)) => {
                warn!(token = %token, "Remote ledger does not know our token, fetching everything");
                self.fetch(None, &mut signal).await?
            }
            other => other?,
        };
        let fetched = batch.operations.len();

        let round = SyncRound {
            accepted: drain.confirmed.clone(),
            rejected: drain.rejected.clone(),
            remote: batch.operations,
            token: batch.new_token.or(cursor.token),
        };
        let summary = self.ledger.reconcile(round).await?;

        let pruned = self.queue.prune_settled().await?;
        debug!(pruned, "Pruned settled queue entries");

        Ok(CycleReport {
            drain,
            fetched,
            summary,
        })
    }

    async fn fetch(
        &self,
        token: Option<&SyncToken>,
        signal: &mut ConnectivitySignal,
    ) -> SyncResult<RemoteBatch> {
        tokio::select! {
            fetched = tokio::time::timeout(self.fetch_timeout, self.remote.fetch_since(token)) => {
                fetched.unwrap_or(Err(SyncError::Timeout(self.fetch_timeout.as_secs())))
            }
            _ = signal.offline() => Err(SyncError::Cancelled),
        }
    }

    async fn record_success(&self, report: &CycleReport) {
        let synced = report.drain.confirmed.len() as u64;
        let status = {
            let mut s = self.status.write().await;
            s.last_sync = Some(Utc::now());
            s.last_error = None;
            s.stalled = None;
            s.sync_point = report.summary.sync_point;
            self.refresh(&mut s).await;
            s.clone()
        };

        info!(
            confirmed = synced,
            rejected = report.drain.rejected.len(),
            fetched = report.fetched,
            conflicts = report.summary.conflicts.len(),
            pending = status.pending,
            "Sync cycle complete"
        );
        self.emitter.emit_progress(status.pending, synced);
        self.emitter.emit_status(&status);
    }

    async fn record_failure(&self, err: &SyncError) {
        let status = {
            let mut s = self.status.write().await;
            s.last_error = Some(err.to_string());
            if let SyncError::SyncStalled { operation_id, .. } = err {
                s.stalled = Some(operation_id.clone());
            }
            self.refresh(&mut s).await;
            s.clone()
        };

        match err {
            SyncError::Offline | SyncError::Cancelled => debug!(error = %err, "Sync cycle skipped"),
            SyncError::SyncStalled { .. } => error!(error = %err, "Sync stalled"),
            _ => warn!(error = %err, "Sync cycle failed"),
        }

        let retryable = err.is_transient() || matches!(err, SyncError::Cancelled);
        self.emitter.emit_error(&err.to_string(), retryable);
        self.emitter.emit_status(&status);
    }

    /// Re-reads counters; a failed read leaves the previous values.
    async fn refresh(&self, status: &mut SyncStatus) {
        status.online = self.connectivity.is_online();

        match self.queue.counts().await {
            Ok(counts) => {
                status.pending = counts.pending;
                status.in_flight = counts.in_flight;
            }
            Err(e) => warn!(error = %e, "Could not read queue counts"),
        }
        match self.ledger.open_conflicts().await {
            Ok(open) => status.open_conflicts = open.len(),
            Err(e) => warn!(error = %e, "Could not read open conflicts"),
        }
    }

    async fn set_online(&self, online: bool) {
        let status = {
            let mut s = self.status.write().await;
            s.online = online;
            s.clone()
        };
        self.emitter.emit_status(&status);
    }

    /// Runs a cycle from the background loop, where errors end in the status.
    async fn run_in_background(&self, trigger: &'static str) {
        if !self.connectivity.is_online() {
            debug!(trigger, "Offline, skipping sync cycle");
            return;
        }
        debug!(trigger, "Starting sync cycle");
        let _ = self.run().await;
    }
}

// =============================================================================
// Sync Agent
// =============================================================================

/// Main sync agent that orchestrates sync cycles.
pub struct SyncAgent {
    /// Sync configuration.
    config: Arc<SyncConfig>,

    /// State shared with the background loop.
    cycle: Cycle,

    /// Shutdown sender.
    shutdown_tx: Option<mpsc::Sender<()>>,

    /// Manual trigger sender.
    trigger_tx: Option<mpsc::Sender<()>>,

    /// Background loop (set after start).
    task: Option<JoinHandle<()>>,
}

impl SyncAgent {
    /// Creates a new sync agent.
    pub fn new(
        config: SyncConfig,
        ledger: LedgerHandle,
        db: Database,
        remote: Arc<dyn RemoteLedger>,
        connectivity: ConnectivitySignal,
    ) -> Self {
        Self::from_parts(config, ledger, db, remote, Some(connectivity), None, None)
    }

    fn from_parts(
        config: SyncConfig,
        ledger: LedgerHandle,
        db: Database,
        remote: Arc<dyn RemoteLedger>,
        connectivity: Option<ConnectivitySignal>,
        emitter: Option<Arc<dyn SyncEventEmitter>>,
        drain: Option<DrainSettings>,
    ) -> Self {
        let connectivity = connectivity.unwrap_or_else(|| ConnectivityMonitor::new(true).signal());
        let settings = drain.unwrap_or_else(|| DrainSettings::from_config(&config));
        let status = SyncStatus {
            online: connectivity.is_online(),
            mode: config.mode(),
            ..Default::default()
        };

        let cycle = Cycle {
            ledger,
            queue: SyncQueue::new(db, settings),
            remote,
            connectivity,
            status: Arc::new(RwLock::new(status)),
            emitter: emitter.unwrap_or_else(|| Arc::new(NoOpEmitter)),
            gate: Arc::new(Mutex::new(())),
            fetch_timeout: config.push_timeout(),
        };

        SyncAgent {
            config: Arc::new(config),
            cycle,
            shutdown_tx: None,
            trigger_tx: None,
            task: None,
        }
    }

    /// Opens the configured database, starts the ledger and builds an agent.
    ///
    /// A log that fails its replay checks is rebuilt from `remote`
    /// (see [`LedgerHandle::resync_from_remote`]).
    pub async fn open(
        config: SyncConfig,
        remote: Arc<dyn RemoteLedger>,
        connectivity: ConnectivitySignal,
    ) -> SyncResult<(LedgerHandle, SyncAgent)> {
        config.validate()?;
        let db = Database::new(config.db_config()?).await?;
        let store = LedgerStore::new(db.clone());
        let ledger = match LedgerHandle::spawn(store.clone(), config.store_id(), config.device_id()).await {
            Err(err) if err.is_replay_corruption() => {
                error!(error = %err, "Local ledger failed replay, resyncing from remote ledger");
                LedgerHandle::resync_from_remote(
                    store,
                    config.store_id(),
                    config.device_id(),
                    remote.as_ref(),
                )
                .await?
            }
            other => other?,
        };

        let agent = SyncAgent::new(config, ledger.clone(), db, remote, connectivity);
        Ok((ledger, agent))
    }

    /// Returns the current sync status.
    pub async fn status(&self) -> SyncStatus {
        self.cycle.status.read().await.clone()
    }

    pub fn ledger(&self) -> &LedgerHandle {
        &self.cycle.ledger
    }

    pub fn queue(&self) -> &SyncQueue {
        &self.cycle.queue
    }

    /// Runs one cycle now, regardless of mode.
    pub async fn run_cycle(&self) -> SyncResult<CycleReport> {
        if !self.cycle.connectivity.is_online() {
            let err = SyncError::Offline;
            self.cycle.record_failure(&err).await;
            return Err(err);
        }
        self.cycle.run().await
    }

    /// Starts the background loop.
    ///
    /// Entries left in flight by a previous process are put back first.
    pub async fn start(&mut self) -> SyncResult<()> {
        let mode = self.config.mode();
        if !mode.is_sync_enabled() {
            info!("Sync is disabled (mode: offline)");
            return Ok(());
        }
        if self.task.is_some() {
            return Err(SyncError::Internal("sync agent already started".into()));
        }

        self.config.validate()?;

        let recovered = self.cycle.queue.recover().await?;
        if recovered > 0 {
            info!(recovered, "Returned interrupted pushes to the queue");
        }

        info!(
            device_id = %self.config.device_id(),
            store_id = %self.config.store_id(),
            mode = %mode,
            "Starting sync agent"
        );

        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let (trigger_tx, trigger_rx) = mpsc::channel(1);
        let poll = mode.polls().then(|| self.config.poll_interval());

        {
            let mut s = self.cycle.status.write().await;
            self.cycle.refresh(&mut s).await;
        }

        self.task = Some(tokio::spawn(Self::run_loop(
            self.cycle.clone(),
            poll,
            trigger_rx,
            shutdown_rx,
        )));
        self.shutdown_tx = Some(shutdown_tx);
        self.trigger_tx = Some(trigger_tx);

        info!("Sync agent started");
        Ok(())
    }

    /// Handle for a running agent; `None` before `start` or in offline mode.
    pub fn handle(&self) -> Option<SyncAgentHandle> {
        let shutdown_tx = self.shutdown_tx.clone()?;
        let trigger_tx = self.trigger_tx.clone()?;
        Some(SyncAgentHandle {
            shutdown_tx,
            trigger_tx,
            status: self.cycle.status.clone(),
        })
    }

    /// Stops the sync agent gracefully.
    pub async fn shutdown(&mut self) -> SyncResult<()> {
        info!("Shutting down sync agent");

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(()).await;
        }
        self.trigger_tx = None;

        if let Some(task) = self.task.take() {
            task.await
                .map_err(|e| SyncError::Internal(format!("sync loop panicked: {}", e)))?;
        }

        info!("Sync agent stopped");
        Ok(())
    }

    /// Main loop.
    async fn run_loop(
        cycle: Cycle,
        poll: Option<Duration>,
        mut trigger_rx: mpsc::Receiver<()>,
        mut shutdown_rx: mpsc::Receiver<()>,
    ) {
        let mut ticker = poll.map(|period| {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            interval
        });
        let mut connectivity = cycle.connectivity.clone();

        loop {
            tokio::select! {
                _ = next_tick(&mut ticker) => {
                    cycle.run_in_background("poll").await;
                }

                Some(()) = trigger_rx.recv() => {
                    cycle.run_in_background("sync_now").await;
                }

                online = connectivity.changed() => {
                    cycle.set_online(online).await;
                    if online && ticker.is_some() {
                        info!("Connectivity regained, syncing");
                        cycle.run_in_background("reconnect").await;
                    }
                }

                _ = shutdown_rx.recv() => {
                    info!("Sync loop received shutdown");
                    break;
                }
            }
        }

        info!("Sync loop stopped");
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

// =============================================================================
// Agent Handle (for external control)
// =============================================================================

/// Handle for controlling a running SyncAgent from outside.
#[derive(Clone)]
pub struct SyncAgentHandle {
    /// Shutdown sender.
    shutdown_tx: mpsc::Sender<()>,

    /// Manual trigger sender.
    trigger_tx: mpsc::Sender<()>,

    /// Status accessor.
    status: Arc<RwLock<SyncStatus>>,
}

impl SyncAgentHandle {
    /// Gets the current sync status.
    pub async fn status(&self) -> SyncStatus {
        self.status.read().await.clone()
    }

    /// Asks the loop for a cycle. A request already waiting absorbs this one.
    pub fn sync_now(&self) -> SyncResult<()> {
        match self.trigger_tx.try_send(()) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(())) => Ok(()),
            Err(mpsc::error::TrySendError::Closed(())) => Err(SyncError::ShuttingDown),
        }
    }

    /// Signals the agent to shut down gracefully.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(()).await;
    }
}

// =============================================================================
// Builder Pattern
// =============================================================================

/// Builder for creating SyncAgent with options.
pub struct SyncAgentBuilder {
    config: SyncConfig,
    ledger: Option<LedgerHandle>,
    db: Option<Database>,
    remote: Option<Arc<dyn RemoteLedger>>,
    connectivity: Option<ConnectivitySignal>,
    emitter: Option<Arc<dyn SyncEventEmitter>>,
    drain: Option<DrainSettings>,
}

impl SyncAgentBuilder {
    /// Creates a new builder with the given config.
    pub fn new(config: SyncConfig) -> Self {
        SyncAgentBuilder {
            config,
            ledger: None,
            db: None,
            remote: None,
            connectivity: None,
            emitter: None,
            drain: None,
        }
    }

    /// Sets the ledger the agent reconciles into.
    pub fn with_ledger(mut self, ledger: LedgerHandle) -> Self {
        self.ledger = Some(ledger);
        self
    }

    /// Sets the database holding the sync queue.
    pub fn with_database(mut self, db: Database) -> Self {
        self.db = Some(db);
        self
    }

    /// Sets the remote ledger.
    pub fn with_remote(mut self, remote: Arc<dyn RemoteLedger>) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Sets the connectivity signal. Without one the device counts as online.
    pub fn with_connectivity(mut self, connectivity: ConnectivitySignal) -> Self {
        self.connectivity = Some(connectivity);
        self
    }

    /// Sets the event emitter.
    pub fn with_emitter(mut self, emitter: Arc<dyn SyncEventEmitter>) -> Self {
        self.emitter = Some(emitter);
        self
    }

    /// Overrides the drain limits derived from the config.
    pub fn with_drain_settings(mut self, settings: DrainSettings) -> Self {
        self.drain = Some(settings);
        self
    }

    /// Builds the SyncAgent.
    pub fn build(self) -> SyncResult<SyncAgent> {
        let ledger = self
            .ledger
            .ok_or_else(|| SyncError::InvalidConfig("Ledger required".into()))?;
        let db = self
            .db
            .ok_or_else(|| SyncError::InvalidConfig("Database required".into()))?;
        let remote = self
            .remote
            .ok_or_else(|| SyncError::InvalidConfig("Remote ledger required".into()))?;

        Ok(SyncAgent::from_parts(
            self.config,
            ledger,
            db,
            remote,
            self.connectivity,
            self.emitter,
            self.drain,
        ))
    }
}
