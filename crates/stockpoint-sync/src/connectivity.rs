//! # Connectivity Signal
//!
//! Network availability as a boolean watch channel. Detection belongs to
//! the platform; it only flips the monitor.
//!
//! ```text
//!   platform probe ──set_online(bool)──► ConnectivityMonitor (watch::Sender)
//!                                              │
//!                         ┌────────────────────┼────────────────────┐
//!                         ▼                    ▼                    ▼
//!                 ConnectivitySignal   ConnectivitySignal   ConnectivitySignal
//!                   (SyncQueue drain)     (SyncAgent loop)       (UI)
//! ```
//!
//! When the monitor is dropped the last published value sticks.

use tokio::sync::watch;
use tracing::info;

/// Publisher side, owned by whatever detects the network.
#[derive(Debug)]
pub struct ConnectivityMonitor {
    tx: watch::Sender<bool>,
}

impl ConnectivityMonitor {
    pub fn new(online: bool) -> Self {
        let (tx, _rx) = watch::channel(online);
        ConnectivityMonitor { tx }
    }

    /// Publishes a new state. Repeating the current state wakes nobody.
    pub fn set_online(&self, online: bool) {
        let changed = self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            info!(online, "Connectivity changed");
        }
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn signal(&self) -> ConnectivitySignal {
        ConnectivitySignal {
            rx: self.tx.subscribe(),
        }
    }
}

/// Subscriber side. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ConnectivitySignal {
    rx: watch::Receiver<bool>,
}

impl ConnectivitySignal {
    pub fn is_online(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the device is offline (immediately if it already is).
    pub async fn offline(&mut self) {
        if self.rx.wait_for(|online| !*online).await.is_err() {
            std::future::pending::<()>().await;
        }
    }

    /// Resolves once the device is online (immediately if it already is).
    pub async fn online(&mut self) {
        if self.rx.wait_for(|online| *online).await.is_err() {
            std::future::pending::<()>().await;
        }
    }

    /// Resolves on the next state change and returns the new state.
    pub async fn changed(&mut self) -> bool {
        if self.rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
        *self.rx.borrow_and_update()
    }
}
