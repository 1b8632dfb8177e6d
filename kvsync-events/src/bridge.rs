//! Republishes other tabs' local-store writes onto the change bus.

use std::sync::Arc;

use kvsync_core::{EntryKey, StorageEvent, TabId};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bus::{ChangeBus, ChangeNotice};

/// What the bridge did with one storage event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeOutcome {
    /// Republished on the bus; carries the number of subscribers reached.
    Republished(usize),
    /// The event was this tab's own write and was dropped.
    OwnWrite,
    /// The event's key is not a valid entry key and was dropped.
    InvalidKey,
}

/// Cross-tab bridge for one tab.
///
/// The bridge never talks to the remote store: the tab that made the
/// original write already pushed it.
#[derive(Debug, Clone)]
pub struct CrossTabBridge {
    tab_id: TabId,
    bus: Arc<ChangeBus>,
}

impl CrossTabBridge {
    pub fn new(tab_id: TabId, bus: Arc<ChangeBus>) -> Self {
        Self { tab_id, bus }
    }

    pub fn tab_id(&self) -> TabId {
        self.tab_id
    }

    /// Handle one storage event.
    pub fn handle_event(&self, event: StorageEvent) -> BridgeOutcome {
        if event.origin == self.tab_id {
            debug!(key = %event.key, "Ignoring own storage write");
            return BridgeOutcome::OwnWrite;
        }
        let key = match EntryKey::new(event.key.as_str()) {
            Ok(key) => key,
            Err(e) => {
                debug!(key = %event.key, error = %e, "Ignoring storage event for invalid key");
                return BridgeOutcome::InvalidKey;
            }
        };
        let notice = ChangeNotice::cross_tab(key, event.origin, event.new_value);
        BridgeOutcome::Republished(self.bus.publish(notice))
    }

    /// Run the bridge on the current runtime until the event source closes.
    pub fn spawn(self, mut events: broadcast::Receiver<StorageEvent>) -> BridgeHandle {
        let tab_id = self.tab_id;
        let task = tokio::spawn(async move {
            info!(tab_id = %tab_id, "Cross-tab bridge started");
            loop {
                match events.recv().await {
                    Ok(event) => {
                        self.handle_event(event);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(
                            tab_id = %tab_id,
                            skipped = skipped,
                            "Cross-tab bridge lagged, some storage events were dropped"
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!(tab_id = %tab_id, "Storage event source closed");
                        break;
                    }
                }
            }
        });
        BridgeHandle { task: Some(task) }
    }
}

/// Running bridge task. Dropping the handle stops the bridge.
#[derive(Debug)]
pub struct BridgeHandle {
    task: Option<JoinHandle<()>>,
}

impl BridgeHandle {
    /// Whether the bridge task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map(|t| t.is_finished()).unwrap_or(true)
    }

    /// Stop the bridge.
    pub fn shutdown(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for BridgeHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
