//! In-process local store shared by several tabs.
//!
//! [`SharedMemoryStore`] plays the role of one browser profile's storage
//! area; each [`TabLocalStore`] is one tab's view of it. Every write made
//! through a tab is broadcast as a [`StorageEvent`] tagged with that tab,
//! which is exactly the signal the cross-tab bridge consumes.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use kvsync_core::{KvResult, StorageEvent, StorageSignal, StoreError, TabId};
use tokio::sync::broadcast;
use tracing::debug;

use super::LocalStore;

/// Default capacity of the storage event channel.
const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Storage area shared by every tab created from it.
pub struct SharedMemoryStore {
    records: RwLock<HashMap<String, String>>,
    events: broadcast::Sender<StorageEvent>,
    /// Maximum total size of keys plus values, in bytes.
    quota_bytes: Option<usize>,
}

impl SharedMemoryStore {
    /// Create an unbounded store.
    pub fn new() -> Arc<Self> {
        Self::with_options(DEFAULT_EVENT_CAPACITY, None)
    }

    /// Create a store whose total size may not exceed `quota_bytes`.
    ///
    /// Writes that would exceed the quota fail like a browser's
    /// `QuotaExceededError`.
    pub fn with_quota(quota_bytes: usize) -> Arc<Self> {
        Self::with_options(DEFAULT_EVENT_CAPACITY, Some(quota_bytes))
    }

    /// Create a store with an explicit event channel capacity and quota.
    pub fn with_options(event_capacity: usize, quota_bytes: Option<usize>) -> Arc<Self> {
        let (events, _rx) = broadcast::channel(event_capacity.max(1));
        Arc::new(Self {
            records: RwLock::new(HashMap::new()),
            events,
            quota_bytes,
        })
    }

    /// Open a tab view of this storage area.
    pub fn tab(self: &Arc<Self>, tab_id: TabId) -> TabLocalStore {
        TabLocalStore {
            shared: Arc::clone(self),
            tab_id,
        }
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total size of keys plus values, in bytes.
    pub fn used_bytes(&self) -> usize {
        self.records
            .read()
            .map(|r| r.iter().map(|(k, v)| k.len() + v.len()).sum())
            .unwrap_or(0)
    }

    fn notify(&self, event: StorageEvent) {
        // No receivers just means no other tab is listening.
        let receivers = self.events.send(event).unwrap_or(0);
        debug!(receivers = receivers, "Emitted storage event");
    }
}

impl std::fmt::Debug for SharedMemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedMemoryStore")
            .field("records", &self.len())
            .field("quota_bytes", &self.quota_bytes)
            .finish()
    }
}

/// One tab's view of a [`SharedMemoryStore`].
#[derive(Debug, Clone)]
pub struct TabLocalStore {
    shared: Arc<SharedMemoryStore>,
    tab_id: TabId,
}

impl TabLocalStore {
    pub fn tab_id(&self) -> TabId {
        self.tab_id
    }

    /// The storage area this tab belongs to.
    pub fn shared(&self) -> &Arc<SharedMemoryStore> {
        &self.shared
    }
}

impl LocalStore for TabLocalStore {
    fn get_item(&self, key: &str) -> KvResult<Option<String>> {
        let records = self
            .shared
            .records
            .read()
            .map_err(|_| StoreError::LockPoisoned)?;
        Ok(records.get(key).cloned())
    }

    // Events are emitted with the records lock held so that their order
    // matches the order of the writes.
    fn set_item(&self, key: &str, value: &str) -> KvResult<()> {
        let mut records = self
            .shared
            .records
            .write()
            .map_err(|_| StoreError::LockPoisoned)?;

        if let Some(quota) = self.shared.quota_bytes {
            let current: usize = records
                .iter()
                .filter(|(k, _)| k.as_str() != key)
                .map(|(k, v)| k.len() + v.len())
                .sum();
            let needed = current + key.len() + value.len();
            if needed > quota {
                return Err(StoreError::LocalWriteFailed {
                    key: key.to_string(),
                    reason: format!("quota exceeded: {} of {} bytes", needed, quota),
                }
                .into());
            }
        }

        records.insert(key.to_string(), value.to_string());
        self.shared.notify(StorageEvent::new(key, Some(value), self.tab_id));
        Ok(())
    }

    fn remove_item(&self, key: &str) -> KvResult<()> {
        let mut records = self
            .shared
            .records
            .write()
            .map_err(|_| StoreError::LockPoisoned)?;
        if records.remove(key).is_some() {
            self.shared.notify(StorageEvent::new(key, None, self.tab_id));
        }
        Ok(())
    }
}

impl StorageSignal for TabLocalStore {
    fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
        self.shared.events.subscribe()
    }
}
