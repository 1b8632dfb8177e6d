//! Cross-process storage change signal.
//!
//! Several processes ("tabs") may share one local store. When one of them
//! writes a key, the others learn about it through a [`StorageSignal`]. The
//! writer itself is identified by the event's `origin` so it can ignore its
//! own writes.

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::key::TabId;

/// A write observed in the shared local store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEvent {
    /// Key that changed.
    pub key: String,
    /// New serialized value, `None` when the record was removed.
    pub new_value: Option<Arc<str>>,
    /// Tab that performed the write.
    pub origin: TabId,
}

impl StorageEvent {
    pub fn new(key: impl Into<String>, new_value: Option<&str>, origin: TabId) -> Self {
        Self {
            key: key.into(),
            new_value: new_value.map(Arc::from),
            origin,
        }
    }
}

/// Source of storage change events.
///
/// Implemented by local stores that can observe writes made by other
/// processes, either natively or by polling.
pub trait StorageSignal: Send + Sync {
    /// Subscribe to all future storage events.
    fn subscribe(&self) -> broadcast::Receiver<StorageEvent>;
}
