//! In-process publish/subscribe keyed by entry key.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

use kvsync_core::{EntryKey, TabId, ALL_KEYS};
use tracing::{debug, warn};

/// What happened to a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeKind {
    /// The key's value changed.
    Updated,
    /// Every consumer of the key must bypass the staleness window on its
    /// next access.
    ForceRefresh,
}

/// Where a notice came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeSource {
    /// Published by this process.
    Local,
    /// Republished from a write made by another tab.
    CrossTab { origin: TabId },
}

/// A notification delivered to subscribers of one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeNotice {
    pub key: EntryKey,
    pub kind: NoticeKind,
    pub source: NoticeSource,
    /// Serialized new value, carried by cross-tab updates. `None` for local
    /// notices and for cross-tab removals.
    pub payload: Option<Arc<str>>,
}

impl ChangeNotice {
    /// A local update notice.
    pub fn updated(key: EntryKey) -> Self {
        Self {
            key,
            kind: NoticeKind::Updated,
            source: NoticeSource::Local,
            payload: None,
        }
    }

    /// An update observed in another tab.
    pub fn cross_tab(key: EntryKey, origin: TabId, payload: Option<Arc<str>>) -> Self {
        Self {
            key,
            kind: NoticeKind::Updated,
            source: NoticeSource::CrossTab { origin },
            payload,
        }
    }

    /// A force-refresh notice.
    pub fn force_refresh(key: EntryKey) -> Self {
        Self {
            key,
            kind: NoticeKind::ForceRefresh,
            source: NoticeSource::Local,
            payload: None,
        }
    }

    pub fn is_cross_tab(&self) -> bool {
        matches!(self.source, NoticeSource::CrossTab { .. })
    }
}

/// Subscriber callback. Runs synchronously on the publishing thread.
pub type NoticeCallback = Arc<dyn Fn(&ChangeNotice) + Send + Sync>;

type SubscriberMap = HashMap<EntryKey, Vec<(u64, NoticeCallback)>>;

/// Process-wide change notification bus.
///
/// Subscriptions are exact-key. The only fan-out across keys is
/// [`ChangeBus::broadcast_force_refresh`], which addresses the reserved
/// [`ALL_KEYS`] sentinel.
pub struct ChangeBus {
    subscribers: RwLock<SubscriberMap>,
    next_id: AtomicU64,
}

impl ChangeBus {
    /// Create an empty bus.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            subscribers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        })
    }

    /// Register interest in `key`.
    ///
    /// The returned [`Subscription`] cancels itself when dropped.
    pub fn subscribe<F>(self: &Arc<Self>, key: &EntryKey, callback: F) -> Subscription
    where
        F: Fn(&ChangeNotice) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let callback: NoticeCallback = Arc::new(callback);
        match self.subscribers.write() {
            Ok(mut subscribers) => {
                subscribers
                    .entry(key.clone())
                    .or_default()
                    .push((id, callback));
            }
            Err(_) => {
                warn!(key = %key, "Change bus lock poisoned, subscription not registered");
            }
        }
        Subscription {
            bus: Arc::downgrade(self),
            key: key.clone(),
            id,
            active: true,
        }
    }

    /// Deliver `notice` to every subscriber of `notice.key`.
    ///
    /// Returns the number of callbacks invoked.
    pub fn publish(&self, notice: ChangeNotice) -> usize {
        let callbacks = self.callbacks_for(&notice.key);
        for callback in &callbacks {
            callback(&notice);
        }
        debug!(
            key = %notice.key,
            kind = ?notice.kind,
            receivers = callbacks.len(),
            "Published change notice"
        );
        callbacks.len()
    }

    /// Publish a local update of `key`.
    pub fn publish_updated(&self, key: &EntryKey) -> usize {
        self.publish(ChangeNotice::updated(key.clone()))
    }

    /// Deliver a force-refresh notice to every subscriber of every key.
    ///
    /// Each subscriber receives the notice under its own key.
    pub fn broadcast_force_refresh(&self) -> usize {
        let targets: Vec<(EntryKey, NoticeCallback)> = match self.subscribers.read() {
            Ok(subscribers) => subscribers
                .iter()
                .flat_map(|(key, subs)| subs.iter().map(move |(_, cb)| (key.clone(), cb.clone())))
                .collect(),
            Err(_) => {
                warn!("Change bus lock poisoned, force refresh not delivered");
                Vec::new()
            }
        };
        for (key, callback) in &targets {
            callback(&ChangeNotice::force_refresh(key.clone()));
        }
        debug!(
            key = ALL_KEYS,
            receivers = targets.len(),
            "Broadcast force refresh"
        );
        targets.len()
    }

    /// Number of live subscriptions for `key`.
    pub fn subscriber_count(&self, key: &EntryKey) -> usize {
        self.subscribers
            .read()
            .map(|s| s.get(key).map(Vec::len).unwrap_or(0))
            .unwrap_or(0)
    }

    /// Number of keys with at least one live subscription.
    pub fn key_count(&self) -> usize {
        self.subscribers.read().map(|s| s.len()).unwrap_or(0)
    }

    // Snapshot the callbacks so they run without the lock held; callbacks
    // may publish or subscribe themselves.
    fn callbacks_for(&self, key: &EntryKey) -> Vec<NoticeCallback> {
        match self.subscribers.read() {
            Ok(subscribers) => subscribers
                .get(key)
                .map(|subs| subs.iter().map(|(_, cb)| cb.clone()).collect())
                .unwrap_or_default(),
            Err(_) => {
                warn!(key = %key, "Change bus lock poisoned, notice dropped");
                Vec::new()
            }
        }
    }

    fn remove(&self, key: &EntryKey, id: u64) {
        if let Ok(mut subscribers) = self.subscribers.write() {
            if let Some(subs) = subscribers.get_mut(key) {
                subs.retain(|(sub_id, _)| *sub_id != id);
                if subs.is_empty() {
                    subscribers.remove(key);
                }
            }
        }
    }
}

impl std::fmt::Debug for ChangeBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeBus")
            .field("keys", &self.key_count())
            .finish()
    }
}

/// Handle to a bus subscription.
///
/// Dropping the handle cancels the subscription.
#[must_use = "dropping a Subscription cancels it"]
pub struct Subscription {
    bus: Weak<ChangeBus>,
    key: EntryKey,
    id: u64,
    active: bool,
}

impl Subscription {
    /// The key this subscription listens to.
    pub fn key(&self) -> &EntryKey {
        &self.key
    }

    /// Cancel the subscription.
    pub fn unsubscribe(mut self) {
        self.cancel();
    }

    fn cancel(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        if let Some(bus) = self.bus.upgrade() {
            bus.remove(&self.key, self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key)
            .field("id", &self.id)
            .field("active", &self.active)
            .finish()
    }
}
