//! Per-key state held by the engine.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use kvsync_core::{payload, Document, EntryKey};
use kvsync_events::{ChangeNotice, NoticeKind, Subscription};
use kvsync_storage::LocalStore;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::stats::StatsCounters;

/// Mutable part of an entry. Guarded by a std mutex that is never held
/// across an `.await`.
#[derive(Debug, Default)]
pub(crate) struct EntryState {
    /// Current value; `None` until seeded, written or fetched.
    pub(crate) value: Option<Document>,
    /// Time of the last completed remote fetch.
    pub(crate) last_fetch: Option<DateTime<Utc>>,
    /// A remote fetch has completed at least once.
    pub(crate) loaded: bool,
    pub(crate) fetch_in_flight: bool,
    /// Bumped by every force refresh. A fetch started under an older epoch
    /// does not restart the staleness window.
    pub(crate) fetch_epoch: u64,
    /// Bumped by every change that did not come from a fetch.
    pub(crate) local_version: u64,
    pub(crate) pending_pushes: usize,
    /// Latest locally written value and the version it was written at.
    pub(crate) unpushed: Option<(u64, Document)>,
    /// Newest local version whose push failed. Remote values are not
    /// applied while set.
    pub(crate) dirty: Option<u64>,
    /// Rust type the key was first accessed with.
    pub(crate) type_name: Option<&'static str>,
}

impl EntryState {
    /// Whether a fetch completed less than `ttl` before `now`.
    pub(crate) fn is_fresh(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        match self.last_fetch {
            // A fetch stamped in the future (clock stepped back) counts as fresh.
            Some(fetched_at) => (now - fetched_at).to_std().map_or(true, |age| age < ttl),
            None => false,
        }
    }

    /// Drop the staleness window so the next access fetches again.
    pub(crate) fn reset_fetch(&mut self) {
        self.last_fetch = None;
        self.fetch_epoch += 1;
    }

    /// Remember the type a key is used with and flag later mismatches.
    pub(crate) fn record_type(&mut self, key: &EntryKey, type_name: &'static str) {
        match self.type_name {
            None => self.type_name = Some(type_name),
            Some(first) if first != type_name => {
                warn!(
                    key = %key,
                    first_type = first,
                    requested_type = type_name,
                    "Entry accessed with a different type than at first use"
                );
            }
            Some(_) => {}
        }
    }
}

/// One cached key.
pub(crate) struct Entry {
    pub(crate) key: EntryKey,
    state: Mutex<EntryState>,
    revision: watch::Sender<u64>,
    /// Serializes remote pushes for this key; holds the last pushed version.
    pub(crate) push_lock: tokio::sync::Mutex<u64>,
    subscription: Mutex<Option<Subscription>>,
}

impl Entry {
    pub(crate) fn new(key: EntryKey, seed: Option<Document>) -> Arc<Self> {
        let (revision, _rx) = watch::channel(0);
        Arc::new(Self {
            key,
            state: Mutex::new(EntryState {
                value: seed,
                ..Default::default()
            }),
            revision,
            push_lock: tokio::sync::Mutex::new(0),
            subscription: Mutex::new(None),
        })
    }

    /// Lock the entry state.
    ///
    /// A panic while the lock was held leaves the state consistent (every
    /// mutation is a plain field store), so poisoning is ignored.
    pub(crate) fn state(&self) -> MutexGuard<'_, EntryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn attach(&self, subscription: Subscription) {
        let mut slot = self
            .subscription
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = Some(subscription);
    }

    /// Wake everyone watching this entry.
    pub(crate) fn bump_revision(&self) {
        self.revision.send_modify(|revision| *revision += 1);
    }

    pub(crate) fn watch(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    pub(crate) fn revision(&self) -> u64 {
        *self.revision.borrow()
    }

    /// React to a bus notice for this key.
    ///
    /// Local `Updated` notices are this engine's own writes and are ignored.
    pub(crate) fn on_notice(
        &self,
        notice: &ChangeNotice,
        local: &dyn LocalStore,
        stats: &StatsCounters,
    ) {
        match notice.kind {
            NoticeKind::ForceRefresh => {
                self.state().reset_fetch();
                debug!(key = %self.key, "Staleness window reset");
            }
            NoticeKind::Updated if notice.is_cross_tab() => self.apply_cross_tab(local, stats),
            NoticeKind::Updated => {}
        }
    }

    // Events may arrive late or out of order, so the record is re-read
    // rather than taken from the notice. The read happens under the entry
    // lock, which also covers this tab's own local writes. The originating
    // tab already pushed the value remotely, so only memory changes here.
    fn apply_cross_tab(&self, local: &dyn LocalStore, stats: &StatsCounters) {
        {
            let mut state = self.state();
            let raw = match local.get_item(self.key.as_str()) {
                Ok(raw) => raw,
                Err(e) => {
                    warn!(key = %self.key, error = %e, "Local read failed, cross-tab change ignored");
                    return;
                }
            };
            let current = payload::decode_or_absent(self.key.as_str(), raw.as_deref());
            if raw.is_some() && current.is_none() {
                return;
            }
            if state.value == current {
                return;
            }
            state.value = current;
            state.local_version += 1;
            // Another tab's write supersedes a local value whose push failed.
            state.dirty = None;
        }
        StatsCounters::incr(&stats.cross_tab_applies);
        debug!(key = %self.key, "Applied value written by another tab");
        self.bump_revision();
    }
}

impl std::fmt::Debug for Entry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entry")
            .field("key", &self.key)
            .field("revision", &self.revision())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvsync_core::TabId;
    use kvsync_storage::{SharedMemoryStore, TabLocalStore};
    use serde_json::json;

    fn key(name: &str) -> EntryKey {
        EntryKey::new(name).expect("valid key")
    }

    #[test]
    fn test_freshness_window() {
        let now = Utc::now();
        let mut state = EntryState::default();
        assert!(!state.is_fresh(now, Duration::from_secs(30)));

        state.last_fetch = Some(now - chrono::Duration::seconds(10));
        assert!(state.is_fresh(now, Duration::from_secs(30)));
        assert!(!state.is_fresh(now, Duration::from_secs(10)));

        state.last_fetch = Some(now + chrono::Duration::seconds(5));
        assert!(state.is_fresh(now, Duration::from_secs(30)));
    }

    fn other_tab(shared: &Arc<SharedMemoryStore>) -> TabLocalStore {
        shared.tab(TabId::new())
    }

    fn cross_tab(name: &str, payload: Option<&str>) -> ChangeNotice {
        ChangeNotice::cross_tab(key(name), TabId::new(), payload.map(Arc::from))
    }

    #[test]
    fn test_cross_tab_notice_applies_stored_value() {
        let shared = SharedMemoryStore::new();
        let local = other_tab(&shared);
        let entry = Entry::new(key("profiles"), Some(json!([])));
        let stats = StatsCounters::default();

        local.set_item("profiles", r#"[{"id":"p1"}]"#).expect("set");
        let notice = cross_tab("profiles", Some(r#"[{"id":"p1"}]"#));

        entry.on_notice(&notice, &local, &stats);
        assert_eq!(entry.state().value, Some(json!([{"id": "p1"}])));
        assert_eq!(entry.state().local_version, 1);
        assert_eq!(entry.revision(), 1);

        // Same record again is a no-op.
        entry.on_notice(&notice, &local, &stats);
        assert_eq!(entry.revision(), 1);
        assert_eq!(stats.snapshot().cross_tab_applies, 1);
    }

    #[test]
    fn test_late_cross_tab_notice_does_not_regress_value() {
        let shared = SharedMemoryStore::new();
        let local = other_tab(&shared);
        let entry = Entry::new(key("settings"), None);
        let stats = StatsCounters::default();

        // The store already holds a newer write than the notice carries.
        local.set_item("settings", r#"{"theme":"dark"}"#).expect("set");
        entry.on_notice(&cross_tab("settings", Some(r#"{"theme":"light"}"#)), &local, &stats);
        assert_eq!(entry.state().value, Some(json!({"theme": "dark"})));
    }

    #[test]
    fn test_cross_tab_garbage_is_ignored() {
        let shared = SharedMemoryStore::new();
        let local = other_tab(&shared);
        let entry = Entry::new(key("settings"), Some(json!({"lang": "en"})));
        let stats = StatsCounters::default();

        local.set_item("settings", "{broken").expect("set");
        entry.on_notice(&cross_tab("settings", Some("{broken")), &local, &stats);
        assert_eq!(entry.state().value, Some(json!({"lang": "en"})));
        assert_eq!(entry.revision(), 0);
    }

    #[test]
    fn test_cross_tab_removal_clears_value() {
        let shared = SharedMemoryStore::new();
        let local = other_tab(&shared);
        let entry = Entry::new(key("messages"), Some(json!(["hi"])));
        entry.state().dirty = Some(3);

        entry.on_notice(&cross_tab("messages", None), &local, &StatsCounters::default());
        assert_eq!(entry.state().value, None);
        assert_eq!(entry.state().dirty, None);
    }

    #[test]
    fn test_local_update_notice_is_ignored() {
        let shared = SharedMemoryStore::new();
        let local = other_tab(&shared);
        let entry = Entry::new(key("users"), Some(json!([])));
        let stats = StatsCounters::default();
        entry.on_notice(&ChangeNotice::updated(key("users")), &local, &stats);
        assert_eq!(entry.revision(), 0);
    }

    #[test]
    fn test_force_refresh_notice_resets_fetch_time() {
        let shared = SharedMemoryStore::new();
        let local = other_tab(&shared);
        let entry = Entry::new(key("profiles"), None);
        entry.state().last_fetch = Some(Utc::now());
        entry.on_notice(
            &ChangeNotice::force_refresh(key("profiles")),
            &local,
            &StatsCounters::default(),
        );
        assert!(entry.state().last_fetch.is_none());
        assert_eq!(entry.state().fetch_epoch, 1);
    }
}
