//! The sync engine.
//!
//! One [`SyncEngine`] owns every cached key of a process. Reads answer from
//! memory at once and schedule a background refresh when the key's
//! staleness window has elapsed. Writes land in memory and the local store
//! synchronously and reach the remote store in a detached task.

use std::any::type_name;
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use kvsync_core::{payload, Clock, Document, EntryKey, KvSyncError, SyncConfig, TabId};
use kvsync_events::{BridgeHandle, ChangeBus, ChangeNotice};
use kvsync_storage::{LmdbStorageWatcher, LocalStore, RemoteHandle, RemoteState};
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::{watch, Semaphore};
use tracing::{debug, info, warn};

use crate::builder::SyncEngineBuilder;
use crate::entry::{Entry, EntryState};
use crate::stats::{EngineStats, StatsCounters};
use crate::tasks::TaskTracker;

// ============================================================================
// PUBLIC TYPES
// ============================================================================

/// New value for an [`SyncEngine::update`].
pub enum Updater<T> {
    /// Replace the value.
    Replace(T),
    /// Compute the value from the most recent one.
    Apply(Box<dyn FnOnce(T) -> T>),
}

impl<T> Updater<T> {
    /// Build an updater from a function of the current value.
    ///
    /// The function receives the latest value known to this process,
    /// including local writes not yet confirmed by the remote store, or
    /// `T::default()` when the key has no value. It runs while the entry is
    /// locked and must not call back into the engine.
    pub fn apply(f: impl FnOnce(T) -> T + 'static) -> Self {
        Self::Apply(Box::new(f))
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Updater<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Replace(value) => f.debug_tuple("Replace").field(value).finish(),
            Self::Apply(_) => f.write_str("Apply(..)"),
        }
    }
}

/// Result of a [`SyncEngine::get`].
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot<T> {
    pub value: T,
    /// A remote fetch for this key has completed at least once.
    pub is_loaded: bool,
}

/// What a [`SyncEngine::refresh`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// Inside the staleness window; nothing fetched.
    Fresh,
    /// A fetch for the key was already running; this request was dropped.
    InFlight,
    /// The remote value replaced the local one.
    Updated,
    /// The remote value equals the local one.
    Unchanged,
    /// The remote store has no document for the key; local state kept.
    NotFound,
    /// Local state changed during the fetch; the remote value was dropped.
    Discarded,
    /// The fetch failed; local state kept.
    Failed,
    /// No remote store is reachable.
    LocalOnly,
}

// ============================================================================
// ENGINE
// ============================================================================

pub(crate) struct EngineInner {
    pub(crate) config: SyncConfig,
    pub(crate) tab_id: TabId,
    pub(crate) local: Arc<dyn LocalStore>,
    pub(crate) remote: Arc<RemoteHandle>,
    pub(crate) bus: Arc<ChangeBus>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) entries: DashMap<EntryKey, Arc<Entry>>,
    pub(crate) tasks: TaskTracker,
    pub(crate) push_permits: Semaphore,
    pub(crate) stats: Arc<StatsCounters>,
    pub(crate) bridge: Mutex<Option<BridgeHandle>>,
    /// Keeps the polling watcher of a durable local store alive.
    pub(crate) watcher: Option<LmdbStorageWatcher>,
}

/// Key-value sync engine.
///
/// Cheap to clone; clones share all state.
///
/// # Example
///
/// ```ignore
/// let engine = SyncEngine::builder()
///     .config(SyncConfig::from_env())
///     .build()?;
///
/// let profiles = EntryKey::new("profiles")?;
/// engine.update(&profiles, Updater::apply(|mut list: Vec<Profile>| {
///     list.push(new_profile);
///     list
/// }));
/// let snapshot = engine.get(&profiles, Vec::<Profile>::new());
/// ```
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

impl SyncEngine {
    pub fn builder() -> SyncEngineBuilder {
        SyncEngineBuilder::new()
    }

    pub(crate) fn from_inner(inner: EngineInner) -> Self {
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Identity this engine writes under in the shared local store.
    pub fn tab_id(&self) -> TabId {
        self.inner.tab_id
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    /// The change bus consumers can subscribe to.
    pub fn bus(&self) -> &Arc<ChangeBus> {
        &self.inner.bus
    }

    pub fn remote_state(&self) -> RemoteState {
        self.inner.remote.state()
    }

    /// Number of keys accessed so far.
    pub fn entry_count(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn stats(&self) -> EngineStats {
        self.inner.stats.snapshot()
    }

    /// Current value of `key`.
    ///
    /// Answers from memory without waiting. The first access to a key
    /// seeds it from the local store, or from `default` when the local
    /// store has nothing usable. When the key's staleness window has
    /// elapsed and no fetch is running, one background refresh is started.
    ///
    /// A stored value that cannot be decoded as `T` yields `default`.
    pub fn get<T>(&self, key: &EntryKey, default: T) -> Snapshot<T>
    where
        T: Serialize + DeserializeOwned,
    {
        let entry = self.entry_or_seed(key, || payload::to_document(key.as_str(), &default).ok());
        let now = self.inner.clock.now();

        let (document, is_loaded, fresh, fetch_from) = {
            let mut state = entry.state();
            state.record_type(key, type_name::<T>());
            let fresh = state.is_fresh(now, self.inner.config.ttl);
            let fetch_from = if !fresh && !state.fetch_in_flight && self.remote_may_answer() {
                state.fetch_in_flight = true;
                Some(FetchStart::of(&state))
            } else {
                None
            };
            (state.value.clone(), state.loaded, fresh, fetch_from)
        };

        if fresh {
            StatsCounters::incr(&self.inner.stats.fresh_reads);
        } else {
            StatsCounters::incr(&self.inner.stats.stale_reads);
        }
        if let Some(start) = fetch_from {
            debug!(key = %key, "Staleness window elapsed, refreshing in background");
            self.spawn_fetch(entry, start);
        }

        let value = match document {
            Some(document) => decode_logged(key, &document).unwrap_or(default),
            None => default,
        };
        Snapshot { value, is_loaded }
    }

    /// Write a new value for `key`.
    ///
    /// Memory and the local store are updated before this returns and a
    /// change notice is published. The remote push runs in the background;
    /// its failure is logged and not retried, and never undoes the local
    /// write. A failed local write is logged and the new value is still
    /// served from memory.
    pub fn update<T>(&self, key: &EntryKey, updater: Updater<T>)
    where
        T: Serialize + DeserializeOwned + Default,
    {
        let entry = self.entry_or_seed(key, || None);

        let push = {
            let mut state = entry.state();
            state.record_type(key, type_name::<T>());

            let next = match updater {
                Updater::Replace(value) => value,
                Updater::Apply(f) => {
                    let current = state
                        .value
                        .as_ref()
                        .and_then(|document| decode_logged::<T>(key, document))
                        .unwrap_or_default();
                    f(current)
                }
            };
            let document = match payload::to_document(key.as_str(), &next) {
                Ok(document) => document,
                Err(e) => {
                    warn!(key = %key, error = %e, "Update dropped, value cannot be serialized");
                    return;
                }
            };

            self.persist_local(key, &document);
            state.local_version += 1;
            let push = self.remote_may_answer();
            if push {
                state.pending_pushes += 1;
                state.unpushed = Some((state.local_version, document.clone()));
            }
            state.value = Some(document);
            push
        };

        entry.bump_revision();
        self.inner.bus.publish_updated(key);
        if push {
            self.spawn_push(entry);
        }
    }

    /// Fetch `key` from the remote store now.
    ///
    /// Without `force`, a key fetched inside its staleness window is left
    /// alone. A fetch already running for the key is never duplicated. A
    /// successful fetch updates memory and the local store but publishes no
    /// change notice; watchers of the key are woken instead.
    pub async fn refresh(&self, key: &EntryKey, force: bool) -> RefreshOutcome {
        let entry = self.entry_or_seed(key, || None);
        let now = self.inner.clock.now();

        let start = {
            let mut state = entry.state();
            if !force && state.is_fresh(now, self.inner.config.ttl) {
                return RefreshOutcome::Fresh;
            }
            if state.fetch_in_flight {
                return RefreshOutcome::InFlight;
            }
            if !self.remote_may_answer() {
                return RefreshOutcome::LocalOnly;
            }
            state.fetch_in_flight = true;
            FetchStart::of(&state)
        };

        self.fetch(entry, start).await
    }

    /// Make every consumer of `key` re-fetch on its next access.
    ///
    /// Used after privileged changes that must be seen immediately.
    pub fn force_refresh_from_remote(&self, key: &EntryKey) {
        if let Some(entry) = self.existing(key) {
            entry.state().reset_fetch();
        }
        let receivers = self.inner.bus.publish(ChangeNotice::force_refresh(key.clone()));
        info!(key = %key, receivers = receivers, "Force refresh requested");
    }

    /// Make every consumer of every key re-fetch on its next access.
    pub fn force_refresh_all(&self) {
        for entry in self.inner.entries.iter() {
            entry.value().state().reset_fetch();
        }
        let receivers = self.inner.bus.broadcast_force_refresh();
        info!(receivers = receivers, "Force refresh of all keys requested");
    }

    /// Revision counter of `key`, bumped whenever its value changes.
    pub fn watch(&self, key: &EntryKey) -> watch::Receiver<u64> {
        self.entry_or_seed(key, || None).watch()
    }

    /// Wait for every background refresh and push started so far.
    pub async fn flush(&self) {
        self.inner.tasks.wait_idle().await;
    }

    /// Number of background tasks still running.
    pub fn background_tasks(&self) -> usize {
        self.inner.tasks.running()
    }

    /// Whether the cross-tab bridge is running.
    pub fn bridge_running(&self) -> bool {
        self.inner
            .bridge
            .lock()
            .map(|bridge| bridge.as_ref().map_or(false, |b| !b.is_finished()))
            .unwrap_or(false)
    }

    // ------------------------------------------------------------------
    // internals
    // ------------------------------------------------------------------

    fn existing(&self, key: &EntryKey) -> Option<Arc<Entry>> {
        self.inner.entries.get(key).map(|entry| entry.value().clone())
    }

    fn entry_or_seed(
        &self,
        key: &EntryKey,
        seed: impl FnOnce() -> Option<Document>,
    ) -> Arc<Entry> {
        if let Some(entry) = self.existing(key) {
            return entry;
        }
        self.inner
            .entries
            .entry(key.clone())
            .or_insert_with(|| self.create_entry(key, seed))
            .value()
            .clone()
    }

    fn create_entry(&self, key: &EntryKey, seed: impl FnOnce() -> Option<Document>) -> Arc<Entry> {
        let stored = match self.inner.local.get_item(key.as_str()) {
            Ok(raw) => payload::decode_or_absent(key.as_str(), raw.as_deref()),
            Err(e) => {
                warn!(key = %key, error = %e, "Local read failed, seeding from default");
                None
            }
        };
        let from_local = stored.is_some();
        let entry = Entry::new(key.clone(), stored.or_else(seed));

        let weak = Arc::downgrade(&entry);
        let local = self.inner.local.clone();
        let stats = self.inner.stats.clone();
        let subscription = self.inner.bus.subscribe(key, move |notice| {
            if let Some(entry) = weak.upgrade() {
                entry.on_notice(notice, local.as_ref(), &stats);
            }
        });
        entry.attach(subscription);

        StatsCounters::incr(&self.inner.stats.entries);
        debug!(key = %key, from_local = from_local, "Created entry");
        entry
    }

    fn remote_may_answer(&self) -> bool {
        matches!(
            self.inner.remote.state(),
            RemoteState::Uninitialized | RemoteState::Available
        )
    }

    fn persist_local(&self, key: &EntryKey, document: &Document) {
        let result = payload::encode(key.as_str(), document)
            .map_err(KvSyncError::from)
            .and_then(|raw| self.inner.local.set_item(key.as_str(), &raw));
        if let Err(e) = result {
            StatsCounters::incr(&self.inner.stats.local_write_failures);
            warn!(key = %key, error = %e, "Local write failed, value kept in memory only");
        }
    }

    fn spawn_fetch(&self, entry: Arc<Entry>, start: FetchStart) {
        let engine = self.clone();
        self.inner.tasks.spawn(async move {
            engine.fetch(entry, start).await;
        });
    }

    /// Fetch the entry's key. The caller has set `fetch_in_flight` and
    /// passes the entry state observed at that moment.
    async fn fetch(&self, entry: Arc<Entry>, start: FetchStart) -> RefreshOutcome {
        let Some(remote) = self.inner.remote.store().await else {
            entry.state().fetch_in_flight = false;
            return RefreshOutcome::LocalOnly;
        };

        let key = &entry.key;
        let result = remote.get(key.as_str()).await;
        let now = self.inner.clock.now();

        let (outcome, was_loaded) = {
            let mut state = entry.state();
            state.fetch_in_flight = false;

            let document = match result {
                Ok(document) => document,
                Err(e) => {
                    drop(state);
                    StatsCounters::incr(&self.inner.stats.remote_fetch_failures);
                    warn!(key = %key, error = %e, "Remote fetch failed, keeping local state");
                    return RefreshOutcome::Failed;
                }
            };

            let was_loaded = state.loaded;
            // A force refresh during the fetch keeps the window open.
            if state.fetch_epoch == start.epoch {
                state.last_fetch = Some(now);
            }
            state.loaded = true;

            let outcome = if state.local_version != start.version
                || state.pending_pushes > 0
                || state.dirty.is_some()
            {
                RefreshOutcome::Discarded
            } else {
                match document {
                    None => RefreshOutcome::NotFound,
                    Some(document) if state.value.as_ref() == Some(&document) => {
                        RefreshOutcome::Unchanged
                    }
                    Some(document) => {
                        self.persist_local(key, &document);
                        state.value = Some(document);
                        RefreshOutcome::Updated
                    }
                }
            };
            (outcome, was_loaded)
        };

        StatsCounters::incr(&self.inner.stats.remote_fetches);
        if outcome == RefreshOutcome::Discarded {
            StatsCounters::incr(&self.inner.stats.discarded_fetches);
            debug!(key = %key, "Local state changed during fetch, remote value dropped");
        }
        if outcome == RefreshOutcome::Updated || !was_loaded {
            entry.bump_revision();
        }
        debug!(key = %key, outcome = ?outcome, "Remote fetch completed");
        outcome
    }

    fn spawn_push(&self, entry: Arc<Entry>) {
        let engine = self.clone();
        self.inner.tasks.spawn(async move {
            engine.push(entry).await;
        });
    }

    /// Push the latest local write of the entry's key.
    ///
    /// Pushes of one key run one at a time and always send the newest
    /// local value, so the remote store never ends on an older write.
    async fn push(&self, entry: Arc<Entry>) {
        let key = &entry.key;
        {
            let mut last_pushed = entry.push_lock.lock().await;
            let unpushed = entry.state().unpushed.clone();

            if let Some((version, document)) = unpushed.filter(|(v, _)| *v > *last_pushed) {
                *last_pushed = version;
                let _permit = self.inner.push_permits.acquire().await.ok();
                match self.inner.remote.store().await {
                    Some(remote) => match remote.set(key.as_str(), &document).await {
                        Ok(()) => {
                            let mut state = entry.state();
                            if state.dirty.is_some_and(|dirty| dirty <= version) {
                                state.dirty = None;
                            }
                            drop(state);
                            StatsCounters::incr(&self.inner.stats.remote_pushes);
                            debug!(key = %key, version = version, "Pushed to remote store");
                        }
                        Err(e) => {
                            let mut state = entry.state();
                            state.dirty = state.dirty.max(Some(version));
                            drop(state);
                            StatsCounters::incr(&self.inner.stats.remote_push_failures);
                            warn!(key = %key, error = %e, "Remote push failed, not retried");
                        }
                    },
                    None => debug!(key = %key, "Remote store unavailable, push skipped"),
                }
            }
        }

        let mut state = entry.state();
        state.pending_pushes = state.pending_pushes.saturating_sub(1);
        if state.pending_pushes == 0 {
            state.unpushed = None;
        }
    }
}

/// Entry state captured when a fetch starts.
#[derive(Debug, Clone, Copy)]
struct FetchStart {
    version: u64,
    epoch: u64,
}

impl FetchStart {
    fn of(state: &EntryState) -> Self {
        Self {
            version: state.local_version,
            epoch: state.fetch_epoch,
        }
    }
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("tab_id", &self.inner.tab_id)
            .field("entries", &self.inner.entries.len())
            .field("remote", &self.inner.remote)
            .field("polling_local_store", &self.inner.watcher.is_some())
            .finish()
    }
}

fn decode_logged<T: DeserializeOwned>(key: &EntryKey, document: &Document) -> Option<T> {
    match payload::from_document(key.as_str(), document) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(key = %key, error = %e, "Stored value does not match requested type");
            None
        }
    }
}
