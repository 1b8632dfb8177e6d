//! Engine construction.

use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use kvsync_core::{
    Clock, ConfigError, KvResult, StorageEvent, StorageSignal, SyncConfig, SystemClock, TabId,
};
use kvsync_events::{ChangeBus, CrossTabBridge};
use kvsync_storage::{
    HttpRemoteConnector, LmdbLocalStore, LmdbStorageWatcher, LocalStore, RemoteConnector,
    RemoteHandle, SharedMemoryStore,
};
use tokio::runtime::Handle;
use tokio::sync::{broadcast, Semaphore};
use tracing::info;

use crate::engine::{EngineInner, SyncEngine};
use crate::stats::StatsCounters;
use crate::tasks::TaskTracker;

/// Builder for [`SyncEngine`].
///
/// Anything not set explicitly is derived from the [`SyncConfig`]:
///
/// - local store: LMDB at `local_store_path` (with a polling watcher feeding
///   the cross-tab bridge), otherwise a private in-memory store;
/// - remote store: HTTP at `remote_url`, otherwise local-only;
/// - clock: the system clock;
/// - runtime: the runtime `build` is called from.
#[derive(Default)]
pub struct SyncEngineBuilder {
    config: SyncConfig,
    tab_id: Option<TabId>,
    local: Option<Arc<dyn LocalStore>>,
    shared: Option<Arc<SharedMemoryStore>>,
    storage_events: Option<broadcast::Receiver<StorageEvent>>,
    remote: Option<Arc<RemoteHandle>>,
    connector: Option<Arc<dyn RemoteConnector>>,
    bus: Option<Arc<ChangeBus>>,
    clock: Option<Arc<dyn Clock>>,
    runtime: Option<Handle>,
}

impl SyncEngineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    /// Identity to write under. Generated when not set.
    pub fn tab_id(mut self, tab_id: TabId) -> Self {
        self.tab_id = Some(tab_id);
        self
    }

    /// Use `store` as the local store.
    pub fn local_store(mut self, store: Arc<dyn LocalStore>) -> Self {
        self.local = Some(store);
        self
    }

    /// Join a storage area shared with other engines in this process.
    ///
    /// The engine gets its own tab view of `shared` and listens to the
    /// other tabs' writes.
    pub fn shared_store(mut self, shared: Arc<SharedMemoryStore>) -> Self {
        self.shared = Some(shared);
        self
    }

    /// Feed the cross-tab bridge from `signal`.
    pub fn storage_signal(mut self, signal: &dyn StorageSignal) -> Self {
        self.storage_events = Some(signal.subscribe());
        self
    }

    /// Connect to the remote store through `connector` on first use.
    pub fn remote_connector(mut self, connector: Arc<dyn RemoteConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Share an existing remote handle (and its memoized connection).
    pub fn remote_handle(mut self, handle: Arc<RemoteHandle>) -> Self {
        self.remote = Some(handle);
        self
    }

    /// Never contact a remote store.
    pub fn local_only(mut self) -> Self {
        self.remote = Some(Arc::new(RemoteHandle::disabled()));
        self
    }

    pub fn bus(mut self, bus: Arc<ChangeBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Spawn background work on `runtime`.
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Build the engine and start its cross-tab bridge.
    ///
    /// Fails when the configuration is invalid, no runtime is available or
    /// the durable local store cannot be opened.
    pub fn build(self) -> KvResult<SyncEngine> {
        let config = self.config;
        config.validate()?;

        let runtime = match self.runtime {
            Some(runtime) => runtime,
            None => Handle::try_current().map_err(|e| ConfigError::RuntimeUnavailable {
                reason: e.to_string(),
            })?,
        };
        let _enter = runtime.enter();

        let tab_id = self.tab_id.unwrap_or_default();
        let mut storage_events = self.storage_events;
        let mut watcher = None;

        let local: Arc<dyn LocalStore> = match (self.local, self.shared) {
            (Some(local), _) => local,
            (None, Some(shared)) => {
                let tab = shared.tab(tab_id);
                if storage_events.is_none() {
                    storage_events = Some(tab.subscribe());
                }
                Arc::new(tab)
            }
            (None, None) => match &config.local_store_path {
                Some(path) => {
                    let store = LmdbLocalStore::open(path, config.local_store_max_mb, tab_id)?;
                    if storage_events.is_none() {
                        let poller = LmdbStorageWatcher::spawn(
                            store.clone(),
                            config.poll_interval,
                            config.bridge_capacity,
                        )?;
                        storage_events = Some(poller.subscribe());
                        watcher = Some(poller);
                    }
                    Arc::new(store)
                }
                None => Arc::new(
                    SharedMemoryStore::with_options(config.bridge_capacity, None).tab(tab_id),
                ),
            },
        };

        let remote = match (self.remote, self.connector) {
            (Some(handle), _) => handle,
            (None, Some(connector)) => Arc::new(RemoteHandle::new(connector)),
            (None, None) => match &config.remote_url {
                Some(url) => Arc::new(RemoteHandle::new(Arc::new(HttpRemoteConnector::new(
                    url.clone(),
                )))),
                None => Arc::new(RemoteHandle::disabled()),
            },
        };

        let bus = self.bus.unwrap_or_else(ChangeBus::new);
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let bridge =
            storage_events.map(|events| CrossTabBridge::new(tab_id, bus.clone()).spawn(events));

        info!(
            tab_id = %tab_id,
            remote = ?remote.state(),
            bridge = bridge.is_some(),
            ttl_secs = config.ttl.as_secs(),
            "Sync engine ready"
        );

        Ok(SyncEngine::from_inner(EngineInner {
            push_permits: Semaphore::new(config.push_concurrency),
            config,
            tab_id,
            local,
            remote,
            bus,
            clock,
            entries: DashMap::new(),
            tasks: TaskTracker::new(runtime.clone()),
            stats: Arc::new(StatsCounters::default()),
            bridge: Mutex::new(bridge),
            watcher,
        }))
    }
}

impl std::fmt::Debug for SyncEngineBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngineBuilder")
            .field("config", &self.config)
            .field("tab_id", &self.tab_id)
            .field("has_local", &self.local.is_some())
            .field("has_shared", &self.shared.is_some())
            .field("has_connector", &self.connector.is_some())
            .finish()
    }
}
