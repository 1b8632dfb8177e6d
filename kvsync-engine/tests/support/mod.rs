//! Helpers shared by the engine integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use kvsync_engine::{EntryKey, SyncConfig, SyncEngine};
use kvsync_storage::{MemoryRemoteStore, SharedMemoryStore};
use kvsync_test_utils::{ManualClock, ScriptedRemote};
use serde::{Deserialize, Serialize};

/// Upper bound for anything the tests wait on.
pub const WAIT: Duration = Duration::from_secs(2);

pub const TTL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
}

pub fn profile(id: &str) -> Profile {
    Profile { id: id.to_string() }
}

pub fn key(name: &str) -> EntryKey {
    EntryKey::new(name).expect("valid key")
}

pub fn config() -> SyncConfig {
    SyncConfig::new().with_ttl(TTL)
}

/// One engine talking to a scripted remote, driven by a manual clock.
pub struct Harness {
    pub engine: SyncEngine,
    pub remote: ScriptedRemote,
    pub clock: Arc<ManualClock>,
    pub shared: Arc<SharedMemoryStore>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_shared(SharedMemoryStore::new())
    }

    pub fn with_shared(shared: Arc<SharedMemoryStore>) -> Self {
        let remote = ScriptedRemote::new();
        let clock = Arc::new(ManualClock::new());
        let engine = SyncEngine::builder()
            .config(config())
            .shared_store(shared.clone())
            .remote_connector(Arc::new(remote.clone()))
            .clock(clock.clone())
            .build()
            .expect("engine should build");
        Self {
            engine,
            remote,
            clock,
            shared,
        }
    }
}

/// A simulated browser tab: its own engine and remote client, sharing the
/// local storage area and the server with the other tabs.
pub struct Tab {
    pub engine: SyncEngine,
    pub remote: ScriptedRemote,
}

pub fn open_tab(
    shared: &Arc<SharedMemoryStore>,
    server: &MemoryRemoteStore,
    clock: &Arc<ManualClock>,
) -> Tab {
    let remote = ScriptedRemote::with_backing(server.clone());
    let engine = SyncEngine::builder()
        .config(config())
        .shared_store(shared.clone())
        .remote_connector(Arc::new(remote.clone()))
        .clock(clock.clone())
        .build()
        .expect("engine should build");
    Tab { engine, remote }
}
