//! KVSYNC Test Utilities
//!
//! Shared test infrastructure for the KVSYNC workspace:
//! - A scripted remote store with call counters, failure injection and
//!   gates that hold calls in flight
//! - A connector that never connects
//! - A manually driven clock
//! - Proptest generators for keys and documents
//! - Fixtures for the matchmaking payloads used across tests

pub use kvsync_core::{Document, EntryKey, KvResult, KvSyncError, StoreError, TabId};
pub use kvsync_storage::{MemoryRemoteStore, RemoteConnector, RemoteStore};

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use kvsync_core::{Clock, RemoteOperation};
use tokio::sync::watch;

// ============================================================================
// SCRIPTED REMOTE
// ============================================================================

/// Holds calls until released.
#[derive(Debug)]
struct Gate {
    held: watch::Sender<bool>,
}

impl Gate {
    fn new() -> Self {
        let (held, _rx) = watch::channel(false);
        Self { held }
    }

    fn hold(&self) {
        self.held.send_replace(true);
    }

    fn release(&self) {
        self.held.send_replace(false);
    }

    async fn pass(&self) {
        let mut rx = self.held.subscribe();
        // The sender lives as long as the gate, so this cannot fail.
        let _ = rx.wait_for(|held| !*held).await;
    }
}

#[derive(Debug)]
struct ScriptedInner {
    backing: MemoryRemoteStore,
    connects: AtomicUsize,
    gets: AtomicUsize,
    sets: AtomicUsize,
    deletes: AtomicUsize,
    fail_gets: AtomicBool,
    fail_sets: AtomicBool,
    get_gate: Gate,
    set_gate: Gate,
}

/// Remote store whose behavior is driven by the test.
///
/// Clones share counters, switches and documents. The store is its own
/// connector, so it can be handed to an engine builder directly.
#[derive(Debug, Clone)]
pub struct ScriptedRemote {
    inner: Arc<ScriptedInner>,
}

impl ScriptedRemote {
    /// A scripted remote over a fresh in-memory document set.
    pub fn new() -> Self {
        Self::with_backing(MemoryRemoteStore::new())
    }

    /// A scripted remote over `backing`.
    ///
    /// Several scripted remotes over one backing store model several tabs
    /// talking to one server, each with its own counters.
    pub fn with_backing(backing: MemoryRemoteStore) -> Self {
        Self {
            inner: Arc::new(ScriptedInner {
                backing,
                connects: AtomicUsize::new(0),
                gets: AtomicUsize::new(0),
                sets: AtomicUsize::new(0),
                deletes: AtomicUsize::new(0),
                fail_gets: AtomicBool::new(false),
                fail_sets: AtomicBool::new(false),
                get_gate: Gate::new(),
                set_gate: Gate::new(),
            }),
        }
    }

    pub fn backing(&self) -> &MemoryRemoteStore {
        &self.inner.backing
    }

    /// Seed a server-side document.
    pub fn insert(&self, key: &str, document: Document) {
        self.inner.backing.insert(key, document);
    }

    /// Current server-side document.
    pub fn document(&self, key: &str) -> Option<Document> {
        self.inner.backing.document(key)
    }

    pub fn connect_calls(&self) -> usize {
        self.inner.connects.load(Ordering::SeqCst)
    }

    pub fn get_calls(&self) -> usize {
        self.inner.gets.load(Ordering::SeqCst)
    }

    pub fn set_calls(&self) -> usize {
        self.inner.sets.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> usize {
        self.inner.deletes.load(Ordering::SeqCst)
    }

    /// Make every `get` fail until switched back.
    pub fn fail_gets(&self, fail: bool) {
        self.inner.fail_gets.store(fail, Ordering::SeqCst);
    }

    /// Make every `set` fail until switched back.
    pub fn fail_sets(&self, fail: bool) {
        self.inner.fail_sets.store(fail, Ordering::SeqCst);
    }

    /// Hold every `get` in flight after it is counted.
    pub fn hold_gets(&self) {
        self.inner.get_gate.hold();
    }

    pub fn release_gets(&self) {
        self.inner.get_gate.release();
    }

    /// Hold every `set` in flight after it is counted.
    pub fn hold_sets(&self) {
        self.inner.set_gate.hold();
    }

    pub fn release_sets(&self) {
        self.inner.set_gate.release();
    }

    /// Wait until at least `n` gets were issued. Returns false on timeout.
    pub async fn wait_for_get_calls(&self, n: usize, timeout: Duration) -> bool {
        wait_until(timeout, || self.get_calls() >= n).await
    }

    /// Wait until at least `n` sets were issued. Returns false on timeout.
    pub async fn wait_for_set_calls(&self, n: usize, timeout: Duration) -> bool {
        wait_until(timeout, || self.set_calls() >= n).await
    }

    fn injected(&self, operation: RemoteOperation, key: &str) -> KvSyncError {
        StoreError::RemoteOperationFailed {
            operation,
            key: key.to_string(),
            reason: "injected failure".to_string(),
        }
        .into()
    }
}

impl Default for ScriptedRemote {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteStore for ScriptedRemote {
    async fn get(&self, key: &str) -> KvResult<Option<Document>> {
        self.inner.gets.fetch_add(1, Ordering::SeqCst);
        self.inner.get_gate.pass().await;
        if self.inner.fail_gets.load(Ordering::SeqCst) {
            return Err(self.injected(RemoteOperation::Get, key));
        }
        self.inner.backing.get(key).await
    }

    async fn set(&self, key: &str, document: &Document) -> KvResult<()> {
        self.inner.sets.fetch_add(1, Ordering::SeqCst);
        self.inner.set_gate.pass().await;
        if self.inner.fail_sets.load(Ordering::SeqCst) {
            return Err(self.injected(RemoteOperation::Set, key));
        }
        self.inner.backing.set(key, document).await
    }

    async fn delete(&self, key: &str) -> KvResult<()> {
        self.inner.deletes.fetch_add(1, Ordering::SeqCst);
        self.inner.backing.delete(key).await
    }
}

#[async_trait]
impl RemoteConnector for ScriptedRemote {
    async fn connect(&self) -> KvResult<Arc<dyn RemoteStore>> {
        self.inner.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(self.clone()))
    }
}

/// Connector whose every attempt fails with `RemoteUnavailable`.
#[derive(Debug, Default)]
pub struct FailingConnector {
    attempts: AtomicUsize,
}

impl FailingConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteConnector for FailingConnector {
    async fn connect(&self) -> KvResult<Arc<dyn RemoteStore>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(StoreError::RemoteUnavailable {
            reason: "backend unreachable".to_string(),
        }
        .into())
    }
}

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

// ============================================================================
// CLOCK
// ============================================================================

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// A clock starting at a fixed instant.
    pub fn new() -> Self {
        let start = Utc
            .with_ymd_and_hms(2024, 1, 1, 12, 0, 0)
            .single()
            .unwrap_or_else(Utc::now);
        Self::starting_at(start)
    }

    pub fn starting_at(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        let delta = chrono::Duration::milliseconds(by.as_millis() as i64);
        if let Ok(mut now) = self.now.lock() {
            *now += delta;
        }
    }

    pub fn set(&self, to: DateTime<Utc>) {
        if let Ok(mut now) = self.now.lock() {
            *now = to;
        }
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.lock().map(|now| *now).unwrap_or_else(|_| Utc::now())
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for keys and payloads.

    use super::*;
    use proptest::prelude::*;
    use serde_json::{Map, Value};

    /// Generate a valid entry key.
    pub fn arb_entry_key() -> impl Strategy<Value = EntryKey> {
        "[a-z][a-z0-9_:]{0,23}".prop_filter_map("valid entry key", |s| EntryKey::new(s).ok())
    }

    /// Generate a scalar JSON value.
    pub fn arb_scalar() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(Value::from),
            "[a-zA-Z0-9 ]{0,16}".prop_map(Value::String),
        ]
    }

    /// Generate an arbitrary JSON document of bounded depth.
    pub fn arb_document() -> impl Strategy<Value = Document> {
        arb_scalar().prop_recursive(3, 32, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
                prop::collection::btree_map("[a-z]{1,8}", inner, 0..4)
                    .prop_map(|fields| Value::Object(fields.into_iter().collect::<Map<_, _>>())),
            ]
        })
    }

    /// Generate a list of distinct profile ids.
    pub fn arb_profile_ids() -> impl Strategy<Value = Vec<String>> {
        prop::collection::btree_set("p[0-9]{1,4}", 0..8)
            .prop_map(|ids| ids.into_iter().collect())
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Payloads shaped like the application state the cache holds.

    use serde_json::json;

    use super::Document;

    /// A profile record with just an id.
    pub fn profile(id: &str) -> Document {
        json!({ "id": id })
    }

    /// A list of profile records.
    pub fn profile_list(ids: &[&str]) -> Document {
        Document::Array(ids.iter().map(|id| profile(id)).collect())
    }

    /// A settings object.
    pub fn settings(lang: &str, theme: &str) -> Document {
        json!({ "lang": lang, "theme": theme })
    }
}

// ============================================================================
// TESTS
// ============================================================================
