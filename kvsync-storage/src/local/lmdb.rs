//! LMDB-backed durable local store.
//!
//! Uses the heed crate (Rust bindings for LMDB) so the local state survives
//! process restarts and can be shared by every process of one profile.
//!
//! # Record Format
//!
//! Each record is `[origin tab id: 16 bytes][payload: utf-8]`. The origin
//! lets a storage watcher tell one tab's writes from another's, which is
//! what keeps a tab from re-applying its own writes.
//!
//! # Change Detection
//!
//! LMDB has no change notification, so [`LmdbStorageWatcher`] polls: it
//! keeps a digest of every record and emits a [`StorageEvent`] for each
//! record whose digest changed since the previous scan.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use heed::types::{Bytes, Str};
use heed::{Database, Env, EnvOpenOptions};
use kvsync_core::{KvResult, KvSyncError, StorageEvent, StorageSignal, StoreError, TabId};
use sha2::{Digest, Sha256};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::LocalStore;

/// Length of the origin prefix of each record.
const ORIGIN_LEN: usize = 16;

/// Error type for LMDB store operations.
#[derive(Debug, thiserror::Error)]
pub enum LmdbStoreError {
    /// Failed to open or create the LMDB environment.
    #[error("Failed to open LMDB environment: {0}")]
    EnvOpen(String),

    /// Failed to open the database within the environment.
    #[error("Failed to open database: {0}")]
    DbOpen(String),

    /// Transaction error.
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// The environment reached its configured map size.
    #[error("Store is full: {0}")]
    Full(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<heed::Error> for LmdbStoreError {
    fn from(e: heed::Error) -> Self {
        match e {
            heed::Error::Mdb(heed::MdbError::MapFull) => Self::Full(e.to_string()),
            other => Self::Transaction(other.to_string()),
        }
    }
}

impl From<LmdbStoreError> for KvSyncError {
    fn from(e: LmdbStoreError) -> Self {
        StoreError::LocalUnavailable {
            reason: e.to_string(),
        }
        .into()
    }
}

/// Durable local store backed by LMDB.
///
/// Cloning is cheap; every clone shares the same environment. Use
/// [`LmdbLocalStore::for_tab`] to give another tab in the same process its
/// own origin.
///
/// # Example
///
/// ```ignore
/// let store = LmdbLocalStore::open("/var/lib/app/cache", 64, TabId::new())?;
/// store.set_item("settings", r#"{"lang":"en"}"#)?;
/// ```
#[derive(Clone)]
pub struct LmdbLocalStore {
    env: Env,
    db: Database<Str, Bytes>,
    origin: TabId,
}

impl LmdbLocalStore {
    /// Open (or create) a store.
    ///
    /// # Arguments
    ///
    /// * `path` - Directory where LMDB files are kept
    /// * `max_size_mb` - Maximum size of the database in megabytes
    /// * `origin` - Tab identity written into every record
    pub fn open<P: AsRef<Path>>(
        path: P,
        max_size_mb: usize,
        origin: TabId,
    ) -> Result<Self, LmdbStoreError> {
        std::fs::create_dir_all(&path)?;

        // SAFETY: the environment is opened once per store and every
        // process sharing the directory goes through this same code path.
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(max_size_mb * 1024 * 1024)
                .max_dbs(1)
                .open(path.as_ref())
        }
        .map_err(|e| LmdbStoreError::EnvOpen(e.to_string()))?;

        let mut wtxn = env.write_txn()?;
        let db: Database<Str, Bytes> = env
            .create_database(&mut wtxn, None)
            .map_err(|e| LmdbStoreError::DbOpen(e.to_string()))?;
        wtxn.commit()?;

        info!(path = %path.as_ref().display(), tab_id = %origin, "Opened local store");
        Ok(Self { env, db, origin })
    }

    /// A view of the same environment writing under another tab identity.
    pub fn for_tab(&self, tab_id: TabId) -> Self {
        Self {
            env: self.env.clone(),
            db: self.db,
            origin: tab_id,
        }
    }

    pub fn tab_id(&self) -> TabId {
        self.origin
    }

    /// Digest every record currently stored.
    fn scan(&self) -> Result<Vec<ScannedRecord>, LmdbStoreError> {
        let rtxn = self.env.read_txn()?;
        let mut records = Vec::new();
        for result in self.db.iter(&rtxn)? {
            let (key, bytes) = match result {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(error = %e, "Skipping unreadable record during scan");
                    continue;
                }
            };
            let digest = record_digest(bytes);
            let decoded = decode_record(bytes);
            records.push(ScannedRecord {
                key: key.to_string(),
                digest,
                origin: decoded.map(|(origin, _)| origin).unwrap_or_else(TabId::nil),
                value: decoded.map(|(_, value)| value.to_string()),
            });
        }
        Ok(records)
    }
}

impl std::fmt::Debug for LmdbLocalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LmdbLocalStore")
            .field("origin", &self.origin)
            .finish()
    }
}

fn record_digest(bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let mut digest = [0u8; 32];
    digest.copy_from_slice(&hasher.finalize());
    digest
}

fn encode_record(origin: TabId, value: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(ORIGIN_LEN + value.len());
    bytes.extend_from_slice(origin.as_bytes());
    bytes.extend_from_slice(value.as_bytes());
    bytes
}

fn decode_record(bytes: &[u8]) -> Option<(TabId, &str)> {
    if bytes.len() < ORIGIN_LEN {
        return None;
    }
    let origin: [u8; ORIGIN_LEN] = bytes[..ORIGIN_LEN].try_into().ok()?;
    let value = std::str::from_utf8(&bytes[ORIGIN_LEN..]).ok()?;
    Some((TabId::from_bytes(origin), value))
}

impl LocalStore for LmdbLocalStore {
    fn get_item(&self, key: &str) -> KvResult<Option<String>> {
        let rtxn = self.env.read_txn().map_err(|e| StoreError::LocalReadFailed {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        let bytes = self.db.get(&rtxn, key).map_err(|e| StoreError::LocalReadFailed {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        match bytes {
            Some(bytes) => match decode_record(bytes) {
                Some((_, value)) => Ok(Some(value.to_string())),
                None => {
                    warn!(key = %key, "Discarding malformed local record");
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    fn set_item(&self, key: &str, value: &str) -> KvResult<()> {
        let record = encode_record(self.origin, value);
        let write = || -> Result<(), LmdbStoreError> {
            let mut wtxn = self.env.write_txn()?;
            self.db.put(&mut wtxn, key, &record)?;
            wtxn.commit()?;
            Ok(())
        };
        write().map_err(|e| {
            StoreError::LocalWriteFailed {
                key: key.to_string(),
                reason: e.to_string(),
            }
            .into()
        })
    }

    fn remove_item(&self, key: &str) -> KvResult<()> {
        let remove = || -> Result<bool, LmdbStoreError> {
            let mut wtxn = self.env.write_txn()?;
            let deleted = self.db.delete(&mut wtxn, key)?;
            wtxn.commit()?;
            Ok(deleted)
        };
        let deleted = remove().map_err(|e| StoreError::LocalWriteFailed {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        debug!(key = %key, deleted = deleted, "Removed local record");
        Ok(())
    }
}

struct ScannedRecord {
    key: String,
    digest: [u8; 32],
    origin: TabId,
    value: Option<String>,
}

/// Diffs successive scans of a store.
struct StoragePoller {
    store: LmdbLocalStore,
    snapshot: HashMap<String, [u8; 32]>,
}

impl StoragePoller {
    /// Create a poller whose baseline is the store's current content.
    fn new(store: LmdbLocalStore) -> Result<Self, LmdbStoreError> {
        let snapshot = store
            .scan()?
            .into_iter()
            .map(|r| (r.key, r.digest))
            .collect();
        Ok(Self { store, snapshot })
    }

    /// Scan once and return the events for everything that changed.
    fn poll(&mut self) -> Result<Vec<StorageEvent>, LmdbStoreError> {
        let records = self.store.scan()?;
        let mut events = Vec::new();
        let mut next = HashMap::with_capacity(records.len());

        for record in records {
            let changed = self.snapshot.get(&record.key) != Some(&record.digest);
            if changed {
                events.push(StorageEvent::new(
                    record.key.clone(),
                    record.value.as_deref(),
                    record.origin,
                ));
            }
            next.insert(record.key, record.digest);
        }

        // The writer of a deletion is unknown; nil never matches a tab.
        for key in self.snapshot.keys() {
            if !next.contains_key(key) {
                events.push(StorageEvent::new(key.clone(), None, TabId::nil()));
            }
        }

        self.snapshot = next;
        Ok(events)
    }
}

/// Polling storage watcher for an [`LmdbLocalStore`].
///
/// Dropping the watcher stops polling.
pub struct LmdbStorageWatcher {
    events: broadcast::Sender<StorageEvent>,
    task: Option<JoinHandle<()>>,
}

impl LmdbStorageWatcher {
    /// Start polling `store` every `poll_interval` on the current runtime.
    ///
    /// Records present when the watcher starts do not produce events.
    pub fn spawn(
        store: LmdbLocalStore,
        poll_interval: Duration,
        capacity: usize,
    ) -> Result<Self, LmdbStoreError> {
        let (events, _rx) = broadcast::channel(capacity.max(1));
        let mut poller = StoragePoller::new(store)?;
        let sender = events.clone();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                match poller.poll() {
                    Ok(changes) => {
                        for event in changes {
                            let _ = sender.send(event);
                        }
                    }
                    Err(e) => warn!(error = %e, "Local store scan failed"),
                }
            }
        });

        Ok(Self {
            events,
            task: Some(task),
        })
    }
}

impl StorageSignal for LmdbStorageWatcher {
    fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
        self.events.subscribe()
    }
}

impl Drop for LmdbStorageWatcher {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_store() -> (LmdbLocalStore, TempDir) {
        let temp_dir = TempDir::new().expect("TempDir creation should succeed");
        let store = LmdbLocalStore::open(temp_dir.path(), 10, TabId::new())
            .expect("store creation should succeed");
        (store, temp_dir)
    }

    #[test]
    fn test_set_and_get() {
        let (store, _temp_dir) = create_test_store();
        store
            .set_item("profiles", r#"[{"id":"p1"}]"#)
            .expect("set should succeed");
        assert_eq!(
            store.get_item("profiles").expect("get should succeed"),
            Some(r#"[{"id":"p1"}]"#.to_string())
        );
    }

    #[test]
    fn test_get_missing() {
        let (store, _temp_dir) = create_test_store();
        assert_eq!(store.get_item("nothing").expect("get should succeed"), None);
    }

    #[test]
    fn test_overwrite_and_remove() {
        let (store, _temp_dir) = create_test_store();
        store.set_item("k", "1").expect("set should succeed");
        store.set_item("k", "2").expect("set should succeed");
        assert_eq!(store.get_item("k").expect("get"), Some("2".to_string()));

        store.remove_item("k").expect("remove should succeed");
        assert_eq!(store.get_item("k").expect("get"), None);
        store.remove_item("k").expect("second remove is a no-op");
    }

    #[test]
    fn test_survives_reopen() {
        let temp_dir = TempDir::new().expect("TempDir creation should succeed");
        {
            let store = LmdbLocalStore::open(temp_dir.path(), 10, TabId::new())
                .expect("store creation should succeed");
            store.set_item("settings", "{}").expect("set should succeed");
        }
        let reopened = LmdbLocalStore::open(temp_dir.path(), 10, TabId::new())
            .expect("reopen should succeed");
        assert_eq!(
            reopened.get_item("settings").expect("get"),
            Some("{}".to_string())
        );
    }

    #[test]
    fn test_record_roundtrip_keeps_origin() {
        let origin = TabId::new();
        let bytes = encode_record(origin, "[1,2]");
        let (decoded_origin, value) = decode_record(&bytes).expect("decode should succeed");
        assert_eq!(decoded_origin, origin);
        assert_eq!(value, "[1,2]");
        assert!(decode_record(&bytes[..4]).is_none());
    }

    #[test]
    fn test_poller_reports_changes_with_origin() {
        let (store, _temp_dir) = create_test_store();
        store.set_item("existing", "0").expect("set should succeed");

        let other_tab = store.for_tab(TabId::new());
        let mut poller = StoragePoller::new(store.clone()).expect("poller should start");
        assert!(poller.poll().expect("poll").is_empty());

        other_tab.set_item("profiles", "[]").expect("set should succeed");
        let events = poller.poll().expect("poll");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].key, "profiles");
        assert_eq!(events[0].new_value.as_deref(), Some("[]"));
        assert_eq!(events[0].origin, other_tab.tab_id());

        // Unchanged content produces nothing.
        other_tab.set_item("profiles", "[]").expect("set should succeed");
        assert!(poller.poll().expect("poll").is_empty());

        store.remove_item("existing").expect("remove should succeed");
        let events = poller.poll().expect("poll");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].key, "existing");
        assert_eq!(events[0].new_value, None);
        assert_eq!(events[0].origin, TabId::nil());
    }

    #[tokio::test]
    async fn test_watcher_emits_events() {
        let (store, _temp_dir) = create_test_store();
        let writer = store.for_tab(TabId::new());
        let watcher = LmdbStorageWatcher::spawn(store.clone(), Duration::from_millis(10), 16)
            .expect("watcher should start");
        let mut events = watcher.subscribe();

        writer.set_item("users", r#"["u1"]"#).expect("set should succeed");

        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("event within timeout")
            .expect("channel open");
        assert_eq!(event.key, "users");
        assert_eq!(event.origin, writer.tab_id());
    }
}
