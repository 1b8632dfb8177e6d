//! Several tabs sharing one local store.

mod support;

use std::sync::Arc;
use std::time::Duration;

use kvsync_engine::{SyncConfig, SyncEngine, Updater};
use kvsync_storage::{LmdbLocalStore, LmdbStorageWatcher, MemoryRemoteStore, SharedMemoryStore};
use kvsync_storage::LocalStore;
use kvsync_test_utils::{fixtures, wait_until, ManualClock, TabId};
use serde_json::{json, Value};

use support::{config, key, open_tab, profile, Profile, WAIT};

#[tokio::test]
async fn test_write_in_one_tab_reaches_the_other() {
    let shared = SharedMemoryStore::new();
    let server = MemoryRemoteStore::new();
    let clock = Arc::new(ManualClock::new());
    let a = open_tab(&shared, &server, &clock);
    let b = open_tab(&shared, &server, &clock);
    let k = key("profiles");

    // Tab B has the key open and fetched inside its staleness window.
    let _ = b.engine.get(&k, Vec::<Profile>::new());
    b.engine.flush().await;
    assert_eq!(b.remote.get_calls(), 1);

    let mut revisions = b.engine.watch(&k);
    a.engine.update(&k, Updater::Replace(vec![profile("p1")]));
    tokio::time::timeout(WAIT, revisions.changed())
        .await
        .expect("tab B notified in time")
        .expect("entry alive");

    let snapshot = b.engine.get(&k, Vec::<Profile>::new());
    assert_eq!(snapshot.value, vec![profile("p1")]);

    // B learned the value without a fetch of its own and never pushed it.
    b.engine.flush().await;
    assert_eq!(b.remote.get_calls(), 1);
    assert_eq!(b.remote.set_calls(), 0);
    assert_eq!(b.engine.stats().cross_tab_applies, 1);

    a.engine.flush().await;
    assert_eq!(a.remote.set_calls(), 1);
    assert_eq!(server.document("profiles"), Some(fixtures::profile_list(&["p1"])));
}

#[tokio::test]
async fn test_own_writes_are_not_reapplied() {
    let shared = SharedMemoryStore::new();
    let server = MemoryRemoteStore::new();
    let clock = Arc::new(ManualClock::new());
    let a = open_tab(&shared, &server, &clock);
    let k = key("settings");

    a.engine.update(&k, Updater::Replace(json!({"lang": "ta"})));
    a.engine.update(&k, Updater::Replace(json!({"lang": "te"})));
    a.engine.flush().await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(a.engine.stats().cross_tab_applies, 0);
    assert_eq!(a.engine.get(&k, Value::Null).value, json!({"lang": "te"}));
}

#[tokio::test]
async fn test_tab_opened_later_seeds_from_shared_store() {
    let shared = SharedMemoryStore::new();
    let server = MemoryRemoteStore::new();
    let clock = Arc::new(ManualClock::new());
    let a = open_tab(&shared, &server, &clock);
    let k = key("users");

    a.engine.update(&k, Updater::Replace(vec!["u1".to_string(), "u2".to_string()]));

    let b = open_tab(&shared, &server, &clock);
    let snapshot = b.engine.get(&k, Vec::<String>::new());
    assert_eq!(snapshot.value, vec!["u1".to_string(), "u2".to_string()]);
    assert!(!snapshot.is_loaded);
}

#[tokio::test]
async fn test_concurrent_updates_converge_on_last_writer() {
    let shared = SharedMemoryStore::new();
    let server = MemoryRemoteStore::new();
    let clock = Arc::new(ManualClock::new());
    let a = open_tab(&shared, &server, &clock);
    let b = open_tab(&shared, &server, &clock);
    let k = key("settings");

    // Both tabs have the entry open.
    let _ = a.engine.watch(&k);
    let mut b_revisions = b.engine.watch(&k);

    a.engine.update(&k, Updater::Replace(json!({"theme": "light"})));
    tokio::time::timeout(WAIT, b_revisions.changed())
        .await
        .expect("tab B notified in time")
        .expect("entry alive");

    let mut a_revisions = a.engine.watch(&k);
    b.engine.update(&k, Updater::Replace(json!({"theme": "dark"})));
    tokio::time::timeout(WAIT, a_revisions.changed())
        .await
        .expect("tab A notified in time")
        .expect("entry alive");

    assert_eq!(a.engine.get(&k, Value::Null).value, json!({"theme": "dark"}));
    assert_eq!(b.engine.get(&k, Value::Null).value, json!({"theme": "dark"}));
}

fn local_only_tab(shared: &Arc<SharedMemoryStore>) -> SyncEngine {
    SyncEngine::builder()
        .config(config())
        .shared_store(shared.clone())
        .local_only()
        .build()
        .expect("engine should build")
}

fn stored(shared: &Arc<SharedMemoryStore>, name: &str) -> Value {
    let raw = shared
        .tab(TabId::new())
        .get_item(name)
        .expect("local read")
        .expect("record present");
    serde_json::from_str(&raw).expect("stored JSON")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_writers_converge_on_local_store() {
    for round in 0..20 {
        let shared = SharedMemoryStore::new();
        let a = local_only_tab(&shared);
        let b = local_only_tab(&shared);
        let k = key("settings");
        let _ = a.watch(&k);
        let _ = b.watch(&k);

        let writers: Vec<_> = [("a", a.clone()), ("b", b.clone())]
            .into_iter()
            .map(|(tag, engine)| {
                let k = k.clone();
                std::thread::spawn(move || {
                    for i in 0..20 {
                        engine.update(&k, Updater::Replace(json!({ tag: i })));
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().expect("writer thread");
        }

        let converged = wait_until(WAIT, || {
            let expected = stored(&shared, "settings");
            a.get(&k, Value::Null).value == expected && b.get(&k, Value::Null).value == expected
        })
        .await;
        assert!(
            converged,
            "round {}: store={} a={} b={}",
            round,
            stored(&shared, "settings"),
            a.get(&k, Value::Null).value,
            b.get(&k, Value::Null).value
        );
        let last = stored(&shared, "settings");
        assert!(last == json!({ "a": 19 }) || last == json!({ "b": 19 }));
    }
}

#[tokio::test]
async fn test_lmdb_tabs_converge_through_polling() {
    let dir = tempfile::tempdir().expect("temp dir");
    let tab_a = TabId::new();
    let tab_b = TabId::new();
    let store = LmdbLocalStore::open(dir.path(), 16, tab_a).expect("open local store");
    let watcher = LmdbStorageWatcher::spawn(store.clone(), Duration::from_millis(10), 64)
        .expect("start watcher");

    let config = SyncConfig::new().with_poll_interval(Duration::from_millis(10));
    let a = SyncEngine::builder()
        .config(config.clone())
        .tab_id(tab_a)
        .local_store(Arc::new(store.clone()))
        .storage_signal(&watcher)
        .local_only()
        .build()
        .expect("engine A");
    let b = SyncEngine::builder()
        .config(config)
        .tab_id(tab_b)
        .local_store(Arc::new(store.for_tab(tab_b)))
        .storage_signal(&watcher)
        .local_only()
        .build()
        .expect("engine B");

    let k = key("messages");
    let mut revisions = b.watch(&k);
    a.update(&k, Updater::Replace(vec!["namaste".to_string()]));

    tokio::time::timeout(WAIT, revisions.changed())
        .await
        .expect("tab B notified in time")
        .expect("entry alive");
    assert_eq!(
        b.get(&k, Vec::<String>::new()).value,
        vec!["namaste".to_string()]
    );
    assert_eq!(a.stats().cross_tab_applies, 0);
}
