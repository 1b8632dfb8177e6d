//! Behavior when the remote store cannot be reached.

mod support;

use std::sync::Arc;

use kvsync_engine::{RefreshOutcome, RemoteState, SyncEngine, Updater};
use kvsync_storage::{LocalStore, SharedMemoryStore};
use kvsync_test_utils::{FailingConnector, TabId};
use serde_json::Value;

use support::{config, key, profile, Profile};

fn engine_with_broken_remote(
    shared: &Arc<SharedMemoryStore>,
) -> (SyncEngine, Arc<FailingConnector>) {
    let connector = Arc::new(FailingConnector::new());
    let engine = SyncEngine::builder()
        .config(config())
        .shared_store(shared.clone())
        .remote_connector(connector.clone())
        .build()
        .expect("engine should build");
    (engine, connector)
}

#[tokio::test]
async fn test_unreachable_remote_degrades_to_local_cache() {
    let shared = SharedMemoryStore::new();
    let (engine, connector) = engine_with_broken_remote(&shared);
    let k = key("profiles");

    engine.update(&k, Updater::Replace(vec![profile("p1")]));
    let _ = engine.get(&k, Vec::<Profile>::new());
    engine.flush().await;

    assert_eq!(engine.remote_state(), RemoteState::Unavailable);
    assert_eq!(connector.attempts(), 1);

    engine.update(
        &k,
        Updater::apply(|mut list: Vec<Profile>| {
            list.push(profile("p2"));
            list
        }),
    );
    let snapshot = engine.get(&k, Vec::<Profile>::new());
    assert_eq!(snapshot.value, vec![profile("p1"), profile("p2")]);
    assert!(!snapshot.is_loaded);

    let raw = shared
        .tab(TabId::new())
        .get_item("profiles")
        .expect("local read");
    assert_eq!(raw.as_deref(), Some(r#"[{"id":"p1"},{"id":"p2"}]"#));
}

#[tokio::test]
async fn test_connection_attempted_once_for_many_keys() {
    let shared = SharedMemoryStore::new();
    let (engine, connector) = engine_with_broken_remote(&shared);

    for name in ["profiles", "users", "messages", "settings"] {
        let _ = engine.get(&key(name), Value::Null);
        engine.update(&key(name), Updater::Replace(Value::Bool(true)));
    }
    engine.flush().await;

    for name in ["profiles", "users", "messages", "settings"] {
        let _ = engine.get(&key(name), Value::Null);
    }
    engine.flush().await;

    assert_eq!(connector.attempts(), 1);
    let stats = engine.stats();
    assert_eq!(stats.remote_fetches, 0);
    assert_eq!(stats.remote_pushes, 0);
    assert_eq!(engine.background_tasks(), 0);
}

#[tokio::test]
async fn test_refresh_reports_local_only() {
    let shared = SharedMemoryStore::new();
    let (engine, _connector) = engine_with_broken_remote(&shared);
    let k = key("settings");

    assert_eq!(engine.refresh(&k, true).await, RefreshOutcome::LocalOnly);
    // Once the failure is memoized no further attempt is made.
    assert_eq!(engine.refresh(&k, true).await, RefreshOutcome::LocalOnly);
    assert_eq!(engine.remote_state(), RemoteState::Unavailable);
}

#[tokio::test]
async fn test_disabled_remote_never_spawns_work() {
    let engine = SyncEngine::builder()
        .config(config())
        .local_only()
        .build()
        .expect("engine should build");
    let k = key("users");

    engine.update(&k, Updater::Replace(vec!["u1".to_string()]));
    let snapshot = engine.get(&k, Vec::<String>::new());
    assert_eq!(snapshot.value, vec!["u1".to_string()]);
    assert_eq!(engine.background_tasks(), 0);
    assert_eq!(engine.remote_state(), RemoteState::Disabled);
}
