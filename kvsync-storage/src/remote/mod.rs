//! Remote document store adapters.
//!
//! The remote store is reached through a [`RemoteHandle`], which connects at
//! most once per process and remembers the outcome. A failed connection
//! disables the remote for good; callers then run local-only.

pub mod http;
pub mod memory;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use kvsync_core::{Document, KvResult};
use tokio::sync::OnceCell;
use tracing::{info, warn};

/// Asynchronous document store addressed by key.
///
/// Every operation is idempotent on its own and may be retried by a
/// wrapping collaborator. The engine itself never retries.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Fetch the document for `key`. `Ok(None)` means not found.
    async fn get(&self, key: &str) -> KvResult<Option<Document>>;

    /// Store `document` under `key`, replacing any previous document.
    async fn set(&self, key: &str, document: &Document) -> KvResult<()>;

    /// Delete the document for `key`. Deleting a missing key succeeds.
    async fn delete(&self, key: &str) -> KvResult<()>;
}

/// Creates the process-wide remote store connection.
#[async_trait]
pub trait RemoteConnector: Send + Sync {
    async fn connect(&self) -> KvResult<Arc<dyn RemoteStore>>;
}

/// Connection state of a [`RemoteHandle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteState {
    /// No connection attempt has completed yet.
    Uninitialized,
    /// Connected; remote operations are performed.
    Available,
    /// The connection attempt failed; remote operations are skipped.
    Unavailable,
    /// No remote store is configured.
    Disabled,
}

/// Lazily connected, memoized remote store.
///
/// Concurrent first accesses share one connection attempt.
pub struct RemoteHandle {
    connector: Option<Arc<dyn RemoteConnector>>,
    cell: OnceCell<Option<Arc<dyn RemoteStore>>>,
    attempts: AtomicUsize,
}

impl RemoteHandle {
    /// Connect through `connector` on first use.
    pub fn new(connector: Arc<dyn RemoteConnector>) -> Self {
        Self {
            connector: Some(connector),
            cell: OnceCell::new(),
            attempts: AtomicUsize::new(0),
        }
    }

    /// A handle with no remote store; every access yields `None`.
    pub fn disabled() -> Self {
        Self {
            connector: None,
            cell: OnceCell::new_with(Some(None)),
            attempts: AtomicUsize::new(0),
        }
    }

    /// A handle wrapping an already connected store.
    pub fn connected(store: Arc<dyn RemoteStore>) -> Self {
        Self {
            connector: None,
            cell: OnceCell::new_with(Some(Some(store))),
            attempts: AtomicUsize::new(0),
        }
    }

    /// The remote store, connecting on first call.
    ///
    /// Returns `None` when the remote is disabled or the connection attempt
    /// failed. The failure is logged once.
    pub async fn store(&self) -> Option<Arc<dyn RemoteStore>> {
        self.cell
            .get_or_init(|| async {
                let Some(connector) = self.connector.as_ref() else {
                    return None;
                };
                self.attempts.fetch_add(1, Ordering::SeqCst);
                match connector.connect().await {
                    Ok(store) => {
                        info!("Remote store connected");
                        Some(store)
                    }
                    Err(e) => {
                        warn!(error = %e, "Remote store unavailable, running local-only");
                        None
                    }
                }
            })
            .await
            .clone()
    }

    /// Current connection state. Never triggers a connection attempt.
    pub fn state(&self) -> RemoteState {
        match self.cell.get() {
            Some(Some(_)) => RemoteState::Available,
            Some(None) if self.connector.is_none() => RemoteState::Disabled,
            Some(None) => RemoteState::Unavailable,
            None => RemoteState::Uninitialized,
        }
    }

    /// Number of connection attempts made so far (0 or 1).
    pub fn connect_attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for RemoteHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteHandle")
            .field("state", &self.state())
            .field("connect_attempts", &self.connect_attempts())
            .finish()
    }
}
