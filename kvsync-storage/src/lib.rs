//! KVSYNC Storage - Local and Remote Store Adapters
//!
//! Two kinds of store sit underneath the sync engine:
//!
//! - a **local** store: synchronous, durable, shared by every tab of one
//!   profile ([`LocalStore`]);
//! - a **remote** document store: asynchronous, may be slow or unreachable,
//!   connected lazily once per process ([`RemoteStore`], [`RemoteHandle`]).
//!
//! Both move opaque serialized payloads; neither inspects them.

pub mod local;
pub mod remote;

pub use local::lmdb::{LmdbLocalStore, LmdbStorageWatcher, LmdbStoreError};
pub use local::shared::{SharedMemoryStore, TabLocalStore};
pub use local::LocalStore;
pub use remote::http::{HttpRemoteConnector, HttpRemoteStore};
pub use remote::memory::MemoryRemoteStore;
pub use remote::{RemoteConnector, RemoteHandle, RemoteState, RemoteStore};
