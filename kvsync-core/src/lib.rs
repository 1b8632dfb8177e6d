//! KVSYNC Core - Shared Types
//!
//! Keys, errors, configuration and the payload codec used by every other
//! crate in the workspace. Nothing in here performs I/O.

pub mod clock;
pub mod config;
pub mod error;
pub mod key;
pub mod payload;
pub mod signal;

pub use clock::{Clock, SystemClock};
pub use config::{SyncConfig, DEFAULT_TTL};
pub use error::{CodecError, ConfigError, KvResult, KvSyncError, RemoteOperation, StoreError};
pub use key::{EntryKey, TabId, ALL_KEYS};
pub use signal::{StorageEvent, StorageSignal};

/// Opaque JSON document held for one key.
pub type Document = serde_json::Value;
