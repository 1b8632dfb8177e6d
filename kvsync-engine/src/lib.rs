//! KVSYNC Engine - Key-Value Synchronization Cache
//!
//! Keeps shared application state (profiles, users, messages, settings)
//! synchronously readable while it is backed by a remote document store.
//!
//! ```text
//!   consumer ── get ──▶ memory ◀── seed ── local store ◀──┐
//!      │                  ▲                               │ storage events
//!      │ update           │ refresh (TTL gated)           │ (other tabs)
//!      ▼                  │                               │
//!   memory ─▶ local store ─▶ change bus        cross-tab bridge
//!      │
//!      └── background push ──▶ remote store
//! ```
//!
//! Reads never wait for the network and never fail. Remote trouble degrades
//! the engine to a local-only cache.

mod builder;
mod engine;
mod entry;
pub mod global;
mod stats;
mod tasks;
pub mod telemetry;

pub use builder::SyncEngineBuilder;
pub use engine::{RefreshOutcome, Snapshot, SyncEngine, Updater};
pub use stats::EngineStats;
pub use telemetry::{init_tracing, LogFormat, TelemetryConfig};

pub use kvsync_core::{EntryKey, KvResult, KvSyncError, SyncConfig, TabId};
pub use kvsync_storage::RemoteState;
