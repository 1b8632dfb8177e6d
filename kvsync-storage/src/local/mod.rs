//! Local durable store adapters.

pub mod lmdb;
pub mod shared;

use kvsync_core::KvResult;

/// Synchronous string key-value store shared by all tabs of one profile.
///
/// Mirrors the `getItem`/`setItem`/`removeItem` contract of a browser's
/// local storage: values are opaque strings, writes are visible to the
/// writer immediately.
pub trait LocalStore: Send + Sync {
    /// Read the record for `key`.
    fn get_item(&self, key: &str) -> KvResult<Option<String>>;

    /// Write the record for `key`, replacing any previous value.
    fn set_item(&self, key: &str, value: &str) -> KvResult<()>;

    /// Delete the record for `key`. Deleting a missing key is not an error.
    fn remove_item(&self, key: &str) -> KvResult<()>;
}
