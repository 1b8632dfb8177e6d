//! Entry keys and tab identities.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ConfigError;

/// Reserved key that addresses every subscriber at once.
///
/// Only the force-refresh broadcast is allowed to publish on it, so it can
/// never be used as the key of an entry.
pub const ALL_KEYS: &str = "*";

/// Key of a cached entry.
///
/// One key corresponds to exactly one local-store record and one remote
/// document. Keys are cheap to clone.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntryKey(Arc<str>);

impl EntryKey {
    /// Create a validated key.
    ///
    /// Rejects empty or whitespace-only keys and the reserved [`ALL_KEYS`]
    /// sentinel.
    pub fn new(key: impl Into<String>) -> Result<Self, ConfigError> {
        let key = key.into();
        if key.trim().is_empty() {
            return Err(ConfigError::InvalidKey {
                key,
                reason: "key must not be empty".to_string(),
            });
        }
        if key == ALL_KEYS {
            return Err(ConfigError::InvalidKey {
                key,
                reason: "reserved for the all-keys broadcast".to_string(),
            });
        }
        Ok(Self(Arc::from(key)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for EntryKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for EntryKey {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&str> for EntryKey {
    type Error = ConfigError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<EntryKey> for String {
    fn from(key: EntryKey) -> Self {
        key.0.to_string()
    }
}

/// Identity of one process ("tab") sharing a local store with others.
///
/// Uses UUIDv7 so identities sort by creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TabId(Uuid);

impl TabId {
    /// Generate a fresh tab identity.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// Nil identity, used for records written by an unknown process.
    pub fn nil() -> Self {
        Self(Uuid::nil())
    }
}

impl Default for TabId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TabId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
