//! Error types for KVSYNC operations

use thiserror::Error;

/// Payload encoding errors.
///
/// These are always recovered locally: a payload that cannot be decoded is
/// treated as absent and the caller's default is served until a later
/// refresh repairs the record.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("Failed to serialize payload for key {key}: {reason}")]
    Serialize { key: String, reason: String },

    #[error("Failed to deserialize payload for key {key}: {reason}")]
    Deserialize { key: String, reason: String },
}

/// Local and remote store errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Local read failed for key {key}: {reason}")]
    LocalReadFailed { key: String, reason: String },

    #[error("Local write failed for key {key}: {reason}")]
    LocalWriteFailed { key: String, reason: String },

    #[error("Local store unavailable: {reason}")]
    LocalUnavailable { reason: String },

    #[error("Remote store unavailable: {reason}")]
    RemoteUnavailable { reason: String },

    #[error("Remote {operation} failed for key {key}: {reason}")]
    RemoteOperationFailed {
        operation: RemoteOperation,
        key: String,
        reason: String,
    },

    #[error("Store lock poisoned")]
    LockPoisoned,
}

/// The remote call that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteOperation {
    Get,
    Set,
    Delete,
    Connect,
}

impl std::fmt::Display for RemoteOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Get => "get",
            Self::Set => "set",
            Self::Delete => "delete",
            Self::Connect => "connect",
        };
        f.write_str(name)
    }
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Invalid key {key:?}: {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("No async runtime available: {reason}")]
    RuntimeUnavailable { reason: String },

    #[error("Failed to initialize telemetry: {reason}")]
    TelemetryInit { reason: String },
}

/// Master error type for all KVSYNC errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KvSyncError {
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl KvSyncError {
    /// Returns true when the error means the remote backend cannot be used
    /// at all (as opposed to a single failed call).
    pub fn is_remote_unavailable(&self) -> bool {
        matches!(self, Self::Store(StoreError::RemoteUnavailable { .. }))
    }
}

/// Result type alias for KVSYNC operations.
pub type KvResult<T> = Result<T, KvSyncError>;

// =============================================================================
// TESTS
// =============================================================================
