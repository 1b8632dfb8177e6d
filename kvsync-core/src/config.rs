//! Sync engine configuration.
//!
//! Configuration is loaded from environment variables with defaults that
//! suit a single interactive client.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;

/// Default staleness window between remote fetches of one key.
pub const DEFAULT_TTL: Duration = Duration::from_secs(30);

/// Configuration for a sync engine and the adapters it is wired to.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    /// Staleness window: a key fetched less than `ttl` ago is served from
    /// memory without contacting the remote store.
    pub ttl: Duration,

    /// Maximum number of remote pushes running at the same time.
    pub push_concurrency: usize,

    /// Capacity of the cross-tab storage event channel. Slow bridges that
    /// fall further behind than this skip events (and log it).
    pub bridge_capacity: usize,

    /// How often a polling storage watcher scans the local store.
    pub poll_interval: Duration,

    /// Directory of the durable local store. `None` selects an in-memory
    /// store.
    pub local_store_path: Option<PathBuf>,

    /// Maximum size of the durable local store in megabytes.
    pub local_store_max_mb: usize,

    /// Base URL of the remote document store. `None` runs local-only.
    pub remote_url: Option<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_TTL,
            push_concurrency: 8,
            bridge_capacity: 256,
            poll_interval: Duration::from_millis(500),
            local_store_path: None,
            local_store_max_mb: 64,
            remote_url: None,
        }
    }
}

impl SyncConfig {
    /// Create a config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a config from environment variables.
    ///
    /// Environment variables:
    /// - `KVSYNC_TTL_SECS`: staleness window in seconds (default: 30)
    /// - `KVSYNC_PUSH_CONCURRENCY`: concurrent remote pushes (default: 8)
    /// - `KVSYNC_BRIDGE_CAPACITY`: cross-tab event buffer (default: 256)
    /// - `KVSYNC_POLL_INTERVAL_MS`: storage watcher poll interval (default: 500)
    /// - `KVSYNC_LOCAL_STORE_PATH`: durable local store directory (default: in-memory)
    /// - `KVSYNC_LOCAL_STORE_MAX_MB`: durable local store size (default: 64)
    /// - `KVSYNC_REMOTE_URL`: remote document store base URL (default: none)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let ttl = env_parse::<u64>("KVSYNC_TTL_SECS")
            .map(Duration::from_secs)
            .unwrap_or(defaults.ttl);

        let push_concurrency =
            env_parse("KVSYNC_PUSH_CONCURRENCY").unwrap_or(defaults.push_concurrency);

        let bridge_capacity =
            env_parse("KVSYNC_BRIDGE_CAPACITY").unwrap_or(defaults.bridge_capacity);

        let poll_interval = env_parse::<u64>("KVSYNC_POLL_INTERVAL_MS")
            .map(Duration::from_millis)
            .unwrap_or(defaults.poll_interval);

        let local_store_path = std::env::var("KVSYNC_LOCAL_STORE_PATH")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from);

        let local_store_max_mb =
            env_parse("KVSYNC_LOCAL_STORE_MAX_MB").unwrap_or(defaults.local_store_max_mb);

        let remote_url = std::env::var("KVSYNC_REMOTE_URL")
            .ok()
            .map(|s| s.trim().trim_end_matches('/').to_string())
            .filter(|s| !s.is_empty());

        Self {
            ttl,
            push_concurrency,
            bridge_capacity,
            poll_interval,
            local_store_path,
            local_store_max_mb,
            remote_url,
        }
    }

    /// Set the staleness window.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Set the remote push concurrency limit.
    pub fn with_push_concurrency(mut self, limit: usize) -> Self {
        self.push_concurrency = limit;
        self
    }

    /// Set the cross-tab event buffer capacity.
    pub fn with_bridge_capacity(mut self, capacity: usize) -> Self {
        self.bridge_capacity = capacity;
        self
    }

    /// Set the storage watcher poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Use a durable local store at the given directory.
    pub fn with_local_store_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.local_store_path = Some(path.into());
        self
    }

    /// Set the maximum size of the durable local store.
    pub fn with_local_store_max_mb(mut self, max_mb: usize) -> Self {
        self.local_store_max_mb = max_mb;
        self
    }

    /// Set the remote document store base URL.
    pub fn with_remote_url(mut self, url: impl Into<String>) -> Self {
        self.remote_url = Some(url.into());
        self
    }

    /// Check that every value is usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ttl.is_zero() {
            return Err(invalid("ttl", "0s", "must be greater than zero"));
        }
        if self.push_concurrency == 0 {
            return Err(invalid("push_concurrency", "0", "must be at least 1"));
        }
        if self.bridge_capacity == 0 {
            return Err(invalid("bridge_capacity", "0", "must be at least 1"));
        }
        if self.poll_interval.is_zero() {
            return Err(invalid("poll_interval", "0ms", "must be greater than zero"));
        }
        if self.local_store_max_mb == 0 {
            return Err(invalid("local_store_max_mb", "0", "must be at least 1"));
        }
        if let Some(url) = &self.remote_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(invalid("remote_url", url, "must be an http(s) URL"));
            }
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

fn invalid(field: &str, value: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = SyncConfig::default();
        assert_eq!(config.ttl, Duration::from_secs(30));
        assert!(config.remote_url.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = SyncConfig::new()
            .with_ttl(Duration::from_secs(5))
            .with_push_concurrency(2)
            .with_bridge_capacity(16)
            .with_poll_interval(Duration::from_millis(50))
            .with_local_store_path("/tmp/kvsync")
            .with_local_store_max_mb(128)
            .with_remote_url("https://store.example.com");

        assert_eq!(config.ttl, Duration::from_secs(5));
        assert_eq!(config.push_concurrency, 2);
        assert_eq!(config.bridge_capacity, 16);
        assert_eq!(config.poll_interval, Duration::from_millis(50));
        assert_eq!(config.local_store_path, Some(PathBuf::from("/tmp/kvsync")));
        assert_eq!(config.local_store_max_mb, 128);
        assert_eq!(
            config.remote_url.as_deref(),
            Some("https://store.example.com")
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_ttl() {
        let config = SyncConfig::new().with_ttl(Duration::ZERO);
        let err = config.validate().expect_err("zero ttl must be rejected");
        assert!(matches!(err, ConfigError::InvalidValue { ref field, .. } if field == "ttl"));
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        let config = SyncConfig::new().with_push_concurrency(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_store_size() {
        let config = SyncConfig::new().with_local_store_max_mb(0);
        let err = config.validate().expect_err("zero size must be rejected");
        assert!(
            matches!(err, ConfigError::InvalidValue { ref field, .. } if field == "local_store_max_mb")
        );
    }

    #[test]
    fn test_validate_rejects_non_http_remote() {
        let config = SyncConfig::new().with_remote_url("ftp://store");
        assert!(config.validate().is_err());
    }
}
