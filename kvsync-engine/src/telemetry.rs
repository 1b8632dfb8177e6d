//! Tracing subscriber setup.

use kvsync_core::{ConfigError, KvResult};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter used when `RUST_LOG` is not set.
pub const DEFAULT_FILTER: &str =
    "kvsync_core=debug,kvsync_events=debug,kvsync_storage=debug,kvsync_engine=debug,info";

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per line.
    Json,
    /// Human-readable lines.
    Text,
}

/// Telemetry configuration from environment variables.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Output format
    pub format: LogFormat,
    /// Filter directives applied when `RUST_LOG` is unset
    pub default_filter: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Json,
            default_filter: DEFAULT_FILTER.to_string(),
        }
    }
}

impl TelemetryConfig {
    /// Read `KVSYNC_LOG_FORMAT` (`json` or `text`, default `json`).
    pub fn from_env() -> Self {
        let format = match std::env::var("KVSYNC_LOG_FORMAT")
            .map(|s| s.trim().to_ascii_lowercase())
            .as_deref()
        {
            Ok("text") | Ok("pretty") => LogFormat::Text,
            _ => LogFormat::Json,
        };
        Self {
            format,
            ..Default::default()
        }
    }
}

/// Install the global tracing subscriber.
///
/// Call once at startup. A second call fails because a subscriber is
/// already installed.
pub fn init_tracing(config: &TelemetryConfig) -> KvResult<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.default_filter));

    let json_layer = (config.format == LogFormat::Json).then(|| fmt::layer().json());
    let text_layer = (config.format == LogFormat::Text).then(|| fmt::layer());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .with(text_layer)
        .try_init()
        .map_err(|e| ConfigError::TelemetryInit {
            reason: e.to_string(),
        })?;

    tracing::info!(format = ?config.format, "Telemetry initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_telemetry_config_default() {
        let config = TelemetryConfig::default();
        assert_eq!(config.format, LogFormat::Json);
        assert!(config.default_filter.contains("kvsync_engine=debug"));
    }

    #[test]
    fn test_init_tracing_twice_fails() {
        let config = TelemetryConfig {
            format: LogFormat::Text,
            ..Default::default()
        };
        // The first call may already have happened in another test of this
        // binary; the second is always rejected.
        let _ = init_tracing(&config);
        let err = init_tracing(&config).expect_err("subscriber already installed");
        assert!(err.to_string().contains("telemetry"));
    }
}
