//! Tracing subscriber setup.
//!
//! Call [`init_tracing`] once at startup, before any event is emitted.

use std::str::FromStr;

use ember_core::{ConfigError, EmberResult};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_FILTER: &str = "ember_repo=info,ember_storage=info,warn";

/// Output encoding of log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

impl FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "pretty" | "text" => Ok(LogFormat::Pretty),
            other => Err(ConfigError::InvalidValue {
                field: "EMBER_LOG_FORMAT".to_string(),
                value: other.to_string(),
                reason: "expected json or pretty".to_string(),
            }),
        }
    }
}

/// Telemetry configuration from environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    pub format: LogFormat,
    /// Used when `RUST_LOG` is unset.
    pub filter: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            filter: DEFAULT_FILTER.to_string(),
        }
    }
}

impl TelemetryConfig {
    /// # Environment Variables
    /// - `EMBER_LOG_FORMAT`: `json` or `pretty` (default: json; unknown values fall back)
    /// - `EMBER_LOG_FILTER`: Directive used when `RUST_LOG` is unset
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            format: std::env::var("EMBER_LOG_FORMAT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.format),
            filter: std::env::var("EMBER_LOG_FILTER").unwrap_or(defaults.filter),
        }
    }
}

/// Install the global subscriber. A second call fails with
/// [`ConfigError::TelemetryInit`].
pub fn init_tracing(config: &TelemetryConfig) -> EmberResult<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.filter));

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = match config.format {
        LogFormat::Json => registry.with(fmt::layer().json()).try_init(),
        LogFormat::Pretty => registry.with(fmt::layer().pretty()).try_init(),
    };
    result.map_err(|e| ConfigError::TelemetryInit {
        reason: e.to_string(),
    })?;

    tracing::info!(format = ?config.format, "Telemetry initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EnvVarGuard {
        key: &'static str,
        original: Option<String>,
    }

    impl EnvVarGuard {
        fn set(key: &'static str, value: Option<&str>) -> Self {
            let original = std::env::var(key).ok();
            match value {
                Some(v) => std::env::set_var(key, v),
                None => std::env::remove_var(key),
            }
            Self { key, original }
        }
    }

    impl Drop for EnvVarGuard {
        fn drop(&mut self) {
            match self.original.as_deref() {
                Some(v) => std::env::set_var(self.key, v),
                None => std::env::remove_var(self.key),
            }
        }
    }

    #[test]
    fn test_telemetry_config_from_env() {
        let _format = EnvVarGuard::set("EMBER_LOG_FORMAT", Some("Pretty"));
        let _filter = EnvVarGuard::set("EMBER_LOG_FILTER", Some("debug"));
        let config = TelemetryConfig::from_env();
        assert_eq!(config.format, LogFormat::Pretty);
        assert_eq!(config.filter, "debug");

        // Unknown formats fall back to the default.
        let _unknown = EnvVarGuard::set("EMBER_LOG_FORMAT", Some("xml"));
        assert_eq!(TelemetryConfig::from_env().format, LogFormat::Json);
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_second_init_is_an_error() {
        let config = TelemetryConfig::default();
        let _ = init_tracing(&config);
        let second = init_tracing(&config);
        assert!(matches!(
            second,
            Err(ember_core::EmberError::Config(ConfigError::TelemetryInit { .. }))
        ));
    }
}
