//! Session configuration loaded from a JSON document.
//!
//! # Design
//!
//! - Every field has a default so a partial document is valid.
//! - `validate` runs before anything reaches the engine and reports the first offending field.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use seedbank_telemetry::{DEFAULT_LOG_LEVEL, LogFormat, LoggingConfig, build_sha};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::engine::EngineSettings;
use crate::tracker::{DEFAULT_PRELOAD_CAPACITY, DEFAULT_PRELOAD_TTL};

const MIN_ALERT_POLL_INTERVAL_MS: u64 = 10;

/// Configuration failure.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read configuration")]
    Io {
        /// File path.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },
    /// The document is not valid JSON for this schema.
    #[error("failed to parse configuration")]
    Parse {
        /// Underlying JSON error.
        #[source]
        source: serde_json::Error,
    },
    /// A field holds an unusable value.
    #[error("invalid configuration field")]
    InvalidField {
        /// Field name.
        field: &'static str,
        /// Offending value, when printable.
        value: Option<String>,
        /// Static reason.
        reason: &'static str,
    },
}

/// Logging section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Filter directive used when `RUST_LOG` is unset.
    pub level: String,
    /// `json` or `pretty`; inferred from the build profile when absent.
    pub format: Option<String>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: DEFAULT_LOG_LEVEL.to_string(),
            format: None,
        }
    }
}

impl LoggingSettings {
    #[must_use]
    /// Resolved output format.
    pub fn log_format(&self) -> LogFormat {
        LogFormat::from_name(self.format.as_deref())
    }

    #[must_use]
    /// Subscriber settings for [`seedbank_telemetry::init_logging`].
    pub fn logging_config(&self) -> LoggingConfig<'_> {
        LoggingConfig {
            level: &self.level,
            format: self.log_format(),
            build_sha: build_sha(),
        }
    }
}

/// Top-level session configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Directory of the fast-resume store.
    pub store_dir: PathBuf,
    /// Comma-separated `ip:port` list.
    pub listen_interfaces: String,
    /// Enable the DHT.
    pub enable_dht: bool,
    /// Allocate payload files up front.
    pub enable_file_preallocation: bool,
    /// Alert polling period of the worker.
    pub alert_poll_interval_ms: u64,
    /// Periodic resume-data save period of the worker; `0` disables it.
    pub resume_save_interval_secs: u64,
    /// Lifetime of buffered tracker state for unconfirmed torrents.
    pub preload_tracker_ttl_secs: u64,
    /// Maximum torrents with buffered tracker state.
    pub preload_tracker_capacity: usize,
    /// How long shutdown waits for outstanding resume data.
    pub shutdown_resume_timeout_secs: u64,
    /// Logging section.
    pub logging: LoggingSettings,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            store_dir: PathBuf::from("/var/lib/seedbank/torrents"),
            listen_interfaces: "0.0.0.0:6881,[::]:6881".to_string(),
            enable_dht: true,
            enable_file_preallocation: false,
            alert_poll_interval_ms: 500,
            resume_save_interval_secs: 300,
            preload_tracker_ttl_secs: DEFAULT_PRELOAD_TTL.as_secs(),
            preload_tracker_capacity: DEFAULT_PRELOAD_CAPACITY,
            shutdown_resume_timeout_secs: 30,
            logging: LoggingSettings::default(),
        }
    }
}

impl SessionConfig {
    /// Parse and validate a JSON document.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is malformed or a field is invalid.
    pub fn from_json_str(document: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(document).map_err(|source| ConfigError::Parse { source })?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or fails validation.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let document = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&document)
    }

    /// Check every field.
    ///
    /// # Errors
    ///
    /// Returns the first invalid field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.listen_addresses()?;
        if self.alert_poll_interval_ms < MIN_ALERT_POLL_INTERVAL_MS {
            return Err(ConfigError::InvalidField {
                field: "alert_poll_interval_ms",
                value: Some(self.alert_poll_interval_ms.to_string()),
                reason: "must be at least 10",
            });
        }
        if self.preload_tracker_ttl_secs == 0 {
            return Err(ConfigError::InvalidField {
                field: "preload_tracker_ttl_secs",
                value: Some("0".to_string()),
                reason: "must be positive",
            });
        }
        if self.preload_tracker_capacity == 0 {
            return Err(ConfigError::InvalidField {
                field: "preload_tracker_capacity",
                value: Some("0".to_string()),
                reason: "must be positive",
            });
        }
        if self.store_dir.as_os_str().is_empty() {
            return Err(ConfigError::InvalidField {
                field: "store_dir",
                value: None,
                reason: "must not be empty",
            });
        }
        Ok(())
    }

    /// Parsed listen interfaces.
    ///
    /// # Errors
    ///
    /// Returns an error if the list is empty or an entry is not a socket address.
    pub fn listen_addresses(&self) -> Result<Vec<SocketAddr>, ConfigError> {
        let addresses = self
            .listen_interfaces
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(|entry| {
                entry
                    .parse::<SocketAddr>()
                    .map_err(|_| ConfigError::InvalidField {
                        field: "listen_interfaces",
                        value: Some(entry.to_string()),
                        reason: "expected ip:port",
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        if addresses.is_empty() {
            return Err(ConfigError::InvalidField {
                field: "listen_interfaces",
                value: None,
                reason: "at least one interface is required",
            });
        }
        Ok(addresses)
    }

    /// Engine settings derived from this configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the listen interfaces are invalid.
    pub fn engine_settings(&self) -> Result<EngineSettings, ConfigError> {
        Ok(EngineSettings {
            listen_interfaces: self.listen_addresses()?,
            enable_dht: self.enable_dht,
            enable_file_preallocation: self.enable_file_preallocation,
        })
    }

    #[must_use]
    /// Worker alert polling period.
    pub const fn alert_poll_interval(&self) -> Duration {
        Duration::from_millis(self.alert_poll_interval_ms)
    }

    #[must_use]
    /// Worker periodic save period, if enabled.
    pub const fn resume_save_interval(&self) -> Option<Duration> {
        if self.resume_save_interval_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.resume_save_interval_secs))
        }
    }

    #[must_use]
    /// Buffered tracker state lifetime.
    pub const fn preload_tracker_ttl(&self) -> Duration {
        Duration::from_secs(self.preload_tracker_ttl_secs)
    }

    #[must_use]
    /// Shutdown wait for resume data.
    pub const fn shutdown_resume_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_resume_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn partial_document_uses_defaults() {
        let config = SessionConfig::from_json_str(r#"{"enable_dht": false}"#).expect("valid");
        assert!(!config.enable_dht);
        assert_eq!(config.alert_poll_interval(), Duration::from_millis(500));
        let settings = config.engine_settings().expect("settings");
        assert_eq!(settings.listen_interfaces.len(), 2);
        assert!(settings.listen_interfaces[1].is_ipv6());
    }

    #[test]
    fn malformed_interface_is_reported() {
        let err = SessionConfig::from_json_str(r#"{"listen_interfaces": "0.0.0.0:6881, eth0"}"#)
            .expect_err("invalid");
        match err {
            ConfigError::InvalidField { field, value, .. } => {
                assert_eq!(field, "listen_interfaces");
                assert_eq!(value.as_deref(), Some("eth0"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn bounds_are_enforced() {
        for document in [
            r#"{"alert_poll_interval_ms": 5}"#,
            r#"{"preload_tracker_ttl_secs": 0}"#,
            r#"{"preload_tracker_capacity": 0}"#,
            r#"{"listen_interfaces": " , "}"#,
        ] {
            assert!(matches!(
                SessionConfig::from_json_str(document),
                Err(ConfigError::InvalidField { .. })
            ));
        }
        assert!(matches!(
            SessionConfig::from_json_str("not json"),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn load_reads_file_and_logging_section() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        write!(
            file,
            r#"{{"resume_save_interval_secs": 0, "logging": {{"level": "debug", "format": "json"}}}}"#
        )
        .expect("write config");
        let config = SessionConfig::load(file.path()).expect("load");
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.log_format(), LogFormat::Json);
        let logging = config.logging.logging_config();
        assert_eq!(logging.level, "debug");
        assert_eq!(logging.format, LogFormat::Json);
        assert_eq!(config.resume_save_interval(), None);

        let missing = SessionConfig::load(Path::new("/nonexistent/seedbank.json"));
        assert!(matches!(missing, Err(ConfigError::Io { .. })));
    }
}
