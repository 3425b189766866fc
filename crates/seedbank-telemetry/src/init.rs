//! Log subscriber installation for the session process.
//!
//! `RUST_LOG` overrides the configured level. Unlike a silent fallback, a directive that does not
//! parse is reported, so a typo in the config surfaces at startup.

use once_cell::sync::OnceCell;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::error::{Result, TelemetryError};

/// Level used when neither the config nor `RUST_LOG` names one.
pub const DEFAULT_LOG_LEVEL: &str = "info";

const FILTER_ENV: &str = "RUST_LOG";

static BUILD_SHA: OnceCell<String> = OnceCell::new();

/// Output encoding of the log subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per event.
    Json,
    /// Human-readable lines.
    Pretty,
}

impl LogFormat {
    /// Pretty in debug builds, JSON in release builds.
    #[must_use]
    pub const fn infer() -> Self {
        if cfg!(debug_assertions) {
            Self::Pretty
        } else {
            Self::Json
        }
    }

    /// Resolve a configured name; unknown or missing names fall back to [`Self::infer`].
    #[must_use]
    pub fn from_name(name: Option<&str>) -> Self {
        match name.map(str::trim) {
            Some(name) if name.eq_ignore_ascii_case("json") => Self::Json,
            Some(name) if name.eq_ignore_ascii_case("pretty") => Self::Pretty,
            _ => Self::infer(),
        }
    }

    /// Name accepted by [`Self::from_name`].
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Pretty => "pretty",
        }
    }
}

/// Inputs to [`init_logging`].
#[derive(Debug, Clone)]
pub struct LoggingConfig<'a> {
    /// Filter directive used when `RUST_LOG` is unset.
    pub level: &'a str,
    /// Output encoding.
    pub format: LogFormat,
    /// Build identifier stamped on the startup event.
    pub build_sha: &'a str,
}

impl Default for LoggingConfig<'_> {
    fn default() -> Self {
        Self {
            level: DEFAULT_LOG_LEVEL,
            format: LogFormat::infer(),
            build_sha: build_sha(),
        }
    }
}

/// Install the global subscriber and log the build it belongs to.
///
/// # Errors
///
/// Returns [`TelemetryError::LogFilter`] for an unparsable directive and
/// [`TelemetryError::Subscriber`] if a subscriber is already installed.
pub fn init_logging(config: &LoggingConfig<'_>) -> Result<()> {
    let env_directive = std::env::var(FILTER_ENV).ok();
    let filter = log_filter(config.level, env_directive.as_deref())?;
    BUILD_SHA.get_or_init(|| config.build_sha.to_string());

    let (json, pretty) = match config.format {
        LogFormat::Json => (Some(fmt::layer().json().with_target(true)), None),
        LogFormat::Pretty => (None, Some(fmt::layer().with_target(true))),
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(json)
        .with(pretty)
        .try_init()
        .map_err(|source| TelemetryError::Subscriber { source })?;

    info!(
        build_sha = build_sha(),
        format = config.format.as_str(),
        "logging initialised"
    );
    Ok(())
}

/// Build identifier recorded by [`init_logging`], or `dev` before it runs.
#[must_use]
pub fn build_sha() -> &'static str {
    BUILD_SHA.get().map_or("dev", String::as_str)
}

fn log_filter(level: &str, env_directive: Option<&str>) -> Result<EnvFilter> {
    let directive = env_directive
        .map(str::trim)
        .filter(|directive| !directive.is_empty())
        .unwrap_or(level);
    EnvFilter::try_new(directive).map_err(|source| TelemetryError::LogFilter {
        directive: directive.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_names_resolve_case_insensitively() {
        assert_eq!(LogFormat::from_name(Some("JSON")), LogFormat::Json);
        assert_eq!(LogFormat::from_name(Some(" pretty ")), LogFormat::Pretty);
        assert_eq!(LogFormat::from_name(Some("xml")), LogFormat::infer());
        assert_eq!(LogFormat::from_name(None), LogFormat::infer());
        assert_eq!(LogFormat::from_name(Some(LogFormat::Json.as_str())), LogFormat::Json);
    }

    #[test]
    fn environment_directive_overrides_configured_level() {
        let filter = log_filter("info", Some("seedbank_session=trace")).expect("valid");
        assert!(filter.to_string().contains("seedbank_session=trace"));

        let filter = log_filter("debug", Some("  ")).expect("valid");
        assert_eq!(filter.to_string(), "debug");
    }

    #[test]
    fn unparsable_directive_is_reported() {
        let err = log_filter("seedbank=loud", None).expect_err("bad level");
        assert!(matches!(
            err,
            TelemetryError::LogFilter { ref directive, .. } if directive == "seedbank=loud"
        ));
    }

    #[test]
    fn second_install_is_rejected() {
        let config = LoggingConfig {
            level: "warn",
            format: LogFormat::Pretty,
            build_sha: "abc123",
        };
        let first = init_logging(&config);
        let second = init_logging(&config);
        assert!(matches!(second, Err(TelemetryError::Subscriber { .. })) || first.is_err());
        assert_eq!(build_sha(), "abc123");
    }
}
