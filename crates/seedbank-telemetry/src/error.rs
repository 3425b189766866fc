//! Failures raised while wiring logging and metrics.

use thiserror::Error;
use tracing_subscriber::filter::ParseError;
use tracing_subscriber::util::TryInitError;

/// Result alias for telemetry operations.
pub type Result<T> = std::result::Result<T, TelemetryError>;

/// Telemetry setup and rendering failures.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// A global subscriber was already installed.
    #[error("failed to install log subscriber")]
    Subscriber {
        /// Underlying subscriber error.
        #[source]
        source: TryInitError,
    },
    /// The configured or `RUST_LOG` filter directive does not parse.
    #[error("invalid log filter directive")]
    LogFilter {
        /// Directive as supplied.
        directive: String,
        /// Parser error.
        #[source]
        source: ParseError,
    },
    /// A session collector could not be built or registered.
    #[error("failed to set up metric collector")]
    Collector {
        /// Metric name.
        metric: &'static str,
        /// Underlying Prometheus error.
        #[source]
        source: prometheus::Error,
    },
    /// The registry could not be encoded in the text exposition format.
    #[error("failed to render metrics")]
    Render {
        /// Underlying Prometheus error.
        #[source]
        source: prometheus::Error,
    },
    /// Encoded metrics were not UTF-8.
    #[error("rendered metrics were not utf-8")]
    RenderUtf8 {
        /// Conversion error.
        #[source]
        source: std::string::FromUtf8Error,
    },
}
