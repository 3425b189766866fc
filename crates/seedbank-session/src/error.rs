//! # Design
//!
//! - Keep error messages constant; store operational context in fields.
//! - Separate collaborator failures (`EngineError`, `StoreError`) from the caller-facing
//!   `SessionError` so the session decides what is fatal.

use std::path::PathBuf;

use seedbank_core::InfoHash;
use thiserror::Error;

use crate::config::ConfigError;

/// Failure reported by the engine collaborator.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine refused a command during validation.
    #[error("engine rejected command")]
    Rejected {
        /// Operation that was refused.
        operation: &'static str,
        /// Engine-provided reason.
        reason: String,
    },
    /// The command referenced a torrent the engine does not know.
    #[error("torrent unknown to engine")]
    UnknownTorrent {
        /// Torrent identifier.
        info_hash: InfoHash,
    },
    /// The engine can no longer service requests.
    #[error("engine unavailable")]
    Unavailable {
        /// Failure detail.
        detail: String,
    },
}

/// Failure reported by a torrent store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Filesystem operation failed.
    #[error("torrent store IO failure")]
    Io {
        /// Operation that triggered the failure.
        operation: &'static str,
        /// Path involved.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },
    /// Stored metadata could not be parsed or encoded.
    #[error("torrent store parse failure")]
    Parse {
        /// Operation that triggered the failure.
        operation: &'static str,
        /// Path involved.
        path: PathBuf,
        /// Underlying JSON error.
        #[source]
        source: serde_json::Error,
    },
    /// No record exists for the torrent.
    #[error("torrent not found in store")]
    NotFound {
        /// Torrent identifier.
        info_hash: InfoHash,
    },
}

/// Convenience alias for store results.
pub type StoreResult<T> = Result<T, StoreError>;

/// Caller-facing session error.
#[derive(Debug, Error)]
pub enum SessionError {
    /// A request failed validation before reaching the engine.
    #[error("invalid torrent input")]
    InvalidInput {
        /// Offending field.
        field: &'static str,
        /// Static reason.
        reason: &'static str,
    },
    /// The torrent is not registered with the session.
    #[error("torrent not found")]
    NotFound {
        /// Operation that was attempted.
        operation: &'static str,
        /// Torrent identifier.
        info_hash: InfoHash,
    },
    /// The engine refused the command.
    #[error("engine rejected command")]
    CommandRejected {
        /// Operation that was attempted.
        operation: &'static str,
        /// Torrent identifier, when known.
        info_hash: Option<InfoHash>,
        /// Engine failure.
        #[source]
        source: EngineError,
    },
    /// The engine is gone; the session cannot continue.
    #[error("engine unavailable")]
    EngineUnavailable {
        /// Engine failure.
        #[source]
        source: EngineError,
    },
    /// The durable store failed.
    #[error("torrent store failure")]
    Store {
        /// Operation that was attempted.
        operation: &'static str,
        /// Store failure.
        #[source]
        source: StoreError,
    },
    /// The session configuration is unusable.
    #[error("invalid session configuration")]
    Config {
        /// Configuration failure.
        #[source]
        source: ConfigError,
    },
    /// Initial torrents were already submitted for this session.
    #[error("initial torrents already loaded")]
    InitialLoadStarted,
    /// The background worker has stopped.
    #[error("session worker stopped")]
    WorkerStopped,
}

impl SessionError {
    #[must_use]
    /// Whether the session must be torn down.
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::EngineUnavailable { .. } | Self::WorkerStopped)
    }
}

/// Convenience alias for session results.
pub type SessionResult<T> = Result<T, SessionError>;

/// Classify an engine failure for a command.
pub(crate) fn engine_failure(
    operation: &'static str,
    info_hash: Option<InfoHash>,
    source: EngineError,
) -> SessionError {
    match source {
        EngineError::Unavailable { .. } => SessionError::EngineUnavailable { source },
        other => SessionError::CommandRejected {
            operation,
            info_hash,
            source: other,
        },
    }
}
