//! Error types for core domain parsing.

use thiserror::Error;

/// Primary error type for core type construction.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoreError {
    /// Info-hash text was not 40 hexadecimal characters.
    #[error("invalid info-hash")]
    InvalidInfoHash {
        /// Offending input.
        value: String,
    },
    /// Torrent phase label was not recognised.
    #[error("invalid torrent phase")]
    InvalidPhase {
        /// Offending input.
        value: String,
    },
}

/// Convenience alias for core results.
pub type CoreResult<T> = Result<T, CoreError>;
