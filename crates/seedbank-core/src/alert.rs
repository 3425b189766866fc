//! Alerts delivered by the protocol engine.
//!
//! The engine emits a heterogeneous, best-effort alert stream. Every kind the session
//! understands has a variant here; anything else arrives as [`AlertKind::Unknown`] and is
//! dropped by the dispatcher.

use std::fmt::{self, Display, Formatter};
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{InfoHash, TorrentFileEntry, TorrentStatusSnapshot};

/// Tracker announce event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnnounceEvent {
    /// Regular interval announce.
    None,
    /// Download completed.
    Completed,
    /// First announce.
    Started,
    /// Torrent stopped.
    Stopped,
}

/// Error details attached to a tracker error alert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerErrorDetail {
    /// Error message from the engine's error code.
    pub message: String,
    /// Free-form message returned by the tracker (may be empty).
    pub detail: String,
    /// Error category name (e.g. `system`, `http`).
    pub category: String,
    /// Numeric error value within the category.
    pub code: i32,
}

/// Local socket the engine listens on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ListenEndpoint {
    /// Bound address.
    pub address: IpAddr,
    /// Bound port.
    pub port: u16,
}

impl ListenEndpoint {
    #[must_use]
    /// Stable key, `listen_<address>_<port>`.
    pub fn key(&self) -> String {
        format!("listen_{}_{}", self.address, self.port)
    }
}

impl Display for ListenEndpoint {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        match self.address {
            IpAddr::V4(address) => write!(formatter, "{address}:{}", self.port),
            IpAddr::V6(address) => write!(formatter, "[{address}]:{}", self.port),
        }
    }
}

/// One alert popped from the engine queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlertKind {
    /// An add request completed, successfully or not.
    TorrentAdded {
        /// Torrent identifier.
        info_hash: InfoHash,
        /// Failure reason when the add did not succeed.
        error: Option<String>,
        /// Status at the time of the add.
        status: TorrentStatusSnapshot,
        /// File layout from the metainfo.
        files: Vec<TorrentFileEntry>,
    },
    /// Statuses of torrents that changed since the last update request.
    StateUpdate {
        /// Changed statuses.
        statuses: Vec<TorrentStatusSnapshot>,
    },
    /// Sample of the engine's counter array.
    SessionStats {
        /// Counter values indexed by engine counter index.
        counters: Vec<i64>,
    },
    /// All wanted pieces are downloaded.
    TorrentFinished {
        /// Torrent identifier.
        info_hash: InfoHash,
    },
    /// Resume data was generated.
    SaveResumeData {
        /// Torrent identifier.
        info_hash: InfoHash,
        /// Serialized resume data.
        resume_data: Vec<u8>,
    },
    /// Resume data generation failed.
    SaveResumeDataFailed {
        /// Torrent identifier.
        info_hash: InfoHash,
        /// Failure reason.
        reason: String,
    },
    /// An announce is about to be sent.
    TrackerAnnounce {
        /// Torrent identifier.
        info_hash: InfoHash,
        /// Tracker URL.
        url: String,
        /// Announce event.
        event: AnnounceEvent,
        /// Alert timestamp.
        timestamp: DateTime<Utc>,
    },
    /// A tracker replied.
    TrackerReply {
        /// Torrent identifier.
        info_hash: InfoHash,
        /// Tracker URL.
        url: String,
        /// Peers returned.
        num_peers: u32,
        /// Alert timestamp.
        timestamp: DateTime<Utc>,
    },
    /// A tracker request failed.
    TrackerError {
        /// Torrent identifier.
        info_hash: InfoHash,
        /// Tracker URL.
        url: String,
        /// Error details.
        error: TrackerErrorDetail,
        /// Consecutive failures.
        times_in_row: u32,
        /// Alert timestamp.
        timestamp: DateTime<Utc>,
    },
    /// A torrent was removed from the engine.
    TorrentRemoved {
        /// Torrent identifier.
        info_hash: InfoHash,
    },
    /// A listen socket was opened.
    ListenSucceeded {
        /// Bound endpoint.
        endpoint: ListenEndpoint,
    },
    /// A listen socket could not be opened.
    ListenFailed {
        /// Requested endpoint.
        endpoint: ListenEndpoint,
        /// Failure reason.
        error: String,
    },
    /// Torrent storage moved to a new directory.
    StorageMoved {
        /// Torrent identifier.
        info_hash: InfoHash,
        /// New directory.
        path: String,
    },
    /// A file inside a torrent was renamed.
    FileRenamed {
        /// Torrent identifier.
        info_hash: InfoHash,
        /// File index.
        index: u32,
        /// New relative path.
        new_name: String,
    },
    /// An alert kind this session does not handle.
    Unknown {
        /// Engine-side alert name.
        name: String,
    },
}

impl AlertKind {
    #[must_use]
    /// Machine-friendly discriminator for logs and timing.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::TorrentAdded { .. } => "torrent_added",
            Self::StateUpdate { .. } => "state_update",
            Self::SessionStats { .. } => "session_stats",
            Self::TorrentFinished { .. } => "torrent_finished",
            Self::SaveResumeData { .. } => "save_resume_data",
            Self::SaveResumeDataFailed { .. } => "save_resume_data_failed",
            Self::TrackerAnnounce { .. } => "tracker_announce",
            Self::TrackerReply { .. } => "tracker_reply",
            Self::TrackerError { .. } => "tracker_error",
            Self::TorrentRemoved { .. } => "torrent_removed",
            Self::ListenSucceeded { .. } => "listen_succeeded",
            Self::ListenFailed { .. } => "listen_failed",
            Self::StorageMoved { .. } => "storage_moved",
            Self::FileRenamed { .. } => "file_renamed",
            Self::Unknown { .. } => "unknown",
        }
    }

    #[must_use]
    /// Torrent the alert refers to, for per-torrent kinds.
    pub const fn info_hash(&self) -> Option<InfoHash> {
        match self {
            Self::TorrentAdded { info_hash, .. }
            | Self::TorrentFinished { info_hash }
            | Self::SaveResumeData { info_hash, .. }
            | Self::SaveResumeDataFailed { info_hash, .. }
            | Self::TrackerAnnounce { info_hash, .. }
            | Self::TrackerReply { info_hash, .. }
            | Self::TrackerError { info_hash, .. }
            | Self::TorrentRemoved { info_hash }
            | Self::StorageMoved { info_hash, .. }
            | Self::FileRenamed { info_hash, .. } => Some(*info_hash),
            Self::StateUpdate { .. }
            | Self::SessionStats { .. }
            | Self::ListenSucceeded { .. }
            | Self::ListenFailed { .. }
            | Self::Unknown { .. } => None,
        }
    }

    #[must_use]
    /// Whether the alert reports the outcome of a resume-data request.
    pub const fn is_resume_data(&self) -> bool {
        matches!(
            self,
            Self::SaveResumeData { .. } | Self::SaveResumeDataFailed { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn listen_endpoint_formats_both_families() {
        let v4 = ListenEndpoint {
            address: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            port: 6881,
        };
        assert_eq!(v4.key(), "listen_10.0.0.1_6881");
        assert_eq!(v4.to_string(), "10.0.0.1:6881");

        let v6 = ListenEndpoint {
            address: IpAddr::V6(Ipv6Addr::LOCALHOST),
            port: 6881,
        };
        assert_eq!(v6.key(), "listen_::1_6881");
        assert_eq!(v6.to_string(), "[::1]:6881");
    }

    #[test]
    fn resume_alerts_are_classified() {
        let hash = InfoHash::new([2; 20]);
        assert!(
            AlertKind::SaveResumeData {
                info_hash: hash,
                resume_data: vec![1],
            }
            .is_resume_data()
        );
        assert!(!AlertKind::TorrentRemoved { info_hash: hash }.is_resume_data());
        assert_eq!(
            AlertKind::Unknown {
                name: "dht_bootstrap".to_string()
            }
            .info_hash(),
            None
        );
    }
}
