//! Per-cycle update payload handed to the caller of `process_alerts`.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::alert::ListenEndpoint;
use crate::model::{InfoHash, TorrentPhase, TorrentState};

/// Resume data produced for a torrent. The blob is owned by the batch.
#[derive(Debug, PartialEq, Eq)]
pub struct ResumeDataSaved {
    /// Torrent identifier.
    pub info_hash: InfoHash,
    /// Store row, when the torrent is still registered and persisted.
    pub row_id: Option<i64>,
    /// Serialized resume data.
    pub resume_data: Vec<u8>,
}

/// Resume data request that failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeDataFailed {
    /// Torrent identifier.
    pub info_hash: InfoHash,
    /// Failure reason.
    pub reason: String,
}

/// Add request the engine rejected after accepting it for processing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddFailed {
    /// Torrent identifier.
    pub info_hash: InfoHash,
    /// Store row of the pending add, if any.
    pub row_id: Option<i64>,
    /// Failure reason.
    pub reason: String,
}

/// Listen socket outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenEvent {
    /// Socket bound.
    Succeeded {
        /// Bound endpoint.
        endpoint: ListenEndpoint,
    },
    /// Socket could not be bound.
    Failed {
        /// Requested endpoint.
        endpoint: ListenEndpoint,
        /// Failure reason.
        error: String,
    },
}

impl ListenEvent {
    #[must_use]
    /// Endpoint the event refers to.
    pub const fn endpoint(&self) -> &ListenEndpoint {
        match self {
            Self::Succeeded { endpoint } | Self::Failed { endpoint, .. } => endpoint,
        }
    }
}

/// Named engine counter sample.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCounter {
    /// Published counter name.
    pub name: String,
    /// Sampled value.
    pub value: i64,
}

/// Torrent counts derived from the state store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TorrentCounts {
    /// Torrents in `Loading`.
    pub loading: usize,
    /// Torrents in `Active`.
    pub active: usize,
    /// Torrents in `Paused`.
    pub paused: usize,
    /// Torrents in `Error`.
    pub error: usize,
    /// Torrents with the finished flag set.
    pub finished: usize,
    /// All registered torrents.
    pub total: usize,
}

impl TorrentCounts {
    /// Count one torrent.
    pub const fn record(&mut self, phase: TorrentPhase, finished: bool) {
        match phase {
            TorrentPhase::Loading => self.loading += 1,
            TorrentPhase::Active => self.active += 1,
            TorrentPhase::Paused => self.paused += 1,
            TorrentPhase::Error => self.error += 1,
        }
        if finished {
            self.finished += 1;
        }
        self.total += 1;
    }

    #[must_use]
    /// Count for a phase.
    pub const fn for_phase(&self, phase: TorrentPhase) -> usize {
        match phase {
            TorrentPhase::Loading => self.loading,
            TorrentPhase::Active => self.active,
            TorrentPhase::Paused => self.paused,
            TorrentPhase::Error => self.error,
        }
    }
}

/// Everything that changed during one `process_alerts` cycle.
///
/// Torrent snapshots are shared with the session's store as immutable `Arc`s; the store copies
/// on its next write, so a batch never observes later mutations.
#[derive(Debug, Default)]
pub struct BatchTorrentUpdate {
    /// Torrents touched this cycle, in first-touch order, excluding new ones.
    pub updated: Vec<(InfoHash, Arc<TorrentState>)>,
    /// Torrents whose add was confirmed this cycle.
    pub added: Vec<Arc<TorrentState>>,
    /// Torrents whose removal was confirmed this cycle.
    pub removed: Vec<InfoHash>,
    /// Resume data ready for durable storage.
    pub resume_data_saved: Vec<ResumeDataSaved>,
    /// Resume data requests that failed.
    pub resume_data_failed: Vec<ResumeDataFailed>,
    /// Adds the engine rejected asynchronously.
    pub add_failed: Vec<AddFailed>,
    /// Latest session counter sample, in catalogue order.
    pub session_stats: Option<Vec<SessionCounter>>,
    /// Torrent counts computed at the end of the cycle.
    pub torrent_counts: Option<TorrentCounts>,
    /// Listen socket outcomes.
    pub listen_events: Vec<ListenEvent>,
}

impl BatchTorrentUpdate {
    #[must_use]
    /// Whether the cycle produced nothing.
    pub fn is_empty(&self) -> bool {
        self.updated.is_empty()
            && self.added.is_empty()
            && self.removed.is_empty()
            && self.resume_data_saved.is_empty()
            && self.resume_data_failed.is_empty()
            && self.add_failed.is_empty()
            && self.session_stats.is_none()
            && self.torrent_counts.is_none()
            && self.listen_events.is_empty()
    }

    #[must_use]
    /// Counter value by published name.
    pub fn session_counter(&self, name: &str) -> Option<i64> {
        self.session_stats
            .as_ref()?
            .iter()
            .find(|counter| counter.name == name)
            .map(|counter| counter.value)
    }
}
