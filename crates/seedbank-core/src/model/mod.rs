//! Core torrent domain types shared across the workspace.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::CoreError;
use crate::tracker::TrackerFragment;

/// 20-byte identifier of a torrent's info dictionary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InfoHash([u8; 20]);

impl InfoHash {
    /// Byte length of an info-hash.
    pub const LEN: usize = 20;

    #[must_use]
    /// Wrap raw info-hash bytes.
    pub const fn new(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    #[must_use]
    /// Borrow the underlying bytes.
    pub const fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    #[must_use]
    /// Lowercase hexadecimal rendering, as used for store keys and logs.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl Display for InfoHash {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        formatter.write_str(&self.to_hex())
    }
}

impl FromStr for InfoHash {
    type Err = CoreError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0_u8; 20];
        hex::decode_to_slice(value, &mut bytes).map_err(|_| CoreError::InvalidInfoHash {
            value: value.to_string(),
        })?;
        Ok(Self(bytes))
    }
}

impl Serialize for InfoHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for InfoHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// Lifecycle phase tracked for every registered torrent.
///
/// `Removed` is not represented: a removed torrent is destroyed, not flagged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TorrentPhase {
    /// Added, waiting for the engine to finish checking.
    Loading,
    /// Running.
    Active,
    /// Paused by request.
    Paused,
    /// The engine reported a failure that makes the torrent unusable.
    Error,
}

impl TorrentPhase {
    /// Every phase, in reporting order.
    pub const ALL: [Self; 4] = [Self::Loading, Self::Active, Self::Paused, Self::Error];

    #[must_use]
    /// Stable label used in metrics and logs.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Loading => "loading",
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Error => "error",
        }
    }
}

impl Display for TorrentPhase {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

impl FromStr for TorrentPhase {
    type Err = CoreError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|phase| phase.as_str() == value)
            .ok_or_else(|| CoreError::InvalidPhase {
                value: value.to_string(),
            })
    }
}

/// Activity reported by the engine for a torrent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineTorrentState {
    /// Verifying on-disk pieces.
    CheckingFiles,
    /// Validating a resume-data payload.
    CheckingResumeData,
    /// Fetching metadata from peers.
    DownloadingMetadata,
    /// Downloading payload.
    Downloading,
    /// All wanted pieces present, not seeding.
    Finished,
    /// Uploading to peers.
    Seeding,
    /// Allocating storage.
    Allocating,
    /// Unrecognised engine state.
    #[default]
    Unknown,
}

impl EngineTorrentState {
    #[must_use]
    /// Whether the engine is still verifying or preparing the torrent.
    pub const fn is_checking(self) -> bool {
        matches!(
            self,
            Self::CheckingFiles | Self::CheckingResumeData | Self::Allocating
        )
    }
}

/// Single file in a torrent's layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TorrentFileEntry {
    /// Index within the torrent metainfo.
    pub index: u32,
    /// Relative path inside the download directory.
    pub path: String,
    /// File size in bytes.
    pub size_bytes: u64,
}

/// Status record delivered by the engine in add confirmations and state updates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TorrentStatusSnapshot {
    /// Torrent identifier.
    pub info_hash: InfoHash,
    /// Name reported by the engine; empty until metadata is known.
    pub name: String,
    /// Directory the payload is stored in.
    pub save_path: String,
    /// Engine activity.
    pub state: EngineTorrentState,
    /// Whether the engine has the torrent paused.
    pub paused: bool,
    /// Failure that stopped the torrent, if any.
    pub error: Option<String>,
    /// Transfer counters.
    pub counters: TransferCounters,
}

/// Byte counters and rates for a torrent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferCounters {
    /// Bytes downloaded since the session started.
    pub session_downloaded: u64,
    /// Bytes uploaded since the session started.
    pub session_uploaded: u64,
    /// Bytes downloaded over the torrent's lifetime.
    pub all_time_downloaded: u64,
    /// Bytes uploaded over the torrent's lifetime.
    pub all_time_uploaded: u64,
    /// Bytes of wanted payload present on disk.
    pub total_done: u64,
    /// Bytes of payload selected for download.
    pub total_wanted: u64,
    /// Current download rate in bytes per second.
    pub download_rate: u64,
    /// Current upload rate in bytes per second.
    pub upload_rate: u64,
    /// Connected peers.
    pub num_peers: u32,
}

impl TransferCounters {
    #[must_use]
    /// Completion percentage (0-100).
    pub fn percent_complete(&self) -> f64 {
        if self.total_wanted == 0 {
            0.0
        } else {
            (to_f64(self.total_done) / to_f64(self.total_wanted)) * 100.0
        }
    }

    const fn persisted_progress_differs(&self, other: &Self) -> bool {
        self.all_time_downloaded != other.all_time_downloaded
            || self.all_time_uploaded != other.all_time_uploaded
            || self.total_done != other.total_done
    }
}

const fn to_f64(value: u64) -> f64 {
    #[expect(
        clippy::cast_precision_loss,
        reason = "u64 to f64 conversion is required for user-facing percentage reporting"
    )]
    {
        value as f64
    }
}

/// Observable state of one torrent, owned by the session's state store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TorrentState {
    /// Immutable identifier.
    pub info_hash: InfoHash,
    /// Row identifier in the durable store, when known.
    pub row_id: Option<i64>,
    /// Display name.
    pub name: String,
    /// Directory the payload is stored in.
    pub download_path: String,
    /// Lifecycle phase.
    pub phase: TorrentPhase,
    /// Set once the engine reports the torrent finished; independent of `phase`.
    pub finished: bool,
    /// Pause state the caller asked for; applied when `Loading` ends.
    pub requested_paused: bool,
    /// Last engine activity reported.
    pub engine_state: EngineTorrentState,
    /// Transfer counters from the latest status.
    pub counters: TransferCounters,
    /// Failure text while in `Error`.
    pub error: Option<String>,
    /// File layout captured at add time.
    pub files: Vec<TorrentFileEntry>,
    /// Per-tracker status.
    pub trackers: TrackerFragment,
    /// Whether persisted resume data is stale.
    pub needs_resume_save: bool,
    /// Timestamp of the last mutation.
    pub updated_at: DateTime<Utc>,
}

impl TorrentState {
    #[must_use]
    /// Build the state for a confirmed add.
    ///
    /// The torrent starts in `Loading` and leaves it immediately unless the engine is still
    /// checking.
    pub fn confirmed(
        status: &TorrentStatusSnapshot,
        files: Vec<TorrentFileEntry>,
        row_id: Option<i64>,
        requested_paused: bool,
        fallback_name: Option<&str>,
    ) -> Self {
        let name = if status.name.is_empty() {
            fallback_name.map_or_else(|| status.info_hash.to_hex(), str::to_string)
        } else {
            status.name.clone()
        };
        let mut state = Self {
            info_hash: status.info_hash,
            row_id,
            name,
            download_path: status.save_path.clone(),
            phase: TorrentPhase::Loading,
            finished: false,
            requested_paused,
            engine_state: status.state,
            counters: status.counters,
            error: None,
            files,
            trackers: TrackerFragment::default(),
            needs_resume_save: false,
            updated_at: Utc::now(),
        };
        if let Some(message) = &status.error {
            state.phase = TorrentPhase::Error;
            state.error = Some(message.clone());
        } else if !status.state.is_checking() {
            state.mark_ready();
        }
        state
    }

    /// Leave `Loading` according to the requested pause flag.
    pub const fn mark_ready(&mut self) {
        if matches!(self.phase, TorrentPhase::Loading) {
            self.phase = if self.requested_paused {
                TorrentPhase::Paused
            } else {
                TorrentPhase::Active
            };
        }
    }

    /// Apply an engine status update. Returns `true` when the phase changed.
    pub fn apply_status(&mut self, status: &TorrentStatusSnapshot) -> bool {
        let previous = self.phase;
        if !status.name.is_empty() {
            self.name.clone_from(&status.name);
        }
        if self.counters.persisted_progress_differs(&status.counters) {
            self.needs_resume_save = true;
        }
        self.counters = status.counters;
        self.engine_state = status.state;

        match (&status.error, self.phase) {
            (Some(message), _) => {
                self.phase = TorrentPhase::Error;
                self.error = Some(message.clone());
            }
            (None, TorrentPhase::Error) => {
                self.error = None;
                self.phase = if status.paused {
                    TorrentPhase::Paused
                } else {
                    TorrentPhase::Active
                };
            }
            (None, TorrentPhase::Loading) => {
                if !status.state.is_checking() {
                    self.mark_ready();
                }
            }
            (None, TorrentPhase::Active | TorrentPhase::Paused) => {
                self.phase = if status.paused {
                    TorrentPhase::Paused
                } else {
                    TorrentPhase::Active
                };
            }
        }

        let changed = previous != self.phase;
        if changed {
            self.needs_resume_save = true;
        }
        self.touch();
        changed
    }

    /// Record an explicit pause request.
    pub fn request_pause(&mut self) {
        self.requested_paused = true;
        if matches!(self.phase, TorrentPhase::Active) {
            self.phase = TorrentPhase::Paused;
            self.needs_resume_save = true;
        }
        self.touch();
    }

    /// Record an explicit resume request. An `Error` torrent stays in `Error` until the engine
    /// clears the failure.
    pub fn request_resume(&mut self) {
        self.requested_paused = false;
        if matches!(self.phase, TorrentPhase::Paused) {
            self.phase = TorrentPhase::Active;
            self.needs_resume_save = true;
        }
        self.touch();
    }

    /// Set the finished flag.
    pub fn mark_finished(&mut self) {
        self.finished = true;
        self.needs_resume_save = true;
        self.touch();
    }

    /// Apply a completed storage move.
    pub fn apply_storage_moved(&mut self, path: &str) {
        path.clone_into(&mut self.download_path);
        self.needs_resume_save = true;
        self.touch();
    }

    /// Apply a completed file rename. Returns `false` when the index is unknown.
    pub fn apply_file_renamed(&mut self, index: u32, new_path: &str) -> bool {
        let Some(file) = self.files.iter_mut().find(|file| file.index == index) else {
            return false;
        };
        new_path.clone_into(&mut file.path);
        if let Some(root) = self.root_name() {
            self.name = root;
        }
        self.needs_resume_save = true;
        self.touch();
        true
    }

    #[must_use]
    /// First path component shared by the layout (the file name for single-file torrents).
    pub fn root_name(&self) -> Option<String> {
        let first = self.files.first()?;
        first
            .path
            .split('/')
            .find(|segment| !segment.is_empty())
            .map(str::to_string)
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
