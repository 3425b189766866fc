//! Engine collaborator boundary.

use std::net::SocketAddr;

use seedbank_core::{AlertKind, InfoHash};

use crate::error::EngineError;

pub mod stub;

/// Result alias for engine calls.
pub type EngineResult<T> = Result<T, EngineError>;

/// Session-wide settings pushed to the engine at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    /// Sockets to listen on for peer connections.
    pub listen_interfaces: Vec<SocketAddr>,
    /// Whether the DHT is enabled.
    pub enable_dht: bool,
    /// Whether payload files are fully allocated up front.
    pub enable_file_preallocation: bool,
}

/// Parameters for a single add command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddTorrentParams {
    /// Raw metainfo.
    pub torrent: Vec<u8>,
    /// Directory the payload is stored in.
    pub download_path: String,
    /// Name override for the top-level entry.
    pub name: Option<String>,
    /// Resume data from a previous session.
    pub resume_data: Option<Vec<u8>>,
    /// Start the torrent paused.
    pub paused: bool,
}

/// Flags for a resume-data request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SaveResumeFlags {
    /// Flush the disk cache before generating the payload.
    pub flush_disk_cache: bool,
}

/// Commands and alert access the session needs from the protocol engine.
///
/// Commands are fire-and-forget: their effects are reported later through alerts. A
/// synchronous `Err` means the engine refused the command outright.
pub trait Engine: Send {
    /// Apply session-wide settings.
    ///
    /// # Errors
    ///
    /// Returns an error when the engine rejects the settings.
    fn apply_settings(&mut self, settings: &EngineSettings) -> EngineResult<()>;

    /// Submit an add; the outcome arrives as a `TorrentAdded` alert.
    ///
    /// # Errors
    ///
    /// Returns an error when the metainfo cannot be parsed.
    fn add_torrent(&mut self, params: &AddTorrentParams) -> EngineResult<InfoHash>;

    /// Remove a torrent, optionally deleting its payload.
    ///
    /// # Errors
    ///
    /// Returns an error when the torrent is unknown.
    fn remove_torrent(&mut self, info_hash: InfoHash, delete_files: bool) -> EngineResult<()>;

    /// Pause a torrent.
    ///
    /// # Errors
    ///
    /// Returns an error when the torrent is unknown.
    fn pause_torrent(&mut self, info_hash: InfoHash) -> EngineResult<()>;

    /// Resume a torrent.
    ///
    /// # Errors
    ///
    /// Returns an error when the torrent is unknown.
    fn resume_torrent(&mut self, info_hash: InfoHash) -> EngineResult<()>;

    /// Re-verify on-disk data.
    ///
    /// # Errors
    ///
    /// Returns an error when the torrent is unknown.
    fn force_recheck(&mut self, info_hash: InfoHash) -> EngineResult<()>;

    /// Announce to all trackers now.
    ///
    /// # Errors
    ///
    /// Returns an error when the torrent is unknown.
    fn force_reannounce(&mut self, info_hash: InfoHash) -> EngineResult<()>;

    /// Move the payload to a new directory.
    ///
    /// # Errors
    ///
    /// Returns an error when the torrent is unknown.
    fn move_storage(&mut self, info_hash: InfoHash, path: &str) -> EngineResult<()>;

    /// Rename one file of a torrent.
    ///
    /// # Errors
    ///
    /// Returns an error when the torrent or file index is unknown.
    fn rename_file(&mut self, info_hash: InfoHash, index: u32, new_path: &str)
    -> EngineResult<()>;

    /// Request resume data; the outcome arrives as a resume-data alert.
    ///
    /// # Errors
    ///
    /// Returns an error when the torrent is unknown.
    fn save_resume_data(&mut self, info_hash: InfoHash, flags: SaveResumeFlags)
    -> EngineResult<()>;

    /// Ask for a `StateUpdate` alert covering torrents that changed.
    fn post_torrent_updates(&mut self);

    /// Ask for a `SessionStats` alert.
    fn post_session_stats(&mut self);

    /// Pause the whole session.
    fn pause_session(&mut self);

    /// Drain queued alerts.
    ///
    /// # Errors
    ///
    /// Returns an error when the engine is no longer running.
    fn pop_alerts(&mut self) -> EngineResult<Vec<AlertKind>>;

    /// Index of a named counter in `SessionStats` samples.
    fn counter_index(&self, name: &str) -> Option<usize>;
}
