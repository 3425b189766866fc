//! In-memory engine used by tests and local demos.
//!
//! Metainfo is a small JSON document (see [`StubEngine::metainfo`]) instead of bencode. Every
//! command queues the alert a real engine would eventually emit; tests drive the rest through
//! the helper methods.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use seedbank_core::{
    AlertKind, AnnounceEvent, EngineTorrentState, InfoHash, ListenEndpoint, TorrentFileEntry,
    TorrentStatusSnapshot, TransferCounters,
};
use serde::Deserialize;
use serde_json::json;

use super::{AddTorrentParams, Engine, EngineResult, EngineSettings, SaveResumeFlags};
use crate::error::EngineError;

/// Counter names the stub exposes, in index order.
pub const STUB_COUNTERS: [&str; 8] = [
    "net.recv_bytes",
    "net.sent_bytes",
    "net.recv_payload_bytes",
    "net.sent_payload_bytes",
    "peer.num_peers_connected",
    "dht.dht_nodes",
    "disk.queued_disk_jobs",
    "ses.num_checking_torrents",
];

/// Command recorded by the stub, in issue order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StubCommand {
    /// `apply_settings`.
    ApplySettings(EngineSettings),
    /// `add_torrent`.
    Add {
        /// Hash parsed from the metainfo.
        info_hash: InfoHash,
        /// Parameters as received.
        params: AddTorrentParams,
    },
    /// `remove_torrent`.
    Remove {
        /// Target torrent.
        info_hash: InfoHash,
        /// Whether payload deletion was requested.
        delete_files: bool,
    },
    /// `pause_torrent`.
    Pause(InfoHash),
    /// `resume_torrent`.
    Resume(InfoHash),
    /// `force_recheck`.
    Recheck(InfoHash),
    /// `force_reannounce`.
    Reannounce(InfoHash),
    /// `move_storage`.
    MoveStorage {
        /// Target torrent.
        info_hash: InfoHash,
        /// Destination directory.
        path: String,
    },
    /// `rename_file`.
    RenameFile {
        /// Target torrent.
        info_hash: InfoHash,
        /// File index.
        index: u32,
        /// New relative path.
        new_path: String,
    },
    /// `save_resume_data`.
    SaveResumeData {
        /// Target torrent.
        info_hash: InfoHash,
        /// Flags as received.
        flags: SaveResumeFlags,
    },
    /// `post_torrent_updates`.
    PostTorrentUpdates,
    /// `post_session_stats`.
    PostSessionStats,
    /// `pause_session`.
    PauseSession,
}

#[derive(Debug, Deserialize)]
struct StubMetainfo {
    info_hash: InfoHash,
    name: String,
    #[serde(default)]
    files: Vec<StubMetainfoFile>,
    #[serde(default)]
    trackers: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct StubMetainfoFile {
    path: String,
    size: u64,
}

#[derive(Debug, Clone)]
struct StubTorrent {
    name: String,
    save_path: String,
    paused: bool,
    state: EngineTorrentState,
    error: Option<String>,
    files: Vec<TorrentFileEntry>,
    trackers: Vec<String>,
    counters: TransferCounters,
}

impl StubTorrent {
    fn status(&self, info_hash: InfoHash) -> TorrentStatusSnapshot {
        TorrentStatusSnapshot {
            info_hash,
            name: self.name.clone(),
            save_path: self.save_path.clone(),
            state: self.state,
            paused: self.paused,
            error: self.error.clone(),
            counters: self.counters,
        }
    }
}

struct StubState {
    torrents: HashMap<InfoHash, StubTorrent>,
    changed: BTreeSet<InfoHash>,
    pending_alerts: Vec<AlertKind>,
    commands: Vec<StubCommand>,
    counters: Vec<i64>,
    check_on_add: bool,
    failing_adds: HashMap<InfoHash, String>,
    failing_resume: HashSet<InfoHash>,
    unavailable: Option<String>,
}

impl Default for StubState {
    fn default() -> Self {
        Self {
            torrents: HashMap::new(),
            changed: BTreeSet::new(),
            pending_alerts: Vec::new(),
            commands: Vec::new(),
            counters: vec![0; STUB_COUNTERS.len()],
            check_on_add: false,
            failing_adds: HashMap::new(),
            failing_resume: HashSet::new(),
            unavailable: None,
        }
    }
}

impl StubState {
    fn torrent_mut(&mut self, info_hash: InfoHash) -> EngineResult<&mut StubTorrent> {
        self.torrents
            .get_mut(&info_hash)
            .ok_or(EngineError::UnknownTorrent { info_hash })
    }

    fn mark_changed(&mut self, info_hash: InfoHash) {
        self.changed.insert(info_hash);
    }
}

/// In-memory [`Engine`]. Clones share state, so a test can keep a handle after boxing one
/// into a session.
#[derive(Clone, Default)]
pub struct StubEngine {
    inner: Arc<Mutex<StubState>>,
}

impl StubEngine {
    /// Construct an empty stub.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Encode metainfo the stub understands.
    #[must_use]
    pub fn metainfo(info_hash: InfoHash, name: &str, files: &[(&str, u64)]) -> Vec<u8> {
        Self::metainfo_with_trackers(info_hash, name, files, &[])
    }

    /// Encode metainfo with announce URLs.
    #[must_use]
    pub fn metainfo_with_trackers(
        info_hash: InfoHash,
        name: &str,
        files: &[(&str, u64)],
        trackers: &[&str],
    ) -> Vec<u8> {
        json!({
            "info_hash": info_hash,
            "name": name,
            "files": files
                .iter()
                .map(|(path, size)| json!({ "path": path, "size": size }))
                .collect::<Vec<_>>(),
            "trackers": trackers,
        })
        .to_string()
        .into_bytes()
    }

    fn state(&self) -> MutexGuard<'_, StubState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue an arbitrary alert.
    pub fn push_alert(&self, alert: AlertKind) {
        self.state().pending_alerts.push(alert);
    }

    /// Set a counter value by engine name. Unknown names are ignored.
    pub fn set_counter(&self, name: &str, value: i64) {
        if let Some(index) = STUB_COUNTERS.iter().position(|candidate| *candidate == name) {
            self.state().counters[index] = value;
        }
    }

    /// Report newly added torrents as checking until [`Self::finish_checking`].
    pub fn set_check_on_add(&self, enabled: bool) {
        self.state().check_on_add = enabled;
    }

    /// Fail the next add of `info_hash` asynchronously.
    pub fn fail_add(&self, info_hash: InfoHash, reason: &str) {
        self.state()
            .failing_adds
            .insert(info_hash, reason.to_string());
    }

    /// Fail resume-data requests for `info_hash`.
    pub fn fail_resume_data(&self, info_hash: InfoHash) {
        self.state().failing_resume.insert(info_hash);
    }

    /// Move a checking torrent to downloading.
    pub fn finish_checking(&self, info_hash: InfoHash) {
        let mut state = self.state();
        if let Some(torrent) = state.torrents.get_mut(&info_hash) {
            torrent.state = EngineTorrentState::Downloading;
            state.mark_changed(info_hash);
        }
    }

    /// Record download progress for a torrent.
    pub fn set_progress(&self, info_hash: InfoHash, downloaded: u64) {
        let mut state = self.state();
        if let Some(torrent) = state.torrents.get_mut(&info_hash) {
            torrent.counters.all_time_downloaded = downloaded;
            torrent.counters.session_downloaded = downloaded;
            torrent.counters.total_done = downloaded.min(torrent.counters.total_wanted);
            state.mark_changed(info_hash);
        }
    }

    /// Set or clear a torrent error.
    pub fn set_error(&self, info_hash: InfoHash, error: Option<&str>) {
        let mut state = self.state();
        if let Some(torrent) = state.torrents.get_mut(&info_hash) {
            torrent.error = error.map(str::to_string);
            state.mark_changed(info_hash);
        }
    }

    /// Make every subsequent alert poll fail.
    pub fn shut_down(&self, detail: &str) {
        self.state().unavailable = Some(detail.to_string());
    }

    /// Commands issued so far.
    #[must_use]
    pub fn commands(&self) -> Vec<StubCommand> {
        self.state().commands.clone()
    }

    /// Forget recorded commands.
    pub fn clear_commands(&self) {
        self.state().commands.clear();
    }

    /// Alerts queued and not yet popped.
    #[must_use]
    pub fn pending_alerts(&self) -> usize {
        self.state().pending_alerts.len()
    }

    /// Remove and return queued alerts without delivering them.
    pub fn take_alerts(&self) -> Vec<AlertKind> {
        std::mem::take(&mut self.state().pending_alerts)
    }

    /// Torrents the stub currently holds.
    #[must_use]
    pub fn torrent_count(&self) -> usize {
        self.state().torrents.len()
    }

    /// Whether the stub holds the torrent paused.
    #[must_use]
    pub fn is_paused(&self, info_hash: InfoHash) -> Option<bool> {
        self.state()
            .torrents
            .get(&info_hash)
            .map(|torrent| torrent.paused)
    }
}

fn renamed_layout(files: Vec<StubMetainfoFile>, name: &str) -> Vec<TorrentFileEntry> {
    let single = files.len() == 1 && !files[0].path.contains('/');
    files
        .into_iter()
        .zip(0_u32..)
        .map(|(file, index)| {
            let path = if single {
                name.to_string()
            } else {
                match file.path.split_once('/') {
                    Some((_, rest)) => format!("{name}/{rest}"),
                    None => format!("{name}/{}", file.path),
                }
            };
            TorrentFileEntry {
                index,
                path,
                size_bytes: file.size,
            }
        })
        .collect()
}

impl Engine for StubEngine {
    fn apply_settings(&mut self, settings: &EngineSettings) -> EngineResult<()> {
        let mut state = self.state();
        state
            .commands
            .push(StubCommand::ApplySettings(settings.clone()));
        for address in &settings.listen_interfaces {
            state.pending_alerts.push(AlertKind::ListenSucceeded {
                endpoint: ListenEndpoint {
                    address: address.ip(),
                    port: address.port(),
                },
            });
        }
        Ok(())
    }

    fn add_torrent(&mut self, params: &AddTorrentParams) -> EngineResult<InfoHash> {
        let metainfo: StubMetainfo =
            serde_json::from_slice(&params.torrent).map_err(|err| EngineError::Rejected {
                operation: "add_torrent",
                reason: err.to_string(),
            })?;
        let info_hash = metainfo.info_hash;
        let mut state = self.state();
        state.commands.push(StubCommand::Add {
            info_hash,
            params: params.clone(),
        });

        let failure = state.failing_adds.remove(&info_hash).or_else(|| {
            state
                .torrents
                .contains_key(&info_hash)
                .then(|| "torrent already exists in session".to_string())
        });
        if let Some(reason) = failure {
            state.pending_alerts.push(AlertKind::TorrentAdded {
                info_hash,
                error: Some(reason),
                status: TorrentStatusSnapshot {
                    info_hash,
                    ..TorrentStatusSnapshot::default()
                },
                files: Vec::new(),
            });
            return Ok(info_hash);
        }

        let name = params.name.clone().unwrap_or(metainfo.name);
        let files = renamed_layout(metainfo.files, &name);
        let torrent = StubTorrent {
            name,
            save_path: params.download_path.clone(),
            paused: params.paused,
            state: if state.check_on_add {
                EngineTorrentState::CheckingFiles
            } else {
                EngineTorrentState::Downloading
            },
            error: None,
            counters: TransferCounters {
                total_wanted: files.iter().map(|file| file.size_bytes).sum(),
                ..TransferCounters::default()
            },
            files: files.clone(),
            trackers: metainfo.trackers,
        };
        let status = torrent.status(info_hash);
        state.torrents.insert(info_hash, torrent);
        state.pending_alerts.push(AlertKind::TorrentAdded {
            info_hash,
            error: None,
            status,
            files,
        });
        Ok(info_hash)
    }

    fn remove_torrent(&mut self, info_hash: InfoHash, delete_files: bool) -> EngineResult<()> {
        let mut state = self.state();
        state.commands.push(StubCommand::Remove {
            info_hash,
            delete_files,
        });
        if state.torrents.remove(&info_hash).is_none() {
            return Err(EngineError::UnknownTorrent { info_hash });
        }
        state.changed.remove(&info_hash);
        state
            .pending_alerts
            .push(AlertKind::TorrentRemoved { info_hash });
        Ok(())
    }

    fn pause_torrent(&mut self, info_hash: InfoHash) -> EngineResult<()> {
        let mut state = self.state();
        state.commands.push(StubCommand::Pause(info_hash));
        state.torrent_mut(info_hash)?.paused = true;
        state.mark_changed(info_hash);
        Ok(())
    }

    fn resume_torrent(&mut self, info_hash: InfoHash) -> EngineResult<()> {
        let mut state = self.state();
        state.commands.push(StubCommand::Resume(info_hash));
        state.torrent_mut(info_hash)?.paused = false;
        state.mark_changed(info_hash);
        Ok(())
    }

    fn force_recheck(&mut self, info_hash: InfoHash) -> EngineResult<()> {
        let mut state = self.state();
        state.commands.push(StubCommand::Recheck(info_hash));
        state.torrent_mut(info_hash)?.state = EngineTorrentState::CheckingFiles;
        state.mark_changed(info_hash);
        Ok(())
    }

    fn force_reannounce(&mut self, info_hash: InfoHash) -> EngineResult<()> {
        let mut state = self.state();
        state.commands.push(StubCommand::Reannounce(info_hash));
        let trackers = state.torrent_mut(info_hash)?.trackers.clone();
        let timestamp = Utc::now();
        state
            .pending_alerts
            .extend(trackers.into_iter().map(|url| AlertKind::TrackerAnnounce {
                info_hash,
                url,
                event: AnnounceEvent::None,
                timestamp,
            }));
        Ok(())
    }

    fn move_storage(&mut self, info_hash: InfoHash, path: &str) -> EngineResult<()> {
        let mut state = self.state();
        state.commands.push(StubCommand::MoveStorage {
            info_hash,
            path: path.to_string(),
        });
        path.clone_into(&mut state.torrent_mut(info_hash)?.save_path);
        state.pending_alerts.push(AlertKind::StorageMoved {
            info_hash,
            path: path.to_string(),
        });
        Ok(())
    }

    fn rename_file(
        &mut self,
        info_hash: InfoHash,
        index: u32,
        new_path: &str,
    ) -> EngineResult<()> {
        let mut state = self.state();
        state.commands.push(StubCommand::RenameFile {
            info_hash,
            index,
            new_path: new_path.to_string(),
        });
        let torrent = state.torrent_mut(info_hash)?;
        let file = torrent
            .files
            .iter_mut()
            .find(|file| file.index == index)
            .ok_or_else(|| EngineError::Rejected {
                operation: "rename_file",
                reason: format!("file index {index} out of range"),
            })?;
        new_path.clone_into(&mut file.path);
        state.pending_alerts.push(AlertKind::FileRenamed {
            info_hash,
            index,
            new_name: new_path.to_string(),
        });
        Ok(())
    }

    fn save_resume_data(
        &mut self,
        info_hash: InfoHash,
        flags: SaveResumeFlags,
    ) -> EngineResult<()> {
        let mut state = self.state();
        state
            .commands
            .push(StubCommand::SaveResumeData { info_hash, flags });
        let torrent = state.torrent_mut(info_hash)?.clone();
        let alert = if state.failing_resume.contains(&info_hash) {
            AlertKind::SaveResumeDataFailed {
                info_hash,
                reason: "resume data unavailable".to_string(),
            }
        } else {
            AlertKind::SaveResumeData {
                info_hash,
                resume_data: json!({
                    "name": torrent.name,
                    "save_path": torrent.save_path,
                    "paused": torrent.paused,
                    "total_done": torrent.counters.total_done,
                })
                .to_string()
                .into_bytes(),
            }
        };
        state.pending_alerts.push(alert);
        Ok(())
    }

    fn post_torrent_updates(&mut self) {
        let mut state = self.state();
        state.commands.push(StubCommand::PostTorrentUpdates);
        let changed = std::mem::take(&mut state.changed);
        let statuses: Vec<_> = changed
            .into_iter()
            .filter_map(|info_hash| {
                state
                    .torrents
                    .get(&info_hash)
                    .map(|torrent| torrent.status(info_hash))
            })
            .collect();
        if !statuses.is_empty() {
            state
                .pending_alerts
                .push(AlertKind::StateUpdate { statuses });
        }
    }

    fn post_session_stats(&mut self) {
        let mut state = self.state();
        state.commands.push(StubCommand::PostSessionStats);
        let counters = state.counters.clone();
        state
            .pending_alerts
            .push(AlertKind::SessionStats { counters });
    }

    fn pause_session(&mut self) {
        let mut state = self.state();
        state.commands.push(StubCommand::PauseSession);
        let hashes: Vec<_> = state.torrents.keys().copied().collect();
        for info_hash in hashes {
            if let Some(torrent) = state.torrents.get_mut(&info_hash) {
                torrent.paused = true;
            }
            state.mark_changed(info_hash);
        }
    }

    fn pop_alerts(&mut self) -> EngineResult<Vec<AlertKind>> {
        let mut state = self.state();
        if let Some(detail) = &state.unavailable {
            return Err(EngineError::Unavailable {
                detail: detail.clone(),
            });
        }
        Ok(std::mem::take(&mut state.pending_alerts))
    }

    fn counter_index(&self, name: &str) -> Option<usize> {
        STUB_COUNTERS.iter().position(|candidate| *candidate == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(byte: u8) -> InfoHash {
        InfoHash::new([byte; 20])
    }

    fn params(metainfo: Vec<u8>) -> AddTorrentParams {
        AddTorrentParams {
            torrent: metainfo,
            download_path: "/downloads".to_string(),
            name: None,
            resume_data: None,
            paused: false,
        }
    }

    #[test]
    fn add_queues_confirmation_with_layout() {
        let mut engine = StubEngine::new();
        let metainfo = StubEngine::metainfo(hash(1), "Album", &[("Album/a.flac", 4)]);
        let info_hash = engine.add_torrent(&params(metainfo)).expect("add accepted");
        assert_eq!(info_hash, hash(1));

        let alerts = engine.pop_alerts().expect("alerts");
        match alerts.as_slice() {
            [AlertKind::TorrentAdded { error, files, status, .. }] => {
                assert!(error.is_none());
                assert_eq!(files[0].path, "Album/a.flac");
                assert_eq!(status.counters.total_wanted, 4);
            }
            other => panic!("unexpected alerts {other:?}"),
        }
    }

    #[test]
    fn malformed_metainfo_is_rejected_synchronously() {
        let mut engine = StubEngine::new();
        let err = engine
            .add_torrent(&params(b"not json".to_vec()))
            .expect_err("rejected");
        assert!(matches!(err, EngineError::Rejected { .. }));
        assert_eq!(engine.pending_alerts(), 0);
    }

    #[test]
    fn name_override_renames_layout_root() {
        let mut engine = StubEngine::new();
        let mut request = params(StubEngine::metainfo(
            hash(2),
            "Old",
            &[("Old/a", 1), ("Old/sub/b", 2)],
        ));
        request.name = Some("New".to_string());
        engine.add_torrent(&request).expect("add accepted");
        let alerts = engine.pop_alerts().expect("alerts");
        let Some(AlertKind::TorrentAdded { files, status, .. }) = alerts.first() else {
            panic!("missing add alert");
        };
        assert_eq!(status.name, "New");
        assert_eq!(files[1].path, "New/sub/b");
    }

    #[test]
    fn unknown_torrent_commands_fail() {
        let mut engine = StubEngine::new();
        assert!(matches!(
            engine.pause_torrent(hash(9)),
            Err(EngineError::UnknownTorrent { .. })
        ));
        assert_eq!(engine.commands(), vec![StubCommand::Pause(hash(9))]);
    }

    #[test]
    fn shut_down_engine_reports_unavailable() {
        let mut engine = StubEngine::new();
        engine.shut_down("session aborted");
        assert!(matches!(
            engine.pop_alerts(),
            Err(EngineError::Unavailable { .. })
        ));
    }

    #[test]
    fn counters_resolve_by_name() {
        let mut engine = StubEngine::new();
        engine.set_counter("dht.dht_nodes", 12);
        assert_eq!(engine.counter_index("dht.dht_nodes"), Some(5));
        assert_eq!(engine.counter_index("missing"), None);
        engine.post_session_stats();
        let alerts = engine.pop_alerts().expect("alerts");
        let Some(AlertKind::SessionStats { counters }) = alerts.first() else {
            panic!("missing stats alert");
        };
        assert_eq!(counters[5], 12);
    }
}
