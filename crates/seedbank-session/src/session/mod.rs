//! Caller-facing session: commands in, batches out.
//!
//! # Design
//!
//! - One [`TorrentSession`] owns every map that correlates engine alerts with torrents. Nothing
//!   is global and nothing is shared; the async worker owns the session outright.
//! - Commands validate synchronously and return [`SessionError`]; their effects are only
//!   observed through [`TorrentSession::process_alerts`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use seedbank_core::{InfoHash, TorrentState};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::engine::{AddTorrentParams, Engine, SaveResumeFlags};
use crate::error::{SessionError, SessionResult, engine_failure};
use crate::initial_load::InitialLoadTracker;
use crate::metrics::{DEFAULT_COUNTERS, SessionMetricsAggregator};
use crate::resume::ResumeDataCoordinator;
use crate::state::TorrentStateStore;
use crate::store::TorrentStore;
use crate::tracker::TrackerStateReconciler;

mod dispatch;

/// Request to add one torrent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddTorrentRequest {
    /// Raw metainfo.
    pub torrent: Vec<u8>,
    /// Payload directory.
    pub download_path: String,
    /// Name override for the top-level entry.
    pub name: Option<String>,
    /// Resume data from a previous session.
    pub resume_data: Option<Vec<u8>>,
    /// Start paused.
    pub paused: bool,
    /// Row in the durable store, when already persisted.
    pub row_id: Option<i64>,
}

impl AddTorrentRequest {
    /// Request for a fresh torrent.
    #[must_use]
    pub fn new(torrent: Vec<u8>, download_path: impl Into<String>) -> Self {
        Self {
            torrent,
            download_path: download_path.into(),
            name: None,
            resume_data: None,
            paused: false,
            row_id: None,
        }
    }

    fn validate(&self) -> SessionResult<()> {
        if self.torrent.is_empty() {
            return Err(SessionError::InvalidInput {
                field: "torrent",
                reason: "metainfo is empty",
            });
        }
        if self.download_path.trim().is_empty() {
            return Err(SessionError::InvalidInput {
                field: "download_path",
                reason: "must not be empty",
            });
        }
        if let Some(name) = &self.name {
            validate_name(name)?;
        }
        Ok(())
    }
}

fn validate_name(name: &str) -> SessionResult<()> {
    if name.trim().is_empty() {
        return Err(SessionError::InvalidInput {
            field: "name",
            reason: "must not be empty",
        });
    }
    if name.contains('/') || name == "." || name == ".." {
        return Err(SessionError::InvalidInput {
            field: "name",
            reason: "must be a single path component",
        });
    }
    Ok(())
}

#[derive(Debug, Clone)]
struct PendingAdd {
    row_id: Option<i64>,
    paused: bool,
    name: Option<String>,
}

/// Session-scoped synchronization state around one engine.
pub struct TorrentSession {
    engine: Box<dyn Engine>,
    store: TorrentStateStore,
    pending_adds: HashMap<InfoHash, PendingAdd>,
    trackers: TrackerStateReconciler,
    resume: ResumeDataCoordinator,
    metrics: SessionMetricsAggregator,
    initial_load: InitialLoadTracker,
    listening: bool,
}

impl TorrentSession {
    /// Apply settings to the engine and build the session around it.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the engine rejects the settings.
    pub fn new(mut engine: Box<dyn Engine>, config: &SessionConfig) -> SessionResult<Self> {
        let settings = config
            .engine_settings()
            .map_err(|source| SessionError::Config { source })?;
        engine
            .apply_settings(&settings)
            .map_err(|err| engine_failure("apply_settings", None, err))?;
        let metrics = SessionMetricsAggregator::new(engine.as_ref(), DEFAULT_COUNTERS);
        info!(
            listen_interfaces = %config.listen_interfaces,
            enable_dht = config.enable_dht,
            counters = metrics.len(),
            "torrent session started"
        );
        Ok(Self {
            engine,
            store: TorrentStateStore::default(),
            pending_adds: HashMap::new(),
            trackers: TrackerStateReconciler::new(
                config.preload_tracker_ttl(),
                config.preload_tracker_capacity,
            ),
            resume: ResumeDataCoordinator::default(),
            metrics,
            initial_load: InitialLoadTracker::default(),
            listening: false,
        })
    }

    /// Submit an add. The torrent is registered when its confirmation is processed.
    ///
    /// # Errors
    ///
    /// Returns an error if the request is invalid or the engine rejects the metainfo.
    pub fn add_torrent(&mut self, request: AddTorrentRequest) -> SessionResult<InfoHash> {
        request.validate()?;
        let AddTorrentRequest {
            torrent,
            download_path,
            name,
            resume_data,
            paused,
            row_id,
        } = request;
        let params = AddTorrentParams {
            torrent,
            download_path,
            name,
            resume_data,
            paused,
        };
        let info_hash = self
            .engine
            .add_torrent(&params)
            .map_err(|err| engine_failure("add_torrent", None, err))?;

        if self.store.contains(&info_hash) || self.pending_adds.contains_key(&info_hash) {
            debug!(info_hash = %info_hash, "add submitted for a torrent already known");
        } else {
            self.pending_adds.insert(
                info_hash,
                PendingAdd {
                    row_id,
                    paused,
                    name: params.name,
                },
            );
        }
        self.trackers.revive(&info_hash);
        info!(
            info_hash = %info_hash,
            download_path = %params.download_path,
            "torrent add submitted"
        );
        Ok(info_hash)
    }

    /// Submit a removal. The state is destroyed when the removal is confirmed.
    ///
    /// # Errors
    ///
    /// Returns an error if the torrent is unknown.
    pub fn remove_torrent(
        &mut self,
        info_hash: InfoHash,
        delete_files: bool,
    ) -> SessionResult<()> {
        self.require_known("remove_torrent", info_hash)?;
        self.engine
            .remove_torrent(info_hash, delete_files)
            .map_err(|err| engine_failure("remove_torrent", Some(info_hash), err))?;
        info!(info_hash = %info_hash, delete_files, "torrent removal submitted");
        Ok(())
    }

    /// Pause a torrent. A torrent still loading stays in `Loading` and is paused when ready.
    ///
    /// # Errors
    ///
    /// Returns an error if the torrent is unknown or the engine rejects the command.
    pub fn pause_torrent(&mut self, info_hash: InfoHash) -> SessionResult<Arc<TorrentState>> {
        self.require_registered("pause_torrent", info_hash)?;
        self.engine
            .pause_torrent(info_hash)
            .map_err(|err| engine_failure("pause_torrent", Some(info_hash), err))?;
        self.update_state("pause_torrent", info_hash, TorrentState::request_pause)
    }

    /// Resume a torrent.
    ///
    /// # Errors
    ///
    /// Returns an error if the torrent is unknown or the engine rejects the command.
    pub fn resume_torrent(&mut self, info_hash: InfoHash) -> SessionResult<Arc<TorrentState>> {
        self.require_registered("resume_torrent", info_hash)?;
        self.engine
            .resume_torrent(info_hash)
            .map_err(|err| engine_failure("resume_torrent", Some(info_hash), err))?;
        self.update_state("resume_torrent", info_hash, TorrentState::request_resume)
    }

    /// Re-verify a torrent's data.
    ///
    /// # Errors
    ///
    /// Returns an error if the torrent is unknown or the engine rejects the command.
    pub fn force_recheck(&mut self, info_hash: InfoHash) -> SessionResult<()> {
        self.require_registered("force_recheck", info_hash)?;
        self.engine
            .force_recheck(info_hash)
            .map_err(|err| engine_failure("force_recheck", Some(info_hash), err))
    }

    /// Announce to every tracker now.
    ///
    /// # Errors
    ///
    /// Returns an error if the torrent is unknown or the engine rejects the command.
    pub fn force_reannounce(&mut self, info_hash: InfoHash) -> SessionResult<()> {
        self.require_registered("force_reannounce", info_hash)?;
        self.engine
            .force_reannounce(info_hash)
            .map_err(|err| engine_failure("force_reannounce", Some(info_hash), err))
    }

    /// Rename the torrent's top-level entry. Returns the number of file renames issued.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is invalid, the torrent is unknown or has no file layout,
    /// or the engine rejects a rename.
    pub fn rename_torrent(&mut self, info_hash: InfoHash, name: &str) -> SessionResult<usize> {
        validate_name(name)?;
        let state = self
            .store
            .get(&info_hash)
            .ok_or(SessionError::NotFound {
                operation: "rename_torrent",
                info_hash,
            })?;
        if state.files.is_empty() {
            return Err(SessionError::InvalidInput {
                field: "name",
                reason: "torrent has no file layout yet",
            });
        }

        let single_file = state.files.len() == 1 && !state.files[0].path.contains('/');
        let mut issued = 0;
        for file in &state.files {
            let renamed = if single_file {
                name.to_string()
            } else {
                match file.path.split_once('/') {
                    Some((_, rest)) => format!("{name}/{rest}"),
                    None => format!("{name}/{}", file.path),
                }
            };
            if renamed == file.path {
                continue;
            }
            self.engine
                .rename_file(info_hash, file.index, &renamed)
                .map_err(|err| engine_failure("rename_torrent", Some(info_hash), err))?;
            issued += 1;
        }
        info!(info_hash = %info_hash, name, files = issued, "torrent rename submitted");
        Ok(issued)
    }

    /// Move a torrent's payload to another directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the path is empty, the torrent is unknown, or the engine rejects
    /// the move.
    pub fn move_data(&mut self, info_hash: InfoHash, download_path: &str) -> SessionResult<()> {
        if download_path.trim().is_empty() {
            return Err(SessionError::InvalidInput {
                field: "download_path",
                reason: "must not be empty",
            });
        }
        self.require_registered("move_data", info_hash)?;
        self.engine
            .move_storage(info_hash, download_path)
            .map_err(|err| engine_failure("move_data", Some(info_hash), err))?;
        info!(info_hash = %info_hash, download_path, "storage move submitted");
        Ok(())
    }

    /// Ask the engine for a session-stats sample.
    pub fn post_session_stats(&mut self) {
        self.engine.post_session_stats();
    }

    /// Ask the engine for status updates of changed torrents.
    pub fn post_torrent_updates(&mut self) {
        self.engine.post_torrent_updates();
    }

    /// Pause the whole engine session.
    pub fn pause(&mut self) {
        self.engine.pause_session();
        info!("torrent session paused");
    }

    /// Request resume data. With `flush_cache` every torrent is saved and the disk cache is
    /// flushed first; otherwise only torrents with stale resume data are saved. Returns the
    /// number of requests issued.
    pub fn all_torrents_save_resume_data(&mut self, flush_cache: bool) -> usize {
        let targets: Vec<InfoHash> = if flush_cache {
            self.store.iter().map(|state| state.info_hash).collect()
        } else {
            self.store.dirty().collect()
        };
        let flags = SaveResumeFlags {
            flush_disk_cache: flush_cache,
        };
        let mut issued = 0;
        for info_hash in targets {
            if !self.resume.request(info_hash) {
                continue;
            }
            match self.engine.save_resume_data(info_hash, flags) {
                Ok(()) => issued += 1,
                Err(err) => {
                    self.resume.complete(&info_hash);
                    warn!(info_hash = %info_hash, error = %err, "resume data request rejected");
                }
            }
        }
        if issued > 0 {
            debug!(issued, flush_cache, "resume data requested");
        }
        issued
    }

    /// Submit every stored torrent and start tracking their confirmations. Returns the
    /// number of adds the engine accepted.
    ///
    /// # Errors
    ///
    /// Returns an error if called twice, the store cannot be read, or the engine stops.
    pub fn load_initial_torrents(&mut self, store: &dyn TorrentStore) -> SessionResult<usize> {
        if self.initial_load.has_begun() {
            return Err(SessionError::InitialLoadStarted);
        }
        let records = store.load_all().map_err(|source| SessionError::Store {
            operation: "load_all",
            source,
        })?;
        let mut accepted = HashSet::new();
        for record in records {
            let row_id = record.row_id;
            let request = AddTorrentRequest {
                torrent: record.torrent,
                download_path: record.download_path,
                name: record.name,
                resume_data: record.resume_data,
                paused: false,
                row_id: Some(row_id),
            };
            match self.add_torrent(request) {
                Ok(info_hash) => {
                    accepted.insert(info_hash);
                }
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    warn!(row_id, error = %err, "skipping stored torrent the engine rejected");
                }
            }
        }
        let expected = accepted.len();
        info!(expected, "initial torrents submitted");
        self.initial_load.begin(accepted);
        Ok(expected)
    }

    /// Attach a durable row id to a torrent, pending or registered.
    pub fn attach_row_id(&mut self, info_hash: InfoHash, row_id: i64) -> bool {
        if let Some(state) = self.store.get_mut(&info_hash) {
            state.row_id = Some(row_id);
            return true;
        }
        if let Some(pending) = self.pending_adds.get_mut(&info_hash) {
            pending.row_id = Some(row_id);
            return true;
        }
        false
    }

    #[must_use]
    /// Snapshot of one torrent.
    pub fn torrent(&self, info_hash: &InfoHash) -> Option<Arc<TorrentState>> {
        self.store.get(info_hash)
    }

    #[must_use]
    /// Snapshots of every registered torrent, in info-hash order.
    pub fn torrents(&self) -> Vec<Arc<TorrentState>> {
        self.store.iter().cloned().collect()
    }

    #[must_use]
    /// Whether any listen socket has been bound.
    pub const fn is_listening(&self) -> bool {
        self.listening
    }

    #[must_use]
    /// Whether every startup torrent has been confirmed.
    pub const fn initial_load_complete(&self) -> bool {
        self.initial_load.is_complete()
    }

    #[must_use]
    /// Receiver that flips to `true` once the startup torrents are confirmed.
    pub fn subscribe_initial_load(&self) -> watch::Receiver<bool> {
        self.initial_load.subscribe()
    }

    #[must_use]
    /// Outstanding resume-data requests.
    pub fn pending_resume_saves(&self) -> usize {
        self.resume.pending()
    }

    #[must_use]
    /// Torrents with tracker state buffered ahead of their add confirmation.
    pub fn pending_tracker_states(&self) -> usize {
        self.trackers.len()
    }

    fn require_registered(
        &self,
        operation: &'static str,
        info_hash: InfoHash,
    ) -> SessionResult<()> {
        if self.store.contains(&info_hash) {
            Ok(())
        } else {
            Err(SessionError::NotFound {
                operation,
                info_hash,
            })
        }
    }

    fn require_known(&self, operation: &'static str, info_hash: InfoHash) -> SessionResult<()> {
        if self.pending_adds.contains_key(&info_hash) {
            return Ok(());
        }
        self.require_registered(operation, info_hash)
    }

    fn update_state(
        &mut self,
        operation: &'static str,
        info_hash: InfoHash,
        mutate: fn(&mut TorrentState),
    ) -> SessionResult<Arc<TorrentState>> {
        let state = self.store.get_mut(&info_hash).ok_or(SessionError::NotFound {
            operation,
            info_hash,
        })?;
        mutate(state);
        self.store.get(&info_hash).ok_or(SessionError::NotFound {
            operation,
            info_hash,
        })
    }
}
