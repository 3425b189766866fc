//! Background worker that owns a [`TorrentSession`] and drives its alert loop.
//!
//! # Design
//!
//! - Commands arrive over an mpsc channel and answer through oneshot replies; alert cycles
//!   run on a fixed tick. Both share one task, so the session never needs a lock.
//! - Batches are persisted, folded into metrics, then offered to the caller without waiting.
//!   A full batch channel drops the batch; the torrent snapshots stay queryable through
//!   [`WorkerHandle::torrents`].
//! - Store failures degrade the worker but never stop it; a vanished engine does.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use seedbank_core::{BatchTorrentUpdate, InfoHash, TorrentState};
use seedbank_telemetry::Metrics;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::SessionConfig;
use crate::error::{SessionError, SessionResult};
use crate::session::{AddTorrentRequest, TorrentSession};
use crate::store::{NewTorrent, TorrentStore};

const COMMAND_BUFFER: usize = 64;
const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(50);
const STORE_COMPONENT: &str = "torrent_store";

/// Worker timing and buffering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Alert polling period.
    pub poll_interval: Duration,
    /// Periodic resume-data save period, if enabled.
    pub resume_save_interval: Option<Duration>,
    /// How long shutdown waits for outstanding resume data.
    pub shutdown_timeout: Duration,
    /// Batches buffered for the caller before new ones are dropped.
    pub batch_buffer: usize,
}

impl WorkerConfig {
    #[must_use]
    /// Worker settings from the session configuration.
    pub const fn from_config(config: &SessionConfig) -> Self {
        Self {
            poll_interval: config.alert_poll_interval(),
            resume_save_interval: config.resume_save_interval(),
            shutdown_timeout: config.shutdown_resume_timeout(),
            batch_buffer: 16,
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::from_config(&SessionConfig::default())
    }
}

/// Outcome of a graceful shutdown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Resume-data requests issued for the final save.
    pub requested: usize,
    /// Payloads received before the deadline.
    pub saved: usize,
    /// Requests the engine reported as failed.
    pub failed: usize,
    /// Whether the deadline expired with requests outstanding.
    pub timed_out: bool,
}

type Reply<T> = oneshot::Sender<SessionResult<T>>;

enum Command {
    Add {
        request: AddTorrentRequest,
        respond_to: Reply<InfoHash>,
    },
    Remove {
        info_hash: InfoHash,
        delete_files: bool,
        respond_to: Reply<()>,
    },
    Pause {
        info_hash: InfoHash,
        respond_to: Reply<Arc<TorrentState>>,
    },
    Resume {
        info_hash: InfoHash,
        respond_to: Reply<Arc<TorrentState>>,
    },
    Recheck {
        info_hash: InfoHash,
        respond_to: Reply<()>,
    },
    Reannounce {
        info_hash: InfoHash,
        respond_to: Reply<()>,
    },
    Rename {
        info_hash: InfoHash,
        name: String,
        respond_to: Reply<usize>,
    },
    Move {
        info_hash: InfoHash,
        download_path: String,
        respond_to: Reply<()>,
    },
    SaveResumeData {
        flush_cache: bool,
        respond_to: Reply<usize>,
    },
    Torrents {
        respond_to: Reply<Vec<Arc<TorrentState>>>,
    },
    Shutdown {
        respond_to: oneshot::Sender<ShutdownReport>,
    },
}

/// Cloneable handle to a running worker.
#[derive(Clone)]
pub struct WorkerHandle {
    commands: mpsc::Sender<Command>,
    initial_load: watch::Receiver<bool>,
}

impl WorkerHandle {
    /// Submit an add. A torrent without a row id is persisted first when a store is attached.
    ///
    /// # Errors
    ///
    /// Returns the session error, or [`SessionError::WorkerStopped`].
    pub async fn add_torrent(&self, request: AddTorrentRequest) -> SessionResult<InfoHash> {
        self.request(|respond_to| Command::Add {
            request,
            respond_to,
        })
        .await
    }

    /// Submit a removal.
    ///
    /// # Errors
    ///
    /// Returns the session error, or [`SessionError::WorkerStopped`].
    pub async fn remove_torrent(
        &self,
        info_hash: InfoHash,
        delete_files: bool,
    ) -> SessionResult<()> {
        self.request(|respond_to| Command::Remove {
            info_hash,
            delete_files,
            respond_to,
        })
        .await
    }

    /// Pause a torrent.
    ///
    /// # Errors
    ///
    /// Returns the session error, or [`SessionError::WorkerStopped`].
    pub async fn pause_torrent(&self, info_hash: InfoHash) -> SessionResult<Arc<TorrentState>> {
        self.request(|respond_to| Command::Pause {
            info_hash,
            respond_to,
        })
        .await
    }

    /// Resume a torrent.
    ///
    /// # Errors
    ///
    /// Returns the session error, or [`SessionError::WorkerStopped`].
    pub async fn resume_torrent(&self, info_hash: InfoHash) -> SessionResult<Arc<TorrentState>> {
        self.request(|respond_to| Command::Resume {
            info_hash,
            respond_to,
        })
        .await
    }

    /// Re-verify a torrent's data.
    ///
    /// # Errors
    ///
    /// Returns the session error, or [`SessionError::WorkerStopped`].
    pub async fn force_recheck(&self, info_hash: InfoHash) -> SessionResult<()> {
        self.request(|respond_to| Command::Recheck {
            info_hash,
            respond_to,
        })
        .await
    }

    /// Announce to every tracker now.
    ///
    /// # Errors
    ///
    /// Returns the session error, or [`SessionError::WorkerStopped`].
    pub async fn force_reannounce(&self, info_hash: InfoHash) -> SessionResult<()> {
        self.request(|respond_to| Command::Reannounce {
            info_hash,
            respond_to,
        })
        .await
    }

    /// Rename a torrent's top-level entry.
    ///
    /// # Errors
    ///
    /// Returns the session error, or [`SessionError::WorkerStopped`].
    pub async fn rename_torrent(
        &self,
        info_hash: InfoHash,
        name: impl Into<String>,
    ) -> SessionResult<usize> {
        let name = name.into();
        self.request(|respond_to| Command::Rename {
            info_hash,
            name,
            respond_to,
        })
        .await
    }

    /// Move a torrent's payload.
    ///
    /// # Errors
    ///
    /// Returns the session error, or [`SessionError::WorkerStopped`].
    pub async fn move_data(
        &self,
        info_hash: InfoHash,
        download_path: impl Into<String>,
    ) -> SessionResult<()> {
        let download_path = download_path.into();
        self.request(|respond_to| Command::Move {
            info_hash,
            download_path,
            respond_to,
        })
        .await
    }

    /// Request resume data now.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::WorkerStopped`] if the worker is gone.
    pub async fn save_resume_data(&self, flush_cache: bool) -> SessionResult<usize> {
        self.request(|respond_to| Command::SaveResumeData {
            flush_cache,
            respond_to,
        })
        .await
    }

    /// Snapshots of every registered torrent.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::WorkerStopped`] if the worker is gone.
    pub async fn torrents(&self) -> SessionResult<Vec<Arc<TorrentState>>> {
        self.request(|respond_to| Command::Torrents { respond_to })
            .await
    }

    /// Receiver that flips to `true` once the startup torrents are confirmed.
    #[must_use]
    pub fn initial_load(&self) -> watch::Receiver<bool> {
        self.initial_load.clone()
    }

    /// Pause the session, flush resume data and stop the worker.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::WorkerStopped`] if the worker was already gone.
    pub async fn shutdown(&self) -> SessionResult<ShutdownReport> {
        let (respond_to, response) = oneshot::channel();
        self.commands
            .send(Command::Shutdown { respond_to })
            .await
            .map_err(|_| SessionError::WorkerStopped)?;
        response.await.map_err(|_| SessionError::WorkerStopped)
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> Command,
    ) -> SessionResult<T> {
        let (respond_to, response) = oneshot::channel();
        self.commands
            .send(build(respond_to))
            .await
            .map_err(|_| SessionError::WorkerStopped)?;
        response.await.map_err(|_| SessionError::WorkerStopped)?
    }
}

/// Start the worker task.
///
/// When a store is attached, its torrents are submitted before the first tick and every batch
/// is persisted back into it. Batches with at least one change are forwarded on the returned
/// receiver while it has room.
pub fn spawn(
    session: TorrentSession,
    store: Option<Arc<dyn TorrentStore>>,
    metrics: Option<Metrics>,
    config: WorkerConfig,
) -> (
    WorkerHandle,
    mpsc::Receiver<BatchTorrentUpdate>,
    JoinHandle<()>,
) {
    let (command_tx, mut commands) = mpsc::channel(COMMAND_BUFFER);
    let (batch_tx, batches) = mpsc::channel(config.batch_buffer.max(1));
    let handle = WorkerHandle {
        commands: command_tx,
        initial_load: session.subscribe_initial_load(),
    };

    let task = tokio::spawn(async move {
        let mut worker = Worker::new(session, store, metrics, batch_tx, config);
        if let Err(err) = worker.load_initial_torrents() {
            error!(error = %err, "failed to submit stored torrents");
            return;
        }
        let mut poll = tokio::time::interval(config.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                command = commands.recv() => {
                    match command {
                        Some(Command::Shutdown { respond_to }) => {
                            let report = worker.shutdown().await;
                            let _ = respond_to.send(report);
                            break;
                        }
                        Some(command) => {
                            if worker.handle(command) {
                                error!("engine unavailable; stopping session worker");
                                break;
                            }
                        }
                        None => {
                            worker.shutdown().await;
                            break;
                        }
                    }
                }
                _ = poll.tick() => {
                    if let Err(err) = worker.tick() {
                        error!(error = %err, "alert polling failed; stopping session worker");
                        break;
                    }
                }
            }
        }
        info!("session worker stopped");
    });

    (handle, batches, task)
}

/// Path and name as last written to the store. `name` is `None` until the store holds one.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PersistedRecord {
    download_path: String,
    name: Option<String>,
}

struct Worker {
    session: TorrentSession,
    store: Option<Arc<dyn TorrentStore>>,
    metrics: Option<Metrics>,
    batches: mpsc::Sender<BatchTorrentUpdate>,
    config: WorkerConfig,
    persisted: HashMap<InfoHash, PersistedRecord>,
    health: BTreeSet<&'static str>,
    next_resume_save: Option<Instant>,
    receiver_gone: bool,
    dropped_batches: u64,
}

impl Worker {
    fn new(
        session: TorrentSession,
        store: Option<Arc<dyn TorrentStore>>,
        metrics: Option<Metrics>,
        batches: mpsc::Sender<BatchTorrentUpdate>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            session,
            store,
            metrics,
            batches,
            config,
            persisted: HashMap::new(),
            health: BTreeSet::new(),
            next_resume_save: config
                .resume_save_interval
                .map(|interval| Instant::now() + interval),
            receiver_gone: false,
            dropped_batches: 0,
        }
    }

    fn load_initial_torrents(&mut self) -> SessionResult<()> {
        let Some(store) = self.store.clone() else {
            return Ok(());
        };
        match self.session.load_initial_torrents(store.as_ref()) {
            Ok(_) => {
                self.mark_recovered(STORE_COMPONENT);
                Ok(())
            }
            Err(SessionError::InitialLoadStarted) => {
                debug!("stored torrents already submitted");
                Ok(())
            }
            Err(err) if err.is_fatal() => Err(err),
            Err(err) => {
                let detail = err.to_string();
                self.mark_degraded(STORE_COMPONENT, Some(&detail));
                Ok(())
            }
        }
    }

    /// Run one command. Returns `true` when the engine is gone.
    fn handle(&mut self, command: Command) -> bool {
        match command {
            Command::Add {
                request,
                respond_to,
            } => {
                let result = self.handle_add(request);
                reply(respond_to, result)
            }
            Command::Remove {
                info_hash,
                delete_files,
                respond_to,
            } => reply(
                respond_to,
                self.session.remove_torrent(info_hash, delete_files),
            ),
            Command::Pause {
                info_hash,
                respond_to,
            } => reply(respond_to, self.session.pause_torrent(info_hash)),
            Command::Resume {
                info_hash,
                respond_to,
            } => reply(respond_to, self.session.resume_torrent(info_hash)),
            Command::Recheck {
                info_hash,
                respond_to,
            } => reply(respond_to, self.session.force_recheck(info_hash)),
            Command::Reannounce {
                info_hash,
                respond_to,
            } => reply(respond_to, self.session.force_reannounce(info_hash)),
            Command::Rename {
                info_hash,
                name,
                respond_to,
            } => reply(respond_to, self.session.rename_torrent(info_hash, &name)),
            Command::Move {
                info_hash,
                download_path,
                respond_to,
            } => reply(
                respond_to,
                self.session.move_data(info_hash, &download_path),
            ),
            Command::SaveResumeData {
                flush_cache,
                respond_to,
            } => reply(
                respond_to,
                Ok(self.session.all_torrents_save_resume_data(flush_cache)),
            ),
            Command::Torrents { respond_to } => reply(respond_to, Ok(self.session.torrents())),
            Command::Shutdown { .. } => false,
        }
    }

    fn handle_add(&mut self, request: AddTorrentRequest) -> SessionResult<InfoHash> {
        let unpersisted = request.row_id.is_none();
        let torrent = request.torrent.clone();
        let download_path = request.download_path.clone();
        let name = request.name.clone();
        let info_hash = self.session.add_torrent(request)?;

        if unpersisted && let Some(store) = self.store.clone() {
            let record = NewTorrent {
                info_hash,
                torrent: &torrent,
                download_path: &download_path,
                name: name.as_deref(),
            };
            match store.insert(&record) {
                Ok(row_id) => {
                    self.session.attach_row_id(info_hash, row_id);
                    self.persisted
                        .entry(info_hash)
                        .or_insert(PersistedRecord {
                            download_path,
                            name,
                        });
                    self.mark_recovered(STORE_COMPONENT);
                }
                Err(err) => {
                    let detail = err.to_string();
                    self.mark_degraded(STORE_COMPONENT, Some(&detail));
                    warn!(info_hash = %info_hash, error = %detail, "failed to persist torrent");
                }
            }
        }
        Ok(info_hash)
    }

    fn tick(&mut self) -> SessionResult<()> {
        self.session.post_torrent_updates();
        self.session.post_session_stats();
        let started = Instant::now();
        let batch = self.session.process_alerts(false)?;
        if let Some(metrics) = &self.metrics {
            metrics.observe_alert_cycle(started.elapsed());
        }
        self.deliver(batch);

        if let (Some(interval), Some(due)) =
            (self.config.resume_save_interval, self.next_resume_save)
            && Instant::now() >= due
        {
            self.session.all_torrents_save_resume_data(false);
            self.next_resume_save = Some(Instant::now() + interval);
        }
        Ok(())
    }

    async fn shutdown(&mut self) -> ShutdownReport {
        self.session.pause();
        let mut report = ShutdownReport {
            requested: self.session.all_torrents_save_resume_data(true),
            ..ShutdownReport::default()
        };
        let deadline = Instant::now() + self.config.shutdown_timeout;
        loop {
            match self.session.process_alerts(true) {
                Ok(batch) => {
                    report.saved += batch.resume_data_saved.len();
                    report.failed += batch.resume_data_failed.len();
                    self.deliver(batch);
                }
                Err(err) => {
                    warn!(error = %err, "alert polling failed during shutdown");
                    report.timed_out = self.session.pending_resume_saves() > 0;
                    break;
                }
            }
            if self.session.pending_resume_saves() == 0 {
                break;
            }
            if Instant::now() >= deadline {
                report.timed_out = true;
                break;
            }
            tokio::time::sleep(SHUTDOWN_POLL_INTERVAL).await;
        }
        if report.timed_out {
            warn!(
                outstanding = self.session.pending_resume_saves(),
                saved = report.saved,
                "shutdown deadline expired before all resume data arrived"
            );
        } else {
            info!(
                requested = report.requested,
                saved = report.saved,
                failed = report.failed,
                "resume data flushed"
            );
        }
        report
    }

    fn deliver(&mut self, batch: BatchTorrentUpdate) {
        self.persist(&batch);
        if let Some(metrics) = &self.metrics {
            metrics.observe_batch(&batch);
        }
        if batch.is_empty() || self.receiver_gone {
            return;
        }
        match self.batches.try_send(batch) {
            Ok(()) => {
                if self.dropped_batches > 0 {
                    info!(dropped = self.dropped_batches, "batch receiver caught up");
                    self.dropped_batches = 0;
                }
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped_batches += 1;
                if self.dropped_batches == 1 {
                    warn!(
                        capacity = self.config.batch_buffer,
                        "batch receiver is full; dropping batches until it drains"
                    );
                } else {
                    debug!(dropped = self.dropped_batches, "batch dropped");
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.receiver_gone = true;
                debug!("batch receiver dropped; continuing without forwarding");
            }
        }
    }

    fn persist(&mut self, batch: &BatchTorrentUpdate) {
        let Some(store) = self.store.clone() else {
            return;
        };
        let mut failures = Vec::new();

        for state in &batch.added {
            if state.row_id.is_some() {
                self.persisted
                    .entry(state.info_hash)
                    .or_insert_with(|| PersistedRecord {
                        download_path: state.download_path.clone(),
                        name: Some(state.name.clone()),
                    });
            }
        }

        let changed = batch
            .added
            .iter()
            .map(|state| (&state.info_hash, state))
            .chain(batch.updated.iter().map(|(info_hash, state)| (info_hash, state)));
        for (info_hash, state) in changed {
            let Some(record) = self.persisted.get_mut(info_hash) else {
                continue;
            };
            if record.download_path != state.download_path {
                match store.update_download_path(*info_hash, &state.download_path) {
                    Ok(()) => record.download_path.clone_from(&state.download_path),
                    Err(err) => {
                        failures.push((*info_hash, "update_download_path", err.to_string()));
                    }
                }
            }
            if record.name.as_deref() != Some(state.name.as_str()) {
                match store.update_name(*info_hash, &state.name) {
                    Ok(()) => record.name = Some(state.name.clone()),
                    Err(err) => failures.push((*info_hash, "update_name", err.to_string())),
                }
            }
        }

        for saved in &batch.resume_data_saved {
            if saved.row_id.is_none() {
                debug!(info_hash = %saved.info_hash, "resume data for unpersisted torrent dropped");
                continue;
            }
            if let Err(err) = store.write_resume_data(saved.info_hash, &saved.resume_data) {
                failures.push((saved.info_hash, "write_resume_data", err.to_string()));
            }
        }

        for failed in &batch.add_failed {
            if failed.row_id.is_none() || self.session.torrent(&failed.info_hash).is_some() {
                continue;
            }
            if let Err(err) = store.remove(failed.info_hash) {
                failures.push((failed.info_hash, "remove", err.to_string()));
            }
        }

        for info_hash in &batch.removed {
            self.persisted.remove(info_hash);
            if let Err(err) = store.remove(*info_hash) {
                failures.push((*info_hash, "remove", err.to_string()));
            }
        }

        if failures.is_empty() {
            self.mark_recovered(STORE_COMPONENT);
            return;
        }
        for (info_hash, operation, detail) in failures {
            self.mark_degraded(STORE_COMPONENT, Some(&detail));
            warn!(
                error = %detail,
                info_hash = %info_hash,
                operation,
                "failed to persist torrent update"
            );
        }
    }

    fn mark_degraded(&mut self, component: &'static str, detail: Option<&str>) {
        let inserted = self.health.insert(component);
        match (inserted, detail) {
            (true, Some(detail)) => {
                warn!(component, detail = %detail, "session component degraded");
            }
            (true, None) => warn!(component, "session component degraded"),
            (false, Some(detail)) => {
                debug!(component, detail = %detail, "session component still degraded");
            }
            (false, None) => {}
        }
    }

    fn mark_recovered(&mut self, component: &'static str) {
        if self.health.remove(component) {
            info!(component, "session component recovered");
        }
    }
}

fn reply<T>(respond_to: Reply<T>, result: SessionResult<T>) -> bool {
    let fatal = matches!(&result, Err(err) if err.is_fatal());
    let _ = respond_to.send(result);
    fatal
}
