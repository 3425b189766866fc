#![forbid(unsafe_code)]
#![deny(unused_must_use, rustdoc::broken_intra_doc_links, rustdoc::bare_urls)]

//! Synchronization layer between a BitTorrent engine's alert stream and its callers.
//!
//! A [`TorrentSession`] owns per-torrent state and turns each drained alert queue into one
//! [`seedbank_core::BatchTorrentUpdate`]. The [`worker`] module drives a session on a Tokio
//! task and persists its batches through a [`TorrentStore`].

mod batch;
/// Session configuration.
pub mod config;
/// Engine collaborator trait and the in-memory stub.
pub mod engine;
/// Error types.
pub mod error;
/// Startup completion tracking.
pub mod initial_load;
/// Engine counter republishing.
pub mod metrics;
/// Outstanding resume-data requests.
pub mod resume;
/// Commands and alert dispatch.
pub mod session;
/// Registered torrent snapshots.
pub mod state;
/// Durable torrent records.
pub mod store;
/// Tracker state buffered ahead of add confirmation.
pub mod tracker;
/// Background worker.
pub mod worker;

pub use config::{ConfigError, LoggingSettings, SessionConfig};
pub use engine::stub::StubEngine;
pub use engine::{AddTorrentParams, Engine, EngineResult, EngineSettings, SaveResumeFlags};
pub use error::{EngineError, SessionError, SessionResult, StoreError, StoreResult};
pub use initial_load::InitialLoadTracker;
pub use metrics::{CounterMapping, DEFAULT_COUNTERS, SessionMetricsAggregator};
pub use resume::ResumeDataCoordinator;
pub use session::{AddTorrentRequest, TorrentSession};
pub use state::TorrentStateStore;
pub use store::{FastResumeStore, NewTorrent, StoredTorrent, TorrentStore};
pub use tracker::TrackerStateReconciler;
pub use worker::{ShutdownReport, WorkerConfig, WorkerHandle};
