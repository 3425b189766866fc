#![forbid(unsafe_code)]
#![deny(unused_must_use, rustdoc::broken_intra_doc_links, rustdoc::bare_urls)]

//! Engine-agnostic torrent session types shared across the workspace.
//!
//! Layout: `model` (info-hash, lifecycle phase, per-torrent state), `tracker` (tracker fragments
//! and merge rules), `alert` (the engine alert sum type), `batch` (per-cycle update payload),
//! `error` (parse/validation errors for the types above).

pub mod alert;
pub mod batch;
pub mod error;
pub mod model;
pub mod tracker;

pub use alert::{AlertKind, AnnounceEvent, ListenEndpoint, TrackerErrorDetail};
pub use batch::{
    AddFailed, BatchTorrentUpdate, ListenEvent, ResumeDataFailed, ResumeDataSaved,
    SessionCounter, TorrentCounts,
};
pub use error::{CoreError, CoreResult};
pub use model::{
    EngineTorrentState, InfoHash, TorrentFileEntry, TorrentPhase, TorrentState,
    TorrentStatusSnapshot, TransferCounters,
};
pub use tracker::{TrackerAnnounce, TrackerFailure, TrackerFragment, TrackerReply, TrackerStatus};
