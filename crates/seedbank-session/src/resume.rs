//! Resume-data wait set.

use std::collections::HashSet;

use seedbank_core::InfoHash;

/// Torrents with an outstanding resume-data request.
///
/// A hash enters the set before the engine command is issued and leaves it when the matching
/// saved or failed alert is processed. Outcome alerts for hashes not in the set are stale.
#[derive(Debug, Default)]
pub struct ResumeDataCoordinator {
    waiting: HashSet<InfoHash>,
}

impl ResumeDataCoordinator {
    /// Register an outstanding request. Returns `false` if one was already pending.
    pub fn request(&mut self, info_hash: InfoHash) -> bool {
        self.waiting.insert(info_hash)
    }

    /// Resolve a request. Returns `false` for stale or duplicate outcomes.
    pub fn complete(&mut self, info_hash: &InfoHash) -> bool {
        self.waiting.remove(info_hash)
    }

    /// Drop a request whose torrent is gone. Returns `false` if none was pending.
    pub fn discard(&mut self, info_hash: &InfoHash) -> bool {
        self.waiting.remove(info_hash)
    }

    #[must_use]
    /// Whether a request is outstanding.
    pub fn is_waiting(&self, info_hash: &InfoHash) -> bool {
        self.waiting.contains(info_hash)
    }

    #[must_use]
    /// Number of outstanding requests.
    pub fn pending(&self) -> usize {
        self.waiting.len()
    }

    #[must_use]
    /// Whether every request has resolved.
    pub fn is_idle(&self) -> bool {
        self.waiting.is_empty()
    }
}
