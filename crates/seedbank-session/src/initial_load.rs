//! One-shot completion signal for torrents restored at startup.

use std::collections::HashSet;
use std::time::Instant;

use seedbank_core::InfoHash;
use tokio::sync::watch;
use tracing::info;

/// Counts add confirmations for the startup batch and fires once when all have arrived.
///
/// Both successful and failed add alerts count: either way the engine is done with the
/// torrent.
#[derive(Debug)]
pub struct InitialLoadTracker {
    pending: HashSet<InfoHash>,
    expected: usize,
    started_at: Option<Instant>,
    fired: bool,
    signal: watch::Sender<bool>,
}

impl Default for InitialLoadTracker {
    fn default() -> Self {
        let (signal, _) = watch::channel(false);
        Self {
            pending: HashSet::new(),
            expected: 0,
            started_at: None,
            fired: false,
            signal,
        }
    }
}

impl InitialLoadTracker {
    /// Start tracking the hashes the engine accepted. Fires immediately when empty.
    pub fn begin(&mut self, accepted: HashSet<InfoHash>) {
        self.expected = accepted.len();
        self.pending = accepted;
        self.started_at = Some(Instant::now());
        if self.pending.is_empty() {
            self.fire();
        }
    }

    /// Count an add confirmation. Returns `true` if this confirmation completed the load.
    pub fn observe(&mut self, info_hash: &InfoHash) -> bool {
        if self.fired || !self.pending.remove(info_hash) {
            return false;
        }
        if self.pending.is_empty() {
            self.fire();
            return true;
        }
        false
    }

    #[must_use]
    /// Whether [`Self::begin`] has been called.
    pub const fn has_begun(&self) -> bool {
        self.started_at.is_some()
    }

    #[must_use]
    /// Whether the completion signal has fired.
    pub const fn is_complete(&self) -> bool {
        self.fired
    }

    #[must_use]
    /// Torrents expected at startup.
    pub const fn expected(&self) -> usize {
        self.expected
    }

    #[must_use]
    /// Confirmations received so far.
    pub fn loaded(&self) -> usize {
        self.expected - self.pending.len()
    }

    #[must_use]
    /// Receiver that flips to `true` when loading completes.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.signal.subscribe()
    }

    fn fire(&mut self) {
        if self.fired {
            return;
        }
        self.fired = true;
        self.signal.send_replace(true);
        let elapsed_ms = self
            .started_at
            .map_or(0, |started| {
                u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
            });
        info!(
            torrents = self.expected,
            elapsed_ms, "initial torrents loaded"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hashes(bytes: &[u8]) -> HashSet<InfoHash> {
        bytes.iter().map(|byte| InfoHash::new([*byte; 20])).collect()
    }

    #[test]
    fn fires_once_after_every_confirmation() {
        let mut tracker = InitialLoadTracker::default();
        let receiver = tracker.subscribe();
        tracker.begin(hashes(&[1, 2]));
        assert!(!tracker.is_complete());

        assert!(!tracker.observe(&InfoHash::new([1; 20])));
        assert!(!tracker.observe(&InfoHash::new([1; 20])));
        assert!(!tracker.observe(&InfoHash::new([9; 20])));
        assert_eq!(tracker.loaded(), 1);

        assert!(tracker.observe(&InfoHash::new([2; 20])));
        assert!(tracker.is_complete());
        assert!(*receiver.borrow());
        assert!(!tracker.observe(&InfoHash::new([2; 20])));
    }

    #[test]
    fn empty_startup_fires_immediately() {
        let mut tracker = InitialLoadTracker::default();
        assert!(!tracker.has_begun());
        tracker.begin(HashSet::new());
        assert!(tracker.has_begun());
        assert!(tracker.is_complete());
        assert_eq!(tracker.expected(), 0);
    }

    #[tokio::test]
    async fn subscribers_are_woken() {
        let mut tracker = InitialLoadTracker::default();
        let mut receiver = tracker.subscribe();
        tracker.begin(hashes(&[3]));
        let waiter = tokio::spawn(async move { receiver.wait_for(|done| *done).await.is_ok() });
        tracker.observe(&InfoHash::new([3; 20]));
        assert!(waiter.await.expect("join"));
    }
}
