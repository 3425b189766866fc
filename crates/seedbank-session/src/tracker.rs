//! Holding area for tracker alerts that beat their torrent's add confirmation.
//!
//! # Design
//!
//! - Fragments are keyed by info-hash and merged on arrival, so only the newest observation per
//!   tracker field survives.
//! - Entries expire after a TTL and the table is bounded; the oldest entry goes first.
//! - Removed torrents leave a tombstone for the same TTL so late tracker alerts are dropped
//!   instead of buffered.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use seedbank_core::{InfoHash, TrackerFragment};
use tracing::debug;

/// Default lifetime of a buffered fragment.
pub const DEFAULT_PRELOAD_TTL: Duration = Duration::from_secs(300);
/// Default number of torrents with buffered fragments.
pub const DEFAULT_PRELOAD_CAPACITY: usize = 1024;

#[derive(Debug)]
struct PendingFragment {
    fragment: TrackerFragment,
    first_seen: Instant,
}

/// Buffers tracker fragments for torrents that are not registered yet.
#[derive(Debug)]
pub struct TrackerStateReconciler {
    pending: HashMap<InfoHash, PendingFragment>,
    tombstones: HashMap<InfoHash, Instant>,
    ttl: Duration,
    capacity: usize,
}

impl Default for TrackerStateReconciler {
    fn default() -> Self {
        Self::new(DEFAULT_PRELOAD_TTL, DEFAULT_PRELOAD_CAPACITY)
    }
}

impl TrackerStateReconciler {
    #[must_use]
    /// Construct a reconciler with explicit bounds.
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            pending: HashMap::new(),
            tombstones: HashMap::new(),
            ttl,
            capacity: capacity.max(1),
        }
    }

    /// Fold an observation into the buffered fragment for `info_hash`.
    ///
    /// Returns `false` without buffering when the torrent was removed recently.
    pub fn buffer<F>(&mut self, info_hash: InfoHash, now: Instant, update: F) -> bool
    where
        F: FnOnce(&mut TrackerFragment),
    {
        if self.tombstones.contains_key(&info_hash) {
            return false;
        }
        if !self.pending.contains_key(&info_hash) && self.pending.len() >= self.capacity {
            self.evict_oldest();
        }
        let entry = self
            .pending
            .entry(info_hash)
            .or_insert_with(|| PendingFragment {
                fragment: TrackerFragment::default(),
                first_seen: now,
            });
        update(&mut entry.fragment);
        true
    }

    /// Take the buffered fragment for a newly registered torrent.
    pub fn take(&mut self, info_hash: &InfoHash) -> Option<TrackerFragment> {
        self.pending.remove(info_hash).map(|entry| entry.fragment)
    }

    /// Drop anything buffered for a removed torrent and ignore its late alerts.
    pub fn forget(&mut self, info_hash: InfoHash, now: Instant) {
        self.pending.remove(&info_hash);
        self.tombstones.insert(info_hash, now);
    }

    /// Accept alerts for a torrent again, typically because it is being re-added.
    pub fn revive(&mut self, info_hash: &InfoHash) {
        self.tombstones.remove(info_hash);
    }

    /// Drop fragments and tombstones older than the TTL. Returns the number of fragments
    /// dropped.
    pub fn evict_expired(&mut self, now: Instant) -> usize {
        let ttl = self.ttl;
        let before = self.pending.len();
        self.pending
            .retain(|_, entry| now.saturating_duration_since(entry.first_seen) < ttl);
        self.tombstones
            .retain(|_, removed_at| now.saturating_duration_since(*removed_at) < ttl);
        let evicted = before - self.pending.len();
        if evicted > 0 {
            debug!(evicted, "expired buffered tracker state");
        }
        evicted
    }

    #[must_use]
    /// Torrents with buffered fragments.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    /// Whether nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    #[must_use]
    /// Whether the torrent's tracker alerts are currently ignored.
    pub fn is_tombstoned(&self, info_hash: &InfoHash) -> bool {
        self.tombstones.contains_key(info_hash)
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .pending
            .iter()
            .min_by_key(|(_, entry)| entry.first_seen)
            .map(|(info_hash, _)| *info_hash);
        if let Some(info_hash) = oldest {
            self.pending.remove(&info_hash);
            debug!(info_hash = %info_hash, "tracker buffer full; dropped oldest entry");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use seedbank_core::TrackerReply;

    const URL: &str = "http://tracker.example/announce";

    fn reply(peers: u32) -> impl FnOnce(&mut TrackerFragment) {
        move |fragment| {
            fragment.record_reply(
                URL,
                TrackerReply {
                    at: Utc::now(),
                    num_peers: peers,
                },
            );
        }
    }

    #[test]
    fn buffered_fragment_is_taken_once() {
        let mut reconciler = TrackerStateReconciler::default();
        let hash = InfoHash::new([1; 20]);
        assert!(reconciler.buffer(hash, Instant::now(), reply(4)));
        assert_eq!(reconciler.len(), 1);

        let fragment = reconciler.take(&hash).expect("buffered");
        assert_eq!(
            fragment.get(URL).and_then(|s| s.last_reply.as_ref()).map(|r| r.num_peers),
            Some(4)
        );
        assert!(reconciler.take(&hash).is_none());
    }

    #[test]
    fn expired_entries_are_evicted() {
        let ttl = Duration::from_secs(10);
        let mut reconciler = TrackerStateReconciler::new(ttl, 8);
        let start = Instant::now();
        reconciler.buffer(InfoHash::new([1; 20]), start, reply(1));
        reconciler.buffer(InfoHash::new([2; 20]), start + Duration::from_secs(6), reply(2));

        assert_eq!(reconciler.evict_expired(start + Duration::from_secs(11)), 1);
        assert!(reconciler.take(&InfoHash::new([2; 20])).is_some());
    }

    #[test]
    fn capacity_drops_oldest_entry() {
        let mut reconciler = TrackerStateReconciler::new(Duration::from_secs(60), 2);
        let start = Instant::now();
        reconciler.buffer(InfoHash::new([1; 20]), start, reply(1));
        reconciler.buffer(InfoHash::new([2; 20]), start + Duration::from_secs(1), reply(2));
        reconciler.buffer(InfoHash::new([3; 20]), start + Duration::from_secs(2), reply(3));

        assert_eq!(reconciler.len(), 2);
        assert!(reconciler.take(&InfoHash::new([1; 20])).is_none());
    }

    #[test]
    fn tombstones_block_late_alerts_until_revived() {
        let mut reconciler = TrackerStateReconciler::default();
        let hash = InfoHash::new([5; 20]);
        let now = Instant::now();
        reconciler.buffer(hash, now, reply(1));
        reconciler.forget(hash, now);

        assert!(reconciler.is_empty());
        assert!(!reconciler.buffer(hash, now, reply(2)));

        reconciler.revive(&hash);
        assert!(reconciler.buffer(hash, now, reply(3)));
    }
}
