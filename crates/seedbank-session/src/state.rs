//! Authoritative per-torrent state owned by the session.

use std::collections::BTreeMap;
use std::sync::Arc;

use seedbank_core::{InfoHash, TorrentCounts, TorrentState};

/// Registered torrents keyed by info-hash.
///
/// Entries are shared as `Arc`s with outgoing batches; writes go through [`Arc::make_mut`], so a
/// snapshot handed out earlier never changes underneath its holder.
#[derive(Debug, Default)]
pub struct TorrentStateStore {
    torrents: BTreeMap<InfoHash, Arc<TorrentState>>,
}

impl TorrentStateStore {
    /// Register a torrent. Returns `false`, leaving the existing entry untouched, when the
    /// hash is already registered.
    pub fn insert(&mut self, state: TorrentState) -> bool {
        if self.torrents.contains_key(&state.info_hash) {
            return false;
        }
        self.torrents.insert(state.info_hash, Arc::new(state));
        true
    }

    #[must_use]
    /// Shared snapshot of a torrent.
    pub fn get(&self, info_hash: &InfoHash) -> Option<Arc<TorrentState>> {
        self.torrents.get(info_hash).cloned()
    }

    /// Mutable access; copies the entry first if a batch still holds it.
    pub fn get_mut(&mut self, info_hash: &InfoHash) -> Option<&mut TorrentState> {
        self.torrents.get_mut(info_hash).map(Arc::make_mut)
    }

    /// Destroy a torrent's state.
    pub fn remove(&mut self, info_hash: &InfoHash) -> Option<Arc<TorrentState>> {
        self.torrents.remove(info_hash)
    }

    #[must_use]
    /// Whether the hash is registered.
    pub fn contains(&self, info_hash: &InfoHash) -> bool {
        self.torrents.contains_key(info_hash)
    }

    #[must_use]
    /// Number of registered torrents.
    pub fn len(&self) -> usize {
        self.torrents.len()
    }

    #[must_use]
    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.torrents.is_empty()
    }

    /// Iterate torrents in info-hash order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<TorrentState>> {
        self.torrents.values()
    }

    /// Hashes of torrents with stale resume data.
    pub fn dirty(&self) -> impl Iterator<Item = InfoHash> + '_ {
        self.torrents
            .values()
            .filter(|state| state.needs_resume_save)
            .map(|state| state.info_hash)
    }

    #[must_use]
    /// Phase and finished counts across every registered torrent.
    pub fn counts(&self) -> TorrentCounts {
        let mut counts = TorrentCounts::default();
        for state in self.torrents.values() {
            counts.record(state.phase, state.finished);
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use seedbank_core::{EngineTorrentState, TorrentPhase, TorrentStatusSnapshot};

    fn state(byte: u8, engine_state: EngineTorrentState) -> TorrentState {
        TorrentState::confirmed(
            &TorrentStatusSnapshot {
                info_hash: InfoHash::new([byte; 20]),
                name: format!("torrent-{byte}"),
                state: engine_state,
                ..TorrentStatusSnapshot::default()
            },
            Vec::new(),
            None,
            false,
            None,
        )
    }

    #[test]
    fn insert_never_replaces() {
        let mut store = TorrentStateStore::default();
        assert!(store.insert(state(1, EngineTorrentState::Downloading)));
        let mut duplicate = state(1, EngineTorrentState::Downloading);
        duplicate.name = "other".to_string();
        assert!(!store.insert(duplicate));
        assert_eq!(store.len(), 1);
        let kept = store.get(&InfoHash::new([1; 20])).expect("registered");
        assert_eq!(kept.name, "torrent-1");
    }

    #[test]
    fn snapshots_are_isolated_from_later_writes() {
        let mut store = TorrentStateStore::default();
        store.insert(state(2, EngineTorrentState::Downloading));
        let hash = InfoHash::new([2; 20]);
        let snapshot = store.get(&hash).expect("registered");

        store.get_mut(&hash).expect("registered").request_pause();

        assert_eq!(snapshot.phase, TorrentPhase::Active);
        assert_eq!(
            store.get(&hash).map(|state| state.phase),
            Some(TorrentPhase::Paused)
        );
    }

    #[test]
    fn counts_cover_every_phase() {
        let mut store = TorrentStateStore::default();
        store.insert(state(1, EngineTorrentState::Downloading));
        store.insert(state(2, EngineTorrentState::CheckingFiles));
        store.insert(state(3, EngineTorrentState::Seeding));
        store
            .get_mut(&InfoHash::new([3; 20]))
            .expect("registered")
            .mark_finished();

        let counts = store.counts();
        assert_eq!(counts.active, 2);
        assert_eq!(counts.loading, 1);
        assert_eq!(counts.finished, 1);
        assert_eq!(counts.total, 3);
        assert_eq!(store.dirty().collect::<Vec<_>>(), vec![InfoHash::new([3; 20])]);
    }
}
