#![allow(clippy::redundant_pub_crate)]

use std::collections::HashMap;

use seedbank_core::{BatchTorrentUpdate, InfoHash};

use crate::state::TorrentStateStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Touch {
    Added,
    Updated,
}

/// Collects one cycle's changes; torrent snapshots are resolved only in [`Self::finish`], so
/// each hash contributes its end-of-cycle state exactly once.
#[derive(Debug, Default)]
pub(crate) struct BatchAccumulator {
    order: Vec<InfoHash>,
    touched: HashMap<InfoHash, Touch>,
    removed: Vec<InfoHash>,
    batch: BatchTorrentUpdate,
}

impl BatchAccumulator {
    /// Mark an existing torrent as updated.
    pub(crate) fn touch(&mut self, info_hash: InfoHash) {
        if !self.touched.contains_key(&info_hash) {
            self.order.push(info_hash);
            self.touched.insert(info_hash, Touch::Updated);
        }
    }

    /// Mark a torrent as added this cycle; it is then reported only as added.
    pub(crate) fn record_added(&mut self, info_hash: InfoHash) {
        self.removed.retain(|removed| *removed != info_hash);
        match self.touched.insert(info_hash, Touch::Added) {
            Some(_) => {}
            None => self.order.push(info_hash),
        }
    }

    /// Mark a torrent as removed; earlier touches this cycle are dropped.
    pub(crate) fn record_removed(&mut self, info_hash: InfoHash) {
        self.touched.remove(&info_hash);
        if !self.removed.contains(&info_hash) {
            self.removed.push(info_hash);
        }
    }

    /// Non-torrent sections of the batch.
    pub(crate) const fn batch_mut(&mut self) -> &mut BatchTorrentUpdate {
        &mut self.batch
    }

    /// Resolve snapshots and produce the batch.
    pub(crate) fn finish(self, store: &TorrentStateStore) -> BatchTorrentUpdate {
        let Self {
            order,
            mut touched,
            removed,
            mut batch,
        } = self;
        for info_hash in order {
            let Some(touch) = touched.remove(&info_hash) else {
                continue;
            };
            let Some(snapshot) = store.get(&info_hash) else {
                continue;
            };
            match touch {
                Touch::Added => batch.added.push(snapshot),
                Touch::Updated => batch.updated.push((info_hash, snapshot)),
            }
        }
        batch.removed = removed;
        batch
    }
}
