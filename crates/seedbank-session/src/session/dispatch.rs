//! Alert dispatch: drains the engine queue and folds every alert into session state.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use seedbank_core::tracker::format_tracker_error;
use seedbank_core::{
    AddFailed, AlertKind, BatchTorrentUpdate, InfoHash, ListenEndpoint, ListenEvent,
    ResumeDataFailed, ResumeDataSaved, TorrentFileEntry, TorrentState, TorrentStatusSnapshot,
    TrackerAnnounce, TrackerFailure, TrackerFragment, TrackerReply,
};
use tracing::{debug, info, warn};

use super::TorrentSession;
use crate::batch::BatchAccumulator;
use crate::error::{SessionError, SessionResult};

/// Per-kind handler time within one cycle.
#[derive(Debug, Default)]
struct HandlerTimings {
    kinds: BTreeMap<&'static str, (u32, Duration)>,
}

impl HandlerTimings {
    fn record(&mut self, kind: &'static str, elapsed: Duration) {
        let entry = self.kinds.entry(kind).or_default();
        entry.0 += 1;
        entry.1 += elapsed;
    }

    fn log(&self, shutting_down: bool) {
        if self.kinds.is_empty() {
            return;
        }
        let alerts: u32 = self.kinds.values().map(|(count, _)| count).sum();
        let total: Duration = self.kinds.values().map(|(_, elapsed)| *elapsed).sum();
        let breakdown = self
            .kinds
            .iter()
            .map(|(kind, (count, elapsed))| format!("{kind}={count}/{}us", elapsed.as_micros()))
            .collect::<Vec<_>>()
            .join(" ");
        debug!(
            alerts,
            total_us = u64::try_from(total.as_micros()).unwrap_or(u64::MAX),
            shutting_down,
            breakdown = %breakdown,
            "alert cycle handled"
        );
    }
}

impl TorrentSession {
    /// Drain the engine's alert queue and return everything that changed.
    ///
    /// In shutting-down mode only resume-data outcomes are handled; every other alert is
    /// dropped and no derived counts are computed.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::EngineUnavailable`] if the engine can no longer be polled.
    pub fn process_alerts(&mut self, shutting_down: bool) -> SessionResult<BatchTorrentUpdate> {
        let alerts = self
            .engine
            .pop_alerts()
            .map_err(|source| SessionError::EngineUnavailable { source })?;
        let now = Instant::now();
        let mut acc = BatchAccumulator::default();
        let mut timings = HandlerTimings::default();

        for alert in alerts {
            let kind = alert.name();
            let started = Instant::now();
            if shutting_down {
                self.dispatch_shutting_down(&mut acc, alert);
            } else {
                self.dispatch(&mut acc, alert, now);
            }
            timings.record(kind, started.elapsed());
        }

        if !shutting_down {
            self.trackers.evict_expired(now);
            acc.batch_mut().torrent_counts = Some(self.store.counts());
        }
        timings.log(shutting_down);
        Ok(acc.finish(&self.store))
    }

    fn dispatch_shutting_down(&mut self, acc: &mut BatchAccumulator, alert: AlertKind) {
        match alert {
            AlertKind::SaveResumeData {
                info_hash,
                resume_data,
            } => self.on_resume_data_saved(acc, info_hash, resume_data),
            AlertKind::SaveResumeDataFailed { info_hash, reason } => {
                self.on_resume_data_failed(acc, info_hash, reason);
            }
            other => debug!(alert = other.name(), "dropping alert during shutdown"),
        }
    }

    fn dispatch(&mut self, acc: &mut BatchAccumulator, alert: AlertKind, now: Instant) {
        match alert {
            AlertKind::TorrentAdded {
                info_hash,
                error,
                status,
                files,
            } => self.on_torrent_added(acc, info_hash, error, &status, files),
            AlertKind::StateUpdate { statuses } => self.on_state_update(acc, &statuses),
            AlertKind::SessionStats { counters } => {
                acc.batch_mut().session_stats = Some(self.metrics.publish(&counters));
            }
            AlertKind::TorrentFinished { info_hash } => {
                if self.mutate(acc, info_hash, TorrentState::mark_finished) {
                    info!(info_hash = %info_hash, "torrent finished");
                }
            }
            AlertKind::SaveResumeData {
                info_hash,
                resume_data,
            } => self.on_resume_data_saved(acc, info_hash, resume_data),
            AlertKind::SaveResumeDataFailed { info_hash, reason } => {
                self.on_resume_data_failed(acc, info_hash, reason);
            }
            AlertKind::TrackerAnnounce {
                info_hash,
                url,
                event,
                timestamp,
            } => self.on_tracker(acc, info_hash, now, move |fragment| {
                fragment.record_announce(
                    &url,
                    TrackerAnnounce {
                        at: timestamp,
                        event,
                    },
                );
            }),
            AlertKind::TrackerReply {
                info_hash,
                url,
                num_peers,
                timestamp,
            } => self.on_tracker(acc, info_hash, now, move |fragment| {
                fragment.record_reply(
                    &url,
                    TrackerReply {
                        at: timestamp,
                        num_peers,
                    },
                );
            }),
            AlertKind::TrackerError {
                info_hash,
                url,
                error,
                times_in_row,
                timestamp,
            } => {
                let message = format_tracker_error(&url, &error);
                debug!(info_hash = %info_hash, error = %message, "tracker error");
                self.on_tracker(acc, info_hash, now, move |fragment| {
                    fragment.record_error(
                        &url,
                        TrackerFailure {
                            at: timestamp,
                            message,
                            times_in_row,
                        },
                    );
                });
            }
            AlertKind::TorrentRemoved { info_hash } => self.on_torrent_removed(acc, info_hash, now),
            AlertKind::ListenSucceeded { endpoint } => self.on_listen_succeeded(acc, endpoint),
            AlertKind::ListenFailed { endpoint, error } => {
                warn!(
                    endpoint = %endpoint,
                    key = %endpoint.key(),
                    error = %error,
                    "failed to open listen socket"
                );
                acc.batch_mut()
                    .listen_events
                    .push(ListenEvent::Failed { endpoint, error });
            }
            AlertKind::StorageMoved { info_hash, path } => {
                if self.mutate(acc, info_hash, |state| state.apply_storage_moved(&path)) {
                    info!(info_hash = %info_hash, path = %path, "storage moved");
                }
            }
            AlertKind::FileRenamed {
                info_hash,
                index,
                new_name,
            } => self.on_file_renamed(acc, info_hash, index, &new_name),
            AlertKind::Unknown { name } => debug!(alert = %name, "ignoring unhandled alert"),
        }
    }

    fn on_torrent_added(
        &mut self,
        acc: &mut BatchAccumulator,
        info_hash: InfoHash,
        error: Option<String>,
        status: &TorrentStatusSnapshot,
        files: Vec<TorrentFileEntry>,
    ) {
        let pending = self.pending_adds.remove(&info_hash);
        if self.initial_load.observe(&info_hash) {
            debug!(info_hash = %info_hash, "last initial torrent confirmed");
        }

        if let Some(reason) = error {
            warn!(info_hash = %info_hash, error = %reason, "engine failed to add torrent");
            acc.batch_mut().add_failed.push(AddFailed {
                info_hash,
                row_id: pending.and_then(|pending| pending.row_id),
                reason,
            });
            return;
        }
        if self.store.contains(&info_hash) {
            debug!(info_hash = %info_hash, "duplicate add confirmation ignored");
            return;
        }

        let (row_id, paused, name) = pending.map_or((None, status.paused, None), |pending| {
            (pending.row_id, pending.paused, pending.name)
        });
        let mut state = TorrentState::confirmed(status, files, row_id, paused, name.as_deref());
        self.trackers.revive(&info_hash);
        if let Some(fragment) = self.trackers.take(&info_hash) {
            state.trackers.merge(fragment);
        }
        let phase = state.phase;
        self.store.insert(state);
        acc.record_added(info_hash);
        info!(info_hash = %info_hash, phase = %phase, "torrent added");
    }

    fn on_state_update(&mut self, acc: &mut BatchAccumulator, statuses: &[TorrentStatusSnapshot]) {
        for status in statuses {
            let Some(state) = self.store.get_mut(&status.info_hash) else {
                debug!(info_hash = %status.info_hash, "status for unregistered torrent ignored");
                continue;
            };
            let previous = state.phase;
            if state.apply_status(status) {
                debug!(
                    info_hash = %status.info_hash,
                    from = %previous,
                    to = %state.phase,
                    "torrent phase changed"
                );
            }
            acc.touch(status.info_hash);
        }
    }

    fn on_resume_data_saved(
        &mut self,
        acc: &mut BatchAccumulator,
        info_hash: InfoHash,
        resume_data: Vec<u8>,
    ) {
        if !self.resume.complete(&info_hash) {
            debug!(info_hash = %info_hash, "unrequested resume data ignored");
            return;
        }
        let row_id = self.store.get_mut(&info_hash).and_then(|state| {
            state.needs_resume_save = false;
            state.row_id
        });
        debug!(info_hash = %info_hash, bytes = resume_data.len(), "resume data saved");
        acc.batch_mut().resume_data_saved.push(ResumeDataSaved {
            info_hash,
            row_id,
            resume_data,
        });
    }

    fn on_resume_data_failed(
        &mut self,
        acc: &mut BatchAccumulator,
        info_hash: InfoHash,
        reason: String,
    ) {
        if !self.resume.complete(&info_hash) {
            debug!(info_hash = %info_hash, "unrequested resume data failure ignored");
            return;
        }
        warn!(info_hash = %info_hash, error = %reason, "resume data request failed");
        acc.batch_mut()
            .resume_data_failed
            .push(ResumeDataFailed { info_hash, reason });
    }

    fn on_tracker<F>(
        &mut self,
        acc: &mut BatchAccumulator,
        info_hash: InfoHash,
        now: Instant,
        update: F,
    ) where
        F: FnOnce(&mut TrackerFragment),
    {
        if let Some(state) = self.store.get_mut(&info_hash) {
            update(&mut state.trackers);
            acc.touch(info_hash);
        } else if !self.trackers.buffer(info_hash, now, update) {
            debug!(info_hash = %info_hash, "tracker alert for removed torrent ignored");
        }
    }

    fn on_torrent_removed(
        &mut self,
        acc: &mut BatchAccumulator,
        info_hash: InfoHash,
        now: Instant,
    ) {
        self.pending_adds.remove(&info_hash);
        self.trackers.forget(info_hash, now);
        if self.resume.discard(&info_hash) {
            debug!(info_hash = %info_hash, "outstanding resume data request dropped");
        }
        if self.store.remove(&info_hash).is_some() {
            acc.record_removed(info_hash);
            info!(info_hash = %info_hash, "torrent removed");
        } else {
            debug!(info_hash = %info_hash, "removal of unregistered torrent ignored");
        }
    }

    fn on_listen_succeeded(&mut self, acc: &mut BatchAccumulator, endpoint: ListenEndpoint) {
        self.listening = true;
        info!(endpoint = %endpoint, key = %endpoint.key(), "listening for peers");
        acc.batch_mut()
            .listen_events
            .push(ListenEvent::Succeeded { endpoint });
    }

    fn on_file_renamed(
        &mut self,
        acc: &mut BatchAccumulator,
        info_hash: InfoHash,
        index: u32,
        new_name: &str,
    ) {
        let Some(state) = self.store.get_mut(&info_hash) else {
            debug!(info_hash = %info_hash, "rename for unregistered torrent ignored");
            return;
        };
        if state.apply_file_renamed(index, new_name) {
            acc.touch(info_hash);
        } else {
            debug!(info_hash = %info_hash, index, "rename for unknown file index ignored");
        }
    }

    /// Apply `mutate` to a registered torrent and mark it updated. Returns `false` for stale
    /// references.
    fn mutate<F>(&mut self, acc: &mut BatchAccumulator, info_hash: InfoHash, mutate: F) -> bool
    where
        F: FnOnce(&mut TorrentState),
    {
        let Some(state) = self.store.get_mut(&info_hash) else {
            debug!(info_hash = %info_hash, "alert for unregistered torrent ignored");
            return false;
        };
        mutate(state);
        acc.touch(info_hash);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timings_accumulate_per_kind() {
        let mut timings = HandlerTimings::default();
        timings.record("state_update", Duration::from_micros(5));
        timings.record("state_update", Duration::from_micros(7));
        timings.record("tracker_reply", Duration::from_micros(1));
        assert_eq!(
            timings.kinds.get("state_update"),
            Some(&(2, Duration::from_micros(12)))
        );
        assert_eq!(timings.kinds.len(), 2);
        timings.log(false);
    }
}
