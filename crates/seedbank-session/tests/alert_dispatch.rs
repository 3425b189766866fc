use std::collections::BTreeSet;

use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};
use proptest::prelude::*;
use seedbank_core::{
    AlertKind, AnnounceEvent, BatchTorrentUpdate, InfoHash, ListenEndpoint, SessionCounter,
    TorrentPhase, TrackerErrorDetail, TorrentStatusSnapshot,
};
use seedbank_session::{
    AddTorrentRequest, DEFAULT_COUNTERS, SessionConfig, StoreResult, StoredTorrent, StubEngine,
    TorrentSession, TorrentStore,
};
use seedbank_session::store::NewTorrent;

const TRACKER: &str = "udp://tracker.example.org:6969/announce";

fn hash(byte: u8) -> InfoHash {
    InfoHash::new([byte; 20])
}

fn session(engine: &StubEngine) -> Result<TorrentSession> {
    Ok(TorrentSession::new(
        Box::new(engine.clone()),
        &SessionConfig::default(),
    )?)
}

fn request(info_hash: InfoHash) -> AddTorrentRequest {
    AddTorrentRequest::new(
        StubEngine::metainfo(info_hash, "payload", &[("payload/a.bin", 16), ("payload/b.bin", 8)]),
        "/downloads",
    )
}

fn fixed_time(second: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, second)
        .single()
        .expect("valid timestamp")
}

fn tracker_alerts(info_hash: InfoHash) -> Vec<AlertKind> {
    vec![
        AlertKind::TrackerAnnounce {
            info_hash,
            url: TRACKER.to_string(),
            event: AnnounceEvent::Started,
            timestamp: fixed_time(1),
        },
        AlertKind::TrackerReply {
            info_hash,
            url: TRACKER.to_string(),
            num_peers: 42,
            timestamp: fixed_time(2),
        },
        AlertKind::TrackerError {
            info_hash,
            url: TRACKER.to_string(),
            error: TrackerErrorDetail {
                message: "timed out".to_string(),
                detail: String::new(),
                category: "system".to_string(),
                code: 110,
            },
            times_in_row: 1,
            timestamp: fixed_time(3),
        },
    ]
}

struct MemoryStore {
    records: Vec<StoredTorrent>,
}

impl MemoryStore {
    fn with_torrents(count: u8) -> Self {
        let records = (1..=count)
            .map(|byte| StoredTorrent {
                row_id: i64::from(byte),
                info_hash: hash(byte),
                torrent: StubEngine::metainfo(hash(byte), "stored", &[("stored.iso", 4)]),
                download_path: "/downloads".to_string(),
                name: None,
                resume_data: None,
            })
            .collect();
        Self { records }
    }
}

impl TorrentStore for MemoryStore {
    fn load_all(&self) -> StoreResult<Vec<StoredTorrent>> {
        Ok(self.records.clone())
    }

    fn insert(&self, _torrent: &NewTorrent<'_>) -> StoreResult<i64> {
        Ok(0)
    }

    fn write_resume_data(&self, _info_hash: InfoHash, _resume_data: &[u8]) -> StoreResult<()> {
        Ok(())
    }

    fn update_download_path(&self, _info_hash: InfoHash, _download_path: &str) -> StoreResult<()> {
        Ok(())
    }

    fn update_name(&self, _info_hash: InfoHash, _name: &str) -> StoreResult<()> {
        Ok(())
    }

    fn remove(&self, _info_hash: InfoHash) -> StoreResult<()> {
        Ok(())
    }
}

fn registered(session: &TorrentSession) -> BTreeSet<InfoHash> {
    session
        .torrents()
        .iter()
        .map(|state| state.info_hash)
        .collect()
}

#[derive(Debug, Clone)]
enum Op {
    Add(u8),
    Remove(u8),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![(0_u8..4).prop_map(Op::Add), (0_u8..4).prop_map(Op::Remove)]
}

proptest! {
    #[test]
    fn store_holds_one_entry_per_hash(ops in proptest::collection::vec(op_strategy(), 1..40)) {
        let engine = StubEngine::new();
        let mut session = TorrentSession::new(Box::new(engine.clone()), &SessionConfig::default())
            .expect("session");
        let mut expected = BTreeSet::new();

        for op in ops {
            match op {
                Op::Add(byte) => {
                    session.add_torrent(request(hash(byte))).expect("add accepted");
                    expected.insert(hash(byte));
                }
                Op::Remove(byte) => {
                    if session.remove_torrent(hash(byte), false).is_ok() {
                        expected.remove(&hash(byte));
                    }
                }
            }
            let batch = session.process_alerts(false).expect("process");
            for removed in &batch.removed {
                prop_assert!(session.torrent(removed).is_none());
            }
            prop_assert_eq!(registered(&session), expected.clone());
            prop_assert_eq!(session.torrents().len(), expected.len());
        }
    }
}

#[test]
fn tracker_state_is_independent_of_add_ordering() -> Result<()> {
    let info_hash = hash(1);

    let early_engine = StubEngine::new();
    let mut early = session(&early_engine)?;
    for alert in tracker_alerts(info_hash) {
        early_engine.push_alert(alert);
    }
    early.process_alerts(false)?;
    assert_eq!(early.pending_tracker_states(), 1);
    early.add_torrent(request(info_hash))?;
    early.process_alerts(false)?;
    assert_eq!(early.pending_tracker_states(), 0);

    let late_engine = StubEngine::new();
    let mut late = session(&late_engine)?;
    late.add_torrent(request(info_hash))?;
    late.process_alerts(false)?;
    for alert in tracker_alerts(info_hash) {
        late_engine.push_alert(alert);
    }
    let batch = late.process_alerts(false)?;
    assert_eq!(batch.updated.len(), 1);

    let same_cycle_engine = StubEngine::new();
    let mut same_cycle = session(&same_cycle_engine)?;
    for alert in tracker_alerts(info_hash) {
        same_cycle_engine.push_alert(alert);
    }
    same_cycle.add_torrent(request(info_hash))?;
    same_cycle.process_alerts(false)?;

    let early_trackers = early.torrent(&info_hash).expect("registered").trackers.clone();
    let late_trackers = late.torrent(&info_hash).expect("registered").trackers.clone();
    let same_cycle_trackers = same_cycle
        .torrent(&info_hash)
        .expect("registered")
        .trackers
        .clone();
    assert_eq!(early_trackers, late_trackers);
    assert_eq!(same_cycle_trackers, late_trackers);

    let status = late_trackers.get(TRACKER).expect("tracker recorded");
    assert_eq!(status.last_reply.as_ref().map(|reply| reply.num_peers), Some(42));
    assert!(status.last_error.is_some());
    Ok(())
}

#[test]
fn unrequested_resume_outcomes_are_ignored() -> Result<()> {
    let engine = StubEngine::new();
    let mut session = session(&engine)?;
    let info_hash = hash(2);
    session.add_torrent(request(info_hash))?;
    session.process_alerts(false)?;
    let before = session.torrent(&info_hash).expect("registered");

    engine.push_alert(AlertKind::SaveResumeData {
        info_hash,
        resume_data: b"stale".to_vec(),
    });
    engine.push_alert(AlertKind::SaveResumeDataFailed {
        info_hash,
        reason: "stale".to_string(),
    });
    engine.push_alert(AlertKind::SaveResumeData {
        info_hash: hash(99),
        resume_data: b"unknown".to_vec(),
    });
    let batch = session.process_alerts(false)?;

    assert!(batch.resume_data_saved.is_empty());
    assert!(batch.resume_data_failed.is_empty());
    assert!(batch.updated.is_empty());
    assert_eq!(session.torrent(&info_hash), Some(before));
    Ok(())
}

#[test]
fn requested_resume_data_is_moved_into_the_batch_once() -> Result<()> {
    let engine = StubEngine::new();
    let mut session = session(&engine)?;
    let info_hash = hash(3);
    session.add_torrent(request(info_hash))?;
    session.process_alerts(false)?;

    assert_eq!(session.all_torrents_save_resume_data(true), 1);
    assert_eq!(session.all_torrents_save_resume_data(true), 0);
    assert_eq!(session.pending_resume_saves(), 1);

    let batch = session.process_alerts(false)?;
    assert_eq!(batch.resume_data_saved.len(), 1);
    assert!(!batch.resume_data_saved[0].resume_data.is_empty());
    assert_eq!(session.pending_resume_saves(), 0);
    assert!(!session.torrent(&info_hash).expect("registered").needs_resume_save);
    Ok(())
}

#[test]
fn initial_load_fires_once_after_every_confirmation() -> Result<()> {
    let engine = StubEngine::new();
    let mut session = session(&engine)?;
    session.process_alerts(false)?;
    let mut signal = session.subscribe_initial_load();

    let store = MemoryStore::with_torrents(3);
    assert_eq!(session.load_initial_torrents(&store)?, 3);
    let confirmations = engine.take_alerts();
    assert_eq!(confirmations.len(), 3);

    for (seen, alert) in confirmations.into_iter().enumerate() {
        assert!(!session.initial_load_complete(), "fired after {seen} confirmations");
        assert!(!*signal.borrow());
        engine.push_alert(alert);
        session.process_alerts(false)?;
    }
    assert!(session.initial_load_complete());
    assert!(signal.has_changed()?);
    assert!(*signal.borrow_and_update());

    engine.push_alert(AlertKind::TorrentAdded {
        info_hash: hash(1),
        error: None,
        status: TorrentStatusSnapshot {
            info_hash: hash(1),
            ..TorrentStatusSnapshot::default()
        },
        files: Vec::new(),
    });
    session.process_alerts(false)?;
    assert!(!signal.has_changed()?);

    assert!(matches!(
        session.load_initial_torrents(&store),
        Err(seedbank_session::SessionError::InitialLoadStarted)
    ));
    Ok(())
}

#[test]
fn empty_store_completes_initial_load_immediately() -> Result<()> {
    let engine = StubEngine::new();
    let mut session = session(&engine)?;
    assert_eq!(session.load_initial_torrents(&MemoryStore::with_torrents(0))?, 0);
    assert!(session.initial_load_complete());
    Ok(())
}

#[test]
fn shutting_down_mode_only_reports_resume_outcomes() -> Result<()> {
    let engine = StubEngine::new();
    let mut session = session(&engine)?;
    let saved = hash(4);
    let failed = hash(5);
    session.add_torrent(request(saved))?;
    session.add_torrent(request(failed))?;
    session.process_alerts(false)?;
    engine.fail_resume_data(failed);
    assert_eq!(session.all_torrents_save_resume_data(true), 2);

    let endpoint = ListenEndpoint {
        address: "127.0.0.1".parse()?,
        port: 6881,
    };
    let newcomer = hash(6);
    for alert in [
        AlertKind::TorrentAdded {
            info_hash: newcomer,
            error: None,
            status: TorrentStatusSnapshot {
                info_hash: newcomer,
                ..TorrentStatusSnapshot::default()
            },
            files: Vec::new(),
        },
        AlertKind::StateUpdate {
            statuses: vec![TorrentStatusSnapshot {
                info_hash: saved,
                paused: true,
                ..TorrentStatusSnapshot::default()
            }],
        },
        AlertKind::SessionStats {
            counters: vec![1; 8],
        },
        AlertKind::TorrentFinished { info_hash: saved },
        AlertKind::TorrentRemoved { info_hash: saved },
        AlertKind::ListenSucceeded { endpoint },
        AlertKind::ListenFailed {
            endpoint,
            error: "address in use".to_string(),
        },
        AlertKind::StorageMoved {
            info_hash: saved,
            path: "/elsewhere".to_string(),
        },
        AlertKind::FileRenamed {
            info_hash: saved,
            index: 0,
            new_name: "renamed/a.bin".to_string(),
        },
        AlertKind::Unknown {
            name: "dht_bootstrap_alert".to_string(),
        },
    ]
    .into_iter()
    .chain(tracker_alerts(saved))
    {
        engine.push_alert(alert);
    }

    let batch = session.process_alerts(true)?;
    assert_eq!(batch.resume_data_saved.len(), 1);
    assert_eq!(batch.resume_data_saved[0].info_hash, saved);
    assert_eq!(batch.resume_data_failed.len(), 1);
    assert_eq!(batch.resume_data_failed[0].info_hash, failed);

    let BatchTorrentUpdate {
        updated,
        added,
        removed,
        add_failed,
        session_stats,
        torrent_counts,
        listen_events,
        ..
    } = batch;
    assert!(updated.is_empty() && added.is_empty() && removed.is_empty());
    assert!(add_failed.is_empty() && listen_events.is_empty());
    assert!(session_stats.is_none() && torrent_counts.is_none());
    assert!(session.torrent(&saved).is_some());
    assert!(session.torrent(&newcomer).is_none());
    assert_eq!(session.pending_resume_saves(), 0);
    Ok(())
}

#[test]
fn session_stats_follow_the_counter_catalogue() -> Result<()> {
    let engine = StubEngine::new();
    let mut session = session(&engine)?;
    engine.set_counter("net.recv_bytes", 1_000);
    engine.set_counter("net.sent_bytes", 250);
    engine.set_counter("peer.num_peers_connected", 12);
    engine.set_counter("dht.dht_nodes", 310);

    session.post_session_stats();
    let batch = session.process_alerts(false)?;
    let stats = batch.session_stats.as_ref().expect("stats sample");

    let names: Vec<_> = stats.iter().map(|counter| counter.name.as_str()).collect();
    let catalogue: Vec<_> = DEFAULT_COUNTERS.iter().map(|(name, _)| *name).collect();
    assert_eq!(names, catalogue);
    assert_eq!(
        stats[0],
        SessionCounter {
            name: "downloaded_bytes".to_string(),
            value: 1_000,
        }
    );
    assert_eq!(batch.session_counter("connected_peers"), Some(12));
    assert_eq!(batch.session_counter("dht_nodes"), Some(310));
    assert_eq!(batch.session_counter("checking_torrents"), Some(0));
    Ok(())
}

#[test]
fn latest_stats_sample_wins_within_a_cycle() -> Result<()> {
    let engine = StubEngine::new();
    let mut session = session(&engine)?;
    engine.set_counter("net.recv_bytes", 1);
    session.post_session_stats();
    engine.set_counter("net.recv_bytes", 2);
    session.post_session_stats();

    let batch = session.process_alerts(false)?;
    assert_eq!(batch.session_counter("downloaded_bytes"), Some(2));
    Ok(())
}

#[test]
fn lifecycle_follows_engine_and_caller() -> Result<()> {
    let engine = StubEngine::new();
    engine.set_check_on_add(true);
    let mut session = session(&engine)?;
    let info_hash = hash(7);
    let mut paused = request(info_hash);
    paused.paused = true;
    session.add_torrent(paused)?;

    let batch = session.process_alerts(false)?;
    assert_eq!(batch.added[0].phase, TorrentPhase::Loading);
    assert!(session.is_listening());

    engine.finish_checking(info_hash);
    session.post_torrent_updates();
    session.process_alerts(false)?;
    assert_eq!(
        session.torrent(&info_hash).expect("registered").phase,
        TorrentPhase::Paused
    );

    let resumed = session.resume_torrent(info_hash)?;
    assert_eq!(resumed.phase, TorrentPhase::Active);

    engine.set_error(info_hash, Some("disk full"));
    session.post_torrent_updates();
    session.process_alerts(false)?;
    assert_eq!(
        session.torrent(&info_hash).expect("registered").phase,
        TorrentPhase::Error
    );

    engine.set_error(info_hash, None);
    session.post_torrent_updates();
    session.process_alerts(false)?;
    assert_eq!(
        session.torrent(&info_hash).expect("registered").phase,
        TorrentPhase::Active
    );

    engine.push_alert(AlertKind::TorrentFinished { info_hash });
    session.pause_torrent(info_hash)?;
    session.process_alerts(false)?;
    let state = session.torrent(&info_hash).expect("registered");
    assert!(state.finished);
    assert_eq!(state.phase, TorrentPhase::Paused);

    session.remove_torrent(info_hash, true)?;
    let batch = session.process_alerts(false)?;
    assert_eq!(batch.removed, vec![info_hash]);
    assert!(session.torrent(&info_hash).is_none());

    engine.push_alert(AlertKind::TorrentFinished { info_hash });
    for alert in tracker_alerts(info_hash) {
        engine.push_alert(alert);
    }
    let batch = session.process_alerts(false)?;
    assert!(batch.updated.is_empty());
    assert_eq!(session.pending_tracker_states(), 0);
    Ok(())
}

#[test]
fn rename_and_move_are_applied_from_alerts() -> Result<()> {
    let engine = StubEngine::new();
    let mut session = session(&engine)?;
    let info_hash = hash(8);
    session.add_torrent(request(info_hash))?;
    session.process_alerts(false)?;

    assert_eq!(session.rename_torrent(info_hash, "renamed")?, 2);
    session.move_data(info_hash, "/archive")?;
    let batch = session.process_alerts(false)?;
    assert_eq!(batch.updated.len(), 1);

    let state = session.torrent(&info_hash).expect("registered");
    assert_eq!(state.name, "renamed");
    assert_eq!(state.download_path, "/archive");
    assert_eq!(state.files[1].path, "renamed/b.bin");
    assert!(state.needs_resume_save);
    Ok(())
}

#[test]
fn removal_drops_outstanding_resume_request() -> Result<()> {
    let engine = StubEngine::new();
    let mut session = session(&engine)?;
    let info_hash = hash(12);
    session.add_torrent(request(info_hash))?;
    session.process_alerts(false)?;

    assert_eq!(session.all_torrents_save_resume_data(true), 1);
    assert_eq!(session.pending_resume_saves(), 1);
    session.remove_torrent(info_hash, false)?;
    engine.take_alerts();
    engine.push_alert(AlertKind::TorrentRemoved { info_hash });
    let batch = session.process_alerts(false)?;
    assert_eq!(batch.removed, vec![info_hash]);
    assert_eq!(session.pending_resume_saves(), 0);

    engine.push_alert(AlertKind::SaveResumeData {
        info_hash,
        resume_data: b"late".to_vec(),
    });
    let batch = session.process_alerts(true)?;
    assert!(batch.resume_data_saved.is_empty());
    Ok(())
}

#[test]
fn failed_add_is_reported_without_state() -> Result<()> {
    let engine = StubEngine::new();
    let mut session = session(&engine)?;
    let info_hash = hash(9);
    engine.fail_add(info_hash, "invalid piece layout");
    let mut req = request(info_hash);
    req.row_id = Some(17);
    session.add_torrent(req)?;

    let batch = session.process_alerts(false)?;
    assert_eq!(batch.add_failed.len(), 1);
    assert_eq!(batch.add_failed[0].row_id, Some(17));
    assert!(batch.added.is_empty());
    assert!(session.torrent(&info_hash).is_none());
    Ok(())
}

#[test]
fn engine_loss_is_fatal() -> Result<()> {
    let engine = StubEngine::new();
    let mut session = session(&engine)?;
    engine.shut_down("engine thread panicked");
    let err = session.process_alerts(false).expect_err("engine gone");
    assert!(err.is_fatal());
    Ok(())
}

#[test]
fn recheck_and_reannounce_surface_through_alerts() -> Result<()> {
    let engine = StubEngine::new();
    let mut session = session(&engine)?;
    let info_hash = hash(10);
    session.add_torrent(AddTorrentRequest::new(
        StubEngine::metainfo_with_trackers(info_hash, "show", &[("show.mkv", 32)], &[TRACKER]),
        "/downloads",
    ))?;
    session.process_alerts(false)?;

    session.force_reannounce(info_hash)?;
    session.force_recheck(info_hash)?;
    session.post_torrent_updates();
    let batch = session.process_alerts(false)?;
    assert_eq!(batch.updated.len(), 1);

    let state = session.torrent(&info_hash).expect("registered");
    assert!(state.engine_state.is_checking());
    assert!(
        state
            .trackers
            .get(TRACKER)
            .and_then(|status| status.last_announce.as_ref())
            .is_some()
    );

    assert!(matches!(
        session.force_recheck(hash(11)),
        Err(seedbank_session::SessionError::NotFound { .. })
    ));
    Ok(())
}
