//! Tracker status fragments and their merge rules.
//!
//! Each field keeps the newest observation (ordered by alert timestamp, ties broken by value),
//! so merging fragments gives the same result regardless of delivery order.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::alert::{AnnounceEvent, TrackerErrorDetail};

/// Last announce sent to a tracker.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TrackerAnnounce {
    /// When the announce was sent.
    pub at: DateTime<Utc>,
    /// Announce event.
    pub event: AnnounceEvent,
}

/// Last successful tracker reply.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TrackerReply {
    /// When the reply arrived.
    pub at: DateTime<Utc>,
    /// Peers returned by the tracker.
    pub num_peers: u32,
}

/// Last tracker failure.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TrackerFailure {
    /// When the failure was reported.
    pub at: DateTime<Utc>,
    /// Human-readable failure text.
    pub message: String,
    /// Consecutive failures reported by the engine.
    pub times_in_row: u32,
}

/// Status of a single tracker URL.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerStatus {
    /// Last announce.
    pub last_announce: Option<TrackerAnnounce>,
    /// Last reply.
    pub last_reply: Option<TrackerReply>,
    /// Last error.
    pub last_error: Option<TrackerFailure>,
}

impl TrackerStatus {
    fn merge(&mut self, other: Self) {
        keep_newest(&mut self.last_announce, other.last_announce);
        keep_newest(&mut self.last_reply, other.last_reply);
        keep_newest(&mut self.last_error, other.last_error);
    }
}

fn keep_newest<T: Ord>(slot: &mut Option<T>, candidate: Option<T>) {
    if let Some(candidate) = candidate
        && slot.as_ref().is_none_or(|existing| *existing < candidate)
    {
        *slot = Some(candidate);
    }
}

/// Tracker statuses for one torrent, keyed by announce URL.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerFragment {
    trackers: BTreeMap<String, TrackerStatus>,
}

impl TrackerFragment {
    /// Record an announce.
    pub fn record_announce(&mut self, url: &str, announce: TrackerAnnounce) {
        keep_newest(&mut self.entry(url).last_announce, Some(announce));
    }

    /// Record a reply.
    pub fn record_reply(&mut self, url: &str, reply: TrackerReply) {
        keep_newest(&mut self.entry(url).last_reply, Some(reply));
    }

    /// Record an error.
    pub fn record_error(&mut self, url: &str, failure: TrackerFailure) {
        keep_newest(&mut self.entry(url).last_error, Some(failure));
    }

    /// Fold another fragment into this one.
    pub fn merge(&mut self, other: Self) {
        for (url, status) in other.trackers {
            self.trackers.entry(url).or_default().merge(status);
        }
    }

    #[must_use]
    /// Status for a tracker URL.
    pub fn get(&self, url: &str) -> Option<&TrackerStatus> {
        self.trackers.get(url)
    }

    /// Iterate trackers in URL order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &TrackerStatus)> {
        self.trackers
            .iter()
            .map(|(url, status)| (url.as_str(), status))
    }

    #[must_use]
    /// Number of trackers with recorded status.
    pub fn len(&self) -> usize {
        self.trackers.len()
    }

    #[must_use]
    /// Whether nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.trackers.is_empty()
    }

    fn entry(&mut self, url: &str) -> &mut TrackerStatus {
        self.trackers.entry(url.to_string()).or_default()
    }
}

/// Render a tracker error as `"<Message> - <detail> (<host>; <Category> <code>)"`.
#[must_use]
pub fn format_tracker_error(url: &str, error: &TrackerErrorDetail) -> String {
    let mut text = capitalize(&error.message);
    if !error.detail.is_empty() {
        text.push_str(" - ");
        text.push_str(&error.detail);
    }
    text.push_str(&format!(
        " ({}; {} {})",
        tracker_host(url),
        capitalize(&error.category),
        error.code
    ));
    text
}

fn tracker_host(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|parsed| parsed.host_str().map(str::to_string))
        .unwrap_or_else(|| url.to_string())
}

fn capitalize(text: &str) -> String {
    let mut chars = text.chars();
    chars.next().map_or_else(String::new, |first| {
        first.to_uppercase().chain(chars).collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + seconds, 0)
            .single()
            .expect("valid timestamp")
    }

    const URL: &str = "udp://tracker.example.org:1337/announce";

    #[test]
    fn newest_observation_wins_per_field() {
        let mut fragment = TrackerFragment::default();
        fragment.record_reply(
            URL,
            TrackerReply {
                at: at(10),
                num_peers: 5,
            },
        );
        fragment.record_reply(
            URL,
            TrackerReply {
                at: at(5),
                num_peers: 50,
            },
        );
        fragment.record_error(
            URL,
            TrackerFailure {
                at: at(7),
                message: "timed out".to_string(),
                times_in_row: 1,
            },
        );

        let status = fragment.get(URL).expect("tracker recorded");
        assert_eq!(status.last_reply.as_ref().map(|r| r.num_peers), Some(5));
        assert_eq!(
            status.last_error.as_ref().map(|e| e.message.as_str()),
            Some("timed out")
        );
        assert!(status.last_announce.is_none());
    }

    #[test]
    fn merge_is_order_independent() {
        let mut early = TrackerFragment::default();
        early.record_announce(
            URL,
            TrackerAnnounce {
                at: at(1),
                event: AnnounceEvent::Started,
            },
        );
        early.record_reply(
            URL,
            TrackerReply {
                at: at(2),
                num_peers: 3,
            },
        );

        let mut late = TrackerFragment::default();
        late.record_reply(
            URL,
            TrackerReply {
                at: at(4),
                num_peers: 9,
            },
        );
        late.record_announce(
            "http://other.example/announce",
            TrackerAnnounce {
                at: at(3),
                event: AnnounceEvent::None,
            },
        );

        let mut forward = early.clone();
        forward.merge(late.clone());
        let mut backward = late;
        backward.merge(early);
        assert_eq!(forward, backward);
        assert_eq!(forward.len(), 2);
    }

    #[test]
    fn tracker_error_text_includes_host_and_category() {
        let detail = TrackerErrorDetail {
            message: "connection refused".to_string(),
            detail: "retrying".to_string(),
            category: "system".to_string(),
            code: 111,
        };
        assert_eq!(
            format_tracker_error(URL, &detail),
            "Connection refused - retrying (tracker.example.org; System 111)"
        );

        let bare = TrackerErrorDetail {
            detail: String::new(),
            ..detail
        };
        assert_eq!(
            format_tracker_error("not a url", &bare),
            "Connection refused (not a url; System 111)"
        );
    }
}
