//! Prometheus-backed metrics registry fed from session batches.
//!
//! # Design
//! - Encapsulates collector registration to keep the public API small.
//! - Republishes the session counter catalogue and derived torrent counts as gauges.

use std::convert::TryFrom;
use std::sync::Arc;
use std::time::Duration;

use prometheus::{
    Encoder, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder,
    core::Collector,
};
use seedbank_core::{BatchTorrentUpdate, ListenEvent, TorrentPhase};
use serde::Serialize;

use crate::error::{Result, TelemetryError};

/// Prometheus-backed metrics registry shared by the session worker and its callers.
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    registry: Registry,
    session_counters: IntGaugeVec,
    torrents: IntGaugeVec,
    finished_torrents: IntGauge,
    torrent_events_total: IntCounterVec,
    listening: IntGauge,
    alert_cycle_ms: IntGauge,
}

/// Snapshot of selected gauges and counters for health reporting.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    /// Torrents in `loading`.
    pub loading_torrents: i64,
    /// Torrents in `active`.
    pub active_torrents: i64,
    /// Torrents in `paused`.
    pub paused_torrents: i64,
    /// Torrents in `error`.
    pub error_torrents: i64,
    /// Torrents with the finished flag.
    pub finished_torrents: i64,
    /// Whether any listen socket is bound.
    pub listening: bool,
    /// Resume-data payloads produced.
    pub resume_saved_total: u64,
    /// Resume-data requests that failed.
    pub resume_failed_total: u64,
}

fn build<T>(metric: &'static str, collector: prometheus::Result<T>) -> Result<T> {
    collector.map_err(|source| TelemetryError::Collector { metric, source })
}

fn register<C: Collector + Clone + 'static>(
    registry: &Registry,
    metric: &'static str,
    collector: &C,
) -> Result<()> {
    registry
        .register(Box::new(collector.clone()))
        .map_err(|source| TelemetryError::Collector { metric, source })
}

impl Metrics {
    /// Construct a new metrics registry with the standard collectors registered.
    ///
    /// # Errors
    ///
    /// Returns an error if any of the Prometheus collectors cannot be built or registered.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let session_counters = build(
            "session_counter",
            IntGaugeVec::new(
                Opts::new("session_counter", "Engine session counters by published name"),
                &["name"],
            ),
        )?;
        let torrents = build(
            "torrents",
            IntGaugeVec::new(
                Opts::new("torrents", "Registered torrents by lifecycle phase"),
                &["phase"],
            ),
        )?;
        let finished_torrents = build(
            "finished_torrents",
            IntGauge::with_opts(Opts::new(
                "finished_torrents",
                "Torrents that completed their download",
            )),
        )?;
        let torrent_events_total = build(
            "torrent_events_total",
            IntCounterVec::new(
                Opts::new("torrent_events_total", "Torrent events observed by kind"),
                &["kind"],
            ),
        )?;
        let listening = build(
            "listening",
            IntGauge::with_opts(Opts::new(
                "listening",
                "Whether the engine holds a bound listen socket",
            )),
        )?;
        let alert_cycle_ms = build(
            "alert_cycle_ms",
            IntGauge::with_opts(Opts::new(
                "alert_cycle_ms",
                "Duration of the latest alert processing cycle (ms)",
            )),
        )?;

        register(&registry, "session_counter", &session_counters)?;
        register(&registry, "torrents", &torrents)?;
        register(&registry, "finished_torrents", &finished_torrents)?;
        register(&registry, "torrent_events_total", &torrent_events_total)?;
        register(&registry, "listening", &listening)?;
        register(&registry, "alert_cycle_ms", &alert_cycle_ms)?;

        Ok(Self {
            inner: Arc::new(MetricsInner {
                registry,
                session_counters,
                torrents,
                finished_torrents,
                torrent_events_total,
                listening,
                alert_cycle_ms,
            }),
        })
    }

    /// Apply one alert-processing batch.
    pub fn observe_batch(&self, batch: &BatchTorrentUpdate) {
        let listen_failures = batch
            .listen_events
            .iter()
            .filter(|event| matches!(event, ListenEvent::Failed { .. }))
            .count();
        for (kind, count) in [
            ("added", batch.added.len()),
            ("removed", batch.removed.len()),
            ("resume_saved", batch.resume_data_saved.len()),
            ("resume_failed", batch.resume_data_failed.len()),
            ("add_failed", batch.add_failed.len()),
            ("listen_failed", listen_failures),
        ] {
            self.inc_event(kind, count);
        }

        if batch
            .listen_events
            .iter()
            .any(|event| matches!(event, ListenEvent::Succeeded { .. }))
        {
            self.inner.listening.set(1);
        }

        if let Some(counters) = &batch.session_stats {
            for counter in counters {
                self.inner
                    .session_counters
                    .with_label_values(&[counter.name.as_str()])
                    .set(counter.value);
            }
        }

        if let Some(counts) = &batch.torrent_counts {
            for phase in TorrentPhase::ALL {
                self.inner
                    .torrents
                    .with_label_values(&[phase.as_str()])
                    .set(saturating_i64(counts.for_phase(phase)));
            }
            self.inner
                .finished_torrents
                .set(saturating_i64(counts.finished));
        }
    }

    /// Record how long the latest alert cycle took.
    pub fn observe_alert_cycle(&self, duration: Duration) {
        self.inner
            .alert_cycle_ms
            .set(Self::duration_to_ms(duration));
    }

    /// Render the metrics registry using the Prometheus text exposition format.
    ///
    /// # Errors
    ///
    /// Returns an error if the metrics cannot be encoded or if the encoded
    /// buffer is not valid UTF-8.
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.inner.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|source| TelemetryError::Render { source })?;
        String::from_utf8(buffer).map_err(|source| TelemetryError::RenderUtf8 { source })
    }

    /// Take a point-in-time snapshot of the most relevant gauges and counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let phase = |phase: TorrentPhase| {
            self.inner
                .torrents
                .with_label_values(&[phase.as_str()])
                .get()
        };
        let events = |kind: &str| {
            self.inner
                .torrent_events_total
                .with_label_values(&[kind])
                .get()
        };
        MetricsSnapshot {
            loading_torrents: phase(TorrentPhase::Loading),
            active_torrents: phase(TorrentPhase::Active),
            paused_torrents: phase(TorrentPhase::Paused),
            error_torrents: phase(TorrentPhase::Error),
            finished_torrents: self.inner.finished_torrents.get(),
            listening: self.inner.listening.get() > 0,
            resume_saved_total: events("resume_saved"),
            resume_failed_total: events("resume_failed"),
        }
    }

    fn inc_event(&self, kind: &str, count: usize) {
        if count > 0 {
            self.inner
                .torrent_events_total
                .with_label_values(&[kind])
                .inc_by(u64::try_from(count).unwrap_or(u64::MAX));
        }
    }

    /// Convert a duration to milliseconds saturating at `i64::MAX`.
    pub(crate) fn duration_to_ms(duration: Duration) -> i64 {
        i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
    }
}

fn saturating_i64(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
