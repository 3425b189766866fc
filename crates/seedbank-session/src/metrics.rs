//! Maps raw engine counter samples onto the published counter catalogue.

use seedbank_core::SessionCounter;
use tracing::warn;

use crate::engine::Engine;

/// Published counter name paired with the engine counter it reads.
pub type CounterMapping = (&'static str, &'static str);

/// Counters published by default.
pub const DEFAULT_COUNTERS: &[CounterMapping] = &[
    ("downloaded_bytes", "net.recv_bytes"),
    ("uploaded_bytes", "net.sent_bytes"),
    ("downloaded_payload_bytes", "net.recv_payload_bytes"),
    ("uploaded_payload_bytes", "net.sent_payload_bytes"),
    ("connected_peers", "peer.num_peers_connected"),
    ("dht_nodes", "dht.dht_nodes"),
    ("disk_queued_jobs", "disk.queued_disk_jobs"),
    ("checking_torrents", "ses.num_checking_torrents"),
];

/// Resolved catalogue; indexes are looked up once at construction.
#[derive(Debug, Clone, Default)]
pub struct SessionMetricsAggregator {
    resolved: Vec<(&'static str, usize)>,
}

impl SessionMetricsAggregator {
    /// Resolve `catalogue` against the engine's counter table. Names the engine does not know
    /// are dropped with a warning.
    #[must_use]
    pub fn new(engine: &dyn Engine, catalogue: &[CounterMapping]) -> Self {
        let resolved = catalogue
            .iter()
            .filter_map(|(published, engine_name)| {
                let index = engine.counter_index(engine_name);
                if index.is_none() {
                    warn!(
                        counter = *published,
                        engine_counter = *engine_name,
                        "engine does not expose counter; skipping"
                    );
                }
                index.map(|index| (*published, index))
            })
            .collect();
        Self { resolved }
    }

    /// Read the catalogue out of a raw sample. Indexes beyond the sample read as zero.
    #[must_use]
    pub fn publish(&self, counters: &[i64]) -> Vec<SessionCounter> {
        self.resolved
            .iter()
            .map(|(name, index)| SessionCounter {
                name: (*name).to_string(),
                value: counters.get(*index).copied().unwrap_or_default(),
            })
            .collect()
    }

    #[must_use]
    /// Number of published counters.
    pub fn len(&self) -> usize {
        self.resolved.len()
    }

    #[must_use]
    /// Whether no counter resolved.
    pub fn is_empty(&self) -> bool {
        self.resolved.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::stub::StubEngine;

    #[test]
    fn unknown_engine_counters_are_dropped() {
        let engine = StubEngine::new();
        let aggregator = SessionMetricsAggregator::new(
            &engine,
            &[("peers", "peer.num_peers_connected"), ("ghost", "ses.ghost")],
        );
        assert_eq!(aggregator.len(), 1);
    }

    #[test]
    fn publish_reads_catalogue_in_order() {
        let engine = StubEngine::new();
        let aggregator = SessionMetricsAggregator::new(&engine, DEFAULT_COUNTERS);
        assert_eq!(aggregator.len(), DEFAULT_COUNTERS.len());

        let published = aggregator.publish(&[10, 20, 30]);
        assert_eq!(published[0].name, "downloaded_bytes");
        assert_eq!(published[0].value, 10);
        assert_eq!(published[1].value, 20);
        assert_eq!(published[5].value, 0);
    }
}
