//! Prometheus metrics for nodes and trackers.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

/// Labels for per-partition metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct PartitionLabels {
    /// The `stream::partition` key.
    pub partition: String,
}

fn encode_registry(registry: &RwLock<Registry>) -> String {
    let mut out = String::new();
    if encode(&mut out, &registry.read()).is_err() {
        out.clear();
    }
    out
}

/// Metrics of an overlay node.
#[derive(Clone)]
pub struct NodeMetrics {
    /// Prometheus registry.
    pub registry: Arc<RwLock<Registry>>,
    /// Unseen data messages accepted.
    pub messages_received: Counter,
    /// Data messages sent to neighbors.
    pub messages_forwarded: Counter,
    /// Data messages dropped as already seen.
    pub messages_duplicate: Counter,
    /// Data messages rejected by validation.
    pub messages_invalid: Counter,
    /// Resend requests answered.
    pub resend_requests_served: Counter,
    /// Neighbors per partition.
    pub neighbors: Family<PartitionLabels, Gauge>,
    /// Envelopes that failed to decode.
    pub decode_errors: Counter,
}

impl fmt::Debug for NodeMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeMetrics").finish_non_exhaustive()
    }
}

impl Default for NodeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeMetrics {
    /// Creates node metrics with all metrics registered.
    #[must_use]
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let messages_received = Counter::default();
        registry.register(
            "strand_messages_received",
            "Unseen data messages accepted",
            messages_received.clone(),
        );

        let messages_forwarded = Counter::default();
        registry.register(
            "strand_messages_forwarded",
            "Data messages sent to neighbors",
            messages_forwarded.clone(),
        );

        let messages_duplicate = Counter::default();
        registry.register(
            "strand_messages_duplicate",
            "Data messages dropped as already seen",
            messages_duplicate.clone(),
        );

        let messages_invalid = Counter::default();
        registry.register(
            "strand_messages_invalid",
            "Data messages rejected by validation",
            messages_invalid.clone(),
        );

        let resend_requests_served = Counter::default();
        registry.register(
            "strand_resend_requests_served",
            "Resend requests answered",
            resend_requests_served.clone(),
        );

        let neighbors = Family::<PartitionLabels, Gauge>::default();
        registry.register(
            "strand_neighbors",
            "Connected neighbors per partition",
            neighbors.clone(),
        );

        let decode_errors = Counter::default();
        registry.register(
            "strand_decode_errors",
            "Envelopes that failed to decode",
            decode_errors.clone(),
        );

        Self {
            registry: Arc::new(RwLock::new(registry)),
            messages_received,
            messages_forwarded,
            messages_duplicate,
            messages_invalid,
            resend_requests_served,
            neighbors,
            decode_errors,
        }
    }

    /// Sets the neighbor gauge of a partition.
    pub fn set_neighbors(&self, partition: &str, count: usize) {
        self.neighbors
            .get_or_create(&PartitionLabels {
                partition: partition.to_string(),
            })
            .set(i64::try_from(count).unwrap_or(i64::MAX));
    }

    /// Encodes all metrics in the Prometheus text format.
    #[must_use]
    pub fn encode(&self) -> String {
        encode_registry(&self.registry)
    }
}

/// Metrics of a tracker.
#[derive(Clone)]
pub struct TrackerMetrics {
    /// Prometheus registry.
    pub registry: Arc<RwLock<Registry>>,
    /// Connected nodes.
    pub nodes: Gauge,
    /// Instructions sent.
    pub instructions_sent: Counter,
    /// Relays forwarded to their target.
    pub relays_forwarded: Counter,
    /// Relays answered with an unknown peer error.
    pub relays_unknown_peer: Counter,
    /// Envelopes that failed to decode.
    pub decode_errors: Counter,
}

impl fmt::Debug for TrackerMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackerMetrics").finish_non_exhaustive()
    }
}

impl Default for TrackerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl TrackerMetrics {
    /// Creates tracker metrics with all metrics registered.
    #[must_use]
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let nodes = Gauge::default();
        registry.register("strand_tracker_nodes", "Connected nodes", nodes.clone());

        let instructions_sent = Counter::default();
        registry.register(
            "strand_tracker_instructions_sent",
            "Instructions sent",
            instructions_sent.clone(),
        );

        let relays_forwarded = Counter::default();
        registry.register(
            "strand_tracker_relays_forwarded",
            "Relays forwarded to their target",
            relays_forwarded.clone(),
        );

        let relays_unknown_peer = Counter::default();
        registry.register(
            "strand_tracker_relays_unknown_peer",
            "Relays whose target was not connected",
            relays_unknown_peer.clone(),
        );

        let decode_errors = Counter::default();
        registry.register(
            "strand_decode_errors",
            "Envelopes that failed to decode",
            decode_errors.clone(),
        );

        Self {
            registry: Arc::new(RwLock::new(registry)),
            nodes,
            instructions_sent,
            relays_forwarded,
            relays_unknown_peer,
            decode_errors,
        }
    }

    /// Encodes all metrics in the Prometheus text format.
    #[must_use]
    pub fn encode(&self) -> String {
        encode_registry(&self.registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_metrics_encode() {
        let metrics = NodeMetrics::new();
        metrics.messages_received.inc();
        metrics.set_neighbors("s::0", 3);
        let text = metrics.encode();
        assert!(text.contains("strand_messages_received_total 1"));
        assert!(text.contains("strand_neighbors{partition=\"s::0\"} 3"));
    }

    #[test]
    fn tracker_metrics_encode() {
        let metrics = TrackerMetrics::new();
        metrics.nodes.set(2);
        metrics.relays_unknown_peer.inc();
        let text = metrics.encode();
        assert!(text.contains("strand_tracker_nodes 2"));
        assert!(text.contains("strand_tracker_relays_unknown_peer_total 1"));
    }
}
