//! The tracker's state machine.
//!
//! [`Coordinator`] owns the tracker's peer directory and per-partition
//! topology views. It is driven one [`ConnectionEvent`] at a time and never
//! awaits; sends are queued on connection handles.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Instant;

use strand_protocol::{decode, PeerId, PeerRole, RelayMessage, Status, StreamPartition};
use tracing::{debug, info, warn};

use super::config::TrackerConfig;
use super::topology::OverlayTopology;
use crate::connection::ConnectionEvent;
use crate::directory::{PeerDirectory, Registration};
use crate::metrics::TrackerMetrics;
use crate::protocol::tracker_server::{classify, TrackerServer, TrackerServerEvent};

/// What a node last reported for one partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeView {
    /// Reported neighbors.
    pub neighbors: Vec<PeerId>,
    /// Counter of the last instruction the node applied.
    pub counter: u64,
    /// When the report arrived.
    pub updated_at: Instant,
}

/// Last instruction sent to a node for a partition.
#[derive(Debug, Clone, Default)]
struct Assignment {
    counter: u64,
    neighbors: Option<Vec<PeerId>>,
}

/// Point-in-time copy of a tracker's state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackerSnapshot {
    /// Connected nodes.
    pub nodes: Vec<PeerId>,
    /// Assigned neighbors per partition and node.
    pub topology: BTreeMap<StreamPartition, BTreeMap<PeerId, Vec<PeerId>>>,
    /// Reported neighbors per partition and node.
    pub reported: BTreeMap<StreamPartition, BTreeMap<PeerId, Vec<PeerId>>>,
}

impl TrackerSnapshot {
    /// Returns true if `peer` appears anywhere in the partition views.
    #[must_use]
    pub fn mentions(&self, peer: &PeerId) -> bool {
        let in_views = |views: &BTreeMap<StreamPartition, BTreeMap<PeerId, Vec<PeerId>>>| {
            views
                .values()
                .any(|nodes| nodes.contains_key(peer) || nodes.values().any(|n| n.contains(peer)))
        };
        in_views(&self.topology) || in_views(&self.reported)
    }
}

/// Topology coordinator.
#[derive(Debug)]
pub struct Coordinator {
    config: TrackerConfig,
    directory: PeerDirectory,
    topologies: HashMap<StreamPartition, OverlayTopology>,
    views: HashMap<StreamPartition, HashMap<PeerId, NodeView>>,
    rtts: HashMap<PeerId, BTreeMap<PeerId, u64>>,
    instructed: HashMap<(PeerId, StreamPartition), Assignment>,
    metrics: TrackerMetrics,
}

impl Coordinator {
    /// Creates a coordinator with no connected nodes.
    #[must_use]
    pub fn new(config: TrackerConfig, metrics: TrackerMetrics) -> Self {
        Self {
            directory: PeerDirectory::new(config.peer_id.clone()),
            config,
            topologies: HashMap::new(),
            views: HashMap::new(),
            rtts: HashMap::new(),
            instructed: HashMap::new(),
            metrics,
        }
    }

    /// Applies one transport event.
    pub fn handle_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Connected {
                peer,
                address,
                outbound,
                handle,
            } => {
                if peer.role == PeerRole::Tracker {
                    warn!(peer = %peer, "Rejecting tracker connecting as a node");
                    handle.close();
                    return;
                }
                let registration = self.directory.register(peer.clone(), address, outbound, handle);
                if registration != Registration::Duplicate {
                    info!(tracker = %self.config.name, peer = %peer, "Node connected");
                }
                self.update_node_gauge();
            }
            ConnectionEvent::Disconnected {
                peer_id,
                connection_id,
            } => {
                if self
                    .directory
                    .remove_connection(&peer_id, connection_id)
                    .is_some()
                {
                    info!(tracker = %self.config.name, peer_id = %peer_id, "Node disconnected");
                    self.on_disconnect(&peer_id);
                }
            }
            ConnectionEvent::MessageReceived { peer_id, text } => self.on_text(&peer_id, &text),
            ConnectionEvent::ConnectFailed { address, reason } => {
                debug!(address = %address, reason = %reason, "Ignoring failed dial");
            }
        }
    }

    fn on_text(&mut self, source: &PeerId, text: &str) {
        let message = match decode(text) {
            Ok(message) => message,
            Err(e) => {
                self.metrics.decode_errors.inc();
                warn!(peer_id = %source, error = %e, "Dropping undecodable message");
                return;
            }
        };
        let message_type = message.message_type();
        match classify(source, message) {
            Some(TrackerServerEvent::Status { source, status }) => self.on_status(&source, status),
            Some(TrackerServerEvent::Relay { source, relay }) => self.on_relay(&source, relay),
            None => warn!(peer_id = %source, message_type = %message_type, "Unexpected message"),
        }
    }

    /// Refreshes the views of every partition in `status` and rebalances.
    pub fn on_status(&mut self, source: &PeerId, status: Status) {
        debug!(
            peer_id = %source,
            partitions = status.partitions.len(),
            "Status received"
        );
        self.rtts.insert(source.clone(), status.rtts);

        let reported: BTreeSet<StreamPartition> = status
            .partitions
            .iter()
            .map(|p| p.stream_partition.clone())
            .collect();
        let mut affected: BTreeSet<StreamPartition> = self
            .views
            .iter()
            .filter(|(sp, view)| view.contains_key(source) && !reported.contains(*sp))
            .map(|(sp, _)| sp.clone())
            .collect();
        for sp in &affected {
            self.leave(source, sp);
        }

        let max_neighbors = self.config.max_neighbors_per_node;
        for partition in status.partitions {
            let sp = partition.stream_partition;
            let topology = self
                .topologies
                .entry(sp.clone())
                .or_insert_with(|| OverlayTopology::new(max_neighbors));
            let key = (source.clone(), sp.clone());
            if topology.add_node(source.clone()) {
                topology.seed(source, &partition.neighbors);
                self.instructed.insert(
                    key,
                    Assignment {
                        counter: partition.counter,
                        neighbors: None,
                    },
                );
            } else if let Some(assignment) = self.instructed.get_mut(&key) {
                // the node lost an instruction or restarted
                if partition.counter < assignment.counter {
                    assignment.neighbors = None;
                }
            }
            self.views.entry(sp.clone()).or_default().insert(
                source.clone(),
                NodeView {
                    neighbors: partition.neighbors,
                    counter: partition.counter,
                    updated_at: Instant::now(),
                },
            );
            affected.insert(sp);
        }

        for sp in &affected {
            self.rebalance(sp);
        }
    }

    /// Forwards a relay to its target, or answers with
    /// `RTC_UNKNOWN_PEER` when the target is not connected.
    pub fn on_relay(&mut self, source: &PeerId, relay: RelayMessage) {
        let server = TrackerServer::new(&self.directory);
        let target = relay.target.clone();
        let request_id = relay.request_id.clone();
        let sub_type = relay.sub_type;

        if self.directory.contains(&target) && server.forward_relay(relay).is_ok() {
            self.metrics.relays_forwarded.inc();
            debug!(from = %source, to = %target, sub_type = ?sub_type, "Relay forwarded");
            return;
        }

        self.metrics.relays_unknown_peer.inc();
        debug!(from = %source, to = %target, "Relay target unknown");
        if let Err(e) = server.send_unknown_peer_error(source, &request_id, &target) {
            warn!(peer_id = %source, error = %e, "Failed to send unknown peer error");
        }
    }

    fn on_disconnect(&mut self, peer: &PeerId) {
        self.rtts.remove(peer);
        let partitions: Vec<StreamPartition> = self
            .topologies
            .iter()
            .filter(|(_, topology)| topology.has_node(peer))
            .map(|(sp, _)| sp.clone())
            .collect();
        for sp in &partitions {
            self.leave(peer, sp);
            self.rebalance(sp);
        }
        self.update_node_gauge();
    }

    fn leave(&mut self, peer: &PeerId, sp: &StreamPartition) {
        self.instructed.remove(&(peer.clone(), sp.clone()));
        if let Some(view) = self.views.get_mut(sp) {
            view.remove(peer);
            if view.is_empty() {
                self.views.remove(sp);
            }
        }
        if let Some(topology) = self.topologies.get_mut(sp) {
            topology.remove_node(peer);
            if topology.is_empty() {
                self.topologies.remove(sp);
            }
        }
    }

    fn rebalance(&mut self, sp: &StreamPartition) {
        let Some(topology) = self.topologies.get_mut(sp) else {
            return;
        };
        let rtts = &self.rtts;
        topology.balance(|from, to| rtts.get(from)?.get(to).copied());

        let server = TrackerServer::new(&self.directory);
        for (node, neighbors) in topology.assignments() {
            let assignment = self
                .instructed
                .entry((node.clone(), sp.clone()))
                .or_default();
            if assignment.neighbors.as_ref() == Some(&neighbors) {
                continue;
            }
            assignment.counter += 1;
            match server.send_instruction(&node, sp, neighbors.clone(), assignment.counter) {
                Ok(()) => {
                    debug!(
                        node = %node,
                        partition = %sp,
                        counter = assignment.counter,
                        neighbors = ?neighbors,
                        "Instruction sent"
                    );
                    assignment.neighbors = Some(neighbors);
                    self.metrics.instructions_sent.inc();
                }
                Err(e) => warn!(node = %node, partition = %sp, error = %e, "Instruction not sent"),
            }
        }
    }

    fn update_node_gauge(&self) {
        let nodes = self.directory.all().iter().filter(|p| p.is_node()).count();
        self.metrics.nodes.set(i64::try_from(nodes).unwrap_or(i64::MAX));
    }

    /// Returns the current state.
    #[must_use]
    pub fn snapshot(&self) -> TrackerSnapshot {
        let mut nodes: Vec<PeerId> = self
            .directory
            .all()
            .into_iter()
            .filter(|p| p.is_node())
            .map(|p| p.peer_id)
            .collect();
        nodes.sort();
        TrackerSnapshot {
            nodes,
            topology: self
                .topologies
                .iter()
                .map(|(sp, topology)| (sp.clone(), topology.assignments()))
                .collect(),
            reported: self
                .views
                .iter()
                .map(|(sp, view)| {
                    let nodes = view
                        .iter()
                        .map(|(id, v)| (id.clone(), v.neighbors.clone()))
                        .collect();
                    (sp.clone(), nodes)
                })
                .collect(),
        }
    }

    /// Closes every connection.
    pub fn shutdown(&mut self) {
        self.directory.clear();
        self.update_node_gauge();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionHandle, Outbound};
    use pretty_assertions::assert_eq;
    use strand_protocol::{
        encode, ErrorCode, InstructionMessage, Message, PartitionStatus, PeerInfo, RtcSubType,
        StatusMessage,
    };
    use tokio::sync::mpsc::UnboundedReceiver;

    fn sp() -> StreamPartition {
        StreamPartition::new("stream", 0)
    }

    fn id(name: &str) -> PeerId {
        PeerId::new(name)
    }

    fn coordinator(k: usize) -> Coordinator {
        let config = TrackerConfig {
            peer_id: id("tracker"),
            max_neighbors_per_node: k,
            ..Default::default()
        };
        Coordinator::new(config, TrackerMetrics::new())
    }

    fn connect(tracker: &mut Coordinator, name: &str) -> (UnboundedReceiver<Outbound>, u64) {
        let (handle, rx) = ConnectionHandle::channel();
        let connection_id = handle.id();
        tracker.handle_event(ConnectionEvent::Connected {
            peer: PeerInfo::node(name),
            address: format!("ws://{name}"),
            outbound: false,
            handle,
        });
        (rx, connection_id)
    }

    fn send(tracker: &mut Coordinator, from: &str, message: &Message) {
        tracker.handle_event(ConnectionEvent::MessageReceived {
            peer_id: id(from),
            text: encode(message).unwrap(),
        });
    }

    fn report(tracker: &mut Coordinator, from: &str, neighbors: &[&str], counter: u64) {
        let status = Status {
            partitions: vec![PartitionStatus {
                stream_partition: sp(),
                neighbors: neighbors.iter().map(|n| id(n)).collect(),
                counter,
            }],
            ..Default::default()
        };
        send(
            tracker,
            from,
            &Message::Status(StatusMessage {
                request_id: "r".into(),
                status,
            }),
        );
    }

    fn received(rx: &mut UnboundedReceiver<Outbound>) -> Vec<Message> {
        let mut messages = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            if let Outbound::Text(text) = frame {
                messages.push(decode(&text).unwrap());
            }
        }
        messages
    }

    fn instructions(rx: &mut UnboundedReceiver<Outbound>) -> Vec<InstructionMessage> {
        received(rx)
            .into_iter()
            .filter_map(|m| match m {
                Message::Instruction(i) => Some(i),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn status_reports_produce_instructions() {
        let mut tracker = coordinator(4);
        let (mut a, _) = connect(&mut tracker, "a");
        let (mut b, _) = connect(&mut tracker, "b");
        let (mut c, _) = connect(&mut tracker, "c");

        report(&mut tracker, "a", &[], 0);
        report(&mut tracker, "b", &[], 0);
        report(&mut tracker, "c", &[], 0);

        let to_a = instructions(&mut a);
        let counters: Vec<u64> = to_a.iter().map(|i| i.counter).collect();
        assert_eq!(counters, vec![1, 2, 3]);
        assert_eq!(to_a[2].neighbors, vec![id("b"), id("c")]);

        let to_b = instructions(&mut b);
        assert_eq!(to_b.last().unwrap().neighbors, vec![id("a"), id("c")]);
        let to_c = instructions(&mut c);
        assert_eq!(to_c.len(), 1);
        assert_eq!(to_c[0].neighbors, vec![id("a"), id("b")]);
        assert_eq!(to_c[0].stream_partition, sp());
    }

    #[test]
    fn unchanged_assignment_is_not_resent() {
        let mut tracker = coordinator(4);
        let (mut a, _) = connect(&mut tracker, "a");
        let (_b, _) = connect(&mut tracker, "b");
        report(&mut tracker, "a", &[], 0);
        report(&mut tracker, "b", &[], 0);
        let last = instructions(&mut a).last().unwrap().counter;

        report(&mut tracker, "a", &["b"], last);
        assert!(instructions(&mut a).is_empty());
    }

    #[test]
    fn restarted_node_is_instructed_again() {
        let mut tracker = coordinator(4);
        let (mut a, _) = connect(&mut tracker, "a");
        let (_b, _) = connect(&mut tracker, "b");
        report(&mut tracker, "a", &[], 0);
        report(&mut tracker, "b", &[], 0);
        let last = instructions(&mut a).last().unwrap().clone();

        report(&mut tracker, "a", &[], 0);
        let again = instructions(&mut a);
        assert_eq!(again.len(), 1);
        assert!(again[0].counter > last.counter);
        assert_eq!(again[0].neighbors, last.neighbors);
    }

    #[test]
    fn relay_is_forwarded_verbatim() {
        let mut tracker = coordinator(4);
        let (_a, _) = connect(&mut tracker, "a");
        let (mut b, _) = connect(&mut tracker, "b");
        let relay = RelayMessage {
            request_id: "req-1".into(),
            sub_type: RtcSubType::RtcOffer,
            originator: PeerInfo::node("a"),
            target: id("b"),
            data: serde_json::json!({"description": "ws://a:1"}),
        };
        send(&mut tracker, "a", &Message::Relay(relay.clone()));
        assert_eq!(received(&mut b), vec![Message::Relay(relay)]);
    }

    #[test]
    fn relay_to_unknown_peer_yields_one_error() {
        let mut tracker = coordinator(4);
        let (mut a, _) = connect(&mut tracker, "a");
        let relay = RelayMessage {
            request_id: "req-9".into(),
            sub_type: RtcSubType::RtcConnect,
            originator: PeerInfo::node("a"),
            target: id("ghost"),
            data: serde_json::json!({}),
        };
        send(&mut tracker, "a", &Message::Relay(relay));

        let messages = received(&mut a);
        assert_eq!(messages.len(), 1);
        let Message::Error(error) = &messages[0] else {
            panic!("expected error, got {messages:?}");
        };
        assert_eq!(error.request_id, "req-9");
        assert_eq!(error.error_code, ErrorCode::RtcUnknownPeer);
        assert_eq!(error.target, id("ghost"));
        assert!(tracker.metrics.encode().contains("relays_unknown_peer_total 1"));
    }

    #[test]
    fn departure_purges_views_and_reassigns() {
        let mut tracker = coordinator(4);
        let (mut a, _) = connect(&mut tracker, "a");
        let (_b, _) = connect(&mut tracker, "b");
        let (_c, c_conn) = connect(&mut tracker, "c");
        report(&mut tracker, "a", &[], 0);
        report(&mut tracker, "b", &[], 0);
        report(&mut tracker, "c", &[], 0);
        received(&mut a);

        tracker.handle_event(ConnectionEvent::Disconnected {
            peer_id: id("c"),
            connection_id: c_conn,
        });

        let snapshot = tracker.snapshot();
        assert!(!snapshot.mentions(&id("c")));
        assert_eq!(snapshot.nodes, vec![id("a"), id("b")]);
        let to_a = instructions(&mut a);
        assert_eq!(to_a.len(), 1);
        assert_eq!(to_a[0].neighbors, vec![id("b")]);
    }

    #[test]
    fn stale_disconnect_is_ignored() {
        let mut tracker = coordinator(4);
        let (_old, old_conn) = connect(&mut tracker, "a");
        let (_new, _) = connect(&mut tracker, "a");
        report(&mut tracker, "a", &[], 0);

        tracker.handle_event(ConnectionEvent::Disconnected {
            peer_id: id("a"),
            connection_id: old_conn,
        });
        assert_eq!(tracker.snapshot().nodes, vec![id("a")]);
        assert!(tracker.snapshot().topology[&sp()].contains_key(&id("a")));
    }

    #[test]
    fn dropping_a_partition_from_status_leaves_it() {
        let mut tracker = coordinator(4);
        let (_a, _) = connect(&mut tracker, "a");
        report(&mut tracker, "a", &[], 0);
        assert!(tracker.snapshot().topology.contains_key(&sp()));

        send(
            &mut tracker,
            "a",
            &Message::Status(StatusMessage {
                request_id: "r".into(),
                status: Status::default(),
            }),
        );
        assert!(tracker.snapshot().topology.is_empty());
    }

    #[test]
    fn garbage_is_counted_and_dropped() {
        let mut tracker = coordinator(4);
        let (mut a, _) = connect(&mut tracker, "a");
        tracker.handle_event(ConnectionEvent::MessageReceived {
            peer_id: id("a"),
            text: "{not json".into(),
        });
        assert!(received(&mut a).is_empty());
        assert!(tracker.metrics.encode().contains("strand_decode_errors_total 1"));
    }
}
