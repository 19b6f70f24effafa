//! The node's state machine.
//!
//! [`OverlayNode`] owns the directory, subscriptions, tracker slots and
//! signalling attempts of one node. It is driven one event at a time by the
//! task behind [`NetworkNode`](super::NetworkNode) and never awaits.
//! Propagation and signalling live in sibling modules as further `impl`
//! blocks.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use strand_protocol::{
    decode, PartitionStatus, PeerId, PeerInfo, PeerRole, ResendRequest, Status, StreamMessage,
    StreamPartition,
};
use strand_storage::{MemoryStore, MessageStore};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::config::NodeConfig;
use super::resend::{serve, PendingResend, ResendEvent, ResendWaiter};
use super::signalling::Signalling;
use super::subscription::{Subscription, SubscriptionState};
use crate::connection::{ConnectionEvent, ConnectionHandle};
use crate::directory::{PeerDirectory, Registration};
use crate::endpoint::Connector;
use crate::metrics::NodeMetrics;
use crate::protocol::node_to_node::{self, NodeToNode, NodeToNodeEvent};
use crate::protocol::tracker_node::{self, TrackerNode, TrackerNodeEvent};
use crate::retry::{Backoff, RetryPolicy};
use crate::Result;

/// Maps a partition to one of `trackers` trackers.
///
/// Every node uses the same FNV-1a hash of the partition key, so all nodes
/// interested in a partition report to the same tracker.
#[must_use]
pub fn tracker_index(sp: &StreamPartition, trackers: usize) -> usize {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    let hash = sp
        .key()
        .bytes()
        .fold(OFFSET, |hash, byte| (hash ^ u64::from(byte)).wrapping_mul(PRIME));
    let trackers = u64::try_from(trackers.max(1)).unwrap_or(1);
    usize::try_from(hash % trackers).unwrap_or(0)
}

/// A configured tracker.
#[derive(Debug)]
pub(super) struct TrackerSlot {
    pub(super) url: String,
    pub(super) peer_id: Option<PeerId>,
    pub(super) connecting: bool,
    pub(super) backoff: Backoff,
}

/// Point-in-time copy of one subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionSnapshot {
    /// Lifecycle state.
    pub state: SubscriptionState,
    /// Live neighbors.
    pub neighbors: Vec<PeerId>,
    /// Neighbors the tracker asked for.
    pub targets: Vec<PeerId>,
    /// Counter of the last applied instruction.
    pub counter: u64,
}

/// Point-in-time copy of a node's state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSnapshot {
    /// The node.
    pub peer_id: PeerId,
    /// Connected trackers.
    pub trackers: Vec<PeerId>,
    /// Every connected peer that is not a tracker.
    pub connections: Vec<PeerId>,
    /// Subscriptions by partition.
    pub subscriptions: BTreeMap<StreamPartition, SubscriptionSnapshot>,
}

/// Overlay node state machine.
pub struct OverlayNode {
    pub(super) config: NodeConfig,
    pub(super) advertised: Vec<String>,
    pub(super) connector: Arc<dyn Connector>,
    pub(super) directory: PeerDirectory,
    pub(super) subscriptions: BTreeMap<StreamPartition, Subscription>,
    pub(super) trackers: Vec<TrackerSlot>,
    pub(super) signalling: Signalling,
    pub(super) store: Option<Arc<dyn MessageStore>>,
    pub(super) buffer: Arc<MemoryStore>,
    pub(super) pending_resends: HashMap<String, PendingResend>,
    pub(super) listeners: Vec<mpsc::UnboundedSender<StreamMessage>>,
    pub(super) retry_policy: RetryPolicy,
    pub(super) started: i64,
    pub(super) metrics: NodeMetrics,
}

impl fmt::Debug for OverlayNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OverlayNode")
            .field("peer", &self.config.peer_info)
            .field("advertised", &self.advertised)
            .field("peers", &self.directory.len())
            .field("subscriptions", &self.subscriptions.len())
            .finish_non_exhaustive()
    }
}

impl OverlayNode {
    /// Creates a node.
    ///
    /// `advertised` are the URLs handed to peers in signalling offers;
    /// `connector` dials trackers and peers.
    #[must_use]
    pub fn new(
        config: NodeConfig,
        advertised: Vec<String>,
        connector: Arc<dyn Connector>,
        store: Option<Arc<dyn MessageStore>>,
        metrics: NodeMetrics,
    ) -> Self {
        let trackers = config
            .trackers
            .iter()
            .map(|url| TrackerSlot {
                url: url.clone(),
                peer_id: None,
                connecting: false,
                backoff: Backoff::default(),
            })
            .collect();
        let started = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX));
        Self {
            directory: PeerDirectory::new(config.peer_info.peer_id.clone()),
            retry_policy: RetryPolicy::new(
                config.retry_interval,
                config.retry_interval.saturating_mul(15),
            ),
            buffer: Arc::new(MemoryStore::with_capacity(config.buffer_size)),
            config,
            advertised,
            connector,
            subscriptions: BTreeMap::new(),
            trackers,
            signalling: Signalling::default(),
            store,
            pending_resends: HashMap::new(),
            listeners: Vec::new(),
            started,
            metrics,
        }
    }

    /// Returns the node's id.
    #[must_use]
    pub fn peer_id(&self) -> &PeerId {
        &self.config.peer_info.peer_id
    }

    /// Returns the node's identity.
    #[must_use]
    pub fn peer_info(&self) -> &PeerInfo {
        &self.config.peer_info
    }

    /// Dials every configured tracker.
    pub fn start(&mut self) {
        for slot in &mut self.trackers {
            slot.connecting = true;
            self.connector.connect(slot.url.clone());
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
            } => self.on_connected(peer, address, outbound, handle),
            ConnectionEvent::Disconnected {
                peer_id,
                connection_id,
            } => {
                if self
                    .directory
                    .remove_connection(&peer_id, connection_id)
                    .is_some()
                {
                    self.on_peer_gone(&peer_id);
                }
            }
            ConnectionEvent::MessageReceived { peer_id, text } => self.on_text(&peer_id, &text),
            ConnectionEvent::ConnectFailed { address, reason } => {
                self.on_connect_failed(&address, &reason);
            }
        }
    }

    fn on_connected(
        &mut self,
        peer: PeerInfo,
        address: String,
        outbound: bool,
        handle: ConnectionHandle,
    ) {
        if peer.is_tracker() {
            let Some(slot) = self.trackers.iter_mut().find(|slot| slot.url == address) else {
                warn!(peer = %peer, address = %address, "Unexpected tracker connection");
                handle.close();
                return;
            };
            slot.peer_id = Some(peer.peer_id.clone());
            slot.connecting = false;
            slot.backoff.succeeded();
            info!(tracker = %peer.peer_id, url = %address, "Connected to tracker");
            self.directory.register(peer, address, outbound, handle);
            self.report_status();
            return;
        }

        let peer_id = peer.peer_id.clone();
        if self.directory.register(peer, address, outbound, handle) == Registration::Duplicate {
            return;
        }
        self.signalling.connected(&peer_id);

        let mut subscribe_to = Vec::new();
        for (sp, sub) in &mut self.subscriptions {
            if sub.targets.contains(&peer_id) && sub.add_neighbor(peer_id.clone()) {
                subscribe_to.push(sp.clone());
            }
        }
        let protocol = NodeToNode::new(&self.directory);
        for sp in &subscribe_to {
            if let Err(e) = protocol.send_subscribe(&peer_id, sp) {
                debug!(peer_id = %peer_id, partition = %sp, error = %e, "Subscribe not sent");
            }
        }
        for sp in &subscribe_to {
            self.update_gauge(sp);
        }
    }

    /// Drops a peer whose connection is gone from every partition.
    fn on_peer_gone(&mut self, peer: &PeerId) {
        if let Some(slot) = self
            .trackers
            .iter_mut()
            .find(|slot| slot.peer_id.as_ref() == Some(peer))
        {
            warn!(tracker = %peer, url = %slot.url, "Lost tracker connection");
            slot.peer_id = None;
            slot.backoff.failed(&self.retry_policy);
            return;
        }

        let mut affected = Vec::new();
        for (sp, sub) in &mut self.subscriptions {
            if sub.remove_neighbor(peer) {
                affected.push(sp.clone());
            }
        }
        self.signalling.cancel(peer);

        let orphaned: Vec<String> = self
            .pending_resends
            .iter()
            .filter(|(_, pending)| &pending.peer == peer)
            .map(|(sub_id, _)| sub_id.clone())
            .collect();
        for sub_id in orphaned {
            if let Some(pending) = self.pending_resends.remove(&sub_id) {
                pending.notify(ResendEvent::Failed(format!("{peer} disconnected")));
            }
        }

        debug!(peer_id = %peer, partitions = affected.len(), "Peer gone");
        if !affected.is_empty() {
            for sp in &affected {
                self.update_gauge(sp);
            }
            self.report_status();
        }
    }

    fn on_connect_failed(&mut self, address: &str, reason: &str) {
        if let Some(slot) = self.trackers.iter_mut().find(|slot| slot.url == address) {
            slot.connecting = false;
            slot.backoff.failed(&self.retry_policy);
            warn!(
                url = %address,
                reason = %reason,
                failures = slot.backoff.failures(),
                "Tracker unreachable"
            );
            return;
        }
        self.on_dial_failed(address, reason);
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

        if self.directory.is_role(source, PeerRole::Tracker) {
            match tracker_node::classify(source, message) {
                Some(TrackerNodeEvent::Instruction {
                    tracker,
                    instruction,
                }) => self.on_instruction(&tracker, instruction),
                Some(TrackerNodeEvent::Relay { tracker, relay }) => self.on_relay(&tracker, relay),
                Some(TrackerNodeEvent::Error { error, .. }) => self.on_relay_error(&error),
                None => warn!(tracker = %source, message_type = %message_type, "Unexpected message"),
            }
            return;
        }

        match node_to_node::classify(source, message) {
            Some(NodeToNodeEvent::Data { source, message }) => self.on_data(Some(&source), message),
            Some(NodeToNodeEvent::Unicast { source, unicast }) => self.on_unicast(&source, unicast),
            Some(NodeToNodeEvent::Subscribe {
                source,
                stream_partition,
            }) => self.on_subscribe_request(&source, &stream_partition),
            Some(NodeToNodeEvent::Unsubscribe {
                source,
                stream_partition,
            }) => self.on_unsubscribe_request(&source, &stream_partition),
            Some(NodeToNodeEvent::ResendRequest { source, request }) => {
                self.serve_resend(&source, request);
            }
            Some(NodeToNodeEvent::Resending { source, response }) => {
                self.on_resend_response(&source, &response.sub_id, ResendEvent::Resending);
            }
            Some(NodeToNodeEvent::Resent { source, response }) => {
                self.on_resend_response(&source, &response.sub_id, ResendEvent::Resent);
            }
            Some(NodeToNodeEvent::NoResend { source, response }) => {
                self.on_resend_response(&source, &response.sub_id, ResendEvent::NoResend);
            }
            Some(NodeToNodeEvent::ResendFailed { source, response }) => {
                let reason = format!("{}: {}", response.error_code, response.message);
                self.on_resend_response(&source, &response.sub_id, ResendEvent::Failed(reason));
            }
            None => warn!(peer_id = %source, message_type = %message_type, "Unexpected message"),
        }
    }

    fn on_instruction(
        &mut self,
        tracker: &PeerId,
        instruction: strand_protocol::InstructionMessage,
    ) {
        let sp = instruction.stream_partition;
        let local = self.config.peer_info.peer_id.clone();
        let max_neighbors = self.config.max_neighbors_per_node;
        let Some(sub) = self.subscriptions.get_mut(&sp) else {
            debug!(partition = %sp, "Instruction for a partition not subscribed");
            return;
        };
        if instruction.counter <= sub.counter {
            debug!(
                partition = %sp,
                counter = instruction.counter,
                applied = sub.counter,
                "Ignoring stale instruction"
            );
            return;
        }
        sub.counter = instruction.counter;

        let targets: std::collections::BTreeSet<PeerId> = instruction
            .neighbors
            .into_iter()
            .filter(|peer| *peer != local)
            .take(max_neighbors)
            .collect();
        let removed: Vec<PeerId> = sub.neighbors.difference(&targets).cloned().collect();
        for peer in &removed {
            sub.remove_neighbor(peer);
        }
        if targets.is_empty() {
            sub.state = SubscriptionState::Subscribed;
        }

        let mut subscribe_to = Vec::new();
        let mut missing = Vec::new();
        for target in &targets {
            if self.directory.contains(target) {
                if sub.add_neighbor(target.clone()) {
                    subscribe_to.push(target.clone());
                }
            } else {
                missing.push(target.clone());
            }
        }
        info!(
            partition = %sp,
            counter = sub.counter,
            targets = ?targets,
            connected = sub.neighbors.len(),
            "Applying instruction"
        );
        sub.targets = targets;

        let protocol = NodeToNode::new(&self.directory);
        for peer in &removed {
            if let Err(e) = protocol.send_unsubscribe(peer, &sp) {
                debug!(peer_id = %peer, error = %e, "Unsubscribe not sent");
            }
        }
        for peer in &subscribe_to {
            if let Err(e) = protocol.send_subscribe(peer, &sp) {
                debug!(peer_id = %peer, error = %e, "Subscribe not sent");
            }
        }
        for peer in &missing {
            self.initiate(peer, tracker);
        }
        for peer in &removed {
            self.disconnect_if_unused(peer);
        }
        self.update_gauge(&sp);
    }

    fn on_subscribe_request(&mut self, source: &PeerId, sp: &StreamPartition) {
        let max_neighbors = self.config.max_neighbors_per_node;
        let protocol = NodeToNode::new(&self.directory);
        let accepted = match self.subscriptions.get_mut(sp) {
            Some(sub) if sub.neighbors.contains(source) => true,
            Some(sub) if sub.neighbors.len() < max_neighbors => {
                sub.add_neighbor(source.clone());
                debug!(peer_id = %source, partition = %sp, "Neighbor subscribed");
                if let Err(e) = protocol.send_subscribe(source, sp) {
                    debug!(peer_id = %source, error = %e, "Subscribe not sent");
                }
                true
            }
            Some(_) | None => false,
        };
        if accepted {
            self.update_gauge(sp);
        } else {
            debug!(peer_id = %source, partition = %sp, "Refusing neighbor");
            if let Err(e) = protocol.send_unsubscribe(source, sp) {
                debug!(peer_id = %source, error = %e, "Unsubscribe not sent");
            }
        }
    }

    fn on_unsubscribe_request(&mut self, source: &PeerId, sp: &StreamPartition) {
        if let Some(sub) = self.subscriptions.get_mut(sp) {
            sub.targets.remove(source);
            if sub.remove_neighbor(source) {
                debug!(peer_id = %source, partition = %sp, "Neighbor unsubscribed");
            }
        }
        self.update_gauge(sp);
        self.disconnect_if_unused(source);
    }

    fn serve_resend(&mut self, source: &PeerId, request: ResendRequest) {
        let Some(handle) = self.directory.handle(source).cloned() else {
            return;
        };
        self.metrics.resend_requests_served.inc();
        debug!(
            peer_id = %source,
            sub_id = request.sub_id(),
            mode = request.mode(),
            partition = %request.stream_partition(),
            "Serving resend"
        );
        let store = self.store.clone();
        let buffer = self.buffer.clone();
        tokio::spawn(async move {
            let sub_id = request.sub_id().to_string();
            let outcome = serve(request, handle, store, buffer).await;
            debug!(sub_id = %sub_id, outcome = ?outcome, "Resend served");
        });
    }

    fn on_resend_response(&mut self, source: &PeerId, sub_id: &str, event: ResendEvent) {
        let Some(pending) = self.pending_resends.get_mut(sub_id) else {
            debug!(peer_id = %source, sub_id, "Response for unknown resend");
            return;
        };
        if &pending.peer != source {
            warn!(peer_id = %source, sub_id, "Resend response from wrong peer");
            return;
        }
        let terminal = event.is_terminal();
        pending.last_activity = Instant::now();
        debug!(peer_id = %source, sub_id, event = ?event, "Resend progress");
        pending.notify(event);
        if terminal {
            self.pending_resends.remove(sub_id);
        }
    }

    fn on_unicast(&mut self, source: &PeerId, unicast: strand_protocol::UnicastMessage) {
        let Some(pending) = self.pending_resends.get_mut(&unicast.sub_id) else {
            debug!(peer_id = %source, sub_id = %unicast.sub_id, "Unicast for unknown resend");
            return;
        };
        if &pending.peer != source {
            warn!(peer_id = %source, sub_id = %unicast.sub_id, "Unicast from wrong peer");
            return;
        }
        pending.last_activity = Instant::now();
        if let ResendWaiter::Client(sender) = &pending.waiter {
            let _ = sender.send(ResendEvent::Message(unicast.stream_message));
            return;
        }
        self.on_gap_fill(unicast.stream_message);
    }

    /// Registers interest in a partition and reports it to the tracker.
    pub fn subscribe(&mut self, sp: StreamPartition) {
        if self.subscriptions.contains_key(&sp) {
            return;
        }
        info!(partition = %sp, "Subscribing");
        self.subscriptions.insert(
            sp.clone(),
            Subscription::new(
                self.config.seen_cache_size,
                self.config.seen_cache_ttl,
                self.config.max_tracked_publishers,
            ),
        );
        self.update_gauge(&sp);
        self.report_status();
    }

    /// Leaves a partition, telling its neighbors.
    pub fn unsubscribe(&mut self, sp: &StreamPartition) {
        let Some(sub) = self.subscriptions.remove(sp) else {
            return;
        };
        info!(partition = %sp, neighbors = sub.neighbors.len(), "Unsubscribing");
        let protocol = NodeToNode::new(&self.directory);
        for peer in &sub.neighbors {
            if let Err(e) = protocol.send_unsubscribe(peer, sp) {
                debug!(peer_id = %peer, error = %e, "Unsubscribe not sent");
            }
        }
        for peer in sub.neighbors.iter().chain(&sub.targets) {
            self.disconnect_if_unused(peer);
        }
        self.metrics.set_neighbors(&sp.key(), 0);
        self.report_status();
    }

    /// Publishes a message, subscribing to its partition first.
    pub fn publish(&mut self, message: StreamMessage) {
        self.subscribe(message.stream_partition.clone());
        self.on_data(None, message);
    }

    /// Returns a receiver for every message delivered from now on.
    pub fn add_listener(&mut self) -> mpsc::UnboundedReceiver<StreamMessage> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.listeners.push(sender);
        receiver
    }

    /// Asks `peer` for a resend; progress arrives on the returned receiver.
    ///
    /// # Errors
    ///
    /// Returns an error if the peer is not connected.
    pub fn request_resend(
        &mut self,
        peer: &PeerId,
        request: ResendRequest,
    ) -> Result<mpsc::UnboundedReceiver<ResendEvent>> {
        let sub_id = request.sub_id().to_string();
        NodeToNode::new(&self.directory).send_resend_request(peer, request)?;
        let (sender, receiver) = mpsc::unbounded_channel();
        self.pending_resends.insert(
            sub_id,
            PendingResend::new(peer.clone(), ResendWaiter::Client(sender)),
        );
        Ok(receiver)
    }

    /// Returns the live neighbors of a partition.
    #[must_use]
    pub fn neighbors(&self, sp: &StreamPartition) -> Vec<PeerId> {
        self.subscriptions
            .get(sp)
            .map(|sub| sub.neighbors.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Sends a status report to every connected tracker.
    ///
    /// Each tracker hears about the partitions that hash to it, and an
    /// empty report is still sent so it can drop stale state.
    pub fn report_status(&self) {
        let count = self.trackers.len();
        let rtts = self.directory.rtts();
        let protocol = TrackerNode::new(&self.directory);
        for (index, slot) in self.trackers.iter().enumerate() {
            let Some(tracker) = &slot.peer_id else {
                continue;
            };
            let partitions = self
                .subscriptions
                .iter()
                .filter(|(sp, _)| tracker_index(sp, count) == index)
                .map(|(sp, sub)| PartitionStatus {
                    stream_partition: sp.clone(),
                    neighbors: sub.neighbors.iter().cloned().collect(),
                    counter: sub.counter,
                })
                .collect();
            let status = Status {
                partitions,
                rtts: rtts.clone(),
                started: self.started,
            };
            if let Err(e) = protocol.send_status(tracker, status) {
                debug!(tracker = %tracker, error = %e, "Status not sent");
            }
        }
    }

    /// Reconnects trackers, retries missing neighbors, expires signalling
    /// attempts and closes connections nothing uses.
    pub fn retry_tick(&mut self) {
        let now = Instant::now();
        for slot in &mut self.trackers {
            if slot.peer_id.is_none() && !slot.connecting && slot.backoff.ready(now) {
                debug!(url = %slot.url, "Reconnecting to tracker");
                slot.connecting = true;
                self.connector.connect(slot.url.clone());
            }
        }

        for peer in self.signalling.expire(
            now,
            self.config.rtc_handshake_timeout,
            &self.retry_policy,
        ) {
            debug!(peer_id = %peer, "Signalling timed out");
        }
        self.expire_resends(now);

        let missing: Vec<(PeerId, StreamPartition)> = self
            .subscriptions
            .iter()
            .flat_map(|(sp, sub)| {
                sub.targets
                    .iter()
                    .filter(|target| !sub.neighbors.contains(*target))
                    .map(move |target| (target.clone(), sp.clone()))
            })
            .collect();
        for (peer, sp) in missing {
            if self.directory.contains(&peer) {
                let added = self
                    .subscriptions
                    .get_mut(&sp)
                    .is_some_and(|sub| sub.add_neighbor(peer.clone()));
                if added {
                    if let Err(e) = NodeToNode::new(&self.directory).send_subscribe(&peer, &sp) {
                        debug!(peer_id = %peer, error = %e, "Subscribe not sent");
                    }
                    self.update_gauge(&sp);
                }
            } else if let Some(tracker) = self.tracker_for(&sp) {
                self.initiate(&peer, &tracker);
            }
        }

        let storage_peers: Vec<PeerId> = self
            .config
            .storage_peers
            .iter()
            .filter(|peer| !self.directory.contains(peer))
            .cloned()
            .collect();
        if let Some(tracker) = self.any_tracker() {
            for peer in &storage_peers {
                self.initiate(peer, &tracker);
            }
        }

        self.close_unused(now);
    }

    /// Fails resends whose responder has been silent for too long.
    fn expire_resends(&mut self, now: Instant) {
        let timeout = self.config.resend_timeout;
        let expired: Vec<String> = self
            .pending_resends
            .iter()
            .filter(|(_, pending)| now.saturating_duration_since(pending.last_activity) > timeout)
            .map(|(sub_id, _)| sub_id.clone())
            .collect();
        for sub_id in expired {
            if let Some(pending) = self.pending_resends.remove(&sub_id) {
                warn!(peer_id = %pending.peer, sub_id = %sub_id, "Resend timed out");
                pending.notify(ResendEvent::Failed("timed out".into()));
                self.disconnect_if_unused(&pending.peer);
            }
        }
    }

    /// Returns the connected tracker responsible for a partition.
    pub(super) fn tracker_for(&self, sp: &StreamPartition) -> Option<PeerId> {
        let index = tracker_index(sp, self.trackers.len());
        self.trackers.get(index)?.peer_id.clone()
    }

    fn any_tracker(&self) -> Option<PeerId> {
        self.trackers.iter().find_map(|slot| slot.peer_id.clone())
    }

    /// Returns true if a connection to `peer` still serves a purpose.
    fn in_use(&self, peer: &PeerId) -> bool {
        self.directory.is_role(peer, PeerRole::Tracker)
            || self.config.storage_peers.contains(peer)
            || self.signalling.is_pending(peer)
            || self.subscriptions.values().any(|sub| sub.involves(peer))
            || self.pending_resends.values().any(|p| &p.peer == peer)
    }

    pub(super) fn disconnect_if_unused(&mut self, peer: &PeerId) {
        if self.in_use(peer) {
            return;
        }
        if let Some(entry) = self.directory.remove(peer) {
            debug!(peer_id = %peer, "Closing unused connection");
            entry.handle.close();
        }
    }

    fn close_unused(&mut self, now: Instant) {
        let grace = self.config.rtc_handshake_timeout;
        let idle: Vec<PeerId> = self
            .directory
            .all()
            .into_iter()
            .map(|info| info.peer_id)
            .filter(|peer| {
                self.directory
                    .get(peer)
                    .is_some_and(|entry| now.duration_since(entry.connected_at) > grace)
            })
            .filter(|peer| !self.in_use(peer))
            .collect();
        for peer in &idle {
            self.disconnect_if_unused(peer);
        }
    }

    pub(super) fn update_gauge(&self, sp: &StreamPartition) {
        let count = self.subscriptions.get(sp).map_or(0, |sub| sub.neighbors.len());
        self.metrics.set_neighbors(&sp.key(), count);
    }

    /// Returns the current state.
    #[must_use]
    pub fn snapshot(&self) -> NodeSnapshot {
        let trackers = self
            .trackers
            .iter()
            .filter_map(|slot| slot.peer_id.clone())
            .collect();
        let mut connections: Vec<PeerId> = self
            .directory
            .all()
            .into_iter()
            .filter(PeerInfo::is_node)
            .map(|info| info.peer_id)
            .collect();
        connections.sort();
        let subscriptions = self
            .subscriptions
            .iter()
            .map(|(sp, sub)| {
                (
                    sp.clone(),
                    SubscriptionSnapshot {
                        state: sub.state,
                        neighbors: sub.neighbors.iter().cloned().collect(),
                        targets: sub.targets.iter().cloned().collect(),
                        counter: sub.counter,
                    },
                )
            })
            .collect();
        NodeSnapshot {
            peer_id: self.peer_id().clone(),
            trackers,
            connections,
            subscriptions,
        }
    }

    /// Fails outstanding resends and closes every connection.
    pub fn shutdown(&mut self) {
        for (_, pending) in self.pending_resends.drain() {
            pending.notify(ResendEvent::Failed("node stopped".into()));
        }
        debug!(peers = self.directory.len(), "Closing connections");
        self.directory.clear();
    }
}
