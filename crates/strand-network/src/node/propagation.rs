//! Data propagation.
//!
//! An unseen message is delivered locally once and forwarded to every
//! neighbor of its partition except the one it came from. A message whose
//! `previous` reference points past the last one delivered for its
//! publisher triggers a range resend covering the gap.

use strand_protocol::{
    new_request_id, MessageId, MessageRef, PeerId, ResendRangeRequest, ResendRequest,
    StreamMessage, StreamPartition,
};
use strand_storage::MessageStore;
use tracing::{debug, warn};

use super::overlay::OverlayNode;
use super::resend::{PendingResend, ResendWaiter};
use crate::protocol::node_to_node::NodeToNode;

impl OverlayNode {
    /// Handles a data message from `source`, or published locally when
    /// `source` is `None`.
    pub(super) fn on_data(&mut self, source: Option<&PeerId>, message: StreamMessage) {
        if let Err(e) = message.validate() {
            self.metrics.messages_invalid.inc();
            warn!(peer_id = ?source, error = %e, "Dropping invalid message");
            return;
        }
        let sp = message.stream_partition.clone();
        let Some(sub) = self.subscriptions.get_mut(&sp) else {
            debug!(peer_id = ?source, partition = %sp, "Data for a partition not subscribed");
            return;
        };
        if !sub.seen.insert(message.message_id()) {
            self.metrics.messages_duplicate.inc();
            return;
        }
        self.metrics.messages_received.inc();

        let publisher = message.publisher_id.clone();
        let gap = match (message.previous, sub.last_delivered(&publisher)) {
            (Some(previous), Some(last)) if previous > last => {
                let previous_id = MessageId {
                    stream_partition: sp.clone(),
                    publisher_id: publisher.clone(),
                    message_ref: previous,
                };
                (!sub.seen.contains(&previous_id)).then_some((last, previous))
            }
            _ => None,
        };
        sub.delivered(&publisher, message.message_ref());
        let neighbors: Vec<PeerId> = sub
            .neighbors
            .iter()
            .filter(|peer| Some(*peer) != source)
            .cloned()
            .collect();

        self.deliver(&message);

        let protocol = NodeToNode::new(&self.directory);
        for peer in &neighbors {
            match protocol.send_data(peer, &message) {
                Ok(()) => {
                    self.metrics.messages_forwarded.inc();
                }
                Err(e) => debug!(peer_id = %peer, error = %e, "Forward failed"),
            }
        }

        if let Some((last, previous)) = gap {
            self.request_gap_fill(source, &sp, publisher, last, previous);
        }
    }

    /// Delivers a message obtained by a gap fill. It is not forwarded.
    pub(super) fn on_gap_fill(&mut self, message: StreamMessage) {
        if message.validate().is_err() {
            self.metrics.messages_invalid.inc();
            return;
        }
        let Some(sub) = self.subscriptions.get_mut(&message.stream_partition) else {
            return;
        };
        if !sub.seen.insert(message.message_id()) {
            self.metrics.messages_duplicate.inc();
            return;
        }
        self.metrics.messages_received.inc();
        sub.delivered(&message.publisher_id, message.message_ref());
        self.deliver(&message);
    }

    fn deliver(&mut self, message: &StreamMessage) {
        self.listeners
            .retain(|listener| listener.send(message.clone()).is_ok());
        self.buffer.insert(message.clone());
        if let Some(store) = &self.store {
            let store = store.clone();
            let message = message.clone();
            tokio::spawn(async move {
                let id = message.message_id();
                if let Err(e) = store.store(message).await {
                    warn!(message_id = %id, error = %e, "Failed to store message");
                }
            });
        }
    }

    /// Asks the peer that revealed a gap for the missing range. Locally
    /// published messages, or a source that is gone, fall back to a
    /// storage peer.
    fn request_gap_fill(
        &mut self,
        source: Option<&PeerId>,
        sp: &StreamPartition,
        publisher: String,
        last: MessageRef,
        previous: MessageRef,
    ) {
        let peer = if let Some(source) = source.filter(|peer| self.directory.contains(peer)) {
            Some(source.clone())
        } else {
            self.config
                .storage_peers
                .iter()
                .find(|peer| self.directory.contains(peer))
                .cloned()
        };
        let Some(peer) = peer else {
            debug!(partition = %sp, publisher = %publisher, "No peer to fill gap from");
            return;
        };

        let request = ResendRequest::Range(ResendRangeRequest {
            request_id: new_request_id(),
            sub_id: new_request_id(),
            stream_partition: sp.clone(),
            from_timestamp: last.timestamp,
            to_timestamp: previous.timestamp,
            publisher_id: Some(publisher),
        });
        let sub_id = request.sub_id().to_string();
        debug!(
            peer_id = %peer,
            partition = %sp,
            from = %last,
            to = %previous,
            "Requesting gap fill"
        );
        match NodeToNode::new(&self.directory).send_resend_request(&peer, request) {
            Ok(()) => {
                self.pending_resends.insert(
                    sub_id,
                    PendingResend::new(peer, ResendWaiter::GapFill),
                );
            }
            Err(e) => debug!(peer_id = %peer, error = %e, "Gap fill request not sent"),
        }
    }
}
