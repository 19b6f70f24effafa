//! Node <-> node protocol: data, subscriptions and resends.

use strand_protocol::{
    new_request_id, BroadcastMessage, ErrorResponse, Message, PeerId, ResendRequest,
    ResendResponse, StreamMessage, StreamPartition, SubscribeRequest, UnicastMessage,
    UnsubscribeRequest,
};

use crate::directory::PeerDirectory;
use crate::Result;

/// Node-layer events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeToNodeEvent {
    /// Live data.
    Data {
        /// Sending neighbor.
        source: PeerId,
        /// The data.
        message: StreamMessage,
    },
    /// Resent data.
    Unicast {
        /// Sending peer.
        source: PeerId,
        /// The data with its resend correlation key.
        unicast: UnicastMessage,
    },
    /// A neighbor subscribed.
    Subscribe {
        /// The neighbor.
        source: PeerId,
        /// The partition.
        stream_partition: StreamPartition,
    },
    /// A neighbor unsubscribed.
    Unsubscribe {
        /// The neighbor.
        source: PeerId,
        /// The partition.
        stream_partition: StreamPartition,
    },
    /// A peer asked for a resend.
    ResendRequest {
        /// The requester.
        source: PeerId,
        /// The request.
        request: ResendRequest,
    },
    /// A resend is starting.
    Resending {
        /// The responder.
        source: PeerId,
        /// The response.
        response: ResendResponse,
    },
    /// A resend finished.
    Resent {
        /// The responder.
        source: PeerId,
        /// The response.
        response: ResendResponse,
    },
    /// A resend found nothing.
    NoResend {
        /// The responder.
        source: PeerId,
        /// The response.
        response: ResendResponse,
    },
    /// A resend failed.
    ResendFailed {
        /// The responder.
        source: PeerId,
        /// The failure.
        response: ErrorResponse,
    },
}

/// Classifies a message received from a data-plane peer.
///
/// Returns `None` for tracker-layer messages.
#[must_use]
pub fn classify(source: &PeerId, message: Message) -> Option<NodeToNodeEvent> {
    let source = source.clone();
    Some(match message {
        Message::Broadcast(m) => NodeToNodeEvent::Data {
            source,
            message: m.stream_message,
        },
        Message::Unicast(unicast) => NodeToNodeEvent::Unicast { source, unicast },
        Message::Subscribe(m) => NodeToNodeEvent::Subscribe {
            source,
            stream_partition: m.stream_partition,
        },
        Message::Unsubscribe(m) => NodeToNodeEvent::Unsubscribe {
            source,
            stream_partition: m.stream_partition,
        },
        Message::ResendLast(r) => NodeToNodeEvent::ResendRequest {
            source,
            request: ResendRequest::Last(r),
        },
        Message::ResendFrom(r) => NodeToNodeEvent::ResendRequest {
            source,
            request: ResendRequest::From(r),
        },
        Message::ResendRange(r) => NodeToNodeEvent::ResendRequest {
            source,
            request: ResendRequest::Range(r),
        },
        Message::Resending(response) => NodeToNodeEvent::Resending { source, response },
        Message::Resent(response) => NodeToNodeEvent::Resent { source, response },
        Message::NoResend(response) => NodeToNodeEvent::NoResend { source, response },
        Message::ErrorResponse(response) => NodeToNodeEvent::ResendFailed { source, response },
        Message::Status(_) | Message::Instruction(_) | Message::Relay(_) | Message::Error(_) => {
            return None
        }
    })
}

/// Sends node-layer messages through a directory.
#[derive(Debug, Clone, Copy)]
pub struct NodeToNode<'a> {
    directory: &'a PeerDirectory,
}

impl<'a> NodeToNode<'a> {
    /// Wraps a directory.
    #[must_use]
    pub fn new(directory: &'a PeerDirectory) -> Self {
        Self { directory }
    }

    /// Propagates data to a neighbor.
    ///
    /// # Errors
    ///
    /// Returns an error if the neighbor is not connected.
    pub fn send_data(&self, to: &PeerId, message: &StreamMessage) -> Result<()> {
        self.directory.send(
            to,
            &Message::Broadcast(BroadcastMessage {
                request_id: new_request_id(),
                stream_message: message.clone(),
            }),
        )
    }

    /// Tells a neighbor this node subscribes to a partition.
    ///
    /// # Errors
    ///
    /// Returns an error if the neighbor is not connected.
    pub fn send_subscribe(&self, to: &PeerId, stream_partition: &StreamPartition) -> Result<()> {
        self.directory.send(
            to,
            &Message::Subscribe(SubscribeRequest {
                request_id: new_request_id(),
                stream_partition: stream_partition.clone(),
            }),
        )
    }

    /// Tells a neighbor this node no longer wants a partition.
    ///
    /// # Errors
    ///
    /// Returns an error if the neighbor is not connected.
    pub fn send_unsubscribe(&self, to: &PeerId, stream_partition: &StreamPartition) -> Result<()> {
        self.directory.send(
            to,
            &Message::Unsubscribe(UnsubscribeRequest {
                request_id: new_request_id(),
                stream_partition: stream_partition.clone(),
            }),
        )
    }

    /// Asks a peer for a resend.
    ///
    /// # Errors
    ///
    /// Returns an error if the peer is not connected.
    pub fn send_resend_request(&self, to: &PeerId, request: ResendRequest) -> Result<()> {
        self.directory.send(to, &Message::from(request))
    }
}

/// Builds the unicast frame for one resent message.
#[must_use]
pub fn unicast(request: &ResendRequest, message: StreamMessage) -> Message {
    Message::Unicast(UnicastMessage {
        request_id: request.request_id().to_string(),
        sub_id: request.sub_id().to_string(),
        stream_message: message,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionHandle, Outbound};
    use strand_protocol::{decode, MessageRef, PeerInfo, ResendLastRequest, StatusMessage};

    fn sp() -> StreamPartition {
        StreamPartition::new("s", 0)
    }

    #[test]
    fn classify_node_layer() {
        let source = PeerId::new("n1");
        let request = ResendLastRequest {
            request_id: "r".into(),
            sub_id: "sub".into(),
            stream_partition: sp(),
            number_last: 5,
        };
        assert_eq!(
            classify(&source, Message::ResendLast(request.clone())),
            Some(NodeToNodeEvent::ResendRequest {
                source: source.clone(),
                request: ResendRequest::Last(request),
            })
        );

        let data = StreamMessage::new(sp(), "p", MessageRef::new(1, 0), vec![]);
        assert_eq!(
            classify(
                &source,
                Message::Broadcast(BroadcastMessage {
                    request_id: "r".into(),
                    stream_message: data.clone(),
                })
            ),
            Some(NodeToNodeEvent::Data {
                source,
                message: data,
            })
        );
    }

    #[test]
    fn classify_rejects_tracker_layer() {
        let status = Message::Status(StatusMessage {
            request_id: "r".into(),
            status: Default::default(),
        });
        assert_eq!(classify(&PeerId::new("n1"), status), None);
    }

    #[test]
    fn sends_reach_the_neighbor() {
        let mut directory = PeerDirectory::new(PeerId::new("me"));
        let (handle, mut rx) = ConnectionHandle::channel();
        directory.register(PeerInfo::node("n1"), "ws://n1".into(), true, handle);

        let protocol = NodeToNode::new(&directory);
        protocol.send_subscribe(&PeerId::new("n1"), &sp()).unwrap();
        let Outbound::Text(text) = rx.try_recv().unwrap() else {
            panic!("expected text");
        };
        assert!(matches!(decode(&text).unwrap(), Message::Subscribe(s) if s.stream_partition == sp()));

        assert!(protocol.send_unsubscribe(&PeerId::new("nobody"), &sp()).is_err());
    }
}
