//! Tracker side of the tracker <-> node protocol.

use strand_protocol::{
    new_request_id, ErrorCode, ErrorMessage, InstructionMessage, Message, PeerId, RelayMessage,
    Status, StreamPartition,
};

use crate::directory::PeerDirectory;
use crate::Result;

/// Messages a tracker handles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerServerEvent {
    /// A node reported its status.
    Status {
        /// The node.
        source: PeerId,
        /// The report.
        status: Status,
    },
    /// A node sent signalling for another node.
    Relay {
        /// The node.
        source: PeerId,
        /// The relay, unchanged.
        relay: RelayMessage,
    },
}

/// Classifies a message received by a tracker.
///
/// Returns `None` for anything a node should not send to a tracker.
#[must_use]
pub fn classify(source: &PeerId, message: Message) -> Option<TrackerServerEvent> {
    match message {
        Message::Status(m) => Some(TrackerServerEvent::Status {
            source: source.clone(),
            status: m.status,
        }),
        Message::Relay(relay) => Some(TrackerServerEvent::Relay {
            source: source.clone(),
            relay,
        }),
        _ => None,
    }
}

/// Sends tracker messages to connected nodes.
#[derive(Debug, Clone, Copy)]
pub struct TrackerServer<'a> {
    directory: &'a PeerDirectory,
}

impl<'a> TrackerServer<'a> {
    /// Wraps a directory.
    #[must_use]
    pub fn new(directory: &'a PeerDirectory) -> Self {
        Self { directory }
    }

    /// Sends a neighbor assignment.
    ///
    /// # Errors
    ///
    /// Returns an error if the node is not connected.
    pub fn send_instruction(
        &self,
        to: &PeerId,
        stream_partition: &StreamPartition,
        neighbors: Vec<PeerId>,
        counter: u64,
    ) -> Result<()> {
        self.directory.send(
            to,
            &Message::Instruction(InstructionMessage {
                request_id: new_request_id(),
                stream_partition: stream_partition.clone(),
                neighbors,
                counter,
            }),
        )
    }

    /// Forwards a relay to its target unchanged.
    ///
    /// # Errors
    ///
    /// Returns an error if the target is not connected.
    pub fn forward_relay(&self, relay: RelayMessage) -> Result<()> {
        let target = relay.target.clone();
        self.directory.send(&target, &Message::Relay(relay))
    }

    /// Tells `to` that `target` of request `request_id` is not connected.
    ///
    /// # Errors
    ///
    /// Returns an error if `to` is not connected.
    pub fn send_unknown_peer_error(
        &self,
        to: &PeerId,
        request_id: &str,
        target: &PeerId,
    ) -> Result<()> {
        self.directory.send(
            to,
            &Message::Error(ErrorMessage {
                request_id: request_id.to_string(),
                error_code: ErrorCode::RtcUnknownPeer,
                target: target.clone(),
            }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionHandle, Outbound};
    use strand_protocol::{decode, PeerInfo, RtcSubType, SubscribeRequest};

    #[test]
    fn classify_tracker_layer() {
        let relay = RelayMessage {
            request_id: "r".into(),
            sub_type: RtcSubType::RtcConnect,
            originator: PeerInfo::node("a"),
            target: PeerId::new("b"),
            data: serde_json::json!({}),
        };
        assert_eq!(
            classify(&PeerId::new("a"), Message::Relay(relay.clone())),
            Some(TrackerServerEvent::Relay {
                source: PeerId::new("a"),
                relay,
            })
        );
        let subscribe = Message::Subscribe(SubscribeRequest {
            request_id: "r".into(),
            stream_partition: StreamPartition::new("s", 0),
        });
        assert_eq!(classify(&PeerId::new("a"), subscribe), None);
    }

    #[test]
    fn unknown_peer_error_echoes_request_id() {
        let mut directory = PeerDirectory::new(PeerId::new("tracker"));
        let (handle, mut rx) = ConnectionHandle::channel();
        directory.register(PeerInfo::node("a"), "ws://a".into(), false, handle);

        TrackerServer::new(&directory)
            .send_unknown_peer_error(&PeerId::new("a"), "req-7", &PeerId::new("ghost"))
            .unwrap();
        let Outbound::Text(text) = rx.try_recv().unwrap() else {
            panic!("expected text");
        };
        assert_eq!(
            decode(&text).unwrap(),
            Message::Error(ErrorMessage {
                request_id: "req-7".into(),
                error_code: ErrorCode::RtcUnknownPeer,
                target: PeerId::new("ghost"),
            })
        );
    }
}
