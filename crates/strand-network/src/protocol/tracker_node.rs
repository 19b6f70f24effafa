//! Node side of the tracker <-> node protocol.

use serde_json::Value;
use strand_protocol::{
    new_request_id, ErrorMessage, InstructionMessage, Message, PeerId, PeerInfo, RelayMessage,
    RtcSubType, Status, StatusMessage,
};

use crate::directory::PeerDirectory;
use crate::Result;

/// Tracker messages a node handles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerNodeEvent {
    /// A neighbor assignment.
    Instruction {
        /// The tracker.
        tracker: PeerId,
        /// The assignment.
        instruction: InstructionMessage,
    },
    /// Signalling from another node.
    Relay {
        /// The tracker that forwarded it.
        tracker: PeerId,
        /// The relay.
        relay: RelayMessage,
    },
    /// A relay could not be delivered.
    Error {
        /// The tracker.
        tracker: PeerId,
        /// The error.
        error: ErrorMessage,
    },
}

/// Classifies a message received from a tracker.
#[must_use]
pub fn classify(tracker: &PeerId, message: Message) -> Option<TrackerNodeEvent> {
    let tracker = tracker.clone();
    match message {
        Message::Instruction(instruction) => Some(TrackerNodeEvent::Instruction {
            tracker,
            instruction,
        }),
        Message::Relay(relay) => Some(TrackerNodeEvent::Relay { tracker, relay }),
        Message::Error(error) => Some(TrackerNodeEvent::Error { tracker, error }),
        _ => None,
    }
}

/// Sends node messages to connected trackers.
#[derive(Debug, Clone, Copy)]
pub struct TrackerNode<'a> {
    directory: &'a PeerDirectory,
}

impl<'a> TrackerNode<'a> {
    /// Wraps a directory.
    #[must_use]
    pub fn new(directory: &'a PeerDirectory) -> Self {
        Self { directory }
    }

    /// Reports status to a tracker.
    ///
    /// # Errors
    ///
    /// Returns an error if the tracker is not connected.
    pub fn send_status(&self, tracker: &PeerId, status: Status) -> Result<()> {
        self.directory.send(
            tracker,
            &Message::Status(StatusMessage {
                request_id: new_request_id(),
                status,
            }),
        )
    }

    /// Sends signalling for `target` through a tracker and returns the
    /// request id used.
    ///
    /// # Errors
    ///
    /// Returns an error if the tracker is not connected.
    pub fn send_relay(
        &self,
        tracker: &PeerId,
        originator: &PeerInfo,
        target: &PeerId,
        sub_type: RtcSubType,
        data: Value,
    ) -> Result<String> {
        let request_id = new_request_id();
        self.directory.send(
            tracker,
            &Message::Relay(RelayMessage {
                request_id: request_id.clone(),
                sub_type,
                originator: originator.clone(),
                target: target.clone(),
                data,
            }),
        )?;
        Ok(request_id)
    }
}
