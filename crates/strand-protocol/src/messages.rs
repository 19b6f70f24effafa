//! Protocol message definitions.
//!
//! Two layers share one envelope: the tracker layer (status reports,
//! topology instructions and signalling relay) and the node layer (data,
//! subscriptions and resends).

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{PeerId, PeerInfo, StreamMessage, StreamPartition};

/// Generates a fresh request id.
#[must_use]
pub fn new_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Which protocol layer a message type belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Layer {
    /// Tracker <-> node control traffic.
    Tracker,
    /// Node <-> node data traffic.
    Node,
}

/// The type code carried in every envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum MessageType {
    /// Node status report.
    Status = 1,
    /// Neighbor assignment.
    Instruction = 2,
    /// Signalling relay.
    Relay = 3,
    /// Tracker error.
    Error = 4,
    /// Live data.
    Broadcast = 10,
    /// Resent data.
    Unicast = 11,
    /// Subscribe to a partition.
    Subscribe = 12,
    /// Unsubscribe from a partition.
    Unsubscribe = 13,
    /// Resend the last N messages.
    ResendLastRequest = 14,
    /// Resend from a timestamp.
    ResendFromRequest = 15,
    /// Resend a timestamp range.
    ResendRangeRequest = 16,
    /// Resend starting.
    ResendResponseResending = 17,
    /// Resend finished.
    ResendResponseResent = 18,
    /// Nothing to resend.
    ResendResponseNoResend = 19,
    /// Resend failed.
    ErrorResponse = 20,
}

impl MessageType {
    /// Every message type, in code order.
    pub const ALL: [MessageType; 15] = [
        Self::Status,
        Self::Instruction,
        Self::Relay,
        Self::Error,
        Self::Broadcast,
        Self::Unicast,
        Self::Subscribe,
        Self::Unsubscribe,
        Self::ResendLastRequest,
        Self::ResendFromRequest,
        Self::ResendRangeRequest,
        Self::ResendResponseResending,
        Self::ResendResponseResent,
        Self::ResendResponseNoResend,
        Self::ErrorResponse,
    ];

    /// Returns the wire code.
    #[must_use]
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// Looks up a message type by wire code.
    #[must_use]
    pub fn from_code(code: u64) -> Option<Self> {
        Self::ALL.into_iter().find(|t| u64::from(t.code()) == code)
    }

    /// Returns the layer the type belongs to.
    #[must_use]
    pub const fn layer(self) -> Layer {
        match self {
            Self::Status | Self::Instruction | Self::Relay | Self::Error => Layer::Tracker,
            _ => Layer::Node,
        }
    }

    /// Returns a human readable name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Status => "status",
            Self::Instruction => "instruction",
            Self::Relay => "relay",
            Self::Error => "error",
            Self::Broadcast => "broadcast",
            Self::Unicast => "unicast",
            Self::Subscribe => "subscribe",
            Self::Unsubscribe => "unsubscribe",
            Self::ResendLastRequest => "resend_last",
            Self::ResendFromRequest => "resend_from",
            Self::ResendRangeRequest => "resend_range",
            Self::ResendResponseResending => "resending",
            Self::ResendResponseResent => "resent",
            Self::ResendResponseNoResend => "no_resend",
            Self::ErrorResponse => "error_response",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Per-partition part of a status report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionStatus {
    /// The partition.
    pub stream_partition: StreamPartition,
    /// Currently connected neighbors for the partition.
    pub neighbors: Vec<PeerId>,
    /// Counter of the last applied instruction, 0 if none.
    #[serde(default)]
    pub counter: u64,
}

/// A node's view of itself, as reported to a tracker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    /// Partitions the node is interested in.
    pub partitions: Vec<PartitionStatus>,
    /// Round-trip times to connected peers, in milliseconds.
    #[serde(default)]
    pub rtts: BTreeMap<PeerId, u64>,
    /// When the node started, in milliseconds since the epoch.
    #[serde(default)]
    pub started: i64,
}

/// Node -> tracker status report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusMessage {
    /// Correlation id.
    pub request_id: String,
    /// The report.
    pub status: Status,
}

/// Tracker -> node neighbor assignment for one partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstructionMessage {
    /// Correlation id.
    pub request_id: String,
    /// The partition.
    pub stream_partition: StreamPartition,
    /// Target neighbor set.
    pub neighbors: Vec<PeerId>,
    /// Per-(peer, partition) sequence; stale instructions are ignored.
    pub counter: u64,
}

/// Signalling subtypes carried by a [`RelayMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RtcSubType {
    /// Offer with the responder's address.
    RtcOffer,
    /// Answer to an offer.
    RtcAnswer,
    /// Request to start a handshake.
    RtcConnect,
    /// Additional candidate address.
    IceCandidate,
}

/// Signalling payload forwarded verbatim by trackers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayMessage {
    /// Correlation id.
    pub request_id: String,
    /// The signalling step.
    pub sub_type: RtcSubType,
    /// The peer that started the relay.
    pub originator: PeerInfo,
    /// The peer the relay is for.
    pub target: PeerId,
    /// Opaque to the tracker.
    pub data: serde_json::Value,
}

/// Tracker error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// A relay target is not connected to the tracker.
    RtcUnknownPeer,
}

/// Tracker -> node error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorMessage {
    /// Request id of the message that failed.
    pub request_id: String,
    /// What went wrong.
    pub error_code: ErrorCode,
    /// The peer the failed message was for.
    pub target: PeerId,
}

/// Live data propagated to neighbors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastMessage {
    /// Correlation id.
    pub request_id: String,
    /// The data.
    pub stream_message: StreamMessage,
}

/// Data delivered as part of a resend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnicastMessage {
    /// Request id of the resend request.
    pub request_id: String,
    /// Resend correlation key.
    pub sub_id: String,
    /// The data.
    pub stream_message: StreamMessage,
}

/// Subscribe to a partition on the receiving neighbor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeRequest {
    /// Correlation id.
    pub request_id: String,
    /// The partition.
    pub stream_partition: StreamPartition,
}

/// Unsubscribe from a partition on the receiving neighbor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnsubscribeRequest {
    /// Correlation id.
    pub request_id: String,
    /// The partition.
    pub stream_partition: StreamPartition,
}

/// Request for the last `number_last` messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResendLastRequest {
    /// Correlation id.
    pub request_id: String,
    /// Resend correlation key.
    pub sub_id: String,
    /// The partition.
    pub stream_partition: StreamPartition,
    /// How many messages.
    pub number_last: u64,
}

/// Request for every message at or after `from_timestamp`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResendFromRequest {
    /// Correlation id.
    pub request_id: String,
    /// Resend correlation key.
    pub sub_id: String,
    /// The partition.
    pub stream_partition: StreamPartition,
    /// Inclusive lower bound.
    pub from_timestamp: i64,
    /// Restrict to one publisher.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publisher_id: Option<String>,
}

/// Request for every message in `[from_timestamp, to_timestamp]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResendRangeRequest {
    /// Correlation id.
    pub request_id: String,
    /// Resend correlation key.
    pub sub_id: String,
    /// The partition.
    pub stream_partition: StreamPartition,
    /// Inclusive lower bound.
    pub from_timestamp: i64,
    /// Inclusive upper bound.
    pub to_timestamp: i64,
    /// Restrict to one publisher.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publisher_id: Option<String>,
}

/// Body shared by the `Resending`, `Resent` and `NoResend` responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResendResponse {
    /// Request id of the resend request.
    pub request_id: String,
    /// Resend correlation key.
    pub sub_id: String,
    /// The partition.
    pub stream_partition: StreamPartition,
}

/// Terminal resend failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    /// Request id of the resend request.
    pub request_id: String,
    /// Resend correlation key.
    pub sub_id: String,
    /// The partition.
    pub stream_partition: StreamPartition,
    /// Machine readable code.
    pub error_code: String,
    /// Human readable description.
    pub message: String,
}

/// Any of the three resend request variants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResendRequest {
    /// Last N messages.
    Last(ResendLastRequest),
    /// From a timestamp.
    From(ResendFromRequest),
    /// A timestamp range.
    Range(ResendRangeRequest),
}

impl ResendRequest {
    /// Returns the resend correlation key.
    #[must_use]
    pub fn sub_id(&self) -> &str {
        match self {
            Self::Last(r) => &r.sub_id,
            Self::From(r) => &r.sub_id,
            Self::Range(r) => &r.sub_id,
        }
    }

    /// Returns the request id.
    #[must_use]
    pub fn request_id(&self) -> &str {
        match self {
            Self::Last(r) => &r.request_id,
            Self::From(r) => &r.request_id,
            Self::Range(r) => &r.request_id,
        }
    }

    /// Returns the partition.
    #[must_use]
    pub fn stream_partition(&self) -> &StreamPartition {
        match self {
            Self::Last(r) => &r.stream_partition,
            Self::From(r) => &r.stream_partition,
            Self::Range(r) => &r.stream_partition,
        }
    }

    /// Returns a short name of the mode.
    #[must_use]
    pub fn mode(&self) -> &'static str {
        match self {
            Self::Last(_) => "last",
            Self::From(_) => "from",
            Self::Range(_) => "range",
        }
    }

    /// Builds the response body for this request.
    #[must_use]
    pub fn response(&self) -> ResendResponse {
        ResendResponse {
            request_id: self.request_id().to_string(),
            sub_id: self.sub_id().to_string(),
            stream_partition: self.stream_partition().clone(),
        }
    }
}

impl From<ResendRequest> for Message {
    fn from(request: ResendRequest) -> Self {
        match request {
            ResendRequest::Last(r) => Message::ResendLast(r),
            ResendRequest::From(r) => Message::ResendFrom(r),
            ResendRequest::Range(r) => Message::ResendRange(r),
        }
    }
}

/// A wire message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Node status report.
    Status(StatusMessage),
    /// Neighbor assignment.
    Instruction(InstructionMessage),
    /// Signalling relay.
    Relay(RelayMessage),
    /// Tracker error.
    Error(ErrorMessage),
    /// Live data.
    Broadcast(BroadcastMessage),
    /// Resent data.
    Unicast(UnicastMessage),
    /// Subscribe.
    Subscribe(SubscribeRequest),
    /// Unsubscribe.
    Unsubscribe(UnsubscribeRequest),
    /// Resend the last N messages.
    ResendLast(ResendLastRequest),
    /// Resend from a timestamp.
    ResendFrom(ResendFromRequest),
    /// Resend a range.
    ResendRange(ResendRangeRequest),
    /// Resend starting.
    Resending(ResendResponse),
    /// Resend finished.
    Resent(ResendResponse),
    /// Nothing to resend.
    NoResend(ResendResponse),
    /// Resend failed.
    ErrorResponse(ErrorResponse),
}

impl Message {
    /// Returns the wire type of the message.
    #[must_use]
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Status(_) => MessageType::Status,
            Self::Instruction(_) => MessageType::Instruction,
            Self::Relay(_) => MessageType::Relay,
            Self::Error(_) => MessageType::Error,
            Self::Broadcast(_) => MessageType::Broadcast,
            Self::Unicast(_) => MessageType::Unicast,
            Self::Subscribe(_) => MessageType::Subscribe,
            Self::Unsubscribe(_) => MessageType::Unsubscribe,
            Self::ResendLast(_) => MessageType::ResendLastRequest,
            Self::ResendFrom(_) => MessageType::ResendFromRequest,
            Self::ResendRange(_) => MessageType::ResendRangeRequest,
            Self::Resending(_) => MessageType::ResendResponseResending,
            Self::Resent(_) => MessageType::ResendResponseResent,
            Self::NoResend(_) => MessageType::ResendResponseNoResend,
            Self::ErrorResponse(_) => MessageType::ErrorResponse,
        }
    }

    /// Returns the correlation id of the message.
    #[must_use]
    pub fn request_id(&self) -> &str {
        match self {
            Self::Status(m) => &m.request_id,
            Self::Instruction(m) => &m.request_id,
            Self::Relay(m) => &m.request_id,
            Self::Error(m) => &m.request_id,
            Self::Broadcast(m) => &m.request_id,
            Self::Unicast(m) => &m.request_id,
            Self::Subscribe(m) => &m.request_id,
            Self::Unsubscribe(m) => &m.request_id,
            Self::ResendLast(m) => &m.request_id,
            Self::ResendFrom(m) => &m.request_id,
            Self::ResendRange(m) => &m.request_id,
            Self::Resending(m) | Self::Resent(m) | Self::NoResend(m) => &m.request_id,
            Self::ErrorResponse(m) => &m.request_id,
        }
    }

    /// Returns the layer the message belongs to.
    #[must_use]
    pub fn layer(&self) -> Layer {
        self.message_type().layer()
    }
}
