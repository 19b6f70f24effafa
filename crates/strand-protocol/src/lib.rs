//! # Strand Protocol
//!
//! Wire definitions for the Strand stream overlay.
//!
//! This crate defines the data model shared by trackers and nodes
//! ([`StreamPartition`], [`StreamMessage`], [`PeerInfo`]), the closed set of
//! control and data messages exchanged between them, and the versioned JSON
//! envelope used to put those messages on the wire.
//!
//! ```
//! use strand_protocol::{decode, encode, Message, StreamPartition, SubscribeRequest};
//!
//! let msg = Message::Subscribe(SubscribeRequest {
//!     request_id: "req-1".into(),
//!     stream_partition: StreamPartition::new("stream-1", 0),
//! });
//! let text = encode(&msg).unwrap();
//! assert_eq!(decode(&text).unwrap(), msg);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod codec;
mod error;
mod identifiers;
mod messages;
mod stream_message;
mod version;

pub use codec::{decode, encode};
pub use error::{ProtocolError, Result};
pub use identifiers::{PeerId, PeerInfo, PeerRole, StreamPartition};
pub use messages::{
    new_request_id, BroadcastMessage, ErrorCode, ErrorMessage, ErrorResponse, InstructionMessage,
    Layer, Message, MessageType, PartitionStatus, RelayMessage, ResendFromRequest,
    ResendLastRequest, ResendRangeRequest, ResendRequest, ResendResponse, RtcSubType, Status,
    StatusMessage, SubscribeRequest, UnicastMessage, UnsubscribeRequest,
};
pub use stream_message::{
    EncryptionType, MessageId, MessageRef, SignatureType, StreamMessage, ValidationError,
};
pub use version::{is_supported, CURRENT_VERSION, SUPPORTED_VERSIONS};

/// Maximum accepted envelope size in bytes (16 MB).
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;
