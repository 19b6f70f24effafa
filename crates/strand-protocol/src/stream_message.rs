//! Application data messages carried by the overlay.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{PeerId, StreamPartition};

/// Position of a message within one publisher's sequence.
///
/// Ordered by timestamp first, then sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRef {
    /// Publisher-assigned timestamp in milliseconds.
    pub timestamp: i64,
    /// Sequence number among messages sharing the timestamp.
    pub sequence_number: u32,
}

impl MessageRef {
    /// Creates a message reference.
    #[must_use]
    pub const fn new(timestamp: i64, sequence_number: u32) -> Self {
        Self {
            timestamp,
            sequence_number,
        }
    }
}

impl fmt::Display for MessageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.timestamp, self.sequence_number)
    }
}

/// Identity of a message for duplicate detection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageId {
    /// Partition the message belongs to.
    pub stream_partition: StreamPartition,
    /// The publisher.
    pub publisher_id: String,
    /// Position within the publisher's sequence.
    pub message_ref: MessageRef,
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.stream_partition, self.publisher_id, self.message_ref
        )
    }
}

/// How the content of a message is encrypted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncryptionType {
    /// Plaintext content.
    #[default]
    None,
    /// RSA-encrypted content.
    Rsa,
    /// AES-encrypted content.
    Aes,
}

/// How a message is signed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignatureType {
    /// Unsigned.
    #[default]
    None,
    /// Ethereum-style signature.
    Eth,
}

/// Reasons a message is rejected before delivery.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// The publisher id is empty.
    #[error("missing publisher id")]
    MissingPublisher,

    /// The timestamp is negative.
    #[error("negative timestamp: {0}")]
    NegativeTimestamp(i64),

    /// The previous reference does not precede the message.
    #[error("previous reference {previous} does not precede {current}")]
    PreviousNotBefore {
        /// The message's own reference.
        current: MessageRef,
        /// The claimed previous reference.
        previous: MessageRef,
    },

    /// The message claims a signature type but carries no signature.
    #[error("signature type {0:?} without signature")]
    MissingSignature(SignatureType),
}

/// A message published to a stream partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamMessage {
    /// Partition the message is published to.
    pub stream_partition: StreamPartition,
    /// The publisher.
    pub publisher_id: String,
    /// Publisher-assigned timestamp in milliseconds.
    pub timestamp: i64,
    /// Sequence number among messages sharing the timestamp.
    pub sequence_number: u32,
    /// The publisher's preceding message, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous: Option<MessageRef>,
    /// Opaque content.
    #[serde(with = "content_base64")]
    pub content: Vec<u8>,
    /// Content encryption.
    #[serde(default)]
    pub encryption_type: EncryptionType,
    /// Signature scheme.
    #[serde(default)]
    pub signature_type: SignatureType,
    /// The signature, if signed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl StreamMessage {
    /// Creates an unsigned plaintext message.
    #[must_use]
    pub fn new(
        stream_partition: StreamPartition,
        publisher_id: impl Into<String>,
        message_ref: MessageRef,
        content: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            stream_partition,
            publisher_id: publisher_id.into(),
            timestamp: message_ref.timestamp,
            sequence_number: message_ref.sequence_number,
            previous: None,
            content: content.into(),
            encryption_type: EncryptionType::None,
            signature_type: SignatureType::None,
            signature: None,
        }
    }

    /// Sets the previous message reference.
    #[must_use]
    pub fn with_previous(mut self, previous: MessageRef) -> Self {
        self.previous = Some(previous);
        self
    }

    /// Attaches a signature.
    #[must_use]
    pub fn with_signature(mut self, signature_type: SignatureType, signature: String) -> Self {
        self.signature_type = signature_type;
        self.signature = Some(signature);
        self
    }

    /// Returns the message's position in its publisher's sequence.
    #[must_use]
    pub fn message_ref(&self) -> MessageRef {
        MessageRef::new(self.timestamp, self.sequence_number)
    }

    /// Returns the identity used for duplicate detection.
    #[must_use]
    pub fn message_id(&self) -> MessageId {
        MessageId {
            stream_partition: self.stream_partition.clone(),
            publisher_id: self.publisher_id.clone(),
            message_ref: self.message_ref(),
        }
    }

    /// Returns the publisher as a peer id.
    #[must_use]
    pub fn publisher(&self) -> PeerId {
        PeerId::new(self.publisher_id.clone())
    }

    /// Checks the message is well formed.
    ///
    /// # Errors
    ///
    /// Returns the first rule the message violates.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.publisher_id.is_empty() {
            return Err(ValidationError::MissingPublisher);
        }
        if self.timestamp < 0 {
            return Err(ValidationError::NegativeTimestamp(self.timestamp));
        }
        if let Some(previous) = self.previous {
            let current = self.message_ref();
            if previous >= current {
                return Err(ValidationError::PreviousNotBefore { current, previous });
            }
        }
        if self.signature_type != SignatureType::None && self.signature.is_none() {
            return Err(ValidationError::MissingSignature(self.signature_type));
        }
        Ok(())
    }
}

mod content_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(content: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(content))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(ts: i64, seq: u32) -> StreamMessage {
        StreamMessage::new(
            StreamPartition::new("stream", 0),
            "publisher",
            MessageRef::new(ts, seq),
            b"hello".to_vec(),
        )
    }

    #[test]
    fn refs_order_by_timestamp_then_sequence() {
        assert!(MessageRef::new(1, 5) < MessageRef::new(2, 0));
        assert!(MessageRef::new(2, 0) < MessageRef::new(2, 1));
    }

    #[test]
    fn valid_message_passes() {
        let msg = message(10, 0).with_previous(MessageRef::new(9, 3));
        assert_eq!(msg.validate(), Ok(()));
    }

    #[test]
    fn validation_rejects_bad_messages() {
        let mut msg = message(10, 0);
        msg.publisher_id.clear();
        assert_eq!(msg.validate(), Err(ValidationError::MissingPublisher));

        assert_eq!(
            message(-1, 0).validate(),
            Err(ValidationError::NegativeTimestamp(-1))
        );

        let msg = message(10, 0).with_previous(MessageRef::new(10, 0));
        assert!(matches!(
            msg.validate(),
            Err(ValidationError::PreviousNotBefore { .. })
        ));

        let mut msg = message(10, 0);
        msg.signature_type = SignatureType::Eth;
        assert_eq!(
            msg.validate(),
            Err(ValidationError::MissingSignature(SignatureType::Eth))
        );
    }

    #[test]
    fn content_travels_as_base64() {
        let json = serde_json::to_value(message(1, 0)).unwrap();
        assert_eq!(json["content"], "aGVsbG8=");
        assert_eq!(json["streamPartition"]["streamId"], "stream");
        let back: StreamMessage = serde_json::from_value(json).unwrap();
        assert_eq!(back.content, b"hello");
    }

    #[test]
    fn message_id_identifies_position() {
        let a = message(5, 1);
        let mut b = message(5, 1);
        b.content = b"other".to_vec();
        assert_eq!(a.message_id(), b.message_id());
        assert_ne!(a.message_id(), message(5, 2).message_id());
    }
}
