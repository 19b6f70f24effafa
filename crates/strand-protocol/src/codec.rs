//! JSON envelope codec.
//!
//! Every message travels as a single JSON object:
//!
//! ```text
//! {"version": 2, "code": 12, "payload": {...}}
//! ```
//!
//! `code` selects the [`MessageType`], `version` selects the payload layout.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::messages::{new_request_id, PartitionStatus, Status, StatusMessage};
use crate::version::{is_supported, CURRENT_VERSION};
use crate::{Message, MessageType, ProtocolError, Result, MAX_MESSAGE_SIZE};

#[derive(Serialize)]
struct EnvelopeOut {
    version: u64,
    code: u8,
    payload: Value,
}

#[derive(Deserialize)]
struct EnvelopeIn {
    version: Option<u64>,
    code: Option<u64>,
    payload: Option<Value>,
}

/// Status layout of version 1, before request ids and RTTs were reported.
#[derive(Deserialize)]
struct StatusV1 {
    status: StatusV1Body,
}

#[derive(Deserialize)]
struct StatusV1Body {
    partitions: Vec<PartitionStatus>,
    #[serde(default)]
    started: i64,
}

/// Encodes a message into a current-version envelope.
///
/// # Errors
///
/// Returns [`ProtocolError::Serialization`] if the payload cannot be
/// represented as JSON.
pub fn encode(message: &Message) -> Result<String> {
    let payload = payload_of(message).map_err(|e| ProtocolError::Serialization(e.to_string()))?;
    let envelope = EnvelopeOut {
        version: CURRENT_VERSION,
        code: message.message_type().code(),
        payload,
    };
    serde_json::to_string(&envelope).map_err(|e| ProtocolError::Serialization(e.to_string()))
}

/// Decodes an envelope.
///
/// # Errors
///
/// - [`ProtocolError::TooLarge`] if the input exceeds [`MAX_MESSAGE_SIZE`]
/// - [`ProtocolError::Malformed`] if the envelope or payload does not parse
/// - [`ProtocolError::UnsupportedVersion`] for unknown versions
/// - [`ProtocolError::UnknownMessageType`] for unknown codes
pub fn decode(text: &str) -> Result<Message> {
    if text.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::TooLarge {
            size: text.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }

    let envelope: EnvelopeIn =
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

    let version = envelope
        .version
        .ok_or_else(|| ProtocolError::Malformed("missing version".into()))?;
    if !is_supported(version) {
        return Err(ProtocolError::UnsupportedVersion(version));
    }

    let code = envelope
        .code
        .ok_or_else(|| ProtocolError::Malformed("missing code".into()))?;
    let message_type =
        MessageType::from_code(code).ok_or(ProtocolError::UnknownMessageType(code))?;

    let payload = envelope
        .payload
        .ok_or_else(|| ProtocolError::Malformed("missing payload".into()))?;

    if version == 1 && message_type == MessageType::Status {
        return decode_status_v1(payload);
    }
    decode_payload(message_type, payload)
}

fn payload_of(message: &Message) -> serde_json::Result<Value> {
    match message {
        Message::Status(m) => serde_json::to_value(m),
        Message::Instruction(m) => serde_json::to_value(m),
        Message::Relay(m) => serde_json::to_value(m),
        Message::Error(m) => serde_json::to_value(m),
        Message::Broadcast(m) => serde_json::to_value(m),
        Message::Unicast(m) => serde_json::to_value(m),
        Message::Subscribe(m) => serde_json::to_value(m),
        Message::Unsubscribe(m) => serde_json::to_value(m),
        Message::ResendLast(m) => serde_json::to_value(m),
        Message::ResendFrom(m) => serde_json::to_value(m),
        Message::ResendRange(m) => serde_json::to_value(m),
        Message::Resending(m) | Message::Resent(m) | Message::NoResend(m) => {
            serde_json::to_value(m)
        }
        Message::ErrorResponse(m) => serde_json::to_value(m),
    }
}

fn body<T: DeserializeOwned>(message_type: MessageType, payload: Value) -> Result<T> {
    serde_json::from_value(payload)
        .map_err(|e| ProtocolError::Malformed(format!("invalid {message_type} payload: {e}")))
}

fn decode_payload(message_type: MessageType, payload: Value) -> Result<Message> {
    let t = message_type;
    Ok(match t {
        MessageType::Status => Message::Status(body(t, payload)?),
        MessageType::Instruction => Message::Instruction(body(t, payload)?),
        MessageType::Relay => Message::Relay(body(t, payload)?),
        MessageType::Error => Message::Error(body(t, payload)?),
        MessageType::Broadcast => Message::Broadcast(body(t, payload)?),
        MessageType::Unicast => Message::Unicast(body(t, payload)?),
        MessageType::Subscribe => Message::Subscribe(body(t, payload)?),
        MessageType::Unsubscribe => Message::Unsubscribe(body(t, payload)?),
        MessageType::ResendLastRequest => Message::ResendLast(body(t, payload)?),
        MessageType::ResendFromRequest => Message::ResendFrom(body(t, payload)?),
        MessageType::ResendRangeRequest => Message::ResendRange(body(t, payload)?),
        MessageType::ResendResponseResending => Message::Resending(body(t, payload)?),
        MessageType::ResendResponseResent => Message::Resent(body(t, payload)?),
        MessageType::ResendResponseNoResend => Message::NoResend(body(t, payload)?),
        MessageType::ErrorResponse => Message::ErrorResponse(body(t, payload)?),
    })
}

fn decode_status_v1(payload: Value) -> Result<Message> {
    let v1: StatusV1 = body(MessageType::Status, payload)?;
    Ok(Message::Status(StatusMessage {
        request_id: new_request_id(),
        status: Status {
            partitions: v1.status.partitions,
            rtts: Default::default(),
            started: v1.status.started,
        },
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ErrorCode, ErrorMessage, MessageRef, PeerId, PeerInfo, RelayMessage, RtcSubType,
        StreamMessage, StreamPartition, SubscribeRequest,
    };
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn sp() -> StreamPartition {
        StreamPartition::new("stream-1", 0)
    }

    #[test]
    fn envelope_shape() {
        let msg = Message::Subscribe(SubscribeRequest {
            request_id: "req".into(),
            stream_partition: sp(),
        });
        let value: Value = serde_json::from_str(&encode(&msg).unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "version": 2,
                "code": 12,
                "payload": {
                    "requestId": "req",
                    "streamPartition": {"streamId": "stream-1", "partition": 0}
                }
            })
        );
    }

    #[test]
    fn relay_data_is_opaque() {
        let msg = Message::Relay(RelayMessage {
            request_id: "r1".into(),
            sub_type: RtcSubType::RtcOffer,
            originator: PeerInfo::node("a"),
            target: PeerId::new("b"),
            data: json!({"connectionId": "c", "description": {"anything": [1, 2, 3]}}),
        });
        assert_eq!(decode(&encode(&msg).unwrap()).unwrap(), msg);
    }

    #[test]
    fn broadcast_round_trip() {
        let message = StreamMessage::new(sp(), "pub", MessageRef::new(10, 1), vec![0, 255, 7])
            .with_previous(MessageRef::new(9, 0));
        let msg = Message::Broadcast(crate::BroadcastMessage {
            request_id: "r".into(),
            stream_message: message,
        });
        assert_eq!(decode(&encode(&msg).unwrap()).unwrap(), msg);
    }

    #[test]
    fn unsupported_version() {
        let text = r#"{"version": 3, "code": 12, "payload": {}}"#;
        assert!(matches!(
            decode(text),
            Err(ProtocolError::UnsupportedVersion(3))
        ));
    }

    #[test]
    fn unknown_code() {
        let text = r#"{"version": 2, "code": 99, "payload": {}}"#;
        assert!(matches!(
            decode(text),
            Err(ProtocolError::UnknownMessageType(99))
        ));
    }

    #[test]
    fn malformed_inputs() {
        for text in [
            "",
            "not json",
            "[]",
            r#"{"code": 12, "payload": {}}"#,
            r#"{"version": 2, "payload": {}}"#,
            r#"{"version": 2, "code": 12}"#,
            r#"{"version": 2, "code": 12, "payload": {"requestId": 5}}"#,
            r#"{"version": "2", "code": 12, "payload": {}}"#,
        ] {
            assert!(
                matches!(decode(text), Err(ProtocolError::Malformed(_))),
                "{text:?} should be malformed"
            );
        }
    }

    #[test]
    fn too_large() {
        let text = " ".repeat(MAX_MESSAGE_SIZE + 1);
        assert!(matches!(
            decode(&text),
            Err(ProtocolError::TooLarge { .. })
        ));
    }

    #[test]
    fn v1_status_gets_request_id_and_empty_rtts() {
        let text = json!({
            "version": 1,
            "code": 1,
            "payload": {
                "status": {
                    "partitions": [{
                        "streamPartition": {"streamId": "s", "partition": 2},
                        "neighbors": ["n2"]
                    }],
                    "started": 1000
                }
            }
        })
        .to_string();
        let Message::Status(status) = decode(&text).unwrap() else {
            panic!("expected status");
        };
        assert_eq!(status.request_id.len(), 36);
        assert!(status.status.rtts.is_empty());
        assert_eq!(status.status.started, 1000);
        assert_eq!(status.status.partitions[0].neighbors, vec![PeerId::new("n2")]);
        assert_eq!(status.status.partitions[0].counter, 0);
    }

    #[test]
    fn v1_non_status_uses_current_layout() {
        let msg = Message::Error(ErrorMessage {
            request_id: "r".into(),
            error_code: ErrorCode::RtcUnknownPeer,
            target: PeerId::new("ghost"),
        });
        let mut value: Value = serde_json::from_str(&encode(&msg).unwrap()).unwrap();
        value["version"] = json!(1);
        assert_eq!(decode(&value.to_string()).unwrap(), msg);
    }
}
