//! Property-based tests for the envelope codec.

use proptest::prelude::*;
use strand_protocol::{
    decode, encode, BroadcastMessage, InstructionMessage, Message, MessageRef, PartitionStatus,
    PeerId, ProtocolError, ResendRangeRequest, Status, StatusMessage, StreamMessage,
    StreamPartition, UnicastMessage,
};

fn stream_partition_strategy() -> impl Strategy<Value = StreamPartition> {
    ("[a-zA-Z0-9/._-]{1,40}", 0u32..64).prop_map(|(id, p)| StreamPartition::new(id, p))
}

fn peer_id_strategy() -> impl Strategy<Value = PeerId> {
    "[a-z0-9-]{1,24}".prop_map(PeerId::new)
}

fn stream_message_strategy() -> impl Strategy<Value = StreamMessage> {
    (
        stream_partition_strategy(),
        "[a-z0-9]{1,20}",
        0i64..i64::MAX,
        any::<u32>(),
        prop::option::of((0i64..1_000_000, any::<u32>())),
        prop::collection::vec(any::<u8>(), 0..512),
    )
        .prop_map(|(sp, publisher, ts, seq, previous, content)| {
            let mut msg = StreamMessage::new(sp, publisher, MessageRef::new(ts, seq), content);
            msg.previous = previous.map(|(t, s)| MessageRef::new(t, s));
            msg
        })
}

fn message_strategy() -> impl Strategy<Value = Message> {
    prop_oneof![
        (stream_message_strategy(), "[a-f0-9-]{36}").prop_map(|(m, id)| {
            Message::Broadcast(BroadcastMessage {
                request_id: id,
                stream_message: m,
            })
        }),
        (stream_message_strategy(), "[a-z0-9]{1,16}").prop_map(|(m, sub)| {
            Message::Unicast(UnicastMessage {
                request_id: "req".into(),
                sub_id: sub,
                stream_message: m,
            })
        }),
        (
            stream_partition_strategy(),
            prop::collection::vec(peer_id_strategy(), 0..8),
            any::<u64>()
        )
            .prop_map(|(sp, neighbors, counter)| {
                Message::Instruction(InstructionMessage {
                    request_id: "req".into(),
                    stream_partition: sp,
                    neighbors,
                    counter,
                })
            }),
        (
            prop::collection::vec(
                (
                    stream_partition_strategy(),
                    prop::collection::vec(peer_id_strategy(), 0..4)
                ),
                0..4
            ),
            prop::collection::btree_map(peer_id_strategy(), 0u64..10_000, 0..4),
            0i64..i64::MAX,
        )
            .prop_map(|(partitions, rtts, started)| {
                Message::Status(StatusMessage {
                    request_id: "req".into(),
                    status: Status {
                        partitions: partitions
                            .into_iter()
                            .map(|(sp, neighbors)| PartitionStatus {
                                stream_partition: sp,
                                neighbors,
                                counter: 1,
                            })
                            .collect(),
                        rtts,
                        started,
                    },
                })
            }),
        (
            stream_partition_strategy(),
            any::<i64>(),
            any::<i64>(),
            prop::option::of("[a-z]{1,8}")
        )
            .prop_map(|(sp, from, to, publisher_id)| {
                Message::ResendRange(ResendRangeRequest {
                    request_id: "req".into(),
                    sub_id: "sub".into(),
                    stream_partition: sp,
                    from_timestamp: from,
                    to_timestamp: to,
                    publisher_id,
                })
            }),
    ]
}

proptest! {
    /// Property: encoding then decoding yields the same message
    #[test]
    fn prop_encode_decode_roundtrip(msg in message_strategy()) {
        let text = encode(&msg).unwrap();
        prop_assert_eq!(decode(&text).unwrap(), msg);
    }

    /// Property: decoding arbitrary text never panics
    #[test]
    fn prop_decode_garbage_never_panics(text in ".{0,512}") {
        let _ = decode(&text);
    }

    /// Property: envelopes with arbitrary version and code are classified
    #[test]
    fn prop_decode_arbitrary_envelope(version in 0u64..8, code in 0u64..32) {
        let text = format!(r#"{{"version":{version},"code":{code},"payload":{{}}}}"#);
        match decode(&text) {
            Err(ProtocolError::UnsupportedVersion(v)) => prop_assert!(v != 1 && v != 2),
            Err(ProtocolError::UnknownMessageType(c)) => prop_assert_eq!(c, code),
            Err(ProtocolError::Malformed(_)) => {}
            Err(other) => prop_assert!(false, "unexpected error {other}"),
            Ok(msg) => prop_assert!(false, "empty payload decoded as {msg:?}"),
        }
    }
}
