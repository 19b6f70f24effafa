//! Fuzz target for envelope decoding.
//!
//! Arbitrary text must decode to an error, never a panic, and anything that
//! decodes must survive a re-encode.

#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    if let Ok(message) = strand_protocol::decode(text) {
        let encoded = strand_protocol::encode(&message).expect("decoded message encodes");
        let decoded = strand_protocol::decode(&encoded).expect("encoded message decodes");
        assert_eq!(decoded, message);
    }
});
