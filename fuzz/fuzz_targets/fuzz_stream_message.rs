//! Fuzz target for stream message parsing and validation.

#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(message) = serde_json::from_slice::<strand_protocol::StreamMessage>(data) {
        let _ = message.validate();
        let _ = message.message_id();
    }
});
