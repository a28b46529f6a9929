//! Fuzz target for `Message::deserialize`
//!
//! Arbitrary bytes from a relay must never panic the decoder:
//! - Malformed encodings and wrong field types
//! - Heights, hashes and ids that fail validation
//! - Deeply nested atomic operations
//!
//! A message that does decode must re-encode to something that decodes to
//! the same message.

#![no_main]

use bytes::Bytes;
use chelonia_proto::{Direction, Message, RawMessage};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(message) = Message::deserialize(Bytes::copy_from_slice(data), Direction::Incoming) else {
        return;
    };
    let _ = message.signing_input();

    let raw = RawMessage { head: message.head().clone(), op: message.op().clone(), signature: message.signature().clone() };
    if let Ok(encoded) = raw.encode() {
        let decoded = RawMessage::decode(&encoded).expect("re-encoded message must decode");
        assert_eq!(decoded.head, raw.head);
        assert_eq!(decoded.op, raw.op);
    }
});
