//! Property-based tests for message decoding and identity.

use bytes::Bytes;
use chelonia_proto::{
    ContractId, Direction, Hash, KeyId, Message, MessageHead, MessageSignature, OpType, OpValue,
    PropDelOp, PropSetOp, RawMessage, message::PROTOCOL_VERSION,
};
use proptest::prelude::*;

fn prop_message(height: u64, key: String, value: i64) -> RawMessage {
    let contract = ContractId::from_genesis(Hash::digest(b"genesis"));
    RawMessage {
        head: MessageHead {
            version: PROTOCOL_VERSION,
            contract_id: Some(contract),
            previous_head: Some(Hash::digest(&height.to_be_bytes())),
            previous_key_op: Some(Hash::digest(b"genesis")),
            height,
            op: OpType::PropSet,
            manifest: "m".into(),
        },
        op: OpValue::PropSet(PropSetOp { key, value: serde_json::json!(value) }),
        signature: MessageSignature { key_id: KeyId::from("k"), signature: Bytes::from_static(&[7; 64]) },
    }
}

proptest! {
    #[test]
    fn arbitrary_bytes_never_panic(bytes in prop::collection::vec(any::<u8>(), 0..512)) {
        // ORACLE: decoding either succeeds with a structurally valid message
        // or returns an error; it never panics.
        if let Ok(message) = Message::deserialize(Bytes::from(bytes), Direction::Incoming) {
            prop_assert!(message.height() > 0 || message.is_first_message());
        }
    }

    #[test]
    fn hash_is_identity_of_wire_bytes(height in 1u64..1_000_000, key in "[a-z]{1,12}", value in any::<i64>()) {
        let message = Message::from_raw_message(prop_message(height, key, value)).unwrap();
        let decoded = Message::deserialize(message.raw().clone(), Direction::Incoming).unwrap();

        // INVARIANT: identity is the hash of the exact bytes.
        prop_assert_eq!(decoded.hash(), &Hash::digest(message.raw()));
        prop_assert_eq!(decoded.hash(), message.hash());
        prop_assert_eq!(decoded.height(), height);
    }

    #[test]
    fn different_content_yields_different_hash(height in 1u64..1000, a in "[a-z]{1,8}", b in "[a-z]{1,8}") {
        prop_assume!(a != b);
        let first = Message::from_raw_message(prop_message(height, a, 0)).unwrap();
        let second = Message::from_raw_message(prop_message(height, b, 0)).unwrap();
        prop_assert_ne!(first.hash(), second.hash());
    }

    #[test]
    fn head_op_mismatch_is_rejected(height in 1u64..1000) {
        let mut raw = prop_message(height, "k".into(), 1);
        raw.op = OpValue::PropDel(PropDelOp { key: "k".into() });
        let bytes = chelonia_proto::codec::encode(&raw).unwrap();
        prop_assert!(RawMessage::decode(&bytes).is_err());
    }

    #[test]
    fn only_genesis_has_height_zero(height in 0u64..4) {
        let mut raw = prop_message(height, "k".into(), 1);
        let result = raw.validate();
        prop_assert_eq!(result.is_ok(), height > 0);

        raw.head.contract_id = None;
        raw.head.previous_head = None;
        prop_assert!(raw.validate().is_err());
    }
}

#[test]
fn signing_input_excludes_signature() {
    let mut raw = prop_message(5, "k".into(), 1);
    let before = RawMessage::signing_input(&raw.head, &raw.op).unwrap();
    raw.signature.signature = Bytes::from_static(&[9; 64]);
    let after = RawMessage::signing_input(&raw.head, &raw.op).unwrap();
    assert_eq!(before, after);
}
