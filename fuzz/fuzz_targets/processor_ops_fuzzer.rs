//! Fuzz target for the contract state machine
//!
//! Applies an arbitrary sequence of signed operations to a counter contract
//! and checks that processing never panics and that a rejected message
//! leaves the state untouched.

#![no_main]

use arbitrary::Arbitrary;
use chelonia_core::{ContractState, Processor, SecretKeyStore, genesis_message, sign_message};
use chelonia_crypto::{Key, KeyAlgorithm};
use chelonia_harness::fixtures::{self, COUNTER, COUNTER_MANIFEST, SIGNING_KEY, descriptor};
use chelonia_proto::{
    ActionOp, ContractOp, KeyId, KeyPurpose, MessageHead, OpValue, Payload, PropDelOp, PropSetOp, Scope,
    message::PROTOCOL_VERSION,
};
use libfuzzer_sys::fuzz_target;
use serde_json::json;

#[derive(Debug, Arbitrary)]
enum FuzzOp {
    PropSet { key: u8, value: i64 },
    PropDel { key: u8 },
    Increment { by: u64 },
    Note { text: String },
    UnknownAction,
    DelSigningKey,
    Atomic(Vec<FuzzOp>),
}

fn to_op(op: &FuzzOp, signing: &KeyId, depth: usize) -> OpValue {
    match op {
        FuzzOp::PropSet { key, value } => OpValue::PropSet(PropSetOp { key: format!("p{}", key % 4), value: json!(value) }),
        FuzzOp::PropDel { key } => OpValue::PropDel(PropDelOp { key: format!("p{}", key % 4) }),
        FuzzOp::Increment { by } => action("counter/increment", json!({ "by": by })),
        FuzzOp::Note { text } => action("counter/note", json!({ "text": text })),
        FuzzOp::UnknownAction => action("counter/unknown", json!(null)),
        FuzzOp::DelSigningKey => OpValue::KeyDel(vec![Payload::Plain(signing.clone())]),
        FuzzOp::Atomic(ops) if depth < 3 => {
            OpValue::Atomic(ops.iter().take(8).map(|op| to_op(op, signing, depth + 1)).collect())
        },
        FuzzOp::Atomic(_) => OpValue::Atomic(Vec::new()),
    }
}

fn action(name: &str, data: serde_json::Value) -> OpValue {
    OpValue::ActionUnencrypted(Payload::Plain(ActionOp { action: name.into(), data, meta: json!(null) }))
}

fuzz_target!(|ops: Vec<FuzzOp>| {
    let registry = fixtures::registry().expect("counter registry");
    let secrets = SecretKeyStore::new();
    let processor = Processor::new(&registry, &secrets);

    let key = Key::generate(KeyAlgorithm::Ed25519, [7; 32]);
    let signing = KeyId::new(key.id());
    let contract = ContractOp {
        contract_type: COUNTER.into(),
        keys: vec![Payload::Plain(descriptor(&key, SIGNING_KEY, KeyPurpose::Sig, 0, Scope::All))],
        nonce: "fuzz".into(),
    };
    let genesis = genesis_message(contract, COUNTER_MANIFEST, &key).expect("genesis signs");
    let mut state = processor.process(&genesis, &ContractState::default()).expect("genesis applies").state;
    let mut previous = genesis;

    for op in ops.iter().take(64) {
        let head = MessageHead {
            version: PROTOCOL_VERSION,
            contract_id: Some(previous.contract_id().clone()),
            previous_head: Some(previous.hash().clone()),
            previous_key_op: Some(previous.hash().clone()),
            height: previous.height() + 1,
            op: to_op(op, &signing, 0).op_type(),
            manifest: COUNTER_MANIFEST.into(),
        };
        let Ok(message) = sign_message(head, to_op(op, &signing, 0), &key) else {
            continue;
        };
        // Rejected messages are never appended, so the chain stays where it was.
        if let Ok(processed) = processor.process(&message, &state) {
            if processed.context.skipped.is_some() {
                assert_eq!(processed.state, state, "skipped message changed state");
            }
            state = processed.state;
            previous = message;
        }
    }
});
