//! Operation processor.
//!
//! The transition function of the contract state machine: given a message
//! and the contract's current state, produce the next state and the side
//! effects to run once that state is committed. Processing never mutates the
//! state it is given and never performs I/O. The only shared resource it
//! touches is the secret key store, which only ever gains keys.
//!
//! # Invariants
//!
//! - Same log, same secrets: same `vm` state on every client.
//! - A failed message leaves no trace in the state.
//! - Inside `OP_ATOMIC`, a sub-operation failing with an ignorable error is
//!   skipped on its own; any other failure discards the whole message.

mod actions;
mod key_share;
mod keys;

pub use keys::INVITE_KEY_PREFIX;

use std::collections::BTreeSet;

use chelonia_crypto::Key;
use chelonia_proto::{Aad, KeyId, KeyPurpose, Message, OpType, OpValue, Payload, Permission};
use serde::de::DeserializeOwned;

use crate::{
    contract::ContractRegistry,
    error::ChelError,
    keys::AuthorizedKey,
    secrets::SecretKeyStore,
    side_effect::SideEffect,
    state::ContractState,
    wrappers::{OpenContext, Opened, authorize, open},
};

/// What processing a message produced besides the new state.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MessageContext {
    /// Encryption keys whose secrets were not held
    pub missing_decryption_key_ids: BTreeSet<KeyId>,
    /// Work to run after commit, in emission order
    pub side_effects: Vec<SideEffect>,
    /// Ignorable error that turned the whole operation into a no-op
    pub skipped: Option<ChelError>,
}

impl MessageContext {
    fn absorb(&mut self, other: Self) {
        self.missing_decryption_key_ids.extend(other.missing_decryption_key_ids);
        self.side_effects.extend(other.side_effects);
    }
}

/// Result of processing one message.
#[derive(Debug, Clone)]
pub struct Processed {
    /// State after the message
    pub state: ContractState,
    /// Side effects and bookkeeping
    pub context: MessageContext,
}

/// Per-message facts every operation handler needs.
struct Step<'m> {
    message: &'m Message,
    aad: Aad,
    signer: AuthorizedKey,
}

impl Step<'_> {
    fn height(&self) -> u64 {
        self.message.height()
    }
}

/// Applies messages to contract state.
#[derive(Debug, Clone, Copy)]
pub struct Processor<'a> {
    registry: &'a ContractRegistry,
    secrets: &'a SecretKeyStore,
    skip_action_processing: bool,
}

impl<'a> Processor<'a> {
    /// Processor resolving actions through `registry` and decrypting with
    /// `secrets`.
    #[must_use]
    pub fn new(registry: &'a ContractRegistry, secrets: &'a SecretKeyStore) -> Self {
        Self { registry, secrets, skip_action_processing: false }
    }

    /// Verify actions without running contract `process` handlers.
    #[must_use]
    pub fn skip_action_processing(mut self, skip: bool) -> Self {
        self.skip_action_processing = skip;
        self
    }

    /// Apply `message` to `state`.
    ///
    /// Ordering is not checked here; the caller decides whether the message
    /// is the next one. An ignorable failure of the top-level operation
    /// yields the unchanged state with [`MessageContext::skipped`] set.
    pub fn process(&self, message: &Message, state: &ContractState) -> Result<Processed, ChelError> {
        let mut working = state.clone();
        let mut context = MessageContext::default();

        let result = if message.is_first_message() {
            self.apply_genesis(message, &mut working, &mut context)
        } else {
            self.apply_message(message, &mut working, &mut context)
        };

        match result {
            Ok(()) => Ok(Processed { state: working, context }),
            Err(err) if err.is_ignorable() => {
                tracing::warn!(
                    contract_id = %message.contract_id(),
                    height = message.height(),
                    op = %message.op_type().code(),
                    error = %err,
                    "Operation skipped"
                );
                let mut skipped = MessageContext {
                    missing_decryption_key_ids: context.missing_decryption_key_ids,
                    ..MessageContext::default()
                };
                if let ChelError::DecryptionKeyNotFound { key_id } = &err {
                    skipped.missing_decryption_key_ids.insert(key_id.clone());
                }
                skipped.skipped = Some(err);
                Ok(Processed { state: state.clone(), context: skipped })
            },
            Err(err) => Err(err),
        }
    }

    fn apply_message(&self, message: &Message, state: &mut ContractState, ctx: &mut MessageContext) -> Result<(), ChelError> {
        let signer = verify_outer_signature(message, state)?;
        let step = Step { message, aad: Aad::new(Some(message.contract_id()), message.height()), signer };
        self.apply_op(message.op(), &step, state, ctx)
    }

    fn apply_op(&self, op: &OpValue, step: &Step<'_>, state: &mut ContractState, ctx: &mut MessageContext) -> Result<(), ChelError> {
        tracing::debug!(
            contract_id = %step.message.contract_id(),
            height = step.height(),
            op = %op.op_type().code(),
            "Applying operation"
        );

        match op {
            OpValue::Contract(_) => {
                Err(ChelError::InvalidOperation("OP_CONTRACT is only valid at height 0".into()))
            },
            OpValue::ActionEncrypted(envelope) => self.apply_action_encrypted(envelope, step, state, ctx),
            OpValue::ActionUnencrypted(payload) => self.apply_action_unencrypted(payload, step, state, ctx),
            OpValue::KeyAdd(keys) => self.apply_key_add(keys, step, state, ctx),
            OpValue::KeyDel(ids) => self.apply_key_del(ids, step, state, ctx),
            OpValue::KeyUpdate(updates) => self.apply_key_update(updates, step, state, ctx),
            OpValue::KeyShare(payload) => self.apply_key_share(payload, step, state, ctx),
            OpValue::KeyRequest(payload) => self.apply_key_request(payload, step, state, ctx),
            OpValue::KeyRequestSeen(payload) => self.apply_key_request_seen(payload, step, state, ctx),
            OpValue::Atomic(ops) => self.apply_atomic(ops, step, state, ctx),
            OpValue::PropSet(prop) => {
                state.vm.props.insert(prop.key.clone(), prop.value.clone());
                Ok(())
            },
            OpValue::PropDel(prop) => match state.vm.props.remove(&prop.key) {
                Some(_) => Ok(()),
                None => Err(ChelError::Warning(format!("property {} is not set", prop.key))),
            },
        }
    }

    /// Each sub-operation runs on its own copy; only successful ones are
    /// folded back.
    fn apply_atomic(&self, ops: &[OpValue], step: &Step<'_>, state: &mut ContractState, ctx: &mut MessageContext) -> Result<(), ChelError> {
        for (index, op) in ops.iter().enumerate() {
            if !step.signer.allows(Permission::outer(op.op_type())) {
                return Err(ChelError::unauthorized(
                    &step.signer.id,
                    format!("atomic sub-operation {index} needs permission {}", op.op_type().code()),
                ));
            }

            let mut working = state.clone();
            let mut sub = MessageContext::default();
            match self.apply_op(op, step, &mut working, &mut sub) {
                Ok(()) => {
                    *state = working;
                    ctx.absorb(sub);
                },
                Err(err) if err.is_ignorable() => {
                    tracing::warn!(
                        contract_id = %step.message.contract_id(),
                        height = step.height(),
                        index,
                        error = %err,
                        "Atomic sub-operation skipped"
                    );
                    ctx.missing_decryption_key_ids.extend(sub.missing_decryption_key_ids);
                    if let ChelError::DecryptionKeyNotFound { key_id } = err {
                        ctx.missing_decryption_key_ids.insert(key_id);
                    }
                },
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Open `payload` against the current key table.
    ///
    /// A missing decryption key defers the payload: its key id is recorded
    /// and `None` is returned. An inner signature must come from a key
    /// holding the `#inner` permission for `op`.
    fn open_or_defer<T: DeserializeOwned + Clone>(
        &self,
        payload: &Payload<T>,
        op: OpType,
        step: &Step<'_>,
        state: &ContractState,
        ctx: &mut MessageContext,
    ) -> Result<Option<Opened<T>>, ChelError> {
        let open_ctx = OpenContext { keys: &state.vm.authorized_keys, secrets: self.secrets, aad: &step.aad };
        match open(payload, &open_ctx) {
            Ok(opened) => {
                check_inner_signer(&opened, op, state)?;
                Ok(Some(opened))
            },
            Err(ChelError::DecryptionKeyNotFound { key_id }) => {
                tracing::warn!(
                    contract_id = %step.message.contract_id(),
                    height = step.height(),
                    key_id = %key_id,
                    "Deferring payload encrypted with a missing key"
                );
                ctx.missing_decryption_key_ids.insert(key_id);
                Ok(None)
            },
            Err(err) => Err(err),
        }
    }
}

/// Check the outer signature of a non-genesis message and return its signer.
fn verify_outer_signature(message: &Message, state: &ContractState) -> Result<AuthorizedKey, ChelError> {
    let signature = message.signature();
    let signer = authorize(&state.vm.authorized_keys, &signature.key_id, message.height(), KeyPurpose::Sig)?;

    let op = message.op_type();
    let permission = if message.is_first_message() { Permission::outer(OpType::Contract) } else { Permission::outer(op) };
    if !signer.allows(permission) {
        return Err(ChelError::unauthorized(&signer.id, format!("lacks permission {permission}")));
    }

    let public = Key::deserialize(&signer.data)
        .map_err(|e| ChelError::unauthorized(&signer.id, format!("unusable public key: {e}")))?;
    public
        .verify(&message.signing_input()?, &signature.signature)
        .map_err(|_| ChelError::SignatureError { key_id: signer.id.clone() })?;
    Ok(signer.clone())
}

fn check_inner_signer<T>(opened: &Opened<T>, op: OpType, state: &ContractState) -> Result<(), ChelError> {
    let Some(inner) = &opened.signing_key_id else {
        return Ok(());
    };
    let key = state
        .vm
        .authorized_keys
        .get(inner)
        .ok_or_else(|| ChelError::SignatureKeyNotFound { key_id: inner.clone() })?;
    if !key.allows(Permission::inner(op)) {
        return Err(ChelError::unauthorized(inner, format!("lacks permission {}", Permission::inner(op))));
    }
    Ok(())
}


#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use chelonia_crypto::KeyAlgorithm;
    use chelonia_proto::{
        ContractId, ContractOp, Hash, KeyDescriptor, KeyMeta, KeyRequestOp, MessageHead, PropDelOp, PropSetOp, ReplyWith,
        Scope, SignedEnvelope, message::PROTOCOL_VERSION,
    };

    use super::*;
    use crate::{
        engine::{genesis_message, sign_message},
        state::InviteStatus,
    };

    fn descriptor(key: &Key, name: &str, ring_level: u32, permissions: Scope<Permission>) -> KeyDescriptor {
        KeyDescriptor {
            id: KeyId::new(key.id()),
            name: name.into(),
            purpose: BTreeSet::from([KeyPurpose::Sig]),
            ring_level,
            permissions,
            allowed_actions: Scope::All,
            data: key.serialize(false),
            foreign_key: None,
            meta: KeyMeta::default(),
        }
    }

    struct Fixture {
        registry: ContractRegistry,
        secrets: SecretKeyStore,
        root: Key,
        member: Key,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                registry: ContractRegistry::new(),
                secrets: SecretKeyStore::new(),
                root: Key::generate(KeyAlgorithm::Ed25519, [1; 32]),
                member: Key::generate(KeyAlgorithm::Ed25519, [2; 32]),
            }
        }

        fn processor(&self) -> Processor<'_> {
            Processor::new(&self.registry, &self.secrets)
        }

        fn genesis(&self, extra: Vec<KeyDescriptor>) -> (Message, ContractState) {
            let mut keys = vec![
                Payload::Plain(descriptor(&self.root, "root", 0, Scope::All)),
                Payload::Plain(descriptor(&self.member, "member", 1, Scope::All)),
            ];
            keys.extend(extra.into_iter().map(Payload::Plain));
            let contract = ContractOp { contract_type: "counter".into(), keys, nonce: "n".into() };
            let message = genesis_message(contract, "m", &self.root).unwrap();
            let processed = self.processor().process(&message, &ContractState::default()).unwrap();
            (message, processed.state)
        }
    }

    fn next(previous: &Message, op: OpValue, key: &Key) -> Message {
        let head = MessageHead {
            version: PROTOCOL_VERSION,
            contract_id: Some(previous.contract_id().clone()),
            previous_head: Some(previous.hash().clone()),
            previous_key_op: Some(previous.contract_id().genesis_hash().clone()),
            height: previous.height() + 1,
            op: op.op_type(),
            manifest: "m".into(),
        };
        sign_message(head, op, key).unwrap()
    }

    fn prop_set(key: &str) -> OpValue {
        OpValue::PropSet(PropSetOp { key: key.into(), value: serde_json::json!(true) })
    }

    #[test]
    fn genesis_installs_type_and_keys() {
        let fixture = Fixture::new();
        let (_, state) = fixture.genesis(Vec::new());

        assert_eq!(state.vm.contract_type, "counter");
        assert_eq!(state.vm.authorized_keys.len(), 2);
        let root = &state.vm.authorized_keys[&KeyId::new(fixture.root.id())];
        assert_eq!(root.not_before_height, 0);
        assert!(root.is_active());
    }

    #[test]
    fn genesis_signed_by_unlisted_key_is_rejected() {
        let fixture = Fixture::new();
        let outsider = Key::generate(KeyAlgorithm::Ed25519, [9; 32]);
        let contract = ContractOp {
            contract_type: "counter".into(),
            keys: vec![Payload::Plain(descriptor(&fixture.root, "root", 0, Scope::All))],
            nonce: "n".into(),
        };
        let message = genesis_message(contract, "m", &outsider).unwrap();

        let result = fixture.processor().process(&message, &ContractState::default());
        assert!(matches!(result, Err(ChelError::SignatureKeyNotFound { .. })));
    }

    #[test]
    fn adding_an_existing_key_is_a_no_op() {
        let fixture = Fixture::new();
        let (genesis, state) = fixture.genesis(Vec::new());
        let op = OpValue::KeyAdd(vec![Payload::Plain(descriptor(&fixture.member, "member", 1, Scope::All))]);
        let message = next(&genesis, op, &fixture.root);

        let processed = fixture.processor().process(&message, &state).unwrap();
        assert!(matches!(processed.context.skipped, Some(ChelError::KeyAlreadyExists { .. })));
        assert_eq!(processed.state, state);
    }

    #[test]
    fn revoked_key_signs_only_below_revocation_height() {
        let fixture = Fixture::new();
        let (genesis, state) = fixture.genesis(Vec::new());
        let processor = fixture.processor();

        // A message at height 1 signed by the member is fine before the
        // revocation lands.
        let early = next(&genesis, prop_set("early"), &fixture.member);
        assert!(processor.process(&early, &state).is_ok());

        let revoke = next(&genesis, OpValue::KeyDel(vec![Payload::Plain(KeyId::new(fixture.member.id()))]), &fixture.root);
        let revoked = processor.process(&revoke, &state).unwrap().state;
        let member = &revoked.vm.authorized_keys[&KeyId::new(fixture.member.id())];
        assert_eq!(member.not_after_height, Some(1));

        let late = next(&revoke, prop_set("late"), &fixture.member);
        let result = processor.process(&late, &revoked);
        assert!(matches!(result, Err(ChelError::SignatureKeyUnauthorized { .. })));
    }

    #[test]
    fn reinstated_key_keeps_history_and_its_revoked_window() {
        let fixture = Fixture::new();
        let (genesis, state) = fixture.genesis(Vec::new());
        let processor = fixture.processor();
        let member_id = KeyId::new(fixture.member.id());

        let revoke = next(&genesis, OpValue::KeyDel(vec![Payload::Plain(member_id.clone())]), &fixture.root);
        let revoked = processor.process(&revoke, &state).unwrap().state;
        let filler = next(&revoke, prop_set("filler"), &fixture.root);
        let filled = processor.process(&filler, &revoked).unwrap().state;
        let readd = next(
            &filler,
            OpValue::KeyAdd(vec![Payload::Plain(descriptor(&fixture.member, "member", 1, Scope::All))]),
            &fixture.root,
        );
        let reinstated = processor.process(&readd, &filled).unwrap().state;

        // ORACLE: revoked at 1, re-added at 3; valid from genesis except [1, 3).
        let member = &reinstated.vm.authorized_keys[&member_id];
        assert!(member.is_active());
        assert_eq!(member.not_before_height, 0);
        assert_eq!(member.revoked_windows, vec![(1, 3)]);

        let inside = next(&revoke, prop_set("inside"), &fixture.member);
        assert_eq!(inside.height(), 2);
        let result = processor.process(&inside, &reinstated);
        assert!(matches!(result, Err(ChelError::SignatureKeyUnauthorized { .. })), "got {result:?}");

        let after = next(&readd, prop_set("after"), &fixture.member);
        let processed = processor.process(&after, &reinstated).unwrap();
        assert!(processed.state.vm.props.contains_key("after"));
    }

    #[test]
    fn prop_del_of_unset_property_is_a_warning() {
        let fixture = Fixture::new();
        let (genesis, state) = fixture.genesis(Vec::new());
        let message = next(&genesis, OpValue::PropDel(PropDelOp { key: "missing".into() }), &fixture.root);

        let processed = fixture.processor().process(&message, &state).unwrap();
        assert!(matches!(processed.context.skipped, Some(ChelError::Warning(_))));
        assert_eq!(processed.state, state);
    }

    #[test]
    fn atomic_skips_ignorable_children() {
        let fixture = Fixture::new();
        let (genesis, state) = fixture.genesis(Vec::new());
        let op = OpValue::Atomic(vec![prop_set("a"), OpValue::PropDel(PropDelOp { key: "missing".into() }), prop_set("b")]);
        let message = next(&genesis, op, &fixture.root);

        let processed = fixture.processor().process(&message, &state).unwrap();
        assert!(processed.context.skipped.is_none());
        assert!(processed.state.vm.props.contains_key("a"));
        assert!(processed.state.vm.props.contains_key("b"));
    }

    #[test]
    fn atomic_failure_discards_every_child() {
        let fixture = Fixture::new();
        let (genesis, state) = fixture.genesis(Vec::new());
        let bad_update = OpValue::KeyUpdate(vec![Payload::Plain(chelonia_proto::KeyUpdate {
            name: "ghost".into(),
            old_key_id: KeyId::from("ghost"),
            id: None,
            data: None,
            purpose: None,
            permissions: None,
            allowed_actions: None,
            meta: None,
        })]);
        let message = next(&genesis, OpValue::Atomic(vec![prop_set("a"), bad_update]), &fixture.root);

        // INVARIANT: a failed message leaves no trace in the state.
        let result = fixture.processor().process(&message, &state);
        assert!(matches!(result, Err(ChelError::InvalidOperation(_))));
        assert!(state.vm.props.is_empty());
    }

    #[test]
    fn invite_uses_are_consumed_by_requests() {
        let fixture = Fixture::new();
        let invite = Key::generate(KeyAlgorithm::Ed25519, [5; 32]);
        let mut invite_descriptor = descriptor(
            &invite,
            &format!("{INVITE_KEY_PREFIX}friends"),
            2,
            [Permission::outer(OpType::KeyRequest)].into_iter().collect(),
        );
        invite_descriptor.meta.quantity = Some(1);
        let (genesis, state) = fixture.genesis(vec![invite_descriptor]);
        let invite_id = KeyId::new(invite.id());
        assert_eq!(state.vm.invites[&invite_id].status, InviteStatus::Active);

        let requester = ContractId::from_genesis(Hash::digest(b"requester"));
        let request = |previous: &Message| {
            let reply_with =
                SignedEnvelope::<ReplyWith>::new(KeyId::from("reply"), Bytes::from_static(b"r"), Bytes::from_static(b"s"));
            let op = OpValue::KeyRequest(Payload::Plain(KeyRequestOp {
                contract_id: requester.clone(),
                height: 0,
                reply_with,
                request: "*".into(),
            }));
            next(previous, op, &invite)
        };

        let first = request(&genesis);
        let processed = fixture.processor().process(&first, &state).unwrap();
        let invite_state = &processed.state.vm.invites[&invite_id];
        assert_eq!(invite_state.quantity, Some(0));
        assert_eq!(invite_state.status, InviteStatus::Used);
        assert_eq!(processed.state.vm.pending_keyshares[first.hash()].request_height, 1);
        assert_eq!(processed.context.side_effects, vec![SideEffect::RespondToKeyRequest {
            request_hash: first.hash().clone()
        }]);

        let second = request(&first);
        let again = fixture.processor().process(&second, &processed.state).unwrap();
        assert!(matches!(again.context.skipped, Some(ChelError::Warning(_))));
        assert_eq!(again.state.vm.pending_keyshares.len(), 1);
    }
}
