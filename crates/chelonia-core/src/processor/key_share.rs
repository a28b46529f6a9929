//! Key sharing and the key request handshake.
//!
//! A requester posts `OP_KEY_REQUEST` on the target contract, signed by an
//! invite key. Processing the request consumes one invite use right away, so
//! a failed response never refunds it. The responder answers with
//! `OP_KEY_SHARE` on the requester contract and closes the request with
//! `OP_KEY_REQUEST_SEEN` on the target.

use chelonia_crypto::Key;
use chelonia_proto::{KeyId, KeyRequestOp, KeyRequestSeenOp, KeyShareOp, OpType, Payload};

use super::{MessageContext, Processor, Step};
use crate::{
    error::ChelError,
    side_effect::SideEffect,
    state::{ContractState, InviteStatus, PendingKeyshare, SharedKeyRecord},
    wrappers::{OpenContext, open_encrypted},
};

impl Processor<'_> {
    pub(super) fn apply_key_share(
        &self,
        payload: &Payload<KeyShareOp>,
        step: &Step<'_>,
        state: &mut ContractState,
        ctx: &mut MessageContext,
    ) -> Result<(), ChelError> {
        let Some(opened) = self.open_or_defer(payload, OpType::KeyShare, step, state, ctx)? else {
            return Ok(());
        };
        let share = opened.value;

        let mut received = Vec::new();
        for shared in &share.keys {
            // Recorded whether or not this client can read it, so every
            // client derives the same state.
            state.vm.shared_key_ids.push(SharedKeyRecord {
                id: shared.id.clone(),
                contract_id: share.contract_id.clone(),
                height: step.height(),
                key_request_hash: share.key_request_hash.clone(),
            });

            let open_ctx = OpenContext { keys: &state.vm.authorized_keys, secrets: self.secrets, aad: &step.aad };
            let serialized = match open_encrypted(&shared.data, &open_ctx) {
                Ok(opened) => opened.value,
                Err(ChelError::DecryptionKeyNotFound { key_id }) => {
                    ctx.missing_decryption_key_ids.insert(key_id);
                    continue;
                },
                Err(err) => return Err(err),
            };

            let secret = Key::deserialize(&serialized).map_err(|e| ChelError::DecryptionError(e.to_string()))?;
            if KeyId::new(secret.id()) != shared.id || !secret.has_secret() {
                return Err(ChelError::InvalidOperation(format!("shared key {} does not match its content", shared.id)));
            }
            if !self.secrets.contains(&shared.id) {
                self.secrets.insert(secret);
                received.push(shared.id.clone());
            }
        }

        if let Some(request_hash) = &share.key_request_hash {
            state.volatile.pending_key_requests.retain(|pending| pending.hash != *request_hash);
        }

        tracing::info!(
            contract_id = %step.message.contract_id(),
            height = step.height(),
            target = %share.contract_id,
            shared = share.keys.len(),
            received = received.len(),
            "Keys shared"
        );

        if !received.is_empty() {
            ctx.side_effects.push(SideEffect::KeysReceived { target_contract_id: share.contract_id, key_ids: received });
        }
        Ok(())
    }

    pub(super) fn apply_key_request(
        &self,
        payload: &Payload<KeyRequestOp>,
        step: &Step<'_>,
        state: &mut ContractState,
        ctx: &mut MessageContext,
    ) -> Result<(), ChelError> {
        let Some(opened) = self.open_or_defer(payload, OpType::KeyRequest, step, state, ctx)? else {
            return Ok(());
        };
        let request = opened.value;
        if request.contract_id == *step.message.contract_id() {
            return Err(ChelError::InvalidOperation("a contract cannot request its own keys".into()));
        }

        if let Some(invite) = state.vm.invites.get_mut(&step.signer.id) {
            if invite.status != InviteStatus::Active {
                return Err(ChelError::Warning(format!("invite {} is {:?}", invite.name, invite.status)));
            }
            match invite.quantity {
                Some(0) => {
                    return Err(ChelError::Warning(format!("invite {} has no uses left", invite.name)));
                },
                Some(remaining) => {
                    invite.quantity = Some(remaining - 1);
                    if remaining == 1 {
                        invite.status = InviteStatus::Used;
                    }
                },
                None => {},
            }
        }

        let request_hash = step.message.hash().clone();
        state.vm.pending_keyshares.insert(
            request_hash.clone(),
            PendingKeyshare {
                requester: request.contract_id,
                height: request.height,
                request_height: step.height(),
                signing_key_id: step.signer.id.clone(),
                reply_with: request.reply_with,
                request: request.request,
            },
        );
        ctx.side_effects.push(SideEffect::RespondToKeyRequest { request_hash });
        Ok(())
    }

    pub(super) fn apply_key_request_seen(
        &self,
        payload: &Payload<KeyRequestSeenOp>,
        step: &Step<'_>,
        state: &mut ContractState,
        ctx: &mut MessageContext,
    ) -> Result<(), ChelError> {
        let Some(opened) = self.open_or_defer(payload, OpType::KeyRequestSeen, step, state, ctx)? else {
            return Ok(());
        };
        let seen = opened.value;
        if state.vm.pending_keyshares.remove(&seen.key_request_hash).is_none() {
            return Err(ChelError::Warning(format!("no pending key request {}", seen.key_request_hash)));
        }

        tracing::info!(
            contract_id = %step.message.contract_id(),
            height = step.height(),
            request = %seen.key_request_hash,
            success = seen.success,
            "Key request settled"
        );
        ctx.side_effects.push(SideEffect::KeyRequestSettled { request_hash: seen.key_request_hash, success: seen.success });
        Ok(())
    }
}
