//! Contract actions.

use chelonia_proto::{ActionOp, EncryptedEnvelope, OpType, Payload, Permission};

use super::{MessageContext, Processor, Step};
use crate::{
    contract::ActionContext,
    error::ChelError,
    side_effect::SideEffect,
    state::ContractState,
    wrappers::{OpenContext, Opened, open_encrypted},
};

impl Processor<'_> {
    pub(super) fn apply_action_encrypted(
        &self,
        envelope: &EncryptedEnvelope<ActionOp>,
        step: &Step<'_>,
        state: &mut ContractState,
        ctx: &mut MessageContext,
    ) -> Result<(), ChelError> {
        let open_ctx = OpenContext { keys: &state.vm.authorized_keys, secrets: self.secrets, aad: &step.aad };
        let opened = match open_encrypted(envelope, &open_ctx) {
            Ok(opened) => opened,
            Err(ChelError::DecryptionKeyNotFound { key_id }) => {
                tracing::debug!(
                    contract_id = %step.message.contract_id(),
                    height = step.height(),
                    key_id = %key_id,
                    "Action not readable yet"
                );
                ctx.missing_decryption_key_ids.insert(key_id);
                return Ok(());
            },
            Err(err) => return Err(err),
        };
        self.run_action(opened, OpType::ActionEncrypted, step, state, ctx)
    }

    pub(super) fn apply_action_unencrypted(
        &self,
        payload: &Payload<ActionOp>,
        step: &Step<'_>,
        state: &mut ContractState,
        ctx: &mut MessageContext,
    ) -> Result<(), ChelError> {
        let Some(opened) = self.open_or_defer(payload, OpType::ActionUnencrypted, step, state, ctx)? else {
            return Ok(());
        };
        self.run_action(opened, OpType::ActionUnencrypted, step, state, ctx)
    }

    fn run_action(
        &self,
        opened: Opened<ActionOp>,
        op: OpType,
        step: &Step<'_>,
        state: &mut ContractState,
        ctx: &mut MessageContext,
    ) -> Result<(), ChelError> {
        let ActionOp { action, data, meta } = opened.value;

        if let Some(inner) = &opened.signing_key_id {
            let key = state
                .vm
                .authorized_keys
                .get(inner)
                .ok_or_else(|| ChelError::SignatureKeyNotFound { key_id: inner.clone() })?;
            if !key.allows(Permission::inner(op)) {
                return Err(ChelError::unauthorized(inner, format!("lacks permission {}", Permission::inner(op))));
            }
            if !key.allows_action(&action) {
                return Err(ChelError::PermissionDenied(format!("inner key {inner} may not call {action}")));
            }
        }
        if !step.signer.allows_action(&action) {
            return Err(ChelError::PermissionDenied(format!("key {} may not call {action}", step.signer.id)));
        }

        let definition = self.registry.get(step.message.manifest())?;
        if definition.name() != state.vm.contract_type {
            return Err(ChelError::InvalidOperation(format!(
                "manifest {} defines {} but contract is {}",
                definition.manifest(),
                definition.name(),
                state.vm.contract_type
            )));
        }
        let in_namespace = action.strip_prefix(definition.name()).is_some_and(|rest| rest.starts_with('/'));
        let handler = definition
            .handler(&action)
            .filter(|_| in_namespace)
            .ok_or_else(|| ChelError::UnknownAction(action.clone()))?;

        definition.validate_metadata(&meta).map_err(|e| ChelError::action_failed(&action, e))?;

        let action_ctx = ActionContext {
            contract_id: step.message.contract_id(),
            hash: step.message.hash(),
            height: step.height(),
            signing_key_id: &step.signer.id,
            inner_signing_key_id: opened.signing_key_id.as_ref(),
            meta: &meta,
            getters: definition.getters(),
        };
        handler.validate(&data, &state.data, &action_ctx).map_err(|e| ChelError::action_failed(&action, e))?;
        if !self.skip_action_processing {
            handler.process(&data, &mut state.data, &action_ctx).map_err(|e| ChelError::action_failed(&action, e))?;
        }

        tracing::debug!(
            contract_id = %step.message.contract_id(),
            height = step.height(),
            action = %action,
            "Action applied"
        );

        if handler.has_side_effect() {
            ctx.side_effects.push(SideEffect::Action {
                action,
                data,
                meta,
                signing_key_id: step.signer.id.clone(),
                inner_signing_key_id: opened.signing_key_id,
            });
        }
        Ok(())
    }
}
