//! Genesis and key lifecycle operations.

use chelonia_crypto::Key;
use chelonia_proto::{
    Aad, ContractId, KeyDescriptor, KeyId, KeyUpdate, Message, OpType, OpValue, Payload, PrivateKeyMeta,
};

use super::{MessageContext, Processor, Step, verify_outer_signature};
use crate::{
    error::ChelError,
    keys::{
        AuthorizedKey, find_key_by_name, validate_key_add_permissions, validate_key_del_permissions,
        validate_key_update_permissions,
    },
    side_effect::SideEffect,
    state::{ContractState, Invite, InviteStatus, WatchedKey},
    wrappers::{OpenContext, open_encrypted},
};

/// Prefix of invite key names.
pub const INVITE_KEY_PREFIX: &str = "#inviteKey-";

impl Processor<'_> {
    /// `OP_CONTRACT`: initialise type and keys, then check the outer
    /// signature against the keys just installed.
    pub(super) fn apply_genesis(&self, message: &Message, state: &mut ContractState, ctx: &mut MessageContext) -> Result<(), ChelError> {
        let OpValue::Contract(genesis) = message.op() else {
            return Err(ChelError::MalformedMessage("first message must be OP_CONTRACT".into()));
        };

        state.vm.contract_type.clone_from(&genesis.contract_type);
        let mut descriptors = Vec::with_capacity(genesis.keys.len());
        for payload in &genesis.keys {
            let Payload::Plain(descriptor) = payload else {
                return Err(ChelError::InvalidOperation("genesis keys must be plain".into()));
            };
            check_key_material(descriptor)?;
            if state.vm.authorized_keys.contains_key(&descriptor.id) {
                return Err(ChelError::InvalidOperation(format!("duplicate genesis key {}", descriptor.id)));
            }
            state
                .vm
                .authorized_keys
                .insert(descriptor.id.clone(), AuthorizedKey::from_descriptor(descriptor.clone(), 0, None));
            descriptors.push(descriptor);
        }

        let signer = verify_outer_signature(message, state)?;
        let step = Step { message, aad: Aad::new(None, 0), signer };
        for descriptor in descriptors {
            self.register_key_extras(descriptor, &step, state, ctx)?;
        }

        tracing::info!(
            contract_id = %message.contract_id(),
            contract_type = %state.vm.contract_type,
            keys = state.vm.authorized_keys.len(),
            "Contract created"
        );
        Ok(())
    }

    pub(super) fn apply_key_add(
        &self,
        keys: &[Payload<KeyDescriptor>],
        step: &Step<'_>,
        state: &mut ContractState,
        ctx: &mut MessageContext,
    ) -> Result<(), ChelError> {
        for payload in keys {
            let Some(opened) = self.open_or_defer(payload, OpType::KeyAdd, step, state, ctx)? else {
                continue;
            };
            let descriptor = opened.value;
            check_key_material(&descriptor)?;

            let previous = state.vm.authorized_keys.get(&descriptor.id);
            if previous.is_some_and(AuthorizedKey::is_active) {
                return Err(ChelError::KeyAlreadyExists { key_id: descriptor.id });
            }
            if let Some(active) = find_key_by_name(&state.vm.authorized_keys, &descriptor.name) {
                return Err(ChelError::InvalidOperation(format!(
                    "name {} is already used by active key {}",
                    descriptor.name, active.id
                )));
            }
            validate_key_add_permissions(&step.signer, &descriptor)?;

            let mut key = AuthorizedKey::from_descriptor(descriptor.clone(), step.height(), Some(step.signer.id.clone()));
            if let Some(previous) = previous {
                // Reinstated: keep history so old signatures still verify and
                // the revoked stretch stays invalid.
                key.not_before_height = previous.not_before_height.min(step.height());
                key.revoked_windows.clone_from(&previous.revoked_windows);
                if let Some(revoked_at) = previous.not_after_height {
                    key.revoked_windows.push((revoked_at, step.height()));
                }
            }
            state.vm.authorized_keys.insert(key.id.clone(), key);
            self.register_key_extras(&descriptor, step, state, ctx)?;
        }
        Ok(())
    }

    pub(super) fn apply_key_del(
        &self,
        ids: &[Payload<KeyId>],
        step: &Step<'_>,
        state: &mut ContractState,
        ctx: &mut MessageContext,
    ) -> Result<(), ChelError> {
        for payload in ids {
            let Some(opened) = self.open_or_defer(payload, OpType::KeyDel, step, state, ctx)? else {
                continue;
            };
            let id = opened.value;
            let Some(key) = state.vm.authorized_keys.get(&id) else {
                return Err(ChelError::Warning(format!("cannot delete unknown key {id}")));
            };
            if !key.is_active() {
                return Err(ChelError::Warning(format!("key {id} is already revoked")));
            }
            validate_key_del_permissions(&step.signer, key)?;

            let name = key.name.clone();
            let foreign_key = key.foreign_key.clone();
            if let Some(key) = state.vm.authorized_keys.get_mut(&id) {
                key.not_after_height = Some(step.height());
            }
            if let Some(invite) = state.vm.invites.get_mut(&id) {
                invite.status = InviteStatus::Revoked;
            }
            if let Some(reference) = foreign_key {
                unwatch(state, &reference.contract_id, &id);
                ctx.side_effects.push(SideEffect::UnwatchForeignKey {
                    foreign_contract_id: reference.contract_id,
                    key_name: reference.key_name,
                });
            }
            state.volatile.pending_key_revocations.remove(&id);
            if state.volatile.watch.iter().any(|watcher| watcher.key_name == name) {
                ctx.side_effects.push(SideEffect::MirrorKeyDel { key_name: name });
            }
        }
        Ok(())
    }

    pub(super) fn apply_key_update(
        &self,
        updates: &[Payload<KeyUpdate>],
        step: &Step<'_>,
        state: &mut ContractState,
        ctx: &mut MessageContext,
    ) -> Result<(), ChelError> {
        for payload in updates {
            let Some(opened) = self.open_or_defer(payload, OpType::KeyUpdate, step, state, ctx)? else {
                continue;
            };
            let update = opened.value;
            let existing = state
                .vm
                .authorized_keys
                .get(&update.old_key_id)
                .filter(|key| key.is_active())
                .ok_or_else(|| ChelError::InvalidOperation(format!("no active key {} to update", update.old_key_id)))?
                .clone();
            if existing.name != update.name {
                return Err(ChelError::InvalidOperation(format!(
                    "update of {} changes name {} to {}",
                    existing.id, existing.name, update.name
                )));
            }
            validate_key_update_permissions(&step.signer, &existing, &update)?;

            let descriptor = updated_descriptor(&existing, &update)?;
            if update.rotates() {
                if state.vm.authorized_keys.get(&descriptor.id).is_some_and(AuthorizedKey::is_active) {
                    return Err(ChelError::KeyAlreadyExists { key_id: descriptor.id });
                }
                check_key_material(&descriptor)?;
                if let Some(old) = state.vm.authorized_keys.get_mut(&existing.id) {
                    old.not_after_height = Some(step.height());
                }
                let key = AuthorizedKey::from_descriptor(descriptor.clone(), step.height(), Some(step.signer.id.clone()));
                state.vm.authorized_keys.insert(key.id.clone(), key);
                if let Some(invite) = state.vm.invites.remove(&existing.id) {
                    state.vm.invites.insert(descriptor.id.clone(), invite);
                }
                if let Some(reference) = &existing.foreign_key {
                    rewatch(state, &reference.contract_id, &existing.id, &descriptor.id);
                }
            } else if let Some(key) = state.vm.authorized_keys.get_mut(&existing.id) {
                key.purpose.clone_from(&descriptor.purpose);
                key.permissions.clone_from(&descriptor.permissions);
                key.allowed_actions.clone_from(&descriptor.allowed_actions);
                key.meta.clone_from(&descriptor.meta);
            }

            self.store_private_content(&descriptor, step, state, ctx)?;
            state.volatile.pending_key_revocations.remove(&existing.id);
            if state.volatile.watch.iter().any(|watcher| watcher.key_name == existing.name) {
                ctx.side_effects.push(SideEffect::MirrorKeyUpdate { key_name: existing.name.clone() });
            }
        }
        Ok(())
    }

    /// Invites, private key material and foreign-key watches carried by a
    /// newly installed key.
    fn register_key_extras(
        &self,
        descriptor: &KeyDescriptor,
        step: &Step<'_>,
        state: &mut ContractState,
        ctx: &mut MessageContext,
    ) -> Result<(), ChelError> {
        if descriptor.name.starts_with(INVITE_KEY_PREFIX) {
            state.vm.invites.insert(
                descriptor.id.clone(),
                Invite {
                    name: descriptor.name.clone(),
                    status: InviteStatus::Active,
                    quantity: descriptor.meta.quantity,
                    initial_quantity: descriptor.meta.quantity,
                    expires: descriptor.meta.expires,
                },
            );
        }

        self.store_private_content(descriptor, step, state, ctx)?;

        if let Some(reference) = &descriptor.foreign_key {
            let watched = state.vm.pending_watch.entry(reference.contract_id.clone()).or_default();
            watched.retain(|entry| entry.name != reference.key_name);
            watched.push(WatchedKey { name: reference.key_name.clone(), key_id: descriptor.id.clone() });
            let effect = SideEffect::WatchForeignKeys { foreign_contract_id: reference.contract_id.clone() };
            if !ctx.side_effects.contains(&effect) {
                ctx.side_effects.push(effect);
            }
        }
        Ok(())
    }

    /// Decrypt `meta.private.content` into the secret store when possible.
    fn store_private_content(
        &self,
        descriptor: &KeyDescriptor,
        step: &Step<'_>,
        state: &ContractState,
        ctx: &mut MessageContext,
    ) -> Result<(), ChelError> {
        let Some(PrivateKeyMeta { content: Some(content), .. }) = &descriptor.meta.private else {
            return Ok(());
        };
        if self.secrets.contains(&descriptor.id) {
            return Ok(());
        }

        let open_ctx = OpenContext { keys: &state.vm.authorized_keys, secrets: self.secrets, aad: &step.aad };
        let serialized = match open_encrypted(content, &open_ctx) {
            Ok(opened) => opened.value,
            Err(ChelError::DecryptionKeyNotFound { key_id }) => {
                ctx.missing_decryption_key_ids.insert(key_id);
                return Ok(());
            },
            Err(err) => return Err(err),
        };

        let secret = Key::deserialize(&serialized).map_err(|e| ChelError::DecryptionError(e.to_string()))?;
        if KeyId::new(secret.id()) != descriptor.id || !secret.has_secret() {
            return Err(ChelError::InvalidOperation(format!(
                "private content does not hold the secret of key {}",
                descriptor.id
            )));
        }
        self.secrets.insert(secret);
        tracing::debug!(key_id = %descriptor.id, "Stored private key from contract");
        Ok(())
    }
}

/// Key ids must be derived from the public material they describe.
fn check_key_material(descriptor: &KeyDescriptor) -> Result<(), ChelError> {
    let key = Key::deserialize(&descriptor.data)
        .map_err(|e| ChelError::InvalidOperation(format!("key {} has unusable data: {e}", descriptor.id)))?;
    if KeyId::new(key.id()) != descriptor.id {
        return Err(ChelError::InvalidOperation(format!("key id {} does not match its data", descriptor.id)));
    }
    Ok(())
}

fn updated_descriptor(existing: &AuthorizedKey, update: &KeyUpdate) -> Result<KeyDescriptor, ChelError> {
    let mut descriptor = existing.descriptor();
    if update.rotates() {
        let Some(data) = &update.data else {
            return Err(ChelError::InvalidOperation(format!("rotation of {} carries no key data", existing.id)));
        };
        if let Some(id) = &update.id {
            descriptor.id = id.clone();
        }
        descriptor.data.clone_from(data);
    }
    if let Some(purpose) = &update.purpose {
        descriptor.purpose.clone_from(purpose);
    }
    if let Some(permissions) = &update.permissions {
        descriptor.permissions.clone_from(permissions);
    }
    if let Some(allowed_actions) = &update.allowed_actions {
        descriptor.allowed_actions.clone_from(allowed_actions);
    }
    if let Some(meta) = &update.meta {
        descriptor.meta.clone_from(meta);
    }
    Ok(descriptor)
}

fn unwatch(state: &mut ContractState, foreign: &ContractId, key_id: &KeyId) {
    if let Some(watched) = state.vm.pending_watch.get_mut(foreign) {
        watched.retain(|entry| entry.key_id != *key_id);
        if watched.is_empty() {
            state.vm.pending_watch.remove(foreign);
        }
    }
}

fn rewatch(state: &mut ContractState, foreign: &ContractId, old: &KeyId, new: &KeyId) {
    if let Some(watched) = state.vm.pending_watch.get_mut(foreign) {
        for entry in watched.iter_mut().filter(|entry| entry.key_id == *old) {
            entry.key_id = new.clone();
        }
    }
}
