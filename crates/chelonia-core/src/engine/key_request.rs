//! The key request handshake.
//!
//! Requester side: mirror the target's sharing key into the requester
//! contract so target members may post `OP_KEY_SHARE` there, then post
//! `OP_KEY_REQUEST` on the target signed by an invite key.
//!
//! Responder side: any target member holding shareable secrets answers a
//! pending request with `OP_KEY_SHARE` on the requester contract and settles
//! it with `OP_KEY_REQUEST_SEEN` on the target. Several members may race to
//! answer; the first `OP_KEY_REQUEST_SEEN` wins and later ones are dropped
//! as no-ops.

use std::collections::BTreeSet;

use chelonia_crypto::Key;
use chelonia_proto::{
    Aad, ContractId, ForeignKeyRef, Hash, KeyDescriptor, KeyId, KeyMeta, KeyPurpose, KeyRequestOp, KeyRequestSeenOp,
    OpType, OpValue, Payload, Permission, ReplyWith, Scope,
};

use super::{
    BoxFuture, Chelonia, KeyShareParams, PublishRequest, Signer, SyncOptions, fixed_op, key_share_op, lock,
};
use crate::{
    env::Environment,
    error::ChelError,
    keys::{KeyQuery, find_key_by_name, find_key_id_by_name, find_suitable_secret_key_id},
    queue::contract_key,
    state::{PendingKeyRequest, PendingKeyshare},
    storage::Storage,
    transport::Transport,
    wrappers::{OpenContext, SealContext, sign, verify_signed},
};

/// A request for another contract's shareable keys.
#[derive(Debug, Clone)]
pub struct KeyRequestParams {
    /// Contract the keys are delivered to
    pub requester: ContractId,
    /// Contract whose keys are requested
    pub target: ContractId,
    /// Invite key of the target contract; must include the secret
    pub invite_secret: Key,
    /// Requester key the shared secrets are encrypted to
    pub reply_key_name: String,
    /// Target key that responders sign `OP_KEY_SHARE` with
    pub share_key_name: String,
    /// Requested key set
    pub request: String,
}

impl<E: Environment, S: Storage, T: Transport> Chelonia<E, S, T> {
    /// Ask the members of `params.target` for its shareable keys.
    ///
    /// Returns the hash of the posted `OP_KEY_REQUEST`. The invite use is
    /// consumed as soon as the request is applied, whatever the outcome.
    pub async fn request_keys(&self, params: KeyRequestParams) -> Result<Hash, ChelError> {
        if !params.invite_secret.has_secret() {
            return Err(ChelError::InvalidOperation("invite key has no secret".into()));
        }
        let invite_key_id = KeyId::new(params.invite_secret.id());
        self.inner.secrets.insert(params.invite_secret.clone());
        self.sync_contract(params.target.clone(), SyncOptions::default()).await?;

        let requester = &params.requester;
        let target_state = self.state(&params.target).ok_or_else(|| ChelError::ContractNotFound(params.target.clone()))?;
        let share_key = find_key_by_name(&target_state.vm.authorized_keys, &params.share_key_name)
            .ok_or_else(|| ChelError::InvalidOperation(format!("target has no key named {}", params.share_key_name)))?
            .clone();

        let reference = ForeignKeyRef::new(params.target.clone(), params.share_key_name.clone());
        let requester_state = self.state(requester).ok_or_else(|| ChelError::ContractNotFound(requester.clone()))?;
        let mirrored = requester_state
            .vm
            .authorized_keys
            .values()
            .any(|key| key.is_active() && key.foreign_key.as_ref() == Some(&reference));
        if !mirrored {
            let descriptor = KeyDescriptor {
                id: share_key.id.clone(),
                name: format!("{}/{}", params.target, params.share_key_name),
                purpose: BTreeSet::from([KeyPurpose::Sig]),
                ring_level: u32::MAX,
                permissions: Scope::Only(BTreeSet::from([Permission::outer(OpType::KeyShare)])),
                allowed_actions: Scope::none(),
                data: share_key.data.clone(),
                foreign_key: Some(reference),
                meta: KeyMeta::default(),
            };
            self.key_add(requester, vec![descriptor], None).await?;
        }

        let reply_with = self
            .inner
            .queues
            .run(&contract_key(requester), async { self.sign_reply_with(requester, &params) })
            .await?;
        let (height, reply_with) = reply_with;

        let request = KeyRequestOp { contract_id: requester.clone(), height, reply_with, request: params.request.clone() };
        let hash = self
            .publish_op(
                &params.target,
                PublishRequest::new(fixed_op(OpValue::KeyRequest(Payload::Plain(request)))).signer(Signer::Key(invite_key_id)),
            )
            .await?
            .ok_or_else(|| ChelError::InvalidOperation("key request was rejected locally".into()))?;

        let pending = PendingKeyRequest { contract_id: params.target.clone(), hash: hash.clone(), name: params.reply_key_name };
        self.inner
            .queues
            .run(&contract_key(requester), async {
                self.update_volatile(requester, |state| state.volatile.pending_key_requests.push(pending))
            })
            .await?;

        tracing::info!(requester = %requester, target = %params.target, request = %hash, "Requested keys");
        Ok(hash)
    }

    /// Sign the reply instructions at the requester's current height. Must
    /// run in the requester's queue.
    fn sign_reply_with(
        &self,
        requester: &ContractId,
        params: &KeyRequestParams,
    ) -> Result<(u64, chelonia_proto::SignedEnvelope<ReplyWith>), ChelError> {
        let entry = self.entry(requester).ok_or_else(|| ChelError::ContractNotFound(requester.clone()))?;
        let keys = &entry.state.vm.authorized_keys;
        let encryption_key_id = find_key_id_by_name(keys, &params.reply_key_name)
            .ok_or_else(|| ChelError::InvalidOperation(format!("requester has no key named {}", params.reply_key_name)))?;
        let signing_key_id = find_suitable_secret_key_id(keys, &self.inner.secrets, &KeyQuery {
            purposes: &[KeyPurpose::Sig],
            ..KeyQuery::default()
        })
        .ok_or_else(|| ChelError::PermissionDenied(format!("no held signing key on {requester}")))?;

        let height = entry.meta.height;
        let aad = Aad::new(Some(requester), height);
        let seal = SealContext { keys, secrets: &self.inner.secrets, aad: &aad, rng: &self.inner.env };
        let reply = ReplyWith { encryption_key_id, target_contract_id: params.target.clone() };
        Ok((height, sign(&signing_key_id, &reply, &seal)?))
    }

    /// Answer the pending request `request_hash` on `contract_id`, if this
    /// client can.
    pub(crate) fn respond_to_key_request(
        &self,
        contract_id: ContractId,
        request_hash: Hash,
    ) -> BoxFuture<'static, Result<(), ChelError>> {
        let this = self.clone();
        Box::pin(async move {
            if !lock(&this.inner.responding).insert(request_hash.clone()) {
                return Ok(());
            }
            let result = this.respond(&contract_id, &request_hash).await;
            lock(&this.inner.responding).remove(&request_hash);
            result
        })
    }

    async fn respond(&self, contract_id: &ContractId, request_hash: &Hash) -> Result<(), ChelError> {
        self.sync_contract(contract_id.clone(), SyncOptions::default()).await?;
        let Some(state) = self.state(contract_id) else {
            return Ok(());
        };
        let Some(pending) = state.vm.pending_keyshares.get(request_hash).cloned() else {
            return Ok(());
        };

        let keys = &state.vm.authorized_keys;
        let seen_permission = [Permission::outer(OpType::KeyRequestSeen)];
        let Some(seen_signer) = find_suitable_secret_key_id(keys, &self.inner.secrets, &KeyQuery {
            permissions: &seen_permission,
            purposes: &[KeyPurpose::Sig],
            ..KeyQuery::default()
        }) else {
            tracing::debug!(contract_id = %contract_id, request = %request_hash, "Cannot settle key request");
            return Ok(());
        };

        let expires = state.vm.invites.get(&pending.signing_key_id).and_then(|invite| invite.expires);
        if expires.is_some_and(|expires| self.inner.env.wall_clock_secs() > expires) {
            tracing::info!(contract_id = %contract_id, request = %request_hash, "Key request used an expired invite");
            return self.settle_key_request(contract_id, request_hash, None, false, &seen_signer).await;
        }

        let shareable: Vec<KeyId> = keys
            .values()
            .filter(|key| key.is_active())
            .filter(|key| key.meta.private.as_ref().is_some_and(|private| private.shareable))
            .filter(|key| self.inner.secrets.contains(&key.id))
            .map(|key| key.id.clone())
            .collect();
        if shareable.is_empty() {
            return Ok(());
        }

        match self.deliver_keys(contract_id, request_hash, &pending, shareable).await {
            Ok(share_hash) => self.settle_key_request(contract_id, request_hash, share_hash, true, &seen_signer).await,
            Err(ChelError::Stale) => Err(ChelError::Stale),
            Err(err) => {
                tracing::warn!(
                    contract_id = %contract_id,
                    requester = %pending.requester,
                    request = %request_hash,
                    error = %err,
                    "Failed to share keys"
                );
                self.settle_key_request(contract_id, request_hash, None, false, &seen_signer).await
            },
        }
    }

    /// Post `OP_KEY_SHARE` on the requester contract.
    async fn deliver_keys(
        &self,
        contract_id: &ContractId,
        request_hash: &Hash,
        pending: &PendingKeyshare,
        key_ids: Vec<KeyId>,
    ) -> Result<Option<Hash>, ChelError> {
        let requester = &pending.requester;
        self.retain(std::slice::from_ref(requester), true).await?;
        let result = self.share_with(contract_id, request_hash, pending, key_ids).await;
        if let Err(err) = self.release(std::slice::from_ref(requester), true).await {
            tracing::warn!(contract_id = %requester, error = %err, "Failed to release requester contract");
        }
        result
    }

    async fn share_with(
        &self,
        contract_id: &ContractId,
        request_hash: &Hash,
        pending: &PendingKeyshare,
        key_ids: Vec<KeyId>,
    ) -> Result<Option<Hash>, ChelError> {
        let requester = &pending.requester;
        let requester_state = self.state(requester).ok_or_else(|| ChelError::ContractNotFound(requester.clone()))?;
        let keys = &requester_state.vm.authorized_keys;

        let aad = Aad::new(Some(requester), pending.height);
        let open_ctx = OpenContext { keys, secrets: &self.inner.secrets, aad: &aad };
        let (reply, _) = verify_signed(&pending.reply_with, &open_ctx)?;
        if reply.target_contract_id != *contract_id {
            return Err(ChelError::InvalidOperation(format!(
                "reply instructions are for {}, not {contract_id}",
                reply.target_contract_id
            )));
        }
        let usable = keys
            .get(&reply.encryption_key_id)
            .is_some_and(|key| key.is_active() && key.has_purpose(KeyPurpose::Enc));
        if !usable {
            return Err(ChelError::InvalidOperation(format!(
                "reply key {} is not an active encryption key",
                reply.encryption_key_id
            )));
        }

        let share_permission = [Permission::outer(OpType::KeyShare)];
        let signer = find_suitable_secret_key_id(keys, &self.inner.secrets, &KeyQuery {
            permissions: &share_permission,
            purposes: &[KeyPurpose::Sig],
            ..KeyQuery::default()
        })
        .ok_or_else(|| ChelError::PermissionDenied(format!("no held key may share keys on {requester}")))?;

        let shared = key_ids.len();
        let hash = self
            .publish_op(
                requester,
                PublishRequest::new(key_share_op(KeyShareParams {
                    target_contract_id: contract_id.clone(),
                    key_ids,
                    encrypt_to: reply.encryption_key_id,
                    key_request_hash: Some(request_hash.clone()),
                    key_request_height: Some(pending.request_height),
                }))
                .signer(Signer::Key(signer)),
            )
            .await?;
        tracing::info!(contract_id = %contract_id, requester = %requester, request = %request_hash, shared, "Shared keys");
        Ok(hash)
    }

    async fn settle_key_request(
        &self,
        contract_id: &ContractId,
        request_hash: &Hash,
        key_share_hash: Option<Hash>,
        success: bool,
        signer: &KeyId,
    ) -> Result<(), ChelError> {
        let seen = KeyRequestSeenOp { key_request_hash: request_hash.clone(), key_share_hash, success };
        self.publish_op(
            contract_id,
            PublishRequest::new(fixed_op(OpValue::KeyRequestSeen(Payload::Plain(seen)))).signer(Signer::Key(signer.clone())),
        )
        .await?;
        Ok(())
    }
}
