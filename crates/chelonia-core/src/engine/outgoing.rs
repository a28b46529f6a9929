//! Typed publishing helpers.
//!
//! Each operation has a builder function returning an [`OpBuilder`], so
//! operations compose into `OP_ATOMIC`, and a method on [`Chelonia`] that
//! publishes it on its own.

use chelonia_proto::{
    ActionOp, Aad, ContractId, ContractOp, Hash, KeyDescriptor, KeyId, KeyShareOp, KeyUpdate, OpValue, Payload,
    PropDelOp, PropSetOp, SharedKey,
};
use serde_json::Value;

use super::{Chelonia, CounterMap, OpBuilder, PublishRequest, Signer, genesis_message, lock, op_builder, pipeline::Origin};
use crate::{
    env::Environment,
    error::ChelError,
    keys::{AuthorizedKey, KeyTable, find_key_id_by_name},
    queue::contract_key,
    state::ContractState,
    storage::Storage,
    transport::Transport,
    wrappers::{Outgoing, SealContext},
};

/// A new contract.
#[derive(Debug, Clone)]
pub struct CreateContract {
    /// Contract type; must have a registered definition
    pub contract_type: String,
    /// Initial keys
    pub keys: Vec<KeyDescriptor>,
    /// Genesis signing key; its secret must be held
    pub signing_key_id: KeyId,
    /// Name of the initial key that private key material is encrypted to
    pub encrypt_private_to: Option<String>,
}

/// An action call.
#[derive(Debug, Clone, Default)]
pub struct ActionParams {
    /// Namespaced action name
    pub action: String,
    /// Arguments
    pub data: Value,
    /// Metadata checked by the definition's metadata validator
    pub meta: Value,
    /// Encrypt to the active key with this name
    pub encryption_key_name: Option<String>,
    /// Inner-sign with this key
    pub inner_signing_key_id: Option<KeyId>,
    /// Outer signing key; chosen automatically when absent
    pub signing_key_id: Option<KeyId>,
}

/// Secret keys to deliver to a contract.
#[derive(Debug, Clone)]
pub struct KeyShareParams {
    /// Contract the keys belong to
    pub target_contract_id: ContractId,
    /// Keys to share; their secrets must be held
    pub key_ids: Vec<KeyId>,
    /// Key of the destination contract the secrets are encrypted to
    pub encrypt_to: KeyId,
    /// Request being answered
    pub key_request_hash: Option<Hash>,
    /// Height of that request in the target contract
    pub key_request_height: Option<u64>,
}

/// Builder for `OP_ACTION_ENCRYPTED` / `OP_ACTION_UNENCRYPTED`.
#[must_use]
pub fn action_op(params: &ActionParams) -> OpBuilder {
    let value = ActionOp { action: params.action.clone(), data: params.data.clone(), meta: params.meta.clone() };
    let inner = match &params.inner_signing_key_id {
        Some(key_id) => Outgoing::Signed { key_id: key_id.clone(), value },
        None => Outgoing::Plain(value),
    };
    let encryption_key_name = params.encryption_key_name.clone();

    op_builder(move |seal| match &encryption_key_name {
        Some(name) => {
            let key_id = find_key_id_by_name(seal.keys, name)
                .ok_or_else(|| ChelError::InvalidOperation(format!("no active key named {name}")))?;
            let sealed = Outgoing::Encrypted { key_id, inner: Box::new(inner.clone()) }.seal_encrypted(seal)?;
            Ok(Some(OpValue::ActionEncrypted(sealed)))
        },
        None => Ok(Some(OpValue::ActionUnencrypted(inner.seal(seal)?))),
    })
}

/// Builder for `OP_KEY_ADD`. Private keys whose secret is held get their
/// material encrypted to the key named `encrypt_private_to`.
#[must_use]
pub fn key_add_op(keys: Vec<KeyDescriptor>, encrypt_private_to: Option<String>) -> OpBuilder {
    op_builder(move |seal| {
        let keys = keys
            .iter()
            .map(|descriptor| with_private_content(descriptor.clone(), encrypt_private_to.as_deref(), seal).map(Payload::Plain))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Some(OpValue::KeyAdd(keys)))
    })
}

/// Builder for `OP_KEY_DEL`.
#[must_use]
pub fn key_del_op(key_ids: Vec<KeyId>) -> OpBuilder {
    super::fixed_op(OpValue::KeyDel(key_ids.into_iter().map(Payload::Plain).collect()))
}

/// Builder for `OP_KEY_UPDATE`.
#[must_use]
pub fn key_update_op(updates: Vec<KeyUpdate>) -> OpBuilder {
    super::fixed_op(OpValue::KeyUpdate(updates.into_iter().map(Payload::Plain).collect()))
}

/// Builder for `OP_KEY_SHARE`.
#[must_use]
pub fn key_share_op(params: KeyShareParams) -> OpBuilder {
    op_builder(move |seal| {
        let mut keys = Vec::with_capacity(params.key_ids.len());
        for key_id in &params.key_ids {
            let secret = seal
                .secrets
                .get(key_id)
                .ok_or_else(|| ChelError::InvalidOperation(format!("no secret to share for key {key_id}")))?;
            let data = Outgoing::Encrypted {
                key_id: params.encrypt_to.clone(),
                inner: Box::new(Outgoing::Plain(secret.serialize(true))),
            }
            .seal_encrypted(seal)?;
            keys.push(SharedKey { id: key_id.clone(), data });
        }
        Ok(Some(OpValue::KeyShare(Payload::Plain(KeyShareOp {
            contract_id: params.target_contract_id.clone(),
            keys,
            key_request_hash: params.key_request_hash.clone(),
            key_request_height: params.key_request_height,
        }))))
    })
}

/// Builder for `OP_PROP_SET`.
#[must_use]
pub fn prop_set_op(key: impl Into<String>, value: Value) -> OpBuilder {
    super::fixed_op(OpValue::PropSet(PropSetOp { key: key.into(), value }))
}

/// Builder for `OP_PROP_DEL`.
#[must_use]
pub fn prop_del_op(key: impl Into<String>) -> OpBuilder {
    super::fixed_op(OpValue::PropDel(PropDelOp { key: key.into() }))
}

/// Builder for `OP_ATOMIC`. Parts that build to `None` are left out; an
/// atomic with no parts left is dropped.
#[must_use]
pub fn atomic_op(parts: Vec<OpBuilder>) -> OpBuilder {
    op_builder(move |seal| {
        let mut ops = Vec::with_capacity(parts.len());
        for part in &parts {
            if let Some(op) = part(seal)? {
                ops.push(op);
            }
        }
        Ok((!ops.is_empty()).then_some(OpValue::Atomic(ops)))
    })
}

fn with_private_content(
    mut descriptor: KeyDescriptor,
    encrypt_to: Option<&str>,
    seal: &SealContext<'_>,
) -> Result<KeyDescriptor, ChelError> {
    let Some(name) = encrypt_to else {
        return Ok(descriptor);
    };
    let Some(private) = descriptor.meta.private.as_mut().filter(|private| private.content.is_none()) else {
        return Ok(descriptor);
    };
    let Some(secret) = seal.secrets.get(&descriptor.id) else {
        return Ok(descriptor);
    };
    let key_id = find_key_id_by_name(seal.keys, name)
        .ok_or_else(|| ChelError::InvalidOperation(format!("no active key named {name}")))?;
    let content = Outgoing::Encrypted { key_id, inner: Box::new(Outgoing::Plain(secret.serialize(true))) }
        .seal_encrypted(seal)?;
    private.content = Some(content);
    Ok(descriptor)
}

impl<E: Environment, S: Storage, T: Transport> Chelonia<E, S, T> {
    /// Create and publish a new contract, subscribe to it, and take a
    /// persistent reference on it.
    pub async fn create_contract(&self, params: CreateContract) -> Result<ContractId, ChelError> {
        let epoch = self.epoch();
        let manifest = self.inner.registry.manifest_for(&params.contract_type)?.to_owned();
        let signer = self.inner.secrets.get(&params.signing_key_id).ok_or_else(|| {
            ChelError::InvalidOperation(format!("no secret for signing key {}", params.signing_key_id))
        })?;

        let table: KeyTable = params
            .keys
            .iter()
            .map(|descriptor| (descriptor.id.clone(), AuthorizedKey::from_descriptor(descriptor.clone(), 0, None)))
            .collect();
        let aad = Aad::new(None, 0);
        let seal = SealContext { keys: &table, secrets: &self.inner.secrets, aad: &aad, rng: &self.inner.env };
        let keys = params
            .keys
            .into_iter()
            .map(|descriptor| with_private_content(descriptor, params.encrypt_private_to.as_deref(), &seal).map(Payload::Plain))
            .collect::<Result<Vec<_>, _>>()?;

        let nonce = format!("{:016x}{:016x}", self.inner.env.random_u64(), self.inner.env.random_u64());
        let contract = ContractOp { contract_type: params.contract_type, keys, nonce };
        let message = genesis_message(contract, &manifest, &signer)?;
        self.processor().process(&message, &ContractState::default())?;

        let contract_id = message.contract_id().clone();
        self.inner.transport.publish(&contract_id, message.raw().clone()).await?;
        self.check_epoch(epoch)?;
        self.inner.transport.subscribe(&contract_id).await?;
        lock(&self.inner.subscriptions).insert(contract_id.clone());

        self.inner
            .queues
            .run(&contract_key(&contract_id), self.process_locked(&message, epoch, Origin::Local))
            .await?;
        lock(&self.inner.refs).persistent.increment(&contract_id);
        self.persist_refs()?;

        tracing::info!(contract_id = %contract_id, contract_type = %message_type(&message), "Published new contract");
        Ok(contract_id)
    }

    /// Call an action.
    pub async fn action(&self, contract_id: &ContractId, params: ActionParams) -> Result<Option<Hash>, ChelError> {
        let signer = match &params.signing_key_id {
            Some(key_id) => Signer::Key(key_id.clone()),
            None => Signer::Auto { allowed_actions: vec![params.action.clone()] },
        };
        self.publish_op(contract_id, PublishRequest::new(action_op(&params)).signer(signer)).await
    }

    /// Add keys.
    pub async fn key_add(
        &self,
        contract_id: &ContractId,
        keys: Vec<KeyDescriptor>,
        encrypt_private_to: Option<String>,
    ) -> Result<Option<Hash>, ChelError> {
        self.publish_op(contract_id, PublishRequest::new(key_add_op(keys, encrypt_private_to))).await
    }

    /// Revoke keys.
    pub async fn key_del(&self, contract_id: &ContractId, key_ids: Vec<KeyId>) -> Result<Option<Hash>, ChelError> {
        self.publish_op(contract_id, PublishRequest::new(key_del_op(key_ids))).await
    }

    /// Rotate or amend keys.
    pub async fn key_update(&self, contract_id: &ContractId, updates: Vec<KeyUpdate>) -> Result<Option<Hash>, ChelError> {
        self.publish_op(contract_id, PublishRequest::new(key_update_op(updates))).await
    }

    /// Deliver secret keys to `contract_id`.
    pub async fn key_share(&self, contract_id: &ContractId, params: KeyShareParams) -> Result<Option<Hash>, ChelError> {
        self.publish_op(contract_id, PublishRequest::new(key_share_op(params))).await
    }

    /// Set a property.
    pub async fn prop_set(&self, contract_id: &ContractId, key: &str, value: Value) -> Result<Option<Hash>, ChelError> {
        self.publish_op(contract_id, PublishRequest::new(prop_set_op(key, value))).await
    }

    /// Delete a property.
    pub async fn prop_del(&self, contract_id: &ContractId, key: &str) -> Result<Option<Hash>, ChelError> {
        self.publish_op(contract_id, PublishRequest::new(prop_del_op(key))).await
    }

    /// Publish several operations as one `OP_ATOMIC`.
    pub async fn atomic(&self, contract_id: &ContractId, parts: Vec<OpBuilder>, signer: Signer) -> Result<Option<Hash>, ChelError> {
        self.publish_op(contract_id, PublishRequest::new(atomic_op(parts)).signer(signer)).await
    }
}

fn message_type(message: &chelonia_proto::Message) -> &str {
    match message.op() {
        OpValue::Contract(contract) => &contract.contract_type,
        _ => "",
    }
}
