//! Signing and publishing messages.
//!
//! A publish rebuilds its message on every attempt: the operation is
//! produced by an [`OpBuilder`] against the latest local state, sealed for
//! the next height, signed, and dry-run through the processor. An operation
//! that has become a no-op (a key that already exists, a property that is
//! already gone) is dropped instead of sent.
//!
//! Conflicts (409/412) mean someone else extended the chain first. The
//! publisher backs off with jitter and retries; a second conflict at the same
//! height forces a sync to pick up what the relay has.

use std::{fmt, sync::Arc};

use bytes::Bytes;
use chelonia_crypto::Key;
use chelonia_proto::{
    Aad, ContractId, ContractOp, Hash, KeyId, KeyPurpose, Message, MessageHead, MessageSignature, OpType, OpValue,
    Permission, RawMessage, message::PROTOCOL_VERSION,
};

use super::{Chelonia, SyncOptions, pipeline::Origin};
use crate::{
    env::Environment,
    error::ChelError,
    keys::{KeyQuery, find_suitable_secret_key_id},
    queue::{contract_key, publish_key},
    storage::Storage,
    transport::{Transport, TransportError},
    wrappers::SealContext,
};

/// Produces the operation to publish against the latest state.
///
/// Called once per attempt. Returning `None` drops the publish.
pub type OpBuilder = Arc<dyn Fn(&SealContext<'_>) -> Result<Option<OpValue>, ChelError> + Send + Sync>;

/// Wrap a closure as an [`OpBuilder`].
pub fn op_builder(build: impl Fn(&SealContext<'_>) -> Result<Option<OpValue>, ChelError> + Send + Sync + 'static) -> OpBuilder {
    Arc::new(build)
}

/// Builder for an operation that needs no sealing.
#[must_use]
pub fn fixed_op(op: OpValue) -> OpBuilder {
    op_builder(move |_| Ok(Some(op.clone())))
}

/// Which key signs the message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signer {
    /// This key
    Key(KeyId),
    /// The least privileged held key that may sign the operation and these
    /// actions
    Auto {
        /// Actions the key must allow
        allowed_actions: Vec<String>,
    },
}

impl Default for Signer {
    fn default() -> Self {
        Self::Auto { allowed_actions: Vec::new() }
    }
}

/// An operation to publish.
#[derive(Clone)]
pub struct PublishRequest {
    /// Operation builder
    pub build: OpBuilder,
    /// Signing key choice
    pub signer: Signer,
    /// Manifest to stamp; defaults to the one registered for the contract
    /// type
    pub manifest: Option<String>,
}

impl PublishRequest {
    /// Publish `build`'s operation signed by an automatically chosen key.
    #[must_use]
    pub fn new(build: OpBuilder) -> Self {
        Self { build, signer: Signer::default(), manifest: None }
    }

    /// Sign with `signer`.
    #[must_use]
    pub fn signer(mut self, signer: Signer) -> Self {
        self.signer = signer;
        self
    }
}

impl fmt::Debug for PublishRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublishRequest")
            .field("signer", &self.signer)
            .field("manifest", &self.manifest)
            .finish_non_exhaustive()
    }
}

/// Sign and encode a message.
pub fn sign_message(head: MessageHead, op: OpValue, key: &Key) -> Result<Message, ChelError> {
    let signature = key.sign(&RawMessage::signing_input(&head, &op)?)?;
    let raw = RawMessage {
        head,
        op,
        signature: MessageSignature { key_id: KeyId::new(key.id()), signature: Bytes::copy_from_slice(&signature) },
    };
    Ok(Message::from_raw_message(raw)?)
}

/// Sign a genesis message.
pub fn genesis_message(contract: ContractOp, manifest: &str, key: &Key) -> Result<Message, ChelError> {
    let head = MessageHead {
        version: PROTOCOL_VERSION,
        contract_id: None,
        previous_head: None,
        previous_key_op: None,
        height: 0,
        op: OpType::Contract,
        manifest: manifest.to_owned(),
    };
    sign_message(head, OpValue::Contract(contract), key)
}

/// Outer permissions needed to sign `op`.
fn required_permissions(op: &OpValue, into: &mut Vec<Permission>) {
    let permission = Permission::outer(op.op_type());
    if !into.contains(&permission) {
        into.push(permission);
    }
    if let OpValue::Atomic(ops) = op {
        for op in ops {
            required_permissions(op, into);
        }
    }
}

impl<E: Environment, S: Storage, T: Transport> Chelonia<E, S, T> {
    /// Publish an operation to `contract_id`.
    ///
    /// Returns the hash of the published message, or `None` when the
    /// operation turned out to be a no-op and nothing was sent.
    pub async fn publish_op(&self, contract_id: &ContractId, request: PublishRequest) -> Result<Option<Hash>, ChelError> {
        let epoch = self.epoch();
        self.inner.queues.run(&publish_key(contract_id), self.publish_locked(contract_id, &request, epoch)).await
    }

    async fn publish_locked(&self, contract_id: &ContractId, request: &PublishRequest, epoch: u64) -> Result<Option<Hash>, ChelError> {
        let policy = &self.inner.config.publish;
        let mut last_conflict = None;

        for attempt in 1..=policy.max_attempts {
            self.check_epoch(epoch)?;
            let prepared = self.inner.queues.run(&contract_key(contract_id), async { self.prepare(contract_id, request) }).await?;
            let Some(message) = prepared else {
                tracing::debug!(contract_id = %contract_id, "Operation is a no-op, not publishing");
                return Ok(None);
            };
            let height = message.height();

            match self.inner.transport.publish(contract_id, message.raw().clone()).await {
                Ok(()) => {
                    self.inner
                        .queues
                        .run(&contract_key(contract_id), self.process_locked(&message, epoch, Origin::Local))
                        .await?;
                    tracing::info!(
                        contract_id = %contract_id,
                        height,
                        hash = %message.hash(),
                        op = %message.op_type().code(),
                        attempt,
                        "Published message"
                    );
                    return Ok(Some(message.hash().clone()));
                },
                Err(TransportError::Conflict { status }) => {
                    tracing::warn!(contract_id = %contract_id, height, status, attempt, "Publish conflict");
                    if last_conflict == Some(height) {
                        self.sync_contract(contract_id.clone(), SyncOptions::forced()).await?;
                    }
                    last_conflict = Some(height);
                },
                Err(TransportError::Gone) => return Err(ChelError::ResourceGone(contract_id.clone())),
                Err(err) if err.is_transient() => {
                    tracing::warn!(contract_id = %contract_id, height, attempt, error = %err, "Publish failed, retrying");
                },
                Err(err) => return Err(err.into()),
            }

            if attempt < policy.max_attempts {
                self.inner.env.sleep(policy.backoff(attempt, self.inner.env.random_u64())).await;
            }
        }

        tracing::error!(contract_id = %contract_id, attempts = policy.max_attempts, "Giving up on publish");
        Err(ChelError::PublishFailed { contract_id: contract_id.clone(), attempts: policy.max_attempts })
    }

    /// Build, sign and dry-run the next message. Must run in the contract's
    /// queue.
    fn prepare(&self, contract_id: &ContractId, request: &PublishRequest) -> Result<Option<Message>, ChelError> {
        let entry = self.entry(contract_id).ok_or_else(|| ChelError::ContractNotFound(contract_id.clone()))?;
        let keys = &entry.state.vm.authorized_keys;
        let height = entry.meta.height + 1;
        let aad = Aad::new(Some(contract_id), height);
        let seal = SealContext { keys, secrets: &self.inner.secrets, aad: &aad, rng: &self.inner.env };

        let Some(op) = (request.build)(&seal)? else {
            return Ok(None);
        };

        let signing_key_id = match &request.signer {
            Signer::Key(key_id) => key_id.clone(),
            Signer::Auto { allowed_actions } => {
                let mut permissions = Vec::new();
                required_permissions(&op, &mut permissions);
                let actions: Vec<&str> = allowed_actions.iter().map(String::as_str).collect();
                let query = KeyQuery {
                    permissions: &permissions,
                    purposes: &[KeyPurpose::Sig],
                    max_ring_level: None,
                    allowed_actions: &actions,
                };
                find_suitable_secret_key_id(keys, &self.inner.secrets, &query).ok_or_else(|| {
                    ChelError::PermissionDenied(format!(
                        "no held key may sign {} on {contract_id}",
                        op.op_type().code()
                    ))
                })?
            },
        };
        let key = self
            .inner
            .secrets
            .get(&signing_key_id)
            .ok_or_else(|| ChelError::InvalidOperation(format!("no secret for signing key {signing_key_id}")))?;

        let manifest = match &request.manifest {
            Some(manifest) => manifest.clone(),
            None => self.inner.registry.manifest_for(&entry.meta.contract_type)?.to_owned(),
        };
        let head = MessageHead {
            version: PROTOCOL_VERSION,
            contract_id: Some(contract_id.clone()),
            previous_head: Some(entry.meta.head.clone()),
            previous_key_op: Some(entry.meta.previous_key_op.clone()),
            height,
            op: op.op_type(),
            manifest,
        };
        let message = sign_message(head, op, &key)?;

        let processed = self.processor().process(&message, &entry.state)?;
        match processed.context.skipped {
            None | Some(ChelError::DecryptionKeyNotFound { .. }) => Ok(Some(message)),
            Some(reason) => {
                tracing::debug!(contract_id = %contract_id, height, reason = %reason, "Dropping no-op operation");
                Ok(None)
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use chelonia_proto::{KeyDescriptor, Payload, PropSetOp};

    use super::*;

    #[test]
    fn atomic_needs_permissions_of_every_child() {
        let op = OpValue::Atomic(vec![
            OpValue::PropSet(PropSetOp { key: "a".into(), value: serde_json::json!(1) }),
            OpValue::KeyAdd(Vec::<Payload<KeyDescriptor>>::new()),
            OpValue::PropSet(PropSetOp { key: "b".into(), value: serde_json::json!(2) }),
        ]);
        let mut permissions = Vec::new();
        required_permissions(&op, &mut permissions);
        assert_eq!(permissions, vec![
            Permission::outer(OpType::Atomic),
            Permission::outer(OpType::PropSet),
            Permission::outer(OpType::KeyAdd),
        ]);
    }

    #[test]
    fn signed_message_verifies_against_its_key() {
        let key = Key::generate(chelonia_crypto::KeyAlgorithm::Ed25519, [3; 32]);
        let contract = ContractOp { contract_type: "counter".into(), keys: Vec::new(), nonce: "n".into() };
        let message = genesis_message(contract, "m1", &key).unwrap();

        assert!(message.is_first_message());
        assert_eq!(message.contract_id().genesis_hash(), message.hash());
        key.verify(&message.signing_input().unwrap(), &message.signature().signature).unwrap();
    }
}
