//! Keys and contract definitions for scenarios.

use std::collections::BTreeSet;

use chelonia_core::{
    ActionContext, ActionError, ActionHandler, ContractDefinition, ContractRegistry, Environment,
    processor::INVITE_KEY_PREFIX,
};
use chelonia_crypto::{Key, KeyAlgorithm};
use chelonia_proto::{
    KeyDescriptor, KeyId, KeyMeta, KeyPurpose, OpType, Permission, PrivateKeyMeta, Scope,
};
use serde_json::{Value, json};

/// Contract type of the counter fixture.
pub const COUNTER: &str = "counter";

/// Manifest the counter fixture is published under.
pub const COUNTER_MANIFEST: &str = "counter-manifest-v1";

/// Name of the signing key every fixture contract starts with.
pub const SIGNING_KEY: &str = "csk";

/// Name of the encryption key every fixture contract starts with.
pub const ENCRYPTION_KEY: &str = "cek";

/// A signing and an encryption key pair.
#[derive(Debug, Clone)]
pub struct Identity {
    /// Ed25519 key
    pub signing: Key,
    /// X25519 key
    pub encryption: Key,
}

impl Identity {
    /// Fresh keys drawn from `env`.
    pub fn generate(env: &impl Environment) -> Self {
        Self {
            signing: Key::generate(KeyAlgorithm::Ed25519, env.random_array()),
            encryption: Key::generate(KeyAlgorithm::X25519, env.random_array()),
        }
    }

    /// Id of the signing key.
    #[must_use]
    pub fn signing_id(&self) -> KeyId {
        KeyId::new(self.signing.id())
    }

    /// Id of the encryption key.
    #[must_use]
    pub fn encryption_id(&self) -> KeyId {
        KeyId::new(self.encryption.id())
    }

    /// Root signing key plus a shareable private encryption key.
    #[must_use]
    pub fn contract_keys(&self) -> Vec<KeyDescriptor> {
        let mut encryption = descriptor(&self.encryption, ENCRYPTION_KEY, KeyPurpose::Enc, 0, Scope::All);
        encryption.meta.private = Some(PrivateKeyMeta { content: None, shareable: true });
        vec![descriptor(&self.signing, SIGNING_KEY, KeyPurpose::Sig, 0, Scope::All), encryption]
    }
}

/// Public descriptor of `key`.
#[must_use]
pub fn descriptor(key: &Key, name: &str, purpose: KeyPurpose, ring_level: u32, permissions: Scope<Permission>) -> KeyDescriptor {
    KeyDescriptor {
        id: KeyId::new(key.id()),
        name: name.into(),
        purpose: BTreeSet::from([purpose]),
        ring_level,
        permissions,
        allowed_actions: Scope::All,
        data: key.serialize(false),
        foreign_key: None,
        meta: KeyMeta::default(),
    }
}

/// Member signing key allowed to call actions and nothing else.
#[must_use]
pub fn member_key(key: &Key, name: &str) -> KeyDescriptor {
    let permissions =
        [Permission::outer(OpType::ActionEncrypted), Permission::outer(OpType::ActionUnencrypted)].into_iter().collect();
    descriptor(key, name, KeyPurpose::Sig, 1, permissions)
}

/// Invite key that may post `quantity` key requests.
#[must_use]
pub fn invite_key(key: &Key, label: &str, quantity: Option<u32>, expires: Option<u64>) -> KeyDescriptor {
    let permissions = [Permission::outer(OpType::KeyRequest)].into_iter().collect();
    let mut invite = descriptor(key, &format!("{INVITE_KEY_PREFIX}{label}"), KeyPurpose::Sig, 2, permissions);
    invite.allowed_actions = Scope::none();
    invite.meta.quantity = quantity;
    invite.meta.expires = expires;
    invite
}

struct Increment;

impl ActionHandler for Increment {
    fn validate(&self, data: &Value, _state: &Value, _ctx: &ActionContext<'_>) -> Result<(), ActionError> {
        match data.get("by").and_then(Value::as_u64) {
            Some(by) if by > 0 => Ok(()),
            _ => Err(ActionError::new("`by` must be a positive integer")),
        }
    }

    fn process(&self, data: &Value, state: &mut Value, _ctx: &ActionContext<'_>) -> Result<(), ActionError> {
        let by = data.get("by").and_then(Value::as_u64).unwrap_or(0);
        let count = state.get("count").and_then(Value::as_u64).unwrap_or(0);
        match state.as_object_mut() {
            Some(object) => {
                object.insert("count".into(), json!(count + by));
            },
            None => *state = json!({ "count": count + by }),
        }
        Ok(())
    }
}

struct Note;

impl ActionHandler for Note {
    fn validate(&self, data: &Value, _state: &Value, _ctx: &ActionContext<'_>) -> Result<(), ActionError> {
        if data.get("text").is_some_and(Value::is_string) {
            Ok(())
        } else {
            Err(ActionError::new("`text` must be a string"))
        }
    }

    fn process(&self, data: &Value, state: &mut Value, ctx: &ActionContext<'_>) -> Result<(), ActionError> {
        if !state.is_object() {
            *state = json!({});
        }
        if let Some(object) = state.as_object_mut() {
            let notes = object.entry("notes").or_insert_with(|| json!([]));
            if let Some(notes) = notes.as_array_mut() {
                notes.push(json!({ "text": data["text"], "height": ctx.height }));
            }
        }
        Ok(())
    }
}

fn count(ctx: &chelonia_core::contract::GetterContext<'_>) -> Option<Value> {
    Some(ctx.state().get("count").cloned().unwrap_or(json!(0)))
}

/// Counter contract: `counter/increment {by}` and `counter/note {text}`.
pub fn counter_definition() -> Result<ContractDefinition, chelonia_core::ChelError> {
    Ok(ContractDefinition::new(COUNTER, COUNTER_MANIFEST)
        .action("counter/increment", Increment)?
        .action("counter/note", Note)?
        .getter("count", count))
}

/// Registry holding the counter definition.
pub fn registry() -> Result<ContractRegistry, chelonia_core::ChelError> {
    Ok(ContractRegistry::new().with(counter_definition()?))
}
