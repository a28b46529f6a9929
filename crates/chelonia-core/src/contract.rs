//! Contract definitions: actions, getters and the manifest registry.
//!
//! A definition is looked up by the manifest hash carried in each message
//! head. Action names are namespaced by contract type (`<type>/<name>`);
//! registering an action outside the namespace is refused.
//!
//! `validate` and `process` are synchronous and must be deterministic: every
//! client runs them on the same inputs and must reach the same state.
//! `side_effect` runs after the new state is committed, once per client, and
//! may talk to the outside world.

use std::{
    cell::RefCell,
    collections::{BTreeMap, HashMap, HashSet},
    fmt,
    sync::Arc,
};

use async_trait::async_trait;
use chelonia_proto::{ContractId, Hash, KeyId};
use serde_json::Value;

use crate::{error::ChelError, state::ContractState};

/// Error returned by contract handlers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct ActionError(pub String);

impl ActionError {
    /// Build from any message.
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Information about the action being applied.
#[derive(Debug, Clone)]
pub struct ActionContext<'a> {
    /// Contract the action is applied to
    pub contract_id: &'a ContractId,
    /// Message hash
    pub hash: &'a Hash,
    /// Message height
    pub height: u64,
    /// Outer signing key
    pub signing_key_id: &'a KeyId,
    /// Inner signing key, if the action was inner-signed
    pub inner_signing_key_id: Option<&'a KeyId>,
    /// Action metadata
    pub meta: &'a Value,
    /// Getters bound to the contract definition
    pub getters: &'a GetterTable,
}

/// Context handed to side effects.
///
/// `state` is a disposable copy taken after commit; changes to it are
/// discarded.
#[derive(Debug, Clone)]
pub struct SideEffectContext {
    /// Contract the action was applied to
    pub contract_id: ContractId,
    /// Action name
    pub action: String,
    /// Action arguments
    pub data: Value,
    /// Action metadata
    pub meta: Value,
    /// Message hash
    pub hash: Hash,
    /// Message height
    pub height: u64,
    /// Outer signing key
    pub signing_key_id: KeyId,
    /// Inner signing key
    pub inner_signing_key_id: Option<KeyId>,
    /// Committed state copy
    pub state: ContractState,
}

/// One contract action.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    /// Reject invalid arguments. Must not depend on anything but its inputs.
    fn validate(&self, data: &Value, state: &Value, ctx: &ActionContext<'_>) -> Result<(), ActionError>;

    /// Apply the action to the contract state.
    fn process(&self, data: &Value, state: &mut Value, ctx: &ActionContext<'_>) -> Result<(), ActionError>;

    /// Whether [`ActionHandler::side_effect`] should be scheduled.
    fn has_side_effect(&self) -> bool {
        false
    }

    /// Runs after commit.
    async fn side_effect(&self, _ctx: &SideEffectContext) -> Result<(), ActionError> {
        Ok(())
    }
}

/// Derived-value function.
pub type Getter = fn(&GetterContext<'_>) -> Option<Value>;

/// Named getters of a definition.
pub type GetterTable = BTreeMap<String, Getter>;

/// Validates action metadata.
pub type MetadataValidator = fn(&Value) -> Result<(), ActionError>;

/// Evaluates getters against one state, memoizing results.
pub struct GetterContext<'a> {
    state: &'a Value,
    getters: &'a GetterTable,
    cache: RefCell<HashMap<String, Option<Value>>>,
    evaluating: RefCell<HashSet<String>>,
}

impl<'a> GetterContext<'a> {
    /// Bind `getters` to `state`.
    #[must_use]
    pub fn new(state: &'a Value, getters: &'a GetterTable) -> Self {
        Self { state, getters, cache: RefCell::default(), evaluating: RefCell::default() }
    }

    /// Contract state.
    #[must_use]
    pub fn state(&self) -> &Value {
        self.state
    }

    /// Evaluate a getter. Unknown getters and cycles yield `None`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Value> {
        if let Some(cached) = self.cache.borrow().get(name) {
            return cached.clone();
        }
        let getter = self.getters.get(name)?;
        if !self.evaluating.borrow_mut().insert(name.to_owned()) {
            return None;
        }
        let value = getter(self);
        self.evaluating.borrow_mut().remove(name);
        self.cache.borrow_mut().insert(name.to_owned(), value.clone());
        value
    }
}

impl fmt::Debug for GetterContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GetterContext").field("getters", &self.getters.keys().collect::<Vec<_>>()).finish()
    }
}

/// A contract type at one manifest version.
#[derive(Clone)]
pub struct ContractDefinition {
    name: String,
    manifest: String,
    actions: BTreeMap<String, Arc<dyn ActionHandler>>,
    getters: GetterTable,
    metadata_validator: Option<MetadataValidator>,
}

impl ContractDefinition {
    /// Definition for contract type `name` published under `manifest`.
    pub fn new(name: impl Into<String>, manifest: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            manifest: manifest.into(),
            actions: BTreeMap::new(),
            getters: GetterTable::new(),
            metadata_validator: None,
        }
    }

    /// Register an action. `action` must be `<name>/<something>`.
    pub fn action(mut self, action: impl Into<String>, handler: impl ActionHandler + 'static) -> Result<Self, ChelError> {
        let action = action.into();
        let prefix = format!("{}/", self.name);
        if !action.starts_with(&prefix) || action.len() == prefix.len() {
            return Err(ChelError::UnknownAction(format!("{action} is outside namespace {prefix}")));
        }
        self.actions.insert(action, Arc::new(handler));
        Ok(self)
    }

    /// Register a getter.
    #[must_use]
    pub fn getter(mut self, name: impl Into<String>, getter: Getter) -> Self {
        self.getters.insert(name.into(), getter);
        self
    }

    /// Install a metadata validator.
    #[must_use]
    pub fn metadata(mut self, validator: MetadataValidator) -> Self {
        self.metadata_validator = Some(validator);
        self
    }

    /// Contract type.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Manifest hash.
    #[must_use]
    pub fn manifest(&self) -> &str {
        &self.manifest
    }

    /// Handler for `action`.
    #[must_use]
    pub fn handler(&self, action: &str) -> Option<Arc<dyn ActionHandler>> {
        self.actions.get(action).cloned()
    }

    /// Getter table.
    #[must_use]
    pub fn getters(&self) -> &GetterTable {
        &self.getters
    }

    /// Validate action metadata.
    pub fn validate_metadata(&self, meta: &Value) -> Result<(), ActionError> {
        self.metadata_validator.map_or(Ok(()), |validate| validate(meta))
    }
}

impl fmt::Debug for ContractDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContractDefinition")
            .field("name", &self.name)
            .field("manifest", &self.manifest)
            .field("actions", &self.actions.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

/// Definitions by manifest hash.
#[derive(Debug, Clone, Default)]
pub struct ContractRegistry {
    by_manifest: HashMap<String, Arc<ContractDefinition>>,
    /// Manifest most recently registered for each contract type
    latest: HashMap<String, String>,
}

impl ContractRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a definition, replacing any previous one for its manifest.
    pub fn register(&mut self, definition: ContractDefinition) {
        self.latest.insert(definition.name.clone(), definition.manifest.clone());
        self.by_manifest.insert(definition.manifest.clone(), Arc::new(definition));
    }

    /// Builder-style [`ContractRegistry::register`].
    #[must_use]
    pub fn with(mut self, definition: ContractDefinition) -> Self {
        self.register(definition);
        self
    }

    /// Definition for `manifest`.
    pub fn get(&self, manifest: &str) -> Result<Arc<ContractDefinition>, ChelError> {
        self.by_manifest.get(manifest).cloned().ok_or_else(|| ChelError::ManifestNotFound(manifest.to_owned()))
    }

    /// Manifest new messages for `contract_type` are published with.
    pub fn manifest_for(&self, contract_type: &str) -> Result<&str, ChelError> {
        self.latest
            .get(contract_type)
            .map(String::as_str)
            .ok_or_else(|| ChelError::ManifestNotFound(format!("no definition for contract type {contract_type}")))
    }
}
