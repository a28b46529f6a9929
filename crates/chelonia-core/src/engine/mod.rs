//! The Chelonia engine.
//!
//! Owns every piece of shared state and serializes access to it:
//!
//! - Contract state and meta live in one map. Only tasks running in a
//!   contract's queue replace that contract's entry; everyone else reads
//!   clones.
//! - Incoming events, syncs and local commits for a contract run in its
//!   queue. Publishing waits on the relay in a separate queue.
//! - Background continuations (scheduled resyncs, foreign-key watches, key
//!   request responses, mirroring) are tracked so that [`Chelonia::settle`]
//!   can await them and [`Chelonia::reset`] can abort them.
//! - Every continuation captures the epoch it started in and drops its result
//!   with [`ChelError::Stale`] once the engine has been reset.
//!
//! Functions that background tasks call return [`BoxFuture`] so that the
//! futures stay nameable (and `Send`) across the engine's recursion.

#![allow(clippy::disallowed_types, reason = "Maps and counters are never locked across await")]

mod coordination;
mod key_request;
mod outgoing;
mod pipeline;
mod publish;
mod sync;

use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    future::Future,
    pin::Pin,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
        atomic::{AtomicU64, Ordering},
    },
};

use chelonia_proto::{ContractId, Hash, codec};
pub use key_request::KeyRequestParams;
pub use outgoing::{
    ActionParams, CreateContract, KeyShareParams, action_op, atomic_op, key_add_op, key_del_op, key_share_op, key_update_op,
    prop_del_op, prop_set_op,
};
pub use publish::{OpBuilder, PublishRequest, Signer, fixed_op, genesis_message, op_builder, sign_message};
pub use sync::SyncOptions;
use tokio::task::JoinHandle;

use crate::{
    config::CheloniaConfig,
    contract::ContractRegistry,
    env::Environment,
    error::ChelError,
    hooks::{Hooks, NoopHooks},
    ordering::ReingestTracker,
    processor::Processor,
    queue::{KeyedQueue, contract_key, public_key},
    secrets::SecretKeyStore,
    state::{ContractMeta, ContractState},
    storage::{INDEX_KEY, REFS_KEY, Storage, meta_key, state_key},
    transport::Transport,
};

/// Boxed `Send` future.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Client engine for one identity.
///
/// Cheap to clone; clones share everything.
pub struct Chelonia<E: Environment, S: Storage, T: Transport> {
    inner: Arc<Inner<E, S, T>>,
}

impl<E: Environment, S: Storage, T: Transport> Clone for Chelonia<E, S, T> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

struct Inner<E, S, T> {
    env: E,
    storage: S,
    transport: T,
    config: CheloniaConfig,
    registry: ContractRegistry,
    secrets: SecretKeyStore,
    hooks: Arc<dyn Hooks>,
    epoch: AtomicU64,
    queues: KeyedQueue,
    contracts: RwLock<HashMap<ContractId, Entry>>,
    refs: Mutex<RefCounts>,
    subscriptions: Mutex<HashSet<ContractId>>,
    reingest: Mutex<ReingestTracker>,
    /// Key requests currently being answered
    responding: Mutex<HashSet<Hash>>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

/// Materialized contract.
#[derive(Debug, Clone)]
struct Entry {
    meta: ContractMeta,
    state: ContractState,
}

/// Persistent references survive restarts; ephemeral ones do not.
#[derive(Debug, Default)]
struct RefCounts {
    persistent: BTreeMap<ContractId, u32>,
    ephemeral: HashMap<ContractId, u32>,
}

impl RefCounts {
    fn total(&self, contract_id: &ContractId) -> u32 {
        self.persistent.get(contract_id).copied().unwrap_or(0)
            + self.ephemeral.get(contract_id).copied().unwrap_or(0)
    }

    fn counter(&mut self, ephemeral: bool) -> &mut dyn CounterMap {
        if ephemeral { &mut self.ephemeral } else { &mut self.persistent }
    }
}

trait CounterMap {
    fn increment(&mut self, contract_id: &ContractId) -> u32;
    fn decrement(&mut self, contract_id: &ContractId) -> u32;
}

impl CounterMap for HashMap<ContractId, u32> {
    fn increment(&mut self, contract_id: &ContractId) -> u32 {
        let count = self.entry(contract_id.clone()).or_insert(0);
        *count += 1;
        *count
    }

    fn decrement(&mut self, contract_id: &ContractId) -> u32 {
        let Some(count) = self.get_mut(contract_id) else {
            return 0;
        };
        *count = count.saturating_sub(1);
        let remaining = *count;
        if remaining == 0 {
            self.remove(contract_id);
        }
        remaining
    }
}

impl CounterMap for BTreeMap<ContractId, u32> {
    fn increment(&mut self, contract_id: &ContractId) -> u32 {
        let count = self.entry(contract_id.clone()).or_insert(0);
        *count += 1;
        *count
    }

    fn decrement(&mut self, contract_id: &ContractId) -> u32 {
        let Some(count) = self.get_mut(contract_id) else {
            return 0;
        };
        *count = count.saturating_sub(1);
        let remaining = *count;
        if remaining == 0 {
            self.remove(contract_id);
        }
        remaining
    }
}

/// Builder for [`Chelonia`].
pub struct CheloniaBuilder<E, S, T> {
    env: E,
    storage: S,
    transport: T,
    config: CheloniaConfig,
    registry: ContractRegistry,
    secrets: SecretKeyStore,
    hooks: Arc<dyn Hooks>,
}

impl<E: Environment, S: Storage, T: Transport> CheloniaBuilder<E, S, T> {
    /// Engine configuration.
    #[must_use]
    pub fn config(mut self, config: CheloniaConfig) -> Self {
        self.config = config;
        self
    }

    /// Contract definitions.
    #[must_use]
    pub fn registry(mut self, registry: ContractRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Secret store, when the host shares one between engines.
    #[must_use]
    pub fn secrets(mut self, secrets: SecretKeyStore) -> Self {
        self.secrets = secrets;
        self
    }

    /// Observer hooks.
    #[must_use]
    pub fn hooks(mut self, hooks: impl Hooks) -> Self {
        self.hooks = Arc::new(hooks);
        self
    }

    /// Assemble the engine.
    pub fn build(self) -> Chelonia<E, S, T> {
        Chelonia {
            inner: Arc::new(Inner {
                env: self.env,
                storage: self.storage,
                transport: self.transport,
                config: self.config,
                registry: self.registry,
                secrets: self.secrets,
                hooks: self.hooks,
                epoch: AtomicU64::new(0),
                queues: KeyedQueue::new(),
                contracts: RwLock::default(),
                refs: Mutex::default(),
                subscriptions: Mutex::default(),
                reingest: Mutex::default(),
                responding: Mutex::default(),
                background: Mutex::default(),
            }),
        }
    }
}

impl<E: Environment, S: Storage, T: Transport> Chelonia<E, S, T> {
    /// Start building an engine.
    pub fn builder(env: E, storage: S, transport: T) -> CheloniaBuilder<E, S, T> {
        CheloniaBuilder {
            env,
            storage,
            transport,
            config: CheloniaConfig::default(),
            registry: ContractRegistry::new(),
            secrets: SecretKeyStore::new(),
            hooks: Arc::new(NoopHooks),
        }
    }

    /// Engine with explicit configuration and definitions and no hooks.
    pub fn new(env: E, storage: S, transport: T, config: CheloniaConfig, registry: ContractRegistry) -> Self {
        Self::builder(env, storage, transport).config(config).registry(registry).build()
    }

    /// Locally held secret keys.
    pub fn secrets(&self) -> &SecretKeyStore {
        &self.inner.secrets
    }

    /// Engine configuration.
    pub fn config(&self) -> &CheloniaConfig {
        &self.inner.config
    }

    /// Environment the engine runs in.
    pub fn env(&self) -> &E {
        &self.inner.env
    }

    /// Backing storage.
    pub fn storage(&self) -> &S {
        &self.inner.storage
    }

    /// Snapshot of a contract's state.
    pub fn state(&self, contract_id: &ContractId) -> Option<ContractState> {
        self.read_contracts().get(contract_id).map(|entry| entry.state.clone())
    }

    /// Snapshot of a contract's meta.
    pub fn meta(&self, contract_id: &ContractId) -> Option<ContractMeta> {
        self.read_contracts().get(contract_id).map(|entry| entry.meta.clone())
    }

    /// Materialized contracts.
    pub fn contract_ids(&self) -> BTreeSet<ContractId> {
        self.read_contracts().keys().cloned().collect()
    }

    /// Whether the relay is pushing events for `contract_id`.
    pub fn is_subscribed(&self, contract_id: &ContractId) -> bool {
        lock(&self.inner.subscriptions).contains(contract_id)
    }

    /// Persistent plus ephemeral references held on `contract_id`.
    pub fn references(&self, contract_id: &ContractId) -> u32 {
        lock(&self.inner.refs).total(contract_id)
    }

    /// Current epoch. Work started in an older epoch is discarded.
    pub fn epoch(&self) -> u64 {
        self.inner.epoch.load(Ordering::SeqCst)
    }

    /// Run `task` after all work currently queued for `contract_id`,
    /// without holding up work queued after it.
    pub async fn queue_invocation<F: Future>(&self, contract_id: &ContractId, task: F) -> F::Output {
        self.inner
            .queues
            .run(&public_key(contract_id), async {
                self.inner.queues.run(&contract_key(contract_id), async {}).await;
                task.await
            })
            .await
    }

    /// Reload contracts and persistent references from storage.
    ///
    /// A contract whose cached state does not match its log tip is marked
    /// dirty and rebuilt on its next sync.
    pub fn restore(&self) -> Result<Vec<ContractId>, ChelError> {
        let storage = &self.inner.storage;
        let index: BTreeSet<ContractId> = match storage.get(INDEX_KEY)? {
            Some(bytes) => codec::decode(&bytes)?,
            None => BTreeSet::new(),
        };

        let mut restored = Vec::new();
        for contract_id in index {
            let (Some(meta), Some(state)) = (storage.get(&meta_key(&contract_id))?, storage.get(&state_key(&contract_id))?)
            else {
                tracing::warn!(contract_id = %contract_id, "Indexed contract has no cached state");
                continue;
            };
            let meta: ContractMeta = codec::decode(&meta)?;
            let mut state: ContractState = codec::decode(&state)?;
            let tip = storage.latest_entry(&contract_id)?;
            if tip.as_ref() != Some(&(meta.head.clone(), meta.height)) {
                tracing::warn!(
                    contract_id = %contract_id,
                    height = meta.height,
                    "Cached state does not match log, scheduling rebuild"
                );
                state.volatile.dirty = true;
            }
            state.volatile.resyncing = false;
            write(&self.inner.contracts).insert(contract_id.clone(), Entry { meta, state });
            restored.push(contract_id);
        }

        if let Some(bytes) = storage.get(REFS_KEY)? {
            lock(&self.inner.refs).persistent = codec::decode(&bytes)?;
        }

        tracing::info!(contracts = restored.len(), "Restored contracts from storage");
        Ok(restored)
    }

    /// Await every background continuation, including ones spawned while
    /// waiting.
    pub async fn settle(&self) {
        loop {
            let handles = std::mem::take(&mut *lock(&self.inner.background));
            if handles.is_empty() {
                return;
            }
            for handle in handles {
                if let Err(err) = handle.await
                    && err.is_panic()
                {
                    tracing::error!(error = %err, "Background task panicked");
                }
            }
        }
    }

    /// Forget all in-memory state and invalidate in-flight work.
    ///
    /// Storage is left untouched; [`Chelonia::restore`] reloads it.
    pub fn reset(&self) {
        let epoch = self.inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        for handle in std::mem::take(&mut *lock(&self.inner.background)) {
            handle.abort();
        }
        write(&self.inner.contracts).clear();
        *lock(&self.inner.refs) = RefCounts::default();
        lock(&self.inner.subscriptions).clear();
        lock(&self.inner.reingest).reset();
        lock(&self.inner.responding).clear();
        self.inner.secrets.clear();
        self.inner.queues.prune();
        tracing::info!(epoch, "Engine reset");
    }

    pub(crate) fn check_epoch(&self, epoch: u64) -> Result<(), ChelError> {
        if self.epoch() == epoch { Ok(()) } else { Err(ChelError::Stale) }
    }

    pub(crate) fn processor(&self) -> Processor<'_> {
        Processor::new(&self.inner.registry, &self.inner.secrets)
            .skip_action_processing(self.inner.config.skip_action_processing)
    }

    /// Run a continuation in the background.
    pub(crate) fn spawn_background(&self, label: &'static str, task: BoxFuture<'static, ()>) {
        let handle = tokio::spawn(task);
        let mut background = lock(&self.inner.background);
        background.retain(|handle| !handle.is_finished());
        background.push(handle);
        tracing::trace!(label, pending = background.len(), "Spawned background task");
    }

    fn read_contracts(&self) -> RwLockReadGuard<'_, HashMap<ContractId, Entry>> {
        self.inner.contracts.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn entry(&self, contract_id: &ContractId) -> Option<Entry> {
        self.read_contracts().get(contract_id).cloned()
    }

    fn is_known(&self, contract_id: &ContractId) -> bool {
        self.read_contracts().contains_key(contract_id)
    }

    /// Apply `update` to a contract's volatile state in memory and storage.
    /// Must run in the contract's queue.
    fn update_volatile(&self, contract_id: &ContractId, update: impl FnOnce(&mut ContractState)) -> Result<bool, ChelError> {
        let updated = {
            let mut contracts = write(&self.inner.contracts);
            let Some(entry) = contracts.get_mut(contract_id) else {
                return Ok(false);
            };
            update(&mut entry.state);
            entry.clone()
        };
        self.persist_entry(contract_id, &updated)?;
        Ok(true)
    }

    fn persist_entry(&self, contract_id: &ContractId, entry: &Entry) -> Result<(), ChelError> {
        self.inner.storage.set(&meta_key(contract_id), &codec::encode(&entry.meta)?)?;
        self.inner.storage.set(&state_key(contract_id), &codec::encode(&entry.state)?)?;
        Ok(())
    }

    fn persist_index(&self) -> Result<(), ChelError> {
        let ids = self.contract_ids();
        self.inner.storage.set(INDEX_KEY, &codec::encode(&ids)?)?;
        Ok(())
    }

    fn persist_refs(&self) -> Result<(), ChelError> {
        let encoded = codec::encode(&lock(&self.inner.refs).persistent)?;
        self.inner.storage.set(REFS_KEY, &encoded)?;
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
