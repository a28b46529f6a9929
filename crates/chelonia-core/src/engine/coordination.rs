//! Cross-contract coordination.
//!
//! - Reference counting: persistent references survive restarts, ephemeral
//!   ones do not. A contract is removed once both reach zero and no other
//!   contract mirrors one of its keys.
//! - Foreign keys: a contract `C` holding a mirror of key `name` of contract
//!   `F` registers itself as a watcher in `F`'s volatile state. Revocations
//!   and rotations of `name` in `F` are then mirrored into `C` with
//!   `OP_KEY_DEL` / `OP_KEY_UPDATE`. Mirroring is best-effort: failures are
//!   logged and never affect `F`.
//! - Key arrival: contracts that could not decrypt something the new keys
//!   open are marked dirty and rebuilt.

use chelonia_proto::{
    ContractId, ForeignKeyRef, Hash, KeyId, KeyPurpose, KeyUpdate, OpType, OpValue, Payload, Permission,
};

use super::{BoxFuture, Chelonia, CounterMap, PublishRequest, Signer, SyncOptions, fixed_op, lock, write};
use crate::{
    env::Environment,
    error::ChelError,
    hooks::guarded,
    keys::{KeyQuery, find_key_by_name, find_suitable_secret_key_id},
    queue::contract_key,
    state::{MirrorKind, Watcher},
    storage::{Storage, meta_key, state_key},
    transport::Transport,
};

impl<E: Environment, S: Storage, T: Transport> Chelonia<E, S, T> {
    /// Take references on contracts, syncing each one.
    ///
    /// A contract that fails to sync is not retained and its error is
    /// returned; contracts earlier in the list stay retained.
    pub async fn retain(&self, contract_ids: &[ContractId], ephemeral: bool) -> Result<(), ChelError> {
        for contract_id in contract_ids {
            lock(&self.inner.refs).counter(ephemeral).increment(contract_id);
            if let Err(err) = self.sync_contract(contract_id.clone(), SyncOptions::default()).await {
                lock(&self.inner.refs).counter(ephemeral).decrement(contract_id);
                return Err(err);
            }
            if !ephemeral {
                self.persist_refs()?;
            }
            tracing::debug!(contract_id = %contract_id, ephemeral, refs = self.references(contract_id), "Retained contract");
        }
        Ok(())
    }

    /// Drop references, removing contracts nobody needs anymore.
    pub async fn release(&self, contract_ids: &[ContractId], ephemeral: bool) -> Result<(), ChelError> {
        for contract_id in contract_ids {
            self.release_one(contract_id.clone(), ephemeral).await?;
        }
        Ok(())
    }

    fn release_one(&self, contract_id: ContractId, ephemeral: bool) -> BoxFuture<'static, Result<(), ChelError>> {
        let this = self.clone();
        Box::pin(async move {
            let remaining = {
                let mut refs = lock(&this.inner.refs);
                refs.counter(ephemeral).decrement(&contract_id);
                refs.total(&contract_id)
            };
            if !ephemeral {
                this.persist_refs()?;
            }
            tracing::debug!(contract_id = %contract_id, ephemeral, refs = remaining, "Released contract");
            if remaining == 0 && !this.is_watched(&contract_id) {
                this.remove(contract_id).await?;
            }
            Ok(())
        })
    }

    /// Whether another contract mirrors one of this contract's keys.
    pub fn is_watched(&self, contract_id: &ContractId) -> bool {
        self.state(contract_id).is_some_and(|state| !state.volatile.watch.is_empty())
    }

    /// Forget a contract: unsubscribe, drop its state and log, and release
    /// the contracts whose keys it mirrors.
    pub fn remove(&self, contract_id: ContractId) -> BoxFuture<'static, Result<(), ChelError>> {
        let this = self.clone();
        Box::pin(async move {
            let epoch = this.epoch();
            let removed = this
                .inner
                .queues
                .run(&contract_key(&contract_id), async {
                    this.check_epoch(epoch)?;
                    let removed = write(&this.inner.contracts).remove(&contract_id);
                    let subscribed = lock(&this.inner.subscriptions).remove(&contract_id);
                    if subscribed && let Err(err) = this.inner.transport.unsubscribe(&contract_id).await {
                        tracing::warn!(contract_id = %contract_id, error = %err, "Unsubscribe failed");
                    }
                    this.inner.storage.delete(&meta_key(&contract_id))?;
                    this.inner.storage.delete(&state_key(&contract_id))?;
                    this.inner.storage.clear_log(&contract_id)?;
                    lock(&this.inner.reingest).clear(&contract_id);
                    this.persist_index()?;
                    Ok::<_, ChelError>(removed)
                })
                .await?;

            let had_persistent = {
                let mut refs = lock(&this.inner.refs);
                refs.ephemeral.remove(&contract_id);
                refs.persistent.remove(&contract_id).is_some()
            };
            if had_persistent {
                this.persist_refs()?;
            }

            let Some(entry) = removed else {
                return Ok(());
            };
            tracing::info!(contract_id = %contract_id, height = entry.meta.height, "Contract removed");

            for foreign_contract_id in entry.state.vm.pending_watch.keys() {
                let released = this.drop_watcher(foreign_contract_id, &contract_id, None).await;
                if let Err(err) = released {
                    tracing::warn!(
                        contract_id = %contract_id,
                        foreign_contract_id = %foreign_contract_id,
                        error = %err,
                        "Failed to release foreign contract"
                    );
                }
            }
            Ok(())
        })
    }

    /// Start mirroring the keys `contract_id` holds from `foreign_contract_id`.
    ///
    /// Drift that happened before the watch was registered is reconciled
    /// right away.
    pub(crate) fn watch_foreign_keys(
        &self,
        contract_id: ContractId,
        foreign_contract_id: ContractId,
    ) -> BoxFuture<'static, Result<(), ChelError>> {
        let this = self.clone();
        Box::pin(async move {
            let epoch = this.epoch();
            let Some(watched) = this.state(&contract_id).and_then(|state| state.vm.pending_watch.get(&foreign_contract_id).cloned())
            else {
                return Ok(());
            };

            let already_watching = this.state(&foreign_contract_id).is_some_and(|state| {
                state.volatile.watch.iter().any(|watcher| watcher.contract_id == contract_id)
            });
            if !already_watching {
                lock(&this.inner.refs).ephemeral.increment(&foreign_contract_id);
            }
            if let Err(err) = this.sync_contract(foreign_contract_id.clone(), SyncOptions::default()).await {
                if !already_watching {
                    lock(&this.inner.refs).ephemeral.decrement(&foreign_contract_id);
                }
                return Err(err);
            }
            this.check_epoch(epoch)?;

            let foreign_state = this
                .inner
                .queues
                .run(&contract_key(&foreign_contract_id), async {
                    this.update_volatile(&foreign_contract_id, |state| {
                        for key in &watched {
                            let watcher = Watcher { key_name: key.name.clone(), contract_id: contract_id.clone() };
                            if !state.volatile.watch.contains(&watcher) {
                                state.volatile.watch.push(watcher);
                            }
                        }
                    })?;
                    Ok::<_, ChelError>(this.state(&foreign_contract_id))
                })
                .await?;
            let Some(foreign_state) = foreign_state else {
                return Ok(());
            };
            tracing::debug!(
                contract_id = %contract_id,
                foreign_contract_id = %foreign_contract_id,
                keys = watched.len(),
                "Watching foreign keys"
            );

            for key in &watched {
                let kind = match find_key_by_name(&foreign_state.vm.authorized_keys, &key.name) {
                    None => MirrorKind::Del,
                    Some(current) if current.id != key.key_id => MirrorKind::Update,
                    Some(_) => continue,
                };
                if let Err(err) = this.mirror_one(&contract_id, &foreign_contract_id, &key.name, kind).await {
                    tracing::warn!(
                        contract_id = %contract_id,
                        foreign_contract_id = %foreign_contract_id,
                        key_name = %key.name,
                        error = %err,
                        "Failed to reconcile foreign key"
                    );
                }
            }
            Ok(())
        })
    }

    /// `contract_id` stopped mirroring `key_name` of `foreign_contract_id`.
    pub(crate) fn unwatch_foreign_key(
        &self,
        contract_id: ContractId,
        foreign_contract_id: ContractId,
        key_name: String,
    ) -> BoxFuture<'static, Result<(), ChelError>> {
        let this = self.clone();
        Box::pin(async move { this.drop_watcher(&foreign_contract_id, &contract_id, Some(&key_name)).await })
    }

    /// Remove `watcher`'s entries (or just the one for `key_name`) from
    /// `foreign_contract_id`, releasing it once `watcher` mirrors nothing
    /// there.
    async fn drop_watcher(
        &self,
        foreign_contract_id: &ContractId,
        watcher: &ContractId,
        key_name: Option<&str>,
    ) -> Result<(), ChelError> {
        let still_watching = self
            .inner
            .queues
            .run(&contract_key(foreign_contract_id), async {
                let mut had_watcher = false;
                let mut still_watching = false;
                self.update_volatile(foreign_contract_id, |state| {
                    had_watcher = state.volatile.watch.iter().any(|entry| entry.contract_id == *watcher);
                    state.volatile.watch.retain(|entry| {
                        entry.contract_id != *watcher || key_name.is_some_and(|name| entry.key_name != name)
                    });
                    still_watching = state.volatile.watch.iter().any(|entry| entry.contract_id == *watcher);
                })?;
                Ok::<_, ChelError>(!had_watcher || still_watching)
            })
            .await?;

        if still_watching {
            return Ok(());
        }
        tracing::debug!(contract_id = %watcher, foreign_contract_id = %foreign_contract_id, "Stopped watching foreign keys");
        self.release_one(foreign_contract_id.clone(), true).await
    }

    /// A watched key of `contract_id` changed; mirror it into every watcher.
    pub(crate) fn mirror_key(
        &self,
        contract_id: ContractId,
        key_name: String,
        kind: MirrorKind,
    ) -> BoxFuture<'static, Result<(), ChelError>> {
        let this = self.clone();
        Box::pin(async move {
            let watchers: Vec<ContractId> = this
                .state(&contract_id)
                .map(|state| {
                    state
                        .volatile
                        .watch
                        .iter()
                        .filter(|watcher| watcher.key_name == key_name)
                        .map(|watcher| watcher.contract_id.clone())
                        .collect()
                })
                .unwrap_or_default();

            for watcher in watchers {
                if let Err(err) = this.mirror_one(&watcher, &contract_id, &key_name, kind).await {
                    tracing::warn!(
                        contract_id = %watcher,
                        foreign_contract_id = %contract_id,
                        key_name = %key_name,
                        error = %err,
                        "Failed to mirror foreign key change"
                    );
                }
            }
            Ok(())
        })
    }

    /// Apply one foreign key change to the local mirror in `contract_id`.
    async fn mirror_one(
        &self,
        contract_id: &ContractId,
        foreign_contract_id: &ContractId,
        key_name: &str,
        kind: MirrorKind,
    ) -> Result<(), ChelError> {
        let Some(state) = self.state(contract_id) else {
            return Ok(());
        };
        let reference = ForeignKeyRef::new(foreign_contract_id.clone(), key_name);
        let Some(local) = state
            .vm
            .authorized_keys
            .values()
            .find(|key| key.is_active() && key.foreign_key.as_ref() == Some(&reference))
            .cloned()
        else {
            return Ok(());
        };
        if state.volatile.pending_key_revocations.get(&local.id) == Some(&kind) {
            tracing::debug!(contract_id = %contract_id, key_id = %local.id, "Mirror already in flight");
            return Ok(());
        }

        let op = match kind {
            MirrorKind::Del => OpValue::KeyDel(vec![Payload::Plain(local.id.clone())]),
            MirrorKind::Update => {
                let foreign = self.state(foreign_contract_id);
                let Some(current) = foreign.as_ref().and_then(|state| find_key_by_name(&state.vm.authorized_keys, key_name))
                else {
                    return Ok(());
                };
                if current.id == local.id {
                    return Ok(());
                }
                OpValue::KeyUpdate(vec![Payload::Plain(KeyUpdate {
                    name: local.name.clone(),
                    old_key_id: local.id.clone(),
                    id: Some(current.id.clone()),
                    data: Some(current.data.clone()),
                    purpose: None,
                    permissions: None,
                    allowed_actions: None,
                    meta: None,
                })])
            },
        };

        let permission = match kind {
            MirrorKind::Del => Permission::outer(OpType::KeyDel),
            MirrorKind::Update => Permission::outer(OpType::KeyUpdate),
        };
        let query = KeyQuery {
            permissions: &[permission],
            purposes: &[KeyPurpose::Sig],
            max_ring_level: Some(local.ring_level),
            allowed_actions: &[],
        };
        let Some(signer) = find_suitable_secret_key_id(&state.vm.authorized_keys, &self.inner.secrets, &query) else {
            tracing::debug!(contract_id = %contract_id, key_id = %local.id, "No local key may mirror this change");
            return Ok(());
        };

        self.set_pending_revocation(contract_id, &local.id, Some(kind)).await?;
        let request = PublishRequest {
            build: fixed_op(op),
            signer: Signer::Key(signer),
            manifest: None,
        };
        match self.publish_op(contract_id, request).await {
            Ok(_) => {
                tracing::info!(
                    contract_id = %contract_id,
                    foreign_contract_id = %foreign_contract_id,
                    key_id = %local.id,
                    kind = ?kind,
                    "Mirrored foreign key change"
                );
                Ok(())
            },
            Err(err) => {
                self.set_pending_revocation(contract_id, &local.id, None).await?;
                Err(err)
            },
        }
    }

    async fn set_pending_revocation(&self, contract_id: &ContractId, key_id: &KeyId, kind: Option<MirrorKind>) -> Result<(), ChelError> {
        self.inner
            .queues
            .run(&contract_key(contract_id), async {
                self.update_volatile(contract_id, |state| match kind {
                    Some(kind) => {
                        state.volatile.pending_key_revocations.insert(key_id.clone(), kind);
                    },
                    None => {
                        state.volatile.pending_key_revocations.remove(key_id);
                    },
                })
            })
            .await
            .map(|_| ())
    }

    /// Secrets for `key_ids` arrived. Rebuild every contract that may hold
    /// data they open.
    ///
    /// A contract that fails to rebuild is reported to the hooks and stays
    /// dirty; the others are still rebuilt.
    pub(crate) fn keys_received(
        &self,
        target_contract_id: ContractId,
        key_ids: Vec<KeyId>,
    ) -> BoxFuture<'static, Result<(), ChelError>> {
        let this = self.clone();
        Box::pin(async move {
            let epoch = this.epoch();
            tracing::info!(contract_id = %target_contract_id, keys = key_ids.len(), "Received secret keys");

            for contract_id in this.contract_ids() {
                let result = match this.mark_for_rebuild(&contract_id, &key_ids, epoch).await {
                    Ok(true) => {
                        tracing::info!(contract_id = %contract_id, "New keys may open past messages, rebuilding");
                        this.sync_contract(contract_id.clone(), SyncOptions::default()).await
                    },
                    Ok(false) => Ok(()),
                    Err(err) => Err(err),
                };

                match result {
                    Ok(()) => {},
                    Err(ChelError::Stale) => return Err(ChelError::Stale),
                    Err(err) => {
                        tracing::warn!(contract_id = %contract_id, error = %err, "Rebuild after new keys failed");
                        guarded("sync_contract_error", || this.inner.hooks.sync_contract_error(&err, &contract_id));
                    },
                }
            }
            Ok(())
        })
    }

    /// Mark `contract_id` dirty when `key_ids` may open messages it has
    /// already applied. Returns whether it was marked.
    async fn mark_for_rebuild(&self, contract_id: &ContractId, key_ids: &[KeyId], epoch: u64) -> Result<bool, ChelError> {
        self.inner
            .queues
            .run(&contract_key(contract_id), async {
                self.check_epoch(epoch)?;
                let Some(entry) = self.entry(contract_id) else {
                    return Ok(false);
                };
                let missed = key_ids.iter().any(|id| entry.meta.missing_decryption_key_ids.contains(id));
                let predates = key_ids.iter().any(|id| {
                    entry.state.vm.authorized_keys.get(id).is_some_and(|key| {
                        key.has_purpose(KeyPurpose::Enc) && key.not_before_height < entry.meta.height
                    })
                });
                if !missed && !predates {
                    return Ok(false);
                }
                self.update_volatile(contract_id, |state| state.volatile.dirty = true)
            })
            .await
    }

    /// A key request was answered, successfully or not.
    pub(crate) fn key_request_settled(&self, request_hash: Hash, success: bool) -> BoxFuture<'static, Result<(), ChelError>> {
        let this = self.clone();
        Box::pin(async move {
            for contract_id in this.contract_ids() {
                let waiting = this.state(&contract_id).is_some_and(|state| {
                    state.volatile.pending_key_requests.iter().any(|pending| pending.hash == request_hash)
                });
                if !waiting {
                    continue;
                }
                this.inner
                    .queues
                    .run(&contract_key(&contract_id), async {
                        this.update_volatile(&contract_id, |state| {
                            state.volatile.pending_key_requests.retain(|pending| pending.hash != request_hash);
                        })
                    })
                    .await?;
                tracing::info!(contract_id = %contract_id, request = %request_hash, success, "Key request settled");
            }
            Ok(())
        })
    }
}
