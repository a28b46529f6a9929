//! Contract sync.
//!
//! A sync reads the relay's latest head, subscribes, and replays the log from
//! the local height through that head with the same pipeline live events
//! use. A contract marked dirty (or a sync with `resync`) is first rebuilt
//! from genesis out of its durable log, keeping only its watcher list; the
//! rebuilt state replaces the old one only once the whole log has replayed.
//!
//! A local head the relay's chain cannot contain is a fork. It is reported
//! before anything local changes.
//!
//! Syncing an already subscribed, clean contract is a barrier: it waits for
//! everything queued on the contract and returns.

use chelonia_proto::{ContractId, Direction, Message};

use super::{
    BoxFuture, Chelonia, Entry, lock,
    pipeline::{Origin, next_meta, skips_side_effect},
    write,
};
use crate::{
    env::Environment,
    error::ChelError,
    hooks::guarded,
    ordering::check_message_ordering,
    queue::contract_key,
    side_effect::SideEffect,
    state::{ContractMeta, ContractState},
    storage::{Storage, tombstone_key},
    transport::{HeadInfo, Transport, TransportError},
};

/// How hard to sync.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncOptions {
    /// Fetch from the relay even when already subscribed
    pub force: bool,
    /// Rebuild from genesis
    pub resync: bool,
}

impl SyncOptions {
    /// Fetch even when subscribed.
    #[must_use]
    pub fn forced() -> Self {
        Self { force: true, resync: false }
    }

    /// Rebuild from genesis.
    #[must_use]
    pub fn rebuild() -> Self {
        Self { force: true, resync: true }
    }
}

impl<E: Environment, S: Storage, T: Transport> Chelonia<E, S, T> {
    /// Bring `contract_id` up to the relay's head and subscribe to it.
    ///
    /// A contract the relay reports as gone is tombstoned and removed, and
    /// [`ChelError::ResourceGone`] is returned.
    pub fn sync_contract(&self, contract_id: ContractId, options: SyncOptions) -> BoxFuture<'static, Result<(), ChelError>> {
        let this = self.clone();
        Box::pin(async move {
            let epoch = this.epoch();
            let result = this
                .inner
                .queues
                .run(&contract_key(&contract_id), this.sync_locked(&contract_id, options, epoch))
                .await;

            match result {
                Ok(true) => {
                    if !this.inner.config.skip_side_effects {
                        this.after_sync(&contract_id);
                    }
                    Ok(())
                },
                Ok(false) => Ok(()),
                Err(ChelError::ResourceGone(gone)) => {
                    tracing::warn!(contract_id = %gone, "Contract is gone from the relay");
                    this.inner.storage.set(&tombstone_key(&gone), &[1])?;
                    this.remove(gone.clone()).await?;
                    Err(ChelError::ResourceGone(gone))
                },
                Err(err) => Err(err),
            }
        })
    }

    /// Sync several contracts, reporting failures to the hooks and returning
    /// the first.
    pub async fn sync_contracts(&self, contract_ids: &[ContractId], options: SyncOptions) -> Result<(), ChelError> {
        let mut first_error = None;
        for contract_id in contract_ids {
            if let Err(err) = self.sync_contract(contract_id.clone(), options).await {
                guarded("sync_contract_error", || self.inner.hooks.sync_contract_error(&err, contract_id));
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Returns whether anything was fetched.
    async fn sync_locked(&self, contract_id: &ContractId, options: SyncOptions, epoch: u64) -> Result<bool, ChelError> {
        self.check_epoch(epoch)?;
        if self.inner.storage.get(&tombstone_key(contract_id))?.is_some() {
            return Err(ChelError::ResourceGone(contract_id.clone()));
        }

        let current = self.entry(contract_id);
        let dirty = current.as_ref().is_some_and(|entry| entry.state.volatile.dirty);
        let subscribed = self.is_subscribed(contract_id);
        if subscribed && current.is_some() && !options.force && !options.resync && !dirty {
            tracing::trace!(contract_id = %contract_id, "Sync barrier");
            return Ok(false);
        }

        let latest = match self.inner.transport.fetch_latest_head(contract_id).await {
            Ok(latest) => latest,
            Err(TransportError::Gone) => return Err(ChelError::ResourceGone(contract_id.clone())),
            Err(err) => return Err(err.into()),
        };
        self.check_epoch(epoch)?;

        if let Some(entry) = &current {
            check_divergence(contract_id, &entry.meta, &latest)?;
            if options.resync || dirty {
                self.rebuild_locked(contract_id, entry)?;
            }
        }
        if !subscribed {
            self.inner.transport.subscribe(contract_id).await?;
            lock(&self.inner.subscriptions).insert(contract_id.clone());
        }

        let local = self.meta(contract_id);
        if let Some(meta) = &local {
            check_divergence(contract_id, meta, &latest)?;
        }

        let mut since = local.as_ref().map_or(0, |meta| meta.height + 1);
        let mut reached = local.as_ref().is_some_and(|meta| meta.head == latest.head);
        let mut fetched = 0usize;
        while !reached && since <= latest.height {
            let page = self
                .inner
                .transport
                .fetch_events_after(contract_id, since, self.inner.config.sync.page_size)
                .await?;
            self.check_epoch(epoch)?;
            if page.is_empty() {
                break;
            }

            for raw in page {
                let message = Message::deserialize(raw, Direction::Incoming)?;
                if message.contract_id() != contract_id {
                    return Err(ChelError::MalformedMessage(format!(
                        "relay returned a message of {} while syncing {contract_id}",
                        message.contract_id()
                    )));
                }
                self.process_locked(&message, epoch, Origin::Sync).await?;
                fetched += 1;
                since = message.height() + 1;
                if *message.hash() == latest.head {
                    reached = true;
                    break;
                }
            }
        }

        if !reached {
            return Err(ChelError::ForkedChain {
                contract_id: contract_id.clone(),
                reason: format!("latest head {} at height {} was never observed", latest.head, latest.height),
            });
        }

        self.update_volatile(contract_id, |state| {
            state.volatile.dirty = false;
            state.volatile.resyncing = false;
        })?;
        lock(&self.inner.reingest).clear(contract_id);

        tracing::info!(contract_id = %contract_id, height = latest.height, fetched, "Contract synced");
        Ok(true)
    }

    /// Replay the durable log from genesis into a fresh state, keeping only
    /// the watcher list, and swap it in. Must run in the contract's queue.
    ///
    /// The log is read through its tip, so the rebuilt meta always matches
    /// the log. Nothing changes unless every entry replays.
    fn rebuild_locked(&self, contract_id: &ContractId, current: &Entry) -> Result<(), ChelError> {
        tracing::info!(contract_id = %contract_id, height = current.meta.height, "Rebuilding contract from genesis");
        let page_size = self.inner.config.sync.page_size.max(1);
        let mut state = ContractState::rebuilt_from(&current.state);
        let mut meta: Option<ContractMeta> = None;
        let mut effects = Vec::new();

        loop {
            let from = meta.as_ref().map_or(0, |meta| meta.height + 1);
            let page = self.inner.storage.load_entries(contract_id, from, page_size)?;
            if page.is_empty() {
                break;
            }
            for entry in page {
                let message = Message::deserialize(entry.raw, Direction::Incoming)?;
                if *message.hash() != entry.hash || message.contract_id() != contract_id {
                    return Err(ChelError::Unrecoverable(format!(
                        "log entry at height {} of {contract_id} does not match its message",
                        entry.height
                    )));
                }
                check_message_ordering(meta.as_ref(), &message, true)?;
                let processed = self.process_message(&message, state)?;
                meta = Some(next_meta(meta.as_ref(), &message, &processed));
                effects.extend(
                    processed
                        .context
                        .side_effects
                        .into_iter()
                        .filter(|effect| !skips_side_effect(effect, true, Origin::Sync)),
                );
                state = processed.state;
            }
        }

        let Some(meta) = meta else {
            return Err(ChelError::Unrecoverable(format!("no log to rebuild {contract_id} from")));
        };
        if meta.height < current.meta.height {
            tracing::warn!(
                contract_id = %contract_id,
                log_height = meta.height,
                cached_height = current.meta.height,
                "Log ends below cached state, syncing the rest"
            );
        }

        state.volatile.resyncing = false;
        let rebuilt = Entry { meta, state };
        write(&self.inner.contracts).insert(contract_id.clone(), rebuilt.clone());
        if let Err(err) = self.persist_entry(contract_id, &rebuilt) {
            tracing::warn!(contract_id = %contract_id, error = %err, "Failed to persist rebuilt state");
        }
        guarded("state_committed", || {
            self.inner.hooks.state_committed(contract_id, &rebuilt.meta, &rebuilt.state);
        });

        if !self.inner.config.skip_side_effects {
            for effect in effects {
                self.spawn_side_effect(contract_id.clone(), effect);
            }
        }
        tracing::info!(contract_id = %contract_id, height = rebuilt.meta.height, "Contract rebuilt");
        Ok(())
    }

    /// Watches and key requests found in freshly synced state.
    fn after_sync(&self, contract_id: &ContractId) {
        let Some(state) = self.state(contract_id) else {
            return;
        };
        for foreign_contract_id in state.vm.pending_watch.keys() {
            self.spawn_side_effect(
                contract_id.clone(),
                SideEffect::WatchForeignKeys { foreign_contract_id: foreign_contract_id.clone() },
            );
        }
        for request_hash in state.vm.pending_keyshares.keys() {
            self.spawn_side_effect(
                contract_id.clone(),
                SideEffect::RespondToKeyRequest { request_hash: request_hash.clone() },
            );
        }
    }
}

/// Fail unless the local head can lie on the relay's chain ending at
/// `latest`.
fn check_divergence(contract_id: &ContractId, meta: &ContractMeta, latest: &HeadInfo) -> Result<(), ChelError> {
    let diverged = meta.height > latest.height || (meta.height == latest.height && meta.head != latest.head);
    if diverged {
        return Err(ChelError::ForkedChain {
            contract_id: contract_id.clone(),
            reason: format!(
                "local head {} at height {} is not on the relay's chain ending at height {}",
                meta.head, meta.height, latest.height
            ),
        });
    }
    Ok(())
}
