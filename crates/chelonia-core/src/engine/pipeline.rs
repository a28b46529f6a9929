//! Live events and the apply pipeline shared by events, syncs and local
//! publishes.
//!
//! Every message goes through the same steps inside its contract's queue:
//! ordering check, processing on a working copy, log append, commit, side
//! effects. A failure at any step before the append leaves the contract
//! exactly as it was.

use bytes::Bytes;
use chelonia_proto::{ContractId, Direction, Message};

use super::{BoxFuture, Chelonia, Entry, lock, write};
use crate::{
    contract::SideEffectContext,
    env::Environment,
    error::ChelError,
    hooks::guarded,
    ordering::{Ordering, check_message_ordering},
    processor::{MessageContext, Processed},
    queue::contract_key,
    side_effect::SideEffect,
    state::{ContractMeta, ContractState, MirrorKind},
    storage::{LogEntry, Storage, StorageError},
    transport::Transport,
};

/// Where a message entered the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Origin {
    /// Pushed by the relay
    Live,
    /// Read while syncing
    Sync,
    /// Published by this client
    Local,
}

/// What the pipeline did with a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    /// Committed
    Applied,
    /// Already applied; nothing changed
    Duplicate,
    /// Out of order; dropped pending a resync
    Gap,
}

impl<E: Environment, S: Storage, T: Transport> Chelonia<E, S, T> {
    /// Handle a raw message pushed by the relay.
    ///
    /// Events for contracts this client neither holds nor subscribes to are
    /// ignored. Errors are reported to [`crate::Hooks::handle_event_error`]
    /// and returned; work invalidated by [`Chelonia::reset`] is dropped
    /// silently.
    pub async fn handle_event(&self, raw: Bytes) -> Result<(), ChelError> {
        let epoch = self.epoch();
        let message = match Message::deserialize(raw, Direction::Incoming) {
            Ok(message) => message,
            Err(err) => {
                let err = ChelError::from(err);
                tracing::warn!(error = %err, "Dropping undecodable event");
                guarded("handle_event_error", || self.inner.hooks.handle_event_error(&err, None));
                return Err(err);
            },
        };
        let contract_id = message.contract_id().clone();

        let result = self
            .inner
            .queues
            .run(&contract_key(&contract_id), async {
                if !message.is_first_message() && !self.is_known(&contract_id) && !self.is_subscribed(&contract_id) {
                    tracing::debug!(contract_id = %contract_id, height = message.height(), "Ignoring event for unknown contract");
                    return Ok(Outcome::Duplicate);
                }
                self.process_locked(&message, epoch, Origin::Live).await
            })
            .await;

        match result {
            Ok(_) | Err(ChelError::Stale) => Ok(()),
            Err(err) => {
                tracing::error!(
                    contract_id = %contract_id,
                    height = message.height(),
                    hash = %message.hash(),
                    error = %err,
                    "Event handling failed"
                );
                guarded("handle_event_error", || self.inner.hooks.handle_event_error(&err, Some(&contract_id)));
                Err(err)
            },
        }
    }

    /// Order, process, append and commit one message. Must run in the
    /// contract's queue.
    pub(crate) async fn process_locked(&self, message: &Message, epoch: u64, origin: Origin) -> Result<Outcome, ChelError> {
        self.check_epoch(epoch)?;
        let config = &self.inner.config;
        let contract_id = message.contract_id().clone();
        let current = self.entry(&contract_id);

        let strict = config.strict_ordering && origin == Origin::Live;
        match check_message_ordering(current.as_ref().map(|entry| &entry.meta), message, strict)? {
            Ordering::Apply => {},
            Ordering::Duplicate => {
                tracing::debug!(contract_id = %contract_id, height = message.height(), "Ignoring duplicate message");
                return Ok(Outcome::Duplicate);
            },
            Ordering::Gap { expected } => return self.handle_gap(message, expected, origin),
        }

        let base = current.as_ref().map(|entry| entry.state.clone()).unwrap_or_default();
        let processed = self.process_message(message, base)?;

        self.check_epoch(epoch)?;
        let entry = LogEntry {
            hash: message.hash().clone(),
            previous_head: message.previous_head().cloned(),
            height: message.height(),
            raw: message.raw().clone(),
        };
        match self.inner.storage.append_entry(&contract_id, &entry) {
            Ok(()) => {},
            Err(StorageError::AlreadyProcessed { .. }) if !config.strict_ordering => {
                tracing::debug!(contract_id = %contract_id, height = message.height(), "Log already holds message");
                return Ok(Outcome::Duplicate);
            },
            Err(StorageError::AlreadyProcessed { .. }) => {
                return Err(ChelError::AlreadyProcessed { hash: message.hash().clone() });
            },
            Err(StorageError::BadPreviousHead { expected_height, got_height }) => {
                return Err(ChelError::BadPreviousHead { expected: expected_height, got: got_height });
            },
            Err(err) => return Err(err.into()),
        }

        let committed = Entry {
            meta: next_meta(current.as_ref().map(|entry| &entry.meta), message, &processed),
            state: processed.state,
        };

        write(&self.inner.contracts).insert(contract_id.clone(), committed.clone());
        let persisted = self.persist_entry(&contract_id, &committed).and_then(|()| {
            if current.is_none() { self.persist_index() } else { Ok(()) }
        });
        if let Err(err) = persisted {
            tracing::warn!(contract_id = %contract_id, height = message.height(), error = %err, "Failed to persist contract state");
        }
        guarded("state_committed", || {
            self.inner.hooks.state_committed(&contract_id, &committed.meta, &committed.state);
        });

        tracing::debug!(
            contract_id = %contract_id,
            height = message.height(),
            hash = %message.hash(),
            op = %message.op_type().code(),
            "Message applied"
        );

        if !config.skip_side_effects && !processed.context.side_effects.is_empty() {
            self.run_side_effects(message, &committed, processed.context.side_effects, origin).await;
        }
        Ok(Outcome::Applied)
    }

    /// Apply `message` to `base`.
    ///
    /// Outside strict processing a recoverable failure yields `base`
    /// unchanged so the chain can advance past the message.
    pub(crate) fn process_message(&self, message: &Message, base: ContractState) -> Result<Processed, ChelError> {
        match self.processor().process(message, &base) {
            Ok(processed) => Ok(processed),
            Err(err) => {
                tracing::error!(
                    contract_id = %message.contract_id(),
                    height = message.height(),
                    hash = %message.hash(),
                    op = %message.op_type().code(),
                    error = %err,
                    "Message processing failed"
                );
                guarded("process_error", || self.inner.hooks.process_error(&err, message));
                if err.is_unrecoverable() || self.inner.config.strict_processing || message.is_first_message() {
                    return Err(err);
                }
                Ok(Processed { state: base, context: MessageContext::default() })
            },
        }
    }

    fn handle_gap(&self, message: &Message, expected: u64, origin: Origin) -> Result<Outcome, ChelError> {
        let contract_id = message.contract_id();
        if origin == Origin::Sync {
            return Err(ChelError::ForkedChain {
                contract_id: contract_id.clone(),
                reason: format!("relay skipped from height {expected} to {}", message.height()),
            });
        }

        let first = lock(&self.inner.reingest).record(contract_id, message.hash(), self.inner.config.max_reingestions)?;
        tracing::warn!(
            contract_id = %contract_id,
            expected,
            height = message.height(),
            "Message out of order"
        );
        if first {
            self.schedule_resync(contract_id.clone());
        }
        Ok(Outcome::Gap)
    }

    /// Run a forced sync in the background.
    pub(crate) fn schedule_resync(&self, contract_id: ContractId) {
        let this = self.clone();
        self.spawn_background(
            "resync",
            Box::pin(async move {
                let options = super::SyncOptions { force: true, resync: false };
                match this.sync_contract(contract_id.clone(), options).await {
                    Ok(()) | Err(ChelError::Stale) => {},
                    Err(err) => {
                        tracing::warn!(contract_id = %contract_id, error = %err, "Scheduled resync failed");
                        guarded("sync_contract_error", || this.inner.hooks.sync_contract_error(&err, &contract_id));
                    },
                }
            }),
        );
    }

    async fn run_side_effects(&self, message: &Message, committed: &Entry, effects: Vec<SideEffect>, origin: Origin) {
        let contract_id = message.contract_id();

        for effect in effects {
            if skips_side_effect(&effect, false, origin) {
                tracing::trace!(contract_id = %contract_id, effect = effect.label(), "Skipping side effect");
                continue;
            }

            match effect {
                SideEffect::Action { action, data, meta, signing_key_id, inner_signing_key_id } => {
                    let ctx = SideEffectContext {
                        contract_id: contract_id.clone(),
                        action,
                        data,
                        meta,
                        hash: message.hash().clone(),
                        height: message.height(),
                        signing_key_id,
                        inner_signing_key_id,
                        state: committed.state.clone(),
                    };
                    self.run_action_side_effect(message.manifest(), ctx).await;
                },
                other => self.spawn_side_effect(contract_id.clone(), other),
            }
        }
    }

    async fn run_action_side_effect(&self, manifest: &str, ctx: SideEffectContext) {
        let result = match self.inner.registry.get(manifest) {
            Ok(definition) => match definition.handler(&ctx.action) {
                Some(handler) => {
                    handler.side_effect(&ctx).await.map_err(|e| ChelError::action_failed(&ctx.action, e))
                },
                None => Err(ChelError::UnknownAction(ctx.action.clone())),
            },
            Err(err) => Err(err),
        };
        if let Err(err) = result {
            tracing::warn!(
                contract_id = %ctx.contract_id,
                height = ctx.height,
                action = %ctx.action,
                error = %err,
                "Action side effect failed"
            );
            guarded("side_effect_error", || self.inner.hooks.side_effect_error(&err, &ctx.contract_id));
        }
    }

    /// Run an engine side effect in the background.
    pub(crate) fn spawn_side_effect(&self, contract_id: ContractId, effect: SideEffect) {
        let label = effect.label();
        let task: BoxFuture<'static, Result<(), ChelError>> = match effect {
            SideEffect::Action { .. } => return,
            SideEffect::WatchForeignKeys { foreign_contract_id } => {
                self.watch_foreign_keys(contract_id.clone(), foreign_contract_id)
            },
            SideEffect::UnwatchForeignKey { foreign_contract_id, key_name } => {
                self.unwatch_foreign_key(contract_id.clone(), foreign_contract_id, key_name)
            },
            SideEffect::MirrorKeyDel { key_name } => self.mirror_key(contract_id.clone(), key_name, MirrorKind::Del),
            SideEffect::MirrorKeyUpdate { key_name } => {
                self.mirror_key(contract_id.clone(), key_name, MirrorKind::Update)
            },
            SideEffect::RespondToKeyRequest { request_hash } => {
                self.respond_to_key_request(contract_id.clone(), request_hash)
            },
            SideEffect::KeysReceived { target_contract_id, key_ids } => self.keys_received(target_contract_id, key_ids),
            SideEffect::KeyRequestSettled { request_hash, success } => {
                self.key_request_settled(request_hash, success)
            },
        };

        let this = self.clone();
        self.spawn_background(
            label,
            Box::pin(async move {
                match task.await {
                    Ok(()) | Err(ChelError::Stale) => {},
                    Err(err) => {
                        tracing::warn!(contract_id = %contract_id, effect = label, error = %err, "Side effect failed");
                        guarded("side_effect_error", || this.inner.hooks.side_effect_error(&err, &contract_id));
                    },
                }
            }),
        );
    }
}

/// Meta after committing `message` on top of `previous`.
pub(crate) fn next_meta(previous: Option<&ContractMeta>, message: &Message, processed: &Processed) -> ContractMeta {
    let mut missing_decryption_key_ids =
        previous.map(|meta| meta.missing_decryption_key_ids.clone()).unwrap_or_default();
    missing_decryption_key_ids.extend(processed.context.missing_decryption_key_ids.iter().cloned());
    let previous_key_op = match previous {
        Some(meta) if !message.is_key_op() => meta.previous_key_op.clone(),
        _ => message.hash().clone(),
    };
    ContractMeta {
        contract_type: processed.state.vm.contract_type.clone(),
        head: message.hash().clone(),
        height: message.height(),
        previous_key_op,
        missing_decryption_key_ids,
    }
}

/// Whether `effect` is left out. Rebuilds skip effects that already ran
/// the first time; syncs defer watches and key request answers until the
/// contract is caught up.
pub(crate) fn skips_side_effect(effect: &SideEffect, rebuilding: bool, origin: Origin) -> bool {
    match effect {
        SideEffect::Action { .. }
        | SideEffect::MirrorKeyDel { .. }
        | SideEffect::MirrorKeyUpdate { .. }
        | SideEffect::KeyRequestSettled { .. } => rebuilding,
        SideEffect::WatchForeignKeys { .. } | SideEffect::RespondToKeyRequest { .. } => origin == Origin::Sync,
        SideEffect::UnwatchForeignKey { .. } | SideEffect::KeysReceived { .. } => false,
    }
}
