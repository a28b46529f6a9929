//! In-memory relay.
//!
//! Keeps every contract's log, accepts a message only if it extends the
//! current head (409 on a height race, 412 on a wrong previous head), and
//! pushes accepted messages to every subscriber, the publisher included.
//!
//! Faults are injected explicitly by tests: dropped pushes to one client,
//! transient publish failures, spurious conflicts, deleted contracts and
//! rewritten history.

#![allow(clippy::disallowed_types, reason = "Relay state is never locked across await")]

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use bytes::Bytes;
use chelonia_core::{HeadInfo, TransportError};
use chelonia_proto::{ContractId, Direction, Hash, Message};
use tokio::sync::mpsc::UnboundedSender;

/// Identifier of a connected simulated client.
pub type ClientId = u64;

/// Relay shared by every simulated client.
pub type SharedSimServer = Arc<SimServer>;

/// Create a relay behind an `Arc`.
#[must_use]
pub fn create_shared_server() -> SharedSimServer {
    Arc::new(SimServer::default())
}

#[derive(Default)]
struct RelayState {
    logs: HashMap<ContractId, Vec<(Hash, Bytes)>>,
    gone: HashSet<ContractId>,
    subscribers: HashMap<ContractId, BTreeMap<ClientId, UnboundedSender<Bytes>>>,
    connections: BTreeMap<ClientId, UnboundedSender<Bytes>>,
    next_client: ClientId,
    faults: Faults,
    published: usize,
}

#[derive(Default)]
struct Faults {
    dropped_pushes: HashMap<ClientId, u32>,
    network_failures: u32,
    conflicts: u32,
}

/// Simulated relay.
#[derive(Default)]
pub struct SimServer {
    state: Mutex<RelayState>,
}

impl SimServer {
    fn state(&self) -> MutexGuard<'_, RelayState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a client whose pushes go to `sender`.
    pub fn connect(&self, sender: UnboundedSender<Bytes>) -> ClientId {
        let mut state = self.state();
        state.next_client += 1;
        let client = state.next_client;
        state.connections.insert(client, sender);
        client
    }

    /// Accept `raw` if it extends `contract_id`'s log.
    pub fn publish(&self, contract_id: &ContractId, raw: Bytes) -> Result<(), TransportError> {
        let mut state = self.state();
        if state.faults.network_failures > 0 {
            state.faults.network_failures -= 1;
            return Err(TransportError::Network("injected failure".into()));
        }
        if state.faults.conflicts > 0 {
            state.faults.conflicts -= 1;
            return Err(TransportError::Conflict { status: 409 });
        }
        if state.gone.contains(contract_id) {
            return Err(TransportError::Gone);
        }

        let message =
            Message::deserialize(raw.clone(), Direction::Incoming).map_err(|e| TransportError::Rejected(e.to_string()))?;
        if message.contract_id() != contract_id {
            return Err(TransportError::Rejected(format!("message belongs to {}", message.contract_id())));
        }

        match state.logs.get(contract_id) {
            None if message.is_first_message() => {},
            None => return Err(TransportError::NotFound),
            Some(_) if message.is_first_message() => return Err(TransportError::Conflict { status: 409 }),
            Some(log) => {
                if message.height() != log.len() as u64 {
                    return Err(TransportError::Conflict { status: 409 });
                }
                if message.previous_head() != log.last().map(|(hash, _)| hash) {
                    return Err(TransportError::Conflict { status: 412 });
                }
            },
        }

        state.logs.entry(contract_id.clone()).or_default().push((message.hash().clone(), raw.clone()));
        state.published += 1;
        tracing::trace!(contract_id = %contract_id, height = message.height(), "Relay accepted message");
        Self::push(&mut state, contract_id, &raw);
        Ok(())
    }

    fn push(state: &mut RelayState, contract_id: &ContractId, raw: &Bytes) {
        let Some(subscribers) = state.subscribers.get(contract_id) else {
            return;
        };
        let targets: Vec<(ClientId, UnboundedSender<Bytes>)> =
            subscribers.iter().map(|(client, sender)| (*client, sender.clone())).collect();
        for (client, sender) in targets {
            if let Some(remaining) = state.faults.dropped_pushes.get_mut(&client)
                && *remaining > 0
            {
                *remaining -= 1;
                tracing::debug!(client, contract_id = %contract_id, "Relay dropped push");
                continue;
            }
            // A closed inbox means the client went away.
            let _ = sender.send(raw.clone());
        }
    }

    /// Messages with height `>= since_height`.
    pub fn events_after(&self, contract_id: &ContractId, since_height: u64, limit: usize) -> Result<Vec<Bytes>, TransportError> {
        let state = self.state();
        let log = Self::log(&state, contract_id)?;
        Ok(log.iter().skip(since_height as usize).take(limit).map(|(_, raw)| raw.clone()).collect())
    }

    /// Current head.
    pub fn latest_head(&self, contract_id: &ContractId) -> Result<HeadInfo, TransportError> {
        let state = self.state();
        let log = Self::log(&state, contract_id)?;
        let (head, _) = log.last().ok_or(TransportError::NotFound)?;
        Ok(HeadInfo { head: head.clone(), height: log.len() as u64 - 1 })
    }

    fn log<'a>(state: &'a RelayState, contract_id: &ContractId) -> Result<&'a Vec<(Hash, Bytes)>, TransportError> {
        if state.gone.contains(contract_id) {
            return Err(TransportError::Gone);
        }
        state.logs.get(contract_id).ok_or(TransportError::NotFound)
    }

    /// Push future messages of `contract_id` to `client`.
    pub fn subscribe(&self, client: ClientId, contract_id: &ContractId) -> Result<(), TransportError> {
        let mut state = self.state();
        if state.gone.contains(contract_id) {
            return Err(TransportError::Gone);
        }
        let sender = state
            .connections
            .get(&client)
            .cloned()
            .ok_or_else(|| TransportError::Network(format!("client {client} is not connected")))?;
        state.subscribers.entry(contract_id.clone()).or_default().insert(client, sender);
        Ok(())
    }

    /// Stop pushing `contract_id` to `client`.
    pub fn unsubscribe(&self, client: ClientId, contract_id: &ContractId) {
        let mut state = self.state();
        if let Some(subscribers) = state.subscribers.get_mut(contract_id) {
            subscribers.remove(&client);
        }
    }

    /// Whether `client` receives pushes for `contract_id`.
    #[must_use]
    pub fn is_subscribed(&self, client: ClientId, contract_id: &ContractId) -> bool {
        self.state().subscribers.get(contract_id).is_some_and(|subscribers| subscribers.contains_key(&client))
    }

    /// Skip the next `count` pushes to `client`.
    pub fn drop_next_pushes(&self, client: ClientId, count: u32) {
        *self.state().faults.dropped_pushes.entry(client).or_insert(0) += count;
    }

    /// Fail the next `count` publishes with a network error.
    pub fn fail_next_publishes(&self, count: u32) {
        self.state().faults.network_failures += count;
    }

    /// Answer the next `count` publishes with a 409.
    pub fn conflict_next_publishes(&self, count: u32) {
        self.state().faults.conflicts += count;
    }

    /// Delete a contract; every later request about it answers "gone".
    pub fn delete_contract(&self, contract_id: &ContractId) {
        let mut state = self.state();
        state.logs.remove(contract_id);
        state.subscribers.remove(contract_id);
        state.gone.insert(contract_id.clone());
    }

    /// Cut a contract's log back to its first `len` messages.
    pub fn truncate(&self, contract_id: &ContractId, len: usize) {
        if let Some(log) = self.state().logs.get_mut(contract_id) {
            log.truncate(len);
        }
    }

    /// Push `raw` to subscribers of `contract_id` without storing it.
    pub fn inject_push(&self, contract_id: &ContractId, raw: &Bytes) {
        Self::push(&mut self.state(), contract_id, raw);
    }

    /// Raw message at `height`.
    #[must_use]
    pub fn message_at(&self, contract_id: &ContractId, height: u64) -> Option<Bytes> {
        self.state().logs.get(contract_id)?.get(height as usize).map(|(_, raw)| raw.clone())
    }

    /// Number of messages in a contract's log.
    #[must_use]
    pub fn log_len(&self, contract_id: &ContractId) -> usize {
        self.state().logs.get(contract_id).map_or(0, Vec::len)
    }

    /// Messages accepted since the relay started.
    #[must_use]
    pub fn published(&self) -> usize {
        self.state().published
    }
}

#[cfg(test)]
mod tests {
    use chelonia_core::genesis_message;
    use chelonia_crypto::{Key, KeyAlgorithm};
    use chelonia_proto::ContractOp;
    use tokio::sync::mpsc;

    use super::*;

    fn genesis(seed: u8) -> Message {
        let key = Key::generate(KeyAlgorithm::Ed25519, [seed; 32]);
        let contract = ContractOp { contract_type: "counter".into(), keys: Vec::new(), nonce: seed.to_string() };
        genesis_message(contract, "m", &key).unwrap()
    }

    #[test]
    fn genesis_twice_is_a_conflict() {
        let server = SimServer::default();
        let message = genesis(1);
        let contract_id = message.contract_id().clone();

        server.publish(&contract_id, message.raw().clone()).unwrap();
        assert_eq!(server.publish(&contract_id, message.raw().clone()), Err(TransportError::Conflict { status: 409 }));
        assert_eq!(server.latest_head(&contract_id).unwrap().height, 0);
    }

    #[test]
    fn subscribers_receive_accepted_messages() {
        let server = SimServer::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let client = server.connect(tx);
        let message = genesis(2);
        let contract_id = message.contract_id().clone();

        server.subscribe(client, &contract_id).unwrap();
        server.publish(&contract_id, message.raw().clone()).unwrap();
        assert_eq!(rx.try_recv().unwrap(), *message.raw());

        server.drop_next_pushes(client, 1);
        server.inject_push(&contract_id, message.raw());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn deleted_contract_is_gone() {
        let server = SimServer::default();
        let message = genesis(3);
        let contract_id = message.contract_id().clone();
        server.publish(&contract_id, message.raw().clone()).unwrap();

        server.delete_contract(&contract_id);
        assert_eq!(server.latest_head(&contract_id), Err(TransportError::Gone));
        assert_eq!(server.events_after(&contract_id, 0, 10), Err(TransportError::Gone));
    }
}
