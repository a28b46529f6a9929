//! Transport backed by the in-memory relay.
//!
//! Pushed events land in an inbox that tests drain explicitly with
//! [`SimTransport::deliver`], so the interleaving of live events and local
//! work is decided by the test, not by a scheduler.

#![allow(clippy::disallowed_types, reason = "Inbox lock is never held across await")]

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use chelonia_core::{Chelonia, Environment, HeadInfo, Storage, Transport, TransportError};
use chelonia_proto::ContractId;
use tokio::sync::mpsc::{self, UnboundedReceiver};

use crate::sim_server::{ClientId, SharedSimServer};

/// One client's connection to the relay. Clones share the connection.
#[derive(Clone)]
pub struct SimTransport {
    server: SharedSimServer,
    client: ClientId,
    inbox: Arc<Mutex<UnboundedReceiver<Bytes>>>,
}

impl SimTransport {
    /// Connect to `server`.
    #[must_use]
    pub fn connect(server: SharedSimServer) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let client = server.connect(sender);
        Self { server, client, inbox: Arc::new(Mutex::new(receiver)) }
    }

    /// Relay-side identifier of this connection.
    #[must_use]
    pub fn client_id(&self) -> ClientId {
        self.client
    }

    /// The relay.
    #[must_use]
    pub fn server(&self) -> &SharedSimServer {
        &self.server
    }

    fn next_event(&self) -> Option<Bytes> {
        self.inbox.lock().unwrap_or_else(PoisonError::into_inner).try_recv().ok()
    }

    /// Feed every queued push to `engine`. Returns how many were delivered.
    ///
    /// Handling errors are reported through the engine's hooks and do not
    /// stop delivery.
    pub async fn deliver<E, S, T>(&self, engine: &Chelonia<E, S, T>) -> usize
    where
        E: Environment,
        S: Storage,
        T: Transport,
    {
        let mut delivered = 0;
        while let Some(raw) = self.next_event() {
            if let Err(err) = engine.handle_event(raw).await {
                tracing::debug!(client = self.client, error = %err, "Event rejected");
            }
            delivered += 1;
        }
        delivered
    }
}

impl std::fmt::Debug for SimTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimTransport").field("client", &self.client).finish_non_exhaustive()
    }
}

#[async_trait]
impl Transport for SimTransport {
    async fn fetch_events_after(
        &self,
        contract_id: &ContractId,
        since_height: u64,
        limit: usize,
    ) -> Result<Vec<Bytes>, TransportError> {
        self.server.events_after(contract_id, since_height, limit)
    }

    async fn fetch_latest_head(&self, contract_id: &ContractId) -> Result<HeadInfo, TransportError> {
        self.server.latest_head(contract_id)
    }

    async fn publish(&self, contract_id: &ContractId, raw: Bytes) -> Result<(), TransportError> {
        self.server.publish(contract_id, raw)
    }

    async fn subscribe(&self, contract_id: &ContractId) -> Result<(), TransportError> {
        self.server.subscribe(self.client, contract_id)
    }

    async fn unsubscribe(&self, contract_id: &ContractId) -> Result<(), TransportError> {
        self.server.unsubscribe(self.client, contract_id);
        Ok(())
    }
}
