//! Relay transport.
//!
//! The engine talks to the relay through this trait only: fetch pages of a
//! contract's log, read its latest head, publish a message, and manage
//! subscriptions. Live events pushed by the relay are fed back through
//! [`crate::Chelonia::handle_event`] by whoever owns the connection.

use async_trait::async_trait;
use bytes::Bytes;
use chelonia_proto::{ContractId, Hash};
use thiserror::Error;

/// Latest head of a contract on the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadInfo {
    /// Hash of the latest message
    pub head: Hash,
    /// Height of the latest message
    pub height: u64,
}

/// Relay failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Publish lost a race: the relay's head moved (409) or the message's
    /// previous head is not the relay's head (412).
    #[error("publish conflict (status {status})")]
    Conflict {
        /// HTTP-style status code
        status: u16,
    },

    /// Contract was deleted.
    #[error("contract is gone")]
    Gone,

    /// Contract unknown to the relay.
    #[error("contract not found")]
    NotFound,

    /// Relay refused the message.
    #[error("rejected by relay: {0}")]
    Rejected(String),

    /// Connection-level failure.
    #[error("network error: {0}")]
    Network(String),
}

impl TransportError {
    /// Whether retrying the same request may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_))
    }
}

/// Relay operations.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Raw messages of `contract_id` with height `>= since_height`, in
    /// height order, at most `limit` of them.
    async fn fetch_events_after(
        &self,
        contract_id: &ContractId,
        since_height: u64,
        limit: usize,
    ) -> Result<Vec<Bytes>, TransportError>;

    /// Latest head of `contract_id`.
    async fn fetch_latest_head(&self, contract_id: &ContractId) -> Result<HeadInfo, TransportError>;

    /// Submit a message.
    async fn publish(&self, contract_id: &ContractId, raw: Bytes) -> Result<(), TransportError>;

    /// Start receiving live events for `contract_id`.
    async fn subscribe(&self, contract_id: &ContractId) -> Result<(), TransportError>;

    /// Stop receiving live events for `contract_id`.
    async fn unsubscribe(&self, contract_id: &ContractId) -> Result<(), TransportError>;
}
