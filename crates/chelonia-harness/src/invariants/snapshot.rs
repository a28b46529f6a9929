//! Observable state snapshots for invariant checking.

use std::collections::BTreeMap;

use chelonia_core::keys::KeyTable;
use chelonia_proto::{ContractId, Hash};
use serde_json::Value;

use crate::cluster::SimCluster;

/// Clients' views of some contracts plus the relay's chains.
#[derive(Debug, Clone, Default)]
pub struct SystemSnapshot {
    /// Per-client views
    pub clients: Vec<ClientSnapshot>,
    /// Relay chain per contract: message hashes in height order
    pub relay: BTreeMap<ContractId, Vec<Hash>>,
}

impl SystemSnapshot {
    /// Snapshot `contract_ids` across every client of `cluster`.
    pub fn capture(cluster: &SimCluster, contract_ids: &[ContractId]) -> Self {
        let clients = cluster
            .clients
            .iter()
            .map(|client| {
                let contracts = contract_ids
                    .iter()
                    .filter_map(|contract_id| {
                        let meta = client.meta(contract_id)?;
                        let state = client.state(contract_id)?;
                        Some((contract_id.clone(), ContractSnapshot {
                            head: meta.head,
                            height: meta.height,
                            vm: serde_json::to_value(&state.vm).unwrap_or(Value::Null),
                            data: state.data,
                            keys: state.vm.authorized_keys,
                        }))
                    })
                    .collect();
                ClientSnapshot { id: client.transport.client_id(), contracts }
            })
            .collect();

        let relay = contract_ids
            .iter()
            .map(|contract_id| {
                let len = cluster.server.log_len(contract_id) as u64;
                let hashes = (0..len)
                    .filter_map(|height| cluster.server.message_at(contract_id, height))
                    .map(|raw| Hash::digest(&raw))
                    .collect();
                (contract_id.clone(), hashes)
            })
            .collect();

        Self { clients, relay }
    }
}

/// One client's view.
#[derive(Debug, Clone, Default)]
pub struct ClientSnapshot {
    /// Relay connection id
    pub id: u64,
    /// Contracts the client holds
    pub contracts: BTreeMap<ContractId, ContractSnapshot>,
}

/// One contract as a client sees it.
#[derive(Debug, Clone)]
pub struct ContractSnapshot {
    /// Local head
    pub head: Hash,
    /// Local height
    pub height: u64,
    /// Replicated protocol state
    pub vm: Value,
    /// Contract-defined state
    pub data: Value,
    /// Key table
    pub keys: KeyTable,
}
