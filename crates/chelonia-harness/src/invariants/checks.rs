//! Standard invariant checks.

use std::collections::BTreeMap;

use chelonia_proto::{ContractId, Hash};

use super::{ContractSnapshot, Invariant, InvariantResult, SystemSnapshot, Violation};

/// Clients at the same head hold the same state.
///
/// Same log, same secrets: same state. Clients holding different secrets may
/// differ in `data` (they could not read every action), so only clients with
/// identical key tables are compared on `data`.
pub struct StateConvergence;

impl Invariant for StateConvergence {
    fn name(&self) -> &'static str {
        "state_convergence"
    }

    fn check(&self, state: &SystemSnapshot) -> InvariantResult {
        let mut seen: BTreeMap<(ContractId, Hash), (u64, &ContractSnapshot)> = BTreeMap::new();
        for client in &state.clients {
            for (contract_id, contract) in &client.contracts {
                let key = (contract_id.clone(), contract.head.clone());
                let Some((first_client, first)) = seen.get(&key) else {
                    seen.insert(key, (client.id, contract));
                    continue;
                };
                if first.vm != contract.vm {
                    return Err(Violation {
                        invariant: self.name(),
                        message: format!(
                            "contract {contract_id} at height {}: clients {first_client} and {} disagree on protocol state",
                            contract.height, client.id
                        ),
                    });
                }
                if first.keys == contract.keys && first.data != contract.data {
                    return Err(Violation {
                        invariant: self.name(),
                        message: format!(
                            "contract {contract_id} at height {}: clients {first_client} and {} disagree on data",
                            contract.height, client.id
                        ),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Every local head is the relay's message at that height.
pub struct HeadsOnRelayChain;

impl Invariant for HeadsOnRelayChain {
    fn name(&self) -> &'static str {
        "heads_on_relay_chain"
    }

    fn check(&self, state: &SystemSnapshot) -> InvariantResult {
        for client in &state.clients {
            for (contract_id, contract) in &client.contracts {
                let Some(chain) = state.relay.get(contract_id) else {
                    continue;
                };
                if chain.get(contract.height as usize) != Some(&contract.head) {
                    return Err(Violation {
                        invariant: self.name(),
                        message: format!(
                            "client {} holds head {} at height {} of {contract_id}, not on the relay chain of length {}",
                            client.id,
                            contract.head,
                            contract.height,
                            chain.len()
                        ),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Keys are never valid before they were added, and revocation comes after
/// installation.
pub struct KeyWindowsWellFormed;

impl Invariant for KeyWindowsWellFormed {
    fn name(&self) -> &'static str {
        "key_windows_well_formed"
    }

    fn check(&self, state: &SystemSnapshot) -> InvariantResult {
        for client in &state.clients {
            for (contract_id, contract) in &client.contracts {
                for key in contract.keys.values() {
                    let ordered = key.not_after_height.is_none_or(|end| end >= key.not_before_height)
                        && key.not_before_height <= contract.height
                        && key.revoked_windows.iter().all(|(start, end)| start <= end);
                    if !ordered {
                        return Err(Violation {
                            invariant: self.name(),
                            message: format!(
                                "client {} contract {contract_id}: key {} has window {}..{:?}",
                                client.id, key.id, key.not_before_height, key.not_after_height
                            ),
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::invariants::ClientSnapshot;

    fn contract(head: &[u8], vm: serde_json::Value) -> ContractSnapshot {
        ContractSnapshot {
            head: Hash::digest(head),
            height: 1,
            vm,
            data: json!(null),
            keys: chelonia_core::keys::KeyTable::new(),
        }
    }

    fn client(id: u64, contract_id: &ContractId, snapshot: ContractSnapshot) -> ClientSnapshot {
        ClientSnapshot { id, contracts: BTreeMap::from([(contract_id.clone(), snapshot)]) }
    }

    #[test]
    fn divergent_state_at_same_head_is_flagged() {
        let contract_id = ContractId::from_genesis(Hash::digest(b"c"));
        let snapshot = SystemSnapshot {
            clients: vec![
                client(1, &contract_id, contract(b"h", json!({"props": {}}))),
                client(2, &contract_id, contract(b"h", json!({"props": {"x": 1}}))),
            ],
            relay: BTreeMap::new(),
        };
        assert!(StateConvergence.check(&snapshot).is_err());
    }

    #[test]
    fn head_off_the_relay_chain_is_flagged() {
        let contract_id = ContractId::from_genesis(Hash::digest(b"c"));
        let snapshot = SystemSnapshot {
            clients: vec![client(1, &contract_id, contract(b"fork", json!({})))],
            relay: BTreeMap::from([(contract_id.clone(), vec![Hash::digest(b"g"), Hash::digest(b"h")])]),
        };
        assert!(HeadsOnRelayChain.check(&snapshot).is_err());
    }
}
