//! Message ordering.
//!
//! Decides, before any processing, whether a message extends the contract's
//! chain, is a replay, or skipped ahead. In relaxed mode a skipped-ahead
//! message schedules a resync instead of failing; the number of such
//! messages waiting at once is bounded by
//! [`crate::CheloniaConfig::max_reingestions`].

use std::collections::{HashMap, HashSet};

use chelonia_proto::{ContractId, Hash, Message};

use crate::{error::ChelError, state::ContractMeta};

/// What to do with an incoming message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ordering {
    /// Extends the chain; process it.
    Apply,
    /// At or below the current height; ignore it.
    Duplicate,
    /// Skips ahead of the next expected height; resync first.
    Gap {
        /// Next height the contract expects
        expected: u64,
    },
}

/// Classify `message` against the contract's current meta.
///
/// Relaxed mode maps replays to [`Ordering::Duplicate`] and gaps to
/// [`Ordering::Gap`]. Strict mode turns both into errors. A message at the
/// next height that names another previous head is always
/// [`ChelError::BadPreviousHead`].
pub fn check_message_ordering(meta: Option<&ContractMeta>, message: &Message, strict: bool) -> Result<Ordering, ChelError> {
    let height = message.height();
    let ordering = match meta {
        None if message.is_first_message() => Ordering::Apply,
        None => Ordering::Gap { expected: 0 },
        Some(meta) if height <= meta.height => Ordering::Duplicate,
        Some(meta) if height > meta.height + 1 => Ordering::Gap { expected: meta.height + 1 },
        Some(meta) => {
            if message.previous_head() != Some(&meta.head) {
                tracing::warn!(
                    contract_id = %message.contract_id(),
                    height,
                    head = %meta.head,
                    "Message does not extend the current head"
                );
                return Err(ChelError::BadPreviousHead { expected: meta.height + 1, got: height });
            }
            Ordering::Apply
        },
    };

    match (&ordering, strict) {
        (Ordering::Duplicate, true) => Err(ChelError::AlreadyProcessed { hash: message.hash().clone() }),
        (Ordering::Gap { expected }, true) => Err(ChelError::BadPreviousHead { expected: *expected, got: height }),
        _ => Ok(ordering),
    }
}

/// Out-of-order messages waiting for a resync, per contract.
#[derive(Debug, Default)]
pub struct ReingestTracker {
    pending: HashMap<ContractId, HashSet<Hash>>,
    total: usize,
}

impl ReingestTracker {
    /// Record a gap message. Returns `true` when this is the first pending
    /// message for the contract (the caller should schedule a resync).
    pub fn record(&mut self, contract_id: &ContractId, hash: &Hash, budget: usize) -> Result<bool, ChelError> {
        let entry = self.pending.entry(contract_id.clone()).or_default();
        if entry.contains(hash) {
            return Ok(false);
        }
        if self.total >= budget {
            return Err(ChelError::Unrecoverable(format!(
                "{} out-of-order messages already awaiting resync",
                self.total
            )));
        }
        let first = entry.is_empty();
        entry.insert(hash.clone());
        self.total += 1;
        Ok(first)
    }

    /// Forget a contract's pending messages after its resync.
    pub fn clear(&mut self, contract_id: &ContractId) {
        if let Some(hashes) = self.pending.remove(contract_id) {
            self.total -= hashes.len();
        }
    }

    /// Forget everything.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.total = 0;
    }

    /// Messages pending across all contracts.
    #[must_use]
    pub fn total(&self) -> usize {
        self.total
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use chelonia_crypto::{Key, KeyAlgorithm};
    use chelonia_proto::{ContractOp, MessageHead, OpValue, PropSetOp, message::PROTOCOL_VERSION};

    use super::*;
    use crate::engine::{genesis_message, sign_message};

    fn contract(tag: &[u8]) -> ContractId {
        ContractId::from_genesis(Hash::digest(tag))
    }

    fn key() -> Key {
        Key::generate(KeyAlgorithm::Ed25519, [4; 32])
    }

    fn genesis() -> Message {
        let contract = ContractOp { contract_type: "counter".into(), keys: Vec::new(), nonce: "n".into() };
        genesis_message(contract, "m", &key()).unwrap()
    }

    fn meta_at(head: &Message) -> ContractMeta {
        ContractMeta {
            contract_type: "counter".into(),
            head: head.hash().clone(),
            height: head.height(),
            previous_key_op: head.contract_id().genesis_hash().clone(),
            missing_decryption_key_ids: BTreeSet::new(),
        }
    }

    fn message_at(genesis: &Message, height: u64, previous_head: Hash) -> Message {
        let op = OpValue::PropSet(PropSetOp { key: "k".into(), value: serde_json::json!(height) });
        let head = MessageHead {
            version: PROTOCOL_VERSION,
            contract_id: Some(genesis.contract_id().clone()),
            previous_head: Some(previous_head),
            previous_key_op: Some(genesis.hash().clone()),
            height,
            op: op.op_type(),
            manifest: "m".into(),
        };
        sign_message(head, op, &key()).unwrap()
    }

    #[test]
    fn genesis_applies_only_to_an_unknown_contract() {
        let genesis = genesis();
        assert_eq!(check_message_ordering(None, &genesis, true), Ok(Ordering::Apply));

        let meta = meta_at(&genesis);
        assert_eq!(check_message_ordering(Some(&meta), &genesis, false), Ok(Ordering::Duplicate));
    }

    #[test]
    fn next_message_on_the_head_applies() {
        let genesis = genesis();
        let next = message_at(&genesis, 1, genesis.hash().clone());
        assert_eq!(check_message_ordering(Some(&meta_at(&genesis)), &next, true), Ok(Ordering::Apply));
    }

    #[test]
    fn duplicate_is_ignored_when_relaxed_and_fatal_when_strict() {
        let genesis = genesis();
        let first = message_at(&genesis, 1, genesis.hash().clone());
        let meta = meta_at(&first);

        assert_eq!(check_message_ordering(Some(&meta), &first, false), Ok(Ordering::Duplicate));
        let strict = check_message_ordering(Some(&meta), &first, true);
        assert!(matches!(strict, Err(ChelError::AlreadyProcessed { hash }) if hash == *first.hash()));
    }

    #[test]
    fn gap_schedules_resync_when_relaxed_and_is_fatal_when_strict() {
        let genesis = genesis();
        let ahead = message_at(&genesis, 3, Hash::digest(b"height 2"));
        let meta = meta_at(&genesis);

        assert_eq!(check_message_ordering(Some(&meta), &ahead, false), Ok(Ordering::Gap { expected: 1 }));
        assert_eq!(
            check_message_ordering(Some(&meta), &ahead, true),
            Err(ChelError::BadPreviousHead { expected: 1, got: 3 })
        );
        assert_eq!(check_message_ordering(None, &ahead, false), Ok(Ordering::Gap { expected: 0 }));
    }

    #[test]
    fn wrong_previous_head_is_rejected_in_both_modes() {
        let genesis = genesis();
        let stray = message_at(&genesis, 1, Hash::digest(b"not the genesis"));
        let meta = meta_at(&genesis);

        for strict in [false, true] {
            assert_eq!(
                check_message_ordering(Some(&meta), &stray, strict),
                Err(ChelError::BadPreviousHead { expected: 1, got: 1 })
            );
        }
    }

    #[test]
    fn tracker_enforces_budget() {
        let mut tracker = ReingestTracker::default();
        let a = contract(b"a");

        assert_eq!(tracker.record(&a, &Hash::digest(b"1"), 2), Ok(true));
        assert_eq!(tracker.record(&a, &Hash::digest(b"1"), 2), Ok(false));
        assert_eq!(tracker.record(&a, &Hash::digest(b"2"), 2), Ok(false));
        assert!(matches!(tracker.record(&a, &Hash::digest(b"3"), 2), Err(ChelError::Unrecoverable(_))));

        tracker.clear(&a);
        assert_eq!(tracker.total(), 0);
        assert_eq!(tracker.record(&a, &Hash::digest(b"3"), 2), Ok(true));
    }

    #[test]
    fn tracker_counts_across_contracts() {
        let mut tracker = ReingestTracker::default();
        tracker.record(&contract(b"a"), &Hash::digest(b"1"), 10).unwrap();
        assert_eq!(tracker.record(&contract(b"b"), &Hash::digest(b"2"), 10), Ok(true));
        assert_eq!(tracker.total(), 2);
        tracker.reset();
        assert_eq!(tracker.total(), 0);
    }
}
