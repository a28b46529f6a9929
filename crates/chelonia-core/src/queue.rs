//! Keyed serial queues.
//!
//! Every mutation of a contract runs inside the queue named after its
//! contract id. Publishing uses `publish:<id>` so that a publish waiting on
//! the relay does not hold up incoming events, and only enters the contract
//! queue to read state and to apply the published message.
//!
//! Queues are FIFO: `tokio::sync::Mutex` hands the lock out in request order.

#![allow(clippy::disallowed_types, reason = "Map of queue handles, never held across await")]

use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, Mutex, PoisonError},
};

use chelonia_proto::ContractId;

/// Named serial queues.
#[derive(Debug, Clone, Default)]
pub struct KeyedQueue {
    queues: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl KeyedQueue {
    /// Create an empty set of queues.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `task` after every task enqueued earlier under `key` has finished.
    pub async fn run<F: Future>(&self, key: &str, task: F) -> F::Output {
        let queue = self.queue(key);
        let _turn = queue.lock().await;
        task.await
    }

    /// Drop queues nobody is waiting on.
    pub fn prune(&self) {
        let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        queues.retain(|_, queue| Arc::strong_count(queue) > 1);
    }

    fn queue(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        queues.entry(key.to_owned()).or_default().clone()
    }
}

/// Queue key for mutations of a contract.
#[must_use]
pub fn contract_key(contract_id: &ContractId) -> String {
    contract_id.to_string()
}

/// Queue key for publishing to a contract.
#[must_use]
pub fn publish_key(contract_id: &ContractId) -> String {
    format!("publish:{contract_id}")
}

/// Queue key for host invocations that must not interleave with a
/// contract's own processing.
#[must_use]
pub fn public_key(contract_id: &ContractId) -> String {
    format!("public:{contract_id}")
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn tasks_under_one_key_do_not_interleave() {
        let queue = KeyedQueue::new();
        let log = Arc::new(tokio::sync::Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..5u64 {
            let queue = queue.clone();
            let log = log.clone();
            handles.push(tokio::spawn(async move {
                queue
                    .run("c", async {
                        log.lock().await.push(("start", i));
                        tokio::time::sleep(Duration::from_millis(5 - i)).await;
                        log.lock().await.push(("end", i));
                    })
                    .await;
            }));
            tokio::task::yield_now().await;
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let log = log.lock().await;
        for pair in log.chunks(2) {
            // INVARIANT: every start is immediately followed by its own end.
            assert_eq!(pair[0].1, pair[1].1);
            assert_eq!(pair[0].0, "start");
        }
    }

    #[tokio::test]
    async fn different_keys_run_independently() {
        let queue = KeyedQueue::new();
        let held = queue.clone();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();

        let blocker = tokio::spawn(async move {
            held.run("a", async {
                let _ = rx.await;
            })
            .await;
        });
        tokio::task::yield_now().await;

        let value = queue.run("b", async { 7 }).await;
        assert_eq!(value, 7);

        tx.send(()).unwrap();
        blocker.await.unwrap();
        queue.prune();
    }
}
