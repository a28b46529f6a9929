//! Deterministic simulation harness for the Chelonia engine.
//!
//! Every simulated client runs a real [`chelonia_core::Chelonia`] over
//! in-memory storage, a seeded [`SimEnv`], and a [`SimTransport`] connected
//! to one shared in-memory relay ([`SimServer`]). Live events are delivered
//! only when a test asks, so a scenario is fully determined by its seed and
//! its script.
//!
//! # Invariant Testing
//!
//! The `invariants` module checks properties that must hold after any
//! quiesced step: clients at the same head agree on state, and every local
//! head is on the relay's chain. Use [`InvariantRegistry::standard()`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cluster;
pub mod fixtures;
pub mod invariants;
pub mod sim_env;
pub mod sim_server;
pub mod sim_transport;

pub use cluster::{SimClient, SimCluster, SimEngine, client_seed};
pub use invariants::{
    ClientSnapshot, ContractSnapshot, HeadsOnRelayChain, Invariant, InvariantRegistry, InvariantResult,
    KeyWindowsWellFormed, StateConvergence, SystemSnapshot, Violation,
};
pub use sim_env::SimEnv;
pub use sim_server::{ClientId, SharedSimServer, SimServer, create_shared_server};
pub use sim_transport::SimTransport;

/// Install a `tracing` subscriber for tests, filtered by `RUST_LOG`.
///
/// Safe to call from every test; only the first call installs anything.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
