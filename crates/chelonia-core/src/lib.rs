//! Chelonia client engine.
//!
//! Replicates contracts: append-only, hash-chained logs of signed and
//! optionally encrypted operations. Every client that applies the same log
//! with the same secret keys derives the same contract state.
//!
//! # Architecture
//!
//! The crate is split along the same line the data flows:
//!
//! - [`processor`]: the pure state machine. Given a message and a state it
//!   returns the next state and a list of [`SideEffect`]s. No I/O.
//! - [`ordering`]: decides whether a message is the next one, a duplicate,
//!   or evidence of a gap.
//! - [`Chelonia`]: the engine. Serializes work per contract, persists state
//!   through [`Storage`], talks to the relay through [`Transport`], and runs
//!   side effects (key mirroring, key request responses, rebuilds).
//!
//! Time and randomness come from an [`Environment`] so that the whole engine
//! runs deterministically under simulation.
//!
//! # Components
//!
//! - [`ContractRegistry`]: contract definitions (actions, getters, metadata
//!   validation) keyed by manifest
//! - [`SecretKeyStore`]: locally held secret keys
//! - [`Hooks`]: observer callbacks for commits and errors
//! - [`CheloniaConfig`]: strictness, retry and paging policy

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod config;
pub mod contract;
mod engine;
pub mod env;
pub mod error;
pub mod hooks;
pub mod keys;
pub mod ordering;
pub mod processor;
pub mod queue;
pub mod secrets;
pub mod side_effect;
pub mod state;
pub mod storage;
pub mod system_env;
pub mod transport;
pub mod wrappers;

pub use config::{CheloniaConfig, PublishConfig, SyncConfig};
pub use contract::{ActionContext, ActionError, ActionHandler, ContractDefinition, ContractRegistry, SideEffectContext};
pub use engine::{
    ActionParams, BoxFuture, Chelonia, CheloniaBuilder, CreateContract, KeyRequestParams, KeyShareParams, OpBuilder,
    PublishRequest, Signer, SyncOptions, action_op, atomic_op, fixed_op, genesis_message, key_add_op, key_del_op,
    key_share_op, key_update_op, op_builder, prop_del_op, prop_set_op, sign_message,
};
pub use env::Environment;
pub use error::ChelError;
pub use hooks::{Hooks, NoopHooks};
pub use processor::{MessageContext, Processed, Processor};
pub use secrets::SecretKeyStore;
pub use side_effect::SideEffect;
pub use state::{ContractMeta, ContractState};
pub use storage::{ChaoticStorage, MemoryStorage, Storage, StorageError};
pub use system_env::SystemEnv;
pub use transport::{HeadInfo, Transport, TransportError};
