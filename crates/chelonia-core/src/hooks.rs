//! Observer hooks.
//!
//! Hosts observe the engine through these callbacks: errors that were
//! handled internally, and every committed state (the reactive sink a UI
//! binds to). Hooks run on the engine's tasks and must not block. A hook
//! that panics is logged and otherwise ignored.

use std::panic::{AssertUnwindSafe, catch_unwind};

use chelonia_proto::{ContractId, Message};

use crate::{
    error::ChelError,
    state::{ContractMeta, ContractState},
};

/// Engine observer. Every method defaults to doing nothing.
pub trait Hooks: Send + Sync + 'static {
    /// Processing `message` failed and the message was skipped.
    fn process_error(&self, _error: &ChelError, _message: &Message) {}

    /// A contract or internal side effect failed after its message was
    /// committed.
    fn side_effect_error(&self, _error: &ChelError, _contract_id: &ContractId) {}

    /// A background sync failed.
    fn sync_contract_error(&self, _error: &ChelError, _contract_id: &ContractId) {}

    /// A live event could not be handled.
    fn handle_event_error(&self, _error: &ChelError, _contract_id: Option<&ContractId>) {}

    /// New state was committed for `contract_id`.
    fn state_committed(&self, _contract_id: &ContractId, _meta: &ContractMeta, _state: &ContractState) {}
}

/// Hooks that observe nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHooks;

impl Hooks for NoopHooks {}

/// Run a hook, containing any panic.
pub(crate) fn guarded(hook: &'static str, call: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(call)).is_err() {
        tracing::error!(hook, "Hook panicked");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    #[test]
    fn panicking_hook_is_contained() {
        let after = AtomicBool::new(false);
        guarded("process_error", || {
            #[allow(clippy::panic)]
            {
                panic!("observer bug");
            }
        });
        guarded("state_committed", || after.store(true, Ordering::SeqCst));
        assert!(after.load(Ordering::SeqCst));
    }
}
