//! PPT invariant system: runtime invariant enforcement with contract tracking.
//!
//! Hot paths call [`assert_invariant`] at the point where an invariant is established.
//! With the `ppt` feature the id is recorded, so contract tests can prove that an
//! exercised code path actually checked what it promises.

#[cfg(feature = "ppt")]
use lazy_static::lazy_static;
#[cfg(feature = "ppt")]
use parking_lot::Mutex;
#[cfg(feature = "ppt")]
use std::collections::HashSet;

/// Reference counts never underflow.
pub const REF_COUNT_BALANCED: u32 = 1;
/// An entity is destroyed exactly once, when both counts reach zero.
pub const REF_DESTROYED_ONCE: u32 = 2;
/// Bound values match the declared parameter type.
pub const PARAM_TYPE_CHECKED: u32 = 3;
/// Structural mutation forces re-verification.
pub const MUTATION_UNVERIFIES: u32 = 4;
/// A graph pass only starts on a verified graph.
pub const VERIFY_BEFORE_EXECUTE: u32 = 5;
/// Verification rejects graphs that are not rooted DAGs.
pub const GRAPH_REJECTS_INVALID: u32 = 6;
/// Heads are exactly the nodes whose inputs no node produces.
pub const HEADS_COMPUTED: u32 = 7;
/// Replication is validated in full before it is committed.
pub const REPLICATION_ATOMIC: u32 = 8;
/// Replicas run in item order and stop at the first failure.
pub const REPLICA_ORDER: u32 = 9;
/// A failed node abandons the rest of the pass.
pub const FAILURE_ABANDONS: u32 = 10;
/// Queue stage moves are all-or-nothing.
pub const QUEUE_STAGE_ATOMIC: u32 = 11;
/// Queue stage moves never drop an item.
pub const QUEUE_NO_LOSS: u32 = 12;
/// Targets stay ordered by priority.
pub const TARGET_PRIORITY: u32 = 13;

#[cfg(feature = "ppt")]
lazy_static! {
    static ref INVARIANT_LOG: Mutex<HashSet<u32>> = Mutex::new(HashSet::new());
}

#[cfg(feature = "ppt")]
/// Assert an invariant: logs it and panics on failure.
pub(crate) fn assert_invariant(id: u32, condition: bool, message: &str, context: Option<&str>) {
    if !condition {
        let full_message = match context {
            Some(ctx) => format!("Invariant {id} failed: {message} (context: {ctx})"),
            None => format!("Invariant {id} failed: {message}"),
        };
        tracing::error!(invariant = id, "{full_message}");
        panic!("{full_message}");
    }
    INVARIANT_LOG.lock().insert(id);
}

#[cfg(not(feature = "ppt"))]
/// Assert an invariant: checks condition and panics on failure.
pub(crate) fn assert_invariant(_id: u32, condition: bool, message: &str, _context: Option<&str>) {
    if !condition {
        panic!("Invariant failed: {message}");
    }
}

#[cfg(feature = "ppt")]
/// Contract test: checks that specified invariants were asserted.
pub fn contract_test(test_name: &str, required_invariants: &[u32]) {
    let missing: Vec<u32> = {
        let log = INVARIANT_LOG.lock();
        required_invariants
            .iter()
            .copied()
            .filter(|inv| !log.contains(inv))
            .collect()
    };
    if !missing.is_empty() {
        panic!("Contract test '{test_name}' failed: invariants not enforced: {missing:?}");
    }
}

#[cfg(not(feature = "ppt"))]
/// Contract test: no-op when PPT feature is disabled.
pub fn contract_test(_test_name: &str, _required_invariants: &[u32]) {}

#[cfg(feature = "ppt")]
/// Clear the invariant log.
pub fn clear_invariant_log() {
    INVARIANT_LOG.lock().clear();
}

#[cfg(not(feature = "ppt"))]
/// Clear the invariant log: no-op when PPT feature is disabled.
pub fn clear_invariant_log() {}
