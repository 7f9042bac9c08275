//! Invariant enforcement with contract tracking.
//!
//! Engine code calls [`assert_invariant`] at the points where a structural
//! guarantee must hold. With the `ppt` feature enabled every asserted id is
//! recorded, so integration tests can check with [`contract_test`] that a
//! scenario actually exercised the guarantees it claims to cover.

#[cfg(feature = "ppt")]
use lazy_static::lazy_static;
#[cfg(feature = "ppt")]
use std::collections::HashSet;
#[cfg(feature = "ppt")]
use std::sync::Mutex;

/// Merging a channel into a map entry already holding it changes nothing.
pub const CHANNEL_MERGE_IDENTITY: u32 = 1;
/// One live substitution node per `(channel node, substitution key)`.
pub const SUBSTITUTION_MEMOIZED: u32 = 2;
/// A synchronized channel node is never left out of sync.
pub const STRUCTURE_SYNC: u32 = 3;
/// Data changes never mark channel nodes out of sync.
pub const DATA_CHANGE_KEEPS_STRUCTURE: u32 = 4;
/// Iteration count never exceeds any iterating input.
pub const BROADCAST_SOUND: u32 = 5;
/// Channel slots are sorted by ascending key.
pub const SEQUENCE_ORDERED: u32 = 6;
/// Operators only run on validated inputs.
pub const PROCESS_INPUT_VALIDATED: u32 = 7;
/// A ready request exposes only live entries.
pub const REQUEST_RESULT_RESOLVED: u32 = 8;
/// The node graph never contains a cycle.
pub const GRAPH_ACYCLIC: u32 = 9;
/// Tearing down a substitution node releases what it acquired.
pub const TEARDOWN_SYMMETRIC: u32 = 10;

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
        tracing::error!("{full_message}");
        panic!("{full_message}");
    }
    INVARIANT_LOG
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .insert(id);
}

#[cfg(not(feature = "ppt"))]
/// Assert an invariant: checks the condition and panics on failure.
pub(crate) fn assert_invariant(_id: u32, condition: bool, message: &str, _context: Option<&str>) {
    if !condition {
        panic!("Invariant failed: {message}");
    }
}

#[cfg(feature = "ppt")]
/// Panics unless every id in `required_invariants` has been asserted.
pub fn contract_test(test_name: &str, required_invariants: &[u32]) {
    let missing: Vec<u32> = {
        let log = INVARIANT_LOG
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        required_invariants
            .iter()
            .copied()
            .filter(|id| !log.contains(id))
            .collect()
    };
    if !missing.is_empty() {
        panic!("Contract test '{test_name}' failed: invariants not enforced: {missing:?}");
    }
}

#[cfg(not(feature = "ppt"))]
/// No-op when the `ppt` feature is disabled.
pub fn contract_test(_test_name: &str, _required_invariants: &[u32]) {}

#[cfg(feature = "ppt")]
/// Forget every recorded invariant.
pub fn clear_invariant_log() {
    INVARIANT_LOG
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .clear();
}

#[cfg(not(feature = "ppt"))]
/// No-op when the `ppt` feature is disabled.
pub fn clear_invariant_log() {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passing_assertion_is_recorded() {
        assert_invariant(SEQUENCE_ORDERED, [1, 2].windows(2).all(|w| w[0] < w[1]), "sorted", Some("unit"));
        contract_test("passing_assertion_is_recorded", &[SEQUENCE_ORDERED]);
    }

    #[test]
    #[should_panic]
    fn failing_assertion_panics() {
        assert_invariant(BROADCAST_SOUND, 3 > 4, "broken", None);
    }

    #[cfg(feature = "ppt")]
    #[test]
    #[should_panic(expected = "invariants not enforced")]
    fn contract_reports_missing_ids() {
        contract_test("never_asserted", &[u32::MAX]);
    }
}
