//! Callback dispatch with per-invocation failure containment.
//!
//! Each node is recorded in (or dropped from) the rule's match set *before*
//! its callback runs. A callback that re-enters the engine therefore always
//! sees a match set consistent with the callbacks fired so far, and a
//! panicking callback cannot leave the set half-updated.

use std::any::Any;
use std::fmt;
use std::hash::Hash;
use std::panic::{self, AssertUnwindSafe};

use crate::rule::{Callback, Rule};

use super::diff::MatchDelta;
use super::faults::{FaultKind, FaultSink, SyncFault};

/// Counters for one dispatch.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DispatchOutcome {
    pub matched: usize,
    pub unmatched: usize,
    pub failures: usize,
    /// False if `keep_going` stopped the dispatch early.
    pub completed: bool,
}

pub(crate) struct CallbackDispatcher<'a, N> {
    faults: &'a FaultSink<N>,
}

impl<'a, N> CallbackDispatcher<'a, N>
where
    N: Clone + Eq + Hash + fmt::Debug + 'static,
{
    pub(crate) const fn new(faults: &'a FaultSink<N>) -> Self {
        Self { faults }
    }

    /// Fires `on_match` for every added node, then `on_unmatch` for every
    /// removed node. `keep_going` is checked before each node so a callback
    /// that unregisters the rule or stops the engine ends the dispatch.
    pub(crate) fn dispatch(
        &self,
        rule: &Rule<N>,
        delta: &MatchDelta<N>,
        keep_going: impl Fn() -> bool,
    ) -> DispatchOutcome {
        let mut outcome = DispatchOutcome::default();

        for node in &delta.added {
            if !keep_going() {
                return outcome;
            }
            if !rule.insert_match(node.clone()) {
                continue;
            }
            outcome.matched += 1;
            if let Some(callback) = rule.on_match() {
                if let Err(message) = invoke(callback, node) {
                    outcome.failures += 1;
                    self.faults.report(SyncFault::new(
                        Some(rule.id()),
                        FaultKind::MatchCallback {
                            node: node.clone(),
                            message,
                        },
                    ));
                }
            }
        }

        for node in &delta.removed {
            if !keep_going() {
                return outcome;
            }
            if !rule.remove_match(node) {
                continue;
            }
            outcome.unmatched += 1;
            if let Some(callback) = rule.on_unmatch() {
                if let Err(message) = invoke(callback, node) {
                    outcome.failures += 1;
                    self.faults.report(SyncFault::new(
                        Some(rule.id()),
                        FaultKind::UnmatchCallback {
                            node: node.clone(),
                            message,
                        },
                    ));
                }
            }
        }

        outcome.completed = true;
        outcome
    }

    /// Unmatches everything the rule currently holds.
    pub(crate) fn sweep(&self, rule: &Rule<N>) -> DispatchOutcome {
        let delta = MatchDelta {
            added: Vec::new(),
            removed: rule.matching_nodes(),
        };
        self.dispatch(rule, &delta, || true)
    }
}

fn invoke<N>(callback: &Callback<N>, node: &N) -> Result<(), String> {
    panic::catch_unwind(AssertUnwindSafe(|| callback(node))).map_err(|payload| panic_message(&*payload))
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "callback panicked".to_string()
    }
}
