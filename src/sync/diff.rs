//! Set difference between two match sets.

use std::collections::HashSet;
use std::hash::Hash;

/// Nodes that entered and left a match set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchDelta<N> {
    /// In `current` but not `previous`, in `current` order.
    pub added: Vec<N>,
    /// In `previous` but not `current`, in `previous` order.
    pub removed: Vec<N>,
}

impl<N> MatchDelta<N> {
    /// True when nothing changed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

impl<N> Default for MatchDelta<N> {
    fn default() -> Self {
        Self {
            added: Vec::new(),
            removed: Vec::new(),
        }
    }
}

/// Computes `current - previous` and `previous - current` by node identity.
#[must_use]
pub fn diff<N>(previous: &[N], current: &[N]) -> MatchDelta<N>
where
    N: Clone + Eq + Hash,
{
    let before: HashSet<&N> = previous.iter().collect();
    let after: HashSet<&N> = current.iter().collect();

    MatchDelta {
        added: current.iter().filter(|n| !before.contains(n)).cloned().collect(),
        removed: previous.iter().filter(|n| !after.contains(n)).cloned().collect(),
    }
}
