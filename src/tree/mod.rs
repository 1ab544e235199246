//! Tree-query provider contract.
//!
//! The engine never owns the tree. It only needs to enumerate children and
//! run subtree selector queries, so any host tree (a DOM binding, a scene
//! graph, a widget hierarchy) can be watched by implementing [`Tree`].
//!
//! Node handles must compare by identity: two handles are equal iff they
//! refer to the same node. Structural equality would make the set-difference
//! engine report moves as no-ops and duplicates as one node.

use std::fmt;
use std::hash::Hash;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::ValidationError;

pub mod memory;
pub mod selector;

pub use memory::{MemoryTree, NodeId};
pub use selector::{ElementView, SelectorList};

/// Errors that a tree provider can raise while answering a query.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TreeError {
    /// The selector could not be parsed by this provider.
    #[error("Invalid selector '{selector}': {reason}")]
    InvalidSelector {
        /// The offending selector text.
        selector: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The node handle does not belong to this tree.
    #[error("Unknown node: {0}")]
    UnknownNode(String),

    /// The requested mutation would break the tree shape.
    #[error("Hierarchy violation: {0}")]
    HierarchyViolation(String),
}

/// A selector string, checked to be non-empty.
///
/// Its grammar is owned by the tree provider; the engine treats it as opaque.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Selector(String);

impl Selector {
    /// Creates a selector, rejecting empty or whitespace-only text.
    pub fn new(selector: impl Into<String>) -> Result<Self, ValidationError> {
        let selector = selector.into();
        let trimmed = selector.trim();
        if trimmed.is_empty() {
            return Err(ValidationError::matcher("selector must not be empty"));
        }
        Ok(Self(trimmed.to_string()))
    }

    /// Returns the selector text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Selector {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&str> for Selector {
    type Error = ValidationError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Selector> for String {
    fn from(value: Selector) -> Self {
        value.0
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Read-only query interface the engine consumes.
pub trait Tree: Send + Sync + 'static {
    /// Node handle. Equality and hashing must reflect node identity.
    type Node: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static;

    /// The default root to watch.
    fn root(&self) -> Self::Node;

    /// Direct children of `node`, in document order.
    fn children(&self, node: &Self::Node) -> Vec<Self::Node>;

    /// True if `node` belongs to this tree and is reachable from [`root`](Self::root).
    fn contains(&self, node: &Self::Node) -> bool;

    /// All nodes under `scope` matching `selector`, in document order.
    ///
    /// `scope` itself is part of the result only when `include_scope` is set
    /// and it matches.
    fn query_all(
        &self,
        scope: &Self::Node,
        selector: &Selector,
        include_scope: bool,
    ) -> Result<Vec<Self::Node>, TreeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_rejects_blank_text() {
        assert!(Selector::new("").is_err());
        assert!(Selector::new("   ").is_err());
    }

    #[test]
    fn selector_trims_surrounding_whitespace() {
        let sel = Selector::new("  .x ").unwrap();
        assert_eq!(sel.as_str(), ".x");
        assert_eq!(sel.to_string(), ".x");
    }

    #[test]
    fn selector_deserialization_validates() {
        let ok: Selector = serde_json::from_str("\"div.item\"").unwrap();
        assert_eq!(ok.as_str(), "div.item");

        let err = serde_json::from_str::<Selector>("\"\"");
        assert!(err.is_err());
    }
}
