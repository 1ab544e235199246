//! Matcher evaluation.
//!
//! Turns a rule's [`Matcher`] into the ordered, identity-unique set of nodes
//! it currently matches. Predicates are walked depth-first in pre-order from
//! the watched root; each [`MatchValue`] decides whether the walk continues
//! below that node.

use std::collections::HashSet;

use crate::error::EvaluationError;
use crate::rule::{MatchValue, Matcher, Predicate};
use crate::tree::{Selector, Tree};

/// Evaluates matchers against a tree.
pub struct MatcherEvaluator<'a, T: Tree> {
    tree: &'a T,
    include_root: bool,
}

impl<'a, T: Tree> MatcherEvaluator<'a, T> {
    /// `include_root` decides whether a root-level selector query may return
    /// the root itself.
    #[must_use]
    pub const fn new(tree: &'a T, include_root: bool) -> Self {
        Self { tree, include_root }
    }

    /// Current matches of `matcher` under `root`.
    pub fn evaluate(&self, root: &T::Node, matcher: &Matcher<T::Node>) -> Result<Vec<T::Node>, EvaluationError> {
        let mut out = Collector::default();

        match matcher {
            Matcher::Selector(selector) => {
                out.extend(self.tree.query_all(root, selector, self.include_root)?);
            }
            Matcher::Explicit(nodes) => out.extend(nodes.iter().cloned()),
            Matcher::Predicate(predicate) => self.walk(root, predicate, &mut out)?,
        }

        Ok(out.finish())
    }

    fn walk(
        &self,
        root: &T::Node,
        predicate: &Predicate<T::Node>,
        out: &mut Collector<T::Node>,
    ) -> Result<(), EvaluationError> {
        let mut stack = vec![root.clone()];

        while let Some(node) = stack.pop() {
            match predicate(&node) {
                MatchValue::Selector(text) => {
                    let selector = Selector::new(text).map_err(|e| EvaluationError::InvalidMatcherResult {
                        reason: format!("predicate returned a bad selector at {node:?}: {e}"),
                    })?;
                    out.extend(self.tree.query_all(&node, &selector, true)?);
                }
                MatchValue::Include(included) => {
                    if included {
                        out.push(node.clone());
                    }
                    let mut children = self.tree.children(&node);
                    children.reverse();
                    stack.extend(children);
                }
                MatchValue::Nodes(nodes) => out.extend(nodes),
                MatchValue::Absent => {}
            }
        }

        Ok(())
    }
}

/// Ordered accumulator; a node produced again keeps its first position.
struct Collector<N> {
    nodes: Vec<N>,
    seen: HashSet<N>,
}

impl<N> Default for Collector<N> {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            seen: HashSet::new(),
        }
    }
}

impl<N> Collector<N>
where
    N: Clone + Eq + std::hash::Hash,
{
    fn push(&mut self, node: N) {
        if self.seen.insert(node.clone()) {
            self.nodes.push(node);
        }
    }

    fn extend(&mut self, nodes: impl IntoIterator<Item = N>) {
        nodes.into_iter().for_each(|n| self.push(n));
    }

    fn finish(self) -> Vec<N> {
        self.nodes
    }
}
