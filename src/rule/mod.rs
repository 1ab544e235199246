//! Rules: a matcher, optional enter/exit callbacks, and the last known match set.
//!
//! Rules are built with [`Rule::builder`] and shared as `Arc<Rule<N>>`. The
//! match set is owned by the engine the rule is registered with; callers only
//! ever see snapshots of it.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ValidationError;
use crate::tree::Selector;

/// Declarative rule loading.
pub mod definition;

pub use definition::{HandlerRegistry, RuleDefinition};

/// Unique identifier for a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuleId(Uuid);

impl RuleId {
    /// Create a new random rule id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for RuleId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of the engine a rule is registered with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EngineId(Uuid);

impl EngineId {
    /// Create a new random engine id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EngineId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EngineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Enter/exit callback, invoked once per node transition.
pub type Callback<N> = Arc<dyn Fn(&N) + Send + Sync>;

/// Per-node predicate of a [`Matcher::Predicate`].
pub type Predicate<N> = Arc<dyn Fn(&N) -> MatchValue<N> + Send + Sync>;

/// What a predicate says about one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchValue<N> {
    /// Re-delegate: query this node's subtree (node included) for the selector.
    /// Stops descent at this branch.
    Selector(String),
    /// Include this node iff `true`; children are visited either way.
    Include(bool),
    /// Use these nodes verbatim. Stops descent at this branch.
    Nodes(Vec<N>),
    /// Nothing here. Stops descent at this branch.
    Absent,
}

impl<N> From<bool> for MatchValue<N> {
    fn from(value: bool) -> Self {
        Self::Include(value)
    }
}

impl<N> From<Vec<N>> for MatchValue<N> {
    fn from(value: Vec<N>) -> Self {
        Self::Nodes(value)
    }
}

impl<N> From<Option<Vec<N>>> for MatchValue<N> {
    fn from(value: Option<Vec<N>>) -> Self {
        value.map_or(Self::Absent, Self::Nodes)
    }
}

/// How a rule decides membership.
pub enum Matcher<N> {
    /// Static selector, delegated to the tree provider.
    Selector(Selector),
    /// Predicate invoked per node, depth-first from the watched root.
    Predicate(Predicate<N>),
    /// Precomputed node list, used verbatim.
    Explicit(Vec<N>),
}

impl<N> Clone for Matcher<N>
where
    N: Clone,
{
    fn clone(&self) -> Self {
        match self {
            Self::Selector(s) => Self::Selector(s.clone()),
            Self::Predicate(p) => Self::Predicate(Arc::clone(p)),
            Self::Explicit(nodes) => Self::Explicit(nodes.clone()),
        }
    }
}

impl<N: fmt::Debug> fmt::Debug for Matcher<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Selector(s) => f.debug_tuple("Selector").field(s).finish(),
            Self::Predicate(_) => f.write_str("Predicate(..)"),
            Self::Explicit(nodes) => f.debug_tuple("Explicit").field(nodes).finish(),
        }
    }
}

/// A registered (matcher, on_match, on_unmatch) triple with its match set.
pub struct Rule<N> {
    id: RuleId,
    matcher: Matcher<N>,
    on_match: Option<Callback<N>>,
    on_unmatch: Option<Callback<N>>,
    matching: Mutex<Vec<N>>,
    owner: Mutex<Option<EngineId>>,
}

impl<N> Rule<N>
where
    N: Clone + PartialEq + 'static,
{
    /// Creates a rule builder.
    #[must_use]
    pub fn builder() -> RuleBuilder<N> {
        RuleBuilder::new()
    }

    /// The rule id.
    #[must_use]
    pub const fn id(&self) -> RuleId {
        self.id
    }

    /// The matcher.
    #[must_use]
    pub const fn matcher(&self) -> &Matcher<N> {
        &self.matcher
    }

    pub(crate) fn on_match(&self) -> Option<&Callback<N>> {
        self.on_match.as_ref()
    }

    pub(crate) fn on_unmatch(&self) -> Option<&Callback<N>> {
        self.on_unmatch.as_ref()
    }

    /// Snapshot of the current match set.
    #[must_use]
    pub fn matching_nodes(&self) -> Vec<N> {
        self.matching.lock().clone()
    }

    /// Number of matched nodes.
    #[must_use]
    pub fn match_count(&self) -> usize {
        self.matching.lock().len()
    }

    /// Returns true if `node` is in the match set.
    #[must_use]
    pub fn is_matching(&self, node: &N) -> bool {
        self.matching.lock().contains(node)
    }

    /// The engine this rule is registered with, if any.
    #[must_use]
    pub fn owner(&self) -> Option<EngineId> {
        *self.owner.lock()
    }

    pub(crate) fn is_owned_by(&self, engine: EngineId) -> bool {
        *self.owner.lock() == Some(engine)
    }

    /// Claims the rule for `engine`. `Ok(false)` if it already belongs to it.
    pub(crate) fn claim(&self, engine: EngineId) -> Result<bool, ValidationError> {
        let mut owner = self.owner.lock();
        match *owner {
            None => {
                *owner = Some(engine);
                Ok(true)
            }
            Some(current) if current == engine => Ok(false),
            Some(other) => Err(ValidationError::InvalidRuleType {
                reason: format!("rule {} is registered with engine {other}", self.id),
            }),
        }
    }

    /// Releases the rule if it belongs to `engine`.
    pub(crate) fn release(&self, engine: EngineId) -> bool {
        let mut owner = self.owner.lock();
        if *owner == Some(engine) {
            *owner = None;
            true
        } else {
            false
        }
    }

    /// Adds `node`; false if it was already present.
    pub(crate) fn insert_match(&self, node: N) -> bool {
        let mut matching = self.matching.lock();
        if matching.contains(&node) {
            return false;
        }
        matching.push(node);
        true
    }

    /// Removes `node`; false if it was absent.
    pub(crate) fn remove_match(&self, node: &N) -> bool {
        let mut matching = self.matching.lock();
        match matching.iter().position(|n| n == node) {
            Some(index) => {
                matching.remove(index);
                true
            }
            None => false,
        }
    }

    /// Adopts evaluation order, but only when `nodes` holds exactly the
    /// current match set. Returns false and leaves the set alone otherwise.
    pub(crate) fn adopt_order(&self, nodes: &[N]) -> bool {
        let mut matching = self.matching.lock();
        if matching.len() != nodes.len() || !nodes.iter().all(|n| matching.contains(n)) {
            return false;
        }
        matching.clear();
        matching.extend_from_slice(nodes);
        true
    }
}

impl<N: fmt::Debug> fmt::Debug for Rule<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rule")
            .field("id", &self.id)
            .field("matcher", &self.matcher)
            .field("on_match", &self.on_match.is_some())
            .field("on_unmatch", &self.on_unmatch.is_some())
            .field("matching", &*self.matching.lock())
            .finish()
    }
}

/// Builder for [`Rule`].
pub struct RuleBuilder<N> {
    id: Option<RuleId>,
    matcher: Option<Result<Matcher<N>, ValidationError>>,
    on_match: Option<Callback<N>>,
    on_unmatch: Option<Callback<N>>,
}

impl<N> Default for RuleBuilder<N> {
    fn default() -> Self {
        Self {
            id: None,
            matcher: None,
            on_match: None,
            on_unmatch: None,
        }
    }
}

impl<N> RuleBuilder<N>
where
    N: Clone + PartialEq + 'static,
{
    /// Creates a new rule builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the rule ID (optional, will be generated if not set).
    #[must_use]
    pub fn id(mut self, id: RuleId) -> Self {
        self.id = Some(id);
        self
    }

    /// Matches nodes by selector. Invalid text is reported by `build`.
    #[must_use]
    pub fn selector(mut self, selector: impl Into<String>) -> Self {
        self.matcher = Some(Selector::new(selector).map(Matcher::Selector));
        self
    }

    /// Matches nodes by predicate.
    #[must_use]
    pub fn predicate<F, V>(mut self, predicate: F) -> Self
    where
        F: Fn(&N) -> V + Send + Sync + 'static,
        V: Into<MatchValue<N>> + 'static,
    {
        let predicate: Predicate<N> = Arc::new(move |node: &N| predicate(node).into());
        self.matcher = Some(Ok(Matcher::Predicate(predicate)));
        self
    }

    /// Matches a fixed list of nodes.
    #[must_use]
    pub fn nodes(mut self, nodes: Vec<N>) -> Self {
        self.matcher = Some(Ok(Matcher::Explicit(nodes)));
        self
    }

    /// Sets a prebuilt matcher.
    #[must_use]
    pub fn matcher(mut self, matcher: Matcher<N>) -> Self {
        self.matcher = Some(Ok(matcher));
        self
    }

    /// Sets the enter callback.
    #[must_use]
    pub fn on_match<F>(mut self, callback: F) -> Self
    where
        F: Fn(&N) + Send + Sync + 'static,
    {
        self.on_match = Some(Arc::new(callback));
        self
    }

    /// Sets the exit callback.
    #[must_use]
    pub fn on_unmatch<F>(mut self, callback: F) -> Self
    where
        F: Fn(&N) + Send + Sync + 'static,
    {
        self.on_unmatch = Some(Arc::new(callback));
        self
    }

    pub(crate) fn on_match_shared(mut self, callback: Option<Callback<N>>) -> Self {
        self.on_match = callback;
        self
    }

    pub(crate) fn on_unmatch_shared(mut self, callback: Option<Callback<N>>) -> Self {
        self.on_unmatch = callback;
        self
    }

    /// Builds the rule.
    /// Returns `InvalidMatcherType` if no matcher was set or the selector is empty.
    pub fn build(self) -> Result<Arc<Rule<N>>, ValidationError> {
        let matcher = self
            .matcher
            .ok_or_else(|| ValidationError::matcher("a selector, predicate or node list is required"))??;

        Ok(Arc::new(Rule {
            id: self.id.unwrap_or_default(),
            matcher,
            on_match: self.on_match,
            on_unmatch: self.on_unmatch,
            matching: Mutex::new(Vec::new()),
            owner: Mutex::new(None),
        }))
    }
}
