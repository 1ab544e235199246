//! # Decl - Declarative rules over a mutable tree
//!
//! Decl keeps a set of *rules* in step with a changing tree. Each rule names
//! the nodes it cares about (a selector, a predicate, or an explicit list) and
//! gets an enter callback when a node starts matching and an exit callback
//! when it stops.
//!
//! ## Core Concepts
//!
//! - **Rule**: a matcher plus optional `on_match`/`on_unmatch` callbacks and the last known match set
//! - **Tree**: the host's tree-query provider (child enumeration, subtree selector queries)
//! - **ChangeSource**: tells the engine "the tree may have changed"
//! - **FrameScheduler**: decides when a deferred reconciliation runs
//! - **Engine**: coalesces notifications into reconciliation passes, diffs match sets and fires callbacks
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use decl::{Engine, EngineConfig, ImmediateScheduler, MemoryTree, Rule};
//!
//! let tree = Arc::new(MemoryTree::new("body"));
//! let engine = Engine::for_tree(Arc::clone(&tree), Arc::new(ImmediateScheduler), EngineConfig::default())?;
//!
//! let tooltips = Rule::builder()
//!     .selector("[data-tooltip]")
//!     .on_match(|node| println!("attach tooltip to {node}"))
//!     .on_unmatch(|node| println!("detach tooltip from {node}"))
//!     .build()?;
//!
//! engine.add_rule(&tooltips)?;
//! engine.start_watching();
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod rule;
pub mod sync;
pub mod tree;

// Re-export primary types at crate root for convenience
pub use config::EngineConfig;
pub use error::{DeclError, DeclResult, EvaluationError, ValidationError};
pub use rule::{
    Callback, EngineId, HandlerRegistry, MatchValue, Matcher, Predicate, Rule, RuleBuilder, RuleDefinition, RuleId,
};
pub use sync::{
    diff, ChangeNotifier, ChangeSource, Engine, FaultKind, FaultStream, FrameScheduler, ImmediateScheduler,
    ManualScheduler, MatchDelta, MatcherEvaluator, ObserverId, ReconcileReport, SyncFault, SyncStats,
    TimerScheduler,
};
pub use tree::{MemoryTree, NodeId, Selector, Tree, TreeError};
