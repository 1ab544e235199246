//! Synchronization: keeping rule match sets in step with a changing tree.
//!
//! The pipeline is evaluator → diff → dispatcher, driven by the [`Engine`]'s
//! scheduler state machine. Hosts plug in a [`ChangeSource`] for
//! notifications and a [`FrameScheduler`] for deferral.

/// Set difference between match sets.
pub mod diff;
mod dispatcher;
/// Rule registry, scheduler state machine and lifecycle.
pub mod engine;
/// Matcher evaluation.
pub mod evaluator;
/// Out-of-band failure reporting.
pub mod faults;
/// Change-notification capability.
pub mod notify;
/// Deferred scheduling capability.
pub mod scheduler;

pub use diff::{diff, MatchDelta};
pub use engine::{Engine, ReconcileReport, SyncStats};
pub use evaluator::MatcherEvaluator;
pub use faults::{FaultKind, FaultStream, SyncFault};
pub use notify::{ChangeNotifier, ChangeSource, ObserverId};
pub use scheduler::{FrameScheduler, ImmediateScheduler, ManualScheduler, Task, TimerScheduler};
