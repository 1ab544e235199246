//! The synchronization engine.
//!
//! An [`Engine`] owns an ordered rule registry and keeps every rule's match
//! set in step with a watched tree:
//!
//! * change notifications mark the engine *tainted* and schedule at most one
//!   deferred reconciliation through the injected [`FrameScheduler`];
//! * a reconciliation clears the taint, re-evaluates every rule in
//!   registration order, diffs against the stored match set and dispatches
//!   callbacks (additions, then removals);
//! * if a callback re-taints the tree the pass repeats, up to
//!   [`EngineConfig::max_passes`], after which the engine force-settles and
//!   reports [`FaultKind::PassLimitExceeded`].
//!
//! Registry and match-set mutation is serialized by one reentrant section, so
//! callbacks may call back into the engine on the same thread.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, ReentrantMutex};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace};

use crate::config::EngineConfig;
use crate::error::{DeclError, DeclResult, EvaluationError};
use crate::rule::{EngineId, Rule};
use crate::tree::{Tree, TreeError};

use super::diff::diff;
use super::dispatcher::{panic_message, CallbackDispatcher, DispatchOutcome};
use super::evaluator::MatcherEvaluator;
use super::faults::{FaultKind, FaultSink, FaultStream, SyncFault};
use super::notify::{ChangeNotifier, ChangeSource, ObserverId, TaintSink};
use super::scheduler::{FrameScheduler, TimerScheduler};

/// Cumulative engine counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStats {
    /// Notifications received while watching.
    pub notifications: u64,
    /// Notifications absorbed by a pending or running reconciliation.
    pub coalesced: u64,
    /// Deferred reconciliations that actually ran.
    pub scheduled_runs: u64,
    /// Reconciliation passes over the registry.
    pub passes: u64,
    /// Callbacks that panicked.
    pub callback_failures: u64,
    /// Rule evaluations that failed and were skipped.
    pub evaluation_failures: u64,
    /// Runs that hit `max_passes` and force-settled.
    pub cap_hits: u64,
    /// Faults dropped because the fault queue was full.
    pub faults_dropped: u64,
    /// When the last reconciliation run finished.
    pub last_pass: Option<DateTime<Utc>>,
}

/// Summary of one reconciliation run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Passes executed.
    pub passes: usize,
    /// Nodes that entered a match set.
    pub matched: usize,
    /// Nodes that left a match set.
    pub unmatched: usize,
    /// Callbacks that panicked.
    pub callback_failures: usize,
    /// Rules skipped because their matcher failed.
    pub evaluation_failures: usize,
    /// True if the run stopped at `max_passes`.
    pub cap_hit: bool,
}

impl ReconcileReport {
    fn absorb(&mut self, outcome: DispatchOutcome) {
        self.matched += outcome.matched;
        self.unmatched += outcome.unmatched;
        self.callback_failures += outcome.failures;
    }
}

/// Rule registry plus scheduler state machine for one watched tree.
///
/// Cloning an `Engine` yields another handle to the same engine.
pub struct Engine<T: Tree> {
    inner: Arc<Inner<T>>,
}

impl<T: Tree> Clone for Engine<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Tree> fmt::Debug for Engine<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("id", &self.inner.id)
            .field("watching", &self.is_watching())
            .field("rules", &self.inner.rules.lock().len())
            .finish()
    }
}

type SharedRule<T> = Arc<Rule<<T as Tree>::Node>>;

struct Inner<T: Tree> {
    id: EngineId,
    observer: ObserverId,
    tree: Arc<T>,
    source: Arc<dyn ChangeSource>,
    scheduler: Arc<dyn FrameScheduler>,
    config: EngineConfig,
    section: ReentrantMutex<()>,
    rules: Mutex<Vec<SharedRule<T>>>,
    root: Mutex<Option<T::Node>>,
    watching: AtomicBool,
    tainted: AtomicBool,
    pending: AtomicBool,
    running: AtomicBool,
    generation: AtomicU64,
    stats: Mutex<SyncStats>,
    faults: FaultSink<T::Node>,
    this: Weak<Inner<T>>,
}

impl<T: Tree> Engine<T> {
    /// Creates an idle engine over `tree`, notified by `source`, deferring
    /// reconciliations through `scheduler`.
    pub fn new(
        tree: Arc<T>,
        source: Arc<dyn ChangeSource>,
        scheduler: Arc<dyn FrameScheduler>,
        config: EngineConfig,
    ) -> DeclResult<Self> {
        config.validate()?;
        let faults = FaultSink::new(config.fault_capacity);

        let inner = Arc::new_cyclic(|this| Inner {
            id: EngineId::new(),
            observer: ObserverId::new(),
            tree,
            source,
            scheduler,
            config,
            section: ReentrantMutex::new(()),
            rules: Mutex::new(Vec::new()),
            root: Mutex::new(None),
            watching: AtomicBool::new(false),
            tainted: AtomicBool::new(false),
            pending: AtomicBool::new(false),
            running: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            stats: Mutex::new(SyncStats::default()),
            faults,
            this: this.clone(),
        });

        debug!(engine = %inner.id, "engine created");
        Ok(Self { inner })
    }

    /// Creates an engine for a tree that reports its own changes.
    pub fn for_tree(tree: Arc<T>, scheduler: Arc<dyn FrameScheduler>, config: EngineConfig) -> DeclResult<Self>
    where
        T: ChangeSource,
    {
        let source: Arc<dyn ChangeSource> = tree.clone();
        Self::new(tree, source, scheduler, config)
    }

    /// Creates an engine that reconciles on a [`TimerScheduler`] using
    /// `config.fallback_interval()`.
    pub fn with_timer(tree: Arc<T>, source: Arc<dyn ChangeSource>, config: EngineConfig) -> DeclResult<Self> {
        let timer = TimerScheduler::new(config.fallback_interval())
            .map_err(|e| DeclError::config(format!("failed to start timer scheduler: {e}")))?;
        Self::new(tree, source, Arc::new(timer), config)
    }

    /// This engine's identity.
    #[must_use]
    pub fn id(&self) -> EngineId {
        self.inner.id
    }

    /// The configuration in effect.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// The watched tree.
    #[must_use]
    pub fn tree(&self) -> &Arc<T> {
        &self.inner.tree
    }

    /// Registers `rule`.
    ///
    /// While watching, the rule is reconciled immediately so its initial
    /// matches fire without waiting for a notification. Adding a rule that is
    /// already registered here is a no-op returning `Ok(false)`; adding one
    /// registered with another engine is an `InvalidRuleType` error.
    pub fn add_rule(&self, rule: &SharedRule<T>) -> DeclResult<bool> {
        let inner = &*self.inner;
        let _section = inner.section.lock();

        if !rule.claim(inner.id)? {
            return Ok(false);
        }
        inner.rules.lock().push(Arc::clone(rule));
        debug!(engine = %inner.id, rule = %rule.id(), "rule added");

        if inner.watching.load(Ordering::SeqCst) {
            if inner.running.load(Ordering::SeqCst) {
                // Picked up by the next pass of the running loop.
                inner.tainted.store(true, Ordering::SeqCst);
            } else {
                inner.reconcile_added(rule);
            }
        }
        Ok(true)
    }

    /// Unregisters `rule`, firing `on_unmatch` for every node it currently
    /// matches before returning. Returns false if it was not registered here.
    pub fn remove_rule(&self, rule: &SharedRule<T>) -> bool {
        let inner = &*self.inner;
        let _section = inner.section.lock();

        if !rule.release(inner.id) {
            return false;
        }
        inner.rules.lock().retain(|r| !Arc::ptr_eq(r, rule));
        let outcome = inner.sweep(rule);
        debug!(engine = %inner.id, rule = %rule.id(), unmatched = outcome.unmatched, "rule removed");
        true
    }

    /// Snapshot of the registry, in registration order.
    #[must_use]
    pub fn rules(&self) -> Vec<SharedRule<T>> {
        self.inner.rules.lock().clone()
    }

    /// True if `rule` is registered here and the engine is watching.
    #[must_use]
    pub fn is_rule_active(&self, rule: &SharedRule<T>) -> bool {
        self.is_watching() && rule.is_owned_by(self.inner.id)
    }

    /// Subscribes to the change source and reconciles every rule.
    /// Returns false if already watching.
    pub fn start_watching(&self) -> bool {
        let inner = &*self.inner;
        let _section = inner.section.lock();

        if inner.watching.swap(true, Ordering::SeqCst) {
            return false;
        }
        inner.generation.fetch_add(1, Ordering::SeqCst);
        inner.source.connect(inner.notifier());
        info!(engine = %inner.id, rules = inner.rules.lock().len(), "watching started");

        inner.reconcile_all();
        true
    }

    /// Unsubscribes, cancels any scheduled reconciliation and fires
    /// `on_unmatch` for every matched node of every rule. Rules stay
    /// registered. Returns false if not watching.
    pub fn stop_watching(&self) -> bool {
        let inner = &*self.inner;
        let _section = inner.section.lock();

        if !inner.watching.swap(false, Ordering::SeqCst) {
            return false;
        }
        inner.generation.fetch_add(1, Ordering::SeqCst);
        inner.pending.store(false, Ordering::SeqCst);
        inner.tainted.store(false, Ordering::SeqCst);
        inner.source.disconnect(inner.observer);

        let rules = inner.rules.lock().clone();
        let unmatched: usize = rules.iter().map(|rule| inner.sweep(rule).unmatched).sum();
        info!(engine = %inner.id, unmatched, "watching stopped");
        true
    }

    /// Whether the engine is watching.
    #[must_use]
    pub fn is_watching(&self) -> bool {
        self.inner.watching.load(Ordering::SeqCst)
    }

    /// Starts or stops watching. Returns whether a transition occurred.
    pub fn set_watching(&self, watching: bool) -> bool {
        if watching {
            self.start_watching()
        } else {
            self.stop_watching()
        }
    }

    /// Removes every rule (firing exit callbacks), then stops watching.
    pub fn shutdown(&self) {
        let inner = &*self.inner;
        let _section = inner.section.lock();

        let rules = inner.rules.lock().clone();
        for rule in &rules {
            self.remove_rule(rule);
        }
        self.stop_watching();
        info!(engine = %inner.id, removed = rules.len(), "engine shut down");
    }

    /// The watched root; defaults to the tree's root.
    #[must_use]
    pub fn root(&self) -> T::Node {
        self.inner.current_root()
    }

    /// Changes the watched root. Fails with `RootLocked` while watching, and
    /// with `UnknownNode` if `root` is not attached to the watched tree.
    pub fn set_root(&self, root: T::Node) -> DeclResult<()> {
        let inner = &*self.inner;
        let _section = inner.section.lock();

        if inner.watching.load(Ordering::SeqCst) {
            return Err(DeclError::RootLocked);
        }
        if !inner.tree.contains(&root) {
            return Err(TreeError::UnknownNode(format!("{root:?} is not attached to the watched tree")).into());
        }
        *inner.root.lock() = Some(root);
        Ok(())
    }

    /// Runs a reconciliation now, bypassing the scheduler. A no-op while not
    /// watching; inside a running pass it only re-taints.
    pub fn reconcile_now(&self) -> ReconcileReport {
        self.inner.reconcile_all()
    }

    /// Snapshot of the engine counters.
    #[must_use]
    pub fn stats(&self) -> SyncStats {
        let mut stats = self.inner.stats.lock().clone();
        stats.faults_dropped = self.inner.faults.dropped();
        stats
    }

    /// Reader for contained failures.
    #[must_use]
    pub fn faults(&self) -> FaultStream<T::Node> {
        self.inner.faults.stream()
    }
}

impl<T: Tree> Inner<T> {
    fn notifier(&self) -> ChangeNotifier {
        let target: Weak<dyn TaintSink> = self.this.clone();
        ChangeNotifier::new(self.observer, target)
    }

    fn current_root(&self) -> T::Node {
        self.root.lock().clone().unwrap_or_else(|| self.tree.root())
    }

    fn is_current(&self, generation: u64) -> bool {
        self.watching.load(Ordering::SeqCst) && self.generation.load(Ordering::SeqCst) == generation
    }

    fn schedule(&self) {
        if self.pending.swap(true, Ordering::SeqCst) {
            self.stats.lock().coalesced += 1;
            return;
        }

        let this = self.this.clone();
        let generation = self.generation.load(Ordering::SeqCst);
        trace!(engine = %self.id, generation, "reconciliation scheduled");
        self.scheduler.schedule_once(Box::new(move || {
            if let Some(inner) = this.upgrade() {
                inner.run_scheduled(generation);
            }
        }));
    }

    fn run_scheduled(&self, generation: u64) {
        if self.generation.load(Ordering::SeqCst) != generation {
            trace!(engine = %self.id, generation, "stale reconciliation skipped");
            return;
        }
        self.pending.store(false, Ordering::SeqCst);
        if !self.watching.load(Ordering::SeqCst) {
            return;
        }
        self.stats.lock().scheduled_runs += 1;
        self.reconcile_all();
    }

    fn reconcile_all(&self) -> ReconcileReport {
        let _section = self.section.lock();
        if !self.watching.load(Ordering::SeqCst) {
            return ReconcileReport::default();
        }
        self.tainted.store(true, Ordering::SeqCst);
        self.settle(None)
    }

    /// Syncs a freshly added rule, then keeps passing over the registry while
    /// its callbacks re-taint the tree.
    fn reconcile_added(&self, rule: &SharedRule<T>) -> ReconcileReport {
        let _section = self.section.lock();
        if !self.watching.load(Ordering::SeqCst) {
            return ReconcileReport::default();
        }
        self.settle(Some(rule))
    }

    /// The fixpoint loop. Taints raised while it runs re-arm the loop instead
    /// of starting a nested run.
    fn settle(&self, first: Option<&SharedRule<T>>) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        if self.running.swap(true, Ordering::SeqCst) {
            self.tainted.store(true, Ordering::SeqCst);
            self.stats.lock().coalesced += 1;
            return report;
        }

        {
            let _running = RunningGuard(&self.running);
            if let Some(rule) = first {
                report.passes += 1;
                self.stats.lock().passes += 1;
                let generation = self.generation.load(Ordering::SeqCst);
                let root = self.current_root();
                self.sync_into(rule, &root, generation, &mut report);
            }
            while self.tainted.load(Ordering::SeqCst) && self.watching.load(Ordering::SeqCst) {
                if report.passes >= self.config.max_passes {
                    self.tainted.store(false, Ordering::SeqCst);
                    report.cap_hit = true;
                    self.stats.lock().cap_hits += 1;
                    self.faults.report(SyncFault::new(
                        None,
                        FaultKind::PassLimitExceeded { passes: report.passes },
                    ));
                    break;
                }
                self.tainted.store(false, Ordering::SeqCst);
                self.run_pass(&mut report);
            }
        }

        self.stats.lock().last_pass = Some(Utc::now());
        debug!(
            engine = %self.id,
            passes = report.passes,
            matched = report.matched,
            unmatched = report.unmatched,
            cap_hit = report.cap_hit,
            "reconciliation finished"
        );

        // A notification from another thread may have landed after the loop
        // exited but before `running` was cleared.
        if self.tainted.load(Ordering::SeqCst) && self.watching.load(Ordering::SeqCst) {
            self.schedule();
        }
        report
    }

    fn run_pass(&self, report: &mut ReconcileReport) {
        report.passes += 1;
        self.stats.lock().passes += 1;

        let generation = self.generation.load(Ordering::SeqCst);
        let root = self.current_root();
        let rules = self.rules.lock().clone();
        debug!(engine = %self.id, pass = report.passes, rules = rules.len(), "reconciliation pass");

        for rule in &rules {
            if !self.is_current(generation) {
                break;
            }
            if !rule.is_owned_by(self.id) {
                continue;
            }
            self.sync_into(rule, &root, generation, report);
        }
    }

    fn sync_into(&self, rule: &SharedRule<T>, root: &T::Node, generation: u64, report: &mut ReconcileReport) {
        match self.sync_rule(rule, root, generation) {
            Some(outcome) => report.absorb(outcome),
            None => report.evaluation_failures += 1,
        }
    }

    /// Evaluates, diffs and dispatches one rule. `None` if evaluation failed.
    fn sync_rule(&self, rule: &SharedRule<T>, root: &T::Node, generation: u64) -> Option<DispatchOutcome> {
        let evaluator = MatcherEvaluator::new(&*self.tree, self.config.include_root);
        let evaluated = panic::catch_unwind(AssertUnwindSafe(|| evaluator.evaluate(root, rule.matcher())))
            .unwrap_or_else(|payload| {
                Err(EvaluationError::InvalidMatcherResult {
                    reason: format!("matcher panicked: {}", panic_message(&*payload)),
                })
            });

        let current = match evaluated {
            Ok(nodes) => nodes,
            Err(error) => {
                self.stats.lock().evaluation_failures += 1;
                self.faults
                    .report(SyncFault::new(Some(rule.id()), FaultKind::Evaluation(error)));
                return None;
            }
        };

        let delta = diff(&rule.matching_nodes(), &current);
        if delta.is_empty() {
            rule.adopt_order(&current);
            return Some(DispatchOutcome {
                completed: true,
                ..DispatchOutcome::default()
            });
        }
        trace!(
            engine = %self.id,
            rule = %rule.id(),
            added = delta.added.len(),
            removed = delta.removed.len(),
            "match set changed"
        );

        let outcome = CallbackDispatcher::new(&self.faults).dispatch(rule, &delta, || {
            rule.is_owned_by(self.id) && self.is_current(generation)
        });
        self.stats.lock().callback_failures += outcome.failures as u64;
        if outcome.completed {
            rule.adopt_order(&current);
        }
        Some(outcome)
    }

    fn sweep(&self, rule: &SharedRule<T>) -> DispatchOutcome {
        let outcome = CallbackDispatcher::new(&self.faults).sweep(rule);
        self.stats.lock().callback_failures += outcome.failures as u64;
        outcome
    }
}

impl<T: Tree> TaintSink for Inner<T> {
    fn taint(&self) {
        if !self.watching.load(Ordering::SeqCst) {
            return;
        }
        self.stats.lock().notifications += 1;
        self.tainted.store(true, Ordering::SeqCst);

        if self.running.load(Ordering::SeqCst) {
            self.stats.lock().coalesced += 1;
            return;
        }
        self.schedule();
    }
}

impl<T: Tree> Drop for Inner<T> {
    fn drop(&mut self) {
        if *self.watching.get_mut() {
            self.source.disconnect(self.observer);
        }
        for rule in self.rules.get_mut().drain(..) {
            rule.release(self.id);
        }
    }
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}
