use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::json;

use decl::{
    DeclError, Engine, EngineConfig, EvaluationError, FaultKind, FrameScheduler, HandlerRegistry,
    ImmediateScheduler, ManualScheduler, MemoryTree, NodeId, Rule, Tree, TreeError, ValidationError,
};

#[derive(Clone, Default)]
struct Journal(Arc<Mutex<Vec<(&'static str, NodeId)>>>);

impl Journal {
    fn hook(&self, label: &'static str) -> impl Fn(&NodeId) + Send + Sync + 'static {
        let entries = Arc::clone(&self.0);
        move |node: &NodeId| entries.lock().push((label, *node))
    }

    fn take(&self) -> Vec<(&'static str, NodeId)> {
        std::mem::take(&mut *self.0.lock())
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn manual_engine(tree: &Arc<MemoryTree>) -> (Arc<ManualScheduler>, Engine<MemoryTree>) {
    init_tracing();
    let scheduler = Arc::new(ManualScheduler::new());
    let engine = Engine::for_tree(Arc::clone(tree), scheduler.clone(), EngineConfig::default()).unwrap();
    (scheduler, engine)
}

fn immediate_engine(tree: &Arc<MemoryTree>, config: EngineConfig) -> Engine<MemoryTree> {
    init_tracing();
    Engine::for_tree(Arc::clone(tree), Arc::new(ImmediateScheduler), config).unwrap()
}

#[test]
fn class_swap_fires_each_transition_once() {
    let tree = Arc::new(MemoryTree::new("body"));
    let a = tree.append_element(tree.root(), "div", &[("class", "x")]).unwrap();
    let b = tree.append_element(tree.root(), "div", &[]).unwrap();
    let (scheduler, engine) = manual_engine(&tree);

    let journal = Journal::default();
    let rule = Rule::builder()
        .selector(".x")
        .on_match(journal.hook("match"))
        .on_unmatch(journal.hook("unmatch"))
        .build()
        .unwrap();

    assert!(engine.add_rule(&rule).unwrap());
    assert!(journal.take().is_empty());

    assert!(engine.start_watching());
    assert_eq!(rule.matching_nodes(), vec![a]);
    assert_eq!(journal.take(), vec![("match", a)]);

    tree.add_class(b, "x").unwrap();
    tree.remove_class(a, "x").unwrap();
    assert_eq!(scheduler.run_pending(), 1);

    // Additions are dispatched before removals within a rule.
    assert_eq!(journal.take(), vec![("match", b), ("unmatch", a)]);
    assert_eq!(rule.matching_nodes(), vec![b]);
}

#[test]
fn notifications_before_the_scheduled_pass_coalesce() {
    let tree = Arc::new(MemoryTree::new("body"));
    let node = tree.append_element(tree.root(), "div", &[]).unwrap();
    let (scheduler, engine) = manual_engine(&tree);

    let rule = Rule::builder().selector("[data-on]").build().unwrap();
    engine.add_rule(&rule).unwrap();
    engine.start_watching();
    let before = engine.stats();

    tree.set_attribute(node, "data-on", "1").unwrap();
    tree.set_attribute(node, "data-on", "2").unwrap();
    assert_eq!(scheduler.pending(), 1);

    assert_eq!(scheduler.run_pending(), 1);
    let after = engine.stats();
    assert_eq!(after.passes, before.passes + 1);
    assert_eq!(after.scheduled_runs, 1);
    assert_eq!(after.notifications, before.notifications + 2);
    assert!(after.coalesced >= 1);
    assert_eq!(rule.matching_nodes(), vec![node]);
}

#[test]
fn panicking_on_match_keeps_the_node_and_continues() {
    let tree = Arc::new(MemoryTree::new("body"));
    let a = tree.append_element(tree.root(), "div", &[("class", "x")]).unwrap();
    let b = tree.append_element(tree.root(), "div", &[("class", "x")]).unwrap();
    let engine = immediate_engine(&tree, EngineConfig::default());
    let faults = engine.faults();

    let journal = Journal::default();
    let record = journal.hook("first");
    let first = Rule::builder()
        .selector(".x")
        .on_match(move |node: &NodeId| {
            if *node == a {
                panic!("first rule refuses {node}");
            }
            record(node);
        })
        .build()
        .unwrap();
    let second = Rule::builder()
        .selector(".x")
        .on_match(journal.hook("second"))
        .build()
        .unwrap();

    engine.add_rule(&first).unwrap();
    engine.add_rule(&second).unwrap();
    engine.start_watching();

    assert_eq!(first.matching_nodes(), vec![a, b]);
    assert_eq!(second.matching_nodes(), vec![a, b]);
    assert_eq!(journal.take(), vec![("first", b), ("second", a), ("second", b)]);

    let fault = faults.try_recv().unwrap();
    assert_eq!(fault.rule_id, Some(first.id()));
    assert!(fault.is_callback());
    assert!(matches!(fault.kind, FaultKind::MatchCallback { node, .. } if node == a));
    assert_eq!(engine.stats().callback_failures, 1);
}

#[test]
fn shutdown_unmatches_everything_and_empties_the_registry() {
    let tree = Arc::new(MemoryTree::new("body"));
    let a = tree.append_element(tree.root(), "div", &[("class", "a")]).unwrap();
    let b = tree.append_element(tree.root(), "div", &[("class", "b")]).unwrap();
    let engine = immediate_engine(&tree, EngineConfig::default());

    let journal = Journal::default();
    let rule_a = Rule::builder()
        .selector(".a")
        .on_unmatch(journal.hook("unmatch-a"))
        .build()
        .unwrap();
    let rule_b = Rule::builder()
        .selector(".b")
        .on_unmatch(journal.hook("unmatch-b"))
        .build()
        .unwrap();
    engine.add_rule(&rule_a).unwrap();
    engine.add_rule(&rule_b).unwrap();
    engine.start_watching();
    assert_eq!(rule_a.matching_nodes(), vec![a]);
    assert_eq!(rule_b.matching_nodes(), vec![b]);

    engine.shutdown();

    assert_eq!(journal.take(), vec![("unmatch-a", a), ("unmatch-b", b)]);
    assert!(engine.rules().is_empty());
    assert!(!engine.is_watching());
    assert_eq!(tree.observer_count(), 0);
    assert_eq!(rule_a.owner(), None);

    assert!(engine.start_watching());
    assert!(journal.take().is_empty());
    assert_eq!(engine.reconcile_now().matched, 0);
}

#[test]
fn remove_rule_unmatches_synchronously() {
    let tree = Arc::new(MemoryTree::new("body"));
    let a = tree.append_element(tree.root(), "p", &[]).unwrap();
    let b = tree.append_element(tree.root(), "p", &[]).unwrap();
    let (scheduler, engine) = manual_engine(&tree);

    let journal = Journal::default();
    let rule = Rule::builder().selector("p").on_unmatch(journal.hook("unmatch")).build().unwrap();
    engine.add_rule(&rule).unwrap();
    engine.start_watching();

    assert!(engine.remove_rule(&rule));
    assert_eq!(scheduler.pending(), 0);
    assert_eq!(journal.take(), vec![("unmatch", a), ("unmatch", b)]);
    assert!(rule.matching_nodes().is_empty());
    assert!(!engine.is_rule_active(&rule));

    assert!(!engine.remove_rule(&rule));
    assert!(journal.take().is_empty());
}

#[test]
fn add_rule_while_watching_matches_without_a_notification() {
    let tree = Arc::new(MemoryTree::new("body"));
    let item = tree.append_element(tree.root(), "li", &[]).unwrap();
    let (scheduler, engine) = manual_engine(&tree);
    engine.start_watching();

    let journal = Journal::default();
    let rule = Rule::builder().selector("li").on_match(journal.hook("match")).build().unwrap();
    assert!(engine.add_rule(&rule).unwrap());

    assert_eq!(scheduler.pending(), 0);
    assert_eq!(journal.take(), vec![("match", item)]);
    assert!(engine.is_rule_active(&rule));
}

/// `on_match(a)` strips `.x` from `b` while the rule's initial matches are
/// still being dispatched.
fn added_rule_mutating_the_tree_settles(scheduler: Arc<dyn FrameScheduler>) {
    init_tracing();
    let tree = Arc::new(MemoryTree::new("body"));
    let a = tree.append_element(tree.root(), "div", &[("class", "x")]).unwrap();
    let b = tree.append_element(tree.root(), "div", &[("class", "x")]).unwrap();
    let engine = Engine::for_tree(Arc::clone(&tree), scheduler, EngineConfig::default()).unwrap();
    engine.start_watching();

    let journal = Journal::default();
    let record = journal.hook("match");
    let mutate = Arc::clone(&tree);
    let rule = Rule::builder()
        .selector(".x")
        .on_match(move |node: &NodeId| {
            record(node);
            if *node == a {
                mutate.remove_class(b, "x").unwrap();
            }
        })
        .on_unmatch(journal.hook("unmatch"))
        .build()
        .unwrap();
    assert!(engine.add_rule(&rule).unwrap());

    assert!(!tree.has_class(b, "x"));
    assert_eq!(rule.matching_nodes(), vec![a]);
    assert_eq!(journal.take(), vec![("match", a), ("match", b), ("unmatch", b)]);

    let again = engine.reconcile_now();
    assert_eq!(again.matched + again.unmatched, 0);
}

#[test]
fn added_rule_mutating_the_tree_settles_with_immediate_scheduler() {
    added_rule_mutating_the_tree_settles(Arc::new(ImmediateScheduler));
}

#[test]
fn added_rule_mutating_the_tree_settles_with_manual_scheduler() {
    let scheduler = Arc::new(ManualScheduler::new());
    added_rule_mutating_the_tree_settles(scheduler.clone());
    // The running loop absorbed the taint; nothing was deferred.
    assert_eq!(scheduler.pending(), 0);
}

#[test]
fn registry_is_lenient_within_an_engine_and_exclusive_across_engines() {
    let tree = Arc::new(MemoryTree::new("body"));
    let engine = immediate_engine(&tree, EngineConfig::default());
    let other = immediate_engine(&tree, EngineConfig::default());

    let rule = Rule::builder().selector("div").build().unwrap();
    assert!(engine.add_rule(&rule).unwrap());
    assert!(!engine.add_rule(&rule).unwrap());
    assert_eq!(engine.rules().len(), 1);

    let err = other.add_rule(&rule).unwrap_err();
    assert!(err.is_validation());
    assert!(matches!(err, DeclError::Validation(ValidationError::InvalidRuleType { .. })));
    assert!(!other.remove_rule(&rule));

    assert!(engine.remove_rule(&rule));
    assert!(other.add_rule(&rule).unwrap());
}

#[test]
fn reconciling_without_changes_is_idempotent() {
    let tree = Arc::new(MemoryTree::new("body"));
    tree.append_element(tree.root(), "div", &[("class", "x")]).unwrap();
    let (_scheduler, engine) = manual_engine(&tree);

    let journal = Journal::default();
    let rule = Rule::builder()
        .selector(".x")
        .on_match(journal.hook("match"))
        .on_unmatch(journal.hook("unmatch"))
        .build()
        .unwrap();
    engine.add_rule(&rule).unwrap();
    engine.start_watching();
    assert_eq!(journal.take().len(), 1);

    for _ in 0..2 {
        let report = engine.reconcile_now();
        assert_eq!(report.passes, 1);
        assert_eq!(report.matched, 0);
        assert_eq!(report.unmatched, 0);
    }
    assert!(journal.take().is_empty());
}

#[test]
fn callback_mutation_is_reconciled_until_stable() {
    let tree = Arc::new(MemoryTree::new("body"));
    let engine = immediate_engine(&tree, EngineConfig::default());

    let journal = Journal::default();
    let mutate = Arc::clone(&tree);
    let record = journal.hook("pending+");
    let pending = Rule::builder()
        .selector(".pending")
        .on_match(move |node: &NodeId| {
            record(node);
            mutate.remove_class(*node, "pending").unwrap();
            mutate.add_class(*node, "ready").unwrap();
        })
        .on_unmatch(journal.hook("pending-"))
        .build()
        .unwrap();
    let ready = Rule::builder()
        .selector(".ready")
        .on_match(journal.hook("ready+"))
        .build()
        .unwrap();
    engine.add_rule(&pending).unwrap();
    engine.add_rule(&ready).unwrap();
    engine.start_watching();

    let node = tree.append_element(tree.root(), "div", &[("class", "pending")]).unwrap();

    assert_eq!(
        journal.take(),
        vec![("pending+", node), ("ready+", node), ("pending-", node)]
    );
    assert!(pending.matching_nodes().is_empty());
    assert_eq!(ready.matching_nodes(), vec![node]);
    assert_eq!(engine.stats().cap_hits, 0);
}

#[test]
fn perpetual_retaint_hits_the_pass_cap() {
    let tree = Arc::new(MemoryTree::new("body"));
    let node = tree.append_element(tree.root(), "div", &[("class", "flip")]).unwrap();
    let scheduler = Arc::new(ManualScheduler::new());
    let config = EngineConfig {
        max_passes: 4,
        ..EngineConfig::default()
    };
    let engine = Engine::for_tree(Arc::clone(&tree), scheduler.clone(), config).unwrap();
    let faults = engine.faults();

    let on = Arc::clone(&tree);
    let off = Arc::clone(&tree);
    let rule = Rule::builder()
        .selector(".flip")
        .on_match(move |n: &NodeId| on.remove_class(*n, "flip").unwrap())
        .on_unmatch(move |n: &NodeId| off.add_class(*n, "flip").unwrap())
        .build()
        .unwrap();
    engine.add_rule(&rule).unwrap();
    engine.start_watching();

    let stats = engine.stats();
    assert_eq!(stats.passes, 4);
    assert_eq!(stats.cap_hits, 1);
    assert_eq!(scheduler.pending(), 0);

    let kinds: Vec<_> = faults.drain().into_iter().map(|f| f.kind).collect();
    assert_eq!(kinds, vec![FaultKind::PassLimitExceeded { passes: 4 }]);

    // Four passes alternate match/unmatch, so the class is back.
    assert!(tree.has_class(node, "flip"));
    assert!(rule.matching_nodes().is_empty());
}

#[test]
fn stale_pass_after_stop_watching_is_a_no_op() {
    let tree = Arc::new(MemoryTree::new("body"));
    let (scheduler, engine) = manual_engine(&tree);

    let journal = Journal::default();
    let rule = Rule::builder().selector("div").on_match(journal.hook("match")).build().unwrap();
    engine.add_rule(&rule).unwrap();
    engine.start_watching();

    tree.append_element(tree.root(), "div", &[]).unwrap();
    assert_eq!(scheduler.pending(), 1);
    assert!(engine.stop_watching());

    assert_eq!(scheduler.run_pending(), 1);
    assert!(journal.take().is_empty());
    assert!(rule.matching_nodes().is_empty());
    assert_eq!(engine.stats().scheduled_runs, 0);
}

#[test]
fn stop_watching_unmatches_but_keeps_rules() {
    let tree = Arc::new(MemoryTree::new("body"));
    let node = tree.append_element(tree.root(), "div", &[]).unwrap();
    let engine = immediate_engine(&tree, EngineConfig::default());

    let journal = Journal::default();
    let rule = Rule::builder()
        .selector("div")
        .on_match(journal.hook("match"))
        .on_unmatch(journal.hook("unmatch"))
        .build()
        .unwrap();
    engine.add_rule(&rule).unwrap();
    assert!(engine.set_watching(true));

    assert!(engine.set_watching(false));
    assert_eq!(journal.take(), vec![("match", node), ("unmatch", node)]);
    assert_eq!(engine.rules().len(), 1);
    assert!(!engine.is_rule_active(&rule));

    // Changes while idle are ignored.
    tree.append_element(tree.root(), "div", &[]).unwrap();
    assert!(journal.take().is_empty());

    assert!(engine.start_watching());
    assert_eq!(rule.match_count(), 2);
}

#[test]
fn evaluation_failure_skips_only_that_rule() {
    let tree = Arc::new(MemoryTree::new("body"));
    let node = tree.append_element(tree.root(), "div", &[("class", "x")]).unwrap();
    let engine = immediate_engine(&tree, EngineConfig::default());
    let faults = engine.faults();

    let broken = Rule::builder().selector("div > p").build().unwrap();
    let healthy = Rule::builder().selector(".x").build().unwrap();
    engine.add_rule(&broken).unwrap();
    engine.add_rule(&healthy).unwrap();
    engine.start_watching();

    assert!(broken.matching_nodes().is_empty());
    assert_eq!(healthy.matching_nodes(), vec![node]);

    let report = engine.reconcile_now();
    assert_eq!(report.evaluation_failures, 1);

    let fault = faults.try_recv().unwrap();
    assert_eq!(fault.rule_id, Some(broken.id()));
    assert!(matches!(
        fault.kind,
        FaultKind::Evaluation(EvaluationError::Tree(TreeError::InvalidSelector { .. }))
    ));
}

#[test]
fn callback_removing_its_own_rule_ends_dispatch() {
    let tree = Arc::new(MemoryTree::new("body"));
    let a = tree.append_element(tree.root(), "div", &[]).unwrap();
    tree.append_element(tree.root(), "div", &[]).unwrap();
    let engine = immediate_engine(&tree, EngineConfig::default());

    let journal = Journal::default();
    let slot: Arc<Mutex<Option<Arc<Rule<NodeId>>>>> = Arc::default();
    let handle = engine.clone();
    let own = Arc::clone(&slot);
    let record = journal.hook("match");
    let rule = Rule::builder()
        .selector("div")
        .on_match(move |node: &NodeId| {
            record(node);
            let this = own.lock().take();
            if let Some(this) = this {
                handle.remove_rule(&this);
            }
        })
        .on_unmatch(journal.hook("unmatch"))
        .build()
        .unwrap();
    *slot.lock() = Some(Arc::clone(&rule));

    engine.add_rule(&rule).unwrap();
    engine.start_watching();

    assert_eq!(journal.take(), vec![("match", a), ("unmatch", a)]);
    assert!(rule.matching_nodes().is_empty());
    assert!(engine.rules().is_empty());
}

#[test]
fn root_scoping_and_root_inclusion() {
    let tree = Arc::new(MemoryTree::new("body"));
    let section = tree.append_element(tree.root(), "section", &[("class", "x")]).unwrap();
    let inside = tree.append_element(section, "div", &[("class", "x")]).unwrap();
    tree.append_element(tree.root(), "div", &[("class", "x")]).unwrap();

    let scoped = immediate_engine(&tree, EngineConfig::default());
    scoped.set_root(section).unwrap();
    let rule = Rule::builder().selector(".x").build().unwrap();
    scoped.add_rule(&rule).unwrap();
    scoped.start_watching();
    assert_eq!(rule.matching_nodes(), vec![section, inside]);
    assert!(matches!(scoped.set_root(tree.root()), Err(DeclError::RootLocked)));

    let config = EngineConfig {
        include_root: false,
        ..EngineConfig::default()
    };
    let exclusive = immediate_engine(&tree, config);
    exclusive.set_root(section).unwrap();
    let rule = Rule::builder().selector(".x").build().unwrap();
    exclusive.add_rule(&rule).unwrap();
    exclusive.start_watching();
    assert_eq!(rule.matching_nodes(), vec![inside]);
}

#[test]
fn rules_loaded_from_json_definitions() {
    let tree = Arc::new(MemoryTree::new("body"));
    let tip = tree.append_element(tree.root(), "span", &[("data-tooltip", "hi")]).unwrap();
    let engine = immediate_engine(&tree, EngineConfig::default());

    let journal = Journal::default();
    let mut handlers = HandlerRegistry::new();
    handlers
        .register("attach", journal.hook("attach"))
        .register("detach", journal.hook("detach"));

    let rules = handlers
        .load(&json!([
            { "selector": "[data-tooltip]", "matches": "attach", "unmatches": "detach" },
            { "selector": "span" }
        ]))
        .unwrap();
    for rule in &rules {
        engine.add_rule(rule).unwrap();
    }
    engine.start_watching();
    assert_eq!(journal.take(), vec![("attach", tip)]);
    assert_eq!(rules[1].matching_nodes(), vec![tip]);

    tree.remove_attribute(tip, "data-tooltip").unwrap();
    assert_eq!(journal.take(), vec![("detach", tip)]);

    let err = handlers.load(&json!({ "selector": "a", "matches": "missing" })).unwrap_err();
    assert!(matches!(err, ValidationError::InvalidCallbackType { .. }));
}

#[test]
fn timer_scheduler_reconciles_in_the_background() {
    let tree = Arc::new(MemoryTree::new("body"));
    let config = EngineConfig {
        fallback_interval_ms: 5,
        ..EngineConfig::default()
    };
    let engine = Engine::with_timer(Arc::clone(&tree), tree.clone(), config).unwrap();

    let rule = Rule::builder().selector(".late").build().unwrap();
    engine.add_rule(&rule).unwrap();
    engine.start_watching();

    let node = tree.append_element(tree.root(), "div", &[("class", "late")]).unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while rule.matching_nodes().is_empty() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(2));
    }
    assert_eq!(rule.matching_nodes(), vec![node]);
    assert!(engine.stats().scheduled_runs >= 1);

    engine.shutdown();
    assert!(rule.matching_nodes().is_empty());
}
