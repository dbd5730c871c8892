use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use cinder_cache::{CacheLayout, CacheManager};
use cinder_core::{
    Action, ActionTable, BundleItem, EvaluationContext, ExeKind, FailurePolicy, ItemSet,
    ItemState, Operation, OperationPolicies, OperationRow, PackageKind, PatchTrain, Payload,
    Predicate, ResultCode, Verdict,
};
use semver::Version;

use super::{
    CompositePerformer, EngineConfig, MemoryLog, NoSourceResolver, Performer, PerformerFactory,
    ProgressObserver, SourceResolution, SourceResolver,
};

fn test_base(name: &str) -> PathBuf {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system time")
        .as_nanos();
    std::env::temp_dir().join(format!(
        "cinder-engine-tests-{}-{}-{}",
        std::process::id(),
        nanos,
        name
    ))
}

fn test_item(id: &str, present: bool) -> BundleItem {
    BundleItem {
        id: id.to_string(),
        display_name: id.to_string(),
        kind: PackageKind::Msi,
        exe_kind: ExeKind::Generic,
        version: Version::new(1, 0, 0),
        per_machine: false,
        durable_cache: true,
        rollback_eligible: true,
        ignorable: false,
        requested_absent: false,
        weight: 1,
        payload: None,
        children: Vec::new(),
        applicability: Predicate::Always(true),
        presence: Predicate::Always(present),
        actions: ActionTable::default(),
        action_state: None,
        product_code: None,
        product_codes: Vec::new(),
        service_name: None,
        patch_train: PatchTrain::None,
        ldr_baseline: false,
        install_args: Vec::new(),
        state: ItemState::Available,
        current_path: None,
        verified: false,
        download_pending: false,
    }
}

struct ScriptedPerformer {
    entry: String,
    code: ResultCode,
    journal: Arc<Mutex<Vec<String>>>,
}

impl Performer for ScriptedPerformer {
    fn execute(&mut self, observer: &mut dyn ProgressObserver) -> Result<ResultCode> {
        observer.on_progress(128);
        self.journal
            .lock()
            .expect("journal lock")
            .push(self.entry.clone());
        Ok(self.code)
    }

    fn abort(&mut self) {}

    fn rollback(&mut self, _observer: &mut dyn ProgressObserver) -> Result<ResultCode> {
        self.journal
            .lock()
            .expect("journal lock")
            .push(format!("{}:in-place-undo", self.entry));
        Ok(ResultCode::OK)
    }
}

#[derive(Default)]
struct ScriptedFactory {
    results: HashMap<(String, &'static str), ResultCode>,
    journal: Arc<Mutex<Vec<String>>>,
}

impl ScriptedFactory {
    fn with_results(results: Vec<(&str, Action, ResultCode)>) -> Self {
        let mut map = HashMap::new();
        for (id, action, code) in results {
            map.insert((id.to_string(), action.as_str()), code);
        }
        Self {
            results: map,
            journal: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn journal(&self) -> Vec<String> {
        self.journal.lock().expect("journal lock").clone()
    }
}

impl PerformerFactory for ScriptedFactory {
    fn create(&self, item: &BundleItem, action: Action) -> Result<Box<dyn Performer>> {
        let code = self
            .results
            .get(&(item.id.clone(), action.as_str()))
            .copied()
            .unwrap_or(ResultCode::OK);
        Ok(Box::new(ScriptedPerformer {
            entry: format!("{}:{}", item.id, action.as_str()),
            code,
            journal: Arc::clone(&self.journal),
        }))
    }
}

#[derive(Default)]
struct RecordingObserver {
    finished_codes: Vec<ResultCode>,
    reboot_pending: bool,
    cancel_from_position: Option<u8>,
}

impl ProgressObserver for RecordingObserver {
    fn on_progress(&mut self, position: u8) -> Verdict {
        match self.cancel_from_position {
            Some(threshold) if position >= threshold => Verdict::Cancel,
            _ => Verdict::Continue,
        }
    }

    fn on_reboot_pending(&mut self) {
        self.reboot_pending = true;
    }

    fn finished(&mut self, result: ResultCode) {
        self.finished_codes.push(result);
    }
}

struct World {
    orchestrator: CompositePerformer,
    factory: Arc<ScriptedFactory>,
    items: ItemSet,
    base: PathBuf,
}

fn build_world(
    name: &str,
    items: Vec<BundleItem>,
    operation: Operation,
    results: Vec<(&str, Action, ResultCode)>,
) -> World {
    let base = test_base(name);
    let item_set = ItemSet::new(items);
    let layout = CacheLayout::new(base.join("machine"), base.join("user"), "bundle-test");
    let cache = CacheManager::new(layout, item_set.clone());
    let config = EngineConfig {
        lock_path: base.join("install.lock"),
        poll_interval: Duration::from_millis(1),
        download_wait: Duration::from_millis(10),
        ..EngineConfig::default()
    };
    let factory = Arc::new(ScriptedFactory::with_results(results));

    let orchestrator = CompositePerformer::new(
        item_set.clone(),
        cache,
        config,
        EvaluationContext::new(),
        OperationPolicies::default(),
        super::AbortSignal::new(),
        Arc::clone(&factory) as Arc<dyn PerformerFactory>,
        operation,
    );

    World {
        orchestrator,
        factory,
        items: item_set,
        base,
    }
}

fn run(world: &mut World, observer: &mut RecordingObserver) -> ResultCode {
    let mut resolver = NoSourceResolver;
    let mut log = MemoryLog::default();
    let mut services = super::EngineServices {
        source_resolver: &mut resolver,
        bridge: None,
        log: &mut log,
        reboot_pending: false,
    };
    world.orchestrator.perform(observer, &mut services)
}

#[test]
fn install_runs_all_items_in_authored_order() {
    let mut world = build_world(
        "install-order",
        vec![
            test_item("a", false),
            test_item("b", false),
            test_item("c", false),
        ],
        Operation::Installing,
        Vec::new(),
    );

    let mut observer = RecordingObserver::default();
    let code = run(&mut world, &mut observer);

    assert_eq!(code, ResultCode::OK);
    assert_eq!(
        world.factory.journal(),
        vec!["a:install", "b:install", "c:install"]
    );
    assert_eq!(observer.finished_codes, vec![ResultCode::OK]);
    for index in 0..3 {
        assert_eq!(world.items.state(index), Some(ItemState::Complete));
    }

    let _ = std::fs::remove_dir_all(&world.base);
}

#[test]
fn uninstall_iterates_in_exact_reverse_order() {
    let mut world = build_world(
        "uninstall-order",
        vec![
            test_item("a", true),
            test_item("b", true),
            test_item("c", true),
        ],
        Operation::Uninstalling,
        Vec::new(),
    );

    let code = run(&mut world, &mut RecordingObserver::default());
    assert_eq!(code, ResultCode::OK);
    assert_eq!(
        world.factory.journal(),
        vec!["c:uninstall", "b:uninstall", "a:uninstall"]
    );

    let _ = std::fs::remove_dir_all(&world.base);
}

#[test]
fn repair_iterates_in_authored_order() {
    let mut world = build_world(
        "repair-order",
        vec![
            test_item("a", true),
            test_item("b", true),
            test_item("c", true),
        ],
        Operation::Repairing,
        Vec::new(),
    );

    let code = run(&mut world, &mut RecordingObserver::default());
    assert_eq!(code, ResultCode::OK);
    assert_eq!(
        world.factory.journal(),
        vec!["a:repair", "b:repair", "c:repair"]
    );

    let _ = std::fs::remove_dir_all(&world.base);
}

#[test]
fn rollback_uninstalls_completed_prefix_in_reverse_and_reports_original_error() {
    let mut world = build_world(
        "rollback",
        vec![
            test_item("a", false),
            test_item("b", false),
            test_item("c", false),
        ],
        Operation::Installing,
        vec![("b", Action::Install, ResultCode::FAILED)],
    );

    let mut observer = RecordingObserver::default();
    let code = run(&mut world, &mut observer);

    assert_eq!(code, ResultCode::FAILED, "first error wins");
    assert_eq!(
        world.factory.journal(),
        vec!["a:install", "b:install", "a:uninstall"],
        "item c is never attempted and only item a rolls back"
    );
    assert_eq!(observer.finished_codes, vec![ResultCode::FAILED]);
    assert_ne!(world.items.state(2), Some(ItemState::Complete));

    let _ = std::fs::remove_dir_all(&world.base);
}

#[test]
fn rollback_skips_items_marked_ineligible() {
    let mut ineligible = test_item("a", false);
    ineligible.rollback_eligible = false;
    let mut world = build_world(
        "rollback-ineligible",
        vec![
            ineligible,
            test_item("b", false),
            test_item("c", false),
        ],
        Operation::Installing,
        vec![("c", Action::Install, ResultCode::FAILED)],
    );

    let code = run(&mut world, &mut RecordingObserver::default());
    assert_eq!(code, ResultCode::FAILED);
    assert_eq!(
        world.factory.journal(),
        vec!["a:install", "b:install", "c:install", "b:uninstall"]
    );

    let _ = std::fs::remove_dir_all(&world.base);
}

#[test]
fn stop_policy_halts_without_rollback() {
    let mut stopper = test_item("b", false);
    stopper.actions = ActionTable {
        install: OperationRow {
            when_present: Action::Noop,
            when_absent: Action::Install,
            on_failure: FailurePolicy::Stop,
        },
        ..ActionTable::default()
    };
    let mut world = build_world(
        "stop-policy",
        vec![test_item("a", false), stopper, test_item("c", false)],
        Operation::Installing,
        vec![("b", Action::Install, ResultCode::FAILED)],
    );

    let code = run(&mut world, &mut RecordingObserver::default());
    assert_eq!(code, ResultCode::FAILED);
    assert_eq!(world.factory.journal(), vec!["a:install", "b:install"]);
    assert_eq!(world.items.state(0), Some(ItemState::Complete));

    let _ = std::fs::remove_dir_all(&world.base);
}

#[test]
fn continue_policy_finishes_remaining_items_and_keeps_first_error() {
    let mut continuing = test_item("b", false);
    continuing.actions.install.on_failure = FailurePolicy::Continue;
    let mut also_failing = test_item("c", false);
    also_failing.actions.install.on_failure = FailurePolicy::Continue;

    let mut world = build_world(
        "continue-policy",
        vec![test_item("a", false), continuing, also_failing],
        Operation::Installing,
        vec![
            ("b", Action::Install, ResultCode::FAILED),
            ("c", Action::Install, ResultCode::LOCK_TIMEOUT),
        ],
    );

    let code = run(&mut world, &mut RecordingObserver::default());
    assert_eq!(code, ResultCode::FAILED, "earliest failure is the result");
    assert_eq!(
        world.factory.journal(),
        vec!["a:install", "b:install", "c:install"]
    );

    let _ = std::fs::remove_dir_all(&world.base);
}

#[test]
fn uninstall_failures_never_trigger_rollback() {
    let mut failing = test_item("b", true);
    failing.actions.uninstall.on_failure = FailurePolicy::Rollback;
    let mut world = build_world(
        "uninstall-no-rollback",
        vec![test_item("a", true), failing, test_item("c", true)],
        Operation::Uninstalling,
        vec![("b", Action::Uninstall, ResultCode::FAILED)],
    );

    let code = run(&mut world, &mut RecordingObserver::default());
    assert_eq!(code, ResultCode::FAILED);
    // reverse order: c first, then b fails and the run stops; nothing is
    // re-installed
    assert_eq!(world.factory.journal(), vec!["c:uninstall", "b:uninstall"]);

    let _ = std::fs::remove_dir_all(&world.base);
}

#[test]
fn pre_aborted_run_reports_cancelled_without_executing() {
    let mut world = build_world(
        "pre-aborted",
        vec![test_item("a", false)],
        Operation::Installing,
        Vec::new(),
    );
    world.orchestrator.abort_signal().request();

    let mut observer = RecordingObserver::default();
    let code = run(&mut world, &mut observer);

    assert_eq!(code, ResultCode::CANCELLED);
    assert!(world.factory.journal().is_empty());
    assert_eq!(observer.finished_codes, vec![ResultCode::CANCELLED]);

    let _ = std::fs::remove_dir_all(&world.base);
}

#[test]
fn cancel_verdict_mid_run_rolls_back_completed_items() {
    let mut world = build_world(
        "cancel-mid-run",
        vec![test_item("a", false), test_item("b", false)],
        Operation::Installing,
        Vec::new(),
    );

    // cancel as soon as the first item completes (progress hits 127)
    let mut observer = RecordingObserver {
        cancel_from_position: Some(127),
        ..RecordingObserver::default()
    };
    let code = run(&mut world, &mut observer);

    assert_eq!(code, ResultCode::CANCELLED);
    let journal = world.factory.journal();
    assert!(journal.contains(&"a:install".to_string()));
    assert!(
        journal.iter().any(|entry| entry.contains("a:") && entry.contains("undo")
            || entry == "a:uninstall"),
        "completed item must be undone: {journal:?}"
    );
    assert!(!journal.contains(&"b:install".to_string()));

    let _ = std::fs::remove_dir_all(&world.base);
}

#[test]
fn reboot_required_is_recorded_but_not_fatal() {
    let mut world = build_world(
        "reboot",
        vec![test_item("a", false), test_item("b", false)],
        Operation::Installing,
        vec![("a", Action::Install, ResultCode::REBOOT_REQUIRED)],
    );

    let mut observer = RecordingObserver::default();
    let code = run(&mut world, &mut observer);

    assert_eq!(code, ResultCode::REBOOT_REQUIRED);
    assert!(observer.reboot_pending);
    assert_eq!(
        world.factory.journal(),
        vec!["a:install", "b:install"],
        "a pending reboot never stops the run"
    );

    let _ = std::fs::remove_dir_all(&world.base);
}

#[test]
fn ignorable_item_with_missing_payload_is_skipped() {
    let mut missing = test_item("a", false);
    missing.ignorable = true;
    missing.state = ItemState::NotAvailable;
    missing.payload = Some(Payload {
        url: Some("https://example.test/a.msi".to_string()),
        source_path: None,
        sha256: "00".repeat(32),
        size: 8,
        cache_filename: "a.msi".to_string(),
    });

    let mut world = build_world(
        "ignorable",
        vec![missing, test_item("b", false)],
        Operation::Installing,
        Vec::new(),
    );

    let code = run(&mut world, &mut RecordingObserver::default());
    assert_eq!(code, ResultCode::OK);
    assert_eq!(world.factory.journal(), vec!["b:install"]);
    assert_eq!(world.items.state(0), Some(ItemState::Ignorable));

    let _ = std::fs::remove_dir_all(&world.base);
}

#[test]
fn missing_payload_on_required_item_fails_the_run() {
    let mut missing = test_item("a", false);
    missing.state = ItemState::NotAvailable;
    missing.payload = Some(Payload {
        url: Some("https://example.test/a.msi".to_string()),
        source_path: None,
        sha256: "00".repeat(32),
        size: 8,
        cache_filename: "a.msi".to_string(),
    });

    let mut world = build_world(
        "missing-payload",
        vec![missing, test_item("b", false)],
        Operation::Installing,
        Vec::new(),
    );

    let code = run(&mut world, &mut RecordingObserver::default());
    assert_eq!(code, ResultCode::PAYLOAD_UNAVAILABLE);
    assert!(world.factory.journal().is_empty());

    let _ = std::fs::remove_dir_all(&world.base);
}

#[test]
fn source_resolver_retry_budget_counts_only_real_prompts() {
    struct CountingResolver {
        prompts: u32,
    }

    impl SourceResolver for CountingResolver {
        fn resolve_source(&mut self, _item: &BundleItem) -> SourceResolution {
            self.prompts += 1;
            // hand back a path that never verifies, forcing another prompt
            SourceResolution::Retry(PathBuf::from("/definitely/not/here.msi"))
        }
    }

    let mut missing = test_item("a", false);
    missing.state = ItemState::NotAvailable;
    missing.payload = Some(Payload {
        url: None,
        source_path: None,
        sha256: "00".repeat(32),
        size: 8,
        cache_filename: "a.msi".to_string(),
    });

    let mut world = build_world(
        "retry-budget",
        vec![missing],
        Operation::Installing,
        Vec::new(),
    );

    let mut resolver = CountingResolver { prompts: 0 };
    let mut log = MemoryLog::default();
    let mut observer = RecordingObserver::default();
    let mut services = super::EngineServices {
        source_resolver: &mut resolver,
        bridge: None,
        log: &mut log,
        reboot_pending: false,
    };
    let code = world.orchestrator.perform(&mut observer, &mut services);

    assert_eq!(code, ResultCode::PAYLOAD_UNAVAILABLE);
    assert_eq!(
        resolver.prompts,
        world_budget(),
        "exactly the budgeted number of prompts is shown"
    );

    let _ = std::fs::remove_dir_all(&world.base);
}

fn world_budget() -> u32 {
    EngineConfig::default().source_retry_budget
}

#[test]
fn source_cancel_aborts_the_whole_run() {
    struct CancellingResolver;

    impl SourceResolver for CancellingResolver {
        fn resolve_source(&mut self, _item: &BundleItem) -> SourceResolution {
            SourceResolution::Cancel
        }
    }

    let mut missing = test_item("a", false);
    missing.state = ItemState::NotAvailable;
    missing.payload = Some(Payload {
        url: None,
        source_path: None,
        sha256: "00".repeat(32),
        size: 8,
        cache_filename: "a.msi".to_string(),
    });

    let mut world = build_world(
        "source-cancel",
        vec![missing, test_item("b", false)],
        Operation::Installing,
        Vec::new(),
    );

    let mut resolver = CancellingResolver;
    let mut log = MemoryLog::default();
    let mut observer = RecordingObserver::default();
    let mut services = super::EngineServices {
        source_resolver: &mut resolver,
        bridge: None,
        log: &mut log,
        reboot_pending: false,
    };
    let code = world.orchestrator.perform(&mut observer, &mut services);

    assert_eq!(code, ResultCode::CANCELLED);
    assert!(world.factory.journal().is_empty());

    let _ = std::fs::remove_dir_all(&world.base);
}
