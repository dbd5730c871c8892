use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use cinder_cache::{CacheManager, ElevationDelegate};
use cinder_core::{
    merged_failure_policy, Action, ActionState, BundleItem, EvaluationContext, FailurePolicy,
    FirstError, ItemSet, ItemState, Operation, OperationPolicies, ResultCode, RunMode,
};

use crate::abort::AbortSignal;
use crate::config::EngineConfig;
use crate::lock::{wait_for_install_lock, LockWaitOutcome};
use crate::logging::RunLog;
use crate::performer::{Performer, PerformerFactory};
use crate::progress::{
    ProgressObserver, ProgressState, RollbackObserver, WeightedObserver,
};
use crate::resolver::{resolve_action, resolve_failure_policy};

/// The UI's answer when a payload source cannot be found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceResolution {
    /// Try again from this path.
    Retry(PathBuf),
    /// Give up on this item.
    Skip,
    /// Abort the whole run.
    Cancel,
}

/// Callback used to ask the user (or an unattended policy) for a missing
/// payload source.
pub trait SourceResolver {
    fn resolve_source(&mut self, item: &BundleItem) -> SourceResolution;
}

/// Unattended sessions have nobody to ask.
#[derive(Debug, Default)]
pub struct NoSourceResolver;

impl SourceResolver for NoSourceResolver {
    fn resolve_source(&mut self, _item: &BundleItem) -> SourceResolution {
        SourceResolution::Skip
    }
}

/// Full elevation seam: per-machine cache operations plus remote package
/// execution, both served by the elevated process.
pub trait ElevationBridge: ElevationDelegate {
    fn apply_package(
        &mut self,
        index: usize,
        operation: Operation,
        action: Action,
    ) -> Result<ResultCode>;
}

/// Collaborators the driver supplies per run.
pub struct EngineServices<'a> {
    pub source_resolver: &'a mut dyn SourceResolver,
    pub bridge: Option<&'a mut dyn ElevationBridge>,
    pub log: &'a mut dyn RunLog,
    /// Owned by the driver; a pending reboot keeps the temp cache alive.
    pub reboot_pending: bool,
}

impl EngineServices<'_> {
    fn delegate(&mut self) -> Option<&mut dyn ElevationDelegate> {
        self.bridge
            .as_deref_mut()
            .map(|bridge| bridge as &mut dyn ElevationDelegate)
    }
}

enum ItemOutcome {
    Done(ResultCode),
    Skipped,
}

enum EnsureOutcome {
    Available,
    Unavailable,
    Cancelled,
}

/// The top-level control loop: drives one operation over the ordered item
/// collection, accumulates the first error, and replays a reversed
/// sub-sequence as uninstalls when an install run must roll back.
pub struct CompositePerformer {
    items: ItemSet,
    cache: CacheManager,
    config: EngineConfig,
    ctx: EvaluationContext,
    policies: OperationPolicies,
    abort: AbortSignal,
    factory: Arc<dyn PerformerFactory>,
    operation: Operation,
    run_mode: RunMode,
    restrict: Option<Vec<usize>>,
}

impl CompositePerformer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        items: ItemSet,
        cache: CacheManager,
        config: EngineConfig,
        ctx: EvaluationContext,
        policies: OperationPolicies,
        abort: AbortSignal,
        factory: Arc<dyn PerformerFactory>,
        operation: Operation,
    ) -> Self {
        Self {
            items,
            cache,
            config,
            ctx,
            policies,
            abort,
            factory,
            operation,
            run_mode: RunMode::Normal,
            restrict: None,
        }
    }

    pub fn abort_signal(&self) -> AbortSignal {
        self.abort.clone()
    }

    pub fn package(&self, index: usize) -> Option<BundleItem> {
        self.items.item(index)
    }

    /// Re-point one item's live payload at a new location. The next cache
    /// check verifies the file before anything trusts it.
    pub fn update_package_location(&self, index: usize, path: PathBuf) {
        let mut items = self.items.lock();
        if let Some(item) = items.get_mut(index) {
            item.current_path = Some(path);
            item.verified = false;
            if item.state.can_transition(ItemState::AvailableUnverified) {
                item.state = ItemState::AvailableUnverified;
            }
        }
    }

    pub fn create_package_performer(
        &self,
        item: &BundleItem,
        action: Action,
    ) -> Result<Box<dyn Performer>> {
        self.factory.create(item, action)
    }

    /// Execute one already-resolved (index, action) pair locally. This is
    /// the entry point the elevated process serves ApplyPackage requests
    /// through.
    pub fn apply_single(
        &self,
        index: usize,
        action: Action,
        observer: &mut dyn ProgressObserver,
    ) -> Result<ResultCode> {
        let Some(item) = self.items.item(index) else {
            return Ok(ResultCode::FAILED);
        };
        let mut performer = self.factory.create(&item, action)?;
        let code = performer.execute(observer)?;
        let code = if action == Action::Uninstall {
            code.normalized_for_uninstall()
        } else {
            code
        };
        if code.is_success() {
            self.items.mark_complete(index);
        }
        Ok(code)
    }

    /// Drive the whole operation. `finished` is called on the observer
    /// exactly once, with the accumulated first error (success if none).
    pub fn perform(
        &mut self,
        observer: &mut dyn ProgressObserver,
        services: &mut EngineServices,
    ) -> ResultCode {
        let code = match self.run(observer, services) {
            Ok(code) => code,
            Err(err) => {
                services.log.error(&format!("{} run failed: {err:#}", self.operation.as_str()));
                ResultCode::FAILED
            }
        };
        observer.finished(code);
        code
    }

    fn run(
        &mut self,
        observer: &mut dyn ProgressObserver,
        services: &mut EngineServices,
    ) -> Result<ResultCode> {
        let mut first_error = FirstError::new();
        let mut last_attempted: Option<usize> = None;

        let (rollback_requested, final_position) =
            self.run_items(observer, services, &mut first_error, &mut last_attempted)?;

        if first_error.reboot_required() {
            services.reboot_pending = true;
        }

        if rollback_requested
            && self.run_mode == RunMode::Normal
            && self.operation == Operation::Installing
        {
            self.run_rollback(observer, services, last_attempted, final_position);

            // anything staged past the failure point will never install
            if let Some(last) = last_attempted {
                for index in (last + 1)..self.items.len() {
                    if let Err(err) = self.cache.delete_cached_package(index, services.delegate())
                    {
                        services
                            .log
                            .debug(&format!("post-rollback cache purge skipped: {err:#}"));
                    }
                }
            }
        }

        self.session_epilogue(services);
        Ok(first_error.result())
    }

    fn iteration_order(&self) -> Vec<usize> {
        let mut order: Vec<usize> = match &self.restrict {
            Some(list) => list.clone(),
            None => (0..self.items.len()).collect(),
        };
        if self.operation == Operation::Uninstalling {
            order.reverse();
        }
        order
    }

    fn run_items(
        &mut self,
        observer: &mut dyn ProgressObserver,
        services: &mut EngineServices,
        first_error: &mut FirstError,
        last_attempted: &mut Option<usize>,
    ) -> Result<(bool, u8)> {
        let order = self.iteration_order();

        let total_weight: u64 = order
            .iter()
            .filter_map(|&index| self.items.item(index))
            .filter(|item| item.applicability.evaluate(&self.ctx))
            .filter(|item| {
                resolve_action(item, self.operation, &self.ctx, self.run_mode) != Action::Noop
            })
            .map(|item| u64::from(item.weight))
            .sum();
        let mut weighted = WeightedObserver::new(observer, total_weight);

        let mut rollback_requested = false;

        for &index in &order {
            if self.abort.is_aborted() {
                first_error.abort();
                rollback_requested = self.operation == Operation::Installing;
                break;
            }

            let Some(item) = self.items.item(index) else {
                continue;
            };
            if !item.applicability.evaluate(&self.ctx) {
                continue;
            }
            if item.action_state == Some(ActionState::None) {
                continue;
            }

            let action = resolve_action(&item, self.operation, &self.ctx, self.run_mode);
            if action == Action::Noop {
                continue;
            }

            weighted.begin_item(item.weight);
            services.log.section_start(&item.display_name);
            *last_attempted = Some(index);

            let outcome = self.perform_item(index, &item, action, &mut weighted, services)?;
            services.log.section_end(&item.display_name);

            let code = match outcome {
                ItemOutcome::Skipped => {
                    weighted.complete_item();
                    continue;
                }
                ItemOutcome::Done(code) => code,
            };

            if code.is_cancelled() {
                first_error.abort();
                rollback_requested = self.operation == Operation::Installing;
                break;
            }

            if code.is_success() {
                first_error.record(code);
                self.items.mark_complete(index);
                if action == Action::Uninstall {
                    if let Err(err) = self.cache.delete_cached_package(index, services.delegate())
                    {
                        services
                            .log
                            .debug(&format!("cache entry for '{}' not deleted: {err:#}", item.id));
                    }
                }
                if weighted.complete_item().is_cancel() {
                    self.abort.request();
                }
                continue;
            }

            first_error.record(code);
            services.log.error(&format!(
                "'{}' {} failed with code {}",
                item.id,
                action.as_str(),
                code
            ));

            let policy = merged_failure_policy(
                resolve_failure_policy(&item, self.operation),
                self.policies.for_operation(self.operation),
                self.operation,
            );
            match policy {
                FailurePolicy::Rollback
                    if self.operation == Operation::Installing
                        && self.run_mode == RunMode::Normal =>
                {
                    rollback_requested = true;
                    break;
                }
                // a product cannot safely be un-removed, so outside
                // install a rollback policy degrades to stop
                FailurePolicy::Rollback | FailurePolicy::Stop => break,
                FailurePolicy::Continue | FailurePolicy::Unspecified => {}
            }
        }

        if self.abort.is_aborted() && !first_error.aborted() {
            first_error.abort();
            rollback_requested = self.operation == Operation::Installing;
        }

        Ok((rollback_requested, weighted.position()))
    }

    fn perform_item(
        &mut self,
        index: usize,
        item: &BundleItem,
        action: Action,
        weighted: &mut WeightedObserver,
        services: &mut EngineServices,
    ) -> Result<ItemOutcome> {
        if action != Action::Uninstall && item.payload.is_some() {
            match self.ensure_payload_available(index, item, weighted, services)? {
                EnsureOutcome::Available => {}
                EnsureOutcome::Cancelled => return Ok(ItemOutcome::Done(ResultCode::CANCELLED)),
                EnsureOutcome::Unavailable => {
                    if item.ignorable {
                        services
                            .log
                            .info(&format!("'{}' has no payload and is ignorable", item.id));
                        self.items.set_state(index, ItemState::Ignorable);
                        return Ok(ItemOutcome::Skipped);
                    }
                    return Ok(ItemOutcome::Done(ResultCode::PAYLOAD_UNAVAILABLE));
                }
            }
        }

        match wait_for_install_lock(&self.config, &self.abort, weighted)? {
            LockWaitOutcome::Acquired(_lock) => {
                self.execute_resolved(index, item, action, weighted, services)
            }
            LockWaitOutcome::TimedOut => Ok(ItemOutcome::Done(ResultCode::LOCK_TIMEOUT)),
            LockWaitOutcome::Cancelled => Ok(ItemOutcome::Done(ResultCode::CANCELLED)),
        }
    }

    fn execute_resolved(
        &mut self,
        index: usize,
        item: &BundleItem,
        action: Action,
        weighted: &mut WeightedObserver,
        services: &mut EngineServices,
    ) -> Result<ItemOutcome> {
        weighted.on_state_change_detail(ProgressState::Executing, &item.display_name);

        if item.per_machine {
            if let Some(bridge) = services.bridge.as_deref_mut() {
                let code = bridge.apply_package(index, self.operation, action)?;
                let code = if action == Action::Uninstall {
                    code.normalized_for_uninstall()
                } else {
                    code
                };
                if code.needs_reboot() {
                    weighted.on_reboot_pending();
                }
                return Ok(ItemOutcome::Done(code));
            }
        }

        let mut performer = self.factory.create(item, action)?;
        let code = performer.execute(weighted)?;
        let code = if action == Action::Uninstall {
            code.normalized_for_uninstall()
        } else {
            code
        };

        if code.needs_reboot() {
            weighted.on_reboot_pending();
        }

        // install landed but the user cancelled while it ran: the handler
        // itself undoes this one immediately, ahead of any broader rollback
        if action == Action::Install && code.is_success() && self.abort.is_aborted() {
            services.log.info(&format!(
                "'{}' installed during cancellation; undoing it in place",
                item.id
            ));
            let undo = performer.rollback(weighted)?;
            if !undo.is_success() {
                services.log.error(&format!(
                    "in-place undo of '{}' failed with code {}",
                    item.id, undo
                ));
            }
            return Ok(ItemOutcome::Done(ResultCode::CANCELLED));
        }

        Ok(ItemOutcome::Done(code))
    }

    fn ensure_payload_available(
        &mut self,
        index: usize,
        item: &BundleItem,
        weighted: &mut WeightedObserver,
        services: &mut EngineServices,
    ) -> Result<EnsureOutcome> {
        weighted.on_state_change_detail(ProgressState::Caching, &item.display_name);

        let download_deadline = Instant::now() + self.config.download_wait;
        let mut prompts = 0_u32;

        loop {
            if self.abort.is_aborted() {
                return Ok(EnsureOutcome::Cancelled);
            }

            if self.cache.is_cached(index, services.delegate())? {
                return Ok(EnsureOutcome::Available);
            }

            let (state, download_pending) = {
                let items = self.items.lock();
                match items.get(index) {
                    Some(item) => (item.state, item.download_pending),
                    None => return Ok(EnsureOutcome::Unavailable),
                }
            };

            match state {
                ItemState::Available | ItemState::AvailableUnverified => {
                    match self.cache.verify_and_cache_package(index, services.delegate()) {
                        Ok(()) => return Ok(EnsureOutcome::Available),
                        Err(err) => {
                            services.log.error(&format!(
                                "payload for '{}' failed verification: {err:#}",
                                item.id
                            ));
                            let mut items = self.items.lock();
                            if let Some(entry) = items.get_mut(index) {
                                entry.verified = false;
                                entry.current_path = None;
                                entry.state = ItemState::NotAvailable;
                            }
                        }
                    }
                }
                ItemState::Ignorable => return Ok(EnsureOutcome::Unavailable),
                ItemState::Complete => return Ok(EnsureOutcome::Available),
                ItemState::NotAvailable => {
                    if download_pending && Instant::now() < download_deadline {
                        if weighted.on_progress(0).is_cancel() {
                            self.abort.request();
                            return Ok(EnsureOutcome::Cancelled);
                        }
                        std::thread::sleep(self.config.poll_interval);
                        continue;
                    }

                    // only a real re-prompt consumes retry budget; waiting
                    // on the downloader never does
                    if prompts >= self.config.source_retry_budget {
                        return Ok(EnsureOutcome::Unavailable);
                    }
                    match services.source_resolver.resolve_source(item) {
                        SourceResolution::Retry(path) => {
                            prompts += 1;
                            let mut items = self.items.lock();
                            if let Some(entry) = items.get_mut(index) {
                                entry.current_path = Some(path);
                                entry.verified = false;
                                if entry.state.can_transition(ItemState::AvailableUnverified) {
                                    entry.state = ItemState::AvailableUnverified;
                                }
                            }
                        }
                        SourceResolution::Skip => return Ok(EnsureOutcome::Unavailable),
                        SourceResolution::Cancel => {
                            self.abort.request();
                            return Ok(EnsureOutcome::Cancelled);
                        }
                    }
                }
            }
        }
    }

    fn run_rollback(
        &self,
        observer: &mut dyn ProgressObserver,
        services: &mut EngineServices,
        last_attempted: Option<usize>,
        start_position: u8,
    ) {
        let Some(last) = last_attempted else {
            return;
        };

        let eligible: Vec<usize> = (0..=last)
            .filter(|&index| {
                self.items.item(index).is_some_and(|item| {
                    item.rollback_eligible
                        && item.applicability.evaluate(&self.ctx)
                        && (item.state == ItemState::Complete
                            || item.presence.evaluate(&self.ctx))
                })
            })
            .collect();
        if eligible.is_empty() {
            return;
        }

        services.log.section_start("rollback");
        observer.on_state_change(ProgressState::RollingBack);

        // the abort that triggered this rollback must not also cancel it
        let _abort_suppressed = self.abort.suppress();

        let mut rollback = CompositePerformer {
            items: self.items.clone(),
            cache: self.cache.clone(),
            config: self.config.clone(),
            ctx: self.ctx.clone(),
            policies: self.policies,
            abort: self.abort.clone(),
            factory: Arc::clone(&self.factory),
            operation: Operation::Uninstalling,
            run_mode: RunMode::Rollback,
            restrict: Some(eligible),
        };

        let mut inverting = RollbackObserver::new(observer, start_position);
        let mut rollback_errors = FirstError::new();
        let mut rollback_last = None;
        if let Err(err) = rollback.run_items(
            &mut inverting,
            services,
            &mut rollback_errors,
            &mut rollback_last,
        ) {
            services.log.error(&format!("rollback did not finish: {err:#}"));
        }

        services.log.section_end("rollback");
    }

    fn session_epilogue(&mut self, services: &mut EngineServices) {
        if !services.reboot_pending {
            if let Err(err) = self
                .cache
                .delete_temporary_cache_directories(services.delegate())
            {
                services
                    .log
                    .debug(&format!("temp cache not fully removed: {err:#}"));
            }
        }

        if self.run_mode == RunMode::Normal {
            // items the user chose to leave uninstalled lose their stale
            // cache even though no action ran on them this session
            for index in 0..self.items.len() {
                let Some(item) = self.items.item(index) else {
                    continue;
                };
                if item.requested_absent
                    && item.action_state == Some(ActionState::None)
                    && item.payload.is_some()
                {
                    if let Err(err) = self.cache.delete_cached_package(index, services.delegate())
                    {
                        services.log.debug(&format!(
                            "stale cache purge for '{}' skipped: {err:#}",
                            item.id
                        ));
                    }
                }
            }
        }
    }
}
