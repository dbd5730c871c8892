use std::sync::Arc;

use anyhow::{anyhow, Result};
use cinder_cache::CacheManager;
use cinder_core::{Action, EvaluationContext, ItemSet, ResultCode, Verdict};
use cinder_elevate::{
    ApplyPackageRequest, ElevatedCallbacks, ElevatedController, ElevatedHost, LOG_LEVEL_INFO,
};
use cinder_engine::{
    AbortSignal, CommandRunner, EngineConfig, PerformerFactory, ProgressObserver, ProgressState,
    SystemCommandRunner, TypeHandlerFactory,
};

/// The per-machine engine the elevated process exposes over the bridge.
/// Both halves load the same bundle manifest, so package indexes agree.
pub struct ElevatedEngineHost {
    items: ItemSet,
    cache: CacheManager,
    config: EngineConfig,
    runner: Arc<dyn CommandRunner>,
    abort: AbortSignal,
    variables: Vec<(String, String)>,
}

impl ElevatedEngineHost {
    pub fn new(items: ItemSet, cache: CacheManager, config: EngineConfig) -> Self {
        Self {
            items,
            cache,
            config,
            runner: Arc::new(SystemCommandRunner),
            abort: AbortSignal::new(),
            variables: Vec::new(),
        }
    }

    fn evaluation_context(&self, variables: &[(String, String)]) -> EvaluationContext {
        let mut ctx = EvaluationContext::new();
        for (name, value) in variables {
            ctx.set(name.clone(), value.clone());
        }
        ctx
    }
}

impl ElevatedHost for ElevatedEngineHost {
    fn begin_session(&mut self, variables: &[(String, String)]) -> Result<()> {
        self.variables = variables.to_vec();
        Ok(())
    }

    fn end_session(&mut self) -> Result<()> {
        Ok(())
    }

    fn suspend_session(&mut self) -> Result<()> {
        Ok(())
    }

    fn resume_session(&mut self) -> Result<()> {
        Ok(())
    }

    fn save_state(&mut self) -> Result<()> {
        // cache promotion is the only durable state on this side
        Ok(())
    }

    fn is_cached(&mut self, index: usize) -> Result<bool> {
        self.cache.is_cached(index, None)
    }

    fn verify_and_cache_package(&mut self, index: usize) -> Result<()> {
        self.cache.verify_and_cache_package(index, None)
    }

    fn delete_cached_package(&mut self, index: usize) -> Result<()> {
        self.cache.delete_cached_package(index, None)
    }

    fn delete_temporary_cache_directories(&mut self) -> Result<()> {
        self.cache.delete_temporary_cache_directories(None)
    }

    fn apply_package(
        &mut self,
        request: &ApplyPackageRequest,
        callbacks: &mut dyn ElevatedCallbacks,
    ) -> Result<ResultCode> {
        let index = request.package_index as usize;
        let item = self
            .items
            .item(index)
            .ok_or_else(|| anyhow!("package index out of range: {index}"))?;

        let ctx = self.evaluation_context(&request.variables);
        let factory = TypeHandlerFactory::new(
            Arc::clone(&self.runner),
            self.config.clone(),
            self.abort.clone(),
            ctx,
            self.items.clone(),
        );

        callbacks.log(
            LOG_LEVEL_INFO,
            &format!("{} '{}'", request.action.as_str(), item.display_name),
        )?;

        let mut performer = factory.create(&item, request.action)?;
        let mut observer = RelayObserver {
            callbacks,
            abort: self.abort.clone(),
        };
        let code = performer.execute(&mut observer)?;
        let code = if request.action == Action::Uninstall {
            code.normalized_for_uninstall()
        } else {
            code
        };

        if code.is_success() {
            self.items.mark_complete(index);
        }
        Ok(code)
    }
}

/// Forwards performer progress to the unelevated side and folds its
/// verdict back into the local abort signal.
struct RelayObserver<'a> {
    callbacks: &'a mut dyn ElevatedCallbacks,
    abort: AbortSignal,
}

impl ProgressObserver for RelayObserver<'_> {
    fn on_progress(&mut self, position: u8) -> Verdict {
        match self.callbacks.on_progress(position) {
            Ok(verdict) => {
                if verdict.is_cancel() {
                    self.abort.request();
                }
                verdict
            }
            Err(_) => {
                // a dead pipe means nobody is left to continue for
                self.abort.request();
                Verdict::Cancel
            }
        }
    }

    fn on_state_change_detail(&mut self, state: ProgressState, detail: &str) {
        let _ = self.callbacks.on_state_change(state_wire_value(state), detail);
    }

    fn on_reboot_pending(&mut self) {}
}

fn state_wire_value(state: ProgressState) -> u32 {
    match state {
        ProgressState::Preparing => 0,
        ProgressState::Waiting => 1,
        ProgressState::Caching => 2,
        ProgressState::Executing => 3,
        ProgressState::RollingBack => 4,
    }
}

/// Run the elevated half over this process's stdio until the unelevated
/// side terminates the session or the pipe closes.
pub fn run_elevated_serve(items: ItemSet, cache: CacheManager, config: EngineConfig) -> Result<()> {
    let mut host = ElevatedEngineHost::new(items, cache, config);
    let mut controller = ElevatedController::new(std::io::stdin().lock(), std::io::stdout().lock());
    controller.serve(&mut host)
}
