use std::io::{BufRead, BufReader};
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use cinder_core::{
    Action, BundleItem, EvaluationContext, ItemSet, PackageKind, PatchTrain, ResultCode,
};

use crate::abort::AbortSignal;
use crate::config::EngineConfig;
use crate::performers::{
    CleanupPerformer, ExePerformer, MsiPerformer, MspPerformer, ServicePerformer,
};
use crate::progress::ProgressObserver;

/// One unit of executable work: run it, report progress through the
/// observer, honor abort. `rollback` is invoked by the orchestrator only
/// for the install-succeeded-but-user-cancelled race; the broader rollback
/// path replays whole items as uninstalls instead.
pub trait Performer {
    fn execute(&mut self, observer: &mut dyn ProgressObserver) -> Result<ResultCode>;
    fn abort(&mut self);

    fn rollback(&mut self, observer: &mut dyn ProgressObserver) -> Result<ResultCode> {
        let _ = observer;
        Ok(ResultCode::OK)
    }
}

/// Does nothing, successfully. Also the safe degradation for a
/// kind-by-action combination that should not exist.
#[derive(Debug, Default)]
pub struct NoopPerformer;

impl Performer for NoopPerformer {
    fn execute(&mut self, _observer: &mut dyn ProgressObserver) -> Result<ResultCode> {
        Ok(ResultCode::OK)
    }

    fn abort(&mut self) {}
}

/// A spawned child whose exit and streamed progress lines are polled.
pub trait ChildHandle: Send {
    fn try_wait(&mut self) -> Result<Option<ResultCode>>;
    fn kill(&mut self) -> Result<()>;
    /// Progress lines the child emitted since the previous drain.
    fn drain_progress(&mut self) -> Vec<String>;
}

/// How performers reach the outside world. The production implementation
/// shells out; tests script the results.
pub trait CommandRunner: Send + Sync {
    fn run(&self, program: &str, args: &[String]) -> Result<ResultCode>;
    fn run_capture(&self, program: &str, args: &[String]) -> Result<(ResultCode, String)>;
    fn spawn(
        &self,
        program: &str,
        args: &[String],
        pipe_progress: bool,
    ) -> Result<Box<dyn ChildHandle>>;
}

#[derive(Debug, Default)]
pub struct SystemCommandRunner;

impl CommandRunner for SystemCommandRunner {
    fn run(&self, program: &str, args: &[String]) -> Result<ResultCode> {
        let status = Command::new(program)
            .args(args)
            .status()
            .with_context(|| format!("failed to start {program}"))?;
        Ok(ResultCode::from_exit_status(status))
    }

    fn run_capture(&self, program: &str, args: &[String]) -> Result<(ResultCode, String)> {
        let output = Command::new(program)
            .args(args)
            .output()
            .with_context(|| format!("failed to start {program}"))?;
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        Ok((ResultCode::from_exit_status(output.status), stdout))
    }

    fn spawn(
        &self,
        program: &str,
        args: &[String],
        pipe_progress: bool,
    ) -> Result<Box<dyn ChildHandle>> {
        let mut command = Command::new(program);
        command.args(args);
        if pipe_progress {
            command.stdout(Stdio::piped());
        } else {
            command.stdout(Stdio::null());
        }

        let mut child = command
            .spawn()
            .with_context(|| format!("failed to spawn {program}"))?;

        let lines = Arc::new(Mutex::new(Vec::new()));
        let reader_thread = child.stdout.take().map(|stdout| {
            let sink = Arc::clone(&lines);
            std::thread::spawn(move || {
                for line in BufReader::new(stdout).lines().map_while(|line| line.ok()) {
                    match sink.lock() {
                        Ok(mut buffer) => buffer.push(line),
                        Err(_) => break,
                    }
                }
            })
        });

        Ok(Box::new(SystemChild {
            child,
            lines,
            reader_thread,
        }))
    }
}

struct SystemChild {
    child: std::process::Child,
    lines: Arc<Mutex<Vec<String>>>,
    reader_thread: Option<std::thread::JoinHandle<()>>,
}

impl ChildHandle for SystemChild {
    fn try_wait(&mut self) -> Result<Option<ResultCode>> {
        let status = self
            .child
            .try_wait()
            .context("failed to poll child process")?;
        match status {
            Some(status) => {
                // the reader worker is joined before the child counts as done
                if let Some(handle) = self.reader_thread.take() {
                    let _ = handle.join();
                }
                Ok(Some(ResultCode::from_exit_status(status)))
            }
            None => Ok(None),
        }
    }

    fn kill(&mut self) -> Result<()> {
        self.child.kill().context("failed to kill child process")?;
        let _ = self.child.wait();
        if let Some(handle) = self.reader_thread.take() {
            let _ = handle.join();
        }
        Ok(())
    }

    fn drain_progress(&mut self) -> Vec<String> {
        match self.lines.lock() {
            Ok(mut buffer) => std::mem::take(&mut *buffer),
            Err(_) => Vec::new(),
        }
    }
}

/// Builds the performer for one (item, action) pair.
pub trait PerformerFactory {
    fn create(&self, item: &BundleItem, action: Action) -> Result<Box<dyn Performer>>;
}

/// Production factory: one handler per package kind, sharing a command
/// runner and the run's abort signal.
pub struct TypeHandlerFactory {
    runner: Arc<dyn CommandRunner>,
    config: EngineConfig,
    abort: AbortSignal,
    ctx: EvaluationContext,
    items: ItemSet,
}

impl TypeHandlerFactory {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        config: EngineConfig,
        abort: AbortSignal,
        ctx: EvaluationContext,
        items: ItemSet,
    ) -> Self {
        Self {
            runner,
            config,
            abort,
            ctx,
            items,
        }
    }

    /// An LDR baseline becomes orphaned when no other LDR-train patch that
    /// depends on it is still present.
    fn ldr_dependents_remain(&self, baseline_id: &str) -> bool {
        self.items.lock().iter().any(|other| {
            other.id != baseline_id
                && other.patch_train == PatchTrain::Ldr
                && !other.ldr_baseline
                && other.presence.evaluate(&self.ctx)
        })
    }
}


impl PerformerFactory for TypeHandlerFactory {
    fn create(&self, item: &BundleItem, action: Action) -> Result<Box<dyn Performer>> {
        if action == Action::Noop {
            return Ok(Box::new(NoopPerformer));
        }

        match item.kind {
            PackageKind::Msi | PackageKind::AgileMsi => Ok(Box::new(MsiPerformer::new(
                item,
                action,
                Arc::clone(&self.runner),
                self.abort.clone(),
                self.config.command_line_options.clone(),
            ))),
            PackageKind::Msp | PackageKind::Patches => {
                let baseline_still_required = action == Action::Uninstall
                    && item.ldr_baseline
                    && self.ldr_dependents_remain(&item.id);
                Ok(Box::new(MspPerformer::new(
                    item,
                    action,
                    Arc::clone(&self.runner),
                    self.abort.clone(),
                    &self.ctx,
                    baseline_still_required,
                )))
            }
            PackageKind::Exe | PackageKind::Msu => Ok(Box::new(ExePerformer::new(
                item,
                action,
                Arc::clone(&self.runner),
                self.abort.clone(),
                self.config.poll_interval,
            ))),
            PackageKind::ServiceControl => {
                let service_name = item.service_name.clone().ok_or_else(|| {
                    anyhow!("service-control item '{}' has no service name", item.id)
                })?;
                Ok(Box::new(ServicePerformer::new(
                    service_name,
                    action,
                    Arc::clone(&self.runner),
                    self.abort.clone(),
                    self.config.poll_interval,
                )))
            }
            PackageKind::CleanupBlock => Ok(Box::new(CleanupPerformer::cleanup_block(
                item,
                Arc::clone(&self.runner),
                self.abort.clone(),
            ))),
            PackageKind::RelatedProducts => Ok(Box::new(CleanupPerformer::related_products(
                item,
                Arc::clone(&self.runner),
                self.abort.clone(),
                &self.ctx,
            ))),
            PackageKind::File => {
                // file payloads only exist to be cached; dispatching any
                // other action here is a table-authoring defect
                debug_assert!(
                    action == Action::Install,
                    "file item '{}' dispatched with action {}",
                    item.id,
                    action.as_str()
                );
                Ok(Box::new(NoopPerformer))
            }
        }
    }
}
