use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use cinder_core::{Action, BundleItem, ResultCode};

use crate::abort::AbortSignal;
use crate::performer::{CommandRunner, Performer};
use crate::performers::{MSIEXEC, QUIET_ARGS};
use crate::progress::{ProgressObserver, ProgressState, PROGRESS_MAX};

/// Drives the native MSI engine for install, uninstall and repair.
///
/// Authored options come first on the command line and command-line
/// supplied options are appended after them, so the later ones win on a
/// property conflict. Rollback is a no-op here: the MSI engine rolls back
/// its own transaction on failure.
pub struct MsiPerformer {
    display_name: String,
    payload_path: Option<PathBuf>,
    product_code: Option<String>,
    action: Action,
    authored_options: Vec<String>,
    command_line_options: Vec<String>,
    runner: Arc<dyn CommandRunner>,
    abort: AbortSignal,
}

impl MsiPerformer {
    pub fn new(
        item: &BundleItem,
        action: Action,
        runner: Arc<dyn CommandRunner>,
        abort: AbortSignal,
        command_line_options: Vec<String>,
    ) -> Self {
        Self {
            display_name: item.display_name.clone(),
            payload_path: item.current_path.clone(),
            product_code: item.product_code.clone(),
            action,
            authored_options: item.install_args.clone(),
            command_line_options,
            runner,
            abort,
        }
    }

    fn build_arguments(&self) -> Result<Vec<String>> {
        let mut args = Vec::new();
        match self.action {
            Action::Install => {
                let path = self.payload_path.as_ref().ok_or_else(|| {
                    anyhow!("no payload path to install '{}'", self.display_name)
                })?;
                args.push("/i".to_string());
                args.push(path.display().to_string());
            }
            Action::Uninstall => {
                args.push("/x".to_string());
                args.push(self.target()?);
            }
            Action::Repair => {
                args.push("/fomus".to_string());
                args.push(self.target()?);
            }
            Action::Noop => return Err(anyhow!("noop dispatched to the MSI handler")),
        }

        args.extend(QUIET_ARGS.iter().map(ToString::to_string));
        args.extend(self.authored_options.iter().cloned());
        args.extend(self.command_line_options.iter().cloned());
        Ok(args)
    }

    /// Maintenance actions prefer the product code; the cached package is
    /// the fallback for bundles that never authored one.
    fn target(&self) -> Result<String> {
        if let Some(code) = &self.product_code {
            return Ok(code.clone());
        }
        self.payload_path
            .as_ref()
            .map(|path| path.display().to_string())
            .ok_or_else(|| {
                anyhow!(
                    "'{}' has neither product code nor payload path",
                    self.display_name
                )
            })
    }
}

impl Performer for MsiPerformer {
    fn execute(&mut self, observer: &mut dyn ProgressObserver) -> Result<ResultCode> {
        if self.abort.is_aborted() {
            return Ok(ResultCode::CANCELLED);
        }

        observer.on_state_change_detail(ProgressState::Executing, &self.display_name);
        if observer.on_progress(0).is_cancel() {
            self.abort.request();
            return Ok(ResultCode::CANCELLED);
        }

        let args = self.build_arguments()?;
        let code = self.runner.run(MSIEXEC, &args)?;
        let code = if self.action == Action::Uninstall {
            code.normalized_for_uninstall()
        } else {
            code
        };

        if code.is_success() {
            observer.on_progress(PROGRESS_MAX);
        }
        Ok(code)
    }

    fn abort(&mut self) {
        self.abort.request();
    }
}
