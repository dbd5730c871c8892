use std::path::Path;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

use anyhow::{anyhow, Context, Result};
use cinder_cache::ElevationDelegate;
use cinder_core::{Action, Operation, ResultCode, Verdict};
use cinder_elevate::{ApplyPackageRequest, UiRelay, UnelevatedController};
use cinder_engine::{AbortSignal, ElevationBridge, LogLevel};

use crate::render::{render_status_line, OutputStyle};

/// UI-side handlers for callbacks relayed from the elevated process: log
/// lines go to the console, progress carries the local abort decision back.
pub struct ConsoleRelay {
    style: OutputStyle,
    abort: AbortSignal,
}

impl ConsoleRelay {
    fn verdict(&self) -> Verdict {
        if self.abort.is_aborted() {
            Verdict::Cancel
        } else {
            Verdict::Continue
        }
    }
}

impl UiRelay for ConsoleRelay {
    fn on_progress(&mut self, _progress: u8) -> Verdict {
        self.verdict()
    }

    fn on_progress_detail(&mut self, _progress: u8) -> Verdict {
        self.verdict()
    }

    fn on_state_change(&mut self, _state: u32, _detail: &str) {}

    fn on_log(&mut self, level: u8, text: &str) {
        let level = match level {
            0 => LogLevel::Error,
            2 => LogLevel::Debug,
            _ => LogLevel::Info,
        };
        eprintln!("{}", render_status_line(self.style, level, text));
    }

    fn on_error(&mut self, item_id: &str, code: ResultCode, text: &str) -> Verdict {
        eprintln!(
            "{}",
            render_status_line(
                self.style,
                LogLevel::Error,
                &format!("'{item_id}' reported {code}: {text}")
            )
        );
        self.verdict()
    }

    fn on_msi_message(&mut self, text: &str) -> Verdict {
        eprintln!("{}", render_status_line(self.style, LogLevel::Info, text));
        self.verdict()
    }

    fn on_msi_files_in_use(&mut self, files: &[String]) -> Verdict {
        eprintln!(
            "{}",
            render_status_line(
                self.style,
                LogLevel::Info,
                &format!("files in use: {}", files.join(", "))
            )
        );
        // unattended default: let the installer schedule its own retry
        self.verdict()
    }
}

/// The unelevated side of the privilege split: a child `elevated-serve`
/// process reached over its stdio, speaking the bridge protocol. One
/// request is in flight at a time for the child's whole lifetime.
pub struct ProcessBridge {
    child: Child,
    controller: UnelevatedController<ChildStdout, ChildStdin, ConsoleRelay>,
    variables: Vec<(String, String)>,
}

impl ProcessBridge {
    pub fn spawn(
        manifest_path: &Path,
        machine_root: Option<&Path>,
        user_root: Option<&Path>,
        variables: Vec<(String, String)>,
        style: OutputStyle,
        abort: AbortSignal,
    ) -> Result<Self> {
        let exe =
            std::env::current_exe().context("failed to locate the running executable")?;
        let mut command = Command::new(exe);
        command.arg("--manifest").arg(manifest_path);
        if let Some(root) = machine_root {
            command.arg("--machine-root").arg(root);
        }
        if let Some(root) = user_root {
            command.arg("--user-root").arg(root);
        }
        command
            .arg("elevated-serve")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());

        let mut child = command
            .spawn()
            .context("failed to spawn the elevated helper process")?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("elevated helper has no stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("elevated helper has no stdout"))?;

        let relay = ConsoleRelay { style, abort };
        let mut controller = UnelevatedController::new(stdout, stdin, relay);

        let begin = controller
            .begin_session(&variables)
            .context("failed to begin the elevated session")?;
        if !begin.is_success() {
            let _ = child.kill();
            return Err(anyhow!("elevated session refused to start: {begin}"));
        }

        Ok(Self {
            child,
            controller,
            variables,
        })
    }

    pub fn shutdown(mut self) -> Result<()> {
        let end = self.controller.end_session()?;
        self.controller.terminate()?;
        self.child
            .wait()
            .context("failed to reap the elevated helper")?;
        if end.is_success() {
            Ok(())
        } else {
            Err(anyhow!("elevated session ended with code {end}"))
        }
    }
}

impl Drop for ProcessBridge {
    fn drop(&mut self) {
        let _ = self.controller.terminate();
        let _ = self.child.wait();
    }
}

impl ElevationDelegate for ProcessBridge {
    fn is_cached(&mut self, index: usize) -> Result<bool> {
        self.controller.is_cached(index)
    }

    fn verify_and_cache_package(&mut self, index: usize) -> Result<()> {
        self.controller.verify_and_cache_package(index)
    }

    fn delete_cached_package(&mut self, index: usize) -> Result<()> {
        self.controller.delete_cached_package(index)
    }

    fn delete_temporary_cache_directories(&mut self) -> Result<()> {
        self.controller.delete_temporary_cache_directories()
    }
}

impl ElevationBridge for ProcessBridge {
    fn apply_package(
        &mut self,
        index: usize,
        operation: Operation,
        action: Action,
    ) -> Result<ResultCode> {
        self.controller.apply_package(&ApplyPackageRequest {
            variables: self.variables.clone(),
            package_index: u32::try_from(index)
                .map_err(|_| anyhow!("package index out of range: {index}"))?,
            operation,
            action,
        })
    }
}
