use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use cinder_core::{Action, BundleItem, ExeKind, PackageKind, ResultCode};

use crate::abort::AbortSignal;
use crate::performer::{ChildHandle, CommandRunner, Performer};
use crate::progress::{
    time_curve_position, AveragedStreams, ProgressObserver, ProgressState, PROGRESS_MAX,
};

const WUSA: &str = "wusa";

/// How the child process is launched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LaunchKind {
    /// Run the payload itself.
    Direct,
    /// OS update packages go through the update standalone installer.
    Wusa,
}

/// Where true progress comes from, if anywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProgressKind {
    /// No protocol; a time-based curve approximates what the user sees.
    TimeCurve,
    /// Child writes `progress <0-255>` lines on its watcher pipe.
    Watcher,
    /// Child writes `download <0-255>` and `install <0-255>` lines; the
    /// two streams are averaged.
    Chainer,
    /// No progress at all beyond start and finish.
    Coarse,
}

/// One handler covers every EXE sub-kind; the differences are confined to
/// the launch and progress strategies selected at construction.
pub struct ExePerformer {
    display_name: String,
    payload_path: Option<PathBuf>,
    action: Action,
    launch: LaunchKind,
    progress: ProgressKind,
    install_args: Vec<String>,
    expected_duration: Duration,
    poll_interval: Duration,
    runner: Arc<dyn CommandRunner>,
    abort: AbortSignal,
}

impl ExePerformer {
    pub fn new(
        item: &BundleItem,
        action: Action,
        runner: Arc<dyn CommandRunner>,
        abort: AbortSignal,
        poll_interval: Duration,
    ) -> Self {
        let (launch, progress) = if item.kind == PackageKind::Msu {
            (LaunchKind::Wusa, ProgressKind::Coarse)
        } else {
            let progress = match item.exe_kind {
                ExeKind::Generic => ProgressKind::TimeCurve,
                ExeKind::Watcher => ProgressKind::Watcher,
                ExeKind::Chainer => ProgressKind::Chainer,
            };
            (LaunchKind::Direct, progress)
        };

        Self {
            display_name: item.display_name.clone(),
            payload_path: item.current_path.clone(),
            action,
            launch,
            progress,
            install_args: item.install_args.clone(),
            expected_duration: Duration::from_secs(u64::from(item.weight.max(1))),
            poll_interval,
            runner,
            abort,
        }
    }

    fn payload(&self) -> Result<&PathBuf> {
        self.payload_path
            .as_ref()
            .ok_or_else(|| anyhow!("no payload path to run '{}'", self.display_name))
    }

    fn command(&self, action: Action) -> Result<(String, Vec<String>)> {
        let path = self.payload()?.display().to_string();
        match self.launch {
            LaunchKind::Direct => {
                let mut args = Vec::new();
                match action {
                    Action::Uninstall => args.push("/uninstall".to_string()),
                    Action::Repair => args.push("/repair".to_string()),
                    _ => {}
                }
                args.extend(self.install_args.iter().cloned());
                Ok((path, args))
            }
            LaunchKind::Wusa => {
                let mut args = Vec::new();
                if action == Action::Uninstall {
                    args.push("/uninstall".to_string());
                }
                args.push(path);
                args.push("/quiet".to_string());
                args.push("/norestart".to_string());
                Ok((WUSA.to_string(), args))
            }
        }
    }

    fn map_exit(&self, code: ResultCode, action: Action) -> ResultCode {
        let code = match code.0 {
            1641 => ResultCode::REBOOT_REQUIRED,
            // update standalone installer: already installed / not found
            2359302 if self.launch == LaunchKind::Wusa => ResultCode::OK,
            2359303 if self.launch == LaunchKind::Wusa => ResultCode::UNKNOWN_PRODUCT,
            _ => code,
        };
        if action == Action::Uninstall {
            code.normalized_for_uninstall()
        } else {
            code
        }
    }

    fn drain_position(
        &self,
        child: &mut dyn ChildHandle,
        streams: &mut AveragedStreams,
        started: Instant,
    ) -> u8 {
        match self.progress {
            ProgressKind::TimeCurve => {
                time_curve_position(started.elapsed(), self.expected_duration)
            }
            ProgressKind::Coarse => 0,
            ProgressKind::Watcher => {
                let mut latest = None;
                for line in child.drain_progress() {
                    if let Some(position) = parse_watcher_line(&line) {
                        latest = Some(position);
                    }
                }
                latest.unwrap_or(0)
            }
            ProgressKind::Chainer => {
                for line in child.drain_progress() {
                    match parse_chainer_line(&line) {
                        Some(ChainerStream::Download(position)) => streams.set_download(position),
                        Some(ChainerStream::Install(position)) => streams.set_install(position),
                        None => {}
                    }
                }
                streams.combined()
            }
        }
    }
}

impl Performer for ExePerformer {
    fn execute(&mut self, observer: &mut dyn ProgressObserver) -> Result<ResultCode> {
        if self.abort.is_aborted() {
            return Ok(ResultCode::CANCELLED);
        }

        observer.on_state_change_detail(ProgressState::Executing, &self.display_name);

        let (program, args) = self.command(self.action)?;
        let pipe_progress = matches!(
            self.progress,
            ProgressKind::Watcher | ProgressKind::Chainer
        );
        let mut child = self.runner.spawn(&program, &args, pipe_progress)?;

        let started = Instant::now();
        let mut streams = AveragedStreams::default();
        let mut last_position = 0_u8;

        loop {
            if self.abort.is_aborted() {
                child.kill()?;
                return Ok(ResultCode::CANCELLED);
            }

            if let Some(code) = child.try_wait()? {
                let code = self.map_exit(code, self.action);
                if code.is_success() {
                    observer.on_progress(PROGRESS_MAX);
                }
                return Ok(code);
            }

            let position = self.drain_position(child.as_mut(), &mut streams, started);
            // progress lines may arrive out of order; never walk backwards
            // except for the averaged chainer streams, which are reported
            // as computed
            let position = if self.progress == ProgressKind::Chainer {
                position
            } else {
                position.max(last_position)
            };
            last_position = position;

            if observer.on_progress(position).is_cancel() {
                self.abort.request();
                child.kill()?;
                return Ok(ResultCode::CANCELLED);
            }

            std::thread::sleep(self.poll_interval);
        }
    }

    fn abort(&mut self) {
        self.abort.request();
    }

    /// Immediate handler-level undo for an install that succeeded right as
    /// the user cancelled: launch the uninstall synchronously.
    fn rollback(&mut self, observer: &mut dyn ProgressObserver) -> Result<ResultCode> {
        observer.on_state_change_detail(ProgressState::RollingBack, &self.display_name);
        let (program, args) = self.command(Action::Uninstall)?;
        let code = self.runner.run(&program, &args)?;
        Ok(self.map_exit(code, Action::Uninstall))
    }
}

enum ChainerStream {
    Download(u8),
    Install(u8),
}

fn parse_watcher_line(line: &str) -> Option<u8> {
    let value = line.trim().strip_prefix("progress ")?;
    value.trim().parse::<u16>().ok().map(|v| v.min(255) as u8)
}

fn parse_chainer_line(line: &str) -> Option<ChainerStream> {
    let trimmed = line.trim();
    if let Some(value) = trimmed.strip_prefix("download ") {
        let position = value.trim().parse::<u16>().ok()?.min(255) as u8;
        return Some(ChainerStream::Download(position));
    }
    if let Some(value) = trimmed.strip_prefix("install ") {
        let position = value.trim().parse::<u16>().ok()?.min(255) as u8;
        return Some(ChainerStream::Install(position));
    }
    None
}
