use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use cinder_core::{Action, ResultCode};

use crate::abort::AbortSignal;
use crate::performer::{CommandRunner, Performer};
use crate::progress::{ProgressObserver, ProgressState, PROGRESS_MAX};

const SERVICE_NOT_FOUND: i32 = 1060;
const MAX_STATUS_POLLS: u32 = 60;
const MAX_STALLED_POLLS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServiceGoal {
    Started,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServiceState {
    Running,
    Stopped,
    Transitioning,
    Unknown,
}

/// Starts or stops a named service and polls its status until the goal
/// state is reached or the operation stalls. A stall is detected through
/// checkpoint monotonicity: a pending transition whose checkpoint stops
/// advancing is treated as stuck.
pub struct ServicePerformer {
    service_name: String,
    action: Action,
    runner: Arc<dyn CommandRunner>,
    abort: AbortSignal,
    poll_interval: Duration,
}

impl ServicePerformer {
    pub fn new(
        service_name: String,
        action: Action,
        runner: Arc<dyn CommandRunner>,
        abort: AbortSignal,
        poll_interval: Duration,
    ) -> Self {
        Self {
            service_name,
            action,
            runner,
            abort,
            poll_interval,
        }
    }

    fn issue_verb(&self, goal: ServiceGoal) -> Result<ResultCode> {
        let (program, args) = if cfg!(windows) {
            let verb = match goal {
                ServiceGoal::Started => "start",
                ServiceGoal::Stopped => "stop",
            };
            (
                "sc".to_string(),
                vec![verb.to_string(), self.service_name.clone()],
            )
        } else {
            let verb = match goal {
                ServiceGoal::Started => "start",
                ServiceGoal::Stopped => "stop",
            };
            (
                "systemctl".to_string(),
                vec![verb.to_string(), self.service_name.clone()],
            )
        };
        self.runner.run(&program, &args)
    }

    fn query_status(&self) -> Result<(ResultCode, ServiceState, Option<u32>)> {
        let (program, args) = if cfg!(windows) {
            (
                "sc".to_string(),
                vec!["query".to_string(), self.service_name.clone()],
            )
        } else {
            (
                "systemctl".to_string(),
                vec!["is-active".to_string(), self.service_name.clone()],
            )
        };
        let (code, output) = self.runner.run_capture(&program, &args)?;
        Ok((code, parse_service_state(&output), parse_checkpoint(&output)))
    }

    fn ensure_goal(
        &self,
        goal: ServiceGoal,
        observer: &mut dyn ProgressObserver,
    ) -> Result<ResultCode> {
        let (code, state, _) = self.query_status()?;
        if code.0 == SERVICE_NOT_FOUND {
            return Ok(match goal {
                // stopping a service that does not exist is already done
                ServiceGoal::Stopped => ResultCode::OK,
                ServiceGoal::Started => ResultCode(SERVICE_NOT_FOUND),
            });
        }
        if state == goal_state(goal) {
            return Ok(ResultCode::OK);
        }

        let verb_code = self.issue_verb(goal)?;

        let mut last_checkpoint: Option<u32> = None;
        let mut stalled_polls = 0_u32;
        for poll in 0..MAX_STATUS_POLLS {
            if self.abort.is_aborted() {
                return Ok(ResultCode::CANCELLED);
            }

            let (_, state, checkpoint) = self.query_status()?;
            if state == goal_state(goal) {
                return Ok(ResultCode::OK);
            }

            if state == ServiceState::Transitioning {
                match (checkpoint, last_checkpoint) {
                    (Some(current), Some(previous)) if current <= previous => {
                        stalled_polls += 1;
                        if stalled_polls >= MAX_STALLED_POLLS {
                            return Ok(ResultCode::FAILED);
                        }
                    }
                    _ => stalled_polls = 0,
                }
                last_checkpoint = checkpoint.or(last_checkpoint);
            }

            let position = ((poll + 1) * 200 / MAX_STATUS_POLLS).min(200) as u8;
            if observer.on_progress(position).is_cancel() {
                self.abort.request();
                return Ok(ResultCode::CANCELLED);
            }
            std::thread::sleep(self.poll_interval);
        }

        // the verb's own failure is the best diagnostic once polling
        // runs out
        if verb_code.is_success() {
            Ok(ResultCode::FAILED)
        } else {
            Ok(verb_code)
        }
    }
}

impl Performer for ServicePerformer {
    fn execute(&mut self, observer: &mut dyn ProgressObserver) -> Result<ResultCode> {
        if self.abort.is_aborted() {
            return Ok(ResultCode::CANCELLED);
        }

        observer.on_state_change_detail(ProgressState::Executing, &self.service_name);

        let code = match self.action {
            Action::Install => self.ensure_goal(ServiceGoal::Started, observer)?,
            Action::Uninstall => self.ensure_goal(ServiceGoal::Stopped, observer)?,
            Action::Repair => {
                let stop = self.ensure_goal(ServiceGoal::Stopped, observer)?;
                if !stop.is_success() {
                    stop
                } else {
                    self.ensure_goal(ServiceGoal::Started, observer)?
                }
            }
            Action::Noop => {
                return Err(anyhow!(
                    "noop dispatched to the service handler for '{}'",
                    self.service_name
                ))
            }
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

fn goal_state(goal: ServiceGoal) -> ServiceState {
    match goal {
        ServiceGoal::Started => ServiceState::Running,
        ServiceGoal::Stopped => ServiceState::Stopped,
    }
}

/// Understands both the service-controller query format (`STATE : 4
/// RUNNING`) and the systemd one-word answer (`active` / `inactive`).
fn parse_service_state(output: &str) -> ServiceState {
    let normalized = output.to_ascii_uppercase();
    if normalized.contains("RUNNING") || normalized.trim() == "ACTIVE" {
        return ServiceState::Running;
    }
    if normalized.contains("STOPPED")
        || normalized.trim() == "INACTIVE"
        || normalized.trim() == "FAILED"
    {
        return ServiceState::Stopped;
    }
    if normalized.contains("PENDING") || normalized.contains("ACTIVATING") {
        return ServiceState::Transitioning;
    }
    ServiceState::Unknown
}

fn parse_checkpoint(output: &str) -> Option<u32> {
    for line in output.lines() {
        let trimmed = line.trim();
        let Some(rest) = trimmed.strip_prefix("CHECKPOINT") else {
            continue;
        };
        let value = rest.trim_start_matches([':', ' ']).trim();
        let value = value.strip_prefix("0x").unwrap_or(value);
        if let Ok(parsed) = u32::from_str_radix(value, 16) {
            return Some(parsed);
        }
    }
    None
}
