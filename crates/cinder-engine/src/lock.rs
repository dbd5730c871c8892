use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};

use crate::abort::AbortSignal;
use crate::config::EngineConfig;
use crate::progress::{ProgressObserver, ProgressState};

/// Held proof of the system-wide single-install-at-a-time lock. The marker
/// file is removed on drop.
#[derive(Debug)]
pub struct InstallLock {
    path: PathBuf,
}

impl Drop for InstallLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

#[derive(Debug)]
pub enum LockWaitOutcome {
    Acquired(InstallLock),
    TimedOut,
    Cancelled,
}

/// Poll for the installer lock up to the configured timeout, pumping
/// progress and abort checks on every wake. A cancel verdict from the UI
/// aborts the whole run, not just the wait.
pub fn wait_for_install_lock(
    config: &EngineConfig,
    abort: &AbortSignal,
    observer: &mut dyn ProgressObserver,
) -> Result<LockWaitOutcome> {
    if let Some(parent) = config.lock_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let deadline = Instant::now() + config.lock_wait();
    let mut reported_wait = false;
    loop {
        if abort.is_aborted() {
            return Ok(LockWaitOutcome::Cancelled);
        }

        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&config.lock_path)
        {
            Ok(mut file) => {
                let _ = write!(file, "{}", std::process::id());
                return Ok(LockWaitOutcome::Acquired(InstallLock {
                    path: config.lock_path.clone(),
                }));
            }
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                if !reported_wait {
                    observer.on_state_change(ProgressState::Waiting);
                    reported_wait = true;
                }
                // position 0 re-reports the last overall position through
                // the monotone aggregators; it exists to carry the verdict
                if observer.on_progress(0).is_cancel() {
                    abort.request();
                    return Ok(LockWaitOutcome::Cancelled);
                }
                if Instant::now() >= deadline {
                    return Ok(LockWaitOutcome::TimedOut);
                }
                std::thread::sleep(config.poll_interval);
            }
            Err(err) => {
                return Err(err).with_context(|| {
                    format!(
                        "failed to probe installer lock: {}",
                        config.lock_path.display()
                    )
                });
            }
        }
    }
}
