use std::path::PathBuf;
use std::time::Duration;

/// Engine tunables. The driver maps command-line flags onto this; the
/// defaults match an attended, interactive session.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// True when a user is present to answer prompts; also selects the
    /// shorter installer-lock wait.
    pub interactive: bool,
    /// How long to wait for the system-wide installer lock in an
    /// interactive session.
    pub lock_wait_interactive: Duration,
    /// How long to wait for the installer lock when unattended.
    pub lock_wait_unattended: Duration,
    /// Sleep between iterations of every polling wait loop. Abort is
    /// re-checked on each wake.
    pub poll_interval: Duration,
    /// How long to keep polling for an in-flight background download
    /// before falling back to source resolution.
    pub download_wait: Duration,
    /// How many times the user may be re-prompted for a missing payload
    /// source. Only real prompts consume budget; download waiting does not.
    pub source_retry_budget: u32,
    /// Marker file used as the single-install-at-a-time lock.
    pub lock_path: PathBuf,
    /// Command-line supplied installer options, appended after authored
    /// options so they win on conflict.
    pub command_line_options: Vec<String>,
}

impl EngineConfig {
    pub fn lock_wait(&self) -> Duration {
        if self.interactive {
            self.lock_wait_interactive
        } else {
            self.lock_wait_unattended
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            interactive: true,
            lock_wait_interactive: Duration::from_secs(60),
            lock_wait_unattended: Duration::from_secs(15 * 60),
            poll_interval: Duration::from_secs(1),
            download_wait: Duration::from_secs(10 * 60),
            source_retry_budget: 3,
            lock_path: std::env::temp_dir().join("cinder-install.lock"),
            command_line_options: Vec::new(),
        }
    }
}
