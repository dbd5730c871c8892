use std::fmt;
use std::process::ExitStatus;

/// Numeric outcome of one unit of installer work.
///
/// A non-success `ResultCode` means the work ran and failed; a Rust `Err`
/// anywhere in the engine means the machinery itself broke. The numeric
/// domain follows the Windows installer convention so child exit codes can
/// be carried through unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResultCode(pub i32);

impl ResultCode {
    pub const OK: ResultCode = ResultCode(0);
    pub const FILE_NOT_FOUND: ResultCode = ResultCode(2);
    pub const REBOOT_REQUIRED: ResultCode = ResultCode(3010);
    pub const CANCELLED: ResultCode = ResultCode(1602);
    pub const FAILED: ResultCode = ResultCode(1603);
    pub const UNKNOWN_PRODUCT: ResultCode = ResultCode(1605);
    pub const PAYLOAD_UNAVAILABLE: ResultCode = ResultCode(1619);
    pub const VERIFY_FAILED: ResultCode = ResultCode(1330);
    pub const PROTOCOL_ERROR: ResultCode = ResultCode(1627);
    pub const LOCK_TIMEOUT: ResultCode = ResultCode(1618);

    pub fn is_success(self) -> bool {
        self == Self::OK || self == Self::REBOOT_REQUIRED
    }

    pub fn needs_reboot(self) -> bool {
        self == Self::REBOOT_REQUIRED
    }

    pub fn is_cancelled(self) -> bool {
        self == Self::CANCELLED
    }

    /// Map a child process exit into the result domain. A missing code
    /// (killed by signal) is reported as a plain failure.
    pub fn from_exit_status(status: ExitStatus) -> ResultCode {
        match status.code() {
            Some(code) => ResultCode(code),
            None => Self::FAILED,
        }
    }

    /// Uninstalling something that is already gone counts as done.
    pub fn normalized_for_uninstall(self) -> ResultCode {
        if self == Self::UNKNOWN_PRODUCT {
            Self::OK
        } else {
            self
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Continue/cancel decision returned by the UI from a progress callback.
/// This is the sole cooperative-cancellation channel from the UI back into
/// a running performer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Continue,
    Cancel,
}

impl Verdict {
    pub fn is_cancel(self) -> bool {
        matches!(self, Self::Cancel)
    }
}

/// Accumulates the first non-success result observed during a run, plus a
/// monotonic abort flag. Only the first failure is ever reported to the
/// caller, no matter how many items fail afterward.
#[derive(Debug, Clone, Copy)]
pub struct FirstError {
    code: ResultCode,
    reboot_required: bool,
    aborted: bool,
}

impl FirstError {
    pub fn new() -> Self {
        Self {
            code: ResultCode::OK,
            reboot_required: false,
            aborted: false,
        }
    }

    /// Record an item result. Reboot-required is noted but does not occupy
    /// the failure slot; later successes never overwrite an earlier failure.
    pub fn record(&mut self, code: ResultCode) {
        if code.needs_reboot() {
            self.reboot_required = true;
            return;
        }
        if !code.is_success() && self.code.is_success() {
            self.code = code;
        }
    }

    pub fn abort(&mut self) {
        self.aborted = true;
        if self.code.is_success() {
            self.code = ResultCode::CANCELLED;
        }
    }

    pub fn aborted(&self) -> bool {
        self.aborted
    }

    pub fn reboot_required(&self) -> bool {
        self.reboot_required
    }

    pub fn has_failure(&self) -> bool {
        !self.code.is_success()
    }

    /// The run's definitive outcome.
    pub fn result(&self) -> ResultCode {
        if !self.code.is_success() {
            self.code
        } else if self.reboot_required {
            ResultCode::REBOOT_REQUIRED
        } else {
            ResultCode::OK
        }
    }
}

impl Default for FirstError {
    fn default() -> Self {
        Self::new()
    }
}
