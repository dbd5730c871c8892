use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared cooperative-cancellation flag, checked at every loop iteration
/// and polling wake-up. Once requested it stays set for the rest of the
/// run; the one sanctioned exception is [`AbortSignal::suppress`].
#[derive(Debug, Clone, Default)]
pub struct AbortSignal {
    flag: Arc<AtomicBool>,
}

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Temporarily clear the flag so a rollback-as-uninstall pass can run
    /// to completion inside an aborted run. The previous value is restored
    /// when the guard drops.
    pub fn suppress(&self) -> AbortSuppressGuard {
        let was_aborted = self.flag.swap(false, Ordering::SeqCst);
        AbortSuppressGuard {
            signal: self.clone(),
            was_aborted,
        }
    }
}

pub struct AbortSuppressGuard {
    signal: AbortSignal,
    was_aborted: bool,
}

impl Drop for AbortSuppressGuard {
    fn drop(&mut self) {
        if self.was_aborted {
            self.signal.flag.store(true, Ordering::SeqCst);
        }
    }
}
