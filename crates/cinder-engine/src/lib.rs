mod abort;
mod config;
mod lock;
mod logging;
mod orchestrator;
mod performer;
mod performers;
mod progress;
mod resolver;

pub use abort::{AbortSignal, AbortSuppressGuard};
pub use config::EngineConfig;
pub use lock::{wait_for_install_lock, InstallLock, LockWaitOutcome};
pub use logging::{LogLevel, MemoryLog, NullLog, RunLog};
pub use orchestrator::{
    CompositePerformer, ElevationBridge, EngineServices, NoSourceResolver, SourceResolution,
    SourceResolver,
};
pub use performer::{
    ChildHandle, CommandRunner, NoopPerformer, Performer, PerformerFactory, SystemCommandRunner,
    TypeHandlerFactory,
};
pub use performers::{
    classify_train, CleanupPerformer, ExePerformer, MsiPerformer, MspPerformer, PatchTarget,
    ServicePerformer,
};
pub use progress::{
    time_curve_position, AveragedStreams, NullProgress, PhasedObserver, ProgressObserver,
    ProgressState, RollbackObserver, WeightedObserver, PROGRESS_MAX,
};
pub use resolver::{resolve_action, resolve_failure_policy};

#[cfg(test)]
mod tests;
