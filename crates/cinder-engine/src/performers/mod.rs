mod cleanup;
mod exe;
mod msi;
mod msp;
mod service;

pub use cleanup::CleanupPerformer;
pub use exe::ExePerformer;
pub use msi::MsiPerformer;
pub use msp::{classify_train, MspPerformer, PatchTarget};
pub use service::ServicePerformer;

pub(crate) const MSIEXEC: &str = "msiexec";
pub(crate) const QUIET_ARGS: [&str; 2] = ["/qn", "/norestart"];
