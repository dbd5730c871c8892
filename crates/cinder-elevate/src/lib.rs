mod elevated;
mod protocol;
mod unelevated;

pub use cinder_core::Verdict;
pub use elevated::{
    ElevatedCallbacks, ElevatedController, ElevatedHost, LOG_LEVEL_DEBUG, LOG_LEVEL_ERROR,
    LOG_LEVEL_INFO,
};
pub use protocol::{ApplyPackageRequest, Decoder, Encoder, Message, MessageChannel, MessageKind};
pub use unelevated::{UiRelay, UnelevatedController};

#[cfg(test)]
mod tests;
