use std::io::{Read, Write};

use anyhow::{anyhow, Result};
use cinder_core::{ResultCode, Verdict};

use crate::protocol::{
    decode_ack, decode_index, decode_variables, encode_complete, encode_error, encode_log,
    encode_progress, encode_state_change, encode_string, encode_string_list,
    ApplyPackageRequest, Message, MessageChannel, MessageKind,
};

/// Callbacks the elevated-side engine raises while executing a package.
/// Every call blocks until the unelevated side's verdict comes back, so
/// elevated execution is always gated on the UI's decision.
pub trait ElevatedCallbacks {
    fn on_progress(&mut self, progress: u8) -> Result<Verdict>;
    fn on_progress_detail(&mut self, progress: u8) -> Result<Verdict>;
    fn on_state_change(&mut self, state: u32, detail: &str) -> Result<()>;
    fn log(&mut self, level: u8, text: &str) -> Result<()>;
    fn on_error(&mut self, item_id: &str, code: ResultCode, text: &str) -> Result<Verdict>;
    fn on_msi_message(&mut self, text: &str) -> Result<Verdict>;
    fn on_msi_files_in_use(&mut self, files: &[String]) -> Result<Verdict>;
}

/// The per-machine engine surface the elevated controller drives.
pub trait ElevatedHost {
    fn begin_session(&mut self, variables: &[(String, String)]) -> Result<()>;
    fn end_session(&mut self) -> Result<()>;
    fn suspend_session(&mut self) -> Result<()>;
    fn resume_session(&mut self) -> Result<()>;
    fn save_state(&mut self) -> Result<()>;
    fn is_cached(&mut self, index: usize) -> Result<bool>;
    fn verify_and_cache_package(&mut self, index: usize) -> Result<()>;
    fn delete_cached_package(&mut self, index: usize) -> Result<()>;
    fn delete_temporary_cache_directories(&mut self) -> Result<()>;
    fn apply_package(
        &mut self,
        request: &ApplyPackageRequest,
        callbacks: &mut dyn ElevatedCallbacks,
    ) -> Result<ResultCode>;
}

/// The elevated half: a dispatch loop that serves requests until the pipe
/// closes or a Terminate message arrives.
#[derive(Debug)]
pub struct ElevatedController<R: Read, W: Write> {
    channel: MessageChannel<R, W>,
}

impl<R: Read, W: Write> ElevatedController<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            channel: MessageChannel::new(reader, writer),
        }
    }

    pub fn serve(&mut self, host: &mut dyn ElevatedHost) -> Result<()> {
        loop {
            let message = match self.channel.receive() {
                Ok(message) => message,
                Err(err) if is_pipe_loss(&err) => return Ok(()),
                Err(err) => return Err(err),
            };

            match message.kind {
                MessageKind::Terminate => return Ok(()),
                MessageKind::BeginSession => {
                    let variables = decode_variables(&message.payload)?;
                    let code = unit_result_code(host.begin_session(&variables));
                    self.complete(code)?;
                }
                MessageKind::EndSession => {
                    let code = unit_result_code(host.end_session());
                    self.complete(code)?;
                }
                MessageKind::SuspendSession => {
                    let code = unit_result_code(host.suspend_session());
                    self.complete(code)?;
                }
                MessageKind::ResumeSession => {
                    let code = unit_result_code(host.resume_session());
                    self.complete(code)?;
                }
                MessageKind::SaveState => {
                    let code = unit_result_code(host.save_state());
                    self.complete(code)?;
                }
                MessageKind::IsCached => {
                    let index = decode_index(&message.payload)?;
                    let code = match host.is_cached(index) {
                        Ok(true) => ResultCode::OK,
                        Ok(false) => ResultCode::FILE_NOT_FOUND,
                        Err(err) => self.report_failure("is_cached", &err)?,
                    };
                    self.complete(code)?;
                }
                MessageKind::VerifyAndCachePackage => {
                    let index = decode_index(&message.payload)?;
                    let code = match host.verify_and_cache_package(index) {
                        Ok(()) => ResultCode::OK,
                        Err(err) => self.report_failure("verify_and_cache_package", &err)?,
                    };
                    self.complete(code)?;
                }
                MessageKind::DeleteCachedPackage => {
                    let index = decode_index(&message.payload)?;
                    let code = match host.delete_cached_package(index) {
                        Ok(()) => ResultCode::OK,
                        Err(err) => self.report_failure("delete_cached_package", &err)?,
                    };
                    self.complete(code)?;
                }
                MessageKind::DeleteTempCacheDirs => {
                    let code = match host.delete_temporary_cache_directories() {
                        Ok(()) => ResultCode::OK,
                        Err(err) => {
                            self.report_failure("delete_temporary_cache_directories", &err)?
                        }
                    };
                    self.complete(code)?;
                }
                MessageKind::ApplyPackage => {
                    let request = ApplyPackageRequest::decode(&message.payload)?;
                    let code = {
                        let mut relay = CallbackRelay {
                            channel: &mut self.channel,
                        };
                        match host.apply_package(&request, &mut relay) {
                            Ok(code) => code,
                            Err(_) => ResultCode::FAILED,
                        }
                    };
                    self.complete(code)?;
                }
                other => {
                    return Err(anyhow!("unexpected request message: {other:?}"));
                }
            }
        }
    }

    fn complete(&mut self, code: ResultCode) -> Result<()> {
        self.channel
            .send(&Message::new(MessageKind::Complete, encode_complete(code)))
    }

    /// Push the failure text to the UI log before completing with a failure
    /// code, so the unelevated side has something better than a bare number.
    fn report_failure(&mut self, operation: &str, err: &anyhow::Error) -> Result<ResultCode> {
        let mut relay = CallbackRelay {
            channel: &mut self.channel,
        };
        relay.log(LOG_LEVEL_ERROR, &format!("{operation} failed: {err:#}"))?;
        Ok(ResultCode::FAILED)
    }
}

pub const LOG_LEVEL_ERROR: u8 = 0;
pub const LOG_LEVEL_INFO: u8 = 1;
pub const LOG_LEVEL_DEBUG: u8 = 2;

/// Collapse a unit-returning host operation into a wire result code:
/// success maps to `OK`, any error to `FAILED`.
fn unit_result_code(result: Result<()>) -> ResultCode {
    match result {
        Ok(()) => ResultCode::OK,
        Err(_) => ResultCode::FAILED,
    }
}

struct CallbackRelay<'a, R: Read, W: Write> {
    channel: &'a mut MessageChannel<R, W>,
}

impl<R: Read, W: Write> CallbackRelay<'_, R, W> {
    fn push(&mut self, message: Message) -> Result<Verdict> {
        self.channel.send(&message)?;
        let reply = self.channel.receive()?;
        if reply.kind != MessageKind::Ack {
            return Err(anyhow!(
                "expected callback ack, received {:?}",
                reply.kind
            ));
        }
        decode_ack(&reply.payload)
    }
}

impl<R: Read, W: Write> ElevatedCallbacks for CallbackRelay<'_, R, W> {
    fn on_progress(&mut self, progress: u8) -> Result<Verdict> {
        self.push(Message::new(
            MessageKind::Progress,
            encode_progress(progress),
        ))
    }

    fn on_progress_detail(&mut self, progress: u8) -> Result<Verdict> {
        self.push(Message::new(
            MessageKind::ProgressDetail,
            encode_progress(progress),
        ))
    }

    fn on_state_change(&mut self, state: u32, detail: &str) -> Result<()> {
        self.push(Message::new(
            MessageKind::StateChange,
            encode_state_change(state, detail),
        ))?;
        Ok(())
    }

    fn log(&mut self, level: u8, text: &str) -> Result<()> {
        self.push(Message::new(MessageKind::Log, encode_log(level, text)))?;
        Ok(())
    }

    fn on_error(&mut self, item_id: &str, code: ResultCode, text: &str) -> Result<Verdict> {
        self.push(Message::new(
            MessageKind::Error,
            encode_error(item_id, code, text),
        ))
    }

    fn on_msi_message(&mut self, text: &str) -> Result<Verdict> {
        self.push(Message::new(MessageKind::MsiMessage, encode_string(text)))
    }

    fn on_msi_files_in_use(&mut self, files: &[String]) -> Result<Verdict> {
        self.push(Message::new(
            MessageKind::MsiFilesInUse,
            encode_string_list(files),
        ))
    }
}

fn is_pipe_loss(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<std::io::Error>()
            .is_some_and(|io_err| {
                matches!(
                    io_err.kind(),
                    std::io::ErrorKind::UnexpectedEof
                        | std::io::ErrorKind::BrokenPipe
                        | std::io::ErrorKind::ConnectionReset
                )
            })
    })
}
