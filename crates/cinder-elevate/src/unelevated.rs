use std::io::{Read, Write};

use anyhow::{anyhow, Result};
use cinder_cache::ElevationDelegate;
use cinder_core::{ResultCode, Verdict};

use crate::protocol::{
    decode_complete, decode_error, decode_log, decode_progress, decode_state_change,
    decode_string, decode_string_list, encode_ack, encode_index, encode_variables,
    ApplyPackageRequest, Message, MessageChannel, MessageKind,
};

/// UI-side handlers for callbacks relayed from the elevated process. The
/// verdict returned from the progress/error family is posted back so the
/// elevated side observes user-driven cancellation.
pub trait UiRelay {
    fn on_progress(&mut self, progress: u8) -> Verdict;
    fn on_progress_detail(&mut self, progress: u8) -> Verdict;
    fn on_state_change(&mut self, state: u32, detail: &str);
    fn on_log(&mut self, level: u8, text: &str);
    fn on_error(&mut self, item_id: &str, code: ResultCode, text: &str) -> Verdict;
    fn on_msi_message(&mut self, text: &str) -> Verdict;
    fn on_msi_files_in_use(&mut self, files: &[String]) -> Verdict;
}

/// The unelevated (UI-owning) half of the bridge. Exactly one request is in
/// flight at a time: each request pumps callback messages until the single
/// Complete message arrives.
#[derive(Debug)]
pub struct UnelevatedController<R: Read, W: Write, U: UiRelay> {
    channel: MessageChannel<R, W>,
    ui: U,
}

impl<R: Read, W: Write, U: UiRelay> UnelevatedController<R, W, U> {
    pub fn new(reader: R, writer: W, ui: U) -> Self {
        Self {
            channel: MessageChannel::new(reader, writer),
            ui,
        }
    }

    pub fn ui_mut(&mut self) -> &mut U {
        &mut self.ui
    }

    pub fn begin_session(&mut self, variables: &[(String, String)]) -> Result<ResultCode> {
        self.request(Message::new(
            MessageKind::BeginSession,
            encode_variables(variables),
        ))
    }

    pub fn end_session(&mut self) -> Result<ResultCode> {
        self.request(Message::empty(MessageKind::EndSession))
    }

    pub fn suspend_session(&mut self) -> Result<ResultCode> {
        self.request(Message::empty(MessageKind::SuspendSession))
    }

    pub fn resume_session(&mut self) -> Result<ResultCode> {
        self.request(Message::empty(MessageKind::ResumeSession))
    }

    pub fn save_state(&mut self) -> Result<ResultCode> {
        self.request(Message::empty(MessageKind::SaveState))
    }

    /// Execute one package on the elevated side, relaying its UI callbacks
    /// locally until the completion code arrives.
    pub fn apply_package(&mut self, request: &ApplyPackageRequest) -> Result<ResultCode> {
        self.request(Message::new(MessageKind::ApplyPackage, request.encode()))
    }

    /// Tell the elevated side to wind down. Terminate has no completion
    /// message; the elevated pump exits as soon as it reads it.
    pub fn terminate(&mut self) -> Result<()> {
        self.channel.send(&Message::empty(MessageKind::Terminate))
    }

    fn request(&mut self, message: Message) -> Result<ResultCode> {
        self.channel.send(&message)?;
        self.pump_until_complete()
    }

    fn pump_until_complete(&mut self) -> Result<ResultCode> {
        loop {
            let message = self.channel.receive()?;
            match message.kind {
                MessageKind::Progress => {
                    let verdict = self.ui.on_progress(decode_progress(&message.payload)?);
                    self.ack(verdict)?;
                }
                MessageKind::ProgressDetail => {
                    let verdict = self.ui.on_progress_detail(decode_progress(&message.payload)?);
                    self.ack(verdict)?;
                }
                MessageKind::StateChange => {
                    let (state, detail) = decode_state_change(&message.payload)?;
                    self.ui.on_state_change(state, &detail);
                    self.ack(Verdict::Continue)?;
                }
                MessageKind::Log => {
                    let (level, text) = decode_log(&message.payload)?;
                    self.ui.on_log(level, &text);
                    self.ack(Verdict::Continue)?;
                }
                MessageKind::Error => {
                    let (item_id, code, text) = decode_error(&message.payload)?;
                    let verdict = self.ui.on_error(&item_id, code, &text);
                    self.ack(verdict)?;
                }
                MessageKind::MsiMessage => {
                    let verdict = self.ui.on_msi_message(&decode_string(&message.payload)?);
                    self.ack(verdict)?;
                }
                MessageKind::MsiFilesInUse => {
                    let files = decode_string_list(&message.payload)?;
                    let verdict = self.ui.on_msi_files_in_use(&files);
                    self.ack(verdict)?;
                }
                MessageKind::Complete => return decode_complete(&message.payload),
                other => {
                    return Err(anyhow!(
                        "unexpected message during request: {other:?}"
                    ));
                }
            }
        }
    }

    fn ack(&mut self, verdict: Verdict) -> Result<()> {
        self.channel
            .send(&Message::new(MessageKind::Ack, encode_ack(verdict)))
    }

    fn cache_request(&mut self, kind: MessageKind, index: usize) -> Result<ResultCode> {
        self.request(Message::new(kind, encode_index(index)))
    }
}

impl<R: Read, W: Write, U: UiRelay> ElevationDelegate for UnelevatedController<R, W, U> {
    fn is_cached(&mut self, index: usize) -> Result<bool> {
        let code = self.cache_request(MessageKind::IsCached, index)?;
        if code == ResultCode::OK {
            Ok(true)
        } else if code == ResultCode::FILE_NOT_FOUND {
            Ok(false)
        } else {
            Err(anyhow!("elevated is_cached failed with code {code}"))
        }
    }

    fn verify_and_cache_package(&mut self, index: usize) -> Result<()> {
        let code = self.cache_request(MessageKind::VerifyAndCachePackage, index)?;
        if code.is_success() {
            Ok(())
        } else {
            Err(anyhow!(
                "elevated verify_and_cache_package failed with code {code}"
            ))
        }
    }

    fn delete_cached_package(&mut self, index: usize) -> Result<()> {
        let code = self.cache_request(MessageKind::DeleteCachedPackage, index)?;
        if code.is_success() {
            Ok(())
        } else {
            Err(anyhow!(
                "elevated delete_cached_package failed with code {code}"
            ))
        }
    }

    fn delete_temporary_cache_directories(&mut self) -> Result<()> {
        let code = self.request(Message::empty(MessageKind::DeleteTempCacheDirs))?;
        if code.is_success() {
            Ok(())
        } else {
            Err(anyhow!(
                "elevated delete_temporary_cache_directories failed with code {code}"
            ))
        }
    }
}
