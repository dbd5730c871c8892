use std::io::{Read, Write};

use anyhow::{anyhow, Context, Result};
use cinder_core::{Action, Operation, ResultCode, Verdict};

/// Wire message types. Values are part of the protocol and never reused;
/// both halves are always the same build, but a mismatch must still fail
/// loudly rather than misdispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MessageKind {
    BeginSession = 0x01,
    EndSession = 0x02,
    SuspendSession = 0x03,
    ResumeSession = 0x04,
    SaveState = 0x05,

    IsCached = 0x10,
    VerifyAndCachePackage = 0x11,
    DeleteCachedPackage = 0x12,
    DeleteTempCacheDirs = 0x13,

    ApplyPackage = 0x20,

    Progress = 0x30,
    ProgressDetail = 0x31,
    StateChange = 0x32,
    Log = 0x33,
    Error = 0x34,
    MsiMessage = 0x35,
    MsiFilesInUse = 0x36,

    Complete = 0x40,
    Ack = 0x41,

    Terminate = 0x50,
}

impl MessageKind {
    pub fn from_wire_value(value: u32) -> Result<Self> {
        match value {
            0x01 => Ok(Self::BeginSession),
            0x02 => Ok(Self::EndSession),
            0x03 => Ok(Self::SuspendSession),
            0x04 => Ok(Self::ResumeSession),
            0x05 => Ok(Self::SaveState),
            0x10 => Ok(Self::IsCached),
            0x11 => Ok(Self::VerifyAndCachePackage),
            0x12 => Ok(Self::DeleteCachedPackage),
            0x13 => Ok(Self::DeleteTempCacheDirs),
            0x20 => Ok(Self::ApplyPackage),
            0x30 => Ok(Self::Progress),
            0x31 => Ok(Self::ProgressDetail),
            0x32 => Ok(Self::StateChange),
            0x33 => Ok(Self::Log),
            0x34 => Ok(Self::Error),
            0x35 => Ok(Self::MsiMessage),
            0x36 => Ok(Self::MsiFilesInUse),
            0x40 => Ok(Self::Complete),
            0x41 => Ok(Self::Ack),
            0x50 => Ok(Self::Terminate),
            _ => Err(anyhow!("unknown message type: {value:#x}")),
        }
    }

    /// True for messages the elevated side pushes mid-request; each one is
    /// answered with a single Ack before the next message is sent.
    pub fn is_callback(self) -> bool {
        matches!(
            self,
            Self::Progress
                | Self::ProgressDetail
                | Self::StateChange
                | Self::Log
                | Self::Error
                | Self::MsiMessage
                | Self::MsiFilesInUse
        )
    }
}

/// One framed envelope: type, then an opaque payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageKind,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(kind: MessageKind, payload: Vec<u8>) -> Self {
        Self { kind, payload }
    }

    pub fn empty(kind: MessageKind) -> Self {
        Self {
            kind,
            payload: Vec::new(),
        }
    }
}

const MAX_PAYLOAD_LEN: u32 = 16 * 1024 * 1024;

/// Duplex framed channel: `[u32 type][u32 length][payload]`, all
/// little-endian.
#[derive(Debug)]
pub struct MessageChannel<R: Read, W: Write> {
    reader: R,
    writer: W,
}

impl<R: Read, W: Write> MessageChannel<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        Self { reader, writer }
    }

    pub fn send(&mut self, message: &Message) -> Result<()> {
        let length = u32::try_from(message.payload.len())
            .map_err(|_| anyhow!("message payload too large"))?;
        if length > MAX_PAYLOAD_LEN {
            return Err(anyhow!("message payload too large: {length} bytes"));
        }

        self.writer
            .write_all(&(message.kind as u32).to_le_bytes())
            .context("failed to write message type")?;
        self.writer
            .write_all(&length.to_le_bytes())
            .context("failed to write message length")?;
        self.writer
            .write_all(&message.payload)
            .context("failed to write message payload")?;
        self.writer.flush().context("failed to flush message")?;
        Ok(())
    }

    pub fn receive(&mut self) -> Result<Message> {
        let mut header = [0_u8; 8];
        self.reader
            .read_exact(&mut header)
            .context("failed to read message header")?;

        let kind = MessageKind::from_wire_value(u32::from_le_bytes([
            header[0], header[1], header[2], header[3],
        ]))?;
        let length = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        if length > MAX_PAYLOAD_LEN {
            return Err(anyhow!("message payload too large: {length} bytes"));
        }

        let mut payload = vec![0_u8; length as usize];
        self.reader
            .read_exact(&mut payload)
            .context("failed to read message payload")?;
        Ok(Message { kind, payload })
    }
}

fn verdict_wire_value(verdict: Verdict) -> u32 {
    match verdict {
        Verdict::Continue => 0,
        Verdict::Cancel => 1,
    }
}

fn verdict_from_wire_value(value: u32) -> Result<Verdict> {
    match value {
        0 => Ok(Verdict::Continue),
        1 => Ok(Verdict::Cancel),
        _ => Err(anyhow!("invalid verdict wire value: {value}")),
    }
}

/// Payload writer. Numbers are fixed-width little-endian; strings are
/// length-prefixed UTF-16.
#[derive(Debug, Default)]
pub struct Encoder {
    buffer: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_u8(&mut self, value: u8) -> &mut Self {
        self.buffer.push(value);
        self
    }

    pub fn put_u32(&mut self, value: u32) -> &mut Self {
        self.buffer.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn put_i32(&mut self, value: i32) -> &mut Self {
        self.buffer.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn put_u64(&mut self, value: u64) -> &mut Self {
        self.buffer.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn put_string(&mut self, value: &str) -> &mut Self {
        let units: Vec<u16> = value.encode_utf16().collect();
        self.put_u32(units.len() as u32);
        for unit in units {
            self.buffer.extend_from_slice(&unit.to_le_bytes());
        }
        self
    }

    pub fn finish(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buffer)
    }
}

/// Payload reader matching [`Encoder`]'s layout.
#[derive(Debug)]
pub struct Decoder<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    fn take(&mut self, count: usize) -> Result<&'a [u8]> {
        let end = self
            .offset
            .checked_add(count)
            .ok_or_else(|| anyhow!("message payload offset overflow"))?;
        if end > self.bytes.len() {
            return Err(anyhow!(
                "message payload truncated: wanted {count} bytes at offset {}",
                self.offset
            ));
        }
        let slice = &self.bytes[self.offset..end];
        self.offset = end;
        Ok(slice)
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn u32(&mut self) -> Result<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn i32(&mut self) -> Result<i32> {
        let bytes = self.take(4)?;
        Ok(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn u64(&mut self) -> Result<u64> {
        let bytes = self.take(8)?;
        Ok(u64::from_le_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
        ]))
    }

    pub fn string(&mut self) -> Result<String> {
        let unit_count = self.u32()? as usize;
        let raw = self.take(unit_count * 2)?;
        let units: Vec<u16> = raw
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        String::from_utf16(&units).context("message string is not valid UTF-16")
    }

    pub fn finish(&self) -> Result<()> {
        if self.offset != self.bytes.len() {
            return Err(anyhow!(
                "message payload has {} trailing bytes",
                self.bytes.len() - self.offset
            ));
        }
        Ok(())
    }
}

/// Execute request sent from the unelevated to the elevated side: the full
/// variable context plus the resolved work tuple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyPackageRequest {
    pub variables: Vec<(String, String)>,
    pub package_index: u32,
    pub operation: Operation,
    pub action: Action,
}

impl ApplyPackageRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.put_u32(self.variables.len() as u32);
        for (name, value) in &self.variables {
            encoder.put_string(name);
            encoder.put_string(value);
        }
        encoder.put_u32(self.package_index);
        encoder.put_u32(self.operation.wire_value());
        encoder.put_u32(self.action.wire_value());
        encoder.finish()
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut decoder = Decoder::new(payload);
        let variable_count = decoder.u32()? as usize;
        let mut variables = Vec::with_capacity(variable_count.min(1024));
        for _ in 0..variable_count {
            let name = decoder.string()?;
            let value = decoder.string()?;
            variables.push((name, value));
        }
        let package_index = decoder.u32()?;
        let operation = Operation::from_wire_value(decoder.u32()?)?;
        let action = Action::from_wire_value(decoder.u32()?)?;
        decoder.finish()?;
        Ok(Self {
            variables,
            package_index,
            operation,
            action,
        })
    }
}

pub fn encode_index(index: usize) -> Vec<u8> {
    let mut encoder = Encoder::new();
    encoder.put_u32(index as u32);
    encoder.finish()
}

pub fn decode_index(payload: &[u8]) -> Result<usize> {
    let mut decoder = Decoder::new(payload);
    let index = decoder.u32()? as usize;
    decoder.finish()?;
    Ok(index)
}

pub fn encode_complete(code: ResultCode) -> Vec<u8> {
    let mut encoder = Encoder::new();
    encoder.put_i32(code.0);
    encoder.finish()
}

pub fn decode_complete(payload: &[u8]) -> Result<ResultCode> {
    let mut decoder = Decoder::new(payload);
    let code = ResultCode(decoder.i32()?);
    decoder.finish()?;
    Ok(code)
}

pub fn encode_ack(verdict: Verdict) -> Vec<u8> {
    let mut encoder = Encoder::new();
    encoder.put_u32(verdict_wire_value(verdict));
    encoder.finish()
}

pub fn decode_ack(payload: &[u8]) -> Result<Verdict> {
    let mut decoder = Decoder::new(payload);
    let verdict = verdict_from_wire_value(decoder.u32()?)?;
    decoder.finish()?;
    Ok(verdict)
}

pub fn encode_variables(variables: &[(String, String)]) -> Vec<u8> {
    let mut encoder = Encoder::new();
    encoder.put_u32(variables.len() as u32);
    for (name, value) in variables {
        encoder.put_string(name);
        encoder.put_string(value);
    }
    encoder.finish()
}

pub fn decode_variables(payload: &[u8]) -> Result<Vec<(String, String)>> {
    let mut decoder = Decoder::new(payload);
    let count = decoder.u32()? as usize;
    let mut variables = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        let name = decoder.string()?;
        let value = decoder.string()?;
        variables.push((name, value));
    }
    decoder.finish()?;
    Ok(variables)
}

pub fn encode_progress(progress: u8) -> Vec<u8> {
    let mut encoder = Encoder::new();
    encoder.put_u8(progress);
    encoder.finish()
}

pub fn decode_progress(payload: &[u8]) -> Result<u8> {
    let mut decoder = Decoder::new(payload);
    let progress = decoder.u8()?;
    decoder.finish()?;
    Ok(progress)
}

pub fn encode_state_change(state: u32, detail: &str) -> Vec<u8> {
    let mut encoder = Encoder::new();
    encoder.put_u32(state);
    encoder.put_string(detail);
    encoder.finish()
}

pub fn decode_state_change(payload: &[u8]) -> Result<(u32, String)> {
    let mut decoder = Decoder::new(payload);
    let state = decoder.u32()?;
    let detail = decoder.string()?;
    decoder.finish()?;
    Ok((state, detail))
}

pub fn encode_log(level: u8, text: &str) -> Vec<u8> {
    let mut encoder = Encoder::new();
    encoder.put_u8(level);
    encoder.put_string(text);
    encoder.finish()
}

pub fn decode_log(payload: &[u8]) -> Result<(u8, String)> {
    let mut decoder = Decoder::new(payload);
    let level = decoder.u8()?;
    let text = decoder.string()?;
    decoder.finish()?;
    Ok((level, text))
}

pub fn encode_error(item_id: &str, code: ResultCode, text: &str) -> Vec<u8> {
    let mut encoder = Encoder::new();
    encoder.put_string(item_id);
    encoder.put_i32(code.0);
    encoder.put_string(text);
    encoder.finish()
}

pub fn decode_error(payload: &[u8]) -> Result<(String, ResultCode, String)> {
    let mut decoder = Decoder::new(payload);
    let item_id = decoder.string()?;
    let code = ResultCode(decoder.i32()?);
    let text = decoder.string()?;
    decoder.finish()?;
    Ok((item_id, code, text))
}

pub fn encode_string(text: &str) -> Vec<u8> {
    let mut encoder = Encoder::new();
    encoder.put_string(text);
    encoder.finish()
}

pub fn decode_string(payload: &[u8]) -> Result<String> {
    let mut decoder = Decoder::new(payload);
    let text = decoder.string()?;
    decoder.finish()?;
    Ok(text)
}

pub fn encode_string_list(entries: &[String]) -> Vec<u8> {
    let mut encoder = Encoder::new();
    encoder.put_u32(entries.len() as u32);
    for entry in entries {
        encoder.put_string(entry);
    }
    encoder.finish()
}

pub fn decode_string_list(payload: &[u8]) -> Result<Vec<String>> {
    let mut decoder = Decoder::new(payload);
    let count = decoder.u32()? as usize;
    let mut entries = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        entries.push(decoder.string()?);
    }
    decoder.finish()?;
    Ok(entries)
}
