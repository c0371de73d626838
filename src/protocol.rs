//! Framed host<->container protocol.
//!
//! Wire format: `[u32 length][u8 type][u8 command_len][command bytes]
//! [optional 4-byte fmt tag][payload]`, `length` covering everything
//! after itself. A [`tokio_util::codec::Framed`] stream built on
//! [`FrameCodec`] preserves FIFO ordering on a connection by
//! construction.

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use crate::device::SyncSelector;

const TYPE_DATA: u8 = 0;
const TYPE_FORMAT: u8 = 1;
const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

/// One message on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: String,
    pub fmt: Option<[u8; 4]>,
    pub data: Vec<u8>,
}

impl Frame {
    pub fn new(command: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            command: command.into(),
            fmt: None,
            data: data.into(),
        }
    }

    fn with_fmt(command: impl Into<String>, fmt: [u8; 4], data: impl Into<Vec<u8>>) -> Self {
        Self {
            command: command.into(),
            fmt: Some(fmt),
            data: data.into(),
        }
    }

    // --- server-originated (uppercase) ---

    pub fn hello() -> Self {
        Self::new("HELLO", Vec::new())
    }

    pub fn uevent(buf: Vec<u8>) -> Self {
        Self::new("UEVENT", buf)
    }

    pub fn sync(devpath: &str, selector: SyncSelector, buffer: &[u8]) -> Self {
        let mut data = Vec::new();
        data.extend_from_slice(devpath.as_bytes());
        data.push(0);
        data.extend_from_slice(selector_token(selector).as_bytes());
        data.push(0);
        data.extend_from_slice(buffer);
        Self::new("SYNC", data)
    }

    pub fn begincmd(cmd: &str) -> Self {
        Self::new("BEGINCMD", cmd.as_bytes().to_vec())
    }

    pub fn endcmd(cmd: &str) -> Self {
        Self::new("ENDCMD", cmd.as_bytes().to_vec())
    }

    pub fn server_bye(reason: &str) -> Self {
        Self::new("BYE", reason.as_bytes().to_vec())
    }

    pub fn echo_reply(payload: &[u8]) -> Self {
        Self::new("ECHO", payload.to_vec())
    }

    // --- client-originated (lowercase) ---

    pub fn client_hello(name: &str) -> Self {
        Self::new("hello", name.as_bytes().to_vec())
    }

    pub fn dry_run() -> Self {
        Self::new("dry_run", Vec::new())
    }

    pub fn boot() -> Self {
        Self::new("boot", Vec::new())
    }

    pub fn shutdown() -> Self {
        Self::new("shutdown", Vec::new())
    }

    pub fn bye(reason: Option<&str>) -> Self {
        Self::new("bye", reason.unwrap_or("").as_bytes().to_vec())
    }

    pub fn echo(payload: &[u8]) -> Self {
        Self::new("echo", payload.to_vec())
    }

    pub fn into_command(self) -> Command {
        match self.command.as_str() {
            "HELLO" => Command::Hello,
            "hello" => Command::ClientHello(String::from_utf8_lossy(&self.data).into_owned()),
            "dry_run" => Command::DryRun,
            "boot" => Command::Boot,
            "shutdown" => Command::Shutdown,
            "bye" => Command::Bye(non_empty_utf8(&self.data)),
            "echo" => Command::Echo(self.data),
            "UEVENT" => Command::UEvent(self.data),
            "SYNC" => match parse_sync_payload(&self.data) {
                Some((devpath, selector, buffer)) => Command::Sync(devpath, selector, buffer),
                None => Command::Unknown(self.command),
            },
            "BEGINCMD" => Command::BeginCmd(String::from_utf8_lossy(&self.data).into_owned()),
            "ENDCMD" => Command::EndCmd(String::from_utf8_lossy(&self.data).into_owned()),
            "BYE" => Command::ServerBye(String::from_utf8_lossy(&self.data).into_owned()),
            "ECHO" => Command::EchoReply(self.data),
            other => Command::Unknown(other.to_string()),
        }
    }
}

fn selector_token(selector: SyncSelector) -> String {
    let mut tokens = Vec::new();
    if selector.contains(SyncSelector::ENV) {
        tokens.push("ENV");
    }
    if selector.contains(SyncSelector::TAGS) {
        tokens.push("TAGS");
    }
    tokens.join(",")
}

fn parse_sync_payload(data: &[u8]) -> Option<(String, SyncSelector, Vec<u8>)> {
    let mut parts = data.splitn(3, |&b| b == 0);
    let devpath = String::from_utf8_lossy(parts.next()?).into_owned();
    let selector_raw = String::from_utf8_lossy(parts.next()?).into_owned();
    let buffer = parts.next().unwrap_or(&[]).to_vec();
    let selector = SyncSelector::from_tokens(selector_raw.split(','));
    Some((devpath, selector, buffer))
}

fn non_empty_utf8(data: &[u8]) -> Option<String> {
    if data.is_empty() {
        None
    } else {
        Some(String::from_utf8_lossy(data).into_owned())
    }
}

/// Parsed form of every command the protocol defines, for dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Hello,
    ClientHello(String),
    DryRun,
    Boot,
    Shutdown,
    Bye(Option<String>),
    Echo(Vec<u8>),
    UEvent(Vec<u8>),
    Sync(String, SyncSelector, Vec<u8>),
    BeginCmd(String),
    EndCmd(String),
    ServerBye(String),
    EchoReply(Vec<u8>),
    Unknown(String),
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame length {0} exceeds maximum {MAX_FRAME_LEN}")]
    FrameTooLarge(u32),
    #[error("command is not valid UTF-8")]
    InvalidCommand,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Length-prefixed frame codec.
#[derive(Debug, Default)]
pub struct FrameCodec {
    /// Length of the frame currently being assembled, once known.
    pending_len: Option<u32>,
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if frame.command.len() > u8::MAX as usize {
            return Err(ProtocolError::InvalidCommand);
        }

        let mut body = Vec::new();
        let frame_type = if frame.fmt.is_some() { TYPE_FORMAT } else { TYPE_DATA };
        body.put_u8(frame_type);
        body.put_u8(frame.command.len() as u8);
        body.extend_from_slice(frame.command.as_bytes());
        if let Some(fmt) = frame.fmt {
            body.extend_from_slice(&fmt);
        }
        body.extend_from_slice(&frame.data);

        let len = body.len() as u32;
        if len > MAX_FRAME_LEN {
            return Err(ProtocolError::FrameTooLarge(len));
        }

        dst.reserve(4 + body.len());
        dst.put_u32(len);
        dst.extend_from_slice(&body);
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, Self::Error> {
        let len = match self.pending_len {
            Some(len) => len,
            None => {
                if src.len() < 4 {
                    return Ok(None);
                }
                let len = (&src[..4]).get_u32();
                if len > MAX_FRAME_LEN {
                    return Err(ProtocolError::FrameTooLarge(len));
                }
                src.advance(4);
                self.pending_len = Some(len);
                len
            }
        };

        if src.len() < len as usize {
            src.reserve(len as usize - src.len());
            return Ok(None);
        }

        let mut body = src.split_to(len as usize);
        self.pending_len = None;

        let frame_type = body.get_u8();
        let command_len = body.get_u8() as usize;
        if body.len() < command_len {
            return Err(ProtocolError::InvalidCommand);
        }
        let command_bytes = body.split_to(command_len);
        let command = String::from_utf8(command_bytes.to_vec())
            .map_err(|_| ProtocolError::InvalidCommand)?;

        let fmt = if frame_type == TYPE_FORMAT {
            if body.len() < 4 {
                return Err(ProtocolError::InvalidCommand);
            }
            let mut tag = [0u8; 4];
            tag.copy_from_slice(&body.split_to(4));
            Some(tag)
        } else {
            None
        };

        Ok(Some(Frame {
            command,
            fmt,
            data: body.to_vec(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(frames: &[Frame]) -> Vec<Frame> {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        for frame in frames {
            codec.encode(frame.clone(), &mut buf).unwrap();
        }

        let mut out = Vec::new();
        let mut decode_codec = FrameCodec::default();
        while let Some(frame) = decode_codec.decode(&mut buf).unwrap() {
            out.push(frame);
        }
        out
    }

    #[test]
    fn fifo_order_preserved_across_payload_sizes() {
        let frames = vec![
            Frame::new("echo", Vec::new()),
            Frame::new("echo", vec![0u8; 64 * 1024]),
            Frame::new("echo", vec![1, 2, 3]),
        ];
        let decoded = round_trip(&frames);
        assert_eq!(decoded, frames);
    }

    #[test]
    fn partial_reads_do_not_split_messages() {
        let frames = vec![Frame::new("echo", vec![9; 100])];
        let mut codec = FrameCodec::default();
        let mut full = BytesMut::new();
        codec.encode(frames[0].clone(), &mut full).unwrap();

        let mut partial = BytesMut::new();
        let mut decoder = FrameCodec::default();
        // Feed one byte at a time; decode must return None until the whole
        // frame has arrived.
        for i in 0..full.len() {
            partial.extend_from_slice(&full[i..i + 1]);
            let result = decoder.decode(&mut partial).unwrap();
            if i + 1 < full.len() {
                assert!(result.is_none());
            } else {
                assert_eq!(result, Some(frames[0].clone()));
            }
        }
    }

    #[test]
    fn sync_command_round_trips_through_parsing() {
        let frame = Frame::sync("/devices/x", SyncSelector::ENV | SyncSelector::TAGS, b"payload");
        match frame.into_command() {
            Command::Sync(devpath, selector, buffer) => {
                assert_eq!(devpath, "/devices/x");
                assert_eq!(selector, SyncSelector::ENV | SyncSelector::TAGS);
                assert_eq!(buffer, b"payload");
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn unknown_command_is_tagged_unknown() {
        let frame = Frame::new("WAT", Vec::new());
        assert_eq!(frame.into_command(), Command::Unknown("WAT".to_string()));
    }
}
