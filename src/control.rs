//! Udev control socket: a Unix datagram endpoint compatible with the
//! standard udev admin tool's wire format.

use std::io;
use std::mem::MaybeUninit;
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use thiserror::Error;
use tokio::io::unix::AsyncFd;

/// Magic value the standard udev control tool stamps on every record.
/// An implementation claiming compatibility with a different admin
/// tool would need to match that tool's value instead.
pub const CONTROL_MAGIC: u32 = 0xfeed_cafe;
const RECORD_LEN: usize = 4 + 4 + 4 + 256;

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ControlType {
    SetLogLevel = 1,
    StopExecQueue = 2,
    StartExecQueue = 3,
    Reload = 4,
    SetEnv = 5,
    SetChildrenMax = 6,
    Ping = 7,
    Exit = 8,
}

impl ControlType {
    fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            1 => Self::SetLogLevel,
            2 => Self::StopExecQueue,
            3 => Self::StartExecQueue,
            4 => Self::Reload,
            5 => Self::SetEnv,
            6 => Self::SetChildrenMax,
            7 => Self::Ping,
            8 => Self::Exit,
            _ => return None,
        })
    }
}

/// A parsed control record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    SetLogLevel(i32),
    StopExecQueue,
    StartExecQueue,
    Reload,
    SetEnv(String),
    SetChildrenMax(i32),
    Ping,
    Exit,
    /// A well-formed record whose type code this version doesn't
    /// recognize.
    Unknown(u32),
}

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("control record is {0} bytes, expected {RECORD_LEN}")]
    WrongLength(usize),
    #[error("control record magic {0:#x} does not match {CONTROL_MAGIC:#x}")]
    BadMagic(u32),
    #[error(transparent)]
    Io(#[from] io::Error),
}

fn parse_record(buf: &[u8]) -> Result<ControlMessage, ControlError> {
    if buf.len() != RECORD_LEN {
        return Err(ControlError::WrongLength(buf.len()));
    }
    let magic = u32::from_ne_bytes(buf[0..4].try_into().unwrap());
    if magic != CONTROL_MAGIC {
        return Err(ControlError::BadMagic(magic));
    }
    let msg_type = u32::from_ne_bytes(buf[4..8].try_into().unwrap());
    let intval = i32::from_ne_bytes(buf[8..12].try_into().unwrap());
    let strbuf = &buf[12..12 + 256];
    let nul = strbuf.iter().position(|&b| b == 0).unwrap_or(strbuf.len());
    let string = String::from_utf8_lossy(&strbuf[..nul]).into_owned();

    Ok(match ControlType::from_u32(msg_type) {
        Some(ControlType::SetLogLevel) => ControlMessage::SetLogLevel(intval),
        Some(ControlType::StopExecQueue) => ControlMessage::StopExecQueue,
        Some(ControlType::StartExecQueue) => ControlMessage::StartExecQueue,
        Some(ControlType::Reload) => ControlMessage::Reload,
        Some(ControlType::SetEnv) => ControlMessage::SetEnv(string),
        Some(ControlType::SetChildrenMax) => ControlMessage::SetChildrenMax(intval),
        Some(ControlType::Ping) => ControlMessage::Ping,
        Some(ControlType::Exit) => ControlMessage::Exit,
        None => ControlMessage::Unknown(msg_type),
    })
}

struct RawSocket(RawFd);

impl AsRawFd for RawSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

impl Drop for RawSocket {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.0);
        }
    }
}

/// Where the control socket's file descriptor comes from: only
/// bind/listen when one of these is actually available; never fall
/// back to an invalid fd.
pub enum ControlSource<'a> {
    Path(&'a Path),
    /// A pre-opened, already-bound fd (systemd socket activation).
    InheritedFd(RawFd),
}

/// A bound udev control socket.
pub struct ControlSocket {
    io: AsyncFd<RawSocket>,
    path: Option<PathBuf>,
}

impl ControlSocket {
    fn from_raw_fd(fd: RawFd, path: Option<PathBuf>) -> Result<Self> {
        let passcred: libc::c_int = 1;
        let rc = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_PASSCRED,
                &passcred as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error()).context("failed to set SO_PASSCRED");
        }
        unsafe {
            let flags = libc::fcntl(fd, libc::F_GETFL);
            libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
        }
        Ok(Self {
            io: AsyncFd::new(RawSocket(fd))?,
            path,
        })
    }

    /// Bind a fresh Unix datagram socket at `path`, replacing a stale
    /// socket file if one is left over.
    pub fn bind(path: &Path) -> Result<Self> {
        let _ = std::fs::remove_file(path);
        let fd = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_DGRAM | libc::SOCK_CLOEXEC, 0) };
        if fd < 0 {
            return Err(io::Error::last_os_error()).context("failed to create control socket");
        }

        let sockaddr = unix_sockaddr(path)?;
        let rc = unsafe {
            libc::bind(
                fd,
                &sockaddr.0 as *const _ as *const libc::sockaddr,
                sockaddr.1 as libc::socklen_t,
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(err).context("failed to bind control socket");
        }

        Self::from_raw_fd(fd, Some(path.to_owned()))
    }

    /// Adopt an already-bound, inherited fd (`--systemd` socket
    /// activation).
    pub fn from_inherited(fd: RawFd) -> Result<Self> {
        Self::from_raw_fd(fd, None)
    }

    /// Bind/inherit the control socket only when a real path or fd is
    /// available; otherwise return `None` rather than operating on an
    /// invalid descriptor.
    pub fn maybe_open(source: Option<ControlSource<'_>>) -> Result<Option<Self>> {
        match source {
            Some(ControlSource::Path(path)) => Ok(Some(Self::bind(path)?)),
            Some(ControlSource::InheritedFd(fd)) if fd >= 0 => Ok(Some(Self::from_inherited(fd)?)),
            _ => Ok(None),
        }
    }

    /// Receive the next control message from a uid-0 peer, silently
    /// skipping (and logging) anything else.
    pub async fn recv(&self) -> Result<ControlMessage> {
        loop {
            let mut guard = self.io.readable().await?;
            let result = guard.try_io(|inner| recv_with_creds(inner.as_raw_fd()));
            let (buf, uid) = match result {
                Ok(Ok(v)) => v,
                Ok(Err(err)) => return Err(err.into()),
                Err(_would_block) => continue,
            };

            if uid != Some(0) {
                log::warn!("dropping control message from non-root peer (uid={uid:?})");
                continue;
            }

            match parse_record(&buf) {
                Ok(msg) => return Ok(msg),
                Err(err) => {
                    log::warn!("dropping malformed control record: {err}");
                    continue;
                }
            }
        }
    }
}

impl Drop for ControlSocket {
    fn drop(&mut self) {
        if let Some(path) = &self.path {
            let _ = std::fs::remove_file(path);
        }
    }
}

fn unix_sockaddr(path: &Path) -> Result<(libc::sockaddr_un, usize)> {
    let bytes = path.as_os_str().as_encoded_bytes();
    anyhow::ensure!(bytes.len() < 108, "control socket path too long");
    let mut addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as u16;
    for (i, &b) in bytes.iter().enumerate() {
        addr.sun_path[i] = b as libc::c_char;
    }
    let len = std::mem::size_of::<libc::sa_family_t>() + bytes.len() + 1;
    Ok((addr, len))
}

fn recv_with_creds(fd: RawFd) -> io::Result<(Vec<u8>, Option<u32>)> {
    let mut payload = vec![MaybeUninit::<u8>::uninit(); RECORD_LEN];
    let mut ancillary = vec![MaybeUninit::<u8>::uninit(); 128];

    let mut iov = libc::iovec {
        iov_base: payload.as_mut_ptr() as *mut libc::c_void,
        iov_len: RECORD_LEN,
    };
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = ancillary.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = 128;

    let n = unsafe { libc::recvmsg(fd, &mut msg, 0) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }

    let mut uid = None;
    let mut cmsg = unsafe { libc::CMSG_FIRSTHDR(&msg) };
    while !cmsg.is_null() {
        let hdr = unsafe { &*cmsg };
        if hdr.cmsg_level == libc::SOL_SOCKET && hdr.cmsg_type == libc::SCM_CREDENTIALS {
            let creds = unsafe { &*(libc::CMSG_DATA(cmsg) as *const libc::ucred) };
            uid = Some(creds.uid);
        }
        cmsg = unsafe { libc::CMSG_NXTHDR(&msg, cmsg) };
    }

    let bytes: Vec<u8> = payload[..n as usize]
        .iter()
        .map(|b| unsafe { b.assume_init() })
        .collect();
    Ok((bytes, uid))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(msg_type: u32, intval: i32, s: &str) -> Vec<u8> {
        let mut buf = Vec::with_capacity(RECORD_LEN);
        buf.extend_from_slice(&CONTROL_MAGIC.to_ne_bytes());
        buf.extend_from_slice(&msg_type.to_ne_bytes());
        buf.extend_from_slice(&intval.to_ne_bytes());
        let mut strbuf = [0u8; 256];
        let bytes = s.as_bytes();
        strbuf[..bytes.len()].copy_from_slice(bytes);
        buf.extend_from_slice(&strbuf);
        buf
    }

    #[test]
    fn parses_each_known_type() {
        assert_eq!(parse_record(&record(7, 0, "")).unwrap(), ControlMessage::Ping);
        assert_eq!(parse_record(&record(8, 0, "")).unwrap(), ControlMessage::Exit);
        assert_eq!(
            parse_record(&record(1, 3, "")).unwrap(),
            ControlMessage::SetLogLevel(3)
        );
        assert_eq!(
            parse_record(&record(5, 0, "FOO=bar")).unwrap(),
            ControlMessage::SetEnv("FOO=bar".to_string())
        );
    }

    #[test]
    fn unknown_type_is_tagged_unknown() {
        assert_eq!(parse_record(&record(99, 0, "")).unwrap(), ControlMessage::Unknown(99));
    }

    #[test]
    fn rejects_bad_magic() {
        let mut buf = record(7, 0, "");
        buf[0] = 0;
        assert!(matches!(parse_record(&buf), Err(ControlError::BadMagic(_))));
    }

    #[test]
    fn rejects_wrong_length() {
        assert!(matches!(parse_record(&[0u8; 4]), Err(ControlError::WrongLength(4))));
    }
}
