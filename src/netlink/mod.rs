//! Netlink uevent transport: opens `NETLINK_KOBJECT_UEVENT`, reads and
//! writes both wire formats described in [`uevent`].
//!
//! The `udev` crate (already a dependency for the sysfs-scraping
//! collaborator) only exposes a receive-side monitor; sending a
//! freshly-built libudev-format buffer to an arbitrary multicast group
//! needs raw socket control, so this module talks to the kernel directly
//! through `libc`, the way other uevent-handling code in the wild does
//! (e.g. a netlink broadcaster built straight on `libc::socket`/`sendmsg`).

pub mod uevent;

use std::io;
use std::mem::MaybeUninit;
use std::os::fd::{AsRawFd, RawFd};

use anyhow::{bail, Context, Result};
use tokio::io::unix::AsyncFd;

pub use uevent::UEventMessage;

const AF_NETLINK: i32 = libc::AF_NETLINK;
const NETLINK_KOBJECT_UEVENT: i32 = 15;

/// Multicast group a message is sent to or read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Group {
    Kernel = 1,
    Udev = 2,
}

impl Group {
    fn bit(self) -> u32 {
        1 << (self as u32 - 1)
    }
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

/// A netlink uevent socket, readable and writable from async code.
///
/// One instance subscribes to exactly the groups given to [`Self::open`].
/// Group 1 is the kernel-origin channel; group 2 is the "udev"
/// rebroadcast channel. A given daemon typically listens on one and
/// sends on the other.
pub struct NetlinkSocket {
    io: AsyncFd<RawSocket>,
}

impl NetlinkSocket {
    /// Open the socket and subscribe to `groups`. Sets `SO_PASSCRED` so
    /// credential-checking consumers (the control socket analog on the
    /// receive side) can trust the peer.
    pub fn open(groups: &[Group]) -> Result<Self> {
        let fd = unsafe {
            libc::socket(
                AF_NETLINK,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
                NETLINK_KOBJECT_UEVENT,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error()).context("failed to open netlink socket");
        }
        let socket = RawSocket(fd);

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

        let mut groups_mask = 0u32;
        for group in groups {
            groups_mask |= group.bit();
        }

        let mut addr: libc::sockaddr_nl = unsafe { std::mem::zeroed() };
        addr.nl_family = AF_NETLINK as u16;
        addr.nl_groups = groups_mask;
        addr.nl_pid = 0;

        let rc = unsafe {
            libc::bind(
                fd,
                &addr as *const _ as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error()).context("failed to bind netlink socket");
        }

        Ok(Self {
            io: AsyncFd::new(socket)?,
        })
    }

    /// Receive one uevent, decoding whichever wire form it arrived in.
    /// The payload buffer holds at least 2048 bytes of payload, 512
    /// bytes of ancillary data.
    pub async fn recv(&self) -> Result<(UEventMessage, bool)> {
        loop {
            let mut guard = self.io.readable().await?;
            let result = guard.try_io(|inner| recv_datagram(inner.as_raw_fd()));
            match result {
                Ok(Ok(buf)) => {
                    let (msg, needs_bloom) =
                        UEventMessage::decode(&buf).context("failed to decode uevent")?;
                    return Ok((msg, needs_bloom));
                }
                Ok(Err(err)) => return Err(err.into()),
                Err(_would_block) => continue,
            }
        }
    }

    /// Multicast `buf` on `group`. `ECONNREFUSED` (no subscriber on that
    /// group) is not an error.
    pub async fn send(&self, buf: &[u8], group: Group) -> Result<()> {
        loop {
            let mut guard = self.io.writable().await?;
            let result = guard.try_io(|inner| send_datagram(inner.as_raw_fd(), buf, group));
            match result {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(err)) if err.kind() == io::ErrorKind::ConnectionRefused => return Ok(()),
                Ok(Err(err)) => return Err(err.into()),
                Err(_would_block) => continue,
            }
        }
    }
}

fn recv_datagram(fd: RawFd) -> io::Result<Vec<u8>> {
    const PAYLOAD: usize = 2048;
    const ANCILLARY: usize = 512;

    let mut payload = vec![MaybeUninit::<u8>::uninit(); PAYLOAD];
    let mut ancillary = vec![MaybeUninit::<u8>::uninit(); ANCILLARY];

    let mut iov = libc::iovec {
        iov_base: payload.as_mut_ptr() as *mut libc::c_void,
        iov_len: PAYLOAD,
    };
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = ancillary.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = ANCILLARY;

    let n = unsafe { libc::recvmsg(fd, &mut msg, 0) };
    if n < 0 {
        let err = io::Error::last_os_error();
        return if err.kind() == io::ErrorKind::WouldBlock {
            Err(err)
        } else {
            Err(err)
        };
    }

    let bytes: Vec<u8> = payload[..n as usize]
        .iter()
        .map(|b| unsafe { b.assume_init() })
        .collect();
    Ok(bytes)
}

fn send_datagram(fd: RawFd, buf: &[u8], group: Group) -> io::Result<()> {
    let mut addr: libc::sockaddr_nl = unsafe { std::mem::zeroed() };
    addr.nl_family = AF_NETLINK as u16;
    addr.nl_groups = group.bit();
    addr.nl_pid = 0;

    let mut iov = libc::iovec {
        iov_base: buf.as_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };
    let msg = libc::msghdr {
        msg_name: &mut addr as *mut _ as *mut libc::c_void,
        msg_namelen: std::mem::size_of::<libc::sockaddr_nl>() as u32,
        msg_iov: &mut iov,
        msg_iovlen: 1,
        msg_control: std::ptr::null_mut(),
        msg_controllen: 0,
        msg_flags: 0,
    };

    let rc = unsafe { libc::sendmsg(fd, &msg, 0) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Build a [`NetlinkSocket`] listening on the single configured upstream
/// channel (`--kernel-events` selects the raw kernel channel over the
/// udev rebroadcast channel).
pub fn open_upstream(kernel_events: bool) -> Result<NetlinkSocket> {
    let group = if kernel_events { Group::Kernel } else { Group::Udev };
    NetlinkSocket::open(&[group])
}

/// A send-only socket for a container's own udev rebroadcast channel.
pub fn open_rebroadcast() -> Result<NetlinkSocket> {
    NetlinkSocket::open(&[])
}

#[allow(dead_code)]
fn _assert_group_bits() -> Result<()> {
    if Group::Kernel.bit() != 1 || Group::Udev.bit() != 2 {
        bail!("group bit layout drifted from expected values");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_bits_match_expected_values() {
        assert_eq!(Group::Kernel.bit(), 1);
        assert_eq!(Group::Udev.bit(), 2);
    }
}
