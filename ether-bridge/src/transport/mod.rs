//! Transport backends bridging guest frames to host networking.
//!
//! Three interchangeable variants: a raw host device, a UDP tunnel over an
//! externally supplied socket, and the user-mode NAT engine. Callers hold
//! only the [`Transport`] abstraction.

pub(crate) mod nat;
mod raw;
mod udp;

use std::fmt;
use std::io;
use std::os::unix::io::{BorrowedFd, RawFd};

use nix::fcntl::{FcntlArg, OFlag, fcntl};
use nix::libc;

use crate::error::{MulticastError, TransmitError};

pub use nat::UserModeNat;
pub use raw::RawDevice;
pub use udp::UdpTunnel;

/// Transport variant, selected once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    RawDevice,
    UdpTunnel,
    UserModeNat,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportKind::RawDevice => "raw-device",
            TransportKind::UdpTunnel => "udp-tunnel",
            TransportKind::UserModeNat => "user-nat",
        };
        f.write_str(name)
    }
}

/// 6-byte link-layer hardware address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HardwareAddress(pub [u8; 6]);

impl fmt::Display for HardwareAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let a = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            a[0], a[1], a[2], a[3], a[4], a[5]
        )
    }
}

/// Synthetic address presented by the user-mode NAT transport.
pub const NAT_HARDWARE_ADDRESS: HardwareAddress =
    HardwareAddress([0x52, 0x54, 0x00, 0x12, 0x34, 0x56]);

/// Result of one non-blocking read attempt.
#[derive(Debug)]
pub enum ReadOutcome {
    /// One frame of the given length landed in the buffer.
    Frame(usize),
    /// Nothing available right now.
    Empty,
}

/// One open transport channel. Methods take `&self`: the receive descriptor
/// is shared between the reception loop (poll only) and the guest context
/// (read/transmit), which never overlap on the same operation.
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    fn hardware_address(&self) -> HardwareAddress;

    /// Descriptor the reception loop polls for inbound readiness.
    fn recv_fd(&self) -> RawFd;

    /// Send one guest frame to the host side.
    fn transmit(&self, frame: &[u8]) -> Result<(), TransmitError>;

    /// Non-blocking read of one inbound frame into `buf`.
    fn read_frame(&self, buf: &mut [u8]) -> io::Result<ReadOutcome>;

    fn add_multicast(&self, addr: &[u8; 6]) -> Result<(), MulticastError> {
        let _ = addr;
        Ok(())
    }

    fn remove_multicast(&self, addr: &[u8; 6]) -> Result<(), MulticastError> {
        let _ = addr;
        Ok(())
    }
}

/// Switch a descriptor to non-blocking mode.
pub(crate) fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let borrowed_fd = unsafe { BorrowedFd::borrow_raw(fd) };
    let flags = fcntl(borrowed_fd, FcntlArg::F_GETFL).map_err(io::Error::from)?;
    let new_flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(borrowed_fd, FcntlArg::F_SETFL(new_flags)).map_err(io::Error::from)?;
    Ok(())
}

/// `read(2)` with EINTR retry.
pub(crate) fn read_fd(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        let res = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if res >= 0 {
            return Ok(res as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// `write(2)` with EINTR retry.
pub(crate) fn write_fd(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    loop {
        let res = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
        if res >= 0 {
            return Ok(res as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}
