//! UDP tunnel transport over an externally supplied socket.
//!
//! The socket is opened (and its tunnel endpoint configured) by the
//! embedder; this transport only owns the descriptor it was handed. Each
//! datagram carries one complete frame. The source address of every
//! received datagram is retained so the embedder can route replies.

use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::sync::Mutex;

use nix::libc;
use tracing::debug;

use crate::error::{BridgeError, TransmitError};
use crate::frame::RECV_CAP;

use super::{HardwareAddress, ReadOutcome, Transport, TransportKind, set_nonblocking, write_fd};

pub struct UdpTunnel {
    fd: OwnedFd,
    peer: Mutex<Option<SocketAddrV4>>,
}

impl UdpTunnel {
    /// Wrap an already-open tunnel socket, taking ownership of it.
    pub fn new(socket: OwnedFd) -> Result<Self, BridgeError> {
        set_nonblocking(socket.as_raw_fd()).map_err(BridgeError::Nonblocking)?;
        Ok(Self {
            fd: socket,
            peer: Mutex::new(None),
        })
    }

    /// Source address of the most recently received frame.
    pub fn last_peer(&self) -> Option<SocketAddrV4> {
        *self.peer.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddrV4)> {
        let mut from: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        let mut from_len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        loop {
            let res = unsafe {
                libc::recvfrom(
                    self.fd.as_raw_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                    0,
                    &mut from as *mut libc::sockaddr_in as *mut libc::sockaddr,
                    &mut from_len,
                )
            };
            if res >= 0 {
                let peer = SocketAddrV4::new(
                    Ipv4Addr::from(u32::from_be(from.sin_addr.s_addr)),
                    u16::from_be(from.sin_port),
                );
                return Ok((res as usize, peer));
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }
}

impl Transport for UdpTunnel {
    fn kind(&self) -> TransportKind {
        TransportKind::UdpTunnel
    }

    /// Not meaningful for a tunnel; the guest sees an all-zero address.
    fn hardware_address(&self) -> HardwareAddress {
        HardwareAddress::default()
    }

    fn recv_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    fn transmit(&self, frame: &[u8]) -> Result<(), TransmitError> {
        match write_fd(self.fd.as_raw_fd(), frame) {
            Ok(n) if n == frame.len() => Ok(()),
            Ok(_) | Err(_) => {
                debug!("Couldn't transmit frame over tunnel");
                Err(TransmitError)
            }
        }
    }

    fn read_frame(&self, buf: &mut [u8]) -> io::Result<ReadOutcome> {
        let cap = buf.len().min(RECV_CAP);
        match self.recv_from(&mut buf[..cap]) {
            Ok((len, peer)) => {
                *self.peer.lock().unwrap_or_else(|e| e.into_inner()) = Some(peer);
                Ok(ReadOutcome::Frame(len))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(ReadOutcome::Empty),
            Err(e) => Err(e),
        }
    }
}
