//! User-mode NAT transport.
//!
//! No host descriptor is involved on the guest side: frames move over two
//! pipes. The NAT→guest pipe carries engine output (one raw frame per
//! write) and doubles as the reception loop's poll target; the guest→NAT
//! pipe carries length-prefixed guest frames into the pump thread. The two
//! loops share nothing but these pipes.

use std::io::{self, IoSlice};
use std::os::unix::io::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use nix::libc;
use nix::sys::uio::writev;
use tracing::{debug, info, warn};

use crate::error::{BridgeError, TransmitError};
use crate::frame::RECV_CAP;
use crate::nat::{NatEngine, NatSink};
use crate::redirect::RedirectRule;

use super::{
    HardwareAddress, NAT_HARDWARE_ADDRESS, ReadOutcome, Transport, TransportKind, read_fd,
    set_nonblocking,
};

#[derive(Debug)]
pub struct UserModeNat {
    /// NAT→guest pipe, read end (non-blocking).
    output_rx: OwnedFd,
    /// Guest→NAT pipe, write end.
    input_tx: OwnedFd,
}

/// Pieces the pump thread takes over: the prepared engine and the read end
/// of the guest→NAT pipe.
pub(crate) struct NatPumpParts {
    pub engine: Box<dyn NatEngine>,
    pub input_rx: OwnedFd,
}

impl std::fmt::Debug for NatPumpParts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NatPumpParts")
            .field("engine", &"<dyn NatEngine>")
            .field("input_rx", &self.input_rx)
            .finish()
    }
}

/// Bring the NAT side up: prepare the engine, wire the two pipes and apply
/// the forwarding rules. On any failure the pipes close on the way out.
pub(crate) fn open(
    mut engine: Box<dyn NatEngine>,
    redirects: &[RedirectRule],
) -> Result<(UserModeNat, NatPumpParts), BridgeError> {
    let (output_rx, output_tx) = make_pipe()?;
    let (input_rx, input_tx) = make_pipe()?;

    set_nonblocking(output_rx.as_raw_fd()).map_err(BridgeError::Nonblocking)?;

    engine
        .prepare(NatSink::new(output_tx))
        .map_err(BridgeError::NatInit)?;

    for rule in redirects {
        if let Err(e) = engine.add_redirect(rule) {
            warn!(rule = ?rule, error = %e, "Could not set up host forwarding rule");
        }
    }

    info!(redirects = redirects.len(), "User-mode NAT transport ready");
    Ok((
        UserModeNat {
            output_rx,
            input_tx,
        },
        NatPumpParts { engine, input_rx },
    ))
}

fn make_pipe() -> Result<(OwnedFd, OwnedFd), BridgeError> {
    let mut fds = [0 as libc::c_int; 2];
    let ret = unsafe { libc::pipe(fds.as_mut_ptr()) };
    if ret < 0 {
        return Err(BridgeError::Pipe(io::Error::last_os_error()));
    }
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

impl Transport for UserModeNat {
    fn kind(&self) -> TransportKind {
        TransportKind::UserModeNat
    }

    fn hardware_address(&self) -> HardwareAddress {
        NAT_HARDWARE_ADDRESS
    }

    fn recv_fd(&self) -> RawFd {
        self.output_rx.as_raw_fd()
    }

    /// Hand a guest frame to the pump thread: native-endian length prefix
    /// plus payload in a single gathered write, so the pump always finds a
    /// complete record.
    fn transmit(&self, frame: &[u8]) -> Result<(), TransmitError> {
        let len_bytes = (frame.len() as u32).to_ne_bytes();
        let iov = [IoSlice::new(&len_bytes), IoSlice::new(frame)];
        let fd = unsafe { BorrowedFd::borrow_raw(self.input_tx.as_raw_fd()) };
        match writev(fd, &iov).map_err(io::Error::from) {
            Ok(n) if n == len_bytes.len() + frame.len() => Ok(()),
            Ok(n) => {
                debug!(written = n, len = frame.len(), "Short write on NAT input pipe");
                Err(TransmitError)
            }
            Err(e) => {
                debug!(error = %e, "Couldn't queue frame for NAT engine");
                Err(TransmitError)
            }
        }
    }

    fn read_frame(&self, buf: &mut [u8]) -> io::Result<ReadOutcome> {
        let cap = buf.len().min(RECV_CAP);
        match read_fd(self.output_rx.as_raw_fd(), &mut buf[..cap]) {
            Ok(n) => Ok(ReadOutcome::Frame(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(ReadOutcome::Empty),
            Err(e) => Err(e),
        }
    }
}
