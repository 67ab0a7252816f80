//! Background reception loop.
//!
//! One per active transport: wait for inbound readiness, raise the guest
//! notification, then block until the guest acknowledges. The acknowledge
//! gate keeps at most one notification outstanding, so the guest-side
//! dispatch state is never re-entered concurrently with itself.

use std::os::unix::io::BorrowedFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use tracing::{debug, warn};

use crate::error::BridgeError;
use crate::guest::GuestNotifier;
use crate::transport::Transport;

/// Bound on every blocking wait; doubles as the cancellation latency
/// ceiling.
const WAIT_INTERVAL: Duration = Duration::from_millis(20);

/// Capacity-1 acknowledge gate between the guest context and the loop.
pub(crate) fn ack_gate() -> (Sender<()>, Receiver<()>) {
    bounded(1)
}

/// Handle to a running reception loop.
pub(crate) struct ReceptionHandle {
    thread: Option<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
}

impl ReceptionHandle {
    /// Signal the loop to stop. It unblocks within one wait interval.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Wait for the loop to finish.
    pub fn join(&mut self) {
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ReceptionHandle {
    fn drop(&mut self) {
        self.stop();
        self.join();
    }
}

pub(crate) fn spawn(
    transport: Arc<dyn Transport>,
    notifier: Arc<dyn GuestNotifier>,
    ack: Receiver<()>,
) -> Result<ReceptionHandle, BridgeError> {
    let stop = Arc::new(AtomicBool::new(false));
    let stop_flag = stop.clone();

    let thread = thread::Builder::new()
        .name("ether-rx".to_string())
        .spawn(move || run(transport, notifier, ack, stop_flag))
        .map_err(|e| BridgeError::ThreadStart("reception", e))?;

    Ok(ReceptionHandle {
        thread: Some(thread),
        stop,
    })
}

fn run(
    transport: Arc<dyn Transport>,
    notifier: Arc<dyn GuestNotifier>,
    ack: Receiver<()>,
    stop: Arc<AtomicBool>,
) {
    let fd = transport.recv_fd();
    debug!(kind = %transport.kind(), "Reception loop started");

    while !stop.load(Ordering::Relaxed) {
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        let mut fds = [PollFd::new(borrowed, PollFlags::POLLIN)];
        match poll(&mut fds, PollTimeout::from(WAIT_INTERVAL.as_millis() as u16)) {
            Ok(0) => continue,
            Err(Errno::EINTR) => continue,
            Err(e) => {
                warn!(kind = %transport.kind(), error = %e, "Reception poll failed");
                break;
            }
            Ok(_) => {}
        }

        let revents = fds[0].revents().unwrap_or_else(PollFlags::empty);
        if !revents.contains(PollFlags::POLLIN) {
            warn!(kind = %transport.kind(), ?revents, "Receive descriptor gone");
            break;
        }

        notifier.raise_interrupt();

        // Single notification in flight: wait for the acknowledge before
        // watching the descriptor again
        loop {
            match ack.recv_timeout(WAIT_INTERVAL) {
                Ok(()) => break,
                Err(RecvTimeoutError::Timeout) => {
                    if stop.load(Ordering::Relaxed) {
                        return;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => return,
            }
        }
    }

    debug!(kind = %transport.kind(), "Reception loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransmitError;
    use crate::transport::{
        HardwareAddress, ReadOutcome, TransportKind, read_fd, set_nonblocking,
    };
    use nix::libc;
    use std::io;
    use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    /// Transport over a local pipe: the test writes the host side.
    struct PipeTransport {
        rx: OwnedFd,
    }

    fn pipe_transport() -> (PipeTransport, OwnedFd) {
        let mut fds = [0 as libc::c_int; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let (rx, tx) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
        set_nonblocking(rx.as_raw_fd()).unwrap();
        (PipeTransport { rx }, tx)
    }

    impl Transport for PipeTransport {
        fn kind(&self) -> TransportKind {
            TransportKind::RawDevice
        }

        fn hardware_address(&self) -> HardwareAddress {
            HardwareAddress::default()
        }

        fn recv_fd(&self) -> RawFd {
            self.rx.as_raw_fd()
        }

        fn transmit(&self, _frame: &[u8]) -> Result<(), TransmitError> {
            Err(TransmitError)
        }

        fn read_frame(&self, buf: &mut [u8]) -> io::Result<ReadOutcome> {
            match read_fd(self.rx.as_raw_fd(), buf) {
                Ok(n) => Ok(ReadOutcome::Frame(n)),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(ReadOutcome::Empty),
                Err(e) => Err(e),
            }
        }
    }

    struct CountingNotifier(AtomicUsize);

    impl GuestNotifier for CountingNotifier {
        fn raise_interrupt(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn wait_for_count(notifier: &CountingNotifier, expected: usize) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if notifier.0.load(Ordering::SeqCst) >= expected {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_single_notification_until_acknowledged() {
        let (transport, tx) = pipe_transport();
        let transport: Arc<dyn Transport> = Arc::new(transport);
        let notifier = Arc::new(CountingNotifier(AtomicUsize::new(0)));
        let (ack_tx, ack_rx) = ack_gate();

        let handle = spawn(transport.clone(), notifier.clone(), ack_rx).unwrap();

        // First write raises exactly one notification
        crate::transport::write_fd(tx.as_raw_fd(), &[1u8; 32]).unwrap();
        assert!(wait_for_count(&notifier, 1));

        // More inbound data must not notify again before the acknowledge
        crate::transport::write_fd(tx.as_raw_fd(), &[2u8; 32]).unwrap();
        thread::sleep(Duration::from_millis(100));
        assert_eq!(notifier.0.load(Ordering::SeqCst), 1);

        // Acknowledge releases the loop; pending data notifies again
        ack_tx.send(()).unwrap();
        assert!(wait_for_count(&notifier, 2));

        handle.stop();
    }

    #[test]
    fn test_stop_unblocks_pending_ack_wait() {
        let (transport, tx) = pipe_transport();
        let transport: Arc<dyn Transport> = Arc::new(transport);
        let notifier = Arc::new(CountingNotifier(AtomicUsize::new(0)));
        let (_ack_tx, ack_rx) = ack_gate();

        let mut handle = spawn(transport, notifier.clone(), ack_rx).unwrap();

        crate::transport::write_fd(tx.as_raw_fd(), &[1u8; 8]).unwrap();
        assert!(wait_for_count(&notifier, 1));

        // Never acknowledge; stop must still terminate the loop promptly
        handle.stop();
        let start = Instant::now();
        handle.join();
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(notifier.0.load(Ordering::SeqCst), 1);
    }
}
