//! NAT pump loop.
//!
//! Drives the user-mode NAT engine's timer/poll cycle and feeds queued
//! guest frames into it. Runs alongside the NAT reception loop; the two
//! communicate only through the transport's pipes.

use std::io;
use std::os::unix::io::{AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use tracing::{debug, warn};

use crate::error::BridgeError;
use crate::frame::MAX_FRAME_LEN;
use crate::nat::{NatEngine, PollSet};
use crate::transport::nat::NatPumpParts;
use crate::transport::read_fd;

/// Cap on the engine wait, whatever deadline it asks for; bounds both timer
/// resolution and cancellation latency.
const MAX_WAIT: Duration = Duration::from_millis(10);

/// Handle to a running pump loop.
pub(crate) struct PumpHandle {
    thread: Option<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
}

impl PumpHandle {
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn join(&mut self) {
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for PumpHandle {
    fn drop(&mut self) {
        self.stop();
        self.join();
    }
}

pub(crate) fn spawn(parts: NatPumpParts) -> Result<PumpHandle, BridgeError> {
    let stop = Arc::new(AtomicBool::new(false));
    let stop_flag = stop.clone();

    let thread = thread::Builder::new()
        .name("ether-natpump".to_string())
        .spawn(move || run(parts.engine, parts.input_rx, stop_flag))
        .map_err(|e| BridgeError::ThreadStart("NAT pump", e))?;

    Ok(PumpHandle {
        thread: Some(thread),
        stop,
    })
}

fn run(mut engine: Box<dyn NatEngine>, input_rx: OwnedFd, stop: Arc<AtomicBool>) {
    let in_fd = input_rx.as_raw_fd();
    let mut frame = [0u8; MAX_FRAME_LEN];
    debug!("NAT pump started");

    while !stop.load(Ordering::Relaxed) {
        // Queued guest frame? Zero-timeout check, then a blocking read of
        // the complete record (transmit writes it in one gathered write).
        if poll_readable(in_fd) {
            match feed_one(in_fd, &mut frame, engine.as_mut()) {
                Ok(()) => {}
                Err(e) => {
                    if !stop.load(Ordering::Relaxed) {
                        warn!(error = %e, "Guest frame pipe broken");
                    }
                    break;
                }
            }
        }

        // Engine event cycle: collect its poll set and deadline, wait,
        // hand back the results
        let mut set = PollSet::new();
        let deadline = engine.fill_poll_set(&mut set);
        let wait = deadline.unwrap_or(MAX_WAIT).min(MAX_WAIT);

        let mut fds: Vec<PollFd> = set
            .entries()
            .iter()
            .map(|e| PollFd::new(unsafe { BorrowedFd::borrow_raw(e.fd) }, e.events))
            .collect();
        match poll(&mut fds, PollTimeout::from(wait.as_millis() as u16)) {
            Ok(_) => {}
            Err(Errno::EINTR) => continue,
            Err(e) => {
                warn!(error = %e, "NAT pump poll failed");
                break;
            }
        }

        for (entry, fd) in set.entries_mut().iter_mut().zip(&fds) {
            entry.revents = fd.revents().unwrap_or_else(PollFlags::empty);
        }
        engine.drain_poll_set(&set);
    }

    debug!("NAT pump stopped");
}

fn poll_readable(fd: RawFd) -> bool {
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    let mut fds = [PollFd::new(borrowed, PollFlags::POLLIN)];
    match poll(&mut fds, PollTimeout::from(0u16)) {
        Ok(n) if n > 0 => fds[0]
            .revents()
            .unwrap_or_else(PollFlags::empty)
            .contains(PollFlags::POLLIN),
        _ => false,
    }
}

/// Read one length-prefixed guest frame and feed it into the engine.
fn feed_one(fd: RawFd, buf: &mut [u8], engine: &mut dyn NatEngine) -> io::Result<()> {
    let mut len_bytes = [0u8; 4];
    read_exact_fd(fd, &mut len_bytes)?;
    let len = u32::from_ne_bytes(len_bytes) as usize;
    if len > buf.len() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("oversized frame ({len} bytes) on guest pipe"),
        ));
    }
    read_exact_fd(fd, &mut buf[..len])?;
    engine.feed_frame(&buf[..len]);
    Ok(())
}

fn read_exact_fd(fd: RawFd, buf: &mut [u8]) -> io::Result<()> {
    let mut done = 0;
    while done < buf.len() {
        match read_fd(fd, &mut buf[done..])? {
            0 => return Err(io::ErrorKind::UnexpectedEof.into()),
            n => done += n,
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nat::NatSink;
    use crate::redirect::RedirectRule;
    use crate::transport;
    use std::os::unix::io::FromRawFd;
    use std::sync::Mutex;
    use std::time::Instant;

    /// Engine stub that records fed frames and counts poll cycles.
    struct RecordingEngine {
        fed: Arc<Mutex<Vec<Vec<u8>>>>,
        cycles: Arc<Mutex<usize>>,
    }

    impl NatEngine for RecordingEngine {
        fn prepare(&mut self, _sink: NatSink) -> io::Result<()> {
            Ok(())
        }

        fn add_redirect(&mut self, _rule: &RedirectRule) -> io::Result<()> {
            Ok(())
        }

        fn feed_frame(&mut self, frame: &[u8]) {
            self.fed.lock().unwrap().push(frame.to_vec());
        }

        fn fill_poll_set(&mut self, _set: &mut PollSet) -> Option<Duration> {
            Some(Duration::from_millis(1))
        }

        fn drain_poll_set(&mut self, _set: &PollSet) {
            *self.cycles.lock().unwrap() += 1;
        }
    }

    #[test]
    fn test_pump_feeds_guest_frames_and_cycles_engine() {
        let fed = Arc::new(Mutex::new(Vec::new()));
        let cycles = Arc::new(Mutex::new(0));
        let engine = Box::new(RecordingEngine {
            fed: fed.clone(),
            cycles: cycles.clone(),
        });

        let mut fds = [0 as nix::libc::c_int; 2];
        assert_eq!(unsafe { nix::libc::pipe(fds.as_mut_ptr()) }, 0);
        let (input_rx, input_tx) =
            unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };

        let mut handle = spawn(NatPumpParts { engine, input_rx }).unwrap();

        // Write one length-prefixed record the way the transport does
        let payload = [0x5au8; 42];
        let mut record = (payload.len() as u32).to_ne_bytes().to_vec();
        record.extend_from_slice(&payload);
        transport::write_fd(input_tx.as_raw_fd(), &record).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline && fed.lock().unwrap().is_empty() {
            thread::sleep(Duration::from_millis(5));
        }

        handle.stop();
        handle.join();

        let fed = fed.lock().unwrap();
        assert_eq!(fed.len(), 1);
        assert_eq!(fed[0], payload);
        assert!(*cycles.lock().unwrap() > 0);
    }
}
