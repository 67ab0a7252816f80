//! Seam to the external user-mode NAT engine.
//!
//! The engine itself (address translation, virtual TCP/IP stack) is an
//! external library; this crate only drives its event cycle from the pump
//! loop and moves frames across the two pipes of the NAT transport.

use std::io;
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::time::Duration;

use nix::libc;
use nix::poll::PollFlags;
use tracing::warn;

use crate::redirect::RedirectRule;

/// Write end of the NAT→guest pipe, handed to the engine at `prepare` as
/// the target of its output callback.
pub struct NatSink {
    fd: OwnedFd,
}

impl NatSink {
    pub(crate) fn new(fd: OwnedFd) -> Self {
        Self { fd }
    }

    /// Queue one engine-emitted frame for guest delivery. One write per
    /// frame: pipe writes up to PIPE_BUF keep frame boundaries intact, and
    /// the reception side reads one frame per read.
    pub fn emit(&self, frame: &[u8]) {
        let res = unsafe {
            libc::write(
                self.fd.as_raw_fd(),
                frame.as_ptr() as *const libc::c_void,
                frame.len(),
            )
        };
        if res < 0 {
            warn!(error = %io::Error::last_os_error(), "Dropping NAT output frame");
        }
    }
}

/// One descriptor the engine wants watched during the next wait.
#[derive(Debug)]
pub struct PollEntry {
    pub fd: RawFd,
    pub events: PollFlags,
    pub revents: PollFlags,
}

/// Poll interest set the engine fills each pump cycle; after the wait it is
/// handed back with `revents` populated.
#[derive(Debug, Default)]
pub struct PollSet {
    entries: Vec<PollEntry>,
}

impl PollSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, fd: RawFd, events: PollFlags) {
        self.entries.push(PollEntry {
            fd,
            events,
            revents: PollFlags::empty(),
        });
    }

    /// Readiness observed for `fd` in the last wait, empty if unknown.
    pub fn revents(&self, fd: RawFd) -> PollFlags {
        self.entries
            .iter()
            .find(|e| e.fd == fd)
            .map(|e| e.revents)
            .unwrap_or_else(PollFlags::empty)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn entries(&self) -> &[PollEntry] {
        &self.entries
    }

    pub(crate) fn entries_mut(&mut self) -> &mut [PollEntry] {
        &mut self.entries
    }
}

/// The external user-mode NAT engine. Implementations wrap a real slirp-style
/// library; the bridge never looks inside, it only moves frames and drives
/// the timer/poll cycle.
pub trait NatEngine: Send {
    /// Bring the engine up. Every frame the engine emits toward the guest
    /// goes through `sink`.
    fn prepare(&mut self, sink: NatSink) -> io::Result<()>;

    /// Apply one host forwarding rule. Called after `prepare`, before any
    /// traffic flows.
    fn add_redirect(&mut self, rule: &RedirectRule) -> io::Result<()>;

    /// Process one guest-originated frame.
    fn feed_frame(&mut self, frame: &[u8]);

    /// Contribute the descriptors to watch during the next wait and return
    /// the deadline the engine wants, `None` for the caller's default.
    fn fill_poll_set(&mut self, set: &mut PollSet) -> Option<Duration>;

    /// Consume the readiness results of the last wait. This is where the
    /// engine may emit output frames through its sink.
    fn drain_poll_set(&mut self, set: &PollSet);
}
