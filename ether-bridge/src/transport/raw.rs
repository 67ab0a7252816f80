//! Raw host network device transport.
//!
//! Talks to a bridge-capable character device (tap-style) that speaks whole
//! link-layer frames over read/write and answers the classic interface
//! ioctls directly on the open descriptor: hardware address fetch plus
//! multicast filter add/remove.

use std::fs::OpenOptions;
use std::io;
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::path::Path;

use nix::libc;
use tracing::{debug, info, warn};

use crate::error::{BridgeError, MulticastError, TransmitError};
use crate::frame::RECV_CAP;

use super::{HardwareAddress, ReadOutcome, Transport, TransportKind, read_fd, set_nonblocking, write_fd};

#[derive(Debug)]
pub struct RawDevice {
    fd: OwnedFd,
    hwaddr: HardwareAddress,
}

impl RawDevice {
    /// Open the device node, switch it to non-blocking mode and fetch its
    /// hardware address. Any failure closes what was opened.
    pub fn open(path: &Path) -> Result<Self, BridgeError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| BridgeError::OpenDevice(path.display().to_string(), e))?;
        let fd = OwnedFd::from(file);

        set_nonblocking(fd.as_raw_fd()).map_err(BridgeError::Nonblocking)?;

        let mut addr = [0u8; 6];
        let ret = unsafe {
            libc::ioctl(
                fd.as_raw_fd(),
                libc::SIOCGIFADDR as libc::Ioctl,
                addr.as_mut_ptr(),
            )
        };
        if ret < 0 {
            return Err(BridgeError::HardwareAddress(io::Error::last_os_error()));
        }

        let hwaddr = HardwareAddress(addr);
        info!(path = %path.display(), hwaddr = %hwaddr, "Raw network device opened");
        Ok(Self { fd, hwaddr })
    }

    fn multicast_ioctl(&self, request: libc::Ioctl, addr: &[u8; 6]) -> io::Result<()> {
        let ret = unsafe { libc::ioctl(self.fd.as_raw_fd(), request, addr.as_ptr()) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Transport for RawDevice {
    fn kind(&self) -> TransportKind {
        TransportKind::RawDevice
    }

    fn hardware_address(&self) -> HardwareAddress {
        self.hwaddr
    }

    fn recv_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    fn transmit(&self, frame: &[u8]) -> Result<(), TransmitError> {
        match write_fd(self.fd.as_raw_fd(), frame) {
            Ok(n) if n == frame.len() => Ok(()),
            Ok(n) => {
                debug!(written = n, len = frame.len(), "Short write on device");
                Err(TransmitError)
            }
            Err(e) => {
                debug!(error = %e, "Couldn't transmit frame");
                Err(TransmitError)
            }
        }
    }

    fn read_frame(&self, buf: &mut [u8]) -> io::Result<ReadOutcome> {
        let cap = buf.len().min(RECV_CAP);
        match read_fd(self.fd.as_raw_fd(), &mut buf[..cap]) {
            Ok(n) => Ok(ReadOutcome::Frame(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(ReadOutcome::Empty),
            Err(e) => Err(e),
        }
    }

    fn add_multicast(&self, addr: &[u8; 6]) -> Result<(), MulticastError> {
        match self.multicast_ioctl(libc::SIOCADDMULTI as libc::Ioctl, addr) {
            Ok(()) => Ok(()),
            // Devices that filter in hardware or not at all reject the
            // ioctl but still deliver the traffic
            Err(e)
                if matches!(
                    e.raw_os_error(),
                    Some(libc::ENOTTY) | Some(libc::EOPNOTSUPP)
                ) =>
            {
                warn!(error = %e, "Device does not support multicast filters, continuing");
                Ok(())
            }
            Err(e) => {
                debug!(error = %e, "Couldn't enable multicast address");
                Err(MulticastError(e))
            }
        }
    }

    fn remove_multicast(&self, addr: &[u8; 6]) -> Result<(), MulticastError> {
        self.multicast_ioctl(libc::SIOCDELMULTI as libc::Ioctl, addr)
            .map_err(|e| {
                debug!(error = %e, "Couldn't disable multicast address");
                MulticastError(e)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_missing_device() {
        let err = RawDevice::open(Path::new("/dev/nonexistent-ether0")).unwrap_err();
        assert!(matches!(err, BridgeError::OpenDevice(_, _)));
    }

    #[test]
    fn test_open_non_device_fails_hwaddr_fetch() {
        // A regular file accepts open+fcntl but rejects the address ioctl
        let file = tempfile::NamedTempFile::new().unwrap();
        let err = RawDevice::open(file.path()).unwrap_err();
        assert!(matches!(err, BridgeError::HardwareAddress(_)));
    }
}
