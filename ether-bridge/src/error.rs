//! Bridge-level error types.

use std::io;
use thiserror::Error;

/// Fatal initialization errors. Any of these aborts `init` after the
/// partially acquired resources have been released; the bridge stays down.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Failed to open network device '{0}': {1}")]
    OpenDevice(String, io::Error),

    #[error("Failed to set non-blocking mode: {0}")]
    Nonblocking(io::Error),

    #[error("Failed to read hardware address: {0}")]
    HardwareAddress(io::Error),

    #[error("User-mode NAT engine failed to start (no usable DNS?): {0}")]
    NatInit(io::Error),

    #[error("No NAT engine supplied for the user-mode NAT transport")]
    MissingNatEngine,

    #[error("Failed to create pipe: {0}")]
    Pipe(io::Error),

    #[error("Failed to spawn {0} thread: {1}")]
    ThreadStart(&'static str, io::Error),
}

pub type Result<T> = std::result::Result<T, BridgeError>;

/// A backend write failed. Deliberately a single opaque status: the guest
/// driver model has exactly one "could not send" outcome, so the errno is
/// only logged, never surfaced.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("Failed to transmit frame")]
pub struct TransmitError;

/// A multicast filter update was rejected by the device.
#[derive(Debug, Error)]
#[error("Failed to update multicast filter: {0}")]
pub struct MulticastError(pub io::Error);
