//! Guest Ethernet bridge.
//!
//! Bridges a virtualized network interface with real host networking: raw
//! link-layer frames from the guest go out through one of three
//! interchangeable transports (raw host device, UDP tunnel, user-mode NAT),
//! and inbound frames come back through a per-transport reception loop, a
//! notification/acknowledge rendezvous with the guest and a protocol
//! dispatch table keyed by the frame's type/length field.
//!
//! Guest memory, guest code execution and the NAT engine's protocol stack
//! are external collaborators, reached only through the traits in
//! [`guest`] and [`nat`].

pub mod bridge;
pub mod config;
pub mod error;
pub mod frame;
pub mod guest;
pub mod nat;
pub mod protocol;
mod pump;
mod reception;
pub mod redirect;
pub mod stats;
pub mod transport;

pub use bridge::EtherBridge;
pub use config::{BridgeConfig, NAT_TRANSPORT_NAME};
pub use error::{BridgeError, MulticastError, TransmitError};
pub use guest::{GuestNotifier, GuestStack, HandlerCall, HandlerRef, PacketReader};
pub use nat::{NatEngine, NatSink, PollSet};
pub use protocol::{ProtocolTable, ProtocolTableError};
pub use redirect::{RedirectProto, RedirectRule};
pub use stats::StatsSnapshot;
pub use transport::{HardwareAddress, TransportKind};
