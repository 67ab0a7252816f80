//! Bridge lifecycle and the guest-facing operation surface.
//!
//! One owned context object per bridge: transport, dispatch table,
//! background loops and the acknowledge gate. Constructed by `init`,
//! destroyed by `shutdown` (or `Drop`); no ambient singletons.

use std::net::SocketAddrV4;
use std::os::unix::io::OwnedFd;
use std::sync::Arc;

use crossbeam_channel::Sender;
use nix::sys::signal::{SigHandler, Signal, signal};
use tracing::{debug, info};

use crate::config::BridgeConfig;
use crate::error::{BridgeError, MulticastError, Result, TransmitError};
use crate::frame::{HEADER_LEN, MAX_FRAME_LEN, RECV_CAP};
use crate::guest::{GuestNotifier, GuestStack, HandlerRef};
use crate::nat::NatEngine;
use crate::protocol::{ProtocolTable, ProtocolTableError};
use crate::pump::{self, PumpHandle};
use crate::reception::{self, ReceptionHandle};
use crate::redirect::parse_redirects;
use crate::stats::{BridgeStats, StatsSnapshot};
use crate::transport::{
    self, HardwareAddress, RawDevice, ReadOutcome, Transport, TransportKind, UdpTunnel,
};

pub struct EtherBridge {
    transport: Arc<dyn Transport>,
    /// Concrete handle kept only for the tunnel variant (peer lookup).
    tunnel: Option<Arc<UdpTunnel>>,
    protocols: ProtocolTable,
    stats: BridgeStats,
    ack: Sender<()>,
    reception: Option<ReceptionHandle>,
    pump: Option<PumpHandle>,
    down: bool,
}

impl std::fmt::Debug for EtherBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EtherBridge")
            .field("transport", &"<dyn Transport>")
            .field("tunnel", &self.tunnel.is_some())
            .field("protocols", &self.protocols)
            .field("stats", &self.stats)
            .field("reception", &self.reception.is_some())
            .field("pump", &self.pump.is_some())
            .field("down", &self.down)
            .finish()
    }
}

impl EtherBridge {
    /// Bring the bridge up for the configured transport. Returns `Ok(None)`
    /// when no transport is configured; disabled is not an error. On any
    /// failure, everything acquired so far is released before returning.
    pub fn init(
        config: &BridgeConfig,
        notifier: Arc<dyn GuestNotifier>,
        nat_engine: Option<Box<dyn NatEngine>>,
    ) -> Result<Option<EtherBridge>> {
        let Some(kind) = config.transport_kind() else {
            info!("Ethernet bridge disabled (no transport configured)");
            return Ok(None);
        };

        // Broken-pipe writes must come back as EPIPE, not kill the process
        ignore_sigpipe();

        let mut pump_parts = None;
        let transport: Arc<dyn Transport> = match kind {
            TransportKind::UserModeNat => {
                let engine = nat_engine.ok_or(BridgeError::MissingNatEngine)?;
                let rules = parse_redirects(&config.redirects);
                let (transport, parts) = transport::nat::open(engine, &rules)?;
                pump_parts = Some(parts);
                Arc::new(transport)
            }
            _ => {
                let path = config.device_path().ok_or_else(|| {
                    BridgeError::OpenDevice(
                        String::new(),
                        std::io::Error::from(std::io::ErrorKind::InvalidInput),
                    )
                })?;
                Arc::new(RawDevice::open(&path)?)
            }
        };

        let mut bridge = Self::assemble(transport, notifier)?;

        if let Some(parts) = pump_parts {
            match pump::spawn(parts) {
                Ok(handle) => bridge.pump = Some(handle),
                Err(e) => {
                    bridge.shutdown();
                    return Err(e);
                }
            }
        }

        info!(
            kind = %bridge.transport.kind(),
            hwaddr = %bridge.transport.hardware_address(),
            "Ethernet bridge up"
        );
        Ok(Some(bridge))
    }

    /// Bring up a UDP-tunnel bridge around an externally supplied,
    /// already-open socket. The socket's tunnel endpoint is the embedder's
    /// business; this only starts reception over it.
    pub fn start_udp_tunnel(
        socket: OwnedFd,
        notifier: Arc<dyn GuestNotifier>,
    ) -> Result<EtherBridge> {
        let tunnel = Arc::new(UdpTunnel::new(socket)?);
        let transport: Arc<dyn Transport> = tunnel.clone();
        let mut bridge = Self::assemble(transport, notifier)?;
        bridge.tunnel = Some(tunnel);
        info!("Ethernet bridge up (UDP tunnel)");
        Ok(bridge)
    }

    /// Common tail of every init path: wire the acknowledge gate and start
    /// the reception loop. Failure releases the transport via RAII.
    fn assemble(
        transport: Arc<dyn Transport>,
        notifier: Arc<dyn GuestNotifier>,
    ) -> Result<EtherBridge> {
        let (ack_tx, ack_rx) = reception::ack_gate();
        let reception = reception::spawn(transport.clone(), notifier, ack_rx)?;
        Ok(EtherBridge {
            transport,
            tunnel: None,
            protocols: ProtocolTable::new(),
            stats: BridgeStats::default(),
            ack: ack_tx,
            reception: Some(reception),
            pump: None,
            down: false,
        })
    }

    /// Source address of the most recently received tunnel frame, for reply
    /// routing. `None` for non-tunnel transports or before any frame.
    pub fn last_tunnel_peer(&self) -> Option<SocketAddrV4> {
        self.tunnel.as_ref().and_then(|t| t.last_peer())
    }

    pub fn kind(&self) -> TransportKind {
        self.transport.kind()
    }

    pub fn hardware_address(&self) -> HardwareAddress {
        self.transport.hardware_address()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Register a guest handler for a protocol type.
    pub fn attach_handler(
        &mut self,
        protocol: u16,
        handler: HandlerRef,
    ) -> std::result::Result<(), ProtocolTableError> {
        self.protocols.attach(protocol, handler)
    }

    pub fn detach_handler(&mut self, protocol: u16) -> std::result::Result<(), ProtocolTableError> {
        self.protocols.detach(protocol)
    }

    /// Forget every attached handler (guest network stack restart). Safe to
    /// call repeatedly; the transport and loops keep running.
    pub fn reset(&mut self) {
        self.protocols.reset();
    }

    /// Send one guest frame to the host side. Structurally invalid frames
    /// are dropped, not errors; a backend refusal is the single generic
    /// transmission-failure status.
    pub fn transmit(&self, frame: &[u8]) -> std::result::Result<(), TransmitError> {
        if frame.len() < HEADER_LEN || frame.len() > MAX_FRAME_LEN {
            debug!(len = frame.len(), "Dropping invalid guest frame");
            self.stats.record_tx_dropped();
            return Ok(());
        }
        match self.transport.transmit(frame) {
            Ok(()) => {
                self.stats.record_tx();
                Ok(())
            }
            Err(e) => {
                self.stats.record_tx_dropped();
                Err(e)
            }
        }
    }

    pub fn add_multicast(&self, addr: &[u8; 6]) -> std::result::Result<(), MulticastError> {
        self.transport.add_multicast(addr)
    }

    pub fn remove_multicast(&self, addr: &[u8; 6]) -> std::result::Result<(), MulticastError> {
        self.transport.remove_multicast(addr)
    }

    /// Guest-side interrupt service. Drains every complete frame available
    /// right now, dispatching each, then signals the acknowledge gate
    /// exactly once, also when zero frames were available; otherwise the
    /// reception loop would wait forever.
    pub fn service_interrupt(&mut self, guest: &mut dyn GuestStack) {
        self.stats.record_interrupt();
        let mut buf = [0u8; RECV_CAP];
        loop {
            match self.transport.read_frame(&mut buf) {
                Ok(ReadOutcome::Frame(len)) if len >= HEADER_LEN => {
                    if self.protocols.dispatch(&buf[..len], guest) {
                        self.stats.record_rx();
                    }
                }
                // A short read means no more complete frames right now
                Ok(ReadOutcome::Frame(_)) | Ok(ReadOutcome::Empty) => break,
                Err(e) => {
                    debug!(error = %e, "Receive failed during interrupt service");
                    break;
                }
            }
        }
        let _ = self.ack.try_send(());
    }

    /// Cancel and join the background loops, then release the transport.
    /// Idempotent, and safe after a partially failed init.
    pub fn shutdown(&mut self) {
        if self.down {
            return;
        }
        self.down = true;

        if let Some(mut handle) = self.reception.take() {
            handle.stop();
            handle.join();
        }
        if let Some(mut handle) = self.pump.take() {
            handle.stop();
            handle.join();
        }
        self.protocols.reset();

        let stats = self.stats.snapshot();
        info!(
            tx = stats.tx_frames,
            tx_dropped = stats.tx_dropped,
            rx = stats.rx_frames,
            interrupts = stats.interrupts,
            "Ethernet bridge down"
        );
        // Transport descriptors close when the loops' Arc clones are gone
    }
}

impl Drop for EtherBridge {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn ignore_sigpipe() {
    unsafe {
        let _ = signal(Signal::SIGPIPE, SigHandler::SigIgn);
    }
}
