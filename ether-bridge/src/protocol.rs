//! Protocol-handler dispatch table.
//!
//! Maps a frame's type/length field to the guest handler registered for it.
//! All operations run on the single guest-processing context (the consumer
//! of the reception notification), so the table needs no locking.

use std::collections::HashMap;

use thiserror::Error;
use tracing::trace;

use crate::frame::{self, HEADER_LEN};
use crate::guest::{GuestStack, HandlerCall, HandlerRef, PacketReader};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolTableError {
    #[error("Protocol type {0:#06x} is already attached")]
    DuplicateProtocol(u16),

    #[error("Protocol type {0:#06x} is not attached")]
    UnknownProtocol(u16),
}

#[derive(Debug, Default)]
pub struct ProtocolTable {
    handlers: HashMap<u16, HandlerRef>,
}

impl ProtocolTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for `protocol`. At most one entry per type.
    pub fn attach(&mut self, protocol: u16, handler: HandlerRef) -> Result<(), ProtocolTableError> {
        if self.handlers.contains_key(&protocol) {
            return Err(ProtocolTableError::DuplicateProtocol(protocol));
        }
        self.handlers.insert(protocol, handler);
        Ok(())
    }

    pub fn detach(&mut self, protocol: u16) -> Result<(), ProtocolTableError> {
        if self.handlers.remove(&protocol).is_none() {
            return Err(ProtocolTableError::UnknownProtocol(protocol));
        }
        Ok(())
    }

    /// Clear every entry. Invoked on a full bridge reset (guest network
    /// stack restart); safe to call repeatedly.
    pub fn reset(&mut self) {
        self.handlers.clear();
    }

    /// Route one inbound frame to its handler. Frames without a matching
    /// entry are expected traffic for unregistered protocols and are
    /// silently dropped. Returns whether a handler was invoked.
    pub fn dispatch(&self, frame: &[u8], guest: &mut dyn GuestStack) -> bool {
        let Some(protocol) = frame::type_field(frame) else {
            trace!(len = frame.len(), "Dropping truncated frame");
            return false;
        };

        let bucket = frame::dispatch_bucket(protocol);
        let Some(&handler) = self.handlers.get(&bucket) else {
            trace!(protocol, "No handler attached, dropping frame");
            return false;
        };
        if handler.is_null() {
            return false;
        }

        guest.invoke_handler(
            handler,
            HandlerCall {
                protocol,
                header: &frame[..HEADER_LEN],
                reader: PacketReader::new(&frame[HEADER_LEN..]),
            },
        );
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Records every handler invocation with its fully read-out payload.
    #[derive(Default)]
    struct RecordingStack {
        calls: Vec<(HandlerRef, u16, Vec<u8>, Vec<u8>)>,
    }

    impl GuestStack for RecordingStack {
        fn invoke_handler(&mut self, handler: HandlerRef, mut call: HandlerCall<'_>) {
            let first = call.reader.read(4).to_vec();
            let rest = call.reader.read_rest().to_vec();
            self.calls.push((handler, call.protocol, first, rest));
        }
    }

    fn frame_with_type(type_field: u16, payload_len: usize) -> Vec<u8> {
        let mut frame = vec![0u8; HEADER_LEN + payload_len];
        frame[12..14].copy_from_slice(&type_field.to_be_bytes());
        for (i, byte) in frame[HEADER_LEN..].iter_mut().enumerate() {
            *byte = i as u8;
        }
        frame
    }

    #[test]
    fn test_attach_detach_cycle() {
        let mut table = ProtocolTable::new();
        table.attach(0x0800, HandlerRef(1)).unwrap();
        assert_eq!(
            table.attach(0x0800, HandlerRef(2)),
            Err(ProtocolTableError::DuplicateProtocol(0x0800))
        );
        table.detach(0x0800).unwrap();
        assert_eq!(
            table.detach(0x0800),
            Err(ProtocolTableError::UnknownProtocol(0x0800))
        );
        table.attach(0x0800, HandlerRef(3)).unwrap();
    }

    #[test]
    fn test_dispatch_by_type() {
        let mut table = ProtocolTable::new();
        let mut guest = RecordingStack::default();
        table.attach(0x0800, HandlerRef(1)).unwrap();

        assert!(table.dispatch(&frame_with_type(0x0800, 10), &mut guest));
        assert!(!table.dispatch(&frame_with_type(0x0806, 10), &mut guest));

        assert_eq!(guest.calls.len(), 1);
        let (handler, protocol, first, rest) = &guest.calls[0];
        assert_eq!(*handler, HandlerRef(1));
        assert_eq!(*protocol, 0x0800);
        assert_eq!(first, &[0, 1, 2, 3]);
        assert_eq!(rest, &[4, 5, 6, 7, 8, 9]);
    }

    #[test]
    fn test_length_field_frames_use_bucket_zero() {
        let mut table = ProtocolTable::new();
        let mut guest = RecordingStack::default();
        table.attach(0, HandlerRef(9)).unwrap();
        table.attach(1501, HandlerRef(2)).unwrap();

        // 1500 is still a length field, 1501 is a real type
        assert!(table.dispatch(&frame_with_type(1500, 8), &mut guest));
        assert!(table.dispatch(&frame_with_type(1501, 8), &mut guest));

        assert_eq!(guest.calls[0].0, HandlerRef(9));
        assert_eq!(guest.calls[0].1, 1500);
        assert_eq!(guest.calls[1].0, HandlerRef(2));
    }

    #[test]
    fn test_short_frame_never_dispatches() {
        let mut table = ProtocolTable::new();
        let mut guest = RecordingStack::default();
        table.attach(0, HandlerRef(1)).unwrap();

        assert!(!table.dispatch(&[0u8; 13], &mut guest));
        assert!(guest.calls.is_empty());
    }

    #[test]
    fn test_null_handler_drops_frame() {
        let mut table = ProtocolTable::new();
        let mut guest = RecordingStack::default();
        table.attach(0x0800, HandlerRef(0)).unwrap();

        assert!(!table.dispatch(&frame_with_type(0x0800, 4), &mut guest));
        assert!(guest.calls.is_empty());
    }

    #[test]
    fn test_reset_clears_table() {
        let mut table = ProtocolTable::new();
        let mut guest = RecordingStack::default();
        table.attach(0x0800, HandlerRef(1)).unwrap();
        table.reset();
        table.reset();

        assert!(!table.dispatch(&frame_with_type(0x0800, 4), &mut guest));
        table.attach(0x0800, HandlerRef(1)).unwrap();
    }
}
