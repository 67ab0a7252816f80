//! Bridge traffic counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Lifetime counters for one bridge instance. Written from the guest
/// context, readable at any time; logged once at shutdown.
#[derive(Debug, Default)]
pub struct BridgeStats {
    tx_frames: AtomicU64,
    tx_dropped: AtomicU64,
    rx_frames: AtomicU64,
    interrupts: AtomicU64,
}

impl BridgeStats {
    pub(crate) fn record_tx(&self) {
        self.tx_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_tx_dropped(&self) {
        self.tx_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rx(&self) {
        self.rx_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_interrupt(&self) {
        self.interrupts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            tx_frames: self.tx_frames.load(Ordering::Relaxed),
            tx_dropped: self.tx_dropped.load(Ordering::Relaxed),
            rx_frames: self.rx_frames.load(Ordering::Relaxed),
            interrupts: self.interrupts.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    /// Frames handed to the transport.
    pub tx_frames: u64,
    /// Frames refused by the transport or dropped as invalid.
    pub tx_dropped: u64,
    /// Frames delivered to a guest protocol handler.
    pub rx_frames: u64,
    /// Interrupt service invocations.
    pub interrupts: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let stats = BridgeStats::default();
        stats.record_tx();
        stats.record_tx();
        stats.record_tx_dropped();
        stats.record_rx();
        stats.record_interrupt();

        let snap = stats.snapshot();
        assert_eq!(snap.tx_frames, 2);
        assert_eq!(snap.tx_dropped, 1);
        assert_eq!(snap.rx_frames, 1);
        assert_eq!(snap.interrupts, 1);
    }
}
