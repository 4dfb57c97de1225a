//! Per-connection counters.

use std::time::{Duration, Instant};

/// A snapshot of one connection's counters and timing estimates.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Stats {
    /// Segments resent after a timeout.
    pub retransmissions: u64,
    /// First transmissions of payload-bearing segments.
    pub data_segments_sent: u64,
    /// Zero-window probes sent.
    pub window_probes: u64,
    /// Bytes accepted from the application by `send`.
    pub bytes_queued: u64,
    /// Bytes the peer has cumulatively acknowledged.
    pub bytes_acked: u64,
    /// Bytes handed to the application by `recv`.
    pub bytes_received: u64,
    pub corrupt_discards: u64,
    pub out_of_order_discards: u64,
    pub invalid_state_discards: u64,
    pub estimated_rtt: Duration,
    pub dev_rtt: Duration,
    pub timeout_interval: Duration,
    /// Time since the first application `send`.
    pub elapsed: Duration,
    /// `SND.NXT - SND.UNA` at snapshot time.
    pub bytes_in_flight: usize,
    /// Most recently advertised peer window.
    pub peer_window: usize,
}

impl Stats {
    /// Acknowledged payload throughput in megabits per second.
    pub fn throughput_mbps(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }
        (self.bytes_acked as f64 * 8.0) / secs / 1_000_000.0
    }
}

/// Mutable counters kept inside the connection.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub retransmissions: u64,
    pub data_segments_sent: u64,
    pub window_probes: u64,
    pub bytes_queued: u64,
    pub bytes_acked: u64,
    pub bytes_received: u64,
    pub corrupt_discards: u64,
    pub out_of_order_discards: u64,
    pub invalid_state_discards: u64,
    pub started: Option<Instant>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throughput_is_zero_without_elapsed_time() {
        let s = Stats {
            bytes_acked: 1_000_000,
            ..Stats::default()
        };
        assert_eq!(s.throughput_mbps(), 0.0);
    }

    #[test]
    fn throughput_in_megabits() {
        let s = Stats {
            bytes_acked: 1_000_000,
            elapsed: Duration::from_secs(2),
            ..Stats::default()
        };
        assert!((s.throughput_mbps() - 4.0).abs() < 1e-9);
    }
}
