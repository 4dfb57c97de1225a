//! Tunable connection parameters.
//!
//! Defaults follow the classroom reference values (1 KiB segments, 4 KiB
//! receive window, 2 s initial timeout).  The CLI maps its flags onto a
//! [`Config`]; tests build one with struct-update syntax or the `with_*`
//! setters.

use std::time::Duration;

use crate::error::{Error, Result};
use crate::rtt::RttSampling;
use crate::segment::HEADER_LEN;

/// Largest datagram the socket layer will read.
pub const MAX_DATAGRAM: usize = 65_535;

#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum payload bytes per segment.
    pub mss: usize,
    /// Capacity of the local receive buffer; the advertised window is this
    /// minus unread bytes.
    pub recv_window: usize,
    /// Local cap on unacknowledged bytes, applied on top of the peer window.
    pub send_window: usize,

    /// `EstimatedRTT` before the first sample.
    pub initial_rtt: Duration,
    /// `DevRTT` before the first sample.
    pub initial_rtt_dev: Duration,
    /// Retransmission timeout before the first sample.
    pub initial_rto: Duration,
    pub min_rto: Duration,
    pub max_rto: Duration,
    pub rtt_sampling: RttSampling,

    /// SYN / SYN+ACK retransmissions before the handshake is abandoned.
    pub syn_retries: u32,
    /// Consecutive data-phase timeouts tolerated; `None` retries forever.
    pub max_retransmissions: Option<u32>,
    /// Zero-window probe period.
    pub persist_interval: Duration,
    /// TIME_WAIT linger.
    pub time_wait: Duration,
    /// Upper bound on a blocking `close()`.
    pub close_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mss: 1024,
            recv_window: 4096,
            send_window: 65_535,
            initial_rtt: Duration::from_secs(1),
            initial_rtt_dev: Duration::from_millis(500),
            initial_rto: Duration::from_secs(2),
            min_rto: Duration::from_millis(10),
            max_rto: Duration::from_secs(60),
            rtt_sampling: RttSampling::FreshOnly,
            syn_retries: 6,
            max_retransmissions: None,
            persist_interval: Duration::from_millis(200),
            time_wait: Duration::from_secs(1),
            close_timeout: Duration::from_secs(10),
        }
    }
}

impl Config {
    pub fn with_mss(mut self, mss: usize) -> Self {
        self.mss = mss;
        self
    }

    pub fn with_recv_window(mut self, bytes: usize) -> Self {
        self.recv_window = bytes;
        self
    }

    pub fn with_rtt_sampling(mut self, sampling: RttSampling) -> Self {
        self.rtt_sampling = sampling;
        self
    }

    pub fn with_max_retransmissions(mut self, limit: Option<u32>) -> Self {
        self.max_retransmissions = limit;
        self
    }

    /// Start the estimator from `rtt` instead of the one-second default.
    ///
    /// Sets `initial_rtt`, a deviation of half of it, and the matching
    /// initial timeout.  Useful on loopback where real RTTs are microseconds.
    pub fn with_initial_rtt(mut self, rtt: Duration) -> Self {
        self.initial_rtt = rtt;
        self.initial_rtt_dev = rtt / 2;
        self.initial_rto = rtt * 3;
        self
    }

    /// Reject values the engine cannot honour.
    pub fn validate(&self) -> Result<()> {
        if self.mss == 0 {
            return Err(Error::InvalidConfig("mss must be at least 1"));
        }
        if self.mss > MAX_DATAGRAM - HEADER_LEN {
            return Err(Error::InvalidConfig("mss does not fit in one datagram"));
        }
        if self.recv_window == 0 || self.recv_window > usize::from(u16::MAX) {
            return Err(Error::InvalidConfig("recv_window must be in 1..=65535"));
        }
        if self.send_window == 0 {
            return Err(Error::InvalidConfig("send_window must be at least 1"));
        }
        if self.min_rto > self.max_rto {
            return Err(Error::InvalidConfig("min_rto exceeds max_rto"));
        }
        if self.persist_interval.is_zero() {
            return Err(Error::InvalidConfig("persist_interval must be non-zero"));
        }
        Ok(())
    }
}
