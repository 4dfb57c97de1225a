//! Fault injection for the datagram channel.
//!
//! Real networks drop, corrupt, duplicate and reorder datagrams.  To exercise
//! the reliability mechanisms without depending on actual network conditions,
//! a [`crate::socket::Socket`] can carry a [`Simulator`] that decides the fate
//! of every outbound datagram:
//!
//! | Fault       | Description                                              |
//! |-------------|----------------------------------------------------------|
//! | Loss        | Drop the datagram with probability `loss_rate`.          |
//! | Corruption  | Flip one random bit with probability `corrupt_rate`.     |
//! | Duplication | Deliver a second copy with probability `duplicate_rate`. |
//! | Delay       | Hold each copy for a uniform delay in `delay`; unequal   |
//! |             | delays let later datagrams overtake earlier ones.        |
//!
//! A single bit flip is always caught by the Internet checksum, so corrupted
//! datagrams are guaranteed to be discarded by the receiver rather than
//! delivered as wrong data.
//!
//! The RNG is a seeded [`StdRng`] so a failing run can be replayed.

use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::segment::HEADER_LEN;

/// Configuration for the fault model.
///
/// All probabilities are in the range `[0.0, 1.0]`.
#[derive(Debug, Clone)]
pub struct FaultConfig {
    pub loss_rate: f64,
    pub corrupt_rate: f64,
    pub duplicate_rate: f64,
    /// Per-copy delay range; `None` delivers immediately.
    pub delay: Option<RangeInclusive<Duration>>,
    /// Only datagrams carrying payload are subject to faults; handshake,
    /// pure ACK and FIN segments pass untouched.
    pub data_only: bool,
    /// RNG seed; `None` seeds from entropy.
    pub seed: Option<u64>,
}

impl Default for FaultConfig {
    fn default() -> Self {
        // No faults by default: the simulator is a transparent pass-through.
        Self {
            loss_rate: 0.0,
            corrupt_rate: 0.0,
            duplicate_rate: 0.0,
            delay: None,
            data_only: false,
            seed: None,
        }
    }
}

impl FaultConfig {
    pub fn lossy(loss_rate: f64) -> Self {
        Self {
            loss_rate,
            ..Self::default()
        }
    }

    pub fn corrupting(corrupt_rate: f64) -> Self {
        Self {
            corrupt_rate,
            ..Self::default()
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_delay(mut self, delay: RangeInclusive<Duration>) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_duplicates(mut self, rate: f64) -> Self {
        self.duplicate_rate = rate;
        self
    }
}

/// What to do with one outbound datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fate {
    Drop,
    /// Send `bytes` once per entry in `delays`.
    Deliver { bytes: Vec<u8>, delays: Vec<Duration> },
}

/// Counters for what the simulator has done so far.
#[derive(Debug, Default)]
pub struct FaultCounters {
    pub seen: AtomicU64,
    pub dropped: AtomicU64,
    pub corrupted: AtomicU64,
    pub duplicated: AtomicU64,
}

/// A seeded fault model shared by every send on one socket.
#[derive(Debug)]
pub struct Simulator {
    config: FaultConfig,
    rng: Mutex<StdRng>,
    counters: FaultCounters,
}

impl Simulator {
    pub fn new(config: FaultConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            config,
            rng: Mutex::new(rng),
            counters: FaultCounters::default(),
        }
    }

    pub fn counters(&self) -> &FaultCounters {
        &self.counters
    }

    /// Decide the fate of `datagram`.
    pub fn judge(&self, datagram: &[u8]) -> Fate {
        if self.config.data_only && datagram.len() <= HEADER_LEN {
            return Fate::Deliver {
                bytes: datagram.to_vec(),
                delays: vec![Duration::ZERO],
            };
        }
        self.counters.seen.fetch_add(1, Ordering::Relaxed);

        let mut rng = match self.rng.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if rng.gen_bool(self.config.loss_rate.clamp(0.0, 1.0)) {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            log::trace!("[sim] drop {} bytes", datagram.len());
            return Fate::Drop;
        }

        let mut bytes = datagram.to_vec();
        if !bytes.is_empty() && rng.gen_bool(self.config.corrupt_rate.clamp(0.0, 1.0)) {
            let bit = rng.gen_range(0..bytes.len() * 8);
            bytes[bit / 8] ^= 1 << (bit % 8);
            self.counters.corrupted.fetch_add(1, Ordering::Relaxed);
            log::trace!("[sim] corrupt bit {bit}");
        }

        let copies = if rng.gen_bool(self.config.duplicate_rate.clamp(0.0, 1.0)) {
            self.counters.duplicated.fetch_add(1, Ordering::Relaxed);
            2
        } else {
            1
        };

        let delays = (0..copies)
            .map(|_| match &self.config.delay {
                Some(range) if range.start() < range.end() => {
                    rng.gen_range(range.start().as_micros()..=range.end().as_micros())
                }
                Some(range) => range.start().as_micros(),
                None => 0,
            })
            .map(|us| Duration::from_micros(us as u64))
            .collect();

        Fate::Deliver { bytes, delays }
    }
}
