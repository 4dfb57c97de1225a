//! Send-side byte buffer and retransmission bookkeeping.
//!
//! [`SendBuffer`] owns every byte the application has queued but the peer has
//! not yet acknowledged.  The byte stream is split by two cursors:
//!
//! ```text
//!        base (SND.UNA)        next_seq (SND.NXT)
//!            │                       │
//!  ──────────┼───────────────────────┼──────────────────────▶ seq space
//!   acked    │ <── in flight ──────▶ │ <── unsent (queued) ──▶
//! ```
//!
//! # Protocol contract
//!
//! - `next_seq - base` never exceeds `min(send_window, peer_window)` for data.
//!   SYN and FIN occupy one sequence number each and are exempt from the
//!   window, since they carry no payload.
//! - ACKs are **cumulative**: `ack = K` covers every byte before `K`.
//! - On timeout every in-flight segment is resent unchanged, oldest first.
//! - Sequence numbers are `u32` and wrap; comparisons go through
//!   [`seq_lt`] / [`seq_le`].
//!
//! This module only manages state; all socket I/O and timer control is the
//! caller's responsibility.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::rtt::RttSampling;
use crate::segment::{flags, seq_le, seq_lt};

/// A segment that has been sent but not yet acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InFlight {
    pub seq: u32,
    pub payload: Vec<u8>,
    /// [`flags::SYN`] or [`flags::FIN`] when this record is a control segment.
    pub control: u8,
    /// Wall-clock time of the most recent transmission.
    pub sent_at: Instant,
    /// Total transmissions (1 = never retransmitted).
    pub tx_count: u32,
}

impl InFlight {
    fn seq_len(&self) -> u32 {
        let control = u32::from(self.control & (flags::SYN | flags::FIN) != 0);
        self.payload.len() as u32 + control
    }

    /// First sequence number after this segment.
    fn end(&self) -> u32 {
        self.seq.wrapping_add(self.seq_len())
    }
}

/// What the caller must put on the wire.
///
/// The connection fills in ports, ACK number and window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transmit {
    pub seq: u32,
    pub control: u8,
    pub payload: Vec<u8>,
}

impl From<&InFlight> for Transmit {
    fn from(e: &InFlight) -> Self {
        Self {
            seq: e.seq,
            control: e.control,
            payload: e.payload.clone(),
        }
    }
}

/// Result of an ACK that moved `base` forward.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AckProgress {
    /// Payload bytes newly acknowledged.
    pub bytes: usize,
    /// Round-trip sample from the newest eligible acknowledged segment.
    pub rtt_sample: Option<Duration>,
    /// Our FIN is among the acknowledged segments.
    pub fin_acked: bool,
}

/// Send-side state for one connection.
#[derive(Debug)]
pub struct SendBuffer {
    /// Oldest unacknowledged sequence number.
    base: u32,
    /// Sequence number for the next new segment.
    next_seq: u32,
    /// Queued bytes not yet carved into segments.
    unsent: VecDeque<u8>,
    /// Sent, unacknowledged segments (front = oldest).
    in_flight: VecDeque<InFlight>,
    /// Most recently advertised peer window.
    peer_window: usize,
    /// Local cap on in-flight bytes.
    send_window: usize,
    mss: usize,
    sampling: RttSampling,
    fin_queued: bool,
    fin_sent: bool,
}

impl SendBuffer {
    /// `isn` is the initial sequence number; the SYN will occupy it.
    pub fn new(isn: u32, mss: usize, send_window: usize, sampling: RttSampling) -> Self {
        assert!(mss >= 1, "mss must be at least 1");
        Self {
            base: isn,
            next_seq: isn,
            unsent: VecDeque::new(),
            in_flight: VecDeque::new(),
            peer_window: 0,
            send_window,
            mss,
            sampling,
            fin_queued: false,
            fin_sent: false,
        }
    }

    // -----------------------------------------------------------------------
    // Queueing
    // -----------------------------------------------------------------------

    /// Record the SYN (or SYN+ACK) as in flight and return it for transmission.
    ///
    /// Must be the first thing sent; it occupies the initial sequence number.
    pub fn syn(&mut self, now: Instant) -> Transmit {
        debug_assert_eq!(self.base, self.next_seq, "SYN must be the first segment");
        self.record(Vec::new(), flags::SYN, now)
    }

    /// Append application bytes to the unsent region.
    pub fn enqueue(&mut self, data: &[u8]) {
        debug_assert!(!self.fin_queued, "enqueue after FIN");
        self.unsent.extend(data.iter().copied());
    }

    /// Queue a FIN behind every byte already enqueued.
    pub fn queue_fin(&mut self) {
        self.fin_queued = true;
    }

    // -----------------------------------------------------------------------
    // Transmission
    // -----------------------------------------------------------------------

    /// Carve as many segments as the window allows and record them in flight.
    ///
    /// Each segment carries at most `mss` bytes.  Once the unsent region is
    /// empty, a queued FIN is released.
    pub fn try_send(&mut self, now: Instant) -> Vec<Transmit> {
        let mut out = Vec::new();
        loop {
            if !self.unsent.is_empty() {
                let room = self.usable_window();
                if room == 0 {
                    break;
                }
                let n = room.min(self.mss).min(self.unsent.len());
                let payload: Vec<u8> = self.unsent.drain(..n).collect();
                out.push(self.record(payload, 0, now));
            } else if self.fin_queued && !self.fin_sent {
                self.fin_sent = true;
                out.push(self.record(Vec::new(), flags::FIN, now));
                break;
            } else {
                break;
            }
        }
        out
    }

    /// Bytes that may still be sent before hitting `min(send_window, peer_window)`.
    pub fn usable_window(&self) -> usize {
        self.send_window
            .min(self.peer_window)
            .saturating_sub(self.in_flight_bytes())
    }

    fn record(&mut self, payload: Vec<u8>, control: u8, now: Instant) -> Transmit {
        let entry = InFlight {
            seq: self.next_seq,
            payload,
            control,
            sent_at: now,
            tx_count: 1,
        };
        self.next_seq = entry.end();
        let tx = Transmit::from(&entry);
        self.in_flight.push_back(entry);
        tx
    }

    // -----------------------------------------------------------------------
    // Acknowledgement
    // -----------------------------------------------------------------------

    /// Process a cumulative ACK.
    ///
    /// Returns `None` for a duplicate (`ack == base`), stale (`ack < base`) or
    /// impossible (`ack > next_seq`) acknowledgement; none of these change
    /// state.  Otherwise removes every segment fully covered by `ack`, trims a
    /// partially covered one, advances `base` and reports the progress.
    pub fn on_ack(&mut self, ack: u32, now: Instant) -> Option<AckProgress> {
        if !seq_lt(self.base, ack) || seq_lt(self.next_seq, ack) {
            return None;
        }

        let mut progress = AckProgress::default();
        let mut newest_sample = None;

        while let Some(front) = self.in_flight.front_mut() {
            if seq_le(front.end(), ack) {
                let entry = self.in_flight.pop_front()?;
                progress.bytes += entry.payload.len();
                progress.fin_acked |= entry.control & flags::FIN != 0;
                let eligible = entry.tx_count == 1
                    || self.sampling == RttSampling::IncludeRetransmitted;
                if eligible {
                    newest_sample = Some(now.saturating_duration_since(entry.sent_at));
                }
            } else {
                if seq_lt(front.seq, ack) {
                    // Peer accepted a prefix; drop it so a retransmit resends
                    // only what is still missing.
                    let covered = ack.wrapping_sub(front.seq) as usize;
                    front.payload.drain(..covered);
                    front.seq = ack;
                    progress.bytes += covered;
                }
                break;
            }
        }

        self.base = ack;
        progress.rtt_sample = newest_sample;
        Some(progress)
    }

    /// Adopt the peer's advertised window, unless the segment carrying it is
    /// older than what we already know (`ack < base`).
    pub fn update_window(&mut self, ack: u32, window: u16) {
        if seq_le(self.base, ack) {
            self.peer_window = usize::from(window);
        }
    }

    /// Force the peer window, used when it arrives on a SYN.
    pub fn set_peer_window(&mut self, window: u16) {
        self.peer_window = usize::from(window);
    }

    // -----------------------------------------------------------------------
    // Timeout
    // -----------------------------------------------------------------------

    /// Mark every in-flight segment retransmitted and return them, oldest
    /// first, for resending unchanged.
    pub fn on_timeout(&mut self, now: Instant) -> Vec<Transmit> {
        self.in_flight
            .iter_mut()
            .map(|e| {
                e.tx_count += 1;
                e.sent_at = now;
                Transmit::from(&*e)
            })
            .collect()
    }

    /// A zero-window probe, if one is needed.
    ///
    /// Needed when the peer window is closed, nothing is in flight (so no ACK
    /// is coming) and data is waiting.  The probe is an empty segment with an
    /// already-acknowledged sequence number: it carries no new data but makes
    /// the receiver answer with its current window.
    pub fn window_probe(&self) -> Option<Transmit> {
        let stalled =
            self.peer_window == 0 && self.in_flight.is_empty() && !self.unsent.is_empty();
        stalled.then(|| Transmit {
            seq: self.next_seq.wrapping_sub(1),
            control: 0,
            payload: Vec::new(),
        })
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn base(&self) -> u32 {
        self.base
    }

    pub fn next_seq(&self) -> u32 {
        self.next_seq
    }

    pub fn peer_window(&self) -> usize {
        self.peer_window
    }

    /// `next_seq - base`, counting SYN/FIN as one byte each.
    pub fn in_flight_bytes(&self) -> usize {
        self.next_seq.wrapping_sub(self.base) as usize
    }

    pub fn has_in_flight(&self) -> bool {
        !self.in_flight.is_empty()
    }

    #[cfg(test)]
    fn in_flight_segments(&self) -> usize {
        self.in_flight.len()
    }

    #[cfg(test)]
    fn unsent_len(&self) -> usize {
        self.unsent.len()
    }

    /// Nothing queued and nothing awaiting acknowledgement.
    pub fn is_drained(&self) -> bool {
        self.unsent.is_empty() && self.in_flight.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn established(isn: u32, mss: usize, peer_window: u16) -> SendBuffer {
        let now = Instant::now();
        let mut s = SendBuffer::new(isn, mss, 65_535, RttSampling::FreshOnly);
        s.syn(now);
        s.on_ack(isn.wrapping_add(1), now).unwrap();
        s.set_peer_window(peer_window);
        s
    }

    #[test]
    fn syn_occupies_one_sequence_number() {
        let now = Instant::now();
        let mut s = SendBuffer::new(100, 10, 1000, RttSampling::FreshOnly);
        let syn = s.syn(now);
        assert_eq!(syn.seq, 100);
        assert_eq!(syn.control, flags::SYN);
        assert_eq!(s.next_seq(), 101);
        assert_eq!(s.in_flight_bytes(), 1);

        let p = s.on_ack(101, now).unwrap();
        assert!(!p.fin_acked);
        assert_eq!(p.bytes, 0);
        assert_eq!(s.base(), 101);
        assert!(!s.has_in_flight());
    }

    #[test]
    fn segments_are_bounded_by_mss() {
        let mut s = established(0, 4, 100);
        s.enqueue(b"hello world");
        let out = s.try_send(Instant::now());
        let sizes: Vec<usize> = out.iter().map(|t| t.payload.len()).collect();
        assert_eq!(sizes, vec![4, 4, 3]);
        assert_eq!(out[0].seq, 1);
        assert_eq!(out[1].seq, 5);
        assert_eq!(out[2].seq, 9);
        assert_eq!(s.next_seq(), 12);
    }

    #[test]
    fn in_flight_never_exceeds_peer_window() {
        let mut s = established(0, 4, 6);
        s.enqueue(&[7u8; 20]);
        let out = s.try_send(Instant::now());
        let total: usize = out.iter().map(|t| t.payload.len()).sum();
        assert_eq!(total, 6);
        assert_eq!(s.in_flight_bytes(), 6);
        assert_eq!(s.unsent_len(), 14);
        assert!(s.try_send(Instant::now()).is_empty());
    }

    #[test]
    fn zero_window_sends_nothing_until_reopened() {
        let mut s = established(0, 4, 0);
        s.enqueue(b"blocked");
        assert!(s.try_send(Instant::now()).is_empty());
        assert!(s.window_probe().is_some());

        // A duplicate ACK (same ack number) reopening the window.
        s.update_window(1, 8);
        assert!(s.window_probe().is_none());
        let out = s.try_send(Instant::now());
        assert_eq!(out.len(), 2);
        assert_eq!(s.unsent_len(), 0);
    }

    #[test]
    fn probe_reuses_an_acknowledged_sequence_number() {
        let mut s = established(500, 4, 0);
        s.enqueue(b"x");
        let probe = s.window_probe().unwrap();
        assert_eq!(probe.seq, 500);
        assert!(probe.payload.is_empty());
        assert_eq!(s.in_flight_bytes(), 0);
    }

    #[test]
    fn cumulative_ack_removes_covered_segments() {
        let mut s = established(0, 5, 100);
        s.enqueue(&[0u8; 15]);
        s.try_send(Instant::now());
        assert_eq!(s.in_flight_segments(), 3);

        let p = s.on_ack(11, Instant::now()).unwrap();
        assert_eq!(p.bytes, 10);
        assert_eq!(s.base(), 11);
        assert_eq!(s.in_flight_segments(), 1);
    }

    #[test]
    fn duplicate_and_stale_acks_are_ignored() {
        let mut s = established(0, 5, 100);
        s.enqueue(&[0u8; 10]);
        s.try_send(Instant::now());
        s.on_ack(6, Instant::now()).unwrap();

        assert!(s.on_ack(6, Instant::now()).is_none());
        assert!(s.on_ack(3, Instant::now()).is_none());
        assert_eq!(s.base(), 6);
        assert_eq!(s.in_flight_segments(), 1);
    }

    #[test]
    fn ack_beyond_next_seq_is_ignored() {
        let mut s = established(0, 5, 100);
        s.enqueue(&[0u8; 5]);
        s.try_send(Instant::now());
        assert!(s.on_ack(1000, Instant::now()).is_none());
        assert_eq!(s.base(), 1);
    }

    #[test]
    fn stale_window_update_is_ignored() {
        let mut s = established(0, 5, 100);
        s.enqueue(&[0u8; 10]);
        s.try_send(Instant::now());
        s.on_ack(11, Instant::now()).unwrap();
        s.update_window(6, 0);
        assert_eq!(s.peer_window(), 100);
        s.update_window(11, 0);
        assert_eq!(s.peer_window(), 0);
    }

    #[test]
    fn partial_ack_trims_the_oldest_segment() {
        let mut s = established(0, 8, 100);
        s.enqueue(b"abcdefgh");
        s.try_send(Instant::now());

        let p = s.on_ack(4, Instant::now()).unwrap();
        assert_eq!(p.bytes, 3);
        let resend = s.on_timeout(Instant::now());
        assert_eq!(resend.len(), 1);
        assert_eq!(resend[0].seq, 4);
        assert_eq!(resend[0].payload, b"defgh");
    }

    #[test]
    fn timeout_resends_everything_in_order() {
        let mut s = established(0, 2, 100);
        s.enqueue(b"abcdef");
        let first = s.try_send(Instant::now());
        let again = s.on_timeout(Instant::now());
        assert_eq!(first, again);
    }

    #[test]
    fn retransmitted_segments_are_not_sampled_by_default() {
        let t0 = Instant::now();
        let mut s = established(0, 4, 100);
        s.enqueue(b"abcd");
        s.try_send(t0);
        s.on_timeout(t0 + Duration::from_millis(100));

        let p = s.on_ack(5, t0 + Duration::from_millis(150)).unwrap();
        assert_eq!(p.bytes, 4);
        assert_eq!(p.rtt_sample, None);
    }

    #[test]
    fn retransmitted_segments_sampled_when_configured() {
        let t0 = Instant::now();
        let mut s = SendBuffer::new(0, 4, 1000, RttSampling::IncludeRetransmitted);
        s.syn(t0);
        s.on_ack(1, t0).unwrap();
        s.set_peer_window(100);
        s.enqueue(b"abcd");
        s.try_send(t0);
        s.on_timeout(t0 + Duration::from_millis(100));

        let p = s.on_ack(5, t0 + Duration::from_millis(150)).unwrap();
        assert_eq!(p.rtt_sample, Some(Duration::from_millis(50)));
    }

    #[test]
    fn fresh_segment_yields_sample() {
        let t0 = Instant::now();
        let mut s = established(0, 4, 100);
        s.enqueue(b"abcdefgh");
        s.try_send(t0);
        let p = s.on_ack(9, t0 + Duration::from_millis(20)).unwrap();
        assert_eq!(p.rtt_sample, Some(Duration::from_millis(20)));
    }

    #[test]
    fn fin_follows_data_and_takes_one_sequence_number() {
        let mut s = established(0, 4, 100);
        s.enqueue(b"abc");
        s.queue_fin();
        let out = s.try_send(Instant::now());
        assert_eq!(out.len(), 2);
        assert_eq!(out[1].control, flags::FIN);
        assert_eq!(out[1].seq, 4);
        assert_eq!(s.next_seq(), 5);

        let p = s.on_ack(5, Instant::now()).unwrap();
        assert!(p.fin_acked);
        assert!(s.is_drained());
    }

    #[test]
    fn fin_waits_for_a_closed_window_to_drain() {
        let mut s = established(0, 4, 0);
        s.enqueue(b"abc");
        s.queue_fin();
        assert!(s.try_send(Instant::now()).is_empty());
        assert!(!s.is_drained());
    }

    #[test]
    fn sequence_numbers_wrap() {
        let start = u32::MAX - 2;
        let mut s = established(start, 8, 100);
        s.enqueue(&[1u8; 8]);
        let out = s.try_send(Instant::now());
        assert_eq!(out[0].seq, u32::MAX - 1);

        let ack = start.wrapping_add(1 + 8);
        let p = s.on_ack(ack, Instant::now()).unwrap();
        assert_eq!(p.bytes, 8);
        assert_eq!(s.base(), ack);
        assert!(!s.has_in_flight());
    }
}
