//! Receive-side byte buffer and flow-control advertisement.
//!
//! [`RecvBuffer`] implements the receiver half of the stream:
//!
//! - Only **in-order** segments are accepted (`seq == rcv_nxt`).
//! - Out-of-order and duplicate segments are discarded without buffering.
//! - After every data segment, accepted or not, the caller sends a
//!   **cumulative ACK** carrying [`RecvBuffer::ack_number`] and
//!   [`RecvBuffer::window`].
//! - The advertised window is `capacity - unread bytes`, so a slow reader
//!   throttles the sender down to zero.
//!
//! This module only manages state; all socket I/O is the caller's
//! responsibility.

use std::collections::VecDeque;

use crate::segment::seq_lt;

/// What happened to an inbound payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// In order; this many bytes were appended.
    Accepted(usize),
    /// Entirely before `rcv_nxt`; already delivered.
    Duplicate,
    /// Beyond `rcv_nxt`; a gap precedes it.
    OutOfOrder,
    /// In order but larger than the free buffer space.
    NoRoom,
}

/// Receive-side state for one connection.
#[derive(Debug)]
pub struct RecvBuffer {
    /// Next expected sequence number (`RCV.NXT`).
    rcv_nxt: u32,
    /// In-order bytes not yet read by the application.
    buffer: VecDeque<u8>,
    capacity: usize,
    fin_received: bool,
    /// The last window we put on the wire was zero.
    advertised_zero: bool,
}

impl RecvBuffer {
    /// `rcv_nxt` is the first sequence number expected from the peer, i.e.
    /// the peer's ISN + 1 once its SYN has been seen.
    pub fn new(rcv_nxt: u32, capacity: usize) -> Self {
        Self {
            rcv_nxt,
            buffer: VecDeque::with_capacity(capacity),
            capacity,
            fin_received: false,
            advertised_zero: false,
        }
    }

    /// Process an inbound payload.
    pub fn on_segment(&mut self, seq: u32, payload: &[u8]) -> Delivery {
        if seq != self.rcv_nxt || self.fin_received {
            return if seq_lt(seq, self.rcv_nxt) || self.fin_received {
                Delivery::Duplicate
            } else {
                Delivery::OutOfOrder
            };
        }
        if payload.len() > self.free() {
            return Delivery::NoRoom;
        }
        self.buffer.extend(payload.iter().copied());
        self.rcv_nxt = self.rcv_nxt.wrapping_add(payload.len() as u32);
        Delivery::Accepted(payload.len())
    }

    /// Consume the peer's FIN if it sits exactly at `rcv_nxt`.
    ///
    /// Returns `true` the first time; a retransmitted FIN returns `false`.
    pub fn on_fin(&mut self, fin_seq: u32) -> bool {
        if self.fin_received || fin_seq != self.rcv_nxt {
            return false;
        }
        self.fin_received = true;
        self.rcv_nxt = self.rcv_nxt.wrapping_add(1);
        true
    }

    /// `true` if `fin_seq` is a FIN we have already consumed.
    pub fn is_duplicate_fin(&self, fin_seq: u32) -> bool {
        self.fin_received && fin_seq.wrapping_add(1) == self.rcv_nxt
    }

    /// Cumulative ACK number (`RCV.NXT`).
    pub fn ack_number(&self) -> u32 {
        self.rcv_nxt
    }

    /// Window to advertise: free buffer space, capped to the 16-bit field.
    pub fn window(&self) -> u16 {
        u16::try_from(self.free()).unwrap_or(u16::MAX)
    }

    /// [`window`](Self::window), remembering whether it was zero so a later
    /// read knows to announce the reopening.
    pub fn advertise(&mut self) -> u16 {
        let w = self.window();
        self.advertised_zero = w == 0;
        w
    }

    /// Take up to `max` in-order bytes.
    pub fn read(&mut self, max: usize) -> Vec<u8> {
        let n = max.min(self.buffer.len());
        self.buffer.drain(..n).collect()
    }

    /// `true` once after a read reopens a window last advertised as zero.
    pub fn take_window_update(&mut self) -> bool {
        if self.advertised_zero && self.free() > 0 {
            self.advertised_zero = false;
            return true;
        }
        false
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn fin_received(&self) -> bool {
        self.fin_received
    }

    /// Peer closed and every byte has been read: end of stream.
    pub fn is_finished(&self) -> bool {
        self.fin_received && self.buffer.is_empty()
    }

    fn free(&self) -> usize {
        self.capacity.saturating_sub(self.buffer.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_state() {
        let r = RecvBuffer::new(42, 100);
        assert_eq!(r.ack_number(), 42);
        assert_eq!(r.window(), 100);
        assert_eq!(r.buffered(), 0);
    }

    #[test]
    fn in_order_segment_accepted() {
        let mut r = RecvBuffer::new(100, 100);
        assert_eq!(r.on_segment(100, b"hello"), Delivery::Accepted(5));
        assert_eq!(r.ack_number(), 105);
        assert_eq!(r.window(), 95);
    }

    #[test]
    fn out_of_order_segment_discarded() {
        let mut r = RecvBuffer::new(100, 100);
        assert_eq!(r.on_segment(110, b"future"), Delivery::OutOfOrder);
        assert_eq!(r.ack_number(), 100);
        assert_eq!(r.buffered(), 0);
    }

    #[test]
    fn duplicate_segment_not_buffered_twice() {
        let mut r = RecvBuffer::new(100, 100);
        r.on_segment(100, b"hello");
        assert_eq!(r.on_segment(100, b"hello"), Delivery::Duplicate);
        assert_eq!(r.buffered(), 5);
        assert_eq!(r.read(100), b"hello");
    }

    #[test]
    fn segment_larger_than_free_space_is_refused() {
        let mut r = RecvBuffer::new(0, 8);
        assert_eq!(r.on_segment(0, b"abcdef"), Delivery::Accepted(6));
        assert_eq!(r.on_segment(6, b"ghi"), Delivery::NoRoom);
        assert_eq!(r.ack_number(), 6);
        assert_eq!(r.window(), 2);
    }

    #[test]
    fn window_closes_and_read_reopens_it() {
        let mut r = RecvBuffer::new(0, 4);
        r.on_segment(0, b"full");
        assert_eq!(r.advertise(), 0);
        assert!(!r.take_window_update());

        assert_eq!(r.read(2), b"fu");
        assert!(r.take_window_update());
        assert!(!r.take_window_update(), "update is reported once");
        assert_eq!(r.window(), 2);
    }

    #[test]
    fn nonzero_advertisement_needs_no_update() {
        let mut r = RecvBuffer::new(0, 10);
        r.on_segment(0, b"abc");
        r.advertise();
        r.read(3);
        assert!(!r.take_window_update());
    }

    #[test]
    fn read_is_partial_and_ordered() {
        let mut r = RecvBuffer::new(0, 100);
        r.on_segment(0, b"hello ");
        r.on_segment(6, b"world");
        assert_eq!(r.read(5), b"hello");
        assert_eq!(r.read(100), b" world");
        assert!(r.read(10).is_empty());
    }

    #[test]
    fn fin_advances_rcv_nxt_once() {
        let mut r = RecvBuffer::new(50, 10);
        assert!(r.on_fin(50));
        assert_eq!(r.ack_number(), 51);
        assert!(!r.on_fin(50));
        assert!(r.is_duplicate_fin(50));
        assert_eq!(r.ack_number(), 51);
    }

    #[test]
    fn fin_out_of_order_ignored() {
        let mut r = RecvBuffer::new(50, 10);
        assert!(!r.on_fin(99));
        assert!(!r.fin_received());
    }

    #[test]
    fn finished_only_after_buffer_drained() {
        let mut r = RecvBuffer::new(0, 10);
        r.on_segment(0, b"tail");
        r.on_fin(4);
        assert!(!r.is_finished());
        r.read(10);
        assert!(r.is_finished());
    }

    #[test]
    fn data_after_fin_is_a_duplicate() {
        let mut r = RecvBuffer::new(0, 10);
        r.on_fin(0);
        assert_eq!(r.on_segment(1, b"late"), Delivery::Duplicate);
    }

    #[test]
    fn seq_wrap_around() {
        let start = u32::MAX - 2;
        let mut r = RecvBuffer::new(start, 100);
        assert_eq!(r.on_segment(start, b"abcde"), Delivery::Accepted(5));
        assert_eq!(r.ack_number(), start.wrapping_add(5));
        assert_eq!(r.on_segment(start, b"abcde"), Delivery::Duplicate);
    }
}
