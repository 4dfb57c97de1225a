//! Error types.
//!
//! Two families live here:
//! - [`Error`] is what the application sees.  Every variant is terminal for the
//!   call that returns it.
//! - [`Discard`] describes a segment that was dropped on the floor.  Discards
//!   are recovered locally (by retransmission or a duplicate ACK), so they are
//!   only logged and counted, never returned.
//!
//! [`SegmentError`] is the codec's own error; a [`SegmentError::ChecksumFailed`]
//! becomes a [`Discard::CorruptSegment`] in the receive loop.

use std::io;
use std::sync::Arc;

use thiserror::Error;

use crate::state::ConnectionState;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced to the application by the blocking connection calls.
///
/// `Clone` so that a terminal error recorded by the receive loop can be handed
/// to every subsequent caller.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// The three-way handshake did not complete within the SYN retry budget.
    #[error("connection failed: handshake not completed within retry budget")]
    ConnectionFailed,

    /// Data-phase retransmissions exhausted the configured retry budget.
    #[error("connection timed out: retransmission budget exhausted")]
    ConnectionTimedOut,

    /// The underlying datagram channel failed.
    #[error("channel error: {0}")]
    Channel(Arc<io::Error>),

    /// The operation needs a synchronized connection.
    #[error("operation not permitted in state {state}")]
    NotConnected { state: ConnectionState },

    /// The receive loop stopped without a clean close.
    #[error("connection reset")]
    ConnectionReset,

    /// A configuration value is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Channel(Arc::new(e))
    }
}

/// Reasons a decoded datagram could not be turned into a [`crate::segment::Segment`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SegmentError {
    /// Buffer shorter than the fixed header.
    #[error("buffer too short to contain a header")]
    BufferTooShort,
    /// Header-length field is not the fixed header size.
    #[error("unexpected header length {0} (in 32-bit words)")]
    BadHeaderLength(u8),
    /// The reserved urgent-pointer field was non-zero.
    #[error("reserved field is non-zero")]
    ReservedNonZero,
    /// Checksum did not match the recomputed value.
    #[error("checksum verification failed")]
    ChecksumFailed,
}

/// Why an inbound segment was dropped without changing connection state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Discard {
    #[error("corrupt segment: {0}")]
    CorruptSegment(SegmentError),

    #[error("out-of-order segment seq={seq} (expected {expected})")]
    OutOfOrderSegment { seq: u32, expected: u32 },

    #[error("flags {flags:#04x} not valid in state {state}")]
    InvalidStateTransition { state: ConnectionState, flags: u8 },

    #[error("stale ack {ack} (base {base})")]
    StaleAck { ack: u32, base: u32 },
}

impl From<SegmentError> for Discard {
    fn from(e: SegmentError) -> Self {
        Self::CorruptSegment(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_converts_to_channel() {
        let e: Error = io::Error::new(io::ErrorKind::BrokenPipe, "gone").into();
        assert!(matches!(e, Error::Channel(_)));
        assert!(e.to_string().contains("gone"));
    }

    #[test]
    fn not_connected_names_the_state() {
        let e = Error::NotConnected {
            state: ConnectionState::SynSent,
        };
        assert_eq!(e.to_string(), "operation not permitted in state SYN_SENT");
    }

    #[test]
    fn checksum_failure_is_a_corrupt_discard() {
        let d: Discard = SegmentError::ChecksumFailed.into();
        assert_eq!(d, Discard::CorruptSegment(SegmentError::ChecksumFailed));
    }
}
