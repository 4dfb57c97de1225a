//! Connection finite-state machine (FSM) states.
//!
//! The states mirror the TCP state diagram (RFC 793 §3.2).  Transitions are
//! driven by [`crate::connection`]; this module only names the states and
//! answers a few questions about them that several call sites share.
//!
//! ```text
//!               listen()                    connect() / →SYN
//!   CLOSED ─────────────▶ LISTEN     CLOSED ─────────────────▶ SYN_SENT
//!                           │ ←SYN / →SYN+ACK                      │ ←SYN+ACK / →ACK
//!                           ▼                                      ▼
//!                        SYN_RCVD ────────── ←ACK ──────────▶ ESTABLISHED
//!
//!   ESTABLISHED ── close() / →FIN ──▶ FIN_WAIT_1 ── ←ACK ──▶ FIN_WAIT_2
//!        │                               │ ←FIN / →ACK          │ ←FIN / →ACK
//!        │                               ▼                      ▼
//!        │                            CLOSING ─── ←ACK ───▶ TIME_WAIT ── timeout ──▶ CLOSED
//!        │
//!        └── ←FIN / →ACK ──▶ CLOSE_WAIT ── close() / →FIN ──▶ LAST_ACK ── ←ACK ──▶ CLOSED
//! ```

use std::fmt;

/// All possible states of the connection FSM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No connection exists; initial and terminal state.
    #[default]
    Closed,
    /// Passive open; waiting for a SYN.
    Listen,
    /// SYN has been sent; waiting for SYN+ACK.
    SynSent,
    /// SYN received and SYN+ACK sent; waiting for the final ACK.
    SynReceived,
    /// Three-way handshake complete; data transfer in progress.
    Established,
    /// Local side sent FIN; waiting for its ACK.
    FinWait1,
    /// Local FIN acknowledged; waiting for the peer's FIN.
    FinWait2,
    /// Peer's FIN received; local close pending.
    CloseWait,
    /// Both sides sent FIN before seeing the other's; waiting for our ACK.
    Closing,
    /// Waiting for the ACK of our FIN after the peer closed first.
    LastAck,
    /// Lingering so a lost final ACK can be repeated.
    TimeWait,
}

impl ConnectionState {
    /// The handshake has completed (or the connection is already tearing down).
    pub fn is_synchronized(self) -> bool {
        !matches!(
            self,
            Self::Closed | Self::Listen | Self::SynSent | Self::SynReceived
        )
    }

    /// The application may still queue outbound data.
    pub fn can_send(self) -> bool {
        matches!(self, Self::Established | Self::CloseWait)
    }

    /// Our FIN has been acknowledged; the local half of the teardown is done.
    pub fn local_close_complete(self) -> bool {
        matches!(self, Self::FinWait2 | Self::TimeWait | Self::Closed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Closed => "CLOSED",
            Self::Listen => "LISTEN",
            Self::SynSent => "SYN_SENT",
            Self::SynReceived => "SYN_RCVD",
            Self::Established => "ESTABLISHED",
            Self::FinWait1 => "FIN_WAIT_1",
            Self::FinWait2 => "FIN_WAIT_2",
            Self::CloseWait => "CLOSE_WAIT",
            Self::Closing => "CLOSING",
            Self::LastAck => "LAST_ACK",
            Self::TimeWait => "TIME_WAIT",
        };
        f.write_str(name)
    }
}
