//! Wire-format definitions for transport segments.
//!
//! Every datagram exchanged between peers is a [`Segment`].  This module is
//! responsible for:
//! - Defining the on-wire binary layout (header fields, flags, payload).
//! - Serialising a [`Segment`] into a byte buffer ready for transmission.
//! - Deserialising a raw byte slice back into a [`Segment`], returning a typed
//!   [`SegmentError`] for malformed, truncated or corrupted input.
//!
//! No I/O happens here; this is pure data transformation.
//!
//! # Wire format
//!
//! All multi-byte integers are **big-endian**.
//!
//! ```text
//!  0               1               2               3
//!  0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |          Source Port          |       Destination Port        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                        Sequence Number                        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                    Acknowledgment Number                      |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |  Header Len   |     Flags     |          Window Size          |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |           Checksum            |   Urgent Pointer (always 0)   |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                        Payload ...                            |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Total header size: [`HEADER_LEN`] = 20 bytes.  The header-length field
//! counts **32-bit words**, so it always carries [`HEADER_WORDS`] = 5.
//! The payload length is implied by the datagram length.

use crate::error::SegmentError;

/// Bit-flag constants for the `flags` header field.
pub mod flags {
    /// Finish: sender has no more data to send.
    pub const FIN: u8 = 0b0000_0001;
    /// Synchronise sequence numbers (handshake).
    pub const SYN: u8 = 0b0000_0010;
    /// Acknowledgement field is valid.
    pub const ACK: u8 = 0b0001_0000;

    /// Human-readable flag list for logs, e.g. `SYN|ACK`.
    pub fn names(flags: u8) -> String {
        let names: Vec<&str> = [(SYN, "SYN"), (FIN, "FIN"), (ACK, "ACK")]
            .into_iter()
            .filter(|(bit, _)| flags & bit != 0)
            .map(|(_, name)| name)
            .collect();
        if names.is_empty() {
            "-".to_string()
        } else {
            names.join("|")
        }
    }
}

/// Byte length of the fixed-size header on the wire.
pub const HEADER_LEN: usize = 20;

/// Value of the header-length field (header size in 32-bit words).
pub const HEADER_WORDS: u8 = (HEADER_LEN / 4) as u8;

// Byte offsets of each field within the serialised header.
const OFF_SRC_PORT: usize = 0;
const OFF_DST_PORT: usize = 2;
const OFF_SEQ: usize = 4;
const OFF_ACK: usize = 8;
const OFF_HEADER_LEN: usize = 12;
const OFF_FLAGS: usize = 13;
const OFF_WINDOW: usize = 14;
const OFF_CHECKSUM: usize = 16;
const OFF_URGENT: usize = 18;

/// Fixed-size segment header.
///
/// Fields are in host byte order; [`Segment::encode`] converts to big-endian
/// on the wire and [`Segment::decode`] converts back.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Header {
    pub src_port: u16,
    pub dst_port: u16,
    /// Byte offset of the first payload byte (or of the SYN/FIN).
    pub seq: u32,
    /// Next byte expected from the peer.  Only meaningful with [`flags::ACK`].
    pub ack: u32,
    /// Bitmask of [`flags`] constants.
    pub flags: u8,
    /// Advertised receive window in bytes.
    pub window: u16,
    /// Internet checksum over header (checksum zeroed) and payload.
    ///
    /// Ignored by encode (computed fresh); filled in by decode.
    pub checksum: u16,
}

impl Header {
    #[inline]
    pub fn has(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }
}

/// A complete protocol datagram: header + payload bytes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Segment {
    pub header: Header,
    pub payload: Vec<u8>,
}

impl Segment {
    /// Serialise this segment into a newly allocated byte vector.
    ///
    /// `header.checksum` is computed from the serialised bytes; any value
    /// already stored there is ignored.
    pub fn encode(&self) -> Vec<u8> {
        let h = &self.header;
        let mut buf = vec![0u8; HEADER_LEN + self.payload.len()];

        buf[OFF_SRC_PORT..OFF_SRC_PORT + 2].copy_from_slice(&h.src_port.to_be_bytes());
        buf[OFF_DST_PORT..OFF_DST_PORT + 2].copy_from_slice(&h.dst_port.to_be_bytes());
        buf[OFF_SEQ..OFF_SEQ + 4].copy_from_slice(&h.seq.to_be_bytes());
        buf[OFF_ACK..OFF_ACK + 4].copy_from_slice(&h.ack.to_be_bytes());
        buf[OFF_HEADER_LEN] = HEADER_WORDS;
        buf[OFF_FLAGS] = h.flags;
        buf[OFF_WINDOW..OFF_WINDOW + 2].copy_from_slice(&h.window.to_be_bytes());
        // Checksum and urgent pointer stay zero while summing.
        buf[HEADER_LEN..].copy_from_slice(&self.payload);

        let csum = internet_checksum(&buf);
        buf[OFF_CHECKSUM..OFF_CHECKSUM + 2].copy_from_slice(&csum.to_be_bytes());

        buf
    }

    /// Parse a [`Segment`] from a raw datagram.
    ///
    /// Returns [`Err`] if:
    /// - `buf` is shorter than [`HEADER_LEN`],
    /// - the header-length field is not [`HEADER_WORDS`],
    /// - the urgent pointer is non-zero, or
    /// - the checksum does not verify.
    pub fn decode(buf: &[u8]) -> Result<Self, SegmentError> {
        if buf.len() < HEADER_LEN {
            return Err(SegmentError::BufferTooShort);
        }

        // Verify the checksum first: a flipped bit anywhere should read as
        // corruption rather than as some other structural complaint.
        let checksum = be16(buf, OFF_CHECKSUM);
        let mut scratch = buf.to_vec();
        scratch[OFF_CHECKSUM..OFF_CHECKSUM + 2].fill(0);
        if internet_checksum(&scratch) != checksum {
            return Err(SegmentError::ChecksumFailed);
        }

        let header_words = buf[OFF_HEADER_LEN];
        if header_words != HEADER_WORDS {
            return Err(SegmentError::BadHeaderLength(header_words));
        }
        if be16(buf, OFF_URGENT) != 0 {
            return Err(SegmentError::ReservedNonZero);
        }

        Ok(Segment {
            header: Header {
                src_port: be16(buf, OFF_SRC_PORT),
                dst_port: be16(buf, OFF_DST_PORT),
                seq: be32(buf, OFF_SEQ),
                ack: be32(buf, OFF_ACK),
                flags: buf[OFF_FLAGS],
                window: be16(buf, OFF_WINDOW),
                checksum,
            },
            payload: buf[HEADER_LEN..].to_vec(),
        })
    }
}

/// `a < b` in wrap-around sequence space.
///
/// Correct as long as the two values are less than `2^31` apart, which always
/// holds for windows bounded by a 16-bit advertisement.
#[inline]
pub fn seq_lt(a: u32, b: u32) -> bool {
    (b.wrapping_sub(a) as i32) > 0
}

/// `a <= b` in wrap-around sequence space.
#[inline]
pub fn seq_le(a: u32, b: u32) -> bool {
    a == b || seq_lt(a, b)
}

#[inline]
fn be16(buf: &[u8], off: usize) -> u16 {
    u16::from_be_bytes([buf[off], buf[off + 1]])
}

#[inline]
fn be32(buf: &[u8], off: usize) -> u32 {
    u32::from_be_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

/// Compute the Internet checksum (RFC 1071) over `data`.
///
/// Sum consecutive 16-bit big-endian words, fold the carry, return the
/// one's-complement.  The caller must zero any checksum field within `data`
/// before calling this function.
pub fn internet_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for word in &mut chunks {
        sum += u32::from(u16::from_be_bytes([word[0], word[1]]));
        // Fold eagerly so large payloads cannot overflow.
        if sum > 0xffff {
            sum = (sum & 0xffff) + (sum >> 16);
        }
    }
    // Odd trailing byte: pad with a zero on the right.
    if let [last] = chunks.remainder() {
        sum += u32::from(*last) << 8;
    }

    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }

    !(sum as u16)
}
