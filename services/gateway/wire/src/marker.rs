//! The one-byte frame marker.
//!
//! Every frame starts with a marker byte that tells payload fragments apart
//! from in-band control traffic:
//!
//! ```text
//!   7   6   5   4   3   2   1   0
//! +-------+---+---+---------------+
//! | kind  | F | L |   sequence    |   DATA  (F = first, L = last)
//! +-------+---+---+---------------+
//! | kind  | 0 | 0 |   sequence    |   ACK / FIN
//! +-------+---+---+---------------+
//! | kind  | 0   0   0   0   0   0 |   NACK
//! +-------+-----------------------+
//! ```

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Length of the marker in front of every payload fragment
pub const DATA_HEADER_LEN: usize = 1;

/// Length of an ACK, NACK or FIN frame
pub const CONTROL_FRAME_LEN: usize = 2;

/// Smallest capacity a transfer can run on: one payload byte per fragment,
/// and room for a control frame
pub const MIN_FRAME_CAPACITY: usize = 2;

/// Number of distinct sequence values carried on the wire
pub const SEQ_MODULUS: u32 = 16;

/// Largest window a sender may use without sequence aliasing
pub const MAX_WINDOW: u8 = (SEQ_MODULUS / 2) as u8;

const KIND_SHIFT: u8 = 6;
const SEQ_MASK: u8 = 0x0F;

/// Frame kinds carried in the two top marker bits
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FrameKind {
    /// Payload fragment
    Data = 0b00,
    /// Cumulative acknowledgment
    Ack = 0b01,
    /// Transfer rejected
    Nack = 0b10,
    /// End of stream
    Fin = 0b11,
}

impl FrameKind {
    /// Extract the kind from a marker byte
    pub fn of(marker: u8) -> Self {
        match marker >> KIND_SHIFT {
            0b00 => FrameKind::Data,
            0b01 => FrameKind::Ack,
            0b10 => FrameKind::Nack,
            _ => FrameKind::Fin,
        }
    }
}

bitflags! {
    /// Fragment position flags of a DATA marker
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct MarkerFlags: u8 {
        /// First fragment of the stream
        const FIRST = 1 << 5;
        /// Last fragment of the stream
        const LAST = 1 << 4;
    }
}

/// Reason codes carried by NACK frames
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NackCode {
    /// No transfer is active on this endpoint
    Idle = 1,
    /// Frame outside the expected sequence
    OutOfSequence = 2,
    /// Transfer aborted by the receiving side
    Aborted = 3,
    /// Receiver ran out of room for the payload
    Overflow = 4,
}

impl TryFrom<u8> for NackCode {
    type Error = crate::WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(NackCode::Idle),
            2 => Ok(NackCode::OutOfSequence),
            3 => Ok(NackCode::Aborted),
            4 => Ok(NackCode::Overflow),
            _ => Err(crate::WireError::Code(value)),
        }
    }
}

/// Reason codes carried by FIN frames
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FinCode {
    /// Stream ended normally
    Ok = 0,
    /// Sender gave up; discard what was received
    Aborted = 1,
}

impl TryFrom<u8> for FinCode {
    type Error = crate::WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(FinCode::Ok),
            1 => Ok(FinCode::Aborted),
            _ => Err(crate::WireError::Code(value)),
        }
    }
}

/// Build a marker byte from its parts
pub fn marker(kind: FrameKind, flags: MarkerFlags, seq: u32) -> u8 {
    ((kind as u8) << KIND_SHIFT) | flags.bits() | wire_seq(seq)
}

/// Sequence bits of a marker byte
pub fn marker_seq(marker: u8) -> u8 {
    marker & SEQ_MASK
}

/// Reduce a monotonic sequence counter to its on-wire value
pub fn wire_seq(seq: u32) -> u8 {
    (seq % SEQ_MODULUS) as u8
}

/// Distance from `from` to `to` in on-wire sequence space
pub fn seq_distance(from: u8, to: u8) -> u8 {
    to.wrapping_sub(from) & SEQ_MASK
}
