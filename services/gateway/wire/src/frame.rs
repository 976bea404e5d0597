//! Frame encoding and decoding.
//!
//! A frame is a single transport write or notification. It carries either a
//! payload fragment or one of the in-band control messages, so the transfer
//! layers never need a side channel.

use crate::marker::{
    marker, marker_seq, wire_seq, FinCode, FrameKind, MarkerFlags, NackCode, CONTROL_FRAME_LEN,
    DATA_HEADER_LEN, MAX_WINDOW,
};
use crate::WireError;
use bytes::{BufMut, Bytes, BytesMut};

/// Decoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Payload fragment
    Data {
        /// On-wire sequence (0..16)
        seq: u8,
        /// First fragment of the stream
        first: bool,
        /// Last fragment of the stream
        last: bool,
        /// Fragment bytes
        payload: Bytes,
    },
    /// Cumulative acknowledgment up to and including `seq`
    Ack {
        /// Highest acknowledged sequence
        seq: u8,
        /// Window advertised by the receiver
        window: u8,
    },
    /// Transfer rejected by the peer
    Nack {
        /// Reason
        code: NackCode,
    },
    /// End of stream
    Fin {
        /// Sequence of the FIN itself
        seq: u8,
        /// Reason
        code: FinCode,
    },
}

impl Frame {
    /// Decode one frame
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        let Some(&m) = buf.first() else {
            return Err(WireError::Incomplete);
        };

        let kind = FrameKind::of(m);
        if kind == FrameKind::Data {
            let flags = MarkerFlags::from_bits_truncate(m);
            return Ok(Frame::Data {
                seq: marker_seq(m),
                first: flags.contains(MarkerFlags::FIRST),
                last: flags.contains(MarkerFlags::LAST),
                payload: Bytes::copy_from_slice(&buf[DATA_HEADER_LEN..]),
            });
        }

        if buf.len() < CONTROL_FRAME_LEN {
            return Err(WireError::Incomplete);
        }
        if m & (MarkerFlags::FIRST | MarkerFlags::LAST).bits() != 0 {
            return Err(WireError::Reserved);
        }

        match kind {
            FrameKind::Ack => {
                let window = buf[1];
                if window == 0 || window > MAX_WINDOW {
                    return Err(WireError::Window(window));
                }
                Ok(Frame::Ack {
                    seq: marker_seq(m),
                    window,
                })
            }
            FrameKind::Nack => {
                if marker_seq(m) != 0 {
                    return Err(WireError::Reserved);
                }
                Ok(Frame::Nack {
                    code: NackCode::try_from(buf[1])?,
                })
            }
            _ => Ok(Frame::Fin {
                seq: marker_seq(m),
                code: FinCode::try_from(buf[1])?,
            }),
        }
    }

    /// Whether this is an ACK, NACK or FIN
    pub fn is_control(&self) -> bool {
        !matches!(self, Frame::Data { .. })
    }

    /// Encode into a fresh buffer
    pub fn encode(&self) -> Bytes {
        match self {
            Frame::Data {
                seq,
                first,
                last,
                payload,
            } => encode_data(*seq as u32, *first, *last, payload),
            Frame::Ack { seq, window } => encode_ack(*seq as u32, *window),
            Frame::Nack { code } => encode_nack(*code),
            Frame::Fin { seq, code } => encode_fin(*seq as u32, *code),
        }
    }
}

/// Encode a DATA frame
pub fn encode_data(seq: u32, first: bool, last: bool, payload: &[u8]) -> Bytes {
    let mut flags = MarkerFlags::empty();
    flags.set(MarkerFlags::FIRST, first);
    flags.set(MarkerFlags::LAST, last);

    let mut buf = BytesMut::with_capacity(DATA_HEADER_LEN + payload.len());
    buf.put_u8(marker(FrameKind::Data, flags, seq));
    buf.put_slice(payload);
    buf.freeze()
}

/// Encode an ACK frame
pub fn encode_ack(seq: u32, window: u8) -> Bytes {
    control(marker(FrameKind::Ack, MarkerFlags::empty(), seq), window)
}

/// Encode a NACK frame
pub fn encode_nack(code: NackCode) -> Bytes {
    control(marker(FrameKind::Nack, MarkerFlags::empty(), 0), code as u8)
}

/// Encode a FIN frame
pub fn encode_fin(seq: u32, code: FinCode) -> Bytes {
    control(marker(FrameKind::Fin, MarkerFlags::empty(), seq), code as u8)
}

/// The on-wire sequence that precedes `seq`
pub fn prev_seq(seq: u32) -> u32 {
    wire_seq(seq.wrapping_add(crate::marker::SEQ_MODULUS - 1)) as u32
}

fn control(m: u8, arg: u8) -> Bytes {
    Bytes::copy_from_slice(&[m, arg])
}
