//! Framing, fragmentation and the info record codec for the pouch gateway.
//!
//! This crate holds the byte-level contract between the gateway and a pouch
//! device: how a payload stream is cut into notification-sized fragments,
//! how ACK/NACK/FIN control traffic is carried in-band, and how the device
//! info record is decoded.
//!
//! ## Features
//!
//! - **One-byte marker**: kind, fragment position and sequence in one byte
//! - **Zero-Copy I/O**: Uses `Bytes`/`BytesMut` for fragment payloads
//! - **Pull sources**: payloads may be produced while the transfer runs
//! - **CBOR info record**: decoded with `ciborium`
//!
//! ## Wire Format
//!
//! ```text
//! DATA  +--------+------------------------+
//!       | marker | payload (0..capacity-1) |
//!       +--------+------------------------+
//! ACK   | marker | window                 |
//! NACK  | marker | reason code            |
//! FIN   | marker | reason code            |
//!       +--------+------------------------+
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod frame;
pub mod info;
pub mod marker;
pub mod packetizer;

// Re-export main types
pub use error::{PacketizerError, SinkError, WireError};
pub use frame::{encode_ack, encode_data, encode_fin, encode_nack, prev_seq, Frame};
pub use info::{decode_info, DeviceInfo, InfoError, InfoFlags, INFO_MAX_LEN};
pub use marker::{
    seq_distance, wire_seq, FinCode, FrameKind, MarkerFlags, NackCode, CONTROL_FRAME_LEN,
    DATA_HEADER_LEN, MAX_WINDOW, MIN_FRAME_CAPACITY, SEQ_MODULUS,
};
pub use packetizer::{
    BufferSink, BufferSource, Fill, Fragment, Packetizer, PayloadSink, PayloadSource, Poll,
};
