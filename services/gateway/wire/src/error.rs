//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Frame shorter than the minimum header for its kind
    #[error("incomplete frame")]
    Incomplete,

    /// Reserved marker bits nonzero
    #[error("reserved bits nonzero")]
    Reserved,

    /// Unknown NACK or FIN reason code
    #[error("unknown code {0}")]
    Code(u8),

    /// Advertised window outside the supported range
    #[error("invalid window {0}")]
    Window(u8),

    /// Destination capacity too small to carry a frame
    #[error("capacity too small: {0}")]
    Capacity(usize),
}

/// Packetizer errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PacketizerError {
    /// Wire level problem (e.g. capacity)
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// The pull source failed
    #[error("source failed: {0}")]
    Source(String),

    /// The last fragment was already produced
    #[error("packetizer finished")]
    Finished,
}

/// Reassembly sink errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    /// Payload exceeds the sink's bound
    #[error("payload exceeds {limit} bytes")]
    Overflow {
        /// Maximum accepted payload length
        limit: usize,
    },

    /// The sink no longer accepts data
    #[error("sink rejected data: {0}")]
    Rejected(String),
}
