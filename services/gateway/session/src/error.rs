//! Error types for transfers and sessions.

use crate::transport::{ConnId, Endpoint};
use gateway_cloud::{CertError, CloudError, UplinkResult};
use gateway_wire::{NackCode, PacketizerError, SinkError, WireError};
use thiserror::Error;

/// Failures of the wireless link
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The connection is gone
    #[error("not connected")]
    NotConnected,

    /// A write could not be submitted or was rejected by the peer
    #[error("write to handle {handle:#06x} failed: {reason}")]
    Write {
        /// Attribute handle written to
        handle: u16,
        /// Reason reported by the stack
        reason: String,
    },

    /// Service discovery could not be started
    #[error("discovery failed: {0}")]
    Discovery(String),

    /// Enabling notifications failed
    #[error("subscribe to handle {handle:#06x} failed: {reason}")]
    Subscribe {
        /// CCC descriptor handle
        handle: u16,
        /// Reason reported by the stack
        reason: String,
    },
}

/// Failures of one windowed transfer
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    /// The link failed underneath the transfer
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The peer rejected the transfer
    #[error("rejected by peer: {0:?}")]
    Nack(NackCode),

    /// A frame arrived outside the expected sequence
    #[error("out of sequence: expected {expected}, got {got}")]
    OutOfSequence {
        /// Sequence the receiver was waiting for
        expected: u8,
        /// Sequence that arrived
        got: u8,
    },

    /// Fragment markers contradict the stream position
    #[error("unexpected fragment: {0}")]
    Fragment(&'static str),

    /// The peer closed the stream with FIN(Aborted)
    #[error("peer aborted the transfer")]
    PeerAborted,

    /// The peer closed the stream in the middle of a payload
    #[error("peer closed the stream prematurely")]
    PrematureClose,

    /// A frame could not be decoded
    #[error("malformed frame: {0}")]
    Malformed(#[from] WireError),

    /// The reassembly sink refused a fragment
    #[error("sink error: {0}")]
    Sink(#[from] SinkError),

    /// The payload source failed
    #[error("source error: {0}")]
    Source(#[from] PacketizerError),
}

/// Reasons a session ends early
#[derive(Error, Debug)]
pub enum SessionError {
    /// Neither the 16-bit nor the 128-bit service UUID was found
    #[error("pouch service not found")]
    ServiceNotFound,

    /// A required characteristic or its CCC descriptor is missing
    #[error("missing {0} endpoint")]
    MissingEndpoint(Endpoint),

    /// Link failure outside of a transfer
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// A transfer on one endpoint failed
    #[error("{endpoint} transfer failed: {source}")]
    Transfer {
        /// Endpoint the transfer ran on
        endpoint: Endpoint,
        /// Underlying failure
        #[source]
        source: TransferError,
    },

    /// Certificate exchange failed
    #[error("certificate error: {0}")]
    Cert(#[from] CertError),

    /// The cloud could not open the uplink
    #[error("cloud error: {0}")]
    Cloud(#[from] CloudError),

    /// The uplink ended without reaching the cloud
    #[error("uplink ended with {0:?}")]
    Uplink(UplinkResult),

    /// The cloud aborted the downlink
    #[error("downlink aborted by the cloud")]
    DownlinkAborted,

    /// The peer disconnected
    #[error("peer disconnected")]
    Disconnected,
}

impl SessionError {
    /// Wrap a transfer failure on `endpoint`
    pub fn transfer(endpoint: Endpoint, source: TransferError) -> Self {
        SessionError::Transfer { endpoint, source }
    }
}

/// Session manager errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ManagerError {
    /// Every session slot is in use
    #[error("no free session slot (capacity {0})")]
    NoFreeSlot(usize),

    /// The connection already has a session
    #[error("connection {0} already has a session")]
    Duplicate(ConnId),

    /// No session exists for the connection
    #[error("unknown connection {0}")]
    UnknownConnection(ConnId),
}
