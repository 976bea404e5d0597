//! Cloud side of the pouch gateway: block queues, certificate store and
//! pluggable cloud backends.
//!
//! This crate bridges the notification-sized device link and the
//! block-oriented cloud transport. The queue types ([`BlockQueue`],
//! [`Uplink`], [`Downlink`]) are synchronous and driven by the session
//! engine; completions of cloud work come back as [`CloudEvent`]s. The
//! asynchronous [`CloudService`] trait is what the gateway binary runs
//! against, with in-memory and file-based backends.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backend;
pub mod blocks;
pub mod certstore;
pub mod downlink;
pub mod uplink;

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Identifier of a device session as seen by the cloud
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct Peer(pub u64);

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Handle of one uplink (and the downlink answering it)
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct UplinkHandle {
    /// Session the uplink belongs to
    pub peer: Peer,
    /// Identifier unique within the gateway process
    pub id: u64,
}

impl fmt::Display for UplinkHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.peer, self.id)
    }
}

/// Cloud errors
#[derive(Error, Debug)]
pub enum CloudError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Entry not found
    #[error("Not found: {0}")]
    NotFound(String),
    /// The cloud refused the request
    #[error("Rejected: {0}")]
    Rejected(String),
    /// No cloud connection
    #[error("Cloud unavailable")]
    Unavailable,
    /// Invalid operation
    #[error("Invalid operation: {0}")]
    Invalid(String),
    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Completion of cloud work started through a [`CloudClient`]
#[derive(Debug)]
pub enum CloudEvent {
    /// An uplink block upload finished
    BlockUploaded {
        /// Uplink the block belongs to
        handle: UplinkHandle,
        /// Block index
        index: u32,
        /// Upload outcome
        result: Result<(), CloudError>,
    },
    /// A block of the downlink answering an uplink arrived
    DownlinkBlock {
        /// Uplink being answered
        handle: UplinkHandle,
        /// Block bytes
        data: Bytes,
        /// Final block of the response
        is_last: bool,
    },
    /// The downlink ended
    DownlinkEnded {
        /// Uplink being answered
        handle: UplinkHandle,
        /// Outcome of the response transfer
        result: Result<(), CloudError>,
    },
    /// The cloud accepted or refused a device certificate
    DeviceCertSubmitted {
        /// Session that submitted the certificate
        peer: Peer,
        /// Verification outcome
        result: Result<(), CloudError>,
    },
}

impl CloudEvent {
    /// The uplink this event belongs to, if it belongs to one
    pub fn handle(&self) -> Option<UplinkHandle> {
        match self {
            CloudEvent::BlockUploaded { handle, .. }
            | CloudEvent::DownlinkBlock { handle, .. }
            | CloudEvent::DownlinkEnded { handle, .. } => Some(*handle),
            CloudEvent::DeviceCertSubmitted { .. } => None,
        }
    }

    /// The session this event belongs to
    pub fn peer(&self) -> Peer {
        match self {
            CloudEvent::DeviceCertSubmitted { peer, .. } => *peer,
            CloudEvent::BlockUploaded { handle, .. }
            | CloudEvent::DownlinkBlock { handle, .. }
            | CloudEvent::DownlinkEnded { handle, .. } => handle.peer,
        }
    }
}

/// Synchronous submission interface used by the session engine.
///
/// Every call returns immediately; results of uploads and the downlink
/// response are delivered later as [`CloudEvent`]s.
pub trait CloudClient {
    /// Open an uplink for `peer`
    fn begin_uplink(&mut self, peer: Peer) -> Result<UplinkHandle, CloudError>;

    /// Submit one block; completion arrives as [`CloudEvent::BlockUploaded`]
    fn upload_block(
        &mut self,
        handle: UplinkHandle,
        index: u32,
        block: Bytes,
        is_last: bool,
    ) -> Result<(), CloudError>;

    /// All blocks were uploaded; the downlink response follows as events
    fn finish_uplink(&mut self, handle: UplinkHandle);

    /// Drop the uplink; no further events are delivered for it
    fn cancel_uplink(&mut self, handle: UplinkHandle);

    /// Hand a device certificate to the cloud for verification; the verdict
    /// arrives as [`CloudEvent::DeviceCertSubmitted`]
    fn submit_device_certificate(&mut self, peer: Peer, der: Bytes) -> Result<(), CloudError>;
}

/// Asynchronous cloud backend
#[async_trait]
pub trait CloudService: Send + Sync {
    /// Store one uplink block
    async fn upload_block(
        &self,
        handle: UplinkHandle,
        index: u32,
        block: Bytes,
        is_last: bool,
    ) -> Result<(), CloudError>;

    /// Close an uplink and fetch the downlink blocks answering it
    async fn finish_uplink(&self, handle: UplinkHandle) -> Result<Vec<Bytes>, CloudError>;

    /// Discard an uplink
    async fn cancel_uplink(&self, handle: UplinkHandle) -> Result<(), CloudError>;

    /// Fetch the current server certificate (PEM or DER)
    async fn fetch_server_certificate(&self) -> Result<Bytes, CloudError>;

    /// Store a device certificate
    async fn submit_device_certificate(&self, peer: Peer, der: Bytes) -> Result<(), CloudError>;
}

/// Cloud backend configuration
#[derive(Clone, Debug, Default)]
pub enum CloudMode {
    /// In-memory cloud (dev/tests/simulation)
    #[default]
    Memory,
    /// Offline operation: uplinks are written below a directory
    File {
        /// Data directory path
        data_dir: PathBuf,
        /// Server certificate file served to devices
        server_cert_path: Option<PathBuf>,
    },
}

// Re-export main types
pub use backend::file::{FileCloud, FileCloudConfig, UplinkSummary};
pub use backend::mem::{CloudResponse, MemoryCloud};
pub use blocks::{Block, BlockQueue, Consume, Produce, DEFAULT_BLOCK_SIZE};
pub use certstore::{
    CertError, CertificateStore, DeviceCertBuffer, ServerCertSource, ServerCertificate,
    DEFAULT_DEVICE_CERT_MAX_LEN,
};
pub use downlink::{Downlink, DownlinkSource};
pub use uplink::{Uplink, UplinkResult};

/// Create a cloud backend from configuration
pub async fn from_mode(mode: CloudMode) -> Result<Arc<dyn CloudService>, CloudError> {
    match mode {
        CloudMode::Memory => Ok(Arc::new(MemoryCloud::new())),
        CloudMode::File {
            data_dir,
            server_cert_path,
        } => {
            let config = FileCloudConfig {
                data_dir,
                server_cert_path,
            };
            Ok(Arc::new(FileCloud::new(config).await?))
        }
    }
}
