//! In-memory cloud backend for development, tests and simulation

use crate::blocks::DEFAULT_BLOCK_SIZE;
use crate::{CloudError, CloudService, Peer, UplinkHandle};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// What the cloud answers an uplink with
#[derive(Debug, Clone, Default)]
pub enum CloudResponse {
    /// Empty downlink
    #[default]
    Empty,
    /// Send the uplinked payload back
    Echo,
    /// Fixed payload
    Fixed(Bytes),
}

/// In-memory cloud implementation
pub struct MemoryCloud {
    /// Open uplinks: handle -> blocks received so far
    open: Arc<DashMap<UplinkHandle, Vec<Bytes>>>,
    /// Completed uplink payloads per peer, in completion order
    completed: Arc<DashMap<Peer, Vec<Bytes>>>,
    /// Device certificates per peer
    device_certs: Arc<DashMap<Peer, Bytes>>,
    server_cert: RwLock<Option<Bytes>>,
    response: CloudResponse,
    block_size: usize,
}

impl MemoryCloud {
    /// Create an empty in-memory cloud answering with empty downlinks
    pub fn new() -> Self {
        Self {
            open: Arc::new(DashMap::new()),
            completed: Arc::new(DashMap::new()),
            device_certs: Arc::new(DashMap::new()),
            server_cert: RwLock::new(None),
            response: CloudResponse::Empty,
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }

    /// Set how uplinks are answered
    pub fn with_response(mut self, response: CloudResponse) -> Self {
        self.response = response;
        self
    }

    /// Set the downlink block size
    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size.max(1);
        self
    }

    /// Set the server certificate served by [`CloudService::fetch_server_certificate`]
    pub async fn set_server_certificate(&self, cert: Bytes) {
        *self.server_cert.write().await = Some(cert);
    }

    /// Completed uplink payloads of a peer
    pub fn uplinks(&self, peer: Peer) -> Vec<Bytes> {
        self.completed
            .get(&peer)
            .map(|v| v.clone())
            .unwrap_or_default()
    }

    /// Device certificate submitted for a peer
    pub fn device_certificate(&self, peer: Peer) -> Option<Bytes> {
        self.device_certs.get(&peer).map(|v| v.clone())
    }

    /// Number of uplinks still open
    pub fn open_uplinks(&self) -> usize {
        self.open.len()
    }

    fn split(&self, payload: Bytes) -> Vec<Bytes> {
        let mut blocks = Vec::new();
        let mut offset = 0;
        while offset < payload.len() {
            let end = (offset + self.block_size).min(payload.len());
            blocks.push(payload.slice(offset..end));
            offset = end;
        }
        blocks
    }
}

impl Default for MemoryCloud {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CloudService for MemoryCloud {
    async fn upload_block(
        &self,
        handle: UplinkHandle,
        index: u32,
        block: Bytes,
        is_last: bool,
    ) -> Result<(), CloudError> {
        debug!(
            "Cloud upload uplink={} index={} len={} last={}",
            handle,
            index,
            block.len(),
            is_last
        );

        let mut blocks = self.open.entry(handle).or_insert_with(Vec::new);
        if index as usize != blocks.len() {
            return Err(CloudError::Invalid(format!(
                "block {} out of order, expected {}",
                index,
                blocks.len()
            )));
        }
        blocks.push(block);
        Ok(())
    }

    async fn finish_uplink(&self, handle: UplinkHandle) -> Result<Vec<Bytes>, CloudError> {
        let blocks = self
            .open
            .remove(&handle)
            .map(|(_, blocks)| blocks)
            .unwrap_or_default();

        let mut payload = BytesMut::new();
        for block in &blocks {
            payload.extend_from_slice(block);
        }
        let payload = payload.freeze();
        debug!("Cloud finish uplink={} len={}", handle, payload.len());

        self.completed
            .entry(handle.peer)
            .or_insert_with(Vec::new)
            .push(payload.clone());

        Ok(match &self.response {
            CloudResponse::Empty => Vec::new(),
            CloudResponse::Echo => self.split(payload),
            CloudResponse::Fixed(bytes) => self.split(bytes.clone()),
        })
    }

    async fn cancel_uplink(&self, handle: UplinkHandle) -> Result<(), CloudError> {
        debug!("Cloud cancel uplink={}", handle);
        self.open.remove(&handle);
        Ok(())
    }

    async fn fetch_server_certificate(&self) -> Result<Bytes, CloudError> {
        self.server_cert
            .read()
            .await
            .clone()
            .ok_or_else(|| CloudError::NotFound("server certificate".to_string()))
    }

    async fn submit_device_certificate(&self, peer: Peer, der: Bytes) -> Result<(), CloudError> {
        debug!("Cloud device certificate peer={} len={}", peer, der.len());
        if der.is_empty() {
            return Err(CloudError::Rejected("empty certificate".to_string()));
        }
        self.device_certs.insert(peer, der);
        Ok(())
    }
}
