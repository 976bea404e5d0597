//! File-based cloud backend for offline operation.
//!
//! Uplinks are appended to per-session files below the data directory and
//! summarized in a JSON sidecar once finished. Downlinks are always empty.
//! The server certificate is read from a local PEM or DER file.
//!
//! ```text
//! <data_dir>/uplink/<peer>-<id>.part   while the uplink is open
//! <data_dir>/uplink/<peer>-<id>.bin    finished payload
//! <data_dir>/uplink/<peer>-<id>.json   summary
//! <data_dir>/devices/<peer>.der        device certificates
//! ```

use crate::{CloudError, CloudService, Peer, UplinkHandle};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Configuration for the file backend
#[derive(Clone, Debug)]
pub struct FileCloudConfig {
    /// Base data directory
    pub data_dir: PathBuf,
    /// Server certificate file
    pub server_cert_path: Option<PathBuf>,
}

impl Default for FileCloudConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./pouchdata"),
            server_cert_path: None,
        }
    }
}

/// Summary written next to a finished uplink
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, Eq)]
pub struct UplinkSummary {
    /// Session the uplink belongs to
    pub peer: String,
    /// Uplink identifier
    pub id: u64,
    /// Number of blocks received
    pub blocks: u32,
    /// Total payload bytes
    pub bytes: u64,
}

/// File-based cloud implementation
pub struct FileCloud {
    config: FileCloudConfig,
    /// Per-uplink progress: handle -> (blocks, bytes)
    progress: Arc<DashMap<UplinkHandle, (u32, u64)>>,
}

impl FileCloud {
    /// Create a file backend, creating its directories
    pub async fn new(config: FileCloudConfig) -> Result<Self, CloudError> {
        std::fs::create_dir_all(config.data_dir.join("uplink"))?;
        std::fs::create_dir_all(config.data_dir.join("devices"))?;
        info!("File cloud backend at {}", config.data_dir.display());

        Ok(Self {
            config,
            progress: Arc::new(DashMap::new()),
        })
    }

    fn uplink_path(&self, handle: UplinkHandle, ext: &str) -> PathBuf {
        self.config
            .data_dir
            .join("uplink")
            .join(format!("{}-{}.{}", handle.peer, handle.id, ext))
    }

    /// Read a finished uplink summary
    pub async fn summary(&self, handle: UplinkHandle) -> Result<UplinkSummary, CloudError> {
        let content = std::fs::read_to_string(self.uplink_path(handle, "json"))?;
        Ok(serde_json::from_str(&content)?)
    }
}

#[async_trait]
impl CloudService for FileCloud {
    async fn upload_block(
        &self,
        handle: UplinkHandle,
        index: u32,
        block: Bytes,
        is_last: bool,
    ) -> Result<(), CloudError> {
        debug!(
            "FileCloud upload uplink={} index={} len={} last={}",
            handle,
            index,
            block.len(),
            is_last
        );

        let mut progress = self.progress.entry(handle).or_insert((0, 0));
        if index != progress.0 {
            return Err(CloudError::Invalid(format!(
                "block {} out of order, expected {}",
                index, progress.0
            )));
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.uplink_path(handle, "part"))?;
        file.write_all(&block)?;

        progress.0 += 1;
        progress.1 += block.len() as u64;
        Ok(())
    }

    async fn finish_uplink(&self, handle: UplinkHandle) -> Result<Vec<Bytes>, CloudError> {
        let (blocks, bytes) = self
            .progress
            .remove(&handle)
            .map(|(_, p)| p)
            .unwrap_or_default();

        let part = self.uplink_path(handle, "part");
        let bin = self.uplink_path(handle, "bin");
        if part.exists() {
            std::fs::rename(&part, &bin)?;
        } else {
            std::fs::write(&bin, b"")?;
        }

        let summary = UplinkSummary {
            peer: handle.peer.to_string(),
            id: handle.id,
            blocks,
            bytes,
        };
        std::fs::write(
            self.uplink_path(handle, "json"),
            serde_json::to_string_pretty(&summary)?,
        )?;
        info!("Stored uplink {} ({} blocks, {} bytes)", handle, blocks, bytes);

        // Offline: nothing to send back
        Ok(Vec::new())
    }

    async fn cancel_uplink(&self, handle: UplinkHandle) -> Result<(), CloudError> {
        self.progress.remove(&handle);
        let part = self.uplink_path(handle, "part");
        if part.exists() {
            warn!("Discarding partial uplink {}", handle);
            std::fs::remove_file(part)?;
        }
        Ok(())
    }

    async fn fetch_server_certificate(&self) -> Result<Bytes, CloudError> {
        let path = self
            .config
            .server_cert_path
            .as_ref()
            .ok_or_else(|| CloudError::NotFound("server certificate path".to_string()))?;
        Ok(Bytes::from(std::fs::read(path)?))
    }

    async fn submit_device_certificate(&self, peer: Peer, der: Bytes) -> Result<(), CloudError> {
        let path = self
            .config
            .data_dir
            .join("devices")
            .join(format!("{}.der", peer));
        std::fs::write(&path, &der)?;
        info!("Stored device certificate for {} ({} bytes)", peer, der.len());
        Ok(())
    }
}
