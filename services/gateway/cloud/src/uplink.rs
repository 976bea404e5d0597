//! Device to cloud data path.
//!
//! The uplink receiver pushes notification-sized chunks into an [`Uplink`],
//! which packs them into blocks and uploads sealed blocks one at a time.

use crate::blocks::{BlockQueue, Produce};
use crate::{CloudClient, CloudError, Peer, UplinkHandle};
use gateway_wire::{PayloadSink, SinkError};
use tracing::{debug, error, info, warn};

/// How an uplink ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UplinkResult {
    /// Every block reached the cloud
    Success,
    /// A block could not be submitted locally
    LocalError,
    /// The cloud failed an upload
    CloudError,
}

/// Uplink packing device data into cloud blocks
#[derive(Debug)]
pub struct Uplink {
    handle: UplinkHandle,
    queue: BlockQueue,
    next_index: u32,
    in_flight: Option<u32>,
    result: Option<UplinkResult>,
}

impl Uplink {
    /// Open an uplink for `peer`
    pub fn begin(
        peer: Peer,
        block_size: usize,
        cloud: &mut dyn CloudClient,
    ) -> Result<Self, CloudError> {
        let handle = cloud.begin_uplink(peer)?;
        info!("Uplink {} opened (block size {})", handle, block_size);

        Ok(Self {
            handle,
            queue: BlockQueue::new(block_size),
            next_index: 0,
            in_flight: None,
            result: None,
        })
    }

    /// Cloud handle of this uplink
    pub fn handle(&self) -> UplinkHandle {
        self.handle
    }

    /// Outcome, once ended
    pub fn result(&self) -> Option<UplinkResult> {
        self.result
    }

    /// Whether the device delivered its whole stream
    pub fn device_done(&self) -> bool {
        self.queue.is_closed()
    }

    /// Index of the block currently being uploaded
    pub fn in_flight(&self) -> Option<u32> {
        self.in_flight
    }

    /// Upload the next sealed block if none is in flight
    pub fn pump(&mut self, cloud: &mut dyn CloudClient) -> Option<UplinkResult> {
        if self.result.is_some() || self.in_flight.is_some() {
            return None;
        }

        loop {
            let Some(block) = self.queue.pop_block() else {
                if self.queue.is_complete() {
                    return Some(self.end(UplinkResult::Success, cloud));
                }
                return None;
            };

            if block.is_empty() {
                if !block.is_last() {
                    warn!("Skipping zero length block on uplink {}", self.handle);
                }
                continue;
            }

            let index = self.next_index;
            self.next_index += 1;
            let is_last = block.is_last();
            debug!(
                "Uploading block {} of size {} (last={}) on uplink {}",
                index,
                block.len(),
                is_last,
                self.handle
            );

            match cloud.upload_block(self.handle, index, block.freeze(), is_last) {
                Ok(()) => {
                    self.in_flight = Some(index);
                    return None;
                }
                Err(e) => {
                    error!("Failed to submit block {}: {}", index, e);
                    return Some(self.end(UplinkResult::LocalError, cloud));
                }
            }
        }
    }

    /// Handle completion of the in-flight upload
    pub fn on_block_uploaded(
        &mut self,
        index: u32,
        result: Result<(), CloudError>,
        cloud: &mut dyn CloudClient,
    ) -> Option<UplinkResult> {
        if self.result.is_some() || self.in_flight != Some(index) {
            warn!(
                "Unexpected completion of block {} on uplink {}",
                index, self.handle
            );
            return None;
        }
        self.in_flight = None;

        if let Err(e) = result {
            error!("Failed to deliver block {}: {}", index, e);
            return Some(self.end(UplinkResult::CloudError, cloud));
        }

        self.pump(cloud)
    }

    /// Stop the uplink; queued data is dropped
    pub fn abort(&mut self, cloud: &mut dyn CloudClient) {
        if self.result.is_none() {
            self.end(UplinkResult::LocalError, cloud);
        }
    }

    fn end(&mut self, result: UplinkResult, cloud: &mut dyn CloudClient) -> UplinkResult {
        self.result = Some(result);
        self.in_flight = None;
        match result {
            UplinkResult::Success => {
                info!("Uplink {} finished ({} blocks)", self.handle, self.next_index);
                cloud.finish_uplink(self.handle);
            }
            _ => {
                warn!("Uplink {} ended with {:?}", self.handle, result);
                self.queue.abort();
                cloud.cancel_uplink(self.handle);
            }
        }
        result
    }
}

impl PayloadSink for Uplink {
    fn push(&mut self, chunk: &[u8], _first: bool, last: bool) -> Result<(), SinkError> {
        match self.queue.produce(chunk, last) {
            Produce::Queued { .. } => Ok(()),
            Produce::Rejected => Err(SinkError::Rejected(format!(
                "uplink {} no longer accepts data",
                self.handle
            ))),
        }
    }
}
