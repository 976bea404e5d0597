//! Cloud to device data path.
//!
//! Blocks answering an uplink are queued in a [`Downlink`] as they arrive;
//! the downlink sender pulls them through [`DownlinkSource`].

use crate::blocks::{BlockQueue, Consume, Produce, DEFAULT_BLOCK_SIZE};
use crate::CloudError;
use gateway_wire::{FinCode, Fill, PacketizerError, PayloadSource};
use tracing::{debug, warn};

/// Downlink queue fed by cloud response blocks
#[derive(Debug)]
pub struct Downlink {
    queue: BlockQueue,
    ended: bool,
}

impl Downlink {
    /// Open a downlink; the first block signals the waiting consumer
    pub fn open(block_size: usize) -> Self {
        Self {
            queue: BlockQueue::new(block_size).with_consumer_waiting(),
            ended: false,
        }
    }

    /// Queue a response block; returns whether the consumer must be woken
    pub fn on_block(&mut self, data: &[u8], is_last: bool) -> bool {
        match self.queue.produce(data, is_last) {
            Produce::Queued { wake } => wake,
            Produce::Rejected => {
                debug!("Dropping {} downlink bytes", data.len());
                false
            }
        }
    }

    /// The cloud finished the response; returns whether the consumer must be woken
    pub fn on_end(&mut self, result: Result<(), CloudError>) -> bool {
        if self.ended {
            return false;
        }
        self.ended = true;

        match result {
            Ok(()) if self.queue.is_closed() => false,
            // Cloud had nothing (more) to say: close with an empty last block
            Ok(()) => self.on_block(&[], true),
            Err(e) => {
                warn!("Downlink failed: {}", e);
                self.queue.abort()
            }
        }
    }

    /// Abort the downlink; returns whether the consumer must be woken
    pub fn abort(&mut self) -> bool {
        self.ended = true;
        self.queue.abort()
    }

    /// Copy queued bytes into `dst`
    pub fn consume(&mut self, dst: &mut [u8]) -> Consume {
        self.queue.consume(dst)
    }

    /// Whether the cloud side is done
    pub fn is_ended(&self) -> bool {
        self.ended
    }

    /// Whether the downlink was aborted
    pub fn is_aborted(&self) -> bool {
        self.queue.is_aborted()
    }

    /// Whether the whole response was consumed
    pub fn is_complete(&self) -> bool {
        self.queue.is_complete()
    }
}

impl Default for Downlink {
    fn default() -> Self {
        Self::open(DEFAULT_BLOCK_SIZE)
    }
}

/// Pull source handing downlink bytes to the packetizer
#[derive(Debug, Default)]
pub struct DownlinkSource {
    downlink: Downlink,
}

impl DownlinkSource {
    /// Wrap a downlink
    pub fn new(downlink: Downlink) -> Self {
        Self { downlink }
    }

    /// Access the downlink
    pub fn downlink(&self) -> &Downlink {
        &self.downlink
    }

    /// Mutable access to the downlink, to feed cloud events
    pub fn downlink_mut(&mut self) -> &mut Downlink {
        &mut self.downlink
    }
}

impl PayloadSource for DownlinkSource {
    fn fill(&mut self, dst: &mut [u8]) -> Result<Fill, PacketizerError> {
        Ok(match self.downlink.consume(dst) {
            Consume::Data { len, last } => Fill::Data { len, last },
            Consume::NoData => Fill::NotYet,
        })
    }

    fn fin_code(&self) -> FinCode {
        if self.downlink.is_aborted() {
            FinCode::Aborted
        } else {
            FinCode::Ok
        }
    }
}
