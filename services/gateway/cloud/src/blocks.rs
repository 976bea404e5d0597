//! Block queue between the notification-sized device link and the
//! block-sized cloud transport.
//!
//! Producers append arbitrary chunks; the queue packs them into fixed
//! capacity [`Block`]s. Consumers either copy bytes out ([`BlockQueue::consume`])
//! or take whole sealed blocks ([`BlockQueue::pop_block`]).
//!
//! The consumer-waiting flag is edge triggered: a consumer that found the
//! queue empty is woken by exactly one subsequent produce (or abort).

use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use tracing::debug;

/// Default block size used towards the cloud
pub const DEFAULT_BLOCK_SIZE: usize = 1024;

/// Fixed capacity byte buffer tagged with the end-of-stream flag
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    data: BytesMut,
    capacity: usize,
    last: bool,
}

impl Block {
    /// Create an empty block
    pub fn new(capacity: usize) -> Self {
        Self {
            data: BytesMut::with_capacity(capacity),
            capacity,
            last: false,
        }
    }

    /// Number of bytes held
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the block holds no bytes
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Whether no more bytes fit
    pub fn is_full(&self) -> bool {
        self.data.len() >= self.capacity
    }

    /// Whether this block ends the stream
    pub fn is_last(&self) -> bool {
        self.last
    }

    /// Block bytes
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Append as much of `chunk` as fits, returning the number of bytes taken
    fn append(&mut self, chunk: &[u8]) -> usize {
        let n = chunk.len().min(self.capacity - self.data.len());
        self.data.extend_from_slice(&chunk[..n]);
        n
    }

    /// Convert into immutable bytes
    pub fn freeze(self) -> Bytes {
        self.data.freeze()
    }
}

/// Result of [`BlockQueue::produce`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Produce {
    /// Bytes were queued; `wake` is set when a waiting consumer must be signaled
    Queued {
        /// Consumer must be signaled
        wake: bool,
    },
    /// The queue was aborted or already closed
    Rejected,
}

/// Result of [`BlockQueue::consume`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Consume {
    /// `len` bytes were copied; `last` ends the stream
    Data {
        /// Bytes copied into the destination
        len: usize,
        /// Copied span ends the stream
        last: bool,
    },
    /// Nothing queued yet; the consumer will be woken by the next produce
    NoData,
}

/// FIFO of blocks with abort propagation
#[derive(Debug)]
pub struct BlockQueue {
    blocks: VecDeque<Block>,
    current: Option<Block>,
    offset: usize,
    block_size: usize,
    /// Producer delivered its last chunk
    closed: bool,
    /// Consumer observed the end of the stream
    complete: bool,
    aborted: bool,
    consumer_waiting: bool,
}

impl BlockQueue {
    /// Create an empty queue packing into blocks of `block_size` bytes
    pub fn new(block_size: usize) -> Self {
        Self {
            blocks: VecDeque::new(),
            current: None,
            offset: 0,
            block_size: block_size.max(1),
            closed: false,
            complete: false,
            aborted: false,
            consumer_waiting: false,
        }
    }

    /// Mark the consumer as waiting, so the first produce signals it
    pub fn with_consumer_waiting(mut self) -> Self {
        self.consumer_waiting = true;
        self
    }

    /// Append `bytes` to the tail, marking the end of stream when `is_last`
    pub fn produce(&mut self, bytes: &[u8], is_last: bool) -> Produce {
        if self.aborted || self.closed {
            debug!(
                "Rejecting {} bytes (aborted={}, closed={})",
                bytes.len(),
                self.aborted,
                self.closed
            );
            return Produce::Rejected;
        }

        let mut rest = bytes;
        while !rest.is_empty() {
            if self.blocks.back().map_or(true, Block::is_full) {
                self.blocks.push_back(Block::new(self.block_size));
            }
            let Some(tail) = self.blocks.back_mut() else {
                break;
            };
            let n = tail.append(rest);
            rest = &rest[n..];
        }

        if is_last {
            self.closed = true;
            match self.blocks.back_mut() {
                Some(tail) => tail.last = true,
                None => {
                    let mut block = Block::new(self.block_size);
                    block.last = true;
                    self.blocks.push_back(block);
                }
            }
        }

        let produced = !bytes.is_empty() || is_last;
        let wake = produced && self.current.is_none() && std::mem::take(&mut self.consumer_waiting);
        Produce::Queued { wake }
    }

    /// Copy bytes from the current block into `dst`
    pub fn consume(&mut self, dst: &mut [u8]) -> Consume {
        if self.complete {
            return Consume::NoData;
        }

        loop {
            if self.current.is_none() {
                match self.blocks.pop_front() {
                    Some(block) => {
                        self.current = Some(block);
                        self.offset = 0;
                    }
                    None if self.aborted => {
                        self.complete = true;
                        return Consume::Data { len: 0, last: true };
                    }
                    None => {
                        self.consumer_waiting = true;
                        return Consume::NoData;
                    }
                }
            }

            let Some(block) = self.current.as_ref() else {
                continue;
            };
            let n = dst.len().min(block.len() - self.offset);
            dst[..n].copy_from_slice(&block.data()[self.offset..self.offset + n]);
            self.offset += n;

            let exhausted = self.offset >= block.len();
            let last = exhausted && block.is_last();
            if exhausted {
                self.current = None;
            }
            if last {
                self.complete = true;
            }

            if n > 0 || last || dst.is_empty() {
                return Consume::Data { len: n, last };
            }
        }
    }

    /// Take the next sealed block: full, last, or followed by another block.
    ///
    /// Abort seals the tail, so an aborted queue hands out what it holds and
    /// then completes.
    pub fn pop_block(&mut self) -> Option<Block> {
        if self.complete {
            return None;
        }

        let sealed = match self.blocks.front() {
            Some(front) => {
                front.is_full() || front.is_last() || self.blocks.len() > 1 || self.aborted
            }
            None => false,
        };
        if !sealed {
            if self.aborted && self.blocks.is_empty() {
                self.complete = true;
            }
            return None;
        }

        let block = self.blocks.pop_front()?;
        if block.is_last() {
            self.complete = true;
        }
        Some(block)
    }

    /// Abort the stream; returns whether a waiting consumer must be signaled
    pub fn abort(&mut self) -> bool {
        if self.aborted {
            return false;
        }
        self.aborted = true;

        if self.is_drained() && !self.complete && !self.closed {
            // Empty queue: finalize right away so the consumer sees the end
            self.closed = true;
            let mut block = Block::new(self.block_size);
            block.last = true;
            self.blocks.push_back(block);
        }

        std::mem::take(&mut self.consumer_waiting)
    }

    /// Whether no bytes are queued or being drained
    pub fn is_drained(&self) -> bool {
        self.blocks.is_empty() && self.current.is_none()
    }

    /// Whether the producer delivered its last chunk
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Whether the consumer saw the end of the stream
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Whether the stream was aborted
    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    /// Whether a consumer is waiting to be signaled
    pub fn consumer_waiting(&self) -> bool {
        self.consumer_waiting
    }

    /// Number of queued blocks, not counting the one being drained
    pub fn queued_blocks(&self) -> usize {
        self.blocks.len()
    }
}
