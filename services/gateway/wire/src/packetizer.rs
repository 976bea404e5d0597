//! Outbound fragmentation.
//!
//! A [`Packetizer`] pulls bytes from a [`PayloadSource`] and cuts them into
//! fragments that fit the negotiated frame capacity. Sources either hold the
//! whole payload up front ([`BufferSource`]) or hand out bytes as they
//! arrive, in which case the packetizer reports [`Poll::NotReady`] until the
//! source has more.
//!
//! The inbound counterpart is [`PayloadSink`]: the receiving side pushes each
//! in-sequence fragment into it as it arrives.

use crate::error::{PacketizerError, SinkError};
use crate::frame::encode_data;
use crate::marker::{FinCode, DATA_HEADER_LEN, MIN_FRAME_CAPACITY};
use crate::WireError;
use bytes::{Bytes, BytesMut};
use tracing::{debug, trace};

/// Result of a single source fill
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fill {
    /// `len` bytes were copied; `last` is set once the stream is exhausted
    Data {
        /// Bytes written into the destination
        len: usize,
        /// No more bytes will follow
        last: bool,
    },
    /// Nothing available yet
    NotYet,
}

/// Pull side of a payload stream
pub trait PayloadSource {
    /// Copy up to `dst.len()` bytes into `dst`
    fn fill(&mut self, dst: &mut [u8]) -> Result<Fill, PacketizerError>;

    /// Code to close the stream with once the last byte was handed out
    fn fin_code(&self) -> FinCode {
        FinCode::Ok
    }
}

/// Source over a buffer that is fully known up front
#[derive(Debug, Clone)]
pub struct BufferSource {
    data: Bytes,
    offset: usize,
}

impl BufferSource {
    /// Create a source over `data`
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            offset: 0,
        }
    }

    /// Bytes not yet handed out
    pub fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }
}

impl PayloadSource for BufferSource {
    fn fill(&mut self, dst: &mut [u8]) -> Result<Fill, PacketizerError> {
        let len = dst.len().min(self.remaining());
        dst[..len].copy_from_slice(&self.data[self.offset..self.offset + len]);
        self.offset += len;

        Ok(Fill::Data {
            len,
            last: self.remaining() == 0,
        })
    }
}

/// One outbound fragment, not yet bound to a sequence number
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    /// First fragment of the stream
    pub first: bool,
    /// Last fragment of the stream
    pub last: bool,
    /// Fragment bytes
    pub payload: Bytes,
}

impl Fragment {
    /// Encode as a DATA frame carrying `seq`
    pub fn encode(&self, seq: u32) -> Bytes {
        encode_data(seq, self.first, self.last, &self.payload)
    }
}

/// Outcome of asking for the next fragment
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Poll {
    /// A fragment is ready to be sent
    Ready(Fragment),
    /// The source has nothing yet; ask again once it signals data
    NotReady,
}

/// Cuts a payload stream into fragments
#[derive(Debug)]
pub struct Packetizer<S> {
    source: S,
    started: bool,
    finished: bool,
}

impl<S: PayloadSource> Packetizer<S> {
    /// Create a packetizer over `source`
    pub fn new(source: S) -> Self {
        Self {
            source,
            started: false,
            finished: false,
        }
    }

    /// Produce the next fragment for a frame of at most `capacity` bytes
    pub fn next_fragment(&mut self, capacity: usize) -> Result<Poll, PacketizerError> {
        if self.finished {
            return Err(PacketizerError::Finished);
        }
        if capacity < MIN_FRAME_CAPACITY {
            debug!("Frame capacity {} below minimum {}", capacity, MIN_FRAME_CAPACITY);
            return Err(WireError::Capacity(capacity).into());
        }

        let room = capacity - DATA_HEADER_LEN;
        let mut buf = BytesMut::zeroed(room);
        let mut filled = 0;
        let mut last = false;

        // Keep pulling: a source may hand out less than asked for, e.g. at
        // a block boundary.
        while filled < room {
            match self.source.fill(&mut buf[filled..])? {
                Fill::Data { len, last: true } => {
                    filled += len;
                    last = true;
                    break;
                }
                Fill::Data { len, last: false } if len > 0 => filled += len,
                Fill::Data { .. } | Fill::NotYet => break,
            }
        }

        if filled == 0 && !last {
            trace!("Source has no data for the next fragment");
            return Ok(Poll::NotReady);
        }

        buf.truncate(filled);
        let first = !self.started;
        self.started = true;
        self.finished = last;

        Ok(Poll::Ready(Fragment {
            first,
            last,
            payload: buf.freeze(),
        }))
    }

    /// Whether the last fragment has been produced
    pub fn finished(&self) -> bool {
        self.finished
    }

    /// Whether any fragment has been produced
    pub fn started(&self) -> bool {
        self.started
    }

    /// Access the source
    pub fn source(&self) -> &S {
        &self.source
    }

    /// Mutable access to the source
    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }

    /// Release the source
    pub fn into_source(self) -> S {
        self.source
    }
}

/// Push side of a reassembled payload stream
pub trait PayloadSink {
    /// Append one fragment's payload
    fn push(&mut self, chunk: &[u8], first: bool, last: bool) -> Result<(), SinkError>;
}

/// Sink collecting the whole payload into a bounded buffer
#[derive(Debug, Clone)]
pub struct BufferSink {
    buf: BytesMut,
    limit: usize,
    complete: bool,
}

impl BufferSink {
    /// Create a sink accepting at most `limit` bytes
    pub fn new(limit: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            limit,
            complete: false,
        }
    }

    /// Bytes collected so far
    pub fn data(&self) -> &[u8] {
        &self.buf
    }

    /// Whether the last fragment was pushed
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Take the collected payload
    pub fn into_bytes(self) -> Bytes {
        self.buf.freeze()
    }
}

impl PayloadSink for BufferSink {
    fn push(&mut self, chunk: &[u8], first: bool, last: bool) -> Result<(), SinkError> {
        if first {
            self.buf.clear();
        }
        if self.buf.len() + chunk.len() > self.limit {
            return Err(SinkError::Overflow { limit: self.limit });
        }
        self.buf.extend_from_slice(chunk);
        self.complete = last;
        Ok(())
    }
}
