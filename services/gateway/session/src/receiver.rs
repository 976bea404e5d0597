//! Windowed receiver.
//!
//! A [`Receiver`] reassembles DATA frames into a [`PayloadSink`] and
//! acknowledges them cumulatively. It never reorders or fills gaps: the
//! first frame out of sequence ends the transfer with a NACK.

use crate::error::TransferError;
use crate::session::TransferConfig;
use crate::transport::FrameWriter;
use gateway_wire::{
    encode_ack, encode_nack, prev_seq, wire_seq, FinCode, Frame, NackCode, PayloadSink, SinkError,
};
use tracing::{debug, warn};

/// Receiver lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvState {
    /// Not accepting frames; DATA is answered with NACK(Idle)
    Idle,
    /// Accepting frames
    Receiving,
    /// FIN received and acknowledged
    Complete,
    /// Ended by a protocol error, sink error or abort
    Failed,
}

/// What a call changed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvProgress {
    /// Nothing to report
    Pending,
    /// The stream ended cleanly; reported exactly once
    Complete,
}

/// Windowed receiver feeding a payload sink
#[derive(Debug)]
pub struct Receiver<K> {
    sink: K,
    state: RecvState,
    window: u8,
    ack_threshold: u8,
    /// Next expected sequence (monotonic, compared modulo 16)
    expected: u32,
    /// Frames received since the last ACK
    unacked: u8,
    seen_first: bool,
    seen_last: bool,
    /// A terminal NACK was written
    rejected: bool,
}

impl<K: PayloadSink> Receiver<K> {
    /// Create an idle receiver
    pub fn new(sink: K, config: TransferConfig) -> Self {
        let config = config.normalized();
        Self {
            sink,
            state: RecvState::Idle,
            window: config.window,
            ack_threshold: config.ack_threshold,
            expected: 0,
            unacked: 0,
            seen_first: false,
            seen_last: false,
            rejected: false,
        }
    }

    /// Start accepting and tell the peer to begin with a window-open ACK
    pub fn open(&mut self, writer: &mut dyn FrameWriter) -> Result<(), TransferError> {
        self.listen();
        if let Err(e) = writer.write_frame(encode_ack(prev_seq(0), self.window)) {
            return Err(self.fail(e.into()));
        }
        debug!("Opened receive window of {}", self.window);
        Ok(())
    }

    /// Start accepting without announcing it; the peer starts on its own
    pub fn listen(&mut self) {
        if self.state == RecvState::Idle {
            self.state = RecvState::Receiving;
        }
    }

    /// Current state
    pub fn state(&self) -> RecvState {
        self.state
    }

    /// Whether the stream ended cleanly
    pub fn is_complete(&self) -> bool {
        self.state == RecvState::Complete
    }

    /// Access the sink
    pub fn sink(&self) -> &K {
        &self.sink
    }

    /// Mutable access to the sink
    pub fn sink_mut(&mut self) -> &mut K {
        &mut self.sink
    }

    /// Release the sink
    pub fn into_sink(self) -> K {
        self.sink
    }

    /// Handle one inbound frame
    pub fn on_frame(
        &mut self,
        frame: &Frame,
        writer: &mut dyn FrameWriter,
    ) -> Result<RecvProgress, TransferError> {
        match self.state {
            RecvState::Idle => {
                if let Frame::Data { seq, .. } = frame {
                    debug!("DATA seq={} while idle", seq);
                    if let Err(e) = writer.write_frame(encode_nack(NackCode::Idle)) {
                        debug!("Could not deliver NACK(Idle): {}", e);
                    }
                }
                return Ok(RecvProgress::Pending);
            }
            RecvState::Complete | RecvState::Failed => {
                debug!("Ignoring {:?} after the transfer ended", frame);
                return Ok(RecvProgress::Pending);
            }
            RecvState::Receiving => {}
        }

        match frame {
            Frame::Data {
                seq,
                first,
                last,
                payload,
            } => self.on_data(*seq, *first, *last, payload, writer),
            Frame::Fin { seq, code } => self.on_fin(*seq, *code, writer),
            Frame::Nack { code } => {
                warn!("Transfer rejected by peer: {:?}", code);
                self.state = RecvState::Failed;
                Err(TransferError::Nack(*code))
            }
            Frame::Ack { seq, .. } => {
                debug!("Ignoring ACK seq={} on a receiving endpoint", seq);
                Ok(RecvProgress::Pending)
            }
        }
    }

    fn on_data(
        &mut self,
        seq: u8,
        first: bool,
        last: bool,
        payload: &[u8],
        writer: &mut dyn FrameWriter,
    ) -> Result<RecvProgress, TransferError> {
        let expected = wire_seq(self.expected);
        if seq != expected {
            return Err(self.reject(
                NackCode::OutOfSequence,
                TransferError::OutOfSequence { expected, got: seq },
                writer,
            ));
        }
        let misplaced = if self.seen_last {
            Some("DATA after the last fragment")
        } else if !self.seen_first && !first {
            Some("stream does not start with a first fragment")
        } else if self.seen_first && first {
            Some("first fragment in the middle of a stream")
        } else {
            None
        };
        if let Some(reason) = misplaced {
            return Err(self.reject(
                NackCode::OutOfSequence,
                TransferError::Fragment(reason),
                writer,
            ));
        }

        if let Err(e) = self.sink.push(payload, first, last) {
            let code = match e {
                SinkError::Overflow { .. } => NackCode::Overflow,
                SinkError::Rejected(_) => NackCode::Aborted,
            };
            return Err(self.reject(code, e.into(), writer));
        }

        self.seen_first = true;
        self.seen_last = last;
        self.expected = self.expected.wrapping_add(1);
        self.unacked += 1;
        debug!(
            "Received fragment seq={} len={} first={} last={}",
            seq,
            payload.len(),
            first,
            last
        );

        if self.unacked >= self.ack_threshold || last {
            self.ack(seq, writer)?;
        }
        Ok(RecvProgress::Pending)
    }

    fn on_fin(
        &mut self,
        seq: u8,
        code: FinCode,
        writer: &mut dyn FrameWriter,
    ) -> Result<RecvProgress, TransferError> {
        if code == FinCode::Aborted {
            warn!("Peer aborted the transfer");
            self.state = RecvState::Failed;
            return Err(TransferError::PeerAborted);
        }

        let expected = wire_seq(self.expected);
        if seq != expected {
            return Err(self.reject(
                NackCode::OutOfSequence,
                TransferError::OutOfSequence { expected, got: seq },
                writer,
            ));
        }
        if self.seen_first && !self.seen_last {
            warn!("Peer closed the stream before its last fragment");
            self.state = RecvState::Failed;
            return Err(TransferError::PrematureClose);
        }

        self.expected = self.expected.wrapping_add(1);
        self.ack(seq, writer)?;
        self.state = RecvState::Complete;
        debug!("Stream complete");
        Ok(RecvProgress::Complete)
    }

    fn ack(&mut self, seq: u8, writer: &mut dyn FrameWriter) -> Result<(), TransferError> {
        if let Err(e) = writer.write_frame(encode_ack(seq as u32, self.window)) {
            return Err(self.fail(e.into()));
        }
        self.unacked = 0;
        Ok(())
    }

    fn reject(
        &mut self,
        code: NackCode,
        err: TransferError,
        writer: &mut dyn FrameWriter,
    ) -> TransferError {
        if let Err(e) = writer.write_frame(encode_nack(code)) {
            debug!("Could not deliver NACK({:?}): {}", code, e);
        }
        self.rejected = true;
        self.fail(err)
    }

    /// Stop the transfer.
    ///
    /// Idempotent and infallible; an open transfer is rejected with a single
    /// NACK(Aborted).
    pub fn abort(&mut self, writer: &mut dyn FrameWriter) {
        let open = self.state == RecvState::Receiving;
        if matches!(self.state, RecvState::Complete) {
            return;
        }
        self.state = RecvState::Failed;
        if open && !self.rejected {
            self.rejected = true;
            if let Err(e) = writer.write_frame(encode_nack(NackCode::Aborted)) {
                debug!("Could not deliver NACK(Aborted): {}", e);
            }
        }
    }

    fn fail(&mut self, err: TransferError) -> TransferError {
        warn!("Receive transfer failed: {}", err);
        self.state = RecvState::Failed;
        err
    }
}
