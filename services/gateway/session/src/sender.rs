//! Windowed sender.
//!
//! A [`Sender`] drives a [`Packetizer`] onto a [`FrameWriter`], keeping at
//! most `min(configured window, advertised window)` frames unacknowledged.
//! There is no retransmission: a NACK ends the transfer and recovery is up
//! to the session.

use crate::error::TransferError;
use crate::session::TransferConfig;
use crate::transport::FrameWriter;
use gateway_wire::{
    encode_fin, seq_distance, wire_seq, FinCode, Frame, Packetizer, PayloadSource, Poll,
};
use std::collections::VecDeque;
use tracing::{debug, warn};

/// Sender lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendState {
    /// Nothing sent yet
    Idle,
    /// Fragments are going out
    Sending,
    /// Last fragment handed out; FIN pending or awaiting its ACK
    DrainingOnClose,
    /// FIN acknowledged
    Complete,
    /// Ended by NACK, write failure, source failure or abort
    Failed,
}

/// What a call changed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendProgress {
    /// Nothing to report
    Pending,
    /// The FIN was acknowledged; reported exactly once
    Complete,
}

/// Windowed sender over a payload source
#[derive(Debug)]
pub struct Sender<S> {
    packetizer: Packetizer<S>,
    state: SendState,
    capacity: usize,
    /// Configured window
    window: u8,
    /// Window last advertised by the receiver
    peer_window: u8,
    /// Next sequence to assign (monotonic, sent modulo 16)
    next_seq: u32,
    /// Sequences awaiting acknowledgment, oldest first
    in_flight: VecDeque<u32>,
    /// Sequence of the FIN, once sent
    fin_seq: Option<u32>,
    fin_code: FinCode,
}

impl<S: PayloadSource> Sender<S> {
    /// Create a sender writing frames of at most `capacity` bytes
    pub fn new(packetizer: Packetizer<S>, config: TransferConfig, capacity: usize) -> Self {
        let config = config.normalized();
        Self {
            packetizer,
            state: SendState::Idle,
            capacity,
            window: config.window,
            peer_window: config.window,
            next_seq: 0,
            in_flight: VecDeque::new(),
            fin_seq: None,
            fin_code: FinCode::Ok,
        }
    }

    /// Current state
    pub fn state(&self) -> SendState {
        self.state
    }

    /// Frames written but not yet acknowledged
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Frames written so far, FIN included
    pub fn frames_sent(&self) -> u32 {
        self.next_seq
    }

    /// Code the stream was closed with
    pub fn fin_code(&self) -> FinCode {
        self.fin_code
    }

    /// Whether the FIN was acknowledged
    pub fn is_complete(&self) -> bool {
        self.state == SendState::Complete
    }

    /// Access the payload source
    pub fn source(&self) -> &S {
        self.packetizer.source()
    }

    /// Mutable access to the payload source
    pub fn source_mut(&mut self) -> &mut S {
        self.packetizer.source_mut()
    }

    fn limit(&self) -> usize {
        self.window.min(self.peer_window) as usize
    }

    /// Write as many frames as the window and the source allow
    pub fn pump(&mut self, writer: &mut dyn FrameWriter) -> Result<SendProgress, TransferError> {
        match self.state {
            SendState::Complete | SendState::Failed => return Ok(SendProgress::Pending),
            SendState::Idle => self.state = SendState::Sending,
            _ => {}
        }

        while self.in_flight.len() < self.limit() {
            if self.state == SendState::Sending {
                let fragment = match self.packetizer.next_fragment(self.capacity) {
                    Ok(Poll::Ready(fragment)) => fragment,
                    Ok(Poll::NotReady) => break,
                    Err(e) => return Err(self.fail(e.into())),
                };

                let seq = self.next_seq;
                if let Err(e) = writer.write_frame(fragment.encode(seq)) {
                    return Err(self.fail(e.into()));
                }
                debug!(
                    "Sent fragment seq={} len={} first={} last={} in_flight={}",
                    wire_seq(seq),
                    fragment.payload.len(),
                    fragment.first,
                    fragment.last,
                    self.in_flight.len() + 1
                );
                self.push_in_flight(seq);

                if fragment.last {
                    self.state = SendState::DrainingOnClose;
                }
            } else if self.fin_seq.is_none() {
                let seq = self.next_seq;
                self.fin_code = self.packetizer.source().fin_code();
                if let Err(e) = writer.write_frame(encode_fin(seq, self.fin_code)) {
                    return Err(self.fail(e.into()));
                }
                debug!("Sent FIN seq={} code={:?}", wire_seq(seq), self.fin_code);
                self.fin_seq = Some(seq);
                self.push_in_flight(seq);
            } else {
                break;
            }
        }

        Ok(SendProgress::Pending)
    }

    fn push_in_flight(&mut self, seq: u32) {
        self.in_flight.push_back(seq);
        self.next_seq = seq.wrapping_add(1);
    }

    /// Handle a control frame from the receiver
    pub fn on_frame(
        &mut self,
        frame: &Frame,
        writer: &mut dyn FrameWriter,
    ) -> Result<SendProgress, TransferError> {
        if matches!(self.state, SendState::Complete | SendState::Failed) {
            debug!("Ignoring {:?} after the transfer ended", frame);
            return Ok(SendProgress::Pending);
        }

        match *frame {
            Frame::Ack { seq, window } => self.on_ack(seq, window, writer),
            Frame::Nack { code } => {
                warn!("Transfer rejected by peer: {:?}", code);
                self.state = SendState::Failed;
                Err(TransferError::Nack(code))
            }
            Frame::Data { .. } | Frame::Fin { .. } => {
                Err(self.fail(TransferError::Fragment("payload frame on a sending endpoint")))
            }
        }
    }

    fn on_ack(
        &mut self,
        seq: u8,
        window: u8,
        writer: &mut dyn FrameWriter,
    ) -> Result<SendProgress, TransferError> {
        self.peer_window = window;

        if let Some(&oldest) = self.in_flight.front() {
            let covered = seq_distance(wire_seq(oldest), seq) as usize + 1;
            if covered <= self.in_flight.len() {
                let retired: Vec<u32> = self.in_flight.drain(..covered).collect();
                debug!(
                    "ACK seq={} retired {} frame(s), window={} in_flight={}",
                    seq,
                    retired.len(),
                    window,
                    self.in_flight.len()
                );

                if self.fin_seq.is_some_and(|fin| retired.contains(&fin)) {
                    self.state = SendState::Complete;
                    return Ok(SendProgress::Complete);
                }
            } else {
                debug!("Stale ACK seq={} window={}", seq, window);
            }
        }

        self.pump(writer)
    }

    /// Stop the transfer.
    ///
    /// Idempotent and infallible. If any frame was already written the peer
    /// is told with a single FIN(Aborted).
    pub fn abort(&mut self, writer: &mut dyn FrameWriter) {
        if matches!(self.state, SendState::Complete | SendState::Failed) {
            return;
        }
        let started = self.next_seq > 0;
        self.state = SendState::Failed;
        self.fin_code = FinCode::Aborted;
        if started {
            if let Err(e) = writer.write_frame(encode_fin(self.next_seq, FinCode::Aborted)) {
                debug!("Could not deliver FIN(Aborted): {}", e);
            }
        }
    }

    fn fail(&mut self, err: TransferError) -> TransferError {
        warn!("Send transfer failed: {}", err);
        self.state = SendState::Failed;
        err
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::TransportError;
    use bytes::Bytes;
    use gateway_wire::{encode_ack, BufferSource, NackCode, PacketizerError};

    /// Collects frames; can be told to fail
    #[derive(Default)]
    pub(crate) struct VecWriter {
        pub frames: Vec<Bytes>,
        pub capacity: usize,
        pub fail: bool,
    }

    impl VecWriter {
        pub(crate) fn new(capacity: usize) -> Self {
            Self {
                capacity,
                ..Default::default()
            }
        }

        pub(crate) fn decoded(&self) -> Vec<Frame> {
            self.frames
                .iter()
                .map(|f| Frame::decode(f).unwrap())
                .collect()
        }
    }

    impl FrameWriter for VecWriter {
        fn capacity(&self) -> usize {
            self.capacity
        }

        fn write_frame(&mut self, frame: Bytes) -> Result<(), TransportError> {
            if self.fail {
                return Err(TransportError::NotConnected);
            }
            self.frames.push(frame);
            Ok(())
        }
    }

    fn config(window: u8) -> TransferConfig {
        TransferConfig {
            window,
            ack_threshold: 1,
        }
    }

    fn sender(data: &'static [u8], window: u8, capacity: usize) -> Sender<BufferSource> {
        Sender::new(
            Packetizer::new(BufferSource::new(Bytes::from_static(data))),
            config(window),
            capacity,
        )
    }

    fn ack(seq: u32, window: u8) -> Frame {
        Frame::decode(&encode_ack(seq, window)).unwrap()
    }

    #[test]
    fn test_window_bounds_first_burst() {
        let mut w = VecWriter::new(5);
        let mut s = sender(b"0123456789abcdefghijklmnop", 3, 5);

        assert_eq!(s.pump(&mut w).unwrap(), SendProgress::Pending);
        assert_eq!(w.frames.len(), 3);
        assert_eq!(s.in_flight(), 3);
        assert_eq!(s.state(), SendState::Sending);

        // Cumulative ACK of seq 1 retires two frames and opens two slots
        s.on_frame(&ack(1, 3), &mut w).unwrap();
        assert_eq!(w.frames.len(), 5);
        assert_eq!(s.in_flight(), 3);
    }

    #[test]
    fn test_fin_and_completion() {
        let mut w = VecWriter::new(20);
        let mut s = sender(b"hello", 4, 20);

        s.pump(&mut w).unwrap();
        let frames = w.decoded();
        assert_eq!(frames.len(), 2);
        assert!(matches!(
            frames[0],
            Frame::Data {
                seq: 0,
                first: true,
                last: true,
                ..
            }
        ));
        assert_eq!(
            frames[1],
            Frame::Fin {
                seq: 1,
                code: FinCode::Ok
            }
        );
        assert_eq!(s.state(), SendState::DrainingOnClose);

        assert_eq!(s.on_frame(&ack(0, 4), &mut w).unwrap(), SendProgress::Pending);
        assert_eq!(s.on_frame(&ack(1, 4), &mut w).unwrap(), SendProgress::Complete);
        assert!(s.is_complete());
        // Reported once
        assert_eq!(s.on_frame(&ack(1, 4), &mut w).unwrap(), SendProgress::Pending);
    }

    #[test]
    fn test_stale_ack_updates_window_only() {
        let mut w = VecWriter::new(2);
        let mut s = sender(b"abcdefgh", 4, 2);

        s.pump(&mut w).unwrap();
        assert_eq!(s.in_flight(), 4);

        // Window-open style ACK of the sequence before 0
        s.on_frame(&ack(15, 2), &mut w).unwrap();
        assert_eq!(s.in_flight(), 4);
        assert_eq!(w.frames.len(), 4);

        // Retiring one frame leaves three in flight, above the new window of two
        s.on_frame(&ack(0, 2), &mut w).unwrap();
        assert_eq!(s.in_flight(), 3);
        assert_eq!(w.frames.len(), 4);
    }

    #[test]
    fn test_nack_aborts() {
        let mut w = VecWriter::new(4);
        let mut s = sender(b"abcdefgh", 2, 4);
        s.pump(&mut w).unwrap();

        let nack = Frame::Nack {
            code: NackCode::Overflow,
        };
        assert_eq!(
            s.on_frame(&nack, &mut w).unwrap_err(),
            TransferError::Nack(NackCode::Overflow)
        );
        assert_eq!(s.state(), SendState::Failed);

        // No FIN(Aborted) after the peer already rejected the transfer
        let sent = w.frames.len();
        s.abort(&mut w);
        assert_eq!(w.frames.len(), sent);
    }

    #[test]
    fn test_write_failure_is_fatal() {
        let mut w = VecWriter::new(4);
        w.fail = true;
        let mut s = sender(b"abcdefgh", 2, 4);
        assert!(matches!(
            s.pump(&mut w),
            Err(TransferError::Transport(TransportError::NotConnected))
        ));
        assert_eq!(s.state(), SendState::Failed);
    }

    #[test]
    fn test_abort_sends_single_fin() {
        let mut w = VecWriter::new(4);
        let mut idle = sender(b"abc", 2, 4);
        idle.abort(&mut w);
        assert!(w.frames.is_empty());

        let mut s = sender(b"abcdefgh", 2, 4);
        s.pump(&mut w).unwrap();
        s.abort(&mut w);
        s.abort(&mut w);
        let frames = w.decoded();
        assert_eq!(frames.len(), 3);
        assert_eq!(
            frames[2],
            Frame::Fin {
                seq: 2,
                code: FinCode::Aborted
            }
        );
        assert_eq!(s.fin_code(), FinCode::Aborted);
    }

    #[test]
    fn test_sequence_wraps() {
        let data: &'static [u8] = &[7u8; 40];
        let mut w = VecWriter::new(2);
        let mut s = sender(data, 4, 2);

        let mut acked = 0u32;
        s.pump(&mut w).unwrap();
        loop {
            let progress = s.on_frame(&ack(acked, 4), &mut w).unwrap();
            if progress == SendProgress::Complete {
                break;
            }
            acked += 1;
        }
        // 40 data frames plus FIN
        assert_eq!(s.frames_sent(), 41);
        assert_eq!(acked, 40);
    }

    #[test]
    fn test_in_flight_never_exceeds_window() {
        // Deterministic pseudo-random interleaving of ACKs and pumps
        let mut rng = 0x2545_f491_u32;
        let mut next = move || {
            rng ^= rng << 13;
            rng ^= rng >> 17;
            rng ^= rng << 5;
            rng
        };

        for window in 1..=8u8 {
            let payload: Vec<u8> = (0..300u32).map(|i| i as u8).collect();
            let mut w = VecWriter::new(7);
            let mut s = Sender::new(
                Packetizer::new(BufferSource::new(payload)),
                config(window),
                7,
            );

            let mut acked: Option<u32> = None;
            for _ in 0..2000 {
                if next() % 3 == 0 {
                    s.pump(&mut w).unwrap();
                } else {
                    let sent = s.frames_sent();
                    let unacked_from = acked.map_or(0, |a| a + 1);
                    if sent > unacked_from {
                        let step = next() % (sent - unacked_from) + 1;
                        let upto = unacked_from + step - 1;
                        let advertised = (next() % window as u32) as u8 + 1;
                        if s.on_frame(&ack(upto, advertised), &mut w).unwrap()
                            == SendProgress::Complete
                        {
                            break;
                        }
                        acked = Some(upto);
                    }
                }
                assert!(s.in_flight() <= window as usize);
            }
            assert!(s.is_complete(), "window {} did not complete", window);
        }
    }

    #[test]
    fn test_source_failure() {
        struct Broken;
        impl PayloadSource for Broken {
            fn fill(&mut self, _dst: &mut [u8]) -> Result<gateway_wire::Fill, PacketizerError> {
                Err(PacketizerError::Source("gone".into()))
            }
        }

        let mut w = VecWriter::new(4);
        let mut s = Sender::new(Packetizer::new(Broken), config(2), 4);
        assert!(matches!(s.pump(&mut w), Err(TransferError::Source(_))));
        assert!(w.frames.is_empty());
    }
}
