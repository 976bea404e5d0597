//! Info record retrieval.
//!
//! The info record tells the gateway which certificates a device already
//! holds. Nothing safety critical depends on it: a record that cannot be
//! decoded, or does not fit, yields conservative defaults.

use crate::error::TransferError;
use crate::receiver::{RecvProgress, Receiver};
use crate::session::TransferConfig;
use crate::transport::FrameWriter;
use gateway_wire::{decode_info, BufferSink, DeviceInfo, Frame, INFO_MAX_LEN};
use tracing::{debug, warn};

/// Certificate provisioning state of a peer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Provisioning {
    /// The device holds the current server certificate
    pub server_cert: bool,
    /// The cloud already knows the device certificate
    pub device_cert: bool,
}

impl Provisioning {
    /// Derive provisioning from an info record and the current server serial
    pub fn from_info(info: &DeviceInfo, server_serial: Option<&[u8]>) -> Self {
        Self {
            server_cert: server_serial.is_some_and(|serial| info.has_server_cert(serial)),
            device_cert: info.device_cert_provisioned(),
        }
    }
}

/// Outcome of feeding a frame to an [`InfoRead`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InfoProgress {
    /// More frames expected
    Pending,
    /// The read finished; `None` when the record was unusable
    Done(Option<DeviceInfo>),
}

/// Info read context
#[derive(Debug)]
pub struct InfoRead {
    receiver: Receiver<BufferSink>,
}

impl InfoRead {
    /// Open the info endpoint
    pub fn open(config: TransferConfig, writer: &mut dyn FrameWriter) -> Result<Self, TransferError> {
        let mut receiver = Receiver::new(BufferSink::new(INFO_MAX_LEN), config);
        receiver.open(writer)?;
        Ok(Self { receiver })
    }

    /// Handle a frame from the info endpoint
    pub fn on_frame(
        &mut self,
        frame: &Frame,
        writer: &mut dyn FrameWriter,
    ) -> Result<InfoProgress, TransferError> {
        match self.receiver.on_frame(frame, writer) {
            Ok(RecvProgress::Pending) => Ok(InfoProgress::Pending),
            Ok(RecvProgress::Complete) => {
                let raw = self.receiver.sink().data();
                match decode_info(raw) {
                    Ok(info) => {
                        debug!("Decoded info record: {:?}", info);
                        Ok(InfoProgress::Done(Some(info)))
                    }
                    Err(e) => {
                        warn!("Failed to parse info ({} bytes): {}", raw.len(), e);
                        Ok(InfoProgress::Done(None))
                    }
                }
            }
            Err(TransferError::Sink(e)) => {
                warn!("Info record unusable: {}", e);
                Ok(InfoProgress::Done(None))
            }
            Err(e) => Err(e),
        }
    }

    /// Stop the read
    pub fn abort(&mut self, writer: &mut dyn FrameWriter) {
        self.receiver.abort(writer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sender::tests::VecWriter;
    use bytes::Bytes;
    use gateway_wire::{encode_data, encode_fin, FinCode, InfoFlags, NackCode};

    fn feed(read: &mut InfoRead, w: &mut VecWriter, payload: &[u8]) -> InfoProgress {
        let frame = Frame::decode(&encode_data(0, true, true, payload)).unwrap();
        assert_eq!(read.on_frame(&frame, w).unwrap(), InfoProgress::Pending);
        let fin = Frame::decode(&encode_fin(1, FinCode::Ok)).unwrap();
        read.on_frame(&fin, w).unwrap()
    }

    #[test]
    fn test_info_decoded() {
        let info = DeviceInfo {
            flags: InfoFlags::DEVICE_CERT_PROVISIONED,
            server_cert_serial: Some(Bytes::from_static(&[1, 2, 3])),
        };
        let mut w = VecWriter::new(64);
        let mut read = InfoRead::open(TransferConfig::default(), &mut w).unwrap();

        let InfoProgress::Done(Some(decoded)) = feed(&mut read, &mut w, &info.encode().unwrap())
        else {
            panic!("expected a decoded record");
        };
        let p = Provisioning::from_info(&decoded, Some(&[1u8, 2, 3][..]));
        assert!(p.server_cert && p.device_cert);
        assert!(!Provisioning::from_info(&decoded, Some(&[9u8][..])).server_cert);
        assert!(!Provisioning::from_info(&decoded, None).server_cert);
    }

    #[test]
    fn test_garbage_is_not_fatal() {
        let mut w = VecWriter::new(64);
        let mut read = InfoRead::open(TransferConfig::default(), &mut w).unwrap();
        assert_eq!(feed(&mut read, &mut w, b"\xff\x00"), InfoProgress::Done(None));
    }

    #[test]
    fn test_oversized_is_not_fatal() {
        let mut w = VecWriter::new(128);
        let mut read = InfoRead::open(TransferConfig::default(), &mut w).unwrap();
        let big = vec![0u8; INFO_MAX_LEN + 1];
        let frame = Frame::decode(&encode_data(0, true, true, &big)).unwrap();
        assert_eq!(read.on_frame(&frame, &mut w).unwrap(), InfoProgress::Done(None));
        assert_eq!(
            w.decoded().last(),
            Some(&Frame::Nack {
                code: NackCode::Overflow
            })
        );
    }

    #[test]
    fn test_peer_abort_is_fatal() {
        let mut w = VecWriter::new(64);
        let mut read = InfoRead::open(TransferConfig::default(), &mut w).unwrap();
        let fin = Frame::decode(&encode_fin(0, FinCode::Aborted)).unwrap();
        assert_eq!(
            read.on_frame(&fin, &mut w).unwrap_err(),
            TransferError::PeerAborted
        );
    }
}
