//! Certificate exchange.
//!
//! The server certificate is pushed first, unless the device already holds
//! it. When the push completes the exchange checks that the certificate it
//! sent is still the live one; if the refresh task replaced it meanwhile the
//! push starts over with the new certificate. The device certificate is
//! pulled afterwards, unless the cloud already knows it, and handed to the
//! cloud. The exchange ends once the cloud's verdict on it arrives.

use crate::error::{SessionError, TransferError};
use crate::info::Provisioning;
use crate::receiver::{RecvProgress, Receiver};
use crate::sender::{SendProgress, Sender};
use crate::session::SessionConfig;
use crate::transport::{Endpoint, PeerLink};
use gateway_cloud::certstore::serial_hex;
use gateway_cloud::{
    CertError, CertificateStore, CloudClient, CloudEvent, DeviceCertBuffer, Peer,
    ServerCertSource,
};
use gateway_wire::{Frame, Packetizer};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Progress of the exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeStep {
    /// Waiting for the device
    Pending,
    /// Both directions are done (or were skipped)
    Done,
}

#[derive(Debug)]
enum Phase {
    Idle,
    ServerPush(Sender<ServerCertSource>),
    DevicePull(Receiver<DeviceCertBuffer>),
    /// Device certificate handed to the cloud, verdict outstanding
    Verifying,
    Done,
}

/// Certificate exchange context
#[derive(Debug)]
pub struct CertExchange {
    peer: Peer,
    certs: Arc<CertificateStore>,
    config: SessionConfig,
    provisioning: Provisioning,
    phase: Phase,
    pushes: u32,
}

impl CertExchange {
    /// Create an exchange; nothing is sent until [`CertExchange::start`]
    pub fn new(
        peer: Peer,
        certs: Arc<CertificateStore>,
        config: SessionConfig,
        provisioning: Provisioning,
    ) -> Self {
        Self {
            peer,
            certs,
            config,
            provisioning,
            phase: Phase::Idle,
            pushes: 0,
        }
    }

    /// Begin with the server certificate push
    pub fn start(&mut self, link: &mut PeerLink<'_>) -> Result<ExchangeStep, SessionError> {
        self.start_server_push(link)
    }

    /// Provisioning state as known so far
    pub fn provisioning(&self) -> Provisioning {
        self.provisioning
    }

    /// Number of server certificate pushes started
    pub fn pushes(&self) -> u32 {
        self.pushes
    }

    /// Endpoint the active phase listens on
    pub fn endpoint(&self) -> Option<Endpoint> {
        match self.phase {
            Phase::ServerPush(_) => Some(Endpoint::ServerCert),
            Phase::DevicePull(_) => Some(Endpoint::DeviceCert),
            Phase::Idle | Phase::Verifying | Phase::Done => None,
        }
    }

    fn start_server_push(&mut self, link: &mut PeerLink<'_>) -> Result<ExchangeStep, SessionError> {
        if self.provisioning.server_cert {
            debug!("Server certificate already provisioned on {}", self.peer);
            return self.start_device_pull(link);
        }

        let source = ServerCertSource::snapshot(self.certs.clone())?;
        let cert = source.certificate();
        info!(
            "Pushing server certificate serial {} ({} bytes, epoch {}) to {}",
            serial_hex(cert.serial()),
            cert.raw().len(),
            cert.epoch(),
            self.peer
        );

        self.pushes += 1;
        let mut sender = Sender::new(
            Packetizer::new(source),
            self.config.transfer,
            link.capacity(),
        );
        let mut writer = link.writer(Endpoint::ServerCert)?;
        let result = sender.pump(&mut writer);
        self.phase = Phase::ServerPush(sender);
        result.map_err(|e| SessionError::transfer(Endpoint::ServerCert, e))?;
        Ok(ExchangeStep::Pending)
    }

    fn start_device_pull(&mut self, link: &mut PeerLink<'_>) -> Result<ExchangeStep, SessionError> {
        if self.provisioning.device_cert {
            debug!("Device certificate already provisioned on {}", self.peer);
            self.phase = Phase::Done;
            return Ok(ExchangeStep::Done);
        }

        let mut receiver = Receiver::new(
            DeviceCertBuffer::new(self.config.device_cert_max_len),
            self.config.transfer,
        );
        let mut writer = link.writer(Endpoint::DeviceCert)?;
        let result = receiver.open(&mut writer);
        self.phase = Phase::DevicePull(receiver);
        result.map_err(|e| SessionError::transfer(Endpoint::DeviceCert, e))?;
        debug!("Pulling device certificate from {}", self.peer);
        Ok(ExchangeStep::Pending)
    }

    /// Handle a frame from one of the certificate endpoints
    pub fn on_frame(
        &mut self,
        endpoint: Endpoint,
        frame: &Frame,
        link: &mut PeerLink<'_>,
        cloud: &mut dyn CloudClient,
    ) -> Result<ExchangeStep, SessionError> {
        match (&self.phase, endpoint) {
            (Phase::ServerPush(_), Endpoint::ServerCert) => self.on_server_frame(frame, link),
            (Phase::DevicePull(_), Endpoint::DeviceCert) => {
                self.on_device_frame(frame, link, cloud)
            }
            _ => {
                debug!("Ignoring unsolicited frame on {} endpoint", endpoint);
                Ok(ExchangeStep::Pending)
            }
        }
    }

    fn on_server_frame(
        &mut self,
        frame: &Frame,
        link: &mut PeerLink<'_>,
    ) -> Result<ExchangeStep, SessionError> {
        let Phase::ServerPush(sender) = &mut self.phase else {
            return Ok(ExchangeStep::Pending);
        };

        let mut writer = link.writer(Endpoint::ServerCert)?;
        let progress = sender
            .on_frame(frame, &mut writer)
            .map_err(|e| SessionError::transfer(Endpoint::ServerCert, e))?;
        if progress == SendProgress::Pending {
            return Ok(ExchangeStep::Pending);
        }

        if sender.source().is_newest() {
            info!("Server certificate delivered to {}", self.peer);
            self.provisioning.server_cert = true;
            self.start_device_pull(link)
        } else {
            info!("Noticed certificate update, sending once again");
            self.provisioning.server_cert = false;
            self.start_server_push(link)
        }
    }

    fn on_device_frame(
        &mut self,
        frame: &Frame,
        link: &mut PeerLink<'_>,
        cloud: &mut dyn CloudClient,
    ) -> Result<ExchangeStep, SessionError> {
        let Phase::DevicePull(receiver) = &mut self.phase else {
            return Ok(ExchangeStep::Pending);
        };

        let mut writer = link.writer(Endpoint::DeviceCert)?;
        let progress = receiver.on_frame(frame, &mut writer).map_err(|e| match e {
            TransferError::Sink(sink) => SessionError::Cert(CertError::from(sink)),
            other => SessionError::transfer(Endpoint::DeviceCert, other),
        })?;
        if progress == RecvProgress::Pending {
            return Ok(ExchangeStep::Pending);
        }

        let Phase::DevicePull(receiver) = std::mem::replace(&mut self.phase, Phase::Done) else {
            return Ok(ExchangeStep::Done);
        };
        let der = receiver.into_sink().finish()?;
        info!(
            "Received device certificate from {} ({} bytes)",
            self.peer,
            der.len()
        );
        cloud
            .submit_device_certificate(self.peer, der)
            .map_err(|e| CertError::Submit(e.to_string()))?;
        self.phase = Phase::Verifying;
        Ok(ExchangeStep::Pending)
    }

    /// Handle a cloud completion; only the device certificate verdict matters
    pub fn on_cloud(&mut self, event: CloudEvent) -> Result<ExchangeStep, SessionError> {
        let CloudEvent::DeviceCertSubmitted { peer, result } = event else {
            debug!("Ignoring cloud event during certificate exchange");
            return Ok(ExchangeStep::Pending);
        };
        if peer != self.peer || !matches!(self.phase, Phase::Verifying) {
            debug!("Ignoring unexpected device certificate verdict for {}", peer);
            return Ok(ExchangeStep::Pending);
        }

        self.phase = Phase::Done;
        match result {
            Ok(()) => {
                info!("Device certificate of {} accepted by the cloud", self.peer);
                self.provisioning.device_cert = true;
                Ok(ExchangeStep::Done)
            }
            Err(e) => {
                warn!("Device certificate of {} rejected: {}", self.peer, e);
                Err(CertError::Submit(e.to_string()).into())
            }
        }
    }

    /// Stop whichever direction is active
    pub fn abort(&mut self, link: &mut PeerLink<'_>) {
        match &mut self.phase {
            Phase::ServerPush(sender) => match link.writer(Endpoint::ServerCert) {
                Ok(mut writer) => sender.abort(&mut writer),
                Err(e) => warn!("Cannot abort server certificate push: {}", e),
            },
            Phase::DevicePull(receiver) => match link.writer(Endpoint::DeviceCert) {
                Ok(mut writer) => receiver.abort(&mut writer),
                Err(e) => warn!("Cannot abort device certificate pull: {}", e),
            },
            Phase::Idle | Phase::Verifying | Phase::Done => {}
        }
        self.phase = Phase::Done;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::tests::SimCloud;
    use crate::sim::{SimDevice, SimDeviceConfig, SimLink};
    use crate::session::SessionEvent;
    use crate::transport::{ConnId, EndpointSet, GattClient, SERVICE_UUID_128};
    use bytes::Bytes;
    use gateway_wire::DeviceInfo;

    const SERVER_A: &[u8] = include_bytes!("../../cloud/testdata/server_a.pem");
    const SERVER_B: &[u8] = include_bytes!("../../cloud/testdata/server_b.pem");
    const CONN: ConnId = ConnId(3);
    const PEER: Peer = Peer(0x99);

    struct Harness {
        link: SimLink,
        endpoints: EndpointSet,
        cloud: SimCloud,
        certs: Arc<CertificateStore>,
    }

    fn harness(cloud: SimCloud) -> Harness {
        let device = SimDevice::new(SimDeviceConfig::default());
        let service = device.service(SERVICE_UUID_128).unwrap();
        let endpoints = EndpointSet::from_discovery(&service).unwrap();

        let mut link = SimLink::new();
        link.attach(CONN, device);
        for (_, handles) in endpoints.subscriptions() {
            link.subscribe(CONN, handles).unwrap();
        }

        let certs = CertificateStore::new();
        certs.update(Bytes::from_static(SERVER_A)).unwrap();
        Harness {
            link,
            endpoints,
            cloud,
            certs: Arc::new(certs),
        }
    }

    impl Harness {
        fn exchange(&self, provisioning: Provisioning) -> CertExchange {
            CertExchange::new(PEER, self.certs.clone(), SessionConfig::default(), provisioning)
        }

        fn start(&mut self, exchange: &mut CertExchange) -> Result<ExchangeStep, SessionError> {
            let mut link = PeerLink::new(&mut self.link, CONN, &self.endpoints);
            exchange.start(&mut link)
        }

        /// Deliver one pending event; `None` once nothing is left
        fn step(
            &mut self,
            exchange: &mut CertExchange,
        ) -> Option<Result<ExchangeStep, SessionError>> {
            if let Some((_, event)) = self.link.next_event() {
                let SessionEvent::Notification { handle, data } = event else {
                    panic!("unexpected link event {:?}", event);
                };
                let endpoint = self.endpoints.endpoint_for(handle).unwrap();
                let frame = Frame::decode(&data).unwrap();
                let mut link = PeerLink::new(&mut self.link, CONN, &self.endpoints);
                return Some(exchange.on_frame(endpoint, &frame, &mut link, &mut self.cloud));
            }
            let event = self.cloud.events.pop_front()?;
            Some(exchange.on_cloud(event))
        }

        fn run(&mut self, exchange: &mut CertExchange) -> Result<ExchangeStep, SessionError> {
            while let Some(step) = self.step(exchange) {
                if step? == ExchangeStep::Done {
                    return Ok(ExchangeStep::Done);
                }
            }
            Ok(ExchangeStep::Pending)
        }

        fn device(&self) -> &SimDevice {
            self.link.device(CONN).unwrap()
        }
    }

    #[test]
    fn test_push_then_pull() {
        let mut h = harness(SimCloud::default());
        let mut exchange = h.exchange(Provisioning::default());

        assert_eq!(h.start(&mut exchange).unwrap(), ExchangeStep::Pending);
        assert_eq!(exchange.endpoint(), Some(Endpoint::ServerCert));
        assert_eq!(h.run(&mut exchange).unwrap(), ExchangeStep::Done);

        assert_eq!(h.device().server_certs(), &[Bytes::from_static(SERVER_A)]);
        assert_eq!(
            h.cloud.device_certs,
            vec![(PEER, h.device().config().device_cert.clone())]
        );
        assert_eq!(exchange.pushes(), 1);
        assert!(exchange.provisioning().server_cert);
        assert!(exchange.provisioning().device_cert);
        assert_eq!(exchange.endpoint(), None);
    }

    #[test]
    fn test_each_update_restarts_push() {
        let mut h = harness(SimCloud::default());
        let mut exchange = h.exchange(Provisioning::default());
        h.start(&mut exchange).unwrap();

        // Replace the certificate during the first push, and again during
        // the second one.
        h.certs.update(Bytes::from_static(SERVER_B)).unwrap();
        let mut replaced_again = false;
        loop {
            if exchange.pushes() == 2 && !replaced_again {
                h.certs.update(Bytes::from_static(SERVER_A)).unwrap();
                replaced_again = true;
            }
            match h.step(&mut exchange) {
                Some(Ok(ExchangeStep::Done)) => break,
                Some(Ok(ExchangeStep::Pending)) => {}
                other => panic!("exchange stopped early: {:?}", other),
            }
        }

        assert_eq!(exchange.pushes(), 3);
        assert_eq!(
            h.device().server_certs(),
            &[
                Bytes::from_static(SERVER_A),
                Bytes::from_static(SERVER_B),
                Bytes::from_static(SERVER_A),
            ]
        );
        assert_eq!(h.certs.epoch(), 3);
        assert!(exchange.provisioning().server_cert);
    }

    #[test]
    fn test_matching_serial_skips_push_but_pulls() {
        let mut h = harness(SimCloud::default());
        let info = DeviceInfo {
            server_cert_serial: h.certs.serial(),
            ..Default::default()
        };
        let provisioning = Provisioning::from_info(&info, h.certs.serial().as_deref());
        assert!(provisioning.server_cert);
        assert!(!provisioning.device_cert);

        let mut exchange = h.exchange(provisioning);
        assert_eq!(h.start(&mut exchange).unwrap(), ExchangeStep::Pending);
        assert_eq!(exchange.endpoint(), Some(Endpoint::DeviceCert));
        assert_eq!(h.run(&mut exchange).unwrap(), ExchangeStep::Done);

        assert_eq!(exchange.pushes(), 0);
        assert!(h.device().written_to(Endpoint::ServerCert).is_empty());
        assert!(h.device().server_certs().is_empty());
        assert_eq!(h.cloud.device_certs.len(), 1);
        assert!(exchange.provisioning().device_cert);
    }

    #[test]
    fn test_fully_provisioned_is_done_at_once() {
        let mut h = harness(SimCloud::default());
        let mut exchange = h.exchange(Provisioning {
            server_cert: true,
            device_cert: true,
        });

        assert_eq!(h.start(&mut exchange).unwrap(), ExchangeStep::Done);
        assert!(h.device().written().is_empty());
    }

    #[test]
    fn test_waits_for_cloud_verdict() {
        let mut h = harness(SimCloud::default());
        let mut exchange = h.exchange(Provisioning {
            server_cert: true,
            device_cert: false,
        });
        h.start(&mut exchange).unwrap();

        // Drain the device link only; the verdict is still queued
        while let Some((_, event)) = h.link.next_event() {
            let SessionEvent::Notification { handle, data } = event else {
                continue;
            };
            let endpoint = h.endpoints.endpoint_for(handle).unwrap();
            let frame = Frame::decode(&data).unwrap();
            let mut link = PeerLink::new(&mut h.link, CONN, &h.endpoints);
            let step = exchange
                .on_frame(endpoint, &frame, &mut link, &mut h.cloud)
                .unwrap();
            assert_eq!(step, ExchangeStep::Pending);
        }
        assert_eq!(h.cloud.device_certs.len(), 1);
        assert_eq!(exchange.endpoint(), None);
        assert!(!exchange.provisioning().device_cert);

        // A verdict for another session changes nothing
        let other = CloudEvent::DeviceCertSubmitted {
            peer: Peer(1),
            result: Ok(()),
        };
        assert_eq!(exchange.on_cloud(other).unwrap(), ExchangeStep::Pending);

        let verdict = h.cloud.events.pop_front().unwrap();
        assert_eq!(exchange.on_cloud(verdict).unwrap(), ExchangeStep::Done);
        assert!(exchange.provisioning().device_cert);
    }

    #[test]
    fn test_rejected_device_cert_fails_exchange() {
        let mut h = harness(SimCloud {
            reject_device_cert: true,
            ..Default::default()
        });
        let mut exchange = h.exchange(Provisioning::default());
        h.start(&mut exchange).unwrap();

        let err = h.run(&mut exchange).unwrap_err();
        assert!(matches!(err, SessionError::Cert(CertError::Submit(_))));
        assert!(!exchange.provisioning().device_cert);
        // The server push still went through
        assert_eq!(h.device().server_certs().len(), 1);
    }
}
