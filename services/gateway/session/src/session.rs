//! Per-peer session state machine.
//!
//! A [`Session`] sequences one connected peer through discovery, info
//! retrieval, certificate exchange and the uplink/downlink data path. It is
//! sans-io: [`Session::advance`] consumes one [`SessionEvent`] and submits
//! whatever follows through the [`SessionIo`] it is given. Exactly one
//! sub-protocol context is alive at a time, held by [`Stage`].

use crate::error::{SessionError, TransportError};
use crate::exchange::{CertExchange, ExchangeStep};
use crate::info::{InfoProgress, InfoRead, Provisioning};
use crate::receiver::Receiver;
use crate::sender::Sender;
use crate::transport::{
    uuid16, ConnId, Endpoint, EndpointSet, GattClient, GattService, PeerLink, SERVICE_UUID_128,
    SERVICE_UUID_16,
};
use bytes::Bytes;
use gateway_cloud::{
    CertificateStore, CloudClient, CloudEvent, Downlink, DownlinkSource, Peer, Uplink,
    UplinkResult, DEFAULT_BLOCK_SIZE, DEFAULT_DEVICE_CERT_MAX_LEN,
};
use gateway_wire::{FinCode, Frame, Packetizer, MAX_WINDOW};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Window settings shared by every transfer of a session
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Frames a sender may have unacknowledged (1..=8)
    pub window: u8,
    /// Frames a receiver collects before acknowledging (1..=window)
    pub ack_threshold: u8,
}

impl TransferConfig {
    /// Clamp both values into their valid ranges
    pub fn normalized(self) -> Self {
        let window = self.window.clamp(1, MAX_WINDOW);
        Self {
            window,
            ack_threshold: self.ack_threshold.clamp(1, window),
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            window: MAX_WINDOW,
            ack_threshold: MAX_WINDOW / 2,
        }
    }
}

/// Configuration for a peer session
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Window settings
    pub transfer: TransferConfig,
    /// Uplink and downlink block size
    pub block_size: usize,
    /// Upper bound for device certificates
    pub device_cert_max_len: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            transfer: TransferConfig::default(),
            block_size: DEFAULT_BLOCK_SIZE,
            device_cert_max_len: DEFAULT_DEVICE_CERT_MAX_LEN,
        }
    }
}

/// Inputs driving a session
#[derive(Debug)]
pub enum SessionEvent {
    /// The link is secured; start discovery
    Start,
    /// Result of the last discovery request; `None` if the service is absent
    Discovered(Option<GattService>),
    /// A notification arrived on a value handle
    Notification {
        /// Value handle
        handle: u16,
        /// Raw frame
        data: Bytes,
    },
    /// A write submitted earlier failed
    WriteFailed {
        /// Value handle written to
        handle: u16,
        /// Reason reported by the stack
        reason: String,
    },
    /// Completion of cloud work
    Cloud(CloudEvent),
    /// The peer is gone
    Disconnected,
}

/// Collaborators a session submits work to
pub struct SessionIo<'a> {
    /// Wireless stack
    pub gatt: &'a mut dyn GattClient,
    /// Cloud transport
    pub cloud: &'a mut dyn CloudClient,
}

/// How a session ended
#[derive(Debug)]
pub enum Outcome {
    /// Uplink delivered and downlink answered
    Completed,
    /// Ended early
    Aborted(SessionError),
}

/// Result of [`Session::advance`]
#[derive(Debug)]
pub enum SessionStatus {
    /// Still going
    Running,
    /// Just finished; reported exactly once
    Finished(Outcome),
    /// Finished earlier; the event was dropped
    Closed,
}

/// Uplink receiver and downlink sender of the data stages
#[derive(Debug)]
pub struct DataPath {
    receiver: Receiver<Uplink>,
    sender: Sender<DownlinkSource>,
}

impl DataPath {
    fn open(
        peer: Peer,
        config: &SessionConfig,
        link: &mut PeerLink<'_>,
        cloud: &mut dyn CloudClient,
    ) -> Result<Self, SessionError> {
        let uplink = Uplink::begin(peer, config.block_size, cloud)?;
        let downlink = DownlinkSource::new(Downlink::open(config.block_size));
        let mut path = Self {
            receiver: Receiver::new(uplink, config.transfer),
            sender: Sender::new(Packetizer::new(downlink), config.transfer, link.capacity()),
        };

        if let Err(e) = path.start(link) {
            path.abort(link, cloud);
            return Err(e);
        }
        Ok(path)
    }

    fn start(&mut self, link: &mut PeerLink<'_>) -> Result<(), SessionError> {
        let mut writer = link.writer(Endpoint::Uplink)?;
        self.receiver
            .open(&mut writer)
            .map_err(|e| SessionError::transfer(Endpoint::Uplink, e))?;
        self.pump_downlink(link)
    }

    /// The uplink in progress
    pub fn uplink(&self) -> &Uplink {
        self.receiver.sink()
    }

    /// Device stream received and every block accepted by the cloud
    pub fn uplink_done(&self) -> bool {
        self.receiver.is_complete() && self.uplink().result() == Some(UplinkResult::Success)
    }

    /// Downlink FIN acknowledged by the device
    pub fn downlink_done(&self) -> bool {
        self.sender.is_complete()
    }

    fn pump_downlink(&mut self, link: &mut PeerLink<'_>) -> Result<(), SessionError> {
        let mut writer = link.writer(Endpoint::Downlink)?;
        self.sender
            .pump(&mut writer)
            .map_err(|e| SessionError::transfer(Endpoint::Downlink, e))?;
        Ok(())
    }

    fn pump_uplink(&mut self, cloud: &mut dyn CloudClient) -> Result<(), SessionError> {
        match self.receiver.sink_mut().pump(cloud) {
            Some(UplinkResult::Success) | None => Ok(()),
            Some(result) => Err(SessionError::Uplink(result)),
        }
    }

    fn on_frame(
        &mut self,
        endpoint: Endpoint,
        frame: &Frame,
        link: &mut PeerLink<'_>,
        cloud: &mut dyn CloudClient,
    ) -> Result<(), SessionError> {
        let mut writer = link.writer(endpoint)?;
        match endpoint {
            Endpoint::Uplink => {
                self.receiver
                    .on_frame(frame, &mut writer)
                    .map_err(|e| SessionError::transfer(endpoint, e))?;
                self.pump_uplink(cloud)
            }
            Endpoint::Downlink => {
                self.sender
                    .on_frame(frame, &mut writer)
                    .map_err(|e| SessionError::transfer(endpoint, e))?;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn on_cloud(
        &mut self,
        event: CloudEvent,
        link: &mut PeerLink<'_>,
        cloud: &mut dyn CloudClient,
    ) -> Result<(), SessionError> {
        let handle = self.uplink().handle();
        if event.handle() != Some(handle) {
            debug!("Ignoring cloud event {:?}; active uplink is {}", event, handle);
            return Ok(());
        }

        let wake = match event {
            CloudEvent::BlockUploaded { index, result, .. } => {
                match self.receiver.sink_mut().on_block_uploaded(index, result, cloud) {
                    Some(UplinkResult::Success) | None => return Ok(()),
                    Some(result) => return Err(SessionError::Uplink(result)),
                }
            }
            CloudEvent::DownlinkBlock { data, is_last, .. } => {
                debug!("Downlink block of {} bytes (last={})", data.len(), is_last);
                self.sender.source_mut().downlink_mut().on_block(&data, is_last)
            }
            CloudEvent::DownlinkEnded { result, .. } => {
                self.sender.source_mut().downlink_mut().on_end(result)
            }
            CloudEvent::DeviceCertSubmitted { .. } => return Ok(()),
        };

        if wake {
            self.pump_downlink(link)?;
        }
        Ok(())
    }

    fn abort(&mut self, link: &mut PeerLink<'_>, cloud: &mut dyn CloudClient) {
        if let Ok(mut writer) = link.writer(Endpoint::Uplink) {
            self.receiver.abort(&mut writer);
        }
        if let Ok(mut writer) = link.writer(Endpoint::Downlink) {
            self.sender.abort(&mut writer);
        }
        self.release(cloud);
    }

    fn release(&mut self, cloud: &mut dyn CloudClient) {
        self.receiver.sink_mut().abort(cloud);
        self.sender.source_mut().downlink_mut().abort();
    }
}

/// Active sub-protocol of a session
#[derive(Debug)]
pub enum Stage {
    /// Looking for the pouch service; `fallback` once the 128-bit UUID is tried
    Discovering {
        /// Searching for the 128-bit UUID
        fallback: bool,
    },
    /// Reading the info record
    InfoRead(InfoRead),
    /// Exchanging certificates
    CertExchange(CertExchange),
    /// Receiving the device stream; the downlink may already be flowing
    UplinkActive(DataPath),
    /// Uplink delivered; sending the cloud response
    DownlinkActive(DataPath),
    /// All contexts released
    Finished,
}

impl Stage {
    /// Short name for logs
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Discovering { .. } => "discovering",
            Stage::InfoRead(_) => "info read",
            Stage::CertExchange(_) => "cert exchange",
            Stage::UplinkActive(_) => "uplink active",
            Stage::DownlinkActive(_) => "downlink active",
            Stage::Finished => "finished",
        }
    }
}

enum Step {
    Continue,
    Done,
}

/// One connected peer
#[derive(Debug)]
pub struct Session {
    peer: Peer,
    conn: ConnId,
    config: SessionConfig,
    certs: Arc<CertificateStore>,
    endpoints: EndpointSet,
    stage: Stage,
    provisioning: Provisioning,
}

impl Session {
    /// Create a session; discovery starts with [`SessionEvent::Start`]
    pub fn new(
        peer: Peer,
        conn: ConnId,
        config: SessionConfig,
        certs: Arc<CertificateStore>,
    ) -> Self {
        Self {
            peer,
            conn,
            config,
            certs,
            endpoints: EndpointSet::default(),
            stage: Stage::Discovering { fallback: false },
            provisioning: Provisioning::default(),
        }
    }

    /// Cloud-facing identity
    pub fn peer(&self) -> Peer {
        self.peer
    }

    /// Connection the session runs on
    pub fn conn(&self) -> ConnId {
        self.conn
    }

    /// Active stage
    pub fn stage(&self) -> &Stage {
        &self.stage
    }

    /// Discovered endpoints
    pub fn endpoints(&self) -> &EndpointSet {
        &self.endpoints
    }

    /// The device holds the current server certificate
    pub fn server_cert_provisioned(&self) -> bool {
        self.provisioning.server_cert
    }

    /// The cloud knows the device certificate
    pub fn device_cert_provisioned(&self) -> bool {
        self.provisioning.device_cert
    }

    /// Whether the session has ended
    pub fn is_finished(&self) -> bool {
        matches!(self.stage, Stage::Finished)
    }

    /// Feed one event
    pub fn advance(&mut self, event: SessionEvent, io: &mut SessionIo<'_>) -> SessionStatus {
        if self.is_finished() {
            debug!("Session {} finished; dropping {:?}", self.peer, event);
            return SessionStatus::Closed;
        }

        let result = match event {
            SessionEvent::Start => self.start_discovery(io),
            SessionEvent::Discovered(service) => self.on_discovered(service, io),
            SessionEvent::Notification { handle, data } => self.on_notification(handle, &data, io),
            SessionEvent::WriteFailed { handle, reason } => {
                Err(TransportError::Write { handle, reason }.into())
            }
            SessionEvent::Cloud(event) => self.on_cloud(event, io),
            SessionEvent::Disconnected => {
                self.release(io);
                warn!("Peer {} disconnected", self.peer);
                return SessionStatus::Finished(Outcome::Aborted(SessionError::Disconnected));
            }
        };

        match result {
            Ok(Step::Continue) => SessionStatus::Running,
            Ok(Step::Done) => {
                info!("Session {} complete", self.peer);
                self.stage = Stage::Finished;
                SessionStatus::Finished(Outcome::Completed)
            }
            Err(e) => {
                error!("Session {} aborted in {}: {}", self.peer, self.stage.name(), e);
                self.abort(io);
                SessionStatus::Finished(Outcome::Aborted(e))
            }
        }
    }

    fn start_discovery(&mut self, io: &mut SessionIo<'_>) -> Result<Step, SessionError> {
        debug!("Discovering pouch service on {}", self.conn);
        self.stage = Stage::Discovering { fallback: false };
        io.gatt.discover(self.conn, uuid16(SERVICE_UUID_16))?;
        Ok(Step::Continue)
    }

    fn on_discovered(
        &mut self,
        service: Option<GattService>,
        io: &mut SessionIo<'_>,
    ) -> Result<Step, SessionError> {
        let Stage::Discovering { fallback } = self.stage else {
            debug!("Ignoring discovery result in {}", self.stage.name());
            return Ok(Step::Continue);
        };

        let Some(service) = service else {
            if fallback {
                error!("Missing pouch service on {}", self.conn);
                return Err(SessionError::ServiceNotFound);
            }
            debug!("Could not find 16-bit UUID, beginning search for 128-bit");
            self.stage = Stage::Discovering { fallback: true };
            io.gatt.discover(self.conn, SERVICE_UUID_128)?;
            return Ok(Step::Continue);
        };

        self.endpoints = EndpointSet::from_discovery(&service)?;
        for (endpoint, handles) in self.endpoints.subscriptions() {
            debug!("Subscribing to {} notifications", endpoint);
            io.gatt.subscribe(self.conn, handles)?;
        }
        info!("Discovered pouch service {} on {}", service.uuid, self.conn);

        self.start_info(io)
    }

    fn start_info(&mut self, io: &mut SessionIo<'_>) -> Result<Step, SessionError> {
        if self.endpoints.notifying(Endpoint::Info).is_none() {
            warn!("No info characteristic on {}; assuming nothing is provisioned", self.conn);
            self.provisioning = Provisioning::default();
            return self.start_cert_exchange(io);
        }

        let mut link = PeerLink::new(&mut *io.gatt, self.conn, &self.endpoints);
        let mut writer = link.writer(Endpoint::Info)?;
        let read = InfoRead::open(self.config.transfer, &mut writer)
            .map_err(|e| SessionError::transfer(Endpoint::Info, e))?;
        self.stage = Stage::InfoRead(read);
        Ok(Step::Continue)
    }

    fn start_cert_exchange(&mut self, io: &mut SessionIo<'_>) -> Result<Step, SessionError> {
        if !self.endpoints.supports_cert_exchange() {
            warn!("Could not discover certificate characteristics");
            info!("Starting uplink without cert exchange");
            return self.start_data_path(io);
        }

        let mut exchange = CertExchange::new(
            self.peer,
            self.certs.clone(),
            self.config.clone(),
            self.provisioning,
        );
        let mut link = PeerLink::new(&mut *io.gatt, self.conn, &self.endpoints);
        let step = exchange.start(&mut link);
        self.stage = Stage::CertExchange(exchange);

        match step? {
            ExchangeStep::Pending => Ok(Step::Continue),
            ExchangeStep::Done => self.start_data_path(io),
        }
    }

    fn start_data_path(&mut self, io: &mut SessionIo<'_>) -> Result<Step, SessionError> {
        if let Stage::CertExchange(exchange) = &self.stage {
            self.provisioning = exchange.provisioning();
        }

        let mut link = PeerLink::new(&mut *io.gatt, self.conn, &self.endpoints);
        let path = DataPath::open(self.peer, &self.config, &mut link, &mut *io.cloud)?;
        info!("Uplink {} started for {}", path.uplink().handle(), self.peer);
        self.stage = Stage::UplinkActive(path);
        Ok(Step::Continue)
    }

    /// Whether the active stage has a transfer on `endpoint`
    fn listens_on(&self, endpoint: Endpoint) -> bool {
        match &self.stage {
            Stage::InfoRead(_) => endpoint == Endpoint::Info,
            Stage::CertExchange(exchange) => exchange.endpoint() == Some(endpoint),
            Stage::UplinkActive(_) | Stage::DownlinkActive(_) => {
                matches!(endpoint, Endpoint::Uplink | Endpoint::Downlink)
            }
            Stage::Discovering { .. } | Stage::Finished => false,
        }
    }

    fn on_notification(
        &mut self,
        handle: u16,
        data: &[u8],
        io: &mut SessionIo<'_>,
    ) -> Result<Step, SessionError> {
        let Some(endpoint) = self.endpoints.endpoint_for(handle) else {
            debug!("Notification on unknown handle {}", handle);
            return Ok(Step::Continue);
        };
        if !self.listens_on(endpoint) {
            debug!(
                "Ignoring unsolicited frame on {} endpoint in {}",
                endpoint,
                self.stage.name()
            );
            return Ok(Step::Continue);
        }

        let frame = Frame::decode(data).map_err(|e| SessionError::transfer(endpoint, e.into()))?;
        let mut link = PeerLink::new(&mut *io.gatt, self.conn, &self.endpoints);

        match &mut self.stage {
            Stage::InfoRead(read) => {
                let mut writer = link.writer(Endpoint::Info)?;
                let progress = read
                    .on_frame(&frame, &mut writer)
                    .map_err(|e| SessionError::transfer(Endpoint::Info, e))?;
                if let InfoProgress::Done(info) = progress {
                    let serial = self.certs.serial();
                    self.provisioning = match &info {
                        Some(info) => Provisioning::from_info(info, serial.as_deref()),
                        None => Provisioning::default(),
                    };
                    info!(
                        "Info from {}: server cert provisioned={} device cert provisioned={}",
                        self.peer, self.provisioning.server_cert, self.provisioning.device_cert
                    );
                    return self.start_cert_exchange(io);
                }
                Ok(Step::Continue)
            }
            Stage::CertExchange(exchange) => {
                match exchange.on_frame(endpoint, &frame, &mut link, &mut *io.cloud)? {
                    ExchangeStep::Pending => Ok(Step::Continue),
                    ExchangeStep::Done => self.start_data_path(io),
                }
            }
            Stage::UplinkActive(path) | Stage::DownlinkActive(path) => {
                path.on_frame(endpoint, &frame, &mut link, &mut *io.cloud)?;
                self.settle()
            }
            Stage::Discovering { .. } | Stage::Finished => Ok(Step::Continue),
        }
    }

    fn on_cloud(&mut self, event: CloudEvent, io: &mut SessionIo<'_>) -> Result<Step, SessionError> {
        let stage = self.stage.name();
        let mut link = PeerLink::new(&mut *io.gatt, self.conn, &self.endpoints);
        match &mut self.stage {
            Stage::CertExchange(exchange) => match exchange.on_cloud(event)? {
                ExchangeStep::Pending => Ok(Step::Continue),
                ExchangeStep::Done => self.start_data_path(io),
            },
            Stage::UplinkActive(path) | Stage::DownlinkActive(path) => {
                path.on_cloud(event, &mut link, &mut *io.cloud)?;
                self.settle()
            }
            _ => {
                debug!("Ignoring cloud event in {}", stage);
                Ok(Step::Continue)
            }
        }
    }

    /// Move between the data stages once a direction completes
    fn settle(&mut self) -> Result<Step, SessionError> {
        if matches!(&self.stage, Stage::UplinkActive(path) if path.uplink_done()) {
            if let Stage::UplinkActive(path) = std::mem::replace(&mut self.stage, Stage::Finished) {
                info!("Uplink from {} delivered; downlink active", self.peer);
                self.stage = Stage::DownlinkActive(path);
            }
        }

        if let Stage::DownlinkActive(path) = &self.stage {
            if path.downlink_done() {
                if path.sender.fin_code() == FinCode::Aborted {
                    return Err(SessionError::DownlinkAborted);
                }
                return Ok(Step::Done);
            }
        }
        Ok(Step::Continue)
    }

    /// Abort the active stage, telling the peer where a transfer was open
    fn abort(&mut self, io: &mut SessionIo<'_>) {
        let stage = std::mem::replace(&mut self.stage, Stage::Finished);
        let mut link = PeerLink::new(&mut *io.gatt, self.conn, &self.endpoints);
        match stage {
            Stage::InfoRead(mut read) => {
                if let Ok(mut writer) = link.writer(Endpoint::Info) {
                    read.abort(&mut writer);
                }
            }
            Stage::CertExchange(mut exchange) => exchange.abort(&mut link),
            Stage::UplinkActive(mut path) | Stage::DownlinkActive(mut path) => {
                path.abort(&mut link, &mut *io.cloud)
            }
            Stage::Discovering { .. } | Stage::Finished => {}
        }
    }

    /// Drop every context without touching the link
    fn release(&mut self, io: &mut SessionIo<'_>) {
        let stage = std::mem::replace(&mut self.stage, Stage::Finished);
        if let Stage::UplinkActive(mut path) | Stage::DownlinkActive(mut path) = stage {
            path.release(&mut *io.cloud);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::tests::{drive, run, step, SimCloud};
    use crate::sim::{SimDevice, SimDeviceConfig, SimLink};
    use gateway_cloud::{CertError, CloudResponse};
    use gateway_wire::{encode_nack, DeviceInfo, InfoFlags, NackCode};

    const SERVER_A: &[u8] = include_bytes!("../../cloud/testdata/server_a.pem");
    const SERVER_B: &[u8] = include_bytes!("../../cloud/testdata/server_b.pem");
    const CONN: ConnId = ConnId(7);

    fn certs() -> Arc<CertificateStore> {
        let store = CertificateStore::new();
        store.update(Bytes::from_static(SERVER_A)).unwrap();
        Arc::new(store)
    }

    fn setup(device: SimDeviceConfig, config: SessionConfig) -> (Session, SimLink) {
        let mut link = SimLink::new();
        link.attach(CONN, SimDevice::new(device));
        (Session::new(Peer(0x42), CONN, config, certs()), link)
    }

    fn device(link: &SimLink) -> &SimDevice {
        link.device(CONN).unwrap()
    }

    fn start(session: &mut Session, link: &mut SimLink, cloud: &mut SimCloud) {
        let mut io = SessionIo {
            gatt: link,
            cloud,
        };
        assert!(matches!(
            session.advance(SessionEvent::Start, &mut io),
            SessionStatus::Running
        ));
    }

    /// Step until `done` holds, failing if the session finishes first
    fn step_until(
        session: &mut Session,
        link: &mut SimLink,
        cloud: &mut SimCloud,
        done: impl Fn(&Session, &SimLink) -> bool,
    ) {
        while !done(session, link) {
            match step(session, link, cloud) {
                Some(SessionStatus::Running) => {}
                other => panic!("session stopped early: {:?}", other),
            }
        }
    }

    #[test]
    fn test_full_session() {
        let (mut session, mut link) = setup(SimDeviceConfig::default(), SessionConfig::default());
        let mut cloud = SimCloud::with_response(CloudResponse::Echo);

        let outcome = drive(&mut session, &mut link, &mut cloud);
        assert!(matches!(outcome, Some(Outcome::Completed)));
        assert!(session.is_finished());
        assert!(session.server_cert_provisioned());
        assert!(session.device_cert_provisioned());

        let uplink = device(&link).config().uplink.clone();
        assert_eq!(device(&link).server_certs(), &[Bytes::from_static(SERVER_A)]);
        assert_eq!(
            cloud.device_certs,
            vec![(Peer(0x42), device(&link).config().device_cert.clone())]
        );
        assert_eq!(cloud.finished.len(), 1);
        assert_eq!(cloud.finished[0].1, uplink);
        assert_eq!(device(&link).downlinks(), &[uplink]);
        assert!(device(&link).errors().is_empty());

        // The uplink receiver opens the window before the device sends
        assert_eq!(
            device(&link).written_to(Endpoint::Uplink)[0],
            Frame::Ack { seq: 15, window: 8 }
        );
    }

    #[test]
    fn test_provisioned_device_skips_cert_exchange() {
        let info = DeviceInfo {
            flags: InfoFlags::DEVICE_CERT_PROVISIONED,
            server_cert_serial: Some(Bytes::from_static(&[0x1a, 0x2b, 0x3c])),
        };
        let (mut session, mut link) = setup(
            SimDeviceConfig::default().with_info(&info),
            SessionConfig::default(),
        );
        let mut cloud = SimCloud::default();

        let outcome = drive(&mut session, &mut link, &mut cloud);
        assert!(matches!(outcome, Some(Outcome::Completed)));
        assert!(device(&link).written_to(Endpoint::ServerCert).is_empty());
        assert!(device(&link).written_to(Endpoint::DeviceCert).is_empty());
        assert!(cloud.device_certs.is_empty());
    }

    #[test]
    fn test_undecodable_info_pushes_server_cert() {
        let device_config = SimDeviceConfig {
            info: Some(Bytes::from_static(b"\xff\xfe not cbor")),
            ..Default::default()
        };
        let (mut session, mut link) = setup(device_config, SessionConfig::default());
        let mut cloud = SimCloud::default();

        let outcome = drive(&mut session, &mut link, &mut cloud);
        assert!(matches!(outcome, Some(Outcome::Completed)));
        assert_eq!(device(&link).server_certs().len(), 1);
        assert_eq!(cloud.device_certs.len(), 1);
    }

    #[test]
    fn test_unsolicited_nack_is_ignored() {
        let (mut session, mut link) = setup(SimDeviceConfig::default(), SessionConfig::default());
        let mut cloud = SimCloud::default();

        start(&mut session, &mut link, &mut cloud);
        step_until(&mut session, &mut link, &mut cloud, |s, _| {
            matches!(s.stage(), Stage::UplinkActive(_))
        });
        link.inject(
            CONN,
            SessionEvent::Notification {
                handle: 0x1b,
                data: encode_nack(NackCode::Idle),
            },
        );

        let outcome = run(&mut session, &mut link, &mut cloud);
        assert!(matches!(outcome, Some(Outcome::Completed)));
    }

    #[test]
    fn test_certificate_update_restarts_push() {
        let (mut session, mut link) = setup(SimDeviceConfig::default(), SessionConfig::default());
        let mut cloud = SimCloud::default();

        start(&mut session, &mut link, &mut cloud);
        step_until(&mut session, &mut link, &mut cloud, |_, l| {
            !device(l).written_to(Endpoint::ServerCert).is_empty()
        });
        session.certs.update(Bytes::from_static(SERVER_B)).unwrap();

        let outcome = run(&mut session, &mut link, &mut cloud);
        assert!(matches!(outcome, Some(Outcome::Completed)));
        assert_eq!(
            device(&link).server_certs(),
            &[Bytes::from_static(SERVER_A), Bytes::from_static(SERVER_B)]
        );
        assert!(session.server_cert_provisioned());
    }

    #[test]
    fn test_falls_back_to_128_bit_service() {
        let device_config = SimDeviceConfig {
            service_128_only: true,
            ..Default::default()
        };
        let (mut session, mut link) = setup(device_config, SessionConfig::default());
        let mut cloud = SimCloud::default();

        let outcome = drive(&mut session, &mut link, &mut cloud);
        assert!(matches!(outcome, Some(Outcome::Completed)));
        assert!(session.endpoints().supports_cert_exchange());
    }

    #[test]
    fn test_missing_service_is_fatal() {
        let (mut session, mut link) = setup(SimDeviceConfig::default(), SessionConfig::default());
        let mut cloud = SimCloud::default();

        // Feed empty results for both the 16-bit and the 128-bit search
        let mut io = SessionIo {
            gatt: &mut link,
            cloud: &mut cloud,
        };
        assert!(matches!(
            session.advance(SessionEvent::Discovered(None), &mut io),
            SessionStatus::Running
        ));
        assert!(matches!(
            session.advance(SessionEvent::Discovered(None), &mut io),
            SessionStatus::Finished(Outcome::Aborted(SessionError::ServiceNotFound))
        ));
        assert!(matches!(
            session.advance(SessionEvent::Start, &mut io),
            SessionStatus::Closed
        ));
    }

    #[test]
    fn test_missing_downlink_is_fatal() {
        let device_config = SimDeviceConfig {
            with_downlink: false,
            ..Default::default()
        };
        let (mut session, mut link) = setup(device_config, SessionConfig::default());
        let mut cloud = SimCloud::default();

        let outcome = drive(&mut session, &mut link, &mut cloud);
        assert!(matches!(
            outcome,
            Some(Outcome::Aborted(SessionError::MissingEndpoint(Endpoint::Downlink)))
        ));
        assert!(cloud.uploads.is_empty());
    }

    #[test]
    fn test_missing_cert_endpoints_skip_to_uplink() {
        let device_config = SimDeviceConfig {
            cert_endpoints: false,
            ..Default::default()
        };
        let (mut session, mut link) = setup(device_config, SessionConfig::default());
        let mut cloud = SimCloud::default();

        let outcome = drive(&mut session, &mut link, &mut cloud);
        assert!(matches!(outcome, Some(Outcome::Completed)));
        assert!(!session.server_cert_provisioned());
        assert!(cloud.device_certs.is_empty());
        assert_eq!(cloud.finished.len(), 1);
    }

    #[test]
    fn test_missing_info_assumes_nothing_provisioned() {
        let device_config = SimDeviceConfig {
            info: None,
            ..Default::default()
        };
        let (mut session, mut link) = setup(device_config, SessionConfig::default());
        let mut cloud = SimCloud::default();

        let outcome = drive(&mut session, &mut link, &mut cloud);
        assert!(matches!(outcome, Some(Outcome::Completed)));
        assert_eq!(device(&link).server_certs().len(), 1);
    }

    #[test]
    fn test_empty_downlink() {
        let (mut session, mut link) = setup(SimDeviceConfig::default(), SessionConfig::default());
        let mut cloud = SimCloud::default();

        let outcome = drive(&mut session, &mut link, &mut cloud);
        assert!(matches!(outcome, Some(Outcome::Completed)));

        let frames = device(&link).written_to(Endpoint::Downlink);
        assert_eq!(
            frames,
            vec![
                Frame::Data {
                    seq: 0,
                    first: true,
                    last: true,
                    payload: Bytes::new(),
                },
                Frame::Fin {
                    seq: 1,
                    code: FinCode::Ok,
                },
            ]
        );
        assert_eq!(device(&link).downlinks(), &[Bytes::new()]);
    }

    #[test]
    fn test_oversized_device_cert() {
        let config = SessionConfig {
            device_cert_max_len: 8,
            ..Default::default()
        };
        let (mut session, mut link) = setup(SimDeviceConfig::default(), config);
        let mut cloud = SimCloud::default();

        let outcome = drive(&mut session, &mut link, &mut cloud);
        assert!(matches!(
            outcome,
            Some(Outcome::Aborted(SessionError::Cert(CertError::TooLarge { limit: 8 })))
        ));
        assert!(cloud.device_certs.is_empty());
        assert!(cloud.uploads.is_empty());
        assert_eq!(
            device(&link).written_to(Endpoint::DeviceCert).last(),
            Some(&Frame::Nack {
                code: NackCode::Overflow
            })
        );
    }

    #[test]
    fn test_rejected_device_cert_aborts() {
        let (mut session, mut link) = setup(SimDeviceConfig::default(), SessionConfig::default());
        let mut cloud = SimCloud {
            reject_device_cert: true,
            ..Default::default()
        };

        let outcome = drive(&mut session, &mut link, &mut cloud);
        assert!(matches!(
            outcome,
            Some(Outcome::Aborted(SessionError::Cert(CertError::Submit(_))))
        ));
        assert_eq!(cloud.device_certs.len(), 1);
        assert!(!session.device_cert_provisioned());
        // No uplink was opened
        assert!(cloud.uploads.is_empty());
        assert!(device(&link).written_to(Endpoint::Uplink).is_empty());
    }

    #[test]
    fn test_cloud_upload_failure() {
        let (mut session, mut link) = setup(SimDeviceConfig::default(), SessionConfig::default());
        let mut cloud = SimCloud {
            fail_upload: Some(0),
            ..Default::default()
        };

        let outcome = drive(&mut session, &mut link, &mut cloud);
        assert!(matches!(
            outcome,
            Some(Outcome::Aborted(SessionError::Uplink(UplinkResult::CloudError)))
        ));
        assert_eq!(cloud.cancelled.len(), 1);
        assert!(cloud.finished.is_empty());
    }

    #[test]
    fn test_disconnect_releases_uplink() {
        let (mut session, mut link) = setup(SimDeviceConfig::default(), SessionConfig::default());
        let mut cloud = SimCloud::default();

        start(&mut session, &mut link, &mut cloud);
        step_until(&mut session, &mut link, &mut cloud, |s, _| {
            matches!(s.stage(), Stage::UplinkActive(_))
        });
        let written = device(&link).written().len();

        let mut io = SessionIo {
            gatt: &mut link,
            cloud: &mut cloud,
        };
        assert!(matches!(
            session.advance(SessionEvent::Disconnected, &mut io),
            SessionStatus::Finished(Outcome::Aborted(SessionError::Disconnected))
        ));
        assert!(matches!(
            session.advance(SessionEvent::Disconnected, &mut io),
            SessionStatus::Closed
        ));
        assert_eq!(cloud.cancelled.len(), 1);
        assert_eq!(device(&link).written().len(), written);
    }

    #[test]
    fn test_write_failure_aborts() {
        let (mut session, mut link) = setup(SimDeviceConfig::default(), SessionConfig::default());
        let mut cloud = SimCloud::default();

        start(&mut session, &mut link, &mut cloud);
        link.inject(
            CONN,
            SessionEvent::WriteFailed {
                handle: 0x12,
                reason: "link loss".to_string(),
            },
        );
        let outcome = run(&mut session, &mut link, &mut cloud);
        assert!(matches!(
            outcome,
            Some(Outcome::Aborted(SessionError::Transport(TransportError::Write { handle: 0x12, .. })))
        ));
    }

    #[test]
    fn test_transfer_config_normalized() {
        let config = TransferConfig {
            window: 20,
            ack_threshold: 0,
        }
        .normalized();
        assert_eq!(config.window, 8);
        assert_eq!(config.ack_threshold, 1);

        let config = TransferConfig {
            window: 0,
            ack_threshold: 5,
        }
        .normalized();
        assert_eq!(config.window, 1);
        assert_eq!(config.ack_threshold, 1);
    }
}
