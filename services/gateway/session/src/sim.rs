//! Simulated pouch peripherals.
//!
//! [`SimDevice`] runs the device half of the protocol with the same
//! [`Sender`] and [`Receiver`] the gateway uses: it serves the info record,
//! the uplink and the device certificate, and collects the server
//! certificate and the downlink. [`SimLink`] implements [`GattClient`] over
//! a set of such devices and queues whatever they notify as
//! [`SessionEvent`]s.
//!
//! Handle layout of a simulated service:
//!
//! ```text
//! 0x12/0x13  info         value/CCC
//! 0x15/0x16  uplink       value/CCC
//! 0x18/0x19  downlink     value/CCC
//! 0x1b/0x1c  server cert  value/CCC
//! 0x1e/0x1f  device cert  value/CCC
//! ```

use crate::error::{TransferError, TransportError};
use crate::receiver::{RecvProgress, Receiver};
use crate::sender::{SendProgress, Sender};
use crate::session::{SessionEvent, TransferConfig};
use crate::transport::{
    payload_capacity_for_mtu, uuid16, AttrHandles, Characteristic, ConnId, Endpoint,
    FrameWriter, GattClient, GattService, SERVICE_UUID_128, SERVICE_UUID_16,
};
use bytes::Bytes;
use gateway_wire::{BufferSink, BufferSource, DeviceInfo, Frame, Packetizer};
use std::collections::{BTreeMap, HashSet, VecDeque};
use tracing::{debug, warn};
use uuid::Uuid;

const SERVER_CERT_LIMIT: usize = 4096;
const DOWNLINK_LIMIT: usize = 64 * 1024;

fn value_handle(endpoint: Endpoint) -> u16 {
    match endpoint {
        Endpoint::Info => 0x12,
        Endpoint::Uplink => 0x15,
        Endpoint::Downlink => 0x18,
        Endpoint::ServerCert => 0x1b,
        Endpoint::DeviceCert => 0x1e,
    }
}

fn endpoint_for(handle: u16) -> Option<Endpoint> {
    Endpoint::ALL
        .into_iter()
        .find(|e| value_handle(*e) == handle)
}

/// What a simulated device exposes and sends
#[derive(Clone, Debug)]
pub struct SimDeviceConfig {
    /// Raw info record; `None` leaves out the info characteristic
    pub info: Option<Bytes>,
    /// Expose the certificate characteristics
    pub cert_endpoints: bool,
    /// Certificate sent when the gateway pulls it
    pub device_cert: Bytes,
    /// Payload streamed on the uplink
    pub uplink: Bytes,
    /// Advertise only the 128-bit service UUID
    pub service_128_only: bool,
    /// Expose the downlink characteristic
    pub with_downlink: bool,
    /// Negotiated ATT MTU
    pub mtu: u16,
    /// Device-side window settings
    pub transfer: TransferConfig,
}

impl SimDeviceConfig {
    /// Replace the info record with an encoded [`DeviceInfo`]
    pub fn with_info(mut self, info: &DeviceInfo) -> Self {
        self.info = info.encode().ok();
        self
    }

    /// Set the uplink payload
    pub fn with_uplink(mut self, payload: impl Into<Bytes>) -> Self {
        self.uplink = payload.into();
        self
    }
}

impl Default for SimDeviceConfig {
    fn default() -> Self {
        Self {
            info: DeviceInfo::default().encode().ok(),
            cert_endpoints: true,
            device_cert: Bytes::from_static(b"simulated device certificate"),
            uplink: Bytes::from_static(b"hello from a simulated pouch device"),
            service_128_only: false,
            with_downlink: true,
            mtu: 64,
            transfer: TransferConfig::default(),
        }
    }
}

#[derive(Debug)]
enum Outgoing {
    /// Waiting for the gateway's window-open ACK
    Waiting(Bytes),
    Sending(Sender<BufferSource>),
    Done,
}

/// Writes device frames into the notification queue
struct Notifier<'a> {
    outbox: &'a mut VecDeque<(u16, Bytes)>,
    handle: u16,
    capacity: usize,
    subscribed: bool,
}

impl FrameWriter for Notifier<'_> {
    fn capacity(&self) -> usize {
        self.capacity
    }

    fn write_frame(&mut self, frame: Bytes) -> Result<(), TransportError> {
        if !self.subscribed {
            debug!("Dropping notification on unsubscribed handle {}", self.handle);
            return Ok(());
        }
        self.outbox.push_back((self.handle, frame));
        Ok(())
    }
}

/// Device half of one connection
#[derive(Debug)]
pub struct SimDevice {
    config: SimDeviceConfig,
    subscribed: HashSet<u16>,
    outgoing: BTreeMap<Endpoint, Outgoing>,
    server_cert_rx: Receiver<BufferSink>,
    downlink_rx: Receiver<BufferSink>,
    outbox: VecDeque<(u16, Bytes)>,
    written: Vec<(u16, Bytes)>,
    server_certs: Vec<Bytes>,
    downlinks: Vec<Bytes>,
    sent: Vec<Endpoint>,
    errors: Vec<(Endpoint, TransferError)>,
    connected: bool,
}

impl SimDevice {
    /// Create a device in its advertising state
    pub fn new(config: SimDeviceConfig) -> Self {
        let mut outgoing = BTreeMap::new();
        if let Some(info) = &config.info {
            outgoing.insert(Endpoint::Info, Outgoing::Waiting(info.clone()));
        }
        outgoing.insert(Endpoint::Uplink, Outgoing::Waiting(config.uplink.clone()));
        if config.cert_endpoints {
            outgoing.insert(
                Endpoint::DeviceCert,
                Outgoing::Waiting(config.device_cert.clone()),
            );
        }

        Self {
            server_cert_rx: listening(SERVER_CERT_LIMIT, config.transfer),
            downlink_rx: listening(DOWNLINK_LIMIT, config.transfer),
            config,
            subscribed: HashSet::new(),
            outgoing,
            outbox: VecDeque::new(),
            written: Vec::new(),
            server_certs: Vec::new(),
            downlinks: Vec::new(),
            sent: Vec::new(),
            errors: Vec::new(),
            connected: true,
        }
    }

    /// Configuration the device was built with
    pub fn config(&self) -> &SimDeviceConfig {
        &self.config
    }

    /// Frames the gateway wrote, in order
    pub fn written(&self) -> &[(u16, Bytes)] {
        &self.written
    }

    /// Frames the gateway wrote to one endpoint
    pub fn written_to(&self, endpoint: Endpoint) -> Vec<Frame> {
        let handle = value_handle(endpoint);
        self.written
            .iter()
            .filter(|(h, _)| *h == handle)
            .filter_map(|(_, f)| Frame::decode(f).ok())
            .collect()
    }

    /// Server certificates received, one per completed push
    pub fn server_certs(&self) -> &[Bytes] {
        &self.server_certs
    }

    /// Downlinks received
    pub fn downlinks(&self) -> &[Bytes] {
        &self.downlinks
    }

    /// Endpoints whose device-to-gateway transfer completed
    pub fn sent(&self) -> &[Endpoint] {
        &self.sent
    }

    /// Transfer failures seen on the device side
    pub fn errors(&self) -> &[(Endpoint, TransferError)] {
        &self.errors
    }

    /// Whether the gateway still holds the connection
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// The service as found by a discovery for `uuid`
    pub fn service(&self, uuid: Uuid) -> Option<GattService> {
        let matches = uuid == SERVICE_UUID_128
            || (uuid == uuid16(SERVICE_UUID_16) && !self.config.service_128_only);
        if !matches {
            return None;
        }

        let mut endpoints = vec![Endpoint::Uplink];
        if self.config.info.is_some() {
            endpoints.push(Endpoint::Info);
        }
        if self.config.with_downlink {
            endpoints.push(Endpoint::Downlink);
        }
        if self.config.cert_endpoints {
            endpoints.extend([Endpoint::ServerCert, Endpoint::DeviceCert]);
        }
        endpoints.sort_by_key(|e| value_handle(*e));

        Some(GattService {
            uuid,
            characteristics: endpoints
                .iter()
                .map(|e| Characteristic {
                    uuid: e.uuid(),
                    value_handle: value_handle(*e),
                })
                .collect(),
            ccc_descriptors: endpoints.iter().map(|e| value_handle(*e) + 1).collect(),
        })
    }

    fn subscribe(&mut self, handles: AttrHandles) -> Result<(), TransportError> {
        match handles.ccc {
            Some(ccc) if ccc == handles.value + 1 => {
                self.subscribed.insert(handles.value);
                Ok(())
            }
            _ => Err(TransportError::Subscribe {
                handle: handles.value,
                reason: "no CCC descriptor".to_string(),
            }),
        }
    }

    /// Process one frame written by the gateway
    pub fn on_write(&mut self, handle: u16, data: Bytes) {
        self.written.push((handle, data.clone()));

        let Some(endpoint) = endpoint_for(handle) else {
            warn!("Write to unknown handle {}", handle);
            return;
        };
        let frame = match Frame::decode(&data) {
            Ok(frame) => frame,
            Err(e) => {
                self.errors.push((endpoint, e.into()));
                return;
            }
        };

        match endpoint {
            Endpoint::ServerCert | Endpoint::Downlink => self.on_incoming(endpoint, &frame),
            _ => self.on_outgoing(endpoint, &frame),
        }
    }

    fn notifier(&mut self, endpoint: Endpoint) -> Notifier<'_> {
        let handle = value_handle(endpoint);
        Notifier {
            outbox: &mut self.outbox,
            handle,
            capacity: payload_capacity_for_mtu(self.config.mtu),
            subscribed: self.subscribed.contains(&handle),
        }
    }

    fn on_outgoing(&mut self, endpoint: Endpoint, frame: &Frame) {
        let capacity = payload_capacity_for_mtu(self.config.mtu);
        let transfer = self.config.transfer;
        let state = self.outgoing.remove(&endpoint).unwrap_or(Outgoing::Done);

        let next = match state {
            Outgoing::Waiting(payload) => {
                if matches!(frame, Frame::Ack { .. }) {
                    let sender = Sender::new(
                        Packetizer::new(BufferSource::new(payload)),
                        transfer,
                        capacity,
                    );
                    self.feed_sender(endpoint, sender, frame)
                } else {
                    debug!("Device ignoring {:?} on {} before the window opened", frame, endpoint);
                    Outgoing::Waiting(payload)
                }
            }
            Outgoing::Sending(sender) => self.feed_sender(endpoint, sender, frame),
            Outgoing::Done => {
                debug!("Device ignoring {:?} on finished {} transfer", frame, endpoint);
                Outgoing::Done
            }
        };
        self.outgoing.insert(endpoint, next);
    }

    fn feed_sender(
        &mut self,
        endpoint: Endpoint,
        mut sender: Sender<BufferSource>,
        frame: &Frame,
    ) -> Outgoing {
        let mut notifier = self.notifier(endpoint);
        match sender.on_frame(frame, &mut notifier) {
            Ok(SendProgress::Pending) => Outgoing::Sending(sender),
            Ok(SendProgress::Complete) => {
                self.sent.push(endpoint);
                Outgoing::Done
            }
            Err(e) => {
                self.errors.push((endpoint, e));
                Outgoing::Done
            }
        }
    }

    fn on_incoming(&mut self, endpoint: Endpoint, frame: &Frame) {
        let mut receiver = match endpoint {
            Endpoint::ServerCert => std::mem::replace(
                &mut self.server_cert_rx,
                listening(SERVER_CERT_LIMIT, self.config.transfer),
            ),
            _ => std::mem::replace(
                &mut self.downlink_rx,
                listening(DOWNLINK_LIMIT, self.config.transfer),
            ),
        };

        let mut notifier = self.notifier(endpoint);
        let result = receiver.on_frame(frame, &mut notifier);
        match result {
            Ok(RecvProgress::Pending) => {
                // Keep the transfer in progress; the fresh receiver is dropped
                match endpoint {
                    Endpoint::ServerCert => self.server_cert_rx = receiver,
                    _ => self.downlink_rx = receiver,
                }
            }
            Ok(RecvProgress::Complete) => {
                let data = receiver.into_sink().into_bytes();
                debug!("Device received {} bytes on {}", data.len(), endpoint);
                match endpoint {
                    Endpoint::ServerCert => self.server_certs.push(data),
                    _ => self.downlinks.push(data),
                }
            }
            Err(e) => self.errors.push((endpoint, e)),
        }
    }

    /// Take the notifications queued so far
    pub fn drain_notifications(&mut self) -> Vec<(u16, Bytes)> {
        self.outbox.drain(..).collect()
    }
}

fn listening(limit: usize, transfer: TransferConfig) -> Receiver<BufferSink> {
    let mut receiver = Receiver::new(BufferSink::new(limit), transfer);
    receiver.listen();
    receiver
}

/// [`GattClient`] over simulated devices
#[derive(Debug, Default)]
pub struct SimLink {
    devices: BTreeMap<ConnId, SimDevice>,
    events: VecDeque<(ConnId, SessionEvent)>,
}

impl SimLink {
    /// Create a link with no devices
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a device on `conn`
    pub fn attach(&mut self, conn: ConnId, device: SimDevice) {
        self.devices.insert(conn, device);
    }

    /// Device on a connection
    pub fn device(&self, conn: ConnId) -> Option<&SimDevice> {
        self.devices.get(&conn)
    }

    /// Remove a device
    pub fn detach(&mut self, conn: ConnId) -> Option<SimDevice> {
        self.devices.remove(&conn)
    }

    /// Queue an event as if the stack had reported it
    pub fn inject(&mut self, conn: ConnId, event: SessionEvent) {
        self.events.push_back((conn, event));
    }

    /// Next event for the gateway, collecting device notifications first
    pub fn next_event(&mut self) -> Option<(ConnId, SessionEvent)> {
        if self.events.is_empty() {
            for (conn, device) in self.devices.iter_mut() {
                if !device.connected {
                    device.outbox.clear();
                    continue;
                }
                for (handle, data) in device.drain_notifications() {
                    self.events
                        .push_back((*conn, SessionEvent::Notification { handle, data }));
                }
            }
        }
        self.events.pop_front()
    }

    fn device_mut(&mut self, conn: ConnId) -> Result<&mut SimDevice, TransportError> {
        self.devices
            .get_mut(&conn)
            .filter(|d| d.connected)
            .ok_or(TransportError::NotConnected)
    }
}

impl GattClient for SimLink {
    fn discover(&mut self, conn: ConnId, service: Uuid) -> Result<(), TransportError> {
        let found = self.device_mut(conn)?.service(service);
        self.events.push_back((conn, SessionEvent::Discovered(found)));
        Ok(())
    }

    fn subscribe(&mut self, conn: ConnId, handles: AttrHandles) -> Result<(), TransportError> {
        self.device_mut(conn)?.subscribe(handles)
    }

    fn write(&mut self, conn: ConnId, handle: u16, frame: Bytes) -> Result<(), TransportError> {
        self.device_mut(conn)?.on_write(handle, frame);
        Ok(())
    }

    fn payload_capacity(&self, conn: ConnId) -> usize {
        self.devices
            .get(&conn)
            .map(|d| payload_capacity_for_mtu(d.config.mtu))
            .unwrap_or(0)
    }

    fn disconnect(&mut self, conn: ConnId) {
        if let Some(device) = self.devices.get_mut(&conn) {
            if device.connected {
                device.connected = false;
                self.events.push_back((conn, SessionEvent::Disconnected));
            }
        }
    }
}
