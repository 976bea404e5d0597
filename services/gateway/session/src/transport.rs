//! Wireless link seam.
//!
//! The engine never talks to a Bluetooth stack directly. It submits work
//! through [`GattClient`] and receives completions (discovery results,
//! notifications, write failures) as session events. Transfers only see a
//! [`FrameWriter`] bound to one endpoint.

use crate::error::{SessionError, TransportError};
use bytes::Bytes;
use std::fmt;
use tracing::{debug, warn};
use uuid::Uuid;

/// ATT header bytes taken out of every notification or write
pub const ATT_OVERHEAD: usize = 3;

/// 16-bit service UUID the gateway looks for first
pub const SERVICE_UUID_16: u16 = 0xFC49;

/// 128-bit service UUID used by devices without a 16-bit allocation
pub const SERVICE_UUID_128: Uuid = Uuid::from_u128(0x89a316ae_89b7_4ef6_b1d3_5c9a6e27d1e0);

/// Info record characteristic
pub const INFO_UUID: Uuid = Uuid::from_u128(0x89a316ae_89b7_4ef6_b1d3_5c9a6e27d1e1);
/// Downlink characteristic (gateway to device)
pub const DOWNLINK_UUID: Uuid = Uuid::from_u128(0x89a316ae_89b7_4ef6_b1d3_5c9a6e27d1e2);
/// Uplink characteristic (device to gateway)
pub const UPLINK_UUID: Uuid = Uuid::from_u128(0x89a316ae_89b7_4ef6_b1d3_5c9a6e27d1e3);
/// Server certificate characteristic
pub const SERVER_CERT_UUID: Uuid = Uuid::from_u128(0x89a316ae_89b7_4ef6_b1d3_5c9a6e27d1e4);
/// Device certificate characteristic
pub const DEVICE_CERT_UUID: Uuid = Uuid::from_u128(0x89a316ae_89b7_4ef6_b1d3_5c9a6e27d1e5);

const BLUETOOTH_BASE_UUID: u128 = 0x00000000_0000_1000_8000_00805f9b34fb;

/// Expand a 16-bit assigned number to its full UUID
pub const fn uuid16(short: u16) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | ((short as u128) << 96))
}

/// Usable frame size for a negotiated ATT MTU
pub fn payload_capacity_for_mtu(mtu: u16) -> usize {
    (mtu as usize).saturating_sub(ATT_OVERHEAD)
}

/// Transport-assigned connection index
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct ConnId(pub u16);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Logical channels of the pouch service
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum Endpoint {
    /// Device info record
    Info,
    /// Device to cloud data
    Uplink,
    /// Cloud to device data
    Downlink,
    /// Server certificate push
    ServerCert,
    /// Device certificate pull
    DeviceCert,
}

impl Endpoint {
    /// Every endpoint, in discovery table order
    pub const ALL: [Endpoint; 5] = [
        Endpoint::Info,
        Endpoint::Uplink,
        Endpoint::Downlink,
        Endpoint::ServerCert,
        Endpoint::DeviceCert,
    ];

    /// Characteristic UUID of this endpoint
    pub fn uuid(self) -> Uuid {
        match self {
            Endpoint::Info => INFO_UUID,
            Endpoint::Uplink => UPLINK_UUID,
            Endpoint::Downlink => DOWNLINK_UUID,
            Endpoint::ServerCert => SERVER_CERT_UUID,
            Endpoint::DeviceCert => DEVICE_CERT_UUID,
        }
    }

    /// Endpoint for a characteristic UUID
    pub fn from_uuid(uuid: &Uuid) -> Option<Self> {
        Self::ALL.into_iter().find(|e| e.uuid() == *uuid)
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Endpoint::Info => "info",
            Endpoint::Uplink => "uplink",
            Endpoint::Downlink => "downlink",
            Endpoint::ServerCert => "server cert",
            Endpoint::DeviceCert => "device cert",
        };
        f.write_str(name)
    }
}

/// Attribute handles of one endpoint
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AttrHandles {
    /// Characteristic value handle
    pub value: u16,
    /// Client characteristic configuration descriptor, if any
    pub ccc: Option<u16>,
}

/// A characteristic reported by discovery
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Characteristic {
    /// Characteristic UUID
    pub uuid: Uuid,
    /// Value handle
    pub value_handle: u16,
}

/// Result of discovering the pouch service
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GattService {
    /// UUID the service was found under
    pub uuid: Uuid,
    /// Characteristics of the service
    pub characteristics: Vec<Characteristic>,
    /// CCC descriptor handles found within the service
    pub ccc_descriptors: Vec<u16>,
}

/// Endpoint to handle mapping of one connection; immutable once built
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EndpointSet {
    handles: [Option<AttrHandles>; 5],
}

impl EndpointSet {
    /// Build the set from a discovered service.
    ///
    /// Each CCC descriptor belongs to the characteristic with the closest
    /// lower value handle. Uplink and downlink must both be present with a
    /// CCC descriptor; other endpoints are optional.
    pub fn from_discovery(service: &GattService) -> Result<Self, SessionError> {
        let mut set = Self::default();

        for chrc in &service.characteristics {
            match Endpoint::from_uuid(&chrc.uuid) {
                Some(endpoint) => {
                    set.handles[endpoint.index()] = Some(AttrHandles {
                        value: chrc.value_handle,
                        ccc: None,
                    });
                }
                None => warn!(
                    "Discovered unknown characteristic {} at handle {}",
                    chrc.uuid, chrc.value_handle
                ),
            }
        }

        for &ccc in &service.ccc_descriptors {
            let owner = set
                .handles
                .iter_mut()
                .flatten()
                .filter(|h| h.value < ccc)
                .max_by_key(|h| h.value);
            if let Some(handles) = owner {
                debug!(
                    "Found CCC descriptor handle {} for value handle {}",
                    ccc, handles.value
                );
                handles.ccc = Some(ccc);
            }
        }

        for required in [Endpoint::Uplink, Endpoint::Downlink] {
            if set.notifying(required).is_none() {
                return Err(SessionError::MissingEndpoint(required));
            }
        }

        Ok(set)
    }

    /// Handles of an endpoint
    pub fn get(&self, endpoint: Endpoint) -> Option<AttrHandles> {
        self.handles[endpoint.index()]
    }

    /// Handles of an endpoint that can carry notifications
    pub fn notifying(&self, endpoint: Endpoint) -> Option<AttrHandles> {
        self.get(endpoint).filter(|h| h.ccc.is_some())
    }

    /// Endpoint owning a value handle
    pub fn endpoint_for(&self, handle: u16) -> Option<Endpoint> {
        Endpoint::ALL
            .into_iter()
            .find(|e| self.get(*e).is_some_and(|h| h.value == handle))
    }

    /// Whether both certificate endpoints are usable
    pub fn supports_cert_exchange(&self) -> bool {
        self.notifying(Endpoint::ServerCert).is_some()
            && self.notifying(Endpoint::DeviceCert).is_some()
    }

    /// Endpoints with a CCC descriptor
    pub fn subscriptions(&self) -> impl Iterator<Item = (Endpoint, AttrHandles)> + '_ {
        Endpoint::ALL
            .into_iter()
            .filter_map(|e| self.notifying(e).map(|h| (e, h)))
    }
}

/// Submission interface of the wireless stack.
///
/// Calls return once the request is queued. Discovery results,
/// notifications and asynchronous write failures come back as session
/// events.
pub trait GattClient {
    /// Search `conn` for a primary service
    fn discover(&mut self, conn: ConnId, service: Uuid) -> Result<(), TransportError>;

    /// Enable notifications for an endpoint
    fn subscribe(&mut self, conn: ConnId, handles: AttrHandles) -> Result<(), TransportError>;

    /// Write one frame to a value handle
    fn write(&mut self, conn: ConnId, handle: u16, frame: Bytes) -> Result<(), TransportError>;

    /// Largest frame the connection carries (MTU minus ATT overhead)
    fn payload_capacity(&self, conn: ConnId) -> usize;

    /// Drop the connection
    fn disconnect(&mut self, conn: ConnId);
}

/// Where a transfer writes its frames
pub trait FrameWriter {
    /// Largest frame accepted
    fn capacity(&self) -> usize;

    /// Write one frame
    fn write_frame(&mut self, frame: Bytes) -> Result<(), TransportError>;
}

/// [`FrameWriter`] bound to one endpoint of a connection
pub struct EndpointWriter<'a> {
    gatt: &'a mut dyn GattClient,
    conn: ConnId,
    handle: u16,
}

impl<'a> EndpointWriter<'a> {
    /// Bind to `handle` on `conn`
    pub fn new(gatt: &'a mut dyn GattClient, conn: ConnId, handle: u16) -> Self {
        Self { gatt, conn, handle }
    }
}

impl FrameWriter for EndpointWriter<'_> {
    fn capacity(&self) -> usize {
        self.gatt.payload_capacity(self.conn)
    }

    fn write_frame(&mut self, frame: Bytes) -> Result<(), TransportError> {
        self.gatt.write(self.conn, self.handle, frame)
    }
}

/// A connection together with its discovered endpoints
pub struct PeerLink<'a> {
    gatt: &'a mut dyn GattClient,
    conn: ConnId,
    endpoints: &'a EndpointSet,
}

impl<'a> PeerLink<'a> {
    /// Bundle a connection with its endpoints
    pub fn new(gatt: &'a mut dyn GattClient, conn: ConnId, endpoints: &'a EndpointSet) -> Self {
        Self {
            gatt,
            conn,
            endpoints,
        }
    }

    /// Writer for an endpoint
    pub fn writer(&mut self, endpoint: Endpoint) -> Result<EndpointWriter<'_>, SessionError> {
        let handles = self
            .endpoints
            .get(endpoint)
            .ok_or(SessionError::MissingEndpoint(endpoint))?;
        Ok(EndpointWriter::new(&mut *self.gatt, self.conn, handles.value))
    }

    /// Negotiated frame capacity
    pub fn capacity(&self) -> usize {
        self.gatt.payload_capacity(self.conn)
    }
}
