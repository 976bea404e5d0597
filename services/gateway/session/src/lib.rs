//! Windowed transfers, certificate exchange and per-peer sessions for the
//! pouch gateway.
//!
//! This crate is the device-facing engine of the gateway. It is synchronous
//! and sans-io: every input arrives as a [`SessionEvent`] and every output is
//! submitted through the [`GattClient`] and
//! [`CloudClient`](gateway_cloud::CloudClient) seams, so the
//! same code runs under the tokio runtime of the gateway binary and in
//! deterministic tests.
//!
//! ## Features
//!
//! - **Windowed transfers**: [`Sender`] and [`Receiver`] with cumulative
//!   ACKs, NACK codes and a FIN that occupies a window slot
//! - **Info read**: provisioning state reported by the device
//! - **Certificate exchange**: server certificate push with restart on
//!   update, device certificate pull handed to the cloud
//! - **Session state machine**: discovery, info, certificates, uplink and
//!   downlink, one active sub-protocol at a time
//! - **Session manager**: slot arena with generations for stale cloud events
//! - **Simulation**: [`sim::SimDevice`] runs the device half of the protocol
//!
//! ## Example
//!
//! ```rust,no_run
//! use gateway_cloud::{CertificateStore, CloudClient};
//! use gateway_session::sim::{SimDevice, SimDeviceConfig, SimLink};
//! use gateway_session::{ConnId, SessionConfig, SessionIo, SessionManager, SessionStatus};
//! use std::sync::Arc;
//!
//! # fn example(cloud: &mut dyn CloudClient) -> Result<(), Box<dyn std::error::Error>> {
//! let certs = Arc::new(CertificateStore::new());
//! let mut manager = SessionManager::new(SessionConfig::default(), certs, 8);
//!
//! let mut link = SimLink::new();
//! link.attach(ConnId(1), SimDevice::new(SimDeviceConfig::default()));
//!
//! let mut io = SessionIo { gatt: &mut link, cloud: &mut *cloud };
//! let (key, status) = manager.connect(ConnId(1), &mut io)?;
//! println!("Session {} started: {:?}", key, status);
//!
//! while let Some((conn, event)) = link.next_event() {
//!     let mut io = SessionIo { gatt: &mut link, cloud: &mut *cloud };
//!     if let SessionStatus::Finished(outcome) = manager.on_gatt(conn, event, &mut io)? {
//!         println!("{} finished: {:?}", conn, outcome);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod exchange;
pub mod info;
pub mod manager;
pub mod receiver;
pub mod sender;
pub mod session;
pub mod sim;
pub mod transport;

// Re-export main types
pub use error::{ManagerError, SessionError, TransferError, TransportError};
pub use exchange::{CertExchange, ExchangeStep};
pub use info::{InfoProgress, InfoRead, Provisioning};
pub use manager::{PeerKey, SessionManager};
pub use receiver::{RecvProgress, RecvState, Receiver};
pub use sender::{SendProgress, SendState, Sender};
pub use session::{
    DataPath, Outcome, Session, SessionConfig, SessionEvent, SessionIo, SessionStatus, Stage,
    TransferConfig,
};
pub use transport::{
    payload_capacity_for_mtu, uuid16, AttrHandles, Characteristic, ConnId, Endpoint,
    EndpointSet, EndpointWriter, FrameWriter, GattClient, GattService, PeerLink, ATT_OVERHEAD,
    SERVICE_UUID_128, SERVICE_UUID_16,
};
