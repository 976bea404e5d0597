//! Session manager for the connected peers.
//!
//! Sessions live in a fixed-size arena of slots. A slot's generation is
//! bumped whenever it is released, and the cloud-facing [`Peer`] of a
//! session encodes both the slot index and the generation, so completions
//! of cloud work started by an earlier occupant are recognized and dropped.

use crate::error::ManagerError;
use crate::session::{Outcome, Session, SessionConfig, SessionEvent, SessionIo, SessionStatus};
use crate::transport::ConnId;
use gateway_cloud::{CertificateStore, CloudEvent, Peer};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Slot index and generation of a session
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub struct PeerKey {
    /// Slot in the arena
    pub index: u32,
    /// Occupancy counter of the slot
    pub generation: u32,
}

impl From<PeerKey> for Peer {
    fn from(key: PeerKey) -> Self {
        Peer(((key.generation as u64) << 32) | key.index as u64)
    }
}

impl From<Peer> for PeerKey {
    fn from(peer: Peer) -> Self {
        Self {
            index: peer.0 as u32,
            generation: (peer.0 >> 32) as u32,
        }
    }
}

impl fmt::Display for PeerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.index, self.generation)
    }
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    conn: Option<ConnId>,
    session: Option<Session>,
}

/// Owner of every peer session
#[derive(Debug)]
pub struct SessionManager {
    config: SessionConfig,
    certs: Arc<CertificateStore>,
    slots: Vec<Slot>,
    by_conn: HashMap<ConnId, usize>,
}

impl SessionManager {
    /// Create a manager able to hold `capacity` concurrent sessions
    pub fn new(config: SessionConfig, certs: Arc<CertificateStore>, capacity: usize) -> Self {
        Self {
            config,
            certs,
            slots: (0..capacity).map(|_| Slot::default()).collect(),
            by_conn: HashMap::new(),
        }
    }

    /// Maximum number of concurrent sessions
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of occupied slots, including finished sessions awaiting disconnect
    pub fn len(&self) -> usize {
        self.by_conn.len()
    }

    /// Whether every slot is free
    pub fn is_empty(&self) -> bool {
        self.by_conn.is_empty()
    }

    /// Number of sessions still running
    pub fn active(&self) -> usize {
        self.slots
            .iter()
            .filter_map(|slot| slot.session.as_ref())
            .filter(|session| !session.is_finished())
            .count()
    }

    /// Session on a connection
    pub fn session(&self, conn: ConnId) -> Option<&Session> {
        let index = *self.by_conn.get(&conn)?;
        self.slots[index].session.as_ref()
    }

    /// Key of the session on a connection
    pub fn key(&self, conn: ConnId) -> Option<PeerKey> {
        let index = *self.by_conn.get(&conn)?;
        Some(PeerKey {
            index: index as u32,
            generation: self.slots[index].generation,
        })
    }

    /// Connection of the session `peer` names, unless its slot moved on
    pub fn conn_of(&self, peer: Peer) -> Option<ConnId> {
        let key = PeerKey::from(peer);
        let slot = self.slots.get(key.index as usize)?;
        if slot.generation != key.generation {
            return None;
        }
        slot.conn
    }

    /// Take a slot for a secured connection and start its session
    pub fn connect(
        &mut self,
        conn: ConnId,
        io: &mut SessionIo<'_>,
    ) -> Result<(PeerKey, SessionStatus), ManagerError> {
        if self.by_conn.contains_key(&conn) {
            return Err(ManagerError::Duplicate(conn));
        }
        let index = self
            .slots
            .iter()
            .position(|slot| slot.conn.is_none())
            .ok_or(ManagerError::NoFreeSlot(self.slots.len()))?;

        let slot = &mut self.slots[index];
        let key = PeerKey {
            index: index as u32,
            generation: slot.generation,
        };
        info!("New session {} ({}) on {}", Peer::from(key), key, conn);

        slot.conn = Some(conn);
        let session = slot.session.insert(Session::new(
            Peer::from(key),
            conn,
            self.config.clone(),
            self.certs.clone(),
        ));
        self.by_conn.insert(conn, index);

        let status = session.advance(SessionEvent::Start, io);
        Self::finish_if_done(conn, &status, io);
        Ok((key, status))
    }

    /// Route a link event to the session on `conn`
    pub fn on_gatt(
        &mut self,
        conn: ConnId,
        event: SessionEvent,
        io: &mut SessionIo<'_>,
    ) -> Result<SessionStatus, ManagerError> {
        if matches!(event, SessionEvent::Disconnected) {
            return self.disconnected(conn, io);
        }

        let session = self
            .by_conn
            .get(&conn)
            .and_then(|&index| self.slots[index].session.as_mut())
            .ok_or(ManagerError::UnknownConnection(conn))?;

        let status = session.advance(event, io);
        Self::finish_if_done(conn, &status, io);
        Ok(status)
    }

    /// Route a cloud completion; stale completions yield `None`
    pub fn on_cloud(&mut self, event: CloudEvent, io: &mut SessionIo<'_>) -> Option<SessionStatus> {
        let peer = event.peer();
        let key = PeerKey::from(peer);

        let Some(slot) = self.slots.get_mut(key.index as usize) else {
            warn!("Cloud event for unknown peer {}", peer);
            return None;
        };
        let (Some(conn), Some(session)) = (slot.conn, slot.session.as_mut()) else {
            debug!("Dropping cloud event for released slot {}", key);
            return None;
        };
        if slot.generation != key.generation {
            debug!(
                "Dropping stale cloud event for {} (slot generation {})",
                key, slot.generation
            );
            return None;
        }

        let status = session.advance(SessionEvent::Cloud(event), io);
        Self::finish_if_done(conn, &status, io);
        Some(status)
    }

    /// The link to `conn` is gone: release the session and its slot
    pub fn disconnected(
        &mut self,
        conn: ConnId,
        io: &mut SessionIo<'_>,
    ) -> Result<SessionStatus, ManagerError> {
        let index = self
            .by_conn
            .remove(&conn)
            .ok_or(ManagerError::UnknownConnection(conn))?;
        let slot = &mut self.slots[index];

        let status = match slot.session.take() {
            Some(mut session) => session.advance(SessionEvent::Disconnected, io),
            None => SessionStatus::Closed,
        };
        slot.conn = None;
        slot.generation = slot.generation.wrapping_add(1);
        debug!("Released slot {} (generation {})", index, slot.generation);

        Ok(status)
    }

    fn finish_if_done(conn: ConnId, status: &SessionStatus, io: &mut SessionIo<'_>) {
        if let SessionStatus::Finished(outcome) = status {
            match outcome {
                Outcome::Completed => info!("Disconnecting {} after a complete session", conn),
                Outcome::Aborted(e) => warn!("Disconnecting {}: {}", conn, e),
            }
            io.gatt.disconnect(conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SessionError;
    use crate::sim::tests::SimCloud;
    use crate::sim::{SimDevice, SimDeviceConfig, SimLink};
    use bytes::Bytes;
    use gateway_cloud::{CloudResponse, UplinkHandle};

    const SERVER_A: &[u8] = include_bytes!("../../cloud/testdata/server_a.pem");

    fn manager(capacity: usize) -> SessionManager {
        let certs = CertificateStore::new();
        certs.update(Bytes::from_static(SERVER_A)).unwrap();
        SessionManager::new(SessionConfig::default(), Arc::new(certs), capacity)
    }

    /// Deliver link events first, then cloud completions, until both are idle
    fn pump(manager: &mut SessionManager, link: &mut SimLink, cloud: &mut SimCloud) {
        loop {
            let mut io;
            if let Some((conn, event)) = link.next_event() {
                io = SessionIo {
                    gatt: &mut *link,
                    cloud: &mut *cloud,
                };
                manager.on_gatt(conn, event, &mut io).unwrap();
            } else if let Some(event) = cloud.events.pop_front() {
                io = SessionIo {
                    gatt: &mut *link,
                    cloud: &mut *cloud,
                };
                manager.on_cloud(event, &mut io);
            } else {
                return;
            }
        }
    }

    #[test]
    fn test_peer_key_round_trip() {
        let key = PeerKey {
            index: 3,
            generation: 9,
        };
        let peer = Peer::from(key);
        assert_eq!(peer, Peer(0x0000_0009_0000_0003));
        assert_eq!(PeerKey::from(peer), key);
    }

    #[test]
    fn test_sessions_run_side_by_side() {
        let mut manager = manager(4);
        let mut link = SimLink::new();
        let mut cloud = SimCloud::with_response(CloudResponse::Echo);

        for i in 0..3u16 {
            let payload = format!("payload of device {}", i);
            link.attach(
                ConnId(i),
                SimDevice::new(SimDeviceConfig::default().with_uplink(payload)),
            );
            let mut io = SessionIo {
                gatt: &mut link,
                cloud: &mut cloud,
            };
            let (key, status) = manager.connect(ConnId(i), &mut io).unwrap();
            assert_eq!(key.index, i as u32);
            assert!(matches!(status, SessionStatus::Running));
        }
        assert_eq!(manager.active(), 3);

        pump(&mut manager, &mut link, &mut cloud);
        assert_eq!(manager.active(), 0);
        for i in 0..3u16 {
            let device = link.device(ConnId(i)).unwrap();
            assert!(!device.is_connected());
            assert_eq!(device.downlinks(), &[device.config().uplink.clone()]);
            assert!(manager.session(ConnId(i)).is_none());
        }
        assert_eq!(cloud.finished.len(), 3);
    }

    #[test]
    fn test_slot_exhaustion_and_reuse() {
        let mut manager = manager(1);
        let mut link = SimLink::new();
        let mut cloud = SimCloud::default();
        link.attach(ConnId(1), SimDevice::new(SimDeviceConfig::default()));
        link.attach(ConnId(2), SimDevice::new(SimDeviceConfig::default()));

        let mut io = SessionIo {
            gatt: &mut link,
            cloud: &mut cloud,
        };
        let (first, _) = manager.connect(ConnId(1), &mut io).unwrap();
        assert_eq!(
            manager.connect(ConnId(1), &mut io).unwrap_err(),
            ManagerError::Duplicate(ConnId(1))
        );
        assert_eq!(
            manager.connect(ConnId(2), &mut io).unwrap_err(),
            ManagerError::NoFreeSlot(1)
        );

        assert!(matches!(
            manager.disconnected(ConnId(1), &mut io).unwrap(),
            SessionStatus::Finished(Outcome::Aborted(SessionError::Disconnected))
        ));
        assert_eq!(
            manager.disconnected(ConnId(1), &mut io).unwrap_err(),
            ManagerError::UnknownConnection(ConnId(1))
        );

        let (second, _) = manager.connect(ConnId(2), &mut io).unwrap();
        assert_eq!(second.index, first.index);
        assert_eq!(second.generation, first.generation + 1);
        assert_eq!(manager.key(ConnId(2)), Some(second));
    }

    #[test]
    fn test_stale_cloud_event_dropped() {
        let mut manager = manager(1);
        let mut link = SimLink::new();
        let mut cloud = SimCloud::default();
        link.attach(ConnId(1), SimDevice::new(SimDeviceConfig::default()));

        let mut io = SessionIo {
            gatt: &mut link,
            cloud: &mut cloud,
        };
        let (first, _) = manager.connect(ConnId(1), &mut io).unwrap();
        manager.disconnected(ConnId(1), &mut io).unwrap();

        let stale = CloudEvent::DownlinkEnded {
            handle: UplinkHandle {
                peer: Peer::from(first),
                id: 1,
            },
            result: Ok(()),
        };
        assert!(manager.on_cloud(stale, &mut io).is_none());

        // The slot is taken again; the old generation stays stale
        let (second, _) = manager.connect(ConnId(1), &mut io).unwrap();
        assert_ne!(Peer::from(second), Peer::from(first));
        let stale = CloudEvent::DownlinkEnded {
            handle: UplinkHandle {
                peer: Peer::from(first),
                id: 1,
            },
            result: Ok(()),
        };
        assert!(manager.on_cloud(stale, &mut io).is_none());
        assert_eq!(manager.active(), 1);
        assert_eq!(manager.conn_of(Peer::from(second)), Some(ConnId(1)));
        assert_eq!(manager.conn_of(Peer::from(first)), None);

        let unknown = CloudEvent::DownlinkEnded {
            handle: UplinkHandle {
                peer: Peer(5),
                id: 1,
            },
            result: Ok(()),
        };
        assert!(manager.on_cloud(unknown, &mut io).is_none());
    }
}
