//! Event loop of the gateway binary.
//!
//! The session engine is synchronous; this module runs it on tokio. Cloud
//! requests made by sessions go through [`CloudBridge`], which hands them to
//! one worker task per uplink and posts completions back over a channel.
//! [`Gateway`] owns the session manager and the simulated link and feeds
//! both event sources into it.

use anyhow::{anyhow, Result};
use bytes::Bytes;
use gateway_cloud::{
    CertificateStore, CloudClient, CloudError, CloudEvent, CloudService, Peer, UplinkHandle,
};
use gateway_session::sim::{SimDevice, SimLink};
use gateway_session::{
    ConnId, Outcome, SessionConfig, SessionEvent, SessionIo, SessionManager, SessionStatus,
};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Built-in certificate used when the cloud has none to offer
pub const DEV_SERVER_CERT: &[u8] = include_bytes!("../certs/dev_server.pem");

enum UplinkCommand {
    Upload {
        index: u32,
        block: Bytes,
        is_last: bool,
    },
    Finish,
    Cancel,
}

struct UplinkTask {
    commands: mpsc::UnboundedSender<UplinkCommand>,
    cancelled: Arc<AtomicBool>,
}

/// [`CloudClient`] that runs requests against an async [`CloudService`]
pub struct CloudBridge {
    service: Arc<dyn CloudService>,
    events: mpsc::UnboundedSender<CloudEvent>,
    uplinks: HashMap<UplinkHandle, UplinkTask>,
    next_id: u64,
}

impl CloudBridge {
    /// Create a bridge and the receiver its completions arrive on
    pub fn new(service: Arc<dyn CloudService>) -> (Self, mpsc::UnboundedReceiver<CloudEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let bridge = Self {
            service,
            events,
            uplinks: HashMap::new(),
            next_id: 0,
        };
        (bridge, rx)
    }

    /// Uplinks whose worker is still running
    pub fn open_uplinks(&self) -> usize {
        self.uplinks
            .values()
            .filter(|task| !task.commands.is_closed())
            .count()
    }

    fn send(&mut self, handle: UplinkHandle, command: UplinkCommand) -> Result<(), CloudError> {
        let task = self
            .uplinks
            .get(&handle)
            .ok_or_else(|| CloudError::NotFound(format!("uplink {}", handle)))?;
        task.commands
            .send(command)
            .map_err(|_| CloudError::Invalid(format!("uplink {} already closed", handle)))
    }
}

/// Blocks of one uplink are uploaded in order, then the response is fetched
async fn run_uplink(
    service: Arc<dyn CloudService>,
    handle: UplinkHandle,
    mut commands: mpsc::UnboundedReceiver<UplinkCommand>,
    events: mpsc::UnboundedSender<CloudEvent>,
    cancelled: Arc<AtomicBool>,
) {
    let post = |event: CloudEvent| {
        if cancelled.load(Ordering::Acquire) {
            debug!("Dropping event of cancelled uplink {}", handle);
            return false;
        }
        events.send(event).is_ok()
    };

    while let Some(command) = commands.recv().await {
        match command {
            UplinkCommand::Upload {
                index,
                block,
                is_last,
            } => {
                let result = service.upload_block(handle, index, block, is_last).await;
                if let Err(e) = &result {
                    warn!("Upload of block {} of uplink {} failed: {}", index, handle, e);
                }
                if !post(CloudEvent::BlockUploaded {
                    handle,
                    index,
                    result,
                }) {
                    break;
                }
            }
            UplinkCommand::Finish => {
                let result = match service.finish_uplink(handle).await {
                    Ok(blocks) => {
                        let count = blocks.len();
                        debug!("Uplink {} answered with {} blocks", handle, count);
                        for (i, data) in blocks.into_iter().enumerate() {
                            if !post(CloudEvent::DownlinkBlock {
                                handle,
                                data,
                                is_last: i + 1 == count,
                            }) {
                                return;
                            }
                        }
                        Ok(())
                    }
                    Err(e) => {
                        warn!("Finishing uplink {} failed: {}", handle, e);
                        Err(e)
                    }
                };
                post(CloudEvent::DownlinkEnded { handle, result });
                break;
            }
            UplinkCommand::Cancel => {
                if let Err(e) = service.cancel_uplink(handle).await {
                    warn!("Cancelling uplink {} failed: {}", handle, e);
                }
                break;
            }
        }
    }
}

impl CloudClient for CloudBridge {
    fn begin_uplink(&mut self, peer: Peer) -> Result<UplinkHandle, CloudError> {
        self.uplinks.retain(|_, task| !task.commands.is_closed());

        self.next_id += 1;
        let handle = UplinkHandle {
            peer,
            id: self.next_id,
        };

        let (commands, rx) = mpsc::unbounded_channel();
        let cancelled = Arc::new(AtomicBool::new(false));
        tokio::spawn(run_uplink(
            self.service.clone(),
            handle,
            rx,
            self.events.clone(),
            cancelled.clone(),
        ));
        self.uplinks.insert(
            handle,
            UplinkTask {
                commands,
                cancelled,
            },
        );
        debug!("Uplink {} opened", handle);
        Ok(handle)
    }

    fn upload_block(
        &mut self,
        handle: UplinkHandle,
        index: u32,
        block: Bytes,
        is_last: bool,
    ) -> Result<(), CloudError> {
        self.send(
            handle,
            UplinkCommand::Upload {
                index,
                block,
                is_last,
            },
        )
    }

    fn finish_uplink(&mut self, handle: UplinkHandle) {
        if let Err(e) = self.send(handle, UplinkCommand::Finish) {
            warn!("Cannot finish uplink {}: {}", handle, e);
            // The session waits on the downlink end once its uplink is
            // finished, so that is where the failure has to show up.
            if let Err(e) = self.events.send(CloudEvent::DownlinkEnded {
                handle,
                result: Err(e),
            }) {
                warn!("Cannot report failed uplink {}: {}", handle, e);
            }
        }
    }

    fn cancel_uplink(&mut self, handle: UplinkHandle) {
        if let Some(task) = self.uplinks.remove(&handle) {
            task.cancelled.store(true, Ordering::Release);
            // A finished worker has already exited
            let _ = task.commands.send(UplinkCommand::Cancel);
        }
    }

    fn submit_device_certificate(&mut self, peer: Peer, der: Bytes) -> Result<(), CloudError> {
        let service = self.service.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = service.submit_device_certificate(peer, der).await;
            match &result {
                Ok(()) => info!("Device certificate of {} accepted", peer),
                Err(e) => warn!("Device certificate of {} rejected: {}", peer, e),
            }
            if events
                .send(CloudEvent::DeviceCertSubmitted { peer, result })
                .is_err()
            {
                debug!("Gateway stopped before the verdict on {}", peer);
            }
        });
        Ok(())
    }
}

/// Fetch the server certificate once and install it
pub async fn refresh_certificate(
    service: &dyn CloudService,
    certs: &CertificateStore,
) -> Result<u64> {
    let raw = service
        .fetch_server_certificate()
        .await
        .map_err(|e| anyhow!("fetching server certificate: {}", e))?;
    certs
        .update(raw)
        .map_err(|e| anyhow!("installing server certificate: {}", e))
}

/// Install the cloud's certificate, or the built-in one if that fails
pub async fn load_certificate(service: &dyn CloudService, certs: &CertificateStore) -> Result<u64> {
    match refresh_certificate(service, certs).await {
        Ok(epoch) => Ok(epoch),
        Err(e) => {
            crate::component_warn!("certs", "{}; using the built-in development certificate", e);
            certs
                .update(Bytes::from_static(DEV_SERVER_CERT))
                .map_err(|e| anyhow!("built-in certificate: {}", e))
        }
    }
}

/// Re-fetch the server certificate every `period`
pub fn spawn_cert_refresh(
    service: Arc<dyn CloudService>,
    certs: Arc<CertificateStore>,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        // The first tick completes immediately
        interval.tick().await;
        loop {
            interval.tick().await;
            match refresh_certificate(service.as_ref(), &certs).await {
                Ok(epoch) => debug!("Certificate refresh done (epoch {})", epoch),
                Err(e) => crate::component_warn!("certs", "Certificate refresh failed: {}", e),
            }
        }
    })
}

/// What a gateway run achieved
#[derive(Debug, Default)]
pub struct GatewayReport {
    /// Sessions that completed
    pub completed: usize,
    /// Sessions that aborted, with the reason
    pub aborted: Vec<(ConnId, String)>,
    /// Downlink payloads received by each device
    pub downlinks: Vec<(ConnId, Vec<Bytes>)>,
    /// Devices still waiting for a slot at shutdown
    pub never_connected: usize,
}

/// Dispatcher feeding link and cloud events into the session manager
pub struct Gateway {
    manager: SessionManager,
    link: SimLink,
    bridge: CloudBridge,
    events: mpsc::UnboundedReceiver<CloudEvent>,
    pending: VecDeque<(ConnId, SimDevice)>,
    report: GatewayReport,
}

impl Gateway {
    /// Create a gateway serving at most `max_sessions` devices at a time
    pub fn new(
        config: SessionConfig,
        max_sessions: usize,
        certs: Arc<CertificateStore>,
        service: Arc<dyn CloudService>,
    ) -> Self {
        let (bridge, events) = CloudBridge::new(service);
        Self {
            manager: SessionManager::new(config, certs, max_sessions.max(1)),
            link: SimLink::new(),
            bridge,
            events,
            pending: VecDeque::new(),
            report: GatewayReport::default(),
        }
    }

    /// Queue a device; it connects once a session slot is free
    pub fn add_device(&mut self, conn: ConnId, device: SimDevice) {
        self.pending.push_back((conn, device));
    }

    fn admit(&mut self) {
        while self.manager.len() < self.manager.capacity() {
            let Some((conn, device)) = self.pending.pop_front() else {
                break;
            };
            self.link.attach(conn, device);

            let mut io = SessionIo {
                gatt: &mut self.link,
                cloud: &mut self.bridge,
            };
            match self.manager.connect(conn, &mut io) {
                Ok((key, status)) => {
                    crate::component_debug!("sessions", "{} connected as {}", conn, key);
                    self.record(conn, status);
                }
                Err(e) => {
                    warn!("Cannot start a session on {}: {}", conn, e);
                    self.link.detach(conn);
                }
            }
        }
    }

    fn on_link_event(&mut self, conn: ConnId, event: SessionEvent) {
        let disconnected = matches!(event, SessionEvent::Disconnected);
        let mut io = SessionIo {
            gatt: &mut self.link,
            cloud: &mut self.bridge,
        };

        match self.manager.on_gatt(conn, event, &mut io) {
            Ok(status) => self.record(conn, status),
            Err(e) => debug!("Dropping link event: {}", e),
        }

        if disconnected {
            if let Some(device) = self.link.detach(conn) {
                self.report
                    .downlinks
                    .push((conn, device.downlinks().to_vec()));
            }
            self.admit();
        }
    }

    fn on_cloud_event(&mut self, event: CloudEvent) {
        let mut io = SessionIo {
            gatt: &mut self.link,
            cloud: &mut self.bridge,
        };
        let Some(conn) = self.manager.conn_of(event.peer()) else {
            debug!("Dropping cloud event for {}", event.peer());
            return;
        };
        if let Some(status) = self.manager.on_cloud(event, &mut io) {
            self.record(conn, status);
        }
    }

    fn record(&mut self, conn: ConnId, status: SessionStatus) {
        match status {
            SessionStatus::Finished(Outcome::Completed) => {
                crate::component_info!("sessions", "Session on {} completed", conn);
                self.report.completed += 1;
            }
            SessionStatus::Finished(Outcome::Aborted(e)) => {
                crate::component_warn!("sessions", "Session on {} aborted: {}", conn, e);
                self.report.aborted.push((conn, e.to_string()));
            }
            SessionStatus::Running | SessionStatus::Closed => {}
        }
    }

    /// Run until every device has been served or `shutdown` resolves
    pub async fn run<F>(mut self, shutdown: F) -> GatewayReport
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        info!("Gateway running with {} devices queued", self.pending.len());
        self.admit();

        loop {
            while let Some((conn, event)) = self.link.next_event() {
                self.on_link_event(conn, event);
            }
            if self.manager.is_empty() && self.pending.is_empty() {
                info!("All devices served");
                break;
            }

            tokio::select! {
                _ = &mut shutdown => {
                    info!(
                        "Shutdown requested with {} sessions active",
                        self.manager.active()
                    );
                    break;
                }
                event = self.events.recv() => match event {
                    Some(event) => self.on_cloud_event(event),
                    None => break,
                },
            }
        }

        debug!("{} uplinks still open at exit", self.bridge.open_uplinks());
        self.report.never_connected = self.pending.len();
        self.report
    }
}
