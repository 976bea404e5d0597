//! Pouch gateway binary.
//!
//! Runs the device session engine against simulated BLE peripherals and a
//! memory or file cloud backend, with periodic server certificate refresh.

use anyhow::{anyhow, Result};
use clap::Parser;
use gateway_cloud::{from_mode, CertificateStore, CloudResponse, CloudService, MemoryCloud};
use gateway_session::sim::SimDevice;
use gateway_session::ConnId;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod logging;
mod runtime;

use config::{CloudBackend, CloudConfig, GatewayConfig};
use logging::GatewayLogFormatter;
use runtime::{load_certificate, spawn_cert_refresh, Gateway};

/// BLE-to-cloud gateway for pouch devices
#[derive(Parser, Debug)]
#[command(name = "pouch-gateway", version, about = "BLE-to-cloud gateway for pouch devices")]
struct Args {
    /// Configuration file path
    #[arg(long, default_value = "gateway.yaml")]
    config: PathBuf,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Cloud backend: memory or file
    #[arg(long)]
    cloud: Option<String>,

    /// Data directory of the file backend
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Server certificate file (PEM or DER)
    #[arg(long)]
    server_cert: Option<PathBuf>,

    /// Echo every uplink back as the downlink (memory backend)
    #[arg(long)]
    echo: bool,

    /// Number of simulated devices
    #[arg(long)]
    devices: Option<usize>,

    /// Uplink payload size of each simulated device
    #[arg(long)]
    uplink_bytes: Option<usize>,

    /// Maximum number of concurrent sessions
    #[arg(long)]
    max_sessions: Option<usize>,
}

impl Args {
    fn apply(&self, config: &mut GatewayConfig) -> Result<()> {
        if let Some(cloud) = &self.cloud {
            config.cloud.backend = cloud.parse()?;
        }
        if let Some(dir) = &self.data_dir {
            config.cloud.data_dir = dir.clone();
        }
        if let Some(path) = &self.server_cert {
            config.cloud.server_cert_path = Some(path.clone());
        }
        if self.echo {
            config.cloud.echo = true;
        }
        if let Some(devices) = self.devices {
            config.simulation.devices = devices;
        }
        if let Some(bytes) = self.uplink_bytes {
            config.simulation.uplink_bytes = bytes;
        }
        if let Some(max) = self.max_sessions {
            config.max_sessions = max;
        }
        Ok(())
    }
}

async fn build_cloud(config: &CloudConfig) -> Result<Arc<dyn CloudService>> {
    match config.backend {
        CloudBackend::Memory if config.echo => Ok(Arc::new(
            MemoryCloud::new().with_response(CloudResponse::Echo),
        )),
        _ => Ok(from_mode(config.mode()).await?),
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::new("info")
        .add_directive(format!("pouch_gateway={}", args.log_level).parse()?)
        .add_directive(format!("gateway_session={}", args.log_level).parse()?)
        .add_directive(format!("gateway_wire={}", args.log_level).parse()?)
        .add_directive(format!("gateway_cloud={}", args.log_level).parse()?);

    let formatter = GatewayLogFormatter::new("gateway");

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_ansi(true)
        .event_format(formatter)
        .init();

    info!("Starting pouch gateway v{}", env!("CARGO_PKG_VERSION"));

    let mut config = GatewayConfig::load_from_file(&args.config)?;
    args.apply(&mut config)?;

    let service = build_cloud(&config.cloud).await?;
    info!("Cloud backend: {:?}", config.cloud.backend);

    let certs = Arc::new(CertificateStore::new());
    let epoch = load_certificate(service.as_ref(), &certs).await?;
    info!("Server certificate installed (epoch {})", epoch);
    let refresh = spawn_cert_refresh(
        service.clone(),
        certs.clone(),
        config.cloud.cert_refresh_interval,
    );

    let mut gateway = Gateway::new(
        config.session.clone(),
        config.max_sessions,
        certs,
        service,
    );
    for i in 0..config.simulation.devices {
        let conn = u16::try_from(i + 1)
            .map(ConnId)
            .map_err(|_| anyhow!("too many simulated devices ({})", config.simulation.devices))?;
        gateway.add_device(conn, SimDevice::new(config.simulation.device(i)));
    }

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .map_err(|e| anyhow!("Failed to install SIGTERM handler: {}", e))?;
    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
        .map_err(|e| anyhow!("Failed to install SIGINT handler: {}", e))?;
    let shutdown = async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM signal, shutting down"),
            _ = sigint.recv() => info!("Received SIGINT signal, shutting down"),
        }
    };

    let report = gateway.run(shutdown).await;
    refresh.abort();

    info!(
        "Gateway stopped: {} sessions completed, {} aborted, {} never connected",
        report.completed,
        report.aborted.len(),
        report.never_connected
    );
    for (conn, reason) in &report.aborted {
        warn!("{}: {}", conn, reason);
    }
    for (conn, downlinks) in &report.downlinks {
        let bytes: usize = downlinks.iter().map(|d| d.len()).sum();
        component_info!("sim", "{} received {} downlinks ({} bytes)", conn, downlinks.len(), bytes);
    }

    Ok(())
}
