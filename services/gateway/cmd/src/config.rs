//! Configuration handling for the gateway.
//!
//! Settings come from a YAML file, then `POUCH_GATEWAY_*` environment
//! variables, then command line flags (applied in `main`). A missing or
//! unparseable file falls back to defaults.

use anyhow::{anyhow, Result};
use gateway_cloud::CloudMode;
use gateway_session::sim::SimDeviceConfig;
use gateway_session::SessionConfig;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

const ENV_PREFIX: &str = "POUCH_GATEWAY_";

/// Cloud backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CloudBackend {
    /// In-memory cloud
    #[default]
    Memory,
    /// Uplinks stored below `data_dir`
    File,
}

impl std::str::FromStr for CloudBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(CloudBackend::Memory),
            "file" => Ok(CloudBackend::File),
            other => Err(anyhow!("unknown cloud backend '{}'", other)),
        }
    }
}

/// Cloud settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudConfig {
    /// Backend
    pub backend: CloudBackend,
    /// Data directory of the file backend
    pub data_dir: PathBuf,
    /// Server certificate file (PEM or DER)
    pub server_cert_path: Option<PathBuf>,
    /// Echo uplinks back as downlinks (memory backend)
    pub echo: bool,
    /// How often the server certificate is fetched again
    #[serde(
        serialize_with = "serialize_duration",
        deserialize_with = "deserialize_duration"
    )]
    pub cert_refresh_interval: Duration,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            backend: CloudBackend::Memory,
            data_dir: PathBuf::from("./pouchdata"),
            server_cert_path: None,
            echo: false,
            cert_refresh_interval: Duration::from_secs(300),
        }
    }
}

impl CloudConfig {
    /// Backend mode for [`gateway_cloud::from_mode`]
    pub fn mode(&self) -> CloudMode {
        match self.backend {
            CloudBackend::Memory => CloudMode::Memory,
            CloudBackend::File => CloudMode::File {
                data_dir: self.data_dir.clone(),
                server_cert_path: self.server_cert_path.clone(),
            },
        }
    }
}

/// Simulated peripherals
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Number of simulated devices
    pub devices: usize,
    /// Uplink payload size per device
    pub uplink_bytes: usize,
    /// ATT MTU of the simulated links
    pub mtu: u16,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            devices: 1,
            uplink_bytes: 512,
            mtu: 64,
        }
    }
}

impl SimulationConfig {
    /// Device configuration for the `index`-th simulated device
    pub fn device(&self, index: usize) -> SimDeviceConfig {
        let payload: Vec<u8> = (0..self.uplink_bytes)
            .map(|i| (i + index) as u8)
            .collect();
        SimDeviceConfig {
            mtu: self.mtu,
            ..Default::default()
        }
        .with_uplink(payload)
    }
}

/// Gateway configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Transfer and session settings
    pub session: SessionConfig,
    /// Maximum number of concurrent sessions
    pub max_sessions: usize,
    /// Cloud settings
    pub cloud: CloudConfig,
    /// Simulated peripherals
    pub simulation: SimulationConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            max_sessions: 8,
            cloud: CloudConfig::default(),
            simulation: SimulationConfig::default(),
        }
    }
}

fn serialize_duration<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&humantime::format_duration(*value).to_string())
}

fn deserialize_duration<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    let raw = String::deserialize(deserializer)?;
    humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
}

impl GatewayConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let path = config_path.as_ref();
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => match serde_yaml::from_str::<GatewayConfig>(&content) {
                Ok(config) => {
                    info!("Loaded configuration from {:?}", path);
                    config
                }
                Err(e) => {
                    warn!("Failed to parse config file {:?} ({}), using defaults", path, e);
                    Self::default()
                }
            },
            Err(_) => {
                warn!("Config file {:?} not found, using defaults", path);
                Self::default()
            }
        };

        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.session.transfer = config.session.transfer.normalized();

        info!(
            "Final gateway configuration: window={}, ack_threshold={}, block_size={}, backend={:?}, max_sessions={}",
            config.session.transfer.window,
            config.session.transfer.ack_threshold,
            config.session.block_size,
            config.cloud.backend,
            config.max_sessions
        );

        Ok(config)
    }

    /// Apply `POUCH_GATEWAY_*` overrides looked up through `lookup`
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));

        if let Some(v) = var("WINDOW") {
            self.session.transfer.window = parse(&v, "WINDOW")?;
        }
        if let Some(v) = var("ACK_THRESHOLD") {
            self.session.transfer.ack_threshold = parse(&v, "ACK_THRESHOLD")?;
        }
        if let Some(v) = var("BLOCK_SIZE") {
            self.session.block_size = parse(&v, "BLOCK_SIZE")?;
        }
        if let Some(v) = var("DEVICE_CERT_MAX_LEN") {
            self.session.device_cert_max_len = parse(&v, "DEVICE_CERT_MAX_LEN")?;
        }
        if let Some(v) = var("MAX_SESSIONS") {
            self.max_sessions = parse(&v, "MAX_SESSIONS")?;
        }
        if let Some(v) = var("CLOUD") {
            self.cloud.backend = v.parse()?;
        }
        if let Some(v) = var("DATA_DIR") {
            self.cloud.data_dir = PathBuf::from(v);
        }
        if let Some(v) = var("SERVER_CERT") {
            self.cloud.server_cert_path = Some(PathBuf::from(v));
        }
        if let Some(v) = var("CERT_REFRESH") {
            self.cloud.cert_refresh_interval = humantime::parse_duration(&v)
                .map_err(|e| anyhow!("{}CERT_REFRESH: {}", ENV_PREFIX, e))?;
        }
        if let Some(v) = var("SIM_DEVICES") {
            self.simulation.devices = parse(&v, "SIM_DEVICES")?;
        }

        Ok(())
    }
}

fn parse<T>(value: &str, name: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let parsed = value
        .trim()
        .parse()
        .map_err(|e| anyhow!("{}{}={}: {}", ENV_PREFIX, name, value, e))?;
    info!("{}{} overridden by environment", ENV_PREFIX, name);
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = GatewayConfig::default();
        assert_eq!(config.session.transfer.window, 8);
        assert_eq!(config.session.transfer.ack_threshold, 4);
        assert_eq!(config.max_sessions, 8);
        assert_eq!(config.cloud.backend, CloudBackend::Memory);
        assert_eq!(config.cloud.cert_refresh_interval, Duration::from_secs(300));
    }

    #[test]
    fn test_load_from_file() {
        let yaml_content = r#"
session:
  transfer:
    window: 4
    ack_threshold: 9
  block_size: 256
max_sessions: 2
cloud:
  backend: file
  data_dir: /var/lib/pouch
  cert_refresh_interval: 1m 30s
simulation:
  devices: 3
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(yaml_content.as_bytes()).unwrap();

        let config = GatewayConfig::load_from_file(temp_file.path()).unwrap();
        assert_eq!(config.session.transfer.window, 4);
        // Clamped to the window
        assert_eq!(config.session.transfer.ack_threshold, 4);
        assert_eq!(config.session.block_size, 256);
        assert_eq!(config.max_sessions, 2);
        assert_eq!(config.cloud.backend, CloudBackend::File);
        assert_eq!(config.cloud.cert_refresh_interval, Duration::from_secs(90));
        assert_eq!(config.simulation.devices, 3);
        // Unset values keep their defaults
        assert_eq!(config.simulation.mtu, 64);
        assert!(matches!(config.cloud.mode(), CloudMode::File { .. }));
    }

    #[test]
    fn test_invalid_file_uses_defaults() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(b"session: [not, a, map]").unwrap();

        let config = GatewayConfig::load_from_file(temp_file.path()).unwrap();
        assert_eq!(config.session, SessionConfig::default());

        let missing = GatewayConfig::load_from_file("/nonexistent/pouch.yaml").unwrap();
        assert_eq!(missing.max_sessions, 8);
    }

    #[test]
    fn test_environment_overrides() {
        let env: HashMap<String, String> = [
            ("POUCH_GATEWAY_WINDOW", "2"),
            ("POUCH_GATEWAY_CLOUD", "file"),
            ("POUCH_GATEWAY_DATA_DIR", "/tmp/pouch"),
            ("POUCH_GATEWAY_CERT_REFRESH", "10s"),
            ("POUCH_GATEWAY_SIM_DEVICES", "5"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let mut config = GatewayConfig::default();
        config.apply_overrides(|key| env.get(key).cloned()).unwrap();
        assert_eq!(config.session.transfer.window, 2);
        assert_eq!(config.cloud.backend, CloudBackend::File);
        assert_eq!(config.cloud.data_dir, PathBuf::from("/tmp/pouch"));
        assert_eq!(config.cloud.cert_refresh_interval, Duration::from_secs(10));
        assert_eq!(config.simulation.devices, 5);

        let bad = |key: &str| (key == "POUCH_GATEWAY_WINDOW").then(|| "lots".to_string());
        assert!(GatewayConfig::default().apply_overrides(bad).is_err());
    }
}
