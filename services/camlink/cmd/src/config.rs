//! Configuration handling for the camlink binary.
//!
//! Settings come from a YAML file, then `CAMLINK_*` environment variables,
//! then command-line flags, each layer overriding the previous one.

use anyhow::{Context, Result};
use camlink_delivery::{FrameQueue, OverflowPolicy, DEFAULT_QUEUE_CAPACITY};
use camlink_session::SessionConfig;
use camlink_wire::{HeaderLayout, ALERT_PORT};
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Durations are written the humantime way (`500ms`, `10s`)
mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let text = String::deserialize(deserializer)?;
        humantime::parse_duration(&text).map_err(serde::de::Error::custom)
    }

    pub mod option {
        use serde::{Deserialize, Deserializer, Serializer};
        use std::time::Duration;

        pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
            match value {
                Some(value) => super::serialize(value, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
            let text = Option::<String>::deserialize(deserializer)?;
            text.map(|t| humantime::parse_duration(&t).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}

/// Camlink configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CamlinkConfig {
    /// Camera session settings
    pub session: SessionSection,
    /// Frame queue settings
    pub queue: QueueSection,
    /// Alert broadcast settings
    pub alerts: AlertSection,
    /// Frame recording settings
    pub recording: RecordingSection,
}

/// Camera session settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    /// Local receive address
    pub bind: SocketAddr,
    /// Camera address; discovered when absent
    pub peer: Option<SocketAddr>,
    /// Port used with a discovered camera IP
    pub peer_port: Option<u16>,
    /// Header layout of data datagrams
    pub layout: HeaderLayout,
    /// Datagram buffer size
    pub buffer_size: usize,
    /// Discovery wait
    #[serde(with = "duration_str")]
    pub discovery_timeout: Duration,
    /// ACK wait after HELLO
    #[serde(with = "duration_str")]
    pub ack_timeout: Duration,
    /// Keepalive period
    #[serde(with = "duration_str")]
    pub keepalive_interval: Duration,
    /// Drop incomplete frames after this long
    #[serde(with = "duration_str::option")]
    pub stale_after: Option<Duration>,
}

impl Default for SessionSection {
    fn default() -> Self {
        let session = SessionConfig::default();
        Self {
            bind: session.bind_addr,
            peer: session.peer,
            peer_port: session.peer_port,
            layout: session.layout,
            buffer_size: session.buffer_size,
            discovery_timeout: session.discovery_timeout,
            ack_timeout: session.ack_timeout,
            keepalive_interval: session.keepalive_interval,
            stale_after: session.stale_after,
        }
    }
}

/// Frame queue settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSection {
    /// Frames held before backpressure
    pub capacity: usize,
    /// Behaviour when full
    pub overflow: OverflowPolicy,
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_QUEUE_CAPACITY,
            overflow: OverflowPolicy::Block,
        }
    }
}

/// Alert broadcast settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertSection {
    /// Port alerts are broadcast on
    pub port: u16,
    /// Broadcast target; limited broadcast on `port` when absent
    pub target: Option<SocketAddr>,
}

impl Default for AlertSection {
    fn default() -> Self {
        Self {
            port: ALERT_PORT,
            target: None,
        }
    }
}

impl AlertSection {
    /// Address alerts are sent to
    pub fn target(&self) -> SocketAddr {
        self.target
            .unwrap_or_else(|| SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::BROADCAST, self.port)))
    }
}

/// Frame recording settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingSection {
    /// Directory frames are written to; recording is off when absent
    pub dir: Option<PathBuf>,
}

impl CamlinkConfig {
    /// Load configuration from file and environment variables.
    ///
    /// A missing file yields defaults; a file that does not parse is an error.
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let path = config_path.as_ref();
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => {
                let config = Self::from_yaml(&content)
                    .with_context(|| format!("failed to parse config file {:?}", path))?;
                info!("Loaded configuration from {:?}", path);
                config
            }
            Err(_) => {
                warn!("Config file {:?} not found, using defaults", path);
                Self::default()
            }
        };

        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Parse a YAML document
    pub fn from_yaml(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Apply `CAMLINK_*` overrides looked up through `lookup`
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(bind) = lookup("CAMLINK_BIND") {
            self.session.bind = bind.parse().context("CAMLINK_BIND")?;
            info!("Bind address overridden by environment: {}", self.session.bind);
        }
        if let Some(peer) = lookup("CAMLINK_PEER") {
            self.session.peer = Some(peer.parse().context("CAMLINK_PEER")?);
            info!("Camera address overridden by environment: {}", peer);
        }
        if let Some(port) = lookup("CAMLINK_PEER_PORT") {
            self.session.peer_port = Some(port.parse().context("CAMLINK_PEER_PORT")?);
        }
        if let Some(layout) = lookup("CAMLINK_LAYOUT") {
            self.session.layout = match layout.as_str() {
                "compact" => HeaderLayout::Compact,
                "with_aux" => HeaderLayout::WithAux,
                other => anyhow::bail!("CAMLINK_LAYOUT: unknown layout {:?}", other),
            };
        }
        if let Some(size) = lookup("CAMLINK_BUFFER_SIZE") {
            self.session.buffer_size = size.parse().context("CAMLINK_BUFFER_SIZE")?;
        }
        if let Some(interval) = lookup("CAMLINK_KEEPALIVE_INTERVAL") {
            self.session.keepalive_interval =
                humantime::parse_duration(&interval).context("CAMLINK_KEEPALIVE_INTERVAL")?;
        }
        if let Some(capacity) = lookup("CAMLINK_QUEUE_CAPACITY") {
            self.queue.capacity = capacity.parse().context("CAMLINK_QUEUE_CAPACITY")?;
        }
        if let Some(port) = lookup("CAMLINK_ALERT_PORT") {
            self.alerts.port = port.parse().context("CAMLINK_ALERT_PORT")?;
        }
        if let Some(dir) = lookup("CAMLINK_RECORD_DIR") {
            self.recording.dir = Some(PathBuf::from(dir));
        }
        Ok(())
    }

    /// Session settings for the library
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            bind_addr: self.session.bind,
            peer: self.session.peer,
            peer_port: self.session.peer_port,
            layout: self.session.layout,
            buffer_size: self.session.buffer_size,
            discovery_timeout: self.session.discovery_timeout,
            ack_timeout: self.session.ack_timeout,
            keepalive_interval: self.session.keepalive_interval,
            stale_after: self.session.stale_after,
        }
    }

    /// Build the frame queue
    pub fn frame_queue(&self) -> FrameQueue {
        FrameQueue::new(self.queue.capacity, self.queue.overflow)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = CamlinkConfig::default();
        assert_eq!(config.session.bind, "0.0.0.0:6969".parse::<SocketAddr>().unwrap());
        assert_eq!(config.session.peer, None);
        assert_eq!(config.session.peer_port, Some(6969));
        assert_eq!(config.session.buffer_size, 1024);
        assert_eq!(config.session.keepalive_interval, Duration::from_millis(500));
        assert_eq!(config.queue.capacity, 10);
        assert_eq!(config.alerts.target(), "255.255.255.255:5005".parse::<SocketAddr>().unwrap());
        assert!(config.recording.dir.is_none());
    }

    #[test]
    fn test_load_from_file() {
        let yaml_content = r#"
session:
  peer: 192.168.4.1:6969
  layout: with_aux
  discovery_timeout: 3s
  keepalive_interval: 250ms
  stale_after: 2s

queue:
  capacity: 4
  overflow: drop_oldest

recording:
  dir: ./frames
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(yaml_content.as_bytes()).unwrap();

        let config = CamlinkConfig::load_from_file(temp_file.path()).unwrap();
        let session = config.session_config();

        assert_eq!(session.peer, Some("192.168.4.1:6969".parse().unwrap()));
        assert_eq!(session.layout, HeaderLayout::WithAux);
        assert_eq!(session.discovery_timeout, Duration::from_secs(3));
        assert_eq!(session.keepalive_interval, Duration::from_millis(250));
        assert_eq!(session.stale_after, Some(Duration::from_secs(2)));
        assert_eq!(session.ack_timeout, Duration::from_secs(5));

        let queue = config.frame_queue();
        assert_eq!(queue.capacity(), 4);
        assert_eq!(queue.policy(), OverflowPolicy::DropOldest);
        assert_eq!(config.recording.dir, Some(PathBuf::from("./frames")));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = CamlinkConfig::load_from_file(dir.path().join("absent.yaml")).unwrap();
        assert_eq!(config.queue.capacity, DEFAULT_QUEUE_CAPACITY);
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(b"session:\n  keepalive_interval: soon\n").unwrap();
        assert!(CamlinkConfig::load_from_file(temp_file.path()).is_err());
    }

    #[test]
    fn test_environment_overrides() {
        let env: HashMap<&str, &str> = [
            ("CAMLINK_PEER", "10.0.0.7:7000"),
            ("CAMLINK_LAYOUT", "with_aux"),
            ("CAMLINK_KEEPALIVE_INTERVAL", "1s"),
            ("CAMLINK_QUEUE_CAPACITY", "2"),
            ("CAMLINK_RECORD_DIR", "/tmp/frames"),
        ]
        .into_iter()
        .collect();

        let mut config = CamlinkConfig::default();
        config
            .apply_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.session.peer, Some("10.0.0.7:7000".parse().unwrap()));
        assert_eq!(config.session.layout, HeaderLayout::WithAux);
        assert_eq!(config.session.keepalive_interval, Duration::from_secs(1));
        assert_eq!(config.queue.capacity, 2);
        assert_eq!(config.recording.dir, Some(PathBuf::from("/tmp/frames")));
    }

    #[test]
    fn test_bad_override_is_an_error() {
        let mut config = CamlinkConfig::default();
        let result = config.apply_overrides(|key| (key == "CAMLINK_LAYOUT").then(|| "tiny".to_string()));
        assert!(result.is_err());
    }
}
