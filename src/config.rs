//! Configuration management for the MJPEG server

use crate::server::ListenerConfig;
use crate::session::{ModeSelection, SessionConfig};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Complete server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub ingest: IngestConfig,

    /// Statistics reporting interval (seconds, 0 disables)
    #[serde(default = "default_stats_interval")]
    pub stats_interval_seconds: u64,

    #[serde(default)]
    pub cameras: Vec<CameraConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            ingest: IngestConfig::default(),
            stats_interval_seconds: default_stats_interval(),
            cameras: Vec::new(),
        }
    }
}

/// HTTP listener configuration shared by all cameras
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_ip")]
    pub bind_ip: IpAddr,

    /// Port of the first camera; later cameras count up from here
    #[serde(default = "default_base_port")]
    pub base_port: u16,

    /// Deadline for writing one part to a viewer (milliseconds)
    #[serde(default = "default_write_timeout")]
    pub write_timeout_ms: u64,

    /// Deadline for reading the request head (milliseconds)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,

    #[serde(default = "default_max_request_bytes")]
    pub max_request_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_ip: default_bind_ip(),
            base_port: default_base_port(),
            write_timeout_ms: default_write_timeout(),
            request_timeout_ms: default_request_timeout(),
            max_request_bytes: default_max_request_bytes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Minimum time between two polls of the frame source (milliseconds)
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
        }
    }
}

/// Per-camera configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraConfig {
    /// Device path, e.g. "/dev/video0"
    pub device: String,

    #[serde(default = "default_width")]
    pub width: u32,

    #[serde(default = "default_height")]
    pub height: u32,

    #[serde(default = "default_fps")]
    pub fps: u32,

    /// Share of USB bandwidth
    /// - 1.0 for up to two cameras
    /// - 0.5 for four
    /// - 0.25 for eight
    #[serde(default = "default_bandwidth")]
    pub bandwidth: f32,

    #[serde(default = "default_buffer_count")]
    pub buffer_count: u32,

    /// Explicit listener port (defaults to the next sequential port)
    #[serde(default)]
    pub port: Option<u16>,

    /// Exposure in tenths of a millisecond, negative for auto
    #[serde(default)]
    pub exposure: Option<i32>,
}

impl CameraConfig {
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            width: default_width(),
            height: default_height(),
            fps: default_fps(),
            bandwidth: default_bandwidth(),
            buffer_count: default_buffer_count(),
            port: None,
            exposure: None,
        }
    }

    pub fn mode_selection(&self) -> ModeSelection {
        ModeSelection::Exact {
            width: self.width,
            height: self.height,
            fps: self.fps,
        }
    }
}

// Default value functions
fn default_stats_interval() -> u64 {
    10
}
fn default_bind_ip() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}
fn default_base_port() -> u16 {
    8080
}
fn default_write_timeout() -> u64 {
    2000
}
fn default_request_timeout() -> u64 {
    5000
}
fn default_max_request_bytes() -> usize {
    8192
}
fn default_poll_interval() -> u64 {
    4
}
fn default_width() -> u32 {
    640
}
fn default_height() -> u32 {
    480
}
fn default_fps() -> u32 {
    30
}
fn default_bandwidth() -> f32 {
    1.0
}
fn default_buffer_count() -> u32 {
    2
}

impl Config {
    /// Loads configuration from TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Loads configuration from TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validates configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let server = &self.server;

        if server.base_port == 0 {
            return Err(ConfigError::Invalid("base_port must be > 0".to_string()));
        }

        if server.write_timeout_ms == 0 {
            return Err(ConfigError::Invalid("write_timeout_ms must be > 0".to_string()));
        }

        if server.request_timeout_ms == 0 {
            return Err(ConfigError::Invalid("request_timeout_ms must be > 0".to_string()));
        }

        if server.max_request_bytes < 16 {
            return Err(ConfigError::Invalid(format!(
                "max_request_bytes must be at least 16, got {}",
                server.max_request_bytes
            )));
        }

        if !(1..=1000).contains(&self.ingest.poll_interval_ms) {
            return Err(ConfigError::Invalid(format!(
                "poll_interval_ms must be between 1 and 1000, got {}",
                self.ingest.poll_interval_ms
            )));
        }

        for (i, cam) in self.cameras.iter().enumerate() {
            self.validate_camera(cam, &format!("cameras[{i}]"))?;
        }

        Ok(())
    }

    fn validate_camera(&self, cam: &CameraConfig, name: &str) -> Result<(), ConfigError> {
        if cam.device.is_empty() {
            return Err(ConfigError::Invalid(format!("{}: device must not be empty", name)));
        }

        if cam.width == 0 || cam.height == 0 {
            return Err(ConfigError::Invalid(format!(
                "{}: width and height must be > 0",
                name
            )));
        }

        if cam.fps == 0 || cam.fps > 240 {
            return Err(ConfigError::Invalid(format!(
                "{}: FPS must be between 1 and 240, got {}",
                name, cam.fps
            )));
        }

        if !(cam.bandwidth > 0.0 && cam.bandwidth <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "{}: bandwidth must be in (0, 1], got {}",
                name, cam.bandwidth
            )));
        }

        if cam.buffer_count == 0 {
            return Err(ConfigError::Invalid(format!(
                "{}: buffer_count must be >= 1",
                name
            )));
        }

        if cam.port == Some(0) {
            return Err(ConfigError::Invalid(format!("{}: port must be > 0", name)));
        }

        Ok(())
    }

    /// Saves configuration to TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Listener settings; the port is the base port.
    pub fn listener(&self) -> ListenerConfig {
        ListenerConfig {
            bind_addr: SocketAddr::new(self.server.bind_ip, self.server.base_port),
            write_timeout: Duration::from_millis(self.server.write_timeout_ms),
            request_timeout: Duration::from_millis(self.server.request_timeout_ms),
            max_request_bytes: self.server.max_request_bytes,
        }
    }

    /// Session template used by the hub for every camera.
    pub fn session_template(&self) -> SessionConfig {
        SessionConfig {
            listener: self.listener(),
            poll_interval: Duration::from_millis(self.ingest.poll_interval_ms),
            ..SessionConfig::default()
        }
    }

    /// Session settings for one camera.
    pub fn session_for(&self, cam: &CameraConfig) -> SessionConfig {
        SessionConfig {
            buffer_count: cam.buffer_count,
            bandwidth: cam.bandwidth,
            ..self.session_template()
        }
    }
}
