//! Configuration management for the camera QUIC server and client

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
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

/// Complete configuration shared by both binaries
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerSection,

    #[serde(default)]
    pub camera: CameraSection,

    #[serde(default)]
    pub client: ClientSection,
}

/// QUIC server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    /// UDP address the server binds to
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Accept one connection and exit instead of serving many
    #[serde(default)]
    pub single: bool,

    /// Upper bound on simultaneously served connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Bytes requested from the camera per read
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Chunks buffered per subscriber before it starts lagging
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,

    /// Seconds between throughput log lines
    #[serde(default = "default_stats_interval")]
    pub stats_interval_secs: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            single: false,
            max_connections: default_max_connections(),
            chunk_size: default_chunk_size(),
            broadcast_capacity: default_broadcast_capacity(),
            stats_interval_secs: default_stats_interval(),
        }
    }
}

/// Capture configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraSection {
    /// Frame width in pixels
    #[serde(default = "default_width")]
    pub width: u32,

    /// Frame height in pixels
    #[serde(default = "default_height")]
    pub height: u32,

    /// Frames per second (paces the test pattern)
    #[serde(default = "default_fps")]
    pub fps: u32,

    /// V4L2 pixel format
    #[serde(default = "default_fourcc")]
    pub fourcc: String,
}

impl Default for CameraSection {
    fn default() -> Self {
        Self {
            width: default_width(),
            height: default_height(),
            fps: default_fps(),
            fourcc: default_fourcc(),
        }
    }
}

impl CameraSection {
    /// Size in bytes of one packed 4:2:2 frame
    pub fn frame_size(&self) -> usize {
        self.width as usize * self.height as usize * 2
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs(1) / self.fps
    }
}

/// QUIC client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSection {
    /// Address of the camera server
    #[serde(default = "default_server_addr")]
    pub server_addr: SocketAddr,

    /// Bound on handshake plus stream accept
    #[serde(default = "default_dial_timeout")]
    pub dial_timeout_secs: u64,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            server_addr: default_server_addr(),
            dial_timeout_secs: default_dial_timeout(),
        }
    }
}

// Default value functions
fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 3030))
}
fn default_max_connections() -> usize {
    16
}
fn default_chunk_size() -> usize {
    32 * 1024
}
fn default_broadcast_capacity() -> usize {
    256
}
fn default_stats_interval() -> u64 {
    10
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
fn default_fourcc() -> String {
    "YUYV".to_string()
}
fn default_server_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 3030))
}
fn default_dial_timeout() -> u64 {
    10
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

    /// Loads `path` when given, defaults otherwise
    pub fn load_or_default<P: AsRef<Path>>(path: Option<P>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let server = &self.server;

        if !(1024..=1024 * 1024).contains(&server.chunk_size) {
            return Err(ConfigError::Invalid(format!(
                "chunk_size must be between 1024 and 1048576, got {}",
                server.chunk_size
            )));
        }

        if server.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "max_connections must be > 0".to_string(),
            ));
        }

        if server.broadcast_capacity == 0 {
            return Err(ConfigError::Invalid(
                "broadcast_capacity must be > 0".to_string(),
            ));
        }

        if server.stats_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "stats_interval_secs must be > 0".to_string(),
            ));
        }

        let cam = &self.camera;
        if cam.width == 0 || cam.height == 0 {
            return Err(ConfigError::Invalid(
                "camera width and height must be > 0".to_string(),
            ));
        }

        if cam.fps == 0 || cam.fps > 120 {
            return Err(ConfigError::Invalid(format!(
                "camera FPS must be between 1 and 120, got {}",
                cam.fps
            )));
        }

        if cam.fourcc.len() != 4 {
            return Err(ConfigError::Invalid(format!(
                "camera fourcc must be 4 characters, got {:?}",
                cam.fourcc
            )));
        }

        if self.client.dial_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "dial_timeout_secs must be > 0".to_string(),
            ));
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
}
