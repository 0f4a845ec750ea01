//! Camera and control channel settings
//!
//! Both configs deserialize from YAML with every field optional; missing
//! fields take the defaults below. Durations are written in milliseconds.
//!
//! ```rust
//! use camlink::config::ConnectionConfig;
//!
//! let config = ConnectionConfig::from_yaml_str(
//!     "server_url: wss://example.com/camera\nmax_reconnect_attempts: 3\n",
//! )
//! .unwrap();
//! assert_eq!(config.protocol_version, 3);
//! assert_eq!(config.max_reconnect_attempts, 3);
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::channel::DEFAULT_CHANNEL_CAPACITY;
use crate::encoder::DEFAULT_CHUNK_SIZE;
use crate::upload::multipart::{UPLOAD_BOUNDARY, UPLOAD_FILE_NAME};
use crate::{CameraError, Result};

/// Settings for the explain upload and the live view
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    /// Explain endpoint; empty disables `explain`
    pub explain_url: String,
    /// Bearer token for the explain endpoint
    pub explain_token: String,
    /// Sent as `Device-Id`
    pub device_id: String,
    /// Sent as `Client-Id`
    pub client_id: String,
    /// JPEG quality of uploaded frames
    pub upload_quality: u8,
    /// JPEG quality for live view and snapshot conversions
    pub stream_quality: u8,
    /// Chunk channel capacity between encoder and uploader
    pub channel_capacity: usize,
    /// Size of encoder output pieces
    pub chunk_size: usize,
    /// Default live view frame rate
    pub stream_fps: u32,
    /// Frames discarded when streaming starts
    pub warmup_frames: usize,
    /// Multipart boundary of the live view
    pub stream_boundary: String,
    /// Multipart boundary of the upload form
    pub upload_boundary: String,
    /// File name announced for the uploaded JPEG
    pub upload_file_name: String,
    /// Upload request timeout in milliseconds
    pub upload_timeout_ms: u64,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            explain_url: String::new(),
            explain_token: String::new(),
            device_id: String::new(),
            client_id: String::new(),
            upload_quality: 50,
            stream_quality: 80,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            chunk_size: DEFAULT_CHUNK_SIZE,
            stream_fps: 8,
            warmup_frames: 5,
            stream_boundary: "frame".to_string(),
            upload_boundary: UPLOAD_BOUNDARY.to_string(),
            upload_file_name: UPLOAD_FILE_NAME.to_string(),
            upload_timeout_ms: 30_000,
        }
    }
}

impl CameraConfig {
    /// Parse from a YAML document
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        Ok(serde_yaml_ng::from_str(yaml)?)
    }

    /// Load from a YAML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path)
            .map_err(|e| CameraError::io_with_source(format!("reading {}", path.display()), e))?;
        Self::from_yaml_str(&yaml)
    }

    /// Set explain endpoint and token
    pub fn with_explain(mut self, url: impl Into<String>, token: impl Into<String>) -> Self {
        self.explain_url = url.into();
        self.explain_token = token.into();
        self
    }

    /// Set device and client identifiers
    pub fn with_identity(mut self, device_id: impl Into<String>, client_id: impl Into<String>) -> Self {
        self.device_id = device_id.into();
        self.client_id = client_id.into();
        self
    }

    /// Set chunk channel capacity
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    /// Set encoder chunk size
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Upload request timeout
    pub fn upload_timeout(&self) -> Duration {
        Duration::from_millis(self.upload_timeout_ms)
    }
}

/// Settings of the persistent control channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Websocket address; empty keeps the manager idle
    pub server_url: String,
    /// Bearer token
    pub token: String,
    /// Value of the `Protocol-Version` header and hello message
    pub protocol_version: u32,
    /// Sent as `Device-Id` and in heartbeats
    pub device_id: String,
    /// Sent as `Client-Id`
    pub client_id: String,
    /// Fixed wait between failed connects, milliseconds
    pub reconnect_interval_ms: u64,
    /// Consecutive failed connects before giving up
    pub max_reconnect_attempts: u32,
    /// Heartbeat period, milliseconds
    pub heartbeat_interval_ms: u64,
    /// Wait for the server hello, milliseconds
    pub handshake_timeout_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            server_url: String::new(),
            token: String::new(),
            protocol_version: 3,
            device_id: String::new(),
            client_id: String::new(),
            reconnect_interval_ms: 5_000,
            max_reconnect_attempts: 10,
            heartbeat_interval_ms: 30_000,
            handshake_timeout_ms: 10_000,
        }
    }
}

impl ConnectionConfig {
    /// Config pointing at `server_url`, defaults elsewhere
    pub fn new(server_url: impl Into<String>) -> Self {
        Self { server_url: server_url.into(), ..Self::default() }
    }

    /// Parse from a YAML document
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        Ok(serde_yaml_ng::from_str(yaml)?)
    }

    /// Load from a YAML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path)
            .map_err(|e| CameraError::io_with_source(format!("reading {}", path.display()), e))?;
        Self::from_yaml_str(&yaml)
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = token.into();
        self
    }

    pub fn with_identity(mut self, device_id: impl Into<String>, client_id: impl Into<String>) -> Self {
        self.device_id = device_id.into();
        self.client_id = client_id.into();
        self
    }

    pub fn with_reconnect(mut self, interval: Duration, max_attempts: u32) -> Self {
        self.reconnect_interval_ms = interval.as_millis() as u64;
        self.max_reconnect_attempts = max_attempts;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_defaults() {
        let config = ConnectionConfig::default();
        assert_eq!(config.protocol_version, 3);
        assert_eq!(config.reconnect_interval(), Duration::from_secs(5));
        assert_eq!(config.max_reconnect_attempts, 10);
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(30));
        assert_eq!(config.handshake_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn camera_defaults() {
        let config = CameraConfig::default();
        assert_eq!(config.upload_quality, 50);
        assert_eq!(config.stream_quality, 80);
        assert_eq!(config.channel_capacity, 40);
        assert_eq!(config.chunk_size, 512);
        assert_eq!(config.upload_boundary, "----ESP32_CAMERA_BOUNDARY");
        assert_eq!(config.upload_file_name, "camera.jpg");
    }

    #[test]
    fn partial_yaml_keeps_defaults() {
        let yaml = "explain_url: http://explain.local/api\nexplain_token: abc\nchannel_capacity: 8\n";
        let config = CameraConfig::from_yaml_str(yaml).unwrap();

        assert_eq!(config.explain_url, "http://explain.local/api");
        assert_eq!(config.channel_capacity, 8);
        assert_eq!(config.upload_quality, 50);
    }

    #[test]
    fn durations_are_milliseconds() {
        let yaml = "server_url: ws://localhost:9000\nreconnect_interval_ms: 250\nheartbeat_interval_ms: 1000\n";
        let config = ConnectionConfig::from_yaml_str(yaml).unwrap();

        assert_eq!(config.reconnect_interval(), Duration::from_millis(250));
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(1));
    }

    #[test]
    fn malformed_yaml_is_a_parse_error() {
        let result = ConnectionConfig::from_yaml_str("server_url: [unclosed");
        assert!(matches!(result, Err(CameraError::Parse { ref context, .. }) if context == "YAML"));
    }

    #[test]
    fn builders_compose() {
        let config = ConnectionConfig::new("ws://localhost")
            .with_token("t")
            .with_reconnect(Duration::from_millis(1), 3)
            .with_heartbeat_interval(Duration::from_millis(20));

        assert_eq!(config.token, "t");
        assert_eq!(config.max_reconnect_attempts, 3);
        assert_eq!(config.reconnect_interval_ms, 1);
        assert_eq!(config.heartbeat_interval_ms, 20);
    }
}
