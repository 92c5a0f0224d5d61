//! Bridge configuration
//!
//! Every section has working defaults, so an empty YAML document is a valid
//! configuration:
//!
//! ```rust
//! use kinectron::config::BridgeConfig;
//!
//! let config = BridgeConfig::from_yaml_str("peer_server:\n  port: 9100\n").unwrap();
//! assert_eq!(config.peer_server.port, 9100);
//! assert_eq!(config.peer_server.max_connections, 50);
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};
use crate::types::{CameraOptions, FeedKind};

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub handlers: HandlerConfig,
    pub peer_server: PeerServerConfig,
    pub codec: CodecConfig,
    /// Per-feed camera option overrides, merged over the feed defaults.
    pub feeds: HashMap<FeedKind, CameraOptions>,
}

/// Stream handler timing and queueing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandlerConfig {
    /// Pause between stopping an active stream and restarting it.
    pub settle_delay_ms: u64,
    /// Pause after tracker creation before frames are requested.
    pub tracker_warmup_ms: u64,
    /// When set, handlers leave `start_listening` to a shared dispatcher.
    pub multi_frame: bool,
    /// Frames buffered between the sensor callback and the session task.
    pub frame_queue_depth: usize,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self { settle_delay_ms: 500, tracker_warmup_ms: 1000, multi_frame: false, frame_queue_depth: 2 }
    }
}

impl HandlerConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn tracker_warmup(&self) -> Duration {
        Duration::from_millis(self.tracker_warmup_ms)
    }
}

/// Relay server endpoint and supervision settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerServerConfig {
    pub host: String,
    pub port: u16,
    pub path: String,
    /// Answer `peers` requests with the list of admitted peer ids.
    pub allow_discovery: bool,
    pub max_connections: usize,
    /// Clients silent for longer than this are dropped.
    pub alive_timeout_ms: u64,
    pub health_check_interval_ms: u64,
    pub max_restart_attempts: u32,
    pub restart_cooldown_ms: u64,
    /// Delay before admitting clients the transport already holds.
    pub existing_connection_scan_ms: u64,
}

impl Default for PeerServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9001,
            path: "/".to_string(),
            allow_discovery: true,
            max_connections: 50,
            alive_timeout_ms: 60_000,
            health_check_interval_ms: 30_000,
            max_restart_attempts: 3,
            restart_cooldown_ms: 5_000,
            existing_connection_scan_ms: 1_000,
        }
    }
}

impl PeerServerConfig {
    pub fn alive_timeout(&self) -> Duration {
        Duration::from_millis(self.alive_timeout_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn restart_cooldown(&self) -> Duration {
        Duration::from_millis(self.restart_cooldown_ms)
    }

    pub fn existing_connection_scan(&self) -> Duration {
        Duration::from_millis(self.existing_connection_scan_ms)
    }

    /// `host:port` for binding.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Depth-key image compression settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodecConfig {
    pub lossless: bool,
    pub quality: u8,
    /// Encoder effort, 0 (fast) to 6 (smallest).
    pub method: u8,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self { lossless: true, quality: 100, method: 6 }
    }
}

impl BridgeConfig {
    /// Parse and validate a YAML document.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: BridgeConfig = if yaml.trim().is_empty() {
            BridgeConfig::default()
        } else {
            serde_yaml_ng::from_str(yaml)?
        };
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path)
            .map_err(|e| BridgeError::config_file(path.to_path_buf(), e))?;
        Self::from_yaml_str(&yaml)
    }

    pub fn validate(&self) -> Result<()> {
        let server = &self.peer_server;
        if server.max_connections == 0 {
            return Err(BridgeError::config("peer_server.max_connections", "must be greater than 0"));
        }
        if !server.path.starts_with('/') {
            return Err(BridgeError::config("peer_server.path", "must start with '/'"));
        }
        if server.health_check_interval_ms == 0 {
            return Err(BridgeError::config("peer_server.health_check_interval_ms", "must be non-zero"));
        }
        if server.alive_timeout_ms == 0 {
            return Err(BridgeError::config("peer_server.alive_timeout_ms", "must be non-zero"));
        }
        if self.handlers.frame_queue_depth == 0 {
            return Err(BridgeError::config("handlers.frame_queue_depth", "must be greater than 0"));
        }
        if !self.codec.lossless {
            return Err(BridgeError::config(
                "codec.lossless",
                "depth-key frames carry depth in colour channels and need lossless encoding",
            ));
        }
        if self.codec.method > 6 || self.codec.quality > 100 {
            return Err(BridgeError::config("codec", "method must be 0-6 and quality 0-100"));
        }
        Ok(())
    }

    /// Caller overrides configured for `kind`, empty if none.
    pub fn feed_options(&self, kind: FeedKind) -> CameraOptions {
        self.feeds.get(&kind).cloned().unwrap_or_default()
    }
}
