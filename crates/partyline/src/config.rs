use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::net::DEFAULT_PORT;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Tunables for one session. Durations are stored in milliseconds so the
/// struct maps one-to-one onto a TOML file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub port: u16,
    pub heartbeat_interval_ms: u64,
    pub ack_timeout_ms: u64,
    pub max_retries: u32,
    pub max_missed_heartbeats: u32,
    pub dedup_window: usize,
    pub max_peers: usize,
    /// Application kinds the host rebroadcasts to every other joined peer.
    pub relay_kinds: Vec<String>,
    /// Outbound loss simulation, 0 disables it.
    pub loss_percent: f32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            heartbeat_interval_ms: 500,
            ack_timeout_ms: 500,
            max_retries: 3,
            max_missed_heartbeats: 3,
            dedup_window: 128,
            max_peers: 8,
            relay_kinds: Vec::new(),
            loss_percent: 0.0,
        }
    }
}

impl TransportConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_interval_ms == 0 {
            return Err(ConfigError::Invalid("heartbeat_interval_ms must be > 0".into()));
        }
        if self.ack_timeout_ms == 0 {
            return Err(ConfigError::Invalid("ack_timeout_ms must be > 0".into()));
        }
        if self.max_missed_heartbeats == 0 {
            return Err(ConfigError::Invalid("max_missed_heartbeats must be > 0".into()));
        }
        if self.max_peers == 0 {
            return Err(ConfigError::Invalid("max_peers must be > 0".into()));
        }
        // Every retransmission of one id must still be remembered when it lands.
        if self.dedup_window <= self.max_retries as usize {
            return Err(ConfigError::Invalid(format!(
                "dedup_window ({}) must exceed max_retries ({})",
                self.dedup_window, self.max_retries
            )));
        }
        if !(0.0..=100.0).contains(&self.loss_percent) {
            return Err(ConfigError::Invalid("loss_percent must be within 0..=100".into()));
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn relays(&self, kind: &str) -> bool {
        self.relay_kinds.iter().any(|k| k == kind)
    }
}
