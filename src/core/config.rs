use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Receive Maximum assumed when the client sent none (MQTT 5.0 3.1.2.11.3).
pub const CLIENT_RECEIVE_MAXIMUM_DEFAULT: u16 = u16::MAX;

fn default_max_inflight_window() -> u16 {
    50
}

fn default_registry_shards() -> usize {
    64
}

fn default_channel_capacity() -> usize {
    1024
}

/// Configuration for the QoS engine.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct EngineConfig {
    /// Broker cap on QoS 1/2 messages in flight per connection.
    #[serde(default = "default_max_inflight_window")]
    pub max_inflight_window: u16,
    /// Lock stripes in the packet identifier registry.
    #[serde(default = "default_registry_shards")]
    pub registry_shards: usize,
    /// Depth of each connection's event queue.
    #[serde(default = "default_channel_capacity")]
    pub event_channel_capacity: usize,
    /// Depth of each connection's queue towards the codec.
    #[serde(default = "default_channel_capacity")]
    pub outbound_channel_capacity: usize,
    #[serde(default)]
    pub log_level: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_inflight_window: default_max_inflight_window(),
            registry_shards: default_registry_shards(),
            event_channel_capacity: default_channel_capacity(),
            outbound_channel_capacity: default_channel_capacity(),
            log_level: None,
        }
    }
}

impl EngineConfig {
    /// Load configuration from a path resolved via QOS_ENGINE_CONFIG or defaults to `config/qos.toml`.
    /// Applies QOS_ENGINE_MAX_INFLIGHT to override `max_inflight_window` after parsing.
    pub fn load_from_env() -> Result<Self> {
        let path = env_config_path();
        let mut cfg = Self::load(&path)?;
        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load configuration from a specific file (TOML or JSON based on extension).
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path_ref = path.as_ref();
        let data = fs::read_to_string(path_ref)
            .with_context(|| format!("unable to read config {}", path_ref.display()))?;
        if is_json(path_ref) {
            Ok(serde_json::from_str(&data)
                .with_context(|| format!("invalid JSON config {}", path_ref.display()))?)
        } else {
            Ok(toml::from_str(&data)
                .with_context(|| format!("invalid TOML config {}", path_ref.display()))?)
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_inflight_window == 0 {
            bail!("max_inflight_window must be > 0");
        }
        if self.registry_shards == 0 {
            bail!("registry_shards must be > 0");
        }
        if self.event_channel_capacity == 0 || self.outbound_channel_capacity == 0 {
            bail!("channel capacities must be non-zero");
        }
        Ok(())
    }

    /// Effective window for a connection: the smaller of the client's
    /// Receive Maximum and the broker cap.
    pub fn window_size(&self, client_receive_maximum: Option<u16>) -> u16 {
        let client = match client_receive_maximum {
            None | Some(0) => CLIENT_RECEIVE_MAXIMUM_DEFAULT,
            Some(value) => value,
        };
        client.min(self.max_inflight_window).max(1)
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(value) = std::env::var("QOS_ENGINE_MAX_INFLIGHT") {
            self.max_inflight_window = value
                .trim()
                .parse()
                .with_context(|| format!("invalid QOS_ENGINE_MAX_INFLIGHT {value}"))?;
        }
        Ok(())
    }
}

fn env_config_path() -> PathBuf {
    if let Ok(path) = std::env::var("QOS_ENGINE_CONFIG") {
        PathBuf::from(path)
    } else {
        PathBuf::from("config/qos.toml")
    }
}

fn is_json(path: &Path) -> bool {
    matches!(path.extension().and_then(|s| s.to_str()), Some("json"))
}
