//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.gatewire/config.json`) and
//! environment. Recognized options cover the two gateway endpoints, the admin
//! endpoint, and channel timing.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Client configuration: endpoints and channel timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Request-reply endpoint of the management interface.
    #[serde(default = "default_command_endpoint")]
    pub command_endpoint: String,

    /// Request-reply endpoint of the admin/monitor interface.
    #[serde(default = "default_admin_endpoint")]
    pub admin_endpoint: String,

    /// Broadcast endpoint publishing gateway events.
    #[serde(default = "default_event_endpoint")]
    pub event_endpoint: String,

    /// Deadline for one command round trip, in milliseconds.
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,

    /// Bounded receive used by the event poll loop, in milliseconds. Also the
    /// worst-case latency for a listener to observe `stop()`.
    #[serde(default = "default_event_poll_ms")]
    pub event_poll_ms: u64,
}

fn default_command_endpoint() -> String {
    "tcp://127.0.0.1:5545".to_string()
}

fn default_admin_endpoint() -> String {
    "tcp://127.0.0.1:7445".to_string()
}

fn default_event_endpoint() -> String {
    "tcp://127.0.0.1:5546".to_string()
}

fn default_command_timeout_ms() -> u64 {
    5000
}

fn default_event_poll_ms() -> u64 {
    1000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            command_endpoint: default_command_endpoint(),
            admin_endpoint: default_admin_endpoint(),
            event_endpoint: default_event_endpoint(),
            command_timeout_ms: default_command_timeout_ms(),
            event_poll_ms: default_event_poll_ms(),
        }
    }
}

impl Config {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn event_poll(&self) -> Duration {
        Duration::from_millis(self.event_poll_ms)
    }
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("GATEWIRE_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .map(|h| h.join(".gatewire").join("config.json"))
                .unwrap_or_else(|| PathBuf::from("config.json"))
        })
}

/// Load config from the default path (or `GATEWIRE_CONFIG_PATH`). Missing
/// file => default config. `GATEWIRE_COMMAND_ENDPOINT` and
/// `GATEWIRE_EVENT_ENDPOINT` override the file when set.
/// Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let mut config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    if let Some(endpoint) = env_endpoint("GATEWIRE_COMMAND_ENDPOINT") {
        config.command_endpoint = endpoint;
    }
    if let Some(endpoint) = env_endpoint("GATEWIRE_EVENT_ENDPOINT") {
        config.event_endpoint = endpoint;
    }
    Ok((config, path))
}

fn env_endpoint(var: &str) -> Option<String> {
    std::env::var(var)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}
