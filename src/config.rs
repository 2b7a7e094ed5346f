use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub auth: AuthConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_bind")]
    pub bind: String,
    /// Bind address for the token HTTP listener; `None` disables it.
    #[serde(default = "default_http_bind")]
    pub http_bind: Option<String>,
    #[serde(default = "default_outbound_queue_capacity")]
    pub outbound_queue_capacity: usize,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_server_bind(),
            http_bind: default_http_bind(),
            outbound_queue_capacity: default_outbound_queue_capacity(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            max_frame_bytes: default_max_frame_bytes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    #[serde(default = "default_bus_url")]
    pub url: String,
    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            url: default_bus_url(),
            reconnect_base_delay_ms: default_reconnect_base_delay_ms(),
            reconnect_max_delay_ms: default_reconnect_max_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Shared secret for credential signing. Empty means every token
    /// verifies against the empty key; fine for local development, never
    /// for production.
    #[serde(default)]
    pub secret: String,
    #[serde(default = "default_token_ttl_secs")]
    pub token_ttl_secs: u64,
    /// Reserved connection-level topic: joinable without a credential and
    /// the only topic whose `heartbeat` event refreshes liveness.
    #[serde(default = "default_system_topic")]
    pub system_topic: String,
    /// Additional topics joinable without a credential.
    #[serde(default)]
    pub public_topics: Vec<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            secret: String::new(),
            token_ttl_secs: default_token_ttl_secs(),
            system_topic: default_system_topic(),
            public_topics: Vec::new(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let cfg = if path.exists() {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("failed reading config file {}", path.display()))?;
            toml::from_str::<Config>(&text)
                .with_context(|| format!("failed parsing TOML config {}", path.display()))?
        } else {
            Self::default()
        };
        Ok(cfg)
    }

    pub fn apply_cli_overrides(
        &mut self,
        bind: Option<&str>,
        bus_url: Option<&str>,
        secret: Option<&str>,
    ) {
        if let Some(bind) = bind.map(str::trim).filter(|value| !value.is_empty()) {
            self.server.bind = bind.to_owned();
        }
        if let Some(url) = bus_url.map(str::trim).filter(|value| !value.is_empty()) {
            self.bus.url = url.to_owned();
        }
        if let Some(secret) = secret {
            self.auth.secret = secret.to_owned();
        }
    }
}

fn default_server_bind() -> String {
    "0.0.0.0:4000".to_owned()
}

fn default_http_bind() -> Option<String> {
    Some("0.0.0.0:4001".to_owned())
}

fn default_outbound_queue_capacity() -> usize {
    256
}

fn default_heartbeat_interval_ms() -> u64 {
    30_000
}

fn default_heartbeat_timeout_ms() -> u64 {
    60_000
}

fn default_max_frame_bytes() -> usize {
    256 * 1024
}

fn default_bus_url() -> String {
    "redis://127.0.0.1:6379".to_owned()
}

fn default_reconnect_base_delay_ms() -> u64 {
    1_000
}

fn default_reconnect_max_delay_ms() -> u64 {
    30_000
}

fn default_token_ttl_secs() -> u64 {
    3_600
}

fn default_system_topic() -> String {
    "phoenix".to_owned()
}
