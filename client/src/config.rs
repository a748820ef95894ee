//! Configuration file parser for the rtunnel client
//!
//! Supports rtunnel.yml with multi-tunnel definitions, reconnect policy,
//! request concurrency and the local inspector.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Tunnel definitions
    #[serde(default)]
    pub tunnels: Vec<TunnelSetting>,

    #[serde(default)]
    pub retry: RetryConfig,

    /// Local calls in flight across all tunnels
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_requests: usize,

    #[serde(default)]
    pub inspector: InspectorConfig,
}

/// Single tunnel definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelSetting {
    /// Human-readable name, used in logs
    pub name: String,

    /// Relay tunnel address: `host:port` or a full `ws://` / `wss://` URL
    pub remote: String,

    /// Base address of the local service, e.g. `http://localhost:3000`
    pub local: String,

    /// Replaces the forwarded `Host` header
    pub host_header: Option<String>,

    /// Static headers added to every local call
    #[serde(default)]
    pub custom_headers: HashMap<String, String>,

    #[serde(default)]
    pub rewrite_url_enabled: bool,

    /// Regex whose matches in HTML responses are replaced by the public URL
    pub rewrite_url_pattern: Option<String>,

    /// Use `wss://` when `remote` has no scheme
    #[serde(default)]
    pub tls_enabled: bool,

    #[serde(default)]
    pub allow_invalid_certificates: bool,
}

impl TunnelSetting {
    /// Quick single-tunnel setting used by the `http` subcommand.
    pub fn new(name: impl Into<String>, remote: impl Into<String>, local: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            remote: remote.into(),
            local: local.into(),
            host_header: None,
            custom_headers: HashMap::new(),
            rewrite_url_enabled: false,
            rewrite_url_pattern: None,
            tls_enabled: false,
            allow_invalid_certificates: false,
        }
    }

    /// WebSocket URL of the relay's tunnel listener.
    pub fn remote_url(&self) -> String {
        if self.remote.starts_with("ws://") || self.remote.starts_with("wss://") {
            return self.remote.clone();
        }
        let scheme = if self.tls_enabled { "wss" } else { "ws" };
        format!("{}://{}", scheme, self.remote)
    }

    /// Rewriting needs both the flag and a pattern.
    pub fn rewrite_pattern(&self) -> Option<&str> {
        if !self.rewrite_url_enabled {
            return None;
        }
        self.rewrite_url_pattern
            .as_deref()
            .filter(|p| !p.trim().is_empty())
    }
}

/// Reconnect policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Consecutive failed attempts before giving up; `-1` retries forever
    #[serde(default = "default_max_retries")]
    pub max_retries: i32,

    #[serde(default = "default_retry_interval_ms")]
    pub interval_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            interval_ms: default_retry_interval_ms(),
        }
    }
}

impl RetryConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Inspector configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InspectorConfig {
    /// Serve the request log API
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Port for the inspector API (bound on 127.0.0.1)
    #[serde(default = "default_inspect_port")]
    pub port: u16,
}

impl Default for InspectorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 4040,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            tunnels: Vec::new(),
            retry: RetryConfig::default(),
            max_concurrent_requests: default_max_concurrent(),
            inspector: InspectorConfig::default(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_inspect_port() -> u16 {
    4040
}

fn default_max_concurrent() -> usize {
    5
}

fn default_max_retries() -> i32 {
    10
}

fn default_retry_interval_ms() -> u64 {
    5000
}

impl ClientConfig {
    /// Load configuration from a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: ClientConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.tunnels.is_empty() {
            anyhow::bail!("No tunnels defined in configuration");
        }
        if self.max_concurrent_requests == 0 {
            anyhow::bail!("max_concurrent_requests must be at least 1");
        }
        if self.retry.max_retries < -1 {
            anyhow::bail!("retry.max_retries must be -1 (unlimited) or a positive count");
        }

        for tunnel in &self.tunnels {
            if tunnel.name.is_empty() {
                anyhow::bail!("Tunnel name cannot be empty");
            }
            if tunnel.remote.is_empty() {
                anyhow::bail!("Tunnel '{}' has no remote address", tunnel.name);
            }
            if !(tunnel.local.starts_with("http://") || tunnel.local.starts_with("https://")) {
                anyhow::bail!(
                    "Invalid local address '{}' for tunnel '{}'",
                    tunnel.local,
                    tunnel.name
                );
            }
            if let Some(pattern) = tunnel.rewrite_pattern() {
                regex::Regex::new(pattern).with_context(|| {
                    format!("Invalid rewrite_url_pattern for tunnel '{}'", tunnel.name)
                })?;
            }
        }

        Ok(())
    }

    /// Search for config file in standard locations
    pub fn find_config() -> Option<PathBuf> {
        let candidates = ["rtunnel.yml", "rtunnel.yaml", ".rtunnel.yml", ".rtunnel.yaml"];

        // Check current directory
        for name in &candidates {
            let path = PathBuf::from(name);
            if path.exists() {
                return Some(path);
            }
        }

        // Check home directory
        if let Some(home) = dirs::home_dir() {
            for name in &candidates {
                let path = home.join(name);
                if path.exists() {
                    return Some(path);
                }
            }
        }

        None
    }
}
