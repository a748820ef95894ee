//! Configuration file parser for the rtunnel relay
//!
//! Supports rtunnel-relay.yml with the tunnel listener, public HTTP
//! listener, reserved subdomains and header filtering.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub tunnel: TunnelListenerConfig,

    #[serde(default)]
    pub http: HttpListenerConfig,
}

/// Listener accepting tunnel clients
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelListenerConfig {
    #[serde(default = "default_bind_host")]
    pub host: String,

    #[serde(default = "default_tunnel_port")]
    pub port: u16,

    /// Root domain used to build public URLs (`https://<name>.<domain>`)
    pub domain: Option<String>,

    /// Reserved names; empty means generated names
    #[serde(default)]
    pub subdomains: Vec<String>,

    #[serde(default)]
    pub tls: TlsConfig,
}

impl Default for TunnelListenerConfig {
    fn default() -> Self {
        Self {
            host: default_bind_host(),
            port: default_tunnel_port(),
            domain: None,
            subdomains: Vec::new(),
            tls: TlsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsConfig {
    #[serde(default)]
    pub enabled: bool,

    pub cert_path: Option<PathBuf>,

    pub key_path: Option<PathBuf>,

    /// Require client certificates
    #[serde(default)]
    pub mutual_auth: bool,

    /// CA bundle used to verify client certificates
    pub client_ca_path: Option<PathBuf>,

    #[serde(default)]
    pub accept_invalid_certificates: bool,
}

/// Public HTTP listener
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpListenerConfig {
    #[serde(default = "default_bind_host")]
    pub host: String,

    #[serde(default = "default_http_port")]
    pub port: u16,

    /// Status returned when no tunnel matches the request host
    #[serde(default = "default_response_code")]
    pub default_response_code: u16,

    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_requests: usize,

    #[serde(default)]
    pub headers: HeaderConfig,
}

impl Default for HttpListenerConfig {
    fn default() -> Self {
        Self {
            host: default_bind_host(),
            port: default_http_port(),
            default_response_code: default_response_code(),
            timeout_ms: default_timeout_ms(),
            max_concurrent_requests: default_max_concurrent(),
            headers: HeaderConfig::default(),
        }
    }
}

impl HttpListenerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Header filtering for forwarded requests
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeaderConfig {
    /// Exact names, or prefixes ending in `*`
    #[serde(default)]
    pub blacklist: Vec<String>,

    #[serde(default = "default_ip_header")]
    pub ip_header_name: String,
}

impl Default for HeaderConfig {
    fn default() -> Self {
        Self {
            blacklist: Vec::new(),
            ip_header_name: default_ip_header(),
        }
    }
}

fn default_bind_host() -> String {
    "0.0.0.0".to_string()
}

fn default_tunnel_port() -> u16 {
    8081
}

fn default_http_port() -> u16 {
    8080
}

fn default_response_code() -> u16 {
    404
}

fn default_timeout_ms() -> u64 {
    20_000
}

fn default_max_concurrent() -> usize {
    5
}

fn default_ip_header() -> String {
    "X-Forwarded-For".to_string()
}

impl RelayConfig {
    /// Load configuration from a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: RelayConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if axum::http::StatusCode::from_u16(self.http.default_response_code).is_err() {
            anyhow::bail!(
                "Invalid default response code {}",
                self.http.default_response_code
            );
        }
        if self.http.max_concurrent_requests == 0 {
            anyhow::bail!("max_concurrent_requests must be at least 1");
        }
        if self.http.timeout_ms == 0 {
            anyhow::bail!("timeout_ms must be greater than 0");
        }
        if self.tunnel.subdomains.iter().any(|s| s.trim().is_empty()) {
            anyhow::bail!("Reserved subdomains cannot be empty");
        }

        let tls = &self.tunnel.tls;
        if tls.enabled && (tls.cert_path.is_none() || tls.key_path.is_none()) {
            anyhow::bail!("TLS enabled but cert_path/key_path not set");
        }
        if tls.mutual_auth && tls.client_ca_path.is_none() {
            anyhow::bail!("mutual_auth requires client_ca_path");
        }

        Ok(())
    }

    /// Search for config file in standard locations
    pub fn find_config() -> Option<PathBuf> {
        let candidates = [
            "rtunnel-relay.yml",
            "rtunnel-relay.yaml",
            ".rtunnel-relay.yml",
        ];

        for name in &candidates {
            let path = PathBuf::from(name);
            if path.exists() {
                return Some(path);
            }
        }

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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let yaml = r#"
tunnel:
  port: 9000
  domain: tunnel.example.com
  subdomains: [foo, bar]
http:
  port: 80
  default_response_code: 410
  headers:
    blacklist: ["Authorization", "X-Internal-*"]
    ip_header_name: X-Real-IP
"#;
        let config: RelayConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.tunnel.port, 9000);
        assert_eq!(config.tunnel.subdomains, vec!["foo", "bar"]);
        assert_eq!(config.tunnel.domain.as_deref(), Some("tunnel.example.com"));
        assert_eq!(config.http.default_response_code, 410);
        assert_eq!(config.http.headers.blacklist.len(), 2);
        assert_eq!(config.http.headers.ip_header_name, "X-Real-IP");
        assert_eq!(config.http.timeout_ms, 20_000);
        assert_eq!(config.http.max_concurrent_requests, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_defaults() {
        let config: RelayConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.http.default_response_code, 404);
        assert_eq!(config.http.headers.ip_header_name, "X-Forwarded-For");
        assert!(config.tunnel.subdomains.is_empty());
        assert!(!config.tunnel.tls.enabled);
    }

    #[test]
    fn test_validate_tls() {
        let mut config = RelayConfig::default();
        config.tunnel.tls.enabled = true;
        assert!(config.validate().is_err());

        config.tunnel.tls.cert_path = Some("cert.pem".into());
        config.tunnel.tls.key_path = Some("key.pem".into());
        assert!(config.validate().is_ok());

        config.tunnel.tls.mutual_auth = true;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_status_code() {
        let mut config = RelayConfig::default();
        config.http.default_response_code = 42;
        assert!(config.validate().is_err());
    }
}
