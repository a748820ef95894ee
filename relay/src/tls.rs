//! TLS termination for the tunnel listener
//!
//! Builds the rustls server configuration from the `tunnel.tls` section,
//! optionally requiring client certificates signed by a configured CA.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use rtunnel_shared::trust::PolicyClientVerifier;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use tokio_rustls::TlsAcceptor;
use tracing::info;

use crate::config::TlsConfig;

pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open certificate file: {}", path.display()))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<std::result::Result<Vec<_>, _>>()
        .with_context(|| format!("Failed to parse certificates: {}", path.display()))?;
    if certs.is_empty() {
        return Err(anyhow!("No certificates found in {}", path.display()));
    }
    Ok(certs)
}

pub fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open key file: {}", path.display()))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .with_context(|| format!("Failed to parse private key: {}", path.display()))?
        .ok_or_else(|| anyhow!("No private key found in {}", path.display()))
}

/// `None` when TLS is disabled.
pub fn acceptor(config: &TlsConfig) -> Result<Option<TlsAcceptor>> {
    if !config.enabled {
        return Ok(None);
    }

    let cert_path = config
        .cert_path
        .as_deref()
        .ok_or_else(|| anyhow!("tls.cert_path is required"))?;
    let key_path = config
        .key_path
        .as_deref()
        .ok_or_else(|| anyhow!("tls.key_path is required"))?;
    let certs = load_certs(cert_path)?;
    let key = load_key(key_path)?;

    let builder = ServerConfig::builder();
    let builder = if config.mutual_auth {
        let ca_path = config
            .client_ca_path
            .as_deref()
            .ok_or_else(|| anyhow!("tls.client_ca_path is required for mutual_auth"))?;
        let mut roots = RootCertStore::empty();
        for cert in load_certs(ca_path)? {
            roots
                .add(cert)
                .context("Invalid client CA certificate")?;
        }
        let inner = WebPkiClientVerifier::builder(Arc::new(roots))
            .build()
            .context("Failed to build client certificate verifier")?;
        info!(
            "Mutual TLS enabled (accept invalid: {})",
            config.accept_invalid_certificates
        );
        builder.with_client_cert_verifier(Arc::new(PolicyClientVerifier::new(
            inner,
            config.accept_invalid_certificates,
        )))
    } else {
        builder.with_no_client_auth()
    };

    let server = builder
        .with_single_cert(certs, key)
        .context("Invalid certificate/key pair")?;
    Ok(Some(TlsAcceptor::from(Arc::new(server))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_tls() {
        assert!(acceptor(&TlsConfig::default()).unwrap().is_none());
    }

    #[test]
    fn test_missing_files() {
        let config = TlsConfig {
            enabled: true,
            cert_path: Some("/nonexistent/cert.pem".into()),
            key_path: Some("/nonexistent/key.pem".into()),
            ..Default::default()
        };
        let err = acceptor(&config).err().unwrap();
        assert!(err.to_string().contains("/nonexistent/cert.pem"));
    }

    #[test]
    fn test_empty_certificate_file() {
        let path = std::env::temp_dir().join(format!("rtunnel-empty-{}.pem", std::process::id()));
        std::fs::write(&path, "").unwrap();
        assert!(load_certs(&path).is_err());
        assert!(load_key(&path).is_err());
        std::fs::remove_file(&path).ok();
    }
}
