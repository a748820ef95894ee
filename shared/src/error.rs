//! Error types for rtunnel.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// A tunnel frame could not be decoded.
    #[error("Format error: {0}")]
    Format(String),

    #[error("No more subdomains available")]
    NameExhausted,

    #[error("Request timed out waiting for the tunnel client")]
    RequestTimeout,

    #[error("Tunnel connection lost")]
    ConnectionLost,

    /// The local (client side) or tunnelled (host side) HTTP call failed.
    #[error("Upstream call failed: {0}")]
    Upstream(String),

    #[error("Certificate rejected: {0}")]
    CertificateRejected(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn format(msg: impl Into<String>) -> Self {
        Error::Format(msg.into())
    }
}
