//! TLS connector for `wss://` relays

use std::sync::Arc;

use rtunnel_shared::trust::PolicyServerVerifier;
use rtunnel_shared::{Error, Result};
use rustls::client::WebPkiServerVerifier;
use rustls::{ClientConfig, RootCertStore};
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::Connector;

/// Connector verifying the relay against the webpki roots; validation
/// failures pass only when `allow_invalid` is set.
pub fn connector(allow_invalid: bool) -> Result<Connector> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let inner = WebPkiServerVerifier::builder(Arc::new(roots))
        .build()
        .map_err(|e| Error::Config(format!("server certificate verifier: {}", e)))?;

    let config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(PolicyServerVerifier::new(inner, allow_invalid)))
        .with_no_client_auth();

    Ok(Connector::Rustls(Arc::new(config)))
}

/// Certificate failures end the session; anything else is a transport error.
pub fn connect_error(err: WsError) -> Error {
    if let WsError::Io(io) = &err {
        let tls = io
            .get_ref()
            .and_then(|inner| inner.downcast_ref::<rustls::Error>());
        if let Some(rustls::Error::InvalidCertificate(reason)) = tls {
            return Error::CertificateRejected(format!("{:?}", reason));
        }
    }
    Error::Connection(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connector_builds() {
        assert!(matches!(connector(false).unwrap(), Connector::Rustls(_)));
        assert!(matches!(connector(true).unwrap(), Connector::Rustls(_)));
    }

    #[test]
    fn test_connect_error_classification() {
        let bad_cert = std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            rustls::Error::InvalidCertificate(rustls::CertificateError::UnknownIssuer),
        );
        assert!(matches!(
            connect_error(WsError::Io(bad_cert)),
            Error::CertificateRejected(reason) if reason.contains("UnknownIssuer")
        ));

        let refused = std::io::Error::from(std::io::ErrorKind::ConnectionRefused);
        assert!(matches!(connect_error(WsError::Io(refused)), Error::Connection(_)));
    }
}
