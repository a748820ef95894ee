//! Certificate trust policy.
//!
//! Both ends verify peers with the stock webpki verifiers and then run the
//! outcome through a [`TrustDecision`], which applies the operator's
//! "accept invalid certificates" override. Validation failures are rejected
//! unless that override is set.

use std::fmt;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{DigitallySignedStruct, DistinguishedName, SignatureScheme};
use sha2::{Digest, Sha256};
use tracing::{error, info, warn};

use crate::{Error, Result};

/// Outcome of chain validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validation {
    Valid,
    Invalid(String),
}

/// Whether to proceed with a peer, given its validation outcome
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustDecision {
    pub validation: Validation,
    pub accept_invalid: bool,
}

impl TrustDecision {
    pub fn new(validation: Validation, accept_invalid: bool) -> Self {
        Self {
            validation,
            accept_invalid,
        }
    }

    pub fn from_result<T>(result: &std::result::Result<T, rustls::Error>, accept_invalid: bool) -> Self {
        let validation = match result {
            Ok(_) => Validation::Valid,
            Err(e) => Validation::Invalid(e.to_string()),
        };
        Self::new(validation, accept_invalid)
    }

    pub fn is_trusted(&self) -> bool {
        match self.validation {
            Validation::Valid => true,
            Validation::Invalid(_) => self.accept_invalid,
        }
    }

    pub fn into_result(self) -> Result<()> {
        match self.validation {
            Validation::Invalid(reason) if !self.accept_invalid => {
                Err(Error::CertificateRejected(reason))
            }
            _ => Ok(()),
        }
    }
}

/// Human-readable summary of a presented certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateDetails {
    pub subject: String,
    pub issuer: String,
    pub not_before: String,
    pub not_after: String,
    /// SHA-256 over the DER bytes, colon-separated hex
    pub fingerprint: String,
}

impl CertificateDetails {
    pub fn parse(der: &[u8]) -> Option<Self> {
        let (_, cert) = x509_parser::parse_x509_certificate(der).ok()?;
        let validity = cert.validity();
        Some(Self {
            subject: cert.subject().to_string(),
            issuer: cert.issuer().to_string(),
            not_before: validity.not_before.to_string(),
            not_after: validity.not_after.to_string(),
            fingerprint: fingerprint(der),
        })
    }
}

impl fmt::Display for CertificateDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "subject={} issuer={} valid={}..{} sha256={}",
            self.subject, self.issuer, self.not_before, self.not_after, self.fingerprint
        )
    }
}

pub fn fingerprint(der: &[u8]) -> String {
    Sha256::digest(der)
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":")
}

fn log_certificate(der: &[u8]) {
    match CertificateDetails::parse(der) {
        Some(details) => info!(
            subject = %details.subject,
            issuer = %details.issuer,
            not_before = %details.not_before,
            not_after = %details.not_after,
            fingerprint = %details.fingerprint,
            "Peer certificate"
        ),
        None => warn!("Peer presented an unparseable certificate"),
    }
}

/// Applies a [`TrustDecision`] to a server verifier's outcome (client side).
#[derive(Debug)]
pub struct PolicyServerVerifier {
    inner: Arc<dyn ServerCertVerifier>,
    accept_invalid: bool,
}

impl PolicyServerVerifier {
    pub fn new(inner: Arc<dyn ServerCertVerifier>, accept_invalid: bool) -> Self {
        Self {
            inner,
            accept_invalid,
        }
    }
}

impl ServerCertVerifier for PolicyServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        log_certificate(end_entity);
        let result =
            self.inner
                .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now);
        let decision = TrustDecision::from_result(&result, self.accept_invalid);
        match (result, decision.into_result()) {
            (Ok(verified), _) => Ok(verified),
            (Err(e), Ok(())) => {
                warn!("Certificate error accepted by policy: {}", e);
                Ok(ServerCertVerified::assertion())
            }
            (Err(e), Err(rejected)) => {
                error!("{}", rejected);
                Err(e)
            }
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

/// Applies a [`TrustDecision`] to a client verifier's outcome (mutual TLS on the host).
#[derive(Debug)]
pub struct PolicyClientVerifier {
    inner: Arc<dyn ClientCertVerifier>,
    accept_invalid: bool,
}

impl PolicyClientVerifier {
    pub fn new(inner: Arc<dyn ClientCertVerifier>, accept_invalid: bool) -> Self {
        Self {
            inner,
            accept_invalid,
        }
    }
}

impl ClientCertVerifier for PolicyClientVerifier {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        self.inner.root_hint_subjects()
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> std::result::Result<ClientCertVerified, rustls::Error> {
        log_certificate(end_entity);
        let result = self.inner.verify_client_cert(end_entity, intermediates, now);
        let decision = TrustDecision::from_result(&result, self.accept_invalid);
        match (result, decision.into_result()) {
            (Ok(verified), _) => Ok(verified),
            (Err(e), Ok(())) => {
                warn!("Client certificate error accepted by policy: {}", e);
                Ok(ClientCertVerified::assertion())
            }
            (Err(e), Err(rejected)) => {
                error!("Mutual TLS: {}", rejected);
                Err(e)
            }
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}
