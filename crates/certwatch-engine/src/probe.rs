use async_trait::async_trait;
use certwatch_common::types::{CertificateFacts, ScanStatus};
use chrono::{DateTime, Utc};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use x509_parser::oid_registry;
use x509_parser::prelude::*;

/// How a probe failure should be treated by the retry policy and recorded
/// in scan history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Worth retrying: timeouts, refused connections, DNS hiccups, TLS
    /// negotiation errors.
    Transient,
    /// Never retried: no certificate was presented or it could not be parsed.
    Permanent,
    /// A certificate was presented but strict verification rejected it.
    /// Never retried; recorded as `INVALID` rather than `FAILED`.
    Rejected,
}

/// A classified probe failure.
#[derive(Debug, Clone)]
pub struct ProbeError {
    pub kind: FailureKind,
    pub message: String,
}

impl ProbeError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Permanent,
            message: message.into(),
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Rejected,
            message: message.into(),
        }
    }

    /// The scan status this failure maps to once retries are exhausted.
    pub fn status(&self) -> ScanStatus {
        match self.kind {
            FailureKind::Rejected => ScanStatus::Invalid,
            _ => ScanStatus::Failed,
        }
    }
}

impl std::fmt::Display for ProbeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ProbeError {}

/// Certificate verification mode for the probe's TLS client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerifyMode {
    /// Accept any presented certificate. Expired, self-signed and untrusted
    /// certificates are still retrievable, which is the point of monitoring.
    Permissive,
    /// Full webpki validation against the Mozilla root store.
    Strict,
}

/// Abstraction over the certificate probe so the scanner and its tests can
/// substitute fakes.
#[async_trait]
pub trait Probe: Send + Sync {
    async fn probe(&self, hostname: &str, port: u16) -> Result<CertificateFacts, ProbeError>;
}

/// Verifier for [`VerifyMode::Permissive`]: accepts every certificate but
/// still performs the handshake so the peer chain is captured.
#[derive(Debug)]
struct AcceptAnyServerCert(CryptoProvider);

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

/// TLS certificate probe: TCP connect, handshake, parse the peer leaf.
pub struct CertProbe {
    connector: TlsConnector,
    timeout: Duration,
    mode: VerifyMode,
}

impl CertProbe {
    pub fn new(timeout_secs: u64, mode: VerifyMode) -> Self {
        let config = match mode {
            VerifyMode::Permissive => ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert(
                    rustls::crypto::ring::default_provider(),
                )))
                .with_no_client_auth(),
            VerifyMode::Strict => {
                let mut roots = rustls::RootCertStore::empty();
                roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
                ClientConfig::builder()
                    .with_root_certificates(roots)
                    .with_no_client_auth()
            }
        };
        Self {
            connector: TlsConnector::from(Arc::new(config)),
            timeout: Duration::from_secs(timeout_secs),
            mode,
        }
    }

    async fn do_probe(&self, hostname: &str, port: u16) -> Result<CertificateFacts, ProbeError> {
        let server_name = ServerName::try_from(hostname.to_string())
            .map_err(|e| ProbeError::permanent(format!("Invalid hostname {hostname:?}: {e}")))?;

        // Resolve explicitly so DNS failures are reported as such.
        let addr = timeout(self.timeout, tokio::net::lookup_host((hostname, port)))
            .await
            .map_err(|_| {
                ProbeError::transient(format!(
                    "DNS resolution timed out after {}s",
                    self.timeout.as_secs()
                ))
            })?
            .map_err(|e| ProbeError::transient(format!("DNS resolution failed: {e}")))?
            .next()
            .ok_or_else(|| {
                ProbeError::transient(format!("DNS resolution failed: no addresses for {hostname}"))
            })?;

        let tcp = timeout(self.timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                ProbeError::transient(format!(
                    "Connection timed out after {}s",
                    self.timeout.as_secs()
                ))
            })?
            .map_err(|e| ProbeError::transient(format!("TCP connection failed: {e}")))?;

        let tls_stream = match timeout(self.timeout, self.connector.connect(server_name, tcp)).await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                // With verification disabled a handshake error is a protocol
                // problem; under strict verification it means the presented
                // certificate did not pass.
                return match self.mode {
                    VerifyMode::Strict => Err(ProbeError::rejected(format!(
                        "Certificate verification failed: {e}"
                    ))),
                    VerifyMode::Permissive => {
                        Err(ProbeError::transient(format!("TLS handshake failed: {e}")))
                    }
                };
            }
            Err(_) => {
                return Err(ProbeError::transient(format!(
                    "TLS handshake timed out after {}s",
                    self.timeout.as_secs()
                )))
            }
        };

        let (_io, conn) = tls_stream.into_inner();
        let certs = conn
            .peer_certificates()
            .ok_or_else(|| ProbeError::permanent("No peer certificates"))?;
        let leaf = certs
            .first()
            .ok_or_else(|| ProbeError::permanent("Empty certificate chain"))?;

        facts_from_der(leaf.as_ref(), Utc::now())
    }
}

#[async_trait]
impl Probe for CertProbe {
    async fn probe(&self, hostname: &str, port: u16) -> Result<CertificateFacts, ProbeError> {
        self.do_probe(hostname, port).await
    }
}

/// Parse a DER-encoded leaf certificate into [`CertificateFacts`].
///
/// `now` is the reference time for the validity flag and the
/// days-until-expiry computation, which may be negative for an expired
/// certificate.
pub fn facts_from_der(der: &[u8], now: DateTime<Utc>) -> Result<CertificateFacts, ProbeError> {
    let (_, cert) = X509Certificate::from_der(der)
        .map_err(|e| ProbeError::permanent(format!("Failed to parse X.509 certificate: {e}")))?;

    let not_before = DateTime::from_timestamp(cert.validity().not_before.timestamp(), 0)
        .unwrap_or_default();
    let not_after =
        DateTime::from_timestamp(cert.validity().not_after.timestamp(), 0).unwrap_or_default();

    let issuer = cert.issuer().to_string();
    let subject = cert.subject().to_string();

    let common_name = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(|s| s.to_string());

    let san_list: Vec<String> = cert
        .subject_alternative_name()
        .ok()
        .flatten()
        .map(|san| {
            san.value
                .general_names
                .iter()
                .filter_map(|name| match name {
                    GeneralName::DNSName(dns) => Some(dns.to_string()),
                    GeneralName::IPAddress(bytes) => ip_from_bytes(bytes),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(CertificateFacts {
        common_name,
        san_list,
        serial_number: cert.raw_serial_as_string(),
        self_signed: issuer == subject,
        key_bits: estimate_key_bits(&cert),
        signature_algorithm: sig_algorithm_name(&cert.signature_algorithm.algorithm),
        is_valid: now >= not_before && now <= not_after,
        // Floored, not truncated: half a day past expiry is day -1.
        days_until_expiry: (not_after - now).num_seconds().div_euclid(86_400),
        issuer,
        subject,
        not_before,
        not_after,
    })
}

fn ip_from_bytes(bytes: &[u8]) -> Option<String> {
    match bytes.len() {
        4 => {
            let octets: [u8; 4] = bytes.try_into().ok()?;
            Some(IpAddr::from(octets).to_string())
        }
        16 => {
            let octets: [u8; 16] = bytes.try_into().ok()?;
            Some(IpAddr::from(octets).to_string())
        }
        _ => None,
    }
}

/// Map a signature algorithm OID to a readable name.
fn sig_algorithm_name(oid: &x509_parser::der_parser::oid::Oid) -> String {
    let known = [
        (oid_registry::OID_PKCS1_SHA256WITHRSA, "SHA256withRSA"),
        (oid_registry::OID_PKCS1_SHA384WITHRSA, "SHA384withRSA"),
        (oid_registry::OID_PKCS1_SHA512WITHRSA, "SHA512withRSA"),
        (oid_registry::OID_PKCS1_SHA1WITHRSA, "SHA1withRSA"),
        (oid_registry::OID_SIG_ECDSA_WITH_SHA256, "ECDSAwithSHA256"),
        (oid_registry::OID_SIG_ECDSA_WITH_SHA384, "ECDSAwithSHA384"),
        (oid_registry::OID_SIG_ECDSA_WITH_SHA512, "ECDSAwithSHA512"),
        (oid_registry::OID_SIG_ED25519, "Ed25519"),
    ];
    for (known_oid, name) in &known {
        if oid == known_oid {
            return name.to_string();
        }
    }
    format!("{oid}")
}

/// Estimate the public key size in bits.
fn estimate_key_bits(cert: &X509Certificate) -> Option<i32> {
    let pk = cert.public_key();
    let alg = &pk.algorithm.algorithm;

    if *alg == oid_registry::OID_PKCS1_RSAENCRYPTION {
        // RSA public key is SEQUENCE { modulus INTEGER, exponent INTEGER };
        // bit size is the modulus length without the leading sign byte.
        let key_data = &pk.subject_public_key.data;
        let (_, seq) = x509_parser::der_parser::parse_der(key_data).ok()?;
        let items = seq.as_sequence().ok()?;
        let modulus = items.first()?.as_slice().ok()?;
        let modulus = match modulus.first() {
            Some(0) => &modulus[1..],
            _ => modulus,
        };
        Some((modulus.len() * 8) as i32)
    } else if *alg == oid_registry::OID_KEY_TYPE_EC_PUBLIC_KEY {
        let params = pk.algorithm.parameters.as_ref()?;
        let curve = params.as_oid().ok()?;
        if curve == oid_registry::OID_EC_P256 {
            Some(256)
        } else if curve == oid_registry::OID_NIST_EC_P384 {
            Some(384)
        } else if curve == oid_registry::OID_NIST_EC_P521 {
            Some(521)
        } else {
            None
        }
    } else if *alg == oid_registry::OID_SIG_ED25519 {
        Some(256)
    } else {
        None
    }
}
