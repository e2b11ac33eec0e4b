//! Certificate authority and server certificates for the cache endpoints
//!
//! The CA is self-signed and long lived; server certificates are bound to
//! the cluster IP of the cache's service and signed by the current CA.
//! Both are rotated once 80% of their lifetime has passed.

use std::net::IpAddr;

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue, IsCa, Issuer,
    KeyPair, KeyUsagePurpose, SanType,
};
use thiserror::Error;
use x509_parser::prelude::*;

use registry_cache_common::Error;

/// CA validity in days
pub const CA_VALIDITY_DAYS: i64 = 730;

/// Server certificate validity in days
pub const SERVER_CERT_VALIDITY_DAYS: i64 = 90;

/// Fraction of the lifetime after which a certificate is renewed
pub const ROTATION_THRESHOLD: f64 = 0.80;

fn compute_validity(days: i64) -> (::time::OffsetDateTime, ::time::OffsetDateTime) {
    let now = ::time::OffsetDateTime::now_utc();
    (now, now + ::time::Duration::days(days))
}

/// PKI errors
#[derive(Debug, Error)]
pub enum PkiError {
    /// Certificate generation failed
    #[error("certificate generation failed: {0}")]
    CertificateGenerationFailed(String),

    /// Key generation failed
    #[error("key generation failed: {0}")]
    KeyGenerationFailed(String),

    /// Certificate parsing error
    #[error("certificate parsing error: {0}")]
    ParseError(String),
}

impl From<PkiError> for Error {
    fn from(err: PkiError) -> Self {
        Error::certificate(err.to_string())
    }
}

/// Result type for PKI operations
pub type Result<T> = std::result::Result<T, PkiError>;

/// Parse PEM-encoded data and return the DER bytes
pub fn parse_pem(pem_data: &str) -> Result<Vec<u8>> {
    let pem_obj = ::pem::parse(pem_data.as_bytes())
        .map_err(|e| PkiError::ParseError(format!("failed to parse PEM: {}", e)))?;
    Ok(pem_obj.contents().to_vec())
}

/// Validity and identity of a certificate
#[derive(Debug, Clone, PartialEq)]
pub struct CertificateInfo {
    /// When the certificate becomes valid (Unix timestamp)
    pub not_before: i64,
    /// When the certificate expires (Unix timestamp)
    pub not_after: i64,
    /// Subject common name
    pub common_name: String,
    /// IP subject alternative names
    pub ip_addresses: Vec<IpAddr>,
}

impl CertificateInfo {
    /// Parse certificate info from a PEM-encoded certificate
    pub fn from_pem(pem_data: &str) -> Result<Self> {
        let der = parse_pem(pem_data)?;
        Self::from_der(&der)
    }

    /// Parse certificate info from a DER-encoded certificate
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| PkiError::ParseError(format!("failed to parse certificate: {}", e)))?;

        let common_name = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .unwrap_or("")
            .to_string();

        let mut ip_addresses = Vec::new();
        if let Ok(Some(san)) = cert.subject_alternative_name() {
            for name in &san.value.general_names {
                if let GeneralName::IPAddress(raw) = name {
                    match raw.len() {
                        4 => {
                            let octets: [u8; 4] = [raw[0], raw[1], raw[2], raw[3]];
                            ip_addresses.push(IpAddr::from(octets));
                        }
                        16 => {
                            let mut octets = [0u8; 16];
                            octets.copy_from_slice(raw);
                            ip_addresses.push(IpAddr::from(octets));
                        }
                        _ => {}
                    }
                }
            }
        }

        Ok(Self {
            not_before: cert.validity().not_before.timestamp(),
            not_after: cert.validity().not_after.timestamp(),
            common_name,
            ip_addresses,
        })
    }

    /// Total lifetime in seconds
    pub fn lifetime_secs(&self) -> i64 {
        self.not_after - self.not_before
    }

    /// Whether the certificate has expired at `now` (Unix timestamp)
    pub fn is_expired_at(&self, now: i64) -> bool {
        self.not_after <= now
    }

    /// Whether 80% of the lifetime has passed at `now` (Unix timestamp)
    pub fn needs_rotation_at(&self, now: i64) -> bool {
        let lifetime = self.lifetime_secs();
        if lifetime <= 0 {
            return true;
        }
        (now - self.not_before) as f64 / lifetime as f64 >= ROTATION_THRESHOLD
    }
}

/// Self-signed certificate authority
#[derive(Clone)]
pub struct CertificateAuthority {
    ca_key_pem: String,
    ca_cert_pem: String,
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("ca_cert_pem", &self.ca_cert_pem)
            .finish_non_exhaustive()
    }
}

impl CertificateAuthority {
    /// Create a new self-signed CA valid for [`CA_VALIDITY_DAYS`]
    pub fn new(common_name: &str) -> Result<Self> {
        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        dn.push(
            DnType::CommonName,
            DnValue::Utf8String(common_name.to_string()),
        );
        params.distinguished_name = dn;

        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        let (not_before, not_after) = compute_validity(CA_VALIDITY_DAYS);
        params.not_before = not_before;
        params.not_after = not_after;

        let key_pair = KeyPair::generate().map_err(|e| {
            PkiError::KeyGenerationFailed(format!("failed to generate CA key: {}", e))
        })?;
        let ca_key_pem = key_pair.serialize_pem();

        let cert = params.self_signed(&key_pair).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to create CA cert: {}", e))
        })?;

        Ok(Self {
            ca_key_pem,
            ca_cert_pem: cert.pem(),
        })
    }

    /// Load a CA from its PEM certificate and key
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        KeyPair::from_pem(key_pem)
            .map_err(|e| PkiError::ParseError(format!("failed to parse CA key: {}", e)))?;
        parse_pem(cert_pem)?;

        Ok(Self {
            ca_key_pem: key_pem.to_string(),
            ca_cert_pem: cert_pem.to_string(),
        })
    }

    /// PEM-encoded CA certificate
    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    /// PEM-encoded CA private key
    pub fn ca_key_pem(&self) -> &str {
        &self.ca_key_pem
    }

    /// Validity of the CA certificate
    pub fn cert_info(&self) -> Result<CertificateInfo> {
        CertificateInfo::from_pem(&self.ca_cert_pem)
    }

    fn load_key_pair(&self) -> Result<KeyPair> {
        KeyPair::from_pem(&self.ca_key_pem)
            .map_err(|e| PkiError::ParseError(format!("failed to load CA key: {}", e)))
    }

    /// Issue a TLS server certificate bound to the given IP addresses
    ///
    /// Returns `(cert_pem, key_pem)`.
    pub fn generate_server_cert(
        &self,
        common_name: &str,
        ip_addresses: &[IpAddr],
    ) -> Result<(String, String)> {
        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        dn.push(
            DnType::CommonName,
            DnValue::Utf8String(common_name.to_string()),
        );
        params.distinguished_name = dn;

        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![rcgen::ExtendedKeyUsagePurpose::ServerAuth];

        let (not_before, not_after) = compute_validity(SERVER_CERT_VALIDITY_DAYS);
        params.not_before = not_before;
        params.not_after = not_after;

        params.subject_alt_names = ip_addresses
            .iter()
            .map(|ip| SanType::IpAddress(*ip))
            .collect();

        let server_key = KeyPair::generate().map_err(|e| {
            PkiError::KeyGenerationFailed(format!("failed to generate server key: {}", e))
        })?;
        let server_key_pem = server_key.serialize_pem();

        let ca_key = self.load_key_pair()?;
        let issuer = Issuer::from_ca_cert_pem(&self.ca_cert_pem, &ca_key)
            .map_err(|e| PkiError::ParseError(format!("failed to create issuer: {}", e)))?;

        let server_cert = params.signed_by(&server_key, &issuer).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to sign server cert: {}", e))
        })?;

        Ok((server_cert.pem(), server_key_pem))
    }
}

/// Check that `cert_pem` was signed by `ca`
pub fn is_signed_by(cert_pem: &str, ca: &CertificateAuthority) -> Result<bool> {
    let cert_der = parse_pem(cert_pem)?;
    let ca_der = parse_pem(ca.ca_cert_pem())?;
    let (_, cert) = X509Certificate::from_der(&cert_der)
        .map_err(|e| PkiError::ParseError(format!("failed to parse certificate: {}", e)))?;
    let (_, ca_cert) = X509Certificate::from_der(&ca_der)
        .map_err(|e| PkiError::ParseError(format!("failed to parse CA certificate: {}", e)))?;
    Ok(cert.verify_signature(Some(ca_cert.public_key())).is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn ca_is_valid_for_two_years() {
        let ca = CertificateAuthority::new("ca-extension-registry-cache").unwrap();
        let info = ca.cert_info().unwrap();

        assert_eq!(info.common_name, "ca-extension-registry-cache");
        let days = info.lifetime_secs() / 86_400;
        assert!((729..=730).contains(&days), "lifetime was {days} days");
    }

    #[test]
    fn server_cert_is_bound_to_cluster_ip() {
        let ca = CertificateAuthority::new("test-ca").unwrap();
        let (cert, key) = ca
            .generate_server_cert("docker.io-tls", &[ip("10.4.246.205")])
            .unwrap();

        assert!(key.contains("BEGIN PRIVATE KEY"));
        let info = CertificateInfo::from_pem(&cert).unwrap();
        assert_eq!(info.common_name, "docker.io-tls");
        assert_eq!(info.ip_addresses, vec![ip("10.4.246.205")]);
        assert!((89..=90).contains(&(info.lifetime_secs() / 86_400)));
        assert!(is_signed_by(&cert, &ca).unwrap());
    }

    #[test]
    fn cert_from_other_ca_is_not_signed_by() {
        let ca1 = CertificateAuthority::new("one").unwrap();
        let ca2 = CertificateAuthority::new("two").unwrap();
        let (cert, _) = ca1.generate_server_cert("x", &[ip("10.0.0.1")]).unwrap();
        assert!(!is_signed_by(&cert, &ca2).unwrap());
    }

    #[test]
    fn ca_round_trips_through_pem() {
        let ca = CertificateAuthority::new("persisted").unwrap();
        let loaded = CertificateAuthority::from_pem(ca.ca_cert_pem(), ca.ca_key_pem()).unwrap();
        let (cert, _) = loaded.generate_server_cert("x", &[ip("10.0.0.2")]).unwrap();
        assert!(is_signed_by(&cert, &ca).unwrap());
    }

    #[test]
    fn rotation_threshold_is_eighty_percent() {
        let info = CertificateInfo {
            not_before: 0,
            not_after: 100,
            common_name: String::new(),
            ip_addresses: vec![],
        };
        assert!(!info.needs_rotation_at(79));
        assert!(info.needs_rotation_at(80));
        assert!(!info.is_expired_at(99));
        assert!(info.is_expired_at(100));
    }

    #[test]
    fn garbage_pem_is_a_parse_error() {
        assert!(matches!(
            CertificateInfo::from_pem("not a cert"),
            Err(PkiError::ParseError(_))
        ));
        assert!(CertificateAuthority::from_pem("x", "y").is_err());
    }
}
