//! Validated certificate bundles

use std::net::{Ipv4Addr, Ipv6Addr};

use chrono::{DateTime, Utc};
use rcgen::KeyPair;
use sha2::{Digest, Sha256};
use x509_parser::extensions::GeneralName;
use x509_parser::pem::parse_x509_pem;
use x509_parser::prelude::{FromDer, X509Certificate};

use super::TlsError;

/// CA, certificate and key that passed validation together
#[derive(Clone, PartialEq, Eq)]
pub struct CertificateBundle {
    pub ca: String,
    pub server_cert: String,
    pub server_key: String,
    pub chain: Vec<String>,
    /// Subject alternative names of the certificate
    pub issued_for: Vec<String>,
}

impl std::fmt::Debug for CertificateBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateBundle")
            .field("issued_for", &self.issued_for)
            .field("chain", &self.chain.len())
            .finish_non_exhaustive()
    }
}

impl CertificateBundle {
    /// Check the material and build a bundle from it.
    ///
    /// The certificate must parse, be valid at `now`, carry the public key of
    /// `key_pem` and be signed by `ca_pem`.
    pub fn validate(
        ca_pem: &str,
        cert_pem: &str,
        key_pem: &str,
        chain: Vec<String>,
        now: DateTime<Utc>,
    ) -> Result<Self, TlsError> {
        let ca_der = pem_contents(ca_pem, "CA")?;
        let cert_der = pem_contents(cert_pem, "certificate")?;
        let ca = parse_certificate(&ca_der, "CA")?;
        let cert = parse_certificate(&cert_der, "certificate")?;

        let validity = cert.validity();
        let now_ts = now.timestamp();
        if now_ts < validity.not_before.timestamp() || now_ts > validity.not_after.timestamp() {
            return Err(TlsError::OutsideValidity {
                not_before: validity.not_before.to_string(),
                not_after: validity.not_after.to_string(),
            });
        }

        let key = KeyPair::from_pem(key_pem)
            .map_err(|e| TlsError::InvalidKey(e.to_string()))?;
        if cert.public_key().raw != key.public_key_der().as_slice() {
            return Err(TlsError::KeyMismatch);
        }

        cert.verify_signature(Some(ca.public_key()))
            .map_err(|e| TlsError::UntrustedCertificate(e.to_string()))?;

        Ok(Self {
            ca: ca_pem.trim().to_string(),
            server_cert: cert_pem.trim().to_string(),
            server_key: key_pem.trim().to_string(),
            chain,
            issued_for: subject_alt_names(&cert),
        })
    }

    /// SHA-256 over CA, certificate and key, hex encoded
    pub fn digest(&self) -> String {
        digest_of(&self.ca, &self.server_cert, &self.server_key)
    }
}

/// Digest of installed material, comparable with [`CertificateBundle::digest`]
pub fn digest_of(ca: &str, cert: &str, key: &str) -> String {
    let mut hasher = Sha256::new();
    for part in [ca, cert, key] {
        hasher.update(part.trim().as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

fn pem_contents(pem: &str, what: &str) -> Result<Vec<u8>, TlsError> {
    let (_, parsed) = parse_x509_pem(pem.as_bytes())
        .map_err(|e| TlsError::InvalidCertificate(format!("{} is not PEM: {}", what, e)))?;
    Ok(parsed.contents)
}

fn parse_certificate<'a>(der: &'a [u8], what: &str) -> Result<X509Certificate<'a>, TlsError> {
    X509Certificate::from_der(der)
        .map(|(_, cert)| cert)
        .map_err(|e| TlsError::InvalidCertificate(format!("{} does not parse: {}", what, e)))
}

fn subject_alt_names(cert: &X509Certificate<'_>) -> Vec<String> {
    let Ok(Some(san)) = cert.subject_alternative_name() else {
        return Vec::new();
    };
    san.value
        .general_names
        .iter()
        .filter_map(|name| match name {
            GeneralName::DNSName(dns) => Some(dns.to_string()),
            GeneralName::IPAddress(bytes) => match bytes.len() {
                4 => <[u8; 4]>::try_from(*bytes)
                    .ok()
                    .map(|b| Ipv4Addr::from(b).to_string()),
                16 => <[u8; 16]>::try_from(*bytes)
                    .ok()
                    .map(|b| Ipv6Addr::from(b).to_string()),
                _ => None,
            },
            _ => None,
        })
        .collect()
}
