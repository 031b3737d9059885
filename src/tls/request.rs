//! Certificate signing requests for a unit

use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, SanType};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::TlsError;

/// Key and CSR waiting for the certificate authority
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingRequest {
    pub csr_pem: String,
    pub key_pem: String,
}

impl std::fmt::Debug for PendingRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRequest")
            .field("csr_pem", &self.csr_pem)
            .finish_non_exhaustive()
    }
}

impl PendingRequest {
    /// Whether `csr` is this request, ignoring surrounding whitespace
    pub fn matches(&self, csr: &str) -> bool {
        self.csr_pem.trim() == csr.trim()
    }
}

/// Generate a key pair and a CSR for `common_name` and its SANs.
///
/// IP addresses become IP SANs, everything else a DNS name.
pub fn generate_request(common_name: &str, sans: &[String]) -> Result<PendingRequest, TlsError> {
    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    params.distinguished_name = dn;

    for san in sans {
        if let Ok(ip) = san.parse::<std::net::IpAddr>() {
            params.subject_alt_names.push(SanType::IpAddress(ip));
        } else {
            params
                .subject_alt_names
                .push(SanType::DnsName(san.clone().try_into()?));
        }
    }

    let key_pair = KeyPair::generate()?;
    let csr = params.serialize_request(&key_pair)?;
    info!(common_name, sans = sans.len(), "Generated certificate signing request");

    Ok(PendingRequest {
        csr_pem: csr.pem()?,
        key_pem: key_pair.serialize_pem(),
    })
}
