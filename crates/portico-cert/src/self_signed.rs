//! Self-signed certificate generation for development and testing
//!
//! [`SelfSignedAuthority`] stands in for an ACME CA when the control plane
//! runs without internet access.

use async_trait::async_trait;
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, SerialNumber};
use thiserror::Error;
use tracing::info;

use crate::acme::AcmeError;
use crate::authority::{CertificateAuthority, ChallengeResponder, IssueRequest, IssuedBundle};
use crate::pem::parse_certificate;

#[derive(Error, Debug)]
pub enum SelfSignedError {
    #[error("Certificate generation failed: {0}")]
    GenerationFailed(String),

    #[error("Key generation failed: {0}")]
    KeyGenerationFailed(String),
}

/// A self-signed certificate with its private key
pub struct SelfSignedCertificate {
    /// Certificate in PEM format
    pub pem_cert: String,

    /// PKCS#8 private key in PEM format
    pub pem_key: String,
}

/// Generate a self-signed certificate for `domains`, valid for `validity_days` from now
///
/// **DO NOT use in production** - the certificate is not trusted by any client.
pub fn generate_for_domains(
    domains: &[String],
    validity_days: i64,
) -> Result<SelfSignedCertificate, SelfSignedError> {
    let mut params = CertificateParams::new(domains.to_vec())
        .map_err(|e| SelfSignedError::GenerationFailed(e.to_string()))?;

    let mut dn = DistinguishedName::new();
    if let Some(first) = domains.first() {
        dn.push(DnType::CommonName, first.as_str());
    }
    dn.push(DnType::OrganizationName, "Portico Development CA");
    params.distinguished_name = dn;

    // Whole seconds, as X.509 stores them
    let now = time::OffsetDateTime::from_unix_timestamp(chrono::Utc::now().timestamp())
        .map_err(|e| SelfSignedError::GenerationFailed(e.to_string()))?;
    params.not_before = now;
    params.not_after = now + time::Duration::days(validity_days);

    params.serial_number = Some(SerialNumber::from(rand::random::<u64>()));

    let key_pair =
        KeyPair::generate().map_err(|e| SelfSignedError::KeyGenerationFailed(e.to_string()))?;

    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| SelfSignedError::GenerationFailed(e.to_string()))?;

    Ok(SelfSignedCertificate {
        pem_cert: cert.pem(),
        pem_key: key_pair.serialize_pem(),
    })
}

/// Issues self-signed certificates without any challenge
#[derive(Debug, Clone)]
pub struct SelfSignedAuthority {
    validity_days: i64,
}

impl SelfSignedAuthority {
    pub fn new(validity_days: i64) -> Self {
        Self { validity_days }
    }
}

impl Default for SelfSignedAuthority {
    fn default() -> Self {
        Self::new(90)
    }
}

#[async_trait]
impl CertificateAuthority for SelfSignedAuthority {
    fn name(&self) -> &str {
        "self-signed"
    }

    async fn issue(
        &self,
        request: &IssueRequest,
        _responder: &dyn ChallengeResponder,
    ) -> Result<IssuedBundle, AcmeError> {
        let generated = generate_for_domains(&[request.domain.clone()], self.validity_days)
            .map_err(|e| AcmeError::CertGen(e.to_string()))?;
        let info = parse_certificate(&generated.pem_cert)?;

        info!(domain = %request.domain, not_after = %info.not_after, "Issued self-signed certificate");

        Ok(IssuedBundle {
            issuer: Some(info.issuer),
            not_before: info.not_before,
            not_after: info.not_after,
            pem_cert: info.leaf_pem,
            pem_chain: info.chain_pem,
            key_pem: generated.pem_key,
        })
    }
}
