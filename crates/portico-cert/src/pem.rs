//! PEM and X.509 inspection
//!
//! Splits certificate chains, extracts validity and names, checks that a
//! private key belongs to a certificate and that a certificate covers a host.

use chrono::{DateTime, Utc};
use ring::rand::SystemRandom;
use ring::signature::{
    EcdsaKeyPair, Ed25519KeyPair, KeyPair, RsaKeyPair, ECDSA_P256_SHA256_ASN1_SIGNING,
    ECDSA_P384_SHA384_ASN1_SIGNING,
};
use rustls_pemfile::Item;
use thiserror::Error;
use x509_parser::extensions::GeneralName;
use x509_parser::prelude::{FromDer, X509Certificate};

const BEGIN_CERT: &str = "-----BEGIN CERTIFICATE-----";
const END_CERT: &str = "-----END CERTIFICATE-----";

#[derive(Debug, Error)]
pub enum PemError {
    #[error("no certificate found in PEM input")]
    NoCertificate,

    #[error("no private key found in PEM input")]
    NoPrivateKey,

    #[error("failed to parse PEM: {0}")]
    Parse(String),

    #[error("failed to parse certificate: {0}")]
    X509(String),

    #[error("unsupported private key format: {0}")]
    UnsupportedKey(String),

    #[error("private key does not match the certificate")]
    KeyMismatch,

    #[error("certificate expired at {0}")]
    Expired(DateTime<Utc>),

    #[error("certificate not valid before {0}")]
    NotYetValid(DateTime<Utc>),

    #[error("certificate does not cover {domain} (names: {names})")]
    NameMismatch { domain: String, names: String },
}

/// Facts extracted from a leaf certificate
#[derive(Debug, Clone)]
pub struct CertificateInfo {
    pub subject: String,
    pub issuer: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    /// DNS names from the SAN extension, or the common name when there is none
    pub dns_names: Vec<String>,
    /// Leaf certificate block
    pub leaf_pem: String,
    /// Remaining blocks (intermediates), possibly empty
    pub chain_pem: String,
}

impl CertificateInfo {
    pub fn covers(&self, domain: &str) -> bool {
        let domain = domain.trim_end_matches('.').to_ascii_lowercase();
        self.dns_names.iter().any(|name| name_matches(name, &domain))
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.not_after
    }
}

/// Split PEM text into its `CERTIFICATE` blocks, in order
pub fn certificate_blocks(pem: &str) -> Vec<String> {
    let mut blocks = Vec::new();
    let mut rest = pem;
    while let Some(start) = rest.find(BEGIN_CERT) {
        let Some(end) = rest[start..].find(END_CERT) else {
            break;
        };
        let end = start + end + END_CERT.len();
        blocks.push(format!("{}\n", &rest[start..end]));
        rest = &rest[end..];
    }
    blocks
}

/// Parse a certificate (optionally followed by its chain)
pub fn parse_certificate(pem: &str) -> Result<CertificateInfo, PemError> {
    let blocks = certificate_blocks(pem);
    let leaf_pem = blocks.first().cloned().ok_or(PemError::NoCertificate)?;
    let chain_pem = blocks[1..].concat();

    let der = first_certificate_der(&leaf_pem)?;
    let (_, cert) =
        X509Certificate::from_der(&der).map_err(|e| PemError::X509(e.to_string()))?;

    Ok(CertificateInfo {
        subject: cert.subject().to_string(),
        issuer: cert.issuer().to_string(),
        not_before: to_utc(cert.validity().not_before.timestamp())?,
        not_after: to_utc(cert.validity().not_after.timestamp())?,
        dns_names: dns_names(&cert),
        leaf_pem,
        chain_pem,
    })
}

/// Check an operator-supplied certificate and key before it is stored.
///
/// The key must belong to the leaf, the leaf must be currently valid and it
/// must cover `domain` (wildcard names included).
pub fn validate_pair(
    cert_pem: &str,
    key_pem: &str,
    domain: &str,
    now: DateTime<Utc>,
) -> Result<CertificateInfo, PemError> {
    let info = parse_certificate(cert_pem)?;

    if info.is_expired_at(now) {
        return Err(PemError::Expired(info.not_after));
    }
    if now < info.not_before {
        return Err(PemError::NotYetValid(info.not_before));
    }

    ensure_key_matches(&info.leaf_pem, key_pem)?;

    if !info.covers(domain) {
        return Err(PemError::NameMismatch {
            domain: domain.to_string(),
            names: info.dns_names.join(", "),
        });
    }

    Ok(info)
}

/// Verify that `key_pem` is the private key of the certificate in `cert_pem`
pub fn ensure_key_matches(cert_pem: &str, key_pem: &str) -> Result<(), PemError> {
    let der = first_certificate_der(cert_pem)?;
    let (_, cert) =
        X509Certificate::from_der(&der).map_err(|e| PemError::X509(e.to_string()))?;
    let cert_public: &[u8] = &cert.tbs_certificate.subject_pki.subject_public_key.data;

    let key_public = public_key_of(key_pem)?;
    if key_public.as_slice() != cert_public {
        return Err(PemError::KeyMismatch);
    }
    Ok(())
}

/// Derive the raw public key bytes of a PEM private key
fn public_key_of(key_pem: &str) -> Result<Vec<u8>, PemError> {
    let mut reader = key_pem.as_bytes();
    let key = loop {
        match rustls_pemfile::read_one(&mut reader).map_err(|e| PemError::Parse(e.to_string()))? {
            Some(Item::Pkcs1Key(k)) => break Key::Pkcs1(k.secret_pkcs1_der().to_vec()),
            Some(Item::Pkcs8Key(k)) => break Key::Pkcs8(k.secret_pkcs8_der().to_vec()),
            Some(Item::Sec1Key(_)) => {
                return Err(PemError::UnsupportedKey(
                    "SEC1 EC keys must be converted to PKCS#8".to_string(),
                ))
            }
            Some(_) => continue,
            None => return Err(PemError::NoPrivateKey),
        }
    };

    match key {
        Key::Pkcs1(der) => RsaKeyPair::from_der(&der)
            .map(|k| k.public_key().as_ref().to_vec())
            .map_err(|e| PemError::UnsupportedKey(e.to_string())),
        Key::Pkcs8(der) => {
            if let Ok(k) = RsaKeyPair::from_pkcs8(&der) {
                return Ok(k.public_key().as_ref().to_vec());
            }
            let rng = SystemRandom::new();
            for alg in [
                &ECDSA_P256_SHA256_ASN1_SIGNING,
                &ECDSA_P384_SHA384_ASN1_SIGNING,
            ] {
                if let Ok(k) = EcdsaKeyPair::from_pkcs8(alg, &der, &rng) {
                    return Ok(k.public_key().as_ref().to_vec());
                }
            }
            Ed25519KeyPair::from_pkcs8_maybe_unchecked(&der)
                .map(|k| k.public_key().as_ref().to_vec())
                .map_err(|_| {
                    PemError::UnsupportedKey("PKCS#8 key is not RSA, P-256, P-384 or Ed25519".to_string())
                })
        }
    }
}

enum Key {
    Pkcs1(Vec<u8>),
    Pkcs8(Vec<u8>),
}

fn first_certificate_der(pem: &str) -> Result<Vec<u8>, PemError> {
    let mut reader = pem.as_bytes();
    let cert = rustls_pemfile::certs(&mut reader)
        .next()
        .ok_or(PemError::NoCertificate)?
        .map_err(|e| PemError::Parse(e.to_string()))?;
    Ok(cert.as_ref().to_vec())
}

fn dns_names(cert: &X509Certificate<'_>) -> Vec<String> {
    let mut names: Vec<String> = match cert.subject_alternative_name() {
        Ok(Some(san)) => san
            .value
            .general_names
            .iter()
            .filter_map(|name| match name {
                GeneralName::DNSName(dns) => Some(dns.to_ascii_lowercase()),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    };

    if names.is_empty() {
        if let Some(cn) = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
        {
            names.push(cn.to_ascii_lowercase());
        }
    }
    names
}

/// Hostname match with single-label wildcards (`*.example.com`)
fn name_matches(pattern: &str, domain: &str) -> bool {
    let pattern = pattern.trim_end_matches('.').to_ascii_lowercase();
    match pattern.strip_prefix("*.") {
        Some(suffix) => domain
            .split_once('.')
            .is_some_and(|(label, rest)| !label.is_empty() && rest == suffix),
        None => pattern == domain,
    }
}

fn to_utc(timestamp: i64) -> Result<DateTime<Utc>, PemError> {
    DateTime::from_timestamp(timestamp, 0)
        .ok_or_else(|| PemError::X509(format!("timestamp out of range: {timestamp}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::self_signed::generate_for_domains;
    use chrono::Duration;

    #[test]
    fn test_parse_self_signed() {
        let cert = generate_for_domains(&["app.example.com".to_string()], 90).unwrap();
        let info = parse_certificate(&cert.pem_cert).unwrap();

        assert_eq!(info.dns_names, vec!["app.example.com"]);
        assert!(info.chain_pem.is_empty());
        let lifetime = info.not_after - info.not_before;
        assert_eq!(lifetime.num_days(), 90);
    }

    #[test]
    fn test_chain_is_split() {
        let leaf = generate_for_domains(&["a.example.com".to_string()], 30).unwrap();
        let other = generate_for_domains(&["ca.example.com".to_string()], 30).unwrap();
        let full = format!("{}{}", leaf.pem_cert, other.pem_cert);

        let info = parse_certificate(&full).unwrap();
        assert_eq!(info.dns_names, vec!["a.example.com"]);
        assert_eq!(certificate_blocks(&info.chain_pem).len(), 1);
        assert!(info.leaf_pem.starts_with(BEGIN_CERT));
    }

    #[test]
    fn test_key_match_and_mismatch() {
        let a = generate_for_domains(&["a.example.com".to_string()], 30).unwrap();
        let b = generate_for_domains(&["a.example.com".to_string()], 30).unwrap();

        assert!(ensure_key_matches(&a.pem_cert, &a.pem_key).is_ok());
        assert!(matches!(
            ensure_key_matches(&a.pem_cert, &b.pem_key),
            Err(PemError::KeyMismatch)
        ));
    }

    #[test]
    fn test_validate_pair() {
        let cert = generate_for_domains(&["*.example.com".to_string()], 30).unwrap();
        let now = Utc::now();

        assert!(validate_pair(&cert.pem_cert, &cert.pem_key, "shop.example.com", now).is_ok());
        assert!(matches!(
            validate_pair(&cert.pem_cert, &cert.pem_key, "example.com", now),
            Err(PemError::NameMismatch { .. })
        ));
        assert!(matches!(
            validate_pair(&cert.pem_cert, &cert.pem_key, "a.b.example.com", now),
            Err(PemError::NameMismatch { .. })
        ));
        assert!(matches!(
            validate_pair(
                &cert.pem_cert,
                &cert.pem_key,
                "shop.example.com",
                now + Duration::days(31)
            ),
            Err(PemError::Expired(_))
        ));
    }

    #[test]
    fn test_garbage_input() {
        assert!(matches!(
            parse_certificate("not a certificate"),
            Err(PemError::NoCertificate)
        ));
        let cert = generate_for_domains(&["a.example.com".to_string()], 30).unwrap();
        assert!(matches!(
            ensure_key_matches(&cert.pem_cert, "nothing here"),
            Err(PemError::NoPrivateKey)
        ));
    }

    #[test]
    fn test_name_matches() {
        assert!(name_matches("example.com", "example.com"));
        assert!(name_matches("EXAMPLE.com.", "example.com"));
        assert!(name_matches("*.example.com", "www.example.com"));
        assert!(!name_matches("*.example.com", "example.com"));
        assert!(!name_matches("*.example.com", "a.b.example.com"));
    }
}
