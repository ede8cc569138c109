//! Certificate handling for Portico
//!
//! Sealing of private keys at rest, PEM/X.509 validation of uploaded pairs,
//! and certificate authorities: ACME via Let's Encrypt and a self-signed
//! authority for development.

pub mod acme;
pub mod authority;
pub mod challenge;
pub mod cipher;
pub mod pem;
pub mod self_signed;

pub use acme::{AcmeClient, AcmeConfig, AcmeError, LETSENCRYPT_PRODUCTION, LETSENCRYPT_STAGING};
pub use authority::{
    CertificateAuthority, ChallengeKind, ChallengeResponder, IssueRequest, IssuedBundle,
    PendingChallenge,
};
pub use challenge::Http01Webroot;
pub use cipher::{CipherError, Sealed, SecretCipher};
pub use pem::{parse_certificate, validate_pair, CertificateInfo, PemError};
pub use self_signed::{generate_for_domains, SelfSignedAuthority, SelfSignedCertificate};
