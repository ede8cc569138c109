//! Certificate authority abstraction
//!
//! The lifecycle manager only sees [`CertificateAuthority`]; challenge
//! publication is delegated back to the caller through [`ChallengeResponder`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::acme::AcmeError;

/// How control of the domain is proven to the CA
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeKind {
    /// File served under `/.well-known/acme-challenge/<token>`
    Http01,
    /// TXT record at `_acme-challenge.<domain>`
    Dns01,
}

impl ChallengeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChallengeKind::Http01 => "http-01",
            ChallengeKind::Dns01 => "dns-01",
        }
    }
}

/// A challenge that must be visible before the CA is told to validate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingChallenge {
    Http01 {
        domain: String,
        token: String,
        key_authorization: String,
    },
    Dns01 {
        domain: String,
        /// Fully qualified record name, e.g. `_acme-challenge.example.com`
        record_name: String,
        /// Base64url SHA-256 digest of the key authorization
        value: String,
    },
}

impl PendingChallenge {
    pub fn domain(&self) -> &str {
        match self {
            PendingChallenge::Http01 { domain, .. } | PendingChallenge::Dns01 { domain, .. } => {
                domain
            }
        }
    }
}

/// Publishes and withdraws challenge responses
#[async_trait]
pub trait ChallengeResponder: Send + Sync {
    async fn present(&self, challenge: &PendingChallenge) -> Result<(), AcmeError>;

    /// Best effort; failures are logged by the caller and never fail issuance
    async fn cleanup(&self, challenge: &PendingChallenge) -> Result<(), AcmeError>;
}

/// What the lifecycle manager asks for
#[derive(Debug, Clone)]
pub struct IssueRequest {
    pub domain: String,
    pub challenge: ChallengeKind,
}

/// A freshly issued certificate with its plaintext key
#[derive(Clone)]
pub struct IssuedBundle {
    pub issuer: Option<String>,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub pem_cert: String,
    pub pem_chain: String,
    pub key_pem: String,
}

impl std::fmt::Debug for IssuedBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedBundle")
            .field("issuer", &self.issuer)
            .field("not_before", &self.not_before)
            .field("not_after", &self.not_after)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait CertificateAuthority: Send + Sync {
    /// Short name used in logs and audit events
    fn name(&self) -> &str;

    async fn issue(
        &self,
        request: &IssueRequest,
        responder: &dyn ChallengeResponder,
    ) -> Result<IssuedBundle, AcmeError>;
}
