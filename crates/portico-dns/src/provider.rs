//! Shared DNS provider types
//!
//! Records, provisioning outcomes and the error type used by every backend.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Result type for DNS operations
pub type DnsResult<T> = Result<T, DnsProviderError>;

/// Errors that can occur during DNS provider operations
#[derive(Debug, Error)]
pub enum DnsProviderError {
    /// Authentication failed with the DNS provider
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Zone not found for the domain
    #[error("Zone not found for domain '{domain}'")]
    ZoneNotFound { domain: String },

    /// Record creation failed
    #[error("Failed to create {kind} record for '{record_name}': {message}")]
    RecordCreation {
        kind: &'static str,
        record_name: String,
        message: String,
    },

    /// Record deletion failed
    #[error("Failed to delete record '{record_id}': {message}")]
    RecordDeletion { record_id: String, message: String },

    /// API request failed
    #[error("API request failed: {0}")]
    ApiRequest(String),

    /// Rate limited by provider
    #[error("Rate limited by DNS provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// Request timeout
    #[error("Request timed out after {elapsed_secs}s")]
    Timeout { elapsed_secs: u64 },

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// DNS lookup failed (resolver error, not a missing record)
    #[error("DNS lookup failed for '{name}': {message}")]
    Lookup { name: String, message: String },
}

impl DnsProviderError {
    /// Whether retrying later may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DnsProviderError::RateLimited { .. }
                | DnsProviderError::Timeout { .. }
                | DnsProviderError::ApiRequest(_)
                | DnsProviderError::Lookup { .. }
        )
    }

    /// Server-requested delay before the next attempt, if any
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            DnsProviderError::RateLimited { retry_after_secs } => {
                Some(Duration::from_secs(*retry_after_secs))
            }
            _ => None,
        }
    }
}

/// ACME challenge record name prefix
pub const ACME_CHALLENGE_RECORD: &str = "_acme-challenge";

/// Recommended TTL for challenge records (60 seconds)
pub const CHALLENGE_TTL: u32 = 60;

/// Record types the control plane manages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    A,
    Cname,
    Txt,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::A => "A",
            RecordKind::Cname => "CNAME",
            RecordKind::Txt => "TXT",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A record to create at the provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsRecord {
    pub kind: RecordKind,
    /// Fully qualified name without trailing dot
    pub name: String,
    pub value: String,
    pub ttl: u32,
}

impl DnsRecord {
    pub fn new(kind: RecordKind, name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            kind,
            name: normalize_name(&name.into()),
            value: value.into(),
            ttl: CHALLENGE_TTL,
        }
    }

    /// TXT record answering a DNS-01 challenge for `domain`
    pub fn acme_challenge(domain: &str, value: impl Into<String>) -> Self {
        Self::new(RecordKind::Txt, challenge_record_fqdn(domain), value)
    }

    /// Human-readable instructions for creating the record by hand
    pub fn instructions(&self) -> String {
        format!(
            "Create a {} record named {} with value \"{}\" (TTL {})",
            self.kind, self.name, self.value, self.ttl
        )
    }
}

/// Outcome of asking a provider to create a record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Provisioned {
    /// Created through the provider API; keep the id for cleanup
    Created { record_id: String },
    /// The operator has to create the record
    Manual { instructions: String },
}

/// Strip a wildcard prefix and trailing dot, lowercase
pub fn normalize_name(name: &str) -> String {
    name.trim_end_matches('.')
        .strip_prefix("*.")
        .unwrap_or_else(|| name.trim_end_matches('.'))
        .to_ascii_lowercase()
}

/// Build the full ACME challenge record name
///
/// For `example.com` and `*.example.com`, returns `_acme-challenge.example.com`
pub fn challenge_record_fqdn(domain: &str) -> String {
    format!("{}.{}", ACME_CHALLENGE_RECORD, normalize_name(domain))
}

/// Candidate zone names for `name`, most specific first
///
/// `a.b.example.com` yields `a.b.example.com`, `b.example.com`, `example.com`.
pub fn zone_candidates(name: &str) -> Vec<String> {
    let name = normalize_name(name);
    let mut candidates = Vec::new();
    let mut current = name.as_str();
    loop {
        if current.contains('.') {
            candidates.push(current.to_string());
        }
        match current.split_once('.') {
            Some((_, parent)) => current = parent,
            None => break,
        }
    }
    candidates
}

/// Record name relative to its zone (`@` for the apex)
pub fn record_name_for_zone(fqdn: &str, zone_name: &str) -> String {
    if fqdn == zone_name {
        "@".to_string()
    } else if let Some(stripped) = fqdn.strip_suffix(&format!(".{}", zone_name)) {
        stripped.to_string()
    } else {
        fqdn.to_string()
    }
}

/// Map an HTTP failure status to a provider error
pub(crate) fn status_error(
    status: reqwest::StatusCode,
    retry_after: Option<u64>,
    context: &str,
    body: String,
) -> DnsProviderError {
    match status {
        reqwest::StatusCode::UNAUTHORIZED | reqwest::StatusCode::FORBIDDEN => {
            DnsProviderError::Authentication(format!("{context}: HTTP {status}"))
        }
        reqwest::StatusCode::TOO_MANY_REQUESTS => DnsProviderError::RateLimited {
            retry_after_secs: retry_after.unwrap_or(60),
        },
        _ => DnsProviderError::ApiRequest(format!("{context}: HTTP {status} - {body}")),
    }
}

/// Seconds from a `Retry-After` header
pub(crate) fn retry_after_secs(response: &reqwest::Response) -> Option<u64> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

pub(crate) fn request_error(err: reqwest::Error, timeout: Duration, context: &str) -> DnsProviderError {
    if err.is_timeout() {
        DnsProviderError::Timeout {
            elapsed_secs: timeout.as_secs(),
        }
    } else {
        DnsProviderError::ApiRequest(format!("{context}: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_name() {
        assert_eq!(normalize_name("example.com"), "example.com");
        assert_eq!(normalize_name("*.example.com"), "example.com");
        assert_eq!(normalize_name("Sub.Example.com."), "sub.example.com");
    }

    #[test]
    fn test_challenge_record_fqdn() {
        assert_eq!(
            challenge_record_fqdn("example.com"),
            "_acme-challenge.example.com"
        );
        assert_eq!(
            challenge_record_fqdn("*.example.com"),
            "_acme-challenge.example.com"
        );
        assert_eq!(
            challenge_record_fqdn("sub.example.com"),
            "_acme-challenge.sub.example.com"
        );
    }

    #[test]
    fn test_zone_candidates() {
        assert_eq!(
            zone_candidates("_acme-challenge.shop.example.com"),
            vec![
                "_acme-challenge.shop.example.com",
                "shop.example.com",
                "example.com"
            ]
        );
        assert!(zone_candidates("localhost").is_empty());
    }

    #[test]
    fn test_record_name_for_zone() {
        assert_eq!(record_name_for_zone("example.com", "example.com"), "@");
        assert_eq!(
            record_name_for_zone("_acme-challenge.shop.example.com", "example.com"),
            "_acme-challenge.shop"
        );
        assert_eq!(record_name_for_zone("other.org", "example.com"), "other.org");
    }

    #[test]
    fn test_instructions_name_the_record() {
        let record = DnsRecord::new(
            RecordKind::Txt,
            "shop.example.com.",
            "portico-verification=abc",
        );
        let text = record.instructions();
        assert!(text.contains("TXT"));
        assert!(text.contains("shop.example.com"));
        assert!(text.contains("portico-verification=abc"));
    }

    #[test]
    fn test_status_error_mapping() {
        assert!(matches!(
            status_error(reqwest::StatusCode::TOO_MANY_REQUESTS, Some(30), "x", String::new()),
            DnsProviderError::RateLimited { retry_after_secs: 30 }
        ));
        assert!(matches!(
            status_error(reqwest::StatusCode::UNAUTHORIZED, None, "x", String::new()),
            DnsProviderError::Authentication(_)
        ));
        let err = status_error(reqwest::StatusCode::BAD_GATEWAY, None, "x", "oops".to_string());
        assert!(err.is_transient());
        assert!(!DnsProviderError::Authentication("bad".to_string()).is_transient());
    }
}
