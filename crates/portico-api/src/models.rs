use chrono::{DateTime, Utc};
use portico_db::entities::certificate::{self, CertificateStatus, CertificateType};
use portico_db::entities::dns_provider::{self, DnsProviderKind};
use portico_db::entities::domain::{self, DomainStatus, VerificationMethod};
use portico_db::entities::domain_verification::{self, VerificationStatus};
use portico_db::entities::route;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Request to register a custom domain
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CreateDomainRequest {
    /// Fully qualified domain name
    pub name: String,
    /// How ownership is proven: `A`, `CNAME` or `TXT`
    #[schema(value_type = String, example = "TXT")]
    pub verification_method: VerificationMethod,
    /// DNS provider managing the zone
    #[serde(default)]
    pub provider_id: Option<String>,
    /// Provider zone id; looked up by name when omitted
    #[serde(default)]
    pub zone_id: Option<String>,
    /// Create verification and challenge records through the provider
    #[serde(default)]
    pub auto_manage: bool,
}

/// Ownership verification state of a domain
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Verification {
    #[schema(value_type = String, example = "TXT")]
    pub method: VerificationMethod,
    /// Value the DNS record must carry
    pub challenge: String,
    #[schema(value_type = String, example = "pending")]
    pub status: VerificationStatus,
    pub attempts: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_checked_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Record created through the DNS provider
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_record_id: Option<String>,
    /// What to create by hand when the provider could not
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

impl From<domain_verification::Model> for Verification {
    fn from(v: domain_verification::Model) -> Self {
        Self {
            method: v.method,
            challenge: v.challenge,
            status: v.status,
            attempts: v.attempts,
            last_checked_at: v.last_checked_at,
            last_error: v.last_error,
            provider_record_id: v.provider_record_id,
            instructions: v.instructions,
        }
    }
}

/// Custom domain
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Domain {
    pub id: String,
    pub name: String,
    /// `pending`, `verifying`, `verified`, `active` or `error`
    #[schema(value_type = String, example = "pending")]
    pub status: DomainStatus,
    #[schema(value_type = String, example = "TXT")]
    pub verification_method: VerificationMethod,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zone_id: Option<String>,
    pub auto_manage: bool,
    /// Certificate currently served
    #[serde(skip_serializing_if = "Option::is_none")]
    pub certificate_id: Option<String>,
    pub consecutive_failures: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_check_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification: Option<Verification>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Domain {
    pub fn new(d: domain::Model, verification: Option<domain_verification::Model>) -> Self {
        Self {
            id: d.id,
            name: d.name,
            status: d.status,
            verification_method: d.verification_method,
            provider_id: d.provider_id,
            zone_id: d.zone_id,
            auto_manage: d.auto_manage,
            certificate_id: d.certificate_id,
            consecutive_failures: d.consecutive_failures,
            next_check_at: d.next_check_at,
            error_reason: d.error_reason,
            verification: verification.map(Verification::from),
            created_at: d.created_at,
            updated_at: d.updated_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct DomainList {
    pub domains: Vec<Domain>,
    pub total: usize,
}

/// Result of a manual verification check
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct VerifyResponse {
    /// `verified`, `retrying`, `gave_up` or `skipped`
    pub outcome: String,
    pub domain: Domain,
}

/// Request to upload an operator-supplied certificate
#[derive(Clone, Serialize, Deserialize, ToSchema)]
pub struct UploadCertificateRequest {
    pub domain_id: String,
    /// Leaf certificate followed by any intermediates (PEM)
    pub certificate_pem: String,
    /// Private key matching the leaf (PEM)
    pub private_key_pem: String,
    #[serde(default)]
    pub auto_renew: bool,
}

impl std::fmt::Debug for UploadCertificateRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadCertificateRequest")
            .field("domain_id", &self.domain_id)
            .field("auto_renew", &self.auto_renew)
            .finish_non_exhaustive()
    }
}

/// Certificate metadata; key material is never returned
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Certificate {
    pub id: String,
    pub domain_id: String,
    pub domain: String,
    /// `acme` or `uploaded`
    #[serde(rename = "type")]
    #[schema(value_type = String, example = "acme")]
    pub cert_type: CertificateType,
    /// `pending`, `active`, `expired` or `failed`
    #[schema(value_type = String, example = "active")]
    pub status: CertificateStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issuer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub not_before: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub not_after: Option<DateTime<Utc>>,
    /// When renewal starts, for active certificates
    #[serde(skip_serializing_if = "Option::is_none")]
    pub renewal_due_at: Option<DateTime<Utc>>,
    pub auto_renew: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub renewal_of: Option<String>,
    pub attempts: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Certificate {
    pub fn new(c: certificate::Model, renewal_due_at: Option<DateTime<Utc>>) -> Self {
        Self {
            id: c.id,
            domain_id: c.domain_id,
            domain: c.domain,
            cert_type: c.cert_type,
            status: c.status,
            issuer: c.issuer,
            not_before: c.not_before,
            not_after: c.not_after,
            renewal_due_at,
            auto_renew: c.auto_renew,
            renewal_of: c.renewal_of,
            attempts: c.attempts,
            last_error: c.last_error,
            next_attempt_at: c.next_attempt_at,
            created_at: c.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CertificateList {
    pub certificates: Vec<Certificate>,
    pub total: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, utoipa::IntoParams)]
#[into_params(parameter_in = Query)]
pub struct DomainFilter {
    /// Only entries for this domain
    pub domain_id: Option<String>,
}

/// Request to attach a service route to an active domain
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AttachRouteRequest {
    pub domain_id: String,
    pub service_id: String,
    #[serde(default = "default_path")]
    pub path: String,
    pub port: u16,
    /// Serve over HTTPS, redirecting plain HTTP
    #[serde(default = "default_tls")]
    pub tls: bool,
}

fn default_path() -> String {
    "/".to_string()
}

fn default_tls() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Route {
    pub id: String,
    pub service_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain_id: Option<String>,
    pub path: String,
    pub port: i32,
    pub tls: bool,
    pub created_at: DateTime<Utc>,
}

impl From<route::Model> for Route {
    fn from(r: route::Model) -> Self {
        Self {
            id: r.id,
            service_id: r.service_id,
            domain_id: r.domain_id,
            path: r.path,
            port: r.port,
            tls: r.tls,
            created_at: r.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RouteList {
    pub routes: Vec<Route>,
    pub total: usize,
}

/// Request to register a DNS provider
#[derive(Clone, Serialize, Deserialize, ToSchema)]
pub struct CreateProviderRequest {
    pub name: String,
    /// `cloudflare`, `hetzner` or `manual`
    #[serde(rename = "type")]
    #[schema(value_type = String, example = "cloudflare")]
    pub kind: DnsProviderKind,
    /// API token; stored encrypted and never returned
    #[serde(default)]
    pub api_token: Option<String>,
}

impl std::fmt::Debug for CreateProviderRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CreateProviderRequest")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct UpdateProviderRequest {
    pub active: bool,
}

/// DNS provider; credentials are never part of the view
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Provider {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    #[schema(value_type = String, example = "cloudflare")]
    pub kind: DnsProviderKind,
    pub active: bool,
    /// Whether an API token is stored
    pub has_credentials: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<dns_provider::Model> for Provider {
    fn from(p: dns_provider::Model) -> Self {
        Self {
            id: p.id,
            name: p.name,
            kind: p.kind,
            active: p.active,
            has_credentials: p.encrypted_api_token.is_some(),
            created_at: p.created_at,
            updated_at: p.updated_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ProviderList {
    pub providers: Vec<Provider>,
    pub total: usize,
}

/// Domain left out of the proxy configuration
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ExcludedDomain {
    pub name: String,
    pub reason: String,
}

/// State of the reverse proxy as last reconciled
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ProxyStatus {
    /// `idle`, `computing`, `validating` or `applying`
    pub phase: String,
    /// Hash of the configuration in effect
    #[serde(skip_serializing_if = "Option::is_none")]
    pub applied_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub applied_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_cycle_at: Option<DateTime<Utc>>,
    /// Reconciliation cycles completed since startup
    pub cycles: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub excluded: Vec<ExcludedDomain>,
}

impl From<portico_control::ProxyStatus> for ProxyStatus {
    fn from(s: portico_control::ProxyStatus) -> Self {
        Self {
            phase: s.phase.as_str().to_string(),
            applied_hash: s.applied_hash,
            applied_at: s.applied_at,
            last_cycle_at: s.last_cycle_at,
            cycles: s.cycles,
            last_error: s.last_error,
            excluded: s
                .excluded
                .into_iter()
                .map(|e| ExcludedDomain {
                    name: e.name,
                    reason: e.reason,
                })
                .collect(),
        }
    }
}

/// Configuration the current state renders to
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ConfigReport {
    pub hash: String,
    /// Whether the proxy's own checker accepted it
    pub valid: bool,
    /// Checker output when rejected
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub excluded: Vec<ExcludedDomain>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ReloadResponse {
    /// Hash of the applied configuration
    pub hash: String,
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Error response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    /// Error message
    pub error: String,
    /// Error code
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}
