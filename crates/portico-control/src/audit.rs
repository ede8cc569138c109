//! Audit event sink

use chrono::{DateTime, Utc};
use tracing::info;

/// Structured events emitted on state changes that operators care about
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuditEvent {
    DomainCreated {
        domain: String,
    },
    DomainVerified {
        domain: String,
        /// `verified`, or `active` when a certificate was already uploaded
        status: &'static str,
    },
    VerificationFailed {
        domain: String,
        failures: i32,
        reason: String,
    },
    DomainDeleted {
        domain: String,
    },
    CertificateIssued {
        domain: String,
        certificate_id: String,
        not_after: DateTime<Utc>,
    },
    CertificateRenewed {
        domain: String,
        certificate_id: String,
        not_after: DateTime<Utc>,
    },
    CertificateUploaded {
        domain: String,
        certificate_id: String,
        not_after: DateTime<Utc>,
    },
    CertificateFailed {
        domain: String,
        certificate_id: String,
        error: String,
    },
    CertificateExpired {
        domain: String,
        certificate_id: String,
    },
    CertificateRolledBack {
        domain: String,
        certificate_id: String,
    },
    ConfigApplied {
        hash: String,
    },
    ConfigRejected {
        reason: String,
    },
}

impl AuditEvent {
    pub fn name(&self) -> &'static str {
        match self {
            AuditEvent::DomainCreated { .. } => "domain.created",
            AuditEvent::DomainVerified { .. } => "domain.verified",
            AuditEvent::VerificationFailed { .. } => "domain.verification_failed",
            AuditEvent::DomainDeleted { .. } => "domain.deleted",
            AuditEvent::CertificateIssued { .. } => "certificate.issued",
            AuditEvent::CertificateRenewed { .. } => "certificate.renewed",
            AuditEvent::CertificateUploaded { .. } => "certificate.uploaded",
            AuditEvent::CertificateFailed { .. } => "certificate.failed",
            AuditEvent::CertificateExpired { .. } => "certificate.expired",
            AuditEvent::CertificateRolledBack { .. } => "certificate.rolled_back",
            AuditEvent::ConfigApplied { .. } => "config.applied",
            AuditEvent::ConfigRejected { .. } => "config.rejected",
        }
    }
}

/// Receives audit events; storage is up to the implementation
pub trait AuditLogger: Send + Sync {
    fn record(&self, event: AuditEvent);
}

/// Emits audit events as `tracing` events on the `portico::audit` target
#[derive(Debug, Default, Clone)]
pub struct TracingAuditLogger;

impl AuditLogger for TracingAuditLogger {
    fn record(&self, event: AuditEvent) {
        let name = event.name();
        match event {
            AuditEvent::DomainCreated { domain } | AuditEvent::DomainDeleted { domain } => {
                info!(target: "portico::audit", event = name, domain = %domain);
            }
            AuditEvent::DomainVerified { domain, status } => {
                info!(target: "portico::audit", event = name, domain = %domain, status);
            }
            AuditEvent::VerificationFailed {
                domain,
                failures,
                reason,
            } => {
                info!(target: "portico::audit", event = name, domain = %domain, failures, reason = %reason);
            }
            AuditEvent::CertificateIssued {
                domain,
                certificate_id,
                not_after,
            }
            | AuditEvent::CertificateRenewed {
                domain,
                certificate_id,
                not_after,
            }
            | AuditEvent::CertificateUploaded {
                domain,
                certificate_id,
                not_after,
            } => {
                info!(target: "portico::audit", event = name, domain = %domain, certificate_id = %certificate_id, not_after = %not_after);
            }
            AuditEvent::CertificateFailed {
                domain,
                certificate_id,
                error,
            } => {
                info!(target: "portico::audit", event = name, domain = %domain, certificate_id = %certificate_id, error = %error);
            }
            AuditEvent::CertificateExpired {
                domain,
                certificate_id,
            }
            | AuditEvent::CertificateRolledBack {
                domain,
                certificate_id,
            } => {
                info!(target: "portico::audit", event = name, domain = %domain, certificate_id = %certificate_id);
            }
            AuditEvent::ConfigApplied { hash } => {
                info!(target: "portico::audit", event = name, hash = %hash);
            }
            AuditEvent::ConfigRejected { reason } => {
                info!(target: "portico::audit", event = name, reason = %reason);
            }
        }
    }
}
