//! Domain ownership verification
//!
//! A domain proves DNS control by publishing the record its verification
//! method asks for. Mismatches back off exponentially until the failure budget
//! runs out and the domain moves to `error`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use portico_db::entities::domain::{self, DomainStatus, VerificationMethod};
use portico_db::entities::domain_verification::{self, VerificationStatus};
use portico_db::{Stores, VerificationOutcome};
use portico_dns::{record_present, DnsLookup, DnsRecord, Provisioned, RecordKind};
use tracing::{debug, info, warn};

use crate::audit::{AuditEvent, AuditLogger};
use crate::config::VerificationSettings;
use crate::dns::ProviderFactory;
use crate::error::{ControlError, ControlResult};
use crate::retry::{exponential_backoff, RetryPolicy};

/// Prefix of the TXT value a domain publishes to prove control
pub const TXT_PREFIX: &str = "portico-verification=";

/// Expected record value for `method`, given the domain's random token
pub fn challenge_for(
    method: VerificationMethod,
    token: &str,
    settings: &VerificationSettings,
) -> ControlResult<String> {
    match method {
        VerificationMethod::Txt => Ok(format!("{TXT_PREFIX}{token}")),
        VerificationMethod::Cname => settings
            .ingress_hostname
            .as_deref()
            .map(portico_dns::normalize_name)
            .ok_or_else(|| {
                ControlError::Validation(
                    "CNAME verification needs verification.ingress_hostname".to_string(),
                )
            }),
        VerificationMethod::A => settings
            .public_ipv4
            .map(|ip| ip.to_string())
            .ok_or_else(|| {
                ControlError::Validation(
                    "A verification needs verification.public_ipv4".to_string(),
                )
            }),
    }
}

/// The record a domain must publish
pub fn expected_record(
    domain: &domain::Model,
    verification: &domain_verification::Model,
) -> DnsRecord {
    let kind = match verification.method {
        VerificationMethod::A => RecordKind::A,
        VerificationMethod::Cname => RecordKind::Cname,
        VerificationMethod::Txt => RecordKind::Txt,
    };
    DnsRecord::new(kind, domain.name.as_str(), verification.challenge.as_str())
}

/// Result of one verification attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyOutcome {
    /// Record matched; the domain is now `verified` or `active`
    Verified(DomainStatus),
    /// No match yet; checked again at `next_check_at`
    Retrying {
        failures: i32,
        next_check_at: DateTime<Utc>,
    },
    /// Failure budget exhausted; the domain is now `error`
    GaveUp { failures: i32 },
    /// The domain was not awaiting verification
    Skipped(DomainStatus),
}

pub struct VerificationEngine {
    stores: Stores,
    lookup: Arc<dyn DnsLookup>,
    providers: ProviderFactory,
    settings: VerificationSettings,
    retry: RetryPolicy,
    audit: Arc<dyn AuditLogger>,
}

impl VerificationEngine {
    pub fn new(
        stores: Stores,
        lookup: Arc<dyn DnsLookup>,
        providers: ProviderFactory,
        settings: VerificationSettings,
        retry: RetryPolicy,
        audit: Arc<dyn AuditLogger>,
    ) -> Self {
        Self {
            stores,
            lookup,
            providers,
            settings,
            retry,
            audit,
        }
    }

    /// Check the domain's DNS once and advance its status
    pub async fn verify(&self, domain_id: &str) -> ControlResult<VerifyOutcome> {
        let domain = self.stores.domains.get(domain_id).await?;
        if !matches!(
            domain.status,
            DomainStatus::Pending | DomainStatus::Verifying
        ) {
            debug!(domain = %domain.name, status = domain.status.as_str(), "Skipping verification");
            return Ok(VerifyOutcome::Skipped(domain.status));
        }

        let verification = self.stores.verifications.get_by_domain(domain_id).await?;
        let record = expected_record(&domain, &verification);

        if domain.auto_manage && verification.provider_record_id.is_none() {
            self.provision(&domain, &record).await?;
        }

        let now = Utc::now();
        let mismatch = match tokio::time::timeout(
            self.settings.lookup_timeout(),
            record_present(self.lookup.as_ref(), &record),
        )
        .await
        {
            Ok(Ok(true)) => None,
            Ok(Ok(false)) => Some(format!("{} {} record not found", record.name, record.kind)),
            Ok(Err(e)) => Some(e.to_string()),
            Err(_) => Some(format!(
                "DNS lookup timed out after {}s",
                self.settings.lookup_timeout_secs
            )),
        };

        match mismatch {
            None => self.on_match(&domain, now).await,
            Some(reason) => self.on_mismatch(&domain, now, reason).await,
        }
    }

    async fn on_match(
        &self,
        domain: &domain::Model,
        now: DateTime<Utc>,
    ) -> ControlResult<VerifyOutcome> {
        self.stores
            .verifications
            .record_check(&domain.id, VerificationStatus::Verified, now, None)
            .await?;

        match self.stores.domains.mark_verified(&domain.id, now).await? {
            Some(status) => {
                info!(domain = %domain.name, status = status.as_str(), "Domain verified");
                self.audit.record(AuditEvent::DomainVerified {
                    domain: domain.name.clone(),
                    status: status.as_str(),
                });
                Ok(VerifyOutcome::Verified(status))
            }
            None => {
                let current = self.stores.domains.get(&domain.id).await?;
                Ok(VerifyOutcome::Skipped(current.status))
            }
        }
    }

    async fn on_mismatch(
        &self,
        domain: &domain::Model,
        now: DateTime<Utc>,
        reason: String,
    ) -> ControlResult<VerifyOutcome> {
        let attempt = domain.consecutive_failures.saturating_add(1).max(1) as u32;
        let backoff = exponential_backoff(
            self.settings.initial_backoff(),
            self.settings.max_backoff(),
            attempt,
        );
        let next_check_at = now
            + chrono::Duration::from_std(backoff)
                .map_err(|e| ControlError::Internal(e.to_string()))?;

        let outcome = self
            .stores
            .domains
            .record_verification_failure(
                &domain.id,
                now,
                &reason,
                next_check_at,
                self.settings.max_failures,
            )
            .await?;

        let (status, failures, result) = match outcome {
            VerificationOutcome::Retry { failures } => {
                debug!(
                    domain = %domain.name,
                    failures,
                    backoff_secs = backoff.as_secs(),
                    reason = %reason,
                    "Verification record not found yet"
                );
                (
                    VerificationStatus::Pending,
                    failures,
                    VerifyOutcome::Retrying {
                        failures,
                        next_check_at,
                    },
                )
            }
            VerificationOutcome::GaveUp { failures } => {
                warn!(domain = %domain.name, failures, reason = %reason, "Verification gave up");
                (
                    VerificationStatus::Failed,
                    failures,
                    VerifyOutcome::GaveUp { failures },
                )
            }
            VerificationOutcome::Skipped => {
                let current = self.stores.domains.get(&domain.id).await?;
                return Ok(VerifyOutcome::Skipped(current.status));
            }
        };

        self.stores
            .verifications
            .record_check(&domain.id, status, now, Some(reason.clone()))
            .await?;

        self.audit.record(AuditEvent::VerificationFailed {
            domain: domain.name.clone(),
            failures,
            reason,
        });
        Ok(result)
    }

    /// Ask the domain's provider to publish the verification record.
    ///
    /// Never fails verification: when the provider can't create the record the
    /// instructions for doing it by hand are stored instead.
    async fn provision(&self, domain: &domain::Model, record: &DnsRecord) -> ControlResult<()> {
        let Some(provider_id) = domain.provider_id.as_deref() else {
            return Ok(());
        };

        let provider = self.stores.providers.get(provider_id).await?;
        let adapter = match self.providers.build(&provider) {
            Ok(adapter) => adapter,
            Err(e) => {
                warn!(domain = %domain.name, provider = %provider.name, error = %e, "DNS provider unavailable, falling back to manual instructions");
                self.stores
                    .verifications
                    .set_provisioning(&domain.id, None, Some(record.instructions()))
                    .await?;
                return Ok(());
            }
        };

        let zone_id = domain.zone_id.as_deref();
        let result = self
            .retry
            .run("dns.create_record", || adapter.create_record(zone_id, record))
            .await;

        let (record_id, instructions) = match result {
            Ok(Provisioned::Created { record_id }) => (Some(record_id), None),
            Ok(Provisioned::Manual { instructions }) => (None, Some(instructions)),
            Err(e) => {
                warn!(
                    domain = %domain.name,
                    provider = adapter.name(),
                    error = %e,
                    "Could not create verification record, falling back to manual instructions"
                );
                (None, Some(record.instructions()))
            }
        };
        self.stores
            .verifications
            .set_provisioning(&domain.id, record_id, instructions)
            .await?;
        Ok(())
    }

    /// Remove the verification record a provider created for `domain`; best effort
    pub async fn remove_provisioned(&self, domain: &domain::Model) {
        let verification = match self.stores.verifications.get_by_domain(&domain.id).await {
            Ok(v) => v,
            Err(e) => {
                debug!(domain = %domain.name, error = %e, "No verification record to clean up");
                return;
            }
        };
        let (Some(record_id), Some(provider_id)) =
            (verification.provider_record_id.as_deref(), domain.provider_id.as_deref())
        else {
            return;
        };

        let adapter = match self.stores.providers.get(provider_id).await {
            Ok(provider) => match self.providers.build(&provider) {
                Ok(adapter) => adapter,
                Err(e) => {
                    warn!(domain = %domain.name, error = %e, "Cannot remove verification record");
                    return;
                }
            },
            Err(e) => {
                warn!(domain = %domain.name, error = %e, "Cannot remove verification record");
                return;
            }
        };

        match adapter
            .delete_record(domain.zone_id.as_deref(), &domain.name, record_id)
            .await
        {
            Ok(()) => debug!(domain = %domain.name, record_id, "Verification record removed"),
            Err(e) => warn!(domain = %domain.name, record_id, error = %e, "Failed to remove verification record"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_challenge_per_method() {
        let mut settings = VerificationSettings::default();
        assert_eq!(
            challenge_for(VerificationMethod::Txt, "abc", &settings).unwrap(),
            "portico-verification=abc"
        );
        assert!(matches!(
            challenge_for(VerificationMethod::A, "abc", &settings),
            Err(ControlError::Validation(_))
        ));
        assert!(challenge_for(VerificationMethod::Cname, "abc", &settings).is_err());

        settings.public_ipv4 = Some(Ipv4Addr::new(203, 0, 113, 7));
        settings.ingress_hostname = Some("Ingress.Portico.Example.".to_string());
        assert_eq!(
            challenge_for(VerificationMethod::A, "abc", &settings).unwrap(),
            "203.0.113.7"
        );
        assert_eq!(
            challenge_for(VerificationMethod::Cname, "abc", &settings).unwrap(),
            "ingress.portico.example"
        );
    }
}
