//! Certificate lifecycle: issuance, upload, renewal, expiry and rollback

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use portico_cert::{
    validate_pair, AcmeError, CertificateAuthority, ChallengeKind, ChallengeResponder,
    Http01Webroot, IssueRequest, IssuedBundle, SecretCipher,
};
use portico_db::entities::certificate::{self, CertificateStatus};
use portico_db::entities::dns_provider::DnsProviderKind;
use portico_db::entities::domain::{self, DomainStatus};
use portico_db::{IssuedCertificate, StoreError, Stores, UploadedCertificate};
use portico_dns::{DnsLookup, PropagationConfig};
use tracing::{debug, info, warn};

use crate::audit::{AuditEvent, AuditLogger};
use crate::config::CertificateSettings;
use crate::dns::{DnsChallengeResponder, ProviderFactory};
use crate::error::{ControlError, ControlResult};
use crate::retry::exponential_backoff;

/// A certificate/key pair supplied by an operator
#[derive(Clone)]
pub struct UploadRequest {
    pub domain_id: String,
    pub certificate_pem: String,
    pub private_key_pem: String,
    pub auto_renew: bool,
}

impl std::fmt::Debug for UploadRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadRequest")
            .field("domain_id", &self.domain_id)
            .field("auto_renew", &self.auto_renew)
            .finish_non_exhaustive()
    }
}

/// What one renewal/expiry sweep did
#[derive(Debug, Default, Clone)]
pub struct SweepReport {
    pub expired: Vec<String>,
    /// Pending rows created for certificates entering the renewal window
    pub renewals: Vec<certificate::Model>,
}

/// When the renewal sweep will pick up `cert`
pub fn renewal_due_at(
    cert: &certificate::Model,
    window: chrono::Duration,
) -> Option<DateTime<Utc>> {
    cert.not_after.map(|not_after| not_after - window)
}

pub struct CertificateManager {
    stores: Stores,
    authority: Arc<dyn CertificateAuthority>,
    cipher: SecretCipher,
    providers: ProviderFactory,
    lookup: Arc<dyn DnsLookup>,
    propagation: PropagationConfig,
    webroot: PathBuf,
    settings: CertificateSettings,
    audit: Arc<dyn AuditLogger>,
}

impl CertificateManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        stores: Stores,
        authority: Arc<dyn CertificateAuthority>,
        cipher: SecretCipher,
        providers: ProviderFactory,
        lookup: Arc<dyn DnsLookup>,
        propagation: PropagationConfig,
        webroot: PathBuf,
        settings: CertificateSettings,
        audit: Arc<dyn AuditLogger>,
    ) -> Self {
        Self {
            stores,
            authority,
            cipher,
            providers,
            lookup,
            propagation,
            webroot,
            settings,
            audit,
        }
    }

    pub fn settings(&self) -> &CertificateSettings {
        &self.settings
    }

    /// Create a pending certificate for a verified or active domain.
    ///
    /// For an active domain the new row is a renewal of the served certificate.
    pub async fn request(&self, domain_id: &str) -> ControlResult<certificate::Model> {
        let domain = self.stores.domains.get(domain_id).await?;
        if !matches!(domain.status, DomainStatus::Verified | DomainStatus::Active) {
            return Err(ControlError::Validation(format!(
                "{} is {}; certificates need a verified domain",
                domain.name,
                domain.status.as_str()
            )));
        }
        let cert = self
            .stores
            .certificates
            .create_pending(&domain, domain.certificate_id.clone())
            .await?;
        info!(domain = %domain.name, certificate_id = %cert.id, "Certificate requested");
        Ok(cert)
    }

    /// Run one issuance attempt for a pending certificate.
    ///
    /// Transient failures keep the row pending with a backoff; permanent
    /// failures or an exhausted attempt budget mark it failed. The domain
    /// itself is never failed by issuance.
    pub async fn issue(&self, certificate_id: &str) -> ControlResult<certificate::Model> {
        let cert = self.stores.certificates.get(certificate_id).await?;
        if cert.status != CertificateStatus::Pending {
            debug!(certificate_id = %cert.id, status = cert.status.as_str(), "Certificate not pending, skipping issuance");
            return Ok(cert);
        }

        let domain = self.stores.domains.get(&cert.domain_id).await?;
        if !matches!(domain.status, DomainStatus::Verified | DomainStatus::Active) {
            let reason = format!("{} is {}", domain.name, domain.status.as_str());
            self.stores
                .certificates
                .record_failure(&cert.id, &reason, None)
                .await?;
            self.audit.record(AuditEvent::CertificateFailed {
                domain: domain.name.clone(),
                certificate_id: cert.id.clone(),
                error: reason.clone(),
            });
            return Err(ControlError::Validation(reason));
        }

        if !self.cipher.is_enabled() {
            // Retried once a master key is configured
            let err = ControlError::Encryption(portico_cert::CipherError::KeyUnavailable);
            let next = self.next_attempt(cert.attempts.saturating_add(1))?;
            self.stores
                .certificates
                .record_failure(&cert.id, &err.to_string(), Some(next))
                .await?;
            warn!(domain = %domain.name, certificate_id = %cert.id, "Cannot store issued keys without a master key");
            return Err(err);
        }

        let (kind, responder) = self.responder_for(&domain).await;
        let request = IssueRequest {
            domain: domain.name.clone(),
            challenge: kind,
        };
        info!(
            domain = %domain.name,
            certificate_id = %cert.id,
            authority = self.authority.name(),
            challenge = kind.as_str(),
            attempt = cert.attempts + 1,
            "Issuing certificate"
        );

        let result = match tokio::time::timeout(
            self.settings.issuance_timeout(),
            self.authority.issue(&request, responder.as_ref()),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(AcmeError::Timeout(format!(
                "certificate issuance after {}s",
                self.settings.issuance_timeout_secs
            ))),
        };

        match result {
            Ok(bundle) => self.store_issued(&domain, &cert, bundle).await,
            Err(e) => self.issuance_failed(&domain, &cert, e).await,
        }
    }

    async fn store_issued(
        &self,
        domain: &domain::Model,
        cert: &certificate::Model,
        bundle: IssuedBundle,
    ) -> ControlResult<certificate::Model> {
        let sealed = self.cipher.encrypt_str(&bundle.key_pem)?;
        let stored = self
            .stores
            .certificates
            .complete(
                &cert.id,
                IssuedCertificate {
                    issuer: bundle.issuer,
                    not_before: bundle.not_before,
                    not_after: bundle.not_after,
                    pem_cert: bundle.pem_cert,
                    pem_chain: bundle.pem_chain,
                    encrypted_key: sealed.ciphertext,
                    key_nonce: sealed.nonce,
                },
            )
            .await?;

        let event = if stored.renewal_of.is_some() {
            AuditEvent::CertificateRenewed {
                domain: domain.name.clone(),
                certificate_id: stored.id.clone(),
                not_after: bundle.not_after,
            }
        } else {
            AuditEvent::CertificateIssued {
                domain: domain.name.clone(),
                certificate_id: stored.id.clone(),
                not_after: bundle.not_after,
            }
        };
        self.audit.record(event);
        Ok(stored)
    }

    async fn issuance_failed(
        &self,
        domain: &domain::Model,
        cert: &certificate::Model,
        error: AcmeError,
    ) -> ControlResult<certificate::Model> {
        let attempts = cert.attempts.saturating_add(1);
        let retry = error.is_transient() && (attempts as u32) < self.settings.max_issuance_attempts;
        let next = if retry {
            Some(self.next_attempt(attempts)?)
        } else {
            None
        };

        self.stores
            .certificates
            .record_failure(&cert.id, &error.to_string(), next)
            .await?;

        match next {
            Some(at) => {
                warn!(
                    domain = %domain.name,
                    certificate_id = %cert.id,
                    attempt = attempts,
                    next_attempt_at = %at,
                    error = %error,
                    "Certificate issuance failed, will retry"
                );
            }
            None => {
                warn!(
                    domain = %domain.name,
                    certificate_id = %cert.id,
                    attempt = attempts,
                    error = %error,
                    "Certificate issuance failed"
                );
                self.audit.record(AuditEvent::CertificateFailed {
                    domain: domain.name.clone(),
                    certificate_id: cert.id.clone(),
                    error: error.to_string(),
                });
            }
        }
        Err(error.into())
    }

    fn next_attempt(&self, attempts: i32) -> ControlResult<DateTime<Utc>> {
        let delay = exponential_backoff(
            std::time::Duration::from_secs(self.settings.issuance_backoff_secs),
            std::time::Duration::from_secs(self.settings.max_issuance_backoff_secs),
            attempts.max(1) as u32,
        );
        let delay =
            chrono::Duration::from_std(delay).map_err(|e| ControlError::Internal(e.to_string()))?;
        Ok(Utc::now() + delay)
    }

    /// DNS-01 through the domain's provider when it is auto-managed, HTTP-01
    /// through the proxy webroot otherwise
    async fn responder_for(
        &self,
        domain: &domain::Model,
    ) -> (ChallengeKind, Box<dyn ChallengeResponder>) {
        let webroot = || -> (ChallengeKind, Box<dyn ChallengeResponder>) {
            (
                ChallengeKind::Http01,
                Box::new(Http01Webroot::new(self.webroot.clone())),
            )
        };

        if !domain.auto_manage {
            return webroot();
        }
        let Some(provider_id) = domain.provider_id.as_deref() else {
            return webroot();
        };
        let provider = match self.stores.providers.get(provider_id).await {
            Ok(p) if p.kind != DnsProviderKind::Manual => p,
            Ok(_) => return webroot(),
            Err(e) => {
                warn!(domain = %domain.name, error = %e, "DNS provider lookup failed, using HTTP-01");
                return webroot();
            }
        };
        match self.providers.build(&provider) {
            Ok(adapter) => {
                let responder = DnsChallengeResponder::new(
                    adapter,
                    domain.zone_id.clone(),
                    self.lookup.clone(),
                    self.propagation.clone(),
                );
                (ChallengeKind::Dns01, Box::new(responder))
            }
            Err(e) => {
                warn!(domain = %domain.name, error = %e, "DNS provider unavailable, using HTTP-01");
                webroot()
            }
        }
    }

    /// Validate and store an operator-supplied certificate.
    ///
    /// Nothing is written unless the pair matches, covers the domain and is
    /// currently valid.
    pub async fn upload(&self, upload: UploadRequest) -> ControlResult<certificate::Model> {
        let domain = self.stores.domains.get(&upload.domain_id).await?;
        let info = validate_pair(
            &upload.certificate_pem,
            &upload.private_key_pem,
            &domain.name,
            Utc::now(),
        )?;
        let sealed = self.cipher.encrypt_str(&upload.private_key_pem)?;

        let stored = self
            .stores
            .certificates
            .create_uploaded(UploadedCertificate {
                domain_id: domain.id.clone(),
                domain: domain.name.clone(),
                issued: IssuedCertificate {
                    issuer: Some(info.issuer),
                    not_before: info.not_before,
                    not_after: info.not_after,
                    pem_cert: info.leaf_pem,
                    pem_chain: info.chain_pem,
                    encrypted_key: sealed.ciphertext,
                    key_nonce: sealed.nonce,
                },
                auto_renew: upload.auto_renew,
            })
            .await?;

        self.audit.record(AuditEvent::CertificateUploaded {
            domain: domain.name,
            certificate_id: stored.id.clone(),
            not_after: info.not_after,
        });
        Ok(stored)
    }

    /// Expire elapsed certificates and open renewals for those entering the
    /// renewal window
    pub async fn sweep(&self, now: DateTime<Utc>) -> ControlResult<SweepReport> {
        let mut report = SweepReport::default();

        for cert in self.stores.certificates.expire_elapsed(now).await? {
            self.audit.record(AuditEvent::CertificateExpired {
                domain: cert.domain.clone(),
                certificate_id: cert.id.clone(),
            });
            report.expired.push(cert.id);
        }

        let due = self
            .stores
            .certificates
            .due_for_renewal(now, self.settings.renewal_window())
            .await?;
        for cert in due {
            let Some(domain) = self.stores.domains.find(&cert.domain_id).await? else {
                continue;
            };
            if !matches!(domain.status, DomainStatus::Verified | DomainStatus::Active) {
                continue;
            }
            match self
                .stores
                .certificates
                .create_pending(&domain, Some(cert.id.clone()))
                .await
            {
                Ok(pending) => {
                    info!(
                        domain = %domain.name,
                        certificate_id = %pending.id,
                        renews = %cert.id,
                        not_after = ?cert.not_after,
                        "Certificate renewal scheduled"
                    );
                    report.renewals.push(pending);
                }
                Err(StoreError::Conflict(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }

        Ok(report)
    }

    /// Open an issuance for every verified, auto-managed domain that has no
    /// certificate yet.
    ///
    /// Unmanaged domains only get certificates through [`request`](Self::request)
    /// or an upload. Domains whose latest attempt failed are left alone until an
    /// operator requests again.
    pub async fn request_for_verified_domains(&self) -> ControlResult<Vec<certificate::Model>> {
        let mut created = Vec::new();
        for domain in self
            .stores
            .domains
            .list_by_status(&[DomainStatus::Verified])
            .await?
        {
            if !domain.auto_manage || domain.certificate_id.is_some() {
                continue;
            }
            let history = self.stores.certificates.list_for_domain(&domain.id).await?;
            let blocked = history.first().is_some_and(|latest| {
                matches!(
                    latest.status,
                    CertificateStatus::Pending | CertificateStatus::Failed
                )
            });
            if blocked {
                continue;
            }
            match self.stores.certificates.create_pending(&domain, None).await {
                Ok(cert) => {
                    debug!(domain = %domain.name, certificate_id = %cert.id, "Certificate requested for verified domain");
                    created.push(cert);
                }
                Err(StoreError::Conflict(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(created)
    }

    /// Serve the most recent superseded certificate that is still valid
    pub async fn rollback(&self, domain_id: &str) -> ControlResult<certificate::Model> {
        let cert = self
            .stores
            .certificates
            .rollback(domain_id, Utc::now())
            .await?;
        self.audit.record(AuditEvent::CertificateRolledBack {
            domain: cert.domain.clone(),
            certificate_id: cert.id.clone(),
        });
        Ok(cert)
    }

    pub async fn delete(&self, certificate_id: &str) -> ControlResult<()> {
        self.stores.certificates.delete(certificate_id).await?;
        Ok(())
    }
}
