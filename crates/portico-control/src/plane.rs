//! The control plane facade used by the API and the CLI

use std::sync::Arc;
use std::time::Duration;

use portico_cert::{AcmeClient, CertificateAuthority, SecretCipher, SelfSignedAuthority};
use portico_db::entities::certificate;
use portico_db::entities::dns_provider::{self, DnsProviderKind};
use portico_db::entities::domain::{self, VerificationMethod};
use portico_db::entities::{domain_verification, route};
use portico_db::{NewDnsProvider, NewDomain, NewRoute, Stores};
use portico_dns::{DnsLookup, DnsRecord, HickoryLookup, RecordKind};
use portico_proxy::{is_safe_path, GeneratedConfig, NginxController, ProxyController};
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::audit::{AuditEvent, AuditLogger, TracingAuditLogger};
use crate::config::{AuthorityKind, Settings};
use crate::dns::ProviderFactory;
use crate::error::{ControlError, ControlResult};
use crate::lifecycle::{CertificateManager, UploadRequest};
use crate::reconciler::{CycleOutcome, ProxyStatus, Reconciler};
use crate::scheduler::Scheduler;
use crate::services::{ServiceStore, StaticServiceStore};
use crate::tasks::TaskTracker;
use crate::verification::{challenge_for, VerificationEngine, VerifyOutcome};

const TOKEN_LEN: usize = 32;

/// Collaborators the control plane talks to
pub struct Components {
    pub lookup: Arc<dyn DnsLookup>,
    pub authority: Arc<dyn CertificateAuthority>,
    pub controller: Arc<dyn ProxyController>,
    pub services: Arc<dyn ServiceStore>,
    pub audit: Arc<dyn AuditLogger>,
}

impl Components {
    /// Production collaborators described by `settings`
    pub fn from_settings(settings: &Settings) -> ControlResult<Self> {
        let lookup = HickoryLookup::new(
            &settings.verification.nameservers,
            settings.verification.lookup_timeout(),
        )?;
        let authority: Arc<dyn CertificateAuthority> = match settings.certificates.authority {
            AuthorityKind::Acme => Arc::new(AcmeClient::new(settings.acme_config())),
            AuthorityKind::SelfSigned => Arc::new(SelfSignedAuthority::new(
                settings.certificates.self_signed_validity_days,
            )),
        };
        Ok(Self {
            lookup: Arc::new(lookup),
            authority,
            controller: Arc::new(NginxController::new(settings.proxy.nginx())),
            services: Arc::new(StaticServiceStore::new(&settings.services)),
            audit: Arc::new(TracingAuditLogger),
        })
    }
}

/// Input for [`ControlPlane::create_domain`]
#[derive(Debug, Clone)]
pub struct CreateDomain {
    pub name: String,
    pub verification_method: VerificationMethod,
    pub provider_id: Option<String>,
    pub zone_id: Option<String>,
    pub auto_manage: bool,
}

/// A domain with its verification record
#[derive(Debug, Clone)]
pub struct DomainDetails {
    pub domain: domain::Model,
    pub verification: Option<domain_verification::Model>,
}

/// Input for [`ControlPlane::attach_route`]
#[derive(Debug, Clone)]
pub struct AttachRoute {
    pub domain_id: String,
    pub service_id: String,
    pub path: String,
    pub port: u16,
    pub tls: bool,
}

/// Input for [`ControlPlane::create_provider`]
#[derive(Clone)]
pub struct CreateProvider {
    pub name: String,
    pub kind: DnsProviderKind,
    pub api_token: Option<String>,
}

impl std::fmt::Debug for CreateProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CreateProvider")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// Lowercase, strip a trailing dot and check hostname syntax
pub fn normalize_domain_name(name: &str) -> ControlResult<String> {
    let name = name.trim().trim_end_matches('.').to_ascii_lowercase();
    let invalid =
        |reason: &str| ControlError::Validation(format!("invalid domain '{name}': {reason}"));

    if name.is_empty() {
        return Err(invalid("empty"));
    }
    if name.len() > 253 {
        return Err(invalid("longer than 253 characters"));
    }
    let labels: Vec<&str> = name.split('.').collect();
    if labels.len() < 2 {
        return Err(invalid("needs at least two labels"));
    }
    for label in &labels {
        if label.is_empty() || label.len() > 63 {
            return Err(invalid("labels must be 1-63 characters"));
        }
        if !label
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-')
        {
            return Err(invalid("only letters, digits and '-' are allowed"));
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(invalid("labels cannot start or end with '-'"));
        }
    }
    Ok(name)
}

fn verification_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_LEN)
        .map(char::from)
        .collect()
}

pub struct ControlPlane {
    stores: Stores,
    settings: Settings,
    cipher: SecretCipher,
    services: Arc<dyn ServiceStore>,
    audit: Arc<dyn AuditLogger>,
    verification: Arc<VerificationEngine>,
    certificates: Arc<CertificateManager>,
    reconciler: Arc<Reconciler>,
    scheduler: Arc<Scheduler>,
    tasks: Arc<TaskTracker>,
    shutdown: CancellationToken,
    background: tokio_util::task::TaskTracker,
}

impl ControlPlane {
    pub fn new(
        stores: Stores,
        settings: Settings,
        cipher: SecretCipher,
        components: Components,
    ) -> Arc<Self> {
        let providers = ProviderFactory::new(cipher.clone(), settings.dns.clone());
        let verification = Arc::new(VerificationEngine::new(
            stores.clone(),
            components.lookup.clone(),
            providers.clone(),
            settings.verification.clone(),
            settings.retry.policy(),
            components.audit.clone(),
        ));
        let certificates = Arc::new(CertificateManager::new(
            stores.clone(),
            components.authority,
            cipher.clone(),
            providers,
            components.lookup,
            settings.dns.propagation(),
            settings.proxy.webroot.clone(),
            settings.certificates.clone(),
            components.audit.clone(),
        ));
        let reconciler = Arc::new(Reconciler::new(
            stores.clone(),
            components.controller,
            cipher.clone(),
            settings.proxy.generator(),
            components.audit.clone(),
        ));
        let tasks = TaskTracker::new(settings.workers.max_concurrent);
        let scheduler = Arc::new(Scheduler::new(
            stores.clone(),
            verification.clone(),
            certificates.clone(),
            tasks.clone(),
            Duration::from_secs(settings.reconciler.sweep_interval_secs),
        ));

        Arc::new(Self {
            stores,
            settings,
            cipher,
            services: components.services,
            audit: components.audit,
            verification,
            certificates,
            reconciler,
            scheduler,
            tasks,
            shutdown: CancellationToken::new(),
            background: tokio_util::task::TaskTracker::new(),
        })
    }

    /// Connect, migrate and wire production collaborators
    pub async fn from_settings(settings: Settings) -> ControlResult<Arc<Self>> {
        let db = portico_db::connect(&settings.database_url)
            .await
            .map_err(|e| ControlError::Internal(format!("database connection failed: {e}")))?;
        portico_db::migrate(&db)
            .await
            .map_err(|e| ControlError::Internal(format!("migration failed: {e}")))?;

        let cipher = SecretCipher::from_optional(settings.master_key.as_deref())?;
        if !cipher.is_enabled() {
            warn!("No master key configured; certificate keys and provider tokens cannot be stored");
        }
        let components = Components::from_settings(&settings)?;
        Ok(Self::new(Stores::new(db), settings, cipher, components))
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn certificates(&self) -> &Arc<CertificateManager> {
        &self.certificates
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    pub fn tasks(&self) -> &Arc<TaskTracker> {
        &self.tasks
    }

    /// Seed the applied hash and start the reconciler and scheduler loops
    pub async fn start(&self) -> ControlResult<()> {
        self.reconciler.load_live_config().await?;

        let interval = Duration::from_secs(self.settings.reconciler.interval_secs.max(1));
        self.background.spawn(
            self.reconciler
                .clone()
                .run(interval, self.shutdown.child_token()),
        );
        self.background.spawn(
            self.scheduler
                .clone()
                .run(interval, self.shutdown.child_token()),
        );
        info!("Control plane started");
        Ok(())
    }

    /// Stop the loops after their current cycle and cancel outstanding tasks
    pub async fn shutdown(&self) {
        info!("Shutting down control plane");
        self.shutdown.cancel();
        self.background.close();
        self.background.wait().await;
        self.tasks.shutdown().await;
        info!("Control plane stopped");
    }

    // Domains

    pub async fn create_domain(&self, input: CreateDomain) -> ControlResult<DomainDetails> {
        let name = normalize_domain_name(&input.name)?;

        if input.auto_manage && input.provider_id.is_none() {
            return Err(ControlError::Validation(
                "auto_manage needs a provider_id".to_string(),
            ));
        }
        if let Some(provider_id) = &input.provider_id {
            let provider = self.stores.providers.get(provider_id).await.map_err(|_| {
                ControlError::Validation(format!("unknown DNS provider {provider_id}"))
            })?;
            if !provider.active {
                return Err(ControlError::Validation(format!(
                    "DNS provider {} is disabled",
                    provider.name
                )));
            }
        }

        let token = verification_token();
        let challenge = challenge_for(
            input.verification_method,
            &token,
            &self.settings.verification,
        )?;

        let domain = self
            .stores
            .domains
            .create(NewDomain {
                name,
                verification_method: input.verification_method,
                provider_id: input.provider_id,
                zone_id: input.zone_id,
                auto_manage: input.auto_manage,
                verification_token: token,
                challenge: challenge.clone(),
            })
            .await?;

        let kind = match input.verification_method {
            VerificationMethod::A => RecordKind::A,
            VerificationMethod::Cname => RecordKind::Cname,
            VerificationMethod::Txt => RecordKind::Txt,
        };
        let record = DnsRecord::new(kind, domain.name.as_str(), challenge);
        self.stores
            .verifications
            .set_provisioning(&domain.id, None, Some(record.instructions()))
            .await?;

        info!(domain = %domain.name, method = input.verification_method.as_str(), "Domain created");
        self.audit.record(AuditEvent::DomainCreated {
            domain: domain.name.clone(),
        });
        self.get_domain(&domain.id).await
    }

    pub async fn get_domain(&self, id: &str) -> ControlResult<DomainDetails> {
        let domain = self.stores.domains.get(id).await?;
        let verification = self.stores.verifications.get_by_domain(id).await.ok();
        Ok(DomainDetails {
            domain,
            verification,
        })
    }

    pub async fn list_domains(&self) -> ControlResult<Vec<domain::Model>> {
        Ok(self.stores.domains.list().await?)
    }

    /// Check the domain's DNS now, outside the backoff schedule
    pub async fn verify_domain(&self, id: &str) -> ControlResult<VerifyOutcome> {
        let domain = self.stores.domains.get(id).await?;

        let engine = self.verification.clone();
        let domain_id = domain.id.clone();
        let rx = self
            .tasks
            .spawn_with_result(&domain.id, "verification", async move {
                engine.verify(&domain_id).await
            })
            .ok_or_else(|| {
                ControlError::Conflict(format!(
                    "work for {} is already in progress",
                    domain.name
                ))
            })?;

        rx.await.map_err(|_| {
            ControlError::Conflict(format!("verification of {} was cancelled", domain.name))
        })?
    }

    /// Move an errored domain back to `pending`
    pub async fn reset_domain(&self, id: &str) -> ControlResult<DomainDetails> {
        let domain = self.stores.domains.get(id).await?;
        if !self.stores.domains.reset(id).await? {
            return Err(ControlError::Validation(format!(
                "{} is {}; only errored domains can be reset",
                domain.name,
                domain.status.as_str()
            )));
        }
        info!(domain = %domain.name, "Domain reset");
        self.get_domain(id).await
    }

    /// Cancel the domain's work, remove provider records and delete it
    pub async fn delete_domain(&self, id: &str) -> ControlResult<()> {
        let domain = self.stores.domains.get(id).await?;
        self.tasks.cancel(id);
        self.verification.remove_provisioned(&domain).await;
        self.stores.domains.delete(id).await?;

        info!(domain = %domain.name, "Domain deleted");
        self.audit
            .record(AuditEvent::DomainDeleted { domain: domain.name });
        Ok(())
    }

    // Certificates

    /// Open a certificate request and start issuing it
    pub async fn request_certificate(&self, domain_id: &str) -> ControlResult<certificate::Model> {
        let cert = self.certificates.request(domain_id).await?;
        self.scheduler.dispatch_issuance(&cert.domain_id, &cert.id);
        Ok(cert)
    }

    pub async fn upload_certificate(
        &self,
        upload: UploadRequest,
    ) -> ControlResult<certificate::Model> {
        self.certificates.upload(upload).await
    }

    pub async fn list_certificates(
        &self,
        domain_id: Option<&str>,
    ) -> ControlResult<Vec<certificate::Model>> {
        Ok(match domain_id {
            Some(id) => self.stores.certificates.list_for_domain(id).await?,
            None => self.stores.certificates.list().await?,
        })
    }

    pub async fn get_certificate(&self, id: &str) -> ControlResult<certificate::Model> {
        Ok(self.stores.certificates.get(id).await?)
    }

    pub async fn delete_certificate(&self, id: &str) -> ControlResult<()> {
        self.certificates.delete(id).await
    }

    pub async fn rollback_certificate(&self, domain_id: &str) -> ControlResult<certificate::Model> {
        self.certificates.rollback(domain_id).await
    }

    /// When an active certificate enters the renewal window
    pub fn renewal_due_at(
        &self,
        cert: &certificate::Model,
    ) -> Option<chrono::DateTime<chrono::Utc>> {
        if cert.status != certificate::CertificateStatus::Active {
            return None;
        }
        crate::lifecycle::renewal_due_at(cert, self.settings.certificates.renewal_window())
    }

    // Routes

    /// Attach a service to an active domain
    pub async fn attach_route(&self, input: AttachRoute) -> ControlResult<route::Model> {
        if !is_safe_path(&input.path) {
            return Err(ControlError::Validation(format!(
                "invalid route path '{}'",
                input.path
            )));
        }
        let service = self
            .services
            .lookup(&input.service_id)
            .await
            .ok_or_else(|| {
                ControlError::Validation(format!("unknown service '{}'", input.service_id))
            })?;
        if input.port == 0 || !service.accepts_port(input.port) {
            return Err(ControlError::Validation(format!(
                "service '{}' does not accept port {}",
                service.id, input.port
            )));
        }

        let route = self
            .stores
            .routes
            .attach(NewRoute {
                service_id: input.service_id,
                domain_id: input.domain_id,
                path: input.path,
                port: i32::from(input.port),
                tls: input.tls,
            })
            .await?;
        info!(route_id = %route.id, service = %route.service_id, path = %route.path, "Route attached");
        Ok(route)
    }

    pub async fn detach_route(&self, id: &str) -> ControlResult<route::Model> {
        let route = self.stores.routes.detach(id).await?;
        info!(route_id = %route.id, service = %route.service_id, "Route detached");
        Ok(route)
    }

    pub async fn list_routes(&self, domain_id: Option<&str>) -> ControlResult<Vec<route::Model>> {
        Ok(match domain_id {
            Some(id) => self.stores.routes.list_for_domain(id).await?,
            None => self.stores.routes.list().await?,
        })
    }

    // DNS providers

    pub async fn create_provider(
        &self,
        input: CreateProvider,
    ) -> ControlResult<dns_provider::Model> {
        let name = input.name.trim().to_string();
        if name.is_empty() {
            return Err(ControlError::Validation(
                "provider name must not be empty".to_string(),
            ));
        }
        let token = input.api_token.filter(|t| !t.trim().is_empty());
        let sealed = match (&token, input.kind.requires_token()) {
            (None, true) => {
                return Err(ControlError::Validation(format!(
                    "{} providers need an api_token",
                    input.kind.as_str()
                )))
            }
            (Some(token), true) => Some(self.cipher.encrypt_str(token.trim())?),
            (_, false) => None,
        };

        let provider = self
            .stores
            .providers
            .create(NewDnsProvider {
                name,
                kind: input.kind,
                encrypted_api_token: sealed.as_ref().map(|s| s.ciphertext.clone()),
                token_nonce: sealed.map(|s| s.nonce),
            })
            .await?;
        info!(provider = %provider.name, kind = provider.kind.as_str(), "DNS provider created");
        Ok(provider)
    }

    pub async fn list_providers(&self) -> ControlResult<Vec<dns_provider::Model>> {
        Ok(self.stores.providers.list().await?)
    }

    pub async fn get_provider(&self, id: &str) -> ControlResult<dns_provider::Model> {
        Ok(self.stores.providers.get(id).await?)
    }

    pub async fn set_provider_active(
        &self,
        id: &str,
        active: bool,
    ) -> ControlResult<dns_provider::Model> {
        self.stores.providers.set_active(id, active).await?;
        self.get_provider(id).await
    }

    pub async fn delete_provider(&self, id: &str) -> ControlResult<()> {
        Ok(self.stores.providers.delete(id).await?)
    }

    // Proxy

    pub fn proxy_status(&self) -> ProxyStatus {
        self.reconciler.status()
    }

    /// Render and check the configuration without applying it
    pub async fn validate_config(&self) -> ControlResult<GeneratedConfig> {
        self.reconciler.validate_config().await
    }

    pub async fn render_config(&self) -> ControlResult<GeneratedConfig> {
        self.reconciler.render().await
    }

    /// Apply the current configuration even if it is unchanged
    pub async fn force_reload(&self) -> ControlResult<String> {
        match self.reconciler.force_apply().await? {
            CycleOutcome::Applied { hash } | CycleOutcome::Unchanged { hash } => Ok(hash),
            CycleOutcome::Aborted { reason } => Err(ControlError::ConfigApply(reason)),
        }
    }
}
