//! Shared fakes and wiring for control plane integration tests

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use portico_cert::{
    generate_for_domains, AcmeError, CertificateAuthority, ChallengeResponder, IssueRequest,
    IssuedBundle, SecretCipher, SelfSignedAuthority,
};
use portico_control::config::ServiceDefinition;
use portico_control::{
    AuditEvent, AuditLogger, Components, ControlPlane, CreateDomain, CreateProvider, Settings,
    StaticServiceStore, UploadRequest,
};
use portico_db::entities::dns_provider::DnsProviderKind;
use portico_db::entities::domain::VerificationMethod;
use portico_db::{connect, migrate, Stores};
use portico_dns::{DnsLookup, DnsResult, RecordKind};
use portico_proxy::{CertificateFiles, ProxyController, ProxyError};

/// DNS answers from an in-memory table
#[derive(Default)]
pub struct FakeLookup {
    records: Mutex<HashMap<(RecordKind, String), Vec<String>>>,
}

impl FakeLookup {
    pub fn publish(&self, kind: RecordKind, name: &str, value: &str) {
        self.records
            .lock()
            .unwrap()
            .entry((kind, name.to_string()))
            .or_default()
            .push(value.to_string());
    }

    fn get(&self, kind: RecordKind, name: &str) -> Vec<String> {
        self.records
            .lock()
            .unwrap()
            .get(&(kind, name.to_string()))
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl DnsLookup for FakeLookup {
    async fn txt(&self, name: &str) -> DnsResult<Vec<String>> {
        Ok(self.get(RecordKind::Txt, name))
    }

    async fn a(&self, name: &str) -> DnsResult<Vec<Ipv4Addr>> {
        Ok(self
            .get(RecordKind::A, name)
            .iter()
            .filter_map(|v| v.parse().ok())
            .collect())
    }

    async fn cname(&self, name: &str) -> DnsResult<Vec<String>> {
        Ok(self.get(RecordKind::Cname, name))
    }
}

/// Self-signed issuance with scripted failures
pub struct FakeAuthority {
    inner: SelfSignedAuthority,
    failures: Mutex<VecDeque<AcmeError>>,
    pub calls: AtomicUsize,
}

impl FakeAuthority {
    pub fn new() -> Self {
        Self {
            inner: SelfSignedAuthority::new(90),
            failures: Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn fail_next(&self, error: AcmeError) {
        self.failures.lock().unwrap().push_back(error);
    }
}

#[async_trait]
impl CertificateAuthority for FakeAuthority {
    fn name(&self) -> &str {
        "fake"
    }

    async fn issue(
        &self,
        request: &IssueRequest,
        responder: &dyn ChallengeResponder,
    ) -> Result<IssuedBundle, AcmeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        self.inner.issue(request, responder).await
    }
}

/// Proxy that records what it was asked to do
#[derive(Default)]
pub struct RecordingController {
    pub reject: AtomicBool,
    pub apply_delay_ms: AtomicUsize,
    pub validated: Mutex<Vec<String>>,
    pub applied: Mutex<Vec<String>>,
    pub installed: Mutex<Vec<String>>,
    pub live: Mutex<Option<String>>,
    active: AtomicUsize,
    pub max_concurrent: AtomicUsize,
}

impl RecordingController {
    pub fn applied_count(&self) -> usize {
        self.applied.lock().unwrap().len()
    }

    pub fn last_applied(&self) -> Option<String> {
        self.applied.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl ProxyController for RecordingController {
    async fn validate(&self, config: &str) -> Result<(), ProxyError> {
        self.validated.lock().unwrap().push(config.to_string());
        if self.reject.load(Ordering::SeqCst) {
            return Err(ProxyError::Rejected("nginx: [emerg] test rejection".to_string()));
        }
        Ok(())
    }

    async fn apply(&self, config: &str) -> Result<(), ProxyError> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent.fetch_max(now, Ordering::SeqCst);

        let delay = self.apply_delay_ms.load(Ordering::SeqCst) as u64;
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        self.applied.lock().unwrap().push(config.to_string());
        *self.live.lock().unwrap() = Some(config.to_string());
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }

    async fn install_certificate(&self, files: &CertificateFiles) -> Result<(), ProxyError> {
        assert!(files.key_pem.contains("PRIVATE KEY"));
        self.installed
            .lock()
            .unwrap()
            .push(files.certificate_id.clone());
        Ok(())
    }

    async fn live_config(&self) -> Result<Option<String>, ProxyError> {
        Ok(self.live.lock().unwrap().clone())
    }
}

#[derive(Default)]
pub struct RecordingAudit {
    pub events: Mutex<Vec<AuditEvent>>,
}

impl RecordingAudit {
    pub fn names(&self) -> Vec<&'static str> {
        self.events.lock().unwrap().iter().map(|e| e.name()).collect()
    }
}

impl AuditLogger for RecordingAudit {
    fn record(&self, event: AuditEvent) {
        self.events.lock().unwrap().push(event);
    }
}

pub struct Harness {
    pub plane: Arc<ControlPlane>,
    pub stores: Stores,
    pub lookup: Arc<FakeLookup>,
    pub authority: Arc<FakeAuthority>,
    pub controller: Arc<RecordingController>,
    pub audit: Arc<RecordingAudit>,
    pub webroot: tempfile::TempDir,
}

pub fn test_settings() -> Settings {
    let mut settings = Settings::default();
    settings.master_key = Some(SecretCipher::generate_key().unwrap());
    settings.verification.public_ipv4 = Some(Ipv4Addr::new(203, 0, 113, 10));
    settings.verification.ingress_hostname = Some("edge.portico.test".to_string());
    settings.retry.max_attempts = 1;
    settings.retry.call_timeout_secs = 5;
    settings.dns.api_timeout_secs = 5;
    settings.services = vec![ServiceDefinition {
        id: "web".to_string(),
        ports: vec![8080],
    }];
    settings
}

pub async fn harness() -> Harness {
    harness_with(test_settings()).await
}

pub async fn harness_with(mut settings: Settings) -> Harness {
    let db = connect("sqlite::memory:").await.unwrap();
    migrate(&db).await.unwrap();
    let stores = Stores::new(db);

    let webroot = tempfile::tempdir().unwrap();
    settings.proxy.webroot = webroot.path().to_path_buf();

    let lookup = Arc::new(FakeLookup::default());
    let authority = Arc::new(FakeAuthority::new());
    let controller = Arc::new(RecordingController::default());
    let audit = Arc::new(RecordingAudit::default());

    let cipher = SecretCipher::from_optional(settings.master_key.as_deref()).unwrap();
    let components = Components {
        lookup: lookup.clone(),
        authority: authority.clone(),
        controller: controller.clone(),
        services: Arc::new(StaticServiceStore::new(&settings.services)),
        audit: audit.clone(),
    };
    let plane = ControlPlane::new(stores.clone(), settings, cipher, components);

    Harness {
        plane,
        stores,
        lookup,
        authority,
        controller,
        audit,
        webroot,
    }
}

pub fn txt_domain(name: &str) -> CreateDomain {
    CreateDomain {
        name: name.to_string(),
        verification_method: VerificationMethod::Txt,
        provider_id: None,
        zone_id: None,
        auto_manage: false,
    }
}

impl Harness {
    /// Publish the record a domain was asked for
    pub async fn publish_challenge(&self, domain_id: &str) {
        let details = self.plane.get_domain(domain_id).await.unwrap();
        let verification = details.verification.unwrap();
        let kind = match verification.method {
            VerificationMethod::A => RecordKind::A,
            VerificationMethod::Cname => RecordKind::Cname,
            VerificationMethod::Txt => RecordKind::Txt,
        };
        self.lookup
            .publish(kind, &details.domain.name, &verification.challenge);
    }

    /// A certificate/key pair for `name`, uploaded directly
    pub fn upload_for(&self, domain_id: &str, name: &str) -> UploadRequest {
        let pair = generate_for_domains(&[name.to_string()], 60).unwrap();
        UploadRequest {
            domain_id: domain_id.to_string(),
            certificate_pem: pair.pem_cert,
            private_key_pem: pair.pem_key,
            auto_renew: false,
        }
    }

    /// Create an auto-managed TXT domain backed by a manual provider
    pub async fn managed_domain(&self, name: &str) -> String {
        let provider = self
            .plane
            .create_provider(CreateProvider {
                name: format!("manual-{name}"),
                kind: DnsProviderKind::Manual,
                api_token: None,
            })
            .await
            .unwrap();
        let mut input = txt_domain(name);
        input.provider_id = Some(provider.id);
        input.auto_manage = true;
        self.plane.create_domain(input).await.unwrap().domain.id
    }

    /// Create, upload a certificate for and verify a domain, leaving it `active`
    pub async fn active_domain(&self, name: &str) -> String {
        let created = self.plane.create_domain(txt_domain(name)).await.unwrap();
        let id = created.domain.id;
        self.plane
            .upload_certificate(self.upload_for(&id, name))
            .await
            .unwrap();
        self.publish_challenge(&id).await;
        self.plane.verify_domain(&id).await.unwrap();
        id
    }
}
