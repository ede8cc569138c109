//! Reconciliation of the proxy configuration with the stored desired state
//!
//! Each cycle renders the configuration, compares its hash with the last one
//! applied and, when it changed, installs certificate files, validates and
//! applies. Cycles run one at a time; the last applied hash only changes
//! inside that critical section and only after a successful reload. A
//! configuration the proxy's checker rejected is not validated again until
//! the desired state changes or an operator forces or validates it.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use portico_cert::SecretCipher;
use portico_db::entities::domain::DomainStatus;
use portico_db::Stores;
use portico_proxy::{
    config_hash, generate, CertificateFiles, DesiredDomain, DesiredRoute, DesiredState,
    ExcludedDomain, GeneratedConfig, GeneratorSettings, ProxyController, ProxyError,
};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::audit::{AuditEvent, AuditLogger};
use crate::error::{ControlError, ControlResult};

/// Where a reconciliation cycle currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CyclePhase {
    Idle,
    Computing,
    Validating,
    Applying,
}

impl CyclePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            CyclePhase::Idle => "idle",
            CyclePhase::Computing => "computing",
            CyclePhase::Validating => "validating",
            CyclePhase::Applying => "applying",
        }
    }
}

/// How a cycle ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Desired configuration equals the applied one
    Unchanged { hash: String },
    Applied { hash: String },
    /// Nothing changed on the proxy; the previous configuration stays live
    Aborted { reason: String },
}

/// Snapshot of the proxy side, for operators
#[derive(Debug, Clone)]
pub struct ProxyStatus {
    pub phase: CyclePhase,
    pub applied_hash: Option<String>,
    pub applied_at: Option<DateTime<Utc>>,
    pub last_cycle_at: Option<DateTime<Utc>>,
    /// Cycles completed since startup, whatever their outcome
    pub cycles: u64,
    /// Reason the most recent cycle aborted; cleared by the next success
    pub last_error: Option<String>,
    pub excluded: Vec<ExcludedDomain>,
}

impl Default for ProxyStatus {
    fn default() -> Self {
        Self {
            phase: CyclePhase::Idle,
            applied_hash: None,
            applied_at: None,
            last_cycle_at: None,
            cycles: 0,
            last_error: None,
            excluded: Vec::new(),
        }
    }
}

/// State owned by the apply critical section
#[derive(Debug, Default)]
struct ApplyState {
    /// Hash of the configuration the proxy is running
    applied: Option<String>,
    /// Hash and reason of the last configuration the checker rejected
    rejected: Option<(String, String)>,
}

pub struct Reconciler {
    stores: Stores,
    controller: Arc<dyn ProxyController>,
    cipher: SecretCipher,
    generator: GeneratorSettings,
    audit: Arc<dyn AuditLogger>,
    apply: tokio::sync::Mutex<ApplyState>,
    status: Mutex<ProxyStatus>,
}

impl Reconciler {
    pub fn new(
        stores: Stores,
        controller: Arc<dyn ProxyController>,
        cipher: SecretCipher,
        generator: GeneratorSettings,
        audit: Arc<dyn AuditLogger>,
    ) -> Self {
        Self {
            stores,
            controller,
            cipher,
            generator,
            audit,
            apply: tokio::sync::Mutex::new(ApplyState::default()),
            status: Mutex::new(ProxyStatus::default()),
        }
    }

    /// Seed the applied hash from the configuration the proxy already runs
    pub async fn load_live_config(&self) -> ControlResult<()> {
        let live = self.controller.live_config().await?;
        let hash = live.as_deref().map(config_hash);
        match &hash {
            Some(h) => info!(hash = %h, "Loaded live proxy configuration"),
            None => info!("No live proxy configuration yet"),
        }
        self.apply.lock().await.applied = hash.clone();
        self.update_status(|s| s.applied_hash = hash);
        Ok(())
    }

    pub fn status(&self) -> ProxyStatus {
        self.status
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    fn update_status(&self, f: impl FnOnce(&mut ProxyStatus)) {
        if let Ok(mut status) = self.status.lock() {
            f(&mut status);
        }
    }

    /// Active domains, plus verified domains that still have routes attached
    /// (their certificate expired), with their routes
    pub async fn desired_state(&self) -> ControlResult<DesiredState> {
        let domains = self
            .stores
            .domains
            .list_by_status(&[DomainStatus::Active, DomainStatus::Verified])
            .await?;
        let active_certs: HashSet<String> = self
            .stores
            .certificates
            .list_active()
            .await?
            .into_iter()
            .map(|c| c.id)
            .collect();

        let mut routes: HashMap<String, Vec<DesiredRoute>> = HashMap::new();
        for route in self.stores.routes.list_attached().await? {
            let Some(domain_id) = route.domain_id else {
                continue;
            };
            routes.entry(domain_id).or_default().push(DesiredRoute {
                path: route.path,
                service_id: route.service_id,
                port: i64::from(route.port),
                tls: route.tls,
            });
        }

        let domains = domains
            .into_iter()
            .filter_map(|d| {
                let routes = routes.remove(&d.id).unwrap_or_default();
                if d.status != DomainStatus::Active && routes.is_empty() {
                    return None;
                }
                let certificate_id = d
                    .certificate_id
                    .filter(|id| active_certs.contains(id));
                Some(DesiredDomain {
                    name: d.name,
                    certificate_id,
                    routes,
                })
            })
            .collect();

        Ok(DesiredState { domains })
    }

    /// Render the configuration the current state produces
    pub async fn render(&self) -> ControlResult<GeneratedConfig> {
        let desired = self.desired_state().await?;
        Ok(generate(&desired, &self.generator)?)
    }

    /// Write the certificate files a configuration references
    async fn install_certificates(&self, ids: &[String]) -> ControlResult<()> {
        for id in ids {
            let cert = self.stores.certificates.get(id).await?;
            let (Some(pem_cert), Some(ciphertext), Some(nonce)) =
                (&cert.pem_cert, &cert.encrypted_key, &cert.key_nonce)
            else {
                return Err(ControlError::Internal(format!(
                    "certificate {id} has no stored material"
                )));
            };
            let key_pem = self.cipher.decrypt_string(ciphertext, nonce)?;
            let mut fullchain_pem = pem_cert.clone();
            if let Some(chain) = cert.pem_chain.as_deref().filter(|c| !c.is_empty()) {
                if !fullchain_pem.ends_with('\n') {
                    fullchain_pem.push('\n');
                }
                fullchain_pem.push_str(chain);
            }
            self.controller
                .install_certificate(&CertificateFiles {
                    certificate_id: cert.id.clone(),
                    fullchain_pem,
                    key_pem,
                })
                .await?;
        }
        Ok(())
    }

    /// Render, install certificates and run the proxy's checker without applying.
    ///
    /// Passing the check lifts a previous rejection of the same configuration.
    pub async fn validate_config(&self) -> ControlResult<GeneratedConfig> {
        let mut state = self.apply.lock().await;
        let generated = self.render().await?;
        self.install_certificates(&generated.certificate_ids).await?;
        self.controller.validate(&generated.text).await?;
        if state
            .rejected
            .as_ref()
            .is_some_and(|(hash, _)| *hash == generated.hash)
        {
            info!(hash = %generated.hash, "Previously rejected configuration now passes validation");
            state.rejected = None;
        }
        Ok(generated)
    }

    /// One reconciliation cycle; `force` applies even when the hash is unchanged
    pub async fn reconcile_once(&self, force: bool) -> ControlResult<CycleOutcome> {
        let mut state = self.apply.lock().await;
        let started = Utc::now();

        self.update_status(|s| s.phase = CyclePhase::Computing);
        let generated = match self.render().await {
            Ok(generated) => generated,
            Err(e) => return Ok(self.abort(started, e.to_string())),
        };
        self.update_status(|s| s.excluded = generated.excluded.clone());
        for excluded in &generated.excluded {
            debug!(domain = %excluded.name, reason = %excluded.reason, "Domain excluded from proxy configuration");
        }

        if !force && state.applied.as_deref() == Some(generated.hash.as_str()) {
            self.update_status(|s| {
                s.phase = CyclePhase::Idle;
                s.last_cycle_at = Some(started);
                s.cycles += 1;
            });
            return Ok(CycleOutcome::Unchanged {
                hash: generated.hash,
            });
        }

        let known_rejection = state
            .rejected
            .as_ref()
            .filter(|(hash, _)| !force && *hash == generated.hash)
            .map(|(_, reason)| reason.clone());
        if let Some(reason) = known_rejection {
            debug!(hash = %generated.hash, "Configuration was already rejected, waiting for a change");
            self.update_status(|s| {
                s.phase = CyclePhase::Idle;
                s.last_cycle_at = Some(started);
                s.cycles += 1;
                s.last_error = Some(reason.clone());
            });
            return Ok(CycleOutcome::Aborted { reason });
        }

        self.update_status(|s| s.phase = CyclePhase::Validating);
        if let Err(e) = self.install_certificates(&generated.certificate_ids).await {
            return Ok(self.abort(started, e.to_string()));
        }
        if let Err(e) = self.controller.validate(&generated.text).await {
            if matches!(e, ProxyError::Rejected(_)) {
                state.rejected = Some((generated.hash.clone(), e.to_string()));
            }
            return Ok(self.abort(started, e.to_string()));
        }

        self.update_status(|s| s.phase = CyclePhase::Applying);
        if let Err(e) = self.controller.apply(&generated.text).await {
            return Ok(self.abort(started, e.to_string()));
        }

        state.applied = Some(generated.hash.clone());
        state.rejected = None;
        let now = Utc::now();
        self.update_status(|s| {
            s.phase = CyclePhase::Idle;
            s.applied_hash = Some(generated.hash.clone());
            s.applied_at = Some(now);
            s.last_cycle_at = Some(started);
            s.cycles += 1;
            s.last_error = None;
        });
        info!(
            hash = %generated.hash,
            certificates = generated.certificate_ids.len(),
            elapsed_ms = (now - started).num_milliseconds(),
            "Proxy configuration applied"
        );
        self.audit.record(AuditEvent::ConfigApplied {
            hash: generated.hash.clone(),
        });
        Ok(CycleOutcome::Applied {
            hash: generated.hash,
        })
    }

    fn abort(&self, started: DateTime<Utc>, reason: String) -> CycleOutcome {
        warn!(reason = %reason, "Reconciliation aborted, previous configuration stays in effect");
        self.update_status(|s| {
            s.phase = CyclePhase::Idle;
            s.last_cycle_at = Some(started);
            s.cycles += 1;
            s.last_error = Some(reason.clone());
        });
        self.audit.record(AuditEvent::ConfigRejected {
            reason: reason.clone(),
        });
        CycleOutcome::Aborted { reason }
    }

    /// Apply regardless of the last applied hash
    pub async fn force_apply(&self) -> ControlResult<CycleOutcome> {
        self.reconcile_once(true).await
    }

    /// Run cycles on every tick and every store change until `shutdown`.
    ///
    /// A cycle in progress always completes; changes signalled meanwhile
    /// collapse into one follow-up cycle.
    pub async fn run(self: Arc<Self>, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_secs = interval.as_secs(), "Reconciler started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
                _ = self.stores.signal.notified() => {
                    debug!("Store changed, reconciling");
                }
            }
            if let Err(e) = self.reconcile_once(false).await {
                error!(error = %e, "Reconciliation cycle failed");
            }
        }

        info!("Reconciler stopped");
    }
}
