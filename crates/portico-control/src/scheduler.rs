//! Periodic dispatch of verification, issuance and the renewal sweep

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use portico_db::Stores;
use tokio::sync::Mutex;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::ControlResult;
use crate::lifecycle::CertificateManager;
use crate::tasks::TaskTracker;
use crate::verification::{VerificationEngine, VerifyOutcome};

/// Work started by one tick
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub verifications: usize,
    /// Certificates opened for verified auto-managed domains
    pub requested: usize,
    pub issuances: usize,
    pub expired: usize,
    pub renewals: usize,
}

pub struct Scheduler {
    stores: Stores,
    verification: Arc<VerificationEngine>,
    certificates: Arc<CertificateManager>,
    tasks: Arc<TaskTracker>,
    sweep_interval: Duration,
    last_sweep: Mutex<Option<Instant>>,
}

impl Scheduler {
    pub fn new(
        stores: Stores,
        verification: Arc<VerificationEngine>,
        certificates: Arc<CertificateManager>,
        tasks: Arc<TaskTracker>,
        sweep_interval: Duration,
    ) -> Self {
        Self {
            stores,
            verification,
            certificates,
            tasks,
            sweep_interval,
            last_sweep: Mutex::new(None),
        }
    }

    /// Spawn a verification task for `domain_id`; `false` if one is in flight
    pub fn dispatch_verification(&self, domain_id: &str) -> bool {
        let engine = self.verification.clone();
        let id = domain_id.to_string();
        self.tasks.spawn(domain_id, "verification", async move {
            match engine.verify(&id).await {
                Ok(VerifyOutcome::Verified(status)) => {
                    debug!(domain_id = %id, status = status.as_str(), "Verification task finished")
                }
                Ok(outcome) => debug!(domain_id = %id, ?outcome, "Verification task finished"),
                Err(e) => warn!(domain_id = %id, error = %e, "Verification task failed"),
            }
        })
    }

    /// Spawn an issuance task for a pending certificate of `domain_id`
    pub fn dispatch_issuance(&self, domain_id: &str, certificate_id: &str) -> bool {
        let manager = self.certificates.clone();
        let cert_id = certificate_id.to_string();
        self.tasks.spawn(domain_id, "issuance", async move {
            if let Err(e) = manager.issue(&cert_id).await {
                warn!(certificate_id = %cert_id, error = %e, transient = e.is_transient(), "Issuance task failed");
            }
        })
    }

    async fn sweep_due(&self) -> bool {
        let mut last = self.last_sweep.lock().await;
        let due = last.map_or(true, |at| at.elapsed() >= self.sweep_interval);
        if due {
            *last = Some(Instant::now());
        }
        due
    }

    /// One scheduling pass
    pub async fn tick(&self, now: DateTime<Utc>) -> ControlResult<TickReport> {
        let mut report = TickReport::default();

        if self.sweep_due().await {
            let sweep = self.certificates.sweep(now).await?;
            report.expired = sweep.expired.len();
            report.renewals = sweep.renewals.len();
        }

        report.requested = self
            .certificates
            .request_for_verified_domains()
            .await?
            .len();

        for domain in self.stores.domains.due_for_verification(now).await? {
            if self.dispatch_verification(&domain.id) {
                report.verifications += 1;
            }
        }

        for cert in self.stores.certificates.due_for_issuance(now).await? {
            if self.dispatch_issuance(&cert.domain_id, &cert.id) {
                report.issuances += 1;
            }
        }

        if report != TickReport::default() {
            debug!(?report, "Scheduler tick");
        }
        Ok(report)
    }

    /// Tick every `interval` until `shutdown`
    pub async fn run(self: Arc<Self>, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_secs = interval.as_secs(), "Scheduler started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.tick(Utc::now()).await {
                error!(error = %e, "Scheduler tick failed");
            }
        }

        info!("Scheduler stopped");
    }
}
