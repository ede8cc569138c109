//! Portico control plane
//!
//! Drives custom domains from creation to serving traffic over HTTPS:
//!
//! - [`verification`] proves DNS control with exponential backoff
//! - [`lifecycle`] issues, uploads, renews, expires and rolls back certificates
//! - [`reconciler`] keeps the proxy configuration equal to the stored state
//! - [`scheduler`] dispatches per-domain work onto a bounded task pool
//!
//! [`ControlPlane`] ties them together for the API and the CLI.

pub mod audit;
pub mod config;
pub mod dns;
pub mod error;
pub mod lifecycle;
pub mod plane;
pub mod reconciler;
pub mod retry;
pub mod scheduler;
pub mod services;
pub mod tasks;
pub mod verification;

pub use audit::{AuditEvent, AuditLogger, TracingAuditLogger};
pub use config::{Settings, SettingsError};
pub use error::{ControlError, ControlResult};
pub use lifecycle::{CertificateManager, SweepReport, UploadRequest};
pub use plane::{
    normalize_domain_name, AttachRoute, Components, ControlPlane, CreateDomain, CreateProvider,
    DomainDetails,
};
pub use reconciler::{CycleOutcome, CyclePhase, ProxyStatus, Reconciler};
pub use retry::{RetryError, RetryPolicy};
pub use scheduler::{Scheduler, TickReport};
pub use services::{ServiceInfo, ServiceStore, StaticServiceStore};
pub use tasks::TaskTracker;
pub use verification::{VerificationEngine, VerifyOutcome};
