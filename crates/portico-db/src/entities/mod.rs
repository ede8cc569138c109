//! Database entities

pub mod certificate;
pub mod dns_provider;
pub mod domain;
pub mod domain_verification;
pub mod route;

pub use certificate::Entity as Certificate;
pub use dns_provider::Entity as DnsProvider;
pub use domain::Entity as Domain;
pub use domain_verification::Entity as DomainVerification;
pub use route::Entity as Route;

pub mod prelude {
    pub use super::certificate::{CertificateStatus, CertificateType, Entity as Certificate};
    pub use super::dns_provider::{DnsProviderKind, Entity as DnsProvider};
    pub use super::domain::{DomainStatus, Entity as Domain, VerificationMethod};
    pub use super::domain_verification::{Entity as DomainVerification, VerificationStatus};
    pub use super::route::Entity as Route;
}
