//! DNS provider adapters and public DNS verification for Portico
//!
//! Providers create and delete the records used for ownership verification
//! and ACME DNS-01 challenges. Lookups go through [`DnsLookup`] so engines can
//! be driven by an in-memory table in tests.

pub mod adapter;
pub mod cloudflare;
pub mod hetzner;
pub mod propagation;
pub mod provider;
pub mod resolver;

pub use adapter::DnsProviderAdapter;
pub use cloudflare::CloudflareProvider;
pub use hetzner::HetznerProvider;
pub use propagation::{wait_for_propagation, PropagationConfig};
pub use provider::{
    challenge_record_fqdn, normalize_name, DnsProviderError, DnsRecord, DnsResult, Provisioned,
    RecordKind, ACME_CHALLENGE_RECORD, CHALLENGE_TTL,
};
pub use resolver::{record_present, DnsLookup, HickoryLookup};
