//! Uniform interface over the supported DNS providers

use std::time::Duration;

use tracing::{debug, info};

use crate::cloudflare::CloudflareProvider;
use crate::hetzner::HetznerProvider;
use crate::propagation::{wait_for_propagation, PropagationConfig};
use crate::provider::{normalize_name, DnsRecord, DnsResult, Provisioned};
use crate::resolver::DnsLookup;

/// A configured DNS provider
///
/// `Manual` never calls out; record creation returns instructions for the
/// operator instead.
#[derive(Debug)]
pub enum DnsProviderAdapter {
    Cloudflare(CloudflareProvider),
    Hetzner(HetznerProvider),
    Manual,
}

impl DnsProviderAdapter {
    pub fn cloudflare(token: &str, timeout: Duration) -> DnsResult<Self> {
        Ok(Self::Cloudflare(CloudflareProvider::new(token, timeout)?))
    }

    pub fn hetzner(token: &str, timeout: Duration) -> DnsResult<Self> {
        Ok(Self::Hetzner(HetznerProvider::new(token, timeout)?))
    }

    pub fn manual() -> Self {
        Self::Manual
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Cloudflare(_) => "cloudflare",
            Self::Hetzner(_) => "hetzner",
            Self::Manual => "manual",
        }
    }

    pub fn is_manual(&self) -> bool {
        matches!(self, Self::Manual)
    }

    /// Create `record`, or describe it when the provider is manual
    pub async fn create_record(
        &self,
        zone_id: Option<&str>,
        record: &DnsRecord,
    ) -> DnsResult<Provisioned> {
        let record_id = match self {
            Self::Cloudflare(p) => p.create_record(zone_id, record).await?,
            Self::Hetzner(p) => p.create_record(zone_id, record).await?,
            Self::Manual => {
                debug!(record = %record.name, "Manual provider, returning instructions");
                return Ok(Provisioned::Manual {
                    instructions: record.instructions(),
                });
            }
        };
        info!(
            provider = self.name(),
            record = %record.name,
            kind = %record.kind,
            record_id = %record_id,
            "DNS record created"
        );
        Ok(Provisioned::Created { record_id })
    }

    /// Remove a previously created record
    ///
    /// `record_name` locates the zone when `zone_id` is unknown.
    pub async fn delete_record(
        &self,
        zone_id: Option<&str>,
        record_name: &str,
        record_id: &str,
    ) -> DnsResult<()> {
        match self {
            Self::Cloudflare(p) => {
                let zone_id = match zone_id {
                    Some(id) => id.to_string(),
                    None => p.zone_id_for(&normalize_name(record_name)).await?,
                };
                p.delete_record(&zone_id, record_id).await
            }
            Self::Hetzner(p) => p.delete_record(record_id).await,
            Self::Manual => Ok(()),
        }
    }

    /// Wait until `record` is visible in public DNS
    pub async fn verify_propagation(
        &self,
        lookup: &dyn DnsLookup,
        record: &DnsRecord,
        config: &PropagationConfig,
    ) -> DnsResult<()> {
        wait_for_propagation(lookup, record, config).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::RecordKind;

    #[tokio::test]
    async fn test_manual_returns_instructions() {
        let adapter = DnsProviderAdapter::manual();
        let record = DnsRecord::new(RecordKind::Txt, "_portico.shop.example.com", "abc");

        match adapter.create_record(None, &record).await.unwrap() {
            Provisioned::Manual { instructions } => {
                assert!(instructions.contains("_portico.shop.example.com"));
                assert!(instructions.contains("abc"));
            }
            other => panic!("unexpected {other:?}"),
        }
        adapter
            .delete_record(None, "_portico.shop.example.com", "anything")
            .await
            .unwrap();
    }

    #[test]
    fn test_token_required() {
        assert!(DnsProviderAdapter::cloudflare("", Duration::from_secs(1)).is_err());
        assert!(DnsProviderAdapter::hetzner("", Duration::from_secs(1)).is_err());
        assert_eq!(DnsProviderAdapter::manual().name(), "manual");
    }
}
