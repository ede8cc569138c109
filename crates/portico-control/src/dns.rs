//! DNS provider wiring: adapters built from stored credentials and the
//! DNS-01 challenge responder

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use portico_cert::{AcmeError, ChallengeResponder, PendingChallenge, SecretCipher};
use portico_db::entities::dns_provider::{self, DnsProviderKind};
use portico_dns::{
    CloudflareProvider, DnsLookup, DnsProviderAdapter, DnsRecord, HetznerProvider,
    PropagationConfig, Provisioned, RecordKind,
};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::DnsSettings;
use crate::error::ControlError;

/// Builds provider adapters, decrypting API tokens on demand
#[derive(Clone)]
pub struct ProviderFactory {
    cipher: SecretCipher,
    settings: DnsSettings,
}

impl ProviderFactory {
    pub fn new(cipher: SecretCipher, settings: DnsSettings) -> Self {
        Self { cipher, settings }
    }

    pub fn build(&self, provider: &dns_provider::Model) -> Result<DnsProviderAdapter, ControlError> {
        if !provider.active {
            return Err(ControlError::Validation(format!(
                "DNS provider {} is disabled",
                provider.name
            )));
        }
        if provider.kind == DnsProviderKind::Manual {
            return Ok(DnsProviderAdapter::manual());
        }

        let (Some(ciphertext), Some(nonce)) =
            (&provider.encrypted_api_token, &provider.token_nonce)
        else {
            return Err(ControlError::Validation(format!(
                "DNS provider {} has no API token",
                provider.name
            )));
        };
        let token = self.cipher.decrypt_string(ciphertext, nonce)?;
        let timeout = self.settings.api_timeout();

        let adapter = match provider.kind {
            DnsProviderKind::Cloudflare => {
                let mut p = CloudflareProvider::new(&token, timeout)?;
                if let Some(base) = &self.settings.cloudflare_api_base {
                    p = p.with_base_url(base.clone());
                }
                DnsProviderAdapter::Cloudflare(p)
            }
            DnsProviderKind::Hetzner => {
                let mut p = HetznerProvider::new(&token, timeout)?;
                if let Some(base) = &self.settings.hetzner_api_base {
                    p = p.with_base_url(base.clone());
                }
                DnsProviderAdapter::Hetzner(p)
            }
            DnsProviderKind::Manual => DnsProviderAdapter::manual(),
        };
        Ok(adapter)
    }
}

/// Answers DNS-01 challenges through a provider and waits for propagation
pub struct DnsChallengeResponder {
    adapter: DnsProviderAdapter,
    zone_id: Option<String>,
    lookup: Arc<dyn DnsLookup>,
    propagation: PropagationConfig,
    /// record name + value -> provider record id, for cleanup
    created: Mutex<HashMap<(String, String), String>>,
}

impl DnsChallengeResponder {
    pub fn new(
        adapter: DnsProviderAdapter,
        zone_id: Option<String>,
        lookup: Arc<dyn DnsLookup>,
        propagation: PropagationConfig,
    ) -> Self {
        Self {
            adapter,
            zone_id,
            lookup,
            propagation,
            created: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl ChallengeResponder for DnsChallengeResponder {
    async fn present(&self, challenge: &PendingChallenge) -> Result<(), AcmeError> {
        let PendingChallenge::Dns01 {
            domain,
            record_name,
            value,
        } = challenge
        else {
            return Err(AcmeError::Responder(
                "DNS provider can only answer DNS-01 challenges".to_string(),
            ));
        };

        let record = DnsRecord::new(RecordKind::Txt, record_name.clone(), value.clone());
        let provisioned = self
            .adapter
            .create_record(self.zone_id.as_deref(), &record)
            .await
            .map_err(|e| AcmeError::Responder(e.to_string()))?;
        match provisioned {
            Provisioned::Created { record_id } => {
                self.created
                    .lock()
                    .await
                    .insert((record.name.clone(), record.value.clone()), record_id);
            }
            Provisioned::Manual { instructions } => {
                return Err(AcmeError::Responder(format!(
                    "DNS-01 needs a manual record: {instructions}"
                )));
            }
        }

        self.adapter
            .verify_propagation(self.lookup.as_ref(), &record, &self.propagation)
            .await
            .map_err(|e| AcmeError::Responder(format!("{record_name}: {e}")))?;

        debug!(domain = %domain, record = %record.name, "DNS-01 challenge published");
        Ok(())
    }

    async fn cleanup(&self, challenge: &PendingChallenge) -> Result<(), AcmeError> {
        let PendingChallenge::Dns01 {
            record_name, value, ..
        } = challenge
        else {
            return Ok(());
        };
        let key = (portico_dns::normalize_name(record_name), value.clone());
        let Some(record_id) = self.created.lock().await.remove(&key) else {
            return Ok(());
        };
        if let Err(e) = self
            .adapter
            .delete_record(self.zone_id.as_deref(), record_name, &record_id)
            .await
        {
            warn!(record = %record_name, error = %e, "Failed to remove DNS-01 record");
            return Err(AcmeError::Responder(e.to_string()));
        }
        Ok(())
    }
}
