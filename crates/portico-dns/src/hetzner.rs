//! Hetzner DNS provider
//!
//! Uses the Hetzner DNS API to manage verification and challenge records.
//! API documentation: <https://dns.hetzner.com/api-docs>

use std::time::Duration;

use dashmap::DashMap;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::provider::{
    record_name_for_zone, request_error, retry_after_secs, status_error, zone_candidates,
    DnsProviderError, DnsRecord, DnsResult,
};

/// Hetzner DNS API base URL
pub const HETZNER_API_BASE: &str = "https://dns.hetzner.com/api/v1";

/// Hetzner DNS provider
#[derive(Debug)]
pub struct HetznerProvider {
    client: Client,
    token: String,
    base_url: String,
    timeout: Duration,
    /// Cache of zone id -> zone name
    zone_names: DashMap<String, String>,
}

impl HetznerProvider {
    pub fn new(token: &str, timeout: Duration) -> DnsResult<Self> {
        if token.trim().is_empty() {
            return Err(DnsProviderError::Configuration(
                "Hetzner API token is empty".to_string(),
            ));
        }
        let client = Client::builder().timeout(timeout).build().map_err(|e| {
            DnsProviderError::Configuration(format!("Failed to create HTTP client: {}", e))
        })?;

        Ok(Self {
            client,
            token: token.to_string(),
            base_url: HETZNER_API_BASE.to_string(),
            timeout,
            zone_names: DashMap::new(),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    async fn list_zones(&self) -> DnsResult<Vec<Zone>> {
        let response = self
            .client
            .get(format!("{}/zones", self.base_url))
            .header("Auth-API-Token", &self.token)
            .send()
            .await
            .map_err(|e| request_error(e, self.timeout, "Failed to list zones"))?;

        if !response.status().is_success() {
            let status = response.status();
            let retry_after = retry_after_secs(&response);
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, retry_after, "Failed to list zones", body));
        }

        let zones: ZonesResponse = response.json().await.map_err(|e| {
            DnsProviderError::ApiRequest(format!("Failed to parse zones response: {}", e))
        })?;
        for zone in &zones.zones {
            self.zone_names.insert(zone.id.clone(), zone.name.clone());
        }
        Ok(zones.zones)
    }

    /// Zone (id, name) holding `name`
    async fn zone_for(&self, zone_id: Option<&str>, name: &str) -> DnsResult<(String, String)> {
        if let Some(id) = zone_id {
            if let Some(zone_name) = self.zone_names.get(id) {
                trace!(zone_id = %id, "Zone name found in cache");
                return Ok((id.to_string(), zone_name.value().clone()));
            }
        }

        let zones = self.list_zones().await?;
        if let Some(id) = zone_id {
            return zones
                .into_iter()
                .find(|z| z.id == id)
                .map(|z| (z.id, z.name))
                .ok_or_else(|| DnsProviderError::ZoneNotFound {
                    domain: name.to_string(),
                });
        }

        for candidate in zone_candidates(name) {
            if let Some(zone) = zones.iter().find(|z| z.name == candidate) {
                debug!(name = %name, zone_id = %zone.id, zone_name = %zone.name, "Found zone for record");
                return Ok((zone.id.clone(), zone.name.clone()));
            }
        }

        Err(DnsProviderError::ZoneNotFound {
            domain: name.to_string(),
        })
    }

    pub async fn create_record(&self, zone_id: Option<&str>, record: &DnsRecord) -> DnsResult<String> {
        let (zone_id, zone_name) = self.zone_for(zone_id, &record.name).await?;
        let relative_name = record_name_for_zone(&record.name, &zone_name);

        debug!(
            zone_id = %zone_id,
            kind = %record.kind,
            record_name = %relative_name,
            "Creating Hetzner record"
        );

        let request = CreateRecordRequest {
            zone_id: &zone_id,
            name: &relative_name,
            r#type: record.kind.as_str(),
            value: &record.value,
            ttl: Some(record.ttl),
        };

        let response = self
            .client
            .post(format!("{}/records", self.base_url))
            .header("Auth-API-Token", &self.token)
            .json(&request)
            .send()
            .await
            .map_err(|e| request_error(e, self.timeout, "Failed to create record"))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = retry_after_secs(&response);
            let body = response.text().await.unwrap_or_default();
            return Err(match status_error(status, retry_after, "Failed to create record", body) {
                DnsProviderError::ApiRequest(message) if status.is_client_error() => {
                    DnsProviderError::RecordCreation {
                        kind: record.kind.as_str(),
                        record_name: relative_name,
                        message,
                    }
                }
                other => other,
            });
        }

        let created: RecordResponse =
            response
                .json()
                .await
                .map_err(|e| DnsProviderError::RecordCreation {
                    kind: record.kind.as_str(),
                    record_name: relative_name.clone(),
                    message: format!("Failed to parse response: {}", e),
                })?;

        debug!(record_id = %created.record.id, "Hetzner record created");
        Ok(created.record.id)
    }

    pub async fn delete_record(&self, record_id: &str) -> DnsResult<()> {
        debug!(record_id = %record_id, "Deleting Hetzner record");

        let response = self
            .client
            .delete(format!("{}/records/{}", self.base_url, record_id))
            .header("Auth-API-Token", &self.token)
            .send()
            .await
            .map_err(|e| request_error(e, self.timeout, "Failed to delete record"))?;

        // 404 is fine - record might already be deleted
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            debug!(record_id = %record_id, "Record already deleted");
            return Ok(());
        }

        if !status.is_success() {
            let retry_after = retry_after_secs(&response);
            let body = response.text().await.unwrap_or_default();
            return Err(match status_error(status, retry_after, "Failed to delete record", body) {
                DnsProviderError::ApiRequest(message) if status.is_client_error() => {
                    DnsProviderError::RecordDeletion {
                        record_id: record_id.to_string(),
                        message,
                    }
                }
                other => other,
            });
        }

        Ok(())
    }
}

// Hetzner API types

#[derive(Debug, Deserialize)]
struct ZonesResponse {
    zones: Vec<Zone>,
}

#[derive(Debug, Deserialize)]
struct Zone {
    id: String,
    name: String,
}

#[derive(Debug, Serialize)]
struct CreateRecordRequest<'a> {
    zone_id: &'a str,
    name: &'a str,
    r#type: &'static str,
    value: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    ttl: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct RecordResponse {
    record: Record,
}

#[derive(Debug, Deserialize)]
struct Record {
    id: String,
}
