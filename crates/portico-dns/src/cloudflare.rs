//! Cloudflare DNS provider
//!
//! Uses the Cloudflare v4 API with a scoped API token.
//! API documentation: <https://developers.cloudflare.com/api/>

use std::time::Duration;

use dashmap::DashMap;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::provider::{
    request_error, retry_after_secs, status_error, zone_candidates, DnsProviderError, DnsRecord,
    DnsResult,
};

/// Cloudflare API base URL
pub const CLOUDFLARE_API_BASE: &str = "https://api.cloudflare.com/client/v4";

/// Cloudflare DNS provider
#[derive(Debug)]
pub struct CloudflareProvider {
    client: Client,
    token: String,
    base_url: String,
    timeout: Duration,
    /// Cache of record name -> zone id
    zone_cache: DashMap<String, String>,
}

impl CloudflareProvider {
    pub fn new(token: &str, timeout: Duration) -> DnsResult<Self> {
        if token.trim().is_empty() {
            return Err(DnsProviderError::Configuration(
                "Cloudflare API token is empty".to_string(),
            ));
        }
        let client = Client::builder().timeout(timeout).build().map_err(|e| {
            DnsProviderError::Configuration(format!("Failed to create HTTP client: {}", e))
        })?;

        Ok(Self {
            client,
            token: token.to_string(),
            base_url: CLOUDFLARE_API_BASE.to_string(),
            timeout,
            zone_cache: DashMap::new(),
        })
    }

    /// Point the provider at a different API endpoint
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Resolve the zone holding `name`, walking up parent labels
    pub async fn zone_id_for(&self, name: &str) -> DnsResult<String> {
        if let Some(zone_id) = self.zone_cache.get(name) {
            trace!(name = %name, zone_id = %zone_id.value(), "Zone ID found in cache");
            return Ok(zone_id.value().clone());
        }

        for candidate in zone_candidates(name) {
            let response = self
                .client
                .get(format!("{}/zones", self.base_url))
                .query(&[("name", candidate.as_str())])
                .bearer_auth(&self.token)
                .send()
                .await
                .map_err(|e| request_error(e, self.timeout, "Failed to list zones"))?;

            if !response.status().is_success() {
                let status = response.status();
                let retry_after = retry_after_secs(&response);
                let body = response.text().await.unwrap_or_default();
                return Err(status_error(status, retry_after, "Failed to list zones", body));
            }

            let zones: Envelope<Vec<Zone>> = response.json().await.map_err(|e| {
                DnsProviderError::ApiRequest(format!("Failed to parse zones response: {}", e))
            })?;

            if let Some(zone) = zones.result.into_iter().flatten().next() {
                debug!(name = %name, zone_id = %zone.id, zone_name = %zone.name, "Found zone for record");
                self.zone_cache.insert(name.to_string(), zone.id.clone());
                return Ok(zone.id);
            }
        }

        Err(DnsProviderError::ZoneNotFound {
            domain: name.to_string(),
        })
    }

    /// Create a record, returning the provider record id
    pub async fn create_record(&self, zone_id: Option<&str>, record: &DnsRecord) -> DnsResult<String> {
        let zone_id = match zone_id {
            Some(id) => id.to_string(),
            None => self.zone_id_for(&record.name).await?,
        };

        debug!(
            zone_id = %zone_id,
            kind = %record.kind,
            record_name = %record.name,
            "Creating Cloudflare record"
        );

        let request = CreateRecordRequest {
            r#type: record.kind.as_str(),
            name: &record.name,
            content: &record.value,
            ttl: record.ttl,
        };

        let response = self
            .client
            .post(format!("{}/zones/{}/dns_records", self.base_url, zone_id))
            .bearer_auth(&self.token)
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
                        record_name: record.name.clone(),
                        message,
                    }
                }
                other => other,
            });
        }

        let created: Envelope<Record> =
            response
                .json()
                .await
                .map_err(|e| DnsProviderError::RecordCreation {
                    kind: record.kind.as_str(),
                    record_name: record.name.clone(),
                    message: format!("Failed to parse response: {}", e),
                })?;

        match created.result {
            Some(r) if created.success => {
                debug!(record_id = %r.id, "Cloudflare record created");
                Ok(r.id)
            }
            _ => Err(DnsProviderError::RecordCreation {
                kind: record.kind.as_str(),
                record_name: record.name.clone(),
                message: created.error_summary(),
            }),
        }
    }

    /// Delete a record; a missing record counts as deleted
    pub async fn delete_record(&self, zone_id: &str, record_id: &str) -> DnsResult<()> {
        debug!(zone_id = %zone_id, record_id = %record_id, "Deleting Cloudflare record");

        let response = self
            .client
            .delete(format!(
                "{}/zones/{}/dns_records/{}",
                self.base_url, zone_id, record_id
            ))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| request_error(e, self.timeout, "Failed to delete record"))?;

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

// Cloudflare API types

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    errors: Vec<ApiMessage>,
    result: Option<T>,
}

impl<T> Envelope<T> {
    fn error_summary(&self) -> String {
        if self.errors.is_empty() {
            return "request was not successful".to_string();
        }
        self.errors
            .iter()
            .map(|e| format!("{}: {}", e.code, e.message))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct Zone {
    id: String,
    name: String,
}

#[derive(Debug, Serialize)]
struct CreateRecordRequest<'a> {
    r#type: &'static str,
    name: &'a str,
    content: &'a str,
    ttl: u32,
}

#[derive(Debug, Deserialize)]
struct Record {
    id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_token_rejected() {
        let err = CloudflareProvider::new("  ", Duration::from_secs(5)).unwrap_err();
        assert!(matches!(err, DnsProviderError::Configuration(_)));
    }

    #[test]
    fn test_error_summary() {
        let envelope: Envelope<Record> = serde_json::from_str(
            r#"{"success":false,"errors":[{"code":81057,"message":"Record already exists."}],"result":null}"#,
        )
        .unwrap();
        assert_eq!(envelope.error_summary(), "81057: Record already exists.");
    }
}
