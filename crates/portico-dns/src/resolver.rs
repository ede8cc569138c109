//! Public DNS lookups used to verify ownership and challenge propagation

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use async_trait::async_trait;
use hickory_resolver::config::{NameServerConfigGroup, ResolverConfig, ResolverOpts};
use hickory_resolver::error::{ResolveError, ResolveErrorKind};
use hickory_resolver::proto::rr::{RData, RecordType};
use hickory_resolver::TokioAsyncResolver;
use tracing::trace;

use crate::provider::{normalize_name, DnsProviderError, DnsRecord, DnsResult, RecordKind};

/// Record lookups against public DNS
///
/// Missing records (NXDOMAIN, empty answer) are an empty result, not an error.
#[async_trait]
pub trait DnsLookup: Send + Sync {
    async fn txt(&self, name: &str) -> DnsResult<Vec<String>>;
    async fn a(&self, name: &str) -> DnsResult<Vec<Ipv4Addr>>;
    async fn cname(&self, name: &str) -> DnsResult<Vec<String>>;
}

/// Whether `record` is currently visible through `lookup`
pub async fn record_present(lookup: &dyn DnsLookup, record: &DnsRecord) -> DnsResult<bool> {
    let expected = record.value.trim();
    let found = match record.kind {
        RecordKind::Txt => lookup
            .txt(&record.name)
            .await?
            .iter()
            .any(|v| v.trim() == expected),
        RecordKind::A => lookup
            .a(&record.name)
            .await?
            .iter()
            .any(|ip| ip.to_string() == expected),
        RecordKind::Cname => {
            let target = normalize_name(expected);
            lookup
                .cname(&record.name)
                .await?
                .iter()
                .any(|c| normalize_name(c) == target)
        }
    };
    trace!(record = %record.name, kind = %record.kind, found, "Checked record");
    Ok(found)
}

/// `DnsLookup` backed by hickory with caching disabled
pub struct HickoryLookup {
    resolver: TokioAsyncResolver,
}

impl HickoryLookup {
    /// Query the given nameservers; an empty list uses the system configuration
    pub fn new(nameservers: &[IpAddr], timeout: Duration) -> DnsResult<Self> {
        let (config, mut opts) = if nameservers.is_empty() {
            hickory_resolver::system_conf::read_system_conf().map_err(|e| {
                DnsProviderError::Configuration(format!("Failed to read resolver config: {}", e))
            })?
        } else {
            let group = NameServerConfigGroup::from_ips_clear(nameservers, 53, true);
            (
                ResolverConfig::from_parts(None, vec![], group),
                ResolverOpts::default(),
            )
        };
        opts.timeout = timeout;
        opts.attempts = 2;
        // Verification must observe fresh answers
        opts.cache_size = 0;

        Ok(Self {
            resolver: TokioAsyncResolver::tokio(config, opts),
        })
    }
}

impl std::fmt::Debug for HickoryLookup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HickoryLookup").finish_non_exhaustive()
    }
}

fn lookup_error(name: &str, err: ResolveError) -> DnsResult<()> {
    match err.kind() {
        ResolveErrorKind::NoRecordsFound { .. } => Ok(()),
        _ => Err(DnsProviderError::Lookup {
            name: name.to_string(),
            message: err.to_string(),
        }),
    }
}

#[async_trait]
impl DnsLookup for HickoryLookup {
    async fn txt(&self, name: &str) -> DnsResult<Vec<String>> {
        match self.resolver.txt_lookup(name).await {
            Ok(records) => Ok(records
                .iter()
                .map(|txt| {
                    // TXT records can carry several strings; they form one value
                    txt.txt_data()
                        .iter()
                        .map(|data| String::from_utf8_lossy(data))
                        .collect::<String>()
                })
                .collect()),
            Err(e) => lookup_error(name, e).map(|_| Vec::new()),
        }
    }

    async fn a(&self, name: &str) -> DnsResult<Vec<Ipv4Addr>> {
        match self.resolver.ipv4_lookup(name).await {
            Ok(records) => Ok(records.iter().map(|a| a.0).collect()),
            Err(e) => lookup_error(name, e).map(|_| Vec::new()),
        }
    }

    async fn cname(&self, name: &str) -> DnsResult<Vec<String>> {
        match self.resolver.lookup(name, RecordType::CNAME).await {
            Ok(lookup) => Ok(lookup
                .iter()
                .filter_map(|rdata| match rdata {
                    RData::CNAME(target) => Some(target.0.to_utf8()),
                    _ => None,
                })
                .collect()),
            Err(e) => lookup_error(name, e).map(|_| Vec::new()),
        }
    }
}
