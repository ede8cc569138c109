//! Waiting for records to become visible in public DNS

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::provider::{DnsProviderError, DnsRecord, DnsResult};
use crate::resolver::{record_present, DnsLookup};

/// Configuration for propagation checking
#[derive(Debug, Clone)]
pub struct PropagationConfig {
    /// Delay before first check
    pub initial_delay: Duration,
    /// Interval between checks
    pub check_interval: Duration,
    /// Maximum time to wait for propagation
    pub timeout: Duration,
}

impl Default for PropagationConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(10),
            check_interval: Duration::from_secs(5),
            timeout: Duration::from_secs(120),
        }
    }
}

/// Poll until `record` resolves with its expected value
///
/// Lookup errors are logged and retried until the deadline; the deadline
/// yields `DnsProviderError::Timeout`.
pub async fn wait_for_propagation(
    lookup: &dyn DnsLookup,
    record: &DnsRecord,
    config: &PropagationConfig,
) -> DnsResult<()> {
    let start = Instant::now();
    let deadline = start + config.timeout;

    debug!(
        record = %record.name,
        kind = %record.kind,
        timeout_secs = config.timeout.as_secs(),
        "Waiting for DNS propagation"
    );

    tokio::time::sleep(config.initial_delay).await;

    loop {
        match record_present(lookup, record).await {
            Ok(true) => {
                debug!(
                    record = %record.name,
                    elapsed_secs = start.elapsed().as_secs(),
                    "DNS propagation confirmed"
                );
                return Ok(());
            }
            Ok(false) => {
                trace!(record = %record.name, "Record not yet propagated");
            }
            Err(e) => {
                warn!(record = %record.name, error = %e, "DNS lookup error");
            }
        }

        if Instant::now() >= deadline {
            return Err(DnsProviderError::Timeout {
                elapsed_secs: config.timeout.as_secs(),
            });
        }

        tokio::time::sleep(config.check_interval).await;
    }
}
