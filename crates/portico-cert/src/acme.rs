//! ACME client for automatic certificate provisioning via Let's Encrypt
//!
//! Wraps `instant-acme`: the account is created once and its credentials are
//! persisted under the state directory, orders are driven to completion with
//! HTTP-01 or DNS-01 challenges published through a [`ChallengeResponder`].

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, NewAccount,
    NewOrder, Order, OrderStatus,
};
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, trace, warn};

use crate::authority::{
    CertificateAuthority, ChallengeKind, ChallengeResponder, IssueRequest, IssuedBundle,
    PendingChallenge,
};
use crate::pem::{parse_certificate, PemError};

/// Let's Encrypt production directory URL
pub const LETSENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";
/// Let's Encrypt staging directory URL
pub const LETSENCRYPT_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

const ACCOUNT_FILE: &str = "acme_account.json";

/// ACME errors
#[derive(Debug, Error)]
pub enum AcmeError {
    #[error("Account creation failed: {0}")]
    AccountCreationFailed(String),

    #[error("Rate limited by certificate authority: {0}")]
    RateLimited(String),

    #[error("Certificate authority rejected the request: {0}")]
    Rejected(String),

    #[error("Certificate authority unreachable: {0}")]
    Transport(String),

    #[error("No {kind} challenge offered for '{domain}'")]
    ChallengeUnavailable { domain: String, kind: &'static str },

    #[error("Challenge validation failed for '{domain}': {message}")]
    ChallengeFailed { domain: String, message: String },

    #[error("Challenge response could not be published: {0}")]
    Responder(String),

    #[error("Certificate finalization failed: {0}")]
    FinalizationFailed(String),

    #[error("Timeout waiting for {0}")]
    Timeout(String),

    #[error("Invalid domain: {0}")]
    InvalidDomain(String),

    #[error("Certificate generation error: {0}")]
    CertGen(String),

    #[error(transparent)]
    Pem(#[from] PemError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl AcmeError {
    /// Whether retrying later may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AcmeError::RateLimited(_)
                | AcmeError::Transport(_)
                | AcmeError::Timeout(_)
                | AcmeError::Responder(_)
                | AcmeError::ChallengeFailed { .. }
                | AcmeError::Io(_)
        )
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, AcmeError::RateLimited(_))
    }
}

impl From<instant_acme::Error> for AcmeError {
    fn from(e: instant_acme::Error) -> Self {
        match &e {
            instant_acme::Error::Api(problem) => {
                let kind = problem.r#type.as_deref().unwrap_or_default();
                if kind.ends_with(":rateLimited") || problem.status == Some(429) {
                    AcmeError::RateLimited(e.to_string())
                } else if problem.status.is_some_and(|s| s >= 500) {
                    AcmeError::Transport(e.to_string())
                } else {
                    AcmeError::Rejected(e.to_string())
                }
            }
            _ => AcmeError::Transport(e.to_string()),
        }
    }
}

/// ACME configuration
#[derive(Clone)]
pub struct AcmeConfig {
    /// Contact email for the CA account
    pub contact_email: String,
    /// ACME directory URL
    pub directory_url: String,
    /// Directory holding the persisted account credentials
    pub state_dir: PathBuf,
    /// Upper bound for authorizations to become valid
    pub challenge_timeout: Duration,
    /// Upper bound for the certificate to be issued after finalization
    pub finalize_timeout: Duration,
    /// Delay between order status polls
    pub poll_interval: Duration,
}

impl std::fmt::Debug for AcmeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcmeConfig")
            .field("contact_email", &self.contact_email)
            .field("directory_url", &self.directory_url)
            .field("state_dir", &self.state_dir)
            .finish()
    }
}

impl Default for AcmeConfig {
    fn default() -> Self {
        Self {
            contact_email: String::new(),
            directory_url: LETSENCRYPT_PRODUCTION.to_string(),
            state_dir: PathBuf::from("./.portico"),
            challenge_timeout: Duration::from_secs(120),
            finalize_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_secs(2),
        }
    }
}

/// ACME client for certificate provisioning
pub struct AcmeClient {
    config: AcmeConfig,
    account: Mutex<Option<Account>>,
}

impl AcmeClient {
    pub fn new(config: AcmeConfig) -> Self {
        Self {
            config,
            account: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &AcmeConfig {
        &self.config
    }

    fn credentials_path(&self) -> PathBuf {
        self.config.state_dir.join(ACCOUNT_FILE)
    }

    /// Load the persisted account or register a new one
    async fn account(&self) -> Result<Account, AcmeError> {
        let mut guard = self.account.lock().await;
        if let Some(account) = guard.as_ref() {
            return Ok(account.clone());
        }

        let path = self.credentials_path();
        let account = match fs::read_to_string(&path).await {
            Ok(json) => {
                info!(path = %path.display(), "Loading existing ACME account");
                let credentials: AccountCredentials = serde_json::from_str(&json)
                    .map_err(|e| AcmeError::AccountCreationFailed(format!("corrupt credentials: {e}")))?;
                Account::builder()
                    .map_err(|e| AcmeError::AccountCreationFailed(e.to_string()))?
                    .from_credentials(credentials)
                    .await?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(
                    email = %self.config.contact_email,
                    directory = %self.config.directory_url,
                    "Creating new ACME account"
                );
                let contact = format!("mailto:{}", self.config.contact_email);
                let contacts: Vec<&str> = if self.config.contact_email.is_empty() {
                    Vec::new()
                } else {
                    vec![contact.as_str()]
                };
                let (account, credentials) = Account::builder()
                    .map_err(|e| AcmeError::AccountCreationFailed(e.to_string()))?
                    .create(
                        &NewAccount {
                            contact: &contacts,
                            terms_of_service_agreed: true,
                            only_return_existing: false,
                        },
                        self.config.directory_url.clone(),
                        None,
                    )
                    .await?;

                let json = serde_json::to_string_pretty(&credentials)
                    .map_err(|e| AcmeError::AccountCreationFailed(e.to_string()))?;
                fs::create_dir_all(&self.config.state_dir).await?;
                fs::write(&path, json).await?;
                account
            }
            Err(e) => return Err(e.into()),
        };

        *guard = Some(account.clone());
        Ok(account)
    }

    /// Publish every outstanding challenge and tell the CA it is ready.
    ///
    /// Published challenges are pushed to `presented` before the CA is
    /// notified so the caller can withdraw them whatever happens next.
    async fn answer_challenges(
        &self,
        order: &mut Order,
        kind: ChallengeKind,
        responder: &dyn ChallengeResponder,
        presented: &mut Vec<PendingChallenge>,
    ) -> Result<(), AcmeError> {
        let challenge_type = match kind {
            ChallengeKind::Http01 => ChallengeType::Http01,
            ChallengeKind::Dns01 => ChallengeType::Dns01,
        };

        let mut authorizations = order.authorizations();
        while let Some(result) = authorizations.next().await {
            let mut authz = result?;

            let domain = match &authz.identifier().identifier {
                Identifier::Dns(domain) => domain.clone(),
                _ => continue,
            };

            debug!(domain = %domain, status = ?authz.status, "Processing authorization");
            if authz.status == AuthorizationStatus::Valid {
                continue;
            }

            let mut challenge = authz.challenge(challenge_type.clone()).ok_or_else(|| {
                AcmeError::ChallengeUnavailable {
                    domain: domain.clone(),
                    kind: kind.as_str(),
                }
            })?;

            let key_authorization = challenge.key_authorization();
            let pending = match kind {
                ChallengeKind::Http01 => PendingChallenge::Http01 {
                    domain: domain.clone(),
                    token: challenge.token.clone(),
                    key_authorization: key_authorization.as_str().to_string(),
                },
                ChallengeKind::Dns01 => PendingChallenge::Dns01 {
                    record_name: format!("_acme-challenge.{}", domain.trim_end_matches('.')),
                    domain: domain.clone(),
                    value: key_authorization.dns_value(),
                },
            };

            responder.present(&pending).await?;
            presented.push(pending);

            challenge.set_ready().await?;
            debug!(domain = %domain, kind = kind.as_str(), "Challenge set ready");
        }

        Ok(())
    }

    async fn wait_for_status(
        &self,
        order: &mut Order,
        domain: &str,
        timeout: Duration,
        target: OrderStatus,
    ) -> Result<(), AcmeError> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let state = order.refresh().await?;
            if state.status == target || state.status == OrderStatus::Valid {
                return Ok(());
            }
            if state.status == OrderStatus::Invalid {
                return Err(AcmeError::ChallengeFailed {
                    domain: domain.to_string(),
                    message: "order became invalid".to_string(),
                });
            }
            if tokio::time::Instant::now() > deadline {
                return Err(AcmeError::Timeout(format!(
                    "order for {domain} (last status {:?})",
                    state.status
                )));
            }
            trace!(status = ?state.status, "Order not ready yet, waiting...");
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    async fn run_order(
        &self,
        request: &IssueRequest,
        responder: &dyn ChallengeResponder,
        presented: &mut Vec<PendingChallenge>,
    ) -> Result<IssuedBundle, AcmeError> {
        let account = self.account().await?;

        let identifiers = [Identifier::Dns(request.domain.clone())];
        let mut order = account.new_order(&NewOrder::new(&identifiers)).await?;

        self.answer_challenges(&mut order, request.challenge, responder, presented)
            .await?;
        self.wait_for_status(
            &mut order,
            &request.domain,
            self.config.challenge_timeout,
            OrderStatus::Ready,
        )
        .await?;

        let key = rcgen::KeyPair::generate().map_err(|e| AcmeError::CertGen(e.to_string()))?;
        let csr = rcgen::CertificateParams::new(vec![request.domain.clone()])
            .map_err(|e| AcmeError::CertGen(e.to_string()))?
            .serialize_request(&key)
            .map_err(|e| AcmeError::CertGen(e.to_string()))?;
        order.finalize_csr(csr.der()).await?;

        self.wait_for_status(
            &mut order,
            &request.domain,
            self.config.finalize_timeout,
            OrderStatus::Valid,
        )
        .await?;

        let full_chain = order
            .certificate()
            .await?
            .ok_or_else(|| AcmeError::FinalizationFailed("no certificate in response".to_string()))?;
        let info = parse_certificate(&full_chain)?;

        Ok(IssuedBundle {
            issuer: Some(info.issuer),
            not_before: info.not_before,
            not_after: info.not_after,
            pem_cert: info.leaf_pem,
            pem_chain: info.chain_pem,
            key_pem: key.serialize_pem(),
        })
    }

    /// Validate domain name
    pub fn validate_domain(domain: &str) -> Result<(), AcmeError> {
        if domain.is_empty() {
            return Err(AcmeError::InvalidDomain(
                "Domain cannot be empty".to_string(),
            ));
        }

        if domain.contains(' ') {
            return Err(AcmeError::InvalidDomain(
                "Domain cannot contain spaces".to_string(),
            ));
        }

        if domain.starts_with('.') || domain.ends_with('.') {
            return Err(AcmeError::InvalidDomain(
                "Domain cannot start or end with a dot".to_string(),
            ));
        }

        Ok(())
    }
}

#[async_trait]
impl CertificateAuthority for AcmeClient {
    fn name(&self) -> &str {
        "acme"
    }

    async fn issue(
        &self,
        request: &IssueRequest,
        responder: &dyn ChallengeResponder,
    ) -> Result<IssuedBundle, AcmeError> {
        Self::validate_domain(&request.domain)?;
        info!(domain = %request.domain, challenge = request.challenge.as_str(), "Requesting certificate");

        let mut presented = Vec::new();
        let result = self.run_order(request, responder, &mut presented).await;

        for challenge in &presented {
            if let Err(e) = responder.cleanup(challenge).await {
                warn!(domain = %challenge.domain(), error = %e, "Failed to clean up challenge");
            }
        }

        match &result {
            Ok(bundle) => {
                info!(domain = %request.domain, not_after = %bundle.not_after, "Certificate issued")
            }
            Err(e) => {
                warn!(domain = %request.domain, error = %e, transient = e.is_transient(), "Certificate order failed")
            }
        }
        result
    }
}

impl std::fmt::Debug for AcmeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcmeClient")
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acme_config_default() {
        let config = AcmeConfig::default();
        assert_eq!(config.directory_url, LETSENCRYPT_PRODUCTION);
        assert!(config.contact_email.is_empty());
    }

    #[test]
    fn test_validate_domain() {
        assert!(AcmeClient::validate_domain("example.com").is_ok());
        assert!(AcmeClient::validate_domain("sub.example.com").is_ok());
        assert!(AcmeClient::validate_domain("").is_err());
        assert!(AcmeClient::validate_domain("invalid domain.com").is_err());
        assert!(AcmeClient::validate_domain(".example.com").is_err());
        assert!(AcmeClient::validate_domain("example.com.").is_err());
    }

    #[test]
    fn test_error_classification() {
        assert!(AcmeError::RateLimited("429".to_string()).is_transient());
        assert!(AcmeError::Timeout("order".to_string()).is_transient());
        assert!(!AcmeError::Rejected("unauthorized".to_string()).is_transient());
        assert!(!AcmeError::InvalidDomain("x".to_string()).is_transient());
        assert!(AcmeError::RateLimited("429".to_string()).is_rate_limited());
    }

    #[test]
    fn test_credentials_path() {
        let client = AcmeClient::new(AcmeConfig {
            state_dir: PathBuf::from("/var/lib/portico"),
            ..AcmeConfig::default()
        });
        assert_eq!(
            client.credentials_path(),
            PathBuf::from("/var/lib/portico/acme_account.json")
        );
    }
}
