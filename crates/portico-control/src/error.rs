//! Control plane error taxonomy

use portico_cert::{AcmeError, CipherError, PemError};
use portico_db::StoreError;
use portico_dns::DnsProviderError;
use portico_proxy::{ConfigGenerationError, ProxyError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ControlError {
    /// Input rejected before any state changed
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A DNS provider, resolver or certificate authority failed
    #[error("{service} error: {message}")]
    ExternalService {
        service: &'static str,
        message: String,
        transient: bool,
    },

    #[error("Configuration generation failed: {0}")]
    ConfigGeneration(#[from] ConfigGenerationError),

    /// The proxy rejected or failed to load a configuration
    #[error("Configuration apply failed: {0}")]
    ConfigApply(String),

    #[error("Encryption error: {0}")]
    Encryption(#[from] CipherError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ControlError {
    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            ControlError::Validation(_) => "VALIDATION_ERROR",
            ControlError::ExternalService { .. } => "EXTERNAL_SERVICE_ERROR",
            ControlError::ConfigGeneration(_) => "CONFIG_GENERATION_ERROR",
            ControlError::ConfigApply(_) => "CONFIG_APPLY_ERROR",
            ControlError::Encryption(CipherError::KeyUnavailable) => "MASTER_KEY_UNAVAILABLE",
            ControlError::Encryption(_) => "ENCRYPTION_ERROR",
            ControlError::NotFound(_) => "NOT_FOUND",
            ControlError::Conflict(_) => "CONFLICT",
            ControlError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// The operation needs the master key and none is configured
    pub fn is_key_unavailable(&self) -> bool {
        matches!(self, ControlError::Encryption(CipherError::KeyUnavailable))
    }

    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ControlError::ExternalService {
                transient: true,
                ..
            }
        )
    }
}

impl From<StoreError> for ControlError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound { .. } => ControlError::NotFound(e.to_string()),
            StoreError::Conflict(msg) => ControlError::Conflict(msg),
            StoreError::InvalidTransition { .. } => ControlError::Validation(e.to_string()),
            StoreError::Database(db) => ControlError::Internal(db.to_string()),
        }
    }
}

impl From<DnsProviderError> for ControlError {
    fn from(e: DnsProviderError) -> Self {
        ControlError::ExternalService {
            service: "dns",
            transient: e.is_transient(),
            message: e.to_string(),
        }
    }
}

impl From<AcmeError> for ControlError {
    fn from(e: AcmeError) -> Self {
        match e {
            AcmeError::Pem(pem) => ControlError::Validation(pem.to_string()),
            other => ControlError::ExternalService {
                service: "certificate authority",
                transient: other.is_transient(),
                message: other.to_string(),
            },
        }
    }
}

impl From<PemError> for ControlError {
    fn from(e: PemError) -> Self {
        ControlError::Validation(e.to_string())
    }
}

impl From<ProxyError> for ControlError {
    fn from(e: ProxyError) -> Self {
        ControlError::ConfigApply(e.to_string())
    }
}

pub type ControlResult<T> = Result<T, ControlError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_master_key_has_its_own_code() {
        let err = ControlError::from(CipherError::KeyUnavailable);
        assert!(err.is_key_unavailable());
        assert_eq!(err.code(), "MASTER_KEY_UNAVAILABLE");

        let err = ControlError::from(CipherError::Decrypt);
        assert!(!err.is_key_unavailable());
        assert_eq!(err.code(), "ENCRYPTION_ERROR");
    }

    #[test]
    fn test_store_errors_map_to_taxonomy() {
        let e: ControlError = StoreError::Conflict("dup".to_string()).into();
        assert_eq!(e.code(), "CONFLICT");

        let e: ControlError = StoreError::InvalidTransition {
            entity: "route",
            id: "r".to_string(),
            to: "attached",
            reason: "domain is pending".to_string(),
        }
        .into();
        assert_eq!(e.code(), "VALIDATION_ERROR");
    }

    #[test]
    fn test_rate_limit_is_transient() {
        let e: ControlError = DnsProviderError::RateLimited {
            retry_after_secs: 10,
        }
        .into();
        assert!(e.is_transient());

        let e: ControlError = CipherError::KeyUnavailable.into();
        assert!(!e.is_transient());
    }
}
