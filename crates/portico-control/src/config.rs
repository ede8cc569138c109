//! Settings file support
//!
//! Portico reads a single YAML file (default `portico.yml`). Every section is
//! optional and falls back to the defaults below.

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use portico_cert::{AcmeConfig, LETSENCRYPT_PRODUCTION, LETSENCRYPT_STAGING};
use portico_dns::PropagationConfig;
use portico_proxy::{GeneratorSettings, NginxSettings};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::retry::RetryPolicy;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Failed to read settings file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse settings: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid settings: {0}")]
    Invalid(String),
}

/// Top-level settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub database_url: String,
    /// Base64 master key; usually supplied through `PORTICO_MASTER_KEY`
    #[serde(skip_serializing)]
    pub master_key: Option<String>,
    /// Directory for ACME account credentials and other local state
    pub state_dir: PathBuf,
    pub api: ApiSettings,
    pub verification: VerificationSettings,
    pub dns: DnsSettings,
    pub certificates: CertificateSettings,
    pub acme: AcmeSettings,
    pub proxy: ProxySettings,
    pub reconciler: ReconcilerSettings,
    pub retry: RetrySettings,
    pub workers: WorkerSettings,
    pub services: Vec<ServiceDefinition>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_url: "sqlite://portico.db?mode=rwc".to_string(),
            master_key: None,
            state_dir: PathBuf::from("./.portico"),
            api: ApiSettings::default(),
            verification: VerificationSettings::default(),
            dns: DnsSettings::default(),
            certificates: CertificateSettings::default(),
            acme: AcmeSettings::default(),
            proxy: ProxySettings::default(),
            reconciler: ReconcilerSettings::default(),
            retry: RetrySettings::default(),
            workers: WorkerSettings::default(),
            services: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiSettings {
    pub bind: String,
    /// Bearer token required on every request; unset disables the check
    #[serde(skip_serializing)]
    pub admin_token: Option<String>,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8470".to_string(),
            admin_token: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationSettings {
    /// Address A-record verification expects
    pub public_ipv4: Option<Ipv4Addr>,
    /// Target CNAME verification expects
    pub ingress_hostname: Option<String>,
    /// Resolvers to query; empty uses the system configuration
    pub nameservers: Vec<IpAddr>,
    pub lookup_timeout_secs: u64,
    pub initial_backoff_secs: u64,
    pub max_backoff_secs: u64,
    pub max_failures: u32,
}

impl Default for VerificationSettings {
    fn default() -> Self {
        Self {
            public_ipv4: None,
            ingress_hostname: None,
            nameservers: vec![
                IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)),
                IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)),
            ],
            lookup_timeout_secs: 5,
            initial_backoff_secs: 30,
            max_backoff_secs: 30 * 60,
            max_failures: 10,
        }
    }
}

impl VerificationSettings {
    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_secs(self.lookup_timeout_secs)
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_secs(self.initial_backoff_secs)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsSettings {
    pub api_timeout_secs: u64,
    /// Override for the Cloudflare API endpoint
    pub cloudflare_api_base: Option<String>,
    /// Override for the Hetzner DNS API endpoint
    pub hetzner_api_base: Option<String>,
    pub propagation_initial_delay_secs: u64,
    pub propagation_interval_secs: u64,
    pub propagation_timeout_secs: u64,
}

impl Default for DnsSettings {
    fn default() -> Self {
        Self {
            api_timeout_secs: 30,
            cloudflare_api_base: None,
            hetzner_api_base: None,
            propagation_initial_delay_secs: 10,
            propagation_interval_secs: 5,
            propagation_timeout_secs: 120,
        }
    }
}

impl DnsSettings {
    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api_timeout_secs)
    }

    pub fn propagation(&self) -> PropagationConfig {
        PropagationConfig {
            initial_delay: Duration::from_secs(self.propagation_initial_delay_secs),
            check_interval: Duration::from_secs(self.propagation_interval_secs),
            timeout: Duration::from_secs(self.propagation_timeout_secs),
        }
    }
}

/// Which certificate authority issues automatic certificates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthorityKind {
    Acme,
    SelfSigned,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CertificateSettings {
    pub authority: AuthorityKind,
    pub renewal_window_days: i64,
    pub self_signed_validity_days: i64,
    /// Upper bound for a single issuance run
    pub issuance_timeout_secs: u64,
    pub max_issuance_attempts: u32,
    pub issuance_backoff_secs: u64,
    pub max_issuance_backoff_secs: u64,
}

impl Default for CertificateSettings {
    fn default() -> Self {
        Self {
            authority: AuthorityKind::Acme,
            renewal_window_days: 30,
            self_signed_validity_days: 90,
            issuance_timeout_secs: 600,
            max_issuance_attempts: 5,
            issuance_backoff_secs: 300,
            max_issuance_backoff_secs: 6 * 60 * 60,
        }
    }
}

impl CertificateSettings {
    pub fn renewal_window(&self) -> chrono::Duration {
        chrono::Duration::days(self.renewal_window_days)
    }

    pub fn issuance_timeout(&self) -> Duration {
        Duration::from_secs(self.issuance_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AcmeSettings {
    pub contact_email: String,
    /// Use the Let's Encrypt staging environment
    pub staging: bool,
    /// Custom directory URL, overrides `staging`
    pub directory_url: Option<String>,
    pub challenge_timeout_secs: u64,
    pub finalize_timeout_secs: u64,
}

impl Default for AcmeSettings {
    fn default() -> Self {
        Self {
            contact_email: String::new(),
            staging: false,
            directory_url: None,
            challenge_timeout_secs: 120,
            finalize_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxySettings {
    pub config_path: PathBuf,
    pub cert_dir: PathBuf,
    pub webroot: PathBuf,
    pub http_port: u16,
    pub https_port: u16,
    pub worker_connections: u32,
    pub validate_command: String,
    pub reload_command: String,
    pub command_timeout_secs: u64,
}

impl Default for ProxySettings {
    fn default() -> Self {
        let generator = GeneratorSettings::default();
        let nginx = NginxSettings::default();
        Self {
            config_path: nginx.config_path,
            cert_dir: generator.cert_dir,
            webroot: generator.webroot,
            http_port: generator.http_port,
            https_port: generator.https_port,
            worker_connections: generator.worker_connections,
            validate_command: nginx.validate_command,
            reload_command: nginx.reload_command,
            command_timeout_secs: nginx.command_timeout.as_secs(),
        }
    }
}

impl ProxySettings {
    pub fn generator(&self) -> GeneratorSettings {
        GeneratorSettings {
            http_port: self.http_port,
            https_port: self.https_port,
            webroot: self.webroot.clone(),
            cert_dir: self.cert_dir.clone(),
            worker_connections: self.worker_connections,
        }
    }

    pub fn nginx(&self) -> NginxSettings {
        NginxSettings {
            config_path: self.config_path.clone(),
            cert_dir: self.cert_dir.clone(),
            validate_command: self.validate_command.clone(),
            reload_command: self.reload_command.clone(),
            command_timeout: Duration::from_secs(self.command_timeout_secs),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerSettings {
    /// Periodic reconcile interval
    pub interval_secs: u64,
    /// Periodic verification/issuance/renewal sweep interval
    pub sweep_interval_secs: u64,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            sweep_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_elapsed_secs: u64,
    pub call_timeout_secs: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_delay_ms: 500,
            max_delay_ms: 10_000,
            max_elapsed_secs: 60,
            call_timeout_secs: 30,
        }
    }
}

impl RetrySettings {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            max_elapsed: Duration::from_secs(self.max_elapsed_secs),
            call_timeout: Duration::from_secs(self.call_timeout_secs),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    /// Verification/issuance tasks running at once
    pub max_concurrent: usize,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self { max_concurrent: 4 }
    }
}

/// An internal service routes may point at
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceDefinition {
    pub id: String,
    /// Ports the service listens on
    #[serde(default)]
    pub ports: Vec<u16>,
}

impl Settings {
    /// Load settings from a YAML file
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let content = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    /// Load settings if the file exists, defaults otherwise
    pub fn load_or_default(path: &Path) -> Result<Self, SettingsError> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Parse settings from a YAML string
    pub fn parse(content: &str) -> Result<Self, SettingsError> {
        let settings: Settings = serde_yaml::from_str(content)?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), SettingsError> {
        if self.workers.max_concurrent == 0 {
            return Err(SettingsError::Invalid(
                "workers.max_concurrent must be at least 1".to_string(),
            ));
        }
        if self.verification.max_failures == 0 {
            return Err(SettingsError::Invalid(
                "verification.max_failures must be at least 1".to_string(),
            ));
        }
        if self.certificates.renewal_window_days <= 0 {
            return Err(SettingsError::Invalid(
                "certificates.renewal_window_days must be positive".to_string(),
            ));
        }
        let mut ids = std::collections::HashSet::new();
        for service in &self.services {
            if !ids.insert(service.id.as_str()) {
                return Err(SettingsError::Invalid(format!(
                    "duplicate service id '{}'",
                    service.id
                )));
            }
        }
        Ok(())
    }

    pub fn acme_config(&self) -> AcmeConfig {
        let directory_url = match (&self.acme.directory_url, self.acme.staging) {
            (Some(url), _) => url.clone(),
            (None, true) => LETSENCRYPT_STAGING.to_string(),
            (None, false) => LETSENCRYPT_PRODUCTION.to_string(),
        };
        AcmeConfig {
            contact_email: self.acme.contact_email.clone(),
            directory_url,
            state_dir: self.state_dir.clone(),
            challenge_timeout: Duration::from_secs(self.acme.challenge_timeout_secs),
            finalize_timeout: Duration::from_secs(self.acme.finalize_timeout_secs),
            ..AcmeConfig::default()
        }
    }

    /// Annotated example settings file
    pub fn template() -> &'static str {
        r#"# Portico settings
database_url: "sqlite://portico.db?mode=rwc"
state_dir: "./.portico"

api:
  bind: "127.0.0.1:8470"
  # admin_token: "change-me"

verification:
  # public_ipv4: "203.0.113.10"
  # ingress_hostname: "edge.example.net"
  max_failures: 10

certificates:
  authority: acme
  renewal_window_days: 30

acme:
  contact_email: "ops@example.com"
  staging: true

proxy:
  config_path: "/etc/nginx/nginx.conf"
  cert_dir: "/var/lib/portico/certs"
  webroot: "/var/lib/portico/webroot"

services:
  - id: web
    ports: [8080]
"#
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_uses_defaults() {
        let settings = Settings::parse("{}").unwrap();
        assert_eq!(settings.verification.max_failures, 10);
        assert_eq!(settings.verification.initial_backoff_secs, 30);
        assert_eq!(settings.verification.max_backoff_secs, 1800);
        assert_eq!(settings.certificates.renewal_window_days, 30);
        assert_eq!(settings.proxy.validate_command, "nginx -t -c {config}");
        assert_eq!(settings.acme_config().directory_url, LETSENCRYPT_PRODUCTION);
    }

    #[test]
    fn test_template_parses() {
        let settings = Settings::parse(Settings::template()).unwrap();
        assert_eq!(settings.services.len(), 1);
        assert_eq!(settings.services[0].ports, vec![8080]);
        assert_eq!(settings.acme_config().directory_url, LETSENCRYPT_STAGING);
    }

    #[test]
    fn test_partial_section_keeps_other_defaults() {
        let settings = Settings::parse(
            r#"
verification:
  max_failures: 3
  public_ipv4: "203.0.113.10"
proxy:
  http_port: 8080
"#,
        )
        .unwrap();
        assert_eq!(settings.verification.max_failures, 3);
        assert_eq!(settings.verification.lookup_timeout_secs, 5);
        assert_eq!(
            settings.verification.public_ipv4,
            Some(Ipv4Addr::new(203, 0, 113, 10))
        );
        assert_eq!(settings.proxy.generator().http_port, 8080);
        assert_eq!(settings.proxy.generator().https_port, 443);
    }

    #[test]
    fn test_invalid_settings_rejected() {
        assert!(matches!(
            Settings::parse("workers:\n  max_concurrent: 0\n"),
            Err(SettingsError::Invalid(_))
        ));
        assert!(matches!(
            Settings::parse("services:\n  - id: a\n  - id: a\n"),
            Err(SettingsError::Invalid(_))
        ));
        assert!(matches!(
            Settings::parse("api: [1, 2]"),
            Err(SettingsError::Parse(_))
        ));
    }
}
