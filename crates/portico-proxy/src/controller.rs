//! Validation and hot reload of the externally running proxy

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::fs::{read_optional, remove_if_exists, write_atomic};
use crate::generator::certificate_paths;

/// Placeholder replaced with the configuration path in command templates
pub const CONFIG_PLACEHOLDER: &str = "{config}";

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Configuration rejected by proxy: {0}")]
    Rejected(String),

    #[error("Reload failed: {0}")]
    ReloadFailed(String),

    #[error("Command '{command}' timed out after {timeout_secs}s")]
    Timeout { command: String, timeout_secs: u64 },

    #[error("Invalid command template '{0}'")]
    InvalidCommand(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// PEM material to install for one certificate
#[derive(Clone)]
pub struct CertificateFiles {
    pub certificate_id: String,
    /// Leaf followed by the chain
    pub fullchain_pem: String,
    pub key_pem: String,
}

impl fmt::Debug for CertificateFiles {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateFiles")
            .field("certificate_id", &self.certificate_id)
            .field("key_pem", &"<redacted>")
            .finish()
    }
}

/// Control over the proxy process
///
/// `validate` never changes what the proxy serves; `apply` leaves the previous
/// configuration in effect when it fails.
#[async_trait]
pub trait ProxyController: Send + Sync {
    async fn validate(&self, config: &str) -> Result<(), ProxyError>;

    async fn apply(&self, config: &str) -> Result<(), ProxyError>;

    /// Write certificate files referenced by a configuration; idempotent
    async fn install_certificate(&self, files: &CertificateFiles) -> Result<(), ProxyError>;

    /// Configuration currently in effect, if any
    async fn live_config(&self) -> Result<Option<String>, ProxyError>;
}

/// Settings for [`NginxController`]
#[derive(Debug, Clone)]
pub struct NginxSettings {
    pub config_path: PathBuf,
    pub cert_dir: PathBuf,
    pub validate_command: String,
    pub reload_command: String,
    pub command_timeout: Duration,
}

impl Default for NginxSettings {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from("/etc/nginx/nginx.conf"),
            cert_dir: PathBuf::from("/var/lib/portico/certs"),
            validate_command: "nginx -t -c {config}".to_string(),
            reload_command: "nginx -s reload".to_string(),
            command_timeout: Duration::from_secs(30),
        }
    }
}

/// Drives nginx through its command line
#[derive(Debug, Clone)]
pub struct NginxController {
    settings: NginxSettings,
}

impl NginxController {
    pub fn new(settings: NginxSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &NginxSettings {
        &self.settings
    }

    fn candidate_path(&self) -> PathBuf {
        let name = self
            .settings
            .config_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "nginx.conf".to_string());
        self.settings
            .config_path
            .with_file_name(format!("{name}.candidate"))
    }

    /// Run a command template, returning combined output on failure
    async fn run(&self, template: &str, config: &Path) -> Result<Result<(), String>, ProxyError> {
        let config = config.to_string_lossy();
        let mut parts = template
            .split_whitespace()
            .map(|token| token.replace(CONFIG_PLACEHOLDER, &config));
        let program = parts
            .next()
            .ok_or_else(|| ProxyError::InvalidCommand(template.to_string()))?;
        let args: Vec<String> = parts.collect();

        debug!(command = %template, "Running proxy command");
        let child = Command::new(&program)
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.settings.command_timeout, child)
            .await
            .map_err(|_| ProxyError::Timeout {
                command: template.to_string(),
                timeout_secs: self.settings.command_timeout.as_secs(),
            })??;

        if output.status.success() {
            return Ok(Ok(()));
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);
        let detail = format!("{} {}", stderr.trim(), stdout.trim());
        Ok(Err(format!("{} ({})", detail.trim(), output.status)))
    }
}

#[async_trait]
impl ProxyController for NginxController {
    async fn validate(&self, config: &str) -> Result<(), ProxyError> {
        let candidate = self.candidate_path();
        write_atomic(&candidate, config.as_bytes(), None).await?;

        let outcome = self.run(&self.settings.validate_command, &candidate).await;
        remove_if_exists(&candidate).await?;

        match outcome? {
            Ok(()) => Ok(()),
            Err(detail) => Err(ProxyError::Rejected(detail)),
        }
    }

    async fn apply(&self, config: &str) -> Result<(), ProxyError> {
        let path = &self.settings.config_path;
        let previous = read_optional(path).await?;

        write_atomic(path, config.as_bytes(), None).await?;
        let reload = match self.run(&self.settings.reload_command, path).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(detail)) => Err(ProxyError::ReloadFailed(detail)),
            Err(e) => Err(e),
        };

        if let Err(e) = reload {
            warn!(path = %path.display(), error = %e, "Reload failed, restoring previous configuration");
            match previous {
                Some(text) => write_atomic(path, text.as_bytes(), None).await?,
                None => remove_if_exists(path).await?,
            }
            return Err(e);
        }

        info!(path = %path.display(), "Proxy configuration applied");
        Ok(())
    }

    async fn install_certificate(&self, files: &CertificateFiles) -> Result<(), ProxyError> {
        let (crt, key) = certificate_paths(&self.settings.cert_dir, &files.certificate_id);

        // A certificate row never changes its material after activation
        if read_optional(&crt).await?.as_deref() == Some(files.fullchain_pem.as_str())
            && read_optional(&key).await?.as_deref() == Some(files.key_pem.as_str())
        {
            return Ok(());
        }

        write_atomic(&key, files.key_pem.as_bytes(), Some(0o600)).await?;
        write_atomic(&crt, files.fullchain_pem.as_bytes(), Some(0o644)).await?;
        debug!(certificate_id = %files.certificate_id, "Certificate files installed");
        Ok(())
    }

    async fn live_config(&self) -> Result<Option<String>, ProxyError> {
        Ok(read_optional(&self.settings.config_path).await?)
    }
}
