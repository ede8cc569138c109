//! HTTP-01 challenge files served by the proxy from a webroot

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tracing::debug;

use crate::acme::AcmeError;
use crate::authority::{ChallengeResponder, PendingChallenge};

/// Path under the webroot where challenge files live
pub const CHALLENGE_PATH: &str = ".well-known/acme-challenge";

/// Writes key authorizations to `<webroot>/.well-known/acme-challenge/<token>`
#[derive(Debug, Clone)]
pub struct Http01Webroot {
    root: PathBuf,
}

impl Http01Webroot {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// File path for a challenge token
    pub fn token_path(&self, token: &str) -> Result<PathBuf, AcmeError> {
        // Tokens are base64url; anything else could escape the webroot
        let valid = !token.is_empty()
            && token
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(AcmeError::Responder(format!(
                "refusing unsafe challenge token {token:?}"
            )));
        }
        Ok(self.root.join(CHALLENGE_PATH).join(token))
    }
}

#[async_trait]
impl ChallengeResponder for Http01Webroot {
    async fn present(&self, challenge: &PendingChallenge) -> Result<(), AcmeError> {
        let PendingChallenge::Http01 {
            domain,
            token,
            key_authorization,
        } = challenge
        else {
            return Err(AcmeError::Responder(
                "webroot can only answer HTTP-01 challenges".to_string(),
            ));
        };

        let path = self.token_path(token)?;
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).await?;
        }
        fs::write(&path, key_authorization).await?;

        debug!(domain = %domain, path = %path.display(), "HTTP-01 challenge written");
        Ok(())
    }

    async fn cleanup(&self, challenge: &PendingChallenge) -> Result<(), AcmeError> {
        if let PendingChallenge::Http01 { token, .. } = challenge {
            let path = self.token_path(token)?;
            match fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn challenge(token: &str) -> PendingChallenge {
        PendingChallenge::Http01 {
            domain: "app.example.com".to_string(),
            token: token.to_string(),
            key_authorization: format!("{token}.thumbprint"),
        }
    }

    #[tokio::test]
    async fn test_present_and_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let webroot = Http01Webroot::new(dir.path());

        webroot.present(&challenge("abc_DEF-123")).await.unwrap();
        let path = dir
            .path()
            .join(".well-known/acme-challenge/abc_DEF-123");
        assert_eq!(
            tokio::fs::read_to_string(&path).await.unwrap(),
            "abc_DEF-123.thumbprint"
        );

        webroot.cleanup(&challenge("abc_DEF-123")).await.unwrap();
        assert!(!path.exists());

        // Second cleanup is a no-op
        webroot.cleanup(&challenge("abc_DEF-123")).await.unwrap();
    }

    #[tokio::test]
    async fn test_rejects_path_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let webroot = Http01Webroot::new(dir.path());

        assert!(webroot.present(&challenge("../../etc/passwd")).await.is_err());
        assert!(webroot.present(&challenge("")).await.is_err());
    }

    #[tokio::test]
    async fn test_rejects_dns_challenge() {
        let dir = tempfile::tempdir().unwrap();
        let webroot = Http01Webroot::new(dir.path());

        let dns = PendingChallenge::Dns01 {
            domain: "app.example.com".to_string(),
            record_name: "_acme-challenge.app.example.com".to_string(),
            value: "abc".to_string(),
        };
        assert!(matches!(
            webroot.present(&dns).await,
            Err(AcmeError::Responder(_))
        ));
    }
}
