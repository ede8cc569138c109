//! NginxController driven by stand-in shell commands
#![cfg(unix)]

use std::path::Path;
use std::time::Duration;

use portico_proxy::{
    generate, CertificateFiles, DesiredDomain, DesiredRoute, DesiredState, GeneratorSettings,
    NginxController, NginxSettings, ProxyController, ProxyError,
};

fn controller(dir: &Path, validate: &str, reload: &str) -> NginxController {
    NginxController::new(NginxSettings {
        config_path: dir.join("nginx.conf"),
        cert_dir: dir.join("certs"),
        validate_command: validate.to_string(),
        reload_command: reload.to_string(),
        command_timeout: Duration::from_secs(5),
    })
}

#[tokio::test]
async fn test_validate_runs_checker_against_candidate() {
    let dir = tempfile::tempdir().unwrap();
    let proxy = controller(dir.path(), "grep -q worker_processes {config}", "true");

    let config = generate(&DesiredState::default(), &GeneratorSettings::default()).unwrap();
    proxy.validate(&config.text).await.unwrap();

    let err = proxy.validate("not a config").await.unwrap_err();
    assert!(matches!(err, ProxyError::Rejected(_)));

    // Validation never touches the live file and leaves no candidate behind
    assert!(proxy.live_config().await.unwrap().is_none());
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_apply_writes_live_config() {
    let dir = tempfile::tempdir().unwrap();
    let proxy = controller(dir.path(), "true", "true");

    proxy.apply("first").await.unwrap();
    proxy.apply("second").await.unwrap();
    assert_eq!(proxy.live_config().await.unwrap().as_deref(), Some("second"));
}

#[tokio::test]
async fn test_failed_reload_restores_previous_config() {
    let dir = tempfile::tempdir().unwrap();
    let good = controller(dir.path(), "true", "true");
    good.apply("working").await.unwrap();

    let broken = controller(dir.path(), "true", "false");
    let err = broken.apply("replacement").await.unwrap_err();
    assert!(matches!(err, ProxyError::ReloadFailed(_)));
    assert_eq!(broken.live_config().await.unwrap().as_deref(), Some("working"));
}

#[tokio::test]
async fn test_failed_first_reload_leaves_no_file() {
    let dir = tempfile::tempdir().unwrap();
    let broken = controller(dir.path(), "true", "false");

    assert!(broken.apply("replacement").await.is_err());
    assert!(broken.live_config().await.unwrap().is_none());
}

#[tokio::test]
async fn test_command_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = controller(dir.path(), "sleep 5", "true").settings().clone();
    settings.command_timeout = Duration::from_millis(100);
    let proxy = NginxController::new(settings);

    let err = proxy.validate("x").await.unwrap_err();
    assert!(matches!(err, ProxyError::Timeout { .. }));
}

#[tokio::test]
async fn test_install_certificate_writes_private_key_file() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().unwrap();
    let proxy = controller(dir.path(), "true", "true");
    let files = CertificateFiles {
        certificate_id: "cert-1".to_string(),
        fullchain_pem: "CERT".to_string(),
        key_pem: "KEY".to_string(),
    };

    proxy.install_certificate(&files).await.unwrap();
    proxy.install_certificate(&files).await.unwrap();

    let key = dir.path().join("certs/cert-1.key");
    assert_eq!(std::fs::read_to_string(&key).unwrap(), "KEY");
    assert_eq!(
        std::fs::metadata(&key).unwrap().permissions().mode() & 0o777,
        0o600
    );
    assert_eq!(
        std::fs::read_to_string(dir.path().join("certs/cert-1.crt")).unwrap(),
        "CERT"
    );
}

#[tokio::test]
async fn test_generated_config_references_installed_files() {
    let dir = tempfile::tempdir().unwrap();
    let proxy = controller(dir.path(), "true", "true");
    let settings = GeneratorSettings {
        cert_dir: dir.path().join("certs"),
        webroot: dir.path().join("webroot"),
        ..Default::default()
    };
    let state = DesiredState {
        domains: vec![DesiredDomain {
            name: "shop.example.com".to_string(),
            certificate_id: Some("cert-1".to_string()),
            routes: vec![DesiredRoute {
                path: "/".to_string(),
                service_id: "shop".to_string(),
                port: 3000,
                tls: true,
            }],
        }],
    };
    let config = generate(&state, &settings).unwrap();
    for id in &config.certificate_ids {
        proxy
            .install_certificate(&CertificateFiles {
                certificate_id: id.clone(),
                fullchain_pem: "CERT".to_string(),
                key_pem: "KEY".to_string(),
            })
            .await
            .unwrap();
    }

    let key_path = dir.path().join("certs/cert-1.key");
    assert!(config
        .text
        .contains(&format!("ssl_certificate_key {};", key_path.display())));
    assert!(key_path.exists());
}
