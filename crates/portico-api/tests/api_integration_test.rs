//! Integration tests for the admin API

use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use portico_api::{models::*, ApiServer, ApiServerConfig};
use portico_cert::{generate_for_domains, SecretCipher, SelfSignedAuthority};
use portico_control::config::ServiceDefinition;
use portico_control::{Components, ControlPlane, Settings, StaticServiceStore, TracingAuditLogger};
use portico_db::Stores;
use portico_dns::{DnsLookup, DnsResult};
use portico_proxy::{CertificateFiles, ProxyController, ProxyError};
use sea_orm::{ConnectionTrait, DatabaseConnection};
use serde_json::{json, Value};
use tower::ServiceExt; // For `oneshot` method

const TOKEN: &str = "test-admin-token";

/// Answers every TXT query with whatever was published last
#[derive(Default)]
struct StaticLookup {
    txt: Mutex<Vec<String>>,
}

#[async_trait]
impl DnsLookup for StaticLookup {
    async fn txt(&self, _name: &str) -> DnsResult<Vec<String>> {
        Ok(self.txt.lock().unwrap().clone())
    }

    async fn a(&self, _name: &str) -> DnsResult<Vec<Ipv4Addr>> {
        Ok(Vec::new())
    }

    async fn cname(&self, _name: &str) -> DnsResult<Vec<String>> {
        Ok(Vec::new())
    }
}

#[derive(Default)]
struct AcceptingController {
    live: Mutex<Option<String>>,
}

#[async_trait]
impl ProxyController for AcceptingController {
    async fn validate(&self, _config: &str) -> Result<(), ProxyError> {
        Ok(())
    }

    async fn apply(&self, config: &str) -> Result<(), ProxyError> {
        *self.live.lock().unwrap() = Some(config.to_string());
        Ok(())
    }

    async fn install_certificate(&self, _files: &CertificateFiles) -> Result<(), ProxyError> {
        Ok(())
    }

    async fn live_config(&self) -> Result<Option<String>, ProxyError> {
        Ok(self.live.lock().unwrap().clone())
    }
}

struct TestApp {
    router: Router,
    lookup: Arc<StaticLookup>,
    db: DatabaseConnection,
}

/// Helper to create a router over an in-memory control plane
async fn create_test_app() -> TestApp {
    create_test_app_with(Some(SecretCipher::generate_key().unwrap())).await
}

async fn create_test_app_with(master_key: Option<String>) -> TestApp {
    let db = portico_db::connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory database");
    portico_db::migrate(&db)
        .await
        .expect("Failed to run migrations");

    let mut settings = Settings::default();
    settings.master_key = master_key;
    settings.services = vec![ServiceDefinition {
        id: "web".to_string(),
        ports: vec![8080],
    }];
    let cipher = SecretCipher::from_optional(settings.master_key.as_deref()).unwrap();

    let lookup = Arc::new(StaticLookup::default());
    let components = Components {
        lookup: lookup.clone(),
        authority: Arc::new(SelfSignedAuthority::new(90)),
        controller: Arc::new(AcceptingController::default()),
        services: Arc::new(StaticServiceStore::new(&settings.services)),
        audit: Arc::new(TracingAuditLogger),
    };
    let plane = ControlPlane::new(Stores::new(db.clone()), settings, cipher, components);

    let config = ApiServerConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        enable_cors: false,
        admin_token: Some(TOKEN.to_string()),
    };
    TestApp {
        router: ApiServer::new(config, plane).build_router(),
        lookup,
        db,
    }
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut builder = Request::builder()
        .uri(uri)
        .method(method)
        .header("authorization", format!("Bearer {}", TOKEN));
    let body = match body {
        Some(body) => {
            builder = builder.header("content-type", "application/json");
            Body::from(serde_json::to_string(&body).unwrap())
        }
        None => Body::empty(),
    };

    let response = app.clone().oneshot(builder.body(body).unwrap()).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

#[tokio::test]
async fn test_health_is_public() {
    let app = create_test_app().await;
    let request = Request::builder()
        .uri("/api/health")
        .body(Body::empty())
        .unwrap();

    let response = app.router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_protected_routes_require_token() {
    let app = create_test_app().await;

    let missing = Request::builder()
        .uri("/api/domains")
        .body(Body::empty())
        .unwrap();
    let response = app.router.clone().oneshot(missing).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let error: ErrorResponse = serde_json::from_slice(&body).unwrap();
    assert_eq!(error.code.as_deref(), Some("MISSING_AUTH"));

    let wrong = Request::builder()
        .uri("/api/domains")
        .header("authorization", "Bearer nope")
        .body(Body::empty())
        .unwrap();
    let response = app.router.clone().oneshot(wrong).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let (status, _) = send(&app.router, "GET", "/api/domains", None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_domain_lifecycle_over_http() {
    let app = create_test_app().await;

    let (status, created) = send(
        &app.router,
        "POST",
        "/api/domains",
        Some(json!({"name": "Shop.Example.com", "verification_method": "TXT"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{created}");
    let domain: Domain = serde_json::from_value(created).unwrap();
    assert_eq!(domain.name, "shop.example.com");
    let verification = domain.verification.unwrap();
    assert!(verification.instructions.unwrap().contains("TXT"));

    let (status, body) = send(
        &app.router,
        "POST",
        "/api/domains",
        Some(json!({"name": "shop.example.com", "verification_method": "TXT"})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "CONFLICT");

    // Not published yet
    let uri = format!("/api/domains/{}/verify", domain.id);
    let (status, body) = send(&app.router, "POST", &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "retrying");
    assert_eq!(body["domain"]["status"], "verifying");

    // Routes need an active domain
    let (status, body) = send(
        &app.router,
        "POST",
        "/api/routes",
        Some(json!({"domain_id": domain.id, "service_id": "web", "port": 8080})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "VALIDATION_ERROR");

    let pair = generate_for_domains(&["shop.example.com".to_string()], 30).unwrap();
    let (status, cert) = send(
        &app.router,
        "POST",
        "/api/certificates",
        Some(json!({
            "domain_id": domain.id,
            "certificate_pem": pair.pem_cert,
            "private_key_pem": pair.pem_key,
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{cert}");
    assert_eq!(cert["type"], "uploaded");
    assert_eq!(cert["status"], "active");
    assert!(cert.get("encrypted_key").is_none());
    assert!(cert.get("pem_cert").is_none());

    app.lookup
        .txt
        .lock()
        .unwrap()
        .push(verification.challenge.clone());
    let (_, body) = send(&app.router, "POST", &uri, None).await;
    assert_eq!(body["outcome"], "verified");
    assert_eq!(body["domain"]["status"], "active");

    let (status, route) = send(
        &app.router,
        "POST",
        "/api/routes",
        Some(json!({"domain_id": domain.id, "service_id": "web", "port": 8080})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{route}");
    assert_eq!(route["path"], "/");
    assert_eq!(route["tls"], true);

    let (status, report) = send(&app.router, "POST", "/api/proxy/validate", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["valid"], true);

    let (status, reload) = send(&app.router, "POST", "/api/proxy/reload", None).await;
    assert_eq!(status, StatusCode::OK);
    let (_, proxy) = send(&app.router, "GET", "/api/proxy/status", None).await;
    assert_eq!(proxy["applied_hash"], reload["hash"]);
    assert_eq!(proxy["phase"], "idle");

    let uri = format!("/api/domains/{}", domain.id);
    let (status, _) = send(&app.router, "DELETE", &uri, None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, body) = send(&app.router, "GET", &uri, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "NOT_FOUND");
}

#[tokio::test]
async fn test_invalid_input_is_rejected() {
    let app = create_test_app().await;

    let (status, body) = send(
        &app.router,
        "POST",
        "/api/domains",
        Some(json!({"name": "not a domain", "verification_method": "TXT"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "VALIDATION_ERROR");

    let (_, created) = send(
        &app.router,
        "POST",
        "/api/domains",
        Some(json!({"name": "upload.example.com", "verification_method": "TXT"})),
    )
    .await;
    let first = generate_for_domains(&["upload.example.com".to_string()], 30).unwrap();
    let second = generate_for_domains(&["upload.example.com".to_string()], 30).unwrap();
    let (status, body) = send(
        &app.router,
        "POST",
        "/api/certificates",
        Some(json!({
            "domain_id": created["id"],
            "certificate_pem": first.pem_cert,
            "private_key_pem": second.pem_key,
        })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "VALIDATION_ERROR");

    let uri = format!("/api/certificates?domain_id={}", created["id"].as_str().unwrap());
    let (_, list) = send(&app.router, "GET", &uri, None).await;
    assert_eq!(list["total"], 0);
}

#[tokio::test]
async fn test_provider_credentials_are_never_returned() {
    let app = create_test_app().await;

    let (status, created) = send(
        &app.router,
        "POST",
        "/api/dns-providers",
        Some(json!({"name": "cf", "type": "cloudflare", "api_token": "super-secret"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{created}");
    assert_eq!(created["has_credentials"], true);

    let (_, list) = send(&app.router, "GET", "/api/dns-providers", None).await;
    assert_eq!(list["total"], 1);

    for body in [created.to_string(), list.to_string()] {
        assert!(!body.contains("super-secret"));
        assert!(!body.contains("api_token"));
        assert!(!body.contains("nonce"));
    }

    let uri = format!("/api/dns-providers/{}", created["id"].as_str().unwrap());
    let (status, updated) = send(&app.router, "PATCH", &uri, Some(json!({"active": false}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["active"], false);

    let (status, body) = send(
        &app.router,
        "POST",
        "/api/dns-providers",
        Some(json!({"name": "hz", "type": "hetzner"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST, "{body}");

    let (status, _) = send(&app.router, "DELETE", &uri, None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn test_database_errors_are_not_echoed() {
    let app = create_test_app().await;
    app.db
        .execute_unprepared("DROP TABLE routes")
        .await
        .unwrap();

    let (status, body) = send(&app.router, "GET", "/api/routes", None).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["code"], "INTERNAL_ERROR");
    assert_eq!(body["error"], "internal error");
    let text = body.to_string();
    assert!(!text.contains("routes"), "{text}");
    assert!(!text.contains("no such table"), "{text}");
}

#[tokio::test]
async fn test_missing_master_key_is_unavailable_not_a_crash() {
    let app = create_test_app_with(None).await;

    let (status, created) = send(
        &app.router,
        "POST",
        "/api/domains",
        Some(json!({"name": "keyless.example.com", "verification_method": "TXT"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{created}");

    let pair = generate_for_domains(&["keyless.example.com".to_string()], 30).unwrap();
    let (status, body) = send(
        &app.router,
        "POST",
        "/api/certificates",
        Some(json!({
            "domain_id": created["id"],
            "certificate_pem": pair.pem_cert,
            "private_key_pem": pair.pem_key,
        })),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE, "{body}");
    assert_eq!(body["code"], "MASTER_KEY_UNAVAILABLE");
    assert!(body["error"].as_str().unwrap().contains("PORTICO_MASTER_KEY"));

    let uri = format!("/api/certificates?domain_id={}", created["id"].as_str().unwrap());
    let (_, list) = send(&app.router, "GET", &uri, None).await;
    assert_eq!(list["total"], 0);

    // Operations that need no secret keep working
    let (status, _) = send(&app.router, "GET", "/api/domains", None).await;
    assert_eq!(status, StatusCode::OK);
}
