//! Provider adapters against local fake APIs

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use portico_dns::{
    CloudflareProvider, DnsProviderAdapter, DnsProviderError, DnsRecord, HetznerProvider,
    Provisioned, RecordKind,
};
use serde_json::{json, Value};

#[derive(Clone, Default)]
struct Fake {
    created: Arc<std::sync::Mutex<Vec<Value>>>,
    deleted: Arc<std::sync::Mutex<Vec<String>>>,
    calls: Arc<AtomicUsize>,
}

async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

async fn cf_zones(
    State(fake): State<Fake>,
    headers: HeaderMap,
    Query(q): Query<std::collections::HashMap<String, String>>,
) -> impl IntoResponse {
    fake.calls.fetch_add(1, Ordering::SeqCst);
    if headers.get("authorization").and_then(|v| v.to_str().ok()) != Some("Bearer good-token") {
        return (StatusCode::FORBIDDEN, Json(json!({"success": false}))).into_response();
    }
    let result = if q.get("name").map(String::as_str) == Some("example.com") {
        json!([{"id": "zone-1", "name": "example.com"}])
    } else {
        json!([])
    };
    Json(json!({"success": true, "errors": [], "result": result})).into_response()
}

async fn cf_create(
    State(fake): State<Fake>,
    Path(zone): Path<String>,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    assert_eq!(zone, "zone-1");
    fake.created.lock().unwrap().push(body);
    Json(json!({"success": true, "errors": [], "result": {"id": "rec-9"}}))
}

async fn cf_delete(
    State(fake): State<Fake>,
    Path((_zone, record)): Path<(String, String)>,
) -> impl IntoResponse {
    fake.deleted.lock().unwrap().push(record);
    Json(json!({"success": true, "errors": [], "result": {"id": "rec-9"}}))
}

fn cloudflare_app(fake: Fake) -> Router {
    Router::new()
        .route("/zones", get(cf_zones))
        .route("/zones/{zone}/dns_records", post(cf_create))
        .route("/zones/{zone}/dns_records/{record}", delete(cf_delete))
        .with_state(fake)
}

#[tokio::test]
async fn test_cloudflare_creates_record_in_parent_zone() {
    let fake = Fake::default();
    let base = serve(cloudflare_app(fake.clone())).await;
    let provider = CloudflareProvider::new("good-token", Duration::from_secs(5))
        .unwrap()
        .with_base_url(base);
    let adapter = DnsProviderAdapter::Cloudflare(provider);

    let record = DnsRecord::new(RecordKind::Txt, "_portico.shop.example.com", "tok");
    let provisioned = adapter.create_record(None, &record).await.unwrap();
    assert_eq!(
        provisioned,
        Provisioned::Created {
            record_id: "rec-9".to_string()
        }
    );

    let created = fake.created.lock().unwrap().clone();
    assert_eq!(created.len(), 1);
    assert_eq!(created[0]["type"], "TXT");
    assert_eq!(created[0]["name"], "_portico.shop.example.com");
    assert_eq!(created[0]["content"], "tok");

    adapter
        .delete_record(Some("zone-1"), &record.name, "rec-9")
        .await
        .unwrap();
    // Zone resolved from the record name when unknown
    adapter
        .delete_record(None, &record.name, "rec-10")
        .await
        .unwrap();
    assert_eq!(fake.deleted.lock().unwrap().as_slice(), ["rec-9", "rec-10"]);
}

#[tokio::test]
async fn test_cloudflare_zone_lookup_is_cached() {
    let fake = Fake::default();
    let base = serve(cloudflare_app(fake.clone())).await;
    let provider = CloudflareProvider::new("good-token", Duration::from_secs(5))
        .unwrap()
        .with_base_url(base);

    assert_eq!(provider.zone_id_for("shop.example.com").await.unwrap(), "zone-1");
    let after_first = fake.calls.load(Ordering::SeqCst);
    assert_eq!(provider.zone_id_for("shop.example.com").await.unwrap(), "zone-1");
    assert_eq!(fake.calls.load(Ordering::SeqCst), after_first);
}

#[tokio::test]
async fn test_cloudflare_bad_token() {
    let base = serve(cloudflare_app(Fake::default())).await;
    let provider = CloudflareProvider::new("bad-token", Duration::from_secs(5))
        .unwrap()
        .with_base_url(base);

    let err = provider.zone_id_for("shop.example.com").await.unwrap_err();
    assert!(matches!(err, DnsProviderError::Authentication(_)));
    assert!(!err.is_transient());
}

#[tokio::test]
async fn test_rate_limit_is_transient_with_retry_after() {
    let app = Router::new().route(
        "/zones",
        get(|| async { (StatusCode::TOO_MANY_REQUESTS, [("retry-after", "17")], "slow down") }),
    );
    let base = serve(app).await;
    let provider = CloudflareProvider::new("good-token", Duration::from_secs(5))
        .unwrap()
        .with_base_url(base);

    let err = provider.zone_id_for("shop.example.com").await.unwrap_err();
    assert!(matches!(err, DnsProviderError::RateLimited { retry_after_secs: 17 }));
    assert!(err.is_transient());
    assert_eq!(err.retry_after(), Some(Duration::from_secs(17)));
}

#[tokio::test]
async fn test_hetzner_uses_zone_relative_names() {
    let fake = Fake::default();
    let created = fake.created.clone();
    let app = Router::new()
        .route(
            "/zones",
            get(|| async { Json(json!({"zones": [{"id": "hz-1", "name": "example.com"}]})) }),
        )
        .route(
            "/records",
            post(move |Json(body): Json<Value>| {
                let created = created.clone();
                async move {
                    created.lock().unwrap().push(body);
                    Json(json!({"record": {"id": "hr-1"}}))
                }
            }),
        )
        .route(
            "/records/{id}",
            delete(|| async { StatusCode::NOT_FOUND }),
        );
    let base = serve(app).await;
    let adapter = DnsProviderAdapter::Hetzner(
        HetznerProvider::new("token", Duration::from_secs(5))
            .unwrap()
            .with_base_url(base),
    );

    let record = DnsRecord::new(RecordKind::A, "shop.example.com", "203.0.113.7");
    let provisioned = adapter.create_record(None, &record).await.unwrap();
    assert_eq!(
        provisioned,
        Provisioned::Created {
            record_id: "hr-1".to_string()
        }
    );

    let body = fake.created.lock().unwrap()[0].clone();
    assert_eq!(body["zone_id"], "hz-1");
    assert_eq!(body["name"], "shop");
    assert_eq!(body["type"], "A");

    // Already gone counts as deleted
    adapter
        .delete_record(None, "shop.example.com", "hr-1")
        .await
        .unwrap();
}
