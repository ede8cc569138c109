//! Admin HTTP API for the Portico control plane

pub mod handlers;
pub mod middleware;
pub mod models;

use axum::{
    http::{header, Method},
    middleware as axum_middleware,
    routing::{get, post},
    Router,
};
use portico_control::ControlPlane;
use std::future::Future;
use std::{net::SocketAddr, sync::Arc};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

/// Application state shared across handlers
pub struct AppState {
    pub plane: Arc<ControlPlane>,
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Portico API",
        version = "0.1.0",
        description = "Custom domains with automatic HTTPS",
        contact(
            name = "Portico Team",
            email = "team@portico.dev"
        )
    ),
    paths(
        handlers::health_check,
        handlers::create_domain,
        handlers::list_domains,
        handlers::get_domain,
        handlers::delete_domain,
        handlers::verify_domain,
        handlers::reset_domain,
        handlers::request_certificate,
        handlers::rollback_certificate,
        handlers::upload_certificate,
        handlers::list_certificates,
        handlers::get_certificate,
        handlers::delete_certificate,
        handlers::attach_route,
        handlers::list_routes,
        handlers::detach_route,
        handlers::create_provider,
        handlers::list_providers,
        handlers::get_provider,
        handlers::update_provider,
        handlers::delete_provider,
        handlers::proxy_status,
        handlers::validate_config,
        handlers::force_reload,
    ),
    components(
        schemas(
            models::CreateDomainRequest,
            models::Verification,
            models::Domain,
            models::DomainList,
            models::VerifyResponse,
            models::UploadCertificateRequest,
            models::Certificate,
            models::CertificateList,
            models::AttachRouteRequest,
            models::Route,
            models::RouteList,
            models::CreateProviderRequest,
            models::UpdateProviderRequest,
            models::Provider,
            models::ProviderList,
            models::ExcludedDomain,
            models::ProxyStatus,
            models::ConfigReport,
            models::ReloadResponse,
            models::HealthResponse,
            models::ErrorResponse,
        )
    ),
    tags(
        (name = "domains", description = "Custom domain registration and verification"),
        (name = "certificates", description = "Certificate issuance, upload and rollback"),
        (name = "routes", description = "Service routes on active domains"),
        (name = "dns-providers", description = "DNS provider credentials"),
        (name = "proxy", description = "Reverse proxy configuration"),
        (name = "system", description = "System health and info endpoints")
    )
)]
pub struct ApiDoc;

/// API server configuration
#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    /// Address to bind the API server
    pub bind_addr: SocketAddr,
    /// Allow browser requests from local development origins
    pub enable_cors: bool,
    /// Bearer token required on every route except health
    pub admin_token: Option<String>,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8470)),
            enable_cors: false,
            admin_token: None,
        }
    }
}

/// API Server
pub struct ApiServer {
    config: ApiServerConfig,
    state: Arc<AppState>,
}

impl ApiServer {
    pub fn new(config: ApiServerConfig, plane: Arc<ControlPlane>) -> Self {
        Self {
            config,
            state: Arc::new(AppState { plane }),
        }
    }

    /// Build the router with all routes
    pub fn build_router(&self) -> Router {
        let api_doc = ApiDoc::openapi();
        let token = Arc::new(middleware::AdminToken::new(self.config.admin_token.clone()));

        let public_router = Router::new().route("/api/health", get(handlers::health_check));

        let protected_router = Router::new()
            .route(
                "/api/domains",
                get(handlers::list_domains).post(handlers::create_domain),
            )
            .route(
                "/api/domains/{id}",
                get(handlers::get_domain).delete(handlers::delete_domain),
            )
            .route("/api/domains/{id}/verify", post(handlers::verify_domain))
            .route("/api/domains/{id}/reset", post(handlers::reset_domain))
            .route(
                "/api/domains/{id}/certificates",
                post(handlers::request_certificate),
            )
            .route(
                "/api/domains/{id}/rollback",
                post(handlers::rollback_certificate),
            )
            .route(
                "/api/certificates",
                get(handlers::list_certificates).post(handlers::upload_certificate),
            )
            .route(
                "/api/certificates/{id}",
                get(handlers::get_certificate).delete(handlers::delete_certificate),
            )
            .route(
                "/api/routes",
                get(handlers::list_routes).post(handlers::attach_route),
            )
            .route("/api/routes/{id}", axum::routing::delete(handlers::detach_route))
            .route(
                "/api/dns-providers",
                get(handlers::list_providers).post(handlers::create_provider),
            )
            .route(
                "/api/dns-providers/{id}",
                get(handlers::get_provider)
                    .patch(handlers::update_provider)
                    .delete(handlers::delete_provider),
            )
            .route("/api/proxy/status", get(handlers::proxy_status))
            .route("/api/proxy/validate", post(handlers::validate_config))
            .route("/api/proxy/reload", post(handlers::force_reload))
            .layer(axum_middleware::from_fn_with_state(
                token,
                middleware::require_admin_token,
            ));

        let router = Router::new()
            .merge(SwaggerUi::new("/swagger-ui").url("/api/openapi.json", api_doc))
            .merge(public_router)
            .merge(protected_router)
            .with_state(self.state.clone());

        let mut router = router.layer(TraceLayer::new_for_http());

        if self.config.enable_cors {
            let cors = CorsLayer::new()
                .allow_methods([
                    Method::GET,
                    Method::POST,
                    Method::DELETE,
                    Method::PATCH,
                ])
                .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
                .allow_origin(tower_http::cors::AllowOrigin::predicate(|origin, _| {
                    let origin = origin.to_str().unwrap_or("");
                    origin.starts_with("http://localhost:")
                        || origin.starts_with("http://127.0.0.1:")
                }));
            router = router.layer(cors);
        }

        router
    }

    /// Serve until `shutdown` resolves
    pub async fn start<F>(self, shutdown: F) -> Result<(), anyhow::Error>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let router = self.build_router();

        info!("Starting API server on {}", self.config.bind_addr);
        info!("Swagger UI: http://{}/swagger-ui", self.config.bind_addr);
        if self.config.admin_token.is_none() {
            info!("No admin token configured; the API is unauthenticated");
        }

        let listener = tokio::net::TcpListener::bind(self.config.bind_addr).await?;

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

        info!("API server stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_openapi_generation() {
        let doc = ApiDoc::openapi();
        let json = doc.to_json().unwrap();
        assert!(json.contains("/api/domains/{id}/verify"));
        assert!(json.contains("/api/proxy/reload"));
    }
}
