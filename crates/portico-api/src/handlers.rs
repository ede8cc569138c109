use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use portico_control::{
    AttachRoute, ControlError, CreateDomain, CreateProvider, DomainDetails, UploadRequest,
    VerifyOutcome,
};
use portico_db::entities::certificate;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::models::*;
use crate::AppState;

type ApiError = (StatusCode, Json<ErrorResponse>);
type ApiResult<T> = Result<T, ApiError>;

/// Map a control plane error to a status and body.
///
/// Internal errors are logged in full; clients only see a fixed message.
pub fn error_response(e: ControlError) -> ApiError {
    let status = match &e {
        ControlError::Validation(_) => StatusCode::BAD_REQUEST,
        ControlError::NotFound(_) => StatusCode::NOT_FOUND,
        ControlError::Conflict(_) => StatusCode::CONFLICT,
        ControlError::ExternalService {
            transient: true, ..
        } => StatusCode::SERVICE_UNAVAILABLE,
        ControlError::ExternalService { .. } | ControlError::ConfigApply(_) => {
            StatusCode::BAD_GATEWAY
        }
        ControlError::ConfigGeneration(_) => StatusCode::UNPROCESSABLE_ENTITY,
        _ if e.is_key_unavailable() => StatusCode::SERVICE_UNAVAILABLE,
        ControlError::Encryption(_) | ControlError::Internal(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    if status.is_server_error() {
        warn!(code = e.code(), error = %e, "Request failed");
    }
    let message = match &e {
        ControlError::Internal(_) => "internal error".to_string(),
        other => other.to_string(),
    };
    (
        status,
        Json(ErrorResponse {
            error: message,
            code: Some(e.code().to_string()),
        }),
    )
}

fn domain_view(details: DomainDetails) -> Domain {
    Domain::new(details.domain, details.verification)
}

fn certificate_view(state: &AppState, cert: certificate::Model) -> Certificate {
    let due = state.plane.renewal_due_at(&cert);
    Certificate::new(cert, due)
}

/// Health check
#[utoipa::path(
    get,
    path = "/api/health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse)
    ),
    tag = "system"
)]
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// Domains

/// Register a custom domain
#[utoipa::path(
    post,
    path = "/api/domains",
    request_body = CreateDomainRequest,
    responses(
        (status = 201, description = "Domain created", body = Domain),
        (status = 400, description = "Invalid domain or provider", body = ErrorResponse),
        (status = 409, description = "Domain already registered", body = ErrorResponse)
    ),
    tag = "domains"
)]
pub async fn create_domain(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateDomainRequest>,
) -> ApiResult<(StatusCode, Json<Domain>)> {
    info!(domain = %req.name, method = req.verification_method.as_str(), "Creating domain");
    let details = state
        .plane
        .create_domain(CreateDomain {
            name: req.name,
            verification_method: req.verification_method,
            provider_id: req.provider_id,
            zone_id: req.zone_id,
            auto_manage: req.auto_manage,
        })
        .await
        .map_err(error_response)?;
    Ok((StatusCode::CREATED, Json(domain_view(details))))
}

/// List domains
#[utoipa::path(
    get,
    path = "/api/domains",
    responses(
        (status = 200, description = "Registered domains", body = DomainList)
    ),
    tag = "domains"
)]
pub async fn list_domains(State(state): State<Arc<AppState>>) -> ApiResult<Json<DomainList>> {
    let domains: Vec<Domain> = state
        .plane
        .list_domains()
        .await
        .map_err(error_response)?
        .into_iter()
        .map(|d| Domain::new(d, None))
        .collect();
    let total = domains.len();
    Ok(Json(DomainList { domains, total }))
}

/// Get a domain with its verification state
#[utoipa::path(
    get,
    path = "/api/domains/{id}",
    params(("id" = String, Path, description = "Domain ID")),
    responses(
        (status = 200, description = "Domain", body = Domain),
        (status = 404, description = "Domain not found", body = ErrorResponse)
    ),
    tag = "domains"
)]
pub async fn get_domain(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Domain>> {
    let details = state.plane.get_domain(&id).await.map_err(error_response)?;
    Ok(Json(domain_view(details)))
}

/// Delete a domain, its routes, certificates and provider records
#[utoipa::path(
    delete,
    path = "/api/domains/{id}",
    params(("id" = String, Path, description = "Domain ID")),
    responses(
        (status = 204, description = "Domain deleted"),
        (status = 404, description = "Domain not found", body = ErrorResponse)
    ),
    tag = "domains"
)]
pub async fn delete_domain(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    info!(domain_id = %id, "Deleting domain");
    state.plane.delete_domain(&id).await.map_err(error_response)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Check the domain's DNS record now
#[utoipa::path(
    post,
    path = "/api/domains/{id}/verify",
    params(("id" = String, Path, description = "Domain ID")),
    responses(
        (status = 200, description = "Verification attempted", body = VerifyResponse),
        (status = 404, description = "Domain not found", body = ErrorResponse),
        (status = 409, description = "Work for the domain is in progress", body = ErrorResponse)
    ),
    tag = "domains"
)]
pub async fn verify_domain(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<VerifyResponse>> {
    let outcome = state.plane.verify_domain(&id).await.map_err(error_response)?;
    let outcome = match outcome {
        VerifyOutcome::Verified(_) => "verified",
        VerifyOutcome::Retrying { .. } => "retrying",
        VerifyOutcome::GaveUp { .. } => "gave_up",
        VerifyOutcome::Skipped(_) => "skipped",
    };
    let details = state.plane.get_domain(&id).await.map_err(error_response)?;
    Ok(Json(VerifyResponse {
        outcome: outcome.to_string(),
        domain: domain_view(details),
    }))
}

/// Move an errored domain back to pending
#[utoipa::path(
    post,
    path = "/api/domains/{id}/reset",
    params(("id" = String, Path, description = "Domain ID")),
    responses(
        (status = 200, description = "Domain reset", body = Domain),
        (status = 400, description = "Domain is not in error", body = ErrorResponse)
    ),
    tag = "domains"
)]
pub async fn reset_domain(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Domain>> {
    let details = state.plane.reset_domain(&id).await.map_err(error_response)?;
    Ok(Json(domain_view(details)))
}

/// Request a certificate from the configured authority
#[utoipa::path(
    post,
    path = "/api/domains/{id}/certificates",
    params(("id" = String, Path, description = "Domain ID")),
    responses(
        (status = 202, description = "Issuance started", body = Certificate),
        (status = 400, description = "Domain not verified", body = ErrorResponse),
        (status = 409, description = "Issuance already pending", body = ErrorResponse)
    ),
    tag = "certificates"
)]
pub async fn request_certificate(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<(StatusCode, Json<Certificate>)> {
    let cert = state
        .plane
        .request_certificate(&id)
        .await
        .map_err(error_response)?;
    Ok((StatusCode::ACCEPTED, Json(certificate_view(&state, cert))))
}

/// Serve the previous certificate again
#[utoipa::path(
    post,
    path = "/api/domains/{id}/rollback",
    params(("id" = String, Path, description = "Domain ID")),
    responses(
        (status = 200, description = "Certificate restored", body = Certificate),
        (status = 400, description = "No previous certificate is valid", body = ErrorResponse)
    ),
    tag = "certificates"
)]
pub async fn rollback_certificate(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Certificate>> {
    let cert = state
        .plane
        .rollback_certificate(&id)
        .await
        .map_err(error_response)?;
    Ok(Json(certificate_view(&state, cert)))
}

// Certificates

/// Upload a certificate and private key
#[utoipa::path(
    post,
    path = "/api/certificates",
    request_body = UploadCertificateRequest,
    responses(
        (status = 201, description = "Certificate stored and activated", body = Certificate),
        (status = 400, description = "Pair invalid or not covering the domain", body = ErrorResponse),
        (status = 503, description = "No master key configured to seal the private key", body = ErrorResponse)
    ),
    tag = "certificates"
)]
pub async fn upload_certificate(
    State(state): State<Arc<AppState>>,
    Json(req): Json<UploadCertificateRequest>,
) -> ApiResult<(StatusCode, Json<Certificate>)> {
    info!(domain_id = %req.domain_id, "Uploading certificate");
    let cert = state
        .plane
        .upload_certificate(UploadRequest {
            domain_id: req.domain_id,
            certificate_pem: req.certificate_pem,
            private_key_pem: req.private_key_pem,
            auto_renew: req.auto_renew,
        })
        .await
        .map_err(error_response)?;
    Ok((StatusCode::CREATED, Json(certificate_view(&state, cert))))
}

/// List certificates, newest first
#[utoipa::path(
    get,
    path = "/api/certificates",
    params(DomainFilter),
    responses(
        (status = 200, description = "Certificates", body = CertificateList)
    ),
    tag = "certificates"
)]
pub async fn list_certificates(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<DomainFilter>,
) -> ApiResult<Json<CertificateList>> {
    let certificates: Vec<Certificate> = state
        .plane
        .list_certificates(filter.domain_id.as_deref())
        .await
        .map_err(error_response)?
        .into_iter()
        .map(|c| certificate_view(&state, c))
        .collect();
    let total = certificates.len();
    Ok(Json(CertificateList {
        certificates,
        total,
    }))
}

/// Get certificate metadata
#[utoipa::path(
    get,
    path = "/api/certificates/{id}",
    params(("id" = String, Path, description = "Certificate ID")),
    responses(
        (status = 200, description = "Certificate", body = Certificate),
        (status = 404, description = "Certificate not found", body = ErrorResponse)
    ),
    tag = "certificates"
)]
pub async fn get_certificate(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Certificate>> {
    let cert = state
        .plane
        .get_certificate(&id)
        .await
        .map_err(error_response)?;
    Ok(Json(certificate_view(&state, cert)))
}

/// Delete a certificate no domain serves
#[utoipa::path(
    delete,
    path = "/api/certificates/{id}",
    params(("id" = String, Path, description = "Certificate ID")),
    responses(
        (status = 204, description = "Certificate deleted"),
        (status = 409, description = "Certificate is being served", body = ErrorResponse)
    ),
    tag = "certificates"
)]
pub async fn delete_certificate(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state
        .plane
        .delete_certificate(&id)
        .await
        .map_err(error_response)?;
    Ok(StatusCode::NO_CONTENT)
}

// Routes

/// Attach a service to an active domain
#[utoipa::path(
    post,
    path = "/api/routes",
    request_body = AttachRouteRequest,
    responses(
        (status = 201, description = "Route attached", body = Route),
        (status = 400, description = "Domain not active, unknown service or bad port", body = ErrorResponse)
    ),
    tag = "routes"
)]
pub async fn attach_route(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AttachRouteRequest>,
) -> ApiResult<(StatusCode, Json<Route>)> {
    let route = state
        .plane
        .attach_route(AttachRoute {
            domain_id: req.domain_id,
            service_id: req.service_id,
            path: req.path,
            port: req.port,
            tls: req.tls,
        })
        .await
        .map_err(error_response)?;
    Ok((StatusCode::CREATED, Json(Route::from(route))))
}

/// List routes
#[utoipa::path(
    get,
    path = "/api/routes",
    params(DomainFilter),
    responses(
        (status = 200, description = "Routes", body = RouteList)
    ),
    tag = "routes"
)]
pub async fn list_routes(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<DomainFilter>,
) -> ApiResult<Json<RouteList>> {
    let routes: Vec<Route> = state
        .plane
        .list_routes(filter.domain_id.as_deref())
        .await
        .map_err(error_response)?
        .into_iter()
        .map(Route::from)
        .collect();
    let total = routes.len();
    Ok(Json(RouteList { routes, total }))
}

/// Detach a route
#[utoipa::path(
    delete,
    path = "/api/routes/{id}",
    params(("id" = String, Path, description = "Route ID")),
    responses(
        (status = 204, description = "Route detached"),
        (status = 404, description = "Route not found", body = ErrorResponse)
    ),
    tag = "routes"
)]
pub async fn detach_route(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.plane.detach_route(&id).await.map_err(error_response)?;
    Ok(StatusCode::NO_CONTENT)
}

// DNS providers

/// Register a DNS provider
#[utoipa::path(
    post,
    path = "/api/dns-providers",
    request_body = CreateProviderRequest,
    responses(
        (status = 201, description = "Provider created", body = Provider),
        (status = 400, description = "Missing name or credentials", body = ErrorResponse),
        (status = 409, description = "Name already used", body = ErrorResponse),
        (status = 503, description = "No master key configured to seal the token", body = ErrorResponse)
    ),
    tag = "dns-providers"
)]
pub async fn create_provider(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateProviderRequest>,
) -> ApiResult<(StatusCode, Json<Provider>)> {
    info!(provider = %req.name, kind = req.kind.as_str(), "Creating DNS provider");
    let provider = state
        .plane
        .create_provider(CreateProvider {
            name: req.name,
            kind: req.kind,
            api_token: req.api_token,
        })
        .await
        .map_err(error_response)?;
    Ok((StatusCode::CREATED, Json(Provider::from(provider))))
}

/// List DNS providers
#[utoipa::path(
    get,
    path = "/api/dns-providers",
    responses(
        (status = 200, description = "Providers", body = ProviderList)
    ),
    tag = "dns-providers"
)]
pub async fn list_providers(State(state): State<Arc<AppState>>) -> ApiResult<Json<ProviderList>> {
    let providers: Vec<Provider> = state
        .plane
        .list_providers()
        .await
        .map_err(error_response)?
        .into_iter()
        .map(Provider::from)
        .collect();
    let total = providers.len();
    Ok(Json(ProviderList { providers, total }))
}

/// Get a DNS provider
#[utoipa::path(
    get,
    path = "/api/dns-providers/{id}",
    params(("id" = String, Path, description = "Provider ID")),
    responses(
        (status = 200, description = "Provider", body = Provider),
        (status = 404, description = "Provider not found", body = ErrorResponse)
    ),
    tag = "dns-providers"
)]
pub async fn get_provider(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Provider>> {
    let provider = state.plane.get_provider(&id).await.map_err(error_response)?;
    Ok(Json(Provider::from(provider)))
}

/// Enable or disable a DNS provider
#[utoipa::path(
    patch,
    path = "/api/dns-providers/{id}",
    params(("id" = String, Path, description = "Provider ID")),
    request_body = UpdateProviderRequest,
    responses(
        (status = 200, description = "Provider updated", body = Provider),
        (status = 404, description = "Provider not found", body = ErrorResponse)
    ),
    tag = "dns-providers"
)]
pub async fn update_provider(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<UpdateProviderRequest>,
) -> ApiResult<Json<Provider>> {
    let provider = state
        .plane
        .set_provider_active(&id, req.active)
        .await
        .map_err(error_response)?;
    Ok(Json(Provider::from(provider)))
}

/// Delete a DNS provider no domain uses
#[utoipa::path(
    delete,
    path = "/api/dns-providers/{id}",
    params(("id" = String, Path, description = "Provider ID")),
    responses(
        (status = 204, description = "Provider deleted"),
        (status = 409, description = "Provider in use", body = ErrorResponse)
    ),
    tag = "dns-providers"
)]
pub async fn delete_provider(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state
        .plane
        .delete_provider(&id)
        .await
        .map_err(error_response)?;
    Ok(StatusCode::NO_CONTENT)
}

// Proxy

/// Reverse proxy reconciliation status
#[utoipa::path(
    get,
    path = "/api/proxy/status",
    responses(
        (status = 200, description = "Proxy status", body = ProxyStatus)
    ),
    tag = "proxy"
)]
pub async fn proxy_status(State(state): State<Arc<AppState>>) -> Json<ProxyStatus> {
    Json(ProxyStatus::from(state.plane.proxy_status()))
}

/// Render the configuration and run the proxy's checker without applying it
#[utoipa::path(
    post,
    path = "/api/proxy/validate",
    responses(
        (status = 200, description = "Validation result", body = ConfigReport),
        (status = 422, description = "Configuration could not be generated", body = ErrorResponse)
    ),
    tag = "proxy"
)]
pub async fn validate_config(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<ConfigReport>> {
    let rendered = state.plane.render_config().await.map_err(error_response)?;
    let excluded = rendered
        .excluded
        .iter()
        .map(|e| ExcludedDomain {
            name: e.name.clone(),
            reason: e.reason.clone(),
        })
        .collect();

    let (valid, error) = match state.plane.validate_config().await {
        Ok(_) => (true, None),
        Err(ControlError::ConfigApply(reason)) => (false, Some(reason)),
        Err(e) => return Err(error_response(e)),
    };
    debug!(hash = %rendered.hash, valid, "Configuration validated");
    Ok(Json(ConfigReport {
        hash: rendered.hash,
        valid,
        error,
        excluded,
    }))
}

/// Apply the current configuration now, even if unchanged
#[utoipa::path(
    post,
    path = "/api/proxy/reload",
    responses(
        (status = 200, description = "Configuration applied", body = ReloadResponse),
        (status = 502, description = "Proxy rejected the configuration", body = ErrorResponse)
    ),
    tag = "proxy"
)]
pub async fn force_reload(State(state): State<Arc<AppState>>) -> ApiResult<Json<ReloadResponse>> {
    info!("Forcing proxy reload");
    let hash = state.plane.force_reload().await.map_err(error_response)?;
    Ok(Json(ReloadResponse { hash }))
}
