//! Deterministic nginx configuration from the desired routing state
//!
//! Generation is a pure function: the same [`DesiredState`] always renders to
//! the same bytes, which lets the reconciler skip unchanged cycles by hash.

use std::collections::BTreeSet;
use std::fmt::Write;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::CHALLENGE_LOCATION;

/// Errors raised when the input cannot be expressed as a valid configuration
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigGenerationError {
    #[error("Invalid domain name '{0}'")]
    InvalidDomainName(String),

    #[error("Duplicate domain '{0}'")]
    DuplicateDomain(String),

    #[error("Invalid route path '{path}' on {domain}")]
    InvalidPath { domain: String, path: String },

    #[error("Duplicate route path '{path}' on {domain}")]
    DuplicatePath { domain: String, path: String },

    #[error("Invalid service id '{service_id}' on {domain}")]
    InvalidServiceId { domain: String, service_id: String },

    #[error("Invalid port {port} on {domain}")]
    InvalidPort { domain: String, port: i64 },

    #[error("Invalid certificate id '{0}'")]
    InvalidCertificateId(String),
}

/// Paths and ports the rendered configuration refers to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratorSettings {
    pub http_port: u16,
    pub https_port: u16,
    /// Directory served under `/.well-known/acme-challenge/`
    pub webroot: PathBuf,
    /// Directory holding `<certificate id>.crt` / `.key`
    pub cert_dir: PathBuf,
    pub worker_connections: u32,
}

impl Default for GeneratorSettings {
    fn default() -> Self {
        Self {
            http_port: 80,
            https_port: 443,
            webroot: PathBuf::from("/var/lib/portico/webroot"),
            cert_dir: PathBuf::from("/var/lib/portico/certs"),
            worker_connections: 1024,
        }
    }
}

/// A route to an internal service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredRoute {
    pub path: String,
    pub service_id: String,
    pub port: i64,
    pub tls: bool,
}

/// A domain to serve
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredDomain {
    pub name: String,
    /// Id of the domain's active certificate
    pub certificate_id: Option<String>,
    pub routes: Vec<DesiredRoute>,
}

/// Everything the configuration is rendered from
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DesiredState {
    pub domains: Vec<DesiredDomain>,
}

/// A domain left out of the configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExcludedDomain {
    pub name: String,
    pub reason: String,
}

/// Rendered configuration with its content hash
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedConfig {
    pub text: String,
    /// Lowercase hex SHA-256 of `text`
    pub hash: String,
    pub excluded: Vec<ExcludedDomain>,
    /// Certificate ids the configuration references, sorted
    pub certificate_ids: Vec<String>,
}

/// SHA-256 of a configuration text, lowercase hex
pub fn config_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Certificate and key file locations for a certificate id
pub fn certificate_paths(cert_dir: &Path, certificate_id: &str) -> (PathBuf, PathBuf) {
    (
        cert_dir.join(format!("{certificate_id}.crt")),
        cert_dir.join(format!("{certificate_id}.key")),
    )
}

/// Render the nginx main configuration for `state`
pub fn generate(
    state: &DesiredState,
    settings: &GeneratorSettings,
) -> Result<GeneratedConfig, ConfigGenerationError> {
    let mut domains: Vec<&DesiredDomain> = state.domains.iter().collect();
    domains.sort_by(|a, b| a.name.cmp(&b.name));

    let mut seen = BTreeSet::new();
    let mut excluded = Vec::new();
    let mut served = Vec::new();
    for domain in domains {
        validate_domain(domain)?;
        if !seen.insert(domain.name.as_str()) {
            return Err(ConfigGenerationError::DuplicateDomain(domain.name.clone()));
        }
        if domain.certificate_id.is_none() && domain.routes.iter().any(|r| r.tls) {
            excluded.push(ExcludedDomain {
                name: domain.name.clone(),
                reason: "TLS route without an active certificate".to_string(),
            });
            continue;
        }
        served.push(domain);
    }

    let mut out = String::new();
    out.push_str("# Managed by portico; manual edits are overwritten.\n");
    out.push_str("worker_processes auto;\n\n");
    let _ = writeln!(
        out,
        "events {{\n    worker_connections {};\n}}\n",
        settings.worker_connections
    );
    out.push_str("http {\n");
    out.push_str("    server_names_hash_bucket_size 128;\n");
    out.push_str("    map $http_upgrade $connection_upgrade {\n");
    out.push_str("        default upgrade;\n");
    out.push_str("        '' close;\n");
    out.push_str("    }\n\n");

    // Catch-all answering ACME challenges for hosts not configured yet
    let _ = writeln!(out, "    server {{");
    let _ = writeln!(out, "        listen {} default_server;", settings.http_port);
    let _ = writeln!(out, "        server_name _;");
    write_challenge_location(&mut out, &settings.webroot);
    let _ = writeln!(out, "        location / {{\n            return 404;\n        }}");
    let _ = writeln!(out, "    }}");

    let mut certificate_ids = BTreeSet::new();
    for domain in served {
        let routes = sorted_routes(domain);
        write_http_server(&mut out, domain, &routes, settings);
        if let Some(cert_id) = &domain.certificate_id {
            certificate_ids.insert(cert_id.clone());
            write_https_server(&mut out, domain, cert_id, &routes, settings);
        }
    }
    out.push_str("}\n");

    Ok(GeneratedConfig {
        hash: config_hash(&out),
        text: out,
        excluded,
        certificate_ids: certificate_ids.into_iter().collect(),
    })
}

/// Longest path first so the most specific route is listed first
fn sorted_routes(domain: &DesiredDomain) -> Vec<&DesiredRoute> {
    let mut routes: Vec<&DesiredRoute> = domain.routes.iter().collect();
    routes.sort_by(|a, b| {
        b.path
            .len()
            .cmp(&a.path.len())
            .then_with(|| a.path.cmp(&b.path))
    });
    routes
}

fn write_challenge_location(out: &mut String, webroot: &Path) {
    let _ = writeln!(out, "        location {} {{", CHALLENGE_LOCATION);
    let _ = writeln!(out, "            root {};", webroot.display());
    let _ = writeln!(out, "            default_type text/plain;");
    let _ = writeln!(out, "        }}");
}

fn write_proxy_location(out: &mut String, route: &DesiredRoute) {
    let _ = writeln!(out, "        location {} {{", route.path);
    let _ = writeln!(
        out,
        "            proxy_pass http://{}:{};",
        route.service_id, route.port
    );
    out.push_str("            proxy_http_version 1.1;\n");
    out.push_str("            proxy_set_header Host $host;\n");
    out.push_str("            proxy_set_header X-Real-IP $remote_addr;\n");
    out.push_str("            proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;\n");
    out.push_str("            proxy_set_header X-Forwarded-Proto $scheme;\n");
    out.push_str("            proxy_set_header Upgrade $http_upgrade;\n");
    out.push_str("            proxy_set_header Connection $connection_upgrade;\n");
    out.push_str("        }\n");
}

fn has_root_route(routes: &[&DesiredRoute]) -> bool {
    routes.iter().any(|r| r.path == "/")
}

fn write_http_server(
    out: &mut String,
    domain: &DesiredDomain,
    routes: &[&DesiredRoute],
    settings: &GeneratorSettings,
) {
    let _ = writeln!(out, "\n    server {{");
    let _ = writeln!(out, "        listen {};", settings.http_port);
    let _ = writeln!(out, "        server_name {};", domain.name);
    write_challenge_location(out, &settings.webroot);
    for route in routes {
        if route.tls {
            let _ = writeln!(out, "        location {} {{", route.path);
            out.push_str("            return 301 https://$host$request_uri;\n");
            out.push_str("        }\n");
        } else {
            write_proxy_location(out, route);
        }
    }
    if !has_root_route(routes) {
        out.push_str("        location / {\n            return 404;\n        }\n");
    }
    out.push_str("    }\n");
}

fn write_https_server(
    out: &mut String,
    domain: &DesiredDomain,
    cert_id: &str,
    routes: &[&DesiredRoute],
    settings: &GeneratorSettings,
) {
    let (crt, key) = certificate_paths(&settings.cert_dir, cert_id);
    let _ = writeln!(out, "\n    server {{");
    let _ = writeln!(out, "        listen {} ssl;", settings.https_port);
    let _ = writeln!(out, "        server_name {};", domain.name);
    let _ = writeln!(out, "        ssl_certificate {};", crt.display());
    let _ = writeln!(out, "        ssl_certificate_key {};", key.display());
    out.push_str("        ssl_protocols TLSv1.2 TLSv1.3;\n");
    for route in routes {
        write_proxy_location(out, route);
    }
    if !has_root_route(routes) {
        out.push_str("        location / {\n            return 404;\n        }\n");
    }
    out.push_str("    }\n");
}

fn validate_domain(domain: &DesiredDomain) -> Result<(), ConfigGenerationError> {
    let name = domain.name.as_str();
    let labels_ok = !name.is_empty()
        && name.len() <= 253
        && name.split('.').enumerate().all(|(i, label)| {
            (i == 0 && label == "*")
                || (!label.is_empty()
                    && label.len() <= 63
                    && !label.starts_with('-')
                    && !label.ends_with('-')
                    && label
                        .chars()
                        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'))
        });
    if !labels_ok {
        return Err(ConfigGenerationError::InvalidDomainName(name.to_string()));
    }

    if let Some(cert_id) = &domain.certificate_id {
        let ok = !cert_id.is_empty()
            && cert_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !ok {
            return Err(ConfigGenerationError::InvalidCertificateId(cert_id.clone()));
        }
    }

    let mut paths = BTreeSet::new();
    for route in &domain.routes {
        if !is_safe_path(&route.path) {
            return Err(ConfigGenerationError::InvalidPath {
                domain: name.to_string(),
                path: route.path.clone(),
            });
        }
        if !paths.insert(route.path.as_str()) {
            return Err(ConfigGenerationError::DuplicatePath {
                domain: name.to_string(),
                path: route.path.clone(),
            });
        }
        let service_ok = !route.service_id.is_empty()
            && route
                .service_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !service_ok {
            return Err(ConfigGenerationError::InvalidServiceId {
                domain: name.to_string(),
                service_id: route.service_id.clone(),
            });
        }
        if !(1..=65535).contains(&route.port) {
            return Err(ConfigGenerationError::InvalidPort {
                domain: name.to_string(),
                port: route.port,
            });
        }
    }
    Ok(())
}

/// Absolute path without characters that nginx treats as syntax
pub fn is_safe_path(path: &str) -> bool {
    path.starts_with('/')
        && !path.starts_with(CHALLENGE_LOCATION)
        && path.chars().all(|c| {
            c.is_ascii_graphic() && !matches!(c, ';' | '{' | '}' | '"' | '\'' | '#' | '\\' | '$')
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(path: &str, tls: bool) -> DesiredRoute {
        DesiredRoute {
            path: path.to_string(),
            service_id: "web".to_string(),
            port: 8080,
            tls,
        }
    }

    fn domain(name: &str, cert: Option<&str>, routes: Vec<DesiredRoute>) -> DesiredDomain {
        DesiredDomain {
            name: name.to_string(),
            certificate_id: cert.map(str::to_string),
            routes,
        }
    }

    #[test]
    fn test_output_is_deterministic_regardless_of_input_order() {
        let a = domain("a.example.com", Some("cert-a"), vec![route("/", true)]);
        let b = domain(
            "b.example.com",
            Some("cert-b"),
            vec![route("/", true), route("/api", true)],
        );
        let settings = GeneratorSettings::default();

        let first = generate(
            &DesiredState {
                domains: vec![a.clone(), b.clone()],
            },
            &settings,
        )
        .unwrap();
        let second = generate(
            &DesiredState {
                domains: vec![b, a],
            },
            &settings,
        )
        .unwrap();

        assert_eq!(first.text, second.text);
        assert_eq!(first.hash, second.hash);
        assert_eq!(first.hash, config_hash(&first.text));
        assert_eq!(first.certificate_ids, vec!["cert-a", "cert-b"]);
    }

    #[test]
    fn test_domains_sorted_by_name_and_routes_by_specificity() {
        let state = DesiredState {
            domains: vec![
                domain(
                    "zeta.example.com",
                    Some("z"),
                    vec![route("/", true), route("/api/v1", true), route("/api", true)],
                ),
                domain("alpha.example.com", Some("a"), vec![route("/", true)]),
            ],
        };
        let config = generate(&state, &GeneratorSettings::default()).unwrap();
        let text = &config.text;

        let alpha = text.find("server_name alpha.example.com").unwrap();
        let zeta = text.find("server_name zeta.example.com").unwrap();
        assert!(alpha < zeta);

        let https = text.rfind("listen 443 ssl").unwrap();
        let v1 = text[https..].find("location /api/v1 ").unwrap();
        let api = text[https..].find("location /api ").unwrap();
        let root = text[https..].find("location / ").unwrap();
        assert!(v1 < api && api < root);
    }

    #[test]
    fn test_tls_domain_without_certificate_is_excluded() {
        let state = DesiredState {
            domains: vec![
                domain("pending.example.com", None, vec![route("/", true)]),
                domain("plain.example.com", None, vec![route("/", false)]),
            ],
        };
        let config = generate(&state, &GeneratorSettings::default()).unwrap();

        assert_eq!(config.excluded.len(), 1);
        assert_eq!(config.excluded[0].name, "pending.example.com");
        assert!(!config.text.contains("pending.example.com"));
        assert!(config.text.contains("server_name plain.example.com"));
        assert!(!config.text.contains("listen 443"));
    }

    #[test]
    fn test_tls_route_redirects_on_http_and_references_certificate_files() {
        let settings = GeneratorSettings {
            cert_dir: PathBuf::from("/certs"),
            ..Default::default()
        };
        let state = DesiredState {
            domains: vec![domain(
                "shop.example.com",
                Some("c-1"),
                vec![route("/", true), route("/health", false)],
            )],
        };
        let text = generate(&state, &settings).unwrap().text;

        assert!(text.contains("return 301 https://$host$request_uri;"));
        assert!(text.contains("ssl_certificate /certs/c-1.crt;"));
        assert!(text.contains("ssl_certificate_key /certs/c-1.key;"));
        assert!(text.contains("proxy_pass http://web:8080;"));
        assert!(text.contains("location /.well-known/acme-challenge/ {"));
    }

    #[test]
    fn test_syntax_breaking_input_is_rejected() {
        let settings = GeneratorSettings::default();
        let bad_path = DesiredState {
            domains: vec![domain(
                "shop.example.com",
                Some("c"),
                vec![route("/x; return 200", true)],
            )],
        };
        assert!(matches!(
            generate(&bad_path, &settings),
            Err(ConfigGenerationError::InvalidPath { .. })
        ));

        let mut service = route("/", true);
        service.service_id = "web }".to_string();
        let bad_service = DesiredState {
            domains: vec![domain("shop.example.com", Some("c"), vec![service])],
        };
        assert!(matches!(
            generate(&bad_service, &settings),
            Err(ConfigGenerationError::InvalidServiceId { .. })
        ));

        let bad_name = DesiredState {
            domains: vec![domain("shop example.com", None, vec![])],
        };
        assert!(matches!(
            generate(&bad_name, &settings),
            Err(ConfigGenerationError::InvalidDomainName(_))
        ));
    }

    #[test]
    fn test_duplicate_path_is_rejected() {
        let state = DesiredState {
            domains: vec![domain(
                "shop.example.com",
                Some("c"),
                vec![route("/api", true), route("/api", false)],
            )],
        };
        assert!(matches!(
            generate(&state, &GeneratorSettings::default()),
            Err(ConfigGenerationError::DuplicatePath { .. })
        ));
    }

    #[test]
    fn test_empty_state_still_serves_challenges() {
        let config = generate(&DesiredState::default(), &GeneratorSettings::default()).unwrap();
        assert!(config.text.contains("listen 80 default_server;"));
        assert!(config.text.contains(CHALLENGE_LOCATION));
        assert!(config.excluded.is_empty());
    }
}
