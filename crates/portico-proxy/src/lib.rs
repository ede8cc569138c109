//! Reverse proxy configuration for Portico
//!
//! [`generator`] renders the desired routing state to nginx configuration
//! text; [`controller`] validates it with the proxy's own checker and swaps it
//! in with a hot reload.

pub mod controller;
pub mod fs;
pub mod generator;

/// Location the proxy serves HTTP-01 challenge files from
pub const CHALLENGE_LOCATION: &str = "/.well-known/acme-challenge/";

pub use controller::{
    CertificateFiles, NginxController, NginxSettings, ProxyController, ProxyError,
    CONFIG_PLACEHOLDER,
};
pub use generator::{
    certificate_paths, config_hash, generate, is_safe_path, ConfigGenerationError, DesiredDomain,
    DesiredRoute, DesiredState, ExcludedDomain, GeneratedConfig, GeneratorSettings,
};
