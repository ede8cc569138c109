//! Lookup of the internal services routes point at

use std::collections::HashMap;

use async_trait::async_trait;

use crate::config::ServiceDefinition;

/// A service known to the platform
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    pub id: String,
    /// Ports the service accepts traffic on; empty accepts any port
    pub ports: Vec<u16>,
}

impl ServiceInfo {
    pub fn accepts_port(&self, port: u16) -> bool {
        self.ports.is_empty() || self.ports.contains(&port)
    }
}

/// Source of truth for service existence, owned by the container layer
#[async_trait]
pub trait ServiceStore: Send + Sync {
    async fn lookup(&self, service_id: &str) -> Option<ServiceInfo>;
}

/// Services declared in the settings file
#[derive(Debug, Default, Clone)]
pub struct StaticServiceStore {
    services: HashMap<String, ServiceInfo>,
}

impl StaticServiceStore {
    pub fn new(definitions: &[ServiceDefinition]) -> Self {
        let services = definitions
            .iter()
            .map(|d| {
                (
                    d.id.clone(),
                    ServiceInfo {
                        id: d.id.clone(),
                        ports: d.ports.clone(),
                    },
                )
            })
            .collect();
        Self { services }
    }
}

#[async_trait]
impl ServiceStore for StaticServiceStore {
    async fn lookup(&self, service_id: &str) -> Option<ServiceInfo> {
        self.services.get(service_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_lookup() {
        let store = StaticServiceStore::new(&[
            ServiceDefinition {
                id: "web".to_string(),
                ports: vec![8080],
            },
            ServiceDefinition {
                id: "any".to_string(),
                ports: vec![],
            },
        ]);

        let web = store.lookup("web").await.unwrap();
        assert!(web.accepts_port(8080));
        assert!(!web.accepts_port(9090));
        assert!(store.lookup("any").await.unwrap().accepts_port(1234));
        assert!(store.lookup("missing").await.is_none());
    }
}
