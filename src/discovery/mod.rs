//! Discovery
//!
//! Query surface over the registry store: which components provide a
//! capability, and what URL reaches a component right now.

mod cache;

pub use cache::{CacheStats, DiscoveryCache};

use crate::environment::{AddressRules, DeploymentEnvironment};
use crate::error::{RegistryError, RegistryResult};
use crate::registry::{
    ListFilter, RegistryStore, ServiceEndpoint, ServiceRecord, StatusFilter,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_URL_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDiscoveryResponse {
    pub url: String,

    pub ttl_seconds: u64,
}

impl ServiceDiscoveryResponse {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }
}

pub struct DiscoveryService {
    store: Arc<RegistryStore>,

    rules: AddressRules,

    url_ttl: Duration,
}

impl DiscoveryService {
    pub fn new(store: Arc<RegistryStore>, rules: AddressRules) -> Self {
        Self {
            store,
            rules,
            url_ttl: DEFAULT_URL_TTL,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.url_ttl = ttl;
        self
    }

    pub fn environment(&self) -> DeploymentEnvironment {
        self.rules.environment
    }

    pub fn rules(&self) -> &AddressRules {
        &self.rules
    }

    pub fn store(&self) -> &Arc<RegistryStore> {
        &self.store
    }

    /// Resolves a component id (or, failing that, a component name) to the
    /// URL of its first healthy endpoint. Among several healthy candidates
    /// the earliest registration wins; within one registration the first
    /// listed endpoint reported healthy wins.
    pub fn resolve(&self, component: &str) -> RegistryResult<ServiceDiscoveryResponse> {
        self.candidates(component, StatusFilter::Healthy)
            .iter()
            .find_map(|record| {
                record
                    .registration
                    .endpoints
                    .iter()
                    .find(|e| e.healthy)
                    .map(|endpoint| self.rules.endpoint_url(record.id(), endpoint))
            })
            .map(|url| ServiceDiscoveryResponse {
                url,
                ttl_seconds: self.url_ttl.as_secs(),
            })
            .ok_or_else(|| RegistryError::NotFound(component.to_string()))
    }

    pub fn find_by_capability(&self, capability: &str) -> Vec<ServiceRecord> {
        self.store
            .list(&ListFilter::healthy().with_capability(capability))
    }

    pub fn find(&self, filter: &ListFilter) -> Vec<ServiceRecord> {
        self.store.list(filter)
    }

    /// Every known endpoint of a component, whatever its health.
    pub fn endpoints(&self, component: &str) -> RegistryResult<Vec<ServiceEndpoint>> {
        let candidates = self.candidates(component, StatusFilter::Any);
        if candidates.is_empty() {
            return Err(RegistryError::NotFound(component.to_string()));
        }
        Ok(candidates
            .into_iter()
            .flat_map(|record| record.registration.endpoints)
            .collect())
    }

    fn candidates(&self, component: &str, status: StatusFilter) -> Vec<ServiceRecord> {
        if let Some(record) = self.store.get(component) {
            if status.matches(record.status) {
                return vec![record];
            }
        }

        self.store
            .list(&ListFilter::with_status(status))
            .into_iter()
            .filter(|record| record.registration.name == component)
            .collect()
    }
}
