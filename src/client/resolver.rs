//! Target Resolution
//!
//! Turns a component id into a base URL: cached URL, then a live discovery
//! query, then a statically constructed address. Discovery failures are
//! tracked by their own breaker so a dead registry costs one timeout per
//! cooldown rather than one per call.

use super::breaker::{BreakerConfig, BreakerState, CircuitBreaker};
use crate::config::well_known_port;
use crate::discovery::{CacheStats, DiscoveryCache, DiscoveryService, ServiceDiscoveryResponse};
use crate::environment::AddressRules;
use crate::error::{ComponentError, DiscoveryError, RegistryClientError, RegistryError};
use crate::registry::RegistryClient;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Live lookup of a component's current URL.
#[async_trait]
pub trait Discovery: Send + Sync {
    async fn resolve(&self, component: &str) -> Result<ServiceDiscoveryResponse, DiscoveryError>;
}

#[async_trait]
impl Discovery for DiscoveryService {
    async fn resolve(&self, component: &str) -> Result<ServiceDiscoveryResponse, DiscoveryError> {
        DiscoveryService::resolve(self, component).map_err(|e| match e {
            RegistryError::NotFound(id) => DiscoveryError::NotFound(id),
            other => DiscoveryError::Unavailable(other.to_string()),
        })
    }
}

#[async_trait]
impl Discovery for RegistryClient {
    async fn resolve(&self, component: &str) -> Result<ServiceDiscoveryResponse, DiscoveryError> {
        self.resolve_once(component).await.map_err(|e| match e {
            RegistryClientError::NotFound(id) => DiscoveryError::NotFound(id),
            other => DiscoveryError::Unavailable(other.to_string()),
        })
    }
}

/// Environment variable naming a component's port, e.g. `TEKTON_CORE_PORT`.
pub fn port_var(component_id: &str) -> String {
    format!(
        "{}_PORT",
        component_id.trim().to_ascii_uppercase().replace('-', "_")
    )
}

fn process_env(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

/// Address construction used when discovery cannot answer.
#[derive(Clone)]
pub struct StaticAddressing {
    rules: AddressRules,

    ports: BTreeMap<String, u16>,

    default_port: u16,

    env: fn(&str) -> Option<String>,
}

impl StaticAddressing {
    pub fn new(rules: AddressRules, ports: BTreeMap<String, u16>, default_port: u16) -> Self {
        Self {
            rules,
            ports,
            default_port,
            env: process_env,
        }
    }

    pub fn with_env_lookup(mut self, env: fn(&str) -> Option<String>) -> Self {
        self.env = env;
        self
    }

    pub fn rules(&self) -> &AddressRules {
        &self.rules
    }

    /// `{ID}_PORT`, then the configured table, then the well-known Tekton
    /// ports, then the default.
    pub fn port_for(&self, component_id: &str) -> u16 {
        let var = port_var(component_id);
        if let Some(raw) = (self.env)(&var) {
            match raw.trim().parse() {
                Ok(port) => return port,
                Err(_) => warn!(variable = %var, value = %raw, "ignoring invalid port"),
            }
        }

        self.ports
            .get(component_id)
            .copied()
            .or_else(|| well_known_port(component_id))
            .unwrap_or(self.default_port)
    }

    pub fn url_for(&self, component_id: &str) -> String {
        self.rules
            .static_url(component_id, self.port_for(component_id))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolvedFrom {
    Cache,

    Discovery,

    StaticFallback,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Resolution {
    pub url: String,

    pub source: ResolvedFrom,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolverStats {
    pub discovery_queries: u64,

    pub discovery_failures: u64,

    pub static_fallbacks: u64,

    pub discovery_breaker: BreakerState,

    pub cache_hits: u64,

    pub cache_misses: u64,

    pub cached_urls: usize,
}

pub struct Resolver {
    discovery: Option<Arc<dyn Discovery>>,

    cache: DiscoveryCache<String>,

    addressing: StaticAddressing,

    breaker: Arc<CircuitBreaker>,

    discovery_timeout: Duration,

    max_ttl: Duration,

    discovery_queries: AtomicU64,

    discovery_failures: AtomicU64,

    static_fallbacks: AtomicU64,
}

impl Resolver {
    pub fn new(
        discovery: Option<Arc<dyn Discovery>>,
        addressing: StaticAddressing,
        breaker: BreakerConfig,
        discovery_timeout: Duration,
        max_ttl: Duration,
    ) -> Self {
        Self {
            discovery,
            cache: DiscoveryCache::new(),
            addressing,
            breaker: Arc::new(CircuitBreaker::new("discovery", breaker)),
            discovery_timeout,
            max_ttl,
            discovery_queries: AtomicU64::new(0),
            discovery_failures: AtomicU64::new(0),
            static_fallbacks: AtomicU64::new(0),
        }
    }

    pub fn addressing(&self) -> &StaticAddressing {
        &self.addressing
    }

    pub async fn resolve(&self, component: &str) -> Result<Resolution, ComponentError> {
        if let Some(url) = self.cache.get(component) {
            debug!(target_component = component, %url, "resolved from cache");
            return Ok(Resolution {
                url,
                source: ResolvedFrom::Cache,
            });
        }

        let Some(ref discovery) = self.discovery else {
            return Ok(self.fallback(component, "no discovery configured"));
        };

        let Some(permit) = self.breaker.try_acquire() else {
            return Ok(self.fallback(component, "discovery circuit open"));
        };

        self.discovery_queries.fetch_add(1, Ordering::Relaxed);
        let outcome = tokio::time::timeout(self.discovery_timeout, discovery.resolve(component)).await;

        match outcome {
            Ok(Ok(response)) => {
                permit.success();
                let ttl = response.ttl().min(self.max_ttl);
                self.cache.set(component, response.url.clone(), ttl);
                debug!(target_component = component, url = %response.url, "resolved via discovery");
                Ok(Resolution {
                    url: response.url,
                    source: ResolvedFrom::Discovery,
                })
            }
            Ok(Err(DiscoveryError::NotFound(_))) => {
                permit.success();
                Err(ComponentError::ComponentNotFound(component.to_string()))
            }
            Ok(Err(DiscoveryError::Unavailable(reason))) => {
                permit.failure();
                self.discovery_failures.fetch_add(1, Ordering::Relaxed);
                Ok(self.fallback(component, &reason))
            }
            Err(_) => {
                permit.failure();
                self.discovery_failures.fetch_add(1, Ordering::Relaxed);
                let reason = format!("discovery timed out after {:?}", self.discovery_timeout);
                Ok(self.fallback(component, &reason))
            }
        }
    }

    fn fallback(&self, component: &str, reason: &str) -> Resolution {
        let url = self.addressing.url_for(component);
        self.static_fallbacks.fetch_add(1, Ordering::Relaxed);
        warn!(target_component = component, %url, %reason, "using static fallback address");
        Resolution {
            url,
            source: ResolvedFrom::StaticFallback,
        }
    }

    pub fn invalidate(&self, component: &str) -> bool {
        self.cache.invalidate(component)
    }

    pub fn clear(&self) {
        self.cache.clear();
    }

    pub fn discovery_state(&self) -> BreakerState {
        self.breaker.state()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn stats(&self) -> ResolverStats {
        let cache = self.cache.stats();
        ResolverStats {
            discovery_queries: self.discovery_queries.load(Ordering::Relaxed),
            discovery_failures: self.discovery_failures.load(Ordering::Relaxed),
            static_fallbacks: self.static_fallbacks.load(Ordering::Relaxed),
            discovery_breaker: self.breaker.state(),
            cache_hits: cache.hits,
            cache_misses: cache.misses,
            cached_urls: cache.entries,
        }
    }
}
