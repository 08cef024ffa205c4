//! Registry
//!
//! Component registrations, their derived health, and the stores, monitors
//! and clients that operate on them.

mod agent;
mod client;
mod monitor;
mod sources;
mod store;

pub use agent::{AgentHandle, DEFAULT_HEARTBEAT_INTERVAL, RegistrationAgent};
pub use client::{DEFAULT_REGISTRY_URL, RegistryClient, RegistryClientConfig};
pub use monitor::{HeartbeatMonitor, MonitorHandle, SweepReport};
pub use sources::{
    Catalog, ComponentSummary, LocalSource, RegistrySource, RemoteSource, SourceConfig,
    StaticSource,
};
pub use store::{RegistryStats, RegistryStore};

use crate::error::{RegistryError, RegistryResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capability {
    pub name: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub parameter_schema: serde_json::Value,
}

impl Capability {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            description: String::new(),
            parameter_schema: serde_json::Value::Null,
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn with_schema(mut self, schema: serde_json::Value) -> Self {
        self.parameter_schema = schema;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEndpoint {
    #[serde(default = "default_endpoint_name")]
    pub name: String,

    #[serde(default = "default_scheme")]
    pub scheme: String,

    pub host: String,

    pub port: u16,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    #[serde(default = "default_true")]
    pub healthy: bool,
}

fn default_endpoint_name() -> String {
    "default".to_string()
}

fn default_scheme() -> String {
    "http".to_string()
}

fn default_true() -> bool {
    true
}

impl ServiceEndpoint {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            name: default_endpoint_name(),
            scheme: default_scheme(),
            host: host.to_string(),
            port,
            path: None,
            healthy: true,
        }
    }

    pub fn named(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn with_scheme(mut self, scheme: &str) -> Self {
        self.scheme = scheme.to_string();
        self
    }

    pub fn with_path(mut self, path: &str) -> Self {
        self.path = Some(path.to_string());
        self
    }
}

/// What a component announces about itself when it registers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentRegistration {
    pub id: String,

    #[serde(default)]
    pub name: String,

    #[serde(rename = "type", default)]
    pub component_type: String,

    #[serde(default)]
    pub version: String,

    #[serde(default)]
    pub capabilities: Vec<Capability>,

    #[serde(default)]
    pub dependencies: Vec<String>,

    #[serde(default)]
    pub endpoints: Vec<ServiceEndpoint>,

    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl ComponentRegistration {
    pub fn new(id: &str, name: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            component_type: String::new(),
            version: String::new(),
            capabilities: vec![],
            dependencies: vec![],
            endpoints: vec![],
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_type(mut self, component_type: &str) -> Self {
        self.component_type = component_type.to_string();
        self
    }

    pub fn with_version(mut self, version: &str) -> Self {
        self.version = version.to_string();
        self
    }

    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.capabilities.push(capability);
        self
    }

    pub fn with_dependency(mut self, id: &str) -> Self {
        if !self.dependencies.iter().any(|d| d == id) {
            self.dependencies.push(id.to_string());
        }
        self
    }

    pub fn with_endpoint(mut self, endpoint: ServiceEndpoint) -> Self {
        self.endpoints.push(endpoint);
        self
    }

    pub fn with_metadata(mut self, key: &str, value: serde_json::Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }

    pub fn has_capability(&self, name: &str) -> bool {
        self.capabilities.iter().any(|c| c.name == name)
    }

    pub fn capability_names(&self) -> Vec<String> {
        self.capabilities.iter().map(|c| c.name.clone()).collect()
    }

    pub fn validate(&self) -> RegistryResult<()> {
        if self.id.trim().is_empty() {
            return Err(RegistryError::invalid("id must not be empty"));
        }

        let mut seen = HashSet::new();
        for capability in &self.capabilities {
            if capability.name.trim().is_empty() {
                return Err(RegistryError::invalid(format!(
                    "{}: capability names must not be empty",
                    self.id
                )));
            }
            if !seen.insert(capability.name.as_str()) {
                return Err(RegistryError::invalid(format!(
                    "{}: duplicate capability '{}'",
                    self.id, capability.name
                )));
            }
        }

        let mut endpoint_names = HashSet::new();
        for endpoint in &self.endpoints {
            if !endpoint_names.insert(endpoint.name.as_str()) {
                return Err(RegistryError::invalid(format!(
                    "{}: duplicate endpoint '{}'",
                    self.id, endpoint.name
                )));
            }
        }

        Ok(())
    }

    /// Drops repeated dependency ids while keeping first-seen order.
    pub(crate) fn normalized(mut self) -> Self {
        let mut seen = HashSet::new();
        self.dependencies.retain(|d| seen.insert(d.clone()));
        if self.name.is_empty() {
            self.name = self.id.clone();
        }
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,

    Degraded,

    Expired,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Expired => write!(f, "expired"),
        }
    }
}

/// Which derived statuses a query should include.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusFilter {
    #[default]
    Healthy,

    /// Healthy or degraded.
    Live,

    Degraded,

    Expired,

    Any,
}

impl StatusFilter {
    pub fn matches(&self, status: HealthStatus) -> bool {
        match self {
            StatusFilter::Healthy => status == HealthStatus::Healthy,
            StatusFilter::Live => status != HealthStatus::Expired,
            StatusFilter::Degraded => status == HealthStatus::Degraded,
            StatusFilter::Expired => status == HealthStatus::Expired,
            StatusFilter::Any => true,
        }
    }
}

impl FromStr for StatusFilter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "healthy" => Ok(StatusFilter::Healthy),
            "live" => Ok(StatusFilter::Live),
            "degraded" => Ok(StatusFilter::Degraded),
            "expired" => Ok(StatusFilter::Expired),
            "any" | "all" => Ok(StatusFilter::Any),
            other => Err(format!("unknown status filter '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListFilter {
    #[serde(rename = "type", default)]
    pub component_type: Option<String>,

    #[serde(default)]
    pub capability: Option<String>,

    #[serde(default)]
    pub status: StatusFilter,
}

impl ListFilter {
    pub fn healthy() -> Self {
        Self::default()
    }

    pub fn with_status(status: StatusFilter) -> Self {
        Self {
            status,
            ..Default::default()
        }
    }

    pub fn of_type(mut self, component_type: &str) -> Self {
        self.component_type = Some(component_type.to_string());
        self
    }

    pub fn with_capability(mut self, capability: &str) -> Self {
        self.capability = Some(capability.to_string());
        self
    }

    pub fn matches(&self, record: &ServiceRecord) -> bool {
        if !self.status.matches(record.status) {
            return false;
        }
        if let Some(ref component_type) = self.component_type {
            if &record.registration.component_type != component_type {
                return false;
            }
        }
        if let Some(ref capability) = self.capability {
            if !record.registration.has_capability(capability) {
                return false;
            }
        }
        true
    }
}

/// Heartbeat age thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthPolicy {
    pub degraded_after: Duration,

    pub expire_after: Duration,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            degraded_after: Duration::from_secs(15),
            expire_after: Duration::from_secs(30),
        }
    }
}

impl HealthPolicy {
    pub fn new(degraded_after: Duration, expire_after: Duration) -> RegistryResult<Self> {
        if degraded_after >= expire_after {
            return Err(RegistryError::invalid(format!(
                "degraded threshold ({:?}) must be below expiry threshold ({:?})",
                degraded_after, expire_after
            )));
        }
        Ok(Self {
            degraded_after,
            expire_after,
        })
    }

    /// Heartbeats stamped in the future count as fresh.
    pub fn status_at(&self, last_heartbeat: DateTime<Utc>, now: DateTime<Utc>) -> HealthStatus {
        let age = (now - last_heartbeat).to_std().unwrap_or(Duration::ZERO);
        if age <= self.degraded_after {
            HealthStatus::Healthy
        } else if age <= self.expire_after {
            HealthStatus::Degraded
        } else {
            HealthStatus::Expired
        }
    }
}

/// Read-only view of a registration together with its derived status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRecord {
    #[serde(flatten)]
    pub registration: ComponentRegistration,

    pub status: HealthStatus,

    pub last_heartbeat: DateTime<Utc>,

    pub registered_at: DateTime<Utc>,

    #[serde(default)]
    pub sequence: u64,
}

impl ServiceRecord {
    pub fn id(&self) -> &str {
        &self.registration.id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterAck {
    pub id: String,

    pub session: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatAck {
    pub id: String,

    /// False when the heartbeat was older than the stored one and dropped.
    pub applied: bool,
}
