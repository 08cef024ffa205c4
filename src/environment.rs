//! Deployment Environment Detection
//!
//! Classifies where this process runs (local machine, a container, or a
//! Kubernetes cluster) and derives the host naming rules used to build
//! component URLs.

use crate::registry::ServiceEndpoint;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use tracing::warn;

pub const OVERRIDE_VAR: &str = "TEKTON_ENV";

pub const CLUSTER_VAR: &str = "KUBERNETES_SERVICE_HOST";

pub const NAMESPACE_VAR: &str = "TEKTON_K8S_NAMESPACE";

pub const CONTAINER_MARKERS: [&str; 2] = ["/.dockerenv", "/run/.containerenv"];

pub const DEFAULT_NAMESPACE: &str = "tekton";

pub const DEFAULT_CLUSTER_DOMAIN: &str = "svc.cluster.local";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentEnvironment {
    Local,

    Docker,

    Kubernetes,
}

impl std::fmt::Display for DeploymentEnvironment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeploymentEnvironment::Local => write!(f, "local"),
            DeploymentEnvironment::Docker => write!(f, "docker"),
            DeploymentEnvironment::Kubernetes => write!(f, "kubernetes"),
        }
    }
}

impl FromStr for DeploymentEnvironment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(DeploymentEnvironment::Local),
            "docker" | "container" => Ok(DeploymentEnvironment::Docker),
            "kubernetes" | "k8s" => Ok(DeploymentEnvironment::Kubernetes),
            other => Err(format!("unknown deployment environment '{}'", other)),
        }
    }
}

/// Raw platform observations fed into [`detect`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvironmentSignals {
    pub override_value: Option<String>,

    pub cluster_signal: bool,

    pub container_marker: bool,
}

impl EnvironmentSignals {
    pub fn from_process() -> Self {
        Self {
            override_value: std::env::var(OVERRIDE_VAR)
                .ok()
                .filter(|v| !v.trim().is_empty()),
            cluster_signal: std::env::var_os(CLUSTER_VAR).is_some(),
            container_marker: CONTAINER_MARKERS.iter().any(|m| Path::new(m).exists()),
        }
    }

    pub fn with_override(mut self, value: impl Into<String>) -> Self {
        self.override_value = Some(value.into());
        self
    }

    pub fn with_cluster_signal(mut self) -> Self {
        self.cluster_signal = true;
        self
    }

    pub fn with_container_marker(mut self) -> Self {
        self.container_marker = true;
        self
    }
}

/// Priority: explicit override, then cluster signal, then container marker,
/// then local. An unparseable override is ignored.
pub fn detect(signals: &EnvironmentSignals) -> DeploymentEnvironment {
    if let Some(raw) = signals.override_value.as_deref() {
        match raw.parse() {
            Ok(env) => return env,
            Err(reason) => warn!(%reason, "ignoring {} override", OVERRIDE_VAR),
        }
    }

    if signals.cluster_signal {
        DeploymentEnvironment::Kubernetes
    } else if signals.container_marker {
        DeploymentEnvironment::Docker
    } else {
        DeploymentEnvironment::Local
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressRules {
    pub environment: DeploymentEnvironment,

    pub namespace: String,

    pub cluster_domain: String,
}

impl AddressRules {
    pub fn new(environment: DeploymentEnvironment) -> Self {
        Self {
            environment,
            namespace: DEFAULT_NAMESPACE.to_string(),
            cluster_domain: DEFAULT_CLUSTER_DOMAIN.to_string(),
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_cluster_domain(mut self, domain: impl Into<String>) -> Self {
        self.cluster_domain = domain.into();
        self
    }

    /// The host other processes use to reach `component_id` in this
    /// environment.
    pub fn host_for(&self, component_id: &str) -> String {
        match self.environment {
            DeploymentEnvironment::Local => "localhost".to_string(),
            DeploymentEnvironment::Docker => dns_label(component_id),
            DeploymentEnvironment::Kubernetes => format!(
                "{}.{}.{}",
                dns_label(component_id),
                self.namespace,
                self.cluster_domain
            ),
        }
    }

    /// Builds the URL for a registered endpoint. Wildcard binds are always
    /// rewritten; loopback hosts are kept locally but rewritten inside
    /// containers and clusters, where they would point at the caller.
    pub fn endpoint_url(&self, component_id: &str, endpoint: &ServiceEndpoint) -> String {
        let host = if is_wildcard_host(&endpoint.host)
            || (self.environment != DeploymentEnvironment::Local
                && is_loopback_host(&endpoint.host))
        {
            self.host_for(component_id)
        } else {
            bracket_ipv6(&endpoint.host)
        };

        format!(
            "{}://{}:{}{}",
            endpoint.scheme,
            host,
            endpoint.port,
            normalize_path(endpoint.path.as_deref())
        )
    }

    /// URL used when discovery cannot be reached at all.
    pub fn static_url(&self, component_id: &str, port: u16) -> String {
        format!("http://{}:{}", self.host_for(component_id), port)
    }
}

impl Default for AddressRules {
    fn default() -> Self {
        Self::new(DeploymentEnvironment::Local)
    }
}

fn dns_label(component_id: &str) -> String {
    component_id.trim().to_ascii_lowercase().replace('_', "-")
}

fn is_wildcard_host(host: &str) -> bool {
    matches!(host.trim(), "" | "0.0.0.0" | "::" | "[::]" | "*")
}

fn is_loopback_host(host: &str) -> bool {
    let host = host.trim();
    host.eq_ignore_ascii_case("localhost")
        || host == "::1"
        || host == "[::1]"
        || host.starts_with("127.")
}

fn bracket_ipv6(host: &str) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]", host)
    } else {
        host.to_string()
    }
}

fn normalize_path(path: Option<&str>) -> String {
    match path.map(|p| p.trim().trim_end_matches('/')) {
        None | Some("") => String::new(),
        Some(p) if p.starts_with('/') => p.to_string(),
        Some(p) => format!("/{}", p),
    }
}
