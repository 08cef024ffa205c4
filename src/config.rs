use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::client::{BreakerConfig, ClientConfig, RetryPolicy};
use crate::environment::{
    AddressRules, DEFAULT_CLUSTER_DOMAIN, DEFAULT_NAMESPACE, DeploymentEnvironment,
    EnvironmentSignals, NAMESPACE_VAR, OVERRIDE_VAR, detect,
};
use crate::error::ConfigError;
use crate::registry::{DEFAULT_REGISTRY_URL, HealthPolicy, SourceConfig};

pub const CONFIG_FILE: &str = "hermes.toml";

pub const CONFIG_VAR: &str = "HERMES_CONFIG";

pub const URL_VAR: &str = "HERMES_URL";

pub const HOST_VAR: &str = "HERMES_HOST";

pub const PORT_VAR: &str = "HERMES_PORT";

/// Well-known Tekton component ports, used when neither `{ID}_PORT` nor the
/// `[ports]` table names one.
pub const DEFAULT_PORTS: &[(&str, u16)] = &[
    ("engram", 8000),
    ("hermes", 8001),
    ("ergon", 8002),
    ("rhetor", 8003),
    ("terma", 8004),
    ("athena", 8005),
    ("prometheus", 8006),
    ("harmonia", 8007),
    ("telos", 8008),
    ("synthesis", 8009),
    ("tekton_core", 8010),
    ("metis", 8011),
    ("apollo", 8012),
    ("budget", 8013),
    ("sophia", 8014),
    ("noesis", 8015),
    ("numa", 8016),
    ("hephaestus", 8080),
];

pub fn well_known_port(component_id: &str) -> Option<u16> {
    let key = component_id.trim().to_ascii_lowercase().replace('-', "_");
    DEFAULT_PORTS
        .iter()
        .find(|(id, _)| *id == key)
        .map(|(_, port)| *port)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub host: String,

    pub port: u16,

    /// Seconds between expiry sweeps.
    pub sweep_interval_secs: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8001,
            sweep_interval_secs: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrySection {
    pub degraded_after_secs: u64,

    pub expire_after_secs: u64,

    /// TTL handed out with resolved URLs.
    pub url_ttl_secs: u64,
}

impl Default for RegistrySection {
    fn default() -> Self {
        Self {
            degraded_after_secs: 15,
            expire_after_secs: 30,
            url_ttl_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvironmentSection {
    /// Same values as `TEKTON_ENV`; the variable wins when both are set.
    pub mode: Option<String>,

    pub namespace: String,

    pub cluster_domain: String,
}

impl Default for EnvironmentSection {
    fn default() -> Self {
        Self {
            mode: None,
            namespace: DEFAULT_NAMESPACE.to_string(),
            cluster_domain: DEFAULT_CLUSTER_DOMAIN.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSection {
    pub registry_url: String,

    pub max_retries: u32,

    pub base_delay_ms: u64,

    pub multiplier: f64,

    pub max_delay_ms: u64,

    pub attempt_timeout_ms: u64,

    pub discovery_timeout_ms: u64,

    pub breaker_threshold: u32,

    pub breaker_cooldown_secs: u64,

    pub discovery_failure_threshold: u32,

    pub discovery_cooldown_secs: u64,

    /// Port for the static fallback when nothing else names one.
    pub default_port: u16,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            registry_url: DEFAULT_REGISTRY_URL.to_string(),
            max_retries: 3,
            base_delay_ms: 200,
            multiplier: 2.0,
            max_delay_ms: 5000,
            attempt_timeout_ms: 10_000,
            discovery_timeout_ms: 2000,
            breaker_threshold: 5,
            breaker_cooldown_secs: 30,
            discovery_failure_threshold: 3,
            discovery_cooldown_secs: 30,
            default_port: 8000,
        }
    }
}

/// Everything Hermes reads from `hermes.toml`. Every field has a default,
/// so an empty file is a valid config.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HermesConfig {
    pub server: ServerSection,

    pub registry: RegistrySection,

    pub environment: EnvironmentSection,

    pub client: ClientSection,

    /// Component id to port, overriding the built-in table.
    pub ports: BTreeMap<String, u16>,

    pub sources: Vec<SourceConfig>,
}

impl HermesConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// `HERMES_CONFIG` if set, else the nearest `hermes.toml` in the current
    /// directory or its ancestors.
    pub fn find_config_path() -> Option<PathBuf> {
        if let Some(path) = std::env::var_os(CONFIG_VAR) {
            return Some(PathBuf::from(path));
        }

        let cwd = std::env::current_dir().ok()?;
        cwd.ancestors()
            .map(|dir| dir.join(CONFIG_FILE))
            .find(|candidate| candidate.is_file())
    }

    /// Loads the explicit path, or the discovered one, or defaults. The
    /// process environment is applied on top in every case.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path.map(Path::to_path_buf).or_else(Self::find_config_path) {
            Some(path) => Self::load(&path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Overrides fields from environment variables, read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(url) = lookup(URL_VAR) {
            self.client.registry_url = url.trim_end_matches('/').to_string();
        }
        if let Some(host) = lookup(HOST_VAR) {
            self.server.host = host;
        }
        if let Some(port) = lookup(PORT_VAR) {
            match port.trim().parse() {
                Ok(port) => self.server.port = port,
                Err(_) => tracing::warn!(value = %port, "ignoring invalid {}", PORT_VAR),
            }
        }
        if let Some(mode) = lookup(OVERRIDE_VAR) {
            self.environment.mode = Some(mode);
        }
        if let Some(namespace) = lookup(NAMESPACE_VAR) {
            self.environment.namespace = namespace;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.health_policy()?;

        if self.server.sweep_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "server.sweep_interval_secs must be positive".into(),
            ));
        }
        if self.client.multiplier < 1.0 {
            return Err(ConfigError::Invalid(
                "client.multiplier must be at least 1.0".into(),
            ));
        }
        if self.client.breaker_threshold == 0 || self.client.discovery_failure_threshold == 0 {
            return Err(ConfigError::Invalid(
                "breaker thresholds must be positive".into(),
            ));
        }
        if self.client.attempt_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "client.attempt_timeout_ms must be positive".into(),
            ));
        }
        if self.environment.namespace.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "environment.namespace must not be empty".into(),
            ));
        }
        Ok(())
    }

    pub fn health_policy(&self) -> Result<HealthPolicy, ConfigError> {
        HealthPolicy::new(
            Duration::from_secs(self.registry.degraded_after_secs),
            Duration::from_secs(self.registry.expire_after_secs),
        )
        .map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.server.sweep_interval_secs)
    }

    pub fn url_ttl(&self) -> Duration {
        Duration::from_secs(self.registry.url_ttl_secs)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    pub fn environment_signals(&self) -> EnvironmentSignals {
        let signals = EnvironmentSignals::from_process();
        match self.environment.mode {
            Some(ref mode) => signals.with_override(mode.clone()),
            None => signals,
        }
    }

    pub fn detect_environment(&self) -> DeploymentEnvironment {
        detect(&self.environment_signals())
    }

    pub fn address_rules(&self, environment: DeploymentEnvironment) -> AddressRules {
        AddressRules::new(environment)
            .with_namespace(self.environment.namespace.clone())
            .with_cluster_domain(self.environment.cluster_domain.clone())
    }

    /// `[ports]` entry, then the well-known table.
    pub fn port_for(&self, component_id: &str) -> Option<u16> {
        self.ports
            .get(component_id)
            .copied()
            .or_else(|| well_known_port(component_id))
    }

    pub fn client_config(&self) -> ClientConfig {
        let client = &self.client;
        ClientConfig {
            retry: RetryPolicy {
                max_retries: client.max_retries,
                base_delay: Duration::from_millis(client.base_delay_ms),
                multiplier: client.multiplier,
                max_delay: Duration::from_millis(client.max_delay_ms),
            },
            attempt_timeout: Duration::from_millis(client.attempt_timeout_ms),
            discovery_timeout: Duration::from_millis(client.discovery_timeout_ms),
            breaker: BreakerConfig {
                failure_threshold: client.breaker_threshold,
                cooldown: Duration::from_secs(client.breaker_cooldown_secs),
            },
            discovery_breaker: BreakerConfig {
                failure_threshold: client.discovery_failure_threshold,
                cooldown: Duration::from_secs(client.discovery_cooldown_secs),
            },
            url_ttl: self.url_ttl(),
            default_port: client.default_port,
            ports: self.ports.clone(),
        }
    }
}
