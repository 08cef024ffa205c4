//! Registry Sources
//!
//! Catalog backends that answer "what components exist" independently of
//! liveness routing. A [`Catalog`] fans a query out over every configured
//! source; a source that fails is skipped with a warning.

use super::{
    ComponentRegistration, ListFilter, RegistryClient, RegistryClientConfig, RegistryStore,
    StatusFilter,
};
use crate::error::SourceError;
use async_trait::async_trait;
use futures::future::join_all;
use semver::Version;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Search hit, tagged with the source that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentSummary {
    pub id: String,

    pub name: String,

    #[serde(rename = "type", default)]
    pub component_type: String,

    #[serde(default)]
    pub version: String,

    #[serde(default)]
    pub capabilities: Vec<String>,

    pub source: String,
}

impl ComponentSummary {
    fn from_registration(registration: &ComponentRegistration, source: &str) -> Self {
        Self {
            id: registration.id.clone(),
            name: registration.name.clone(),
            component_type: registration.component_type.clone(),
            version: registration.version.clone(),
            capabilities: registration.capability_names(),
            source: source.to_string(),
        }
    }
}

#[async_trait]
pub trait RegistrySource: Send + Sync {
    fn name(&self) -> &str;

    async fn search(&self, query: &str) -> Result<Vec<ComponentSummary>, SourceError>;

    async fn get_metadata(&self, id: &str) -> Result<Option<ComponentRegistration>, SourceError>;

    /// Known versions for a component id or name, ascending. Versions that
    /// are not valid semver are skipped.
    async fn get_versions(&self, name: &str) -> Result<Vec<Version>, SourceError>;
}

fn matches_query(registration: &ComponentRegistration, query: &str) -> bool {
    let query = query.trim().to_lowercase();
    if query.is_empty() {
        return true;
    }

    registration.id.to_lowercase().contains(&query)
        || registration.name.to_lowercase().contains(&query)
        || registration.component_type.to_lowercase().contains(&query)
        || registration
            .capabilities
            .iter()
            .any(|c| c.name.to_lowercase().contains(&query))
}

fn search_in<'a>(
    registrations: impl Iterator<Item = &'a ComponentRegistration>,
    query: &str,
    source: &str,
) -> Vec<ComponentSummary> {
    registrations
        .filter(|r| matches_query(r, query))
        .map(|r| ComponentSummary::from_registration(r, source))
        .collect()
}

fn versions_in<'a>(
    registrations: impl Iterator<Item = &'a ComponentRegistration>,
    name: &str,
) -> Vec<Version> {
    let mut versions: Vec<Version> = registrations
        .filter(|r| r.id == name || r.name == name)
        .filter_map(|r| Version::parse(&r.version).ok())
        .collect();
    versions.sort();
    versions.dedup();
    versions
}

/// Components currently registered in an in-process store (expired entries
/// excluded).
pub struct LocalSource {
    store: Arc<RegistryStore>,
}

impl LocalSource {
    pub fn new(store: Arc<RegistryStore>) -> Self {
        Self { store }
    }

    fn registrations(&self) -> Vec<ComponentRegistration> {
        self.store
            .list(&ListFilter::with_status(StatusFilter::Live))
            .into_iter()
            .map(|record| record.registration)
            .collect()
    }
}

#[async_trait]
impl RegistrySource for LocalSource {
    fn name(&self) -> &str {
        "local"
    }

    async fn search(&self, query: &str) -> Result<Vec<ComponentSummary>, SourceError> {
        Ok(search_in(self.registrations().iter(), query, self.name()))
    }

    async fn get_metadata(&self, id: &str) -> Result<Option<ComponentRegistration>, SourceError> {
        Ok(self.store.get(id).map(|record| record.registration))
    }

    async fn get_versions(&self, name: &str) -> Result<Vec<Version>, SourceError> {
        Ok(versions_in(self.registrations().iter(), name))
    }
}

/// Another Hermes instance, reached over HTTP.
pub struct RemoteSource {
    label: String,

    client: RegistryClient,
}

impl RemoteSource {
    pub fn new(client: RegistryClient) -> Self {
        Self {
            label: format!("remote:{}", client.base_url()),
            client,
        }
    }

    async fn registrations(&self) -> Result<Vec<ComponentRegistration>, SourceError> {
        let records = self
            .client
            .list(&ListFilter::with_status(StatusFilter::Live))
            .await
            .map_err(|e| SourceError::Unavailable {
                source_name: self.label.clone(),
                reason: e.to_string(),
            })?;
        Ok(records.into_iter().map(|r| r.registration).collect())
    }
}

#[async_trait]
impl RegistrySource for RemoteSource {
    fn name(&self) -> &str {
        &self.label
    }

    async fn search(&self, query: &str) -> Result<Vec<ComponentSummary>, SourceError> {
        let registrations = self.registrations().await?;
        Ok(search_in(registrations.iter(), query, self.name()))
    }

    async fn get_metadata(&self, id: &str) -> Result<Option<ComponentRegistration>, SourceError> {
        let registrations = self.registrations().await?;
        Ok(registrations.into_iter().find(|r| r.id == id))
    }

    async fn get_versions(&self, name: &str) -> Result<Vec<Version>, SourceError> {
        let registrations = self.registrations().await?;
        Ok(versions_in(registrations.iter(), name))
    }
}

/// Fixed list of components from configuration.
pub struct StaticSource {
    components: Vec<ComponentRegistration>,
}

impl StaticSource {
    pub fn new(components: Vec<ComponentRegistration>) -> Self {
        Self { components }
    }
}

#[async_trait]
impl RegistrySource for StaticSource {
    fn name(&self) -> &str {
        "static"
    }

    async fn search(&self, query: &str) -> Result<Vec<ComponentSummary>, SourceError> {
        Ok(search_in(self.components.iter(), query, self.name()))
    }

    async fn get_metadata(&self, id: &str) -> Result<Option<ComponentRegistration>, SourceError> {
        Ok(self.components.iter().find(|r| r.id == id).cloned())
    }

    async fn get_versions(&self, name: &str) -> Result<Vec<Version>, SourceError> {
        Ok(versions_in(self.components.iter(), name))
    }
}

fn default_remote_timeout() -> u64 {
    5
}

/// One `[[sources]]` entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SourceConfig {
    Local,

    Remote {
        url: String,

        #[serde(default = "default_remote_timeout")]
        timeout_secs: u64,
    },

    Static {
        #[serde(default)]
        components: Vec<ComponentRegistration>,
    },
}

impl SourceConfig {
    pub fn build(
        &self,
        store: Option<&Arc<RegistryStore>>,
    ) -> Result<Box<dyn RegistrySource>, SourceError> {
        match self {
            SourceConfig::Local => {
                let store = store.ok_or_else(|| {
                    SourceError::Invalid("local source requires an in-process registry".into())
                })?;
                Ok(Box::new(LocalSource::new(Arc::clone(store))))
            }
            SourceConfig::Remote { url, timeout_secs } => {
                if url.trim().is_empty() {
                    return Err(SourceError::Invalid("remote source needs a url".into()));
                }
                let config = RegistryClientConfig::with_url(url)
                    .with_timeout(Duration::from_secs(*timeout_secs))
                    .with_retries(1);
                let client =
                    RegistryClient::new(config).map_err(|e| SourceError::Invalid(e.to_string()))?;
                Ok(Box::new(RemoteSource::new(client)))
            }
            SourceConfig::Static { components } => {
                for component in components {
                    component
                        .validate()
                        .map_err(|e| SourceError::Invalid(e.to_string()))?;
                }
                Ok(Box::new(StaticSource::new(components.clone())))
            }
        }
    }
}

#[derive(Default)]
pub struct Catalog {
    sources: Vec<Box<dyn RegistrySource>>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_configs(
        configs: &[SourceConfig],
        store: Option<&Arc<RegistryStore>>,
    ) -> Result<Self, SourceError> {
        let mut catalog = Self::new();
        for config in configs {
            catalog.sources.push(config.build(store)?);
        }
        Ok(catalog)
    }

    pub fn with_source(mut self, source: Box<dyn RegistrySource>) -> Self {
        self.sources.push(source);
        self
    }

    pub fn source_names(&self) -> Vec<String> {
        self.sources.iter().map(|s| s.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Queries every source concurrently. Results keep configuration order;
    /// when two sources know the same id the earlier one wins.
    pub async fn search(&self, query: &str) -> Vec<ComponentSummary> {
        let replies = join_all(self.sources.iter().map(|source| source.search(query))).await;

        let mut seen = HashSet::new();
        let mut results = Vec::new();

        for (source, reply) in self.sources.iter().zip(replies) {
            match reply {
                Ok(hits) => {
                    for hit in hits {
                        if seen.insert(hit.id.clone()) {
                            results.push(hit);
                        }
                    }
                }
                Err(e) => warn!(source = source.name(), error = %e, "catalog source skipped"),
            }
        }

        results
    }

    pub async fn get_metadata(&self, id: &str) -> Option<ComponentRegistration> {
        for source in &self.sources {
            match source.get_metadata(id).await {
                Ok(Some(registration)) => return Some(registration),
                Ok(None) => {}
                Err(e) => warn!(source = source.name(), error = %e, "catalog source skipped"),
            }
        }
        None
    }

    pub async fn get_versions(&self, name: &str) -> Vec<Version> {
        let mut versions = Vec::new();
        for source in &self.sources {
            match source.get_versions(name).await {
                Ok(found) => versions.extend(found),
                Err(e) => warn!(source = source.name(), error = %e, "catalog source skipped"),
            }
        }
        versions.sort();
        versions.dedup();
        versions
    }
}
