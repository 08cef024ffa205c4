//! Hermes
//!
//! Service registry, heartbeat tracking, capability discovery and resilient
//! invocation for Tekton components.

pub mod app;
pub mod cli;
pub mod client;
pub mod clock;
pub mod config;
pub mod discovery;
pub mod environment;
pub mod error;
pub mod logging;
pub mod protocol;
pub mod registry;

pub use client::{InvocationClient, SecurityContext};
pub use config::HermesConfig;
pub use discovery::{DiscoveryCache, DiscoveryService, ServiceDiscoveryResponse};
pub use environment::{AddressRules, DeploymentEnvironment, EnvironmentSignals, detect};
pub use error::{ComponentError, RegistryError};
pub use registry::{
    Capability, ComponentRegistration, HealthPolicy, HealthStatus, HeartbeatMonitor,
    RegistrationAgent, RegistryClient, RegistryStore, ServiceEndpoint, ServiceRecord,
};
