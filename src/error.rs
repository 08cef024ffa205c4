//! Error Types

use std::fmt;
use thiserror::Error;

pub type RegistryResult<T> = std::result::Result<T, RegistryError>;

/// Failures of the registry store and the discovery queries over it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Component not found: {0}")]
    NotFound(String),

    #[error("Duplicate component id: {id} is held by another session")]
    DuplicateId { id: String },

    #[error("Invalid registration: {reason}")]
    InvalidRegistration { reason: String },
}

impl RegistryError {
    pub fn invalid(reason: impl Into<String>) -> Self {
        RegistryError::InvalidRegistration {
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RegistryError::NotFound(_) => "not_found",
            RegistryError::DuplicateId { .. } => "duplicate_id",
            RegistryError::InvalidRegistration { .. } => "invalid_registration",
        }
    }
}

/// Why a target component could not be reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Unavailable {
    Network(String),

    Timeout { after_ms: u64 },

    Status(u16),

    CircuitOpen,
}

impl fmt::Display for Unavailable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Unavailable::Network(reason) => write!(f, "network error: {}", reason),
            Unavailable::Timeout { after_ms } => write!(f, "timed out after {}ms", after_ms),
            Unavailable::Status(code) => write!(f, "service returned {}", code),
            Unavailable::CircuitOpen => write!(f, "circuit open"),
        }
    }
}

/// Errors surfaced to callers of the invocation client.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ComponentError {
    #[error("Component not found: {0}")]
    ComponentNotFound(String),

    #[error("Capability not found: {component}::{capability}")]
    CapabilityNotFound {
        component: String,
        capability: String,
    },

    #[error("Capability invocation failed: {component}::{capability} - {message}")]
    CapabilityInvocation {
        component: String,
        capability: String,
        status: Option<u16>,
        message: String,
    },

    #[error("Component unavailable: {component} ({reason})")]
    ComponentUnavailable {
        component: String,
        reason: Unavailable,
    },

    #[error("Deadline exceeded: {component} did not answer within {deadline_ms}ms")]
    DeadlineExceeded { component: String, deadline_ms: u64 },

    #[error("Invalid response from {component}: {reason}")]
    InvalidResponse { component: String, reason: String },
}

impl ComponentError {
    pub fn unavailable(component: &str, reason: Unavailable) -> Self {
        ComponentError::ComponentUnavailable {
            component: component.to_string(),
            reason,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ComponentError::ComponentNotFound(_) => "component_not_found",
            ComponentError::CapabilityNotFound { .. } => "capability_not_found",
            ComponentError::CapabilityInvocation { .. } => "capability_invocation",
            ComponentError::ComponentUnavailable { .. } => "component_unavailable",
            ComponentError::DeadlineExceeded { .. } => "deadline_exceeded",
            ComponentError::InvalidResponse { .. } => "invalid_response",
        }
    }

    /// Transient failures worth another attempt. An open circuit is not one
    /// of them: retrying would only fail fast again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ComponentError::ComponentUnavailable { reason, .. } if *reason != Unavailable::CircuitOpen
        )
    }

    /// Failures that prove the target was unreachable, as opposed to a
    /// reachable target rejecting the call.
    pub fn is_transport_failure(&self) -> bool {
        matches!(self, ComponentError::ComponentUnavailable { .. })
    }

    pub fn component_name(&self) -> &str {
        match self {
            ComponentError::ComponentNotFound(component)
            | ComponentError::CapabilityNotFound { component, .. }
            | ComponentError::CapabilityInvocation { component, .. }
            | ComponentError::ComponentUnavailable { component, .. }
            | ComponentError::DeadlineExceeded { component, .. }
            | ComponentError::InvalidResponse { component, .. } => component,
        }
    }
}

/// Outcome of a failed discovery query, as seen by the invocation client.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryError {
    #[error("No healthy instance of {0}")]
    NotFound(String),

    #[error("Discovery unavailable: {0}")]
    Unavailable(String),
}

/// Errors from talking to a registry server over HTTP.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryClientError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Duplicate component id: {0}")]
    DuplicateId(String),

    #[error("Registry rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Registry unavailable: {url} - {reason}")]
    Unavailable { url: String, reason: String },

    #[error("Invalid registry response: {0}")]
    InvalidResponse(String),

    #[error("HTTP client setup failed: {0}")]
    Setup(String),
}

impl RegistryClientError {
    pub fn is_recoverable(&self) -> bool {
        matches!(self, RegistryClientError::Unavailable { .. })
    }
}

/// Errors raised by catalog sources.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    #[error("Source {source_name} unavailable: {reason}")]
    Unavailable { source_name: String, reason: String },

    #[error("Invalid source definition: {0}")]
    Invalid(String),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}
