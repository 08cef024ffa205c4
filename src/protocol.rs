//! Wire Types
//!
//! Request and response bodies shared by the registry server and its
//! HTTP clients.

use crate::registry::ComponentRegistration;
use chrono::{DateTime, Utc};
use semver::Version;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterRequest {
    #[serde(flatten)]
    pub registration: ComponentRegistration,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub id: String,

    /// Server time is used when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unhealthy_endpoints: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServicesQuery {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub component_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchQuery {
    #[serde(default)]
    pub q: String,
}

/// Known versions of a component across the catalog, oldest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionsResponse {
    pub name: String,

    pub versions: Vec<String>,

    pub latest: Option<String>,
}

impl VersionsResponse {
    pub fn new(name: impl Into<String>, versions: &[Version]) -> Self {
        Self {
            name: name.into(),
            versions: versions.iter().map(Version::to_string).collect(),
            latest: versions.last().map(Version::to_string),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,

    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_request_is_flat() {
        let json = serde_json::json!({
            "id": "budget",
            "name": "Budget",
            "session": "abc"
        });
        let request: RegisterRequest = serde_json::from_value(json).unwrap();
        assert_eq!(request.registration.id, "budget");
        assert_eq!(request.session.as_deref(), Some("abc"));
    }

    #[test]
    fn test_heartbeat_timestamp_optional() {
        let request: HeartbeatRequest =
            serde_json::from_value(serde_json::json!({"id": "budget"})).unwrap();
        assert!(request.timestamp.is_none());
        assert!(request.unhealthy_endpoints.is_empty());

        let request: HeartbeatRequest = serde_json::from_value(serde_json::json!({
            "id": "budget",
            "timestamp": "2026-01-02T03:04:05Z"
        }))
        .unwrap();
        assert_eq!(request.timestamp.unwrap().timestamp(), 1767323045);
    }

    #[test]
    fn test_heartbeat_without_timestamp_leaves_stamping_to_registry() {
        let request = HeartbeatRequest {
            id: "budget".into(),
            timestamp: None,
            unhealthy_endpoints: vec![],
        };
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            serde_json::json!({"id": "budget"})
        );
    }

    #[test]
    fn test_versions_response_latest() {
        let versions = [Version::new(0, 9, 0), Version::new(1, 2, 0)];
        let response = VersionsResponse::new("rhetor", &versions);
        assert_eq!(response.versions, vec!["0.9.0", "1.2.0"]);
        assert_eq!(response.latest.as_deref(), Some("1.2.0"));
    }
}
