//! Outbound Transport
//!
//! Carries one capability call to a resolved component URL. The HTTP
//! implementation posts `{"parameters": ...}` to
//! `{base_url}/capabilities/{capability}` and maps the response onto the
//! component error taxonomy.

use crate::error::{ComponentError, Unavailable};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

pub const ROLES_HEADER: &str = "X-Tekton-Roles";

pub const CALLER_HEADER: &str = "X-Tekton-Caller";

/// Caller identity forwarded on every call. Never interpreted here.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityContext {
    #[serde(default)]
    pub token: Option<String>,

    #[serde(default)]
    pub roles: Vec<String>,

    #[serde(default)]
    pub caller: Option<String>,
}

impl SecurityContext {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: &str) -> Self {
        self.token = Some(token.to_string());
        self
    }

    pub fn with_role(mut self, role: &str) -> Self {
        self.roles.push(role.to_string());
        self
    }

    pub fn with_caller(mut self, caller: &str) -> Self {
        self.caller = Some(caller.to_string());
        self
    }

    fn apply(&self, mut request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if let Some(ref token) = self.token {
            request = request.bearer_auth(token);
        }
        if !self.roles.is_empty() {
            request = request.header(ROLES_HEADER, self.roles.join(","));
        }
        if let Some(ref caller) = self.caller {
            request = request.header(CALLER_HEADER, caller);
        }
        request
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutboundCall {
    pub component: String,

    pub base_url: String,

    pub capability: String,

    pub parameters: Value,

    pub security: SecurityContext,
}

impl OutboundCall {
    pub fn url(&self) -> String {
        format!(
            "{}/capabilities/{}",
            self.base_url.trim_end_matches('/'),
            urlencoding::encode(&self.capability)
        )
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn call(&self, call: &OutboundCall) -> Result<Value, ComponentError>;
}

pub struct HttpTransport {
    http: reqwest::Client,
}

impl HttpTransport {
    pub fn new(user_agent: &str, connect_timeout: Duration) -> reqwest::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(user_agent)
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self { http })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn call(&self, call: &OutboundCall) -> Result<Value, ComponentError> {
        let request = self
            .http
            .post(call.url())
            .json(&serde_json::json!({ "parameters": call.parameters }));

        let response = call
            .security
            .apply(request)
            .send()
            .await
            .map_err(|e| network_error(&call.component, e))?;

        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|e| network_error(&call.component, e))?;

        classify_response(call, status, &body)
    }
}

fn network_error(component: &str, err: reqwest::Error) -> ComponentError {
    let reason = if err.is_timeout() {
        Unavailable::Timeout { after_ms: 0 }
    } else {
        Unavailable::Network(err.to_string())
    };
    ComponentError::unavailable(component, reason)
}

pub(crate) fn classify_response(
    call: &OutboundCall,
    status: u16,
    body: &[u8],
) -> Result<Value, ComponentError> {
    match status {
        200..=299 => {
            if body.is_empty() {
                return Ok(Value::Null);
            }
            let value: Value =
                serde_json::from_slice(body).map_err(|e| ComponentError::InvalidResponse {
                    component: call.component.clone(),
                    reason: e.to_string(),
                })?;
            Ok(match value {
                Value::Object(mut map) if map.contains_key("result") => {
                    map.remove("result").unwrap_or(Value::Null)
                }
                other => other,
            })
        }
        404 => Err(ComponentError::CapabilityNotFound {
            component: call.component.clone(),
            capability: call.capability.clone(),
        }),
        502..=504 => Err(ComponentError::unavailable(
            &call.component,
            Unavailable::Status(status),
        )),
        _ => Err(ComponentError::CapabilityInvocation {
            component: call.component.clone(),
            capability: call.capability.clone(),
            status: Some(status),
            message: error_message(body),
        }),
    }
}

fn error_message(body: &[u8]) -> String {
    if let Ok(Value::Object(map)) = serde_json::from_slice::<Value>(body) {
        for key in ["message", "error", "detail"] {
            if let Some(Value::String(msg)) = map.get(key) {
                return msg.clone();
            }
        }
    }
    String::from_utf8_lossy(body).trim().to_string()
}
