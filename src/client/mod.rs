//! Invocation Client
//!
//! Calls a capability on another component by id. Resolution goes through
//! the [`Resolver`]; each call runs under the target's circuit breaker, a
//! per-attempt timeout and the retry policy.

mod breaker;
mod resolver;
mod retry;
mod transport;

pub use breaker::{BreakerConfig, BreakerPermit, BreakerSnapshot, BreakerState, CircuitBreaker};
pub use resolver::{
    Discovery, Resolution, ResolvedFrom, Resolver, ResolverStats, StaticAddressing, port_var,
};
pub use retry::RetryPolicy;
pub use transport::{
    CALLER_HEADER, HttpTransport, OutboundCall, ROLES_HEADER, SecurityContext, Transport,
};

use crate::config::HermesConfig;
use crate::discovery::DEFAULT_URL_TTL;
use crate::environment::AddressRules;
use crate::error::{ComponentError, RegistryClientError, Unavailable};
use crate::registry::{RegistryClient, RegistryClientConfig};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    pub retry: RetryPolicy,

    pub attempt_timeout: Duration,

    pub discovery_timeout: Duration,

    /// Per-target breaker.
    pub breaker: BreakerConfig,

    pub discovery_breaker: BreakerConfig,

    /// Upper bound on how long a resolved URL stays cached.
    pub url_ttl: Duration,

    pub default_port: u16,

    pub ports: BTreeMap<String, u16>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            attempt_timeout: Duration::from_secs(10),
            discovery_timeout: Duration::from_secs(2),
            breaker: BreakerConfig::default(),
            discovery_breaker: BreakerConfig {
                failure_threshold: 3,
                cooldown: Duration::from_secs(30),
            },
            url_ttl: DEFAULT_URL_TTL,
            default_port: 8000,
            ports: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TargetStats {
    pub component: String,

    pub state: BreakerState,

    pub consecutive_failures: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClientStats {
    pub invocations: u64,

    pub retries: u64,

    pub failures: u64,

    pub resolver: ResolverStats,

    pub targets: Vec<TargetStats>,
}

pub struct InvocationClient {
    config: ClientConfig,

    resolver: Resolver,

    transport: Arc<dyn Transport>,

    breakers: DashMap<String, Arc<CircuitBreaker>>,

    invocations: AtomicU64,

    retries: AtomicU64,

    failures: AtomicU64,
}

impl InvocationClient {
    /// Client with an HTTP transport.
    pub fn new(
        config: ClientConfig,
        discovery: Option<Arc<dyn Discovery>>,
        rules: AddressRules,
    ) -> Result<Self, ComponentError> {
        let transport = HttpTransport::new(
            &format!("hermes/{}", env!("CARGO_PKG_VERSION")),
            config.attempt_timeout,
        )
        .map_err(|e| ComponentError::unavailable("transport", Unavailable::Network(e.to_string())))?;

        Ok(Self::with_transport(
            config,
            discovery,
            rules,
            Arc::new(transport),
        ))
    }

    pub fn with_transport(
        config: ClientConfig,
        discovery: Option<Arc<dyn Discovery>>,
        rules: AddressRules,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let addressing = StaticAddressing::new(rules, config.ports.clone(), config.default_port);
        Self::with_parts(config, discovery, addressing, transport)
    }

    /// Full control over static addressing, mostly for tests that must not
    /// read the process environment.
    pub fn with_parts(
        config: ClientConfig,
        discovery: Option<Arc<dyn Discovery>>,
        addressing: StaticAddressing,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let resolver = Resolver::new(
            discovery,
            addressing,
            config.discovery_breaker,
            config.discovery_timeout,
            config.url_ttl,
        );

        Self {
            config,
            resolver,
            transport,
            breakers: DashMap::new(),
            invocations: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    /// Client that discovers through the registry at `client.registry_url`,
    /// with address rules for the detected environment.
    pub fn from_config(config: &HermesConfig) -> Result<Self, RegistryClientError> {
        let client_config = config.client_config();
        let registry = RegistryClient::new(
            RegistryClientConfig::with_url(&config.client.registry_url)
                .with_timeout(client_config.discovery_timeout)
                .with_retries(1),
        )?;
        let rules = config.address_rules(config.detect_environment());
        let discovery: Arc<dyn Discovery> = Arc::new(registry);

        Self::new(client_config, Some(discovery), rules)
            .map_err(|e| RegistryClientError::Setup(e.to_string()))
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    pub async fn resolve(&self, component: &str) -> Result<Resolution, ComponentError> {
        self.resolver.resolve(component).await
    }

    pub async fn invoke(
        &self,
        component: &str,
        capability: &str,
        parameters: Value,
        security: &SecurityContext,
    ) -> Result<Value, ComponentError> {
        self.invocations.fetch_add(1, Ordering::Relaxed);
        let breaker = self.breaker_for(component);
        let policy = &self.config.retry;
        let mut retry = 0;

        loop {
            let result = self
                .attempt(&breaker, component, capability, &parameters, security)
                .await;

            match result {
                Err(err) if err.is_retryable() && retry < policy.max_retries => {
                    let delay = policy.delay_for(retry);
                    warn!(
                        target_component = component,
                        capability,
                        attempt = retry + 1,
                        ?delay,
                        error = %err,
                        "retrying invocation"
                    );
                    self.retries.fetch_add(1, Ordering::Relaxed);
                    tokio::time::sleep(delay).await;
                    retry += 1;
                }
                Err(err) => {
                    self.failures.fetch_add(1, Ordering::Relaxed);
                    return Err(err);
                }
                ok => return ok,
            }
        }
    }

    /// Like [`invoke`](Self::invoke), bounded by a caller deadline covering
    /// resolution, every attempt and every backoff. Hitting the deadline
    /// leaves breaker counters untouched.
    pub async fn invoke_with_deadline(
        &self,
        component: &str,
        capability: &str,
        parameters: Value,
        security: &SecurityContext,
        deadline: Duration,
    ) -> Result<Value, ComponentError> {
        match tokio::time::timeout(
            deadline,
            self.invoke(component, capability, parameters, security),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                Err(ComponentError::DeadlineExceeded {
                    component: component.to_string(),
                    deadline_ms: deadline.as_millis() as u64,
                })
            }
        }
    }

    async fn attempt(
        &self,
        breaker: &Arc<CircuitBreaker>,
        component: &str,
        capability: &str,
        parameters: &Value,
        security: &SecurityContext,
    ) -> Result<Value, ComponentError> {
        let Some(permit) = breaker.try_acquire() else {
            debug!(target_component = component, "circuit open, failing fast");
            return Err(ComponentError::unavailable(component, Unavailable::CircuitOpen));
        };

        // A failed resolution drops the permit unreported.
        let resolution = self.resolver.resolve(component).await?;

        let call = OutboundCall {
            component: component.to_string(),
            base_url: resolution.url,
            capability: capability.to_string(),
            parameters: parameters.clone(),
            security: security.clone(),
        };

        let timeout = self.config.attempt_timeout;
        match tokio::time::timeout(timeout, self.transport.call(&call)).await {
            Ok(Ok(value)) => {
                permit.success();
                Ok(value)
            }
            Ok(Err(err)) if err.is_transport_failure() => {
                permit.failure();
                self.resolver.invalidate(component);
                Err(err)
            }
            Ok(Err(err)) => {
                permit.success();
                Err(err)
            }
            Err(_) => {
                permit.failure();
                self.resolver.invalidate(component);
                Err(ComponentError::unavailable(
                    component,
                    Unavailable::Timeout {
                        after_ms: timeout.as_millis() as u64,
                    },
                ))
            }
        }
    }

    fn breaker_for(&self, component: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.get(component) {
            return Arc::clone(breaker.value());
        }
        let breaker = self
            .breakers
            .entry(component.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(component, self.config.breaker)));
        Arc::clone(breaker.value())
    }

    /// `None` until the first call to `component`.
    pub fn breaker_state(&self, component: &str) -> Option<BreakerState> {
        self.breakers.get(component).map(|b| b.state())
    }

    pub fn stats(&self) -> ClientStats {
        let mut targets: Vec<TargetStats> = self
            .breakers
            .iter()
            .map(|entry| {
                let snapshot = entry.value().snapshot();
                TargetStats {
                    component: entry.key().clone(),
                    state: snapshot.state,
                    consecutive_failures: snapshot.consecutive_failures,
                }
            })
            .collect();
        targets.sort_by(|a, b| a.component.cmp(&b.component));

        ClientStats {
            invocations: self.invocations.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            resolver: self.resolver.stats(),
            targets,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::ServiceDiscoveryResponse;
    use crate::environment::DeploymentEnvironment;
    use crate::error::DiscoveryError;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    struct FixedDiscovery;

    #[async_trait]
    impl Discovery for FixedDiscovery {
        async fn resolve(
            &self,
            component: &str,
        ) -> Result<ServiceDiscoveryResponse, DiscoveryError> {
            if component == "ghost" {
                return Err(DiscoveryError::NotFound(component.to_string()));
            }
            Ok(ServiceDiscoveryResponse {
                url: format!("http://{}.test:80", component),
                ttl_seconds: 30,
            })
        }
    }

    /// Replays scripted outcomes, then succeeds; records every call.
    #[derive(Default)]
    struct ScriptedTransport {
        replies: Mutex<VecDeque<Result<Value, ComponentError>>>,
        calls: Mutex<Vec<OutboundCall>>,
        hang: bool,
    }

    impl ScriptedTransport {
        fn replying(replies: Vec<Result<Value, ComponentError>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                ..Default::default()
            })
        }

        fn hanging() -> Arc<Self> {
            Arc::new(Self {
                hang: true,
                ..Default::default()
            })
        }

        fn call_count(&self) -> usize {
            self.calls.lock().len()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn call(&self, call: &OutboundCall) -> Result<Value, ComponentError> {
            self.calls.lock().push(call.clone());
            if self.hang {
                std::future::pending::<()>().await;
            }
            let reply = self.replies.lock().pop_front();
            reply.unwrap_or_else(|| Ok(serde_json::json!({"ok": true})))
        }
    }

    fn unavailable(component: &str) -> Result<Value, ComponentError> {
        Err(ComponentError::unavailable(component, Unavailable::Status(503)))
    }

    fn no_env(_: &str) -> Option<String> {
        None
    }

    fn client(transport: Arc<ScriptedTransport>, config: ClientConfig) -> InvocationClient {
        let discovery: Arc<dyn Discovery> = Arc::new(FixedDiscovery);
        let addressing = StaticAddressing::new(
            AddressRules::new(DeploymentEnvironment::Local),
            BTreeMap::new(),
            8000,
        )
        .with_env_lookup(no_env);
        InvocationClient::with_parts(config, Some(discovery), addressing, transport)
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_forwards_security_context() {
        let transport = ScriptedTransport::replying(vec![]);
        let client = client(Arc::clone(&transport), ClientConfig::default());
        let security = SecurityContext::anonymous()
            .with_token("t0k")
            .with_role("planner");

        let value = client
            .invoke("prometheus", "plan", serde_json::json!({"goal": "x"}), &security)
            .await
            .unwrap();
        assert_eq!(value["ok"], true);

        let calls = transport.calls.lock();
        assert_eq!(calls[0].base_url, "http://prometheus.test:80");
        assert_eq!(calls[0].security, security);
        assert_eq!(calls[0].parameters["goal"], "x");
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried() {
        let transport = ScriptedTransport::replying(vec![unavailable("budget"), unavailable("budget")]);
        let client = client(Arc::clone(&transport), ClientConfig::default());

        let value = client
            .invoke("budget", "allocate", Value::Null, &SecurityContext::anonymous())
            .await
            .unwrap();
        assert_eq!(value["ok"], true);
        assert_eq!(transport.call_count(), 3);

        let stats = client.stats();
        assert_eq!(stats.retries, 2);
        assert_eq!(stats.targets[0].consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_are_bounded() {
        let transport = ScriptedTransport::replying((0..10).map(|_| unavailable("budget")).collect());
        let client = client(Arc::clone(&transport), ClientConfig::default());

        let err = client
            .invoke("budget", "allocate", Value::Null, &SecurityContext::anonymous())
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(transport.call_count(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_logical_failures_not_retried() {
        let transport = ScriptedTransport::replying(vec![Err(ComponentError::CapabilityInvocation {
            component: "ergon".into(),
            capability: "run".into(),
            status: Some(500),
            message: "boom".into(),
        })]);
        let client = client(Arc::clone(&transport), ClientConfig::default());

        let err = client
            .invoke("ergon", "run", Value::Null, &SecurityContext::anonymous())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "capability_invocation");
        assert_eq!(transport.call_count(), 1);
        assert_eq!(client.breaker_state("ergon"), Some(BreakerState::Closed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_component_not_retried() {
        let transport = ScriptedTransport::replying(vec![]);
        let client = client(Arc::clone(&transport), ClientConfig::default());

        let err = client
            .invoke("ghost", "haunt", Value::Null, &SecurityContext::anonymous())
            .await
            .unwrap_err();
        assert_eq!(err, ComponentError::ComponentNotFound("ghost".into()));
        assert_eq!(transport.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_opens_and_fails_fast() {
        let transport = ScriptedTransport::replying((0..5).map(|_| unavailable("apollo")).collect());
        let config = ClientConfig {
            retry: RetryPolicy::none(),
            ..Default::default()
        };
        let client = client(Arc::clone(&transport), config);
        let security = SecurityContext::anonymous();

        for _ in 0..5 {
            let _ = client.invoke("apollo", "predict", Value::Null, &security).await;
        }
        assert_eq!(client.breaker_state("apollo"), Some(BreakerState::Open));
        assert_eq!(transport.call_count(), 5);

        let err = client
            .invoke("apollo", "predict", Value::Null, &security)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ComponentError::unavailable("apollo", Unavailable::CircuitOpen)
        );
        assert!(!err.is_retryable());
        assert_eq!(transport.call_count(), 5);

        tokio::time::advance(Duration::from_secs(30)).await;
        client
            .invoke("apollo", "predict", Value::Null, &security)
            .await
            .unwrap();
        assert_eq!(transport.call_count(), 6);
        assert_eq!(client.breaker_state("apollo"), Some(BreakerState::Closed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout_is_transient() {
        let transport = ScriptedTransport::hanging();
        let config = ClientConfig {
            retry: RetryPolicy::none(),
            attempt_timeout: Duration::from_millis(500),
            ..Default::default()
        };
        let client = client(Arc::clone(&transport), config);

        let err = client
            .invoke("synthesis", "run", Value::Null, &SecurityContext::anonymous())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ComponentError::unavailable("synthesis", Unavailable::Timeout { after_ms: 500 })
        );
        let stats = client.stats();
        assert_eq!(stats.targets[0].consecutive_failures, 1);
        assert_eq!(stats.resolver.cached_urls, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_leaves_breaker_untouched() {
        let transport = ScriptedTransport::hanging();
        let client = client(Arc::clone(&transport), ClientConfig::default());

        let err = client
            .invoke_with_deadline(
                "metis",
                "analyze",
                Value::Null,
                &SecurityContext::anonymous(),
                Duration::from_millis(100),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "deadline_exceeded");
        assert_eq!(client.stats().targets[0].consecutive_failures, 0);
        assert_eq!(client.breaker_state("metis"), Some(BreakerState::Closed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_invalidates_cached_url() {
        let transport = ScriptedTransport::replying(vec![unavailable("noesis")]);
        let config = ClientConfig {
            retry: RetryPolicy::none(),
            ..Default::default()
        };
        let client = client(Arc::clone(&transport), config);
        let security = SecurityContext::anonymous();

        client.resolve("noesis").await.unwrap();
        assert_eq!(client.stats().resolver.cached_urls, 1);

        let _ = client.invoke("noesis", "think", Value::Null, &security).await;
        assert_eq!(client.stats().resolver.cached_urls, 0);
    }
}
