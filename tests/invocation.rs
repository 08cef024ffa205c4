use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use hermes::client::{
    BreakerConfig, BreakerState, ClientConfig, Discovery, InvocationClient, OutboundCall, RetryPolicy,
    SecurityContext, StaticAddressing, Transport,
};
use hermes::discovery::DiscoveryService;
use hermes::environment::AddressRules;
use hermes::error::{ComponentError, Unavailable};
use hermes::registry::{
    Capability, ComponentRegistration, HealthPolicy, RegistryClient, RegistryClientConfig,
    RegistryStore, ServiceEndpoint,
};
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

/// Registry stand-in whose URL lookups always answer 503.
async fn failing_registry(hits: Arc<AtomicUsize>) -> String {
    let app = Router::new()
        .route(
            "/services/:name/url",
            get(|State(hits): State<Arc<AtomicUsize>>| async move {
                hits.fetch_add(1, Ordering::SeqCst);
                StatusCode::SERVICE_UNAVAILABLE
            }),
        )
        .with_state(hits);
    serve(app).await
}

/// Registry stand-in that resolves every component to `target` with a short TTL.
async fn fixed_registry(hits: Arc<AtomicUsize>, target: &'static str) -> String {
    let app = Router::new()
        .route(
            "/services/:name/url",
            get(move |State(hits): State<Arc<AtomicUsize>>| async move {
                hits.fetch_add(1, Ordering::SeqCst);
                Json(json!({"url": target, "ttl_seconds": 1}))
            }),
        )
        .with_state(hits);
    serve(app).await
}

#[derive(Default)]
struct RecordingTransport {
    calls: Mutex<Vec<OutboundCall>>,
}

#[async_trait::async_trait]
impl Transport for RecordingTransport {
    async fn call(&self, call: &OutboundCall) -> Result<Value, ComponentError> {
        self.calls.lock().push(call.clone());
        Ok(json!({"granted": true}))
    }
}

fn no_env(_: &str) -> Option<String> {
    None
}

/// Collects formatted log output for the current thread's subscriber.
#[derive(Clone, Default)]
struct LogCapture(Arc<Mutex<Vec<u8>>>);

impl LogCapture {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

impl std::io::Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for LogCapture {
    type Writer = LogCapture;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

fn remote_discovery(base: &str) -> Arc<dyn Discovery> {
    Arc::new(
        RegistryClient::new(
            RegistryClientConfig::with_url(base)
                .with_timeout(Duration::from_secs(2))
                .with_retries(1),
        )
        .unwrap(),
    )
}

fn client_with_transport(
    discovery: Arc<dyn Discovery>,
    transport: Arc<RecordingTransport>,
) -> InvocationClient {
    let addressing = StaticAddressing::new(AddressRules::default(), BTreeMap::new(), 8000)
        .with_env_lookup(no_env);
    InvocationClient::with_parts(
        ClientConfig::default(),
        Some(discovery),
        addressing,
        transport,
    )
}

#[tokio::test]
async fn discovery_outage_falls_back_to_static_address() {
    let logs = LogCapture::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(logs.clone())
        .with_ansi(false)
        .with_max_level(tracing::Level::WARN)
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let hits = Arc::new(AtomicUsize::new(0));
    let base = failing_registry(Arc::clone(&hits)).await;
    let transport = Arc::new(RecordingTransport::default());
    let client = client_with_transport(remote_discovery(&base), Arc::clone(&transport));
    let security = SecurityContext::anonymous().with_caller("ergon");

    for call in 1..=4 {
        let value = client
            .invoke("budget", "allocate", json!({"tokens": 10}), &security)
            .await
            .unwrap();
        assert_eq!(value["granted"], true);
        assert_eq!(hits.load(Ordering::SeqCst), call.min(3));
    }

    let calls = transport.calls.lock();
    assert_eq!(calls.len(), 4);
    assert!(calls.iter().all(|c| c.base_url == "http://localhost:8013"));

    let stats = client.stats();
    assert_eq!(stats.resolver.static_fallbacks, 4);
    assert_eq!(stats.resolver.discovery_queries, 3);
    assert_eq!(stats.resolver.discovery_breaker, BreakerState::Open);

    let output = logs.contents();
    assert_eq!(output.matches("using static fallback address").count(), 4);
    assert!(output.contains("budget"));
    assert!(output.contains("http://localhost:8013"));
}

#[tokio::test]
async fn resolved_url_is_reused_until_ttl_expires() {
    let hits = Arc::new(AtomicUsize::new(0));
    let base = fixed_registry(Arc::clone(&hits), "http://budget.internal:8013").await;
    let transport = Arc::new(RecordingTransport::default());
    let client = client_with_transport(remote_discovery(&base), Arc::clone(&transport));
    let security = SecurityContext::anonymous();

    client.invoke("budget", "allocate", Value::Null, &security).await.unwrap();
    client.invoke("budget", "allocate", Value::Null, &security).await.unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    tokio::time::sleep(Duration::from_millis(1100)).await;
    client.invoke("budget", "allocate", Value::Null, &security).await.unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 2);

    assert!(transport
        .calls
        .lock()
        .iter()
        .all(|c| c.base_url == "http://budget.internal:8013"));
}

#[derive(Clone, Default)]
struct TargetState {
    hits: Arc<AtomicUsize>,
    failing: Arc<AtomicBool>,
    headers: Arc<Mutex<Vec<HeaderMap>>>,
}

async fn capability(
    Path(capability): Path<String>,
    State(state): State<TargetState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    state.hits.fetch_add(1, Ordering::SeqCst);
    state.headers.lock().push(headers);

    if state.failing.load(Ordering::SeqCst) {
        return (StatusCode::SERVICE_UNAVAILABLE, Json(json!({"error": "warming up"})));
    }
    match capability.as_str() {
        "echo" => (StatusCode::OK, Json(json!({"result": body["parameters"]}))),
        "explode" => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"message": "ledger locked"})),
        ),
        _ => (StatusCode::NOT_FOUND, Json(json!({"error": "unknown capability"}))),
    }
}

async fn spawn_target(state: TargetState) -> u16 {
    let app = Router::new()
        .route("/capabilities/:capability", post(capability))
        .with_state(state);
    let base = serve(app).await;
    base.rsplit(':').next().unwrap().parse().unwrap()
}

fn in_process_client(port: u16, config: ClientConfig) -> InvocationClient {
    let store = Arc::new(RegistryStore::new(HealthPolicy::default()));
    store
        .register(
            ComponentRegistration::new("prometheus", "Prometheus")
                .with_capability(Capability::new("echo"))
                .with_endpoint(ServiceEndpoint::new("127.0.0.1", port)),
            None,
        )
        .unwrap();
    let discovery: Arc<dyn Discovery> =
        Arc::new(DiscoveryService::new(store, AddressRules::default()));
    InvocationClient::new(config, Some(discovery), AddressRules::default()).unwrap()
}

#[tokio::test]
async fn invokes_http_target_with_security_headers() {
    let state = TargetState::default();
    let port = spawn_target(state.clone()).await;
    let client = in_process_client(port, ClientConfig::default());
    let security = SecurityContext::anonymous()
        .with_token("secret")
        .with_role("planner")
        .with_role("admin")
        .with_caller("telos");

    let value = client
        .invoke("prometheus", "echo", json!({"goal": "ship"}), &security)
        .await
        .unwrap();
    assert_eq!(value, json!({"goal": "ship"}));

    let headers = state.headers.lock();
    assert_eq!(headers[0]["authorization"], "Bearer secret");
    assert_eq!(headers[0]["x-tekton-roles"], "planner,admin");
    assert_eq!(headers[0]["x-tekton-caller"], "telos");
}

#[tokio::test]
async fn logical_failures_are_not_retried() {
    let state = TargetState::default();
    let port = spawn_target(state.clone()).await;
    let client = in_process_client(port, ClientConfig::default());
    let security = SecurityContext::anonymous();

    let err = client
        .invoke("prometheus", "missing", Value::Null, &security)
        .await
        .unwrap_err();
    assert!(matches!(err, ComponentError::CapabilityNotFound { .. }));

    let err = client
        .invoke("prometheus", "explode", Value::Null, &security)
        .await
        .unwrap_err();
    match err {
        ComponentError::CapabilityInvocation {
            status, message, ..
        } => {
            assert_eq!(status, Some(500));
            assert_eq!(message, "ledger locked");
        }
        other => panic!("unexpected error: {other:?}"),
    }

    assert_eq!(state.hits.load(Ordering::SeqCst), 2);
    assert_eq!(client.breaker_state("prometheus"), Some(BreakerState::Closed));

    let err = client
        .invoke("nobody", "echo", Value::Null, &security)
        .await
        .unwrap_err();
    assert_eq!(err, ComponentError::ComponentNotFound("nobody".into()));
}

#[tokio::test]
async fn breaker_stops_calls_to_failing_target_until_cooldown() {
    let state = TargetState::default();
    state.failing.store(true, Ordering::SeqCst);
    let port = spawn_target(state.clone()).await;
    let config = ClientConfig {
        retry: RetryPolicy::none(),
        breaker: BreakerConfig {
            failure_threshold: 3,
            cooldown: Duration::from_millis(300),
        },
        ..Default::default()
    };
    let client = in_process_client(port, config);
    let security = SecurityContext::anonymous();

    for _ in 0..3 {
        let err = client
            .invoke("prometheus", "echo", Value::Null, &security)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }
    assert_eq!(client.breaker_state("prometheus"), Some(BreakerState::Open));

    let err = client
        .invoke("prometheus", "echo", Value::Null, &security)
        .await
        .unwrap_err();
    assert_eq!(
        err,
        ComponentError::unavailable("prometheus", Unavailable::CircuitOpen)
    );
    assert_eq!(state.hits.load(Ordering::SeqCst), 3);

    tokio::time::sleep(Duration::from_millis(350)).await;
    state.failing.store(false, Ordering::SeqCst);

    let value = client
        .invoke("prometheus", "echo", json!({"n": 1}), &security)
        .await
        .unwrap();
    assert_eq!(value["n"], 1);
    assert_eq!(state.hits.load(Ordering::SeqCst), 4);
    assert_eq!(client.breaker_state("prometheus"), Some(BreakerState::Closed));
}

#[tokio::test]
async fn retries_recover_from_brief_outage() {
    let state = TargetState::default();
    state.failing.store(true, Ordering::SeqCst);
    let port = spawn_target(state.clone()).await;
    let config = ClientConfig {
        retry: RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(50),
            multiplier: 2.0,
            max_delay: Duration::from_millis(200),
        },
        ..Default::default()
    };
    let client = Arc::new(in_process_client(port, config));

    let flip = {
        let state = state.clone();
        tokio::spawn(async move {
            while state.hits.load(Ordering::SeqCst) < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            state.failing.store(false, Ordering::SeqCst);
        })
    };

    let value = client
        .invoke("prometheus", "echo", json!({"ok": 1}), &SecurityContext::anonymous())
        .await
        .unwrap();
    flip.await.unwrap();

    assert_eq!(value["ok"], 1);
    assert!(client.stats().retries >= 2);
}
