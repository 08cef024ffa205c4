//! Hermes Registry Server
//!
//! HTTP surface over a [`RegistryStore`]: registration, heartbeats,
//! discovery queries and catalog search.

use axum::{
    Json, Router,
    extract::{Path, Query, State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use hermes::config::HermesConfig;
use hermes::discovery::{DiscoveryService, ServiceDiscoveryResponse};
use hermes::environment::DeploymentEnvironment;
use hermes::error::RegistryError;
use hermes::protocol::{
    ErrorBody, HeartbeatRequest, RegisterRequest, SearchQuery, ServicesQuery, VersionsResponse,
};
use hermes::registry::{
    Catalog, ComponentRegistration, ComponentSummary, HeartbeatAck, ListFilter, RegisterAck, RegistryStats,
    RegistryStore, ServiceEndpoint, ServiceRecord, SourceConfig, StatusFilter,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<RegistryStore>,

    pub discovery: Arc<DiscoveryService>,

    pub catalog: Arc<Catalog>,
}

impl AppState {
    pub fn new(discovery: DiscoveryService, catalog: Catalog) -> Self {
        Self {
            store: Arc::clone(discovery.store()),
            discovery: Arc::new(discovery),
            catalog: Arc::new(catalog),
        }
    }

    /// Store, discovery and catalog as described by `config`. Without any
    /// `[[sources]]` the catalog searches the local store.
    pub fn from_config(config: &HermesConfig) -> anyhow::Result<Self> {
        let store = Arc::new(RegistryStore::new(config.health_policy()?));
        let environment = config.detect_environment();
        let discovery = DiscoveryService::new(Arc::clone(&store), config.address_rules(environment))
            .with_ttl(config.url_ttl());

        let sources = if config.sources.is_empty() {
            vec![SourceConfig::Local]
        } else {
            config.sources.clone()
        };
        let catalog = Catalog::from_configs(&sources, Some(&store))?;

        Ok(Self::new(discovery, catalog))
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/stats", get(get_stats))
        .route("/register", post(register))
        .route("/heartbeat", post(heartbeat))
        .route("/unregister/:id", delete(unregister))
        .route("/services", get(list_services))
        .route("/services/:name/url", get(resolve_url))
        .route("/services/:name/endpoints", get(list_endpoints))
        .route("/search", get(search))
        .route("/catalog/:name", get(catalog_metadata))
        .route("/catalog/:name/versions", get(catalog_versions))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[derive(Debug)]
pub enum ApiError {
    Registry(RegistryError),

    BadRequest(String),
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        ApiError::Registry(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::Registry(err) => {
                let status = match err {
                    RegistryError::NotFound(_) => StatusCode::NOT_FOUND,
                    RegistryError::DuplicateId { .. } => StatusCode::CONFLICT,
                    RegistryError::InvalidRegistration { .. } => StatusCode::BAD_REQUEST,
                };
                (
                    status,
                    ErrorBody {
                        error: err.kind().to_string(),
                        message: err.to_string(),
                    },
                )
            }
            ApiError::BadRequest(message) => (
                StatusCode::BAD_REQUEST,
                ErrorBody {
                    error: "bad_request".to_string(),
                    message,
                },
            ),
        };
        (status, Json(body)).into_response()
    }
}

async fn health_check() -> &'static str {
    "ok"
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsResponse {
    #[serde(flatten)]
    pub counts: RegistryStats,

    pub environment: DeploymentEnvironment,

    pub sources: Vec<String>,
}

async fn get_stats(State(state): State<AppState>) -> Json<StatsResponse> {
    Json(StatsResponse {
        counts: state.store.stats(),
        environment: state.discovery.environment(),
        sources: state.catalog.source_names(),
    })
}

async fn register(
    State(state): State<AppState>,
    payload: Result<Json<RegisterRequest>, JsonRejection>,
) -> Result<Json<RegisterAck>, ApiError> {
    let Json(request) = payload?;
    let ack = state
        .store
        .register(request.registration, request.session)?;
    Ok(Json(ack))
}

async fn heartbeat(
    State(state): State<AppState>,
    payload: Result<Json<HeartbeatRequest>, JsonRejection>,
) -> Result<Json<HeartbeatAck>, ApiError> {
    let Json(request) = payload?;
    let timestamp = request.timestamp.unwrap_or_else(|| state.store.now());
    let ack = state.store.heartbeat_with_report(
        &request.id,
        timestamp,
        &request.unhealthy_endpoints,
    )?;
    Ok(Json(ack))
}

async fn unregister(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.store.unregister(&id)?;
    Ok(Json(serde_json::json!({ "id": id, "removed": true })))
}

fn list_filter(query: ServicesQuery) -> Result<ListFilter, ApiError> {
    let status = match query.status.as_deref() {
        Some(raw) => raw.parse::<StatusFilter>().map_err(ApiError::BadRequest)?,
        None => StatusFilter::default(),
    };
    Ok(ListFilter {
        component_type: query.component_type,
        capability: query.capability,
        status,
    })
}

async fn list_services(
    State(state): State<AppState>,
    Query(query): Query<ServicesQuery>,
) -> Result<Json<Vec<ServiceRecord>>, ApiError> {
    let filter = list_filter(query)?;
    Ok(Json(state.discovery.find(&filter)))
}

async fn resolve_url(
    Path(name): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<ServiceDiscoveryResponse>, ApiError> {
    Ok(Json(state.discovery.resolve(&name)?))
}

async fn list_endpoints(
    Path(name): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<Vec<ServiceEndpoint>>, ApiError> {
    Ok(Json(state.discovery.endpoints(&name)?))
}

async fn search(
    State(state): State<AppState>,
    Query(query): Query<SearchQuery>,
) -> Json<Vec<ComponentSummary>> {
    let hits = state.catalog.search(&query.q).await;
    info!(query = %query.q, hits = hits.len(), "catalog search");
    Json(hits)
}

async fn catalog_metadata(
    Path(name): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<ComponentRegistration>, ApiError> {
    match state.catalog.get_metadata(&name).await {
        Some(registration) => Ok(Json(registration)),
        None => Err(RegistryError::NotFound(name).into()),
    }
}

async fn catalog_versions(
    Path(name): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<VersionsResponse>, ApiError> {
    let versions = state.catalog.get_versions(&name).await;
    if versions.is_empty() {
        return Err(RegistryError::NotFound(name).into());
    }
    Ok(Json(VersionsResponse::new(name, &versions)))
}
