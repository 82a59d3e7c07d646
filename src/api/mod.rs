//! HTTP API for producers and dashboards.
//!
//! Endpoints:
//! - `POST /v1/observations`: store one observation
//! - `POST /v1/observations/batch`: store many, itemized results
//! - `GET /v1/observations`: bucketed aggregates
//! - `GET /v1/observations/:id`: point lookup
//! - `GET /health`, `GET /v1/status`

use crate::core::config::ServerConfig;
use crate::core::{
    MetricId, Observation, ObservationId, OrganizationId, Result, StoreError,
};
use crate::query::{BucketAggregate, Completion, PlanKind, QueryRequest, QueryResult};
use crate::registry::{display_name, KpiRegistry};
use crate::rollup::Granularity;
use crate::storage::ObservationStore;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// API server configuration.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Address to bind
    pub bind_address: IpAddr,
    /// Port to listen on (default: 8086)
    pub port: u16,
    /// Enable CORS headers
    pub enable_cors: bool,
    /// Largest accepted batch
    pub max_batch_size: usize,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self::from(&ServerConfig::default())
    }
}

impl From<&ServerConfig> for ApiConfig {
    fn from(server: &ServerConfig) -> Self {
        Self {
            bind_address: server.bind_address,
            port: server.http_port,
            enable_cors: server.enable_cors,
            max_batch_size: server.max_batch_size,
        }
    }
}

/// API server state.
#[derive(Clone)]
struct ApiState {
    store: Arc<ObservationStore>,
    registry: Arc<dyn KpiRegistry>,
    config: ApiConfig,
    started: Instant,
}

/// Error response.
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    code: u16,
    category: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    field: Option<&'static str>,
}

impl ErrorResponse {
    fn from_error(error: &StoreError) -> Self {
        let field = match error {
            StoreError::Validation { field, .. } => Some(*field),
            _ => None,
        };
        Self {
            error: error.to_string(),
            code: status_for(error).as_u16(),
            category: error.category(),
            field,
        }
    }
}

fn status_for(error: &StoreError) -> StatusCode {
    match error {
        StoreError::Validation { .. } => StatusCode::BAD_REQUEST,
        StoreError::ExpiredWindow { .. } => StatusCode::CONFLICT,
        StoreError::NotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Store errors rendered as JSON with a mapped status code
struct ApiError(StoreError);

impl From<StoreError> for ApiError {
    fn from(error: StoreError) -> Self {
        Self(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self.0);
        }
        (status, Json(ErrorResponse::from_error(&self.0))).into_response()
    }
}

/// Build the router; exposed for in-process testing.
pub fn router(
    store: Arc<ObservationStore>,
    registry: Arc<dyn KpiRegistry>,
    config: ApiConfig,
) -> Router {
    let enable_cors = config.enable_cors;
    let state = ApiState {
        store,
        registry,
        config,
        started: Instant::now(),
    };

    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/v1/status", get(status_handler))
        .route(
            "/v1/observations",
            post(append_handler).get(query_handler),
        )
        .route("/v1/observations/batch", post(batch_handler))
        .route("/v1/observations/:id", get(get_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    if enable_cors {
        app.layer(ServiceBuilder::new().layer(CorsLayer::permissive()))
    } else {
        app
    }
}

/// Serve the API until `shutdown` fires.
pub async fn start_server(
    store: Arc<ObservationStore>,
    registry: Arc<dyn KpiRegistry>,
    config: ApiConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    let addr = SocketAddr::new(config.bind_address, config.port);
    let app = router(store, registry, config);

    tracing::info!("Starting API server on http://{}", addr);
    let listener = TcpListener::bind(addr).await.map_err(|e| {
        StoreError::Io(std::io::Error::new(
            std::io::ErrorKind::AddrInUse,
            format!("Failed to bind to {}: {}", addr, e),
        ))
    })?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .map_err(|e| {
            StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("API server error: {}", e),
            ))
        })?;

    tracing::info!("API server stopped");
    Ok(())
}

/// Health check response.
#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    uptime_seconds: u64,
    partitions: usize,
}

/// GET /health
async fn health_handler(State(state): State<ApiState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: state.started.elapsed().as_secs(),
        partitions: state.store.partitions().len(),
    })
}

/// GET /v1/status - partitions per tier, aggregator health, counters
async fn status_handler(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.store.status())
}

#[derive(Debug, Serialize)]
struct AppendResponse {
    id: ObservationId,
}

/// POST /v1/observations
async fn append_handler(
    State(state): State<ApiState>,
    Json(observation): Json<Observation>,
) -> std::result::Result<impl IntoResponse, ApiError> {
    let id = state.store.append(observation)?;
    Ok((StatusCode::CREATED, Json(AppendResponse { id })))
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum BatchItem {
    Accepted { ok: bool, id: ObservationId },
    Rejected { ok: bool, error: ErrorResponse },
}

#[derive(Debug, Serialize)]
struct BatchResponse {
    total: usize,
    failed: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    summary: Option<String>,
    results: Vec<BatchItem>,
}

/// POST /v1/observations/batch
///
/// Records are decoded one by one so a malformed entry is reported at its
/// own index instead of failing the request.
async fn batch_handler(
    State(state): State<ApiState>,
    Json(records): Json<Vec<serde_json::Value>>,
) -> std::result::Result<impl IntoResponse, ApiError> {
    let total = records.len();
    if total > state.config.max_batch_size {
        return Err(StoreError::validation(
            "batch",
            format!(
                "batch of {} exceeds the limit of {}",
                total, state.config.max_batch_size
            ),
        )
        .into());
    }

    let mut outcomes: Vec<Option<Result<ObservationId>>> = Vec::with_capacity(total);
    let mut positions = Vec::with_capacity(total);
    let mut observations = Vec::with_capacity(total);
    for (index, record) in records.into_iter().enumerate() {
        match decode_record(record) {
            Ok(observation) => {
                positions.push(index);
                observations.push(observation);
                outcomes.push(None);
            },
            Err(e) => outcomes.push(Some(Err(e))),
        }
    }

    let store = Arc::clone(&state.store);
    let appended = tokio::task::spawn_blocking(move || store.append_batch(observations))
        .await
        .map_err(|e| StoreError::storage(format!("batch worker failed: {}", e)))?;
    for (index, result) in positions.into_iter().zip(appended) {
        outcomes[index] = Some(result);
    }

    let results: Vec<BatchItem> = outcomes
        .into_iter()
        .map(|outcome| {
            outcome.unwrap_or_else(|| Err(StoreError::storage("record was not processed")))
        })
        .map(|result| match result {
            Ok(id) => BatchItem::Accepted { ok: true, id },
            Err(e) => BatchItem::Rejected {
                ok: false,
                error: ErrorResponse::from_error(&e),
            },
        })
        .collect();
    let failed = results
        .iter()
        .filter(|r| matches!(r, BatchItem::Rejected { .. }))
        .count();
    let summary =
        (failed > 0).then(|| StoreError::PartialBatchFailure { failed, total }.to_string());

    Ok(Json(BatchResponse {
        total,
        failed,
        summary,
        results,
    }))
}

/// One batch entry as an observation, or a validation error naming the problem
fn decode_record(record: serde_json::Value) -> Result<Observation> {
    serde_json::from_value(record)
        .map_err(|e| StoreError::validation("observation", format!("malformed record: {}", e)))
}

/// Parsed `GET /v1/observations` parameters
fn parse_query(params: BTreeMap<String, String>) -> Result<QueryRequest> {
    let required = |name: &'static str| {
        params
            .get(name)
            .ok_or_else(|| StoreError::validation(name, "query parameter is required"))
    };
    let parse_time = |name: &'static str| -> Result<DateTime<Utc>> {
        let raw = required(name)?;
        DateTime::parse_from_rfc3339(raw)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| StoreError::validation(name, format!("invalid RFC 3339 timestamp: {}", e)))
    };

    let metric_id = MetricId::new(required("metric_id")?.as_str())?;
    let from = parse_time("from")?;
    let to = parse_time("to")?;
    let granularity = match params.get("granularity") {
        Some(g) => g.parse::<Granularity>()?,
        None => Granularity::Hour,
    };
    let cross_tenant = params.get("cross_tenant").map_or(false, |v| v == "true");

    let mut request = match params.get("organization_id") {
        Some(org) => QueryRequest::new(metric_id, OrganizationId::new(org.as_str())?, from, to, granularity),
        None if cross_tenant => QueryRequest::cross_tenant(metric_id, from, to, granularity),
        None => {
            return Err(StoreError::validation(
                "organization_id",
                "query parameter is required unless cross_tenant=true",
            ))
        },
    };

    if let Some(process_id) = params.get("process_id") {
        request = request.process_id(process_id.as_str());
    }
    if let Some(kpi_code) = params.get("kpi_code") {
        request = request.kpi_code(kpi_code.as_str());
    }
    if let Some(max_rows) = params.get("max_rows") {
        let rows = max_rows
            .parse::<usize>()
            .map_err(|e| StoreError::validation("max_rows", e.to_string()))?;
        request = request.max_scanned_rows(rows);
    }
    for (key, value) in &params {
        if let Some(context_key) = key.strip_prefix("context.") {
            request = request.context(context_key, value.as_str());
        }
    }
    Ok(request)
}

#[derive(Debug, Serialize)]
struct QueryResponse {
    metric_id: MetricId,
    organization_id: Option<OrganizationId>,
    granularity: Granularity,
    plan: PlanKind,
    complete: bool,
    completion: Completion,
    rows_scanned: usize,
    buckets: Vec<BucketAggregate>,
}

/// GET /v1/observations
async fn query_handler(
    State(state): State<ApiState>,
    Query(params): Query<BTreeMap<String, String>>,
) -> std::result::Result<impl IntoResponse, ApiError> {
    let request = parse_query(params)?;
    let metric_id = request.metric_id.clone();
    let organization_id = request.organization_id.clone();
    let granularity = request.granularity;

    let store = Arc::clone(&state.store);
    let result: QueryResult = tokio::task::spawn_blocking(move || {
        store.query(request).map(|stream| stream.into_result())
    })
    .await
    .map_err(|e| StoreError::storage(format!("query worker failed: {}", e)))??;

    Ok(Json(QueryResponse {
        metric_id,
        organization_id,
        granularity,
        plan: result.plan,
        complete: !result.completion.is_truncated(),
        completion: result.completion,
        rows_scanned: result.rows_scanned,
        buckets: result.buckets,
    }))
}

#[derive(Debug, Serialize)]
struct ObservationResponse {
    id: ObservationId,
    #[serde(skip_serializing_if = "Option::is_none")]
    kpi_name: Option<String>,
    #[serde(flatten)]
    observation: Observation,
}

/// GET /v1/observations/:id
async fn get_handler(
    State(state): State<ApiState>,
    Path(id): Path<u64>,
) -> std::result::Result<impl IntoResponse, ApiError> {
    let id = ObservationId(id);
    let observation = state
        .store
        .get(id)?
        .ok_or_else(|| StoreError::NotFound(format!("observation {}", id)))?;

    let kpi_name = match &observation.kpi_code {
        Some(code) => Some(display_name(state.registry.as_ref(), code).await),
        None => None,
    };

    Ok(Json(ObservationResponse {
        id,
        kpi_name,
        observation,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_default_config() {
        let config = ApiConfig::default();
        assert_eq!(config.port, 8086);
        assert!(config.enable_cors);
        assert_eq!(config.max_batch_size, 10_000);
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for(&StoreError::validation("value", "x")), StatusCode::BAD_REQUEST);
        assert_eq!(
            status_for(&StoreError::ExpiredWindow {
                timestamp: Utc::now(),
                retained_from: Utc::now(),
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(status_for(&StoreError::NotFound("x".into())), StatusCode::NOT_FOUND);
        assert_eq!(status_for(&StoreError::storage("x")), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_parse_query_with_context_filters() {
        let request = parse_query(params(&[
            ("metric_id", "RL.1.1"),
            ("organization_id", "42"),
            ("from", "2024-03-15T00:00:00Z"),
            ("to", "2024-03-16T00:00:00Z"),
            ("granularity", "day"),
            ("context.region", "emea"),
            ("max_rows", "500"),
        ]))
        .unwrap();

        assert_eq!(request.granularity, Granularity::Day);
        assert_eq!(request.filters.context.get("region").map(String::as_str), Some("emea"));
        assert_eq!(request.options.max_scanned_rows, Some(500));
    }

    #[test]
    fn test_parse_query_requires_tenant() {
        let base = [
            ("metric_id", "RL.1.1"),
            ("from", "2024-03-15T00:00:00Z"),
            ("to", "2024-03-16T00:00:00Z"),
        ];
        let err = parse_query(params(&base)).unwrap_err();
        assert!(matches!(err, StoreError::Validation { field: "organization_id", .. }));

        let mut cross = base.to_vec();
        cross.push(("cross_tenant", "true"));
        assert!(parse_query(params(&cross)).unwrap().organization_id.is_none());
    }
}
