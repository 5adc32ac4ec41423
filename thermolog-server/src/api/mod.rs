//! HTTP API endpoints
//!
//! Reads open a fresh [`Reader`] per request on a blocking thread. Writes
//! never touch the store directly: they are pushed onto the ingestion
//! queue and recorded by the consumer thread.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thermolog_core::config::Config;
use thermolog_core::ingest::{validate_readings, SampleSender, SharedToggle};
use thermolog_core::{
    DateSpan, MetricKind, RawPoint, Reader, Sample, SampleValue, SensorError, StatRow,
    StoreConfig, ThermoError, Timestamp, ViewRange,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

/// Application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: StoreConfig,
    pub queue: SampleSender,
    pub toggles: Arc<BTreeMap<String, SharedToggle>>,
}

impl AppState {
    pub fn new(
        config: Config,
        queue: SampleSender,
        toggles: BTreeMap<String, SharedToggle>,
    ) -> Self {
        Self {
            store: config.store_config(),
            config: Arc::new(config),
            queue,
            toggles: Arc::new(toggles),
        }
    }
}

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Health check
        .route("/health", get(health))

        // Dashboard data
        .route("/data/now", get(now_data))
        .route("/data/:view_range", get(view_data))
        .route("/groups", get(groups))
        .route("/span", get(span))

        // Per-sensor queries
        .route("/sensors/:id/raw", get(raw))
        .route("/sensors/:id/stats/:view_range", get(stats))

        // Writes, via the ingestion queue
        .route("/set/:sensor/:metric/:value", post(set_value))
        .route("/toggle/:id/:state", post(set_toggle))

        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ============================================================================
// Request/Response types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct RangeParams {
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub queued: usize,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct LatestValue {
    pub time: Timestamp,
    pub value: f64,
    /// Older than the configured `stale_after`
    pub stale: bool,
}

#[derive(Debug, Serialize)]
pub struct NowResponse {
    pub now: Timestamp,
    pub sensors: BTreeMap<String, BTreeMap<MetricKind, Option<LatestValue>>>,
    pub toggles: BTreeMap<String, Option<LatestValue>>,
}

/// Chart data: one label per bucket, and per element one array per
/// metric aggregate aligned with the labels
#[derive(Debug, Serialize)]
pub struct ViewResponse {
    pub view_range: ViewRange,
    pub from: Option<Timestamp>,
    pub to: Option<Timestamp>,
    pub labels: Vec<Timestamp>,
    pub data: BTreeMap<String, BTreeMap<String, Vec<Option<f64>>>>,
}

#[derive(Debug, Serialize)]
pub struct GroupResponse {
    pub id: String,
    pub name: String,
    pub sensors: Vec<String>,
    pub toggles: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, error: impl Into<String>) -> ApiError {
    (status, Json(ErrorResponse { error: error.into() }))
}

fn error_status(err: &ThermoError) -> StatusCode {
    match err {
        ThermoError::InvalidViewRange(_)
        | ThermoError::InvalidMetric(_)
        | ThermoError::InvalidTimestamp(_)
        | ThermoError::TooManyBuckets { .. } => StatusCode::BAD_REQUEST,
        ThermoError::Sensor {
            source: SensorError::OutOfRange { .. } | SensorError::Malformed(_),
            ..
        } => StatusCode::UNPROCESSABLE_ENTITY,
        ThermoError::Sensor { .. } => StatusCode::BAD_GATEWAY,
        ThermoError::QueueFull(_) | ThermoError::QueueClosed => StatusCode::SERVICE_UNAVAILABLE,
        // A busy or locked store clears up on its own
        err if err.is_storage() && err.is_retryable() => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<ThermoError> for ErrorResponse {
    fn from(err: ThermoError) -> Self {
        ErrorResponse {
            error: err.to_string(),
        }
    }
}

fn to_api_error(err: ThermoError) -> ApiError {
    let status = error_status(&err);
    if status.is_server_error() {
        warn!(error = %err, "Request failed");
    }
    (status, Json(err.into()))
}

/// Run `f` against a fresh reader on the blocking pool
async fn with_reader<T, F>(state: &AppState, f: F) -> Result<T, ApiError>
where
    F: FnOnce(&mut Reader) -> thermolog_core::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let store = state.store.clone();
    tokio::task::spawn_blocking(move || {
        let mut reader = Reader::open(&store)?;
        f(&mut reader)
    })
    .await
    .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
    .map_err(to_api_error)
}

fn latest_value(
    point: Option<RawPoint>,
    now: Timestamp,
    stale_after: Duration,
) -> Option<LatestValue> {
    let stale_after =
        ChronoDuration::from_std(stale_after).unwrap_or_else(|_| ChronoDuration::weeks(52 * 100));
    point.map(|p| LatestValue {
        time: p.time,
        value: p.value,
        stale: now - p.time > stale_after,
    })
}

/// Spread stats rows into per-metric arrays aligned with bucket labels
fn chart_series(rows: &[StatRow]) -> BTreeMap<String, Vec<Option<f64>>> {
    let mut series: BTreeMap<String, Vec<Option<f64>>> = BTreeMap::new();
    for row in rows {
        let metric = row.metric.as_str();
        series.entry(metric.to_string()).or_default().push(row.avg);
        series.entry(format!("{metric}_min")).or_default().push(row.min);
        series.entry(format!("{metric}_max")).or_default().push(row.max);
    }
    series
}

fn parse_view_range(s: &str) -> Result<ViewRange, ApiError> {
    s.parse().map_err(to_api_error)
}

// ============================================================================
// Handlers
// ============================================================================

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: thermolog_core::VERSION.to_string(),
        queued: state.queue.len(),
    })
}

async fn now_data(State(state): State<AppState>) -> Result<Json<NowResponse>, ApiError> {
    let config = Arc::clone(&state.config);
    let now = Utc::now();

    let response = with_reader(&state, move |reader| {
        let stale_after = config.stale_after;

        let mut sensors = BTreeMap::new();
        for id in config.sensors.keys() {
            let mut latest = BTreeMap::new();
            for metric in [MetricKind::Temperature, MetricKind::Humidity] {
                let point = reader.get_latest(id, metric)?;
                latest.insert(metric, latest_value(point, now, stale_after));
            }
            sensors.insert(id.clone(), latest);
        }

        let mut toggles = BTreeMap::new();
        for id in config.toggles.keys() {
            let point = reader.get_latest(id, MetricKind::Toggle)?;
            toggles.insert(id.clone(), latest_value(point, now, stale_after));
        }

        Ok(NowResponse {
            now,
            sensors,
            toggles,
        })
    })
    .await?;

    Ok(Json(response))
}

async fn view_data(
    State(state): State<AppState>,
    Path(view_range): Path<String>,
) -> Result<Json<ViewResponse>, ApiError> {
    let view = parse_view_range(&view_range)?;
    let config = Arc::clone(&state.config);
    let widths = state.store.widths;
    let now = Utc::now();

    let response = with_reader(&state, move |reader| {
        let mut response = ViewResponse {
            view_range: view,
            from: None,
            to: None,
            labels: Vec::new(),
            data: BTreeMap::new(),
        };
        let Some((from, to)) = reader.default_window(view, now)? else {
            return Ok(response);
        };

        response.from = Some(from);
        response.to = Some(to);
        response.labels = widths.enumerate(from, to, view).collect();
        for id in config.element_ids() {
            debug!(element = id, view = %view, "Getting stats");
            let rows = reader.get_stats(id, from, to, view)?;
            response.data.insert(id.to_string(), chart_series(&rows));
        }
        Ok(response)
    })
    .await?;

    Ok(Json(response))
}

async fn groups(State(state): State<AppState>) -> Json<Vec<GroupResponse>> {
    let groups = state
        .config
        .resolved_groups()
        .into_iter()
        .map(|g| GroupResponse {
            id: g.id.to_string(),
            name: g.name.to_string(),
            sensors: g.sensors.into_iter().map(String::from).collect(),
            toggles: g.toggles.into_iter().map(String::from).collect(),
        })
        .collect();
    Json(groups)
}

async fn span(State(state): State<AppState>) -> Result<Json<Option<DateSpan>>, ApiError> {
    let span = with_reader(&state, |reader| reader.date_span()).await?;
    Ok(Json(span))
}

async fn raw(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<RangeParams>,
) -> Result<Json<Vec<RawPoint>>, ApiError> {
    let to = params.to.unwrap_or_else(Utc::now);
    let from = params.from.unwrap_or(to - ChronoDuration::hours(1));

    let points = with_reader(&state, move |reader| reader.get(&id, from, to)).await?;
    Ok(Json(points))
}

async fn stats(
    State(state): State<AppState>,
    Path((id, view_range)): Path<(String, String)>,
    Query(params): Query<RangeParams>,
) -> Result<Json<Vec<StatRow>>, ApiError> {
    let view = parse_view_range(&view_range)?;
    let now = Utc::now();

    let rows = with_reader(&state, move |reader| {
        let window = match (params.from, params.to) {
            (Some(from), Some(to)) => Some((from, to)),
            (from, to) => reader
                .default_window(view, to.unwrap_or(now))?
                .map(|(default_from, default_to)| (from.unwrap_or(default_from), default_to)),
        };
        match window {
            Some((from, to)) => reader.get_stats(&id, from, to, view),
            None => Ok(Vec::new()),
        }
    })
    .await?;

    Ok(Json(rows))
}

async fn set_value(
    State(state): State<AppState>,
    Path((sensor, metric, value)): Path<(String, String, String)>,
) -> Result<StatusCode, ApiError> {
    let metric: MetricKind = metric.parse().map_err(to_api_error)?;
    let value = parse_value(metric, &value)
        .map_err(|e| to_api_error(ThermoError::sensor(sensor.as_str(), e)))?;
    validate_readings(&[(metric, value)])
        .map_err(|e| to_api_error(ThermoError::sensor(sensor.as_str(), e)))?;

    debug!(sensor = %sensor, metric = %metric, queued = state.queue.len(), "Queueing pushed value");
    state
        .queue
        .send(Sample::new(sensor, Utc::now(), metric, value))
        .map_err(to_api_error)?;

    Ok(StatusCode::ACCEPTED)
}

async fn set_toggle(
    State(state): State<AppState>,
    Path((id, requested)): Path<(String, String)>,
) -> Result<Json<bool>, ApiError> {
    let toggle = state
        .toggles
        .get(&id)
        .cloned()
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, format!("Unknown toggle: {id}")))?;
    let on = parse_bool(&requested).ok_or_else(|| {
        api_error(StatusCode::BAD_REQUEST, format!("Invalid toggle state: {requested}"))
    })?;

    // Drivers may block on hardware or network
    let switched_id = id.clone();
    let state_now = tokio::task::spawn_blocking(move || {
        let mut toggle = toggle.lock();
        toggle.set(on)?;
        toggle.get()
    })
    .await
    .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
    .map_err(|e| to_api_error(ThermoError::sensor(switched_id, e)))?;

    state
        .queue
        .send(Sample::new(id, Utc::now(), MetricKind::Toggle, state_now))
        .map_err(to_api_error)?;

    Ok(Json(state_now))
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.to_ascii_lowercase().as_str() {
        "true" | "on" | "1" => Some(true),
        "false" | "off" | "0" => Some(false),
        _ => None,
    }
}

fn parse_value(metric: MetricKind, s: &str) -> Result<SampleValue, SensorError> {
    if metric == MetricKind::Toggle {
        if let Some(on) = parse_bool(s) {
            return Ok(on.into());
        }
    }
    s.parse::<f64>()
        .map(SampleValue::from)
        .map_err(|_| SensorError::Malformed(format!("not a number: {s}")))
}
