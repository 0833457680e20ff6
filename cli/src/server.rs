use anyhow::Result;
use axum::{
    extract::{Path, Query, State},
    http::{HeaderValue, Method, StatusCode},
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;
use veritrace_core::color::{ColorMap, StateItem, STATE_TABLE_SIZE};
use veritrace_core::config::LoggingConfig;
use veritrace_core::query::{
    bucket_width, clamp_window, context_id_of, describe_variable, series_all_fields, variable_quark,
};
use veritrace_core::{
    get_values_range, series, state_index, BuildState, Bucket, Config, FilterInterval, RawEvent,
    Timestamp, TraceSession, VeritraceEngine, VisualTree, PROVIDER_VERSION,
};

#[derive(Clone)]
struct AppState {
    engine: Arc<VeritraceEngine>,
    started_at: Instant,
    started_wall: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct EventBatch {
    events: Vec<RawEvent>,
}

#[derive(Debug, Deserialize)]
struct OpenTraceRequest {
    name: String,
    #[serde(default)]
    start_time: Timestamp,
}

#[derive(Debug, Default, Deserialize)]
struct CloseTraceRequest {
    end_time: Option<Timestamp>,
}

#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    success: bool,
    data: Option<T>,
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}

impl ApiResponse<String> {
    fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
        }
    }
}

type ApiError = (StatusCode, Json<ApiResponse<String>>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(ApiResponse::error(message.into())))
}

#[derive(Debug, Serialize)]
struct ServerStatus {
    version: String,
    provider_version: u32,
    started_at: String,
    uptime_seconds: u64,
    traces_active: usize,
    traces_building: usize,
}

/// Install the global `tracing` subscriber from the logging section.
pub fn init_tracing(logging: &LoggingConfig) -> Result<()> {
    let log_level = match logging.level.to_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "info" => tracing::Level::INFO,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_target(logging.include_modules)
        .with_max_level(log_level)
        .compact()
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialise logging: {}", e))
}

pub async fn start_server(config: Config) -> Result<()> {
    init_tracing(&config.logging)?;

    let engine = init_engine(&config)?;
    let app = build_router(&config, Arc::clone(&engine));

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    println!(
        "\n🏁 Veritrace Server Started!\n━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━\n   🌐 Server:        http://{}\n   📊 Status:        http://{}/status\n   📥 Open trace:    POST http://{}/api/traces\n   🔍 List traces:   http://{}/api/traces\n   🌳 Visual tree:   http://{}/api/traces/:id/tree\n━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━\n",
        addr, addr, addr, addr, addr
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!(traces = engine.trace_count(), "server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Failed to listen for shutdown signal: {}", e);
    }
}

pub fn init_engine(config: &Config) -> Result<Arc<VeritraceEngine>> {
    config.validate()?;
    Ok(Arc::new(VeritraceEngine::new(config.clone())))
}

pub fn build_router(config: &Config, engine: Arc<VeritraceEngine>) -> Router {
    let state = AppState {
        engine,
        started_at: Instant::now(),
        started_wall: Utc::now(),
    };

    let router = Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route(
            "/api/traces",
            get(list_traces_handler).post(open_trace_handler),
        )
        .route(
            "/api/traces/:trace_id",
            get(get_trace_handler).delete(delete_trace_handler),
        )
        .route("/api/traces/:trace_id/events", post(ingest_events_handler))
        .route("/api/traces/:trace_id/close", post(close_trace_handler))
        .route("/api/traces/:trace_id/tree", get(get_tree_handler))
        .route("/api/traces/:trace_id/values", get(get_values_handler))
        .route(
            "/api/traces/:trace_id/variables/:context_id",
            get(get_variable_handler),
        )
        .route(
            "/api/traces/:trace_id/variables/:context_id/series",
            get(get_series_handler),
        )
        .route(
            "/api/traces/:trace_id/problematic",
            get(get_problematic_handler),
        )
        .layer(build_cors(config))
        .with_state(state);

    if config.server.verbose {
        router.layer(TraceLayer::new_for_http())
    } else {
        router
    }
}

fn build_cors(config: &Config) -> CorsLayer {
    if !config.server.cors_enabled {
        return CorsLayer::new();
    }

    let methods = [Method::GET, Method::POST, Method::DELETE, Method::OPTIONS];
    if config.server.cors_origins.iter().any(|o| o == "*") {
        return CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(methods)
            .allow_headers(Any);
    }

    let origins: Vec<HeaderValue> = config
        .server
        .cors_origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!("Ignoring invalid CORS origin: {}", origin);
                None
            }
        })
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(methods)
        .allow_headers(Any)
}

fn lookup_session(state: &AppState, trace_id: &str) -> Result<Arc<TraceSession>, ApiError> {
    let id = Uuid::parse_str(trace_id)
        .map_err(|_| api_error(StatusCode::BAD_REQUEST, "Invalid trace ID format"))?;
    state
        .engine
        .session(&id)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, format!("Trace not found: {}", id)))
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    #[derive(Serialize)]
    struct Health {
        status: &'static str,
        traces: usize,
    }

    Json(ApiResponse::success(Health {
        status: "healthy",
        traces: state.engine.trace_count(),
    }))
}

async fn status_handler(State(state): State<AppState>) -> impl IntoResponse {
    let summaries = state.engine.sessions().await;
    let building = summaries
        .iter()
        .filter(|s| !s.build_state.is_terminal())
        .count();

    Json(ApiResponse::success(ServerStatus {
        version: env!("CARGO_PKG_VERSION").to_string(),
        provider_version: PROVIDER_VERSION,
        started_at: state.started_wall.to_rfc3339(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        traces_active: summaries.len(),
        traces_building: building,
    }))
}

async fn open_trace_handler(
    State(state): State<AppState>,
    Json(request): Json<OpenTraceRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let session = state
        .engine
        .open_trace(request.name, request.start_time)
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::success(session.summary().await)),
    ))
}

async fn list_traces_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(ApiResponse::success(state.engine.sessions().await))
}

async fn get_trace_handler(
    State(state): State<AppState>,
    Path(trace_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let session = lookup_session(&state, &trace_id)?;
    Ok(Json(ApiResponse::success(session.summary().await)))
}

async fn delete_trace_handler(
    State(state): State<AppState>,
    Path(trace_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let session = lookup_session(&state, &trace_id)?;
    state.engine.remove_trace(&session.id());
    Ok(Json(ApiResponse::success(format!(
        "Removed trace {}",
        session.id()
    ))))
}

async fn ingest_events_handler(
    State(state): State<AppState>,
    Path(trace_id): Path<String>,
    Json(batch): Json<EventBatch>,
) -> Result<impl IntoResponse, ApiError> {
    let session = lookup_session(&state, &trace_id)?;
    if session.is_closed() {
        return Err(api_error(
            StatusCode::CONFLICT,
            format!("Trace {} is closed", session.id()),
        ));
    }

    let count = state
        .engine
        .submit(&session.id(), batch.events)
        .map_err(|e| api_error(StatusCode::SERVICE_UNAVAILABLE, e.to_string()))?;
    Ok((
        StatusCode::ACCEPTED,
        Json(ApiResponse::success(format!("Queued {} events", count))),
    ))
}

async fn close_trace_handler(
    State(state): State<AppState>,
    Path(trace_id): Path<String>,
    Json(request): Json<CloseTraceRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let session = lookup_session(&state, &trace_id)?;
    state
        .engine
        .close_trace(&session.id(), request.end_time)
        .map_err(|e| api_error(StatusCode::NOT_FOUND, e.to_string()))?;
    Ok(Json(ApiResponse::success(session.summary().await)))
}

#[derive(Debug, Deserialize)]
struct TreeQuery {
    down: Option<f64>,
    up: Option<f64>,
}

#[derive(Debug, Serialize)]
struct TreeResponse {
    build_state: BuildState,
    rendered: String,
    tree: VisualTree,
}

async fn get_tree_handler(
    State(state): State<AppState>,
    Path(trace_id): Path<String>,
    Query(query): Query<TreeQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let session = lookup_session(&state, &trace_id)?;
    let mut tree = (*session.tree().await).clone();

    if query.down.is_some() || query.up.is_some() {
        let filter = FilterInterval::new(
            query.down.unwrap_or(f64::NEG_INFINITY),
            query.up.unwrap_or(f64::INFINITY),
        );
        tree.retain_samples(&filter);
    }

    Ok(Json(ApiResponse::success(TreeResponse {
        build_state: session.build_state().await,
        rendered: tree.render(),
        tree,
    })))
}

#[derive(Debug, Deserialize)]
struct ValuesQuery {
    start: Option<Timestamp>,
    end: Option<Timestamp>,
    field: Option<String>,
}

#[derive(Debug, Serialize)]
struct VariableValue {
    context_id: Option<u64>,
    quark: u32,
    value: f64,
}

async fn get_values_handler(
    State(state): State<AppState>,
    Path(trace_id): Path<String>,
    Query(query): Query<ValuesQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let session = lookup_session(&state, &trace_id)?;
    let store = session.store();
    let start = query.start.unwrap_or_else(|| store.start_time());
    let end = query.end.unwrap_or_else(|| store.current_end_time());
    let field = query
        .field
        .unwrap_or_else(|| state.engine.config().build.sample_field.clone());

    let mut values: Vec<VariableValue> = get_values_range(store.as_ref(), start, end, &field)
        .into_iter()
        .map(|(quark, value)| VariableValue {
            context_id: context_id_of(store.as_ref(), quark),
            quark: quark.0,
            value,
        })
        .collect();
    values.sort_by_key(|v| (v.context_id, v.quark));

    #[derive(Serialize)]
    struct ValuesResponse {
        start: Timestamp,
        end: Timestamp,
        field: String,
        values: Vec<VariableValue>,
    }

    Ok(Json(ApiResponse::success(ValuesResponse {
        start,
        end,
        field,
        values,
    })))
}

async fn get_variable_handler(
    State(state): State<AppState>,
    Path((trace_id, context_id)): Path<(String, u64)>,
) -> Result<impl IntoResponse, ApiError> {
    let session = lookup_session(&state, &trace_id)?;
    let description = describe_variable(session.store().as_ref(), context_id).ok_or_else(|| {
        api_error(
            StatusCode::NOT_FOUND,
            format!("Unknown context: {}", context_id),
        )
    })?;
    Ok(Json(ApiResponse::success(description)))
}

#[derive(Debug, Deserialize)]
struct SeriesQuery {
    field: Option<String>,
    start: Option<Timestamp>,
    end: Option<Timestamp>,
    width: Option<Timestamp>,
}

/// `field` value selecting every value field at once.
const ALL_FIELDS: &str = "all";

#[derive(Debug, Serialize)]
struct ColoredBucket {
    #[serde(flatten)]
    bucket: Bucket,
    color: Option<String>,
}

/// Significant-digit samples use the fixed palette; other fields are
/// colored over the range of the returned buckets.
fn color_buckets(
    config: &Config,
    field: &str,
    type_size: i32,
    buckets: Vec<Bucket>,
) -> Vec<ColoredBucket> {
    if field == config.build.sample_field {
        let table: Vec<StateItem> =
            ColorMap::from_palette(&config.palette, 0.0, 100.0).state_table(STATE_TABLE_SIZE);
        return buckets
            .into_iter()
            .map(|bucket| ColoredBucket {
                color: state_index(bucket.value, type_size)
                    .and_then(|i| table.get(i))
                    .map(|item| item.color.to_hex()),
                bucket,
            })
            .collect();
    }

    let (min, max) = buckets
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), b| {
            (lo.min(b.value), hi.max(b.value))
        });
    let map = ColorMap::from_palette(&config.palette, min, max);
    buckets
        .into_iter()
        .map(|bucket| ColoredBucket {
            color: Some(map.color_for(bucket.value).to_hex()),
            bucket,
        })
        .collect()
}

async fn get_series_handler(
    State(state): State<AppState>,
    Path((trace_id, context_id)): Path<(String, u64)>,
    Query(query): Query<SeriesQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let session = lookup_session(&state, &trace_id)?;
    let config = state.engine.config();
    let store = session.store();
    let variable = variable_quark(store.as_ref(), context_id).ok_or_else(|| {
        api_error(
            StatusCode::NOT_FOUND,
            format!("No values recorded for context {}", context_id),
        )
    })?;
    let type_size = describe_variable(store.as_ref(), context_id)
        .map(|d| d.type_size)
        .unwrap_or_default();

    let start = query.start.unwrap_or_else(|| store.start_time());
    let end = query.end.unwrap_or_else(|| store.current_end_time());
    let (start, end) = clamp_window(store.as_ref(), start, end).unwrap_or((start, end));
    let width = query.width.unwrap_or_else(|| {
        bucket_width(
            start,
            end,
            config.build.display_width,
            config.build.bucket_multiplier,
        )
    });
    let field = query
        .field
        .unwrap_or_else(|| config.build.sample_field.clone());

    let all = if field == ALL_FIELDS {
        series_all_fields(store.as_ref(), variable, start, end, width)
    } else {
        vec![series(store.as_ref(), variable, &field, start, end, width)]
    };

    #[derive(Serialize)]
    struct FieldSeries {
        field: String,
        buckets: Vec<ColoredBucket>,
    }

    #[derive(Serialize)]
    struct SeriesResponse {
        context_id: u64,
        start: Timestamp,
        end: Timestamp,
        bucket_width: Timestamp,
        fields: Vec<FieldSeries>,
    }

    let effective_width = all.first().map_or(width.max(1), |s| s.width());
    let fields = all
        .iter()
        .map(|s| FieldSeries {
            field: s.field().to_string(),
            buckets: color_buckets(config, s.field(), type_size, s.collect_buckets()),
        })
        .collect();

    Ok(Json(ApiResponse::success(SeriesResponse {
        context_id,
        start,
        end,
        bucket_width: effective_width,
        fields,
    })))
}

#[derive(Debug, Deserialize)]
struct ProblematicQuery {
    limit: Option<f64>,
}

#[derive(Debug, Serialize)]
struct ProblematicVariable {
    index: usize,
    name: String,
    file: String,
    line: i32,
    context_id: Option<u64>,
    path: Vec<String>,
    lowest: f64,
}

async fn get_problematic_handler(
    State(state): State<AppState>,
    Path(trace_id): Path<String>,
    Query(query): Query<ProblematicQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let session = lookup_session(&state, &trace_id)?;
    let limit = query
        .limit
        .unwrap_or(state.engine.config().build.problem_limit);
    let tree = session.tree().await;

    let variables: Vec<ProblematicVariable> = tree
        .entries()
        .iter()
        .enumerate()
        .filter(|(_, entry)| entry.is_problematic(limit))
        .map(|(index, entry)| ProblematicVariable {
            index,
            name: entry.name.clone(),
            file: entry.file.clone(),
            line: entry.line,
            context_id: entry.context_id,
            path: tree.path(index).into_iter().map(str::to_string).collect(),
            lowest: entry
                .samples
                .iter()
                .map(|b| b.value)
                .fold(f64::INFINITY, f64::min),
        })
        .collect();

    #[derive(Serialize)]
    struct ProblematicResponse {
        limit: f64,
        count: usize,
        variables: Vec<ProblematicVariable>,
    }

    Ok(Json(ApiResponse::success(ProblematicResponse {
        limit,
        count: variables.len(),
        variables,
    })))
}
