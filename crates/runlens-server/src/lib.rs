use axum::{
    extract::{Path, Query, Request, State},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use runlens_classify::{classify_all_runs, classify_run, ClassifyError, CleanPassClassifier};
use runlens_core::{
    step_id, ClassificationSummary, FailureRecord, HeatmapCell, PatternGroup, RunRecord,
    SelfCorrectionRow, StatsPayload, StepRecord, WebSearchRecord,
};
use runlens_ingest::{ingest_reports, IngestOutcome};
use runlens_storage::{RunFilter, RunStore, StorageError};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{error, info};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub addr: String,
    pub db_path: PathBuf,
    pub reports_dir: PathBuf,
    pub dev: bool,
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("invalid listen address: {0}")]
    InvalidAddr(String),
    #[error("refusing to bind non-loopback address: {0}")]
    NonLoopbackAddr(String),
    #[error("runtime error: {0}")]
    Runtime(String),
}

/// Shared handler state. Stores are opened per request against `db_path`;
/// write operations serialize on `write_lock` (single-writer discipline).
pub struct AppState {
    db_path: PathBuf,
    reports_dir: PathBuf,
    write_lock: Mutex<()>,
}

impl AppState {
    pub fn new(db_path: PathBuf, reports_dir: PathBuf) -> Self {
        Self {
            db_path,
            reports_dir,
            write_lock: Mutex::new(()),
        }
    }
}

#[derive(Debug)]
enum ApiError {
    NotFound(String),
    Internal(String),
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        ApiError::Internal(err.to_string())
    }
}

impl From<ClassifyError> for ApiError {
    fn from(err: ClassifyError) -> Self {
        match err {
            ClassifyError::RunNotFound(run_id) => {
                ApiError::NotFound(format!("Run {run_id} not found"))
            }
            ClassifyError::Storage(err) => ApiError::Internal(err.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, detail) = match self {
            ApiError::NotFound(detail) => (StatusCode::NOT_FOUND, detail),
            ApiError::Internal(detail) => {
                error!(event = "api_error", detail = %detail);
                (StatusCode::INTERNAL_SERVER_ERROR, detail)
            }
        };
        (status, Json(json!({ "detail": detail }))).into_response()
    }
}

#[derive(Debug, Default, Deserialize)]
struct RunsQuery {
    status: Option<String>,
    has_architectural: Option<bool>,
    build_phase: Option<String>,
    error_category: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct IngestQuery {
    #[serde(default)]
    force: bool,
}

#[derive(Debug, Default, Deserialize)]
struct ClassifyQuery {
    run_id: Option<String>,
    #[serde(default)]
    force: bool,
}

#[derive(Debug, Serialize)]
struct RunSummaryPayload {
    #[serde(flatten)]
    run: RunRecord,
    classifications: ClassificationSummary,
}

#[derive(Debug, Serialize)]
struct RunDetailPayload {
    run: RunRecord,
    steps: Vec<StepRecord>,
    failures: Vec<FailureRecord>,
    web_searches: Vec<WebSearchRecord>,
    classifications: ClassificationSummary,
}

#[derive(Debug, Serialize)]
struct StepDetailPayload {
    step: StepRecord,
    failures: Vec<FailureRecord>,
    web_searches: Vec<WebSearchRecord>,
}

#[derive(Debug, Serialize)]
struct PatternPayload {
    pattern: String,
    #[serde(flatten)]
    group: PatternGroup,
}

/// Tool triples are formatted "planner/implementer/verifier" here, at the
/// presentation boundary; the aggregation itself groups on the structured
/// key.
#[derive(Debug, Serialize)]
struct ToolComparisonPayload {
    tool_config: String,
    run_count: i64,
    avg_success_rate: f64,
    total_retries: i64,
    architectural_count: i64,
    implementation_count: i64,
}

#[derive(Debug, Serialize)]
struct PatternsPayload {
    error_heatmap: Vec<HeatmapCell>,
    top_patterns: Vec<PatternPayload>,
    self_correction: Vec<SelfCorrectionRow>,
    tool_comparison: Vec<ToolComparisonPayload>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/api/runs", get(list_runs))
        .route("/api/runs/:run_id", get(run_detail))
        .route("/api/runs/:run_id/steps", get(run_steps))
        .route("/api/runs/:run_id/steps/:step_number", get(step_detail))
        .route("/api/stats", get(stats))
        .route("/api/patterns", get(patterns))
        .route("/api/ingest", post(trigger_ingest))
        .route("/api/classify", post(trigger_classify))
        .layer(middleware::from_fn(cors))
        .with_state(state)
}

/// Run an operation against a store scoped to this request. The store is
/// opened inside the blocking task and dropped on every exit path.
async fn with_store<T, F>(state: &Arc<AppState>, op: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&mut RunStore) -> Result<T, ApiError> + Send + 'static,
{
    let db_path = state.db_path.clone();
    tokio::task::spawn_blocking(move || {
        let mut store = RunStore::open(&db_path).map_err(ApiError::from)?;
        op(&mut store)
    })
    .await
    .map_err(|err| ApiError::Internal(err.to_string()))?
}

async fn list_runs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RunsQuery>,
) -> Result<Json<Vec<RunSummaryPayload>>, ApiError> {
    let filter = RunFilter {
        status: query.status,
        has_architectural: query.has_architectural,
        build_phase: query.build_phase,
        error_category: query.error_category,
    };
    let payload = with_store(&state, move |store| {
        let runs = store.runs_filtered(&filter)?;
        Ok(runs
            .into_iter()
            .map(|(run, classifications)| RunSummaryPayload {
                run,
                classifications,
            })
            .collect::<Vec<_>>())
    })
    .await?;
    Ok(Json(payload))
}

async fn run_detail(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> Result<Json<RunDetailPayload>, ApiError> {
    let payload = with_store(&state, move |store| {
        let run = store
            .run(&run_id)?
            .ok_or_else(|| ApiError::NotFound(format!("Run {run_id} not found")))?;
        Ok(RunDetailPayload {
            steps: store.steps_for_run(&run_id)?,
            failures: store.failures_for_run(&run_id)?,
            web_searches: store.web_searches_for_run(&run_id)?,
            classifications: store.classification_summary(&run_id)?,
            run,
        })
    })
    .await?;
    Ok(Json(payload))
}

async fn run_steps(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> Result<Json<Vec<StepRecord>>, ApiError> {
    let steps = with_store(&state, move |store| {
        if !store.run_exists(&run_id)? {
            return Err(ApiError::NotFound(format!("Run {run_id} not found")));
        }
        Ok(store.steps_for_run(&run_id)?)
    })
    .await?;
    Ok(Json(steps))
}

async fn step_detail(
    State(state): State<Arc<AppState>>,
    Path((run_id, step_number)): Path<(String, i64)>,
) -> Result<Json<StepDetailPayload>, ApiError> {
    let payload = with_store(&state, move |store| {
        if !store.run_exists(&run_id)? {
            return Err(ApiError::NotFound(format!("Run {run_id} not found")));
        }
        let step = store.step_detail(&run_id, step_number)?.ok_or_else(|| {
            ApiError::NotFound(format!("Step {step_number} not found in run {run_id}"))
        })?;
        Ok(StepDetailPayload {
            failures: store.failures_for_step(&run_id, step_number)?,
            web_searches: store
                .web_searches_for_step(&run_id, &step_id(&run_id, step_number))?,
            step,
        })
    })
    .await?;
    Ok(Json(payload))
}

async fn stats(State(state): State<Arc<AppState>>) -> Result<Json<StatsPayload>, ApiError> {
    let payload = with_store(&state, move |store| Ok(store.stats()?)).await?;
    Ok(Json(payload))
}

async fn patterns(
    State(state): State<Arc<AppState>>,
) -> Result<Json<PatternsPayload>, ApiError> {
    let payload = with_store(&state, move |store| {
        let top_patterns = store
            .top_patterns()?
            .into_iter()
            .map(|group| PatternPayload {
                pattern: format!("{} in {}", group.category, group.build_phase),
                group,
            })
            .collect();
        let tool_comparison = store
            .tool_comparison()?
            .into_iter()
            .map(|row| ToolComparisonPayload {
                tool_config: row.tools.label(),
                run_count: row.run_count,
                avg_success_rate: row.avg_success_rate,
                total_retries: row.total_retries,
                architectural_count: row.architectural_count,
                implementation_count: row.implementation_count,
            })
            .collect();
        Ok(PatternsPayload {
            error_heatmap: store.error_heatmap()?,
            top_patterns,
            self_correction: store.self_correction()?,
            tool_comparison,
        })
    })
    .await?;
    Ok(Json(payload))
}

async fn trigger_ingest(
    State(state): State<Arc<AppState>>,
    Query(query): Query<IngestQuery>,
) -> Result<Json<IngestOutcome>, ApiError> {
    let _guard = state.write_lock.lock().await;
    let reports_dir = state.reports_dir.clone();
    let outcome = with_store(&state, move |store| {
        Ok(ingest_reports(store, &reports_dir, query.force))
    })
    .await?;
    Ok(Json(outcome))
}

async fn trigger_classify(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ClassifyQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let _guard = state.write_lock.lock().await;
    let payload = with_store(&state, move |store| {
        let classifier = CleanPassClassifier;
        match query.run_id {
            Some(run_id) => {
                let outcome = classify_run(store, &classifier, &run_id, query.force)?;
                Ok(json!({
                    "run_id": run_id,
                    "classified": outcome.classified,
                    "skipped": outcome.skipped,
                    "errors": outcome.errors,
                }))
            }
            None => {
                let totals = classify_all_runs(store, &classifier)?;
                serde_json::to_value(&totals)
                    .map_err(|err| ApiError::Internal(err.to_string()))
            }
        }
    })
    .await?;
    Ok(Json(payload))
}

/// Permissive CORS for the local dashboard UI; preflight requests are
/// answered without touching the router.
async fn cors(req: Request, next: Next) -> Response {
    if req.method() == Method::OPTIONS {
        let mut response = StatusCode::NO_CONTENT.into_response();
        apply_cors_headers(response.headers_mut());
        return response;
    }
    let mut response = next.run(req).await;
    apply_cors_headers(response.headers_mut());
    response
}

fn apply_cors_headers(headers: &mut HeaderMap) {
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("*"),
    );
}

/// Initialize the store, auto-ingest pending reports, then serve until
/// ctrl-c.
pub async fn serve(config: ServerConfig) -> Result<(), ServerError> {
    let addr: SocketAddr = config
        .addr
        .parse()
        .map_err(|_| ServerError::InvalidAddr(config.addr.clone()))?;
    if !addr.ip().is_loopback() {
        return Err(ServerError::NonLoopbackAddr(config.addr.clone()));
    }

    let state = Arc::new(AppState::new(
        config.db_path.clone(),
        config.reports_dir.clone(),
    ));

    let db_path = config.db_path.clone();
    let reports_dir = config.reports_dir.clone();
    let startup = tokio::task::spawn_blocking(move || -> Result<IngestOutcome, ServerError> {
        let mut store = RunStore::open(&db_path)?;
        Ok(ingest_reports(&mut store, &reports_dir, false))
    })
    .await
    .map_err(|err| ServerError::Runtime(err.to_string()))??;
    info!(
        event = "startup_ingest",
        ingested = startup.ingested,
        skipped = startup.skipped,
        errors = startup.errors,
    );

    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(event = "server_start", addr = %config.addr, dev = config.dev);

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
