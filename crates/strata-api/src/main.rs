//! strata-api - HTTP API server for strata
//!
//! Thin surface over the capture store and job queue: submit a capture,
//! poll its job, retry a failed one, and trigger processing. All heavy
//! lifting lives in `strata-jobs`; handlers here validate, persist, and
//! answer.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use sqlx::{Pool, Postgres};
use tower_http::{
    limit::RequestBodyLimitLayer,
    request_id::{MakeRequestId, PropagateRequestIdLayer, RequestId, SetRequestIdLayer},
    trace::TraceLayer,
};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use strata_core::{
    defaults, CreateCaptureRequest, CreateCaptureResponse, CreateImport, DispatchOutcome,
    DispatchRecomputeRequest, Error, ImportRepository, Job, JobRepository, JobStatusView,
    JobType, ProcessQueueRequest, QueueImportJob,
};
use strata_db::{
    compute_content_hash, log_pool_metrics, Database, PgChunkRepository,
    PgConversationRepository, PgDecisionRepository, PgImportRepository, PgJobRepository,
    PgMessageRepository, PgStructureRepository, PgTaskRepository, PoolConfig,
};
use strata_inference::{OllamaBackend, OllamaTagExtractor};
use strata_jobs::{
    ImportHandler, PollingWorker, ProcessorConfig, QueueProcessor, RecomputeDispatcher,
    RecomputeHandler, WorkerConfig,
};

// =============================================================================
// REQUEST ID (UUIDv7)
// =============================================================================

/// Generates time-ordered UUIDv7 request correlation IDs.
///
/// UUIDv7 embeds a Unix timestamp, so IDs sort chronologically — useful
/// for correlating a capture submission with the pipeline logs it spawns.
#[derive(Clone, Default)]
struct MakeRequestUuidV7;

impl MakeRequestId for MakeRequestUuidV7 {
    fn make_request_id<B>(&mut self, _request: &axum::http::Request<B>) -> Option<RequestId> {
        let id = Uuid::now_v7().to_string().parse().ok()?;
        Some(RequestId::new(id))
    }
}

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Runtime settings for the HTTP server.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Bind address.
    pub host: String,
    /// Bind port.
    pub port: u16,
    /// Request body cap in bytes.
    pub max_body_bytes: usize,
    /// Shared secret for the `/v1/admin` and `/v1/internal` routes.
    /// Unset leaves those routes refusing every request.
    pub admin_token: Option<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: defaults::SERVER_PORT,
            max_body_bytes: defaults::MAX_BODY_SIZE_BYTES,
            admin_token: None,
        }
    }
}

impl ApiConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `STRATA_HOST` | `0.0.0.0` | Bind address |
    /// | `STRATA_PORT` | `3400` | Bind port |
    /// | `STRATA_MAX_BODY_BYTES` | `4194304` | Request body cap |
    /// | `STRATA_ADMIN_TOKEN` | unset | Admin shared secret |
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: std::env::var("STRATA_HOST").unwrap_or(defaults.host),
            port: std::env::var("STRATA_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.port),
            max_body_bytes: std::env::var("STRATA_MAX_BODY_BYTES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_body_bytes),
            admin_token: std::env::var("STRATA_ADMIN_TOKEN")
                .ok()
                .filter(|t| !t.is_empty()),
        }
    }
}

// =============================================================================
// APP STATE
// =============================================================================

/// Shared state for all request handlers.
#[derive(Clone)]
struct AppState {
    jobs: Arc<dyn JobRepository>,
    imports: Arc<dyn ImportRepository>,
    processor: Arc<QueueProcessor>,
    recompute: Arc<RecomputeDispatcher>,
    /// Present only when backed by PostgreSQL; `/health` reports pool
    /// utilization from it.
    pool: Option<Pool<Postgres>>,
    admin_token: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize tracing
    //
    // Environment variables:
    //   LOG_FORMAT - "json" or "text" (default: "text")
    //   RUST_LOG   - standard env filter (default: "info")
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let registry = tracing_subscriber::registry().with(env_filter);
    if log_format == "json" {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    let config = ApiConfig::from_env();
    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| "postgres://localhost/strata".to_string());

    // Connect to database
    info!("Connecting to database...");
    let db = Database::connect_with_config(&database_url, PoolConfig::from_env()).await?;
    info!("Database connected");

    // Run pending database migrations on startup
    info!("Running database migrations...");
    db.migrate().await?;
    info!("Database migrations complete");

    let pool = db.pool().clone();
    let jobs: Arc<dyn JobRepository> = Arc::new(PgJobRepository::new(pool.clone()));
    let imports: Arc<dyn ImportRepository> = Arc::new(PgImportRepository::new(pool.clone()));

    // Build the processor with both pipelines registered. The Ollama
    // clients read their own endpoint/model settings from the
    // environment.
    let import_handler = ImportHandler::new(
        imports.clone(),
        Arc::new(PgConversationRepository::new(pool.clone())),
        Arc::new(PgMessageRepository::new(pool.clone())),
        Arc::new(PgChunkRepository::new(pool.clone())),
        Arc::new(OllamaBackend::from_env()),
        Arc::new(OllamaTagExtractor::from_env()),
    );
    let recompute_handler = RecomputeHandler::new(
        Arc::new(PgConversationRepository::new(pool.clone())),
        Arc::new(PgMessageRepository::new(pool.clone())),
        Arc::new(PgTaskRepository::new(pool.clone())),
        Arc::new(PgDecisionRepository::new(pool.clone())),
        Arc::new(PgStructureRepository::new(pool.clone())),
    );
    let processor = Arc::new(
        QueueProcessor::new(jobs.clone())
            .with_config(ProcessorConfig::from_env())
            .with_handler(import_handler)
            .with_handler(recompute_handler),
    );

    // Start the polling worker; it exits immediately when disabled via
    // STRATA_WORKER_ENABLED.
    let _worker_handle =
        PollingWorker::new(processor.clone(), jobs.clone(), WorkerConfig::from_env()).start();

    // Pool utilization snapshot once a minute.
    let metrics_pool = pool.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            log_pool_metrics(&metrics_pool);
        }
    });

    let recompute = Arc::new(RecomputeDispatcher::new(jobs.clone()));
    let state = AppState {
        jobs,
        imports,
        processor,
        recompute,
        pool: Some(pool),
        admin_token: config.admin_token.clone(),
    };

    let app = build_router(state, config.max_body_bytes);

    // Start server
    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    info!("Starting server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// =============================================================================
// ROUTER
// =============================================================================

fn build_router(state: AppState, max_body_bytes: usize) -> Router {
    Router::new()
        // Health check
        .route("/health", get(health_check))
        // Captures
        .route("/v1/captures", post(create_capture))
        // Jobs
        .route("/v1/jobs", get(list_jobs))
        .route("/v1/jobs/:id", get(get_job))
        .route("/v1/jobs/:id/retry", post(retry_job))
        // Admin / internal
        .route("/v1/admin/jobs/process", post(process_jobs))
        .route("/v1/internal/recompute", post(dispatch_recompute))
        // Middleware
        .layer(TraceLayer::new_for_http())
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuidV7))
        .layer(RequestBodyLimitLayer::new(max_body_bytes))
        .with_state(state)
}

// =============================================================================
// IDENTITY AND ADMIN GUARDS
// =============================================================================

/// Resolve the calling user from the `X-User-Id` header. Session
/// resolution happens upstream; this service trusts the forwarded id.
fn caller_id(headers: &HeaderMap) -> Result<Uuid, ApiError> {
    let raw = headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::Unauthorized("missing X-User-Id header".to_string()))?;
    Uuid::parse_str(raw)
        .map_err(|_| ApiError::Unauthorized(format!("malformed X-User-Id: {}", raw)))
}

/// Check the `X-Admin-Token` shared secret.
fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let configured = state.admin_token.as_deref().ok_or_else(|| {
        ApiError::Unauthorized("admin routes are disabled: no admin token configured".to_string())
    })?;
    let presented = headers
        .get("x-admin-token")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::Unauthorized("missing X-Admin-Token header".to_string()))?;
    if presented != configured {
        return Err(ApiError::Unauthorized("invalid admin token".to_string()));
    }
    Ok(())
}

// =============================================================================
// CAPTURE HANDLERS
// =============================================================================

async fn create_capture(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateCaptureRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = caller_id(&headers)?;

    // Invalid input is rejected here; nothing reaches the queue.
    if body.raw_text.trim().is_empty() {
        return Err(Error::Validation("raw_text is empty".to_string()).into());
    }

    let content_hash = compute_content_hash(&body.raw_text);
    if let Some(existing) = state
        .imports
        .find_by_content_hash(user_id, &content_hash)
        .await?
    {
        return Err(ApiError::Conflict(format!(
            "identical capture already received as import {}",
            existing
        )));
    }

    let import_id = state
        .imports
        .create(CreateImport {
            user_id,
            mode: body.mode,
            title: body.title,
            raw_text: body.raw_text,
            content_hash,
        })
        .await?;
    let job_id = state
        .jobs
        .queue_import(QueueImportJob { user_id, import_id })
        .await?;

    info!(
        subsystem = "api",
        component = "captures",
        op = "create",
        import_id = %import_id,
        job_id = %job_id,
        user_id = %user_id,
        "Capture accepted"
    );

    Ok((
        StatusCode::CREATED,
        Json(CreateCaptureResponse { import_id, job_id }),
    ))
}

// =============================================================================
// JOB HANDLERS
// =============================================================================

/// Fetch a job the caller owns. Jobs belonging to other users read as
/// absent, so ids cannot be probed across accounts.
async fn fetch_owned_job(state: &AppState, job_id: Uuid, user_id: Uuid) -> Result<Job, ApiError> {
    match state.jobs.get(job_id).await? {
        Some(job) if job.user_id == user_id => Ok(job),
        _ => Err(ApiError::NotFound(format!("job {} not found", job_id))),
    }
}

async fn list_jobs(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = caller_id(&headers)?;
    // Recompute jobs are internal; the polling surface shows captures.
    let jobs = state
        .jobs
        .list_recent_for_user(user_id, Some(JobType::ImportProcessing), defaults::PAGE_LIMIT_JOBS)
        .await?;
    let views: Vec<JobStatusView> = jobs.iter().map(JobStatusView::from_job).collect();
    Ok(Json(serde_json::json!({ "jobs": views })))
}

async fn get_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = caller_id(&headers)?;
    let job = fetch_owned_job(&state, id, user_id).await?;
    Ok(Json(JobStatusView::from_job(&job)))
}

async fn retry_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = caller_id(&headers)?;
    fetch_owned_job(&state, id, user_id).await?;

    let job = state.jobs.reset_for_retry(id).await?;
    info!(
        subsystem = "api",
        component = "jobs",
        op = "retry",
        job_id = %id,
        job_step = %job.step,
        "Errored job requeued"
    );
    Ok(Json(JobStatusView::from_job(&job)))
}

async fn process_jobs(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Option<Json<ProcessQueueRequest>>,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&state, &headers)?;
    let limit = body.and_then(|Json(req)| req.limit);
    let outcome = state.processor.process_queue(limit).await?;
    Ok(Json(outcome))
}

// =============================================================================
// RECOMPUTE HANDLERS
// =============================================================================

async fn dispatch_recompute(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<DispatchRecomputeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&state, &headers)?;

    // Dispatch failures are logged inside the dispatcher and swallowed;
    // the response acknowledges the request either way.
    let response = match state
        .recompute
        .dispatch(body.user_id, body.scope, &body.reason)
        .await
    {
        Some(outcome) => serde_json::json!({
            "job_id": outcome.job_id(),
            "merged": matches!(outcome, DispatchOutcome::Merged(_)),
        }),
        None => serde_json::json!({ "job_id": null, "merged": false }),
    };
    Ok((StatusCode::ACCEPTED, Json(response)))
}

// =============================================================================
// HEALTH CHECK
// =============================================================================

async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let mut body = serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
    });
    if let Some(pool) = &state.pool {
        body["pool"] = serde_json::json!({
            "size": pool.size(),
            "idle": pool.num_idle(),
        });
    }
    Json(body)
}

// =============================================================================
// ERROR HANDLING
// =============================================================================

#[derive(Debug)]
enum ApiError {
    Internal(Error),
    Unauthorized(String),
    NotFound(String),
    BadRequest(String),
    Conflict(String),
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        match err {
            Error::Validation(msg) => ApiError::BadRequest(msg),
            Error::NotFound(msg) => ApiError::NotFound(msg),
            Error::JobNotFound(id) => ApiError::NotFound(format!("job {} not found", id)),
            Error::ImportNotFound(id) => ApiError::NotFound(format!("import {} not found", id)),
            Error::Unauthorized(msg) => ApiError::Unauthorized(msg),
            Error::ClaimConflict(msg) => ApiError::Conflict(msg),
            other => ApiError::Internal(other),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match self {
            ApiError::Internal(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
        };

        let body = Json(serde_json::json!({
            "error": message,
        }));

        (status, body).into_response()
    }
}

// =============================================================================
// TESTS
// =============================================================================
