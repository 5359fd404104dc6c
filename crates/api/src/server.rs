use std::{convert::Infallible, env, net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use crate::middleware::rate_limit::{rate_limit_layer, RateLimitConfig};
use anyhow::{Context, Result};
use auth::{AuthError, Authenticator};
use axum::{
    extract::{Multipart, Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, SecondsFormat, Utc};
use futures::Stream;
use sandbox::{Controller, ControllerConfig, SandboxDriver, SandboxDriverConfig, SandboxError};
use serde::{Deserialize, Serialize};
use store::{Database, JobRecord, JobStatus, NewJob};
use tokio_stream::StreamExt as _;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use utoipa::{IntoParams, Modify, OpenApi, ToSchema};
use uuid::Uuid;

/// How often the SSE handler re-polls the Store while a job hasn't reached
/// the state it's waiting for.
const SSE_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Grace period for a freshly submitted job to leave `queued`. Covers the
/// time between insert and the Controller's next reconcile tick.
const WAIT_FOR_START_GRACE: Duration = Duration::from_secs(30);

/// Grace period after the sandbox log stream ends for the Controller to
/// persist a final `success` value.
const FINALIZATION_GRACE: Duration = Duration::from_secs(15);

pub async fn run() -> Result<()> {
    let config = AppConfig::from_env()?;

    let store = Database::connect(&config.database_url)
        .await
        .context("failed to open database")?;

    tokio::fs::create_dir_all(&config.incoming_dir)
        .await
        .context("failed to create incoming upload directory")?;

    let driver = SandboxDriver::new(SandboxDriverConfig {
        binary: "docker".to_string(),
        image: config.container_image.clone(),
        container_name_prefix: config.container_prefix.clone(),
        stop_timeout: Duration::from_secs(10),
    });

    let controller = Controller::new(
        store.clone(),
        driver,
        ControllerConfig {
            reconcile_interval: config.reconcile_interval,
            scratch_root: config.scratch_root.clone(),
        },
    );
    controller.start();

    let authenticator = Arc::new(Authenticator::new(store.clone()));
    let state = Arc::new(AppState {
        store,
        controller,
        authenticator,
        config: config.clone(),
    });

    let app = build_router(state)
        .layer(rate_limit_layer(RateLimitConfig::default()))
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listen socket")?;

    info!(addr = %config.listen_addr, "ci-api listening");
    axum::serve(listener, app)
        .await
        .context("HTTP server exited")?;
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/submit", post(submit))
        .route("/submit-stream", post(submit_stream))
        .route("/submit-async", post(submit_async))
        .route("/jobs/:id/stream", get(stream_job))
        .route("/jobs", get(list_jobs))
        .route("/jobs/:id", get(get_job))
        .with_state(state)
}

struct AppState {
    store: Database,
    controller: Arc<Controller>,
    authenticator: Arc<Authenticator>,
    config: AppConfig,
}

#[derive(Debug, Clone)]
struct AppConfig {
    listen_addr: SocketAddr,
    database_url: String,
    scratch_root: PathBuf,
    incoming_dir: PathBuf,
    container_image: String,
    container_prefix: String,
    reconcile_interval: Duration,
}

impl AppConfig {
    fn from_env() -> Result<Self> {
        let listen_addr = env::var("CI_API_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:8080".to_string())
            .parse()
            .context("invalid CI_API_ADDR")?;

        let db_path = env::var("CI_DB_PATH").context("CI_DB_PATH must be configured")?;
        let database_url = if db_path.contains("://") {
            db_path
        } else {
            format!("sqlite://{db_path}?mode=rwc")
        };

        let scratch_root = env::var("CI_SCRATCH_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| std::env::temp_dir().join("ci_job_workspaces"));
        let incoming_dir = scratch_root.join("incoming");

        let container_image =
            env::var("CI_PYTHON_BASE_IMAGE").unwrap_or_else(|_| "python:3.11-slim".to_string());
        let container_prefix =
            env::var("CI_CONTAINER_PREFIX").unwrap_or_else(|_| "ci_job_".to_string());

        let (reconcile_interval_secs, reconcile_warning) =
            parse_reconcile_interval(env::var("CI_RECONCILE_INTERVAL").ok().as_deref());
        if let Some(message) = reconcile_warning {
            tracing::warn!("{message}");
        }

        Ok(Self {
            listen_addr,
            database_url,
            scratch_root,
            incoming_dir,
            container_image,
            container_prefix,
            reconcile_interval: Duration::from_secs_f64(reconcile_interval_secs),
        })
    }
}

/// Parses `CI_RECONCILE_INTERVAL`. An invalid or non-positive value falls
/// back to 2.0 seconds rather than stalling or busy-looping the controller.
fn parse_reconcile_interval(raw: Option<&str>) -> (f64, Option<String>) {
    const DEFAULT: f64 = 2.0;
    match raw {
        None => (DEFAULT, None),
        Some(value) => {
            let trimmed = value.trim();
            if trimmed.is_empty() {
                return (DEFAULT, None);
            }
            match trimmed.parse::<f64>() {
                Ok(parsed) if parsed > 0.0 => (parsed, None),
                Ok(parsed) => (
                    DEFAULT,
                    Some(format!(
                        "CI_RECONCILE_INTERVAL={parsed} must be positive; defaulting to {DEFAULT}"
                    )),
                ),
                Err(_) => (
                    DEFAULT,
                    Some(format!(
                        "CI_RECONCILE_INTERVAL='{trimmed}' is not a valid number; defaulting to {DEFAULT}"
                    )),
                ),
            }
        }
    }
}

// --------------------------------------------------------------- handlers

#[utoipa::path(get, path = "/health", responses((status = 200, description = "Service is up")))]
async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

#[utoipa::path(
    post,
    path = "/submit",
    responses(
        (status = 200, description = "SSE stream of job status and logs until terminal", content_type = "text/event-stream"),
        (status = 401, description = "Missing or invalid credentials", body = ErrorBody),
        (status = 403, description = "Revoked key or inactive user", body = ErrorBody)
    ),
    security(("bearerAuth" = []))
)]
async fn submit(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    multipart: Multipart,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let user = authenticate(&state, &headers).await?;
    let job = create_job_from_upload(&state, user_id(&user), multipart).await?;
    Ok(sse_response(job_event_stream(state, job.id, false, false)))
}

#[utoipa::path(
    post,
    path = "/submit-stream",
    responses(
        (status = 200, description = "SSE stream; first event carries the new job id", content_type = "text/event-stream"),
        (status = 401, description = "Missing or invalid credentials", body = ErrorBody),
        (status = 403, description = "Revoked key or inactive user", body = ErrorBody)
    ),
    security(("bearerAuth" = []))
)]
async fn submit_stream(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    multipart: Multipart,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let user = authenticate(&state, &headers).await?;
    let job = create_job_from_upload(&state, user_id(&user), multipart).await?;
    Ok(sse_response(job_event_stream(state, job.id, false, true)))
}

#[utoipa::path(
    post,
    path = "/submit-async",
    responses(
        (status = 200, description = "Job accepted", body = JobIdResponse),
        (status = 401, description = "Missing or invalid credentials", body = ErrorBody),
        (status = 403, description = "Revoked key or inactive user", body = ErrorBody)
    ),
    security(("bearerAuth" = []))
)]
async fn submit_async(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    multipart: Multipart,
) -> Result<Json<JobIdResponse>, ApiError> {
    let user = authenticate(&state, &headers).await?;
    let job = create_job_from_upload(&state, user_id(&user), multipart).await?;
    Ok(Json(JobIdResponse { job_id: job.id }))
}

#[derive(Debug, Deserialize, IntoParams)]
struct StreamParams {
    /// Replay the full historical log for an already-terminal job.
    #[serde(default)]
    from_beginning: bool,
}

#[utoipa::path(
    get,
    path = "/jobs/{id}/stream",
    params(
        ("id" = Uuid, Path, description = "Job identifier"),
        StreamParams
    ),
    responses(
        (status = 200, description = "SSE stream of job status and logs until terminal", content_type = "text/event-stream"),
        (status = 401, description = "Missing or invalid credentials", body = ErrorBody),
        (status = 403, description = "Job belongs to another user", body = ErrorBody),
        (status = 404, description = "Job not found", body = ErrorBody)
    ),
    security(("bearerAuth" = []))
)]
async fn stream_job(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Query(params): Query<StreamParams>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let user = authenticate(&state, &headers).await?;
    let job = fetch_owned_job(&state, id, user_id(&user)).await?;
    Ok(sse_response(job_event_stream(
        state,
        job.id,
        params.from_beginning,
        false,
    )))
}

#[utoipa::path(
    get,
    path = "/jobs",
    responses(
        (status = 200, description = "Jobs owned by the caller", body = [JobSummaryResponse]),
        (status = 401, description = "Missing or invalid credentials", body = ErrorBody)
    ),
    security(("bearerAuth" = []))
)]
async fn list_jobs(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<JobSummaryResponse>>, ApiError> {
    let user = authenticate(&state, &headers).await?;
    let jobs = state
        .store
        .list_jobs_by_user(user.id)
        .await
        .map_err(ApiError::from)?;
    Ok(Json(jobs.into_iter().map(JobSummaryResponse::from).collect()))
}

#[utoipa::path(
    get,
    path = "/jobs/{id}",
    params(("id" = Uuid, Path, description = "Job identifier")),
    responses(
        (status = 200, description = "Job summary", body = JobSummaryResponse),
        (status = 401, description = "Missing or invalid credentials", body = ErrorBody),
        (status = 403, description = "Job belongs to another user", body = ErrorBody),
        (status = 404, description = "Job not found", body = ErrorBody)
    ),
    security(("bearerAuth" = []))
)]
async fn get_job(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<JobSummaryResponse>, ApiError> {
    let user = authenticate(&state, &headers).await?;
    let job = fetch_owned_job(&state, id, user_id(&user)).await?;
    Ok(Json(JobSummaryResponse::from(job)))
}

// ---------------------------------------------------------------- helpers

fn user_id(user: &store::UserRecord) -> Uuid {
    user.id
}

async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<store::UserRecord, ApiError> {
    let token = require_bearer(headers)?;
    state.authenticator.authenticate(token).await.map_err(ApiError::from)
}

async fn fetch_owned_job(state: &AppState, id: Uuid, user_id: Uuid) -> Result<JobRecord, ApiError> {
    let job = state
        .store
        .get_job(id)
        .await
        .map_err(ApiError::from)?
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, format!("job {id} not found")))?;

    match job.user_id {
        Some(owner) if owner == user_id => Ok(job),
        _ => Err(ApiError::new(StatusCode::FORBIDDEN, "job belongs to another user")),
    }
}

async fn create_job_from_upload(
    state: &AppState,
    user_id: Uuid,
    mut multipart: Multipart,
) -> Result<JobRecord, ApiError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::bad_request(format!("invalid multipart body: {err}")))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let bytes = field
            .bytes()
            .await
            .map_err(|err| ApiError::bad_request(format!("failed to read archive upload: {err}")))?;
        let job_id = Uuid::new_v4();
        let path = state
            .config
            .incoming_dir
            .join(format!("ci_job_{job_id}_upload.zip"));
        tokio::fs::write(&path, &bytes)
            .await
            .map_err(|err| ApiError::internal(format!("failed to store upload: {err}")))?;
        return state
            .store
            .create_job(NewJob {
                id: job_id,
                archive_path: &path.display().to_string(),
                user_id,
            })
            .await
            .map_err(ApiError::from);
    }

    Err(ApiError::bad_request("multipart field 'file' is required"))
}

fn sse_response<S>(stream: S) -> Sse<S>
where
    S: Stream<Item = Result<Event, Infallible>>,
{
    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// Drives a single SSE connection through the wait-for-start, terminal
/// fast-path, live and finalization phases of `GET /jobs/{id}/stream`.
/// `prefix_job_id` makes `/submit-stream` emit a `job_id` event first.
fn job_event_stream(
    state: Arc<AppState>,
    job_id: Uuid,
    from_beginning: bool,
    prefix_job_id: bool,
) -> impl Stream<Item = Result<Event, Infallible>> {
    async_stream::stream! {
        if prefix_job_id {
            yield Ok(job_id_event(job_id));
        }

        let mut job = match state.store.get_job(job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                yield Ok(log_event("Job not found."));
                yield Ok(complete_event(false));
                return;
            }
            Err(err) => {
                yield Ok(log_event(&format!("error loading job: {err}")));
                yield Ok(complete_event(false));
                return;
            }
        };

        // Phase 2: wait-for-start.
        if job.status == JobStatus::Queued {
            let deadline = tokio::time::Instant::now() + WAIT_FOR_START_GRACE;
            loop {
                if job.status != JobStatus::Queued {
                    break;
                }
                if tokio::time::Instant::now() >= deadline {
                    break;
                }
                tokio::time::sleep(SSE_POLL_INTERVAL).await;
                match state.store.get_job(job_id).await {
                    Ok(Some(refreshed)) => job = refreshed,
                    Ok(None) => {
                        yield Ok(log_event("Job not found."));
                        yield Ok(complete_event(false));
                        return;
                    }
                    Err(err) => {
                        yield Ok(log_event(&format!("error loading job: {err}")));
                        yield Ok(complete_event(false));
                        return;
                    }
                }
            }
        }

        // Phase 3: terminal fast path.
        if job.is_terminal() {
            if !from_beginning {
                yield Ok(log_event("Job already completed."));
            } else if let Some(container_id) = job.sandbox_id.clone() {
                match state.controller.driver().stream_logs(&container_id, false) {
                    Ok(log_stream) => {
                        tokio::pin!(log_stream);
                        while let Some(line) = log_stream.next().await {
                            match line {
                                Ok(text) => yield Ok(log_event(&text)),
                                Err(_) => break,
                            }
                        }
                    }
                    Err(err) => {
                        tracing::debug!(job_id = %job_id, error = %err, "no historical log available");
                        yield Ok(log_event("No logs available."));
                    }
                }
            } else {
                yield Ok(log_event("No logs available."));
            }
            yield Ok(complete_event(job.success.unwrap_or(false)));
            return;
        }

        // Phase 4: live phase.
        if job.status == JobStatus::Running {
            if let Some(container_id) = job.sandbox_id.clone() {
                match state.controller.driver().stream_logs(&container_id, true) {
                    Ok(log_stream) => {
                        tokio::pin!(log_stream);
                        while let Some(line) = log_stream.next().await {
                            match line {
                                Ok(text) => yield Ok(log_event(&text)),
                                Err(_) => break,
                            }
                        }
                    }
                    Err(err) => {
                        tracing::debug!(job_id = %job_id, error = %err, "log stream unavailable");
                    }
                }
            }
        }

        // Phase 5: finalization wait.
        let deadline = tokio::time::Instant::now() + FINALIZATION_GRACE;
        loop {
            match state.store.get_job(job_id).await {
                Ok(Some(refreshed)) => {
                    if refreshed.success.is_some() || refreshed.is_terminal() {
                        yield Ok(complete_event(refreshed.success.unwrap_or(false)));
                        return;
                    }
                }
                Ok(None) => {
                    yield Ok(complete_event(false));
                    return;
                }
                Err(_) => {}
            }
            if tokio::time::Instant::now() >= deadline {
                yield Ok(complete_event(false));
                return;
            }
            tokio::time::sleep(SSE_POLL_INTERVAL).await;
        }
    }
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum SseEvent<'a> {
    JobId { job_id: Uuid },
    Log { data: &'a str },
    Complete { success: bool },
}

fn json_event(event: &SseEvent<'_>) -> Event {
    Event::default()
        .json_data(event)
        .unwrap_or_else(|_| Event::default().data("{\"type\":\"log\",\"data\":\"serialization error\"}"))
}

fn job_id_event(job_id: Uuid) -> Event {
    json_event(&SseEvent::JobId { job_id })
}

fn log_event(data: &str) -> Event {
    json_event(&SseEvent::Log { data })
}

fn complete_event(success: bool) -> Event {
    json_event(&SseEvent::Complete { success })
}

// ------------------------------------------------------------------ DTOs

#[derive(Debug, Clone, Copy, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
enum JobStatusDto {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl From<JobStatus> for JobStatusDto {
    fn from(status: JobStatus) -> Self {
        match status {
            JobStatus::Queued => JobStatusDto::Queued,
            JobStatus::Running => JobStatusDto::Running,
            JobStatus::Completed => JobStatusDto::Completed,
            JobStatus::Failed => JobStatusDto::Failed,
            JobStatus::Cancelled => JobStatusDto::Cancelled,
        }
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
struct JobSummaryResponse {
    job_id: Uuid,
    status: JobStatusDto,
    success: Option<bool>,
    start_time: Option<String>,
    end_time: Option<String>,
}

impl From<JobRecord> for JobSummaryResponse {
    fn from(job: JobRecord) -> Self {
        Self {
            job_id: job.id,
            status: job.status.into(),
            success: job.success,
            start_time: job.start_time.map(format_timestamp),
            end_time: job.end_time.map(format_timestamp),
        }
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
struct JobIdResponse {
    job_id: Uuid,
}

fn format_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

// ------------------------------------------------------------------ errors

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    fn internal<E: std::fmt::Display>(err: E) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
    }

    fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::InvalidKey => ApiError::unauthorized("invalid or revoked API key"),
            AuthError::InactiveUser => ApiError::unauthorized("user not found or inactive"),
            AuthError::Store(err) => ApiError::internal(err),
        }
    }
}

impl From<SandboxError> for ApiError {
    fn from(err: SandboxError) -> Self {
        match err {
            SandboxError::NotFound(id) => {
                ApiError::new(StatusCode::NOT_FOUND, format!("sandbox '{id}' not found"))
            }
            SandboxError::Runtime(err) => ApiError::internal(err),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        if let Some(store::StoreError::Conflict(message)) = err.downcast_ref::<store::StoreError>() {
            return ApiError::new(StatusCode::CONFLICT, message.clone());
        }
        ApiError::internal(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        error!(status = %self.status, message = %self.message, "api error");
        let body = Json(ErrorBody {
            error: self.message,
        });
        (self.status, body).into_response()
    }
}

#[derive(Debug, Serialize, ToSchema)]
struct ErrorBody {
    error: String,
}

/// Missing header is treated as "never presented credentials" (403);
/// anything present-but-wrong (bad encoding, wrong scheme, rejected by the
/// Authenticator) is a credentials problem (401).
fn require_bearer(headers: &HeaderMap) -> Result<&str, ApiError> {
    let Some(value) = headers.get(header::AUTHORIZATION) else {
        return Err(ApiError::new(StatusCode::FORBIDDEN, "missing Authorization header"));
    };
    let header_value = value
        .to_str()
        .map_err(|_| ApiError::unauthorized("invalid Authorization header encoding"))?;
    header_value
        .strip_prefix("Bearer ")
        .map(str::trim)
        .ok_or_else(|| ApiError::unauthorized("Authorization header must be a Bearer token"))
}

// --------------------------------------------------------------- OpenAPI

pub mod docs {
    use super::*;
    use utoipa::openapi::security::SecurityRequirement;

    #[derive(OpenApi)]
    #[openapi(
        info(title = "CI Service API", version = "0.1.0"),
        paths(health, submit, submit_stream, submit_async, stream_job, list_jobs, get_job),
        components(schemas(JobSummaryResponse, JobIdResponse, JobStatusDto, ErrorBody)),
        security_schemes(
            bearerAuth = (
                type = "http",
                scheme = "bearer",
                bearer_format = "API Token",
                description = "Bearer token issued out of band via the Store's ApiKey primitives"
            )
        ),
        modifiers(&SecurityAddon)
    )]
    pub struct ApiDoc;

    struct SecurityAddon;

    impl Modify for SecurityAddon {
        fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
            openapi
                .security
                .get_or_insert_with(Default::default)
                .push(SecurityRequirement::new("bearerAuth", Vec::<String>::new()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_valid_reconcile_interval() {
        assert_eq!(parse_reconcile_interval(Some("5")), (5.0, None));
    }

    #[test]
    fn parse_missing_reconcile_interval_defaults() {
        assert_eq!(parse_reconcile_interval(None), (2.0, None));
    }

    #[test]
    fn parse_non_positive_reconcile_interval_falls_back() {
        let (value, warning) = parse_reconcile_interval(Some("-1"));
        assert_eq!(value, 2.0);
        assert!(warning.unwrap().contains("must be positive"));

        let (value, warning) = parse_reconcile_interval(Some("0"));
        assert_eq!(value, 2.0);
        assert!(warning.unwrap().contains("must be positive"));
    }

    #[test]
    fn parse_invalid_reconcile_interval_falls_back() {
        let (value, warning) = parse_reconcile_interval(Some("not-a-number"));
        assert_eq!(value, 2.0);
        assert!(warning.unwrap().contains("is not a valid number"));
    }

    #[test]
    fn require_bearer_rejects_missing_header_with_403() {
        let headers = HeaderMap::new();
        let err = require_bearer(&headers).unwrap_err();
        assert_eq!(err.status, StatusCode::FORBIDDEN);
    }

    #[test]
    fn require_bearer_rejects_malformed_scheme_with_401() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Basic abc123".parse().unwrap());
        let err = require_bearer(&headers).unwrap_err();
        assert_eq!(err.status, StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn require_bearer_accepts_bearer_token() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Bearer ci_sometoken".parse().unwrap());
        assert_eq!(require_bearer(&headers).unwrap(), "ci_sometoken");
    }

    #[test]
    fn sse_event_envelope_is_internally_tagged() {
        let event = SseEvent::Log { data: "hello" };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "log");
        assert_eq!(json["data"], "hello");

        let event = SseEvent::Complete { success: true };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "complete");
        assert_eq!(json["success"], true);
    }

    mod integration {
        use super::*;
        use axum::body::{to_bytes, Body};
        use axum::http::Request;
        use std::io::{Cursor, Write};
        use tempfile::TempDir;
        use tower::Service;

        async fn setup_test_app() -> (Arc<AppState>, Router, TempDir) {
            let temp = TempDir::new().expect("tempdir");
            let db_path = temp.path().join(format!("db-{}.sqlite", Uuid::new_v4()));
            let database_url = format!("sqlite://{}?mode=rwc", db_path.display());
            let store = Database::connect(&database_url).await.expect("db connect");

            let scratch_root = temp.path().join("scratch");
            let incoming_dir = scratch_root.join("incoming");
            tokio::fs::create_dir_all(&incoming_dir).await.unwrap();

            let driver = SandboxDriver::new(SandboxDriverConfig {
                binary: "docker".to_string(),
                image: "python:3.11-slim".to_string(),
                container_name_prefix: "ci_job_".to_string(),
                stop_timeout: Duration::from_secs(10),
            });
            // Not started: these tests exercise the HTTP surface in isolation
            // from the reconciliation loop, so submitted jobs stay `queued`.
            let controller = Controller::new(
                store.clone(),
                driver,
                ControllerConfig {
                    reconcile_interval: Duration::from_secs(3600),
                    scratch_root: scratch_root.clone(),
                },
            );

            let authenticator = Arc::new(Authenticator::new(store.clone()));
            let config = AppConfig {
                listen_addr: "127.0.0.1:0".parse().unwrap(),
                database_url,
                scratch_root,
                incoming_dir,
                container_image: "python:3.11-slim".to_string(),
                container_prefix: "ci_job_".to_string(),
                reconcile_interval: Duration::from_secs(3600),
            };
            let state = Arc::new(AppState {
                store,
                controller,
                authenticator,
                config,
            });
            let router = build_router(state.clone());
            (state, router, temp)
        }

        async fn issue_token(state: &AppState, email: &str) -> String {
            let user = state
                .store
                .create_user(store::NewUser {
                    display_name: "Test User",
                    email,
                })
                .await
                .expect("create user");
            let (token, _record) = state
                .authenticator
                .issue_token(user.id, None)
                .await
                .expect("issue token");
            token
        }

        fn build_archive() -> Vec<u8> {
            let mut buffer = Vec::new();
            {
                let cursor = Cursor::new(&mut buffer);
                let mut zip = zip::ZipWriter::new(cursor);
                let options = zip::write::FileOptions::default();
                zip.start_file("requirements.txt", options).unwrap();
                zip.write_all(b"pytest\n").unwrap();
                zip.start_file("test_sample.py", options).unwrap();
                zip.write_all(b"def test_ok(): assert True\n").unwrap();
                zip.finish().unwrap();
            }
            buffer
        }

        fn multipart_body(archive: &[u8]) -> (String, Vec<u8>) {
            let boundary = "ci-test-boundary";
            let mut body = Vec::new();
            body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
            body.extend_from_slice(
                b"Content-Disposition: form-data; name=\"file\"; filename=\"job.zip\"\r\n",
            );
            body.extend_from_slice(b"Content-Type: application/zip\r\n\r\n");
            body.extend_from_slice(archive);
            body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
            (format!("multipart/form-data; boundary={boundary}"), body)
        }

        #[tokio::test]
        async fn health_check_returns_ok() {
            let (_state, mut router, _tmp) = setup_test_app().await;
            let request = Request::builder()
                .uri("/health")
                .body(Body::empty())
                .unwrap();
            let response = router.call(request).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
            let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
            assert_eq!(json["status"], "ok");
        }

        #[tokio::test]
        async fn list_jobs_without_header_is_forbidden() {
            let (_state, mut router, _tmp) = setup_test_app().await;
            let request = Request::builder()
                .uri("/jobs")
                .body(Body::empty())
                .unwrap();
            let response = router.call(request).await.unwrap();
            assert_eq!(response.status(), StatusCode::FORBIDDEN);
        }

        #[tokio::test]
        async fn list_jobs_with_unknown_token_is_unauthorized() {
            let (_state, mut router, _tmp) = setup_test_app().await;
            let request = Request::builder()
                .uri("/jobs")
                .header("authorization", "Bearer ci_not_a_real_token")
                .body(Body::empty())
                .unwrap();
            let response = router.call(request).await.unwrap();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        }

        #[tokio::test]
        async fn submit_async_creates_queued_job_visible_to_its_owner() {
            let (state, mut router, _tmp) = setup_test_app().await;
            let token = issue_token(&state, "alice@example.com").await;
            let (content_type, body) = multipart_body(&build_archive());

            let request = Request::builder()
                .method("POST")
                .uri("/submit-async")
                .header("authorization", format!("Bearer {token}"))
                .header("content-type", content_type)
                .body(Body::from(body))
                .unwrap();
            let response = router.call(request).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
            let submitted: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
            let job_id = submitted["job_id"].as_str().unwrap().to_string();

            let get_request = Request::builder()
                .uri(format!("/jobs/{job_id}"))
                .header("authorization", format!("Bearer {token}"))
                .body(Body::empty())
                .unwrap();
            let get_response = router.call(get_request).await.unwrap();
            assert_eq!(get_response.status(), StatusCode::OK);
            let bytes = to_bytes(get_response.into_body(), usize::MAX).await.unwrap();
            let job: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
            assert_eq!(job["job_id"], job_id);
            assert_eq!(job["status"], "queued");
            assert!(job["success"].is_null());
        }

        #[tokio::test]
        async fn get_job_owned_by_another_user_is_forbidden() {
            let (state, mut router, _tmp) = setup_test_app().await;
            let owner_token = issue_token(&state, "owner@example.com").await;
            let other_token = issue_token(&state, "other@example.com").await;
            let (content_type, body) = multipart_body(&build_archive());

            let submit = Request::builder()
                .method("POST")
                .uri("/submit-async")
                .header("authorization", format!("Bearer {owner_token}"))
                .header("content-type", content_type)
                .body(Body::from(body))
                .unwrap();
            let submit_response = router.call(submit).await.unwrap();
            let bytes = to_bytes(submit_response.into_body(), usize::MAX).await.unwrap();
            let submitted: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
            let job_id = submitted["job_id"].as_str().unwrap();

            let request = Request::builder()
                .uri(format!("/jobs/{job_id}"))
                .header("authorization", format!("Bearer {other_token}"))
                .body(Body::empty())
                .unwrap();
            let response = router.call(request).await.unwrap();
            assert_eq!(response.status(), StatusCode::FORBIDDEN);
        }

        #[tokio::test]
        async fn get_job_not_found_is_404() {
            let (state, mut router, _tmp) = setup_test_app().await;
            let token = issue_token(&state, "alice@example.com").await;
            let request = Request::builder()
                .uri(format!("/jobs/{}", Uuid::new_v4()))
                .header("authorization", format!("Bearer {token}"))
                .body(Body::empty())
                .unwrap();
            let response = router.call(request).await.unwrap();
            assert_eq!(response.status(), StatusCode::NOT_FOUND);
        }

        #[tokio::test(start_paused = true)]
        async fn stream_for_queued_job_times_out_into_an_unsuccessful_complete() {
            let (state, mut router, _tmp) = setup_test_app().await;
            let token = issue_token(&state, "alice@example.com").await;
            let (content_type, body) = multipart_body(&build_archive());

            let submit = Request::builder()
                .method("POST")
                .uri("/submit-async")
                .header("authorization", format!("Bearer {token}"))
                .header("content-type", content_type)
                .body(Body::from(body))
                .unwrap();
            let submit_response = router.call(submit).await.unwrap();
            let bytes = to_bytes(submit_response.into_body(), usize::MAX).await.unwrap();
            let submitted: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
            let job_id = Uuid::parse_str(submitted["job_id"].as_str().unwrap()).unwrap();

            // Exercises the wait-for-start phase directly rather than through
            // a real connection: the job never leaves `queued` because no
            // Controller is running. Virtual time is advanced past both the
            // wait-for-start and finalization graces so the test doesn't
            // block on real wall-clock sleeps.
            let handle = tokio::spawn(async move {
                let stream = job_event_stream(state, job_id, false, false);
                tokio::pin!(stream);
                let mut saw_complete = false;
                while let Some(event) = stream.next().await {
                    let event = event.unwrap();
                    if format!("{event:?}").contains("complete") {
                        saw_complete = true;
                    }
                }
                saw_complete
            });

            tokio::time::advance(WAIT_FOR_START_GRACE + SSE_POLL_INTERVAL * 2).await;
            tokio::time::advance(FINALIZATION_GRACE + SSE_POLL_INTERVAL * 2).await;

            let saw_complete = handle.await.unwrap();
            assert!(saw_complete, "stream should eventually emit a complete event");
        }
    }
}
