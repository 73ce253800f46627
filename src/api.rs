//! API surface (C12): axum routes over the admission (C3) and store (C2)
//! contracts. Grounded in the pack's `rootsignal-web`/`rootsignal-api`
//! pairing of `axum` with `tower-http`'s `TraceLayer`/`CorsLayer` (the
//! only pack repos with a web ingress), with a typed `ApiError` mapping
//! to the status codes in spec §6.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Path as AxPath, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crawlhub_core::{AppConfig, BlockingEvidence, ExtractionMode, Job, JobState, LastError, SiteStatus};
use crawlhub_store::{NewJob, Store};

use crate::admission;
use crate::worker;

#[derive(Clone)]
pub struct ApiState {
    pub store: Store,
    pub config: Arc<AppConfig>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/v1/jobs", post(create_job))
        .route("/v1/jobs/:id", get(get_job))
        .route("/v1/jobs/:id/download/pages.jsonl", get(download_pages))
        .route("/v1/jobs/:id/download/summary.json", get(download_summary))
        .route("/v1/jobs/:id/pages", get(live_pages))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

enum ApiError {
    BadRequest(String),
    Unauthorized,
    NotFound,
    Expired,
    RateLimited { current_jobs: i64 },
    Internal(String),
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(message) => {
                (StatusCode::BAD_REQUEST, Json(ErrorBody { error: "bad_request".to_string(), message })).into_response()
            }
            ApiError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                Json(ErrorBody { error: "unauthorized".to_string(), message: "missing or invalid token".to_string() }),
            )
                .into_response(),
            ApiError::NotFound => (
                StatusCode::NOT_FOUND,
                Json(ErrorBody { error: "not_found".to_string(), message: "unknown job".to_string() }),
            )
                .into_response(),
            ApiError::Expired => (
                StatusCode::GONE,
                Json(ErrorBody { error: "expired".to_string(), message: "job has expired".to_string() }),
            )
                .into_response(),
            ApiError::RateLimited { current_jobs } => (
                StatusCode::TOO_MANY_REQUESTS,
                Json(serde_json::json!({"error": "Rate limit exceeded", "current_jobs": current_jobs})),
            )
                .into_response(),
            ApiError::Internal(message) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorBody { error: "internal".to_string(), message }),
            )
                .into_response(),
        }
    }
}

#[derive(Deserialize)]
struct CreateJobRequest {
    start_url: String,
    max_pages: Option<u32>,
    timeout_seconds: Option<u64>,
    #[serde(default)]
    ignore_path_prefixes: Vec<String>,
    #[serde(default)]
    use_js: bool,
}

#[derive(Serialize)]
struct CreateJobResponse {
    job_id: String,
    token: String,
    status_url: String,
    state: JobState,
    max_pages: u32,
    timeout_seconds: u64,
    use_js: bool,
}

async fn create_job(
    State(state): State<ApiState>,
    headers: HeaderMap,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(req): Json<CreateJobRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let url = admission::validate_seed_url(&req.start_url).map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let allowed_host = url
        .host_str()
        .ok_or_else(|| ApiError::BadRequest("seed url has no host".to_string()))?
        .to_string();

    let forwarded = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok());
    let ip = admission::client_ip(forwarded, &addr.ip().to_string());
    let ip_hash = admission::hash_ip(&ip);

    let limit = state.config.admission.concurrent_jobs_per_ip as i64;
    let admitted = state
        .store
        .incr_ip_if_below(&ip_hash, limit)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    let Some(_new_count) = admitted else {
        let current = state.store.concurrent_count(&ip_hash).await.unwrap_or(limit);
        return Err(ApiError::RateLimited { current_jobs: current });
    };

    let token = admission::generate_token();
    let token_hash = admission::hash_token(&token);
    let job_id = admission::generate_job_id();
    let max_pages = state.config.clamp_max_pages(req.max_pages);
    let timeout_seconds = state.config.clamp_timeout_seconds(req.timeout_seconds);

    let created = state
        .store
        .create_job(NewJob {
            id: job_id,
            token_hash,
            ip_hash: ip_hash.clone(),
            start_url: url.to_string(),
            allowed_host,
            max_pages,
            timeout_seconds,
            ignore_path_prefixes: req.ignore_path_prefixes,
            use_js: req.use_js,
            expiry_hours: state.config.general.job_expiry_hours,
        })
        .await;

    let job = match created {
        Ok(job) => job,
        Err(e) => {
            let _ = state.store.decr_ip(&ip_hash).await;
            return Err(ApiError::Internal(e.to_string()));
        }
    };

    Ok((
        StatusCode::CREATED,
        Json(CreateJobResponse {
            job_id: job.id.clone(),
            token,
            status_url: format!("/v1/jobs/{}", job.id),
            state: job.state,
            max_pages: job.max_pages,
            timeout_seconds: job.timeout_seconds,
            use_js: job.use_js,
        }),
    ))
}

#[derive(Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

async fn authorize(state: &ApiState, id: &str, q: &TokenQuery) -> Result<Job, ApiError> {
    let token = q.token.as_deref().ok_or(ApiError::Unauthorized)?;
    let token_hash = admission::hash_token(token);
    state
        .store
        .get_job_by_token(id, &token_hash)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .ok_or(ApiError::NotFound)
}

#[derive(Serialize)]
struct JobStatusResponse {
    job_id: String,
    state: JobState,
    pages_fetched: u64,
    pages_exported: u64,
    errors_count: u64,
    restart_count: u32,
    fallback_retry_count: u32,
    created_at: chrono::DateTime<chrono::Utc>,
    started_at: Option<chrono::DateTime<chrono::Utc>>,
    finished_at: Option<chrono::DateTime<chrono::Utc>>,
    expires_at: chrono::DateTime<chrono::Utc>,
    site_status: Option<SiteStatus>,
    last_error: Option<LastError>,
    block_evidence: Option<BlockingEvidence>,
    download_url: Option<String>,
}

async fn get_job(
    State(state): State<ApiState>,
    AxPath(id): AxPath<String>,
    Query(q): Query<TokenQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let job = authorize(&state, &id, &q).await?;
    if job.state == JobState::Expired {
        return Err(ApiError::Expired);
    }

    let download_url = if job.state == JobState::Done {
        Some(format!(
            "/v1/jobs/{}/download/pages.jsonl?token={}",
            job.id,
            q.token.clone().unwrap_or_default()
        ))
    } else {
        None
    };

    Ok(Json(JobStatusResponse {
        job_id: job.id,
        state: job.state,
        pages_fetched: job.pages_fetched,
        pages_exported: job.pages_exported,
        errors_count: job.errors_count,
        restart_count: job.restart_count,
        fallback_retry_count: job.fallback_retry_count,
        created_at: job.created_at,
        started_at: job.started_at,
        finished_at: job.finished_at,
        expires_at: job.expires_at,
        site_status: job.site_status,
        last_error: job.last_error,
        block_evidence: job.block_evidence,
        download_url,
    }))
}

async fn download_pages(
    State(state): State<ApiState>,
    AxPath(id): AxPath<String>,
    Query(q): Query<TokenQuery>,
) -> Result<Response, ApiError> {
    download_file(&state, &id, &q, "pages.jsonl", "application/x-ndjson").await
}

async fn download_summary(
    State(state): State<ApiState>,
    AxPath(id): AxPath<String>,
    Query(q): Query<TokenQuery>,
) -> Result<Response, ApiError> {
    download_file(&state, &id, &q, "summary.json", "application/json").await
}

async fn download_file(
    state: &ApiState,
    id: &str,
    q: &TokenQuery,
    filename: &str,
    content_type: &'static str,
) -> Result<Response, ApiError> {
    let job = authorize(state, id, q).await?;
    if job.state == JobState::Expired {
        return Err(ApiError::Expired);
    }
    if job.state != JobState::Done {
        return Err(ApiError::BadRequest(format!("job is not DONE (state={:?})", job.state)));
    }

    let path = worker::job_dir(Path::new(&state.config.general.data_dir), &job.id).join(filename);
    let bytes = tokio::fs::read(&path).await.map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(([("content-type", content_type)], bytes).into_response())
}

#[derive(Serialize)]
struct LivePageView {
    url: String,
    title: Option<String>,
    status_code: u16,
    depth: u32,
    extraction_mode: ExtractionMode,
    text_length: usize,
    outlinks_count: u32,
}

async fn live_pages(
    State(state): State<ApiState>,
    AxPath(id): AxPath<String>,
    Query(q): Query<TokenQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let job = authorize(&state, &id, &q).await?;
    if job.state == JobState::Expired {
        return Err(ApiError::Expired);
    }

    let dir = worker::job_dir(Path::new(&state.config.general.data_dir), &job.id);
    let raw = dir.join("pages.raw.jsonl");
    let candidate = if tokio::fs::metadata(&raw).await.is_ok() { raw } else { dir.join("pages.jsonl") };
    let content = tokio::fs::read_to_string(&candidate).await.unwrap_or_default();

    let pages: Vec<LivePageView> = content
        .lines()
        .filter_map(|line| {
            let record: crawlhub_core::RawPageRecord = serde_json::from_str(line).ok()?;
            Some(LivePageView {
                url: record.url,
                title: record.title,
                status_code: record.status_code,
                depth: record.depth,
                extraction_mode: record.extraction_mode,
                text_length: record.text.len(),
                outlinks_count: record.outlinks_count,
            })
        })
        .collect();

    Ok(Json(pages))
}

async fn health(State(state): State<ApiState>) -> impl IntoResponse {
    match state.store.check_connectivity().await {
        Ok(()) => Json(serde_json::json!({"status": "ok", "database": "connected"})),
        Err(e) => Json(serde_json::json!({"status": "degraded", "database": e.to_string()})),
    }
}
