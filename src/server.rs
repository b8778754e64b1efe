//! HTTP API.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `POST` | `/train` | Multipart upload: `files` (or `files[]`) + `developmentId` |
//! | `GET`  | `/train/jobs` | Training job history (`tenantId`, `developmentId`, `limit`) |
//! | `POST` | `/classify` | Classify a drawing by file name, title and text |
//! | `POST` | `/resolve` | Resolve a document for a unit by hint |
//! | `POST` | `/resolve/topic` | Resolve a drawing for a chat question topic |
//! | `POST` | `/chat/document-link` | Detect a link request in a chat message and resolve it |
//! | `POST` | `/floor-plans` | Floor plans for a unit |
//! | `GET`  | `/blobs/{*path}` | Serve a local blob behind a valid signature |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "developmentId is required" } }
//! ```
//!
//! Error codes: `bad_request` (400), `forbidden` (403), `not_found` (404),
//! `rate_limited` (429), `internal` (500). Rejected uploads also carry a
//! top-level `validationErrors` array.
//!
//! # Rate Limits
//!
//! Every route goes through the `ip` limiter (client address from
//! `X-Forwarded-For`, else `"unknown"`). Routes then apply their own
//! limiter. Responses of rate-limited routes carry `X-RateLimit-Remaining`
//! and `X-RateLimit-Reset` (epoch milliseconds), on success too.

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, Query, Request, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::blob::{content_type_for, create_blob_store, BlobBackend};
use crate::classify::DrawingClassifier;
use crate::config::Config;
use crate::db;
use crate::error::{TrainError, ValidationError};
use crate::floor_plan::FloorPlanFallbackResolver;
use crate::migrate;
use crate::models::{TrainingJob, UploadFile};
use crate::rate_limit::{
    check_compound, rate_limit_key, RateLimitDecision, RateLimitStore, RateLimiter, RateLimiters,
    SqliteRateLimitStore,
};
use crate::resolve::{detect_document_link_request, DocumentResolver, LinkRequest, LinkResolution};
use crate::store::{SqliteStore, Store};
use crate::train::{IngestOptions, TrainingOrchestrator};

const RATE_LIMIT_REMAINING: &str = "x-ratelimit-remaining";
const RATE_LIMIT_RESET: &str = "x-ratelimit-reset";
const DEFAULT_JOB_LIMIT: i64 = 50;

/// Collaborators shared by every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn Store>,
    pub blobs: BlobBackend,
    pub limiters: RateLimiters,
    pub classifier: DrawingClassifier,
    pub trainer: Arc<TrainingOrchestrator>,
    pub resolver: Arc<DocumentResolver>,
    pub floor_plans: Arc<FloorPlanFallbackResolver>,
}

impl AppState {
    /// Wires the service from explicit collaborators.
    pub fn new(
        config: Config,
        store: Arc<dyn Store>,
        blobs: BlobBackend,
        rate_limit_store: Arc<dyn RateLimitStore>,
        classifier: DrawingClassifier,
    ) -> Self {
        let limiters = RateLimiters::from_config(&config.rate_limits, rate_limit_store);
        let ttl = Duration::from_secs(config.blob.signed_url_ttl_secs);

        let trainer = TrainingOrchestrator::new(
            store.clone(),
            blobs.store(),
            classifier.clone(),
            limiters.train.clone(),
            &config.upload,
            config.chunking.max_tokens,
        );
        let resolver = DocumentResolver::new(store.clone(), blobs.store(), ttl);
        let floor_plans = FloorPlanFallbackResolver::new(store.clone(), blobs.store(), ttl);

        Self {
            config: Arc::new(config),
            store,
            blobs,
            limiters,
            classifier,
            trainer: Arc::new(trainer),
            resolver: Arc::new(resolver),
            floor_plans: Arc::new(floor_plans),
        }
    }

    /// Production wiring: SQLite store and rate limits, configured blob
    /// backend and oracle. Applies the schema first.
    pub async fn from_config(config: &Config) -> anyhow::Result<Self> {
        let pool = db::connect(config).await?;
        migrate::apply_schema(&pool).await?;

        let store: Arc<dyn Store> = Arc::new(SqliteStore::new(pool.clone()));
        let rate_limit_store: Arc<dyn RateLimitStore> = Arc::new(SqliteRateLimitStore::new(pool));
        let blobs = create_blob_store(&config.blob)?;
        let classifier = DrawingClassifier::from_config(&config.oracle)?;

        tracing::info!(
            blob_backend = blobs.store().name(),
            oracle = config.oracle.provider.as_str(),
            "service wired"
        );
        Ok(Self::new(
            config.clone(),
            store,
            blobs,
            rate_limit_store,
            classifier,
        ))
    }
}

/// Builds the router with all routes and layers.
pub fn build_router(state: AppState) -> Router {
    let upload = &state.config.upload;
    let body_limit = usize::try_from(upload.max_file_bytes)
        .unwrap_or(usize::MAX)
        .saturating_mul(upload.max_files + 1);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route(
            "/train",
            post(handle_train).layer(DefaultBodyLimit::max(body_limit)),
        )
        .route("/train/jobs", get(handle_jobs))
        .route("/classify", post(handle_classify))
        .route("/resolve", post(handle_resolve))
        .route("/resolve/topic", post(handle_resolve_topic))
        .route("/chat/document-link", post(handle_document_link))
        .route("/floor-plans", post(handle_floor_plans))
        .route("/blobs/{*path}", get(handle_blob))
        .layer(middleware::from_fn_with_state(state.clone(), ip_rate_limit))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Starts the HTTP server on `[server].bind`. Runs until the process is
/// terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let state = AppState::from_config(config).await?;
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    tracing::info!(bind = %config.server.bind, "unitdocs server listening");
    println!("unitdocs server listening on http://{}", config.server.bind);

    axum::serve(listener, app).await?;
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
    #[serde(rename = "validationErrors", skip_serializing_if = "Option::is_none")]
    validation_errors: Option<Vec<String>>,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

/// Error type that converts into the JSON error response.
#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
    validation_errors: Option<Vec<String>>,
    rate_limit: Option<RateLimitDecision>,
}

impl AppError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            validation_errors: None,
            rate_limit: None,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
            validation_errors: self.validation_errors,
        };
        let mut response = (self.status, Json(body)).into_response();
        if let Some(decision) = &self.rate_limit {
            set_rate_limit_headers(response.headers_mut(), decision);
        }
        response
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::BAD_REQUEST, "bad_request", message)
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::NOT_FOUND, "not_found", message)
}

fn forbidden(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::FORBIDDEN, "forbidden", message)
}

fn internal(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
}

fn rate_limited(message: impl Into<String>, decision: RateLimitDecision) -> AppError {
    let mut e = AppError::new(StatusCode::TOO_MANY_REQUESTS, "rate_limited", message);
    e.rate_limit = Some(decision);
    e
}

impl From<TrainError> for AppError {
    fn from(err: TrainError) -> Self {
        let message = err.to_string();
        match err {
            TrainError::MissingDevelopment
            | TrainError::NoTenant(_)
            | TrainError::UnitNotInDevelopment(_) => bad_request(message),
            TrainError::DevelopmentNotFound(_) => not_found(message),
            TrainError::RateLimited { decision, .. } => rate_limited(message, decision),
            TrainError::Validation(ValidationError::NoValidFiles { errors }) => {
                let mut e = bad_request(message);
                e.validation_errors = Some(errors);
                e
            }
            TrainError::Validation(_) => bad_request(message),
            TrainError::Store(e) => {
                tracing::error!(error = %e, "training request failed");
                internal("Internal server error")
            }
        }
    }
}

// ============ Rate limit plumbing ============

fn set_rate_limit_headers(headers: &mut HeaderMap, decision: &RateLimitDecision) {
    headers.insert(RATE_LIMIT_REMAINING, HeaderValue::from(decision.remaining));
    headers.insert(RATE_LIMIT_RESET, HeaderValue::from(decision.reset_at_millis()));
}

/// First `X-Forwarded-For` entry, else `"unknown"`.
fn client_ip(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or("unknown")
        .to_string()
}

fn require_allowed(decision: RateLimitDecision) -> Result<RateLimitDecision, AppError> {
    if decision.allowed {
        Ok(decision)
    } else {
        Err(rate_limited(
            "Rate limit exceeded. Please try again later.",
            decision,
        ))
    }
}

async fn enforce(limiter: &RateLimiter, key: &str) -> Result<RateLimitDecision, AppError> {
    require_allowed(limiter.check(key).await)
}

/// JSON response carrying the route's rate-limit headers.
fn limited_json<T: Serialize>(status: StatusCode, decision: &RateLimitDecision, body: T) -> Response {
    let mut response = (status, Json(body)).into_response();
    set_rate_limit_headers(response.headers_mut(), decision);
    response
}

/// Applies the `ip` limiter to every request. Route-level headers, when
/// present, take precedence over the ip limiter's.
async fn ip_rate_limit(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let ip = client_ip(request.headers());
    let decision = state.limiters.ip.check(&rate_limit_key(&ip, "ip")).await;
    if !decision.allowed {
        tracing::warn!(ip = %ip, "ip rate limit exceeded");
        return rate_limited("Too many requests from this address.", decision).into_response();
    }

    let mut response = next.run(request).await;
    if !response.headers().contains_key(RATE_LIMIT_REMAINING) {
        set_rate_limit_headers(response.headers_mut(), &decision);
    }
    response
}

fn require_field<'a>(value: &'a str, name: &str) -> Result<&'a str, AppError> {
    let value = value.trim();
    if value.is_empty() {
        Err(bad_request(format!("{} is required", name)))
    } else {
        Ok(value)
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /train ============

async fn text_field(
    field: axum::extract::multipart::Field<'_>,
    name: &str,
) -> Result<String, AppError> {
    field
        .text()
        .await
        .map_err(|e| bad_request(format!("Invalid {}: {}", name, e)))
}

/// Multipart fields: `files` / `files[]` (repeatable) and `developmentId`.
/// Optional: `unitId` pins every file to a unit of the development,
/// `docKind` sets the document kind, `tags` / `tags[]` (repeatable or
/// comma-separated) add tags.
async fn handle_train(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Response, AppError> {
    let ip = client_ip(&headers);
    enforce(&state.limiters.upload, &rate_limit_key(&ip, "upload")).await?;

    let mut development_id = String::new();
    let mut options = IngestOptions::default();
    let mut files = Vec::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| bad_request(format!("Invalid multipart body: {}", e)))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "files" | "files[]" => {
                let file_name = field.file_name().unwrap_or("unnamed").to_string();
                let content_type = field
                    .content_type()
                    .map(str::to_string)
                    .unwrap_or_else(|| content_type_for(&file_name).to_string());
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| bad_request(format!("Failed to read {}: {}", file_name, e)))?;
                files.push(UploadFile::new(file_name, content_type, bytes.to_vec()));
            }
            "developmentId" => development_id = text_field(field, "developmentId").await?,
            "unitId" => options.unit_id = Some(text_field(field, "unitId").await?),
            "docKind" => options.doc_kind = Some(text_field(field, "docKind").await?),
            "tags" | "tags[]" => {
                let value = text_field(field, "tags").await?;
                options.tags.extend(value.split(',').map(str::to_string));
            }
            other => {
                tracing::debug!(field = other, "ignoring multipart field");
            }
        }
    }

    let outcome = state
        .trainer
        .handle_upload_with(&development_id, files, options)
        .await?;
    let status = if outcome.success() {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    Ok(limited_json(status, &outcome.rate_limit, outcome.to_response()))
}

// ============ GET /train/jobs ============

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobsQuery {
    #[serde(default)]
    tenant_id: String,
    #[serde(default)]
    development_id: String,
    limit: Option<i64>,
}

#[derive(Serialize)]
struct JobsResponse {
    jobs: Vec<TrainingJob>,
}

async fn handle_jobs(
    State(state): State<AppState>,
    Query(query): Query<JobsQuery>,
) -> Result<Response, AppError> {
    let tenant_id = require_field(&query.tenant_id, "tenantId")?;
    let development_id = require_field(&query.development_id, "developmentId")?;
    let decision = enforce(&state.limiters.admin, &rate_limit_key(tenant_id, "jobs")).await?;

    let limit = query.limit.unwrap_or(DEFAULT_JOB_LIMIT).clamp(1, 500);
    let jobs = state
        .store
        .jobs_for(tenant_id, development_id, limit)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "job history query failed");
            internal("Failed to load training jobs")
        })?;
    Ok(limited_json(StatusCode::OK, &decision, JobsResponse { jobs }))
}

// ============ POST /classify ============

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClassifyRequest {
    file_name: String,
    title: Option<String>,
    text: Option<String>,
}

async fn handle_classify(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ClassifyRequest>,
) -> Result<Response, AppError> {
    let file_name = require_field(&req.file_name, "fileName")?;
    let key = rate_limit_key(&client_ip(&headers), "classify");
    let decision = require_allowed(
        check_compound(&state.limiters.developer, &state.limiters.developer_burst, &key).await,
    )?;

    let classification = state
        .classifier
        .classify(file_name, req.title.as_deref(), req.text.as_deref())
        .await;
    Ok(limited_json(StatusCode::OK, &decision, classification))
}

// ============ POST /resolve, /resolve/topic ============

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResolveRequest {
    unit_id: String,
    hint: String,
    context: Option<String>,
}

async fn handle_resolve(
    State(state): State<AppState>,
    Json(req): Json<ResolveRequest>,
) -> Result<Response, AppError> {
    let unit_id = require_field(&req.unit_id, "unitId")?;
    let decision = enforce(&state.limiters.homeowner, &rate_limit_key(unit_id, "resolve")).await?;

    let resolution = state
        .resolver
        .resolve(unit_id, &req.hint, req.context.as_deref())
        .await;
    Ok(limited_json(StatusCode::OK, &decision, resolution))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TopicRequest {
    unit_id: String,
    topic: String,
}

async fn handle_resolve_topic(
    State(state): State<AppState>,
    Json(req): Json<TopicRequest>,
) -> Result<Response, AppError> {
    let unit_id = require_field(&req.unit_id, "unitId")?;
    let decision = enforce(&state.limiters.homeowner, &rate_limit_key(unit_id, "resolve")).await?;

    let resolution = state.resolver.resolve_topic(unit_id, &req.topic).await;
    Ok(limited_json(StatusCode::OK, &decision, resolution))
}

// ============ POST /chat/document-link ============

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DocumentLinkRequest {
    unit_id: String,
    message: String,
    context: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DocumentLinkResponse {
    #[serde(flatten)]
    request: LinkRequest,
    #[serde(skip_serializing_if = "Option::is_none")]
    resolution: Option<LinkResolution>,
}

async fn handle_document_link(
    State(state): State<AppState>,
    Json(req): Json<DocumentLinkRequest>,
) -> Result<Response, AppError> {
    let unit_id = require_field(&req.unit_id, "unitId")?;
    let decision = enforce(&state.limiters.chat, &rate_limit_key(unit_id, "chat")).await?;

    let request = detect_document_link_request(&req.message);
    let resolution = if request.is_link_request {
        let context = match req.context.as_deref() {
            Some(extra) => format!("{} {}", req.message, extra),
            None => req.message.clone(),
        };
        let hint = request.hint.as_deref().unwrap_or_default();
        Some(state.resolver.resolve(unit_id, hint, Some(&context)).await)
    } else {
        None
    };

    Ok(limited_json(
        StatusCode::OK,
        &decision,
        DocumentLinkResponse {
            request,
            resolution,
        },
    ))
}

// ============ POST /floor-plans ============

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FloorPlansRequest {
    unit_id: String,
}

async fn handle_floor_plans(
    State(state): State<AppState>,
    Json(req): Json<FloorPlansRequest>,
) -> Result<Response, AppError> {
    let unit_id = require_field(&req.unit_id, "unitId")?;
    let decision =
        enforce(&state.limiters.homeowner, &rate_limit_key(unit_id, "floor-plans")).await?;

    let resolution = state.floor_plans.find(unit_id).await;
    Ok(limited_json(StatusCode::OK, &decision, resolution))
}

// ============ GET /blobs/{*path} ============

#[derive(Deserialize)]
struct BlobQuery {
    expires: Option<i64>,
    download: Option<String>,
    sig: Option<String>,
}

/// Serves a blob of the local backend when the URL signature is valid and
/// unexpired.
async fn handle_blob(
    State(state): State<AppState>,
    Path(path): Path<String>,
    Query(query): Query<BlobQuery>,
) -> Result<Response, AppError> {
    let Some(local) = state.blobs.local() else {
        return Err(not_found("Blob serving is only available for the local backend"));
    };
    let (Some(expires), Some(sig)) = (query.expires, query.sig.as_deref()) else {
        return Err(forbidden("Missing signature"));
    };
    let download = query.download.as_deref() == Some("1");

    if !local.verify(&path, expires, download, sig, chrono::Utc::now()) {
        return Err(forbidden("Invalid or expired signature"));
    }

    let bytes = local.read(&path).await.map_err(|e| {
        tracing::debug!(path = %path, error = %e, "blob read failed");
        not_found("Blob not found")
    })?;

    let mut response = bytes.into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(content_type_for(&path)),
    );
    if download {
        let file_name = path.rsplit('/').next().unwrap_or("download").replace('"', "");
        if let Ok(value) = HeaderValue::from_str(&format!("attachment; filename=\"{}\"", file_name)) {
            headers.insert(header::CONTENT_DISPOSITION, value);
        }
    }
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_ip_takes_first_forwarded_address() {
        let mut headers = HeaderMap::new();
        assert_eq!(client_ip(&headers), "unknown");

        headers.insert("x-forwarded-for", HeaderValue::from_static(" 203.0.113.7 , 10.0.0.1"));
        assert_eq!(client_ip(&headers), "203.0.113.7");
    }

    #[test]
    fn validation_errors_surface_in_body() {
        let err: AppError = TrainError::Validation(ValidationError::NoValidFiles {
            errors: vec!["a.exe: Unsupported file type".into()],
        })
        .into();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            err.validation_errors.as_deref(),
            Some(&["a.exe: Unsupported file type".to_string()][..])
        );
    }

    #[test]
    fn rate_limited_response_has_headers() {
        let decision = RateLimitDecision {
            allowed: false,
            remaining: 0,
            reset_at: chrono::DateTime::from_timestamp_millis(1_700_000_000_123).unwrap(),
        };
        let response = rate_limited("slow down", decision).into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[RATE_LIMIT_REMAINING], "0");
        assert_eq!(response.headers()[RATE_LIMIT_RESET], "1700000000123");
    }
}
