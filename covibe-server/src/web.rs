//! HTTP surface: intake, status, cancellation and artifact endpoints.
//!
//! Handlers never drive the pipeline themselves. Intake and cancellation
//! write through the store and nudge the scheduler.

use std::net::SocketAddr;
use std::path::Path as FsPath;
use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{ConnectInfo, DefaultBodyLimit, Path, State};
use axum::http::{header, Method, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use chrono::{DateTime, Utc};
use covibe_pipeline::{ReleasedFeature, Status, StoreError, Submission};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};

use crate::server::AppState;

/// Submissions returned by `/api/state`.
const RECENT_SUBMISSIONS: usize = 10;

// ── Errors ─────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: String,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.to_string(),
            message: message.into(),
        }
    }

    fn bad_request(code: &str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, code, message)
    }

    fn not_found(code: &str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, code, message)
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => {
                Self::not_found("SUBMISSION_NOT_FOUND", format!("no submission #{id}"))
            }
            StoreError::NotCancellable { id, status } => Self::new(
                StatusCode::CONFLICT,
                "NOT_CANCELLABLE",
                format!("submission #{id} is already {status}"),
            ),
            StoreError::Conflict(id) => Self::new(
                StatusCode::CONFLICT,
                "VERSION_CONFLICT",
                format!("submission #{id} is busy, retry"),
            ),
            other => {
                tracing::error!(error = %other, "Store error in request handler");
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL", "internal error")
            }
        }
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    message: &'a str,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: &self.code,
            message: &self.message,
        };
        (self.status, Json(body)).into_response()
    }
}

// ── Router ─────────────────────────────────────────────────────────────

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/v1/health", get(api_health))
        .route("/api/submit", post(api_submit))
        .route("/api/submissions/{id}", get(api_submission))
        .route("/api/submissions/{id}/cancel", post(api_cancel))
        .route("/api/state", get(api_state))
        .route("/features/{file}", get(feature_file))
        .layer(DefaultBodyLimit::max(16 * 1024))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
                .allow_headers([header::CONTENT_TYPE]),
        )
        .with_state(state)
}

// ── Handlers ───────────────────────────────────────────────────────────

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    pipeline_running: bool,
}

async fn api_health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        pipeline_running: state.scheduler.is_running(),
    })
}

#[derive(Deserialize)]
struct SubmitRequest {
    request: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SubmitResponse {
    submission_id: i64,
    status: Status,
}

/// Trimmed request text, or why it is unacceptable.
fn validate_request(raw: &str, max_chars: usize) -> Result<String, ApiError> {
    let text = raw.trim();
    if text.is_empty() {
        return Err(ApiError::bad_request("REQUEST_EMPTY", "request must not be empty"));
    }
    let len = text.chars().count();
    if len > max_chars {
        return Err(ApiError::bad_request(
            "REQUEST_TOO_LONG",
            format!("request is {len} characters, limit is {max_chars}"),
        ));
    }
    if text.chars().any(|c| c.is_control() && c != '\n' && c != '\t') {
        return Err(ApiError::bad_request(
            "REQUEST_CONTROL_CHARS",
            "request contains control characters",
        ));
    }
    Ok(text.to_string())
}

async fn api_submit(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    payload: Result<Json<SubmitRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    if !state.limiter.check(addr.ip()) {
        tracing::warn!(ip = %addr.ip(), "Submission rejected: rate limit");
        return Err(ApiError::new(
            StatusCode::TOO_MANY_REQUESTS,
            "RATE_LIMITED",
            "too many submissions, slow down",
        ));
    }
    let Json(body) = payload.map_err(|e| ApiError::bad_request("INVALID_BODY", e.body_text()))?;
    let request = validate_request(&body.request, state.config.max_request_chars)?;

    let submission = state.store.create_submission(&request)?;
    tracing::info!(submission_id = submission.id, ip = %addr.ip(), "Submission received");
    state.scheduler.enqueue();

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            submission_id: submission.id,
            status: submission.status,
        }),
    ))
}

async fn api_submission(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<Submission>, ApiError> {
    state
        .store
        .get_submission(id)?
        .map(Json)
        .ok_or_else(|| ApiError::not_found("SUBMISSION_NOT_FOUND", format!("no submission #{id}")))
}

async fn api_cancel(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<Submission>, ApiError> {
    let cancelled = state.store.cancel(id)?;
    tracing::info!(submission_id = id, "Submission cancelled by user");
    // Lets reconciliation drop any feature record the cancel orphaned.
    state.scheduler.enqueue();
    Ok(Json(cancelled))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StateResponse {
    released_features: Vec<ReleasedFeature>,
    recent_submissions: Vec<SubmissionSummary>,
}

/// Public projection of a submission for the state listing.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SubmissionSummary {
    id: i64,
    request: String,
    status: Status,
    created_at: DateTime<Utc>,
}

impl From<Submission> for SubmissionSummary {
    fn from(s: Submission) -> Self {
        Self {
            id: s.id,
            request: s.request,
            status: s.status,
            created_at: s.created_at,
        }
    }
}

async fn api_state(State(state): State<Arc<AppState>>) -> Result<Json<StateResponse>, ApiError> {
    let recent = state.store.recent_submissions(RECENT_SUBMISSIONS)?;
    Ok(Json(StateResponse {
        released_features: state.store.list_features()?,
        recent_submissions: recent.into_iter().map(SubmissionSummary::from).collect(),
    }))
}

/// Plain `feature-<n>.js`-style names only: no separators, no dot-files.
fn is_safe_feature_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 128
        && name.ends_with(".js")
        && !name.starts_with('.')
        && !name.contains("..")
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// Repository-relative path of a feature file, as publishers see it.
fn remote_path(site_dir: &FsPath, features_dir: &FsPath, name: &str) -> String {
    let dir = features_dir.strip_prefix(site_dir).unwrap_or(features_dir);
    dir.join(name)
        .components()
        .filter_map(|c| match c {
            std::path::Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

async fn feature_file(
    State(state): State<Arc<AppState>>,
    Path(file): Path<String>,
) -> Result<Response, ApiError> {
    if !is_safe_feature_name(&file) {
        return Err(ApiError::bad_request("INVALID_FEATURE_NAME", "invalid feature file name"));
    }

    let bytes = match tokio::fs::read(state.features_dir.join(&file)).await {
        Ok(bytes) => Some(bytes),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let path = remote_path(&state.config.site_dir, &state.features_dir, &file);
            match state.publisher.fetch(&path).await {
                Ok(remote) => remote,
                Err(e) => {
                    tracing::warn!(file = %file, error = %e, "Remote feature fetch failed");
                    None
                }
            }
        }
        Err(e) => {
            tracing::error!(file = %file, error = %e, "Failed to read feature file");
            return Err(ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL",
                "internal error",
            ));
        }
    };

    match bytes {
        Some(bytes) => Ok((
            [
                (header::CONTENT_TYPE, "application/javascript; charset=utf-8"),
                (header::CACHE_CONTROL, "no-cache"),
            ],
            bytes,
        )
            .into_response()),
        None => Err(ApiError::not_found("FEATURE_NOT_FOUND", format!("{file} not found"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_validation() {
        assert_eq!(validate_request("  add a todo list \n", 200).unwrap(), "add a todo list");
        assert_eq!(validate_request("   ", 200).unwrap_err().code, "REQUEST_EMPTY");
        assert_eq!(validate_request("abcdef", 5).unwrap_err().code, "REQUEST_TOO_LONG");
        assert_eq!(
            validate_request("add\u{7}bell", 200).unwrap_err().code,
            "REQUEST_CONTROL_CHARS"
        );
        assert!(validate_request("line one\nline two", 200).is_ok());
    }

    #[test]
    fn feature_names() {
        assert!(is_safe_feature_name("feature-12.js"));
        assert!(!is_safe_feature_name("../secrets.js"));
        assert!(!is_safe_feature_name(".hidden.js"));
        assert!(!is_safe_feature_name("feature-1.txt"));
        assert!(!is_safe_feature_name("a/b.js"));
        assert!(!is_safe_feature_name(""));
    }

    #[test]
    fn remote_paths_are_repo_relative() {
        assert_eq!(
            remote_path(
                FsPath::new("/srv/site"),
                FsPath::new("/srv/site/public/features"),
                "feature-3.js"
            ),
            "public/features/feature-3.js"
        );
        assert_eq!(
            remote_path(FsPath::new("."), FsPath::new("./public/features"), "feature-3.js"),
            "public/features/feature-3.js"
        );
    }
}
