//! Thin `axum` router translating the REST contract onto
//! [`crate::manager::SandboxManager`] / [`crate::capacity::CapacityAccountant`]
//! calls. Owns no state of its own beyond the shared `AppState`.

use std::sync::Arc;

use axum::extract::{Multipart, Path as AxumPath, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, warn};
use vsock_proto::{Request as RpcRequest, Response as RpcResponse};

use crate::capacity::CapacityAccountant;
use crate::error::ManagerError;
use crate::manager::SandboxManager;
use crate::security::{ApiKeyValidator, RateLimiter, validate_path};
use crate::types::{
    CapacityReport, CreateSandboxRequest, DestroyResponse, ExecRequest, ExecResponse,
    HealthReport, ListEntry, ListFilesQuery, ListFilesResponse, PauseResponse, ReadFileQuery,
    ReadFileResponse, UploadQuery, WriteFileRequest, WriteFileResponse,
};

pub struct AppState {
    pub manager: Arc<SandboxManager>,
    pub api_keys: ApiKeyValidator,
    pub rate_limiter: RateLimiter,
}

pub fn build_router(state: Arc<AppState>, cors_origins: &str, max_request_size_bytes: usize) -> Router {
    let cors = build_cors(cors_origins);

    Router::new()
        .route("/health", get(health))
        .route("/capacity", get(capacity))
        .route("/sandboxes", get(list_sandboxes).post(create_sandbox))
        .route("/sandboxes/{id}", get(get_sandbox).delete(destroy_sandbox))
        .route("/sandboxes/{id}/pause", post(pause_sandbox))
        .route("/sandboxes/{id}/resume", post(resume_sandbox))
        .route("/sandboxes/{id}/exec", post(exec))
        .route("/sandboxes/{id}/files/write", post(write_file))
        .route("/sandboxes/{id}/files/read", get(read_file))
        .route("/sandboxes/{id}/files/list", get(list_files))
        .route("/sandboxes/{id}/files/upload", post(upload_file))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(tower_http::limit::RequestBodyLimitLayer::new(max_request_size_bytes))
        .with_state(state)
}

fn build_cors(origins: &str) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.trim() == "*" {
        return layer.allow_origin(Any);
    }
    let parsed: Vec<_> = origins
        .split(',')
        .filter_map(|o| o.trim().parse().ok())
        .collect();
    if parsed.is_empty() {
        layer.allow_origin(Any)
    } else {
        layer.allow_origin(parsed)
    }
}

impl IntoResponse for ManagerError {
    fn into_response(self) -> Response {
        let status = match &self {
            ManagerError::ValidationError(_) => StatusCode::BAD_REQUEST,
            ManagerError::CapacityExceeded(_) => StatusCode::SERVICE_UNAVAILABLE,
            ManagerError::NotFound(_) => StatusCode::NOT_FOUND,
            ManagerError::MissingArtifact(_)
            | ManagerError::HypervisorError(_)
            | ManagerError::GuestUnreachable(_)
            | ManagerError::InvalidState(_)
            | ManagerError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %self, "sandbox operation failed");
        } else {
            warn!(error = %self, "sandbox operation rejected");
        }
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

/// Combined auth + rate-limit gate applied to every non-`/health` route.
fn gate(state: &AppState, headers: &HeaderMap) -> Result<(), Response> {
    check_auth(state, headers)?;
    check_rate_limit(state, headers)?;
    Ok(())
}

fn check_auth(state: &AppState, headers: &HeaderMap) -> Result<(), Response> {
    let header_name = state.api_keys.header_name();
    let presented = headers.get(header_name).and_then(|v| v.to_str().ok());
    if state.api_keys.check(presented) {
        Ok(())
    } else {
        Err((StatusCode::UNAUTHORIZED, Json(serde_json::json!({ "error": "invalid or missing API key" }))).into_response())
    }
}

fn check_rate_limit(state: &AppState, headers: &HeaderMap) -> Result<(), Response> {
    let client_key = headers
        .get(state.api_keys.header_name())
        .and_then(|v| v.to_str().ok())
        .or_else(|| headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()))
        .unwrap_or("unknown")
        .to_string();
    if state.rate_limiter.allow(&client_key) {
        Ok(())
    } else {
        Err((StatusCode::TOO_MANY_REQUESTS, Json(serde_json::json!({ "error": "rate limit exceeded" }))).into_response())
    }
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthReport> {
    let budget = state.manager.config().total_memory_budget_mb();
    let accountant = CapacityAccountant::new(&state.manager.config().limits, budget);
    let memory_used = state.manager.memory_used_mb().await;
    let active = state.manager.live_count().await;
    Json(accountant.report(active, memory_used))
}

async fn capacity(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Err(r) = gate(&state, &headers) {
        return r;
    }
    let budget = state.manager.config().total_memory_budget_mb();
    let config = state.manager.config();
    let accountant = CapacityAccountant::new(&config.limits, budget);
    let memory_used = state.manager.memory_used_mb().await;
    let active = state.manager.live_count().await;
    let health = accountant.report(active, memory_used);
    let can_create_default = accountant
        .can_admit(active, memory_used, config.limits.default_memory_mb)
        .is_ok();
    Json(CapacityReport {
        health,
        can_create_default,
        default_memory_mb: config.limits.default_memory_mb,
        default_vcpu_count: config.limits.default_vcpu_count,
    })
    .into_response()
}

async fn create_sandbox(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<CreateSandboxRequest>,
) -> Response {
    if let Err(r) = gate(&state, &headers) {
        return r;
    }
    match state
        .manager
        .create(req.template, req.memory_mb, req.vcpu_count, req.workspace_id)
        .await
    {
        Ok(sandbox) => Json(sandbox).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn list_sandboxes(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Err(r) = gate(&state, &headers) {
        return r;
    }
    Json(state.manager.list().await).into_response()
}

async fn get_sandbox(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(r) = gate(&state, &headers) {
        return r;
    }
    match state.manager.get(&id).await {
        Ok(sandbox) => Json(sandbox).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn destroy_sandbox(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(r) = gate(&state, &headers) {
        return r;
    }
    match state.manager.destroy(&id).await {
        Ok(()) => Json(DestroyResponse {
            status: "destroyed",
            sandbox_id: id,
        })
        .into_response(),
        Err(e) => e.into_response(),
    }
}

async fn pause_sandbox(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(r) = gate(&state, &headers) {
        return r;
    }
    match state.manager.pause(&id).await {
        Ok(()) => Json(PauseResponse {
            status: "paused",
            sandbox_id: id,
        })
        .into_response(),
        Err(e) => e.into_response(),
    }
}

async fn resume_sandbox(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(r) = gate(&state, &headers) {
        return r;
    }
    match state.manager.resume(&id).await {
        Ok(sandbox) => Json(sandbox).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn exec(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
    headers: HeaderMap,
    Json(req): Json<ExecRequest>,
) -> Response {
    if let Err(r) = gate(&state, &headers) {
        return r;
    }
    let client = match state.manager.rpc_client(&id).await {
        Ok(c) => c,
        Err(e) => return e.into_response(),
    };
    let timeout = std::time::Duration::from_secs(
        req.timeout_seconds
            .unwrap_or(state.manager.config().timeouts.command_default_timeout.as_secs()),
    );
    let mut guard = client.lock().await;
    match guard
        .exec(&req.command, timeout, req.working_dir.as_deref(), Default::default())
        .await
    {
        Ok(response) => Json(exec_response(response)).into_response(),
        Err(e) => ManagerError::GuestUnreachable(e.to_string()).into_response(),
    }
}

fn exec_response(r: RpcResponse) -> ExecResponse {
    ExecResponse {
        success: r.success,
        exit_code: r.exit_code,
        stdout: r.stdout,
        stderr: r.stderr,
        error: r.error,
    }
}

async fn write_file(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
    headers: HeaderMap,
    Json(req): Json<WriteFileRequest>,
) -> Response {
    if let Err(r) = gate(&state, &headers) {
        return r;
    }
    let allowed = &state.manager.config().security.allowed_path_prefixes;
    if let Err(e) = validate_path(&req.path, allowed) {
        return (StatusCode::BAD_REQUEST, Json(serde_json::json!({ "error": e }))).into_response();
    }
    let client = match state.manager.rpc_client(&id).await {
        Ok(c) => c,
        Err(e) => return e.into_response(),
    };
    let mut guard = client.lock().await;
    match guard
        .write_file(&req.path, &req.content, req.is_base64, None)
        .await
    {
        Ok(r) => Json(WriteFileResponse {
            success: r.success,
            path: r.path,
            size: r.size,
            error: r.error,
        })
        .into_response(),
        Err(e) => ManagerError::GuestUnreachable(e.to_string()).into_response(),
    }
}

async fn read_file(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
    headers: HeaderMap,
    Query(query): Query<ReadFileQuery>,
) -> Response {
    if let Err(r) = gate(&state, &headers) {
        return r;
    }
    let allowed = &state.manager.config().security.allowed_path_prefixes;
    if let Err(e) = validate_path(&query.path, allowed) {
        return (StatusCode::BAD_REQUEST, Json(serde_json::json!({ "error": e }))).into_response();
    }
    let client = match state.manager.rpc_client(&id).await {
        Ok(c) => c,
        Err(e) => return e.into_response(),
    };
    let mut guard = client.lock().await;
    match guard.read_file(&query.path).await {
        Ok(r) => Json(ReadFileResponse {
            success: r.success,
            content: r.content,
            error: r.error,
        })
        .into_response(),
        Err(e) => ManagerError::GuestUnreachable(e.to_string()).into_response(),
    }
}

async fn list_files(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
    headers: HeaderMap,
    Query(query): Query<ListFilesQuery>,
) -> Response {
    if let Err(r) = gate(&state, &headers) {
        return r;
    }
    let allowed = &state.manager.config().security.allowed_path_prefixes;
    if let Err(e) = validate_path(&query.path, allowed) {
        return (StatusCode::BAD_REQUEST, Json(serde_json::json!({ "error": e }))).into_response();
    }
    let client = match state.manager.rpc_client(&id).await {
        Ok(c) => c,
        Err(e) => return e.into_response(),
    };
    let mut guard = client.lock().await;
    match guard.list_files(&query.path, query.recursive).await {
        Ok(r) => Json(ListFilesResponse {
            success: r.success,
            entries: r.entries.map(|entries| {
                entries
                    .into_iter()
                    .map(|e| ListEntry {
                        name: e.name,
                        is_dir: e.is_dir,
                        size: e.size,
                    })
                    .collect()
            }),
            error: r.error,
        })
        .into_response(),
        Err(e) => ManagerError::GuestUnreachable(e.to_string()).into_response(),
    }
}

async fn upload_file(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
    headers: HeaderMap,
    Query(query): Query<UploadQuery>,
    mut multipart: Multipart,
) -> Response {
    if let Err(r) = gate(&state, &headers) {
        return r;
    }
    let allowed = &state.manager.config().security.allowed_path_prefixes;
    if let Err(e) = validate_path(&query.path, allowed) {
        return (StatusCode::BAD_REQUEST, Json(serde_json::json!({ "error": e }))).into_response();
    }

    let field = match multipart.next_field().await {
        Ok(Some(field)) => field,
        Ok(None) => {
            return (StatusCode::BAD_REQUEST, Json(serde_json::json!({ "error": "missing upload field" })))
                .into_response();
        }
        Err(e) => {
            return (StatusCode::BAD_REQUEST, Json(serde_json::json!({ "error": e.to_string() })))
                .into_response();
        }
    };
    let bytes = match field.bytes().await {
        Ok(b) => b,
        Err(e) => {
            return (StatusCode::BAD_REQUEST, Json(serde_json::json!({ "error": e.to_string() })))
                .into_response();
        }
    };
    let encoded = BASE64.encode(bytes);

    let client = match state.manager.rpc_client(&id).await {
        Ok(c) => c,
        Err(e) => return e.into_response(),
    };
    let mut guard = client.lock().await;
    match guard.write_file(&query.path, &encoded, true, None).await {
        Ok(r) => Json(WriteFileResponse {
            success: r.success,
            path: r.path,
            size: r.size,
            error: r.error,
        })
        .into_response(),
        Err(e) => ManagerError::GuestUnreachable(e.to_string()).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_variant_exists_for_every_action() {
        let _ = RpcRequest::Ping;
    }
}
