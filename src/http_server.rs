//! HTTP front end using Axum.

use crate::error::ExecError;
use crate::orchestrator::{ExecutionRequest, ExecutionResult};
use crate::process::ExitStatus;
use crate::services::InvocationReport;
use crate::state::AppState;
use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::net::SocketAddr;
use tower_http::trace::TraceLayer;
use tracing::info;

#[derive(Deserialize)]
struct ExecuteRequest {
    owner: String,
    name: String,
    executing_account: String,
    #[serde(default)]
    credential: Option<String>,
    /// Base64.
    #[serde(default)]
    stdin: String,
    #[serde(default)]
    context: Value,
}

#[derive(Serialize)]
struct ExecuteResponse {
    /// Base64.
    stdout: String,
    stderr: String,
    status: ExitStatus,
    time_limit_exceeded: bool,
    real_time_ms: u64,
    user_time_ms: u64,
    system_time_ms: u64,
    cost: i64,
    billed_account: String,
    #[serde(flatten)]
    report: InvocationReport,
}

impl From<ExecutionResult> for ExecuteResponse {
    fn from(result: ExecutionResult) -> Self {
        Self {
            stdout: STANDARD.encode(&result.stdout),
            stderr: STANDARD.encode(&result.stderr),
            status: result.status,
            time_limit_exceeded: result.time_limit_exceeded,
            real_time_ms: result.real_time.as_millis() as u64,
            user_time_ms: result.rusage.user.as_millis() as u64,
            system_time_ms: result.rusage.system.as_millis() as u64,
            cost: result.cost,
            billed_account: result.billed_account,
            report: result.report,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/execute", post(execute))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until ctrl-c, then unmount volumes.
pub async fn run_server(port: u16, state: AppState) -> std::io::Result<()> {
    let orchestrator = state.orchestrator.clone();
    let app = router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await?;
    orchestrator.shutdown().await;
    Ok(())
}

async fn health() -> &'static str {
    "OK"
}

fn status_of(err: &ExecError) -> StatusCode {
    match err {
        ExecError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
        ExecError::NotFound(_) => StatusCode::NOT_FOUND,
        ExecError::PermissionDenied(_) => StatusCode::FORBIDDEN,
        ExecError::FailedPrecondition(_) => StatusCode::PRECONDITION_FAILED,
        ExecError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        ExecError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

async fn execute(
    State(state): State<AppState>,
    Json(req): Json<ExecuteRequest>,
) -> Result<Json<ExecuteResponse>, (StatusCode, String)> {
    info!(owner = %req.owner, name = %req.name, "POST /execute");
    let input = STANDARD
        .decode(&req.stdin)
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("stdin is not base64: {e}")))?;

    let request = ExecutionRequest {
        owner: req.owner,
        name: req.name,
        executing_account: req.executing_account,
        credential: req.credential,
        input,
        context: req.context,
    };
    let result = state
        .orchestrator
        .execute(request)
        .await
        .map_err(|e| (status_of(&e), e.to_string()))?;

    Ok(Json(result.into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_errors_stay_opaque() {
        let err = ExecError::Internal("mkfs.ext4 failed on /dev/loop3".into());
        assert_eq!(status_of(&err), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.to_string(), "internal error");
    }

    #[test]
    fn error_classes_map_to_statuses() {
        let cases = [
            (ExecError::InvalidArgument(String::new()), 400),
            (ExecError::NotFound(String::new()), 404),
            (ExecError::PermissionDenied(String::new()), 403),
            (ExecError::FailedPrecondition(String::new()), 412),
            (ExecError::Unavailable(String::new()), 503),
        ];
        for (err, code) in cases {
            assert_eq!(status_of(&err).as_u16(), code, "{err}");
        }
    }
}
