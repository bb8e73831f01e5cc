//! Local control HTTP endpoint for the GUI/CLI layers.
//!
//! Thin boundary over [`ServiceManager`]: it validates identifiers,
//! maps `ControlError` to transport status codes and serializes
//! snapshots. No supervision logic lives here.

use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tower_http::trace::TraceLayer;

use crate::supervisor::managed_process::{ProcessError, StopSignal};
use crate::supervisor::{ControlError, ServiceManager};

#[derive(Clone)]
pub struct IpcServer {
    pub manager: Arc<ServiceManager>,
    pub listen_addr: String,
}

impl IpcServer {
    pub fn new(manager: Arc<ServiceManager>, listen_addr: &str) -> Self {
        Self {
            manager,
            listen_addr: listen_addr.to_string(),
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/api/services", get(list_services))
            .route("/api/service/:id", get(get_service))
            .route("/api/service/:id/console", get(get_service_console))
            .route("/api/service/:id/start", post(start_service))
            .route("/api/service/:id/stop", post(stop_service))
            .route("/api/service/:id/input", post(send_service_input))
            .route("/api/service/:id/logs", delete(clear_service_logs))
            .layer(TraceLayer::new_for_http())
            .with_state(self.clone())
    }

    pub async fn start(self) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(&self.listen_addr).await?;
        tracing::info!("Control endpoint listening on http://{}", self.listen_addr);
        axum::serve(listener, self.router()).await?;
        Ok(())
    }
}

/// Map a control error to a transport response.
fn error_response(err: ControlError) -> Response {
    let status = match &err {
        ControlError::UnknownService(_) => StatusCode::NOT_FOUND,
        ControlError::UnsupportedOperation(_) => StatusCode::BAD_REQUEST,
        ControlError::Process(ProcessError::InputUnavailable { .. })
        | ControlError::Process(ProcessError::Busy { .. }) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({ "error": err.to_string() }))).into_response()
}

/// GET /api/services - snapshot of every registered service
async fn list_services(State(state): State<IpcServer>) -> impl IntoResponse {
    Json(json!({ "services": state.manager.get_status().await }))
}

/// GET /api/service/:id
async fn get_service(Path(id): Path<String>, State(state): State<IpcServer>) -> Response {
    match state.manager.service_snapshot(&id).await {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Deserialize)]
struct ConsoleQuery {
    since: Option<u64>,
}

/// GET /api/service/:id/console?since=N - incremental log polling.
/// Without `since` the whole buffer is returned.
async fn get_service_console(
    Path(id): Path<String>,
    Query(query): Query<ConsoleQuery>,
    State(state): State<IpcServer>,
) -> Response {
    match state.manager.service_logs_since(&id, query.since).await {
        Ok(lines) => Json(json!({ "lines": lines })).into_response(),
        Err(e) => error_response(e),
    }
}

/// POST /api/service/:id/start
async fn start_service(Path(id): Path<String>, State(state): State<IpcServer>) -> Response {
    match state.manager.start_service(&id).await {
        Ok(()) => Json(json!({ "success": true, "service": id })).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Deserialize)]
struct StopRequest {
    signal: Option<StopSignal>,
}

/// POST /api/service/:id/stop - optional body selects the signal
async fn stop_service(
    Path(id): Path<String>,
    State(state): State<IpcServer>,
    payload: Option<Json<StopRequest>>,
) -> Response {
    let signal = payload
        .and_then(|Json(req)| req.signal)
        .unwrap_or(StopSignal::Terminate);
    match state.manager.stop_service(&id, signal).await {
        Ok(()) => Json(json!({ "success": true, "service": id })).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Deserialize)]
struct InputRequest {
    line: String,
}

/// POST /api/service/:id/input - one line to the tool's stdin
async fn send_service_input(
    Path(id): Path<String>,
    State(state): State<IpcServer>,
    Json(req): Json<InputRequest>,
) -> Response {
    match state.manager.send_service_input(&id, &req.line).await {
        Ok(()) => Json(json!({ "success": true })).into_response(),
        Err(e) => error_response(e),
    }
}

/// DELETE /api/service/:id/logs
async fn clear_service_logs(Path(id): Path<String>, State(state): State<IpcServer>) -> Response {
    match state.manager.clear_service_logs(&id).await {
        Ok(()) => Json(json!({ "success": true })).into_response(),
        Err(e) => error_response(e),
    }
}
