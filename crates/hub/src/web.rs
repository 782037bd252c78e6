use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::controller::ControlHandle;
use crate::error::ControllerError;
use crate::state::SharedState;

#[derive(Clone)]
pub struct AppState {
    pub control: ControlHandle,
    pub shared: SharedState,
}

#[derive(Debug, Deserialize)]
struct StartRequest {
    duration_on: f64,
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/mistbuddy/start", post(start))
        .route("/api/v1/mistbuddy/stop", get(stop).post(stop))
        .route("/api/status", get(api_status))
        .with_state(state)
}

async fn start(State(state): State<AppState>, Json(req): Json<StartRequest>) -> Response {
    match state.control.start(req.duration_on).await {
        Ok(()) => {
            info!(duration_on = req.duration_on, "start requested over http");
            Json(json!({
                "status": format!("started misting for {} seconds every minute", req.duration_on)
            }))
            .into_response()
        }
        Err(e) => error_response(e),
    }
}

async fn stop(State(state): State<AppState>) -> Response {
    match state.control.stop().await {
        Ok(()) => Json(json!({ "status": "stopped misting" })).into_response(),
        Err(e) => error_response(e),
    }
}

async fn api_status(State(state): State<AppState>) -> impl IntoResponse {
    let st = state.shared.read().await;
    Json(st.to_status())
}

/// Configuration errors are the client's fault; anything else means the
/// device could not be reached.
fn error_response(e: ControllerError) -> Response {
    let code = if e.is_config() {
        StatusCode::BAD_REQUEST
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    warn!(status = code.as_u16(), "http control request failed: {e}");
    (code, Json(json!({ "error": e.to_string() }))).into_response()
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(port: u16, state: AppState) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;

    info!(%addr, "http api listening");

    axum::serve(listener, router(state))
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================
