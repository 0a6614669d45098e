//! REST API server for the sync tools
//!
//! Exposes the tool registry over HTTP:
//! - `GET  /health`
//! - `GET  /api/tools`
//! - `POST /api/tools/:name` with the tool parameters as the JSON body

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde_json::Value;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::app::App;
use crate::error::ErrorKind;
use crate::models::{ToolInput, ToolOutput};
use crate::tools::ToolInfo;

/// =============================
/// API State
/// =============================

#[derive(Clone)]
pub struct ApiState {
    pub app: Arc<App>,
}

/// =============================
/// Status Mapping
/// =============================

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::InvalidInput | ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        ErrorKind::InvalidCredential | ErrorKind::ItemError => StatusCode::UNAUTHORIZED,
        ErrorKind::TransientNetwork => StatusCode::BAD_GATEWAY,
        ErrorKind::Integrity | ErrorKind::Storage | ErrorKind::Config => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

/// =============================
/// Handlers
/// =============================

async fn health() -> Json<Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

async fn list_tools(State(state): State<ApiState>) -> Json<Vec<ToolInfo>> {
    Json(state.app.tools.list())
}

async fn run_tool(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    body: Option<Json<Value>>,
) -> (StatusCode, Json<ToolOutput>) {
    let input = ToolInput {
        tool_name: name,
        parameters: body.map(|Json(value)| value).unwrap_or(Value::Null),
    };
    info!(tool = %input.tool_name, "Received tool request");

    let output = state.app.execute(&input).await;
    let status = match &output.error {
        Some(error) => status_for(error.kind),
        None => StatusCode::OK,
    };
    (status, Json(output))
}

/// =============================
/// Router
/// =============================

pub fn create_router(app: Arc<App>) -> Router {
    let state = ApiState { app };

    Router::new()
        .route("/health", get(health))
        .route("/api/tools", get(list_tools))
        .route("/api/tools/:name", post(run_tool))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// =============================
/// Server Startup
/// =============================

pub async fn start_server(
    app: Arc<App>,
    port: u16,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let router = create_router(app);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    info!("API Server listening on http://0.0.0.0:{}", port);
    info!("Local: http://127.0.0.1:{}", port);

    axum::serve(listener, router).await?;

    Ok(())
}
