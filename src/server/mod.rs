// src/server/mod.rs
// Web server layer: status endpoints and the progress WebSocket

pub mod pages;
pub mod ws;

use crate::context::ServerContext;
use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{Html, IntoResponse},
    routing::get,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

/// Shared state for every route
#[derive(Clone)]
pub struct AppState {
    pub context: Arc<ServerContext>,
    /// Monotonically tracked count of open WebSocket connections
    pub connection_count: Arc<AtomicUsize>,
}

impl AppState {
    pub fn new(context: Arc<ServerContext>) -> Self {
        Self {
            context,
            connection_count: Arc::new(AtomicUsize::new(0)),
        }
    }
}

/// Create the web server router
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(server_status))
        .route("/latest", get(latest_job))
        .route("/monitor/{job_id}", get(monitor_page))
        .route("/test", get(test_page))
        .route("/ws/progress/{job_id}", get(ws::progress_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the WebSocket/HTTP server on `port`, draining the in-process
/// progress queue into the job-manager broadcast path.
pub async fn serve(context: Arc<ServerContext>, port: u16) -> crate::Result<()> {
    let state = AppState::new(context.clone());

    if let Some(mut progress_rx) = context.take_progress_receiver().await {
        let manager = context.job_manager.clone();
        tokio::spawn(async move {
            while let Some(snapshot) = progress_rx.recv().await {
                if let Ok(value) = serde_json::to_value(&snapshot) {
                    manager.broadcast(&snapshot.job_id, &value).await;
                }
            }
        });
    }

    let listener = tokio::net::TcpListener::bind(("127.0.0.1", port)).await?;
    info!(port, "WebSocket server listening");
    axum::serve(listener, create_router(state)).await?;
    Ok(())
}

/// GET / — server status with recent jobs and the endpoint map
async fn server_status(State(state): State<AppState>) -> Json<serde_json::Value> {
    let mut jobs: Vec<serde_json::Value> = state
        .context
        .progress_store
        .list_jobs()
        .into_iter()
        .map(|s| {
            serde_json::json!({
                "job_id": s.job_id,
                "status": s.status.as_str(),
                "message": s.message,
                "progress": s.overall_progress,
            })
        })
        .collect();
    jobs.sort_by(|a, b| {
        b["job_id"]
            .as_str()
            .unwrap_or_default()
            .cmp(a["job_id"].as_str().unwrap_or_default())
    });
    jobs.truncate(10);

    Json(serde_json::json!({
        "status": "running",
        "message": "Crackerjack WebSocket Server",
        "active_connections": state.connection_count.load(Ordering::SeqCst),
        "jobs": jobs,
        "websocket_url": "/ws/progress/{job_id}",
        "endpoints": {
            "status": "/",
            "latest_job": "/latest",
            "job_monitor": "/monitor/{job_id}",
            "test": "/test",
            "websocket": "/ws/progress/{job_id}",
        },
    }))
}

/// GET /latest — most recently updated job and its snapshot
async fn latest_job(State(state): State<AppState>) -> impl IntoResponse {
    let Some(job_id) = state.context.progress_store.latest_job_id() else {
        return (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({
                "success": false,
                "error": "No jobs found",
            })),
        );
    };
    let snapshot = state
        .context
        .progress_store
        .read(&job_id)
        .ok()
        .flatten()
        .and_then(|s| serde_json::to_value(s).ok());

    (
        StatusCode::OK,
        Json(serde_json::json!({
            "success": true,
            "job_id": job_id,
            "progress": snapshot,
            "websocket_url": format!("/ws/progress/{}", job_id),
            "monitor_url": format!("/monitor/{}", job_id),
        })),
    )
}

/// GET /monitor/{job_id} — HTML page that opens a WebSocket to the job
async fn monitor_page(
    Path(job_id): Path<String>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    if !state.context.validate_job_id(&job_id).valid {
        return (StatusCode::BAD_REQUEST, Html("Invalid job ID".to_string()));
    }
    (StatusCode::OK, Html(pages::monitor_html(&job_id)))
}

/// GET /test — WebSocket test harness
async fn test_page() -> Html<&'static str> {
    Html(pages::TEST_HTML)
}
