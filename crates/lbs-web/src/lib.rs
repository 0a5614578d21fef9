//! HTTP trigger surface: `GET /` runs one reconciliation pass, `GET /health`
//! is a liveness probe. Passes are triggered externally (timer or webhook);
//! nothing here schedules.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use lbs_recon::{Reconciler, SyncSummary};
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "lbs-web";

pub struct AppState {
    pub reconciler: Reconciler,
}

impl AppState {
    pub fn new(reconciler: Reconciler) -> Self {
        Self { reconciler }
    }
}

#[derive(Debug, Serialize)]
struct SyncResponse {
    message: String,
    #[serde(flatten)]
    summary: SyncSummary,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(sync_handler))
        .route("/health", get(health_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(reconciler: Reconciler, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "listening");
    axum::serve(listener, app(AppState::new(reconciler))).await?;
    Ok(())
}

async fn sync_handler(State(state): State<Arc<AppState>>) -> Response {
    info!(path = "/", "sync requested");
    match state.reconciler.run_once().await {
        Ok(summary) => {
            let message = summary.message();
            (StatusCode::OK, Json(SyncResponse { message, summary })).into_response()
        }
        Err(err) => {
            error!(error = %err, "sync pass failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Sync failed: {err}"),
            )
                .into_response()
        }
    }
}

async fn health_handler() -> &'static str {
    "OK"
}
