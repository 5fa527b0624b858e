//! WebAPI - REST API Endpoints
//!
//! ## Responsibilities
//!
//! - HTTP API routes
//! - Request validation
//! - Response formatting
//! - MJPEG streaming responses

mod routes;
mod stream_routes;

pub use routes::create_router;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;

use crate::state::AppState;

/// Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Status endpoint: one snapshot of every component
pub async fn device_status(State(state): State<AppState>) -> impl IntoResponse {
    let tracking = state.tracking.status().await;
    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "servo_ready": state.servo.is_ready(),
        "stream": {
            "producer_running": state.stream.producer_running().await,
            "viewer_demand": state.stream.viewer_demand().await,
            "quality": state.stream.active_quality().await,
            "viewers_attached": state.frame_mux.viewer_count().await,
        },
        "position": tracking.position,
        "tracking": tracking,
        "trigger_firing": state.trigger.is_firing(),
    }))
}
