//! API Routes

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;

use crate::error::{Error, Result};
use crate::position_store::PanTilt;
use crate::servo_link::{PAN_CHANNEL, TILT_CHANNEL};
use crate::state::AppState;

/// Create API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health & Status
        .route("/healthz", get(super::health_check))
        .route("/api/status", get(super::device_status))
        // Live video
        .route("/camera/stream", get(super::stream_routes::camera_stream))
        // Servo
        .route("/api/servo/move", post(servo_move))
        .route("/api/servo/center", post(servo_center))
        .route("/api/servo/off", post(servo_off))
        // Tracking
        .route("/api/tracking/start", post(tracking_start))
        .route("/api/tracking/stop", post(tracking_stop))
        .route("/api/tracking/status", get(tracking_status))
        // Trigger
        .route("/api/trigger", post(fire_trigger))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct MoveRequest {
    pub pan: Option<i64>,
    pub tilt: Option<i64>,
}

/// POST /api/servo/move
///
/// Moves the requested axes and persists the acknowledged angles. Axes
/// the daemon never acknowledged keep their previous persisted value.
async fn servo_move(
    State(state): State<AppState>,
    Json(request): Json<MoveRequest>,
) -> Result<Json<serde_json::Value>> {
    if request.pan.is_none() && request.tilt.is_none() {
        return Err(Error::Validation(
            "at least one of pan/tilt is required".to_string(),
        ));
    }

    let mut position = state.positions.load().await;
    if let Some(pan) = request.pan {
        let ack = state.servo.set_angle(PAN_CHANNEL, pan).await?;
        position.pan = ack.angle;
    }
    if let Some(tilt) = request.tilt {
        let ack = state.servo.set_angle(TILT_CHANNEL, tilt).await?;
        position.tilt = ack.angle;
    }
    state.positions.save(position).await?;

    Ok(Json(json!({ "ok": true, "position": position })))
}

/// POST /api/servo/center
async fn servo_center(State(state): State<AppState>) -> Result<Json<serde_json::Value>> {
    let rest = PanTilt::rest();
    state.servo.set_angle(PAN_CHANNEL, rest.pan).await?;
    state.servo.set_angle(TILT_CHANNEL, rest.tilt).await?;
    state.positions.save(rest).await?;
    Ok(Json(json!({ "ok": true, "position": rest })))
}

/// POST /api/servo/off
///
/// Drops holding power on all channels. The persisted position is kept;
/// the armature stays roughly where it was.
async fn servo_off(State(state): State<AppState>) -> Result<Json<serde_json::Value>> {
    state.servo.release_all().await?;
    Ok(Json(json!({ "ok": true })))
}

/// POST /api/tracking/start
async fn tracking_start(State(state): State<AppState>) -> Result<Json<serde_json::Value>> {
    state.tracking.start().await?;
    Ok(Json(json!({ "ok": true })))
}

/// POST /api/tracking/stop
async fn tracking_stop(State(state): State<AppState>) -> Json<serde_json::Value> {
    state.tracking.stop().await;
    Json(json!({ "ok": true }))
}

/// GET /api/tracking/status
async fn tracking_status(State(state): State<AppState>) -> Json<crate::tracking::TrackingStatus> {
    Json(state.tracking.status().await)
}

#[derive(Debug, Deserialize)]
pub struct TriggerRequest {
    pub pulse_ms: Option<u64>,
}

/// POST /api/trigger
///
/// Manual fire. Rejected while a pulse is still executing.
async fn fire_trigger(
    State(state): State<AppState>,
    body: Option<Json<TriggerRequest>>,
) -> Result<Json<serde_json::Value>> {
    let pulse_ms = body.and_then(|Json(r)| r.pulse_ms);
    if !state.trigger.fire(pulse_ms) {
        return Err(Error::Conflict("trigger already firing".to_string()));
    }
    Ok(Json(json!({ "ok": true })))
}
