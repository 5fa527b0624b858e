//! Turretd - Sentry Turret Control Server
//!
//! Camera-guided pan/tilt turret daemon for a single-board host.
//!
//! ## Architecture (6 Components)
//!
//! 1. FrameMux - JPEG frame extraction + viewer fan-out
//! 2. StreamManager - Demand-driven video producer lifecycle
//! 3. ServoLink - Servo daemon supervisor and line protocol
//! 4. TrackingController - Detector-driven closed-loop aiming
//! 5. Trigger - Relay pulse action
//! 6. WebAPI - REST API endpoints + MJPEG streaming
//!
//! ## Design Principles
//!
//! - All hardware sits behind child processes; this daemon only speaks
//!   pipes and line protocols
//! - Slow consumers never stall the camera: frames are dropped per
//!   viewer, not queued
//! - SOLID: Single responsibility per module

pub mod error;
pub mod frame_mux;
pub mod position_store;
pub mod servo_link;
pub mod state;
pub mod stream_manager;
pub mod tracking;
pub mod trigger;
pub mod web_api;

pub use error::{Error, Result};
pub use state::AppState;
