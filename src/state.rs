//! Application state
//!
//! Holds all shared components and state

use crate::frame_mux::FrameMux;
use crate::position_store::PositionStore;
use crate::servo_link::{ServoLink, ServoLinkConfig, TILT_CHANNEL};
use crate::stream_manager::{StreamManager, StreamManagerConfig};
use crate::tracking::{TrackingConfig, TrackingController};
use crate::trigger::{Trigger, TriggerConfig};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => matches!(v.as_str(), "1" | "true" | "yes"),
        Err(_) => default,
    }
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Server host
    pub host: String,
    /// Server port
    pub port: u16,
    /// Video producer command (quality args are appended)
    pub camera_cmd: String,
    /// Servo daemon command
    pub servo_cmd: String,
    /// Detector command (stream URL appended)
    pub detector_cmd: String,
    /// Relay trigger command template
    pub trigger_cmd: String,
    /// Persisted pan/tilt file
    pub position_path: PathBuf,
    /// MJPEG URL the detector watches
    pub stream_url: String,
    /// Servo reply deadline
    pub servo_timeout: Duration,
    /// Servo daemon restart backoff
    pub servo_backoff: Duration,
    /// Tilt settle-and-release delay
    pub tilt_release: Duration,
    /// Producer first-frame window
    pub stream_startup_timeout: Duration,
    /// Producer idle shutdown grace
    pub stream_idle_grace: Duration,
    /// Tracking proportional gain (degrees per unit offset)
    pub tracking_gain: f64,
    /// Tracking per-cycle step limit in degrees
    pub tracking_max_step: i64,
    /// Bout hold before the trigger fires
    pub tracking_hold: Duration,
    /// Post-fire cooldown
    pub tracking_cooldown: Duration,
    /// Pan steering sign
    pub invert_pan: bool,
    /// Tilt steering sign
    pub invert_tilt: bool,
    /// Default trigger pulse length
    pub trigger_pulse_ms: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        let host = env_or("HOST", "0.0.0.0");
        let port: u16 = env_parse("PORT", 3000);
        Self {
            camera_cmd: env_or(
                "TURRET_CAMERA_CMD",
                "rpicam-vid -t 0 --codec mjpeg --inline -n -o -",
            ),
            servo_cmd: env_or("TURRET_SERVO_CMD", "python3 scripts/servo.py"),
            detector_cmd: env_or("TURRET_DETECTOR_CMD", "python3 scripts/motion_tracker.py"),
            trigger_cmd: env_or(
                "TURRET_TRIGGER_CMD",
                "python3 scripts/relecko.py pulse {pulse_ms}",
            ),
            position_path: std::env::var("TURRET_POSITION_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("/var/lib/turretd/position")),
            stream_url: env_or(
                "TURRET_STREAM_URL",
                &format!("http://127.0.0.1:{}/camera/stream", port),
            ),
            servo_timeout: Duration::from_millis(env_parse("TURRET_SERVO_TIMEOUT_MS", 3000)),
            servo_backoff: Duration::from_millis(env_parse("TURRET_SERVO_BACKOFF_MS", 1000)),
            tilt_release: Duration::from_millis(env_parse("TURRET_TILT_RELEASE_MS", 600)),
            stream_startup_timeout: Duration::from_millis(env_parse(
                "TURRET_STREAM_STARTUP_MS",
                5000,
            )),
            stream_idle_grace: Duration::from_millis(env_parse("TURRET_IDLE_GRACE_MS", 10000)),
            tracking_gain: env_parse("TURRET_TRACKING_GAIN", 60.0),
            tracking_max_step: env_parse("TURRET_TRACKING_MAX_STEP", 10),
            tracking_hold: Duration::from_millis(env_parse("TURRET_HOLD_MS", 2000)),
            tracking_cooldown: Duration::from_millis(env_parse("TURRET_COOLDOWN_MS", 10000)),
            invert_pan: env_flag("TURRET_INVERT_PAN", true),
            invert_tilt: env_flag("TURRET_INVERT_TILT", false),
            trigger_pulse_ms: env_parse("TURRET_TRIGGER_PULSE_MS", 500),
            host,
            port,
        }
    }
}

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// Application config
    pub config: AppConfig,
    /// FrameMux (JPEG framing + viewer fan-out)
    pub frame_mux: Arc<FrameMux>,
    /// StreamManager (demand-driven producer lifecycle)
    pub stream: Arc<StreamManager>,
    /// ServoLink (servo daemon supervisor)
    pub servo: Arc<ServoLink>,
    /// PositionStore (persisted pan/tilt)
    pub positions: Arc<PositionStore>,
    /// Trigger (relay pulse)
    pub trigger: Arc<Trigger>,
    /// TrackingController (detector + control loop)
    pub tracking: Arc<TrackingController>,
}

impl AppState {
    /// Wire all components from `config`. Does not start the servo
    /// supervisor; main does that once the state is in place.
    pub fn new(config: AppConfig) -> Self {
        let frame_mux = Arc::new(FrameMux::new());

        let stream = Arc::new(StreamManager::new(
            StreamManagerConfig {
                camera_cmd: config.camera_cmd.clone(),
                startup_timeout: config.stream_startup_timeout,
                idle_grace: config.stream_idle_grace,
            },
            Arc::clone(&frame_mux),
        ));

        let servo = Arc::new(ServoLink::new(ServoLinkConfig {
            command: config.servo_cmd.clone(),
            reply_timeout: config.servo_timeout,
            restart_backoff: config.servo_backoff,
            release_after: HashMap::from([(TILT_CHANNEL, config.tilt_release)]),
        }));

        let positions = Arc::new(PositionStore::new(config.position_path.clone()));

        let trigger = Arc::new(Trigger::new(TriggerConfig {
            command: config.trigger_cmd.clone(),
            default_pulse_ms: config.trigger_pulse_ms,
            timeout: Duration::from_secs(5),
        }));

        let tracking = Arc::new(TrackingController::new(
            TrackingConfig {
                detector_cmd: config.detector_cmd.clone(),
                stream_url: config.stream_url.clone(),
                gain: config.tracking_gain,
                max_step_deg: config.tracking_max_step,
                hold_delay: config.tracking_hold,
                cooldown: config.tracking_cooldown,
                invert_pan: config.invert_pan,
                invert_tilt: config.invert_tilt,
            },
            Arc::clone(&servo),
            Arc::clone(&positions),
            Arc::clone(&trigger),
        ));

        Self {
            config,
            frame_mux,
            stream,
            servo,
            positions,
            trigger,
            tracking,
        }
    }
}
