//! TrackingController - Closed-Loop Target Tracking
//!
//! ## Responsibilities
//!
//! - Own the external detector child process and consume its JSON line
//!   events (ready / active+centroid / error)
//! - Convert normalized centroid offsets into bounded servo moves via a
//!   proportional control law
//! - Serialize moves: a detection arriving while a previous move awaits
//!   its ack issues no new move
//! - Fire/cooldown state machine: a detection bout that holds for the
//!   hold delay fires the trigger exactly once, then a cooldown blocks
//!   all detection-driven movement until it elapses
//!
//! The detector reads our own MJPEG endpoint, so its connection flows
//! through the normal stream demand accounting like any other viewer.

use crate::error::{Error, Result};
use crate::position_store::{PanTilt, PositionStore};
use crate::servo_link::{ServoLink, PAN_CHANNEL, TILT_CHANNEL};
use crate::trigger::Trigger;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::sleep;

/// TrackingController configuration
#[derive(Debug, Clone)]
pub struct TrackingConfig {
    /// Detector command; the stream URL is appended as its last argument
    pub detector_cmd: String,
    /// MJPEG endpoint the detector should watch
    pub stream_url: String,
    /// Proportional gain, degrees of correction per unit of offset
    pub gain: f64,
    /// Per-cycle step limit in degrees
    pub max_step_deg: i64,
    /// How long a bout must hold before the trigger fires
    pub hold_delay: Duration,
    /// Lockout after a fire; no detection-driven movement until it elapses
    pub cooldown: Duration,
    /// Pan axis steers opposite the offset (camera mounted normally)
    pub invert_pan: bool,
    /// Tilt axis sign
    pub invert_tilt: bool,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            detector_cmd: "python3 scripts/motion_tracker.py".to_string(),
            stream_url: "http://localhost:3000/camera/stream".to_string(),
            gain: 60.0,
            max_step_deg: 10,
            hold_delay: Duration::from_secs(2),
            cooldown: Duration::from_secs(10),
            invert_pan: true,
            invert_tilt: false,
        }
    }
}

/// One detector stdout line
#[derive(Debug, Deserialize)]
struct DetectorEvent {
    #[serde(default)]
    ready: Option<bool>,
    #[serde(default)]
    active: Option<bool>,
    #[serde(default)]
    cx: Option<f64>,
    #[serde(default)]
    cy: Option<f64>,
    #[serde(default)]
    error: Option<String>,
}

/// Tracking status for the API
#[derive(Debug, Clone, Serialize)]
pub struct TrackingStatus {
    pub active: bool,
    pub detector_ready: bool,
    pub bout_active: bool,
    pub cooldown_active: bool,
    pub move_in_flight: bool,
    pub position: PanTilt,
    pub last_detection_at: Option<DateTime<Utc>>,
}

/// State shared between the event reader, timers and move tasks of one
/// tracking session. Torn down on stop or detector exit; a new session
/// starts from a fresh instance with no carried-over bout state.
struct SessionShared {
    config: TrackingConfig,
    servo: Arc<ServoLink>,
    positions: Arc<PositionStore>,
    trigger: Arc<Trigger>,

    active: AtomicBool,
    detector_ready: AtomicBool,
    bout_active: AtomicBool,
    cooldown_active: AtomicBool,
    move_in_flight: AtomicBool,

    position: StdMutex<PanTilt>,
    last_detection: StdMutex<Option<DateTime<Utc>>>,
    hold_timer: StdMutex<Option<JoinHandle<()>>>,
    cooldown_timer: StdMutex<Option<JoinHandle<()>>>,
}

impl SessionShared {
    fn new(
        config: TrackingConfig,
        servo: Arc<ServoLink>,
        positions: Arc<PositionStore>,
        trigger: Arc<Trigger>,
        start_position: PanTilt,
    ) -> Self {
        Self {
            config,
            servo,
            positions,
            trigger,
            active: AtomicBool::new(true),
            detector_ready: AtomicBool::new(false),
            bout_active: AtomicBool::new(false),
            cooldown_active: AtomicBool::new(false),
            move_in_flight: AtomicBool::new(false),
            position: StdMutex::new(start_position),
            last_detection: StdMutex::new(None),
            hold_timer: StdMutex::new(None),
            cooldown_timer: StdMutex::new(None),
        }
    }

    /// One active-detection event. Starts a bout if none is running (and
    /// cooldown allows), and refines the aim unless a move is already in
    /// flight.
    fn handle_detection(self: &Arc<Self>, cx: f64, cy: f64) {
        if !self.active.load(Ordering::SeqCst) {
            return;
        }
        *self.last_detection.lock().unwrap() = Some(Utc::now());

        // Cooldown gates the whole forward path: no bout, no movement.
        if self.cooldown_active.load(Ordering::SeqCst) {
            return;
        }

        if !self.bout_active.swap(true, Ordering::SeqCst) {
            tracing::info!(cx = cx, cy = cy, "Detection bout started");
            self.start_hold_timer();
        }

        // Skip the move entirely while a previous one awaits its ack;
        // the owning task clears the flag when done.
        if self.move_in_flight.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.apply_move(cx, cy).await;
            this.move_in_flight.store(false, Ordering::SeqCst);
        });
    }

    /// P-control on both axes; only axes whose rounded target differs
    /// from the current angle issue a move. The persisted position is
    /// updated only after the ack, and only if the session still runs.
    async fn apply_move(&self, cx: f64, cy: f64) {
        let current = *self.position.lock().unwrap();
        let target = compute_target(current, cx, cy, &self.config);
        let mut acked = current;

        if target.pan != current.pan {
            match self.servo.set_angle(PAN_CHANNEL, target.pan).await {
                Ok(ack) => acked.pan = ack.angle,
                Err(e) => tracing::debug!(error = %e, "Pan move not acknowledged"),
            }
        }
        if target.tilt != current.tilt {
            match self.servo.set_angle(TILT_CHANNEL, target.tilt).await {
                Ok(ack) => acked.tilt = ack.angle,
                Err(e) => tracing::debug!(error = %e, "Tilt move not acknowledged"),
            }
        }

        if acked == current {
            return;
        }
        if !self.active.load(Ordering::SeqCst) {
            tracing::debug!("Session stopped mid-move, stale result discarded");
            return;
        }

        *self.position.lock().unwrap() = acked;
        if let Err(e) = self.positions.save(acked).await {
            tracing::warn!(error = %e, "Position persist failed");
        }
    }

    fn start_hold_timer(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            sleep(this.config.hold_delay).await;
            this.hold_timer.lock().unwrap().take();
            this.fire_and_cooldown();
        });
        if let Some(prev) = self.hold_timer.lock().unwrap().replace(handle) {
            prev.abort();
        }
    }

    /// Bout held long enough: enter cooldown first so no second trigger
    /// can queue while the first still executes, then fire.
    fn fire_and_cooldown(self: &Arc<Self>) {
        if !self.active.load(Ordering::SeqCst) {
            return;
        }
        self.cooldown_active.store(true, Ordering::SeqCst);
        self.bout_active.store(false, Ordering::SeqCst);

        let fired = self.trigger.fire(None);
        tracing::info!(fired = fired, "Bout held, entering cooldown");

        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            sleep(this.config.cooldown).await;
            this.cooldown_timer.lock().unwrap().take();
            this.cooldown_active.store(false, Ordering::SeqCst);
            tracing::info!("Cooldown released");
        });
        if let Some(prev) = self.cooldown_timer.lock().unwrap().replace(handle) {
            prev.abort();
        }
    }

    /// End the session: cancel timers, clear guards. Idempotent.
    fn teardown(&self, reason: &str) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(t) = self.hold_timer.lock().unwrap().take() {
            t.abort();
        }
        if let Some(t) = self.cooldown_timer.lock().unwrap().take() {
            t.abort();
        }
        self.bout_active.store(false, Ordering::SeqCst);
        self.cooldown_active.store(false, Ordering::SeqCst);
        self.move_in_flight.store(false, Ordering::SeqCst);
        tracing::info!(reason = reason, "Tracking session ended");
    }

    /// Consume detector stdout until EOF / fatal event
    async fn read_events<R: AsyncRead + Unpin>(self: Arc<Self>, reader: R) {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let event: DetectorEvent = match serde_json::from_str(&line) {
                Ok(e) => e,
                Err(e) => {
                    tracing::debug!(line = %line, error = %e, "Unparseable detector line");
                    continue;
                }
            };

            if let Some(msg) = event.error {
                tracing::error!(error = %msg, "Detector fault, tearing session down");
                self.teardown("detector fault");
                return;
            }
            if event.ready == Some(true) {
                self.detector_ready.store(true, Ordering::SeqCst);
                tracing::info!("Detector attached to stream");
                continue;
            }
            match (event.active, event.cx, event.cy) {
                (Some(true), Some(cx), Some(cy)) => self.handle_detection(cx, cy),
                // Quiet cycles neither end a bout nor cancel the hold
                // timer; the detector already debounces inactivity.
                _ => {}
            }
        }
        self.teardown("detector exited");
    }
}

/// Compute both axis targets from a normalized centroid
fn compute_target(current: PanTilt, cx: f64, cy: f64, config: &TrackingConfig) -> PanTilt {
    PanTilt {
        pan: steer(
            current.pan,
            cx - 0.5,
            config.gain,
            config.max_step_deg,
            config.invert_pan,
        ),
        tilt: steer(
            current.tilt,
            cy - 0.5,
            config.gain,
            config.max_step_deg,
            config.invert_tilt,
        ),
    }
}

/// One axis of the P-controller: proportional delta, step clamp, range
/// clamp, integer round.
fn steer(current: i64, offset: f64, gain: f64, max_step: i64, invert: bool) -> i64 {
    let mut delta = offset * gain;
    if invert {
        delta = -delta;
    }
    let step = delta.clamp(-(max_step as f64), max_step as f64);
    let target = (current as f64 + step).round() as i64;
    target.clamp(crate::servo_link::ANGLE_MIN, crate::servo_link::ANGLE_MAX)
}

/// One running tracking session
struct Session {
    shared: Arc<SessionShared>,
    child: Option<tokio::process::Child>,
    reader: JoinHandle<()>,
}

/// TrackingController instance
pub struct TrackingController {
    config: TrackingConfig,
    servo: Arc<ServoLink>,
    positions: Arc<PositionStore>,
    trigger: Arc<Trigger>,
    session: Mutex<Option<Session>>,
}

impl TrackingController {
    /// Create new TrackingController
    pub fn new(
        config: TrackingConfig,
        servo: Arc<ServoLink>,
        positions: Arc<PositionStore>,
        trigger: Arc<Trigger>,
    ) -> Self {
        Self {
            config,
            servo,
            positions,
            trigger,
            session: Mutex::new(None),
        }
    }

    /// Start a tracking session: spawn the detector and begin consuming
    /// its events. Fails if a session is already active.
    pub async fn start(&self) -> Result<()> {
        let mut session = self.session.lock().await;
        if session
            .as_ref()
            .is_some_and(|s| s.shared.active.load(Ordering::SeqCst))
        {
            return Err(Error::Conflict("tracking already active".to_string()));
        }
        // A dead session (detector fault/exit) is replaced.
        if let Some(old) = session.take() {
            Self::kill_session(old);
        }

        let mut parts = self.config.detector_cmd.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| Error::Validation("empty detector command".to_string()))?;

        let mut child = Command::new(program)
            .args(parts)
            .arg(&self.config.stream_url)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Process(format!("detector spawn failed: {}", e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Process("detector stdout unavailable".to_string()))?;

        let start_position = self.positions.load().await;
        let shared = Arc::new(SessionShared::new(
            self.config.clone(),
            Arc::clone(&self.servo),
            Arc::clone(&self.positions),
            Arc::clone(&self.trigger),
            start_position,
        ));
        let reader = tokio::spawn(Arc::clone(&shared).read_events(stdout));

        tracing::info!(
            command = %self.config.detector_cmd,
            stream_url = %self.config.stream_url,
            "Tracking started"
        );
        *session = Some(Session {
            shared,
            child: Some(child),
            reader,
        });
        Ok(())
    }

    /// Stop the session, cancel its timers and kill the detector.
    /// Idempotent: stopping with no session is a no-op.
    pub async fn stop(&self) {
        let mut session = self.session.lock().await;
        match session.take() {
            Some(s) => {
                s.shared.teardown("stopped");
                Self::kill_session(s);
                tracing::info!("Tracking stopped");
            }
            None => tracing::debug!("Tracking stop with no active session"),
        }
    }

    fn kill_session(mut session: Session) {
        session.reader.abort();
        if let Some(child) = session.child.as_mut() {
            let _ = child.start_kill();
        }
    }

    /// Snapshot of the session state for the API
    pub async fn status(&self) -> TrackingStatus {
        let session = self.session.lock().await;
        match session.as_ref() {
            Some(s) => TrackingStatus {
                active: s.shared.active.load(Ordering::SeqCst),
                detector_ready: s.shared.detector_ready.load(Ordering::SeqCst),
                bout_active: s.shared.bout_active.load(Ordering::SeqCst),
                cooldown_active: s.shared.cooldown_active.load(Ordering::SeqCst),
                move_in_flight: s.shared.move_in_flight.load(Ordering::SeqCst),
                position: *s.shared.position.lock().unwrap(),
                last_detection_at: *s.shared.last_detection.lock().unwrap(),
            },
            None => TrackingStatus {
                active: false,
                detector_ready: false,
                bout_active: false,
                cooldown_active: false,
                move_in_flight: false,
                position: self.positions.load().await,
                last_detection_at: None,
            },
        }
    }

    #[cfg(test)]
    async fn start_with_io(&self, detector: impl AsyncRead + Unpin + Send + 'static) -> Result<()> {
        let mut session = self.session.lock().await;
        if session
            .as_ref()
            .is_some_and(|s| s.shared.active.load(Ordering::SeqCst))
        {
            return Err(Error::Conflict("tracking already active".to_string()));
        }
        let start_position = self.positions.load().await;
        let shared = Arc::new(SessionShared::new(
            self.config.clone(),
            Arc::clone(&self.servo),
            Arc::clone(&self.positions),
            Arc::clone(&self.trigger),
            start_position,
        ));
        let reader = tokio::spawn(Arc::clone(&shared).read_events(detector));
        *session = Some(Session {
            shared,
            child: None,
            reader,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::servo_link::ServoLinkConfig;
    use crate::trigger::TriggerConfig;
    use std::io::Write as _;
    use tokio::io::{duplex, AsyncWriteExt, DuplexStream};

    #[test]
    fn test_steer_clamps_step_to_max() {
        // Axis at 100, offset -0.3, gain 60 -> raw delta +18, clamped to +10.
        assert_eq!(steer(100, -0.3, 60.0, 10, true), 110);
    }

    #[test]
    fn test_steer_small_offset_rounds() {
        assert_eq!(steer(135, 0.05, 60.0, 10, true), 132);
        // Sub-half-degree correction rounds away entirely.
        assert_eq!(steer(135, -0.004, 60.0, 10, true), 135);
    }

    #[test]
    fn test_steer_respects_axis_range() {
        assert_eq!(steer(268, -0.5, 60.0, 10, true), 270);
        assert_eq!(steer(2, 0.5, 60.0, 10, true), 0);
    }

    #[test]
    fn test_compute_target_centered_is_noop() {
        let cfg = TrackingConfig::default();
        let pos = PanTilt { pan: 120, tilt: 150 };
        assert_eq!(compute_target(pos, 0.5, 0.5, &cfg), pos);
    }

    #[test]
    fn test_compute_target_both_axes() {
        let cfg = TrackingConfig {
            gain: 20.0,
            max_step_deg: 10,
            ..TrackingConfig::default()
        };
        let pos = PanTilt { pan: 135, tilt: 135 };
        // Target right of center -> pan decreases (inverted);
        // target below center -> tilt increases (direct).
        let target = compute_target(pos, 0.75, 0.75, &cfg);
        assert_eq!(target, PanTilt { pan: 130, tilt: 140 });
    }

    /// Fake servo daemon: replies OK after `delay`, records commands.
    fn fake_servo(
        io: DuplexStream,
        delay: Duration,
        log: Arc<StdMutex<Vec<String>>>,
    ) {
        tokio::spawn(async move {
            let (read, mut write) = tokio::io::split(io);
            write.write_all(b"READY\n").await.unwrap();
            let mut lines = BufReader::new(read).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let rest = line.strip_prefix("SEQ:").unwrap();
                let (seq, body) = rest.split_once(' ').unwrap();
                log.lock().unwrap().push(body.to_string());
                if !delay.is_zero() {
                    sleep(delay).await;
                }
                let reply = format!("SEQ:{} OK done\n", seq);
                write.write_all(reply.as_bytes()).await.unwrap();
            }
        });
    }

    struct Rig {
        controller: TrackingController,
        detector: DuplexStream,
        servo_log: Arc<StdMutex<Vec<String>>>,
        fire_log: std::path::PathBuf,
        _dir: tempfile::TempDir,
    }

    async fn rig(config: TrackingConfig, servo_delay: Duration) -> Rig {
        let dir = tempfile::tempdir().unwrap();

        let servo = Arc::new(ServoLink::new(ServoLinkConfig::default()));
        let (near, far) = duplex(8192);
        servo.attach_io(near).await;
        let servo_log = Arc::new(StdMutex::new(Vec::new()));
        fake_servo(far, servo_delay, Arc::clone(&servo_log));
        servo.wait_ready(Duration::from_secs(1)).await.unwrap();

        // Trigger appends one line per pulse so fires are countable.
        let fire_log = dir.path().join("fires");
        let script = dir.path().join("fire.sh");
        let mut f = std::fs::File::create(&script).unwrap();
        writeln!(f, "echo fired >> {}", fire_log.display()).unwrap();
        let trigger = Arc::new(Trigger::new(TriggerConfig {
            command: format!("sh {}", script.display()),
            default_pulse_ms: 10,
            timeout: Duration::from_secs(2),
        }));

        let positions = Arc::new(PositionStore::new(dir.path().join("position")));
        let controller = TrackingController::new(config, servo, positions, trigger);

        let (near, far) = duplex(8192);
        controller.start_with_io(far).await.unwrap();

        Rig {
            controller,
            detector: near,
            servo_log,
            fire_log,
            _dir: dir,
        }
    }

    async fn emit(detector: &mut DuplexStream, json: &str) {
        detector
            .write_all(format!("{}\n", json).as_bytes())
            .await
            .unwrap();
    }

    fn fire_count(path: &std::path::Path) -> usize {
        std::fs::read_to_string(path)
            .map(|s| s.lines().count())
            .unwrap_or(0)
    }

    fn fast_config() -> TrackingConfig {
        TrackingConfig {
            gain: 60.0,
            max_step_deg: 10,
            hold_delay: Duration::from_millis(100),
            cooldown: Duration::from_millis(400),
            ..TrackingConfig::default()
        }
    }

    #[tokio::test]
    async fn test_detection_moves_toward_target() {
        let mut r = rig(fast_config(), Duration::ZERO).await;

        emit(&mut r.detector, r#"{"active":true,"cx":0.2,"cy":0.5}"#).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Offset -0.3, inverted, clamped to +10: pan 135 -> 145. Tilt
        // centered, no move.
        let cmds = r.servo_log.lock().unwrap().clone();
        assert_eq!(cmds, vec!["SET 0 145".to_string()]);

        let status = r.controller.status().await;
        assert!(status.bout_active);
        assert_eq!(status.position.pan, 145);
    }

    #[tokio::test]
    async fn test_single_bout_fires_once_then_cooldown() {
        let mut r = rig(fast_config(), Duration::ZERO).await;

        emit(&mut r.detector, r#"{"active":true,"cx":0.2,"cy":0.5}"#).await;
        tokio::time::sleep(Duration::from_millis(250)).await;

        // Hold elapsed: exactly one fire, cooldown holds.
        assert_eq!(fire_count(&r.fire_log), 1);
        let status = r.controller.status().await;
        assert!(status.cooldown_active);
        assert!(!status.bout_active);

        // Detections during cooldown: no moves, no second fire.
        let moves_before = r.servo_log.lock().unwrap().len();
        emit(&mut r.detector, r#"{"active":true,"cx":0.1,"cy":0.5}"#).await;
        emit(&mut r.detector, r#"{"active":true,"cx":0.9,"cy":0.5}"#).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(r.servo_log.lock().unwrap().len(), moves_before);
        assert_eq!(fire_count(&r.fire_log), 1);
    }

    #[tokio::test]
    async fn test_bout_after_cooldown_fires_again() {
        let mut r = rig(fast_config(), Duration::ZERO).await;

        emit(&mut r.detector, r#"{"active":true,"cx":0.2,"cy":0.5}"#).await;
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(fire_count(&r.fire_log), 1);

        // Wait out the cooldown, then a fresh bout.
        tokio::time::sleep(Duration::from_millis(400)).await;
        emit(&mut r.detector, r#"{"active":true,"cx":0.8,"cy":0.5}"#).await;
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(fire_count(&r.fire_log), 2);
    }

    #[tokio::test]
    async fn test_move_in_flight_skips_refinement() {
        // Servo acks slowly; rapid detections must not stack moves.
        let mut r = rig(
            TrackingConfig {
                hold_delay: Duration::from_secs(30),
                ..fast_config()
            },
            Duration::from_millis(200),
        )
        .await;

        emit(&mut r.detector, r#"{"active":true,"cx":0.2,"cy":0.5}"#).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        emit(&mut r.detector, r#"{"active":true,"cx":0.3,"cy":0.5}"#).await;
        emit(&mut r.detector, r#"{"active":true,"cx":0.4,"cy":0.5}"#).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(r.servo_log.lock().unwrap().len(), 1);
        assert!(r.controller.status().await.move_in_flight);

        // Ack lands, guard clears, the next detection moves again.
        tokio::time::sleep(Duration::from_millis(250)).await;
        emit(&mut r.detector, r#"{"active":true,"cx":0.2,"cy":0.5}"#).await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(r.servo_log.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_stop_discards_in_flight_result() {
        let mut r = rig(fast_config(), Duration::from_millis(150)).await;

        emit(&mut r.detector, r#"{"active":true,"cx":0.2,"cy":0.5}"#).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        r.controller.stop().await;

        // The ack arrives after the stop; nothing may be persisted.
        tokio::time::sleep(Duration::from_millis(300)).await;
        let persisted = r.controller.positions.load().await;
        assert_eq!(persisted, PanTilt::rest());
        assert!(!r.controller.status().await.active);
    }

    #[tokio::test]
    async fn test_detector_error_tears_down_session() {
        let mut r = rig(fast_config(), Duration::ZERO).await;

        emit(&mut r.detector, r#"{"ready":true}"#).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(r.controller.status().await.detector_ready);

        emit(&mut r.detector, r#"{"error":"stream lost"}"#).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!r.controller.status().await.active);

        // A dead session does not block a restart.
        let (_near, far) = duplex(1024);
        r.controller.start_with_io(far).await.unwrap();
        assert!(r.controller.status().await.active);
    }

    #[tokio::test]
    async fn test_double_start_conflicts() {
        let r = rig(fast_config(), Duration::ZERO).await;
        let (_near, far) = duplex(1024);
        let err = r.controller.start_with_io(far).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn test_inactive_and_garbage_lines_ignored() {
        let mut r = rig(fast_config(), Duration::ZERO).await;

        emit(&mut r.detector, r#"{"active":false}"#).await;
        emit(&mut r.detector, "not json at all").await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let status = r.controller.status().await;
        assert!(status.active);
        assert!(!status.bout_active);
        assert!(r.servo_log.lock().unwrap().is_empty());
    }
}
