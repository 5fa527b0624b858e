//! ServoLink - Persistent Servo Daemon Link
//!
//! ## Responsibilities
//!
//! - Own the single long-lived servo daemon child process (spawning it
//!   once avoids the PCA9685 re-init glitch on every move)
//! - Correlate commands and replies over the daemon's stdin/stdout pipe
//!   by sequence id, with a fixed per-command deadline
//! - Auto-restart the daemon with a fixed backoff on unexpected exit
//! - Settle-and-release: channels listed in `release_after` get their
//!   holding power cut a short while after each acknowledged move; a
//!   newer move cancels and reschedules the pending release
//!
//! A reply deadline elapsing does not mean the move did not happen - the
//! hardware has no read-back, so a timed-out command is an accepted
//! ambiguity. The link never retries on its own.

mod protocol;

pub use protocol::{ServoCommand, ServoReply};
use protocol::{encode_command, parse_line, ServoLine};

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

/// Servo angle range (degrees)
pub const ANGLE_MIN: i64 = 0;
pub const ANGLE_MAX: i64 = 270;
/// Rest / center position
pub const ANGLE_REST: i64 = 135;

/// Horizontal axis channel on the PWM board
pub const PAN_CHANNEL: u8 = 0;
/// Vertical axis channel
pub const TILT_CHANNEL: u8 = 1;

/// ServoLink configuration
#[derive(Debug, Clone)]
pub struct ServoLinkConfig {
    /// Command line that starts the servo daemon
    pub command: String,
    /// Per-command reply deadline
    pub reply_timeout: Duration,
    /// Backoff before respawning a crashed daemon
    pub restart_backoff: Duration,
    /// Channels that get a deferred OFF after each acknowledged move,
    /// and how long to wait for the servo to settle first
    pub release_after: HashMap<u8, Duration>,
}

impl Default for ServoLinkConfig {
    fn default() -> Self {
        // The tilt servo jitters when PWM is held, the pan servo does not.
        let mut release_after = HashMap::new();
        release_after.insert(TILT_CHANNEL, Duration::from_millis(600));

        Self {
            command: "python3 scripts/servo.py".to_string(),
            reply_timeout: Duration::from_secs(3),
            restart_backoff: Duration::from_secs(1),
            release_after,
        }
    }
}

/// Acknowledged move
#[derive(Debug, Clone)]
pub struct ServoAck {
    pub channel: u8,
    pub angle: i64,
    /// Raw daemon payload (channel/angle/pulse echo)
    pub payload: String,
}

type Writer = Box<dyn AsyncWrite + Send + Unpin>;

struct LinkShared {
    config: ServoLinkConfig,
    seq: AtomicU64,
    /// In-flight commands keyed by sequence id; at most one entry per id,
    /// ids are never reused
    pending: Mutex<HashMap<u64, oneshot::Sender<ServoReply>>>,
    writer: Mutex<Option<Writer>>,
    ready_tx: watch::Sender<bool>,
    ready_rx: watch::Receiver<bool>,
    /// Pending settle-release timers per channel
    release_timers: Mutex<HashMap<u8, JoinHandle<()>>>,
}

impl LinkShared {
    fn is_ready(&self) -> bool {
        *self.ready_rx.borrow()
    }

    /// Write one tagged command and await its correlated reply
    async fn send_command(self: &Arc<Self>, command: ServoCommand) -> Result<ServoReply> {
        if !self.is_ready() {
            return Err(Error::ServoNotReady("servo daemon not running".to_string()));
        }

        let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(seq, tx);

        let line = format!("{}\n", encode_command(seq, &command));
        {
            let mut writer = self.writer.lock().await;
            let Some(w) = writer.as_mut() else {
                self.pending.lock().await.remove(&seq);
                return Err(Error::ServoNotReady("servo daemon pipe closed".to_string()));
            };
            if let Err(e) = w.write_all(line.as_bytes()).await {
                self.pending.lock().await.remove(&seq);
                return Err(Error::ServoNotReady(format!("servo write failed: {}", e)));
            }
            let _ = w.flush().await;
        }

        tracing::debug!(seq = seq, command = ?command, "Servo command sent");

        match timeout(self.config.reply_timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            // Sender dropped: the daemon exited while this command was in flight
            Ok(Err(_)) => Err(Error::ServoNotReady(
                "servo daemon exited mid-command".to_string(),
            )),
            Err(_) => {
                self.pending.lock().await.remove(&seq);
                tracing::warn!(seq = seq, "Servo reply deadline elapsed");
                Err(Error::ServoTimeout { seq })
            }
        }
    }

    /// Consume daemon stdout lines until EOF / read error
    async fn serve_reader<R: AsyncRead + Unpin>(self: &Arc<Self>, reader: R) {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => match parse_line(&line) {
                    ServoLine::Ready => {
                        let was_ready = self.ready_tx.send_replace(true);
                        if !was_ready {
                            tracing::info!("Servo daemon ready");
                        }
                    }
                    ServoLine::Reply { seq, reply } => {
                        match self.pending.lock().await.remove(&seq) {
                            // Receiver may already have timed out; that is fine
                            Some(tx) => {
                                let _ = tx.send(reply);
                            }
                            None => {
                                tracing::debug!(seq = seq, "Late or unknown servo reply ignored")
                            }
                        }
                    }
                    ServoLine::Other(text) => {
                        if !text.is_empty() {
                            tracing::debug!(line = %text, "Stray servo output ignored");
                        }
                    }
                },
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "Servo stdout read failed");
                    break;
                }
            }
        }
    }

    /// Mark the link down and abandon all in-flight commands. Their
    /// callers see a link-closed error; their own deadlines would cover
    /// them anyway.
    async fn fail_over(&self, reason: &str) {
        self.ready_tx.send_replace(false);
        *self.writer.lock().await = None;
        let abandoned = {
            let mut pending = self.pending.lock().await;
            let n = pending.len();
            pending.clear();
            n
        };
        tracing::warn!(reason = reason, abandoned = abandoned, "Servo link down");
    }
}

/// ServoLink instance
pub struct ServoLink {
    shared: Arc<LinkShared>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl ServoLink {
    /// Create new ServoLink (daemon is not spawned until `start`)
    pub fn new(config: ServoLinkConfig) -> Self {
        let (ready_tx, ready_rx) = watch::channel(false);
        Self {
            shared: Arc::new(LinkShared {
                config,
                seq: AtomicU64::new(0),
                pending: Mutex::new(HashMap::new()),
                writer: Mutex::new(None),
                ready_tx,
                ready_rx,
                release_timers: Mutex::new(HashMap::new()),
            }),
            supervisor: Mutex::new(None),
        }
    }

    /// Spawn the daemon supervisor: run the child, correlate replies,
    /// respawn with backoff on exit.
    pub async fn start(&self) {
        let mut supervisor = self.supervisor.lock().await;
        if supervisor.is_some() {
            tracing::warn!("Servo link already started");
            return;
        }

        let shared = Arc::clone(&self.shared);
        *supervisor = Some(tokio::spawn(async move {
            loop {
                match Self::spawn_daemon(&shared).await {
                    Ok((mut child, stdout)) => {
                        shared.serve_reader(stdout).await;
                        let _ = child.start_kill();
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Servo daemon spawn failed");
                    }
                }
                shared.fail_over("servo daemon exited").await;
                sleep(shared.config.restart_backoff).await;
                tracing::info!("Respawning servo daemon");
            }
        }));
    }

    async fn spawn_daemon(
        shared: &Arc<LinkShared>,
    ) -> Result<(tokio::process::Child, tokio::process::ChildStdout)> {
        let mut parts = shared.config.command.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| Error::Validation("empty servo command".to_string()))?;

        let mut child = Command::new(program)
            .args(parts)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Process(format!("servo daemon spawn failed: {}", e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Process("servo daemon stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Process("servo daemon stdout unavailable".to_string()))?;

        *shared.writer.lock().await = Some(Box::new(stdin));
        tracing::info!(command = %shared.config.command, "Servo daemon spawned");

        Ok((child, stdout))
    }

    /// Whether the daemon has signalled READY
    pub fn is_ready(&self) -> bool {
        self.shared.is_ready()
    }

    /// Wait for the daemon to signal READY, up to `window`
    pub async fn wait_ready(&self, window: Duration) -> Result<()> {
        let mut rx = self.shared.ready_rx.clone();
        let _ = timeout(window, async {
            while !*rx.borrow_and_update() {
                if rx.changed().await.is_err() {
                    break;
                }
            }
        })
        .await;

        if self.is_ready() {
            Ok(())
        } else {
            Err(Error::ServoNotReady(
                "servo daemon did not become ready".to_string(),
            ))
        }
    }

    /// Move `channel` to `angle` degrees (clamped to the valid range) and
    /// await the acknowledgment. Channels with a configured settle delay
    /// get their deferred release (re)scheduled after the ack.
    pub async fn set_angle(&self, channel: u8, angle: i64) -> Result<ServoAck> {
        let angle = angle.clamp(ANGLE_MIN, ANGLE_MAX);

        // A new move supersedes any pending release on the same channel.
        if self.shared.config.release_after.contains_key(&channel) {
            self.cancel_release(channel).await;
        }

        let reply = self
            .shared
            .send_command(ServoCommand::Set { channel, angle })
            .await?;

        match reply {
            ServoReply::Ok(payload) => {
                if let Some(delay) = self.shared.config.release_after.get(&channel).copied() {
                    self.schedule_release(channel, delay).await;
                }
                Ok(ServoAck {
                    channel,
                    angle,
                    payload,
                })
            }
            ServoReply::Err(msg) => Err(Error::Servo(msg)),
        }
    }

    /// Release holding power on one channel
    pub async fn release(&self, channel: u8) -> Result<()> {
        self.cancel_release(channel).await;
        match self.shared.send_command(ServoCommand::Off { channel }).await? {
            ServoReply::Ok(_) => Ok(()),
            ServoReply::Err(msg) => Err(Error::Servo(msg)),
        }
    }

    /// Release holding power on all channels
    pub async fn release_all(&self) -> Result<()> {
        for channel in [PAN_CHANNEL, TILT_CHANNEL] {
            self.cancel_release(channel).await;
        }
        match self.shared.send_command(ServoCommand::OffAll).await? {
            ServoReply::Ok(_) => Ok(()),
            ServoReply::Err(msg) => Err(Error::Servo(msg)),
        }
    }

    async fn cancel_release(&self, channel: u8) {
        if let Some(timer) = self.shared.release_timers.lock().await.remove(&channel) {
            timer.abort();
        }
    }

    async fn schedule_release(&self, channel: u8, delay: Duration) {
        let shared = Arc::clone(&self.shared);
        let mut timers = self.shared.release_timers.lock().await;
        if let Some(prev) = timers.remove(&channel) {
            prev.abort();
        }
        timers.insert(
            channel,
            tokio::spawn(async move {
                sleep(delay).await;
                shared.release_timers.lock().await.remove(&channel);
                match shared.send_command(ServoCommand::Off { channel }).await {
                    Ok(ServoReply::Ok(_)) => {
                        tracing::debug!(channel = channel, "Holding power released after settle")
                    }
                    Ok(ServoReply::Err(msg)) => {
                        tracing::warn!(channel = channel, error = %msg, "Settle release rejected")
                    }
                    Err(e) => {
                        tracing::debug!(channel = channel, error = %e, "Settle release skipped")
                    }
                }
            }),
        );
    }

    #[cfg(test)]
    pub(crate) async fn attach_io(&self, io: tokio::io::DuplexStream) {
        let (read, write) = tokio::io::split(io);
        *self.shared.writer.lock().await = Some(Box::new(write));
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            shared.serve_reader(read).await;
            shared.fail_over("test io closed").await;
        });
    }

    #[cfg(test)]
    async fn pending_len(&self) -> usize {
        self.shared.pending.lock().await.len()
    }
}
