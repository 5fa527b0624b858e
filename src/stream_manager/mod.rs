//! StreamManager - Demand-Driven Video Producer Lifecycle
//!
//! ## Responsibilities
//!
//! - Reference-count stream viewers; the camera producer process runs
//!   only while someone is watching
//! - 0 -> 1 spawns the producer (or respawns it when a different quality
//!   is requested) and waits for the first complete frame before the
//!   attach completes
//! - last viewer gone arms an idle grace timer; reconnect churn inside
//!   the window never restarts the camera
//! - producer stdout is pumped into the FrameMux; an unexpected producer
//!   exit clears all viewers and resets demand accounting
//!
//! Demand is held through a `StreamLease`; dropping the lease releases it
//! (same pattern as a camera access lease elsewhere in this codebase).

use crate::error::{Error, Result};
use crate::frame_mux::FrameMux;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

/// Requested capture quality, mapped to producer arguments
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamQuality {
    Low,
    #[default]
    Medium,
    High,
}

impl StreamQuality {
    fn producer_args(&self) -> &'static [&'static str] {
        match self {
            StreamQuality::Low => &["--width", "640", "--height", "480", "--framerate", "10"],
            StreamQuality::Medium => &["--width", "1280", "--height", "720", "--framerate", "15"],
            StreamQuality::High => &["--width", "1920", "--height", "1080", "--framerate", "20"],
        }
    }
}

/// StreamManager configuration
#[derive(Debug, Clone)]
pub struct StreamManagerConfig {
    /// Base producer command; quality args are appended
    pub camera_cmd: String,
    /// How long the producer has to deliver its first complete frame
    pub startup_timeout: Duration,
    /// Idle grace window after the last viewer detaches
    pub idle_grace: Duration,
}

impl Default for StreamManagerConfig {
    fn default() -> Self {
        Self {
            camera_cmd: "rpicam-vid -t 0 --codec mjpeg --inline -n -o -".to_string(),
            startup_timeout: Duration::from_secs(5),
            idle_grace: Duration::from_secs(10),
        }
    }
}

/// Running producer process plus its pump task
struct Producer {
    quality: StreamQuality,
    generation: u64,
    child: tokio::process::Child,
    pump: JoinHandle<()>,
    first_frame_rx: watch::Receiver<bool>,
}

/// Demand accounting. Owned by the manager, mutated only under its lock.
/// `epoch` advances whenever the count is reset out from under the
/// outstanding leases (producer crash); leases from an older epoch no
/// longer represent live demand and their drops are ignored.
struct Demand {
    viewers: usize,
    epoch: u64,
    idle_timer: Option<JoinHandle<()>>,
    producer: Option<Producer>,
    spawn_count: u64,
}

struct StreamInner {
    config: StreamManagerConfig,
    frame_mux: Arc<FrameMux>,
    demand: Mutex<Demand>,
}

/// StreamManager instance
pub struct StreamManager {
    inner: Arc<StreamInner>,
}

/// Live stream demand - dropping it releases the viewer reference
pub struct StreamLease {
    inner: Arc<StreamInner>,
    epoch: u64,
}

impl Drop for StreamLease {
    fn drop(&mut self) {
        let inner = Arc::clone(&self.inner);
        let epoch = self.epoch;
        tokio::spawn(async move {
            StreamInner::release(inner, epoch).await;
        });
    }
}

impl StreamManager {
    /// Create new StreamManager
    pub fn new(config: StreamManagerConfig, frame_mux: Arc<FrameMux>) -> Self {
        Self {
            inner: Arc::new(StreamInner {
                config,
                frame_mux,
                demand: Mutex::new(Demand {
                    viewers: 0,
                    epoch: 0,
                    idle_timer: None,
                    producer: None,
                    spawn_count: 0,
                }),
            }),
        }
    }

    /// Take one unit of stream demand. Ensures the producer is running at
    /// the requested quality (respawning on a quality change) and has
    /// delivered at least one frame, or fails with a startup error.
    pub async fn acquire(&self, quality: Option<StreamQuality>) -> Result<StreamLease> {
        let (mut ready_rx, generation, epoch) = {
            let mut demand = self.inner.demand.lock().await;

            // A new viewer always cancels a pending idle shutdown.
            if let Some(timer) = demand.idle_timer.take() {
                timer.abort();
            }

            let respawn = match &demand.producer {
                None => true,
                Some(p) => quality.is_some_and(|q| q != p.quality),
            };
            if respawn {
                if let Some(p) = demand.producer.take() {
                    tracing::info!(
                        from = ?p.quality,
                        to = ?quality,
                        "Quality change, respawning video producer"
                    );
                    stop_producer(p);
                }
                self.inner
                    .spawn_producer(&mut demand, quality.unwrap_or_default())?;
            }

            let producer = demand
                .producer
                .as_ref()
                .ok_or_else(|| Error::Internal("producer missing after spawn".to_string()))?;
            let watch = (
                producer.first_frame_rx.clone(),
                producer.generation,
                demand.epoch,
            );

            demand.viewers += 1;
            tracing::info!(viewers = demand.viewers, "Stream demand up");
            watch
        };

        // Demand is held through the lease while we wait, so the idle
        // timer cannot fire underneath us.
        let lease = StreamLease {
            inner: Arc::clone(&self.inner),
            epoch,
        };

        let became_ready = timeout(self.inner.config.startup_timeout, async {
            loop {
                if *ready_rx.borrow_and_update() {
                    return true;
                }
                if ready_rx.changed().await.is_err() {
                    // Pump ended before the first frame.
                    return false;
                }
            }
        })
        .await;

        match became_ready {
            Ok(true) => Ok(lease),
            _ => {
                drop(lease);
                let mut demand = self.inner.demand.lock().await;
                if demand
                    .producer
                    .as_ref()
                    .is_some_and(|p| p.generation == generation)
                {
                    if let Some(p) = demand.producer.take() {
                        stop_producer(p);
                    }
                }
                Err(Error::StreamStartup(
                    "video producer delivered no frame within the startup window".to_string(),
                ))
            }
        }
    }

    /// Current demand count
    pub async fn viewer_demand(&self) -> usize {
        self.inner.demand.lock().await.viewers
    }

    /// Whether the producer process is currently running
    pub async fn producer_running(&self) -> bool {
        self.inner.demand.lock().await.producer.is_some()
    }

    /// Quality of the running producer, if any
    pub async fn active_quality(&self) -> Option<StreamQuality> {
        self.inner
            .demand
            .lock()
            .await
            .producer
            .as_ref()
            .map(|p| p.quality)
    }

    #[cfg(test)]
    async fn spawn_count(&self) -> u64 {
        self.inner.demand.lock().await.spawn_count
    }
}

impl StreamInner {
    /// Spawn the producer and its stdout pump. Caller holds the demand lock.
    fn spawn_producer(self: &Arc<Self>, demand: &mut Demand, quality: StreamQuality) -> Result<()> {
        demand.spawn_count += 1;
        let generation = demand.spawn_count;

        let mut parts = self.config.camera_cmd.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| Error::Validation("empty camera command".to_string()))?;

        let mut child = Command::new(program)
            .args(parts)
            .args(quality.producer_args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Process(format!("camera producer spawn failed: {}", e)))?;

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Process("camera producer stdout unavailable".to_string()))?;

        let (first_frame_tx, first_frame_rx) = watch::channel(false);
        let inner = Arc::clone(self);
        let pump = tokio::spawn(async move {
            // This stream does not continue the previous producer's bytes.
            inner.frame_mux.reset_partial().await;
            let mut chunk = [0u8; 8192];
            loop {
                match stdout.read(&mut chunk).await {
                    Ok(0) => break,
                    Ok(n) => {
                        if inner.frame_mux.ingest(&chunk[..n]).await > 0 {
                            let seen_before = first_frame_tx.send_replace(true);
                            if !seen_before {
                                tracing::info!(generation = generation, "First frame from producer");
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Producer stdout read failed");
                        break;
                    }
                }
            }
            inner.producer_exited(generation).await;
        });

        tracing::info!(
            generation = generation,
            quality = ?quality,
            command = %self.config.camera_cmd,
            "Video producer spawned"
        );

        demand.producer = Some(Producer {
            quality,
            generation,
            child,
            pump,
            first_frame_rx,
        });
        Ok(())
    }

    /// Pump ended: if this generation is still the live producer, the exit
    /// was unexpected. Clear every viewer and reset demand accounting.
    async fn producer_exited(self: &Arc<Self>, generation: u64) {
        {
            let mut demand = self.demand.lock().await;
            let live = demand
                .producer
                .as_ref()
                .is_some_and(|p| p.generation == generation);
            if !live {
                return;
            }

            let mut producer = demand.producer.take().expect("checked above");
            let _ = producer.child.start_kill();
            // Outstanding leases were counted against the demand we are
            // about to reset; advancing the epoch voids their drops.
            demand.viewers = 0;
            demand.epoch += 1;
            if let Some(timer) = demand.idle_timer.take() {
                timer.abort();
            }
        }
        self.frame_mux.clear_viewers().await;
        tracing::warn!(
            generation = generation,
            "Video producer exited unexpectedly, demand reset"
        );
    }

    /// Lease dropped: decrement demand; a transition to zero arms the
    /// idle grace timer. Leases predating a demand reset no longer hold
    /// a unit of the current count and are ignored.
    async fn release(inner: Arc<Self>, epoch: u64) {
        let mut demand = inner.demand.lock().await;
        if demand.epoch != epoch {
            tracing::debug!("Stale stream lease dropped after demand reset, ignored");
            return;
        }
        demand.viewers = demand.viewers.saturating_sub(1);
        tracing::info!(viewers = demand.viewers, "Stream demand down");

        if demand.viewers == 0 && demand.producer.is_some() {
            if let Some(timer) = demand.idle_timer.take() {
                timer.abort();
            }
            let timer_inner = Arc::clone(&inner);
            demand.idle_timer = Some(tokio::spawn(async move {
                sleep(timer_inner.config.idle_grace).await;
                let mut demand = timer_inner.demand.lock().await;
                if demand.viewers == 0 {
                    if let Some(p) = demand.producer.take() {
                        stop_producer(p);
                        tracing::info!("Idle grace elapsed, video producer stopped");
                    }
                    demand.idle_timer = None;
                }
            }));
        }
    }
}

/// Stop a producer we own: abort its pump first so the exit is not
/// treated as unexpected, then kill the child.
fn stop_producer(mut producer: Producer) {
    producer.pump.abort();
    if let Err(e) = producer.child.start_kill() {
        tracing::debug!(error = %e, "Producer already gone");
    }
    tracing::info!(generation = producer.generation, "Video producer stopped");
}
