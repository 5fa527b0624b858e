//! FrameMux - MJPEG Frame Fan-Out
//!
//! ## Responsibilities
//!
//! - Extract complete JPEG frames from the raw producer byte stream
//! - Cache the latest complete frame (new viewers get it immediately)
//! - Broadcast each frame to every attached viewer without blocking on
//!   slow ones
//!
//! Each viewer holds a bounded channel with a single slot. A full slot
//! means a write to that viewer is still in flight; the frame is dropped
//! for that viewer rather than queued. Slow consumers lose frames, the
//! server never buffers a backlog.

mod extractor;

pub use extractor::{FrameExtractor, EOI, SOI};

use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use tokio::sync::{mpsc, Mutex, RwLock};
use uuid::Uuid;

/// Multipart boundary token used on the egress side
pub const PART_BOUNDARY: &str = "frame";

/// An attached viewer: one in-flight part at a time
struct Viewer {
    id: Uuid,
    tx: mpsc::Sender<Bytes>,
}

/// FrameMux instance
pub struct FrameMux {
    extractor: Mutex<FrameExtractor>,
    viewers: RwLock<HashMap<Uuid, Viewer>>,
    /// Latest complete frame, already encoded as a multipart part
    latest: RwLock<Option<Bytes>>,
}

impl FrameMux {
    /// Create new FrameMux
    pub fn new() -> Self {
        Self {
            extractor: Mutex::new(FrameExtractor::new()),
            viewers: RwLock::new(HashMap::new()),
            latest: RwLock::new(None),
        }
    }

    /// Feed raw producer bytes. Returns the number of complete frames
    /// extracted from this chunk (the stream manager uses the first
    /// nonzero return as its readiness signal).
    pub async fn ingest(&self, chunk: &[u8]) -> usize {
        let frames = {
            let mut extractor = self.extractor.lock().await;
            extractor.push(chunk)
        };

        let count = frames.len();
        for frame in frames {
            let part = encode_part(&frame);
            {
                let mut latest = self.latest.write().await;
                *latest = Some(part.clone());
            }
            self.broadcast(part).await;
        }
        count
    }

    /// Register a new viewer. The cached latest frame (if any) is pushed
    /// into the fresh slot so the viewer does not wait for the next frame.
    pub async fn attach(&self) -> (Uuid, mpsc::Receiver<Bytes>) {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(1);

        if let Some(part) = self.latest.read().await.clone() {
            // Fresh channel, the single slot is empty
            let _ = tx.try_send(part);
        }

        let mut viewers = self.viewers.write().await;
        viewers.insert(id, Viewer { id, tx });
        tracing::info!(viewer_id = %id, total = viewers.len(), "Viewer attached");

        (id, rx)
    }

    /// Remove a viewer
    pub async fn detach(&self, id: &Uuid) {
        let mut viewers = self.viewers.write().await;
        if viewers.remove(id).is_some() {
            tracing::info!(viewer_id = %id, total = viewers.len(), "Viewer detached");
        }
    }

    /// Close every viewer channel (producer died); their HTTP streams end.
    pub async fn clear_viewers(&self) {
        let mut viewers = self.viewers.write().await;
        let dropped = viewers.len();
        viewers.clear();
        if dropped > 0 {
            tracing::warn!(dropped = dropped, "All viewers cleared");
        }
    }

    /// Current viewer count
    pub async fn viewer_count(&self) -> usize {
        self.viewers.read().await.len()
    }

    /// Whether at least one complete frame has been seen
    pub async fn has_frame(&self) -> bool {
        self.latest.read().await.is_some()
    }

    /// Drop any partial trailing fragment. A restarted producer emits a
    /// fresh byte stream; splicing its bytes onto a fragment of the old
    /// one would yield a corrupt hybrid frame. The cached complete frame
    /// stays valid and is kept.
    pub async fn reset_partial(&self) {
        let mut extractor = self.extractor.lock().await;
        let dropped = extractor.pending_len();
        extractor.clear();
        if dropped > 0 {
            tracing::debug!(dropped = dropped, "Partial frame discarded on stream restart");
        }
    }

    /// Send one encoded part to every viewer whose slot is free
    async fn broadcast(&self, part: Bytes) {
        let mut dead = Vec::new();
        {
            let viewers = self.viewers.read().await;
            for viewer in viewers.values() {
                match viewer.tx.try_send(part.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        // Viewer still busy with the previous part - skip
                        tracing::trace!(viewer_id = %viewer.id, "Viewer busy, frame dropped");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        dead.push(viewer.id);
                    }
                }
            }
        }

        if !dead.is_empty() {
            let mut viewers = self.viewers.write().await;
            for id in dead {
                if viewers.remove(&id).is_some() {
                    tracing::info!(viewer_id = %id, "Viewer gone, detached");
                }
            }
        }
    }
}

impl Default for FrameMux {
    fn default() -> Self {
        Self::new()
    }
}

/// Encode one frame as a multipart/x-mixed-replace part:
/// textual header naming content type and exact byte length, frame bytes,
/// then the separator.
fn encode_part(frame: &Bytes) -> Bytes {
    let header = format!(
        "--{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        PART_BOUNDARY,
        frame.len()
    );
    let mut part = BytesMut::with_capacity(header.len() + frame.len() + 2);
    part.extend_from_slice(header.as_bytes());
    part.extend_from_slice(frame);
    part.extend_from_slice(b"\r\n");
    part.freeze()
}
