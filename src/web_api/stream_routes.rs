//! MJPEG Stream Route
//!
//! Serves `multipart/x-mixed-replace` video. Each connection holds one
//! viewer slot on the FrameMux and one demand lease on the
//! StreamManager; both are released when the client disconnects and the
//! response body is dropped.

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::header;
use axum::response::Response;
use bytes::Bytes;
use futures::Stream;
use serde::Deserialize;
use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::frame_mux::{FrameMux, PART_BOUNDARY};
use crate::state::AppState;
use crate::stream_manager::{StreamLease, StreamQuality};

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    pub quality: Option<StreamQuality>,
}

/// GET /camera/stream?quality=low|medium|high
pub async fn camera_stream(
    State(state): State<AppState>,
    Query(query): Query<StreamQuery>,
) -> Result<Response> {
    let lease = state.stream.acquire(query.quality).await?;
    let (viewer_id, rx) = state.frame_mux.attach().await;
    tracing::info!(viewer_id = %viewer_id, "Stream client connected");

    let body = Body::from_stream(ViewerStream {
        rx,
        viewer_id,
        mux: Arc::clone(&state.frame_mux),
        _lease: lease,
    });

    Response::builder()
        .header(
            header::CONTENT_TYPE,
            format!("multipart/x-mixed-replace; boundary={}", PART_BOUNDARY),
        )
        .header(header::CACHE_CONTROL, "no-cache")
        .body(body)
        .map_err(|e| Error::Internal(format!("stream response: {}", e)))
}

/// Body stream for one viewer. The channel closes when the producer dies
/// or the viewer is detached server-side; either ends the response.
struct ViewerStream {
    rx: mpsc::Receiver<Bytes>,
    viewer_id: Uuid,
    mux: Arc<FrameMux>,
    _lease: StreamLease,
}

impl Stream for ViewerStream {
    type Item = std::result::Result<Bytes, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx).map(|part| part.map(Ok))
    }
}

impl Drop for ViewerStream {
    fn drop(&mut self) {
        tracing::info!(viewer_id = %self.viewer_id, "Stream client disconnected");
        let mux = Arc::clone(&self.mux);
        let id = self.viewer_id;
        tokio::spawn(async move {
            mux.detach(&id).await;
        });
    }
}
