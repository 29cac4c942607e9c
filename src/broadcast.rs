// src/broadcast.rs
//
// Last-frame-wins broadcast hub. Camera workers overwrite one JPEG slot
// per channel; every connected viewer is served from that slot on its own
// task, so viewer count never back-pressures the producers.

use crate::pipeline::metrics::PipelineMetrics;
use anyhow::{Context, Result};
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

const BOUNDARY: &str = "frame";
/// How long a viewer waits before re-reading an empty slot.
const EMPTY_SLOT_WAIT: Duration = Duration::from_millis(50);

pub struct BroadcastHub {
    frames: Mutex<HashMap<String, Option<Bytes>>>,
    running: AtomicBool,
    /// Pause between frames written to one viewer.
    poll_interval: Duration,
    metrics: Arc<PipelineMetrics>,
}

impl BroadcastHub {
    pub fn new(poll_interval: Duration, metrics: Arc<PipelineMetrics>) -> Self {
        Self {
            frames: Mutex::new(HashMap::new()),
            running: AtomicBool::new(true),
            poll_interval,
            metrics,
        }
    }

    /// Announce a channel before its worker produces anything, so the
    /// index lists it from the start.
    pub fn register_channel(&self, channel: &str) {
        self.frames.lock().entry(channel.to_string()).or_insert(None);
    }

    /// Overwrite the channel's latest frame. O(1), never blocks on viewers.
    pub fn update(&self, channel: &str, frame: Bytes) {
        self.frames.lock().insert(channel.to_string(), Some(frame));
        self.metrics.inc(&self.metrics.frames_published);
    }

    pub fn latest(&self, channel: &str) -> Option<Bytes> {
        self.frames.lock().get(channel).cloned().flatten()
    }

    pub fn has_channel(&self, channel: &str) -> bool {
        self.frames.lock().contains_key(channel)
    }

    pub fn channels(&self) -> Vec<String> {
        let mut names: Vec<String> = self.frames.lock().keys().cloned().collect();
        names.sort_unstable();
        names
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Ends all viewer streams at their next poll.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Relaxed);
    }
}

/// One boundary-delimited part of a multipart MJPEG response.
fn mjpeg_part(frame: &Bytes) -> Bytes {
    let header = format!(
        "--{BOUNDARY}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        frame.len()
    );
    let mut part = Vec::with_capacity(header.len() + frame.len() + 2);
    part.extend_from_slice(header.as_bytes());
    part.extend_from_slice(frame);
    part.extend_from_slice(b"\r\n");
    Bytes::from(part)
}

struct ServerCtx {
    hub: Arc<BroadcastHub>,
    metrics: Arc<PipelineMetrics>,
}

/// Run the viewer-facing HTTP server until the shutdown signal fires.
pub async fn serve(
    hub: Arc<BroadcastHub>,
    metrics: Arc<PipelineMetrics>,
    port: u16,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let ctx = Arc::new(ServerCtx { hub, metrics });
    let app = Router::new()
        .route("/", get(index_handler))
        .route("/metrics", get(metrics_handler))
        .route("/:stream", get(stream_handler))
        .with_state(ctx);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("failed to bind viewer port {port}"))?;
    info!("MJPEG server listening on port {port}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await
        .context("viewer server failed")
}

async fn index_handler(State(ctx): State<Arc<ServerCtx>>) -> Html<String> {
    let items: String = ctx
        .hub
        .channels()
        .iter()
        .map(|name| format!("<li><a href=\"/{name}.mjpg\">{name}</a></li>"))
        .collect();
    Html(format!(
        "<html><body><h3>Live MJPEG streams</h3><ul>{items}</ul></body></html>"
    ))
}

async fn metrics_handler(State(ctx): State<Arc<ServerCtx>>) -> impl IntoResponse {
    Json(ctx.metrics.summary())
}

async fn stream_handler(
    State(ctx): State<Arc<ServerCtx>>,
    Path(stream): Path<String>,
) -> Response {
    let channel = stream.trim_end_matches(".mjpg").to_string();
    if !ctx.hub.has_channel(&channel) {
        return (StatusCode::NOT_FOUND, "unknown channel").into_response();
    }
    debug!("viewer connected to channel {channel}");

    let hub = Arc::clone(&ctx.hub);
    let body = async_stream::stream! {
        while hub.is_running() {
            match hub.latest(&channel) {
                Some(frame) => {
                    yield Ok::<Bytes, std::convert::Infallible>(mjpeg_part(&frame));
                    tokio::time::sleep(hub.poll_interval).await;
                }
                None => tokio::time::sleep(EMPTY_SLOT_WAIT).await,
            }
        }
    };

    (
        [
            (
                header::CONTENT_TYPE,
                format!("multipart/x-mixed-replace; boundary={BOUNDARY}"),
            ),
            (header::CACHE_CONTROL, "no-cache, private".to_string()),
        ],
        Body::from_stream(body),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn hub() -> Arc<BroadcastHub> {
        Arc::new(BroadcastHub::new(
            Duration::from_millis(10),
            Arc::new(PipelineMetrics::new()),
        ))
    }

    #[test]
    fn latest_frame_wins() {
        let hub = hub();
        hub.register_channel("cam_1");
        hub.update("cam_1", Bytes::from_static(b"F1"));
        hub.update("cam_1", Bytes::from_static(b"F2"));
        hub.update("cam_1", Bytes::from_static(b"F3"));

        // a viewer connecting now sees only the newest frame
        assert_eq!(hub.latest("cam_1").unwrap().as_ref(), b"F3");
    }

    #[test]
    fn registered_channel_is_listed_before_first_frame() {
        let hub = hub();
        hub.register_channel("cam_b");
        hub.register_channel("cam_a");
        assert_eq!(hub.channels(), vec!["cam_a", "cam_b"]);
        assert!(hub.latest("cam_a").is_none());
        assert!(hub.has_channel("cam_a"));
        assert!(!hub.has_channel("cam_c"));
    }

    #[test]
    fn update_is_not_blocked_by_concurrent_readers() {
        let hub = hub();
        hub.register_channel("cam_1");
        hub.update("cam_1", Bytes::from_static(b"seed"));

        let readers: Vec<_> = (0..8)
            .map(|_| {
                let hub = Arc::clone(&hub);
                thread::spawn(move || {
                    for _ in 0..200 {
                        let _ = hub.latest("cam_1");
                    }
                })
            })
            .collect();

        for i in 0..200u32 {
            hub.update("cam_1", Bytes::from(i.to_be_bytes().to_vec()));
        }
        for r in readers {
            r.join().unwrap();
        }
        assert_eq!(hub.latest("cam_1").unwrap().as_ref(), 199u32.to_be_bytes());
    }

    #[test]
    fn mjpeg_part_is_boundary_delimited() {
        let part = mjpeg_part(&Bytes::from_static(b"JPEGDATA"));
        let text = String::from_utf8_lossy(&part);
        assert!(text.starts_with("--frame\r\n"));
        assert!(text.contains("Content-Type: image/jpeg\r\n"));
        assert!(text.contains("Content-Length: 8\r\n\r\nJPEGDATA"));
        assert!(text.ends_with("\r\n"));
    }

    #[tokio::test]
    async fn stream_ends_after_shutdown() {
        use futures_util::StreamExt;

        let hub = hub();
        hub.register_channel("cam_1");
        hub.update("cam_1", Bytes::from_static(b"F"));

        let h = Arc::clone(&hub);
        let channel = "cam_1".to_string();
        let mut body = Box::pin(async_stream::stream! {
            while h.is_running() {
                match h.latest(&channel) {
                    Some(frame) => {
                        yield mjpeg_part(&frame);
                        tokio::time::sleep(Duration::from_millis(1)).await;
                    }
                    None => tokio::time::sleep(Duration::from_millis(1)).await,
                }
            }
        });

        assert!(body.next().await.is_some());
        hub.shutdown();
        // drain at most a few in-flight parts, then the stream must end
        for _ in 0..3 {
            if body.next().await.is_none() {
                return;
            }
        }
        panic!("stream did not terminate after shutdown");
    }
}
