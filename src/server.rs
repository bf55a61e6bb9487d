// src/server.rs
//
// HTTP and WebSocket surface. Handlers only read what the processing loop
// publishes; nothing here touches the camera or the classifier.

use crate::monitor::MonitorOutputs;
use crate::persistence::ReservationStore;
use crate::pipeline::MetricsSummary;
use crate::spots::SpotLayout;
use crate::types::{PlateEvent, Reservation, Snapshot, SpotRuntimeState};
use anyhow::{Context, Result};
use axum::{
    body::Body,
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use bytes::Bytes;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

const MJPEG_BOUNDARY: &str = "frame";
const MJPEG_CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

pub struct AppState {
    pub outputs: MonitorOutputs,
    pub layout: Arc<SpotLayout>,
    pub store: Arc<dyn ReservationStore>,
    pub stream_interval: Duration,
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/parking", get(parking))
        .route("/parking/:spot", get(parking_spot))
        .route("/ws", get(ws_endpoint))
        .route("/video_feed", get(video_feed))
        .route("/plate_events", get(plate_events))
        .route("/api/reservations", get(reservations))
        .route("/api/metrics", get(metrics))
        .with_state(state)
}

pub async fn serve<F>(state: Arc<AppState>, addr: &str, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!("🌐 HTTP server listening on http://{}", addr);

    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("HTTP server failed")
}

async fn parking(State(state): State<Arc<AppState>>) -> Json<Snapshot> {
    Json(state.outputs.store.snapshot())
}

async fn parking_spot(
    State(state): State<Arc<AppState>>,
    Path(raw): Path<String>,
) -> Result<Json<SpotRuntimeState>, StatusCode> {
    let name = state
        .layout
        .resolve_spot_name(&raw)
        .ok_or(StatusCode::NOT_FOUND)?;
    state
        .outputs
        .store
        .get(name)
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

async fn plate_events(State(state): State<Arc<AppState>>) -> Json<Vec<PlateEvent>> {
    Json(state.outputs.plate_events.recent())
}

async fn reservations(State(state): State<Arc<AppState>>) -> Json<Vec<Reservation>> {
    Json(
        state
            .outputs
            .reservations
            .refresh(state.store.as_ref())
            .await,
    )
}

async fn metrics(State(state): State<Arc<AppState>>) -> Json<MetricsSummary> {
    Json(state.outputs.metrics.summary())
}

// ============================================================================
// STREAMING
// ============================================================================

fn mjpeg_part(jpeg: &[u8]) -> Bytes {
    let head = format!(
        "--{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        MJPEG_BOUNDARY,
        jpeg.len()
    );
    let mut part = Vec::with_capacity(head.len() + jpeg.len() + 2);
    part.extend_from_slice(head.as_bytes());
    part.extend_from_slice(jpeg);
    part.extend_from_slice(b"\r\n");
    Bytes::from(part)
}

/// Re-serves the latest annotated frame at a fixed cadence until the client
/// goes away.
async fn video_feed(State(state): State<Arc<AppState>>) -> Response {
    let stream = futures::stream::unfold(state, |state| async move {
        loop {
            tokio::time::sleep(state.stream_interval).await;
            if let Some(frame) = state.outputs.frames.latest() {
                let part = mjpeg_part(&frame.jpeg);
                return Some((Ok::<_, Infallible>(part), state));
            }
        }
    });

    (
        [
            (header::CONTENT_TYPE, MJPEG_CONTENT_TYPE),
            (header::CACHE_CONTROL, "no-cache, no-store, must-revalidate"),
            (header::PRAGMA, "no-cache"),
            (header::EXPIRES, "0"),
        ],
        Body::from_stream(stream),
    )
        .into_response()
}

async fn ws_endpoint(State(state): State<Arc<AppState>>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| ws_session(socket, state))
}

async fn send_snapshot(
    sender: &mut SplitSink<WebSocket, Message>,
    snapshot: &Snapshot,
) -> Result<()> {
    let text = serde_json::to_string(snapshot)?;
    sender.send(Message::Text(text)).await?;
    Ok(())
}

/// Current snapshot first, then every published one until either side
/// closes. A session the broadcaster dropped just ends.
async fn ws_session(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let broadcaster = &state.outputs.broadcaster;
    let mut subscription = broadcaster.subscribe();
    debug!("WebSocket session {} opened", subscription.id);

    if send_snapshot(&mut sender, &state.outputs.store.snapshot())
        .await
        .is_ok()
    {
        loop {
            tokio::select! {
                next = subscription.rx.recv() => {
                    let Some(snapshot) = next else {
                        debug!("Session {} dropped by broadcaster", subscription.id);
                        break;
                    };
                    if let Err(e) = send_snapshot(&mut sender, &snapshot).await {
                        debug!("WebSocket send error: {:#}", e);
                        break;
                    }
                }
                incoming = receiver.next() => {
                    match incoming {
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Err(e)) => {
                            debug!("WebSocket receive error: {}", e);
                            break;
                        }
                        Some(Ok(_)) => {}
                    }
                }
            }
        }
    }

    broadcaster.unsubscribe(subscription.id);
    debug!("WebSocket session {} closed", subscription.id);
}
