//! WebSocket notification transport and read-only REST API.
//!
//! The WebSocket endpoint (`/ws`) upgrades, registers the subscriber
//! with the hub, and then runs two halves: a writer that drains the
//! connection's outbound queue (and pings idle sockets), and a reader
//! that handles client frames. The REST API is read-only status data;
//! notifications enter the system through the hub, not through HTTP.
//!
//! Subscriber identity comes from the session layer in front of this
//! service; here it is accepted as a `user_id` query parameter or an
//! `x-user-id` header.

use std::sync::{Arc, OnceLock};
use std::time::{Duration, SystemTime};

use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;

use crate::connection::Connection;
use crate::envelope::{Envelope, FrameKind};
use crate::hub::Hub;
use crate::stats::StatsSnapshot;
use crate::types::UserId;

// ── Axum router ────────────────────────────────────────────────────────

/// Build the axum router with the WebSocket and REST endpoints.
pub fn router(hub: Arc<Hub>) -> Router {
    Router::new()
        .route("/ws", get(ws_subscribe))
        .route("/api/v1/health", get(api_health))
        .route("/api/v1/stats", get(api_stats))
        .route("/api/v1/online", get(api_online))
        .layer(CorsLayer::permissive())
        .with_state(hub)
}

// ── WebSocket handler ──────────────────────────────────────────────────

#[derive(Deserialize)]
struct SubscribeQuery {
    user_id: Option<String>,
}

fn identify(query: &SubscribeQuery, headers: &HeaderMap) -> Option<UserId> {
    let raw = query.user_id.clone().or_else(|| {
        headers
            .get("x-user-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    })?;
    raw.parse().ok()
}

async fn ws_subscribe(
    ws: WebSocketUpgrade,
    Query(query): Query<SubscribeQuery>,
    headers: HeaderMap,
    State(hub): State<Arc<Hub>>,
) -> Response {
    let Some(user_id) = identify(&query, &headers) else {
        tracing::warn!("WebSocket subscribe rejected: no usable user id");
        return StatusCode::UNAUTHORIZED.into_response();
    };
    ws.on_upgrade(move |socket| handle_socket(socket, hub, user_id))
        .into_response()
}

async fn handle_socket(mut socket: WebSocket, hub: Arc<Hub>, user_id: UserId) {
    let (conn, outbound) = match hub.connect(user_id).await {
        Ok(pair) => pair,
        Err(e) => {
            tracing::warn!(user = %user_id, "Subscribe refused: {e}");
            let _ = socket
                .send(WsMessage::Close(Some(CloseFrame {
                    code: 1013, // try again later
                    reason: "unavailable".into(),
                })))
                .await;
            return;
        }
    };
    tracing::info!(user = %user_id, conn = conn.conn_id(), "Subscriber connected");

    let (sink, stream) = socket.split();
    let mut writer = tokio::spawn(write_loop(sink, conn.clone(), outbound, hub.clone()));
    read_loop(stream, &conn, &hub).await;

    conn.close();
    hub.disconnect(&conn);
    // The writer normally exits as soon as it observes the close; a sink
    // blocked on a dead peer gets cut off instead.
    if tokio::time::timeout(WRITER_DRAIN_GRACE, &mut writer)
        .await
        .is_err()
    {
        writer.abort();
    }
    tracing::info!(user = %user_id, conn = conn.conn_id(), "Subscriber disconnected");
}

/// How long a closed connection's writer may keep the handler waiting
/// before it is cut off.
const WRITER_DRAIN_GRACE: Duration = Duration::from_secs(5);

/// Drains the outbound queue onto the socket, pinging sockets that had
/// no outbound payload for a whole ping interval. Exits on write
/// failure or once the connection is closed; dropping the queue
/// receiver is what marks the transport drained.
async fn write_loop(
    mut sink: SplitSink<WebSocket, WsMessage>,
    conn: Arc<Connection>,
    mut outbound: mpsc::Receiver<Envelope>,
    hub: Arc<Hub>,
) {
    let mut ping = tokio::time::interval(hub.config().ping_interval);
    ping.tick().await; // skip first tick
    let mut wrote_since_tick = false;
    loop {
        tokio::select! {
            maybe = outbound.recv() => {
                let Some(envelope) = maybe else { break };
                if !write_frame(&mut sink, &conn, &hub, &envelope).await {
                    return;
                }
                wrote_since_tick = true;
            }
            _ = conn.closed() => break,
            _ = ping.tick() => {
                if wrote_since_tick {
                    wrote_since_tick = false;
                } else if !write_frame(&mut sink, &conn, &hub, &Envelope::ping()).await {
                    return;
                }
            }
        }
    }
    // Flush whatever was queued before the close.
    while let Ok(envelope) = outbound.try_recv() {
        if !write_frame(&mut sink, &conn, &hub, &envelope).await {
            return;
        }
    }
    let _ = sink.send(WsMessage::Close(None)).await;
}

async fn write_frame(
    sink: &mut SplitSink<WebSocket, WsMessage>,
    conn: &Connection,
    hub: &Hub,
    envelope: &Envelope,
) -> bool {
    let text = match serde_json::to_string(envelope) {
        Ok(text) => text,
        Err(e) => {
            tracing::warn!(user = %conn.user_id(), "Envelope serialize failed: {e}");
            return true; // drop the frame, keep the socket
        }
    };
    match sink.send(WsMessage::Text(text.into())).await {
        Ok(()) => {
            conn.touch();
            true
        }
        Err(e) => {
            hub.counters().record_error();
            tracing::debug!(user = %conn.user_id(), "Write error: {e}");
            false
        }
    }
}

/// Consume client frames until the socket or the connection dies.
async fn read_loop(mut stream: SplitStream<WebSocket>, conn: &Arc<Connection>, hub: &Arc<Hub>) {
    loop {
        let frame = tokio::select! {
            frame = stream.next() => frame,
            _ = conn.closed() => break,
        };
        match frame {
            Some(Ok(WsMessage::Text(text))) => {
                conn.touch();
                hub.counters().record_received();
                match Envelope::parse(&text) {
                    Ok(envelope) => handle_client_frame(conn, envelope),
                    Err(e) => {
                        tracing::debug!(user = %conn.user_id(), "Unparseable frame: {e}");
                    }
                }
            }
            Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_))) => conn.touch(),
            Some(Ok(WsMessage::Close(_))) | None => break,
            Some(Ok(_)) => {} // binary frames ignored
            Some(Err(e)) => {
                hub.counters().record_error();
                tracing::debug!(user = %conn.user_id(), "Read error: {e}");
                break;
            }
        }
    }
}

fn handle_client_frame(conn: &Connection, envelope: Envelope) {
    match envelope.kind {
        FrameKind::Ping => {
            if conn.send(Envelope::pong()).is_err() {
                tracing::debug!(user = %conn.user_id(), "Pong dropped, outbound queue unavailable");
            }
        }
        FrameKind::Pong => {}
        FrameKind::Notification => {
            tracing::debug!(user = %conn.user_id(), "Ignoring client-sent notification");
        }
    }
}

// ── REST types ─────────────────────────────────────────────────────────

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    active_connections: u64,
    uptime_secs: u64,
}

#[derive(Serialize)]
struct OnlineResponse {
    count: usize,
    online: Vec<UserId>,
}

// ── REST handlers ──────────────────────────────────────────────────────

/// Server start time (set once on first call).
static START_TIME: OnceLock<SystemTime> = OnceLock::new();

async fn api_health(State(hub): State<Arc<Hub>>) -> Json<HealthResponse> {
    let start = START_TIME.get_or_init(SystemTime::now);
    let uptime = start.elapsed().unwrap_or_default().as_secs();
    Json(HealthResponse {
        status: "ok",
        active_connections: hub.stats().active_connections,
        uptime_secs: uptime,
    })
}

async fn api_stats(State(hub): State<Arc<Hub>>) -> Json<StatsSnapshot> {
    Json(hub.stats())
}

async fn api_online(State(hub): State<Arc<Hub>>) -> Json<OnlineResponse> {
    let online = hub.list_online();
    Json(OnlineResponse {
        count: online.len(),
        online,
    })
}
