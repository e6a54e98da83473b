//! WebSocket transport
//!
//! One socket per client. The handshake is authorized after the upgrade, so
//! a rejected client still gets a `disconnect` frame explaining why. Each
//! socket gets a writer task that drains the connection's outbound queue and
//! sends heartbeats; the reader feeds decoded frames to the multiplexer.

use crate::auth::{AdminKey, HandshakeContext};
use crate::hub::Hub;
use crate::server::connection::{Connection, OutboundMessage, OutboundReceiver};
use crate::server::frames::{decode_frame, encode_frame, ServerFrame};

use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, Query, State, WebSocketUpgrade,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::{interval_at, Instant};
use tracing::{debug, info, warn};

/// How long the writer gets to flush after the reader stops
const WRITER_GRACE: Duration = Duration::from_secs(1);

/// Shared state for WebSocket handlers
#[derive(Clone)]
pub struct WsState {
    pub hub: Arc<Hub>,
    /// Enables `POST /broadcast`
    pub admin_key: Option<AdminKey>,
}

/// Create the HTTP router
pub fn create_router(state: WsState) -> Router {
    Router::new()
        .route("/cable", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/broadcast", post(broadcast_handler))
        .with_state(state)
}

async fn health_handler(State(state): State<WsState>) -> Json<Value> {
    let hub = &state.hub;
    Json(json!({
        "status": "ok",
        "node_id": hub.node_id().to_string(),
        "connections": hub.registry().count(),
        "topics": hub.table().topic_count(),
        "relay_degraded": hub.relay().map(|r| r.is_degraded()),
    }))
}

#[derive(Debug, Deserialize)]
struct BroadcastRequest {
    topic: String,
    #[serde(default)]
    payload: Value,
}

async fn broadcast_handler(
    State(state): State<WsState>,
    headers: HeaderMap,
    Json(request): Json<BroadcastRequest>,
) -> Response {
    let Some(admin_key) = state.admin_key.as_ref() else {
        return (StatusCode::NOT_FOUND, "broadcast endpoint disabled").into_response();
    };

    match bearer_token(&headers) {
        Some(token) if admin_key.matches(token) => {}
        _ => return (StatusCode::UNAUTHORIZED, "invalid admin key").into_response(),
    }

    match state.hub.publish(&request.topic, request.payload) {
        Ok(report) => {
            debug!(topic = %request.topic, delivered = report.delivered, "HTTP broadcast");
            Json(report.to_json()).into_response()
        }
        Err(e) => (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<WsState>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let handshake = handshake_context(params, &headers, Some(remote_addr));
    ws.on_upgrade(move |socket| handle_socket(socket, state, handshake))
}

/// Token from the `token` query parameter, else from the Authorization header
fn handshake_context(
    mut params: HashMap<String, String>,
    headers: &HeaderMap,
    remote_addr: Option<SocketAddr>,
) -> HandshakeContext {
    let token = params
        .remove("token")
        .or_else(|| bearer_token(headers).map(str::to_string));

    HandshakeContext {
        token,
        remote_addr,
        params,
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

async fn send_frame(sender: &mut SplitSink<WebSocket, Message>, frame: &ServerFrame) -> bool {
    match encode_frame(frame) {
        Ok(text) => sender.send(Message::Text(text.into())).await.is_ok(),
        Err(e) => {
            warn!(error = %e, "Failed to encode frame");
            true
        }
    }
}

async fn handle_socket(socket: WebSocket, state: WsState, handshake: HandshakeContext) {
    let (mut sender, mut receiver) = socket.split();
    let hub = state.hub;
    let mux = hub.multiplexer();

    let (conn, rx) = match mux.accept_connection(handshake).await {
        Ok(accepted) => accepted,
        Err(e) => {
            info!(error = %e, "WebSocket handshake rejected");
            let _ = send_frame(&mut sender, &ServerFrame::Disconnect {
                reason: "unauthorized".to_string(),
            })
            .await;
            let _ = sender.send(Message::Close(None)).await;
            return;
        }
    };

    let conn_id = conn.id();
    let mut writer = tokio::spawn(run_writer(sender, rx, hub.config().heartbeat_interval));
    let mut writer_done = false;

    loop {
        tokio::select! {
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Text(text))) => handle_text(&hub, &conn, text.as_str()).await,
                Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                    Ok(text) => handle_text(&hub, &conn, text).await,
                    Err(_) => warn!(conn_id = %conn_id, "Ignoring non UTF-8 binary frame"),
                },
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                    // Handled automatically by axum
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    warn!(conn_id = %conn_id, error = %e, "WebSocket error");
                    break;
                }
            },
            _ = &mut writer => {
                writer_done = true;
                break;
            }
        }
    }

    mux.close_connection(&conn, "client disconnected").await;
    drop(conn);

    if !writer_done && tokio::time::timeout(WRITER_GRACE, &mut writer).await.is_err() {
        writer.abort();
    }

    debug!(conn_id = %conn_id, "WebSocket client disconnected");
}

async fn handle_text(hub: &Hub, conn: &Arc<Connection>, text: &str) {
    let mux = hub.multiplexer();
    match decode_frame(text) {
        Ok(frame) => {
            let channel = frame.channel().to_string();
            if let Err(e) = mux.handle_frame(conn, frame).await {
                debug!(conn_id = %conn.id(), channel = %channel, error = %e, "Frame handling failed");
            }
        }
        Err(e) => {
            debug!(conn_id = %conn.id(), error = %e, "Undecodable frame");
            mux.reject_frame(conn, &e);
        }
    }
}

/// Drain the outbound queue into the socket, pinging on a fixed interval
async fn run_writer(
    mut sender: SplitSink<WebSocket, Message>,
    mut rx: OutboundReceiver,
    heartbeat: Duration,
) {
    let mut ticker = interval_at(Instant::now() + heartbeat, heartbeat);

    loop {
        tokio::select! {
            msg = rx.recv() => match msg {
                Some(OutboundMessage::Close { reason }) => {
                    let _ = send_frame(&mut sender, &ServerFrame::Disconnect { reason }).await;
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
                Some(msg) => {
                    if !send_frame(&mut sender, &msg.into_frame()).await {
                        break;
                    }
                }
                None => {
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
            },
            _ = ticker.tick() => {
                if !send_frame(&mut sender, &ServerFrame::Ping { message: unix_now() }).await {
                    break;
                }
            }
        }
    }
}

/// Serve the HTTP router until `shutdown` resolves
pub async fn run_websocket_server(
    bind_addr: SocketAddr,
    state: WsState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    info!(addr = %bind_addr, "WebSocket server listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;

    Ok(())
}
