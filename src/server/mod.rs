pub mod hub;
pub mod registry;
pub mod relay;
pub mod signaling;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::State,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::Config;
use crate::telemetry::{RelayStats, RelayStatsSnapshot};
use crate::wsproto::{self, ClientMessage, ServerMessage, WS_MAX_MESSAGE_BYTES};

use hub::{ConnectionHub, Outbound};
use registry::SessionRegistry;
use signaling::Signal;

/// Websocket-level keepalive sent by the server on every connection.
pub const WS_PING_INTERVAL: Duration = Duration::from_secs(20);

#[derive(Clone)]
struct ServerState {
    registry: SessionRegistry,
    hub: ConnectionHub,
    stats: Arc<RelayStats>,
}

/// A running server and the address it actually bound.
pub struct ServerStartResult {
    pub bound_addr: SocketAddr,
    pub registry: SessionRegistry,
    pub stats: Arc<RelayStats>,
    pub join: JoinHandle<()>,
}

#[derive(Debug, Clone, Default)]
pub struct ServeOptions {
    pub listen_addr: Option<String>,
    pub log_path: Option<PathBuf>,
}

/// Binds `addr` and serves `/ws` and `/v1/status` until `shutdown` fires.
pub async fn start_server(
    addr: &str,
    owner_grace: Duration,
    shutdown: Option<Arc<Notify>>,
) -> Result<ServerStartResult> {
    let requested: SocketAddr = addr
        .parse()
        .with_context(|| format!("invalid listen address '{addr}' (use a numeric IP)"))?;
    let listener = tokio::net::TcpListener::bind(requested)
        .await
        .with_context(|| format!("bind {requested}"))?;
    let bound_addr = listener.local_addr()?;

    let hub = ConnectionHub::new();
    let registry = SessionRegistry::new(hub.clone(), owner_grace);
    let stats = Arc::new(RelayStats::default());
    let state = ServerState {
        registry: registry.clone(),
        hub,
        stats: stats.clone(),
    };

    let app = Router::new()
        .route("/ws", get(ws_upgrade))
        .route("/v1/status", get(status))
        .with_state(state);

    let join = tokio::spawn(async move {
        let result = match shutdown {
            Some(shutdown) => {
                axum::serve(listener, app)
                    .with_graceful_shutdown(async move {
                        shutdown.notified().await;
                    })
                    .await
            }
            None => axum::serve(listener, app).await,
        };
        if let Err(e) = result {
            crate::logging::error(format!("server error: {}", e));
        }
        crate::logging::info("server stopped");
    });

    crate::logging::info_kv(
        "server listening",
        &[
            ("addr", &bound_addr.to_string()),
            ("owner_grace_secs", &owner_grace.as_secs().to_string()),
        ],
    );

    Ok(ServerStartResult {
        bound_addr,
        registry,
        stats,
        join,
    })
}

/// Runs the server on the current runtime until `shutdown` is notified.
pub async fn run_server_with_shutdown(
    cfg: Config,
    opts: ServeOptions,
    shutdown: Arc<Notify>,
) -> Result<()> {
    let log_path = opts.log_path.unwrap_or_else(|| cfg.log_file_path());
    crate::logging::init_log_file(&log_path)?;
    let addr = opts.listen_addr.unwrap_or_else(|| cfg.listen_addr.clone());
    crate::logging::info(format!(
        "server start version={} config={} log={}",
        env!("CARGO_PKG_VERSION"),
        cfg.config_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default(),
        log_path.display()
    ));

    let started = start_server(&addr, cfg.owner_grace(), Some(shutdown)).await?;
    started.join.await.context("server task")?;
    Ok(())
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<ServerState>) -> impl IntoResponse {
    ws.max_message_size(WS_MAX_MESSAGE_BYTES)
        .on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: ServerState) {
    let conn_id = Uuid::new_v4().as_simple().to_string();
    let (rx, evicted) = state.hub.connect(&conn_id);
    crate::logging::info_kv("connection opened", &[("conn", &conn_id)]);

    let (sink, mut stream) = socket.split();
    let writer = tokio::spawn(write_loop(sink, rx, conn_id.clone()));

    loop {
        let msg = tokio::select! {
            _ = evicted.notified() => break,
            msg = stream.next() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };
        let msg = match msg {
            Ok(m) => m,
            Err(e) => {
                crate::logging::debug_kv(
                    "connection read error",
                    &[("conn", &conn_id), ("error", &e.to_string())],
                );
                break;
            }
        };
        match msg {
            Message::Text(text) => match wsproto::decode_client_text(&text) {
                Ok(cm) => dispatch(&state, &conn_id, cm).await,
                Err(e) => {
                    crate::logging::warn_kv(
                        "malformed client message",
                        &[("conn", &conn_id), ("error", &e.to_string())],
                    );
                    state.stats.set_last_error(&e);
                }
            },
            Message::Binary(raw) => match wsproto::decode_relay_chunk(&raw) {
                Ok(chunk) => {
                    if relay_allowed(&state, &conn_id, &chunk.peer) {
                        relay::forward_chunk(&state.hub, &state.stats, &conn_id, chunk);
                    }
                }
                Err(e) => {
                    crate::logging::warn_kv(
                        "malformed relay chunk",
                        &[("conn", &conn_id), ("error", &e.to_string())],
                    );
                    state.stats.set_last_error(&e);
                }
            },
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    state.hub.unregister(&conn_id);
    state.registry.connection_closed(&conn_id).await;
    writer.abort();
    crate::logging::info_kv("connection closed", &[("conn", &conn_id)]);
}

async fn write_loop(
    mut sink: futures_util::stream::SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Outbound>,
    conn_id: String,
) {
    let mut keepalive = tokio::time::interval(WS_PING_INTERVAL);
    keepalive.tick().await;
    loop {
        let msg = tokio::select! {
            out = rx.recv() => match out {
                Some(Outbound::Text(msg)) => match wsproto::encode_text(&msg) {
                    Ok(text) => Message::Text(text),
                    Err(e) => {
                        crate::logging::error_kv(
                            "encode server message",
                            &[("conn", &conn_id), ("error", &e.to_string())],
                        );
                        continue;
                    }
                },
                Some(Outbound::Binary(bytes)) => Message::Binary(bytes),
                None => break,
            },
            _ = keepalive.tick() => Message::Ping(Vec::new()),
        };
        if sink.send(msg).await.is_err() {
            break;
        }
    }
    let _ = sink.close().await;
}

async fn dispatch(state: &ServerState, conn_id: &str, msg: ClientMessage) {
    match msg {
        ClientMessage::StartBroadcast { manifest } => {
            state.registry.start_broadcast(conn_id, manifest).await;
        }
        ClientMessage::StopBroadcast { session_id } => {
            if let Err(e) = state.registry.stop_broadcast(&session_id, conn_id).await {
                crate::logging::warn_kv(
                    "stop-broadcast ignored",
                    &[("session", &session_id), ("conn", conn_id), ("reason", &e.to_string())],
                );
            }
        }
        ClientMessage::ReclaimBroadcast {
            session_id,
            resume_token,
        } => {
            let _ = state.registry.reclaim(&session_id, &resume_token, conn_id).await;
        }
        ClientMessage::JoinBroadcast { session_id } => {
            let _ = state.registry.join_watcher(&session_id, conn_id).await;
        }
        ClientMessage::Offer { to, sdp } => {
            signaling::forward(&state.hub, &state.stats, conn_id, &to, Signal::Offer(sdp));
        }
        ClientMessage::Answer { to, sdp } => {
            signaling::forward(&state.hub, &state.stats, conn_id, &to, Signal::Answer(sdp));
        }
        ClientMessage::IceCandidate { to, candidate } => {
            signaling::forward(
                &state.hub,
                &state.stats,
                conn_id,
                &to,
                Signal::IceCandidate(candidate),
            );
        }
        ClientMessage::RequestRelayFallback {
            session_id,
            watcher_id,
        } => {
            if let Err(e) = state
                .registry
                .request_relay_fallback(&session_id, conn_id, &watcher_id)
                .await
            {
                crate::logging::warn_kv(
                    "relay fallback request ignored",
                    &[("session", &session_id), ("conn", conn_id), ("reason", &e.to_string())],
                );
            }
        }
        ClientMessage::RelayControl { to, message } => {
            if relay_allowed(state, conn_id, &to) {
                relay::forward_control(&state.hub, &state.stats, conn_id, &to, message);
            }
        }
        ClientMessage::Ping => {
            state.hub.send(conn_id, ServerMessage::Pong);
        }
    }
}

/// Relay traffic only flows between a session's current owner and one of its
/// watchers. This also drops what an owner's replaced connection still had
/// in flight after a reclaim.
fn relay_allowed(state: &ServerState, from: &str, to: &str) -> bool {
    if state.registry.shares_session(from, to) {
        return true;
    }
    state.stats.on_drop();
    crate::logging::debug_kv("relay between unrelated connections dropped", &[("from", from), ("to", to)]);
    false
}

#[derive(Serialize)]
struct StatusResponse {
    status: String,
    ts: String,
    version: String,
    sessions: usize,
    connections: usize,
    relay: RelayStatsSnapshot,
}

async fn status(State(state): State<ServerState>) -> impl IntoResponse {
    Json(StatusResponse {
        status: "ok".to_string(),
        ts: Utc::now().to_rfc3339(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        sessions: state.registry.session_count(),
        connections: state.hub.len(),
        relay: state.stats.snapshot(),
    })
}
