use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpStream;
use tokio::time::sleep;
use tokio_tungstenite::tungstenite::protocol::{Message, WebSocketConfig};
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};

use crate::wsproto::{self, ClientMessage, RelayChunk, ServerMessage, WS_MAX_MESSAGE_BYTES};

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Depth of a participant's outbound queue. Relay delivery waits on it, so it
/// is what throttles a sender to its own websocket.
pub const OUTGOING_QUEUE: usize = 64;

pub const DEFAULT_HEALTHZ_ATTEMPTS: usize = 20;

/// Something a participant wants to put on its websocket.
#[derive(Debug, Clone, PartialEq)]
pub enum Outgoing {
    Text(ClientMessage),
    Binary(Vec<u8>),
}

impl Outgoing {
    pub fn into_ws(self) -> Result<Message> {
        Ok(match self {
            Outgoing::Text(msg) => Message::Text(wsproto::encode_text(&msg)?),
            Outgoing::Binary(bytes) => Message::Binary(bytes),
        })
    }
}

/// A websocket frame from the server, decoded.
#[derive(Debug)]
pub enum Incoming {
    Server(ServerMessage),
    Relay(RelayChunk),
    Closed,
    Ignored,
}

pub fn decode_incoming(msg: Message) -> Result<Incoming> {
    Ok(match msg {
        Message::Text(text) => Incoming::Server(wsproto::decode_server_text(&text)?),
        Message::Binary(raw) => Incoming::Relay(wsproto::decode_relay_chunk(&raw)?),
        Message::Close(_) => Incoming::Closed,
        _ => Incoming::Ignored,
    })
}

/// Polls the server's status endpoint until it answers.
pub async fn wait_for_healthz(server_url: &str, max_attempts: usize) -> Result<()> {
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()?;
    let url = format!("{}/v1/status", server_url.trim_end_matches('/'));
    let mut attempts = 0;
    loop {
        let err = match http.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => return Ok(()),
            Ok(resp) => anyhow::anyhow!("status endpoint returned {}", resp.status()),
            Err(e) => anyhow::Error::from(e),
        };
        attempts += 1;
        if attempts >= max_attempts.max(1) {
            return Err(err).context("healthz");
        }
        sleep(Duration::from_millis(500)).await;
    }
}

pub async fn connect(server_url: &str) -> Result<WsStream> {
    let url = crate::config::ws_url(server_url)?;
    let config = WebSocketConfig {
        max_message_size: Some(WS_MAX_MESSAGE_BYTES),
        max_frame_size: Some(WS_MAX_MESSAGE_BYTES),
        ..Default::default()
    };
    let (ws, _) = connect_async_with_config(url.as_str(), Some(config), true)
        .await
        .with_context(|| format!("connect {url}"))?;
    crate::logging::debug_kv("websocket connected", &[("url", url.as_str())]);
    Ok(ws)
}
