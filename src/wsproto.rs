use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::manifest::FileDescriptor;
use crate::transfer::message::TransferMessage;

pub const WS_MAX_MESSAGE_BYTES: usize = 8 * 1024 * 1024;

const MAGIC0: u8 = b'D';
const MAGIC1: u8 = b'S';
const VERSION: u8 = 1;
const KIND_RELAY_CHUNK: u8 = 1;
const HEADER_LEN: usize = 4 + 2;

/// Messages a broadcaster or watcher sends to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    StartBroadcast {
        manifest: Vec<FileDescriptor>,
    },
    StopBroadcast {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    ReclaimBroadcast {
        #[serde(rename = "sessionId")]
        session_id: String,
        #[serde(rename = "resumeToken")]
        resume_token: String,
    },
    JoinBroadcast {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    Offer {
        to: String,
        sdp: Value,
    },
    Answer {
        to: String,
        sdp: Value,
    },
    IceCandidate {
        to: String,
        candidate: Value,
    },
    RequestRelayFallback {
        #[serde(rename = "sessionId")]
        session_id: String,
        #[serde(rename = "watcherId")]
        watcher_id: String,
    },
    /// `message` is forwarded verbatim; the server never interprets it.
    RelayControl {
        to: String,
        message: Value,
    },
    Ping,
}

/// Messages the server sends to a connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    BroadcastStarted {
        #[serde(rename = "sessionId")]
        session_id: String,
        #[serde(rename = "resumeToken")]
        resume_token: String,
    },
    WatcherReady {
        #[serde(rename = "watcherId")]
        watcher_id: String,
    },
    WatcherLeft {
        #[serde(rename = "watcherId")]
        watcher_id: String,
    },
    ReclaimAccepted {
        #[serde(rename = "sessionId")]
        session_id: String,
        /// Watchers still in the session. Notices sent while the owner was
        /// away are lost, so this is the authoritative list.
        #[serde(default)]
        watchers: Vec<String>,
    },
    ReclaimRejected {
        reason: String,
    },
    ManifestReady {
        #[serde(rename = "sessionId")]
        session_id: String,
        manifest: Vec<FileDescriptor>,
    },
    JoinRejected {
        reason: String,
    },
    OwnerUnstable,
    OwnerRecovered,
    BroadcastEnded,
    Offer {
        from: String,
        sdp: Value,
    },
    Answer {
        from: String,
        sdp: Value,
    },
    IceCandidate {
        from: String,
        candidate: Value,
    },
    InitiateRelayFallback,
    RelayControl {
        from: String,
        message: Value,
    },
    Pong,
    ErrorMessage {
        message: String,
    },
}

impl ServerMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::BroadcastStarted { .. } => "broadcast-started",
            ServerMessage::WatcherReady { .. } => "watcher-ready",
            ServerMessage::WatcherLeft { .. } => "watcher-left",
            ServerMessage::ReclaimAccepted { .. } => "reclaim-accepted",
            ServerMessage::ReclaimRejected { .. } => "reclaim-rejected",
            ServerMessage::ManifestReady { .. } => "manifest-ready",
            ServerMessage::JoinRejected { .. } => "join-rejected",
            ServerMessage::OwnerUnstable => "owner-unstable",
            ServerMessage::OwnerRecovered => "owner-recovered",
            ServerMessage::BroadcastEnded => "broadcast-ended",
            ServerMessage::Offer { .. } => "offer",
            ServerMessage::Answer { .. } => "answer",
            ServerMessage::IceCandidate { .. } => "ice-candidate",
            ServerMessage::InitiateRelayFallback => "initiate-relay-fallback",
            ServerMessage::RelayControl { .. } => "relay-control",
            ServerMessage::Pong => "pong",
            ServerMessage::ErrorMessage { .. } => "error-message",
        }
    }
}

/// A relay chunk. `peer` is the recipient when the owner uploads it and the
/// sender when the server delivers it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayChunk {
    pub peer: String,
    pub payload: Vec<u8>,
}

pub fn encode_relay_chunk(peer: &str, payload: &[u8]) -> Vec<u8> {
    let peer_bytes = peer.as_bytes();
    let mut out = Vec::with_capacity(HEADER_LEN + peer_bytes.len() + payload.len());
    out.push(MAGIC0);
    out.push(MAGIC1);
    out.push(VERSION);
    out.push(KIND_RELAY_CHUNK);
    out.extend_from_slice(&(peer_bytes.len() as u16).to_be_bytes());
    out.extend_from_slice(peer_bytes);
    out.extend_from_slice(payload);
    out
}

pub fn decode_relay_chunk(raw: &[u8]) -> Result<RelayChunk> {
    if raw.len() < HEADER_LEN || raw[0] != MAGIC0 || raw[1] != MAGIC1 {
        anyhow::bail!("not a relay envelope");
    }
    if raw[2] != VERSION {
        anyhow::bail!("unsupported ws envelope version: {}", raw[2]);
    }
    if raw[3] != KIND_RELAY_CHUNK {
        anyhow::bail!("unknown ws envelope kind: {}", raw[3]);
    }
    let peer_len = u16::from_be_bytes([raw[4], raw[5]]) as usize;
    let body = &raw[HEADER_LEN..];
    if body.len() < peer_len {
        anyhow::bail!("truncated relay envelope");
    }
    let peer = std::str::from_utf8(&body[..peer_len])?.to_string();
    Ok(RelayChunk {
        peer,
        payload: body[peer_len..].to_vec(),
    })
}

/// Re-encodes a chunk under another peer id; the payload is copied as is.
pub fn readdress_relay_chunk(chunk: &RelayChunk, new_peer: &str) -> Vec<u8> {
    encode_relay_chunk(new_peer, &chunk.payload)
}

pub fn decode_client_text(raw: &str) -> Result<ClientMessage> {
    Ok(serde_json::from_str(raw)?)
}

pub fn decode_server_text(raw: &str) -> Result<ServerMessage> {
    Ok(serde_json::from_str(raw)?)
}

pub fn encode_text<T: Serialize>(msg: &T) -> Result<String> {
    Ok(serde_json::to_string(msg)?)
}

/// Decodes the payload of a `relay-control` message into a transfer message.
pub fn relay_message(message: &Value) -> Result<TransferMessage> {
    Ok(serde_json::from_value(message.clone())?)
}
