use serde::{Deserialize, Serialize};

use crate::manifest::FileDescriptor;

/// Control messages of the data path. Identical on the direct channel and the
/// relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum TransferMessage {
    FileStart(FileDescriptor),
    FileEnd,
    TransferComplete,
    ProbeStart,
    ProbeAck,
    ModeOk,
    ModeLow,
    /// Watcher to owner: this file was written in full.
    FileReceived {
        #[serde(rename = "relativePath")]
        relative_path: String,
    },
    /// Watcher to owner: the whole transfer was delivered.
    TransferReceived,
    /// Watcher to owner: relay messages received so far on this session.
    RelayAck { received: u64 },
}

/// One unit on the data path: a control message or a raw chunk that belongs to
/// the most recent `FileStart`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Control(TransferMessage),
    Chunk(Vec<u8>),
}

impl Frame {
    /// Bytes this frame occupies in a channel buffer.
    pub fn wire_len(&self) -> u64 {
        match self {
            Frame::Chunk(bytes) => bytes.len() as u64,
            Frame::Control(msg) => serde_json::to_vec(msg)
                .map(|v| v.len() as u64)
                .unwrap_or(0),
        }
    }
}

impl From<TransferMessage> for Frame {
    fn from(msg: TransferMessage) -> Self {
        Frame::Control(msg)
    }
}
