use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tokio::sync::{mpsc, Notify};

use crate::wsproto::ServerMessage;

/// Per-connection outbound queue depth. Senders keep their relay traffic
/// well below it, so a connection that lets it fill up has stopped reading
/// and is dropped rather than waited on.
pub const OUTBOUND_QUEUE: usize = 256;

#[derive(Debug)]
pub enum Outbound {
    Text(ServerMessage),
    Binary(Vec<u8>),
}

struct Conn {
    tx: mpsc::Sender<Outbound>,
    evicted: Arc<Notify>,
}

/// Live websocket connections keyed by connection id. Every message the server
/// emits goes through a connection's single ordered queue. Queuing never
/// waits: one stalled reader cannot hold up the connection that is sending to
/// it, nor anyone else.
#[derive(Clone, Default)]
pub struct ConnectionHub {
    conns: Arc<RwLock<HashMap<String, Conn>>>,
}

impl ConnectionHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a connection. The returned notify fires if the hub drops the
    /// connection for not keeping up; its socket should then be closed.
    pub fn connect(&self, conn_id: &str) -> (mpsc::Receiver<Outbound>, Arc<Notify>) {
        self.connect_with_capacity(conn_id, OUTBOUND_QUEUE)
    }

    pub fn connect_with_capacity(
        &self,
        conn_id: &str,
        capacity: usize,
    ) -> (mpsc::Receiver<Outbound>, Arc<Notify>) {
        let (tx, rx) = mpsc::channel(capacity);
        let evicted = Arc::new(Notify::new());
        if let Ok(mut conns) = self.conns.write() {
            conns.insert(
                conn_id.to_string(),
                Conn {
                    tx,
                    evicted: evicted.clone(),
                },
            );
        }
        (rx, evicted)
    }

    pub fn register(&self, conn_id: &str) -> mpsc::Receiver<Outbound> {
        self.connect(conn_id).0
    }

    pub fn unregister(&self, conn_id: &str) {
        if let Ok(mut conns) = self.conns.write() {
            conns.remove(conn_id);
        }
    }

    pub fn contains(&self, conn_id: &str) -> bool {
        self.conns
            .read()
            .map(|c| c.contains_key(conn_id))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.conns.read().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queues a message for `to`. Returns false when the connection is gone
    /// or was just dropped for a full queue.
    pub fn send(&self, to: &str, msg: ServerMessage) -> bool {
        self.push(to, Outbound::Text(msg))
    }

    pub fn send_binary(&self, to: &str, bytes: Vec<u8>) -> bool {
        self.push(to, Outbound::Binary(bytes))
    }

    fn push(&self, to: &str, out: Outbound) -> bool {
        let res = match self.conns.read() {
            Ok(conns) => match conns.get(to) {
                Some(conn) => conn.tx.try_send(out),
                None => return false,
            },
            Err(_) => return false,
        };
        match res {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Closed(_)) => false,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.evict(to);
                false
            }
        }
    }

    fn evict(&self, conn_id: &str) {
        let removed = match self.conns.write() {
            Ok(mut conns) => conns.remove(conn_id),
            Err(_) => None,
        };
        if let Some(conn) = removed {
            crate::logging::warn_kv("dropping connection with a full queue", &[("conn", conn_id)]);
            // Stores a permit if the socket task is not waiting yet.
            conn.evicted.notify_one();
        }
    }
}
