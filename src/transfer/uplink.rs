use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;

use crate::client::Outgoing;

/// One queued websocket message and the server connection it was made for.
#[derive(Debug, Clone, PartialEq)]
pub struct Tagged {
    pub generation: u64,
    pub out: Outgoing,
}

/// Sending half of the broadcaster's outbound queue, shared by every
/// orchestrator.
///
/// The broadcaster advances the generation whenever it loses the server
/// connection and drops queued items of older generations, so a stream that
/// was cut mid-file never continues on the reclaimed connection. A pinned
/// handle keeps tagging with the generation it was pinned at.
#[derive(Clone)]
pub struct Uplink {
    tx: mpsc::Sender<Tagged>,
    generation: Arc<AtomicU64>,
    pinned: Option<u64>,
}

pub fn channel(capacity: usize) -> (Uplink, mpsc::Receiver<Tagged>) {
    let (tx, rx) = mpsc::channel(capacity);
    (
        Uplink {
            tx,
            generation: Arc::new(AtomicU64::new(0)),
            pinned: None,
        },
        rx,
    )
}

impl Uplink {
    /// Generation this handle tags with.
    pub fn generation(&self) -> u64 {
        self.pinned.unwrap_or_else(|| self.current())
    }

    /// Generation of the broadcaster's current connection.
    pub fn current(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Starts a new generation and returns it.
    pub fn advance(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn pinned(&self) -> Uplink {
        Uplink {
            tx: self.tx.clone(),
            generation: self.generation.clone(),
            pinned: Some(self.generation()),
        }
    }

    /// Whether an item tagged `generation` may still go out.
    pub fn is_current(&self, generation: u64) -> bool {
        generation >= self.current()
    }

    pub async fn send(&self, out: Outgoing) -> Result<()> {
        let item = Tagged {
            generation: self.generation(),
            out,
        };
        self.tx
            .send(item)
            .await
            .map_err(|_| anyhow::anyhow!("broadcaster connection closed"))
    }
}
