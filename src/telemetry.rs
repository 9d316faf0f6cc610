use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde::Serialize;

#[derive(Default)]
pub struct RelayStats {
    relayed_chunks: AtomicU64,
    relayed_bytes: AtomicU64,
    relayed_controls: AtomicU64,
    signals_forwarded: AtomicU64,
    dropped: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl RelayStats {
    pub fn on_chunk(&self, n: usize) {
        self.relayed_chunks.fetch_add(1, Ordering::Relaxed);
        self.relayed_bytes.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn on_control(&self) {
        self.relayed_controls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_signal(&self) {
        self.signals_forwarded.fetch_add(1, Ordering::Relaxed);
    }

    /// A message whose target connection no longer exists.
    pub fn on_drop(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_last_error(&self, err: impl ToString) {
        if let Ok(mut g) = self.last_error.lock() {
            *g = Some(err.to_string());
        }
    }

    pub fn snapshot(&self) -> RelayStatsSnapshot {
        let last_error = self
            .last_error
            .lock()
            .ok()
            .and_then(|g| g.clone())
            .unwrap_or_default();
        RelayStatsSnapshot {
            relayed_chunks: self.relayed_chunks.load(Ordering::Relaxed),
            relayed_bytes: self.relayed_bytes.load(Ordering::Relaxed),
            relayed_controls: self.relayed_controls.load(Ordering::Relaxed),
            signals_forwarded: self.signals_forwarded.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            last_error,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct RelayStatsSnapshot {
    pub relayed_chunks: u64,
    pub relayed_bytes: u64,
    pub relayed_controls: u64,
    pub signals_forwarded: u64,
    pub dropped: u64,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub last_error: String,
}
