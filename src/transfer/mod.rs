pub mod broadcaster;
pub mod delivery;
pub mod flow;
pub mod link;
pub mod message;
pub mod peer;
pub mod source;
pub mod uplink;

use std::time::Duration;

pub const CHUNK_SIZE: usize = 256 * 1024;
pub const PROBE_BYTES: usize = 1024 * 1024;
/// 1.25 MiB/s, roughly 10 Mbps.
pub const THROUGHPUT_THRESHOLD: f64 = 1.25 * 1024.0 * 1024.0;
pub const HIGH_WATER: u64 = 16 * 1024 * 1024;
pub const LOW_WATER: u64 = 8 * 1024 * 1024;
pub const NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(15);
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(10);
pub const JITTER_GRACE: Duration = Duration::from_secs(5);
pub const RELAY_PING_EVERY: u64 = 16;
/// Relay messages an owner may have outstanding towards one watcher. Kept
/// well below the server's per-connection queue.
pub const RELAY_WINDOW: u64 = 64;
/// A watcher acknowledges relay traffic after this many messages.
pub const RELAY_ACK_EVERY: u64 = 16;

/// Knobs of the per-watcher transfer. Defaults are the protocol values.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferTuning {
    pub chunk_size: usize,
    pub probe_bytes: usize,
    /// Bytes per second a probe must reach for direct delivery.
    pub throughput_threshold: f64,
    pub high_water: u64,
    pub low_water: u64,
    pub negotiation_timeout: Duration,
    pub probe_timeout: Duration,
    pub jitter_grace: Duration,
    pub relay_ping_every: u64,
    pub relay_window: u64,
}

impl Default for TransferTuning {
    fn default() -> Self {
        Self {
            chunk_size: CHUNK_SIZE,
            probe_bytes: PROBE_BYTES,
            throughput_threshold: THROUGHPUT_THRESHOLD,
            high_water: HIGH_WATER,
            low_water: LOW_WATER,
            negotiation_timeout: NEGOTIATION_TIMEOUT,
            probe_timeout: PROBE_TIMEOUT,
            jitter_grace: JITTER_GRACE,
            relay_ping_every: RELAY_PING_EVERY,
            relay_window: RELAY_WINDOW,
        }
    }
}
