use serde_json::Value;

use crate::server::hub::ConnectionHub;
use crate::telemetry::RelayStats;
use crate::wsproto::{readdress_relay_chunk, RelayChunk, ServerMessage};

/// Forwards a relay control message to `to` without looking inside it.
pub fn forward_control(
    hub: &ConnectionHub,
    stats: &RelayStats,
    from: &str,
    to: &str,
    message: Value,
) {
    let msg = ServerMessage::RelayControl {
        from: from.to_string(),
        message,
    };
    if hub.send(to, msg) {
        stats.on_control();
    } else {
        stats.on_drop();
        crate::logging::debug_kv("relay control target gone", &[("from", from), ("to", to)]);
    }
}

/// Forwards an uploaded chunk. The envelope names the recipient on the way in
/// and is rewritten to name the sender on the way out; the payload is opaque.
/// Never waits on the recipient: senders pace themselves on acknowledgements.
pub fn forward_chunk(hub: &ConnectionHub, stats: &RelayStats, from: &str, chunk: RelayChunk) {
    let len = chunk.payload.len();
    let out = readdress_relay_chunk(&chunk, from);
    if hub.send_binary(&chunk.peer, out) {
        stats.on_chunk(len);
    } else {
        stats.on_drop();
        crate::logging::debug_kv(
            "relay chunk target gone",
            &[("from", from), ("to", &chunk.peer)],
        );
    }
}
