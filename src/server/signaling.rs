use serde_json::Value;

use crate::server::hub::ConnectionHub;
use crate::telemetry::RelayStats;
use crate::wsproto::ServerMessage;

/// Negotiation payloads forwarded between an owner and one watcher.
#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    Offer(Value),
    Answer(Value),
    IceCandidate(Value),
}

impl Signal {
    fn into_message(self, from: &str) -> ServerMessage {
        let from = from.to_string();
        match self {
            Signal::Offer(sdp) => ServerMessage::Offer { from, sdp },
            Signal::Answer(sdp) => ServerMessage::Answer { from, sdp },
            Signal::IceCandidate(candidate) => ServerMessage::IceCandidate { from, candidate },
        }
    }
}

/// Forwards `signal` verbatim to `to`, stamped with the sender id. A missing
/// target is dropped silently; the sender's own timeouts notice.
pub fn forward(hub: &ConnectionHub, stats: &RelayStats, from: &str, to: &str, signal: Signal) {
    let msg = signal.into_message(from);
    let kind = msg.kind();
    if hub.send(to, msg) {
        stats.on_signal();
        crate::logging::debug_kv("signal forwarded", &[("from", from), ("to", to), ("kind", kind)]);
    } else {
        stats.on_drop();
        crate::logging::debug_kv("signal target gone", &[("from", from), ("to", to), ("kind", kind)]);
    }
}
