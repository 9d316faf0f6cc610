//! Peer-to-peer data channel between an owner and one watcher: an ordered
//! QUIC stream carrying length-prefixed frames, with STUN for a reflexive
//! candidate.

pub mod codec;
pub mod quic;
pub mod stun;

pub use quic::{QuicLinkFactory, WatcherLink, WatcherLinkEvent};
