use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::time::{sleep_until, Instant};
use tokio_tungstenite::tungstenite::protocol::Message;

use crate::client::{self, Incoming, Outgoing, WsStream, DEFAULT_HEALTHZ_ATTEMPTS, OUTGOING_QUEUE};
use crate::config::{self, DirectConfig};
use crate::direct::QuicLinkFactory;
use crate::transfer::link::LinkFactory;
use crate::transfer::peer::{spawn_peer, PeerContext, PeerEvent, PeerHandle};
use crate::transfer::source::FileSource;
use crate::transfer::uplink::{self, Tagged, Uplink};
use crate::transfer::TransferTuning;
use crate::wsproto::{relay_message, ClientMessage, ServerMessage};

const RECONNECT_BACKOFF_START: Duration = Duration::from_millis(500);
const RECONNECT_BACKOFF_MAX: Duration = Duration::from_secs(4);

#[derive(Debug, Clone)]
pub struct BroadcastOptions {
    pub server_url: String,
    /// `enabled = false` sends everything through the relay.
    pub direct: DirectConfig,
    pub tuning: TransferTuning,
    /// How long to keep trying to reclaim the session after losing the server.
    pub reconnect_window: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastInfo {
    pub session_id: String,
    pub share_link: String,
}

enum ConnectionEnd {
    Lost,
    Shutdown,
}

type WsWriter = SplitSink<WsStream, Message>;

/// Runs one broadcast until `shutdown` is notified: starts the session, serves
/// every watcher that joins with its own orchestrator and reclaims the session
/// after a dropped server connection. `started` receives the session id once
/// the server has accepted the broadcast.
pub async fn run_broadcast(
    opts: BroadcastOptions,
    source: FileSource,
    shutdown: Arc<Notify>,
    started: Option<oneshot::Sender<BroadcastInfo>>,
) -> Result<()> {
    if source.is_empty() {
        anyhow::bail!("nothing to send");
    }
    client::wait_for_healthz(&opts.server_url, DEFAULT_HEALTHZ_ATTEMPTS).await?;

    let links: Option<Arc<dyn LinkFactory>> = if opts.direct.enabled {
        Some(Arc::new(QuicLinkFactory::new(
            opts.direct.clone(),
            opts.tuning.high_water,
            opts.tuning.low_water,
        )))
    } else {
        None
    };
    let mut broadcaster = Broadcaster::new(opts, source, links, started);
    let res = broadcaster.run(&shutdown).await;
    broadcaster.shutdown_peers();
    res
}

struct Broadcaster {
    opts: BroadcastOptions,
    source: FileSource,
    links: Option<Arc<dyn LinkFactory>>,
    uplink: Uplink,
    // Outlives websocket connections so orchestrators keep their sender
    // across a reclaim.
    uplink_rx: mpsc::Receiver<Tagged>,
    /// Current-generation messages queued while no connection was up.
    held: VecDeque<Outgoing>,
    /// `(session id, resume token)` once the server started the broadcast.
    session: Option<(String, String)>,
    peers: HashMap<String, PeerHandle>,
    started: Option<oneshot::Sender<BroadcastInfo>>,
}

impl Broadcaster {
    fn new(
        opts: BroadcastOptions,
        source: FileSource,
        links: Option<Arc<dyn LinkFactory>>,
        started: Option<oneshot::Sender<BroadcastInfo>>,
    ) -> Self {
        let (uplink, uplink_rx) = uplink::channel(OUTGOING_QUEUE);
        Self {
            opts,
            source,
            links,
            uplink,
            uplink_rx,
            held: VecDeque::new(),
            session: None,
            peers: HashMap::new(),
            started,
        }
    }

    async fn run(&mut self, shutdown: &Notify) -> Result<()> {
        let mut ws = client::connect(&self.opts.server_url).await?;
        loop {
            if let ConnectionEnd::Shutdown = self.serve_connection(ws, shutdown).await? {
                return Ok(());
            }
            let Some((session_id, _)) = self.session.clone() else {
                anyhow::bail!("server connection lost before the broadcast started");
            };
            // Whatever was queued for the lost connection is dropped from here on.
            let generation = self.uplink.advance();
            crate::logging::warn_kv(
                "server connection lost, reclaiming session",
                &[("session", &session_id), ("generation", &generation.to_string())],
            );
            ws = match self.reconnect(shutdown).await? {
                Some(ws) => ws,
                None => return Ok(()),
            };
        }
    }

    /// Retries with backoff until the reclaim window closes. Orchestrators
    /// keep running meanwhile, so their queue is drained here too.
    async fn reconnect(&mut self, shutdown: &Notify) -> Result<Option<WsStream>> {
        let deadline = Instant::now() + self.opts.reconnect_window;
        let mut backoff = RECONNECT_BACKOFF_START;
        let mut next_attempt = Instant::now() + backoff;
        loop {
            tokio::select! {
                _ = shutdown.notified() => return Ok(None),
                item = self.uplink_rx.recv() => {
                    if let Some(item) = item {
                        self.hold(item);
                    }
                    continue;
                }
                _ = sleep_until(next_attempt) => {}
            }
            match client::connect(&self.opts.server_url).await {
                Ok(ws) => return Ok(Some(ws)),
                Err(e) => {
                    if Instant::now() + backoff >= deadline {
                        return Err(e).context("could not reach the server within the reclaim window");
                    }
                    crate::logging::debug_kv("reconnect failed", &[("error", &e.to_string())]);
                }
            }
            backoff = (backoff * 2).min(RECONNECT_BACKOFF_MAX);
            next_attempt = Instant::now() + backoff;
        }
    }

    fn hold(&mut self, item: Tagged) {
        if self.uplink.is_current(item.generation) {
            self.held.push_back(item.out);
        }
    }

    async fn serve_connection(&mut self, ws: WsStream, shutdown: &Notify) -> Result<ConnectionEnd> {
        let (mut write, mut read) = ws.split();

        let hello = match &self.session {
            None => ClientMessage::StartBroadcast {
                manifest: self.source.manifest(),
            },
            Some((session_id, resume_token)) => ClientMessage::ReclaimBroadcast {
                session_id: session_id.clone(),
                resume_token: resume_token.clone(),
            },
        };
        if write.send(Outgoing::Text(hello).into_ws()?).await.is_err() {
            return Ok(ConnectionEnd::Lost);
        }
        while let Some(out) = self.held.pop_front() {
            if !send_out(&mut write, out).await? {
                return Ok(ConnectionEnd::Lost);
            }
        }

        loop {
            tokio::select! {
                _ = shutdown.notified() => {
                    self.stop(&mut write).await;
                    return Ok(ConnectionEnd::Shutdown);
                }
                item = self.uplink_rx.recv() => {
                    let Some(item) = item else {
                        return Ok(ConnectionEnd::Lost);
                    };
                    if !self.uplink.is_current(item.generation) {
                        continue;
                    }
                    if !send_out(&mut write, item.out).await? {
                        return Ok(ConnectionEnd::Lost);
                    }
                }
                msg = read.next() => match msg {
                    Some(Ok(msg)) => match client::decode_incoming(msg) {
                        Ok(Incoming::Server(msg)) => self.on_server_message(msg)?,
                        Ok(Incoming::Closed) => return Ok(ConnectionEnd::Lost),
                        Ok(Incoming::Relay(_)) | Ok(Incoming::Ignored) => {}
                        Err(e) => crate::logging::debug_kv(
                            "undecodable server message",
                            &[("error", &e.to_string())],
                        ),
                    },
                    Some(Err(e)) => {
                        crate::logging::debug_kv("websocket read failed", &[("error", &e.to_string())]);
                        return Ok(ConnectionEnd::Lost);
                    }
                    None => return Ok(ConnectionEnd::Lost),
                },
            }
        }
    }

    async fn stop(&mut self, write: &mut WsWriter) {
        self.shutdown_peers();
        if let Some((session_id, _)) = &self.session {
            crate::logging::info_kv("stopping broadcast", &[("session", session_id)]);
            let stop = ClientMessage::StopBroadcast {
                session_id: session_id.clone(),
            };
            if let Ok(msg) = Outgoing::Text(stop).into_ws() {
                let _ = write.send(msg).await;
            }
        }
        let _ = write.close().await;
    }

    fn on_server_message(&mut self, msg: ServerMessage) -> Result<()> {
        match msg {
            ServerMessage::BroadcastStarted {
                session_id,
                resume_token,
            } => {
                let share_link = config::share_link(&self.opts.server_url, &session_id);
                crate::logging::info_kv(
                    "broadcast started",
                    &[
                        ("session", &session_id),
                        ("files", &self.source.len().to_string()),
                        ("link", &share_link),
                    ],
                );
                if let Some(tx) = self.started.take() {
                    let _ = tx.send(BroadcastInfo {
                        session_id: session_id.clone(),
                        share_link,
                    });
                }
                self.session = Some((session_id, resume_token));
            }
            ServerMessage::ReclaimAccepted {
                session_id,
                watchers,
            } => {
                crate::logging::info_kv(
                    "session reclaimed",
                    &[("session", &session_id), ("watchers", &watchers.len().to_string())],
                );
                self.on_reclaimed(watchers);
            }
            ServerMessage::ReclaimRejected { reason } => {
                anyhow::bail!("server rejected the session reclaim: {reason}");
            }
            ServerMessage::WatcherReady { watcher_id } => self.on_watcher_ready(watcher_id),
            ServerMessage::WatcherLeft { watcher_id } => {
                if let Some(peer) = self.peers.remove(&watcher_id) {
                    peer.notify(PeerEvent::WatcherLeft);
                }
            }
            ServerMessage::Answer { from, sdp } => self.route(&from, PeerEvent::Answer(sdp)),
            ServerMessage::IceCandidate { from, candidate } => {
                self.route(&from, PeerEvent::RemoteCandidate(candidate))
            }
            ServerMessage::RelayControl { from, message } => match relay_message(&message) {
                Ok(msg) => self.route(&from, PeerEvent::Relayed(msg)),
                Err(e) => crate::logging::debug_kv(
                    "undecodable relay message",
                    &[("watcher", &from), ("error", &e.to_string())],
                ),
            },
            ServerMessage::ErrorMessage { message } => {
                crate::logging::warn_kv("server error", &[("message", &message)]);
            }
            other => {
                crate::logging::debug_kv("ignoring server message", &[("type", other.kind())]);
            }
        }
        Ok(())
    }

    /// Reconciles orchestrators with the watchers the server still has:
    /// departed ones stop, unseen ones start, and the rest resume any relay
    /// stream that was cut with the old connection.
    fn on_reclaimed(&mut self, watchers: Vec<String>) {
        self.peers.retain(|watcher_id, peer| {
            let present = watchers.contains(watcher_id);
            if !present {
                peer.notify(PeerEvent::WatcherLeft);
            }
            present
        });
        let generation = self.uplink.current();
        for watcher_id in watchers {
            match self.peers.get(&watcher_id) {
                Some(peer) => peer.notify(PeerEvent::Resync(generation)),
                None => self.on_watcher_ready(watcher_id),
            }
        }
    }

    fn on_watcher_ready(&mut self, watcher_id: String) {
        let session_id = self
            .session
            .as_ref()
            .map(|(id, _)| id.clone())
            .unwrap_or_default();
        crate::logging::info_kv(
            "watcher ready",
            &[("session", &session_id), ("watcher", &watcher_id)],
        );
        let ctx = PeerContext {
            session_id,
            watcher_id: watcher_id.clone(),
            source: self.source.clone(),
            tuning: self.opts.tuning.clone(),
            uplink: self.uplink.clone(),
            links: self.links.clone(),
        };
        if let Some(previous) = self.peers.insert(watcher_id, spawn_peer(ctx)) {
            previous.notify(PeerEvent::Shutdown);
        }
    }

    fn route(&self, watcher_id: &str, event: PeerEvent) {
        match self.peers.get(watcher_id) {
            Some(peer) => peer.notify(event),
            None => crate::logging::debug_kv("no transfer for watcher", &[("watcher", watcher_id)]),
        }
    }

    fn shutdown_peers(&mut self) {
        for (_, peer) in self.peers.drain() {
            peer.notify(PeerEvent::Shutdown);
        }
    }
}

/// Returns `false` when the connection is gone. A message that failed here
/// belongs to the lost connection and is not retried.
async fn send_out(write: &mut WsWriter, out: Outgoing) -> Result<bool> {
    Ok(write.send(out.into_ws()?).await.is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::peer::Phase;

    #[tokio::test]
    async fn empty_source_is_rejected_before_connecting() {
        let opts = BroadcastOptions {
            server_url: "http://127.0.0.1:9".into(),
            direct: DirectConfig::default(),
            tuning: TransferTuning::default(),
            reconnect_window: Duration::from_secs(1),
        };
        let err = run_broadcast(opts, FileSource::in_memory(vec![]), Arc::new(Notify::new()), None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("nothing to send"));
    }

    #[tokio::test]
    async fn reclaim_reconciles_orchestrators_with_listed_watchers() {
        let opts = BroadcastOptions {
            server_url: "http://127.0.0.1:9".into(),
            direct: DirectConfig::default(),
            tuning: TransferTuning::default(),
            reconnect_window: Duration::from_secs(1),
        };
        let source = FileSource::in_memory(vec![("a.txt".into(), b"abc".to_vec())]);
        let mut broadcaster = Broadcaster::new(opts, source, None, None);
        broadcaster.session = Some(("Sess01".into(), "tok".into()));
        broadcaster.on_watcher_ready("w1".into());
        broadcaster.on_watcher_ready("w2".into());
        let mut w1 = broadcaster.peers["w1"].phase_watch();
        let mut w2 = broadcaster.peers["w2"].phase_watch();
        w1.wait_for(|p| *p == Phase::Relay).await.unwrap();
        w2.wait_for(|p| *p == Phase::Relay).await.unwrap();

        let generation = broadcaster.uplink.advance();
        broadcaster
            .on_server_message(ServerMessage::ReclaimAccepted {
                session_id: "Sess01".into(),
                watchers: vec!["w2".into(), "w3".into()],
            })
            .unwrap();

        let mut ids: Vec<&String> = broadcaster.peers.keys().collect();
        ids.sort();
        assert_eq!(ids, vec!["w2", "w3"]);
        w1.wait_for(|p| p.is_terminal()).await.unwrap();

        // w2 restarts and w3 starts, both on the reclaimed connection.
        let mut restarted = Vec::new();
        while restarted.len() < 2 {
            let item = tokio::time::timeout(Duration::from_secs(5), broadcaster.uplink_rx.recv())
                .await
                .unwrap()
                .unwrap();
            if let Outgoing::Text(ClientMessage::RequestRelayFallback { watcher_id, .. }) = item.out {
                if item.generation == generation {
                    restarted.push(watcher_id);
                }
            }
        }
        restarted.sort();
        assert_eq!(restarted, vec!["w2", "w3"]);
        broadcaster.shutdown_peers();
    }
}
