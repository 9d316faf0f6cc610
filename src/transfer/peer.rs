use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::client::Outgoing;
use crate::transfer::delivery::{self, Receipts, RelayJob};
use crate::transfer::flow::RelayWindow;
use crate::transfer::link::{DirectLink, LinkEvent, LinkFactory, LinkState};
use crate::transfer::message::{Frame, TransferMessage};
use crate::transfer::source::FileSource;
use crate::transfer::uplink::Uplink;
use crate::transfer::TransferTuning;
use crate::wsproto::ClientMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    Negotiating,
    Probing,
    DirectSending,
    /// Direct link reported a transient drop; waiting out the grace window.
    Watching,
    Relay,
    Done,
    Closed,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Done | Phase::Closed)
    }

    fn uses_direct_link(self) -> bool {
        matches!(
            self,
            Phase::Init
                | Phase::Negotiating
                | Phase::Probing
                | Phase::DirectSending
                | Phase::Watching
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Init => "init",
            Phase::Negotiating => "negotiating",
            Phase::Probing => "probing",
            Phase::DirectSending => "direct-sending",
            Phase::Watching => "watching",
            Phase::Relay => "relay",
            Phase::Done => "done",
            Phase::Closed => "closed",
        }
    }
}

/// Input routed to one watcher's orchestrator by the broadcaster.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    Answer(Value),
    RemoteCandidate(Value),
    /// A data-path message the watcher sent back through the relay.
    Relayed(TransferMessage),
    /// The session was reclaimed on the server connection of this uplink
    /// generation; relay traffic of older generations never left.
    Resync(u64),
    WatcherLeft,
    Shutdown,
}

/// Everything one orchestrator needs. `links` is `None` when direct links are
/// disabled.
#[derive(Clone)]
pub struct PeerContext {
    pub session_id: String,
    pub watcher_id: String,
    pub source: FileSource,
    pub tuning: TransferTuning,
    pub uplink: Uplink,
    pub links: Option<Arc<dyn LinkFactory>>,
}

pub struct PeerHandle {
    events: mpsc::UnboundedSender<PeerEvent>,
    phase: watch::Receiver<Phase>,
    join: JoinHandle<Phase>,
}

impl PeerHandle {
    pub fn notify(&self, event: PeerEvent) {
        let _ = self.events.send(event);
    }

    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    pub fn phase_watch(&self) -> watch::Receiver<Phase> {
        self.phase.clone()
    }

    pub async fn join(self) -> Phase {
        self.join.await.unwrap_or(Phase::Closed)
    }
}

/// Starts the orchestrator for one watcher on its own task.
pub fn spawn_peer(ctx: PeerContext) -> PeerHandle {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (phase_tx, phase_rx) = watch::channel(Phase::Init);
    let peer = PeerTransfer {
        receipts: Receipts::new(&ctx.source.manifest()),
        window: Arc::new(RelayWindow::new(ctx.tuning.relay_window)),
        ctx,
        phase: Phase::Init,
        phase_tx,
        link: None,
        link_events: None,
        deadline: None,
        probe_started: None,
        delivery: None,
        relay_generation: None,
    };
    let join = tokio::spawn(peer.run(events_rx));
    PeerHandle {
        events: events_tx,
        phase: phase_rx,
        join,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Deadline {
    Negotiation,
    Probe,
    Grace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeliveryPath {
    Direct,
    Relay,
}

impl DeliveryPath {
    fn as_str(self) -> &'static str {
        match self {
            DeliveryPath::Direct => "direct",
            DeliveryPath::Relay => "relay",
        }
    }
}

struct PeerTransfer {
    ctx: PeerContext,
    phase: Phase,
    phase_tx: watch::Sender<Phase>,
    link: Option<DirectLink>,
    link_events: Option<mpsc::UnboundedReceiver<LinkEvent>>,
    // A single slot: arming one deadline replaces the previous one.
    deadline: Option<(Instant, Deadline)>,
    probe_started: Option<Instant>,
    delivery: Option<(DeliveryPath, JoinHandle<Result<()>>)>,
    receipts: Receipts,
    window: Arc<RelayWindow>,
    /// Uplink generation the current relay stream is pinned to.
    relay_generation: Option<u64>,
}

impl PeerTransfer {
    async fn run(mut self, mut events: mpsc::UnboundedReceiver<PeerEvent>) -> Phase {
        self.start().await;
        while !self.phase.is_terminal() {
            let deadline = self.deadline.map(|(at, _)| at);
            tokio::select! {
                ev = events.recv() => match ev {
                    Some(ev) => self.on_peer_event(ev).await,
                    None => self.close("orchestrator handle dropped"),
                },
                ev = next_link_event(&mut self.link_events) => match ev {
                    Some(ev) => self.on_link_event(ev).await,
                    None => self.on_link_gone().await,
                },
                _ = deadline_elapsed(deadline) => self.on_deadline().await,
                (path, res) = join_delivery(&mut self.delivery) => {
                    self.delivery = None;
                    self.on_delivery_done(path, res).await;
                }
            }
        }
        self.phase
    }

    async fn start(&mut self) {
        let Some(factory) = self.ctx.links.clone() else {
            self.fallback("direct link disabled").await;
            return;
        };
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (link, offer) = match factory.open(&self.ctx.watcher_id, events_tx) {
            Ok(opened) => opened,
            Err(e) => {
                self.fallback(&format!("direct link setup failed: {e}")).await;
                return;
            }
        };
        self.link = Some(link);
        self.link_events = Some(events_rx);
        self.set_phase(Phase::Negotiating);
        self.arm(Deadline::Negotiation, self.ctx.tuning.negotiation_timeout);
        let offer = Outgoing::Text(ClientMessage::Offer {
            to: self.ctx.watcher_id.clone(),
            sdp: offer,
        });
        if self.push(offer).await.is_err() {
            self.close("broadcaster connection closed");
        }
    }

    async fn on_peer_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::Answer(answer) => {
                if answer.get("accepted").and_then(Value::as_bool) == Some(false) {
                    self.fallback("watcher declined direct link").await;
                } else if let Some(link) = &self.link {
                    link.remote_answer(answer);
                }
            }
            PeerEvent::RemoteCandidate(candidate) => {
                if let Some(link) = &self.link {
                    link.remote_candidate(candidate);
                }
            }
            PeerEvent::Relayed(msg) => self.on_watcher_message(msg, DeliveryPath::Relay),
            PeerEvent::Resync(generation) => self.resync(generation).await,
            PeerEvent::WatcherLeft => self.close("watcher left"),
            PeerEvent::Shutdown => self.close("broadcast stopped"),
        }
    }

    async fn on_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::LocalCandidate(candidate) => {
                let msg = Outgoing::Text(ClientMessage::IceCandidate {
                    to: self.ctx.watcher_id.clone(),
                    candidate,
                });
                let _ = self.push(msg).await;
            }
            LinkEvent::State(LinkState::Connected) => {
                if self.phase == Phase::Watching {
                    self.recover();
                } else {
                    self.log_debug("direct link connected");
                }
            }
            LinkEvent::State(LinkState::Disconnected) => {
                if self.phase == Phase::DirectSending {
                    self.set_phase(Phase::Watching);
                    self.arm(Deadline::Grace, self.ctx.tuning.jitter_grace);
                }
            }
            LinkEvent::State(state @ (LinkState::Failed | LinkState::Closed)) => {
                let reason = format!("direct link {}", link_state_str(state));
                self.fallback(&reason).await;
            }
            LinkEvent::ChannelOpen => {
                if self.phase == Phase::Negotiating {
                    self.start_probe().await;
                }
            }
            LinkEvent::Message(Frame::Control(TransferMessage::ProbeAck)) => {
                if self.phase == Phase::Probing {
                    self.on_probe_ack().await;
                }
            }
            LinkEvent::Message(Frame::Control(msg)) => {
                self.on_watcher_message(msg, DeliveryPath::Direct)
            }
            LinkEvent::Message(Frame::Chunk(_)) => {
                self.log_debug("ignoring unexpected direct data")
            }
            LinkEvent::ChannelClosed => self.fallback("direct channel closed").await,
        }
    }

    async fn on_link_gone(&mut self) {
        self.link_events = None;
        self.fallback("direct transport stopped").await;
    }

    /// Receipts and relay acks. A file counts as delivered only once the
    /// watcher says so, whichever path carried it.
    fn on_watcher_message(&mut self, msg: TransferMessage, path: DeliveryPath) {
        match msg {
            TransferMessage::FileReceived { relative_path } => {
                if !self.receipts.confirm(&relative_path) {
                    self.log_debug("receipt for a file outside the manifest");
                }
            }
            TransferMessage::TransferReceived => self.finish(path),
            TransferMessage::RelayAck { received } => self.window.on_ack(received),
            _ => self.log_debug("ignoring unexpected watcher message"),
        }
    }

    async fn start_probe(&mut self) {
        let Some(link) = self.link.clone() else {
            return;
        };
        self.set_phase(Phase::Probing);
        self.arm(Deadline::Probe, self.ctx.tuning.probe_timeout);
        if let Err(e) = self.send_probe(&link).await {
            self.fallback(&format!("probe send failed: {e}")).await;
        }
    }

    async fn send_probe(&mut self, link: &DirectLink) -> Result<()> {
        link.send(Frame::Control(TransferMessage::ProbeStart)).await?;
        self.probe_started = Some(Instant::now());
        let total = self.ctx.tuning.probe_bytes;
        let mut sent = 0usize;
        while sent < total {
            let n = self.ctx.tuning.chunk_size.min(total - sent);
            link.send(Frame::Chunk(vec![0u8; n])).await?;
            sent += n;
        }
        Ok(())
    }

    async fn on_probe_ack(&mut self) {
        let Some(link) = self.link.clone() else {
            return;
        };
        self.deadline = None;
        let secs = self
            .probe_started
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or_default();
        let throughput = if secs > 0.0 {
            self.ctx.tuning.probe_bytes as f64 / secs
        } else {
            f64::INFINITY
        };
        let mib_per_sec = format!("{:.2}", throughput / (1024.0 * 1024.0));
        crate::logging::info_kv(
            "probe finished",
            &[
                ("session", &self.ctx.session_id),
                ("watcher", &self.ctx.watcher_id),
                ("mib_per_sec", &mib_per_sec),
            ],
        );

        if throughput >= self.ctx.tuning.throughput_threshold {
            if let Err(e) = link.send(Frame::Control(TransferMessage::ModeOk)).await {
                self.fallback(&format!("mode notice failed: {e}")).await;
                return;
            }
            self.set_phase(Phase::DirectSending);
            let handle = tokio::spawn(delivery::run_direct(
                link,
                self.ctx.source.clone(),
                self.ctx.tuning.clone(),
            ));
            self.delivery = Some((DeliveryPath::Direct, handle));
        } else {
            // Closing the link below still writes the queued notice.
            let _ = link.send(Frame::Control(TransferMessage::ModeLow)).await;
            self.fallback("probe throughput below threshold").await;
        }
    }

    async fn on_deadline(&mut self) {
        let Some((_, which)) = self.deadline.take() else {
            return;
        };
        match (which, self.phase) {
            (Deadline::Negotiation, Phase::Negotiating) => {
                self.fallback("no direct channel before negotiation timeout").await
            }
            (Deadline::Probe, Phase::Probing) => self.fallback("probe timed out").await,
            (Deadline::Grace, Phase::Watching) => {
                self.fallback("direct link did not recover within grace window").await
            }
            _ => {}
        }
    }

    async fn on_delivery_done(&mut self, path: DeliveryPath, res: Result<()>) {
        match (path, res) {
            (_, Ok(())) => self.log_debug("stream queued, waiting for receipts"),
            (DeliveryPath::Direct, Err(e)) => {
                self.fallback(&format!("direct send failed: {e}")).await;
            }
            (DeliveryPath::Relay, Err(e)) => {
                crate::logging::error_kv(
                    "relay delivery failed",
                    &[
                        ("session", &self.ctx.session_id),
                        ("watcher", &self.ctx.watcher_id),
                        ("error", &e.to_string()),
                    ],
                );
                self.close("relay delivery failed");
            }
        }
    }

    fn recover(&mut self) {
        self.deadline = None;
        self.set_phase(Phase::DirectSending);
    }

    /// Moves this watcher to relay delivery. Only the first call after the
    /// direct attempt has any effect.
    async fn fallback(&mut self, reason: &str) {
        if !self.phase.uses_direct_link() {
            return;
        }
        self.deadline = None;
        if let Some((_, handle)) = self.delivery.take() {
            handle.abort();
        }
        if let Some(link) = self.link.take() {
            link.close();
        }
        self.link_events = None;
        self.set_phase(Phase::Relay);
        crate::logging::info_kv(
            "falling back to relay",
            &[
                ("session", &self.ctx.session_id),
                ("watcher", &self.ctx.watcher_id),
                ("reason", reason),
                ("restart_file", &self.receipts.restart_index().to_string()),
            ],
        );
        self.start_relay().await;
    }

    /// Restarts a relay stream that was pinned to a lost server connection.
    async fn resync(&mut self, generation: u64) {
        if self.phase != Phase::Relay || self.relay_generation.is_some_and(|g| g >= generation) {
            return;
        }
        if let Some((_, handle)) = self.delivery.take() {
            handle.abort();
        }
        self.window.rebase();
        crate::logging::info_kv(
            "resuming relay after reclaim",
            &[
                ("session", &self.ctx.session_id),
                ("watcher", &self.ctx.watcher_id),
                ("restart_file", &self.receipts.restart_index().to_string()),
            ],
        );
        self.start_relay().await;
    }

    /// Asks the server to switch the watcher over, then streams every file
    /// the watcher has not confirmed. Both go out pinned to one uplink
    /// generation so they are kept or dropped together.
    async fn start_relay(&mut self) {
        let uplink = self.ctx.uplink.pinned();
        let request = Outgoing::Text(ClientMessage::RequestRelayFallback {
            session_id: self.ctx.session_id.clone(),
            watcher_id: self.ctx.watcher_id.clone(),
        });
        if uplink.send(request).await.is_err() {
            self.close("broadcaster connection closed");
            return;
        }
        self.relay_generation = Some(uplink.generation());
        let job = RelayJob {
            uplink,
            watcher_id: self.ctx.watcher_id.clone(),
            source: self.ctx.source.clone(),
            files: self.receipts.pending(),
            window: self.window.clone(),
            tuning: self.ctx.tuning.clone(),
        };
        let handle = tokio::spawn(delivery::run_relay(job));
        self.delivery = Some((DeliveryPath::Relay, handle));
    }

    fn finish(&mut self, path: DeliveryPath) {
        if self.phase.is_terminal() {
            return;
        }
        self.deadline = None;
        if let Some((_, handle)) = self.delivery.take() {
            handle.abort();
        }
        if let Some(link) = self.link.take() {
            link.close();
        }
        self.link_events = None;
        self.set_phase(Phase::Done);
        crate::logging::info_kv(
            "transfer complete",
            &[
                ("session", &self.ctx.session_id),
                ("watcher", &self.ctx.watcher_id),
                ("path", path.as_str()),
            ],
        );
    }

    fn close(&mut self, reason: &str) {
        if self.phase.is_terminal() {
            return;
        }
        self.deadline = None;
        if let Some((_, handle)) = self.delivery.take() {
            handle.abort();
        }
        if let Some(link) = self.link.take() {
            link.close();
        }
        self.link_events = None;
        self.set_phase(Phase::Closed);
        crate::logging::info_kv(
            "watcher transfer closed",
            &[
                ("session", &self.ctx.session_id),
                ("watcher", &self.ctx.watcher_id),
                ("reason", reason),
            ],
        );
    }

    fn arm(&mut self, which: Deadline, after: Duration) {
        self.deadline = Some((Instant::now() + after, which));
    }

    fn set_phase(&mut self, next: Phase) {
        if self.phase == next {
            return;
        }
        crate::logging::debug_kv(
            "peer phase",
            &[
                ("session", &self.ctx.session_id),
                ("watcher", &self.ctx.watcher_id),
                ("from", self.phase.as_str()),
                ("to", next.as_str()),
            ],
        );
        self.phase = next;
        let _ = self.phase_tx.send(next);
    }

    async fn push(&self, out: Outgoing) -> Result<()> {
        self.ctx.uplink.send(out).await
    }

    fn log_debug(&self, msg: &str) {
        crate::logging::debug_kv(
            msg,
            &[
                ("session", &self.ctx.session_id),
                ("watcher", &self.ctx.watcher_id),
                ("phase", self.phase.as_str()),
            ],
        );
    }
}

fn link_state_str(state: LinkState) -> &'static str {
    match state {
        LinkState::Connected => "connected",
        LinkState::Disconnected => "disconnected",
        LinkState::Failed => "failed",
        LinkState::Closed => "closed",
    }
}

async fn next_link_event(
    events: &mut Option<mpsc::UnboundedReceiver<LinkEvent>>,
) -> Option<LinkEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn deadline_elapsed(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn join_delivery(
    delivery: &mut Option<(DeliveryPath, JoinHandle<Result<()>>)>,
) -> (DeliveryPath, Result<()>) {
    match delivery {
        Some((path, handle)) => {
            let res = match handle.await {
                Ok(res) => res,
                Err(e) => Err(anyhow::anyhow!("delivery task ended: {e}")),
            };
            (*path, res)
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::*;
    use crate::transfer::link::memory::MemoryLinkFactory;
    use crate::transfer::uplink::{self, Tagged};
    use crate::transfer::RELAY_ACK_EVERY;
    use crate::wsproto::{decode_relay_chunk, relay_message};

    const MIB: usize = 1024 * 1024;
    const MIB_F: f64 = 1024.0 * 1024.0;

    fn pattern(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
    }

    fn context(
        source: FileSource,
        links: Option<Arc<dyn LinkFactory>>,
    ) -> (PeerContext, mpsc::Receiver<Tagged>) {
        context_with(TransferTuning::default(), source, links)
    }

    fn context_with(
        tuning: TransferTuning,
        source: FileSource,
        links: Option<Arc<dyn LinkFactory>>,
    ) -> (PeerContext, mpsc::Receiver<Tagged>) {
        let (tx, rx) = uplink::channel(8192);
        (
            PeerContext {
                session_id: "Sess01".into(),
                watcher_id: "w1".into(),
                source,
                tuning,
                uplink: tx,
                links,
            },
            rx,
        )
    }

    /// Plays server and watcher for the relay path: records everything the
    /// orchestrator queues and answers relay traffic with receipts and
    /// cumulative acks. Items tagged below `floor` are recorded but never
    /// reach the watcher. Resolves once every uplink handle is gone.
    struct RelayEnd {
        floor: Arc<AtomicU64>,
        lost: Arc<tokio::sync::Notify>,
        task: JoinHandle<Vec<Tagged>>,
    }

    fn serve_relay(
        mut rx: mpsc::Receiver<Tagged>,
        events: mpsc::UnboundedSender<PeerEvent>,
        lose_after: Option<u64>,
    ) -> RelayEnd {
        let floor = Arc::new(AtomicU64::new(0));
        let lost = Arc::new(tokio::sync::Notify::new());
        let (f, l) = (floor.clone(), lost.clone());
        let task = tokio::spawn(async move {
            let mut seen = Vec::new();
            let mut current: Option<String> = None;
            let mut received = 0u64;
            while let Some(item) = rx.recv().await {
                let stale = item.generation < f.load(Ordering::Acquire);
                let msg = match &item.out {
                    Outgoing::Text(ClientMessage::RelayControl { message, .. }) => {
                        Some(relay_message(message).unwrap())
                    }
                    Outgoing::Binary(_) => None,
                    _ => {
                        seen.push(item);
                        continue;
                    }
                };
                seen.push(item);
                if stale {
                    continue;
                }
                received += 1;
                let reply = match msg {
                    Some(TransferMessage::FileStart(file)) => {
                        current = Some(file.relative_path);
                        None
                    }
                    Some(TransferMessage::FileEnd) => current
                        .take()
                        .map(|relative_path| TransferMessage::FileReceived { relative_path }),
                    Some(TransferMessage::TransferComplete) => Some(TransferMessage::TransferReceived),
                    _ => None,
                };
                if let Some(reply) = reply {
                    let _ = events.send(PeerEvent::Relayed(reply));
                }
                if received % RELAY_ACK_EVERY == 0 {
                    let _ = events.send(PeerEvent::Relayed(TransferMessage::RelayAck { received }));
                }
                if lose_after == Some(received) {
                    // The server connection drops here: nothing more of this
                    // generation arrives.
                    f.store(u64::MAX, Ordering::Release);
                    l.notify_one();
                }
            }
            seen
        });
        RelayEnd { floor, lost, task }
    }

    fn fallback_requests(out: &[Tagged]) -> usize {
        out.iter()
            .filter(|m| {
                matches!(
                    m.out,
                    Outgoing::Text(ClientMessage::RequestRelayFallback { .. })
                )
            })
            .count()
    }

    /// Files as the relay path delivered them: `(relative path, bytes)` in
    /// order, plus the number of completion markers.
    fn relayed_files(out: &[Tagged]) -> (Vec<(String, Vec<u8>)>, usize) {
        let mut files: Vec<(String, Vec<u8>)> = Vec::new();
        let mut completes = 0;
        for item in out {
            match &item.out {
                Outgoing::Text(ClientMessage::RelayControl { message, .. }) => {
                    match relay_message(message).unwrap() {
                        TransferMessage::FileStart(f) => files.push((f.relative_path, Vec::new())),
                        TransferMessage::TransferComplete => completes += 1,
                        _ => {}
                    }
                }
                Outgoing::Binary(raw) => {
                    let chunk = decode_relay_chunk(raw).unwrap();
                    files.last_mut().unwrap().1.extend(chunk.payload);
                }
                _ => {}
            }
        }
        (files, completes)
    }

    fn direct_files(frames: &[Frame]) -> Vec<(String, Vec<u8>)> {
        let mut files: Vec<(String, Vec<u8>)> = Vec::new();
        let mut in_file = false;
        for frame in frames {
            match frame {
                Frame::Control(TransferMessage::FileStart(f)) => {
                    files.push((f.relative_path.clone(), Vec::new()));
                    in_file = true;
                }
                Frame::Control(TransferMessage::FileEnd) => in_file = false,
                Frame::Chunk(bytes) if in_file => files.last_mut().unwrap().1.extend(bytes),
                _ => {}
            }
        }
        files
    }

    fn has_control(frames: &[Frame], msg: TransferMessage) -> bool {
        frames.iter().any(|f| *f == Frame::Control(msg.clone()))
    }

    #[tokio::test(start_paused = true)]
    async fn slow_probe_sends_mode_low_and_relays_whole_file() {
        let data = pattern(10 * MIB, 1);
        let source = FileSource::in_memory(vec![("movie.bin".into(), data.clone())]);
        let factory = Arc::new(MemoryLinkFactory::new(0.3 * MIB_F, &TransferTuning::default()));
        let (ctx, rx) = context(source, Some(factory.clone()));

        let handle = spawn_peer(ctx);
        let relay = serve_relay(rx, handle.events.clone(), None);
        assert_eq!(handle.join().await, Phase::Done);

        let out = relay.task.await.unwrap();
        assert!(matches!(out[0].out, Outgoing::Text(ClientMessage::Offer { .. })));
        assert_eq!(fallback_requests(&out), 1);
        let (files, completes) = relayed_files(&out);
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].0, "movie.bin");
        assert_eq!(files[0].1, data);
        assert_eq!(completes, 1);

        tokio::time::sleep(Duration::from_secs(1)).await;
        let direct = factory.delivered();
        assert!(has_control(&direct, TransferMessage::ProbeStart));
        assert!(has_control(&direct, TransferMessage::ModeLow));
        assert!(!has_control(&direct, TransferMessage::ModeOk));
        assert!(direct_files(&direct).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn mode_low_does_not_hold_up_the_fallback() {
        let tuning = TransferTuning {
            probe_bytes: 64,
            chunk_size: 64,
            ..TransferTuning::default()
        };
        let source = FileSource::in_memory(vec![("a.bin".into(), pattern(300, 4))]);
        // 40 B/s: the mode notice alone takes about half a second to drain.
        let factory = Arc::new(MemoryLinkFactory::new(40.0, &tuning));
        let (ctx, rx) = context_with(tuning, source, Some(factory.clone()));
        let handle = spawn_peer(ctx);
        let relay = serve_relay(rx, handle.events.clone(), None);
        let mut phase = handle.phase_watch();

        phase.wait_for(|p| *p == Phase::Probing).await.unwrap();
        let probing_at = Instant::now();
        phase.wait_for(|p| *p == Phase::Relay).await.unwrap();
        let probe_wire = Frame::Control(TransferMessage::ProbeStart).wire_len() + 64;
        let probe_drain = Duration::from_secs_f64(probe_wire as f64 / 40.0);
        assert!(probing_at.elapsed() < probe_drain + Duration::from_millis(200));

        assert_eq!(handle.join().await, Phase::Done);
        assert_eq!(fallback_requests(&relay.task.await.unwrap()), 1);
        // Closing the link still wrote the queued notice.
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(has_control(&factory.delivered(), TransferMessage::ModeLow));
    }

    #[tokio::test(start_paused = true)]
    async fn fast_probe_delivers_everything_directly() {
        let a = pattern(3 * MIB + 17, 2);
        let b = Vec::new();
        let c = pattern(5, 3);
        let source = FileSource::in_memory(vec![
            ("dir/a.bin".into(), a.clone()),
            ("dir/empty.txt".into(), b.clone()),
            ("c.bin".into(), c.clone()),
        ]);
        let factory = Arc::new(MemoryLinkFactory::new(64.0 * MIB_F, &TransferTuning::default()));
        let (ctx, rx) = context(source, Some(factory.clone()));

        let handle = spawn_peer(ctx);
        let relay = serve_relay(rx, handle.events.clone(), None);
        assert_eq!(handle.join().await, Phase::Done);

        let out = relay.task.await.unwrap();
        assert_eq!(fallback_requests(&out), 0);
        assert!(out
            .iter()
            .any(|m| matches!(m.out, Outgoing::Text(ClientMessage::IceCandidate { .. }))));

        let direct = factory.delivered();
        assert!(has_control(&direct, TransferMessage::ModeOk));
        assert_eq!(
            direct_files(&direct),
            vec![
                ("dir/a.bin".to_string(), a),
                ("dir/empty.txt".to_string(), b),
                ("c.bin".to_string(), c)
            ]
        );
        assert_eq!(
            direct.last(),
            Some(&Frame::Control(TransferMessage::TransferComplete))
        );
        // Chunks never exceed the fixed chunk size.
        assert!(direct.iter().all(|f| match f {
            Frame::Chunk(b) => b.len() <= crate::transfer::CHUNK_SIZE,
            _ => true,
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn drained_but_unconfirmed_files_are_resent_on_relay() {
        let a = pattern(MIB, 5);
        let b = pattern(100, 6);
        let source = FileSource::in_memory(vec![
            ("a.bin".into(), a.clone()),
            ("b.bin".into(), b.clone()),
        ]);
        let factory = Arc::new(
            MemoryLinkFactory::new(64.0 * MIB_F, &TransferTuning::default()).without_receipts(),
        );
        let (ctx, rx) = context(source, Some(factory.clone()));
        let handle = spawn_peer(ctx);
        let relay = serve_relay(rx, handle.events.clone(), None);
        let mut phase = handle.phase_watch();

        phase.wait_for(|p| *p == Phase::DirectSending).await.unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        // Every byte left the channel, yet nothing was confirmed.
        assert_eq!(direct_files(&factory.delivered()).len(), 2);
        assert_eq!(handle.phase(), Phase::DirectSending);

        factory.inject(LinkEvent::State(LinkState::Failed));
        assert_eq!(handle.join().await, Phase::Done);
        let out = relay.task.await.unwrap();
        let (files, completes) = relayed_files(&out);
        assert_eq!(
            files,
            vec![("a.bin".to_string(), a), ("b.bin".to_string(), b)]
        );
        assert_eq!(completes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn no_channel_within_negotiation_timeout_goes_relay() {
        let data = pattern(1000, 4);
        let source = FileSource::in_memory(vec![("a.bin".into(), data.clone())]);
        let factory = Arc::new(
            MemoryLinkFactory::new(64.0 * MIB_F, &TransferTuning::default()).never_opens(),
        );
        let (ctx, rx) = context(source, Some(factory));
        let started = Instant::now();
        let handle = spawn_peer(ctx);
        let relay = serve_relay(rx, handle.events.clone(), None);
        assert_eq!(handle.join().await, Phase::Done);
        assert!(started.elapsed() >= crate::transfer::NEGOTIATION_TIMEOUT);

        let out = relay.task.await.unwrap();
        assert_eq!(fallback_requests(&out), 1);
        assert_eq!(relayed_files(&out).0[0].1, data);
    }

    #[tokio::test(start_paused = true)]
    async fn probe_timeout_goes_relay() {
        let source = FileSource::in_memory(vec![("a.bin".into(), pattern(10, 5))]);
        // 1 MiB at 0.05 MiB/s would take 20 s.
        let factory = Arc::new(MemoryLinkFactory::new(0.05 * MIB_F, &TransferTuning::default()));
        let (ctx, rx) = context(source, Some(factory.clone()));
        let started = Instant::now();
        let handle = spawn_peer(ctx);
        let relay = serve_relay(rx, handle.events.clone(), None);
        let mut phase = handle.phase_watch();
        phase.wait_for(|p| *p == Phase::Relay).await.unwrap();
        let waited = started.elapsed();
        assert!(waited >= crate::transfer::PROBE_TIMEOUT);
        assert!(waited < crate::transfer::PROBE_TIMEOUT + Duration::from_secs(1));
        assert_eq!(handle.join().await, Phase::Done);
        assert_eq!(fallback_requests(&relay.task.await.unwrap()), 1);
        assert!(!has_control(&factory.delivered(), TransferMessage::ModeOk));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_drop_within_grace_stays_direct() {
        let data = pattern(8 * MIB, 6);
        let source = FileSource::in_memory(vec![("a.bin".into(), data.clone())]);
        let factory = Arc::new(MemoryLinkFactory::new(2.0 * MIB_F, &TransferTuning::default()));
        let (ctx, rx) = context(source, Some(factory.clone()));
        let handle = spawn_peer(ctx);
        let relay = serve_relay(rx, handle.events.clone(), None);
        let mut phase = handle.phase_watch();

        phase.wait_for(|p| *p == Phase::DirectSending).await.unwrap();
        factory.inject(LinkEvent::State(LinkState::Disconnected));
        phase.wait_for(|p| *p == Phase::Watching).await.unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        factory.inject(LinkEvent::State(LinkState::Connected));

        assert_eq!(handle.join().await, Phase::Done);
        assert_eq!(fallback_requests(&relay.task.await.unwrap()), 0);
        assert_eq!(direct_files(&factory.delivered())[0].1, data);
    }

    #[tokio::test(start_paused = true)]
    async fn grace_expiry_restarts_current_file_on_relay() {
        let data = pattern(12 * MIB, 7);
        let source = FileSource::in_memory(vec![("a.bin".into(), data.clone())]);
        let factory = Arc::new(MemoryLinkFactory::new(2.0 * MIB_F, &TransferTuning::default()));
        let (ctx, rx) = context(source, Some(factory.clone()));
        let handle = spawn_peer(ctx);
        let relay = serve_relay(rx, handle.events.clone(), None);
        let mut phase = handle.phase_watch();

        phase.wait_for(|p| *p == Phase::DirectSending).await.unwrap();
        factory.inject(LinkEvent::State(LinkState::Disconnected));
        let dropped_at = Instant::now();
        phase.wait_for(|p| *p == Phase::Relay).await.unwrap();
        assert!(dropped_at.elapsed() >= crate::transfer::JITTER_GRACE);

        assert_eq!(handle.join().await, Phase::Done);
        let out = relay.task.await.unwrap();
        assert_eq!(fallback_requests(&out), 1);
        let (files, completes) = relayed_files(&out);
        assert_eq!(files, vec![("a.bin".to_string(), data)]);
        assert_eq!(completes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn link_failure_mid_transfer_resumes_at_unfinished_file() {
        let a = pattern(MIB, 8);
        let b = pattern(4 * MIB, 9);
        let source = FileSource::in_memory(vec![
            ("a.bin".into(), a.clone()),
            ("b.bin".into(), b.clone()),
        ]);
        let factory = Arc::new(MemoryLinkFactory::new(2.0 * MIB_F, &TransferTuning::default()));
        let (ctx, rx) = context(source, Some(factory.clone()));
        let handle = spawn_peer(ctx);
        let relay = serve_relay(rx, handle.events.clone(), None);
        let mut phase = handle.phase_watch();

        phase.wait_for(|p| *p == Phase::DirectSending).await.unwrap();
        // About 3 MiB of the stream has left by now: all of a, part of b.
        tokio::time::sleep(Duration::from_millis(1500)).await;
        factory.inject(LinkEvent::State(LinkState::Failed));
        factory.inject(LinkEvent::State(LinkState::Failed));
        factory.inject(LinkEvent::ChannelClosed);

        assert_eq!(handle.join().await, Phase::Done);
        let out = relay.task.await.unwrap();
        assert_eq!(fallback_requests(&out), 1);
        let (files, completes) = relayed_files(&out);
        assert_eq!(files, vec![("b.bin".to_string(), b)]);
        assert_eq!(completes, 1);

        let direct = direct_files(&factory.delivered());
        assert_eq!(direct[0], ("a.bin".to_string(), a));
    }

    #[tokio::test(start_paused = true)]
    async fn reclaim_restarts_relay_at_the_unconfirmed_file() {
        let a = pattern(100, 10);
        let b = pattern(100 * 1024, 11);
        let source = FileSource::in_memory(vec![
            ("a.bin".into(), a.clone()),
            ("b.bin".into(), b.clone()),
        ]);
        let tuning = TransferTuning {
            chunk_size: 1024,
            relay_ping_every: 0,
            ..TransferTuning::default()
        };
        let (ctx, rx) = context_with(tuning, source, None);
        let uplink = ctx.uplink.clone();
        let handle = spawn_peer(ctx);
        // a arrives whole, then the connection dies a few chunks into b.
        let relay = serve_relay(rx, handle.events.clone(), Some(10));

        relay.lost.notified().await;
        let generation = uplink.advance();
        relay.floor.store(generation, Ordering::Release);
        // An old or repeated resync changes nothing.
        handle.notify(PeerEvent::Resync(0));
        handle.notify(PeerEvent::Resync(generation));
        handle.notify(PeerEvent::Resync(generation));
        drop(uplink);

        assert_eq!(handle.join().await, Phase::Done);
        let out = relay.task.await.unwrap();
        assert_eq!(fallback_requests(&out), 2);
        let resent: Vec<Tagged> = out
            .iter()
            .filter(|t| t.generation == generation)
            .cloned()
            .collect();
        assert_eq!(fallback_requests(&resent), 1);
        let (files, completes) = relayed_files(&resent);
        assert_eq!(files, vec![("b.bin".to_string(), b)]);
        assert_eq!(completes, 1);

        let (first, _) = relayed_files(&out[..out.len() - resent.len()]);
        assert_eq!(first[0], ("a.bin".to_string(), a));
    }

    #[tokio::test(start_paused = true)]
    async fn watcher_leaving_cancels_pending_timers() {
        let source = FileSource::in_memory(vec![("a.bin".into(), pattern(10, 1))]);
        let factory = Arc::new(
            MemoryLinkFactory::new(64.0 * MIB_F, &TransferTuning::default()).never_opens(),
        );
        let (ctx, rx) = context(source, Some(factory));
        let handle = spawn_peer(ctx);
        let relay = serve_relay(rx, handle.events.clone(), None);
        let mut phase = handle.phase_watch();
        phase.wait_for(|p| *p == Phase::Negotiating).await.unwrap();

        handle.notify(PeerEvent::WatcherLeft);
        assert_eq!(handle.join().await, Phase::Closed);
        tokio::time::sleep(Duration::from_secs(60)).await;

        let out = relay.task.await.unwrap();
        assert_eq!(fallback_requests(&out), 0);
        assert!(!out.iter().any(|m| matches!(m.out, Outgoing::Binary(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn declined_answer_falls_back_immediately() {
        let data = pattern(100, 2);
        let source = FileSource::in_memory(vec![("a.bin".into(), data.clone())]);
        let factory = Arc::new(
            MemoryLinkFactory::new(64.0 * MIB_F, &TransferTuning::default()).never_opens(),
        );
        let (ctx, rx) = context(source, Some(factory));
        let started = Instant::now();
        let handle = spawn_peer(ctx);
        let relay = serve_relay(rx, handle.events.clone(), None);
        handle.notify(PeerEvent::Answer(serde_json::json!({"accepted": false})));
        assert_eq!(handle.join().await, Phase::Done);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(relayed_files(&relay.task.await.unwrap()).0[0].1, data);
    }

    #[tokio::test]
    async fn relay_only_requests_fallback_first() {
        let data = pattern(600 * 1024, 3);
        let source = FileSource::in_memory(vec![("a.bin".into(), data.clone())]);
        let (ctx, rx) = context(source, None);
        let handle = spawn_peer(ctx);
        let relay = serve_relay(rx, handle.events.clone(), None);
        assert_eq!(handle.join().await, Phase::Done);

        let out = relay.task.await.unwrap();
        assert!(matches!(
            out[0].out,
            Outgoing::Text(ClientMessage::RequestRelayFallback { .. })
        ));
        let (files, completes) = relayed_files(&out);
        assert_eq!(files[0].1, data);
        assert_eq!(completes, 1);
    }

    #[tokio::test]
    async fn relay_without_receipts_never_completes() {
        let source = FileSource::in_memory(vec![("a.bin".into(), pattern(10, 3))]);
        let (ctx, mut rx) = context(source, None);
        let handle = spawn_peer(ctx);
        let mut queued = 0;
        while let Some(item) = rx.recv().await {
            queued += 1;
            if matches!(&item.out, Outgoing::Text(ClientMessage::RelayControl { message, .. })
                if relay_message(message).unwrap() == TransferMessage::TransferComplete)
            {
                break;
            }
        }
        // Request, start, one chunk, end, complete.
        assert_eq!(queued, 5);
        tokio::task::yield_now().await;
        assert_eq!(handle.phase(), Phase::Relay);
        handle.notify(PeerEvent::Shutdown);
        assert_eq!(handle.join().await, Phase::Closed);
    }
}
