use std::path::PathBuf;

use anyhow::{Context, Result};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio_tungstenite::tungstenite::protocol::Message;

use crate::client::{self, Incoming, Outgoing, WsStream, DEFAULT_HEALTHZ_ATTEMPTS};
use crate::config::DirectConfig;
use crate::direct::{WatcherLink, WatcherLinkEvent};
use crate::receive::assembler::{Assembler, Step};
use crate::receive::storage::{DiskSinkFactory, SinkFactory, ZipPackage};
use crate::transfer::message::{Frame, TransferMessage};
use crate::transfer::RELAY_ACK_EVERY;
use crate::wsproto::{self, ClientMessage, RelayChunk, ServerMessage};

#[derive(Debug, Clone)]
pub struct ReceiveOptions {
    pub server_url: String,
    pub session_id: String,
    pub out_dir: PathBuf,
    /// `enabled = false` declines every direct offer.
    pub direct: DirectConfig,
    /// Probe payload size to count before acknowledging.
    pub probe_bytes: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiveSummary {
    pub session_id: String,
    /// File or package name written under the output folder.
    pub delivered: String,
    pub bytes: u64,
    pub via_relay: bool,
}

type WsWriter = SplitSink<WsStream, Message>;

/// Joins a broadcast and writes its files into `out_dir`. Resolves once the
/// transfer completed; any rejection, server error or ended broadcast is an
/// error and leaves no partial file behind.
pub async fn run_receive(opts: ReceiveOptions) -> Result<ReceiveSummary> {
    client::wait_for_healthz(&opts.server_url, DEFAULT_HEALTHZ_ATTEMPTS).await?;
    let ws = client::connect(&opts.server_url).await?;
    let (mut write, mut read) = ws.split();
    send(
        &mut write,
        ClientMessage::JoinBroadcast {
            session_id: opts.session_id.clone(),
        },
    )
    .await?;

    let mut watcher = Watcher::new(opts);
    let res = watcher.run(&mut write, &mut read).await;
    if res.is_err() {
        watcher.abandon();
    }
    // Lets the last receipts on the direct link reach the owner.
    if let Some(link) = watcher.link.take() {
        link.shutdown().await;
    }
    let _ = write.close().await;
    res
}

/// Which path an input arrived on; receipts go back the same way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Arrival {
    Direct,
    Relay,
}

enum Input {
    Server(Option<Result<Message, tokio_tungstenite::tungstenite::Error>>),
    Link(Option<WatcherLinkEvent>),
}

/// Something the watcher has to send after handling an input.
#[derive(Debug, Clone, PartialEq)]
enum Reply {
    Server(ClientMessage),
    Direct(Frame),
}

struct Watcher {
    opts: ReceiveOptions,
    /// Used once, when the manifest arrives. Disk under `out_dir` when unset.
    sinks: Option<Box<dyn SinkFactory>>,
    assembler: Option<Assembler>,
    /// Set by `initiate-relay-fallback`; from then on only relay input counts.
    relay_mode: bool,
    link: Option<WatcherLink>,
    /// Probe bytes counted since the last `probe-start`.
    probe_seen: Option<usize>,
    /// `mode-ok` arrived: direct frames now feed the assembler.
    direct_active: bool,
    /// Sender of the latest relay input; relay receipts and acks go there.
    relay_peer: Option<String>,
    /// Relay messages received so far, ignored ones included.
    relay_seen: u64,
    outbox: Vec<Reply>,
    last_percent: u8,
}

impl Watcher {
    fn new(opts: ReceiveOptions) -> Self {
        Self {
            opts,
            sinks: None,
            assembler: None,
            relay_mode: false,
            link: None,
            probe_seen: None,
            direct_active: false,
            relay_peer: None,
            relay_seen: 0,
            outbox: Vec::new(),
            last_percent: 0,
        }
    }

    async fn run(
        &mut self,
        write: &mut WsWriter,
        read: &mut futures_util::stream::SplitStream<WsStream>,
    ) -> Result<ReceiveSummary> {
        loop {
            let input = tokio::select! {
                msg = read.next() => Input::Server(msg),
                ev = next_link_event(&mut self.link) => Input::Link(ev),
            };
            let step = match input {
                Input::Server(None) => anyhow::bail!("server closed the connection"),
                Input::Server(Some(Err(e))) => {
                    return Err(e).context("server connection failed")
                }
                Input::Server(Some(Ok(msg))) => match client::decode_incoming(msg) {
                    Ok(Incoming::Server(msg)) => self.on_server_message(msg).await?,
                    Ok(Incoming::Relay(chunk)) => self.on_relay_chunk(chunk).await?,
                    Ok(Incoming::Closed) => anyhow::bail!("server closed the connection"),
                    Ok(Incoming::Ignored) => Step::Continue,
                    Err(e) => {
                        crate::logging::debug_kv(
                            "undecodable server message",
                            &[("error", &e.to_string())],
                        );
                        Step::Continue
                    }
                },
                Input::Link(ev) => self.on_link_event(ev).await?,
            };
            self.flush(write).await?;
            if let Step::Complete(delivered) = step {
                return Ok(self.summary(delivered));
            }
        }
    }

    async fn flush(&mut self, write: &mut WsWriter) -> Result<()> {
        for reply in std::mem::take(&mut self.outbox) {
            match reply {
                Reply::Server(msg) => send(write, msg).await?,
                Reply::Direct(frame) => {
                    if let Some(link) = &self.link {
                        link.send(frame);
                    }
                }
            }
        }
        Ok(())
    }

    async fn on_server_message(&mut self, msg: ServerMessage) -> Result<Step> {
        match msg {
            ServerMessage::ManifestReady {
                session_id,
                manifest,
            } => {
                crate::logging::info_kv(
                    "joined broadcast",
                    &[
                        ("session", &session_id),
                        ("files", &manifest.len().to_string()),
                        ("bytes", &crate::manifest::total_bytes(&manifest).to_string()),
                    ],
                );
                let sinks = match self.sinks.take() {
                    Some(sinks) => sinks,
                    None => Box::new(DiskSinkFactory::new(&self.opts.out_dir)),
                };
                self.assembler = Some(Assembler::new(
                    &session_id,
                    &manifest,
                    sinks,
                    Box::new(ZipPackage::new()),
                ));
            }
            ServerMessage::JoinRejected { reason } => {
                anyhow::bail!("join rejected: {reason}");
            }
            ServerMessage::ErrorMessage { message } => {
                anyhow::bail!("server error: {message}");
            }
            ServerMessage::BroadcastEnded => {
                anyhow::bail!("broadcast ended before the transfer completed");
            }
            ServerMessage::OwnerUnstable => {
                crate::logging::warn_kv(
                    "broadcaster connection unstable",
                    &[("session", &self.opts.session_id)],
                );
            }
            ServerMessage::OwnerRecovered => {
                crate::logging::info_kv(
                    "broadcaster reconnected",
                    &[("session", &self.opts.session_id)],
                );
            }
            ServerMessage::Offer { from, sdp } => self.on_offer(from, sdp),
            ServerMessage::IceCandidate { candidate, .. } => {
                if let Some(link) = &self.link {
                    link.add_candidate(&candidate);
                }
            }
            ServerMessage::InitiateRelayFallback => {
                if !self.relay_mode {
                    crate::logging::info_kv(
                        "switching to relay",
                        &[("session", &self.opts.session_id)],
                    );
                }
                self.relay_mode = true;
                self.direct_active = false;
                self.close_link();
            }
            ServerMessage::RelayControl { from, message } => {
                self.count_relay(&from)?;
                if !self.relay_mode {
                    return Ok(Step::Continue);
                }
                let msg = wsproto::relay_message(&message)?;
                return self.on_transfer_message(msg, Arrival::Relay).await;
            }
            other => {
                crate::logging::debug_kv("ignoring server message", &[("type", other.kind())]);
            }
        }
        Ok(Step::Continue)
    }

    fn on_offer(&mut self, from: String, sdp: Value) {
        let answer = if !self.opts.direct.enabled || self.relay_mode {
            WatcherLink::declined()
        } else {
            match WatcherLink::accept_offer(&sdp, &self.opts.direct.bind_addr) {
                Ok(link) => {
                    self.close_link();
                    self.link = Some(link);
                    self.probe_seen = None;
                    WatcherLink::answer()
                }
                Err(e) => {
                    crate::logging::warn_kv(
                        "cannot use direct link",
                        &[("session", &self.opts.session_id), ("error", &e.to_string())],
                    );
                    WatcherLink::declined()
                }
            }
        };
        self.outbox
            .push(Reply::Server(ClientMessage::Answer { to: from, sdp: answer }));
    }

    async fn on_relay_chunk(&mut self, chunk: RelayChunk) -> Result<Step> {
        self.count_relay(&chunk.peer)?;
        if !self.relay_mode {
            return Ok(Step::Continue);
        }
        self.on_chunk(chunk.payload).await?;
        Ok(Step::Continue)
    }

    /// Every relay message counts towards the sender's window, whether or not
    /// it is used.
    fn count_relay(&mut self, from: &str) -> Result<()> {
        self.relay_peer = Some(from.to_string());
        self.relay_seen += 1;
        if self.relay_seen % RELAY_ACK_EVERY == 0 {
            let received = self.relay_seen;
            self.reply(TransferMessage::RelayAck { received }, Arrival::Relay)?;
        }
        Ok(())
    }

    async fn on_link_event(&mut self, ev: Option<WatcherLinkEvent>) -> Result<Step> {
        let Some(ev) = ev else {
            self.link = None;
            return Ok(Step::Continue);
        };
        match ev {
            WatcherLinkEvent::Connected => {
                crate::logging::debug_kv("direct link connected", &[("session", &self.opts.session_id)]);
                Ok(Step::Continue)
            }
            WatcherLinkEvent::Closed => {
                self.link = None;
                Ok(Step::Continue)
            }
            WatcherLinkEvent::Frame(frame) => self.on_direct_frame(frame).await,
        }
    }

    async fn on_direct_frame(&mut self, frame: Frame) -> Result<Step> {
        if self.relay_mode {
            return Ok(Step::Continue);
        }
        match frame {
            Frame::Control(TransferMessage::ProbeStart) => {
                self.probe_seen = Some(0);
                Ok(Step::Continue)
            }
            Frame::Chunk(bytes) if self.probe_seen.is_some() => {
                let seen = self.probe_seen.unwrap_or(0) + bytes.len();
                if seen >= self.opts.probe_bytes {
                    self.probe_seen = None;
                    self.outbox
                        .push(Reply::Direct(Frame::Control(TransferMessage::ProbeAck)));
                } else {
                    self.probe_seen = Some(seen);
                }
                Ok(Step::Continue)
            }
            Frame::Control(TransferMessage::ModeOk) => {
                self.direct_active = true;
                crate::logging::info_kv("receiving directly", &[("session", &self.opts.session_id)]);
                Ok(Step::Continue)
            }
            Frame::Control(TransferMessage::ModeLow) => {
                crate::logging::info_kv(
                    "direct link too slow, waiting for relay",
                    &[("session", &self.opts.session_id)],
                );
                Ok(Step::Continue)
            }
            _ if !self.direct_active => Ok(Step::Continue),
            Frame::Control(msg) => self.on_transfer_message(msg, Arrival::Direct).await,
            Frame::Chunk(bytes) => {
                self.on_chunk(bytes).await?;
                Ok(Step::Continue)
            }
        }
    }

    async fn on_transfer_message(&mut self, msg: TransferMessage, via: Arrival) -> Result<Step> {
        let step = self.with_assembler(move |asm| asm.handle_message(msg)).await?;
        match &step {
            Step::FileDone(relative_path) => {
                let relative_path = relative_path.clone();
                self.reply(TransferMessage::FileReceived { relative_path }, via)?;
            }
            Step::Complete(_) => self.reply(TransferMessage::TransferReceived, via)?,
            Step::Continue => {}
        }
        Ok(step)
    }

    async fn on_chunk(&mut self, bytes: Vec<u8>) -> Result<()> {
        let percent = self
            .with_assembler(move |asm| {
                asm.handle_chunk(&bytes)?;
                Ok(asm.progress().percent)
            })
            .await?;
        if percent / 10 > self.last_percent / 10 {
            crate::logging::info_kv(
                "receive progress",
                &[("session", &self.opts.session_id), ("percent", &percent.to_string())],
            );
        }
        self.last_percent = self.last_percent.max(percent);
        Ok(())
    }

    /// Runs `f` on the blocking pool: the assembler writes files with
    /// blocking I/O.
    async fn with_assembler<T, F>(&mut self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Assembler) -> Result<T> + Send + 'static,
    {
        let mut asm = self
            .assembler
            .take()
            .context("transfer data before the manifest")?;
        let (asm, res) = tokio::task::spawn_blocking(move || {
            let res = f(&mut asm);
            (asm, res)
        })
        .await
        .context("assembler task failed")?;
        self.assembler = Some(asm);
        res
    }

    fn reply(&mut self, msg: TransferMessage, via: Arrival) -> Result<()> {
        match via {
            Arrival::Direct => self.outbox.push(Reply::Direct(Frame::Control(msg))),
            Arrival::Relay => {
                let Some(to) = self.relay_peer.clone() else {
                    return Ok(());
                };
                let message = serde_json::to_value(&msg)?;
                self.outbox
                    .push(Reply::Server(ClientMessage::RelayControl { to, message }));
            }
        }
        Ok(())
    }

    /// Drops the partial file of a failed transfer.
    fn abandon(&mut self) {
        if let Some(asm) = self.assembler.as_mut() {
            asm.abort();
        }
    }

    fn summary(&self, delivered: String) -> ReceiveSummary {
        ReceiveSummary {
            session_id: self.opts.session_id.clone(),
            delivered,
            bytes: self
                .assembler
                .as_ref()
                .map(|a| a.progress().received)
                .unwrap_or(0),
            via_relay: self.relay_mode,
        }
    }

    fn close_link(&mut self) {
        if let Some(link) = self.link.take() {
            link.close();
        }
    }
}

async fn next_link_event(link: &mut Option<WatcherLink>) -> Option<WatcherLinkEvent> {
    match link {
        Some(link) => link.recv().await,
        None => std::future::pending().await,
    }
}

async fn send(write: &mut WsWriter, msg: ClientMessage) -> Result<()> {
    write
        .send(Outgoing::Text(msg).into_ws()?)
        .await
        .context("send to server")
}
