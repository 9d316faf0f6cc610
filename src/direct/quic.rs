use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket as StdUdpSocket};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use base64::Engine;
use quinn::crypto::rustls::{QuicClientConfig, QuicServerConfig};
use quinn::{ConnectionError, Endpoint, EndpointConfig, IdleTimeout, TransportConfig};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, watch};

use crate::config::DirectConfig;
use crate::direct::{codec, stun};
use crate::transfer::link::{
    link_pair, wait_closed, DirectLink, LinkEnds, LinkEvent, LinkFactory, LinkState,
};
use crate::transfer::message::Frame;

pub const ALPN: &[u8] = b"dropshare/1";
const SERVER_NAME: &str = "dropshare.direct";
const STUN_TIMEOUT: Duration = Duration::from_secs(2);
const KEEP_ALIVE: Duration = Duration::from_secs(4);
const IDLE_TIMEOUT: Duration = Duration::from_secs(15);
const DIAL_TIMEOUT: Duration = Duration::from_secs(30);
/// How long a finished sender waits for the watcher to hang up.
const FINISH_TIMEOUT: Duration = Duration::from_secs(10);
/// Bound on writing frames that were queued when a side closed its link.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);
/// How long a closing watcher waits for the owner to read its last replies.
const REPLY_FLUSH_TIMEOUT: Duration = Duration::from_secs(3);

/// Negotiation payload carried in `offer.sdp`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuicOffer {
    /// Base64 DER of the owner's one-off certificate.
    pub cert: String,
    pub alpn: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuicCandidate {
    pub address: String,
    pub kind: String,
}

/// Owner-side QUIC links: one UDP endpoint and certificate per watcher.
pub struct QuicLinkFactory {
    settings: DirectConfig,
    high_water: u64,
    low_water: u64,
}

impl QuicLinkFactory {
    pub fn new(settings: DirectConfig, high_water: u64, low_water: u64) -> Self {
        Self {
            settings,
            high_water,
            low_water,
        }
    }
}

impl LinkFactory for QuicLinkFactory {
    fn open(
        &self,
        watcher_id: &str,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<(DirectLink, Value)> {
        let certified = rcgen::generate_simple_self_signed(vec![SERVER_NAME.to_string()])
            .context("generate direct link certificate")?;
        let cert_der = certified.cert.der().clone();
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
            certified.key_pair.serialize_der(),
        ));
        let server_config = server_config(cert_der.clone(), key)?;

        let socket = StdUdpSocket::bind(&self.settings.bind_addr)
            .with_context(|| format!("bind direct link socket {}", self.settings.bind_addr))?;
        socket.set_nonblocking(true)?;

        let (link, ends) = link_pair(self.high_water, self.low_water, events);
        let offer = QuicOffer {
            cert: base64::engine::general_purpose::STANDARD.encode(cert_der.as_ref()),
            alpn: String::from_utf8_lossy(ALPN).to_string(),
        };
        let settings = self.settings.clone();
        let watcher = watcher_id.to_string();
        tokio::spawn(async move {
            let events = ends.events.clone();
            if let Err(e) = drive_owner(socket, server_config, settings, ends).await {
                crate::logging::warn_kv(
                    "direct link ended with error",
                    &[("watcher", &watcher), ("error", &e.to_string())],
                );
                let _ = events.send(LinkEvent::State(LinkState::Failed));
            }
        });
        Ok((link, serde_json::to_value(offer)?))
    }
}

async fn drive_owner(
    socket: StdUdpSocket,
    server_config: quinn::ServerConfig,
    settings: DirectConfig,
    ends: LinkEnds,
) -> Result<()> {
    let LinkEnds {
        mut frames,
        mut signals,
        flow,
        mut closed,
        events,
    } = ends;

    let socket = tokio::net::UdpSocket::from_std(socket)?;
    let reflexive = match settings.stun_server.as_deref() {
        Some(server) => match tokio::time::timeout(STUN_TIMEOUT, stun::query(&socket, server)).await {
            Ok(Ok(addr)) => Some(addr),
            Ok(Err(e)) => {
                crate::logging::warn_kv("stun query failed", &[("error", &e.to_string())]);
                None
            }
            Err(_) => {
                crate::logging::warn_kv("stun query timed out", &[("server", server)]);
                None
            }
        },
        None => None,
    };
    let socket = socket.into_std()?;
    let endpoint = Endpoint::new(
        EndpointConfig::default(),
        Some(server_config),
        socket,
        Arc::new(quinn::TokioRuntime),
    )?;
    let local = endpoint.local_addr()?;

    let host = host_candidate(&settings, local);
    let _ = events.send(LinkEvent::LocalCandidate(candidate_value(&host, "host")));
    if let Some(addr) = reflexive {
        let _ = events.send(LinkEvent::LocalCandidate(candidate_value(&addr.to_string(), "srflx")));
    }

    // Signals are only informational here: the watcher dials us.
    tokio::spawn(async move { while signals.recv().await.is_some() {} });

    let incoming = tokio::select! {
        inc = endpoint.accept() => inc,
        _ = wait_closed(&mut closed) => {
            endpoint.close(0u32.into(), b"closed");
            return Ok(());
        }
    };
    let Some(incoming) = incoming else {
        return Ok(());
    };
    let connecting = incoming.accept().context("accept direct link")?;
    let conn = tokio::select! {
        res = connecting => res.context("direct link handshake")?,
        _ = wait_closed(&mut closed) => {
            endpoint.close(0u32.into(), b"closed");
            return Ok(());
        }
    };
    let _ = events.send(LinkEvent::State(LinkState::Connected));

    let (mut send, mut recv) = conn.open_bi().await.context("open direct stream")?;
    let _ = events.send(LinkEvent::ChannelOpen);

    let reader_events = events.clone();
    let reader = tokio::spawn(async move {
        loop {
            match codec::read_frame(&mut recv).await {
                Ok(Some(frame)) => {
                    let _ = reader_events.send(LinkEvent::Message(frame));
                }
                Ok(None) | Err(_) => break,
            }
        }
    });

    let mut peer_gone = None;
    loop {
        tokio::select! {
            frame = frames.recv() => {
                let Some(frame) = frame else { break };
                let len = frame.wire_len();
                if let Err(e) = codec::write_frame(&mut send, &frame).await {
                    crate::logging::debug_kv("direct write failed", &[("error", &e.to_string())]);
                    let err = tokio::time::timeout(FINISH_TIMEOUT, conn.closed())
                        .await
                        .unwrap_or(ConnectionError::TimedOut);
                    peer_gone = Some(err);
                    break;
                }
                flow.on_drained(len);
            }
            err = conn.closed() => {
                peer_gone = Some(err);
                break;
            }
            _ = wait_closed(&mut closed) => break,
        }
    }

    match peer_gone {
        Some(err) => {
            flow.close();
            let _ = events.send(LinkEvent::ChannelClosed);
            let _ = events.send(LinkEvent::State(connection_end_state(&err)));
        }
        None => {
            // Owner closed the link: write what was already queued, finish the
            // stream and give the watcher a chance to read everything before
            // the socket goes away.
            let flush = async {
                while let Ok(frame) = frames.try_recv() {
                    if codec::write_frame(&mut send, &frame).await.is_err() {
                        break;
                    }
                }
            };
            let _ = tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, flush).await;
            let _ = send.finish();
            let _ = tokio::time::timeout(FINISH_TIMEOUT, conn.closed()).await;
            conn.close(0u32.into(), b"done");
        }
    }
    reader.abort();
    endpoint.close(0u32.into(), b"done");
    let _ = tokio::time::timeout(Duration::from_secs(1), endpoint.wait_idle()).await;
    Ok(())
}

fn connection_end_state(err: &ConnectionError) -> LinkState {
    match err {
        ConnectionError::ApplicationClosed(_)
        | ConnectionError::ConnectionClosed(_)
        | ConnectionError::LocallyClosed => LinkState::Closed,
        _ => LinkState::Failed,
    }
}

fn candidate_value(address: &str, kind: &str) -> Value {
    json!({ "address": address, "kind": kind })
}

/// Address the watcher should dial for the local endpoint.
fn host_candidate(settings: &DirectConfig, local: SocketAddr) -> String {
    if let Some(host) = settings.advertise_host.as_deref().filter(|h| !h.trim().is_empty()) {
        return format!("{}:{}", host.trim(), local.port());
    }
    let ip = if local.ip().is_unspecified() {
        outbound_ip().unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
    } else {
        local.ip()
    };
    SocketAddr::new(ip, local.port()).to_string()
}

/// Interface address used for outbound traffic. Connecting a UDP socket sends
/// nothing; it only asks the OS for a route.
fn outbound_ip() -> Option<IpAddr> {
    let probe = StdUdpSocket::bind("0.0.0.0:0").ok()?;
    probe.connect("192.0.2.1:9").ok()?;
    probe.local_addr().ok().map(|a| a.ip())
}

fn crypto_provider() -> Arc<rustls::crypto::CryptoProvider> {
    Arc::new(rustls::crypto::aws_lc_rs::default_provider())
}

fn transport_config() -> Result<Arc<TransportConfig>> {
    let mut transport = TransportConfig::default();
    transport.keep_alive_interval(Some(KEEP_ALIVE));
    transport.max_idle_timeout(Some(IdleTimeout::try_from(IDLE_TIMEOUT)?));
    Ok(Arc::new(transport))
}

fn server_config(
    cert: CertificateDer<'static>,
    key: PrivateKeyDer<'static>,
) -> Result<quinn::ServerConfig> {
    let mut tls = rustls::ServerConfig::builder_with_provider(crypto_provider())
        .with_protocol_versions(&[&rustls::version::TLS13])?
        .with_no_client_auth()
        .with_single_cert(vec![cert], key)?;
    tls.alpn_protocols = vec![ALPN.to_vec()];
    let crypto = QuicServerConfig::try_from(tls)?;
    let mut config = quinn::ServerConfig::with_crypto(Arc::new(crypto));
    config.transport_config(transport_config()?);
    Ok(config)
}

fn client_config(cert: CertificateDer<'static>) -> Result<quinn::ClientConfig> {
    let mut roots = rustls::RootCertStore::empty();
    roots.add(cert)?;
    let mut tls = rustls::ClientConfig::builder_with_provider(crypto_provider())
        .with_protocol_versions(&[&rustls::version::TLS13])?
        .with_root_certificates(roots)
        .with_no_client_auth();
    tls.alpn_protocols = vec![ALPN.to_vec()];
    let crypto = QuicClientConfig::try_from(tls)?;
    let mut config = quinn::ClientConfig::new(Arc::new(crypto));
    config.transport_config(transport_config()?);
    Ok(config)
}

/// What the watcher side of a direct link reports to its owner.
#[derive(Debug)]
pub enum WatcherLinkEvent {
    Connected,
    Frame(Frame),
    Closed,
}

/// Watcher side of a QUIC link: dials the owner's candidates and exposes the
/// owner's stream as frames.
pub struct WatcherLink {
    events: mpsc::UnboundedReceiver<WatcherLinkEvent>,
    outgoing: mpsc::UnboundedSender<Frame>,
    candidates: mpsc::UnboundedSender<String>,
    closed: watch::Sender<bool>,
    driver: Option<tokio::task::JoinHandle<()>>,
}

impl WatcherLink {
    /// Accepts an owner's offer and starts waiting for candidates.
    pub fn accept_offer(offer: &Value, bind_addr: &str) -> Result<Self> {
        let offer: QuicOffer = serde_json::from_value(offer.clone()).context("direct offer")?;
        if offer.alpn.as_bytes() != ALPN {
            anyhow::bail!("unsupported direct link protocol: {}", offer.alpn);
        }
        let der = base64::engine::general_purpose::STANDARD
            .decode(offer.cert.as_bytes())
            .context("direct offer certificate")?;
        let config = client_config(CertificateDer::from(der))?;
        let bind: SocketAddr = bind_addr
            .parse()
            .with_context(|| format!("invalid direct bind address '{bind_addr}'"))?;
        let mut endpoint = Endpoint::client(bind).context("bind direct link client")?;
        endpoint.set_default_client_config(config);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (candidates_tx, candidates_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = watch::channel(false);
        let driver = tokio::spawn(async move {
            let events = events_tx.clone();
            if let Err(e) =
                drive_watcher(endpoint, candidates_rx, outgoing_rx, closed_rx, events_tx).await
            {
                crate::logging::debug_kv("direct link ended", &[("error", &e.to_string())]);
            }
            let _ = events.send(WatcherLinkEvent::Closed);
        });
        Ok(Self {
            events: events_rx,
            outgoing: outgoing_tx,
            candidates: candidates_tx,
            closed: closed_tx,
            driver: Some(driver),
        })
    }

    pub fn answer() -> Value {
        json!({ "accepted": true })
    }

    pub fn declined() -> Value {
        json!({ "accepted": false })
    }

    pub fn add_candidate(&self, candidate: &Value) {
        match serde_json::from_value::<QuicCandidate>(candidate.clone()) {
            Ok(c) => {
                let _ = self.candidates.send(c.address);
            }
            Err(e) => crate::logging::debug_kv("ignoring candidate", &[("error", &e.to_string())]),
        }
    }

    pub fn send(&self, frame: Frame) {
        let _ = self.outgoing.send(frame);
    }

    pub async fn recv(&mut self) -> Option<WatcherLinkEvent> {
        self.events.recv().await
    }

    pub fn close(&self) {
        let _ = self.closed.send(true);
    }

    /// Closes the link and waits until queued replies were written.
    pub async fn shutdown(mut self) {
        self.close();
        if let Some(driver) = self.driver.take() {
            let _ = tokio::time::timeout(REPLY_FLUSH_TIMEOUT + CLOSE_FLUSH_TIMEOUT, driver).await;
        }
    }
}

impl Drop for WatcherLink {
    fn drop(&mut self) {
        self.close();
    }
}

async fn drive_watcher(
    endpoint: Endpoint,
    mut candidates: mpsc::UnboundedReceiver<String>,
    mut outgoing: mpsc::UnboundedReceiver<Frame>,
    mut closed: watch::Receiver<bool>,
    events: mpsc::UnboundedSender<WatcherLinkEvent>,
) -> Result<()> {
    let (dialed_tx, mut dialed_rx) = mpsc::unbounded_channel();
    let deadline = tokio::time::sleep(DIAL_TIMEOUT);
    tokio::pin!(deadline);
    let conn = loop {
        tokio::select! {
            Some(address) = candidates.recv() => {
                let endpoint = endpoint.clone();
                let dialed = dialed_tx.clone();
                tokio::spawn(async move {
                    let res = dial(&endpoint, &address).await;
                    if let Err(e) = &res {
                        crate::logging::debug_kv(
                            "direct dial failed",
                            &[("address", &address), ("error", &e.to_string())],
                        );
                    }
                    let _ = dialed.send(res);
                });
            }
            Some(res) = dialed_rx.recv() => {
                if let Ok(conn) = res {
                    break conn;
                }
            }
            _ = &mut deadline => anyhow::bail!("no direct candidate answered"),
            _ = wait_closed(&mut closed) => {
                endpoint.close(0u32.into(), b"closed");
                return Ok(());
            }
        }
    };
    let _ = events.send(WatcherLinkEvent::Connected);

    let (mut send, mut recv) = tokio::select! {
        res = conn.accept_bi() => res.context("accept direct stream")?,
        _ = wait_closed(&mut closed) => {
            conn.close(0u32.into(), b"closed");
            endpoint.close(0u32.into(), b"closed");
            return Ok(());
        }
    };
    let (wrap_up_tx, wrap_up_rx) = oneshot::channel();
    let writer = tokio::spawn(write_replies(send, outgoing, wrap_up_rx));

    loop {
        tokio::select! {
            frame = codec::read_frame(&mut recv) => match frame {
                Ok(Some(frame)) => {
                    let _ = events.send(WatcherLinkEvent::Frame(frame));
                }
                Ok(None) => break,
                Err(e) => {
                    crate::logging::debug_kv("direct read failed", &[("error", &e.to_string())]);
                    break;
                }
            },
            _ = wait_closed(&mut closed) => break,
        }
    }
    let _ = wrap_up_tx.send(());
    if tokio::time::timeout(REPLY_FLUSH_TIMEOUT, writer).await.is_err() {
        crate::logging::debug_kv("direct replies not confirmed before close", &[]);
    }
    conn.close(0u32.into(), b"bye");
    endpoint.close(0u32.into(), b"bye");
    let _ = tokio::time::timeout(Duration::from_secs(1), endpoint.wait_idle()).await;
    Ok(())
}

/// Writes the watcher's replies until told to wrap up, then writes what is
/// still queued and waits for the owner to read it.
async fn write_replies(
    mut send: quinn::SendStream,
    mut outgoing: mpsc::UnboundedReceiver<Frame>,
    mut wrap_up: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            frame = outgoing.recv() => match frame {
                Some(frame) => {
                    if codec::write_frame(&mut send, &frame).await.is_err() {
                        return;
                    }
                }
                None => break,
            },
            _ = &mut wrap_up => {
                while let Ok(frame) = outgoing.try_recv() {
                    if codec::write_frame(&mut send, &frame).await.is_err() {
                        return;
                    }
                }
                break;
            }
        }
    }
    let _ = send.finish();
    let _ = send.stopped().await;
}

async fn dial(endpoint: &Endpoint, address: &str) -> Result<quinn::Connection> {
    let local_is_v4 = endpoint.local_addr()?.is_ipv4();
    let addr = tokio::net::lookup_host(address)
        .await?
        .find(|a| a.is_ipv4() == local_is_v4)
        .with_context(|| format!("no usable address for {address}"))?;
    let conn = endpoint.connect(addr, SERVER_NAME)?.await?;
    Ok(conn)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::message::TransferMessage;

    fn loopback_settings() -> DirectConfig {
        DirectConfig {
            enabled: true,
            bind_addr: "127.0.0.1:0".into(),
            advertise_host: None,
            stun_server: None,
        }
    }

    #[test]
    fn host_candidate_prefers_advertised_host() {
        let mut settings = loopback_settings();
        let local: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        assert_eq!(host_candidate(&settings, local), "127.0.0.1:5000");
        settings.advertise_host = Some("peer.example".into());
        assert_eq!(host_candidate(&settings, local), "peer.example:5000");
    }

    #[tokio::test]
    async fn offer_rejects_foreign_protocol() {
        let offer = json!({"cert": "AAAA", "alpn": "h3"});
        assert!(WatcherLink::accept_offer(&offer, "127.0.0.1:0").is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn loopback_link_carries_frames_both_ways() {
        let factory = QuicLinkFactory::new(loopback_settings(), 1 << 24, 1 << 23);
        let (owner_events_tx, mut owner_events) = mpsc::unbounded_channel();
        let (link, offer) = factory.open("w1", owner_events_tx).unwrap();

        let mut watcher = WatcherLink::accept_offer(&offer, "127.0.0.1:0").unwrap();
        let timeout = Duration::from_secs(10);

        // Trickle candidates until the channel opens.
        loop {
            let ev = tokio::time::timeout(timeout, owner_events.recv())
                .await
                .unwrap()
                .unwrap();
            match ev {
                LinkEvent::LocalCandidate(c) => watcher.add_candidate(&c),
                LinkEvent::ChannelOpen => break,
                LinkEvent::State(LinkState::Connected) => {}
                other => panic!("unexpected {other:?}"),
            }
        }

        link.send(Frame::Control(TransferMessage::ProbeStart)).await.unwrap();
        link.send(Frame::Chunk(vec![5; 70_000])).await.unwrap();

        let mut got = Vec::new();
        while got.len() < 2 {
            match tokio::time::timeout(timeout, watcher.recv()).await.unwrap().unwrap() {
                WatcherLinkEvent::Frame(f) => got.push(f),
                WatcherLinkEvent::Connected => {}
                WatcherLinkEvent::Closed => panic!("closed early"),
            }
        }
        assert_eq!(got[0], Frame::Control(TransferMessage::ProbeStart));
        assert_eq!(got[1], Frame::Chunk(vec![5; 70_000]));

        watcher.send(Frame::Control(TransferMessage::ProbeAck));
        loop {
            let ev = tokio::time::timeout(timeout, owner_events.recv())
                .await
                .unwrap()
                .unwrap();
            if let LinkEvent::Message(f) = ev {
                assert_eq!(f, Frame::Control(TransferMessage::ProbeAck));
                break;
            }
        }

        link.flow().wait_below(0).await.unwrap();
        link.close();
        loop {
            match tokio::time::timeout(timeout, watcher.recv()).await.unwrap() {
                Some(WatcherLinkEvent::Closed) | None => break,
                Some(_) => {}
            }
        }
    }
}
