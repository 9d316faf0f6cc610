use std::sync::Arc;

use anyhow::Result;
use serde_json::Value;
use tokio::sync::{mpsc, watch};

use crate::transfer::flow::FlowControl;
use crate::transfer::message::Frame;

/// Connection-level condition reported by a direct transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connected,
    /// Transient loss; the transport may still recover on its own.
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// A local candidate to trickle to the remote side.
    LocalCandidate(Value),
    State(LinkState),
    /// The ordered byte-stream channel is ready for frames.
    ChannelOpen,
    Message(Frame),
    ChannelClosed,
}

/// Negotiation input arriving from the remote side through signaling.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteSignal {
    Answer(Value),
    Candidate(Value),
}

/// Owner-side handle of a direct channel. Cloning shares the same channel.
#[derive(Clone)]
pub struct DirectLink {
    frames: mpsc::UnboundedSender<Frame>,
    signals: mpsc::UnboundedSender<RemoteSignal>,
    flow: Arc<FlowControl>,
    closed: Arc<watch::Sender<bool>>,
}

/// The transport's half of a link.
pub struct LinkEnds {
    pub frames: mpsc::UnboundedReceiver<Frame>,
    pub signals: mpsc::UnboundedReceiver<RemoteSignal>,
    pub flow: Arc<FlowControl>,
    pub closed: watch::Receiver<bool>,
    pub events: mpsc::UnboundedSender<LinkEvent>,
}

pub fn link_pair(
    high_water: u64,
    low_water: u64,
    events: mpsc::UnboundedSender<LinkEvent>,
) -> (DirectLink, LinkEnds) {
    let (frames_tx, frames_rx) = mpsc::unbounded_channel();
    let (signals_tx, signals_rx) = mpsc::unbounded_channel();
    let (closed_tx, closed_rx) = watch::channel(false);
    let flow = Arc::new(FlowControl::new(high_water, low_water));
    (
        DirectLink {
            frames: frames_tx,
            signals: signals_tx,
            flow: flow.clone(),
            closed: Arc::new(closed_tx),
        },
        LinkEnds {
            frames: frames_rx,
            signals: signals_rx,
            flow,
            closed: closed_rx,
            events,
        },
    )
}

impl DirectLink {
    /// Queues a frame, parking while the channel buffer is above high water.
    pub async fn send(&self, frame: Frame) -> Result<()> {
        self.flow.reserve(frame.wire_len()).await?;
        self.frames
            .send(frame)
            .map_err(|_| anyhow::anyhow!("direct channel transport gone"))
    }

    pub fn flow(&self) -> &Arc<FlowControl> {
        &self.flow
    }

    pub fn remote_answer(&self, answer: Value) {
        let _ = self.signals.send(RemoteSignal::Answer(answer));
    }

    pub fn remote_candidate(&self, candidate: Value) {
        let _ = self.signals.send(RemoteSignal::Candidate(candidate));
    }

    /// Stops the channel. Parked senders fail; the transport writes frames
    /// already queued, within a short bound, then finishes the stream and
    /// releases its socket.
    pub fn close(&self) {
        self.flow.close();
        let _ = self.closed.send(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

/// Resolves once the owner has closed the link or dropped its handle.
pub async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    let _ = closed.wait_for(|c| *c).await;
}

/// Creates the owner side of a direct channel towards one watcher and returns
/// it with the offer to send through signaling. Transport events arrive on
/// `events` until the link is closed.
pub trait LinkFactory: Send + Sync {
    fn open(
        &self,
        watcher_id: &str,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<(DirectLink, Value)>;
}
