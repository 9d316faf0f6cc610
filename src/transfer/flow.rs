use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use anyhow::Result;
use tokio::sync::Notify;

/// Buffered-amount accounting for one direct channel.
///
/// Senders reserve space before queuing a frame; the transport reports bytes
/// as they leave the buffer. A sender that would push the buffer above the
/// high-water mark parks until the transport drains it below the low-water
/// mark, and is woken by that crossing rather than by polling.
pub struct FlowControl {
    high: u64,
    low: u64,
    buffered: AtomicU64,
    queued: AtomicU64,
    closed: AtomicBool,
    notify: Notify,
}

impl FlowControl {
    pub fn new(high: u64, low: u64) -> Self {
        Self {
            high,
            low,
            buffered: AtomicU64::new(0),
            queued: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    pub fn buffered(&self) -> u64 {
        self.buffered.load(Ordering::Acquire)
    }

    /// Total bytes ever reserved on this channel.
    pub fn queued(&self) -> u64 {
        self.queued.load(Ordering::Acquire)
    }

    /// Bytes the transport has taken out of the buffer. Stream offsets at or
    /// below this value have left the sender.
    pub fn drained(&self) -> u64 {
        self.queued().saturating_sub(self.buffered())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Waits for room for `len` more bytes, then accounts them as buffered.
    pub async fn reserve(&self, len: u64) -> Result<()> {
        if self.buffered() + len > self.high {
            self.wait_below(self.low).await?;
        }
        self.ensure_open()?;
        self.buffered.fetch_add(len, Ordering::AcqRel);
        self.queued.fetch_add(len, Ordering::AcqRel);
        Ok(())
    }

    /// Resolves once buffered bytes are at or below `mark`.
    pub async fn wait_below(&self, mark: u64) -> Result<()> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            self.ensure_open()?;
            if self.buffered() <= mark {
                return Ok(());
            }
            notified.await;
        }
    }

    /// Called by the transport once `len` bytes have been handed to the wire.
    pub fn on_drained(&self, len: u64) {
        let prev = self
            .buffered
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |b| {
                Some(b.saturating_sub(len))
            })
            .unwrap_or(0);
        let now = prev.saturating_sub(len);
        if (prev > self.low && now <= self.low) || (now == 0 && prev > 0) {
            self.notify.notify_waiters();
        }
    }

    /// Fails every current and future reservation.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            anyhow::bail!("direct channel closed");
        }
        Ok(())
    }
}

/// Message-count window for one watcher's relay stream.
///
/// The watcher reports how many relay messages it has received in total; the
/// owner sends at most `limit` messages beyond that, so the server never
/// holds more than a window's worth for a slow reader.
pub struct RelayWindow {
    limit: u64,
    sent: AtomicU64,
    acked: AtomicU64,
    notify: Notify,
}

impl RelayWindow {
    pub fn new(limit: u64) -> Self {
        Self {
            limit: limit.max(1),
            sent: AtomicU64::new(0),
            acked: AtomicU64::new(0),
            notify: Notify::new(),
        }
    }

    pub fn in_flight(&self) -> u64 {
        self.sent
            .load(Ordering::Acquire)
            .saturating_sub(self.acked.load(Ordering::Acquire))
    }

    /// Waits until one more message fits, then counts it as sent.
    pub async fn acquire(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.in_flight() < self.limit {
                self.sent.fetch_add(1, Ordering::AcqRel);
                return;
            }
            notified.await;
        }
    }

    /// Applies a cumulative count from the watcher. Counts never go back.
    pub fn on_ack(&self, received: u64) {
        let prev = self.acked.fetch_max(received, Ordering::AcqRel);
        if received > prev {
            self.notify.notify_waiters();
        }
    }

    /// Forgets messages that may have been lost with a server connection.
    /// The watcher's next count may then run ahead of `sent`, which only
    /// opens the window early by what was in flight.
    pub fn rebase(&self) {
        self.sent
            .store(self.acked.load(Ordering::Acquire), Ordering::Release);
        self.notify.notify_waiters();
    }
}
