use std::sync::Arc;

use anyhow::Result;

use crate::client::Outgoing;
use crate::manifest::FileDescriptor;
use crate::transfer::flow::RelayWindow;
use crate::transfer::link::DirectLink;
use crate::transfer::message::{Frame, TransferMessage};
use crate::transfer::source::FileSource;
use crate::transfer::uplink::Uplink;
use crate::transfer::TransferTuning;
use crate::wsproto::{encode_relay_chunk, ClientMessage};

/// Files the watcher has confirmed writing, by manifest index. Only a
/// confirmed file is skipped when delivery restarts on another path.
#[derive(Debug, Clone)]
pub struct Receipts {
    paths: Vec<String>,
    confirmed: Vec<bool>,
}

impl Receipts {
    pub fn new(manifest: &[FileDescriptor]) -> Self {
        Self {
            paths: manifest.iter().map(|f| f.relative_path.clone()).collect(),
            confirmed: vec![false; manifest.len()],
        }
    }

    /// Returns false for a path outside the manifest.
    pub fn confirm(&mut self, relative_path: &str) -> bool {
        match self.paths.iter().position(|p| p == relative_path) {
            Some(i) => {
                self.confirmed[i] = true;
                true
            }
            None => false,
        }
    }

    /// Indices still to deliver, in manifest order.
    pub fn pending(&self) -> Vec<usize> {
        (0..self.confirmed.len())
            .filter(|i| !self.confirmed[*i])
            .collect()
    }

    /// First unconfirmed file, or the file count when every file is confirmed.
    pub fn restart_index(&self) -> usize {
        self.confirmed
            .iter()
            .position(|done| !done)
            .unwrap_or(self.confirmed.len())
    }
}

/// Queues every file on the direct channel, then `TransferComplete`. Done
/// here means queued; delivery is whatever the watcher confirms.
pub async fn run_direct(link: DirectLink, source: FileSource, tuning: TransferTuning) -> Result<()> {
    let manifest = source.manifest();
    for (index, file) in manifest.iter().enumerate() {
        link.send(Frame::Control(TransferMessage::FileStart(file.clone())))
            .await?;
        let mut offset = 0u64;
        while offset < file.byte_size {
            let end = (offset + tuning.chunk_size as u64).min(file.byte_size);
            let bytes = source.read_range(index, offset, end).await?;
            link.send(Frame::Chunk(bytes)).await?;
            offset = end;
        }
        link.send(Frame::Control(TransferMessage::FileEnd)).await?;
    }
    link.send(Frame::Control(TransferMessage::TransferComplete))
        .await?;
    Ok(())
}

/// Relay half of one watcher's delivery.
pub struct RelayJob {
    /// Pinned to the server connection the job was started for.
    pub uplink: Uplink,
    pub watcher_id: String,
    pub source: FileSource,
    /// Manifest indices to send, in order.
    pub files: Vec<usize>,
    pub window: Arc<RelayWindow>,
    pub tuning: TransferTuning,
}

/// Sends `files` through the server relay, addressed to the watcher, then
/// `TransferComplete`. Every message to the watcher takes a window slot.
pub async fn run_relay(job: RelayJob) -> Result<()> {
    let manifest = job.source.manifest();
    let mut chunks_sent = 0u64;
    for index in job.files.iter().copied() {
        let Some(file) = manifest.get(index) else {
            anyhow::bail!("file index {index} outside the manifest");
        };
        send_control(&job, TransferMessage::FileStart(file.clone())).await?;
        let mut offset = 0u64;
        while offset < file.byte_size {
            let end = (offset + job.tuning.chunk_size as u64).min(file.byte_size);
            let bytes = job.source.read_range(index, offset, end).await?;
            job.window.acquire().await;
            job.uplink
                .send(Outgoing::Binary(encode_relay_chunk(&job.watcher_id, &bytes)))
                .await?;
            offset = end;
            chunks_sent += 1;
            if job.tuning.relay_ping_every > 0 && chunks_sent % job.tuning.relay_ping_every == 0 {
                job.uplink.send(Outgoing::Text(ClientMessage::Ping)).await?;
            }
            // Keep the shared websocket's keepalive and control traffic moving.
            tokio::task::yield_now().await;
        }
        send_control(&job, TransferMessage::FileEnd).await?;
    }
    send_control(&job, TransferMessage::TransferComplete).await?;
    Ok(())
}

async fn send_control(job: &RelayJob, msg: TransferMessage) -> Result<()> {
    let message = serde_json::to_value(&msg)?;
    job.window.acquire().await;
    job.uplink
        .send(Outgoing::Text(ClientMessage::RelayControl {
            to: job.watcher_id.clone(),
            message,
        }))
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::uplink;
    use crate::wsproto::{decode_relay_chunk, relay_message};

    fn tuning(chunk_size: usize) -> TransferTuning {
        TransferTuning {
            chunk_size,
            relay_ping_every: 2,
            ..TransferTuning::default()
        }
    }

    fn file(path: &str) -> FileDescriptor {
        FileDescriptor {
            name: path.to_string(),
            byte_size: 1,
            mime_type: "text/plain".into(),
            relative_path: path.to_string(),
        }
    }

    #[test]
    fn restart_skips_only_confirmed_files() {
        let manifest = vec![file("a"), file("b"), file("c")];
        let mut receipts = Receipts::new(&manifest);
        assert_eq!(receipts.restart_index(), 0);
        assert!(receipts.confirm("a"));
        assert!(receipts.confirm("c"));
        assert!(!receipts.confirm("zzz"));
        assert_eq!(receipts.restart_index(), 1);
        assert_eq!(receipts.pending(), vec![1]);
        assert!(receipts.confirm("b"));
        assert_eq!(receipts.restart_index(), 3);
        assert!(receipts.pending().is_empty());
    }

    #[tokio::test]
    async fn relay_sends_pending_files_with_pings() {
        let source = FileSource::in_memory(vec![
            ("a.txt".into(), vec![1; 10]),
            ("b.txt".into(), vec![2; 10]),
        ]);
        let (tx, mut rx) = uplink::channel(64);
        let window = Arc::new(RelayWindow::new(64));
        run_relay(RelayJob {
            uplink: tx.pinned(),
            watcher_id: "w1".into(),
            source,
            files: vec![1],
            window: window.clone(),
            tuning: tuning(4),
        })
        .await
        .unwrap();

        let mut controls = Vec::new();
        let mut payload = Vec::new();
        let mut pings = 0;
        while let Ok(item) = rx.try_recv() {
            match item.out {
                Outgoing::Text(ClientMessage::RelayControl { to, message }) => {
                    assert_eq!(to, "w1");
                    controls.push(relay_message(&message).unwrap());
                }
                Outgoing::Text(ClientMessage::Ping) => pings += 1,
                Outgoing::Binary(raw) => {
                    let chunk = decode_relay_chunk(&raw).unwrap();
                    assert_eq!(chunk.peer, "w1");
                    payload.extend(chunk.payload);
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(controls.len(), 3);
        match &controls[0] {
            TransferMessage::FileStart(f) => assert_eq!(f.relative_path, "b.txt"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(controls[1], TransferMessage::FileEnd);
        assert_eq!(controls[2], TransferMessage::TransferComplete);
        assert_eq!(payload, vec![2; 10]);
        // 3 chunks of 4/4/2 bytes, ping after every second.
        assert_eq!(pings, 1);
        // Pings are not addressed to the watcher and take no slot.
        assert_eq!(window.in_flight(), 6);
    }

    #[tokio::test]
    async fn relay_stops_at_the_window_until_acked() {
        let source = FileSource::in_memory(vec![("a.bin".into(), vec![9; 40])]);
        let (tx, mut rx) = uplink::channel(64);
        let window = Arc::new(RelayWindow::new(4));
        let task = tokio::spawn(run_relay(RelayJob {
            uplink: tx.pinned(),
            watcher_id: "w1".into(),
            source,
            files: vec![0],
            window: window.clone(),
            tuning: TransferTuning {
                relay_ping_every: 0,
                ..tuning(4)
            },
        }));
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        let mut seen = 0;
        while rx.try_recv().is_ok() {
            seen += 1;
        }
        assert_eq!(seen, 4);
        assert!(!task.is_finished());

        // 1 start + 10 chunks + end + complete.
        window.on_ack(13);
        task.await.unwrap().unwrap();
        while rx.try_recv().is_ok() {
            seen += 1;
        }
        assert_eq!(seen, 13);
    }
}
