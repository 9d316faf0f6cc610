use std::collections::HashMap;

use anyhow::{Context, Result};

use crate::manifest::{total_bytes, FileDescriptor};
use crate::receive::storage::{ArchiveBuilder, FileSink, SinkFactory};
use crate::transfer::message::TransferMessage;

/// What the assembler did with one input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Continue,
    /// A file was written whole; carries its relative path.
    FileDone(String),
    /// Everything was delivered; carries the name written to the output.
    Complete(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub received: u64,
    pub total: u64,
    /// Floor of the monotone fraction, so 100 means every byte arrived.
    pub percent: u8,
}

enum Target {
    Stream(Box<dyn FileSink>),
    Buffer(Vec<u8>),
}

struct CurrentFile {
    descriptor: FileDescriptor,
    received: u64,
    target: Target,
}

/// Rebuilds a broadcast's files from the transfer message stream, whichever
/// path it arrives on. A one-file manifest streams to disk; anything else is
/// buffered into an archive delivered at the end.
pub struct Assembler {
    session_id: String,
    single_file: bool,
    total: u64,
    received: u64,
    high_water: u64,
    sinks: Box<dyn SinkFactory>,
    archive: Box<dyn ArchiveBuilder>,
    /// Manifest entries as `(relative path, size)`, in manifest order.
    expected: Vec<(String, u64)>,
    current: Option<CurrentFile>,
    /// Bytes counted for files that already saw `FileEnd`, by relative path.
    finished: HashMap<String, u64>,
    /// Output name of the last streamed file.
    streamed: Option<String>,
    complete: bool,
}

impl Assembler {
    pub fn new(
        session_id: &str,
        manifest: &[FileDescriptor],
        sinks: Box<dyn SinkFactory>,
        archive: Box<dyn ArchiveBuilder>,
    ) -> Self {
        Self {
            session_id: session_id.to_string(),
            single_file: manifest.len() == 1,
            total: total_bytes(manifest),
            received: 0,
            high_water: 0,
            sinks,
            archive,
            expected: manifest
                .iter()
                .map(|f| (f.relative_path.clone(), f.byte_size))
                .collect(),
            current: None,
            finished: HashMap::new(),
            streamed: None,
            complete: false,
        }
    }

    pub fn is_single_file(&self) -> bool {
        self.single_file
    }

    pub fn progress(&self) -> Progress {
        let percent = if self.total == 0 {
            0
        } else {
            (self.high_water.min(self.total) * 100 / self.total) as u8
        };
        Progress {
            received: self.high_water,
            total: self.total,
            percent,
        }
    }

    pub fn handle_message(&mut self, msg: TransferMessage) -> Result<Step> {
        if self.complete {
            return Ok(Step::Continue);
        }
        match msg {
            TransferMessage::FileStart(descriptor) => {
                self.start_file(descriptor)?;
                Ok(Step::Continue)
            }
            TransferMessage::FileEnd => self.end_file().map(Step::FileDone),
            TransferMessage::TransferComplete => self.finish().map(Step::Complete),
            // Path negotiation is the watcher's business and receipts travel
            // the other way.
            TransferMessage::ProbeStart
            | TransferMessage::ProbeAck
            | TransferMessage::ModeOk
            | TransferMessage::ModeLow
            | TransferMessage::FileReceived { .. }
            | TransferMessage::TransferReceived
            | TransferMessage::RelayAck { .. } => Ok(Step::Continue),
        }
    }

    pub fn handle_chunk(&mut self, bytes: &[u8]) -> Result<()> {
        if self.complete {
            return Ok(());
        }
        let current = self
            .current
            .as_mut()
            .context("received file data before any file-start")?;
        let n = bytes.len() as u64;
        if current.received + n > current.descriptor.byte_size {
            let path = current.descriptor.relative_path.clone();
            self.abort();
            anyhow::bail!("{path}: more data than the manifest announced");
        }
        match &mut current.target {
            Target::Stream(sink) => sink.write(bytes)?,
            Target::Buffer(buf) => buf.extend_from_slice(bytes),
        }
        current.received += n;
        self.received += n;
        self.high_water = self.high_water.max(self.received);
        Ok(())
    }

    /// Drops any partially written file. Used when the broadcast goes away.
    pub fn abort(&mut self) {
        if let Some(current) = self.current.take() {
            if let Target::Stream(sink) = current.target {
                sink.abort();
            }
            crate::logging::warn_kv(
                "discarded partial file",
                &[
                    ("session", &self.session_id),
                    ("file", &current.descriptor.relative_path),
                ],
            );
        }
    }

    fn start_file(&mut self, descriptor: FileDescriptor) -> Result<()> {
        match self.expected_size(&descriptor.relative_path) {
            None => {
                self.abort();
                anyhow::bail!("{}: not part of the manifest", descriptor.relative_path);
            }
            Some(size) if size != descriptor.byte_size => {
                self.abort();
                anyhow::bail!(
                    "{}: announced {} bytes, manifest says {size}",
                    descriptor.relative_path,
                    descriptor.byte_size
                );
            }
            Some(_) => {}
        }
        // A resend restarts from the file boundary: forget what we had.
        if let Some(previous) = self.current.take() {
            self.received -= previous.received;
            if let Target::Stream(sink) = previous.target {
                sink.abort();
            }
        }
        if let Some(done) = self.finished.remove(&descriptor.relative_path) {
            self.received -= done;
        }
        let target = if self.single_file {
            Target::Stream(self.sinks.open(&descriptor.name, descriptor.byte_size)?)
        } else {
            Target::Buffer(Vec::with_capacity(descriptor.byte_size.min(64 << 20) as usize))
        };
        crate::logging::debug_kv(
            "file start",
            &[
                ("session", &self.session_id),
                ("file", &descriptor.relative_path),
                ("size", &descriptor.byte_size.to_string()),
            ],
        );
        self.current = Some(CurrentFile {
            descriptor,
            received: 0,
            target,
        });
        Ok(())
    }

    fn end_file(&mut self) -> Result<String> {
        let current = self
            .current
            .take()
            .context("file-end without a matching file-start")?;
        let CurrentFile {
            descriptor,
            received,
            target,
        } = current;
        if received != descriptor.byte_size {
            if let Target::Stream(sink) = target {
                sink.abort();
            }
            self.received -= received;
            crate::logging::warn_kv(
                "file ended short",
                &[
                    ("session", &self.session_id),
                    ("file", &descriptor.relative_path),
                    ("expected", &descriptor.byte_size.to_string()),
                    ("received", &received.to_string()),
                ],
            );
            anyhow::bail!(
                "{}: received {received} of {} bytes",
                descriptor.relative_path,
                descriptor.byte_size
            );
        }
        match target {
            Target::Stream(sink) => {
                sink.close()?;
                self.streamed = Some(descriptor.name.clone());
            }
            Target::Buffer(bytes) => self.archive.add_entry(&descriptor.relative_path, bytes)?,
        }
        self.finished.insert(descriptor.relative_path.clone(), received);
        Ok(descriptor.relative_path)
    }

    fn finish(&mut self) -> Result<String> {
        if self.current.is_some() {
            self.abort();
            anyhow::bail!("transfer-complete arrived inside a file");
        }
        if let Some((missing, _)) = self
            .expected
            .iter()
            .find(|(path, _)| !self.finished.contains_key(path))
        {
            anyhow::bail!("transfer-complete before {missing} arrived");
        }
        let delivered = if self.single_file {
            self.streamed.clone().unwrap_or_default()
        } else {
            let package = self.archive.finalize()?;
            let name = format!("DropShare-{}.zip", self.session_id);
            let mut sink = self.sinks.open(&name, package.len() as u64)?;
            sink.write(&package)?;
            sink.close()?;
            name
        };
        self.complete = true;
        crate::logging::info_kv(
            "transfer received",
            &[
                ("session", &self.session_id),
                ("delivered", &delivered),
                ("bytes", &self.received.to_string()),
            ],
        );
        Ok(delivered)
    }

    fn expected_size(&self, relative_path: &str) -> Option<u64> {
        self.expected
            .iter()
            .find(|(path, _)| path == relative_path)
            .map(|(_, size)| *size)
    }
}
