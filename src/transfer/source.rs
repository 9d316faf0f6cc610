use std::io::SeekFrom;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::manifest::{FileDescriptor, LocalFile};

/// The broadcaster's files, read in ranges as chunks are sent.
#[derive(Clone)]
pub enum FileSource {
    Disk(Arc<Vec<LocalFile>>),
    Memory(Arc<Vec<(FileDescriptor, Vec<u8>)>>),
}

impl FileSource {
    pub fn from_local(files: Vec<LocalFile>) -> Self {
        FileSource::Disk(Arc::new(files))
    }

    /// Builds a source from `(relative path, bytes)` pairs.
    pub fn in_memory(entries: Vec<(String, Vec<u8>)>) -> Self {
        let files = entries
            .into_iter()
            .map(|(relative_path, bytes)| {
                let name = relative_path
                    .rsplit('/')
                    .next()
                    .unwrap_or(relative_path.as_str())
                    .to_string();
                let descriptor = FileDescriptor {
                    mime_type: crate::manifest::guess_mime_type(&name).to_string(),
                    name,
                    byte_size: bytes.len() as u64,
                    relative_path,
                };
                (descriptor, bytes)
            })
            .collect();
        FileSource::Memory(Arc::new(files))
    }

    pub fn manifest(&self) -> Vec<FileDescriptor> {
        match self {
            FileSource::Disk(files) => files.iter().map(|f| f.descriptor.clone()).collect(),
            FileSource::Memory(files) => files.iter().map(|(d, _)| d.clone()).collect(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            FileSource::Disk(files) => files.len(),
            FileSource::Memory(files) => files.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reads bytes `[start, end)` of the file at `index`.
    pub async fn read_range(&self, index: usize, start: u64, end: u64) -> Result<Vec<u8>> {
        if end < start {
            anyhow::bail!("invalid range {start}..{end}");
        }
        match self {
            FileSource::Disk(files) => {
                let file = files
                    .get(index)
                    .with_context(|| format!("no file at index {index}"))?;
                let mut f = tokio::fs::File::open(&file.path)
                    .await
                    .with_context(|| format!("open {}", file.path.display()))?;
                f.seek(SeekFrom::Start(start)).await?;
                let mut buf = vec![0u8; (end - start) as usize];
                f.read_exact(&mut buf)
                    .await
                    .with_context(|| format!("read {} at {start}", file.path.display()))?;
                Ok(buf)
            }
            FileSource::Memory(files) => {
                let (_, bytes) = files
                    .get(index)
                    .with_context(|| format!("no file at index {index}"))?;
                let range = start as usize..end as usize;
                bytes
                    .get(range)
                    .map(|b| b.to_vec())
                    .with_context(|| format!("range {start}..{end} past end of file {index}"))
            }
        }
    }
}
