//! Where received bytes end up: streaming file sinks under the output folder
//! and the zip package for multi-file broadcasts.

use std::fs::{self, File};
use std::io::{BufWriter, Cursor, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use zip::write::FileOptions;

use crate::manifest::sanitize_relative_path;

/// An incremental write target for one file.
pub trait FileSink: Send {
    fn write(&mut self, bytes: &[u8]) -> Result<()>;
    /// Makes the file visible under its final name.
    fn close(self: Box<Self>) -> Result<()>;
    /// Discards everything written so far.
    fn abort(self: Box<Self>);
}

pub trait SinkFactory: Send {
    fn open(&mut self, name: &str, expected_size: u64) -> Result<Box<dyn FileSink>>;
}

/// Collects multi-file entries and packs them into a single archive.
pub trait ArchiveBuilder: Send {
    /// Adding a path twice replaces the earlier entry.
    fn add_entry(&mut self, path: &str, bytes: Vec<u8>) -> Result<()>;
    fn finalize(&mut self) -> Result<Vec<u8>>;
}

/// Writes files below `root`, each through a `.part` file renamed on close.
pub struct DiskSinkFactory {
    root: PathBuf,
}

impl DiskSinkFactory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl SinkFactory for DiskSinkFactory {
    fn open(&mut self, name: &str, expected_size: u64) -> Result<Box<dyn FileSink>> {
        let rel = sanitize_relative_path(name)?;
        let final_path = self.root.join(rel);
        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        let part_path = part_path(&final_path);
        let file = File::create(&part_path)
            .with_context(|| format!("create {}", part_path.display()))?;
        crate::logging::debug_kv(
            "opened file sink",
            &[
                ("path", &final_path.display().to_string()),
                ("expected_size", &expected_size.to_string()),
            ],
        );
        Ok(Box::new(DiskSink {
            writer: Some(BufWriter::new(file)),
            part_path,
            final_path,
        }))
    }
}

fn part_path(final_path: &Path) -> PathBuf {
    let mut name = final_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    final_path.with_file_name(name)
}

/// Removes its `.part` file on drop unless it was closed.
struct DiskSink {
    writer: Option<BufWriter<File>>,
    part_path: PathBuf,
    final_path: PathBuf,
}

impl FileSink for DiskSink {
    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        let writer = self.writer.as_mut().context("file sink already finished")?;
        writer
            .write_all(bytes)
            .with_context(|| format!("write {}", self.part_path.display()))
    }

    fn close(mut self: Box<Self>) -> Result<()> {
        let writer = self.writer.take().context("file sink already finished")?;
        let file = writer
            .into_inner()
            .map_err(|e| anyhow::anyhow!("flush {}: {}", self.part_path.display(), e.error()))?;
        file.sync_all()?;
        drop(file);
        fs::rename(&self.part_path, &self.final_path).with_context(|| {
            format!(
                "rename {} -> {}",
                self.part_path.display(),
                self.final_path.display()
            )
        })
    }

    fn abort(self: Box<Self>) {
        // Drop removes the partial file.
    }
}

impl Drop for DiskSink {
    fn drop(&mut self) {
        if self.writer.take().is_some() {
            let _ = fs::remove_file(&self.part_path);
        }
    }
}

/// Deflate zip package kept in memory until finalized.
#[derive(Default)]
pub struct ZipPackage {
    entries: Vec<(String, Vec<u8>)>,
}

impl ZipPackage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ArchiveBuilder for ZipPackage {
    fn add_entry(&mut self, path: &str, bytes: Vec<u8>) -> Result<()> {
        let entry = sanitize_relative_path(path)?
            .to_string_lossy()
            .replace('\\', "/");
        match self.entries.iter_mut().find(|(name, _)| *name == entry) {
            Some(existing) => existing.1 = bytes,
            None => self.entries.push((entry, bytes)),
        }
        Ok(())
    }

    fn finalize(&mut self) -> Result<Vec<u8>> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let options = FileOptions::default().compression_method(zip::CompressionMethod::Deflated);
        for (name, bytes) in self.entries.drain(..) {
            writer
                .start_file(name.as_str(), options)
                .with_context(|| format!("start zip entry {name}"))?;
            writer
                .write_all(&bytes)
                .with_context(|| format!("add {name} to zip"))?;
        }
        let cursor = writer.finish().context("finalize zip package")?;
        Ok(cursor.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("dropshare-{name}-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn disk_sink_renames_on_close_and_cleans_on_abort() {
        let dir = temp_dir("sink");
        let mut sinks = DiskSinkFactory::new(&dir);

        let mut sink = sinks.open("movie.mp4", 6).unwrap();
        sink.write(b"abc").unwrap();
        sink.write(b"def").unwrap();
        assert!(dir.join("movie.mp4.part").exists());
        sink.close().unwrap();
        assert_eq!(fs::read(dir.join("movie.mp4")).unwrap(), b"abcdef");
        assert!(!dir.join("movie.mp4.part").exists());

        let mut sink = sinks.open("half.bin", 10).unwrap();
        sink.write(b"12345").unwrap();
        sink.abort();
        assert!(!dir.join("half.bin.part").exists());
        assert!(!dir.join("half.bin").exists());

        assert!(sinks.open("../escape.txt", 1).is_err());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn zip_package_replaces_duplicate_entries() {
        let mut package = ZipPackage::new();
        package.add_entry("album/a.txt", b"first".to_vec()).unwrap();
        package.add_entry("album/b.txt", b"bee".to_vec()).unwrap();
        package.add_entry("album/a.txt", b"second".to_vec()).unwrap();
        assert!(package.add_entry("/etc/passwd", vec![]).is_err());

        let raw = package.finalize().unwrap();
        let mut archive = zip::ZipArchive::new(Cursor::new(raw)).unwrap();
        assert_eq!(archive.len(), 2);
        let mut text = String::new();
        archive
            .by_name("album/a.txt")
            .unwrap()
            .read_to_string(&mut text)
            .unwrap();
        assert_eq!(text, "second");
    }
}
