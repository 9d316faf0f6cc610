use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

/// One entry of a broadcast manifest. Immutable once the manifest is sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDescriptor {
    pub name: String,
    #[serde(rename = "size")]
    pub byte_size: u64,
    #[serde(rename = "mimeType", default)]
    pub mime_type: String,
    #[serde(rename = "relativePath")]
    pub relative_path: String,
}

pub fn total_bytes(manifest: &[FileDescriptor]) -> u64 {
    manifest.iter().map(|f| f.byte_size).sum()
}

/// A manifest entry paired with where its bytes live on the broadcaster.
#[derive(Debug, Clone)]
pub struct LocalFile {
    pub descriptor: FileDescriptor,
    pub path: PathBuf,
}

/// Builds a manifest from files and folders. Folders are walked recursively and
/// keep `<folder>/<sub path>` as the relative path.
pub fn collect_local_files(inputs: &[PathBuf]) -> Result<Vec<LocalFile>> {
    let mut out = Vec::new();
    for input in inputs {
        let meta =
            std::fs::metadata(input).with_context(|| format!("stat {}", input.display()))?;
        if meta.is_dir() {
            let root = input
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "folder".to_string());
            let mut entries: Vec<_> = WalkDir::new(input)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
                .collect();
            entries.sort_by(|a, b| a.path().cmp(b.path()));
            for entry in entries {
                let rel = entry.path().strip_prefix(input).unwrap_or(entry.path());
                let rel = Path::new(&root).join(rel);
                out.push(local_file(entry.path(), &rel)?);
            }
        } else {
            let name = input
                .file_name()
                .map(PathBuf::from)
                .with_context(|| format!("no file name in {}", input.display()))?;
            out.push(local_file(input, &name)?);
        }
    }
    if out.is_empty() {
        anyhow::bail!("no files to share");
    }
    Ok(out)
}

fn local_file(path: &Path, rel: &Path) -> Result<LocalFile> {
    let meta = std::fs::metadata(path).with_context(|| format!("stat {}", path.display()))?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let relative_path = rel.to_string_lossy().replace('\\', "/");
    Ok(LocalFile {
        descriptor: FileDescriptor {
            mime_type: guess_mime_type(&name).to_string(),
            name,
            byte_size: meta.len(),
            relative_path,
        },
        path: path.to_path_buf(),
    })
}

pub fn guess_mime_type(name: &str) -> &'static str {
    let ext = Path::new(name)
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "txt" | "log" | "md" => "text/plain",
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "csv" => "text/csv",
        "js" => "text/javascript",
        "json" => "application/json",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "gz" => "application/gzip",
        "tar" => "application/x-tar",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mov" => "video/quicktime",
        _ => "application/octet-stream",
    }
}

/// Turns a sender-supplied relative path into a safe relative path. Absolute
/// paths, parent components and empty paths are rejected.
pub fn sanitize_relative_path(raw: &str) -> Result<PathBuf> {
    let normalized = raw.replace('\\', "/");
    let mut out = PathBuf::new();
    for component in Path::new(&normalized).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            _ => anyhow::bail!("unsafe path in manifest: {raw}"),
        }
    }
    if out.as_os_str().is_empty() {
        anyhow::bail!("empty path in manifest");
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn collects_files_and_folders_in_order() {
        let tmp = std::env::temp_dir().join("dropshare-manifest-test");
        let _ = fs::remove_dir_all(&tmp);
        fs::create_dir_all(tmp.join("album").join("sub")).unwrap();
        fs::write(tmp.join("notes.txt"), b"hello").unwrap();
        fs::write(tmp.join("album").join("b.png"), vec![0u8; 10]).unwrap();
        fs::write(tmp.join("album").join("sub").join("a.json"), b"{}").unwrap();

        let files =
            collect_local_files(&[tmp.join("notes.txt"), tmp.join("album")]).unwrap();
        let rels: Vec<_> = files
            .iter()
            .map(|f| f.descriptor.relative_path.as_str())
            .collect();
        assert_eq!(rels, vec!["notes.txt", "album/b.png", "album/sub/a.json"]);
        assert_eq!(files[0].descriptor.mime_type, "text/plain");
        assert_eq!(files[1].descriptor.byte_size, 10);
        assert_eq!(
            total_bytes(&files.iter().map(|f| f.descriptor.clone()).collect::<Vec<_>>()),
            17
        );
    }

    #[test]
    fn descriptor_uses_wire_field_names() {
        let d = FileDescriptor {
            name: "a.bin".into(),
            byte_size: 3,
            mime_type: "application/octet-stream".into(),
            relative_path: "dir/a.bin".into(),
        };
        let v = serde_json::to_value(&d).unwrap();
        assert_eq!(v["size"], 3);
        assert_eq!(v["relativePath"], "dir/a.bin");
        assert_eq!(v["mimeType"], "application/octet-stream");
    }

    #[test]
    fn sanitize_rejects_escapes() {
        assert_eq!(
            sanitize_relative_path("a/./b.txt").unwrap(),
            PathBuf::from("a").join("b.txt")
        );
        assert!(sanitize_relative_path("../etc/passwd").is_err());
        assert!(sanitize_relative_path("/etc/passwd").is_err());
        assert!(sanitize_relative_path("").is_err());
    }
}
