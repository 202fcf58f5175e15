//! File sink and source: the engine's only contact with the filesystem.
//!
//! The sink owns directory choice and collision handling; the protocol
//! hands it sanitized names and reassembled bytes and only cares whether
//! persisting worked. Writes are atomic (temp file + rename) so a crash
//! mid-write never leaves a half file in Downloads.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use tracing::info;

use crate::utils::atomic_write::atomic_write;

/// Where completed transfers go.
pub trait FileSink: Send {
    /// Persist `bytes` under (a collision-resolved variant of) `filename`.
    /// Returns the final path.
    fn deliver(&self, filename: &str, bytes: &[u8]) -> Result<PathBuf>;
}

/// Where outbound files come from.
pub trait FileSource: Send {
    /// Read a file, returning its basename and contents.
    fn read(&self, path: &Path) -> Result<(String, Vec<u8>)>;
}

/// Sink writing into a fixed directory, defaulting to the platform
/// Downloads folder. Name collisions get a ` (n)` suffix.
pub struct DownloadsSink {
    dir: PathBuf,
}

impl DownloadsSink {
    /// Use `dir` if given, otherwise the platform Downloads folder, with
    /// the home directory as a last resort.
    pub fn new(dir: Option<PathBuf>) -> Result<Self> {
        let dir = match dir {
            Some(dir) => dir,
            None => dirs::download_dir()
                .or_else(dirs::home_dir)
                .ok_or_else(|| anyhow!("no usable download directory"))?,
        };
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// First free path for `filename` inside the sink directory:
    /// `name.ext`, then `name (1).ext`, `name (2).ext`, ...
    fn resolve_collision(&self, filename: &str) -> Result<PathBuf> {
        let candidate = self.dir.join(filename);
        if !candidate.exists() {
            return Ok(candidate);
        }
        let (stem, ext) = match filename.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() => (stem, Some(ext)),
            _ => (filename, None),
        };
        for n in 1..1000u32 {
            let name = match ext {
                Some(ext) => format!("{stem} ({n}).{ext}"),
                None => format!("{stem} ({n})"),
            };
            let candidate = self.dir.join(name);
            if !candidate.exists() {
                return Ok(candidate);
            }
        }
        Err(anyhow!("too many name collisions for {filename}"))
    }
}

impl FileSink for DownloadsSink {
    fn deliver(&self, filename: &str, bytes: &[u8]) -> Result<PathBuf> {
        let path = self.resolve_collision(filename)?;
        atomic_write(&path, bytes)?;
        info!(
            event = "file_saved",
            path = %path.display(),
            bytes = bytes.len(),
            "Received file saved"
        );
        Ok(path)
    }
}

/// Plain filesystem source.
pub struct DiskSource;

impl FileSource for DiskSource {
    fn read(&self, path: &Path) -> Result<(String, Vec<u8>)> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| anyhow!("path {} has no usable filename", path.display()))?
            .to_string();
        Ok((filename, bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("zmesh_test_{tag}"));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_deliver_writes_bytes() {
        let dir = scratch_dir("deliver");
        let sink = DownloadsSink::new(Some(dir.clone())).unwrap();
        let path = sink.deliver("hello.txt", b"over the mesh").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"over the mesh");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_collisions_get_numeric_suffix() {
        let dir = scratch_dir("collide");
        let sink = DownloadsSink::new(Some(dir.clone())).unwrap();
        let p1 = sink.deliver("log.txt", b"one").unwrap();
        let p2 = sink.deliver("log.txt", b"two").unwrap();
        let p3 = sink.deliver("log.txt", b"three").unwrap();
        assert_eq!(p1.file_name().unwrap(), "log.txt");
        assert_eq!(p2.file_name().unwrap(), "log (1).txt");
        assert_eq!(p3.file_name().unwrap(), "log (2).txt");
        assert_eq!(std::fs::read(&p2).unwrap(), b"two");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_collision_without_extension() {
        let dir = scratch_dir("noext");
        let sink = DownloadsSink::new(Some(dir.clone())).unwrap();
        sink.deliver("README", b"a").unwrap();
        let p2 = sink.deliver("README", b"b").unwrap();
        assert_eq!(p2.file_name().unwrap(), "README (1)");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_source_reads_basename_and_bytes() {
        let dir = scratch_dir("source");
        let path = dir.join("payload.bin");
        std::fs::write(&path, [1u8, 2, 3]).unwrap();
        let (name, bytes) = DiskSource.read(&path).unwrap();
        assert_eq!(name, "payload.bin");
        assert_eq!(bytes, vec![1, 2, 3]);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_source_missing_file_errors() {
        assert!(DiskSource.read(Path::new("/nonexistent/zmesh.bin")).is_err());
    }
}
