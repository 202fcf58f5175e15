//! Atomic file write: temp-then-rename.
//!
//! Received files land in the user's Downloads folder; a crash or power
//! loss mid-write must never leave a truncated file there. Data goes to
//! a `.part` sibling first, then an atomic rename publishes it.
//!
//! `rename()` is atomic on ext4, APFS, NTFS and every other mainstream
//! filesystem as long as source and destination share a mount.

use std::path::Path;

use anyhow::{Context, Result};
use tracing::warn;

/// Atomically write `content` to `path` via a temporary `.part` file.
/// Parent directories are created if absent; the temp file is removed if
/// the rename fails.
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".part");
    let tmp = std::path::PathBuf::from(tmp);

    std::fs::write(&tmp, content).with_context(|| format!("writing {}", tmp.display()))?;

    if let Err(err) = std::fs::rename(&tmp, path) {
        warn!(
            event = "atomic_rename_failed",
            from = %tmp.display(),
            to = %path.display(),
            error = %err,
            "Rename failed, removing temp file"
        );
        let _ = std::fs::remove_file(&tmp);
        return Err(err).with_context(|| format!("renaming into {}", path.display()));
    }
    Ok(())
}
