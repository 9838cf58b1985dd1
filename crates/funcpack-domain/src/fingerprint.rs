use std::path::Path;
use std::time::UNIX_EPOCH;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tracing::trace;
use walkdir::WalkDir;

use crate::function::RUN_DATA_DIR;

/// Hashes the shape of a source tree: every entry's root-relative path and
/// modification time, walked in lexical order. The run-data directory and
/// `.git` are excluded so builds and commits do not perturb the value.
pub fn fingerprint(root: &Path) -> Result<String> {
    let mut hasher = Sha256::new();
    let walker = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            entry.depth() == 0
                || !(entry.file_type().is_dir()
                    && matches!(entry.file_name().to_str(), Some(RUN_DATA_DIR | ".git")))
        });
    for entry in walker {
        let entry = entry.with_context(|| format!("failed to walk {}", root.display()))?;
        if entry.depth() == 0 {
            continue;
        }
        let metadata = entry
            .path()
            .symlink_metadata()
            .with_context(|| format!("failed to stat {}", entry.path().display()))?;
        let modified = metadata
            .modified()
            .ok()
            .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
            .map_or(0, |duration| duration.as_nanos());
        let rel = entry.path().strip_prefix(root).unwrap_or(entry.path());
        hasher.update(rel.to_string_lossy().as_bytes());
        hasher.update(format!(":{modified}:").as_bytes());
    }
    let digest = hex::encode(hasher.finalize());
    trace!(root = %root.display(), fingerprint = %digest, "fingerprinted function source");
    Ok(digest)
}
