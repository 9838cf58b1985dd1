use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use filetime::FileTime;
use fs4::FileExt;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::blob::HashingWriter;
use crate::error::{BuildError, BuildResult, IoContext};

const LOCK_FILE: &str = ".lock";

/// Digest-named layer blobs shared by every build of a function.
///
/// Entries are written once and never modified. Their mtime doubles as a
/// last-used clock for [`BlobCache::prune`]. Builds hold a shared lock
/// while they read the cache; pruning needs the exclusive lock and gives up
/// instead of waiting.
#[derive(Clone, Debug)]
pub struct BlobCache {
    dir: PathBuf,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PruneSummary {
    pub removed: Vec<String>,
    pub freed_bytes: u64,
    pub remaining_bytes: u64,
    pub skipped_locked: bool,
}

impl BlobCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, hex: &str) -> PathBuf {
        self.dir.join(hex)
    }

    pub(crate) fn shared_lock(&self) -> BuildResult<File> {
        let file = self.lock_file()?;
        FileExt::lock_shared(&file).at("failed to lock", self.dir.join(LOCK_FILE))?;
        Ok(file)
    }

    /// Makes sure `hex` is cached, calling `fill` to download it when absent.
    /// Returns whether a download happened. Racing writers of the same
    /// digest are harmless: the first rename wins and the rest are dropped.
    pub fn ensure(
        &self,
        hex: &str,
        fill: impl FnOnce(&mut dyn Write) -> BuildResult<()>,
    ) -> BuildResult<bool> {
        let target = self.path(hex);
        if target.is_file() {
            touch(&target);
            return Ok(false);
        }
        fs::create_dir_all(&self.dir).at("failed to create", &self.dir)?;
        let temp = tempfile::Builder::new()
            .prefix(".download.")
            .tempfile_in(&self.dir)
            .at("failed to create download in", &self.dir)?;
        let mut writer = HashingWriter::new(BufWriter::new(temp));
        fill(&mut writer)?;
        let (buffered, digest, size) = writer.into_parts();
        let temp: NamedTempFile = buffered
            .into_inner()
            .map_err(|err| BuildError::io("failed to flush download in", &self.dir, err.into_error()))?;
        if digest != hex {
            return Err(BuildError::Registry {
                image: format!("sha256:{hex}"),
                reason: format!("downloaded layer hashed to sha256:{digest}"),
            });
        }
        if let Err(err) = temp.persist_noclobber(&target) {
            if err.error.kind() != io::ErrorKind::AlreadyExists {
                return Err(BuildError::io("failed to cache", &target, err.error));
            }
        }
        debug!(digest = hex, size, "cached base layer");
        Ok(true)
    }

    /// Places the cached blob at `<blobs>/<hex>`: a hard link where the
    /// filesystem allows it, otherwise a copy. Existing blobs are kept.
    pub fn link_into(&self, hex: &str, blobs: &Path) -> BuildResult<()> {
        let source = self.path(hex);
        let dest = blobs.join(hex);
        if dest.exists() {
            return Ok(());
        }
        match fs::hard_link(&source, &dest) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Ok(()),
            Err(err) => {
                debug!(digest = hex, error = %err, "hard link failed; copying base layer");
                fs::copy(&source, &dest).at("failed to copy base layer to", &dest)?;
                Ok(())
            }
        }
    }

    /// Evicts least recently used entries until the cache holds at most
    /// `max_bytes`. Skipped when a build currently holds the cache.
    pub fn prune(&self, max_bytes: u64) -> BuildResult<PruneSummary> {
        let mut summary = PruneSummary::default();
        if !self.dir.is_dir() {
            return Ok(summary);
        }
        let lock = self.lock_file()?;
        if lock.try_lock_exclusive().is_err() {
            debug!(dir = %self.dir.display(), "blob cache busy; skipping eviction");
            summary.skipped_locked = true;
            return Ok(summary);
        }

        let mut entries = Vec::new();
        for entry in fs::read_dir(&self.dir).at("failed to read", &self.dir)? {
            let entry = entry.at("failed to read", &self.dir)?;
            let name = entry.file_name().to_string_lossy().to_string();
            if !is_digest(&name) {
                continue;
            }
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            if !metadata.is_file() {
                continue;
            }
            let used = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            entries.push((used, name, metadata.len()));
        }
        entries.sort();

        let mut total: u64 = entries.iter().map(|(_, _, size)| *size).sum();
        for (_, name, size) in entries {
            if total <= max_bytes {
                break;
            }
            let path = self.path(&name);
            match fs::remove_file(&path) {
                Ok(()) => {
                    total = total.saturating_sub(size);
                    summary.freed_bytes += size;
                    summary.removed.push(name);
                }
                Err(err) => warn!(path = %path.display(), error = %err, "failed to evict cached layer"),
            }
        }
        summary.remaining_bytes = total;
        if !summary.removed.is_empty() {
            debug!(
                removed = summary.removed.len(),
                freed_bytes = summary.freed_bytes,
                remaining_bytes = summary.remaining_bytes,
                "evicted cached base layers"
            );
        }
        Ok(summary)
    }

    fn lock_file(&self) -> BuildResult<File> {
        fs::create_dir_all(&self.dir).at("failed to create", &self.dir)?;
        let path = self.dir.join(LOCK_FILE);
        OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .at("failed to open", &path)
    }
}

fn is_digest(name: &str) -> bool {
    name.len() == 64 && name.bytes().all(|byte| byte.is_ascii_hexdigit())
}

fn touch(path: &Path) {
    if let Err(err) = filetime::set_file_mtime(path, FileTime::now()) {
        debug!(path = %path.display(), error = %err, "failed to refresh cache entry");
    }
}
