use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::{debug, trace};

use crate::error::{BuildError, BuildResult, IoContext};
use crate::job::BuildJob;
use crate::oci::Descriptor;

/// Passes bytes through while keeping a running sha256 and byte count.
pub struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
    bytes_written: u64,
}

impl<W> HashingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            bytes_written: 0,
        }
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    /// Returns the wrapped writer, the hex digest and the byte count.
    pub fn into_parts(self) -> (W, String, u64) {
        (self.inner, hex::encode(self.hasher.finalize()), self.bytes_written)
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.hasher.update(&buf[..written]);
        self.bytes_written = self
            .bytes_written
            .saturating_add(written.try_into().unwrap_or(u64::MAX));
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// A blob still being written: a temp file in the staging directory whose
/// digest accumulates as bytes arrive.
pub type BlobWriter = HashingWriter<BufWriter<NamedTempFile>>;

/// The `blobs/sha256` directory of one build, with a staging area for
/// in-flight writes on the same filesystem so commits are plain renames.
#[derive(Clone, Debug)]
pub struct BlobStore {
    staging: PathBuf,
    blobs: PathBuf,
    verbose: bool,
}

impl BlobStore {
    pub fn new(staging: impl Into<PathBuf>, blobs: impl Into<PathBuf>) -> Self {
        Self {
            staging: staging.into(),
            blobs: blobs.into(),
            verbose: false,
        }
    }

    pub(crate) fn for_job(job: &BuildJob) -> Self {
        Self {
            staging: job.build_dir(),
            blobs: job.blobs_dir(),
            verbose: job.verbose(),
        }
    }

    pub fn blobs_dir(&self) -> &Path {
        &self.blobs
    }

    pub fn path(&self, hex: &str) -> PathBuf {
        self.blobs.join(hex)
    }

    /// Opens a staging file; `name` only shows up in the temp filename.
    pub fn create(&self, name: &str) -> BuildResult<BlobWriter> {
        let temp = tempfile::Builder::new()
            .prefix(&format!(".{name}."))
            .suffix(".tmp")
            .tempfile_in(&self.staging)
            .at("failed to create temp blob in", &self.staging)?;
        Ok(HashingWriter::new(BufWriter::new(temp)))
    }

    /// Moves a finished staging file to `blobs/sha256/<digest>`. When the
    /// digest is already stored the new copy is discarded.
    pub fn commit(&self, writer: BlobWriter, media_type: &str) -> BuildResult<Descriptor> {
        let (buffered, digest, size) = writer.into_parts();
        let temp = buffered
            .into_inner()
            .map_err(|err| BuildError::io("failed to flush temp blob for", &self.blobs, err.into_error()))?;
        let blob = self.path(&digest);
        self.echo(temp.path(), &blob);
        if !blob.exists() {
            if let Err(err) = temp.persist_noclobber(&blob) {
                if err.error.kind() != io::ErrorKind::AlreadyExists {
                    return Err(BuildError::io("failed to store blob", &blob, err.error));
                }
            }
        }
        Ok(Descriptor::new(media_type, &digest, size))
    }

    /// Writes `value` as indented JSON (with a trailing newline) and stores it.
    pub fn write_json<T: Serialize>(
        &self,
        name: &str,
        what: &'static str,
        value: &T,
        media_type: &str,
    ) -> BuildResult<Descriptor> {
        let mut writer = self.create(name)?;
        serde_json::to_writer_pretty(&mut writer, value)
            .map_err(|source| BuildError::Encode { what, source })?;
        writer.write_all(b"\n").at("failed to write", &self.staging)?;
        self.commit(writer, media_type)
    }

    fn echo(&self, from: &Path, to: &Path) {
        let from = from.strip_prefix(&self.staging).unwrap_or(from);
        let to = to.strip_prefix(&self.staging).unwrap_or(to);
        if self.verbose {
            debug!("mv ./{} ./{}", from.display(), to.display());
        } else {
            trace!("mv ./{} ./{}", from.display(), to.display());
        }
    }
}

/// Writes a small file outside the blob store (`oci-layout`, `index.json`).
pub(crate) fn write_file(path: &Path, contents: &[u8]) -> BuildResult<()> {
    fs::write(path, contents).at("failed to write", path)
}
