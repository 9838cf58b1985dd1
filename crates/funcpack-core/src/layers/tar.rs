use std::fs::{self, File, Metadata};
use std::io;
use std::path::Path;

use flate2::write::GzEncoder;
use flate2::{Compression, GzBuilder};
use tar::{Builder, EntryType, Header, HeaderMode};
use tracing::{debug, trace};

use crate::blob::{BlobStore, BlobWriter, HashingWriter};
use crate::error::{BuildError, BuildResult, IoContext};
use crate::oci::{ImageLayer, MEDIA_TYPE_LAYER_GZIP};

use super::{DEFAULT_GID, DEFAULT_UID};

type Compressed = GzEncoder<BlobWriter>;

// Same fixed timestamp tar's deterministic header mode stamps on entries.
const ENTRY_MTIME: u64 = 1_153_704_088;

/// Streams a gzip-compressed tar layer into the blob store. The inner
/// hashing writer sees the uncompressed tar (the DiffID), the outer one the
/// gzip bytes (the blob digest).
pub struct LayerWriter {
    builder: Builder<HashingWriter<Compressed>>,
    store: BlobStore,
    verbose: bool,
}

impl LayerWriter {
    pub fn new(store: &BlobStore, name: &str, verbose: bool) -> BuildResult<Self> {
        let blob = store.create(name)?;
        let gzip = GzBuilder::new().write(blob, Compression::default());
        let mut builder = Builder::new(HashingWriter::new(gzip));
        builder.mode(HeaderMode::Deterministic);
        builder.follow_symlinks(false);
        Ok(Self {
            builder,
            store: store.clone(),
            verbose,
        })
    }

    pub fn append_dir(&mut self, archive_path: &str, source: &Path) -> BuildResult<()> {
        let metadata = fs::symlink_metadata(source).at("failed to read metadata for", source)?;
        let mut header = self.header(&metadata, EntryType::Directory);
        header.set_size(0);
        self.builder
            .append_data(&mut header, archive_path, io::empty())
            .at("failed to add directory to layer", source)?;
        self.echo(archive_path);
        Ok(())
    }

    /// Archives a regular file; `mode` overrides its permission bits.
    pub fn append_file(
        &mut self,
        archive_path: &str,
        source: &Path,
        mode: Option<u32>,
    ) -> BuildResult<()> {
        let mut file = File::open(source).at("failed to open", source)?;
        let metadata = file.metadata().at("failed to read metadata for", source)?;
        let mut header = self.header(&metadata, EntryType::Regular);
        if let Some(mode) = mode {
            header.set_mode(mode);
        }
        header.set_size(metadata.len());
        self.builder
            .append_data(&mut header, archive_path, &mut file)
            .at("failed to add file to layer", source)?;
        self.echo(archive_path);
        Ok(())
    }

    pub fn append_symlink(
        &mut self,
        archive_path: &str,
        source: &Path,
        target: &Path,
    ) -> BuildResult<()> {
        let metadata = fs::symlink_metadata(source).at("failed to read metadata for", source)?;
        let mut header = self.header(&metadata, EntryType::Symlink);
        header.set_size(0);
        self.builder
            .append_link(&mut header, archive_path, target)
            .at("failed to add link to layer", source)?;
        self.echo(archive_path);
        Ok(())
    }

    pub fn append_bytes(&mut self, archive_path: &str, data: &[u8], mode: u32) -> BuildResult<()> {
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_mode(mode);
        header.set_uid(DEFAULT_UID);
        header.set_gid(DEFAULT_GID);
        header.set_mtime(ENTRY_MTIME);
        header.set_size(data.len() as u64);
        self.builder
            .append_data(&mut header, archive_path, data)
            .map_err(|err| BuildError::io("failed to add entry to layer", archive_path, err))?;
        self.echo(archive_path);
        Ok(())
    }

    /// Closes both streams and moves the blob into place.
    pub fn finish(self, comment: &str) -> BuildResult<ImageLayer> {
        let blobs = self.store.blobs_dir().to_path_buf();
        let tar = self
            .builder
            .into_inner()
            .at("failed to finalize layer in", &blobs)?;
        let (gzip, diff_id, _) = tar.into_parts();
        let blob = gzip.finish().at("failed to compress layer in", &blobs)?;
        let descriptor = self.store.commit(blob, MEDIA_TYPE_LAYER_GZIP)?;
        debug!(
            layer = comment,
            digest = %descriptor.digest,
            size = descriptor.size,
            "wrote layer"
        );
        Ok(ImageLayer {
            descriptor,
            diff_id: format!("sha256:{diff_id}"),
            comment: comment.to_string(),
        })
    }

    fn header(&self, metadata: &Metadata, kind: EntryType) -> Header {
        let mut header = Header::new_gnu();
        header.set_metadata_in_mode(metadata, HeaderMode::Deterministic);
        header.set_entry_type(kind);
        header.set_uid(DEFAULT_UID);
        header.set_gid(DEFAULT_GID);
        header
    }

    fn echo(&self, archive_path: &str) {
        if self.verbose {
            debug!("→ /{archive_path}");
        } else {
            trace!("→ /{archive_path}");
        }
    }
}
