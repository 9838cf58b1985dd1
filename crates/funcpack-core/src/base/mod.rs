//! Base images: resolve per platform, keep their layers in the long-lived
//! `blob-cache/`, and hard-link them into each build's blob store.

pub mod cache;
mod registry;

use std::io::Write;

use funcpack_domain::Platform;
use tracing::debug;

use crate::error::{BuildError, BuildResult};
use crate::job::BuildJob;
use crate::oci::{ConfigFile, Descriptor};

pub use cache::{BlobCache, PruneSummary};
pub use registry::OciRegistrySource;

/// A base image as resolved for one platform.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BaseImage {
    pub reference: String,
    pub layers: Vec<Descriptor>,
    pub config: ConfigFile,
}

/// Where base image metadata and layer bytes come from.
pub trait RegistrySource: Send + Sync {
    fn resolve(&self, image: &str, platform: &Platform) -> BuildResult<BaseImage>;

    /// Streams the compressed bytes of `layer` into `out`.
    fn fetch_blob(&self, image: &str, layer: &Descriptor, out: &mut dyn Write) -> BuildResult<()>;
}

/// Resolves the strategy's base image for `platform` and makes every base
/// layer available in the build's blob store. `None` when building from an
/// empty root.
pub(crate) fn pull_base(
    job: &BuildJob,
    platform: &Platform,
    source: &dyn RegistrySource,
) -> BuildResult<Option<BaseImage>> {
    let image = job.strategy().base();
    if image.is_empty() {
        return Ok(None);
    }
    let base = source.resolve(image, platform)?;
    if base.config.rootfs.diff_ids.len() != base.layers.len() {
        return Err(BuildError::Registry {
            image: image.to_string(),
            reason: format!(
                "config lists {} diff ids for {} layers",
                base.config.rootfs.diff_ids.len(),
                base.layers.len()
            ),
        });
    }
    debug!(image, %platform, layers = base.layers.len(), "resolved base image");

    let cache = BlobCache::new(job.cache_dir());
    let _shared = cache.shared_lock()?;
    let blobs = job.blobs_dir();
    for layer in &base.layers {
        let fetched = cache.ensure(layer.hex(), |out| source.fetch_blob(image, layer, out))?;
        if fetched {
            job.step(format_args!("Caching base image layer: {}", layer.hex()));
        } else {
            job.step(format_args!("Using cached base layer: {}", layer.hex()));
        }
        cache.link_into(layer.hex(), &blobs)?;
    }
    Ok(Some(base))
}
