//! Assembles the OCI image layout for a job.
//!
//! The layers every platform shares (source, certificates, strategy output)
//! are written once. Each platform then gets its own layers, an optional
//! base image, a config blob and a manifest; `index.json` ties the
//! per-platform manifests together.

use funcpack_domain::Platform;
use tracing::{debug, info};

use crate::base::{pull_base, BaseImage, RegistrySource};
use crate::blob::{write_file, BlobStore};
use crate::error::{BuildError, BuildResult};
use crate::job::BuildJob;
use crate::layers::{write_certs_layer, write_data_layer, DEFAULT_GID, DEFAULT_UID};
use crate::oci::{
    ConfigFile, Descriptor, Empty, History, ImageIndex, ImageLayer, ImageManifest, INDEX_FILE,
    MEDIA_TYPE_CONFIG, MEDIA_TYPE_MANIFEST, OCI_LAYOUT, OCI_LAYOUT_FILE,
};
use crate::process::Toolchain;

pub const EXPOSED_PORT: &str = "8080/tcp";
pub const WORKING_DIR: &str = "/func/";
pub const STOP_SIGNAL: &str = "SIGKILL";
const HISTORY_AUTHOR: &str = "func";

/// Writes `oci/` for every platform of the job and returns the index.
pub(crate) fn containerize(job: &BuildJob, registry: &dyn RegistrySource) -> BuildResult<ImageIndex> {
    let oci_dir = job.oci_dir();
    job.step(format_args!("echo '{OCI_LAYOUT}' > {}", job.rel(&oci_dir.join(OCI_LAYOUT_FILE))));
    write_file(&oci_dir.join(OCI_LAYOUT_FILE), OCI_LAYOUT.as_bytes())?;

    let mut shared = vec![write_data_layer(job)?, write_certs_layer(job)?];
    shared.extend(job.strategy().write_shared(job)?);
    let version = function_version(job);

    let store = BlobStore::for_job(job);
    let mut manifests = Vec::with_capacity(job.platforms().len());
    for platform in job.platforms() {
        if job.cancel().is_cancelled() {
            return Err(BuildError::Cancelled {
                program: "containerize".to_string(),
            });
        }
        info!("   {platform}");
        let base = pull_base(job, platform, registry)?;
        let mut layers = shared.clone();
        layers.extend(job.strategy().write_platform(job, platform)?);

        let config = new_config_file(job, platform, &layers, base.as_ref(), &version);
        let config = job.strategy().configure(job, platform, config)?;
        let config_descriptor = store.write_json("config.json", "image config", &config, MEDIA_TYPE_CONFIG)?;

        let manifest = ImageManifest {
            schema_version: 2,
            media_type: MEDIA_TYPE_MANIFEST.to_string(),
            config: config_descriptor,
            layers: base
                .iter()
                .flat_map(|base| base.layers.iter().cloned())
                .chain(layers.iter().map(|layer| layer.descriptor.clone()))
                .collect(),
        };
        if config.rootfs.diff_ids.len() != manifest.layers.len() {
            return Err(BuildError::Invariant(format!(
                "{platform}: config lists {} diff ids for {} manifest layers",
                config.rootfs.diff_ids.len(),
                manifest.layers.len()
            )));
        }
        let name = format!("manifest.{}.{}.json", platform.os, platform.architecture);
        let descriptor = store
            .write_json(&name, "image manifest", &manifest, MEDIA_TYPE_MANIFEST)?
            .with_platform(platform);
        debug!(%platform, digest = %descriptor.digest, layers = manifest.layers.len(), "wrote manifest");
        manifests.push(descriptor);
    }

    let index = ImageIndex::new(manifests);
    write_index(job, &index)?;
    Ok(index)
}

/// The platform's config before the strategy adjusts it: metadata env,
/// the function's env and volumes, and one history entry and diff id per
/// layer, with the base image's entries first.
pub fn new_config_file(
    job: &BuildJob,
    platform: &Platform,
    layers: &[ImageLayer],
    base: Option<&BaseImage>,
    version: &str,
) -> ConfigFile {
    let created = job.created();
    let mut config = ConfigFile {
        created: Some(created.clone()),
        architecture: platform.architecture.clone(),
        os: platform.os.clone(),
        variant: platform.variant.clone(),
        ..ConfigFile::default()
    };

    let runtime = &mut config.config;
    runtime.user = format!("{DEFAULT_UID}:{DEFAULT_GID}");
    runtime.env = vec![format!("FUNC_CREATED={created}"), format!("FUNC_VERSION={version}")];
    runtime.env.extend(job.function().env_assignments());
    runtime.volumes = job
        .function()
        .volume_paths()
        .into_iter()
        .map(|path| (path, Empty {}))
        .collect();
    runtime.exposed_ports.insert(EXPOSED_PORT.to_string(), Empty {});
    runtime.working_dir = WORKING_DIR.to_string();
    runtime.stop_signal = STOP_SIGNAL.to_string();

    config.history = layers
        .iter()
        .map(|layer| History {
            created: Some(created.clone()),
            author: Some(HISTORY_AUTHOR.to_string()),
            comment: Some(layer.comment.clone()),
            ..History::default()
        })
        .collect();
    config.rootfs.diff_ids = layers.iter().map(|layer| layer.diff_id.clone()).collect();

    if let Some(base) = base {
        let inherited = &base.config;
        if !inherited.config.user.is_empty() {
            config.config.user.clone_from(&inherited.config.user);
        }
        config.config.env.splice(0..0, inherited.config.env.iter().cloned());
        config.history.splice(0..0, inherited.history.iter().cloned());
        config
            .rootfs
            .diff_ids
            .splice(0..0, inherited.rootfs.diff_ids.iter().cloned());
    }
    config
}

/// `git describe --tags` of the function source, or empty outside a tagged
/// repository.
fn function_version(job: &BuildJob) -> String {
    let describe = Toolchain::new(&job.config().git_binary).args(["describe", "--tags"]);
    match describe.run_unchecked(&job.function().root, &job.toolchain_cancel()) {
        Ok(output) if output.code == 0 => output.stdout.trim().to_string(),
        Ok(output) => {
            debug!(stderr = %output.stderr.trim(), "no version tag for function");
            String::new()
        }
        Err(err) => {
            debug!(error = %err, "unable to describe function version");
            String::new()
        }
    }
}

fn write_index(job: &BuildJob, index: &ImageIndex) -> BuildResult<()> {
    let path = job.oci_dir().join(INDEX_FILE);
    let mut body = serde_json::to_vec_pretty(index).map_err(|source| BuildError::Encode {
        what: "image index",
        source,
    })?;
    body.push(b'\n');
    job.step(format_args!("write {}", job.rel(&path)));
    write_file(&path, &body)
}

/// Descriptor of the single-platform manifest in `index` for `platform`.
pub fn manifest_for<'a>(index: &'a ImageIndex, platform: &Platform) -> Option<&'a Descriptor> {
    index
        .manifests
        .iter()
        .find(|descriptor| descriptor.platform.as_ref().is_some_and(|p| p.matches(platform)))
}
