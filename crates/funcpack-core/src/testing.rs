//! Fixtures shared by the unit tests.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use funcpack_domain::{Function, Platform};
use sha2::{Digest, Sha256};

use crate::base::{BaseImage, RegistrySource};
use crate::blob::BlobStore;
use crate::cancel::CancelToken;
use crate::config::BuilderConfig;
use crate::error::{BuildError, BuildResult, IoContext};
use crate::job::BuildJob;
use crate::layers::LayerWriter;
use crate::oci::{ConfigFile, Descriptor, History, ImageLayer, MEDIA_TYPE_LAYER_GZIP};
use crate::scaffold::Scaffolder;
use crate::strategy::LanguageBuilder;

pub(crate) const TEST_CA: &str = "-----BEGIN CERTIFICATE-----\nMIIBfixture\n-----END CERTIFICATE-----\n";

/// A small project: `a.txt`, `b/c.txt` and an executable `run.sh`.
pub(crate) fn fixture_function(root: &Path, runtime: &str) -> Result<Function> {
    fs::write(root.join("a.txt"), "alpha\n")?;
    fs::create_dir_all(root.join("b"))?;
    fs::write(root.join("b/c.txt"), "charlie\n")?;
    fs::write(root.join("run.sh"), "#!/bin/sh\necho run\n")?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(root.join("run.sh"), fs::Permissions::from_mode(0o755))?;
    }
    Ok(Function::new(root, "fixture", runtime))
}

/// Config with a CA bundle kept under the run-data dir so it never lands
/// in the data layer.
pub(crate) fn test_config(root: &Path) -> Result<BuilderConfig> {
    let dir = root.join(".func");
    fs::create_dir_all(&dir)?;
    let bundle = dir.join("test-ca.crt");
    fs::write(&bundle, TEST_CA)?;
    let mut config = BuilderConfig::default().with_ca_bundle(bundle);
    config.cache_max_bytes = None;
    config.source_date_epoch = Some(1_700_000_000);
    Ok(config)
}

pub(crate) fn stub_job(
    function: &Function,
    platforms: &[Platform],
    strategy: Arc<dyn LanguageBuilder>,
) -> Result<BuildJob> {
    Ok(BuildJob::new(
        CancelToken::new(),
        function,
        platforms,
        true,
        test_config(&function.root)?,
        Some(strategy),
    )?)
}

/// Strategy that records calls and writes one tiny platform layer holding
/// the platform name at `/func/f`. With `fail_shared` set it fails the way a
/// broken toolchain would.
#[derive(Default)]
pub(crate) struct StubBuilder {
    pub base: String,
    pub fail_shared: bool,
    pub calls: Mutex<Vec<String>>,
    pub service_dirs: Mutex<Vec<PathBuf>>,
}

impl StubBuilder {
    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|calls| calls.clone()).unwrap_or_default()
    }

    fn record(&self, call: String) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }
}

impl LanguageBuilder for StubBuilder {
    fn base(&self) -> &str {
        &self.base
    }

    fn write_shared(&self, job: &BuildJob) -> BuildResult<Vec<ImageLayer>> {
        self.record("shared".to_string());
        if let Ok(mut dirs) = self.service_dirs.lock() {
            dirs.push(job.service_dir().to_path_buf());
        }
        if self.fail_shared {
            return Err(BuildError::Toolchain {
                program: "go".to_string(),
                status: "exit status: 1".to_string(),
                stderr: "boom".to_string(),
            });
        }
        Ok(Vec::new())
    }

    fn write_platform(&self, job: &BuildJob, platform: &Platform) -> BuildResult<Vec<ImageLayer>> {
        self.record(format!("platform {platform}"));
        let store = BlobStore::for_job(job);
        let mut layer = LayerWriter::new(&store, "stub", false)?;
        layer.append_bytes("func/f", platform.to_string().as_bytes(), 0o755)?;
        let mut layer = layer.finish("stub executable")?;
        layer.descriptor = layer.descriptor.with_platform(platform);
        Ok(vec![layer])
    }

    fn configure(
        &self,
        _job: &BuildJob,
        platform: &Platform,
        mut config: ConfigFile,
    ) -> BuildResult<ConfigFile> {
        self.record(format!("configure {platform}"));
        config.config.cmd = Some(vec!["/func/f".to_string()]);
        Ok(config)
    }
}

/// Writes a one-file Go wrapper to `<build>/service`.
#[derive(Default)]
pub(crate) struct WrapperScaffolder {
    pub runs: AtomicUsize,
}

impl Scaffolder for WrapperScaffolder {
    fn scaffold(&self, job: &BuildJob) -> BuildResult<PathBuf> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        let dir = job.build_dir().join("service");
        fs::create_dir_all(&dir).at("failed to create", &dir)?;
        let main = dir.join("main.go");
        fs::write(&main, "package main\n\nfunc main() {}\n").at("failed to write", &main)?;
        Ok(dir)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TarEntry {
    pub path: String,
    pub uid: u64,
    pub gid: u64,
    pub mode: u32,
    pub link: Option<PathBuf>,
    pub contents: Vec<u8>,
}

/// Decodes a gzip tar blob into its entries.
pub(crate) fn read_layer(path: &Path) -> Result<Vec<TarEntry>> {
    let mut archive = tar::Archive::new(GzDecoder::new(File::open(path)?));
    let mut entries = Vec::new();
    for entry in archive.entries()? {
        let mut entry = entry?;
        let header = entry.header().clone();
        let mut contents = Vec::new();
        entry.read_to_end(&mut contents)?;
        entries.push(TarEntry {
            path: entry.path()?.to_string_lossy().trim_end_matches('/').to_string(),
            uid: header.uid()?,
            gid: header.gid()?,
            mode: header.mode()?,
            link: entry.link_name()?.map(|link| link.into_owned()),
            contents,
        });
    }
    Ok(entries)
}

/// Writes an executable shell script standing in for a toolchain binary.
#[cfg(unix)]
pub(crate) fn write_script(path: &Path, body: &str) -> Result<PathBuf> {
    use std::os::unix::fs::PermissionsExt;

    fs::write(path, body)?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))?;
    Ok(path.to_path_buf())
}

/// In-memory registry serving one-layer base images.
#[derive(Default)]
pub(crate) struct FakeRegistry {
    images: Mutex<HashMap<(String, String), BaseImage>>,
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    fetches: AtomicUsize,
}

impl FakeRegistry {
    /// Registers `image` for `platform` with a single layer holding `files`.
    pub(crate) fn publish(&self, image: &str, platform: &Platform, files: &[(&str, &str)]) -> Result<BaseImage> {
        let mut raw = Vec::new();
        {
            let mut builder = tar::Builder::new(&mut raw);
            for (path, contents) in files {
                let mut header = tar::Header::new_gnu();
                header.set_size(contents.len() as u64);
                header.set_mode(0o644);
                header.set_cksum();
                builder.append_data(&mut header, path, contents.as_bytes())?;
            }
            builder.finish()?;
        }
        let mut gz = GzEncoder::new(Vec::new(), Compression::default());
        gz.write_all(&raw)?;
        let compressed = gz.finish()?;
        let digest = hex::encode(Sha256::digest(&compressed));
        let diff_id = format!("sha256:{}", hex::encode(Sha256::digest(&raw)));

        let layer = Descriptor::new(MEDIA_TYPE_LAYER_GZIP, &digest, compressed.len() as u64);
        let mut config = ConfigFile {
            architecture: platform.architecture.clone(),
            os: platform.os.clone(),
            variant: platform.variant.clone(),
            ..ConfigFile::default()
        };
        config.config.env = vec!["PATH=/usr/local/bin:/usr/bin:/bin".to_string()];
        config.config.user = String::new();
        config.rootfs.diff_ids = vec![diff_id];
        config.history = vec![History {
            created_by: Some(format!("base {image}")),
            ..History::default()
        }];
        let base = BaseImage {
            reference: image.to_string(),
            layers: vec![layer],
            config,
        };
        self.blobs
            .lock()
            .map_err(|_| anyhow::anyhow!("poisoned"))?
            .insert(digest, compressed);
        self.images
            .lock()
            .map_err(|_| anyhow::anyhow!("poisoned"))?
            .insert((image.to_string(), platform.to_string()), base.clone());
        Ok(base)
    }

    pub(crate) fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

impl RegistrySource for FakeRegistry {
    fn resolve(&self, image: &str, platform: &Platform) -> BuildResult<BaseImage> {
        let images = self.images.lock().map_err(|_| BuildError::Invariant("poisoned".into()))?;
        images
            .get(&(image.to_string(), platform.to_string()))
            .cloned()
            .ok_or_else(|| BuildError::Registry {
                image: image.to_string(),
                reason: format!("no image for {platform}"),
            })
    }

    fn fetch_blob(&self, image: &str, layer: &Descriptor, out: &mut dyn Write) -> BuildResult<()> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let blobs = self.blobs.lock().map_err(|_| BuildError::Invariant("poisoned".into()))?;
        let bytes = blobs.get(layer.hex()).ok_or_else(|| BuildError::Registry {
            image: image.to_string(),
            reason: format!("unknown blob {}", layer.digest),
        })?;
        out.write_all(bytes)
            .map_err(|err| BuildError::io("failed to write blob", Path::new(layer.hex()), err))
    }
}
