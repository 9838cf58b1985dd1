use std::path::{Component, Path, PathBuf};

use funcpack_domain::Platform;
use tracing::info;

use crate::blob::BlobStore;
use crate::error::BuildResult;
use crate::job::BuildJob;
use crate::layers::{append_tree, LayerWriter, FUNC_MOUNT};
use crate::oci::{ConfigFile, ImageLayer};
use crate::process::Toolchain;

use super::LanguageBuilder;

pub const DEFAULT_PYTHON_BASE: &str = "python:3.13-slim";

const LISTEN_ADDRESS: &str = "LISTEN_ADDRESS=0.0.0.0:8080";

/// Source plus vendored dependencies on top of the official Python image.
#[derive(Debug, Clone)]
pub struct PythonBuilder {
    python: String,
    base: String,
}

impl PythonBuilder {
    pub fn new(python: impl Into<String>) -> Self {
        Self {
            python: python.into(),
            base: DEFAULT_PYTHON_BASE.to_string(),
        }
    }

    #[must_use]
    pub fn with_base(mut self, base: impl Into<String>) -> Self {
        self.base = base.into();
        self
    }

    fn pip(&self) -> PathBuf {
        if cfg!(windows) {
            PathBuf::from(".venv").join("Scripts").join("pip.exe")
        } else {
            PathBuf::from(".venv").join("bin").join("pip")
        }
    }
}

impl LanguageBuilder for PythonBuilder {
    fn base(&self) -> &str {
        &self.base
    }

    /// Installs the project's dependencies into `<build>/lib` with a
    /// throwaway virtualenv and archives that tree.
    fn write_shared(&self, job: &BuildJob) -> BuildResult<Vec<ImageLayer>> {
        let build_dir = job.build_dir();
        let cancel = job.toolchain_cancel();
        let pip = build_dir.join(self.pip()).to_string_lossy().to_string();
        let service = job.service_dir().to_string_lossy().to_string();
        let steps = [
            Toolchain::new(&self.python).args(["-m", "venv", ".venv"]),
            Toolchain::new(&pip).args(["install", "--upgrade", "pip"]),
            Toolchain::new(&pip).args(["install", service.as_str(), "--target", "lib"]),
        ];
        for step in &steps {
            if job.verbose() {
                job.step(step.display());
            } else {
                info!("   {}", step.display());
            }
            step.run(&build_dir, &cancel)?;
        }

        let store = BlobStore::for_job(job);
        let mut layer = LayerWriter::new(&store, "lib", job.verbose())?;
        let prefix = format!("{FUNC_MOUNT}/{}", build_rel_path(job));
        append_tree(&mut layer, &build_dir, &job.function().root, &prefix, |entry| {
            let name = entry.file_name().to_string_lossy();
            (entry.depth() == 1 && matches!(name.as_ref(), "oci" | ".venv" | "result"))
                || name.ends_with(".tmp")
        })?;
        Ok(vec![layer.finish("python dependencies")?])
    }

    fn write_platform(&self, _job: &BuildJob, _platform: &Platform) -> BuildResult<Vec<ImageLayer>> {
        Ok(Vec::new())
    }

    fn configure(
        &self,
        job: &BuildJob,
        _platform: &Platform,
        mut config: ConfigFile,
    ) -> BuildResult<ConfigFile> {
        let build = format!("/{FUNC_MOUNT}/{}", build_rel_path(job));
        config.config.env.push(format!("PYTHONPATH={build}/lib"));
        config.config.env.push(LISTEN_ADDRESS.to_string());
        let main = match image_rel_path(job, job.service_dir()) {
            Some(rel) if !rel.is_empty() => format!("/{FUNC_MOUNT}/{rel}/main.py"),
            _ => format!("/{FUNC_MOUNT}/main.py"),
        };
        config.config.cmd = Some(vec!["python".to_string(), main]);
        Ok(config)
    }
}

/// Build directory relative to the function root, slash separated
/// (`.func/builds/by-hash/<fingerprint>`).
fn build_rel_path(job: &BuildJob) -> String {
    let build_dir = job.build_dir();
    image_rel_path(job, &build_dir).unwrap_or_default()
}

// Where `dir` lands below `/func` in the image. The data layer and the
// vendored layer both mirror the function root there.
fn image_rel_path(job: &BuildJob, dir: &Path) -> Option<String> {
    let rel = dir.strip_prefix(&job.function().root).ok()?;
    Some(
        rel.components()
            .filter_map(|component| match component {
                Component::Normal(part) => Some(part.to_string_lossy().to_string()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("/"),
    )
}
