//! Per-runtime build strategies.
//!
//! A strategy contributes the runtime-specific parts of an image: an optional
//! base, layers shared across platforms (installed dependencies), layers per
//! platform (a cross-compiled binary), and the final tweaks to the config
//! (command, extra environment). Adding a runtime means adding one
//! implementation and one arm in [`strategy_for`].

mod go;
mod python;

use std::sync::Arc;

use funcpack_domain::Platform;

use crate::config::BuilderConfig;
use crate::error::{BuildError, BuildResult};
use crate::job::BuildJob;
use crate::oci::{ConfigFile, ImageLayer};

pub use go::{go_build_envs, go_output_name, GoBuilder};
pub use python::{PythonBuilder, DEFAULT_PYTHON_BASE};

/// Runtimes with a registered strategy.
pub const SUPPORTED_RUNTIMES: &[&str] = &["go", "python"];

pub trait LanguageBuilder: Send + Sync {
    /// Remote base image reference; empty builds from an empty root.
    fn base(&self) -> &str;

    /// Platform-independent layers, built once per job.
    fn write_shared(&self, job: &BuildJob) -> BuildResult<Vec<ImageLayer>>;

    /// Layers for one target platform, called once per platform.
    fn write_platform(&self, job: &BuildJob, platform: &Platform) -> BuildResult<Vec<ImageLayer>>;

    /// Final say over the platform's config, e.g. the command to run.
    fn configure(
        &self,
        job: &BuildJob,
        platform: &Platform,
        config: ConfigFile,
    ) -> BuildResult<ConfigFile>;
}

pub fn strategy_for(runtime: &str, config: &BuilderConfig) -> BuildResult<Arc<dyn LanguageBuilder>> {
    match runtime {
        "go" => Ok(Arc::new(GoBuilder::new(config.go_binary.clone()))),
        "python" => Ok(Arc::new(PythonBuilder::new(config.python_binary.clone()))),
        other => Err(BuildError::UnsupportedRuntime {
            runtime: other.to_string(),
        }),
    }
}

pub fn is_supported(runtime: &str) -> bool {
    SUPPORTED_RUNTIMES.contains(&runtime)
}
