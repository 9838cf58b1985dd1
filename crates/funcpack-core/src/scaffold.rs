//! Service wrappers around a function's source.
//!
//! A function is usually a library: something has to supply the `main` that
//! serves it. A [`Scaffolder`] writes that wrapper below the build directory
//! before any layer is produced and tells the strategies where to run their
//! toolchains.

use std::path::PathBuf;

use crate::error::BuildResult;
use crate::job::BuildJob;

pub trait Scaffolder: Send + Sync {
    /// Writes the wrapper for `job` and returns the directory its toolchain
    /// should build from.
    fn scaffold(&self, job: &BuildJob) -> BuildResult<PathBuf>;
}

/// No wrapper: the function root is already a runnable service.
#[derive(Clone, Copy, Debug, Default)]
pub struct InPlace;

impl Scaffolder for InPlace {
    fn scaffold(&self, job: &BuildJob) -> BuildResult<PathBuf> {
        Ok(job.function().root.clone())
    }
}
