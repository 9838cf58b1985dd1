use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use funcpack_domain::{fingerprint, resolve_platforms, Function, Platform, RUN_DATA_DIR};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{debug, trace};

use crate::cancel::CancelToken;
use crate::config::BuilderConfig;
use crate::error::{BuildError, BuildResult};
use crate::strategy::{strategy_for, LanguageBuilder};

/// Everything one invocation of a build needs, plus the on-disk layout
/// derived from the function root and source fingerprint.
pub struct BuildJob {
    cancel: CancelToken,
    start: OffsetDateTime,
    fingerprint: String,
    function: Function,
    platforms: Vec<Platform>,
    verbose: bool,
    strategy: Arc<dyn LanguageBuilder>,
    config: BuilderConfig,
    pid: u32,
    service_dir: OnceLock<PathBuf>,
}

impl BuildJob {
    pub(crate) fn new(
        cancel: CancelToken,
        function: &Function,
        platforms: &[Platform],
        verbose: bool,
        config: BuilderConfig,
        strategy: Option<Arc<dyn LanguageBuilder>>,
    ) -> BuildResult<Self> {
        let fingerprint = fingerprint(&function.root).map_err(|source| BuildError::Fingerprint {
            root: function.root.clone(),
            source,
        })?;
        let strategy = match strategy {
            Some(strategy) => strategy,
            None => strategy_for(&function.runtime, &config)?,
        };
        let start = config
            .source_date_epoch
            .and_then(|epoch| OffsetDateTime::from_unix_timestamp(epoch).ok())
            .unwrap_or_else(OffsetDateTime::now_utc);
        let job = Self {
            cancel,
            start,
            fingerprint,
            function: function.clone(),
            platforms: resolve_platforms(platforms),
            verbose,
            strategy,
            config,
            pid: std::process::id(),
            service_dir: OnceLock::new(),
        };
        debug!(
            function = %job.function.name,
            runtime = %job.function.runtime,
            fingerprint = %job.fingerprint,
            platforms = job.platforms.len(),
            "created build job"
        );
        Ok(job)
    }

    pub fn cancel(&self) -> &CancelToken {
        &self.cancel
    }

    /// Build start time as RFC 3339.
    pub fn created(&self) -> String {
        self.start.format(&Rfc3339).unwrap_or_default()
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn function(&self) -> &Function {
        &self.function
    }

    pub fn platforms(&self) -> &[Platform] {
        &self.platforms
    }

    /// Token handed to external toolchains, bounded by the configured timeout.
    pub fn toolchain_cancel(&self) -> CancelToken {
        match self.config.toolchain_timeout {
            Some(timeout) => self.cancel.with_timeout(timeout),
            None => self.cancel.clone(),
        }
    }

    /// Directory toolchains run in: whatever the scaffolder returned, the
    /// function root until then.
    pub fn service_dir(&self) -> &Path {
        self.service_dir
            .get()
            .map_or(self.function.root.as_path(), PathBuf::as_path)
    }

    pub(crate) fn set_service_dir(&self, dir: PathBuf) {
        if self.service_dir.set(dir).is_err() {
            debug!("service directory already scaffolded; keeping the first");
        }
    }

    pub fn verbose(&self) -> bool {
        self.verbose
    }

    pub fn config(&self) -> &BuilderConfig {
        &self.config
    }

    pub(crate) fn strategy(&self) -> &dyn LanguageBuilder {
        self.strategy.as_ref()
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Echoes a build step at debug level when verbose, trace otherwise.
    pub fn step(&self, message: impl Display) {
        if self.verbose {
            debug!("{message}");
        } else {
            trace!("{message}");
        }
    }

    pub fn run_data_dir(&self) -> PathBuf {
        self.function.root.join(RUN_DATA_DIR)
    }

    pub fn last_link(&self) -> PathBuf {
        builds_root(&self.function.root).join("last")
    }

    pub fn pids_dir(&self) -> PathBuf {
        builds_root(&self.function.root).join("by-pid")
    }

    pub fn pid_link(&self) -> PathBuf {
        self.pids_dir().join(self.pid.to_string())
    }

    pub fn builds_dir(&self) -> PathBuf {
        builds_root(&self.function.root).join("by-hash")
    }

    pub fn build_dir(&self) -> PathBuf {
        self.builds_dir().join(&self.fingerprint)
    }

    /// Where a completed build of this fingerprint is parked while it is
    /// rebuilt, so `last` keeps pointing at a whole tree.
    pub fn preserved_dir(&self) -> PathBuf {
        self.builds_dir().join(format!("{}.previous", self.fingerprint))
    }

    pub fn oci_dir(&self) -> PathBuf {
        self.build_dir().join("oci")
    }

    pub fn blobs_dir(&self) -> PathBuf {
        self.oci_dir().join("blobs").join("sha256")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.run_data_dir().join("blob-cache")
    }

    /// `path` relative to the build directory, for log lines.
    pub(crate) fn rel(&self, path: &Path) -> String {
        let build_dir = self.build_dir();
        path.strip_prefix(&build_dir).map_or_else(
            |_| path.display().to_string(),
            |rel| format!("./{}", rel.display()),
        )
    }
}

pub(crate) fn builds_root(function_root: &Path) -> PathBuf {
    function_root.join(RUN_DATA_DIR).join("builds")
}
