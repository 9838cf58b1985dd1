use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use funcpack_domain::{Function, Platform};
use tracing::{info, warn};

use crate::base::{OciRegistrySource, RegistrySource};
use crate::cancel::CancelToken;
use crate::config::BuilderConfig;
use crate::containerize::containerize;
use crate::error::{BuildError, BuildResult};
use crate::job::BuildJob;
use crate::lifecycle::{self, GarbageReport};
use crate::oci::ImageIndex;
use crate::scaffold::{InPlace, Scaffolder};
use crate::strategy::LanguageBuilder;

type DoneHook = Box<dyn Fn(&BuildOutput) + Send + Sync>;

/// What a finished build leaves behind for a pusher.
#[derive(Clone, Debug)]
pub struct BuildOutput {
    pub fingerprint: String,
    pub build_dir: PathBuf,
    pub oci_dir: PathBuf,
    pub index: ImageIndex,
}

/// Builds function images on the local host, without a container daemon.
pub struct Builder {
    name: String,
    verbose: bool,
    config: BuilderConfig,
    strategy: Option<Arc<dyn LanguageBuilder>>,
    registry: Option<Arc<dyn RegistrySource>>,
    scaffolder: Arc<dyn Scaffolder>,
    on_done: Option<DoneHook>,
}

impl fmt::Debug for Builder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Builder")
            .field("name", &self.name)
            .field("verbose", &self.verbose)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Builder {
    pub fn new(name: impl Into<String>, verbose: bool) -> Self {
        Self {
            name: name.into(),
            verbose,
            config: BuilderConfig::from_env(),
            strategy: None,
            registry: None,
            scaffolder: Arc::new(InPlace),
            on_done: None,
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: BuilderConfig) -> Self {
        self.config = config;
        self
    }

    /// Uses `strategy` for every function instead of looking one up by runtime.
    #[must_use]
    pub fn with_strategy(mut self, strategy: Arc<dyn LanguageBuilder>) -> Self {
        self.strategy = Some(strategy);
        self
    }

    #[must_use]
    pub fn with_registry(mut self, registry: Arc<dyn RegistrySource>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Writes a service wrapper before building; without one the function
    /// root is built as is.
    #[must_use]
    pub fn with_scaffolder(mut self, scaffolder: Arc<dyn Scaffolder>) -> Self {
        self.scaffolder = scaffolder;
        self
    }

    /// Called after each successful build, once `last` points at it.
    #[must_use]
    pub fn on_done(mut self, hook: impl Fn(&BuildOutput) + Send + Sync + 'static) -> Self {
        self.on_done = Some(Box::new(hook));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &BuilderConfig {
        &self.config
    }

    /// Builds `function` for `platforms` (the defaults when empty) into
    /// `.func/builds/by-hash/<fingerprint>/oci`.
    ///
    /// Fails with [`crate::BuildError::InProgress`] when another live
    /// process is building the same fingerprint.
    pub fn build(
        &self,
        cancel: CancelToken,
        function: &Function,
        platforms: &[Platform],
    ) -> BuildResult<BuildOutput> {
        let job = BuildJob::new(
            cancel,
            function,
            platforms,
            self.verbose,
            self.config.clone(),
            self.strategy.clone(),
        )?;
        info!(
            "Building function image for {} using {} builder",
            function.name, self.name
        );
        lifecycle::setup(&job)?;
        let teardown = Teardown(&job);

        let service_dir = self.scaffolder.scaffold(&job)?;
        if !service_dir.is_dir() {
            return Err(BuildError::Invariant(format!(
                "scaffolded service directory {} does not exist",
                service_dir.display()
            )));
        }
        job.step(format_args!("cd {}", job.rel(&service_dir)));
        job.set_service_dir(service_dir);

        let registry = self
            .registry
            .clone()
            .unwrap_or_else(|| Arc::new(OciRegistrySource::new(&self.config)));
        let index = containerize(&job, registry.as_ref())?;
        lifecycle::finalize_last(&job)?;
        drop(teardown);

        let output = BuildOutput {
            fingerprint: job.fingerprint().to_string(),
            build_dir: job.build_dir(),
            oci_dir: job.oci_dir(),
            index,
        };
        info!("✅ Function built: {}", output.oci_dir.display());
        if let Some(hook) = &self.on_done {
            hook(&output);
        }
        Ok(output)
    }
}

/// Runs the teardown passes for `function_root` without building.
pub fn clean(function_root: &Path) -> GarbageReport {
    lifecycle::collect_garbage(function_root)
}

struct Teardown<'a>(&'a BuildJob);

impl Drop for Teardown<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            warn!("build panicked; leaving its directory for the next teardown");
        }
        lifecycle::teardown(self.0);
    }
}
