use std::env;
use std::fs;

use funcpack_domain::Platform;
use tracing::info;

use crate::blob::BlobStore;
use crate::error::{BuildResult, IoContext};
use crate::job::BuildJob;
use crate::layers::LayerWriter;
use crate::oci::{ConfigFile, ImageLayer};
use crate::process::Toolchain;

use super::LanguageBuilder;

/// Statically linked Go binaries on an empty root.
#[derive(Debug, Clone)]
pub struct GoBuilder {
    go: String,
}

impl GoBuilder {
    pub fn new(go: impl Into<String>) -> Self {
        Self { go: go.into() }
    }
}

impl LanguageBuilder for GoBuilder {
    fn base(&self) -> &str {
        ""
    }

    fn write_shared(&self, _job: &BuildJob) -> BuildResult<Vec<ImageLayer>> {
        Ok(Vec::new())
    }

    fn write_platform(&self, job: &BuildJob, platform: &Platform) -> BuildResult<Vec<ImageLayer>> {
        let result_dir = job.build_dir().join("result");
        fs::create_dir_all(&result_dir).at("failed to create", &result_dir)?;
        let output = result_dir.join(go_output_name(platform));
        let output_arg = output.to_string_lossy().to_string();

        let build = Toolchain::new(&self.go)
            .args(["build", "-o", output_arg.as_str()])
            .exact_env(go_build_envs(platform, env::vars()));
        if job.verbose() {
            job.step(build.display());
        } else {
            info!("   {}", go_output_name(platform));
        }
        build.run(job.service_dir(), &job.toolchain_cancel())?;

        let store = BlobStore::for_job(job);
        let name = format!("execlayer.{}.{}", platform.os, platform.architecture);
        let mut layer = LayerWriter::new(&store, &name, job.verbose())?;
        layer.append_file("func/f", &output, Some(0o755))?;
        let mut layer = layer.finish(&format!("go executable for {platform}"))?;
        layer.descriptor = layer.descriptor.with_platform(platform);
        Ok(vec![layer])
    }

    fn configure(
        &self,
        _job: &BuildJob,
        _platform: &Platform,
        mut config: ConfigFile,
    ) -> BuildResult<ConfigFile> {
        // Cmd rather than Entrypoint so it stays overridable.
        config.config.cmd = Some(vec!["/func/f".to_string()]);
        Ok(config)
    }
}

/// `f.<os>.<arch>[.<variant>]`
pub fn go_output_name(platform: &Platform) -> String {
    match platform.variant() {
        Some(variant) => format!("f.{}.{}.{variant}", platform.os, platform.architecture),
        None => format!("f.{}.{}", platform.os, platform.architecture),
    }
}

/// Cross-compilation settings for `platform`, followed by `inherited` with
/// any of those keys removed.
pub fn go_build_envs(
    platform: &Platform,
    inherited: impl IntoIterator<Item = (String, String)>,
) -> Vec<(String, String)> {
    let mut pegged = vec![
        ("CGO_ENABLED".to_string(), "0".to_string()),
        ("GOOS".to_string(), platform.os.clone()),
        ("GOARCH".to_string(), platform.architecture.clone()),
    ];
    match (platform.architecture.as_str(), platform.variant()) {
        ("arm", Some(variant)) => {
            pegged.push(("GOARM".to_string(), variant.trim_start_matches('v').to_string()));
        }
        ("amd64", Some(variant)) => pegged.push(("GOAMD64".to_string(), variant.to_string())),
        _ => {}
    }
    let keys = pegged.iter().map(|(key, _)| key.clone()).collect::<Vec<_>>();
    pegged.extend(inherited.into_iter().filter(|(key, _)| !keys.contains(key)));
    pegged
}
