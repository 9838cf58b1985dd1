use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use funcpack_core::{
    clean, last_build_dir, BlobCache, BuildOutput, Builder, BuilderConfig, CancelToken,
};
use funcpack_domain::{Function, FUNCTION_FILE, RUN_DATA_DIR};
use serde_json::{json, Value};
use tracing::debug;

use crate::cli::{BuildArgs, CacheCommand, CommandCli, PathArgs, PruneArgs};
use crate::output::ExecutionOutcome;

pub fn dispatch(command: &CommandCli, verbose: bool) -> (&'static str, ExecutionOutcome) {
    match command {
        CommandCli::Build(args) => ("build", build(args, verbose)),
        CommandCli::Last(args) => ("last", last(args)),
        CommandCli::Clean(args) => ("clean", clean_builds(args)),
        CommandCli::Cache(CacheCommand::Prune(args)) => ("cache prune", prune(args)),
    }
}

fn function_root(args: &PathArgs) -> Result<PathBuf, ExecutionOutcome> {
    fs::canonicalize(&args.path).map_err(|err| {
        ExecutionOutcome::user_error(
            format!("function root {} is not accessible: {err}", args.path.display()),
            json!({ "hint": "pass --path pointing at the function directory" }),
        )
    })
}

fn build(args: &BuildArgs, verbose: bool) -> ExecutionOutcome {
    let root = match function_root(&args.common) {
        Ok(root) => root,
        Err(outcome) => return outcome,
    };
    let function = match Function::load(&root) {
        Ok(function) => function,
        Err(err) => {
            return ExecutionOutcome::user_error(
                format!("{err:#}"),
                json!({ "hint": format!("run inside a function project (one with {FUNCTION_FILE}) or pass --path") }),
            )
        }
    };
    let cancel = match args.timeout {
        Some(secs) => CancelToken::new().with_timeout(Duration::from_secs(secs)),
        None => CancelToken::new(),
    };
    debug!(root = %root.display(), runtime = %function.runtime, "building function");

    let builder = Builder::new("host", verbose);
    match builder.build(cancel, &function, &args.platforms) {
        Ok(output) => ExecutionOutcome::success(
            format!(
                "built {} for {} platform(s) in {}",
                function.name,
                output.index.manifests.len(),
                output.oci_dir.display()
            ),
            build_details(&output),
        ),
        Err(err) => ExecutionOutcome::from_build_error(&err),
    }
}

fn build_details(output: &BuildOutput) -> Value {
    let manifests = output
        .index
        .manifests
        .iter()
        .map(|descriptor| {
            let platform = descriptor.platform.as_ref().map(|platform| {
                match &platform.variant {
                    Some(variant) => format!("{}/{}/{variant}", platform.os, platform.architecture),
                    None => format!("{}/{}", platform.os, platform.architecture),
                }
            });
            json!({ "platform": platform, "digest": descriptor.digest, "size": descriptor.size })
        })
        .collect::<Vec<_>>();
    json!({
        "fingerprint": output.fingerprint,
        "oci_dir": output.oci_dir,
        "manifests": manifests,
    })
}

fn last(args: &PathArgs) -> ExecutionOutcome {
    let root = match function_root(args) {
        Ok(root) => root,
        Err(outcome) => return outcome,
    };
    match last_build_dir(&root) {
        Ok(dir) => {
            let oci = dir.join("oci");
            ExecutionOutcome::success(
                oci.display().to_string(),
                json!({ "passthrough": true, "oci_dir": oci }),
            )
        }
        Err(err) => ExecutionOutcome::user_error(
            format!("no completed build for {}", root.display()),
            json!({ "code": err.code(), "hint": "run `funcpack build` first" }),
        ),
    }
}

fn clean_builds(args: &PathArgs) -> ExecutionOutcome {
    let root = match function_root(args) {
        Ok(root) => root,
        Err(outcome) => return outcome,
    };
    let report = clean(&root);
    ExecutionOutcome::success(
        format!(
            "removed {} stale build(s) and {} orphaned claim(s)",
            report.stale_builds.len(),
            report.orphaned_claims.len()
        ),
        json!({
            "stale_builds": report.stale_builds,
            "orphaned_claims": report.orphaned_claims,
        }),
    )
}

fn prune(args: &PruneArgs) -> ExecutionOutcome {
    let root = match function_root(&args.common) {
        Ok(root) => root,
        Err(outcome) => return outcome,
    };
    let Some(limit) = args.max_bytes.or_else(|| BuilderConfig::from_env().cache_limit()) else {
        return ExecutionOutcome::user_error(
            "no cache size limit given",
            json!({ "hint": "pass --max-bytes or set FUNCPACK_BLOB_CACHE_MAX_BYTES" }),
        );
    };
    let cache = BlobCache::new(cache_dir(&root));
    match cache.prune(limit) {
        Ok(summary) if summary.skipped_locked => ExecutionOutcome::user_error(
            "blob cache is in use by a running build",
            json!({ "hint": "retry once the build finishes" }),
        ),
        Ok(summary) => ExecutionOutcome::success(
            format!(
                "evicted {} layer(s), freed {} bytes, {} bytes remain",
                summary.removed.len(),
                summary.freed_bytes,
                summary.remaining_bytes
            ),
            json!({
                "removed": summary.removed,
                "freed_bytes": summary.freed_bytes,
                "remaining_bytes": summary.remaining_bytes,
            }),
        ),
        Err(err) => ExecutionOutcome::from_build_error(&err),
    }
}

fn cache_dir(root: &Path) -> PathBuf {
    root.join(RUN_DATA_DIR).join("blob-cache")
}
