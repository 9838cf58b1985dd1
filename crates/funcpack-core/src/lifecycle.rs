//! On-disk bookkeeping for builds: the `by-pid` claim markers, stale
//! `by-hash` reclamation, and the `last` pointer.
//!
//! A build holds its `by-hash/<fingerprint>` directory for as long as a
//! `by-pid/<pid>` link to it exists *and* that process is alive. There is no
//! unlock step; a dead process's link is garbage collected by whichever
//! build runs teardown next.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::base::cache::BlobCache;
use crate::error::{BuildError, BuildResult, IoContext};
use crate::job::{builds_root, BuildJob};

/// Claims the job's build directory and prepares an empty working tree.
pub(crate) fn setup(job: &BuildJob) -> BuildResult<()> {
    let build_dir = job.build_dir();
    if live_claimants(&job.pids_dir(), &build_dir, job.fingerprint(), None).next().is_some() {
        return Err(BuildError::InProgress { dir: build_dir });
    }

    let pids_dir = job.pids_dir();
    if !pids_dir.is_dir() {
        job.step(format_args!("mkdir -p {}", pids_dir.display()));
        fs::create_dir_all(&pids_dir).at("failed to create", &pids_dir)?;
    }
    let pid_link = job.pid_link();
    if pid_link.symlink_metadata().is_ok() {
        // Dangling leftover from an earlier build in this process.
        remove_link(&pid_link).at("failed to remove", &pid_link)?;
    }
    let target = Path::new("..").join("by-hash").join(job.fingerprint());
    job.step(format_args!("ln -s {} {}", target.display(), pid_link.display()));
    symlink_dir(&target, &pid_link).at("failed to create", &pid_link)?;

    // Two builders can pass the first check together; whoever still sees a
    // rival after publishing its own link backs off before touching the tree.
    let own_name = job.pid().to_string();
    if live_claimants(&pids_dir, &build_dir, job.fingerprint(), Some(&own_name))
        .next()
        .is_some()
    {
        let _ = remove_link(&pid_link);
        return Err(BuildError::InProgress { dir: build_dir });
    }

    if build_dir.symlink_metadata().is_ok() {
        if is_link_to(&job.last_link(), &build_dir) {
            preserve_last(job)?;
        } else {
            job.step(format_args!("rm -rf {}", build_dir.display()));
            fs::remove_dir_all(&build_dir).at("failed to remove stale", &build_dir)?;
        }
    }
    job.step(format_args!("mkdir -p {}", build_dir.display()));
    fs::create_dir_all(&build_dir).at("failed to create", &build_dir)?;
    let blobs = job.blobs_dir();
    fs::create_dir_all(&blobs).at("failed to create", &blobs)?;
    let cache = job.cache_dir();
    fs::create_dir_all(&cache).at("failed to create", &cache)?;
    Ok(())
}

/// Best-effort garbage collection run after every build, successful or not.
pub(crate) fn teardown(job: &BuildJob) {
    collect_garbage(&job.function().root);

    if let Some(limit) = job.config().cache_limit() {
        let cache = BlobCache::new(job.cache_dir());
        if let Err(err) = cache.prune(limit) {
            warn!(error = %err, "blob cache eviction failed");
        }
    }

    // Release this process's claim last so the passes above still see our
    // own directory as active and leave a failed build's output for the
    // next run to reclaim.
    let pid_link = job.pid_link();
    if is_link_to(&pid_link, &job.build_dir()) || points_at(&pid_link, job.fingerprint()) {
        job.step(format_args!("rm {}", pid_link.display()));
        if let Err(err) = remove_link(&pid_link) {
            warn!(path = %pid_link.display(), error = %err, "failed to release build claim");
        }
    }
}

/// Runs both reclamation passes for the function rooted at `function_root`:
/// orphaned `by-pid` links, then `by-hash` directories that are neither the
/// `last` build nor claimed by a live process. Failures are logged and skipped.
pub fn collect_garbage(function_root: &Path) -> GarbageReport {
    let root = builds_root(function_root);
    let pids_dir = root.join("by-pid");
    let builds_dir = root.join("by-hash");
    let last_link = root.join("last");
    let mut report = GarbageReport::default();

    for entry in read_dir_lossy(&pids_dir) {
        let name = entry.file_name().to_string_lossy().to_string();
        if process_exists(&name) {
            continue;
        }
        let path = entry.path();
        debug!(path = %path.display(), "removing orphaned build claim");
        match remove_link(&path) {
            Ok(()) => report.orphaned_claims.push(path),
            Err(err) => warn!(path = %path.display(), error = %err, "failed to remove build claim"),
        }
    }

    for entry in read_dir_lossy(&builds_dir) {
        let dir = entry.path();
        if is_link_to(&last_link, &dir) {
            continue;
        }
        let fingerprint = entry.file_name().to_string_lossy().to_string();
        if live_claimants(&pids_dir, &dir, &fingerprint, None).next().is_some() {
            continue;
        }
        debug!(path = %dir.display(), "removing stale build directory");
        let removed = if entry.file_type().is_ok_and(|kind| kind.is_dir()) {
            fs::remove_dir_all(&dir)
        } else {
            fs::remove_file(&dir)
        };
        match removed {
            Ok(()) => report.stale_builds.push(dir),
            Err(err) => warn!(path = %dir.display(), error = %err, "failed to remove build directory"),
        }
    }
    report
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct GarbageReport {
    pub orphaned_claims: Vec<PathBuf>,
    pub stale_builds: Vec<PathBuf>,
}

/// Points `builds/last` at the job's directory.
pub(crate) fn finalize_last(job: &BuildJob) -> BuildResult<()> {
    point_last(job, job.fingerprint())
}

// A rebuild of the fingerprint `last` points at must not wipe that tree
// before the new one is complete. The old tree moves aside and `last`
// follows it; the next successful build re-points `last` and the parked
// tree is collected like any other unreferenced build.
fn preserve_last(job: &BuildJob) -> BuildResult<()> {
    let build_dir = job.build_dir();
    let parked = job.preserved_dir();
    if parked.symlink_metadata().is_ok() {
        job.step(format_args!("rm -rf {}", parked.display()));
        fs::remove_dir_all(&parked).at("failed to remove stale", &parked)?;
    }
    job.step(format_args!("mv {} {}", build_dir.display(), parked.display()));
    fs::rename(&build_dir, &parked).at("failed to move aside", &build_dir)?;
    let name = format!("{}.previous", job.fingerprint());
    point_last(job, &name)
}

fn point_last(job: &BuildJob, entry: &str) -> BuildResult<()> {
    let last = job.last_link();
    if last.symlink_metadata().is_ok() {
        remove_link(&last).at("failed to remove", &last)?;
    }
    let target = Path::new("by-hash").join(entry);
    job.step(format_args!("ln -s {} {}", target.display(), last.display()));
    symlink_dir(&target, &last).at("failed to create", &last)
}

/// Resolves the directory of the most recent successful build, which is
/// what a pusher uploads from.
pub fn last_build_dir(function_root: &Path) -> BuildResult<PathBuf> {
    let last = builds_root(function_root).join("last");
    let resolved = fs::canonicalize(&last).at("no completed build at", &last)?;
    if !resolved.is_dir() {
        return Err(BuildError::io(
            "last build is not a directory",
            &resolved,
            io::Error::from(io::ErrorKind::NotFound),
        ));
    }
    Ok(resolved)
}

/// Zero-signal existence probe. A process we may not signal still exists.
#[cfg(unix)]
pub fn process_exists(pid: &str) -> bool {
    use rustix::io::Errno;
    use rustix::process::{test_kill_process, Pid};

    let Some(pid) = pid
        .parse::<i32>()
        .ok()
        .filter(|raw| *raw > 0)
        .and_then(Pid::from_raw)
    else {
        return false;
    };
    match test_kill_process(pid) {
        Ok(()) | Err(Errno::PERM) => true,
        Err(_) => false,
    }
}

/// Without a signal probe every well-formed pid is assumed live.
#[cfg(not(unix))]
pub fn process_exists(pid: &str) -> bool {
    pid.parse::<u32>().is_ok_and(|raw| raw > 0)
}

/// True when `link` and `target` resolve to the same absolute location.
pub fn is_link_to(link: &Path, target: &Path) -> bool {
    match (fs::canonicalize(link), fs::canonicalize(target)) {
        (Ok(link), Ok(target)) => link == target,
        _ => false,
    }
}

// Textual match for claims whose directory does not exist yet.
fn points_at(link: &Path, fingerprint: &str) -> bool {
    fs::read_link(link).is_ok_and(|raw| raw == Path::new("..").join("by-hash").join(fingerprint))
}

fn live_claimants<'a>(
    pids_dir: &Path,
    build_dir: &'a Path,
    fingerprint: &'a str,
    skip: Option<&'a str>,
) -> impl Iterator<Item = PathBuf> + 'a {
    read_dir_lossy(pids_dir).into_iter().filter_map(move |entry| {
        let name = entry.file_name().to_string_lossy().to_string();
        if skip == Some(name.as_str()) || !process_exists(&name) {
            return None;
        }
        let link = entry.path();
        (is_link_to(&link, build_dir) || points_at(&link, fingerprint)).then_some(link)
    })
}

fn read_dir_lossy(dir: &Path) -> Vec<fs::DirEntry> {
    let mut entries = fs::read_dir(dir)
        .map(|iter| iter.filter_map(Result::ok).collect::<Vec<_>>())
        .unwrap_or_default();
    entries.sort_by_key(fs::DirEntry::file_name);
    entries
}

#[cfg(unix)]
fn symlink_dir(target: &Path, link: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn symlink_dir(target: &Path, link: &Path) -> io::Result<()> {
    std::os::windows::fs::symlink_dir(target, link)
}

#[cfg(unix)]
fn remove_link(link: &Path) -> io::Result<()> {
    fs::remove_file(link)
}

#[cfg(windows)]
fn remove_link(link: &Path) -> io::Result<()> {
    fs::remove_dir(link).or_else(|_| fs::remove_file(link))
}

#[cfg(all(test, unix))]
mod tests;
