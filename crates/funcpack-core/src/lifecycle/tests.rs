use std::fs;
use std::os::unix::fs::symlink;
use std::process::{Child, Command};
use std::sync::Arc;

use anyhow::Result;

use super::*;
use crate::testing::{fixture_function, stub_job, StubBuilder};

fn job(root: &Path) -> Result<BuildJob> {
    let function = fixture_function(root, "go")?;
    stub_job(&function, &[], Arc::new(StubBuilder::default()))
}

struct Sleeper(Child);

impl Sleeper {
    fn spawn() -> Result<Self> {
        Ok(Self(Command::new("sleep").arg("30").spawn()?))
    }

    fn pid(&self) -> String {
        self.0.id().to_string()
    }
}

impl Drop for Sleeper {
    fn drop(&mut self) {
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

fn dead_pid() -> Result<String> {
    let mut child = Command::new("true").spawn()?;
    let pid = child.id().to_string();
    child.wait()?;
    Ok(pid)
}

fn claim(job: &BuildJob, pid: &str) -> Result<PathBuf> {
    fs::create_dir_all(job.pids_dir())?;
    let link = job.pids_dir().join(pid);
    symlink(Path::new("..").join("by-hash").join(job.fingerprint()), &link)?;
    Ok(link)
}

#[test]
fn setup_claims_and_prepares_the_build_dir() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let job = job(temp.path())?;
    setup(&job)?;

    assert!(job.build_dir().is_dir());
    assert!(job.blobs_dir().is_dir());
    assert!(job.cache_dir().is_dir());
    assert_eq!(
        fs::read_link(job.pid_link())?,
        Path::new("..").join("by-hash").join(job.fingerprint())
    );
    assert!(is_link_to(&job.pid_link(), &job.build_dir()));
    Ok(())
}

#[test]
fn live_rival_makes_setup_fail_fast() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let job = job(temp.path())?;
    let rival = Sleeper::spawn()?;
    claim(&job, &rival.pid())?;

    let err = setup(&job).unwrap_err();
    assert!(err.is_in_progress());
    assert_eq!(err.code(), "FP101");
    assert!(job.pid_link().symlink_metadata().is_err(), "no claim left behind");
    assert!(!job.build_dir().exists(), "rival's tree untouched");
    Ok(())
}

#[test]
fn stale_build_from_a_dead_process_is_reclaimed() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let job = job(temp.path())?;
    let stale = claim(&job, &dead_pid()?)?;
    fs::create_dir_all(job.build_dir())?;
    fs::write(job.build_dir().join("partial.tmp"), "half")?;

    setup(&job)?;
    assert!(!job.build_dir().join("partial.tmp").exists());
    assert!(job.blobs_dir().is_dir());

    teardown(&job);
    assert!(stale.symlink_metadata().is_err());
    Ok(())
}

#[test]
fn teardown_releases_the_claim_and_leaves_unfinished_builds_for_later() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let job = job(temp.path())?;
    setup(&job)?;
    teardown(&job);

    assert!(job.pid_link().symlink_metadata().is_err());
    assert!(last_build_dir(temp.path()).is_err());

    // The unfinished tree goes on the next pass, once nothing claims it.
    assert!(job.build_dir().is_dir());
    let report = collect_garbage(temp.path());
    assert_eq!(report.stale_builds, vec![job.build_dir()]);
    assert!(!job.build_dir().exists());
    Ok(())
}

#[test]
fn finalized_build_survives_teardown() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let job = job(temp.path())?;
    setup(&job)?;
    finalize_last(&job)?;
    teardown(&job);

    assert_eq!(fs::read_link(job.last_link())?, Path::new("by-hash").join(job.fingerprint()));
    assert_eq!(last_build_dir(temp.path())?, fs::canonicalize(job.build_dir())?);

    // A rebuild of the same fingerprint in this process succeeds.
    setup(&job)?;
    finalize_last(&job)?;
    teardown(&job);
    assert!(job.build_dir().is_dir());
    Ok(())
}

#[test]
fn rebuilding_the_last_fingerprint_parks_the_completed_tree() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let job = job(temp.path())?;
    setup(&job)?;
    fs::create_dir_all(job.oci_dir())?;
    fs::write(job.oci_dir().join("index.json"), "{}\n")?;
    finalize_last(&job)?;
    teardown(&job);

    // A rebuild that never reaches finalize_last.
    setup(&job)?;
    assert_eq!(last_build_dir(temp.path())?, fs::canonicalize(job.preserved_dir())?);
    assert!(!job.oci_dir().join("index.json").exists(), "rebuild starts empty");
    teardown(&job);
    collect_garbage(temp.path());

    let last = last_build_dir(temp.path())?;
    assert!(last.join("oci/index.json").is_file());
    assert!(!job.build_dir().exists(), "half-built tree collected");

    // The next successful build takes `last` back and the parked tree goes.
    setup(&job)?;
    finalize_last(&job)?;
    teardown(&job);
    assert_eq!(fs::read_link(job.last_link())?, Path::new("by-hash").join(job.fingerprint()));
    assert!(!job.preserved_dir().exists());
    Ok(())
}

#[test]
fn repeated_collection_converges_on_the_last_build() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let job = job(temp.path())?;
    let by_hash = job.builds_dir();
    fs::create_dir_all(by_hash.join("abandoned"))?;
    fs::create_dir_all(job.pids_dir())?;
    symlink(Path::new("..").join("by-hash").join("abandoned"), job.pids_dir().join(dead_pid()?))?;

    setup(&job)?;
    finalize_last(&job)?;
    teardown(&job);
    for _ in 0..3 {
        collect_garbage(temp.path());
    }

    let remaining = fs::read_dir(&by_hash)?
        .map(|entry| entry.map(|entry| entry.file_name()))
        .collect::<Result<Vec<_>, _>>()?;
    assert_eq!(remaining, vec![std::ffi::OsString::from(job.fingerprint())]);
    assert_eq!(fs::read_dir(job.pids_dir())?.count(), 0);
    assert_eq!(last_build_dir(temp.path())?, fs::canonicalize(job.build_dir())?);
    Ok(())
}

#[test]
fn garbage_collection_spares_live_claims_and_last() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let root = builds_root(temp.path());
    let by_hash = root.join("by-hash");
    let by_pid = root.join("by-pid");
    for name in ["kept", "active", "stale"] {
        fs::create_dir_all(by_hash.join(name))?;
    }
    fs::create_dir_all(&by_pid)?;
    symlink(Path::new("by-hash").join("kept"), root.join("last"))?;
    let live = Sleeper::spawn()?;
    symlink(Path::new("..").join("by-hash").join("active"), by_pid.join(live.pid()))?;
    let dead = dead_pid()?;
    symlink(Path::new("..").join("by-hash").join("stale"), by_pid.join(&dead))?;

    let report = collect_garbage(temp.path());
    assert_eq!(report.orphaned_claims, vec![by_pid.join(&dead)]);
    assert_eq!(report.stale_builds, vec![by_hash.join("stale")]);
    assert!(by_hash.join("kept").is_dir());
    assert!(by_hash.join("active").is_dir());
    assert!(by_pid.join(live.pid()).symlink_metadata().is_ok());
    Ok(())
}

#[test]
fn collect_garbage_on_a_fresh_root_is_a_no_op() -> Result<()> {
    let temp = tempfile::tempdir()?;
    assert_eq!(collect_garbage(temp.path()), GarbageReport::default());
    Ok(())
}

#[test]
fn process_probe() -> Result<()> {
    assert!(process_exists(&std::process::id().to_string()));
    assert!(!process_exists(&dead_pid()?));
    assert!(!process_exists("0"));
    assert!(!process_exists("-1"));
    assert!(!process_exists("not-a-pid"));
    Ok(())
}

#[test]
fn link_identity_resolves_relative_targets() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let target = temp.path().join("a/b");
    fs::create_dir_all(&target)?;
    fs::create_dir_all(temp.path().join("links"))?;
    let link = temp.path().join("links/one");
    symlink(Path::new("../a/b"), &link)?;

    assert!(is_link_to(&link, &target));
    assert!(!is_link_to(&link, &temp.path().join("a")));
    assert!(!is_link_to(&temp.path().join("links/missing"), &target));
    Ok(())
}
