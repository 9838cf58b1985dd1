use std::fs;
use std::os::unix::fs::symlink;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use filetime::{set_file_mtime, FileTime};
use funcpack_domain::Platform;
use tempfile::tempdir;

use super::*;
use crate::error::BuildError;
use crate::lifecycle;
use crate::testing::{fixture_function, read_layer, stub_job, StubBuilder, TEST_CA};

fn prepared_job(root: &Path) -> Result<crate::job::BuildJob> {
    let function = fixture_function(root, "go")?;
    let job = stub_job(
        &function,
        &[Platform::new("linux", "amd64")],
        Arc::new(StubBuilder::default()),
    )?;
    lifecycle::setup(&job)?;
    Ok(job)
}

#[test]
fn data_layer_archives_source_under_func() -> Result<()> {
    let temp = tempdir()?;
    let root = temp.path();
    fs::create_dir_all(root.join(".git"))?;
    fs::write(root.join(".git/HEAD"), "ref: refs/heads/main\n")?;
    fs::write(root.join(".gitignore"), "target\n")?;
    fs::write(root.join(".funcignore"), "*.log\n")?;
    symlink("a.txt", root.join("a.lnk"))?;
    let job = prepared_job(root)?;

    let layer = write_data_layer(&job)?;
    let entries = read_layer(&job.blobs_dir().join(layer.descriptor.hex()))?;
    let paths = entries.iter().map(|entry| entry.path.as_str()).collect::<Vec<_>>();
    assert_eq!(
        paths,
        vec!["func", "func/a.lnk", "func/a.txt", "func/b", "func/b/c.txt", "func/run.sh"]
    );
    assert!(entries.iter().all(|entry| entry.uid == 1000 && entry.gid == 1000));

    let by_path = |path: &str| entries.iter().find(|entry| entry.path == path).cloned();
    let text = by_path("func/a.txt").expect("a.txt");
    assert_eq!(text.contents, b"alpha\n");
    assert_eq!(text.mode & 0o777, 0o644);
    assert_eq!(by_path("func/run.sh").expect("run.sh").mode & 0o777, 0o755);
    assert_eq!(
        by_path("func/a.lnk").expect("link").link.as_deref(),
        Some(Path::new("a.txt"))
    );
    assert_eq!(layer.descriptor.media_type, crate::oci::MEDIA_TYPE_LAYER_GZIP);
    assert!(layer.diff_id.starts_with("sha256:"));
    assert_ne!(layer.diff_id, layer.descriptor.digest);
    Ok(())
}

#[test]
fn data_layer_is_reproducible_across_mtimes() -> Result<()> {
    let temp = tempdir()?;
    let job = prepared_job(temp.path())?;
    let first = write_data_layer(&job)?;

    set_file_mtime(temp.path().join("a.txt"), FileTime::from_unix_time(42, 0))?;
    let second = write_data_layer(&job)?;

    assert_eq!(first, second);
    Ok(())
}

#[test]
fn data_layer_rejects_absolute_links() -> Result<()> {
    let temp = tempdir()?;
    symlink("/var/example/absolute/link", temp.path().join("absoluteLink"))?;
    let job = prepared_job(temp.path())?;

    let err = write_data_layer(&job).unwrap_err();
    match err {
        BuildError::UnsafeLink { reason, target, .. } => {
            assert_eq!(reason, "project may not contain absolute links");
            assert_eq!(target, "/var/example/absolute/link");
        }
        other => panic!("unexpected error {other:?}"),
    }
    Ok(())
}

#[test]
fn link_targets_must_stay_inside_the_root() -> Result<()> {
    let temp = tempdir()?;
    let root = temp.path().join("test-links");
    fs::create_dir_all(root.join("b/c"))?;
    fs::write(root.join("a.txt"), "a")?;
    fs::write(root.join("...validName"), "dots")?;
    symlink("/var/example/absolute/link", root.join("absoluteLink"))?;
    symlink("c://some/absolute/path", root.join("absoluteLinkWindows"))?;
    symlink("./a.txt", root.join("a.lnk"))?;
    symlink("...validName", root.join("...validName.lnk"))?;
    symlink(".", root.join("linkToRoot"))?;
    symlink("..", root.join("b/linkToRoot"))?;
    symlink(".", root.join("b/linkToCurrentDir"))?;
    symlink("../..", root.join("b/linkToRootsParent"))?;
    symlink("../../otherProject", root.join("b/linkOutsideRootsParent"))?;
    symlink("..", root.join("b/c/linkToParent"))?;

    let cases = [
        ("absoluteLink", false),
        ("absoluteLinkWindows", false),
        ("a.lnk", true),
        ("...validName.lnk", true),
        ("linkToRoot", true),
        ("b/linkToRoot", true),
        ("b/linkToCurrentDir", true),
        ("b/linkToRootsParent", false),
        ("b/linkOutsideRootsParent", false),
        ("b/c/linkToParent", true),
    ];
    for (path, valid) in cases {
        let result = validated_link_target(&root, &root.join(path));
        assert_eq!(result.is_ok(), valid, "{path}: {result:?}");
    }
    assert_eq!(
        validated_link_target(&root, &root.join("a.lnk"))?,
        Path::new("./a.txt")
    );
    Ok(())
}

struct CurrentDirGuard(std::path::PathBuf);

impl CurrentDirGuard {
    fn enter(dir: &Path) -> Result<Self> {
        let previous = std::env::current_dir()?;
        std::env::set_current_dir(dir)?;
        Ok(Self(previous))
    }
}

impl Drop for CurrentDirGuard {
    fn drop(&mut self) {
        let _ = std::env::set_current_dir(&self.0);
    }
}

#[test]
#[serial_test::serial]
fn relative_roots_still_confine_links() -> Result<()> {
    let temp = tempdir()?;
    let root = temp.path().join("proj");
    fs::create_dir_all(root.join("b"))?;
    fs::write(root.join("a.txt"), "a")?;
    symlink("../../../../etc/passwd", root.join("escape"))?;
    symlink("../a.txt", root.join("b/up"))?;
    symlink("../..", root.join("b/outside"))?;

    let _cwd = CurrentDirGuard::enter(&root)?;
    let relative = Path::new(".");
    let err = validated_link_target(relative, Path::new("./escape")).unwrap_err();
    assert_eq!(err.code(), "FP103");
    assert!(validated_link_target(relative, Path::new("b/outside")).is_err());
    assert_eq!(validated_link_target(relative, Path::new("b/up"))?, Path::new("../a.txt"));
    Ok(())
}

#[test]
fn certs_layer_places_bundle_in_both_locations() -> Result<()> {
    let temp = tempdir()?;
    let job = prepared_job(temp.path())?;

    let layer = write_certs_layer(&job)?;
    let entries = read_layer(&job.blobs_dir().join(layer.descriptor.hex()))?;
    let paths = entries.iter().map(|entry| entry.path.as_str()).collect::<Vec<_>>();
    assert_eq!(paths, CERT_PATHS.to_vec());
    for entry in entries {
        assert_eq!(entry.contents, TEST_CA.as_bytes());
        assert_eq!((entry.uid, entry.gid), (1000, 1000));
    }
    Ok(())
}

#[test]
fn certs_layer_requires_a_bundle() -> Result<()> {
    let temp = tempdir()?;
    let function = fixture_function(temp.path(), "go")?;
    let mut config = crate::testing::test_config(temp.path())?;
    config.ca_bundle = Some(temp.path().join("missing.pem"));
    let job = crate::job::BuildJob::new(
        crate::cancel::CancelToken::new(),
        &function,
        &[],
        false,
        config,
        Some(Arc::new(StubBuilder::default())),
    )?;
    lifecycle::setup(&job)?;

    let err = write_certs_layer(&job).unwrap_err();
    assert_eq!(err.code(), "FP110");
    assert!(err.to_string().contains("missing.pem"), "{err}");
    Ok(())
}
