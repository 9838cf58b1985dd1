use std::fs;
use std::path::{Component, Path, PathBuf};

use tracing::debug;
use walkdir::{DirEntry, WalkDir};

use crate::blob::BlobStore;
use crate::error::{BuildError, BuildResult, IoContext};
use crate::job::BuildJob;
use crate::oci::ImageLayer;

use super::{LayerWriter, DEFAULT_IGNORED, FUNC_MOUNT};

/// Archives the function source tree under `/func`.
pub fn write_data_layer(job: &BuildJob) -> BuildResult<ImageLayer> {
    let root = &job.function().root;
    let store = BlobStore::for_job(job);
    let mut layer = LayerWriter::new(&store, "datalayer", job.verbose())?;
    append_tree(&mut layer, root, root, FUNC_MOUNT, |entry| {
        entry
            .file_name()
            .to_str()
            .is_some_and(|name| DEFAULT_IGNORED.contains(&name))
    })?;
    layer.finish("function source")
}

/// Adds `dir` and everything below it to `layer` under `prefix`, in lexical
/// order. Entries for which `skip` is true are left out along with their
/// children. Symlinks must resolve inside `link_root`.
pub fn append_tree(
    layer: &mut LayerWriter,
    dir: &Path,
    link_root: &Path,
    prefix: &str,
    skip: impl Fn(&DirEntry) -> bool,
) -> BuildResult<()> {
    let walker = WalkDir::new(dir)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || !skip(entry));
    for entry in walker {
        let entry = entry.map_err(|err| {
            let path = err.path().unwrap_or(dir).to_path_buf();
            let source = err
                .into_io_error()
                .unwrap_or_else(|| std::io::Error::other("filesystem loop"));
            BuildError::io("failed to walk", path, source)
        })?;
        let rel = entry.path().strip_prefix(dir).unwrap_or(entry.path());
        let archive_path = archive_path(prefix, rel);
        let kind = entry.file_type();
        if kind.is_symlink() {
            let target = validated_link_target(link_root, entry.path())?;
            layer.append_symlink(&archive_path, entry.path(), &target)?;
        } else if kind.is_dir() {
            layer.append_dir(&archive_path, entry.path())?;
        } else if kind.is_file() {
            layer.append_file(&archive_path, entry.path(), None)?;
        } else {
            debug!(path = %entry.path().display(), "skipping special file");
        }
    }
    Ok(())
}

fn archive_path(prefix: &str, rel: &Path) -> String {
    let mut path = prefix.trim_end_matches('/').to_string();
    for component in rel.components() {
        if let Component::Normal(part) = component {
            path.push('/');
            path.push_str(&part.to_string_lossy());
        }
    }
    path
}

/// Returns the raw target of the link at `path`, refusing absolute targets
/// and targets that resolve outside `root`.
pub fn validated_link_target(root: &Path, path: &Path) -> BuildResult<PathBuf> {
    let target = fs::read_link(path).at("cannot read link", path)?;
    if target.has_root() || target.is_absolute() || looks_like_drive_path(&target) {
        return Err(BuildError::UnsafeLink {
            path: path.to_path_buf(),
            target: target.display().to_string(),
            reason: "project may not contain absolute links",
        });
    }
    // Relative roots (`.`) normalise to nothing, which every path starts with.
    let root = std::path::absolute(root).at("cannot resolve", root)?;
    let link = std::path::absolute(path).at("cannot resolve", path)?;
    let base = link.parent().unwrap_or(&root);
    let resolved = normalize_lexically(&base.join(&target));
    if !resolved.starts_with(normalize_lexically(&root)) {
        return Err(BuildError::UnsafeLink {
            path: path.to_path_buf(),
            target: target.display().to_string(),
            reason: "links must stay within project root",
        });
    }
    Ok(target)
}

// `c://some/path` parses as relative on unix hosts.
fn looks_like_drive_path(target: &Path) -> bool {
    let raw = target.to_string_lossy();
    let bytes = raw.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

fn normalize_lexically(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match normalized.components().next_back() {
                Some(Component::Normal(_)) => {
                    normalized.pop();
                }
                Some(Component::RootDir | Component::Prefix(_)) => {}
                _ => normalized.push(".."),
            },
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}
