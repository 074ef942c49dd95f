use anyhow::{Context, Result};
use std::{
    fs, io,
    path::{Component, Path, PathBuf},
};
use tracing::debug;
use walkdir::WalkDir;

pub fn is_ignored_path(path: &Path) -> bool {
    path.components().any(|component| {
        let part = component.as_os_str().to_string_lossy();
        part.eq_ignore_ascii_case("__MACOSX")
            || part.eq_ignore_ascii_case(".ds_store")
            || part.eq_ignore_ascii_case("thumbs.db")
            || part == ".git"
            || part == ".svn"
    })
}

/// Parses a manifest-relative path, refusing anything that could leave
/// the base directory (absolute paths, drive prefixes, `..`).
pub fn safe_relative(raw: &str) -> Option<PathBuf> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let mut out = PathBuf::new();
    for component in Path::new(raw).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    if out.as_os_str().is_empty() {
        None
    } else {
        Some(out)
    }
}

/// Forward-slash form of a relative path, used for manifest entries.
pub fn to_manifest_path(rel: &Path) -> String {
    rel.components()
        .map(|component| component.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// Relative paths of every regular file under `root`, sorted.
pub fn list_files(root: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    if !root.is_dir() {
        return Ok(files);
    }
    for entry in WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            entry
                .path()
                .strip_prefix(root)
                .map(|rel| !is_ignored_path(rel))
                .unwrap_or(true)
        })
    {
        let entry = entry.with_context(|| format!("walk {}", root.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry.path().strip_prefix(root).context("rel path")?;
        files.push(rel.to_path_buf());
    }
    Ok(files)
}

pub fn copy_file(source: &Path, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create dir {}", parent.display()))?;
    }
    fs::copy(source, dest)
        .with_context(|| format!("copy {} -> {}", source.display(), dest.display()))?;
    Ok(())
}

/// Copies a file or a whole tree to `dest`. Returns the number of files copied.
pub fn copy_tree(source: &Path, dest: &Path) -> Result<usize> {
    if source.is_file() {
        copy_file(source, dest)?;
        return Ok(1);
    }
    fs::create_dir_all(dest).with_context(|| format!("create dir {}", dest.display()))?;
    let files = list_files(source)?;
    for rel in &files {
        copy_file(&source.join(rel), &dest.join(rel))?;
    }
    Ok(files.len())
}

pub fn remove_path(path: &Path) -> io::Result<()> {
    let meta = fs::symlink_metadata(path)?;
    if meta.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

/// Runs `op` on every candidate, ignoring individual failures.
/// Returns how many succeeded.
pub fn best_effort<I, P, F>(candidates: I, mut op: F) -> usize
where
    I: IntoIterator<Item = P>,
    P: AsRef<Path>,
    F: FnMut(&Path) -> io::Result<()>,
{
    let mut done = 0;
    for candidate in candidates {
        let path = candidate.as_ref();
        match op(path) {
            Ok(()) => done += 1,
            Err(err) => debug!(path = %path.display(), error = %err, "best-effort step failed"),
        }
    }
    done
}

pub fn best_effort_remove<I, P>(candidates: I) -> usize
where
    I: IntoIterator<Item = P>,
    P: AsRef<Path>,
{
    best_effort(candidates, remove_path)
}

/// Removes empty directories under `root` deepest first. `root` itself is
/// removed too when `include_root` is set and it ends up empty.
pub fn remove_empty_dirs(root: &Path, include_root: bool) -> usize {
    if !root.is_dir() {
        return 0;
    }
    let dirs: Vec<PathBuf> = WalkDir::new(root)
        .follow_links(false)
        .contents_first(true)
        .min_depth(if include_root { 0 } else { 1 })
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_dir())
        .map(|entry| entry.into_path())
        .collect();
    best_effort(dirs, |dir| fs::remove_dir(dir))
}
