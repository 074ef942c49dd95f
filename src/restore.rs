use crate::{conflicts::ConflictIndex, error::DeployError, fsops, logging::LogSink};
use anyhow::{Context, Result};
use std::{
    collections::BTreeSet,
    fmt, fs, io,
    path::{Path, PathBuf},
};
use time::{macros::format_description, OffsetDateTime};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestorePoint {
    pub name: String,
    pub path: PathBuf,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RollbackReport {
    pub orphans_removed: usize,
    pub restored: usize,
    pub errors: usize,
}

impl fmt::Display for RollbackReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "restored={} orphans_removed={} errors={}",
            self.restored, self.orphans_removed, self.errors
        )
    }
}

pub fn timestamp_name(now: OffsetDateTime) -> String {
    let format = format_description!("[year][month][day]-[hour][minute][second]");
    now.format(format)
        .unwrap_or_else(|_| now.unix_timestamp().to_string())
}

/// Snapshots every index key that exists under `live_root` into a new
/// timestamp-named directory.
pub fn create(
    store_dir: &Path,
    live_root: &Path,
    index: &ConflictIndex,
    sink: &dyn LogSink,
) -> Result<RestorePoint> {
    fs::create_dir_all(store_dir).context("create restore points dir")?;
    let point = allocate(store_dir, &timestamp_name(OffsetDateTime::now_utc()))?;

    let copied = match snapshot_keys(&point.path, live_root, index) {
        Ok(copied) => copied,
        Err(err) => {
            fsops::best_effort_remove([&point.path]);
            return Err(err);
        }
    };

    sink.line(&format!(
        "Restore point created: {} ({copied} files)",
        point.name
    ));
    Ok(point)
}

fn snapshot_keys(dest: &Path, live_root: &Path, index: &ConflictIndex) -> Result<usize> {
    let mut copied = 0;
    for key in index.keys() {
        let Some(rel) = fsops::safe_relative(key) else {
            debug!(key = %key, "skip unsafe restore key");
            continue;
        };
        let live = live_root.join(&rel);
        if !live.exists() {
            continue;
        }
        copied += fsops::copy_tree(&live, &dest.join(&rel))
            .with_context(|| format!("snapshot {}", live.display()))?;
    }
    Ok(copied)
}

fn allocate(store_dir: &Path, stamp: &str) -> Result<RestorePoint> {
    let mut attempt = 0usize;
    loop {
        let name = if attempt == 0 {
            stamp.to_string()
        } else {
            format!("{stamp}-{attempt}")
        };
        let path = store_dir.join(&name);
        match fs::create_dir(&path) {
            Ok(()) => return Ok(RestorePoint { name, path }),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => attempt += 1,
            Err(err) => {
                return Err(err).with_context(|| format!("create restore point {}", path.display()))
            }
        }
    }
}

/// Restore points, newest first.
pub fn list(store_dir: &Path) -> Result<Vec<RestorePoint>> {
    let mut points = Vec::new();
    if !store_dir.is_dir() {
        return Ok(points);
    }
    for entry in fs::read_dir(store_dir).context("read restore points dir")? {
        let entry = entry.context("read restore point entry")?;
        if !entry.file_type().map(|kind| kind.is_dir()).unwrap_or(false) {
            continue;
        }
        points.push(RestorePoint {
            name: entry.file_name().to_string_lossy().into_owned(),
            path: entry.path(),
        });
    }
    points.sort_by(|a, b| b.name.cmp(&a.name));
    Ok(points)
}

pub fn find(store_dir: &Path, name: &str) -> Result<RestorePoint> {
    let valid = !name.is_empty()
        && fsops::safe_relative(name).is_some_and(|rel| rel.components().count() == 1);
    let path = store_dir.join(name);
    if !valid || !path.is_dir() {
        return Err(DeployError::RestorePointNotFound(name.to_string()).into());
    }
    Ok(RestorePoint {
        name: name.to_string(),
        path,
    })
}

/// Makes every managed path under `live_root` match the snapshot: live
/// files with no snapshot counterpart are deleted, then snapshot files are
/// copied back.
pub fn rollback(
    store_dir: &Path,
    name: &str,
    live_root: &Path,
    managed: &ConflictIndex,
    sink: &dyn LogSink,
) -> Result<RollbackReport> {
    let point = find(store_dir, name)?;
    let snapshot: BTreeSet<PathBuf> = fsops::list_files(&point.path)?.into_iter().collect();
    let mut report = RollbackReport::default();

    for key in managed.keys() {
        let Some(rel) = fsops::safe_relative(key) else {
            continue;
        };
        let live = live_root.join(&rel);
        if live.is_file() {
            if !snapshot.contains(&rel) {
                remove_orphan(&live, key, sink, &mut report);
            }
        } else if live.is_dir() {
            let before = report.orphans_removed;
            for file in fsops::list_files(&live)? {
                let full = rel.join(&file);
                if !snapshot.contains(&full) {
                    let label = fsops::to_manifest_path(&full);
                    remove_orphan(&live.join(&file), &label, sink, &mut report);
                }
            }
            if report.orphans_removed > before {
                fsops::remove_empty_dirs(&live, true);
            }
        }
    }

    for rel in &snapshot {
        let dest = live_root.join(rel);
        match fsops::copy_file(&point.path.join(rel), &dest) {
            Ok(()) => report.restored += 1,
            Err(err) => {
                warn!(path = %dest.display(), error = %err, "restore failed");
                let label = fsops::to_manifest_path(rel);
                sink.line(&format!("  [error/restore] {label} :: {err:#}"));
                report.errors += 1;
            }
        }
    }

    sink.line(&format!("Rolled back to restore point: {name} ({report})"));
    Ok(report)
}

fn remove_orphan(path: &Path, label: &str, sink: &dyn LogSink, report: &mut RollbackReport) {
    match fs::remove_file(path) {
        Ok(()) => {
            sink.line(&format!("  [orphan] removed {label}"));
            report.orphans_removed += 1;
        }
        Err(err) => {
            warn!(path = %path.display(), error = %err, "orphan removal failed");
            sink.line(&format!("  [error/orphan] {label} :: {err}"));
            report.errors += 1;
        }
    }
}

/// Keeps the `keep` newest restore points. Returns how many were removed.
pub fn prune(store_dir: &Path, keep: usize) -> usize {
    let points = match list(store_dir) {
        Ok(points) => points,
        Err(err) => {
            debug!(error = %err, "skip restore point pruning");
            return 0;
        }
    };
    fsops::best_effort(
        points.into_iter().skip(keep).map(|point| point.path),
        |path| fs::remove_dir_all(path),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::BufferedSink;
    use std::collections::BTreeMap;
    use tempfile::TempDir;
    use time::macros::datetime;

    fn index(keys: &[&str]) -> ConflictIndex {
        let mut index = BTreeMap::new();
        for key in keys {
            index.insert(key.to_string(), ["m".to_string()].into_iter().collect());
        }
        index
    }

    #[test]
    fn names_are_sortable_timestamps() {
        assert_eq!(timestamp_name(datetime!(2026-03-07 09:05:01 UTC)), "20260307-090501");
    }

    #[test]
    fn same_second_names_stay_unique() {
        let temp = TempDir::new().unwrap();
        let first = allocate(temp.path(), "20260101-000000").unwrap();
        let second = allocate(temp.path(), "20260101-000000").unwrap();
        assert_eq!(first.name, "20260101-000000");
        assert_eq!(second.name, "20260101-000000-1");
    }

    #[test]
    fn create_copies_existing_keys_only() {
        let temp = TempDir::new().unwrap();
        let live = temp.path().join("live");
        fs::create_dir_all(live.join("dir/sub")).unwrap();
        fs::write(live.join("a.bundle"), "a").unwrap();
        fs::write(live.join("dir/sub/x"), "x").unwrap();
        let store = temp.path().join("points");

        let sink = BufferedSink::new();
        let managed = index(&["a.bundle", "dir", "missing"]);
        let point = create(&store, &live, &managed, &sink).unwrap();
        assert_eq!(fs::read_to_string(point.path.join("a.bundle")).unwrap(), "a");
        assert_eq!(fs::read_to_string(point.path.join("dir/sub/x")).unwrap(), "x");
        assert!(!point.path.join("missing").exists());
        assert!(sink.contains("(2 files)"));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn failed_snapshot_leaves_no_restore_point() {
        // The live tree fits in PATH_MAX; its copy under the longer store path does not.
        let temp = TempDir::new().unwrap();
        let live = temp.path().join("l");
        let base = live.as_os_str().len();
        let segment = "d".repeat(200);
        let mut deep = live.clone();
        let mut len = base;
        while 3950 - len > 255 {
            deep.push(&segment);
            len += 201;
        }
        let file_len = 3950 - len - 1;
        fs::create_dir_all(&deep).unwrap();
        fs::write(deep.join("f".repeat(file_len)), "x").unwrap();

        let store = temp.path().join("s".repeat(250));
        let sink = BufferedSink::new();
        assert!(create(&store, &live, &index(&[segment.as_str()]), &sink).is_err());
        assert!(list(&store).unwrap().is_empty());
    }

    #[test]
    fn list_is_descending_and_prune_keeps_newest() {
        let temp = TempDir::new().unwrap();
        for name in ["20260101-000000", "20260301-000000", "20260201-000000"] {
            fs::create_dir_all(temp.path().join(name)).unwrap();
        }
        fs::write(temp.path().join("stray.txt"), "x").unwrap();

        let names: Vec<String> = list(temp.path())
            .unwrap()
            .into_iter()
            .map(|point| point.name)
            .collect();
        assert_eq!(names, ["20260301-000000", "20260201-000000", "20260101-000000"]);

        assert_eq!(prune(temp.path(), 1), 2);
        assert_eq!(list(temp.path()).unwrap().len(), 1);
        assert!(temp.path().join("20260301-000000").exists());
    }

    #[test]
    fn unknown_or_unsafe_names_are_not_found() {
        let temp = TempDir::new().unwrap();
        for name in ["nope", "../x", ""] {
            let err = find(temp.path(), name).unwrap_err();
            assert!(matches!(
                err.downcast_ref::<DeployError>(),
                Some(DeployError::RestorePointNotFound(_))
            ));
        }
    }

    #[test]
    fn rollback_restores_and_removes_orphans() {
        let temp = TempDir::new().unwrap();
        let live = temp.path().join("live");
        fs::create_dir_all(live.join("pack")).unwrap();
        fs::write(live.join("a.bundle"), "original").unwrap();
        fs::write(live.join("pack/old.png"), "old").unwrap();
        let store = temp.path().join("points");
        let managed = index(&["a.bundle", "b.bundle", "pack"]);
        let sink = BufferedSink::new();

        let point = create(&store, &live, &managed, &sink).unwrap();

        fs::write(live.join("a.bundle"), "modded").unwrap();
        fs::write(live.join("b.bundle"), "new").unwrap();
        fs::create_dir_all(live.join("pack/extra")).unwrap();
        fs::write(live.join("pack/extra/new.png"), "new").unwrap();
        fs::write(live.join("unmanaged.txt"), "keep").unwrap();

        let report = rollback(&store, &point.name, &live, &managed, &sink).unwrap();
        assert_eq!(report.orphans_removed, 2);
        assert_eq!(report.restored, 2);
        assert_eq!(fs::read_to_string(live.join("a.bundle")).unwrap(), "original");
        assert!(!live.join("b.bundle").exists());
        assert!(!live.join("pack/extra").exists());
        assert_eq!(fs::read_to_string(live.join("pack/old.png")).unwrap(), "old");
        assert!(live.join("unmanaged.txt").exists());
    }
}
