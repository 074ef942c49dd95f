use crate::fsops;
use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::{
    fs,
    path::{Path, PathBuf},
    time::SystemTime,
};
use tracing::debug;

const DIGEST_LEN: usize = 10;
const BACKUP_EXT: &str = "bak";

/// Flat directory of pre-overwrite copies, named
/// `<basename>.<path digest>.bak[.N]`.
#[derive(Debug, Clone)]
pub struct BackupStore {
    root: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupEntry {
    pub path: PathBuf,
    pub basename: String,
    pub digest: String,
    pub modified: SystemTime,
    pub suffix: u32,
}

impl BackupStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Copies `target` into the store if it is an existing file.
    pub fn snapshot(&self, target: &Path) -> Result<Option<PathBuf>> {
        if !target.is_file() {
            return Ok(None);
        }
        let Some(basename) = target.file_name().map(|name| name.to_string_lossy().into_owned())
        else {
            return Ok(None);
        };
        fs::create_dir_all(&self.root).context("create backups dir")?;

        let stem = format!("{basename}.{}.{BACKUP_EXT}", path_digest(target));
        let mut dest = self.root.join(&stem);
        let mut suffix = 1;
        while dest.exists() {
            dest = self.root.join(format!("{stem}.{suffix}"));
            suffix += 1;
        }

        fs::copy(target, &dest)
            .with_context(|| format!("backup {} -> {}", target.display(), dest.display()))?;
        debug!(target = %target.display(), backup = %dest.display(), "backed up");
        Ok(Some(dest))
    }

    pub fn entries(&self) -> Result<Vec<BackupEntry>> {
        let mut entries = Vec::new();
        if !self.root.is_dir() {
            return Ok(entries);
        }
        for entry in fs::read_dir(&self.root).context("read backups dir")? {
            let entry = entry.context("read backup entry")?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some((basename, digest, suffix)) = parse_backup_name(&name) else {
                continue;
            };
            let meta = entry.metadata().context("stat backup")?;
            if !meta.is_file() {
                continue;
            }
            entries.push(BackupEntry {
                path: entry.path(),
                basename: basename.to_string(),
                digest: digest.to_string(),
                modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                suffix,
            });
        }
        entries.sort_by(|a, b| newest_first(a, b));
        Ok(entries)
    }

    /// Most recent backup taken of exactly `target`, by mtime then suffix.
    pub fn latest_for_target(&self, target: &Path) -> Result<Option<PathBuf>> {
        let Some(basename) = target.file_name().map(|name| name.to_string_lossy().into_owned())
        else {
            return Ok(None);
        };
        let digest = path_digest(target);
        Ok(self
            .entries()?
            .into_iter()
            .find(|entry| entry.basename == basename && entry.digest == digest)
            .map(|entry| entry.path))
    }

    /// Keeps the `keep` most recent backups. Returns how many were removed.
    pub fn prune(&self, keep: usize) -> usize {
        let entries = match self.entries() {
            Ok(entries) => entries,
            Err(err) => {
                debug!(error = %err, "skip backup pruning");
                return 0;
            }
        };
        fsops::best_effort(
            entries.into_iter().skip(keep).map(|entry| entry.path),
            |path| fs::remove_file(path),
        )
    }
}

/// First hex chars of the SHA-256 of the absolute path.
pub fn path_digest(path: &Path) -> String {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };
    let digest = Sha256::digest(absolute.to_string_lossy().as_bytes());
    let mut hex = format!("{digest:x}");
    hex.truncate(DIGEST_LEN);
    hex
}

fn parse_backup_name(name: &str) -> Option<(&str, &str, u32)> {
    let (rest, suffix) = match name.rsplit_once('.') {
        Some((rest, tail)) if tail != BACKUP_EXT => (rest, tail.parse::<u32>().ok()?),
        _ => (name, 0),
    };
    let rest = rest.strip_suffix(BACKUP_EXT)?.strip_suffix('.')?;
    let (basename, digest) = rest.rsplit_once('.')?;
    if basename.is_empty()
        || digest.len() != DIGEST_LEN
        || !digest.chars().all(|ch| ch.is_ascii_hexdigit())
    {
        return None;
    }
    Some((basename, digest, suffix))
}

fn newest_first(a: &BackupEntry, b: &BackupEntry) -> std::cmp::Ordering {
    b.modified
        .cmp(&a.modified)
        .then_with(|| b.suffix.cmp(&a.suffix))
        .then_with(|| b.path.cmp(&a.path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use filetime::{set_file_mtime, FileTime};
    use tempfile::TempDir;

    #[test]
    fn names_carry_digest_and_suffix() {
        let temp = TempDir::new().unwrap();
        let store = BackupStore::new(temp.path().join("backups"));
        let target = temp.path().join("live/ui-panel.bundle");
        fs::create_dir_all(target.parent().unwrap()).unwrap();
        fs::write(&target, "v1").unwrap();

        let first = store.snapshot(&target).unwrap().unwrap();
        let second = store.snapshot(&target).unwrap().unwrap();
        let digest = path_digest(&target);
        assert_eq!(
            first.file_name().unwrap().to_string_lossy(),
            format!("ui-panel.bundle.{digest}.bak")
        );
        assert_eq!(
            second.file_name().unwrap().to_string_lossy(),
            format!("ui-panel.bundle.{digest}.bak.1")
        );
    }

    #[test]
    fn missing_target_is_not_backed_up() {
        let temp = TempDir::new().unwrap();
        let store = BackupStore::new(temp.path());
        assert!(store.snapshot(&temp.path().join("nope")).unwrap().is_none());
    }

    #[test]
    fn digest_depends_on_full_path() {
        assert_ne!(
            path_digest(Path::new("/a/file.bundle")),
            path_digest(Path::new("/b/file.bundle"))
        );
        assert_eq!(path_digest(Path::new("/a/file.bundle")).len(), DIGEST_LEN);
    }

    #[test]
    fn parse_rejects_foreign_files() {
        assert_eq!(
            parse_backup_name("a.txt.0123456789.bak"),
            Some(("a.txt", "0123456789", 0))
        );
        assert_eq!(
            parse_backup_name("a.txt.0123456789.bak.3"),
            Some(("a.txt", "0123456789", 3))
        );
        assert_eq!(parse_backup_name("a.txt.bak"), None);
        assert_eq!(parse_backup_name("a.txt.zzzzzzzzzz.bak"), None);
        assert_eq!(parse_backup_name("notes.md"), None);
    }

    #[test]
    fn latest_uses_mtime_then_suffix() {
        let temp = TempDir::new().unwrap();
        let store = BackupStore::new(temp.path().join("backups"));
        let target = temp.path().join("live/a.txt");
        fs::create_dir_all(target.parent().unwrap()).unwrap();
        fs::write(&target, "x").unwrap();
        let digest = path_digest(&target);

        let root = temp.path().join("backups");
        fs::create_dir_all(&root).unwrap();
        let old = root.join(format!("a.txt.{digest}.bak"));
        let newer = root.join(format!("a.txt.{digest}.bak.1"));
        let tied = root.join(format!("a.txt.{digest}.bak.2"));
        for path in [&old, &newer, &tied] {
            fs::write(path, "x").unwrap();
        }
        set_file_mtime(&old, FileTime::from_unix_time(1_000, 0)).unwrap();
        set_file_mtime(&newer, FileTime::from_unix_time(2_000, 0)).unwrap();
        set_file_mtime(&tied, FileTime::from_unix_time(2_000, 0)).unwrap();

        assert_eq!(store.latest_for_target(&target).unwrap(), Some(tied));
        assert!(store
            .latest_for_target(&temp.path().join("live/b.txt"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn same_basename_elsewhere_is_not_a_match() {
        let temp = TempDir::new().unwrap();
        let store = BackupStore::new(temp.path().join("backups"));
        let kit_a = temp.path().join("kits/a/config.xml");
        let kit_b = temp.path().join("kits/b/config.xml");
        fs::create_dir_all(kit_a.parent().unwrap()).unwrap();
        fs::write(&kit_a, "original-a").unwrap();

        let backup = store.snapshot(&kit_a).unwrap().unwrap();
        assert_eq!(store.latest_for_target(&kit_a).unwrap(), Some(backup));
        assert!(store.latest_for_target(&kit_b).unwrap().is_none());
    }

    #[test]
    fn prune_keeps_most_recent() {
        let temp = TempDir::new().unwrap();
        let store = BackupStore::new(temp.path());
        for i in 0..5 {
            let path = temp.path().join(format!("f{i}.0123456789.bak"));
            fs::write(&path, "x").unwrap();
            set_file_mtime(&path, FileTime::from_unix_time(1_000 + i, 0)).unwrap();
        }
        fs::write(temp.path().join("readme.txt"), "keep me").unwrap();

        assert_eq!(store.prune(2), 3);
        let left: Vec<String> = store
            .entries()
            .unwrap()
            .into_iter()
            .map(|entry| entry.basename)
            .collect();
        assert_eq!(left, vec!["f4".to_string(), "f3".to_string()]);
        assert!(temp.path().join("readme.txt").exists());
    }
}
