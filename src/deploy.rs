use crate::{
    backup::BackupStore,
    config::{self, EngineConfig, Targets},
    error::{self, DeployError},
    fsops,
    game::Platform,
    logging::LogSink,
    manifest::{self, FileEntry, Manifest},
    router,
};
use anyhow::{Context, Result};
use serde::Serialize;
use std::{
    fmt, fs,
    path::{Path, PathBuf},
};
use tracing::{debug, warn};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EnableReport {
    pub wrote: usize,
    pub skipped: usize,
    pub backed_up: usize,
    pub errors: usize,
}

impl EnableReport {
    pub fn absorb(&mut self, other: &EnableReport) {
        self.wrote += other.wrote;
        self.skipped += other.skipped;
        self.backed_up += other.backed_up;
        self.errors += other.errors;
    }
}

impl fmt::Display for EnableReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "wrote={} backup={} skipped={} errors={}",
            self.wrote, self.backed_up, self.skipped, self.errors
        )
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DisableReport {
    pub removed: usize,
    pub restored: usize,
    pub no_backup: usize,
    pub not_present: usize,
    pub errors: usize,
}

impl fmt::Display for DisableReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "removed={} restored={} no_backup={} absent={} errors={}",
            self.removed, self.restored, self.no_backup, self.not_present, self.errors
        )
    }
}

/// A mod from the store with its manifest already loaded.
#[derive(Debug, Clone)]
pub struct StoredMod {
    pub dir: PathBuf,
    pub manifest: Manifest,
}

pub fn load_stored(config: &EngineConfig, name: &str) -> Result<StoredMod> {
    let dir = config.layout.mod_dir(name);
    if name.trim().is_empty() || !dir.is_dir() {
        return Err(DeployError::ModNotFound(name.to_string()).into());
    }
    let manifest = manifest::load(&dir)?;
    Ok(StoredMod { dir, manifest })
}

pub fn install_root(manifest: &Manifest, targets: &Targets) -> Result<PathBuf> {
    router::resolve(
        manifest.kind(),
        &manifest.name,
        manifest.install_path(),
        targets,
    )
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedFile {
    pub target_subpath: String,
    pub resolved_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstallPreview {
    pub root: PathBuf,
    pub files: Vec<ResolvedFile>,
}

/// Where each entry for `platform` would be written. Touches nothing on disk.
pub fn preview_install(
    config: &EngineConfig,
    name: &str,
    platform: Platform,
) -> Result<InstallPreview> {
    let stored = load_stored(config, name)?;
    let root = install_root(&stored.manifest, &config.targets)?;
    let files = stored
        .manifest
        .files
        .iter()
        .filter(|entry| entry.applies_to(platform))
        .filter_map(|entry| {
            let rel = fsops::safe_relative(entry.target()?)?;
            Some(ResolvedFile {
                target_subpath: fsops::to_manifest_path(&rel),
                resolved_path: root.join(rel),
            })
        })
        .collect();
    Ok(InstallPreview { root, files })
}

/// Creates a missing root, but only inside the user-data dir.
fn prepare_root(root: &Path, targets: &Targets) -> Result<()> {
    if root.is_dir() {
        return Ok(());
    }
    if config::is_under(root, &targets.user_dir) {
        fs::create_dir_all(root).with_context(|| format!("create {}", root.display()))?;
        return Ok(());
    }
    Err(DeployError::TargetRootMissing(root.to_path_buf()).into())
}

pub fn enable_mod(
    config: &EngineConfig,
    name: &str,
    platform: Platform,
    sink: &dyn LogSink,
) -> Result<EnableReport> {
    let stored = load_stored(config, name)?;
    let manifest = &stored.manifest;
    if manifest.files.is_empty() {
        return Err(DeployError::EmptyFileList(name.to_string()).into());
    }
    let root = install_root(manifest, &config.targets)?;
    prepare_root(&root, &config.targets)?;

    sink.line(&format!(
        "[enable] {} ({}) -> {}",
        manifest.name,
        manifest.kind(),
        root.display()
    ));
    sink.line(&format!(
        "  [context] platform={platform} files={}",
        manifest.files.len()
    ));

    let mut writer = Writer {
        backups: BackupStore::new(&config.layout.backups_dir),
        sink,
        report: EnableReport::default(),
    };
    for entry in &manifest.files {
        writer.deploy_entry(&stored.dir, &root, entry, platform);
    }

    let report = writer.report;
    sink.line(&format!("[enable/done] {report}"));
    Ok(report)
}

struct Writer<'a> {
    backups: BackupStore,
    sink: &'a dyn LogSink,
    report: EnableReport,
}

impl Writer<'_> {
    fn deploy_entry(&mut self, mod_dir: &Path, root: &Path, entry: &FileEntry, platform: Platform) {
        let label = entry.source().unwrap_or("<none>");
        if !entry.applies_to(platform) {
            self.sink.line(&format!(
                "  [skip/platform] {label} (entry platform={})",
                entry.platform.as_deref().unwrap_or_default()
            ));
            self.report.skipped += 1;
            return;
        }
        let (Some(source_rel), Some(target_rel)) = (entry.source(), entry.target()) else {
            self.fail(format!(
                "  [error/entry] missing 'source' or 'target_subpath' in {}",
                describe(entry)
            ));
            return;
        };
        let (Some(source_path), Some(target_path)) =
            (fsops::safe_relative(source_rel), fsops::safe_relative(target_rel))
        else {
            self.fail(format!(
                "  [error/entry] path escapes its root: {source_rel} -> {target_rel}"
            ));
            return;
        };

        let source = mod_dir.join(source_path);
        let dest = root.join(target_path);
        if source.is_dir() {
            self.merge_dir(&source, &dest, target_rel);
        } else if source.is_file() {
            if self.write_file(&source, &dest, target_rel) {
                self.sink
                    .line(&format!("  [write] {source_rel} -> {target_rel}"));
            }
        } else {
            self.fail(format!(
                "  [error/missing] source not found: {}",
                source.display()
            ));
        }
    }

    fn merge_dir(&mut self, source: &Path, dest: &Path, target_rel: &str) {
        let files = match fsops::list_files(source) {
            Ok(files) => files,
            Err(err) => {
                self.fail(format!("  [error/copy] {target_rel} :: {err:#}"));
                return;
            }
        };
        let before = self.report.wrote;
        for rel in files {
            let label = format!("{target_rel}/{}", fsops::to_manifest_path(&rel));
            self.write_file(&source.join(&rel), &dest.join(&rel), &label);
        }
        self.sink.line(&format!(
            "  [write] {target_rel}/ ({} files)",
            self.report.wrote - before
        ));
    }

    /// Backs up an existing destination, then copies. Returns true on success.
    fn write_file(&mut self, source: &Path, dest: &Path, label: &str) -> bool {
        if dest.is_dir() {
            self.fail(format!(
                "  [error/copy] {label} :: destination is a directory"
            ));
            return false;
        }
        if dest.is_file() {
            match self.backups.snapshot(dest) {
                Ok(Some(backup)) => {
                    let backup_name = backup
                        .file_name()
                        .map(|name| name.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    self.sink
                        .line(&format!("  [backup] {label} <- {backup_name}"));
                    self.report.backed_up += 1;
                }
                Ok(None) => {}
                Err(err) => {
                    self.fail(format!("  [error/backup] {label} :: {err:#}"));
                    return false;
                }
            }
        }
        match fsops::copy_file(source, dest) {
            Ok(()) => {
                debug!(source = %source.display(), dest = %dest.display(), "wrote file");
                self.report.wrote += 1;
                true
            }
            Err(err) => {
                self.fail(format!("  [error/copy] {label} :: {err:#}"));
                false
            }
        }
    }

    fn fail(&mut self, line: String) {
        warn!("{}", line.trim());
        self.sink.line(&line);
        self.report.errors += 1;
    }
}

fn describe(entry: &FileEntry) -> String {
    serde_json::to_string(entry).unwrap_or_else(|_| format!("{entry:?}"))
}

pub fn disable_mod(
    config: &EngineConfig,
    name: &str,
    platform: Platform,
    sink: &dyn LogSink,
) -> Result<DisableReport> {
    let stored = load_stored(config, name)?;
    let manifest = &stored.manifest;
    let root = install_root(manifest, &config.targets)?;
    if !root.is_dir() {
        return Err(DeployError::TargetRootMissing(root).into());
    }
    if manifest.files.is_empty() {
        sink.line("[disable] manifest has no files to disable");
        return Ok(DisableReport::default());
    }

    sink.line(&format!("[disable] {} from {}", manifest.name, root.display()));
    let mut remover = Remover {
        backups: BackupStore::new(&config.layout.backups_dir),
        sink,
        report: DisableReport::default(),
    };
    for entry in &manifest.files {
        if !entry.applies_to(platform) {
            debug!(entry = %describe(entry), "skip entry for other platform");
            continue;
        }
        remover.undeploy_entry(&stored.dir, &root, entry);
    }

    let report = remover.report;
    sink.line(&format!("[disable/done] {report}"));
    Ok(report)
}

struct Remover<'a> {
    backups: BackupStore,
    sink: &'a dyn LogSink,
    report: DisableReport,
}

impl Remover<'_> {
    fn undeploy_entry(&mut self, mod_dir: &Path, root: &Path, entry: &FileEntry) {
        let Some(target_rel) = entry.target() else {
            self.fail(format!(
                "  [error/entry] missing 'target_subpath' in {}",
                describe(entry)
            ));
            return;
        };
        let Some(target_path) = fsops::safe_relative(target_rel) else {
            self.fail(format!("  [error/entry] path escapes its root: {target_rel}"));
            return;
        };
        let dest = root.join(target_path);

        let source_dir = entry
            .source()
            .and_then(fsops::safe_relative)
            .map(|rel| mod_dir.join(rel))
            .filter(|path| path.is_dir());
        match source_dir {
            Some(source_dir) => self.undeploy_dir(&source_dir, &dest, target_rel),
            None => self.undeploy_file(&dest, target_rel),
        }
    }

    fn undeploy_dir(&mut self, source: &Path, dest: &Path, target_rel: &str) {
        if !dest.is_dir() {
            self.sink.line(&format!("  [absent] {target_rel}"));
            self.report.not_present += 1;
            return;
        }
        let files = match fsops::list_files(source) {
            Ok(files) => files,
            Err(err) => {
                self.fail(format!("  [error/remove] {target_rel} :: {err:#}"));
                return;
            }
        };
        for rel in files {
            let label = format!("{target_rel}/{}", fsops::to_manifest_path(&rel));
            self.undeploy_file(&dest.join(&rel), &label);
        }
        let pruned = fsops::remove_empty_dirs(dest, true);
        if pruned > 0 {
            debug!(dir = %dest.display(), pruned, "removed empty directories");
        }
    }

    fn undeploy_file(&mut self, dest: &Path, label: &str) {
        if fs::symlink_metadata(dest).is_err() {
            self.sink.line(&format!("  [absent] {label}"));
            self.report.not_present += 1;
            return;
        }
        if dest.is_dir() {
            self.fail(format!(
                "  [error/remove] {label} :: destination is a directory"
            ));
            return;
        }
        if let Err(err) = fs::remove_file(dest) {
            self.fail(format!("  [error/remove] {label} :: {err}"));
            return;
        }
        self.sink.line(&format!("  [remove] {label}"));
        self.report.removed += 1;

        match self.backups.latest_for_target(dest) {
            Ok(Some(backup)) => match fsops::copy_file(&backup, dest) {
                Ok(()) => {
                    let backup_name = backup
                        .file_name()
                        .map(|name| name.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    self.sink
                        .line(&format!("  [restore] {backup_name} -> {label}"));
                    self.report.restored += 1;
                }
                Err(err) => self.fail(format!("  [error/restore] {label} :: {err:#}")),
            },
            Ok(None) => {
                self.sink
                    .line(&format!("  [no-backup] {label} (left removed)"));
                self.report.no_backup += 1;
            }
            Err(err) => self.fail(format!("  [error/restore] {label} :: {err:#}")),
        }
    }

    fn fail(&mut self, line: String) {
        warn!("{}", line.trim());
        self.sink.line(&line);
        self.report.errors += 1;
    }
}

/// Undeploys the mod if its route still resolves, then deletes it from
/// the store. Returns the disable report when an undeploy happened.
pub fn remove_mod(
    config: &EngineConfig,
    name: &str,
    platform: Platform,
    sink: &dyn LogSink,
) -> Result<Option<DisableReport>> {
    let dir = config.layout.mod_dir(name);
    if name.trim().is_empty() || !dir.is_dir() {
        return Err(DeployError::ModNotFound(name.to_string()).into());
    }

    let report = match disable_mod(config, name, platform, sink) {
        Ok(report) => Some(report),
        Err(err) if error::precondition(&err).is_some() => {
            sink.line(&format!("[remove] skipped undeploy: {err}"));
            None
        }
        Err(err) => return Err(err).context("undeploy before remove"),
    };

    fs::remove_dir_all(&dir).with_context(|| format!("delete {}", dir.display()))?;
    sink.line(&format!("[remove] deleted {name} from the mod store"));
    Ok(report)
}
