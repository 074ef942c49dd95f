use crate::{
    backup::BackupStore,
    config::EngineConfig,
    conflicts::{self, ConflictEntry, ConflictIndex},
    deploy::{self, DisableReport, EnableReport, InstallPreview},
    error::{self, DeployError},
    game::Platform,
    importer::{self, ImportOutcome},
    logging::LogSink,
    manifest::Manifest,
    restore::{self, RestorePoint, RollbackReport},
};
use anyhow::Result;
use std::{fmt, path::Path};
use tracing::warn;

/// The caller-owned part of the state: which mods are on, and in what order.
pub trait WorkingSet {
    fn enabled_mods(&self) -> Vec<String>;
    fn load_order(&self) -> Vec<String>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StaticWorkingSet {
    pub enabled: Vec<String>,
    pub load_order: Vec<String>,
}

impl StaticWorkingSet {
    pub fn new<E, O>(enabled: E, load_order: O) -> Self
    where
        E: IntoIterator,
        E::Item: Into<String>,
        O: IntoIterator,
        O::Item: Into<String>,
    {
        Self {
            enabled: enabled.into_iter().map(Into::into).collect(),
            load_order: load_order.into_iter().map(Into::into).collect(),
        }
    }
}

impl WorkingSet for StaticWorkingSet {
    fn enabled_mods(&self) -> Vec<String> {
        self.enabled.clone()
    }

    fn load_order(&self) -> Vec<String> {
        self.load_order.clone()
    }
}

/// `load_order` restricted to enabled mods, then enabled mods the order
/// does not mention. Each name appears once.
pub fn effective_load_order(enabled: &[String], load_order: &[String]) -> Vec<String> {
    let mut ordered: Vec<String> = Vec::with_capacity(enabled.len());
    for name in load_order.iter().chain(enabled.iter()) {
        if enabled.contains(name) && !ordered.contains(name) {
            ordered.push(name.clone());
        }
    }
    ordered
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub restore_point: Option<String>,
    pub order: Vec<String>,
    pub applied: Vec<(String, EnableReport)>,
    pub failed: Vec<(String, String)>,
    pub totals: EnableReport,
}

impl fmt::Display for ApplyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.order.is_empty() {
            return f.write_str("No enabled mods to apply.");
        }
        write!(
            f,
            "Applied {} mod(s) in order (last-write-wins), {} failed. {}. Restore point: {}",
            self.applied.len(),
            self.failed.len(),
            self.totals,
            self.restore_point.as_deref().unwrap_or("none")
        )
    }
}

#[derive(Debug, Clone)]
pub struct Engine {
    config: EngineConfig,
    platform: Platform,
}

impl Engine {
    pub fn new(config: EngineConfig, platform: Platform) -> Self {
        Self { config, platform }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    pub fn list_mods(&self) -> Result<Vec<String>> {
        conflicts::store_mods(&self.config.layout.mods_dir)
    }

    pub fn manifest(&self, name: &str) -> Result<Manifest> {
        Ok(deploy::load_stored(&self.config, name)?.manifest)
    }

    pub fn enable_mod(&self, name: &str, sink: &dyn LogSink) -> Result<EnableReport> {
        deploy::enable_mod(&self.config, name, self.platform, sink)
    }

    pub fn disable_mod(&self, name: &str, sink: &dyn LogSink) -> Result<DisableReport> {
        deploy::disable_mod(&self.config, name, self.platform, sink)
    }

    pub fn preview_install(&self, name: &str) -> Result<InstallPreview> {
        deploy::preview_install(&self.config, name, self.platform)
    }

    pub fn remove_mod(&self, name: &str, sink: &dyn LogSink) -> Result<Option<DisableReport>> {
        deploy::remove_mod(&self.config, name, self.platform, sink)
    }

    pub fn install_from_source(
        &self,
        source: &Path,
        name_override: Option<&str>,
        sink: &dyn LogSink,
    ) -> Result<ImportOutcome> {
        importer::install_from_source(&self.config.layout, source, name_override, sink)
    }

    pub fn conflict_index(&self, names: Option<&[String]>) -> Result<ConflictIndex> {
        conflicts::build(&self.config.layout.mods_dir, names, self.platform)
    }

    /// Overlaps within the enabled set, or across the whole store when
    /// nothing is enabled.
    pub fn find_conflicts(&self, working: &dyn WorkingSet) -> Result<Vec<ConflictEntry>> {
        let enabled = working.enabled_mods();
        let names = if enabled.is_empty() {
            None
        } else {
            Some(enabled.as_slice())
        };
        let index = self.conflict_index(names)?;
        Ok(conflicts::report(
            &conflicts::find_conflicts(&index),
            &working.load_order(),
        ))
    }

    pub fn effective_load_order(&self, working: &dyn WorkingSet) -> Vec<String> {
        effective_load_order(&working.enabled_mods(), &working.load_order())
    }

    fn live_root(&self) -> Result<&Path> {
        let root = self
            .config
            .targets
            .game_target
            .as_deref()
            .ok_or(DeployError::NoTargetRoot)?;
        if !root.is_dir() {
            return Err(DeployError::TargetRootMissing(root.to_path_buf()).into());
        }
        Ok(root)
    }

    pub fn create_restore_point(
        &self,
        working: &dyn WorkingSet,
        sink: &dyn LogSink,
    ) -> Result<RestorePoint> {
        let root = self.live_root()?;
        let enabled = working.enabled_mods();
        let index = self.conflict_index(Some(enabled.as_slice()))?;
        restore::create(&self.config.layout.restore_points_dir, root, &index, sink)
    }

    pub fn list_restore_points(&self) -> Result<Vec<RestorePoint>> {
        restore::list(&self.config.layout.restore_points_dir)
    }

    pub fn rollback_to_restore_point(
        &self,
        name: &str,
        working: &dyn WorkingSet,
        sink: &dyn LogSink,
    ) -> Result<RollbackReport> {
        let root = self.live_root()?;
        let enabled = working.enabled_mods();
        let index = self.conflict_index(Some(enabled.as_slice()))?;
        restore::rollback(
            &self.config.layout.restore_points_dir,
            name,
            root,
            &index,
            sink,
        )
    }

    /// Snapshots the managed paths, then enables every mod in effective
    /// order. A mod failing its preconditions is logged and skipped.
    pub fn apply_enabled_in_order(
        &self,
        working: &dyn WorkingSet,
        sink: &dyn LogSink,
    ) -> Result<ApplyReport> {
        self.live_root()?;
        let order = self.effective_load_order(working);
        let mut report = ApplyReport {
            order: order.clone(),
            ..ApplyReport::default()
        };
        if order.is_empty() {
            sink.line(&report.to_string());
            return Ok(report);
        }

        let point = self.create_restore_point(working, sink)?;
        report.restore_point = Some(point.name);

        for name in &order {
            match self.enable_mod(name, sink) {
                Ok(mod_report) => {
                    report.totals.absorb(&mod_report);
                    report.applied.push((name.clone(), mod_report));
                }
                Err(err) => {
                    if error::precondition(&err).is_none() {
                        warn!(mod_name = %name, "enable failed: {err:#}");
                    }
                    sink.line(&format!("[WARN] Failed enabling {name}: {err:#}"));
                    report.failed.push((name.clone(), format!("{err:#}")));
                }
            }
        }

        self.prune_stores();
        sink.line(&report.to_string());
        Ok(report)
    }

    /// Applies retention to backups and restore points. Best-effort.
    pub fn prune_stores(&self) -> (usize, usize) {
        let backups = BackupStore::new(&self.config.layout.backups_dir)
            .prune(self.config.backup_retention);
        let points = restore::prune(
            &self.config.layout.restore_points_dir,
            self.config.restore_point_retention,
        );
        (backups, points)
    }
}
