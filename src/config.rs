use crate::engine::WorkingSet;
use crate::game;
use anyhow::{Context, Result};
use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Component, Path, PathBuf},
};

pub const APP_DIR_NAME: &str = "modwarden";
pub const HOME_ENV: &str = "MODWARDEN_HOME";
pub const DEFAULT_BACKUP_RETENTION: usize = 10;
pub const DEFAULT_RESTORE_POINT_RETENTION: usize = 10;
const CONFIG_FILE: &str = "config.json";

/// Private state directories, all derived from one data dir.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    pub data_dir: PathBuf,
    pub mods_dir: PathBuf,
    pub backups_dir: PathBuf,
    pub restore_points_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub tmp_dir: PathBuf,
}

impl Layout {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            mods_dir: data_dir.join("mods"),
            backups_dir: data_dir.join("backups"),
            restore_points_dir: data_dir.join("restore_points"),
            logs_dir: data_dir.join("logs"),
            tmp_dir: data_dir.join("tmp"),
            data_dir,
        }
    }

    pub fn ensure(&self) -> Result<()> {
        for dir in [
            &self.data_dir,
            &self.mods_dir,
            &self.backups_dir,
            &self.restore_points_dir,
            &self.logs_dir,
            &self.tmp_dir,
        ] {
            fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
        }
        Ok(())
    }

    pub fn mod_dir(&self, name: &str) -> PathBuf {
        self.mods_dir.join(name)
    }

    pub fn config_path(&self) -> PathBuf {
        self.data_dir.join(CONFIG_FILE)
    }
}

/// Roots a deploy may write into. Neither is owned by the tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Targets {
    pub game_target: Option<PathBuf>,
    pub user_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub layout: Layout,
    pub targets: Targets,
    pub backup_retention: usize,
    pub restore_point_retention: usize,
}

impl EngineConfig {
    pub fn new(layout: Layout, targets: Targets) -> Self {
        Self {
            layout,
            targets,
            backup_retention: DEFAULT_BACKUP_RETENTION,
            restore_point_retention: DEFAULT_RESTORE_POINT_RETENTION,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    #[serde(default)]
    pub target_path: Option<PathBuf>,
    #[serde(default)]
    pub user_dir_path: Option<PathBuf>,
    #[serde(default)]
    pub enabled_mods: Vec<String>,
    #[serde(default)]
    pub load_order: Vec<String>,
    #[serde(default = "default_backup_retention")]
    pub backup_retention: usize,
    #[serde(default = "default_restore_point_retention")]
    pub restore_point_retention: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            target_path: None,
            user_dir_path: None,
            enabled_mods: Vec::new(),
            load_order: Vec::new(),
            backup_retention: DEFAULT_BACKUP_RETENTION,
            restore_point_retention: DEFAULT_RESTORE_POINT_RETENTION,
        }
    }
}

impl AppConfig {
    pub fn load_or_create(layout: &Layout) -> Result<Self> {
        fs::create_dir_all(&layout.data_dir).context("create app data dir")?;
        let path = layout.config_path();
        if path.exists() {
            let raw = fs::read_to_string(&path).context("read app config")?;
            let config: AppConfig = serde_json::from_str(&raw).context("parse app config")?;
            return Ok(config);
        }

        let config = AppConfig::default();
        config.save(layout)?;
        Ok(config)
    }

    pub fn save(&self, layout: &Layout) -> Result<()> {
        fs::create_dir_all(&layout.data_dir).context("create app data dir")?;
        let raw = serde_json::to_string_pretty(self).context("serialize app config")?;
        fs::write(layout.config_path(), raw).context("write app config")?;
        Ok(())
    }

    pub fn engine_config(&self, layout: Layout) -> Result<EngineConfig> {
        let user_dir = match &self.user_dir_path {
            Some(path) => path.clone(),
            None => game::default_user_dir()?,
        };
        Ok(EngineConfig {
            layout,
            targets: Targets {
                game_target: self.target_path.clone(),
                user_dir,
            },
            backup_retention: self.backup_retention,
            restore_point_retention: self.restore_point_retention,
        })
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        self.enabled_mods.iter().any(|entry| entry == name)
    }

    /// Marks a mod enabled. Returns false when it already was.
    pub fn enable(&mut self, name: &str) -> bool {
        self.ensure_in_order(name);
        if self.is_enabled(name) {
            return false;
        }
        self.enabled_mods.push(name.to_string());
        true
    }

    pub fn disable(&mut self, name: &str) -> bool {
        let before = self.enabled_mods.len();
        self.enabled_mods.retain(|entry| entry != name);
        before != self.enabled_mods.len()
    }

    pub fn ensure_in_order(&mut self, name: &str) {
        if !self.load_order.iter().any(|entry| entry == name) {
            self.load_order.push(name.to_string());
        }
    }

    /// Drops a mod from both the enabled set and the load order.
    pub fn forget(&mut self, name: &str) {
        self.disable(name);
        self.load_order.retain(|entry| entry != name);
    }

    /// Replaces the load order: the given names first, then any remaining
    /// entries in their previous relative order.
    pub fn set_order(&mut self, names: &[String]) {
        let mut order: Vec<String> = Vec::new();
        for name in names.iter().chain(self.load_order.iter()) {
            if !order.contains(name) {
                order.push(name.clone());
            }
        }
        self.load_order = order;
    }

    pub fn move_up(&mut self, name: &str) -> bool {
        match self.load_order.iter().position(|entry| entry == name) {
            Some(index) if index > 0 => {
                self.load_order.swap(index, index - 1);
                true
            }
            _ => false,
        }
    }

    pub fn move_down(&mut self, name: &str) -> bool {
        match self.load_order.iter().position(|entry| entry == name) {
            Some(index) if index + 1 < self.load_order.len() => {
                self.load_order.swap(index, index + 1);
                true
            }
            _ => false,
        }
    }
}

impl WorkingSet for AppConfig {
    fn enabled_mods(&self) -> Vec<String> {
        self.enabled_mods.clone()
    }

    fn load_order(&self) -> Vec<String> {
        self.load_order.clone()
    }
}

pub fn base_data_dir() -> Result<PathBuf> {
    if let Some(home) = std::env::var_os(HOME_ENV).filter(|value| !value.is_empty()) {
        return Ok(PathBuf::from(home));
    }
    let base = BaseDirs::new().context("resolve home dir")?;
    Ok(base.data_local_dir().join(APP_DIR_NAME))
}

/// Returns true when `path` sits at or below `root`. Both are compared
/// after `.` and `..` are resolved lexically.
pub fn is_under(path: &Path, root: &Path) -> bool {
    match (normalize(path), normalize(root)) {
        (Some(path), Some(root)) => path.starts_with(root),
        _ => false,
    }
}

/// `None` when `..` would climb above the start of the path.
fn normalize(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    return None;
                }
            }
            other => out.push(other),
        }
    }
    Some(out)
}

fn default_backup_retention() -> usize {
    DEFAULT_BACKUP_RETENTION
}

fn default_restore_point_retention() -> usize {
    DEFAULT_RESTORE_POINT_RETENTION
}
