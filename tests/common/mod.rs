#![allow(dead_code)]

use modwarden::{
    config::{EngineConfig, Layout, Targets},
    engine::Engine,
    game::Platform,
    manifest::{self, FileEntry, Manifest, ModKind},
};
use std::{
    fs,
    path::{Path, PathBuf},
};
use tempfile::TempDir;

pub struct Fixture {
    pub temp: TempDir,
    pub game: PathBuf,
    pub user: PathBuf,
    pub layout: Layout,
}

impl Fixture {
    pub fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let game = temp.path().join("game/data/ui");
        let user = temp.path().join("user");
        fs::create_dir_all(&game).unwrap();
        fs::create_dir_all(&user).unwrap();
        let layout = Layout::new(temp.path().join("data"));
        layout.ensure().unwrap();
        Self {
            temp,
            game,
            user,
            layout,
        }
    }

    pub fn config(&self) -> EngineConfig {
        EngineConfig::new(
            self.layout.clone(),
            Targets {
                game_target: Some(self.game.clone()),
                user_dir: self.user.clone(),
            },
        )
    }

    pub fn engine(&self) -> Engine {
        Engine::new(self.config(), Platform::Windows)
    }

    pub fn engine_without_target(&self) -> Engine {
        let mut config = self.config();
        config.targets.game_target = None;
        Engine::new(config, Platform::Windows)
    }

    /// Writes `files` into the mod store and declares them at the same
    /// target subpath.
    pub fn add_mod(&self, name: &str, kind: ModKind, files: &[(&str, &str)]) -> PathBuf {
        let entries = files
            .iter()
            .map(|(rel, _)| FileEntry::new(*rel, *rel))
            .collect();
        self.add_mod_with(name, kind, files, entries)
    }

    pub fn add_mod_with(
        &self,
        name: &str,
        kind: ModKind,
        files: &[(&str, &str)],
        entries: Vec<FileEntry>,
    ) -> PathBuf {
        let dir = self.layout.mod_dir(name);
        for (rel, contents) in files {
            write(&dir.join(rel), contents);
        }
        fs::create_dir_all(&dir).unwrap();
        let mut manifest = Manifest::new(name, kind);
        manifest.files = entries;
        manifest::write(&dir, &manifest).unwrap();
        dir
    }

    pub fn game_file(&self, rel: &str) -> Option<String> {
        fs::read_to_string(self.game.join(rel)).ok()
    }
}

pub fn write(path: &Path, contents: &str) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, contents).unwrap();
}
