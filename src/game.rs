use anyhow::{Context, Result};
use directories::{BaseDirs, UserDirs};
use std::{
    fmt,
    path::{Path, PathBuf},
};
use sysinfo::System;

pub const GAME_NAME: &str = "Football Manager 26";
const PUBLISHER_DIR: &str = "Sports Interactive";
const PROCESS_NAMES: &[&str] = &["fm.exe", "fm", "Football Manager 26"];

/// Platform tag used by manifest entries to restrict where a file applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Platform {
    Windows,
    Mac,
    Linux,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(target_os = "windows") {
            Platform::Windows
        } else if cfg!(target_os = "macos") {
            Platform::Mac
        } else {
            Platform::Linux
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Platform::Windows => "windows",
            Platform::Mac => "mac",
            Platform::Linux => "linux",
        }
    }

    /// Accepts the canonical tags plus the usual aliases, case-insensitively.
    pub fn parse(tag: &str) -> Option<Self> {
        match tag.trim().to_ascii_lowercase().as_str() {
            "windows" | "win" => Some(Platform::Windows),
            "mac" | "macos" | "osx" => Some(Platform::Mac),
            "linux" => Some(Platform::Linux),
            _ => None,
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn default_user_dir() -> Result<PathBuf> {
    default_user_dir_for(Platform::current())
}

fn default_user_dir_for(platform: Platform) -> Result<PathBuf> {
    let base = BaseDirs::new().context("resolve home dir")?;
    let home = base.home_dir();
    let dir = match platform {
        Platform::Windows => {
            let documents = UserDirs::new()
                .and_then(|dirs| dirs.document_dir().map(Path::to_path_buf))
                .unwrap_or_else(|| home.join("Documents"));
            documents.join(PUBLISHER_DIR).join(GAME_NAME)
        }
        Platform::Mac => home
            .join("Library")
            .join("Application Support")
            .join(PUBLISHER_DIR)
            .join(GAME_NAME),
        Platform::Linux => home
            .join(".local")
            .join("share")
            .join(PUBLISHER_DIR)
            .join(GAME_NAME),
    };
    Ok(dir)
}

/// Existing bundle folders from the usual store installs, in search order.
pub fn detect_target_candidates() -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    for path in candidate_paths() {
        if path.is_dir() && !candidates.contains(&path) {
            candidates.push(path);
        }
    }
    candidates
}

#[cfg(target_os = "windows")]
fn candidate_paths() -> Vec<PathBuf> {
    let program_files_x86 = std::env::var_os("PROGRAMFILES(X86)")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("C:/Program Files (x86)"));
    let program_files = std::env::var_os("PROGRAMFILES")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("C:/Program Files"));

    let mut bases = vec![
        program_files_x86.join("Steam/steamapps/common").join(GAME_NAME),
        program_files.join("Epic Games").join(GAME_NAME),
    ];
    for drive in ["C:", "D:", "E:"] {
        bases.push(
            PathBuf::from(drive)
                .join("XboxGames")
                .join(GAME_NAME)
                .join("Content"),
        );
    }

    let mut paths = Vec::new();
    for base in bases {
        for sub in [
            "fm_Data/StreamingAssets/aa/StandaloneWindows64",
            "data/StreamingAssets/aa/StandaloneWindows64",
        ] {
            paths.push(base.join(sub));
        }
    }
    paths
}

#[cfg(target_os = "macos")]
fn candidate_paths() -> Vec<PathBuf> {
    let Some(base) = BaseDirs::new() else {
        return Vec::new();
    };
    let support = base.home_dir().join("Library/Application Support");
    let steam = support.join("Steam/steamapps/common").join(GAME_NAME);
    vec![
        steam.join("fm.app/Contents/Resources/Data/StreamingAssets/aa/StandaloneOSX"),
        steam.join("fm_Data/StreamingAssets/aa/StandaloneOSXUniversal"),
        support
            .join("Epic")
            .join(GAME_NAME)
            .join("fm_Data/StreamingAssets/aa/StandaloneOSXUniversal"),
    ]
}

#[cfg(not(any(target_os = "windows", target_os = "macos")))]
fn candidate_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Some(base) = BaseDirs::new() {
        paths.push(
            base.home_dir()
                .join(".local/share/Steam/steamapps/common")
                .join(GAME_NAME)
                .join("fm_Data/StreamingAssets/aa/StandaloneLinux64"),
        );
    }
    paths.push(
        PathBuf::from("/run/media/mmcblk0p1/steamapps/common")
            .join(GAME_NAME)
            .join("fm_Data/StreamingAssets/aa/StandaloneLinux64"),
    );
    paths
}

pub fn is_game_running() -> bool {
    let mut sys = System::new();
    sys.refresh_processes();
    sys.processes()
        .values()
        .any(|process| is_game_process(process.name()))
}

fn is_game_process(name: &str) -> bool {
    PROCESS_NAMES
        .iter()
        .any(|candidate| name.eq_ignore_ascii_case(candidate))
}
