use crate::error::DeployError;
use crate::game::Platform;
use anyhow::{Context, Result};
use serde::{de::Error as _, Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::{
    fmt, fs,
    path::{Path, PathBuf},
};

pub const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ModKind {
    Ui,
    Bundle,
    Tactics,
    Graphics,
    #[default]
    Misc,
    Other(String),
}

impl ModKind {
    pub fn parse(raw: &str) -> Self {
        let value = raw.trim().to_ascii_lowercase();
        match value.as_str() {
            "ui" => ModKind::Ui,
            "bundle" => ModKind::Bundle,
            "tactics" => ModKind::Tactics,
            "graphics" => ModKind::Graphics,
            "misc" | "" => ModKind::Misc,
            _ => ModKind::Other(value),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            ModKind::Ui => "ui",
            ModKind::Bundle => "bundle",
            ModKind::Tactics => "tactics",
            ModKind::Graphics => "graphics",
            ModKind::Misc => "misc",
            ModKind::Other(value) => value,
        }
    }
}

impl fmt::Display for ModKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ModKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ModKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?;
        Ok(raw.map(|value| ModKind::parse(&value)).unwrap_or_default())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_subpath: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl FileEntry {
    pub fn new(source: impl Into<String>, target_subpath: impl Into<String>) -> Self {
        Self {
            source: Some(source.into()),
            target_subpath: Some(target_subpath.into()),
            ..Self::default()
        }
    }

    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = Some(platform.as_str().to_string());
        self
    }

    pub fn source(&self) -> Option<&str> {
        non_blank(self.source.as_deref())
    }

    pub fn target(&self) -> Option<&str> {
        non_blank(self.target_subpath.as_deref())
    }

    /// Untagged entries apply everywhere; an unknown tag applies nowhere.
    pub fn applies_to(&self, platform: Platform) -> bool {
        match non_blank(self.platform.as_deref()) {
            None => true,
            Some(tag) => Platform::parse(tag) == Some(platform),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default, deserialize_with = "nullable")]
    pub name: String,
    #[serde(default, deserialize_with = "nullable")]
    pub version: String,
    #[serde(rename = "type", default)]
    pub kind: ModKind,
    #[serde(default, deserialize_with = "nullable")]
    pub author: String,
    #[serde(default, deserialize_with = "nullable")]
    pub description: String,
    #[serde(default, deserialize_with = "nullable")]
    pub homepage: String,
    #[serde(default, deserialize_with = "nullable")]
    pub license: String,
    #[serde(default, deserialize_with = "nullable")]
    pub compatibility: Map<String, Value>,
    #[serde(default, deserialize_with = "nullable")]
    pub dependencies: Vec<String>,
    #[serde(default, deserialize_with = "nullable")]
    pub conflicts: Vec<String>,
    #[serde(default, deserialize_with = "nullable")]
    pub load_after: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install_path: Option<PathBuf>,
    #[serde(default, deserialize_with = "file_list")]
    pub files: Vec<FileEntry>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Manifest {
    pub fn new(name: impl Into<String>, kind: ModKind) -> Self {
        Self {
            name: name.into(),
            version: "1.0.0".to_string(),
            kind,
            ..Self::default()
        }
    }

    pub fn kind(&self) -> &ModKind {
        &self.kind
    }

    pub fn install_path(&self) -> Option<&Path> {
        self.install_path
            .as_deref()
            .filter(|path| !path.as_os_str().is_empty())
    }
}

/// Reads `<mod_dir>/manifest.json`, defaulting the name to the directory name.
pub fn load(mod_dir: &Path) -> Result<Manifest> {
    let fallback = mod_dir
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    load_named(mod_dir, &fallback)
}

pub fn load_named(mod_dir: &Path, fallback_name: &str) -> Result<Manifest> {
    let path = mod_dir.join(MANIFEST_FILE);
    if !path.is_file() {
        return Err(DeployError::ManifestNotFound(mod_dir.to_path_buf()).into());
    }
    let raw = fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
    let mut manifest: Manifest =
        serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))?;
    if manifest.name.trim().is_empty() {
        manifest.name = fallback_name.to_string();
    }
    Ok(manifest)
}

pub fn write(mod_dir: &Path, manifest: &Manifest) -> Result<()> {
    let path = mod_dir.join(MANIFEST_FILE);
    let raw = serde_json::to_string_pretty(manifest).context("serialize manifest")?;
    fs::write(&path, raw).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

fn nullable<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn file_list<'de, D>(deserializer: D) -> Result<Vec<FileEntry>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Array(items) => items
            .into_iter()
            .map(|item| serde_json::from_value(item).map_err(D::Error::custom))
            .collect(),
        _ => Ok(Vec::new()),
    }
}
