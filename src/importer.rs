use crate::{
    config::Layout,
    error::DeployError,
    fsops,
    game::Platform,
    logging::LogSink,
    manifest::{self, FileEntry, Manifest, ModKind, MANIFEST_FILE},
};
use anyhow::{bail, Context, Result};
use blake3::Hasher;
use std::{
    fs,
    path::{Path, PathBuf},
    sync::atomic::{AtomicUsize, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};
use tracing::{debug, info};

const GRAPHICS_DIRS: &[&str] = &["kits", "faces", "logos", "badges", "graphics"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportOutcome {
    pub name: String,
    pub kind: ModKind,
    pub generated_manifest: bool,
    pub files: usize,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArchiveFormat {
    Zip,
    SevenZ,
}

#[derive(Debug)]
struct Staged {
    root: PathBuf,
    scratch: Option<PathBuf>,
    fallback_name: String,
}

/// Copies a folder, archive or loose file into the mod store, synthesising
/// a manifest when the source has none.
pub fn install_from_source(
    layout: &Layout,
    source: &Path,
    name_override: Option<&str>,
    sink: &dyn LogSink,
) -> Result<ImportOutcome> {
    if !source.exists() {
        bail!("import source not found: {}", source.display());
    }
    let staged = stage(layout, source)?;
    let result = install_staged(layout, &staged, name_override, sink);
    if let Some(scratch) = &staged.scratch {
        fsops::best_effort_remove([scratch]);
    }
    result
}

fn install_staged(
    layout: &Layout,
    staged: &Staged,
    name_override: Option<&str>,
    sink: &dyn LogSink,
) -> Result<ImportOutcome> {
    let existing = if staged.root.join(MANIFEST_FILE).is_file() {
        Some(manifest::load_named(&staged.root, &staged.fallback_name)?)
    } else {
        None
    };

    let raw_name = name_override
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .or_else(|| existing.as_ref().map(|manifest| manifest.name.clone()))
        .unwrap_or_else(|| staged.fallback_name.clone());
    let name = sanitize_mod_name(&raw_name)
        .ok_or_else(|| DeployError::InvalidModName(raw_name.clone()))?;

    let dest = layout.mod_dir(&name);
    if dest.exists() && same_dir(&dest, &staged.root) {
        bail!("{} is already in the mod store", dest.display());
    }
    if dest.exists() {
        fs::remove_dir_all(&dest)
            .with_context(|| format!("replace existing mod {}", dest.display()))?;
    }
    fs::create_dir_all(&layout.mods_dir).context("create mods dir")?;
    let copied = fsops::copy_tree(&staged.root, &dest)
        .with_context(|| format!("copy mod into {}", dest.display()))?;
    debug!(files = copied, dest = %dest.display(), "copied mod payload");

    let (kind, generated_manifest, files) = match existing {
        Some(manifest) => (manifest.kind().clone(), false, manifest.files.len()),
        None => {
            let kind = detect_kind(&dest);
            let manifest = generate_manifest(&dest, &name, kind.clone())?;
            manifest::write(&dest, &manifest)?;
            sink.line(&format!(
                "  [manifest] generated {} manifest with {} files",
                kind,
                manifest.files.len()
            ));
            (kind, true, manifest.files.len())
        }
    };

    info!(mod_name = %name, kind = %kind, generated = generated_manifest, "installed mod");
    sink.line(&format!("Installed mod '{name}' to {}", dest.display()));
    Ok(ImportOutcome {
        name,
        kind,
        generated_manifest,
        files,
        path: dest,
    })
}

fn stage(layout: &Layout, source: &Path) -> Result<Staged> {
    let stem = source
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();

    if source.is_dir() {
        let root = find_mod_root(source);
        let fallback_name = root
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or(stem);
        return Ok(Staged {
            root,
            scratch: None,
            fallback_name,
        });
    }

    let scratch = make_scratch_dir(&layout.tmp_dir, source)?;
    let content = scratch.join("content");
    fs::create_dir_all(&content).context("create scratch content dir")?;

    let staged = match archive_format(source) {
        Some(format) => {
            let extracted = match format {
                ArchiveFormat::Zip => extract_zip(source, &content),
                ArchiveFormat::SevenZ => extract_7z(source, &content),
            };
            if let Err(err) = extracted {
                fsops::best_effort_remove([&scratch]);
                return Err(err);
            }
            let root = archive_root(&content);
            let fallback_name = if root == content {
                stem
            } else {
                root.file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or(stem)
            };
            Staged {
                root,
                scratch: Some(scratch),
                fallback_name,
            }
        }
        None => {
            let file_name = source.file_name().context("loose file has no name")?;
            if let Err(err) = fsops::copy_file(source, &content.join(file_name)) {
                fsops::best_effort_remove([&scratch]);
                return Err(err);
            }
            Staged {
                root: content,
                scratch: Some(scratch),
                fallback_name: stem,
            }
        }
    };
    Ok(staged)
}

/// The directory itself when it holds a manifest, else the first direct
/// child that does, else the directory.
pub fn find_mod_root(dir: &Path) -> PathBuf {
    if dir.join(MANIFEST_FILE).is_file() {
        return dir.to_path_buf();
    }
    let mut children: Vec<PathBuf> = match fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_dir())
            .collect(),
        Err(_) => Vec::new(),
    };
    children.sort();
    children
        .into_iter()
        .find(|child| child.join(MANIFEST_FILE).is_file())
        .unwrap_or_else(|| dir.to_path_buf())
}

/// Like [`find_mod_root`], but an archive with a single wrapper folder and
/// no manifest anywhere near the top unwraps that folder.
fn archive_root(extracted: &Path) -> PathBuf {
    let root = find_mod_root(extracted);
    if root != extracted || extracted.join(MANIFEST_FILE).is_file() {
        return root;
    }
    let entries: Vec<PathBuf> = match fs::read_dir(extracted) {
        Ok(entries) => entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .map(|name| !fsops::is_ignored_path(Path::new(name)))
                    .unwrap_or(false)
            })
            .collect(),
        Err(_) => return root,
    };
    match entries.as_slice() {
        [only] if only.is_dir() => only.clone(),
        _ => root,
    }
}

fn archive_format(path: &Path) -> Option<ArchiveFormat> {
    let ext = path.extension()?.to_string_lossy().to_ascii_lowercase();
    match ext.as_str() {
        "zip" => Some(ArchiveFormat::Zip),
        "7z" => Some(ArchiveFormat::SevenZ),
        _ => None,
    }
}

fn extract_zip(path: &Path, dest: &Path) -> Result<()> {
    let file = fs::File::open(path).context("open zip")?;
    let mut archive = zip::ZipArchive::new(file).context("read zip")?;

    for i in 0..archive.len() {
        let mut file = archive.by_index(i).context("zip entry")?;
        let Some(out_path) = file.enclosed_name() else {
            continue;
        };

        let out_path = dest.join(out_path);
        if file.is_dir() {
            fs::create_dir_all(&out_path).context("create zip dir")?;
            continue;
        }

        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent).context("create zip dir")?;
        }

        let mut out_file = fs::File::create(&out_path).context("write zip entry")?;
        std::io::copy(&mut file, &mut out_file).context("extract zip entry")?;
    }

    Ok(())
}

fn extract_7z(path: &Path, dest: &Path) -> Result<()> {
    sevenz_rust::decompress_file(path, dest)
        .with_context(|| format!("extract 7z archive {}", path.display()))
}

static SCRATCH_COUNTER: AtomicUsize = AtomicUsize::new(0);

fn make_scratch_dir(tmp_dir: &Path, source: &Path) -> Result<PathBuf> {
    fs::create_dir_all(tmp_dir).context("create temp root")?;

    let counter = SCRATCH_COUNTER.fetch_add(1, Ordering::Relaxed);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let mut hasher = Hasher::new();
    hasher.update(source.to_string_lossy().as_bytes());
    let hash = hasher.finalize().to_hex();
    let label = &hash.as_str()[..12];

    let scratch = tmp_dir.join(format!("import-{nanos}-{counter}-{label}"));
    fs::create_dir_all(&scratch).context("create temp dir")?;
    Ok(scratch)
}

/// Display-safe folder name: separators and reserved characters become
/// `_`, surrounding whitespace and dots are trimmed.
pub fn sanitize_mod_name(raw: &str) -> Option<String> {
    let cleaned: String = raw
        .chars()
        .map(|ch| match ch {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            ch if ch.is_control() => '_',
            ch => ch,
        })
        .collect();
    let cleaned = cleaned.trim().trim_matches('.').trim();
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned.to_string())
    }
}

fn extension_of(path: &Path) -> String {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default()
}

fn is_ui_bundle_name(path: &Path) -> bool {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    name.contains("ui-") || name.contains("panelids")
}

pub fn detect_kind(path: &Path) -> ModKind {
    if path.is_file() {
        return match extension_of(path).as_str() {
            "fmf" => ModKind::Tactics,
            "bundle" if is_ui_bundle_name(path) => ModKind::Ui,
            "bundle" => ModKind::Bundle,
            _ => ModKind::Misc,
        };
    }

    let mut has_fmf = false;
    let mut has_bundle = false;
    let mut has_ui_bundle = false;
    let mut has_graphics = false;
    for entry in walkdir::WalkDir::new(path)
        .min_depth(1)
        .into_iter()
        .filter_map(|entry| entry.ok())
    {
        let entry_path = entry.path();
        if entry.file_type().is_dir() {
            let name = entry.file_name().to_string_lossy().to_lowercase();
            if GRAPHICS_DIRS.contains(&name.as_str()) {
                has_graphics = true;
            }
            continue;
        }
        match extension_of(entry_path).as_str() {
            "fmf" => has_fmf = true,
            "bundle" => {
                has_bundle = true;
                has_ui_bundle |= is_ui_bundle_name(entry_path);
            }
            _ => {}
        }
    }

    if has_fmf {
        ModKind::Tactics
    } else if has_ui_bundle {
        ModKind::Ui
    } else if has_bundle {
        ModKind::Bundle
    } else if has_graphics {
        ModKind::Graphics
    } else {
        ModKind::Misc
    }
}

fn platform_folder(rel: &Path) -> Option<Platform> {
    let parent = rel.parent()?;
    parent
        .components()
        .find_map(|component| Platform::parse(&component.as_os_str().to_string_lossy()))
}

/// Builds a manifest listing the files of `mod_dir` according to `kind`.
pub fn generate_manifest(mod_dir: &Path, name: &str, kind: ModKind) -> Result<Manifest> {
    let mut manifest = Manifest::new(name, kind.clone());
    for rel in fsops::list_files(mod_dir)? {
        if rel == Path::new(MANIFEST_FILE) {
            continue;
        }
        let source = fsops::to_manifest_path(&rel);
        let file_name = rel
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let ext = extension_of(&rel);
        let entry = match kind {
            ModKind::Tactics if ext == "fmf" => FileEntry::new(source, file_name),
            ModKind::Tactics => continue,
            ModKind::Ui | ModKind::Bundle if ext == "bundle" => {
                let entry = FileEntry::new(source, file_name);
                match platform_folder(&rel) {
                    Some(platform) => entry.with_platform(platform),
                    None => entry,
                }
            }
            ModKind::Ui | ModKind::Bundle => continue,
            _ => FileEntry::new(source.clone(), source),
        };
        manifest.files.push(entry);
    }
    Ok(manifest)
}

fn same_dir(a: &Path, b: &Path) -> bool {
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::BufferedSink;
    use tempfile::TempDir;

    fn touch(path: &Path, body: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, body).unwrap();
    }

    #[test]
    fn sanitize_names() {
        assert_eq!(sanitize_mod_name("  Retro/Kits: 2026 "), Some("Retro_Kits_ 2026".to_string()));
        assert_eq!(sanitize_mod_name("..hidden.."), Some("hidden".to_string()));
        assert_eq!(sanitize_mod_name(" .. "), None);
        assert_eq!(sanitize_mod_name(""), None);
    }

    #[test]
    fn detect_single_files() {
        let temp = TempDir::new().unwrap();
        let cases = [
            ("442.fmf", ModKind::Tactics),
            ("ui-panelids_assets_all.bundle", ModKind::Ui),
            ("fonts.bundle", ModKind::Bundle),
            ("readme.txt", ModKind::Misc),
        ];
        for (name, kind) in cases {
            let path = temp.path().join(name);
            touch(&path, "x");
            assert_eq!(detect_kind(&path), kind, "{name}");
        }
    }

    #[test]
    fn detect_directories() {
        let temp = TempDir::new().unwrap();
        touch(&temp.path().join("t/sets/a.fmf"), "x");
        touch(&temp.path().join("u/windows/ui-tiles.bundle"), "x");
        touch(&temp.path().join("b/fonts.bundle"), "x");
        touch(&temp.path().join("g/Kits/club/1.png"), "x");
        touch(&temp.path().join("m/data.dbc"), "x");

        assert_eq!(detect_kind(&temp.path().join("t")), ModKind::Tactics);
        assert_eq!(detect_kind(&temp.path().join("u")), ModKind::Ui);
        assert_eq!(detect_kind(&temp.path().join("b")), ModKind::Bundle);
        assert_eq!(detect_kind(&temp.path().join("g")), ModKind::Graphics);
        assert_eq!(detect_kind(&temp.path().join("m")), ModKind::Misc);
    }

    #[test]
    fn generated_bundle_manifest_tags_platforms() {
        let temp = TempDir::new().unwrap();
        touch(&temp.path().join("windows/ui-tiles.bundle"), "w");
        touch(&temp.path().join("macOS/ui-tiles.bundle"), "m");
        touch(&temp.path().join("readme.txt"), "r");

        let manifest = generate_manifest(temp.path(), "Tiles", ModKind::Ui).unwrap();
        assert_eq!(manifest.files.len(), 2);
        let mac = manifest
            .files
            .iter()
            .find(|entry| entry.source() == Some("macOS/ui-tiles.bundle"))
            .unwrap();
        assert_eq!(mac.target(), Some("ui-tiles.bundle"));
        assert!(mac.applies_to(Platform::Mac));
        assert!(!mac.applies_to(Platform::Windows));
    }

    #[test]
    fn generated_graphics_manifest_keeps_structure() {
        let temp = TempDir::new().unwrap();
        touch(&temp.path().join("kits/club/home.png"), "x");
        touch(&temp.path().join("kits/club/config.xml"), "x");

        let manifest = generate_manifest(temp.path(), "Kits", ModKind::Graphics).unwrap();
        let targets: Vec<&str> = manifest.files.iter().filter_map(FileEntry::target).collect();
        assert_eq!(targets, ["kits/club/config.xml", "kits/club/home.png"]);
    }

    #[test]
    fn generated_tactics_manifest_flattens() {
        let temp = TempDir::new().unwrap();
        touch(&temp.path().join("pack/a/433.fmf"), "x");
        touch(&temp.path().join("pack/notes.txt"), "x");

        let manifest = generate_manifest(temp.path(), "Tactics", ModKind::Tactics).unwrap();
        assert_eq!(manifest.files, vec![FileEntry::new("pack/a/433.fmf", "433.fmf")]);
    }

    #[test]
    fn mod_root_prefers_manifest_child() {
        let temp = TempDir::new().unwrap();
        touch(&temp.path().join("inner").join(MANIFEST_FILE), "{}");
        touch(&temp.path().join("other/file"), "x");
        assert_eq!(find_mod_root(temp.path()), temp.path().join("inner"));
        assert_eq!(find_mod_root(&temp.path().join("other")), temp.path().join("other"));
    }

    #[test]
    fn archive_root_unwraps_single_folder() {
        let temp = TempDir::new().unwrap();
        touch(&temp.path().join("Wrapper/kits/a.png"), "x");
        touch(&temp.path().join("__MACOSX/junk"), "x");
        assert_eq!(archive_root(temp.path()), temp.path().join("Wrapper"));
    }

    #[test]
    fn loose_file_import_generates_manifest() {
        let temp = TempDir::new().unwrap();
        let layout = Layout::new(temp.path().join("data"));
        let source = temp.path().join("downloads/Gegenpress 4231.fmf");
        touch(&source, "tactic");

        let sink = BufferedSink::new();
        let outcome = install_from_source(&layout, &source, None, &sink).unwrap();
        assert_eq!(outcome.name, "Gegenpress 4231");
        assert_eq!(outcome.kind, ModKind::Tactics);
        assert!(outcome.generated_manifest);
        assert_eq!(outcome.files, 1);

        let manifest = manifest::load(&outcome.path).unwrap();
        assert_eq!(
            manifest.files,
            vec![FileEntry::new("Gegenpress 4231.fmf", "Gegenpress 4231.fmf")]
        );
        let leftovers = fs::read_dir(&layout.tmp_dir).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn reimport_replaces_destination() {
        let temp = TempDir::new().unwrap();
        let layout = Layout::new(temp.path().join("data"));
        let source = temp.path().join("Skin");
        touch(&source.join(MANIFEST_FILE), r#"{"name": "Skin", "type": "ui", "files": []}"#);
        touch(&source.join("old.bundle"), "x");
        let sink = BufferedSink::new();
        install_from_source(&layout, &source, None, &sink).unwrap();

        fs::remove_file(source.join("old.bundle")).unwrap();
        touch(&source.join("new.bundle"), "y");
        let outcome = install_from_source(&layout, &source, None, &sink).unwrap();
        assert!(!outcome.generated_manifest);
        assert!(!outcome.path.join("old.bundle").exists());
        assert!(outcome.path.join("new.bundle").exists());
    }

    #[test]
    fn missing_source_fails() {
        let temp = TempDir::new().unwrap();
        let layout = Layout::new(temp.path());
        let missing = temp.path().join("nope.zip");
        let err = install_from_source(&layout, &missing, None, &BufferedSink::new()).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }
}
