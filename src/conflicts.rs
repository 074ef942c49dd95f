use crate::{fsops, game::Platform, manifest};
use anyhow::{Context, Result};
use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    path::Path,
};
use tracing::debug;

/// Declared target subpath -> names of the mods that write it.
pub type ConflictIndex = BTreeMap<String, BTreeSet<String>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictEntry {
    pub target_subpath: String,
    pub mods: Vec<String>,
    pub winner: String,
}

/// Directory names in the mod store, sorted.
pub fn store_mods(mods_dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    if !mods_dir.is_dir() {
        return Ok(names);
    }
    for entry in fs::read_dir(mods_dir).context("read mods dir")? {
        let entry = entry.context("read mods entry")?;
        if entry.file_type().map(|kind| kind.is_dir()).unwrap_or(false) {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();
    Ok(names)
}

/// Indexes the given mods, or the whole store when `names` is `None`.
/// Mods whose manifest cannot be loaded contribute nothing.
pub fn build(
    mods_dir: &Path,
    names: Option<&[String]>,
    platform: Platform,
) -> Result<ConflictIndex> {
    let candidates = match names {
        Some(names) => names.to_vec(),
        None => store_mods(mods_dir)?,
    };

    let mut index = ConflictIndex::new();
    for name in candidates {
        let manifest = match manifest::load(&mods_dir.join(&name)) {
            Ok(manifest) => manifest,
            Err(err) => {
                debug!(mod_name = %name, error = %err, "skip mod in conflict index");
                continue;
            }
        };
        for entry in &manifest.files {
            if !entry.applies_to(platform) {
                continue;
            }
            let Some(target) = entry.target() else {
                continue;
            };
            index
                .entry(normalize_key(target))
                .or_default()
                .insert(name.clone());
        }
    }
    Ok(index)
}

/// Keys claimed by more than one mod.
pub fn find_conflicts(index: &ConflictIndex) -> ConflictIndex {
    index
        .iter()
        .filter(|(_, mods)| mods.len() > 1)
        .map(|(key, mods)| (key.clone(), mods.clone()))
        .collect()
}

/// The mod that ends up on disk: the one latest in load order. Mods
/// missing from the order rank below all ranked ones.
pub fn winner<'a, I>(mods: I, load_order: &[String]) -> Option<&'a str>
where
    I: IntoIterator<Item = &'a String>,
{
    mods.into_iter()
        .max_by_key(|name| {
            let name: &'a String = *name;
            let rank = load_order.iter().position(|entry| entry == name);
            (rank, name.as_str())
        })
        .map(String::as_str)
}

pub fn report(conflicts: &ConflictIndex, load_order: &[String]) -> Vec<ConflictEntry> {
    conflicts
        .iter()
        .filter_map(|(key, mods)| {
            let winner = winner(mods, load_order)?.to_string();
            let mut ordered: Vec<String> = mods.iter().cloned().collect();
            ordered.sort_by_key(|name| load_order.iter().position(|entry| entry == name));
            Some(ConflictEntry {
                target_subpath: key.clone(),
                mods: ordered,
                winner,
            })
        })
        .collect()
}

fn normalize_key(target: &str) -> String {
    match fsops::safe_relative(target) {
        Some(rel) => fsops::to_manifest_path(&rel),
        None => target.trim().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{FileEntry, Manifest, ModKind};
    use tempfile::TempDir;

    fn add(mods_dir: &Path, name: &str, entries: Vec<FileEntry>) {
        let dir = mods_dir.join(name);
        fs::create_dir_all(&dir).unwrap();
        let mut manifest = Manifest::new(name, ModKind::Ui);
        manifest.files = entries;
        manifest::write(&dir, &manifest).unwrap();
    }

    fn names(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn overlapping_targets_conflict() {
        let temp = TempDir::new().unwrap();
        add(temp.path(), "A", vec![FileEntry::new("x", "ui/panel.bundle")]);
        add(
            temp.path(),
            "B",
            vec![FileEntry::new("y", "./ui/panel.bundle"), FileEntry::new("z", "z")],
        );
        fs::create_dir_all(temp.path().join("broken")).unwrap();

        let index = build(temp.path(), None, Platform::Windows).unwrap();
        assert_eq!(index.len(), 2);
        let conflicts = find_conflicts(&index);
        assert_eq!(conflicts.len(), 1);
        let mods = &conflicts["ui/panel.bundle"];
        assert!(mods.contains("A") && mods.contains("B"));
    }

    #[test]
    fn platform_and_missing_targets_add_nothing() {
        let temp = TempDir::new().unwrap();
        add(temp.path(), "A", vec![FileEntry::new("x", "t").with_platform(Platform::Mac)]);
        let no_target = FileEntry {
            source: Some("q".into()),
            ..FileEntry::default()
        };
        add(temp.path(), "B", vec![FileEntry::new("x", "t"), no_target]);

        let index = build(temp.path(), None, Platform::Windows).unwrap();
        assert_eq!(index.len(), 1);
        assert!(find_conflicts(&index).is_empty());
    }

    #[test]
    fn named_subset_only() {
        let temp = TempDir::new().unwrap();
        add(temp.path(), "A", vec![FileEntry::new("x", "t")]);
        add(temp.path(), "B", vec![FileEntry::new("x", "t")]);
        let index = build(temp.path(), Some(&names(&["A", "ghost"])), Platform::Linux).unwrap();
        assert!(find_conflicts(&index).is_empty());
    }

    #[test]
    fn winner_is_latest_in_order() {
        let mods: BTreeSet<String> = names(&["A", "B", "C"]).into_iter().collect();
        assert_eq!(winner(&mods, &names(&["B", "A"])), Some("A"));
        assert_eq!(winner(&mods, &names(&["C"])), Some("C"));
        assert_eq!(winner(&mods, &[]), Some("C"));
    }

    #[test]
    fn report_orders_mods_and_names_winner() {
        let mut index = ConflictIndex::new();
        index.insert("t".into(), names(&["A", "B"]).into_iter().collect());
        let entries = report(&index, &names(&["B", "A"]));
        assert_eq!(
            entries,
            vec![ConflictEntry {
                target_subpath: "t".into(),
                mods: names(&["B", "A"]),
                winner: "A".into(),
            }]
        );
    }
}
