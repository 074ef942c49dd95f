use crate::config::Targets;
use crate::error::DeployError;
use crate::manifest::ModKind;
use anyhow::Result;
use std::path::{Path, PathBuf};

/// One graphics sub-route: any needle in the lowercased display name
/// selects `subfolder`. Rules are tried in order; first match wins.
struct GraphicsRule {
    needles: &'static [&'static str],
    subfolder: &'static str,
}

const GRAPHICS_RULES: &[GraphicsRule] = &[
    GraphicsRule {
        needles: &["kit"],
        subfolder: "kits",
    },
    GraphicsRule {
        needles: &["face", "portrait"],
        subfolder: "faces",
    },
    GraphicsRule {
        needles: &["logo", "badge"],
        subfolder: "logos",
    },
];

pub fn graphics_subfolder(display_name: &str) -> Option<&'static str> {
    let name = display_name.to_lowercase();
    GRAPHICS_RULES
        .iter()
        .find(|rule| rule.needles.iter().any(|needle| name.contains(needle)))
        .map(|rule| rule.subfolder)
}

/// Install root for a mod. An explicit override always wins.
pub fn resolve(
    kind: &ModKind,
    display_name: &str,
    install_path: Option<&Path>,
    targets: &Targets,
) -> Result<PathBuf> {
    if let Some(path) = install_path {
        return Ok(path.to_path_buf());
    }

    let root = match kind {
        ModKind::Ui | ModKind::Bundle => targets
            .game_target
            .clone()
            .ok_or(DeployError::NoTargetRoot)?,
        ModKind::Tactics => targets.user_dir.join("tactics"),
        ModKind::Graphics => {
            let graphics = targets.user_dir.join("graphics");
            match graphics_subfolder(display_name) {
                Some(sub) => graphics.join(sub),
                None => graphics,
            }
        }
        ModKind::Misc | ModKind::Other(_) => targets.user_dir.clone(),
    };
    Ok(root)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn targets(game: Option<&str>) -> Targets {
        Targets {
            game_target: game.map(PathBuf::from),
            user_dir: PathBuf::from("/user/fm"),
        }
    }

    #[test]
    fn bundles_go_to_game_target() {
        let root = resolve(&ModKind::Ui, "Skin", None, &targets(Some("/game/aa"))).unwrap();
        assert_eq!(root, PathBuf::from("/game/aa"));
        let root = resolve(&ModKind::Bundle, "x", None, &targets(Some("/game/aa"))).unwrap();
        assert_eq!(root, PathBuf::from("/game/aa"));
    }

    #[test]
    fn bundles_without_target_fail() {
        let err = resolve(&ModKind::Bundle, "x", None, &targets(None)).unwrap_err();
        assert_eq!(
            err.downcast_ref::<DeployError>(),
            Some(&DeployError::NoTargetRoot)
        );
    }

    #[test]
    fn user_dir_routes() {
        let t = targets(None);
        assert_eq!(
            resolve(&ModKind::Tactics, "4-2-3-1", None, &t).unwrap(),
            PathBuf::from("/user/fm/tactics")
        );
        assert_eq!(
            resolve(&ModKind::Misc, "db", None, &t).unwrap(),
            PathBuf::from("/user/fm")
        );
        assert_eq!(
            resolve(&ModKind::Other("skins".into()), "db", None, &t).unwrap(),
            PathBuf::from("/user/fm")
        );
    }

    #[test]
    fn graphics_rule_table() {
        let t = targets(None);
        let route = |name: &str| resolve(&ModKind::Graphics, name, None, &t).unwrap();
        assert_eq!(route("Retro Kits 2026"), PathBuf::from("/user/fm/graphics/kits"));
        assert_eq!(route("Cut-out Portraits"), PathBuf::from("/user/fm/graphics/faces"));
        assert_eq!(route("FaceKit Megapack"), PathBuf::from("/user/fm/graphics/kits"));
        assert_eq!(route("Club BADGES"), PathBuf::from("/user/fm/graphics/logos"));
        assert_eq!(route("Stadiums"), PathBuf::from("/user/fm/graphics"));
    }

    #[test]
    fn override_is_verbatim() {
        let root = resolve(
            &ModKind::Ui,
            "x",
            Some(Path::new("/elsewhere")),
            &targets(None),
        )
        .unwrap();
        assert_eq!(root, PathBuf::from("/elsewhere"));
    }
}
