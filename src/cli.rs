use crate::{
    config::{self, AppConfig, Layout},
    engine::Engine,
    game::{self, Platform},
    logging::{self, ConsoleSink, LogSink, TracingSink},
};
use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::path::PathBuf;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputFormat {
    Text,
    Json,
}

impl OutputFormat {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "json" => Some(OutputFormat::Json),
            "text" => Some(OutputFormat::Text),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct GlobalOptions {
    format: Option<OutputFormat>,
    verbose: bool,
    force: bool,
    allow_conflicts: bool,
    data_dir: Option<PathBuf>,
}

impl GlobalOptions {
    fn format(&self) -> OutputFormat {
        self.format.unwrap_or(OutputFormat::Text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum TargetArg {
    Show,
    Detect,
    Set(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum CliCommand {
    List,
    Info(String),
    Preview(String),
    Enable(String),
    Disable(String),
    Deploy(String),
    Undeploy(String),
    Remove(String),
    Import { path: PathBuf, name: Option<String> },
    Order(Vec<String>),
    Up(String),
    Down(String),
    Conflicts,
    Apply,
    RestorePoints,
    Rollback(String),
    Target(TargetArg),
    UserDir(Option<PathBuf>),
    Help,
    Version,
}

pub fn run() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let (global, command) = parse_args(&args)?;
    match command {
        CliCommand::Help => {
            print_help();
            Ok(())
        }
        CliCommand::Version => {
            println!("modwarden v{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        command => {
            let mut session = Session::open(&global)?;
            session.run(command)
        }
    }
}

fn parse_args(args: &[String]) -> Result<(GlobalOptions, CliCommand)> {
    let mut global = GlobalOptions::default();
    let mut tokens = Vec::new();
    let mut name = None;
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--json" => global.format = Some(OutputFormat::Json),
            "--format" => {
                let value = iter.next().context("--format requires a value")?;
                global.format = Some(
                    OutputFormat::parse(value)
                        .with_context(|| format!("unknown format: {value}"))?,
                );
            }
            value if value.starts_with("--format=") => {
                let value = value.trim_start_matches("--format=");
                global.format = Some(
                    OutputFormat::parse(value)
                        .with_context(|| format!("unknown format: {value}"))?,
                );
            }
            "-v" | "--verbose" => global.verbose = true,
            "-f" | "--force" => global.force = true,
            "--allow-conflicts" => global.allow_conflicts = true,
            "--data-dir" => {
                let value = iter.next().context("--data-dir requires a path")?;
                global.data_dir = Some(PathBuf::from(value));
            }
            "--name" => {
                let value = iter.next().context("--name requires a value")?;
                name = Some(value.to_string());
            }
            value if value.starts_with("--name=") => {
                name = Some(value.trim_start_matches("--name=").to_string());
            }
            "-h" | "--help" => return Ok((global, CliCommand::Help)),
            "-V" | "--version" => return Ok((global, CliCommand::Version)),
            _ => tokens.push(arg.to_string()),
        }
    }

    let Some((head, rest)) = tokens.split_first() else {
        return Ok((global, CliCommand::Help));
    };
    let one = |what: &str| -> Result<String> {
        match rest {
            [value] => Ok(value.clone()),
            [] => bail!("{head} requires {what}"),
            _ => bail!("{head} takes a single {what}"),
        }
    };

    let command = match head.as_str() {
        "list" | "ls" => CliCommand::List,
        "info" => CliCommand::Info(one("a mod name")?),
        "preview" => CliCommand::Preview(one("a mod name")?),
        "enable" => CliCommand::Enable(one("a mod name")?),
        "disable" => CliCommand::Disable(one("a mod name")?),
        "deploy" => CliCommand::Deploy(one("a mod name")?),
        "undeploy" => CliCommand::Undeploy(one("a mod name")?),
        "remove" | "rm" => CliCommand::Remove(one("a mod name")?),
        "import" => CliCommand::Import {
            path: PathBuf::from(one("a path")?),
            name,
        },
        "order" => CliCommand::Order(rest.to_vec()),
        "up" => CliCommand::Up(one("a mod name")?),
        "down" => CliCommand::Down(one("a mod name")?),
        "conflicts" => CliCommand::Conflicts,
        "apply" => CliCommand::Apply,
        "restore-points" => CliCommand::RestorePoints,
        "rollback" => CliCommand::Rollback(one("a restore point name")?),
        "target" => CliCommand::Target(match rest {
            [] => TargetArg::Show,
            [value] if value == "detect" => TargetArg::Detect,
            [value] => TargetArg::Set(PathBuf::from(value)),
            _ => bail!("target takes a single path or 'detect'"),
        }),
        "user-dir" => CliCommand::UserDir(match rest {
            [] => None,
            [value] => Some(PathBuf::from(value)),
            _ => bail!("user-dir takes a single path"),
        }),
        "help" => CliCommand::Help,
        "version" => CliCommand::Version,
        other => bail!("unknown command: {other} (see 'modwarden help')"),
    };
    Ok((global, command))
}

struct Session {
    global: GlobalOptions,
    layout: Layout,
    config: AppConfig,
    _guard: Option<WorkerGuard>,
}

#[derive(Serialize)]
struct ModRow {
    name: String,
    kind: String,
    version: String,
    enabled: bool,
    position: Option<usize>,
    files: usize,
}

#[derive(Serialize)]
struct ConflictRow<'a> {
    target_subpath: &'a str,
    mods: &'a [String],
    winner: &'a str,
}

#[derive(Serialize)]
struct RestorePointRow<'a> {
    name: &'a str,
    path: String,
}

impl Session {
    fn open(global: &GlobalOptions) -> Result<Self> {
        let data_dir = match &global.data_dir {
            Some(path) => path.clone(),
            None => config::base_data_dir()?,
        };
        let layout = Layout::new(data_dir);
        layout.ensure()?;
        let guard = match logging::init(&layout.logs_dir, global.verbose) {
            Ok(guard) => Some(guard),
            Err(err) => {
                eprintln!("warning: file logging disabled: {err:#}");
                None
            }
        };
        let config = AppConfig::load_or_create(&layout)?;
        Ok(Self {
            global: global.clone(),
            layout,
            config,
            _guard: guard,
        })
    }

    fn engine(&self) -> Result<Engine> {
        let config = self.config.engine_config(self.layout.clone())?;
        Ok(Engine::new(config, Platform::current()))
    }

    fn save(&self) -> Result<()> {
        self.config.save(&self.layout)
    }

    /// JSON output keeps stdout machine-readable, so progress goes to the log only.
    fn sink(&self) -> &'static dyn LogSink {
        match self.global.format() {
            OutputFormat::Json => &TracingSink,
            OutputFormat::Text => &ConsoleSink,
        }
    }

    fn preflight(&self) -> Result<()> {
        if !self.global.force && game::is_game_running() {
            bail!(
                "{} appears to be running; close it before changing mods (or pass --force)",
                game::GAME_NAME
            );
        }
        Ok(())
    }

    fn run(&mut self, command: CliCommand) -> Result<()> {
        info!(command = ?command, "run command");
        match command {
            CliCommand::List => self.list(),
            CliCommand::Info(name) => self.info(&name),
            CliCommand::Preview(name) => self.preview(&name),
            CliCommand::Enable(name) => {
                self.engine()?.manifest(&name)?;
                if self.config.enable(&name) {
                    println!("Enabled {name} (run 'apply' to deploy the enabled set)");
                } else {
                    println!("{name} is already enabled");
                }
                self.save()
            }
            CliCommand::Disable(name) => {
                if self.config.disable(&name) {
                    println!("Disabled {name} (run 'undeploy {name}' to remove its files)");
                } else {
                    println!("{name} was not enabled");
                }
                self.save()
            }
            CliCommand::Deploy(name) => {
                self.preflight()?;
                self.engine()?.enable_mod(&name, self.sink())?;
                self.config.enable(&name);
                self.save()
            }
            CliCommand::Undeploy(name) => {
                self.preflight()?;
                self.engine()?.disable_mod(&name, self.sink())?;
                self.config.disable(&name);
                self.save()
            }
            CliCommand::Remove(name) => {
                self.preflight()?;
                self.engine()?.remove_mod(&name, self.sink())?;
                self.config.forget(&name);
                self.save()
            }
            CliCommand::Import { path, name } => {
                self.preflight()?;
                let outcome =
                    self.engine()?
                        .install_from_source(&path, name.as_deref(), self.sink())?;
                self.config.ensure_in_order(&outcome.name);
                self.save()?;
                println!(
                    "Imported {} ({}, {} files{})",
                    outcome.name,
                    outcome.kind,
                    outcome.files,
                    if outcome.generated_manifest {
                        ", manifest generated"
                    } else {
                        ""
                    }
                );
                Ok(())
            }
            CliCommand::Order(names) => {
                if !names.is_empty() {
                    let known = self.engine()?.list_mods()?;
                    if let Some(unknown) = names.iter().find(|name| !known.contains(name)) {
                        bail!("not in the mod store: {unknown}");
                    }
                    self.config.set_order(&names);
                    self.save()?;
                }
                for (index, name) in self.config.load_order.iter().enumerate() {
                    let marker = if self.config.is_enabled(name) { "*" } else { " " };
                    println!("{:>3}. {marker} {name}", index + 1);
                }
                Ok(())
            }
            CliCommand::Up(name) => {
                if self.config.move_up(&name) {
                    println!("Moved up: {name}");
                }
                self.save()
            }
            CliCommand::Down(name) => {
                if self.config.move_down(&name) {
                    println!("Moved down: {name}");
                }
                self.save()
            }
            CliCommand::Conflicts => self.conflicts(),
            CliCommand::Apply => self.apply(),
            CliCommand::RestorePoints => self.restore_points(),
            CliCommand::Rollback(name) => {
                self.preflight()?;
                self.engine()?
                    .rollback_to_restore_point(&name, &self.config, self.sink())?;
                Ok(())
            }
            CliCommand::Target(arg) => self.target(arg),
            CliCommand::UserDir(path) => {
                if let Some(path) = path {
                    self.config.user_dir_path = Some(path);
                    self.save()?;
                }
                let engine = self.engine()?;
                println!("{}", engine.config().targets.user_dir.display());
                Ok(())
            }
            CliCommand::Help | CliCommand::Version => Ok(()),
        }
    }

    fn list(&self) -> Result<()> {
        let engine = self.engine()?;
        let mut rows = Vec::new();
        for name in engine.list_mods()? {
            let (kind, version, files) = match engine.manifest(&name) {
                Ok(manifest) => (
                    manifest.kind().to_string(),
                    manifest.version.clone(),
                    manifest.files.len(),
                ),
                Err(_) => ("?".to_string(), String::new(), 0),
            };
            rows.push(ModRow {
                enabled: self.config.is_enabled(&name),
                position: self.config.load_order.iter().position(|entry| entry == &name),
                name,
                kind,
                version,
                files,
            });
        }
        rows.sort_by(|a, b| {
            a.position
                .unwrap_or(usize::MAX)
                .cmp(&b.position.unwrap_or(usize::MAX))
                .then_with(|| a.name.cmp(&b.name))
        });

        match self.global.format() {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
            OutputFormat::Text => {
                if rows.is_empty() {
                    println!("No mods installed. Use 'modwarden import <path>'.");
                }
                for row in &rows {
                    let marker = if row.enabled { "*" } else { " " };
                    println!(
                        "{marker} {:<32} {:<9} {:<10} {} files",
                        row.name, row.kind, row.version, row.files
                    );
                }
            }
        }
        Ok(())
    }

    fn info(&self, name: &str) -> Result<()> {
        let manifest = self.engine()?.manifest(name)?;
        match self.global.format() {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&manifest)?),
            OutputFormat::Text => {
                println!("{} {}", manifest.name, manifest.version);
                println!("  type:        {}", manifest.kind());
                for (label, value) in [
                    ("author", &manifest.author),
                    ("description", &manifest.description),
                    ("homepage", &manifest.homepage),
                    ("license", &manifest.license),
                ] {
                    if !value.is_empty() {
                        println!("  {:<12} {value}", format!("{label}:"));
                    }
                }
                if let Some(path) = manifest.install_path() {
                    println!("  install to:  {}", path.display());
                }
                println!("  enabled:     {}", self.config.is_enabled(name));
                println!("  files:");
                for entry in &manifest.files {
                    let platform = entry
                        .platform
                        .as_deref()
                        .map(|tag| format!(" [{tag}]"))
                        .unwrap_or_default();
                    println!(
                        "    {} -> {}{platform}",
                        entry.source().unwrap_or("?"),
                        entry.target().unwrap_or("?")
                    );
                }
            }
        }
        Ok(())
    }

    fn preview(&self, name: &str) -> Result<()> {
        let preview = self.engine()?.preview_install(name)?;
        match self.global.format() {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&preview)?),
            OutputFormat::Text => {
                println!("{name} installs into {}", preview.root.display());
                for file in &preview.files {
                    println!("  {} -> {}", file.target_subpath, file.resolved_path.display());
                }
            }
        }
        Ok(())
    }

    fn conflicts(&self) -> Result<()> {
        let conflicts = self.engine()?.find_conflicts(&self.config)?;
        match self.global.format() {
            OutputFormat::Json => {
                let rows: Vec<ConflictRow<'_>> = conflicts
                    .iter()
                    .map(|entry| ConflictRow {
                        target_subpath: &entry.target_subpath,
                        mods: &entry.mods,
                        winner: &entry.winner,
                    })
                    .collect();
                println!("{}", serde_json::to_string_pretty(&rows)?);
            }
            OutputFormat::Text => {
                if conflicts.is_empty() {
                    println!("No file overlaps among enabled mods.");
                }
                for entry in &conflicts {
                    println!(
                        "{}: {} (winner: {})",
                        entry.target_subpath,
                        entry.mods.join(", "),
                        entry.winner
                    );
                }
            }
        }
        Ok(())
    }

    fn apply(&self) -> Result<()> {
        let engine = self.engine()?;
        let conflicts = engine.find_conflicts(&self.config)?;
        if !conflicts.is_empty() && !self.global.allow_conflicts {
            for entry in &conflicts {
                println!(
                    "conflict: {} <- {} (winner: {})",
                    entry.target_subpath,
                    entry.mods.join(", "),
                    entry.winner
                );
            }
            bail!(
                "found {} conflict(s) among enabled mods; resolve them or pass --allow-conflicts",
                conflicts.len()
            );
        }
        self.preflight()?;
        let report = engine.apply_enabled_in_order(&self.config, self.sink())?;
        if !report.failed.is_empty() {
            bail!("{} mod(s) failed to apply", report.failed.len());
        }
        Ok(())
    }

    fn restore_points(&self) -> Result<()> {
        let points = self.engine()?.list_restore_points()?;
        match self.global.format() {
            OutputFormat::Json => {
                let rows: Vec<RestorePointRow<'_>> = points
                    .iter()
                    .map(|point| RestorePointRow {
                        name: &point.name,
                        path: point.path.display().to_string(),
                    })
                    .collect();
                println!("{}", serde_json::to_string_pretty(&rows)?);
            }
            OutputFormat::Text => {
                if points.is_empty() {
                    println!("No restore points yet; one is created on every apply.");
                }
                for point in &points {
                    println!("{}", point.name);
                }
            }
        }
        Ok(())
    }

    fn target(&mut self, arg: TargetArg) -> Result<()> {
        match arg {
            TargetArg::Show => match &self.config.target_path {
                Some(path) => println!("{}", path.display()),
                None => println!(
                    "No target set. Use 'modwarden target detect' or 'modwarden target <path>'."
                ),
            },
            TargetArg::Detect => {
                let candidates = game::detect_target_candidates();
                let Some(first) = candidates.first() else {
                    bail!(
                        "could not detect a {} install; set it with 'modwarden target <path>'",
                        game::GAME_NAME
                    );
                };
                for candidate in &candidates {
                    println!("found: {}", candidate.display());
                }
                self.config.target_path = Some(first.clone());
                self.save()?;
                println!("Target set to {}", first.display());
            }
            TargetArg::Set(path) => {
                if !path.is_dir() {
                    bail!("target folder does not exist: {}", path.display());
                }
                self.config.target_path = Some(path.clone());
                self.save()?;
                println!("Target set to {}", path.display());
            }
        }
        Ok(())
    }
}

fn print_help() {
    println!("modwarden v{}", env!("CARGO_PKG_VERSION"));
    println!("Usage:");
    println!("  modwarden list                    List mods in the store (* = enabled)");
    println!("  modwarden info <mod>              Show a mod's manifest");
    println!("  modwarden preview <mod>           Show where a mod's files would be written");
    println!("  modwarden enable <mod>            Mark a mod enabled");
    println!("  modwarden disable <mod>           Mark a mod disabled");
    println!("  modwarden deploy <mod>            Copy a mod's files into place now");
    println!("  modwarden undeploy <mod>          Remove a mod's files and restore backups");
    println!("  modwarden remove <mod>            Undeploy and delete from the store");
    println!("  modwarden import <path>           Import a folder, .zip, .7z or single file");
    println!("  modwarden order [mods...]         Show or reorder the load order");
    println!("  modwarden up|down <mod>           Move a mod in the load order");
    println!("  modwarden conflicts               List overlapping files among enabled mods");
    println!("  modwarden apply                   Snapshot, then deploy enabled mods in order");
    println!("  modwarden restore-points          List restore points, newest first");
    println!("  modwarden rollback <name>         Roll the game folder back to a restore point");
    println!("  modwarden target [path|detect]    Show or set the game bundle folder");
    println!("  modwarden user-dir [path]         Show or set the user data folder");
    println!();
    println!("Options:");
    println!("  --name <name>                     Mod name for import");
    println!("  --format <json|text>, --json      Output format for list commands");
    println!("  -f, --force                       Skip the game-running check");
    println!("  --allow-conflicts                 Apply even when enabled mods overlap");
    println!("  --data-dir <path>                 Use another data folder (or set MODWARDEN_HOME)");
    println!("  -v, --verbose                     Debug logging");
    println!("  -h, --help                        Show help");
    println!("  -V, --version                     Show version");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn empty_args_show_help() {
        let (_, command) = parse_args(&[]).unwrap();
        assert_eq!(command, CliCommand::Help);
    }

    #[test]
    fn import_with_name_anywhere() {
        let (_, command) = parse_args(&args(&["--name", "Kits", "import", "/tmp/k.zip"])).unwrap();
        assert_eq!(
            command,
            CliCommand::Import {
                path: PathBuf::from("/tmp/k.zip"),
                name: Some("Kits".into())
            }
        );
    }

    #[test]
    fn global_flags() {
        let (global, command) =
            parse_args(&args(&["apply", "--force", "--allow-conflicts", "--json", "-v"])).unwrap();
        assert_eq!(command, CliCommand::Apply);
        assert!(global.force && global.allow_conflicts && global.verbose);
        assert_eq!(global.format(), OutputFormat::Json);
    }

    #[test]
    fn target_forms() {
        let parse = |values: &[&str]| parse_args(&args(values)).unwrap().1;
        assert_eq!(parse(&["target"]), CliCommand::Target(TargetArg::Show));
        assert_eq!(parse(&["target", "detect"]), CliCommand::Target(TargetArg::Detect));
        assert_eq!(
            parse(&["target", "/games/fm"]),
            CliCommand::Target(TargetArg::Set(PathBuf::from("/games/fm")))
        );
    }

    #[test]
    fn preview_takes_one_mod() {
        let (_, command) = parse_args(&args(&["preview", "Retro Kits"])).unwrap();
        assert_eq!(command, CliCommand::Preview("Retro Kits".into()));
        assert!(parse_args(&args(&["preview"])).is_err());
    }

    #[test]
    fn order_takes_many() {
        let (_, command) = parse_args(&args(&["order", "a", "b"])).unwrap();
        assert_eq!(command, CliCommand::Order(args(&["a", "b"])));
    }

    #[test]
    fn arity_errors() {
        assert!(parse_args(&args(&["enable"])).is_err());
        assert!(parse_args(&args(&["enable", "a", "b"])).is_err());
        assert!(parse_args(&args(&["frobnicate"])).is_err());
        assert!(parse_args(&args(&["--format", "yaml", "list"])).is_err());
    }
}
