use crate::fsops;
use anyhow::{Context, Result};
use std::{
    fs,
    path::Path,
    sync::Mutex,
    time::SystemTime,
};
use tracing_appender::{non_blocking::WorkerGuard, rolling};
use tracing_subscriber::{
    filter::LevelFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer,
};

pub const LOG_PREFIX: &str = "modwarden";
pub const LOG_RETENTION: usize = 10;

/// Receiver for the human-readable progress stream of an operation.
pub trait LogSink {
    fn line(&self, message: &str);
}

impl<F> LogSink for F
where
    F: Fn(&str),
{
    fn line(&self, message: &str) {
        self(message)
    }
}

/// Forwards every line to `tracing` at info level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn line(&self, message: &str) {
        tracing::info!(target: "modwarden::progress", "{message}");
    }
}

/// Prints each line to stdout and mirrors it into the log file.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleSink;

impl LogSink for ConsoleSink {
    fn line(&self, message: &str) {
        println!("{message}");
        tracing::info!(target: "modwarden::progress", "{message}");
    }
}

/// Collects lines in memory, e.g. for a log pane or for tests.
#[derive(Debug, Default)]
pub struct BufferedSink {
    lines: Mutex<Vec<String>>,
}

impl BufferedSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.lines().iter().any(|line| line.contains(needle))
    }
}

impl LogSink for BufferedSink {
    fn line(&self, message: &str) {
        self.lines
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(message.to_string());
    }
}

/// Installs the global subscriber: daily rolling file plus warnings on stderr.
/// The returned guard must live until exit so the file writer flushes.
pub fn init(logs_dir: &Path, verbose: bool) -> Result<WorkerGuard> {
    fs::create_dir_all(logs_dir)
        .with_context(|| format!("create log directory {}", logs_dir.display()))?;
    cleanup_old_logs(logs_dir, LOG_RETENTION);

    let file_appender = rolling::daily(logs_dir, LOG_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let default_level = if verbose { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true)
        .with_file(true)
        .with_line_number(true);
    let stderr_level = if verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::WARN
    };
    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(stderr_level);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stderr_layer)
        .try_init()
        .context("install tracing subscriber")?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        os = std::env::consts::OS,
        arch = std::env::consts::ARCH,
        "logging initialized"
    );
    Ok(guard)
}

/// Removes all but the `keep` newest log files. Best-effort.
pub fn cleanup_old_logs(logs_dir: &Path, keep: usize) -> usize {
    let Ok(read) = fs::read_dir(logs_dir) else {
        return 0;
    };
    let mut logs: Vec<(SystemTime, std::path::PathBuf)> = read
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().to_string_lossy().starts_with(LOG_PREFIX))
        .filter_map(|entry| {
            let meta = entry.metadata().ok()?;
            if !meta.is_file() {
                return None;
            }
            Some((meta.modified().unwrap_or(SystemTime::UNIX_EPOCH), entry.path()))
        })
        .collect();
    logs.sort_by(|a, b| b.cmp(a));
    fsops::best_effort(logs.into_iter().skip(keep).map(|(_, path)| path), |path| {
        fs::remove_file(path)
    })
}
