//! Tracing setup for aitrack
//!
//! Delivery activity is written to a daily-rotated file in the XDG state
//! directory (`aitrack.log.YYYY-MM-DD`). Only aitrack's own crates log at the
//! configured level; everything else (hyper, reqwest, rustls) is held at
//! `warn`. `RUST_LOG` replaces the whole filter when set.

use crate::config::{Config, LoggingConfig};
use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    filter::LevelFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

/// File name prefix of every rotated log file
pub const LOG_FILE_PREFIX: &str = "aitrack.log";

const OWN_TARGETS: &[&str] = &["aitrack", "aitrack_core"];

/// Keeps the background log writer alive; pending lines are flushed on drop
pub struct LoggingGuard {
    _worker: tracing_appender::non_blocking::WorkerGuard,
}

/// Filter directives for a level name: our crates at `level`, the rest at `warn`
pub fn directives(level: &str) -> Result<String> {
    let level = LevelFilter::from_str(level.trim())
        .map_err(|_| Error::Config(format!("invalid log level {:?}", level)))?;
    let level = level.to_string().to_lowercase();
    let mut directives = String::from("warn");
    for target in OWN_TARGETS {
        directives.push_str(&format!(",{}={}", target, level));
    }
    Ok(directives)
}

fn build_filter(level: &str) -> Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(directives(level)?)
        .map_err(|e| Error::Config(format!("invalid log filter: {}", e)))
}

/// Install the global subscriber writing to the state directory.
///
/// `level_override` (the CLI's `--verbose`) takes precedence over the
/// configured level. Old files beyond `max_files` are pruned on rotation.
pub fn init(config: &LoggingConfig, level_override: Option<&str>) -> Result<LoggingGuard> {
    let level = level_override.unwrap_or(&config.level);
    let filter = build_filter(level)?;

    let dir = Config::state_dir();
    std::fs::create_dir_all(&dir)?;
    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .max_log_files(config.max_files.max(1))
        .build(&dir)
        .map_err(|e| Error::Config(format!("cannot open log file in {}: {}", dir.display(), e)))?;
    let (writer, worker) = tracing_appender::non_blocking(appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true)
                .with_line_number(true),
        )
        .try_init()
        .map_err(|e| Error::Config(format!("logging already initialized: {}", e)))?;

    tracing::info!(dir = %dir.display(), level, "Logging initialized");
    Ok(LoggingGuard { _worker: worker })
}

/// Route logs through the test harness. Safe to call from every test.
pub fn init_test() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,aitrack_core=debug"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

/// Most recent rotated log file in `dir`, if any has been written
pub fn latest_log_file(dir: &Path) -> Option<PathBuf> {
    std::fs::read_dir(dir)
        .ok()?
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.starts_with(LOG_FILE_PREFIX))
        })
        .map(|entry| entry.path())
        .max()
}
