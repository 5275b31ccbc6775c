//! Logging initialization and configuration.
//!
//! This module provides environment-aware logging setup:
//! - **Production**: JSON logs to rolling files + compact logs to stdout
//! - **Development**: Pretty logs to stdout with file and line info

use std::path::PathBuf;
use std::sync::OnceLock;

use scanbridge_core::LoggingConfig;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Environment variable overriding the configured level.
pub const LOG_LEVEL_ENV: &str = "SCANBRIDGE_LOG_LEVEL";

/// Static guards to keep non-blocking writers alive.
/// These must persist for the lifetime of the program.
static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();
static STDOUT_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Initialize the logging system from the `logging` section of the config.
///
/// The filter comes from `RUST_LOG` if set, then `SCANBRIDGE_LOG_LEVEL`,
/// then `config.level`.
///
/// # Production Mode
///
/// - Logs to rolling daily files in the log directory
/// - Also logs to stdout for systemd journal capture
/// - JSON format for structured logging in files
/// - Compact format for stdout (no ANSI colors)
///
/// # Development Mode
///
/// - Logs to stdout only with pretty formatting
/// - ANSI colors enabled
///
/// # Errors
///
/// Returns an error if the env filter cannot be parsed.
pub fn init(config: &LoggingConfig) -> anyhow::Result<()> {
    let env_filter = build_filter(config)?;

    if config.production {
        init_production(env_filter, log_directory(config));
    } else {
        init_development(env_filter);
    }

    Ok(())
}

fn filter_directive(config: &LoggingConfig) -> String {
    std::env::var(LOG_LEVEL_ENV).unwrap_or_else(|_| config.level.clone())
}

fn build_filter(config: &LoggingConfig) -> anyhow::Result<EnvFilter> {
    let directive = filter_directive(config);
    Ok(EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&directive))?)
}

/// Initialize production logging with file + stdout output.
fn init_production(env_filter: EnvFilter, log_dir: PathBuf) {
    if !log_dir.exists() {
        std::fs::create_dir_all(&log_dir).ok();
    }

    // Rolling file appender - creates new file daily
    let file_appender = RollingFileAppender::new(Rotation::DAILY, &log_dir, "scanbridge");
    let (non_blocking_file, file_guard) = tracing_appender::non_blocking(file_appender);
    let (non_blocking_stdout, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());

    let file_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking_file)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    // No ANSI colors for journald
    let stdout_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_writer(non_blocking_stdout)
        .with_target(true)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stdout_layer)
        .init();

    let _ = FILE_GUARD.set(file_guard);
    let _ = STDOUT_GUARD.set(stdout_guard);
}

/// Initialize development logging with pretty stdout output.
fn init_development(env_filter: EnvFilter) {
    let stdout_layer = tracing_subscriber::fmt::layer()
        .pretty()
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .init();
}

/// Returns the log directory: the configured one, else a platform default.
#[must_use]
pub fn log_directory(config: &LoggingConfig) -> PathBuf {
    if let Some(dir) = &config.directory {
        return dir.clone();
    }
    #[cfg(target_os = "linux")]
    {
        PathBuf::from("/var/log/scanbridge")
    }
    #[cfg(not(target_os = "linux"))]
    {
        directories::ProjectDirs::from("", "", "scanbridge")
            .map_or_else(|| PathBuf::from("./logs"), |dirs| dirs.data_dir().join("logs"))
    }
}
