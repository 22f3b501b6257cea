use std::path::Path;

use anyhow::{Context, anyhow};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    Layer,
    filter::{LevelFilter, Targets},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

#[macro_export]
macro_rules! dual_error {
    ($($arg:tt)*) => {
        tracing::error!(target: "stdout", $($arg)*);
        tracing::error!(target: "file", $($arg)*);
    };
}

#[macro_export]
macro_rules! dual_warn {
    ($($arg:tt)*) => {
        tracing::warn!(target: "stdout", $($arg)*);
        tracing::warn!(target: "file", $($arg)*);
    };
}

#[macro_export]
macro_rules! dual_info {
    ($($arg:tt)*) => {
        tracing::info!(target: "stdout", $($arg)*);
        tracing::info!(target: "file", $($arg)*);
    };
}

#[macro_export]
macro_rules! dual_debug {
    ($($arg:tt)*) => {
        tracing::debug!(target: "stdout", $($arg)*);
        tracing::debug!(target: "file", $($arg)*);
    };
}

/// Install the stdout logger and, when `log_file` is given, a non-blocking file logger.
///
/// The returned guard flushes the file writer on drop and must outlive the server.
pub(crate) fn init_logging(log_level: &str, log_file: Option<&Path>) -> anyhow::Result<Option<WorkerGuard>> {
    let level: LevelFilter = log_level
        .parse()
        .map_err(|e| anyhow!("Invalid log level '{log_level}': {e}"))?;

    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_filter(Targets::new().with_target("stdout", level));

    let registry = tracing_subscriber::registry().with(stdout_layer);

    match log_file {
        Some(path) => {
            let directory = path
                .parent()
                .filter(|dir| !dir.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let file_name = path
                .file_name()
                .with_context(|| format!("Invalid log file path: {}", path.display()))?;
            std::fs::create_dir_all(directory)
                .with_context(|| format!("Failed to create log directory {}", directory.display()))?;

            let file_appender = tracing_appender::rolling::never(directory, file_name);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

            let file_layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false)
                .with_filter(Targets::new().with_target("file", level));

            registry.with(file_layer).try_init()?;
            Ok(Some(guard))
        }
        None => {
            registry.try_init()?;
            Ok(None)
        }
    }
}
