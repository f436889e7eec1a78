//! File-based logging configuration.
//!
//! When enabled via `LOOM_FILE_LOGGING`, logs are written to rotating
//! daily JSON files in addition to console output. The system-log tab
//! renders this stream.
//!
//! - `LOOM_FILE_LOGGING`: "true" or "1" enables file logging
//! - `LOOM_LOG_DIR`: override the default log directory
//! - `LOOM_LOG_MAX_FILES`: daily files to retain (default: 7)

use std::path::PathBuf;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};
use utils::assets::asset_dir;

#[derive(Debug, Clone)]
pub struct FileLoggingConfig {
    pub enabled: bool,
    pub log_dir: PathBuf,
    pub max_files: usize,
}

impl Default for FileLoggingConfig {
    fn default() -> Self {
        let enabled = std::env::var("LOOM_FILE_LOGGING")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        let log_dir = std::env::var("LOOM_LOG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| asset_dir().join("logs"));

        let max_files = std::env::var("LOOM_LOG_MAX_FILES")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(7);

        Self {
            enabled,
            log_dir,
            max_files,
        }
    }
}

/// Initialize the logging system with optional file output.
///
/// Returns a guard that must be held for the lifetime of the
/// application so remaining logs are flushed on shutdown.
pub fn init_logging(log_level: &str) -> Option<WorkerGuard> {
    let config = FileLoggingConfig::default();

    let filter_string = format!(
        "warn,server={level},services={level},db={level},utils={level}",
        level = log_level
    );
    let env_filter = EnvFilter::try_new(&filter_string).expect("Failed to create tracing filter");

    let console_layer = tracing_subscriber::fmt::layer().with_filter(env_filter);

    if config.enabled {
        if let Err(e) = std::fs::create_dir_all(&config.log_dir) {
            eprintln!("Failed to create log directory {:?}: {}", config.log_dir, e);
            tracing_subscriber::registry().with(console_layer).init();
            return None;
        }

        let file_appender = tracing_appender::rolling::daily(&config.log_dir, "loom.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        let file_filter = EnvFilter::try_new(&filter_string).expect("Failed to create file filter");
        let file_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_writer(non_blocking)
            .with_filter(file_filter);

        tracing_subscriber::registry()
            .with(console_layer)
            .with(file_layer)
            .init();

        tracing::info!(
            log_dir = ?config.log_dir,
            max_files = config.max_files,
            "File logging enabled"
        );

        spawn_log_cleanup(config.log_dir, config.max_files);
        Some(guard)
    } else {
        tracing_subscriber::registry().with(console_layer).init();
        None
    }
}

/// Prune daily log files beyond the retention count.
fn spawn_log_cleanup(log_dir: PathBuf, max_files: usize) {
    tokio::spawn(async move {
        let result = tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            let mut logs: Vec<_> = std::fs::read_dir(&log_dir)?
                .filter_map(|e| e.ok())
                .filter(|e| {
                    e.file_name()
                        .to_string_lossy()
                        .starts_with("loom.log")
                })
                .collect();
            logs.sort_by_key(|e| e.file_name());
            while logs.len() > max_files {
                let oldest = logs.remove(0);
                std::fs::remove_file(oldest.path())?;
            }
            Ok(())
        })
        .await;
        if let Ok(Err(e)) = result {
            tracing::warn!(error = %e, "Log cleanup failed");
        }
    });
}
