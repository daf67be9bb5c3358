//! Logging initialization for the schmux daemon.
//!
//! Daemon mode writes to a timestamped file under the log directory;
//! anything else logs to stderr. `RUST_LOG` overrides the level either way.

use anyhow::Result;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;

/// Keep this alive for the duration of the program so buffered log lines
/// flush on shutdown.
pub struct LoggingHandle {
    pub _guard: Option<WorkerGuard>,
    pub log_file_path: Option<PathBuf>,
}

pub fn init_logging(config: &Config, daemon_mode: bool, debug_override: bool) -> Result<LoggingHandle> {
    let level = if debug_override { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| level.to_string()),
    );

    if daemon_mode {
        let logs_dir = config.logs_dir();
        std::fs::create_dir_all(&logs_dir)?;

        let timestamp = chrono::Utc::now().format("%Y%m%dT%H%M%SZ");
        let log_filename = format!("schmux-{timestamp}.log");
        let log_file_path = logs_dir.join(&log_filename);

        let file_appender = tracing_appender::rolling::never(&logs_dir, &log_filename);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_ansi(false)
                    .with_writer(non_blocking),
            )
            .init();

        Ok(LoggingHandle {
            _guard: Some(guard),
            log_file_path: Some(log_file_path),
        })
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .init();

        Ok(LoggingHandle {
            _guard: None,
            log_file_path: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_log_filename_format() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.logs_path = temp_dir.path().to_string_lossy().into_owned();

        let timestamp = chrono::Utc::now().format("%Y%m%dT%H%M%SZ");
        let log_file_path = config.logs_dir().join(format!("schmux-{timestamp}.log"));

        assert!(log_file_path.starts_with(temp_dir.path()));
        assert!(log_file_path.to_string_lossy().ends_with(".log"));
    }
}
