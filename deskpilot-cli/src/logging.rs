use anyhow::Result;
use std::env;
use std::path::{Path, PathBuf};
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Stderr plus a daily rolling file under `default_dir` (or
/// `DESKPILOT_LOG_DIR`). Level comes from `LOG_LEVEL`; `RUST_LOG`
/// directives are honoured on top.
///
/// Keep the returned guard alive for the life of the process or buffered
/// file output is lost.
pub fn init_logging(default_dir: &Path) -> Result<Option<WorkerGuard>> {
    let log_level = env::var("LOG_LEVEL")
        .map(|level| match level.to_lowercase().as_str() {
            "error" => Level::ERROR,
            "warn" => Level::WARN,
            "info" => Level::INFO,
            "debug" => Level::DEBUG,
            "trace" => Level::TRACE,
            _ => Level::INFO,
        })
        .unwrap_or(Level::INFO);

    let filter = EnvFilter::from_default_env().add_directive(log_level.into());
    let stderr_layer = fmt::layer().with_writer(std::io::stderr).with_ansi(false);

    let log_dir = env::var("DESKPILOT_LOG_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| default_dir.to_path_buf());

    let appender = std::fs::create_dir_all(&log_dir)
        .map_err(anyhow::Error::from)
        .and_then(|_| {
            RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .filename_prefix("deskpilot")
                .filename_suffix("log")
                .build(&log_dir)
                .map_err(anyhow::Error::from)
        });

    match appender {
        Ok(appender) => {
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file_layer = fmt::layer().with_writer(writer).with_ansi(false);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .with(file_layer)
                .try_init()?;
            Ok(Some(guard))
        }
        Err(e) => {
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .try_init()?;
            tracing::warn!("File logging disabled ({}): {e}", log_dir.display());
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_dropping_guard_flushes_file_log() {
        let dir = TempDir::new().unwrap();
        let guard = init_logging(dir.path()).unwrap();
        assert!(guard.is_some());
        tracing::warn!("flush check line");
        drop(guard);

        let written: String = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|entry| fs::read_to_string(entry.unwrap().path()).ok())
            .collect();
        assert!(written.contains("flush check line"));
    }
}
