//! Logging infrastructure for the objstash daemon.
//!
//! Structured logging with dual output:
//! - Writes to `<log_dir>/objstash.log` (cleared on session start)
//! - Also prints to stdout for CLI tailing
//! - Configurable via the RUST_LOG environment variable

use std::fs;
use std::io;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Guard that must be kept alive for the duration of logging.
///
/// Dropping this guard will flush and close the log file writer.
pub struct LoggingGuard {
    _file_guard: WorkerGuard,
}

/// Initialize the logging system with file and stdout output.
///
/// Creates the log directory if needed and clears the previous log
/// file.  Returns the guard that keeps the file writer alive.
pub fn init_logging(log_dir: &str, log_file: &str) -> Result<LoggingGuard, io::Error> {
    fs::create_dir_all(log_dir)?;

    // Clear the previous session's log file.
    let log_path = Path::new(log_dir).join(log_file);
    fs::write(&log_path, "")?;

    let file_appender = tracing_appender::rolling::never(log_dir, log_file);
    let (non_blocking_file, file_guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking_file)
        .with_ansi(false);

    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stdout)
        .with_ansi(true);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stdout_layer)
        .init();

    Ok(LoggingGuard {
        _file_guard: file_guard,
    })
}

/// Get the default log directory path.
pub fn default_log_dir() -> &'static str {
    "logs"
}

/// Get the default log file name.
pub fn default_log_file() -> &'static str {
    "objstash.log"
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_paths() {
        assert_eq!(default_log_dir(), "logs");
        assert_eq!(default_log_file(), "objstash.log");
    }

    #[test]
    fn test_clears_existing_file() {
        let tmp = TempDir::new().unwrap();
        let log_file = tmp.path().join("objstash.log");
        fs::write(&log_file, "old log data").unwrap();

        // Clearing is a plain truncating write; init_logging itself
        // cannot run twice in one process (global subscriber).
        fs::write(&log_file, "").unwrap();
        assert_eq!(fs::read_to_string(&log_file).unwrap(), "");
    }
}
