//! Logging for download runs.
//!
//! The console shows run progress at the chosen level. Per-peer chatter
//! (connection failures, worker exits) is capped at `error` unless the user
//! asks for `debug` or `trace`, since a healthy swarm routinely loses peers.
//! A full trace, including per-peer span timings, always goes to
//! `<logs_dir>/shoal-last-run.log`.

use std::fs::{File, create_dir_all};
use std::path::{Path, PathBuf};

use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{EnvFilter, Layer, fmt};

/// Name of the trace file written on every run.
pub const LOG_FILE_NAME: &str = "shoal-last-run.log";

/// Modules whose per-peer events are quieted on the console.
const PEER_TARGETS: [&str; 2] = [
    "shoal_core::torrent::peer_connection",
    "shoal_core::torrent::worker",
];

#[derive(Debug, thiserror::Error)]
pub enum TracingError {
    #[error("Cannot create logs directory {path}: {source}")]
    LogsDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Cannot open log file {path}: {source}")]
    LogFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("A global subscriber is already installed")]
    AlreadyInitialized(#[from] TryInitError),
}

/// Installs the console and trace-file subscribers.
///
/// `RUST_LOG` replaces the console filter entirely when set. Returns the path
/// of the trace file.
///
/// # Errors
///
/// - `TracingError::LogsDir` / `TracingError::LogFile` - Trace file could not be prepared
/// - `TracingError::AlreadyInitialized` - Called twice in one process
pub fn init_tracing(
    console_level: CliLogLevel,
    logs_dir: Option<&Path>,
) -> Result<PathBuf, TracingError> {
    let logs_path = logs_dir.unwrap_or_else(|| Path::new("logs"));
    create_dir_all(logs_path).map_err(|source| TracingError::LogsDir {
        path: logs_path.to_path_buf(),
        source,
    })?;

    let log_file_path = logs_path.join(LOG_FILE_NAME);
    let log_file = File::create(&log_file_path).map_err(|source| TracingError::LogFile {
        path: log_file_path.clone(),
        source,
    })?;

    let console_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(console_directives(console_level)));
    let console_layer = fmt::layer()
        .with_target(false)
        .compact()
        .with_filter(console_filter);

    let file_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(false)
        .with_writer(log_file)
        .with_filter(EnvFilter::new("trace"));

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .try_init()?;

    tracing::debug!(
        "Logging to console at {console_level}, full trace in {}",
        log_file_path.display()
    );
    Ok(log_file_path)
}

/// Console filter used when `RUST_LOG` is not set.
pub fn console_directives(level: CliLogLevel) -> String {
    match level {
        CliLogLevel::Debug | CliLogLevel::Trace | CliLogLevel::Error => level.to_string(),
        CliLogLevel::Warn | CliLogLevel::Info => {
            let mut directives = level.to_string();
            for target in PEER_TARGETS {
                directives.push_str(&format!(",{target}=error"));
            }
            directives
        }
    }
}

/// Console verbosity accepted by `--log-level`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum CliLogLevel {
    Error,
    Warn,
    /// Run start, progress, and outcome
    Info,
    /// Adds per-peer connection and worker events
    Debug,
    /// Adds every wire message
    Trace,
}

impl CliLogLevel {
    pub fn as_tracing_level(self) -> Level {
        match self {
            CliLogLevel::Error => Level::ERROR,
            CliLogLevel::Warn => Level::WARN,
            CliLogLevel::Info => Level::INFO,
            CliLogLevel::Debug => Level::DEBUG,
            CliLogLevel::Trace => Level::TRACE,
        }
    }
}

impl std::fmt::Display for CliLogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Lowercase so the name doubles as an EnvFilter directive.
        let name = self.as_tracing_level().as_str().to_lowercase();
        f.write_str(&name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_info_console_quiets_peer_targets() {
        let directives = console_directives(CliLogLevel::Info);
        assert_eq!(
            directives,
            "info,shoal_core::torrent::peer_connection=error,shoal_core::torrent::worker=error"
        );
        assert!(EnvFilter::try_new(&directives).is_ok());
    }

    #[test]
    fn test_debug_console_shows_everything() {
        assert_eq!(console_directives(CliLogLevel::Debug), "debug");
        assert_eq!(console_directives(CliLogLevel::Trace), "trace");
        assert_eq!(console_directives(CliLogLevel::Error), "error");
    }

    #[test]
    fn test_levels_map_to_tracing() {
        assert_eq!(CliLogLevel::Warn.as_tracing_level(), Level::WARN);
        assert_eq!(CliLogLevel::Warn.to_string(), "warn");
    }

    #[test]
    fn test_unwritable_logs_dir_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"").unwrap();

        let error = init_tracing(CliLogLevel::Info, Some(&blocker.join("logs"))).unwrap_err();
        assert!(matches!(error, TracingError::LogsDir { .. }));
    }
}
