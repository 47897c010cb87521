//! Logging and tracing configuration
//!
//! The CLI logs to stderr so stdout stays clean for breakpoint hits and
//! `--json` output. With `--log-file` protocol traffic is also written to a
//! log file in the platform data directory.

use std::path::PathBuf;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use super::paths;

/// Initialize tracing for the CLI (stderr logging)
///
/// Logs are controlled by the `RUST_LOG` environment variable.
/// Default level is INFO for this crate, WARN for dependencies.
pub fn init_cli() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sc3dbg=info,warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .compact(),
        )
        .init();
}

/// Initialize tracing with a log file plus stderr
///
/// The file receives everything down to TRACE for this crate so every frame
/// sent and received is recorded. Falls back to [`init_cli`] if the log file
/// cannot be opened.
pub fn init_with_log_file() -> Option<PathBuf> {
    let Some(log_file) = log_file_path() else {
        init_cli();
        return None;
    };

    let opened = log_file
        .parent()
        .map(std::fs::create_dir_all)
        .transpose()
        .and_then(|_| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&log_file)
        });

    let file = match opened {
        Ok(file) => file,
        Err(e) => {
            eprintln!("Warning: Could not open log file: {}", e);
            init_cli();
            return None;
        }
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sc3dbg=trace,info"));

    let file_layer = fmt::layer()
        .with_writer(file)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .compact()
        .with_filter(EnvFilter::new("sc3dbg=info,warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(stderr_layer)
        .init();

    Some(log_file)
}

/// Get the path to the CLI log file
pub fn log_file_path() -> Option<PathBuf> {
    paths::log_dir().map(|d| d.join("sc3dbg.log"))
}
