//! Logging setup, grounded in `set_up_logging()` in
//! `examples/original_source/lib/ssm/__init__.py`: a file handler at the
//! configured level, plus an optional stdout handler when `console` is
//! set. `examples/Treystu-SCMessenger/cli/src/main.rs` initializes
//! `tracing_subscriber` the same way at the binary's entry point; here we
//! additionally write to a logfile via `tracing-appender`, since the
//! Python original always logs to a file.

use std::path::Path;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LoggingConfig;

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("error configuring logging: {0}")]
    Io(#[from] std::io::Error),
}

/// Initializes the global tracing subscriber. Returns a `WorkerGuard` that
/// must be kept alive for the life of the process — dropping it flushes
/// and closes the non-blocking file writer.
pub fn init(config: &LoggingConfig) -> Result<tracing_appender::non_blocking::WorkerGuard, LoggingError> {
    let dir = config
        .logfile
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let file_name = config
        .logfile
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "ssm.log".to_string());

    let file_appender = tracing_appender::rolling::never(dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = EnvFilter::try_new(&config.level)
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = fmt::layer().with_writer(non_blocking).with_ansi(false);

    let registry = tracing_subscriber::registry().with(env_filter).with(file_layer);

    if config.console {
        let console_layer = fmt::layer().with_writer(std::io::stdout);
        registry.with(console_layer).init();
    } else {
        registry.init();
    }

    Ok(guard)
}
