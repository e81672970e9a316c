use anyhow::Result;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

use tagrelay_config::TelemetryConfig;

const LOG_FILE_PREFIX: &str = "tagrelay.log";

/// `RUST_LOG` when set and valid, otherwise the configured level.
pub(crate) fn filter_for(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber. Keep the returned guard alive for as long
/// as the file writer should flush.
pub(crate) fn init(config: &TelemetryConfig) -> Result<Option<WorkerGuard>> {
    let stderr = fmt::layer().with_writer(std::io::stderr).with_target(false);

    let (file, guard) = match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(fmt::layer().with_ansi(false).with_writer(writer)), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter_for(&config.log_level))
        .with(stderr)
        .with(file)
        .try_init()?;
    Ok(guard)
}

/// The worker's stdout is its message channel, so it only ever logs to stderr.
pub(crate) fn init_worker(level: &str) -> Result<()> {
    tracing_subscriber::registry()
        .with(filter_for(level))
        .with(fmt::layer().with_writer(std::io::stderr).with_ansi(false))
        .try_init()?;
    Ok(())
}
