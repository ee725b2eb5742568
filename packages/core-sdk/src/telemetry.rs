use std::path::Path;

use anyhow::Result;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::TelemetrySection;

/** \brief Log file prefix inside the log directory. */
pub const LOG_FILE_PREFIX: &str = "monky.log";

/**
 * \brief Installs the global tracing subscriber.
 * \details Console output is always on and filtered by `RUST_LOG` (default `info`).
 * When telemetry is enabled a daily-rolling file under `log_dir` receives the
 * same events; keep the returned guard alive or buffered lines are lost.
 */
pub fn init(settings: &TelemetrySection, log_dir: &Path) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console = fmt::layer().with_target(false);

    if !settings.enabled {
        tracing_subscriber::registry()
            .with(filter)
            .with(console)
            .try_init()?;
        return Ok(None);
    }

    if !log_dir.exists() {
        std::fs::create_dir_all(log_dir)?;
    }
    let appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let file = fmt::layer().with_ansi(false).with_writer(writer);

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file)
        .try_init()?;
    Ok(Some(guard))
}
