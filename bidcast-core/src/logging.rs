use std::fs::File;
use std::sync::Arc;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;

/// Install the global tracing subscriber: level from config (a `RUST_LOG`
/// environment filter wins when set), json or pretty output, optionally
/// appended to a log file instead of stderr.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let directive = level_directive(&config.level)?;
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));
    let registry = tracing_subscriber::registry().with(filter);

    let json = config.format.eq_ignore_ascii_case("json");
    match config.file_path.as_deref() {
        Some(path) => {
            let writer = Arc::new(open_log_file(path)?);
            if json {
                registry
                    .with(fmt::layer().json().with_writer(writer))
                    .init();
            } else {
                // No ANSI escapes in files.
                registry
                    .with(fmt::layer().with_ansi(false).with_writer(writer))
                    .init();
            }
        }
        None => {
            if json {
                registry.with(fmt::layer().json()).init();
            } else {
                registry.with(fmt::layer().pretty()).init();
            }
        }
    }

    Ok(())
}

fn open_log_file(path: &str) -> anyhow::Result<File> {
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    Ok(file)
}

/// Validate the configured level and map it to a filter directive.
fn level_directive(level: &str) -> anyhow::Result<&'static str> {
    Ok(match level.to_lowercase().as_str() {
        "trace" => "trace",
        "debug" => "debug",
        "info" => "info",
        "warn" | "warning" => "warn",
        "error" => "error",
        other => anyhow::bail!("invalid log level: {other}"),
    })
}
