use crate::config::LoggingConfig;
use std::path::{Path, PathBuf};
use tracing::Subscriber;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const LOG_FILE: &str = "pim-embedding.log";

/// `~/.pim-embedding/logs`, or `./.pim-embedding/logs` without a home directory
pub fn default_log_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".pim-embedding")
        .join("logs")
}

/// `RUST_LOG` overrides `level`
fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

fn stdout_layer<S>() -> impl Layer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fmt::layer()
        .with_writer(std::io::stdout)
        .with_target(false)
        .with_line_number(false)
}

/// Plain-text, daily rotated `pim-embedding.log` under `log_dir`
fn file_layer<S>(log_dir: &Path) -> impl Layer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fmt::layer()
        .with_writer(RollingFileAppender::new(Rotation::DAILY, log_dir, LOG_FILE))
        .with_ansi(false)
        .with_target(true)
        .with_line_number(true)
}

/// Initialize logging from the `[logging]` section.
///
/// With `log_to_file` the output goes to rotating files and stdout,
/// otherwise to stdout only.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let registry = tracing_subscriber::registry()
        .with(env_filter(&config.level))
        .with(stdout_layer());

    if !config.log_to_file {
        return registry
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e));
    }

    let log_dir = config.log_dir.clone().unwrap_or_else(default_log_dir);
    std::fs::create_dir_all(&log_dir)?;
    registry
        .with(file_layer(&log_dir))
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    tracing::info!(
        log_dir = %log_dir.display(),
        level = %config.level,
        "File logging initialized"
    );
    Ok(())
}

/// Rotating file logging plus stdout, for long runs
pub fn init_production_logging(level: &str, log_dir: Option<PathBuf>) -> anyhow::Result<()> {
    init_logging(&LoggingConfig {
        level: level.to_string(),
        log_to_file: true,
        log_dir,
    })
}

/// Stdout-only logging for short CLI commands
pub fn init_simple_logging(level: &str) -> anyhow::Result<()> {
    init_logging(&LoggingConfig {
        level: level.to_string(),
        log_to_file: false,
        log_dir: None,
    })
}
