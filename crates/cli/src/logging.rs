use anyhow::Result;
use farmreg_core::tracing::{InstrumentationConfig, init_tracing};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use tracing::Level;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

const LOG_FILE: &str = "cli.log";

/// Initialize logging for the CLI
///
/// Always logs to stderr; unless `no_file_log` is set the same events are
/// also written to `DATA_DIR/cli.log`.
pub fn init_logging(log_level: Level, data_dir: &Path, no_file_log: bool) -> Result<()> {
    let directives = default_directives(log_level);

    if no_file_log {
        let config = InstrumentationConfig {
            log_level: directives,
            ..InstrumentationConfig::from_env()
        };
        return init_tracing(&config);
    }

    init_file_logging(&directives, &log_file_path(data_dir))
}

fn default_directives(level: Level) -> String {
    let level_str = level.as_str().to_lowercase();
    format!("farmreg={level_str},farmreg_http={level_str},farmreg_core={level_str}")
}

fn init_file_logging(directives: &str, log_file_path: &Path) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directives));

    if let Some(parent) = log_file_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file_path)?;

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(log_file)
                .with_ansi(false),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()?;

    Ok(())
}

fn log_file_path(data_dir: &Path) -> PathBuf {
    data_dir.join(LOG_FILE)
}
