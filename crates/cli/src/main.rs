//! farmreg CLI - farmer registry API client

mod commands;
mod logging;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use commands::Commands;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{Level, debug, error};

#[derive(Parser)]
#[command(name = "farmreg")]
#[command(about = "Command-line client for the farmer registry API")]
#[command(version)]
struct Cli {
    /// Set logging level
    #[arg(short = 'l', long, global = true, default_value = "warn")]
    log_level: LogLevel,

    /// Data directory for the session, configuration and logs
    #[arg(short = 'd', long, global = true, env = "FARMREG_STATE_DIR")]
    data_dir: Option<PathBuf>,

    /// Client configuration file (defaults to DATA_DIR/config.toml when present)
    #[arg(short = 'c', long, global = true, env = "FARMREG_CONFIG")]
    config: Option<PathBuf>,

    /// Timeout for the whole command in seconds (0 = no timeout)
    #[arg(short = 't', long, global = true, default_value = "60")]
    timeout: u64,

    /// Disable file logging (only log to stderr)
    #[arg(long, global = true)]
    no_file_log: bool,

    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let data_dir = cli
        .data_dir
        .unwrap_or_else(farmreg_core::config::default_state_dir);

    logging::init_logging(cli.log_level.into(), &data_dir, cli.no_file_log)?;
    debug!(data_dir = %data_dir.display(), "Starting farmreg CLI");

    let command = cli.command.execute(data_dir, cli.config);

    let outcome = if cli.timeout == 0 {
        command.await
    } else {
        match tokio::time::timeout(Duration::from_secs(cli.timeout), command).await {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!(
                "command timed out after {} seconds",
                cli.timeout
            )),
        }
    };

    if let Err(e) = outcome {
        error!("Command failed: {e:#}");
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }

    Ok(())
}

#[derive(Clone, Debug, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for Level {
    fn from(log_level: LogLevel) -> Self {
        match log_level {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}
