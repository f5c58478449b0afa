//! The `hotline` binary: load a TOML config, bring up its entrypoints and
//! certificate providers, run until SIGINT/SIGTERM.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;

use hotline::config::load_config;
use hotline::lifecycle::{self, shutdown::DEFAULT_GRACE_PERIOD};
use hotline::observability::init_logging;

#[derive(Debug, Parser)]
#[command(name = "hotline", version, about = "TCP/HTTP entrypoints with live TLS certificate rotation")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "hotline.toml")]
    config: PathBuf,

    /// Validate the configuration and exit.
    #[arg(long)]
    check: bool,

    /// Seconds to wait for in-flight work on shutdown.
    #[arg(long, value_name = "SECS")]
    grace: Option<u64>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("hotline: {}: {e}", cli.config.display());
            return ExitCode::FAILURE;
        }
    };

    if cli.check {
        println!("{}: ok", cli.config.display());
        return ExitCode::SUCCESS;
    }

    if let Err(e) = init_logging(&config.logging) {
        eprintln!("hotline: failed to initialize logging: {e}");
        return ExitCode::FAILURE;
    }

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        entrypoints = config.entrypoints.len(),
        "hotline starting"
    );

    let hotline = match lifecycle::start(&config).await {
        Ok(hotline) => hotline,
        Err(e) => {
            tracing::error!(error = %e, "Startup failed");
            return ExitCode::FAILURE;
        }
    };

    lifecycle::shutdown_signal().await;

    let grace = cli.grace.map(Duration::from_secs).unwrap_or(DEFAULT_GRACE_PERIOD);
    hotline.shutdown(grace).await;
    ExitCode::SUCCESS
}
