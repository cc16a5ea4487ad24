use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

/// A sharded redis proxy with live slot migration.
#[derive(Parser)]
#[command(name = "shoal", version, about)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "shoal.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "shoal=info".into()),
        )
        .init();

    let args = Args::parse();
    info!(config = %args.config.display(), version = shoal::VERSION, "loading configuration");

    let config = match shoal::Config::load(&args.config).await {
        Ok(config) => config,
        Err(err) => {
            error!(error = %format!("{err:#}"), "failed to load configuration");
            return ExitCode::FAILURE;
        }
    };

    match shoal::run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %format!("{err:#}"), "proxy terminated");
            ExitCode::FAILURE
        }
    }
}
