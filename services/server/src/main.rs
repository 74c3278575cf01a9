use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::error;

#[derive(Debug, Parser)]
#[command(name = "server", version, about = "Start a logic node")]
struct Args {
    /// Config file
    #[arg(short, long, default_value = server::config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    /// Service name to register as, `login` or `chat`
    #[arg(short, long, default_value = "chat")]
    service_name: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = match server::config::load_config_from(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("FATAL: failed to load config: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = server::run(config, &args.service_name).await {
        error!(error = %e, "logic node exited");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
