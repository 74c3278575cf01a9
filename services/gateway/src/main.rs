use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::error;

use hermod_core::Protocol;

#[derive(Debug, Parser)]
#[command(name = "gateway", version, about = "Start a gateway node")]
struct Args {
    /// Config file
    #[arg(short, long, default_value = gateway::config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    /// Edge protocol, `ws` or `tcp`
    #[arg(short, long, default_value = "ws")]
    protocol: String,
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
    let protocol = match args.protocol.as_str() {
        "ws" => Protocol::Ws,
        "tcp" => Protocol::Tcp,
        other => {
            eprintln!("FATAL: unknown protocol '{other}' (expected ws or tcp)");
            return ExitCode::from(2);
        }
    };

    let config = match gateway::config::load_config_from(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("FATAL: failed to load config: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = gateway::run(config, protocol).await {
        error!(error = %e, "gateway exited");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
