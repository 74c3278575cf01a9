use std::process::ExitCode;

use clap::{Parser, Subcommand};

use hermod_core::Protocol;

#[derive(Debug, Parser)]
#[command(name = "mock", version, about = "Mock client and echo server")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the echo server
    Server {
        /// Listen address
        #[arg(short, long, default_value = "127.0.0.1:8000")]
        listen: String,
        /// Edge protocol, `ws` or `tcp`
        #[arg(short, long, default_value = "ws")]
        protocol: String,
        /// Service id
        #[arg(long, default_value = "mock_1")]
        id: String,
    },
    /// Run the demo client
    Client {
        /// Server address (`ws://host:port` for ws, `host:port` for tcp)
        #[arg(short, long, default_value = "ws://127.0.0.1:8000")]
        addr: String,
        /// Edge protocol, `ws` or `tcp`
        #[arg(short, long, default_value = "ws")]
        protocol: String,
        /// User id sent as the handshake
        #[arg(short, long, default_value = "test1")]
        user: String,
        /// Messages to send
        #[arg(long, default_value_t = 5)]
        count: usize,
    },
}

fn parse_protocol(protocol: &str) -> Option<Protocol> {
    match protocol {
        "ws" => Some(Protocol::Ws),
        "tcp" => Some(Protocol::Tcp),
        _ => None,
    }
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
    let result = match args.command {
        Command::Server { listen, protocol, id } => {
            let Some(protocol) = parse_protocol(&protocol) else {
                eprintln!("FATAL: unknown protocol '{protocol}'");
                return ExitCode::from(2);
            };
            mock::ServerDemo::start(&id, protocol, &listen)
                .await
                .map_err(|e| e.to_string())
        }
        Command::Client { addr, protocol, user, count } => {
            let Some(protocol) = parse_protocol(&protocol) else {
                eprintln!("FATAL: unknown protocol '{protocol}'");
                return ExitCode::from(2);
            };
            mock::ClientDemo::start(&user, protocol, &addr, count)
                .await
                .map_err(|e| e.to_string())
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("FATAL: {e}");
            ExitCode::FAILURE
        }
    }
}
