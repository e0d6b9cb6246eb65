use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use ota_gateway::api::ApiServerBuilder;
use ota_gateway::config::Overrides;
use ota_gateway::{Config, Gateway};

/// OTA gateway - device presence tracking and command fan-out
#[derive(Parser)]
#[command(name = "ota", version, about)]
struct Cli {
    /// Port to listen on
    #[arg(long, env = "OTA_PORT")]
    port: Option<u16>,

    /// Directory holding the JSON documents
    #[arg(long, env = "OTA_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Comma-separated origins allowed by CORS
    #[arg(long, env = "ALLOWED_ORIGINS")]
    allowed_origins: Option<String>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the gateway (default)
    Serve,
    /// Print stored devices as JSON
    Devices,
    /// Print the command history as JSON
    Commands,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity; RUST_LOG wins when set
    let filter = match cli.verbose {
        0 => "info,ota_gateway=info",
        1 => "info,ota_gateway=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::load(Overrides {
        port: cli.port,
        data_dir: cli.data_dir,
        allowed_origins: cli.allowed_origins,
    });

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::Devices => {
            let gateway = Gateway::open(&config)?;
            print_json(&gateway.presence().list().await?)
        }
        Command::Commands => {
            let gateway = Gateway::open(&config)?;
            print_json(&gateway.dispatcher().list().await?)
        }
    }
}

async fn serve(config: Config) -> anyhow::Result<()> {
    tracing::info!(
        port = config.port,
        data_dir = %config.data_dir.display(),
        origins = ?config.allowed_origins,
        "starting OTA gateway"
    );

    let gateway = Gateway::open(&config)?;
    let server = ApiServerBuilder::new(gateway)
        .port(config.port)
        .allowed_origins(config.allowed_origins)
        .build();

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => tracing::info!("shutting down"),
    }
    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
