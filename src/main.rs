use std::net::IpAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use hulld::config::{self, AppConfig, Mode};
use hulld::core::{CommandService, Monitor};
use hulld::logging::{self, LogConfig};
use hulld::server::{self, Client, Server};
use serde::Serialize;
use tracing::info;

#[derive(Parser)]
#[command(name = "hulld")]
#[command(about = "Concurrent convex hull server", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the TCP server until Ctrl-C.
    Serve(ServeArgs),
    /// Connect to a running server and forward stdin.
    Client(ClientArgs),
    /// Run the command language on stdin/stdout.
    Local(LocalArgs),
}

#[derive(Args, Serialize)]
struct ServeArgs {
    /// Config file (defaults to ./hulld.toml when present)
    #[serde(skip)]
    #[arg(long)]
    config: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, value_enum)]
    mode: Option<Mode>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    host: Option<IpAddr>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, short)]
    port: Option<u16>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    area_threshold: Option<f64>,

    #[serde(skip_serializing_if = "std::ops::Not::not")]
    #[arg(long, short)]
    verbose: bool,

    #[serde(skip_serializing_if = "std::ops::Not::not")]
    #[arg(long)]
    json_logs: bool,
}

#[derive(Args)]
struct ClientArgs {
    #[arg(long, default_value_t = format!("127.0.0.1:{}", config::DEFAULT_PORT))]
    addr: String,
}

#[derive(Args, Serialize)]
struct LocalArgs {
    #[serde(skip)]
    #[arg(long)]
    config: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    area_threshold: Option<f64>,

    #[serde(skip_serializing_if = "std::ops::Not::not")]
    #[arg(long, short)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve(args) => {
            let config = AppConfig::new(args.config.as_deref(), Some(&args))
                .context("Failed to load configuration")?;
            logging::init(LogConfig {
                json: config.json_logs,
                verbose: config.verbose,
            });
            run_server(config).await.context("Server failed")?
        }
        Commands::Client(args) => {
            logging::init(LogConfig::default());
            run_client(args.addr)
                .await
                .context("Client session failed")?
        }
        Commands::Local(args) => {
            let config = AppConfig::new(args.config.as_deref(), Some(&args))
                .context("Failed to load configuration")?;
            logging::init(LogConfig {
                json: config.json_logs,
                verbose: config.verbose,
            });
            run_local(config).await.context("Local session failed")?
        }
    }

    Ok(())
}

async fn run_server(config: AppConfig) -> Result<()> {
    let service = CommandService::new(config.area_threshold);
    let monitor = Monitor::spawn(service.clone())?;

    let addr = config.bind_addr();
    let server = Server::bind(config.mode, addr, service)
        .with_context(|| format!("Failed to start {} server on {}", config.mode, addr))?;

    info!(
        mode = %server.mode(),
        addr = %server.local_addr(),
        threshold = config.area_threshold,
        "Server running, press Ctrl-C to stop"
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!(connections = server.connections(), "Shutting down");

    // Stopping joins every dispatcher thread.
    tokio::task::spawn_blocking(move || -> hulld::Result<()> {
        server.stop()?;
        monitor.shutdown()
    })
    .await??;

    Ok(())
}

async fn run_client(addr: String) -> Result<()> {
    tokio::task::spawn_blocking(move || -> Result<()> {
        let client =
            Client::connect(addr.as_str()).with_context(|| format!("Failed to connect to {addr}"))?;
        client.interactive(std::io::stdin().lock(), std::io::stdout())?;
        Ok(())
    })
    .await?
}

async fn run_local(config: AppConfig) -> Result<()> {
    let service = CommandService::new(config.area_threshold);
    let monitor = Monitor::spawn(service.clone())?;

    tokio::task::spawn_blocking(move || -> hulld::Result<()> {
        server::local::run(service, std::io::stdin().lock(), std::io::stdout().lock())?;
        monitor.shutdown()
    })
    .await??;

    Ok(())
}
