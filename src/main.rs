use anyhow::Context;
use clap::{Parser, Subcommand};
use noshchat::config::Config;
use noshchat::gateway;
use noshchat::service::ChatService;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "noshchat",
    version,
    about = "Group-chat delivery core: persistence, fan-out, bounded retries"
)]
struct Cli {
    /// Path to the TOML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the delivery service and WebSocket gateway
    Serve {
        /// Override the configured bind address
        #[arg(long)]
        bind: Option<String>,
    },
    /// Write a default config file
    ConfigInit {
        #[arg(long, default_value = "noshchat.toml")]
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve { bind } => serve(cli.config, bind).await,
        Command::ConfigInit { path } => config_init(&path),
    }
}

async fn serve(config_path: Option<PathBuf>, bind: Option<String>) -> anyhow::Result<()> {
    let mut config = match config_path {
        Some(path) => Config::load(&path)?,
        None => Config::default(),
    };
    if let Some(bind) = bind {
        config.gateway.bind_addr = bind;
    }

    let bind_addr = config.gateway.bind_addr.clone();
    let instance_id = config.instance_id.clone();
    let service = ChatService::from_config(config).await?;
    service.start();

    let app = gateway::router(service.clone());
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("bind gateway on {bind_addr}"))?;
    info!(addr = %bind_addr, instance = %instance_id, "gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("gateway server")?;

    service.shutdown().await;
    Ok(())
}

fn config_init(path: &std::path::Path) -> anyhow::Result<()> {
    if path.exists() {
        anyhow::bail!("refusing to overwrite existing {}", path.display());
    }
    std::fs::write(path, Config::default().to_toml()?)
        .with_context(|| format!("write {}", path.display()))?;
    println!("wrote {}", path.display());
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
