use anyhow::Result;
use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

use vs_server::{config::Config, Server};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .init();

    let cfg = Config::parse();
    let server = Server::start(cfg).await?;

    tokio::signal::ctrl_c().await?;
    info!("ctrl-c");
    server.shutdown().await;
    Ok(())
}
