use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use abdera::adapter::AdapterFactories;
use abdera::config::Config;
use abdera::provider::Provider;
use abdera::server::Server;

#[derive(Parser, Debug)]
#[command(name = "abdera", about = "AtomPub collection server")]
struct Args {
    /// Configuration file (TOML). Defaults apply when it does not exist.
    #[arg(long, short, value_name = "FILE", default_value = "abdera.toml")]
    config: PathBuf,

    /// Address to listen on, overriding the configuration
    #[arg(long, value_name = "ADDR")]
    listen: Option<SocketAddr>,

    /// Include internal error detail in 500 responses
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let mut config = Config::load(&args.config)
        .with_context(|| format!("Failed to load config from '{}'", args.config.display()))?;
    if let Some(listen) = args.listen {
        config.listen = listen;
    }
    config.debug |= args.debug;
    tracing::debug!(config = ?config, "Effective configuration");

    let factories = AdapterFactories::with_builtins();
    let provider = Provider::from_config(&config, &factories)
        .await
        .context("Failed to set up collections")?;

    Server::new(Arc::new(provider), config.max_body_bytes)
        .run(config.listen)
        .await
}
