//! Gateway starter binary.
//!
//! Binds a client-facing endpoint, connects to the configured service
//! directory and routes until interrupted.

use anyhow::{Context, Result};
use botbus::json::{encode_json, JsonFormat};
use botbus::{Gateway, GatewayConfig, SessionConfig, TcpSocketFactory, Url};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "botbus-gateway", about = "Message gateway between clients and services")]
struct Args {
    /// Address to accept client connections on.
    #[arg(long)]
    listen: Option<String>,

    /// Address of the service directory.
    #[arg(long)]
    service_directory: Option<String>,

    /// YAML configuration file; flags override it.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Print the effective configuration as JSON and exit.
    #[arg(long)]
    dump_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => GatewayConfig::from_yaml_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => GatewayConfig::default(),
    };
    if let Some(listen) = &args.listen {
        config.listen = Url::parse(listen);
    }
    if let Some(directory) = &args.service_directory {
        config.session.service_directory = Url::parse(directory);
    }

    if args.dump_config {
        println!("{}", encode_json(&config, JsonFormat::Pretty)?);
        return Ok(());
    }

    let session: SessionConfig = config.session.clone();
    let factory = Arc::new(TcpSocketFactory::new(session.clone()));
    let gateway = Gateway::new(factory);
    let endpoint = gateway
        .listen(&session, &config.listen)
        .await
        .context("gateway failed to start")?;
    info!(endpoint = %endpoint, "gateway running, press ctrl-c to stop");

    tokio::signal::ctrl_c().await.context("signal handler")?;
    info!("shutting down");
    gateway.close();
    Ok(())
}
