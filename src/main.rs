use std::path::PathBuf;

use ::tracing::{error, info_span, Instrument};
use anyhow::Context;
use clap::Parser;
use service::Service;

mod config;
mod http_objects;
mod routes;
mod service;
mod tracing;
use tracing::setup_tracing;

#[cfg(test)]
mod testing;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[arg(short, long, value_name = "config file", help = "Path to config file")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = match cli.config {
        Some(path) => config::ServerConfig::from_path(&path.to_string_lossy())
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => config::ServerConfig::from_env()?,
    };

    let tracing_provider = setup_tracing(&config)
        .inspect_err(|e| {
            error!("Error setting up tracing: {:?}", e);
        })?;

    let root_span = info_span!(
        "gap-backfill",
        env = %config.env,
        instance = %config.instance_id()
    );

    let result = start_service(config).instrument(root_span).await;
    if let Err(err) = &result {
        error!("Error running service: {:?}", err);
    }

    // export traces before shutdown
    if let Some(tracer_provider) = tracing_provider {
        if let Err(err) = tracer_provider.force_flush() {
            error!("Error flushing traces: {:?}", err);
        }
        if let Err(err) = tracer_provider.shutdown() {
            error!("Error shutting down tracer provider: {:?}", err);
        }
    }
    result
}

async fn start_service(config: config::ServerConfig) -> anyhow::Result<()> {
    let service = Service::new(config)
        .await
        .context("Failed to create service")?;
    service.start().await.context("Failed to start service")
}
