use clap::Parser;
use conduit_runtime::config::WorkerConfig;
use conduit_runtime::{EchoHandler, EdgeClient, EdgeWorker};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,conduit_runtime=debug")),
        )
        .init();

    let cfg = WorkerConfig::parse();
    tracing::info!(config = ?cfg, "starting edge worker");

    let client = Arc::new(EdgeClient::new(cfg.client_config()?)?);
    let worker = EdgeWorker::new(client).with_handler("test", Arc::new(EchoHandler));

    tokio::select! {
        res = worker.run() => res,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
            Ok(())
        }
    }
}
