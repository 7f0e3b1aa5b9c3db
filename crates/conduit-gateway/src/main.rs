use anyhow::Context;
use clap::Parser;
use conduit_core::token::RuntimeTokenService;
use conduit_gateway::config::GatewayConfig;
use conduit_gateway::pg::{
    PgReceiptStore, PgRegistrationTokenStore, PgRuntimeStore, PgStreams, PgTaskStore,
};
use conduit_gateway::{build_router, AppState, RuntimeRegistry, TaskGateway};
use sqlx::postgres::PgPoolOptions;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,conduit_gateway=debug")),
        )
        .init();

    let cfg = GatewayConfig::parse();
    let addr: SocketAddr = cfg.bind.parse().context("parse bind addr")?;

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&cfg.database_url)
        .await
        .context("connect state db")?;
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("migrate state db")?;

    let auth = Arc::new(RuntimeTokenService::new(cfg.token_config()).context("build token service")?);
    let registry = Arc::new(RuntimeRegistry::new(
        Arc::new(PgRuntimeStore::new(pool.clone())),
        Arc::new(PgRegistrationTokenStore::new(pool.clone())),
        auth.clone(),
        cfg.edge_runtime_registration_token_ttl_minutes,
    ));
    let gateway = Arc::new(TaskGateway::new(
        Arc::new(PgTaskStore::new(pool.clone())),
        Arc::new(PgReceiptStore::new(pool.clone())),
        Arc::new(PgStreams::new(pool.clone())),
    ));

    let restored = gateway
        .rebuild_index()
        .await
        .context("rebuild lease index")?;
    tracing::info!(restored, "lease index rebuilt from task store");

    let state = AppState {
        registry,
        gateway,
        auth,
        control_plane_token: cfg.control_plane_token.clone(),
    };

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("bind tcp listener")?;
    let local = listener.local_addr().context("read local addr")?;
    tracing::info!(addr = %local, "edge gateway listening");

    axum::serve(listener, build_router(state))
        .await
        .context("serve gateway")?;
    Ok(())
}
