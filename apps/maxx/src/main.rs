use std::sync::Arc;

use anyhow::Result;
use clap::Parser;

use maxx_common::{GatewayConfig, GatewayConfigPatch};
use maxx_core::{AppState, ProxyEngine, StaticPriceTable};
use maxx_storage::{MemoryStorage, SeaOrmStorage, Storage};

mod cli;

use cli::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let config = merge_config(&cli)?;
    let storage = connect_storage(&config.dsn).await?;

    let state = AppState::bootstrap(
        config.clone(),
        storage,
        Arc::new(StaticPriceTable::default()),
    )
    .await?;
    let engine = Arc::new(ProxyEngine::new(state));

    let app = maxx_router::proxy_router(engine);
    let bind = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    tracing::info!(address = %bind, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_env("MAXX_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn merge_config(cli: &Cli) -> Result<GatewayConfig> {
    let mut patch = GatewayConfigPatch::default();
    patch.overlay(GatewayConfigPatch {
        host: cli.host.clone(),
        port: cli.port,
        dsn: Some(cli.dsn.clone()),
        proxy: cli.proxy.clone(),
    });
    Ok(patch.into_config()?)
}

async fn connect_storage(dsn: &str) -> Result<Arc<dyn Storage>> {
    if dsn == "memory" {
        return Ok(Arc::new(MemoryStorage::new()));
    }
    Ok(Arc::new(SeaOrmStorage::connect(dsn).await?))
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutting down");
}
