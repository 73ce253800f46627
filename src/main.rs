mod admission;
mod api;
mod cli;
mod worker;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

// mimalloc avoids the memory bloat glibc's allocator shows under high job concurrency.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use crawlhub_core::AppConfig;
use crawlhub_store::Store;

use crate::cli::{Cli, Commands};

fn main() -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(32)
        .thread_stack_size(8 * 1024 * 1024)
        .max_blocking_threads(512)
        .enable_all()
        .build()?;

    runtime.block_on(async_main())
}

async fn async_main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let config_str = std::fs::read_to_string(&cli.config).unwrap_or_else(|_| {
        warn!(path = %cli.config, "config file not found, using defaults");
        include_str!("../config/default.toml").to_string()
    });
    let mut config: AppConfig = toml::from_str(&config_str)?;
    config.apply_env_overrides();
    let config = Arc::new(config);

    let store = Store::connect(&config.database.postgres_url, config.database.max_connections).await?;

    match cli.command {
        Commands::Migrate => {
            store.run_migrations().await?;
            info!("migrations applied");
        }
        Commands::Serve => {
            store.run_migrations().await?;
            serve_api(config, store).await?;
        }
        Commands::Worker => {
            store.run_migrations().await?;
            run_worker_until_shutdown(config, store).await?;
        }
        Commands::Run => {
            store.run_migrations().await?;
            let shutdown = CancellationToken::new();

            let ctrl_c_token = shutdown.clone();
            tokio::spawn(async move {
                let _ = tokio::signal::ctrl_c().await;
                info!("shutdown signal received");
                ctrl_c_token.cancel();
            });

            let api_handle = tokio::spawn(serve_api_until_shutdown(config.clone(), store.clone(), shutdown.clone()));
            let worker_handle = tokio::spawn(worker::run(config, store, shutdown));

            let _ = tokio::join!(api_handle, worker_handle);
            info!("shutdown complete");
        }
    }

    Ok(())
}

async fn serve_api(config: Arc<AppConfig>, store: Store) -> Result<()> {
    let shutdown = CancellationToken::new();
    let ctrl_c_token = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
        ctrl_c_token.cancel();
    });
    serve_api_until_shutdown(config, store, shutdown).await
}

async fn serve_api_until_shutdown(config: Arc<AppConfig>, store: Store, shutdown: CancellationToken) -> Result<()> {
    let addr: SocketAddr = config.general.bind_addr.parse()?;
    let app = api::router(api::ApiState { store, config });

    info!(%addr, "api surface listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

async fn run_worker_until_shutdown(config: Arc<AppConfig>, store: Store) -> Result<()> {
    let shutdown = CancellationToken::new();
    let ctrl_c_token = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
        ctrl_c_token.cancel();
    });

    worker::run(config, store, shutdown).await;
    info!("worker shutdown complete");
    Ok(())
}
