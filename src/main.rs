//! Application entry point.

use std::env;
use std::sync::Arc;

use anyhow::{Context, Result};
use dotenvy::dotenv;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use fenced_tx_manager::api::{RouterConfig, create_router_with_config};
use fenced_tx_manager::app::{ManagerConfig, TxManager};
use fenced_tx_manager::infra::{
    ChainClientConfig, JsonRpcChainConnector, PostgresClient, PostgresConfig,
};

/// Process-level configuration
struct Config {
    database_url: String,
    host: String,
    port: u16,
    enable_background_workers: bool,
    postgres: PostgresConfig,
    chain: ChainClientConfig,
    manager: ManagerConfig,
    router: RouterConfig,
}

impl Config {
    fn from_env() -> Result<Self> {
        let database_url = env::var("DATABASE_URL").context("DATABASE_URL not set")?;
        let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = env::var("PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(3000);
        let enable_background_workers = env::var("ENABLE_BACKGROUND_WORKERS")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(true);

        Ok(Self {
            database_url,
            host,
            port,
            enable_background_workers,
            postgres: PostgresConfig::from_env().context("Invalid database pool settings")?,
            chain: ChainClientConfig::from_env().context("Invalid chain RPC settings")?,
            manager: ManagerConfig::from_env(),
            router: RouterConfig::from_env(),
        })
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug,sqlx=warn"));

    let json = env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    init_tracing();

    info!("Fenced transaction manager v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;

    let store = PostgresClient::new(&config.database_url, config.postgres.clone())
        .await
        .context("Failed to connect to PostgreSQL")?;
    store
        .run_migrations()
        .await
        .context("Failed to run database migrations")?;
    info!("Database ready");

    let chain =
        JsonRpcChainConnector::new(config.chain.clone()).context("Failed to build chain client")?;

    let manager = TxManager::builder(Arc::new(store), Arc::new(chain))
        .config(config.manager.clone())
        .background_workers(config.enable_background_workers)
        .build();

    let router = create_router_with_config(Arc::clone(&manager), config.router.clone());
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("Server listening on http://{}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    manager.shutdown().await;
    info!("Server shutdown complete");
    Ok(())
}
