use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use quiver_core::policy::PolicyRegistry;
use quiver_selector::config::SelectorConfig;
use quiver_selector::http::{router, SelectorState};
use quiver_selector::service::SelectorService;
use quiver_store::{RuntimeStore, SledKvStore};

#[derive(Parser)]
#[command(name = "quiver-selector")]
#[command(about = "Quiver arm-selection service", version)]
struct Cli {
    /// Configuration file path
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Data directory (overrides config)
    #[arg(long)]
    data_dir: Option<String>,

    /// Listen port (overrides config)
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let mut config = SelectorConfig::load(cli.config.as_deref())?;
    if let Some(data_dir) = cli.data_dir {
        config.data_dir = data_dir;
    }
    if let Some(port) = cli.port {
        config.http_port = port;
    }

    let db = sled::open(&config.data_dir)?;
    let kv = Arc::new(SledKvStore::open(&db)?);
    let runtime = RuntimeStore::new(kv);
    let registry = Arc::new(PolicyRegistry::builtin());
    let service = Arc::new(SelectorService::new(runtime, registry, &config));

    let app = router(SelectorState { service });
    let addr = format!("{}:{}", config.http_host, config.http_port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "selector listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("selector stopped");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}
