use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use quiver_core::policy::PolicyRegistry;
use quiver_proxy::config::ProxyConfig;
use quiver_proxy::http::{router, ProxyState};
use quiver_proxy::selector_client::{HttpSelectorClient, LocalSelectorClient, SelectorClient};
use quiver_proxy::service::ProxyService;
use quiver_selector::config::SelectorConfig;
use quiver_selector::service::SelectorService;
use quiver_store::{Catalog, RuntimeStore, SledFeedbackStream, SledKvStore};
use quiver_trainer::config::TrainerConfig;
use quiver_trainer::service::TrainerService;

#[derive(Parser)]
#[command(name = "quiver-proxy")]
#[command(about = "Quiver bandit-serving gateway", version)]
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
    let mut config = ProxyConfig::load(cli.config.as_deref())?;
    if let Some(data_dir) = cli.data_dir {
        config.data_dir = data_dir;
    }
    if let Some(port) = cli.port {
        config.http_port = port;
    }

    let db = sled::open(&config.data_dir)?;
    let kv = Arc::new(SledKvStore::open(&db)?);
    let runtime = RuntimeStore::new(kv);
    let catalog = Arc::new(Catalog::open(&db)?);
    let stream = Arc::new(SledFeedbackStream::open(
        &db,
        &config.stream_name,
        config.stream_max_len,
    )?);
    let registry = Arc::new(PolicyRegistry::builtin());

    let selector: Arc<dyn SelectorClient> = match &config.selector_url {
        Some(url) => {
            info!(url = %url, "using remote selector");
            Arc::new(HttpSelectorClient::new(url.clone()))
        }
        None => {
            info!("running selector in-process");
            let selector_config = SelectorConfig {
                data_dir: config.data_dir.clone(),
                ..SelectorConfig::default()
            };
            Arc::new(LocalSelectorClient::new(Arc::new(SelectorService::new(
                runtime.clone(),
                registry.clone(),
                &selector_config,
            ))))
        }
    };

    let service = Arc::new(ProxyService::new(
        catalog,
        runtime.clone(),
        stream.clone(),
        selector,
        registry.clone(),
        &config,
    ));

    // Single-node mode folds the trainer loop into this process.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let trainer_task = if config.embed_trainer {
        info!("running trainer in-process");
        let trainer_config = TrainerConfig {
            data_dir: config.data_dir.clone(),
            stream_name: config.stream_name.clone(),
            stream_max_len: config.stream_max_len,
            ..TrainerConfig::default()
        };
        let trainer = TrainerService::new(stream, runtime, registry, trainer_config);
        Some(tokio::spawn(trainer.run(shutdown_rx)))
    } else {
        None
    };

    let app = router(ProxyState { service });
    let addr = format!("{}:{}", config.http_host, config.http_port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "proxy listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let _ = shutdown_tx.send(true);
    if let Some(task) = trainer_task {
        let _ = task.await;
    }
    info!("proxy stopped");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}
