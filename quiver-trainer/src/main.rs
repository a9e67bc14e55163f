use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use quiver_core::policy::PolicyRegistry;
use quiver_store::{RuntimeStore, SledFeedbackStream, SledKvStore};
use quiver_trainer::config::TrainerConfig;
use quiver_trainer::http::{router, TrainerState};
use quiver_trainer::service::TrainerService;

#[derive(Parser)]
#[command(name = "quiver-trainer")]
#[command(about = "Quiver batched feedback trainer", version)]
struct Cli {
    /// Configuration file path
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Data directory (overrides config)
    #[arg(long)]
    data_dir: Option<String>,

    /// Consumer name within the group (overrides config)
    #[arg(long)]
    consumer_name: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let mut config = TrainerConfig::load(cli.config.as_deref())?;
    if let Some(data_dir) = cli.data_dir {
        config.data_dir = data_dir;
    }
    if let Some(consumer_name) = cli.consumer_name {
        config.consumer_name = consumer_name;
    }

    let db = sled::open(&config.data_dir)?;
    let kv = Arc::new(SledKvStore::open(&db)?);
    let runtime = RuntimeStore::new(kv);
    let stream = Arc::new(SledFeedbackStream::open(
        &db,
        &config.stream_name,
        config.stream_max_len,
    )?);
    let registry = Arc::new(PolicyRegistry::builtin());

    let service = TrainerService::new(stream, runtime, registry, config.clone());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let consumer = tokio::spawn(service.clone().run(shutdown_rx));

    let app = router(TrainerState {
        service: service.clone(),
    });
    let addr = format!("{}:{}", config.http_host, config.http_port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "trainer listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Stop consuming, flush the buffer, then exit cleanly.
    let _ = shutdown_tx.send(true);
    let _ = consumer.await;
    info!("trainer stopped");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}
