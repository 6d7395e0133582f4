use std::sync::Arc;

use clap::Parser;
use tempo_core::config::TempoConfig;
use tempo_steps::StepRegistry;
use tempo_worker::{GatewayClient, Worker};
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "tempo-worker", version, about = "Remote agent for the Tempo gateway")]
struct Args {
    /// Path to tempo.toml. Falls back to TEMPO_CONFIG, then ~/.tempo/tempo.toml.
    #[arg(long, short)]
    config: Option<String>,

    /// Gateway base URL, overrides `worker.server_url`.
    #[arg(long)]
    server: Option<String>,

    /// Agent id, overrides `worker.agent_id` (default: hostname).
    #[arg(long)]
    agent_id: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tempo_worker=info".into()),
        )
        .init();

    let args = Args::parse();
    let config_path = args.config.or_else(|| std::env::var("TEMPO_CONFIG").ok());
    let config = TempoConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        warn!("Config load failed ({}), using defaults", e);
        TempoConfig::default()
    });

    let mut worker_cfg = config.worker;
    if let Some(server) = args.server {
        worker_cfg.server_url = server;
    }
    if let Some(agent_id) = args.agent_id {
        worker_cfg.agent_id = Some(agent_id);
    }
    info!(
        server = %worker_cfg.server_url,
        pool = %worker_cfg.pool,
        max_parallel_jobs = worker_cfg.max_parallel_jobs,
        "starting worker"
    );

    let api = Arc::new(GatewayClient::new(worker_cfg.server_url.clone()));
    let worker = Arc::new(Worker::new(api, worker_cfg, StepRegistry::builtin()));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let run = tokio::spawn(worker.run(shutdown_rx));

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);
    run.await?;
    Ok(())
}
