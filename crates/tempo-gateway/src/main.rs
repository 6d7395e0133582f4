use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tempo_agents::{AgentRegistry, AgentStore, Dispatcher, SqliteAgentStore, TokenSigner};
use tempo_core::config::TempoConfig;
use tempo_engine::{ExecutionEngine, JobStore, RecurringScheduler, SqliteExecutionStore};
use tracing::{info, warn};

mod app;
mod auth;
mod http;

#[derive(Debug, Parser)]
#[command(name = "tempo-gateway", version, about = "Tempo job engine and agent gateway")]
struct Args {
    /// Path to tempo.toml. Falls back to TEMPO_CONFIG, then ~/.tempo/tempo.toml.
    #[arg(long, short)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tempo_gateway=info,tower_http=debug".into()),
        )
        .init();

    // load config: --config > TEMPO_CONFIG env > ~/.tempo/tempo.toml
    let args = Args::parse();
    let config_path = args.config.or_else(|| std::env::var("TEMPO_CONFIG").ok());
    let config = TempoConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        warn!("Config load failed ({}), using defaults", e);
        TempoConfig::default()
    });
    if config.agents.token_secret == "change-me" {
        warn!("agents.token_secret is the built-in default; set TEMPO_AGENTS__TOKEN_SECRET");
    }
    if config.gateway.admin_token.is_none() {
        warn!("gateway.admin_token is unset; engine and admin routes are open");
    }

    // one SQLite file, one connection per subsystem
    let db_path = &config.database.path;
    ensure_parent_dir(db_path);
    info!(path = %db_path, "opening SQLite database");
    let db = rusqlite::Connection::open(db_path)?;
    db.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
    drop(db);

    let agent_store: Arc<dyn AgentStore> = Arc::new(SqliteAgentStore::new(open(db_path)?)?);
    let registry = Arc::new(
        AgentRegistry::new(config.agents.offline_after())
            .with_auto_approve(config.agents.auto_approve)
            .with_store(agent_store.clone())?,
    );
    let dispatcher = Arc::new(Dispatcher::new(registry.clone(), &config.agents).with_store(agent_store));
    let engine = ExecutionEngine::builder(config.engine.clone())
        .store(Arc::new(SqliteExecutionStore::new(open(db_path)?)?))
        .dispatcher(dispatcher.clone(), config.agents.max_assignment_attempts)
        .build()?;
    let jobs = Arc::new(JobStore::new(open(db_path)?)?);
    let signer = TokenSigner::new(&config.agents.token_secret, config.agents.token_ttl_secs);
    info!(agents = registry.list().len(), "database ready");

    let bind = config.gateway.bind.clone();
    let port = config.gateway.port;
    let state = Arc::new(app::AppState::new(
        config,
        engine.clone(),
        dispatcher.clone(),
        jobs.clone(),
        signer,
    ));
    let router = app::build_router(state);

    // background loops stop when shutdown_tx flips to true
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(dispatcher.run_maintenance(shutdown_rx.clone()));
    let scheduler = RecurringScheduler::new(jobs, engine.clone());
    tokio::spawn(scheduler.run(shutdown_rx));

    let addr: SocketAddr = format!("{}:{}", bind, port).parse()?;
    info!("Tempo gateway listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let _ = shutdown_tx.send(true);
    engine.shutdown();
    info!("gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}

fn open(path: &str) -> rusqlite::Result<rusqlite::Connection> {
    let conn = rusqlite::Connection::open(path)?;
    conn.busy_timeout(std::time::Duration::from_secs(5))?;
    Ok(conn)
}

/// Ensure the parent directory for a file path exists.
fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}
