use eyre::Result;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, RwLock};
use tracing::info;

use coc_engine::adapters::database::Database;
use coc_engine::adapters::subgraph::SubgraphClient;
use coc_engine::api;
use coc_engine::config::Config;
use coc_engine::domain::BattleMetrics;
use coc_engine::engine::bet_manager::BetManager;
use coc_engine::engine::keeper::LiquidationKeeper;
use coc_engine::feeds::{LiveScores, MetricsPoller};

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "coc_engine=info,engine=info,tower_http=info".into()),
        )
        .init();

    info!("⚔️ Battle engine starting up...");

    let config = Config::load()?;
    info!(
        "Config loaded. Payout policy {:?}, valuation {:?}, liquidation at {:.0}% (auto: {})",
        config.engine.payout_policy,
        config.engine.valuation_model,
        config.engine.liquidation_threshold,
        config.engine.auto_liquidate
    );
    if config.authority_key.is_none() {
        info!("AUTHORITY_KEY not set, battle admin and liquidation endpoints are disabled");
    }

    // Database
    let db = Database::new(&config.db_path).await?;
    info!("Database initialized at {}", config.db_path);

    // Shared state
    let live: LiveScores = Arc::new(RwLock::new(HashMap::new()));
    let manager = BetManager::new(db.clone(), config.engine.clone(), live.clone());

    // Score updates: poller -> keeper
    let (update_tx, update_rx) = broadcast::channel::<BattleMetrics>(256);

    // --- Metrics poller ---
    let subgraph = SubgraphClient::new(&config.subgraph_url, config.engine.fetch_retries)?;
    let poller = MetricsPoller::new(
        Arc::new(subgraph),
        db.clone(),
        live.clone(),
        update_tx,
        Duration::from_secs(config.engine.poll_interval_secs),
    );

    // --- Liquidation keeper ---
    let keeper = LiquidationKeeper::new(manager.clone(), update_rx);

    // --- API ---
    let app_state = Arc::new(api::AppState {
        manager,
        authority_key: config.authority_key.clone(),
        start_time: Instant::now(),
    });
    let app = api::router(app_state);
    let port = config.dashboard_port;
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
    info!("Engine API running on http://0.0.0.0:{}", port);

    // --- Spawn everything ---
    tokio::spawn(async move { poller.run().await });
    tokio::spawn(async move { keeper.run().await });

    // Serve API + graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("🛑 Engine shutting down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for CTRL+C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
