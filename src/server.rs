//! API only: no poller, no keeper. Valuations fall back to the no-score
//! reading until something else feeds live scores.

use eyre::Result;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::info;

use coc_engine::adapters::database::Database;
use coc_engine::api;
use coc_engine::config::Config;
use coc_engine::engine::bet_manager::BetManager;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new("coc_engine=info,tower_http=info"))
        .init();

    let config = Config::load()?;
    let db = Database::new(&config.db_path).await?;
    let manager = BetManager::new(db, config.engine.clone(), Arc::new(RwLock::new(HashMap::new())));

    let app_state = Arc::new(api::AppState {
        manager,
        authority_key: config.authority_key.clone(),
        start_time: Instant::now(),
    });

    let app = api::router(app_state);
    let port = config.dashboard_port;
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
    info!("API server running on http://0.0.0.0:{}", port);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await?;

    Ok(())
}
