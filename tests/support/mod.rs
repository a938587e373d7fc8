#![allow(dead_code)]

use chrono::{Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use coc_engine::adapters::database::Database;
use coc_engine::config::EngineConfig;
use coc_engine::domain::{Battle, TokenMetrics};
use coc_engine::engine::bet_manager::BetManager;
use coc_engine::engine::risk::{DeltaSource, FixedDelta, RiskMonitor};
use coc_engine::feeds::LiveScores;

pub const TOKEN_A: &str = "0xaaaa000000000000000000000000000000000001";
pub const TOKEN_B: &str = "0xbbbb000000000000000000000000000000000002";

pub struct Harness {
    pub db: Database,
    pub live: LiveScores,
    pub manager: BetManager,
}

pub async fn harness(config: EngineConfig) -> Harness {
    let monitor = RiskMonitor::new(config.clone());
    harness_with_monitor(config, monitor).await
}

pub async fn harness_with_delta(config: EngineConfig, delta: f64) -> Harness {
    let source: Arc<dyn DeltaSource> = Arc::new(FixedDelta(delta));
    let monitor = RiskMonitor::with_delta(config.clone(), source);
    harness_with_monitor(config, monitor).await
}

async fn harness_with_monitor(config: EngineConfig, monitor: RiskMonitor) -> Harness {
    let db = Database::in_memory().await.expect("in-memory db");
    let live: LiveScores = Arc::new(RwLock::new(HashMap::new()));
    let manager = BetManager::with_monitor(db.clone(), config, live.clone(), monitor);
    Harness { db, live, manager }
}

/// A battle that started a minute ago and runs for a day.
pub async fn active_battle(manager: &BetManager) -> Battle {
    let now = Utc::now();
    manager
        .create_battle(
            TOKEN_A,
            TOKEN_B,
            now - Duration::minutes(1),
            now + Duration::days(1),
            now,
        )
        .await
        .expect("create battle")
}

/// Scores `40 + 30 + 20 + 10 * tx_count`.
pub fn metrics(address: &str, tx_count: u64) -> TokenMetrics {
    TokenMetrics {
        volume_usd_24h: 1000.0,
        liquidity_usd: 1000.0,
        price_usd: 1.0,
        tx_count_24h: tx_count,
        ..TokenMetrics::empty(address)
    }
}

pub fn approx(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-6
}
