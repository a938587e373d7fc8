use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tracing::{error, info, warn};

use crate::adapters::database::Database;
use crate::domain::{Battle, BattleMetrics, BattleStatus, TokenMetrics};
use crate::engine::scorer;
use crate::error::{EngineError, EngineResult};

/// Supplies market snapshots per token. `Ok(None)` means the source has no
/// data for that token, which callers treat as a failure.
#[async_trait::async_trait]
pub trait MetricsSource: Send + Sync {
    async fn fetch_token_metrics(&self, address: &str) -> eyre::Result<Option<TokenMetrics>>;
}

/// Latest advisory scores, keyed by battle id.
pub type LiveScores = Arc<RwLock<HashMap<i64, BattleMetrics>>>;

/// Fetches both sides of a battle concurrently and scores them. Either side
/// missing aborts the round for this battle.
pub async fn fetch_battle_metrics(
    source: &dyn MetricsSource,
    battle: &Battle,
) -> EngineResult<BattleMetrics> {
    let (m1, m2) = tokio::join!(
        source.fetch_token_metrics(&battle.token1),
        source.fetch_token_metrics(&battle.token2),
    );

    let unavailable = |token: &str| EngineError::MetricsUnavailable {
        token: token.to_string(),
    };
    let token1 = m1
        .map_err(|e| {
            warn!("Metrics fetch for {} failed: {:?}", battle.token1, e);
            unavailable(&battle.token1)
        })?
        .ok_or_else(|| unavailable(&battle.token1))?;
    let token2 = m2
        .map_err(|e| {
            warn!("Metrics fetch for {} failed: {:?}", battle.token2, e);
            unavailable(&battle.token2)
        })?
        .ok_or_else(|| unavailable(&battle.token2))?;

    let score = scorer::compare(&token1, &token2);
    Ok(BattleMetrics {
        battle_id: battle.id,
        token1,
        token2,
        score,
    })
}

/// Periodically scores every active battle. Purely advisory: it activates
/// battles whose start has passed but never finalizes one.
pub struct MetricsPoller {
    source: Arc<dyn MetricsSource>,
    db: Database,
    live: LiveScores,
    update_tx: broadcast::Sender<BattleMetrics>,
    interval: Duration,
}

impl MetricsPoller {
    pub fn new(
        source: Arc<dyn MetricsSource>,
        db: Database,
        live: LiveScores,
        update_tx: broadcast::Sender<BattleMetrics>,
        interval: Duration,
    ) -> Self {
        Self {
            source,
            db,
            live,
            update_tx,
            interval,
        }
    }

    pub async fn run(self) {
        info!("Metrics poller started, every {}s", self.interval.as_secs());

        let mut interval = tokio::time::interval(self.interval);
        loop {
            interval.tick().await;
            if let Err(e) = self.poll_once().await {
                error!("Metrics poll failed: {:?}", e);
            }
        }
    }

    /// One round: activation, then a concurrent fetch per active battle.
    pub async fn poll_once(&self) -> eyre::Result<usize> {
        for id in self.db.activate_due(Utc::now()).await? {
            info!("Battle {} is now Active", id);
        }

        let battles = self.db.list_battles(Some(BattleStatus::Active)).await?;
        let rounds = battles
            .iter()
            .map(|b| fetch_battle_metrics(self.source.as_ref(), b));
        let results = futures_util::future::join_all(rounds).await;

        let mut scored = 0;
        for (battle, result) in battles.iter().zip(results) {
            match result {
                Ok(metrics) => {
                    if let Err(e) = self.db.record_metrics(&metrics).await {
                        error!("Failed to record metrics for battle {}: {:?}", battle.id, e);
                    }
                    info!(
                        "Battle {} score {:.2} vs {:.2}, leading: {}",
                        battle.id,
                        metrics.score.token1_score,
                        metrics.score.token2_score,
                        metrics.score.winner_side
                    );
                    self.live.write().await.insert(battle.id, metrics.clone());
                    let _ = self.update_tx.send(metrics);
                    scored += 1;
                }
                Err(e) => warn!("Skipping battle {} this round: {}", battle.id, e),
            }
        }

        // Finished battles no longer need a live score.
        let active: Vec<i64> = battles.iter().map(|b| b.id).collect();
        self.live.write().await.retain(|id, _| active.contains(id));

        Ok(scored)
    }
}
