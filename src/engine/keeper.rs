use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::domain::{BattleMetrics, DisplayStatus};
use crate::engine::bet_manager::BetManager;
use crate::error::EngineError;

/// Watches open positions whenever a battle is re-scored. Flags danger and,
/// only when enabled, issues explicit liquidations.
pub struct LiquidationKeeper {
    manager: BetManager,
    update_rx: broadcast::Receiver<BattleMetrics>,
    auto_liquidate: bool,
}

impl LiquidationKeeper {
    pub fn new(manager: BetManager, update_rx: broadcast::Receiver<BattleMetrics>) -> Self {
        let auto_liquidate = manager.config().auto_liquidate;
        Self {
            manager,
            update_rx,
            auto_liquidate,
        }
    }

    pub async fn run(mut self) {
        info!(
            "Liquidation keeper started (auto-liquidate: {})",
            self.auto_liquidate
        );

        loop {
            match self.update_rx.recv().await {
                Ok(update) => {
                    if let Err(e) = self.handle_update(&update).await {
                        error!("Keeper failed on battle {}: {}", update.battle_id, e);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Keeper lagged by {} score updates", n);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    info!("Score channel closed, keeper shutting down");
                    break;
                }
            }
        }
    }

    /// Returns how many positions were liquidated.
    pub async fn handle_update(&self, update: &BattleMetrics) -> Result<usize, EngineError> {
        let mut liquidated = 0;
        for pos in self.manager.open_positions(update.battle_id).await? {
            let valuation = self.manager.valuate_position(&pos.id).await?;
            if valuation.status != DisplayStatus::Danger {
                continue;
            }

            warn!(
                "Bet {} in danger: pnl {:.2} ({:.1}%), risk {:.1}%",
                pos.id, valuation.pnl, valuation.pnl_percent, valuation.liquidation_risk
            );
            if !self.auto_liquidate
                || valuation.liquidation_risk < self.manager.config().liquidation_threshold
            {
                continue;
            }

            match self.manager.liquidate(&pos.id).await {
                Ok(_) => liquidated += 1,
                // Raced with the owner or a settlement, or the reading moved.
                Err(e @ EngineError::PositionNotOpen { .. })
                | Err(e @ EngineError::BelowLiquidationThreshold { .. })
                | Err(e @ EngineError::ConcurrentSettlementConflict { .. }) => {
                    info!("Skipped liquidating bet {}: {}", pos.id, e);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(liquidated)
    }
}
