use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::adapters::chain::{ChainBattle, ChainBet};
use crate::adapters::database::Database;
use crate::config::{EngineConfig, PayoutPolicy};
use crate::domain::{
    Battle, BattleMetrics, BattleStatus, LeaderboardEntry, Position, PositionState,
    SettlementResult, Valuation,
};
use crate::engine::position;
use crate::engine::risk::RiskMonitor;
use crate::engine::settlement::{self, Settlement, SettlementEngine};
use crate::feeds::LiveScores;
use crate::error::{EngineError, EngineResult};

/// Runs battle and bet operations against the store.
///
/// Every write to a battle or its positions happens under that battle's
/// lock, so settlements are computed against one fixed outcome. Battles
/// never share a lock. Valuations take no lock at all.
#[derive(Clone)]
pub struct BetManager {
    db: Database,
    config: EngineConfig,
    monitor: RiskMonitor,
    settlement: SettlementEngine,
    live: LiveScores,
    locks: Arc<Mutex<HashMap<i64, Weak<Mutex<()>>>>>,
}

impl BetManager {
    pub fn new(db: Database, config: EngineConfig, live: LiveScores) -> Self {
        let monitor = RiskMonitor::new(config.clone());
        Self::with_monitor(db, config, live, monitor)
    }

    pub fn with_monitor(
        db: Database,
        config: EngineConfig,
        live: LiveScores,
        monitor: RiskMonitor,
    ) -> Self {
        Self {
            settlement: SettlementEngine::new(config.clone()),
            db,
            config,
            monitor,
            live,
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    /// The map only holds weak handles, so a battle's entry goes away once
    /// nobody is working on it.
    async fn battle_lock(&self, battle_id: i64) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.retain(|_, lock| lock.strong_count() > 0);
        if let Some(lock) = locks.get(&battle_id).and_then(Weak::upgrade) {
            return lock;
        }
        let lock = Arc::new(Mutex::new(()));
        locks.insert(battle_id, Arc::downgrade(&lock));
        lock
    }

    // --- Battles ---

    pub async fn battle(&self, id: i64) -> EngineResult<Battle> {
        self.db
            .get_battle(id)
            .await?
            .ok_or(EngineError::BattleNotFound(id))
    }

    pub async fn battles(&self, status: Option<BattleStatus>) -> EngineResult<Vec<Battle>> {
        Ok(self.db.list_battles(status).await?)
    }

    pub async fn live_score(&self, battle_id: i64) -> Option<BattleMetrics> {
        self.live.read().await.get(&battle_id).cloned()
    }

    /// New battle, Active straight away if it has already started.
    pub async fn create_battle(
        &self,
        token1: &str,
        token2: &str,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> EngineResult<Battle> {
        if token1.eq_ignore_ascii_case(token2) {
            return Err(EngineError::SameToken(token1.to_string()));
        }
        if end_time <= start_time {
            return Err(EngineError::InvalidSchedule);
        }

        let status = if start_time <= now {
            BattleStatus::Active
        } else {
            BattleStatus::Pending
        };
        let battle = self
            .db
            .insert_battle(token1, token2, start_time, end_time, status)
            .await?;
        info!(
            "Battle {} created: {} vs {} ({}), ends {}",
            battle.id, battle.token1, battle.token2, battle.status, battle.end_time
        );
        Ok(battle)
    }

    pub async fn activate_due(&self, now: DateTime<Utc>) -> EngineResult<Vec<i64>> {
        let ids = self.db.activate_due(now).await?;
        for id in &ids {
            info!("Battle {} is now Active", id);
        }
        Ok(ids)
    }

    /// The authoritative finalize. The only way a battle becomes Completed.
    pub async fn complete_battle(&self, battle_id: i64, winner: &str) -> EngineResult<Battle> {
        let lock = self.battle_lock(battle_id).await;
        let _guard = lock.lock().await;

        let battle = self.battle(battle_id).await?;
        let side = battle.side_of(winner).ok_or_else(|| EngineError::InvalidSide {
            battle_id,
            token: winner.to_string(),
        })?;
        if battle.status != BattleStatus::Active {
            return Err(EngineError::InvalidBattleTransition {
                battle_id,
                from: battle.status,
                to: BattleStatus::Completed,
            });
        }

        if !self.db.complete_battle(battle_id, side).await? {
            let now_status = self.battle(battle_id).await?.status;
            return Err(EngineError::InvalidBattleTransition {
                battle_id,
                from: now_status,
                to: BattleStatus::Completed,
            });
        }

        info!("Battle {} completed, winner {} ({})", battle_id, winner, side);
        self.battle(battle_id).await
    }

    pub async fn cancel_battle(&self, battle_id: i64) -> EngineResult<Battle> {
        let lock = self.battle_lock(battle_id).await;
        let _guard = lock.lock().await;

        let battle = self.battle(battle_id).await?;
        if !self.db.cancel_battle(battle_id).await? {
            return Err(EngineError::InvalidBattleTransition {
                battle_id,
                from: battle.status,
                to: BattleStatus::Cancelled,
            });
        }

        warn!("Battle {} cancelled, pool {:.2} refundable", battle_id, battle.total_pool);
        self.battle(battle_id).await
    }

    /// Mirrors a battle and its bets as read from the contracts.
    pub async fn sync_from_chain(
        &self,
        chain_battle: ChainBattle,
        bets: Vec<(String, ChainBet)>,
    ) -> EngineResult<Battle> {
        let battle_id = chain_battle.id;
        let lock = self.battle_lock(battle_id).await;
        let _guard = lock.lock().await;

        let battle = chain_battle.into_battle()?;
        if let Some(current) = self.db.get_battle(battle_id).await? {
            check_sync(&current, &battle)
                .inspect_err(|e| warn!("Sync of battle {} refused: {}", battle_id, e))?;
        }
        // Decode everything before writing anything.
        let positions = bets
            .into_iter()
            .map(|(id, bet)| bet.into_position(id, &battle, self.config.max_leverage))
            .collect::<EngineResult<Vec<_>>>()?;

        self.db.upsert_battle(&battle).await?;
        for p in &positions {
            self.db.upsert_position(p).await?;
        }

        info!("Battle {} synced from chain with {} bets", battle_id, positions.len());
        self.battle(battle_id).await
    }

    // --- Positions ---

    pub async fn position(&self, id: &str) -> EngineResult<Position> {
        self.db
            .get_position(id)
            .await?
            .ok_or_else(|| EngineError::PositionNotFound(id.to_string()))
    }

    pub async fn place_bet(
        &self,
        battle_id: i64,
        owner: &str,
        predicted_token: &str,
        collateral: f64,
        leverage: f64,
    ) -> EngineResult<Position> {
        let lock = self.battle_lock(battle_id).await;
        let _guard = lock.lock().await;

        let battle = self.battle(battle_id).await?;
        let side = battle
            .side_of(predicted_token)
            .ok_or_else(|| EngineError::InvalidSide {
                battle_id,
                token: predicted_token.to_string(),
            })?;
        let pos = position::open(
            &battle,
            owner,
            side,
            collateral,
            leverage,
            self.config.max_leverage,
            Utc::now(),
        )?;

        if !self.db.insert_position(&pos).await? {
            let battle = self.battle(battle_id).await?;
            return Err(EngineError::BattleNotActive {
                battle_id,
                status: battle.status,
            });
        }

        info!(
            "Bet {} opened: {} on {} in battle {}, {:.2} x{:.1}",
            pos.id, owner, side, battle_id, collateral, leverage
        );
        Ok(pos)
    }

    /// Read-only valuation against the latest live score.
    pub async fn valuate_position(&self, id: &str) -> EngineResult<Valuation> {
        let pos = self.position(id).await?;
        let battle = self.battle(pos.battle_id).await?;
        Ok(self.valuate_with(&pos, &battle).await)
    }

    async fn valuate_with(&self, pos: &Position, battle: &Battle) -> Valuation {
        let live = self.live_score(battle.id).await;
        self.monitor.valuate(
            pos,
            battle,
            live.as_ref().map(|m| (&m.token1, &m.token2)),
            Utc::now(),
        )
    }

    pub async fn positions_for_owner(&self, owner: &str) -> EngineResult<Vec<(Position, Valuation)>> {
        let positions = self.db.positions_for_owner(owner).await?;
        let mut battles: HashMap<i64, Battle> = HashMap::new();
        let mut out = Vec::with_capacity(positions.len());
        for pos in positions {
            if !battles.contains_key(&pos.battle_id) {
                battles.insert(pos.battle_id, self.battle(pos.battle_id).await?);
            }
            let valuation = self.valuate_with(&pos, &battles[&pos.battle_id]).await;
            out.push((pos, valuation));
        }
        Ok(out)
    }

    pub async fn open_positions(&self, battle_id: i64) -> EngineResult<Vec<Position>> {
        Ok(self
            .db
            .positions_for_battle(battle_id)
            .await?
            .into_iter()
            .filter(|p| p.state == PositionState::Open)
            .collect())
    }

    // --- Terminal transitions ---

    pub async fn settle(&self, position_id: &str) -> EngineResult<SettlementResult> {
        let battle_id = self.position(position_id).await?.battle_id;
        let lock = self.battle_lock(battle_id).await;
        let _guard = lock.lock().await;

        // Re-read under the lock.
        let pos = self.position(position_id).await?;
        let battle = self.battle(battle_id).await?;
        let scale = match self.settlement.policy() {
            PayoutPolicy::Uncapped => 1.0,
            PayoutPolicy::ProRata => {
                let all = self.db.positions_for_battle(battle_id).await?;
                settlement::pro_rata_scale(&battle, &all)
            }
        };

        let settled = self.settlement.settle(&pos, &battle, scale, Utc::now())?;
        let result = self.commit(&settled, None).await?;
        info!(
            "Bet {} settled in battle {}: pnl {:.2} ({:.1}%), payout {:.2}",
            position_id, battle_id, result.pnl, result.pnl_percent, result.payout
        );
        Ok(result)
    }

    pub async fn cash_out(&self, position_id: &str) -> EngineResult<SettlementResult> {
        let battle_id = self.position(position_id).await?.battle_id;
        let lock = self.battle_lock(battle_id).await;
        let _guard = lock.lock().await;

        let pos = self.position(position_id).await?;
        let battle = self.battle(battle_id).await?;
        let valuation = self.valuate_with(&pos, &battle).await;

        let cashed = self.settlement.cash_out(&pos, &battle, &valuation, Utc::now())?;
        let result = self.commit(&cashed, None).await?;
        info!(
            "Bet {} cashed out of battle {}: pnl {:.2}, payout {:.2}",
            position_id, battle_id, result.pnl, result.payout
        );
        Ok(result)
    }

    /// Explicit liquidation. Refused unless the current reading is at or
    /// above the configured threshold.
    pub async fn liquidate(&self, position_id: &str) -> EngineResult<SettlementResult> {
        let battle_id = self.position(position_id).await?.battle_id;
        let lock = self.battle_lock(battle_id).await;
        let _guard = lock.lock().await;

        let pos = self.position(position_id).await?;
        let battle = self.battle(battle_id).await?;
        let valuation = self.valuate_with(&pos, &battle).await;

        let liquidated = self
            .settlement
            .liquidate(&pos, &battle, &valuation, &self.monitor, Utc::now())
            .inspect_err(|e| warn!("Liquidation of bet {} refused: {}", position_id, e))?;
        let result = self
            .commit(&liquidated, Some(valuation.liquidation_risk))
            .await?;
        warn!(
            "LIQUIDATED bet {} in battle {}: owner {}, risk {:.1}% >= {:.1}%, collateral {:.2} forfeited",
            position_id,
            battle_id,
            pos.owner,
            valuation.liquidation_risk,
            self.monitor.threshold(),
            pos.collateral
        );
        Ok(result)
    }

    async fn commit(
        &self,
        settlement: &Settlement,
        liquidation_risk: Option<f64>,
    ) -> EngineResult<SettlementResult> {
        if !self.db.apply_settlement(settlement, liquidation_risk).await? {
            warn!(
                "Bet {} changed underneath us, nothing written",
                settlement.position.id
            );
            return Err(EngineError::ConcurrentSettlementConflict {
                position_id: settlement.position.id.clone(),
            });
        }
        Ok(settlement.result.clone())
    }

    pub async fn leaderboard(&self, limit: i64) -> EngineResult<Vec<LeaderboardEntry>> {
        Ok(self.db.leaderboard(limit).await?)
    }
}

/// A chain mirror may only move a battle forward, and may never change the
/// winner of a battle that already has one.
fn check_sync(current: &Battle, incoming: &Battle) -> EngineResult<()> {
    let moves = current.status.can_move_to(incoming.status);
    let winner_kept = current.winner_side.is_none() || current.winner_side == incoming.winner_side;
    if moves && winner_kept {
        Ok(())
    } else {
        Err(EngineError::InvalidBattleTransition {
            battle_id: current.id,
            from: current.status,
            to: incoming.status,
        })
    }
}
