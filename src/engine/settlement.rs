//! Terminal transitions of a position: settlement against a finished battle,
//! voluntary cash-out and explicit liquidation.
//!
//! Everything here is pure. Each call takes the current battle and position,
//! and either returns the position's terminal form with the amount credited
//! from the pool, or an error with nothing changed.

use chrono::{DateTime, Utc};

use crate::config::{EngineConfig, PayoutPolicy};
use crate::domain::{Battle, BattleStatus, Position, PositionState, SettlementResult, Valuation};
use crate::engine::position;
use crate::engine::risk::RiskMonitor;
use crate::error::{EngineError, EngineResult};

/// Share of leveraged upside paid to a winning position.
pub const WINNER_PAYOUT_FACTOR: f64 = 0.5;

/// Profit of a winning position: `collateral * (leverage - 1) * 0.5`.
pub fn winner_pnl(collateral: f64, leverage: f64) -> f64 {
    collateral * (leverage - 1.0) * WINNER_PAYOUT_FACTOR
}

/// A position after its terminal transition plus what the caller reports.
#[derive(Debug, Clone, PartialEq)]
pub struct Settlement {
    pub position: Position,
    pub result: SettlementResult,
}

#[derive(Clone)]
pub struct SettlementEngine {
    config: EngineConfig,
}

impl SettlementEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    pub fn policy(&self) -> PayoutPolicy {
        self.config.payout_policy
    }

    /// Settles a position against a Completed battle. A Cancelled battle
    /// refunds the collateral.
    ///
    /// `payout_scale` is the factor from [`pro_rata_scale`] (1.0 when payouts
    /// are uncapped) and only applies to winners.
    pub fn settle(
        &self,
        position: &Position,
        battle: &Battle,
        payout_scale: f64,
        now: DateTime<Utc>,
    ) -> EngineResult<Settlement> {
        if position.state.is_terminal() {
            return Err(EngineError::AlreadySettled {
                position_id: position.id.clone(),
                state: position.state,
            });
        }

        let (pnl, payout) = match (battle.status, battle.winner_side) {
            (BattleStatus::Completed, Some(winner)) if position.predicted_side == winner => {
                let profit = winner_pnl(position.collateral, position.leverage);
                if payout_scale >= 1.0 {
                    (profit, position.collateral + profit)
                } else {
                    let payout = (position.collateral + profit) * payout_scale.max(0.0);
                    (payout - position.collateral, payout)
                }
            }
            (BattleStatus::Completed, Some(_)) => (-position.collateral, 0.0),
            (BattleStatus::Cancelled, _) => (0.0, position.collateral),
            (BattleStatus::Completed, None) => {
                return Err(EngineError::WinnerUnknown {
                    battle_id: battle.id,
                })
            }
            (status, _) => {
                return Err(EngineError::BattleNotCompleted {
                    battle_id: battle.id,
                    status,
                })
            }
        };

        finish(position, PositionState::Settled, pnl, payout, now)
    }

    /// Early exit at the current valuation, less the configured fee.
    pub fn cash_out(
        &self,
        position: &Position,
        battle: &Battle,
        valuation: &Valuation,
        now: DateTime<Utc>,
    ) -> EngineResult<Settlement> {
        require_open_on_active(position, battle)?;

        let gross = (position.collateral + valuation.pnl).max(0.0);
        let fee = gross * self.config.cash_out_fee_pct;
        let payout = gross - fee;
        finish(
            position,
            PositionState::CashedOut,
            payout - position.collateral,
            payout,
            now,
        )
    }

    /// Forfeits the collateral to the pool. Only allowed once the monitor's
    /// reading reaches the liquidation threshold.
    pub fn liquidate(
        &self,
        position: &Position,
        battle: &Battle,
        valuation: &Valuation,
        monitor: &RiskMonitor,
        now: DateTime<Utc>,
    ) -> EngineResult<Settlement> {
        require_open_on_active(position, battle)?;
        monitor.check_liquidation(valuation)?;
        finish(
            position,
            PositionState::Liquidated,
            -position.collateral,
            0.0,
            now,
        )
    }
}

/// Factor applied to winner payouts so that, together with everything
/// already paid to cash-outs, they never exceed the battle's pool.
///
/// Computed over every position of the battle, so it is the same for each
/// winner no matter the order they settle in.
pub fn pro_rata_scale(battle: &Battle, positions: &[Position]) -> f64 {
    let Some(winner) = battle.winner_side else {
        return 1.0;
    };

    let mut claims = 0.0;
    let mut cashed_out = 0.0;
    for p in positions {
        match p.state {
            PositionState::Open | PositionState::Settled if p.predicted_side == winner => {
                claims += p.collateral + winner_pnl(p.collateral, p.leverage);
            }
            PositionState::CashedOut => {
                cashed_out += (p.collateral + p.realized_pnl.unwrap_or(0.0)).max(0.0);
            }
            _ => {}
        }
    }

    let available = (battle.total_pool - cashed_out).max(0.0);
    if claims <= available || claims <= 0.0 {
        1.0
    } else {
        available / claims
    }
}

fn require_open_on_active(position: &Position, battle: &Battle) -> EngineResult<()> {
    if position.state.is_terminal() {
        return Err(EngineError::PositionNotOpen {
            position_id: position.id.clone(),
            state: position.state,
        });
    }
    if battle.status != BattleStatus::Active {
        return Err(EngineError::BattleNotActive {
            battle_id: battle.id,
            status: battle.status,
        });
    }
    Ok(())
}

fn finish(
    position: &Position,
    state: PositionState,
    pnl: f64,
    payout: f64,
    now: DateTime<Utc>,
) -> EngineResult<Settlement> {
    let closed = position::transition(position, state, pnl, now)?;
    Ok(Settlement {
        result: SettlementResult {
            position_id: closed.id.clone(),
            pnl,
            pnl_percent: (pnl / position.collateral) * 100.0,
            new_state: state,
            payout,
        },
        position: closed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DisplayStatus, Side};
    use crate::engine::risk::FixedDelta;
    use std::sync::Arc;

    fn battle(status: BattleStatus, winner: Option<Side>, pool: f64) -> Battle {
        let now = Utc::now();
        Battle {
            id: 3,
            token1: "0xaaa".into(),
            token2: "0xbbb".into(),
            start_time: now,
            end_time: now,
            status,
            winner_side: winner,
            total_pool: pool,
            paid_out: 0.0,
        }
    }

    fn position(id: &str, side: Side, collateral: f64, leverage: f64) -> Position {
        Position {
            id: id.into(),
            battle_id: 3,
            owner: "0xme".into(),
            predicted_side: side,
            collateral,
            leverage,
            opened_at: Utc::now(),
            state: PositionState::Open,
            realized_pnl: None,
            closed_at: None,
        }
    }

    fn valuation(id: &str, pnl: f64, risk: f64) -> Valuation {
        Valuation {
            position_id: id.into(),
            pnl,
            pnl_percent: 0.0,
            liquidation_risk: risk,
            status: DisplayStatus::Danger,
            valued_at: Utc::now(),
        }
    }

    fn engine() -> SettlementEngine {
        SettlementEngine::new(EngineConfig::default())
    }

    #[test]
    fn winner_gets_leveraged_half_upside() {
        let b = battle(BattleStatus::Completed, Some(Side::Token1), 1500.0);
        let s = engine().settle(&position("w", Side::Token1, 500.0, 10.0), &b, 1.0, Utc::now()).unwrap();
        assert_eq!(s.result.pnl, 2250.0);
        assert_eq!(s.result.pnl_percent, 450.0);
        assert_eq!(s.result.payout, 2750.0);
        assert_eq!(s.result.new_state, PositionState::Settled);
        assert_eq!(s.position.realized_pnl, Some(2250.0));
    }

    #[test]
    fn loser_loses_collateral_regardless_of_leverage() {
        let b = battle(BattleStatus::Completed, Some(Side::Token1), 1500.0);
        for leverage in [1.0, 10.0, 50.0] {
            let s = engine().settle(&position("l", Side::Token2, 1000.0, leverage), &b, 1.0, Utc::now()).unwrap();
            assert_eq!(s.result.pnl, -1000.0);
            assert_eq!(s.result.pnl_percent, -100.0);
            assert_eq!(s.result.payout, 0.0);
        }
    }

    #[test]
    fn unleveraged_winner_breaks_even() {
        let b = battle(BattleStatus::Completed, Some(Side::Token2), 100.0);
        let s = engine().settle(&position("w", Side::Token2, 100.0, 1.0), &b, 1.0, Utc::now()).unwrap();
        assert_eq!(s.result.pnl, 0.0);
        assert_eq!(s.result.payout, 100.0);
    }

    #[test]
    fn settling_twice_fails() {
        let b = battle(BattleStatus::Completed, Some(Side::Token1), 500.0);
        let s = engine().settle(&position("w", Side::Token1, 500.0, 10.0), &b, 1.0, Utc::now()).unwrap();
        let err = engine().settle(&s.position, &b, 1.0, Utc::now()).unwrap_err();
        assert_eq!(
            err,
            EngineError::AlreadySettled {
                position_id: "w".into(),
                state: PositionState::Settled
            }
        );
    }

    #[test]
    fn settle_requires_finished_battle() {
        let b = battle(BattleStatus::Active, None, 500.0);
        let err = engine().settle(&position("p", Side::Token1, 500.0, 2.0), &b, 1.0, Utc::now()).unwrap_err();
        assert!(matches!(err, EngineError::BattleNotCompleted { .. }));
    }

    #[test]
    fn completed_battle_without_winner_cannot_settle() {
        let b = battle(BattleStatus::Completed, None, 500.0);
        let err = engine().settle(&position("p", Side::Token1, 500.0, 2.0), &b, 1.0, Utc::now()).unwrap_err();
        assert_eq!(err, EngineError::WinnerUnknown { battle_id: 3 });
        assert_eq!(err.to_string(), "battle 3 is Completed but has no winner recorded");
    }

    #[test]
    fn cancelled_battle_refunds() {
        let b = battle(BattleStatus::Cancelled, None, 500.0);
        let s = engine().settle(&position("p", Side::Token1, 500.0, 20.0), &b, 1.0, Utc::now()).unwrap();
        assert_eq!(s.result.pnl, 0.0);
        assert_eq!(s.result.payout, 500.0);
    }

    #[test]
    fn scaled_payout_shrinks_winners() {
        let b = battle(BattleStatus::Completed, Some(Side::Token1), 1500.0);
        let s = engine().settle(&position("w", Side::Token1, 500.0, 10.0), &b, 0.5, Utc::now()).unwrap();
        assert_eq!(s.result.payout, 1375.0);
        assert_eq!(s.result.pnl, 875.0);
    }

    #[test]
    fn pro_rata_scale_keeps_pool_balanced() {
        let b = battle(BattleStatus::Completed, Some(Side::Token1), 1500.0);
        let positions = vec![
            position("w", Side::Token1, 500.0, 10.0),
            position("l", Side::Token2, 1000.0, 50.0),
        ];
        let scale = pro_rata_scale(&b, &positions);
        assert!((scale - 1500.0 / 2750.0).abs() < 1e-12);

        let payout = engine().settle(&positions[0], &b, scale, Utc::now()).unwrap().result.payout;
        assert!((payout - 1500.0).abs() < 1e-9);
    }

    #[test]
    fn pro_rata_scale_is_one_when_pool_suffices() {
        let b = battle(BattleStatus::Completed, Some(Side::Token1), 10_000.0);
        let positions = vec![position("w", Side::Token1, 100.0, 3.0)];
        assert_eq!(pro_rata_scale(&b, &positions), 1.0);
    }

    #[test]
    fn pro_rata_scale_accounts_for_cash_outs() {
        let b = battle(BattleStatus::Completed, Some(Side::Token1), 1000.0);
        let mut cashed = position("c", Side::Token2, 500.0, 2.0);
        cashed.state = PositionState::CashedOut;
        cashed.realized_pnl = Some(100.0);
        let positions = vec![cashed, position("w", Side::Token1, 500.0, 1.0)];
        // 1000 - 600 paid already, 500 claimed
        assert!((pro_rata_scale(&b, &positions) - 0.8).abs() < 1e-12);
    }

    #[test]
    fn cash_out_realizes_valuation_less_fee() {
        let cfg = EngineConfig {
            cash_out_fee_pct: 0.02,
            ..EngineConfig::default()
        };
        let b = battle(BattleStatus::Active, None, 1000.0);
        let p = position("c", Side::Token1, 1000.0, 5.0);
        let s = SettlementEngine::new(cfg).cash_out(&p, &b, &valuation("c", 250.0, 15.0), Utc::now()).unwrap();
        assert_eq!(s.result.new_state, PositionState::CashedOut);
        assert!((s.result.payout - 1225.0).abs() < 1e-9);
        assert!((s.result.pnl - 225.0).abs() < 1e-9);
    }

    #[test]
    fn cash_out_never_pays_negative() {
        let b = battle(BattleStatus::Active, None, 100.0);
        let p = position("c", Side::Token1, 100.0, 50.0);
        let s = engine().cash_out(&p, &b, &valuation("c", -1000.0, 90.0), Utc::now()).unwrap();
        assert_eq!(s.result.payout, 0.0);
        assert_eq!(s.result.pnl, -100.0);
    }

    #[test]
    fn cash_out_after_completion_must_settle() {
        let b = battle(BattleStatus::Completed, Some(Side::Token1), 100.0);
        let err = engine()
            .cash_out(&position("c", Side::Token1, 100.0, 2.0), &b, &valuation("c", 0.0, 15.0), Utc::now())
            .unwrap_err();
        assert!(matches!(err, EngineError::BattleNotActive { .. }));
    }

    #[test]
    fn cash_out_of_closed_position_fails() {
        let b = battle(BattleStatus::Active, None, 100.0);
        let mut p = position("c", Side::Token1, 100.0, 2.0);
        p.state = PositionState::CashedOut;
        let err = engine().cash_out(&p, &b, &valuation("c", 0.0, 15.0), Utc::now()).unwrap_err();
        assert!(matches!(err, EngineError::PositionNotOpen { .. }));
    }

    #[test]
    fn liquidation_needs_threshold_risk() {
        let monitor = RiskMonitor::with_delta(EngineConfig::default(), Arc::new(FixedDelta(0.0)));
        let b = battle(BattleStatus::Active, None, 1000.0);
        let p = position("x", Side::Token2, 1000.0, 50.0);

        let err = engine().liquidate(&p, &b, &valuation("x", -100.0, 79.9), &monitor, Utc::now()).unwrap_err();
        assert!(matches!(err, EngineError::BelowLiquidationThreshold { .. }));

        let s = engine().liquidate(&p, &b, &valuation("x", -800.0, 80.0), &monitor, Utc::now()).unwrap();
        assert_eq!(s.result.new_state, PositionState::Liquidated);
        assert_eq!(s.result.pnl, -1000.0);
        assert_eq!(s.result.payout, 0.0);
    }
}
