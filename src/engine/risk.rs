use chrono::{DateTime, Utc};
use rand::Rng;
use std::sync::Arc;

use crate::config::{EngineConfig, ValuationModel};
use crate::domain::{
    Battle, BattleScore, BattleStatus, DisplayStatus, Position, PositionState, TokenMetrics,
    Valuation,
};
use crate::engine::scorer;
use crate::error::{EngineError, EngineResult};

/// Largest unleveraged mark-to-market move, as a fraction of collateral.
pub const MAX_DELTA: f64 = 0.2;
/// Reading reported for low-leverage or non-losing positions.
pub const BASELINE_RISK: f64 = 15.0;
pub const MAX_RISK: f64 = 90.0;
/// Positions above this leverage report their loss as risk.
pub const RISK_LEVERAGE_FLOOR: f64 = 10.0;
pub const DANGER_RISK: f64 = 80.0;

/// Source of the unleveraged move applied to an open position.
/// Implementations return a value in `[-MAX_DELTA, MAX_DELTA]`.
pub trait DeltaSource: Send + Sync {
    fn delta(&self, position: &Position, live: Option<&BattleScore>) -> f64;
}

/// Uniform draw, `(u - 0.5) * 0.4`.
pub struct RandomDelta;

impl DeltaSource for RandomDelta {
    fn delta(&self, _position: &Position, _live: Option<&BattleScore>) -> f64 {
        let u: f64 = rand::thread_rng().gen_range(0.0..1.0);
        (u - 0.5) * 2.0 * MAX_DELTA
    }
}

/// Normalized score differential from the predicted side's point of view:
/// `MAX_DELTA * (own - other) / (own + other)`. No live score means no move.
pub struct ScoreDelta;

impl DeltaSource for ScoreDelta {
    fn delta(&self, position: &Position, live: Option<&BattleScore>) -> f64 {
        let Some(score) = live else {
            return 0.0;
        };
        let own = score.score_of(position.predicted_side);
        let other = score.score_of(position.predicted_side.opposite());
        let total = own + other;
        if total <= 0.0 || !total.is_finite() {
            return 0.0;
        }
        (MAX_DELTA * (own - other) / total).clamp(-MAX_DELTA, MAX_DELTA)
    }
}

/// Constant move, for replaying a known reading.
pub struct FixedDelta(pub f64);

impl DeltaSource for FixedDelta {
    fn delta(&self, _position: &Position, _live: Option<&BattleScore>) -> f64 {
        self.0.clamp(-MAX_DELTA, MAX_DELTA)
    }
}

/// Read-only valuation of positions between open and settlement.
#[derive(Clone)]
pub struct RiskMonitor {
    config: EngineConfig,
    delta: Arc<dyn DeltaSource>,
}

impl RiskMonitor {
    pub fn new(config: EngineConfig) -> Self {
        let delta: Arc<dyn DeltaSource> = match config.valuation_model {
            ValuationModel::Score => Arc::new(ScoreDelta),
            ValuationModel::Random => Arc::new(RandomDelta),
        };
        Self { config, delta }
    }

    pub fn with_delta(config: EngineConfig, delta: Arc<dyn DeltaSource>) -> Self {
        Self { config, delta }
    }

    pub fn threshold(&self) -> f64 {
        self.config.liquidation_threshold
    }

    /// Current pnl, percent return and liquidation risk of a position.
    /// Never changes the position.
    pub fn valuate(
        &self,
        position: &Position,
        battle: &Battle,
        live: Option<(&TokenMetrics, &TokenMetrics)>,
        now: DateTime<Utc>,
    ) -> Valuation {
        let pnl = if position.state.is_terminal() {
            position.realized_pnl.unwrap_or(0.0)
        } else {
            match battle.status {
                BattleStatus::Active => {
                    let score = live.map(|(m1, m2)| scorer::compare(m1, m2));
                    let delta = self.delta.delta(position, score.as_ref());
                    position.collateral * delta * position.leverage
                }
                // No mark-to-market outside Active; the outcome shows up on settle.
                _ => 0.0,
            }
        };

        let pnl_percent = (pnl / position.collateral) * 100.0;
        let liquidation_risk = liquidation_risk(position.leverage, pnl, pnl_percent);

        Valuation {
            position_id: position.id.clone(),
            pnl,
            pnl_percent,
            liquidation_risk,
            status: classify(position.state, pnl, liquidation_risk),
            valued_at: now,
        }
    }

    /// Gate for an explicit liquidation. Valuation alone never liquidates.
    pub fn check_liquidation(&self, valuation: &Valuation) -> EngineResult<()> {
        if valuation.liquidation_risk >= self.config.liquidation_threshold {
            Ok(())
        } else {
            Err(EngineError::BelowLiquidationThreshold {
                risk: valuation.liquidation_risk,
                threshold: self.config.liquidation_threshold,
            })
        }
    }
}

pub fn liquidation_risk(leverage: f64, pnl: f64, pnl_percent: f64) -> f64 {
    if leverage > RISK_LEVERAGE_FLOOR && pnl < 0.0 {
        pnl_percent.abs().min(MAX_RISK)
    } else {
        BASELINE_RISK
    }
}

pub fn classify(state: PositionState, pnl: f64, risk: f64) -> DisplayStatus {
    if state.is_terminal() {
        if pnl >= 0.0 {
            DisplayStatus::ClosedWin
        } else {
            DisplayStatus::ClosedLoss
        }
    } else if risk > DANGER_RISK {
        DisplayStatus::Danger
    } else if pnl >= 0.0 {
        DisplayStatus::Winning
    } else {
        DisplayStatus::Danger
    }
}
