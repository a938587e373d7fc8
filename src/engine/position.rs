use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::{Battle, BattleStatus, Position, PositionState, Side};
use crate::error::{EngineError, EngineResult};

/// Validates and builds a new open position. Nothing is created on failure.
pub fn open(
    battle: &Battle,
    owner: &str,
    side: Side,
    collateral: f64,
    leverage: f64,
    max_leverage: f64,
    now: DateTime<Utc>,
) -> EngineResult<Position> {
    check_terms(collateral, leverage, max_leverage)?;
    if battle.status != BattleStatus::Active {
        return Err(EngineError::BattleNotActive {
            battle_id: battle.id,
            status: battle.status,
        });
    }

    Ok(Position {
        id: Uuid::new_v4().to_string(),
        battle_id: battle.id,
        owner: owner.to_string(),
        predicted_side: side,
        collateral,
        leverage,
        opened_at: now,
        state: PositionState::Open,
        realized_pnl: None,
        closed_at: None,
    })
}

/// Leverage in `[1, max_leverage]` and strictly positive collateral. Applies
/// to every position the engine stores, however it arrives.
pub fn check_terms(collateral: f64, leverage: f64, max_leverage: f64) -> EngineResult<()> {
    // Written so NaN fails both checks.
    if !(leverage >= 1.0 && leverage <= max_leverage) {
        return Err(EngineError::InvalidLeverage {
            leverage,
            max: max_leverage,
        });
    }
    if !(collateral > 0.0 && collateral.is_finite()) {
        return Err(EngineError::InvalidCollateral { collateral });
    }
    Ok(())
}

/// Moves a position to a terminal state. `Open` is the only state that may
/// be left, and only towards a terminal one.
pub fn transition(
    position: &Position,
    new_state: PositionState,
    realized_pnl: f64,
    now: DateTime<Utc>,
) -> EngineResult<Position> {
    if position.state.is_terminal() || !new_state.is_terminal() {
        return Err(EngineError::InvalidStateTransition {
            from: position.state,
            to: new_state,
        });
    }
    Ok(Position {
        state: new_state,
        realized_pnl: Some(realized_pnl),
        closed_at: Some(now),
        ..position.clone()
    })
}
