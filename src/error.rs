use thiserror::Error;

use crate::domain::{BattleStatus, PositionState};

/// Failures raised by the scoring and settlement core.
///
/// Every operation that returns one of these has left battle and position
/// state exactly as it found it.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("leverage must be between 1 and {max}, got {leverage}")]
    InvalidLeverage { leverage: f64, max: f64 },

    #[error("collateral must be positive, got {collateral}")]
    InvalidCollateral { collateral: f64 },

    #[error("battle {battle_id} is {status}, not Active")]
    BattleNotActive { battle_id: i64, status: BattleStatus },

    #[error("battle {battle_id} is {status}, not Completed")]
    BattleNotCompleted { battle_id: i64, status: BattleStatus },

    #[error("battle {battle_id} is Completed but has no winner recorded")]
    WinnerUnknown { battle_id: i64 },

    #[error("battle {battle_id} cannot move from {from} to {to}")]
    InvalidBattleTransition {
        battle_id: i64,
        from: BattleStatus,
        to: BattleStatus,
    },

    #[error("position cannot move from {from} to {to}")]
    InvalidStateTransition { from: PositionState, to: PositionState },

    #[error("position {position_id} is already {state}")]
    AlreadySettled { position_id: String, state: PositionState },

    #[error("position {position_id} is {state}, not Open")]
    PositionNotOpen { position_id: String, state: PositionState },

    #[error("liquidation risk {risk:.1}% is below the {threshold:.1}% threshold")]
    BelowLiquidationThreshold { risk: f64, threshold: f64 },

    #[error("no metrics available for token {token}")]
    MetricsUnavailable { token: String },

    #[error("position {position_id} was changed by another writer, re-read and retry")]
    ConcurrentSettlementConflict { position_id: String },

    #[error("battle {0} not found")]
    BattleNotFound(i64),

    #[error("position {0} not found")]
    PositionNotFound(String),

    #[error("a battle needs two different tokens, got {0} twice")]
    SameToken(String),

    #[error("battle must end after it starts")]
    InvalidSchedule,

    #[error("token {token} is not part of battle {battle_id}")]
    InvalidSide { battle_id: i64, token: String },

    #[error("storage error: {0}")]
    Storage(String),
}

impl EngineError {
    /// Whether the caller may re-read state and try the same call again.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            EngineError::ConcurrentSettlementConflict { .. } | EngineError::MetricsUnavailable { .. }
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::InvalidLeverage { .. } => "InvalidLeverage",
            EngineError::InvalidCollateral { .. } => "InvalidCollateral",
            EngineError::BattleNotActive { .. } => "BattleNotActive",
            EngineError::BattleNotCompleted { .. } => "BattleNotCompleted",
            EngineError::WinnerUnknown { .. } => "WinnerUnknown",
            EngineError::InvalidBattleTransition { .. } => "InvalidBattleTransition",
            EngineError::InvalidStateTransition { .. } => "InvalidStateTransition",
            EngineError::AlreadySettled { .. } => "AlreadySettled",
            EngineError::PositionNotOpen { .. } => "PositionNotOpen",
            EngineError::BelowLiquidationThreshold { .. } => "BelowLiquidationThreshold",
            EngineError::MetricsUnavailable { .. } => "MetricsUnavailable",
            EngineError::ConcurrentSettlementConflict { .. } => "ConcurrentSettlementConflict",
            EngineError::BattleNotFound(_) => "BattleNotFound",
            EngineError::PositionNotFound(_) => "PositionNotFound",
            EngineError::SameToken(_) => "SameToken",
            EngineError::InvalidSchedule => "InvalidSchedule",
            EngineError::InvalidSide { .. } => "InvalidSide",
            EngineError::Storage(_) => "Storage",
        }
    }
}

impl From<eyre::Report> for EngineError {
    fn from(e: eyre::Report) -> Self {
        let chain: Vec<String> = e.chain().map(|c| c.to_string()).collect();
        EngineError::Storage(chain.join(": "))
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;
