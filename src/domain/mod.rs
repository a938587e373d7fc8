use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One pole of a battle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Side {
    Token1,
    Token2,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Token1 => Side::Token2,
            Side::Token2 => Side::Token1,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Token1 => write!(f, "Token1"),
            Side::Token2 => write!(f, "Token2"),
        }
    }
}

impl std::str::FromStr for Side {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Token1" => Ok(Side::Token1),
            "Token2" => Ok(Side::Token2),
            other => Err(format!("unknown side {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum BattleStatus {
    Pending,
    Active,
    Completed,
    Cancelled,
}

impl BattleStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, BattleStatus::Completed | BattleStatus::Cancelled)
    }

    /// Forward moves only: Pending -> Active -> Completed, and either
    /// non-terminal state -> Cancelled. Staying put is allowed.
    pub fn can_move_to(self, next: BattleStatus) -> bool {
        use BattleStatus::*;
        self == next
            || matches!(
                (self, next),
                (Pending, Active) | (Active, Completed) | (Pending, Cancelled) | (Active, Cancelled)
            )
    }
}

impl std::fmt::Display for BattleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::str::FromStr for BattleStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pending" => Ok(BattleStatus::Pending),
            "Active" => Ok(BattleStatus::Active),
            "Completed" => Ok(BattleStatus::Completed),
            "Cancelled" => Ok(BattleStatus::Cancelled),
            other => Err(format!("unknown battle status {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PositionState {
    Open,
    Settled,
    CashedOut,
    Liquidated,
}

impl PositionState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, PositionState::Open)
    }
}

impl std::fmt::Display for PositionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::str::FromStr for PositionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Open" => Ok(PositionState::Open),
            "Settled" => Ok(PositionState::Settled),
            "CashedOut" => Ok(PositionState::CashedOut),
            "Liquidated" => Ok(PositionState::Liquidated),
            other => Err(format!("unknown position state {other}")),
        }
    }
}

/// Market snapshot for one token, as supplied by a metrics source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TokenMetrics {
    pub address: String,
    pub symbol: String,
    pub name: String,
    #[serde(rename = "volumeUSD24h")]
    pub volume_usd_24h: f64,
    #[serde(rename = "priceUSD")]
    pub price_usd: f64,
    #[serde(rename = "liquidityUSD")]
    pub liquidity_usd: f64,
    pub tx_count_24h: u64,
    pub timestamp: DateTime<Utc>,
}

impl TokenMetrics {
    /// Zero-filled snapshot, the caller's fallback when a source has no data.
    pub fn empty(address: &str) -> Self {
        Self {
            address: address.to_string(),
            symbol: "UNKNOWN".into(),
            name: "Unknown Token".into(),
            volume_usd_24h: 0.0,
            price_usd: 0.0,
            liquidity_usd: 0.0,
            tx_count_24h: 0,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BattleScore {
    pub token1_score: f64,
    pub token2_score: f64,
    pub winner_side: Side,
}

impl BattleScore {
    pub fn score_of(&self, side: Side) -> f64 {
        match side {
            Side::Token1 => self.token1_score,
            Side::Token2 => self.token2_score,
        }
    }

    pub fn margin(&self) -> f64 {
        (self.token1_score - self.token2_score).abs()
    }
}

/// Both snapshots of a battle plus the advisory score computed from them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BattleMetrics {
    pub battle_id: i64,
    pub token1: TokenMetrics,
    pub token2: TokenMetrics,
    pub score: BattleScore,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Battle {
    pub id: i64,
    pub token1: String,
    pub token2: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub status: BattleStatus,
    pub winner_side: Option<Side>,
    pub total_pool: f64,
    /// Sum of payouts credited from the pool so far.
    pub paid_out: f64,
}

impl Battle {
    /// Maps a token address onto its side, case-insensitively.
    pub fn side_of(&self, address: &str) -> Option<Side> {
        if self.token1.eq_ignore_ascii_case(address) {
            Some(Side::Token1)
        } else if self.token2.eq_ignore_ascii_case(address) {
            Some(Side::Token2)
        } else {
            None
        }
    }

    pub fn token_of(&self, side: Side) -> &str {
        match side {
            Side::Token1 => &self.token1,
            Side::Token2 => &self.token2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub id: String,
    pub battle_id: i64,
    pub owner: String,
    pub predicted_side: Side,
    pub collateral: f64,
    pub leverage: f64,
    pub opened_at: DateTime<Utc>,
    pub state: PositionState,
    /// Realized pnl, set on the terminal transition.
    pub realized_pnl: Option<f64>,
    pub closed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DisplayStatus {
    #[serde(rename = "winning")]
    Winning,
    #[serde(rename = "danger")]
    Danger,
    #[serde(rename = "closed-win")]
    ClosedWin,
    #[serde(rename = "closed-loss")]
    ClosedLoss,
}

/// Advisory mark-to-market reading for one position.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Valuation {
    pub position_id: String,
    pub pnl: f64,
    pub pnl_percent: f64,
    pub liquidation_risk: f64,
    pub status: DisplayStatus,
    pub valued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SettlementResult {
    pub position_id: String,
    pub pnl: f64,
    pub pnl_percent: f64,
    pub new_state: PositionState,
    pub payout: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardEntry {
    pub rank: usize,
    pub address: String,
    pub total_bets: i64,
    pub total_volume: f64,
    pub win_rate: f64,
    pub profit_loss: f64,
}
