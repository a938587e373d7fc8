//! Decoding of BattleManager / BettingPool view results.
//!
//! The contracts return `battles(uint256)` and `bets(uint256)` as positional
//! tuples. They are decoded here, once, into named records; nothing else in
//! the crate indexes into a raw tuple.

use chrono::{DateTime, TimeZone, Utc};
use eyre::{Result, WrapErr};
use serde::Deserialize;

use crate::domain::{Battle, BattleStatus, Position, PositionState};
use crate::engine::position;
use crate::error::{EngineError, EngineResult};

const TOKEN_DECIMALS: i32 = 18;
const LEVERAGE_BPS: f64 = 100.0;
const ZERO_ADDRESS: &str = "0x0000000000000000000000000000000000000000";

/// uint256 as JSON-RPC clients hand it over: decimal string or plain number.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum Uint {
    Str(String),
    Num(u64),
}

impl Uint {
    fn to_u128(&self) -> Result<u128> {
        match self {
            Uint::Num(n) => Ok(*n as u128),
            Uint::Str(s) => s
                .parse::<u128>()
                .wrap_err_with(|| format!("not a uint that fits in 128 bits: {}", s)),
        }
    }

    fn to_i64(&self) -> Result<i64> {
        i64::try_from(self.to_u128()?).wrap_err("uint out of i64 range")
    }

    /// Fixed point with 18 decimals to a float amount.
    fn to_amount(&self) -> Result<f64> {
        Ok(self.to_u128()? as f64 / 10f64.powi(TOKEN_DECIMALS))
    }

    fn to_time(&self) -> Result<DateTime<Utc>> {
        Utc.timestamp_opt(self.to_i64()?, 0)
            .single()
            .ok_or_else(|| eyre::eyre!("timestamp out of range"))
    }
}

#[derive(Debug, Deserialize)]
struct BetTuple(Uint, String, String, Uint, Uint, Uint, bool, bool, bool);

#[derive(Debug, Deserialize)]
struct BattleTuple(
    Uint,
    String,
    String,
    String,
    String,
    Uint,
    Uint,
    Uint,
    Uint,
    String,
    Uint,
    bool,
);

#[derive(Debug, Clone, PartialEq)]
pub struct ChainBet {
    pub battle_id: i64,
    pub bettor: String,
    pub predicted_winner: String,
    pub amount: f64,
    pub leverage: f64,
    pub timestamp: DateTime<Utc>,
    pub settled: bool,
    pub cashed_out: bool,
    pub liquidated: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChainBattle {
    pub id: i64,
    pub token1: String,
    pub token2: String,
    pub deployer1: String,
    pub deployer2: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub status: BattleStatus,
    pub theme: u8,
    pub winner: Option<String>,
    pub total_bets: f64,
    pub spotlight: bool,
}

/// `(battleId, bettor, predictedWinner, amount, leverage, timestamp,
/// settled, cashedOut, liquidated)`
pub fn decode_bet(value: serde_json::Value) -> Result<ChainBet> {
    let BetTuple(battle_id, bettor, predicted_winner, amount, leverage, timestamp, settled, cashed_out, liquidated) =
        serde_json::from_value::<BetTuple>(value).wrap_err("bet tuple has the wrong shape")?;

    Ok(ChainBet {
        battle_id: battle_id.to_i64()?,
        bettor,
        predicted_winner,
        amount: amount.to_amount()?,
        leverage: leverage.to_u128()? as f64 / LEVERAGE_BPS,
        timestamp: timestamp.to_time()?,
        settled,
        cashed_out,
        liquidated,
    })
}

/// `(id, token1, token2, deployer1, deployer2, startTime, endTime, status,
/// theme, winner, totalBets, spotlightBattle)`
pub fn decode_battle(value: serde_json::Value) -> Result<ChainBattle> {
    let BattleTuple(id, token1, token2, deployer1, deployer2, start, end, status, theme, winner, total_bets, spotlight) =
        serde_json::from_value::<BattleTuple>(value).wrap_err("battle tuple has the wrong shape")?;

    let status = match status.to_u128()? {
        0 => BattleStatus::Pending,
        1 => BattleStatus::Active,
        2 => BattleStatus::Completed,
        3 => BattleStatus::Cancelled,
        other => eyre::bail!("unknown battle status {}", other),
    };

    Ok(ChainBattle {
        id: id.to_i64()?,
        token1,
        token2,
        deployer1,
        deployer2,
        start_time: start.to_time()?,
        end_time: end.to_time()?,
        status,
        theme: u8::try_from(theme.to_u128()?).wrap_err("theme out of range")?,
        winner: Some(winner).filter(|w| !w.eq_ignore_ascii_case(ZERO_ADDRESS)),
        total_bets: total_bets.to_amount()?,
        spotlight,
    })
}

impl ChainBet {
    pub fn state(&self) -> Result<PositionState> {
        match (self.settled, self.cashed_out, self.liquidated) {
            (false, false, false) => Ok(PositionState::Open),
            (true, false, false) => Ok(PositionState::Settled),
            (false, true, false) => Ok(PositionState::CashedOut),
            (false, false, true) => Ok(PositionState::Liquidated),
            flags => eyre::bail!("bet carries more than one terminal flag: {:?}", flags),
        }
    }

    /// Subject to the same collateral and leverage rules as a bet placed
    /// through the engine.
    pub fn into_position(
        self,
        id: String,
        battle: &Battle,
        max_leverage: f64,
    ) -> EngineResult<Position> {
        position::check_terms(self.amount, self.leverage, max_leverage)?;
        let side = battle
            .side_of(&self.predicted_winner)
            .ok_or_else(|| EngineError::InvalidSide {
                battle_id: battle.id,
                token: self.predicted_winner.clone(),
            })?;
        let state = self.state()?;

        Ok(Position {
            id,
            battle_id: self.battle_id,
            owner: self.bettor,
            predicted_side: side,
            collateral: self.amount,
            leverage: self.leverage,
            opened_at: self.timestamp,
            state,
            realized_pnl: None,
            closed_at: None,
        })
    }
}

impl ChainBattle {
    pub fn into_battle(self) -> EngineResult<Battle> {
        let mut battle = Battle {
            id: self.id,
            token1: self.token1,
            token2: self.token2,
            start_time: self.start_time,
            end_time: self.end_time,
            status: self.status,
            winner_side: None,
            total_pool: self.total_bets,
            paid_out: 0.0,
        };
        if let Some(winner) = self.winner {
            let side = battle.side_of(&winner).ok_or(EngineError::InvalidSide {
                battle_id: self.id,
                token: winner,
            })?;
            battle.winner_side = Some(side);
        }
        Ok(battle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Side;
    use serde_json::json;

    const T1: &str = "0x0000000000000000000000000000000000000001";
    const T2: &str = "0x0000000000000000000000000000000000000002";

    fn battle_json(status: u64, winner: &str) -> serde_json::Value {
        json!([
            "7", T1, T2, "0xd1", "0xd2",
            1_700_000_000u64, "1700604800", status, 0, winner,
            "1500000000000000000000", false
        ])
    }

    #[test]
    fn decodes_battle_tuple() {
        let b = decode_battle(battle_json(2, T1)).unwrap();
        assert_eq!(b.id, 7);
        assert_eq!(b.status, BattleStatus::Completed);
        assert_eq!(b.total_bets, 1500.0);
        assert_eq!(b.start_time.timestamp(), 1_700_000_000);

        let battle = b.into_battle().unwrap();
        assert_eq!(battle.winner_side, Some(Side::Token1));
        assert_eq!(battle.total_pool, 1500.0);
    }

    #[test]
    fn zero_address_means_no_winner() {
        let b = decode_battle(battle_json(1, ZERO_ADDRESS)).unwrap();
        assert!(b.winner.is_none());
        assert_eq!(b.into_battle().unwrap().winner_side, None);
    }

    #[test]
    fn rejects_unknown_status_and_short_tuples() {
        assert!(decode_battle(battle_json(9, T1)).is_err());
        assert!(decode_battle(json!(["1", T1])).is_err());
    }

    #[test]
    fn decodes_bet_tuple_into_position() {
        let bet = decode_bet(json!([
            "7", "0xbettor", T2.to_uppercase().replace("0X", "0x"),
            "500000000000000000000", "1000", "1700000100", false, false, false
        ]))
        .unwrap();
        assert_eq!(bet.amount, 500.0);
        assert_eq!(bet.leverage, 10.0);

        let battle = decode_battle(battle_json(1, ZERO_ADDRESS)).unwrap().into_battle().unwrap();
        let p = bet.into_position("42".into(), &battle, 100.0).unwrap();
        assert_eq!(p.predicted_side, Side::Token2);
        assert_eq!(p.state, PositionState::Open);
        assert_eq!(p.collateral, 500.0);
    }

    #[test]
    fn terminal_flags_map_to_states() {
        let mut bet = decode_bet(json!(["1", "0xb", T1, "1", "100", "0", true, false, false])).unwrap();
        assert_eq!(bet.state().unwrap(), PositionState::Settled);
        bet.settled = false;
        bet.liquidated = true;
        assert_eq!(bet.state().unwrap(), PositionState::Liquidated);
        bet.cashed_out = true;
        assert!(bet.state().is_err());
    }

    #[test]
    fn unknown_predicted_token_is_rejected() {
        let bet = decode_bet(json!(["7", "0xb", "0xdead", "1", "100", "0", false, false, false])).unwrap();
        let battle = decode_battle(battle_json(1, ZERO_ADDRESS)).unwrap().into_battle().unwrap();
        assert!(matches!(bet.into_position("1".into(), &battle, 100.0), Err(EngineError::InvalidSide { .. })));
    }

    #[test]
    fn synced_bets_obey_position_terms() {
        let battle = decode_battle(battle_json(1, ZERO_ADDRESS)).unwrap().into_battle().unwrap();

        let empty = decode_bet(json!(["7", "0xb", T1, "0", "200", "0", false, false, false])).unwrap();
        assert!(matches!(
            empty.into_position("1".into(), &battle, 100.0),
            Err(EngineError::InvalidCollateral { .. })
        ));

        // 50 bps is 0.5x
        let fractional = decode_bet(json!(["7", "0xb", T1, "1000000000000000000", "50", "0", false, false, false])).unwrap();
        assert!(matches!(
            fractional.into_position("2".into(), &battle, 100.0),
            Err(EngineError::InvalidLeverage { .. })
        ));

        let oversized = decode_bet(json!(["7", "0xb", T1, "1000000000000000000", "20000", "0", false, false, false])).unwrap();
        assert!(matches!(
            oversized.into_position("3".into(), &battle, 100.0),
            Err(EngineError::InvalidLeverage { .. })
        ));
    }
}
