use crate::domain::{BattleScore, Side, TokenMetrics};

/// Weights shared with the on-chain oracle. Changing any of these makes
/// client-side scores disagree with the authoritative ones.
pub const VOLUME_WEIGHT: f64 = 40.0;
pub const LIQUIDITY_WEIGHT: f64 = 30.0;
pub const PRICE_WEIGHT: f64 = 20.0;
pub const TX_WEIGHT: f64 = 10.0;

/// Weighted score: volume 40%, liquidity 30%, price 20%, tx count 10%.
/// USD volumes and liquidity are taken per thousand.
pub fn score(m: &TokenMetrics) -> f64 {
    let volume = VOLUME_WEIGHT * (finite(m.volume_usd_24h) / 1000.0);
    let liquidity = LIQUIDITY_WEIGHT * (finite(m.liquidity_usd) / 1000.0);
    let price = PRICE_WEIGHT * finite(m.price_usd);
    let tx = TX_WEIGHT * m.tx_count_24h as f64;
    volume + liquidity + price + tx
}

/// Token1 wins only on a strictly greater score; ties go to Token2.
pub fn compare(m1: &TokenMetrics, m2: &TokenMetrics) -> BattleScore {
    let token1_score = score(m1);
    let token2_score = score(m2);
    BattleScore {
        token1_score,
        token2_score,
        winner_side: if token1_score > token2_score {
            Side::Token1
        } else {
            Side::Token2
        },
    }
}

// NaN would poison the comparison, so it counts as no data.
fn finite(v: f64) -> f64 {
    if v.is_finite() {
        v
    } else {
        0.0
    }
}
