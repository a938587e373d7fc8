use eyre::{Result, WrapErr};
use serde::Deserialize;

pub const DEFAULT_SUBGRAPH_URL: &str =
    "https://api.thegraph.com/subgraphs/name/uniswap/uniswap-v4-base";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub db_path: String,
    pub dashboard_port: u16,
    pub subgraph_url: String,
    /// Shared secret for oracle/admin endpoints. `None` disables them.
    pub authority_key: Option<String>,
    pub engine: EngineConfig,
}

/// How winner payouts relate to the battle pool.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PayoutPolicy {
    /// `collateral * (leverage - 1) * 0.5` profit regardless of pool size.
    Uncapped,
    /// Winner payouts scaled down so their sum never exceeds what the pool holds.
    ProRata,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ValuationModel {
    /// Deterministic: normalized live score differential.
    Score,
    /// Uniform draw in [-0.2, 0.2] on every read.
    Random,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    pub poll_interval_secs: u64,
    pub cash_out_fee_pct: f64,
    pub liquidation_threshold: f64,
    pub max_leverage: f64,
    pub payout_policy: PayoutPolicy,
    pub valuation_model: ValuationModel,
    pub auto_liquidate: bool,
    pub fetch_retries: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 30,
            cash_out_fee_pct: 0.0,
            liquidation_threshold: 80.0,
            max_leverage: 100.0,
            payout_policy: PayoutPolicy::Uncapped,
            valuation_model: ValuationModel::Score,
            auto_liquidate: false,
            fetch_retries: 3,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let db_path = std::env::var("DB_PATH").unwrap_or_else(|_| "battles.db".to_string());
        let dashboard_port: u16 = std::env::var("DASHBOARD_PORT")
            .unwrap_or_else(|_| "3001".to_string())
            .parse()
            .unwrap_or(3001);
        let subgraph_url =
            std::env::var("SUBGRAPH_URL").unwrap_or_else(|_| DEFAULT_SUBGRAPH_URL.to_string());
        let authority_key = std::env::var("AUTHORITY_KEY").ok().filter(|k| !k.is_empty());

        let defaults = EngineConfig::default();
        let engine = EngineConfig {
            poll_interval_secs: env_parse("POLL_INTERVAL_SECS", defaults.poll_interval_secs),
            cash_out_fee_pct: env_parse("CASH_OUT_FEE_PCT", defaults.cash_out_fee_pct),
            liquidation_threshold: env_parse("LIQUIDATION_THRESHOLD", defaults.liquidation_threshold),
            max_leverage: env_parse("MAX_LEVERAGE", defaults.max_leverage),
            payout_policy: env_enum("PAYOUT_POLICY", defaults.payout_policy)?,
            valuation_model: env_enum("VALUATION_MODEL", defaults.valuation_model)?,
            auto_liquidate: env_parse("AUTO_LIQUIDATE", defaults.auto_liquidate),
            fetch_retries: env_parse("FETCH_RETRIES", defaults.fetch_retries),
        };

        if !(0.0..1.0).contains(&engine.cash_out_fee_pct) {
            eyre::bail!("CASH_OUT_FEE_PCT must be in [0, 1), got {}", engine.cash_out_fee_pct);
        }

        Ok(Config {
            db_path,
            dashboard_port,
            subgraph_url,
            authority_key,
            engine,
        })
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Unit enum variants parsed from their snake_case names.
fn env_enum<T: serde::de::DeserializeOwned>(key: &str, default: T) -> Result<T> {
    match std::env::var(key) {
        Ok(v) => parse_enum(&v).wrap_err_with(|| format!("invalid {}", key)),
        Err(_) => Ok(default),
    }
}

fn parse_enum<T: serde::de::DeserializeOwned>(value: &str) -> Result<T> {
    let value = value.trim().to_lowercase();
    Ok(serde_json::from_value(serde_json::Value::String(value))?)
}
