use chrono::Utc;
use eyre::{Result, WrapErr};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::domain::TokenMetrics;
use crate::feeds::MetricsSource;

const TOKEN_METRICS_QUERY: &str = r#"
query GetTokenMetrics($tokenAddress: String!) {
  token(id: $tokenAddress) {
    id
    symbol
    name
    volumeUSD
  }
  tokenDayDatas(
    first: 1,
    where: { token: $tokenAddress },
    orderBy: date,
    orderDirection: desc
  ) {
    date
    volumeUSD
    priceUSD
    totalValueLockedUSD
  }
}
"#;

/// Uniswap V4 subgraph client: latest day data per token.
#[derive(Clone)]
pub struct SubgraphClient {
    client: Client,
    url: String,
    retries: u32,
}

#[derive(Debug, Serialize)]
struct GraphRequest<'a> {
    query: &'a str,
    variables: Variables,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Variables {
    token_address: String,
}

#[derive(Debug, Deserialize)]
struct GraphResponse {
    data: Option<TokenData>,
    errors: Option<Vec<serde_json::Value>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenData {
    token: Option<TokenInfo>,
    #[serde(default)]
    token_day_datas: Vec<DayData>,
}

#[derive(Debug, Deserialize)]
struct TokenInfo {
    id: String,
    symbol: Option<String>,
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DayData {
    #[serde(rename = "volumeUSD")]
    volume_usd: Option<String>,
    #[serde(rename = "priceUSD")]
    price_usd: Option<String>,
    #[serde(rename = "totalValueLockedUSD")]
    total_value_locked_usd: Option<String>,
}

impl SubgraphClient {
    pub fn new(url: &str, retries: u32) -> Result<Self> {
        let client = Client::builder()
            .pool_max_idle_per_host(5)
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .wrap_err("Failed to build HTTP client")?;

        Ok(Self {
            client,
            url: url.to_string(),
            retries,
        })
    }

    async fn query_token(&self, address: &str) -> Result<GraphResponse> {
        let req = GraphRequest {
            query: TOKEN_METRICS_QUERY,
            variables: Variables {
                token_address: address.to_lowercase(),
            },
        };

        let resp: GraphResponse = self
            .client
            .post(&self.url)
            .json(&req)
            .send()
            .await
            .wrap_err("subgraph request failed")?
            .error_for_status()
            .wrap_err("subgraph returned an error status")?
            .json()
            .await
            .wrap_err("subgraph parse failed")?;

        Ok(resp)
    }
}

#[async_trait::async_trait]
impl MetricsSource for SubgraphClient {
    async fn fetch_token_metrics(&self, address: &str) -> Result<Option<TokenMetrics>> {
        let mut backoff_ms: u64 = 500;
        let mut attempt = 0;

        loop {
            match self.query_token(address).await {
                Ok(resp) => return Ok(parse_metrics(address, resp)),
                Err(e) if attempt < self.retries => {
                    attempt += 1;
                    warn!(
                        "Subgraph fetch for {} failed (attempt {}/{}), retrying in {}ms: {:?}",
                        address, attempt, self.retries, backoff_ms, e
                    );
                    tokio::time::sleep(std::time::Duration::from_millis(backoff_ms)).await;
                    backoff_ms = (backoff_ms * 2).min(30_000);
                }
                Err(e) => {
                    error!("Subgraph fetch for {} gave up: {:?}", address, e);
                    return Err(e);
                }
            }
        }
    }
}

/// GraphQL errors or a token without day data both mean "no data".
fn parse_metrics(address: &str, resp: GraphResponse) -> Option<TokenMetrics> {
    if let Some(errors) = resp.errors.filter(|e| !e.is_empty()) {
        warn!("Subgraph errors for {}: {:?}", address, errors);
        return None;
    }

    let data = resp.data?;
    let (Some(token), Some(day)) = (data.token, data.token_day_datas.into_iter().next()) else {
        warn!("No subgraph data found for token {}", address);
        return None;
    };

    let num = |v: Option<String>| v.and_then(|s| s.parse::<f64>().ok()).unwrap_or(0.0);

    Some(TokenMetrics {
        address: token.id,
        symbol: token.symbol.unwrap_or_else(|| "UNKNOWN".into()),
        name: token.name.unwrap_or_else(|| "Unknown Token".into()),
        volume_usd_24h: num(day.volume_usd),
        price_usd: num(day.price_usd),
        liquidity_usd: num(day.total_value_locked_usd),
        // Day data carries no transaction count.
        tx_count_24h: 0,
        timestamp: Utc::now(),
    })
}
