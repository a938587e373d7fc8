use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::adapters::chain;
use crate::domain::{
    Battle, BattleMetrics, BattleScore, BattleStatus, LeaderboardEntry, Position,
    SettlementResult, TokenMetrics, Valuation,
};
use crate::engine::bet_manager::BetManager;
use crate::engine::scorer;
use crate::error::EngineError;

pub const AUTHORITY_HEADER: &str = "x-authority-key";

pub struct AppState {
    pub manager: BetManager,
    pub authority_key: Option<String>,
    pub start_time: Instant,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/status", get(status))
        .route("/api/score", post(score))
        .route("/api/battles", get(battles).post(create_battle))
        .route("/api/battles/sync", post(sync_battle))
        .route("/api/battles/{id}", get(battle))
        .route("/api/battles/{id}/score", get(battle_score))
        .route("/api/battles/{id}/complete", post(complete_battle))
        .route("/api/battles/{id}/cancel", post(cancel_battle))
        .route("/api/bets", get(bets).post(place_bet))
        .route("/api/bets/{id}/valuation", get(valuation))
        .route("/api/bets/{id}/settle", post(settle))
        .route("/api/bets/{id}/cash-out", post(cash_out))
        .route("/api/bets/{id}/liquidate", post(liquidate))
        .route("/api/leaderboard", get(leaderboard))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// --- Errors ---

pub enum ApiError {
    Engine(EngineError),
    Unauthorized,
    BadRequest(String),
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        ApiError::Engine(e)
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    kind: &'static str,
    recoverable: bool,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::Engine(e) => {
                let status = match &e {
                    EngineError::InvalidLeverage { .. }
                    | EngineError::InvalidCollateral { .. }
                    | EngineError::InvalidSide { .. }
                    | EngineError::SameToken(_)
                    | EngineError::InvalidSchedule => StatusCode::BAD_REQUEST,
                    EngineError::BattleNotFound(_) | EngineError::PositionNotFound(_) => {
                        StatusCode::NOT_FOUND
                    }
                    EngineError::MetricsUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
                    EngineError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
                    _ => StatusCode::CONFLICT,
                };
                (
                    status,
                    ErrorBody {
                        error: e.to_string(),
                        kind: e.kind(),
                        recoverable: e.is_recoverable(),
                    },
                )
            }
            ApiError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                ErrorBody {
                    error: "missing or wrong authority key".into(),
                    kind: "Unauthorized",
                    recoverable: false,
                },
            ),
            ApiError::BadRequest(msg) => (
                StatusCode::BAD_REQUEST,
                ErrorBody {
                    error: msg,
                    kind: "BadRequest",
                    recoverable: false,
                },
            ),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

fn require_authority(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(expected) = state.authority_key.as_deref() else {
        return Err(ApiError::Unauthorized);
    };
    match headers.get(AUTHORITY_HEADER).and_then(|v| v.to_str().ok()) {
        Some(given) if given == expected => Ok(()),
        _ => {
            warn!("Rejected authority call with a missing or wrong key");
            Err(ApiError::Unauthorized)
        }
    }
}

// --- Status ---

#[derive(Serialize)]
struct StatusResponse {
    uptime_secs: u64,
    active_battles: usize,
    open_positions: i64,
    payout_policy: String,
    liquidation_threshold: f64,
    auto_liquidate: bool,
}

async fn status(State(state): State<Arc<AppState>>) -> ApiResult<StatusResponse> {
    let cfg = state.manager.config();
    let active = state.manager.battles(Some(BattleStatus::Active)).await?;
    let open_positions = state
        .manager
        .db()
        .open_position_count()
        .await
        .map_err(EngineError::from)?;

    Ok(Json(StatusResponse {
        uptime_secs: state.start_time.elapsed().as_secs(),
        active_battles: active.len(),
        open_positions,
        payout_policy: format!("{:?}", cfg.payout_policy),
        liquidation_threshold: cfg.liquidation_threshold,
        auto_liquidate: cfg.auto_liquidate,
    }))
}

// --- Scoring ---

/// Client-supplied snapshot. Absent fields count as zero.
#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct MetricsInput {
    address: String,
    symbol: Option<String>,
    name: Option<String>,
    #[serde(rename = "volumeUSD24h")]
    volume_usd_24h: Option<f64>,
    #[serde(rename = "priceUSD")]
    price_usd: Option<f64>,
    #[serde(rename = "liquidityUSD")]
    liquidity_usd: Option<f64>,
    tx_count_24h: Option<u64>,
}

impl From<MetricsInput> for TokenMetrics {
    fn from(m: MetricsInput) -> Self {
        let empty = TokenMetrics::empty(&m.address);
        TokenMetrics {
            symbol: m.symbol.unwrap_or(empty.symbol),
            name: m.name.unwrap_or(empty.name),
            volume_usd_24h: m.volume_usd_24h.unwrap_or(0.0).max(0.0),
            price_usd: m.price_usd.unwrap_or(0.0).max(0.0),
            liquidity_usd: m.liquidity_usd.unwrap_or(0.0).max(0.0),
            tx_count_24h: m.tx_count_24h.unwrap_or(0),
            ..empty
        }
    }
}

#[derive(Deserialize)]
struct ScoreRequest {
    token1: MetricsInput,
    token2: MetricsInput,
}

async fn score(Json(req): Json<ScoreRequest>) -> Json<BattleScore> {
    let m1: TokenMetrics = req.token1.into();
    let m2: TokenMetrics = req.token2.into();
    Json(scorer::compare(&m1, &m2))
}

// --- Battles ---

#[derive(Deserialize)]
struct BattlesQuery {
    status: Option<String>,
}

async fn battles(
    State(state): State<Arc<AppState>>,
    Query(q): Query<BattlesQuery>,
) -> ApiResult<Vec<Battle>> {
    let status = q
        .status
        .map(|s| s.parse::<BattleStatus>())
        .transpose()
        .map_err(ApiError::BadRequest)?;
    Ok(Json(state.manager.battles(status).await?))
}

async fn battle(State(state): State<Arc<AppState>>, Path(id): Path<i64>) -> ApiResult<Battle> {
    Ok(Json(state.manager.battle(id).await?))
}

async fn battle_score(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<Option<BattleMetrics>> {
    state.manager.battle(id).await?;
    Ok(Json(state.manager.live_score(id).await))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateBattleRequest {
    token1: String,
    token2: String,
    start_time: Option<DateTime<Utc>>,
    end_time: DateTime<Utc>,
}

async fn create_battle(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<CreateBattleRequest>,
) -> Result<(StatusCode, Json<Battle>), ApiError> {
    require_authority(&state, &headers)?;
    let now = Utc::now();
    let battle = state
        .manager
        .create_battle(
            &req.token1,
            &req.token2,
            req.start_time.unwrap_or(now),
            req.end_time,
            now,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(battle)))
}

#[derive(Deserialize)]
struct CompleteRequest {
    winner: String,
}

async fn complete_battle(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(req): Json<CompleteRequest>,
) -> ApiResult<Battle> {
    require_authority(&state, &headers)?;
    Ok(Json(state.manager.complete_battle(id, &req.winner).await?))
}

async fn cancel_battle(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> ApiResult<Battle> {
    require_authority(&state, &headers)?;
    Ok(Json(state.manager.cancel_battle(id).await?))
}

#[derive(Deserialize)]
struct SyncBet {
    id: String,
    data: serde_json::Value,
}

#[derive(Deserialize)]
struct SyncRequest {
    battle: serde_json::Value,
    #[serde(default)]
    bets: Vec<SyncBet>,
}

/// Accepts raw `battles(uint256)` / `bets(uint256)` results.
async fn sync_battle(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<SyncRequest>,
) -> ApiResult<Battle> {
    require_authority(&state, &headers)?;
    let battle = chain::decode_battle(req.battle)
        .map_err(|e| ApiError::BadRequest(format!("{:#}", e)))?;
    let bets = req
        .bets
        .into_iter()
        .map(|b| chain::decode_bet(b.data).map(|bet| (b.id, bet)))
        .collect::<eyre::Result<Vec<_>>>()
        .map_err(|e| ApiError::BadRequest(format!("{:#}", e)))?;
    Ok(Json(state.manager.sync_from_chain(battle, bets).await?))
}

// --- Bets ---

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlaceBetRequest {
    battle_id: i64,
    owner: String,
    predicted_winner: String,
    collateral: f64,
    leverage: f64,
}

async fn place_bet(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PlaceBetRequest>,
) -> Result<(StatusCode, Json<Position>), ApiError> {
    let pos = state
        .manager
        .place_bet(
            req.battle_id,
            &req.owner,
            &req.predicted_winner,
            req.collateral,
            req.leverage,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(pos)))
}

#[derive(Deserialize)]
struct BetsQuery {
    owner: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BetView {
    #[serde(flatten)]
    position: Position,
    valuation: Valuation,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BetsResponse {
    active: Vec<BetView>,
    history: Vec<BetView>,
    total_active_value: f64,
    total_pnl: f64,
}

async fn bets(
    State(state): State<Arc<AppState>>,
    Query(q): Query<BetsQuery>,
) -> ApiResult<BetsResponse> {
    let (active, history): (Vec<_>, Vec<_>) = state
        .manager
        .positions_for_owner(&q.owner)
        .await?
        .into_iter()
        .map(|(position, valuation)| BetView { position, valuation })
        .partition(|v| !v.position.state.is_terminal());

    let total_active_value: f64 = active
        .iter()
        .map(|v| v.position.collateral + v.valuation.pnl)
        .sum();
    let total_pnl: f64 = active.iter().map(|v| v.valuation.pnl).sum();

    Ok(Json(BetsResponse {
        active,
        history,
        total_active_value,
        total_pnl,
    }))
}

async fn valuation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Valuation> {
    Ok(Json(state.manager.valuate_position(&id).await?))
}

async fn settle(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<SettlementResult> {
    Ok(Json(state.manager.settle(&id).await?))
}

async fn cash_out(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<SettlementResult> {
    Ok(Json(state.manager.cash_out(&id).await?))
}

async fn liquidate(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<SettlementResult> {
    require_authority(&state, &headers)?;
    Ok(Json(state.manager.liquidate(&id).await?))
}

// --- Leaderboard ---

#[derive(Deserialize)]
struct LeaderboardQuery {
    limit: Option<i64>,
}

async fn leaderboard(
    State(state): State<Arc<AppState>>,
    Query(q): Query<LeaderboardQuery>,
) -> ApiResult<Vec<LeaderboardEntry>> {
    let limit = q.limit.unwrap_or(50).clamp(1, 500);
    Ok(Json(state.manager.leaderboard(limit).await?))
}
