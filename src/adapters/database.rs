use chrono::{DateTime, SecondsFormat, Utc};
use eyre::{Result, WrapErr};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};

use crate::domain::{
    Battle, BattleMetrics, BattleStatus, LeaderboardEntry, Position, PositionState, Side,
    TokenMetrics,
};
use crate::engine::scorer;
use crate::engine::settlement::Settlement;

/// System of record for battles, positions and the settlement ledger.
#[derive(Clone)]
pub struct Database {
    pub pool: SqlitePool,
}

impl Database {
    pub async fn new(db_path: &str) -> Result<Self> {
        let url = format!("sqlite:{}?mode=rwc", db_path);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await?;

        let db = Self { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    /// Private database on a single connection; every pooled connection to
    /// `:memory:` would otherwise see its own empty database.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        let db = Self { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS battles (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                token1 TEXT NOT NULL,
                token2 TEXT NOT NULL,
                start_time TEXT NOT NULL,
                end_time TEXT NOT NULL,
                status TEXT NOT NULL,
                winner_side TEXT,
                total_pool REAL NOT NULL DEFAULT 0.0,
                paid_out REAL NOT NULL DEFAULT 0.0
            );

            CREATE TABLE IF NOT EXISTS positions (
                id TEXT PRIMARY KEY,
                battle_id INTEGER NOT NULL REFERENCES battles(id),
                owner TEXT NOT NULL,
                predicted_side TEXT NOT NULL,
                collateral REAL NOT NULL,
                leverage REAL NOT NULL,
                opened_at TEXT NOT NULL,
                state TEXT NOT NULL,
                realized_pnl REAL,
                closed_at TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_positions_battle ON positions(battle_id);
            CREATE INDEX IF NOT EXISTS idx_positions_owner ON positions(owner);

            CREATE TABLE IF NOT EXISTS settlements (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                position_id TEXT NOT NULL UNIQUE,
                battle_id INTEGER NOT NULL,
                owner TEXT NOT NULL,
                new_state TEXT NOT NULL,
                pnl REAL NOT NULL,
                payout REAL NOT NULL,
                liquidation_risk REAL,
                timestamp TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS metric_snapshots (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                battle_id INTEGER NOT NULL,
                token TEXT NOT NULL,
                volume_usd_24h REAL NOT NULL,
                price_usd REAL NOT NULL,
                liquidity_usd REAL NOT NULL,
                tx_count_24h INTEGER NOT NULL,
                score REAL NOT NULL,
                timestamp TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // --- Battles ---

    pub async fn insert_battle(
        &self,
        token1: &str,
        token2: &str,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        status: BattleStatus,
    ) -> Result<Battle> {
        let id = sqlx::query(
            "INSERT INTO battles (token1, token2, start_time, end_time, status) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(token1)
        .bind(token2)
        .bind(ts(start_time))
        .bind(ts(end_time))
        .bind(status.to_string())
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        self.get_battle(id)
            .await?
            .ok_or_else(|| eyre::eyre!("battle {} vanished after insert", id))
    }

    pub async fn get_battle(&self, id: i64) -> Result<Option<Battle>> {
        let row = sqlx::query_as::<_, BattleRow>(
            "SELECT id, token1, token2, start_time, end_time, status, winner_side, total_pool, paid_out FROM battles WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Battle::try_from).transpose()
    }

    pub async fn list_battles(&self, status: Option<BattleStatus>) -> Result<Vec<Battle>> {
        let rows = match status {
            Some(status) => {
                sqlx::query_as::<_, BattleRow>(
                    "SELECT id, token1, token2, start_time, end_time, status, winner_side, total_pool, paid_out FROM battles WHERE status = ? ORDER BY id",
                )
                .bind(status.to_string())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, BattleRow>(
                    "SELECT id, token1, token2, start_time, end_time, status, winner_side, total_pool, paid_out FROM battles ORDER BY id",
                )
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.into_iter().map(Battle::try_from).collect()
    }

    /// Pending battles whose start time has passed become Active.
    pub async fn activate_due(&self, now: DateTime<Utc>) -> Result<Vec<i64>> {
        let rows: Vec<(i64,)> = sqlx::query_as(
            "UPDATE battles SET status = 'Active' WHERE status = 'Pending' AND start_time <= ? RETURNING id",
        )
        .bind(ts(now))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| r.0).collect())
    }

    /// Active → Completed. False if the battle was no longer Active.
    pub async fn complete_battle(&self, id: i64, winner: Side) -> Result<bool> {
        let done = sqlx::query(
            "UPDATE battles SET status = 'Completed', winner_side = ? WHERE id = ? AND status = 'Active'",
        )
        .bind(winner.to_string())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected() == 1)
    }

    /// Pending or Active → Cancelled. False if the battle had already finished.
    pub async fn cancel_battle(&self, id: i64) -> Result<bool> {
        let done = sqlx::query(
            "UPDATE battles SET status = 'Cancelled' WHERE id = ? AND status IN ('Pending', 'Active')",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected() == 1)
    }

    /// Mirrors a battle read from the contracts. Payouts already credited
    /// locally are kept, and a battle that reached a terminal state is never
    /// rewritten.
    pub async fn upsert_battle(&self, battle: &Battle) -> Result<()> {
        sqlx::query(
            "INSERT INTO battles (id, token1, token2, start_time, end_time, status, winner_side, total_pool)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                token1 = excluded.token1,
                token2 = excluded.token2,
                start_time = excluded.start_time,
                end_time = excluded.end_time,
                status = excluded.status,
                winner_side = excluded.winner_side,
                total_pool = excluded.total_pool
             WHERE battles.status NOT IN ('Completed', 'Cancelled')",
        )
        .bind(battle.id)
        .bind(&battle.token1)
        .bind(&battle.token2)
        .bind(ts(battle.start_time))
        .bind(ts(battle.end_time))
        .bind(battle.status.to_string())
        .bind(battle.winner_side.map(|s| s.to_string()))
        .bind(battle.total_pool)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // --- Positions ---

    /// Mirrors a position read from the contracts. A position already closed
    /// locally keeps its terminal state and realized pnl.
    pub async fn upsert_position(&self, pos: &Position) -> Result<()> {
        sqlx::query(
            "INSERT INTO positions (id, battle_id, owner, predicted_side, collateral, leverage, opened_at, state)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                state = CASE WHEN positions.state = 'Open' THEN excluded.state ELSE positions.state END",
        )
        .bind(&pos.id)
        .bind(pos.battle_id)
        .bind(&pos.owner)
        .bind(pos.predicted_side.to_string())
        .bind(pos.collateral)
        .bind(pos.leverage)
        .bind(ts(pos.opened_at))
        .bind(pos.state.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Stores a new position and grows the battle pool by its collateral in
    /// one transaction. False, with nothing written, if the battle stopped
    /// being Active.
    pub async fn insert_position(&self, pos: &Position) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let grown = sqlx::query(
            "UPDATE battles SET total_pool = total_pool + ? WHERE id = ? AND status = 'Active'",
        )
        .bind(pos.collateral)
        .bind(pos.battle_id)
        .execute(&mut *tx)
        .await?;
        if grown.rows_affected() != 1 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            "INSERT INTO positions (id, battle_id, owner, predicted_side, collateral, leverage, opened_at, state) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&pos.id)
        .bind(pos.battle_id)
        .bind(&pos.owner)
        .bind(pos.predicted_side.to_string())
        .bind(pos.collateral)
        .bind(pos.leverage)
        .bind(ts(pos.opened_at))
        .bind(pos.state.to_string())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    pub async fn get_position(&self, id: &str) -> Result<Option<Position>> {
        let row = sqlx::query_as::<_, PositionRow>(
            "SELECT id, battle_id, owner, predicted_side, collateral, leverage, opened_at, state, realized_pnl, closed_at FROM positions WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Position::try_from).transpose()
    }

    pub async fn positions_for_battle(&self, battle_id: i64) -> Result<Vec<Position>> {
        let rows = sqlx::query_as::<_, PositionRow>(
            "SELECT id, battle_id, owner, predicted_side, collateral, leverage, opened_at, state, realized_pnl, closed_at FROM positions WHERE battle_id = ? ORDER BY opened_at",
        )
        .bind(battle_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Position::try_from).collect()
    }

    pub async fn positions_for_owner(&self, owner: &str) -> Result<Vec<Position>> {
        let rows = sqlx::query_as::<_, PositionRow>(
            "SELECT id, battle_id, owner, predicted_side, collateral, leverage, opened_at, state, realized_pnl, closed_at FROM positions WHERE owner = ? COLLATE NOCASE ORDER BY opened_at DESC",
        )
        .bind(owner)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Position::try_from).collect()
    }

    /// Writes a terminal transition, its ledger row and the pool payout in
    /// one transaction. The position update only matches while the stored
    /// state is still `Open`; false means another writer got there first and
    /// nothing was written.
    pub async fn apply_settlement(
        &self,
        settlement: &Settlement,
        liquidation_risk: Option<f64>,
    ) -> Result<bool> {
        let pos = &settlement.position;
        let result = &settlement.result;
        let closed_at = pos.closed_at.unwrap_or_else(Utc::now);

        let mut tx = self.pool.begin().await?;

        let moved = sqlx::query(
            "UPDATE positions SET state = ?, realized_pnl = ?, closed_at = ? WHERE id = ? AND state = 'Open'",
        )
        .bind(result.new_state.to_string())
        .bind(result.pnl)
        .bind(ts(closed_at))
        .bind(&pos.id)
        .execute(&mut *tx)
        .await?;
        if moved.rows_affected() != 1 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            "INSERT INTO settlements (position_id, battle_id, owner, new_state, pnl, payout, liquidation_risk, timestamp) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&pos.id)
        .bind(pos.battle_id)
        .bind(&pos.owner)
        .bind(result.new_state.to_string())
        .bind(result.pnl)
        .bind(result.payout)
        .bind(liquidation_risk)
        .bind(ts(closed_at))
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE battles SET paid_out = paid_out + ? WHERE id = ?")
            .bind(result.payout)
            .bind(pos.battle_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(true)
    }

    pub async fn settlement_count(&self, position_id: &str) -> Result<i64> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM settlements WHERE position_id = ?")
            .bind(position_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }

    pub async fn open_position_count(&self) -> Result<i64> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM positions WHERE state = 'Open'")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }

    // --- Metrics ---

    pub async fn record_metrics(&self, metrics: &BattleMetrics) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for token in [&metrics.token1, &metrics.token2] {
            insert_snapshot(&mut tx, metrics.battle_id, token).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    // --- Leaderboard ---

    /// Bettors over their closed positions, best realized pnl first.
    pub async fn leaderboard(&self, limit: i64) -> Result<Vec<LeaderboardEntry>> {
        let rows = sqlx::query_as::<_, LeaderboardRow>(
            "SELECT owner,
                    COUNT(*) AS total_bets,
                    SUM(collateral) AS total_volume,
                    SUM(CASE WHEN realized_pnl > 0 THEN 1 ELSE 0 END) AS wins,
                    SUM(COALESCE(realized_pnl, 0.0)) AS profit_loss
             FROM positions
             WHERE state != 'Open'
             GROUP BY owner
             ORDER BY profit_loss DESC, total_volume DESC
             LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .enumerate()
            .map(|(i, r)| LeaderboardEntry {
                rank: i + 1,
                win_rate: if r.total_bets > 0 {
                    r.wins as f64 / r.total_bets as f64 * 100.0
                } else {
                    0.0
                },
                address: r.owner,
                total_bets: r.total_bets,
                total_volume: r.total_volume,
                profit_loss: r.profit_loss,
            })
            .collect())
    }
}

async fn insert_snapshot(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    battle_id: i64,
    token: &TokenMetrics,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO metric_snapshots (battle_id, token, volume_usd_24h, price_usd, liquidity_usd, tx_count_24h, score, timestamp) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(battle_id)
    .bind(&token.address)
    .bind(token.volume_usd_24h)
    .bind(token.price_usd)
    .bind(token.liquidity_usd)
    .bind(token.tx_count_24h as i64)
    .bind(scorer::score(token))
    .bind(ts(token.timestamp))
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Fixed-width UTC timestamps so stored values compare correctly as text.
fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .wrap_err_with(|| format!("bad timestamp {}", s))?
        .with_timezone(&Utc))
}

// --- Row types for sqlx ---

#[derive(sqlx::FromRow)]
struct BattleRow {
    id: i64,
    token1: String,
    token2: String,
    start_time: String,
    end_time: String,
    status: String,
    winner_side: Option<String>,
    total_pool: f64,
    paid_out: f64,
}

impl TryFrom<BattleRow> for Battle {
    type Error = eyre::Report;

    fn try_from(r: BattleRow) -> Result<Self> {
        Ok(Battle {
            id: r.id,
            token1: r.token1,
            token2: r.token2,
            start_time: parse_ts(&r.start_time)?,
            end_time: parse_ts(&r.end_time)?,
            status: r
                .status
                .parse::<BattleStatus>()
                .map_err(|e| eyre::eyre!(e))?,
            winner_side: r
                .winner_side
                .map(|s| s.parse::<Side>().map_err(|e| eyre::eyre!(e)))
                .transpose()?,
            total_pool: r.total_pool,
            paid_out: r.paid_out,
        })
    }
}

#[derive(sqlx::FromRow)]
struct PositionRow {
    id: String,
    battle_id: i64,
    owner: String,
    predicted_side: String,
    collateral: f64,
    leverage: f64,
    opened_at: String,
    state: String,
    realized_pnl: Option<f64>,
    closed_at: Option<String>,
}

impl TryFrom<PositionRow> for Position {
    type Error = eyre::Report;

    fn try_from(r: PositionRow) -> Result<Self> {
        Ok(Position {
            id: r.id,
            battle_id: r.battle_id,
            owner: r.owner,
            predicted_side: r
                .predicted_side
                .parse::<Side>()
                .map_err(|e| eyre::eyre!(e))?,
            collateral: r.collateral,
            leverage: r.leverage,
            opened_at: parse_ts(&r.opened_at)?,
            state: r
                .state
                .parse::<PositionState>()
                .map_err(|e| eyre::eyre!(e))?,
            realized_pnl: r.realized_pnl,
            closed_at: r.closed_at.as_deref().map(parse_ts).transpose()?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct LeaderboardRow {
    owner: String,
    total_bets: i64,
    total_volume: f64,
    wins: i64,
    profit_loss: f64,
}
