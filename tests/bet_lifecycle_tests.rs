mod support;

use chrono::{Duration, Utc};
use tokio::sync::broadcast;

use coc_engine::config::EngineConfig;
use coc_engine::domain::{BattleMetrics, BattleStatus, DisplayStatus, PositionState};
use coc_engine::engine::keeper::LiquidationKeeper;
use coc_engine::engine::scorer;
use coc_engine::error::EngineError;

use support::{approx, TOKEN_A, TOKEN_B};

#[tokio::test]
async fn place_bet_validates_before_touching_the_pool() {
    let h = support::harness(EngineConfig::default()).await;
    let battle = support::active_battle(&h.manager).await;

    let err = h
        .manager
        .place_bet(battle.id, "0xalice", TOKEN_A, 100.0, 0.5)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidLeverage { .. }));

    let err = h
        .manager
        .place_bet(battle.id, "0xalice", TOKEN_A, 100.0, 101.0)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidLeverage { .. }));

    let err = h
        .manager
        .place_bet(battle.id, "0xalice", TOKEN_A, 0.0, 2.0)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidCollateral { .. }));

    let err = h
        .manager
        .place_bet(battle.id, "0xalice", "0xsomething-else", 10.0, 2.0)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidSide { .. }));

    let err = h
        .manager
        .place_bet(battle.id + 100, "0xalice", TOKEN_A, 10.0, 2.0)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::BattleNotFound(_)));

    assert!(approx(h.manager.battle(battle.id).await.unwrap().total_pool, 0.0));
    assert_eq!(h.db.open_position_count().await.unwrap(), 0);
}

#[tokio::test]
async fn bets_are_refused_outside_active_battles() {
    let h = support::harness(EngineConfig::default()).await;
    let now = Utc::now();
    let pending = h
        .manager
        .create_battle(TOKEN_A, TOKEN_B, now + Duration::hours(1), now + Duration::days(1), now)
        .await
        .unwrap();
    assert_eq!(pending.status, BattleStatus::Pending);

    let err = h
        .manager
        .place_bet(pending.id, "0xalice", TOKEN_A, 10.0, 2.0)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::BattleNotActive { status: BattleStatus::Pending, .. }
    ));

    let activated = h.manager.activate_due(now + Duration::hours(2)).await.unwrap();
    assert_eq!(activated, vec![pending.id]);
    h.manager
        .place_bet(pending.id, "0xalice", TOKEN_A, 10.0, 2.0)
        .await
        .unwrap();
}

#[tokio::test]
async fn create_battle_rejects_bad_input() {
    let h = support::harness(EngineConfig::default()).await;
    let now = Utc::now();

    let err = h
        .manager
        .create_battle(TOKEN_A, &TOKEN_A.to_uppercase(), now, now + Duration::days(1), now)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::SameToken(_)));

    let err = h
        .manager
        .create_battle(TOKEN_A, TOKEN_B, now, now - Duration::hours(1), now)
        .await
        .unwrap_err();
    assert_eq!(err, EngineError::InvalidSchedule);
}

#[tokio::test]
async fn valuation_follows_the_live_score() {
    let h = support::harness(EngineConfig::default()).await;
    let battle = support::active_battle(&h.manager).await;
    let bet = h
        .manager
        .place_bet(battle.id, "0xalice", TOKEN_A, 100.0, 20.0)
        .await
        .unwrap();

    // No score yet: no move.
    let flat = h.manager.valuate_position(&bet.id).await.unwrap();
    assert!(approx(flat.pnl, 0.0));
    assert_eq!(flat.status, DisplayStatus::Winning);

    let (m1, m2) = (support::metrics(TOKEN_A, 0), support::metrics(TOKEN_B, 3));
    let score = scorer::compare(&m1, &m2);
    h.live.write().await.insert(
        battle.id,
        BattleMetrics {
            battle_id: battle.id,
            token1: m1,
            token2: m2,
            score,
        },
    );

    // 90 vs 120 against us: 0.2 * -30 / 210 * 100 * 20
    let val = h.manager.valuate_position(&bet.id).await.unwrap();
    let expected = 0.2 * (-30.0 / 210.0) * 100.0 * 20.0;
    assert!(approx(val.pnl, expected));
    assert!(approx(val.liquidation_risk, 57.142857142857146));
    assert_eq!(val.status, DisplayStatus::Danger);

    // Reading twice changes nothing.
    let again = h.manager.valuate_position(&bet.id).await.unwrap();
    assert!(approx(again.pnl, val.pnl));
    assert_eq!(
        h.manager.position(&bet.id).await.unwrap().state,
        PositionState::Open
    );
}

#[tokio::test]
async fn cash_out_realizes_valuation_less_fee() {
    let cfg = EngineConfig {
        cash_out_fee_pct: 0.02,
        ..EngineConfig::default()
    };
    let h = support::harness_with_delta(cfg, 0.05).await;
    let battle = support::active_battle(&h.manager).await;
    let bet = h
        .manager
        .place_bet(battle.id, "0xalice", TOKEN_A, 1000.0, 5.0)
        .await
        .unwrap();

    let result = h.manager.cash_out(&bet.id).await.unwrap();
    assert_eq!(result.new_state, PositionState::CashedOut);
    assert!(approx(result.payout, 1225.0));
    assert!(approx(result.pnl, 225.0));

    let err = h.manager.cash_out(&bet.id).await.unwrap_err();
    assert!(matches!(err, EngineError::PositionNotOpen { .. }));
    assert_eq!(h.db.settlement_count(&bet.id).await.unwrap(), 1);
}

#[tokio::test]
async fn cash_out_requires_an_active_battle() {
    let h = support::harness_with_delta(EngineConfig::default(), 0.1).await;
    let battle = support::active_battle(&h.manager).await;
    let bet = h
        .manager
        .place_bet(battle.id, "0xalice", TOKEN_A, 100.0, 2.0)
        .await
        .unwrap();
    h.manager.complete_battle(battle.id, TOKEN_B).await.unwrap();

    let err = h.manager.cash_out(&bet.id).await.unwrap_err();
    assert!(matches!(err, EngineError::BattleNotActive { .. }));
}

#[tokio::test]
async fn liquidation_needs_risk_at_the_threshold() {
    let h = support::harness_with_delta(EngineConfig::default(), -0.2).await;
    let battle = support::active_battle(&h.manager).await;
    let risky = h
        .manager
        .place_bet(battle.id, "0xalice", TOKEN_A, 100.0, 50.0)
        .await
        .unwrap();
    let safe = h
        .manager
        .place_bet(battle.id, "0xbob", TOKEN_A, 100.0, 5.0)
        .await
        .unwrap();

    let val = h.manager.valuate_position(&risky.id).await.unwrap();
    assert!(approx(val.liquidation_risk, 90.0));

    let result = h.manager.liquidate(&risky.id).await.unwrap();
    assert_eq!(result.new_state, PositionState::Liquidated);
    assert!(approx(result.pnl, -100.0));
    assert!(approx(result.payout, 0.0));

    let err = h.manager.liquidate(&safe.id).await.unwrap_err();
    assert!(matches!(err, EngineError::BelowLiquidationThreshold { .. }));
    assert_eq!(
        h.manager.position(&safe.id).await.unwrap().state,
        PositionState::Open
    );
}

#[tokio::test]
async fn keeper_liquidates_only_when_enabled() {
    let cfg = EngineConfig {
        auto_liquidate: true,
        ..EngineConfig::default()
    };
    let h = support::harness_with_delta(cfg, -0.2).await;
    let battle = support::active_battle(&h.manager).await;
    let risky = h
        .manager
        .place_bet(battle.id, "0xalice", TOKEN_A, 100.0, 50.0)
        .await
        .unwrap();
    h.manager
        .place_bet(battle.id, "0xbob", TOKEN_B, 100.0, 5.0)
        .await
        .unwrap();

    let (m1, m2) = (support::metrics(TOKEN_A, 0), support::metrics(TOKEN_B, 0));
    let update = BattleMetrics {
        battle_id: battle.id,
        score: scorer::compare(&m1, &m2),
        token1: m1,
        token2: m2,
    };

    let (tx, _) = broadcast::channel(4);
    let keeper = LiquidationKeeper::new(h.manager.clone(), tx.subscribe());
    assert_eq!(keeper.handle_update(&update).await.unwrap(), 1);
    assert_eq!(
        h.manager.position(&risky.id).await.unwrap().state,
        PositionState::Liquidated
    );

    // Nothing left above the threshold.
    assert_eq!(keeper.handle_update(&update).await.unwrap(), 0);
}

#[tokio::test]
async fn keeper_only_warns_by_default() {
    let h = support::harness_with_delta(EngineConfig::default(), -0.2).await;
    let battle = support::active_battle(&h.manager).await;
    let risky = h
        .manager
        .place_bet(battle.id, "0xalice", TOKEN_A, 100.0, 50.0)
        .await
        .unwrap();

    let (m1, m2) = (support::metrics(TOKEN_A, 0), support::metrics(TOKEN_B, 0));
    let update = BattleMetrics {
        battle_id: battle.id,
        score: scorer::compare(&m1, &m2),
        token1: m1,
        token2: m2,
    };

    let (tx, _) = broadcast::channel(4);
    let keeper = LiquidationKeeper::new(h.manager.clone(), tx.subscribe());
    assert_eq!(keeper.handle_update(&update).await.unwrap(), 0);
    assert_eq!(
        h.manager.position(&risky.id).await.unwrap().state,
        PositionState::Open
    );
}

#[tokio::test]
async fn owner_view_mixes_open_and_closed_positions() {
    let h = support::harness_with_delta(EngineConfig::default(), 0.1).await;
    let battle = support::active_battle(&h.manager).await;
    let open = h
        .manager
        .place_bet(battle.id, "0xAlice", TOKEN_A, 100.0, 2.0)
        .await
        .unwrap();
    let cashed = h
        .manager
        .place_bet(battle.id, "0xalice", TOKEN_B, 50.0, 4.0)
        .await
        .unwrap();
    h.manager.cash_out(&cashed.id).await.unwrap();

    let views = h.manager.positions_for_owner("0xALICE").await.unwrap();
    assert_eq!(views.len(), 2);

    let (_, open_val) = views.iter().find(|(p, _)| p.id == open.id).unwrap();
    assert!(approx(open_val.pnl, 20.0));
    assert_eq!(open_val.status, DisplayStatus::Winning);

    let (_, closed_val) = views.iter().find(|(p, _)| p.id == cashed.id).unwrap();
    assert!(approx(closed_val.pnl, 20.0));
    assert_eq!(closed_val.status, DisplayStatus::ClosedWin);
}
