//! Watchdog scenarios: stop slippage with a race-fill rebalance, and the
//! break-even transition retrying through insufficient balance.

mod common;

use common::{build_engine, event_actions, is_subsequence, MockExchange};
use peak_common::types::{OrderSide, Side};
use peak_executor::engine::manage;
use peak_executor::exchange::{ExchangeError, OrderInfo, OrderStatus};
use peak_executor::state::ExecState;
use peak_executor::types::{ExitOrders, ExitPrices, Position, PositionStatus};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

const SL_ID: i64 = 11;
const TP1_ID: i64 = 12;
const TP2_ID: i64 = 13;

fn open_long() -> Position {
    Position {
        trade_key: "EX_EN_1736800000".to_string(),
        client_id: "EX_EN_1736800000".to_string(),
        side: Side::Long,
        status: PositionStatus::Open,
        opened_s: 1_736_800_000,
        qty: dec!(0.00100),
        prices: Some(ExitPrices {
            entry: dec!(95000.50),
            sl: dec!(94800.00),
            tp1: dec!(95200.00),
            tp2: dec!(95400.00),
        }),
        entry_actual: Some(dec!(95000.50)),
        entry_order_id: Some(1),
        orders: ExitOrders {
            sl: Some(SL_ID),
            tp1: Some(TP1_ID),
            tp2: Some(TP2_ID),
            qty1: dec!(0.00033),
            qty2: dec!(0.00033),
            qty3: dec!(0.00034),
            ..ExitOrders::default()
        },
        ..Position::default()
    }
}

fn resting(id: i64, client_id: &str, stop_price: Option<Decimal>, qty: Decimal) -> OrderInfo {
    OrderInfo {
        order_id: id,
        client_order_id: client_id.to_string(),
        side: OrderSide::Sell,
        status: OrderStatus::New,
        price: Some(dec!(95200.00)),
        stop_price,
        orig_qty: qty,
        executed_qty: Decimal::ZERO,
        cumulative_quote_qty: Decimal::ZERO,
        update_time_ms: 0,
    }
}

fn seed_exchange(api: &MockExchange) {
    api.seed_order(resting(SL_ID, "EX_SL_abc", Some(dec!(94800.00)), dec!(0.00100)));
    api.seed_order(resting(TP1_ID, "EX_TP1_abc", None, dec!(0.00033)));
    api.seed_order(resting(TP2_ID, "EX_TP2_abc", None, dec!(0.00034)));
}

#[tokio::test]
async fn test_stop_slippage_with_race_fill_rebalance() {
    let dir = tempfile::tempdir().unwrap();
    let api = MockExchange::new();
    seed_exchange(&api);

    let mut st = ExecState::default();
    let mut pos = open_long();
    // The trigger was armed a while ago and the stop status poll is
    // throttled out: this tick goes straight to the fallback plan.
    pos.sl_watchdog_first_trigger_s = Some(1_736_799_990);
    pos.sl_status_next_s = i64::MAX;
    st.position = Some(pos);
    let mut engine = build_engine(dir.path(), api.clone(), st);

    // Mid is through the stop.
    api.set_mid(dec!(94790));

    // Status script for the old stop: pre-cancel read, cancel verify,
    // post-market verify showing a 0.00040 race-fill.
    let base = resting(SL_ID, "EX_SL_abc", Some(dec!(94800.00)), dec!(0.00100));
    api.script_status(
        SL_ID,
        vec![
            base.clone(),
            OrderInfo {
                status: OrderStatus::Canceled,
                ..base.clone()
            },
            OrderInfo {
                status: OrderStatus::Filled,
                executed_qty: dec!(0.00040),
                cumulative_quote_qty: dec!(0.00040) * dec!(94800),
                ..base.clone()
            },
        ],
    );

    manage::tick(&mut engine, 1_736_800_100).await.unwrap();

    // One forward flatten, one reverse-side rebalance for the extra fill.
    let calls = api.market_calls();
    assert_eq!(calls.len(), 2, "flatten + rebalance, got {calls:?}");
    assert_eq!(calls[0].side, OrderSide::Sell);
    assert_eq!(calls[0].qty, dec!(0.00100));
    assert!(calls[0].client_id.starts_with("EX_SL_WD_"));
    assert_eq!(calls[1].side, OrderSide::Buy);
    assert_eq!(calls[1].qty, dec!(0.00040));
    assert!(calls[1].client_id.starts_with("EX_REBAL_"));

    assert!(engine.st.position.is_none(), "position finalized");
    let actions = event_actions(&engine);
    assert!(is_subsequence(
        &actions,
        &["SL_MARKET_FALLBACK", "DOUBLE_FILL_REBALANCE", "POSITION_CLOSED"],
    ));
}

#[tokio::test]
async fn test_sl_done_at_tick_entry_finalizes_without_trading() {
    let dir = tempfile::tempdir().unwrap();
    let api = MockExchange::new();
    // Venue already shows everything terminal.
    api.seed_order(resting(SL_ID, "EX_SL_abc", Some(dec!(94800.00)), dec!(0.00100)));
    api.set_status(SL_ID, OrderStatus::Filled, dec!(0.00100));

    let mut st = ExecState::default();
    let mut pos = open_long();
    pos.sl_done = true;
    pos.orders.tp1 = None;
    pos.orders.tp2 = None;
    st.position = Some(pos);
    let mut engine = build_engine(dir.path(), api.clone(), st);

    let placements_before = api.stop_placements().len();
    manage::tick(&mut engine, 1_736_800_100).await.unwrap();

    // Finalization-first: the slot is freed and no trading happened.
    assert!(engine.st.position.is_none());
    assert!(api.market_calls().is_empty());
    assert_eq!(api.stop_placements().len(), placements_before);
    let actions = event_actions(&engine);
    assert!(actions.iter().any(|a| a == "POSITION_CLOSED"));
}

#[tokio::test]
async fn test_watchdog_waits_out_grace_period() {
    let dir = tempfile::tempdir().unwrap();
    let api = MockExchange::new();
    seed_exchange(&api);

    let mut st = ExecState::default();
    let mut pos = open_long();
    pos.sl_status_next_s = i64::MAX;
    st.position = Some(pos);
    let mut engine = build_engine(dir.path(), api.clone(), st);
    api.set_mid(dec!(94790));

    // First sighting only arms the trigger; no market order yet.
    manage::tick(&mut engine, 1_736_800_000).await.unwrap();
    assert!(api.market_calls().is_empty());
    assert_eq!(
        engine
            .st
            .position
            .as_ref()
            .unwrap()
            .sl_watchdog_first_trigger_s,
        Some(1_736_800_000)
    );
}

#[tokio::test]
async fn test_breakeven_retries_through_insufficient_balance() {
    let dir = tempfile::tempdir().unwrap();
    let api = MockExchange::new();
    seed_exchange(&api);

    let mut st = ExecState::default();
    st.position = Some(open_long());
    let mut engine = build_engine(dir.path(), api.clone(), st);

    // TP1 fills on the venue; the first break-even placement bounces.
    api.fill(TP1_ID);
    api.fail_next_stop_placements(1, || ExchangeError::Api {
        code: -2010,
        msg: "Account has insufficient balance for requested action.".to_string(),
    });

    let t0 = 1_736_800_000i64;
    manage::tick(&mut engine, t0).await.unwrap();
    {
        let pos = engine.st.position.as_ref().unwrap();
        assert!(pos.tp1_done, "TP1 detection is a fact");
        assert!(pos.tp1_be_pending, "transition still pending");
        assert_eq!(pos.tp1_be_budget.attempts, 1);
        assert!(pos.orders.sl.is_none(), "old stop canceled, none placed");
    }

    // Before the retry delay nothing happens.
    manage::tick(&mut engine, t0 + 2).await.unwrap();
    assert_eq!(engine.st.position.as_ref().unwrap().tp1_be_budget.attempts, 1);

    // After the delay the placement succeeds.
    manage::tick(&mut engine, t0 + 6).await.unwrap();
    {
        let pos = engine.st.position.as_ref().unwrap();
        assert!(pos.tp1_done);
        assert!(!pos.tp1_be_pending);
        assert_eq!(pos.tp1_be_budget.attempts, 0, "budget reset on success");
        assert!(pos.orders.sl.is_some());
        assert_eq!(pos.prices.unwrap().sl, dec!(95000.50), "stop at break-even");
        assert_eq!(pos.sl_status_next_s, 0, "immediate status check scheduled");
    }
    let actions = event_actions(&engine);
    assert!(is_subsequence(&actions, &["TP1_DONE", "BE_PLACE_ERROR", "BE_PLACED"]));
}

#[tokio::test]
async fn test_breakeven_attempts_bounded_then_cooldown() {
    let dir = tempfile::tempdir().unwrap();
    let api = MockExchange::new();
    seed_exchange(&api);

    let mut st = ExecState::default();
    st.position = Some(open_long());
    let mut engine = build_engine(dir.path(), api.clone(), st);
    engine.config.manage.tp1_be_max_attempts = 3;
    engine.config.manage.tp1_be_cooldown_sec = 100;

    api.fill(TP1_ID);
    api.fail_next_stop_placements(3, || ExchangeError::Api {
        code: -2010,
        msg: "Account has insufficient balance for requested action.".to_string(),
    });

    let t0 = 1_736_800_000i64;
    let mut t = t0;
    for _ in 0..6 {
        manage::tick(&mut engine, t).await.unwrap();
        t += 10;
    }
    {
        let pos = engine.st.position.as_ref().unwrap();
        // Capped at 3 attempts, then disabled for the cooldown.
        assert_eq!(pos.tp1_be_budget.attempts, 3);
        assert!(pos.tp1_be_budget.disabled_until_s > 0);
        assert!(pos.tp1_be_pending);
    }

    // After the cooldown the budget resets and the transition resumes.
    let resume = t0 + 300;
    manage::tick(&mut engine, resume).await.unwrap();
    let pos = engine.st.position.as_ref().unwrap();
    assert!(!pos.tp1_be_pending, "placed after cooldown reset");
    assert!(pos.orders.sl.is_some());
}
