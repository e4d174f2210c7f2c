//! End-to-end lifecycle: PEAK signal to a fully managed close through
//! TP1 / break-even / TP2 / trailing, against the scripted mock exchange.

mod common;

use common::{build_engine, event_actions, is_subsequence, MockExchange};
use peak_executor::engine::{entry, manage};
use peak_executor::exchange::OrderStatus;
use peak_executor::signal::PeakEvent;
use peak_executor::state::ExecState;
use peak_executor::types::PositionStatus;
use rust_decimal_macros::dec;

fn peak_event(ts: &str, kind: &str, price: &str) -> PeakEvent {
    PeakEvent::parse_line(&format!(
        r#"{{"action":"PEAK","ts":"{ts}","kind":"{kind}","price":{price},"source":"DeltaScout"}}"#
    ))
    .unwrap()
}

#[tokio::test]
async fn test_normal_tp2_close_event_stream() {
    let dir = tempfile::tempdir().unwrap();
    let api = MockExchange::new();
    let mut engine = build_engine(dir.path(), api.clone(), ExecState::default());

    let t0 = 1_736_800_000i64;

    // Signal arrives; a LIMIT entry rests on the venue.
    let evt = peak_event("2025-01-13T20:00:00Z", "long", "95000.0");
    entry::try_open(&mut engine, &evt, t0).await;
    {
        let pos = engine.st.position.as_ref().expect("position created");
        assert_eq!(pos.status, PositionStatus::Pending);
        assert_eq!(pos.prices.unwrap().entry, dec!(95000.50));
        assert_eq!(pos.qty, dec!(0.00105));
    }
    let entry_id = engine.st.position.as_ref().unwrap().entry_order_id.unwrap();

    // Entry fills; the three exit legs go out.
    api.fill(entry_id);
    entry::manage_pending(&mut engine, t0 + 5).await.unwrap();
    let (sl_id, tp1_id, tp2_id) = {
        let pos = engine.st.position.as_ref().unwrap();
        assert_eq!(pos.status, PositionStatus::Open);
        let o = &pos.orders;
        assert_eq!(o.qty1 + o.qty2 + o.qty3, pos.qty);
        (o.sl.unwrap(), o.tp1.unwrap(), o.tp2.unwrap())
    };

    // TP1 fills: stop moves to break-even at the actual entry price.
    api.fill(tp1_id);
    let t1 = t0 + 40;
    manage::tick(&mut engine, t1).await.unwrap();
    let be_sl_id = {
        let pos = engine.st.position.as_ref().unwrap();
        assert!(pos.tp1_done);
        assert!(!pos.tp1_be_pending, "break-even completed");
        assert_eq!(pos.prices.unwrap().sl, dec!(95000.50));
        let new_sl = pos.orders.sl.unwrap();
        assert_ne!(new_sl, sl_id, "stop was replaced");
        new_sl
    };
    assert_eq!(
        api.order(sl_id).status,
        OrderStatus::Canceled,
        "old stop canceled before the replacement was placed"
    );

    // TP2 fills: trailing activates on the third leg.
    api.set_mid(dec!(95300));
    api.fill(tp2_id);
    let t2 = t1 + 40;
    manage::tick(&mut engine, t2).await.unwrap();
    let trail_sl_id = {
        let pos = engine.st.position.as_ref().unwrap();
        assert!(pos.tp2_done);
        assert!(pos.trail_active);
        assert!(!pos.tp2_synthetic);
        assert_eq!(pos.trail_qty, dec!(0.00035));
        // Swing low 95050 minus the 15 USD buffer.
        assert_eq!(pos.trail_sl_price, Some(dec!(95035.00)));
        let id = pos.orders.sl.unwrap();
        assert_ne!(id, be_sl_id);
        id
    };
    assert_eq!(api.order(be_sl_id).status, OrderStatus::Canceled);

    // The trailing stop fills: finalization-first closes the slot.
    api.fill(trail_sl_id);
    let t3 = t2 + 40;
    manage::tick(&mut engine, t3).await.unwrap();
    assert!(engine.st.position.is_none(), "slot cleared");
    assert!(engine.st.cooldown_until_s > t3, "cooldown armed");
    assert!(engine.st.last_closed.is_some());

    let actions = event_actions(&engine);
    assert!(
        is_subsequence(
            &actions,
            &[
                "ENTRY_PLACED",
                "ENTRY_FILLED",
                "EXITS_PLACED",
                "TP1_DONE",
                "BE_PLACED",
                "TP2_DONE",
                "TRAIL_ACTIVATED",
                "SL_FILLED",
                "POSITION_CLOSED",
            ],
        ),
        "unexpected event stream: {actions:?}"
    );

    // No watchdog market orders fired during a clean lifecycle.
    assert!(api.market_calls().is_empty());
}

#[tokio::test]
async fn test_signal_ignored_while_position_open() {
    let dir = tempfile::tempdir().unwrap();
    let api = MockExchange::new();
    let mut engine = build_engine(dir.path(), api.clone(), ExecState::default());

    let t0 = 1_736_800_000i64;
    entry::try_open(&mut engine, &peak_event("2025-01-13T20:00:00Z", "long", "95000.0"), t0).await;
    let first_key = engine.st.position.as_ref().unwrap().trade_key.clone();

    // A second PEAK while the slot is occupied is skipped.
    entry::try_open(
        &mut engine,
        &peak_event("2025-01-13T20:05:00Z", "long", "95500.0"),
        t0 + 300,
    )
    .await;
    assert_eq!(engine.st.position.as_ref().unwrap().trade_key, first_key);
    let actions = event_actions(&engine);
    assert!(actions.iter().any(|a| a == "SKIP_PEAK"));
}

#[tokio::test]
async fn test_cooldown_blocks_reentry() {
    let dir = tempfile::tempdir().unwrap();
    let api = MockExchange::new();
    let mut st = ExecState::default();
    st.cooldown_until_s = 2_000_000_000;
    let mut engine = build_engine(dir.path(), api.clone(), st);

    entry::try_open(
        &mut engine,
        &peak_event("2025-01-13T20:00:00Z", "long", "95000.0"),
        1_736_800_000,
    )
    .await;
    assert!(engine.st.position.is_none());
}

#[tokio::test]
async fn test_dedup_idempotent_over_signal_replay() {
    let dir = tempfile::tempdir().unwrap();
    let api = MockExchange::new();
    let mut engine = build_engine(dir.path(), api.clone(), ExecState::default());

    let line = r#"{"action":"PEAK","ts":"2025-01-13T20:00:00Z","kind":"long","price":95000.0,"source":"DeltaScout"}"#;
    std::fs::create_dir_all(engine.config.paths.signal_log.parent().unwrap()).unwrap();
    std::fs::write(&engine.config.paths.signal_log, format!("{line}\n{line}\n")).unwrap();

    // Within the stale-PEAK window of the event timestamp.
    let now = 1_736_798_430i64;
    let fresh = engine.ingest_signals(now).await;
    assert_eq!(fresh.len(), 1, "duplicate lines collapse to one event");

    // Replaying the same tail yields nothing new.
    let fresh = engine.ingest_signals(now + 5).await;
    assert!(fresh.is_empty());
}
