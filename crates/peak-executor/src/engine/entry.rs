//! Entry flow: PEAK signal to a resting entry order, and the management
//! of a PENDING entry (status polling, timeout, Plan B fallback).

use chrono::Utc;
use peak_common::steps::{ceil_to_step, floor_to_step};
use peak_common::types::Side;
use rust_decimal::Decimal;
use serde_json::json;

use crate::config::EntryMode;
use crate::exchange::{cancel_ignore_unknown, ExchangeApi, ExchangeError, OrderStatus};
use crate::signal::PeakEvent;
use crate::trail;
use crate::types::{ExitPrices, Position, PositionStatus};

use super::{now_s, reconcile, Engine};

/// Entry price builder: offset past the close, rounded *directionally* so
/// rounding never makes the trigger harder, and kept at least one tick
/// beyond the close.
pub fn build_entry_price(engine: &Engine, side: Side, close: Decimal) -> Decimal {
    let tick = engine.config.sizing.tick_size;
    let offset = engine.config.entry.offset_usd;
    match side {
        Side::Long => {
            let raw = (close + offset).max(close + tick);
            floor_to_step(raw, tick).max(ceil_to_step(close + tick, tick))
        }
        Side::Short => {
            let raw = (close - offset).min(close - tick);
            ceil_to_step(raw, tick).min(floor_to_step(close - tick, tick))
        }
    }
}

/// Take-profit ladder from the real risk (entry ↔ stop distance).
/// Directional rounding: slightly easier to hit.
pub fn compute_tps(engine: &Engine, side: Side, entry: Decimal, sl: Decimal) -> Vec<Decimal> {
    let tick = engine.config.sizing.tick_size;
    let risk = (entry - sl).abs();
    if risk <= Decimal::ZERO {
        return Vec::new();
    }
    engine
        .config
        .risk
        .tp_r_list
        .iter()
        .map(|rmult| match side {
            Side::Long => floor_to_step(entry + *rmult * risk, tick),
            Side::Short => ceil_to_step(entry - *rmult * risk, tick),
        })
        .collect()
}

fn notional_to_qty(engine: &Engine, entry: Decimal) -> Decimal {
    if entry <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    floor_to_step(
        engine.config.sizing.qty_usd / entry,
        engine.config.sizing.qty_step,
    )
}

fn qty_valid(engine: &Engine, qty: Decimal, entry: Decimal) -> bool {
    qty > Decimal::ZERO
        && qty >= engine.config.sizing.min_qty
        && qty * entry >= engine.config.sizing.min_notional
}

/// Plan B deviation guard: allowed deviation is
/// `max(risk * r_mult, usd_cap)` when the USD cap is set, else the
/// R-multiple bound alone; optionally refuses entries past TP1.
pub fn planb_market_allowed(
    engine: &Engine,
    pos: &Position,
    px_exec: Decimal,
) -> (bool, &'static str) {
    let Some(prices) = pos.prices else {
        return (false, "bad_prices");
    };
    let risk = (prices.entry - prices.sl).abs();
    if risk <= Decimal::ZERO {
        return (false, "bad_prices");
    }
    let r_bound = risk * engine.config.entry.planb_max_dev_r_mult;
    let usd_cap = engine.config.entry.planb_max_dev_usd;
    let max_dev = if usd_cap > Decimal::ZERO {
        r_bound.max(usd_cap)
    } else {
        r_bound
    };
    let dev = (px_exec - prices.entry).abs();
    if max_dev > Decimal::ZERO && dev > max_dev {
        return (false, "deviation_too_large");
    }
    if engine.config.entry.planb_abort_if_past_tp1 {
        let past = match pos.side {
            Side::Long => px_exec >= prices.tp1,
            Side::Short => px_exec <= prices.tp1,
        };
        if past {
            return (false, "past_tp1");
        }
    }
    (true, "ok")
}

/// Handle a fresh PEAK: guards, price/stop construction, margin borrow,
/// entry placement, and the PENDING position record.
pub async fn try_open(engine: &mut Engine, evt: &PeakEvent, now: i64) {
    // Event-triggered reconciliation before the guards so a manual close
    // frees the slot for this very signal.
    reconcile::sync(engine, reconcile::SyncReason::PeakEvent, now).await;

    if engine.st.locked(now) {
        engine
            .notifier
            .event("SKIP_PEAK", json!({ "reason": "position_lock" }));
        return;
    }
    if engine.st.in_cooldown(now) {
        engine
            .notifier
            .event("SKIP_PEAK", json!({ "reason": "cooldown" }));
        return;
    }
    if engine.st.has_open_position() {
        engine
            .notifier
            .event("SKIP_PEAK", json!({ "reason": "position_already_open" }));
        return;
    }

    let Some(side) = evt.side() else {
        return;
    };
    let Some(close) = evt.price.filter(|p| *p > Decimal::ZERO) else {
        engine
            .notifier
            .event("SKIP_OPEN", json!({ "reason": "bad_price" }));
        return;
    };

    // Swing context for the initial stop comes from the bar feed.
    let bars = match trail::read_recent_bars(
        &engine.config.paths.bar_csv,
        engine.config.risk.swing_mins,
    ) {
        Ok(bars) if !bars.is_empty() => bars,
        Ok(_) => {
            engine
                .notifier
                .event("SKIP_OPEN", json!({ "reason": "bar_feed_unavailable" }));
            return;
        }
        Err(e) => {
            engine
                .notifier
                .event("SKIP_OPEN", json!({ "reason": "bar_feed_error", "error": e.to_string() }));
            return;
        }
    };

    let tick = engine.config.sizing.tick_size;
    let entry = build_entry_price(engine, side, close);
    let sl_raw = trail::swing_stop_far(&bars, side, entry, &engine.config.risk);
    // Clamp at least one tick from entry, then round directionally.
    let sl = match side {
        Side::Long => floor_to_step(sl_raw.min(entry - tick), tick),
        Side::Short => ceil_to_step(sl_raw.max(entry + tick), tick),
    };
    let tps = compute_tps(engine, side, entry, sl);
    if tps.len() < 2 {
        engine
            .notifier
            .event("SKIP_OPEN", json!({ "reason": "tps_not_ready" }));
        return;
    }
    let prices = ExitPrices {
        entry,
        sl,
        tp1: tps[0],
        tp2: tps[1],
    };

    let qty = notional_to_qty(engine, entry);
    if !qty_valid(engine, qty, entry) {
        engine.notifier.event(
            "SKIP_OPEN",
            json!({ "reason": "qty_too_small", "qty": qty.to_string(), "entry": entry.to_string() }),
        );
        return;
    }

    // Lock immediately so a crash between placement and persist cannot
    // double-open on restart.
    engine.st.lock_until_s = now + engine.config.manage.lock_sec;
    engine.persist("entry_lock").await;

    let client_id = format!("EX_EN_{now}");

    let mut ledger = std::mem::take(&mut engine.st.margin);
    let borrow = crate::margin::on_before_entry(
        &mut ledger,
        engine.api.as_ref(),
        &engine.config,
        side,
        qty,
        entry,
        &client_id,
    )
    .await;
    engine.st.margin = ledger;
    if let Err(e) = borrow {
        engine.note_exchange_error(&e, "margin borrow before entry");
        engine
            .notifier
            .event("MARGIN_BORROW_ERROR", json!({ "error": e.to_string() }));
        engine.st.lock_until_s = 0;
        engine.persist("entry_borrow_failed").await;
        return;
    }
    engine.persist("entry_borrow").await;

    let placed = match engine.config.entry.mode {
        EntryMode::MarketOnly => {
            engine
                .api
                .place_market(side.entry_side(), qty, &client_id)
                .await
        }
        _ => {
            engine
                .api
                .place_limit(side.entry_side(), qty, entry, &client_id)
                .await
        }
    };
    let order = match placed {
        Ok(order) => order,
        Err(e) => {
            engine.note_exchange_error(&e, "entry placement");
            engine
                .notifier
                .event("LIVE_OPEN_ERROR", json!({ "error": e.to_string() }));
            engine.st.lock_until_s = 0;
            engine.persist("entry_place_failed").await;
            return;
        }
    };

    let mut pos = Position {
        trade_key: client_id.clone(),
        side,
        status: PositionStatus::Pending,
        opened_at: Utc::now(),
        opened_s: now,
        qty,
        prices: Some(prices),
        entry_order_id: Some(order.order_id),
        client_id,
        ..Position::default()
    };
    if order.executed_qty > Decimal::ZERO {
        pos.status = PositionStatus::OpenFilled;
        pos.qty = floor_to_step(order.executed_qty, engine.config.sizing.qty_step);
        pos.entry_actual = order.avg_fill_price();
    }
    let immediately_filled = pos.status == PositionStatus::OpenFilled;
    let trade_key = pos.trade_key.clone();

    engine.st.position = Some(pos);
    engine.persist("entry_placed").await;
    engine
        .notifier
        .event_and_webhook(
            "ENTRY_PLACED",
            json!({
                "side": side.to_string(),
                "entry": entry.to_string(),
                "qty": qty.to_string(),
                "order_id": order.order_id,
                "sl": sl.to_string(),
                "tp1": prices.tp1.to_string(),
                "tp2": prices.tp2.to_string(),
            }),
        )
        .await;

    if immediately_filled {
        on_entry_filled(engine, &trade_key).await;
    }
}

/// Shared post-fill path: margin hook, ENTRY_FILLED event, exits.
async fn on_entry_filled(engine: &mut Engine, trade_key: &str) {
    crate::margin::on_after_entry_opened(&mut engine.st.margin, &engine.config, trade_key);
    engine.persist("entry_filled").await;
    let (order_id, executed) = engine
        .st
        .position
        .as_ref()
        .map(|p| (p.entry_order_id, p.qty))
        .unwrap_or((None, Decimal::ZERO));
    engine
        .notifier
        .event_and_webhook(
            "ENTRY_FILLED",
            json!({ "order_id": order_id, "executed_qty": executed.to_string() }),
        )
        .await;
    super::exits::ensure_exits(engine, "filled").await;
}

/// Manage a PENDING entry: throttled status polls, fill handling, and the
/// timeout path (partial fill, late fill, Plan B market fallback).
pub async fn manage_pending(engine: &mut Engine, now: i64) -> Result<(), ExchangeError> {
    let Some(pos) = engine.st.position.as_ref() else {
        return Ok(());
    };
    if pos.status != PositionStatus::Pending {
        return Ok(());
    }
    let Some(order_id) = pos.entry_order_id else {
        return Ok(());
    };
    if now < pos.planb_next_action_s {
        return Ok(());
    }

    let order = engine.api.status(order_id).await?;
    match order.status {
        OrderStatus::Filled => {
            let trade_key = {
                let pos = engine.st.position.as_mut().expect("checked above");
                pos.status = PositionStatus::OpenFilled;
                pos.qty = floor_to_step(order.executed_qty, engine.config.sizing.qty_step);
                pos.entry_actual = order.avg_fill_price();
                pos.trade_key.clone()
            };
            on_entry_filled(engine, &trade_key).await;
            return Ok(());
        }
        OrderStatus::Canceled | OrderStatus::Rejected | OrderStatus::Expired
        | OrderStatus::Missing => {
            let pos = engine.st.position.take().expect("checked above");
            engine.notifier.event(
                "ENTRY_DONE",
                json!({ "status": order.status.to_string(), "order_id": order_id }),
            );
            engine.close_slot(pos, &format!("ENTRY_{}", order.status)).await;
            // An aborted entry should not block the next signal.
            engine.st.cooldown_until_s = 0;
            engine.persist("entry_aborted").await;
            return Ok(());
        }
        _ => {}
    }

    // Timeout path.
    let opened_s = engine
        .st
        .position
        .as_ref()
        .map(|p| p.opened_s)
        .unwrap_or(now);
    if now - opened_s < engine.config.entry.timeout_sec {
        // Still resting: throttle the next status poll.
        let pos = engine.st.position.as_mut().expect("checked above");
        pos.planb_next_action_s = now + engine.config.manage.status_poll_every_sec;
        engine.persist("entry_poll_throttle").await;
        return Ok(());
    }

    if order.executed_qty > Decimal::ZERO {
        // Partially filled at timeout: cancel the remainder, keep the
        // filled part and proceed to exits.
        let _ = cancel_ignore_unknown(engine.api.as_ref(), order_id).await;
        let trade_key = {
            let pos = engine.st.position.as_mut().expect("checked above");
            pos.status = PositionStatus::OpenFilled;
            pos.qty = floor_to_step(order.executed_qty, engine.config.sizing.qty_step);
            pos.entry_actual = order.avg_fill_price();
            pos.trade_key.clone()
        };
        engine.notifier.event(
            "ENTRY_TIMEOUT_PARTIAL_FILLED",
            json!({ "order_id": order_id, "executed_qty": order.executed_qty.to_string() }),
        );
        on_entry_filled(engine, &trade_key).await;
        return Ok(());
    }

    // Clean timeout: cancel, then re-check once for a late fill.
    let _ = cancel_ignore_unknown(engine.api.as_ref(), order_id).await;
    let after = engine.api.status(order_id).await?;
    if after.status == OrderStatus::Filled || after.executed_qty > Decimal::ZERO {
        let trade_key = {
            let pos = engine.st.position.as_mut().expect("checked above");
            pos.status = PositionStatus::OpenFilled;
            pos.qty = floor_to_step(after.executed_qty, engine.config.sizing.qty_step);
            pos.entry_actual = after.avg_fill_price();
            pos.trade_key.clone()
        };
        engine.notifier.event(
            "ENTRY_TIMEOUT_LATE_FILL",
            json!({ "order_id": order_id, "executed_qty": after.executed_qty.to_string() }),
        );
        on_entry_filled(engine, &trade_key).await;
        return Ok(());
    }
    if !after.status.is_cancel_terminal() {
        // Cancel not confirmed yet: wait, throttled.
        let pos = engine.st.position.as_mut().expect("checked above");
        pos.planb_next_action_s = now + engine.config.manage.status_poll_every_sec;
        engine.persist("entry_timeout_wait_cancel").await;
        engine.notifier.event(
            "ENTRY_TIMEOUT_WAIT_CANCEL",
            json!({ "order_id": order_id, "status": after.status.to_string() }),
        );
        return Ok(());
    }

    if engine.config.entry.mode == EntryMode::LimitOnly {
        let pos = engine.st.position.take().expect("checked above");
        engine
            .notifier
            .event_and_webhook(
                "ENTRY_TIMEOUT",
                json!({ "order_id": order_id, "fallback": "NONE" }),
            )
            .await;
        engine.close_slot(pos, "ENTRY_TIMEOUT").await;
        engine.st.cooldown_until_s = 0;
        engine.persist("entry_timeout_abort").await;
        return Ok(());
    }

    // Plan B: read the executable price and apply the deviation guard.
    let entry_side = engine
        .st
        .position
        .as_ref()
        .map(|p| p.side.entry_side())
        .expect("checked above");
    let px_exec = match engine.api.exec_price(entry_side).await {
        Ok(px) => Some(px),
        Err(e) => {
            engine.note_exchange_error(&e, "plan B executable price");
            None
        }
    };
    let Some(px_exec) = px_exec else {
        if engine.config.entry.planb_require_price {
            let pos = engine.st.position.take().expect("checked above");
            engine
                .notifier
                .event_and_webhook(
                    "ENTRY_TIMEOUT",
                    json!({ "order_id": order_id, "fallback": "ABORT_NO_PRICE" }),
                )
                .await;
            engine.close_slot(pos, "ENTRY_TIMEOUT_ABORT").await;
            engine.st.cooldown_until_s = 0;
            engine.persist("entry_timeout_no_price").await;
        }
        return Ok(());
    };

    let (allowed, why) = {
        let pos = engine.st.position.as_ref().expect("checked above");
        planb_market_allowed(engine, pos, px_exec)
    };
    if !allowed {
        let pos = engine.st.position.take().expect("checked above");
        engine
            .notifier
            .event_and_webhook(
                "ENTRY_TIMEOUT",
                json!({
                    "order_id": order_id,
                    "fallback": format!("ABORT_{why}"),
                    "px_exec": px_exec.to_string(),
                }),
            )
            .await;
        engine.close_slot(pos, "ENTRY_TIMEOUT_ABORT").await;
        engine.st.cooldown_until_s = 0;
        engine.persist("entry_timeout_guard").await;
        return Ok(());
    }

    // MARKET fallback.
    let (side, qty) = {
        let pos = engine.st.position.as_ref().expect("checked above");
        (pos.side, pos.qty)
    };
    let client_id = format!("EX_EN_MKT_{}", now_s());
    let mkt = match engine
        .api
        .place_market(side.entry_side(), qty, &client_id)
        .await
    {
        Ok(order) => order,
        Err(e) => {
            engine.note_exchange_error(&e, "plan B market entry");
            let pos = engine.st.position.take().expect("checked above");
            engine
                .notifier
                .event_and_webhook(
                    "ENTRY_TIMEOUT_MARKET_ERROR",
                    json!({ "order_id": order_id, "error": e.to_string() }),
                )
                .await;
            engine.close_slot(pos, "ENTRY_TIMEOUT_MARKET_ERROR").await;
            engine.st.cooldown_until_s = 0;
            engine.persist("entry_planb_market_failed").await;
            return Ok(());
        }
    };

    let trade_key = {
        let pos = engine.st.position.as_mut().expect("checked above");
        pos.entry_order_id = Some(mkt.order_id);
        pos.client_id = client_id;
        pos.opened_s = now;
        pos.planb_next_action_s = now + engine.config.manage.status_poll_every_sec;
        if mkt.executed_qty > Decimal::ZERO {
            pos.status = PositionStatus::OpenFilled;
            pos.qty = floor_to_step(mkt.executed_qty, engine.config.sizing.qty_step);
            pos.entry_actual = mkt.avg_fill_price();
        }
        pos.trade_key.clone()
    };
    engine.persist("entry_planb_market").await;
    engine
        .notifier
        .event_and_webhook(
            "ENTRY_TIMEOUT",
            json!({ "order_id": order_id, "fallback": "MARKET", "new_order_id": mkt.order_id }),
        )
        .await;
    if mkt.executed_qty > Decimal::ZERO {
        on_entry_filled(engine, &trade_key).await;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::state::ExecState;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    struct DeadApi;

    #[async_trait::async_trait]
    impl crate::exchange::ExchangeApi for DeadApi {
        async fn place_limit(
            &self,
            _: peak_common::types::OrderSide,
            _: Decimal,
            _: Decimal,
            _: &str,
        ) -> Result<crate::exchange::OrderInfo, ExchangeError> {
            Err(ExchangeError::Transport("test".into()))
        }
        async fn place_limit_maker(
            &self,
            _: peak_common::types::OrderSide,
            _: Decimal,
            _: Decimal,
            _: &str,
        ) -> Result<crate::exchange::OrderInfo, ExchangeError> {
            Err(ExchangeError::Transport("test".into()))
        }
        async fn place_market(
            &self,
            _: peak_common::types::OrderSide,
            _: Decimal,
            _: &str,
        ) -> Result<crate::exchange::OrderInfo, ExchangeError> {
            Err(ExchangeError::Transport("test".into()))
        }
        async fn place_stop_loss_limit(
            &self,
            _: peak_common::types::OrderSide,
            _: Decimal,
            _: Decimal,
            _: Decimal,
            _: &str,
        ) -> Result<crate::exchange::OrderInfo, ExchangeError> {
            Err(ExchangeError::Transport("test".into()))
        }
        async fn cancel(&self, _: i64) -> Result<(), ExchangeError> {
            Ok(())
        }
        async fn status(&self, id: i64) -> Result<crate::exchange::OrderInfo, ExchangeError> {
            Ok(crate::exchange::OrderInfo::missing(id))
        }
        async fn open_orders(&self) -> Result<Vec<crate::exchange::OrderInfo>, ExchangeError> {
            Ok(Vec::new())
        }
        async fn mid_price(&self) -> Result<Decimal, ExchangeError> {
            Err(ExchangeError::Transport("test".into()))
        }
        async fn exec_price(
            &self,
            _: peak_common::types::OrderSide,
        ) -> Result<Decimal, ExchangeError> {
            Err(ExchangeError::Transport("test".into()))
        }
        async fn margin_borrow(&self, _: &str, _: Decimal) -> Result<(), ExchangeError> {
            Ok(())
        }
        async fn margin_repay(&self, _: &str, _: Decimal) -> Result<(), ExchangeError> {
            Ok(())
        }
        async fn margin_free(&self, _: &str) -> Result<Decimal, ExchangeError> {
            Ok(Decimal::ZERO)
        }
        async fn margin_borrowed(&self, _: &str) -> Result<Decimal, ExchangeError> {
            Ok(Decimal::ZERO)
        }
        async fn debt_snapshot(&self) -> Result<crate::exchange::DebtSnapshot, ExchangeError> {
            Ok(crate::exchange::DebtSnapshot::default())
        }
        async fn base_exposure(&self) -> Result<Option<bool>, ExchangeError> {
            Ok(None)
        }
        async fn sanity_check(&self) -> Result<(), ExchangeError> {
            Ok(())
        }
    }

    fn engine_with(config: Config) -> Engine {
        Engine::with_state(config, Arc::new(DeadApi), ExecState::default())
    }

    fn test_engine(dir: &std::path::Path) -> Engine {
        let mut config = Config::default();
        config.paths.state_file = dir.join("state.json");
        config.paths.event_log = dir.join("executor.log");
        config.paths.detector_meta_file = dir.join("meta.json");
        engine_with(config)
    }

    #[test]
    fn test_entry_price_long_offset_and_rounding() {
        let dir = tempfile::tempdir().unwrap();
        let engine = test_engine(dir.path());
        // close 95000.00, offset 0.5 -> 95000.50, already on tick.
        let entry = build_entry_price(&engine, Side::Long, dec!(95000.00));
        assert_eq!(entry, dec!(95000.50));
        // Short mirrors below the close.
        let entry = build_entry_price(&engine, Side::Short, dec!(95000.00));
        assert_eq!(entry, dec!(94999.50));
    }

    #[test]
    fn test_entry_price_keeps_one_tick_clearance() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = test_engine(dir.path());
        engine.config.entry.offset_usd = Decimal::ZERO;
        let entry = build_entry_price(&engine, Side::Long, dec!(95000.00));
        assert_eq!(entry, dec!(95000.01));
        let entry = build_entry_price(&engine, Side::Short, dec!(95000.00));
        assert_eq!(entry, dec!(94999.99));
    }

    #[test]
    fn test_compute_tps_r_multiples() {
        let dir = tempfile::tempdir().unwrap();
        let engine = test_engine(dir.path());
        // risk = 200.50; TP1 = entry + 1R, TP2 = entry + 2R, floored.
        let tps = compute_tps(&engine, Side::Long, dec!(95000.50), dec!(94800.00));
        assert_eq!(tps, vec![dec!(95201.00), dec!(95401.50)]);
    }

    #[test]
    fn test_planb_guard_deviation_rule() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = test_engine(dir.path());
        let mut pos = Position::default();
        pos.side = Side::Long;
        pos.prices = Some(ExitPrices {
            entry: dec!(95000),
            sl: dec!(94800), // risk = 200
            tp1: dec!(95200),
            tp2: dec!(95400),
        });
        // R bound alone: 200 * 0.25 = 50.
        engine.config.entry.planb_max_dev_usd = Decimal::ZERO;
        engine.config.entry.planb_max_dev_r_mult = dec!(0.25);
        assert_eq!(planb_market_allowed(&engine, &pos, dec!(95049)).0, true);
        assert_eq!(
            planb_market_allowed(&engine, &pos, dec!(95051)),
            (false, "deviation_too_large")
        );
        // USD cap raises the bound: max(50, 120) = 120.
        engine.config.entry.planb_max_dev_usd = dec!(120);
        assert_eq!(planb_market_allowed(&engine, &pos, dec!(95110)).0, true);
        // Past TP1 always refused.
        assert_eq!(
            planb_market_allowed(&engine, &pos, dec!(95200)),
            (false, "past_tp1")
        );
    }

    #[test]
    fn test_qty_from_notional() {
        let dir = tempfile::tempdir().unwrap();
        let engine = test_engine(dir.path());
        // 100 USD at 95000.50: 0.00105263.. floored to step 0.00105.
        let qty = notional_to_qty(&engine, dec!(95000.50));
        assert_eq!(qty, dec!(0.00105));
        assert!(qty_valid(&engine, qty, dec!(95000.50)));
        assert!(!qty_valid(&engine, Decimal::ZERO, dec!(95000.50)));
    }
}
