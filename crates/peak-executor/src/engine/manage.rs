//! The position tick state machine.
//!
//! One tick advances the position at most one step. Ordering is strict:
//! the finalization-first check runs before any watchdog or trailing
//! logic: a position the exchange has already closed must never receive
//! another market order. Every replacement goes through the
//! cancel-first sequence in [`super::cancel`].

use peak_common::steps::{floor_to_step, fmt_price, round_nearest_to_step};
use rust_decimal::Decimal;
use serde_json::json;
use std::str::FromStr;

use crate::config::TrailSource;
use crate::exchange::{cancel_ignore_unknown, ExchangeApi, ExchangeError, OrderInfo, OrderStatus};
use crate::exit_safety::{
    assess_stop, assess_tp, Detection, PlannerLimits, StopPlan, TpPlan,
};
use crate::trail::{self, TrailDecision, TrailView};
use crate::types::{OrderKey, PositionStatus};

use super::cancel::{
    cancel_and_verify, post_replace_verify, rebalance_race_fill, CancelVerdict,
};
use super::exits::stop_limit_prices;
use super::{reconcile, Engine};

fn planner_limits(engine: &Engine) -> PlannerLimits {
    PlannerLimits {
        qty_step: engine.config.sizing.qty_step,
        min_qty: engine.config.sizing.min_qty,
        min_notional: engine.config.sizing.min_notional,
        sl_watchdog_grace_sec: engine.config.manage.sl_watchdog_grace_sec,
    }
}

/// Snap a computed stop to the price tick.
fn snap_to_tick(engine: &Engine, price: Decimal) -> Decimal {
    let tick = engine.config.sizing.tick_size;
    Decimal::from_str(&fmt_price(round_nearest_to_step(price, tick), tick)).unwrap_or(price)
}

/// One management pass over the live position.
pub async fn tick(engine: &mut Engine, now: i64) -> Result<(), ExchangeError> {
    let Some(status) = engine.st.position.as_ref().map(|p| p.status) else {
        return Ok(());
    };
    if status == PositionStatus::Closing {
        process_exit_cleanup(engine, now).await;
        return Ok(());
    }
    if !matches!(status, PositionStatus::Open | PositionStatus::OpenFilled) {
        return Ok(());
    }

    // Throttled stop poll feeds finalization-first AND the stop watchdog.
    let sl_id_at_poll = engine.st.position.as_ref().and_then(|p| p.orders.sl);
    let mut sl_payload = poll_leg(engine, OrderKey::Sl, now).await;

    // 1. Finalization-first: a terminal stop or a manually emptied
    //    exchange ends the tick before any watchdog runs.
    if finalize_first(engine, now, sl_payload.as_ref()).await {
        return Ok(());
    }

    // 2. Pending cleanup retries from an earlier finalization attempt.
    if engine.st.position.as_ref().is_some_and(|p| p.exit_cleanup_pending) {
        process_exit_cleanup(engine, now).await;
        return Ok(());
    }

    // 3. Open-orders snapshot (only while all three legs should rest).
    if engine.st.position.as_ref().is_some_and(|p| p.status == PositionStatus::Open) {
        let refreshed = engine
            .open_orders
            .refresh(
                engine.api.as_ref(),
                "manage",
                now,
                engine.config.manage.snapshot_min_sec,
            )
            .await;
        if refreshed && !engine.open_orders.ok {
            if let Some(err) = engine.open_orders.error.clone() {
                engine
                    .notifier
                    .event("SNAPSHOT_ERROR", json!({ "error": err }));
            }
        }
    }

    // 4. Orphaned previous stop: keep re-canceling until it is gone.
    orphan_cancel(engine, now).await;

    // 5. TP1 fill detection (a fact, recorded unconditionally).
    let tp1_payload = poll_leg(engine, OrderKey::Tp1, now).await;
    if let Some(info) = &tp1_payload {
        if info.status == OrderStatus::Filled {
            mark_tp1_done(engine, info.order_id).await;
        }
    }

    // 6. Break-even transition machine (separate from detection).
    run_breakeven(engine, now).await;
    if engine.st.position.is_none() {
        return Ok(());
    }

    // 7. TP2 fill detection and trailing activation.
    let tp2_payload = poll_leg(engine, OrderKey::Tp2, now).await;
    if let Some(info) = &tp2_payload {
        if info.status == OrderStatus::Filled {
            let already = engine.st.position.as_ref().is_some_and(|p| p.tp2_done);
            if !already {
                mark_tp2_done(engine, info.order_id).await;
                activate_trailing(engine, now, false).await;
            }
        }
    }
    if engine.st.position.is_none() {
        return Ok(());
    }

    // 8. Trailing maintenance.
    maintain_trailing(engine, now).await;
    if engine.st.position.is_none()
        || engine.st.position.as_ref().is_some_and(|p| p.sl_done)
    {
        return Ok(());
    }

    // 9. Stop watchdog: plan (pure), then execute. A stop replaced by the
    //    break-even or trailing paths this tick invalidates the payload
    //    polled at the top.
    if engine.st.position.as_ref().and_then(|p| p.orders.sl) != sl_id_at_poll {
        sl_payload = None;
    }
    run_stop_watchdog(engine, now, sl_payload).await;
    if engine.st.position.is_none()
        || engine.st.position.as_ref().is_some_and(|p| p.sl_done)
    {
        return Ok(());
    }

    // 10. Take-profit watchdog.
    run_tp_watchdog(engine, now, tp1_payload, tp2_payload).await;
    Ok(())
}

/// Throttled status poll for one tracked exit leg. Prefers a fresh
/// open-orders snapshot entry (no API spend); otherwise polls at most once
/// per `status_poll_every_sec`, absorbing fill data and refreshing the
/// reconciliation cache.
async fn poll_leg(engine: &mut Engine, key: OrderKey, now: i64) -> Option<OrderInfo> {
    let (order_id, skip) = {
        let pos = engine.st.position.as_ref()?;
        let skip = match key {
            OrderKey::Sl => pos.sl_done,
            OrderKey::Tp1 => pos.tp1_done,
            OrderKey::Tp2 => pos.tp2_done || pos.tp2_synthetic,
            OrderKey::SlPrev => true,
        };
        (pos.orders.get(key), skip)
    };
    let order_id = order_id?;
    if skip {
        return None;
    }

    if engine
        .open_orders
        .is_fresh(now, engine.config.manage.snapshot_min_sec * 2)
    {
        if let Some(info) = engine.open_orders.find(order_id).cloned() {
            let pos = engine.st.position.as_mut()?;
            pos.fills
                .entry(key.as_str().to_string())
                .or_default()
                .absorb(&info);
            pos.recon.observe(key, info.status, now);
            return Some(info);
        }
    }

    {
        let pos = engine.st.position.as_mut()?;
        let next = match key {
            OrderKey::Sl => &mut pos.sl_status_next_s,
            OrderKey::Tp1 => &mut pos.tp1_status_next_s,
            OrderKey::Tp2 => &mut pos.tp2_status_next_s,
            OrderKey::SlPrev => return None,
        };
        if now < *next {
            return None;
        }
        *next = now + engine.config.manage.status_poll_every_sec;
    }
    engine.persist("leg_poll_throttle").await;

    match engine.api.status(order_id).await {
        Ok(info) => {
            let pos = engine.st.position.as_mut()?;
            pos.fills
                .entry(key.as_str().to_string())
                .or_default()
                .absorb(&info);
            pos.recon.observe(key, info.status, now);
            Some(info)
        }
        Err(e) => {
            engine.note_exchange_error(&e, "leg status poll");
            None
        }
    }
}

/// Finalization-first: terminal stop (flag or FILLED read) or a manually
/// emptied exchange closes the slot before anything else runs this tick.
async fn finalize_first(engine: &mut Engine, now: i64, sl_payload: Option<&OrderInfo>) -> bool {
    let sl_done = engine.st.position.as_ref().is_some_and(|p| p.sl_done);
    if sl_done {
        try_finalize(engine, now, "SL").await;
        return true;
    }

    let filled_now = sl_payload.is_some_and(|p| p.status == OrderStatus::Filled)
        || engine.st.position.as_ref().is_some_and(|p| {
            p.orders.sl.is_some()
                && p.recon.fresh_status(OrderKey::Sl, now, engine.config.manage.sl_recon_fresh_sec)
                    == Some(OrderStatus::Filled)
        });
    if filled_now {
        let order_id = engine.st.position.as_ref().and_then(|p| p.orders.sl);
        if let Some(pos) = engine.st.position.as_mut() {
            pos.sl_done = true;
        }
        engine.persist("sl_filled").await;
        engine
            .notifier
            .event_and_webhook("SL_FILLED", json!({ "order_id": order_id }))
            .await;
        try_finalize(engine, now, "SL").await;
        return true;
    }

    // Manual-close: exchange empty while we think we are live. The check
    // is event-shaped (bounded by the sync throttle), not a poll.
    reconcile::clear_if_exchange_empty(engine, now).await
}

/// Cancel all tracked exit orders, then clear the slot. Cancels that fail
/// are queued for retry and the position parks in CLOSING.
async fn try_finalize(engine: &mut Engine, now: i64, reason: &str) -> bool {
    let Some(mut pos) = engine.st.position.take() else {
        return false;
    };
    pos.status = PositionStatus::Closing;

    let mut failed: Vec<i64> = Vec::new();
    for id in pos.orders.cancelable_ids() {
        if let Err(e) = cancel_ignore_unknown(engine.api.as_ref(), id).await {
            engine.note_exchange_error(&e, "finalize cleanup cancel");
            failed.push(id);
        }
    }

    if failed.is_empty() {
        engine.close_slot(pos, reason).await;
        true
    } else {
        pos.exit_cleanup_pending = true;
        pos.exit_cleanup_ids = failed.clone();
        pos.exit_cleanup_next_s = now + engine.config.manage.close_cleanup_retry_sec;
        pos.exit_cleanup_reason = Some(reason.to_string());
        engine.st.position = Some(pos);
        engine.persist("exit_cleanup_pending").await;
        engine.notifier.event(
            "EXIT_CLEANUP_PENDING",
            json!({ "reason": reason, "failed_ids": failed }),
        );
        false
    }
}

/// Retry the queued cleanup cancels; close the slot once they all clear.
async fn process_exit_cleanup(engine: &mut Engine, now: i64) {
    let due = engine
        .st
        .position
        .as_ref()
        .is_some_and(|p| p.exit_cleanup_pending && now >= p.exit_cleanup_next_s);
    if !due {
        return;
    }
    let Some(mut pos) = engine.st.position.take() else {
        return;
    };

    let mut failed: Vec<i64> = Vec::new();
    for id in &pos.exit_cleanup_ids {
        if let Err(e) = cancel_ignore_unknown(engine.api.as_ref(), *id).await {
            engine.note_exchange_error(&e, "exit cleanup retry");
            failed.push(*id);
        }
    }

    if failed.is_empty() {
        let reason = pos
            .exit_cleanup_reason
            .clone()
            .unwrap_or_else(|| "EXIT_CLEANUP_DONE".to_string());
        engine.notifier.event("EXIT_CLEANUP_DONE", json!({ "reason": reason }));
        engine.close_slot(pos, &reason).await;
    } else {
        pos.exit_cleanup_ids = failed.clone();
        pos.exit_cleanup_next_s = now + engine.config.manage.close_cleanup_retry_sec;
        engine.st.position = Some(pos);
        engine.persist("exit_cleanup_retry").await;
        engine.notifier.event(
            "EXIT_CLEANUP_RETRY_FAILED",
            json!({ "failed_ids": failed }),
        );
    }
}

/// Best-effort re-cancel of an orphaned previous stop.
async fn orphan_cancel(engine: &mut Engine, now: i64) {
    let orphan = {
        let Some(pos) = engine.st.position.as_ref() else {
            return;
        };
        match (pos.orders.sl_prev, pos.tp1_done || pos.trail_active) {
            (Some(id), true) if now >= pos.sl_prev_next_cancel_s => Some(id),
            _ => None,
        }
    };
    let Some(orphan_id) = orphan else {
        return;
    };
    {
        let pos = engine.st.position.as_mut().expect("checked above");
        pos.sl_prev_next_cancel_s = now + engine.config.manage.orphan_cancel_every_sec;
    }
    engine.persist("orphan_cancel_throttle").await;
    match cancel_ignore_unknown(engine.api.as_ref(), orphan_id).await {
        Ok(()) => {
            if let Some(pos) = engine.st.position.as_mut() {
                pos.orders.sl_prev = None;
            }
            engine.persist("orphan_cleared").await;
        }
        Err(e) => engine.note_exchange_error(&e, "orphan stop cancel"),
    }
}

/// Record the TP1 fill (a fact, never retried) and arm the break-even
/// transition machine.
async fn mark_tp1_done(engine: &mut Engine, order_id: i64) {
    let armed = {
        let Some(pos) = engine.st.position.as_mut() else {
            return;
        };
        if pos.tp1_done {
            false
        } else {
            pos.tp1_done = true;
            pos.tp1_be_pending = true;
            pos.tp1_be_old_sl = pos.orders.sl;
            pos.orders.tp1 = None;
            true
        }
    };
    if armed {
        engine.persist("tp1_done").await;
        engine
            .notifier
            .event_and_webhook("TP1_DONE", json!({ "order_id": order_id }))
            .await;
    }
}

async fn mark_tp2_done(engine: &mut Engine, order_id: i64) {
    {
        let Some(pos) = engine.st.position.as_mut() else {
            return;
        };
        pos.tp2_done = true;
        pos.orders.tp2 = None;
    }
    engine.persist("tp2_done").await;
    engine
        .notifier
        .event_and_webhook("TP2_DONE", json!({ "order_id": order_id }))
        .await;
}

/// The break-even replacement machine. TP1 detection is a fact; this
/// transition retries independently with its own bounded budget because
/// the stop replacement can legitimately fail (insufficient balance while
/// the old stop still holds the quantity, transient API errors).
async fn run_breakeven(engine: &mut Engine, now: i64) {
    let pending = engine
        .st
        .position
        .as_ref()
        .is_some_and(|p| p.tp1_done && p.tp1_be_pending && !p.sl_done);
    if !pending {
        return;
    }
    {
        let pos = engine.st.position.as_mut().expect("checked above");
        if !pos.tp1_be_budget.ready(now) {
            return;
        }
    }

    let cap = engine.config.manage.tp1_be_max_attempts;
    let cooldown = engine.config.manage.tp1_be_cooldown_sec;
    let retry = engine.config.manage.sl_watchdog_retry_sec;

    // Step 1–3: verified cancel of the old stop.
    let old_sl = engine.st.position.as_ref().and_then(|p| p.tp1_be_old_sl);
    let mut replaced: Option<(i64, Decimal)> = None;
    if let Some(old_id) = old_sl {
        match cancel_and_verify(engine.api.as_ref(), old_id).await {
            Ok(CancelVerdict::Cleared { executed_before }) => {
                replaced = Some((old_id, executed_before));
                let pos = engine.st.position.as_mut().expect("checked above");
                pos.tp1_be_old_sl = None;
                if pos.orders.sl == Some(old_id) {
                    pos.orders.sl = None;
                }
                engine.persist("be_old_sl_canceled").await;
            }
            Ok(CancelVerdict::FilledDuringCancel) => {
                // The stop won the race: the position is closed. Abort the
                // transition and let finalization handle the fill.
                let pos = engine.st.position.as_mut().expect("checked above");
                pos.sl_done = true;
                pos.tp1_be_pending = false;
                engine.persist("be_abort_stop_filled").await;
                engine
                    .notifier
                    .event("BE_ABORT_STOP_FILLED", json!({ "order_id": old_id }));
                return;
            }
            Ok(CancelVerdict::Unverified(status)) => {
                let capped = {
                    let pos = engine.st.position.as_mut().expect("checked above");
                    pos.tp1_be_budget.record_failure(now, retry, cap, cooldown)
                };
                engine.persist("be_cancel_unverified").await;
                engine.notifier.event(
                    "BE_WAIT_CANCEL",
                    json!({ "order_id": old_id, "status": status.to_string(), "capped": capped }),
                );
                return;
            }
            Err(e) => {
                engine.note_exchange_error(&e, "break-even cancel");
                let capped = {
                    let pos = engine.st.position.as_mut().expect("checked above");
                    pos.tp1_be_budget.record_failure(now, retry, cap, cooldown)
                };
                engine.persist("be_cancel_failed").await;
                engine.notifier.event(
                    "BE_CANCEL_ERROR",
                    json!({ "order_id": old_id, "error": e.to_string(), "capped": capped }),
                );
                return;
            }
        }
    }

    // Step 4: place the break-even stop for the remaining legs.
    let (side, be_stop, rem_qty) = {
        let pos = engine.st.position.as_ref().expect("checked above");
        let Some(be_stop) = pos.breakeven_price() else {
            return;
        };
        let rem = floor_to_step(
            pos.orders.qty2 + pos.orders.qty3,
            engine.config.sizing.qty_step,
        );
        (pos.side, snap_to_tick(engine, be_stop), rem)
    };
    if rem_qty <= Decimal::ZERO {
        let pos = engine.st.position.as_mut().expect("checked above");
        pos.tp1_be_pending = false;
        engine.persist("be_no_remaining_qty").await;
        return;
    }

    let (stop, limit) = stop_limit_prices(&engine.config, side, be_stop);
    let client_id = format!("EX_SL_BE_{now}");
    match engine
        .api
        .place_stop_loss_limit(side.exit_side(), rem_qty, stop, limit, &client_id)
        .await
    {
        Ok(new_order) => {
            {
                let pos = engine.st.position.as_mut().expect("checked above");
                pos.orders.sl = Some(new_order.order_id);
                if let Some(prices) = pos.prices.as_mut() {
                    prices.sl = be_stop;
                }
                pos.tp1_be_pending = false;
                pos.tp1_be_budget.record_success();
                // Immediate status check of the new stop: no throttle delay,
                // so the invariants see a consistent stop next pass.
                pos.sl_status_next_s = 0;
            }
            engine.persist("be_placed").await;
            engine
                .notifier
                .event_and_webhook(
                    "BE_PLACED",
                    json!({
                        "new_sl_order_id": new_order.order_id,
                        "stop": be_stop.to_string(),
                        "qty": rem_qty.to_string(),
                    }),
                )
                .await;

            // Step 5: post-replace verify the canceled stop.
            if let Some((old_id, executed_before)) = replaced {
                match post_replace_verify(engine.api.as_ref(), old_id, executed_before).await {
                    Ok(Some(_race)) => {
                        // The old stop filled after all: the new stop now
                        // guards a position that no longer exists. Remove it
                        // and let finalization run.
                        let _ =
                            cancel_ignore_unknown(engine.api.as_ref(), new_order.order_id).await;
                        let pos = engine.st.position.as_mut().expect("checked above");
                        pos.sl_done = true;
                        pos.orders.sl = None;
                        engine.persist("be_race_stop_filled").await;
                        engine.notifier.event(
                            "BE_RACE_STOP_FILLED",
                            json!({ "old_order_id": old_id, "canceled_new": new_order.order_id }),
                        );
                    }
                    Ok(None) => {}
                    Err(e) => engine.note_exchange_error(&e, "break-even post verify"),
                }
            }
        }
        Err(e) => {
            let retriable = e.is_insufficient_balance() || !matches!(e, ExchangeError::Api { .. });
            engine.note_exchange_error(&e, "break-even stop placement");
            let capped = {
                let pos = engine.st.position.as_mut().expect("checked above");
                pos.tp1_be_budget.record_failure(now, retry, cap, cooldown)
            };
            engine.persist("be_place_failed").await;
            engine
                .notifier
                .event_and_webhook(
                    "BE_PLACE_ERROR",
                    json!({
                        "error": e.to_string(),
                        "retriable": retriable,
                        "capped": capped,
                    }),
                )
                .await;
        }
    }
}

/// Activate trailing after TP2 (normal path) or on the synthetic path
/// (TP2 never filled; the quantity was staged in `trail_qty`).
async fn activate_trailing(engine: &mut Engine, now: i64, synthetic: bool) {
    let (open_qty, degraded, tp1_done, sl_id, tp1_id) = {
        let Some(pos) = engine.st.position.as_ref() else {
            return;
        };
        let open_qty = if synthetic {
            pos.trail_qty
        } else if pos.tp1_done {
            pos.orders.qty3
        } else {
            pos.orders.qty1 + pos.orders.qty3
        };
        (
            open_qty,
            pos.orders.legs_degraded,
            pos.tp1_done,
            pos.orders.sl,
            pos.orders.tp1,
        )
    };

    // Degraded 50/50 positions have no trailing leg; and with nothing
    // left to protect the slot simply closes.
    if !synthetic && (degraded || !engine.config.trail.activate_after_tp2) {
        if open_qty <= Decimal::ZERO || degraded && tp1_done {
            try_finalize(engine, now, "TP2").await;
        } else {
            engine.notifier.event(
                "TP2_DONE_REMAINING_NO_TRAIL",
                json!({ "open_qty": open_qty.to_string(), "degraded": degraded }),
            );
        }
        return;
    }
    if open_qty <= Decimal::ZERO {
        try_finalize(engine, now, "TP2").await;
        return;
    }

    // TP1 leftovers must not double-close the position.
    if !tp1_done {
        if let Some(tp1) = tp1_id {
            let _ = cancel_ignore_unknown(engine.api.as_ref(), tp1).await;
        }
    }

    // Cancel-first on the current stop before any trailing stop exists.
    let mut replaced: Option<(i64, Decimal)> = None;
    if let Some(sl) = sl_id {
        match cancel_and_verify(engine.api.as_ref(), sl).await {
            Ok(CancelVerdict::Cleared { executed_before }) => {
                replaced = Some((sl, executed_before));
                let pos = engine.st.position.as_mut().expect("checked above");
                pos.orders.sl = None;
            }
            Ok(CancelVerdict::FilledDuringCancel) => {
                let pos = engine.st.position.as_mut().expect("checked above");
                pos.sl_done = true;
                engine.persist("trail_activate_stop_filled").await;
                return;
            }
            Ok(CancelVerdict::Unverified(status)) => {
                let pos = engine.st.position.as_mut().expect("checked above");
                pos.trail_pending_cancel_sl = Some(sl);
                pos.trail_active = true;
                pos.trail_qty = open_qty;
                pos.tp2_synthetic = synthetic || pos.tp2_synthetic;
                pos.trail_last_update_s = 0;
                engine.persist("trail_activate_wait_cancel").await;
                engine.notifier.event(
                    "TRAIL_ACTIVATE_WAIT_CANCEL",
                    json!({ "order_id": sl, "status": status.to_string() }),
                );
                return;
            }
            Err(e) => {
                engine.note_exchange_error(&e, "trailing activation cancel");
                // Keep the old protective stop; retry activation next tick
                // through the maintenance path.
                let pos = engine.st.position.as_mut().expect("checked above");
                pos.trail_active = true;
                pos.trail_qty = open_qty;
                pos.tp2_synthetic = synthetic || pos.tp2_synthetic;
                pos.trail_last_update_s = 0;
                engine.persist("trail_activate_cancel_failed").await;
                return;
            }
        }
    }

    {
        let pos = engine.st.position.as_mut().expect("checked above");
        pos.trail_active = true;
        pos.trail_qty = open_qty;
        pos.tp2_synthetic = synthetic || pos.tp2_synthetic;
        pos.trail_last_update_s = 0;
        // Optional bar-close confirmation: swing targets stay on hold
        // until the close crosses the TP2 level by the confirm buffer.
        if engine.config.trail.confirm_buffer_usd > Decimal::ZERO {
            pos.trail_wait_confirm = true;
            pos.trail_ref_price = pos.prices.map(|p| p.tp2);
        }
    }
    engine.persist("trail_activated").await;

    // Best-effort immediate stop placement; maintenance retries otherwise.
    let placed = place_trailing_stop(engine, now).await;
    engine
        .notifier
        .event_and_webhook(
            "TRAIL_ACTIVATED",
            json!({
                "qty": open_qty.to_string(),
                "synthetic": synthetic,
                "stop": placed.map(|p| p.to_string()),
            }),
        )
        .await;

    if let Some((old_id, executed_before)) = replaced {
        handle_stop_replace_race(engine, old_id, executed_before).await;
    }
}

/// Compute the desired trailing stop for the live position. Clears the
/// confirmation gate once the bar close crosses the reference price.
fn desired_trail_stop(engine: &mut Engine) -> Option<Decimal> {
    let mut view = {
        let pos = engine.st.position.as_ref()?;
        TrailView {
            side: pos.side,
            wait_confirm: pos.trail_wait_confirm,
            ref_price: pos.trail_ref_price,
        }
    };
    loop {
        match trail::desired_stop(&engine.config.paths.bar_csv, view, &engine.config.trail) {
            Ok(TrailDecision::Stop(price)) => return Some(snap_to_tick(engine, price)),
            Ok(TrailDecision::Confirmed) => {
                if let Some(pos) = engine.st.position.as_mut() {
                    pos.trail_wait_confirm = false;
                }
                view.wait_confirm = false;
                continue;
            }
            Ok(TrailDecision::NotReady) => {
                // Book fallback only when the operator forced that source.
                if engine.config.trail.source == TrailSource::Book {
                    let mid = engine.mid_price.price()?;
                    let buffered = match view.side {
                        peak_common::types::Side::Long => {
                            mid - engine.config.trail.swing_buffer_usd
                        }
                        peak_common::types::Side::Short => {
                            mid + engine.config.trail.swing_buffer_usd
                        }
                    };
                    return Some(snap_to_tick(engine, buffered));
                }
                return None;
            }
            Err(e) => {
                engine
                    .notifier
                    .event("TRAIL_FEED_ERROR", json!({ "error": e.to_string() }));
                return None;
            }
        }
    }
}

/// Place the trailing stop fresh (no previous stop resting). When swings
/// are not ready yet the mid price ± buffer stands in; the remaining
/// quantity must never sit unprotected after the old stop was canceled.
async fn place_trailing_stop(engine: &mut Engine, now: i64) -> Option<Decimal> {
    if engine.config.trail.source == TrailSource::Book {
        engine
            .mid_price
            .refresh(
                engine.api.as_ref(),
                "trailing",
                now,
                engine.config.manage.price_snapshot_min_sec,
            )
            .await;
    }
    let desired = match desired_trail_stop(engine) {
        Some(d) => d,
        None => {
            engine
                .mid_price
                .refresh(
                    engine.api.as_ref(),
                    "trailing_fallback",
                    now,
                    engine.config.manage.price_snapshot_min_sec,
                )
                .await;
            let mid = engine.mid_price.price()?;
            let side = engine.st.position.as_ref()?.side;
            let buffered = match side {
                peak_common::types::Side::Long => mid - engine.config.trail.swing_buffer_usd,
                peak_common::types::Side::Short => mid + engine.config.trail.swing_buffer_usd,
            };
            snap_to_tick(engine, buffered)
        }
    };
    let (side, qty) = {
        let pos = engine.st.position.as_ref()?;
        (pos.side, pos.trail_qty)
    };
    if qty <= Decimal::ZERO {
        return None;
    }
    let (stop, limit) = stop_limit_prices(&engine.config, side, desired);
    let client_id = format!("EX_SL_TR_{now}");
    match engine
        .api
        .place_stop_loss_limit(side.exit_side(), qty, stop, limit, &client_id)
        .await
    {
        Ok(order) => {
            let pos = engine.st.position.as_mut()?;
            pos.orders.sl = Some(order.order_id);
            pos.trail_sl_price = Some(desired);
            pos.trail_last_update_s = now;
            engine.persist("trail_stop_placed").await;
            Some(desired)
        }
        Err(e) => {
            engine.note_exchange_error(&e, "trailing stop placement");
            engine
                .notifier
                .event("TRAIL_SL_PLACE_ERROR", json!({ "error": e.to_string() }));
            None
        }
    }
}

/// Post-replace race handling shared by every stop-for-stop replacement:
/// if the old stop filled anyway, the replacement guards nothing: cancel
/// it and mark the stop done so finalization runs.
async fn handle_stop_replace_race(engine: &mut Engine, old_id: i64, executed_before: Decimal) {
    match post_replace_verify(engine.api.as_ref(), old_id, executed_before).await {
        Ok(Some(_race)) => {
            let new_sl = engine.st.position.as_ref().and_then(|p| p.orders.sl);
            if let Some(new_id) = new_sl {
                let _ = cancel_ignore_unknown(engine.api.as_ref(), new_id).await;
            }
            if let Some(pos) = engine.st.position.as_mut() {
                pos.sl_done = true;
                pos.orders.sl = None;
            }
            engine.persist("stop_replace_race").await;
            engine.notifier.event(
                "STOP_REPLACE_RACE_FILLED",
                json!({ "old_order_id": old_id }),
            );
        }
        Ok(None) => {}
        Err(e) => engine.note_exchange_error(&e, "stop replace post verify"),
    }
}

/// Trailing maintenance: every update interval, move the stop when the
/// swing-derived target improves by at least the configured step.
async fn maintain_trailing(engine: &mut Engine, now: i64) {
    let due = {
        let Some(pos) = engine.st.position.as_ref() else {
            return;
        };
        pos.trail_active
            && !pos.sl_done
            && now - pos.trail_last_update_s >= engine.config.trail.update_every_sec
    };
    if !due {
        return;
    }

    // A pending cancel from activation must clear before any placement.
    let pending = engine
        .st
        .position
        .as_ref()
        .and_then(|p| p.trail_pending_cancel_sl);
    if let Some(pend_id) = pending {
        match engine.api.status(pend_id).await {
            Ok(info) if info.status == OrderStatus::Filled => {
                let pos = engine.st.position.as_mut().expect("checked above");
                pos.sl_done = true;
                pos.trail_pending_cancel_sl = None;
                engine.persist("trail_pending_filled").await;
                return;
            }
            Ok(info) if info.status.is_cancel_terminal() => {
                let pos = engine.st.position.as_mut().expect("checked above");
                pos.trail_pending_cancel_sl = None;
                if pos.orders.sl == Some(pend_id) {
                    pos.orders.sl = None;
                }
                engine.persist("trail_pending_cleared").await;
            }
            Ok(info) => {
                let _ = cancel_ignore_unknown(engine.api.as_ref(), pend_id).await;
                let pos = engine.st.position.as_mut().expect("checked above");
                pos.trail_last_update_s = now;
                engine.persist("trail_wait_cancel").await;
                engine.notifier.event(
                    "TRAIL_WAIT_CANCEL",
                    json!({ "order_id": pend_id, "status": info.status.to_string() }),
                );
                return;
            }
            Err(e) => {
                engine.note_exchange_error(&e, "trailing pending cancel poll");
                return;
            }
        }
    }

    if engine.config.trail.source == TrailSource::Book {
        engine
            .mid_price
            .refresh(
                engine.api.as_ref(),
                "trailing",
                now,
                engine.config.manage.price_snapshot_min_sec,
            )
            .await;
    }
    let desired = desired_trail_stop(engine);
    {
        let pos = engine.st.position.as_mut().expect("checked above");
        // Advance even without a price so a dry feed cannot tight-loop.
        pos.trail_last_update_s = now;
    }
    engine.persist("trail_update_stamp").await;
    let Some(desired) = desired else {
        return;
    };

    let (side, sl_id, current, qty) = {
        let pos = engine.st.position.as_ref().expect("checked above");
        (
            pos.side,
            pos.orders.sl,
            pos.trail_sl_price.unwrap_or(Decimal::ZERO),
            pos.trail_qty,
        )
    };
    if qty <= Decimal::ZERO {
        engine.notifier.event("TRAIL_SL_SKIP_ZERO_QTY", json!({}));
        return;
    }

    // Stop vanished while trailing: restore protection immediately.
    let Some(sl_id) = sl_id else {
        if let Some(stop) = place_trailing_stop(engine, now).await {
            engine
                .notifier
                .event("TRAIL_SL_RESTORED", json!({ "stop": stop.to_string() }));
        }
        return;
    };

    let improve = match side {
        peak_common::types::Side::Long => desired - current,
        peak_common::types::Side::Short => current - desired,
    };
    if current > Decimal::ZERO && improve < engine.config.trail.step_usd {
        return;
    }

    // Favorable move: cancel-first replace.
    match cancel_and_verify(engine.api.as_ref(), sl_id).await {
        Ok(CancelVerdict::Cleared { executed_before }) => {
            {
                let pos = engine.st.position.as_mut().expect("checked above");
                pos.orders.sl = None;
            }
            let (stop, limit) = stop_limit_prices(&engine.config, side, desired);
            let client_id = format!("EX_SL_TR_{now}");
            match engine
                .api
                .place_stop_loss_limit(side.exit_side(), qty, stop, limit, &client_id)
                .await
            {
                Ok(order) => {
                    {
                        let pos = engine.st.position.as_mut().expect("checked above");
                        pos.orders.sl = Some(order.order_id);
                        pos.trail_sl_price = Some(desired);
                        if let Some(prices) = pos.prices.as_mut() {
                            prices.sl = desired;
                        }
                    }
                    engine.persist("trail_updated").await;
                    engine.notifier.event(
                        "TRAIL_UPDATED",
                        json!({ "stop": desired.to_string(), "order_id": order.order_id }),
                    );
                    handle_stop_replace_race(engine, sl_id, executed_before).await;
                }
                Err(e) => {
                    engine.note_exchange_error(&e, "trailing stop replace");
                    engine
                        .notifier
                        .event("TRAIL_SL_UPDATE_ERROR", json!({ "error": e.to_string() }));
                    // The old stop is gone; restore protection next round
                    // via the missing-stop path.
                }
            }
        }
        Ok(CancelVerdict::FilledDuringCancel) => {
            let pos = engine.st.position.as_mut().expect("checked above");
            pos.sl_done = true;
            engine.persist("trail_replace_stop_filled").await;
        }
        Ok(CancelVerdict::Unverified(status)) => {
            engine.notifier.event(
                "TRAIL_SL_CANCEL_NOT_CONFIRMED",
                json!({ "order_id": sl_id, "status": status.to_string() }),
            );
        }
        Err(e) => engine.note_exchange_error(&e, "trailing cancel"),
    }
}

/// Execute the stop-watchdog plan.
async fn run_stop_watchdog(engine: &mut Engine, now: i64, sl_payload: Option<OrderInfo>) {
    let eligible = engine
        .st
        .position
        .as_ref()
        .is_some_and(|p| p.status == PositionStatus::Open && !p.sl_watchdog_fired);
    if !eligible {
        return;
    }

    engine
        .mid_price
        .refresh(
            engine.api.as_ref(),
            "sl_watchdog",
            now,
            engine.config.manage.price_snapshot_min_sec,
        )
        .await;
    let price_now = engine.mid_price.price();
    let limits = planner_limits(engine);

    let assessment = {
        let pos = engine.st.position.as_ref().expect("checked above");
        assess_stop(pos, sl_payload.as_ref(), price_now, now, &limits)
    };

    // Trigger bookkeeping (and its one-shot trigger event).
    let prev_trigger = engine
        .st
        .position
        .as_ref()
        .and_then(|p| p.sl_watchdog_first_trigger_s);
    if prev_trigger != assessment.first_trigger_s {
        {
            let pos = engine.st.position.as_mut().expect("checked above");
            pos.sl_watchdog_first_trigger_s = assessment.first_trigger_s;
        }
        engine.persist("sl_watchdog_trigger").await;
        if prev_trigger.is_none() && assessment.first_trigger_s.is_some() {
            engine.notifier.event(
                "SL_WATCHDOG_TRIGGER",
                json!({ "price_now": price_now.map(|p| p.to_string()) }),
            );
        }
    }

    for detection in &assessment.detections {
        if let Detection::SlPartial {
            order_id,
            executed_qty,
        } = detection
        {
            let log_it = {
                let pos = engine.st.position.as_mut().expect("checked above");
                if pos.sl_wd_partial_logged {
                    false
                } else {
                    pos.sl_wd_partial_logged = true;
                    true
                }
            };
            if log_it {
                engine.persist("sl_wd_partial_logged").await;
                engine.notifier.event(
                    "SL_PARTIAL_DETECTED",
                    json!({ "order_id": order_id, "executed_qty": executed_qty.to_string() }),
                );
            }
        }
    }

    let Some(plan) = assessment.plan else {
        return;
    };

    match plan {
        StopPlan::MarketFlatten {
            qty,
            side,
            reason,
            cancel_ids,
        } => {
            let throttled = {
                let pos = engine.st.position.as_mut().expect("checked above");
                if now - pos.sl_watchdog_last_attempt_s
                    < engine.config.manage.sl_watchdog_retry_sec
                {
                    true
                } else if !pos.sl_watchdog_budget.ready(now) {
                    true
                } else {
                    pos.sl_watchdog_last_attempt_s = now;
                    false
                }
            };
            if throttled {
                return;
            }
            engine.persist("sl_watchdog_attempt").await;

            // Cancel-first. The stop being replaced gets the strict
            // verify; sibling TP cancels are cleanup.
            let sl_id = engine.st.position.as_ref().and_then(|p| p.orders.sl);
            let mut executed_before = Decimal::ZERO;
            let mut failed_cancels: Vec<i64> = Vec::new();
            for id in &cancel_ids {
                if Some(*id) == sl_id {
                    match cancel_and_verify(engine.api.as_ref(), *id).await {
                        Ok(CancelVerdict::Cleared {
                            executed_before: eb,
                        }) => executed_before = eb,
                        Ok(CancelVerdict::FilledDuringCancel) => {
                            let pos = engine.st.position.as_mut().expect("checked above");
                            pos.sl_done = true;
                            engine.persist("sl_watchdog_stop_filled").await;
                            return;
                        }
                        Ok(CancelVerdict::Unverified(status)) => {
                            let cap = engine.config.manage.replace_max_attempts;
                            let cd = engine.config.manage.replace_cooldown_sec;
                            let retry = engine.config.manage.sl_watchdog_retry_sec;
                            let pos = engine.st.position.as_mut().expect("checked above");
                            pos.sl_watchdog_budget.record_failure(now, retry, cap, cd);
                            engine.persist("sl_watchdog_cancel_unverified").await;
                            engine.notifier.event(
                                "SL_WATCHDOG_CANCEL_NOT_CONFIRMED",
                                json!({ "order_id": id, "status": status.to_string() }),
                            );
                            return;
                        }
                        Err(e) => {
                            engine.note_exchange_error(&e, "watchdog stop cancel");
                            let cap = engine.config.manage.replace_max_attempts;
                            let cd = engine.config.manage.replace_cooldown_sec;
                            let retry = engine.config.manage.sl_watchdog_retry_sec;
                            let pos = engine.st.position.as_mut().expect("checked above");
                            pos.sl_watchdog_budget.record_failure(now, retry, cap, cd);
                            engine.persist("sl_watchdog_cancel_failed").await;
                            return;
                        }
                    }
                } else if let Err(e) = cancel_ignore_unknown(engine.api.as_ref(), *id).await {
                    engine.note_exchange_error(&e, "watchdog sibling cancel");
                    failed_cancels.push(*id);
                }
            }

            let client_id = format!("EX_SL_WD_{now}");
            if let Err(e) = engine.api.place_market(side, qty, &client_id).await {
                engine.note_exchange_error(&e, "watchdog market fallback");
                let cap = engine.config.manage.replace_max_attempts;
                let cd = engine.config.manage.replace_cooldown_sec;
                let retry = engine.config.manage.sl_watchdog_retry_sec;
                {
                    let pos = engine.st.position.as_mut().expect("checked above");
                    pos.sl_watchdog_budget.record_failure(now, retry, cap, cd);
                    pos.sl_watchdog_last_error = Some(e.to_string());
                }
                engine.persist("sl_watchdog_market_failed").await;
                engine.notifier.event(
                    "SL_WATCHDOG_MARKET_ERROR",
                    json!({ "error": e.to_string(), "qty": qty.to_string() }),
                );
                return;
            }
            engine
                .notifier
                .event_and_webhook(
                    "SL_MARKET_FALLBACK",
                    json!({ "reason": reason.as_str(), "qty": qty.to_string() }),
                )
                .await;

            // Post-market verify the replaced stop; offset any race-fill.
            if let Some(old_sl) = sl_id {
                match post_replace_verify(engine.api.as_ref(), old_sl, executed_before).await {
                    Ok(Some(race)) => {
                        if let Err(e) = rebalance_race_fill(
                            engine.api.as_ref(),
                            &engine.notifier,
                            race,
                            engine.config.sizing.qty_step,
                            old_sl,
                            now,
                        )
                        .await
                        {
                            engine.note_exchange_error(&e, "race-fill rebalance");
                        }
                    }
                    Ok(None) => {}
                    Err(e) => engine.note_exchange_error(&e, "watchdog post verify"),
                }
            }

            {
                let pos = engine.st.position.as_mut().expect("checked above");
                pos.sl_watchdog_fired = true;
                pos.sl_watchdog_budget.record_success();
                pos.orders.sl = None;
            }
            engine.persist("sl_watchdog_fired").await;

            if !failed_cancels.is_empty() {
                let pos = engine.st.position.as_mut().expect("checked above");
                pos.exit_cleanup_pending = true;
                pos.exit_cleanup_ids = failed_cancels;
                pos.exit_cleanup_next_s = now + engine.config.manage.close_cleanup_retry_sec;
                pos.exit_cleanup_reason = Some(reason.as_str().to_string());
                engine.persist("sl_watchdog_cleanup_pending").await;
                return;
            }
            try_finalize(engine, now, reason.as_str()).await;
        }
        StopPlan::AcceptDust {
            qty_raw,
            qty_quantized,
            notional_raw,
            cancel_ids,
        } => {
            {
                let pos = engine.st.position.as_mut().expect("checked above");
                pos.dust_remainder = true;
                pos.dust_qty_raw = qty_raw;
                pos.sl_watchdog_fired = true;
            }
            engine.persist("sl_dust_remainder").await;
            engine.notifier.event(
                "SL_DUST_REMAINDER",
                json!({
                    "qty_raw": qty_raw.to_string(),
                    "qty_quantized": qty_quantized.to_string(),
                    "notional_raw": notional_raw.to_string(),
                }),
            );
            let mut failed: Vec<i64> = Vec::new();
            for id in &cancel_ids {
                if let Err(e) = cancel_ignore_unknown(engine.api.as_ref(), *id).await {
                    engine.note_exchange_error(&e, "dust cleanup cancel");
                    failed.push(*id);
                }
            }
            if failed.is_empty() {
                try_finalize(engine, now, "SL_DUST_REMAINDER").await;
            } else {
                let pos = engine.st.position.as_mut().expect("checked above");
                pos.exit_cleanup_pending = true;
                pos.exit_cleanup_ids = failed;
                pos.exit_cleanup_next_s = now + engine.config.manage.close_cleanup_retry_sec;
                pos.exit_cleanup_reason = Some("SL_DUST_REMAINDER".to_string());
                engine.persist("dust_cleanup_pending").await;
            }
        }
    }
}

/// Execute the take-profit watchdog plan.
async fn run_tp_watchdog(
    engine: &mut Engine,
    now: i64,
    tp1_payload: Option<OrderInfo>,
    tp2_payload: Option<OrderInfo>,
) {
    let eligible = engine.st.position.as_ref().is_some_and(|p| {
        matches!(p.status, PositionStatus::Open | PositionStatus::OpenFilled)
    });
    if !eligible {
        return;
    }

    engine
        .mid_price
        .refresh(
            engine.api.as_ref(),
            "tp_watchdog",
            now,
            engine.config.manage.price_snapshot_min_sec,
        )
        .await;
    let price_now = engine.mid_price.price();
    let limits = planner_limits(engine);

    let assessment = {
        let pos = engine.st.position.as_ref().expect("checked above");
        assess_tp(
            pos,
            tp1_payload.as_ref(),
            tp2_payload.as_ref(),
            price_now,
            &limits,
        )
    };

    // One-shot detection events.
    for detection in &assessment.detections {
        let (flag_name, event_name, fields) = match detection {
            Detection::Tp1MissingCrossed { status } => (
                "tp1_wd_missing_logged",
                "TP1_MISSING_PRICE_CROSSED",
                json!({ "status": status.to_string() }),
            ),
            Detection::Tp1PartialCrossed { executed_qty } => (
                "tp1_wd_partial_logged",
                "TP1_PARTIAL_DETECTED",
                json!({ "executed_qty": executed_qty.to_string() }),
            ),
            Detection::Tp2MissingSynthetic { status } => (
                "tp2_wd_missing_logged",
                "TP2_MISSING_SYNTHETIC_TRAILING",
                json!({ "status": status.to_string() }),
            ),
            _ => continue,
        };
        let log_it = {
            let pos = engine.st.position.as_mut().expect("checked above");
            let flag = match flag_name {
                "tp1_wd_missing_logged" => &mut pos.tp1_wd_missing_logged,
                "tp1_wd_partial_logged" => &mut pos.tp1_wd_partial_logged,
                _ => &mut pos.tp2_wd_missing_logged,
            };
            if *flag {
                false
            } else {
                *flag = true;
                true
            }
        };
        if log_it {
            engine.persist("tp_wd_detection_logged").await;
            engine.notifier.event(event_name, fields);
        }
    }

    let Some(plan) = assessment.plan else {
        return;
    };

    match plan {
        TpPlan::CloseFirstLeg {
            qty, side, reason, ..
        } => {
            let throttled = {
                let pos = engine.st.position.as_mut().expect("checked above");
                if now - pos.tp_wd_last_attempt_s < engine.config.manage.sl_watchdog_retry_sec {
                    true
                } else {
                    pos.tp_wd_last_attempt_s = now;
                    false
                }
            };
            if throttled {
                return;
            }
            engine.persist("tp_wd_attempt").await;

            let client_id = format!("EX_TP_WD_{now}");
            if let Err(e) = engine.api.place_market(side, qty, &client_id).await {
                engine.note_exchange_error(&e, "TP1 watchdog market close");
                engine.notifier.event(
                    "TP_WATCHDOG_MARKET_ERROR",
                    json!({ "error": e.to_string(), "qty": qty.to_string() }),
                );
                return;
            }
            engine.notifier.event(
                "TP1_MARKET_FALLBACK",
                json!({ "reason": reason.as_str(), "qty": qty.to_string() }),
            );
            // The leg is now closed exactly as a TP1 fill would have left
            // it: record the fact and run the break-even transition.
            let tp1_id = engine.st.position.as_ref().and_then(|p| p.orders.tp1);
            mark_tp1_done(engine, tp1_id.unwrap_or_default()).await;
        }
        TpPlan::FirstLegDust {
            qty_raw,
            qty_quantized,
            notional_raw,
        } => {
            engine.notifier.event(
                "TP1_MISSING_DUST",
                json!({
                    "qty_raw": qty_raw.to_string(),
                    "qty_quantized": qty_quantized.to_string(),
                    "notional_raw": notional_raw.to_string(),
                }),
            );
            let tp1_id = engine.st.position.as_ref().and_then(|p| p.orders.tp1);
            mark_tp1_done(engine, tp1_id.unwrap_or_default()).await;
        }
        TpPlan::ActivateSyntheticTrailing { qty } => {
            {
                let pos = engine.st.position.as_mut().expect("checked above");
                pos.trail_qty = qty;
            }
            activate_trailing(engine, now, true).await;
        }
    }
}
