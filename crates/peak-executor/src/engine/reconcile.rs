//! Reconciliation: attach persisted state to live exchange state.
//!
//! Event-triggered only: boot, emergency-shutdown entry, and PEAK
//! arrival (throttled). Calling this on a timer races with the position
//! tick's mutations; that experiment is known to break the state machine.

use peak_common::types::{OrderSide, Side};
use rust_decimal::Decimal;
use serde_json::json;

use crate::exchange::{ExchangeApi, OrderInfo, OrderStatus};
use crate::types::{ExitPrices, OrderKey, Position, PositionStatus};

use super::{now_s, Engine};

/// Why a reconciliation pass was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncReason {
    Boot,
    Manual,
    Recovery,
    PeakEvent,
    Emergency,
}

impl SyncReason {
    fn as_str(self) -> &'static str {
        match self {
            SyncReason::Boot => "BOOT",
            SyncReason::Manual => "MANUAL",
            SyncReason::Recovery => "RECOVERY",
            SyncReason::PeakEvent => "PEAK_EVENT",
            SyncReason::Emergency => "EMERGENCY",
        }
    }

    fn bypasses_throttle(self) -> bool {
        matches!(
            self,
            SyncReason::Boot | SyncReason::Manual | SyncReason::Recovery | SyncReason::Emergency
        )
    }
}

fn is_tagged(order: &OrderInfo) -> bool {
    order.client_order_id.starts_with("EX_")
}

/// Best-effort reconciliation of executor state with the venue.
pub async fn sync(engine: &mut Engine, reason: SyncReason, now: i64) {
    if !reason.bypasses_throttle() {
        let live = engine.st.has_open_position();
        let age = now - engine.st.last_sync_s;
        if live && age < engine.config.manage.sync_throttle_sec {
            engine.notifier.event(
                "SYNC_SKIP_THROTTLED",
                json!({ "reason": reason.as_str(), "age_sec": age }),
            );
            return;
        }
    }
    engine.st.last_sync_s = now;

    // Reuse a fresh snapshot; otherwise fetch and warm it.
    let orders: Vec<OrderInfo> = if engine
        .open_orders
        .is_fresh(now, engine.config.manage.snapshot_min_sec)
        && engine.open_orders.ok
    {
        engine.open_orders.orders().to_vec()
    } else {
        match engine.api.open_orders().await {
            Ok(orders) => {
                engine
                    .open_orders
                    .install(orders.clone(), &format!("sync:{}", reason.as_str()), now);
                orders
            }
            Err(e) => {
                engine.note_exchange_error(&e, "sync open orders");
                engine.notifier.event(
                    "SYNC_ERR_OPENORDERS",
                    json!({ "reason": reason.as_str(), "error": e.to_string() }),
                );
                return;
            }
        }
    };
    let tagged: Vec<OrderInfo> = orders.into_iter().filter(is_tagged).collect();

    if engine.st.has_open_position() {
        if tagged.is_empty() {
            sync_no_tagged(engine, now).await;
        } else {
            sync_tracked_legs(engine, &tagged, now).await;
        }
        return;
    }

    if !tagged.is_empty() {
        attach_shell(engine, &tagged).await;
    }
}

/// Local state says live, the venue shows no tagged orders.
async fn sync_no_tagged(engine: &mut Engine, now: i64) {
    let status = engine
        .st
        .position
        .as_ref()
        .map(|p| p.status)
        .expect("caller checked");

    // OPEN_FILLED can legitimately have zero open orders: the entry is
    // filled and the exits are still pending placement retries. Clearing
    // the slot here would forget a real position.
    if status == PositionStatus::OpenFilled {
        let has_exits = engine
            .st
            .position
            .as_ref()
            .is_some_and(|p| p.orders.tp1.is_some() || p.orders.sl.is_some());
        if !has_exits {
            engine
                .notifier
                .event("SYNC_SKIP_CLEAR_OPEN_FILLED_NO_ORDERS", json!({}));
            return;
        }
    }

    if status == PositionStatus::Pending {
        // Clear only when the entry is confirmed dead and unfilled.
        let entry_id = engine.st.position.as_ref().and_then(|p| p.entry_order_id);
        let Some(entry_id) = entry_id else {
            engine
                .notifier
                .event("SYNC_KEEP_NO_TAGGED_NO_ENTRY_ID", json!({}));
            return;
        };
        match engine.api.status(entry_id).await {
            Ok(info)
                if info.status.is_cancel_terminal() && info.executed_qty <= Decimal::ZERO =>
            {
                let pos = engine.st.position.take().expect("caller checked");
                engine.notifier.event(
                    "SYNC_CLEAR_ENTRY_CONFIRMED_CANCELED",
                    json!({ "order_id": entry_id }),
                );
                engine.close_slot(pos, "SYNC_ENTRY_CANCELED").await;
                engine.st.cooldown_until_s = 0;
                engine.persist("sync_entry_canceled").await;
            }
            Ok(info) => {
                engine.notifier.event(
                    "SYNC_KEEP_ENTRY_NOT_CANCELED",
                    json!({
                        "order_id": entry_id,
                        "status": info.status.to_string(),
                        "executed_qty": info.executed_qty.to_string(),
                    }),
                );
            }
            Err(e) => engine.note_exchange_error(&e, "sync entry status"),
        }
        return;
    }

    // OPEN (or OPEN_FILLED with exit ids): the exchange-empty check owns
    // the clearing decision, confirming exposure and debt first.
    clear_if_exchange_empty(engine, now).await;
}

/// Resolve each tracked leg id against the live open orders.
async fn sync_tracked_legs(engine: &mut Engine, tagged: &[OrderInfo], now: i64) {
    let open_ids: Vec<i64> = tagged.iter().map(|o| o.order_id).collect();
    let throttle = engine.config.manage.sync_throttle_sec;

    for key in [OrderKey::Tp1, OrderKey::Tp2, OrderKey::Sl] {
        let (order_id, leg_done) = {
            let Some(pos) = engine.st.position.as_ref() else {
                return;
            };
            let done = match key {
                OrderKey::Tp1 => pos.tp1_done,
                OrderKey::Tp2 => pos.tp2_done,
                OrderKey::Sl => pos.sl_done,
                OrderKey::SlPrev => true,
            };
            (pos.orders.get(key), done)
        };
        let Some(order_id) = order_id else {
            continue;
        };
        if leg_done || open_ids.contains(&order_id) {
            continue;
        }

        // Tracked but not resting: resolve against order history.
        let info = match engine.api.status(order_id).await {
            Ok(info) => info,
            Err(e) => {
                engine.note_exchange_error(&e, "sync leg status");
                continue;
            }
        };
        {
            let pos = engine.st.position.as_mut().expect("caller checked");
            pos.recon.observe(key, info.status, now);
        }

        match info.status {
            OrderStatus::Filled => {
                // The tick's detection paths own the transition; here we
                // only surface the sighting.
                let emit = {
                    let pos = engine.st.position.as_mut().expect("caller checked");
                    pos.recon
                        .should_emit(&format!("recon:{}:{order_id}:filled", key.as_str()), now, throttle)
                };
                if emit {
                    engine.notifier.event(
                        "RECON_ORDER_FILLED_SEEN",
                        json!({ "which": key.as_str(), "order_id": order_id }),
                    );
                }
            }
            status if status.is_cancel_terminal() => {
                let emit = {
                    let pos = engine.st.position.as_mut().expect("caller checked");
                    pos.orders.clear(key);
                    pos.recon
                        .should_emit(&format!("recon:{}:{order_id}", key.as_str()), now, throttle)
                };
                engine.persist("recon_order_missing").await;
                if emit {
                    engine
                        .notifier
                        .event_and_webhook(
                            "RECON_ORDER_MISSING",
                            json!({
                                "which": key.as_str(),
                                "order_id": order_id,
                                "status": info.status.to_string(),
                            }),
                        )
                        .await;
                }
            }
            _ => {
                let emit = {
                    let pos = engine.st.position.as_mut().expect("caller checked");
                    pos.recon.should_emit(
                        &format!("recon:{}:{order_id}:active", key.as_str()),
                        now,
                        throttle,
                    )
                };
                if emit {
                    engine.notifier.event(
                        "RECON_EXIT_NOT_IN_OPEN_BUT_ACTIVE",
                        json!({
                            "which": key.as_str(),
                            "order_id": order_id,
                            "status": info.status.to_string(),
                        }),
                    );
                }
            }
        }
    }
    engine.persist("sync_tracked_legs").await;
}

/// Rebuild a minimal position shell from tagged open orders after state
/// loss (fresh install, wiped state file).
async fn attach_shell(engine: &mut Engine, tagged: &[OrderInfo]) {
    let find = |prefix: &str| {
        tagged
            .iter()
            .find(|o| o.client_order_id.starts_with(prefix))
    };
    let entry = find("EX_EN_");
    let tp1 = find("EX_TP1_");
    let tp2 = find("EX_TP2_");
    let sl = find("EX_SL_");

    // Exit orders sell for a LONG and buy for a SHORT.
    let side = [tp1, tp2, sl]
        .into_iter()
        .flatten()
        .map(|o| match o.side {
            OrderSide::Sell => Side::Long,
            OrderSide::Buy => Side::Short,
        })
        .next();
    let Some(side) = side.or_else(|| {
        entry.map(|o| match o.side {
            OrderSide::Buy => Side::Long,
            OrderSide::Sell => Side::Short,
        })
    }) else {
        return;
    };

    let qty = sl
        .map(|o| o.orig_qty)
        .filter(|q| *q > Decimal::ZERO)
        .or_else(|| entry.map(|o| o.orig_qty))
        .unwrap_or(Decimal::ZERO);

    let prices = match (entry.and_then(|o| o.price), sl.and_then(|o| o.stop_price)) {
        (Some(e), Some(s)) => {
            let tp1_p = tp1.and_then(|o| o.price);
            let tp2_p = tp2.and_then(|o| o.price);
            match (tp1_p, tp2_p) {
                (Some(t1), Some(t2)) => Some(ExitPrices {
                    entry: e,
                    sl: s,
                    tp1: t1,
                    tp2: t2,
                }),
                _ => None,
            }
        }
        _ => None,
    };

    let trade_key = entry
        .or(sl)
        .map(|o| o.client_order_id.clone())
        .unwrap_or_else(|| format!("EX_SYNC_{}", now_s()));

    let mut pos = Position {
        trade_key,
        side,
        status: if entry.is_some() {
            PositionStatus::Pending
        } else {
            PositionStatus::Open
        },
        qty,
        prices,
        entry_order_id: entry.map(|o| o.order_id),
        synced: true,
        ..Position::default()
    };
    pos.orders.tp1 = tp1.map(|o| o.order_id);
    pos.orders.tp2 = tp2.map(|o| o.order_id);
    pos.orders.sl = sl.map(|o| o.order_id);

    let summary = json!({
        "side": side.to_string(),
        "tagged_orders": tagged.len(),
        "status": format!("{:?}", pos.status),
    });
    engine.st.position = Some(pos);
    engine.persist("sync_attached").await;
    engine.notifier.event("SYNC_ATTACHED", summary);
}

/// The exchange-empty condition: no open orders, no base exposure, and
/// (margin) no debt. When all three confirm, the live slot was closed
/// manually from the exchange side. Clear it and enter cooldown.
///
/// Returns true when the slot was cleared.
pub async fn clear_if_exchange_empty(engine: &mut Engine, now: i64) -> bool {
    let eligible = engine.st.position.as_ref().is_some_and(|p| {
        // OPEN_FILLED without exits legitimately has no open orders.
        p.status == PositionStatus::Open
            || (p.status == PositionStatus::OpenFilled && p.orders.sl.is_some())
    });
    if !eligible {
        return false;
    }
    // Cheap pre-gate: only act when a fresh snapshot already shows empty.
    if !(engine.open_orders.ok
        && engine
            .open_orders
            .is_fresh(now, engine.config.manage.snapshot_min_sec * 2)
        && engine.open_orders.orders().iter().filter(|o| is_tagged(o)).count() == 0)
    {
        return false;
    }
    // Bound the confirmation calls.
    let should_check = {
        let pos = engine.st.position.as_mut().expect("checked above");
        pos.recon.should_emit(
            "exchange_empty_check",
            now,
            engine.config.manage.sync_throttle_sec,
        )
    };
    if !should_check {
        return false;
    }

    match engine.api.base_exposure().await {
        Ok(Some(false)) => {}
        Ok(_) => {
            engine
                .notifier
                .event("POSITION_CLEAR_EXCHANGE_UNKNOWN", json!({}));
            return false;
        }
        Err(e) => {
            engine.note_exchange_error(&e, "exchange-empty exposure check");
            return false;
        }
    }
    if engine.config.trade_mode == crate::config::TradeMode::Margin {
        match engine.api.debt_snapshot().await {
            Ok(snapshot) if !snapshot.has_debt => {}
            Ok(_) => return false,
            Err(e) => {
                engine.note_exchange_error(&e, "exchange-empty debt check");
                return false;
            }
        }
    }

    let pos = engine.st.position.take().expect("checked above");
    engine
        .notifier
        .event_and_webhook(
            "POSITION_CLEARED_BY_EXCHANGE",
            json!({
                "prev_status": format!("{:?}", pos.status),
                "trade_key": pos.trade_key,
            }),
        )
        .await;
    engine.close_slot(pos, "CLEARED_BY_EXCHANGE").await;
    true
}
