//! Cancel-first sequencing.
//!
//! Every replacement of an existing order follows the same contract:
//!
//! 1. Record `executedQty` of the old order before the cancel.
//! 2. Issue the cancel.
//! 3. Verify via a status poll: CANCELED / REJECTED / EXPIRED / MISSING
//!    are acceptable; FILLED means the old order *succeeded* while being
//!    canceled, so the transition aborts and normal finalization handles
//!    the fill.
//! 4. (Caller places the replacement.)
//! 5. Post-replace verify: re-poll the old order; a FILLED read with
//!    `executedQty` above the recorded value is a race-fill that must be
//!    offset.

use peak_common::steps::floor_to_step;
use rust_decimal::Decimal;
use serde_json::json;

use crate::exchange::{cancel_ignore_unknown, ExchangeApi, ExchangeError, OrderStatus};
use crate::notify::Notifier;

/// Outcome of the cancel-and-verify sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelVerdict {
    /// Old order is gone; `executed_before` is its execution at cancel
    /// time (what the post-replace verify compares against).
    Cleared { executed_before: Decimal },
    /// The old order fully filled while being canceled. The caller must
    /// abort the replacement and let finalization handle the fill.
    FilledDuringCancel,
    /// Cancel sent but the order still reads non-terminal. Retry later.
    Unverified(OrderStatus),
}

/// Steps 1–3 of the contract.
pub async fn cancel_and_verify(
    api: &dyn ExchangeApi,
    order_id: i64,
) -> Result<CancelVerdict, ExchangeError> {
    let before = api.status(order_id).await?;
    if before.status == OrderStatus::Filled {
        return Ok(CancelVerdict::FilledDuringCancel);
    }
    let executed_before = before.executed_qty;

    cancel_ignore_unknown(api, order_id).await?;

    let after = api.status(order_id).await?;
    if after.status == OrderStatus::Filled {
        return Ok(CancelVerdict::FilledDuringCancel);
    }
    if after.status.is_cancel_terminal() {
        Ok(CancelVerdict::Cleared { executed_before })
    } else {
        Ok(CancelVerdict::Unverified(after.status))
    }
}

/// Result of the post-replace verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RaceFill {
    /// Execution beyond what was recorded before the cancel.
    pub extra_qty: Decimal,
    /// Side the old order traded on.
    pub old_side: peak_common::types::OrderSide,
}

/// Step 5: re-poll the replaced order and report any race-fill.
pub async fn post_replace_verify(
    api: &dyn ExchangeApi,
    old_order_id: i64,
    executed_before: Decimal,
) -> Result<Option<RaceFill>, ExchangeError> {
    let now = api.status(old_order_id).await?;
    if now.status == OrderStatus::Filled && now.executed_qty > executed_before {
        return Ok(Some(RaceFill {
            extra_qty: now.executed_qty - executed_before,
            old_side: now.side,
        }));
    }
    Ok(None)
}

/// Offset a race-fill with a reverse-side MARKET order.
///
/// The replacement market order already reduced the position; the extra
/// fill on the old order created an unintended opposite-side exposure of
/// `extra_qty` that this flattens.
pub async fn rebalance_race_fill(
    api: &dyn ExchangeApi,
    notifier: &Notifier,
    race: RaceFill,
    qty_step: Decimal,
    old_order_id: i64,
    now_s: i64,
) -> Result<(), ExchangeError> {
    let qty = floor_to_step(race.extra_qty, qty_step);
    if qty <= Decimal::ZERO {
        notifier.event(
            "DOUBLE_FILL_REBALANCE_SKIPPED",
            json!({
                "order_id": old_order_id,
                "extra_qty": race.extra_qty,
                "reason": "below_lot_step",
            }),
        );
        return Ok(());
    }
    let side = race.old_side.opposite();
    let client_id = format!("EX_REBAL_{now_s}");
    api.place_market(side, qty, &client_id).await?;
    notifier
        .event_and_webhook(
            "DOUBLE_FILL_REBALANCE",
            json!({
                "order_id": old_order_id,
                "qty": qty.to_string(),
                "side": side.to_string(),
            }),
        )
        .await;
    Ok(())
}
