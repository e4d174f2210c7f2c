//! Exit placement: validation, the three reduce-side legs, and the
//! bounded retry with failsafe flatten.

use peak_common::steps::{
    floor_to_step, fmt_price, round_nearest_to_step, split_three_legs, LegSplit,
};
use peak_common::types::Side;
use rust_decimal::Decimal;
use serde_json::json;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::config::Config;
use crate::exchange::{ExchangeApi, ExchangeError};
use crate::types::{ExitClientIds, ExitOrders, ExitPrices, PositionStatus};

use super::Engine;

#[derive(Debug, Error)]
pub enum ExitPlanError {
    #[error("invalid price {name}={value}")]
    BadPrice { name: &'static str, value: Decimal },

    #[error("bad {side} price ordering: sl={sl} entry={entry} tp1={tp1} tp2={tp2}")]
    BadOrdering {
        side: Side,
        entry: Decimal,
        sl: Decimal,
        tp1: Decimal,
        tp2: Decimal,
    },

    #[error("price {name}={value} not aligned to tick {tick}")]
    NotAligned {
        name: &'static str,
        value: Decimal,
        tick: Decimal,
    },

    #[error("quantity too small: total={total} min_qty={min_qty}")]
    QtyTooSmall { total: Decimal, min_qty: Decimal },

    #[error("three-leg split failed: {0}")]
    Split(#[from] peak_common::steps::SplitError),

    #[error("worst-case notional {notional} below minimum {min_notional}")]
    MinNotional {
        notional: Decimal,
        min_notional: Decimal,
    },
}

/// Validated exit inputs ready for placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidatedExits {
    pub qty_total: Decimal,
    pub legs: LegSplit,
    pub prices: ExitPrices,
}

/// Validate exit inputs before any order goes out: price hierarchy with
/// minimum-tick separation, tick alignment (normalizing to the exact
/// aligned value), lot rounding, split viability, and a worst-case
/// min-notional check. Fails fast with a clear error instead of a venue
/// rejection.
pub fn validate_exit_plan(
    config: &Config,
    side: Side,
    qty_total: Decimal,
    prices: ExitPrices,
) -> Result<ValidatedExits, ExitPlanError> {
    let tick = config.sizing.tick_size;
    let tol = tick / Decimal::new(1_000_000, 0);

    let mut aligned = prices;
    for (name, value) in [
        ("entry", &mut aligned.entry),
        ("sl", &mut aligned.sl),
        ("tp1", &mut aligned.tp1),
        ("tp2", &mut aligned.tp2),
    ] {
        if *value <= Decimal::ZERO {
            return Err(ExitPlanError::BadPrice {
                name,
                value: *value,
            });
        }
        let snapped = round_nearest_to_step(*value, tick);
        if (snapped - *value).abs() > tol {
            return Err(ExitPlanError::NotAligned {
                name,
                value: *value,
                tick,
            });
        }
        *value = snapped;
    }

    let ok = match side {
        Side::Long => aligned.sl < aligned.entry && aligned.entry < aligned.tp1 && aligned.tp1 <= aligned.tp2,
        Side::Short => aligned.sl > aligned.entry && aligned.entry > aligned.tp1 && aligned.tp1 >= aligned.tp2,
    };
    if !ok {
        return Err(ExitPlanError::BadOrdering {
            side,
            entry: aligned.entry,
            sl: aligned.sl,
            tp1: aligned.tp1,
            tp2: aligned.tp2,
        });
    }

    let qty_total_r = floor_to_step(qty_total, config.sizing.qty_step);
    if qty_total_r < config.sizing.min_qty {
        return Err(ExitPlanError::QtyTooSmall {
            total: qty_total_r,
            min_qty: config.sizing.min_qty,
        });
    }
    let legs = split_three_legs(qty_total_r, config.sizing.qty_step)?;

    if config.sizing.min_notional > Decimal::ZERO {
        let worst_price = [aligned.entry, aligned.sl, aligned.tp1, aligned.tp2]
            .into_iter()
            .min()
            .unwrap_or(aligned.sl);
        let notional = worst_price * qty_total_r;
        if notional < config.sizing.min_notional {
            return Err(ExitPlanError::MinNotional {
                notional,
                min_notional: config.sizing.min_notional,
            });
        }
    }

    Ok(ValidatedExits {
        qty_total: qty_total_r,
        legs,
        prices: aligned,
    })
}

/// Stop-limit prices for a stop order: the limit sits a configured gap of
/// ticks past the trigger, and never equals it even after rounding.
pub fn stop_limit_prices(config: &Config, side: Side, stop: Decimal) -> (Decimal, Decimal) {
    let tick = config.sizing.tick_size;
    let gap = tick * Decimal::from(config.manage.sl_limit_gap_ticks.max(1));
    let limit = match side.exit_side() {
        peak_common::types::OrderSide::Sell => stop - gap,
        peak_common::types::OrderSide::Buy => stop + gap,
    };
    let stop_s = fmt_price(stop, tick);
    let limit_s = fmt_price(limit, tick);
    if stop_s == limit_s {
        let nudged = match side.exit_side() {
            peak_common::types::OrderSide::Sell => stop - tick,
            peak_common::types::OrderSide::Buy => stop + tick,
        };
        return (stop, nudged);
    }
    (stop, limit)
}

/// Derive idempotent exit client ids for a position. Stable across
/// restarts: a placement retried after a crash reuses the same ids.
pub fn exit_client_ids(trade_key: &str, symbol: &str, side: Side) -> ExitClientIds {
    let suffix = if trade_key.is_empty() {
        // Collision-free fallback when there is no trade key to hash.
        uuid::Uuid::new_v4().simple().to_string()[..12].to_string()
    } else {
        let digest = Sha256::digest(format!("{trade_key}|{symbol}|{side}").as_bytes());
        hex::encode(digest)[..12].to_string()
    };
    ExitClientIds {
        tp1: format!("EX_TP1_{suffix}"),
        tp2: format!("EX_TP2_{suffix}"),
        sl: format!("EX_SL_{suffix}"),
    }
}

/// Place TP1 + TP2 + SL. TPs go out as maker orders (with the adapter's
/// LIMIT fallback); the stop is a stop-limit covering the whole position.
pub async fn place_exits(
    api: &dyn ExchangeApi,
    config: &Config,
    side: Side,
    validated: &ValidatedExits,
    cids: &ExitClientIds,
) -> Result<ExitOrders, ExchangeError> {
    let exit_side = side.exit_side();

    let tp1 = api
        .place_limit_maker(exit_side, validated.legs.qty1, validated.prices.tp1, &cids.tp1)
        .await?;
    let tp2 = api
        .place_limit_maker(exit_side, validated.legs.qty2, validated.prices.tp2, &cids.tp2)
        .await?;

    let (stop, limit) = stop_limit_prices(config, side, validated.prices.sl);
    let sl = api
        .place_stop_loss_limit(exit_side, validated.qty_total, stop, limit, &cids.sl)
        .await?;

    Ok(ExitOrders {
        sl: Some(sl.order_id),
        sl_prev: None,
        tp1: Some(tp1.order_id),
        tp2: Some(tp2.order_id),
        qty1: validated.legs.qty1,
        qty2: validated.legs.qty2,
        qty3: validated.legs.qty3,
        legs_degraded: validated.legs.degraded,
    })
}

/// Ensure exits are placed for the live position. Returns true on success.
pub async fn ensure_exits(engine: &mut Engine, reason: &str) -> bool {
    let Some(mut pos) = engine.st.position.take() else {
        return false;
    };
    let Some(prices) = pos.prices else {
        engine.st.position = Some(pos);
        return false;
    };

    let validated = match validate_exit_plan(&engine.config, pos.side, pos.qty, prices) {
        Ok(v) => v,
        Err(e) => {
            engine.notifier.event(
                "EXITS_PLACE_ERROR",
                json!({ "reason": reason, "error": e.to_string() }),
            );
            engine.st.position = Some(pos);
            return false;
        }
    };
    pos.qty = validated.qty_total;
    pos.prices = Some(validated.prices);

    // Client ids are fixed and persisted BEFORE the first placement so a
    // restart retries with the same ids instead of duplicating orders.
    if pos.exit_client_ids.is_none() {
        pos.exit_client_ids = Some(exit_client_ids(
            &pos.trade_key,
            &engine.config.symbol,
            pos.side,
        ));
        engine.st.position = Some(pos);
        engine.persist("exit_client_ids").await;
        pos = engine.st.position.take().expect("position restored above");
    }
    let cids = pos.exit_client_ids.clone().expect("set above");

    match place_exits(engine.api.as_ref(), &engine.config, pos.side, &validated, &cids).await {
        Ok(orders) => {
            pos.orders = orders;
            pos.status = PositionStatus::Open;
            let summary = json!({
                "reason": reason,
                "sl": pos.orders.sl,
                "tp1": pos.orders.tp1,
                "tp2": pos.orders.tp2,
                "qty1": pos.orders.qty1.to_string(),
                "qty2": pos.orders.qty2.to_string(),
                "qty3": pos.orders.qty3.to_string(),
                "degraded": pos.orders.legs_degraded,
            });
            engine.st.position = Some(pos);
            engine.persist("exits_placed").await;
            engine.notifier.event_and_webhook("EXITS_PLACED", summary).await;
            true
        }
        Err(e) => {
            engine.note_exchange_error(&e, "place exits");
            engine.notifier.event(
                "EXITS_PLACE_ERROR",
                json!({ "reason": reason, "error": e.to_string() }),
            );
            engine.st.position = Some(pos);
            engine.persist("exits_place_failed").await;
            false
        }
    }
}

/// Retry exits placement for a position stuck in OPEN_FILLED without
/// exits; after the retry budget, optionally flatten (failsafe).
pub async fn handle_exits_retry(engine: &mut Engine, now_s: i64) {
    let due = {
        let Some(pos) = engine.st.position.as_ref() else {
            return;
        };
        pos.status == PositionStatus::OpenFilled
            && pos.orders.tp1.is_none()
            && pos.orders.sl.is_none()
            && pos.prices.is_some()
            && now_s >= pos.exits_next_try_s
    };
    if !due {
        return;
    }

    let tries = {
        let pos = engine.st.position.as_mut().expect("checked above");
        pos.exits_tries += 1;
        if pos.exits_first_fail_s == 0 {
            pos.exits_first_fail_s = now_s;
        }
        pos.exits_next_try_s = now_s + engine.config.manage.exits_retry_every_sec;
        pos.exits_tries
    };
    engine.persist("exits_retry_schedule").await;

    if ensure_exits(engine, "retry").await {
        return;
    }
    engine.notifier.event(
        "EXITS_RETRY_FAIL",
        json!({ "attempt": tries, "symbol": engine.config.symbol }),
    );

    if !engine.config.manage.failsafe_flatten {
        return;
    }
    let max_tries = engine.config.manage.failsafe_exits_max_tries;
    let grace = engine.config.manage.failsafe_exits_grace_sec;
    let Some(pos) = engine.st.position.as_ref() else {
        return;
    };
    if max_tries == 0 || tries < max_tries || now_s - pos.exits_first_fail_s < grace {
        return;
    }

    // Retry budget exhausted with flatten enabled: close at market.
    let side = pos.side;
    let qty = pos.qty;
    let client_id = format!("EX_FLAT_{now_s}");
    match engine
        .api
        .place_market(side.exit_side(), qty, &client_id)
        .await
    {
        Ok(_) => {
            let pos = engine.st.position.take().expect("checked above");
            engine
                .notifier
                .event_and_webhook(
                    "FAILSAFE_FLATTEN",
                    json!({ "tries": tries, "qty": qty.to_string() }),
                )
                .await;
            engine.close_slot(pos, "FAILSAFE_FLATTEN").await;
        }
        Err(e) => {
            engine.note_exchange_error(&e, "failsafe flatten");
            engine.notifier.event(
                "FAILSAFE_FLATTEN_ERROR",
                json!({ "error": e.to_string(), "tries": tries }),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn prices() -> ExitPrices {
        ExitPrices {
            entry: dec!(95000.50),
            sl: dec!(94800.00),
            tp1: dec!(95200.00),
            tp2: dec!(95400.00),
        }
    }

    #[test]
    fn test_validate_happy_path() {
        let config = Config::default();
        let v = validate_exit_plan(&config, Side::Long, dec!(0.00100), prices()).unwrap();
        assert_eq!(v.qty_total, dec!(0.00100));
        assert_eq!(v.legs.qty1 + v.legs.qty2 + v.legs.qty3, dec!(0.00100));
        assert!(!v.legs.degraded);
    }

    #[test]
    fn test_validate_rejects_bad_ordering() {
        let config = Config::default();
        let mut p = prices();
        p.sl = dec!(95300.00); // stop above entry on a LONG
        let err = validate_exit_plan(&config, Side::Long, dec!(0.00100), p).unwrap_err();
        assert!(matches!(err, ExitPlanError::BadOrdering { .. }));
    }

    #[test]
    fn test_validate_rejects_off_tick() {
        let config = Config::default();
        let mut p = prices();
        p.tp1 = dec!(95200.005);
        let err = validate_exit_plan(&config, Side::Long, dec!(0.00100), p).unwrap_err();
        assert!(matches!(err, ExitPlanError::NotAligned { name: "tp1", .. }));
    }

    #[test]
    fn test_validate_rejects_tiny_notional() {
        let mut config = Config::default();
        config.sizing.min_notional = dec!(5);
        // 2 step units at ~95k is ~1.9 USDC.
        let err = validate_exit_plan(&config, Side::Long, dec!(0.00002), prices()).unwrap_err();
        assert!(matches!(err, ExitPlanError::MinNotional { .. }));
    }

    #[test]
    fn test_validate_short_ordering() {
        let config = Config::default();
        let p = ExitPrices {
            entry: dec!(95000.00),
            sl: dec!(95200.00),
            tp1: dec!(94800.00),
            tp2: dec!(94600.00),
        };
        assert!(validate_exit_plan(&config, Side::Short, dec!(0.00100), p).is_ok());
        assert!(validate_exit_plan(&config, Side::Long, dec!(0.00100), p).is_err());
    }

    #[test]
    fn test_stop_limit_gap() {
        let config = Config::default(); // gap = 2 ticks = 0.02
        let (stop, limit) = stop_limit_prices(&config, Side::Long, dec!(94800.00));
        assert_eq!(stop, dec!(94800.00));
        assert_eq!(limit, dec!(94799.98));
        let (stop, limit) = stop_limit_prices(&config, Side::Short, dec!(95200.00));
        assert_eq!(stop, dec!(95200.00));
        assert_eq!(limit, dec!(95200.02));
    }

    #[test]
    fn test_exit_client_ids_deterministic() {
        let a = exit_client_ids("EX_EN_1736800000", "BTCUSDC", Side::Long);
        let b = exit_client_ids("EX_EN_1736800000", "BTCUSDC", Side::Long);
        assert_eq!(a, b);
        assert!(a.tp1.starts_with("EX_TP1_"));
        assert!(a.sl.starts_with("EX_SL_"));
        let c = exit_client_ids("EX_EN_1736800001", "BTCUSDC", Side::Long);
        assert_ne!(a.sl, c.sl);
    }
}
