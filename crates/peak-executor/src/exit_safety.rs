//! Exit-safety planner.
//!
//! Pure functions from observed order state to *planned* watchdog actions.
//! No side effects, no I/O, no state mutation: the tick is the impure
//! orchestrator, this module encodes the decisions. That purity is what
//! makes the watchdog policies testable in isolation.

use peak_common::steps::floor_to_step;
use peak_common::types::{OrderSide, Side};
use rust_decimal::Decimal;

use crate::exchange::{OrderInfo, OrderStatus};
use crate::types::{Position, PositionStatus};

/// Sizing limits the planner needs from configuration.
#[derive(Debug, Clone, Copy)]
pub struct PlannerLimits {
    pub qty_step: Decimal,
    pub min_qty: Decimal,
    pub min_notional: Decimal,
    pub sl_watchdog_grace_sec: i64,
}

/// A detection the tick should log (one-shot per position via the
/// `*_wd_*_logged` flags).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Detection {
    SlPartial { order_id: i64, executed_qty: Decimal },
    SlDust { qty_raw: Decimal, qty_quantized: Decimal, notional_raw: Decimal },
    Tp1MissingCrossed { status: OrderStatus },
    Tp1PartialCrossed { executed_qty: Decimal },
    Tp2MissingSynthetic { status: OrderStatus },
}

/// Market-flatten reasons carried into events and the close record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlattenReason {
    SlPartialFallback,
    SlWatchdog,
    Tp1MissingCrossed,
    Tp1PartialCrossed,
}

impl FlattenReason {
    pub fn as_str(self) -> &'static str {
        match self {
            FlattenReason::SlPartialFallback => "SL_PARTIAL_FALLBACK",
            FlattenReason::SlWatchdog => "SL_WATCHDOG",
            FlattenReason::Tp1MissingCrossed => "TP1_MISSING_PRICE_CROSSED",
            FlattenReason::Tp1PartialCrossed => "TP1_PARTIAL_PRICE_CROSSED",
        }
    }
}

/// Planned stop-watchdog action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopPlan {
    /// Cancel the listed orders, then market-flatten `qty`.
    MarketFlatten {
        qty: Decimal,
        side: OrderSide,
        reason: FlattenReason,
        cancel_ids: Vec<i64>,
    },
    /// The remainder cannot be market-closed (below lot/notional
    /// minimums): cancel the listed orders, accept the dust, close the
    /// slot after cleanup.
    AcceptDust {
        qty_raw: Decimal,
        qty_quantized: Decimal,
        notional_raw: Decimal,
        cancel_ids: Vec<i64>,
    },
}

/// Stop-watchdog assessment: the trigger bookkeeping the tick must store
/// plus an optional plan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StopAssessment {
    /// New value for `sl_watchdog_first_trigger_s`.
    pub first_trigger_s: Option<i64>,
    pub plan: Option<StopPlan>,
    pub detections: Vec<Detection>,
}

/// Planned take-profit watchdog action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TpPlan {
    /// TP1 is gone but price crossed it: market-close the first leg and
    /// run the break-even transition as if TP1 had filled.
    CloseFirstLeg {
        qty: Decimal,
        side: OrderSide,
        reason: FlattenReason,
        executed_qty: Decimal,
    },
    /// First-leg remainder is dust: mark TP1 done, leave the dust.
    FirstLegDust {
        qty_raw: Decimal,
        qty_quantized: Decimal,
        notional_raw: Decimal,
    },
    /// TP2 is gone but price crossed it: activate trailing on everything
    /// TP2 would have left behind (`qty2 + qty3`, NOT `qty3`; TP2 never
    /// filled).
    ActivateSyntheticTrailing { qty: Decimal },
}

/// Take-profit watchdog assessment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TpAssessment {
    pub plan: Option<TpPlan>,
    pub detections: Vec<Detection>,
}

fn quantize(qty: Decimal, limits: &PlannerLimits) -> Decimal {
    if qty <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    floor_to_step(qty, limits.qty_step)
}

fn crossed(side: Side, price_now: Decimal, level: Decimal) -> bool {
    match side {
        Side::Long => price_now >= level,
        Side::Short => price_now <= level,
    }
}

fn stop_triggered(side: Side, price_now: Decimal, stop: Decimal) -> bool {
    match side {
        Side::Long => price_now <= stop,
        Side::Short => price_now >= stop,
    }
}

/// Whether a market close of `qty_raw` is impossible under the venue
/// minimums (the dust condition).
fn is_dust(qty_raw: Decimal, qty_quantized: Decimal, price_now: Decimal, limits: &PlannerLimits) -> bool {
    if qty_raw <= Decimal::ZERO {
        return false;
    }
    if qty_quantized <= Decimal::ZERO || qty_quantized < limits.min_qty {
        return true;
    }
    let notional_raw = qty_raw * price_now;
    limits.min_notional > Decimal::ZERO && notional_raw < limits.min_notional
}

/// Position quantity the stop is protecting, preferring the live order's
/// `origQty` over the derived leg arithmetic.
fn protected_qty(pos: &Position, sl_payload: Option<&OrderInfo>) -> Decimal {
    if let Some(payload) = sl_payload {
        if payload.orig_qty > Decimal::ZERO {
            return payload.orig_qty;
        }
    }
    pos.remaining_qty()
}

/// Stop price currently in effect, preferring the live order's trigger.
fn stop_price(pos: &Position, sl_payload: Option<&OrderInfo>) -> Option<Decimal> {
    if let Some(payload) = sl_payload {
        if let Some(sp) = payload.stop_price.filter(|p| *p > Decimal::ZERO) {
            return Some(sp);
        }
    }
    pos.effective_stop().filter(|p| *p > Decimal::ZERO)
}

/// Assess the stop watchdog.
///
/// Detection policies:
/// - *SL partial*: the stop shows `executedQty > 0` with a non-terminal
///   status. Cancel the remainder and market-flatten it.
/// - *SL slippage*: mid crossed the stop and the stop is still
///   non-terminal beyond the grace period. Market fallback.
/// - A FILLED stop is not this module's business: the tick's
///   finalization-first check handles it.
pub fn assess_stop(
    pos: &Position,
    sl_payload: Option<&OrderInfo>,
    price_now: Option<Decimal>,
    now_s: i64,
    limits: &PlannerLimits,
) -> StopAssessment {
    let mut out = StopAssessment {
        first_trigger_s: pos.sl_watchdog_first_trigger_s,
        ..StopAssessment::default()
    };

    if pos.status != PositionStatus::Open || pos.sl_watchdog_fired {
        return out;
    }
    let Some(sl_id) = pos.orders.sl else {
        return out;
    };
    let pos_qty = protected_qty(pos, sl_payload);
    if pos_qty <= limits.min_qty.max(Decimal::ZERO) {
        return out;
    }
    let Some(sl_stop) = stop_price(pos, sl_payload) else {
        return out;
    };
    let Some(price_now) = price_now.filter(|p| *p > Decimal::ZERO) else {
        return out;
    };

    let (status, executed_qty) = match sl_payload {
        Some(p) => (Some(p.status), p.executed_qty),
        None => (None, Decimal::ZERO),
    };

    if status == Some(OrderStatus::Filled) {
        out.first_trigger_s = None;
        return out;
    }

    // Partial execution on a still-live stop: flatten the remainder now.
    if executed_qty > Decimal::ZERO {
        let qty_raw = (pos_qty - executed_qty).max(Decimal::ZERO);
        let mut qty = quantize(qty_raw, limits);
        if qty <= limits.min_qty.max(limits.qty_step) {
            qty = Decimal::ZERO;
        }
        out.detections.push(Detection::SlPartial {
            order_id: sl_id,
            executed_qty,
        });
        if is_dust(qty_raw, qty, price_now, limits) || qty <= Decimal::ZERO {
            out.detections.push(Detection::SlDust {
                qty_raw,
                qty_quantized: qty,
                notional_raw: qty_raw * price_now,
            });
            out.plan = Some(StopPlan::AcceptDust {
                qty_raw,
                qty_quantized: qty,
                notional_raw: qty_raw * price_now,
                cancel_ids: pos.orders.cancelable_ids(),
            });
        } else {
            out.plan = Some(StopPlan::MarketFlatten {
                qty,
                side: pos.side.exit_side(),
                reason: FlattenReason::SlPartialFallback,
                cancel_ids: pos.orders.cancelable_ids(),
            });
        }
        return out;
    }

    // Slippage path: price through the stop, stop not executing.
    if stop_triggered(pos.side, price_now, sl_stop) {
        let first = out.first_trigger_s.unwrap_or(now_s);
        out.first_trigger_s = Some(first);
        if now_s - first >= limits.sl_watchdog_grace_sec {
            let qty_raw = pos_qty;
            let qty = quantize(qty_raw, limits);
            if is_dust(qty_raw, qty, price_now, limits) {
                out.detections.push(Detection::SlDust {
                    qty_raw,
                    qty_quantized: qty,
                    notional_raw: qty_raw * price_now,
                });
                out.plan = Some(StopPlan::AcceptDust {
                    qty_raw,
                    qty_quantized: qty,
                    notional_raw: qty_raw * price_now,
                    cancel_ids: pos.orders.cancelable_ids(),
                });
            } else {
                out.plan = Some(StopPlan::MarketFlatten {
                    qty,
                    side: pos.side.exit_side(),
                    reason: FlattenReason::SlWatchdog,
                    cancel_ids: pos.orders.cancelable_ids(),
                });
            }
        }
    } else {
        out.first_trigger_s = None;
    }
    out
}

/// Assess the take-profit watchdogs.
pub fn assess_tp(
    pos: &Position,
    tp1_payload: Option<&OrderInfo>,
    tp2_payload: Option<&OrderInfo>,
    price_now: Option<Decimal>,
    limits: &PlannerLimits,
) -> TpAssessment {
    let mut out = TpAssessment::default();
    if !matches!(
        pos.status,
        PositionStatus::Open | PositionStatus::OpenFilled
    ) {
        return out;
    }
    let Some(prices) = pos.prices else {
        return out;
    };
    let Some(price_now) = price_now.filter(|p| *p > Decimal::ZERO) else {
        return out;
    };

    // TP1 gone while price crossed it.
    if let (Some(_), false, Some(payload)) = (pos.orders.tp1, pos.tp1_done, tp1_payload) {
        if payload.status.is_cancel_terminal() && crossed(pos.side, price_now, prices.tp1) {
            let executed = payload.executed_qty;
            let qty_raw = (pos.orders.qty1 - executed).max(Decimal::ZERO);
            let qty = quantize(qty_raw, limits);
            if executed > Decimal::ZERO {
                out.detections.push(Detection::Tp1PartialCrossed {
                    executed_qty: executed,
                });
            } else {
                out.detections.push(Detection::Tp1MissingCrossed {
                    status: payload.status,
                });
            }
            if is_dust(qty_raw, qty, price_now, limits) || qty <= Decimal::ZERO {
                out.plan = Some(TpPlan::FirstLegDust {
                    qty_raw,
                    qty_quantized: qty,
                    notional_raw: qty_raw * price_now,
                });
            } else {
                out.plan = Some(TpPlan::CloseFirstLeg {
                    qty,
                    side: pos.side.exit_side(),
                    reason: if executed > Decimal::ZERO {
                        FlattenReason::Tp1PartialCrossed
                    } else {
                        FlattenReason::Tp1MissingCrossed
                    },
                    executed_qty: executed,
                });
            }
            return out;
        }
    }

    // TP2 gone while price crossed it: synthetic trailing on qty2 + qty3.
    if let (Some(_), false, false, Some(payload)) =
        (pos.orders.tp2, pos.tp2_done, pos.tp2_synthetic, tp2_payload)
    {
        if payload.status.is_cancel_terminal() && crossed(pos.side, price_now, prices.tp2) {
            let qty = quantize(pos.orders.qty2 + pos.orders.qty3, limits);
            if qty > Decimal::ZERO {
                out.detections.push(Detection::Tp2MissingSynthetic {
                    status: payload.status,
                });
                out.plan = Some(TpPlan::ActivateSyntheticTrailing { qty });
            }
        }
    }
    out
}
