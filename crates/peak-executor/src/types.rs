//! Position state: the single mutable entity the tick owns.
//!
//! Everything here serializes into the state document; unknown-field
//! tolerance and per-field defaults keep restarts across versions safe.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use peak_common::types::Side;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::exchange::OrderStatus;

/// Lifecycle status of the position slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionStatus {
    /// Entry order resting, not filled yet.
    Pending,
    /// Entry filled and all three exit legs placed.
    Open,
    /// Entry filled; exits not placed (or not yet confirmed placed).
    OpenFilled,
    /// Finalization in progress (cleanup cancels outstanding).
    Closing,
    /// Terminal; only ever appears inside the last-closed record.
    Closed,
}

impl PositionStatus {
    /// The slot is occupied: new PEAKs must be ignored.
    pub fn is_live(self) -> bool {
        matches!(
            self,
            PositionStatus::Pending
                | PositionStatus::Open
                | PositionStatus::OpenFilled
                | PositionStatus::Closing
        )
    }
}

/// Identifier of a tracked exit order slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderKey {
    Sl,
    SlPrev,
    Tp1,
    Tp2,
}

impl OrderKey {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderKey::Sl => "sl",
            OrderKey::SlPrev => "sl_prev",
            OrderKey::Tp1 => "tp1",
            OrderKey::Tp2 => "tp2",
        }
    }
}

/// Planned prices for the position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitPrices {
    pub entry: Decimal,
    pub sl: Decimal,
    pub tp1: Decimal,
    pub tp2: Decimal,
}

/// Exit order ids plus the per-leg quantity split.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExitOrders {
    pub sl: Option<i64>,
    /// Orphan slot: the previous stop while a replacement is in flight.
    pub sl_prev: Option<i64>,
    pub tp1: Option<i64>,
    pub tp2: Option<i64>,
    pub qty1: Decimal,
    pub qty2: Decimal,
    pub qty3: Decimal,
    /// The 50/50/0 degrade fired when the legs were split.
    pub legs_degraded: bool,
}

impl ExitOrders {
    pub fn get(&self, key: OrderKey) -> Option<i64> {
        match key {
            OrderKey::Sl => self.sl,
            OrderKey::SlPrev => self.sl_prev,
            OrderKey::Tp1 => self.tp1,
            OrderKey::Tp2 => self.tp2,
        }
    }

    pub fn clear(&mut self, key: OrderKey) {
        match key {
            OrderKey::Sl => self.sl = None,
            OrderKey::SlPrev => self.sl_prev = None,
            OrderKey::Tp1 => self.tp1 = None,
            OrderKey::Tp2 => self.tp2 = None,
        }
    }

    /// Every id worth canceling on teardown, stop slots first, deduped.
    pub fn cancelable_ids(&self) -> Vec<i64> {
        let mut ids = Vec::new();
        for id in [self.sl, self.sl_prev, self.tp1, self.tp2].into_iter().flatten() {
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        ids
    }
}

/// Last observed exchange status for one tracked order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservedStatus {
    pub status: OrderStatus,
    pub observed_s: i64,
}

impl ObservedStatus {
    pub fn is_fresh(&self, now_s: i64, max_age_sec: i64) -> bool {
        now_s - self.observed_s <= max_age_sec
    }
}

/// Per-order freshness cache used by reconciliation and the watchdogs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconCache {
    pub orders: HashMap<OrderKey, ObservedStatus>,
    /// Throttle stamps for reconciliation event emission.
    pub last_emit_s: HashMap<String, i64>,
}

impl ReconCache {
    pub fn observe(&mut self, key: OrderKey, status: OrderStatus, now_s: i64) {
        self.orders.insert(
            key,
            ObservedStatus {
                status,
                observed_s: now_s,
            },
        );
    }

    pub fn fresh_status(&self, key: OrderKey, now_s: i64, max_age_sec: i64) -> Option<OrderStatus> {
        self.orders
            .get(&key)
            .filter(|o| o.is_fresh(now_s, max_age_sec))
            .map(|o| o.status)
    }

    /// Returns true at most once per `throttle_sec` for a given event key.
    pub fn should_emit(&mut self, key: &str, now_s: i64, throttle_sec: i64) -> bool {
        let last = self.last_emit_s.get(key).copied().unwrap_or(0);
        if now_s - last < throttle_sec {
            return false;
        }
        self.last_emit_s.insert(key.to_string(), now_s);
        true
    }
}

/// Bounded-retry bookkeeping: attempts with a hard cap, then a cooldown
/// after which the counter resets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryBudget {
    pub attempts: u32,
    pub next_attempt_s: i64,
    pub disabled_until_s: i64,
}

impl RetryBudget {
    /// Whether an attempt may run now. Re-enables (and resets) once the
    /// post-cap cooldown has elapsed.
    pub fn ready(&mut self, now_s: i64) -> bool {
        if self.disabled_until_s > 0 {
            if now_s < self.disabled_until_s {
                return false;
            }
            *self = RetryBudget::default();
        }
        now_s >= self.next_attempt_s
    }

    /// Record a failed attempt. Returns true if the cap was just reached
    /// (the caller should treat the transition as disabled until cooldown).
    pub fn record_failure(&mut self, now_s: i64, retry_sec: i64, cap: u32, cooldown_sec: i64) -> bool {
        self.attempts += 1;
        if self.attempts >= cap {
            self.disabled_until_s = now_s + cooldown_sec;
            true
        } else {
            self.next_attempt_s = now_s + retry_sec;
            false
        }
    }

    pub fn record_success(&mut self) {
        *self = RetryBudget::default();
    }
}

/// Per-leg execution bookkeeping captured from status polls.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FillRecord {
    pub order_id: Option<i64>,
    pub status: Option<OrderStatus>,
    pub executed_qty: Decimal,
    pub cumulative_quote_qty: Decimal,
    pub avg_fill_price: Option<Decimal>,
    pub last_update_ms: Option<i64>,
}

impl FillRecord {
    /// Merge a fresh order payload; quantities only ever grow.
    pub fn absorb(&mut self, info: &crate::exchange::OrderInfo) -> bool {
        let mut changed = false;
        if self.order_id != Some(info.order_id) {
            self.order_id = Some(info.order_id);
            changed = true;
        }
        if self.status != Some(info.status) {
            self.status = Some(info.status);
            changed = true;
        }
        if info.executed_qty > self.executed_qty {
            self.executed_qty = info.executed_qty;
            changed = true;
        }
        if info.cumulative_quote_qty > self.cumulative_quote_qty {
            self.cumulative_quote_qty = info.cumulative_quote_qty;
            changed = true;
        }
        if self.executed_qty > Decimal::ZERO && self.cumulative_quote_qty > Decimal::ZERO {
            let avg = self.cumulative_quote_qty / self.executed_qty;
            if self.avg_fill_price != Some(avg) {
                self.avg_fill_price = Some(avg);
                changed = true;
            }
        }
        if info.update_time_ms != 0 && self.last_update_ms != Some(info.update_time_ms) {
            self.last_update_ms = Some(info.update_time_ms);
            changed = true;
        }
        changed
    }
}

/// The single mutable position entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Position {
    /// Opaque identity, stable across the lifecycle; never reused.
    pub trade_key: String,
    pub side: Side,
    pub status: PositionStatus,
    pub opened_at: DateTime<Utc>,
    pub opened_s: i64,

    /// Total quantity (post-fill this is the executed quantity).
    pub qty: Decimal,
    pub prices: Option<ExitPrices>,
    /// Actual average entry fill price when known.
    pub entry_actual: Option<Decimal>,

    pub entry_order_id: Option<i64>,
    pub client_id: String,
    pub orders: ExitOrders,
    /// Idempotent client ids for the exit legs, fixed before placement.
    pub exit_client_ids: Option<ExitClientIds>,
    pub fills: HashMap<String, FillRecord>,

    // Progress flags.
    pub tp1_done: bool,
    pub tp2_done: bool,
    pub sl_done: bool,
    pub trail_active: bool,
    /// Trailing was activated on the emergency path, not a TP2 fill.
    pub tp2_synthetic: bool,

    // Break-even transition machine (decoupled from TP1 detection).
    pub tp1_be_pending: bool,
    pub tp1_be_budget: RetryBudget,
    /// Old stop id while the break-even replacement is in flight.
    pub tp1_be_old_sl: Option<i64>,

    // Trailing state.
    pub trail_qty: Decimal,
    pub trail_sl_price: Option<Decimal>,
    pub trail_last_update_s: i64,
    pub trail_pending_cancel_sl: Option<i64>,
    pub trail_wait_confirm: bool,
    pub trail_ref_price: Option<Decimal>,

    // Stop watchdog substate.
    pub sl_watchdog_first_trigger_s: Option<i64>,
    pub sl_watchdog_fired: bool,
    pub sl_watchdog_last_attempt_s: i64,
    pub sl_watchdog_budget: RetryBudget,
    pub sl_watchdog_last_error: Option<String>,
    pub tp_wd_last_attempt_s: i64,

    // One-shot watchdog detection-event flags.
    pub tp1_wd_partial_logged: bool,
    pub tp1_wd_missing_logged: bool,
    pub tp2_wd_missing_logged: bool,
    pub sl_wd_partial_logged: bool,

    // Throttle stamps (unix seconds).
    pub tp1_status_next_s: i64,
    pub tp2_status_next_s: i64,
    pub sl_status_next_s: i64,
    pub sl_prev_next_cancel_s: i64,
    pub planb_next_action_s: i64,

    // Exits placement retry.
    pub exits_tries: u32,
    pub exits_next_try_s: i64,
    pub exits_first_fail_s: i64,

    // Finalization cleanup retry queue.
    pub exit_cleanup_pending: bool,
    pub exit_cleanup_ids: Vec<i64>,
    pub exit_cleanup_next_s: i64,
    pub exit_cleanup_reason: Option<String>,

    // Dust remainder accepted by the watchdog dust policy.
    pub dust_remainder: bool,
    pub dust_qty_raw: Decimal,

    pub recon: ReconCache,
    /// Position was rebuilt from exchange orders, entry metadata partial.
    pub synced: bool,
}

impl Default for Position {
    fn default() -> Self {
        Self {
            trade_key: String::new(),
            side: Side::Long,
            status: PositionStatus::Pending,
            opened_at: Utc::now(),
            opened_s: 0,
            qty: Decimal::ZERO,
            prices: None,
            entry_actual: None,
            entry_order_id: None,
            client_id: String::new(),
            orders: ExitOrders::default(),
            exit_client_ids: None,
            fills: HashMap::new(),
            tp1_done: false,
            tp2_done: false,
            sl_done: false,
            trail_active: false,
            tp2_synthetic: false,
            tp1_be_pending: false,
            tp1_be_budget: RetryBudget::default(),
            tp1_be_old_sl: None,
            trail_qty: Decimal::ZERO,
            trail_sl_price: None,
            trail_last_update_s: 0,
            trail_pending_cancel_sl: None,
            trail_wait_confirm: false,
            trail_ref_price: None,
            sl_watchdog_first_trigger_s: None,
            sl_watchdog_fired: false,
            sl_watchdog_last_attempt_s: 0,
            sl_watchdog_budget: RetryBudget::default(),
            sl_watchdog_last_error: None,
            tp_wd_last_attempt_s: 0,
            tp1_wd_partial_logged: false,
            tp1_wd_missing_logged: false,
            tp2_wd_missing_logged: false,
            sl_wd_partial_logged: false,
            tp1_status_next_s: 0,
            tp2_status_next_s: 0,
            sl_status_next_s: 0,
            sl_prev_next_cancel_s: 0,
            planb_next_action_s: 0,
            exits_tries: 0,
            exits_next_try_s: 0,
            exits_first_fail_s: 0,
            exit_cleanup_pending: false,
            exit_cleanup_ids: Vec::new(),
            exit_cleanup_next_s: 0,
            exit_cleanup_reason: None,
            dust_remainder: false,
            dust_qty_raw: Decimal::ZERO,
            recon: ReconCache::default(),
            synced: false,
        }
    }
}

/// Idempotent exit client ids, generated once per position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitClientIds {
    pub tp1: String,
    pub tp2: String,
    pub sl: String,
}

impl Position {
    /// Best stop price currently in effect (trailing overrides planned).
    pub fn effective_stop(&self) -> Option<Decimal> {
        self.trail_sl_price.or(self.prices.map(|p| p.sl))
    }

    /// Quantity still held, derived from the exit leg split and flags.
    pub fn remaining_qty(&self) -> Decimal {
        if self.tp2_done {
            return self.orders.qty3;
        }
        if self.tp1_done {
            return self.orders.qty2 + self.orders.qty3;
        }
        self.qty
    }

    /// Break-even stop price: actual fill price when known, planned entry
    /// otherwise.
    pub fn breakeven_price(&self) -> Option<Decimal> {
        self.entry_actual.or(self.prices.map(|p| p.entry))
    }
}

/// Terminal record kept for reporting while the slot is empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LastClosed {
    pub ts: DateTime<Utc>,
    pub trade_key: String,
    pub side: Option<Side>,
    pub reason: String,
    pub entry: Option<Decimal>,
    pub prev_status: Option<PositionStatus>,
}
