//! Margin borrow/repay coordination.
//!
//! Two modes: *exchange-managed* (`BorrowMode::Auto`) where the hooks are
//! no-ops and every order carries the auto-borrow/repay side-effect flag,
//! and *explicit* (`BorrowMode::Manual`) where the hooks borrow and repay
//! directly and orders carry no side effect. Mixed modes are refused at
//! config validation.

use std::collections::HashMap;

use peak_common::steps::{fmt_price, fmt_qty};
use peak_common::types::Side;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tracing::warn;

use crate::config::{BorrowMode, Config, TradeMode};
use crate::exchange::{ExchangeApi, ExchangeError};

/// Per-trade borrow bookkeeping persisted in the main state document.
///
/// Every key in `borrowed_by_trade` must appear in `repaid_trade_keys` by
/// the time its position reaches CLOSED, or the no-debt invariant fails.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MarginLedger {
    /// trade_key -> asset -> borrowed amount.
    pub borrowed_by_trade: HashMap<String, HashMap<String, Decimal>>,
    pub repaid_trade_keys: Vec<String>,
    pub active_trade_key: Option<String>,
}

impl MarginLedger {
    pub fn has_outstanding(&self) -> bool {
        self.borrowed_by_trade
            .values()
            .any(|assets| assets.values().any(|amt| *amt > Decimal::ZERO))
    }

    fn record_borrow(&mut self, trade_key: &str, asset: &str, amount: Decimal) {
        let per = self
            .borrowed_by_trade
            .entry(trade_key.to_string())
            .or_default();
        *per.entry(asset.to_string()).or_insert(Decimal::ZERO) += amount;
        self.active_trade_key = Some(trade_key.to_string());
    }
}

/// Amount that must be available before the entry order goes out.
///
/// Computed from the *formatted* order price and quantity (what will
/// actually be sent) plus a fee buffer; the un-rounded values understate
/// the notional the venue checks.
pub fn required_for_entry(
    config: &Config,
    side: Side,
    qty: Decimal,
    price: Decimal,
) -> (String, Decimal) {
    let (base, quote) = config.split_symbol();
    let qty_f = Decimal::from_str(&fmt_qty(qty, config.sizing.qty_step)).unwrap_or(qty);
    let price_f = Decimal::from_str(&fmt_price(price, config.sizing.tick_size)).unwrap_or(price);
    let buffer = Decimal::ONE + config.margin.borrow_buffer_pct;
    match side {
        // Long buys base with quote: the quote notional must be on hand.
        Side::Long => (quote, qty_f * price_f * buffer),
        // Short sells borrowed base.
        Side::Short => (base, qty_f * buffer),
    }
}

/// Startup hook: validates the margin configuration.
pub fn on_startup(config: &Config) -> Result<(), String> {
    if config.trade_mode != TradeMode::Margin {
        return Ok(());
    }
    let (_, quote) = config.split_symbol();
    if quote.is_empty() {
        return Err(format!(
            "cannot split symbol {} into base/quote for margin borrow sizing",
            config.symbol
        ));
    }
    Ok(())
}

/// Before-entry hook: ensure the borrow for this trade is in place.
///
/// No-op in spot mode and in exchange-managed borrow mode.
pub async fn on_before_entry(
    ledger: &mut MarginLedger,
    api: &dyn ExchangeApi,
    config: &Config,
    side: Side,
    qty: Decimal,
    price: Decimal,
    trade_key: &str,
) -> Result<(), ExchangeError> {
    if config.trade_mode != TradeMode::Margin || config.margin.borrow_mode == BorrowMode::Auto {
        return Ok(());
    }
    if ledger.borrowed_by_trade.contains_key(trade_key) {
        return Ok(());
    }

    let (asset, needed) = required_for_entry(config, side, qty, price);
    if needed <= Decimal::ZERO {
        return Ok(());
    }
    let free = api.margin_free(&asset).await?;
    if free >= needed {
        return Ok(());
    }
    let shortfall = needed - free;
    api.margin_borrow(&asset, shortfall).await?;
    ledger.record_borrow(trade_key, &asset, shortfall);
    Ok(())
}

/// After-entry hook: records the trade key as the active borrower.
pub fn on_after_entry_opened(ledger: &mut MarginLedger, config: &Config, trade_key: &str) {
    if config.trade_mode != TradeMode::Margin {
        return;
    }
    if ledger.borrowed_by_trade.contains_key(trade_key) {
        ledger.active_trade_key = Some(trade_key.to_string());
    }
}

/// After-close hook: repay outstanding borrow for the trade, once.
///
/// Repays `min(tracked, outstanding)` per asset so a partial external
/// repayment never triggers an over-repay rejection.
pub async fn on_after_position_closed(
    ledger: &mut MarginLedger,
    api: &dyn ExchangeApi,
    config: &Config,
    trade_key: Option<&str>,
) -> Result<(), ExchangeError> {
    if config.trade_mode != TradeMode::Margin || config.margin.borrow_mode == BorrowMode::Auto {
        return Ok(());
    }
    let Some(key) = trade_key
        .map(|k| k.to_string())
        .or_else(|| ledger.active_trade_key.clone())
    else {
        return Ok(());
    };
    if ledger.repaid_trade_keys.contains(&key) {
        return Ok(());
    }
    let Some(tracked) = ledger.borrowed_by_trade.get(&key).cloned() else {
        return Ok(());
    };

    let mut remaining: HashMap<String, Decimal> = HashMap::new();
    for (asset, amount) in tracked {
        if amount <= Decimal::ZERO {
            continue;
        }
        let outstanding = api.margin_borrowed(&asset).await?;
        let repay = amount.min(outstanding);
        if repay > Decimal::ZERO {
            api.margin_repay(&asset, repay).await?;
        }
        let left = amount - repay;
        if left > Decimal::ZERO {
            warn!(asset, %left, trade_key = %key, "borrow not fully repaid");
            remaining.insert(asset, left);
        }
    }

    if remaining.is_empty() {
        ledger.borrowed_by_trade.remove(&key);
        ledger.repaid_trade_keys.push(key.clone());
        if ledger.active_trade_key.as_deref() == Some(key.as_str()) {
            ledger.active_trade_key = None;
        }
    } else {
        ledger.borrowed_by_trade.insert(key, remaining);
    }
    Ok(())
}
