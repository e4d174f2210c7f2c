//! Exchange adapter: typed operations over the venue's signed REST API.
//!
//! The adapter boundary normalizes the venue's "no such order" error
//! taxonomy into [`OrderStatus::Missing`] so the watchdog planner can treat
//! missing as a terminal state without inspecting error messages.

pub mod binance;

use async_trait::async_trait;
use peak_common::types::OrderSide;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use binance::BinanceClient;

/// Order status as a closed sum type.
///
/// `Missing` is synthetic: the venue reported the order does not exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    PendingCancel,
    Rejected,
    Expired,
    Missing,
}

impl OrderStatus {
    /// No further executions can happen on this order.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderStatus::Filled
                | OrderStatus::Canceled
                | OrderStatus::Rejected
                | OrderStatus::Expired
                | OrderStatus::Missing
        )
    }

    /// Acceptable outcome of a cancel verification: the order is gone and
    /// did NOT fully fill.
    pub fn is_cancel_terminal(self) -> bool {
        matches!(
            self,
            OrderStatus::Canceled | OrderStatus::Rejected | OrderStatus::Expired | OrderStatus::Missing
        )
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "NEW" => Some(OrderStatus::New),
            "PARTIALLY_FILLED" => Some(OrderStatus::PartiallyFilled),
            "FILLED" => Some(OrderStatus::Filled),
            "CANCELED" => Some(OrderStatus::Canceled),
            "PENDING_CANCEL" => Some(OrderStatus::PendingCancel),
            "REJECTED" => Some(OrderStatus::Rejected),
            "EXPIRED" | "EXPIRED_IN_MATCH" => Some(OrderStatus::Expired),
            "MISSING" => Some(OrderStatus::Missing),
            _ => None,
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OrderStatus::New => "NEW",
            OrderStatus::PartiallyFilled => "PARTIALLY_FILLED",
            OrderStatus::Filled => "FILLED",
            OrderStatus::Canceled => "CANCELED",
            OrderStatus::PendingCancel => "PENDING_CANCEL",
            OrderStatus::Rejected => "REJECTED",
            OrderStatus::Expired => "EXPIRED",
            OrderStatus::Missing => "MISSING",
        };
        f.write_str(s)
    }
}

/// Typed order payload returned by the adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderInfo {
    pub order_id: i64,
    pub client_order_id: String,
    pub side: OrderSide,
    pub status: OrderStatus,
    pub price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub orig_qty: Decimal,
    pub executed_qty: Decimal,
    pub cumulative_quote_qty: Decimal,
    pub update_time_ms: i64,
}

impl OrderInfo {
    /// Synthetic payload for an order the venue does not know.
    pub fn missing(order_id: i64) -> Self {
        Self {
            order_id,
            client_order_id: String::new(),
            side: OrderSide::Sell,
            status: OrderStatus::Missing,
            price: None,
            stop_price: None,
            orig_qty: Decimal::ZERO,
            executed_qty: Decimal::ZERO,
            cumulative_quote_qty: Decimal::ZERO,
            update_time_ms: 0,
        }
    }

    /// Average fill price when the payload carries executions.
    pub fn avg_fill_price(&self) -> Option<Decimal> {
        if self.executed_qty > Decimal::ZERO && self.cumulative_quote_qty > Decimal::ZERO {
            Some(self.cumulative_quote_qty / self.executed_qty)
        } else {
            None
        }
    }
}

/// Margin debt as reported by the venue.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DebtSnapshot {
    pub has_debt: bool,
    /// Asset -> borrowed + interest.
    pub liabilities: Vec<(String, Decimal)>,
    pub total_liability: Decimal,
}

/// Errors surfaced by the exchange adapter.
#[derive(Debug, Error)]
pub enum ExchangeError {
    /// Network-level failure (timeout, connect, DNS).
    #[error("transport error: {0}")]
    Transport(String),

    /// Non-2xx HTTP without a parseable venue error code.
    #[error("http {status}: {body}")]
    Http { status: u16, body: String },

    /// Venue application error with a code.
    #[error("venue error {code}: {msg}")]
    Api { code: i64, msg: String },

    /// Rate limited (HTTP 429/418 or venue code -1003).
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Response body did not parse into the expected shape.
    #[error("bad response: {0}")]
    BadResponse(String),

    /// Credentials missing or rejected.
    #[error("auth error: {0}")]
    Auth(String),
}

impl ExchangeError {
    /// The venue says the order does not exist.
    pub fn is_unknown_order(&self) -> bool {
        match self {
            ExchangeError::Api { code, msg } => {
                matches!(code, -2011 | -2013)
                    || msg.to_ascii_uppercase().contains("UNKNOWN ORDER")
                    || msg.to_ascii_lowercase().contains("order does not exist")
            }
            _ => false,
        }
    }

    /// Insufficient balance: a retry signal for replacement orders while
    /// the old order still holds the quantity.
    pub fn is_insufficient_balance(&self) -> bool {
        matches!(self, ExchangeError::Api { code: -2010, msg } if !msg.to_ascii_lowercase().contains("would immediately match"))
    }

    /// A LIMIT_MAKER order would have immediately matched.
    pub fn is_maker_reject(&self) -> bool {
        match self {
            ExchangeError::Api { code, msg } => {
                *code == -2010 && msg.to_ascii_lowercase().contains("would immediately match")
            }
            _ => false,
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, ExchangeError::RateLimited(_))
            || matches!(self, ExchangeError::Api { code: -1003, .. })
    }
}

/// Typed operations the engine needs from the venue.
///
/// `status` never fails with unknown-order: the adapter returns a payload
/// with [`OrderStatus::Missing`] instead. `cancel` propagates unknown-order
/// as an error; use [`cancel_ignore_unknown`] where gone-is-fine.
#[async_trait]
pub trait ExchangeApi: Send + Sync {
    async fn place_limit(
        &self,
        side: OrderSide,
        qty: Decimal,
        price: Decimal,
        client_id: &str,
    ) -> Result<OrderInfo, ExchangeError>;

    /// LIMIT_MAKER with automatic fallback to LIMIT GTC on maker reject.
    async fn place_limit_maker(
        &self,
        side: OrderSide,
        qty: Decimal,
        price: Decimal,
        client_id: &str,
    ) -> Result<OrderInfo, ExchangeError>;

    async fn place_market(
        &self,
        side: OrderSide,
        qty: Decimal,
        client_id: &str,
    ) -> Result<OrderInfo, ExchangeError>;

    async fn place_stop_loss_limit(
        &self,
        side: OrderSide,
        qty: Decimal,
        stop_price: Decimal,
        limit_price: Decimal,
        client_id: &str,
    ) -> Result<OrderInfo, ExchangeError>;

    async fn cancel(&self, order_id: i64) -> Result<(), ExchangeError>;

    async fn status(&self, order_id: i64) -> Result<OrderInfo, ExchangeError>;

    async fn open_orders(&self) -> Result<Vec<OrderInfo>, ExchangeError>;

    async fn mid_price(&self) -> Result<Decimal, ExchangeError>;

    /// Conservative executable price for entry fallback: ask for BUY,
    /// bid for SELL.
    async fn exec_price(&self, side: OrderSide) -> Result<Decimal, ExchangeError>;

    // Margin operations; spot-mode adapters reject these.
    async fn margin_borrow(&self, asset: &str, amount: Decimal) -> Result<(), ExchangeError>;
    async fn margin_repay(&self, asset: &str, amount: Decimal) -> Result<(), ExchangeError>;
    async fn margin_free(&self, asset: &str) -> Result<Decimal, ExchangeError>;
    async fn margin_borrowed(&self, asset: &str) -> Result<Decimal, ExchangeError>;
    async fn debt_snapshot(&self) -> Result<DebtSnapshot, ExchangeError>;

    /// Whether the venue shows any base-asset exposure (position or debt).
    /// `None` means undeterminable.
    async fn base_exposure(&self) -> Result<Option<bool>, ExchangeError>;

    /// Connectivity + auth check; records server-time drift.
    async fn sanity_check(&self) -> Result<(), ExchangeError>;
}

/// Cancel an order, treating "unknown order" as success.
pub async fn cancel_ignore_unknown(
    api: &dyn ExchangeApi,
    order_id: i64,
) -> Result<(), ExchangeError> {
    match api.cancel(order_id).await {
        Ok(()) => Ok(()),
        Err(e) if e.is_unknown_order() => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        assert!(OrderStatus::Filled.is_terminal());
        assert!(OrderStatus::Missing.is_terminal());
        assert!(!OrderStatus::New.is_terminal());
        assert!(!OrderStatus::PartiallyFilled.is_terminal());
    }

    #[test]
    fn test_cancel_terminal_excludes_filled() {
        assert!(OrderStatus::Canceled.is_cancel_terminal());
        assert!(OrderStatus::Missing.is_cancel_terminal());
        assert!(!OrderStatus::Filled.is_cancel_terminal());
        assert!(!OrderStatus::PartiallyFilled.is_cancel_terminal());
    }

    #[test]
    fn test_status_parse() {
        assert_eq!(OrderStatus::parse("filled"), Some(OrderStatus::Filled));
        assert_eq!(
            OrderStatus::parse("PARTIALLY_FILLED"),
            Some(OrderStatus::PartiallyFilled)
        );
        assert_eq!(OrderStatus::parse("???"), None);
    }

    #[test]
    fn test_unknown_order_classification() {
        let err = ExchangeError::Api {
            code: -2013,
            msg: "Order does not exist.".to_string(),
        };
        assert!(err.is_unknown_order());
        let err = ExchangeError::Api {
            code: -2011,
            msg: "Unknown order sent.".to_string(),
        };
        assert!(err.is_unknown_order());
        let err = ExchangeError::Api {
            code: -1021,
            msg: "Timestamp outside recvWindow".to_string(),
        };
        assert!(!err.is_unknown_order());
    }

    #[test]
    fn test_insufficient_balance_vs_maker_reject() {
        let balance = ExchangeError::Api {
            code: -2010,
            msg: "Account has insufficient balance for requested action.".to_string(),
        };
        assert!(balance.is_insufficient_balance());
        assert!(!balance.is_maker_reject());

        let maker = ExchangeError::Api {
            code: -2010,
            msg: "Order would immediately match and take.".to_string(),
        };
        assert!(maker.is_maker_reject());
        assert!(!maker.is_insufficient_balance());
    }
}
