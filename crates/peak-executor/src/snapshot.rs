//! Throttled exchange snapshots.
//!
//! Two caches with freshness metadata: the open-orders list and the
//! book-ticker mid price. They cache ONLY those endpoints; order status
//! polls and margin debt checks always bypass them.
//!
//! The refresh stamp advances even on failure so a broken endpoint is not
//! hammered every tick.

use rust_decimal::Decimal;

use crate::exchange::{ExchangeApi, OrderInfo};

/// Cached open-orders list with an update timestamp.
#[derive(Debug, Default)]
pub struct OpenOrdersSnapshot {
    pub ts_updated_s: i64,
    pub ok: bool,
    pub error: Option<String>,
    pub source: String,
    orders: Vec<OrderInfo>,
}

impl OpenOrdersSnapshot {
    pub fn age_s(&self, now_s: i64) -> i64 {
        if self.ts_updated_s <= 0 {
            i64::MAX
        } else {
            now_s - self.ts_updated_s
        }
    }

    pub fn is_fresh(&self, now_s: i64, max_age_sec: i64) -> bool {
        self.age_s(now_s) < max_age_sec
    }

    pub fn orders(&self) -> &[OrderInfo] {
        &self.orders
    }

    pub fn contains(&self, order_id: i64) -> bool {
        self.orders.iter().any(|o| o.order_id == order_id)
    }

    pub fn find(&self, order_id: i64) -> Option<&OrderInfo> {
        self.orders.iter().find(|o| o.order_id == order_id)
    }

    /// Refresh unless still fresh. Returns true if a refresh ran.
    pub async fn refresh(
        &mut self,
        api: &dyn ExchangeApi,
        source: &str,
        now_s: i64,
        min_interval_sec: i64,
    ) -> bool {
        if min_interval_sec > 0 && self.is_fresh(now_s, min_interval_sec) {
            return false;
        }
        self.ts_updated_s = now_s;
        self.source = source.to_string();
        match api.open_orders().await {
            Ok(orders) => {
                self.orders = orders;
                self.ok = true;
                self.error = None;
            }
            Err(e) => {
                self.orders.clear();
                self.ok = false;
                self.error = Some(e.to_string());
            }
        }
        true
    }

    /// Install an externally fetched list (reconciliation reuses its own
    /// open-orders call to warm the cache).
    pub fn install(&mut self, orders: Vec<OrderInfo>, source: &str, now_s: i64) {
        self.ts_updated_s = now_s;
        self.source = source.to_string();
        self.orders = orders;
        self.ok = true;
        self.error = None;
    }
}

/// Cached mid price from the book ticker.
#[derive(Debug, Default)]
pub struct MidPriceSnapshot {
    pub ts_updated_s: i64,
    pub ok: bool,
    pub error: Option<String>,
    pub source: String,
    pub mid: Decimal,
}

impl MidPriceSnapshot {
    pub fn age_s(&self, now_s: i64) -> i64 {
        if self.ts_updated_s <= 0 {
            i64::MAX
        } else {
            now_s - self.ts_updated_s
        }
    }

    pub fn is_fresh(&self, now_s: i64, max_age_sec: i64) -> bool {
        self.age_s(now_s) < max_age_sec
    }

    /// Usable price, if the last refresh succeeded.
    pub fn price(&self) -> Option<Decimal> {
        if self.ok && self.mid > Decimal::ZERO {
            Some(self.mid)
        } else {
            None
        }
    }

    pub async fn refresh(
        &mut self,
        api: &dyn ExchangeApi,
        source: &str,
        now_s: i64,
        min_interval_sec: i64,
    ) -> bool {
        if min_interval_sec > 0 && self.is_fresh(now_s, min_interval_sec) {
            return false;
        }
        self.ts_updated_s = now_s;
        self.source = source.to_string();
        match api.mid_price().await {
            Ok(mid) => {
                self.mid = mid;
                self.ok = true;
                self.error = None;
            }
            Err(e) => {
                self.mid = Decimal::ZERO;
                self.ok = false;
                self.error = Some(e.to_string());
            }
        }
        true
    }
}
