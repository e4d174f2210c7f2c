//! Shared test fixtures: a scripted mock exchange and engine builders.

// Each integration binary uses a different subset of these helpers.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use peak_common::types::OrderSide;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use peak_executor::config::Config;
use peak_executor::engine::Engine;
use peak_executor::exchange::{
    DebtSnapshot, ExchangeApi, ExchangeError, OrderInfo, OrderStatus,
};
use peak_executor::state::ExecState;

/// A market order the engine sent, for assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarketCall {
    pub side: OrderSide,
    pub qty: Decimal,
    pub client_id: String,
}

#[derive(Default)]
struct Inner {
    next_id: i64,
    orders: HashMap<i64, OrderInfo>,
    /// Scripted status responses, consumed per call, keyed by order id.
    status_scripts: HashMap<i64, VecDeque<OrderInfo>>,
    /// Scripted failures for upcoming stop-loss-limit placements.
    stop_place_failures: VecDeque<ExchangeError>,
    mid: Decimal,
    base_exposure: Option<bool>,
    debt: DebtSnapshot,
    market_calls: Vec<MarketCall>,
    stop_placements: Vec<(Decimal, Decimal, String)>,
    borrows: Vec<(String, Decimal)>,
    repays: Vec<(String, Decimal)>,
    margin_free: Decimal,
    margin_borrowed: Decimal,
}

/// Scripted in-memory exchange double.
pub struct MockExchange {
    inner: Mutex<Inner>,
}

impl MockExchange {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                next_id: 1,
                mid: dec!(95000),
                base_exposure: Some(false),
                margin_free: dec!(1000000),
                ..Inner::default()
            }),
        })
    }

    fn place(
        &self,
        side: OrderSide,
        qty: Decimal,
        price: Option<Decimal>,
        stop_price: Option<Decimal>,
        status: OrderStatus,
        client_id: &str,
    ) -> OrderInfo {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_id;
        inner.next_id += 1;
        let executed = if status == OrderStatus::Filled {
            qty
        } else {
            Decimal::ZERO
        };
        let info = OrderInfo {
            order_id: id,
            client_order_id: client_id.to_string(),
            side,
            status,
            price,
            stop_price,
            orig_qty: qty,
            executed_qty: executed,
            cumulative_quote_qty: executed * inner.mid,
            update_time_ms: 0,
        };
        inner.orders.insert(id, info.clone());
        info
    }

    /// Mark a resting order fully filled.
    pub fn fill(&self, order_id: i64) {
        let mut inner = self.inner.lock().unwrap();
        let mid = inner.mid;
        let order = inner.orders.get_mut(&order_id).expect("order exists");
        order.status = OrderStatus::Filled;
        order.executed_qty = order.orig_qty;
        order.cumulative_quote_qty = order.orig_qty * order.price.unwrap_or(mid);
    }

    /// Overwrite a stored order's status.
    pub fn set_status(&self, order_id: i64, status: OrderStatus, executed: Decimal) {
        let mut inner = self.inner.lock().unwrap();
        let order = inner.orders.get_mut(&order_id).expect("order exists");
        order.status = status;
        order.executed_qty = executed;
    }

    /// Seed an order that "exists on the venue" without going through a
    /// place call (pre-restart state).
    pub fn seed_order(&self, info: OrderInfo) {
        let mut inner = self.inner.lock().unwrap();
        inner.next_id = inner.next_id.max(info.order_id + 1);
        inner.orders.insert(info.order_id, info);
    }

    /// Queue explicit status responses for an order; `status()` consumes
    /// them in order before falling back to stored state.
    pub fn script_status(&self, order_id: i64, responses: Vec<OrderInfo>) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .status_scripts
            .entry(order_id)
            .or_default()
            .extend(responses);
    }

    /// Fail the next `n` stop-loss-limit placements with the given error.
    pub fn fail_next_stop_placements(&self, n: usize, make: impl Fn() -> ExchangeError) {
        let mut inner = self.inner.lock().unwrap();
        for _ in 0..n {
            inner.stop_place_failures.push_back(make());
        }
    }

    pub fn set_mid(&self, mid: Decimal) {
        self.inner.lock().unwrap().mid = mid;
    }

    pub fn set_base_exposure(&self, exposure: Option<bool>) {
        self.inner.lock().unwrap().base_exposure = exposure;
    }

    pub fn set_debt(&self, debt: DebtSnapshot) {
        self.inner.lock().unwrap().debt = debt;
    }

    pub fn order(&self, order_id: i64) -> OrderInfo {
        self.inner.lock().unwrap().orders[&order_id].clone()
    }

    pub fn market_calls(&self) -> Vec<MarketCall> {
        self.inner.lock().unwrap().market_calls.clone()
    }

    pub fn stop_placements(&self) -> Vec<(Decimal, Decimal, String)> {
        self.inner.lock().unwrap().stop_placements.clone()
    }

    pub fn repays(&self) -> Vec<(String, Decimal)> {
        self.inner.lock().unwrap().repays.clone()
    }

    pub fn last_order_id(&self) -> i64 {
        self.inner.lock().unwrap().next_id - 1
    }
}

#[async_trait]
impl ExchangeApi for MockExchange {
    async fn place_limit(
        &self,
        side: OrderSide,
        qty: Decimal,
        price: Decimal,
        client_id: &str,
    ) -> Result<OrderInfo, ExchangeError> {
        Ok(self.place(side, qty, Some(price), None, OrderStatus::New, client_id))
    }

    async fn place_limit_maker(
        &self,
        side: OrderSide,
        qty: Decimal,
        price: Decimal,
        client_id: &str,
    ) -> Result<OrderInfo, ExchangeError> {
        Ok(self.place(side, qty, Some(price), None, OrderStatus::New, client_id))
    }

    async fn place_market(
        &self,
        side: OrderSide,
        qty: Decimal,
        client_id: &str,
    ) -> Result<OrderInfo, ExchangeError> {
        let info = self.place(side, qty, None, None, OrderStatus::Filled, client_id);
        self.inner.lock().unwrap().market_calls.push(MarketCall {
            side,
            qty,
            client_id: client_id.to_string(),
        });
        Ok(info)
    }

    async fn place_stop_loss_limit(
        &self,
        side: OrderSide,
        qty: Decimal,
        stop_price: Decimal,
        limit_price: Decimal,
        client_id: &str,
    ) -> Result<OrderInfo, ExchangeError> {
        if let Some(err) = self.inner.lock().unwrap().stop_place_failures.pop_front() {
            return Err(err);
        }
        let info = self.place(
            side,
            qty,
            Some(limit_price),
            Some(stop_price),
            OrderStatus::New,
            client_id,
        );
        self.inner
            .lock()
            .unwrap()
            .stop_placements
            .push((stop_price, qty, client_id.to_string()));
        Ok(info)
    }

    async fn cancel(&self, order_id: i64) -> Result<(), ExchangeError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.orders.get_mut(&order_id) {
            Some(order) if !order.status.is_terminal() => {
                order.status = OrderStatus::Canceled;
                Ok(())
            }
            Some(_) => Err(ExchangeError::Api {
                code: -2011,
                msg: "Unknown order sent.".to_string(),
            }),
            None => Err(ExchangeError::Api {
                code: -2013,
                msg: "Order does not exist.".to_string(),
            }),
        }
    }

    async fn status(&self, order_id: i64) -> Result<OrderInfo, ExchangeError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(script) = inner.status_scripts.get_mut(&order_id) {
            if let Some(info) = script.pop_front() {
                return Ok(info);
            }
        }
        Ok(inner
            .orders
            .get(&order_id)
            .cloned()
            .unwrap_or_else(|| OrderInfo::missing(order_id)))
    }

    async fn open_orders(&self) -> Result<Vec<OrderInfo>, ExchangeError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .orders
            .values()
            .filter(|o| !o.status.is_terminal())
            .cloned()
            .collect())
    }

    async fn mid_price(&self) -> Result<Decimal, ExchangeError> {
        Ok(self.inner.lock().unwrap().mid)
    }

    async fn exec_price(&self, _side: OrderSide) -> Result<Decimal, ExchangeError> {
        Ok(self.inner.lock().unwrap().mid)
    }

    async fn margin_borrow(&self, asset: &str, amount: Decimal) -> Result<(), ExchangeError> {
        let mut inner = self.inner.lock().unwrap();
        inner.margin_borrowed += amount;
        inner.borrows.push((asset.to_string(), amount));
        Ok(())
    }

    async fn margin_repay(&self, asset: &str, amount: Decimal) -> Result<(), ExchangeError> {
        let mut inner = self.inner.lock().unwrap();
        inner.margin_borrowed -= amount;
        inner.repays.push((asset.to_string(), amount));
        Ok(())
    }

    async fn margin_free(&self, _asset: &str) -> Result<Decimal, ExchangeError> {
        Ok(self.inner.lock().unwrap().margin_free)
    }

    async fn margin_borrowed(&self, _asset: &str) -> Result<Decimal, ExchangeError> {
        Ok(self.inner.lock().unwrap().margin_borrowed)
    }

    async fn debt_snapshot(&self) -> Result<DebtSnapshot, ExchangeError> {
        Ok(self.inner.lock().unwrap().debt.clone())
    }

    async fn base_exposure(&self) -> Result<Option<bool>, ExchangeError> {
        Ok(self.inner.lock().unwrap().base_exposure)
    }

    async fn sanity_check(&self) -> Result<(), ExchangeError> {
        Ok(())
    }
}

/// Bar CSV v2 content with a confirmed swing low around 95050 and a swing
/// high around 95350 (radius 2 fractals on both sides).
pub fn write_bar_csv(path: &std::path::Path) {
    let header = peak_executor::trail::CSV_V2_HEADER;
    let mut rows = String::from(header);
    rows.push('\n');
    let lows = [
        "95150", "95100", "95050", "95100", "95150", "95200", "95250",
    ];
    let his = [
        "95250", "95300", "95350", "95300", "95250", "95220", "95210",
    ];
    for (i, (low, hi)) in lows.iter().zip(his.iter()).enumerate() {
        rows.push_str(&format!(
            "2025-01-13T19:5{i}:00Z,10,1.5,0.15,0.7,0.8,95200,95200,{hi},{low}\n"
        ));
    }
    std::fs::write(path, rows).unwrap();
}

/// Engine over a temp directory and the mock exchange.
pub fn build_engine(dir: &std::path::Path, api: Arc<MockExchange>, st: ExecState) -> Engine {
    let mut config = Config::default();
    config.paths.state_file = dir.join("state/executor_state.json");
    config.paths.event_log = dir.join("logs/executor.log");
    config.paths.detector_meta_file = dir.join("state/detector_meta.json");
    config.paths.signal_log = dir.join("logs/signals.log");
    config.paths.bar_csv = dir.join("feed/aggregated.csv");
    std::fs::create_dir_all(dir.join("feed")).unwrap();
    write_bar_csv(&config.paths.bar_csv);
    Engine::with_state(config, api, st)
}

/// Actions (the `action` field) from the engine's event log, in order.
pub fn event_actions(engine: &Engine) -> Vec<String> {
    std::fs::read_to_string(&engine.config.paths.event_log)
        .unwrap_or_default()
        .lines()
        .filter_map(|l| serde_json::from_str::<serde_json::Value>(l).ok())
        .filter_map(|v| v["action"].as_str().map(|s| s.to_string()))
        .collect()
}

/// True if `needle` appears in `haystack` as an ordered subsequence.
pub fn is_subsequence(haystack: &[String], needle: &[&str]) -> bool {
    let mut it = haystack.iter();
    needle.iter().all(|n| it.any(|h| h == n))
}
