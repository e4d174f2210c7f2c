//! Signed REST client for the venue.
//!
//! Requests are signed with HMAC-SHA256 over the canonicalized
//! (key-sorted) query string; the signature timestamp carries the
//! server-time offset measured at startup. Transient transport failures
//! (timeouts, 429/5xx) retry with fixed backoff and fail over across the
//! configured base hosts.

use std::str::FromStr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use peak_common::steps::{fmt_amount, fmt_price, fmt_qty, floor_to_step};
use peak_common::types::OrderSide;
use rust_decimal::Decimal;
use serde::Deserialize;
use sha2::Sha256;
use tracing::{debug, warn};

use crate::config::{BorrowMode, Config, TradeMode};

use super::{DebtSnapshot, ExchangeApi, ExchangeError, OrderInfo, OrderStatus};

type HmacSha256 = Hmac<Sha256>;

const TRANSIENT_STATUSES: &[u16] = &[429, 500, 502, 503, 504];
const RETRY_DELAYS_MS: &[u64] = &[0, 300, 1000, 2000];

/// REST client bound to one symbol and one trade mode.
pub struct BinanceClient {
    http: reqwest::Client,
    base_urls: Vec<String>,
    api_key: String,
    api_secret: String,
    symbol: String,
    trade_mode: TradeMode,
    margin_isolated: bool,
    borrow_mode: BorrowMode,
    auto_repay_at_cancel: bool,
    recv_window_ms: u64,
    tick_size: Decimal,
    qty_step: Decimal,
    /// Server-time minus local-time, measured by `sanity_check`.
    time_offset_ms: AtomicI64,
}

impl BinanceClient {
    pub fn new(config: &Config) -> Result<Self, ExchangeError> {
        if config.exchange.api_key.is_empty() || config.exchange.api_secret.is_empty() {
            return Err(ExchangeError::Auth("API key/secret missing".to_string()));
        }
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .timeout(Duration::from_secs(config.exchange.read_timeout_sec))
            .build()
            .map_err(|e| ExchangeError::Transport(e.to_string()))?;
        Ok(Self {
            http,
            base_urls: config.exchange.base_urls.clone(),
            api_key: config.exchange.api_key.clone(),
            api_secret: config.exchange.api_secret.clone(),
            symbol: config.symbol.clone(),
            trade_mode: config.trade_mode,
            margin_isolated: config.margin.isolated,
            borrow_mode: config.margin.borrow_mode,
            auto_repay_at_cancel: config.margin.auto_repay_at_cancel,
            recv_window_ms: config.exchange.recv_window_ms,
            tick_size: config.sizing.tick_size,
            qty_step: config.sizing.qty_step,
            time_offset_ms: AtomicI64::new(0),
        })
    }

    fn is_margin(&self) -> bool {
        self.trade_mode == TradeMode::Margin
    }

    fn order_endpoint(&self) -> &'static str {
        if self.is_margin() {
            "/sapi/v1/margin/order"
        } else {
            "/api/v3/order"
        }
    }

    fn iso_flag(&self) -> &'static str {
        if self.margin_isolated {
            "TRUE"
        } else {
            "FALSE"
        }
    }

    /// Side-effect flag for margin orders. Manual borrow mode forces
    /// NO_SIDE_EFFECT so the coordinator's explicit borrow is the only one.
    fn side_effect(&self) -> &'static str {
        match self.borrow_mode {
            BorrowMode::Manual => "NO_SIDE_EFFECT",
            BorrowMode::Auto => "AUTO_BORROW_REPAY",
        }
    }

    fn local_ms() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    fn sign(&self, query: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Execute with retry/backoff/failover. Returns the raw body text of
    /// the first non-transient response.
    async fn do_request(
        &self,
        method: reqwest::Method,
        endpoint: &str,
        query: &str,
        signed: bool,
    ) -> Result<String, ExchangeError> {
        let mut last_transient: Option<ExchangeError> = None;

        for base in &self.base_urls {
            for delay_ms in RETRY_DELAYS_MS {
                if *delay_ms > 0 {
                    tokio::time::sleep(Duration::from_millis(*delay_ms)).await;
                }
                let url = format!("{base}{endpoint}?{query}");
                let mut req = self.http.request(method.clone(), &url);
                if signed {
                    req = req.header("X-MBX-APIKEY", &self.api_key);
                }
                let resp = match req.send().await {
                    Ok(r) => r,
                    Err(e) => {
                        last_transient = Some(ExchangeError::Transport(e.to_string()));
                        continue;
                    }
                };
                let status = resp.status().as_u16();
                let body = resp.text().await.unwrap_or_default();

                if TRANSIENT_STATUSES.contains(&status) {
                    debug!(endpoint, status, "transient venue response, retrying");
                    last_transient = Some(if status == 429 {
                        ExchangeError::RateLimited(body.clone())
                    } else {
                        ExchangeError::Http { status, body }
                    });
                    continue;
                }
                if status == 418 {
                    return Err(ExchangeError::RateLimited(body));
                }
                if !(200..300).contains(&status) {
                    return Err(Self::classify_error(status, &body));
                }
                return Ok(body);
            }
        }

        Err(last_transient
            .unwrap_or_else(|| ExchangeError::Transport("retries exhausted".to_string())))
    }

    fn classify_error(status: u16, body: &str) -> ExchangeError {
        #[derive(Deserialize)]
        struct ApiErr {
            code: i64,
            msg: String,
        }
        if let Ok(e) = serde_json::from_str::<ApiErr>(body) {
            if e.code == -1003 {
                return ExchangeError::RateLimited(e.msg);
            }
            return ExchangeError::Api {
                code: e.code,
                msg: e.msg,
            };
        }
        ExchangeError::Http {
            status,
            body: body.to_string(),
        }
    }

    /// Build the canonical sorted query and append the signature.
    fn signed_query(&self, mut params: Vec<(String, String)>) -> String {
        let timestamp = Self::local_ms() + self.time_offset_ms.load(Ordering::Relaxed);
        params.push(("timestamp".to_string(), timestamp.to_string()));
        params.push(("recvWindow".to_string(), self.recv_window_ms.to_string()));
        params.sort_by(|a, b| a.0.cmp(&b.0));
        let query = encode_query(&params);
        let signature = self.sign(&query);
        format!("{query}&signature={signature}")
    }

    async fn signed_request(
        &self,
        method: reqwest::Method,
        endpoint: &str,
        params: Vec<(String, String)>,
    ) -> Result<String, ExchangeError> {
        let query = self.signed_query(params);
        self.do_request(method, endpoint, &query, true).await
    }

    async fn public_get(
        &self,
        endpoint: &str,
        params: Vec<(String, String)>,
    ) -> Result<String, ExchangeError> {
        let query = encode_query(&params);
        self.do_request(reqwest::Method::GET, endpoint, &query, false)
            .await
    }

    fn base_order_params(&self, side: OrderSide, client_id: &str) -> Vec<(String, String)> {
        let mut params = vec![
            ("symbol".to_string(), self.symbol.clone()),
            ("side".to_string(), side.as_str().to_string()),
            ("newOrderRespType".to_string(), "FULL".to_string()),
            ("newClientOrderId".to_string(), client_id.to_string()),
        ];
        if self.is_margin() {
            params.push(("isIsolated".to_string(), self.iso_flag().to_string()));
            params.push(("sideEffectType".to_string(), self.side_effect().to_string()));
            if self.borrow_mode == BorrowMode::Auto && self.auto_repay_at_cancel {
                params.push(("autoRepayAtCancel".to_string(), "TRUE".to_string()));
            }
        }
        params
    }

    async fn place(&self, params: Vec<(String, String)>) -> Result<OrderInfo, ExchangeError> {
        let body = self
            .signed_request(reqwest::Method::POST, self.order_endpoint(), params)
            .await?;
        parse_order(&body)
    }

    async fn margin_account_raw(&self) -> Result<serde_json::Value, ExchangeError> {
        if !self.is_margin() {
            return Err(ExchangeError::BadResponse(
                "margin account requested in spot mode".to_string(),
            ));
        }
        let (endpoint, params) = if self.margin_isolated {
            (
                "/sapi/v1/margin/isolated/account",
                vec![("symbols".to_string(), self.symbol.clone())],
            )
        } else {
            ("/sapi/v1/margin/account", Vec::new())
        };
        let body = self
            .signed_request(reqwest::Method::GET, endpoint, params)
            .await?;
        serde_json::from_str(&body).map_err(|e| ExchangeError::BadResponse(e.to_string()))
    }

    /// Flatten the margin account payload into per-asset rows.
    fn account_assets(&self, account: &serde_json::Value) -> Vec<serde_json::Value> {
        if !self.margin_isolated {
            return account
                .get("userAssets")
                .and_then(|v| v.as_array())
                .cloned()
                .unwrap_or_default();
        }
        let mut rows = Vec::new();
        if let Some(assets) = account.get("assets").and_then(|v| v.as_array()) {
            for pair in assets {
                for leg in ["baseAsset", "quoteAsset"] {
                    if let Some(row) = pair.get(leg) {
                        rows.push(row.clone());
                    }
                }
            }
        }
        rows
    }

    async fn margin_borrow_repay(
        &self,
        op: &str,
        asset: &str,
        amount: Decimal,
    ) -> Result<(), ExchangeError> {
        let mut params = vec![
            ("asset".to_string(), asset.trim().to_ascii_uppercase()),
            ("amount".to_string(), fmt_amount(amount)),
            ("type".to_string(), op.to_string()),
            ("isIsolated".to_string(), self.iso_flag().to_string()),
        ];
        if self.margin_isolated {
            params.push(("symbol".to_string(), self.symbol.clone()));
        }
        self.signed_request(reqwest::Method::POST, "/sapi/v1/margin/borrow-repay", params)
            .await?;
        Ok(())
    }

    fn asset_field(
        &self,
        account: &serde_json::Value,
        asset: &str,
        field: &str,
    ) -> Option<Decimal> {
        let target = asset.trim().to_ascii_uppercase();
        for row in self.account_assets(account) {
            if row.get("asset").and_then(|v| v.as_str()) == Some(target.as_str()) {
                return row
                    .get(field)
                    .and_then(|v| v.as_str())
                    .and_then(|s| Decimal::from_str(s).ok());
            }
        }
        None
    }
}

fn encode_query(params: &[(String, String)]) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{k}={}", urlencode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

/// Minimal percent-encoding for query values (order params are plain
/// alphanumerics, dots and dashes; anything else is escaped).
fn urlencode(v: &str) -> String {
    let mut out = String::with_capacity(v.len());
    for b in v.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

/// Raw order payload as the venue returns it (quantities as strings).
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawOrder {
    order_id: i64,
    #[serde(default)]
    client_order_id: String,
    #[serde(default)]
    orig_client_order_id: Option<String>,
    #[serde(default)]
    side: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    price: Option<String>,
    #[serde(default)]
    stop_price: Option<String>,
    #[serde(default)]
    orig_qty: Option<String>,
    #[serde(default)]
    executed_qty: Option<String>,
    #[serde(default, alias = "cumulativeQuoteQty")]
    cummulative_quote_qty: Option<String>,
    #[serde(default)]
    update_time: Option<i64>,
    #[serde(default)]
    transact_time: Option<i64>,
}

fn dec_or_zero(s: &Option<String>) -> Decimal {
    s.as_deref()
        .and_then(|v| Decimal::from_str(v).ok())
        .unwrap_or(Decimal::ZERO)
}

fn dec_positive(s: &Option<String>) -> Option<Decimal> {
    s.as_deref()
        .and_then(|v| Decimal::from_str(v).ok())
        .filter(|d| *d > Decimal::ZERO)
}

impl RawOrder {
    fn into_info(self) -> Result<OrderInfo, ExchangeError> {
        let side = match self.side.to_ascii_uppercase().as_str() {
            "BUY" => OrderSide::Buy,
            "SELL" => OrderSide::Sell,
            other => {
                return Err(ExchangeError::BadResponse(format!(
                    "unknown order side {other:?}"
                )))
            }
        };
        let status = OrderStatus::parse(&self.status).unwrap_or(OrderStatus::New);
        let client_order_id = if self.client_order_id.is_empty() {
            self.orig_client_order_id.unwrap_or_default()
        } else {
            self.client_order_id
        };
        Ok(OrderInfo {
            order_id: self.order_id,
            client_order_id,
            side,
            status,
            price: dec_positive(&self.price),
            stop_price: dec_positive(&self.stop_price),
            orig_qty: dec_or_zero(&self.orig_qty),
            executed_qty: dec_or_zero(&self.executed_qty),
            cumulative_quote_qty: dec_or_zero(&self.cummulative_quote_qty),
            update_time_ms: self.update_time.or(self.transact_time).unwrap_or(0),
        })
    }
}

fn parse_order(body: &str) -> Result<OrderInfo, ExchangeError> {
    let raw: RawOrder =
        serde_json::from_str(body).map_err(|e| ExchangeError::BadResponse(e.to_string()))?;
    raw.into_info()
}

#[async_trait]
impl ExchangeApi for BinanceClient {
    async fn place_limit(
        &self,
        side: OrderSide,
        qty: Decimal,
        price: Decimal,
        client_id: &str,
    ) -> Result<OrderInfo, ExchangeError> {
        let mut params = self.base_order_params(side, client_id);
        params.push(("type".to_string(), "LIMIT".to_string()));
        params.push(("timeInForce".to_string(), "GTC".to_string()));
        params.push(("quantity".to_string(), fmt_qty(qty, self.qty_step)));
        params.push(("price".to_string(), fmt_price(price, self.tick_size)));
        self.place(params).await
    }

    async fn place_limit_maker(
        &self,
        side: OrderSide,
        qty: Decimal,
        price: Decimal,
        client_id: &str,
    ) -> Result<OrderInfo, ExchangeError> {
        let mut params = self.base_order_params(side, client_id);
        params.push(("type".to_string(), "LIMIT_MAKER".to_string()));
        params.push(("quantity".to_string(), fmt_qty(qty, self.qty_step)));
        params.push(("price".to_string(), fmt_price(price, self.tick_size)));
        match self.place(params).await {
            Err(e) if e.is_maker_reject() => {
                warn!(client_id, "maker order would match, falling back to LIMIT");
                let fallback_id = format!("{}_GTC", client_id);
                let truncated = &fallback_id[..fallback_id.len().min(36)];
                self.place_limit(side, qty, price, truncated).await
            }
            other => other,
        }
    }

    async fn place_market(
        &self,
        side: OrderSide,
        qty: Decimal,
        client_id: &str,
    ) -> Result<OrderInfo, ExchangeError> {
        let qty_r = floor_to_step(qty, self.qty_step);
        let mut params = self.base_order_params(side, client_id);
        params.push(("type".to_string(), "MARKET".to_string()));
        params.push(("quantity".to_string(), fmt_qty(qty_r, self.qty_step)));
        self.place(params).await
    }

    async fn place_stop_loss_limit(
        &self,
        side: OrderSide,
        qty: Decimal,
        stop_price: Decimal,
        limit_price: Decimal,
        client_id: &str,
    ) -> Result<OrderInfo, ExchangeError> {
        let mut params = self.base_order_params(side, client_id);
        params.push(("type".to_string(), "STOP_LOSS_LIMIT".to_string()));
        params.push(("timeInForce".to_string(), "GTC".to_string()));
        params.push(("quantity".to_string(), fmt_qty(qty, self.qty_step)));
        params.push(("stopPrice".to_string(), fmt_price(stop_price, self.tick_size)));
        params.push(("price".to_string(), fmt_price(limit_price, self.tick_size)));
        self.place(params).await
    }

    async fn cancel(&self, order_id: i64) -> Result<(), ExchangeError> {
        let mut params = vec![
            ("symbol".to_string(), self.symbol.clone()),
            ("orderId".to_string(), order_id.to_string()),
        ];
        if self.is_margin() {
            params.push(("isIsolated".to_string(), self.iso_flag().to_string()));
        }
        self.signed_request(reqwest::Method::DELETE, self.order_endpoint(), params)
            .await?;
        Ok(())
    }

    async fn status(&self, order_id: i64) -> Result<OrderInfo, ExchangeError> {
        let mut params = vec![
            ("symbol".to_string(), self.symbol.clone()),
            ("orderId".to_string(), order_id.to_string()),
        ];
        if self.is_margin() {
            params.push(("isIsolated".to_string(), self.iso_flag().to_string()));
        }
        match self
            .signed_request(reqwest::Method::GET, self.order_endpoint(), params)
            .await
        {
            Ok(body) => parse_order(&body),
            // Known order-absence normalizes to a synthetic MISSING status.
            Err(e) if e.is_unknown_order() => Ok(OrderInfo::missing(order_id)),
            Err(e) => Err(e),
        }
    }

    async fn open_orders(&self) -> Result<Vec<OrderInfo>, ExchangeError> {
        let (endpoint, mut params) = if self.is_margin() {
            (
                "/sapi/v1/margin/openOrders",
                vec![("isIsolated".to_string(), self.iso_flag().to_string())],
            )
        } else {
            ("/api/v3/openOrders", Vec::new())
        };
        params.push(("symbol".to_string(), self.symbol.clone()));
        let body = self
            .signed_request(reqwest::Method::GET, endpoint, params)
            .await?;
        let raw: Vec<RawOrder> =
            serde_json::from_str(&body).map_err(|e| ExchangeError::BadResponse(e.to_string()))?;
        raw.into_iter().map(RawOrder::into_info).collect()
    }

    async fn mid_price(&self) -> Result<Decimal, ExchangeError> {
        let (bid, ask) = self.book_ticker().await?;
        Ok((bid + ask) / Decimal::TWO)
    }

    async fn exec_price(&self, side: OrderSide) -> Result<Decimal, ExchangeError> {
        let (bid, ask) = self.book_ticker().await?;
        Ok(match side {
            OrderSide::Buy => ask,
            OrderSide::Sell => bid,
        })
    }

    async fn margin_borrow(&self, asset: &str, amount: Decimal) -> Result<(), ExchangeError> {
        self.margin_borrow_repay("BORROW", asset, amount).await
    }

    async fn margin_repay(&self, asset: &str, amount: Decimal) -> Result<(), ExchangeError> {
        self.margin_borrow_repay("REPAY", asset, amount).await
    }

    async fn margin_free(&self, asset: &str) -> Result<Decimal, ExchangeError> {
        let account = self.margin_account_raw().await?;
        Ok(self
            .asset_field(&account, asset, "free")
            .unwrap_or(Decimal::ZERO))
    }

    async fn margin_borrowed(&self, asset: &str) -> Result<Decimal, ExchangeError> {
        let account = self.margin_account_raw().await?;
        Ok(self
            .asset_field(&account, asset, "borrowed")
            .unwrap_or(Decimal::ZERO))
    }

    async fn debt_snapshot(&self) -> Result<DebtSnapshot, ExchangeError> {
        let account = self.margin_account_raw().await?;
        let mut liabilities = Vec::new();
        let mut total = Decimal::ZERO;
        for row in self.account_assets(&account) {
            let asset = row
                .get("asset")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            let field = |name: &str| -> Decimal {
                row.get(name)
                    .and_then(|v| v.as_str())
                    .and_then(|s| Decimal::from_str(s).ok())
                    .unwrap_or(Decimal::ZERO)
            };
            let liability = field("borrowed") + field("interest");
            if liability > Decimal::ZERO && !asset.is_empty() {
                liabilities.push((asset, liability));
                total += liability;
            }
        }
        Ok(DebtSnapshot {
            has_debt: !liabilities.is_empty(),
            liabilities,
            total_liability: total,
        })
    }

    async fn base_exposure(&self) -> Result<Option<bool>, ExchangeError> {
        // Determines the exchange-empty condition: any base-asset balance,
        // net position, or debt counts as exposure.
        let base = {
            let s = self.symbol.clone();
            // Longest-quote-suffix split, mirroring config::split_symbol.
            const QUOTES: &[&str] = &["FDUSD", "USDT", "USDC", "BUSD", "TUSD", "BTC", "ETH", "EUR"];
            let mut found = String::new();
            for q in QUOTES {
                if s.ends_with(q) && s.len() > q.len() {
                    found = s[..s.len() - q.len()].to_string();
                    break;
                }
            }
            found
        };
        if base.is_empty() {
            return Ok(None);
        }

        if self.is_margin() {
            let account = self.margin_account_raw().await?;
            let field = |name: &str| self.asset_field(&account, &base, name);
            let Some(free) = field("free") else {
                return Ok(None);
            };
            let locked = field("locked").unwrap_or(Decimal::ZERO);
            let borrowed = field("borrowed").unwrap_or(Decimal::ZERO);
            let interest = field("interest").unwrap_or(Decimal::ZERO);
            let net = field("netAsset").unwrap_or(free + locked - borrowed);
            let eps = self.qty_step;
            let exposed = net.abs() > eps || (free + locked) > eps || (borrowed + interest) > Decimal::ZERO;
            return Ok(Some(exposed));
        }

        let body = self
            .signed_request(reqwest::Method::GET, "/api/v3/account", Vec::new())
            .await?;
        let account: serde_json::Value =
            serde_json::from_str(&body).map_err(|e| ExchangeError::BadResponse(e.to_string()))?;
        let balances = account
            .get("balances")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        for row in balances {
            if row.get("asset").and_then(|v| v.as_str()) == Some(base.as_str()) {
                let get = |name: &str| -> Decimal {
                    row.get(name)
                        .and_then(|v| v.as_str())
                        .and_then(|s| Decimal::from_str(s).ok())
                        .unwrap_or(Decimal::ZERO)
                };
                return Ok(Some(get("free") + get("locked") > self.qty_step));
            }
        }
        Ok(None)
    }

    async fn sanity_check(&self) -> Result<(), ExchangeError> {
        self.public_get("/api/v3/ping", Vec::new()).await?;
        let body = self.public_get("/api/v3/time", Vec::new()).await?;

        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct ServerTime {
            server_time: i64,
        }
        let server: ServerTime =
            serde_json::from_str(&body).map_err(|e| ExchangeError::BadResponse(e.to_string()))?;
        let offset = server.server_time - Self::local_ms();
        self.time_offset_ms.store(offset, Ordering::Relaxed);
        debug!(offset_ms = offset, "server time offset recorded");

        // One signed call per trade mode proves the credentials.
        if self.is_margin() {
            self.margin_account_raw().await?;
        } else {
            self.signed_request(reqwest::Method::GET, "/api/v3/account", Vec::new())
                .await?;
        }
        Ok(())
    }
}

impl BinanceClient {
    async fn book_ticker(&self) -> Result<(Decimal, Decimal), ExchangeError> {
        let body = self
            .public_get(
                "/api/v3/ticker/bookTicker",
                vec![("symbol".to_string(), self.symbol.clone())],
            )
            .await?;
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct BookTicker {
            bid_price: String,
            ask_price: String,
        }
        let ticker: BookTicker =
            serde_json::from_str(&body).map_err(|e| ExchangeError::BadResponse(e.to_string()))?;
        let bid = Decimal::from_str(&ticker.bid_price)
            .map_err(|e| ExchangeError::BadResponse(e.to_string()))?;
        let ask = Decimal::from_str(&ticker.ask_price)
            .map_err(|e| ExchangeError::BadResponse(e.to_string()))?;
        if bid <= Decimal::ZERO || ask <= Decimal::ZERO {
            return Err(ExchangeError::BadResponse("empty book ticker".to_string()));
        }
        Ok((bid, ask))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_parse_order_payload() {
        let body = r#"{
            "orderId": 123456,
            "clientOrderId": "EX_SL_abc",
            "side": "SELL",
            "status": "PARTIALLY_FILLED",
            "price": "94800.00",
            "stopPrice": "94800.00",
            "origQty": "0.00100",
            "executedQty": "0.00040",
            "cummulativeQuoteQty": "37.92",
            "updateTime": 1736800000000
        }"#;
        let info = parse_order(body).unwrap();
        assert_eq!(info.order_id, 123456);
        assert_eq!(info.status, OrderStatus::PartiallyFilled);
        assert_eq!(info.executed_qty, dec!(0.00040));
        assert_eq!(info.stop_price, Some(dec!(94800.00)));
        assert_eq!(info.avg_fill_price(), Some(dec!(94800)));
    }

    #[test]
    fn test_parse_order_alt_quote_field() {
        // Some endpoints spell the quote quantity correctly.
        let body = r#"{
            "orderId": 1,
            "side": "BUY",
            "status": "FILLED",
            "executedQty": "1",
            "cumulativeQuoteQty": "95000"
        }"#;
        let info = parse_order(body).unwrap();
        assert_eq!(info.cumulative_quote_qty, dec!(95000));
    }

    #[test]
    fn test_classify_error_codes() {
        let err = BinanceClient::classify_error(400, r#"{"code":-2010,"msg":"insufficient balance"}"#);
        assert!(err.is_insufficient_balance());
        let err = BinanceClient::classify_error(400, r#"{"code":-1003,"msg":"Too many requests"}"#);
        assert!(err.is_rate_limited());
        let err = BinanceClient::classify_error(500, "oops");
        assert!(matches!(err, ExchangeError::Http { status: 500, .. }));
    }

    #[test]
    fn test_query_encoding_sorted() {
        let params = vec![
            ("symbol".to_string(), "BTCUSDC".to_string()),
            ("side".to_string(), "SELL".to_string()),
        ];
        assert_eq!(encode_query(&params), "symbol=BTCUSDC&side=SELL");
        assert_eq!(urlencode("a b&c"), "a%20b%26c");
    }
}
