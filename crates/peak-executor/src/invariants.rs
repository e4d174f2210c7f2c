//! Read-only anomaly detectors.
//!
//! Thirteen invariants over the persisted state and the throttled
//! snapshots. Detectors only log events and emit alerts; they never
//! mutate position state or place orders, and they swallow their own I/O
//! errors so a broken detector cannot amplify a trading failure.
//!
//! Alert throttling is per `(invariant_id, position_key)`; the throttle
//! stamps persist in a separate metadata file so they do not pollute the
//! main state document.

use std::collections::VecDeque;

use rust_decimal::Decimal;
use serde_json::json;
use tracing::debug;

use crate::config::{BorrowMode, Config, TradeMode, TrailSource};
use crate::exchange::ExchangeApi;
use crate::notify::Notifier;
use crate::state::{DetectorMeta, ExecState, JsonStore};
use crate::types::{Position, PositionStatus};

/// Alert severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Warn,
    Error,
}

impl Severity {
    fn as_str(self) -> &'static str {
        match self {
            Severity::Warn => "WARN",
            Severity::Error => "ERROR",
        }
    }
}

/// Outcome of a detector pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Ok,
    /// I13 with kill-on-debt: the operator asked the process to halt.
    Halt,
}

/// Detector engine: owns the throttle metadata and the rate-limit window.
pub struct InvariantEngine {
    meta: DetectorMeta,
    meta_store: JsonStore,
    /// Recent rate-limit error timestamps (I10 window).
    rate_limit_hits: VecDeque<i64>,
}

impl InvariantEngine {
    pub fn new(config: &Config) -> Self {
        let meta_store = JsonStore::new(config.paths.detector_meta_file.clone());
        let meta = meta_store.load().unwrap_or_default();
        Self {
            meta,
            meta_store,
            rate_limit_hits: VecDeque::new(),
        }
    }

    /// Called by the engine whenever an adapter call came back rate-limited.
    pub fn record_rate_limit(&mut self, now_s: i64) {
        self.rate_limit_hits.push_back(now_s);
    }

    fn position_key(config: &Config, pos: Option<&Position>) -> String {
        match pos {
            Some(p) => format!("{}:{}:{}", config.symbol, p.side, p.trade_key),
            None => config.symbol.clone(),
        }
    }

    /// Throttled emit; persists the stamp best-effort.
    #[allow(clippy::too_many_arguments)]
    async fn emit(
        &mut self,
        config: &Config,
        notifier: &Notifier,
        st: &ExecState,
        inv_id: &str,
        severity: Severity,
        message: &str,
        details: serde_json::Value,
        now_s: i64,
    ) {
        let key = format!("{inv_id}:{}", Self::position_key(config, st.position.as_ref()));
        let last = self.meta.last_emit_s.get(&key).copied().unwrap_or(0);
        if now_s - last < config.invariants.throttle_sec {
            return;
        }
        self.meta.last_emit_s.insert(key, now_s);
        if let Err(e) = self.meta_store.save(&self.meta) {
            debug!(error = %e, "detector meta save failed");
        }

        notifier.event(
            "INVARIANT_FAIL",
            json!({
                "invariant_id": inv_id,
                "severity": severity.as_str(),
                "msg": message,
                "details": details,
            }),
        );
        notifier
            .webhook(json!({
                "event": "INVARIANT_FAIL",
                "symbol": config.symbol,
                "invariant_id": inv_id,
                "severity": severity.as_str(),
                "message": message,
                "details": details,
                "action": "RECOMMEND_ONLY",
            }))
            .await;
    }

    /// Run every detector. Returns `Halt` only for I13 with kill enabled.
    pub async fn run(
        &mut self,
        config: &Config,
        notifier: &Notifier,
        api: &dyn ExchangeApi,
        st: &ExecState,
        now_s: i64,
    ) -> Verdict {
        if !config.invariants.enabled {
            return Verdict::Ok;
        }

        self.check_i1(config, notifier, st, now_s).await;
        self.check_i2(config, notifier, st, now_s).await;
        self.check_i3(config, notifier, st, now_s).await;
        self.check_i4(config, notifier, st, now_s).await;
        self.check_i5(config, notifier, st, now_s).await;
        self.check_i6(config, notifier, st, now_s).await;
        self.check_i7(config, notifier, st, now_s).await;
        self.check_i8(config, notifier, st, now_s).await;
        self.check_i9(config, notifier, st, now_s).await;
        self.check_i10(config, notifier, st, now_s).await;
        self.check_i11(config, notifier, st, now_s).await;
        self.check_i12(config, notifier, st, now_s).await;
        self.check_i13(config, notifier, api, st, now_s).await
    }

    fn age_severity(config: &Config, pos: &Position, now_s: i64) -> Severity {
        let age = if pos.opened_s > 0 {
            now_s - pos.opened_s
        } else {
            i64::MAX
        };
        if age < config.invariants.grace_sec {
            Severity::Warn
        } else {
            Severity::Error
        }
    }

    /// I1: protection present. Once OPEN_FILLED, a stop order must exist.
    async fn check_i1(&mut self, config: &Config, notifier: &Notifier, st: &ExecState, now_s: i64) {
        let Some(pos) = st.position.as_ref() else {
            return;
        };
        // OPEN also requires a stop unless a replacement is in flight.
        let wants_stop = matches!(pos.status, PositionStatus::Open | PositionStatus::OpenFilled);
        if !wants_stop || pos.sl_done {
            return;
        }
        let replacing = pos.tp1_be_pending || pos.trail_pending_cancel_sl.is_some();
        if pos.orders.sl.is_some() || replacing {
            return;
        }
        if pos.status == PositionStatus::OpenFilled && pos.orders.tp1.is_none() {
            // Exits not placed at all yet; I7 covers that with its grace.
            return;
        }
        let sev = Self::age_severity(config, pos, now_s);
        self.emit(
            config,
            notifier,
            st,
            "I1",
            sev,
            "position without stop-loss protection",
            json!({ "status": format!("{:?}", pos.status), "exits_tries": pos.exits_tries }),
            now_s,
        )
        .await;
    }

    /// I2: price hierarchy with minimum tick separation.
    async fn check_i2(&mut self, config: &Config, notifier: &Notifier, st: &ExecState, now_s: i64) {
        let Some(pos) = st.position.as_ref() else {
            return;
        };
        let Some(p) = pos.prices else {
            return;
        };
        let tick = config.sizing.tick_size;
        let ok = match pos.side {
            peak_common::types::Side::Long => p.sl < p.entry && p.entry < p.tp1 && p.tp1 < p.tp2,
            peak_common::types::Side::Short => p.tp2 < p.tp1 && p.tp1 < p.entry && p.entry < p.sl,
        };
        let separated = (p.entry - p.sl).abs() >= tick
            && (p.tp1 - p.entry).abs() >= tick
            && (p.tp2 - p.tp1).abs() >= tick;
        if ok && separated {
            return;
        }
        self.emit(
            config,
            notifier,
            st,
            "I2",
            Severity::Error,
            "exit price hierarchy invalid",
            json!({
                "side": pos.side.to_string(),
                "entry": p.entry, "sl": p.sl, "tp1": p.tp1, "tp2": p.tp2,
            }),
            now_s,
        )
        .await;
    }

    /// I3: leg quantities sum to the total in step units.
    async fn check_i3(&mut self, config: &Config, notifier: &Notifier, st: &ExecState, now_s: i64) {
        let Some(pos) = st.position.as_ref() else {
            return;
        };
        let o = &pos.orders;
        if pos.qty <= Decimal::ZERO || o.qty1 <= Decimal::ZERO || o.qty2 <= Decimal::ZERO {
            return;
        }
        let sum = o.qty1 + o.qty2 + o.qty3;
        if (sum - pos.qty).abs() <= config.sizing.qty_step {
            return;
        }
        self.emit(
            config,
            notifier,
            st,
            "I3",
            Severity::Error,
            "exit leg quantity sum mismatch",
            json!({ "qty_total": pos.qty, "qty1": o.qty1, "qty2": o.qty2, "qty3": o.qty3, "sum": sum }),
            now_s,
        )
        .await;
    }

    /// I4: entry state completeness while PENDING.
    async fn check_i4(&mut self, config: &Config, notifier: &Notifier, st: &ExecState, now_s: i64) {
        let Some(pos) = st.position.as_ref() else {
            return;
        };
        if pos.status != PositionStatus::Pending || pos.synced {
            return;
        }
        let mut missing = Vec::new();
        if pos.entry_order_id.is_none() {
            missing.push("entry_order_id");
        }
        if pos.client_id.is_empty() {
            missing.push("client_id");
        }
        if pos.qty <= Decimal::ZERO {
            missing.push("qty");
        }
        if pos.prices.is_none() {
            missing.push("prices");
        }
        if missing.is_empty() {
            return;
        }
        self.emit(
            config,
            notifier,
            st,
            "I4",
            Severity::Error,
            "entry state missing required fields",
            json!({ "missing": missing }),
            now_s,
        )
        .await;
    }

    /// I5: trailing coherence. Active trailing has a stop and a qty.
    async fn check_i5(&mut self, config: &Config, notifier: &Notifier, st: &ExecState, now_s: i64) {
        let Some(pos) = st.position.as_ref() else {
            return;
        };
        if !pos.trail_active {
            return;
        }
        if pos.trail_qty <= Decimal::ZERO {
            self.emit(
                config,
                notifier,
                st,
                "I5",
                Severity::Error,
                "trailing active with non-positive quantity",
                json!({ "trail_qty": pos.trail_qty }),
                now_s,
            )
            .await;
            return;
        }
        if pos.trail_pending_cancel_sl.is_none()
            && pos.orders.sl.is_none()
            && pos.trail_sl_price.is_none()
        {
            self.emit(
                config,
                notifier,
                st,
                "I5",
                Severity::Warn,
                "trailing active without stop or pending cancel",
                json!({}),
                now_s,
            )
            .await;
        }
    }

    /// I6: trailing feed freshness.
    async fn check_i6(&mut self, config: &Config, notifier: &Notifier, st: &ExecState, now_s: i64) {
        let Some(pos) = st.position.as_ref() else {
            return;
        };
        if !pos.trail_active || config.trail.source != TrailSource::Agg {
            return;
        }
        let age = match std::fs::metadata(&config.paths.bar_csv)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| t.elapsed().ok())
        {
            Some(elapsed) => elapsed.as_secs() as i64,
            None => {
                self.emit(
                    config,
                    notifier,
                    st,
                    "I6",
                    Severity::Warn,
                    "trailing feed file not accessible",
                    json!({ "path": config.paths.bar_csv }),
                    now_s,
                )
                .await;
                return;
            }
        };
        if age > config.invariants.feed_stale_sec {
            self.emit(
                config,
                notifier,
                st,
                "I6",
                Severity::Warn,
                "trailing feed file stale",
                json!({ "age_s": age, "stale_sec": config.invariants.feed_stale_sec }),
                now_s,
            )
            .await;
        }
    }

    /// I7: TP orders exist after fill.
    async fn check_i7(&mut self, config: &Config, notifier: &Notifier, st: &ExecState, now_s: i64) {
        let Some(pos) = st.position.as_ref() else {
            return;
        };
        if pos.status != PositionStatus::OpenFilled || pos.trail_active {
            return;
        }
        if pos.orders.tp1.is_some() && pos.orders.tp2.is_some() {
            return;
        }
        let sev = Self::age_severity(config, pos, now_s);
        self.emit(
            config,
            notifier,
            st,
            "I7",
            sev,
            "entry filled without take-profit orders",
            json!({ "tp1": pos.orders.tp1, "tp2": pos.orders.tp2, "exits_tries": pos.exits_tries }),
            now_s,
        )
        .await;
    }

    /// I8: live position state shape (prices present once open).
    async fn check_i8(&mut self, config: &Config, notifier: &Notifier, st: &ExecState, now_s: i64) {
        let Some(pos) = st.position.as_ref() else {
            return;
        };
        if !matches!(
            pos.status,
            PositionStatus::Open | PositionStatus::OpenFilled
        ) {
            return;
        }
        if pos.prices.is_some() {
            return;
        }
        let sev = Self::age_severity(config, pos, now_s);
        self.emit(
            config,
            notifier,
            st,
            "I8",
            sev,
            "live position missing exit prices",
            json!({ "status": format!("{:?}", pos.status), "synced": pos.synced }),
            now_s,
        )
        .await;
    }

    /// I9: trailing update timestamps advance.
    async fn check_i9(&mut self, config: &Config, notifier: &Notifier, st: &ExecState, now_s: i64) {
        let Some(pos) = st.position.as_ref() else {
            return;
        };
        if !pos.trail_active || pos.trail_last_update_s <= 0 {
            return;
        }
        let stale_after = config.trail.update_every_sec * 5 + config.invariants.grace_sec;
        let age = now_s - pos.trail_last_update_s;
        if age <= stale_after {
            return;
        }
        self.emit(
            config,
            notifier,
            st,
            "I9",
            Severity::Warn,
            "trailing maintenance has stopped advancing",
            json!({ "age_s": age, "expected_every_s": config.trail.update_every_sec }),
            now_s,
        )
        .await;
    }

    /// I10: repeated rate-limit errors from the adapter.
    async fn check_i10(&mut self, config: &Config, notifier: &Notifier, st: &ExecState, now_s: i64) {
        let window = config.invariants.rate_limit_window_sec;
        while let Some(front) = self.rate_limit_hits.front() {
            if now_s - front > window {
                self.rate_limit_hits.pop_front();
            } else {
                break;
            }
        }
        let hits = self.rate_limit_hits.len();
        if hits < config.invariants.rate_limit_threshold {
            return;
        }
        self.emit(
            config,
            notifier,
            st,
            "I10",
            Severity::Warn,
            "repeated rate-limit responses from the venue",
            json!({ "hits": hits, "window_sec": window }),
            now_s,
        )
        .await;
    }

    /// I11: margin-mode configuration coherence.
    async fn check_i11(&mut self, config: &Config, notifier: &Notifier, st: &ExecState, now_s: i64) {
        if config.trade_mode != TradeMode::Margin {
            return;
        }
        if config.margin.borrow_mode == BorrowMode::Manual && config.margin.auto_repay_at_cancel {
            self.emit(
                config,
                notifier,
                st,
                "I11",
                Severity::Error,
                "mixed margin modes: manual borrow with auto-repay side effect",
                json!({}),
                now_s,
            )
            .await;
        }
    }

    /// I12: dedup set bounded and fingerprinted.
    async fn check_i12(&mut self, config: &Config, notifier: &Notifier, st: &ExecState, now_s: i64) {
        let over = st.meta.seen_keys.len() > config.dedup.seen_keys_max * 2;
        let unfingerprinted = !st.meta.seen_keys.is_empty() && st.meta.dedup_fp.is_empty();
        if !over && !unfingerprinted {
            return;
        }
        self.emit(
            config,
            notifier,
            st,
            "I12",
            Severity::Warn,
            "dedup set unbounded or missing fingerprint",
            json!({ "len": st.meta.seen_keys.len(), "max": config.dedup.seen_keys_max }),
            now_s,
        )
        .await;
    }

    /// I13: post-close debt. After the position closes, the exchange
    /// debt snapshot must be empty. WARN inside the grace window,
    /// escalates to ERROR, optionally halts the process.
    async fn check_i13(
        &mut self,
        config: &Config,
        notifier: &Notifier,
        api: &dyn ExchangeApi,
        st: &ExecState,
        now_s: i64,
    ) -> Verdict {
        if config.trade_mode != TradeMode::Margin {
            return Verdict::Ok;
        }
        if st.position.is_some() || st.last_closed.is_none() {
            self.meta.i13_first_debt_s = None;
            return Verdict::Ok;
        }
        // Direct venue call, deliberately outside the snapshot caches,
        // throttled on its own stamp.
        if now_s - self.meta.i13_last_check_s < config.invariants.i13_grace_sec.max(60) {
            return Verdict::Ok;
        }
        self.meta.i13_last_check_s = now_s;
        let snapshot = match api.debt_snapshot().await {
            Ok(s) => s,
            // Detectors must not amplify failures.
            Err(e) => {
                debug!(error = %e, "I13 debt snapshot failed");
                return Verdict::Ok;
            }
        };
        if !snapshot.has_debt || snapshot.total_liability <= config.margin.debt_eps {
            self.meta.i13_first_debt_s = None;
            let _ = self.meta_store.save(&self.meta);
            return Verdict::Ok;
        }

        let first = *self.meta.i13_first_debt_s.get_or_insert(now_s);
        let elapsed = now_s - first;
        let severity = if elapsed >= config.invariants.i13_escalate_sec {
            Severity::Error
        } else {
            Severity::Warn
        };
        self.emit(
            config,
            notifier,
            st,
            "I13",
            severity,
            "margin debt outstanding after position close",
            json!({
                "total_liability": snapshot.total_liability,
                "liabilities": snapshot.liabilities,
                "elapsed_s": elapsed,
            }),
            now_s,
        )
        .await;

        if config.invariants.i13_kill_on_debt && severity == Severity::Error {
            return Verdict::Halt;
        }
        Verdict::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ExitPrices;
    use rust_decimal_macros::dec;

    fn test_config(dir: &std::path::Path) -> Config {
        let mut config = Config::default();
        config.paths.detector_meta_file = dir.join("detector_meta.json");
        config.paths.event_log = dir.join("executor.log");
        config.invariants.throttle_sec = 600;
        config
    }

    fn read_events(config: &Config) -> Vec<serde_json::Value> {
        std::fs::read_to_string(&config.paths.event_log)
            .unwrap_or_default()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    struct NoApi;

    #[async_trait::async_trait]
    impl ExchangeApi for NoApi {
        async fn place_limit(
            &self,
            _: peak_common::types::OrderSide,
            _: Decimal,
            _: Decimal,
            _: &str,
        ) -> Result<crate::exchange::OrderInfo, crate::exchange::ExchangeError> {
            unreachable!("detectors never trade")
        }
        async fn place_limit_maker(
            &self,
            _: peak_common::types::OrderSide,
            _: Decimal,
            _: Decimal,
            _: &str,
        ) -> Result<crate::exchange::OrderInfo, crate::exchange::ExchangeError> {
            unreachable!("detectors never trade")
        }
        async fn place_market(
            &self,
            _: peak_common::types::OrderSide,
            _: Decimal,
            _: &str,
        ) -> Result<crate::exchange::OrderInfo, crate::exchange::ExchangeError> {
            unreachable!("detectors never trade")
        }
        async fn place_stop_loss_limit(
            &self,
            _: peak_common::types::OrderSide,
            _: Decimal,
            _: Decimal,
            _: Decimal,
            _: &str,
        ) -> Result<crate::exchange::OrderInfo, crate::exchange::ExchangeError> {
            unreachable!("detectors never trade")
        }
        async fn cancel(&self, _: i64) -> Result<(), crate::exchange::ExchangeError> {
            unreachable!("detectors never trade")
        }
        async fn status(
            &self,
            id: i64,
        ) -> Result<crate::exchange::OrderInfo, crate::exchange::ExchangeError> {
            Ok(crate::exchange::OrderInfo::missing(id))
        }
        async fn open_orders(
            &self,
        ) -> Result<Vec<crate::exchange::OrderInfo>, crate::exchange::ExchangeError> {
            Ok(Vec::new())
        }
        async fn mid_price(&self) -> Result<Decimal, crate::exchange::ExchangeError> {
            Ok(Decimal::ZERO)
        }
        async fn exec_price(
            &self,
            _: peak_common::types::OrderSide,
        ) -> Result<Decimal, crate::exchange::ExchangeError> {
            Ok(Decimal::ZERO)
        }
        async fn margin_borrow(&self, _: &str, _: Decimal) -> Result<(), crate::exchange::ExchangeError> {
            Ok(())
        }
        async fn margin_repay(&self, _: &str, _: Decimal) -> Result<(), crate::exchange::ExchangeError> {
            Ok(())
        }
        async fn margin_free(&self, _: &str) -> Result<Decimal, crate::exchange::ExchangeError> {
            Ok(Decimal::ZERO)
        }
        async fn margin_borrowed(&self, _: &str) -> Result<Decimal, crate::exchange::ExchangeError> {
            Ok(Decimal::ZERO)
        }
        async fn debt_snapshot(
            &self,
        ) -> Result<crate::exchange::DebtSnapshot, crate::exchange::ExchangeError> {
            Ok(crate::exchange::DebtSnapshot::default())
        }
        async fn base_exposure(&self) -> Result<Option<bool>, crate::exchange::ExchangeError> {
            Ok(None)
        }
        async fn sanity_check(&self) -> Result<(), crate::exchange::ExchangeError> {
            Ok(())
        }
    }

    fn bad_hierarchy_state() -> ExecState {
        let mut st = ExecState::default();
        st.position = Some(Position {
            status: PositionStatus::Open,
            qty: dec!(0.001),
            prices: Some(ExitPrices {
                entry: dec!(95000),
                sl: dec!(95100), // stop above entry on a LONG
                tp1: dec!(95200),
                tp2: dec!(95400),
            }),
            ..Position::default()
        });
        st
    }

    #[tokio::test]
    async fn test_i2_fires_on_bad_hierarchy_and_throttles() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let notifier = Notifier::new(&config);
        let mut engine = InvariantEngine::new(&config);
        let st = bad_hierarchy_state();

        engine.run(&config, &notifier, &NoApi, &st, 1000).await;
        engine.run(&config, &notifier, &NoApi, &st, 1010).await;

        let events = read_events(&config);
        let i2: Vec<_> = events
            .iter()
            .filter(|e| e["invariant_id"] == "I2")
            .collect();
        // Throttled: a single emission despite two passes.
        assert_eq!(i2.len(), 1);
        assert_eq!(i2[0]["severity"], "ERROR");
    }

    #[tokio::test]
    async fn test_detectors_quiet_on_empty_state() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let notifier = Notifier::new(&config);
        let mut engine = InvariantEngine::new(&config);
        let verdict = engine
            .run(&config, &notifier, &NoApi, &ExecState::default(), 1000)
            .await;
        assert_eq!(verdict, Verdict::Ok);
        assert!(read_events(&config).is_empty());
    }

    #[tokio::test]
    async fn test_i10_requires_threshold_in_window() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let notifier = Notifier::new(&config);
        let mut engine = InvariantEngine::new(&config);

        for i in 0..4 {
            engine.record_rate_limit(1000 + i);
        }
        engine
            .run(&config, &notifier, &NoApi, &ExecState::default(), 1010)
            .await;
        assert!(read_events(&config).is_empty());

        engine.record_rate_limit(1011);
        engine
            .run(&config, &notifier, &NoApi, &ExecState::default(), 1012)
            .await;
        let events = read_events(&config);
        assert!(events.iter().any(|e| e["invariant_id"] == "I10"));
    }

    #[tokio::test]
    async fn test_i3_sum_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let notifier = Notifier::new(&config);
        let mut engine = InvariantEngine::new(&config);

        let mut st = ExecState::default();
        let mut pos = Position {
            status: PositionStatus::Open,
            qty: dec!(0.00100),
            ..Position::default()
        };
        pos.orders.qty1 = dec!(0.00033);
        pos.orders.qty2 = dec!(0.00033);
        pos.orders.qty3 = dec!(0.00010); // short by 0.00024
        st.position = Some(pos);

        engine.run(&config, &notifier, &NoApi, &st, 1000).await;
        let events = read_events(&config);
        assert!(events.iter().any(|e| e["invariant_id"] == "I3"));
    }
}
