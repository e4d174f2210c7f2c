//! Configuration for the execution engine.
//!
//! Supports loading from a TOML file with environment variable overrides
//! for every key (flat `SCREAMING_SNAKE` names), plus a handful of CLI
//! overrides. Credentials only ever come from the environment.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use rust_decimal::Decimal;
use serde::Deserialize;

/// Trading account mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeMode {
    Spot,
    Margin,
}

impl TradeMode {
    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "spot" => Some(TradeMode::Spot),
            "margin" => Some(TradeMode::Margin),
            _ => None,
        }
    }
}

impl std::fmt::Display for TradeMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TradeMode::Spot => write!(f, "spot"),
            TradeMode::Margin => write!(f, "margin"),
        }
    }
}

/// How the entry order is placed, and what happens on timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryMode {
    /// LIMIT only; timeout aborts the entry.
    LimitOnly,
    /// LIMIT first; timeout falls back to MARKET behind the Plan B guard.
    LimitThenMarket,
    /// MARKET immediately.
    MarketOnly,
}

impl EntryMode {
    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "LIMIT_ONLY" => Some(EntryMode::LimitOnly),
            "LIMIT_THEN_MARKET" => Some(EntryMode::LimitThenMarket),
            "MARKET_ONLY" => Some(EntryMode::MarketOnly),
            _ => None,
        }
    }
}

/// Margin borrow coordination mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BorrowMode {
    /// Exchange-managed: order side effects auto-borrow/auto-repay.
    Auto,
    /// Explicit: the margin coordinator borrows and repays directly.
    Manual,
}

/// Trailing price source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TrailSource {
    /// Aggregated bar CSV swings (no exchange polling).
    Agg,
    /// Book-ticker mid price fallback.
    Book,
}

/// File-system paths the engine reads and writes.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Append-only PEAK signal log (read, tail-only).
    pub signal_log: PathBuf,
    /// Normalized bar feed CSV v2 (read, tail-only).
    pub bar_csv: PathBuf,
    /// Main state document (atomic replace).
    pub state_file: PathBuf,
    /// Executor event log (append-then-cap).
    pub event_log: PathBuf,
    /// Detector throttle metadata (separate from the main state).
    pub detector_meta_file: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            signal_log: "/data/logs/signals.log".into(),
            bar_csv: "/data/feed/aggregated.csv".into(),
            state_file: "/data/state/executor_state.json".into(),
            event_log: "/data/logs/executor.log".into(),
            detector_meta_file: "/data/state/detector_meta.json".into(),
        }
    }
}

impl PathsConfig {
    /// Directory holding the state file; flag files live beside it.
    pub fn state_dir(&self) -> PathBuf {
        self.state_file
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn emergency_flag(&self) -> PathBuf {
        self.state_dir().join("emergency_shutdown.flag")
    }

    pub fn wake_flag(&self) -> PathBuf {
        self.state_dir().join("wake_up.flag")
    }

    pub fn emergency_backup(&self) -> PathBuf {
        self.state_dir().join("emergency_backup.json")
    }
}

/// Instrument sizing parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SizingConfig {
    /// Target entry notional in quote units.
    pub qty_usd: Decimal,
    /// Exchange lot step.
    pub qty_step: Decimal,
    /// Exchange price tick.
    pub tick_size: Decimal,
    /// Exchange minimum order quantity.
    pub min_qty: Decimal,
    /// Exchange minimum order notional.
    pub min_notional: Decimal,
}

impl Default for SizingConfig {
    fn default() -> Self {
        Self {
            qty_usd: Decimal::new(100, 0),
            qty_step: Decimal::new(1, 5),
            tick_size: Decimal::new(1, 2),
            min_qty: Decimal::new(1, 5),
            min_notional: Decimal::new(5, 0),
        }
    }
}

/// Entry placement parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EntryConfig {
    /// Offset added above (long) / below (short) the signal close.
    pub offset_usd: Decimal,
    pub mode: EntryMode,
    /// Seconds before a resting LIMIT entry is timed out.
    pub timeout_sec: i64,
    /// Plan B deviation cap in quote units (0 disables the USD cap).
    ///
    /// The allowed deviation is `max(risk * planb_max_dev_r_mult,
    /// planb_max_dev_usd)` when this is > 0, else the R-multiple bound
    /// alone.
    pub planb_max_dev_usd: Decimal,
    /// Plan B deviation cap as a multiple of entry risk.
    pub planb_max_dev_r_mult: Decimal,
    /// Abort Plan B when no executable price can be read.
    pub planb_require_price: bool,
    /// Abort Plan B when price has already passed TP1.
    pub planb_abort_if_past_tp1: bool,
}

impl Default for EntryConfig {
    fn default() -> Self {
        Self {
            offset_usd: Decimal::new(5, 1),
            mode: EntryMode::LimitThenMarket,
            timeout_sec: 90,
            planb_max_dev_usd: Decimal::ZERO,
            planb_max_dev_r_mult: Decimal::new(25, 2),
            planb_require_price: true,
            planb_abort_if_past_tp1: true,
        }
    }
}

/// Stop/TP construction parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    /// Percentage stop fallback (fraction of entry, e.g. 0.002).
    pub sl_pct: Decimal,
    /// Take-profit R-multiples; the first two become TP1/TP2.
    pub tp_r_list: Vec<Decimal>,
    /// Swing lookback window (bars) for the far stop.
    pub swing_mins: usize,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            sl_pct: Decimal::new(2, 3),
            tp_r_list: vec![Decimal::ONE, Decimal::TWO],
            swing_mins: 180,
        }
    }
}

/// Tick-loop cadence and watchdog tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ManageConfig {
    /// Main loop sleep.
    pub poll_sec: u64,
    /// Throttle for individual order status polls.
    pub status_poll_every_sec: i64,
    /// Throttle for the position management pass.
    pub manage_every_sec: i64,
    /// Entry block after a close.
    pub cooldown_sec: i64,
    /// Duplicate-open lock right after an entry is placed.
    pub lock_sec: i64,
    pub exits_retry_every_sec: i64,
    pub failsafe_exits_max_tries: u32,
    pub failsafe_exits_grace_sec: i64,
    pub failsafe_flatten: bool,
    /// Grace before the stop watchdog market fallback fires.
    pub sl_watchdog_grace_sec: i64,
    /// Retry spacing for watchdog market attempts.
    pub sl_watchdog_retry_sec: i64,
    /// Break-even replacement retry budget.
    pub tp1_be_max_attempts: u32,
    /// Cooldown once the break-even budget is exhausted.
    pub tp1_be_cooldown_sec: i64,
    /// Retry spacing for finalization cleanup cancels.
    pub close_cleanup_retry_sec: i64,
    /// Re-cancel spacing for an orphaned previous stop.
    pub orphan_cancel_every_sec: i64,
    /// Gap (ticks) between a stop trigger and its limit price.
    pub sl_limit_gap_ticks: u32,
    /// Open-orders snapshot min refresh interval.
    pub snapshot_min_sec: i64,
    /// Mid-price snapshot min refresh interval.
    pub price_snapshot_min_sec: i64,
    /// Reconciliation throttle outside boot/manual triggers.
    pub sync_throttle_sec: i64,
    /// Max age for a recon-cache order status to count as fresh.
    pub sl_recon_fresh_sec: i64,
    /// Hard cap on cancel-replace attempts per transition family.
    pub replace_max_attempts: u32,
    /// Cooldown once a replace attempt cap is reached.
    pub replace_cooldown_sec: i64,
}

impl Default for ManageConfig {
    fn default() -> Self {
        Self {
            poll_sec: 5,
            status_poll_every_sec: 10,
            manage_every_sec: 5,
            cooldown_sec: 180,
            lock_sec: 15,
            exits_retry_every_sec: 15,
            failsafe_exits_max_tries: 5,
            failsafe_exits_grace_sec: 60,
            failsafe_flatten: false,
            sl_watchdog_grace_sec: 3,
            sl_watchdog_retry_sec: 5,
            tp1_be_max_attempts: 5,
            tp1_be_cooldown_sec: 3600,
            close_cleanup_retry_sec: 5,
            orphan_cancel_every_sec: 30,
            sl_limit_gap_ticks: 2,
            snapshot_min_sec: 5,
            price_snapshot_min_sec: 2,
            sync_throttle_sec: 300,
            sl_recon_fresh_sec: 30,
            replace_max_attempts: 5,
            replace_cooldown_sec: 3600,
        }
    }
}

/// Trailing stop parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrailConfig {
    pub source: TrailSource,
    pub activate_after_tp2: bool,
    pub update_every_sec: i64,
    /// Minimum favorable move before the stop is replaced.
    pub step_usd: Decimal,
    /// Rows of bar history scanned for swings.
    pub swing_lookback: usize,
    /// Fractal radius (strict neighbors on each side).
    pub swing_lr: usize,
    pub swing_buffer_usd: Decimal,
    /// Bar-close confirmation buffer; 0 disables confirmation.
    pub confirm_buffer_usd: Decimal,
}

impl Default for TrailConfig {
    fn default() -> Self {
        Self {
            source: TrailSource::Agg,
            activate_after_tp2: true,
            update_every_sec: 20,
            step_usd: Decimal::new(20, 0),
            swing_lookback: 240,
            swing_lr: 2,
            swing_buffer_usd: Decimal::new(15, 0),
            confirm_buffer_usd: Decimal::ZERO,
        }
    }
}

/// Margin account parameters (ignored in spot mode).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MarginConfig {
    pub isolated: bool,
    pub borrow_mode: BorrowMode,
    /// Fee buffer applied to explicit borrow amounts (fraction).
    pub borrow_buffer_pct: Decimal,
    pub auto_repay_at_cancel: bool,
    /// Liabilities at or below this are treated as no debt.
    pub debt_eps: Decimal,
}

impl Default for MarginConfig {
    fn default() -> Self {
        Self {
            isolated: false,
            borrow_mode: BorrowMode::Manual,
            borrow_buffer_pct: Decimal::new(3, 3),
            auto_repay_at_cancel: false,
            debt_eps: Decimal::ZERO,
        }
    }
}

/// Detector tuning (read-only invariants).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InvariantConfig {
    pub enabled: bool,
    pub every_sec: i64,
    pub throttle_sec: i64,
    pub grace_sec: i64,
    pub feed_stale_sec: i64,
    pub i13_grace_sec: i64,
    pub i13_escalate_sec: i64,
    pub i13_kill_on_debt: bool,
    /// I10 window and threshold for repeated rate-limit errors.
    pub rate_limit_window_sec: i64,
    pub rate_limit_threshold: usize,
}

impl Default for InvariantConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            every_sec: 20,
            throttle_sec: 600,
            grace_sec: 15,
            feed_stale_sec: 180,
            i13_grace_sec: 300,
            i13_escalate_sec: 180,
            i13_kill_on_debt: false,
            rate_limit_window_sec: 300,
            rate_limit_threshold: 5,
        }
    }
}

/// Signal dedup tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    pub price_decimals: u32,
    pub seen_keys_max: usize,
    /// Only accept events whose `source` field matches `expect_source`.
    pub strict_source: bool,
    pub expect_source: String,
    pub tail_lines: usize,
    /// Skip PEAKs older than this (0 disables the filter).
    pub max_peak_age_sec: i64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            price_decimals: 1,
            seen_keys_max: 500,
            strict_source: true,
            expect_source: "DeltaScout".to_string(),
            tail_lines: 300,
            max_peak_age_sec: 600,
        }
    }
}

/// Webhook alerting (best-effort).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    pub url: String,
    pub basic_auth_user: String,
    pub basic_auth_password: String,
}

/// Exchange transport settings. Credentials come from the environment only.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    pub base_urls: Vec<String>,
    #[serde(skip)]
    pub api_key: String,
    #[serde(skip)]
    pub api_secret: String,
    pub recv_window_ms: u64,
    pub read_timeout_sec: u64,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            base_urls: vec![
                "https://api.binance.com".to_string(),
                "https://api1.binance.com".to_string(),
                "https://api2.binance.com".to_string(),
                "https://api3.binance.com".to_string(),
            ],
            api_key: String::new(),
            api_secret: String::new(),
            recv_window_ms: 5000,
            read_timeout_sec: 15,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Instrument id, e.g. "BTCUSDC".
    pub symbol: String,
    pub trade_mode: TradeMode,
    pub log_level: String,
    /// Event log cap (append-then-cap rotation).
    pub log_max_lines: usize,
    pub paths: PathsConfig,
    pub sizing: SizingConfig,
    pub entry: EntryConfig,
    pub risk: RiskConfig,
    pub manage: ManageConfig,
    pub trail: TrailConfig,
    pub margin: MarginConfig,
    pub invariants: InvariantConfig,
    pub dedup: DedupConfig,
    pub webhook: WebhookConfig,
    pub exchange: ExchangeConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            symbol: "BTCUSDC".to_string(),
            trade_mode: TradeMode::Spot,
            log_level: "info".to_string(),
            log_max_lines: 200,
            paths: PathsConfig::default(),
            sizing: SizingConfig::default(),
            entry: EntryConfig::default(),
            risk: RiskConfig::default(),
            manage: ManageConfig::default(),
            trail: TrailConfig::default(),
            margin: MarginConfig::default(),
            invariants: InvariantConfig::default(),
            dedup: DedupConfig::default(),
            webhook: WebhookConfig::default(),
            exchange: ExchangeConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {path:?}"))?;
        let config: Config =
            toml::from_str(&raw).with_context(|| format!("failed to parse config {path:?}"))?;
        Ok(config)
    }

    /// Apply flat environment variable overrides.
    ///
    /// Every behavioral key has a `SCREAMING_SNAKE` env name; credentials
    /// are only ever read here.
    pub fn apply_env_overrides(&mut self) {
        env_str("SYMBOL", |v| self.symbol = v.to_ascii_uppercase());
        if let Ok(v) = std::env::var("TRADE_MODE") {
            if let Some(mode) = TradeMode::parse(&v) {
                self.trade_mode = mode;
            }
        }
        env_str("LOG_LEVEL", |v| self.log_level = v);
        env_parse("LOG_MAX_LINES", &mut self.log_max_lines);

        env_path("SIGNAL_LOG", &mut self.paths.signal_log);
        env_path("AGG_CSV", &mut self.paths.bar_csv);
        env_path("STATE_FN", &mut self.paths.state_file);
        env_path("EXEC_LOG", &mut self.paths.event_log);
        env_path("DETECTOR_META_FN", &mut self.paths.detector_meta_file);

        env_dec("QTY_USD", &mut self.sizing.qty_usd);
        env_dec("QTY_STEP", &mut self.sizing.qty_step);
        env_dec("TICK_SIZE", &mut self.sizing.tick_size);
        env_dec("MIN_QTY", &mut self.sizing.min_qty);
        env_dec("MIN_NOTIONAL", &mut self.sizing.min_notional);

        env_dec("ENTRY_OFFSET_USD", &mut self.entry.offset_usd);
        if let Ok(v) = std::env::var("ENTRY_MODE") {
            if let Some(mode) = EntryMode::parse(&v) {
                self.entry.mode = mode;
            }
        }
        env_parse("LIVE_ENTRY_TIMEOUT_SEC", &mut self.entry.timeout_sec);
        env_dec("PLANB_MAX_DEV_USD", &mut self.entry.planb_max_dev_usd);
        env_dec("PLANB_MAX_DEV_R_MULT", &mut self.entry.planb_max_dev_r_mult);
        env_bool("PLANB_REQUIRE_PRICE", &mut self.entry.planb_require_price);
        env_bool(
            "PLANB_ABORT_IF_PAST_TP1",
            &mut self.entry.planb_abort_if_past_tp1,
        );

        env_dec("SL_PCT", &mut self.risk.sl_pct);
        if let Ok(v) = std::env::var("TP_R_LIST") {
            let parsed: Vec<Decimal> = v
                .split(',')
                .filter_map(|s| Decimal::from_str(s.trim()).ok())
                .collect();
            if parsed.len() >= 2 {
                self.risk.tp_r_list = parsed;
            }
        }
        env_parse("SWING_MINS", &mut self.risk.swing_mins);

        env_parse("POLL_SEC", &mut self.manage.poll_sec);
        env_parse(
            "LIVE_STATUS_POLL_EVERY",
            &mut self.manage.status_poll_every_sec,
        );
        env_parse("MANAGE_EVERY_SEC", &mut self.manage.manage_every_sec);
        env_parse("COOLDOWN_SEC", &mut self.manage.cooldown_sec);
        env_parse("LOCK_SEC", &mut self.manage.lock_sec);
        env_parse(
            "EXITS_RETRY_EVERY_SEC",
            &mut self.manage.exits_retry_every_sec,
        );
        env_parse(
            "FAILSAFE_EXITS_MAX_TRIES",
            &mut self.manage.failsafe_exits_max_tries,
        );
        env_bool("FAILSAFE_FLATTEN", &mut self.manage.failsafe_flatten);
        env_parse(
            "SL_WATCHDOG_GRACE_SEC",
            &mut self.manage.sl_watchdog_grace_sec,
        );
        env_parse(
            "SL_WATCHDOG_RETRY_SEC",
            &mut self.manage.sl_watchdog_retry_sec,
        );
        env_parse("TP1_BE_MAX_ATTEMPTS", &mut self.manage.tp1_be_max_attempts);
        env_parse("TP1_BE_COOLDOWN_SEC", &mut self.manage.tp1_be_cooldown_sec);
        env_parse(
            "CLOSE_CLEANUP_RETRY_SEC",
            &mut self.manage.close_cleanup_retry_sec,
        );
        env_parse(
            "ORPHAN_CANCEL_EVERY_SEC",
            &mut self.manage.orphan_cancel_every_sec,
        );
        env_parse("SL_LIMIT_GAP_TICKS", &mut self.manage.sl_limit_gap_ticks);
        env_parse("SNAPSHOT_MIN_SEC", &mut self.manage.snapshot_min_sec);
        env_parse(
            "PRICE_SNAPSHOT_MIN_SEC",
            &mut self.manage.price_snapshot_min_sec,
        );
        env_parse(
            "SYNC_BINANCE_THROTTLE_SEC",
            &mut self.manage.sync_throttle_sec,
        );
        env_parse("SL_RECON_FRESH_SEC", &mut self.manage.sl_recon_fresh_sec);

        if let Ok(v) = std::env::var("TRAIL_SOURCE") {
            match v.trim().to_ascii_uppercase().as_str() {
                "AGG" => self.trail.source = TrailSource::Agg,
                "BOOK" | "BINANCE" => self.trail.source = TrailSource::Book,
                _ => {}
            }
        }
        env_bool(
            "TRAIL_ACTIVATE_AFTER_TP2",
            &mut self.trail.activate_after_tp2,
        );
        env_parse("TRAIL_UPDATE_EVERY_SEC", &mut self.trail.update_every_sec);
        env_dec("TRAIL_STEP_USD", &mut self.trail.step_usd);
        env_parse("TRAIL_SWING_LOOKBACK", &mut self.trail.swing_lookback);
        env_parse("TRAIL_SWING_LR", &mut self.trail.swing_lr);
        env_dec("TRAIL_SWING_BUFFER_USD", &mut self.trail.swing_buffer_usd);
        env_dec(
            "TRAIL_CONFIRM_BUFFER_USD",
            &mut self.trail.confirm_buffer_usd,
        );

        env_bool("MARGIN_ISOLATED", &mut self.margin.isolated);
        if let Ok(v) = std::env::var("MARGIN_BORROW_MODE") {
            match v.trim().to_ascii_lowercase().as_str() {
                "auto" => self.margin.borrow_mode = BorrowMode::Auto,
                "manual" => self.margin.borrow_mode = BorrowMode::Manual,
                _ => {}
            }
        }
        env_dec(
            "MARGIN_BORROW_BUFFER_PCT",
            &mut self.margin.borrow_buffer_pct,
        );
        env_bool(
            "MARGIN_AUTO_REPAY_AT_CANCEL",
            &mut self.margin.auto_repay_at_cancel,
        );
        env_dec("MARGIN_DEBT_EPS", &mut self.margin.debt_eps);

        env_bool("INVAR_ENABLED", &mut self.invariants.enabled);
        env_parse("INVAR_EVERY_SEC", &mut self.invariants.every_sec);
        env_parse("INVAR_THROTTLE_SEC", &mut self.invariants.throttle_sec);
        env_parse("INVAR_GRACE_SEC", &mut self.invariants.grace_sec);
        env_parse("INVAR_FEED_STALE_SEC", &mut self.invariants.feed_stale_sec);
        env_parse("I13_GRACE_SEC", &mut self.invariants.i13_grace_sec);
        env_parse("I13_ESCALATE_SEC", &mut self.invariants.i13_escalate_sec);
        env_bool("I13_KILL_ON_DEBT", &mut self.invariants.i13_kill_on_debt);

        env_parse("DEDUP_PRICE_DECIMALS", &mut self.dedup.price_decimals);
        env_parse("SEEN_KEYS_MAX", &mut self.dedup.seen_keys_max);
        env_bool("STRICT_SOURCE", &mut self.dedup.strict_source);
        env_str("EXPECT_SOURCE", |v| self.dedup.expect_source = v);
        env_parse("TAIL_LINES", &mut self.dedup.tail_lines);
        env_parse("MAX_PEAK_AGE_SEC", &mut self.dedup.max_peak_age_sec);

        env_str("WEBHOOK_URL", |v| self.webhook.url = v);
        env_str("WEBHOOK_BASIC_AUTH_USER", |v| {
            self.webhook.basic_auth_user = v
        });
        env_str("WEBHOOK_BASIC_AUTH_PASSWORD", |v| {
            self.webhook.basic_auth_password = v
        });

        if let Ok(v) = std::env::var("BINANCE_API_BASES") {
            let bases: Vec<String> = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            if !bases.is_empty() {
                self.exchange.base_urls = bases;
            }
        }
        env_str("BINANCE_API_KEY", |v| self.exchange.api_key = v);
        env_str("BINANCE_API_SECRET", |v| self.exchange.api_secret = v);
        env_parse("RECV_WINDOW", &mut self.exchange.recv_window_ms);
        env_parse(
            "BINANCE_HTTP_READ_TIMEOUT_SEC",
            &mut self.exchange.read_timeout_sec,
        );
    }

    /// Validate cross-field constraints that cannot be expressed per field.
    pub fn validate(&self) -> Result<()> {
        if self.symbol.trim().is_empty() {
            bail!("SYMBOL must not be empty");
        }
        if self.sizing.qty_step <= Decimal::ZERO || self.sizing.tick_size <= Decimal::ZERO {
            bail!("QTY_STEP and TICK_SIZE must be positive");
        }
        if self.risk.tp_r_list.len() < 2 {
            bail!("TP_R_LIST needs at least two R-multiples (TP1, TP2)");
        }
        if self.trade_mode == TradeMode::Margin {
            // Mixed borrow modes are refused outright: explicit borrow with
            // exchange-managed side effects double-borrows.
            if self.margin.borrow_mode == BorrowMode::Manual && self.margin.auto_repay_at_cancel {
                bail!("MARGIN_BORROW_MODE=manual is incompatible with MARGIN_AUTO_REPAY_AT_CANCEL");
            }
        }
        Ok(())
    }

    /// Best-effort split of the symbol into (base, quote) assets.
    pub fn split_symbol(&self) -> (String, String) {
        const QUOTES: &[&str] = &[
            "USDT", "USDC", "FDUSD", "BUSD", "TUSD", "DAI", "BTC", "ETH", "BNB", "EUR", "TRY",
        ];
        let s = self.symbol.trim().to_ascii_uppercase();
        let mut quotes: Vec<&str> = QUOTES.to_vec();
        quotes.sort_by_key(|q| std::cmp::Reverse(q.len()));
        for q in quotes {
            if s.ends_with(q) && s.len() > q.len() {
                return (s[..s.len() - q.len()].to_string(), q.to_string());
            }
        }
        (s, String::new())
    }
}

fn env_str(name: &str, mut set: impl FnMut(String)) {
    if let Ok(v) = std::env::var(name) {
        let v = v.trim().to_string();
        if !v.is_empty() {
            set(v);
        }
    }
}

fn env_path(name: &str, target: &mut PathBuf) {
    env_str(name, |v| *target = PathBuf::from(v));
}

fn env_dec(name: &str, target: &mut Decimal) {
    if let Ok(v) = std::env::var(name) {
        if let Ok(d) = Decimal::from_str(v.trim()) {
            *target = d;
        }
    }
}

fn env_bool(name: &str, target: &mut bool) {
    if let Ok(v) = std::env::var(name) {
        match v.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "y" | "on" => *target = true,
            "0" | "false" | "no" | "n" | "off" => *target = false,
            _ => {}
        }
    }
}

fn env_parse<T: FromStr>(name: &str, target: &mut T) {
    if let Ok(v) = std::env::var(name) {
        if let Ok(parsed) = v.trim().parse::<T>() {
            *target = parsed;
        }
    }
}
