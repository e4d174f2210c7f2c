//! The execution engine: owns the state, the adapter, and the tick loop.
//!
//! Strictly sequential: one task, one tick at a time. Within a tick the
//! finalization-first check precedes all watchdog and trailing logic,
//! watchdog planning (pure) precedes plan execution, and state mutations
//! persist atomically before observable events are emitted.

pub mod cancel;
pub mod emergency;
pub mod entry;
pub mod exits;
pub mod manage;
pub mod reconcile;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::json;
use tracing::{error, warn};

use crate::config::Config;
use crate::dedup;
use crate::exchange::ExchangeApi;
use crate::invariants::{InvariantEngine, Verdict};
use crate::notify::Notifier;
use crate::signal::PeakEvent;
use crate::snapshot::{MidPriceSnapshot, OpenOrdersSnapshot};
use crate::state::{ExecState, JsonStore};
use crate::tail::read_tail_lines;
use crate::types::{LastClosed, Position};

/// Consecutive save failures before the alert suggests the emergency flag.
const SUGGEST_SHUTDOWN_AFTER_FAILS: u32 = 3;
const SAVE_ALERT_THROTTLE_SEC: i64 = 300;

pub struct Engine {
    pub config: Config,
    pub api: Arc<dyn ExchangeApi>,
    pub store: JsonStore,
    pub notifier: Notifier,
    pub open_orders: OpenOrdersSnapshot,
    pub mid_price: MidPriceSnapshot,
    pub invariants: InvariantEngine,
    pub st: ExecState,

    last_manage_s: i64,
    next_invar_s: i64,
    save_fail_count: u32,
    last_save_alert_s: i64,
}

pub fn now_s() -> i64 {
    Utc::now().timestamp()
}

impl Engine {
    pub fn new(config: Config, api: Arc<dyn ExchangeApi>) -> Result<Self> {
        let store = JsonStore::new(config.paths.state_file.clone());
        let st: ExecState = store.load().context("loading state document")?;
        let notifier = Notifier::new(&config);
        let invariants = InvariantEngine::new(&config);
        Ok(Self {
            config,
            api,
            store,
            notifier,
            open_orders: OpenOrdersSnapshot::default(),
            mid_price: MidPriceSnapshot::default(),
            invariants,
            st,
            last_manage_s: 0,
            next_invar_s: 0,
            save_fail_count: 0,
            last_save_alert_s: 0,
        })
    }

    /// Persist the state document. A failure alerts the operator (one-shot,
    /// throttled) but never halts: after a market order has executed,
    /// halting mid-transition would guarantee state drift on the next boot.
    pub async fn persist(&mut self, where_: &str) -> bool {
        match self.store.save(&self.st) {
            Ok(()) => {
                self.save_fail_count = 0;
                true
            }
            Err(e) => {
                self.save_fail_count += 1;
                warn!(error = %e, where_, fail_count = self.save_fail_count, "state save failed");
                let now = now_s();
                if self.save_fail_count == 1
                    || now - self.last_save_alert_s >= SAVE_ALERT_THROTTLE_SEC
                {
                    self.last_save_alert_s = now;
                    self.notifier.event(
                        "SAVE_STATE_FAILURE",
                        json!({
                            "where": where_,
                            "error": e.to_string(),
                            "fail_count": self.save_fail_count,
                        }),
                    );
                    let mut payload = json!({
                        "event": "SAVE_STATE_FAILURE",
                        "where": where_,
                        "error": e.to_string(),
                        "fail_count": self.save_fail_count,
                        "action": format!("touch {:?}", self.config.paths.emergency_flag()),
                    });
                    if self.save_fail_count >= SUGGEST_SHUTDOWN_AFTER_FAILS {
                        payload["suggestion"] = json!("consider emergency shutdown");
                    }
                    self.notifier.webhook(payload).await;
                }
                false
            }
        }
    }

    /// Record a rate-limited adapter error for detector I10 and log it.
    pub fn note_exchange_error(&mut self, err: &crate::exchange::ExchangeError, context: &str) {
        if err.is_rate_limited() {
            self.invariants.record_rate_limit(now_s());
        }
        warn!(error = %err, context, "exchange call failed");
    }

    /// Clear the position slot to null, set the cooldown deadline, record
    /// the terminal state for reporting, repay margin, and persist.
    pub async fn close_slot(&mut self, pos: Position, reason: &str) {
        self.st.last_closed = Some(LastClosed {
            ts: Utc::now(),
            trade_key: pos.trade_key.clone(),
            side: Some(pos.side),
            reason: reason.to_string(),
            entry: pos.entry_actual.or(pos.prices.map(|p| p.entry)),
            prev_status: Some(pos.status),
        });
        self.st.position = None;
        self.st.cooldown_until_s = now_s() + self.config.manage.cooldown_sec;
        self.st.lock_until_s = 0;
        self.persist("close_slot").await;

        let mut ledger = std::mem::take(&mut self.st.margin);
        if let Err(e) = crate::margin::on_after_position_closed(
            &mut ledger,
            self.api.as_ref(),
            &self.config,
            Some(pos.trade_key.as_str()),
        )
        .await
        {
            self.note_exchange_error(&e, "margin repay after close");
            self.notifier
                .event("MARGIN_REPAY_ERROR", json!({ "error": e.to_string() }));
        }
        self.st.margin = ledger;
        self.persist("close_slot_margin").await;

        self.notifier
            .event_and_webhook(
                "POSITION_CLOSED",
                json!({
                    "reason": reason,
                    "trade_key": pos.trade_key,
                    "side": pos.side.to_string(),
                }),
            )
            .await;
    }

    /// Read new signal lines past dedup, advancing the seen-keys set and
    /// the watermark. Always persists when the set changed, so the dedup
    /// state survives even if later processing fails.
    pub async fn ingest_signals(&mut self, now: i64) -> Vec<PeakEvent> {
        let lines = match read_tail_lines(&self.config.paths.signal_log, self.config.dedup.tail_lines)
        {
            Ok(lines) => lines,
            Err(e) => {
                warn!(error = %e, "signal log read failed");
                return Vec::new();
            }
        };

        let mut fresh = Vec::new();
        let mut changed = false;
        for line in &lines {
            let Some(evt) = PeakEvent::parse_line(line) else {
                continue;
            };
            if !evt.is_peak() {
                continue;
            }
            let Some(key) = dedup::stable_event_key(&evt, &self.config.dedup) else {
                continue;
            };
            if self.st.meta.seen_keys.contains(&key) {
                continue;
            }
            let ts = evt.ts_utc();
            // Watermark: not-newer events are marked seen but not acted on.
            if let Some(ts) = ts {
                if !dedup::past_watermark(&self.st.meta, ts) {
                    self.st.meta.seen_keys.push(key);
                    changed = true;
                    continue;
                }
                self.st.meta.last_peak_ts = Some(ts.to_rfc3339());
            }
            self.st.meta.seen_keys.push(key);
            changed = true;

            // Stale-PEAK filter.
            let max_age = self.config.dedup.max_peak_age_sec;
            if max_age > 0 {
                if let Some(ts) = ts {
                    let age = now - ts.timestamp();
                    if age > max_age {
                        self.notifier.event(
                            "SKIP_PEAK",
                            json!({ "reason": "stale_peak", "age_sec": age, "evt_ts": evt.ts }),
                        );
                        continue;
                    }
                }
            }
            fresh.push(evt);
        }

        if changed {
            dedup::cap_seen_keys(&mut self.st.meta, self.config.dedup.seen_keys_max);
            self.persist("seen_keys").await;
        }
        fresh
    }

    /// Boot sequence: margin hook, dedup bootstrap, reconciliation attach.
    pub async fn boot(&mut self) -> Result<()> {
        if let Err(msg) = crate::margin::on_startup(&self.config) {
            anyhow::bail!("margin startup validation failed: {msg}");
        }

        let tail = read_tail_lines(&self.config.paths.signal_log, self.config.dedup.tail_lines)
            .unwrap_or_default();
        let stats =
            dedup::bootstrap_seen_keys(&mut self.st.meta, &tail, &self.config.dedup, Utc::now());
        self.persist("bootstrap_seen_keys").await;
        self.notifier.event(
            "BOOTSTRAP_SEEN_KEYS",
            json!({
                "added": stats.added,
                "total": stats.total,
                "fingerprint_reset": stats.fingerprint_reset,
            }),
        );

        let pos = self.st.position.as_ref();
        self.notifier.event(
            "BOOT",
            json!({
                "trade_mode": self.config.trade_mode.to_string(),
                "symbol": self.config.symbol,
                "position_exists": pos.is_some(),
                "status": pos.map(|p| format!("{:?}", p.status)),
                "trail_active": pos.map(|p| p.trail_active),
            }),
        );

        if let Err(e) = self.api.sanity_check().await {
            self.note_exchange_error(&e, "boot sanity check");
            self.notifier
                .event("SANITY_CHECK_FAILED", json!({ "error": e.to_string() }));
        }

        reconcile::sync(self, reconcile::SyncReason::Boot, now_s()).await;
        Ok(())
    }

    /// The main loop. Runs until an unrecoverable condition (malformed
    /// state file, detector-ordered halt) or process signal.
    pub async fn run(&mut self) -> Result<()> {
        self.boot().await?;

        loop {
            tokio::time::sleep(Duration::from_secs(self.config.manage.poll_sec)).await;
            // Reload to pick up external state changes (operator edits,
            // a previous instance's remains). Malformed state is fatal.
            self.st = self.store.load().context("reloading state document")?;
            let now = now_s();

            if emergency::flag_exists(&self.config) {
                emergency::shutdown(self, "OPERATOR_FLAG").await;
                emergency::remove_flag(&self.config);
                continue;
            }
            if emergency::in_sleep_mode(self).await {
                continue;
            }

            if self.config.invariants.enabled && now >= self.next_invar_s {
                self.next_invar_s = now + self.config.invariants.every_sec;
                let st_view = self.st.clone();
                let verdict = self
                    .invariants
                    .run(
                        &self.config,
                        &self.notifier,
                        self.api.as_ref(),
                        &st_view,
                        now,
                    )
                    .await;
                if verdict == Verdict::Halt {
                    error!("detector I13 ordered a halt (kill-on-debt)");
                    self.notifier
                        .event_and_webhook("I13_HALT", json!({ "reason": "post-close debt" }))
                        .await;
                    return Ok(());
                }
            }

            if let Err(e) = entry::manage_pending(self, now).await {
                self.notifier
                    .event("LIVE_POLL_ERROR", json!({ "error": e.to_string() }));
            }

            let fresh = self.ingest_signals(now).await;

            let live = self
                .st
                .position
                .as_ref()
                .is_some_and(|p| matches!(p.status, crate::types::PositionStatus::Open | crate::types::PositionStatus::OpenFilled | crate::types::PositionStatus::Closing));
            if live && now - self.last_manage_s >= self.config.manage.manage_every_sec {
                self.last_manage_s = now;
                exits::handle_exits_retry(self, now).await;
                if let Err(e) = manage::tick(self, now).await {
                    self.notifier
                        .event("LIVE_MANAGE_ERROR", json!({ "error": e.to_string() }));
                }
            }

            for evt in fresh {
                entry::try_open(self, &evt, now_s()).await;
            }
        }
    }
}

impl Engine {
    /// Test/bench constructor that skips filesystem boot chores.
    pub fn with_state(config: Config, api: Arc<dyn ExchangeApi>, st: ExecState) -> Self {
        let store = JsonStore::new(config.paths.state_file.clone());
        let notifier = Notifier::new(&config);
        let invariants = InvariantEngine::new(&config);
        Self {
            config,
            api,
            store,
            notifier,
            open_orders: OpenOrdersSnapshot::default(),
            mid_price: MidPriceSnapshot::default(),
            invariants,
            st,
            last_manage_s: 0,
            next_invar_s: 0,
            save_fail_count: 0,
            last_save_alert_s: 0,
        }
    }
}

pub use manage::tick;

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("symbol", &self.config.symbol)
            .field("position", &self.st.position.as_ref().map(|p| p.status))
            .finish()
    }
}
