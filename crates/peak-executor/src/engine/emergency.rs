//! Emergency shutdown mode.
//!
//! Operator-controlled filesystem flags beside the state file:
//! `emergency_shutdown.flag` triggers a reconciliation-first shutdown into
//! sleep mode; `wake_up.flag` resumes normal processing. The process is
//! fail-aware, not fail-loud: it reports and cooperates with the operator
//! rather than halting mid-transition.

use chrono::Utc;
use serde_json::json;

use crate::config::Config;
use crate::exchange::ExchangeApi;
use crate::state::SleepMode;
use crate::types::{LastClosed, OrderKey};

use super::{now_s, Engine};

/// Cooldown applied after an emergency close.
const EMERGENCY_COOLDOWN_SEC: i64 = 3600;

pub fn flag_exists(config: &Config) -> bool {
    config.paths.emergency_flag().exists()
}

pub fn remove_flag(config: &Config) {
    let _ = std::fs::remove_file(config.paths.emergency_flag());
}

/// Sleep-mode gate for the main loop. Returns true while the engine
/// should skip the tick; handles the wake flag.
pub async fn in_sleep_mode(engine: &mut Engine) -> bool {
    if !engine.st.sleeping() {
        return false;
    }
    let wake = engine.config.paths.wake_flag();
    if !wake.exists() {
        return true;
    }

    // Operator says wake up.
    if let Some(sleep) = engine.st.sleep_mode.as_mut() {
        sleep.active = false;
        sleep.woke_up_at = Some(Utc::now());
    }
    let since = engine
        .st
        .sleep_mode
        .as_ref()
        .map(|s| s.since.to_rfc3339());
    let _ = std::fs::remove_file(&wake);
    engine.persist("wake_up").await;
    engine
        .notifier
        .event_and_webhook("WAKE_UP", json!({ "slept_since": since }))
        .await;
    false
}

/// Reconciliation-first shutdown:
/// 1. Poll every tracked order.
/// 2. Refuse to shut down while any is non-terminal.
/// 3. Repay margin, record the close, clear the slot.
/// 4. Back up state to the side file when the primary save fails.
/// 5. Enter sleep mode.
///
/// Returns true when sleep mode was entered.
pub async fn shutdown(engine: &mut Engine, reason: &str) -> bool {
    engine
        .notifier
        .event_and_webhook("EMERGENCY_SHUTDOWN_START", json!({ "reason": reason }))
        .await;

    // Step 1: reconcile tracked orders against the venue.
    let tracked: Vec<(OrderKey, i64)> = engine
        .st
        .position
        .as_ref()
        .map(|p| {
            [OrderKey::Sl, OrderKey::SlPrev, OrderKey::Tp1, OrderKey::Tp2]
                .into_iter()
                .filter_map(|k| p.orders.get(k).map(|id| (k, id)))
                .collect()
        })
        .unwrap_or_default();

    let mut statuses = Vec::new();
    let mut non_terminal = Vec::new();
    for (key, order_id) in tracked {
        match engine.api.status(order_id).await {
            Ok(info) => {
                if !info.status.is_terminal() {
                    non_terminal.push((key.as_str(), order_id, info.status.to_string()));
                }
                statuses.push(json!({
                    "which": key.as_str(),
                    "order_id": order_id,
                    "status": info.status.to_string(),
                }));
            }
            Err(e) => {
                engine.note_exchange_error(&e, "emergency order reconcile");
                statuses.push(json!({
                    "which": key.as_str(),
                    "order_id": order_id,
                    "status": "ERROR",
                }));
            }
        }
    }
    engine
        .notifier
        .event("EMERGENCY_RECONCILE", json!({ "orders": statuses }));

    // Step 2: active orders block the shutdown; the operator must cancel
    // them on the exchange first.
    if !non_terminal.is_empty() {
        engine
            .notifier
            .event_and_webhook(
                "EMERGENCY_BLOCKED_ACTIVE_ORDERS",
                json!({
                    "active_orders": non_terminal
                        .iter()
                        .map(|(k, id, s)| json!({ "which": k, "order_id": id, "status": s }))
                        .collect::<Vec<_>>(),
                }),
            )
            .await;
        return false;
    }

    // Step 3: force finalize.
    let trade_key = engine.st.position.as_ref().map(|p| p.trade_key.clone());
    let mut ledger = std::mem::take(&mut engine.st.margin);
    if let Err(e) = crate::margin::on_after_position_closed(
        &mut ledger,
        engine.api.as_ref(),
        &engine.config,
        trade_key.as_deref(),
    )
    .await
    {
        engine.note_exchange_error(&e, "emergency margin repay");
    }
    engine.st.margin = ledger;

    if let Some(pos) = engine.st.position.take() {
        engine.st.last_closed = Some(LastClosed {
            ts: Utc::now(),
            trade_key: pos.trade_key.clone(),
            side: Some(pos.side),
            reason: format!("EMERGENCY_SHUTDOWN: {reason}"),
            entry: pos.entry_actual.or(pos.prices.map(|p| p.entry)),
            prev_status: Some(pos.status),
        });
    }
    engine.st.cooldown_until_s = now_s() + EMERGENCY_COOLDOWN_SEC;
    engine.st.lock_until_s = 0;

    // Step 5: sleep mode, recorded before the save so even the backup
    // carries it.
    engine.st.sleep_mode = Some(SleepMode {
        active: true,
        since: Utc::now(),
        reason: reason.to_string(),
        woke_up_at: None,
    });

    // Step 4: primary save, backup on failure.
    if !engine.persist("emergency_shutdown").await {
        backup_state(engine, reason);
    }

    engine
        .notifier
        .event_and_webhook(
            "SLEEP_MODE_ACTIVE",
            json!({
                "reason": reason,
                "wake_file": engine.config.paths.wake_flag(),
            }),
        )
        .await;
    true
}

fn backup_state(engine: &Engine, reason: &str) {
    let path = engine.config.paths.emergency_backup();
    let payload = json!({
        "backup_ts": Utc::now().to_rfc3339(),
        "backup_reason": reason,
        "state": serde_json::to_value(&engine.st).unwrap_or(serde_json::Value::Null),
    });
    match std::fs::write(&path, payload.to_string()) {
        Ok(()) => engine
            .notifier
            .event("EMERGENCY_BACKUP_SAVED", json!({ "path": path })),
        Err(e) => engine.notifier.event(
            "EMERGENCY_BACKUP_FAILED",
            json!({ "path": path, "error": e.to_string() }),
        ),
    }
}
