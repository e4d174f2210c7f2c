//! Structured event log and webhook alerting.
//!
//! Every observable state transition emits one JSONL line with mandatory
//! `ts`, `source`, `action` fields. The log rotates by append-then-cap.
//! The webhook is best-effort: failures are logged, never retried.

use std::path::PathBuf;

use chrono::Utc;
use serde_json::{json, Map, Value};
use tracing::warn;

use crate::config::{Config, WebhookConfig};

/// Emitter for business events (log file + optional webhook).
pub struct Notifier {
    log_path: PathBuf,
    max_lines: usize,
    webhook: WebhookConfig,
    http: reqwest::Client,
}

impl Notifier {
    pub fn new(config: &Config) -> Self {
        Self {
            log_path: config.paths.event_log.clone(),
            max_lines: config.log_max_lines,
            webhook: config.webhook.clone(),
            http: reqwest::Client::new(),
        }
    }

    /// Append one event line, capping the file to `max_lines`.
    ///
    /// Telemetry failures never propagate into the trading path.
    pub fn event(&self, action: &str, fields: Value) {
        let mut obj = Map::new();
        obj.insert("ts".to_string(), json!(Utc::now().to_rfc3339()));
        obj.insert("source".to_string(), json!("executor"));
        obj.insert("action".to_string(), json!(action));
        if let Value::Object(extra) = fields {
            for (k, v) in extra {
                obj.insert(k, v);
            }
        }
        let line = Value::Object(obj).to_string();
        tracing::info!(target: "event", action, "{line}");
        if let Err(e) = append_line_with_cap(&self.log_path, &line, self.max_lines) {
            warn!(error = %e, action, "failed to append event log line");
        }
    }

    /// POST the payload to the configured webhook with basic auth.
    /// Best-effort; a failure becomes a `WEBHOOK_ERROR` event.
    pub async fn webhook(&self, mut payload: Value) {
        if self.webhook.url.is_empty() {
            return;
        }
        if let Value::Object(ref mut obj) = payload {
            obj.entry("source").or_insert(json!("executor"));
        }
        let mut req = self.http.post(&self.webhook.url).json(&payload);
        if !self.webhook.basic_auth_user.is_empty() {
            req = req.basic_auth(
                &self.webhook.basic_auth_user,
                Some(&self.webhook.basic_auth_password),
            );
        }
        if let Err(e) = req.timeout(std::time::Duration::from_secs(5)).send().await {
            self.event("WEBHOOK_ERROR", json!({ "error": e.to_string() }));
        }
    }

    /// Emit to both sinks in one call.
    pub async fn event_and_webhook(&self, action: &str, fields: Value) {
        self.event(action, fields.clone());
        let mut payload = fields;
        if let Value::Object(ref mut obj) = payload {
            obj.insert("event".to_string(), json!(action));
        }
        self.webhook(payload).await;
    }
}

fn append_line_with_cap(path: &PathBuf, line: &str, cap: usize) -> std::io::Result<()> {
    use std::io::Write;

    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)?;
        }
    }
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    writeln!(file, "{line}")?;
    drop(file);

    let content = std::fs::read_to_string(path)?;
    let lines: Vec<&str> = content.lines().collect();
    if lines.len() > cap {
        let keep = &lines[lines.len() - cap..];
        std::fs::write(path, format!("{}\n", keep.join("\n")))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notifier_at(path: PathBuf, cap: usize) -> Notifier {
        let mut config = Config::default();
        config.paths.event_log = path;
        config.log_max_lines = cap;
        Notifier::new(&config)
    }

    #[test]
    fn test_event_line_shape() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("executor.log");
        let notifier = notifier_at(path.clone(), 10);
        notifier.event("TP1_DONE", json!({"order_id": 42}));

        let content = std::fs::read_to_string(&path).unwrap();
        let line: Value = serde_json::from_str(content.lines().next().unwrap()).unwrap();
        assert_eq!(line["source"], "executor");
        assert_eq!(line["action"], "TP1_DONE");
        assert_eq!(line["order_id"], 42);
        assert!(line["ts"].as_str().unwrap().contains('T'));
    }

    #[test]
    fn test_append_then_cap_rotation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("executor.log");
        let notifier = notifier_at(path.clone(), 5);
        for i in 0..12 {
            notifier.event("TICK", json!({ "n": i }));
        }
        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 5);
        let first: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["n"], 7);
        let last: Value = serde_json::from_str(lines[4]).unwrap();
        assert_eq!(last["n"], 11);
    }
}
