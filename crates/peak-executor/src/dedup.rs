//! Signal deduplication.
//!
//! A stable bucket key per signal, a bounded FIFO set of recent keys, and
//! an algorithm fingerprint that invalidates the persisted set whenever
//! the key formula or its configuration changes.

use chrono::{DateTime, Utc};
use rust_decimal::RoundingStrategy;
use sha2::{Digest, Sha256};

use crate::config::DedupConfig;
use crate::signal::PeakEvent;
use crate::state::DedupMeta;

/// Version tag baked into the fingerprint; bump on any key-formula change.
const ALGO_VERSION: &str = "dedup_v1";

/// Stable dedup key: `"{action}|{ts_bucketed_to_minute}|{kind}|{price}"`.
///
/// Returns `None` for events that must not be acted on at all (wrong
/// action, bad kind, unparseable timestamp or price, strict-source
/// mismatch).
pub fn stable_event_key(evt: &PeakEvent, config: &DedupConfig) -> Option<String> {
    if !evt.is_peak() {
        return None;
    }
    if config.strict_source && evt.source.as_deref() != Some(config.expect_source.as_str()) {
        return None;
    }
    let kind = evt.kind.trim().to_ascii_lowercase();
    if kind != "long" && kind != "short" {
        return None;
    }
    let ts = evt.ts_utc()?;
    // Bucket to the minute: stable across small ts jitter and whitespace
    // variation in the source line.
    let minute = ts.format("%Y-%m-%dT%H:%M");

    let price = evt.price?;
    let rounded = price.round_dp_with_strategy(
        config.price_decimals,
        RoundingStrategy::MidpointAwayFromZero,
    );
    let price_s = format!("{:.*}", config.price_decimals as usize, rounded);

    Some(format!("PEAK|{minute}|{kind}|{price_s}"))
}

/// Fingerprint over the algorithm version and the configuration knobs the
/// key depends on.
pub fn fingerprint(config: &DedupConfig) -> String {
    let payload = format!(
        "{ALGO_VERSION}|DEDUP_PRICE_DECIMALS={}|STRICT_SOURCE={}|EXPECT_SOURCE={}",
        config.price_decimals, config.strict_source, config.expect_source
    );
    hex::encode(Sha256::digest(payload.as_bytes()))
}

/// Outcome of seeding the seen-keys set from the signal log tail.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct BootstrapStats {
    pub added: usize,
    pub total: usize,
    pub fingerprint_reset: bool,
}

/// Seed the seen-keys set from the last lines of the signal log so a fresh
/// install does not replay old PEAKs.
pub fn bootstrap_seen_keys(
    meta: &mut DedupMeta,
    tail_lines: &[String],
    config: &DedupConfig,
    now: DateTime<Utc>,
) -> BootstrapStats {
    let fp_now = fingerprint(config);
    let mut stats = BootstrapStats::default();

    if meta.dedup_fp != fp_now {
        meta.seen_keys.clear();
        meta.dedup_fp = fp_now;
        stats.fingerprint_reset = true;
    }

    for line in tail_lines {
        let Some(evt) = PeakEvent::parse_line(line) else {
            continue;
        };
        let Some(key) = stable_event_key(&evt, config) else {
            continue;
        };
        if !meta.seen_keys.contains(&key) {
            meta.seen_keys.push(key);
            stats.added += 1;
        }
    }

    cap_seen_keys(meta, config.seen_keys_max);
    meta.boot_ts = Some(now);
    stats.total = meta.seen_keys.len();
    stats
}

/// FIFO-evict down to the configured bound.
pub fn cap_seen_keys(meta: &mut DedupMeta, max: usize) {
    if meta.seen_keys.len() > max {
        let excess = meta.seen_keys.len() - max;
        meta.seen_keys.drain(..excess);
    }
}

/// Whether `ts` is past the watermark (strictly newer than the last PEAK
/// acted on). Events at or before the watermark are deduped silently.
pub fn past_watermark(meta: &DedupMeta, ts: DateTime<Utc>) -> bool {
    match meta
        .last_peak_ts
        .as_deref()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
    {
        Some(mark) => ts > mark.with_timezone(&Utc),
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn config() -> DedupConfig {
        DedupConfig::default()
    }

    fn peak(line: &str) -> PeakEvent {
        PeakEvent::parse_line(line).unwrap()
    }

    #[test]
    fn test_key_formula() {
        let evt = peak(
            r#"{"action":"PEAK","ts":"2025-01-13T20:00:37Z","kind":"long","price":95000.04,"source":"DeltaScout"}"#,
        );
        let key = stable_event_key(&evt, &config()).unwrap();
        assert_eq!(key, "PEAK|2025-01-13T20:00|long|95000.0");
    }

    #[test]
    fn test_key_stable_under_whitespace_variation() {
        let a = peak(
            r#"{"action":"PEAK","ts":"2025-01-13T20:00:00Z","kind":"long","price":95000.0,"source":"DeltaScout"}"#,
        );
        let b = peak(
            r#"{ "action" : "PEAK" ,  "ts" : "2025-01-13T20:00:59Z", "kind":"long", "price": 95000.04, "source":"DeltaScout" }"#,
        );
        assert_eq!(
            stable_event_key(&a, &config()),
            stable_event_key(&b, &config())
        );
    }

    #[test]
    fn test_strict_source_rejects_foreign_events() {
        let evt = peak(
            r#"{"action":"PEAK","ts":"2025-01-13T20:00:00Z","kind":"long","price":95000.0,"source":"other"}"#,
        );
        assert!(stable_event_key(&evt, &config()).is_none());
        let mut lax = config();
        lax.strict_source = false;
        assert!(stable_event_key(&evt, &lax).is_some());
    }

    #[test]
    fn test_fingerprint_tracks_config() {
        let a = fingerprint(&config());
        let mut other = config();
        other.price_decimals = 2;
        assert_ne!(a, fingerprint(&other));
        assert_eq!(a, fingerprint(&config()));
    }

    #[test]
    fn test_bootstrap_dedups_and_caps() {
        let mut meta = DedupMeta::default();
        let line = r#"{"action":"PEAK","ts":"2025-01-13T20:00:00Z","kind":"long","price":95000.0,"source":"DeltaScout"}"#;
        let lines = vec![line.to_string(), line.to_string()];
        let stats = bootstrap_seen_keys(&mut meta, &lines, &config(), Utc::now());
        assert_eq!(stats.added, 1);
        assert_eq!(stats.total, 1);
        assert!(stats.fingerprint_reset);

        // Replaying the same tail adds nothing: dedup is idempotent.
        let stats = bootstrap_seen_keys(&mut meta, &lines, &config(), Utc::now());
        assert_eq!(stats.added, 0);
        assert_eq!(stats.total, 1);
        assert!(!stats.fingerprint_reset);
    }

    #[test]
    fn test_fifo_eviction() {
        let mut meta = DedupMeta::default();
        for i in 0..10 {
            meta.seen_keys.push(format!("k{i}"));
        }
        cap_seen_keys(&mut meta, 4);
        assert_eq!(meta.seen_keys, vec!["k6", "k7", "k8", "k9"]);
    }

    #[test]
    fn test_fingerprint_change_discards_set() {
        let mut meta = DedupMeta {
            seen_keys: vec!["old".to_string()],
            dedup_fp: "stale".to_string(),
            ..DedupMeta::default()
        };
        let stats = bootstrap_seen_keys(&mut meta, &[], &config(), Utc::now());
        assert!(stats.fingerprint_reset);
        assert!(meta.seen_keys.is_empty());
    }

    #[test]
    fn test_watermark() {
        let mut meta = DedupMeta::default();
        let t0 = Utc.with_ymd_and_hms(2025, 1, 13, 20, 0, 0).unwrap();
        assert!(past_watermark(&meta, t0));
        meta.last_peak_ts = Some(t0.to_rfc3339());
        assert!(!past_watermark(&meta, t0));
        assert!(past_watermark(&meta, t0 + chrono::Duration::seconds(1)));
    }
}
