//! PEAK signal parsing.
//!
//! The signal input is an append-only JSONL file; each line is one JSON
//! object. Unknown actions are ignored. The consumer never writes this
//! file.

use chrono::{DateTime, Utc};
use peak_common::types::Side;
use rust_decimal::Decimal;
use serde::Deserialize;

/// One parsed signal line.
#[derive(Debug, Clone, Deserialize)]
pub struct PeakEvent {
    pub action: String,
    pub ts: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub price: Option<Decimal>,
    #[serde(default)]
    pub source: Option<String>,
}

impl PeakEvent {
    /// Parse one log line; non-JSON and non-object lines yield `None`.
    pub fn parse_line(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() || !line.starts_with('{') {
            return None;
        }
        serde_json::from_str(line).ok()
    }

    pub fn is_peak(&self) -> bool {
        self.action == "PEAK"
    }

    pub fn side(&self) -> Option<Side> {
        Side::from_kind(&self.kind)
    }

    /// Normalized UTC timestamp; accepts `Z` and offset suffixes.
    pub fn ts_utc(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(self.ts.trim())
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    }
}
