//! Atomic state persistence.
//!
//! One JSON document per process instance. Load is tolerant: a missing
//! file yields the empty state; a malformed file is fatal (silent state
//! loss would re-open positions). Save writes a sibling temp file and
//! atomically renames it over the canonical path, so a concurrent reader
//! never observes a torn document.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

use crate::margin::MarginLedger;
use crate::types::{LastClosed, Position};

#[derive(Debug, Error)]
pub enum StateError {
    #[error("state io error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("state file {path:?} is malformed: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Dedup bookkeeping persisted with the state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupMeta {
    /// Bounded FIFO of recent dedup keys.
    pub seen_keys: Vec<String>,
    /// Fingerprint of the key algorithm + its configuration.
    pub dedup_fp: String,
    /// Watermark: newest PEAK timestamp acted on.
    pub last_peak_ts: Option<String>,
    pub boot_ts: Option<DateTime<Utc>>,
}

/// Sleep mode entered by the emergency shutdown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SleepMode {
    pub active: bool,
    pub since: DateTime<Utc>,
    pub reason: String,
    pub woke_up_at: Option<DateTime<Utc>>,
}

/// The persisted document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecState {
    pub position: Option<Position>,
    pub last_closed: Option<LastClosed>,
    /// New entries blocked until this time after a close.
    pub cooldown_until_s: i64,
    /// Duplicate-open lock set right after an entry is placed.
    pub lock_until_s: i64,
    pub meta: DedupMeta,
    pub margin: MarginLedger,
    pub sleep_mode: Option<SleepMode>,
    pub last_sync_s: i64,
    pub last_entry_abort_ts: Option<DateTime<Utc>>,
}

impl ExecState {
    pub fn has_open_position(&self) -> bool {
        self.position.as_ref().is_some_and(|p| p.status.is_live())
    }

    pub fn in_cooldown(&self, now_s: i64) -> bool {
        now_s < self.cooldown_until_s
    }

    pub fn locked(&self, now_s: i64) -> bool {
        now_s < self.lock_until_s
    }

    pub fn sleeping(&self) -> bool {
        self.sleep_mode.as_ref().is_some_and(|s| s.active)
    }
}

/// Store for one JSON document with temp-file + rename replacement.
#[derive(Debug, Clone)]
pub struct JsonStore {
    path: PathBuf,
}

impl JsonStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load<T: DeserializeOwned + Default>(&self) -> Result<T, StateError> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(T::default()),
            Err(e) => {
                return Err(StateError::Io {
                    path: self.path.clone(),
                    source: e,
                })
            }
        };
        serde_json::from_str(&raw).map_err(|e| StateError::Malformed {
            path: self.path.clone(),
            source: e,
        })
    }

    /// Atomic save. Callers must not assume success without checking.
    pub fn save<T: Serialize>(&self, value: &T) -> Result<(), StateError> {
        let io = |source| StateError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir).map_err(io)?;
            }
        }
        let raw = serde_json::to_string(value).map_err(|e| StateError::Malformed {
            path: self.path.clone(),
            source: e,
        })?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, raw).map_err(io)?;
        std::fs::rename(&tmp, &self.path).map_err(io)?;
        Ok(())
    }
}

/// Detector throttle metadata, kept out of the main state document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorMeta {
    /// `(invariant_id, position_key)` -> last emit time.
    pub last_emit_s: HashMap<String, i64>,
    /// First time I13 observed post-close debt.
    pub i13_first_debt_s: Option<i64>,
    /// Last time I13 pulled a debt snapshot from the venue.
    pub i13_last_check_s: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_missing_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::new(dir.path().join("state.json"));
        let st: ExecState = store.load().unwrap();
        assert!(st.position.is_none());
        assert_eq!(st.cooldown_until_s, 0);
    }

    #[test]
    fn test_load_malformed_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{not json").unwrap();
        let store = JsonStore::new(path);
        let err = store.load::<ExecState>().unwrap_err();
        assert!(matches!(err, StateError::Malformed { .. }));
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::new(dir.path().join("nested/state.json"));
        let mut st = ExecState::default();
        st.cooldown_until_s = 12345;
        st.meta.seen_keys.push("PEAK|2025-01-13T20:00|long|95000.0".to_string());
        store.save(&st).unwrap();
        let back: ExecState = store.load().unwrap();
        assert_eq!(back.cooldown_until_s, 12345);
        assert_eq!(back.meta.seen_keys.len(), 1);
    }

    #[test]
    fn test_save_replaces_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let store = JsonStore::new(path.clone());
        store.save(&ExecState::default()).unwrap();
        let mut st = ExecState::default();
        st.lock_until_s = 7;
        store.save(&st).unwrap();
        // No temp file left behind, canonical path has the latest doc.
        assert!(!path.with_extension("json.tmp").exists());
        let back: ExecState = store.load().unwrap();
        assert_eq!(back.lock_until_s, 7);
    }

    #[test]
    fn test_guards() {
        let mut st = ExecState::default();
        st.cooldown_until_s = 100;
        st.lock_until_s = 50;
        assert!(st.in_cooldown(99));
        assert!(!st.in_cooldown(100));
        assert!(st.locked(49));
        assert!(!st.locked(50));
        assert!(!st.has_open_position());
    }
}
