//! Swing trailing engine.
//!
//! Reads the normalized bar CSV (v2) via reverse tail, never a full scan,
//! and computes the desired stop from the most recent fractal swing
//! extreme. Failure policy: **fail-loud** on schema mismatch, **fail-closed**
//! on a missing or empty file (trailing simply does not activate).

use std::path::Path;
use std::str::FromStr;

use peak_common::types::Side;
use rust_decimal::Decimal;
use thiserror::Error;

use crate::config::{RiskConfig, TrailConfig};
use crate::tail::read_tail_lines;

/// Exact v2 header, ordered.
pub const CSV_V2_HEADER: &str =
    "Timestamp,Trades,TotalQty,AvgSize,BuyQty,SellQty,AvgPrice,ClosePrice,HiPrice,LowPrice";

const COL_CLOSE: usize = 7;
const COL_HI: usize = 8;
const COL_LOW: usize = 9;

#[derive(Debug, Error)]
pub enum TrailError {
    /// The feed header does not match the v2 expectation. Fatal.
    #[error("bar feed schema mismatch: expected v2 header, got {got:?}")]
    SchemaMismatch { got: String },

    #[error("bar feed io error: {0}")]
    Io(#[from] std::io::Error),
}

/// One parsed bar row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bar {
    pub close: Decimal,
    pub hi: Decimal,
    pub low: Decimal,
}

/// Read the last `n` bars from the CSV.
///
/// A missing file yields an empty vec (fail-closed). A header line that
/// does not match the v2 schema, or a data row with too few columns, is
/// fail-loud.
pub fn read_recent_bars(path: &Path, n: usize) -> Result<Vec<Bar>, TrailError> {
    // A few extra lines so a header landing inside the tail window does
    // not eat into the row budget.
    let lines = read_tail_lines(path, n + 5)?;
    let mut bars = Vec::with_capacity(lines.len());
    for line in &lines {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line.starts_with("Timestamp") {
            if line != CSV_V2_HEADER {
                return Err(TrailError::SchemaMismatch {
                    got: line.to_string(),
                });
            }
            continue;
        }
        let cols: Vec<&str> = line.split(',').map(|c| c.trim()).collect();
        if cols.len() <= COL_LOW {
            return Err(TrailError::SchemaMismatch {
                got: line.to_string(),
            });
        }
        let parse = |i: usize| Decimal::from_str(cols[i]).ok();
        let (Some(close), Some(hi), Some(low)) =
            (parse(COL_CLOSE), parse(COL_HI), parse(COL_LOW))
        else {
            // Partially written last row: skip rather than fail the tick.
            continue;
        };
        bars.push(Bar { close, hi, low });
    }
    if bars.len() > n {
        bars.drain(..bars.len() - n);
    }
    Ok(bars)
}

/// Most recent confirmed fractal swing in `series`.
///
/// A swing low at index `i` satisfies `series[i] < series[i-r..i]` and
/// `series[i] < series[i+1..=i+r]` strictly (symmetric for highs). The
/// scan runs right to left so the first hit is the latest swing.
pub fn last_fractal_swing(series: &[Decimal], radius: usize, low: bool) -> Option<Decimal> {
    let r = radius.max(1);
    if series.len() < 2 * r + 1 {
        return None;
    }
    for i in (r..series.len() - r).rev() {
        let x = series[i];
        let left = &series[i - r..i];
        let right = &series[i + 1..i + 1 + r];
        let is_swing = if low {
            left.iter().all(|v| x < *v) && right.iter().all(|v| x < *v)
        } else {
            left.iter().all(|v| x > *v) && right.iter().all(|v| x > *v)
        };
        if is_swing {
            return Some(x);
        }
    }
    None
}

/// View of the position fields the trailing engine needs.
#[derive(Debug, Clone, Copy)]
pub struct TrailView {
    pub side: Side,
    pub wait_confirm: bool,
    pub ref_price: Option<Decimal>,
}

/// Outcome of a desired-stop computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrailDecision {
    /// Replace/place the stop at this price if favorable.
    Stop(Decimal),
    /// Confirmation pending or no usable data: do nothing this round.
    NotReady,
    /// Bar-close confirmation just succeeded; recompute next round.
    Confirmed,
}

/// Compute the desired trailing stop from bar swings.
///
/// LONG uses `LowPrice` swings (stop = swing low − buffer); SHORT uses
/// `HiPrice` (stop = swing high + buffer). When `wait_confirm` is set the
/// bar close must first cross the reference price by the confirm buffer.
pub fn desired_stop(
    path: &Path,
    view: TrailView,
    config: &TrailConfig,
) -> Result<TrailDecision, TrailError> {
    if view.wait_confirm {
        let Some(ref_price) = view.ref_price.filter(|p| *p > Decimal::ZERO) else {
            // Unusable confirmation state: fall through to plain swings.
            return desired_stop_unconfirmed(path, view.side, config);
        };
        let bars = read_recent_bars(path, 10)?;
        let Some(last) = bars.last() else {
            return Ok(TrailDecision::NotReady);
        };
        let confirmed = match view.side {
            Side::Long => last.close > ref_price + config.confirm_buffer_usd,
            Side::Short => last.close < ref_price - config.confirm_buffer_usd,
        };
        if !confirmed {
            return Ok(TrailDecision::NotReady);
        }
        return Ok(TrailDecision::Confirmed);
    }
    desired_stop_unconfirmed(path, view.side, config)
}

fn desired_stop_unconfirmed(
    path: &Path,
    side: Side,
    config: &TrailConfig,
) -> Result<TrailDecision, TrailError> {
    let bars = read_recent_bars(path, config.swing_lookback)?;
    if bars.is_empty() {
        return Ok(TrailDecision::NotReady);
    }
    let (series, low): (Vec<Decimal>, bool) = match side {
        Side::Long => (bars.iter().map(|b| b.low).collect(), true),
        Side::Short => (bars.iter().map(|b| b.hi).collect(), false),
    };
    match last_fractal_swing(&series, config.swing_lr, low) {
        Some(swing) => Ok(TrailDecision::Stop(match side {
            Side::Long => swing - config.swing_buffer_usd,
            Side::Short => swing + config.swing_buffer_usd,
        })),
        None => Ok(TrailDecision::NotReady),
    }
}

/// Initial stop that is FARTHER from entry: the worse of the percentage
/// stop and the lookback swing extreme, clamped at least one tick from
/// entry. Directional rounding happens at the call site.
pub fn swing_stop_far(bars: &[Bar], side: Side, entry: Decimal, risk: &RiskConfig) -> Decimal {
    let pct_sl = match side {
        Side::Long => entry * (Decimal::ONE - risk.sl_pct),
        Side::Short => entry * (Decimal::ONE + risk.sl_pct),
    };
    let window = if bars.len() > risk.swing_mins {
        &bars[bars.len() - risk.swing_mins..]
    } else {
        bars
    };
    match side {
        Side::Long => {
            let swing = window.iter().map(|b| b.low).min().unwrap_or(pct_sl);
            pct_sl.min(swing)
        }
        Side::Short => {
            let swing = window.iter().map(|b| b.hi).max().unwrap_or(pct_sl);
            pct_sl.max(swing)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::io::Write;

    fn write_csv(lines: &[String]) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("aggregated.csv");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "{CSV_V2_HEADER}").unwrap();
        for line in lines {
            writeln!(f, "{line}").unwrap();
        }
        (dir, path)
    }

    fn row(close: &str, hi: &str, low: &str) -> String {
        format!("2025-01-13T20:00:00Z,10,1.5,0.15,0.7,0.8,{close},{close},{hi},{low}")
    }

    #[test]
    fn test_missing_file_fail_closed() {
        let dir = tempfile::tempdir().unwrap();
        let bars = read_recent_bars(&dir.path().join("absent.csv"), 100).unwrap();
        assert!(bars.is_empty());
    }

    #[test]
    fn test_schema_mismatch_fail_loud() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("aggregated.csv");
        std::fs::write(&path, "Timestamp,Trades,TotalQty,AvgPrice,ClosePrice\n1,2,3,4,5\n")
            .unwrap();
        let err = read_recent_bars(&path, 10).unwrap_err();
        assert!(matches!(err, TrailError::SchemaMismatch { .. }));
    }

    #[test]
    fn test_read_bars() {
        let (_dir, path) = write_csv(&[
            row("95000", "95100", "94900"),
            row("95050", "95150", "94950"),
        ]);
        let bars = read_recent_bars(&path, 10).unwrap();
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[1].hi, dec!(95150));
        assert_eq!(bars[1].low, dec!(94950));
    }

    #[test]
    fn test_fractal_swing_low() {
        let series: Vec<Decimal> = [5, 4, 3, 4, 5, 6, 5, 7]
            .iter()
            .map(|v| Decimal::from(*v))
            .collect();
        // r = 2: index 2 (value 3) is the only strict low fractal.
        assert_eq!(last_fractal_swing(&series, 2, true), Some(dec!(3)));
        // r = 1: index 6 (value 5, neighbors 6 and 7) is more recent.
        assert_eq!(last_fractal_swing(&series, 1, true), Some(dec!(5)));
    }

    #[test]
    fn test_fractal_swing_needs_strict_inequality() {
        let series: Vec<Decimal> = [3, 3, 3, 3, 3].iter().map(|v| Decimal::from(*v)).collect();
        assert_eq!(last_fractal_swing(&series, 1, true), None);
        assert_eq!(last_fractal_swing(&series, 1, false), None);
    }

    #[test]
    fn test_fractal_swing_too_short() {
        let series: Vec<Decimal> = [1, 2].iter().map(|v| Decimal::from(*v)).collect();
        assert_eq!(last_fractal_swing(&series, 2, true), None);
    }

    #[test]
    fn test_desired_stop_long() {
        let mut rows: Vec<String> = Vec::new();
        // Ramp down to a swing low at 94900, then back up.
        for low in ["95100", "95000", "94900", "95000", "95100", "95200"] {
            rows.push(row("95200", "95300", low));
        }
        let (_dir, path) = write_csv(&rows);
        let config = TrailConfig {
            swing_buffer_usd: dec!(15),
            swing_lr: 2,
            swing_lookback: 240,
            ..TrailConfig::default()
        };
        let view = TrailView {
            side: Side::Long,
            wait_confirm: false,
            ref_price: None,
        };
        let decision = desired_stop(&path, view, &config).unwrap();
        assert_eq!(decision, TrailDecision::Stop(dec!(94885)));
    }

    #[test]
    fn test_confirmation_gate() {
        let (_dir, path) = write_csv(&[row("95100", "95150", "95050")]);
        let config = TrailConfig {
            confirm_buffer_usd: dec!(10),
            ..TrailConfig::default()
        };
        let mut view = TrailView {
            side: Side::Long,
            wait_confirm: true,
            ref_price: Some(dec!(95095)),
        };
        // close 95100 is not > 95095 + 10.
        assert_eq!(
            desired_stop(&path, view, &config).unwrap(),
            TrailDecision::NotReady
        );
        view.ref_price = Some(dec!(95080));
        assert_eq!(
            desired_stop(&path, view, &config).unwrap(),
            TrailDecision::Confirmed
        );
    }

    #[test]
    fn test_swing_stop_far_takes_the_farther() {
        let risk = RiskConfig {
            sl_pct: dec!(0.002),
            swing_mins: 180,
            ..RiskConfig::default()
        };
        let bars = vec![
            Bar {
                close: dec!(95000),
                hi: dec!(95100),
                low: dec!(94500),
            },
            Bar {
                close: dec!(95050),
                hi: dec!(95150),
                low: dec!(94950),
            },
        ];
        // pct stop = 95000 * 0.998 = 94810; swing low 94500 is farther.
        assert_eq!(
            swing_stop_far(&bars, Side::Long, dec!(95000), &risk),
            dec!(94500)
        );
        // Short: pct stop = 95190; swing high 95150 is nearer, keep 95190.
        assert_eq!(
            swing_stop_far(&bars, Side::Short, dec!(95000), &risk),
            dec!(95190.000)
        );
    }
}
