//! Single-position execution engine for PEAK entry signals.
//!
//! The engine consumes externally generated PEAK events from an append-only
//! signal log and manages the full lifecycle of at most one open position:
//! entry placement, the three-leg exit structure (stop-loss + two
//! take-profits), break-even and trailing stop maintenance, margin
//! borrow/repay coordination, and reconciliation with exchange truth after
//! restarts.
//!
//! ## Architecture
//!
//! ```text
//! [signal log] -> [dedup] -> [engine tick] -> [exchange adapter] -> venue
//!                                |   \
//!                      [exit-safety planner]  [state store (atomic)]
//!                                |
//!                        [invariant detectors] -> event log / webhook
//! ```
//!
//! The tick is strictly serialized: one task, one position, one writer.
//! Watchdog *planning* is pure ([`exit_safety`]); the tick executes plans.

pub mod config;
pub mod dedup;
pub mod engine;
pub mod exchange;
pub mod exit_safety;
pub mod invariants;
pub mod margin;
pub mod notify;
pub mod signal;
pub mod snapshot;
pub mod state;
pub mod tail;
pub mod trail;
pub mod types;
