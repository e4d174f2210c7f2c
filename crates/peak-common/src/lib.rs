//! Shared primitives for the PEAK execution engine.
//!
//! CRITICAL: All prices and quantities use `rust_decimal::Decimal`.
//! NEVER use f64 for financial math.

pub mod steps;
pub mod types;

pub use steps::{
    ceil_to_step, decimals_from_step, floor_to_step, fmt_amount, fmt_price, fmt_qty,
    round_nearest_to_step, split_three_legs, LegSplit, SplitError,
};
pub use types::{OrderSide, Side};
