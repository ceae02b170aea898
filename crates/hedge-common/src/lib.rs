//! Shared types and utilities for the hedge-grid trading engine.
//!
//! CRITICAL: All prices and quantities use `rust_decimal::Decimal`.
//! NEVER use f64 for financial math.
//!
//! This crate contains:
//! - Common types (`Side`, `Direction`, `PositionAction`, `Candle`)
//! - Tick/lot quantisation helpers with side-conservative rounding

pub mod quantize;
pub mod types;

pub use quantize::{ceil_to_lot, round_to_tick, snap_price, snap_qty};
pub use types::{Candle, Direction, PositionAction, Side};
