//! Tick/lot quantisation with side-conservative rounding.
//!
//! Every price and quantity that crosses the order boundary must be an
//! exact multiple of the symbol's tick/lot. Rounding is always toward the
//! conservative direction for the side: a BUY price rounds down, a SELL
//! price rounds up, and quantities round down. Snapping is idempotent.

use rust_decimal::Decimal;

use crate::types::Side;

/// Snap a price to the tick grid, conservatively for `side`.
///
/// BUY prices round down (never bid above the intended level), SELL prices
/// round up (never offer below it). A non-positive tick returns the input
/// unchanged.
pub fn snap_price(price: Decimal, tick: Decimal, side: Side) -> Decimal {
    if tick <= Decimal::ZERO {
        return price;
    }
    let steps = price / tick;
    let snapped = match side {
        Side::Buy => steps.floor(),
        Side::Sell => steps.ceil(),
    };
    snapped * tick
}

/// Round a value to the nearest tick multiple (banker's rounding at the
/// midpoint).
///
/// Used for derived magnitudes such as grid spacing, where neither
/// direction is conservative.
pub fn round_to_tick(value: Decimal, tick: Decimal) -> Decimal {
    if tick <= Decimal::ZERO {
        return value;
    }
    (value / tick).round() * tick
}

/// Snap a quantity down to the lot grid.
pub fn snap_qty(qty: Decimal, lot: Decimal) -> Decimal {
    if lot <= Decimal::ZERO {
        return qty;
    }
    (qty / lot).floor() * lot
}

/// Round a quantity up to the next lot multiple.
///
/// Used to satisfy minimum-notional floors.
pub fn ceil_to_lot(qty: Decimal, lot: Decimal) -> Decimal {
    if lot <= Decimal::ZERO {
        return qty;
    }
    (qty / lot).ceil() * lot
}
