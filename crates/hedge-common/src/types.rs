//! Core market types shared across the workspace.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Order side on the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// Returns the exchange wire name ("BUY" / "SELL").
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }

    /// The opposite side.
    pub fn opposite(&self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Whether an order opens or reduces a position.
///
/// In hedge position mode the exchange distinguishes the two via the
/// position side plus the reduce-only flag; the session maps this enum
/// accordingly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionAction {
    Open,
    Close,
}

impl std::fmt::Display for PositionAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PositionAction::Open => write!(f, "OPEN"),
            PositionAction::Close => write!(f, "CLOSE"),
        }
    }
}

/// Grid direction: one account runs a LONG-only grid, the other SHORT-only.
///
/// All direction-dependent behavior in the executor flows through the four
/// pure functions below; the state machine itself is direction-agnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    /// Side used to open a position at a grid level.
    #[inline]
    pub fn open_side(&self) -> Side {
        match self {
            Direction::Long => Side::Buy,
            Direction::Short => Side::Sell,
        }
    }

    /// Side used to close (take profit on) a filled level.
    #[inline]
    pub fn close_side(&self) -> Side {
        self.open_side().opposite()
    }

    /// Take-profit price for a position entered at `entry`.
    ///
    /// LONG closes one spacing above the entry, SHORT one spacing below,
    /// so the realized spread per round-trip equals the grid spacing.
    #[inline]
    pub fn close_price(&self, entry: Decimal, spacing: Decimal) -> Decimal {
        match self {
            Direction::Long => entry + spacing,
            Direction::Short => entry - spacing,
        }
    }

    /// Whether a resting open order at `limit` would cross the book and
    /// fill immediately as a taker.
    #[inline]
    pub fn crosses_book(&self, limit: Decimal, best_bid: Decimal, best_ask: Decimal) -> bool {
        match self {
            Direction::Long => limit >= best_ask,
            Direction::Short => limit <= best_bid,
        }
    }

    /// Hedge-mode position side string on the wire.
    pub fn position_side(&self) -> &'static str {
        match self {
            Direction::Long => "LONG",
            Direction::Short => "SHORT",
        }
    }

    /// +1 for LONG, -1 for SHORT; multiplies (exit - entry) into PnL.
    #[inline]
    pub fn pnl_sign(&self) -> Decimal {
        match self {
            Direction::Long => Decimal::ONE,
            Direction::Short => Decimal::NEGATIVE_ONE,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.position_side())
    }
}

/// One OHLCV bar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candle {
    /// Bar open time.
    pub open_time: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

impl Candle {
    /// True range against the previous close.
    pub fn true_range(&self, prev_close: Decimal) -> Decimal {
        let hl = self.high - self.low;
        let hc = (self.high - prev_close).abs();
        let lc = (self.low - prev_close).abs();
        hl.max(hc).max(lc)
    }
}
