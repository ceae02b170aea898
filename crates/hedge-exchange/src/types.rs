//! Wire and snapshot types produced by an [`crate::ExchangeSession`].
//!
//! All decimal fields are parsed from the exchange's string payloads with
//! `Decimal::from_str` so the exact quoted value is preserved.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use hedge_common::Side;

/// Immutable per-symbol trading rules, fetched once per run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolRules {
    /// Exchange symbol, e.g. "DOGEUSDC".
    pub symbol: String,
    /// Price increment.
    pub tick_size: Decimal,
    /// Quantity increment.
    pub lot_size: Decimal,
    /// Minimum order notional in the quote asset.
    pub min_notional: Decimal,
}

/// One row of the leverage-bracket table.
///
/// Brackets partition position notional into tiers; each tier carries the
/// maintenance margin ratio and the maximum leverage the exchange permits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeverageBracket {
    pub notional_floor: Decimal,
    pub notional_cap: Decimal,
    pub maintenance_margin_ratio: Decimal,
    pub max_leverage: u32,
}

/// Find the bracket covering `notional`.
///
/// Falls back to the last bracket when the notional exceeds every cap,
/// and to the first when the table is unsorted garbage.
pub fn bracket_for(brackets: &[LeverageBracket], notional: Decimal) -> Option<&LeverageBracket> {
    brackets
        .iter()
        .find(|b| notional >= b.notional_floor && notional < b.notional_cap)
        .or_else(|| brackets.last())
}

/// Exchange-reported order status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    Expired,
}

impl OrderStatus {
    /// Parse the exchange wire string; unknown strings map to `New`.
    pub fn from_wire(s: &str) -> Self {
        match s {
            "NEW" => OrderStatus::New,
            "PARTIALLY_FILLED" => OrderStatus::PartiallyFilled,
            "FILLED" => OrderStatus::Filled,
            "CANCELED" => OrderStatus::Canceled,
            "REJECTED" => OrderStatus::Rejected,
            "EXPIRED" => OrderStatus::Expired,
            _ => OrderStatus::New,
        }
    }

    /// True once the exchange will never touch this order again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Canceled | OrderStatus::Rejected | OrderStatus::Expired
        )
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OrderStatus::New => "NEW",
            OrderStatus::PartiallyFilled => "PARTIALLY_FILLED",
            OrderStatus::Filled => "FILLED",
            OrderStatus::Canceled => "CANCELED",
            OrderStatus::Rejected => "REJECTED",
            OrderStatus::Expired => "EXPIRED",
        };
        write!(f, "{}", s)
    }
}

/// Acknowledgement returned by a successful order placement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: i64,
    pub client_order_id: String,
    pub side: Side,
    pub price: Decimal,
    pub qty: Decimal,
    pub status: OrderStatus,
}

/// One resting order from an open-orders snapshot query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenOrder {
    pub order_id: i64,
    pub client_order_id: String,
    pub side: Side,
    pub price: Decimal,
    pub orig_qty: Decimal,
    pub executed_qty: Decimal,
    pub status: OrderStatus,
}

/// An order event from the user data stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderUpdate {
    pub order_id: i64,
    pub client_order_id: String,
    pub side: Side,
    pub status: OrderStatus,
    /// Original limit price.
    pub price: Decimal,
    /// Quantity filled by the triggering execution.
    pub last_fill_qty: Decimal,
    /// Cumulative filled quantity.
    pub cum_filled_qty: Decimal,
    /// Average fill price over all executions (zero until the first fill).
    pub avg_fill_price: Decimal,
    pub event_time: DateTime<Utc>,
}

/// A balance change from the user data stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceUpdate {
    pub asset: String,
    pub wallet_balance: Decimal,
}

/// A position change from the user data stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionUpdate {
    /// "LONG" or "SHORT" in hedge mode.
    pub position_side: String,
    pub qty: Decimal,
    pub entry_price: Decimal,
    pub unrealized_pnl: Decimal,
}

/// Events delivered by the private user data stream.
///
/// `Resync` is synthetic: the stream reader emits it after every reconnect
/// so consumers re-snapshot open orders and positions instead of trusting
/// local state across the gap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum UserStreamEvent {
    Order(OrderUpdate),
    Balance(BalanceUpdate),
    Position(PositionUpdate),
    Resync,
}

/// Best bid/ask snapshot from the public book-ticker stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookTicker {
    pub best_bid: Decimal,
    pub best_ask: Decimal,
    pub event_time: DateTime<Utc>,
}

impl BookTicker {
    /// Mid price between best bid and ask.
    #[inline]
    pub fn mid(&self) -> Decimal {
        (self.best_bid + self.best_ask) / Decimal::TWO
    }
}

/// One position row from a positions snapshot query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionInfo {
    pub position_side: String,
    pub qty: Decimal,
    pub entry_price: Decimal,
    pub unrealized_pnl: Decimal,
    pub leverage: u32,
}

impl PositionInfo {
    /// True if this row carries no exposure.
    pub fn is_flat(&self) -> bool {
        self.qty == Decimal::ZERO
    }
}

/// Aggregate account margin figures used by the risk loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountOverview {
    /// Total margin balance in the quote asset.
    pub margin_balance: Decimal,
    /// Total maintenance margin required.
    pub maintenance_margin: Decimal,
    /// Total unrealized PnL across positions.
    pub unrealized_pnl: Decimal,
}

impl AccountOverview {
    /// Maintenance margin / margin balance; 0 when the account is empty.
    pub fn margin_ratio(&self) -> Decimal {
        if self.margin_balance <= Decimal::ZERO {
            Decimal::ZERO
        } else {
            self.maintenance_margin / self.margin_balance
        }
    }
}
