//! The uniform per-account exchange API the strategy core consumes.

use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::sync::{mpsc, watch};

use hedge_common::{Candle, Direction, PositionAction, Side};

use crate::error::ExchangeError;
use crate::types::{
    AccountOverview, BookTicker, LeverageBracket, OpenOrder, OrderAck, PositionInfo, SymbolRules,
    UserStreamEvent,
};

/// Result alias for session calls.
pub type SessionResult<T> = Result<T, ExchangeError>;

/// One authenticated account on a perpetual-futures exchange, bound to a
/// single symbol for the lifetime of the session.
///
/// ## Contract
///
/// - All prices and quantities passed in must already be snapped to the
///   symbol's tick/lot; the session transmits them verbatim.
/// - Rate limiting is internal: callers may assume each call either succeeds
///   or fails deterministically within a bounded time (default 10 s), after
///   which it returns `Timeout`.
/// - Transient failures are retried internally with exponential backoff
///   before surfacing.
/// - The user stream is self-healing: on disconnect it reconnects with
///   backoff, re-keys authentication, and emits [`UserStreamEvent::Resync`]
///   so consumers reconcile via snapshot queries.
#[async_trait]
pub trait ExchangeSession: Send + Sync {
    /// Symbol this session trades.
    fn symbol(&self) -> &str;

    /// Place a GTC limit order. `client_id` must be unique per attempt;
    /// `action` selects the hedge-mode position side and reduce-only flag
    /// together with `direction`.
    async fn place_limit_order(
        &self,
        direction: Direction,
        action: PositionAction,
        side: Side,
        qty: Decimal,
        price: Decimal,
        client_id: &str,
    ) -> SessionResult<OrderAck>;

    /// Cancel one resting order.
    async fn cancel_order(&self, order_id: i64) -> SessionResult<()>;

    /// Cancel every resting order on the symbol. Idempotent.
    async fn cancel_all(&self) -> SessionResult<()>;

    /// Close a position with a reduce-only market order.
    async fn close_position_market(&self, direction: Direction, qty: Decimal) -> SessionResult<()>;

    /// Snapshot of resting orders.
    async fn open_orders(&self) -> SessionResult<Vec<OpenOrder>>;

    /// Snapshot of positions (both hedge sides).
    async fn positions(&self) -> SessionResult<Vec<PositionInfo>>;

    /// Wallet balance of one asset.
    async fn balance(&self, asset: &str) -> SessionResult<Decimal>;

    /// Aggregate margin figures for the account.
    async fn account_overview(&self) -> SessionResult<AccountOverview>;

    /// Set the symbol's leverage.
    async fn set_leverage(&self, leverage: u32) -> SessionResult<()>;

    /// Switch the account into hedge (dual-side) position mode. Idempotent:
    /// a "no change needed" rejection is treated as success.
    async fn set_hedge_mode(&self) -> SessionResult<()>;

    /// Historical OHLCV bars, oldest first.
    async fn fetch_ohlcv(&self, timeframe: &str, limit: u32) -> SessionResult<Vec<Candle>>;

    /// The symbol's tick/lot/min-notional rules.
    async fn symbol_rules(&self) -> SessionResult<SymbolRules>;

    /// The symbol's leverage-bracket table, ascending by notional floor.
    async fn leverage_brackets(&self) -> SessionResult<Vec<LeverageBracket>>;

    /// Start the private user-data stream. Events arrive in exchange order;
    /// the channel is single-consumer.
    async fn subscribe_user_stream(&self) -> SessionResult<mpsc::Receiver<UserStreamEvent>>;

    /// Start the public book-ticker stream. The watch channel always holds
    /// the latest quote (None until the first tick).
    async fn subscribe_book_ticker(&self) -> SessionResult<watch::Receiver<Option<BookTicker>>>;
}
