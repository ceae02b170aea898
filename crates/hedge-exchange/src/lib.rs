//! Exchange access for the hedge-grid engine.
//!
//! This crate defines the uniform per-account API the strategy core consumes
//! (`ExchangeSession`) together with its wire types and error taxonomy, and
//! provides two implementations:
//!
//! - [`BinanceFuturesSession`]: signed REST + self-healing WebSocket streams
//!   against a Binance-style USDⓈ-M perpetual-futures API
//! - [`MockSession`]: scripted in-memory double for tests
//!
//! Callers must pass prices/quantities already snapped to tick/lot; the
//! session never re-rounds. Exchange rejections surface as typed errors.

pub mod error;
pub mod mock;
pub mod rest;
pub mod session;
pub mod stream;
pub mod types;

pub use error::ExchangeError;
pub use mock::{MockSession, PlacedOrder};
pub use rest::{BinanceFuturesSession, SessionConfig};
pub use session::ExchangeSession;
pub use types::{
    bracket_for, AccountOverview, BalanceUpdate, BookTicker, LeverageBracket, OpenOrder, OrderAck,
    OrderStatus, OrderUpdate, PositionInfo, PositionUpdate, SymbolRules, UserStreamEvent,
};
