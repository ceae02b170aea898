//! Strategy-level error taxonomy.
//!
//! Recovery policy per variant:
//! - `Config`, `InfeasiblePlan`: fatal before start, operator escalation
//! - `PreconditionFailed`: fatal unless `force_flatten_on_start`
//! - `Exchange`: classified further by [`hedge_exchange::ExchangeError`]
//! - `RiskBreach`: drains and halts the pair via emergency unwind

use thiserror::Error;

use hedge_exchange::ExchangeError;

/// Why the risk loop pulled the plug.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RiskBreach {
    /// Mid price left the ATR channel.
    ChannelBreakout,
    /// Margin ratio on one session exceeded the configured maximum.
    MarginRatio,
    /// Aggregate unrealized loss exceeded the drawdown limit.
    Drawdown,
    /// An executor stayed disconnected beyond the grace period.
    Disconnected,
}

impl std::fmt::Display for RiskBreach {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RiskBreach::ChannelBreakout => write!(f, "channel breakout"),
            RiskBreach::MarginRatio => write!(f, "margin ratio limit"),
            RiskBreach::Drawdown => write!(f, "drawdown limit"),
            RiskBreach::Disconnected => write!(f, "stream disconnected beyond grace"),
        }
    }
}

/// Errors produced by the strategy core.
#[derive(Debug, Error)]
pub enum BotError {
    /// Invalid or missing configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Pre-flight found a non-flat account or mismatched symbol rules.
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    /// The grid engine could not satisfy the minimum notional within its
    /// adaptation budget.
    #[error("infeasible grid plan: {0}")]
    InfeasiblePlan(String),

    /// A risk limit fired.
    #[error("risk breach: {0}")]
    RiskBreach(RiskBreach),

    /// Exchange-layer failure.
    #[error(transparent)]
    Exchange(#[from] ExchangeError),
}
