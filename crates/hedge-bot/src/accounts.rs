//! Dual-account manager.
//!
//! Owns the LONG-side and SHORT-side exchange sessions and exposes the
//! uniform operations the controller needs: initialization, pre-flight
//! flatness checks, balance queries, and best-effort unwind primitives.
//! Executors receive their session handle from here and own it exclusively
//! afterwards; the manager only touches sessions during lifecycle
//! transitions, never on the order hot path.

use std::sync::Arc;

use rust_decimal::Decimal;
use tracing::{info, warn};

use hedge_common::Direction;
use hedge_exchange::{ExchangeSession, SymbolRules};

use crate::error::BotError;

/// Which of the two accounts an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountSide {
    Long,
    Short,
}

impl AccountSide {
    fn name(&self) -> &'static str {
        match self {
            AccountSide::Long => "long",
            AccountSide::Short => "short",
        }
    }
}

/// Holds the two exchange sessions and coordinates account-level operations.
pub struct DualAccountManager {
    long: Arc<dyn ExchangeSession>,
    short: Arc<dyn ExchangeSession>,
    quote_asset: String,
    balance_tolerance_pct: Decimal,
}

impl DualAccountManager {
    pub fn new(
        long: Arc<dyn ExchangeSession>,
        short: Arc<dyn ExchangeSession>,
        quote_asset: impl Into<String>,
        balance_tolerance_pct: Decimal,
    ) -> Self {
        Self {
            long,
            short,
            quote_asset: quote_asset.into(),
            balance_tolerance_pct,
        }
    }

    pub fn session(&self, side: AccountSide) -> Arc<dyn ExchangeSession> {
        match side {
            AccountSide::Long => self.long.clone(),
            AccountSide::Short => self.short.clone(),
        }
    }

    /// Validate connectivity, switch both accounts into hedge position mode,
    /// and fetch the symbol rules, which must match across sessions.
    pub async fn initialize(&self) -> Result<SymbolRules, BotError> {
        let long_rules = self.long.symbol_rules().await?;
        let short_rules = self.short.symbol_rules().await?;
        if long_rules != short_rules {
            return Err(BotError::PreconditionFailed(format!(
                "symbol rules differ across sessions: {:?} vs {:?}",
                long_rules, short_rules
            )));
        }

        self.long.set_hedge_mode().await?;
        self.short.set_hedge_mode().await?;

        info!(
            symbol = %long_rules.symbol,
            tick = %long_rules.tick_size,
            lot = %long_rules.lot_size,
            min_notional = %long_rules.min_notional,
            "accounts initialized in hedge mode"
        );
        Ok(long_rules)
    }

    /// Apply the plan's leverage to both sessions.
    pub async fn apply_leverage(&self, leverage: u32) -> Result<(), BotError> {
        self.long.set_leverage(leverage).await?;
        self.short.set_leverage(leverage).await?;
        Ok(())
    }

    /// Require both accounts flat (no orders, no positions) before the
    /// strategy starts. With `force_flatten` the accounts are flattened
    /// instead of refused.
    pub async fn pre_flight(&self, force_flatten: bool) -> Result<(), BotError> {
        for side in [AccountSide::Long, AccountSide::Short] {
            let session = self.session(side);
            let open_orders = session.open_orders().await?;
            let positions = session.positions().await?;
            let flat = open_orders.is_empty() && positions.iter().all(|p| p.is_flat());

            if flat {
                continue;
            }
            if !force_flatten {
                return Err(BotError::PreconditionFailed(format!(
                    "{} account not flat: {} open orders, {} position rows",
                    side.name(),
                    open_orders.len(),
                    positions.iter().filter(|p| !p.is_flat()).count()
                )));
            }
            warn!(account = side.name(), "account not flat, force-flattening");
            self.cancel_all(side).await?;
            self.close_all(side).await?;
        }
        Ok(())
    }

    /// Both wallet balances in the quote asset.
    pub async fn balances(&self) -> Result<(Decimal, Decimal), BotError> {
        let long = self.long.balance(&self.quote_asset).await?;
        let short = self.short.balance(&self.quote_asset).await?;
        Ok((long, short))
    }

    /// The smaller of the two balances, so both sides can fund the grid
    /// identically. Logs a warning when the skew exceeds tolerance.
    pub async fn funding_balance(&self) -> Result<Decimal, BotError> {
        let (long, short) = self.balances().await?;
        if !balances_equal_within(long, short, self.balance_tolerance_pct) {
            warn!(
                long_balance = %long,
                short_balance = %short,
                tolerance_pct = %self.balance_tolerance_pct,
                "cross-session balance skew exceeds tolerance"
            );
        }
        Ok(long.min(short))
    }

    /// Cancel every resting order on one account. Idempotent.
    pub async fn cancel_all(&self, side: AccountSide) -> Result<(), BotError> {
        self.session(side).cancel_all().await?;
        Ok(())
    }

    /// Close every open position on one account with reduce-only market
    /// orders. Idempotent: a flat account is a no-op.
    pub async fn close_all(&self, side: AccountSide) -> Result<(), BotError> {
        let session = self.session(side);
        let positions = session.positions().await?;
        for position in positions.iter().filter(|p| !p.is_flat()) {
            let direction = match position.position_side.as_str() {
                "LONG" => Direction::Long,
                "SHORT" => Direction::Short,
                other => {
                    warn!(position_side = other, "unknown position side, skipping close");
                    continue;
                }
            };
            session
                .close_position_market(direction, position.qty.abs())
                .await?;
        }
        Ok(())
    }

    /// Best-effort unwind of both accounts: cancel everything, then flatten.
    /// Continues past per-account failures and returns the first error.
    pub async fn unwind_both(&self) -> Result<(), BotError> {
        let mut first_error = None;
        for side in [AccountSide::Long, AccountSide::Short] {
            if let Err(e) = self.cancel_all(side).await {
                warn!(account = side.name(), error = %e, "cancel-all failed during unwind");
                first_error.get_or_insert(e);
            }
            if let Err(e) = self.close_all(side).await {
                warn!(account = side.name(), error = %e, "close-all failed during unwind");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    /// Whether both accounts currently hold no orders and no positions.
    pub async fn verify_flat(&self) -> Result<bool, BotError> {
        for side in [AccountSide::Long, AccountSide::Short] {
            let session = self.session(side);
            if !session.open_orders().await?.is_empty() {
                return Ok(false);
            }
            if session.positions().await?.iter().any(|p| !p.is_flat()) {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// Relative skew between two balances stays within `tolerance_pct`.
pub fn balances_equal_within(a: Decimal, b: Decimal, tolerance_pct: Decimal) -> bool {
    let larger = a.max(b);
    if larger <= Decimal::ZERO {
        return true;
    }
    (a - b).abs() / larger <= tolerance_pct
}
