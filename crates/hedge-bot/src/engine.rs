//! Shared grid parameter engine.
//!
//! Fuses the ATR channel, the smaller of the two account balances, the
//! symbol rules, and the grid configuration into one immutable [`GridPlan`].
//! The plan is the single source of truth feeding both executors; replacing
//! it is a whole-executor reset under a fresh epoch, never an in-place edit.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;
use tracing::{debug, info};

use hedge_common::quantize::round_to_tick;
use hedge_exchange::{bracket_for, LeverageBracket, SymbolRules};

use crate::atr::AtrResult;
use crate::config::GridConfig;
use crate::error::BotError;

/// Self-adaptation budget: spacing multiplier grows ×1.1 per retry until the
/// per-level notional clears the exchange minimum.
const MAX_ADAPTATION_ITERATIONS: u32 = 10;
const MAX_SPACING_MULTIPLIER: Decimal = dec!(5.0);
const ADAPTATION_GROWTH: Decimal = dec!(1.1);

/// Anti-degeneracy clamps on spacing as a fraction of current price.
const MIN_SPACING_FRACTION: Decimal = dec!(0.001);
const MAX_SPACING_FRACTION: Decimal = dec!(0.05);

/// One epoch's immutable grid parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GridPlan {
    /// Monotonic identifier; bumped on every reset.
    pub epoch_id: u64,
    /// Absolute channel bounds.
    pub upper: Decimal,
    pub lower: Decimal,
    /// Price step between adjacent levels, identical across the ladder.
    pub spacing: Decimal,
    /// Ladder size, clamped to `[1, max_open_orders · 2]`.
    pub levels_count: usize,
    /// Quote-asset notional committed per opened level.
    pub notional_per_level: Decimal,
    /// Leverage the plan assumes on both sessions.
    pub usable_leverage: u32,
    /// Hard stop prices; crossing either triggers a full unwind.
    pub stop_upper: Decimal,
    pub stop_lower: Decimal,
    pub computed_at: DateTime<Utc>,
}

impl GridPlan {
    /// Channel midpoint.
    pub fn mid(&self) -> Decimal {
        (self.upper + self.lower) / Decimal::TWO
    }
}

/// Plan parameters before epoch tagging; output of the pure derivation.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PlanParams {
    upper: Decimal,
    lower: Decimal,
    spacing: Decimal,
    levels_count: usize,
    notional_per_level: Decimal,
    usable_leverage: u32,
}

/// Derives grid plans and hands out monotonic epoch ids.
pub struct SharedGridEngine {
    config: GridConfig,
    epoch_counter: AtomicU64,
}

impl SharedGridEngine {
    pub fn new(config: GridConfig) -> Self {
        Self {
            config,
            epoch_counter: AtomicU64::new(1),
        }
    }

    /// Build the next plan.
    ///
    /// `balance` must already be the smaller of the two account balances so
    /// both sides can fund the ladder identically.
    pub fn build_plan(
        &self,
        atr: &AtrResult,
        balance: Decimal,
        current_price: Decimal,
        rules: &SymbolRules,
        brackets: &[LeverageBracket],
    ) -> Result<GridPlan, BotError> {
        let params = derive_plan(&self.config, atr, balance, current_price, rules, brackets)?;
        let epoch_id = self.epoch_counter.fetch_add(1, Ordering::SeqCst);

        let plan = GridPlan {
            epoch_id,
            upper: params.upper,
            lower: params.lower,
            spacing: params.spacing,
            levels_count: params.levels_count,
            notional_per_level: params.notional_per_level,
            usable_leverage: params.usable_leverage,
            stop_upper: params.upper,
            stop_lower: params.lower,
            computed_at: Utc::now(),
        };

        info!(
            epoch = plan.epoch_id,
            upper = %plan.upper,
            lower = %plan.lower,
            spacing = %plan.spacing,
            levels = plan.levels_count,
            notional_per_level = %plan.notional_per_level,
            leverage = plan.usable_leverage,
            "grid plan published"
        );
        Ok(plan)
    }
}

/// Pure plan derivation: same inputs, same output.
fn derive_plan(
    config: &GridConfig,
    atr: &AtrResult,
    balance: Decimal,
    current_price: Decimal,
    rules: &SymbolRules,
    brackets: &[LeverageBracket],
) -> Result<PlanParams, BotError> {
    if balance <= Decimal::ZERO {
        return Err(BotError::InfeasiblePlan("account balance is zero".into()));
    }
    if current_price <= Decimal::ZERO {
        return Err(BotError::InfeasiblePlan("current price is zero".into()));
    }

    let upper = atr.upper_bound;
    let lower = atr.lower_bound;
    let mid = (upper + lower) / Decimal::TWO;
    let max_levels = config.max_open_orders.max(1) * 2;

    let mut multiplier = config.spacing_multiplier;
    for iteration in 0..MAX_ADAPTATION_ITERATIONS {
        if multiplier > MAX_SPACING_MULTIPLIER {
            break;
        }

        // Spacing: ATR fraction, snapped to tick, clamped against degeneracy.
        let raw = atr.atr * multiplier;
        let clamped = raw
            .max(current_price * MIN_SPACING_FRACTION)
            .min(current_price * MAX_SPACING_FRACTION);
        let spacing = round_to_tick(clamped, rules.tick_size).max(rules.tick_size);

        // Ladder size.
        let raw_levels = ((upper - lower) / spacing)
            .floor()
            .to_usize()
            .unwrap_or(0);
        let levels_count = raw_levels.clamp(1, max_levels);

        // Leverage: bracket MMR for the notional tier the configured cap
        // would produce, haircut by the safety factor, clamped to both the
        // configured and the bracket's maximum.
        let estimated_notional =
            balance * config.utilization_ratio * Decimal::from(config.max_leverage_limit);
        let (mmr, bracket_cap) = match bracket_for(brackets, estimated_notional) {
            Some(b) => (b.maintenance_margin_ratio, b.max_leverage),
            None => (Decimal::ZERO, config.max_leverage_limit),
        };

        let denom = Decimal::ONE + mmr - lower / mid;
        let l_max = if denom > Decimal::ZERO {
            Decimal::ONE / denom
        } else {
            Decimal::ONE
        };
        let usable_leverage = (l_max * config.safety_factor)
            .floor()
            .to_u32()
            .unwrap_or(1)
            .clamp(1, config.max_leverage_limit.min(bracket_cap));

        // Funding.
        let total_notional =
            balance * config.utilization_ratio * Decimal::from(usable_leverage);
        let notional_per_level = total_notional / Decimal::from(levels_count as u64);

        if notional_per_level >= rules.min_notional {
            return Ok(PlanParams {
                upper,
                lower,
                spacing,
                levels_count,
                notional_per_level,
                usable_leverage,
            });
        }

        debug!(
            iteration,
            multiplier = %multiplier,
            notional_per_level = %notional_per_level,
            min_notional = %rules.min_notional,
            "per-level notional below exchange minimum, widening spacing"
        );
        multiplier *= ADAPTATION_GROWTH;
    }

    Err(BotError::InfeasiblePlan(format!(
        "per-level notional below min_notional {} after {} adaptation iterations",
        rules.min_notional, MAX_ADAPTATION_ITERATIONS
    )))
}
