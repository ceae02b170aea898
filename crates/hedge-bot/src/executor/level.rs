//! Grid levels, their lifecycle states, and order tracking.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

use hedge_common::quantize::{ceil_to_lot, round_to_tick, snap_qty};
use hedge_common::Side;
use hedge_exchange::{OrderStatus, SymbolRules};

use crate::engine::GridPlan;

/// Lifecycle of one grid level within an epoch.
///
/// ```text
/// NOT_ACTIVE ─place open─► OPEN_ORDER_PLACED ─fill─► OPEN_ORDER_FILLED
///     ▲                        │cancel                    │place close
///     └────────────────────────┘                          ▼
///     ▲                                          CLOSE_ORDER_PLACED
///     │                                                   │fill
///     └──────────────recycle───────────── COMPLETE ◄──────┘
///
/// FAILED is terminal within the epoch.
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LevelState {
    NotActive,
    OpenOrderPlaced,
    OpenOrderFilled,
    CloseOrderPlaced,
    Complete,
    Failed,
}

impl LevelState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LevelState::NotActive => "NOT_ACTIVE",
            LevelState::OpenOrderPlaced => "OPEN_ORDER_PLACED",
            LevelState::OpenOrderFilled => "OPEN_ORDER_FILLED",
            LevelState::CloseOrderPlaced => "CLOSE_ORDER_PLACED",
            LevelState::Complete => "COMPLETE",
            LevelState::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for LevelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A live order the executor is responsible for.
#[derive(Debug, Clone)]
pub struct TrackedOrder {
    pub order_id: i64,
    pub client_order_id: String,
    pub level_id: u32,
    pub side: Side,
    pub price: Decimal,
    pub qty: Decimal,
    pub cum_filled_qty: Decimal,
    pub avg_fill_price: Decimal,
    pub status: OrderStatus,
    pub placed_at: DateTime<Utc>,
}

/// One price point in the ladder with its lifecycle state.
#[derive(Debug, Clone)]
pub struct GridLevel {
    /// Stable within an epoch.
    pub level_id: u32,
    /// Snapped to tick.
    pub price: Decimal,
    /// Snapped to lot; satisfies the min-notional floor.
    pub quantity: Decimal,
    pub state: LevelState,
    pub open_order: Option<TrackedOrder>,
    pub close_order: Option<TrackedOrder>,
    pub filled_at_price: Option<Decimal>,
    pub filled_qty: Option<Decimal>,
    pub filled_at_time: Option<DateTime<Utc>>,
    /// Bumped on every cancel-and-resubmit and on recycle, so client order
    /// ids never repeat within an epoch.
    pub generation: u32,
}

impl GridLevel {
    pub fn new(level_id: u32, price: Decimal, quantity: Decimal) -> Self {
        Self {
            level_id,
            price,
            quantity,
            state: LevelState::NotActive,
            open_order: None,
            close_order: None,
            filled_at_price: None,
            filled_qty: None,
            filled_at_time: None,
            generation: 0,
        }
    }

    /// Whether the level has a live order or an open position.
    pub fn is_active(&self) -> bool {
        matches!(
            self.state,
            LevelState::OpenOrderPlaced | LevelState::OpenOrderFilled | LevelState::CloseOrderPlaced
        )
    }

    /// Recycle a completed level so the price point can trade again.
    pub fn recycle(&mut self) {
        debug_assert_eq!(self.state, LevelState::Complete);
        self.state = LevelState::NotActive;
        self.open_order = None;
        self.close_order = None;
        self.filled_at_price = None;
        self.filled_qty = None;
        self.filled_at_time = None;
        self.generation += 1;
    }

    /// Return an `OPEN_ORDER_PLACED` level to `NOT_ACTIVE` after a cancel.
    pub fn release_open(&mut self) {
        self.state = LevelState::NotActive;
        self.open_order = None;
        self.generation += 1;
    }

    /// Mark the level failed for the remainder of the epoch.
    pub fn fail(&mut self) {
        self.state = LevelState::Failed;
    }
}

/// Client order id carrying `(epoch, level, generation)` for idempotent
/// reconciliation. Format: `hg<epoch>-<level>-<generation>`.
pub fn client_order_id(epoch_id: u64, level_id: u32, generation: u32) -> String {
    format!("hg{}-{}-{}", epoch_id, level_id, generation)
}

/// Parse a client order id produced by [`client_order_id`].
pub fn parse_client_order_id(id: &str) -> Option<(u64, u32, u32)> {
    let rest = id.strip_prefix("hg")?;
    let mut parts = rest.split('-');
    let epoch = parts.next()?.parse().ok()?;
    let level = parts.next()?.parse().ok()?;
    let generation = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((epoch, level, generation))
}

/// Build the epoch's ladder from a plan.
///
/// Levels sit at `lower + i·spacing` for `i` in `0..levels_count`, so the
/// bottom level rests exactly on the channel boundary; admission excludes it
/// via strict containment. Quantities derive from the per-level notional,
/// snapped down to lot and lifted to the min-notional floor.
pub fn build_levels(plan: &GridPlan, rules: &SymbolRules) -> Vec<GridLevel> {
    (0..plan.levels_count)
        .map(|i| {
            let price = round_to_tick(
                plan.lower + plan.spacing * Decimal::from(i as u64),
                rules.tick_size,
            );
            let mut qty = snap_qty(plan.notional_per_level / price, rules.lot_size);
            if qty * price < rules.min_notional {
                qty = ceil_to_lot(rules.min_notional / price, rules.lot_size);
            }
            GridLevel::new(i as u32, price, qty)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn plan() -> GridPlan {
        GridPlan {
            epoch_id: 1,
            upper: dec!(1.05),
            lower: dec!(0.95),
            spacing: dec!(0.0026),
            levels_count: 8,
            notional_per_level: dec!(10),
            usable_leverage: 10,
            stop_upper: dec!(1.05),
            stop_lower: dec!(0.95),
            computed_at: Utc::now(),
        }
    }

    fn rules() -> SymbolRules {
        SymbolRules {
            symbol: "DOGEUSDC".into(),
            tick_size: dec!(0.00001),
            lot_size: dec!(1),
            min_notional: dec!(5),
        }
    }

    #[test]
    fn test_ladder_geometry() {
        let levels = build_levels(&plan(), &rules());
        assert_eq!(levels.len(), 8);
        assert_eq!(levels[0].price, dec!(0.95));
        assert_eq!(levels[1].price, dec!(0.9526));
        // Uniform spacing across the ladder.
        for pair in levels.windows(2) {
            assert_eq!(pair[1].price - pair[0].price, dec!(0.0026));
        }
        // Top of ladder stays strictly below the upper bound.
        assert!(levels.last().unwrap().price < dec!(1.05));
    }

    #[test]
    fn test_quantity_satisfies_min_notional() {
        let levels = build_levels(&plan(), &rules());
        for level in &levels {
            assert!(level.quantity * level.price >= dec!(5));
            // Lot-exact.
            assert_eq!(level.quantity, snap_qty(level.quantity, dec!(1)));
        }
    }

    #[test]
    fn test_quantity_lifted_to_min_notional() {
        let mut p = plan();
        p.notional_per_level = dec!(5); // 5 / 0.95 = 5.26 → floor 5 → 4.75 < 5
        let levels = build_levels(&p, &rules());
        let bottom = &levels[0];
        assert_eq!(bottom.quantity, dec!(6));
        assert!(bottom.quantity * bottom.price >= dec!(5));
    }

    #[test]
    fn test_recycle_resets_but_keeps_identity() {
        let mut level = GridLevel::new(3, dec!(1), dec!(10));
        level.state = LevelState::Complete;
        level.filled_at_price = Some(dec!(1));
        let generation = level.generation;

        level.recycle();
        assert_eq!(level.state, LevelState::NotActive);
        assert_eq!(level.level_id, 3);
        assert!(level.filled_at_price.is_none());
        assert_eq!(level.generation, generation + 1);
    }

    #[test]
    fn test_client_order_id_round_trip() {
        let id = client_order_id(7, 13, 2);
        assert_eq!(id, "hg7-13-2");
        assert_eq!(parse_client_order_id(&id), Some((7, 13, 2)));
        assert_eq!(parse_client_order_id("hg7-13"), None);
        assert_eq!(parse_client_order_id("xx7-13-2"), None);
        assert_eq!(parse_client_order_id("hg7-13-2-9"), None);
    }

    #[test]
    fn test_is_active() {
        let mut level = GridLevel::new(0, dec!(1), dec!(10));
        assert!(!level.is_active());
        level.state = LevelState::OpenOrderPlaced;
        assert!(level.is_active());
        level.state = LevelState::Failed;
        assert!(!level.is_active());
    }
}
