//! Direction-polymorphic grid executor.
//!
//! One executor owns one account's ladder. Its control tick runs on a timer
//! and on every user-stream event, performing in order: reconcile pending
//! order updates, place close orders for filled levels, recycle completed
//! levels, admit and place new open orders, and cancel stale ones. All
//! direction-dependent behavior flows through the four pure functions on
//! [`Direction`]; the state machine itself is direction-agnostic.

mod level;

pub use level::{
    build_levels, client_order_id, parse_client_order_id, GridLevel, LevelState, TrackedOrder,
};

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use hedge_common::quantize::{snap_price, snap_qty};
use hedge_common::{Direction, PositionAction};
use hedge_exchange::{
    BookTicker, ExchangeError, ExchangeSession, OrderStatus, OrderUpdate, SymbolRules,
    UserStreamEvent,
};

use crate::audit::{AuditEvent, AuditLog};
use crate::config::GridConfig;
use crate::engine::GridPlan;
use crate::state::{ControlState, ExecutorShared, StatusSnapshot};

/// Admission policy and timing knobs for one executor.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub max_open_orders: usize,
    pub max_orders_per_batch: usize,
    pub order_frequency: Duration,
    pub activation_bounds_pct: Decimal,
    pub upper_lower_ratio: Decimal,
    pub safe_extra_spread: Decimal,
    pub order_timeout: Duration,
    /// Control loop cadence.
    pub tick_interval: Duration,
}

impl ExecutorConfig {
    pub fn from_grid(grid: &GridConfig) -> Self {
        Self {
            max_open_orders: grid.max_open_orders,
            max_orders_per_batch: grid.max_orders_per_batch,
            order_frequency: grid.order_frequency(),
            activation_bounds_pct: grid.activation_bounds_pct,
            upper_lower_ratio: grid.upper_lower_ratio,
            safe_extra_spread: grid.safe_extra_spread,
            order_timeout: grid.order_timeout(),
            tick_interval: Duration::from_millis(100),
        }
    }
}

/// Which slot of a level an order update belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OrderRole {
    Open,
    Close,
}

enum Wake {
    Tick,
    Event(UserStreamEvent),
    StreamClosed,
}

/// Per-account grid state machine.
pub struct GridExecutor {
    direction: Direction,
    plan: GridPlan,
    rules: SymbolRules,
    config: ExecutorConfig,
    session: Arc<dyn ExchangeSession>,
    levels: Vec<GridLevel>,
    events: mpsc::Receiver<UserStreamEvent>,
    book: watch::Receiver<Option<BookTicker>>,
    control: Arc<ControlState>,
    shared: Arc<ExecutorShared>,
    audit: Option<Arc<AuditLog>>,
    realized_pnl: Decimal,
    unrealized_pnl: Decimal,
    last_batch_at: Option<Instant>,
}

impl GridExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        direction: Direction,
        plan: GridPlan,
        rules: SymbolRules,
        config: ExecutorConfig,
        session: Arc<dyn ExchangeSession>,
        events: mpsc::Receiver<UserStreamEvent>,
        book: watch::Receiver<Option<BookTicker>>,
        control: Arc<ControlState>,
        audit: Option<Arc<AuditLog>>,
    ) -> Self {
        let levels = build_levels(&plan, &rules);
        Self {
            direction,
            plan,
            rules,
            config,
            session,
            levels,
            events,
            book,
            control,
            shared: Arc::new(ExecutorShared::new()),
            audit,
            realized_pnl: Decimal::ZERO,
            unrealized_pnl: Decimal::ZERO,
            last_batch_at: None,
        }
    }

    /// Read-only view for the controller.
    pub fn shared(&self) -> Arc<ExecutorShared> {
        self.shared.clone()
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn levels(&self) -> &[GridLevel] {
        &self.levels
    }

    pub fn realized_pnl(&self) -> Decimal {
        self.realized_pnl
    }

    pub fn epoch_id(&self) -> u64 {
        self.plan.epoch_id
    }

    /// Run until shutdown is requested. Returns the executor so the caller
    /// can read final state after joining.
    pub async fn run(mut self) -> Self {
        info!(direction = %self.direction, epoch = self.plan.epoch_id, "executor starting");

        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut stream_open = true;

        loop {
            let wake = tokio::select! {
                _ = ticker.tick() => Wake::Tick,
                event = self.events.recv(), if stream_open => match event {
                    Some(event) => Wake::Event(event),
                    None => Wake::StreamClosed,
                },
            };

            match wake {
                Wake::Tick => {}
                Wake::Event(event) => self.handle_event(event).await,
                Wake::StreamClosed => {
                    warn!(direction = %self.direction, "user stream reader terminated");
                    stream_open = false;
                    self.shared.set_connected(false);
                }
            }

            if self.control.is_shutdown() {
                break;
            }
            self.control_tick().await;
        }

        self.publish_status();
        info!(direction = %self.direction, "executor stopped");
        self
    }

    /// One control cycle. Public so event sequences can be replayed
    /// deterministically in tests.
    pub async fn control_tick(&mut self) {
        // 1. Reconcile pending stream events, in delivery order.
        while let Ok(event) = self.events.try_recv() {
            self.handle_event(event).await;
        }

        // 2. Close orders for filled levels.
        self.place_close_orders().await;

        // 3. Recycle completed levels for reuse.
        for level in &mut self.levels {
            if level.state == LevelState::Complete {
                debug!(direction = %self.direction, level = level.level_id, "level recycled");
                level.recycle();
            }
        }

        // 4-6. Admission and new open orders.
        if self.control.execution_enabled() {
            self.place_open_orders().await;
        }

        // 7. Cancel stale open orders.
        self.cancel_stale_orders().await;

        self.publish_status();
    }

    async fn handle_event(&mut self, event: UserStreamEvent) {
        match event {
            UserStreamEvent::Order(update) => self.apply_order_update(update),
            UserStreamEvent::Resync => self.resync().await,
            UserStreamEvent::Balance(_) => {}
            UserStreamEvent::Position(p) => {
                if p.position_side == self.direction.position_side() {
                    self.unrealized_pnl = p.unrealized_pnl;
                }
            }
        }
    }

    // -- reconciliation ----------------------------------------------------

    fn apply_order_update(&mut self, update: OrderUpdate) {
        let located = self
            .locate_order(&update)
            .or_else(|| self.adopt_order(&update));
        let Some((idx, role)) = located else {
            debug!(
                direction = %self.direction,
                client_id = %update.client_order_id,
                "update for unknown order ignored"
            );
            return;
        };

        // Update tracking state, rejecting duplicate acks.
        {
            let level = &mut self.levels[idx];
            let tracked = match role {
                OrderRole::Open => level.open_order.as_mut(),
                OrderRole::Close => level.close_order.as_mut(),
            };
            let Some(tracked) = tracked else { return };

            if tracked.status == update.status
                && tracked.cum_filled_qty == update.cum_filled_qty
            {
                return;
            }
            tracked.status = update.status;
            tracked.cum_filled_qty = update.cum_filled_qty;
            if update.avg_fill_price > Decimal::ZERO {
                tracked.avg_fill_price = update.avg_fill_price;
            }
        }

        match role {
            OrderRole::Open => self.advance_open(idx, &update),
            OrderRole::Close => self.advance_close(idx, &update),
        }
    }

    fn advance_open(&mut self, idx: usize, update: &OrderUpdate) {
        let lot = self.rules.lot_size;
        let level = &mut self.levels[idx];
        let Some(order) = level.open_order.as_ref() else { return };
        let filled_enough = order.cum_filled_qty >= order.qty - lot;

        match update.status {
            OrderStatus::Filled | OrderStatus::PartiallyFilled if filled_enough => {
                let fill_price = if order.avg_fill_price > Decimal::ZERO {
                    order.avg_fill_price
                } else {
                    order.price
                };
                let fill_qty = order.cum_filled_qty;
                level.filled_at_price = Some(fill_price);
                level.filled_qty = Some(fill_qty);
                level.filled_at_time = Some(update.event_time);
                level.state = LevelState::OpenOrderFilled;
                // Distinct client id for the upcoming close order.
                level.generation += 1;
                self.shared
                    .metrics
                    .orders_filled
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                info!(
                    direction = %self.direction,
                    level = level.level_id,
                    price = %fill_price,
                    qty = %fill_qty,
                    "open order filled"
                );
                if let Some(audit) = &self.audit {
                    audit.record(&AuditEvent::OrderFilled {
                        direction: self.direction,
                        level_id: level.level_id,
                        client_order_id: update.client_order_id.clone(),
                        avg_price: fill_price,
                        qty: fill_qty,
                    });
                }
            }
            OrderStatus::PartiallyFilled => {
                // Below lot tolerance: stay OPEN_ORDER_PLACED until the
                // remainder fills.
                debug!(
                    direction = %self.direction,
                    level = level.level_id,
                    cum = %update.cum_filled_qty,
                    "partial fill below tolerance"
                );
            }
            OrderStatus::Canceled | OrderStatus::Expired => {
                level.release_open();
                self.shared
                    .metrics
                    .orders_cancelled
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            }
            OrderStatus::Rejected => {
                warn!(direction = %self.direction, level = level.level_id, "open order rejected");
                level.fail();
                self.shared
                    .metrics
                    .orders_rejected
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            }
            OrderStatus::New | OrderStatus::Filled => {}
        }
    }

    fn advance_close(&mut self, idx: usize, update: &OrderUpdate) {
        let lot = self.rules.lot_size;
        let direction = self.direction;
        let level = &mut self.levels[idx];
        let Some(order) = level.close_order.as_ref() else { return };
        let filled_enough = order.cum_filled_qty >= order.qty - lot;

        match update.status {
            OrderStatus::Filled | OrderStatus::PartiallyFilled if filled_enough => {
                let exit = if order.avg_fill_price > Decimal::ZERO {
                    order.avg_fill_price
                } else {
                    order.price
                };
                let entry = level.filled_at_price.unwrap_or(level.price);
                let qty = order.cum_filled_qty;
                let pnl = (exit - entry) * qty * direction.pnl_sign();
                level.state = LevelState::Complete;
                self.realized_pnl += pnl;
                self.shared
                    .metrics
                    .round_trips
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                info!(
                    direction = %direction,
                    level = level.level_id,
                    entry = %entry,
                    exit = %exit,
                    pnl = %pnl,
                    "round trip complete"
                );
                if let Some(audit) = &self.audit {
                    audit.record(&AuditEvent::LevelTransition {
                        direction,
                        level_id: level.level_id,
                        from: LevelState::CloseOrderPlaced.as_str().to_string(),
                        to: LevelState::Complete.as_str().to_string(),
                    });
                }
            }
            OrderStatus::PartiallyFilled => {}
            OrderStatus::Canceled | OrderStatus::Expired => {
                // Position is still open; re-place the close next tick.
                level.close_order = None;
                level.state = LevelState::OpenOrderFilled;
                level.generation += 1;
            }
            OrderStatus::Rejected => {
                warn!(direction = %direction, level = level.level_id, "close order rejected");
                level.fail();
                self.shared
                    .metrics
                    .orders_rejected
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            }
            OrderStatus::New | OrderStatus::Filled => {}
        }
    }

    fn locate_order(&self, update: &OrderUpdate) -> Option<(usize, OrderRole)> {
        for (idx, level) in self.levels.iter().enumerate() {
            if let Some(order) = &level.open_order {
                if order.client_order_id == update.client_order_id
                    || order.order_id == update.order_id
                {
                    return Some((idx, OrderRole::Open));
                }
            }
            if let Some(order) = &level.close_order {
                if order.client_order_id == update.client_order_id
                    || order.order_id == update.order_id
                {
                    return Some((idx, OrderRole::Close));
                }
            }
        }
        None
    }

    /// Adopt an unknown order whose client id matches this epoch, e.g. one
    /// whose ack was lost across a stream gap.
    fn adopt_order(&mut self, update: &OrderUpdate) -> Option<(usize, OrderRole)> {
        let (epoch, level_id, _) = parse_client_order_id(&update.client_order_id)?;
        if epoch != self.plan.epoch_id {
            return None;
        }
        let idx = self.levels.iter().position(|l| l.level_id == level_id)?;
        let role = if update.side == self.direction.open_side() {
            OrderRole::Open
        } else {
            OrderRole::Close
        };

        let level = &mut self.levels[idx];
        let tracked = TrackedOrder {
            order_id: update.order_id,
            client_order_id: update.client_order_id.clone(),
            level_id,
            side: update.side,
            price: update.price,
            qty: level.quantity,
            cum_filled_qty: Decimal::ZERO,
            avg_fill_price: Decimal::ZERO,
            status: OrderStatus::New,
            placed_at: Utc::now(),
        };
        warn!(
            direction = %self.direction,
            level = level_id,
            client_id = %update.client_order_id,
            "adopted untracked order"
        );
        match role {
            OrderRole::Open => {
                level.open_order = Some(tracked);
                if level.state == LevelState::NotActive {
                    level.state = LevelState::OpenOrderPlaced;
                }
            }
            OrderRole::Close => {
                level.close_order = Some(tracked);
                if level.state == LevelState::OpenOrderFilled {
                    level.state = LevelState::CloseOrderPlaced;
                }
            }
        }
        Some((idx, role))
    }

    /// Reconcile against an open-orders snapshot after a stream gap.
    ///
    /// Any locally-placed order missing from the exchange is assumed
    /// filled-and-missed or cancelled: the level is failed for this epoch
    /// rather than guessed at. Unknown resting orders carrying this epoch's
    /// client ids are adopted.
    async fn resync(&mut self) {
        let snapshot = match self.session.open_orders().await {
            Ok(orders) => orders,
            Err(e) => {
                warn!(direction = %self.direction, error = %e, "resync snapshot failed");
                return;
            }
        };
        self.shared.set_connected(true);

        let on_exchange: HashSet<&str> =
            snapshot.iter().map(|o| o.client_order_id.as_str()).collect();

        for level in &mut self.levels {
            match level.state {
                LevelState::OpenOrderPlaced => {
                    let missing = level
                        .open_order
                        .as_ref()
                        .map_or(true, |o| !on_exchange.contains(o.client_order_id.as_str()));
                    if missing {
                        warn!(
                            direction = %self.direction,
                            level = level.level_id,
                            "open order lost across stream gap"
                        );
                        level.fail();
                    }
                }
                LevelState::CloseOrderPlaced => {
                    let missing = level
                        .close_order
                        .as_ref()
                        .map_or(true, |o| !on_exchange.contains(o.client_order_id.as_str()));
                    if missing {
                        warn!(
                            direction = %self.direction,
                            level = level.level_id,
                            "close order lost across stream gap"
                        );
                        level.fail();
                    }
                }
                _ => {}
            }
        }

        // Adopt resting orders we are not tracking.
        for order in &snapshot {
            let update = OrderUpdate {
                order_id: order.order_id,
                client_order_id: order.client_order_id.clone(),
                side: order.side,
                status: order.status,
                price: order.price,
                last_fill_qty: Decimal::ZERO,
                cum_filled_qty: order.executed_qty,
                avg_fill_price: Decimal::ZERO,
                event_time: Utc::now(),
            };
            if self.locate_order(&update).is_none() {
                self.adopt_order(&update);
            }
        }
    }

    // -- close orders ------------------------------------------------------

    async fn place_close_orders(&mut self) {
        let indices: Vec<usize> = self
            .levels
            .iter()
            .enumerate()
            .filter(|(_, l)| l.state == LevelState::OpenOrderFilled && l.close_order.is_none())
            .map(|(i, _)| i)
            .collect();

        for idx in indices {
            self.place_close_at(idx).await;
        }
    }

    async fn place_close_at(&mut self, idx: usize) {
        let close_side = self.direction.close_side();
        let (entry, qty, client_id, level_id) = {
            let level = &self.levels[idx];
            let entry = level.filled_at_price.unwrap_or(level.price);
            let qty = snap_qty(level.filled_qty.unwrap_or(level.quantity), self.rules.lot_size);
            (
                entry,
                qty,
                client_order_id(self.plan.epoch_id, level.level_id, level.generation),
                level.level_id,
            )
        };

        if qty <= Decimal::ZERO {
            // Fill was pure dust below one lot; nothing to close.
            self.levels[idx].state = LevelState::Complete;
            return;
        }

        // Anchor at the actual average fill price so the realized spread
        // equals the configured spacing regardless of slippage.
        let price = snap_price(
            self.direction.close_price(entry, self.plan.spacing),
            self.rules.tick_size,
            close_side,
        );

        let result = self
            .session
            .place_limit_order(
                self.direction,
                PositionAction::Close,
                close_side,
                qty,
                price,
                &client_id,
            )
            .await;

        match result {
            Ok(ack) => {
                let level = &mut self.levels[idx];
                level.close_order = Some(TrackedOrder {
                    order_id: ack.order_id,
                    client_order_id: client_id.clone(),
                    level_id,
                    side: close_side,
                    price,
                    qty,
                    cum_filled_qty: Decimal::ZERO,
                    avg_fill_price: Decimal::ZERO,
                    status: ack.status,
                    placed_at: Utc::now(),
                });
                level.state = LevelState::CloseOrderPlaced;
                self.shared
                    .metrics
                    .orders_placed
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                if let Some(audit) = &self.audit {
                    audit.record(&AuditEvent::OrderPlaced {
                        direction: self.direction,
                        level_id,
                        client_order_id: client_id,
                        price,
                        qty,
                    });
                }
            }
            Err(ExchangeError::Rejected { code, message }) => {
                warn!(
                    direction = %self.direction,
                    level = level_id,
                    code,
                    message = %message,
                    "close order rejected"
                );
                self.levels[idx].fail();
                self.shared
                    .metrics
                    .orders_rejected
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            }
            Err(e) if e.needs_reconcile() => {
                self.reconcile_unknown_placement(idx, OrderRole::Close, &client_id, price, qty)
                    .await;
            }
            Err(e) => {
                // Transient: the level stays OPEN_ORDER_FILLED and the close
                // is retried next tick under a fresh client id.
                warn!(direction = %self.direction, level = level_id, error = %e, "close order failed");
                self.levels[idx].generation += 1;
            }
        }
    }

    // -- open orders -------------------------------------------------------

    async fn place_open_orders(&mut self) {
        let Some(ticker) = self.book.borrow().clone() else {
            return;
        };
        let mid = ticker.mid();
        if mid <= Decimal::ZERO {
            return;
        }

        let resting = self
            .levels
            .iter()
            .filter(|l| l.state == LevelState::OpenOrderPlaced)
            .count();
        if resting >= self.config.max_open_orders {
            return;
        }
        if let Some(last) = self.last_batch_at {
            if last.elapsed() < self.config.order_frequency {
                return;
            }
        }

        let slots = (self.config.max_open_orders - resting).min(self.config.max_orders_per_batch);
        if slots == 0 {
            return;
        }
        let upper_slots = (Decimal::from(slots as u64) * self.config.upper_lower_ratio)
            .floor()
            .to_usize()
            .unwrap_or(0);
        let lower_slots = slots - upper_slots;

        let candidates = self.select_candidates(mid, upper_slots, lower_slots);
        if candidates.is_empty() {
            return;
        }
        self.last_batch_at = Some(Instant::now());

        for idx in candidates {
            self.place_open_at(idx, &ticker).await;
        }
    }

    /// Candidate levels for this batch: `NOT_ACTIVE`, strictly inside the
    /// channel, within the activation band, split above/below mid.
    ///
    /// Sort is by absolute distance from mid ascending, ties broken by
    /// ascending level id, so replays of the same event sequence produce
    /// identical placements.
    fn select_candidates(&self, mid: Decimal, upper_slots: usize, lower_slots: usize) -> Vec<usize> {
        let eligible = |level: &GridLevel| {
            level.state == LevelState::NotActive
                && level.price > self.plan.lower
                && level.price < self.plan.upper
                && (level.price - mid).abs() / mid <= self.config.activation_bounds_pct
        };

        let mut upper: Vec<(Decimal, u32, usize)> = self
            .levels
            .iter()
            .enumerate()
            .filter(|(_, l)| eligible(l) && l.price > mid)
            .map(|(i, l)| (l.price - mid, l.level_id, i))
            .collect();
        upper.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));

        let mut lower: Vec<(Decimal, u32, usize)> = self
            .levels
            .iter()
            .enumerate()
            .filter(|(_, l)| eligible(l) && l.price < mid)
            .map(|(i, l)| (mid - l.price, l.level_id, i))
            .collect();
        lower.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));

        // Lower-half placements go out first: for LONG they are the core
        // grid bids, for SHORT the take-profit side of the book.
        lower
            .into_iter()
            .take(lower_slots)
            .chain(upper.into_iter().take(upper_slots))
            .map(|(_, _, idx)| idx)
            .collect()
    }

    async fn place_open_at(&mut self, idx: usize, ticker: &BookTicker) {
        let open_side = self.direction.open_side();
        let (qty, client_id, level_id, mut limit) = {
            let level = &self.levels[idx];
            (
                level.quantity,
                client_order_id(self.plan.epoch_id, level.level_id, level.generation),
                level.level_id,
                level.price,
            )
        };

        // Nudge to the passive side of the book when the level price would
        // cross and fill as a taker.
        if self
            .direction
            .crosses_book(limit, ticker.best_bid, ticker.best_ask)
        {
            limit = match self.direction {
                Direction::Long => ticker.best_bid - self.config.safe_extra_spread,
                Direction::Short => ticker.best_ask + self.config.safe_extra_spread,
            };
        }
        let limit = snap_price(limit, self.rules.tick_size, open_side);
        if limit <= Decimal::ZERO {
            return;
        }

        let result = self
            .session
            .place_limit_order(
                self.direction,
                PositionAction::Open,
                open_side,
                qty,
                limit,
                &client_id,
            )
            .await;

        match result {
            Ok(ack) => {
                let level = &mut self.levels[idx];
                level.open_order = Some(TrackedOrder {
                    order_id: ack.order_id,
                    client_order_id: client_id.clone(),
                    level_id,
                    side: open_side,
                    price: limit,
                    qty,
                    cum_filled_qty: Decimal::ZERO,
                    avg_fill_price: Decimal::ZERO,
                    status: ack.status,
                    placed_at: Utc::now(),
                });
                level.state = LevelState::OpenOrderPlaced;
                self.shared
                    .metrics
                    .orders_placed
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                debug!(
                    direction = %self.direction,
                    level = level_id,
                    price = %limit,
                    qty = %qty,
                    "open order placed"
                );
                if let Some(audit) = &self.audit {
                    audit.record(&AuditEvent::OrderPlaced {
                        direction: self.direction,
                        level_id,
                        client_order_id: client_id,
                        price: limit,
                        qty,
                    });
                }
            }
            Err(ExchangeError::Rejected { code, message }) => {
                warn!(
                    direction = %self.direction,
                    level = level_id,
                    code,
                    message = %message,
                    "open order rejected"
                );
                self.levels[idx].fail();
                self.shared
                    .metrics
                    .orders_rejected
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            }
            Err(e) if e.needs_reconcile() => {
                self.reconcile_unknown_placement(idx, OrderRole::Open, &client_id, limit, qty)
                    .await;
            }
            Err(e) => {
                warn!(direction = %self.direction, level = level_id, error = %e, "open order failed");
                self.levels[idx].generation += 1;
            }
        }
    }

    /// A placement timed out: its true state is unknown. Query the resting
    /// orders before deciding between adopt and retry.
    async fn reconcile_unknown_placement(
        &mut self,
        idx: usize,
        role: OrderRole,
        client_id: &str,
        price: Decimal,
        qty: Decimal,
    ) {
        let found = match self.session.open_orders().await {
            Ok(orders) => orders
                .into_iter()
                .find(|o| o.client_order_id == client_id),
            Err(e) => {
                // Cannot determine the true state; degrade the level rather
                // than risk a duplicate order.
                warn!(
                    direction = %self.direction,
                    level = self.levels[idx].level_id,
                    error = %e,
                    "post-timeout reconcile failed"
                );
                self.levels[idx].fail();
                return;
            }
        };

        let level = &mut self.levels[idx];
        match found {
            Some(order) => {
                let tracked = TrackedOrder {
                    order_id: order.order_id,
                    client_order_id: client_id.to_string(),
                    level_id: level.level_id,
                    side: order.side,
                    price,
                    qty,
                    cum_filled_qty: order.executed_qty,
                    avg_fill_price: Decimal::ZERO,
                    status: order.status,
                    placed_at: Utc::now(),
                };
                match role {
                    OrderRole::Open => {
                        level.open_order = Some(tracked);
                        level.state = LevelState::OpenOrderPlaced;
                    }
                    OrderRole::Close => {
                        level.close_order = Some(tracked);
                        level.state = LevelState::CloseOrderPlaced;
                    }
                }
                self.shared
                    .metrics
                    .orders_placed
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            }
            None => {
                // Never reached the book: safe to retry under a fresh id.
                level.generation += 1;
            }
        }
    }

    // -- stale order cancellation ------------------------------------------

    async fn cancel_stale_orders(&mut self) {
        let Some(ticker) = self.book.borrow().clone() else {
            return;
        };
        let mid = ticker.mid();
        if mid <= Decimal::ZERO {
            return;
        }
        let timeout =
            chrono::Duration::from_std(self.config.order_timeout).unwrap_or(chrono::Duration::MAX);
        let now = Utc::now();

        let stale: Vec<(usize, i64)> = self
            .levels
            .iter()
            .enumerate()
            .filter_map(|(idx, level)| {
                if level.state != LevelState::OpenOrderPlaced {
                    return None;
                }
                let order = level.open_order.as_ref()?;
                let out_of_band =
                    (level.price - mid).abs() / mid > self.config.activation_bounds_pct;
                let timed_out = now - order.placed_at > timeout;
                (out_of_band || timed_out).then_some((idx, order.order_id))
            })
            .collect();

        for (idx, order_id) in stale {
            match self.session.cancel_order(order_id).await {
                Ok(()) => {
                    let level = &mut self.levels[idx];
                    debug!(
                        direction = %self.direction,
                        level = level.level_id,
                        "stale open order cancelled"
                    );
                    level.release_open();
                    self.shared
                        .metrics
                        .orders_cancelled
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                }
                Err(e) => {
                    // Possibly filled in the race; the next update or resync
                    // settles it.
                    warn!(
                        direction = %self.direction,
                        level = self.levels[idx].level_id,
                        error = %e,
                        "cancel failed"
                    );
                }
            }
        }
    }

    // -- status ------------------------------------------------------------

    fn publish_status(&self) {
        let mut status = StatusSnapshot {
            realized_pnl: self.realized_pnl,
            unrealized_pnl: self.unrealized_pnl,
            last_tick_at: Some(Utc::now()),
            ..StatusSnapshot::default()
        };
        for level in &self.levels {
            match level.state {
                LevelState::NotActive => status.not_active += 1,
                LevelState::OpenOrderPlaced => status.open_placed += 1,
                LevelState::OpenOrderFilled => status.open_filled += 1,
                LevelState::CloseOrderPlaced => status.close_placed += 1,
                LevelState::Complete => status.complete += 1,
                LevelState::Failed => status.failed += 1,
            }
        }
        self.shared.publish_status(status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hedge_exchange::MockSession;
    use rust_decimal_macros::dec;

    /// Ladder bracketing mid 1.00000: levels at 0.99220 (boundary), 0.99480,
    /// 0.99740, 1.00000, 1.00260, 1.00520, 1.00780, 1.01040.
    fn plan() -> GridPlan {
        GridPlan {
            epoch_id: 1,
            upper: dec!(1.01300),
            lower: dec!(0.99220),
            spacing: dec!(0.0026),
            levels_count: 8,
            notional_per_level: dec!(10),
            usable_leverage: 10,
            stop_upper: dec!(1.01300),
            stop_lower: dec!(0.99220),
            computed_at: Utc::now(),
        }
    }

    fn executor_config() -> ExecutorConfig {
        ExecutorConfig {
            max_open_orders: 2,
            max_orders_per_batch: 2,
            order_frequency: Duration::from_secs(3),
            activation_bounds_pct: dec!(0.05),
            upper_lower_ratio: dec!(0.5),
            safe_extra_spread: dec!(0.001),
            order_timeout: Duration::from_secs(600),
            tick_interval: Duration::from_millis(100),
        }
    }

    async fn fixture(
        direction: Direction,
        config: ExecutorConfig,
    ) -> (Arc<MockSession>, GridExecutor) {
        let mock = Arc::new(MockSession::new("DOGEUSDC"));
        let events = mock.subscribe_user_stream().await.unwrap();
        let book = mock.subscribe_book_ticker().await.unwrap();
        mock.set_book(dec!(0.99990), dec!(1.00010));

        let rules = mock.symbol_rules().await.unwrap();
        let executor = GridExecutor::new(
            direction,
            plan(),
            rules,
            config,
            mock.clone() as Arc<dyn ExchangeSession>,
            events,
            book,
            Arc::new(ControlState::new()),
            None,
        );
        (mock, executor)
    }

    fn states(executor: &GridExecutor) -> Vec<LevelState> {
        executor.levels().iter().map(|l| l.state).collect()
    }

    #[tokio::test]
    async fn test_basic_fill_close_cycle() {
        let (mock, mut executor) = fixture(Direction::Long, executor_config()).await;

        executor.control_tick().await;

        // Slots split 1 below / 1 above mid; the nearest lower level goes
        // out first.
        let placed = mock.placed_orders();
        assert_eq!(placed.len(), 2);
        assert_eq!(placed[0].price, dec!(0.99740));
        assert_eq!(placed[0].side, hedge_common::Side::Buy);
        assert_eq!(placed[0].action, PositionAction::Open);
        assert_eq!(placed[0].qty, dec!(10));
        // The upper-half slot (level 1.00260) would cross the ask at
        // 1.00010, so it rests nudged below the bid instead.
        assert_eq!(placed[1].price, dec!(0.99890));

        // Fill the lower bid at its limit price.
        mock.fill_order(placed[0].order_id, dec!(0.99740));
        executor.control_tick().await;

        // The close rests one spacing above the actual fill.
        let placed = mock.placed_orders();
        assert_eq!(placed.len(), 3);
        let close = &placed[2];
        assert_eq!(close.side, hedge_common::Side::Sell);
        assert_eq!(close.action, PositionAction::Close);
        assert_eq!(close.price, dec!(1.00000));
        assert_eq!(close.qty, dec!(10));

        // Close fills: round trip complete, level recycles for reuse.
        mock.fill_order(close.order_id, dec!(1.00000));
        executor.control_tick().await;

        let level = executor
            .levels()
            .iter()
            .find(|l| l.price == dec!(0.99740))
            .unwrap();
        assert_eq!(level.state, LevelState::NotActive);
        assert_eq!(executor.realized_pnl(), dec!(0.026));
        assert_eq!(
            executor
                .shared()
                .metrics
                .round_trips
                .load(std::sync::atomic::Ordering::Relaxed),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_admission_throttle() {
        let mut config = executor_config();
        config.max_open_orders = 4;
        let (mock, mut executor) = fixture(Direction::Long, config).await;

        // Tick 1: batch of 2.
        executor.control_tick().await;
        assert_eq!(mock.placed_orders().len(), 2);

        // Tick at t=1s: inside the frequency window, nothing new.
        tokio::time::advance(Duration::from_secs(1)).await;
        executor.control_tick().await;
        assert_eq!(mock.placed_orders().len(), 2);

        // Tick at t>=3s: second batch of 2, reaching the resting cap.
        tokio::time::advance(Duration::from_secs(2)).await;
        executor.control_tick().await;
        assert_eq!(mock.placed_orders().len(), 4);

        // Cap reached: no further opens until something fills.
        tokio::time::advance(Duration::from_secs(5)).await;
        executor.control_tick().await;
        assert_eq!(mock.placed_orders().len(), 4);
    }

    #[tokio::test]
    async fn test_boundary_level_never_placed() {
        let mut config = executor_config();
        config.max_open_orders = 100;
        config.max_orders_per_batch = 100;
        config.activation_bounds_pct = dec!(1);
        let (mock, mut executor) = fixture(Direction::Long, config).await;

        executor.control_tick().await;

        // The boundary level (price == lower) and the level pinned at mid
        // never place; the remaining six do.
        assert_eq!(mock.placed_orders().len(), 6);
        assert!(mock
            .placed_orders()
            .iter()
            .all(|o| o.price != dec!(0.99220)));
        let boundary = executor
            .levels()
            .iter()
            .find(|l| l.price == dec!(0.99220))
            .unwrap();
        assert_eq!(boundary.state, LevelState::NotActive);
    }

    #[tokio::test]
    async fn test_zero_caps_place_nothing() {
        let mut config = executor_config();
        config.max_open_orders = 0;
        let (mock, mut executor) = fixture(Direction::Long, config).await;
        executor.control_tick().await;
        assert!(mock.placed_orders().is_empty());

        let mut config = executor_config();
        config.activation_bounds_pct = Decimal::ZERO;
        let (mock, mut executor) = fixture(Direction::Long, config).await;
        executor.control_tick().await;
        assert!(mock.placed_orders().is_empty());
    }

    #[tokio::test]
    async fn test_crossing_price_is_nudged() {
        let (mock, mut executor) = fixture(Direction::Long, executor_config()).await;
        // Book sits below the 1.00260 level: a BUY there would cross.
        mock.set_book(dec!(1.00240), dec!(1.00250));

        executor.control_tick().await;

        let placed = mock.placed_orders();
        // Lower pick first (1.00000 is now below mid 1.00245), then the
        // nudged upper pick: bid - safe_extra_spread = 1.00140.
        assert_eq!(placed.len(), 2);
        assert_eq!(placed[0].price, dec!(1.00000));
        assert_eq!(placed[1].price, dec!(1.00140));
    }

    #[tokio::test]
    async fn test_rejected_placement_fails_level() {
        let (mock, mut executor) = fixture(Direction::Long, executor_config()).await;
        mock.reject_next_place();

        executor.control_tick().await;

        // First candidate (0.99740) was rejected, the second went through.
        assert_eq!(mock.placed_orders().len(), 1);
        let failed = executor
            .levels()
            .iter()
            .find(|l| l.price == dec!(0.99740))
            .unwrap();
        assert_eq!(failed.state, LevelState::Failed);
        assert_eq!(
            executor
                .shared()
                .metrics
                .orders_rejected
                .load(std::sync::atomic::Ordering::Relaxed),
            1
        );
    }

    #[tokio::test]
    async fn test_partial_fill_tolerance() {
        let (mock, mut executor) = fixture(Direction::Long, executor_config()).await;
        executor.control_tick().await;
        let order = mock.placed_orders()[0].clone();

        // 4 of 10 filled: more than one lot outstanding, level stays put.
        mock.push_user_event(UserStreamEvent::Order(OrderUpdate {
            order_id: order.order_id,
            client_order_id: order.client_order_id.clone(),
            side: order.side,
            status: OrderStatus::PartiallyFilled,
            price: order.price,
            last_fill_qty: dec!(4),
            cum_filled_qty: dec!(4),
            avg_fill_price: order.price,
            event_time: Utc::now(),
        }));
        executor.control_tick().await;
        let level = executor
            .levels()
            .iter()
            .find(|l| l.price == dec!(0.99740))
            .unwrap();
        assert_eq!(level.state, LevelState::OpenOrderPlaced);

        // 9 of 10: within one lot of intent, the level advances.
        mock.push_user_event(UserStreamEvent::Order(OrderUpdate {
            order_id: order.order_id,
            client_order_id: order.client_order_id.clone(),
            side: order.side,
            status: OrderStatus::PartiallyFilled,
            price: order.price,
            last_fill_qty: dec!(5),
            cum_filled_qty: dec!(9),
            avg_fill_price: order.price,
            event_time: Utc::now(),
        }));
        executor.control_tick().await;
        let level = executor
            .levels()
            .iter()
            .find(|l| l.price == dec!(0.99740))
            .unwrap();
        // Advanced through OPEN_ORDER_FILLED into CLOSE_ORDER_PLACED within
        // the same tick, closing only what was actually bought.
        assert_eq!(level.state, LevelState::CloseOrderPlaced);
        assert_eq!(level.filled_qty, Some(dec!(9)));
        assert_eq!(mock.placed_orders().last().unwrap().qty, dec!(9));
    }

    #[tokio::test]
    async fn test_resync_fails_lost_orders_and_adopts_unknown() {
        let (mock, mut executor) = fixture(Direction::Long, executor_config()).await;
        executor.control_tick().await;
        let placed = mock.placed_orders();
        assert_eq!(placed.len(), 2);

        // One resting order vanishes during a stream gap.
        mock.drop_order_silently(placed[0].order_id);

        // Meanwhile an order this executor does not know about (its ack was
        // lost) rests under this epoch's client id for level 6 (1.00780).
        mock.place_limit_order(
            Direction::Long,
            PositionAction::Open,
            hedge_common::Side::Buy,
            dec!(10),
            dec!(1.00780),
            &client_order_id(1, 6, 0),
        )
        .await
        .unwrap();

        mock.push_user_event(UserStreamEvent::Resync);
        executor.control_tick().await;

        let lost = executor
            .levels()
            .iter()
            .find(|l| l.price == dec!(0.99740))
            .unwrap();
        assert_eq!(lost.state, LevelState::Failed);

        let adopted = executor
            .levels()
            .iter()
            .find(|l| l.price == dec!(1.00780))
            .unwrap();
        assert_eq!(adopted.state, LevelState::OpenOrderPlaced);
        assert!(adopted.open_order.is_some());
    }

    #[tokio::test]
    async fn test_out_of_band_orders_cancelled() {
        let (mock, mut executor) = fixture(Direction::Long, executor_config()).await;
        executor.control_tick().await;
        assert_eq!(mock.placed_orders().len(), 2);

        // Mid runs far above the ladder: both resting orders leave the
        // activation band and get pulled.
        mock.set_book(dec!(1.06350), dec!(1.06450));
        executor.control_tick().await;

        assert_eq!(mock.cancelled_orders().len(), 2);
        assert!(executor
            .levels()
            .iter()
            .all(|l| l.state != LevelState::OpenOrderPlaced));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_orders_cancelled() {
        let mut config = executor_config();
        config.order_timeout = Duration::from_secs(0);
        let (mock, mut executor) = fixture(Direction::Long, config).await;

        executor.control_tick().await;
        assert_eq!(mock.placed_orders().len(), 2);

        // Next tick: both have rested longer than the (zero) horizon.
        tokio::time::advance(Duration::from_millis(200)).await;
        executor.control_tick().await;
        assert_eq!(mock.cancelled_orders().len(), 2);
    }

    #[tokio::test]
    async fn test_drain_stops_new_opens_but_places_closes() {
        let (mock, mut executor) = fixture(Direction::Long, executor_config()).await;
        executor.control_tick().await;
        let placed = mock.placed_orders();
        assert_eq!(placed.len(), 2);

        mock.fill_order(placed[0].order_id, dec!(0.99740));
        executor.control.request_drain();
        executor.control_tick().await;

        // The close for the filled level still goes out; no new opens do.
        let after = mock.placed_orders();
        assert_eq!(after.len(), 3);
        assert_eq!(after[2].action, PositionAction::Close);
    }

    #[tokio::test]
    async fn test_replay_determinism() {
        async fn run_sequence() -> Vec<LevelState> {
            let (mock, mut executor) = fixture(Direction::Long, executor_config()).await;
            executor.control_tick().await;
            let placed = mock.placed_orders();
            mock.fill_order(placed[0].order_id, dec!(0.99740));
            executor.control_tick().await;
            let close = mock.placed_orders().last().unwrap().clone();
            mock.fill_order(close.order_id, dec!(1.00000));
            executor.control_tick().await;
            states(&executor)
        }

        let a = run_sequence().await;
        let b = run_sequence().await;
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_duplicate_ack_ignored() {
        let (mock, mut executor) = fixture(Direction::Long, executor_config()).await;
        executor.control_tick().await;
        let order = mock.placed_orders()[0].clone();

        let fill = UserStreamEvent::Order(OrderUpdate {
            order_id: order.order_id,
            client_order_id: order.client_order_id.clone(),
            side: order.side,
            status: OrderStatus::Filled,
            price: order.price,
            last_fill_qty: dec!(10),
            cum_filled_qty: dec!(10),
            avg_fill_price: order.price,
            event_time: Utc::now(),
        });
        mock.push_user_event(fill.clone());
        mock.push_user_event(fill);
        executor.control_tick().await;

        // The duplicate did not double-count the fill.
        assert_eq!(
            executor
                .shared()
                .metrics
                .orders_filled
                .load(std::sync::atomic::Ordering::Relaxed),
            1
        );
    }
}
