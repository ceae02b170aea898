//! In-memory exchange double for tests.
//!
//! `MockSession` records every order placement and cancellation, lets tests
//! script fills by pushing user-stream events, and can inject rejections.
//! No networking; state lives behind cold-path locks.

use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::{mpsc, watch};

use hedge_common::{Candle, Direction, PositionAction, Side};

use crate::error::ExchangeError;
use crate::session::{ExchangeSession, SessionResult};
use crate::types::{
    AccountOverview, BookTicker, LeverageBracket, OpenOrder, OrderAck, OrderStatus, OrderUpdate,
    PositionInfo, SymbolRules, UserStreamEvent,
};

/// A recorded order placement.
#[derive(Debug, Clone)]
pub struct PlacedOrder {
    pub order_id: i64,
    pub client_order_id: String,
    pub direction: Direction,
    pub action: PositionAction,
    pub side: Side,
    pub qty: Decimal,
    pub price: Decimal,
}

#[derive(Debug, Default)]
struct MockState {
    balance: Decimal,
    candles: Vec<Candle>,
    open_orders: Vec<OpenOrder>,
    positions: Vec<PositionInfo>,
    overview: Option<AccountOverview>,
    placed: Vec<PlacedOrder>,
    cancelled: Vec<i64>,
    cancel_all_calls: u32,
    market_closes: Vec<(Direction, Decimal)>,
    reject_next_place: bool,
    reject_all_places: bool,
    leverage: Option<u32>,
    hedge_mode: bool,
}

/// Scripted exchange session for tests.
pub struct MockSession {
    symbol: String,
    rules: SymbolRules,
    brackets: Vec<LeverageBracket>,
    state: Mutex<MockState>,
    user_tx: Mutex<Option<mpsc::Sender<UserStreamEvent>>>,
    book_tx: watch::Sender<Option<BookTicker>>,
    /// Keeps the book channel alive so quotes published before the first
    /// subscriber are not lost.
    _book_rx: watch::Receiver<Option<BookTicker>>,
    next_order_id: AtomicI64,
}

impl MockSession {
    /// A DOGE-style symbol: tick 0.00001, lot 1, min notional 5.
    pub fn new(symbol: impl Into<String>) -> Self {
        let symbol = symbol.into();
        let rules = SymbolRules {
            symbol: symbol.clone(),
            tick_size: dec!(0.00001),
            lot_size: dec!(1),
            min_notional: dec!(5),
        };
        let brackets = vec![LeverageBracket {
            notional_floor: Decimal::ZERO,
            notional_cap: dec!(50000),
            maintenance_margin_ratio: dec!(0.01),
            max_leverage: 20,
        }];
        let (book_tx, book_rx) = watch::channel(None);
        Self {
            symbol,
            rules,
            brackets,
            state: Mutex::new(MockState {
                balance: dec!(1000),
                ..MockState::default()
            }),
            user_tx: Mutex::new(None),
            book_tx,
            _book_rx: book_rx,
            next_order_id: AtomicI64::new(1),
        }
    }

    pub fn with_rules(mut self, rules: SymbolRules) -> Self {
        self.rules = rules;
        self
    }

    pub fn with_brackets(mut self, brackets: Vec<LeverageBracket>) -> Self {
        self.brackets = brackets;
        self
    }

    // -- test scripting ----------------------------------------------------

    pub fn set_balance(&self, balance: Decimal) {
        self.state.lock().balance = balance;
    }

    pub fn set_candles(&self, candles: Vec<Candle>) {
        self.state.lock().candles = candles;
    }

    pub fn set_positions(&self, positions: Vec<PositionInfo>) {
        self.state.lock().positions = positions;
    }

    pub fn set_overview(&self, overview: AccountOverview) {
        self.state.lock().overview = Some(overview);
    }

    /// Publish a book-ticker quote to every subscriber.
    pub fn set_book(&self, best_bid: Decimal, best_ask: Decimal) {
        let _ = self.book_tx.send(Some(BookTicker {
            best_bid,
            best_ask,
            event_time: Utc::now(),
        }));
    }

    /// Reject the next placement with an exchange error.
    pub fn reject_next_place(&self) {
        self.state.lock().reject_next_place = true;
    }

    /// Reject every placement until cleared.
    pub fn reject_all_places(&self, on: bool) {
        self.state.lock().reject_all_places = on;
    }

    /// Push a raw event into the subscribed user stream.
    pub fn push_user_event(&self, event: UserStreamEvent) {
        let guard = self.user_tx.lock();
        let tx = guard.as_ref().expect("user stream not subscribed");
        tx.try_send(event).expect("user stream channel full");
    }

    /// Script a full fill of a resting order: removes it from the book and
    /// emits the matching `OrderUpdate`.
    pub fn fill_order(&self, order_id: i64, fill_price: Decimal) {
        let order = {
            let mut state = self.state.lock();
            let idx = state
                .open_orders
                .iter()
                .position(|o| o.order_id == order_id)
                .expect("fill_order: unknown order id");
            state.open_orders.remove(idx)
        };
        self.push_user_event(UserStreamEvent::Order(OrderUpdate {
            order_id: order.order_id,
            client_order_id: order.client_order_id,
            side: order.side,
            status: OrderStatus::Filled,
            price: order.price,
            last_fill_qty: order.orig_qty,
            cum_filled_qty: order.orig_qty,
            avg_fill_price: fill_price,
            event_time: Utc::now(),
        }));
    }

    /// Drop a resting order without any notification, as if it vanished
    /// during a stream gap.
    pub fn drop_order_silently(&self, order_id: i64) {
        let mut state = self.state.lock();
        state.open_orders.retain(|o| o.order_id != order_id);
    }

    // -- test inspection ---------------------------------------------------

    pub fn placed_orders(&self) -> Vec<PlacedOrder> {
        self.state.lock().placed.clone()
    }

    pub fn cancelled_orders(&self) -> Vec<i64> {
        self.state.lock().cancelled.clone()
    }

    pub fn cancel_all_calls(&self) -> u32 {
        self.state.lock().cancel_all_calls
    }

    pub fn market_closes(&self) -> Vec<(Direction, Decimal)> {
        self.state.lock().market_closes.clone()
    }

    pub fn leverage(&self) -> Option<u32> {
        self.state.lock().leverage
    }

    pub fn hedge_mode(&self) -> bool {
        self.state.lock().hedge_mode
    }
}

#[async_trait]
impl ExchangeSession for MockSession {
    fn symbol(&self) -> &str {
        &self.symbol
    }

    async fn place_limit_order(
        &self,
        direction: Direction,
        action: PositionAction,
        side: Side,
        qty: Decimal,
        price: Decimal,
        client_id: &str,
    ) -> SessionResult<OrderAck> {
        let mut state = self.state.lock();
        if state.reject_next_place || state.reject_all_places {
            state.reject_next_place = false;
            return Err(ExchangeError::Rejected {
                code: -2010,
                message: "scripted rejection".into(),
            });
        }

        let order_id = self.next_order_id.fetch_add(1, Ordering::SeqCst);
        state.placed.push(PlacedOrder {
            order_id,
            client_order_id: client_id.to_string(),
            direction,
            action,
            side,
            qty,
            price,
        });
        state.open_orders.push(OpenOrder {
            order_id,
            client_order_id: client_id.to_string(),
            side,
            price,
            orig_qty: qty,
            executed_qty: Decimal::ZERO,
            status: OrderStatus::New,
        });

        Ok(OrderAck {
            order_id,
            client_order_id: client_id.to_string(),
            side,
            price,
            qty,
            status: OrderStatus::New,
        })
    }

    async fn cancel_order(&self, order_id: i64) -> SessionResult<()> {
        let mut state = self.state.lock();
        state.cancelled.push(order_id);
        state.open_orders.retain(|o| o.order_id != order_id);
        Ok(())
    }

    async fn cancel_all(&self) -> SessionResult<()> {
        let mut state = self.state.lock();
        state.cancel_all_calls += 1;
        state.open_orders.clear();
        Ok(())
    }

    async fn close_position_market(&self, direction: Direction, qty: Decimal) -> SessionResult<()> {
        let mut state = self.state.lock();
        state.market_closes.push((direction, qty));
        state
            .positions
            .retain(|p| p.position_side != direction.position_side());
        Ok(())
    }

    async fn open_orders(&self) -> SessionResult<Vec<OpenOrder>> {
        Ok(self.state.lock().open_orders.clone())
    }

    async fn positions(&self) -> SessionResult<Vec<PositionInfo>> {
        Ok(self.state.lock().positions.clone())
    }

    async fn balance(&self, _asset: &str) -> SessionResult<Decimal> {
        Ok(self.state.lock().balance)
    }

    async fn account_overview(&self) -> SessionResult<AccountOverview> {
        let state = self.state.lock();
        Ok(state.overview.clone().unwrap_or(AccountOverview {
            margin_balance: state.balance,
            maintenance_margin: Decimal::ZERO,
            unrealized_pnl: Decimal::ZERO,
        }))
    }

    async fn set_leverage(&self, leverage: u32) -> SessionResult<()> {
        self.state.lock().leverage = Some(leverage);
        Ok(())
    }

    async fn set_hedge_mode(&self) -> SessionResult<()> {
        self.state.lock().hedge_mode = true;
        Ok(())
    }

    async fn fetch_ohlcv(&self, _timeframe: &str, limit: u32) -> SessionResult<Vec<Candle>> {
        let candles = self.state.lock().candles.clone();
        let skip = candles.len().saturating_sub(limit as usize);
        Ok(candles.into_iter().skip(skip).collect())
    }

    async fn symbol_rules(&self) -> SessionResult<SymbolRules> {
        Ok(self.rules.clone())
    }

    async fn leverage_brackets(&self) -> SessionResult<Vec<LeverageBracket>> {
        Ok(self.brackets.clone())
    }

    async fn subscribe_user_stream(&self) -> SessionResult<mpsc::Receiver<UserStreamEvent>> {
        let (tx, rx) = mpsc::channel(1024);
        *self.user_tx.lock() = Some(tx);
        Ok(rx)
    }

    async fn subscribe_book_ticker(&self) -> SessionResult<watch::Receiver<Option<BookTicker>>> {
        Ok(self.book_tx.subscribe())
    }
}
