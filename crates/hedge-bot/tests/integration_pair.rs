//! Integration tests: the executor pair under the sync controller.
//!
//! Both executors run against scripted mock sessions while the controller
//! supervises, exercising the full start → trade → stop lifecycle without
//! touching a real exchange.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rust_decimal_macros::dec;

use hedge_bot::accounts::DualAccountManager;
use hedge_bot::config::RiskConfig;
use hedge_bot::controller::{ControllerState, SyncController};
use hedge_bot::engine::GridPlan;
use hedge_bot::error::RiskBreach;
use hedge_bot::executor::{ExecutorConfig, GridExecutor};
use hedge_bot::state::ControlState;
use hedge_common::{Direction, Side};
use hedge_exchange::{ExchangeSession, MockSession, PositionInfo};

fn plan() -> GridPlan {
    // Ladder brackets mid 1.00000: 0.99220 .. 1.01040 step 0.0026.
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
        order_frequency: Duration::from_millis(100),
        activation_bounds_pct: dec!(0.05),
        upper_lower_ratio: dec!(0.5),
        safe_extra_spread: dec!(0.001),
        order_timeout: Duration::from_secs(600),
        tick_interval: Duration::from_millis(10),
    }
}

struct Pair {
    long_mock: Arc<MockSession>,
    short_mock: Arc<MockSession>,
    long_executor: GridExecutor,
    short_executor: GridExecutor,
    controller: SyncController,
    control: Arc<ControlState>,
}

async fn build_pair(risk: RiskConfig) -> Pair {
    let long_mock = Arc::new(MockSession::new("DOGEUSDC"));
    let short_mock = Arc::new(MockSession::new("DOGEUSDC"));

    let long_events = long_mock.subscribe_user_stream().await.unwrap();
    let short_events = short_mock.subscribe_user_stream().await.unwrap();
    let long_book = long_mock.subscribe_book_ticker().await.unwrap();
    let short_book = short_mock.subscribe_book_ticker().await.unwrap();
    let controller_book = long_book.clone();

    long_mock.set_book(dec!(0.99990), dec!(1.00010));
    short_mock.set_book(dec!(0.99990), dec!(1.00010));

    let rules = long_mock.symbol_rules().await.unwrap();
    let control = Arc::new(ControlState::new());

    let long_executor = GridExecutor::new(
        Direction::Long,
        plan(),
        rules.clone(),
        executor_config(),
        long_mock.clone() as Arc<dyn ExchangeSession>,
        long_events,
        long_book,
        control.clone(),
        None,
    );
    let short_executor = GridExecutor::new(
        Direction::Short,
        plan(),
        rules,
        executor_config(),
        short_mock.clone() as Arc<dyn ExchangeSession>,
        short_events,
        short_book,
        control.clone(),
        None,
    );

    let manager = Arc::new(DualAccountManager::new(
        long_mock.clone() as Arc<dyn ExchangeSession>,
        short_mock.clone() as Arc<dyn ExchangeSession>,
        "USDC",
        dec!(0.05),
    ));
    let controller = SyncController::new(
        manager,
        control.clone(),
        risk,
        plan(),
        dec!(2000),
        controller_book,
        long_executor.shared(),
        short_executor.shared(),
        None,
    );

    Pair {
        long_mock,
        short_mock,
        long_executor,
        short_executor,
        controller,
        control,
    }
}

#[tokio::test(start_paused = true)]
async fn test_both_grids_share_the_ladder() {
    let pair = build_pair(RiskConfig::default()).await;
    let long_prices: Vec<_> = pair.long_executor.levels().iter().map(|l| l.price).collect();
    let short_prices: Vec<_> = pair.short_executor.levels().iter().map(|l| l.price).collect();
    assert_eq!(long_prices, short_prices);
}

#[tokio::test(start_paused = true)]
async fn test_pair_trades_both_sides_and_stops_on_signal() {
    let pair = build_pair(RiskConfig::default()).await;

    let stopper = tokio::spawn({
        let control = pair.control.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            control.request_shutdown();
        }
    });

    let outcome = pair
        .controller
        .run(pair.long_executor, pair.short_executor)
        .await;
    stopper.await.unwrap();

    assert!(outcome.breach.is_none());
    assert_eq!(pair.controller.state(), ControllerState::Stopped);

    // The LONG account opened with BUYs, the SHORT account with SELLs.
    let long_placed = pair.long_mock.placed_orders();
    let short_placed = pair.short_mock.placed_orders();
    assert!(!long_placed.is_empty());
    assert!(!short_placed.is_empty());
    assert!(long_placed.iter().all(|o| o.side == Side::Buy));
    assert!(short_placed.iter().all(|o| o.side == Side::Sell));
}

#[tokio::test(start_paused = true)]
async fn test_round_trip_while_pair_is_supervised() {
    let pair = build_pair(RiskConfig::default()).await;
    let long_mock = pair.long_mock.clone();

    // Fill the first LONG bid shortly after it rests, then its close.
    let filler = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let placed = long_mock.placed_orders();
        assert!(!placed.is_empty(), "no long orders placed before fill");
        long_mock.fill_order(placed[0].order_id, placed[0].price);

        tokio::time::sleep(Duration::from_millis(100)).await;
        let close = long_mock
            .placed_orders()
            .into_iter()
            .find(|o| o.side == Side::Sell)
            .expect("close order not placed");
        long_mock.fill_order(close.order_id, close.price);
    });

    let stopper = tokio::spawn({
        let control = pair.control.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(600)).await;
            control.request_shutdown();
        }
    });

    let outcome = pair
        .controller
        .run(pair.long_executor, pair.short_executor)
        .await;
    filler.await.unwrap();
    stopper.await.unwrap();

    // One full cycle realized exactly the grid spacing.
    assert_eq!(
        outcome
            .long
            .shared()
            .metrics
            .round_trips
            .load(std::sync::atomic::Ordering::Relaxed),
        1
    );
    assert_eq!(outcome.long.realized_pnl(), dec!(0.0026) * dec!(10));
}

#[tokio::test(start_paused = true)]
async fn test_channel_breakout_unwinds_both_sessions() {
    let pair = build_pair(RiskConfig::default()).await;

    // Residual position on the long account that the unwind must flatten.
    pair.long_mock.set_positions(vec![PositionInfo {
        position_side: "LONG".into(),
        qty: dec!(30),
        entry_price: dec!(1),
        unrealized_pnl: dec!(0),
        leverage: 10,
    }]);

    // Mid breaks above the channel after the pair has been running.
    let mover = tokio::spawn({
        let mock = pair.long_mock.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            mock.set_book(dec!(1.05990), dec!(1.06010));
        }
    });

    let outcome = pair
        .controller
        .run(pair.long_executor, pair.short_executor)
        .await;
    mover.await.unwrap();

    assert_eq!(outcome.breach, Some(RiskBreach::ChannelBreakout));
    assert_eq!(pair.controller.state(), ControllerState::Stopped);

    // Both sessions cancelled everything; the residual position was
    // market-closed reduce-only.
    assert!(pair.long_mock.cancel_all_calls() >= 1);
    assert!(pair.short_mock.cancel_all_calls() >= 1);
    assert_eq!(
        pair.long_mock.market_closes(),
        vec![(Direction::Long, dec!(30))]
    );
    assert!(pair.long_mock.open_orders().await.unwrap().is_empty());
    assert!(pair.short_mock.open_orders().await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_margin_breach_unwinds() {
    let pair = build_pair(RiskConfig::default()).await;

    let overview = hedge_exchange::AccountOverview {
        margin_balance: dec!(1000),
        maintenance_margin: dec!(900),
        unrealized_pnl: dec!(0),
    };
    let setter = tokio::spawn({
        let mock = pair.short_mock.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            mock.set_overview(overview);
        }
    });

    let outcome = pair
        .controller
        .run(pair.long_executor, pair.short_executor)
        .await;
    setter.await.unwrap();

    assert_eq!(outcome.breach, Some(RiskBreach::MarginRatio));
}
