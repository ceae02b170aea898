//! Sync controller: pair lifecycle, risk supervision, emergency unwind.
//!
//! The controller starts both executors, supervises them with a periodic
//! risk loop, and pulls the plug on the whole pair at once when a limit
//! fires. It holds read-only views of the executors for monitoring and
//! commands them only through the shared [`ControlState`] flags — no
//! ownership cycle, nothing shared on the order hot path.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rust_decimal::Decimal;
use tokio::sync::watch;
use tracing::{error, info, warn};

use hedge_exchange::BookTicker;

use crate::accounts::DualAccountManager;
use crate::audit::{AuditEvent, AuditLog};
use crate::config::RiskConfig;
use crate::engine::GridPlan;
use crate::error::RiskBreach;
use crate::executor::GridExecutor;
use crate::state::{ControlState, ExecutorShared};

/// Pair lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Idle,
    Running,
    Stopped,
}

impl std::fmt::Display for ControllerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControllerState::Idle => write!(f, "IDLE"),
            ControllerState::Running => write!(f, "RUNNING"),
            ControllerState::Stopped => write!(f, "STOPPED"),
        }
    }
}

/// Outcome of one epoch run.
pub struct EpochOutcome {
    pub long: GridExecutor,
    pub short: GridExecutor,
    /// The breach that ended the epoch, if any; `None` means an external
    /// shutdown request.
    pub breach: Option<RiskBreach>,
}

/// Supervises the executor pair for one epoch.
pub struct SyncController {
    manager: Arc<DualAccountManager>,
    control: Arc<ControlState>,
    config: RiskConfig,
    plan: GridPlan,
    /// Combined starting balance, the drawdown denominator.
    initial_balance: Decimal,
    book: watch::Receiver<Option<BookTicker>>,
    long_shared: Arc<ExecutorShared>,
    short_shared: Arc<ExecutorShared>,
    audit: Option<Arc<AuditLog>>,
    state: Mutex<ControllerState>,
    drained_for_disconnect: AtomicBool,
}

impl SyncController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        manager: Arc<DualAccountManager>,
        control: Arc<ControlState>,
        config: RiskConfig,
        plan: GridPlan,
        initial_balance: Decimal,
        book: watch::Receiver<Option<BookTicker>>,
        long_shared: Arc<ExecutorShared>,
        short_shared: Arc<ExecutorShared>,
        audit: Option<Arc<AuditLog>>,
    ) -> Self {
        Self {
            manager,
            control,
            config,
            plan,
            initial_balance,
            book,
            long_shared,
            short_shared,
            audit,
            state: Mutex::new(ControllerState::Idle),
            drained_for_disconnect: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> ControllerState {
        *self.state.lock()
    }

    /// Start both executors concurrently, supervise until shutdown or a
    /// risk breach, then stop both atomically.
    pub async fn run(&self, long: GridExecutor, short: GridExecutor) -> EpochOutcome {
        *self.state.lock() = ControllerState::Running;
        info!(epoch = self.plan.epoch_id, "starting executor pair");

        let long_handle = tokio::spawn(long.run());
        let short_handle = tokio::spawn(short.run());

        let breach = self.risk_loop().await;

        if let Some(reason) = &breach {
            self.emergency_unwind(reason.clone()).await;
        } else {
            // External stop: executors drain, resting orders are cancelled.
            self.control.request_shutdown();
        }

        // In-flight exchange calls are awaited to completion, never aborted,
        // so local state reflects the exchange's.
        let long = long_handle.await.expect("long executor task panicked");
        let short = short_handle.await.expect("short executor task panicked");

        *self.state.lock() = ControllerState::Stopped;
        info!(epoch = self.plan.epoch_id, "executor pair stopped");

        EpochOutcome {
            long,
            short,
            breach,
        }
    }

    /// Periodic risk checks; returns the breach that fired, or `None` on an
    /// external shutdown request.
    async fn risk_loop(&self) -> Option<RiskBreach> {
        let mut ticker = tokio::time::interval(self.config.risk_check_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if self.control.is_shutdown() {
                return None;
            }
            if let Some(breach) = self.check_risk().await {
                return Some(breach);
            }
        }
    }

    /// One pass over the risk limits, in fixed order: channel breakout,
    /// margin ratio, aggregate drawdown, stream disconnection.
    pub async fn check_risk(&self) -> Option<RiskBreach> {
        // Channel breakout against the hard stops.
        if let Some(ticker) = *self.book.borrow() {
            let mid = ticker.mid();
            if mid > self.plan.stop_upper || mid < self.plan.stop_lower {
                warn!(
                    mid = %mid,
                    stop_upper = %self.plan.stop_upper,
                    stop_lower = %self.plan.stop_lower,
                    "mid price left the channel"
                );
                return Some(RiskBreach::ChannelBreakout);
            }
        }

        // Margin ratio and drawdown read atomic snapshots per session; the
        // two reads are never interleaved with executor state.
        let mut aggregate_unrealized = Decimal::ZERO;
        for side in [
            crate::accounts::AccountSide::Long,
            crate::accounts::AccountSide::Short,
        ] {
            match self.manager.session(side).account_overview().await {
                Ok(overview) => {
                    let ratio = overview.margin_ratio();
                    if ratio > self.config.max_margin_ratio {
                        warn!(ratio = %ratio, "margin ratio limit exceeded");
                        return Some(RiskBreach::MarginRatio);
                    }
                    aggregate_unrealized += overview.unrealized_pnl;
                }
                Err(e) => {
                    warn!(error = %e, "account overview unavailable for risk check");
                }
            }
        }

        if self.initial_balance > Decimal::ZERO
            && aggregate_unrealized / self.initial_balance < -self.config.max_drawdown_pct
        {
            warn!(
                unrealized = %aggregate_unrealized,
                initial_balance = %self.initial_balance,
                "aggregate drawdown limit exceeded"
            );
            return Some(RiskBreach::Drawdown);
        }

        self.check_disconnects()
    }

    /// Disconnect policy: past the grace period the pair drains and awaits
    /// recovery; past twice the grace period recovery has failed and the
    /// pair unwinds.
    fn check_disconnects(&self) -> Option<RiskBreach> {
        let grace = self.config.disconnect_grace();
        let mut any_disconnected = false;

        for shared in [&self.long_shared, &self.short_shared] {
            if let Some(down_for) = shared.disconnected_for() {
                any_disconnected = true;
                if down_for > grace * 2 {
                    warn!(down_secs = down_for.as_secs(), "stream recovery failed");
                    return Some(RiskBreach::Disconnected);
                }
                if down_for > grace && !self.drained_for_disconnect.swap(true, Ordering::AcqRel) {
                    warn!(
                        down_secs = down_for.as_secs(),
                        "stream disconnected beyond grace, draining pair"
                    );
                    self.control.request_drain();
                }
            }
        }

        // Both streams healthy again: resume a disconnect-only drain.
        if !any_disconnected
            && self.drained_for_disconnect.swap(false, Ordering::AcqRel)
            && !self.control.is_emergency()
        {
            info!("streams recovered, resuming admission");
            self.control.resume();
        }
        None
    }

    /// Cancel all orders in both sessions, market-close any residual
    /// position, and refuse restart. Idempotent: only the first caller
    /// performs the unwind.
    pub async fn emergency_unwind(&self, reason: RiskBreach) {
        if !self.control.trip_emergency() {
            return;
        }
        error!(reason = %reason, "EMERGENCY UNWIND");
        if let Some(audit) = &self.audit {
            audit.record(&AuditEvent::RiskEvent {
                reason: reason.to_string(),
            });
        }

        // Drop pending new-order attempts before touching the exchange.
        self.control.request_shutdown();

        if let Err(e) = self.manager.unwind_both().await {
            error!(error = %e, "unwind left residual state; operator intervention required");
        }

        match self.manager.verify_flat().await {
            Ok(true) => info!("both accounts verified flat after unwind"),
            Ok(false) => error!("residual position after unwind; operator intervention required"),
            Err(e) => warn!(error = %e, "could not verify flatness after unwind"),
        }

        *self.state.lock() = ControllerState::Stopped;
    }

    /// Whether a new epoch may start after this outcome: opt-in, breakout
    /// only, and only once both accounts are verified flat.
    pub async fn epoch_reset_allowed(&self, breach: &Option<RiskBreach>) -> bool {
        if !self.config.reset_on_channel_breakout {
            return false;
        }
        if !matches!(breach, Some(RiskBreach::ChannelBreakout)) {
            return false;
        }
        match self.manager.verify_flat().await {
            Ok(flat) => flat,
            Err(e) => {
                warn!(error = %e, "flatness check for epoch reset failed");
                false
            }
        }
    }
}
