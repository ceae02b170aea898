//! Lock-free control flags and executor status sharing.
//!
//! The controller and the two executors coordinate through a shared
//! [`ControlState`] (one-way: controller writes, executors read) and each
//! executor publishes a [`StatusSnapshot`] the controller reads on its risk
//! tick. No mutable state is shared between the executors themselves.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::Serialize;

/// Pair-wide control flags.
///
/// All reads are single atomic loads; checked at the top of every control
/// tick.
#[derive(Debug)]
pub struct ControlState {
    /// New open orders admitted while true.
    execution_enabled: AtomicBool,
    /// Executors exit their control loops once set.
    shutdown: AtomicBool,
    /// Set exactly once by the first emergency unwind.
    emergency: AtomicBool,
}

impl ControlState {
    pub fn new() -> Self {
        Self {
            execution_enabled: AtomicBool::new(true),
            shutdown: AtomicBool::new(false),
            emergency: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn execution_enabled(&self) -> bool {
        self.execution_enabled.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_emergency(&self) -> bool {
        self.emergency.load(Ordering::Acquire)
    }

    /// Stop admitting new opens; in-flight work settles normally.
    pub fn request_drain(&self) {
        self.execution_enabled.store(false, Ordering::Release);
    }

    /// Re-arm admission (used by epoch reset).
    pub fn resume(&self) {
        self.execution_enabled.store(true, Ordering::Release);
        self.shutdown.store(false, Ordering::Release);
    }

    /// Ask executors to exit after their current tick.
    pub fn request_shutdown(&self) {
        self.execution_enabled.store(false, Ordering::Release);
        self.shutdown.store(true, Ordering::Release);
    }

    /// Flag the emergency unwind. Returns true only for the caller that
    /// flipped the flag, making the unwind idempotent.
    pub fn trip_emergency(&self) -> bool {
        !self.emergency.swap(true, Ordering::AcqRel)
    }
}

impl Default for ControlState {
    fn default() -> Self {
        Self::new()
    }
}

/// Monotonic per-executor counters. Plain atomics; written on the control
/// path, read by the controller and the final status record.
#[derive(Debug, Default)]
pub struct ExecutorMetrics {
    pub orders_placed: AtomicU64,
    pub orders_filled: AtomicU64,
    pub orders_cancelled: AtomicU64,
    pub orders_rejected: AtomicU64,
    /// Completed open-fill → close-fill cycles.
    pub round_trips: AtomicU64,
}

impl ExecutorMetrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            orders_placed: self.orders_placed.load(Ordering::Relaxed),
            orders_filled: self.orders_filled.load(Ordering::Relaxed),
            orders_cancelled: self.orders_cancelled.load(Ordering::Relaxed),
            orders_rejected: self.orders_rejected.load(Ordering::Relaxed),
            round_trips: self.round_trips.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`ExecutorMetrics`].
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct MetricsSnapshot {
    pub orders_placed: u64,
    pub orders_filled: u64,
    pub orders_cancelled: u64,
    pub orders_rejected: u64,
    pub round_trips: u64,
}

/// Executor status published after every control tick.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatusSnapshot {
    /// Level counts keyed by state.
    pub not_active: usize,
    pub open_placed: usize,
    pub open_filled: usize,
    pub close_placed: usize,
    pub complete: usize,
    pub failed: usize,
    /// Realized PnL accumulated from completed round trips.
    pub realized_pnl: Decimal,
    /// Unrealized PnL from the latest position update.
    pub unrealized_pnl: Decimal,
    pub last_tick_at: Option<DateTime<Utc>>,
}

/// Read-only view of one executor the controller monitors.
///
/// The executor owns the writer side; the controller holds a clone of the
/// `Arc` and never writes.
#[derive(Debug, Default)]
pub struct ExecutorShared {
    pub metrics: ExecutorMetrics,
    status: Mutex<StatusSnapshot>,
    connected: AtomicBool,
    /// Millis-since-epoch of the moment `connected` last flipped false;
    /// zero while connected.
    disconnected_since_ms: AtomicU64,
}

impl ExecutorShared {
    pub fn new() -> Self {
        let shared = Self::default();
        shared.connected.store(true, Ordering::Release);
        shared
    }

    pub fn publish_status(&self, status: StatusSnapshot) {
        *self.status.lock() = status;
    }

    pub fn status(&self) -> StatusSnapshot {
        self.status.lock().clone()
    }

    pub fn set_connected(&self, connected: bool) {
        let was = self.connected.swap(connected, Ordering::AcqRel);
        if was && !connected {
            self.disconnected_since_ms
                .store(Utc::now().timestamp_millis() as u64, Ordering::Release);
        } else if connected {
            self.disconnected_since_ms.store(0, Ordering::Release);
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// How long the executor has been disconnected, if it is.
    pub fn disconnected_for(&self) -> Option<std::time::Duration> {
        let since = self.disconnected_since_ms.load(Ordering::Acquire);
        if self.is_connected() || since == 0 {
            return None;
        }
        let elapsed_ms = (Utc::now().timestamp_millis() as u64).saturating_sub(since);
        Some(std::time::Duration::from_millis(elapsed_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_state_transitions() {
        let control = ControlState::new();
        assert!(control.execution_enabled());
        assert!(!control.is_shutdown());

        control.request_drain();
        assert!(!control.execution_enabled());
        assert!(!control.is_shutdown());

        control.request_shutdown();
        assert!(control.is_shutdown());

        control.resume();
        assert!(control.execution_enabled());
        assert!(!control.is_shutdown());
    }

    #[test]
    fn test_emergency_trips_once() {
        let control = ControlState::new();
        assert!(control.trip_emergency());
        assert!(!control.trip_emergency());
        assert!(control.is_emergency());
    }

    #[test]
    fn test_disconnect_tracking() {
        let shared = ExecutorShared::new();
        assert!(shared.is_connected());
        assert!(shared.disconnected_for().is_none());

        shared.set_connected(false);
        assert!(!shared.is_connected());
        assert!(shared.disconnected_for().is_some());

        shared.set_connected(true);
        assert!(shared.disconnected_for().is_none());
    }

    #[test]
    fn test_metrics_snapshot() {
        let metrics = ExecutorMetrics::default();
        metrics.orders_placed.fetch_add(3, Ordering::Relaxed);
        metrics.round_trips.fetch_add(1, Ordering::Relaxed);
        let snap = metrics.snapshot();
        assert_eq!(snap.orders_placed, 3);
        assert_eq!(snap.round_trips, 1);
        assert_eq!(snap.orders_rejected, 0);
    }
}
