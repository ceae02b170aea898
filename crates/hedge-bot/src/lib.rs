//! Dual-account ATR hedge-grid trading engine.
//!
//! One perpetual-futures symbol traded across two independent exchange
//! accounts: one runs a LONG-only grid, the other a SHORT-only grid. Both
//! grids share an identical ladder of price levels derived from an ATR
//! channel, so the pair is approximately delta-neutral while harvesting
//! oscillations inside the channel.
//!
//! ## Modules
//!
//! - `config`: TOML + environment configuration and validation
//! - `atr`: Wilder-RMA ATR channel from OHLC history
//! - `engine`: `SharedGridEngine` — the single source of truth `GridPlan`
//! - `executor`: direction-polymorphic per-account grid state machine
//! - `accounts`: `DualAccountManager` over the two exchange sessions
//! - `controller`: `SyncController` — pair lifecycle, risk loop, unwind
//! - `state`: lock-free control flags, metrics, status snapshots
//! - `audit`: optional append-only JSONL event log

pub mod accounts;
pub mod atr;
pub mod audit;
pub mod config;
pub mod controller;
pub mod engine;
pub mod error;
pub mod executor;
pub mod state;

pub use accounts::{balances_equal_within, AccountSide, DualAccountManager};
pub use atr::{compute_atr_channel, AtrError, AtrResult};
pub use audit::{AuditEvent, AuditLog};
pub use config::BotConfig;
pub use controller::{ControllerState, EpochOutcome, SyncController};
pub use engine::{GridPlan, SharedGridEngine};
pub use error::{BotError, RiskBreach};
pub use executor::{ExecutorConfig, GridExecutor, GridLevel, LevelState, TrackedOrder};
pub use state::{ControlState, ExecutorMetrics, ExecutorShared, MetricsSnapshot, StatusSnapshot};
