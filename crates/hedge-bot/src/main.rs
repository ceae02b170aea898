//! Hedge-bot: dual-account ATR hedge-grid trading engine.
//!
//! Usage:
//!   hedge-bot [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>     Config file path (default: config/bot.toml)
//!   -s, --symbol <SYMBOL>   Trading symbol (overrides config)
//!   --log-level <LEVEL>     Logging level (overrides config)
//!
//! Credentials come from LONG_API_KEY / LONG_API_SECRET and
//! SHORT_API_KEY / SHORT_API_SECRET (or a .env file).

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use hedge_exchange::{BinanceFuturesSession, ExchangeSession, SessionConfig};

use hedge_bot::accounts::{AccountSide, DualAccountManager};
use hedge_bot::atr::compute_atr_channel;
use hedge_bot::audit::{AuditEvent, AuditLog};
use hedge_bot::config::BotConfig;
use hedge_bot::controller::SyncController;
use hedge_bot::engine::SharedGridEngine;
use hedge_bot::error::BotError;
use hedge_bot::executor::{ExecutorConfig, GridExecutor};
use hedge_bot::state::ControlState;

/// CLI arguments for hedge-bot.
#[derive(Parser, Debug)]
#[command(name = "hedge-bot")]
#[command(about = "Dual-account ATR hedge-grid trading engine")]
#[command(version)]
struct Args {
    /// Config file path
    #[arg(short, long, default_value = "config/bot.toml")]
    config: PathBuf,

    /// Trading symbol (overrides config file)
    #[arg(short, long)]
    symbol: Option<String>,

    /// Logging level (overrides config file)
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    // Load environment variables from .env file (if present).
    if let Err(e) = dotenvy::dotenv() {
        if !matches!(e, dotenvy::Error::Io(ref io_err) if io_err.kind() == std::io::ErrorKind::NotFound)
        {
            eprintln!("Warning: Failed to load .env file: {}", e);
        }
    }

    let args = Args::parse();

    let mut config = if args.config.exists() {
        BotConfig::from_file(&args.config)
            .with_context(|| format!("Failed to load config from {:?}", args.config))?
    } else {
        warn!("Config file not found at {:?}, using defaults", args.config);
        BotConfig::default()
    };

    config.apply_env_overrides();
    if let Some(symbol) = args.symbol {
        config.symbol = symbol;
    }
    if let Some(level) = args.log_level {
        config.log_level = level;
    }

    let log_level = match config.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder().with_max_level(log_level).finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set global tracing subscriber")?;

    info!("Starting hedge-bot");
    info!("Symbol: {}", config.symbol);

    config.validate().context("Configuration validation failed")?;

    let audit = if config.audit.enabled {
        Some(Arc::new(
            AuditLog::open(&config.audit.path).context("Failed to open audit log")?,
        ))
    } else {
        None
    };

    // Two independent sessions, one per account.
    let request_timeout = Duration::from_secs(config.exchange.request_timeout_s);
    let mut long_session_config = SessionConfig::new(
        config.exchange.rest_base.clone(),
        config.exchange.ws_base.clone(),
        config.accounts.long.api_key.clone(),
        config.accounts.long.api_secret.clone(),
    );
    long_session_config.request_timeout = request_timeout;
    let mut short_session_config = SessionConfig::new(
        config.exchange.rest_base.clone(),
        config.exchange.ws_base.clone(),
        config.accounts.short.api_key.clone(),
        config.accounts.short.api_secret.clone(),
    );
    short_session_config.request_timeout = request_timeout;

    let long_session: Arc<dyn ExchangeSession> = Arc::new(BinanceFuturesSession::new(
        long_session_config,
        config.symbol.clone(),
    ));
    let short_session: Arc<dyn ExchangeSession> = Arc::new(BinanceFuturesSession::new(
        short_session_config,
        config.symbol.clone(),
    ));

    let manager = Arc::new(DualAccountManager::new(
        long_session,
        short_session,
        config.quote_asset.clone(),
        config.risk.balance_tolerance_pct,
    ));

    let rules = manager.initialize().await?;
    manager.pre_flight(config.risk.force_flatten_on_start).await?;

    // Shutdown signal fan-out: one watcher per epoch forwards the signal
    // into that epoch's control flags.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown().await {
            error!("Shutdown signal handler error: {}", e);
        }
        info!("Requesting shutdown...");
        let _ = shutdown_tx.send(true);
    });

    let engine = SharedGridEngine::new(config.grid.clone());
    let mut epoch_breach = None;

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let outcome = run_epoch(
            &config,
            &engine,
            &manager,
            &rules,
            audit.clone(),
            shutdown_rx.clone(),
        )
        .await?;

        if let Some(audit) = &audit {
            audit.record(&AuditEvent::FinalStatus {
                epoch_id: outcome.long.epoch_id(),
                long_metrics: outcome.long.shared().metrics.snapshot(),
                short_metrics: outcome.short.shared().metrics.snapshot(),
                long_realized_pnl: outcome.long.realized_pnl(),
                short_realized_pnl: outcome.short.realized_pnl(),
            });
        }
        info!(
            epoch = outcome.long.epoch_id(),
            long_realized = %outcome.long.realized_pnl(),
            short_realized = %outcome.short.realized_pnl(),
            breach = ?outcome.breach,
            "epoch finished"
        );

        epoch_breach = outcome.breach;
        if epoch_breach.is_none() {
            // External shutdown: cancel any resting orders and exit cleanly.
            let _ = manager.cancel_all(AccountSide::Long).await;
            let _ = manager.cancel_all(AccountSide::Short).await;
            break;
        }

        if outcome.reset_allowed {
            info!("channel breakout reset enabled and accounts flat, starting new epoch");
            continue;
        }
        break;
    }

    match epoch_breach {
        None => Ok(()),
        Some(breach) => {
            // Cleanup already ran in the emergency unwind; surface the
            // abnormal termination to the operator.
            bail!(BotError::RiskBreach(breach))
        }
    }
}

struct EpochRun {
    long: GridExecutor,
    short: GridExecutor,
    breach: Option<hedge_bot::error::RiskBreach>,
    reset_allowed: bool,
}

/// One epoch: compute the plan, build and supervise the executor pair.
async fn run_epoch(
    config: &BotConfig,
    engine: &SharedGridEngine,
    manager: &Arc<DualAccountManager>,
    rules: &hedge_exchange::SymbolRules,
    audit: Option<Arc<AuditLog>>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<EpochRun> {
    let long_session = manager.session(AccountSide::Long);
    let short_session = manager.session(AccountSide::Short);

    // Plan generation is off the critical path: everything here happens
    // before the executors start.
    let kline_limit = (config.atr.length + config.atr.lookback + 10) as u32;
    let candles = long_session
        .fetch_ohlcv(&config.atr.timeframe, kline_limit)
        .await
        .map_err(BotError::Exchange)?;
    let atr = compute_atr_channel(
        &candles,
        config.atr.length,
        config.atr.multiplier,
        config.atr.lookback,
    )
    .context("ATR channel computation failed")?;
    let current_price = candles
        .last()
        .map(|c| c.close)
        .context("no candles returned")?;

    let (long_balance, short_balance) = manager.balances().await?;
    let funding = manager.funding_balance().await?;
    let brackets = long_session
        .leverage_brackets()
        .await
        .map_err(BotError::Exchange)?;

    let plan = engine.build_plan(&atr, funding, current_price, rules, &brackets)?;
    manager.apply_leverage(plan.usable_leverage).await?;

    // Streams: each executor gets its own user stream; book tickers are
    // watch channels, so the controller shares the long side's by clone.
    let long_events = long_session
        .subscribe_user_stream()
        .await
        .map_err(BotError::Exchange)?;
    let short_events = short_session
        .subscribe_user_stream()
        .await
        .map_err(BotError::Exchange)?;
    let long_book = long_session
        .subscribe_book_ticker()
        .await
        .map_err(BotError::Exchange)?;
    let short_book = short_session
        .subscribe_book_ticker()
        .await
        .map_err(BotError::Exchange)?;
    let controller_book = long_book.clone();

    let control = Arc::new(ControlState::new());
    let executor_config = ExecutorConfig::from_grid(&config.grid);

    let long_executor = GridExecutor::new(
        hedge_common::Direction::Long,
        plan.clone(),
        rules.clone(),
        executor_config.clone(),
        long_session,
        long_events,
        long_book,
        control.clone(),
        audit.clone(),
    );
    let short_executor = GridExecutor::new(
        hedge_common::Direction::Short,
        plan.clone(),
        rules.clone(),
        executor_config,
        short_session,
        short_events,
        short_book,
        control.clone(),
        audit.clone(),
    );

    let controller = SyncController::new(
        manager.clone(),
        control.clone(),
        config.risk.clone(),
        plan,
        long_balance + short_balance,
        controller_book,
        long_executor.shared(),
        short_executor.shared(),
        audit,
    );

    // Forward the process-level shutdown signal into this epoch's flags.
    let signal_control = control.clone();
    let forwarder = tokio::spawn(async move {
        let already_signalled = *shutdown_rx.borrow();
        if !already_signalled && shutdown_rx.changed().await.is_err() {
            return;
        }
        if *shutdown_rx.borrow() {
            signal_control.request_shutdown();
        }
    });

    let outcome = controller.run(long_executor, short_executor).await;
    let reset_allowed = controller.epoch_reset_allowed(&outcome.breach).await;
    forwarder.abort();

    Ok(EpochRun {
        long: outcome.long,
        short: outcome.short,
        breach: outcome.breach,
        reset_allowed,
    })
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
async fn wait_for_shutdown() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(windows)]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults() {
        let args = Args::try_parse_from(["hedge-bot"]).unwrap();
        assert_eq!(args.config.to_str().unwrap(), "config/bot.toml");
        assert!(args.symbol.is_none());
        assert!(args.log_level.is_none());
    }

    #[test]
    fn test_cli_overrides() {
        let args = Args::try_parse_from([
            "hedge-bot",
            "-c",
            "/etc/hedge.toml",
            "--symbol",
            "DOGEUSDC",
            "--log-level",
            "debug",
        ])
        .unwrap();
        assert_eq!(args.config.to_str().unwrap(), "/etc/hedge.toml");
        assert_eq!(args.symbol.as_deref(), Some("DOGEUSDC"));
        assert_eq!(args.log_level.as_deref(), Some("debug"));
    }
}
