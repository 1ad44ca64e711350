//! Crypto trading decision and risk engine.
//!
//! Turns per-asset model scores into risk-bounded order intents, keeps an
//! authoritative position ledger, and replays history through the same
//! pipeline for deterministic backtests.

mod api;
mod backtest;
mod bot;
mod db;
mod error;
mod metrics;
mod models;
mod trading;

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::api::{ChannelSink, EventSink, FanoutSink, LogSink, MarketEvent, PaperVenue};
use crate::backtest::{load_history, BacktestConfig, Backtester, SlippageModel};
use crate::bot::{load_controls, BotConfig, Supervisor};
use crate::db::{spawn_writer, Database};
use crate::trading::TradingConfig;

/// Trading decision engine CLI.
#[derive(Parser)]
#[command(name = "cryptotrader")]
#[command(about = "Risk-bounded trading decisions, paper trading and backtests", long_about = None)]
struct Cli {
    /// Database URL
    #[arg(short, long, env = "DATABASE_URL", default_value = "sqlite:./cryptotrader.db?mode=rwc")]
    database: String,

    /// Log level (trace, debug, info, warn, error); RUST_LOG overrides
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay history through the decision pipeline
    Backtest {
        /// History file (JSON array of ticks)
        #[arg(long)]
        history: PathBuf,

        /// Trading config file (JSON); defaults when omitted
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Initial capital
        #[arg(long, default_value = "10000")]
        capital: f64,

        /// Seed for slippage jitter
        #[arg(long, default_value = "42")]
        seed: u64,

        /// Ticks between an intent and its fill
        #[arg(long, default_value = "0")]
        latency: u32,

        /// Fee as a fraction of notional
        #[arg(long, default_value = "0.001")]
        fee: f64,

        /// Fill at the exact mark, without slippage
        #[arg(long)]
        no_slippage: bool,

        /// Keep positions open when history ends
        #[arg(long)]
        keep_open: bool,

        /// Write the full report as JSON
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Save the report summary to the database
        #[arg(long)]
        save: bool,
    },

    /// Paper trade a recorded feed against the simulated venue
    Paper {
        /// Feed file (same format as backtest history)
        #[arg(long)]
        feed: PathBuf,

        /// Initial capital
        #[arg(long, default_value = "10000")]
        capital: f64,

        /// Trading config file (JSON); defaults when omitted
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Delay between feed events in milliseconds
        #[arg(long, default_value = "0")]
        interval_ms: u64,

        /// Minimum feed seconds between signal-driven orders per asset
        #[arg(long, default_value = "60")]
        min_trade_interval: i64,

        /// Seed for slippage jitter
        #[arg(long, default_value = "42")]
        seed: u64,

        /// Fill at the exact mark, without slippage
        #[arg(long)]
        no_slippage: bool,

        /// Scheduled pause/resume commands (JSON array of {tick, asset, command})
        #[arg(long)]
        control: Option<PathBuf>,
    },

    /// Show the trading configuration
    Config {
        /// Trading config file (JSON); defaults when omitted
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Show persisted account state and trade statistics
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Setup logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level.to_lowercase()));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Backtest {
            history,
            config,
            capital,
            seed,
            latency,
            fee,
            no_slippage,
            keep_open,
            output,
            save,
        } => {
            let records = load_history(&history)?;
            info!(records = records.len(), path = %history.display(), "Loaded history");

            let config = BacktestConfig {
                initial_capital: to_capital(capital)?,
                trading: load_trading_config(config.as_ref())?,
                slippage: slippage_model(no_slippage),
                fee_rate: fee,
                latency_ticks: latency,
                seed,
                close_at_end: !keep_open,
                ..Default::default()
            };

            let report = Backtester::new(config)?.run(&records)?;
            println!("{}", report);

            if let Some(path) = output {
                let json = serde_json::to_string_pretty(&report)?;
                std::fs::write(&path, json)
                    .with_context(|| format!("Failed to write report {}", path.display()))?;
                info!(path = %path.display(), "Report written");
            }

            if save {
                let db = Database::new(&cli.database).await?;
                let id = db.save_backtest_report(&report, seed).await?;
                info!(id, "Report saved");
            }
        }

        Commands::Paper {
            feed,
            capital,
            config,
            interval_ms,
            min_trade_interval,
            seed,
            no_slippage,
            control,
        } => {
            let mut records = load_history(&feed)?;
            records.sort_by_key(|r| r.tick);

            let controls = match control {
                Some(path) => load_controls(&path)?,
                None => Vec::new(),
            };

            let assets: BTreeSet<String> = records.iter().map(|r| r.market.asset.clone()).collect();
            if assets.is_empty() {
                println!("Feed {} has no ticks.", feed.display());
                return Ok(());
            }

            let db = Arc::new(Database::new(&cli.database).await?);
            let (event_tx, event_rx) = mpsc::channel(1024);
            let writer = spawn_writer(db.clone(), event_rx);

            let sink: Arc<dyn EventSink> = Arc::new(
                FanoutSink::new()
                    .with(Arc::new(LogSink))
                    .with(Arc::new(ChannelSink::new(event_tx))),
            );

            let (fill_tx, fill_rx) = mpsc::channel(1024);
            let venue = Arc::new(PaperVenue::new(
                slippage_model(no_slippage),
                0.001,
                seed,
                Duration::ZERO,
                fill_tx,
            ));

            let bot_config = BotConfig {
                assets: assets.into_iter().collect(),
                initial_capital: to_capital(capital)?,
                trading: load_trading_config(config.as_ref())?,
                min_trade_interval_secs: min_trade_interval,
                ..Default::default()
            };

            info!(
                assets = ?bot_config.assets,
                capital = %bot_config.initial_capital,
                ticks = records.len(),
                controls = controls.len(),
                "Starting paper trading"
            );

            let supervisor = Supervisor::start(bot_config, venue, sink.clone())?;
            let ledger = supervisor.ledger();
            let router = supervisor.spawn_fill_router(fill_rx);
            let snapshots = supervisor.spawn_snapshots();

            let ctrl_c = tokio::signal::ctrl_c();
            tokio::pin!(ctrl_c);

            let mut pending_controls = controls.iter().peekable();
            for record in records {
                tokio::select! {
                    _ = &mut ctrl_c => {
                        info!("Received shutdown signal...");
                        break;
                    }
                    _ = async {
                        while let Some(event) = pending_controls.next_if(|e| e.tick <= record.tick) {
                            if let Err(e) = supervisor.apply(event).await {
                                warn!(asset = %event.asset, error = %e, "Control command failed");
                            }
                        }
                        supervisor.route(MarketEvent::Tick(record.market)).await;
                        if interval_ms > 0 {
                            tokio::time::sleep(Duration::from_millis(interval_ms)).await;
                        }
                    } => {}
                }
            }

            let exits = supervisor.shutdown().await;
            router.abort();
            if let Err(e) = snapshots.await {
                warn!(error = %e, "Snapshot task failed");
            }
            drop(sink);
            if let Err(e) = writer.await {
                warn!(error = %e, "Event writer failed");
            }

            let account = ledger.snapshot();
            println!("\n=== Paper Trading Summary ===");
            println!("Equity:           ${:.2}", account.equity);
            println!("Realized P&L:     ${:.2}", account.realized_pnl);
            println!("Unrealized P&L:   ${:.2}", account.unrealized_pnl);
            println!("Max Drawdown:     {:.2}%", account.max_drawdown_seen * 100.0);
            println!("Closed Positions: {}", ledger.closed_positions().len());
            println!("Open Positions:   {}", ledger.active_positions().len());

            println!("\n=== Asset Loops ===");
            for (asset, exit) in exits {
                println!("  {:<10} {:?}", asset, exit);
            }
        }

        Commands::Config { config } => {
            let config = load_trading_config(config.as_ref())?;
            print_config(&config);
        }

        Commands::Status => {
            let db = Database::new(&cli.database).await?;

            let Some(snapshot) = db.latest_snapshot().await? else {
                println!("No session found. Run 'cryptotrader paper' to start one.");
                return Ok(());
            };
            let summary = db.closed_position_summary().await?;
            let backtests = db.backtest_count().await?;

            println!("\n=== Account ===");
            println!("As Of:            {}", snapshot.recorded_at);
            println!("Equity:           ${:.2}", snapshot.equity);
            println!("Available:        ${:.2}", snapshot.available_balance);
            println!("Exposure:         ${:.2}", snapshot.exposure);
            println!("Realized P&L:     ${:.2}", snapshot.realized_pnl);
            println!("Unrealized P&L:   ${:.2}", snapshot.unrealized_pnl);
            println!("Max Drawdown:     {:.2}%", snapshot.max_drawdown * 100.0);

            println!("\n=== Trading ===");
            println!("Closed Trades:    {}", summary.trades);
            println!("Winners:          {}", summary.winners);
            println!("Total P&L:        ${:.2}", summary.total_pnl);
            println!("Fees Paid:        ${:.2}", summary.total_fees);
            println!("Saved Backtests:  {}", backtests);

            let recent = db.closed_positions(5).await?;
            if !recent.is_empty() {
                println!("\n=== Recent Closes ===");
                for pos in &recent {
                    let pnl_sign = if pos.realized_pnl >= 0.0 { "+" } else { "" };
                    println!(
                        "  {:<8} {:<5} {:.4} @ {:.2} -> {:.2} ({}${:.2}) {}",
                        pos.asset,
                        pos.side,
                        pos.size,
                        pos.entry_price,
                        pos.exit_price,
                        pnl_sign,
                        pos.realized_pnl,
                        pos.exit_reason
                    );
                }
            }

            let intents = db.recent_intents(5).await?;
            if !intents.is_empty() {
                println!("\n=== Recent Intents ===");
                for intent in &intents {
                    let outcome = intent.error_message.as_deref().unwrap_or("ok");
                    println!(
                        "  {:<8} {:<10} {:.4} @ {:.2} {:<12} {}",
                        intent.asset, intent.action, intent.size, intent.price_hint, intent.reason, outcome
                    );
                }
            }
        }
    }

    Ok(())
}

fn load_trading_config(path: Option<&PathBuf>) -> Result<TradingConfig> {
    match path {
        Some(path) => TradingConfig::load(path),
        None => Ok(TradingConfig::default()),
    }
}

fn slippage_model(no_slippage: bool) -> SlippageModel {
    if no_slippage {
        SlippageModel::none()
    } else {
        SlippageModel::default()
    }
}

fn to_capital(capital: f64) -> Result<Decimal> {
    let capital = Decimal::try_from(capital).context("Invalid capital")?;
    if capital <= Decimal::ZERO {
        anyhow::bail!("capital must be positive");
    }
    Ok(capital)
}

fn print_config(config: &TradingConfig) {
    let risk = &config.risk;
    let decision = &config.decision;
    let signal = &config.signal;

    println!("\n=== Risk Limits ===\n");
    println!("  Max Risk Per Trade:   {:.1}%", risk.max_risk_per_trade * 100.0);
    println!("  Max Position:         {:.1}%", risk.max_position_fraction * 100.0);
    println!("  Max Exposure:         {:.1}%", risk.max_portfolio_exposure * 100.0);
    println!("  Drawdown Soft Limit:  {:.1}%", risk.drawdown_soft_limit * 100.0);
    println!("  Drawdown Hard Limit:  {:.1}%", risk.drawdown_hard_limit * 100.0);

    println!("\n=== Decision Rules ===\n");
    println!("  Entry Threshold:      {:.2}", decision.entry_threshold);
    println!("  Reversal Threshold:   {:.2}", decision.reversal_threshold);
    println!("  Add-On Threshold:     {:.2}", decision.add_on_threshold);
    println!("  Reduce Threshold:     {:.2}", decision.reduce_threshold);
    println!("  Reduce Fraction:      {:.0}%", decision.reduce_fraction * 100.0);
    println!("  Stop Loss:            {:.1}%", decision.stop_loss_pct * 100.0);
    println!("  Take Profit:          {:.1}%", decision.take_profit_pct * 100.0);
    println!("  Min Order Notional:   ${:.2}", decision.min_order_notional);
    println!("  Exposure Buffer:      {:.1}%", decision.exposure_buffer * 100.0);

    println!("\n=== Signal Aggregation ===\n");
    println!("  Method:               {:?}", signal.method);
    println!("  Long Threshold:       {:.2}", signal.long_threshold);
    println!("  Short Threshold:      {:.2}", signal.short_threshold);
    println!("  Min Sources:          {}", signal.min_signal_sources);
    if signal.weights.is_empty() {
        println!("  Weights:              equal");
    } else {
        for (source, weight) in &signal.weights {
            println!("  Weight {:<14} {:.2}", source, weight);
        }
    }
}
