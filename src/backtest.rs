//! Backtesting engine: replays historical ticks through the live decision
//! pipeline with simulated fills.
//!
//! Features:
//! - Same aggregator, risk evaluator, engine and ledger as live trading
//! - Size-proportional slippage with seeded jitter, proportional fees
//! - Execution latency measured in ticks of the intent's asset
//! - Per-tick trace and summary performance metrics
//!
//! No wall clock and no unseeded randomness: the same history and config
//! always produce the same report.

use std::collections::{BTreeMap, VecDeque};
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::TradingError;
use crate::metrics::PerformanceCalculator;
use crate::models::numeric::{non_negative_decimal, positive_decimal, to_f64};
use crate::models::{
    Direction, Fill, IntentAction, IntentReason, OrderIntent, OrderSide, PerformanceMetrics,
    Position, PositionState, PositionStatus, Side,
};
use crate::trading::{DecisionPipeline, Execution, PositionLedger, TickInput, TradingConfig};

/// Slippage never exceeds half the mark price.
const MAX_SLIPPAGE_BPS: f64 = 5_000.0;

/// Simulated price impact in basis points.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlippageModel {
    /// Fixed offset applied to every fill
    pub base_bps: f64,

    /// Additional offset per unit of size
    pub impact_bps_per_unit: f64,

    /// Upper bound of a uniform random offset drawn from the seeded generator
    pub jitter_bps: f64,
}

impl Default for SlippageModel {
    fn default() -> Self {
        Self {
            base_bps: 5.0, // 0.05%
            impact_bps_per_unit: 0.0,
            jitter_bps: 2.0,
        }
    }
}

impl SlippageModel {
    pub fn none() -> Self {
        Self {
            base_bps: 0.0,
            impact_bps_per_unit: 0.0,
            jitter_bps: 0.0,
        }
    }
}

/// Backtesting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BacktestConfig {
    /// Starting portfolio value
    pub initial_capital: Decimal,

    /// Decision pipeline configuration
    pub trading: TradingConfig,

    pub slippage: SlippageModel,

    /// Fee as a fraction of fill notional
    pub fee_rate: f64,

    /// Ticks of the same asset between an intent and its fill
    pub latency_ticks: u32,

    /// Seed for slippage jitter
    pub seed: u64,

    /// Liquidate open positions at the last mark when history ends
    pub close_at_end: bool,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            initial_capital: dec!(10000),
            trading: TradingConfig::default(),
            slippage: SlippageModel::default(),
            fee_rate: 0.001, // 0.1% fee
            latency_ticks: 0,
            seed: 42,
            close_at_end: true,
        }
    }
}

impl BacktestConfig {
    pub fn validate(&self) -> Result<()> {
        if self.initial_capital <= Decimal::ZERO {
            anyhow::bail!("initial capital must be positive");
        }
        if !(self.fee_rate >= 0.0 && self.fee_rate < 1.0) {
            anyhow::bail!("fee rate must be in [0, 1)");
        }
        let s = &self.slippage;
        if [s.base_bps, s.impact_bps_per_unit, s.jitter_bps]
            .iter()
            .any(|v| !v.is_finite() || *v < 0.0)
        {
            anyhow::bail!("slippage parameters must be finite and non-negative");
        }
        self.trading.validate().context("invalid trading config")?;
        Ok(())
    }
}

/// One historical record: a tick number plus the asset's market data and
/// model scores at that tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryTick {
    pub tick: u64,
    #[serde(flatten)]
    pub market: TickInput,
}

/// Load a JSON array of history records.
pub fn load_history(path: impl AsRef<Path>) -> Result<Vec<HistoryTick>> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read history {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Failed to parse history {}", path.display()))
}

// ==================== Fill Simulator ====================

/// Turns intents into fills at the mark, with slippage and fees.
///
/// Shared by the backtest and the paper venue.
pub struct FillSimulator {
    slippage: SlippageModel,
    fee_rate: f64,
    rng: StdRng,
    sequence: u64,
}

impl FillSimulator {
    pub fn new(slippage: SlippageModel, fee_rate: f64, seed: u64) -> Self {
        Self {
            slippage,
            fee_rate,
            rng: StdRng::seed_from_u64(seed),
            sequence: 0,
        }
    }

    /// Fill `intent` completely against `mark`. HOLD intents produce no fill.
    pub fn fill(
        &mut self,
        intent: &OrderIntent,
        mark: f64,
        timestamp: DateTime<Utc>,
    ) -> crate::error::Result<Option<Fill>> {
        let Some(side) = intent.order_side() else {
            return Ok(None);
        };
        if !(mark.is_finite() && mark > 0.0) {
            return Err(TradingError::invalid(format!("no usable mark for {}", intent.asset)));
        }
        let size = positive_decimal(intent.size, "fill size")?;

        let jitter = if self.slippage.jitter_bps > 0.0 {
            self.rng.gen::<f64>() * self.slippage.jitter_bps
        } else {
            0.0
        };
        let bps = (self.slippage.base_bps + self.slippage.impact_bps_per_unit * intent.size + jitter)
            .min(MAX_SLIPPAGE_BPS);
        let offset = mark * bps / 10_000.0;
        let price = match side {
            OrderSide::Buy => mark + offset,
            OrderSide::Sell => mark - offset,
        };
        let fee = price * intent.size * self.fee_rate;

        self.sequence += 1;
        Ok(Some(Fill {
            fill_id: format!("sim-{}", self.sequence),
            order_id: None,
            asset: intent.asset.clone(),
            side,
            price: positive_decimal(price, "fill price")?,
            size,
            fee: non_negative_decimal(fee, "fee")?,
            timestamp,
            is_simulated: true,
        }))
    }
}

// ==================== Report ====================

/// A fill and what it did to the ledger.
#[derive(Debug, Clone, Serialize)]
pub struct TraceFill {
    pub fill: Fill,
    pub execution: Execution,
}

/// Everything that happened on one history record.
#[derive(Debug, Clone, Serialize)]
pub struct TraceEntry {
    pub tick: u64,
    pub asset: String,
    pub price: f64,
    pub direction: Direction,
    pub confidence: f64,
    pub intent: OrderIntent,
    /// Fills settled on this record, including delayed ones
    pub fills: Vec<TraceFill>,
    pub errors: Vec<String>,
    pub equity: f64,
    pub exposure: f64,
    pub exposure_limit: f64,
}

/// A completed trade in the backtest.
#[derive(Debug, Clone, Serialize)]
pub struct BacktestTrade {
    pub position_id: u64,
    pub asset: String,
    pub side: Side,
    pub size: Decimal,
    pub entry_price: Decimal,
    pub exit_price: Decimal,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
    /// Net of fees
    pub pnl: Decimal,
    pub fees: Decimal,
    pub exit_reason: IntentReason,
}

impl BacktestTrade {
    pub fn from_position(position: &Position) -> Option<Self> {
        let PositionState::Closed {
            exit_price,
            reason,
            closed_at,
            exited_side,
            exited_size,
        } = &position.state
        else {
            return None;
        };
        Some(Self {
            position_id: position.id.0,
            asset: position.asset.clone(),
            side: *exited_side,
            size: *exited_size,
            entry_price: position.entry_price,
            exit_price: *exit_price,
            opened_at: position.opened_at,
            closed_at: *closed_at,
            pnl: position.realized_pnl,
            fees: position.fees_paid,
            exit_reason: *reason,
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct EquityPoint {
    pub tick: u64,
    pub timestamp: DateTime<Utc>,
    pub equity: f64,
}

/// Backtest results.
#[derive(Debug, Clone, Serialize)]
pub struct BacktestReport {
    pub initial_capital: Decimal,
    pub final_equity: f64,
    pub metrics: PerformanceMetrics,
    pub total_fees: Decimal,

    /// History records processed
    pub ticks: usize,

    /// Core errors recorded in the trace
    pub error_count: usize,

    /// Intents still waiting on latency when history ended
    pub abandoned_intents: usize,

    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,

    pub trades: Vec<BacktestTrade>,
    pub equity_curve: Vec<EquityPoint>,
    pub trace: Vec<TraceEntry>,
}

impl std::fmt::Display for BacktestReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let m = &self.metrics;
        writeln!(f, "\n{:=^60}", " BACKTEST RESULTS ")?;
        writeln!(f)?;
        if let (Some(start), Some(end)) = (self.start_time, self.end_time) {
            writeln!(
                f,
                "Period: {} to {} ({} ticks)",
                start.format("%Y-%m-%d %H:%M"),
                end.format("%Y-%m-%d %H:%M"),
                self.ticks
            )?;
            writeln!(f)?;
        }
        writeln!(f, "--- Capital ---")?;
        writeln!(f, "Initial:     ${:.2}", self.initial_capital)?;
        writeln!(f, "Final:       ${:.2}", self.final_equity)?;
        writeln!(f, "Return:      {:.2}%", m.total_return * 100.0)?;
        writeln!(f, "Fees Paid:   ${:.2}", self.total_fees)?;
        writeln!(f)?;
        writeln!(f, "--- Trades ---")?;
        writeln!(f, "Total:       {}", m.total_trades)?;
        writeln!(f, "Winners:     {} ({:.1}%)", m.winning_trades, m.win_rate * 100.0)?;
        writeln!(f, "Losers:      {}", m.losing_trades)?;
        writeln!(f, "Avg Win:     ${:.2}", m.avg_win)?;
        writeln!(f, "Avg Loss:    ${:.2}", m.avg_loss)?;
        writeln!(f, "Profit Factor: {:.2}", m.profit_factor)?;
        writeln!(f)?;
        writeln!(f, "--- Risk Metrics ---")?;
        writeln!(f, "Max Drawdown: {:.2}%", m.max_drawdown * 100.0)?;
        writeln!(f, "Sharpe Ratio: {:.2}", m.sharpe_ratio)?;
        writeln!(f, "Sortino Ratio: {:.2}", m.sortino_ratio)?;
        writeln!(f)?;
        writeln!(f, "--- Execution ---")?;
        writeln!(f, "Errors:      {}", self.error_count)?;
        writeln!(f, "Abandoned:   {}", self.abandoned_intents)?;
        writeln!(f, "{:=^60}", "")?;
        Ok(())
    }
}

// ==================== Backtester ====================

struct QueuedIntent {
    due: u64,
    intent: OrderIntent,
}

/// Mutable state of one run.
struct Run {
    ledger: PositionLedger,
    simulator: FillSimulator,
    pending: BTreeMap<String, VecDeque<QueuedIntent>>,
    asset_ticks: BTreeMap<String, u64>,
    total_fees: Decimal,
}

/// Backtesting engine.
pub struct Backtester {
    config: BacktestConfig,
    pipeline: DecisionPipeline,
}

impl Backtester {
    pub fn new(config: BacktestConfig) -> Result<Self> {
        config.validate()?;
        let pipeline = DecisionPipeline::new(config.trading.clone());
        Ok(Self { config, pipeline })
    }

    /// Replay `history` in tick order. Core errors are recorded in the trace
    /// and the run continues.
    pub fn run(&self, history: &[HistoryTick]) -> Result<BacktestReport> {
        if history.is_empty() {
            anyhow::bail!("history is empty");
        }

        let mut records: Vec<&HistoryTick> = history.iter().collect();
        records.sort_by_key(|r| r.tick);

        info!(
            records = records.len(),
            latency = self.config.latency_ticks,
            seed = self.config.seed,
            "Starting backtest"
        );

        let mut run = Run {
            ledger: PositionLedger::new(self.config.initial_capital),
            simulator: FillSimulator::new(self.config.slippage, self.config.fee_rate, self.config.seed),
            pending: BTreeMap::new(),
            asset_ticks: BTreeMap::new(),
            total_fees: Decimal::ZERO,
        };
        let mut trace = Vec::with_capacity(records.len());
        let mut equity_curve = Vec::with_capacity(records.len() + 1);

        for record in &records {
            let entry = self.step(&mut run, record);
            equity_curve.push(EquityPoint {
                tick: record.tick,
                timestamp: record.market.timestamp,
                equity: entry.equity,
            });
            trace.push(entry);
        }

        // Intents still waiting on latency never reach the market
        let mut abandoned = 0;
        for queue in run.pending.values_mut() {
            for queued in queue.drain(..) {
                abandoned += 1;
                if let Err(e) = self.pipeline.abandon(&run.ledger, &queued.intent) {
                    debug!(asset = %queued.intent.asset, error = %e, "Abandon failed");
                }
            }
        }

        let last = records[records.len() - 1];
        if self.config.close_at_end {
            for position in run.ledger.active_positions() {
                if let Some(entry) = self.liquidate(&mut run, &position, last) {
                    trace.push(entry);
                }
            }
            equity_curve.push(EquityPoint {
                tick: last.tick,
                timestamp: last.market.timestamp,
                equity: run.ledger.snapshot().equity,
            });
        }

        let trades: Vec<BacktestTrade> = run
            .ledger
            .closed_positions()
            .iter()
            .filter_map(BacktestTrade::from_position)
            .collect();
        let pnls: Vec<f64> = trades.iter().map(|t| to_f64(t.pnl)).collect();
        let curve: Vec<f64> = equity_curve.iter().map(|p| p.equity).collect();
        let initial = to_f64(self.config.initial_capital);
        let metrics = PerformanceCalculator::calculate(initial, &curve, &pnls);
        let error_count = trace.iter().map(|e: &TraceEntry| e.errors.len()).sum();

        let report = BacktestReport {
            initial_capital: self.config.initial_capital,
            final_equity: run.ledger.snapshot().equity,
            metrics,
            total_fees: run.total_fees,
            ticks: records.len(),
            error_count,
            abandoned_intents: abandoned,
            start_time: records.first().map(|r| r.market.timestamp),
            end_time: Some(last.market.timestamp),
            trades,
            equity_curve,
            trace,
        };

        info!(
            trades = report.trades.len(),
            final_equity = report.final_equity,
            errors = report.error_count,
            "Backtest complete"
        );
        Ok(report)
    }

    /// Process one history record.
    fn step(&self, run: &mut Run, record: &HistoryTick) -> TraceEntry {
        let market = &record.market;
        let mut errors = Vec::new();
        let mut fills = Vec::new();

        if let Err(e) = self.pipeline.observe(&run.ledger, market) {
            errors.push(format_error(&e));
        }

        let asset_tick = {
            let counter = run.asset_ticks.entry(market.asset.clone()).or_insert(0);
            *counter += 1;
            *counter
        };

        // Settle intents whose latency has elapsed
        let queue = run.pending.entry(market.asset.clone()).or_default();
        while queue.front().is_some_and(|q| q.due <= asset_tick) {
            if let Some(queued) = queue.pop_front() {
                self.settle(
                    &run.ledger,
                    &mut run.simulator,
                    &mut run.total_fees,
                    &queued.intent,
                    market.timestamp,
                    &mut fills,
                    &mut errors,
                );
            }
        }
        let in_flight = !queue.is_empty();

        let decision = self.pipeline.decide(&run.ledger, market, in_flight);
        let intent = decision.intent;

        if !intent.is_hold() {
            match self.pipeline.begin(&run.ledger, &intent) {
                Err(e) => errors.push(format_error(&e)),
                Ok(()) if self.config.latency_ticks == 0 => self.settle(
                    &run.ledger,
                    &mut run.simulator,
                    &mut run.total_fees,
                    &intent,
                    market.timestamp,
                    &mut fills,
                    &mut errors,
                ),
                Ok(()) => run
                    .pending
                    .entry(market.asset.clone())
                    .or_default()
                    .push_back(QueuedIntent {
                        due: asset_tick + u64::from(self.config.latency_ticks),
                        intent: intent.clone(),
                    }),
            }
        }

        TraceEntry {
            tick: record.tick,
            asset: market.asset.clone(),
            price: market.price,
            direction: decision.signal.direction,
            confidence: decision.signal.confidence,
            intent,
            fills,
            errors,
            equity: run.ledger.snapshot().equity,
            exposure: run.ledger.total_exposure(),
            exposure_limit: decision.budget.max_portfolio_exposure,
        }
    }

    /// Fill an intent at the asset's current mark and apply it.
    #[allow(clippy::too_many_arguments)]
    fn settle(
        &self,
        ledger: &PositionLedger,
        simulator: &mut FillSimulator,
        total_fees: &mut Decimal,
        intent: &OrderIntent,
        timestamp: DateTime<Utc>,
        fills: &mut Vec<TraceFill>,
        errors: &mut Vec<String>,
    ) {
        let mark = ledger.mark_price(&intent.asset).unwrap_or(intent.price_hint);
        let result = simulator
            .fill(intent, mark, timestamp)
            .and_then(|fill| fill.ok_or_else(|| TradingError::invalid("intent produced no fill")))
            .and_then(|fill| {
                self.pipeline
                    .execute(ledger, intent, &fill)
                    .map(|execution| TraceFill { fill, execution })
            });

        match result {
            Ok(settled) => {
                *total_fees += settled.fill.fee;
                fills.push(settled);
            }
            Err(e) => {
                debug!(asset = %intent.asset, action = %intent.action, error = %e, "Simulated execution failed");
                errors.push(format_error(&e));
                if let Err(e) = self.pipeline.abandon(ledger, intent) {
                    errors.push(format_error(&e));
                }
            }
        }
    }

    /// Close a position left open when history ends.
    fn liquidate(&self, run: &mut Run, position: &Position, last: &HistoryTick) -> Option<TraceEntry> {
        if position.status() == PositionStatus::Pending {
            return None;
        }
        let mark = run.ledger.mark_price(&position.asset)?;

        let mut intent = OrderIntent::hold(&position.asset, mark, IntentReason::EndOfData);
        intent.action = IntentAction::Close;
        intent.side = position.side;
        intent.position_id = Some(position.id);
        intent.size = to_f64(position.size);

        let mut fills = Vec::new();
        let mut errors = Vec::new();
        match self.pipeline.begin(&run.ledger, &intent) {
            Ok(()) => self.settle(
                &run.ledger,
                &mut run.simulator,
                &mut run.total_fees,
                &intent,
                last.market.timestamp,
                &mut fills,
                &mut errors,
            ),
            Err(e) => errors.push(format_error(&e)),
        }

        Some(TraceEntry {
            tick: last.tick,
            asset: position.asset.clone(),
            price: mark,
            direction: Direction::Hold,
            confidence: 0.0,
            intent,
            fills,
            errors,
            equity: run.ledger.snapshot().equity,
            exposure: run.ledger.total_exposure(),
            exposure_limit: run.ledger.exposure_limit().unwrap_or(0.0),
        })
    }
}

fn format_error(e: &TradingError) -> String {
    format!("{}: {}", e.kind(), e)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn make_tick(tick: u64, asset: &str, price: f64, score: f64) -> HistoryTick {
        HistoryTick {
            tick,
            market: TickInput {
                asset: asset.to_string(),
                price,
                timestamp: DateTime::from_timestamp(1_700_000_000 + tick as i64 * 60, 0).unwrap(),
                scores: [("lstm".to_string(), score), ("transformer".to_string(), score)]
                    .into_iter()
                    .collect(),
                indicators: BTreeMap::new(),
            },
        }
    }

    fn trending_history() -> Vec<HistoryTick> {
        let prices = [100.0, 101.0, 102.5, 104.0, 106.0, 103.0, 99.0, 97.0, 98.0, 101.0, 105.0, 108.0];
        let scores = [0.9, 0.7, 0.65, 0.2, 0.9, -0.9, -0.9, -0.7, 0.0, 0.9, 0.95, 0.95];
        let mut history = Vec::new();
        for (i, (p, s)) in prices.iter().zip(scores.iter()).enumerate() {
            history.push(make_tick(i as u64 * 2, "BTC", *p, *s));
            history.push(make_tick(i as u64 * 2 + 1, "ETH", p / 20.0, -s));
        }
        history
    }

    #[test]
    fn test_identical_runs_produce_identical_reports() {
        let config = BacktestConfig {
            latency_ticks: 1,
            ..Default::default()
        };
        let history = trending_history();

        let first = Backtester::new(config.clone()).unwrap().run(&history).unwrap();
        let second = Backtester::new(config).unwrap().run(&history).unwrap();

        let a = serde_json::to_string(&first).unwrap();
        let b = serde_json::to_string(&second).unwrap();
        assert_eq!(a, b);
        assert!(!first.trades.is_empty());
    }

    #[test]
    fn test_take_profit_closes_position() {
        let config = BacktestConfig {
            slippage: SlippageModel::none(),
            fee_rate: 0.0,
            close_at_end: false,
            ..Default::default()
        };
        let history = vec![
            make_tick(0, "BTC", 100.0, 0.9),
            make_tick(1, "BTC", 106.0, 0.9),
        ];
        let report = Backtester::new(config).unwrap().run(&history).unwrap();

        assert_eq!(report.trace[0].intent.action, IntentAction::OpenLong);
        assert_eq!(report.trace[1].intent.reason, IntentReason::TakeProfit);
        assert_eq!(report.trades.len(), 1);
        // 25 units from 100 to 106
        assert_eq!(report.trades[0].pnl, dec!(150));
        assert!((report.final_equity - 10150.0).abs() < 1e-9);
    }

    #[test]
    fn test_latency_delays_fill() {
        let config = BacktestConfig {
            slippage: SlippageModel::none(),
            fee_rate: 0.0,
            latency_ticks: 2,
            close_at_end: false,
            ..Default::default()
        };
        let history = vec![
            make_tick(0, "BTC", 100.0, 0.9),
            make_tick(1, "BTC", 101.0, 0.9),
            make_tick(2, "BTC", 102.0, 0.9),
        ];
        let report = Backtester::new(config).unwrap().run(&history).unwrap();

        assert!(report.trace[0].fills.is_empty());
        assert_eq!(report.trace[1].intent.reason, IntentReason::InFlight);
        assert!(report.trace[1].fills.is_empty());
        assert_eq!(report.trace[2].fills.len(), 1);
        assert_eq!(report.trace[2].fills[0].fill.price, dec!(102));
    }

    #[test]
    fn test_pending_intents_abandoned_at_end() {
        let config = BacktestConfig {
            latency_ticks: 5,
            ..Default::default()
        };
        let history = vec![make_tick(0, "BTC", 100.0, 0.9), make_tick(1, "BTC", 100.0, 0.9)];
        let report = Backtester::new(config).unwrap().run(&history).unwrap();
        assert_eq!(report.abandoned_intents, 1);
        assert!(report.trades.is_empty());
    }

    #[test]
    fn test_close_at_end_liquidates() {
        let config = BacktestConfig {
            slippage: SlippageModel::none(),
            fee_rate: 0.0,
            ..Default::default()
        };
        let history = vec![make_tick(0, "BTC", 100.0, 0.9), make_tick(1, "BTC", 101.0, 0.7)];
        let report = Backtester::new(config).unwrap().run(&history).unwrap();

        assert_eq!(report.trades.len(), 1);
        assert_eq!(report.trades[0].exit_reason, IntentReason::EndOfData);
        assert_eq!(report.trace.len(), 3);
    }

    #[test]
    fn test_errors_are_recorded_and_run_continues() {
        let mut history = vec![make_tick(0, "BTC", 100.0, 0.9)];
        history.push(make_tick(1, "BTC", f64::NAN, 0.9));
        history.push(make_tick(2, "BTC", 99.0, 0.9));
        let report = Backtester::new(BacktestConfig::default()).unwrap().run(&history).unwrap();

        assert_eq!(report.ticks, 3);
        assert!(report.error_count >= 1);
        assert_eq!(report.trace[1].intent.reason, IntentReason::NoMarket);
    }

    #[test]
    fn test_fill_simulator_slippage_and_fee() {
        let slippage = SlippageModel {
            base_bps: 10.0,
            impact_bps_per_unit: 1.0,
            jitter_bps: 0.0,
        };
        let mut simulator = FillSimulator::new(slippage, 0.001, 7);
        let mut intent = OrderIntent::hold("BTC", 100.0, IntentReason::Entry);
        intent.action = IntentAction::OpenLong;
        intent.side = Side::Long;
        intent.size = 10.0;

        let fill = simulator
            .fill(&intent, 100.0, DateTime::<Utc>::UNIX_EPOCH)
            .unwrap()
            .unwrap();
        // 10 + 1 * 10 = 20 bps on 100
        assert!((to_f64(fill.price) - 100.2).abs() < 1e-9);
        assert!((to_f64(fill.fee) - 1.002).abs() < 1e-9);
        assert!(fill.is_simulated);
    }

    #[test]
    fn test_seeded_jitter_is_reproducible() {
        let mut intent = OrderIntent::hold("BTC", 100.0, IntentReason::Entry);
        intent.action = IntentAction::OpenShort;
        intent.side = Side::Short;
        intent.size = 1.0;

        let prices = |seed| {
            let mut sim = FillSimulator::new(SlippageModel::default(), 0.0, seed);
            (0..5)
                .map(|_| sim.fill(&intent, 100.0, DateTime::<Utc>::UNIX_EPOCH).unwrap().unwrap().price)
                .collect::<Vec<_>>()
        };
        assert_eq!(prices(1), prices(1));
        assert!(prices(1).iter().all(|p| *p < dec!(100)));
    }

    #[test]
    fn test_history_json_round_trip_fields() {
        let raw = r#"[{"tick": 3, "asset": "SOL", "price": 21.5,
            "timestamp": "2024-01-01T00:00:00Z", "scores": {"lstm": 0.4}}]"#;
        let history: Vec<HistoryTick> = serde_json::from_str(raw).unwrap();
        assert_eq!(history[0].tick, 3);
        assert_eq!(history[0].market.asset, "SOL");
        assert!(history[0].market.indicators.is_empty());
    }

    fn wide_position_config() -> BacktestConfig {
        let mut trading = TradingConfig::default();
        // Two full-size positions would breach the 50% portfolio limit
        trading.risk.max_position_fraction = 0.4;
        BacktestConfig {
            trading,
            slippage: SlippageModel::none(),
            fee_rate: 0.0,
            close_at_end: false,
            ..Default::default()
        }
    }

    #[test]
    fn test_exposure_limit_shared_across_assets() {
        let history = vec![
            make_tick(0, "BTC", 100.0, 0.9),
            make_tick(1, "ETH", 100.0, 0.9),
            make_tick(2, "SOL", 100.0, 0.9),
        ];
        let report = Backtester::new(wide_position_config()).unwrap().run(&history).unwrap();

        assert_eq!(report.trace[0].intent.action, IntentAction::OpenLong);
        assert!((report.trace[0].intent.size - 40.0).abs() < 1e-9);
        // Only the remaining 1000 of headroom, less the buffer
        assert_eq!(report.trace[1].intent.action, IntentAction::OpenLong);
        assert!((report.trace[1].intent.size - 9.9).abs() < 1e-9);
        assert!(report.trace[2].intent.is_hold());
        assert_eq!(report.trace[2].intent.reason, IntentReason::BelowMinimum);

        let last = &report.trace[2];
        assert!((last.exposure - 4990.0).abs() < 1e-6);
        assert!((last.exposure_limit - 5000.0).abs() < 1e-6);
    }

    #[test]
    fn test_mark_drift_over_limit_is_reduced() {
        let history = vec![
            make_tick(0, "BTC", 100.0, 0.9),
            make_tick(1, "ETH", 100.0, 0.9),
            // ETH +4% pushes exposure past 50% of equity
            make_tick(2, "ETH", 104.0, 0.7),
        ];
        let report = Backtester::new(wide_position_config()).unwrap().run(&history).unwrap();

        let drift = &report.trace[2];
        assert_eq!(drift.intent.action, IntentAction::Reduce);
        assert_eq!(drift.intent.reason, IntentReason::Exposure);
        assert_eq!(drift.fills.len(), 1);
        assert!(drift.exposure <= drift.exposure_limit + 1e-6);
    }

    proptest! {
        #[test]
        fn exposure_bounded_across_assets(
            steps in prop::collection::vec((0usize..3, -0.05f64..0.05, -1.0f64..1.0), 1..120),
        ) {
            let assets = ["BTC", "ETH", "SOL"];
            let mut prices = [100.0, 50.0, 20.0];
            let history: Vec<HistoryTick> = steps
                .iter()
                .enumerate()
                .map(|(i, (asset, change, score))| {
                    prices[*asset] *= 1.0 + change;
                    make_tick(i as u64, assets[*asset], prices[*asset], *score)
                })
                .collect();

            let report = Backtester::new(wide_position_config()).unwrap().run(&history).unwrap();
            for entry in &report.trace {
                prop_assert!(entry.equity >= 0.0);
                prop_assert!(
                    entry.exposure <= entry.exposure_limit + 1e-6,
                    "tick {} {}: exposure {} over limit {}",
                    entry.tick,
                    entry.asset,
                    entry.exposure,
                    entry.exposure_limit
                );
            }
        }

        #[test]
        fn equity_stays_non_negative_and_exposure_bounded(
            steps in prop::collection::vec((-0.04f64..0.04, -1.0f64..1.0), 1..80),
        ) {
            let config = BacktestConfig {
                slippage: SlippageModel::none(),
                fee_rate: 0.0,
                ..Default::default()
            };
            let mut price = 100.0;
            let history: Vec<HistoryTick> = steps
                .iter()
                .enumerate()
                .map(|(i, (change, score))| {
                    price *= 1.0 + change;
                    make_tick(i as u64, "BTC", price, *score)
                })
                .collect();

            let report = Backtester::new(config).unwrap().run(&history).unwrap();
            for entry in &report.trace {
                prop_assert!(entry.equity >= 0.0);
                prop_assert!(entry.exposure <= entry.exposure_limit + 1e-6);
            }
            prop_assert!(report.final_equity >= 0.0);
        }
    }
}
