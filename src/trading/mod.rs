//! Trading logic: risk limits, position ledger, signal aggregation, decisions.

mod aggregator;
mod config;
mod engine;
mod ledger;
mod pipeline;
pub mod risk;

pub use aggregator::{AggregationStrategy, Median, SignalAggregator, WeightedAverage};
pub use config::{AggregationMethod, DecisionConfig, RiskConfig, SignalConfig, TradingConfig};
pub use engine::DecisionEngine;
pub use ledger::{
    LedgerView, OpenRequest, PositionLedger, PositionView, RealizedPnl, ReconcileOutcome,
};
pub use pipeline::{Decision, DecisionPipeline, Execution, TickInput};
