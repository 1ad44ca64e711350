//! Performance metrics over backtest and paper-trading runs.

mod calculator;

pub use calculator::PerformanceCalculator;
