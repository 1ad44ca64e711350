//! Performance metrics for a run: returns, drawdown, win rate, Sharpe.

use serde::{Deserialize, Serialize};

/// Summary statistics computed from an equity curve and closed-trade P&L.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    // === Returns ===
    /// Final equity / initial capital - 1
    pub total_return: f64,

    /// Net realized P&L across closed trades
    pub total_pnl: f64,

    // === Win/Loss Metrics ===
    pub total_trades: usize,

    pub winning_trades: usize,

    pub losing_trades: usize,

    /// Win rate (0.0 to 1.0)
    pub win_rate: f64,

    /// Average profit on winning trades
    pub avg_win: f64,

    /// Average loss on losing trades (absolute value)
    pub avg_loss: f64,

    /// Gross profit / gross loss
    pub profit_factor: f64,

    // === Risk Metrics ===
    /// Maximum drawdown of the equity curve (0.0 to 1.0)
    pub max_drawdown: f64,

    /// Annualized Sharpe ratio of per-tick equity returns
    pub sharpe_ratio: f64,

    /// Annualized Sortino ratio
    pub sortino_ratio: f64,
}
