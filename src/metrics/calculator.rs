//! Calculator for run performance: return, MDD, Sharpe ratio, win rate, etc.

use statrs::statistics::Statistics;

use crate::models::PerformanceMetrics;

/// Periods per year used to annualize per-tick returns.
const ANNUALIZATION_PERIODS: f64 = 252.0;

/// Calculator for computing run performance metrics.
pub struct PerformanceCalculator;

impl PerformanceCalculator {
    /// Calculate metrics from the equity curve (one point per tick) and the
    /// net realized P&L of each closed trade.
    pub fn calculate(initial_capital: f64, equity_curve: &[f64], trade_pnls: &[f64]) -> PerformanceMetrics {
        let mut metrics = PerformanceMetrics::default();

        if let Some(last) = equity_curve.last() {
            if initial_capital > 0.0 {
                metrics.total_return = last / initial_capital - 1.0;
            }
        }

        Self::calculate_trade_metrics(&mut metrics, trade_pnls);
        metrics.max_drawdown = Self::max_drawdown(equity_curve);
        Self::calculate_sharpe_sortino(&mut metrics, equity_curve);

        metrics
    }

    /// Win/loss statistics from closed-trade outcomes.
    fn calculate_trade_metrics(metrics: &mut PerformanceMetrics, pnls: &[f64]) {
        let pnls: Vec<f64> = pnls.iter().copied().filter(|p| p.is_finite()).collect();
        if pnls.is_empty() {
            return;
        }

        let (wins, losses): (Vec<f64>, Vec<f64>) = pnls.iter().partition(|&&p| p > 0.0);
        let losses: Vec<f64> = losses.into_iter().filter(|p| *p < 0.0).collect();

        metrics.total_trades = pnls.len();
        metrics.winning_trades = wins.len();
        metrics.losing_trades = losses.len();
        metrics.total_pnl = pnls.iter().sum();
        metrics.win_rate = wins.len() as f64 / pnls.len() as f64;

        let gross_profit: f64 = wins.iter().sum();
        let gross_loss: f64 = losses.iter().map(|l| l.abs()).sum();

        if !wins.is_empty() {
            metrics.avg_win = gross_profit / wins.len() as f64;
        }
        if !losses.is_empty() {
            metrics.avg_loss = gross_loss / losses.len() as f64;
        }
        if gross_loss > 0.0 {
            metrics.profit_factor = gross_profit / gross_loss;
        }
    }

    /// Largest peak-to-trough decline as a fraction of the peak.
    pub fn max_drawdown(equity_curve: &[f64]) -> f64 {
        let mut peak = f64::MIN;
        let mut max_dd = 0.0f64;

        for &equity in equity_curve.iter().filter(|e| e.is_finite()) {
            if equity > peak {
                peak = equity;
            }
            if peak > 0.0 {
                max_dd = max_dd.max((peak - equity) / peak);
            }
        }

        max_dd.clamp(0.0, 1.0)
    }

    /// Sharpe and Sortino over per-tick equity returns, zero risk-free rate.
    fn calculate_sharpe_sortino(metrics: &mut PerformanceMetrics, equity_curve: &[f64]) {
        let returns: Vec<f64> = equity_curve
            .windows(2)
            .filter(|w| w[0] > 0.0)
            .map(|w| w[1] / w[0] - 1.0)
            .filter(|r| r.is_finite())
            .collect();

        if returns.len() < 2 {
            return;
        }

        let mean = returns.iter().mean();
        let std_dev = returns.iter().std_dev();

        if std_dev > 0.0 {
            metrics.sharpe_ratio = (mean / std_dev) * ANNUALIZATION_PERIODS.sqrt();
        }

        // Downside deviation over all periods, counting gains as zero
        let downside: f64 = returns.iter().map(|r| r.min(0.0).powi(2)).sum::<f64>() / returns.len() as f64;
        let downside_dev = downside.sqrt();
        if downside_dev > 0.0 {
            metrics.sortino_ratio = (mean / downside_dev) * ANNUALIZATION_PERIODS.sqrt();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trade_metrics() {
        let pnls = vec![100.0, -50.0, 200.0, -30.0, 150.0];
        let metrics = PerformanceCalculator::calculate(10000.0, &[10000.0, 10370.0], &pnls);

        assert_eq!(metrics.total_trades, 5);
        assert_eq!(metrics.winning_trades, 3);
        assert_eq!(metrics.losing_trades, 2);
        assert!((metrics.total_pnl - 370.0).abs() < 1e-9);
        assert!((metrics.win_rate - 0.6).abs() < 1e-9);
        assert!((metrics.avg_win - 150.0).abs() < 1e-9);
        assert!((metrics.avg_loss - 40.0).abs() < 1e-9);
        assert!((metrics.profit_factor - 450.0 / 80.0).abs() < 1e-9);
        assert!((metrics.total_return - 0.037).abs() < 1e-9);
    }

    #[test]
    fn test_max_drawdown() {
        let curve = vec![100.0, 150.0, 70.0, 50.0, 150.0, 200.0];
        let dd = PerformanceCalculator::max_drawdown(&curve);
        // 100 / 150
        assert!((dd - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_flat_curve_has_no_ratios() {
        let metrics = PerformanceCalculator::calculate(100.0, &[100.0, 100.0, 100.0], &[]);
        assert_eq!(metrics.sharpe_ratio, 0.0);
        assert_eq!(metrics.sortino_ratio, 0.0);
        assert_eq!(metrics.max_drawdown, 0.0);
        assert_eq!(metrics.total_trades, 0);
    }

    #[test]
    fn test_sharpe_sign_follows_returns() {
        let rising = vec![100.0, 101.0, 103.0, 102.0, 105.0];
        let metrics = PerformanceCalculator::calculate(100.0, &rising, &[]);
        assert!(metrics.sharpe_ratio > 0.0);
        assert!(metrics.sortino_ratio > 0.0);
    }
}
