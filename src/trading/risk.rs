//! Risk limits evaluator: account state in, risk budget out.
//!
//! Pure and allocation-free, so every asset loop can call it on its own
//! snapshot without coordinating with the others.

use tracing::debug;

use super::config::RiskConfig;
use crate::models::{AccountState, RiskBudget};

/// Compute the risk budget for the current tick.
///
/// Fails closed: a non-finite field, non-positive equity, a drawdown outside
/// [0, 1] or an inconsistent config all produce a zero budget.
pub fn evaluate(account: &AccountState, config: &RiskConfig) -> RiskBudget {
    if !account.is_valid()
        || account.equity <= 0.0
        || !(0.0..=1.0).contains(&account.max_drawdown_seen)
        || !config.is_valid()
    {
        debug!(?account, "Invalid risk inputs, returning zero budget");
        return RiskBudget::zero();
    }

    let scale = drawdown_scale(account.max_drawdown_seen, config);
    let equity = account.equity;

    let max_risk_per_trade = equity * config.max_risk_per_trade * scale;
    let max_position_size =
        (equity * config.max_position_fraction).min(account.available_balance.max(0.0)) * scale;
    let max_portfolio_exposure = equity * config.max_portfolio_exposure;

    RiskBudget {
        max_position_size,
        max_risk_per_trade,
        max_portfolio_exposure,
        drawdown_limit: config.drawdown_hard_limit,
    }
}

/// Linear scale-down between the soft and hard drawdown limits.
pub fn drawdown_scale(drawdown: f64, config: &RiskConfig) -> f64 {
    if drawdown <= config.drawdown_soft_limit {
        1.0
    } else if drawdown >= config.drawdown_hard_limit {
        0.0
    } else {
        (config.drawdown_hard_limit - drawdown)
            / (config.drawdown_hard_limit - config.drawdown_soft_limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_account(equity: f64, drawdown: f64) -> AccountState {
        AccountState {
            equity,
            available_balance: equity,
            realized_pnl: 0.0,
            unrealized_pnl: 0.0,
            max_drawdown_seen: drawdown,
        }
    }

    #[test]
    fn test_nan_equity_fails_closed() {
        let budget = evaluate(&make_account(f64::NAN, 0.0), &RiskConfig::default());
        assert_eq!(budget, RiskBudget::zero());
        assert_eq!(budget.max_position_size, 0.0);
        assert_eq!(budget.max_risk_per_trade, 0.0);
        assert_eq!(budget.max_portfolio_exposure, 0.0);
        assert_eq!(budget.drawdown_limit, 0.0);
        assert!(budget.is_zero());
    }

    #[test]
    fn test_invalid_inputs_fail_closed() {
        let config = RiskConfig::default();
        assert!(evaluate(&make_account(-5.0, 0.0), &config).is_zero());
        assert!(evaluate(&make_account(1000.0, 1.5), &config).is_zero());

        let mut account = make_account(1000.0, 0.0);
        account.unrealized_pnl = f64::INFINITY;
        assert_eq!(evaluate(&account, &config), RiskBudget::zero());

        let bad = RiskConfig {
            drawdown_soft_limit: 0.3,
            drawdown_hard_limit: 0.1,
            ..Default::default()
        };
        assert_eq!(evaluate(&make_account(1000.0, 0.0), &bad), RiskBudget::zero());
    }

    #[test]
    fn test_budget_without_drawdown() {
        let budget = evaluate(&make_account(10000.0, 0.0), &RiskConfig::default());
        assert!((budget.max_risk_per_trade - 100.0).abs() < 1e-9);
        assert!((budget.max_position_size - 2500.0).abs() < 1e-9);
        assert!((budget.max_portfolio_exposure - 5000.0).abs() < 1e-9);
        assert_eq!(budget.drawdown_limit, 0.20);
    }

    #[test]
    fn test_drawdown_scales_linearly_to_zero() {
        let config = RiskConfig::default();

        let halfway = evaluate(&make_account(10000.0, 0.15), &config);
        assert!((halfway.max_risk_per_trade - 50.0).abs() < 1e-9);

        let breaker = evaluate(&make_account(10000.0, 0.20), &config);
        assert_eq!(breaker.max_risk_per_trade, 0.0);
        assert!(breaker.is_zero());
    }

    #[test]
    fn test_position_size_capped_by_available_balance() {
        let mut account = make_account(10000.0, 0.0);
        account.available_balance = 1000.0;
        let budget = evaluate(&account, &RiskConfig::default());
        assert!((budget.max_position_size - 1000.0).abs() < 1e-9);
    }
}
