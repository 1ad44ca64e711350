//! Account-level views derived from the ledger, and the risk budget derived
//! from them.

use serde::{Deserialize, Serialize};

/// Point-in-time account aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AccountState {
    /// Initial capital + realized + unrealized P&L
    pub equity: f64,

    /// Capital not tied up in open positions' cost basis
    pub available_balance: f64,

    /// Realized P&L net of fees
    pub realized_pnl: f64,

    pub unrealized_pnl: f64,

    /// Largest peak-to-trough equity decline observed (0-1)
    pub max_drawdown_seen: f64,
}

impl AccountState {
    pub fn is_valid(&self) -> bool {
        self.equity.is_finite()
            && self.available_balance.is_finite()
            && self.realized_pnl.is_finite()
            && self.unrealized_pnl.is_finite()
            && self.max_drawdown_seen.is_finite()
    }
}

/// Per-tick risk limits. Always replaced, never mutated.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RiskBudget {
    /// Maximum notional for a single position
    pub max_position_size: f64,

    /// Maximum loss to accept on one trade if its stop is hit
    pub max_risk_per_trade: f64,

    /// Maximum combined notional across all assets
    pub max_portfolio_exposure: f64,

    /// Drawdown at which trading stops entirely
    pub drawdown_limit: f64,
}

impl RiskBudget {
    pub fn zero() -> Self {
        Self::default()
    }

    /// A budget that allows no new risk.
    pub fn is_zero(&self) -> bool {
        !(self.max_risk_per_trade > 0.0) || !(self.max_portfolio_exposure > 0.0)
    }
}
