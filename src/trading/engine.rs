//! Decision engine: turns a signal, a ledger view and a risk budget into one
//! order intent per tick.
//!
//! Rule order, first match wins:
//! 1. No usable mark, an intent already in flight, or a PENDING/CLOSING
//!    position -> HOLD
//! 2. Stop loss / take profit crossed -> CLOSE
//! 3. Portfolio above its exposure limit -> REDUCE (or CLOSE)
//! 4. Zero risk budget -> HOLD
//! 5. Signal-driven entry, reversal, add-on and decay rules
//!
//! Reversals are two-phase: CLOSE on this tick, a fresh entry on a later
//! one once the ledger shows the asset flat.

use tracing::{debug, warn};

use super::config::DecisionConfig;
use super::ledger::{LedgerView, PositionView};
use crate::error::{Result, TradingError};
use crate::models::{Direction, IntentAction, IntentReason, OrderIntent, RiskBudget, Side, Signal};

/// Exposure overshoot below this notional is treated as rounding noise.
const EXPOSURE_EPSILON: f64 = 1e-6;

/// Stateless decision engine.
#[derive(Debug, Clone)]
pub struct DecisionEngine {
    config: DecisionConfig,
}

impl DecisionEngine {
    pub fn new(config: DecisionConfig) -> Self {
        Self { config }
    }

    /// Evaluate one tick. Never fails: any error becomes a HOLD carrying the
    /// error text in `detail`.
    pub fn tick(
        &self,
        asset: &str,
        signal: &Signal,
        view: &LedgerView,
        budget: &RiskBudget,
    ) -> OrderIntent {
        match self.try_tick(asset, signal, view, budget) {
            Ok(intent) => intent,
            Err(e) => {
                warn!(asset = %asset, error = %e, "Decision downgraded to HOLD");
                let hint = view.mark_price.filter(|p| p.is_finite()).unwrap_or(0.0);
                OrderIntent::hold(asset, hint, IntentReason::Error).with_detail(e.to_string())
            }
        }
    }

    fn try_tick(
        &self,
        asset: &str,
        signal: &Signal,
        view: &LedgerView,
        budget: &RiskBudget,
    ) -> Result<OrderIntent> {
        if view.asset != asset || signal.asset != asset {
            return Err(TradingError::invalid(format!(
                "inputs for {} / {} passed to {} tick",
                view.asset, signal.asset, asset
            )));
        }
        if !signal.confidence.is_finite() || !(0.0..=1.0).contains(&signal.confidence) {
            return Err(TradingError::invalid(format!(
                "signal confidence out of range: {}",
                signal.confidence
            )));
        }
        let budget_fields = [
            budget.max_position_size,
            budget.max_risk_per_trade,
            budget.max_portfolio_exposure,
            budget.drawdown_limit,
        ];
        if budget_fields.iter().any(|v| !v.is_finite()) {
            return Err(TradingError::invalid("risk budget is not finite"));
        }

        let Some(mark) = view.mark_price.filter(|p| p.is_finite() && *p > 0.0) else {
            return Ok(OrderIntent::hold(asset, 0.0, IntentReason::NoMarket));
        };
        let hold = |reason| OrderIntent::hold(asset, mark, reason);

        if view.in_flight {
            return Ok(hold(IntentReason::InFlight));
        }

        // ==================== Protective exits ====================

        if let Some(position) = &view.position {
            if position.status != crate::models::PositionStatus::Open {
                return Ok(hold(IntentReason::AwaitingFill));
            }
            if let Some(reason) = bracket_trigger(position, mark) {
                debug!(asset = %asset, id = %position.id, reason = %reason, mark, "Bracket triggered");
                return Ok(self.close(asset, position, mark, reason));
            }
        }

        // ==================== Exposure limit ====================

        // Runs under a drawdown-zeroed trade budget too; a fail-closed budget
        // has no limit to reduce toward.
        let excess = view.portfolio_exposure - budget.max_portfolio_exposure;
        if budget.max_portfolio_exposure > 0.0 && excess > EXPOSURE_EPSILON {
            if let Some(position) = &view.position {
                let units = excess * (1.0 + self.config.exposure_buffer) / mark;
                let remainder = (position.size - units) * mark;
                if units >= position.size || remainder < self.config.min_order_notional {
                    return Ok(self.close(asset, position, mark, IntentReason::Exposure));
                }
                return Ok(self.resize(asset, position, IntentAction::Reduce, units, mark, IntentReason::Exposure));
            }
        }

        if budget.is_zero() {
            return Ok(hold(IntentReason::RiskBudget));
        }

        // ==================== Signal rules ====================

        let wanted = match signal.direction {
            Direction::Buy => Side::Long,
            Direction::Sell => Side::Short,
            Direction::Hold => return Ok(hold(IntentReason::Signal)),
        };
        let confidence = signal.confidence;

        let Some(position) = &view.position else {
            if confidence < self.config.entry_threshold {
                return Ok(hold(IntentReason::Signal));
            }
            return Ok(self.open(asset, wanted, mark, budget, view.portfolio_exposure));
        };

        if position.side != wanted {
            if confidence >= self.config.reversal_threshold {
                return Ok(self.close(asset, position, mark, IntentReason::Reversal));
            }
            return Ok(hold(IntentReason::Signal));
        }

        if confidence >= self.config.add_on_threshold {
            let current_notional = position.size * mark;
            let units = self.entry_units(mark, budget, view.portfolio_exposure, current_notional);
            if units * mark < self.config.min_order_notional || units <= 0.0 {
                return Ok(hold(IntentReason::BelowMinimum));
            }
            return Ok(self.resize(asset, position, IntentAction::Increase, units, mark, IntentReason::AddOn));
        }

        if confidence < self.config.reduce_threshold {
            let units = position.size * self.config.reduce_fraction;
            let remainder = (position.size - units) * mark;
            if units >= position.size || remainder < self.config.min_order_notional {
                return Ok(self.close(asset, position, mark, IntentReason::Decay));
            }
            return Ok(self.resize(asset, position, IntentAction::Reduce, units, mark, IntentReason::Decay));
        }

        Ok(hold(IntentReason::Signal))
    }

    // ==================== Sizing ====================

    /// Units to buy for an entry or add-on.
    ///
    /// min(position cap / price, risk budget / stop distance,
    /// exposure headroom less the buffer / price), never negative.
    pub fn entry_units(
        &self,
        mark: f64,
        budget: &RiskBudget,
        portfolio_exposure: f64,
        current_notional: f64,
    ) -> f64 {
        let stop_distance = mark * self.config.stop_loss_pct;
        if !(stop_distance > 0.0) {
            return 0.0;
        }

        let by_position = (budget.max_position_size - current_notional).max(0.0) / mark;
        let by_risk = budget.max_risk_per_trade / stop_distance;
        let headroom = (budget.max_portfolio_exposure - portfolio_exposure).max(0.0);
        let by_exposure = headroom * (1.0 - self.config.exposure_buffer) / mark;

        by_position.min(by_risk).min(by_exposure).max(0.0)
    }

    /// Stop and take-profit prices for an entry at `mark`.
    pub fn brackets(&self, side: Side, mark: f64) -> (f64, f64) {
        let sl = self.config.stop_loss_pct;
        let tp = self.config.take_profit_pct;
        match side {
            Side::Short => (mark * (1.0 + sl), mark * (1.0 - tp).max(0.0)),
            _ => (mark * (1.0 - sl), mark * (1.0 + tp)),
        }
    }

    // ==================== Intent builders ====================

    fn open(&self, asset: &str, side: Side, mark: f64, budget: &RiskBudget, exposure: f64) -> OrderIntent {
        let units = self.entry_units(mark, budget, exposure, 0.0);
        if units <= 0.0 || units * mark < self.config.min_order_notional {
            return OrderIntent::hold(asset, mark, IntentReason::BelowMinimum);
        }

        let (stop_loss, take_profit) = self.brackets(side, mark);
        let action = match side {
            Side::Short => IntentAction::OpenShort,
            _ => IntentAction::OpenLong,
        };
        OrderIntent {
            asset: asset.to_string(),
            action,
            side,
            position_id: None,
            size: units,
            price_hint: mark,
            reason: IntentReason::Entry,
            stop_loss: Some(stop_loss),
            take_profit: (take_profit > 0.0).then_some(take_profit),
            detail: None,
        }
    }

    fn close(&self, asset: &str, position: &PositionView, mark: f64, reason: IntentReason) -> OrderIntent {
        self.resize(asset, position, IntentAction::Close, position.size, mark, reason)
    }

    fn resize(
        &self,
        asset: &str,
        position: &PositionView,
        action: IntentAction,
        units: f64,
        mark: f64,
        reason: IntentReason,
    ) -> OrderIntent {
        OrderIntent {
            asset: asset.to_string(),
            action,
            side: position.side,
            position_id: Some(position.id),
            size: units,
            price_hint: mark,
            reason,
            stop_loss: None,
            take_profit: None,
            detail: None,
        }
    }
}

/// Stop wins over take-profit if both are somehow crossed.
fn bracket_trigger(position: &PositionView, mark: f64) -> Option<IntentReason> {
    let (stop_hit, tp_hit) = match position.side {
        Side::Long => (
            position.stop_loss.is_some_and(|s| mark <= s),
            position.take_profit.is_some_and(|t| mark >= t),
        ),
        Side::Short => (
            position.stop_loss.is_some_and(|s| mark >= s),
            position.take_profit.is_some_and(|t| mark <= t),
        ),
        Side::Flat => (false, false),
    };

    if stop_hit {
        Some(IntentReason::Stop)
    } else if tp_hit {
        Some(IntentReason::TakeProfit)
    } else {
        None
    }
}
