//! One asset tick end to end: mark the ledger, size the risk budget,
//! aggregate signals, decide, and later apply the resulting fill.
//!
//! Shared by the backtest simulator and the live asset loops so both run
//! identical decision logic.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::aggregator::SignalAggregator;
use super::config::TradingConfig;
use super::engine::DecisionEngine;
use super::ledger::{OpenRequest, PositionLedger, RealizedPnl, ReconcileOutcome};
use super::risk;
use crate::error::{Result, TradingError};
use crate::models::numeric::{positive_decimal, to_f64};
use crate::models::{
    AccountState, Fill, IntentAction, IntentReason, OrderIntent, PositionId, PositionStatus,
    RiskBudget, Signal,
};

/// Market data and model output for one asset at one tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickInput {
    pub asset: String,
    pub price: f64,
    pub timestamp: DateTime<Utc>,
    /// Model score per source id, nominally in [-1, 1]
    #[serde(default)]
    pub scores: BTreeMap<String, f64>,
    /// Named technical indicators, normalized to [-1, 1]
    #[serde(default)]
    pub indicators: BTreeMap<String, f64>,
}

/// Everything produced while deciding one tick.
#[derive(Debug, Clone, Serialize)]
pub struct Decision {
    pub account: AccountState,
    pub budget: RiskBudget,
    pub signal: Signal,
    pub intent: OrderIntent,
}

/// Ledger effect of applying a fill to its intent.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Execution {
    Opened { position_id: PositionId },
    Increased { position_id: PositionId },
    Reduced { position_id: PositionId },
    Closed { pnl: RealizedPnl },
    /// Fill id already applied
    Duplicate,
}

/// Aggregator, risk evaluator and decision engine bound to one config.
pub struct DecisionPipeline {
    config: TradingConfig,
    aggregator: SignalAggregator,
    engine: DecisionEngine,
}

impl DecisionPipeline {
    pub fn new(config: TradingConfig) -> Self {
        let aggregator = SignalAggregator::new(config.signal.clone());
        let engine = DecisionEngine::new(config.decision.clone());
        debug!(strategy = aggregator.strategy_name(), "Decision pipeline ready");
        Self {
            config,
            aggregator,
            engine,
        }
    }

    /// Record the tick's price as the asset's mark.
    pub fn observe(&self, ledger: &PositionLedger, input: &TickInput) -> Result<()> {
        ledger.mark(&input.asset, input.price, input.timestamp)
    }

    /// Decide the tick's intent from the current ledger state.
    ///
    /// Call after [`observe`](Self::observe). A tick whose price is unusable
    /// holds with NO_MARKET instead of acting on a stale mark.
    pub fn decide(&self, ledger: &PositionLedger, input: &TickInput, in_flight: bool) -> Decision {
        let account = ledger.snapshot();
        let budget = risk::evaluate(&account, &self.config.risk);
        ledger.set_exposure_limit(budget.max_portfolio_exposure);

        let signal = self.aggregator.aggregate(
            &input.asset,
            &input.scores,
            &input.indicators,
            &self.config.signal.weights,
        );

        let intent = if input.price.is_finite() && input.price > 0.0 {
            let view = ledger.view(&input.asset).with_in_flight(in_flight);
            self.engine.tick(&input.asset, &signal, &view, &budget)
        } else {
            OrderIntent::hold(&input.asset, 0.0, IntentReason::NoMarket)
        };

        if !intent.is_hold() {
            debug!(
                asset = %input.asset,
                action = %intent.action,
                reason = %intent.reason,
                size = intent.size,
                confidence = signal.confidence,
                "Intent decided"
            );
        }

        Decision {
            account,
            budget,
            signal,
            intent,
        }
    }

    /// Ledger bookkeeping when an intent is handed to the venue: an exit
    /// moves its position to CLOSING.
    pub fn begin(&self, ledger: &PositionLedger, intent: &OrderIntent) -> Result<()> {
        if intent.action == IntentAction::Close {
            ledger.request_close(target(intent)?)?;
        }
        Ok(())
    }

    /// Undo [`begin`](Self::begin) for an intent that will never fill.
    pub fn abandon(&self, ledger: &PositionLedger, intent: &OrderIntent) -> Result<()> {
        if intent.action == IntentAction::Close {
            let id = target(intent)?;
            if ledger.position(id).is_some_and(|p| p.is_active()) {
                ledger.abort_close(id)?;
            }
        }
        Ok(())
    }

    /// Take over a PENDING position created from a fill nobody claimed:
    /// attach default brackets around its entry and confirm it, so the
    /// engine manages it like any other open position.
    pub fn adopt(&self, ledger: &PositionLedger, id: PositionId) -> Result<()> {
        let position = ledger.position(id).ok_or(TradingError::NotFound(id))?;
        if position.status() != PositionStatus::Pending {
            return Ok(());
        }

        let (stop, take_profit) = self.engine.brackets(position.side, to_f64(position.entry_price));
        let stop = position.stop_loss.is_none().then_some(stop);
        let take_profit = (position.take_profit.is_none() && take_profit > 0.0).then_some(take_profit);
        ledger.adjust(id, 0.0, stop, take_profit)?;
        ledger.confirm(id)?;

        info!(
            asset = %position.asset,
            id = %id,
            side = %position.side,
            size = %position.size,
            stop = ?stop,
            take_profit = ?take_profit,
            "Adopted unmatched position"
        );
        Ok(())
    }

    /// Apply the fill for `intent` to the ledger.
    pub fn execute(&self, ledger: &PositionLedger, intent: &OrderIntent, fill: &Fill) -> Result<Execution> {
        if intent.is_hold() {
            return Err(TradingError::invalid("HOLD intents are never executed"));
        }
        if fill.asset != intent.asset {
            return Err(TradingError::invalid(format!(
                "fill {} for {} does not match {} intent",
                fill.fill_id, fill.asset, intent.asset
            )));
        }
        if intent.order_side() != Some(fill.side) {
            return Err(TradingError::invalid(format!(
                "fill {} side does not match {} intent",
                fill.fill_id, intent.action
            )));
        }
        if ledger.has_seen_fill(&fill.asset, &fill.fill_id) {
            return Ok(Execution::Duplicate);
        }

        let execution = match intent.action {
            IntentAction::OpenLong | IntentAction::OpenShort => {
                // Later partial fills of the order that opened the position
                if let Some(id) = opened_by(ledger, intent, fill) {
                    return match ledger.reconcile(fill)? {
                        ReconcileOutcome::Duplicate => Ok(Execution::Duplicate),
                        ReconcileOutcome::Increased(_) => {
                            debug!(asset = %intent.asset, id = %id, fill = %fill.fill_id, "Partial entry fill added");
                            Ok(Execution::Increased { position_id: id })
                        }
                        other => Err(TradingError::invalid(format!(
                            "entry fill {} reconciled as {:?}",
                            fill.fill_id, other
                        ))),
                    };
                }
                let mut request = OpenRequest::new(&intent.asset, intent.side, fill.size, fill.price);
                request.stop_loss = intent
                    .stop_loss
                    .map(|p| positive_decimal(p, "stop loss"))
                    .transpose()?;
                request.take_profit = intent
                    .take_profit
                    .map(|p| positive_decimal(p, "take profit"))
                    .transpose()?;
                request.fee = fill.fee;
                request.order_id = fill.order_id.clone();
                request.opened_at = Some(fill.timestamp);
                Execution::Opened {
                    position_id: ledger.open_bracketed(request)?,
                }
            }
            IntentAction::Increase => {
                let id = target(intent)?;
                ledger.increase(id, fill.size, fill.price, fill.fee)?;
                Execution::Increased { position_id: id }
            }
            IntentAction::Reduce | IntentAction::Close => {
                let id = target(intent)?;
                if intent.action == IntentAction::Close {
                    ledger.request_close(id)?;
                }
                match ledger.reduce(id, fill.size, fill.price, fill.fee, intent.reason)? {
                    Some(pnl) => Execution::Closed { pnl },
                    None => Execution::Reduced { position_id: id },
                }
            }
            IntentAction::Hold => return Err(TradingError::invalid("HOLD intents are never executed")),
        };

        ledger.remember_fill(&fill.asset, &fill.fill_id);

        if let Execution::Closed { pnl } = &execution {
            info!(
                asset = %intent.asset,
                id = %pnl.position_id,
                reason = %intent.reason,
                pnl = %pnl.amount,
                "Position closed"
            );
        }
        Ok(execution)
    }
}

/// Active position already opened by the same order as `fill`.
fn opened_by(ledger: &PositionLedger, intent: &OrderIntent, fill: &Fill) -> Option<PositionId> {
    let order_id = fill.order_id.as_deref()?;
    ledger
        .active_position(&intent.asset)
        .filter(|p| p.side == intent.side && p.order_id.as_deref() == Some(order_id))
        .map(|p| p.id)
}

fn target(intent: &OrderIntent) -> Result<PositionId> {
    intent
        .position_id
        .ok_or_else(|| TradingError::invalid(format!("{} intent without a position", intent.action)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{OrderSide, PositionStatus};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn make_input(price: f64, score: f64) -> TickInput {
        TickInput {
            asset: "BTC".to_string(),
            price,
            timestamp: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
            scores: [("a".to_string(), score), ("b".to_string(), score)]
                .into_iter()
                .collect(),
            indicators: BTreeMap::new(),
        }
    }

    fn make_fill(id: &str, side: OrderSide, price: Decimal, size: Decimal) -> Fill {
        Fill {
            fill_id: id.to_string(),
            order_id: None,
            asset: "BTC".to_string(),
            side,
            price,
            size,
            fee: Decimal::ZERO,
            timestamp: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
            is_simulated: true,
        }
    }

    #[test]
    fn test_open_then_take_profit() {
        let pipeline = DecisionPipeline::new(TradingConfig::default());
        let ledger = PositionLedger::new(dec!(10000));

        let input = make_input(100.0, 0.9);
        pipeline.observe(&ledger, &input).unwrap();
        let decision = pipeline.decide(&ledger, &input, false);
        assert_eq!(decision.intent.action, IntentAction::OpenLong);
        // position cap 25% of 10000 at price 100
        assert!((decision.intent.size - 25.0).abs() < 1e-9);

        let fill = make_fill("f1", OrderSide::Buy, dec!(100), dec!(25));
        let execution = pipeline.execute(&ledger, &decision.intent, &fill).unwrap();
        let Execution::Opened { position_id } = execution else {
            panic!("expected open, got {:?}", execution);
        };
        let position = ledger.position(position_id).unwrap();
        assert_eq!(position.take_profit, Some(dec!(105)));

        let input = make_input(106.0, 0.9);
        pipeline.observe(&ledger, &input).unwrap();
        let decision = pipeline.decide(&ledger, &input, false);
        assert_eq!(decision.intent.action, IntentAction::Close);
        assert_eq!(decision.intent.reason, IntentReason::TakeProfit);

        pipeline.begin(&ledger, &decision.intent).unwrap();
        assert_eq!(ledger.position(position_id).unwrap().status(), PositionStatus::Closing);

        let fill = make_fill("f2", OrderSide::Sell, dec!(106), dec!(25));
        let execution = pipeline.execute(&ledger, &decision.intent, &fill).unwrap();
        let Execution::Closed { pnl } = execution else {
            panic!("expected close, got {:?}", execution);
        };
        assert_eq!(pnl.amount, dec!(150));
        assert!(ledger.active_position("BTC").is_none());
    }

    #[test]
    fn test_duplicate_fill_is_ignored() {
        let pipeline = DecisionPipeline::new(TradingConfig::default());
        let ledger = PositionLedger::new(dec!(10000));
        let input = make_input(100.0, 0.9);
        pipeline.observe(&ledger, &input).unwrap();
        let decision = pipeline.decide(&ledger, &input, false);

        let fill = make_fill("f1", OrderSide::Buy, dec!(100), dec!(10));
        pipeline.execute(&ledger, &decision.intent, &fill).unwrap();
        assert_eq!(
            pipeline.execute(&ledger, &decision.intent, &fill).unwrap(),
            Execution::Duplicate
        );
        assert_eq!(ledger.active_positions().len(), 1);
    }

    #[test]
    fn test_partial_entry_fills_accumulate() {
        let pipeline = DecisionPipeline::new(TradingConfig::default());
        let ledger = PositionLedger::new(dec!(10000));
        let input = make_input(100.0, 0.9);
        pipeline.observe(&ledger, &input).unwrap();
        let decision = pipeline.decide(&ledger, &input, false);
        assert_eq!(decision.intent.action, IntentAction::OpenLong);

        let mut first = make_fill("f1", OrderSide::Buy, dec!(100), dec!(10));
        first.order_id = Some("o1".to_string());
        let mut second = make_fill("f2", OrderSide::Buy, dec!(102), dec!(15));
        second.order_id = Some("o1".to_string());

        let Execution::Opened { position_id } =
            pipeline.execute(&ledger, &decision.intent, &first).unwrap()
        else {
            panic!("first fill should open");
        };
        assert_eq!(
            pipeline.execute(&ledger, &decision.intent, &second).unwrap(),
            Execution::Increased { position_id }
        );
        assert_eq!(
            pipeline.execute(&ledger, &decision.intent, &second).unwrap(),
            Execution::Duplicate
        );

        let position = ledger.position(position_id).unwrap();
        assert_eq!(position.size, dec!(25));
        assert_eq!(position.entry_price, dec!(101.2));
        assert_eq!(position.take_profit, Some(dec!(105)));
    }

    #[test]
    fn test_entry_fill_from_other_order_conflicts() {
        let pipeline = DecisionPipeline::new(TradingConfig::default());
        let ledger = PositionLedger::new(dec!(10000));
        let input = make_input(100.0, 0.9);
        pipeline.observe(&ledger, &input).unwrap();
        let decision = pipeline.decide(&ledger, &input, false);

        let mut first = make_fill("f1", OrderSide::Buy, dec!(100), dec!(10));
        first.order_id = Some("o1".to_string());
        let mut other = make_fill("f2", OrderSide::Buy, dec!(100), dec!(10));
        other.order_id = Some("o2".to_string());

        pipeline.execute(&ledger, &decision.intent, &first).unwrap();
        let err = pipeline.execute(&ledger, &decision.intent, &other).unwrap_err();
        assert_eq!(err.kind(), "CONFLICT");
    }

    #[test]
    fn test_adopted_placeholder_trades_again() {
        let pipeline = DecisionPipeline::new(TradingConfig::default());
        let ledger = PositionLedger::new(dec!(10000));
        pipeline.observe(&ledger, &make_input(100.0, 0.0)).unwrap();

        let foreign = make_fill("ext-1", OrderSide::Buy, dec!(100), dec!(20));
        let ReconcileOutcome::Placeholder(id) = ledger.reconcile(&foreign).unwrap() else {
            panic!("expected a placeholder");
        };
        assert_eq!(ledger.position(id).unwrap().status(), PositionStatus::Pending);

        pipeline.adopt(&ledger, id).unwrap();
        let position = ledger.position(id).unwrap();
        assert_eq!(position.status(), PositionStatus::Open);
        assert_eq!(position.stop_loss, Some(dec!(98)));
        assert_eq!(position.take_profit, Some(dec!(105)));

        // Adopting twice changes nothing
        pipeline.adopt(&ledger, id).unwrap();

        let input = make_input(80.0, 0.95);
        pipeline.observe(&ledger, &input).unwrap();
        let decision = pipeline.decide(&ledger, &input, false);
        assert_eq!(decision.intent.action, IntentAction::Close);
        assert_eq!(decision.intent.reason, IntentReason::Stop);
        assert_eq!(decision.intent.position_id, Some(id));
    }

    #[test]
    fn test_mismatched_fill_rejected() {
        let pipeline = DecisionPipeline::new(TradingConfig::default());
        let ledger = PositionLedger::new(dec!(10000));
        let input = make_input(100.0, 0.9);
        pipeline.observe(&ledger, &input).unwrap();
        let decision = pipeline.decide(&ledger, &input, false);

        let fill = make_fill("f1", OrderSide::Sell, dec!(100), dec!(10));
        let err = pipeline.execute(&ledger, &decision.intent, &fill).unwrap_err();
        assert_eq!(err.kind(), "INVALID_INPUT");
    }

    #[test]
    fn test_bad_price_holds_without_market() {
        let pipeline = DecisionPipeline::new(TradingConfig::default());
        let ledger = PositionLedger::new(dec!(10000));
        let input = make_input(f64::NAN, 0.9);
        assert!(pipeline.observe(&ledger, &input).is_err());

        let decision = pipeline.decide(&ledger, &input, false);
        assert!(decision.intent.is_hold());
        assert_eq!(decision.intent.reason, IntentReason::NoMarket);
    }

    #[test]
    fn test_abandoned_close_reopens_position() {
        let pipeline = DecisionPipeline::new(TradingConfig::default());
        let ledger = PositionLedger::new(dec!(10000));
        ledger.mark("BTC", 100.0, DateTime::<Utc>::UNIX_EPOCH).unwrap();
        let id = ledger.open("BTC", crate::models::Side::Long, 10.0, 100.0).unwrap();

        let mut intent = OrderIntent::hold("BTC", 100.0, IntentReason::Manual);
        intent.action = IntentAction::Close;
        intent.side = crate::models::Side::Long;
        intent.position_id = Some(id);
        intent.size = 10.0;

        pipeline.begin(&ledger, &intent).unwrap();
        assert_eq!(ledger.position(id).unwrap().status(), PositionStatus::Closing);
        pipeline.abandon(&ledger, &intent).unwrap();
        assert_eq!(ledger.position(id).unwrap().status(), PositionStatus::Open);
    }
}
