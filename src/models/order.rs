//! Order intents emitted by the decision engine and fills reported back.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::position::{PositionId, Side};

/// What the engine wants done this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IntentAction {
    OpenLong,
    OpenShort,
    Increase,
    Reduce,
    Close,
    Hold,
}

impl IntentAction {
    pub fn is_hold(&self) -> bool {
        matches!(self, Self::Hold)
    }
}

impl std::fmt::Display for IntentAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::OpenLong => "OPEN_LONG",
            Self::OpenShort => "OPEN_SHORT",
            Self::Increase => "INCREASE",
            Self::Reduce => "REDUCE",
            Self::Close => "CLOSE",
            Self::Hold => "HOLD",
        };
        write!(f, "{}", s)
    }
}

/// Why an intent (or a position close) happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IntentReason {
    /// Signal did not call for action
    Signal,
    /// New position on a strong enough signal
    Entry,
    /// Opposite signal strong enough to exit before re-entering
    Reversal,
    /// Same-direction conviction increased
    AddOn,
    /// Conviction decayed below the reduce threshold
    Decay,
    Stop,
    TakeProfit,
    /// Portfolio exposure above the allowed limit
    Exposure,
    /// Risk budget is zero (drawdown breaker or invalid account state)
    RiskBudget,
    /// An earlier intent for the asset is still being executed
    InFlight,
    /// Position is PENDING or CLOSING and awaits reconciliation
    AwaitingFill,
    /// No usable mark price
    NoMarket,
    /// Computed size is below the minimum order notional
    BelowMinimum,
    /// Anti-churn interval not yet elapsed
    Cooldown,
    /// Closed by an externally reported fill
    Reconciled,
    /// Liquidated at the end of a backtest
    EndOfData,
    Manual,
    Error,
}

impl IntentReason {
    /// Protective exits that must not be suppressed by pause or cooldown.
    pub fn is_protective(&self) -> bool {
        matches!(self, Self::Stop | Self::TakeProfit)
    }
}

impl std::fmt::Display for IntentReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Signal => "SIGNAL",
            Self::Entry => "ENTRY",
            Self::Reversal => "REVERSAL",
            Self::AddOn => "ADD_ON",
            Self::Decay => "DECAY",
            Self::Stop => "STOP",
            Self::TakeProfit => "TAKE_PROFIT",
            Self::Exposure => "EXPOSURE",
            Self::RiskBudget => "RISK_BUDGET",
            Self::InFlight => "IN_FLIGHT",
            Self::AwaitingFill => "AWAITING_FILL",
            Self::NoMarket => "NO_MARKET",
            Self::BelowMinimum => "BELOW_MINIMUM",
            Self::Cooldown => "COOLDOWN",
            Self::Reconciled => "RECONCILED",
            Self::EndOfData => "END_OF_DATA",
            Self::Manual => "MANUAL",
            Self::Error => "ERROR",
        };
        write!(f, "{}", s)
    }
}

/// Decision engine output, not yet an exchange order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderIntent {
    pub asset: String,
    pub action: IntentAction,
    /// Position side this intent opens or acts on (FLAT for HOLD)
    pub side: Side,
    /// Target position for INCREASE/REDUCE/CLOSE
    pub position_id: Option<PositionId>,
    /// Size in asset units
    pub size: f64,
    pub price_hint: f64,
    pub reason: IntentReason,
    /// Bracket prices attached to opening intents
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    /// Error text when the tick was downgraded to HOLD
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl OrderIntent {
    pub fn hold(asset: impl Into<String>, price_hint: f64, reason: IntentReason) -> Self {
        Self {
            asset: asset.into(),
            action: IntentAction::Hold,
            side: Side::Flat,
            position_id: None,
            size: 0.0,
            price_hint,
            reason,
            stop_loss: None,
            take_profit: None,
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn is_hold(&self) -> bool {
        self.action.is_hold()
    }

    /// Exchange side needed to execute this intent.
    pub fn order_side(&self) -> Option<OrderSide> {
        match (self.action, self.side) {
            (IntentAction::Hold, _) | (_, Side::Flat) => None,
            (IntentAction::OpenLong, _) => Some(OrderSide::Buy),
            (IntentAction::OpenShort, _) => Some(OrderSide::Sell),
            (IntentAction::Increase, Side::Long) => Some(OrderSide::Buy),
            (IntentAction::Increase, Side::Short) => Some(OrderSide::Sell),
            (IntentAction::Reduce | IntentAction::Close, Side::Long) => Some(OrderSide::Sell),
            (IntentAction::Reduce | IntentAction::Close, Side::Short) => Some(OrderSide::Buy),
        }
    }
}

/// Exchange order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// Position side a fill on this order side would open.
    pub fn opens(&self) -> Side {
        match self {
            Self::Buy => Side::Long,
            Self::Sell => Side::Short,
        }
    }
}

/// Confirmation that size at a price was executed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    /// Unique per execution report; repeated delivery is ignored
    pub fill_id: String,
    /// Client order id of the order that produced the fill
    #[serde(default)]
    pub order_id: Option<String>,
    pub asset: String,
    pub side: OrderSide,
    pub price: Decimal,
    pub size: Decimal,
    #[serde(default)]
    pub fee: Decimal,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub is_simulated: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_serializes_screaming_snake_case() {
        assert_eq!(serde_json::to_string(&IntentReason::TakeProfit).unwrap(), "\"TAKE_PROFIT\"");
        assert_eq!(IntentReason::Stop.to_string(), "STOP");
        assert_eq!(IntentAction::OpenShort.to_string(), "OPEN_SHORT");
    }

    #[test]
    fn test_order_side_for_intents() {
        let mut intent = OrderIntent::hold("BTC", 100.0, IntentReason::Signal);
        assert_eq!(intent.order_side(), None);

        intent.action = IntentAction::Close;
        intent.side = Side::Long;
        assert_eq!(intent.order_side(), Some(OrderSide::Sell));

        intent.action = IntentAction::Increase;
        intent.side = Side::Short;
        assert_eq!(intent.order_side(), Some(OrderSide::Sell));

        intent.action = IntentAction::Reduce;
        assert_eq!(intent.order_side(), Some(OrderSide::Buy));
    }
}
