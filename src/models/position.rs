//! Position model: one entry per asset lifecycle, owned by the ledger.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::order::IntentReason;
use crate::error::{Result, TradingError};

/// Ledger-assigned position identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PositionId(pub u64);

impl std::fmt::Display for PositionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Direction of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Side {
    Long,
    Short,
    Flat,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Long => "LONG",
            Self::Short => "SHORT",
            Self::Flat => "FLAT",
        };
        write!(f, "{}", s)
    }
}

impl Side {
    /// +1 for long, -1 for short, 0 when flat.
    pub fn sign(&self) -> Decimal {
        match self {
            Self::Long => Decimal::ONE,
            Self::Short => Decimal::NEGATIVE_ONE,
            Self::Flat => Decimal::ZERO,
        }
    }
}

/// Lifecycle state. Closing details only exist once the position is closed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionState {
    /// Created from a fill that has not been matched to a known order yet
    Pending,
    Open,
    /// Exit requested, waiting for the exit fill
    Closing,
    Closed {
        exit_price: Decimal,
        reason: IntentReason,
        closed_at: DateTime<Utc>,
        exited_side: Side,
        exited_size: Decimal,
    },
}

/// Flat status label, for views and persistence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionStatus {
    Pending,
    Open,
    Closing,
    Closed,
}

impl std::fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Open => "OPEN",
            Self::Closing => "CLOSING",
            Self::Closed => "CLOSED",
        };
        write!(f, "{}", s)
    }
}

/// A position in one asset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: PositionId,

    pub asset: String,

    pub side: Side,

    /// Size in asset units, never negative
    pub size: Decimal,

    /// Average entry price
    pub entry_price: Decimal,

    pub stop_loss: Option<Decimal>,

    pub take_profit: Option<Decimal>,

    pub opened_at: DateTime<Utc>,

    pub state: PositionState,

    /// Realized P&L so far (partial reductions and fees included)
    pub realized_pnl: Decimal,

    /// Fees charged on this position's fills
    pub fees_paid: Decimal,

    /// Client order id of the order that opened it, if known
    #[serde(default)]
    pub order_id: Option<String>,
}

impl Position {
    /// Create an OPEN position.
    pub fn open(
        id: PositionId,
        asset: String,
        side: Side,
        size: Decimal,
        entry_price: Decimal,
        opened_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            asset,
            side,
            size,
            entry_price,
            stop_loss: None,
            take_profit: None,
            opened_at,
            state: PositionState::Open,
            realized_pnl: Decimal::ZERO,
            fees_paid: Decimal::ZERO,
            order_id: None,
        }
    }

    pub fn status(&self) -> PositionStatus {
        match self.state {
            PositionState::Pending => PositionStatus::Pending,
            PositionState::Open => PositionStatus::Open,
            PositionState::Closing => PositionStatus::Closing,
            PositionState::Closed { .. } => PositionStatus::Closed,
        }
    }

    /// Anything that is not CLOSED.
    pub fn is_active(&self) -> bool {
        !matches!(self.state, PositionState::Closed { .. })
    }

    /// Cost basis at the average entry price.
    pub fn cost_basis(&self) -> Decimal {
        self.size * self.entry_price
    }

    pub fn notional(&self, mark: Decimal) -> Decimal {
        self.size * mark
    }

    pub fn unrealized_pnl(&self, mark: Decimal) -> Decimal {
        (mark - self.entry_price) * self.size * self.side.sign()
    }

    /// Add to position (averaging in).
    pub fn add(&mut self, size: Decimal, price: Decimal) {
        let total_cost = self.cost_basis() + size * price;
        let new_size = self.size + size;

        if !new_size.is_zero() {
            self.entry_price = total_cost / new_size;
        }
        self.size = new_size;
    }

    /// Reduce position size at `price`, returning the P&L realized on the
    /// reduced part. Never reduces below zero.
    pub fn reduce(&mut self, size: Decimal, price: Decimal) -> Decimal {
        let reduce_size = size.min(self.size);
        let pnl = reduce_size * (price - self.entry_price) * self.side.sign();

        self.size -= reduce_size;
        self.realized_pnl += pnl;
        pnl
    }

    pub fn charge_fee(&mut self, fee: Decimal) {
        self.fees_paid += fee;
        self.realized_pnl -= fee;
    }

    /// Exit the remaining size and move to CLOSED. Returns the P&L realized
    /// by this final exit.
    pub fn finish(
        &mut self,
        exit_price: Decimal,
        reason: IntentReason,
        closed_at: DateTime<Utc>,
    ) -> Decimal {
        let exited_side = self.side;
        let exited_size = self.size;
        let pnl = self.reduce(exited_size, exit_price);

        self.side = Side::Flat;
        self.state = PositionState::Closed {
            exit_price,
            reason,
            closed_at,
            exited_side,
            exited_size,
        };
        pnl
    }

    /// Check that new bracket levels only tighten the existing ones.
    ///
    /// A long stop may only move up and a long take-profit only down; shorts
    /// mirror that. Setting a level where none existed is always allowed.
    pub fn check_brackets(
        &self,
        new_stop: Option<Decimal>,
        new_take_profit: Option<Decimal>,
        allow_loosen: bool,
    ) -> Result<()> {
        if allow_loosen {
            return Ok(());
        }

        if let (Some(new), Some(old)) = (new_stop, self.stop_loss) {
            let loosens = match self.side {
                Side::Long => new < old,
                Side::Short => new > old,
                Side::Flat => false,
            };
            if loosens {
                return Err(TradingError::unsafe_capital(format!(
                    "stop loss for {} would loosen from {} to {}",
                    self.id, old, new
                )));
            }
        }

        if let (Some(new), Some(old)) = (new_take_profit, self.take_profit) {
            let loosens = match self.side {
                Side::Long => new > old,
                Side::Short => new < old,
                Side::Flat => false,
            };
            if loosens {
                return Err(TradingError::unsafe_capital(format!(
                    "take profit for {} would loosen from {} to {}",
                    self.id, old, new
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn make_position(side: Side) -> Position {
        Position::open(
            PositionId(1),
            "BTC".to_string(),
            side,
            dec!(100),
            dec!(0.50),
            DateTime::<Utc>::UNIX_EPOCH,
        )
    }

    #[test]
    fn test_position_pnl() {
        let long = make_position(Side::Long);
        assert_eq!(long.cost_basis(), dec!(50));
        assert_eq!(long.unrealized_pnl(dec!(0.70)), dec!(20));

        let short = make_position(Side::Short);
        assert_eq!(short.unrealized_pnl(dec!(0.70)), dec!(-20));
    }

    #[test]
    fn test_position_averaging() {
        let mut pos = make_position(Side::Long);
        pos.add(dec!(100), dec!(0.60));

        assert_eq!(pos.size, dec!(200));
        // (50 + 60) / 200
        assert_eq!(pos.entry_price, dec!(0.55));
    }

    #[test]
    fn test_finish_moves_to_flat() {
        let mut pos = make_position(Side::Long);
        pos.charge_fee(dec!(1));
        let pnl = pos.finish(dec!(0.60), IntentReason::TakeProfit, DateTime::<Utc>::UNIX_EPOCH);

        assert_eq!(pnl, dec!(10));
        assert_eq!(pos.realized_pnl, dec!(9));
        assert_eq!(pos.side, Side::Flat);
        assert_eq!(pos.size, Decimal::ZERO);
        assert_eq!(pos.status(), PositionStatus::Closed);
    }

    #[test]
    fn test_bracket_tightening() {
        let mut pos = make_position(Side::Long);
        pos.stop_loss = Some(dec!(0.45));
        pos.take_profit = Some(dec!(0.60));

        assert!(pos.check_brackets(Some(dec!(0.47)), Some(dec!(0.58)), false).is_ok());
        assert!(pos.check_brackets(Some(dec!(0.40)), None, false).is_err());
        assert!(pos.check_brackets(None, Some(dec!(0.70)), false).is_err());
        assert!(pos.check_brackets(Some(dec!(0.40)), None, true).is_ok());

        let mut short = make_position(Side::Short);
        short.stop_loss = Some(dec!(0.55));
        assert!(short.check_brackets(Some(dec!(0.60)), None, false).is_err());
        assert!(short.check_brackets(Some(dec!(0.52)), None, false).is_ok());
    }
}
