//! Data models for positions, signals, order intents, fills and account state.

mod account;
mod metrics;
pub mod numeric;
mod order;
mod position;
mod signal;

pub use account::{AccountState, RiskBudget};
pub use metrics::PerformanceMetrics;
pub use order::{Fill, IntentAction, IntentReason, OrderIntent, OrderSide};
pub use position::{Position, PositionId, PositionState, PositionStatus, Side};
pub use signal::{Direction, Signal};
