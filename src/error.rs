//! Error taxonomy for the decision core.
//!
//! Ledger and risk operations return these synchronously; the decision
//! engine downgrades any of them to a HOLD intent.

use thiserror::Error;

use crate::models::PositionId;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TradingError {
    #[error("Conflict: {asset} already has active position {existing}")]
    Conflict { asset: String, existing: PositionId },

    #[error("Position not found or already closed: {0}")]
    NotFound(PositionId),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Capital safety violation: {0}")]
    CapitalSafetyViolation(String),
}

impl TradingError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn unsafe_capital(msg: impl Into<String>) -> Self {
        Self::CapitalSafetyViolation(msg.into())
    }

    /// Short machine-readable label used in traces and persisted intents.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Conflict { .. } => "CONFLICT",
            Self::NotFound(_) => "NOT_FOUND",
            Self::InvalidInput(_) => "INVALID_INPUT",
            Self::CapitalSafetyViolation(_) => "CAPITAL_SAFETY_VIOLATION",
        }
    }
}

pub type Result<T> = std::result::Result<T, TradingError>;
