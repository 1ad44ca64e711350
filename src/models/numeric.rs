//! Conversions between the f64 domain of signals/risk and the Decimal ledger.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use crate::error::{Result, TradingError};

/// Convert a finite, non-negative f64 into a Decimal.
pub fn non_negative_decimal(value: f64, field: &str) -> Result<Decimal> {
    if !value.is_finite() {
        return Err(TradingError::invalid(format!("{field} is not finite: {value}")));
    }
    if value < 0.0 {
        return Err(TradingError::invalid(format!("{field} is negative: {value}")));
    }
    Decimal::try_from(value)
        .map_err(|e| TradingError::invalid(format!("{field} out of range: {e}")))
}

/// Convert a finite, strictly positive f64 into a Decimal.
pub fn positive_decimal(value: f64, field: &str) -> Result<Decimal> {
    let d = non_negative_decimal(value, field)?;
    if d.is_zero() {
        return Err(TradingError::invalid(format!("{field} must be positive")));
    }
    Ok(d)
}

pub fn to_f64(value: Decimal) -> f64 {
    value.to_f64().unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_rejects_nan_and_negative() {
        assert!(non_negative_decimal(f64::NAN, "size").is_err());
        assert!(non_negative_decimal(f64::INFINITY, "size").is_err());
        assert!(non_negative_decimal(-1.0, "size").is_err());
        assert!(positive_decimal(0.0, "size").is_err());
        assert_eq!(positive_decimal(2.5, "size").unwrap(), dec!(2.5));
    }
}
