//! Trading configuration: risk limits, decision thresholds and signal
//! combination. Immutable for the duration of a run.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::TradingError;

/// Risk limits fed to the risk evaluator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    /// Fraction of equity that may be lost on one trade if its stop is hit
    pub max_risk_per_trade: f64,

    /// Maximum notional of a single position as a fraction of equity
    pub max_position_fraction: f64,

    /// Maximum combined notional of all positions as a fraction of equity
    pub max_portfolio_exposure: f64,

    /// Drawdown (0-1) where per-trade risk starts scaling down
    pub drawdown_soft_limit: f64,

    /// Drawdown (0-1) where per-trade risk reaches zero
    pub drawdown_hard_limit: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_risk_per_trade: 0.01,     // 1% of equity at risk per trade
            max_position_fraction: 0.25,  // Max 25% of equity per position
            max_portfolio_exposure: 0.5,  // Max 50% of equity deployed
            drawdown_soft_limit: 0.10,
            drawdown_hard_limit: 0.20,
        }
    }
}

impl RiskConfig {
    pub fn is_valid(&self) -> bool {
        let fractions = [
            self.max_risk_per_trade,
            self.max_position_fraction,
            self.max_portfolio_exposure,
            self.drawdown_soft_limit,
            self.drawdown_hard_limit,
        ];
        fractions.iter().all(|f| f.is_finite() && *f >= 0.0)
            && self.drawdown_soft_limit < self.drawdown_hard_limit
            && self.drawdown_hard_limit <= 1.0
    }
}

/// Thresholds and bracket settings for the decision engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecisionConfig {
    // === Entry ===
    /// Minimum confidence to open a position
    pub entry_threshold: f64,

    /// Minimum confidence of an opposite signal to exit for a reversal
    pub reversal_threshold: f64,

    /// Minimum same-direction confidence to add to a position
    pub add_on_threshold: f64,

    /// Same-direction confidence below this reduces the position
    pub reduce_threshold: f64,

    // === Brackets ===
    /// Stop distance as a fraction of entry price
    pub stop_loss_pct: f64,

    /// Take-profit distance as a fraction of entry price
    pub take_profit_pct: f64,

    // === Sizing ===
    /// Fraction of the position sold on a decay reduce
    pub reduce_fraction: f64,

    /// Smallest order notional worth sending
    pub min_order_notional: f64,

    /// Share of exposure headroom kept unused to absorb slippage
    pub exposure_buffer: f64,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            entry_threshold: 0.6,
            reversal_threshold: 0.8,
            add_on_threshold: 0.85,
            reduce_threshold: 0.3,
            stop_loss_pct: 0.02,    // 2% stop
            take_profit_pct: 0.05,  // 5% target
            reduce_fraction: 0.5,
            min_order_notional: 10.0,
            exposure_buffer: 0.01,
        }
    }
}

/// Which aggregation strategy combines the inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationMethod {
    #[default]
    WeightedAverage,
    Median,
}

/// Signal combination settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalConfig {
    pub method: AggregationMethod,

    /// Combined score at or above which the signal is BUY
    pub long_threshold: f64,

    /// Combined score at or below the negation of this is SELL
    pub short_threshold: f64,

    /// Minimum number of reporting model sources
    pub min_signal_sources: usize,

    /// Weight per source id or indicator name; sources default to 1.0,
    /// indicators only count when named here
    pub weights: BTreeMap<String, f64>,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            method: AggregationMethod::WeightedAverage,
            long_threshold: 0.1,
            short_threshold: 0.15, // Shorts need a stronger signal
            min_signal_sources: 2,
            weights: BTreeMap::new(),
        }
    }
}

/// Complete configuration for the decision pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TradingConfig {
    pub risk: RiskConfig,
    pub decision: DecisionConfig,
    pub signal: SignalConfig,
}

impl TradingConfig {
    /// Load from a JSON file. Missing fields take their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject inconsistent thresholds before a run starts.
    pub fn validate(&self) -> crate::error::Result<()> {
        if !self.risk.is_valid() {
            return Err(TradingError::invalid(
                "risk fractions must be finite, non-negative, with soft < hard <= 1",
            ));
        }

        let d = &self.decision;
        let thresholds = [
            d.entry_threshold,
            d.reversal_threshold,
            d.add_on_threshold,
            d.reduce_threshold,
        ];
        if thresholds.iter().any(|t| !t.is_finite() || *t < 0.0 || *t > 1.0) {
            return Err(TradingError::invalid("decision thresholds must lie in [0, 1]"));
        }
        if d.reversal_threshold < d.entry_threshold {
            return Err(TradingError::invalid(
                "reversal_threshold must not be below entry_threshold",
            ));
        }
        if d.reduce_threshold >= d.entry_threshold {
            return Err(TradingError::invalid(
                "reduce_threshold must be below entry_threshold",
            ));
        }
        if !(d.stop_loss_pct > 0.0 && d.stop_loss_pct < 1.0) || !(d.take_profit_pct > 0.0) {
            return Err(TradingError::invalid("bracket percentages must be positive"));
        }
        if !(d.reduce_fraction > 0.0 && d.reduce_fraction <= 1.0) {
            return Err(TradingError::invalid("reduce_fraction must be in (0, 1]"));
        }
        if !(d.exposure_buffer >= 0.0 && d.exposure_buffer < 1.0) || !(d.min_order_notional >= 0.0) {
            return Err(TradingError::invalid("sizing parameters out of range"));
        }

        let s = &self.signal;
        if !(s.long_threshold >= 0.0) || !(s.short_threshold >= 0.0) {
            return Err(TradingError::invalid("signal thresholds must be non-negative"));
        }
        if s.weights.values().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(TradingError::invalid("signal weights must be finite and non-negative"));
        }

        Ok(())
    }
}
