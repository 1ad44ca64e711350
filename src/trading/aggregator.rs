//! Signal aggregation: model scores and weighted indicators combined into a
//! single direction and confidence.

use std::collections::BTreeMap;

use tracing::debug;

use super::config::{AggregationMethod, SignalConfig};
use crate::models::{Direction, Signal};

/// A combination scheme over (normalized score, weight) pairs.
///
/// Inputs arrive in source-id order; implementations must not depend on
/// anything else so results stay reproducible.
pub trait AggregationStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Combined score in [-1, 1], or `None` when the inputs carry no weight.
    fn combine(&self, inputs: &[(f64, f64)]) -> Option<f64>;
}

/// Weighted average of normalized scores.
#[derive(Debug, Clone, Copy, Default)]
pub struct WeightedAverage;

impl AggregationStrategy for WeightedAverage {
    fn name(&self) -> &'static str {
        "weighted_average"
    }

    fn combine(&self, inputs: &[(f64, f64)]) -> Option<f64> {
        let total_weight: f64 = inputs.iter().map(|(_, w)| w).sum();
        if total_weight <= 0.0 {
            return None;
        }
        let weighted: f64 = inputs.iter().map(|(s, w)| s * w).sum();
        Some(weighted / total_weight)
    }
}

/// Median of the normalized scores with non-zero weight.
#[derive(Debug, Clone, Copy, Default)]
pub struct Median;

impl AggregationStrategy for Median {
    fn name(&self) -> &'static str {
        "median"
    }

    fn combine(&self, inputs: &[(f64, f64)]) -> Option<f64> {
        let mut scores: Vec<f64> = inputs
            .iter()
            .filter(|(_, w)| *w > 0.0)
            .map(|(s, _)| *s)
            .collect();
        if scores.is_empty() {
            return None;
        }
        scores.sort_by(|a, b| a.total_cmp(b));

        let mid = scores.len() / 2;
        if scores.len() % 2 == 0 {
            Some((scores[mid - 1] + scores[mid]) / 2.0)
        } else {
            Some(scores[mid])
        }
    }
}

/// Combines per-tick inputs into a [`Signal`].
pub struct SignalAggregator {
    config: SignalConfig,
    strategy: Box<dyn AggregationStrategy>,
}

impl SignalAggregator {
    pub fn new(config: SignalConfig) -> Self {
        let strategy: Box<dyn AggregationStrategy> = match config.method {
            AggregationMethod::WeightedAverage => Box::new(WeightedAverage),
            AggregationMethod::Median => Box::new(Median),
        };
        Self { config, strategy }
    }

    /// Use a custom combination scheme.
    pub fn with_strategy(config: SignalConfig, strategy: Box<dyn AggregationStrategy>) -> Self {
        Self { config, strategy }
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    /// Combine model scores and indicators for one asset.
    ///
    /// Scores are clamped to [-1, 1]; non-finite scores count as missing.
    /// Sources without a weight get 1.0, indicators only contribute when a
    /// weight names them. A negative or non-finite weight is malformed input
    /// and yields HOLD.
    pub fn aggregate(
        &self,
        asset: &str,
        scores: &BTreeMap<String, f64>,
        indicators: &BTreeMap<String, f64>,
        weights: &BTreeMap<String, f64>,
    ) -> Signal {
        if weights.values().any(|w| !w.is_finite() || *w < 0.0) {
            debug!(asset = %asset, "Malformed signal weights");
            return Signal::hold(asset);
        }

        let source_scores: BTreeMap<String, f64> = scores
            .iter()
            .filter(|(_, s)| s.is_finite())
            .map(|(id, s)| (id.clone(), *s))
            .collect();

        if source_scores.len() < self.config.min_signal_sources.max(1) {
            debug!(
                asset = %asset,
                reporting = source_scores.len(),
                required = self.config.min_signal_sources,
                "Insufficient signal sources"
            );
            return Signal {
                source_scores,
                ..Signal::hold(asset)
            };
        }

        let mut inputs: Vec<(f64, f64)> = source_scores
            .iter()
            .map(|(id, s)| (s.clamp(-1.0, 1.0), weights.get(id).copied().unwrap_or(1.0)))
            .collect();

        inputs.extend(indicators.iter().filter_map(|(name, value)| {
            let weight = weights.get(name)?;
            value.is_finite().then(|| (value.clamp(-1.0, 1.0), *weight))
        }));

        let Some(combined) = self.strategy.combine(&inputs) else {
            return Signal {
                source_scores,
                ..Signal::hold(asset)
            };
        };
        let combined = combined.clamp(-1.0, 1.0);

        let direction = if combined >= self.config.long_threshold && combined > 0.0 {
            Direction::Buy
        } else if combined <= -self.config.short_threshold && combined < 0.0 {
            Direction::Sell
        } else {
            Direction::Hold
        };

        Signal {
            asset: asset.to_string(),
            direction,
            confidence: combined.abs().min(1.0),
            score: combined,
            source_scores,
        }
    }
}
