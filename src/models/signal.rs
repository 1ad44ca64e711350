//! Aggregated trading signal.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Recommended direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    Buy,
    Sell,
    Hold,
}

/// Directional recommendation for one asset on one tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub asset: String,
    pub direction: Direction,
    /// Magnitude of the combined score, in [0, 1]
    pub confidence: f64,
    /// Combined score in [-1, 1] before thresholding
    pub score: f64,
    /// Raw score per reporting source
    pub source_scores: BTreeMap<String, f64>,
}

impl Signal {
    pub fn hold(asset: impl Into<String>) -> Self {
        Self {
            asset: asset.into(),
            direction: Direction::Hold,
            confidence: 0.0,
            score: 0.0,
            source_scores: BTreeMap::new(),
        }
    }

    pub fn is_hold(&self) -> bool {
        self.direction == Direction::Hold
    }
}
