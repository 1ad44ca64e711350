//! Types exchanged with the execution venue and the market data feed.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{Fill, OrderIntent};
use crate::trading::TickInput;

/// Inbound event routed to an asset loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MarketEvent {
    /// Price and model scores for one asset
    Tick(TickInput),
    /// Execution report from the connector, possibly late or repeated
    Fill(Fill),
}

impl MarketEvent {
    pub fn asset(&self) -> &str {
        match self {
            Self::Tick(tick) => &tick.asset,
            Self::Fill(fill) => &fill.asset,
        }
    }
}

/// An intent handed to the venue under a client order id.
#[derive(Debug, Clone, Serialize)]
pub struct VenueOrder {
    pub client_order_id: String,
    pub intent: OrderIntent,
    /// Mark when the order was sent
    pub mark: f64,
    pub submitted_at: DateTime<Utc>,
}

/// Venue acknowledgement of a submitted order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderAck {
    pub client_order_id: String,
    pub venue_order_id: String,
}

/// Result of cancelling a working order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CancelOutcome {
    /// Removed before any fill; the intent is abandoned
    Cancelled,
    /// Too late: the fill is on its way
    AlreadyFilled,
    /// The venue does not know the order
    Unknown,
}

/// Order execution boundary. Fills are delivered asynchronously on the
/// channel the venue was built with, never as a return value.
#[async_trait]
pub trait ExecutionVenue: Send + Sync {
    fn name(&self) -> &'static str;

    async fn submit(&self, order: VenueOrder) -> anyhow::Result<OrderAck>;

    async fn cancel(&self, client_order_id: &str) -> anyhow::Result<CancelOutcome>;
}
