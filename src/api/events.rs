//! Outbound engine events for persistence and notification.
//!
//! Publishing never blocks a decision tick: sinks either log or hand off to
//! a bounded channel and drop on overflow.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::models::{AccountState, OrderIntent, Position};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    /// A non-HOLD intent was submitted or failed to submit
    Intent {
        intent: OrderIntent,
        client_order_id: Option<String>,
        error: Option<String>,
        at: DateTime<Utc>,
    },
    PositionClosed {
        position: Position,
    },
    Snapshot {
        account: AccountState,
        exposure: f64,
        at: DateTime<Utc>,
    },
    LoopHalted {
        asset: String,
        reason: String,
    },
}

/// Fire-and-forget event consumer.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: EngineEvent);
}

/// Logs every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl EventSink for LogSink {
    fn publish(&self, event: EngineEvent) {
        match &event {
            EngineEvent::Intent { intent, error: Some(e), .. } => {
                warn!(asset = %intent.asset, action = %intent.action, error = %e, "Intent failed");
            }
            EngineEvent::Intent { intent, client_order_id, .. } => {
                info!(
                    asset = %intent.asset,
                    action = %intent.action,
                    reason = %intent.reason,
                    size = intent.size,
                    order = ?client_order_id,
                    "Intent submitted"
                );
            }
            EngineEvent::PositionClosed { position } => {
                info!(
                    asset = %position.asset,
                    id = %position.id,
                    pnl = %position.realized_pnl,
                    "Position closed"
                );
            }
            EngineEvent::Snapshot { account, exposure, .. } => {
                info!(
                    equity = account.equity,
                    realized = account.realized_pnl,
                    unrealized = account.unrealized_pnl,
                    exposure,
                    "Account snapshot"
                );
            }
            EngineEvent::LoopHalted { asset, reason } => {
                warn!(asset = %asset, reason = %reason, "Asset loop halted");
            }
        }
    }
}

/// Forwards events to a bounded channel, dropping them when it is full.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<EngineEvent>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<EngineEvent>) -> Self {
        Self { tx }
    }
}

impl EventSink for ChannelSink {
    fn publish(&self, event: EngineEvent) {
        if let Err(e) = self.tx.try_send(event) {
            warn!(error = %e, "Event dropped");
        }
    }
}

/// Publishes to several sinks in order.
#[derive(Clone, Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl EventSink for FanoutSink {
    fn publish(&self, event: EngineEvent) {
        if let Some((last, rest)) = self.sinks.split_last() {
            for sink in rest {
                sink.publish(event.clone());
            }
            last.publish(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_event() -> EngineEvent {
        EngineEvent::LoopHalted {
            asset: "BTC".to_string(),
            reason: "test".to_string(),
        }
    }

    #[test]
    fn test_channel_sink_drops_when_full() {
        let (tx, mut rx) = mpsc::channel(1);
        let sink = ChannelSink::new(tx);
        sink.publish(make_event());
        sink.publish(make_event());

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_fanout_reaches_every_sink() {
        let (tx_a, mut rx_a) = mpsc::channel(4);
        let (tx_b, mut rx_b) = mpsc::channel(4);
        let sink = FanoutSink::new()
            .with(Arc::new(LogSink))
            .with(Arc::new(ChannelSink::new(tx_a)))
            .with(Arc::new(ChannelSink::new(tx_b)));

        sink.publish(make_event());
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_ok());
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let json = serde_json::to_value(make_event()).unwrap();
        assert_eq!(json["event"], "loop_halted");
    }
}
