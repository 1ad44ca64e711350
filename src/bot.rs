//! Bot runner: one decision loop per asset over a shared position ledger.
//!
//! Handles:
//! - Routing market ticks and fills to the owning asset loop
//! - Submitting intents to the execution venue and tracking the one in flight
//! - Reconciling fills the loop did not ask for
//! - Pause/resume, anti-churn interval and per-asset error halts
//! - Draining in-flight orders on shutdown

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout};
use tracing::{debug, error, info, warn};

use crate::api::{CancelOutcome, EngineEvent, EventSink, ExecutionVenue, MarketEvent, VenueOrder};
use crate::models::{Fill, IntentReason, OrderIntent, PositionId};
use crate::trading::{
    DecisionPipeline, Execution, PositionLedger, ReconcileOutcome, TickInput, TradingConfig,
};

/// Bot configuration.
#[derive(Debug, Clone)]
pub struct BotConfig {
    /// Assets to trade, one loop each
    pub assets: Vec<String>,

    /// Starting capital shared by all assets
    pub initial_capital: Decimal,

    /// Decision pipeline configuration
    pub trading: TradingConfig,

    /// Errors in a row that halt an asset loop
    pub max_consecutive_errors: u32,

    /// Minimum feed time between signal-driven orders on one asset (seconds)
    pub min_trade_interval_secs: i64,

    /// How long a shutdown waits for a fill that is already on its way
    pub cancel_timeout: Duration,

    /// Account snapshot cadence
    pub snapshot_interval: Duration,

    /// Per-asset channel capacity
    pub channel_capacity: usize,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            assets: vec!["BTC".to_string()],
            initial_capital: dec!(10000),
            trading: TradingConfig::default(),
            max_consecutive_errors: 5,
            min_trade_interval_secs: 60,
            cancel_timeout: Duration::from_secs(5),
            snapshot_interval: Duration::from_secs(30),
            channel_capacity: 256,
        }
    }
}

/// Operator commands for one asset loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Control {
    Pause,
    Resume,
}

/// Operator command scheduled against the feed.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ControlEvent {
    /// Applied before the first feed record at or after this tick
    pub tick: u64,
    pub asset: String,
    pub command: Control,
}

/// Load a JSON array of control events, ordered by tick.
pub fn load_controls(path: impl AsRef<Path>) -> Result<Vec<ControlEvent>> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read controls {}", path.display()))?;
    let mut events: Vec<ControlEvent> = serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse controls {}", path.display()))?;
    events.sort_by_key(|e| e.tick);
    Ok(events)
}

/// Why an asset loop stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopExit {
    Shutdown,
    Halted(String),
    FeedClosed,
}

/// Order handed to the venue, not yet fully filled.
struct InFlight {
    client_order_id: String,
    intent: OrderIntent,
    filled: Decimal,
}

// ==================== Asset Loop ====================

/// Single-threaded decision loop for one asset.
pub struct AssetTrader {
    asset: String,
    config: BotConfig,
    ledger: Arc<PositionLedger>,
    pipeline: Arc<DecisionPipeline>,
    venue: Arc<dyn ExecutionVenue>,
    sink: Arc<dyn EventSink>,

    // Runtime state
    in_flight: Option<InFlight>,
    paused: bool,
    consecutive_errors: u32,
    halted: Option<String>,
    last_trade_at: Option<DateTime<Utc>>,
}

impl AssetTrader {
    pub fn new(
        asset: impl Into<String>,
        config: BotConfig,
        ledger: Arc<PositionLedger>,
        pipeline: Arc<DecisionPipeline>,
        venue: Arc<dyn ExecutionVenue>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            asset: asset.into(),
            config,
            ledger,
            pipeline,
            venue,
            sink,
            in_flight: None,
            paused: false,
            consecutive_errors: 0,
            halted: None,
            last_trade_at: None,
        }
    }

    /// Run until shutdown, halt, or the feed closes. In-flight work is
    /// confirmed or abandoned before returning.
    pub async fn run(
        mut self,
        mut market: mpsc::Receiver<MarketEvent>,
        mut control: mpsc::Receiver<Control>,
        mut shutdown: watch::Receiver<bool>,
    ) -> LoopExit {
        info!(asset = %self.asset, venue = self.venue.name(), "Asset loop started");

        let exit = loop {
            if *shutdown.borrow() {
                break LoopExit::Shutdown;
            }

            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break LoopExit::Shutdown;
                    }
                }
                Some(command) = control.recv() => self.on_control(command),
                event = market.recv() => match event {
                    Some(MarketEvent::Tick(tick)) => self.on_tick(tick).await,
                    Some(MarketEvent::Fill(fill)) => self.on_fill(fill),
                    None => break LoopExit::FeedClosed,
                },
            }

            if let Some(reason) = self.halted.clone() {
                break LoopExit::Halted(reason);
            }
        };

        self.drain(&mut market).await;

        match &exit {
            LoopExit::Halted(reason) => {
                error!(asset = %self.asset, reason = %reason, "Asset loop halted");
                self.sink.publish(EngineEvent::LoopHalted {
                    asset: self.asset.clone(),
                    reason: reason.clone(),
                });
            }
            other => info!(asset = %self.asset, exit = ?other, "Asset loop stopped"),
        }
        exit
    }

    fn on_control(&mut self, command: Control) {
        self.paused = command == Control::Pause;
        info!(asset = %self.asset, paused = self.paused, "Control command applied");
    }

    async fn on_tick(&mut self, tick: TickInput) {
        if tick.asset != self.asset {
            warn!(asset = %self.asset, got = %tick.asset, "Tick routed to the wrong loop");
            return;
        }

        let mut clean = true;
        if let Err(e) = self.pipeline.observe(&self.ledger, &tick) {
            self.record_error(format!("mark rejected: {}", e));
            clean = false;
        }

        let decision = self
            .pipeline
            .decide(&self.ledger, &tick, self.in_flight.is_some());
        let intent = decision.intent;

        if intent.is_hold() {
            if intent.reason == IntentReason::Error {
                self.record_error(intent.detail.unwrap_or_else(|| "decision error".to_string()));
            } else if clean {
                self.consecutive_errors = 0;
            }
            return;
        }

        // Protective exits ignore pause and the anti-churn interval
        if !intent.reason.is_protective() {
            if self.paused {
                debug!(asset = %self.asset, action = %intent.action, "Paused, intent skipped");
                return;
            }
            if let Some(last) = self.last_trade_at {
                if (tick.timestamp - last).num_seconds() < self.config.min_trade_interval_secs {
                    debug!(asset = %self.asset, reason = %IntentReason::Cooldown, "Intent skipped");
                    return;
                }
            }
        }

        self.submit(intent, tick.price, tick.timestamp).await;
    }

    async fn submit(&mut self, intent: OrderIntent, mark: f64, at: DateTime<Utc>) {
        let client_order_id = uuid::Uuid::new_v4().to_string();

        if let Err(e) = self.pipeline.begin(&self.ledger, &intent) {
            self.publish_intent(&intent, None, Some(e.to_string()), at);
            self.record_error(format!("begin {}: {}", intent.action, e));
            return;
        }

        let order = VenueOrder {
            client_order_id: client_order_id.clone(),
            intent: intent.clone(),
            mark,
            submitted_at: at,
        };

        match self.venue.submit(order).await {
            Ok(ack) => {
                debug!(asset = %self.asset, order = %ack.client_order_id, venue_order = %ack.venue_order_id, "Order acknowledged");
                self.publish_intent(&intent, Some(client_order_id.clone()), None, at);
                self.last_trade_at = Some(at);
                self.in_flight = Some(InFlight {
                    client_order_id,
                    intent,
                    filled: Decimal::ZERO,
                });
            }
            Err(e) => {
                if let Err(abandon) = self.pipeline.abandon(&self.ledger, &intent) {
                    warn!(asset = %self.asset, error = %abandon, "Abandon failed");
                }
                self.publish_intent(&intent, None, Some(e.to_string()), at);
                self.record_error(format!("submit {}: {:#}", intent.action, e));
            }
        }
    }

    fn on_fill(&mut self, fill: Fill) {
        let ours = self
            .in_flight
            .as_ref()
            .is_some_and(|f| fill.order_id.as_deref() == Some(f.client_order_id.as_str()));

        if !ours {
            self.reconcile_foreign(&fill);
            return;
        }
        let Some(mut flight) = self.in_flight.take() else {
            return;
        };

        match self.pipeline.execute(&self.ledger, &flight.intent, &fill) {
            Ok(Execution::Duplicate) => {
                self.in_flight = Some(flight);
            }
            Ok(execution) => {
                self.consecutive_errors = 0;
                if let Execution::Closed { pnl } = &execution {
                    self.publish_closed(pnl.position_id);
                }

                flight.filled += fill.size;
                let target = Decimal::try_from(flight.intent.size).unwrap_or(Decimal::ZERO);
                let complete = flight.filled >= target || matches!(execution, Execution::Closed { .. });
                if !complete {
                    self.in_flight = Some(flight);
                }
            }
            Err(e) => {
                if let Err(abandon) = self.pipeline.abandon(&self.ledger, &flight.intent) {
                    warn!(asset = %self.asset, error = %abandon, "Abandon failed");
                }
                self.record_error(format!("fill {}: {}", fill.fill_id, e));
            }
        }
    }

    /// Apply a fill this loop did not submit.
    fn reconcile_foreign(&mut self, fill: &Fill) {
        match self.ledger.reconcile(fill) {
            Ok(ReconcileOutcome::Closed { pnl, placeholder }) => {
                self.publish_closed(pnl.position_id);
                if let Some(id) = placeholder {
                    warn!(asset = %self.asset, id = %id, "Overfill left an unmatched position");
                    self.adopt(id);
                }
            }
            Ok(ReconcileOutcome::Placeholder(id)) => {
                warn!(asset = %self.asset, id = %id, fill = %fill.fill_id, "Unmatched fill opened a position");
                self.adopt(id);
            }
            Ok(outcome) => debug!(asset = %self.asset, outcome = ?outcome, "Fill reconciled"),
            Err(e) => self.record_error(format!("reconcile {}: {}", fill.fill_id, e)),
        }
    }

    /// Bracket and confirm a placeholder so the engine manages it.
    fn adopt(&mut self, id: PositionId) {
        if let Err(e) = self.pipeline.adopt(&self.ledger, id) {
            self.record_error(format!("adopt {}: {}", id, e));
        }
    }

    /// Confirm or abandon the in-flight order.
    async fn drain(&mut self, market: &mut mpsc::Receiver<MarketEvent>) {
        let Some(flight) = self.in_flight.as_ref() else {
            return;
        };
        let client_order_id = flight.client_order_id.clone();

        match self.venue.cancel(&client_order_id).await {
            Ok(CancelOutcome::AlreadyFilled) => {
                let waited = timeout(self.config.cancel_timeout, async {
                    while self.in_flight.is_some() {
                        match market.recv().await {
                            Some(MarketEvent::Fill(fill)) => self.on_fill(fill),
                            Some(MarketEvent::Tick(_)) => {}
                            None => break,
                        }
                    }
                })
                .await;
                if waited.is_err() {
                    warn!(asset = %self.asset, order = %client_order_id, "Fill did not arrive before timeout");
                }
            }
            Ok(outcome) => {
                debug!(asset = %self.asset, order = %client_order_id, outcome = ?outcome, "In-flight order cancelled");
            }
            Err(e) => {
                warn!(asset = %self.asset, order = %client_order_id, error = %e, "Cancel failed, abandoning");
            }
        }

        if let Some(flight) = self.in_flight.take() {
            if let Err(e) = self.pipeline.abandon(&self.ledger, &flight.intent) {
                warn!(asset = %self.asset, error = %e, "Abandon failed");
            }
            info!(asset = %self.asset, order = %flight.client_order_id, action = %flight.intent.action, "In-flight intent abandoned");
        }
    }

    fn record_error(&mut self, message: String) {
        self.consecutive_errors += 1;
        warn!(
            asset = %self.asset,
            errors = self.consecutive_errors,
            error = %message,
            "Asset loop error"
        );
        if self.consecutive_errors >= self.config.max_consecutive_errors {
            self.halted = Some(format!(
                "{} consecutive errors, last: {}",
                self.consecutive_errors, message
            ));
        }
    }

    fn publish_intent(&self, intent: &OrderIntent, client_order_id: Option<String>, error: Option<String>, at: DateTime<Utc>) {
        self.sink.publish(EngineEvent::Intent {
            intent: intent.clone(),
            client_order_id,
            error,
            at,
        });
    }

    fn publish_closed(&self, id: PositionId) {
        if let Some(position) = self.ledger.position(id) {
            self.sink.publish(EngineEvent::PositionClosed { position });
        }
    }
}

// ==================== Supervisor ====================

#[derive(Clone)]
struct Route {
    market: mpsc::Sender<MarketEvent>,
    control: mpsc::Sender<Control>,
}

/// Owns the shared ledger and one task per asset.
pub struct Supervisor {
    config: BotConfig,
    ledger: Arc<PositionLedger>,
    sink: Arc<dyn EventSink>,
    routes: Arc<HashMap<String, Route>>,
    shutdown: watch::Sender<bool>,
    handles: Vec<(String, JoinHandle<LoopExit>)>,
}

impl Supervisor {
    /// Spawn one loop per configured asset.
    pub fn start(
        config: BotConfig,
        venue: Arc<dyn ExecutionVenue>,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self> {
        config.trading.validate()?;
        if config.assets.is_empty() {
            anyhow::bail!("no assets configured");
        }

        let ledger = Arc::new(PositionLedger::new(config.initial_capital));
        let pipeline = Arc::new(DecisionPipeline::new(config.trading.clone()));
        let (shutdown, shutdown_rx) = watch::channel(false);

        let mut routes = HashMap::new();
        let mut handles = Vec::new();
        for asset in &config.assets {
            if routes.contains_key(asset) {
                continue;
            }
            let (market_tx, market_rx) = mpsc::channel(config.channel_capacity);
            let (control_tx, control_rx) = mpsc::channel(16);

            let trader = AssetTrader::new(
                asset.clone(),
                config.clone(),
                ledger.clone(),
                pipeline.clone(),
                venue.clone(),
                sink.clone(),
            );
            let handle = tokio::spawn(trader.run(market_rx, control_rx, shutdown_rx.clone()));

            routes.insert(
                asset.clone(),
                Route {
                    market: market_tx,
                    control: control_tx,
                },
            );
            handles.push((asset.clone(), handle));
        }

        info!(assets = routes.len(), capital = %config.initial_capital, "Supervisor started");

        Ok(Self {
            config,
            ledger,
            sink,
            routes: Arc::new(routes),
            shutdown,
            handles,
        })
    }

    pub fn ledger(&self) -> Arc<PositionLedger> {
        self.ledger.clone()
    }

    /// Deliver an event to its asset loop. Events for unknown or stopped
    /// assets are dropped.
    pub async fn route(&self, event: MarketEvent) {
        Self::forward(&self.routes, event).await;
    }

    async fn forward(routes: &HashMap<String, Route>, event: MarketEvent) {
        let Some(route) = routes.get(event.asset()) else {
            warn!(asset = %event.asset(), "No loop for asset, event dropped");
            return;
        };
        if route.market.send(event).await.is_err() {
            debug!("Asset loop stopped, event dropped");
        }
    }

    /// Send a scheduled control command to its asset loop.
    pub async fn apply(&self, event: &ControlEvent) -> Result<()> {
        info!(asset = %event.asset, tick = event.tick, command = ?event.command, "Applying control");
        match event.command {
            Control::Pause => self.pause(&event.asset).await,
            Control::Resume => self.resume(&event.asset).await,
        }
    }

    pub async fn pause(&self, asset: &str) -> Result<()> {
        self.control(asset, Control::Pause).await
    }

    pub async fn resume(&self, asset: &str) -> Result<()> {
        self.control(asset, Control::Resume).await
    }

    async fn control(&self, asset: &str, command: Control) -> Result<()> {
        let route = self
            .routes
            .get(asset)
            .ok_or_else(|| anyhow::anyhow!("unknown asset {}", asset))?;
        route
            .control
            .send(command)
            .await
            .map_err(|_| anyhow::anyhow!("loop for {} has stopped", asset))
    }

    /// Forward venue fills to their asset loops until the channel closes.
    pub fn spawn_fill_router(&self, mut fills: mpsc::Receiver<Fill>) -> JoinHandle<()> {
        let routes = self.routes.clone();
        tokio::spawn(async move {
            while let Some(fill) = fills.recv().await {
                Self::forward(&routes, MarketEvent::Fill(fill)).await;
            }
        })
    }

    /// Publish account snapshots until shutdown.
    pub fn spawn_snapshots(&self) -> JoinHandle<()> {
        let ledger = self.ledger.clone();
        let sink = self.sink.clone();
        let mut shutdown = self.shutdown.subscribe();
        let mut ticker = interval(self.config.snapshot_interval);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        sink.publish(EngineEvent::Snapshot {
                            account: ledger.snapshot(),
                            exposure: ledger.total_exposure(),
                            at: Utc::now(),
                        });
                    }
                    _ = shutdown.changed() => break,
                }
            }
        })
    }

    /// Stop every loop at its next tick boundary and wait for them.
    pub async fn shutdown(self) -> Vec<(String, LoopExit)> {
        info!("Shutting down asset loops...");
        let _ = self.shutdown.send(true);

        let (assets, handles): (Vec<_>, Vec<_>) = self.handles.into_iter().unzip();
        let results = join_all(handles).await;

        let exits: Vec<(String, LoopExit)> = assets
            .into_iter()
            .zip(results)
            .map(|(asset, result)| {
                let exit = result.unwrap_or_else(|e| LoopExit::Halted(format!("task failed: {}", e)));
                (asset, exit)
            })
            .collect();

        self.sink.publish(EngineEvent::Snapshot {
            account: self.ledger.snapshot(),
            exposure: self.ledger.total_exposure(),
            at: Utc::now(),
        });
        info!(loops = exits.len(), "Shutdown complete");
        exits
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ChannelSink, LogSink, OrderAck, PaperVenue};
    use crate::backtest::SlippageModel;
    use crate::models::{OrderSide, PositionState, PositionStatus, Side};
    use async_trait::async_trait;
    use std::collections::BTreeMap;

    fn make_config(assets: &[&str]) -> BotConfig {
        BotConfig {
            assets: assets.iter().map(|a| a.to_string()).collect(),
            min_trade_interval_secs: 0,
            max_consecutive_errors: 2,
            cancel_timeout: Duration::from_millis(200),
            ..Default::default()
        }
    }

    fn make_tick(asset: &str, price: f64, score: f64, secs: i64) -> MarketEvent {
        let scores: BTreeMap<String, f64> = [("a".to_string(), score), ("b".to_string(), score)]
            .into_iter()
            .collect();
        MarketEvent::Tick(TickInput {
            asset: asset.to_string(),
            price,
            timestamp: DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap(),
            scores,
            indicators: BTreeMap::new(),
        })
    }

    fn paper_venue(delay: Duration) -> (Arc<PaperVenue>, mpsc::Receiver<Fill>) {
        let (tx, rx) = mpsc::channel(64);
        let venue = PaperVenue::new(SlippageModel::none(), 0.0, 7, delay, tx);
        (Arc::new(venue), rx)
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        for _ in 0..300 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    /// Rejects every order for one asset.
    struct RejectingVenue {
        rejected: String,
        inner: Arc<PaperVenue>,
    }

    #[async_trait]
    impl ExecutionVenue for RejectingVenue {
        fn name(&self) -> &'static str {
            "rejecting"
        }

        async fn submit(&self, order: VenueOrder) -> Result<OrderAck> {
            if order.intent.asset == self.rejected {
                anyhow::bail!("venue rejected {}", order.intent.asset);
            }
            self.inner.submit(order).await
        }

        async fn cancel(&self, client_order_id: &str) -> Result<CancelOutcome> {
            self.inner.cancel(client_order_id).await
        }
    }

    #[tokio::test]
    async fn test_paper_round_trip() {
        let (venue, fills) = paper_venue(Duration::ZERO);
        let supervisor = Supervisor::start(make_config(&["BTC"]), venue, Arc::new(LogSink)).unwrap();
        supervisor.spawn_fill_router(fills);
        let ledger = supervisor.ledger();

        supervisor.route(make_tick("BTC", 100.0, 0.9, 0)).await;
        wait_for(|| ledger.active_position("BTC").is_some()).await;

        supervisor.route(make_tick("BTC", 106.0, 0.9, 60)).await;
        wait_for(|| ledger.closed_positions().len() == 1).await;

        let closed = &ledger.closed_positions()[0];
        assert_eq!(closed.realized_pnl, dec!(150));

        let exits = supervisor.shutdown().await;
        assert_eq!(exits, vec![("BTC".to_string(), LoopExit::Shutdown)]);
    }

    #[tokio::test]
    async fn test_halt_is_isolated_to_one_asset() {
        let (paper, fills) = paper_venue(Duration::ZERO);
        let venue = Arc::new(RejectingVenue {
            rejected: "BAD".to_string(),
            inner: paper,
        });
        let (event_tx, mut events) = mpsc::channel(64);
        let sink = Arc::new(ChannelSink::new(event_tx));
        let supervisor = Supervisor::start(make_config(&["BAD", "BTC"]), venue, sink).unwrap();
        supervisor.spawn_fill_router(fills);
        let ledger = supervisor.ledger();

        supervisor.route(make_tick("BAD", 10.0, 0.9, 0)).await;
        supervisor.route(make_tick("BAD", 10.0, 0.9, 1)).await;
        let halted = timeout(Duration::from_secs(3), async {
            while let Some(event) = events.recv().await {
                if let EngineEvent::LoopHalted { asset, .. } = event {
                    return asset;
                }
            }
            String::new()
        })
        .await
        .unwrap();
        assert_eq!(halted, "BAD");

        supervisor.route(make_tick("BTC", 100.0, 0.9, 2)).await;
        wait_for(|| ledger.active_position("BTC").is_some()).await;

        let exits = supervisor.shutdown().await;
        let exits: HashMap<_, _> = exits.into_iter().collect();
        assert!(matches!(exits["BAD"], LoopExit::Halted(_)));
        assert_eq!(exits["BTC"], LoopExit::Shutdown);
        assert!(ledger.active_position("BAD").is_none());
    }

    #[tokio::test]
    async fn test_shutdown_abandons_unfilled_close() {
        let (venue, fills) = paper_venue(Duration::from_secs(30));
        let supervisor = Supervisor::start(make_config(&["BTC"]), venue, Arc::new(LogSink)).unwrap();
        supervisor.spawn_fill_router(fills);
        let ledger = supervisor.ledger();

        ledger.mark("BTC", 100.0, DateTime::<Utc>::UNIX_EPOCH).unwrap();
        let id = ledger.open("BTC", Side::Long, 10.0, 100.0).unwrap();

        // Strong opposite signal: reversal close goes in flight
        supervisor.route(make_tick("BTC", 100.0, -0.9, 0)).await;
        wait_for(|| ledger.position(id).is_some_and(|p| p.status() == PositionStatus::Closing)).await;

        let exits = supervisor.shutdown().await;
        assert_eq!(exits[0].1, LoopExit::Shutdown);
        assert_eq!(ledger.position(id).unwrap().status(), PositionStatus::Open);
    }

    #[tokio::test]
    async fn test_pause_blocks_entries() {
        let (venue, fills) = paper_venue(Duration::ZERO);
        let supervisor = Supervisor::start(make_config(&["BTC"]), venue, Arc::new(LogSink)).unwrap();
        supervisor.spawn_fill_router(fills);
        let ledger = supervisor.ledger();

        let controls: Vec<ControlEvent> = serde_json::from_str(
            r#"[
                {"tick": 2, "asset": "BTC", "command": "resume"},
                {"tick": 0, "asset": "BTC", "command": "pause"}
            ]"#,
        )
        .unwrap();
        let (pause, resume) = (&controls[1], &controls[0]);
        assert_eq!(pause.command, Control::Pause);

        supervisor.apply(pause).await.unwrap();
        supervisor.route(make_tick("BTC", 100.0, 0.9, 0)).await;
        supervisor.route(make_tick("BTC", 100.0, 0.9, 1)).await;
        wait_for(|| ledger.mark_price("BTC").is_some()).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(ledger.active_position("BTC").is_none());

        supervisor.apply(resume).await.unwrap();
        supervisor.route(make_tick("BTC", 100.0, 0.9, 2)).await;
        wait_for(|| ledger.active_position("BTC").is_some()).await;

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_control_for_unknown_asset_fails() {
        let (venue, _fills) = paper_venue(Duration::ZERO);
        let supervisor = Supervisor::start(make_config(&["BTC"]), venue, Arc::new(LogSink)).unwrap();

        let event = ControlEvent {
            tick: 0,
            asset: "DOGE".to_string(),
            command: Control::Pause,
        };
        assert!(supervisor.apply(&event).await.is_err());

        supervisor.shutdown().await;
    }

    #[test]
    fn test_load_controls_sorts_by_tick() {
        let path = std::env::temp_dir().join(format!("controls-{}.json", uuid::Uuid::new_v4()));
        std::fs::write(
            &path,
            r#"[{"tick": 9, "asset": "ETH", "command": "resume"},
                {"tick": 3, "asset": "ETH", "command": "pause"}]"#,
        )
        .unwrap();

        let events = load_controls(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(events.iter().map(|e| e.tick).collect::<Vec<_>>(), vec![3, 9]);
        assert_eq!(events[0].command, Control::Pause);

        std::fs::write(&path, r#"[{"tick": 1, "asset": "ETH", "command": "halt"}]"#).unwrap();
        assert!(load_controls(&path).is_err());
        std::fs::remove_file(&path).unwrap();
    }

    #[tokio::test]
    async fn test_foreign_fill_is_adopted_and_managed() {
        let (venue, fills) = paper_venue(Duration::ZERO);
        let supervisor = Supervisor::start(make_config(&["BTC"]), venue, Arc::new(LogSink)).unwrap();
        supervisor.spawn_fill_router(fills);
        let ledger = supervisor.ledger();

        supervisor
            .route(MarketEvent::Fill(Fill {
                fill_id: "ext-1".to_string(),
                order_id: Some("someone-else".to_string()),
                asset: "BTC".to_string(),
                side: OrderSide::Buy,
                price: dec!(100),
                size: dec!(1),
                fee: Decimal::ZERO,
                timestamp: DateTime::<Utc>::UNIX_EPOCH,
                is_simulated: false,
            }))
            .await;
        wait_for(|| {
            ledger
                .active_position("BTC")
                .is_some_and(|p| p.status() == PositionStatus::Open)
        })
        .await;
        let adopted = ledger.active_position("BTC").unwrap();
        assert_eq!(adopted.stop_loss, Some(dec!(98)));
        assert_eq!(adopted.take_profit, Some(dec!(105)));

        // The stop on the adopted position fires like any other
        supervisor.route(make_tick("BTC", 97.0, 0.9, 0)).await;
        wait_for(|| ledger.closed_positions().len() == 1).await;

        let closed = &ledger.closed_positions()[0];
        assert_eq!(closed.id, adopted.id);
        assert!(matches!(
            closed.state,
            PositionState::Closed {
                reason: IntentReason::Stop,
                ..
            }
        ));
        assert_eq!(closed.realized_pnl, dec!(-3));
        assert!(ledger.active_position("BTC").is_none());

        supervisor.shutdown().await;
    }
}
