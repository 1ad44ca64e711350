//! Paper venue: fills orders with the backtest fill simulator and delivers
//! them asynchronously, like a real connector would.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use super::types::{CancelOutcome, ExecutionVenue, OrderAck, VenueOrder};
use crate::backtest::{FillSimulator, SlippageModel};
use crate::models::Fill;

#[derive(Default)]
struct Book {
    /// Fills computed but not yet delivered, by client order id
    working: HashMap<String, Fill>,
    delivered: HashSet<String>,
}

/// Simulated execution venue for paper trading.
pub struct PaperVenue {
    simulator: Mutex<FillSimulator>,
    fills: mpsc::Sender<Fill>,
    fill_delay: Duration,
    book: Arc<Mutex<Book>>,
}

impl PaperVenue {
    pub fn new(
        slippage: SlippageModel,
        fee_rate: f64,
        seed: u64,
        fill_delay: Duration,
        fills: mpsc::Sender<Fill>,
    ) -> Self {
        Self {
            simulator: Mutex::new(FillSimulator::new(slippage, fee_rate, seed)),
            fills,
            fill_delay,
            book: Arc::new(Mutex::new(Book::default())),
        }
    }

    async fn deliver(book: &Mutex<Book>, fills: &mpsc::Sender<Fill>, client_order_id: &str) {
        let fill = {
            let mut book = book.lock().await;
            let Some(fill) = book.working.remove(client_order_id) else {
                return;
            };
            book.delivered.insert(client_order_id.to_string());
            fill
        };
        if fills.send(fill).await.is_err() {
            warn!(order = %client_order_id, "Fill receiver closed");
        }
    }
}

#[async_trait]
impl ExecutionVenue for PaperVenue {
    fn name(&self) -> &'static str {
        "paper"
    }

    async fn submit(&self, order: VenueOrder) -> Result<OrderAck> {
        let mut fill = self
            .simulator
            .lock()
            .await
            .fill(&order.intent, order.mark, order.submitted_at)
            .context("Paper venue rejected order")?
            .context("Nothing to fill for a HOLD intent")?;

        fill.fill_id = format!("paper-{}", fill.fill_id);
        fill.order_id = Some(order.client_order_id.clone());

        debug!(
            order = %order.client_order_id,
            asset = %fill.asset,
            side = ?fill.side,
            price = %fill.price,
            size = %fill.size,
            "Paper order accepted"
        );

        let client_order_id = order.client_order_id.clone();
        self.book
            .lock()
            .await
            .working
            .insert(client_order_id.clone(), fill);

        if self.fill_delay.is_zero() {
            Self::deliver(&self.book, &self.fills, &client_order_id).await;
        } else {
            let book = self.book.clone();
            let fills = self.fills.clone();
            let delay = self.fill_delay;
            let id = client_order_id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                Self::deliver(&book, &fills, &id).await;
            });
        }

        Ok(OrderAck {
            venue_order_id: format!("paper-{}", client_order_id),
            client_order_id,
        })
    }

    async fn cancel(&self, client_order_id: &str) -> Result<CancelOutcome> {
        let mut book = self.book.lock().await;
        if book.working.remove(client_order_id).is_some() {
            Ok(CancelOutcome::Cancelled)
        } else if book.delivered.contains(client_order_id) {
            Ok(CancelOutcome::AlreadyFilled)
        } else {
            Ok(CancelOutcome::Unknown)
        }
    }
}
