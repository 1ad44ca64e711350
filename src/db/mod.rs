//! SQLite persistence for engine events and backtest results.
//!
//! Stores:
//! - Account snapshots (equity curve of live and paper runs)
//! - Submitted and failed order intents
//! - Closed positions with realized P&L
//! - Backtest report summaries with the full report as JSON

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::api::EngineEvent;
use crate::backtest::{BacktestReport, BacktestTrade};
use crate::models::numeric::to_f64;
use crate::models::{AccountState, OrderIntent, Position};

/// Database connection pool.
pub struct Database {
    pool: SqlitePool,
}

/// Stored account snapshot.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredSnapshot {
    pub id: i64,
    pub equity: f64,
    pub available_balance: f64,
    pub realized_pnl: f64,
    pub unrealized_pnl: f64,
    pub max_drawdown: f64,
    pub exposure: f64,
    pub recorded_at: String,
}

/// Stored order intent.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredIntent {
    pub id: i64,
    pub asset: String,
    pub action: String,
    pub side: String,
    pub position_id: Option<i64>,
    pub size: f64,
    pub price_hint: f64,
    pub reason: String,
    pub client_order_id: Option<String>,
    pub error_message: Option<String>,
    pub created_at: String,
}

/// Stored closed position.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredClosedPosition {
    pub id: i64,
    pub position_id: i64,
    pub asset: String,
    pub side: String,
    pub size: f64,
    pub entry_price: f64,
    pub exit_price: f64,
    pub realized_pnl: f64,
    pub fees: f64,
    pub exit_reason: String,
    pub opened_at: String,
    pub closed_at: String,
}

/// Aggregate over closed positions.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ClosedSummary {
    pub trades: i64,
    pub winners: i64,
    pub total_pnl: f64,
    pub total_fees: f64,
}

impl Database {
    /// Create a new database connection.
    pub async fn new(database_url: &str) -> Result<Self> {
        // Every in-memory connection is a separate database
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .context("Failed to connect to database")?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Run all database migrations.
    async fn run_migrations(&self) -> Result<()> {
        // Equity curve
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS account_snapshots (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                equity REAL NOT NULL,
                available_balance REAL NOT NULL,
                realized_pnl REAL NOT NULL,
                unrealized_pnl REAL NOT NULL,
                max_drawdown REAL NOT NULL,
                exposure REAL NOT NULL,
                recorded_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS order_intents (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                asset TEXT NOT NULL,
                action TEXT NOT NULL,
                side TEXT NOT NULL,
                position_id INTEGER,
                size REAL NOT NULL,
                price_hint REAL NOT NULL,
                reason TEXT NOT NULL,
                client_order_id TEXT,
                error_message TEXT,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_intents_asset ON order_intents(asset)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS closed_positions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                position_id INTEGER NOT NULL,
                asset TEXT NOT NULL,
                side TEXT NOT NULL,
                size REAL NOT NULL,
                entry_price REAL NOT NULL,
                exit_price REAL NOT NULL,
                realized_pnl REAL NOT NULL,
                fees REAL NOT NULL,
                exit_reason TEXT NOT NULL,
                opened_at TEXT NOT NULL,
                closed_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS backtest_reports (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                seed INTEGER NOT NULL,
                ticks INTEGER NOT NULL,
                initial_capital REAL NOT NULL,
                final_equity REAL NOT NULL,
                total_return REAL NOT NULL,
                total_trades INTEGER NOT NULL,
                win_rate REAL NOT NULL,
                max_drawdown REAL NOT NULL,
                sharpe_ratio REAL NOT NULL,
                report_json TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ==================== Snapshots ====================

    /// Record an account snapshot.
    pub async fn record_snapshot(
        &self,
        account: &AccountState,
        exposure: f64,
        at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO account_snapshots
                (equity, available_balance, realized_pnl, unrealized_pnl, max_drawdown, exposure, recorded_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(account.equity)
        .bind(account.available_balance)
        .bind(account.realized_pnl)
        .bind(account.unrealized_pnl)
        .bind(account.max_drawdown_seen)
        .bind(exposure)
        .bind(at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Most recent snapshot, if any.
    pub async fn latest_snapshot(&self) -> Result<Option<StoredSnapshot>> {
        sqlx::query_as::<_, StoredSnapshot>(
            "SELECT * FROM account_snapshots ORDER BY id DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch latest snapshot")
    }

    // ==================== Intents ====================

    /// Record a submitted or failed intent.
    pub async fn record_intent(
        &self,
        intent: &OrderIntent,
        client_order_id: Option<&str>,
        error: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO order_intents
                (asset, action, side, position_id, size, price_hint, reason, client_order_id, error_message, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&intent.asset)
        .bind(intent.action.to_string())
        .bind(intent.side.to_string())
        .bind(intent.position_id.map(|id| id.0 as i64))
        .bind(intent.size)
        .bind(intent.price_hint)
        .bind(intent.reason.to_string())
        .bind(client_order_id)
        .bind(error)
        .bind(at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Recent intents across assets, newest first.
    pub async fn recent_intents(&self, limit: i64) -> Result<Vec<StoredIntent>> {
        sqlx::query_as::<_, StoredIntent>("SELECT * FROM order_intents ORDER BY id DESC LIMIT ?")
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch intents")
    }

    // ==================== Closed Positions ====================

    /// Record a closed position. Positions that are still active are skipped.
    pub async fn record_closed_position(&self, position: &Position) -> Result<bool> {
        let Some(trade) = BacktestTrade::from_position(position) else {
            return Ok(false);
        };

        sqlx::query(
            r#"
            INSERT INTO closed_positions
                (position_id, asset, side, size, entry_price, exit_price, realized_pnl, fees, exit_reason, opened_at, closed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(trade.position_id as i64)
        .bind(&trade.asset)
        .bind(trade.side.to_string())
        .bind(to_f64(trade.size))
        .bind(to_f64(trade.entry_price))
        .bind(to_f64(trade.exit_price))
        .bind(to_f64(trade.pnl))
        .bind(to_f64(trade.fees))
        .bind(trade.exit_reason.to_string())
        .bind(trade.opened_at.to_rfc3339())
        .bind(trade.closed_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(true)
    }

    /// Get closed positions, newest first.
    pub async fn closed_positions(&self, limit: i64) -> Result<Vec<StoredClosedPosition>> {
        sqlx::query_as::<_, StoredClosedPosition>(
            "SELECT * FROM closed_positions ORDER BY id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch closed positions")
    }

    /// Trade count, winners and totals across all closed positions.
    pub async fn closed_position_summary(&self) -> Result<ClosedSummary> {
        let (trades, winners, total_pnl, total_fees): (i64, i64, f64, f64) = sqlx::query_as(
            r#"
            SELECT
                COUNT(*),
                COALESCE(SUM(CASE WHEN realized_pnl > 0 THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(realized_pnl), 0.0),
                COALESCE(SUM(fees), 0.0)
            FROM closed_positions
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(ClosedSummary {
            trades,
            winners,
            total_pnl,
            total_fees,
        })
    }

    // ==================== Backtests ====================

    /// Save a backtest report, returning its row id.
    pub async fn save_backtest_report(&self, report: &BacktestReport, seed: u64) -> Result<i64> {
        let json = serde_json::to_string(report).context("Failed to serialize report")?;
        let metrics = &report.metrics;

        let result = sqlx::query(
            r#"
            INSERT INTO backtest_reports
                (seed, ticks, initial_capital, final_equity, total_return, total_trades, win_rate, max_drawdown, sharpe_ratio, report_json)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(seed as i64)
        .bind(report.ticks as i64)
        .bind(to_f64(report.initial_capital))
        .bind(report.final_equity)
        .bind(metrics.total_return)
        .bind(metrics.total_trades as i64)
        .bind(metrics.win_rate)
        .bind(metrics.max_drawdown)
        .bind(metrics.sharpe_ratio)
        .bind(json)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Number of saved backtest reports.
    pub async fn backtest_count(&self) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM backtest_reports")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    // ==================== Event Writer ====================

    /// Persist one engine event.
    pub async fn apply_event(&self, event: &EngineEvent) -> Result<()> {
        match event {
            EngineEvent::Intent {
                intent,
                client_order_id,
                error,
                at,
            } => {
                self.record_intent(intent, client_order_id.as_deref(), error.as_deref(), *at)
                    .await
            }
            EngineEvent::PositionClosed { position } => {
                self.record_closed_position(position).await.map(|_| ())
            }
            EngineEvent::Snapshot {
                account,
                exposure,
                at,
            } => self.record_snapshot(account, *exposure, *at).await,
            EngineEvent::LoopHalted { .. } => Ok(()),
        }
    }
}

/// Drain engine events into the database until every sender is gone.
pub fn spawn_writer(db: Arc<Database>, mut events: mpsc::Receiver<EngineEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut written = 0u64;
        while let Some(event) = events.recv().await {
            match db.apply_event(&event).await {
                Ok(()) => written += 1,
                Err(e) => warn!(error = %e, "Failed to persist engine event"),
            }
        }
        debug!(written, "Event writer stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{IntentReason, Side};
    use crate::trading::PositionLedger;
    use rust_decimal_macros::dec;

    async fn memory_db() -> Database {
        Database::new("sqlite::memory:").await.unwrap()
    }

    fn closed_position(pnl_exit: f64) -> Position {
        let ledger = PositionLedger::new(dec!(10000));
        ledger.mark("BTC", 100.0, DateTime::<Utc>::UNIX_EPOCH).unwrap();
        let id = ledger.open("BTC", Side::Long, 10.0, 100.0).unwrap();
        ledger.close(id, pnl_exit, IntentReason::Signal).unwrap();
        ledger.position(id).unwrap()
    }

    #[tokio::test]
    async fn test_snapshot_round_trip() {
        let db = memory_db().await;
        assert!(db.latest_snapshot().await.unwrap().is_none());

        let account = AccountState {
            equity: 10_500.0,
            available_balance: 9_000.0,
            realized_pnl: 500.0,
            unrealized_pnl: 0.0,
            max_drawdown_seen: 0.02,
        };
        db.record_snapshot(&account, 1_500.0, Utc::now()).await.unwrap();

        let stored = db.latest_snapshot().await.unwrap().unwrap();
        assert_eq!(stored.equity, 10_500.0);
        assert_eq!(stored.exposure, 1_500.0);
    }

    #[tokio::test]
    async fn test_closed_position_summary() {
        let db = memory_db().await;

        assert!(db.record_closed_position(&closed_position(110.0)).await.unwrap());
        assert!(db.record_closed_position(&closed_position(95.0)).await.unwrap());

        let summary = db.closed_position_summary().await.unwrap();
        assert_eq!(summary.trades, 2);
        assert_eq!(summary.winners, 1);
        assert!((summary.total_pnl - 50.0).abs() < 1e-9);

        let rows = db.closed_positions(10).await.unwrap();
        assert_eq!(rows[0].exit_reason, "SIGNAL");
        assert_eq!(rows[0].side, "LONG");
    }

    #[tokio::test]
    async fn test_open_position_is_not_recorded() {
        let db = memory_db().await;
        let ledger = PositionLedger::new(dec!(10000));
        ledger.mark("BTC", 100.0, DateTime::<Utc>::UNIX_EPOCH).unwrap();
        let id = ledger.open("BTC", Side::Long, 1.0, 100.0).unwrap();

        let recorded = db.record_closed_position(&ledger.position(id).unwrap()).await.unwrap();
        assert!(!recorded);
        assert_eq!(db.closed_position_summary().await.unwrap(), ClosedSummary::default());
    }

    #[tokio::test]
    async fn test_writer_persists_events() {
        let db = Arc::new(memory_db().await);
        let (tx, rx) = mpsc::channel(16);
        let writer = spawn_writer(db.clone(), rx);

        let intent = OrderIntent::hold("ETH", 2_000.0, IntentReason::Signal);
        tx.send(EngineEvent::Intent {
            intent,
            client_order_id: None,
            error: Some("venue rejected".to_string()),
            at: Utc::now(),
        })
        .await
        .unwrap();
        tx.send(EngineEvent::PositionClosed {
            position: closed_position(120.0),
        })
        .await
        .unwrap();
        drop(tx);
        writer.await.unwrap();

        let intents = db.recent_intents(5).await.unwrap();
        assert_eq!(intents.len(), 1);
        assert_eq!(intents[0].error_message.as_deref(), Some("venue rejected"));
        assert_eq!(db.closed_position_summary().await.unwrap().trades, 1);
    }
}
