//! Position ledger: the authoritative record of positions per asset.
//!
//! Each asset has its own book behind its own mutex, which is the per-asset
//! exclusive section for opens, adjustments, closes and reconciliation. No
//! operation ever holds two book locks. After every mutation the book
//! publishes a small summary; `snapshot()` and exposure checks read only the
//! published summaries, so a read never waits on another asset's section.
//!
//! Lock order: exposure gate -> book -> summaries -> drawdown.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Result, TradingError};
use crate::models::numeric::{non_negative_decimal, positive_decimal, to_f64};
use crate::models::{
    AccountState, Fill, IntentReason, Position, PositionId, PositionState, PositionStatus, Side,
};

/// Realized result of closing a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RealizedPnl {
    pub position_id: PositionId,
    pub exit_price: Decimal,
    /// Total realized over the position's life, net of fees
    pub amount: Decimal,
}

/// What `reconcile` did with a fill.
#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileOutcome {
    /// Fill id already applied; nothing changed
    Duplicate,
    /// No matching position; a PENDING placeholder was created
    Placeholder(PositionId),
    /// Same-side fill added to the position
    Increased(PositionId),
    /// Opposite-side fill reduced the position
    Reduced { id: PositionId, realized: Decimal },
    /// Opposite-side fill closed the position. An overfill leaves a PENDING
    /// placeholder for the excess.
    Closed {
        pnl: RealizedPnl,
        placeholder: Option<PositionId>,
    },
}

/// Parameters for opening a position.
#[derive(Debug, Clone)]
pub struct OpenRequest {
    pub asset: String,
    pub side: Side,
    pub size: Decimal,
    pub entry_price: Decimal,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub fee: Decimal,
    pub order_id: Option<String>,
    /// Defaults to the asset's last mark time
    pub opened_at: Option<DateTime<Utc>>,
}

impl OpenRequest {
    pub fn new(asset: impl Into<String>, side: Side, size: Decimal, entry_price: Decimal) -> Self {
        Self {
            asset: asset.into(),
            side,
            size,
            entry_price,
            stop_loss: None,
            take_profit: None,
            fee: Decimal::ZERO,
            order_id: None,
            opened_at: None,
        }
    }
}

/// Read-only view of a position for the decision engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PositionView {
    pub id: PositionId,
    pub side: Side,
    pub size: f64,
    pub entry_price: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub status: PositionStatus,
}

impl PositionView {
    fn from_position(position: &Position) -> Self {
        Self {
            id: position.id,
            side: position.side,
            size: to_f64(position.size),
            entry_price: to_f64(position.entry_price),
            stop_loss: position.stop_loss.map(to_f64),
            take_profit: position.take_profit.map(to_f64),
            status: position.status(),
        }
    }
}

/// Everything the decision engine may know about the ledger for one asset.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LedgerView {
    pub asset: String,
    pub mark_price: Option<f64>,
    /// The asset's non-CLOSED position, if any
    pub position: Option<PositionView>,
    /// Σ notional across all assets at their marks
    pub portfolio_exposure: f64,
    /// An earlier intent for this asset has not finished executing
    pub in_flight: bool,
}

impl LedgerView {
    pub fn with_in_flight(mut self, in_flight: bool) -> Self {
        self.in_flight = in_flight;
        self
    }
}

#[derive(Debug, Clone, Copy)]
struct Mark {
    price: Decimal,
    at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct AssetBook {
    active: Option<Position>,
    closed: Vec<Position>,
    /// Realized P&L of closed positions, net of fees
    closed_realized: Decimal,
    mark: Option<Mark>,
    seen_fills: RecentFills,
}

/// Fill ids kept per asset for duplicate detection.
const SEEN_FILL_WINDOW: usize = 4096;

/// Most recent fill ids, oldest evicted first.
#[derive(Debug)]
struct RecentFills {
    ids: HashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl Default for RecentFills {
    fn default() -> Self {
        Self::with_capacity(SEEN_FILL_WINDOW)
    }
}

impl RecentFills {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            ids: HashSet::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    fn contains(&self, fill_id: &str) -> bool {
        self.ids.contains(fill_id)
    }

    fn insert(&mut self, fill_id: String) {
        if !self.ids.insert(fill_id.clone()) {
            return;
        }
        self.order.push_back(fill_id);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
    }
}

impl AssetBook {
    fn mark_time(&self) -> DateTime<Utc> {
        self.mark.map(|m| m.at).unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
    }

    fn active_mut(&mut self, id: PositionId) -> Result<&mut Position> {
        match self.active.as_mut() {
            Some(p) if p.id == id => Ok(p),
            _ => Err(TradingError::NotFound(id)),
        }
    }

    fn closed_result(&self, id: PositionId) -> Option<RealizedPnl> {
        self.closed.iter().find(|p| p.id == id).and_then(|p| match p.state {
            PositionState::Closed { exit_price, .. } => Some(RealizedPnl {
                position_id: id,
                exit_price,
                amount: p.realized_pnl,
            }),
            _ => None,
        })
    }

    /// Exit the active position and file it under closed.
    fn finish_active(
        &mut self,
        exit_price: Decimal,
        reason: IntentReason,
        fee: Decimal,
        at: DateTime<Utc>,
    ) -> Option<RealizedPnl> {
        let mut position = self.active.take()?;
        position.charge_fee(fee);
        position.finish(exit_price, reason, at);

        let result = RealizedPnl {
            position_id: position.id,
            exit_price,
            amount: position.realized_pnl,
        };
        self.closed_realized += position.realized_pnl;
        self.closed.push(position);
        Some(result)
    }

    fn summarize(&self) -> AssetSummary {
        let mut summary = AssetSummary {
            realized_pnl: self.closed_realized,
            ..Default::default()
        };
        if let Some(position) = &self.active {
            let mark = self.mark.map(|m| m.price).unwrap_or(position.entry_price);
            summary.realized_pnl += position.realized_pnl;
            summary.unrealized_pnl = position.unrealized_pnl(mark);
            summary.cost_basis = position.cost_basis();
            summary.exposure = position.notional(mark);
        }
        summary
    }
}

/// How an incoming fill relates to the asset's active position.
enum FillMatch {
    Unmatched,
    SameSide,
    Partial,
    /// Closes the position; carries any excess size
    Exit(Decimal),
}

fn vanished() -> TradingError {
    TradingError::invalid("active position vanished during reconcile")
}

/// Published per-asset aggregate.
#[derive(Debug, Clone, Copy, Default)]
struct AssetSummary {
    realized_pnl: Decimal,
    unrealized_pnl: Decimal,
    cost_basis: Decimal,
    exposure: Decimal,
}

#[derive(Debug)]
struct DrawdownTracker {
    peak: Decimal,
    max_drawdown: f64,
}

impl DrawdownTracker {
    fn update(&mut self, equity: Decimal) {
        if equity > self.peak {
            self.peak = equity;
        }
        if self.peak > Decimal::ZERO {
            let dd = to_f64((self.peak - equity) / self.peak);
            if dd > self.max_drawdown {
                self.max_drawdown = dd.min(1.0);
            }
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(l: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    l.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(l: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    l.write().unwrap_or_else(PoisonError::into_inner)
}

/// In-memory position ledger shared by all asset loops.
pub struct PositionLedger {
    initial_capital: Decimal,
    books: RwLock<BTreeMap<String, Arc<Mutex<AssetBook>>>>,
    index: RwLock<HashMap<PositionId, String>>,
    summaries: RwLock<BTreeMap<String, AssetSummary>>,
    next_id: AtomicU64,
    exposure_gate: Mutex<()>,
    exposure_limit: Mutex<Option<Decimal>>,
    drawdown: Mutex<DrawdownTracker>,
}

impl PositionLedger {
    pub fn new(initial_capital: Decimal) -> Self {
        Self {
            initial_capital,
            books: RwLock::new(BTreeMap::new()),
            index: RwLock::new(HashMap::new()),
            summaries: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            exposure_gate: Mutex::new(()),
            exposure_limit: Mutex::new(None),
            drawdown: Mutex::new(DrawdownTracker {
                peak: initial_capital,
                max_drawdown: 0.0,
            }),
        }
    }

    pub fn initial_capital(&self) -> Decimal {
        self.initial_capital
    }

    // ==================== Book plumbing ====================

    fn book(&self, asset: &str) -> Arc<Mutex<AssetBook>> {
        if let Some(book) = read(&self.books).get(asset) {
            return book.clone();
        }
        write(&self.books)
            .entry(asset.to_string())
            .or_default()
            .clone()
    }

    fn book_for(&self, id: PositionId) -> Result<(String, Arc<Mutex<AssetBook>>)> {
        let asset = read(&self.index)
            .get(&id)
            .cloned()
            .ok_or(TradingError::NotFound(id))?;
        let book = self.book(&asset);
        Ok((asset, book))
    }

    fn allocate_id(&self) -> PositionId {
        PositionId(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Publish the book's summary and fold the new equity into the drawdown
    /// tracker. Called with the book lock held.
    fn publish(&self, asset: &str, book: &AssetBook) {
        let equity = {
            let mut summaries = write(&self.summaries);
            summaries.insert(asset.to_string(), book.summarize());
            self.initial_capital
                + summaries
                    .values()
                    .map(|s| s.realized_pnl + s.unrealized_pnl)
                    .sum::<Decimal>()
        };
        lock(&self.drawdown).update(equity);
    }

    /// Reject if the asset's exposure after the change would push the
    /// portfolio over the current limit.
    fn check_exposure(&self, asset: &str, new_asset_exposure: Decimal) -> Result<()> {
        let Some(limit) = *lock(&self.exposure_limit) else {
            return Ok(());
        };
        let others: Decimal = read(&self.summaries)
            .iter()
            .filter(|(a, _)| a.as_str() != asset)
            .map(|(_, s)| s.exposure)
            .sum();
        let total = others + new_asset_exposure;
        if total > limit {
            return Err(TradingError::unsafe_capital(format!(
                "portfolio exposure {} would exceed limit {} ({})",
                total.round_dp(4),
                limit.round_dp(4),
                asset
            )));
        }
        Ok(())
    }

    // ==================== Risk plumbing ====================

    /// Set the portfolio exposure limit enforced on exposure-increasing
    /// operations. Invalid limits are treated as zero.
    pub fn set_exposure_limit(&self, limit: f64) {
        let limit = non_negative_decimal(limit, "exposure limit").unwrap_or(Decimal::ZERO);
        *lock(&self.exposure_limit) = Some(limit);
    }

    pub fn exposure_limit(&self) -> Option<f64> {
        lock(&self.exposure_limit).map(to_f64)
    }

    /// Record a mark price for an asset.
    pub fn mark(&self, asset: &str, price: f64, at: DateTime<Utc>) -> Result<()> {
        let price = positive_decimal(price, "mark price")?;
        let book = self.book(asset);
        let mut book = lock(&book);
        book.mark = Some(Mark { price, at });
        self.publish(asset, &book);
        Ok(())
    }

    pub fn mark_price(&self, asset: &str) -> Option<f64> {
        let book = self.book(asset);
        let book = lock(&book);
        book.mark.map(|m| to_f64(m.price))
    }

    // ==================== Lifecycle ====================

    /// Open a position with no brackets. Fails with `Conflict` if the asset
    /// already has a non-CLOSED position.
    pub fn open(&self, asset: &str, side: Side, size: f64, entry_price: f64) -> Result<PositionId> {
        let size = positive_decimal(size, "size")?;
        let entry_price = positive_decimal(entry_price, "entry price")?;
        self.open_bracketed(OpenRequest::new(asset, side, size, entry_price))
    }

    /// Open an OPEN position with optional brackets and an entry fee.
    pub fn open_bracketed(&self, request: OpenRequest) -> Result<PositionId> {
        if request.side == Side::Flat {
            return Err(TradingError::invalid("cannot open a FLAT position"));
        }
        if request.size <= Decimal::ZERO || request.entry_price <= Decimal::ZERO {
            return Err(TradingError::invalid("size and entry price must be positive"));
        }
        if request.fee < Decimal::ZERO {
            return Err(TradingError::invalid("fee must not be negative"));
        }
        let brackets = [request.stop_loss, request.take_profit];
        if brackets.iter().flatten().any(|p| *p <= Decimal::ZERO) {
            return Err(TradingError::invalid("bracket prices must be positive"));
        }

        let _gate = lock(&self.exposure_gate);
        let book = self.book(&request.asset);
        let mut book = lock(&book);

        if let Some(existing) = &book.active {
            return Err(TradingError::Conflict {
                asset: request.asset.clone(),
                existing: existing.id,
            });
        }

        let mark = book.mark.map(|m| m.price).unwrap_or(request.entry_price);
        self.check_exposure(&request.asset, request.size * mark)?;

        let id = self.allocate_id();
        let opened_at = request.opened_at.unwrap_or_else(|| book.mark_time());
        let mut position = Position::open(
            id,
            request.asset.clone(),
            request.side,
            request.size,
            request.entry_price,
            opened_at,
        );
        position.stop_loss = request.stop_loss;
        position.take_profit = request.take_profit;
        position.order_id = request.order_id;
        position.charge_fee(request.fee);

        debug!(
            asset = %request.asset,
            id = %id,
            side = ?request.side,
            size = %request.size,
            price = %request.entry_price,
            "Position opened"
        );

        book.active = Some(position);
        write(&self.index).insert(id, request.asset.clone());
        self.publish(&request.asset, &book);
        Ok(id)
    }

    /// PENDING -> OPEN once the fill is known to be ours.
    pub fn confirm(&self, id: PositionId) -> Result<()> {
        let (asset, book) = self.book_for(id)?;
        let mut book = lock(&book);
        let position = book.active_mut(id)?;
        match position.state {
            PositionState::Pending => {
                position.state = PositionState::Open;
                debug!(asset = %asset, id = %id, "Position confirmed");
                Ok(())
            }
            PositionState::Open => Ok(()),
            _ => Err(TradingError::invalid(format!(
                "cannot confirm {} in state {}",
                id,
                position.status()
            ))),
        }
    }

    /// Change size at the current mark and/or tighten brackets.
    ///
    /// Loosening a stop or take-profit is rejected; use
    /// [`adjust_with_override`](Self::adjust_with_override) for an explicit
    /// loosening order.
    pub fn adjust(
        &self,
        id: PositionId,
        delta_size: f64,
        new_stop: Option<f64>,
        new_take_profit: Option<f64>,
    ) -> Result<()> {
        self.adjust_inner(id, delta_size, new_stop, new_take_profit, false)
    }

    pub fn adjust_with_override(
        &self,
        id: PositionId,
        delta_size: f64,
        new_stop: Option<f64>,
        new_take_profit: Option<f64>,
    ) -> Result<()> {
        self.adjust_inner(id, delta_size, new_stop, new_take_profit, true)
    }

    fn adjust_inner(
        &self,
        id: PositionId,
        delta_size: f64,
        new_stop: Option<f64>,
        new_take_profit: Option<f64>,
        allow_loosen: bool,
    ) -> Result<()> {
        if !delta_size.is_finite() {
            return Err(TradingError::invalid("size delta is not finite"));
        }
        let new_stop = new_stop.map(|p| positive_decimal(p, "stop loss")).transpose()?;
        let new_take_profit = new_take_profit
            .map(|p| positive_decimal(p, "take profit"))
            .transpose()?;
        let delta = non_negative_decimal(delta_size.abs(), "size delta")?;

        let _gate = (delta_size > 0.0).then(|| lock(&self.exposure_gate));
        let (asset, book) = self.book_for(id)?;
        let mut book = lock(&book);
        let mark = book.mark.map(|m| m.price);

        let position = book.active_mut(id)?;
        position.check_brackets(new_stop, new_take_profit, allow_loosen)?;

        if !delta.is_zero() {
            if position.state != PositionState::Open {
                return Err(TradingError::invalid(format!(
                    "cannot resize {} in state {}",
                    id,
                    position.status()
                )));
            }
            let mark = mark.ok_or_else(|| TradingError::invalid("no mark price for resize"))?;

            if delta_size > 0.0 {
                let new_size = position.size + delta;
                self.check_exposure(&asset, new_size * mark)?;
                // Re-borrow after the shared check.
                let position = book.active_mut(id)?;
                position.add(delta, mark);
            } else {
                if delta >= position.size {
                    return Err(TradingError::unsafe_capital(format!(
                        "reducing {} by {} would leave no size; close it instead",
                        id, delta
                    )));
                }
                position.reduce(delta, mark);
            }
        }

        let position = book.active_mut(id)?;
        if new_stop.is_some() {
            position.stop_loss = new_stop;
        }
        if new_take_profit.is_some() {
            position.take_profit = new_take_profit;
        }

        debug!(asset = %asset, id = %id, delta = delta_size, "Position adjusted");
        self.publish(&asset, &book);
        Ok(())
    }

    /// Add filled size at `price` (averaging in).
    pub fn increase(&self, id: PositionId, size: Decimal, price: Decimal, fee: Decimal) -> Result<()> {
        if size <= Decimal::ZERO || price <= Decimal::ZERO || fee < Decimal::ZERO {
            return Err(TradingError::invalid("increase needs positive size and price"));
        }

        let _gate = lock(&self.exposure_gate);
        let (asset, book) = self.book_for(id)?;
        let mut book = lock(&book);
        let mark = book.mark.map(|m| m.price).unwrap_or(price);

        let position = book.active_mut(id)?;
        if position.state != PositionState::Open {
            return Err(TradingError::invalid(format!(
                "cannot increase {} in state {}",
                id,
                position.status()
            )));
        }
        let new_size = position.size + size;
        self.check_exposure(&asset, new_size * mark)?;

        let position = book.active_mut(id)?;
        position.add(size, price);
        position.charge_fee(fee);

        self.publish(&asset, &book);
        Ok(())
    }

    /// Remove filled size at `price`. Reducing by the full size or more
    /// closes the position and returns its realized P&L.
    pub fn reduce(
        &self,
        id: PositionId,
        size: Decimal,
        price: Decimal,
        fee: Decimal,
        reason: IntentReason,
    ) -> Result<Option<RealizedPnl>> {
        if size <= Decimal::ZERO || price <= Decimal::ZERO || fee < Decimal::ZERO {
            return Err(TradingError::invalid("reduce needs positive size and price"));
        }

        let (asset, book) = self.book_for(id)?;
        let mut book = lock(&book);
        let at = book.mark_time();

        let position = book.active_mut(id)?;
        if position.state == PositionState::Pending {
            return Err(TradingError::invalid(format!("cannot reduce PENDING {}", id)));
        }

        let result = if size >= position.size {
            book.finish_active(price, reason, fee, at)
        } else {
            position.reduce(size, price);
            position.charge_fee(fee);
            None
        };

        self.publish(&asset, &book);
        Ok(result)
    }

    /// OPEN -> CLOSING while an exit order is working.
    pub fn request_close(&self, id: PositionId) -> Result<()> {
        let (asset, book) = self.book_for(id)?;
        let mut book = lock(&book);
        let position = book.active_mut(id)?;
        match position.state {
            PositionState::Open => {
                position.state = PositionState::Closing;
                debug!(asset = %asset, id = %id, "Close requested");
                Ok(())
            }
            PositionState::Closing => Ok(()),
            _ => Err(TradingError::invalid(format!(
                "cannot request close of {} in state {}",
                id,
                position.status()
            ))),
        }
    }

    /// CLOSING -> OPEN when the exit order was cancelled or abandoned.
    pub fn abort_close(&self, id: PositionId) -> Result<()> {
        let (asset, book) = self.book_for(id)?;
        let mut book = lock(&book);
        let position = book.active_mut(id)?;
        match position.state {
            PositionState::Closing => {
                position.state = PositionState::Open;
                debug!(asset = %asset, id = %id, "Close aborted");
                Ok(())
            }
            PositionState::Open => Ok(()),
            _ => Err(TradingError::invalid(format!(
                "cannot abort close of {} in state {}",
                id,
                position.status()
            ))),
        }
    }

    /// Close a position at `exit_price`.
    ///
    /// Closing an already CLOSED position is a no-op that returns the value
    /// realized the first time.
    pub fn close(&self, id: PositionId, exit_price: f64, reason: IntentReason) -> Result<RealizedPnl> {
        let exit_price = positive_decimal(exit_price, "exit price")?;
        self.close_with_fee(id, exit_price, reason, Decimal::ZERO)
    }

    pub fn close_with_fee(
        &self,
        id: PositionId,
        exit_price: Decimal,
        reason: IntentReason,
        fee: Decimal,
    ) -> Result<RealizedPnl> {
        if exit_price <= Decimal::ZERO || fee < Decimal::ZERO {
            return Err(TradingError::invalid("exit price must be positive"));
        }

        let (asset, book) = self.book_for(id)?;
        let mut book = lock(&book);

        if let Some(previous) = book.closed_result(id) {
            return Ok(previous);
        }
        book.active_mut(id)?;

        let at = book.mark_time();
        let result = book
            .finish_active(exit_price, reason, fee, at)
            .ok_or(TradingError::NotFound(id))?;

        debug!(
            asset = %asset,
            id = %id,
            reason = %reason,
            pnl = %result.amount,
            "Position closed"
        );
        self.publish(&asset, &book);
        Ok(result)
    }

    // ==================== Reconciliation ====================

    /// Apply an externally reported fill.
    ///
    /// Matched by asset: a same-side fill adds to the active position, an
    /// opposite-side fill reduces or closes it (PENDING and CLOSING close
    /// directly). A fill with no position becomes a PENDING placeholder.
    /// Repeated delivery of the same fill id is ignored.
    pub fn reconcile(&self, fill: &Fill) -> Result<ReconcileOutcome> {
        if fill.price <= Decimal::ZERO || fill.size <= Decimal::ZERO || fill.fee < Decimal::ZERO {
            return Err(TradingError::invalid(format!("malformed fill {}", fill.fill_id)));
        }

        let book = self.book(&fill.asset);
        let mut book = lock(&book);

        if book.seen_fills.contains(&fill.fill_id) {
            debug!(asset = %fill.asset, fill_id = %fill.fill_id, "Duplicate fill ignored");
            return Ok(ReconcileOutcome::Duplicate);
        }

        let fill_side = fill.side.opens();
        let matched = match &book.active {
            None => FillMatch::Unmatched,
            Some(position) if position.side == fill_side => FillMatch::SameSide,
            Some(position) if fill.size < position.size => FillMatch::Partial,
            Some(position) => FillMatch::Exit(fill.size - position.size),
        };

        let outcome = match matched {
            FillMatch::Unmatched => {
                let id = self.placeholder(&mut book, fill, fill.size, fill.fee);
                ReconcileOutcome::Placeholder(id)
            }
            FillMatch::SameSide => {
                let position = book.active.as_mut().ok_or_else(vanished)?;
                position.add(fill.size, fill.price);
                position.charge_fee(fill.fee);
                ReconcileOutcome::Increased(position.id)
            }
            FillMatch::Partial => {
                let position = book.active.as_mut().ok_or_else(vanished)?;
                let realized = position.reduce(fill.size, fill.price);
                position.charge_fee(fill.fee);
                ReconcileOutcome::Reduced {
                    id: position.id,
                    realized,
                }
            }
            FillMatch::Exit(excess) => {
                let pnl = book
                    .finish_active(fill.price, IntentReason::Reconciled, fill.fee, fill.timestamp)
                    .ok_or_else(vanished)?;
                let placeholder = if excess > Decimal::ZERO {
                    warn!(
                        asset = %fill.asset,
                        fill_id = %fill.fill_id,
                        excess = %excess,
                        "Fill exceeds position, excess held as PENDING"
                    );
                    Some(self.placeholder(&mut book, fill, excess, Decimal::ZERO))
                } else {
                    None
                };
                ReconcileOutcome::Closed { pnl, placeholder }
            }
        };

        book.seen_fills.insert(fill.fill_id.clone());
        debug!(asset = %fill.asset, fill_id = %fill.fill_id, ?outcome, "Fill reconciled");
        self.publish(&fill.asset, &book);
        Ok(outcome)
    }

    fn placeholder(&self, book: &mut AssetBook, fill: &Fill, size: Decimal, fee: Decimal) -> PositionId {
        let id = self.allocate_id();
        let mut position = Position::open(
            id,
            fill.asset.clone(),
            fill.side.opens(),
            size,
            fill.price,
            fill.timestamp,
        );
        position.state = PositionState::Pending;
        position.order_id = fill.order_id.clone();
        position.charge_fee(fee);
        book.active = Some(position);
        write(&self.index).insert(id, fill.asset.clone());
        id
    }

    pub fn has_seen_fill(&self, asset: &str, fill_id: &str) -> bool {
        let book = self.book(asset);
        let seen = lock(&book).seen_fills.contains(fill_id);
        seen
    }

    pub fn remember_fill(&self, asset: &str, fill_id: &str) {
        let book = self.book(asset);
        lock(&book).seen_fills.insert(fill_id.to_string());
    }

    // ==================== Views ====================

    /// Decision engine view of one asset.
    pub fn view(&self, asset: &str) -> LedgerView {
        let (mark_price, position) = {
            let book = self.book(asset);
            let book = lock(&book);
            (
                book.mark.map(|m| to_f64(m.price)),
                book.active.as_ref().map(PositionView::from_position),
            )
        };
        LedgerView {
            asset: asset.to_string(),
            mark_price,
            position,
            portfolio_exposure: self.total_exposure(),
            in_flight: false,
        }
    }

    /// Copy-on-read account aggregate built from published summaries.
    pub fn snapshot(&self) -> AccountState {
        let (realized, unrealized, cost_basis) = {
            let summaries = read(&self.summaries);
            summaries.values().fold(
                (Decimal::ZERO, Decimal::ZERO, Decimal::ZERO),
                |(r, u, c), s| (r + s.realized_pnl, u + s.unrealized_pnl, c + s.cost_basis),
            )
        };
        let max_drawdown_seen = lock(&self.drawdown).max_drawdown;

        AccountState {
            equity: to_f64(self.initial_capital + realized + unrealized),
            available_balance: to_f64(self.initial_capital + realized - cost_basis),
            realized_pnl: to_f64(realized),
            unrealized_pnl: to_f64(unrealized),
            max_drawdown_seen,
        }
    }

    /// Σ notional across assets at their marks.
    pub fn total_exposure(&self) -> f64 {
        to_f64(read(&self.summaries).values().map(|s| s.exposure).sum())
    }

    pub fn position(&self, id: PositionId) -> Option<Position> {
        let (_, book) = self.book_for(id).ok()?;
        let book = lock(&book);
        let found = book
            .active
            .iter()
            .chain(book.closed.iter())
            .find(|p| p.id == id)
            .cloned();
        found
    }

    pub fn active_position(&self, asset: &str) -> Option<Position> {
        let book = self.book(asset);
        let active = lock(&book).active.clone();
        active
    }

    /// Non-CLOSED positions in asset order.
    pub fn active_positions(&self) -> Vec<Position> {
        let books: Vec<_> = read(&self.books).values().cloned().collect();
        books
            .iter()
            .filter_map(|book| lock(book).active.clone())
            .collect()
    }

    /// CLOSED positions in id order.
    pub fn closed_positions(&self) -> Vec<Position> {
        let books: Vec<_> = read(&self.books).values().cloned().collect();
        let mut closed: Vec<Position> = books
            .iter()
            .flat_map(|book| lock(book).closed.clone())
            .collect();
        closed.sort_by_key(|p| p.id);
        closed
    }
}
