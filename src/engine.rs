//! The simulated exchange
//!
//! [`BacktestExchange`] owns all mutable state: account, positions, orders,
//! stops, histories, per-pair prices and times, and the leverage registry.
//! Each component sits behind its own lock; composite mutations take the
//! locks briefly one at a time and no lock is ever held across bar delivery
//! or any other user-visible call.
//!
//! The simulation clock is driven by [`BacktestExchange::scan`]: one call
//! per bar, executed before the bar reaches the subscriber. Requests
//! submitted while a bar is being scanned become candidates no earlier than
//! the next bar of their pair.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::account::AccountLedger;
use crate::config::BacktestConfig;
use crate::error::{ExchangeError, Result};
use crate::history::HistoryRecorder;
use crate::market::{Interval, KlineStore};
use crate::orders::OrderStore;
use crate::position::PositionBook;
use crate::stops::StopRegistry;
use crate::trading::{FixedQuantityPrecision, QuantityPrecisionProvider};
use crate::types::{
    AccountInfo, Kline, Order, OrderDirection, OrderId, OrderStatus, OrderType, PendingStop,
    Position, PositionEvent, PositionEventKind, PositionHistory, PositionKey, PositionSide,
    StopKind, StopOrder, TradingPair, Transfer,
};

/// Capacity of each kline subscription channel.
const SUBSCRIPTION_BUFFER: usize = 10;

pub const MIN_LEVERAGE: u32 = 1;
pub const MAX_LEVERAGE: u32 = 125;

// ============================================================================
// Request types
// ============================================================================

#[derive(Debug, Clone)]
pub struct CreateOrderRequest {
    pub pair: TradingPair,
    pub order_type: OrderType,
    pub position_side: PositionSide,
    /// Zero means market.
    pub price: Decimal,
    pub quantity: Decimal,
    /// Creation timestamp used when the pair has no simulated time yet.
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct CancelOrderRequest {
    /// Absent means cancel every pending order for `pair` (or all pairs
    /// when `pair` is also absent).
    pub id: Option<OrderId>,
    pub pair: Option<TradingPair>,
}

#[derive(Debug, Clone, Default)]
pub struct CancelOrdersRequest {
    pub ids: Vec<OrderId>,
    pub pair: Option<TradingPair>,
}

#[derive(Debug, Clone, Default)]
pub struct HistoryRequest {
    /// Empty means all pairs.
    pub pairs: Vec<TradingPair>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

// ============================================================================
// Exchange
// ============================================================================

pub struct BacktestExchange {
    account: RwLock<AccountLedger>,
    pub(crate) positions: RwLock<PositionBook>,
    orders: RwLock<OrderStore>,
    pub(crate) stops: RwLock<StopRegistry>,
    history: RwLock<HistoryRecorder>,
    prices: RwLock<HashMap<TradingPair, Decimal>>,
    times: RwLock<HashMap<TradingPair, DateTime<Utc>>>,
    leverage: RwLock<HashMap<TradingPair, u32>>,
    klines: RwLock<KlineStore>,
    pub(crate) precision: Arc<dyn QuantityPrecisionProvider>,
    default_leverage: u32,
    window_start: Option<DateTime<Utc>>,
    window_end: Option<DateTime<Utc>>,
    next_id: AtomicU64,
    shutdown: watch::Sender<bool>,
}

impl BacktestExchange {
    pub fn new(config: BacktestConfig) -> Self {
        let precision = Arc::new(FixedQuantityPrecision::new(config.quantity_precision));
        Self::with_precision(config, precision)
    }

    /// Build with a custom per-pair quantity precision provider.
    pub fn with_precision(
        config: BacktestConfig,
        precision: Arc<dyn QuantityPrecisionProvider>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        BacktestExchange {
            account: RwLock::new(AccountLedger::new(config.initial_balance)),
            positions: RwLock::new(PositionBook::new()),
            orders: RwLock::new(OrderStore::new()),
            stops: RwLock::new(StopRegistry::new()),
            history: RwLock::new(HistoryRecorder::new()),
            prices: RwLock::new(HashMap::new()),
            times: RwLock::new(HashMap::new()),
            leverage: RwLock::new(HashMap::new()),
            klines: RwLock::new(KlineStore::new()),
            precision,
            default_leverage: config.default_leverage,
            window_start: config.start,
            window_end: config.end,
            next_id: AtomicU64::new(1),
            shutdown,
        }
    }

    pub(crate) fn next_id(&self) -> OrderId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn leverage_for(&self, pair: &TradingPair) -> u32 {
        self.leverage
            .read()
            .get(pair)
            .copied()
            .unwrap_or(self.default_leverage)
    }

    fn pair_time(&self, pair: &TradingPair) -> Option<DateTime<Utc>> {
        self.times.read().get(pair).copied()
    }

    /// Simulated time for a pair, falling back to an explicit timestamp and
    /// finally to the wall clock for requests arriving before any bar.
    fn clock(&self, pair: &TradingPair, explicit: Option<DateTime<Utc>>) -> DateTime<Utc> {
        self.pair_time(pair).or(explicit).unwrap_or_else(Utc::now)
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Signal every kline producer to stop. In-flight scans finish their
    /// current bar; subsequent order submissions are rejected.
    pub fn close(&self) {
        self.shutdown.send_replace(true);
        info!("exchange shut down");
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_shutdown() {
            return Err(ExchangeError::ExchangeShutdown);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Market data
    // ------------------------------------------------------------------

    /// Insert a kline series for replay and historical queries.
    pub fn insert_klines(&self, pair: TradingPair, interval: Interval, klines: Vec<Kline>) {
        self.klines.write().insert(pair, interval, klines);
    }

    pub fn get_klines(
        &self,
        pair: &TradingPair,
        interval: Interval,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<Kline>> {
        self.klines.read().get_klines(pair, interval, start, end)
    }

    /// Subscribe to the bar replay of a (pair, interval). Every bar is
    /// scanned before it is delivered; the stream ends at the simulation
    /// window boundary or on shutdown. Dropping the receiver stops the
    /// producer without touching engine state.
    pub fn subscribe_klines(
        self: Arc<Self>,
        pair: &TradingPair,
        interval: Interval,
    ) -> Result<mpsc::Receiver<Kline>> {
        self.ensure_open()?;
        let klines =
            self.klines
                .read()
                .get_klines(pair, interval, self.window_start, self.window_end)?;

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let engine = Arc::clone(&self);
        let pair = pair.clone();
        let mut shutdown = self.shutdown.subscribe();

        tokio::spawn(async move {
            for kline in klines {
                if *shutdown.borrow() {
                    break;
                }
                engine.scan(&pair, &kline);
                tokio::select! {
                    sent = tx.send(kline) => {
                        if sent.is_err() {
                            debug!(%pair, "subscriber dropped; stopping feed");
                            break;
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
            debug!(%pair, %interval, "kline feed finished");
        });

        Ok(rx)
    }

    // ------------------------------------------------------------------
    // Bar scan
    // ------------------------------------------------------------------

    /// Advance the simulation by one bar of `pair`: update price and time,
    /// fill eligible pending orders, then fire eligible stops. Runs before
    /// the bar is delivered to any subscriber. Failures are logged and
    /// skipped, never propagated.
    pub fn scan(&self, pair: &TradingPair, kline: &Kline) {
        if let Err(err) = kline.validate() {
            warn!(%pair, %err, "skipping malformed kline");
            return;
        }

        self.prices.write().insert(pair.clone(), kline.close);
        self.times.write().insert(pair.clone(), kline.close_time);

        // Pending orders first, in id order. Claiming drops the order from
        // the pending index so a concurrent scan of the same pair cannot
        // fill it twice.
        let candidates = self.orders.read().pending_for_pair(pair);
        for candidate in candidates {
            if !order_fills(&candidate, kline) {
                continue;
            }
            let Some(order) = self.orders.write().claim_pending(candidate.id) else {
                continue;
            };
            let price = if order.is_market() {
                kline.close
            } else {
                order.limit_price
            };
            match order.order_type {
                OrderType::Open => self.fill_open(order, price),
                OrderType::Close => self.fill_close(order, price),
            }
        }

        // Then stops, also in id order. The registry lock is released
        // before execution so the close path can purge siblings.
        let stops = self.stops.read().for_pair(pair);
        for stop in stops {
            if !stop_triggers(&stop, kline) {
                continue;
            }
            let claimed = self.stops.write().remove(stop.id);
            if let Some(stop) = claimed {
                self.execute_stop(stop);
            }
        }

        debug!(%pair, close = %kline.close, "bar scanned");
    }

    fn fill_open(&self, order: Order, price: Decimal) {
        let leverage = self.leverage_for(&order.pair);
        let now = self.clock(&order.pair, Some(order.created_at));
        let key = order.position_key();

        let settlement = self
            .account
            .write()
            .settle_open(order.id, price, order.quantity, leverage);

        if settlement.executed_quantity > Decimal::ZERO {
            let outcome = self.positions.write().apply_open(
                key.clone(),
                price,
                settlement.executed_quantity,
                settlement.margin,
                leverage,
                now,
            );

            let event = PositionEvent {
                order_id: order.id,
                kind: if outcome.created {
                    PositionEventKind::Create
                } else {
                    PositionEventKind::Increase
                },
                quantity: settlement.executed_quantity,
                before_quantity: outcome.before_quantity,
                after_quantity: outcome.after_quantity,
                price,
                realized_pnl: Decimal::ZERO,
                fee: Decimal::ZERO,
                created_at: now,
                completed_at: now,
            };
            self.history.write().record_open(key.clone(), event);
        }

        let status = if settlement.partial {
            OrderStatus::PartiallyFilled
        } else {
            OrderStatus::Filled
        };
        self.orders
            .write()
            .complete(order.id, status, settlement.executed_quantity, now);

        // Stops reserved at submission time attach to the live position
        // with its post-fill quantity.
        let pending = self.stops.write().take_pending(order.id);
        if let Some(pending) = pending {
            self.materialize_stops(&key, pending);
        }

        info!(
            order_id = order.id,
            pair = %order.pair,
            side = %order.position_side,
            %price,
            quantity = %settlement.executed_quantity,
            partial = settlement.partial,
            "open order filled"
        );
    }

    fn fill_close(&self, order: Order, price: Decimal) {
        let now = self.clock(&order.pair, Some(order.created_at));

        if order.quantity.is_zero() {
            self.orders
                .write()
                .complete(order.id, OrderStatus::Filled, Decimal::ZERO, now);
            return;
        }

        let key = order.position_key();
        let result = self
            .positions
            .write()
            .apply_close(&key, price, Some(order.quantity), now);

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(err) => {
                // Another close or a stop emptied the position first.
                warn!(order_id = order.id, %err, "close fill without position; order cancelled");
                self.orders.write().mark_cancelled(order.id, now);
                return;
            }
        };

        if outcome.quantity < order.quantity {
            warn!(
                order_id = order.id,
                requested = %order.quantity,
                executed = %outcome.quantity,
                "close quantity clamped to open position"
            );
        }

        self.account
            .write()
            .settle_close(outcome.released_margin, outcome.realized_pnl);
        self.orders
            .write()
            .complete(order.id, OrderStatus::Filled, outcome.quantity, now);

        let event = PositionEvent {
            order_id: order.id,
            kind: if outcome.closed {
                PositionEventKind::Close
            } else {
                PositionEventKind::Decrease
            },
            quantity: outcome.quantity,
            before_quantity: outcome.before_quantity,
            after_quantity: outcome.after_quantity,
            price,
            realized_pnl: outcome.realized_pnl,
            fee: Decimal::ZERO,
            created_at: now,
            completed_at: now,
        };
        self.history.write().record_close(&key, event);

        if outcome.closed {
            let purged = self.stops.write().purge_key(&key);
            if purged > 0 {
                debug!(%key, purged, "stops purged with closed position");
            }
        }

        info!(
            order_id = order.id,
            pair = %order.pair,
            side = %order.position_side,
            %price,
            quantity = %outcome.quantity,
            realized_pnl = %outcome.realized_pnl,
            "close order filled"
        );
    }

    /// Execute a triggered stop as an immediate close at the trigger price.
    /// This path never goes through order admission: there is no frozen
    /// fund to reconcile. A synthesized FILLED order is persisted for the
    /// audit trail.
    fn execute_stop(&self, stop: StopOrder) {
        let now = self.clock(&stop.pair, None);
        let key = stop.position_key();
        let quantity = if stop.quantity.is_zero() {
            None
        } else {
            Some(stop.quantity)
        };

        let result = self
            .positions
            .write()
            .apply_close(&key, stop.trigger_price, quantity, now);
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(_) => {
                debug!(stop_id = stop.id, %key, "stop without position; dropped");
                return;
            }
        };

        self.account
            .write()
            .settle_close(outcome.released_margin, outcome.realized_pnl);

        let order_id = self.next_id();
        let mut audit = Order::new(
            order_id,
            stop.pair.clone(),
            OrderType::Close,
            stop.position_side,
            stop.trigger_price,
            outcome.quantity,
            now,
        );
        audit.status = OrderStatus::Filled;
        audit.executed_quantity = outcome.quantity;
        audit.completed_at = Some(now);
        self.orders.write().insert_completed(audit);

        let event = PositionEvent {
            order_id,
            kind: if outcome.closed {
                PositionEventKind::Close
            } else {
                PositionEventKind::Decrease
            },
            quantity: outcome.quantity,
            before_quantity: outcome.before_quantity,
            after_quantity: outcome.after_quantity,
            price: stop.trigger_price,
            realized_pnl: outcome.realized_pnl,
            fee: Decimal::ZERO,
            created_at: now,
            completed_at: now,
        };
        self.history.write().record_close(&key, event);

        if outcome.closed {
            self.stops.write().purge_key(&key);
        }

        info!(
            stop_id = stop.id,
            kind = %stop.kind,
            pair = %stop.pair,
            side = %stop.position_side,
            trigger_price = %stop.trigger_price,
            quantity = %outcome.quantity,
            realized_pnl = %outcome.realized_pnl,
            "stop order executed"
        );
    }

    // ------------------------------------------------------------------
    // Order service
    // ------------------------------------------------------------------

    pub fn create_order(&self, req: CreateOrderRequest) -> Result<OrderId> {
        self.ensure_open()?;
        let id = self.next_id();
        let now = self.clock(&req.pair, req.timestamp);

        match req.order_type {
            OrderType::Open => {
                let effective_price = if req.price > Decimal::ZERO {
                    req.price
                } else {
                    self.ticker(&req.pair)?
                };
                let leverage = Decimal::from(self.leverage_for(&req.pair));
                let frozen = effective_price * req.quantity / leverage;
                self.account.write().freeze(id, frozen)?;
            }
            OrderType::Close => {
                let key = PositionKey::new(req.pair.clone(), req.position_side);
                let positions = self.positions.read();
                let position =
                    positions
                        .get(&key)
                        .ok_or_else(|| ExchangeError::PositionNotFound {
                            pair: key.pair.clone(),
                            side: key.side,
                        })?;
                // Single-order check only: several pending closes may
                // exceed the position in aggregate; fill time clamps.
                if position.quantity < req.quantity {
                    return Err(ExchangeError::InsufficientPosition {
                        requested: req.quantity,
                        open: position.quantity,
                    });
                }
            }
        }

        let order = Order::new(
            id,
            req.pair.clone(),
            req.order_type,
            req.position_side,
            req.price,
            req.quantity,
            now,
        );
        self.orders.write().insert_pending(order);

        debug!(
            order_id = id,
            pair = %req.pair,
            order_type = ?req.order_type,
            side = %req.position_side,
            price = %req.price,
            quantity = %req.quantity,
            "order accepted"
        );
        Ok(id)
    }

    /// Fail-fast batch submission: stops at the first rejection, leaving
    /// earlier orders pending.
    pub fn create_orders(&self, reqs: Vec<CreateOrderRequest>) -> Result<Vec<OrderId>> {
        let mut ids = Vec::with_capacity(reqs.len());
        for req in reqs {
            ids.push(self.create_order(req)?);
        }
        Ok(ids)
    }

    pub fn cancel_order(&self, req: CancelOrderRequest) -> Result<()> {
        match req.id {
            Some(id) => self.cancel_by_id(id, req.pair.as_ref()),
            None => {
                let ids = self.orders.read().pending_ids(req.pair.as_ref());
                for id in ids {
                    // A concurrent fill may have claimed the order already.
                    let _ = self.cancel_by_id(id, None);
                }
                Ok(())
            }
        }
    }

    pub fn cancel_orders(&self, req: CancelOrdersRequest) -> Result<()> {
        if req.ids.is_empty() {
            return self.cancel_order(CancelOrderRequest {
                id: None,
                pair: req.pair,
            });
        }
        for id in req.ids {
            self.cancel_by_id(id, req.pair.as_ref())?;
        }
        Ok(())
    }

    fn cancel_by_id(&self, id: OrderId, pair: Option<&TradingPair>) -> Result<()> {
        let order = {
            let orders = self.orders.read();
            orders
                .get(id)
                .cloned()
                .ok_or(ExchangeError::OrderNotFound { id })?
        };
        if order.status.is_terminal() {
            return Err(ExchangeError::OrderNotFound { id });
        }
        if let Some(pair) = pair {
            if pair != &order.pair {
                return Err(ExchangeError::PairMismatch {
                    id,
                    actual: order.pair.clone(),
                    requested: pair.clone(),
                });
            }
        }

        let now = self.clock(&order.pair, None);
        if self.orders.write().cancel(id, now).is_none() {
            // Claimed by a fill between the read and the write.
            return Err(ExchangeError::OrderNotFound { id });
        }

        if order.order_type == OrderType::Open {
            self.account.write().release(id);
            self.stops.write().take_pending(id);
        }

        info!(order_id = id, pair = %order.pair, "order cancelled");
        Ok(())
    }

    pub fn modify_order(&self) -> Result<()> {
        Err(ExchangeError::Unsupported)
    }

    pub fn modify_orders(&self) -> Result<()> {
        Err(ExchangeError::Unsupported)
    }

    /// Fetch one order in any status. A supplied pair must match.
    pub fn get_order(&self, id: OrderId, pair: Option<&TradingPair>) -> Result<Order> {
        let orders = self.orders.read();
        let order = orders.get(id).ok_or(ExchangeError::OrderNotFound { id })?;
        if let Some(pair) = pair {
            if pair != &order.pair {
                return Err(ExchangeError::OrderNotFound { id });
            }
        }
        Ok(order.clone())
    }

    /// Pending orders only, optionally restricted to a pair.
    pub fn get_orders(&self, pair: Option<&TradingPair>) -> Vec<Order> {
        self.orders.read().pending_orders(pair)
    }

    /// Active stop orders, optionally restricted to a pair.
    pub fn get_stop_orders(&self, pair: Option<&TradingPair>) -> Vec<StopOrder> {
        let stops = self.stops.read();
        match pair {
            Some(pair) => stops.for_pair(pair),
            None => stops.all(),
        }
    }

    // ------------------------------------------------------------------
    // Position service
    // ------------------------------------------------------------------

    pub fn set_leverage(&self, pair: &TradingPair, leverage: u32) -> Result<()> {
        if !(MIN_LEVERAGE..=MAX_LEVERAGE).contains(&leverage) {
            return Err(ExchangeError::InvalidLeverage(leverage));
        }
        self.leverage.write().insert(pair.clone(), leverage);

        let now = self.clock(pair, None);
        self.positions.write().set_leverage(pair, leverage, now);

        debug!(%pair, leverage, "leverage updated");
        Ok(())
    }

    /// Open positions marked at the last observed price. Empty filter
    /// means all pairs.
    pub fn get_active_positions(&self, pairs: &[TradingPair]) -> Vec<Position> {
        let prices = self.prices.read();
        self.positions
            .read()
            .iter()
            .filter(|(key, _)| pairs.is_empty() || pairs.contains(&key.pair))
            .map(|(key, position)| {
                let mut snapshot = position.clone();
                if let Some(mark) = prices.get(&key.pair) {
                    snapshot.mark_to(*mark);
                }
                snapshot
            })
            .collect()
    }

    pub fn get_history_positions(&self, req: HistoryRequest) -> Vec<PositionHistory> {
        self.history.read().query(&req.pairs, req.start, req.end)
    }

    // ------------------------------------------------------------------
    // Account service
    // ------------------------------------------------------------------

    pub fn get_account_info(&self) -> AccountInfo {
        let (total_balance, available_balance, used_margin) = {
            let account = self.account.read();
            (
                account.total_balance(),
                account.available_balance(),
                account.used_margin(),
            )
        };

        let unrealized_pnl = {
            let prices = self.prices.read();
            self.positions
                .read()
                .iter()
                .map(|(key, position)| match prices.get(&key.pair) {
                    Some(mark) => position.unrealized_pnl_at(*mark),
                    None => position.unrealized_pnl,
                })
                .sum()
        };

        AccountInfo {
            total_balance,
            available_balance,
            used_margin,
            unrealized_pnl,
        }
    }

    /// Always empty: the simulation performs no transfers.
    pub fn get_transfer_history(
        &self,
        _start: Option<DateTime<Utc>>,
        _end: Option<DateTime<Utc>>,
    ) -> Vec<Transfer> {
        Vec::new()
    }

    /// Last observed close price for a pair.
    pub fn ticker(&self, pair: &TradingPair) -> Result<Decimal> {
        self.prices
            .read()
            .get(pair)
            .copied()
            .ok_or_else(|| ExchangeError::NoPriceData(pair.clone()))
    }

    // ------------------------------------------------------------------
    // Internals shared with the trading facade
    // ------------------------------------------------------------------

    pub(crate) fn register_pending_stops(&self, order_id: OrderId, pending: PendingStop) {
        self.stops.write().register_pending(order_id, pending);
    }

    pub(crate) fn materialize_stops(&self, key: &PositionKey, pending: PendingStop) {
        let Some(quantity) = self.positions.read().get(key).map(|p| p.quantity) else {
            return;
        };
        let mut stops = self.stops.write();
        if pending.take_profit > Decimal::ZERO {
            if let Some(id) = pending.take_profit_id {
                stops.register(StopOrder {
                    id,
                    pair: pending.pair.clone(),
                    position_side: pending.position_side,
                    kind: StopKind::TakeProfit,
                    trigger_price: pending.take_profit,
                    quantity,
                });
            }
        }
        if pending.stop_loss > Decimal::ZERO {
            if let Some(id) = pending.stop_loss_id {
                stops.register(StopOrder {
                    id,
                    pair: pending.pair.clone(),
                    position_side: pending.position_side,
                    kind: StopKind::StopLoss,
                    trigger_price: pending.stop_loss,
                    quantity,
                });
            }
        }
    }
}

// ============================================================================
// Fill and trigger predicates
// ============================================================================

/// Market orders fill on the first bar observed after submission. Limit
/// buys fill when the bar traded at or below the limit, limit sells at or
/// above.
fn order_fills(order: &Order, kline: &Kline) -> bool {
    if order.is_market() {
        return true;
    }
    match order.direction() {
        OrderDirection::Buy => kline.low <= order.limit_price,
        OrderDirection::Sell => kline.high >= order.limit_price,
    }
}

/// Symmetric trigger: the stop fires when the bar's range crossed the
/// trigger price, regardless of direction.
fn stop_triggers(stop: &StopOrder, kline: &Kline) -> bool {
    kline.low <= stop.trigger_price && stop.trigger_price <= kline.high
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn flat_kline(open_secs: i64, price: Decimal) -> Kline {
        Kline {
            open_time: ts(open_secs),
            close_time: ts(open_secs + 299),
            open: price,
            high: price,
            low: price,
            close: price,
            volume: dec!(1),
            quote_volume: price,
        }
    }

    fn pair() -> TradingPair {
        TradingPair::new("BTC", "USDT")
    }

    fn exchange() -> BacktestExchange {
        BacktestExchange::new(BacktestConfig::default())
    }

    #[test]
    fn market_order_rejected_without_price_data() {
        let exchange = exchange();
        let err = exchange
            .create_order(CreateOrderRequest {
                pair: pair(),
                order_type: OrderType::Open,
                position_side: PositionSide::Long,
                price: Decimal::ZERO,
                quantity: dec!(0.1),
                timestamp: None,
            })
            .unwrap_err();
        assert!(matches!(err, ExchangeError::NoPriceData(_)));
    }

    #[test]
    fn open_freezes_margin_and_fills_on_next_bar() {
        let exchange = exchange();
        let pair = pair();
        exchange.scan(&pair, &flat_kline(0, dec!(50000)));

        let id = exchange
            .create_order(CreateOrderRequest {
                pair: pair.clone(),
                order_type: OrderType::Open,
                position_side: PositionSide::Long,
                price: Decimal::ZERO,
                quantity: dec!(0.1),
                timestamp: None,
            })
            .unwrap();

        // Margin reserved at the default 20x leverage: 50000 * 0.1 / 20.
        let account = exchange.get_account_info();
        assert_eq!(account.available_balance, dec!(9750));
        assert_eq!(account.total_balance, dec!(10000));

        exchange.scan(&pair, &flat_kline(300, dec!(50000)));

        let order = exchange.get_order(id, None).unwrap();
        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(order.executed_quantity, dec!(0.1));

        let positions = exchange.get_active_positions(&[]);
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].entry_price, dec!(50000));
        assert_eq!(positions[0].margin_amount, dec!(250));

        let account = exchange.get_account_info();
        assert_eq!(account.used_margin, dec!(250));
        assert_eq!(account.available_balance, dec!(9750));
    }

    #[test]
    fn cancel_restores_available_exactly() {
        let exchange = exchange();
        let pair = pair();
        exchange.scan(&pair, &flat_kline(0, dec!(50000)));
        let before = exchange.get_account_info().available_balance;

        let id = exchange
            .create_order(CreateOrderRequest {
                pair: pair.clone(),
                order_type: OrderType::Open,
                position_side: PositionSide::Long,
                price: dec!(49000),
                quantity: dec!(0.1),
                timestamp: None,
            })
            .unwrap();
        assert!(exchange.get_account_info().available_balance < before);

        exchange
            .cancel_order(CancelOrderRequest {
                id: Some(id),
                pair: None,
            })
            .unwrap();
        assert_eq!(exchange.get_account_info().available_balance, before);

        // Terminal orders cannot be cancelled again.
        let err = exchange
            .cancel_order(CancelOrderRequest {
                id: Some(id),
                pair: None,
            })
            .unwrap_err();
        assert!(matches!(err, ExchangeError::OrderNotFound { .. }));
    }

    #[test]
    fn cancel_with_wrong_pair_is_a_mismatch() {
        let exchange = exchange();
        let pair = pair();
        exchange.scan(&pair, &flat_kline(0, dec!(50000)));
        let id = exchange
            .create_order(CreateOrderRequest {
                pair: pair.clone(),
                order_type: OrderType::Open,
                position_side: PositionSide::Long,
                price: dec!(49000),
                quantity: dec!(0.1),
                timestamp: None,
            })
            .unwrap();

        let err = exchange
            .cancel_order(CancelOrderRequest {
                id: Some(id),
                pair: Some(TradingPair::new("ETH", "USDT")),
            })
            .unwrap_err();
        assert!(matches!(err, ExchangeError::PairMismatch { .. }));
    }

    #[test]
    fn leverage_must_be_in_range() {
        let exchange = exchange();
        assert!(matches!(
            exchange.set_leverage(&pair(), 0),
            Err(ExchangeError::InvalidLeverage(0))
        ));
        assert!(matches!(
            exchange.set_leverage(&pair(), 126),
            Err(ExchangeError::InvalidLeverage(126))
        ));
        assert!(exchange.set_leverage(&pair(), 125).is_ok());
    }

    #[test]
    fn modify_is_unsupported() {
        let exchange = exchange();
        assert!(matches!(
            exchange.modify_order(),
            Err(ExchangeError::Unsupported)
        ));
    }

    #[test]
    fn close_admission_requires_position() {
        let exchange = exchange();
        let pair = pair();
        exchange.scan(&pair, &flat_kline(0, dec!(50000)));

        let err = exchange
            .create_order(CreateOrderRequest {
                pair: pair.clone(),
                order_type: OrderType::Close,
                position_side: PositionSide::Long,
                price: Decimal::ZERO,
                quantity: dec!(0.1),
                timestamp: None,
            })
            .unwrap_err();
        assert!(matches!(err, ExchangeError::PositionNotFound { .. }));
    }

    #[test]
    fn no_orders_accepted_after_shutdown() {
        let exchange = exchange();
        let pair = pair();
        exchange.scan(&pair, &flat_kline(0, dec!(50000)));
        exchange.close();

        let err = exchange
            .create_order(CreateOrderRequest {
                pair,
                order_type: OrderType::Open,
                position_side: PositionSide::Long,
                price: Decimal::ZERO,
                quantity: dec!(0.1),
                timestamp: None,
            })
            .unwrap_err();
        assert!(matches!(err, ExchangeError::ExchangeShutdown));
    }
}
