//! Order store
//!
//! Keeps every order ever created plus a sorted index of the pending ones.
//! The index is a `BTreeSet` so per-bar candidate lists come out in id
//! order, which keeps fills deterministic across runs.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::{BTreeSet, HashMap};

use crate::types::{Order, OrderId, OrderStatus, TradingPair};

#[derive(Debug, Default)]
pub struct OrderStore {
    orders: HashMap<OrderId, Order>,
    pending: BTreeSet<OrderId>,
}

impl OrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_pending(&mut self, order: Order) {
        self.pending.insert(order.id);
        self.orders.insert(order.id, order);
    }

    pub fn get(&self, id: OrderId) -> Option<&Order> {
        self.orders.get(&id)
    }

    pub fn is_pending(&self, id: OrderId) -> bool {
        self.pending.contains(&id)
    }

    /// Pending orders for a pair, ascending by id.
    pub fn pending_for_pair(&self, pair: &TradingPair) -> Vec<Order> {
        self.pending
            .iter()
            .filter_map(|id| self.orders.get(id))
            .filter(|o| &o.pair == pair)
            .cloned()
            .collect()
    }

    /// Ids of pending orders, optionally restricted to a pair.
    pub fn pending_ids(&self, pair: Option<&TradingPair>) -> Vec<OrderId> {
        self.pending
            .iter()
            .filter_map(|id| self.orders.get(id))
            .filter(|o| pair.map_or(true, |p| &o.pair == p))
            .map(|o| o.id)
            .collect()
    }

    /// Pending orders snapshot, optionally restricted to a pair.
    pub fn pending_orders(&self, pair: Option<&TradingPair>) -> Vec<Order> {
        self.pending
            .iter()
            .filter_map(|id| self.orders.get(id))
            .filter(|o| pair.map_or(true, |p| &o.pair == p))
            .cloned()
            .collect()
    }

    /// Atomically claim a pending order for filling: removes it from the
    /// pending index and hands back a copy. Returns `None` when the order is
    /// not pending any more (cancelled or claimed by another scan).
    pub fn claim_pending(&mut self, id: OrderId) -> Option<Order> {
        if !self.pending.remove(&id) {
            return None;
        }
        self.orders.get(&id).cloned()
    }

    /// Finalize a claimed order after its fill settled.
    pub fn complete(
        &mut self,
        id: OrderId,
        status: OrderStatus,
        executed_quantity: Decimal,
        now: DateTime<Utc>,
    ) {
        if let Some(order) = self.orders.get_mut(&id) {
            order.status = status;
            order.executed_quantity = executed_quantity;
            order.updated_at = now;
            order.completed_at = Some(now);
        }
    }

    /// Cancel an order: drop it from the pending index and mark it
    /// terminal. Returns the updated order, or `None` when it was not
    /// pending.
    pub fn cancel(&mut self, id: OrderId, now: DateTime<Utc>) -> Option<Order> {
        if !self.pending.remove(&id) {
            return None;
        }
        self.mark_cancelled(id, now);
        self.orders.get(&id).cloned()
    }

    /// Mark a claimed order cancelled without touching the pending index.
    /// Used when a close fill finds its position already gone.
    pub fn mark_cancelled(&mut self, id: OrderId, now: DateTime<Utc>) {
        if let Some(order) = self.orders.get_mut(&id) {
            order.status = OrderStatus::Cancelled;
            order.updated_at = now;
        }
    }

    /// Persist an already-terminal order, e.g. the synthesized audit record
    /// of a stop execution. Never enters the pending index.
    pub fn insert_completed(&mut self, order: Order) {
        self.orders.insert(order.id, order);
    }
}
