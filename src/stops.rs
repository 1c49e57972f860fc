//! Stop-order registry
//!
//! Active stops live in a `BTreeMap` so per-bar trigger scans walk them in
//! id order. Stops requested alongside a not-yet-filled open order are held
//! in a pre-registration table keyed by that order's id and materialized
//! when the fill completes.

use std::collections::{BTreeMap, HashMap};

use crate::types::{OrderId, PendingStop, PositionKey, StopOrder, TradingPair};

#[derive(Debug, Default)]
pub struct StopRegistry {
    stops: BTreeMap<OrderId, StopOrder>,
    pending: HashMap<OrderId, PendingStop>,
}

impl StopRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, stop: StopOrder) {
        self.stops.insert(stop.id, stop);
    }

    pub fn get(&self, id: OrderId) -> Option<&StopOrder> {
        self.stops.get(&id)
    }

    /// Atomically claim a stop for execution.
    pub fn remove(&mut self, id: OrderId) -> Option<StopOrder> {
        self.stops.remove(&id)
    }

    /// Every active stop, ascending by id.
    pub fn all(&self) -> Vec<StopOrder> {
        self.stops.values().cloned().collect()
    }

    /// Active stops on a pair, ascending by id.
    pub fn for_pair(&self, pair: &TradingPair) -> Vec<StopOrder> {
        self.stops
            .values()
            .filter(|s| &s.pair == pair)
            .cloned()
            .collect()
    }

    /// Ids of active stops protecting a position key.
    pub fn ids_for_key(&self, key: &PositionKey) -> Vec<OrderId> {
        self.stops
            .values()
            .filter(|s| &s.position_key() == key)
            .map(|s| s.id)
            .collect()
    }

    /// Drop every stop protecting a position key. Returns how many were
    /// removed. Called when the position is destroyed so no orphaned
    /// trigger outlives it.
    pub fn purge_key(&mut self, key: &PositionKey) -> usize {
        let ids = self.ids_for_key(key);
        for id in &ids {
            self.stops.remove(id);
        }
        ids.len()
    }

    pub fn register_pending(&mut self, order_id: OrderId, pending: PendingStop) {
        self.pending.insert(order_id, pending);
    }

    /// Take the pre-registered stops of an open order, if any. Used both on
    /// fill (to materialize them) and on cancel (to discard them).
    pub fn take_pending(&mut self, order_id: OrderId) -> Option<PendingStop> {
        self.pending.remove(&order_id)
    }

    pub fn active_count(&self) -> usize {
        self.stops.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PositionSide, StopKind};
    use rust_decimal_macros::dec;

    fn stop(id: OrderId, pair: &TradingPair, side: PositionSide, kind: StopKind) -> StopOrder {
        StopOrder {
            id,
            pair: pair.clone(),
            position_side: side,
            kind,
            trigger_price: dec!(51000),
            quantity: dec!(0.1),
        }
    }

    #[test]
    fn pair_scan_is_sorted_by_id() {
        let btc = TradingPair::new("BTC", "USDT");
        let mut registry = StopRegistry::new();
        registry.register(stop(5, &btc, PositionSide::Long, StopKind::StopLoss));
        registry.register(stop(2, &btc, PositionSide::Long, StopKind::TakeProfit));

        let ids: Vec<OrderId> = registry.for_pair(&btc).iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![2, 5]);
    }

    #[test]
    fn purge_removes_only_the_given_key() {
        let btc = TradingPair::new("BTC", "USDT");
        let mut registry = StopRegistry::new();
        registry.register(stop(1, &btc, PositionSide::Long, StopKind::TakeProfit));
        registry.register(stop(2, &btc, PositionSide::Long, StopKind::StopLoss));
        registry.register(stop(3, &btc, PositionSide::Short, StopKind::StopLoss));

        let purged = registry.purge_key(&PositionKey::new(btc.clone(), PositionSide::Long));
        assert_eq!(purged, 2);
        assert_eq!(registry.active_count(), 1);
        assert!(registry.get(3).is_some());
    }

    #[test]
    fn pending_stops_are_taken_once() {
        let btc = TradingPair::new("BTC", "USDT");
        let mut registry = StopRegistry::new();
        registry.register_pending(
            7,
            PendingStop {
                pair: btc.clone(),
                position_side: PositionSide::Long,
                take_profit: dec!(51000),
                stop_loss: dec!(49000),
                take_profit_id: Some(8),
                stop_loss_id: Some(9),
            },
        );

        let taken = registry.take_pending(7).unwrap();
        assert_eq!(taken.take_profit_id, Some(8));
        assert!(registry.take_pending(7).is_none());
    }
}
