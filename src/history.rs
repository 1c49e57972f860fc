//! Per-position event history
//!
//! One active record per open position key, accumulating CREATE / INCREASE /
//! DECREASE events. The terminal CLOSE event finalizes the record and moves
//! it to the immutable closed list.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;

use crate::types::{PositionEvent, PositionEventKind, PositionHistory, PositionKey, TradingPair};

#[derive(Debug, Default)]
pub struct HistoryRecorder {
    active: HashMap<PositionKey, PositionHistory>,
    closed: Vec<PositionHistory>,
}

impl HistoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an open-side event. Creates the active record on CREATE and
    /// tracks the largest quantity the position ever reached.
    pub fn record_open(&mut self, key: PositionKey, event: PositionEvent) {
        let record = self
            .active
            .entry(key.clone())
            .or_insert_with(|| PositionHistory {
                pair: key.pair.clone(),
                position_side: key.side,
                entry_price: event.price,
                close_price: Decimal::ZERO,
                max_quantity: Decimal::ZERO,
                opened_at: event.created_at,
                closed_at: None,
                events: Vec::new(),
                realized_pnl: Decimal::ZERO,
            });

        record.max_quantity = record.max_quantity.max(event.after_quantity);
        record.events.push(event);
    }

    /// Record a close-side event. A terminal CLOSE finalizes the record:
    /// close price and time are stamped, realized PnL is summed over the
    /// events, and the record moves to the closed list.
    pub fn record_close(&mut self, key: &PositionKey, event: PositionEvent) {
        let Some(record) = self.active.get_mut(key) else {
            return;
        };

        let terminal = event.kind == PositionEventKind::Close;
        let close_price = event.price;
        let closed_at = event.completed_at;
        record.events.push(event);

        if terminal {
            let mut record = self.active.remove(key).expect("record exists");
            record.close_price = close_price;
            record.closed_at = Some(closed_at);
            record.realized_pnl = record.events.iter().map(|e| e.realized_pnl).sum();
            self.closed.push(record);
        }
    }

    pub fn active(&self, key: &PositionKey) -> Option<&PositionHistory> {
        self.active.get(key)
    }

    pub fn closed(&self) -> &[PositionHistory] {
        &self.closed
    }

    /// Closed records filtered by pairs (empty slice means all) and by the
    /// close timestamp window.
    pub fn query(
        &self,
        pairs: &[TradingPair],
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Vec<PositionHistory> {
        self.closed
            .iter()
            .filter(|h| pairs.is_empty() || pairs.contains(&h.pair))
            .filter(|h| match h.closed_at {
                Some(at) => {
                    start.map_or(true, |s| at >= s) && end.map_or(true, |e| at <= e)
                }
                None => false,
            })
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PositionSide, TradingPair};
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn key() -> PositionKey {
        PositionKey::new(TradingPair::new("BTC", "USDT"), PositionSide::Long)
    }

    fn event(
        kind: PositionEventKind,
        quantity: Decimal,
        before: Decimal,
        after: Decimal,
        price: Decimal,
        pnl: Decimal,
        secs: i64,
    ) -> PositionEvent {
        PositionEvent {
            order_id: 1,
            kind,
            quantity,
            before_quantity: before,
            after_quantity: after,
            price,
            realized_pnl: pnl,
            fee: Decimal::ZERO,
            created_at: ts(secs),
            completed_at: ts(secs),
        }
    }

    #[test]
    fn lifecycle_create_increase_close() {
        let mut recorder = HistoryRecorder::new();
        let key = key();

        recorder.record_open(
            key.clone(),
            event(
                PositionEventKind::Create,
                dec!(1),
                dec!(0),
                dec!(1),
                dec!(50000),
                dec!(0),
                0,
            ),
        );
        recorder.record_open(
            key.clone(),
            event(
                PositionEventKind::Increase,
                dec!(1),
                dec!(1),
                dec!(2),
                dec!(51000),
                dec!(0),
                60,
            ),
        );
        assert!(recorder.active(&key).is_some());
        assert_eq!(recorder.active(&key).unwrap().max_quantity, dec!(2));

        recorder.record_close(
            &key,
            event(
                PositionEventKind::Decrease,
                dec!(1),
                dec!(2),
                dec!(1),
                dec!(52000),
                dec!(2000),
                120,
            ),
        );
        recorder.record_close(
            &key,
            event(
                PositionEventKind::Close,
                dec!(1),
                dec!(1),
                dec!(0),
                dec!(53000),
                dec!(2500),
                180,
            ),
        );

        assert!(recorder.active(&key).is_none());
        assert_eq!(recorder.closed().len(), 1);

        let record = &recorder.closed()[0];
        assert_eq!(record.entry_price, dec!(50000));
        assert_eq!(record.close_price, dec!(53000));
        assert_eq!(record.closed_at, Some(ts(180)));
        assert_eq!(record.max_quantity, dec!(2));
        assert_eq!(record.realized_pnl, dec!(4500));
        assert_eq!(record.events.len(), 4);
        assert_eq!(record.events[0].kind, PositionEventKind::Create);
        assert_eq!(record.events.last().unwrap().kind, PositionEventKind::Close);
    }

    #[test]
    fn event_chain_is_contiguous() {
        let mut recorder = HistoryRecorder::new();
        let key = key();

        recorder.record_open(
            key.clone(),
            event(
                PositionEventKind::Create,
                dec!(2),
                dec!(0),
                dec!(2),
                dec!(50000),
                dec!(0),
                0,
            ),
        );
        recorder.record_close(
            &key,
            event(
                PositionEventKind::Close,
                dec!(2),
                dec!(2),
                dec!(0),
                dec!(50500),
                dec!(1000),
                60,
            ),
        );

        let record = &recorder.closed()[0];
        for pair in record.events.windows(2) {
            assert_eq!(pair[0].after_quantity, pair[1].before_quantity);
        }
    }

    #[test]
    fn query_filters_by_pair_and_window() {
        let mut recorder = HistoryRecorder::new();
        let btc = key();
        let eth = PositionKey::new(TradingPair::new("ETH", "USDT"), PositionSide::Long);

        for (k, close_secs) in [(btc.clone(), 100), (eth.clone(), 500)] {
            recorder.record_open(
                k.clone(),
                event(
                    PositionEventKind::Create,
                    dec!(1),
                    dec!(0),
                    dec!(1),
                    dec!(100),
                    dec!(0),
                    0,
                ),
            );
            recorder.record_close(
                &k,
                event(
                    PositionEventKind::Close,
                    dec!(1),
                    dec!(1),
                    dec!(0),
                    dec!(110),
                    dec!(10),
                    close_secs,
                ),
            );
        }

        assert_eq!(recorder.query(&[], None, None).len(), 2);
        assert_eq!(recorder.query(&[btc.pair.clone()], None, None).len(), 1);
        assert_eq!(recorder.query(&[], Some(ts(200)), None).len(), 1);
        assert_eq!(recorder.query(&[], None, Some(ts(200))).len(), 1);
    }

    #[test]
    fn close_without_active_record_is_ignored() {
        let mut recorder = HistoryRecorder::new();
        recorder.record_close(
            &key(),
            event(
                PositionEventKind::Close,
                dec!(1),
                dec!(1),
                dec!(0),
                dec!(100),
                dec!(0),
                0,
            ),
        );
        assert!(recorder.closed().is_empty());
    }
}
