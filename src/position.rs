//! Two-sided position ledger
//!
//! Long and short on the same pair are independent entries keyed by
//! (pair, side). A `BTreeMap` keeps iteration order stable for deterministic
//! snapshots.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::BTreeMap;

use crate::error::{ExchangeError, Result};
use crate::types::{Position, PositionKey, PositionSide, TradingPair};

/// Effect of an open fill on the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenOutcome {
    /// True when the fill created the position rather than increasing it.
    pub created: bool,
    pub before_quantity: Decimal,
    pub after_quantity: Decimal,
}

/// Effect of a close on the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseOutcome {
    /// Quantity actually closed, clamped to what was open.
    pub quantity: Decimal,
    pub realized_pnl: Decimal,
    /// Margin released proportionally to the closed quantity.
    pub released_margin: Decimal,
    pub before_quantity: Decimal,
    pub after_quantity: Decimal,
    /// True when the close destroyed the position.
    pub closed: bool,
    pub entry_price: Decimal,
}

#[derive(Debug, Default)]
pub struct PositionBook {
    positions: BTreeMap<PositionKey, Position>,
}

impl PositionBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &PositionKey) -> Option<&Position> {
        self.positions.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PositionKey, &Position)> {
        self.positions.iter()
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Apply an open fill: create the position, or fold the fill into the
    /// weighted-average entry price of the existing one.
    pub fn apply_open(
        &mut self,
        key: PositionKey,
        price: Decimal,
        quantity: Decimal,
        margin: Decimal,
        leverage: u32,
        now: DateTime<Utc>,
    ) -> OpenOutcome {
        match self.positions.get_mut(&key) {
            Some(position) => {
                let before = position.quantity;
                let after = before + quantity;
                position.entry_price =
                    (position.entry_price * before + price * quantity) / after;
                position.break_even_price = position.entry_price;
                position.quantity = after;
                position.margin_amount += margin;
                position.updated_at = now;
                OpenOutcome {
                    created: false,
                    before_quantity: before,
                    after_quantity: after,
                }
            }
            None => {
                let position = Position {
                    pair: key.pair.clone(),
                    position_side: key.side,
                    quantity,
                    entry_price: price,
                    break_even_price: price,
                    margin_amount: margin,
                    leverage,
                    mark_price: price,
                    unrealized_pnl: Decimal::ZERO,
                    created_at: now,
                    updated_at: now,
                };
                self.positions.insert(key, position);
                OpenOutcome {
                    created: true,
                    before_quantity: Decimal::ZERO,
                    after_quantity: quantity,
                }
            }
        }
    }

    /// Apply a close at `price`. `quantity` of `None` closes the whole
    /// position; an over-requested quantity is clamped silently.
    pub fn apply_close(
        &mut self,
        key: &PositionKey,
        price: Decimal,
        quantity: Option<Decimal>,
        now: DateTime<Utc>,
    ) -> Result<CloseOutcome> {
        let position =
            self.positions
                .get_mut(key)
                .ok_or_else(|| ExchangeError::PositionNotFound {
                    pair: key.pair.clone(),
                    side: key.side,
                })?;

        let before = position.quantity;
        let quantity = quantity.unwrap_or(before).min(before);

        let realized_pnl = match position.position_side {
            PositionSide::Long => (price - position.entry_price) * quantity,
            PositionSide::Short => (position.entry_price - price) * quantity,
        };
        let released_margin = position.margin_amount * quantity / before;

        let after = before - quantity;
        let entry_price = position.entry_price;
        let closed = after.is_zero();

        if closed {
            self.positions.remove(key);
        } else {
            position.quantity = after;
            position.margin_amount -= released_margin;
            position.updated_at = now;
        }

        Ok(CloseOutcome {
            quantity,
            realized_pnl,
            released_margin,
            before_quantity: before,
            after_quantity: after,
            closed,
            entry_price,
        })
    }

    /// Update the stored leverage on both sides of a pair. Margin already
    /// committed is untouched.
    pub fn set_leverage(&mut self, pair: &TradingPair, leverage: u32, now: DateTime<Utc>) {
        for position in self.positions.values_mut() {
            if &position.pair == pair {
                position.leverage = leverage;
                position.updated_at = now;
            }
        }
    }

    /// Sum of unrealized PnL across all positions at their mark prices.
    pub fn total_unrealized_pnl(&self) -> Decimal {
        self.positions.values().map(|p| p.unrealized_pnl).sum()
    }
}
