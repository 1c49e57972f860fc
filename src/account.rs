//! Account ledger: balance, available funds, used margin, frozen funds
//!
//! One shared ledger across all pairs. Invariant at every quiescent point:
//! `total_balance == available_balance + used_margin + sum(frozen)`.
//! Total balance moves only by realized PnL.

use rust_decimal::Decimal;
use std::collections::HashMap;

use crate::error::{ExchangeError, Result};
use crate::types::OrderId;

/// Outcome of reconciling an open fill against its frozen margin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenSettlement {
    /// Quantity the account could actually cover. Equal to the requested
    /// quantity unless the fill price drifted beyond the reserve and the
    /// remaining balance could not absorb the shortage.
    pub executed_quantity: Decimal,
    /// Margin committed for the executed quantity.
    pub margin: Decimal,
    /// True when the fill had to be reduced.
    pub partial: bool,
}

#[derive(Debug)]
pub struct AccountLedger {
    total_balance: Decimal,
    available_balance: Decimal,
    used_margin: Decimal,
    frozen: HashMap<OrderId, Decimal>,
}

impl AccountLedger {
    pub fn new(initial_balance: Decimal) -> Self {
        AccountLedger {
            total_balance: initial_balance,
            available_balance: initial_balance,
            used_margin: Decimal::ZERO,
            frozen: HashMap::new(),
        }
    }

    pub fn total_balance(&self) -> Decimal {
        self.total_balance
    }

    pub fn available_balance(&self) -> Decimal {
        self.available_balance
    }

    pub fn used_margin(&self) -> Decimal {
        self.used_margin
    }

    pub fn frozen_total(&self) -> Decimal {
        self.frozen.values().copied().sum()
    }

    pub fn frozen_for(&self, order_id: OrderId) -> Option<Decimal> {
        self.frozen.get(&order_id).copied()
    }

    /// Reserve margin for a pending open order. Rejects when the available
    /// balance cannot cover the reserve.
    pub fn freeze(&mut self, order_id: OrderId, amount: Decimal) -> Result<()> {
        if self.available_balance < amount {
            return Err(ExchangeError::InsufficientBalance {
                required: amount,
                available: self.available_balance,
            });
        }
        self.available_balance -= amount;
        self.frozen.insert(order_id, amount);
        debug_assert!(self.invariant_holds());
        Ok(())
    }

    /// Return a cancelled order's reserve to the available balance.
    /// Returns the released amount.
    pub fn release(&mut self, order_id: OrderId) -> Decimal {
        let amount = self.frozen.remove(&order_id).unwrap_or(Decimal::ZERO);
        self.available_balance += amount;
        debug_assert!(self.invariant_holds());
        amount
    }

    /// Reconcile an open fill at `price` for `quantity` against the frozen
    /// reserve of `order_id`.
    ///
    /// The reserve was estimated at submission time; the actual margin is
    /// `price * quantity / leverage`. A surplus is refunded, a shortage is
    /// drawn from the available balance, and when even that is not enough
    /// the fill shrinks to what `reserve + available` can carry.
    pub fn settle_open(
        &mut self,
        order_id: OrderId,
        price: Decimal,
        quantity: Decimal,
        leverage: u32,
    ) -> OpenSettlement {
        let lev = Decimal::from(leverage);
        let frozen = self.frozen.remove(&order_id).unwrap_or(Decimal::ZERO);
        let actual_margin = price * quantity / lev;

        let settlement = if frozen >= actual_margin {
            self.available_balance += frozen - actual_margin;
            self.used_margin += actual_margin;
            OpenSettlement {
                executed_quantity: quantity,
                margin: actual_margin,
                partial: false,
            }
        } else {
            let shortage = actual_margin - frozen;
            if self.available_balance >= shortage {
                self.available_balance -= shortage;
                self.used_margin += actual_margin;
                OpenSettlement {
                    executed_quantity: quantity,
                    margin: actual_margin,
                    partial: false,
                }
            } else {
                let margin = frozen + self.available_balance;
                let executed_quantity = margin * lev / price;
                self.used_margin += margin;
                self.available_balance = Decimal::ZERO;
                OpenSettlement {
                    executed_quantity,
                    margin,
                    partial: true,
                }
            }
        };

        debug_assert!(self.invariant_holds());
        settlement
    }

    /// Apply a close: release margin back to the available balance and fold
    /// the realized PnL into both available and total.
    pub fn settle_close(&mut self, released_margin: Decimal, realized_pnl: Decimal) {
        self.available_balance += released_margin + realized_pnl;
        self.used_margin -= released_margin;
        self.total_balance += realized_pnl;
        debug_assert!(self.invariant_holds());
    }

    fn invariant_holds(&self) -> bool {
        self.total_balance == self.available_balance + self.used_margin + self.frozen_total()
    }
}
