//! Core data types used across the simulated exchange
//!
//! All prices, quantities, and monetary amounts are `rust_decimal::Decimal`.
//! The ledger paths never touch floating point.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Order and stop-order identifier. One monotonic counter per exchange
/// instance covers both.
pub type OrderId = u64;

// ============================================================================
// Trading pair
// ============================================================================

/// A (base, quote) asset pair, compared by value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TradingPair {
    pub base: String,
    pub quote: String,
}

impl TradingPair {
    pub fn new(base: impl Into<String>, quote: impl Into<String>) -> Self {
        TradingPair {
            base: base.into(),
            quote: quote.into(),
        }
    }

    /// Exchange-style concatenated symbol, e.g. `BTCUSDT`.
    pub fn symbol(&self) -> String {
        format!("{}{}", self.base, self.quote)
    }
}

impl fmt::Display for TradingPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.base, self.quote)
    }
}

// ============================================================================
// Sides and directions
// ============================================================================

/// Position side. Long and short on the same pair are independent ledger
/// entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PositionSide {
    Long,
    Short,
}

impl fmt::Display for PositionSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PositionSide::Long => write!(f, "LONG"),
            PositionSide::Short => write!(f, "SHORT"),
        }
    }
}

/// Whether an order opens new exposure or reduces existing exposure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Open,
    Close,
}

/// Effective buy/sell direction, derived from order type and position side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderDirection {
    Buy,
    Sell,
}

impl OrderType {
    /// Open+Long and Close+Short buy; Open+Short and Close+Long sell.
    pub fn direction(self, side: PositionSide) -> OrderDirection {
        match (self, side) {
            (OrderType::Open, PositionSide::Long) => OrderDirection::Buy,
            (OrderType::Open, PositionSide::Short) => OrderDirection::Sell,
            (OrderType::Close, PositionSide::Long) => OrderDirection::Sell,
            (OrderType::Close, PositionSide::Short) => OrderDirection::Buy,
        }
    }
}

/// Composite key of the position ledger.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PositionKey {
    pub pair: TradingPair,
    pub side: PositionSide,
}

impl PositionKey {
    pub fn new(pair: TradingPair, side: PositionSide) -> Self {
        PositionKey { pair, side }
    }
}

impl fmt::Display for PositionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.pair, self.side)
    }
}

// ============================================================================
// Orders
// ============================================================================

/// Order state machine. `Filled` and `Cancelled` are terminal;
/// `PartiallyFilled` is reached when the account cannot cover the full
/// quantity at fill time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Pending,
    PartiallyFilled,
    Filled,
    Cancelled,
}

impl OrderStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, OrderStatus::Filled | OrderStatus::Cancelled)
    }
}

/// An open or close request resting in the exchange until a bar satisfies
/// its fill predicate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub pair: TradingPair,
    pub order_type: OrderType,
    pub position_side: PositionSide,
    /// Zero means market: the order fills at the close of the next bar.
    pub limit_price: Decimal,
    pub quantity: Decimal,
    pub executed_quantity: Decimal,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Order {
    pub fn new(
        id: OrderId,
        pair: TradingPair,
        order_type: OrderType,
        position_side: PositionSide,
        limit_price: Decimal,
        quantity: Decimal,
        created_at: DateTime<Utc>,
    ) -> Self {
        Order {
            id,
            pair,
            order_type,
            position_side,
            limit_price,
            quantity,
            executed_quantity: Decimal::ZERO,
            status: OrderStatus::Pending,
            created_at,
            updated_at: created_at,
            completed_at: None,
        }
    }

    pub fn is_market(&self) -> bool {
        self.limit_price.is_zero()
    }

    pub fn direction(&self) -> OrderDirection {
        self.order_type.direction(self.position_side)
    }

    pub fn position_key(&self) -> PositionKey {
        PositionKey::new(self.pair.clone(), self.position_side)
    }
}

// ============================================================================
// Stop orders
// ============================================================================

/// Take-profit closes in the favorable direction, stop-loss in the
/// unfavorable one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopKind {
    TakeProfit,
    StopLoss,
}

impl fmt::Display for StopKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopKind::TakeProfit => write!(f, "take-profit"),
            StopKind::StopLoss => write!(f, "stop-loss"),
        }
    }
}

/// A latent close instruction tied to an open position, executed the moment
/// a bar's range crosses the trigger price.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopOrder {
    pub id: OrderId,
    pub pair: TradingPair,
    pub position_side: PositionSide,
    pub kind: StopKind,
    pub trigger_price: Decimal,
    /// Zero closes the whole position.
    pub quantity: Decimal,
}

impl StopOrder {
    pub fn position_key(&self) -> PositionKey {
        PositionKey::new(self.pair.clone(), self.position_side)
    }
}

/// Stop parameters reserved for an open order that has not filled yet.
/// Materialized into real [`StopOrder`]s when the fill completes, discarded
/// when the order is cancelled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingStop {
    pub pair: TradingPair,
    pub position_side: PositionSide,
    /// Zero means no take-profit requested.
    pub take_profit: Decimal,
    /// Zero means no stop-loss requested.
    pub stop_loss: Decimal,
    pub take_profit_id: Option<OrderId>,
    pub stop_loss_id: Option<OrderId>,
}

// ============================================================================
// Klines
// ============================================================================

/// Validation errors for kline data
#[derive(Debug, Error)]
pub enum KlineValidationError {
    #[error("high ({high}) must be >= low ({low})")]
    HighLessThanLow { high: Decimal, low: Decimal },

    #[error("volume ({0}) must be >= 0")]
    NegativeVolume(Decimal),

    #[error("open ({open}) must be between low ({low}) and high ({high})")]
    OpenOutOfRange {
        open: Decimal,
        low: Decimal,
        high: Decimal,
    },

    #[error("close ({close}) must be between low ({low}) and high ({high})")]
    CloseOutOfRange {
        close: Decimal,
        low: Decimal,
        high: Decimal,
    },

    #[error("prices must be positive: open={open}, high={high}, low={low}, close={close}")]
    NonPositivePrice {
        open: Decimal,
        high: Decimal,
        low: Decimal,
        close: Decimal,
    },

    #[error("close_time ({close_time}) must not precede open_time ({open_time})")]
    TimeReversed {
        open_time: DateTime<Utc>,
        close_time: DateTime<Utc>,
    },
}

/// OHLCV candlestick bar
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Kline {
    pub open_time: DateTime<Utc>,
    pub close_time: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub quote_volume: Decimal,
}

impl Kline {
    /// Create a new kline with validation
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        open_time: DateTime<Utc>,
        close_time: DateTime<Utc>,
        open: Decimal,
        high: Decimal,
        low: Decimal,
        close: Decimal,
        volume: Decimal,
        quote_volume: Decimal,
    ) -> Result<Self, KlineValidationError> {
        let kline = Kline {
            open_time,
            close_time,
            open,
            high,
            low,
            close,
            volume,
            quote_volume,
        };
        kline.validate()?;
        Ok(kline)
    }

    /// Validate the kline data
    pub fn validate(&self) -> Result<(), KlineValidationError> {
        if self.open <= Decimal::ZERO
            || self.high <= Decimal::ZERO
            || self.low <= Decimal::ZERO
            || self.close <= Decimal::ZERO
        {
            return Err(KlineValidationError::NonPositivePrice {
                open: self.open,
                high: self.high,
                low: self.low,
                close: self.close,
            });
        }

        if self.high < self.low {
            return Err(KlineValidationError::HighLessThanLow {
                high: self.high,
                low: self.low,
            });
        }

        if self.volume < Decimal::ZERO {
            return Err(KlineValidationError::NegativeVolume(self.volume));
        }

        if self.open < self.low || self.open > self.high {
            return Err(KlineValidationError::OpenOutOfRange {
                open: self.open,
                low: self.low,
                high: self.high,
            });
        }

        if self.close < self.low || self.close > self.high {
            return Err(KlineValidationError::CloseOutOfRange {
                close: self.close,
                low: self.low,
                high: self.high,
            });
        }

        if self.close_time < self.open_time {
            return Err(KlineValidationError::TimeReversed {
                open_time: self.open_time,
                close_time: self.close_time,
            });
        }

        Ok(())
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }
}

// ============================================================================
// Positions
// ============================================================================

/// One side of the two-sided position ledger for a pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub pair: TradingPair,
    pub position_side: PositionSide,
    /// Strictly positive while the position exists.
    pub quantity: Decimal,
    /// Weighted average over all opens and increases.
    pub entry_price: Decimal,
    /// Equal to the entry price while fees are zero.
    pub break_even_price: Decimal,
    /// Margin committed across increases, released proportionally on close.
    pub margin_amount: Decimal,
    /// Snapshotted at creation; `set_leverage` may change it later without
    /// reshuffling committed margin.
    pub leverage: u32,
    pub mark_price: Decimal,
    pub unrealized_pnl: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Position {
    pub fn key(&self) -> PositionKey {
        PositionKey::new(self.pair.clone(), self.position_side)
    }

    /// Hypothetical PnL if the position were closed at `mark`.
    pub fn unrealized_pnl_at(&self, mark: Decimal) -> Decimal {
        match self.position_side {
            PositionSide::Long => (mark - self.entry_price) * self.quantity,
            PositionSide::Short => (self.entry_price - mark) * self.quantity,
        }
    }

    /// Refresh `mark_price` and `unrealized_pnl` in place.
    pub fn mark_to(&mut self, mark: Decimal) {
        self.mark_price = mark;
        self.unrealized_pnl = self.unrealized_pnl_at(mark);
    }

    /// Notional value at the mark price.
    pub fn notional(&self) -> Decimal {
        self.mark_price * self.quantity
    }
}

// ============================================================================
// Position events and histories
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionEventKind {
    Create,
    Increase,
    Decrease,
    Close,
}

/// A single audited mutation of an open position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionEvent {
    pub order_id: OrderId,
    pub kind: PositionEventKind,
    pub quantity: Decimal,
    pub before_quantity: Decimal,
    pub after_quantity: Decimal,
    pub price: Decimal,
    pub realized_pnl: Decimal,
    /// Always zero; fees are out of scope.
    pub fee: Decimal,
    pub created_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

/// Audit record of one position from creation to close. Accumulated while
/// the position is open, immutable once moved to the closed list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionHistory {
    pub pair: TradingPair,
    pub position_side: PositionSide,
    pub entry_price: Decimal,
    pub close_price: Decimal,
    /// Largest quantity the position ever reached.
    pub max_quantity: Decimal,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub events: Vec<PositionEvent>,
    /// Sum of `realized_pnl` across events, set when the record closes.
    pub realized_pnl: Decimal,
}

// ============================================================================
// Account
// ============================================================================

/// Point-in-time account snapshot. `unrealized_pnl` is freshly computed as
/// the sum over open positions at their last observed prices.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountInfo {
    pub total_balance: Decimal,
    pub available_balance: Decimal,
    pub used_margin: Decimal,
    pub unrealized_pnl: Decimal,
}

/// Balance transfer record. The simulation performs no transfers, so
/// queries always return an empty list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transfer {
    pub amount: Decimal,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn direction_is_derived_from_type_and_side() {
        assert_eq!(
            OrderType::Open.direction(PositionSide::Long),
            OrderDirection::Buy
        );
        assert_eq!(
            OrderType::Open.direction(PositionSide::Short),
            OrderDirection::Sell
        );
        assert_eq!(
            OrderType::Close.direction(PositionSide::Long),
            OrderDirection::Sell
        );
        assert_eq!(
            OrderType::Close.direction(PositionSide::Short),
            OrderDirection::Buy
        );
    }

    #[test]
    fn kline_validation_rejects_inverted_range() {
        let result = Kline::new(
            ts(0),
            ts(60),
            dec!(100),
            dec!(99),
            dec!(101),
            dec!(100),
            dec!(1),
            dec!(100),
        );
        assert!(matches!(
            result,
            Err(KlineValidationError::HighLessThanLow { .. })
        ));
    }

    #[test]
    fn kline_validation_rejects_close_outside_range() {
        let result = Kline::new(
            ts(0),
            ts(60),
            dec!(100),
            dec!(101),
            dec!(99),
            dec!(102),
            dec!(1),
            dec!(100),
        );
        assert!(matches!(
            result,
            Err(KlineValidationError::CloseOutOfRange { .. })
        ));
    }

    #[test]
    fn kline_validation_accepts_well_formed_bar() {
        let kline = Kline::new(
            ts(0),
            ts(60),
            dec!(100),
            dec!(101),
            dec!(99),
            dec!(100.5),
            dec!(1),
            dec!(100),
        )
        .unwrap();
        assert!(kline.is_valid());
    }

    #[test]
    fn unrealized_pnl_flips_sign_with_side() {
        let mut position = Position {
            pair: TradingPair::new("BTC", "USDT"),
            position_side: PositionSide::Long,
            quantity: dec!(0.5),
            entry_price: dec!(50000),
            break_even_price: dec!(50000),
            margin_amount: dec!(2500),
            leverage: 10,
            mark_price: dec!(50000),
            unrealized_pnl: Decimal::ZERO,
            created_at: ts(0),
            updated_at: ts(0),
        };

        position.mark_to(dec!(51000));
        assert_eq!(position.unrealized_pnl, dec!(500));

        position.position_side = PositionSide::Short;
        position.mark_to(dec!(51000));
        assert_eq!(position.unrealized_pnl, dec!(-500));
    }

    #[test]
    fn market_order_is_zero_limit_price() {
        let order = Order::new(
            1,
            TradingPair::new("BTC", "USDT"),
            OrderType::Open,
            PositionSide::Long,
            Decimal::ZERO,
            dec!(0.1),
            ts(0),
        );
        assert!(order.is_market());
        assert_eq!(order.status, OrderStatus::Pending);
        assert_eq!(order.executed_quantity, Decimal::ZERO);
    }
}
