//! Exchange error types
//!
//! Every request-path failure surfaces as an [`ExchangeError`] to the caller.
//! Bar-scan failures never propagate; they are logged and the scan moves on.

use rust_decimal::Decimal;
use thiserror::Error;

use crate::market::Interval;
use crate::types::{OrderId, PositionSide, TradingPair};

pub type Result<T> = std::result::Result<T, ExchangeError>;

#[derive(Debug, Clone, Error)]
pub enum ExchangeError {
    #[error("insufficient balance: required margin {required}, available {available}")]
    InsufficientBalance {
        required: Decimal,
        available: Decimal,
    },

    #[error("insufficient position: requested {requested}, open {open}")]
    InsufficientPosition { requested: Decimal, open: Decimal },

    #[error("no open position for {pair} {side}")]
    PositionNotFound {
        pair: TradingPair,
        side: PositionSide,
    },

    #[error("order {id} not found")]
    OrderNotFound { id: OrderId },

    #[error("order {id} belongs to {actual}, not {requested}")]
    PairMismatch {
        id: OrderId,
        actual: TradingPair,
        requested: TradingPair,
    },

    #[error("leverage {0} outside [1, 125]")]
    InvalidLeverage(u32),

    #[error("no price data for {0}")]
    NoPriceData(TradingPair),

    #[error("no kline data for {pair} {interval}")]
    NoKlineData {
        pair: TradingPair,
        interval: Interval,
    },

    #[error("order modification is not supported")]
    Unsupported,

    #[error("either quantity or balance percent must be provided")]
    QuantityRequired,

    #[error("exchange has been shut down")]
    ExchangeShutdown,
}
