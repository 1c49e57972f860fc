//! Perpetual-Futures Backtest Exchange
//!
//! A deterministic in-memory simulation of a perpetual-futures exchange,
//! driven by historical kline data. Strategies subscribe to bar streams and
//! submit order, position, and stop-order requests; the engine produces
//! fills, position mutations, account evolution, and per-position event
//! histories without contacting any live venue.

pub mod account;
pub mod config;
pub mod engine;
pub mod error;
pub mod history;
pub mod market;
pub mod orders;
pub mod position;
pub mod stops;
pub mod trading;
pub mod types;

pub use config::BacktestConfig;
pub use engine::{
    BacktestExchange, CancelOrderRequest, CancelOrdersRequest, CreateOrderRequest, HistoryRequest,
};
pub use error::{ExchangeError, Result};
pub use market::{load_klines_csv, Interval};
pub use trading::{
    ClosePositionRequest, FixedQuantityPrecision, OpenPositionRequest, OpenPositionResponse,
    QuantityPrecisionProvider, SetStopOrdersRequest, SetStopOrdersResponse,
};
pub use types::*;
