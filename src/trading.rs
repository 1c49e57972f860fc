//! High-level trading facade
//!
//! Strategies usually size positions by balance percentage and protect them
//! with stops in one call. These helpers compute quantities, round them to
//! the pair's precision, and delegate to the order service.

use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use tracing::debug;

use crate::engine::{BacktestExchange, CreateOrderRequest};
use crate::error::{ExchangeError, Result};
use crate::types::{
    OrderId, OrderType, PendingStop, PositionKey, PositionSide, StopKind, StopOrder, TradingPair,
};

// ============================================================================
// Quantity precision
// ============================================================================

/// Decimal places allowed for order quantities on a pair.
pub trait QuantityPrecisionProvider: Send + Sync {
    fn quantity_precision(&self, pair: &TradingPair) -> u32;
}

/// Same precision for every pair. The exchange default is 3.
#[derive(Debug, Clone, Copy)]
pub struct FixedQuantityPrecision {
    precision: u32,
}

impl FixedQuantityPrecision {
    pub fn new(precision: u32) -> Self {
        FixedQuantityPrecision { precision }
    }
}

impl Default for FixedQuantityPrecision {
    fn default() -> Self {
        FixedQuantityPrecision { precision: 3 }
    }
}

impl QuantityPrecisionProvider for FixedQuantityPrecision {
    fn quantity_precision(&self, _pair: &TradingPair) -> u32 {
        self.precision
    }
}

/// Truncate toward zero to `precision` decimal places.
pub(crate) fn truncate_quantity(quantity: Decimal, precision: u32) -> Decimal {
    quantity.round_dp_with_strategy(precision, RoundingStrategy::ToZero)
}

/// Smallest representable quantity at `precision` decimal places.
fn minimum_unit(precision: u32) -> Decimal {
    Decimal::new(1, precision)
}

// ============================================================================
// Requests and responses
// ============================================================================

/// Options bag for opening a position. `quantity` and `balance_percent`
/// are mutually exclusive sizing modes; zero stop prices mean "not set".
#[derive(Debug, Clone)]
pub struct OpenPositionRequest {
    pub pair: TradingPair,
    pub position_side: PositionSide,
    /// Zero means market.
    pub price: Decimal,
    /// Explicit size; zero defers to `balance_percent`.
    pub quantity: Decimal,
    /// Percentage of the available balance to commit as margin.
    pub balance_percent: Decimal,
    pub take_profit: Decimal,
    pub stop_loss: Decimal,
}

impl OpenPositionRequest {
    /// Market open with an explicit quantity.
    pub fn market(pair: TradingPair, position_side: PositionSide, quantity: Decimal) -> Self {
        OpenPositionRequest {
            pair,
            position_side,
            price: Decimal::ZERO,
            quantity,
            balance_percent: Decimal::ZERO,
            take_profit: Decimal::ZERO,
            stop_loss: Decimal::ZERO,
        }
    }

    /// Limit open with an explicit quantity.
    pub fn limit(
        pair: TradingPair,
        position_side: PositionSide,
        price: Decimal,
        quantity: Decimal,
    ) -> Self {
        OpenPositionRequest {
            price,
            ..Self::market(pair, position_side, quantity)
        }
    }

    pub fn with_balance_percent(mut self, percent: Decimal) -> Self {
        self.quantity = Decimal::ZERO;
        self.balance_percent = percent;
        self
    }

    pub fn with_take_profit(mut self, price: Decimal) -> Self {
        self.take_profit = price;
        self
    }

    pub fn with_stop_loss(mut self, price: Decimal) -> Self {
        self.stop_loss = price;
        self
    }
}

#[derive(Debug, Clone)]
pub struct OpenPositionResponse {
    pub order_id: OrderId,
    pub take_profit_id: Option<OrderId>,
    pub stop_loss_id: Option<OrderId>,
    /// Margin the order will commit, at the estimate price.
    pub estimated_cost: Decimal,
    pub estimated_price: Decimal,
}

/// Options bag for closing a position: exactly one of `quantity`,
/// `percent`, or `close_all`.
#[derive(Debug, Clone)]
pub struct ClosePositionRequest {
    pub pair: TradingPair,
    pub position_side: PositionSide,
    /// Zero means market.
    pub price: Decimal,
    pub quantity: Decimal,
    pub percent: Decimal,
    pub close_all: bool,
}

impl ClosePositionRequest {
    pub fn market_all(pair: TradingPair, position_side: PositionSide) -> Self {
        ClosePositionRequest {
            pair,
            position_side,
            price: Decimal::ZERO,
            quantity: Decimal::ZERO,
            percent: Decimal::ZERO,
            close_all: true,
        }
    }

    pub fn market_quantity(
        pair: TradingPair,
        position_side: PositionSide,
        quantity: Decimal,
    ) -> Self {
        ClosePositionRequest {
            quantity,
            close_all: false,
            ..Self::market_all(pair, position_side)
        }
    }

    pub fn market_percent(
        pair: TradingPair,
        position_side: PositionSide,
        percent: Decimal,
    ) -> Self {
        ClosePositionRequest {
            percent,
            close_all: false,
            ..Self::market_all(pair, position_side)
        }
    }
}

#[derive(Debug, Clone)]
pub struct SetStopOrdersRequest {
    pub pair: TradingPair,
    pub position_side: PositionSide,
    /// Zero means no take-profit.
    pub take_profit: Decimal,
    /// Zero means no stop-loss.
    pub stop_loss: Decimal,
}

#[derive(Debug, Clone)]
pub struct SetStopOrdersResponse {
    pub take_profit_id: Option<OrderId>,
    pub stop_loss_id: Option<OrderId>,
}

// ============================================================================
// Facade
// ============================================================================

impl BacktestExchange {
    /// Open (or increase) a position. Quantity comes either from the
    /// request or from a percentage of the available balance converted at
    /// the effective price and current leverage. Stops are pre-registered
    /// against the order and materialize when it fills.
    pub fn open_position(&self, req: OpenPositionRequest) -> Result<OpenPositionResponse> {
        let effective_price = if req.price > Decimal::ZERO {
            req.price
        } else {
            self.ticker(&req.pair)?
        };
        let leverage = Decimal::from(self.leverage_for(&req.pair));
        let precision = self.precision.quantity_precision(&req.pair);

        let quantity = if req.quantity > Decimal::ZERO {
            truncate_quantity(req.quantity, precision)
        } else if req.balance_percent > Decimal::ZERO {
            let available = self.get_account_info().available_balance;
            let funds = available * req.balance_percent / dec!(100);
            truncate_quantity(funds * leverage / effective_price, precision)
        } else {
            return Err(ExchangeError::QuantityRequired);
        };

        let order_id = self.create_order(CreateOrderRequest {
            pair: req.pair.clone(),
            order_type: OrderType::Open,
            position_side: req.position_side,
            price: req.price,
            quantity,
            timestamp: None,
        })?;

        let (take_profit_id, stop_loss_id) =
            if req.take_profit > Decimal::ZERO || req.stop_loss > Decimal::ZERO {
                let take_profit_id = (req.take_profit > Decimal::ZERO).then(|| self.next_id());
                let stop_loss_id = (req.stop_loss > Decimal::ZERO).then(|| self.next_id());
                self.register_pending_stops(
                    order_id,
                    PendingStop {
                        pair: req.pair.clone(),
                        position_side: req.position_side,
                        take_profit: req.take_profit,
                        stop_loss: req.stop_loss,
                        take_profit_id,
                        stop_loss_id,
                    },
                );
                (take_profit_id, stop_loss_id)
            } else {
                (None, None)
            };

        debug!(
            order_id,
            pair = %req.pair,
            side = %req.position_side,
            %quantity,
            estimated_price = %effective_price,
            "position open requested"
        );

        Ok(OpenPositionResponse {
            order_id,
            take_profit_id,
            stop_loss_id,
            estimated_cost: effective_price * quantity / leverage,
            estimated_price: effective_price,
        })
    }

    /// Close part or all of a position. A percentage that rounds to zero
    /// against a live position falls back to one minimum precision unit so
    /// the request always makes progress.
    pub fn close_position(&self, req: ClosePositionRequest) -> Result<OrderId> {
        let key = PositionKey::new(req.pair.clone(), req.position_side);
        let open_quantity = self
            .positions
            .read()
            .get(&key)
            .map(|p| p.quantity)
            .ok_or_else(|| ExchangeError::PositionNotFound {
                pair: key.pair.clone(),
                side: key.side,
            })?;

        let precision = self.precision.quantity_precision(&req.pair);
        let quantity = if req.quantity > Decimal::ZERO {
            truncate_quantity(req.quantity, precision)
        } else if req.close_all {
            open_quantity
        } else if req.percent > Decimal::ZERO {
            let raw = open_quantity * req.percent / dec!(100);
            let rounded = truncate_quantity(raw, precision);
            if rounded.is_zero() && raw > Decimal::ZERO {
                minimum_unit(precision).min(open_quantity)
            } else {
                rounded
            }
        } else {
            return Err(ExchangeError::QuantityRequired);
        };

        self.create_order(CreateOrderRequest {
            pair: req.pair,
            order_type: OrderType::Close,
            position_side: req.position_side,
            price: req.price,
            quantity,
            timestamp: None,
        })
    }

    /// Replace the stops protecting an open position. Both stops close the
    /// full position quantity as of this call.
    pub fn set_stop_orders(&self, req: SetStopOrdersRequest) -> Result<SetStopOrdersResponse> {
        let key = PositionKey::new(req.pair.clone(), req.position_side);
        let quantity = self
            .positions
            .read()
            .get(&key)
            .map(|p| p.quantity)
            .ok_or_else(|| ExchangeError::PositionNotFound {
                pair: key.pair.clone(),
                side: key.side,
            })?;

        let mut stops = self.stops.write();
        stops.purge_key(&key);

        let take_profit_id = if req.take_profit > Decimal::ZERO {
            let id = self.next_id();
            stops.register(StopOrder {
                id,
                pair: req.pair.clone(),
                position_side: req.position_side,
                kind: StopKind::TakeProfit,
                trigger_price: req.take_profit,
                quantity,
            });
            Some(id)
        } else {
            None
        };

        let stop_loss_id = if req.stop_loss > Decimal::ZERO {
            let id = self.next_id();
            stops.register(StopOrder {
                id,
                pair: req.pair.clone(),
                position_side: req.position_side,
                kind: StopKind::StopLoss,
                trigger_price: req.stop_loss,
                quantity,
            });
            Some(id)
        } else {
            None
        };

        debug!(
            pair = %req.pair,
            side = %req.position_side,
            take_profit = %req.take_profit,
            stop_loss = %req.stop_loss,
            "stop orders replaced"
        );

        Ok(SetStopOrdersResponse {
            take_profit_id,
            stop_loss_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BacktestConfig;
    use crate::types::Kline;
    use chrono::{DateTime, TimeZone, Utc};

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

    #[test]
    fn truncation_is_toward_zero() {
        assert_eq!(truncate_quantity(dec!(0.12999), 3), dec!(0.129));
        assert_eq!(truncate_quantity(dec!(0.1), 3), dec!(0.1));
        assert_eq!(truncate_quantity(dec!(0.0004), 3), dec!(0));
    }

    #[test]
    fn minimum_unit_matches_precision() {
        assert_eq!(minimum_unit(3), dec!(0.001));
        assert_eq!(minimum_unit(0), dec!(1));
    }

    #[test]
    fn open_requires_some_sizing() {
        let exchange = BacktestExchange::new(BacktestConfig::default());
        exchange.scan(&pair(), &flat_kline(0, dec!(50000)));

        let mut req = OpenPositionRequest::market(pair(), PositionSide::Long, Decimal::ZERO);
        req.balance_percent = Decimal::ZERO;
        let err = exchange.open_position(req).unwrap_err();
        assert!(matches!(err, ExchangeError::QuantityRequired));
    }

    #[test]
    fn balance_percent_sizing_uses_leverage() {
        let exchange = BacktestExchange::new(BacktestConfig::default());
        let pair = pair();
        exchange.set_leverage(&pair, 1).unwrap();
        exchange.scan(&pair, &flat_kline(0, dec!(50000)));

        // 50% of 10_000 at 1x and price 50_000: 5_000 / 50_000 = 0.1.
        let response = exchange
            .open_position(
                OpenPositionRequest::market(pair.clone(), PositionSide::Long, Decimal::ZERO)
                    .with_balance_percent(dec!(50)),
            )
            .unwrap();
        assert_eq!(response.estimated_price, dec!(50000));
        assert_eq!(response.estimated_cost, dec!(5000));

        let order = exchange.get_order(response.order_id, None).unwrap();
        assert_eq!(order.quantity, dec!(0.1));
    }

    #[test]
    fn close_percent_falls_back_to_minimum_unit() {
        let exchange = BacktestExchange::new(BacktestConfig::default());
        let pair = pair();
        exchange.set_leverage(&pair, 1).unwrap();
        exchange.scan(&pair, &flat_kline(0, dec!(100)));

        exchange
            .open_position(OpenPositionRequest::market(
                pair.clone(),
                PositionSide::Long,
                dec!(0.01),
            ))
            .unwrap();
        exchange.scan(&pair, &flat_kline(300, dec!(100)));

        // 1% of 0.01 truncates to zero at 3 dp; the fallback requests one
        // minimum unit instead.
        let order_id = exchange
            .close_position(ClosePositionRequest::market_percent(
                pair.clone(),
                PositionSide::Long,
                dec!(1),
            ))
            .unwrap();
        let order = exchange.get_order(order_id, None).unwrap();
        assert_eq!(order.quantity, dec!(0.001));
    }

    #[test]
    fn set_stop_orders_requires_position() {
        let exchange = BacktestExchange::new(BacktestConfig::default());
        exchange.scan(&pair(), &flat_kline(0, dec!(50000)));

        let err = exchange
            .set_stop_orders(SetStopOrdersRequest {
                pair: pair(),
                position_side: PositionSide::Long,
                take_profit: dec!(51000),
                stop_loss: dec!(49000),
            })
            .unwrap_err();
        assert!(matches!(err, ExchangeError::PositionNotFound { .. }));
    }

    #[test]
    fn set_stop_orders_replaces_previous_stops() {
        let exchange = BacktestExchange::new(BacktestConfig::default());
        let pair = pair();
        exchange.set_leverage(&pair, 1).unwrap();
        exchange.scan(&pair, &flat_kline(0, dec!(50000)));

        exchange
            .open_position(OpenPositionRequest::market(
                pair.clone(),
                PositionSide::Long,
                dec!(0.1),
            ))
            .unwrap();
        exchange.scan(&pair, &flat_kline(300, dec!(50000)));

        exchange
            .set_stop_orders(SetStopOrdersRequest {
                pair: pair.clone(),
                position_side: PositionSide::Long,
                take_profit: dec!(52000),
                stop_loss: Decimal::ZERO,
            })
            .unwrap();
        exchange
            .set_stop_orders(SetStopOrdersRequest {
                pair: pair.clone(),
                position_side: PositionSide::Long,
                take_profit: dec!(53000),
                stop_loss: dec!(48000),
            })
            .unwrap();

        let stops = exchange.get_stop_orders(Some(&pair));
        assert_eq!(stops.len(), 2);
        assert!(stops.iter().any(|s| s.trigger_price == dec!(53000)));
        assert!(stops.iter().all(|s| s.trigger_price != dec!(52000)));
    }
}
